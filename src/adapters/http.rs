use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{PipelineError, Result};
use crate::settings::HttpSettings;

/// Fixed minimum spacing between consecutive calls, shared across threads.
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: Mutex::new(None),
        }
    }

    /// Block until the next call is allowed, then claim the slot.
    pub fn wait(&self) {
        if self.delay.is_zero() {
            return;
        }
        // a poisoned lock only means another caller panicked mid-wait
        let mut last = match self.last_call.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.delay {
                thread::sleep(self.delay - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

/// Blocking JSON client for one upstream source.
pub struct HttpFetcher {
    source_name: String,
    client: Client,
    limiter: RateLimiter,
}

impl HttpFetcher {
    pub fn new(source_name: impl Into<String>, settings: &HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(concat!("aq-fusion/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            source_name: source_name.into(),
            client,
            limiter: RateLimiter::new(Duration::from_millis(settings.request_delay_ms)),
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// GET and decode. Transport failures and non-2xx statuses are
    /// `SourceUnavailable`; an undecodable body is a `MalformedRecord`.
    pub fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        self.limiter.wait();

        let response = self
            .client
            .get(url)
            .query(query)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| PipelineError::source_unavailable(&self.source_name, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::source_unavailable(
                &self.source_name,
                format!("HTTP {}", status),
            ));
        }

        let body = response
            .text()
            .map_err(|e| PipelineError::source_unavailable(&self.source_name, e))?;

        serde_json::from_str(&body).map_err(|e| {
            PipelineError::MalformedRecord(format!("{} response: {}", self.source_name, e))
        })
    }
}
