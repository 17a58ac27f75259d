use crossbeam::channel;
use std::thread;

use crate::error::{PipelineError, Result};
use crate::utils::progress::ProgressReporter;

/// One item's result; a failure here never affects the other items.
#[derive(Debug)]
pub struct TaskOutcome<T, R> {
    pub item: T,
    pub result: Result<R>,
}

/// Bounded worker pool fed over a channel.
///
/// Every worker builds its own state (typically a storage connection) with
/// `init` before taking items, so nothing stateful is shared across threads.
pub struct TaskRunner {
    max_workers: usize,
}

impl TaskRunner {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `work` over all items. Outcomes come back in input order.
    pub fn run<T, S, R, I, F>(
        &self,
        items: Vec<T>,
        init: I,
        work: F,
        progress: Option<&ProgressReporter>,
    ) -> Vec<TaskOutcome<T, R>>
    where
        T: Send,
        R: Send,
        I: Fn() -> Result<S> + Sync,
        F: Fn(&mut S, &T) -> Result<R> + Sync,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let (job_tx, job_rx) = channel::unbounded::<(usize, T)>();
        let (done_tx, done_rx) = channel::unbounded::<(usize, TaskOutcome<T, R>)>();

        for job in items.into_iter().enumerate() {
            // receiver is alive until the scope below ends
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let workers = self.max_workers.min(total);
        let init = &init;
        let work = &work;

        thread::scope(|scope| {
            for worker in 0..workers {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();

                scope.spawn(move || {
                    let mut state = match init() {
                        Ok(state) => Some(state),
                        Err(e) => {
                            tracing::error!(worker, error = %e, "Worker setup failed");
                            None
                        }
                    };

                    for (index, item) in job_rx.iter() {
                        let result = match state.as_mut() {
                            Some(state) => work(state, &item),
                            None => Err(PipelineError::WorkerPool(format!(
                                "worker {} has no connection",
                                worker
                            ))),
                        };

                        if let Err(e) = &result {
                            tracing::debug!(worker, index, error = %e, "Task failed");
                        }
                        if let Some(p) = progress {
                            p.increment(1);
                        }
                        let _ = done_tx.send((index, TaskOutcome { item, result }));
                    }
                });
            }
        });
        drop(done_tx);

        let mut outcomes: Vec<(usize, TaskOutcome<T, R>)> = done_rx.iter().collect();
        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}
