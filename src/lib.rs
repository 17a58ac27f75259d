pub mod adapters;
pub mod analyzers;
pub mod cli;
pub mod error;
pub mod models;
pub mod processors;
pub mod settings;
pub mod storage;
pub mod utils;
pub mod writers;

pub use error::{PipelineError, Result};
