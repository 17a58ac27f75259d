pub mod constants;
pub mod coordinates;
pub mod filename;
pub mod logging;
pub mod progress;

pub use constants::*;
pub use coordinates::{validate_coordinates, BoundingBox};
pub use filename::generate_default_export_filename;
pub use logging::init_logging;
pub use progress::ProgressReporter;
