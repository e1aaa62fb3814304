pub mod app;
pub mod logging;

pub use app::{Application, HealthReport};
pub use logging::init_logging;
