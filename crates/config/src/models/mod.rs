pub mod app_config;
pub mod cache;
pub mod database;
pub mod logging;

pub use app_config::*;
pub use cache::*;
pub use database::*;
pub use logging::*;
