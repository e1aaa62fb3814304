pub mod entities;
pub mod repositories;
pub mod value_objects;
pub mod verification;

pub use checkin_errors::{CheckinError, CheckinResult, ErrorKind};
pub use entities::*;
pub use repositories::*;
pub use value_objects::*;
pub use verification::*;
