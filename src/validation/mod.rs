pub mod request_validator;
pub mod sql_validator;

pub use request_validator::*;
pub use sql_validator::*;
