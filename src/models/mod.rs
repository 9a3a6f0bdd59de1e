pub mod definition;
pub mod query;
pub mod request;

pub use definition::*;
pub use query::*;
pub use request::*;
