pub mod database; // Drivers and the driver capability table
pub mod driver_broker;
pub mod query_composer;
pub mod registry;
pub mod request_handler;
pub mod result_encoder;

pub use driver_broker::*;
pub use query_composer::*;
pub use registry::*;
pub use request_handler::*;
pub use result_encoder::*;
