pub mod api;
pub mod config;
pub mod models;
pub mod services;
pub mod validation;

pub use models::*;
pub use services::*;
pub use validation::*;
