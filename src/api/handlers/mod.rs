pub mod muster;

pub use muster::AppState;
