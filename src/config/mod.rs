//! Configuration loading and validation.

pub mod loader;
pub mod model;
pub mod validation;

pub use model::AppConfig;
