pub mod duration_format;
pub mod loader;
pub mod models;
pub mod validation;

pub use loader::load_service_config;
pub use models::*;
pub use validation::{EndpointValidator, ValidationError, ValidationResult};
