pub mod custom_rfc3339;
mod plan;

pub use plan::*;
