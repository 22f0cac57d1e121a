pub mod config;
mod interpolation;
pub mod metrics_defs;
pub mod resolver;

pub use interpolation::InterpolationError;
pub use resolver::{ResolverError, ServiceCallResolver};
