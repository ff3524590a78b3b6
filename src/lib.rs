pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{builtin, catalog, discovery, dispatch, loading, orchestrator, usage};
pub use domain::types;
pub use infrastructure::{model, provider};
