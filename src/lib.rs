pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use auth::{AuthStore, Session};
pub use client::{ApiClient, ApiResponse, RequestContext};
pub use config::Config;
pub use error::{ClientError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
