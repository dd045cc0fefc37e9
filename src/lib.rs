// Nursery portal client - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod transport;

pub use error::ApiError;
pub use http_client::{ApiClient, ApiRequest};
