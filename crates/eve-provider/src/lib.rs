//! Rate limiter (C2), HTTP/2 provider client (C3), and per-operation health
//! tracking for Eve's compute engine.

pub mod client;
pub mod error;
pub mod health;
pub mod rate_limiter;

pub use client::{AnalyzeResponse, EmbeddingResult, GenerationConfig, ProviderClient};
pub use error::ProviderError;
pub use health::{HealthTracker, OperationHealthEntry, OperationStatus};
pub use rate_limiter::RateLimiter;
