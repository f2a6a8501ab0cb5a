//! Remote browser isolation core: browser pool, capture → encode → deliver
//! pipelines, encoder fallback, adaptive quality and the session registry.

pub mod bitstream;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod hw;
pub mod pipeline;
pub mod pool;
pub mod quality;
pub mod session;
pub mod strategy;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CoreConfig;
pub use error::{RbiError, RbiResult, StreamEndReason};
pub use session::SessionManager;
