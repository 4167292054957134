//! # Capture Service
//!
//! Turns a capture request into PNG and WebP images at 1x and 2x, either by
//! running an allow-listed command and rendering its terminal output, or by
//! loading an allow-listed web page in headless Chrome.
//!
//! The pipeline is protected by three primitives:
//!
//! - **Rate limiter**: per-client fixed-window admission control
//! - **Circuit breakers**: one per capture mode, so a failing mode cannot
//!   starve the other
//! - **Sandboxed executor**: allowlist and metacharacter checks, no shell,
//!   bounded time and output
//!
//! Web targets additionally pass an SSRF guard that rejects private,
//! loopback, link-local and cloud metadata addresses both before navigation
//! and after any redirect.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_service::{CaptureOrchestrator, CaptureRequestBody, CaptureResult, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.command.allowed_prefixes.push("cargo".to_string());
//!     let orchestrator = CaptureOrchestrator::new(config)?;
//!
//!     let body: CaptureRequestBody = serde_json::from_str(
//!         r#"{"name":"cargo-help","config":{"type":"cli","command":"cargo --help"}}"#,
//!     )?;
//!     if let CaptureResult::Success(output) = orchestrator.handle(body, "local").await {
//!         println!("Captured {}", output.primary_path.display());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! capture-service --allow-domain example.com serve --port 8080
//! capture-service --allow-domain example.com web --name home --url https://example.com
//! capture-service --allow-command cargo cli --name help cargo --help
//! ```

/// Configuration and settings for the capture service
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Injectable time source
pub mod clock;

/// Per-client admission control
pub mod rate_limiter;

/// Per-mode fault isolation
pub mod circuit_breaker;

/// Sandboxed execution of allow-listed commands
pub mod command_executor;

/// SSRF validation of web targets
pub mod url_guard;

/// ANSI output to HTML terminal rendering
pub mod terminal;

/// Headless Chrome capture backend
pub mod browser;

/// PNG and WebP output at 1x and 2x
pub mod encoder;

/// Request and response types
pub mod request;

/// Capture pipeline orchestration
pub mod orchestrator;

/// HTTP API
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Prometheus metrics
pub mod metrics;

/// Health reporting
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use browser::*;
pub use circuit_breaker::*;
pub use cli::*;
pub use clock::*;
pub use command_executor::*;
pub use config::*;
pub use encoder::*;
pub use error::*;
pub use health::*;
pub use self::metrics::*;
pub use orchestrator::*;
pub use rate_limiter::*;
pub use request::*;
pub use server::*;
pub use terminal::*;
pub use url_guard::*;
pub use utils::*;
