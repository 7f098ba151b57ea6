//! # Utility Modules
//!
//! Supporting utilities shared by the protocol and transport layers.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Timeout**: Default durations and async timeout wrappers

pub mod logging;
pub mod timeout;

pub use logging::init_logging;
