//! Core domain + application logic for the adwatch channel monitor.
//!
//! This crate is intentionally framework-agnostic. Telegram / the LLM provider
//! live behind ports (traits) implemented in adapter crates.

pub mod alerts;
pub mod config;
pub mod domain;
pub mod errors;
pub mod forwarder;
pub mod gateway;
pub mod logging;
pub mod matching;
pub mod model;
pub mod monitor;
pub mod pipeline;
pub mod ports;
pub mod quota;
pub mod store;
pub mod topics;
pub mod util;
pub mod validator;

pub use errors::{Error, Result};
