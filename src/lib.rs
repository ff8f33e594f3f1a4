//! Workpush: self-hosted WeCom notification relay.
//!
//! Stores tenant credentials encrypted at rest, exposes a per-configuration
//! notify endpoint keyed by an opaque code, and terminates the WeCom
//! callback protocol (URL verification and encrypted message delivery).

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod service;
pub mod web;
pub mod wecom;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
