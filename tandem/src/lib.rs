//! tandem library crate.
//!
//! A download daemon that shares transfer progress with any number of
//! WebSocket subscribers and merges paired video and audio streams.

pub mod api;
pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod extension;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod services;
pub mod transfer;
pub mod utils;

pub use error::{Error, Result};
