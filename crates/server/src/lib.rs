//! Composition root for the courier delivery daemon.

pub mod app;
pub mod config;

pub use app::Courier;
pub use config::ServerConfig;
