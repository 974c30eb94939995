//! Runtime wiring for the `leadline` binary: configuration and the outbound
//! stage-change notifier.

pub mod config;
pub mod notify;

pub use config::ServerConfig;
pub use notify::Notifier;
