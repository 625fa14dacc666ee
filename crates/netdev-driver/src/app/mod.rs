//! Application module
//!
//! Wiring of the daemon: the builder assembles services from [`DaemonArgs`](crate::config::DaemonArgs),
//! [`Application`] runs them as supervised tasks until a shutdown signal.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use core::Application;
pub use services::ApplicationServices;
