// Daemon building blocks, exposed as a library so integration tests can
// bind ephemeral instances.
pub mod config;
pub mod gateway;
pub mod observability;
pub mod server;

pub use config::{Cli, DaemonConfig};
pub use server::Daemon;
