//! Control channel for a supervisor daemon: where its socket and PID file
//! live, a newline-delimited JSON server over a Unix socket, and the
//! blocking client the CLI uses to talk to it.

pub mod client;
pub mod daemon;
pub mod paths;
pub mod server;

pub use client::{ClientError, DaemonClient};
pub use daemon::Daemon;
pub use paths::DaemonPaths;
