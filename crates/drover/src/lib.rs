//! # drover
//!
//! Process supervisor library for small containers and init-like daemons.
//!
//! Load program definitions from a directory of TOML files, launch them in
//! dependency order, restart them with exponential backoff, and capture their
//! output to rotated log files.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use drover::{Supervisor, SupervisorConfig};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (sup, monitor) = Supervisor::new(SupervisorConfig::default());
//! tokio::spawn(monitor.run());
//!
//! sup.load_configuration("/etc/corral/programs".as_ref()).await.unwrap();
//! let failures = sup.start_all().await;
//! for (name, err) in &failures {
//!     eprintln!("{}: {}", name, err);
//! }
//!
//! sup.shutdown_all(None).await;
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod logs;
pub mod monitor;
pub mod output;
pub mod supervisor;
pub mod types;

pub use backoff::RestartSettings;
pub use config::Defaults;
pub use error::SupervisorError;
pub use monitor::Monitor;
pub use output::{LogRotation, OutputCapture};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use types::*;
