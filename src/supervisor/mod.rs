//! Supervisor: keeps one gateway worker alive.
//!
//! Picks a free port, launches `toolgate-worker`, verifies it over `/health`
//! after a grace period, and restarts it with a bounded attempt budget. After
//! the budget is spent the worker stays down until a force-fix.

pub mod actor;
pub mod health;
pub mod launcher;
pub mod logs;
pub mod paths;
pub mod ports;
pub mod state;

pub use actor::{spawn_supervisor, SupervisorConfig, SupervisorHandle};
pub use health::{HealthChecker, HttpHealthChecker, WorkerHealth};
pub use launcher::{LaunchSpec, ProcessLauncher, WorkerLauncher};
pub use logs::{LogSnapshot, WorkerLogs};
pub use paths::{resolve_config_dir, resolve_worker_command};
pub use ports::{PortProbe, TcpPortProbe};
pub use state::{StatusEvent, SupervisorSnapshot, WorkerStatus};
