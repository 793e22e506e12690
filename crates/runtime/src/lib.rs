//! Process supervisor for the outreach fleet: brings executors online,
//! starts the background schedulers, and runs the inbound-message loop
//! until asked to shut down.

mod supervisor;

pub use supervisor::{Supervisor, SupervisorError, UpdateSource};
