//! Triggers that start backup cycles: a periodic timer and process shutdown.

pub mod scheduler;
pub mod shutdown;

pub use scheduler::BackupScheduler;
pub use shutdown::ShutdownCoordinator;
