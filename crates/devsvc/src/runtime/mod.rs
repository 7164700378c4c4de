//! Runtime components for process supervision

pub mod pidfile;
pub mod process;
pub mod readiness;
pub mod supervisor;

pub use pidfile::*;
pub use process::*;
pub use readiness::*;
pub use supervisor::*;
