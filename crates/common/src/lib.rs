pub mod error;
pub mod log;
pub mod project;

pub use error::{Error, Result};
pub use log::LogEntry;
pub use project::{ContainerBinding, DeploymentStatus, ProjectRecord, ProjectUpdate};
