pub mod build;
pub mod config;
pub mod db;
pub mod deploy;
pub mod error;
pub mod leases;
pub mod logging;
pub mod models;
#[cfg(feature = "nats")]
pub mod nats;
pub mod sequencer;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod test_support;
pub mod upload;
pub mod versions;
pub mod worker;

pub use error::{VersionError, VersionResult};
pub use models::{BuildStatus, DeployStatus, ProjectRef, ProjectVersion};
pub use upload::Source;
pub use versions::{CreateOptions, DownloadRequest, VersionService};
