//! shadowspawn: run work against a consistent shadow copy of a live volume.
//!
//! A session gathers writer metadata, picks the components that must be part of the
//! snapshot, creates the snapshot, exposes it under a device name for the duration of a
//! callback and then unwinds everything it allocated.

pub mod cleanup;
pub mod error;
pub mod mount;
pub mod output;
pub mod service;
pub mod session;
pub mod writer;

pub use error::{Result, ShadowError, status_code};
pub use output::{LogSink, OutputWriter, Threshold, Verbosity};
pub use session::{CallbackResult, SessionState, SnapshotRequest, create_snapshot_and_run, list_writers};

/// The coordination service and device mapper for the current platform.
pub fn platform() -> Result<(Box<dyn service::CoordinationService>, Box<dyn mount::DeviceMapper>)> {
    #[cfg(windows)]
    {
        let service: Box<dyn service::CoordinationService> = Box::new(service::vss::VssBackupService::new()?);
        let mapper: Box<dyn mount::DeviceMapper> = Box::new(mount::DosDeviceMapper);
        Ok((service, mapper))
    }
    #[cfg(not(windows))]
    {
        Err(ShadowError::Unsupported("Volume shadow copy"))
    }
}
