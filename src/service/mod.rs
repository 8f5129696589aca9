use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::{AsyncFailure, Result, ShadowError};
use crate::writer::{Component, ComponentType, Writer};

#[cfg(test)]
pub mod fake;
#[cfg(windows)]
pub mod vss;

pub const VSS_S_ASYNC_PENDING: i32 = 0x0004_2309;
pub const VSS_S_ASYNC_FINISHED: i32 = 0x0004_230A;
pub const VSS_S_ASYNC_CANCELLED: i32 = 0x0004_230B;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Phases the service runs in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    GatherWriterMetadata,
    PrepareForBackup,
    DoSnapshotSet,
    BackupComplete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::GatherWriterMetadata => "GatherWriterMetadata",
            Phase::PrepareForBackup => "PrepareForBackup",
            Phase::DoSnapshotSet => "DoSnapshotSet",
            Phase::BackupComplete => "BackupComplete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncStatus {
    Pending,
    Finished,
    Cancelled,
    Failed(i32),
}

impl AsyncStatus {
    pub fn from_hresult(hr: i32) -> Self {
        match hr {
            VSS_S_ASYNC_PENDING => AsyncStatus::Pending,
            VSS_S_ASYNC_FINISHED => AsyncStatus::Finished,
            VSS_S_ASYNC_CANCELLED => AsyncStatus::Cancelled,
            other => AsyncStatus::Failed(other),
        }
    }

    pub fn hresult(self) -> i32 {
        match self {
            AsyncStatus::Pending => VSS_S_ASYNC_PENDING,
            AsyncStatus::Finished => VSS_S_ASYNC_FINISHED,
            AsyncStatus::Cancelled => VSS_S_ASYNC_CANCELLED,
            AsyncStatus::Failed(hr) => hr,
        }
    }
}

/// Handle to an operation the service completes in the background.
pub trait AsyncOperation {
    /// Blocks until the operation leaves the pending state.
    fn wait(&mut self) -> Result<()>;
    fn query_status(&mut self) -> Result<AsyncStatus>;
    fn cancel(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
}

/// Arguments to SetBackupState.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupState {
    pub select_components: bool,
    pub bootable_system_state: bool,
    pub backup_type: BackupType,
    pub partial_file_support: bool,
}

impl BackupState {
    pub const FULL: BackupState = BackupState {
        select_components: true,
        bootable_system_state: false,
        backup_type: BackupType::Full,
        partial_file_support: false,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: String,
    pub filespec: String,
}

#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub name: String,
    pub logical_path: String,
    pub component_type: ComponentType,
    pub selectable: bool,
    pub files: Vec<FileDescriptor>,
    pub databases: Vec<FileDescriptor>,
    pub log_files: Vec<FileDescriptor>,
}

/// Raw metadata for one writer, before the component tree is built.
#[derive(Debug, Clone)]
pub struct WriterMetadata {
    pub instance_id: Uuid,
    pub writer_id: Uuid,
    pub name: String,
    pub components: Vec<ComponentInfo>,
}

/// The platform's snapshot coordination service, one backup session per value.
pub trait CoordinationService {
    /// Id of the provider registered as the system provider, if any.
    fn system_provider_id(&mut self) -> Result<Option<Uuid>>;
    fn initialize_for_backup(&mut self) -> Result<()>;
    fn gather_writer_metadata(&mut self) -> Result<Box<dyn AsyncOperation>>;
    fn writer_count(&mut self) -> Result<usize>;
    fn writer_metadata(&mut self, index: usize) -> Result<WriterMetadata>;
    fn start_snapshot_set(&mut self) -> Result<Uuid>;
    fn add_to_snapshot_set(&mut self, volume: &str, provider_id: Uuid) -> Result<Uuid>;
    fn add_component(&mut self, writer: &Writer, component: &Component) -> Result<()>;
    fn set_backup_state(&mut self, state: BackupState) -> Result<()>;
    fn prepare_for_backup(&mut self) -> Result<Box<dyn AsyncOperation>>;
    fn do_snapshot_set(&mut self) -> Result<Box<dyn AsyncOperation>>;
    /// Device object path of a committed snapshot, e.g. `\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy1`.
    fn snapshot_device_object(&mut self, snapshot_id: Uuid) -> Result<String>;
    fn backup_complete(&mut self) -> Result<Box<dyn AsyncOperation>>;
    fn abort_backup(&mut self) -> Result<()>;
    fn delete_snapshot_set(&mut self, snapshot_set_id: Uuid) -> Result<()>;
}

/// Blocks until `op` completes and returns its final status.
///
/// Without a timeout this defers to the operation's own wait. With one, the status is polled
/// and the operation is cancelled once the deadline passes.
pub fn await_completion(
    op: &mut dyn AsyncOperation,
    phase: Phase,
    timeout: Option<Duration>,
) -> Result<AsyncStatus> {
    // A limit too large to represent as a deadline is the same as no limit.
    let Some((limit, deadline)) = timeout.and_then(|limit| Some((limit, Instant::now().checked_add(limit)?)))
    else {
        op.wait()?;
        return op.query_status();
    };

    loop {
        let status = op.query_status()?;
        if status != AsyncStatus::Pending {
            return Ok(status);
        }
        let now = Instant::now();
        if now >= deadline {
            let _ = op.cancel();
            return Err(ShadowError::AsyncOperationFailed {
                phase,
                cause: AsyncFailure::TimedOut(limit),
            });
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// Turns a final status into a session error unless it is `Finished`.
pub fn check_status(phase: Phase, status: AsyncStatus) -> Result<()> {
    match status {
        AsyncStatus::Finished => Ok(()),
        AsyncStatus::Cancelled if phase == Phase::GatherWriterMetadata => {
            Err(ShadowError::MetadataGatherCancelled)
        }
        other => Err(ShadowError::AsyncOperationFailed {
            phase,
            cause: AsyncFailure::Status(other.hresult()),
        }),
    }
}
