//! In-memory coordination service and device mapper that record every call.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use uuid::Uuid;

use super::{AsyncOperation, AsyncStatus, BackupState, CoordinationService, Phase, WriterMetadata};
use crate::error::{Result, ShadowError};
use crate::mount::DeviceMapper;
use crate::writer::{Component, Writer};

pub const SNAPSHOT_SET_ID: Uuid = Uuid::from_u128(0x5e7);
pub const SNAPSHOT_ID: Uuid = Uuid::from_u128(0x5a9);
pub const PROVIDER_ID: Uuid = Uuid::from_u128(0xb5946137);
pub const DEVICE_OBJECT: &str = r"\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy9";
pub const FAILURE_CODE: i32 = 0x8004_2306_u32 as i32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SystemProviderId,
    InitializeForBackup,
    GatherWriterMetadata,
    StartSnapshotSet,
    VolumePathName,
    AddToSnapshotSet(String),
    AddComponent(String),
    SetBackupState(BackupState),
    PrepareForBackup,
    DoSnapshotSet,
    SnapshotDeviceObject,
    Define(String, String),
    Callback,
    Remove(String),
    BackupComplete,
    AbortBackup,
    DeleteSnapshotSet(Uuid),
}

impl Call {
    fn name(&self) -> &'static str {
        match self {
            Call::SystemProviderId => "SystemProviderId",
            Call::InitializeForBackup => "InitializeForBackup",
            Call::GatherWriterMetadata => "GatherWriterMetadata",
            Call::StartSnapshotSet => "StartSnapshotSet",
            Call::VolumePathName => "VolumePathName",
            Call::AddToSnapshotSet(_) => "AddToSnapshotSet",
            Call::AddComponent(_) => "AddComponent",
            Call::SetBackupState(_) => "SetBackupState",
            Call::PrepareForBackup => "PrepareForBackup",
            Call::DoSnapshotSet => "DoSnapshotSet",
            Call::SnapshotDeviceObject => "SnapshotDeviceObject",
            Call::Define(..) => "Define",
            Call::Callback => "Callback",
            Call::Remove(_) => "Remove",
            Call::BackupComplete => "BackupComplete",
            Call::AbortBackup => "AbortBackup",
            Call::DeleteSnapshotSet(_) => "DeleteSnapshotSet",
        }
    }
}

struct State {
    calls: Vec<Call>,
    failing: HashSet<&'static str>,
    statuses: HashMap<Phase, AsyncStatus>,
    provider: Option<Uuid>,
    writers: Vec<WriterMetadata>,
}

/// Shared view of what the fakes did, plus knobs to make them misbehave.
#[derive(Clone)]
pub struct FakeLog(Rc<RefCell<State>>);

impl FakeLog {
    pub fn calls(&self) -> Vec<Call> {
        self.0.borrow().calls.clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.0.borrow().calls.iter().map(Call::name).collect()
    }

    pub fn record(&self, call: Call) {
        self.0.borrow_mut().calls.push(call);
    }

    pub fn fail_on(&self, name: &'static str) {
        self.0.borrow_mut().failing.insert(name);
    }

    pub fn set_status(&self, phase: Phase, status: AsyncStatus) {
        self.0.borrow_mut().statuses.insert(phase, status);
    }

    pub fn set_provider(&self, provider: Option<Uuid>) {
        self.0.borrow_mut().provider = provider;
    }

    pub fn set_writers(&self, writers: Vec<WriterMetadata>) {
        self.0.borrow_mut().writers = writers;
    }

    /// Records the call and reports whether it was told to fail.
    fn enter(&self, call: Call) -> bool {
        let name = call.name();
        let mut state = self.0.borrow_mut();
        state.calls.push(call);
        state.failing.contains(name)
    }

    fn checked(&self, call: Call) -> Result<()> {
        let name = call.name();
        if self.enter(call) {
            Err(ShadowError::platform(name, FAILURE_CODE))
        } else {
            Ok(())
        }
    }

    fn operation(&self, call: Call, phase: Phase) -> Result<Box<dyn AsyncOperation>> {
        self.checked(call)?;
        let status = self.0.borrow().statuses.get(&phase).copied().unwrap_or(AsyncStatus::Finished);
        Ok(Box::new(FakeOperation { status }))
    }
}

struct FakeOperation {
    status: AsyncStatus,
}

impl AsyncOperation for FakeOperation {
    fn wait(&mut self) -> Result<()> {
        Ok(())
    }

    fn query_status(&mut self) -> Result<AsyncStatus> {
        Ok(self.status)
    }

    fn cancel(&mut self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeService {
    log: FakeLog,
}

pub struct FakeMapper {
    log: FakeLog,
}

impl FakeService {
    pub fn new() -> (FakeService, FakeMapper, FakeLog) {
        let log = FakeLog(Rc::new(RefCell::new(State {
            calls: Vec::new(),
            failing: HashSet::new(),
            statuses: HashMap::new(),
            provider: Some(PROVIDER_ID),
            writers: Vec::new(),
        })));
        (FakeService { log: log.clone() }, FakeMapper { log: log.clone() }, log)
    }
}

impl CoordinationService for FakeService {
    fn system_provider_id(&mut self) -> Result<Option<Uuid>> {
        self.log.checked(Call::SystemProviderId)?;
        Ok(self.log.0.borrow().provider)
    }

    fn initialize_for_backup(&mut self) -> Result<()> {
        self.log.checked(Call::InitializeForBackup)
    }

    fn gather_writer_metadata(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.log.operation(Call::GatherWriterMetadata, Phase::GatherWriterMetadata)
    }

    fn writer_count(&mut self) -> Result<usize> {
        Ok(self.log.0.borrow().writers.len())
    }

    fn writer_metadata(&mut self, index: usize) -> Result<WriterMetadata> {
        self.log
            .0
            .borrow()
            .writers
            .get(index)
            .cloned()
            .ok_or(ShadowError::platform("GetWriterMetadata", FAILURE_CODE))
    }

    fn start_snapshot_set(&mut self) -> Result<Uuid> {
        self.log.checked(Call::StartSnapshotSet)?;
        Ok(SNAPSHOT_SET_ID)
    }

    fn add_to_snapshot_set(&mut self, volume: &str, _provider_id: Uuid) -> Result<Uuid> {
        self.log.checked(Call::AddToSnapshotSet(volume.to_string()))?;
        Ok(SNAPSHOT_ID)
    }

    fn add_component(&mut self, _writer: &Writer, component: &Component) -> Result<()> {
        self.log.checked(Call::AddComponent(component.logical_path.clone()))
    }

    fn set_backup_state(&mut self, state: BackupState) -> Result<()> {
        self.log.checked(Call::SetBackupState(state))
    }

    fn prepare_for_backup(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.log.operation(Call::PrepareForBackup, Phase::PrepareForBackup)
    }

    fn do_snapshot_set(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.log.operation(Call::DoSnapshotSet, Phase::DoSnapshotSet)
    }

    fn snapshot_device_object(&mut self, _snapshot_id: Uuid) -> Result<String> {
        self.log.checked(Call::SnapshotDeviceObject)?;
        Ok(DEVICE_OBJECT.to_string())
    }

    fn backup_complete(&mut self) -> Result<Box<dyn AsyncOperation>> {
        self.log.operation(Call::BackupComplete, Phase::BackupComplete)
    }

    fn abort_backup(&mut self) -> Result<()> {
        self.log.checked(Call::AbortBackup)
    }

    fn delete_snapshot_set(&mut self, snapshot_set_id: Uuid) -> Result<()> {
        self.log.checked(Call::DeleteSnapshotSet(snapshot_set_id))
    }
}

impl DeviceMapper for FakeMapper {
    fn volume_path_name(&self, path: &Path) -> Result<String> {
        self.log.checked(Call::VolumePathName)?;
        let root = path.ancestors().last().unwrap_or(path);
        Ok(root.to_string_lossy().into_owned())
    }

    fn define(&self, device: &str, target: &str) -> std::result::Result<(), u32> {
        if self.log.enter(Call::Define(device.to_string(), target.to_string())) { Err(5) } else { Ok(()) }
    }

    fn remove(&self, device: &str) -> std::result::Result<(), u32> {
        if self.log.enter(Call::Remove(device.to_string())) { Err(5) } else { Ok(()) }
    }
}
