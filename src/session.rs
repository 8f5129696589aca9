//! The snapshot session: an ordered walk through the backup protocol that always unwinds.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use uuid::Uuid;

use crate::cleanup::{CleanupCoordinator, Teardown};
use crate::error::{Result, ShadowError};
use crate::mount::{self, DeviceMapper};
use crate::output::{OutputWriter, Threshold};
use crate::service::{self, BackupState, CoordinationService, Phase};
use crate::writer::catalog::WriterMetadataCatalog;
use crate::writer::selector::should_add;
use crate::writer::Writer;

/// Session progress. Transitions only move forward; any failure lands in `Aborting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    MetadataGathered,
    SnapshotSetStarted,
    VolumeAdded,
    ComponentsAdded,
    BackupStatePrepared,
    SnapshotCreated,
    Mounted,
    CallbackInvoked,
    Unmounted,
    Completed,
    Aborting,
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    /// Existing directory to shadow.
    pub source: PathBuf,
    /// Device name the snapshot is exposed at, e.g. `Q:`.
    pub device: String,
    /// Run every phase up to PrepareForBackup and stop there.
    pub simulate: bool,
    /// Upper bound on each awaited phase. `None` waits forever.
    pub wait_timeout: Option<Duration>,
}

pub type CallbackResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub struct SnapshotSession<'a> {
    service: &'a mut dyn CoordinationService,
    mapper: &'a dyn DeviceMapper,
    out: &'a OutputWriter,
    request: &'a SnapshotRequest,
    state: SessionState,
    initialized: bool,
    snapshot_set_id: Option<Uuid>,
    snapshot_created: bool,
    mounted_device: String,
    cleanup: CleanupCoordinator,
}

impl<'a> SnapshotSession<'a> {
    pub fn new(
        service: &'a mut dyn CoordinationService,
        mapper: &'a dyn DeviceMapper,
        out: &'a OutputWriter,
        request: &'a SnapshotRequest,
    ) -> Self {
        Self {
            service,
            mapper,
            out,
            request,
            state: SessionState::Idle,
            initialized: false,
            snapshot_set_id: None,
            snapshot_created: false,
            mounted_device: String::new(),
            cleanup: CleanupCoordinator::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn snapshot_created(&self) -> bool {
        self.snapshot_created
    }

    pub fn mounted_device(&self) -> &str {
        &self.mounted_device
    }

    /// Drives the protocol, invoking `callback` while the snapshot is mounted, then cleans up.
    pub fn run<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce() -> CallbackResult,
    {
        let result = self.execute(callback);
        if result.is_err() {
            self.state = SessionState::Aborting;
        }
        self.finish(result.is_err());
        result
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(self.state < next && self.state != SessionState::Aborting);
        self.state = next;
    }

    fn execute<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnOnce() -> CallbackResult,
    {
        let timeout = self.request.wait_timeout;
        let provider_id =
            WriterMetadataCatalog::new(&mut *self.service, self.out, timeout).locate_system_provider()?;

        self.out.line("Calling InitializeForBackup");
        self.service.initialize_for_backup()?;
        self.initialized = true;

        let writers = WriterMetadataCatalog::new(&mut *self.service, self.out, timeout).gather()?;
        self.advance(SessionState::MetadataGathered);

        self.out.line("Calling StartSnapshotSet");
        self.snapshot_set_id = Some(self.service.start_snapshot_set()?);
        self.advance(SessionState::SnapshotSetStarted);

        self.out.line("Calling GetVolumePathName");
        let volume = self.mapper.volume_path_name(&self.request.source)?;

        self.out.line("Calling AddToSnapshotSet");
        let snapshot_id = self.service.add_to_snapshot_set(&volume, provider_id)?;
        self.advance(SessionState::VolumeAdded);

        self.add_components(&writers)?;
        self.advance(SessionState::ComponentsAdded);

        self.out.line("Calling SetBackupState");
        self.service.set_backup_state(BackupState::FULL)?;

        self.out.line("Calling PrepareForBackup");
        let mut op = self.service.prepare_for_backup()?;
        self.out.line("Waiting for call to PrepareForBackup to finish...");
        let status = service::await_completion(op.as_mut(), Phase::PrepareForBackup, timeout)?;
        service::check_status(Phase::PrepareForBackup, status)?;
        self.out.line("Call to PrepareForBackup finished.");
        self.advance(SessionState::BackupStatePrepared);

        if self.request.simulate {
            self.out.write_line("Simulation mode: snapshot not created.", Threshold::Normal);
            self.advance(SessionState::Completed);
            return Ok(());
        }

        self.out.line("Calling DoSnapshotSet");
        let mut op = self.service.do_snapshot_set()?;
        self.out.line("Waiting for call to DoSnapshotSet to finish...");
        let waited = service::await_completion(op.as_mut(), Phase::DoSnapshotSet, timeout);
        // Set before the status check so cleanup still deletes a half-committed set.
        self.snapshot_created = true;
        service::check_status(Phase::DoSnapshotSet, waited?)?;
        self.out.line("Call to DoSnapshotSet finished.");
        self.advance(SessionState::SnapshotCreated);

        self.out.line("Calling GetSnapshotProperties");
        let device_object = self.service.snapshot_device_object(snapshot_id)?;

        self.out.line("Calling CalculateSourcePath");
        let source = self.request.source.to_string_lossy();
        let raw_path = mount::compute_source_path(&device_object, &source, &volume);

        self.out.line("Calling DefineDosDevice to mount device.");
        mount::mount(self.mapper, &self.request.device, &raw_path)?;
        self.mounted_device = self.request.device.clone();
        self.advance(SessionState::Mounted);

        callback().map_err(ShadowError::CallbackFailed)?;
        self.advance(SessionState::CallbackInvoked);

        self.out.line("Calling DefineDosDevice to remove device.");
        if mount::unmount(self.mapper, &self.request.device, self.out) {
            self.mounted_device.clear();
        }
        self.advance(SessionState::Unmounted);

        self.out.line("Calling BackupComplete");
        let mut op = self.service.backup_complete()?;
        self.out.line("Waiting for call to BackupComplete to finish...");
        let status = service::await_completion(op.as_mut(), Phase::BackupComplete, timeout)?;
        service::check_status(Phase::BackupComplete, status)?;
        self.out.line("Call to BackupComplete finished.");
        self.advance(SessionState::Completed);
        Ok(())
    }

    fn add_components(&mut self, writers: &[Writer]) -> Result<()> {
        for writer in writers {
            self.out.line(format!("Adding components to snapshot set for writer {}", writer.name));
            for component in &writer.components {
                if should_add(component) {
                    self.out.line(format!(
                        "Adding component {} ({}) from writer {}",
                        component.name, component.logical_path, writer.name
                    ));
                    self.service.add_component(writer, component)?;
                } else {
                    self.out.line(format!(
                        "Not adding component {} from writer {}.",
                        component.name, writer.name
                    ));
                }
            }
        }
        Ok(())
    }

    /// Releases whatever the session still holds. Only the first call has any effect.
    pub fn finish(&mut self, abnormal_abort: bool) {
        if !self.initialized {
            // Nothing was ever handed to the service.
            self.cleanup.cleanup(&Teardown::default(), &mut *self.service, self.mapper, self.out);
            return;
        }
        let teardown = Teardown {
            abnormal_abort,
            snapshot_created: self.snapshot_created,
            mounted_device: self.mounted_device.clone(),
            snapshot_set_id: self.snapshot_set_id,
        };
        self.cleanup.cleanup(&teardown, &mut *self.service, self.mapper, self.out);
        self.mounted_device.clear();
        self.snapshot_created = false;
    }
}

impl Drop for SnapshotSession<'_> {
    fn drop(&mut self) {
        if !self.cleanup.is_finished() {
            self.state = SessionState::Aborting;
            self.finish(true);
        }
    }
}

/// Shadows `request.source`, exposes it at `request.device` and runs `callback` against it.
///
/// Cleanup runs on every exit path, including a panicking callback.
pub fn create_snapshot_and_run<F>(
    request: &SnapshotRequest,
    service: &mut dyn CoordinationService,
    mapper: &dyn DeviceMapper,
    out: &OutputWriter,
    callback: F,
) -> Result<()>
where
    F: FnOnce() -> CallbackResult,
{
    if !request.source.is_dir() {
        let err = ShadowError::Validation { path: request.source.clone() };
        out.write_line(err.to_string(), Threshold::UnlessSilent);
        return Err(err);
    }

    // Volume resolution and the snapshot sub-path both need the fully qualified spelling.
    let source = std::path::absolute(&request.source)
        .map_err(|_| ShadowError::Validation { path: request.source.clone() })?;
    let request = SnapshotRequest { source, ..request.clone() };

    out.write_line(
        format!(
            "Shadowing {} at {} (started {})",
            request.source.display(),
            request.device,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ),
        Threshold::Normal,
    );

    let result = SnapshotSession::new(service, mapper, out, &request).run(callback);
    match &result {
        Ok(()) => out.write_line("Shadowing successfully completed.", Threshold::Normal),
        Err(err) => out.write_line(err.to_string(), Threshold::UnlessSilent),
    }
    result
}

/// Gathers and returns the writer trees without starting a snapshot set.
pub fn list_writers(
    service: &mut dyn CoordinationService,
    out: &OutputWriter,
    wait_timeout: Option<Duration>,
) -> Result<Vec<Writer>> {
    let mut catalog = WriterMetadataCatalog::new(&mut *service, out, wait_timeout);
    catalog.locate_system_provider()?;
    drop(catalog);
    out.line("Calling InitializeForBackup");
    service.initialize_for_backup()?;
    WriterMetadataCatalog::new(service, out, wait_timeout).gather()
}
