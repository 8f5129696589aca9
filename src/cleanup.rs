use uuid::Uuid;

use crate::mount::{self, DeviceMapper};
use crate::output::{OutputWriter, Threshold};
use crate::service::CoordinationService;

/// Resources a session may be holding when it unwinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    pub abnormal_abort: bool,
    pub snapshot_created: bool,
    /// Empty when nothing is mounted.
    pub mounted_device: String,
    pub snapshot_set_id: Option<Uuid>,
}

/// Runs the rollback steps once per session. Later calls do nothing.
#[derive(Debug, Default)]
pub struct CleanupCoordinator {
    finished: bool,
}

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Abort, then unmount, then delete. Every step is best-effort and none stops the next.
    pub fn cleanup(
        &mut self,
        teardown: &Teardown,
        service: &mut dyn CoordinationService,
        mapper: &dyn DeviceMapper,
        out: &OutputWriter,
    ) {
        if self.finished {
            return;
        }
        self.finished = true;

        if teardown.abnormal_abort {
            out.write_line("Aborting backup.", Threshold::Normal);
            if let Err(err) = service.abort_backup() {
                out.write_line(format!("AbortBackup failed during cleanup: {}", err), Threshold::UnlessSilent);
            }
        }

        if !teardown.mounted_device.is_empty() {
            if teardown.abnormal_abort {
                out.write_line(format!("Dismounting device: {}", teardown.mounted_device), Threshold::Normal);
            }
            mount::unmount(mapper, &teardown.mounted_device, out);
        }

        if teardown.snapshot_created {
            if teardown.abnormal_abort {
                out.write_line("Deleting snapshot.", Threshold::Normal);
            }
            if let Some(id) = teardown.snapshot_set_id {
                if let Err(err) = service.delete_snapshot_set(id) {
                    out.write_line(format!("DeleteSnapshots failed during cleanup: {}", err), Threshold::UnlessSilent);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fake::{Call, FakeService};

    fn created_and_mounted() -> Teardown {
        Teardown {
            abnormal_abort: true,
            snapshot_created: true,
            mounted_device: "Q:".into(),
            snapshot_set_id: Some(Uuid::from_u128(7)),
        }
    }

    #[test]
    fn test_full_unwind_order() {
        let (mut service, mapper, log) = FakeService::new();
        let mut coordinator = CleanupCoordinator::new();
        coordinator.cleanup(&created_and_mounted(), &mut service, &mapper, &OutputWriter::discard());
        assert_eq!(
            log.calls(),
            vec![Call::AbortBackup, Call::Remove("Q:".into()), Call::DeleteSnapshotSet(Uuid::from_u128(7))]
        );
    }

    #[test]
    fn test_second_call_has_no_effect() {
        let (mut service, mapper, log) = FakeService::new();
        let mut coordinator = CleanupCoordinator::new();
        let teardown = created_and_mounted();
        coordinator.cleanup(&teardown, &mut service, &mapper, &OutputWriter::discard());
        let after_first = log.calls();
        coordinator.cleanup(&teardown, &mut service, &mapper, &OutputWriter::discard());
        assert_eq!(log.calls(), after_first);
        assert!(coordinator.is_finished());
    }

    #[test]
    fn test_nothing_allocated_is_a_no_op() {
        let (mut service, mapper, log) = FakeService::new();
        let mut coordinator = CleanupCoordinator::new();
        coordinator.cleanup(&Teardown::default(), &mut service, &mapper, &OutputWriter::discard());
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_failed_steps_do_not_stop_later_ones() {
        let (mut service, mapper, log) = FakeService::new();
        log.fail_on("AbortBackup");
        log.fail_on("Remove");
        let mut coordinator = CleanupCoordinator::new();
        coordinator.cleanup(&created_and_mounted(), &mut service, &mapper, &OutputWriter::discard());
        assert!(log.calls().contains(&Call::DeleteSnapshotSet(Uuid::from_u128(7))));
    }
}
