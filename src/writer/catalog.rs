use std::time::Duration;

use uuid::Uuid;

use super::{Component, Writer, compute_component_tree};
use crate::error::{Result, ShadowError};
use crate::output::OutputWriter;
use crate::service::{self, ComponentInfo, CoordinationService, FileDescriptor, Phase};

/// Collects the writers registered with the coordination service.
pub struct WriterMetadataCatalog<'a> {
    service: &'a mut dyn CoordinationService,
    out: &'a OutputWriter,
    wait_timeout: Option<Duration>,
}

impl<'a> WriterMetadataCatalog<'a> {
    pub fn new(
        service: &'a mut dyn CoordinationService,
        out: &'a OutputWriter,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self { service, out, wait_timeout }
    }

    /// Id of the system snapshot provider; fails when none is registered.
    pub fn locate_system_provider(&mut self) -> Result<Uuid> {
        self.out.line("Looking for the system VSS provider");
        match self.service.system_provider_id()? {
            Some(id) => {
                self.out.line(format!("Found system provider {}", id));
                Ok(id)
            }
            None => Err(ShadowError::ProviderNotFound),
        }
    }

    /// Gathers metadata for every writer and builds each writer's component tree.
    pub fn gather(&mut self) -> Result<Vec<Writer>> {
        self.out.line("Calling GatherWriterMetadata");
        let mut op = self.service.gather_writer_metadata()?;
        self.out.line("Waiting for call to GatherWriterMetadata to finish...");
        let status = service::await_completion(op.as_mut(), Phase::GatherWriterMetadata, self.wait_timeout)?;
        service::check_status(Phase::GatherWriterMetadata, status)?;
        self.out.line("Call to GatherWriterMetadata finished.");

        let count = self.service.writer_count()?;
        let mut writers = Vec::with_capacity(count);
        for index in 0..count {
            let metadata = self.service.writer_metadata(index)?;
            self.out.line(format!("Writer {} named {}", index, metadata.name));
            self.out.line(format!("Writer has {} components", metadata.components.len()));

            for (i, info) in metadata.components.iter().enumerate() {
                self.describe(i, info);
            }

            let mut writer = Writer {
                instance_id: metadata.instance_id,
                writer_id: metadata.writer_id,
                name: metadata.name,
                components: metadata
                    .components
                    .into_iter()
                    .map(|info| {
                        Component::new(info.name, info.logical_path, info.component_type, info.selectable, index)
                    })
                    .collect(),
            };
            compute_component_tree(&mut writer);

            for (i, component) in writer.components.iter().enumerate() {
                self.out.line(format!(
                    "Component {} has name {}, path {}, is {}selectable for backup, and has parent {}",
                    i,
                    component.name,
                    component.logical_path,
                    if component.selectable_for_backup { "" } else { "not " },
                    writer.parent_of(i).map(|p| p.name.as_str()).unwrap_or("(no parent)"),
                ));
            }
            writers.push(writer);
        }
        Ok(writers)
    }

    fn describe(&self, index: usize, info: &ComponentInfo) {
        self.out.line(format!(
            "Component {} is named {}, has a path of {}, and is {}selectable for backup. {} files, {} databases, {} log files.",
            index,
            info.name,
            info.logical_path,
            if info.selectable { "" } else { "not " },
            info.files.len(),
            info.databases.len(),
            info.log_files.len(),
        ));
        let groups: [(&str, &[FileDescriptor]); 3] = [
            ("File", info.files.as_slice()),
            ("Database file", info.databases.as_slice()),
            ("Database log file", info.log_files.as_slice()),
        ];
        for (label, descriptors) in groups {
            for (i, d) in descriptors.iter().enumerate() {
                self.out.line(format!("{} {} has path {}\\{}", label, i, d.path, d.filespec));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fake::FakeService;
    use crate::service::{AsyncStatus, WriterMetadata};
    use crate::writer::ComponentType;

    fn info(name: &str, path: &str, selectable: bool) -> ComponentInfo {
        ComponentInfo {
            name: name.into(),
            logical_path: path.into(),
            component_type: ComponentType::Database,
            selectable,
            files: vec![FileDescriptor { path: r"D:\Data".into(), filespec: "*.mdf".into() }],
            databases: Vec::new(),
            log_files: Vec::new(),
        }
    }

    #[test]
    fn test_gather_builds_trees_per_writer() {
        let (mut service, _mapper, log) = FakeService::new();
        log.set_writers(vec![
            WriterMetadata {
                instance_id: Uuid::from_u128(1),
                writer_id: Uuid::from_u128(2),
                name: "SqlServerWriter".into(),
                components: vec![info("I1", r"\DB\I1", true), info("T1", r"\DB\I1\T1", false)],
            },
            WriterMetadata {
                instance_id: Uuid::from_u128(3),
                writer_id: Uuid::from_u128(4),
                name: "Registry Writer".into(),
                components: vec![info("Registry", "", false)],
            },
        ]);
        let out = OutputWriter::discard();
        let writers = WriterMetadataCatalog::new(&mut service, &out, None).gather().unwrap();
        assert_eq!(writers.len(), 2);
        assert_eq!(writers[0].components[1].parent, Some(0));
        assert!(writers[0].components[1].has_selectable_ancestor);
        assert_eq!(writers[1].components[0].writer_index, 1);
    }

    #[test]
    fn test_cancelled_gather() {
        let (mut service, _mapper, log) = FakeService::new();
        log.set_status(Phase::GatherWriterMetadata, AsyncStatus::Cancelled);
        let out = OutputWriter::discard();
        let err = WriterMetadataCatalog::new(&mut service, &out, None).gather().unwrap_err();
        assert!(matches!(err, ShadowError::MetadataGatherCancelled));
    }

    #[test]
    fn test_missing_system_provider() {
        let (mut service, _mapper, log) = FakeService::new();
        log.set_provider(None);
        let out = OutputWriter::discard();
        let err = WriterMetadataCatalog::new(&mut service, &out, None)
            .locate_system_provider()
            .unwrap_err();
        assert!(matches!(err, ShadowError::ProviderNotFound));
    }
}
