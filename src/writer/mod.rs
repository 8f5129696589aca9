use serde::Serialize;
use uuid::Uuid;

pub mod catalog;
pub mod selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentType {
    Undefined,
    Database,
    FileGroup,
}

/// A writer as reported by the coordination service, with its components arranged as a forest.
#[derive(Debug, Clone, Serialize)]
pub struct Writer {
    pub instance_id: Uuid,
    pub writer_id: Uuid,
    pub name: String,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Component {
    pub name: String,
    pub logical_path: String,
    pub component_type: ComponentType,
    pub selectable_for_backup: bool,
    /// Filled in by [`compute_component_tree`].
    pub has_selectable_ancestor: bool,
    pub writer_index: usize,
    /// Index of the parent in the owning writer's `components`.
    pub parent: Option<usize>,
}

impl Component {
    pub fn new(
        name: impl Into<String>,
        logical_path: impl Into<String>,
        component_type: ComponentType,
        selectable_for_backup: bool,
        writer_index: usize,
    ) -> Self {
        Self {
            name: name.into(),
            logical_path: logical_path.into(),
            component_type,
            selectable_for_backup,
            has_selectable_ancestor: false,
            writer_index,
            parent: None,
        }
    }
}

impl Writer {
    pub fn parent_of(&self, index: usize) -> Option<&Component> {
        self.components
            .get(index)
            .and_then(|c| c.parent)
            .and_then(|p| self.components.get(p))
    }
}

fn segments(logical_path: &str) -> Vec<&str> {
    logical_path
        .split(['\\', '/'])
        .filter(|s| !s.is_empty())
        .collect()
}

/// True when `prefix` names a strict ancestor of `path` on segment boundaries.
fn is_proper_prefix(prefix: &[&str], path: &[&str]) -> bool {
    prefix.len() < path.len()
        && prefix
            .iter()
            .zip(path)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
}

/// Links every component to its nearest ancestor and derives `has_selectable_ancestor`.
///
/// The parent is the component whose logical path is the longest proper prefix of this one's.
/// Equal-length candidates resolve to the earliest declared.
pub fn compute_component_tree(writer: &mut Writer) {
    let paths: Vec<Vec<&str>> = writer
        .components
        .iter()
        .map(|c| segments(&c.logical_path))
        .collect();

    let parents: Vec<Option<usize>> = (0..paths.len())
        .map(|i| {
            let mut best: Option<usize> = None;
            for (j, candidate) in paths.iter().enumerate() {
                if i == j || !is_proper_prefix(candidate, &paths[i]) {
                    continue;
                }
                // strict `>` keeps the earliest on ties
                if best.is_none_or(|b| candidate.len() > paths[b].len()) {
                    best = Some(j);
                }
            }
            best
        })
        .collect();

    for (component, parent) in writer.components.iter_mut().zip(&parents) {
        component.parent = *parent;
    }

    // Parents are strictly shorter, so this walk terminates.
    let flags: Vec<bool> = (0..parents.len())
        .map(|i| {
            let mut cursor = parents[i];
            while let Some(p) = cursor {
                if writer.components[p].selectable_for_backup {
                    return true;
                }
                cursor = parents[p];
            }
            false
        })
        .collect();

    for (component, flag) in writer.components.iter_mut().zip(flags) {
        component.has_selectable_ancestor = flag;
    }
}
