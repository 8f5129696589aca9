use super::Component;

/// Whether a component has to be listed explicitly in the backup set.
///
/// A selectable ancestor already carries its descendants, so only an unselectable component
/// under a selectable ancestor is left out. Everything else is added.
pub fn should_add(component: &Component) -> bool {
    component.selectable_for_backup || !component.has_selectable_ancestor
}
