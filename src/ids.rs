//! Graph-local identifiers.
//!
//! Controllers live in a [`slotmap::SlotMap`] owned by
//! [`crate::application::Application`] rather than being linked into an
//! `Rc`-cycle web directly; every edge in the module graph (static imports,
//! dynamic imports, the view-selector closures used by the traversal
//! primitive) is expressed in terms of this `Copy` key instead of a strong
//! reference. This mirrors the slotmap-arena-of-nodes pattern used by
//! reactive-graph crates in this ecosystem for graphs that are expected to
//! contain cycles.

slotmap::new_key_type! {
    /// Identifies one [`crate::controller::ReloadableModuleController`]
    /// within an [`crate::application::Application`].
    pub struct ControllerId;
}
