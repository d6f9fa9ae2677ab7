//! A reloadable ECMAScript-style module graph controller: the state machine
//! and traversal algorithms behind hot module replacement, independent of
//! any particular transformer, bundler, or watcher front-end.
//!
//! The crate is organized the way the algorithm itself is layered:
//!
//! - [`ids`], [`declaration`], [`hot`] — the static vocabulary: controller
//!   keys, the transformer-facing `ModuleDeclaration`, and the `import.meta.hot`
//!   registration surface a module body calls into.
//! - [`visit_index`], [`traversal`] — the iterative Tarjan SCC walk shared by
//!   every phase, in both its synchronous (link-test) and asynchronous
//!   (evaluate) flavors.
//! - [`instance`] — one load's live state: link status, resolved bindings,
//!   `ResolveExport`.
//! - [`controller`] — one URL's five-slot bank and the initial `dispatch`.
//! - [`update`] — `requestUpdate`'s five phases. The dominant module.
//! - [`application`] — the process-wide acquire map and root bookkeeping.
//! - [`debounce`] — the 100 ms coalescing combinator over `requestUpdate`.

pub mod application;
pub mod controller;
pub mod debounce;
pub mod declaration;
pub mod error;
pub mod hot;
pub mod ids;
pub mod instance;
pub mod traversal;
pub mod update;
pub mod visit_index;

pub use application::{Application, DynamicImportHost};
pub use controller::ReloadableModuleController;
pub use debounce::{DebouncedUpdater, UpdateConfig};
pub use declaration::{
    Body, DisposeData, ExportsHandle, ImportBinding, IndirectExportEntry, LoadedModuleRequestEntry,
    ModuleContext, ModuleDeclaration, ModuleFormat, ModuleRequest, StarExportEntry, Url, Value,
};
pub use error::{ChainNode, DeclinedList, FatalError, HotError, LoadError, UpdateOutcome, UpdateStats};
pub use hot::{AsyncHotCallback, HotRegistrations};
pub use ids::ControllerId;
pub use instance::ReloadableModuleInstance;
pub use update::request_update;
