//! The immutable record the transformer hands the controller, and the
//! plumbing types it is built from.
//!
//! `ModuleDeclaration` is this crate's analogue of a Source Text Module
//! Record's static structure in `nova_vm`'s `source_text_module_records.rs`:
//! everything here is fixed once the transformer produces it, and is shared
//! (via `Rc`) by every instance built from the same load.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;

use ahash::AHashMap;
use futures::future::LocalBoxFuture;

use crate::error::HotError;
use crate::hot::HotRegistrations;
use crate::ids::ControllerId;

/// An interned-ish module URL. Cheap to clone; used as the key of the
/// controller-acquire map and threaded through every error value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Url(Rc<str>);

impl Url {
    pub fn new(value: impl Into<Rc<str>>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Url({:?})", self.0)
    }
}

impl From<&str> for Url {
    fn from(value: &str) -> Self {
        Url::new(value)
    }
}

impl From<String> for Url {
    fn from(value: String) -> Self {
        Url::new(value)
    }
}

/// An opaque, host-defined exported value or `dispose` carry-over payload.
///
/// The core never inspects what a module exports or disposes: it only moves
/// these handles around and rebinds names to them. Downcasting is left to
/// host callbacks via `Any`.
pub type Value = Rc<dyn Any>;

/// Payload a module's `dispose` callback hands to its successor's
/// `instantiate`.
pub type DisposeData = Value;

/// Format tag passed through to the loader untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    EsModule,
    Json,
    WasmModule,
    Other,
}

/// Context handed to a module body on execution: its metadata descriptor and
/// a way to perform a dynamic `import()` from within the body.
#[derive(Clone)]
pub struct ModuleContext {
    pub url: Url,
    pub meta: Option<Value>,
    pub dynamic_import: Rc<dyn Fn(Box<str>) -> LocalBoxFuture<'static, Result<ControllerId, HotError>>>,
}

/// Interior-mutable handle to a live exports namespace.
///
/// Retained by the instance across evaluations so that a body's
/// `replace_exports` hook (the distilled spec's description of the
/// resumable-producer's yielded pair) can rebind live names in place, which
/// is how `export let` re-evaluation and TDZ-free self-accept both work.
#[derive(Clone, Default)]
pub struct ExportsHandle(Rc<std::cell::RefCell<AHashMap<Box<str>, Value>>>);

impl ExportsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, name: impl Into<Box<str>>, value: Value) {
        self.0.borrow_mut().insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name).cloned()
    }

    pub fn names(&self) -> Vec<Box<str>> {
        self.0.borrow().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> AHashMap<Box<str>, Value> {
        self.0.borrow().clone()
    }
}

/// A module's executable body.
///
/// Modeled as a callback rather than an actual Rust generator (stable Rust
/// has none): calling it drives the module's top-level code to completion,
/// and the code is expected to call back into the `ExportsHandle` it is
/// given exactly the way the distilled spec's resumable producer yields
/// `(replaceExports, exportsObject)` pairs. The `&Rc<HotRegistrations>`
/// parameter is this crate's `import.meta.hot` — the transformed body calls
/// `accept`/`decline`/`on_dispose`/etc. on it directly during evaluation.
#[derive(Clone)]
pub enum Body {
    Sync(Rc<dyn Fn(&ModuleContext, &ExportsHandle, &Rc<HotRegistrations>) -> Result<(), HotError>>),
    /// `forward_updates` carries the accepted-dependency list in scope for
    /// this evaluation, mirroring the async body's extra `accepts`
    /// parameter in the distilled spec.
    Async(
        Rc<
            dyn Fn(
                &ModuleContext,
                &ExportsHandle,
                &Rc<HotRegistrations>,
                &[Url],
            ) -> Pin<Box<dyn std::future::Future<Output = Result<(), HotError>>>>,
        >,
    ),
}

impl Body {
    pub fn is_async(&self) -> bool {
        matches!(self, Body::Async(_))
    }
}

/// A resolved reference to an imported module: the specifier as written,
/// plus a thunk resolving it to the target controller (supplied by the host
/// loader at transform time, per the distilled spec's `LoadedModuleRequestEntry`).
#[derive(Clone)]
pub struct ModuleRequest {
    pub specifier: Box<str>,
    pub resolve: Rc<dyn Fn() -> ControllerId>,
}

impl ModuleRequest {
    pub fn target(&self) -> ControllerId {
        (self.resolve)()
    }
}

impl fmt::Debug for ModuleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleRequest({:?})", self.specifier)
    }
}

/// A single named or namespace import binding.
#[derive(Debug, Clone)]
pub enum ImportBinding {
    /// `import { imported as local } from "…"`.
    Named { imported: Box<str>, local: Box<str> },
    /// `import * as local from "…"`.
    Namespace { local: Box<str> },
}

/// One static import of the source, in source-text occurrence order.
#[derive(Clone)]
pub struct LoadedModuleRequestEntry {
    pub request: ModuleRequest,
    pub bindings: Vec<ImportBinding>,
}

/// `export { imported as exportName } from "…"`.
#[derive(Clone)]
pub struct IndirectExportEntry {
    pub request: ModuleRequest,
    /// `None` represents `export * as exportName from "…"` (the whole
    /// namespace re-exported under one name).
    pub import_name: Option<Box<str>>,
}

/// `export * from "…"`.
#[derive(Clone)]
pub struct StarExportEntry {
    pub request: ModuleRequest,
}

/// The immutable record produced by the transformer and attached to every
/// instance built from one load.
#[derive(Clone)]
pub struct ModuleDeclaration {
    pub url: Url,
    pub body: Body,
    pub meta: Option<Value>,
    pub format: ModuleFormat,
    pub import_assertions: AHashMap<Box<str>, Box<str>>,
    pub uses_dynamic_import: bool,
    pub loaded_modules: Vec<LoadedModuleRequestEntry>,
    /// Names the body binds directly (not via a re-export). The distilled
    /// spec does not carry this as static metadata, since a body only
    /// declares its exports by calling into the live `ExportsHandle`; but
    /// `ResolveExport` needs to know these names exist *before* evaluation
    /// runs (link precedes evaluate), exactly as `[[LocalExportEntries]]`
    /// does for a real Source Text Module Record. Supplied by the
    /// transformer alongside the body.
    pub local_export_names: Vec<Box<str>>,
    pub indirect_export_entries: AHashMap<Box<str>, IndirectExportEntry>,
    pub star_export_entries: Vec<StarExportEntry>,
}

impl ModuleDeclaration {
    /// Structural equality used to decide whether a replacement is a
    /// "reevaluation" (same declaration) or a "load" (new declaration) when
    /// counting `UpdateStats`. Declarations are produced fresh on every
    /// `load` call, so identity of the `Rc` is the right notion of
    /// "unchanged" here, not a deep comparison of callbacks.
    pub fn same_as(this: &Rc<ModuleDeclaration>, other: &Rc<ModuleDeclaration>) -> bool {
        Rc::ptr_eq(this, other)
    }
}
