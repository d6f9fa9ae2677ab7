//! Hot facade predicates and callback registrations.
//!
//! These are pure inspectors over whatever `accept`/`decline`/`dispose`/
//! `prune`/`invalidate` registrations a module made against its `import.meta.hot`
//! handle (the "hot facade" the distilled spec treats as an external
//! collaborator, §4.3) plus the runners that actually invoke the registered
//! callbacks. The registrations themselves live on the instance
//! ([`crate::instance::ReloadableModuleInstance::hot`]); this module only
//! reasons about them.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ahash::AHashSet;
use async_trait::async_trait;

use crate::declaration::{DisposeData, Url, Value};
use crate::error::HotError;

/// A single `accept(dep, cb?)` / `accept()` registration.
#[derive(Clone)]
pub enum AcceptEntry {
    /// `accept()` with no dependency list: this module declares itself
    /// replaceable in place.
    Bare,
    /// `accept(dep[, cb])` / `accept([dep, …][, cb])`.
    Specific {
        deps: Vec<Url>,
        callback: Option<Rc<dyn Fn(Vec<Option<Value>>) -> Result<(), ()>>>,
    },
}

pub type DisposeCallback = Rc<dyn Fn(Option<DisposeData>) -> Option<DisposeData>>;
pub type PruneCallback = Rc<dyn Fn()>;
pub type SelfAcceptCallback = Rc<dyn Fn(Value) -> Result<(), ()>>;

/// Everything one module instance's `hot` facade usage amounts to.
#[derive(Default)]
pub struct HotRegistrations {
    accepts: RefCell<Vec<AcceptEntry>>,
    self_accept: RefCell<Option<SelfAcceptCallback>>,
    declined: Cell<bool>,
    dispose: RefCell<Vec<DisposeCallback>>,
    prune: RefCell<Vec<PruneCallback>>,
    invalidated: Cell<bool>,
}

impl HotRegistrations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_self(&self, callback: Option<SelfAcceptCallback>) {
        *self.self_accept.borrow_mut() = callback.or_else(|| Some(Rc::new(|_| Ok(()))));
        self.accepts.borrow_mut().push(AcceptEntry::Bare);
    }

    pub fn accept_deps(
        &self,
        deps: Vec<Url>,
        callback: Option<Rc<dyn Fn(Vec<Option<Value>>) -> Result<(), ()>>>,
    ) {
        self.accepts
            .borrow_mut()
            .push(AcceptEntry::Specific { deps, callback });
    }

    pub fn decline(&self) {
        self.declined.set(true);
    }

    pub fn on_dispose(&self, callback: DisposeCallback) {
        self.dispose.borrow_mut().push(callback);
    }

    pub fn on_prune(&self, callback: PruneCallback) {
        self.prune.borrow_mut().push(callback);
    }

    pub fn invalidate(&self) {
        self.invalidated.set(true);
    }
}

/// `isAcceptedSelf(instance)` — true iff a bare `accept()` was registered.
pub fn is_accepted_self(hot: &HotRegistrations) -> bool {
    hot.accepts
        .borrow()
        .iter()
        .any(|e| matches!(e, AcceptEntry::Bare))
}

/// `isDeclined(instance)` — true iff `decline()` was called.
pub fn is_declined(hot: &HotRegistrations) -> bool {
    hot.declined.get()
}

/// `isInvalidated(instance)` — true iff `invalidate()` was called during a
/// `dispose`/`accept` callback this update.
pub fn is_invalidated(hot: &HotRegistrations) -> bool {
    hot.invalidated.get()
}

/// `isAccepted(instance, changedDependencyList)` — every entry in
/// `changed_dependencies` is covered by a bare `accept()` or a
/// `accept(dep, …)` naming it.
pub fn is_accepted(hot: &HotRegistrations, changed_dependencies: &[Url]) -> bool {
    if is_accepted_self(hot) {
        return true;
    }
    if changed_dependencies.is_empty() {
        // Nothing changed among dependencies: vacuously accepted regardless
        // of registrations (there is nothing to propagate).
        return true;
    }
    let mut covered: AHashSet<&Url> = AHashSet::new();
    for entry in hot.accepts.borrow().iter() {
        if let AcceptEntry::Specific { deps, .. } = entry {
            covered.extend(deps.iter());
        }
    }
    changed_dependencies.iter().all(|d| covered.contains(d))
}

/// Runs the accept callbacks registered for the intersection of
/// `changed_dependencies` and this instance's specific `accept(dep, cb)`
/// registrations. Returns `false` iff any callback returned an error or the
/// module invalidated itself while running.
pub fn try_accept(hot: &HotRegistrations, changed_dependencies: &[Url]) -> bool {
    let mut ok = true;
    for entry in hot.accepts.borrow().iter() {
        let AcceptEntry::Specific { deps, callback } = entry else {
            continue;
        };
        let Some(callback) = callback else { continue };
        let matched: Vec<Option<Value>> = deps
            .iter()
            .filter(|d| changed_dependencies.contains(d))
            .map(|_| None)
            .collect();
        if matched.is_empty() {
            continue;
        }
        if callback(matched).is_err() {
            ok = false;
        }
    }
    ok && !hot.invalidated.get()
}

/// Runs the bare self-accept callback, if any, with the namespace getter for
/// the new instance. Returns `false` both on error/invalidation and when no
/// bare `accept()` was ever registered — a plain replacement has no claim of
/// its own over being replaced, so it must propagate into `invalidated`/
/// `forwardUpdates` and let an importer's `accept(dep, cb)` decide instead.
pub fn try_accept_self(hot: &HotRegistrations, new_namespace: Value) -> bool {
    let Some(callback) = hot.self_accept.borrow().clone() else {
        return false;
    };
    callback(new_namespace).is_ok() && !hot.invalidated.get()
}

/// Runs every registered `dispose` callback in registration order, folding
/// each returned payload into the next callback's input, and returns the
/// final payload as the data carried to the successor's `instantiate`.
///
/// A panic unwind from a callback is not caught here: per the distilled
/// spec, a `dispose`/`prune` throw is *fatal*, and the controller classifies
/// it into a sticky [`crate::error::FatalError`] at the call site instead of
/// this function swallowing it.
pub fn dispose(hot: &HotRegistrations) -> Option<DisposeData> {
    let mut data = None;
    for callback in hot.dispose.borrow().iter() {
        data = callback(data);
    }
    data
}

/// Runs every registered `prune` callback; used for modules that became
/// permanently unreachable.
pub fn prune(hot: &HotRegistrations) {
    for callback in hot.prune.borrow().iter() {
        callback();
    }
}

/// Runner abstraction for facade callbacks that may themselves be
/// asynchronous (an `accept`/`dispose` callback that returns a promise).
/// Mirrors the async host-callback traits `denoland-deno` wraps with
/// `async-trait` at its embedder boundary.
#[async_trait(?Send)]
pub trait AsyncHotCallback {
    async fn run(&self, input: Option<Value>) -> Result<Option<Value>, HotError>;
}
