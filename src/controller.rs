//! One URL's lifecycle: the five instance slots and the two traversals that
//! make up `dispatch` (the initial load). The hot-reload algorithm itself
//! (`requestUpdate`) lives in [`crate::update`], since it is the dominant
//! share of this crate and reads more clearly apart from slot bookkeeping.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{trace, warn};

use crate::declaration::{ModuleContext, ModuleDeclaration, Url, Value};
use crate::error::{FatalError, HotError};
use crate::hot::{dispose, is_declined};
use crate::ids::ControllerId;
use crate::instance::ReloadableModuleInstance;
use crate::traversal::{traverse_depth_first, Children, SccVisitor};

/// Which of the five slots a view selector should read, named the way the
/// distilled spec names its selector functions (`current`, `pending`,
/// `previous ?? pending`, `temporary ?? pending`).
pub type View<'a> = dyn Fn(&ReloadableModuleController) -> Option<Rc<ReloadableModuleInstance>> + 'a;

pub fn view_current(c: &ReloadableModuleController) -> Option<Rc<ReloadableModuleInstance>> {
    c.current.borrow().clone()
}

pub fn view_pending(c: &ReloadableModuleController) -> Option<Rc<ReloadableModuleInstance>> {
    c.pending.borrow().clone()
}

pub fn view_previous_or_pending(c: &ReloadableModuleController) -> Option<Rc<ReloadableModuleInstance>> {
    c.previous.borrow().clone().or_else(|| c.pending.borrow().clone())
}

pub fn view_temporary_or_pending(c: &ReloadableModuleController) -> Option<Rc<ReloadableModuleInstance>> {
    c.temporary.borrow().clone().or_else(|| c.pending.borrow().clone())
}

/// One URL's slot bank.
pub struct ReloadableModuleController {
    pub url: Url,
    pub version: Cell<u64>,
    pub fatal_error: RefCell<Option<FatalError>>,
    /// Re-entrant traversal cut, stamped by [`crate::visit_index::VisitIndexGuard`].
    pub visit_tag: Cell<Option<u64>>,
    current: RefCell<Option<Rc<ReloadableModuleInstance>>>,
    pending: RefCell<Option<Rc<ReloadableModuleInstance>>>,
    previous: RefCell<Option<Rc<ReloadableModuleInstance>>>,
    staging: RefCell<Option<Rc<ReloadableModuleInstance>>>,
    temporary: RefCell<Option<Rc<ReloadableModuleInstance>>>,
}

impl ReloadableModuleController {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            version: Cell::new(0),
            fatal_error: RefCell::new(None),
            visit_tag: Cell::new(None),
            current: RefCell::new(None),
            pending: RefCell::new(None),
            previous: RefCell::new(None),
            staging: RefCell::new(None),
            temporary: RefCell::new(None),
        }
    }

    pub fn current(&self) -> Option<Rc<ReloadableModuleInstance>> {
        self.current.borrow().clone()
    }

    pub fn staging(&self) -> Option<Rc<ReloadableModuleInstance>> {
        self.staging.borrow().clone()
    }

    pub fn pending(&self) -> Option<Rc<ReloadableModuleInstance>> {
        self.pending.borrow().clone()
    }

    pub fn previous(&self) -> Option<Rc<ReloadableModuleInstance>> {
        self.previous.borrow().clone()
    }

    pub fn temporary(&self) -> Option<Rc<ReloadableModuleInstance>> {
        self.temporary.borrow().clone()
    }

    pub fn set_current(&self, instance: Option<Rc<ReloadableModuleInstance>>) {
        *self.current.borrow_mut() = instance;
    }

    pub fn set_pending(&self, instance: Option<Rc<ReloadableModuleInstance>>) {
        *self.pending.borrow_mut() = instance;
    }

    pub fn set_previous(&self, instance: Option<Rc<ReloadableModuleInstance>>) {
        *self.previous.borrow_mut() = instance;
    }

    pub fn set_staging(&self, instance: Option<Rc<ReloadableModuleInstance>>) {
        *self.staging.borrow_mut() = instance;
    }

    pub fn set_temporary(&self, instance: Option<Rc<ReloadableModuleInstance>>) {
        *self.temporary.borrow_mut() = instance;
    }

    /// `load(...)`: the transformer-facing entry point. Builds a fresh
    /// instance from the declaration and places it in `staging`, bumping
    /// `version` (the watcher-driven cache-busting counter).
    pub fn load(&self, declaration: Rc<ModuleDeclaration>, dispose_data: Option<Value>) {
        self.version.set(self.version.get() + 1);
        self.staging
            .replace(Some(Rc::new(ReloadableModuleInstance::instantiate(declaration, dispose_data))));
    }

}

/// `dispatch`: the initial instantiate -> link -> evaluate pass over the
/// whole graph reachable from `root`'s `staging`.
pub async fn dispatch(
    root: ControllerId,
    lookup: &dyn Fn(ControllerId) -> Rc<ReloadableModuleController>,
    make_ctx: &dyn Fn(&ReloadableModuleController, &ReloadableModuleInstance) -> ModuleContext,
) -> Result<(), HotError> {
    struct InstantiateLink<'a> {
        lookup: &'a dyn Fn(ControllerId) -> Rc<ReloadableModuleController>,
    }

    impl<'a> SccVisitor for InstantiateLink<'a> {
        type SccResult = ();

        fn visit_pre(&mut self, id: ControllerId) -> Children {
            let controller = (self.lookup)(id);
            if controller.current().is_none() {
                if let Some(staging) = controller.staging() {
                    controller.set_current(Some(staging));
                    controller.set_staging(None);
                }
            }
            let Some(current) = controller.current() else {
                return Children::new();
            };
            current
                .declaration
                .loaded_modules
                .iter()
                .map(|entry| entry.request.target())
                .collect()
        }

        fn visit_post(&mut self, scc: &[ControllerId], _forward: Vec<()>) -> Result<(), HotError> {
            let resolve_child = |id: ControllerId| (self.lookup)(id).current();
            for &id in scc {
                let controller = (self.lookup)(id);
                let Some(current) = controller.current() else {
                    continue;
                };
                if let Err(err) = current.link(id, &resolve_child) {
                    for &member in scc {
                        let c = (self.lookup)(member);
                        if let Some(cur) = c.current() {
                            cur.unlink();
                        }
                        c.set_current(None);
                    }
                    return Err(err);
                }
            }
            Ok(())
        }

        fn on_cancel(&mut self, remaining: &[ControllerId]) {
            for &id in remaining {
                let controller = (self.lookup)(id);
                if let Some(cur) = controller.current() {
                    cur.unlink();
                }
                controller.set_current(None);
            }
        }
    }

    let mut visitor = InstantiateLink { lookup };
    traverse_depth_first(root, &mut visitor)?;

    // Evaluate pass: sequential, children-before-parents (post-order),
    // matching the ordering guarantee in the concurrency model.
    evaluate_reachable(root, lookup, make_ctx).await
}

async fn evaluate_reachable(
    root: ControllerId,
    lookup: &dyn Fn(ControllerId) -> Rc<ReloadableModuleController>,
    make_ctx: &dyn Fn(&ReloadableModuleController, &ReloadableModuleInstance) -> ModuleContext,
) -> Result<(), HotError> {
    // Collect post-order SCC groups synchronously (cheap, no user code
    // runs), then drive evaluation sequentially so async bodies can await.
    struct Collect<'a> {
        lookup: &'a dyn Fn(ControllerId) -> Rc<ReloadableModuleController>,
        order: Vec<Vec<ControllerId>>,
    }

    impl<'a> SccVisitor for Collect<'a> {
        type SccResult = ();

        fn visit_pre(&mut self, id: ControllerId) -> Children {
            let controller = (self.lookup)(id);
            let Some(current) = controller.current() else {
                return Children::new();
            };
            current
                .declaration
                .loaded_modules
                .iter()
                .map(|entry| entry.request.target())
                .collect()
        }

        fn visit_post(&mut self, scc: &[ControllerId], _forward: Vec<()>) -> Result<(), HotError> {
            self.order.push(scc.to_vec());
            Ok(())
        }
    }

    let mut collector = Collect { lookup, order: Vec::new() };
    traverse_depth_first(root, &mut collector)?;

    for scc in collector.order {
        for id in scc {
            let controller = lookup(id);
            let Some(current) = controller.current() else {
                continue;
            };
            if current.link_state() == crate::instance::LinkState::Evaluated {
                continue;
            }
            let ctx = make_ctx(&controller, &current);
            let result = if current.is_async() {
                current.evaluate_async(&ctx, &[]).await
            } else {
                current.evaluate_sync(&ctx)
            };
            if let Some(staging) = controller.staging() {
                if Rc::ptr_eq(&staging, &current) {
                    controller.set_staging(None);
                }
            }
            trace!("evaluated {}", controller.url);
            result?;
        }
    }
    Ok(())
}

/// Records a dispose/prune throw as the sticky fatal error on `controller`.
pub fn classify_fatal(controller: &ReloadableModuleController, message: impl Into<Rc<str>>) -> FatalError {
    let error = FatalError {
        url: controller.url.clone(),
        message: message.into(),
    };
    warn!("fatal error on {}: {}", controller.url, error.message);
    *controller.fatal_error.borrow_mut() = Some(error.clone());
    error
}

/// Whether `controller`'s current instance declined the update it is
/// participating in — a thin, testable wrapper over [`is_declined`].
pub fn current_is_declined(controller: &ReloadableModuleController) -> bool {
    controller
        .current()
        .map(|i| is_declined(&i.hot))
        .unwrap_or(false)
}

/// Runs `dispose` on `controller`'s current instance, if any.
pub fn dispose_current(controller: &ReloadableModuleController) -> Option<Value> {
    controller.current().and_then(|i| dispose(&i.hot))
}
