//! The shared, process-wide object every controller can reach: the per-URL
//! acquire map, the visit-index allocator, and the root's `requestUpdate`
//! hooks (distilled spec §9: "`application` indirection... is process-wide
//! mutable state with init-once / overwrite-on-root-dispatch semantics").

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ahash::AHashMap;
use async_trait::async_trait;
use futures::future::LocalBoxFuture;
use slotmap::SlotMap;

use crate::controller::{dispatch as run_dispatch, ReloadableModuleController};
use crate::declaration::{ModuleContext, ModuleDeclaration, Url, Value};
use crate::error::{HotError, LoadError, UpdateOutcome};
use crate::ids::ControllerId;
use crate::instance::ReloadableModuleInstance;
use crate::update::request_update as run_request_update;
use crate::visit_index::VisitIndexAllocator;

/// The host loader contract (§6): resolves a dynamic `import()` issued from
/// inside a module body to a controller, driving a fresh `load` on it first
/// if needed. Left abstract because fetching and transforming source is
/// explicitly out of scope (§1).
#[async_trait(?Send)]
pub trait DynamicImportHost {
    async fn import(&self, referrer: &Url, specifier: &str) -> Result<ControllerId, LoadError>;
}

pub struct Application {
    controllers: RefCell<SlotMap<ControllerId, Rc<ReloadableModuleController>>>,
    by_url: RefCell<AHashMap<Url, ControllerId>>,
    pub visit_index: Rc<VisitIndexAllocator>,
    root: Cell<Option<ControllerId>>,
    request_update_result: RefCell<Option<UpdateOutcome>>,
    loader: RefCell<Option<Rc<dyn DynamicImportHost>>>,
}

impl Default for Application {
    fn default() -> Self {
        Self::new()
    }
}

impl Application {
    pub fn new() -> Self {
        Self {
            controllers: RefCell::new(SlotMap::with_key()),
            by_url: RefCell::new(AHashMap::new()),
            visit_index: Rc::new(VisitIndexAllocator::new()),
            root: Cell::new(None),
            request_update_result: RefCell::new(None),
            loader: RefCell::new(None),
        }
    }

    pub fn set_loader(&self, loader: Rc<dyn DynamicImportHost>) {
        *self.loader.borrow_mut() = Some(loader);
    }

    /// `acquire(url)`: interns a controller for `url`, creating one on first
    /// reference. At most one controller exists per URL (invariant, §3).
    pub fn acquire(&self, url: impl Into<Url>) -> ControllerId {
        let url = url.into();
        if let Some(&id) = self.by_url.borrow().get(&url) {
            return id;
        }
        let id = self
            .controllers
            .borrow_mut()
            .insert(Rc::new(ReloadableModuleController::new(url.clone())));
        self.by_url.borrow_mut().insert(url, id);
        id
    }

    pub fn controller(&self, id: ControllerId) -> Rc<ReloadableModuleController> {
        self.controllers
            .borrow()
            .get(id)
            .cloned()
            .expect("ControllerId from this Application's acquire map")
    }

    pub fn set_root(&self, id: ControllerId) {
        self.root.set(Some(id));
    }

    pub fn root(&self) -> ControllerId {
        self.root.get().expect("root controller set via set_root before dispatch")
    }

    pub fn request_update_result(&self) -> Option<UpdateOutcome> {
        self.request_update_result.borrow().clone()
    }

    fn lookup(self: &Rc<Self>) -> impl Fn(ControllerId) -> Rc<ReloadableModuleController> + '_ {
        move |id| self.controller(id)
    }

    fn make_ctx(self: &Rc<Self>) -> impl Fn(&ReloadableModuleController, &ReloadableModuleInstance) -> ModuleContext + '_ {
        move |controller, instance| {
            let app = self.clone();
            let referrer = controller.url.clone();
            ModuleContext {
                url: controller.url.clone(),
                meta: instance.declaration.meta.clone(),
                dynamic_import: Rc::new(move |specifier: Box<str>| -> LocalBoxFuture<'static, Result<ControllerId, HotError>> {
                    let app = app.clone();
                    let referrer = referrer.clone();
                    Box::pin(async move {
                        let loader = app.loader.borrow().clone().ok_or_else(|| HotError::Link {
                            url: referrer.clone(),
                            message: "no dynamic import host configured".into(),
                        })?;
                        loader.import(&referrer, &specifier).await.map_err(|err| HotError::Link {
                            url: referrer.clone(),
                            message: err.to_string().into(),
                        })
                    })
                }),
            }
        }
    }

    /// Transformer-facing `controller.load(...)` entry point.
    pub fn load(&self, id: ControllerId, declaration: Rc<ModuleDeclaration>, dispose_data: Option<Value>) {
        self.controller(id).load(declaration, dispose_data);
    }

    /// `dispatch`: the initial instantiate→link→evaluate pass over the graph
    /// reachable from the root controller.
    pub async fn dispatch(self: &Rc<Self>) -> Result<(), HotError> {
        let root = self.root();
        let lookup = self.lookup();
        let make_ctx = self.make_ctx();
        run_dispatch(root, &lookup, &make_ctx).await
    }

    /// `application.requestUpdate()`, undebounced. [`crate::debounce`] wraps
    /// this with the 100 ms coalescing combinator described in §5.
    pub async fn request_update(self: &Rc<Self>) -> Option<UpdateOutcome> {
        let root = self.root();
        let lookup = self.lookup();
        let make_ctx = self.make_ctx();
        let outcome = run_request_update(root, &lookup, &make_ctx, &self.visit_index).await;
        *self.request_update_result.borrow_mut() = outcome.clone();
        outcome
    }
}
