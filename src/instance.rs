//! One concrete linked form of a module.
//!
//! Ported from `nova_vm`'s `AbstractModuleRecord`/`SourceTextModuleRecord`
//! pair (`module_semantics/{abstract,source_text}_module_records.rs`), with
//! the GC-heap indirection (`Agent`, `Bindable`, `Scoped`) dropped in favor
//! of plain `Rc`/`RefCell` interior mutability, since this crate runs inside
//! a single-threaded cooperative host rather than owning its own garbage
//! collector.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ahash::AHashMap;

use crate::declaration::{
    Body, DisposeData, ExportsHandle, ImportBinding, ModuleContext, ModuleDeclaration, Url, Value,
};
use crate::error::HotError;
use crate::hot::HotRegistrations;
use crate::ids::ControllerId;

/// `[[Status]]` restricted to the states this crate actually distinguishes;
/// the distilled spec's "evaluating-async" is folded into `Evaluating`
/// because every body here runs to completion (or suspension-by-await)
/// within one `evaluate()` call rather than registering a pending
/// microtask, so there is no separate queued-but-not-yet-running state to
/// model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unlinked,
    Linking,
    Linked,
    Evaluating,
    Evaluated,
}

/// A resolved import binding, produced by `link`/`relink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedBinding {
    Ambiguous,
    Resolved {
        module: ControllerId,
        /// `None` means the binding is the target module's whole namespace
        /// (a re-export of `*` with no direct local binding).
        binding_name: Option<Box<str>>,
    },
}

type ResolveChild<'a> = dyn Fn(ControllerId) -> Option<Rc<ReloadableModuleInstance>> + 'a;

/// One evaluated (or about-to-be) interpretation of a [`ModuleDeclaration`].
pub struct ReloadableModuleInstance {
    pub declaration: Rc<ModuleDeclaration>,
    link_state: Cell<LinkState>,
    exports: ExportsHandle,
    evaluation_error: RefCell<Option<HotError>>,
    bindings: RefCell<AHashMap<Box<str>, ResolvedBinding>>,
    dynamic_children: RefCell<Vec<ControllerId>>,
    pub hot: Rc<HotRegistrations>,
}

impl ReloadableModuleInstance {
    /// `instantiate(data?)`: allocate a fresh exports namespace, optionally
    /// seeding it from a predecessor's `dispose` payload by stashing it
    /// under the reserved `"@dispose"` key for the body to pick up (the
    /// distilled spec leaves the seeding convention host-defined; this
    /// crate's bodies read it via [`ModuleContext::meta`] instead — see
    /// `evaluate`).
    pub fn instantiate(declaration: Rc<ModuleDeclaration>, dispose_data: Option<DisposeData>) -> Self {
        let instance = Self {
            declaration,
            link_state: Cell::new(LinkState::Unlinked),
            exports: ExportsHandle::new(),
            evaluation_error: RefCell::new(None),
            bindings: RefCell::new(AHashMap::new()),
            dynamic_children: RefCell::new(Vec::new()),
            hot: Rc::new(HotRegistrations::new()),
        };
        if let Some(data) = dispose_data {
            instance.exports.set("@dispose", data);
        }
        instance
    }

    /// `clone()`: a fresh instance sharing the same declaration, used for
    /// self-update (re-evaluating the same code) and staging revival.
    pub fn clone_declaration(&self) -> Self {
        Self::instantiate(self.declaration.clone(), None)
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state.get()
    }

    pub fn exports(&self) -> &ExportsHandle {
        &self.exports
    }

    pub fn evaluation_error(&self) -> Option<HotError> {
        self.evaluation_error.borrow().clone()
    }

    pub fn dispose_data(&self) -> Option<DisposeData> {
        self.exports.get("@dispose")
    }

    pub fn record_dynamic_child(&self, id: ControllerId) {
        let mut children = self.dynamic_children.borrow_mut();
        if !children.contains(&id) {
            children.push(id);
        }
    }

    pub fn dynamic_children(&self) -> Vec<ControllerId> {
        self.dynamic_children.borrow().clone()
    }

    /// `link(resolveChild)`: bind every imported name, resolving indirect
    /// and star-export chains per [`resolve_export`].
    pub fn link(
        self: &Rc<Self>,
        self_id: ControllerId,
        resolve_child: &ResolveChild<'_>,
    ) -> Result<(), HotError> {
        self.link_state.set(LinkState::Linking);

        // Single-hop `export * from self` is a structural link error,
        // independent of which name is ever looked up (see DESIGN.md for
        // why this crate stops at the single-hop case).
        for star in &self.declaration.star_export_entries {
            if star.request.target() == self_id {
                return Err(HotError::Link {
                    url: self.declaration.url.clone(),
                    message: "module re-exports '*' from itself".into(),
                });
            }
        }

        let mut resolved: AHashMap<Box<str>, ResolvedBinding> = AHashMap::new();
        for entry in &self.declaration.loaded_modules {
            let target_id = entry.request.target();
            let target = resolve_child(target_id).ok_or_else(|| HotError::Link {
                url: self.declaration.url.clone(),
                message: format!("could not resolve import {:?}", entry.request.specifier).into(),
            })?;
            for binding in &entry.bindings {
                match binding {
                    ImportBinding::Named { imported, local } => {
                        let mut resolve_set = Vec::new();
                        let result = resolve_export(
                            target_id,
                            &target,
                            imported,
                            &mut resolve_set,
                            resolve_child,
                        )?;
                        let binding = match result {
                            Some(b) => b,
                            None => {
                                return Err(HotError::Link {
                                    url: self.declaration.url.clone(),
                                    message: format!(
                                        "'{imported}' is not exported by {}",
                                        entry.request.specifier
                                    )
                                    .into(),
                                });
                            }
                        };
                        if matches!(binding, ResolvedBinding::Ambiguous) {
                            return Err(HotError::Link {
                                url: self.declaration.url.clone(),
                                message: format!(
                                    "ambiguous import '{imported}' from {}",
                                    entry.request.specifier
                                )
                                .into(),
                            });
                        }
                        resolved.insert(local.clone(), binding);
                    }
                    ImportBinding::Namespace { local } => {
                        resolved.insert(
                            local.clone(),
                            ResolvedBinding::Resolved {
                                module: target_id,
                                binding_name: None,
                            },
                        );
                    }
                }
            }
        }

        *self.bindings.borrow_mut() = resolved;
        self.link_state.set(LinkState::Linked);
        Ok(())
    }

    /// `relink()`: re-run `link` assuming the declared structure is
    /// unchanged. Kept as a distinct entry point (rather than an alias) to
    /// document the distilled spec's invariant that it is only ever called
    /// post-evaluation to re-bind names in modules that were not replaced.
    pub fn relink(
        self: &Rc<Self>,
        self_id: ControllerId,
        resolve_child: &ResolveChild<'_>,
    ) -> Result<(), HotError> {
        self.link(self_id, resolve_child)
    }

    /// `unlink()`: release bindings. Returns whether the caller should
    /// forget this instance entirely (always true here — this crate has no
    /// shared-instance aliasing that would make that conditional).
    pub fn unlink(&self) -> bool {
        self.bindings.borrow_mut().clear();
        self.link_state.set(LinkState::Unlinked);
        true
    }

    /// Look up the value a local imported name is currently bound to,
    /// chasing a namespace binding into a snapshot map. Used by module
    /// bodies (via [`ModuleContext`]) to read their imports.
    pub fn import_value(&self, local_name: &str, resolve_child: &ResolveChild<'_>) -> Option<Value> {
        let binding = self.bindings.borrow().get(local_name)?.clone();
        match binding {
            ResolvedBinding::Ambiguous => None,
            ResolvedBinding::Resolved {
                module,
                binding_name: Some(name),
            } => resolve_child(module)?.exports.get(&name),
            ResolvedBinding::Resolved {
                module,
                binding_name: None,
            } => {
                // Namespace binding: expose the whole exports map as an
                // opaque `Rc<AHashMap<..>>` value.
                let target = resolve_child(module)?;
                Some(Rc::new(target.exports.snapshot()) as Value)
            }
        }
    }

    /// `evaluate()`: drive the body to completion. Synchronous bodies run
    /// inline; async bodies are awaited by the caller (the controller),
    /// which is why this returns the future rather than blocking on it.
    pub fn evaluate_sync(
        &self,
        ctx: &ModuleContext,
    ) -> Result<(), HotError> {
        self.link_state.set(LinkState::Evaluating);
        let result = match &self.declaration.body {
            Body::Sync(body) => body(ctx, &self.exports, &self.hot),
            Body::Async(_) => {
                panic!("evaluate_sync called on an async module body; use evaluate_async")
            }
        };
        if let Err(err) = &result {
            *self.evaluation_error.borrow_mut() = Some(err.clone());
        }
        self.link_state.set(LinkState::Evaluated);
        result
    }

    pub async fn evaluate_async(
        &self,
        ctx: &ModuleContext,
        forward_updates: &[Url],
    ) -> Result<(), HotError> {
        self.link_state.set(LinkState::Evaluating);
        let result = match &self.declaration.body {
            Body::Async(body) => body(ctx, &self.exports, &self.hot, forward_updates).await,
            Body::Sync(body) => body(ctx, &self.exports, &self.hot),
        };
        if let Err(err) = &result {
            *self.evaluation_error.borrow_mut() = Some(err.clone());
        }
        self.link_state.set(LinkState::Evaluated);
        result
    }

    pub fn is_async(&self) -> bool {
        self.declaration.body.is_async()
    }
}

/// `ResolveExport(exportName, resolveSet)`, ported from `nova_vm`'s
/// `SourceTextModuleRecord::resolve_export` (`source_text_module_records.rs`).
/// Returns `Ok(None)` for an unresolved/circular name, `Ok(Some(Ambiguous))`
/// for a star-export conflict, or the resolved binding.
pub fn resolve_export(
    module_id: ControllerId,
    instance: &Rc<ReloadableModuleInstance>,
    export_name: &str,
    resolve_set: &mut Vec<(ControllerId, Box<str>)>,
    resolve_child: &ResolveChild<'_>,
) -> Result<Option<ResolvedBinding>, HotError> {
    if resolve_set
        .iter()
        .any(|(m, n)| *m == module_id && n.as_ref() == export_name)
    {
        return Ok(None);
    }
    resolve_set.push((module_id, export_name.into()));

    if instance
        .declaration
        .local_export_names
        .iter()
        .any(|n| n.as_ref() == export_name)
    {
        return Ok(Some(ResolvedBinding::Resolved {
            module: module_id,
            binding_name: Some(export_name.into()),
        }));
    }

    if let Some(entry) = instance.declaration.indirect_export_entries.get(export_name) {
        let target_id = entry.request.target();
        let target = resolve_child(target_id).ok_or_else(|| HotError::Link {
            url: instance.declaration.url.clone(),
            message: format!("could not resolve re-export target {:?}", entry.request.specifier)
                .into(),
        })?;
        return match &entry.import_name {
            Some(import_name) => {
                resolve_export(target_id, &target, import_name, resolve_set, resolve_child)
            }
            None => Ok(Some(ResolvedBinding::Resolved {
                module: target_id,
                binding_name: None,
            })),
        };
    }

    if export_name == "default" {
        return Ok(None);
    }

    let mut star_resolution: Option<ResolvedBinding> = None;
    for star in &instance.declaration.star_export_entries {
        let target_id = star.request.target();
        let target = resolve_child(target_id).ok_or_else(|| HotError::Link {
            url: instance.declaration.url.clone(),
            message: format!("could not resolve star export target {:?}", star.request.specifier)
                .into(),
        })?;
        let resolution = resolve_export(target_id, &target, export_name, resolve_set, resolve_child)?;
        let Some(resolution) = resolution else {
            continue;
        };
        if matches!(resolution, ResolvedBinding::Ambiguous) {
            return Ok(Some(ResolvedBinding::Ambiguous));
        }
        match &star_resolution {
            None => star_resolution = Some(resolution),
            Some(ResolvedBinding::Resolved {
                module: existing_module,
                binding_name: existing_name,
            }) => {
                let ResolvedBinding::Resolved {
                    module: new_module,
                    binding_name: new_name,
                } = &resolution
                else {
                    unreachable!("ambiguous handled above")
                };
                if new_module != existing_module {
                    return Ok(Some(ResolvedBinding::Ambiguous));
                }
                if new_name != existing_name && (new_name.is_none() || existing_name.is_none()) {
                    return Ok(Some(ResolvedBinding::Ambiguous));
                }
                if new_name.is_some() && existing_name.is_some() && new_name != existing_name {
                    return Ok(Some(ResolvedBinding::Ambiguous));
                }
            }
            Some(ResolvedBinding::Ambiguous) => unreachable!("ambiguous handled above"),
        }
    }

    Ok(star_resolution)
}
