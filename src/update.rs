//! `requestUpdate`: the hot-reload algorithm. This is the dominant module of
//! the crate, exactly as the distilled specification's component table
//! weights it — everything else exists to let this function stay readable.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ahash::AHashSet;

use crate::controller::{classify_fatal, ReloadableModuleController};
use crate::declaration::{ModuleContext, ModuleDeclaration, Url};
use crate::error::{ChainNode, FatalError, HotError, UpdateOutcome, UpdateStats};
use crate::hot::{is_accepted, is_accepted_self, is_declined, is_invalidated, try_accept, try_accept_self};
use crate::ids::ControllerId;
use crate::instance::ReloadableModuleInstance;
use crate::traversal::{traverse_depth_first, traverse_depth_first_async, Children, SccVisitor};
use crate::visit_index::VisitIndexAllocator;

type Lookup<'a> = dyn Fn(ControllerId) -> Rc<ReloadableModuleController> + 'a;
type CtxBuilder<'a> = dyn Fn(&ReloadableModuleController, &ReloadableModuleInstance) -> ModuleContext + 'a;

/// `application.requestUpdate()`. Returns `None` for the distilled spec's
/// literal `undefined` no-op result, `Some(outcome)` for every tagged
/// result in the failure table (§4.4).
pub async fn request_update(
    root: ControllerId,
    lookup: &Lookup<'_>,
    make_ctx: &CtxBuilder<'_>,
    visit_index: &Rc<VisitIndexAllocator>,
) -> Option<UpdateOutcome> {
    let root_controller = lookup(root);

    // Phase 0 — sticky fatal.
    if let Some(fatal) = root_controller.fatal_error.borrow().clone() {
        return Some(UpdateOutcome::FatalError { error: fatal });
    }

    let previous_controllers = collect_reachable(root, lookup, &|c| c.current());

    // Phase 1 — dry-run acceptance.
    let mut phase1 = Phase1 { lookup };
    let phase1_root = traverse_depth_first(root, &mut phase1)
        .expect("phase 1 runs no user code and never returns Err");
    let reachable = collect_reachable(root, lookup, &|c| c.pending());

    if !phase1_root.needs_dispatch {
        rollback_pending(&reachable, lookup);
        return None;
    }
    if !phase1_root.declined.is_empty() {
        rollback_pending(&reachable, lookup);
        let declined = phase1_root.declined.iter().map(|&id| lookup(id).url.clone()).collect();
        return Some(UpdateOutcome::Declined { declined });
    }
    if !phase1_root.invalidated.is_empty() {
        rollback_pending(&reachable, lookup);
        let chain = build_invalidation_chain(root, lookup, visit_index);
        return Some(UpdateOutcome::Unaccepted { chain });
    }

    // Phase 2 — link test.
    if phase1_root.has_new_code {
        if let Err(error) = phase2_link_test(root, lookup) {
            rollback_pending(&reachable, lookup);
            return Some(UpdateOutcome::LinkError { error });
        }
    }

    // Phase 3 — commit link & evaluate.
    let fatal_slot: Rc<RefCell<Option<FatalError>>> = Rc::new(RefCell::new(None));
    let stats_so_far: Rc<Cell<UpdateStats>> = Rc::new(Cell::new(UpdateStats::default()));
    let phase3 = run_phase3(root, lookup, make_ctx, &fatal_slot, &stats_so_far).await;

    match phase3 {
        Ok(result) => {
            if let Some(fatal) = finalize(&previous_controllers, root, lookup) {
                return Some(UpdateOutcome::FatalError { error: fatal });
            }
            if result.tree_did_update && !result.invalidated_urls.is_empty() {
                Some(UpdateOutcome::UnacceptedEvaluation { stats: result.stats })
            } else {
                Some(UpdateOutcome::Success { stats: result.stats })
            }
        }
        Err(error) => {
            if let Some(fatal) = fatal_slot.borrow().clone() {
                finalize(&previous_controllers, root, lookup);
                return Some(UpdateOutcome::FatalError { error: fatal });
            }
            relink_for_consistency(&previous_controllers, lookup);
            if let Some(fatal) = finalize(&previous_controllers, root, lookup) {
                return Some(UpdateOutcome::FatalError { error: fatal });
            }
            Some(UpdateOutcome::EvaluationError {
                error,
                stats: stats_so_far.get(),
            })
        }
    }
}

fn pending_children(controller: &ReloadableModuleController) -> Children {
    let Some(pending) = controller.pending() else {
        return Children::new();
    };
    pending
        .declaration
        .loaded_modules
        .iter()
        .map(|entry| entry.request.target())
        .collect()
}

fn member_changed(controller: &ReloadableModuleController) -> bool {
    match (controller.previous(), controller.pending()) {
        (Some(prev), Some(pend)) => !ModuleDeclaration::same_as(&prev.declaration, &pend.declaration),
        (None, Some(_)) | (Some(_), None) => true,
        (None, None) => false,
    }
}

/// Per-SCC result of the dry-run traversal.
#[derive(Clone)]
struct Phase1Result {
    has_new_code: bool,
    /// This SCC's own invalidated members (not cumulative — used verbatim
    /// when the root SCC itself is invalidated).
    invalidated: Vec<ControllerId>,
    /// Cumulative: this SCC's declines plus every successor's.
    declined: Vec<ControllerId>,
    needs_dispatch: bool,
    invalidated_urls: Vec<Url>,
}

struct Phase1<'a> {
    lookup: &'a Lookup<'a>,
}

impl<'a> SccVisitor for Phase1<'a> {
    type SccResult = Phase1Result;

    fn visit_pre(&mut self, id: ControllerId) -> Children {
        let controller = (self.lookup)(id);
        if controller.pending().is_none() && controller.previous().is_none() {
            let pending = controller.staging().or_else(|| controller.current());
            controller.set_previous(controller.current());
            controller.set_pending(pending);
            controller.set_staging(None);
        }
        pending_children(&controller)
    }

    fn visit_post(
        &mut self,
        scc: &[ControllerId],
        forward: Vec<Phase1Result>,
    ) -> Result<Phase1Result, HotError> {
        let forward_updates: Vec<Url> = forward.iter().flat_map(|r| r.invalidated_urls.clone()).collect();
        let forward_needs_dispatch = forward.iter().any(|r| r.needs_dispatch);
        let mut declined: Vec<ControllerId> = forward.iter().flat_map(|r| r.declined.clone()).collect();

        let mut has_new_code = false;
        let mut invalidated = Vec::new();
        for &id in scc {
            let controller = (self.lookup)(id);
            let changed = member_changed(&controller);
            has_new_code |= changed;

            let current = controller.current();
            let should_invalidate = changed
                || current.is_none()
                || current.as_ref().map(|c| is_invalidated(&c.hot)).unwrap_or(false)
                || current.as_ref().map(|c| !is_accepted(&c.hot, &forward_updates)).unwrap_or(false);
            let self_accepted = current.as_ref().map(|c| is_accepted_self(&c.hot)).unwrap_or(false);
            if should_invalidate && !self_accepted {
                invalidated.push(id);
                if current.as_ref().map(|c| is_declined(&c.hot)).unwrap_or(false) {
                    declined.push(id);
                }
            }
        }

        let needs_dispatch = has_new_code || !invalidated.is_empty() || forward_needs_dispatch;
        let invalidated_urls = invalidated.iter().map(|&id| (self.lookup)(id).url.clone()).collect();

        Ok(Phase1Result {
            has_new_code: has_new_code || forward.iter().any(|r| r.has_new_code),
            invalidated,
            declined,
            needs_dispatch,
            invalidated_urls,
        })
    }
}

fn rollback_pending(reachable: &[ControllerId], lookup: &Lookup<'_>) {
    for &id in reachable {
        let controller = lookup(id);
        controller.set_pending(None);
        controller.set_previous(None);
    }
}

fn build_invalidation_chain(
    root: ControllerId,
    lookup: &Lookup<'_>,
    visit_index: &Rc<VisitIndexAllocator>,
) -> ChainNode {
    fn walk(id: ControllerId, lookup: &Lookup<'_>, tag: u64) -> ChainNode {
        let controller = lookup(id);
        if controller.visit_tag.get() == Some(tag) {
            return ChainNode {
                scc: vec![controller.url.clone()],
                children: Vec::new(),
                truncated: true,
            };
        }
        controller.visit_tag.set(Some(tag));
        let children = pending_children(&controller)
            .into_iter()
            .filter(|&child| member_changed(&lookup(child)) || is_member_invalidated(&lookup(child)))
            .map(|child| walk(child, lookup, tag))
            .collect();
        ChainNode {
            scc: vec![controller.url.clone()],
            children,
            truncated: false,
        }
    }

    fn is_member_invalidated(controller: &ReloadableModuleController) -> bool {
        controller
            .current()
            .map(|c| is_invalidated(&c.hot) || !is_accepted_self(&c.hot))
            .unwrap_or(true)
    }

    let guard = visit_index.acquire();
    walk(root, lookup, guard.tag())
}

/// Per-SCC result of the link-test traversal.
#[derive(Clone)]
struct Phase2Result {
    has_update: bool,
}

struct Phase2<'a> {
    lookup: &'a Lookup<'a>,
    touched: RefCell<Vec<ControllerId>>,
}

impl<'a> SccVisitor for Phase2<'a> {
    type SccResult = Phase2Result;

    fn visit_pre(&mut self, id: ControllerId) -> Children {
        pending_children(&(self.lookup)(id))
    }

    fn visit_post(
        &mut self,
        scc: &[ControllerId],
        forward: Vec<Phase2Result>,
    ) -> Result<Phase2Result, HotError> {
        let needs_test = scc.iter().any(|&id| member_changed(&(self.lookup)(id)))
            || forward.iter().any(|r| r.has_update);
        if !needs_test {
            return Ok(Phase2Result { has_update: false });
        }

        for &id in scc {
            let controller = (self.lookup)(id);
            let Some(pending) = controller.pending() else {
                continue;
            };
            controller.set_temporary(Some(Rc::new(pending.clone_declaration())));
            self.touched.borrow_mut().push(id);
        }
        let lookup = self.lookup;
        let resolve_child = move |id: ControllerId| {
            let c = lookup(id);
            c.temporary().or_else(|| c.pending())
        };
        for &id in scc {
            let controller = (self.lookup)(id);
            let Some(temp) = controller.temporary() else {
                continue;
            };
            temp.link(id, &resolve_child)?;
        }
        Ok(Phase2Result { has_update: true })
    }
}

fn phase2_link_test(root: ControllerId, lookup: &Lookup<'_>) -> Result<(), HotError> {
    let mut visitor = Phase2 {
        lookup,
        touched: RefCell::new(Vec::new()),
    };
    let result = traverse_depth_first(root, &mut visitor);
    let touched = visitor.touched.into_inner();
    for id in touched {
        let controller = lookup(id);
        if let Some(temp) = controller.temporary() {
            temp.unlink();
        }
        controller.set_temporary(None);
    }
    result.map(|_| ())
}

/// Per-SCC result of the commit/evaluate traversal.
#[derive(Clone)]
struct Phase3Result {
    tree_did_update: bool,
    invalidated_urls: Vec<Url>,
    stats: UpdateStats,
}

async fn run_phase3(
    root: ControllerId,
    lookup: &Lookup<'_>,
    make_ctx: &CtxBuilder<'_>,
    fatal_slot: &Rc<RefCell<Option<FatalError>>>,
    stats_so_far: &Rc<Cell<UpdateStats>>,
) -> Result<Phase3Result, HotError> {
    let mut visit_pre = |id: ControllerId| pending_children(&lookup(id));

    let visit_post = |scc: Vec<ControllerId>, forward: Vec<Phase3Result>| {
        let fatal_slot = fatal_slot.clone();
        let stats_so_far = stats_so_far.clone();
        async move {
            let forward_updates: Vec<Url> =
                forward.iter().flat_map(|r| r.invalidated_urls.clone()).collect();
            let children_tree_did_update = forward.iter().any(|r| r.tree_did_update);
            let mut stats = UpdateStats::default();
            for r in &forward {
                stats.reevaluations += r.stats.reevaluations;
                stats.loads += r.stats.loads;
            }

            let any_member_changed = scc.iter().any(|&id| member_changed(&lookup(id)));
            let any_self_invalidated = scc.iter().any(|&id| {
                lookup(id)
                    .current()
                    .map(|c| is_invalidated(&c.hot))
                    .unwrap_or(false)
            });
            let mut needs_update = any_member_changed || any_self_invalidated;

            // A bare self-accept absorbs a bubble reaching it by becoming
            // the replacement unit itself (the accepting module re-runs);
            // a specific `accept(dep, cb?)` instead only runs callbacks and
            // never forces its own re-evaluation (testable properties
            // "accept locality" / "self-accept locality").
            let self_accept_boundary = !needs_update
                && children_tree_did_update
                && scc.iter().any(|&id| {
                    lookup(id)
                        .current()
                        .map(|c| is_accepted_self(&c.hot))
                        .unwrap_or(false)
                });

            if self_accept_boundary {
                needs_update = true;
            } else if !needs_update && children_tree_did_update {
                for &id in &scc {
                    let controller = lookup(id);
                    let Some(current) = controller.current() else { continue };
                    let resolve_child = |cid: ControllerId| lookup(cid).current();
                    current.relink(id, &resolve_child)?;
                }
                let mut any_rejected = false;
                for &id in &scc {
                    let controller = lookup(id);
                    if let Some(current) = controller.current() {
                        if !try_accept(&current.hot, &forward_updates) {
                            any_rejected = true;
                        }
                    }
                }
                needs_update = any_rejected;
            }

            if !needs_update {
                for &id in &scc {
                    let controller = lookup(id);
                    controller.set_current(controller.pending());
                    controller.set_pending(None);
                }
                stats_so_far.set(stats);
                return Ok(Phase3Result {
                    tree_did_update: children_tree_did_update,
                    invalidated_urls: Vec::new(),
                    stats,
                });
            }

            let mut replaced_previous: Vec<(ControllerId, Rc<ReloadableModuleInstance>)> = Vec::new();
            for &id in &scc {
                let controller = lookup(id);
                let Some(pending) = controller.pending() else { continue };
                let previous = controller.current();

                let dispose_data = if let Some(prev) = &previous {
                    let prev_clone = prev.clone();
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        crate::hot::dispose(&prev_clone.hot)
                    })) {
                        Ok(data) => data,
                        Err(_) => {
                            let fatal = classify_fatal(&controller, "dispose callback panicked");
                            *fatal_slot.borrow_mut() = Some(fatal.clone());
                            return Err(HotError::from(fatal));
                        }
                    }
                } else {
                    None
                };

                let next = Rc::new(ReloadableModuleInstance::instantiate(
                    pending.declaration.clone(),
                    dispose_data,
                ));
                if let Some(prev) = &previous {
                    stats.reevaluations += ModuleDeclaration::same_as(&prev.declaration, &next.declaration) as u32;
                    stats.loads += !ModuleDeclaration::same_as(&prev.declaration, &next.declaration) as u32;
                } else {
                    stats.loads += 1;
                }
                controller.set_previous(previous.clone());
                controller.set_current(Some(next));
                controller.set_pending(None);
                if let Some(prev) = previous {
                    replaced_previous.push((id, prev));
                }
            }

            for &id in &scc {
                let controller = lookup(id);
                let Some(current) = controller.current() else { continue };
                let resolve_child = |cid: ControllerId| lookup(cid).current();
                current.link(id, &resolve_child)?;
            }

            for &id in &scc {
                let controller = lookup(id);
                let Some(current) = controller.current() else { continue };
                let ctx = make_ctx(&controller, &current);
                let result = if current.is_async() {
                    current.evaluate_async(&ctx, &forward_updates).await
                } else {
                    current.evaluate_sync(&ctx)
                };
                if let Err(err) = result {
                    // An SCC is the atomic unit of link/evaluate: a throw
                    // anywhere in it reverts every member already given a
                    // fresh `current` this pass, including members later in
                    // iteration order that never got to evaluate at all, back
                    // to their pre-update `current` (property: "rollback on
                    // evaluation error").
                    for &member in &scc {
                        let c = lookup(member);
                        c.set_current(c.previous());
                    }
                    return Err(err);
                }
            }

            let mut invalidated_urls = Vec::new();
            for (id, previous) in replaced_previous {
                let controller = lookup(id);
                let Some(current) = controller.current() else { continue };
                let namespace = Rc::new(current.exports().snapshot()) as crate::declaration::Value;
                if !try_accept_self(&previous.hot, namespace) {
                    invalidated_urls.push(controller.url.clone());
                }
            }

            stats_so_far.set(stats);
            Ok(Phase3Result {
                tree_did_update: true,
                invalidated_urls,
                stats,
            })
        }
    };

    let on_cancel = |_remaining: &[ControllerId]| {};

    traverse_depth_first_async(root, &mut visit_pre, visit_post, on_cancel).await
}

fn relink_for_consistency(previous_controllers: &[ControllerId], lookup: &Lookup<'_>) {
    for &id in previous_controllers {
        let controller = lookup(id);
        if let Some(pending) = controller.pending() {
            pending.unlink();
            controller.set_pending(None);
        }
        if let Some(current) = controller.current() {
            let resolve_child = |cid: ControllerId| lookup(cid).current();
            let _ = current.relink(id, &resolve_child);
        }
    }
}

/// Phase 4: prune orphans, clear scratch slots. Returns the fatal error if a
/// `prune` callback panicked — the distilled spec treats that as sticky and
/// reclassifies the whole `requestUpdate` call's result.
fn finalize(previous_controllers: &[ControllerId], root: ControllerId, lookup: &Lookup<'_>) -> Option<FatalError> {
    let new_reachable = collect_reachable(root, lookup, &|c| c.current());
    for &id in &new_reachable {
        lookup(id).set_previous(None);
    }
    let new_set: AHashSet<ControllerId> = new_reachable.into_iter().collect();
    let mut fatal = None;
    for &id in previous_controllers {
        if new_set.contains(&id) {
            continue;
        }
        let controller = lookup(id);
        let Some(current) = controller.current() else {
            continue;
        };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| crate::hot::prune(&current.hot))).is_err() {
            fatal.get_or_insert_with(|| classify_fatal(&controller, "prune callback panicked"));
        }
        controller.set_staging(Some(Rc::new(current.clone_declaration())));
        controller.set_current(None);
        controller.set_previous(None);
    }
    fatal
}

fn collect_reachable(
    root: ControllerId,
    lookup: &Lookup<'_>,
    view: &dyn Fn(&ReloadableModuleController) -> Option<Rc<ReloadableModuleInstance>>,
) -> Vec<ControllerId> {
    let mut visited = AHashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        order.push(id);
        let controller = lookup(id);
        let Some(instance) = view(&controller) else {
            continue;
        };
        for entry in &instance.declaration.loaded_modules {
            stack.push(entry.request.target());
        }
    }
    order
}
