//! The depth-first, SCC-grouping traversal primitive shared by every phase
//! of the update algorithm.
//!
//! This is the Rust analogue of `nova_vm`'s `InnerModuleLinking`/
//! `InnerModuleEvaluation` (`ecmascript/scripts_and_modules/module/module_semantics/cyclic_module_records.rs`):
//! the same depth-first, `dfs_index`/`dfs_ancestor_index`-tracked walk that
//! closes a strongly connected component the moment its ancestor index comes
//! back around to its own index. The teacher implements that walk with
//! native recursion (`inner_module_linking` calls itself); this crate
//! unrolls it into an explicit stack, because an async flavor of the same
//! walk cannot recurse without boxing every stack frame, and a single
//! iterative implementation serves both the sync and async callers without
//! duplicating the Tarjan bookkeeping.

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;

use crate::error::HotError;
use crate::ids::ControllerId;

/// Up to four static imports is the common case; this only sizes the
/// inline buffer, it never caps the number of children a node may have.
pub type Children = SmallVec<[ControllerId; 4]>;

/// Callbacks driving one synchronous depth-first, SCC-grouping traversal.
pub trait SccVisitor {
    type SccResult: Clone;

    /// Called once per node, on first descent. Returns the children to walk
    /// next (in practice: the loaded-modules of whichever instance slot this
    /// traversal's view selector picked for `id`).
    fn visit_pre(&mut self, id: ControllerId) -> Children;

    /// Called once per SCC, in dependency order (all successor SCCs have
    /// already been visited and their results are in `forward`).
    fn visit_post(
        &mut self,
        scc: &[ControllerId],
        forward: Vec<Self::SccResult>,
    ) -> Result<Self::SccResult, HotError>;

    /// Called with every node that was descended into but whose SCC never
    /// got to `visit_post` successfully, so the visitor can roll back
    /// per-node scratch state.
    fn on_cancel(&mut self, _remaining: &[ControllerId]) {}
}

struct Frame {
    node: ControllerId,
    children: Children,
    next_child: usize,
    /// Running low-link for this node, threaded through child visitation.
    low_link: u32,
}

/// Shared bookkeeping for one traversal call, factored out so the sync and
/// async drivers (see [`traverse_depth_first`] and
/// [`traverse_depth_first_async`]) can reuse the exact same Tarjan
/// mechanics and differ only in how they invoke `visit_post`.
struct Tarjan {
    counter: u32,
    index: AHashMap<ControllerId, u32>,
    on_stack: AHashSet<ControllerId>,
    stack: Vec<ControllerId>,
    children_of: AHashMap<ControllerId, Children>,
    call_stack: Vec<Frame>,
}

impl Tarjan {
    fn new() -> Self {
        Self {
            counter: 0,
            index: AHashMap::new(),
            on_stack: AHashSet::new(),
            stack: Vec::new(),
            children_of: AHashMap::new(),
            call_stack: Vec::new(),
        }
    }

    fn descend(&mut self, node: ControllerId, children: Children) {
        self.index.insert(node, self.counter);
        self.stack.push(node);
        self.on_stack.insert(node);
        self.children_of.insert(node, children.clone());
        self.call_stack.push(Frame {
            node,
            children,
            next_child: 0,
            low_link: self.counter,
        });
        self.counter += 1;
    }

    /// Advance to the next child of the top frame that still needs
    /// visiting, or `None` if the top frame is fully explored.
    fn next_unvisited_child(&mut self) -> Option<ControllerId> {
        let frame = self.call_stack.last_mut()?;
        if frame.next_child >= frame.children.len() {
            return None;
        }
        let child = frame.children[frame.next_child];
        frame.next_child += 1;
        Some(child)
    }

    /// Record that `child` is already indexed (a back/cross edge): fold its
    /// index or low-link into the current frame per Tarjan's rule.
    fn fold_known_child(&mut self, child: ControllerId) {
        let child_index = self.index[&child];
        if self.on_stack.contains(&child) {
            let frame = self.call_stack.last_mut().unwrap();
            frame.low_link = frame.low_link.min(child_index);
        }
    }

    /// Pop the fully-explored top frame and, if it closes an SCC, return its
    /// members (root-last among themselves is irrelevant; order is
    /// discovery order within the SCC, which is what the distilled spec's
    /// "order the SCC's members were first discovered" ordering guarantee
    /// requires).
    fn pop_frame(&mut self) -> (ControllerId, Option<Vec<ControllerId>>) {
        let frame = self.call_stack.pop().expect("frame present");
        let is_root = frame.low_link == self.index[&frame.node];
        let scc = if is_root {
            let mut members = Vec::new();
            loop {
                let member = self.stack.pop().expect("member on stack");
                self.on_stack.remove(&member);
                members.push(member);
                if member == frame.node {
                    break;
                }
            }
            members.reverse();
            Some(members)
        } else {
            if let Some(parent) = self.call_stack.last_mut() {
                parent.low_link = parent.low_link.min(frame.low_link);
            }
            None
        };
        (frame.node, scc)
    }

    fn forward_results<R: Clone>(
        &self,
        scc: &[ControllerId],
        results: &AHashMap<ControllerId, R>,
    ) -> Vec<R> {
        let member_set: AHashSet<ControllerId> = scc.iter().copied().collect();
        let mut out = Vec::new();
        for member in scc {
            let Some(children) = self.children_of.get(member) else {
                continue;
            };
            for child in children {
                if member_set.contains(child) {
                    continue;
                }
                if let Some(result) = results.get(child) {
                    out.push(result.clone());
                }
            }
        }
        out
    }

    /// Every node reachable-but-not-yet-closed: the members of the SCC that
    /// just failed plus every ancestor frame still on the call stack.
    fn remaining_after_failure(&self, scc: &[ControllerId]) -> Vec<ControllerId> {
        let mut remaining = scc.to_vec();
        remaining.extend(self.call_stack.iter().map(|f| f.node));
        remaining
    }
}

/// Runs `visitor` over the graph reachable from `root`, grouping nodes into
/// strongly connected components and calling `visit_post` once per SCC in
/// dependency order. On the first `Err` returned by `visit_post`, every node
/// already descended into (but not yet closed into a finished SCC) is
/// reported to `on_cancel` and the error is returned.
pub fn traverse_depth_first<V: SccVisitor>(
    root: ControllerId,
    visitor: &mut V,
) -> Result<V::SccResult, HotError> {
    let mut t = Tarjan::new();
    let mut results: AHashMap<ControllerId, V::SccResult> = AHashMap::new();
    let mut root_result: Option<V::SccResult> = None;

    t.descend(root, visitor.visit_pre(root));

    loop {
        if let Some(child) = t.next_unvisited_child() {
            if t.index.contains_key(&child) {
                t.fold_known_child(child);
            } else {
                let children = visitor.visit_pre(child);
                t.descend(child, children);
            }
            continue;
        }

        let (_node, scc) = t.pop_frame();
        if let Some(scc) = scc {
            let forward = t.forward_results(&scc, &results);
            match visitor.visit_post(&scc, forward) {
                Ok(result) => {
                    let is_root_scc = scc.contains(&root);
                    for member in &scc {
                        results.insert(*member, result.clone());
                    }
                    if is_root_scc {
                        root_result = Some(result);
                    }
                }
                Err(err) => {
                    let remaining = t.remaining_after_failure(&scc);
                    visitor.on_cancel(&remaining);
                    return Err(err);
                }
            }
        }

        if t.call_stack.is_empty() {
            break;
        }
    }

    Ok(root_result.expect("root SCC always produces a result before the walk ends"))
}

/// Async counterpart of [`traverse_depth_first`]. `visit_post` is awaited
/// SCC-by-SCC (never concurrently — the distilled spec requires evaluation
/// order across SCCs to match dependency order), which is how this crate
/// honors the "at most one update executes at a time" ordering guarantee
/// even though individual callbacks may suspend.
pub async fn traverse_depth_first_async<V, F, Fut>(
    root: ControllerId,
    visit_pre: &mut impl FnMut(ControllerId) -> Children,
    mut visit_post: F,
    mut on_cancel: impl FnMut(&[ControllerId]),
) -> Result<V, HotError>
where
    V: Clone,
    F: FnMut(Vec<ControllerId>, Vec<V>) -> Fut,
    Fut: std::future::Future<Output = Result<V, HotError>>,
{
    let mut t = Tarjan::new();
    let mut results: AHashMap<ControllerId, V> = AHashMap::new();
    let mut root_result: Option<V> = None;

    t.descend(root, visit_pre(root));

    loop {
        if let Some(child) = t.next_unvisited_child() {
            if t.index.contains_key(&child) {
                t.fold_known_child(child);
            } else {
                let children = visit_pre(child);
                t.descend(child, children);
            }
            continue;
        }

        let (_node, scc) = t.pop_frame();
        if let Some(scc) = scc {
            let forward = t.forward_results(&scc, &results);
            match visit_post(scc.clone(), forward).await {
                Ok(result) => {
                    let is_root_scc = scc.contains(&root);
                    for member in &scc {
                        results.insert(*member, result.clone());
                    }
                    if is_root_scc {
                        root_result = Some(result);
                    }
                }
                Err(err) => {
                    let remaining = t.remaining_after_failure(&scc);
                    on_cancel(&remaining);
                    return Err(err);
                }
            }
        }

        if t.call_stack.is_empty() {
            break;
        }
    }

    Ok(root_result.expect("root SCC always produces a result before the walk ends"))
}
