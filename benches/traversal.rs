//! Benchmarks the iterative Tarjan walk in isolation, independent of any
//! controller/instance bookkeeping, over the two adjacency shapes that
//! stress it differently: a long linear chain (worst case for stack depth)
//! and a single cycle across every node (worst case for low-link folding).

use ahash::AHashMap;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use hotgraph::ids::ControllerId;
use hotgraph::traversal::{traverse_depth_first, Children, SccVisitor};
use slotmap::SlotMap;

struct CountVisitor<'a> {
    children_of: &'a AHashMap<ControllerId, Children>,
}

impl<'a> SccVisitor for CountVisitor<'a> {
    type SccResult = usize;

    fn visit_pre(&mut self, id: ControllerId) -> Children {
        self.children_of.get(&id).cloned().unwrap_or_default()
    }

    fn visit_post(
        &mut self,
        scc: &[ControllerId],
        forward: Vec<usize>,
    ) -> Result<usize, hotgraph::HotError> {
        Ok(scc.len() + forward.iter().sum::<usize>())
    }
}

fn build_chain(len: usize) -> (ControllerId, AHashMap<ControllerId, Children>) {
    let mut keys: SlotMap<ControllerId, ()> = SlotMap::with_key();
    let ids: Vec<ControllerId> = (0..len).map(|_| keys.insert(())).collect();
    let mut children_of = AHashMap::new();
    for i in 0..len {
        let children: Children = if i + 1 < len { std::iter::once(ids[i + 1]).collect() } else { Children::new() };
        children_of.insert(ids[i], children);
    }
    (ids[0], children_of)
}

fn build_single_cycle(len: usize) -> (ControllerId, AHashMap<ControllerId, Children>) {
    let mut keys: SlotMap<ControllerId, ()> = SlotMap::with_key();
    let ids: Vec<ControllerId> = (0..len).map(|_| keys.insert(())).collect();
    let mut children_of = AHashMap::new();
    for i in 0..len {
        let next = ids[(i + 1) % len];
        children_of.insert(ids[i], std::iter::once(next).collect());
    }
    (ids[0], children_of)
}

fn bench_chain(c: &mut Criterion) {
    for &len in &[16usize, 256, 4096] {
        c.bench_function(&format!("chain traversal ({len} nodes)"), |b| {
            b.iter_batched(
                || build_chain(len),
                |(root, children_of)| {
                    let mut visitor = CountVisitor { children_of: &children_of };
                    traverse_depth_first(root, &mut visitor).unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }
}

fn bench_single_cycle(c: &mut Criterion) {
    for &len in &[16usize, 256, 4096] {
        c.bench_function(&format!("single-cycle traversal ({len} nodes)"), |b| {
            b.iter_batched(
                || build_single_cycle(len),
                |(root, children_of)| {
                    let mut visitor = CountVisitor { children_of: &children_of };
                    traverse_depth_first(root, &mut visitor).unwrap()
                },
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, bench_chain, bench_single_cycle);
criterion_main!(benches);
