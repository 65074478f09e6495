//! Benchmark for the in-memory node store
//!
//! Covers the two hot paths of the storage contract: the atomic idle node
//! claim used by occupy and the compare-and-set used by every transition.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use node_pool_manager::domain::{NewNode, NodeStatus, NodeUpdate, Storage};
use node_pool_manager::MemoryStore;
use std::sync::Arc;

const POOL: &str = "bench-pool";

fn idle_node() -> NewNode {
    NewNode {
        status: NodeStatus::Idle,
        ..NewNode::creating(POOL)
    }
}

fn seeded_store(rt: &tokio::runtime::Runtime, nodes: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    rt.block_on(async {
        for _ in 0..nodes {
            let _ = store.insert_node(idle_node()).await;
        }
    });
    store
}

fn bench_claim_and_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_store");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = seeded_store(&rt, 1000);

    group.bench_function("claim_release_idle_node", |b| {
        b.iter(|| {
            rt.block_on(async {
                if let Ok(Some(node)) = store.claim_idle_node(black_box(POOL)).await {
                    let release = NodeUpdate::status(NodeStatus::Idle).with_occupied(false);
                    let _ = store
                        .compare_and_set_node(node.id, NodeStatus::Occupied, release)
                        .await;
                }
            });
        });
    });

    group.finish();
}

fn bench_compare_and_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_store");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = seeded_store(&rt, 1000);
    let ids: Vec<u64> = rt.block_on(async {
        store
            .list_nodes(POOL)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.id)
            .collect()
    });

    group.bench_function("compare_and_set_conflict", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let node_id = ids[counter % ids.len()];
            rt.block_on(async {
                // Expected status never matches, so every row stays Idle
                let _ = store
                    .compare_and_set_node(
                        black_box(node_id),
                        NodeStatus::Running,
                        NodeUpdate::status(NodeStatus::Occupied),
                    )
                    .await;
            });
        });
    });

    group.finish();
}

fn bench_concurrent_claims(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_store");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("concurrent_100_claims", |b| {
        b.iter(|| {
            let store = seeded_store(&rt, 64);
            rt.block_on(async {
                let mut handles = Vec::new();
                for _ in 0..100 {
                    let store = store.clone();
                    handles.push(tokio::spawn(async move {
                        let _ = store.claim_idle_node(POOL).await;
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_and_release,
    bench_compare_and_set,
    bench_concurrent_claims,
);
criterion_main!(benches);
