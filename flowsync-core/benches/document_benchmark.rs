use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use flowsync_core::{
    LogicalClock, Mutation, Node, NodeMetadata, Position, WorkflowDocument, MAIN_GRAPH_ID,
};

fn seeded_with_nodes(count: usize) -> WorkflowDocument {
    let mut doc = WorkflowDocument::with_clock("bench", LogicalClock::counter());
    doc.seed_main_graph().unwrap();
    for i in 0..count {
        doc.apply_local(&add_node(&format!("n{i}"), i as f64)).unwrap();
    }
    doc
}

fn add_node(id: &str, x: f64) -> Mutation {
    Mutation::AddNode {
        graph_id: MAIN_GRAPH_ID.into(),
        node: Node {
            id: id.into(),
            position: Position::new(x, 0.0),
            metadata: NodeMetadata {
                node_type: "transform".into(),
                title: id.into(),
                ..Default::default()
            },
            group_id: None,
        },
    }
}

fn bench_local_move(c: &mut Criterion) {
    let mut doc = seeded_with_nodes(100);
    let mut x = 0.0;
    c.bench_function("apply_local_move_node", |b| {
        b.iter(|| {
            x += 1.0;
            let change = doc
                .apply_local(&Mutation::UpdateNode {
                    graph_id: MAIN_GRAPH_ID.into(),
                    node_id: "n42".into(),
                    position: Some(Position::new(x, x)),
                    metadata: None,
                })
                .unwrap();
            black_box(change.delta);
        })
    });
}

fn bench_remote_merge(c: &mut Criterion) {
    let source = seeded_with_nodes(0);
    let mut writer = WorkflowDocument::with_clock("writer", LogicalClock::counter());
    writer.apply_remote(&source.encode_state()).unwrap();
    let deltas: Vec<Vec<u8>> = (0..100)
        .map(|i| writer.apply_local(&add_node(&format!("r{i}"), 0.0)).unwrap().delta)
        .collect();

    c.bench_function("apply_remote_100_deltas", |b| {
        b.iter(|| {
            let mut replica = WorkflowDocument::new("reader");
            replica.apply_remote(&source.encode_state()).unwrap();
            for d in &deltas {
                replica.apply_remote(black_box(d)).unwrap();
            }
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let doc = seeded_with_nodes(500);
    c.bench_function("snapshot_500_nodes", |b| {
        b.iter(|| black_box(doc.snapshot()))
    });
}

fn bench_catch_up(c: &mut Criterion) {
    let doc = seeded_with_nodes(500);
    let empty = WorkflowDocument::new("empty").state_summary();
    c.bench_function("diff_since_empty_500_nodes", |b| {
        b.iter(|| black_box(doc.diff_since(&empty).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_local_move,
    bench_remote_merge,
    bench_snapshot,
    bench_catch_up
);
criterion_main!(benches);
