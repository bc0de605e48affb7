//! Merge property tests across independent replicas.
//!
//! Each test builds replicas from a common base, edits them concurrently
//! (no exchange in between), then exchanges deltas and compares snapshots.

use flowsync_core::{
    Connection, Endpoint, Group, LogicalClock, Mutation, Node, NodeMetadata, Position, Size,
    WorkflowDocument, WorkflowSnapshot, DEFAULT_GROUP_COLOR, MAIN_GRAPH_ID,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn node(id: &str, x: f64, y: f64) -> Node {
    Node {
        id: id.into(),
        position: Position::new(x, y),
        metadata: NodeMetadata {
            node_type: "transform".into(),
            title: id.to_uppercase(),
            ..Default::default()
        },
        group_id: None,
    }
}

fn group(id: &str, members: &[&str]) -> Group {
    Group {
        id: id.into(),
        title: id.into(),
        color: DEFAULT_GROUP_COLOR.into(),
        description: String::new(),
        node_ids: members.iter().map(|m| m.to_string()).collect(),
        position: Position::default(),
        size: Size::default(),
        collapsed: false,
    }
}

fn add_node(id: &str, x: f64, y: f64) -> Mutation {
    Mutation::AddNode {
        graph_id: MAIN_GRAPH_ID.into(),
        node: node(id, x, y),
    }
}

fn move_node(id: &str, x: f64, y: f64) -> Mutation {
    Mutation::UpdateNode {
        graph_id: MAIN_GRAPH_ID.into(),
        node_id: id.into(),
        position: Some(Position::new(x, y)),
        metadata: None,
    }
}

fn remove_node(id: &str) -> Mutation {
    Mutation::RemoveNode {
        graph_id: MAIN_GRAPH_ID.into(),
        node_id: id.into(),
    }
}

/// Authority replica with the main graph and the given nodes.
fn base(nodes: &[&str]) -> WorkflowDocument {
    let mut doc = WorkflowDocument::with_clock("server", LogicalClock::counter());
    doc.seed_main_graph().unwrap();
    for id in nodes {
        doc.apply_local(&add_node(id, 0.0, 0.0)).unwrap();
    }
    doc
}

/// New replica that has received everything `source` has.
fn replica_of(source: &WorkflowDocument, actor: &str) -> WorkflowDocument {
    let mut doc = WorkflowDocument::with_clock(actor, LogicalClock::counter());
    doc.apply_remote(&source.encode_state()).unwrap();
    doc
}

/// Exchange state summaries and missing changes in both directions.
fn sync(a: &mut WorkflowDocument, b: &mut WorkflowDocument) {
    let for_b = a.diff_since(&b.state_summary()).unwrap();
    let for_a = b.diff_since(&a.state_summary()).unwrap();
    b.apply_remote(&for_b).unwrap();
    a.apply_remote(&for_a).unwrap();
}

fn position_of(snap: &WorkflowSnapshot, id: &str) -> Option<Position> {
    snap.node(MAIN_GRAPH_ID, id).map(|n| n.position)
}

// ─── Convergence / idempotence / commutativity ──────────────────────────────

#[test]
fn test_convergence_any_order_with_duplicates() {
    let server = base(&["a", "b"]);
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");
    let mut r3 = replica_of(&server, "r3");

    let deltas = vec![
        r1.apply_local(&move_node("a", 5.0, 5.0)).unwrap().delta,
        r1.apply_local(&add_node("c", 1.0, 1.0)).unwrap().delta,
        r2.apply_local(&move_node("a", 7.0, 7.0)).unwrap().delta,
        r2.apply_local(&remove_node("b")).unwrap().delta,
        r3.apply_local(&add_node("d", 2.0, 2.0)).unwrap().delta,
    ];

    let mut forward = replica_of(&server, "x");
    for d in &deltas {
        forward.apply_remote(d).unwrap();
    }

    let mut backward = replica_of(&server, "y");
    for d in deltas.iter().rev() {
        backward.apply_remote(d).unwrap();
    }
    // Duplicates on top
    for d in deltas.iter().step_by(2) {
        backward.apply_remote(d).unwrap();
    }

    let snap = forward.snapshot();
    assert_eq!(snap, backward.snapshot());
    let graph = snap.graph(MAIN_GRAPH_ID).unwrap();
    assert!(graph.nodes.contains_key("c"));
    assert!(graph.nodes.contains_key("d"));
    assert!(!graph.nodes.contains_key("b"));
}

#[test]
fn test_idempotence() {
    let server = base(&["a"]);
    let mut writer = replica_of(&server, "w");
    let delta = writer.apply_local(&move_node("a", 3.0, 4.0)).unwrap().delta;

    let mut once = replica_of(&server, "once");
    once.apply_remote(&delta).unwrap();
    let mut twice = replica_of(&server, "twice");
    twice.apply_remote(&delta).unwrap();
    twice.apply_remote(&delta).unwrap();

    assert_eq!(once.snapshot(), twice.snapshot());
    assert_eq!(once.state_summary(), twice.state_summary());
}

#[test]
fn test_commutativity() {
    let server = base(&["a", "b"]);
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");
    let a = r1.apply_local(&move_node("a", 1.0, 1.0)).unwrap().delta;
    let b = r2.apply_local(&move_node("a", 2.0, 2.0)).unwrap().delta;

    let mut ab = replica_of(&server, "ab");
    ab.apply_remote(&a).unwrap();
    ab.apply_remote(&b).unwrap();
    let mut ba = replica_of(&server, "ba");
    ba.apply_remote(&b).unwrap();
    ba.apply_remote(&a).unwrap();

    assert_eq!(ab.snapshot(), ba.snapshot());
}

// ─── Set semantics ──────────────────────────────────────────────────────────

#[test]
fn test_concurrent_add_and_unrelated_remove() {
    let server = base(&["n2"]);
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");

    r1.apply_local(&add_node("n1", 10.0, 10.0)).unwrap();
    r2.apply_local(&remove_node("n2")).unwrap();
    sync(&mut r1, &mut r2);

    for snap in [r1.snapshot(), r2.snapshot()] {
        let graph = snap.graph(MAIN_GRAPH_ID).unwrap();
        assert!(graph.nodes.contains_key("n1"));
        assert!(!graph.nodes.contains_key("n2"));
    }
    assert_eq!(r1.snapshot(), r2.snapshot());
}

#[test]
fn test_readd_after_remove_is_a_new_element() {
    let server = base(&["x"]);
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");

    // r2 moves x while r1 deletes it; the removal wins
    r1.apply_local(&remove_node("x")).unwrap();
    r2.apply_local(&move_node("x", 99.0, 99.0)).unwrap();
    sync(&mut r1, &mut r2);
    assert!(position_of(&r1.snapshot(), "x").is_none());
    assert_eq!(r1.snapshot(), r2.snapshot());

    // Re-adding the id starts from the new values only
    r1.apply_local(&add_node("x", 1.0, 1.0)).unwrap();
    sync(&mut r1, &mut r2);
    assert_eq!(position_of(&r2.snapshot(), "x"), Some(Position::new(1.0, 1.0)));
    assert_eq!(r1.snapshot(), r2.snapshot());
}

#[test]
fn test_dangling_connection_is_filtered() {
    let server = base(&["a", "b"]);
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");

    r1.apply_local(&Mutation::AddConnection {
        graph_id: MAIN_GRAPH_ID.into(),
        connection: Connection {
            id: "c1".into(),
            source: Endpoint::new("a", "out"),
            target: Endpoint::new("b", "in"),
        },
    })
    .unwrap();
    r2.apply_local(&remove_node("b")).unwrap();
    sync(&mut r1, &mut r2);

    let snap = r1.snapshot();
    assert!(snap.graph(MAIN_GRAPH_ID).unwrap().connections.is_empty());
    assert_eq!(snap, r2.snapshot());
}

// ─── Groups ─────────────────────────────────────────────────────────────────

#[test]
fn test_group_membership_race_with_group_delete() {
    let mut server = base(&["n3"]);
    server
        .apply_local(&Mutation::CreateGroup {
            graph_id: MAIN_GRAPH_ID.into(),
            group: group("g1", &[]),
        })
        .unwrap();
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");

    r1.apply_local(&Mutation::AddGroupMember {
        graph_id: MAIN_GRAPH_ID.into(),
        group_id: "g1".into(),
        node_id: "n3".into(),
    })
    .unwrap();
    r2.apply_local(&Mutation::RemoveGroup {
        graph_id: MAIN_GRAPH_ID.into(),
        group_id: "g1".into(),
    })
    .unwrap();
    sync(&mut r1, &mut r2);

    let snap = r1.snapshot();
    assert_eq!(snap, r2.snapshot());
    assert!(snap.group(MAIN_GRAPH_ID, "g1").is_none());
    // The back-reference to the deleted group reads as absent
    assert!(snap.node(MAIN_GRAPH_ID, "n3").unwrap().group_id.is_none());
}

#[test]
fn test_concurrent_join_and_leave_resolve_identically() {
    let mut server = base(&["n1", "n2"]);
    server
        .apply_local(&Mutation::CreateGroup {
            graph_id: MAIN_GRAPH_ID.into(),
            group: group("g1", &["n1"]),
        })
        .unwrap();
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");

    r1.apply_local(&Mutation::RemoveGroupMember {
        graph_id: MAIN_GRAPH_ID.into(),
        group_id: "g1".into(),
        node_id: "n1".into(),
    })
    .unwrap();
    r2.apply_local(&Mutation::AddGroupMember {
        graph_id: MAIN_GRAPH_ID.into(),
        group_id: "g1".into(),
        node_id: "n2".into(),
    })
    .unwrap();
    sync(&mut r1, &mut r2);

    let snap = r1.snapshot();
    assert_eq!(snap, r2.snapshot());
    assert_eq!(snap.group(MAIN_GRAPH_ID, "g1").unwrap().node_ids, vec!["n2"]);
}

#[test]
fn test_group_fields_merge_independently() {
    let mut server = base(&[]);
    server
        .apply_local(&Mutation::CreateGroup {
            graph_id: MAIN_GRAPH_ID.into(),
            group: group("g1", &[]),
        })
        .unwrap();
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");

    let update = |title: Option<&str>, color: Option<&str>| Mutation::UpdateGroup {
        graph_id: MAIN_GRAPH_ID.into(),
        group_id: "g1".into(),
        title: title.map(String::from),
        color: color.map(String::from),
        description: None,
        position: None,
        size: None,
        collapsed: None,
        node_ids: None,
    };
    r1.apply_local(&update(Some("Ingest"), None)).unwrap();
    r2.apply_local(&update(None, Some("#ef4444"))).unwrap();
    sync(&mut r1, &mut r2);

    let g = r1.snapshot().group(MAIN_GRAPH_ID, "g1").cloned().unwrap();
    assert_eq!(g.title, "Ingest");
    assert_eq!(g.color, "#ef4444");
    assert_eq!(r1.snapshot(), r2.snapshot());
}

// ─── Last-writer-wins ───────────────────────────────────────────────────────

#[test]
fn test_equal_timestamps_break_ties_by_actor_id() {
    let server = base(&["a"]);
    let mut low = replica_of(&server, "actor-a");
    let mut high = replica_of(&server, "actor-b");
    low.clock_mut().advance_to(50);
    high.clock_mut().advance_to(50);

    low.apply_local(&move_node("a", 1.0, 1.0)).unwrap();
    high.apply_local(&move_node("a", 2.0, 2.0)).unwrap();
    sync(&mut low, &mut high);

    assert_eq!(position_of(&low.snapshot(), "a"), Some(Position::new(2.0, 2.0)));
    assert_eq!(low.snapshot(), high.snapshot());
}

#[test]
fn test_offline_edit_with_older_timestamp_loses() {
    // Document D, graph "main", node a@(0,0)
    let mut server = base(&["a"]);
    let mut client1 = replica_of(&server, "client-1");
    let mut client2 = replica_of(&server, "client-2");

    // Client 2 is offline and moves `a` at T1
    client2.apply_local(&move_node("a", 10.0, 10.0)).unwrap();

    // Client 1 moves `a` at T2 > T1 and publishes through the server
    client1.clock_mut().advance_to(1_000);
    let d1 = client1.apply_local(&move_node("a", 50.0, 50.0)).unwrap().delta;
    server.apply_remote(&d1).unwrap();

    // Client 2 reconnects with its stale summary
    let catch_up = server.diff_since(&client2.state_summary()).unwrap();
    let missing_on_server = client2.diff_since(&server.state_summary()).unwrap();
    client2.apply_remote(&catch_up).unwrap();
    server.apply_remote(&missing_on_server).unwrap();
    client1.apply_remote(&missing_on_server).unwrap();

    for doc in [&server, &client1, &client2] {
        assert_eq!(position_of(&doc.snapshot(), "a"), Some(Position::new(50.0, 50.0)));
    }
    assert_eq!(client1.snapshot(), client2.snapshot());
}

#[test]
fn test_metadata_replaced_wholesale() {
    let server = base(&["a"]);
    let mut r1 = replica_of(&server, "r1");
    let mut r2 = replica_of(&server, "r2");

    let with_props = |props: &[(&str, i64)]| NodeMetadata {
        node_type: "transform".into(),
        title: "A".into(),
        template_id: None,
        property_values: props
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::json!(v)))
            .collect(),
    };
    r1.clock_mut().advance_to(10);
    r2.clock_mut().advance_to(20);
    r1.apply_local(&Mutation::UpdateNode {
        graph_id: MAIN_GRAPH_ID.into(),
        node_id: "a".into(),
        position: None,
        metadata: Some(with_props(&[("retries", 3)])),
    })
    .unwrap();
    r2.apply_local(&Mutation::UpdateNode {
        graph_id: MAIN_GRAPH_ID.into(),
        node_id: "a".into(),
        position: None,
        metadata: Some(with_props(&[("timeout", 30)])),
    })
    .unwrap();
    sync(&mut r1, &mut r2);

    let props = r1.snapshot().node(MAIN_GRAPH_ID, "a").unwrap().metadata.property_values.clone();
    // No deep merge: only the later blob survives
    assert_eq!(props.len(), 1);
    assert_eq!(props["timeout"], serde_json::json!(30));
    assert_eq!(r1.snapshot(), r2.snapshot());
}
