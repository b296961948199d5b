use proptest::prelude::*;
use scenesync_core::{
    HistoryKind, HostEvent, HostProvider, LockLevel, LockManager, ObjectFlags, ObjectGraph,
    ObjectId, ObjectKey, ObjectType, OutboundMessage, RemoteEvent, SyncState, Value,
};
use scenesync_test_support::{
    calls_for, host_entity, remote_component, remote_entity, scene_dispatcher, Call,
    TestDispatcher, HIERARCHY, LOCAL_USER, OTHER_USER,
};

/// A locked entity (10) owned by another user, with components 12 and 11 in that order.
fn locked_entity() -> (TestDispatcher, scenesync_test_support::CallLog) {
    let (mut d, log) = scene_dispatcher();
    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 0,
        object: remote_entity(10, "Player")
            .locked_by(Some(OTHER_USER))
            .with_child(remote_component(12, "Mesh")),
    });
    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(ObjectId(10)),
        index: 1,
        object: remote_component(11, "Collider"),
    });
    let report = d.tick();
    assert!(report.errors.is_empty());
    (d, log)
}

#[test]
fn property_edit_on_a_locked_subtree_is_reverted() {
    let (mut d, log) = locked_entity();
    let collider = d.context().get_object(ObjectId(11)).unwrap();
    assert_eq!(d.context().graph.child_index(collider), Some(1));
    let entity = host_entity(&d, ObjectId(11)).unwrap();

    d.context_mut()
        .host
        .set_field(entity, "component", "Hacked".into());
    let report = d.tick();

    assert_eq!(report.reverted, 1);
    assert_eq!(report.sent, 0);
    assert!(d.context().session.sent.is_empty());
    assert!(calls_for(&log, collider).contains(&Call::Revert(collider)));
    assert!(!calls_for(&log, collider).contains(&Call::SyncLocal(collider)));
    assert_eq!(
        d.context().host.field(entity, "component"),
        Some(&Value::from("Collider"))
    );

    // The revert itself is not reported as another local edit.
    let report = d.tick();
    assert_eq!(report.host_events, 0);
}

#[test]
fn unlocking_lets_edits_through() {
    let (mut d, log) = locked_entity();
    let player = d.context().get_object(ObjectId(10)).unwrap();
    let collider = d.context().get_object(ObjectId(11)).unwrap();

    d.context_mut().session.push(RemoteEvent::Lock {
        id: ObjectId(10),
        locked: false,
        owner: None,
    });
    d.tick();
    let calls = calls_for(&log, player);
    assert!(calls.contains(&Call::Unlock(player)));
    assert!(calls.contains(&Call::LockOwner(player)));

    let entity = host_entity(&d, ObjectId(11)).unwrap();
    d.context_mut()
        .host
        .set_field(entity, "component", "Trigger".into());
    let report = d.tick();
    assert_eq!(report.reverted, 0);
    assert_eq!(report.sent, 1);
    assert!(calls_for(&log, collider).contains(&Call::SyncLocal(collider)));
    let sent = d.context_mut().session.take_sent();
    assert!(matches!(
        &sent[0],
        OutboundMessage::Property(diff) if diff.id == ObjectId(11)
    ));
}

#[test]
fn deleting_a_locked_object_restores_it() {
    let (mut d, log) = locked_entity();
    let mesh = d.context().get_object(ObjectId(12)).unwrap();
    let entity = host_entity(&d, ObjectId(12)).unwrap();

    d.context_mut().host.destroy(entity);
    let report = d.tick();
    assert_eq!(report.reverted, 1);
    assert_eq!(report.sent, 0);
    assert!(calls_for(&log, mesh).contains(&Call::Restore(mesh)));
    assert_eq!(d.context().graph.state(mesh), Some(SyncState::Synced));

    let restored = d.context().entity_of(mesh).unwrap();
    assert_ne!(restored, entity);
    let player_entity = host_entity(&d, ObjectId(10)).unwrap();
    assert_eq!(
        d.context().host.children(Some(player_entity)).first(),
        Some(&restored)
    );
}

#[test]
fn children_cannot_be_added_under_a_fully_locked_object() {
    let (mut d, _log) = locked_entity();
    let parent = host_entity(&d, ObjectId(10)).unwrap();
    let child = d
        .context_mut()
        .host
        .spawn_with(Some(parent), &[("component", "Light".into())]);
    let report = d.tick();
    assert_eq!(report.reverted, 1);
    assert_eq!(report.sent, 0);
    assert!(!d.context().host.is_valid(child));
    assert_eq!(d.context().host.children(Some(parent)).len(), 2);
}

#[test]
fn partial_lock_blocks_property_edits_only() {
    let (mut d, _log) = scene_dispatcher();
    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 0,
        object: remote_entity(10, "Player").locked_by(None),
    });
    d.tick();
    let player = d.context().get_object(ObjectId(10)).unwrap();
    let ctx = d.context_mut();
    assert_eq!(ctx.locks.effective_lock(&ctx.graph, player), LockLevel::Partial);

    let entity = host_entity(&d, ObjectId(10)).unwrap();
    d.context_mut().host.set_field(entity, "name", "Hero".into());
    let report = d.tick();
    assert_eq!(report.reverted, 1);

    d.context_mut()
        .host
        .spawn_with(Some(entity), &[("component", "Light".into())]);
    let report = d.tick();
    assert_eq!(report.reverted, 0);
    assert_eq!(report.sent, 1);
}

#[test]
fn own_locks_do_not_block_local_edits() {
    let (mut d, _log) = scene_dispatcher();
    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 0,
        object: remote_entity(10, "Player").locked_by(Some(LOCAL_USER)),
    });
    d.tick();
    let entity = host_entity(&d, ObjectId(10)).unwrap();
    d.context_mut().host.set_field(entity, "name", "Hero".into());
    let report = d.tick();
    assert_eq!(report.reverted, 0);
    assert_eq!(report.sent, 1);
}

#[test]
fn undone_structure_under_a_lock_cannot_be_redone() {
    let (mut d, _log) = locked_entity();
    let parent = host_entity(&d, ObjectId(10)).unwrap();
    let child = d.context_mut().host.spawn(Some(parent));
    d.context_mut().host.poll_changes();

    let report = d.apply_history(
        HistoryKind::Undo,
        vec![HostEvent::Created {
            entity: child,
            parent: Some(parent),
        }],
    );
    assert_eq!(report.reverted, 1);
    assert!(!d.context().host.is_valid(child));
    assert!(d.context().resolver.is_unsafe(child));

    let report = d.apply_history(HistoryKind::Redo, vec![HostEvent::Deleted { entity: child }]);
    assert_eq!(report.suppressed_redos, 1);
    assert_eq!(report.reverted, 0);
    assert!(report.errors.is_empty());
}

/// Random forest of brushes; `parents[i]` picks the parent of node `i + 1` among earlier nodes.
fn forest(parents: &[usize]) -> (ObjectGraph, Vec<ObjectKey>) {
    let mut graph = ObjectGraph::new();
    let mut nodes = Vec::new();
    let root = graph
        .create_remote(
            ObjectId(1),
            ObjectType::TransientBrush,
            None,
            None,
            0,
            ObjectFlags::TRANSIENT,
        )
        .unwrap();
    nodes.push(root);
    for (i, p) in parents.iter().enumerate() {
        let parent = nodes[p % nodes.len()];
        let node = graph
            .create_remote(
                ObjectId(i as u64 + 2),
                ObjectType::TransientBrush,
                None,
                Some(parent),
                usize::MAX,
                ObjectFlags::TRANSIENT,
            )
            .unwrap();
        nodes.push(node);
    }
    (graph, nodes)
}

proptest! {
    #[test]
    fn full_locks_cover_exactly_the_locked_subtree(
        parents in prop::collection::vec(any::<usize>(), 0..40),
        pick in any::<usize>(),
    ) {
        let (mut graph, nodes) = forest(&parents);
        let target = nodes[pick % nodes.len()];
        let mut locks = LockManager::new(LOCAL_USER);
        locks.apply_lock(&mut graph, target, true, Some(OTHER_USER)).unwrap();

        let subtree = graph.descendants(target);
        for node in &nodes {
            let expected = if subtree.contains(node) { LockLevel::Full } else { LockLevel::None };
            prop_assert_eq!(locks.effective_lock(&graph, *node), expected);
            prop_assert_eq!(locks.compute_lock(&graph, *node), expected);
        }

        locks.apply_lock(&mut graph, target, false, None).unwrap();
        for node in &nodes {
            prop_assert_eq!(locks.effective_lock(&graph, *node), LockLevel::None);
        }
    }
}
