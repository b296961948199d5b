use scenesync_core::{
    Error, HostProvider, ObjectId, ObjectKey, OutboundMessage, PropertyTree, RemoteEvent,
    SyncState, Value,
};
use scenesync_test_support::{
    calls_for, host_entity, remote_component, remote_entity, scene_dispatcher, Call,
    RemoteObjectExt, TestDispatcher, HIERARCHY,
};

const SOURCE: &str = "prefab:7";

/// Create a local entity instantiated from `SOURCE`, acknowledged with `id` unless `None`.
fn local_instance(d: &mut TestDispatcher, id: Option<u64>) -> ObjectKey {
    let parent = host_entity(d, HIERARCHY).unwrap();
    d.context_mut().host.spawn_with(
        Some(parent),
        &[("name", "Crate".into()), ("source", SOURCE.into())],
    );
    d.tick();
    let sent = d.context_mut().session.take_sent();
    let Some(OutboundMessage::Create(request)) = sent.first() else {
        panic!("expected a create, got {sent:?}");
    };
    let node = request.object;
    if let Some(id) = id {
        d.context_mut().session.push(RemoteEvent::CreateAck {
            object: node,
            id: ObjectId(id),
        });
        d.tick();
    }
    node
}

#[test]
fn remote_duplicate_with_lower_id_replaces_the_local_copy() {
    let (mut d, log) = scene_dispatcher();
    let local = local_instance(&mut d, Some(11));

    // A component created locally under the copy that is about to lose.
    let local_entity = d.context().entity_of(local).unwrap();
    d.context_mut()
        .host
        .spawn_with(Some(local_entity), &[("component", "Light".into())]);
    d.tick();
    let sent = d.context_mut().session.take_sent();
    let Some(OutboundMessage::Create(request)) = sent.first() else {
        panic!("expected a create, got {sent:?}");
    };
    let light = request.object;
    d.context_mut().session.push(RemoteEvent::CreateAck {
        object: light,
        id: ObjectId(13),
    });
    d.tick();

    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 1,
        object: remote_entity(10, "Crate").with_field("source", SOURCE),
    });
    let report = d.tick();
    assert!(report.errors.is_empty());

    let winner = d.context().get_object(ObjectId(10)).unwrap();
    assert_eq!(d.context().graph.state(local), Some(SyncState::Deleted));
    assert_eq!(d.context().graph.parent(light), Some(winner));
    assert_eq!(
        d.context_mut().session.take_sent(),
        vec![
            OutboundMessage::Parent {
                object: light,
                id: ObjectId(13),
                parent: Some(ObjectId(10)),
                index: 0,
            },
            OutboundMessage::Delete {
                object: local,
                id: ObjectId(11),
            },
        ]
    );

    let ctx = d.context();
    assert!(!ctx.host.is_valid(local_entity));
    let light_entity = ctx.entity_of(light).unwrap();
    assert_eq!(ctx.host.get(light_entity).unwrap().parent, ctx.entity_of(winner));
    assert!(calls_for(&log, light).contains(&Call::Parent(light, 0)));
    assert_eq!(ctx.graph.child_ids(ctx.get_object(HIERARCHY).unwrap()), vec![ObjectId(10)]);
}

#[test]
fn local_duplicate_with_lower_id_wins_and_adopts_children() {
    let (mut d, _log) = scene_dispatcher();
    let local = local_instance(&mut d, Some(5));

    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 1,
        object: remote_entity(7, "Crate")
            .with_field("source", SOURCE)
            .with_child(remote_component(8, "Mesh")),
    });
    let report = d.tick();
    assert!(report.errors.is_empty());

    let ctx = d.context();
    assert_eq!(ctx.get_object(ObjectId(7)), None);
    let mesh = ctx.get_object(ObjectId(8)).unwrap();
    assert_eq!(ctx.graph.parent(mesh), Some(local));
    let mesh_entity = ctx.entity_of(mesh).unwrap();
    assert_eq!(ctx.host.get(mesh_entity).unwrap().parent, ctx.entity_of(local));
    let [parent, delete] = ctx.session.sent.as_slice() else {
        panic!("expected a move and a delete, got {:?}", ctx.session.sent);
    };
    assert_eq!(
        parent,
        &OutboundMessage::Parent {
            object: mesh,
            id: ObjectId(8),
            parent: Some(ObjectId(5)),
            index: 0,
        }
    );
    assert!(matches!(delete, OutboundMessage::Delete { id, .. } if *id == ObjectId(7)));
}

#[test]
fn duplicates_wait_until_both_sides_have_an_id() {
    let (mut d, _log) = scene_dispatcher();
    let local = local_instance(&mut d, None);

    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 1,
        object: remote_entity(7, "Crate").with_field("source", SOURCE),
    });
    let report = d.tick();
    assert_eq!(report.sent, 0);
    assert!(d.context().resolver.is_pending(local));
    assert!(d.context().get_object(ObjectId(7)).is_some());

    d.context_mut().session.push(RemoteEvent::CreateAck {
        object: local,
        id: ObjectId(5),
    });
    let report = d.tick();
    assert!(report.errors.is_empty());
    assert!(!d.context().resolver.is_pending(local));
    assert_eq!(d.context().get_object(ObjectId(7)), None);
    assert_eq!(d.context().graph.state(local), Some(SyncState::Synced));
    assert!(matches!(
        d.context().session.sent.last(),
        Some(OutboundMessage::Delete { id, .. }) if *id == ObjectId(7)
    ));
}

#[test]
fn different_sources_are_not_duplicates() {
    let (mut d, _log) = scene_dispatcher();
    local_instance(&mut d, Some(5));
    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 1,
        object: remote_entity(7, "Crate").with_field("source", "prefab:8"),
    });
    let report = d.tick();
    assert_eq!(report.sent, 0);
    assert!(d.context().get_object(ObjectId(7)).is_some());
}

#[test]
fn dependents_are_destroyed_before_the_entity_they_need() {
    let (mut d, _log) = scene_dispatcher();
    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 0,
        object: remote_entity(10, "Player"),
    });
    d.tick();
    let entity = host_entity(&d, ObjectId(10)).unwrap();
    let host = &mut d.context_mut().host;
    let renderer = host.spawn(None);
    let material = host.spawn(None);
    host.add_dependent(entity, renderer);
    host.add_dependent(renderer, material);
    host.poll_changes();

    d.context_mut()
        .session
        .push(RemoteEvent::Delete { id: ObjectId(10) });
    let report = d.tick();
    assert!(report.errors.is_empty());
    assert!(report.cycles.is_empty());
    assert_eq!(d.context().host.destroyed, vec![material, renderer, entity]);
}

#[test]
fn dependency_cycles_are_reported_and_left_in_place() {
    let (mut d, _log) = scene_dispatcher();
    d.context_mut().session.push(RemoteEvent::Create {
        parent: Some(HIERARCHY),
        index: 0,
        object: remote_entity(10, "Player"),
    });
    d.tick();
    let entity = host_entity(&d, ObjectId(10)).unwrap();
    let host = &mut d.context_mut().host;
    let a = host.spawn(None);
    let b = host.spawn(None);
    host.add_dependent(entity, a);
    host.add_dependent(a, b);
    host.add_dependent(b, a);
    host.poll_changes();

    d.context_mut()
        .session
        .push(RemoteEvent::Delete { id: ObjectId(10) });
    let report = d.tick();
    assert_eq!(report.cycles, vec![vec![a, b]]);
    assert!(matches!(report.errors.as_slice(), [Error::DependencyCycle(_)]));

    let ctx = d.context();
    assert!(ctx.host.is_valid(a));
    assert!(ctx.host.is_valid(b));
    assert!(ctx.host.is_valid(entity));
    assert_eq!(ctx.get_object(ObjectId(10)), None);
    assert_eq!(
        ctx.host.field(entity, "name"),
        Some(&Value::from("Player"))
    );
}

#[test]
fn identity_is_read_from_the_replicated_properties() {
    let (mut d, _log) = scene_dispatcher();
    let local = local_instance(&mut d, Some(5));
    assert_eq!(d.context().resolver.identity(local), Some(SOURCE));
    let root = d.context().graph.property(local).unwrap();
    assert_eq!(
        d.context().graph.properties().export(root).unwrap().field("source"),
        Some(&PropertyTree::from(SOURCE))
    );
}
