use proptest::prelude::*;
use scenesync_core::{ObjectId, PropertyDelta, PropertyStore, PropertyTree, Value};

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<u64>().prop_map(Value::UInt),
        (-1.0e6f64..1.0e6).prop_map(Value::Float),
        "[a-z ]{0,12}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..8).prop_map(Value::Bytes),
        (1u64..32).prop_map(|id| Value::Reference(ObjectId(id))),
    ]
}

fn tree() -> impl Strategy<Value = PropertyTree> {
    value()
        .prop_map(PropertyTree::Value)
        .prop_recursive(4, 64, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(PropertyTree::List),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..6)
                    .prop_map(PropertyTree::Dictionary),
            ]
        })
}

fn count_references(tree: &PropertyTree, target: ObjectId) -> usize {
    match tree {
        PropertyTree::Value(v) => usize::from(v.as_reference() == Some(target)),
        PropertyTree::List(items) => items.iter().map(|t| count_references(t, target)).sum(),
        PropertyTree::Dictionary(fields) => {
            fields.values().map(|t| count_references(t, target)).sum()
        }
    }
}

proptest! {
    #[test]
    fn import_then_export_preserves_the_tree(tree in tree()) {
        let mut store = PropertyStore::new();
        let root = store.import(&tree);
        prop_assert_eq!(store.export(root).unwrap(), tree.clone());
        prop_assert!(!store.has_changes());

        for target in 1..32 {
            let target = ObjectId(target);
            prop_assert_eq!(store.references_to(target).len(), count_references(&tree, target));
        }

        store.release(root).unwrap();
        prop_assert!(store.is_empty());
        prop_assert!(store.references_to(ObjectId(1)).is_empty());
    }

    #[test]
    fn recorded_changes_replay_on_a_mirror(
        initial in prop::collection::btree_map("[a-c]", tree(), 0..4),
        edits in prop::collection::vec(("[a-e]", tree()), 1..8),
    ) {
        let initial = PropertyTree::Dictionary(initial);
        let mut store = PropertyStore::new();
        let mut mirror = PropertyStore::new();
        let root = store.import(&initial);
        let mirror_root = mirror.import(&initial);

        for (field, value) in &edits {
            store.set(root, field, value).unwrap();
        }
        for change in store.take_changes() {
            mirror.apply_delta(mirror_root, &PropertyDelta::from_change(&change)).unwrap();
        }
        prop_assert_eq!(mirror.export(mirror_root).unwrap(), store.export(root).unwrap());
    }
}

#[test]
fn list_edits_replay_in_order() {
    let mut store = PropertyStore::new();
    let mut mirror = PropertyStore::new();
    let tree = PropertyTree::dictionary([(
        "points",
        PropertyTree::list([1i64.into(), 2i64.into(), 3i64.into()]),
    )]);
    let root = store.import(&tree);
    let mirror_root = mirror.import(&tree);

    let points = store.get(root, "points").unwrap();
    store.insert(points, 1, &[10i64.into(), 11i64.into()]).unwrap();
    store.remove_range(points, 0, 1).unwrap();
    store.set_element(points, 2, &PropertyTree::from(20i64)).unwrap();
    store.push(points, &PropertyTree::from(30i64)).unwrap();

    for change in store.take_changes() {
        mirror
            .apply_delta(mirror_root, &PropertyDelta::from_change(&change))
            .unwrap();
    }
    let expected = PropertyTree::dictionary([(
        "points",
        PropertyTree::list([
            10i64.into(),
            11i64.into(),
            20i64.into(),
            3i64.into(),
            30i64.into(),
        ]),
    )]);
    assert_eq!(store.export(root).unwrap(), expected);
    assert_eq!(mirror.export(mirror_root).unwrap(), expected);
}

#[cfg(feature = "serde")]
#[test]
fn remote_events_survive_json() {
    use scenesync_core::{ObjectType, PropertyPath, RemoteEvent, RemoteObject, UserId};

    let events = vec![
        RemoteEvent::Create {
            parent: Some(ObjectId(2)),
            index: 1,
            object: RemoteObject::new(
                ObjectId(10),
                ObjectType::Entity,
                PropertyTree::dictionary([
                    ("name", PropertyTree::from("Player")),
                    ("speed", PropertyTree::from(1.5)),
                    ("mesh", PropertyTree::from(ObjectId(31))),
                ]),
            )
            .locked_by(Some(UserId(2))),
        },
        RemoteEvent::Property {
            id: ObjectId(10),
            delta: PropertyDelta::ListRemove {
                path: PropertyPath::field("points"),
                index: 0,
                count: 2,
            },
        },
        RemoteEvent::Delete { id: ObjectId(10) },
    ];
    let json = serde_json::to_string(&events).unwrap();
    let back: Vec<RemoteEvent> = serde_json::from_str(&json).unwrap();
    assert_eq!(back, events);
}
