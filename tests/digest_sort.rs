use databag::bag::Bag;
use databag::catalog::Value;

fn inventory() -> Bag {
    let bag = Bag::new();
    bag.set_item_with(
        "apple",
        10i64,
        vec![
            ("price".to_string(), Value::Real(1.2)),
            ("kind".to_string(), Value::Text("fruit".into())),
        ],
    )
    .unwrap();
    bag.set_item_with(
        "carrot",
        25i64,
        vec![
            ("price".to_string(), Value::Real(0.4)),
            ("kind".to_string(), Value::Text("vegetable".into())),
        ],
    )
    .unwrap();
    bag.set_item_with(
        "banana",
        5i64,
        vec![
            ("price".to_string(), Value::Real(0.9)),
            ("kind".to_string(), Value::Text("fruit".into())),
        ],
    )
    .unwrap();
    bag
}

#[test]
fn digest_extracts_rows() {
    let bag = inventory();
    let rows = bag.digest("#k,#v,#a.price");
    assert_eq!(rows.len(), 3);
    assert_eq!(
        rows[0],
        vec![
            Value::Text("apple".into()),
            Value::Long(10),
            Value::Real(1.2)
        ]
    );
    // a bare token is an attribute name, a missing attribute is null
    let kinds = bag.digest("kind,#a.missing");
    assert_eq!(kinds[2], vec![Value::Text("fruit".into()), Value::Null]);
}

#[test]
fn digest_reaches_into_nested_bags() {
    let bag = Bag::new();
    bag.set_item("rows.one.qty", 3i64).unwrap();
    bag.set_item("rows.two.qty", 7i64).unwrap();
    let rows = bag.get_bag("rows").unwrap();
    assert_eq!(
        rows.column("#v.qty"),
        vec![Value::Long(3), Value::Long(7)]
    );
}

#[test]
fn digest_with_condition() {
    let bag = inventory();
    let fruit = bag.digest_if("#k", &|n| {
        n.attr("kind") == Some(Value::Text("fruit".into()))
    });
    assert_eq!(fruit.len(), 2);
    assert_eq!(fruit[0][0], Value::Text("apple".into()));
}

#[test]
fn columns_and_sum() {
    let bag = inventory();
    let cols = bag.columns(&["#k", "#v"]);
    assert_eq!(cols[0][1], Value::Text("carrot".into()));
    assert_eq!(cols[1][1], Value::Long(25));
    assert_eq!(bag.sum("#v"), 40.0);
    assert!((bag.sum("#a.price") - 2.5).abs() < 1e-9);
    // non-numeric cells count as zero
    assert_eq!(bag.sum("#a.kind"), 0.0);
}

#[test]
fn sort_by_label_and_attribute() {
    let bag = inventory();
    bag.sort("#k:a");
    assert_eq!(bag.keys(), vec!["apple", "banana", "carrot"]);
    bag.sort("#a.price:a");
    assert_eq!(bag.keys(), vec!["carrot", "banana", "apple"]);
    bag.sort("#a.price:d");
    assert_eq!(bag.keys(), vec!["apple", "banana", "carrot"]);
}

#[test]
fn sort_descending_and_case_insensitive() {
    let bag = Bag::new();
    bag.fill_from(vec![("x", "Beta"), ("y", "alpha"), ("z", "Gamma")]);
    bag.sort("#v:a*");
    assert_eq!(bag.keys(), vec!["y", "x", "z"]);
    bag.sort("#v:d*");
    assert_eq!(bag.keys(), vec!["z", "x", "y"]);
}

#[test]
fn sort_mixed_kinds_never_panics() {
    let bag = Bag::new();
    bag.set_item("a", 2i64).unwrap();
    bag.set_item("b", "text").unwrap();
    bag.set_item("c", 1.5f64).unwrap();
    bag.set_item("d", Value::Null).unwrap();
    bag.sort("#v:a");
    // nulls first, numerics compared across representations, text after
    assert_eq!(bag.keys(), vec!["d", "c", "a", "b"]);
}

#[test]
fn to_tree_groups_by_attributes() {
    let bag = inventory();
    let tree = bag.to_tree(&["kind"]);
    assert_eq!(tree.keys(), vec!["fruit", "vegetable"]);
    let fruit = tree.get_bag("fruit").unwrap();
    assert_eq!(fruit.keys(), vec!["apple", "banana"]);
    assert_eq!(fruit.get_item("banana"), Some(Value::Long(5)));
    // grouping copies, the flat bag stays intact
    assert_eq!(bag.len(), 3);
}

#[test]
fn filter_keeps_structure() {
    let bag = Bag::new();
    bag.set_item("a.big", 100i64).unwrap();
    bag.set_item("a.small", 1i64).unwrap();
    bag.set_item("b.small", 2i64).unwrap();
    let filtered = bag.filter(&|n| matches!(n.static_value(), Value::Long(v) if v > 10));
    assert_eq!(filtered.get_item("a.big"), Some(Value::Long(100)));
    assert_eq!(filtered.get_item("a.small"), None);
    assert_eq!(filtered.get_bag("b"), None);
}

#[test]
fn walk_traverse_and_index_list() {
    let bag = Bag::new();
    bag.set_item("a.b", 1i64).unwrap();
    bag.set_item("a.c", 2i64).unwrap();
    bag.set_item("d", 3i64).unwrap();
    assert_eq!(
        bag.get_index_list(),
        vec!["a", "a.b", "a.c", "d"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
    assert_eq!(bag.traverse().len(), 4);
    // walk short-circuits on the first hit
    let mut visited = 0;
    let hit = bag.walk(&mut |path, _| {
        visited += 1;
        (path == "a.c").then(|| path.to_string())
    });
    assert_eq!(hit.as_deref(), Some("a.c"));
    assert_eq!(visited, 3);
}

#[test]
fn node_lookup_by_attribute() {
    let bag = Bag::new();
    bag.set_item_with(
        "x.deep",
        1i64,
        vec![("id".to_string(), Value::Long(42))],
    )
    .unwrap();
    let node = bag
        .get_node_by_attr("id", &Value::Long(42))
        .expect("node found");
    assert_eq!(node.label(), "deep");
    assert!(bag.get_node_by_attr("id", &Value::Long(7)).is_none());
}

#[test]
fn dict_projections() {
    let bag = Bag::new();
    bag.set_item("a", 1i64).unwrap();
    bag.set_item("n.b", 2i64).unwrap();
    match bag.as_dict_deep() {
        Value::Dict(pairs) => {
            assert_eq!(pairs[0], ("a".to_string(), Value::Long(1)));
            assert_eq!(
                pairs[1],
                (
                    "n".to_string(),
                    Value::Dict(vec![("b".to_string(), Value::Long(2))])
                )
            );
        }
        other => panic!("expected dict, got {:?}", other),
    }
}
