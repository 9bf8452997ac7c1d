use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::str::FromStr;

use databag::bag::Bag;
use databag::catalog::Value;
use databag::resolve::Resolver;

fn sample() -> Bag {
    let bag = Bag::new();
    bag.set_item("name", "office").unwrap();
    bag.set_item_with(
        "rooms.red.desk",
        "oak",
        vec![("bought".to_string(), Value::Date(NaiveDate::from_ymd_opt(2020, 1, 2).unwrap()))],
    )
    .unwrap();
    bag.set_item(
        "budget",
        Value::Decimal(BigDecimal::from_str("1234.56").unwrap()),
    )
    .unwrap();
    bag.set_item(
        "tags",
        Value::List(vec![Value::Text("a".into()), Value::Long(1)]),
    )
    .unwrap();
    bag
}

#[test]
fn pickled_bags_round_trip() {
    let bag = sample();
    let bytes = bag.pickle().unwrap();
    let back = Bag::unpickle(&bytes).unwrap();
    assert_eq!(back, bag);
}

#[test]
fn locked_nodes_stay_locked() {
    let bag = sample();
    bag.get_node("name").unwrap().lock();
    let back = Bag::unpickle(&bag.pickle().unwrap()).unwrap();
    let node = back.get_node("name").unwrap();
    assert!(node.is_locked());
    assert!(node.set_value(Value::Text("x".into())).is_err());
}

#[test]
fn backref_mode_is_rewired_on_unpickle() {
    let bag = sample();
    bag.set_backref();
    let back = Bag::unpickle(&bag.pickle().unwrap()).unwrap();
    assert!(back.backref());
    let inner = back.get_bag("rooms.red").unwrap();
    assert_eq!(inner.fullpath().as_deref(), Some("rooms.red"));
    assert_eq!(inner.get_item("#^.red.desk"), Some(Value::Text("oak".into())));
}

#[test]
fn plain_bags_come_back_without_backref() {
    let back = Bag::unpickle(&sample().pickle().unwrap()).unwrap();
    assert!(!back.backref());
    assert!(back.get_bag("rooms").unwrap().parent().is_none());
}

#[test]
fn resolver_nodes_pickle_their_last_value() {
    let bag = sample();
    let node = bag.set_item("lazy", Value::Null).unwrap();
    node.set_resolver(Resolver::callback(-1.0, |_| Ok(Value::Long(7))));
    // not materialized yet, so the static null travels
    let back = Bag::unpickle(&bag.pickle().unwrap()).unwrap();
    assert_eq!(back.get_item("lazy"), Some(Value::Null));
    // once resolved the value is part of the tree
    assert_eq!(bag.get_item("lazy"), Some(Value::Long(7)));
    let back = Bag::unpickle(&bag.pickle().unwrap()).unwrap();
    assert_eq!(back.get_item("lazy"), Some(Value::Long(7)));
    assert!(!back.get_node("lazy").unwrap().has_resolver());
}

#[test]
fn make_picklable_detaches_upward_pointers() {
    let bag = sample();
    bag.set_backref();
    let inner = bag.get_bag("rooms.red").unwrap();
    assert!(inner.parent().is_some());
    bag.make_picklable();
    assert!(inner.parent().is_none());
    bag.restore_from_picklable();
    assert!(inner.parent().is_some());
    assert_eq!(inner.fullpath().as_deref(), Some("rooms.red"));
}
