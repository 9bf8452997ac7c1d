use std::cell::RefCell;
use std::rc::Rc;

use databag::bag::{Bag, EventKind};
use databag::catalog::Value;
use databag::node::ChangeReason;

#[derive(Clone, Default)]
struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    fn push(&self, entry: String) {
        self.0.borrow_mut().push(entry);
    }
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.0.borrow_mut())
    }
}

#[test]
fn subscribe_enables_backref() {
    let bag = Bag::new();
    assert!(!bag.backref());
    bag.subscribe_update("watch", |_| {});
    assert!(bag.backref());
}

#[test]
fn path_creation_fires_one_insert_per_node() {
    let bag = Bag::new();
    let log = Log::default();
    {
        let log = log.clone();
        bag.subscribe_insert("watch", move |ev| log.push(ev.pathname()));
    }
    bag.set_item("a.b.c", 1i64).unwrap();
    assert_eq!(log.take(), vec!["a", "a.b", "a.b.c"]);
}

#[test]
fn update_events_climb_with_full_path() {
    let bag = Bag::new();
    bag.set_item("a.b.c", 1i64).unwrap();
    let log = Log::default();
    {
        let log = log.clone();
        bag.subscribe_update("watch", move |ev| {
            log.push(format!("{}={:?}", ev.pathname(), ev.old_value));
        });
    }
    bag.set_item("a.b.c", 2i64).unwrap();
    assert_eq!(log.take(), vec!["a.b.c=Some(Long(1))"]);
}

#[test]
fn rewriting_the_same_value_is_silent() {
    let bag = Bag::new();
    bag.set_item("a", 1i64).unwrap();
    let log = Log::default();
    {
        let log = log.clone();
        bag.subscribe_update("watch", move |ev| log.push(ev.pathname()));
    }
    bag.set_item("a", 1i64).unwrap();
    assert_eq!(log.take(), Vec::<String>::new());
    bag.set_item("a", 2i64).unwrap();
    assert_eq!(log.take(), vec!["a"]);

    // node subscribers obey the same change gate
    let node = bag.get_node("a").unwrap();
    let changes = Log::default();
    {
        let changes = changes.clone();
        node.subscribe("watch", move |ch| {
            changes.push(format!("{:?}", ch.reason));
        });
    }
    node.set_value(2i64).unwrap();
    assert_eq!(changes.take(), Vec::<String>::new());
    node.set_value(3i64).unwrap();
    assert_eq!(changes.take(), vec!["Value"]);
}

#[test]
fn clear_fires_a_delete_per_node() {
    let bag = Bag::new();
    bag.set_item("x", 1i64).unwrap();
    bag.set_item("y", 2i64).unwrap();
    let log = Log::default();
    {
        let log = log.clone();
        bag.subscribe_delete("watch", move |ev| {
            log.push(format!("{}@{:?}", ev.pathname(), ev.index));
        });
    }
    bag.clear();
    assert!(bag.is_empty());
    assert_eq!(log.take(), vec!["x@Some(0)", "y@Some(1)"]);
}

#[test]
fn inner_subscriber_sees_relative_path() {
    let bag = Bag::new();
    bag.set_item("a.b.c", 1i64).unwrap();
    bag.set_backref();
    let inner = bag.get_bag("a").unwrap();
    let log = Log::default();
    {
        let log = log.clone();
        inner.subscribe_update("watch", move |ev| log.push(ev.pathname()));
    }
    bag.set_item("a.b.c", 2i64).unwrap();
    assert_eq!(log.take(), vec!["b.c"]);
}

#[test]
fn delete_events_carry_the_index() {
    let bag = Bag::new();
    bag.set_item("x", 1i64).unwrap();
    bag.set_item("y", 2i64).unwrap();
    let log = Log::default();
    {
        let log = log.clone();
        bag.subscribe_delete("watch", move |ev| {
            log.push(format!("{}@{:?}", ev.pathname(), ev.index));
        });
    }
    assert_eq!(bag.pop("x"), Some(Value::Long(1)));
    assert_eq!(log.take(), vec!["x@Some(0)"]);
}

#[test]
fn any_subscriber_sees_every_kind() {
    let bag = Bag::new();
    let kinds = Rc::new(RefCell::new(Vec::new()));
    {
        let kinds = kinds.clone();
        bag.subscribe_any("watch", move |ev| kinds.borrow_mut().push(ev.kind));
    }
    bag.set_item("x", 1i64).unwrap();
    bag.set_item("x", 2i64).unwrap();
    bag.pop("x");
    assert_eq!(
        *kinds.borrow(),
        vec![EventKind::Insert, EventKind::Update, EventKind::Delete]
    );
}

#[test]
fn unsubscribe_stops_delivery() {
    let bag = Bag::new();
    let log = Log::default();
    {
        let log = log.clone();
        bag.subscribe_update("watch", move |ev| log.push(ev.pathname()));
    }
    bag.set_item("x", 1i64).unwrap();
    bag.set_item("x", 2i64).unwrap();
    bag.unsubscribe("watch");
    bag.set_item("x", 3i64).unwrap();
    assert_eq!(log.take(), vec!["x"]);
}

#[test]
fn node_subscribers_see_value_and_attribute_changes() {
    let bag = Bag::new();
    let node = bag.set_item("x", 1i64).unwrap();
    let log = Log::default();
    {
        let log = log.clone();
        node.subscribe("watch", move |ch| {
            let what = match ch.reason {
                ChangeReason::Value => "value",
                ChangeReason::Attributes => "attr",
            };
            log.push(format!("{}:{:?}", what, ch.old_value));
        });
    }
    node.set_value(Value::Long(2)).unwrap();
    node.set_attr([("color".to_string(), Value::Text("red".into()))])
        .unwrap();
    assert_eq!(log.take(), vec!["value:Some(Long(1))", "attr:None"]);
}

#[test]
fn parent_chain_and_fullpath() {
    let bag = Bag::new();
    bag.set_item("a.b.c", 1i64).unwrap();
    bag.set_backref();
    let inner = bag.get_bag("a.b").unwrap();
    assert_eq!(inner.fullpath().as_deref(), Some("a.b"));
    assert_eq!(inner.parent_node().map(|n| n.label()).as_deref(), Some("b"));
    let top = inner.parent().and_then(|p| p.parent()).unwrap();
    assert_eq!(top, bag);
    assert!(bag.fullpath().is_none());
}

#[test]
fn clear_backref_stops_the_climb() {
    let bag = Bag::new();
    bag.set_item("a.b", 1i64).unwrap();
    let log = Log::default();
    {
        let log = log.clone();
        bag.subscribe_update("watch", move |ev| log.push(ev.pathname()));
    }
    bag.set_item("a.b", 2i64).unwrap();
    assert_eq!(log.take(), vec!["a.b"]);
    bag.clear_backref();
    bag.get_bag("a").unwrap().set_item("b", 3i64).unwrap();
    assert!(log.take().is_empty());
}

#[test]
fn parent_is_gone_after_the_root_drops()
{
    let inner = {
        let bag = Bag::new();
        bag.set_item("a.b", 1i64).unwrap();
        bag.set_backref();
        bag.get_bag("a").unwrap()
    };
    // weak upward pointers do not keep the dropped root alive
    assert!(inner.parent().is_none());
    assert_eq!(inner.get_item("b"), Some(Value::Long(1)));
}
