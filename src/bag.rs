//! The ordered, hierarchical, attributed container.
//!
//! A [`Bag`] is a cheap-to-clone handle: `clone()` aliases the same
//! underlying store, `deep_copy()` makes an independent one. Nodes keep
//! their insertion order and labels may repeat. Nested bags form a
//! tree addressable through the dotted path language of [`crate::path`].
//!
//! Bags are single-threaded by construction (`Rc` inside), which is
//! what makes the synchronous event delivery and the resolver cache
//! contract race-free.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::str::FromStr;

use bigdecimal::BigDecimal;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::{LabelHasher, Value};
use crate::error::{BagError, Result};
use crate::node::{BagNode, NodeInner, Validator};
use crate::path::{escape_label, join_path, split_path, Position, Segment};
use crate::resolve::{ResolveContext, Resolver};

// ------------- Events --------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EventKind {
    Update,
    Insert,
    Delete,
}

/// What bag subscribers receive. `path` is relative to the bag the
/// subscriber sits on and grows while the event climbs toward the root.
pub struct BagEvent {
    pub kind: EventKind,
    pub path: Vec<String>,
    pub node: BagNode,
    pub old_value: Option<Value>,
    pub index: Option<usize>,
}

impl BagEvent {
    pub fn pathname(&self) -> String {
        join_path(self.path.iter())
    }
}

pub type EventCallback = Rc<RefCell<dyn FnMut(&BagEvent)>>;

#[derive(Default)]
struct Subscriber {
    update: Option<EventCallback>,
    insert: Option<EventCallback>,
    delete: Option<EventCallback>,
    any: Option<EventCallback>,
}

// ------------- Bag --------------

pub(crate) struct BagInner {
    nodes: Vec<BagNode>,
    backref: bool,
    parent: Option<Weak<RefCell<BagInner>>>,
    parent_node: Option<Weak<RefCell<NodeInner>>>,
    subscribers: HashMap<String, Subscriber, LabelHasher>,
}

#[derive(Clone)]
pub struct Bag(pub(crate) Rc<RefCell<BagInner>>);

impl Default for Bag {
    fn default() -> Self {
        Bag::new()
    }
}

impl Bag {
    pub fn new() -> Bag {
        Bag(Rc::new(RefCell::new(BagInner {
            nodes: Vec::new(),
            backref: false,
            parent: None,
            parent_node: None,
            subscribers: HashMap::default(),
        })))
    }

    /// Seed a bag from `(label, value)` pairs, appended in order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Bag
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let bag = Bag::new();
        bag.fill_from(pairs);
        bag
    }

    pub fn fill_from<I, K, V>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        for (k, v) in pairs {
            let node = BagNode::new(k.into(), v.into());
            let _ = self.insert_node(node, Position::End);
        }
    }

    pub(crate) fn from_rc(rc: Rc<RefCell<BagInner>>) -> Bag {
        Bag(rc)
    }

    fn downgrade(&self) -> Weak<RefCell<BagInner>> {
        Rc::downgrade(&self.0)
    }

    // ---- basic access ----

    pub fn len(&self) -> usize {
        self.0.borrow().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().nodes.is_empty()
    }

    /// Node handles in order. The handles alias the stored nodes.
    pub fn nodes(&self) -> Vec<BagNode> {
        self.0.borrow().nodes.clone()
    }

    pub fn node_at(&self, index: usize) -> Option<BagNode> {
        self.0.borrow().nodes.get(index).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().nodes.iter().map(|n| n.label()).collect()
    }

    /// Resolved values in order; a failing resolver yields `Null` with
    /// a logged warning.
    pub fn values(&self) -> Vec<Value> {
        self.nodes().iter().map(|n| n.value_or_null()).collect()
    }

    pub fn items(&self) -> Vec<(String, Value)> {
        self.nodes()
            .iter()
            .map(|n| (n.label(), n.value_or_null()))
            .collect()
    }

    // ---- path reads ----

    fn find(&self, segment: &Segment) -> Option<BagNode> {
        let inner = self.0.borrow();
        match segment {
            Segment::Label(l) => inner.nodes.iter().find(|n| n.label() == *l).cloned(),
            Segment::Index(i) => inner.nodes.get(*i).cloned(),
            Segment::Attr { name, value } => inner
                .nodes
                .iter()
                .find(|n| n.attr(name).map(|v| v.to_string()).as_deref() == Some(value))
                .cloned(),
            Segment::Parent => None,
        }
    }

    /// Walk segments down to the bag that owns the final segment,
    /// optionally materializing missing labels as empty bags. A non-bag
    /// value in the middle of the walk is replaced by a bag when
    /// autocreating, otherwise the walk just misses.
    fn locate_bag(&self, segments: &[Segment], autocreate: bool) -> Result<Option<Bag>> {
        let mut cur = self.clone();
        for segment in segments {
            if let Segment::Parent = segment {
                match cur.parent() {
                    Some(p) => {
                        cur = p;
                        continue;
                    }
                    None => return Ok(None),
                }
            }
            let node = match cur.find(segment) {
                Some(n) => n,
                None => {
                    if !autocreate {
                        return Ok(None);
                    }
                    match segment {
                        Segment::Label(l) => {
                            let node = BagNode::new(l.clone(), Value::Bag(Bag::new()));
                            cur.insert_node(node.clone(), Position::End)?;
                            node
                        }
                        _ => {
                            return Err(BagError::Path(format!(
                                "cannot autocreate through segment '{:?}'",
                                segment
                            )))
                        }
                    }
                }
            };
            match node.get_value()? {
                Value::Bag(b) => cur = b,
                _ if autocreate => {
                    let b = Bag::new();
                    node.set_value(Value::Bag(b.clone()))?;
                    cur = b;
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    /// Resolve a path to `(owning bag, node)`.
    fn locate(&self, path: &str, autocreate: bool) -> Result<Option<(Bag, BagNode)>> {
        let raw = split_path(path);
        if raw.is_empty() {
            return Ok(None);
        }
        let mut segments = Vec::with_capacity(raw.len());
        for r in &raw {
            segments.push(Segment::parse(r)?);
        }
        let (head, last) = segments.split_at(segments.len() - 1);
        let owner = match self.locate_bag(head, autocreate)? {
            Some(b) => b,
            None => return Ok(None),
        };
        match owner.find(&last[0]) {
            Some(node) => Ok(Some((owner, node))),
            None if autocreate => match &last[0] {
                Segment::Label(l) => {
                    let node = BagNode::new(l.clone(), Value::Null);
                    owner.insert_node(node.clone(), Position::End)?;
                    Ok(Some((owner, node)))
                }
                seg => Err(BagError::Path(format!(
                    "cannot autocreate node for segment '{:?}'",
                    seg
                ))),
            },
            None => Ok(None),
        }
    }

    /// Read a value. A `?name` suffix reads the node's attribute
    /// instead; a bare `?` (or `?k`) switches to the keys of the
    /// addressed bag, `?d:what` to its digest. Missing paths yield
    /// `Ok(None)`; resolver failures propagate.
    pub fn try_get_item(&self, path: &str) -> Result<Option<Value>> {
        if let Some((node_path, mode)) = path.split_once('?') {
            if mode.is_empty() || mode == "k" || mode.starts_with("d:") {
                let owner = if split_path(node_path).is_empty() {
                    Some(self.clone())
                } else {
                    match self.locate(node_path, false)? {
                        Some((_, n)) => match n.get_value()? {
                            Value::Bag(b) => Some(b),
                            _ => None,
                        },
                        None => None,
                    }
                };
                let owner = match owner {
                    Some(b) => b,
                    None => return Ok(None),
                };
                if let Some(what) = mode.strip_prefix("d:") {
                    let rows = owner.digest(what);
                    let value = if what.contains(',') {
                        Value::List(rows.into_iter().map(Value::List).collect())
                    } else {
                        Value::List(rows.into_iter().flatten().collect())
                    };
                    return Ok(Some(value));
                }
                return Ok(Some(Value::List(
                    owner.keys().into_iter().map(Value::Text).collect(),
                )));
            }
            let node = match self.locate(node_path, false)? {
                Some((_, n)) => n,
                None => return Ok(None),
            };
            return Ok(node.attr(mode));
        }
        match self.locate(path, false)? {
            Some((_, node)) => node.get_value().map(Some),
            None => Ok(None),
        }
    }

    /// Infallible read: missing paths and bad segments give `None`;
    /// resolver failures are logged and give `None`. Use
    /// [`Bag::try_get_item`] when the failure itself matters.
    pub fn get_item(&self, path: &str) -> Option<Value> {
        match self.try_get_item(path) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, path, "read failed");
                None
            }
        }
    }

    pub fn get_or(&self, path: &str, default: Value) -> Value {
        self.get_item(path).unwrap_or(default)
    }

    pub fn get_bag(&self, path: &str) -> Option<Bag> {
        match self.get_item(path) {
            Some(Value::Bag(b)) => Some(b),
            _ => None,
        }
    }

    /// The node at a path, without resolving its value.
    pub fn get_node(&self, path: &str) -> Option<BagNode> {
        self.locate(path, false).ok().flatten().map(|(_, n)| n)
    }

    pub fn get_attr(&self, path: &str, name: &str) -> Option<Value> {
        self.get_node(path).and_then(|n| n.attr(name))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get_node(path).is_some()
    }

    // ---- path writes ----

    /// Set a value at a path, autocreating intermediate bags. Returns
    /// the written node.
    pub fn set_item(&self, path: &str, value: impl Into<Value>) -> Result<BagNode> {
        self.set_item_full(path, value.into(), Vec::new(), None)
    }

    pub fn set_item_with(
        &self,
        path: &str,
        value: impl Into<Value>,
        attrs: Vec<(String, Value)>,
    ) -> Result<BagNode> {
        self.set_item_full(path, value.into(), attrs, None)
    }

    pub fn set_item_at(
        &self,
        path: &str,
        value: impl Into<Value>,
        position: Position,
    ) -> Result<BagNode> {
        self.set_item_full(path, value.into(), Vec::new(), Some(position))
    }

    pub fn set_item_full(
        &self,
        path: &str,
        value: Value,
        attrs: Vec<(String, Value)>,
        position: Option<Position>,
    ) -> Result<BagNode> {
        let raw = split_path(path);
        if raw.is_empty() {
            return Err(BagError::Path("empty path".into()));
        }
        let mut segments = Vec::with_capacity(raw.len());
        for r in &raw {
            segments.push(Segment::parse(r)?);
        }
        let (head, last) = segments.split_at(segments.len() - 1);
        let owner = self.locate_bag(head, true)?.ok_or_else(|| {
            BagError::Path(format!("cannot reach parent of '{}'", path))
        })?;
        match owner.find(&last[0]) {
            Some(node) => {
                node.set_value(value)?;
                if !attrs.is_empty() {
                    node.set_attr(attrs)?;
                }
                Ok(node)
            }
            None => match &last[0] {
                Segment::Label(l) => {
                    let node = BagNode::new(l.clone(), value);
                    if !attrs.is_empty() {
                        node.0.borrow_mut().attr =
                            attrs.into_iter().filter(|(_, v)| *v != Value::Null).collect();
                    }
                    owner.insert_node(node.clone(), position.unwrap_or_default())?;
                    Ok(node)
                }
                seg => Err(BagError::Path(format!(
                    "cannot create node for segment '{:?}'",
                    seg
                ))),
            },
        }
    }

    /// Append a new node even when the label already exists.
    pub fn add_item(&self, path: &str, value: impl Into<Value>) -> Result<BagNode> {
        self.add_item_with(path, value, Vec::new())
    }

    pub fn add_item_with(
        &self,
        path: &str,
        value: impl Into<Value>,
        attrs: Vec<(String, Value)>,
    ) -> Result<BagNode> {
        let raw = split_path(path);
        if raw.is_empty() {
            return Err(BagError::Path("empty path".into()));
        }
        let mut segments = Vec::with_capacity(raw.len());
        for r in &raw {
            segments.push(Segment::parse(r)?);
        }
        let (head, last) = segments.split_at(segments.len() - 1);
        let owner = self.locate_bag(head, true)?.ok_or_else(|| {
            BagError::Path(format!("cannot reach parent of '{}'", path))
        })?;
        match &last[0] {
            Segment::Label(l) => {
                let node = BagNode::new(l.clone(), value.into());
                if !attrs.is_empty() {
                    node.0.borrow_mut().attr =
                        attrs.into_iter().filter(|(_, v)| *v != Value::Null).collect();
                }
                owner.insert_node(node.clone(), Position::End)?;
                Ok(node)
            }
            seg => Err(BagError::Path(format!(
                "cannot add node for segment '{:?}'",
                seg
            ))),
        }
    }

    /// Set attributes on a node, autocreating it (with a null value)
    /// when missing.
    pub fn set_attr_item<I, K>(&self, path: &str, attrs: I) -> Result<BagNode>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let (_, node) = self
            .locate(path, true)?
            .ok_or_else(|| BagError::Path(format!("cannot reach '{}'", path)))?;
        node.set_attr(attrs)?;
        Ok(node)
    }

    /// Existing value at the path, or store the given one and return it.
    pub fn set_default(&self, path: &str, value: impl Into<Value>) -> Result<Value> {
        if let Some(existing) = self.try_get_item(path)? {
            return Ok(existing);
        }
        let value = value.into();
        self.set_item(path, value.clone())?;
        Ok(value)
    }

    /// Remove the node at a path and hand it back.
    pub fn pop_node(&self, path: &str) -> Option<BagNode> {
        let (bag, node) = self.locate(path, false).ok().flatten()?;
        let idx = {
            let inner = bag.0.borrow();
            inner.nodes.iter().position(|n| Rc::ptr_eq(&n.0, &node.0))?
        };
        bag.0.borrow_mut().nodes.remove(idx);
        node.set_parent_bag(None);
        bag.notify_delete(&node, idx);
        Some(node)
    }

    /// Remove the node at a path, returning its (unresolved) value.
    pub fn pop(&self, path: &str) -> Option<Value> {
        self.pop_node(path).map(|n| n.static_value())
    }

    pub fn del_item(&self, path: &str) -> Option<Value> {
        self.pop(path)
    }

    pub fn clear(&self) {
        let removed = std::mem::take(&mut self.0.borrow_mut().nodes);
        for (idx, node) in removed.into_iter().enumerate() {
            node.set_parent_bag(None);
            self.notify_delete(&node, idx);
        }
    }

    // ---- node insertion ----

    pub(crate) fn insert_node(&self, node: BagNode, position: Position) -> Result<usize> {
        let idx = {
            let inner = self.0.borrow();
            let len = inner.nodes.len();
            match &position {
                Position::Start => 0,
                Position::End => len,
                Position::Index(i) => (*i).min(len),
                Position::BeforeIndex(i) => (*i).min(len),
                Position::AfterIndex(i) => (i + 1).min(len),
                Position::BeforeLabel(l) => inner
                    .nodes
                    .iter()
                    .position(|n| n.label() == *l)
                    .unwrap_or(len),
                Position::AfterLabel(l) => inner
                    .nodes
                    .iter()
                    .position(|n| n.label() == *l)
                    .map(|p| p + 1)
                    .unwrap_or(len),
            }
        };
        if self.backref() {
            node.set_parent_bag(Some(self.downgrade()));
            node.link_child_bag();
        }
        self.0.borrow_mut().nodes.insert(idx, node.clone());
        self.notify_insert(&node, idx);
        Ok(idx)
    }

    // ---- backref ----

    pub fn backref(&self) -> bool {
        self.0.borrow().backref
    }

    /// Enable upward pointers (parent bag / parent node) on this bag
    /// and everything below it. Required for event propagation and the
    /// `#^` path segment.
    pub fn set_backref(&self) {
        self.0.borrow_mut().backref = true;
        for node in self.nodes() {
            node.set_parent_bag(Some(self.downgrade()));
            node.link_child_bag();
        }
    }

    /// Drop all upward pointers below (and on) this bag.
    pub fn clear_backref(&self) {
        {
            let mut inner = self.0.borrow_mut();
            inner.backref = false;
            inner.parent = None;
            inner.parent_node = None;
        }
        for node in self.nodes() {
            node.set_parent_bag(None);
            if let Value::Bag(child) = node.static_value() {
                child.clear_backref();
            }
        }
    }

    /// Wire this bag under `parent` through `node`, recursively. Used
    /// when a bag value lands in a backref'd tree.
    pub(crate) fn adopt(&self, parent: &Bag, node: &BagNode) {
        {
            let mut inner = self.0.borrow_mut();
            inner.backref = true;
            inner.parent = Some(Rc::downgrade(&parent.0));
            inner.parent_node = Some(Rc::downgrade(&node.0));
        }
        for child in self.nodes() {
            child.set_parent_bag(Some(self.downgrade()));
            child.link_child_bag();
        }
    }

    pub fn parent(&self) -> Option<Bag> {
        self.0
            .borrow()
            .parent
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(Bag::from_rc)
    }

    pub fn parent_node(&self) -> Option<BagNode> {
        self.0
            .borrow()
            .parent_node
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(BagNode)
    }

    /// Dotted path of this bag from the root, `None` at the root.
    pub fn fullpath(&self) -> Option<String> {
        let node = self.parent_node()?;
        let mut parts = vec![node.label()];
        let mut bag = node.parent_bag();
        while let Some(b) = bag {
            match b.parent_node() {
                Some(pn) => {
                    parts.insert(0, pn.label());
                    bag = pn.parent_bag();
                }
                None => break,
            }
        }
        Some(join_path(parts))
    }

    // ---- subscriptions ----

    fn with_subscriber<F: FnOnce(&mut Subscriber)>(&self, id: &str, f: F) {
        self.set_backref();
        let mut inner = self.0.borrow_mut();
        f(inner.subscribers.entry(id.to_string()).or_default());
    }

    /// Value and attribute changes anywhere below this bag. Subscribing
    /// enables backref mode. Mutating the tree from inside a callback
    /// is a contract violation and panics on the interior borrow.
    pub fn subscribe_update<F: FnMut(&BagEvent) + 'static>(&self, id: &str, f: F) {
        self.with_subscriber(id, |s| s.update = Some(Rc::new(RefCell::new(f))));
    }

    pub fn subscribe_insert<F: FnMut(&BagEvent) + 'static>(&self, id: &str, f: F) {
        self.with_subscriber(id, |s| s.insert = Some(Rc::new(RefCell::new(f))));
    }

    pub fn subscribe_delete<F: FnMut(&BagEvent) + 'static>(&self, id: &str, f: F) {
        self.with_subscriber(id, |s| s.delete = Some(Rc::new(RefCell::new(f))));
    }

    pub fn subscribe_any<F: FnMut(&BagEvent) + 'static>(&self, id: &str, f: F) {
        self.with_subscriber(id, |s| s.any = Some(Rc::new(RefCell::new(f))));
    }

    pub fn unsubscribe(&self, id: &str) {
        self.0.borrow_mut().subscribers.remove(id);
    }

    pub(crate) fn notify_update(&self, node: &BagNode, old_value: Option<Value>) {
        self.deliver(BagEvent {
            kind: EventKind::Update,
            path: vec![node.label()],
            node: node.clone(),
            old_value,
            index: None,
        });
    }

    fn notify_insert(&self, node: &BagNode, index: usize) {
        self.deliver(BagEvent {
            kind: EventKind::Insert,
            path: vec![node.label()],
            node: node.clone(),
            old_value: None,
            index: Some(index),
        });
    }

    fn notify_delete(&self, node: &BagNode, index: usize) {
        self.deliver(BagEvent {
            kind: EventKind::Delete,
            path: vec![node.label()],
            node: node.clone(),
            old_value: None,
            index: Some(index),
        });
    }

    /// Deliver to local subscribers, then climb the parent chain,
    /// prefixing each parent node's label onto the event path.
    fn deliver(&self, mut event: BagEvent) {
        let mut cur = self.clone();
        loop {
            let callbacks: Vec<EventCallback> = {
                let inner = cur.0.borrow();
                inner
                    .subscribers
                    .values()
                    .flat_map(|s| {
                        let slot = match event.kind {
                            EventKind::Update => &s.update,
                            EventKind::Insert => &s.insert,
                            EventKind::Delete => &s.delete,
                        };
                        slot.iter().chain(s.any.iter()).cloned().collect::<Vec<_>>()
                    })
                    .collect()
            };
            if !callbacks.is_empty() {
                debug!(kind = ?event.kind, path = %event.pathname(), "bag event");
            }
            for cb in callbacks {
                (cb.borrow_mut())(&event);
            }
            let (parent, label) = {
                let inner = cur.0.borrow();
                let parent = inner.parent.as_ref().and_then(|w| w.upgrade());
                let label = inner
                    .parent_node
                    .as_ref()
                    .and_then(|w| w.upgrade())
                    .map(|n| n.borrow().label.clone());
                (parent, label)
            };
            match (parent, label) {
                (Some(p), Some(l)) => {
                    event.path.insert(0, l);
                    cur = Bag::from_rc(p);
                }
                _ => break,
            }
        }
    }

    // ---- structure ops ----

    pub fn deep_copy(&self) -> Bag {
        let out = Bag::new();
        for node in self.nodes() {
            let _ = out.insert_node(node.deep_copy(), Position::End);
        }
        out
    }

    /// Recursive in-place merge: same-labeled bags merge, everything
    /// else is overwritten or appended. Attributes of matched nodes are
    /// updated pairwise.
    pub fn update(&self, other: &Bag) -> Result<()> {
        for onode in other.nodes() {
            let (label, value, attrs) = onode.as_tuple();
            match self.find(&Segment::Label(label)) {
                Some(mine) => {
                    match (mine.static_value(), value) {
                        (Value::Bag(a), Value::Bag(b)) => a.update(&b)?,
                        (_, v) => {
                            mine.set_value(v)?;
                        }
                    }
                    if !attrs.is_empty() {
                        mine.set_attr(attrs)?;
                    }
                }
                None => {
                    self.insert_node(onode.deep_copy(), Position::End)?;
                }
            }
        }
        Ok(())
    }

    /// Non-destructive merge into a fresh bag, with independent control
    /// over updating and adding values and attributes.
    pub fn merge(&self, other: &Bag, opts: &MergeOptions) -> Result<Bag> {
        let out = self.deep_copy();
        out.merge_from(other, opts)?;
        Ok(out)
    }

    fn merge_from(&self, other: &Bag, opts: &MergeOptions) -> Result<()> {
        for onode in other.nodes() {
            let (label, value, attrs) = onode.as_tuple();
            match self.find(&Segment::Label(label)) {
                Some(mine) => {
                    match (mine.static_value(), value) {
                        (Value::Bag(a), Value::Bag(b)) => a.merge_from(&b, opts)?,
                        (_, v) => {
                            if opts.upd_values {
                                mine.set_value(match v {
                                    Value::Bag(b) => Value::Bag(b.deep_copy()),
                                    other => other,
                                })?;
                            }
                        }
                    }
                    for (k, v) in attrs {
                        let exists = mine.attr(&k).is_some();
                        if (exists && opts.upd_attr) || (!exists && opts.add_attr) {
                            mine.set_attr([(k, v)])?;
                        }
                    }
                }
                None => {
                    if opts.add_values {
                        self.insert_node(onode.deep_copy(), Position::End)?;
                    }
                }
            }
        }
        Ok(())
    }

    // ---- projections ----

    /// Top-level `(label, resolved value)` pairs as a dict value.
    pub fn as_dict(&self) -> Value {
        Value::Dict(self.items())
    }

    /// Like [`Bag::as_dict`] but with nested bags converted too.
    pub fn as_dict_deep(&self) -> Value {
        Value::Dict(
            self.nodes()
                .iter()
                .map(|n| {
                    let v = match n.value_or_null() {
                        Value::Bag(b) => b.as_dict_deep(),
                        other => other,
                    };
                    (n.label(), v)
                })
                .collect(),
        )
    }

    /// Dotted paths of every node in the tree, depth-first.
    pub fn get_index_list(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.index_into("", &mut out);
        out
    }

    fn index_into(&self, prefix: &str, out: &mut Vec<String>) {
        for node in self.nodes() {
            let path = if prefix.is_empty() {
                escape_label(&node.label())
            } else {
                format!("{}.{}", prefix, escape_label(&node.label()))
            };
            out.push(path.clone());
            if let Value::Bag(child) = node.static_value() {
                child.index_into(&path, out);
            }
        }
    }

    /// Every node in the tree, depth-first.
    pub fn traverse(&self) -> Vec<BagNode> {
        let mut out = Vec::new();
        self.traverse_into(&mut out);
        out
    }

    fn traverse_into(&self, out: &mut Vec<BagNode>) {
        for node in self.nodes() {
            out.push(node.clone());
            if let Value::Bag(child) = node.static_value() {
                child.traverse_into(out);
            }
        }
    }

    /// Visit every node with its path; the first `Some` returned by the
    /// callback short-circuits the walk.
    pub fn walk<T>(&self, f: &mut dyn FnMut(&str, &BagNode) -> Option<T>) -> Option<T> {
        self.walk_from("", f)
    }

    fn walk_from<T>(
        &self,
        prefix: &str,
        f: &mut dyn FnMut(&str, &BagNode) -> Option<T>,
    ) -> Option<T> {
        for node in self.nodes() {
            let path = if prefix.is_empty() {
                escape_label(&node.label())
            } else {
                format!("{}.{}", prefix, escape_label(&node.label()))
            };
            if let Some(hit) = f(&path, &node) {
                return Some(hit);
            }
            if let Value::Bag(child) = node.static_value() {
                if let Some(hit) = child.walk_from(&path, f) {
                    return Some(hit);
                }
            }
        }
        None
    }

    /// Structural projection: leaves failing the predicate are dropped,
    /// inner bags are kept when anything below them survives.
    pub fn filter(&self, pred: &dyn Fn(&BagNode) -> bool) -> Bag {
        let out = Bag::new();
        for node in self.nodes() {
            if let Value::Bag(child) = node.static_value() {
                let sub = child.filter(pred);
                if !sub.is_empty() || pred(&node) {
                    let copy = BagNode::new(node.label(), Value::Bag(sub));
                    copy.0.borrow_mut().attr = node.attributes();
                    let _ = out.insert_node(copy, Position::End);
                }
            } else if pred(&node) {
                let _ = out.insert_node(node.deep_copy(), Position::End);
            }
        }
        out
    }

    /// First node, anywhere in the tree, whose attribute equals the
    /// given value.
    pub fn get_node_by_attr(&self, name: &str, value: &Value) -> Option<BagNode> {
        self.walk(&mut |_, node| {
            if node.attr(name).as_ref() == Some(value) {
                Some(node.clone())
            } else {
                None
            }
        })
    }

    // ---- digests ----

    fn digest_token(&self, node: &BagNode, token: &str) -> Value {
        let token = token.trim();
        if token == "#k" {
            Value::Text(node.label())
        } else if token == "#v" {
            node.value_or_null()
        } else if let Some(sub) = token.strip_prefix("#v.") {
            match node.value_or_null() {
                Value::Bag(b) => b.get_item(sub).unwrap_or(Value::Null),
                _ => Value::Null,
            }
        } else if token == "#a" {
            Value::Dict(node.attributes())
        } else if let Some(name) = token.strip_prefix("#a.") {
            node.attr(name).unwrap_or(Value::Null)
        } else {
            node.attr(token).unwrap_or(Value::Null)
        }
    }

    /// Row extraction over the top-level nodes. `what` is a comma list
    /// of `#k` (label), `#v` (value), `#v.path` (inner value), `#a`
    /// (attribute dict) and `#a.name` (single attribute) specifiers.
    pub fn digest(&self, what: &str) -> Vec<Vec<Value>> {
        self.digest_if(what, &|_| true)
    }

    pub fn digest_if(&self, what: &str, pred: &dyn Fn(&BagNode) -> bool) -> Vec<Vec<Value>> {
        let tokens: Vec<&str> = what.split(',').collect();
        self.nodes()
            .iter()
            .filter(|n| pred(n))
            .map(|n| tokens.iter().map(|t| self.digest_token(n, t)).collect())
            .collect()
    }

    /// Single-specifier digest as a flat column.
    pub fn column(&self, what: &str) -> Vec<Value> {
        self.nodes()
            .iter()
            .map(|n| self.digest_token(n, what))
            .collect()
    }

    /// One column per specifier.
    pub fn columns(&self, what: &[&str]) -> Vec<Vec<Value>> {
        what.iter().map(|w| self.column(w)).collect()
    }

    /// Numeric fold of a column; non-numeric cells count as zero.
    pub fn sum(&self, what: &str) -> f64 {
        self.column(what)
            .iter()
            .map(|v| match v {
                Value::Long(n) => *n as f64,
                Value::Real(r) => *r,
                Value::Decimal(d) => {
                    use bigdecimal::ToPrimitive;
                    d.to_f64().unwrap_or(0.0)
                }
                _ => 0.0,
            })
            .sum()
    }

    /// In-place stable sort of the top-level nodes. `spec` is a comma
    /// list of `key:mode` pairs where the key is a digest specifier and
    /// the mode is `a`/`d` (ascending/descending), with a `*` suffix
    /// for case-insensitive text.
    pub fn sort(&self, spec: &str) {
        struct Key {
            token: String,
            desc: bool,
            ci: bool,
        }
        let keys: Vec<Key> = spec
            .split(',')
            .map(|part| {
                let (token, mode) = match part.split_once(':') {
                    Some((t, m)) => (t.trim(), m.trim()),
                    None => (part.trim(), "a"),
                };
                Key {
                    token: token.to_string(),
                    desc: mode.starts_with('d'),
                    ci: mode.ends_with('*'),
                }
            })
            .collect();
        let mut nodes = std::mem::take(&mut self.0.borrow_mut().nodes);
        nodes.sort_by(|a, b| {
            for key in &keys {
                let mut va = self.digest_token(a, &key.token);
                let mut vb = self.digest_token(b, &key.token);
                if key.ci {
                    if let Value::Text(t) = &va {
                        va = Value::Text(t.to_lowercase());
                    }
                    if let Value::Text(t) = &vb {
                        vb = Value::Text(t.to_lowercase());
                    }
                }
                let ord = va.total_cmp(&vb);
                let ord = if key.desc { ord.reverse() } else { ord };
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        });
        self.0.borrow_mut().nodes = nodes;
    }

    /// Regroup a flat bag into a tree keyed by the text of the listed
    /// attributes, in order. Nodes missing an attribute group under `_`.
    pub fn to_tree(&self, attrs: &[&str]) -> Bag {
        let out = Bag::new();
        for node in self.nodes() {
            let mut cur = out.clone();
            for name in attrs {
                let key = node
                    .attr(name)
                    .map(|v| v.to_string())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "_".to_string());
                cur = match cur.find(&Segment::Label(key.clone())) {
                    Some(n) => match n.static_value() {
                        Value::Bag(b) => b,
                        _ => {
                            let b = Bag::new();
                            let _ = n.set_value(Value::Bag(b.clone()));
                            b
                        }
                    },
                    None => {
                        let b = Bag::new();
                        let n = BagNode::new(key, Value::Bag(b.clone()));
                        let _ = cur.insert_node(n, Position::End);
                        b
                    }
                };
            }
            let _ = cur.insert_node(node.deep_copy(), Position::End);
        }
        out
    }

    // ---- resolvers sugar ----

    /// Attach a callback-backed lazy value at a path.
    pub fn set_callback_item<F>(&self, path: &str, cache_time: f64, f: F) -> Result<BagNode>
    where
        F: FnMut(&ResolveContext) -> Result<Value> + 'static,
    {
        let node = self.set_item(path, Value::Null)?;
        node.set_resolver(Resolver::callback(cache_time, f));
        Ok(node)
    }

    /// Predefine a named symbol for formulas: a path other formulas can
    /// reference by name.
    pub fn define_symbol(&self, name: &str, path: &str) -> Result<()> {
        self.set_item_with(
            &format!("_symbols.{}", name),
            Value::Null,
            vec![("path".to_string(), Value::Text(path.to_string()))],
        )?;
        Ok(())
    }

    /// Predefine a named formula template, e.g. `($a + $b) / 2`.
    pub fn define_formula(&self, name: &str, template: &str) -> Result<()> {
        self.set_item_with(
            &format!("_formulas.{}", name),
            Value::Null,
            vec![("formula".to_string(), Value::Text(template.to_string()))],
        )?;
        Ok(())
    }

    /// Attach a formula-backed node. `formula` is either a defined
    /// formula name or a template; each `(symbol, target)` pairs a
    /// `$symbol` with a path, or with a symbol defined through
    /// [`Bag::define_symbol`]. A `$_symbol` in the template forces a
    /// fresh resolve of its target on every evaluation.
    pub fn formula_item(
        &self,
        path: &str,
        formula: &str,
        symbols: &[(&str, &str)],
    ) -> Result<BagNode> {
        let template = match self.get_attr(&format!("_formulas.{}", formula), "formula") {
            Some(Value::Text(t)) => t,
            _ => formula.to_string(),
        };
        let mut map = Vec::with_capacity(symbols.len());
        for (sym, target) in symbols {
            let tpath = match self.get_attr(&format!("_symbols.{}", target), "path") {
                Some(Value::Text(p)) => p,
                _ => target.to_string(),
            };
            map.push((sym.to_string(), tpath));
        }
        let (owner, node) = self
            .locate(path, true)?
            .ok_or_else(|| BagError::Path(format!("cannot reach '{}'", path)))?;
        // the loader reads its symbols through the parent bag, so the
        // upward pointer is wired even outside backref mode
        node.set_parent_bag(Some(owner.downgrade()));
        node.set_resolver(Resolver::formula(&template, map));
        Ok(node)
    }

    /// Attach a validator to the node at a path.
    pub fn add_validator(&self, path: &str, validator: Validator) -> Result<()> {
        let (_, node) = self
            .locate(path, true)?
            .ok_or_else(|| BagError::Path(format!("cannot reach '{}'", path)))?;
        node.add_validator(validator);
        Ok(())
    }

    // ---- pickling ----

    /// Drop the upward pointers so the tree is a plain acyclic value.
    /// The backref flags stay on, which is what lets
    /// [`Bag::restore_from_picklable`] re-wire everything.
    pub fn make_picklable(&self) {
        {
            let mut inner = self.0.borrow_mut();
            inner.parent = None;
            inner.parent_node = None;
        }
        for node in self.nodes() {
            node.set_parent_bag(None);
            if let Value::Bag(child) = node.static_value() {
                child.make_picklable();
            }
        }
    }

    pub fn restore_from_picklable(&self) {
        if self.backref() {
            self.set_backref();
        }
    }

    /// Serialize to the pickled byte form. Resolver-backed nodes pickle
    /// their last materialized value.
    pub fn pickle(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&freeze_bag(self))?)
    }

    pub fn unpickle(bytes: &[u8]) -> Result<Bag> {
        let pickled: PickledBag = serde_json::from_slice(bytes)?;
        let bag = thaw_bag(pickled)?;
        bag.restore_from_picklable();
        Ok(bag)
    }
}

/// Switches for [`Bag::merge`]. The default keeps everything: existing
/// values and attributes are updated, new ones are added.
#[derive(Clone, Copy, Debug)]
pub struct MergeOptions {
    pub upd_values: bool,
    pub add_values: bool,
    pub upd_attr: bool,
    pub add_attr: bool,
}

impl Default for MergeOptions {
    fn default() -> Self {
        MergeOptions {
            upd_values: true,
            add_values: true,
            upd_attr: true,
            add_attr: true,
        }
    }
}

impl PartialEq for Bag {
    /// Structural equality: same node sequence by label, value and
    /// attributes. Aliasing handles are trivially equal.
    fn eq(&self, other: &Bag) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let a = self.nodes();
        let b = other.nodes();
        a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x == y)
    }
}

impl fmt::Debug for Bag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Bag{:?}", self.keys())
    }
}

impl fmt::Display for Bag {
    /// Indented tree rendering, one `index - (CODE) label: value` line
    /// per node.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fn render(bag: &Bag, f: &mut fmt::Formatter, depth: usize) -> fmt::Result {
            for (i, node) in bag.nodes().iter().enumerate() {
                let value = node.static_value();
                writeln!(
                    f,
                    "{}{} - ({}) {}: {}",
                    "    ".repeat(depth),
                    i,
                    value.kind().default_code(),
                    node.label(),
                    value
                )?;
                if let Value::Bag(child) = value {
                    render(&child, f, depth + 1)?;
                }
            }
            Ok(())
        }
        render(self, f, 0)
    }
}

// ------------- Pickled form --------------

#[derive(Serialize, Deserialize)]
struct PickledBag {
    backref: bool,
    nodes: Vec<PickledNode>,
}

#[derive(Serialize, Deserialize)]
struct PickledNode {
    label: String,
    value: PickledValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attr: Vec<(String, PickledValue)>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    locked: bool,
}

#[derive(Serialize, Deserialize)]
enum PickledValue {
    Null,
    Text(String),
    Long(i64),
    Real(f64),
    Bool(bool),
    Date(String),
    DateTime(String),
    Time(String),
    Decimal(String),
    List(Vec<PickledValue>),
    Dict(Vec<(String, PickledValue)>),
    Bag(PickledBag),
}

fn freeze(value: &Value) -> PickledValue {
    match value {
        Value::Null => PickledValue::Null,
        Value::Text(t) => PickledValue::Text(t.clone()),
        Value::Long(n) => PickledValue::Long(*n),
        Value::Real(r) => PickledValue::Real(*r),
        Value::Bool(b) => PickledValue::Bool(*b),
        Value::Date(d) => PickledValue::Date(d.format("%Y-%m-%d").to_string()),
        Value::DateTime(d) => PickledValue::DateTime(d.format("%Y-%m-%dT%H:%M:%S").to_string()),
        Value::Time(t) => PickledValue::Time(t.format("%H:%M:%S").to_string()),
        Value::Decimal(d) => PickledValue::Decimal(d.to_string()),
        Value::List(items) => PickledValue::List(items.iter().map(freeze).collect()),
        Value::Dict(pairs) => {
            PickledValue::Dict(pairs.iter().map(|(k, v)| (k.clone(), freeze(v))).collect())
        }
        Value::Bag(b) => PickledValue::Bag(freeze_bag(b)),
    }
}

fn freeze_bag(bag: &Bag) -> PickledBag {
    PickledBag {
        backref: bag.backref(),
        nodes: bag
            .nodes()
            .iter()
            .map(|n| {
                let (label, value, attr) = n.as_tuple();
                PickledNode {
                    label,
                    value: freeze(&value),
                    attr: attr.iter().map(|(k, v)| (k.clone(), freeze(v))).collect(),
                    locked: n.is_locked(),
                }
            })
            .collect(),
    }
}

fn thaw(value: PickledValue) -> Result<Value> {
    Ok(match value {
        PickledValue::Null => Value::Null,
        PickledValue::Text(t) => Value::Text(t),
        PickledValue::Long(n) => Value::Long(n),
        PickledValue::Real(r) => Value::Real(r),
        PickledValue::Bool(b) => Value::Bool(b),
        PickledValue::Date(s) => Value::Date(
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map_err(|e| BagError::Pickle(e.to_string()))?,
        ),
        PickledValue::DateTime(s) => Value::DateTime(
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S")
                .map_err(|e| BagError::Pickle(e.to_string()))?,
        ),
        PickledValue::Time(s) => Value::Time(
            NaiveTime::parse_from_str(&s, "%H:%M:%S")
                .map_err(|e| BagError::Pickle(e.to_string()))?,
        ),
        PickledValue::Decimal(s) => {
            Value::Decimal(BigDecimal::from_str(&s).map_err(|e| BagError::Pickle(e.to_string()))?)
        }
        PickledValue::List(items) => {
            Value::List(items.into_iter().map(thaw).collect::<Result<_>>()?)
        }
        PickledValue::Dict(pairs) => Value::Dict(
            pairs
                .into_iter()
                .map(|(k, v)| Ok((k, thaw(v)?)))
                .collect::<Result<_>>()?,
        ),
        PickledValue::Bag(b) => Value::Bag(thaw_bag(b)?),
    })
}

fn thaw_bag(pickled: PickledBag) -> Result<Bag> {
    let bag = Bag::new();
    for pnode in pickled.nodes {
        let node = BagNode::new(pnode.label, thaw(pnode.value)?);
        {
            let mut inner = node.0.borrow_mut();
            inner.attr = pnode
                .attr
                .into_iter()
                .map(|(k, v)| Ok((k, thaw(v)?)))
                .collect::<Result<_>>()?;
            inner.locked = pnode.locked;
        }
        bag.insert_node(node, Position::End)?;
    }
    if pickled.backref {
        bag.0.borrow_mut().backref = true;
    }
    Ok(bag)
}
