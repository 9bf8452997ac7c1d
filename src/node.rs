//! A labeled, attributed slot inside a bag.
//!
//! Nodes are shared handles: cloning a [`BagNode`] aliases the same
//! underlying slot. A node can carry a lazy [`Resolver`] instead of a
//! static value, in which case reading it materializes the value first.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::warn;

use crate::bag::{Bag, BagInner};
use crate::catalog::Value;
use crate::error::{BagError, Result};
use crate::resolve::{ResolveContext, Resolver};

/// Why a node subscriber fired.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChangeReason {
    Value,
    Attributes,
}

/// What a node subscriber receives.
pub struct NodeChange {
    pub node: BagNode,
    pub old_value: Option<Value>,
    pub reason: ChangeReason,
}

pub type NodeCallback = Rc<RefCell<dyn FnMut(&NodeChange)>>;

/// Letter-case normalization applied by the `Case` validator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CaseMode {
    Upper,
    Lower,
    Capitalize,
}

/// A check (or normalization) applied to every value written to a node.
#[derive(Clone)]
pub enum Validator {
    Case(CaseMode),
    InList(Vec<String>),
    Length { min: usize, max: usize },
    Custom(Rc<dyn Fn(&Value) -> Result<Value>>),
}

impl Validator {
    fn apply(&self, value: Value) -> Result<Value> {
        match self {
            Validator::Case(mode) => Ok(match value {
                Value::Text(t) => Value::Text(match mode {
                    CaseMode::Upper => t.to_uppercase(),
                    CaseMode::Lower => t.to_lowercase(),
                    CaseMode::Capitalize => {
                        let mut chars = t.chars();
                        match chars.next() {
                            Some(first) => {
                                first.to_uppercase().collect::<String>() + chars.as_str()
                            }
                            None => t,
                        }
                    }
                }),
                other => other,
            }),
            Validator::InList(allowed) => {
                let text = value.to_string();
                if allowed.iter().any(|a| a == &text) {
                    Ok(value)
                } else {
                    Err(BagError::Validation {
                        value: text,
                        reason: format!("not in [{}]", allowed.join(",")),
                    })
                }
            }
            Validator::Length { min, max } => {
                let text = value.to_string();
                let n = text.chars().count();
                if n < *min || n > *max {
                    Err(BagError::Validation {
                        value: text,
                        reason: format!("length outside {}..{}", min, max),
                    })
                } else {
                    Ok(value)
                }
            }
            Validator::Custom(f) => f(&value),
        }
    }
}

pub(crate) struct NodeInner {
    pub(crate) label: String,
    pub(crate) value: Value,
    pub(crate) attr: Vec<(String, Value)>,
    pub(crate) resolver: Option<Resolver>,
    pub(crate) locked: bool,
    pub(crate) validators: Vec<Validator>,
    pub(crate) subscribers: Vec<(String, NodeCallback)>,
    pub(crate) parent_bag: Option<Weak<RefCell<BagInner>>>,
}

#[derive(Clone)]
pub struct BagNode(pub(crate) Rc<RefCell<NodeInner>>);

impl BagNode {
    pub fn new(label: impl Into<String>, value: impl Into<Value>) -> BagNode {
        BagNode(Rc::new(RefCell::new(NodeInner {
            label: label.into(),
            value: value.into(),
            attr: Vec::new(),
            resolver: None,
            locked: false,
            validators: Vec::new(),
            subscribers: Vec::new(),
            parent_bag: None,
        })))
    }

    pub fn label(&self) -> String {
        self.0.borrow().label.clone()
    }

    pub fn set_label(&self, label: impl Into<String>) {
        self.0.borrow_mut().label = label.into();
    }

    /// The stored value as-is, without consulting any resolver.
    pub fn static_value(&self) -> Value {
        self.0.borrow().value.clone()
    }

    /// The node's value, materializing it through the resolver when one
    /// is attached and its cache says so. Resolver failures propagate.
    pub fn get_value(&self) -> Result<Value> {
        // take the resolver out so its loader can read back through
        // this node without a double borrow
        let taken = self.0.borrow_mut().resolver.take();
        let Some(mut resolver) = taken else {
            return Ok(self.static_value());
        };
        let ctx = ResolveContext {
            node: Some(self.clone()),
        };
        let outcome = resolver.resolve(&ctx);
        let read_only = resolver.is_read_only();
        let mut inner = self.0.borrow_mut();
        inner.resolver = Some(resolver);
        match outcome {
            Ok(value) => {
                if !read_only {
                    inner.value = value.clone();
                    drop(inner);
                    self.link_child_bag();
                }
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Sets the value, running validators first. Returns the previous
    /// value. Fails on a locked node or a rejected value.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<Option<Value>> {
        let mut value = value.into();
        let (locked, validators, label) = {
            let inner = self.0.borrow();
            (inner.locked, inner.validators.clone(), inner.label.clone())
        };
        if locked {
            return Err(BagError::Locked(label));
        }
        for v in &validators {
            value = v.apply(value)?;
        }
        let (old, changed) = {
            let mut inner = self.0.borrow_mut();
            let changed = inner.value != value;
            let old = std::mem::replace(&mut inner.value, value);
            (old, changed)
        };
        self.link_child_bag();
        if changed {
            self.trigger(Some(old.clone()), ChangeReason::Value);
        }
        Ok(Some(old))
    }

    // ---- attributes ----

    pub fn attr(&self, name: &str) -> Option<Value> {
        self.0
            .borrow()
            .attr
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn attributes(&self) -> Vec<(String, Value)> {
        self.0.borrow().attr.clone()
    }

    pub fn has_attr(&self, name: &str, value: &Value) -> bool {
        self.attr(name).as_ref() == Some(value)
    }

    /// Sets (or replaces) attributes, preserving insertion order, and
    /// notifies subscribers. A null value unsets the attribute.
    pub fn set_attr<I, K>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.set_attr_full(pairs, true)
    }

    /// Like [`BagNode::set_attr`] but keeps null-valued entries as
    /// stored attributes instead of unsetting them.
    pub fn set_attr_keeping_null<I, K>(&self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.set_attr_full(pairs, false)
    }

    fn set_attr_full<I, K>(&self, pairs: I, remove_null: bool) -> Result<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        {
            let inner = self.0.borrow();
            if inner.locked {
                return Err(BagError::Locked(inner.label.clone()));
            }
        }
        {
            let mut inner = self.0.borrow_mut();
            for (k, v) in pairs {
                let k = k.into();
                if remove_null && v == Value::Null {
                    if let Some(pos) = inner.attr.iter().position(|(key, _)| *key == k) {
                        inner.attr.remove(pos);
                    }
                    continue;
                }
                match inner.attr.iter_mut().find(|(key, _)| *key == k) {
                    Some(slot) => slot.1 = v,
                    None => inner.attr.push((k, v)),
                }
            }
        }
        self.trigger(None, ChangeReason::Attributes);
        Ok(())
    }

    pub fn del_attr(&self, name: &str) -> Option<Value> {
        let removed = {
            let mut inner = self.0.borrow_mut();
            let pos = inner.attr.iter().position(|(k, _)| k == name)?;
            Some(inner.attr.remove(pos).1)
        };
        self.trigger(None, ChangeReason::Attributes);
        removed
    }

    /// Attributes merged from this node up through its ancestors; the
    /// nearest definition of each name wins.
    pub fn inherited_attributes(&self) -> Vec<(String, Value)> {
        let mut merged = self.attributes();
        let mut cursor = self.parent_bag().and_then(|b| b.parent_node());
        while let Some(node) = cursor {
            for (k, v) in node.attributes() {
                if !merged.iter().any(|(key, _)| *key == k) {
                    merged.push((k, v));
                }
            }
            cursor = node.parent_bag().and_then(|b| b.parent_node());
        }
        merged
    }

    // ---- lock, validators ----

    pub fn lock(&self) {
        self.0.borrow_mut().locked = true;
    }

    pub fn unlock(&self) {
        self.0.borrow_mut().locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.0.borrow().locked
    }

    pub fn add_validator(&self, validator: Validator) {
        self.0.borrow_mut().validators.push(validator);
    }

    // ---- resolver ----

    pub fn set_resolver(&self, resolver: Resolver) {
        self.0.borrow_mut().resolver = Some(resolver);
    }

    pub fn has_resolver(&self) -> bool {
        self.0.borrow().resolver.is_some()
    }

    /// Clears the resolver's cache so the next read recomputes.
    pub fn reset_resolver(&self) {
        if let Some(r) = self.0.borrow_mut().resolver.as_mut() {
            r.reset();
        }
    }

    /// Reconstruction metadata of the attached resolver, if any. Used
    /// by the `unresolved` XML serialization mode.
    pub fn resolver_reconstruction(&self) -> Option<crate::resolve::Reconstruction> {
        self.0.borrow().resolver.as_ref().map(|r| r.reconstruction())
    }

    // ---- subscribers ----

    /// Registers a callback fired after every value or attribute change
    /// of this node. Mutating the node from inside the callback is a
    /// contract violation and will panic on the interior borrow.
    pub fn subscribe<F>(&self, id: impl Into<String>, callback: F)
    where
        F: FnMut(&NodeChange) + 'static,
    {
        self.0
            .borrow_mut()
            .subscribers
            .push((id.into(), Rc::new(RefCell::new(callback))));
    }

    pub fn unsubscribe(&self, id: &str) {
        self.0.borrow_mut().subscribers.retain(|(sid, _)| sid != id);
    }

    // ---- structure ----

    pub fn parent_bag(&self) -> Option<Bag> {
        self.0
            .borrow()
            .parent_bag
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(Bag::from_rc)
    }

    /// `(label, value, attributes)` in one call; the value is the
    /// static one.
    pub fn as_tuple(&self) -> (String, Value, Vec<(String, Value)>) {
        let inner = self.0.borrow();
        (inner.label.clone(), inner.value.clone(), inner.attr.clone())
    }

    pub(crate) fn set_parent_bag(&self, parent: Option<Weak<RefCell<BagInner>>>) {
        self.0.borrow_mut().parent_bag = parent;
    }

    /// When the value is a bag and this node sits in a backref'd tree,
    /// wire the child bag's upward pointers.
    pub(crate) fn link_child_bag(&self) {
        let (child, parent) = {
            let inner = self.0.borrow();
            let child = match &inner.value {
                Value::Bag(b) => b.clone(),
                _ => return,
            };
            let parent = inner.parent_bag.as_ref().and_then(|w| w.upgrade());
            (child, parent)
        };
        if let Some(parent) = parent {
            let parent = Bag::from_rc(parent);
            if parent.backref() {
                child.adopt(&parent, self);
            }
        }
    }

    pub(crate) fn trigger(&self, old_value: Option<Value>, reason: ChangeReason) {
        let callbacks: Vec<NodeCallback> = self
            .0
            .borrow()
            .subscribers
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        if !callbacks.is_empty() {
            let change = NodeChange {
                node: self.clone(),
                old_value: old_value.clone(),
                reason,
            };
            for cb in callbacks {
                (cb.borrow_mut())(&change);
            }
        }
        if let Some(bag) = self.parent_bag() {
            bag.notify_update(self, old_value);
        }
    }
}

impl PartialEq for BagNode {
    /// Structural equality over label, static value and attributes.
    fn eq(&self, other: &BagNode) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let a = self.0.borrow();
        let b = other.0.borrow();
        a.label == b.label && a.value == b.value && a.attr == b.attr
    }
}

impl std::fmt::Debug for BagNode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let inner = self.0.borrow();
        write!(f, "BagNode({}: {:?})", inner.label, inner.value)
    }
}

impl BagNode {
    /// A structural copy: same label, attributes and a deep copy of the
    /// value. Resolvers, subscribers and parent links do not carry over.
    pub fn deep_copy(&self) -> BagNode {
        let (label, value, attr) = self.as_tuple();
        let value = match value {
            Value::Bag(b) => Value::Bag(b.deep_copy()),
            other => other,
        };
        let copy = BagNode::new(label, value);
        copy.0.borrow_mut().attr = attr;
        copy
    }

    /// Convenience used by tabular digests: the resolved value, with a
    /// warning and `Null` when the resolver fails.
    pub(crate) fn value_or_null(&self) -> Value {
        match self.get_value() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, label = %self.label(), "resolver failed during read");
                Value::Null
            }
        }
    }
}
