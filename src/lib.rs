//! Databag – an ordered, hierarchical, attributed data container.
//!
//! The crate centers on the [`bag::Bag`]: an ordered multimap whose
//! entries ([`node::BagNode`]) carry a label, a typed value and an
//! ordered attribute set. Values nest ([`catalog::Value::Bag`]), which
//! turns a bag into a tree addressable through a dotted path language:
//! * `a.b.c` – plain labels (`\.` escapes a literal dot),
//! * `#3` – positional index, `#^` – step up to the parent,
//! * `#id=42` – first sibling whose attribute matches,
//! * insertion positions like `<`, `>label` or `#2` (see [`path::Position`]).
//!
//! ## Modules
//! * [`bag`] – The container: path CRUD, digests, sorting, merging,
//!   backrefs and synchronous event propagation toward the root.
//! * [`node`] – The labeled slot: attributes, validators, locks, node
//!   subscribers and the resolver seat.
//! * [`catalog`] – The [`catalog::Value`] model and the
//!   [`catalog::TypeCatalog`] mapping values to short wire codes
//!   (`T`, `L`, `R`, `B`, `D`, `DH`, `H`, `N`, `NN`, `JS`, `BAG`).
//! * [`path`] – Path splitting and the position grammar.
//! * [`resolve`] – Lazy values: the [`resolve::LoadValue`] capability,
//!   the caching [`resolve::Resolver`] wrapper and concrete loaders
//!   (url, directory, documents, callbacks, arithmetic formulas).
//! * [`xml`] – The `<GenRoBag>` typed XML dialect, plus a generic mode
//!   that reads arbitrary XML into string leaves.
//!
//! ## Laziness
//! A node may hold a [`resolve::Resolver`] instead of a value; reading
//! the node materializes it, under a cache contract driven by
//! `cache_time` (0 = always recompute, positive = TTL seconds,
//! negative = forever). Time flows through the [`resolve::Clock`]
//! trait, so the contract is testable without sleeping.
//!
//! ## Events
//! Subscribing to a bag enables backref mode: every node learns its
//! parent, and any update, insert or delete below is delivered
//! synchronously up the ancestor chain with the full relative path.
//!
//! ## Quick Start
//! ```
//! use databag::bag::Bag;
//! use databag::catalog::Value;
//!
//! let bag = Bag::new();
//! bag.set_item("office.rooms.blue", 12i64).unwrap();
//! bag.set_item_with("office.rooms.red", 9i64,
//!     vec![("floor".to_string(), Value::Long(2))]).unwrap();
//! assert_eq!(bag.get_item("office.rooms.blue"), Some(Value::Long(12)));
//! assert_eq!(bag.get_attr("office.rooms.red", "floor"), Some(Value::Long(2)));
//!
//! let xml = bag.to_xml(&Default::default()).unwrap();
//! let back = Bag::from_xml(&xml, &Default::default()).unwrap();
//! assert_eq!(bag, back);
//! ```
//!
//! Bags are deliberately single-threaded (`Rc` inside): clone handles
//! freely within one thread, use [`bag::Bag::pickle`] or the XML codec
//! to move trees between threads or processes.

pub mod bag;
pub mod catalog;
pub mod error;
pub mod node;
pub mod path;
pub mod resolve;
pub mod xml;
