//! The native value model and the type catalog.
//!
//! A [`TypeCatalog`] maps native value kinds to short wire codes and
//! carries the text serializers and parsers for each of them. It is an
//! explicitly constructed value, passed to the XML codec, so two codecs
//! with different conversion rules can coexist in one process.

// used for date, datetime and time values
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
// used for decimal numbers
use bigdecimal::{BigDecimal, ToPrimitive};
// used for the JS (JSON list/dict) wire type
use serde_json::Value as Json;

use lazy_static::lazy_static;
use regex::Regex;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::BuildHasherDefault;
use std::str::FromStr;

use seahash::SeaHasher;

use crate::bag::Bag;

// fast non-cryptographic hashing for string-keyed maps
pub type LabelHasher = BuildHasherDefault<SeaHasher>;

lazy_static! {
    static ref TYPED_SUFFIX: Regex = Regex::new(r"::([A-Za-z0-9_]*)$").unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"^\d{4}\W\d{1,2}\W\d{1,2}").unwrap();
    static ref WORD_SPLIT: Regex = Regex::new(r"\W+").unwrap();
}

// ------------- Values --------------

/// A value a node can hold. `List` and `Dict` share the `JS` wire code
/// and travel as JSON text.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Text(String),
    Long(i64),
    Real(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
    Decimal(BigDecimal),
    List(Vec<Value>),
    Dict(Vec<(String, Value)>),
    Bag(Bag),
}

/// Discriminant of [`Value`], the key under which catalog entries are
/// registered.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ValueKind {
    Null,
    Text,
    Long,
    Real,
    Bool,
    Date,
    DateTime,
    Time,
    Decimal,
    Js,
    Bag,
}

impl ValueKind {
    /// The wire code of the standard catalog. Custom catalogs may remap
    /// codes; this is the fallback used where no catalog is at hand,
    /// e.g. the `Display` rendering of a bag.
    pub fn default_code(&self) -> &'static str {
        match self {
            ValueKind::Null => "NN",
            ValueKind::Text => "T",
            ValueKind::Long => "L",
            ValueKind::Real => "R",
            ValueKind::Bool => "B",
            ValueKind::Date => "D",
            ValueKind::DateTime => "DH",
            ValueKind::Time => "H",
            ValueKind::Decimal => "N",
            ValueKind::Js => "JS",
            ValueKind::Bag => "BAG",
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Text(_) => ValueKind::Text,
            Value::Long(_) => ValueKind::Long,
            Value::Real(_) => ValueKind::Real,
            Value::Bool(_) => ValueKind::Bool,
            Value::Date(_) => ValueKind::Date,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Time(_) => ValueKind::Time,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::List(_) | Value::Dict(_) => ValueKind::Js,
            Value::Bag(_) => ValueKind::Bag,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bag(&self) -> Option<&Bag> {
        match self {
            Value::Bag(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    fn numeric(&self) -> Option<f64> {
        match self {
            Value::Long(n) => Some(*n as f64),
            Value::Real(r) => Some(*r),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Long(_) | Value::Real(_) | Value::Decimal(_) => 2,
            Value::Text(_) => 3,
            Value::Date(_) => 4,
            Value::DateTime(_) => 5,
            Value::Time(_) => 6,
            Value::List(_) => 7,
            Value::Dict(_) => 8,
            Value::Bag(_) => 9,
        }
    }

    /// Total order over heterogeneous values: numerics compare among
    /// themselves regardless of representation, everything else orders
    /// by a fixed kind rank first and naturally within a kind. Never
    /// panics, so sorting mixed columns is always safe.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return a.total_cmp(&b);
        }
        match self.rank().cmp(&other.rank()) {
            Ordering::Equal => {}
            ne => return ne,
        }
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.total_cmp(y) {
                        Ordering::Equal => {}
                        ne => return ne,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Dict(a), Value::Dict(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    match ka.cmp(kb) {
                        Ordering::Equal => {}
                        ne => return ne,
                    }
                    match va.total_cmp(vb) {
                        Ordering::Equal => {}
                        ne => return ne,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Bag(a), Value::Bag(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => a
                    .keys()
                    .into_iter()
                    .zip(b.keys())
                    .map(|(x, y)| x.cmp(&y))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal),
                ne => ne,
            },
            _ => Ordering::Equal,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Real(a), Value::Real(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Dict(a), Value::Dict(b)) => a == b,
            (Value::Bag(a), Value::Bag(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Text(t) => write!(f, "{}", t),
            Value::Long(n) => write!(f, "{}", n),
            Value::Real(r) => write!(f, "{}", r),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(d) => write!(f, "{}", d.format("%Y-%m-%d %H:%M:%S")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::List(_) | Value::Dict(_) => write!(f, "{}", to_json_text(self)),
            Value::Bag(_) => Ok(()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Text(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Text(s)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Long(n)
    }
}
impl From<i32> for Value {
    fn from(n: i32) -> Value {
        Value::Long(n as i64)
    }
}
impl From<f64> for Value {
    fn from(r: f64) -> Value {
        Value::Real(r)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}
impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Value {
        Value::Date(d)
    }
}
impl From<NaiveDateTime> for Value {
    fn from(d: NaiveDateTime) -> Value {
        Value::DateTime(d)
    }
}
impl From<NaiveTime> for Value {
    fn from(t: NaiveTime) -> Value {
        Value::Time(t)
    }
}
impl From<BigDecimal> for Value {
    fn from(d: BigDecimal) -> Value {
        Value::Decimal(d)
    }
}
impl From<Bag> for Value {
    fn from(b: Bag) -> Value {
        Value::Bag(b)
    }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Value {
        match o {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// JSON text form used by the `JS` wire type. Dates render as
/// `MM/DD/YYYY`, times as `HH:MM:SS` and decimals as plain digit
/// strings inside the JSON.
pub fn to_json_text(value: &Value) -> String {
    value_to_json(value).to_string()
}

fn value_to_json(value: &Value) -> Json {
    match value {
        Value::Null | Value::Bag(_) => Json::Null,
        Value::Text(t) => Json::String(t.clone()),
        Value::Long(n) => Json::from(*n),
        Value::Real(r) => serde_json::Number::from_f64(*r)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Bool(b) => Json::Bool(*b),
        Value::Date(d) => Json::String(d.format("%m/%d/%Y").to_string()),
        Value::DateTime(d) => Json::String(d.format("%m/%d/%Y %H:%M:%S").to_string()),
        Value::Time(t) => Json::String(t.format("%H:%M:%S").to_string()),
        Value::Decimal(d) => Json::String(d.to_string()),
        Value::List(items) => Json::Array(items.iter().map(value_to_json).collect()),
        Value::Dict(pairs) => Json::Object(
            pairs
                .iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

fn json_to_value(json: Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Long(i),
            None => Value::Real(n.as_f64().unwrap_or(0.0)),
        },
        Json::String(s) => Value::Text(s),
        Json::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        Json::Object(map) => {
            Value::Dict(map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect())
        }
    }
}

// ------------- Catalog --------------

/// Horizontal alignment hint attached to each wire type, usable by
/// tabular presentations of digests.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Align {
    Left,
    Right,
    Center,
}

/// Serializer flavor: `Text` is the wire form, `Repr` a debugging form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SerializeMode {
    Text,
    Repr,
}

type ParseFn = Box<dyn Fn(&str) -> Option<Value>>;
type SerializeFn = Box<dyn Fn(&Value) -> String>;

struct TypeEntry {
    code: String,
    empty: Value,
    align: Align,
    parser: Option<ParseFn>,
    as_text: Option<SerializeFn>,
    as_repr: Option<SerializeFn>,
}

/// Registry of wire codes, parsers and serializers per value kind.
pub struct TypeCatalog {
    entries: HashMap<ValueKind, TypeEntry, LabelHasher>,
    by_code: HashMap<String, ValueKind, LabelHasher>,
}

impl Default for TypeCatalog {
    fn default() -> Self {
        TypeCatalog::standard()
    }
}

impl TypeCatalog {
    /// An empty catalog with no registered types.
    pub fn new() -> TypeCatalog {
        TypeCatalog {
            entries: HashMap::default(),
            by_code: HashMap::default(),
        }
    }

    /// The standard catalog: T, L, R, B, D, DH, H, N, NN, JS and BAG
    /// with their usual aliases.
    pub fn standard() -> TypeCatalog {
        let mut c = TypeCatalog::new();
        c.register(ValueKind::Text, "T", &["TEXT", "P", "A"], Value::Text(String::new()), Align::Left);
        c.register(ValueKind::Long, "L", &["LONG", "LONGINT", "I", "INT", "INTEGER"], Value::Null, Align::Right);
        c.register(ValueKind::Real, "R", &["REAL", "FLOAT", "F"], Value::Null, Align::Right);
        c.register(ValueKind::Bool, "B", &["BOOL", "BOOLEAN"], Value::Null, Align::Center);
        c.register(ValueKind::Date, "D", &["DATE"], Value::Null, Align::Right);
        c.register(ValueKind::DateTime, "DH", &["DATETIME", "DT"], Value::Null, Align::Right);
        c.register(ValueKind::Time, "H", &["TIME"], Value::Null, Align::Right);
        c.register(ValueKind::Decimal, "N", &["NUMERIC", "DECIMAL"], Value::Null, Align::Right);
        c.register(ValueKind::Null, "NN", &["NONE", "NULL"], Value::Null, Align::Left);
        c.register(ValueKind::Js, "JS", &["JSON"], Value::Null, Align::Left);
        c.register(ValueKind::Bag, "BAG", &["GNRBAG"], Value::Bag(Bag::new()), Align::Left);
        c
    }

    /// Register (or replace) the entry for a native kind. The code and
    /// every alias become recognized, case-insensitively, by the
    /// parsing side.
    pub fn register(
        &mut self,
        kind: ValueKind,
        code: &str,
        aliases: &[&str],
        empty: Value,
        align: Align,
    ) {
        let code = code.to_uppercase();
        self.by_code.insert(code.clone(), kind);
        for alias in aliases {
            self.by_code.insert(alias.to_uppercase(), kind);
        }
        self.entries.insert(
            kind,
            TypeEntry {
                code,
                empty,
                align,
                parser: None,
                as_text: None,
                as_repr: None,
            },
        );
    }

    /// Attach a custom text parser for a registered kind, replacing the
    /// built-in conversion.
    pub fn register_parser<F>(&mut self, kind: ValueKind, parser: F)
    where
        F: Fn(&str) -> Option<Value> + 'static,
    {
        if let Some(entry) = self.entries.get_mut(&kind) {
            entry.parser = Some(Box::new(parser));
        }
    }

    /// Attach a custom serializer for a registered kind.
    pub fn register_serializer<F>(&mut self, kind: ValueKind, mode: SerializeMode, serializer: F)
    where
        F: Fn(&Value) -> String + 'static,
    {
        if let Some(entry) = self.entries.get_mut(&kind) {
            match mode {
                SerializeMode::Text => entry.as_text = Some(Box::new(serializer)),
                SerializeMode::Repr => entry.as_repr = Some(Box::new(serializer)),
            }
        }
    }

    /// The wire code of a value, `"T"` when its kind is unregistered.
    pub fn code_of(&self, value: &Value) -> &str {
        self.entries
            .get(&value.kind())
            .map(|e| e.code.as_str())
            .unwrap_or("T")
    }

    pub fn kind_of_code(&self, code: &str) -> Option<ValueKind> {
        self.by_code.get(&code.to_uppercase()).copied()
    }

    /// The registered empty value for a code, `Null` when unknown.
    pub fn empty_value_of(&self, code: &str) -> Value {
        self.kind_of_code(code)
            .and_then(|k| self.entries.get(&k))
            .map(|e| e.empty.clone())
            .unwrap_or(Value::Null)
    }

    pub fn alignment_of(&self, code: &str) -> Align {
        self.kind_of_code(code)
            .and_then(|k| self.entries.get(&k))
            .map(|e| e.align)
            .unwrap_or(Align::Left)
    }

    /// Text form of a value. A leading `!!` on text marks it as
    /// translatable: the remainder passes through `translate` when one
    /// is given. `quoted` wraps the result in double quotes, falling
    /// back to single quotes when the text itself contains a double
    /// quote.
    pub fn to_text(
        &self,
        value: &Value,
        quoted: bool,
        translate: Option<&dyn Fn(&str) -> String>,
    ) -> String {
        let mut text = match self.entries.get(&value.kind()).and_then(|e| e.as_text.as_ref()) {
            Some(custom) => custom(value),
            None => value.to_string(),
        };
        if let Value::Text(t) = value {
            if let (Some(stripped), Some(cb)) = (t.strip_prefix("!!"), translate) {
                text = cb(stripped);
            }
        }
        if quoted {
            if text.contains('"') {
                text = format!("'{}'", text);
            } else {
                text = format!("\"{}\"", text);
            }
        }
        text
    }

    /// Debugging form; falls back to the text form when no `Repr`
    /// serializer is registered.
    pub fn to_repr(&self, value: &Value) -> String {
        match self.entries.get(&value.kind()).and_then(|e| e.as_repr.as_ref()) {
            Some(custom) => custom(value),
            None => self.to_text(value, false, None),
        }
    }

    /// Text form plus wire code in one call, as the XML writer needs
    /// them together.
    pub fn to_text_and_type(&self, value: &Value) -> (String, String) {
        (self.to_text(value, false, None), self.code_of(value).to_string())
    }

    /// Self-describing `text::CODE` form. Plain text carries no suffix;
    /// a null value is just `::NN`.
    pub fn to_typed_text(&self, value: &Value) -> String {
        let (text, code) = self.to_text_and_type(value);
        if code == "T" {
            text
        } else {
            format!("{}::{}", text, code)
        }
    }

    /// Parse text under an explicit code. Empty text yields the code's
    /// registered empty value. `None` means the code is unknown or the
    /// text does not parse as that code.
    pub fn from_text(&self, text: &str, code: &str) -> Option<Value> {
        let kind = self.kind_of_code(code)?;
        let entry = self.entries.get(&kind)?;
        if text.is_empty() {
            return Some(entry.empty.clone());
        }
        if let Some(custom) = entry.parser.as_ref() {
            return custom(text);
        }
        parse_builtin(kind, text)
    }

    /// Parse a self-describing `text::CODE` string. Without a
    /// recognized suffix, or when conversion fails, the input comes
    /// back as plain text.
    pub fn from_typed_text(&self, text: &str) -> Value {
        if let Some(m) = TYPED_SUFFIX.captures(text) {
            let code = &m[1];
            if self.kind_of_code(code).is_some() {
                let prefix = &text[..text.len() - m[0].len()];
                if let Some(value) = self.from_text(prefix, code) {
                    return value;
                }
                return Value::Text(prefix.to_string());
            }
        }
        Value::Text(text.to_string())
    }
}

fn parse_builtin(kind: ValueKind, text: &str) -> Option<Value> {
    match kind {
        ValueKind::Null => Some(Value::Null),
        ValueKind::Text => Some(Value::Text(text.to_string())),
        ValueKind::Long => text.trim().parse::<i64>().ok().map(Value::Long),
        ValueKind::Real => {
            if text.trim().eq_ignore_ascii_case("inf") {
                // infinite floats are treated as absent
                return Some(Value::Null);
            }
            text.trim().parse::<f64>().ok().map(Value::Real)
        }
        ValueKind::Bool => {
            let up = text.trim().to_uppercase();
            Some(Value::Bool(matches!(up.as_str(), "Y" | "TRUE" | "YES" | "1")))
        }
        ValueKind::Date => parse_date(text),
        ValueKind::DateTime => parse_datetime(text),
        ValueKind::Time => parse_time(text),
        ValueKind::Decimal => BigDecimal::from_str(text.trim()).ok().map(Value::Decimal),
        ValueKind::Js => serde_json::from_str::<Json>(text).ok().map(json_to_value),
        ValueKind::Bag => None,
    }
}

fn numeric_parts(text: &str) -> Vec<u32> {
    WORD_SPLIT
        .split(text.trim())
        .filter(|p| !p.is_empty())
        .filter_map(|p| p.parse::<u32>().ok())
        .collect()
}

fn parse_date(text: &str) -> Option<Value> {
    // the zero date is a common placeholder for "no date"
    if text == "0000-00-00" {
        return Some(Value::Null);
    }
    if !ISO_DATE.is_match(text.trim()) {
        return None;
    }
    let parts = numeric_parts(text);
    if parts.len() < 3 {
        return None;
    }
    NaiveDate::from_ymd_opt(parts[0] as i32, parts[1], parts[2]).map(Value::Date)
}

fn parse_datetime(text: &str) -> Option<Value> {
    let parts = numeric_parts(text);
    if parts.len() < 3 {
        return None;
    }
    let date = NaiveDate::from_ymd_opt(parts[0] as i32, parts[1], parts[2])?;
    let h = parts.get(3).copied().unwrap_or(0);
    let m = parts.get(4).copied().unwrap_or(0);
    let s = parts.get(5).copied().unwrap_or(0);
    date.and_hms_opt(h, m, s).map(Value::DateTime)
}

fn parse_time(text: &str) -> Option<Value> {
    let parts = numeric_parts(text);
    if parts.len() < 2 {
        return None;
    }
    let s = parts.get(2).copied().unwrap_or(0);
    let time = NaiveTime::from_hms_opt(parts[0], parts[1], s)?;
    // midnight with explicit zero seconds is a "no time" placeholder
    if time.num_seconds_from_midnight() == 0 && parts.len() >= 3 {
        return Some(Value::Null);
    }
    Some(Value::Time(time))
}
