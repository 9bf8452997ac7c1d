//! Lazy values.
//!
//! A node can carry a [`Resolver`] instead of a static value. The
//! resolver owns a [`LoadValue`] loader (the single capability every
//! lazy source implements) and a cache slot governed by `cache_time`:
//! `0` recomputes on every read, a positive number is a TTL in seconds
//! and a negative number caches forever. Time is read through the
//! [`Clock`] trait so the TTL contract is testable without sleeping.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::bag::Bag;
use crate::catalog::Value;
use crate::error::{BagError, Result};
use crate::node::BagNode;
use crate::path::{escape_label, Position};

/// Default TTLs, in seconds.
pub const URL_CACHE_TIME: f64 = 300.0;
pub const DIRECTORY_CACHE_TIME: f64 = 500.0;
pub const DOCUMENT_CACHE_TIME: f64 = 500.0;

lazy_static! {
    static ref NON_WORD: Regex = Regex::new(r"\W").unwrap();
}

/// What a loader gets to see while materializing: the node it hangs
/// off, when it is attached to one.
pub struct ResolveContext {
    pub node: Option<BagNode>,
}

impl ResolveContext {
    pub fn detached() -> ResolveContext {
        ResolveContext { node: None }
    }
}

/// Metadata enough to reconstruct a resolver on the other side of a
/// serialization boundary, used by the `unresolved` XML mode.
#[derive(Clone, Default, Serialize)]
pub struct Reconstruction {
    pub class_name: String,
    pub args: Vec<String>,
    pub kwargs: Vec<(String, String)>,
}

/// The one capability every lazy source implements.
pub trait LoadValue {
    fn load(&mut self, ctx: &ResolveContext) -> Result<Value>;

    fn reconstruction(&self) -> Reconstruction {
        Reconstruction::default()
    }
}

/// Injectable time source for the TTL logic.
pub trait Clock {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock, for exercising the cache contract in
/// tests.
pub struct ManualClock {
    now: Cell<Instant>,
}

impl ManualClock {
    pub fn starting_now() -> Rc<ManualClock> {
        Rc::new(ManualClock {
            now: Cell::new(Instant::now()),
        })
    }

    pub fn advance(&self, seconds: f64) {
        self.now
            .set(self.now.get() + Duration::from_secs_f64(seconds));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

// ------------- Resolver --------------

/// Cache wrapper around a loader. Attached to a node it makes the node
/// read like a plain value that recomputes itself.
pub struct Resolver {
    loader: Box<dyn LoadValue>,
    cache_time: f64,
    read_only: bool,
    clock: Rc<dyn Clock>,
    cache: Option<(Value, Instant)>,
}

impl Resolver {
    pub fn new(loader: Box<dyn LoadValue>, cache_time: f64) -> Resolver {
        Resolver {
            loader,
            cache_time,
            read_only: false,
            clock: Rc::new(SystemClock),
            cache: None,
        }
    }

    pub fn with_clock(mut self, clock: Rc<dyn Clock>) -> Resolver {
        self.clock = clock;
        self
    }

    /// A read-only resolver never stores what it loads, neither in its
    /// cache nor in the node.
    pub fn with_read_only(mut self, read_only: bool) -> Resolver {
        self.read_only = read_only;
        self
    }

    pub fn cache_time(&self) -> f64 {
        self.cache_time
    }

    /// Reconfiguring the TTL drops whatever is cached.
    pub fn set_cache_time(&mut self, cache_time: f64) {
        if (cache_time - self.cache_time).abs() > f64::EPSILON {
            self.cache_time = cache_time;
            self.cache = None;
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn reset(&mut self) {
        self.cache = None;
    }

    /// Whether the next [`Resolver::resolve`] will call the loader.
    pub fn expired(&self) -> bool {
        if self.cache_time == 0.0 {
            return true;
        }
        match &self.cache {
            None => true,
            Some((_, at)) => {
                if self.cache_time < 0.0 {
                    false
                } else {
                    self.clock.now().duration_since(*at)
                        > Duration::from_secs_f64(self.cache_time)
                }
            }
        }
    }

    pub fn resolve(&mut self, ctx: &ResolveContext) -> Result<Value> {
        if !self.expired() {
            if let Some((value, _)) = &self.cache {
                return Ok(value.clone());
            }
        }
        debug!(cache_time = self.cache_time, "resolver load");
        let value = self.loader.load(ctx)?;
        if self.cache_time != 0.0 && !self.read_only {
            self.cache = Some((value.clone(), self.clock.now()));
        }
        Ok(value)
    }

    pub fn reconstruction(&self) -> Reconstruction {
        self.loader.reconstruction()
    }

    // ---- concrete constructors ----

    /// Arbitrary closure as a lazy source.
    pub fn callback<F>(cache_time: f64, f: F) -> Resolver
    where
        F: FnMut(&ResolveContext) -> Result<Value> + 'static,
    {
        Resolver::new(Box::new(CbLoader(f)), cache_time)
    }

    /// A document fetched over some transport; the transport itself is
    /// a black box passed in as `fetch`. Yields a bag with `data` and
    /// `info` (the response headers).
    pub fn url<F>(url: impl Into<String>, fetch: F) -> Resolver
    where
        F: FnMut(&str) -> std::io::Result<FetchedDoc> + 'static,
    {
        Resolver::new(
            Box::new(UrlLoader {
                url: url.into(),
                fetch: Box::new(fetch),
            }),
            URL_CACHE_TIME,
        )
    }

    /// A directory of the local filesystem as a lazy tree.
    pub fn directory(path: impl Into<PathBuf>, options: DirectoryOptions) -> Resolver {
        Resolver::new(
            Box::new(DirectoryLoader {
                path: path.into(),
                options,
            }),
            DIRECTORY_CACHE_TIME,
        )
    }

    /// A text file as a lazy string value.
    pub fn text_document(path: impl Into<PathBuf>) -> Resolver {
        Resolver::new(Box::new(TextDocLoader { path: path.into() }), DOCUMENT_CACHE_TIME)
    }

    /// An XML document as a lazy bag.
    pub fn xml_document(path: impl Into<PathBuf>) -> Resolver {
        Resolver::new(Box::new(XmlDocLoader { path: path.into() }), DOCUMENT_CACHE_TIME)
    }

    /// An arithmetic formula over `$symbol` references resolved against
    /// the host node's parent bag.
    pub fn formula(template: &str, symbols: Vec<(String, String)>) -> Resolver {
        Resolver::new(
            Box::new(FormulaLoader {
                template: template.to_string(),
                symbols,
            }),
            0.0,
        )
    }
}

// ------------- Concrete loaders --------------

struct CbLoader<F>(F);

impl<F> LoadValue for CbLoader<F>
where
    F: FnMut(&ResolveContext) -> Result<Value>,
{
    fn load(&mut self, ctx: &ResolveContext) -> Result<Value> {
        (self.0)(ctx)
    }

    fn reconstruction(&self) -> Reconstruction {
        Reconstruction {
            class_name: "CbResolver".to_string(),
            ..Default::default()
        }
    }
}

/// What a transport hands back for a fetched URL.
pub struct FetchedDoc {
    pub data: String,
    pub headers: Vec<(String, String)>,
}

struct UrlLoader {
    url: String,
    fetch: Box<dyn FnMut(&str) -> std::io::Result<FetchedDoc>>,
}

impl LoadValue for UrlLoader {
    fn load(&mut self, _ctx: &ResolveContext) -> Result<Value> {
        let doc = (self.fetch)(&self.url)
            .map_err(|e| BagError::Resolve(format!("fetch '{}': {}", self.url, e)))?;
        let info = Bag::new();
        for (k, v) in doc.headers {
            info.set_item(&escape_label(&k), v)?;
        }
        let out = Bag::new();
        out.set_item("data", doc.data)?;
        out.set_item("info", Value::Bag(info))?;
        Ok(Value::Bag(out))
    }

    fn reconstruction(&self) -> Reconstruction {
        Reconstruction {
            class_name: "UrlResolver".to_string(),
            args: vec![self.url.clone()],
            kwargs: Vec::new(),
        }
    }
}

/// Filters and behavior of [`Resolver::directory`].
#[derive(Clone, Default)]
pub struct DirectoryOptions {
    /// `;`-separated `*`/`?` wildcard patterns; empty matches all.
    pub include: String,
    pub exclude: String,
    /// Include dot-files.
    pub hidden: bool,
    /// Wrap known file types (`xml`, `txt`) as nested lazy documents.
    pub process: bool,
}

fn wildcard_match(patterns: &str, name: &str) -> bool {
    patterns.split(';').filter(|p| !p.is_empty()).any(|p| {
        let mut rx = String::from("^");
        for c in p.chars() {
            match c {
                '*' => rx.push_str(".*"),
                '?' => rx.push('.'),
                other => rx.push_str(&regex::escape(&other.to_string())),
            }
        }
        rx.push('$');
        Regex::new(&rx).map(|r| r.is_match(name)).unwrap_or(false)
    })
}

fn node_label(name: &str) -> String {
    NON_WORD.replace_all(name, "_").to_string()
}

struct DirectoryLoader {
    path: PathBuf,
    options: DirectoryOptions,
}

impl DirectoryLoader {
    fn file_attrs(path: &Path, name: &str) -> Vec<(String, Value)> {
        let mut attrs: Vec<(String, Value)> = vec![
            ("file_name".to_string(), Value::Text(name.to_string())),
            (
                "abs_path".to_string(),
                Value::Text(path.to_string_lossy().into_owned()),
            ),
            ("nodecaption".to_string(), Value::Text(name.to_string())),
        ];
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            attrs.push(("file_ext".to_string(), Value::Text(ext.to_string())));
        }
        if let Ok(meta) = path.metadata() {
            if let Ok(modified) = meta.modified() {
                let mtime = chrono::DateTime::<chrono::Local>::from(modified).naive_local();
                attrs.push(("mtime".to_string(), Value::DateTime(mtime)));
            }
        }
        attrs
    }
}

impl LoadValue for DirectoryLoader {
    fn load(&mut self, _ctx: &ResolveContext) -> Result<Value> {
        let out = Bag::new();
        let mut entries: Vec<_> = std::fs::read_dir(&self.path)?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.options.hidden && name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let is_dir = path.is_dir();
            if !is_dir {
                if !self.options.include.is_empty() && !wildcard_match(&self.options.include, &name)
                {
                    continue;
                }
                if !self.options.exclude.is_empty() && wildcard_match(&self.options.exclude, &name)
                {
                    continue;
                }
            }
            let mut attrs = Self::file_attrs(&path, &name);
            attrs.push((
                "rel_path".to_string(),
                Value::Text(name.clone()),
            ));
            let label = node_label(path.file_stem().and_then(|s| s.to_str()).unwrap_or(&name));
            let node = crate::node::BagNode::new(label, Value::Null);
            node.set_attr(attrs)?;
            if is_dir {
                node.set_resolver(Resolver::directory(path, self.options.clone()));
            } else if self.options.process {
                match path.extension().and_then(|e| e.to_str()) {
                    Some("xml") => node.set_resolver(Resolver::xml_document(path)),
                    Some("txt") => node.set_resolver(Resolver::text_document(path)),
                    _ => {}
                }
            }
            out.insert_node(node, Position::End)?;
        }
        Ok(Value::Bag(out))
    }

    fn reconstruction(&self) -> Reconstruction {
        Reconstruction {
            class_name: "DirectoryResolver".to_string(),
            args: vec![self.path.to_string_lossy().into_owned()],
            kwargs: vec![
                ("include".to_string(), self.options.include.clone()),
                ("exclude".to_string(), self.options.exclude.clone()),
            ],
        }
    }
}

struct TextDocLoader {
    path: PathBuf,
}

impl LoadValue for TextDocLoader {
    fn load(&mut self, _ctx: &ResolveContext) -> Result<Value> {
        Ok(Value::Text(std::fs::read_to_string(&self.path)?))
    }

    fn reconstruction(&self) -> Reconstruction {
        Reconstruction {
            class_name: "TxtDocResolver".to_string(),
            args: vec![self.path.to_string_lossy().into_owned()],
            kwargs: Vec::new(),
        }
    }
}

struct XmlDocLoader {
    path: PathBuf,
}

impl LoadValue for XmlDocLoader {
    fn load(&mut self, _ctx: &ResolveContext) -> Result<Value> {
        let source = std::fs::read_to_string(&self.path)?;
        let bag = crate::xml::from_xml(&source, &crate::xml::XmlOptions::default())?;
        Ok(Value::Bag(bag))
    }

    fn reconstruction(&self) -> Reconstruction {
        Reconstruction {
            class_name: "XmlDocResolver".to_string(),
            args: vec![self.path.to_string_lossy().into_owned()],
            kwargs: Vec::new(),
        }
    }
}

// ------------- Formulas --------------

struct FormulaLoader {
    template: String,
    symbols: Vec<(String, String)>,
}

impl LoadValue for FormulaLoader {
    fn load(&mut self, ctx: &ResolveContext) -> Result<Value> {
        let bag = ctx
            .node
            .as_ref()
            .and_then(|n| n.parent_bag())
            .ok_or_else(|| BagError::Resolve("formula has no parent bag".to_string()))?;
        let expr = parse_formula(&self.template)?;
        let symbols = &self.symbols;
        let mut lookup = |name: &str, fresh: bool| -> Result<f64> {
            let path = symbols
                .iter()
                .find(|(s, _)| s == name)
                .map(|(_, p)| p.as_str())
                .ok_or_else(|| BagError::Resolve(format!("unknown symbol '{}'", name)))?;
            if fresh {
                if let Some(node) = bag.get_node(path) {
                    node.reset_resolver();
                }
            }
            let value = bag
                .try_get_item(path)?
                .ok_or_else(|| BagError::Resolve(format!("symbol '{}' misses '{}'", name, path)))?;
            match value {
                Value::Long(n) => Ok(n as f64),
                Value::Real(r) => Ok(r),
                Value::Decimal(d) => {
                    use bigdecimal::ToPrimitive;
                    d.to_f64()
                        .ok_or_else(|| BagError::Resolve(format!("symbol '{}' overflows", name)))
                }
                other => Err(BagError::Resolve(format!(
                    "symbol '{}' is not numeric: {}",
                    name, other
                ))),
            }
        };
        let result = eval_formula(&expr, &mut lookup)?;
        Ok(Value::Real(result))
    }

    fn reconstruction(&self) -> Reconstruction {
        Reconstruction {
            class_name: "BagFormula".to_string(),
            args: vec![self.template.clone()],
            kwargs: self.symbols.clone(),
        }
    }
}

enum Expr {
    Num(f64),
    /// `(name, fresh)` where fresh comes from a `$_name` reference.
    Sym(String, bool),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

#[derive(PartialEq, Debug, Clone)]
enum Token {
    Num(f64),
    Sym(String, bool),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(template: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '$' => {
                chars.next();
                let fresh = chars.peek() == Some(&'_');
                if fresh {
                    chars.next();
                }
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if name.is_empty() {
                    return Err(BagError::Resolve("empty symbol reference".to_string()));
                }
                tokens.push(Token::Sym(name, fresh));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut num = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        num.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = num
                    .parse::<f64>()
                    .map_err(|_| BagError::Resolve(format!("bad number '{}'", num)))?;
                tokens.push(Token::Num(value));
            }
            other => {
                return Err(BagError::Resolve(format!(
                    "unexpected character '{}' in formula",
                    other
                )))
            }
        }
    }
    Ok(tokens)
}

fn parse_formula(template: &str) -> Result<Expr> {
    let tokens = tokenize(template)?;
    let mut pos = 0;
    let expr = parse_sum(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(BagError::Resolve("trailing tokens in formula".to_string()));
    }
    Ok(expr)
}

fn parse_sum(tokens: &[Token], pos: &mut usize) -> Result<Expr> {
    let mut left = parse_product(tokens, pos)?;
    while let Some(op) = tokens.get(*pos) {
        match op {
            Token::Plus => {
                *pos += 1;
                left = Expr::Add(Box::new(left), Box::new(parse_product(tokens, pos)?));
            }
            Token::Minus => {
                *pos += 1;
                left = Expr::Sub(Box::new(left), Box::new(parse_product(tokens, pos)?));
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_product(tokens: &[Token], pos: &mut usize) -> Result<Expr> {
    let mut left = parse_atom(tokens, pos)?;
    while let Some(op) = tokens.get(*pos) {
        match op {
            Token::Star => {
                *pos += 1;
                left = Expr::Mul(Box::new(left), Box::new(parse_atom(tokens, pos)?));
            }
            Token::Slash => {
                *pos += 1;
                left = Expr::Div(Box::new(left), Box::new(parse_atom(tokens, pos)?));
            }
            _ => break,
        }
    }
    Ok(left)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<Expr> {
    match tokens.get(*pos) {
        Some(Token::Num(n)) => {
            *pos += 1;
            Ok(Expr::Num(*n))
        }
        Some(Token::Sym(name, fresh)) => {
            *pos += 1;
            Ok(Expr::Sym(name.clone(), *fresh))
        }
        Some(Token::Minus) => {
            *pos += 1;
            Ok(Expr::Neg(Box::new(parse_atom(tokens, pos)?)))
        }
        Some(Token::LParen) => {
            *pos += 1;
            let inner = parse_sum(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(inner)
                }
                _ => Err(BagError::Resolve("unbalanced parenthesis".to_string())),
            }
        }
        other => Err(BagError::Resolve(format!(
            "unexpected token {:?} in formula",
            other
        ))),
    }
}

fn eval_formula(
    expr: &Expr,
    lookup: &mut dyn FnMut(&str, bool) -> Result<f64>,
) -> Result<f64> {
    Ok(match expr {
        Expr::Num(n) => *n,
        Expr::Sym(name, fresh) => lookup(name, *fresh)?,
        Expr::Neg(e) => -eval_formula(e, lookup)?,
        Expr::Add(a, b) => eval_formula(a, lookup)? + eval_formula(b, lookup)?,
        Expr::Sub(a, b) => eval_formula(a, lookup)? - eval_formula(b, lookup)?,
        Expr::Mul(a, b) => eval_formula(a, lookup)? * eval_formula(b, lookup)?,
        Expr::Div(a, b) => eval_formula(a, lookup)? / eval_formula(b, lookup)?,
    })
}
