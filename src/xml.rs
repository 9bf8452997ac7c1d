//! The typed XML wire format.
//!
//! A bag serializes under a `<GenRoBag>` root; each node becomes an
//! element whose `_T` attribute carries the wire code of its value
//! (plain text needs none). Nested bags nest, homogeneous lists can
//! travel as `A<code>` blocks of `<C>` children, and attributes ride as
//! typed `text::CODE` attribute values.
//!
//! Parsing is an explicit pull loop over a frame stack rather than
//! callbacks. Any other root tag switches to a generic dialect that
//! reads arbitrary XML into string leaves, with interleaved text
//! collected under `_` labels.
//!
//! Ill-formed input is retried: the byte at the reported error position
//! is stripped and the document reparsed from the start. Every retry
//! shortens the source, so the loop is bounded by the input length.

use std::rc::Rc;

use lazy_static::lazy_static;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use regex::Regex;
use tracing::warn;

use crate::bag::Bag;
use crate::catalog::{to_json_text, TypeCatalog, Value, ValueKind};
use crate::error::{BagError, Result};
use crate::node::BagNode;
use crate::path::Position;

lazy_static! {
    static ref TAG_SANITIZE: Regex = Regex::new(r"\W").unwrap();
}

/// Knobs of the codec. `Default` gives the typed dialect: declaration,
/// `<GenRoBag>` root, `_T` markers and typed attribute values.
#[derive(Clone, Default)]
pub struct XmlOptions {
    /// Suppress the `<?xml ...?>` declaration.
    pub omit_declaration: bool,
    /// Suppress the `<GenRoBag>` wrapper element.
    pub omit_root: bool,
    /// Plain-text attribute values instead of `text::CODE`.
    pub untyped_attributes: bool,
    /// Suppress `_T` value type markers.
    pub untyped_values: bool,
    /// Serialize resolver-backed nodes as `_resolver` metadata instead
    /// of resolving them.
    pub unresolved: bool,
    /// Emit homogeneous lists as `A<code>` blocks of `<C>` children.
    pub typed_arrays: bool,
    /// Extra attributes on the root element.
    pub root_attributes: Vec<(String, Value)>,
    /// Conversion rules; the standard catalog when absent.
    pub catalog: Option<Rc<TypeCatalog>>,
}

impl XmlOptions {
    fn catalog(&self) -> Rc<TypeCatalog> {
        self.catalog
            .clone()
            .unwrap_or_else(|| Rc::new(TypeCatalog::standard()))
    }
}

impl Bag {
    pub fn to_xml(&self, options: &XmlOptions) -> Result<String> {
        to_xml(self, options)
    }

    pub fn from_xml(source: &str, options: &XmlOptions) -> Result<Bag> {
        from_xml(source, options)
    }
}

// ------------- Serialization --------------

/// Element names must be words: non-word characters collapse to a
/// single underscore and a leading digit gets one prefixed. A changed
/// label is preserved in a `_tag` attribute.
fn sanitize_tag(label: &str) -> String {
    let mut tag = TAG_SANITIZE.replace_all(label, "_").to_string();
    while tag.contains("__") {
        tag = tag.replace("__", "_");
    }
    if tag.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        tag = format!("_{}", tag);
    }
    tag
}

fn homogeneous_code(items: &[Value], catalog: &TypeCatalog) -> Option<String> {
    let first = items.first()?;
    match first.kind() {
        ValueKind::Bag | ValueKind::Js | ValueKind::Null => return None,
        _ => {}
    }
    if items.iter().all(|v| v.kind() == first.kind()) {
        Some(catalog.code_of(first).to_string())
    } else {
        None
    }
}

pub fn to_xml(bag: &Bag, options: &XmlOptions) -> Result<String> {
    let catalog = options.catalog();
    let mut writer = Writer::new(Vec::new());
    if !options.omit_declaration {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    }
    if options.omit_root {
        write_bag(&mut writer, bag, &catalog, options)?;
    } else {
        let mut root = BytesStart::new("GenRoBag");
        for (k, v) in &options.root_attributes {
            let text = attr_text(v, &catalog, options);
            root.push_attribute((k.as_str(), text.as_str()));
        }
        writer.write_event(Event::Start(root))?;
        write_bag(&mut writer, bag, &catalog, options)?;
        writer.write_event(Event::End(BytesEnd::new("GenRoBag")))?;
    }
    String::from_utf8(writer.into_inner()).map_err(|e| BagError::XmlParse {
        message: e.to_string(),
        position: None,
    })
}

fn attr_text(value: &Value, catalog: &TypeCatalog, options: &XmlOptions) -> String {
    if options.untyped_attributes {
        catalog.to_text(value, false, None)
    } else {
        catalog.to_typed_text(value)
    }
}

fn write_bag(
    writer: &mut Writer<Vec<u8>>,
    bag: &Bag,
    catalog: &TypeCatalog,
    options: &XmlOptions,
) -> Result<()> {
    for node in bag.nodes() {
        write_node(writer, &node, catalog, options)?;
    }
    Ok(())
}

fn write_node(
    writer: &mut Writer<Vec<u8>>,
    node: &BagNode,
    catalog: &TypeCatalog,
    options: &XmlOptions,
) -> Result<()> {
    let label = node.label();
    let tag = sanitize_tag(&label);
    let mut elem = BytesStart::new(tag.clone());
    if tag != label {
        elem.push_attribute(("_tag", label.as_str()));
    }
    for (k, v) in node.attributes() {
        let text = attr_text(&v, catalog, options);
        elem.push_attribute((k.as_str(), text.as_str()));
    }
    if options.unresolved && node.has_resolver() {
        if let Some(rec) = node.resolver_reconstruction() {
            let json = serde_json::to_string(&rec)
                .map_err(|e| BagError::Resolve(e.to_string()))?;
            elem.push_attribute(("_resolver", json.as_str()));
        }
        writer.write_event(Event::Empty(elem))?;
        return Ok(());
    }
    let value = node.get_value()?;
    match value {
        Value::Bag(b) if !b.is_empty() => {
            writer.write_event(Event::Start(elem))?;
            write_bag(writer, &b, catalog, options)?;
            writer.write_event(Event::End(BytesEnd::new(tag)))?;
        }
        Value::Bag(_) => {
            if !options.untyped_values {
                elem.push_attribute(("_T", "BAG"));
            }
            writer.write_event(Event::Empty(elem))?;
        }
        Value::List(ref items) if options.typed_arrays && !items.is_empty() => {
            match homogeneous_code(items, catalog) {
                Some(code) => {
                    let array_code = format!("A{}", code);
                    if !options.untyped_values {
                        elem.push_attribute(("_T", array_code.as_str()));
                    }
                    writer.write_event(Event::Start(elem))?;
                    for item in items {
                        let cell = BytesStart::new("C");
                        let text = catalog.to_text(item, false, None);
                        writer.write_event(Event::Start(cell))?;
                        writer.write_event(Event::Text(BytesText::new(&text)))?;
                        writer.write_event(Event::End(BytesEnd::new("C")))?;
                    }
                    writer.write_event(Event::End(BytesEnd::new(tag)))?;
                }
                None => write_scalar(writer, elem, tag, &value, catalog, options)?,
            }
        }
        Value::Null => {
            if !options.untyped_values {
                elem.push_attribute(("_T", "NN"));
            }
            writer.write_event(Event::Empty(elem))?;
        }
        other => write_scalar(writer, elem, tag, &other, catalog, options)?,
    }
    Ok(())
}

fn write_scalar(
    writer: &mut Writer<Vec<u8>>,
    mut elem: BytesStart<'static>,
    tag: String,
    value: &Value,
    catalog: &TypeCatalog,
    options: &XmlOptions,
) -> Result<()> {
    let (text, code) = match value {
        // lists and dicts travel as JSON text under the JS code
        Value::List(_) | Value::Dict(_) => (to_json_text(value), "JS".to_string()),
        other => catalog.to_text_and_type(other),
    };
    if code != "T" && !options.untyped_values {
        elem.push_attribute(("_T", code.as_str()));
    }
    if text.is_empty() {
        writer.write_event(Event::Empty(elem))?;
    } else {
        writer.write_event(Event::Start(elem))?;
        writer.write_event(Event::Text(BytesText::new(&text)))?;
        writer.write_event(Event::End(BytesEnd::new(tag)))?;
    }
    Ok(())
}

// ------------- Parsing --------------

struct Frame {
    label: String,
    bag: Bag,
    attrs: Vec<(String, Value)>,
    code: Option<String>,
    text: String,
    array_items: Vec<Value>,
    /// The dialect root element, transparent in the result.
    wrapper: bool,
}

impl Frame {
    fn new(label: String) -> Frame {
        Frame {
            label,
            bag: Bag::new(),
            attrs: Vec::new(),
            code: None,
            text: String::new(),
            array_items: Vec::new(),
            wrapper: false,
        }
    }

    /// An array frame is one whose `_T` starts with `A` but is not
    /// itself a registered code (so the `A` text alias stays intact).
    fn is_array(&self, catalog: &TypeCatalog) -> bool {
        match &self.code {
            Some(c) => c.len() > 1 && c.starts_with('A') && catalog.kind_of_code(c).is_none(),
            None => false,
        }
    }

    /// Interleaved text becomes a `_` node. Called unconditionally when
    /// a child element opens; on close only when children exist, since
    /// an element without children keeps its text as the scalar value.
    fn flush_text(&mut self) -> Result<()> {
        let text = std::mem::take(&mut self.text);
        if !text.trim().is_empty() {
            self.bag
                .insert_node(BagNode::new("_", Value::Text(text)), Position::End)?;
        }
        Ok(())
    }
}

enum Attempt {
    Done(Bag),
    Retry { pos: usize, message: String },
}

pub fn from_xml(source: &str, options: &XmlOptions) -> Result<Bag> {
    let catalog = options.catalog();
    let mut src = source.to_string();
    let mut last_pos = None;
    loop {
        if src.trim().is_empty() {
            return Err(BagError::XmlParse {
                message: "no parsable content left".to_string(),
                position: last_pos,
            });
        }
        match parse_once(&src, &catalog)? {
            Attempt::Done(bag) => return Ok(bag),
            Attempt::Retry { pos, message } => {
                let mut pos = pos.min(src.len() - 1);
                while !src.is_char_boundary(pos) {
                    pos -= 1;
                }
                warn!(position = pos, message, "stripping invalid character, reparsing");
                last_pos = Some(pos as u64);
                src.remove(pos);
            }
        }
    }
}

fn parse_once(src: &str, catalog: &TypeCatalog) -> Result<Attempt> {
    let mut reader = Reader::from_str(src);
    let result = Bag::new();
    let mut stack: Vec<Frame> = Vec::new();
    // None until the root element decides the dialect
    let mut typed: Option<bool> = None;
    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Err(e) => {
                return Ok(Attempt::Retry {
                    pos,
                    message: e.to_string(),
                })
            }
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                let frame = match open_frame(&e, &mut stack, &mut typed, catalog, pos)? {
                    Ok(frame) => frame,
                    Err(retry) => return Ok(retry),
                };
                stack.push(frame);
            }
            Ok(Event::Empty(e)) => {
                let frame = match open_frame(&e, &mut stack, &mut typed, catalog, pos)? {
                    Ok(frame) => frame,
                    Err(retry) => return Ok(retry),
                };
                close_frame(frame, &mut stack, &result, typed == Some(true), catalog)?;
            }
            Ok(Event::End(_)) => {
                if let Some(frame) = stack.pop() {
                    close_frame(frame, &mut stack, &result, typed == Some(true), catalog)?;
                }
            }
            Ok(Event::Text(e)) => match e.unescape() {
                Ok(text) => {
                    if let Some(frame) = stack.last_mut() {
                        frame.text.push_str(&text);
                    }
                }
                Err(e) => {
                    return Ok(Attempt::Retry {
                        pos,
                        message: e.to_string(),
                    })
                }
            },
            Ok(Event::CData(e)) => {
                if let Some(frame) = stack.last_mut() {
                    frame.text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_))
            | Ok(Event::DocType(_)) => {}
        }
    }
    // unclosed frames (truncated input) fold into the result anyway
    while let Some(frame) = stack.pop() {
        close_frame(frame, &mut stack, &result, typed == Some(true), catalog)?;
    }
    Ok(Attempt::Done(result))
}

/// Build a frame from a start element: decode the name, classify the
/// dialect at the root, and split the reserved attributes (`_T`/`T`,
/// `_tag`) from the ordinary ones.
#[allow(clippy::type_complexity)]
fn open_frame(
    e: &BytesStart,
    stack: &mut [Frame],
    typed: &mut Option<bool>,
    catalog: &TypeCatalog,
    pos: usize,
) -> Result<std::result::Result<Frame, Attempt>> {
    if let Some(parent) = stack.last_mut() {
        parent.flush_text()?;
    }
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let at_root = stack.is_empty();
    if typed.is_none() {
        *typed = Some(name.eq_ignore_ascii_case("genrobag"));
    }
    let mut frame = Frame::new(name);
    if at_root && *typed == Some(true) {
        frame.wrapper = true;
        return Ok(Ok(frame));
    }
    for attr in e.attributes() {
        let attr = match attr {
            Ok(a) => a,
            Err(err) => {
                return Ok(Err(Attempt::Retry {
                    pos,
                    message: err.to_string(),
                }))
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = match attr.unescape_value() {
            Ok(v) => v.into_owned(),
            Err(err) => {
                return Ok(Err(Attempt::Retry {
                    pos,
                    message: err.to_string(),
                }))
            }
        };
        match key.as_str() {
            "_T" | "T" => frame.code = Some(raw),
            "_tag" => frame.label = raw,
            _ => frame.attrs.push((key, catalog.from_typed_text(&raw))),
        }
    }
    Ok(Ok(frame))
}

fn close_frame(
    mut frame: Frame,
    stack: &mut Vec<Frame>,
    result: &Bag,
    typed: bool,
    catalog: &TypeCatalog,
) -> Result<()> {
    // an element directly under an array block is an item, not a node
    if let Some(parent) = stack.last_mut() {
        if parent.is_array(catalog) {
            let subcode = &parent.code.clone().unwrap_or_default()[1..];
            let text = std::mem::take(&mut frame.text);
            let item = if subcode.is_empty() {
                Value::Text(text)
            } else {
                catalog
                    .from_text(&text, subcode)
                    .unwrap_or(Value::Text(text))
            };
            parent.array_items.push(item);
            return Ok(());
        }
    }
    if !frame.bag.is_empty() {
        frame.flush_text()?;
    }
    let target = match stack.last() {
        Some(parent) => parent.bag.clone(),
        None => result.clone(),
    };
    if frame.wrapper {
        for node in frame.bag.nodes() {
            target.insert_node(node, Position::End)?;
        }
        return Ok(());
    }
    let value = if !frame.bag.is_empty() {
        Value::Bag(frame.bag)
    } else if frame.is_array(catalog) {
        Value::List(frame.array_items)
    } else {
        let text = if frame.text.trim().is_empty() {
            String::new()
        } else {
            std::mem::take(&mut frame.text)
        };
        if typed {
            let code = frame.code.clone().unwrap_or_else(|| "T".to_string());
            catalog.from_text(&text, &code).unwrap_or(Value::Text(text))
        } else {
            Value::Text(text)
        }
    };
    let node = BagNode::new(frame.label, value);
    if !frame.attrs.is_empty() {
        node.0.borrow_mut().attr = frame.attrs;
    }
    target.insert_node(node, Position::End)?;
    Ok(())
}
