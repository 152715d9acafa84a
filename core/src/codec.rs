//! Conversions between typed values, request bodies, and generic response
//! shapes.
//!
//! # Design
//! The server wants booleans as `0`/`1` and dates in a fixed lexical form with
//! no zone. `WireValue` captures that encoding once so `PropertyList::add`
//! stays generic. Generic response shapes are `serde_json` maps for JSON
//! bodies and a small owned `XmlElement` tree for XML bodies.

use chrono::NaiveDateTime;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use serde_json::{Map, Value};

use crate::property_list::PropertyList;

/// Lexical date form accepted by CUPI property updates.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A value that can be written into a `PropertyList`.
///
/// `None` means "omit the property entirely".
pub trait WireValue {
    fn to_wire(&self) -> Option<String>;
}

impl WireValue for str {
    fn to_wire(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl WireValue for String {
    fn to_wire(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl WireValue for bool {
    fn to_wire(&self) -> Option<String> {
        Some(encode_bool(*self).to_string())
    }
}

macro_rules! wire_int {
    ($($t:ty),*) => {
        $(impl WireValue for $t {
            fn to_wire(&self) -> Option<String> {
                Some(self.to_string())
            }
        })*
    };
}

wire_int!(i32, i64, u16, u32, u64, usize);

impl WireValue for NaiveDateTime {
    fn to_wire(&self) -> Option<String> {
        Some(encode_date(self))
    }
}

impl WireValue for Option<NaiveDateTime> {
    fn to_wire(&self) -> Option<String> {
        self.as_ref().map(encode_date)
    }
}

impl<T: WireValue + ?Sized> WireValue for &T {
    fn to_wire(&self) -> Option<String> {
        (**self).to_wire()
    }
}

pub fn encode_bool(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

pub fn encode_date(value: &NaiveDateTime) -> String {
    value.format(DATE_FORMAT).to_string()
}

/// Read a boolean the way the server emits it: `true`/`false` or `1`/`0`.
pub fn decode_bool(text: &str) -> Option<bool> {
    match text.trim() {
        "1" => Some(true),
        "0" => Some(false),
        t if t.eq_ignore_ascii_case("true") => Some(true),
        t if t.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

pub fn decode_date(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(text, DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Flat `{"name":"value",...}` body, keys in insertion order.
pub fn to_json_body(props: &PropertyList) -> String {
    // serde_json's Map reorders keys unless preserve_order is enabled, so the
    // object is written by hand with serde_json doing the string escaping.
    let mut out = String::from("{");
    for (i, pair) in props.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(pair.name.clone()).to_string());
        out.push(':');
        out.push_str(&Value::String(pair.value.clone()).to_string());
    }
    out.push('}');
    out
}

/// Flat `<root><name>value</name>...</root>` body with text escaped.
pub fn to_xml_body(root: &str, props: &PropertyList) -> Result<String, String> {
    let mut out = Vec::new();
    let mut writer = Writer::new(&mut out);
    writer
        .write_event(Event::Start(BytesStart::new(root)))
        .map_err(|e| e.to_string())?;
    for pair in props.iter() {
        writer
            .write_event(Event::Start(BytesStart::new(pair.name.as_str())))
            .map_err(|e| e.to_string())?;
        writer
            .write_event(Event::Text(BytesText::new(pair.value.as_str())))
            .map_err(|e| e.to_string())?;
        writer
            .write_event(Event::End(BytesEnd::new(pair.name.as_str())))
            .map_err(|e| e.to_string())?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(root)))
        .map_err(|e| e.to_string())?;
    String::from_utf8(out).map_err(|e| e.to_string())
}

/// Parse a JSON body into a generic object. Arrays and scalars are rejected.
pub fn json_to_map(body: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Flatten JSON scalars to the string form the server uses for every
/// property value.
pub fn json_value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Owned XML element tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Leaf children as `name -> text`; later duplicates win.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        for child in &self.children {
            if child.children.is_empty() {
                map.insert(child.name.clone(), Value::String(child.text.clone()));
            }
        }
        map
    }
}

/// Best-effort parse. JSON bodies, truncated documents and mismatched tags
/// all yield `None`.
pub fn parse_xml(text: &str) -> Option<XmlElement> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Err(_) => return None,
            Ok(Event::Eof) => break,
            Ok(Event::Start(e)) => {
                stack.push(element_from(&e)?);
            }
            Ok(Event::Empty(e)) => {
                let element = element_from(&e)?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::End(_)) => {
                let element = stack.pop()?;
                attach(&mut stack, &mut root, element)?;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().ok()?;
                match stack.last_mut() {
                    Some(current) => current.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return None,
                }
            }
            Ok(Event::CData(c)) => {
                let current = stack.last_mut()?;
                current.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(_) => {}
        }
    }

    if stack.is_empty() {
        root
    } else {
        None
    }
}

fn element_from(start: &BytesStart<'_>) -> Option<XmlElement> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.ok()?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().ok()?.into_owned();
        attributes.push((key, value));
    }
    Some(XmlElement {
        name,
        attributes,
        ..XmlElement::default()
    })
}

fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) -> Option<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        // A second top-level element is not a document.
        None if root.is_some() => return None,
        None => *root = Some(element),
    }
    Some(())
}
