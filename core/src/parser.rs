//! Extraction of structured data from raw response bodies.
//!
//! # Design
//! CUPI list responses wrap their payload under a key named after the object
//! type (`{"User":[...],"@total":"3"}`), and a one-element list arrives as a
//! bare object instead of an array. Older servers also emit the paging total
//! as `{"@total"="3",` which is not JSON at all. Everything here tolerates
//! those variants and degrades to "nothing found" instead of failing:
//! a malformed element must not abort a batch fetch.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::codec::{self, XmlElement};
use crate::diagnostics::Diagnostics;

/// Byte offset within which the `"@total"` key must start for the fast scan.
const PAGING_SCAN_WINDOW: usize = 64;

const TOTAL_KEY: &str = "\"@total\"";

/// Supplies the envelope key a type is wrapped under in list responses.
pub trait WireType {
    const TYPE_NAME: &'static str;
}

/// Remove the `"<TypeName>":` envelope so the remainder decodes as a bare
/// object or list. With `add_brackets`, a lone object is wrapped in `[...]`.
///
/// Bodies without the envelope token are returned unchanged.
pub fn strip_wrapper_envelope(body: &str, type_name: &str, add_brackets: bool) -> String {
    let token = format!("\"{type_name}\":");
    if !body.contains(&token) {
        return body.to_string();
    }

    if let Ok(Value::Object(mut map)) = serde_json::from_str::<Value>(body) {
        if let Some(inner) = map.remove(type_name) {
            let inner = match inner {
                Value::Array(_) => inner,
                other if add_brackets => Value::Array(vec![other]),
                other => other,
            };
            return inner.to_string();
        }
    }

    // Not valid JSON as a whole; cut the text after the token instead.
    let start = body.find(&token).map_or(0, |i| i + token.len());
    let rest = body[start..].trim_end();
    let rest = rest.strip_suffix('}').unwrap_or(rest).trim();
    if add_brackets && !rest.starts_with('[') {
        format!("[{rest}]")
    } else {
        rest.to_string()
    }
}

/// Paging total from a JSON list body, recognizing both `"@total":"N"` and
/// `"@total"="N"`. `None` when neither is present or the number is bad.
pub fn paging_total(body: &str) -> Option<usize> {
    scan_paging_total(body).or_else(|| parse_paging_total(body))
}

/// Fast path: look for the key near the start of the body only.
fn scan_paging_total(body: &str) -> Option<usize> {
    let head = &body.as_bytes()[..body.len().min(PAGING_SCAN_WINDOW)];
    let key = TOTAL_KEY.as_bytes();
    let start = head.windows(key.len()).position(|w| w == key)?;

    let rest = body[start + key.len()..].trim_start();
    let rest = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('='))?
        .trim_start();
    let rest = rest.strip_prefix('"').unwrap_or(rest);
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Slow path for bodies where the total trails the list.
fn parse_paging_total(body: &str) -> Option<usize> {
    let map = codec::json_to_map(body)?;
    match map.get("@total")? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        _ => None,
    }
}

/// `total` attribute on the root element of an XML list body.
pub fn paging_total_xml(body: &str) -> Option<usize> {
    codec::parse_xml(body)?
        .attribute("total")
        .and_then(|t| t.trim().parse().ok())
}

/// Best-effort XML parse; JSON-mode and other non-XML bodies yield `None`.
pub fn try_parse_xml(text: &str) -> Option<XmlElement> {
    if text.trim().is_empty() {
        return None;
    }
    codec::parse_xml(text)
}

/// Trailing id from a body such as `/vmrest/users/3b5d...` or
/// `vmrest/calls/7`.
pub fn extract_object_id(body: &str) -> Option<String> {
    let text = body.trim().trim_matches('"');
    if text.is_empty()
        || text.starts_with(['{', '[', '<'])
        || !text.contains('/')
        || text.contains(char::is_whitespace)
    {
        return None;
    }
    let path = text.split(['?', '#']).next().unwrap_or(text);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// Human-readable reason the server embedded in an error body, if any.
pub fn server_message(body: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return find_json_message(&value);
    }
    let root = try_parse_xml(body)?;
    find_xml_message(&root)
}

fn find_json_message(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            for key in ["message", "errorMessage"] {
                if let Some(Value::String(s)) = map.get(key) {
                    if !s.is_empty() {
                        return Some(s.clone());
                    }
                }
            }
            map.values().find_map(find_json_message)
        }
        Value::Array(items) => items.iter().find_map(find_json_message),
        _ => None,
    }
}

fn find_xml_message(element: &XmlElement) -> Option<String> {
    if element.name == "message" && !element.text.is_empty() {
        return Some(element.text.clone());
    }
    element.children.iter().find_map(find_xml_message)
}

/// Typed decoding of list and single-object bodies.
///
/// Decode failures are reported to the diagnostics channel and replaced by
/// an empty list or a default instance.
#[derive(Debug, Clone, Default)]
pub struct ResponseParser {
    diagnostics: Diagnostics,
}

impl ResponseParser {
    pub fn new(diagnostics: Diagnostics) -> Self {
        Self { diagnostics }
    }

    pub fn parse_object_list<T>(&self, body: &str, type_name: Option<&str>) -> Vec<T>
    where
        T: DeserializeOwned + WireType,
    {
        self.decode_list(body, type_name.unwrap_or(T::TYPE_NAME))
    }

    pub fn parse_object<T>(&self, body: &str, type_name: Option<&str>) -> T
    where
        T: DeserializeOwned + Default + WireType,
    {
        let name = type_name.unwrap_or(T::TYPE_NAME);
        if body.trim().is_empty() {
            self.diagnostics.debug(format!("empty body when decoding {name}"));
            return T::default();
        }
        let stripped = strip_wrapper_envelope(body, name, false);
        match serde_json::from_str::<T>(&stripped) {
            Ok(value) => value,
            Err(e) => {
                self.diagnostics
                    .error(format!("failed to decode {name}: {e}; body: {}", snippet(body)));
                T::default()
            }
        }
    }

    /// List body as generic JSON objects, for callers without a typed shape.
    pub fn parse_json_maps(&self, body: &str, type_name: &str) -> Vec<Map<String, Value>> {
        self.decode_list(body, type_name)
    }

    /// `<TypeName>` children of an XML list body as `name -> text` maps.
    pub fn parse_xml_maps(&self, body: &str, type_name: &str) -> Vec<Map<String, Value>> {
        match try_parse_xml(body) {
            Some(root) if root.name == type_name => vec![root.to_map()],
            Some(root) => root.children_named(type_name).map(XmlElement::to_map).collect(),
            None => {
                self.diagnostics
                    .error(format!("body is not XML when decoding {type_name} list"));
                Vec::new()
            }
        }
    }

    /// Paging total, 0 when no recognizable total is present.
    pub fn extract_paging_total(&self, body: &str) -> usize {
        paging_total(body).unwrap_or_else(|| {
            self.diagnostics
                .debug(format!("no paging total found in: {}", snippet(body)));
            0
        })
    }

    pub fn extract_paging_total_xml(&self, body: &str) -> usize {
        paging_total_xml(body).unwrap_or(0)
    }

    fn decode_list<T: DeserializeOwned>(&self, body: &str, type_name: &str) -> Vec<T> {
        if body.trim().is_empty() {
            return Vec::new();
        }
        let stripped = strip_wrapper_envelope(body, type_name, true);
        // An empty result set is just `{"@total":"0"}` with no envelope.
        if stripped == body && paging_total(body) == Some(0) {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<T>>(&stripped) {
            Ok(items) => items,
            Err(e) => {
                self.diagnostics.error(format!(
                    "failed to decode {type_name} list: {e}; body: {}",
                    snippet(body)
                ));
                Vec::new()
            }
        }
    }
}

fn snippet(body: &str) -> &str {
    match body.char_indices().nth(200) {
        Some((i, _)) => &body[..i],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticLevel;
    use serde::Deserialize;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default, Deserialize, PartialEq)]
    #[serde(rename_all = "PascalCase", default)]
    struct Handler {
        object_id: String,
        display_name: String,
    }

    impl WireType for Handler {
        const TYPE_NAME: &'static str = "Callhandler";
    }

    fn recording_parser() -> (ResponseParser, Arc<Mutex<Vec<DiagnosticLevel>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let parser = ResponseParser::new(Diagnostics::with_hook(move |d| sink.lock().unwrap().push(d.level)));
        (parser, seen)
    }

    #[test]
    fn strip_is_identity_without_envelope() {
        let body = r#"{"ObjectId":"1","DisplayName":"Main"}"#;
        assert_eq!(strip_wrapper_envelope(body, "Callhandler", true), body);
        assert_eq!(strip_wrapper_envelope(body, "Callhandler", false), body);
        assert_eq!(strip_wrapper_envelope("", "User", true), "");
    }

    #[test]
    fn strip_wraps_single_object_when_asked() {
        let body = r#"{"@total":"1","User":{"Alias":"jdoe"}}"#;
        assert_eq!(strip_wrapper_envelope(body, "User", true), r#"[{"Alias":"jdoe"}]"#);
        assert_eq!(strip_wrapper_envelope(body, "User", false), r#"{"Alias":"jdoe"}"#);
    }

    #[test]
    fn strip_falls_back_to_text_cut_for_variant_total() {
        let body = r#"{"@total"="2","User":[{"Alias":"a"},{"Alias":"b"}]}"#;
        assert_eq!(
            strip_wrapper_envelope(body, "User", true),
            r#"[{"Alias":"a"},{"Alias":"b"}]"#
        );
    }

    #[test]
    fn paging_total_recognizes_both_spellings() {
        assert_eq!(paging_total(r#"{"@total":"5","User":[]}"#), Some(5));
        assert_eq!(paging_total(r#"{"@total"="5","User":[]}"#), Some(5));
        assert_eq!(paging_total(r#"{"User":[{"Alias":"jdoe"}],"@total":"1"}"#), Some(1));
        assert_eq!(paging_total(r#"{"@total":12}"#), Some(12));
        assert_eq!(paging_total(r#"{"User":[]}"#), None);
        assert_eq!(paging_total(r#"{"@total":"abc","User":[]}"#), None);
    }

    #[test]
    fn paging_total_defaults_to_zero_with_diagnostic() {
        let (parser, seen) = recording_parser();
        assert_eq!(parser.extract_paging_total(r#"{"User":[]}"#), 0);
        assert_eq!(parser.extract_paging_total("not json"), 0);
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(parser.extract_paging_total(r#"{"@total":"5",}"#), 5);
    }

    #[test]
    fn xml_paging_total_reads_root_attribute() {
        assert_eq!(paging_total_xml(r#"<Users total="7"><User/></Users>"#), Some(7));
        assert_eq!(paging_total_xml("<Users/>"), None);
        let parser = ResponseParser::default();
        assert_eq!(parser.extract_paging_total_xml(r#"{"@total":"3"}"#), 0);
    }

    #[test]
    fn object_list_handles_wrapped_single_and_empty() {
        let (parser, seen) = recording_parser();
        let many: Vec<Handler> = parser.parse_object_list(
            r#"{"@total":"2","Callhandler":[{"ObjectId":"1"},{"ObjectId":"2","DisplayName":"B"}]}"#,
            None,
        );
        assert_eq!(many.len(), 2);
        assert_eq!(many[1].display_name, "B");

        let one: Vec<Handler> =
            parser.parse_object_list(r#"{"@total":"1","Callhandler":{"ObjectId":"9"}}"#, None);
        assert_eq!(one, vec![Handler { object_id: "9".into(), display_name: String::new() }]);

        let none: Vec<Handler> = parser.parse_object_list(r#"{"@total":"0"}"#, None);
        assert!(none.is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn object_list_decode_failure_is_empty_and_reported() {
        let (parser, seen) = recording_parser();
        let items: Vec<Handler> = parser.parse_object_list(r#"{"Callhandler":"garbage"}"#, None);
        assert!(items.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![DiagnosticLevel::Error]);
    }

    #[test]
    fn object_honors_type_name_override() {
        let parser = ResponseParser::default();
        let handler: Handler =
            parser.parse_object(r#"{"Template":{"ObjectId":"t1","DisplayName":"T"}}"#, Some("Template"));
        assert_eq!(handler.object_id, "t1");

        let bare: Handler = parser.parse_object(r#"{"ObjectId":"b"}"#, None);
        assert_eq!(bare.object_id, "b");

        let broken: Handler = parser.parse_object("<html/>", None);
        assert_eq!(broken, Handler::default());
    }

    #[test]
    fn xml_maps_pick_named_children() {
        let parser = ResponseParser::default();
        let body = r#"<Users total="2"><User><Alias>a</Alias></User><User><Alias>b</Alias></User></Users>"#;
        let maps = parser.parse_xml_maps(body, "User");
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[1]["Alias"], "b");
        assert!(parser.parse_xml_maps(r#"{"User":[]}"#, "User").is_empty());
    }

    #[test]
    fn object_id_is_last_path_segment() {
        assert_eq!(extract_object_id("vmrest/calls/7").as_deref(), Some("7"));
        assert_eq!(extract_object_id("/vmrest/users/abc-123\n").as_deref(), Some("abc-123"));
        assert_eq!(extract_object_id("\"/vmrest/distributionlists/x1/\"").as_deref(), Some("x1"));
        assert_eq!(extract_object_id("{\"a\": \"b\"}"), None);
        assert_eq!(extract_object_id("plainname"), None);
        assert_eq!(extract_object_id(r#"{"href":"/vmrest/users/1"}"#), None);
    }

    #[test]
    fn server_message_from_json_and_xml() {
        assert_eq!(
            server_message(r#"{"errors":{"code":"NOT_FOUND","message":"no such user"}}"#).as_deref(),
            Some("no such user")
        );
        assert_eq!(
            server_message("<ErrorDetails><errors><code>X</code><message>bad alias</message></errors></ErrorDetails>")
                .as_deref(),
            Some("bad alias")
        );
        assert_eq!(server_message("plain text"), None);
    }

    #[test]
    fn try_parse_xml_is_none_for_json() {
        assert!(try_parse_xml(r#"{"User":[]}"#).is_none());
        assert!(try_parse_xml("   ").is_none());
        assert_eq!(try_parse_xml("<Users/>").map(|r| r.name), Some("Users".to_string()));
    }
}
