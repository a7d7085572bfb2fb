//! Payload parsers: turn request headers, query string and raw body into
//! the uniform `serde_json::Value` document the rest of the crate walks.

use crate::error::HookError;
use hyper::HeaderMap;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::{Map, Value};

/// MIME-canonical form: first character and characters after `-` are
/// upper-cased, everything else lower-cased (`x-hub-signature-256` ->
/// `X-Hub-Signature-256`).
pub fn canonicalize_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    let mut out = String::new();
                    out.extend(first.to_uppercase());
                    out.push_str(&chars.as_str().to_lowercase());
                    out
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// First value per header name, keyed by canonical header name.
pub fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for name in headers.keys() {
        let canonical = canonicalize_header_name(name.as_str());
        if map.contains_key(&canonical) {
            continue;
        }
        if let Ok(value) = headers.get(name).unwrap().to_str() {
            map.insert(canonical, Value::String(value.to_string()));
        }
    }
    Value::Object(map)
}

/// First value per key, in query-string appearance order.
pub fn query_to_value(query: Option<&str>) -> Value {
    let mut map = Map::new();
    if let Some(query) = query {
        if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
            for (k, v) in pairs {
                map.entry(k).or_insert(Value::String(v));
            }
        }
    }
    Value::Object(map)
}

/// Number-preserving JSON decode. Array-rooted bodies (and any other
/// non-object top level) are wrapped under the key `root` so downstream
/// code can always assume the payload is a mapping.
pub fn parse_json(body: &[u8]) -> Result<Value, HookError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| HookError::Parse(format!("invalid json: {e}")))?;
    Ok(match value {
        Value::Object(_) => value,
        other => {
            let mut map = Map::new();
            map.insert("root".to_string(), other);
            Value::Object(map)
        }
    })
}

/// `key=value&key=value` with first-value-wins semantics.
pub fn parse_form(body: &[u8]) -> Result<Value, HookError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| HookError::Parse(format!("invalid form body: {e}")))?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_str(text)
        .map_err(|e| HookError::Parse(format!("invalid form body: {e}")))?;
    let mut map = Map::new();
    for (k, v) in pairs {
        map.entry(k).or_insert(Value::String(v));
    }
    Ok(Value::Object(map))
}

/// Unrecognized or binary content types produce an empty payload map; the
/// raw bytes remain reachable through the `raw-request-body` argument source.
pub fn parse_raw(_body: &[u8]) -> Result<Value, HookError> {
    Ok(Value::Object(Map::new()))
}

/// mxj-style XML decode: element text becomes a string (or `#text` when the
/// element also carries attributes/children), attributes become `-name`
/// siblings, and repeated sibling tags collapse into an array.
pub fn parse_xml(body: &[u8]) -> Result<Value, HookError> {
    let text = std::str::from_utf8(body)
        .map_err(|e| HookError::Parse(format!("invalid xml: {e}")))?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let root = read_element(&mut reader, None)
        .map_err(|e| HookError::Parse(format!("invalid xml: {e}")))?
        .ok_or_else(|| HookError::Parse("empty xml document".to_string()))?;
    let (root_name, root_value) = root;
    let mut map = Map::new();
    map.insert(root_name, root_value);
    Ok(Value::Object(map))
}

/// Reads one element (the opening tag already consumed by the caller via
/// `start_name`, or the first element found if `start_name` is `None`).
/// Returns `(tag name, value)`.
fn read_element(
    reader: &mut Reader<&[u8]>,
    start_name: Option<(String, Map<String, Value>)>,
) -> quick_xml::Result<Option<(String, Value)>> {
    let (name, mut attrs) = match start_name {
        Some(pair) => pair,
        None => loop {
            match reader.read_event()? {
                Event::Start(ref e) => {
                    break (tag_name(e), attrs_map(e)?);
                }
                Event::Empty(ref e) => {
                    return Ok(Some((tag_name(e), attrs_value(e)?)));
                }
                Event::Eof => return Ok(None),
                _ => continue,
            }
        },
    };

    let mut text = String::new();
    let mut children: Map<String, Value> = Map::new();

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => {
                let child_name = tag_name(e);
                let child_attrs = attrs_map(e)?;
                if let Some((n, v)) = read_element(reader, Some((child_name, child_attrs)))? {
                    insert_child(&mut children, n, v);
                }
            }
            Event::Empty(ref e) => {
                let child_name = tag_name(e);
                let value = attrs_value(e)?;
                insert_child(&mut children, child_name, value);
            }
            Event::Text(ref t) => {
                text.push_str(&t.unescape()?);
            }
            Event::CData(ref t) => {
                text.push_str(std::str::from_utf8(t.as_ref()).unwrap_or_default());
            }
            Event::End(_) => break,
            Event::Eof => break,
            _ => continue,
        }
    }

    let value = if children.is_empty() && attrs.is_empty() {
        Value::String(text)
    } else {
        if !text.trim().is_empty() {
            attrs.insert("#text".to_string(), Value::String(text));
        }
        for (k, v) in children {
            attrs.insert(k, v);
        }
        Value::Object(attrs)
    };
    Ok(Some((name, value)))
}

fn insert_child(children: &mut Map<String, Value>, name: String, value: Value) {
    match children.get_mut(&name) {
        Some(Value::Array(arr)) => arr.push(value),
        Some(existing) => {
            let previous = existing.take();
            *existing = Value::Array(vec![previous, value]);
        }
        None => {
            children.insert(name, value);
        }
    }
}

fn tag_name(e: &quick_xml::events::BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn attrs_map(e: &quick_xml::events::BytesStart) -> quick_xml::Result<Map<String, Value>> {
    let mut map = Map::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = format!("-{}", String::from_utf8_lossy(attr.key.as_ref()));
        let value = attr.unescape_value()?.to_string();
        map.insert(key, Value::String(value));
    }
    Ok(map)
}

fn attrs_value(e: &quick_xml::events::BytesStart) -> quick_xml::Result<Value> {
    let attrs = attrs_map(e)?;
    Ok(if attrs.is_empty() {
        Value::String(String::new())
    } else {
        Value::Object(attrs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn header_names_canonicalize() {
        assert_eq!(canonicalize_header_name("x-hub-signature-256"), "X-Hub-Signature-256");
        assert_eq!(canonicalize_header_name("content-type"), "Content-Type");
    }

    #[test]
    fn json_object_passes_through() {
        let v = parse_json(br#"{"a":1}"#).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn json_array_wraps_under_root() {
        let v = parse_json(br#"[1,2,3]"#).unwrap();
        assert_eq!(v, json!({"root": [1, 2, 3]}));
    }

    #[test]
    fn json_preserves_large_integer_precision() {
        let v = parse_json(br#"{"id":1481231231231231231231231}"#).unwrap();
        assert_eq!(
            crate::value::get_as_string("id", &v).unwrap(),
            "1481231231231231231231231"
        );
    }

    #[test]
    fn form_decodes_first_value_per_key() {
        let v = parse_form(b"user=marcus&user=ignored&repo=x").unwrap();
        assert_eq!(crate::value::get_as_string("user", &v).as_deref(), Some("marcus"));
    }

    #[test]
    fn xml_leaf_elements_become_strings() {
        let v = parse_xml(b"<app><messages><message>hi</message></messages></app>").unwrap();
        assert_eq!(
            crate::value::get_as_string("app.messages.message", &v).as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn xml_repeated_siblings_collapse_to_array() {
        let v = parse_xml(b"<app><item>a</item><item>b</item></app>").unwrap();
        let items = crate::value::get("app.item", &v).unwrap();
        assert_eq!(items, &json!(["a", "b"]));
    }

    #[test]
    fn xml_attributes_become_dash_prefixed_siblings() {
        let v = parse_xml(br#"<app id="7">hello</app>"#).unwrap();
        assert_eq!(crate::value::get_as_string("app.#text", &v).as_deref(), Some("hello"));
        assert_eq!(crate::value::get_as_string("app.-id", &v).as_deref(), Some("7"));
    }
}
