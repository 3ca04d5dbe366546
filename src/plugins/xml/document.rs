//! XML to generic tree conversion
//!
//! Every element becomes an `element` node spanning its whole source text,
//! with its attributes both as a `fields` map (unescaped values) and as
//! `attribute` child nodes spanning the raw value text. Comments of the form
//! `<!-- conform-disable [ids] -->` suppress rules in the enclosing element,
//! `<!-- conform-disable-next [ids] -->` in the next sibling element.

use crate::rules::{FIELDS_ATTR, FIELD_KIND, INSERT_AT_ATTR};
use crate::span::Span;
use crate::tree::{Node, ParseFailure, NAME_ATTR, SUPPRESS_ATTR};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

const DISABLE: &str = "conform-disable";
const DISABLE_NEXT: &str = "conform-disable-next";
const BOM: char = '\u{feff}';

/// An element whose end tag has not been seen yet (or the document itself)
struct Frame {
    kind: &'static str,
    name: String,
    start: usize,
    fields: Map<String, Value>,
    insert_at: Option<usize>,
    children: Vec<Node>,
    suppress: Option<Value>,
    suppress_next: Option<Value>,
}

impl Frame {
    fn document() -> Self {
        Self {
            kind: "document",
            name: String::new(),
            start: 0,
            fields: Map::new(),
            insert_at: None,
            children: Vec::new(),
            suppress: None,
            suppress_next: None,
        }
    }

    fn into_node(self, end: usize) -> Node {
        let mut node = Node::new(self.kind, Span::new(self.start, end));
        if self.kind != "document" {
            node = node
                .with_attr(NAME_ATTR, self.name)
                .with_attr(FIELDS_ATTR, Value::Object(self.fields));
        }
        if let Some(offset) = self.insert_at {
            node = node.with_attr(INSERT_AT_ATTR, offset);
        }
        if let Some(suppress) = self.suppress {
            node = node.with_attr(SUPPRESS_ATTR, suppress);
        }
        node.with_children(self.children)
    }
}

/// Parse XML text into a `document` root node
///
/// A leading byte-order mark is kept out of the reader so that reader
/// positions plus the mark's length are offsets into `content`.
pub fn parse_xml(content: &str) -> Result<Node, ParseFailure> {
    let (body, base) = match content.strip_prefix(BOM) {
        Some(rest) => (rest, BOM.len_utf8()),
        None => (content, 0),
    };
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<Frame> = vec![Frame::document()];

    loop {
        let start = base + reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|e| {
            let pos = base + reader.buffer_position() as usize;
            ParseFailure::new(Span::empty(pos.min(content.len())), e.to_string())
        })?;
        let end = base + reader.buffer_position() as usize;

        match event {
            Event::Start(e) => {
                let frame = open_element(content, &e, start, end, ">", &mut stack)?;
                stack.push(frame);
            }

            Event::Empty(e) => {
                let frame = open_element(content, &e, start, end, "/>", &mut stack)?;
                push_child(&mut stack, frame.into_node(end));
            }

            Event::End(_) => {
                if stack.len() < 2 {
                    return Err(ParseFailure::new(
                        Span::new(start, end),
                        "end tag without matching start tag",
                    ));
                }
                if let Some(frame) = stack.pop() {
                    push_child(&mut stack, frame.into_node(end));
                }
            }

            Event::Text(e) => {
                let raw = &content[start..end];
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    let text = e
                        .unescape()
                        .map_err(|err| ParseFailure::new(Span::new(start, end), err.to_string()))?;
                    let lead = raw.len() - raw.trim_start().len();
                    let span = Span::new(start + lead, start + lead + trimmed.len());
                    push_child(
                        &mut stack,
                        Node::new("text", span).with_attr("value", text.trim()),
                    );
                }
            }

            Event::Comment(e) => {
                let text = String::from_utf8_lossy(&e).to_string();
                if let Some(frame) = stack.last_mut() {
                    apply_directive(frame, &text);
                }
                push_child(
                    &mut stack,
                    Node::new("comment", Span::new(start, end)).with_attr("text", text.trim()),
                );
            }

            Event::Decl(_) => {
                let tag = &content[start..end];
                let (fields, attrs) = scan_attributes(tag, start)?;
                let node = Node::new("declaration", Span::new(start, end))
                    .with_attr(NAME_ATTR, "xml")
                    .with_attr(FIELDS_ATTR, Value::Object(fields))
                    .with_attr(INSERT_AT_ATTR, close_offset(tag, start, "?>"))
                    .with_children(attrs);
                push_child(&mut stack, node);
            }

            Event::Eof => break,

            _ => {}
        }
    }

    if stack.len() > 1 {
        let open = &stack[stack.len() - 1];
        return Err(ParseFailure::new(
            Span::new(open.start, content.len()),
            format!("element <{}> is never closed", open.name),
        ));
    }

    let root = stack.pop().unwrap_or_else(Frame::document);
    Ok(root.into_node(content.len()))
}

fn open_element(
    content: &str,
    e: &BytesStart<'_>,
    start: usize,
    end: usize,
    close: &str,
    stack: &mut [Frame],
) -> Result<Frame, ParseFailure> {
    let tag = &content[start..end];
    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();

    // quick-xml validates the attribute syntax, values are re-read with spans
    for attr in e.attributes() {
        attr.map_err(|err| ParseFailure::new(Span::new(start, end), err.to_string()))?;
    }
    let (fields, attrs) = scan_attributes(tag, start)?;

    let suppress = stack.last_mut().and_then(|parent| parent.suppress_next.take());

    Ok(Frame {
        kind: "element",
        name,
        start,
        fields,
        insert_at: Some(close_offset(tag, start, close)),
        children: attrs,
        suppress,
        suppress_next: None,
    })
}

fn push_child(stack: &mut [Frame], node: Node) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

/// Offset just after the last non-space byte before the tag's closing marker
fn close_offset(tag: &str, base: usize, close: &str) -> usize {
    let inner = tag.strip_suffix(close).unwrap_or(tag);
    base + inner.trim_end().len()
}

fn apply_directive(frame: &mut Frame, comment: &str) {
    let text = comment.trim();
    let (rest, next) = if let Some(rest) = text.strip_prefix(DISABLE_NEXT) {
        (rest, true)
    } else if let Some(rest) = text.strip_prefix(DISABLE) {
        (rest, false)
    } else {
        return;
    };

    // `conform-disable rule-a rule-b: reason` or `... -- reason`
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return;
    }
    let ids = rest.split(" -- ").next().unwrap_or("");
    let ids = ids.split(':').next().unwrap_or("");
    let ids: Vec<Value> = ids
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|id| !id.is_empty())
        .map(|id| Value::String(id.to_string()))
        .collect();
    let value = if ids.is_empty() {
        Value::Bool(true)
    } else {
        Value::Array(ids)
    };

    let slot = if next {
        &mut frame.suppress_next
    } else {
        &mut frame.suppress
    };
    *slot = Some(merge_suppression(slot.take(), value));
}

fn merge_suppression(existing: Option<Value>, new: Value) -> Value {
    match (existing, new) {
        (None, new) => new,
        (Some(Value::Array(mut a)), Value::Array(b)) => {
            for id in b {
                if !a.contains(&id) {
                    a.push(id);
                }
            }
            Value::Array(a)
        }
        // one of them covers every rule
        _ => Value::Bool(true),
    }
}

/// Attribute values of a start tag: unescaped fields plus `attribute` nodes
/// spanning the raw value text
fn scan_attributes(
    tag: &str,
    base: usize,
) -> Result<(Map<String, Value>, Vec<Node>), ParseFailure> {
    let bytes = tag.as_bytes();
    let len = bytes.len();
    let is_space = |b: u8| b.is_ascii_whitespace();
    let is_close = |b: u8| b == b'/' || b == b'>' || b == b'?';

    let mut fields = Map::new();
    let mut nodes = Vec::new();

    let mut i = 1;
    if bytes.get(i) == Some(&b'?') {
        i += 1;
    }
    while i < len && !is_space(bytes[i]) && !is_close(bytes[i]) {
        i += 1;
    }

    loop {
        while i < len && is_space(bytes[i]) {
            i += 1;
        }
        if i >= len || is_close(bytes[i]) {
            break;
        }

        let key_start = i;
        while i < len && !is_space(bytes[i]) && bytes[i] != b'=' && !is_close(bytes[i]) {
            i += 1;
        }
        let key = &tag[key_start..i];
        while i < len && is_space(bytes[i]) {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            i = i.max(key_start + 1);
            continue;
        }
        i += 1;
        while i < len && is_space(bytes[i]) {
            i += 1;
        }

        let quote = match bytes.get(i) {
            Some(&q) if q == b'"' || q == b'\'' => q,
            _ => {
                return Err(ParseFailure::new(
                    Span::empty(base + i),
                    format!("attribute '{}' has no quoted value", key),
                ))
            }
        };
        let value_start = i + 1;
        let value_end = bytes[value_start..]
            .iter()
            .position(|&b| b == quote)
            .map(|p| value_start + p)
            .ok_or_else(|| {
                ParseFailure::new(Span::empty(base + i), format!("unterminated value of '{}'", key))
            })?;

        let raw = &tag[value_start..value_end];
        let value = quick_xml::escape::unescape(raw)
            .map_err(|e| ParseFailure::new(Span::new(base + value_start, base + value_end), e.to_string()))?
            .into_owned();

        nodes.push(
            Node::new(FIELD_KIND, Span::new(base + value_start, base + value_end))
                .with_attr(NAME_ATTR, key)
                .with_attr("value", value.as_str()),
        );
        fields.insert(key.to_string(), Value::String(value));
        i = value_end + 1;
    }

    Ok((fields, nodes))
}
