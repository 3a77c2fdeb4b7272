//! Package document tree with byte-preserving edits.
//!
//! [`PackageDocument`] parses OPF text into an element tree whose nodes
//! remember where they came from in the source. Queries match elements by
//! local name, so `dc:title`, `title` and `opf:title` are interchangeable.
//! Mutations are recorded as splices over the original text; [`render`]
//! re-emits the source with only those spans replaced.
//!
//! [`render`]: PackageDocument::render

use std::ops::Range;

use memchr::{memchr, memrchr};
use quick_xml::Reader;
use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::Event;

use super::parser::{local_name, resolve_entity, unescape_attr};
use crate::error::{Error, Result};

/// Handle to an element inside a [`PackageDocument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// Where a newly created element goes relative to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    FirstChild,
    After(NodeId),
}

pub struct PackageDocument {
    source: String,
    nodes: Vec<Element>,
    splices: Vec<Splice>,
}

struct Element {
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attrs: Vec<Attr>,
    /// Direct text content, entities resolved.
    text: String,
    /// `None` for elements created by this document rather than parsed.
    span: Option<TagSpan>,
    /// Markup queued for insertion before the end tag.
    appended: Vec<Child>,
    /// Whether a splice already carries `appended` into the output.
    children_spliced: bool,
}

#[derive(Clone)]
struct TagSpan {
    start_tag: Range<usize>,
    /// `None` for self-closing elements.
    end_tag: Option<Range<usize>>,
}

struct Attr {
    name: String,
    value: String,
    origin: AttrOrigin,
}

#[derive(Clone)]
enum AttrOrigin {
    /// Value bytes inside the source text.
    Source(Range<usize>),
    /// Added by an edit; index of the splice that writes it.
    Spliced(usize),
    /// Belongs to a created element and is written with it.
    Created,
}

enum Child {
    /// Escaped character data.
    Text(String),
    Markup(String),
    Node(NodeId),
}

struct Splice {
    range: Range<usize>,
    patch: Patch,
}

enum Patch {
    Literal(String),
    /// Children queued on a parsed element, written before its end tag.
    Children(NodeId),
    /// Replaces the `/>` of a self-closing element with its children and an end tag.
    Expand(NodeId),
    /// A created element, written at a fixed point in the source.
    Created { node: NodeId, indent: String },
}

impl PackageDocument {
    /// Parse package document text.
    ///
    /// Fails with [`Error::Corrupt`] on malformed XML, including unclosed elements.
    pub fn parse(text: impl Into<String>) -> Result<Self> {
        let source = text.into();
        let mut doc = PackageDocument {
            source: String::new(),
            nodes: Vec::new(),
            splices: Vec::new(),
        };

        let mut reader = Reader::from_str(&source);
        let mut stack: Vec<NodeId> = Vec::new();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| Error::corrupt("malformed package document", e))?;
            let end = reader.buffer_position() as usize;

            match event {
                Event::Start(e) | Event::Empty(e) => {
                    let self_closing = source.as_bytes()[..end].ends_with(b"/>");
                    let start = tag_start(&source, end);
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    let attrs = scan_attributes(&source[start..end], start)
                        .into_iter()
                        .map(|(name, range)| Attr {
                            value: unescape_attr(&source[range.clone()]),
                            name,
                            origin: AttrOrigin::Source(range),
                        })
                        .collect();
                    let id = doc.push(Element {
                        name,
                        parent: stack.last().copied(),
                        children: Vec::new(),
                        attrs,
                        text: String::new(),
                        span: Some(TagSpan {
                            start_tag: start..end,
                            end_tag: None,
                        }),
                        appended: Vec::new(),
                        children_spliced: false,
                    });
                    if !self_closing {
                        stack.push(id);
                    }
                }
                Event::End(_) => {
                    let id = stack.pop().ok_or_else(|| {
                        Error::Corrupt("unexpected end tag in package document".into())
                    })?;
                    let start = tag_start(&source, end);
                    if let Some(span) = doc.nodes[id.0].span.as_mut() {
                        span.end_tag = Some(start..end);
                    }
                }
                Event::Text(e) => {
                    if let Some(&top) = stack.last() {
                        doc.nodes[top.0]
                            .text
                            .push_str(&String::from_utf8_lossy(e.as_ref()));
                    }
                }
                Event::CData(e) => {
                    if let Some(&top) = stack.last() {
                        doc.nodes[top.0]
                            .text
                            .push_str(&String::from_utf8_lossy(e.as_ref()));
                    }
                }
                Event::GeneralRef(e) => {
                    if let Some(&top) = stack.last() {
                        let entity = String::from_utf8_lossy(e.as_ref());
                        if let Some(resolved) = resolve_entity(&entity) {
                            doc.nodes[top.0].text.push_str(&resolved);
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.last() {
            return Err(Error::Corrupt(format!(
                "unclosed <{}> in package document",
                doc.nodes[open.0].name
            )));
        }
        if doc.nodes.is_empty() {
            return Err(Error::Corrupt("package document has no root element".into()));
        }

        drop(reader);
        doc.source = source;
        Ok(doc)
    }

    fn push(&mut self, element: Element) -> NodeId {
        let id = NodeId(self.nodes.len());
        if let Some(parent) = element.parent {
            self.nodes[parent.0].children.push(id);
        }
        self.nodes.push(element);
        id
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Qualified name as written (e.g. "dc:title").
    pub fn name(&self, id: NodeId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn local_name(&self, id: NodeId) -> &str {
        let name = self.name(id);
        let local = local_name(name.as_bytes());
        &name[name.len() - local.len()..]
    }

    /// Namespace prefix of the element, if any.
    pub fn prefix(&self, id: NodeId) -> Option<&str> {
        self.name(id).split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    /// Direct text content with entities resolved.
    pub fn text(&self, id: NodeId) -> &str {
        &self.nodes[id.0].text
    }

    /// Attribute value by exact (qualified) name.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.nodes[id.0]
            .attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Attribute value matched by local name, ignoring any prefix.
    pub fn attr_local(&self, id: NodeId, local: &str) -> Option<&str> {
        self.attr(id, local).or_else(|| {
            self.nodes[id.0]
                .attrs
                .iter()
                .find(|a| local_name(a.name.as_bytes()) == local.as_bytes())
                .map(|a| a.value.as_str())
        })
    }

    /// All elements in document order.
    pub fn elements(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len()).map(NodeId)
    }

    /// All elements with the given local name, in document order.
    pub fn elements_named<'a>(&'a self, local: &'a str) -> impl Iterator<Item = NodeId> + 'a {
        self.elements().filter(move |&id| self.local_name(id) == local)
    }

    /// First element with the given local name anywhere in the document.
    pub fn find_first(&self, local: &str) -> Option<NodeId> {
        self.elements_named(local).next()
    }

    /// First descendant of `scope` with the given local name.
    pub fn find_in(&self, scope: NodeId, local: &str) -> Option<NodeId> {
        for &child in self.children(scope) {
            if self.local_name(child) == local {
                return Some(child);
            }
            if let Some(found) = self.find_in(child, local) {
                return Some(found);
            }
        }
        None
    }

    /// Prefix bound to a namespace URI by any `xmlns:*` declaration.
    pub fn prefix_for_namespace(&self, uri: &str) -> Option<&str> {
        self.nodes.iter().flat_map(|n| n.attrs.iter()).find_map(|a| {
            a.name
                .strip_prefix("xmlns:")
                .filter(|_| a.value == uri)
        })
    }

    /// Whether the element came from the source text rather than [`create_element`].
    ///
    /// [`create_element`]: PackageDocument::create_element
    pub fn is_parsed(&self, id: NodeId) -> bool {
        self.nodes[id.0].span.is_some()
    }

    /// Prefix bound to a namespace URI on `id` or one of its ancestors.
    pub fn prefix_in_scope(&self, id: NodeId, uri: &str) -> Option<&str> {
        let mut current = Some(id);
        while let Some(node) = current {
            let found = self.nodes[node.0].attrs.iter().find_map(|a| {
                a.name
                    .strip_prefix("xmlns:")
                    .filter(|_| a.value == uri)
            });
            if found.is_some() {
                return found;
            }
            current = self.parent(node);
        }
        None
    }

    /// Whether any edit has been recorded.
    pub fn is_modified(&self) -> bool {
        !self.splices.is_empty()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Replace the text content of an element, leaving its tags untouched.
    pub fn set_text(&mut self, id: NodeId, value: &str) {
        let escaped = partial_escape(value).into_owned();
        let node = &self.nodes[id.0];
        match node.span.clone() {
            Some(TagSpan {
                start_tag,
                end_tag: Some(end_tag),
            }) => {
                self.put(start_tag.end..end_tag.start, Patch::Literal(escaped));
            }
            Some(TagSpan {
                start_tag,
                end_tag: None,
            }) => {
                let replacement = format!(">{}</{}>", escaped, node.name);
                self.put(start_tag.end - 2..start_tag.end, Patch::Literal(replacement));
            }
            None => {
                self.nodes[id.0].appended = vec![Child::Text(escaped)];
            }
        }
        self.nodes[id.0].text = value.to_string();
    }

    /// Set an attribute, rewriting its value in place if it already exists.
    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        let escaped = escape(value).into_owned();

        if let Some(index) = self.nodes[id.0].attrs.iter().position(|a| a.name == name) {
            let attr = &mut self.nodes[id.0].attrs[index];
            attr.value = value.to_string();
            match attr.origin.clone() {
                AttrOrigin::Source(range) => self.put(range, Patch::Literal(escaped)),
                AttrOrigin::Spliced(splice) => {
                    self.splices[splice].patch =
                        Patch::Literal(format!(" {name}=\"{escaped}\""));
                }
                AttrOrigin::Created => {}
            }
            return;
        }

        let origin = match self.nodes[id.0].span.as_ref() {
            Some(span) => {
                let tag = &span.start_tag;
                let close = if self.source.as_bytes()[..tag.end].ends_with(b"/>") {
                    tag.end - 2
                } else {
                    tag.end - 1
                };
                // Insert after the last attribute, not after trailing whitespace.
                let at = tag.start + self.source[tag.start..close].trim_end().len();
                let splice = self.splices.len();
                self.splices.push(Splice {
                    range: at..at,
                    patch: Patch::Literal(format!(" {name}=\"{escaped}\"")),
                });
                AttrOrigin::Spliced(splice)
            }
            None => AttrOrigin::Created,
        };
        self.nodes[id.0].attrs.push(Attr {
            name: name.to_string(),
            value: value.to_string(),
            origin,
        });
    }

    /// Queue serialized markup as the last child of `parent`.
    pub fn append_markup(&mut self, parent: NodeId, markup: String) {
        self.nodes[parent.0].appended.push(Child::Markup(markup));
        self.splice_children(parent);
    }

    /// Create an empty element under `parent` and return its handle.
    ///
    /// The element is written with any attributes and children added to it
    /// afterwards.
    pub fn create_element(&mut self, parent: NodeId, name: &str, placement: Placement) -> NodeId {
        let id = self.push(Element {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            attrs: Vec::new(),
            text: String::new(),
            span: None,
            appended: Vec::new(),
            children_spliced: false,
        });

        let anchor = match placement {
            Placement::FirstChild => self.nodes[parent.0]
                .span
                .as_ref()
                .filter(|span| span.end_tag.is_some())
                .map(|span| (span.start_tag.end, self.child_indent(parent))),
            Placement::After(sibling) => {
                self.nodes[sibling.0].span.as_ref().map(|span| {
                    let end = span.end_tag.as_ref().unwrap_or(&span.start_tag).end;
                    (end, self.indent_of(sibling).to_string())
                })
            }
        };

        match anchor {
            Some((at, indent)) => self.splices.push(Splice {
                range: at..at,
                patch: Patch::Created { node: id, indent },
            }),
            None => {
                self.nodes[parent.0].appended.push(Child::Node(id));
                self.splice_children(parent);
            }
        }
        id
    }

    fn splice_children(&mut self, parent: NodeId) {
        let node = &mut self.nodes[parent.0];
        if node.children_spliced {
            return;
        }
        let Some(span) = node.span.clone() else {
            return;
        };
        node.children_spliced = true;
        match span.end_tag {
            Some(end_tag) => self.splices.push(Splice {
                range: end_tag.start..end_tag.start,
                patch: Patch::Children(parent),
            }),
            None => self.splices.push(Splice {
                range: span.start_tag.end - 2..span.start_tag.end,
                patch: Patch::Expand(parent),
            }),
        }
    }

    /// Record a replacement, superseding an earlier one over the same range.
    fn put(&mut self, range: Range<usize>, patch: Patch) {
        if let Some(existing) = self.splices.iter_mut().find(|s| s.range == range) {
            existing.patch = patch;
        } else {
            self.splices.push(Splice { range, patch });
        }
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Serialize the document with all recorded edits applied.
    pub fn render(&self) -> String {
        let mut order: Vec<usize> = (0..self.splices.len()).collect();
        order.sort_by_key(|&i| (self.splices[i].range.start, self.splices[i].range.end, i));

        let mut out = String::with_capacity(self.source.len() + 256);
        let mut cursor = 0;
        for i in order {
            let splice = &self.splices[i];
            if splice.range.start < cursor {
                continue;
            }
            out.push_str(&self.source[cursor..splice.range.start]);
            self.write_patch(&splice.patch, &mut out);
            cursor = splice.range.end;
        }
        out.push_str(&self.source[cursor..]);
        out
    }

    fn write_patch(&self, patch: &Patch, out: &mut String) {
        match patch {
            Patch::Literal(text) => out.push_str(text),
            Patch::Children(id) => {
                let indent = self.end_tag_indent(*id);
                let child_indent = self.child_indent(*id);
                for child in &self.nodes[id.0].appended {
                    match indent {
                        Some(indent) => {
                            out.push_str(child_indent.strip_prefix(indent).unwrap_or("  "));
                            self.write_child(child, &child_indent, out);
                            out.push('\n');
                            out.push_str(indent);
                        }
                        None => self.write_child(child, "", out),
                    }
                }
            }
            Patch::Expand(id) => {
                out.push('>');
                for child in &self.nodes[id.0].appended {
                    self.write_child(child, "", out);
                }
                out.push_str("</");
                out.push_str(&self.nodes[id.0].name);
                out.push('>');
            }
            Patch::Created { node, indent } => {
                if !indent.is_empty() {
                    out.push('\n');
                    out.push_str(indent);
                }
                self.write_created(*node, indent, out);
            }
        }
    }

    fn write_child(&self, child: &Child, indent: &str, out: &mut String) {
        match child {
            Child::Text(text) | Child::Markup(text) => out.push_str(text),
            Child::Node(id) => self.write_created(*id, indent, out),
        }
    }

    fn write_created(&self, id: NodeId, indent: &str, out: &mut String) {
        let node = &self.nodes[id.0];
        out.push('<');
        out.push_str(&node.name);
        for attr in &node.attrs {
            out.push(' ');
            out.push_str(&attr.name);
            out.push_str("=\"");
            out.push_str(&escape(attr.value.as_str()));
            out.push('"');
        }
        out.push('>');
        let block = !indent.is_empty() && node.appended.iter().any(|c| !matches!(c, Child::Text(_)));
        let nested = format!("{indent}  ");
        for child in &node.appended {
            if block {
                out.push('\n');
                out.push_str(&nested);
                self.write_child(child, &nested, out);
            } else {
                self.write_child(child, "", out);
            }
        }
        if block {
            out.push('\n');
            out.push_str(indent);
        }
        out.push_str("</");
        out.push_str(&node.name);
        out.push('>');
    }

    // ------------------------------------------------------------------
    // Indentation
    // ------------------------------------------------------------------

    /// Leading whitespace on the line where an element starts.
    fn indent_of(&self, id: NodeId) -> &str {
        match self.nodes[id.0].span.as_ref() {
            Some(span) => line_indent(&self.source, span.start_tag.start).unwrap_or(""),
            None => "",
        }
    }

    /// Leading whitespace before an element's end tag, if it sits on its own line.
    fn end_tag_indent(&self, id: NodeId) -> Option<&str> {
        let end_tag = self.nodes[id.0].span.as_ref()?.end_tag.as_ref()?;
        line_indent(&self.source, end_tag.start)
    }

    /// Indentation for a new child line of `parent`.
    fn child_indent(&self, parent: NodeId) -> String {
        let existing = self.nodes[parent.0]
            .children
            .iter()
            .rev()
            .filter(|c| self.nodes[c.0].span.is_some())
            .find_map(|c| line_indent(&self.source, self.nodes[c.0].span.as_ref()?.start_tag.start));
        match existing {
            Some(indent) => indent.to_string(),
            None => format!("{}  ", self.indent_of(parent)),
        }
    }
}

/// Start of the tag that ends at `end`. `<` cannot occur inside a tag.
fn tag_start(source: &str, end: usize) -> usize {
    memrchr(b'<', &source.as_bytes()[..end]).unwrap_or(0)
}

/// The whitespace between the previous newline and `pos`, if that run is all whitespace.
fn line_indent(source: &str, pos: usize) -> Option<&str> {
    let bytes = source.as_bytes();
    let line_start = memrchr(b'\n', &bytes[..pos])? + 1;
    let indent = &source[line_start..pos];
    indent
        .bytes()
        .all(|b| b == b' ' || b == b'\t')
        .then_some(indent)
}

/// Locate attribute names and value spans inside a raw start tag.
fn scan_attributes(tag: &str, offset: usize) -> Vec<(String, Range<usize>)> {
    let bytes = tag.as_bytes();
    let len = bytes.len();
    let is_space = |b: u8| b.is_ascii_whitespace();
    let mut attrs = Vec::new();

    let mut i = 1;
    while i < len && !is_space(bytes[i]) && bytes[i] != b'/' && bytes[i] != b'>' {
        i += 1;
    }

    loop {
        while i < len && is_space(bytes[i]) {
            i += 1;
        }
        if i >= len || bytes[i] == b'/' || bytes[i] == b'>' {
            break;
        }
        let name_start = i;
        while i < len && bytes[i] != b'=' && !is_space(bytes[i]) {
            i += 1;
        }
        let name = &tag[name_start..i];
        while i < len && is_space(bytes[i]) {
            i += 1;
        }
        if i >= len || bytes[i] != b'=' {
            break;
        }
        i += 1;
        while i < len && is_space(bytes[i]) {
            i += 1;
        }
        if i >= len || (bytes[i] != b'"' && bytes[i] != b'\'') {
            break;
        }
        let quote = bytes[i];
        let value_start = i + 1;
        let Some(rel) = memchr(quote, &bytes[value_start..]) else {
            break;
        };
        let value_end = value_start + rel;
        attrs.push((name.to_string(), offset + value_start..offset + value_end));
        i = value_end + 1;
    }

    attrs
}

/// Serialize an element with text content (no children).
pub fn text_element(name: &str, attrs: &[(&str, &str)], text: &str) -> String {
    let mut out = format!("<{name}");
    push_attrs(&mut out, attrs);
    out.push('>');
    out.push_str(&partial_escape(text));
    out.push_str("</");
    out.push_str(name);
    out.push('>');
    out
}

/// Serialize a self-closing element.
pub fn empty_element(name: &str, attrs: &[(&str, &str)]) -> String {
    let mut out = format!("<{name}");
    push_attrs(&mut out, attrs);
    out.push_str("/>");
    out
}

fn push_attrs(out: &mut String, attrs: &[(&str, &str)]) {
    for (key, value) in attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(&escape(*value));
        out.push('"');
    }
}
