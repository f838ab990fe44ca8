//! Generic ordered document tree for decoded XML and JSON bodies.
//!
//! A [`Document`] is either a scalar or an ordered list of named children.
//! Repeated XML elements and JSON arrays both become repeated children with
//! the same name, so call sites read `Contents` entries the same way
//! whichever format the service answered with.

use crate::error::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    Scalar(String),
    Node(Vec<(String, Document)>),
}

impl Default for Document {
    fn default() -> Self {
        Document::Node(Vec::new())
    }
}

impl Document {
    pub fn scalar(value: impl Into<String>) -> Self {
        Document::Scalar(value.into())
    }

    pub fn node<I, S>(children: I) -> Self
    where
        I: IntoIterator<Item = (S, Document)>,
        S: Into<String>,
    {
        Document::Node(
            children
                .into_iter()
                .map(|(name, child)| (name.into(), child))
                .collect(),
        )
    }

    /// Single-child node, the usual shape of a request body root.
    pub fn element(name: impl Into<String>, content: Document) -> Self {
        Document::Node(vec![(name.into(), content)])
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Document::Scalar(value) => Some(value),
            Document::Node(_) => None,
        }
    }

    pub fn children(&self) -> &[(String, Document)] {
        match self {
            Document::Node(children) => children,
            Document::Scalar(_) => &[],
        }
    }

    /// First child called `name`.
    pub fn child(&self, name: &str) -> Option<&Document> {
        self.children()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, child)| child)
    }

    /// Every child called `name`, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Document> + 'a {
        self.children()
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, child)| child)
    }

    /// Scalar value of the first child called `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(Document::as_scalar)
    }

    pub fn path(&self, names: &[&str]) -> Option<&Document> {
        names
            .iter()
            .try_fold(self, |current, name| current.child(name))
    }

    /// Content of the root element if this is an XML document with a
    /// single root, otherwise the document itself.
    pub fn root(&self) -> &Document {
        match self.children() {
            [(_, content)] => content,
            _ => self,
        }
    }

    /// Parse an XML body. Namespace prefixes and attributes are dropped;
    /// an element with children keeps only its children, so indentation
    /// between elements is discarded. Text of a leaf element is kept as is.
    pub fn from_xml(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::from_reader(bytes);

        // (element name, children so far, text so far)
        let mut stack: Vec<(String, Vec<(String, Document)>, String)> =
            vec![(String::new(), Vec::new(), String::new())];

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    stack.push((name, Vec::new(), String::new()));
                }
                Event::Empty(e) => {
                    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                    if let Some((_, children, _)) = stack.last_mut() {
                        children.push((name, Document::Scalar(String::new())));
                    }
                }
                Event::Text(e) => {
                    let text = e.unescape()?;
                    if let Some((_, _, buf)) = stack.last_mut() {
                        buf.push_str(&text);
                    }
                }
                Event::CData(e) => {
                    let data = e.into_inner();
                    if let Some((_, _, buf)) = stack.last_mut() {
                        buf.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::End(_) => {
                    if stack.len() < 2 {
                        return Err(Error::Xml("unbalanced closing tag".to_string()));
                    }
                    let (name, children, text) = stack.pop().unwrap_or_default();
                    let content = if children.is_empty() {
                        Document::Scalar(text)
                    } else {
                        Document::Node(children)
                    };
                    if let Some((_, parent, _)) = stack.last_mut() {
                        parent.push((name, content));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if stack.len() != 1 {
            return Err(Error::Xml("unexpected end of document".to_string()));
        }
        let (_, children, _) = stack.pop().unwrap_or_default();
        Ok(Document::Node(children))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(Self::from_json_value(value))
    }

    fn from_json_value(value: Value) -> Self {
        match value {
            Value::Null => Document::Scalar(String::new()),
            Value::Bool(b) => Document::Scalar(b.to_string()),
            Value::Number(n) => Document::Scalar(n.to_string()),
            Value::String(s) => Document::Scalar(s),
            Value::Array(items) => Document::Node(
                items
                    .into_iter()
                    .map(|item| ("item".to_string(), Self::from_json_value(item)))
                    .collect(),
            ),
            Value::Object(map) => {
                let mut children = Vec::with_capacity(map.len());
                for (name, value) in map {
                    match value {
                        Value::Array(items) => {
                            for item in items {
                                children.push((name.clone(), Self::from_json_value(item)));
                            }
                        }
                        other => children.push((name, Self::from_json_value(other))),
                    }
                }
                Document::Node(children)
            }
        }
    }

    /// Serialize as XML. Each child becomes an element; scalars are escaped.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_xml(&mut out);
        out
    }

    fn write_xml(&self, out: &mut String) {
        match self {
            Document::Scalar(value) => out.push_str(&quick_xml::escape::escape(value.as_str())),
            Document::Node(children) => {
                for (name, child) in children {
                    out.push('<');
                    out.push_str(name);
                    out.push('>');
                    child.write_xml(out);
                    out.push_str("</");
                    out.push_str(name);
                    out.push('>');
                }
            }
        }
    }
}
