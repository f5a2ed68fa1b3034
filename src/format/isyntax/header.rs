//! Incremental parser for the iSyntax header tree.
//!
//! The header is an XML document of three node kinds:
//!
//! ```text
//! <DataObject ObjectType="UFSImport">                      depth 1 (branch)
//!   <Attribute Name="DICOM_MANUFACTURER" Group="0x0008"    depth 2 (leaf)
//!              Element="0x0070" PMSVR="IString">PHILIPS</Attribute>
//!   <Attribute Name="PIM_DP_SCANNED_IMAGES" Group="0x301D"
//!              Element="0x1003" PMSVR="IDataObjectArray">  depth 2 (leaf with children)
//!     <Array>                                              depth 3 (inherits 301D,1003)
//!       <DataObject ObjectType="DPScannedImage">           depth 4 (starts a new image)
//!         <Attribute .../>                                 depth 5+ (per-image)
//! ```
//!
//! The parser is fed successive chunks of the header and may be interrupted
//! anywhere, including inside names, attribute values and blobs. Leaves whose
//! tag marks a multi-megabyte base64 payload are not run through the state
//! machine: the parser scans ahead for the next `<` and bulk-copies the bytes
//! in between.
//!
//! Parsed nodes are reported to a [`HeaderVisitor`]; the parser itself knows
//! nothing about metadata semantics.

use tracing::debug;

use super::tags::Tag;
use crate::error::HeaderError;

/// Maximum element nesting accepted by the parser.
pub const MAX_NODE_DEPTH: usize = 32;

const LEAF_ATTRIBUTE_ORDER: [&str; 4] = ["Name", "Group", "Element", "PMSVR"];

// =============================================================================
// Visitor
// =============================================================================

/// Receives structural events from [`HeaderParser`].
///
/// `depth` counts from 1 for the root element.
pub trait HeaderVisitor {
    /// A branch node announced its `ObjectType`.
    fn begin_object(&mut self, depth: usize, object_type: &str) -> Result<(), HeaderError>;

    /// A branch node closed.
    fn end_object(&mut self, depth: usize);

    /// A leaf marked `PMSVR="IDataObjectArray"` opened; its children follow.
    fn begin_array(&mut self, depth: usize, tag: Tag);

    /// A leaf with children closed.
    fn end_array(&mut self, depth: usize, tag: Tag);

    /// A plain leaf completed with its text (or blob) content.
    fn leaf(&mut self, depth: usize, tag: Tag, name: &str, value: &[u8])
        -> Result<(), HeaderError>;
}

// =============================================================================
// Node Stack
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Root,
    Leaf,
    Branch,
    Array,
    Other,
}

impl NodeKind {
    fn from_element_name(name: &[u8]) -> Self {
        match name {
            b"Attribute" => NodeKind::Leaf,
            b"DataObject" => NodeKind::Branch,
            b"Array" => NodeKind::Array,
            _ => NodeKind::Other,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    element: String,
    name: String,
    tag: Tag,
    has_children: bool,
    attribute_index: usize,
}

impl Node {
    fn root() -> Self {
        Self {
            kind: NodeKind::Root,
            element: String::new(),
            name: String::new(),
            tag: Tag::default(),
            has_children: true,
            attribute_index: 0,
        }
    }
}

// =============================================================================
// Tokenizer State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Text between tags
    Content,
    /// Blob text copied in bulk up to the next '<'
    Bulk,
    /// Just consumed '<'
    TagOpen,
    /// Reading a start-tag name
    StartName,
    /// Reading an end-tag name after "</"
    EndName,
    /// After an end-tag name, awaiting '>'
    EndTail,
    /// Inside a start tag between attributes
    InTag,
    AttrName,
    AfterAttrName,
    BeforeAttrValue,
    AttrValue(u8),
    /// Consumed '/' in a start tag, awaiting '>'
    EmptyClose,
    /// Processing instruction, declaration or comment
    Markup,
}

impl State {
    fn describe(self) -> &'static str {
        match self {
            State::Content | State::Bulk => "reading content",
            State::TagOpen => "opening a tag",
            State::StartName => "reading an element name",
            State::EndName | State::EndTail => "reading an end tag",
            State::InTag | State::AttrName | State::AfterAttrName => "reading attributes",
            State::BeforeAttrValue | State::AttrValue(_) => "reading an attribute value",
            State::EmptyClose => "closing an empty element",
            State::Markup => "skipping markup",
        }
    }
}

#[inline]
fn is_space(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

/// Append `src` to `buf`, growing capacity to the next power of two.
fn push_grow(buf: &mut Vec<u8>, src: &[u8]) {
    let needed = buf.len() + src.len();
    if needed > buf.capacity() {
        buf.reserve_exact(needed.next_power_of_two() - buf.len());
    }
    buf.extend_from_slice(src);
}

/// Parse a tag number the way the header writes them ("0x301D", "12").
pub fn parse_tag_number(value: &str) -> Option<u16> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else if value.len() > 1 && value.starts_with('0') {
        u16::from_str_radix(&value[1..], 8).ok()
    } else {
        value.parse().ok()
    }
}

fn decode_entity(entity: &[u8]) -> Option<char> {
    match entity {
        b"lt" => Some('<'),
        b"gt" => Some('>'),
        b"amp" => Some('&'),
        b"quot" => Some('"'),
        b"apos" => Some('\''),
        [b'#', b'x' | b'X', hex @ ..] => std::str::from_utf8(hex)
            .ok()
            .and_then(|s| u32::from_str_radix(s, 16).ok())
            .and_then(char::from_u32),
        [b'#', dec @ ..] => std::str::from_utf8(dec)
            .ok()
            .and_then(|s| s.parse().ok())
            .and_then(char::from_u32),
        _ => None,
    }
}

const MAX_ENTITY_LEN: usize = 10;

// =============================================================================
// Parser
// =============================================================================

/// Streaming header tree parser.
pub struct HeaderParser {
    state: State,
    stack: Vec<Node>,
    content: Vec<u8>,
    name_buf: Vec<u8>,
    attr_name: Vec<u8>,
    attr_value: Vec<u8>,
    entity: Option<Vec<u8>>,
    bytes_parsed: u64,
    finished: bool,
}

impl Default for HeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderParser {
    pub fn new() -> Self {
        Self {
            state: State::Content,
            stack: vec![Node::root()],
            content: Vec::with_capacity(1024),
            name_buf: Vec::with_capacity(64),
            attr_name: Vec::with_capacity(64),
            attr_value: Vec::with_capacity(256),
            entity: None,
            bytes_parsed: 0,
            finished: false,
        }
    }

    /// Total bytes consumed so far.
    pub fn bytes_parsed(&self) -> u64 {
        self.bytes_parsed
    }

    /// Current element depth (0 outside the root element).
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Feed the next chunk of header bytes.
    ///
    /// `is_last` must be set on the final chunk; the parser then checks that
    /// every element was closed.
    pub fn feed<V: HeaderVisitor>(
        &mut self,
        chunk: &[u8],
        is_last: bool,
        visitor: &mut V,
    ) -> Result<(), HeaderError> {
        let mut i = 0;
        while i < chunk.len() {
            if self.state == State::Bulk {
                let rest = &chunk[i..];
                match rest.iter().position(|&b| b == b'<') {
                    Some(end) => {
                        push_grow(&mut self.content, &rest[..end]);
                        self.state = State::TagOpen;
                        i += end + 1;
                    }
                    None => {
                        push_grow(&mut self.content, rest);
                        i = chunk.len();
                    }
                }
                continue;
            }
            self.step(chunk[i], visitor)?;
            i += 1;
        }
        self.bytes_parsed += chunk.len() as u64;

        if is_last {
            self.finished = true;
            let open = self.depth();
            if open > 0 {
                return Err(HeaderError::UnexpectedEof(open));
            }
            if !matches!(self.state, State::Content | State::Bulk) {
                return Err(HeaderError::UnexpectedEof(0));
            }
        }
        Ok(())
    }

    /// Whether a chunk flagged `is_last` has been fed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn syntax_error(&self, byte: u8) -> HeaderError {
        HeaderError::Syntax {
            byte,
            state: self.state.describe(),
        }
    }

    /// Route a byte to an entity buffer if one is open. Returns true if consumed.
    fn take_entity_byte(&mut self, byte: u8, into_attr: bool) -> bool {
        let Some(entity) = self.entity.as_mut() else {
            if byte == b'&' {
                self.entity = Some(Vec::with_capacity(MAX_ENTITY_LEN));
                return true;
            }
            return false;
        };

        if byte != b';' && entity.len() < MAX_ENTITY_LEN {
            entity.push(byte);
            return true;
        }

        let target = if into_attr {
            &mut self.attr_value
        } else {
            &mut self.content
        };
        let entity = self.entity.take().unwrap_or_default();
        match (byte, decode_entity(&entity)) {
            (b';', Some(c)) => {
                let mut utf8 = [0u8; 4];
                push_grow(target, c.encode_utf8(&mut utf8).as_bytes());
            }
            _ => {
                // Not a recognizable entity: keep the raw text
                push_grow(target, b"&");
                push_grow(target, &entity);
                push_grow(target, &[byte]);
            }
        }
        true
    }

    fn step<V: HeaderVisitor>(&mut self, byte: u8, visitor: &mut V) -> Result<(), HeaderError> {
        match self.state {
            State::Content => {
                if self.entity.is_none() && byte == b'<' {
                    self.state = State::TagOpen;
                } else if !self.take_entity_byte(byte, false) {
                    push_grow(&mut self.content, &[byte]);
                }
            }
            State::Bulk => {
                if byte == b'<' {
                    self.state = State::TagOpen;
                } else {
                    push_grow(&mut self.content, &[byte]);
                }
            }
            State::TagOpen => match byte {
                b'/' => {
                    self.name_buf.clear();
                    self.state = State::EndName;
                }
                b'?' | b'!' => {
                    self.name_buf.clear();
                    self.name_buf.push(byte);
                    self.state = State::Markup;
                }
                b if is_space(b) || b == b'>' || b == b'=' => return Err(self.syntax_error(b)),
                b => {
                    self.name_buf.clear();
                    self.name_buf.push(b);
                    self.state = State::StartName;
                }
            },
            State::StartName => match byte {
                b'>' => {
                    self.begin_element()?;
                    self.end_start_tag(visitor);
                }
                b'/' => {
                    self.begin_element()?;
                    self.state = State::EmptyClose;
                }
                b if is_space(b) => {
                    self.begin_element()?;
                    self.state = State::InTag;
                }
                b => self.name_buf.push(b),
            },
            State::InTag => match byte {
                b'>' => self.end_start_tag(visitor),
                b'/' => self.state = State::EmptyClose,
                b if is_space(b) => {}
                b'=' | b'"' | b'\'' | b'<' => return Err(self.syntax_error(byte)),
                b => {
                    self.attr_name.clear();
                    self.attr_name.push(b);
                    self.state = State::AttrName;
                }
            },
            State::AttrName => match byte {
                b'=' => self.state = State::BeforeAttrValue,
                b if is_space(b) => self.state = State::AfterAttrName,
                b'>' | b'/' | b'<' | b'"' | b'\'' => return Err(self.syntax_error(byte)),
                b => self.attr_name.push(b),
            },
            State::AfterAttrName => match byte {
                b'=' => self.state = State::BeforeAttrValue,
                b if is_space(b) => {}
                b => return Err(self.syntax_error(b)),
            },
            State::BeforeAttrValue => match byte {
                b'"' | b'\'' => {
                    self.attr_value.clear();
                    self.entity = None;
                    self.state = State::AttrValue(byte);
                }
                b if is_space(b) => {}
                b => return Err(self.syntax_error(b)),
            },
            State::AttrValue(quote) => {
                if self.entity.is_none() && byte == quote {
                    self.end_attribute(visitor)?;
                    self.state = State::InTag;
                } else if !self.take_entity_byte(byte, true) {
                    push_grow(&mut self.attr_value, &[byte]);
                }
            }
            State::EmptyClose => match byte {
                b'>' => {
                    self.end_start_tag(visitor);
                    self.end_element(None, visitor)?;
                    self.state = State::Content;
                }
                b => return Err(self.syntax_error(b)),
            },
            State::EndName => match byte {
                b'>' => self.finish_end_tag(visitor)?,
                b if is_space(b) => self.state = State::EndTail,
                b => self.name_buf.push(b),
            },
            State::EndTail => match byte {
                b'>' => self.finish_end_tag(visitor)?,
                b if is_space(b) => {}
                b => return Err(self.syntax_error(b)),
            },
            State::Markup => {
                if byte == b'>' {
                    let is_open_comment = self.name_buf.starts_with(b"!--")
                        && !(self.name_buf.len() >= 5 && self.name_buf.ends_with(b"--"));
                    if !is_open_comment {
                        self.state = State::Content;
                        return Ok(());
                    }
                }
                // Only the head and tail matter for comment detection
                if self.name_buf.len() < 8 {
                    self.name_buf.push(byte);
                } else {
                    let last = self.name_buf.len() - 1;
                    self.name_buf.copy_within(last - 2.., last - 3);
                    self.name_buf[last] = byte;
                }
            }
        }
        Ok(())
    }

    fn begin_element(&mut self) -> Result<(), HeaderError> {
        if self.depth() >= MAX_NODE_DEPTH {
            return Err(HeaderError::DepthExceeded(MAX_NODE_DEPTH));
        }
        let parent_tag = self.stack.last().map(|n| n.tag).unwrap_or_default();
        let element = String::from_utf8_lossy(&self.name_buf).into_owned();
        self.stack.push(Node {
            kind: NodeKind::from_element_name(&self.name_buf),
            element,
            name: String::new(),
            tag: parent_tag,
            has_children: false,
            attribute_index: 0,
        });
        self.content.clear();
        Ok(())
    }

    fn end_attribute<V: HeaderVisitor>(&mut self, visitor: &mut V) -> Result<(), HeaderError> {
        let depth = self.depth();
        let name = String::from_utf8_lossy(&self.attr_name).into_owned();
        let value = String::from_utf8_lossy(&self.attr_value).into_owned();
        let Some(node) = self.stack.last_mut() else {
            return Ok(());
        };

        match node.kind {
            NodeKind::Leaf => {
                if LEAF_ATTRIBUTE_ORDER.get(node.attribute_index) != Some(&name.as_str()) {
                    debug!(
                        "header: unexpected attribute '{}' at position {} of <{}>",
                        name, node.attribute_index, node.element
                    );
                }
                match name.as_str() {
                    "Name" => node.name = value,
                    "Group" => match parse_tag_number(&value) {
                        Some(group) => node.tag.group = group,
                        None => debug!("header: unparseable group '{}'", value),
                    },
                    "Element" => match parse_tag_number(&value) {
                        Some(element) => node.tag.element = element,
                        None => debug!("header: unparseable element '{}'", value),
                    },
                    "PMSVR" => node.has_children = value == "IDataObjectArray",
                    _ => {}
                }
            }
            NodeKind::Branch => {
                if name == "ObjectType" {
                    visitor.begin_object(depth, &value)?;
                }
            }
            _ => {}
        }
        node.attribute_index += 1;
        Ok(())
    }

    fn end_start_tag<V: HeaderVisitor>(&mut self, visitor: &mut V) {
        let depth = self.depth();
        self.state = State::Content;
        if let Some(node) = self.stack.last() {
            if node.kind == NodeKind::Leaf {
                if node.has_children {
                    visitor.begin_array(depth, node.tag);
                } else if node.tag.is_bulk_blob() {
                    self.state = State::Bulk;
                }
            }
        }
    }

    fn finish_end_tag<V: HeaderVisitor>(&mut self, visitor: &mut V) -> Result<(), HeaderError> {
        let name = String::from_utf8_lossy(&self.name_buf).into_owned();
        self.end_element(Some(name), visitor)?;
        self.state = State::Content;
        Ok(())
    }

    fn end_element<V: HeaderVisitor>(
        &mut self,
        end_name: Option<String>,
        visitor: &mut V,
    ) -> Result<(), HeaderError> {
        if self.stack.len() <= 1 {
            return Err(HeaderError::UnmatchedEnd);
        }
        let depth = self.depth();
        let node = self.stack.pop().ok_or(HeaderError::UnmatchedEnd)?;

        if let Some(found) = end_name {
            if found != node.element {
                return Err(HeaderError::MismatchedEnd {
                    expected: node.element,
                    found,
                });
            }
        }

        match node.kind {
            NodeKind::Leaf if node.has_children => visitor.end_array(depth, node.tag),
            NodeKind::Leaf => visitor.leaf(depth, node.tag, &node.name, &self.content)?,
            NodeKind::Branch => visitor.end_object(depth),
            NodeKind::Array | NodeKind::Other | NodeKind::Root => {}
        }
        self.content.clear();
        Ok(())
    }
}
