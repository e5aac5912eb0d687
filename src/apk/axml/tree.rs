//! In-memory binary XML document
//!
//! Every chunk keeps the header sizes and any unknown bytes it was read
//! with, so a document that is not edited serializes to the exact input.

use super::chunks::{CHUNK_HEADER_SIZE, ChunkHeader, patch_size};
use super::string_pool::StringPool;
use crate::apk::constants::{
    NO_INDEX, RES_STRING_POOL_TYPE, RES_VALUE_SIZE, RES_XML_CDATA_TYPE, RES_XML_END_ELEMENT_TYPE,
    RES_XML_END_NAMESPACE_TYPE, RES_XML_RESOURCE_MAP_TYPE, RES_XML_START_ELEMENT_TYPE,
    RES_XML_START_NAMESPACE_TYPE, RES_XML_TYPE, TYPE_STRING,
};
use crate::exceptions::{PatchError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use log::trace;

const NODE_HEADER_SIZE: usize = 16;
const ELEMENT_EXT_SIZE: usize = 20;
const ATTRIBUTE_SIZE: usize = 20;

fn malformed(msg: impl Into<String>) -> PatchError {
    PatchError::MalformedManifest(msg.into())
}

/// `Res_value`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypedValue {
    pub size: u16,
    pub res0: u8,
    pub data_type: u8,
    pub data: u32,
}

impl TypedValue {
    pub fn new(data_type: u8, data: u32) -> Self {
        TypedValue {
            size: RES_VALUE_SIZE,
            res0: 0,
            data_type,
            data,
        }
    }

    fn read(buf: &[u8]) -> Self {
        TypedValue {
            size: LittleEndian::read_u16(&buf[0..2]),
            res0: buf[2],
            data_type: buf[3],
            data: LittleEndian::read_u32(&buf[4..8]),
        }
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u16::<LittleEndian>(self.size)?;
        out.write_u8(self.res0)?;
        out.write_u8(self.data_type)?;
        out.write_u32::<LittleEndian>(self.data)?;
        Ok(())
    }
}

/// `ResXMLTree_attribute`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub ns: u32,
    pub name: u32,
    pub raw_value: u32,
    pub value: TypedValue,
    extra: Vec<u8>,
}

impl Attribute {
    pub fn new(ns: u32, name: u32, raw_value: u32, value: TypedValue) -> Self {
        Attribute {
            ns,
            name,
            raw_value,
            value,
            extra: Vec::new(),
        }
    }
}

/// Line/comment header shared by every tree node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHeader {
    pub line: u32,
    pub comment: u32,
    header_size: u16,
    extra: Vec<u8>,
}

impl NodeHeader {
    pub fn new(line: u32) -> Self {
        NodeHeader {
            line,
            comment: NO_INDEX,
            header_size: NODE_HEADER_SIZE as u16,
            extra: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub header: NodeHeader,
    pub prefix: u32,
    pub uri: u32,
    trailing: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndElement {
    pub header: NodeHeader,
    pub ns: u32,
    pub name: u32,
    trailing: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub header: NodeHeader,
    pub ns: u32,
    pub name: u32,
    pub attribute_start: u16,
    pub attribute_size: u16,
    /// 1-based positions of the id/class/style attributes, 0 when absent
    pub id_index: u16,
    pub class_index: u16,
    pub style_index: u16,
    pub attributes: Vec<Attribute>,
    pub children: Vec<XmlNode>,
    pub end: EndElement,
    gap: Vec<u8>,
    trailing: Vec<u8>,
}

impl Element {
    /// New element with the default attribute layout
    pub fn new(ns: u32, name: u32, line: u32) -> Self {
        Element {
            header: NodeHeader::new(line),
            ns,
            name,
            attribute_start: ELEMENT_EXT_SIZE as u16,
            attribute_size: ATTRIBUTE_SIZE as u16,
            id_index: 0,
            class_index: 0,
            style_index: 0,
            attributes: Vec::new(),
            children: Vec::new(),
            end: EndElement {
                header: NodeHeader::new(line),
                ns,
                name,
                trailing: Vec::new(),
            },
            gap: Vec::new(),
            trailing: Vec::new(),
        }
    }

    /// Insert at `pos`, keeping the 1-based special indices pointing at the
    /// same attributes
    pub fn insert_attribute(&mut self, pos: usize, attr: Attribute) {
        self.attributes.insert(pos, attr);
        let threshold = (pos + 1) as u16;
        for index in [&mut self.id_index, &mut self.class_index, &mut self.style_index] {
            if *index >= threshold {
                *index += 1;
            }
        }
    }

    pub fn remove_attribute(&mut self, pos: usize) -> Attribute {
        let removed = self.attributes.remove(pos);
        let removed_index = (pos + 1) as u16;
        for index in [&mut self.id_index, &mut self.class_index, &mut self.style_index] {
            if *index == removed_index {
                *index = 0;
            } else if *index > removed_index {
                *index -= 1;
            }
        }
        removed
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CData {
    pub header: NodeHeader,
    pub data: u32,
    pub value: TypedValue,
    trailing: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    StartNamespace(Namespace),
    EndNamespace(Namespace),
    Element(Element),
    CData(CData),
    /// Chunk this editor does not interpret, kept verbatim
    Unknown(Vec<u8>),
}

/// Chunks that precede the element tree, in file order
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeadingChunk {
    StringPool,
    ResourceMap,
    Other(Vec<u8>),
}

/// Parsed binary manifest
#[derive(Debug, Clone)]
pub struct ManifestTree {
    pub pool: StringPool,
    pub resource_map: Vec<u32>,
    pub nodes: Vec<XmlNode>,
    header_size: u16,
    header_extra: Vec<u8>,
    resource_map_header_size: u16,
    leading: Vec<LeadingChunk>,
}

impl ManifestTree {
    /// Parse a compiled manifest
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let header = ChunkHeader::read(bytes, 0)?;
        if header.chunk_type != RES_XML_TYPE {
            return Err(malformed(format!(
                "bad magic {:#06x}, not a binary XML document",
                header.chunk_type
            )));
        }
        let end = header.size as usize;
        let doc = &bytes[..end];
        let header_extra = doc[CHUNK_HEADER_SIZE..header.header_size as usize].to_vec();

        let mut pool = None;
        let mut resource_map = Vec::new();
        let mut resource_map_header_size = CHUNK_HEADER_SIZE as u16;
        let mut leading = Vec::new();
        let mut builder = TreeBuilder::default();

        let mut pos = header.header_size as usize;
        while pos < end {
            let ch = ChunkHeader::read(doc, pos)?;
            let chunk = &doc[pos..pos + ch.size as usize];
            match ch.chunk_type {
                RES_STRING_POOL_TYPE if pool.is_none() && builder.is_empty() => {
                    pool = Some(StringPool::parse(chunk)?);
                    leading.push(LeadingChunk::StringPool);
                }
                RES_XML_RESOURCE_MAP_TYPE if builder.is_empty() => {
                    let ids = &chunk[ch.header_size as usize..];
                    resource_map = ids.chunks_exact(4).map(LittleEndian::read_u32).collect();
                    resource_map_header_size = ch.header_size;
                    leading.push(LeadingChunk::ResourceMap);
                }
                RES_XML_START_NAMESPACE_TYPE
                | RES_XML_END_NAMESPACE_TYPE
                | RES_XML_START_ELEMENT_TYPE
                | RES_XML_END_ELEMENT_TYPE
                | RES_XML_CDATA_TYPE => {
                    if pool.is_none() {
                        return Err(malformed("element tree precedes the string pool"));
                    }
                    builder.feed(ch, chunk)?;
                }
                _ if builder.is_empty() => leading.push(LeadingChunk::Other(chunk.to_vec())),
                _ => builder.push(XmlNode::Unknown(chunk.to_vec())),
            }
            pos += ch.size as usize;
        }

        let pool = pool.ok_or_else(|| malformed("missing string pool"))?;
        let nodes = builder.finish()?;
        let mut tree = ManifestTree {
            pool,
            resource_map,
            nodes,
            header_size: header.header_size,
            header_extra,
            resource_map_header_size,
            leading,
        };
        tree.validate()?;
        trace!(
            "📖 Parsed manifest: {} strings, {} resource ids",
            tree.pool.len(),
            tree.resource_map.len()
        );
        Ok(tree)
    }

    fn validate(&mut self) -> Result<()> {
        if self.resource_map.len() > self.pool.len() {
            return Err(malformed("resource map longer than string pool"));
        }
        let count = self.pool.len() as u32;
        let mut dangling = None;
        self.for_each_string_ref(&mut |idx| {
            if *idx != NO_INDEX && *idx >= count && dangling.is_none() {
                dangling = Some(*idx);
            }
        });
        match dangling {
            Some(idx) => Err(malformed(format!("dangling string index {idx}"))),
            None => Ok(()),
        }
    }

    /// Visit every string reference in the element tree
    pub fn for_each_string_ref(&mut self, f: &mut impl FnMut(&mut u32)) {
        fn walk(nodes: &mut [XmlNode], f: &mut impl FnMut(&mut u32)) {
            for node in nodes {
                match node {
                    XmlNode::StartNamespace(ns) | XmlNode::EndNamespace(ns) => {
                        f(&mut ns.header.comment);
                        f(&mut ns.prefix);
                        f(&mut ns.uri);
                    }
                    XmlNode::Element(el) => {
                        f(&mut el.header.comment);
                        f(&mut el.ns);
                        f(&mut el.name);
                        for attr in &mut el.attributes {
                            f(&mut attr.ns);
                            f(&mut attr.name);
                            f(&mut attr.raw_value);
                            if attr.value.data_type == TYPE_STRING {
                                f(&mut attr.value.data);
                            }
                        }
                        walk(&mut el.children, f);
                        f(&mut el.end.header.comment);
                        f(&mut el.end.ns);
                        f(&mut el.end.name);
                    }
                    XmlNode::CData(cdata) => {
                        f(&mut cdata.header.comment);
                        f(&mut cdata.data);
                        if cdata.value.data_type == TYPE_STRING {
                            f(&mut cdata.value.data);
                        }
                    }
                    XmlNode::Unknown(_) => {}
                }
            }
        }
        walk(&mut self.nodes, f);
    }

    /// Number of references to string `index`
    pub fn string_ref_count(&mut self, index: u32) -> usize {
        let mut count = 0;
        self.for_each_string_ref(&mut |idx| {
            if *idx == index {
                count += 1;
            }
        });
        count
    }

    /// Insert a string at `index`, renumbering every reference at or past it
    pub fn insert_string(&mut self, index: u32, value: &str) -> Result<()> {
        self.pool.insert(index as usize, value)?;
        self.for_each_string_ref(&mut |idx| {
            if *idx != NO_INDEX && *idx >= index {
                *idx += 1;
            }
        });
        Ok(())
    }

    /// Index of `value` outside the resource-mapped prefix, appending it when
    /// missing
    pub fn intern(&mut self, value: &str) -> u32 {
        match self.pool.find_from(value, self.resource_map.len()) {
            Some(idx) => idx,
            None => self.pool.push(value),
        }
    }

    /// Index of an attribute name bound to `res_id`, inserting it at the end
    /// of the resource-mapped prefix when missing
    pub fn intern_attribute_name(&mut self, name: &str, res_id: u32) -> Result<u32> {
        if let Some(idx) = self.resource_map.iter().position(|&id| id == res_id) {
            return Ok(idx as u32);
        }
        let idx = self.resource_map.len() as u32;
        self.insert_string(idx, name)?;
        self.resource_map.push(res_id);
        if !self.leading.contains(&LeadingChunk::ResourceMap) {
            let after_pool = self
                .leading
                .iter()
                .position(|c| *c == LeadingChunk::StringPool)
                .map_or(0, |p| p + 1);
            self.leading.insert(after_pool, LeadingChunk::ResourceMap);
        }
        Ok(idx)
    }

    /// Resource id bound to the attribute name at `name`
    pub fn resource_id(&self, name: u32) -> Option<u32> {
        self.resource_map.get(name as usize).copied()
    }

    pub fn string(&self, index: u32) -> Option<&str> {
        if index == NO_INDEX {
            return None;
        }
        self.pool.get(index)
    }

    /// Serialize the document
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        ChunkHeader {
            chunk_type: RES_XML_TYPE,
            header_size: self.header_size,
            size: 0,
        }
        .write(&mut out)?;
        out.extend_from_slice(&self.header_extra);

        for chunk in &self.leading {
            match chunk {
                LeadingChunk::StringPool => out.extend(self.pool.to_bytes()?),
                LeadingChunk::ResourceMap => {
                    let header_size = self.resource_map_header_size as usize;
                    ChunkHeader {
                        chunk_type: RES_XML_RESOURCE_MAP_TYPE,
                        header_size: self.resource_map_header_size,
                        size: (header_size + 4 * self.resource_map.len()) as u32,
                    }
                    .write(&mut out)?;
                    out.extend(std::iter::repeat_n(0u8, header_size - CHUNK_HEADER_SIZE));
                    for id in &self.resource_map {
                        out.write_u32::<LittleEndian>(*id)?;
                    }
                }
                LeadingChunk::Other(raw) => out.extend_from_slice(raw),
            }
        }

        for node in &self.nodes {
            write_node(node, &mut out)?;
        }
        patch_size(&mut out, 0);
        Ok(out)
    }
}

fn write_node_header(chunk_type: u16, header: &NodeHeader, out: &mut Vec<u8>) -> Result<usize> {
    let start = out.len();
    ChunkHeader {
        chunk_type,
        header_size: header.header_size,
        size: 0,
    }
    .write(out)?;
    out.write_u32::<LittleEndian>(header.line)?;
    out.write_u32::<LittleEndian>(header.comment)?;
    out.extend_from_slice(&header.extra);
    Ok(start)
}

fn write_node(node: &XmlNode, out: &mut Vec<u8>) -> Result<()> {
    match node {
        XmlNode::StartNamespace(ns) | XmlNode::EndNamespace(ns) => {
            let chunk_type = if matches!(node, XmlNode::StartNamespace(_)) {
                RES_XML_START_NAMESPACE_TYPE
            } else {
                RES_XML_END_NAMESPACE_TYPE
            };
            let start = write_node_header(chunk_type, &ns.header, out)?;
            out.write_u32::<LittleEndian>(ns.prefix)?;
            out.write_u32::<LittleEndian>(ns.uri)?;
            out.extend_from_slice(&ns.trailing);
            patch_size(out, start);
        }
        XmlNode::Element(el) => {
            let start = write_node_header(RES_XML_START_ELEMENT_TYPE, &el.header, out)?;
            out.write_u32::<LittleEndian>(el.ns)?;
            out.write_u32::<LittleEndian>(el.name)?;
            out.write_u16::<LittleEndian>(el.attribute_start)?;
            out.write_u16::<LittleEndian>(el.attribute_size)?;
            let count = u16::try_from(el.attributes.len())
                .map_err(|_| malformed("too many attributes"))?;
            out.write_u16::<LittleEndian>(count)?;
            out.write_u16::<LittleEndian>(el.id_index)?;
            out.write_u16::<LittleEndian>(el.class_index)?;
            out.write_u16::<LittleEndian>(el.style_index)?;
            out.extend_from_slice(&el.gap);
            let pad = el.attribute_size as usize - ATTRIBUTE_SIZE;
            for attr in &el.attributes {
                out.write_u32::<LittleEndian>(attr.ns)?;
                out.write_u32::<LittleEndian>(attr.name)?;
                out.write_u32::<LittleEndian>(attr.raw_value)?;
                attr.value.write(out)?;
                let mut extra = attr.extra.clone();
                extra.resize(pad, 0);
                out.extend_from_slice(&extra);
            }
            out.extend_from_slice(&el.trailing);
            patch_size(out, start);

            for child in &el.children {
                write_node(child, out)?;
            }

            let start = write_node_header(RES_XML_END_ELEMENT_TYPE, &el.end.header, out)?;
            out.write_u32::<LittleEndian>(el.end.ns)?;
            out.write_u32::<LittleEndian>(el.end.name)?;
            out.extend_from_slice(&el.end.trailing);
            patch_size(out, start);
        }
        XmlNode::CData(cdata) => {
            let start = write_node_header(RES_XML_CDATA_TYPE, &cdata.header, out)?;
            out.write_u32::<LittleEndian>(cdata.data)?;
            cdata.value.write(out)?;
            out.extend_from_slice(&cdata.trailing);
            patch_size(out, start);
        }
        XmlNode::Unknown(raw) => out.extend_from_slice(raw),
    }
    Ok(())
}

/// Stack machine turning the flat chunk stream into nested elements
#[derive(Default)]
struct TreeBuilder {
    roots: Vec<XmlNode>,
    open: Vec<Element>,
}

impl TreeBuilder {
    fn is_empty(&self) -> bool {
        self.roots.is_empty() && self.open.is_empty()
    }

    fn push(&mut self, node: XmlNode) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(node),
            None => self.roots.push(node),
        }
    }

    fn feed(&mut self, ch: ChunkHeader, chunk: &[u8]) -> Result<()> {
        let header_size = ch.header_size as usize;
        if header_size < NODE_HEADER_SIZE {
            return Err(malformed(format!(
                "node chunk {:#06x} header too small",
                ch.chunk_type
            )));
        }
        let header = NodeHeader {
            line: LittleEndian::read_u32(&chunk[8..12]),
            comment: LittleEndian::read_u32(&chunk[12..16]),
            header_size: ch.header_size,
            extra: chunk[NODE_HEADER_SIZE..header_size].to_vec(),
        };
        let ext = &chunk[header_size..];
        let need = |n: usize| {
            if ext.len() < n {
                Err(malformed(format!("node chunk {:#06x} truncated", ch.chunk_type)))
            } else {
                Ok(())
            }
        };

        match ch.chunk_type {
            RES_XML_START_NAMESPACE_TYPE | RES_XML_END_NAMESPACE_TYPE => {
                need(8)?;
                let ns = Namespace {
                    header,
                    prefix: LittleEndian::read_u32(&ext[0..4]),
                    uri: LittleEndian::read_u32(&ext[4..8]),
                    trailing: ext[8..].to_vec(),
                };
                self.push(if ch.chunk_type == RES_XML_START_NAMESPACE_TYPE {
                    XmlNode::StartNamespace(ns)
                } else {
                    XmlNode::EndNamespace(ns)
                });
            }
            RES_XML_START_ELEMENT_TYPE => {
                need(ELEMENT_EXT_SIZE)?;
                let attribute_start = LittleEndian::read_u16(&ext[8..10]);
                let attribute_size = LittleEndian::read_u16(&ext[10..12]);
                let count = LittleEndian::read_u16(&ext[12..14]) as usize;
                if (attribute_start as usize) < ELEMENT_EXT_SIZE
                    || (attribute_size as usize) < ATTRIBUTE_SIZE
                {
                    return Err(malformed("element attribute layout is invalid"));
                }
                let attrs_at = attribute_start as usize;
                let attrs_end = attrs_at + count * attribute_size as usize;
                need(attrs_end)?;

                let attributes = (0..count)
                    .map(|i| {
                        let a = &ext[attrs_at + i * attribute_size as usize..];
                        Attribute {
                            ns: LittleEndian::read_u32(&a[0..4]),
                            name: LittleEndian::read_u32(&a[4..8]),
                            raw_value: LittleEndian::read_u32(&a[8..12]),
                            value: TypedValue::read(&a[12..20]),
                            extra: a[ATTRIBUTE_SIZE..attribute_size as usize].to_vec(),
                        }
                    })
                    .collect();

                let ns = LittleEndian::read_u32(&ext[0..4]);
                let name = LittleEndian::read_u32(&ext[4..8]);
                self.open.push(Element {
                    header,
                    ns,
                    name,
                    attribute_start,
                    attribute_size,
                    id_index: LittleEndian::read_u16(&ext[14..16]),
                    class_index: LittleEndian::read_u16(&ext[16..18]),
                    style_index: LittleEndian::read_u16(&ext[18..20]),
                    attributes,
                    children: Vec::new(),
                    end: EndElement {
                        header: NodeHeader::new(0),
                        ns,
                        name,
                        trailing: Vec::new(),
                    },
                    gap: ext[ELEMENT_EXT_SIZE..attrs_at].to_vec(),
                    trailing: ext[attrs_end..].to_vec(),
                });
            }
            RES_XML_END_ELEMENT_TYPE => {
                need(8)?;
                let ns = LittleEndian::read_u32(&ext[0..4]);
                let name = LittleEndian::read_u32(&ext[4..8]);
                let mut el = self
                    .open
                    .pop()
                    .ok_or_else(|| malformed("end element without a matching start"))?;
                if el.name != name || el.ns != ns {
                    return Err(malformed(format!(
                        "end element {name} does not close start element {}",
                        el.name
                    )));
                }
                el.end = EndElement {
                    header,
                    ns,
                    name,
                    trailing: ext[8..].to_vec(),
                };
                self.push(XmlNode::Element(el));
            }
            _ => {
                need(12)?;
                self.push(XmlNode::CData(CData {
                    header,
                    data: LittleEndian::read_u32(&ext[0..4]),
                    value: TypedValue::read(&ext[4..12]),
                    trailing: ext[12..].to_vec(),
                }));
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<Vec<XmlNode>> {
        if let Some(open) = self.open.last() {
            return Err(malformed(format!(
                "unterminated element (name index {})",
                open.name
            )));
        }
        Ok(self.roots)
    }
}
