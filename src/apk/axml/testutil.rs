//! Compiled-manifest fixtures for tests
//!
//! Lays chunks out the way aapt2 does: attribute names bound to resource ids
//! first in the pool (sorted by id) and mirrored by the resource map, then
//! every other string in document order.

use crate::apk::constants::{
    ANDROID_NAMESPACE, NO_INDEX, RES_STRING_POOL_TYPE, RES_XML_END_ELEMENT_TYPE,
    RES_XML_END_NAMESPACE_TYPE, RES_XML_RESOURCE_MAP_TYPE, RES_XML_START_ELEMENT_TYPE,
    RES_XML_START_NAMESPACE_TYPE, RES_XML_TYPE, STRING_POOL_UTF8_FLAG, TYPE_INT_BOOLEAN,
    TYPE_INT_DEC, TYPE_STRING,
};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

#[derive(Debug, Clone)]
pub(crate) enum FixtureValue {
    Str(String),
    Int(u32),
    Bool(bool),
    /// String-typed value pointing past the end of the pool
    DanglingString,
}

impl FixtureValue {
    pub(crate) fn str(s: &str) -> Self {
        FixtureValue::Str(s.to_string())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FixtureAttr {
    name: String,
    res_id: Option<u32>,
    value: FixtureValue,
}

#[derive(Debug, Clone)]
pub(crate) struct FixtureElement {
    name: String,
    attrs: Vec<FixtureAttr>,
    children: Vec<FixtureElement>,
}

impl FixtureElement {
    pub(crate) fn new(name: &str) -> Self {
        FixtureElement {
            name: name.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    /// `android:` attribute when `res_id` is set, plain attribute otherwise
    pub(crate) fn attr(mut self, name: &str, res_id: Option<u32>, value: FixtureValue) -> Self {
        self.attrs.push(FixtureAttr {
            name: name.to_string(),
            res_id,
            value,
        });
        self
    }

    pub(crate) fn child(mut self, child: FixtureElement) -> Self {
        self.children.push(child);
        self
    }

    pub(crate) fn meta_data(name: &str, value: &str) -> Self {
        FixtureElement::new("meta-data")
            .attr("name", Some(0x0101_0003), FixtureValue::str(name))
            .attr("value", Some(0x0101_0024), FixtureValue::str(value))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ManifestFixture {
    root: FixtureElement,
    utf8: bool,
    end_tags: bool,
}

impl ManifestFixture {
    /// A small but realistic app manifest, versionCode 10
    pub(crate) fn sample() -> Self {
        let root = FixtureElement::new("manifest")
            .attr("versionCode", Some(0x0101_021b), FixtureValue::Int(10))
            .attr("versionName", Some(0x0101_021c), FixtureValue::str("1.0"))
            .attr("package", None, FixtureValue::str("com.example.app"))
            .child(
                FixtureElement::new("uses-sdk")
                    .attr("minSdkVersion", Some(0x0101_020c), FixtureValue::Int(24))
                    .attr("targetSdkVersion", Some(0x0101_0270), FixtureValue::Int(33)),
            )
            .child(
                FixtureElement::new("application")
                    .attr("label", Some(0x0101_0001), FixtureValue::str("Example"))
                    .attr("name", Some(0x0101_0003), FixtureValue::str("com.example.app.App"))
                    .child(
                        FixtureElement::new("activity").attr(
                            "name",
                            Some(0x0101_0003),
                            FixtureValue::str(".MainActivity"),
                        ),
                    )
                    .child(FixtureElement::meta_data("existing.key", "existing")),
            );
        ManifestFixture {
            root,
            utf8: false,
            end_tags: true,
        }
    }

    pub(crate) fn utf8(mut self, utf8: bool) -> Self {
        self.utf8 = utf8;
        self
    }

    pub(crate) fn without_end_tags(mut self) -> Self {
        self.end_tags = false;
        self
    }

    pub(crate) fn manifest_attr(mut self, name: &str, res_id: Option<u32>, value: FixtureValue) -> Self {
        self.root = self.root.attr(name, res_id, value);
        self
    }

    pub(crate) fn application_attr(
        self,
        name: &str,
        res_id: Option<u32>,
        value: FixtureValue,
    ) -> Self {
        self.with_application(|app| app.attr(name, res_id, value))
    }

    pub(crate) fn application_child(self, child: FixtureElement) -> Self {
        self.with_application(|app| app.child(child))
    }

    fn with_application(mut self, f: impl FnOnce(FixtureElement) -> FixtureElement) -> Self {
        if let Some(app) = self
            .root
            .children
            .iter_mut()
            .find(|c| c.name == "application")
        {
            let taken = std::mem::replace(app, FixtureElement::new("application"));
            *app = f(taken);
        }
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut strings = Strings::default();

        let mut ids = Vec::new();
        collect_ids(&self.root, &mut ids);
        ids.sort_by_key(|(id, _)| *id);
        ids.dedup_by_key(|(id, _)| *id);
        for (_, name) in &ids {
            strings.add(name);
        }
        let prefix = strings.add("android");
        let uri = strings.add(ANDROID_NAMESPACE);
        collect_strings(&self.root, &mut strings);

        let mut out = Vec::new();
        write_header(&mut out, RES_XML_TYPE, 8, 0);
        out.extend(encode_pool(&strings.list, self.utf8));

        write_header(&mut out, RES_XML_RESOURCE_MAP_TYPE, 8, (8 + 4 * ids.len()) as u32);
        for (id, _) in &ids {
            out.write_u32::<LittleEndian>(*id).unwrap();
        }

        let mut line = 1;
        write_namespace(&mut out, RES_XML_START_NAMESPACE_TYPE, line, prefix, uri);
        self.write_element(&self.root, &strings, uri, &mut line, &mut out);
        write_namespace(&mut out, RES_XML_END_NAMESPACE_TYPE, line, prefix, uri);

        let len = out.len() as u32;
        LittleEndian::write_u32(&mut out[4..8], len);
        out
    }

    fn write_element(
        &self,
        el: &FixtureElement,
        strings: &Strings,
        uri: u32,
        line: &mut u32,
        out: &mut Vec<u8>,
    ) {
        let mut attrs = el.attrs.clone();
        attrs.sort_by_key(|a| a.res_id.unwrap_or(u32::MAX));

        let name = strings.index(&el.name);
        write_header(
            out,
            RES_XML_START_ELEMENT_TYPE,
            16,
            (16 + 20 + 20 * attrs.len()) as u32,
        );
        out.write_u32::<LittleEndian>(*line).unwrap();
        out.write_u32::<LittleEndian>(NO_INDEX).unwrap();
        out.write_u32::<LittleEndian>(NO_INDEX).unwrap();
        out.write_u32::<LittleEndian>(name).unwrap();
        out.write_u16::<LittleEndian>(20).unwrap();
        out.write_u16::<LittleEndian>(20).unwrap();
        out.write_u16::<LittleEndian>(attrs.len() as u16).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        out.write_u16::<LittleEndian>(0).unwrap();
        for attr in &attrs {
            let ns = if attr.res_id.is_some() { uri } else { NO_INDEX };
            let (raw, data_type, data) = match &attr.value {
                FixtureValue::Str(s) => (strings.index(s), TYPE_STRING, strings.index(s)),
                FixtureValue::Int(v) => (NO_INDEX, TYPE_INT_DEC, *v),
                FixtureValue::Bool(b) => {
                    (NO_INDEX, TYPE_INT_BOOLEAN, if *b { 0xffff_ffff } else { 0 })
                }
                FixtureValue::DanglingString => (NO_INDEX, TYPE_STRING, 9_999),
            };
            out.write_u32::<LittleEndian>(ns).unwrap();
            out.write_u32::<LittleEndian>(strings.index(&attr.name)).unwrap();
            out.write_u32::<LittleEndian>(raw).unwrap();
            out.write_u16::<LittleEndian>(8).unwrap();
            out.write_u8(0).unwrap();
            out.write_u8(data_type).unwrap();
            out.write_u32::<LittleEndian>(data).unwrap();
        }
        *line += 1;

        for child in &el.children {
            self.write_element(child, strings, uri, line, out);
        }

        if self.end_tags {
            write_header(out, RES_XML_END_ELEMENT_TYPE, 16, 24);
            out.write_u32::<LittleEndian>(*line).unwrap();
            out.write_u32::<LittleEndian>(NO_INDEX).unwrap();
            out.write_u32::<LittleEndian>(NO_INDEX).unwrap();
            out.write_u32::<LittleEndian>(name).unwrap();
        }
        *line += 1;
    }
}

#[derive(Default)]
struct Strings {
    list: Vec<String>,
}

impl Strings {
    fn add(&mut self, s: &str) -> u32 {
        match self.list.iter().position(|x| x == s) {
            Some(i) => i as u32,
            None => {
                self.list.push(s.to_string());
                (self.list.len() - 1) as u32
            }
        }
    }

    fn index(&self, s: &str) -> u32 {
        self.list
            .iter()
            .position(|x| x == s)
            .map(|i| i as u32)
            .unwrap_or(NO_INDEX)
    }
}

fn collect_ids(el: &FixtureElement, out: &mut Vec<(u32, String)>) {
    for attr in &el.attrs {
        if let Some(id) = attr.res_id {
            out.push((id, attr.name.clone()));
        }
    }
    for child in &el.children {
        collect_ids(child, out);
    }
}

fn collect_strings(el: &FixtureElement, strings: &mut Strings) {
    strings.add(&el.name);
    for attr in &el.attrs {
        if attr.res_id.is_none() {
            strings.add(&attr.name);
        }
        if let FixtureValue::Str(s) = &attr.value {
            strings.add(s);
        }
    }
    for child in &el.children {
        collect_strings(child, strings);
    }
}

fn write_header(out: &mut Vec<u8>, chunk_type: u16, header_size: u16, size: u32) {
    out.write_u16::<LittleEndian>(chunk_type).unwrap();
    out.write_u16::<LittleEndian>(header_size).unwrap();
    out.write_u32::<LittleEndian>(size).unwrap();
}

fn write_namespace(out: &mut Vec<u8>, chunk_type: u16, line: u32, prefix: u32, uri: u32) {
    write_header(out, chunk_type, 16, 24);
    out.write_u32::<LittleEndian>(line).unwrap();
    out.write_u32::<LittleEndian>(NO_INDEX).unwrap();
    out.write_u32::<LittleEndian>(prefix).unwrap();
    out.write_u32::<LittleEndian>(uri).unwrap();
}

fn encode_pool(strings: &[String], utf8: bool) -> Vec<u8> {
    let mut offsets = Vec::new();
    let mut data = Vec::new();
    for s in strings {
        offsets.push(data.len() as u32);
        if utf8 {
            data.push(s.chars().count() as u8);
            data.push(s.len() as u8);
            data.extend_from_slice(s.as_bytes());
            data.push(0);
        } else {
            let units: Vec<u16> = s.encode_utf16().collect();
            data.write_u16::<LittleEndian>(units.len() as u16).unwrap();
            for u in units {
                data.write_u16::<LittleEndian>(u).unwrap();
            }
            data.write_u16::<LittleEndian>(0).unwrap();
        }
    }
    while data.len() % 4 != 0 {
        data.push(0);
    }

    let strings_start = 28 + 4 * strings.len();
    let mut out = Vec::new();
    write_header(
        &mut out,
        RES_STRING_POOL_TYPE,
        28,
        (strings_start + data.len()) as u32,
    );
    out.write_u32::<LittleEndian>(strings.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(if utf8 { STRING_POOL_UTF8_FLAG } else { 0 })
        .unwrap();
    out.write_u32::<LittleEndian>(strings_start as u32).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    for offset in offsets {
        out.write_u32::<LittleEndian>(offset).unwrap();
    }
    out.extend(data);
    out
}
