//! Manifest-level queries and mutations on top of [`ManifestTree`]
//!
//! Every mutation is idempotent: applying it twice with the same arguments
//! yields the same bytes as applying it once.

use super::tree::{Attribute, Element, ManifestTree, TypedValue, XmlNode};
use crate::apk::constants::{
    ANDROID_NAMESPACE, ATTR_APP_COMPONENT_FACTORY, ATTR_DEBUGGABLE, ATTR_MIN_SDK_VERSION,
    ATTR_NAME, ATTR_VALUE, ATTR_VERSION_CODE, NO_INDEX, TYPE_INT_BOOLEAN, TYPE_INT_DEC,
    TYPE_INT_HEX, TYPE_REFERENCE, TYPE_STRING,
};
use crate::apk::defaults::{
    MARKER_META_KEY, REQUIRED_SPLIT_TYPES_ATTR, SOURCE_STAMP_META_KEYS, SPLIT_REQUIRED_ATTR,
    SPLIT_REQUIRED_META_KEYS,
};
use crate::apk::patcher::config::PatchConfig;
use crate::apk::policy::{BypassLevel, Relaxation};
use crate::exceptions::{PatchError, Result};
use log::debug;
use std::fmt;

const MANIFEST_TAG: &str = "manifest";
const APPLICATION_TAG: &str = "application";
const USES_SDK_TAG: &str = "uses-sdk";
const META_DATA_TAG: &str = "meta-data";

/// Decoded attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    String(String),
    Int(u32),
    Bool(bool),
    Reference(u32),
    Raw { data_type: u8, data: u32 },
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Reference(r) => write!(f, "@{r:#010x}"),
            AttrValue::Raw { data_type, data } => write!(f, "({data_type:#04x}){data:#010x}"),
        }
    }
}

/// Editable binary manifest
#[derive(Debug, Clone)]
pub struct ManifestEditor {
    tree: ManifestTree,
}

impl ManifestEditor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let tree = ManifestTree::parse(bytes)?;
        let editor = ManifestEditor { tree };
        if editor.manifest_path().is_none() {
            return Err(PatchError::MalformedManifest(
                "document has no <manifest> root element".to_string(),
            ));
        }
        Ok(editor)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.tree.to_bytes()
    }

    pub fn tree(&self) -> &ManifestTree {
        &self.tree
    }

    // =================================
    // Queries
    // =================================

    pub fn package_name(&self) -> Option<String> {
        let root = self.element(&self.manifest_path()?)?;
        match self.attribute_by_name(root, "package")? {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn version_code(&self) -> Option<u32> {
        let root = self.element(&self.manifest_path()?)?;
        match self.attribute_by_id(root, ATTR_VERSION_CODE)? {
            AttrValue::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn min_sdk_version(&self) -> Option<u32> {
        let path = self.child_path(&self.manifest_path()?, USES_SDK_TAG)?;
        match self.attribute_by_id(self.element(&path)?, ATTR_MIN_SDK_VERSION)? {
            AttrValue::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Attribute of `<application>` looked up by its local name
    pub fn application_attribute(&self, name: &str) -> Option<AttrValue> {
        let app = self.element(&self.application_path()?)?;
        self.attribute_by_name(app, name)
    }

    /// Value of the first `<meta-data>` named `key`
    pub fn meta_data(&self, key: &str) -> Option<String> {
        let path = self.meta_data_paths(key).into_iter().next()?;
        let el = self.element(&path)?;
        self.attribute_by_id(el, ATTR_VALUE).map(|v| v.to_string())
    }

    pub fn meta_data_keys(&self) -> Vec<String> {
        let Some(app) = self.application_path().and_then(|p| self.element(&p)) else {
            return Vec::new();
        };
        app.child_elements()
            .filter(|el| self.tree.string(el.name) == Some(META_DATA_TAG))
            .filter_map(|el| match self.attribute_by_id(el, ATTR_NAME) {
                Some(AttrValue::String(s)) => Some(s),
                _ => None,
            })
            .collect()
    }

    /// `originalVersionCode` recorded by a previous patch run, if any
    pub fn recorded_original_version_code(&self) -> Option<u32> {
        let marker = self.meta_data(MARKER_META_KEY)?;
        PatchConfig::from_marker(&marker)
            .ok()
            .map(|config| config.original_version_code)
    }

    // =================================
    // Mutations
    // =================================

    /// Point `android:appComponentFactory` at `class_name`, returning the
    /// value it replaced
    pub fn set_application_entry_point(&mut self, class_name: &str) -> Result<Option<String>> {
        let app = self.require_application()?;
        let previous = self.set_attribute(
            &app,
            "appComponentFactory",
            ATTR_APP_COMPONENT_FACTORY,
            NewValue::String(class_name),
        )?;
        Ok(previous.map(|v| v.to_string()))
    }

    /// Add or replace `<meta-data android:name=key android:value=value>`
    ///
    /// Duplicate entries for the same key collapse into one.
    pub fn add_meta_data(&mut self, key: &str, value: &str) -> Result<()> {
        let app = self.require_application()?;
        let existing = self.meta_data_paths(key);
        if let Some((first, rest)) = existing.split_first() {
            self.set_attribute(first, "value", ATTR_VALUE, NewValue::String(value))?;
            // Highest child index first so earlier paths stay valid
            for path in rest.iter().rev() {
                self.remove_node(path);
            }
            return Ok(());
        }

        // Mapped names first: inserting them renumbers later strings
        let name_attr = self.tree.intern_attribute_name("name", ATTR_NAME)?;
        let value_attr = self.tree.intern_attribute_name("value", ATTR_VALUE)?;
        let ns = self.android_namespace();
        let tag = self.tree.intern(META_DATA_TAG);
        let key_idx = self.tree.intern(key);
        let value_idx = self.tree.intern(value);

        let line = self.element(&app).map_or(0, |el| el.header.line);
        let mut el = Element::new(NO_INDEX, tag, line);
        el.attributes.push(Attribute::new(
            ns,
            name_attr,
            key_idx,
            TypedValue::new(TYPE_STRING, key_idx),
        ));
        el.attributes.push(Attribute::new(
            ns,
            value_attr,
            value_idx,
            TypedValue::new(TYPE_STRING, value_idx),
        ));
        if let Some(parent) = element_mut(&mut self.tree.nodes, &app) {
            parent.children.push(XmlNode::Element(el));
        }
        debug!("📝 Added meta-data {key}");
        Ok(())
    }

    /// Remove every `<meta-data>` named `key`
    pub fn remove_meta_data(&mut self, key: &str) -> bool {
        let paths = self.meta_data_paths(key);
        for path in paths.iter().rev() {
            self.remove_node(path);
        }
        !paths.is_empty()
    }

    pub fn set_debuggable(&mut self, debuggable: bool) -> Result<()> {
        let app = self.require_application()?;
        self.set_attribute(&app, "debuggable", ATTR_DEBUGGABLE, NewValue::Bool(debuggable))?;
        Ok(())
    }

    pub fn set_version_code(&mut self, version_code: u32) -> Result<()> {
        let root = self.require_manifest()?;
        self.set_attribute(
            &root,
            "versionCode",
            ATTR_VERSION_CODE,
            NewValue::Int(version_code),
        )?;
        Ok(())
    }

    /// Set versionCode to the original version code plus `delta`
    ///
    /// The base is the version recorded in an existing marker, so bumping an
    /// already-patched manifest does not compound.
    pub fn bump_version_code(&mut self, delta: u32) -> Result<u32> {
        let base = self
            .recorded_original_version_code()
            .or_else(|| self.version_code())
            .unwrap_or(0);
        let bumped = base.checked_add(delta).ok_or_else(|| {
            PatchError::MalformedManifest(format!("versionCode {base} + {delta} overflows"))
        })?;
        self.set_version_code(bumped)?;
        Ok(bumped)
    }

    /// Apply the manifest relaxations of `level`, returning what changed
    pub fn relax_signature_constraint(&mut self, level: BypassLevel) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        for relaxation in level.relaxations() {
            match relaxation {
                Relaxation::StripSourceStamp => {
                    for key in SOURCE_STAMP_META_KEYS {
                        if self.remove_meta_data(key) {
                            applied.push(format!("removed meta-data {key}"));
                        }
                    }
                }
                Relaxation::DropSplitRequirement => {
                    for attr in [SPLIT_REQUIRED_ATTR, REQUIRED_SPLIT_TYPES_ATTR] {
                        if self.remove_manifest_attribute(attr) {
                            applied.push(format!("removed manifest attribute {attr}"));
                        }
                        if self.remove_application_attribute(attr) {
                            applied.push(format!("removed application attribute {attr}"));
                        }
                    }
                    for key in SPLIT_REQUIRED_META_KEYS {
                        if self.remove_meta_data(key) {
                            applied.push(format!("removed meta-data {key}"));
                        }
                    }
                }
                Relaxation::RecordOriginalSignature | Relaxation::EmbedOriginalArchive => {}
            }
        }
        Ok(applied)
    }

    pub fn remove_application_attribute(&mut self, name: &str) -> bool {
        match self.application_path() {
            Some(path) => self.remove_attribute(&path, name),
            None => false,
        }
    }

    pub fn remove_manifest_attribute(&mut self, name: &str) -> bool {
        match self.manifest_path() {
            Some(path) => self.remove_attribute(&path, name),
            None => false,
        }
    }

    // =================================
    // Element navigation
    // =================================

    fn manifest_path(&self) -> Option<Vec<usize>> {
        self.tree
            .nodes
            .iter()
            .position(|n| {
                matches!(n, XmlNode::Element(el) if self.tree.string(el.name) == Some(MANIFEST_TAG))
            })
            .map(|i| vec![i])
    }

    fn application_path(&self) -> Option<Vec<usize>> {
        self.child_path(&self.manifest_path()?, APPLICATION_TAG)
    }

    fn require_manifest(&self) -> Result<Vec<usize>> {
        self.manifest_path().ok_or_else(|| {
            PatchError::MalformedManifest("document has no <manifest> root element".to_string())
        })
    }

    fn require_application(&self) -> Result<Vec<usize>> {
        self.application_path().ok_or_else(|| {
            PatchError::MalformedManifest("manifest has no <application> element".to_string())
        })
    }

    fn child_path(&self, parent: &[usize], tag: &str) -> Option<Vec<usize>> {
        let el = self.element(parent)?;
        let idx = el.children.iter().position(|n| {
            matches!(n, XmlNode::Element(c) if self.tree.string(c.name) == Some(tag))
        })?;
        let mut path = parent.to_vec();
        path.push(idx);
        Some(path)
    }

    fn meta_data_paths(&self, key: &str) -> Vec<Vec<usize>> {
        let Some(app_path) = self.application_path() else {
            return Vec::new();
        };
        let Some(app) = self.element(&app_path) else {
            return Vec::new();
        };
        app.children
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                XmlNode::Element(el)
                    if self.tree.string(el.name) == Some(META_DATA_TAG)
                        && self.attribute_by_id(el, ATTR_NAME)
                            == Some(AttrValue::String(key.to_string())) =>
                {
                    let mut path = app_path.clone();
                    path.push(i);
                    Some(path)
                }
                _ => None,
            })
            .collect()
    }

    fn element(&self, path: &[usize]) -> Option<&Element> {
        let (first, rest) = path.split_first()?;
        let mut el = match self.tree.nodes.get(*first)? {
            XmlNode::Element(el) => el,
            _ => return None,
        };
        for i in rest {
            el = match el.children.get(*i)? {
                XmlNode::Element(child) => child,
                _ => return None,
            };
        }
        Some(el)
    }

    fn remove_node(&mut self, path: &[usize]) {
        if let Some((last, parent)) = path.split_last() {
            if let Some(parent) = element_mut(&mut self.tree.nodes, parent) {
                if *last < parent.children.len() {
                    parent.children.remove(*last);
                }
            }
        }
    }

    // =================================
    // Attributes
    // =================================

    fn decode(&self, attr: &Attribute) -> AttrValue {
        let TypedValue {
            data_type, data, ..
        } = attr.value;
        match data_type {
            TYPE_STRING => AttrValue::String(self.tree.string(data).unwrap_or_default().to_string()),
            TYPE_INT_DEC | TYPE_INT_HEX => AttrValue::Int(data),
            TYPE_INT_BOOLEAN => AttrValue::Bool(data != 0),
            TYPE_REFERENCE => AttrValue::Reference(data),
            _ => match self.tree.string(attr.raw_value) {
                Some(raw) => AttrValue::String(raw.to_string()),
                None => AttrValue::Raw { data_type, data },
            },
        }
    }

    fn attribute_by_id(&self, el: &Element, res_id: u32) -> Option<AttrValue> {
        el.attributes
            .iter()
            .find(|a| self.tree.resource_id(a.name) == Some(res_id))
            .map(|a| self.decode(a))
    }

    fn attribute_by_name(&self, el: &Element, name: &str) -> Option<AttrValue> {
        el.attributes
            .iter()
            .find(|a| self.tree.string(a.name) == Some(name))
            .map(|a| self.decode(a))
    }

    fn android_namespace(&mut self) -> u32 {
        match self.tree.pool.find_from(ANDROID_NAMESPACE, 0) {
            Some(idx) => idx,
            None => self.tree.intern(ANDROID_NAMESPACE),
        }
    }

    /// String index for a new string value of an attribute currently holding
    /// `old`. An old string used nowhere else is rewritten in place.
    fn string_slot(&mut self, old: Option<&Attribute>, value: &str) -> Result<u32> {
        let mapped = self.tree.resource_map.len() as u32;
        if let Some(old) = old.filter(|a| a.value.data_type == TYPE_STRING) {
            let idx = old.value.data;
            if self.tree.string(idx) == Some(value) {
                return Ok(idx);
            }
            if let Some(existing) = self.tree.pool.find_from(value, mapped as usize) {
                return Ok(existing);
            }
            let own_refs = 1 + usize::from(old.raw_value == idx);
            if idx >= mapped && self.tree.string_ref_count(idx) == own_refs {
                self.tree.pool.replace(idx, value)?;
                return Ok(idx);
            }
        }
        Ok(self.tree.intern(value))
    }

    fn set_attribute(
        &mut self,
        path: &[usize],
        name: &str,
        res_id: u32,
        value: NewValue<'_>,
    ) -> Result<Option<AttrValue>> {
        let name_idx = self.tree.intern_attribute_name(name, res_id)?;
        let ns = self.android_namespace();

        let (position, old) = {
            let el = self
                .element(path)
                .ok_or_else(|| PatchError::MalformedManifest(format!("no element for {name}")))?;
            let position = el
                .attributes
                .iter()
                .position(|a| self.tree.resource_id(a.name) == Some(res_id));
            (position, position.map(|i| el.attributes[i].clone()))
        };
        let previous = old.as_ref().map(|a| self.decode(a));

        let (raw_value, typed) = match value {
            NewValue::String(s) => {
                let idx = self.string_slot(old.as_ref(), s)?;
                (idx, TypedValue::new(TYPE_STRING, idx))
            }
            NewValue::Int(v) => (NO_INDEX, TypedValue::new(TYPE_INT_DEC, v)),
            NewValue::Bool(b) => (
                NO_INDEX,
                TypedValue::new(TYPE_INT_BOOLEAN, if b { 0xffff_ffff } else { 0 }),
            ),
        };

        // Sort key: mapped names by resource id, unmapped names last
        let resource_map = self.tree.resource_map.clone();
        let sort_key = |a: &Attribute| {
            resource_map
                .get(a.name as usize)
                .copied()
                .unwrap_or(u32::MAX)
        };

        let el = element_mut(&mut self.tree.nodes, path)
            .ok_or_else(|| PatchError::MalformedManifest(format!("no element for {name}")))?;
        match position {
            Some(i) => {
                let attr = &mut el.attributes[i];
                attr.raw_value = raw_value;
                attr.value = typed;
            }
            None => {
                let at = el
                    .attributes
                    .iter()
                    .position(|a| sort_key(a) > res_id)
                    .unwrap_or(el.attributes.len());
                el.insert_attribute(at, Attribute::new(ns, name_idx, raw_value, typed));
            }
        }
        Ok(previous)
    }

    fn remove_attribute(&mut self, path: &[usize], name: &str) -> bool {
        let position = self.element(path).and_then(|el| {
            el.attributes
                .iter()
                .position(|a| self.tree.string(a.name) == Some(name))
        });
        match (position, element_mut(&mut self.tree.nodes, path)) {
            (Some(i), Some(el)) => {
                el.remove_attribute(i);
                debug!("📝 Removed attribute {name}");
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum NewValue<'a> {
    String(&'a str),
    Int(u32),
    Bool(bool),
}

fn element_mut<'a>(nodes: &'a mut [XmlNode], path: &[usize]) -> Option<&'a mut Element> {
    let (first, rest) = path.split_first()?;
    let mut el = match nodes.get_mut(*first)? {
        XmlNode::Element(el) => el,
        _ => return None,
    };
    for i in rest {
        el = match el.children.get_mut(*i)? {
            XmlNode::Element(child) => child,
            _ => return None,
        };
    }
    Some(el)
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{FixtureElement, FixtureValue, ManifestFixture};
    use super::*;
    use crate::apk::defaults::BOOTSTRAP_CLASS;

    fn sample() -> ManifestEditor {
        ManifestEditor::parse(&ManifestFixture::sample().build()).unwrap()
    }

    fn reparse(editor: &ManifestEditor) -> ManifestEditor {
        ManifestEditor::parse(&editor.to_bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_queries() {
        let editor = sample();
        assert_eq!(editor.package_name().as_deref(), Some("com.example.app"));
        assert_eq!(editor.version_code(), Some(10));
        assert_eq!(editor.min_sdk_version(), Some(24));
        assert_eq!(editor.meta_data("existing.key").as_deref(), Some("existing"));
        assert_eq!(editor.meta_data_keys(), vec!["existing.key".to_string()]);
        assert_eq!(
            editor.application_attribute("label"),
            Some(AttrValue::String("Example".to_string()))
        );
    }

    #[test]
    fn test_set_entry_point_returns_previous() {
        let bytes = ManifestFixture::sample()
            .application_attr(
                "appComponentFactory",
                Some(ATTR_APP_COMPONENT_FACTORY),
                FixtureValue::str("androidx.core.app.CoreComponentFactory"),
            )
            .build();
        let mut editor = ManifestEditor::parse(&bytes).unwrap();
        let previous = editor.set_application_entry_point(BOOTSTRAP_CLASS).unwrap();
        assert_eq!(
            previous.as_deref(),
            Some("androidx.core.app.CoreComponentFactory")
        );

        let editor = reparse(&editor);
        assert_eq!(
            editor.application_attribute("appComponentFactory"),
            Some(AttrValue::String(BOOTSTRAP_CLASS.to_string()))
        );
        assert_eq!(editor.package_name().as_deref(), Some("com.example.app"));
    }

    #[test]
    fn test_entry_point_inserted_sorted_by_resource_id() {
        let mut editor = sample();
        assert_eq!(editor.set_application_entry_point(BOOTSTRAP_CLASS).unwrap(), None);
        editor.set_debuggable(true).unwrap();
        let editor = reparse(&editor);

        let app = editor.element(&editor.application_path().unwrap()).unwrap();
        let ids: Vec<u32> = app
            .attributes
            .iter()
            .map(|a| editor.tree.resource_id(a.name).unwrap())
            .collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert!(ids.contains(&ATTR_DEBUGGABLE));
        assert!(ids.contains(&ATTR_APP_COMPONENT_FACTORY));
        assert_eq!(editor.application_attribute("debuggable"), Some(AttrValue::Bool(true)));
    }

    #[test]
    fn test_mutations_are_idempotent() {
        let mut once = sample();
        once.set_application_entry_point(BOOTSTRAP_CLASS).unwrap();
        once.add_meta_data("lspatch", "config-a").unwrap();
        once.set_debuggable(true).unwrap();
        once.set_version_code(1).unwrap();
        let first = once.to_bytes().unwrap();

        let mut twice = ManifestEditor::parse(&first).unwrap();
        twice.set_application_entry_point(BOOTSTRAP_CLASS).unwrap();
        twice.add_meta_data("lspatch", "config-a").unwrap();
        twice.set_debuggable(true).unwrap();
        twice.set_version_code(1).unwrap();
        assert_eq!(twice.to_bytes().unwrap(), first);
    }

    #[test]
    fn test_add_meta_data_replaces_and_dedupes() {
        let bytes = ManifestFixture::sample()
            .application_child(FixtureElement::meta_data("lspatch", "old"))
            .application_child(FixtureElement::meta_data("lspatch", "older"))
            .build();
        let mut editor = ManifestEditor::parse(&bytes).unwrap();
        editor.add_meta_data("lspatch", "new").unwrap();

        let editor = reparse(&editor);
        let keys = editor.meta_data_keys();
        assert_eq!(keys.iter().filter(|k| *k == "lspatch").count(), 1);
        assert_eq!(editor.meta_data("lspatch").as_deref(), Some("new"));
        assert_eq!(editor.meta_data("existing.key").as_deref(), Some("existing"));
    }

    #[test]
    fn test_replacing_exclusive_value_does_not_grow_pool() {
        let mut editor = sample();
        editor.add_meta_data("lspatch", "value-1").unwrap();
        let editor = reparse(&editor);
        let pool_len = editor.tree.pool.len();

        let mut editor = editor;
        editor.add_meta_data("lspatch", "value-2").unwrap();
        assert_eq!(editor.tree.pool.len(), pool_len);
        assert_eq!(reparse(&editor).meta_data("lspatch").as_deref(), Some("value-2"));
    }

    #[test]
    fn test_bump_version_code() {
        let mut editor = sample();
        assert_eq!(editor.bump_version_code(5).unwrap(), 15);
        assert_eq!(reparse(&editor).version_code(), Some(15));
    }

    #[test]
    fn test_bump_version_code_uses_recorded_original() {
        let config = PatchConfig {
            original_version_code: 10,
            ..PatchConfig::default()
        };
        let mut editor = sample();
        editor.set_version_code(15).unwrap();
        editor
            .add_meta_data(MARKER_META_KEY, &config.to_marker().unwrap())
            .unwrap();
        assert_eq!(editor.bump_version_code(5).unwrap(), 15);
    }

    #[test]
    fn test_relaxations_follow_level() {
        let bytes = ManifestFixture::sample()
            .manifest_attr("isSplitRequired", Some(0x0101_0591), FixtureValue::Bool(true))
            .application_child(FixtureElement::meta_data("com.android.stamp.source", "play"))
            .application_child(FixtureElement::meta_data(
                "com.android.vending.splits.required",
                "true",
            ))
            .build();

        let mut l0 = ManifestEditor::parse(&bytes).unwrap();
        assert!(l0.relax_signature_constraint(BypassLevel::None).unwrap().is_empty());

        let mut l1 = ManifestEditor::parse(&bytes).unwrap();
        let applied_l1 = l1
            .relax_signature_constraint(BypassLevel::DisableCertPinChecks)
            .unwrap();
        assert_eq!(applied_l1, vec!["removed meta-data com.android.stamp.source"]);
        assert!(l1.meta_data("com.android.vending.splits.required").is_some());

        let mut l2 = ManifestEditor::parse(&bytes).unwrap();
        let applied_l2 = l2
            .relax_signature_constraint(BypassLevel::DisableAllVerification)
            .unwrap();
        assert!(applied_l1.iter().all(|m| applied_l2.contains(m)));
        assert!(applied_l2.len() > applied_l1.len());

        let l2 = reparse(&l2);
        assert!(l2.meta_data("com.android.vending.splits.required").is_none());
        let root = l2.element(&l2.manifest_path().unwrap()).unwrap();
        assert!(l2.attribute_by_name(root, "isSplitRequired").is_none());
        assert_eq!(l2.version_code(), Some(10));
    }

    #[test]
    fn test_missing_application_is_malformed() {
        let mut editor = sample();
        let root = editor.manifest_path().unwrap();
        let app = editor.application_path().unwrap();
        editor.remove_node(&app);
        assert_eq!(editor.child_path(&root, APPLICATION_TAG), None);
        assert!(matches!(
            editor.set_debuggable(true),
            Err(PatchError::MalformedManifest(_))
        ));
    }
}
