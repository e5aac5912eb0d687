//! Loader injection
//!
//! Copies the loader payload into the reserved asset tree, adds the
//! bootstrap dex and points `appComponentFactory` at the bootstrap class.

use crate::apk::axml::{AttrValue, ManifestEditor};
use crate::apk::defaults::{
    ASSET_ROOT, BOOTSTRAP_CLASS, CONFIG_ASSET, LOADER_DEX_ASSET, LOADER_DIR_ENV, MARKER_META_KEY,
    NATIVE_LIB_ASSET_DIR, NATIVE_LIB_NAME, PAYLOAD_BOOTSTRAP_DEX, PAYLOAD_LOADER_DEX,
    PAYLOAD_NATIVE_DIR, SUPPORTED_ABIS,
};
use crate::apk::patcher::config::PatchConfig;
use crate::apk::zip::{Compression, StagedArchive};
use crate::exceptions::{PatchError, Result};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Loader files shipped with the engine
#[derive(Debug, Clone)]
pub struct LoaderPayload {
    loader_dex: Vec<u8>,
    bootstrap_dex: Vec<u8>,
    /// abi -> library
    native_libs: BTreeMap<String, Vec<u8>>,
}

impl LoaderPayload {
    /// Directory given explicitly, else `LSPATCH_LOADER_DIR`
    pub fn resolve_dir(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = explicit {
            return Ok(dir.to_path_buf());
        }
        env::var_os(LOADER_DIR_ENV)
            .map(PathBuf::from)
            .ok_or_else(|| {
                PatchError::Generic(format!(
                    "no loader directory given and {LOADER_DIR_ENV} is not set"
                ))
            })
    }

    /// Read `loader.dex`, `metaloader.dex` and `so/<abi>/liblspatch.so`
    pub fn from_dir(dir: &Path) -> Result<Self> {
        debug!("📂 Loading loader payload from {}", dir.display());
        let read = |name: &str| {
            let path = dir.join(name);
            fs::read(&path).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    PatchError::EntryNotFound(format!("loader payload {}", path.display()))
                }
                _ => PatchError::IoError(e),
            })
        };
        let loader_dex = read(PAYLOAD_LOADER_DEX)?;
        let bootstrap_dex = read(PAYLOAD_BOOTSTRAP_DEX)?;

        let mut native_libs = BTreeMap::new();
        for abi in SUPPORTED_ABIS {
            let path = dir.join(PAYLOAD_NATIVE_DIR).join(abi).join(NATIVE_LIB_NAME);
            if path.is_file() {
                native_libs.insert(abi.to_string(), fs::read(&path)?);
            }
        }
        debug!(
            "📦 Loader payload: {} + {} bytes dex, native for [{}]",
            loader_dex.len(),
            bootstrap_dex.len(),
            native_libs.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(LoaderPayload {
            loader_dex,
            bootstrap_dex,
            native_libs,
        })
    }

    pub fn new(loader_dex: Vec<u8>, bootstrap_dex: Vec<u8>) -> Self {
        LoaderPayload {
            loader_dex,
            bootstrap_dex,
            native_libs: BTreeMap::new(),
        }
    }

    /// Add a native library; unsupported ABIs are rejected
    pub fn with_native_lib(mut self, abi: &str, library: Vec<u8>) -> Result<Self> {
        if !SUPPORTED_ABIS.contains(&abi) {
            return Err(PatchError::Generic(format!("unsupported ABI {abi}")));
        }
        self.native_libs.insert(abi.to_string(), library);
        Ok(self)
    }

    pub fn abis(&self) -> impl Iterator<Item = &str> {
        self.native_libs.keys().map(String::as_str)
    }
}

/// What the injector learned from the input before touching it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPlan {
    /// Marker of a previous patch run
    pub previous: Option<PatchConfig>,
    /// `appComponentFactory` of the unpatched app
    pub original_factory: Option<String>,
    /// Entry name for the bootstrap dex
    pub bootstrap_dex: String,
}

#[derive(Debug)]
pub struct LoaderInjector<'a> {
    payload: &'a LoaderPayload,
    update: bool,
}

fn native_lib_asset(abi: &str) -> String {
    format!("{NATIVE_LIB_ASSET_DIR}{abi}/{NATIVE_LIB_NAME}")
}

fn dex_name(index: usize) -> String {
    if index <= 1 {
        "classes.dex".to_string()
    } else {
        format!("classes{index}.dex")
    }
}

impl<'a> LoaderInjector<'a> {
    /// `update` permits replacing loader assets already present
    pub fn new(payload: &'a LoaderPayload, update: bool) -> Self {
        LoaderInjector { payload, update }
    }

    /// Check the input for conflicts and decide names
    pub fn plan(
        &self,
        staged: &StagedArchive,
        editor: &ManifestEditor,
        use_manager: bool,
    ) -> Result<InjectionPlan> {
        let previous = match editor.meta_data(MARKER_META_KEY) {
            Some(marker) => Some(PatchConfig::from_marker(&marker)?),
            None => None,
        };

        let reserved: Vec<&str> = staged.names().filter(|n| n.starts_with(ASSET_ROOT)).collect();
        if !self.update {
            if previous.is_some() {
                return Err(PatchError::LoaderAssetConflict(
                    "archive is already patched; update the loader instead".to_string(),
                ));
            }
            if let Some(name) = reserved.first() {
                return Err(PatchError::LoaderAssetConflict(format!(
                    "reserved asset {name} already exists"
                )));
            }
        }
        if let Some(prev) = &previous {
            if prev.use_manager != use_manager {
                let mode = |local: bool| if local { "local" } else { "portable" };
                return Err(PatchError::LoaderAssetConflict(format!(
                    "archive was patched in {} mode, {} requested",
                    mode(prev.use_manager),
                    mode(use_manager)
                )));
            }
        }

        let original_factory = match &previous {
            Some(prev) => prev.app_component_factory.clone(),
            None => match editor.application_attribute("appComponentFactory") {
                Some(AttrValue::String(class)) if class != BOOTSTRAP_CLASS => Some(class),
                _ => None,
            },
        };

        let bootstrap_dex = match previous.as_ref().and_then(|p| p.bootstrap_dex.clone()) {
            Some(name) => name,
            None => (1..)
                .map(dex_name)
                .find(|name| !staged.contains(name))
                .unwrap_or_else(|| dex_name(1)),
        };

        debug!(
            "🧭 Injection plan: bootstrap={}, original factory={:?}, previous marker={}",
            bootstrap_dex,
            original_factory,
            previous.is_some()
        );
        Ok(InjectionPlan {
            previous,
            original_factory,
            bootstrap_dex,
        })
    }

    /// Point the app at the bootstrap class and write the marker meta-data
    pub fn rewire_manifest(
        &self,
        editor: &mut ManifestEditor,
        config: &PatchConfig,
    ) -> Result<Vec<String>> {
        let mut applied = Vec::new();
        let previous = editor.set_application_entry_point(BOOTSTRAP_CLASS)?;
        if previous.as_deref() != Some(BOOTSTRAP_CLASS) {
            applied.push(format!(
                "appComponentFactory: {} -> {BOOTSTRAP_CLASS}",
                previous.as_deref().unwrap_or("<none>")
            ));
        }
        editor.add_meta_data(MARKER_META_KEY, &config.to_marker()?)?;
        applied.push(format!(
            "meta-data {MARKER_META_KEY}: bypass level {}, schemes {}, engine {}",
            config.sig_bypass_level,
            config.schemes(),
            config.lsp_config.version_name
        ));
        Ok(applied)
    }

    /// Write the loader dex, native libraries, bootstrap dex and config asset
    pub fn inject_assets(
        &self,
        staged: &mut StagedArchive,
        plan: &InjectionPlan,
        config: &PatchConfig,
    ) -> Result<Vec<String>> {
        let mut applied = Vec::new();

        let stale = staged.retain(|e| {
            !(e.name.starts_with(NATIVE_LIB_ASSET_DIR) || e.name == LOADER_DEX_ASSET)
        });
        if !stale.is_empty() {
            debug!("🗑️ Replacing {} previous loader assets", stale.len());
        }
        if let Some(old) = plan
            .previous
            .as_ref()
            .and_then(|p| p.bootstrap_dex.as_deref())
            .filter(|old| *old != plan.bootstrap_dex)
        {
            staged.remove(old);
        }

        staged.put(LOADER_DEX_ASSET, &self.payload.loader_dex, Compression::Deflated)?;
        applied.push(format!("added {LOADER_DEX_ASSET}"));

        if self.payload.native_libs.is_empty() {
            warn!("⚠️ Loader payload carries no native libraries");
        }
        for (abi, library) in &self.payload.native_libs {
            let name = native_lib_asset(abi);
            staged.put(&name, library, Compression::Stored)?;
            applied.push(format!("added {name}"));
        }

        staged.put(&plan.bootstrap_dex, &self.payload.bootstrap_dex, Compression::Deflated)?;
        applied.push(format!("added bootstrap {}", plan.bootstrap_dex));

        staged.put(CONFIG_ASSET, &config.to_json()?, Compression::Deflated)?;
        applied.push(format!("added {CONFIG_ASSET}"));

        info!(
            "💉 Injected loader ({} native libraries, bootstrap {})",
            self.payload.native_libs.len(),
            plan.bootstrap_dex
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::axml::testutil::ManifestFixture;
    use crate::apk::defaults::MANIFEST_ENTRY;
    use tempfile::TempDir;

    fn payload() -> LoaderPayload {
        LoaderPayload::new(b"loader".to_vec(), b"bootstrap".to_vec())
            .with_native_lib("arm64-v8a", b"\x7fELF arm64".to_vec())
            .unwrap()
    }

    fn input() -> (StagedArchive, ManifestEditor) {
        let manifest = ManifestFixture::sample().build();
        let mut staged = StagedArchive::new();
        staged.put(MANIFEST_ENTRY, &manifest, Compression::Deflated).unwrap();
        staged.put("classes.dex", b"app code", Compression::Deflated).unwrap();
        (staged, ManifestEditor::parse(&manifest).unwrap())
    }

    fn run(
        staged: &mut StagedArchive,
        editor: &mut ManifestEditor,
        payload: &LoaderPayload,
        update: bool,
    ) -> Result<InjectionPlan> {
        let injector = LoaderInjector::new(payload, update);
        let plan = injector.plan(staged, editor, false)?;
        let config = PatchConfig {
            app_component_factory: plan.original_factory.clone(),
            bootstrap_dex: Some(plan.bootstrap_dex.clone()),
            ..PatchConfig::default()
        };
        injector.rewire_manifest(editor, &config)?;
        injector.inject_assets(staged, &plan, &config)?;
        staged.put(MANIFEST_ENTRY, &editor.to_bytes()?, Compression::Deflated)?;
        Ok(plan)
    }

    #[test]
    fn test_payload_from_dir() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("loader.dex"), b"L").unwrap();
        fs::write(temp.path().join("metaloader.dex"), b"M").unwrap();
        let abi_dir = temp.path().join("so").join("x86_64");
        fs::create_dir_all(&abi_dir).unwrap();
        fs::write(abi_dir.join("liblspatch.so"), b"SO").unwrap();

        let payload = LoaderPayload::from_dir(temp.path()).unwrap();
        assert_eq!(payload.abis().collect::<Vec<_>>(), vec!["x86_64"]);

        fs::remove_file(temp.path().join("metaloader.dex")).unwrap();
        assert!(matches!(
            LoaderPayload::from_dir(temp.path()),
            Err(PatchError::EntryNotFound(_))
        ));
    }

    #[test]
    fn test_injects_assets_and_rewires_entry_point() {
        let (mut staged, mut editor) = input();
        let plan = run(&mut staged, &mut editor, &payload(), false).unwrap();

        assert_eq!(plan.bootstrap_dex, "classes2.dex");
        assert_eq!(plan.original_factory, None);
        assert_eq!(staged.read_entry("assets/lspatch/loader.dex").unwrap(), b"loader");
        assert_eq!(staged.read_entry("classes2.dex").unwrap(), b"bootstrap");
        assert!(staged.entry("assets/lspatch/so/arm64-v8a/liblspatch.so").unwrap().is_stored());
        assert!(staged.contains("assets/lspatch/config.json"));
        assert_eq!(
            editor.application_attribute("appComponentFactory"),
            Some(AttrValue::String(BOOTSTRAP_CLASS.to_string()))
        );
        let marker = PatchConfig::from_marker(&editor.meta_data("lspatch").unwrap()).unwrap();
        assert_eq!(marker.bootstrap_dex.as_deref(), Some("classes2.dex"));
    }

    #[test]
    fn test_second_run_needs_update_intent() {
        let (mut staged, mut editor) = input();
        run(&mut staged, &mut editor, &payload(), false).unwrap();
        let err = run(&mut staged, &mut editor, &payload(), false).unwrap_err();
        assert!(matches!(err, PatchError::LoaderAssetConflict(_)));
    }

    #[test]
    fn test_update_reuses_bootstrap_slot() {
        let (mut staged, mut editor) = input();
        run(&mut staged, &mut editor, &payload(), false).unwrap();
        let newer = LoaderPayload::new(b"loader v2".to_vec(), b"bootstrap v2".to_vec());
        let plan = run(&mut staged, &mut editor, &newer, true).unwrap();

        assert_eq!(plan.bootstrap_dex, "classes2.dex");
        assert!(!staged.contains("classes3.dex"));
        assert_eq!(staged.read_entry("classes2.dex").unwrap(), b"bootstrap v2");
        assert!(!staged.contains("assets/lspatch/so/arm64-v8a/liblspatch.so"));
        assert_eq!(
            editor
                .meta_data_keys()
                .iter()
                .filter(|k| k.as_str() == "lspatch")
                .count(),
            1
        );
    }

    #[test]
    fn test_mode_mismatch_is_a_conflict() {
        let (mut staged, mut editor) = input();
        run(&mut staged, &mut editor, &payload(), false).unwrap();
        let payload = payload();
        let injector = LoaderInjector::new(&payload, true);
        assert!(matches!(
            injector.plan(&staged, &editor, true),
            Err(PatchError::LoaderAssetConflict(_))
        ));
    }

    #[test]
    fn test_stray_reserved_asset_is_a_conflict() {
        let (mut staged, editor) = input();
        staged.put("assets/lspatch/loader.dex", b"foreign", Compression::Stored).unwrap();
        let payload = payload();
        let err = LoaderInjector::new(&payload, false)
            .plan(&staged, &editor, false)
            .unwrap_err();
        assert!(matches!(err, PatchError::LoaderAssetConflict(_)));
    }
}
