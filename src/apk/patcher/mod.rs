//! Patch orchestrator
//!
//! One invocation walks `INIT → MANIFEST_PATCHED → ASSETS_INJECTED →
//! ARCHIVE_WRITTEN → SIGNED → DONE`; any error moves it to `FAILED` and the
//! failure records the stage it was in. Cancellation is observed only
//! between stages.

pub mod config;
pub mod request;

pub use config::{LspConfig, PatchConfig};
pub use request::{CancellationToken, PatchRequest, PatchRequestBuilder};

use crate::apk::axml::ManifestEditor;
use crate::apk::defaults::{
    MANIFEST_ENTRY, MARKER_META_KEY, ORIGIN_APK_ASSET, OUTPUT_SUFFIX, SOURCE_STAMP_ENTRY,
};
use crate::apk::injector::{LoaderInjector, LoaderPayload};
use crate::apk::modules::{self, ModuleOutcome};
use crate::apk::policy::Relaxation;
use crate::apk::signing::verifier::signing_certificate;
use crate::apk::signing::{IdentitySource, PendingOutput, SignatureEngine, SigningIdentity};
use crate::apk::zip::{Archive, ArchiveSet, Compression, StagedArchive};
use crate::exceptions::{ErrorKind, PatchError, Result};
use crate::logger::{LogListener, LogRecord, PatchLog};
use log::info;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Init,
    ManifestPatched,
    AssetsInjected,
    /// Layout fixed and v1 applied
    ArchiveWritten,
    Signed,
    Done,
    Failed,
}

impl PipelineStage {
    /// Successor on the happy path
    pub fn next(self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Init => Some(PipelineStage::ManifestPatched),
            PipelineStage::ManifestPatched => Some(PipelineStage::AssetsInjected),
            PipelineStage::AssetsInjected => Some(PipelineStage::ArchiveWritten),
            PipelineStage::ArchiveWritten => Some(PipelineStage::Signed),
            PipelineStage::Signed => Some(PipelineStage::Done),
            PipelineStage::Done | PipelineStage::Failed => None,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStage::Init => "INIT",
            PipelineStage::ManifestPatched => "MANIFEST_PATCHED",
            PipelineStage::AssetsInjected => "ASSETS_INJECTED",
            PipelineStage::ArchiveWritten => "ARCHIVE_WRITTEN",
            PipelineStage::Signed => "SIGNED",
            PipelineStage::Done => "DONE",
            PipelineStage::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Successful invocation
#[derive(Debug)]
pub struct PatchReport {
    pub output: PathBuf,
    pub split_outputs: Vec<PathBuf>,
    /// Human-readable list of applied mutations, in order
    pub mutations: Vec<String>,
    pub modules: Vec<ModuleOutcome>,
    /// Marker configuration stamped into the output
    pub config: PatchConfig,
    pub log: Vec<LogRecord>,
}

/// Failed invocation
#[derive(Debug)]
pub struct PatchFailure {
    /// Last stage reached before the error
    pub stage: PipelineStage,
    pub error: PatchError,
    pub log: Vec<LogRecord>,
}

impl PatchFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

impl fmt::Display for PatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} after {}: {}", self.kind(), self.stage, self.error)
    }
}

impl std::error::Error for PatchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type PatchResult = std::result::Result<PatchReport, PatchFailure>;

/// `<dir>/<stem>-lspatched.apk`; an input that is already patched keeps its
/// name instead of stacking suffixes
pub fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let base_suffix = OUTPUT_SUFFIX.trim_end_matches(".apk");
    let stem = stem.strip_suffix(base_suffix).unwrap_or(&stem);
    output_dir.join(format!("{stem}{OUTPUT_SUFFIX}"))
}

/// Builder for an update-loader run on an already patched archive
///
/// Debuggable flag, bypass level, schemes, loading mode and version override
/// come from the archive's marker.
pub fn update_request(
    inputs: Vec<PathBuf>,
    output_dir: impl Into<PathBuf>,
) -> Result<PatchRequestBuilder> {
    let base = inputs
        .first()
        .ok_or_else(|| PatchError::Generic("no input archives given".to_string()))?;
    let archive = Archive::open(base)?;
    let editor = ManifestEditor::parse(&archive.read_entry(MANIFEST_ENTRY)?)?;
    let marker = editor.meta_data(MARKER_META_KEY).ok_or_else(|| {
        PatchError::EntryNotFound(format!(
            "{}: no {MARKER_META_KEY} meta-data, not a patched archive",
            base.display()
        ))
    })?;
    let config = PatchConfig::from_marker(&marker)?;
    if config.is_outdated() {
        info!(
            "🔄 Updating loader {} -> {}",
            config.lsp_config.version_name,
            crate::version::VERSION
        );
    } else {
        info!("ℹ️ Loader {} is current, re-applying", config.lsp_config.version_name);
    }

    Ok(PatchRequest::builder(inputs, output_dir)
        .debuggable(config.debuggable)
        .bypass_level(config.sig_bypass_level.as_u8())
        .schemes(config.schemes())
        .use_manager(config.use_manager)
        .override_version_code(config.override_version_code)
        .update_loader(true))
}

/// Commit `pending` in order; if one fails, outputs already committed by this
/// call are removed again so no output of a failed run stays in place
fn commit_all(pending: Vec<PendingOutput>, log: &mut PatchLog) -> Result<()> {
    let mut committed: Vec<PathBuf> = Vec::with_capacity(pending.len());
    for output in pending {
        let path = output.path().to_path_buf();
        if let Err(error) = output.commit() {
            for done in &committed {
                match fs::remove_file(done) {
                    Ok(()) => log.info(format!("🗑️ Discarded {}", done.display())),
                    Err(e) => log.error(format!("❌ Could not discard {}: {e}", done.display())),
                }
            }
            return Err(error);
        }
        committed.push(path);
    }
    Ok(())
}

/// Mutable state of one run
struct Run {
    stage: PipelineStage,
    log: PatchLog,
    mutations: Vec<String>,
}

impl Run {
    fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            self.log.debug(format!("➡️ {} -> {}", self.stage, next));
            self.stage = next;
            self.log.set_stage(next);
        }
    }

    fn applied(&mut self, items: impl IntoIterator<Item = String>) {
        for item in items {
            self.log.debug(format!("✏️ {item}"));
            self.mutations.push(item);
        }
    }
}

struct Outcome {
    output: PathBuf,
    split_outputs: Vec<PathBuf>,
    modules: Vec<ModuleOutcome>,
    config: PatchConfig,
}

/// Runs one [`PatchRequest`]
pub struct Patcher {
    request: PatchRequest,
    payload: Option<LoaderPayload>,
    identity: Option<SigningIdentity>,
    token: CancellationToken,
    listener: Option<LogListener>,
}

impl fmt::Debug for Patcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patcher")
            .field("request", &self.request)
            .field("payload", &self.payload.is_some())
            .field("identity", &self.identity)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Patcher {
    pub fn new(request: PatchRequest) -> Self {
        Patcher {
            request,
            payload: None,
            identity: None,
            token: CancellationToken::new(),
            listener: None,
        }
    }

    /// Use this payload instead of reading the loader directory
    pub fn with_payload(mut self, payload: LoaderPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Use this identity instead of resolving the request's source
    pub fn with_identity(mut self, identity: SigningIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Receive log records as they are produced
    pub fn with_listener(mut self, listener: LogListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn run(mut self) -> PatchResult {
        let mut log = PatchLog::new(self.request.verbose());
        if let Some(listener) = self.listener.take() {
            log = log.with_listener(listener);
        }
        log.set_stage(PipelineStage::Init);
        let mut run = Run {
            stage: PipelineStage::Init,
            log,
            mutations: Vec::new(),
        };

        match self.execute(&mut run) {
            Ok(outcome) => Ok(PatchReport {
                output: outcome.output,
                split_outputs: outcome.split_outputs,
                mutations: run.mutations,
                modules: outcome.modules,
                config: outcome.config,
                log: run.log.into_records(),
            }),
            Err(error) => {
                let stage = run.stage;
                run.log.error(format!("❌ {} after {stage}: {error}", error.kind()));
                run.log.debug(format!("➡️ {stage} -> {}", PipelineStage::Failed));
                run.log.set_stage(PipelineStage::Failed);
                Err(PatchFailure {
                    stage,
                    error,
                    log: run.log.into_records(),
                })
            }
        }
    }

    fn resolve_identity(&self) -> Result<SigningIdentity> {
        if let Some(identity) = &self.identity {
            return Ok(identity.clone());
        }
        let source = match self.request.identity() {
            Some(source) => source.clone(),
            None => IdentitySource::ManagedDefault(IdentitySource::default_home()?),
        };
        source.resolve()
    }

    fn execute(&self, run: &mut Run) -> Result<Outcome> {
        let request = &self.request;
        let level = request.bypass_level();
        run.log.info(format!(
            "🚀 Patching {} (bypass level {level}, schemes {})",
            request.base().display(),
            request.schemes()
        ));

        // Phase 1: outputs, inputs, payload and identity
        fs::create_dir_all(request.output_dir())?;
        let outputs: Vec<PathBuf> = request
            .inputs()
            .iter()
            .map(|input| output_path(request.output_dir(), input))
            .collect();
        for path in &outputs {
            if path.exists() && !request.force() {
                return Err(PatchError::IoError(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!("{} exists, use --force to overwrite", path.display()),
                )));
            }
        }
        let (base, splits) = ArchiveSet::open(request.inputs())?.into_parts();
        let payload = match &self.payload {
            Some(payload) => payload.clone(),
            None => LoaderPayload::from_dir(&LoaderPayload::resolve_dir(request.loader_dir())?)?,
        };
        let engine = SignatureEngine::new(self.resolve_identity()?, request.schemes())?;
        self.token.check("manifest patching")?;

        // Phase 2: manifest
        let manifest_entry = base
            .entry(MANIFEST_ENTRY)
            .ok_or_else(|| PatchError::EntryNotFound(MANIFEST_ENTRY.to_string()))?;
        let manifest_compression = if manifest_entry.is_stored() {
            Compression::Stored
        } else {
            Compression::Deflated
        };
        let mut editor = ManifestEditor::parse(&manifest_entry.read()?)?;
        run.log.info(format!(
            "📄 {} versionCode {}",
            editor.package_name().unwrap_or_else(|| "<unknown package>".to_string()),
            editor
                .version_code()
                .map_or_else(|| "<none>".to_string(), |v| v.to_string())
        ));

        let mut staged = StagedArchive::from_archive(&base);
        let injector = LoaderInjector::new(&payload, request.update_loader());
        let plan = injector.plan(&staged, &editor, request.use_manager())?;
        let previous = plan.previous.as_ref();

        let original_version_code = previous
            .map(|p| p.original_version_code)
            .filter(|code| *code != 0)
            .or_else(|| editor.version_code())
            .unwrap_or(0);

        let original_signature = if level.applies(Relaxation::RecordOriginalSignature) {
            match previous.and_then(|p| p.original_signature.clone()) {
                Some(kept) => Some(kept),
                None => {
                    let cert = signing_certificate(&base)?.map(hex::encode);
                    match &cert {
                        Some(_) => run.applied(["recorded original signing certificate".to_string()]),
                        None => run.log.info("⚠️ Input is unsigned, no original signature to record"),
                    }
                    cert
                }
            }
        } else {
            None
        };

        if request.debuggable() {
            editor.set_debuggable(true)?;
            run.applied(["android:debuggable=true".to_string()]);
        } else if previous.is_some_and(|p| p.debuggable) {
            editor.set_debuggable(false)?;
            run.applied(["android:debuggable=false".to_string()]);
        }

        if request.override_version_code() {
            editor.set_version_code(1)?;
            run.applied(["versionCode -> 1".to_string()]);
        } else if let Some(delta) = request.bump_version_code() {
            let code = editor.bump_version_code(delta)?;
            run.applied([format!("versionCode -> {code}")]);
        }

        let relaxed = editor.relax_signature_constraint(level)?;
        run.applied(relaxed);

        let config = PatchConfig {
            use_manager: request.use_manager(),
            debuggable: request.debuggable(),
            override_version_code: request.override_version_code(),
            sig_bypass_level: level,
            v1: request.schemes().v1,
            v2: request.schemes().v2,
            v3: request.schemes().v3,
            original_version_code,
            original_signature,
            app_component_factory: plan.original_factory.clone(),
            bootstrap_dex: Some(plan.bootstrap_dex.clone()),
            lsp_config: LspConfig::current(),
        };
        let rewired = injector.rewire_manifest(&mut editor, &config)?;
        run.applied(rewired);
        staged.put(MANIFEST_ENTRY, &editor.to_bytes()?, manifest_compression)?;
        run.advance();
        self.token.check("asset injection")?;

        // Phase 3: loader assets, relaxation assets, modules
        let injected = injector.inject_assets(&mut staged, &plan, &config)?;
        run.applied(injected);
        if level.applies(Relaxation::StripSourceStamp) && staged.remove(SOURCE_STAMP_ENTRY) {
            run.applied([format!("removed {SOURCE_STAMP_ENTRY}")]);
        }
        if level.applies(Relaxation::EmbedOriginalArchive) {
            if !staged.contains(ORIGIN_APK_ASSET) {
                staged.put(ORIGIN_APK_ASSET, base.bytes(), Compression::Stored)?;
                run.applied([format!("embedded original archive as {ORIGIN_APK_ASSET}")]);
            }
        } else if staged.remove(ORIGIN_APK_ASSET) {
            run.applied([format!("removed {ORIGIN_APK_ASSET}")]);
        }

        let scratch = tempfile::TempDir::new()?;
        let mut module_paths = Vec::new();
        if request.update_loader() {
            module_paths.extend(modules::extract_embedded(&base, &mut staged, scratch.path())?);
        }
        module_paths.extend(request.modules().iter().cloned());
        let module_outcomes =
            modules::embed_modules(&mut staged, &module_paths, request.use_manager())?;
        for outcome in &module_outcomes {
            match outcome {
                ModuleOutcome::Rejected { .. } => run.log.error(format!("❌ {outcome}")),
                _ => run.log.info(format!("🧩 {outcome}")),
            }
        }
        run.advance();
        self.token.check("archive layout")?;

        // Phase 4: v1 and layout; splits only get re-signed
        let frozen = engine.freeze(staged)?;
        let frozen_splits = splits
            .iter()
            .map(|split| engine.freeze(StagedArchive::from_archive(split)))
            .collect::<Result<Vec<_>>>()?;
        run.advance();
        self.token.check("signing")?;

        // Phase 5: signing block
        let signed = engine.seal(frozen)?;
        let signed_splits = frozen_splits
            .into_iter()
            .map(|frozen| engine.seal(frozen))
            .collect::<Result<Vec<_>>>()?;
        run.advance();
        self.token.check("writing output")?;

        // Phase 6: every output staged before any is committed
        let (output, split_outputs) = outputs
            .split_first()
            .ok_or_else(|| PatchError::Generic("no output paths".to_string()))?;
        let pending = std::iter::once((&signed, output))
            .chain(signed_splits.iter().zip(split_outputs))
            .map(|(archive, path)| archive.stage(path))
            .collect::<Result<Vec<_>>>()?;
        commit_all(pending, &mut run.log)?;
        run.advance();
        run.log.info(format!("✅ Done. Output: {}", output.display()));

        Ok(Outcome {
            output: output.clone(),
            split_outputs: split_outputs.to_vec(),
            modules: module_outcomes,
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::axml::AttrValue;
    use crate::apk::axml::testutil::{FixtureElement, FixtureValue, ManifestFixture};
    use crate::apk::constants::ATTR_IS_SPLIT_REQUIRED;
    use crate::apk::defaults::BOOTSTRAP_CLASS;
    use crate::apk::policy::BypassLevel;
    use crate::apk::signing::identity::tests::test_identity;
    use crate::apk::signing::{SchemeStatus, Schemes, verify_apk};
    use crate::logger::LogLevel;
    use crate::version::VERSION;
    use std::io::{Read, Write};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use zip::CompressionMethod;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, Vec<u8>, CompressionMethod)]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, data, method) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default().compression_method(*method))
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn read_zip(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut zip = zip::ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        (0..zip.len())
            .map(|i| {
                let mut f = zip.by_index(i).unwrap();
                let mut data = Vec::new();
                f.read_to_end(&mut data).unwrap();
                (f.name().to_string(), data)
            })
            .collect()
    }

    fn base_entries(manifest: Vec<u8>) -> Vec<(&'static str, Vec<u8>, CompressionMethod)> {
        vec![
            ("AndroidManifest.xml", manifest, CompressionMethod::Deflated),
            ("classes.dex", b"dex\n035\0app".to_vec(), CompressionMethod::Deflated),
            ("resources.arsc", vec![7u8; 301], CompressionMethod::Stored),
            ("res/raw/data.bin", vec![1u8; 10_000], CompressionMethod::Deflated),
            ("lib/arm64-v8a/libapp.so", vec![0x7f; 999], CompressionMethod::Stored),
        ]
    }

    struct Fixture {
        temp: TempDir,
        base: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_manifest(ManifestFixture::sample().build())
        }

        fn with_manifest(manifest: Vec<u8>) -> Self {
            let temp = TempDir::new().unwrap();
            let base = temp.path().join("app.apk");
            write_zip(&base, &base_entries(manifest));
            Fixture { temp, base }
        }

        fn out_dir(&self) -> PathBuf {
            self.temp.path().join("out")
        }

        fn builder(&self) -> PatchRequestBuilder {
            PatchRequest::builder(vec![self.base.clone()], self.out_dir())
        }
    }

    fn payload() -> LoaderPayload {
        LoaderPayload::new(b"dex\n035\0loader".to_vec(), b"dex\n035\0boot".to_vec())
            .with_native_lib("arm64-v8a", b"\x7fELF loader".to_vec())
            .unwrap()
    }

    fn patch(request: PatchRequest) -> PatchResult {
        Patcher::new(request)
            .with_payload(payload())
            .with_identity(test_identity())
            .run()
    }

    fn manifest_of(path: &Path) -> ManifestEditor {
        let archive = Archive::open(path).unwrap();
        ManifestEditor::parse(&archive.read_entry(MANIFEST_ENTRY).unwrap()).unwrap()
    }

    fn marker_of(path: &Path) -> PatchConfig {
        PatchConfig::from_marker(&manifest_of(path).meta_data(MARKER_META_KEY).unwrap()).unwrap()
    }

    #[test]
    fn test_stage_sequence() {
        let mut stage = PipelineStage::Init;
        let mut seen = vec![stage.to_string()];
        while let Some(next) = stage.next() {
            stage = next;
            seen.push(stage.to_string());
        }
        assert_eq!(
            seen,
            vec!["INIT", "MANIFEST_PATCHED", "ASSETS_INJECTED", "ARCHIVE_WRITTEN", "SIGNED", "DONE"]
        );
        assert_eq!(PipelineStage::Failed.next(), None);
    }

    #[test]
    fn test_output_naming() {
        let dir = Path::new("/out");
        assert_eq!(
            output_path(dir, Path::new("/in/app.apk")),
            PathBuf::from("/out/app-lspatched.apk")
        );
        assert_eq!(
            output_path(dir, Path::new("/in/app-lspatched.apk")),
            PathBuf::from("/out/app-lspatched.apk")
        );
    }

    #[test]
    fn test_level_one_v1_v2_scenario() {
        let fixture = Fixture::new();
        let request = fixture.builder().bypass_level(1).v3(false).build().unwrap();
        let report = patch(request).unwrap();

        let editor = manifest_of(&report.output);
        assert_eq!(
            editor.application_attribute("appComponentFactory"),
            Some(AttrValue::String(BOOTSTRAP_CLASS.to_string()))
        );
        assert_eq!(editor.version_code(), Some(10));

        let marker = marker_of(&report.output);
        assert_eq!(marker.sig_bypass_level, BypassLevel::DisableCertPinChecks);
        assert_eq!(marker.lsp_config.version_name, VERSION);
        assert_eq!(marker.original_version_code, 10);
        assert!(marker.v1 && marker.v2 && !marker.v3);
        assert_eq!(marker, report.config);

        let verified = verify_apk(&report.output).unwrap();
        assert_eq!(verified.v1, SchemeStatus::Valid);
        assert_eq!(verified.v2, SchemeStatus::Valid);
        assert_eq!(verified.v3, SchemeStatus::Absent);
        assert_eq!(verified.signer_sha256, Some(test_identity().fingerprint()));
    }

    #[test]
    fn test_untouched_entries_survive_byte_for_byte() {
        let fixture = Fixture::new();
        let report = patch(fixture.builder().build().unwrap()).unwrap();

        let output: std::collections::HashMap<_, _> =
            read_zip(&report.output).into_iter().collect();
        for (name, data) in read_zip(&fixture.base) {
            if name == MANIFEST_ENTRY {
                continue;
            }
            assert_eq!(output.get(&name), Some(&data), "{name} changed");
        }
        assert!(output.contains_key("assets/lspatch/loader.dex"));
        assert!(output.contains_key("classes2.dex"));

        let verified = verify_apk(&report.output).unwrap();
        assert!(verified.v1.is_valid() && verified.v2.is_valid() && verified.v3.is_valid());
    }

    #[test]
    fn test_update_loader_replaces_marker() {
        let fixture = Fixture::new();
        let first = patch(fixture.builder().bypass_level(1).build().unwrap()).unwrap();

        let second_dir = fixture.temp.path().join("second");
        let request = update_request(vec![first.output.clone()], &second_dir)
            .unwrap()
            .debuggable(true)
            .build()
            .unwrap();
        assert!(request.update_loader());
        assert_eq!(request.bypass_level(), BypassLevel::DisableCertPinChecks);
        let second = patch(request).unwrap();
        assert_eq!(second.output, second_dir.join("app-lspatched.apk"));

        let editor = manifest_of(&second.output);
        let markers = editor
            .meta_data_keys()
            .into_iter()
            .filter(|k| k == MARKER_META_KEY)
            .count();
        assert_eq!(markers, 1);
        let marker = marker_of(&second.output);
        assert!(marker.debuggable);
        assert_eq!(marker.bootstrap_dex.as_deref(), Some("classes2.dex"));
        assert_eq!(marker.original_version_code, 10);
        assert!(!Archive::open(&second.output).unwrap().contains("classes3.dex"));
        assert!(verify_apk(&second.output).unwrap().is_verified());
    }

    #[test]
    fn test_patching_patched_output_without_update_conflicts() {
        let fixture = Fixture::new();
        let first = patch(fixture.builder().build().unwrap()).unwrap();
        let again = PatchRequest::builder(vec![first.output], fixture.temp.path().join("again"))
            .build()
            .unwrap();
        let failure = patch(again).unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::LoaderAssetConflict);
        assert_eq!(failure.stage, PipelineStage::Init);
        assert!(failure.log.iter().any(|r| r.level == LogLevel::Error));
    }

    #[test]
    fn test_level_two_embeds_original_and_relaxes_more() {
        let manifest = ManifestFixture::sample()
            .manifest_attr("isSplitRequired", Some(ATTR_IS_SPLIT_REQUIRED), FixtureValue::Bool(true))
            .application_child(FixtureElement::meta_data("com.android.stamp.source", "play"))
            .build();
        let fixture = Fixture::with_manifest(manifest);

        let l1 = patch(fixture.builder().bypass_level(1).build().unwrap()).unwrap();
        let l2 = patch(fixture.builder().bypass_level(2).force(true).build().unwrap()).unwrap();

        let relaxed = |m: &[String]| -> Vec<String> {
            m.iter()
                .filter(|s| s.contains("stamp") || s.contains("split") || s.contains("original"))
                .cloned()
                .collect()
        };
        let l1_relaxed = relaxed(&l1.mutations);
        let l2_relaxed = relaxed(&l2.mutations);
        assert!(l1_relaxed.iter().all(|m| l2_relaxed.contains(m)));
        assert!(l2_relaxed.len() > l1_relaxed.len());

        let mut zip = zip::ZipArchive::new(fs::File::open(&l2.output).unwrap()).unwrap();
        let mut origin = zip.by_name(ORIGIN_APK_ASSET).unwrap();
        assert_eq!(origin.compression(), CompressionMethod::Stored);
        assert_eq!(origin.data_start() % 4096, 0);
        let mut embedded = Vec::new();
        origin.read_to_end(&mut embedded).unwrap();
        assert_eq!(embedded, fs::read(&fixture.base).unwrap());

        let verified = verify_apk(&l2.output).unwrap();
        assert_eq!(verified.v1, SchemeStatus::Absent);
        assert_eq!(verified.v2, SchemeStatus::Valid);
        let editor = manifest_of(&l2.output);
        assert_eq!(editor.meta_data("com.android.stamp.source"), None);
    }

    #[test]
    fn test_records_original_signature_of_signed_input() {
        let fixture = Fixture::new();
        let first = patch(fixture.builder().build().unwrap()).unwrap();
        assert_eq!(first.config.original_signature, None);

        let temp = TempDir::new().unwrap();
        let signed_input = temp.path().join("signed.apk");
        fs::copy(&first.output, &signed_input).unwrap();
        let request = update_request(vec![signed_input], temp.path().join("out"))
            .unwrap()
            .bypass_level(1)
            .build()
            .unwrap();
        let report = patch(request).unwrap();
        assert_eq!(
            report.config.original_signature,
            Some(hex::encode(test_identity().certificate_der()))
        );
    }

    #[test]
    fn test_existing_output_needs_force() {
        let fixture = Fixture::new();
        patch(fixture.builder().build().unwrap()).unwrap();
        let failure = patch(fixture.builder().build().unwrap()).unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::IoFailure);
        assert!(patch(fixture.builder().force(true).build().unwrap()).is_ok());
    }

    #[test]
    fn test_cancelled_run_writes_nothing() {
        let fixture = Fixture::new();
        let token = CancellationToken::new();
        token.cancel();
        let failure = Patcher::new(fixture.builder().build().unwrap())
            .with_payload(payload())
            .with_identity(test_identity())
            .with_cancellation(token)
            .run()
            .unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::Cancelled);
        assert_eq!(failure.stage, PipelineStage::Init);
        assert!(!fixture.out_dir().join("app-lspatched.apk").exists());
    }

    #[test]
    fn test_splits_are_only_resigned() {
        let fixture = Fixture::new();
        let split = fixture.temp.path().join("split_config.arm64_v8a.apk");
        write_zip(
            &split,
            &[("lib/arm64-v8a/libsplit.so", vec![5u8; 123], CompressionMethod::Stored)],
        );
        let request = PatchRequest::builder(vec![fixture.base.clone(), split], fixture.out_dir())
            .build()
            .unwrap();
        let report = patch(request).unwrap();

        assert_eq!(report.split_outputs.len(), 1);
        let split_out = &report.split_outputs[0];
        let entries = read_zip(split_out);
        assert!(entries.iter().all(|(name, _)| !name.starts_with("assets/lspatch/")));
        assert!(entries.iter().any(|(name, _)| name == "lib/arm64-v8a/libsplit.so"));
        let verified = verify_apk(split_out).unwrap();
        assert!(verified.is_verified());
        assert_eq!(
            verified.signer_sha256,
            verify_apk(&report.output).unwrap().signer_sha256
        );
    }

    #[test]
    fn test_failed_split_write_discards_base_output() {
        let fixture = Fixture::new();
        let split = fixture.temp.path().join("split_config.en.apk");
        write_zip(&split, &[("res/values/strings.bin", vec![2u8; 64], CompressionMethod::Stored)]);

        // A previous good output is replaced, and the split's target is a
        // directory that cannot be renamed over
        let out = fixture.out_dir();
        fs::create_dir_all(out.join("split_config.en-lspatched.apk")).unwrap();
        fs::write(out.join("split_config.en-lspatched.apk").join("keep"), b"x").unwrap();
        fs::write(out.join("app-lspatched.apk"), b"previous").unwrap();

        let request = PatchRequest::builder(vec![fixture.base.clone(), split], &out)
            .force(true)
            .build()
            .unwrap();
        let failure = patch(request).unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::IoFailure);
        assert_eq!(failure.stage, PipelineStage::Signed);
        assert!(!out.join("app-lspatched.apk").exists());

        let mut left: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["split_config.en-lspatched.apk".to_string()]);
    }

    #[test]
    fn test_missing_identity_file_fails_before_patching() {
        let fixture = Fixture::new();
        let missing = fixture.temp.path().join("missing.pem");
        let request = fixture
            .builder()
            .identity(IdentitySource::Pem(missing))
            .build()
            .unwrap();
        let failure = Patcher::new(request).with_payload(payload()).run().unwrap_err();
        assert_eq!(failure.error.kind(), ErrorKind::SigningIdentityUnavailable);
        assert_eq!(failure.stage, PipelineStage::Init);
        assert!(!fixture.out_dir().join("app-lspatched.apk").exists());
    }

    #[test]
    fn test_modules_partial_failure_and_collision() {
        let fixture = Fixture::new();
        let module_manifest = ManifestFixture::sample()
            .application_child(FixtureElement::meta_data("xposedminversion", "93"))
            .build();
        let mut modules = Vec::new();
        for sub in ["a", "b"] {
            let dir = fixture.temp.path().join(sub);
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join("module.apk");
            write_zip(
                &path,
                &[("AndroidManifest.xml", module_manifest.clone(), CompressionMethod::Deflated)],
            );
            modules.push(path);
        }
        let bogus = fixture.temp.path().join("bogus.apk");
        write_zip(&bogus, &[("readme.txt", b"hi".to_vec(), CompressionMethod::Stored)]);
        modules.push(bogus);

        let report = patch(fixture.builder().modules(modules).build().unwrap()).unwrap();
        assert_eq!(report.modules.iter().filter(|m| m.is_embedded()).count(), 2);
        assert!(matches!(report.modules[2], ModuleOutcome::Rejected { .. }));
        let archive = Archive::open(&report.output).unwrap();
        assert!(archive.contains("assets/lspatch/modules/module.apk"));
        assert!(archive.contains("assets/lspatch/modules/module-1.apk"));

        // Embedded modules come along on update
        let request = update_request(vec![report.output.clone()], fixture.temp.path().join("u"))
            .unwrap()
            .build()
            .unwrap();
        let updated = patch(request).unwrap();
        assert_eq!(updated.modules.iter().filter(|m| m.is_embedded()).count(), 2);
    }

    #[test]
    fn test_listener_sees_progress() {
        let fixture = Fixture::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let report = Patcher::new(fixture.builder().verbose(true).build().unwrap())
            .with_payload(payload())
            .with_identity(test_identity())
            .with_listener(Box::new(move |record: &LogRecord| {
                sink.lock().unwrap().push(record.clone());
            }))
            .run()
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, report.log);
        assert!(seen.iter().any(|r| r.message.contains("SIGNED -> DONE")));
        assert!(seen.iter().any(|r| r.level == LogLevel::Debug));
    }

    #[test]
    fn test_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("nomanifest.apk");
        write_zip(&base, &[("classes.dex", b"dex".to_vec(), CompressionMethod::Stored)]);
        let request = PatchRequest::builder(vec![base], temp.path().join("out"))
            .schemes(Schemes::ALL)
            .build()
            .unwrap();
        let failure = patch(request).unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::EntryNotFound);
    }
}
