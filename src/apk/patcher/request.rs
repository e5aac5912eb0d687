//! Patch request and cooperative cancellation

use crate::apk::policy::BypassLevel;
use crate::apk::signing::{IdentitySource, Schemes};
use crate::exceptions::{PatchError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Immutable configuration of one invocation
#[derive(Debug, Clone)]
pub struct PatchRequest {
    inputs: Vec<PathBuf>,
    output_dir: PathBuf,
    debuggable: bool,
    bypass_level: BypassLevel,
    schemes: Schemes,
    use_manager: bool,
    override_version_code: bool,
    bump_version_code: Option<u32>,
    verbose: bool,
    modules: Vec<PathBuf>,
    force: bool,
    update_loader: bool,
    loader_dir: Option<PathBuf>,
    identity: Option<IdentitySource>,
}

impl PatchRequest {
    /// First input is the base archive, the rest are its splits
    pub fn builder(inputs: Vec<PathBuf>, output_dir: impl Into<PathBuf>) -> PatchRequestBuilder {
        PatchRequestBuilder {
            inputs,
            output_dir: output_dir.into(),
            ..PatchRequestBuilder::default()
        }
    }

    pub fn base(&self) -> &Path {
        &self.inputs[0]
    }

    pub fn splits(&self) -> &[PathBuf] {
        &self.inputs[1..]
    }

    pub fn inputs(&self) -> &[PathBuf] {
        &self.inputs
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn debuggable(&self) -> bool {
        self.debuggable
    }

    pub fn bypass_level(&self) -> BypassLevel {
        self.bypass_level
    }

    pub fn schemes(&self) -> Schemes {
        self.schemes
    }

    /// Loader-resident ("local") mode
    pub fn use_manager(&self) -> bool {
        self.use_manager
    }

    pub fn override_version_code(&self) -> bool {
        self.override_version_code
    }

    pub fn bump_version_code(&self) -> Option<u32> {
        self.bump_version_code
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn modules(&self) -> &[PathBuf] {
        &self.modules
    }

    pub fn force(&self) -> bool {
        self.force
    }

    /// Replace loader assets of an already patched input
    pub fn update_loader(&self) -> bool {
        self.update_loader
    }

    pub fn loader_dir(&self) -> Option<&Path> {
        self.loader_dir.as_deref()
    }

    pub fn identity(&self) -> Option<&IdentitySource> {
        self.identity.as_ref()
    }
}

/// Collects caller choices; [`PatchRequestBuilder::build`] validates them
#[derive(Debug, Default)]
pub struct PatchRequestBuilder {
    inputs: Vec<PathBuf>,
    output_dir: PathBuf,
    debuggable: bool,
    bypass_level: u8,
    v1: Option<bool>,
    v2: Option<bool>,
    v3: Option<bool>,
    use_manager: bool,
    override_version_code: bool,
    bump_version_code: Option<u32>,
    verbose: bool,
    modules: Vec<PathBuf>,
    force: bool,
    update_loader: bool,
    loader_dir: Option<PathBuf>,
    identity: Option<IdentitySource>,
}

impl PatchRequestBuilder {
    pub fn debuggable(mut self, debuggable: bool) -> Self {
        self.debuggable = debuggable;
        self
    }

    pub fn bypass_level(mut self, level: u8) -> Self {
        self.bypass_level = level;
        self
    }

    pub fn v1(mut self, enabled: bool) -> Self {
        self.v1 = Some(enabled);
        self
    }

    pub fn v2(mut self, enabled: bool) -> Self {
        self.v2 = Some(enabled);
        self
    }

    pub fn v3(mut self, enabled: bool) -> Self {
        self.v3 = Some(enabled);
        self
    }

    pub fn schemes(self, schemes: Schemes) -> Self {
        self.v1(schemes.v1).v2(schemes.v2).v3(schemes.v3)
    }

    pub fn use_manager(mut self, use_manager: bool) -> Self {
        self.use_manager = use_manager;
        self
    }

    pub fn override_version_code(mut self, override_version_code: bool) -> Self {
        self.override_version_code = override_version_code;
        self
    }

    pub fn bump_version_code(mut self, delta: u32) -> Self {
        self.bump_version_code = Some(delta);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn modules(mut self, modules: Vec<PathBuf>) -> Self {
        self.modules = modules;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn update_loader(mut self, update: bool) -> Self {
        self.update_loader = update;
        self
    }

    pub fn loader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.loader_dir = Some(dir.into());
        self
    }

    pub fn identity(mut self, source: IdentitySource) -> Self {
        self.identity = Some(source);
        self
    }

    pub fn build(self) -> Result<PatchRequest> {
        if self.inputs.is_empty() {
            return Err(PatchError::Generic("no input archives given".to_string()));
        }
        let bypass_level = BypassLevel::from_u8(self.bypass_level)?;

        let defaults = bypass_level.default_schemes();
        let schemes = Schemes {
            v1: self.v1.unwrap_or(defaults.v1),
            v2: self.v2.unwrap_or(defaults.v2),
            v3: self.v3.unwrap_or(defaults.v3),
        };
        schemes.validate()?;

        Ok(PatchRequest {
            inputs: self.inputs,
            output_dir: self.output_dir,
            debuggable: self.debuggable,
            bypass_level,
            schemes,
            use_manager: self.use_manager,
            override_version_code: self.override_version_code,
            bump_version_code: self.bump_version_code,
            verbose: self.verbose,
            modules: self.modules,
            force: self.force,
            update_loader: self.update_loader,
            loader_dir: self.loader_dir,
            identity: self.identity,
        })
    }
}

/// Shared flag checked between pipeline stages
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with `Cancelled` if cancellation was requested
    pub fn check(&self, before: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(PatchError::Cancelled(format!("cancelled before {before}")));
        }
        Ok(())
    }

    /// Cancel on SIGINT
    pub fn cancel_on_sigint(&self) -> Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.flag))?;
        Ok(())
    }
}
