//! High-level API for lspatch operations

use crate::apk::patcher::{self, CancellationToken, PatchRequest, PatchResult, Patcher};
use crate::apk::signing::IdentitySource;
use crate::exceptions::{PatchError, Result};
use crate::logger::LogListener;
use std::fmt;
use std::path::PathBuf;

pub use crate::apk::signing::{VerifyResult, verify_apk};

/// Hooks into a running pipeline
#[derive(Default)]
pub struct RunControl {
    /// Checked between pipeline stages
    pub cancellation: Option<CancellationToken>,
    /// Receives log records while the pipeline runs
    pub listener: Option<LogListener>,
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl")
            .field("cancellation", &self.cancellation)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Options for an update-loader run, whose request comes from the archive
#[derive(Debug, Default)]
pub struct PatchOptions {
    /// Directory receiving the outputs (current directory when unset)
    pub output_dir: Option<PathBuf>,
    /// Overwrite existing outputs
    pub force: bool,
    /// Keep debug records in the patch log
    pub verbose: bool,
    /// Directory holding the loader payload
    pub loader_dir: Option<PathBuf>,
    /// Signing identity; the managed default when unset
    pub identity: Option<IdentitySource>,
    pub control: RunControl,
}

fn patcher(request: PatchRequest, control: RunControl) -> Patcher {
    let mut patcher = Patcher::new(request);
    if let Some(token) = control.cancellation {
        patcher = patcher.with_cancellation(token);
    }
    if let Some(listener) = control.listener {
        patcher = patcher.with_listener(listener);
    }
    patcher
}

/// Patch the archives named by `request`
pub fn patch_apk(request: PatchRequest, control: RunControl) -> PatchResult {
    patcher(request, control).run()
}

/// Replace the loader of already patched archives
///
/// The request is rebuilt from the marker of the first archive, modules it
/// embeds are carried over.
pub fn update_loader(paths: &[PathBuf], options: PatchOptions) -> Result<PatchResult> {
    if paths.is_empty() {
        return Err(PatchError::Generic("no input archives given".to_string()));
    }
    let output_dir = options.output_dir.unwrap_or_default();
    let mut builder = patcher::update_request(paths.to_vec(), output_dir)?
        .force(options.force)
        .verbose(options.verbose);
    if let Some(dir) = options.loader_dir {
        builder = builder.loader_dir(dir);
    }
    if let Some(identity) = options.identity {
        builder = builder.identity(identity);
    }
    let request = builder.build()?;
    Ok(patcher(request, options.control).run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exceptions::ErrorKind;
    use crate::logger::{LogLevel, LogRecord};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_update_loader_requires_inputs() {
        assert!(update_loader(&[], PatchOptions::default()).is_err());
    }

    #[test]
    fn test_update_loader_rejects_unpatched_input() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("plain.apk");
        std::fs::write(&path, b"not a zip").unwrap();
        let err = update_loader(&[path], PatchOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CorruptArchive);
    }

    #[test]
    fn test_patch_apk_reports_to_listener() {
        let temp = tempfile::TempDir::new().unwrap();
        let request =
            PatchRequest::builder(vec![temp.path().join("absent.apk")], temp.path().join("out"))
                .build()
                .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let control = RunControl {
            cancellation: None,
            listener: Some(Box::new(move |record: &LogRecord| {
                sink.lock().unwrap().push(record.clone());
            })),
        };

        let failure = patch_apk(request, control).unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::IoFailure);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, failure.log);
        assert!(seen.iter().any(|r| r.level == LogLevel::Error));
    }
}
