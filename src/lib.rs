//! LSPatch - rootless APK patch engine
//!
//! This crate rewrites an Android application archive so that it loads the
//! LSPatch loader at startup: the binary manifest is edited, loader assets and
//! optional Xposed modules are injected, and the result is re-signed with APK
//! signature schemes v1, v2 and v3.

// Enforce strict code quality and reliability
#![deny(
    // Safety
    unsafe_code,

    // Correctness
    missing_debug_implementations,
    unreachable_pub,

    // Future compatibility
    future_incompatible,

    // Rust 2018 idioms
    rust_2018_idioms,

    // All warnings must be fixed
    warnings,
)]
#![warn(
    // Documentation
    missing_docs,

    // Error handling best practices
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::unimplemented,
    clippy::todo,

    // Performance
    clippy::inefficient_to_string,
    clippy::large_enum_variant,

    // Code clarity and maintainability
    clippy::cognitive_complexity,
    clippy::too_many_arguments,
    clippy::type_complexity,

    // Best practices
    clippy::clone_on_ref_ptr,
    clippy::wildcard_imports,
    clippy::enum_glob_use,
    clippy::if_not_else,
    clippy::single_match_else,
    clippy::needless_continue,
    clippy::explicit_iter_loop,
    clippy::explicit_into_iter_loop,
)]
#![allow(
    clippy::too_many_arguments,
    missing_docs,
)]

pub mod api;
pub mod apk;
pub mod exceptions;
pub mod exit_codes;
pub mod logger;
pub mod version;

// Re-export main API functions
pub use api::{PatchOptions, RunControl, patch_apk, update_loader, verify_apk};
pub use apk::patcher::{PatchReport, PatchRequest, PatchResult};
pub use exceptions::{ErrorKind, PatchError};
