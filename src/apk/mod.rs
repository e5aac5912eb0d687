//! APK patch engine
//!
//! The pipeline reads an application archive, rewrites its binary manifest,
//! injects the loader payload and optional modules, then re-signs the result
//! with the v1, v2 and v3 schemes.

pub mod axml;
pub mod constants;
pub mod defaults;
pub mod injector;
pub mod modules;
pub mod patcher;
pub mod policy;
pub mod signing;
pub mod zip;

pub use patcher::{PatchFailure, PatchReport, PatchResult, Patcher, PipelineStage};
pub use policy::BypassLevel;
