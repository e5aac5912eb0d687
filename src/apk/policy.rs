//! Signature bypass policy
//!
//! A bypass level selects a cumulative set of relaxations: every relaxation
//! enabled at level N stays enabled at every level above N.

use crate::apk::signing::Schemes;
use crate::exceptions::{PatchError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum BypassLevel {
    #[default]
    None = 0,
    DisableCertPinChecks = 1,
    DisableAllVerification = 2,
}

/// A single policy-driven change to the patched artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relaxation {
    /// Keep the original signing certificate in the marker for the loader
    RecordOriginalSignature,
    /// Remove source-stamp meta-data and the stamp certificate entry
    StripSourceStamp,
    /// Ship the unmodified base archive for file-open redirection
    EmbedOriginalArchive,
    /// Remove split-requirement attributes and meta-data
    DropSplitRequirement,
}

const RELAXATIONS: &[Relaxation] = &[
    Relaxation::RecordOriginalSignature,
    Relaxation::StripSourceStamp,
    Relaxation::EmbedOriginalArchive,
    Relaxation::DropSplitRequirement,
];

impl Relaxation {
    /// Lowest level at which this relaxation applies
    pub fn min_level(self) -> BypassLevel {
        match self {
            Relaxation::RecordOriginalSignature | Relaxation::StripSourceStamp => {
                BypassLevel::DisableCertPinChecks
            }
            Relaxation::EmbedOriginalArchive | Relaxation::DropSplitRequirement => {
                BypassLevel::DisableAllVerification
            }
        }
    }

    /// Whether applying it rewrites the binary manifest
    pub fn touches_manifest(self) -> bool {
        matches!(
            self,
            Relaxation::StripSourceStamp | Relaxation::DropSplitRequirement
        )
    }
}

impl fmt::Display for Relaxation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Relaxation::RecordOriginalSignature => "record original signature",
            Relaxation::StripSourceStamp => "strip source stamp",
            Relaxation::EmbedOriginalArchive => "embed original archive",
            Relaxation::DropSplitRequirement => "drop split requirement",
        };
        f.write_str(name)
    }
}

impl BypassLevel {
    pub fn from_u8(level: u8) -> Result<Self> {
        match level {
            0 => Ok(BypassLevel::None),
            1 => Ok(BypassLevel::DisableCertPinChecks),
            2 => Ok(BypassLevel::DisableAllVerification),
            other => Err(PatchError::Generic(format!(
                "bypass level must be 0, 1 or 2 (got {other})"
            ))),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Relaxations applied at this level, lower levels included
    pub fn relaxations(self) -> Vec<Relaxation> {
        RELAXATIONS
            .iter()
            .copied()
            .filter(|r| r.min_level() <= self)
            .collect()
    }

    pub fn applies(self, relaxation: Relaxation) -> bool {
        relaxation.min_level() <= self
    }

    /// Schemes produced when the caller does not choose
    pub fn default_schemes(self) -> Schemes {
        match self {
            BypassLevel::None | BypassLevel::DisableCertPinChecks => Schemes {
                v1: true,
                v2: true,
                v3: true,
            },
            // v2 alone is enough to install on API 24+
            BypassLevel::DisableAllVerification => Schemes {
                v1: false,
                v2: true,
                v3: false,
            },
        }
    }
}

impl fmt::Display for BypassLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BypassLevel::None => "NONE",
            BypassLevel::DisableCertPinChecks => "DISABLE_CERT_PIN_CHECKS",
            BypassLevel::DisableAllVerification => "DISABLE_ALL_VERIFICATION",
        };
        write!(f, "{} ({})", self.as_u8(), name)
    }
}

impl From<BypassLevel> for u8 {
    fn from(level: BypassLevel) -> u8 {
        level.as_u8()
    }
}

impl TryFrom<u8> for BypassLevel {
    type Error = PatchError;

    fn try_from(level: u8) -> Result<Self> {
        BypassLevel::from_u8(level)
    }
}
