//! Version information for the patch engine

/// Engine version name, stamped into every patched archive
pub const VERSION: &str = env!("LSPATCH_VERSION");

/// Monotonic engine version code; an installed artifact with a lower code is
/// eligible for an update-loader run
pub const VERSION_CODE: u32 = 700;

/// Loader API level the injected payload implements
pub const API_CODE: u32 = 93;

/// Build timestamp (set at compile time)
pub const BUILD_TIME: Option<&str> = option_env!("BUILD_TIME");

/// Git commit hash (set at compile time)
pub const GIT_COMMIT: Option<&str> = option_env!("GIT_COMMIT");

/// Get full version string with optional build information
pub fn full_version() -> String {
    let mut version = format!("{VERSION} ({VERSION_CODE})");

    if let Some(commit) = GIT_COMMIT {
        version.push_str(&format!(" [{}]", &commit[..8.min(commit.len())]));
    }

    if let Some(time) = BUILD_TIME {
        version.push_str(&format!(" built {}", time));
    }

    version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_version_contains_code() {
        let v = full_version();
        assert!(v.starts_with(VERSION));
        assert!(v.contains(&VERSION_CODE.to_string()));
    }
}
