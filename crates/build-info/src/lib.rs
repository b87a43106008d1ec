//! Build metadata stamped by `build.rs` into the admind binaries.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct BuildStamp {
    id: &'static str,
    time: &'static str,
    revision: &'static str,
}

static STAMP: Lazy<BuildStamp> = Lazy::new(|| BuildStamp {
    id: option_env!("ADMIND_BUILD_ID").unwrap_or("unknown build"),
    time: option_env!("ADMIND_BUILD_TIME").unwrap_or("unknown time"),
    revision: option_env!("ADMIND_BUILD_REVISION").unwrap_or("unknown revision"),
});

/// Full build identifier, e.g. `2026-10-19 08:12:44 UTC | 3f2a9c1`.
pub fn build_id() -> &'static str {
    STAMP.id
}

pub fn build_timestamp() -> &'static str {
    STAMP.time
}

pub fn revision() -> &'static str {
    STAMP.revision
}

/// One-line banner logged by binaries at startup.
pub fn banner(package: &str, version: &str) -> String {
    format!("{} {} | {}", package, version, build_id())
}
