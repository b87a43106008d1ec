use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
    println!("cargo:rerun-if-env-changed=ADMIND_BUILD_ID_OVERRIDE");
    println!("cargo:rerun-if-changed=.git/HEAD");

    let built_at = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let revision = git_revision().unwrap_or_else(|| "unknown".to_string());
    let build_id = env::var("ADMIND_BUILD_ID_OVERRIDE")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{} | {}", built_at, revision));

    println!("cargo:rustc-env=ADMIND_BUILD_ID={}", build_id);
    println!("cargo:rustc-env=ADMIND_BUILD_TIME={}", built_at);
    println!("cargo:rustc-env=ADMIND_BUILD_REVISION={}", revision);
}

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let revision = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!revision.is_empty()).then_some(revision)
}
