use std::env;
use std::process::Command;

use time::OffsetDateTime;

/// Year of the build, reproducible when `SOURCE_DATE_EPOCH` is set.
fn build_year() -> i32 {
    env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|epoch| OffsetDateTime::from_unix_timestamp(epoch).ok())
        .unwrap_or_else(OffsetDateTime::now_utc)
        .year()
}

/// Tag pointing exactly at HEAD, if git is available.
fn exact_tag() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--exact-match"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout).ok().map(|s| s.trim().to_string())
}

fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/tags");

    let version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let release = env::var("PROFILE").is_ok_and(|p| p == "release");

    // Untagged debug builds are marked so bug reports show they are not a release.
    let display = if release || exact_tag().as_deref() == Some(format!("v{version}").as_str()) {
        version.clone()
    } else {
        format!("{version}-dev")
    };

    println!("cargo:rustc-env=APP_BUILD_YEAR={}", build_year());
    println!("cargo:rustc-env=APP_VERSION_DISPLAY={display}");
}
