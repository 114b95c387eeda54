// Emits git SHA and rustc version as `rustc-env` values consumed by the
// long-form `--version --verbose` output. Stdlib-only, same rationale as
// the crate's other dependency choices: no extra build-time crate for
// two `git`/`rustc` subprocess calls.

use std::process::Command;

fn main() {
    let sha = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=CUSTODIAN_GIT_SHA={sha}");

    let rustc = Command::new(std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string()))
        .arg("--version")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=CUSTODIAN_RUSTC_VERSION={rustc}");

    println!("cargo:rerun-if-changed=build.rs");
}
