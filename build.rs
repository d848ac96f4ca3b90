//! Embeds the commit and toolchain details printed by `switchyard version`

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let dirty = output_of("git", &["status", "--porcelain"]).map(|changes| (!changes.is_empty()).to_string());

    let metadata = [
        ("GIT_HASH", output_of("git", &["rev-parse", "--short=8", "HEAD"])),
        ("GIT_BRANCH", output_of("git", &["rev-parse", "--abbrev-ref", "HEAD"])),
        ("GIT_DIRTY", dirty),
        (
            "BUILD_TIMESTAMP",
            Some(chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string()),
        ),
        ("TARGET", env::var("TARGET").ok()),
        ("HOST", env::var("HOST").ok()),
        ("PROFILE", env::var("PROFILE").ok()),
        ("RUSTC_VERSION", output_of(&rustc, &["--version"])),
    ];

    for (key, value) in metadata {
        let value = value.unwrap_or_else(|| "unknown".to_string());
        println!("cargo:rustc-env=SWITCHYARD_{}={}", key, value);
    }
}

/// Trimmed stdout of a command that exited successfully
fn output_of(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
