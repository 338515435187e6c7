use std::process::Command;

fn main() {
    // Release pipelines pass the revision in; local builds ask git.
    let sha = std::env::var("CADENCE_GIT_SHA")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            Command::new("git")
                .args(["rev-parse", "--short", "HEAD"])
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=CADENCE_GIT_SHA={sha}");
    println!("cargo:rerun-if-env-changed=CADENCE_GIT_SHA");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}
