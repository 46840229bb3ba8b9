// Stamps the short git hash into `knit --version` when building from a checkout.

use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=../../.git/HEAD");

    let Ok(output) = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
    else {
        return;
    };
    if !output.status.success() {
        return;
    }
    let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !hash.is_empty() {
        println!("cargo:rustc-env=KNIT_BUILD_GIT_HASH={hash}");
    }
}
