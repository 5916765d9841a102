use std::env;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() { None } else { Some(t.to_string()) }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    // Reproducible builds pin the stamp through SOURCE_DATE_EPOCH.
    let secs = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default()
        });

    let host = env::var("HOSTNAME")
        .ok()
        .and_then(non_empty)
        .or_else(|| fs::read_to_string("/etc/hostname").ok().and_then(non_empty))
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=RESTARTER_BUILD_TIME=epoch:{secs}");
    println!("cargo:rustc-env=RESTARTER_BUILD_HOST={host}");
}
