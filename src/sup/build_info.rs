pub fn build_host() -> &'static str {
    option_env!("RESTARTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("RESTARTER_BUILD_TIME").unwrap_or("unknown")
}

/// Renders the `epoch:<secs>` stamp from build.rs as a UTC timestamp.
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix("epoch:")
        .and_then(|secs| secs.trim().parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| raw.to_string())
}

pub fn banner() -> String {
    format!(
        "restarter {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        format_build_time(build_time_raw())
    )
}
