//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! - LOG_LEVEL is either a bare level ("debug"), applied to the engine's own
//!   targets while dependencies stay at info, or full EnvFilter directives
//!   ("info,cache=trace,tower_http=debug") used as given.
//! - LOG_FORMAT selects "pretty" (default) or "json" structured logs.
//!
//! Log targets: `progress` (orchestrator), `cache`, `rate_limit`, `feedback`
//! and `progress_engine` (startup, config, HTTP surface).

use tracing_subscriber::EnvFilter;

const ENGINE_TARGETS: [&str; 5] = ["progress", "cache", "rate_limit", "feedback", "progress_engine"];
const DEFAULT_DIRECTIVES: &str =
    "info,progress=debug,feedback=debug,progress_engine=debug,cache=info,rate_limit=info,tower_http=info,axum=info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Expand a bare level into per-target directives; anything else passes through.
fn directives(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_DIRECTIVES.to_string();
    };
    let bare = matches!(raw.to_ascii_lowercase().as_str(), "trace" | "debug" | "info" | "warn" | "error" | "off");
    if !bare {
        return raw.to_string();
    }
    let mut out = String::from("info");
    for target in ENGINE_TARGETS {
        out.push_str(&format!(",{target}={raw}"));
    }
    out.push_str(",tower_http=info,axum=info");
    out
}

pub fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").ok();
    let filter = EnvFilter::try_new(directives(level.as_deref())).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    // The two builders have different types, so each arm calls init itself.
    match LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref()) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_levels_only_raise_engine_targets() {
        let d = directives(Some("trace"));
        assert!(d.starts_with("info,"));
        assert!(d.contains("cache=trace"));
        assert!(d.contains("progress_engine=trace"));
        assert!(d.ends_with("tower_http=info,axum=info"));
    }

    #[test]
    fn full_directives_pass_through() {
        assert_eq!(directives(Some("warn,cache=debug")), "warn,cache=debug");
        assert_eq!(directives(None), DEFAULT_DIRECTIVES);
        assert_eq!(directives(Some("  ")), DEFAULT_DIRECTIVES);
    }

    #[test]
    fn log_format_defaults_to_pretty() {
        assert_eq!(LogFormat::parse(Some("JSON")), LogFormat::Json);
        assert_eq!(LogFormat::parse(Some("text")), LogFormat::Pretty);
        assert_eq!(LogFormat::parse(None), LogFormat::Pretty);
    }
}
