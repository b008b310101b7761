// src/ingest/mod.rs
pub mod cache;
pub mod connector;
pub mod dedup;
pub mod orchestrator;
pub mod providers;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod validate;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub(crate) fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_calls_total", "Network calls issued per provider.");
        describe_counter!(
            "ingest_errors_total",
            "Failed provider calls by provider and error kind."
        );
        describe_counter!(
            "ingest_records_total",
            "Records written or skipped, by write action."
        );
        describe_counter!(
            "ingest_validation_rejected_total",
            "Records rejected by the response validator."
        );
        describe_counter!("ingest_cache_total", "Read-through cache lookups by result.");
        describe_histogram!(
            "ratelimit_wait_ms",
            "Time callers spent waiting for a short-window slot."
        );
        describe_counter!(
            "ratelimit_quota_exceeded_total",
            "Acquires refused because the daily quota was used up."
        );
        describe_counter!(
            "circuit_transitions_total",
            "Circuit breaker state changes by provider and target state."
        );
        describe_counter!("ingest_runs_total", "Scheduled ingestion runs started.");
        describe_histogram!("ingest_run_duration_ms", "Wall time of one ingestion run.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when ingest pipeline last ran."
        );
    });
}

/// Normalize provider free text: decode entities, strip tags, collapse
/// whitespace, trim and cap at `max_chars`.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").expect("static regex"));
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace (incl. decoded &nbsp;)
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("static regex"));
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect::<String>().trim_end().to_string();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_ws_and_entities() {
        let s = "  Hello,&nbsp;&nbsp; <i>world</i>!  ";
        assert_eq!(normalize_text(s, 100), "Hello, world !");
    }

    #[test]
    fn normalize_text_quotes_and_cap() {
        assert_eq!(normalize_text("\u{201C}Hawkish\u{201D} Fed", 100), "\"Hawkish\" Fed");
        assert_eq!(normalize_text("abcdef", 3), "abc");
    }
}
