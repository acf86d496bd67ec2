use log::Level;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Emit one structured diagnostic line through the `log` facade.
///
/// `module` becomes the log target so callers can filter with the usual
/// `RUST_LOG`-style directives (`novelgen::ai=debug`).
pub fn log_event(
    level: Level,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) {
    if !log::log_enabled!(target: module, level) {
        return;
    }
    let id = Uuid::new_v4();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let payload = serde_json::json!({
        "id": id.to_string(),
        "ts": ts,
        "code": code,
        "explain": explain,
        "data": data,
    });
    log::log!(target: module, level, "{message} {payload}");
}

/// Trim long generated text before it lands in a log line.
pub fn preview(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_counts_characters_not_bytes() {
        assert_eq!(preview("主角出发了", 2), "主角");
        assert_eq!(preview("abc", 10), "abc");
    }
}
