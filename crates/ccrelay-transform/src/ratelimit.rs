//! Extracts a reset duration (milliseconds) from an upstream response,
//! trying several heterogeneous signals in order and stopping at the first
//! one that parses (SPEC_FULL.md §4.A). Returns `None` when nothing can be
//! inferred; a `None` means "apply the operator-configured default cooldown".

use http::HeaderMap;
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn parse_reset_ms(headers: &HeaderMap, body: Option<&Value>) -> Option<u64> {
    if let Some(ms) = parse_retry_after_header(headers) {
        return non_zero(ms);
    }
    if let Some(ms) = parse_ratelimit_reset_header(headers) {
        return non_zero(ms);
    }
    if let Some(ms) = parse_ratelimit_reset_after_header(headers) {
        return non_zero(ms);
    }
    if let Some(body) = body
        && let Some(ms) = scan_body_for_delay(body)
    {
        return non_zero(ms);
    }
    None
}

fn non_zero(ms: i64) -> Option<u64> {
    if ms <= 0 { None } else { Some(ms as u64) }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|s| !s.is_empty())
}

fn now_unix_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// `retry-after` as integer seconds, or an HTTP-date.
fn parse_retry_after_header(headers: &HeaderMap) -> Option<i64> {
    let value = header_str(headers, "retry-after")?;
    if let Ok(secs) = value.parse::<i64>() {
        return Some(secs * 1000);
    }
    if let Ok(when) = httpdate::parse_http_date(value) {
        let target_ms = when.duration_since(UNIX_EPOCH).ok()?.as_millis() as i64;
        return Some(target_ms - now_unix_ms());
    }
    None
}

/// `x-ratelimit-reset` as absolute Unix seconds.
fn parse_ratelimit_reset_header(headers: &HeaderMap) -> Option<i64> {
    let value = header_str(headers, "x-ratelimit-reset")?;
    let reset_secs: i64 = value.parse().ok()?;
    Some(reset_secs * 1000 - now_unix_ms())
}

/// `x-ratelimit-reset-after` as integer seconds.
fn parse_ratelimit_reset_after_header(headers: &HeaderMap) -> Option<i64> {
    let value = header_str(headers, "x-ratelimit-reset-after")?;
    let secs: i64 = value.parse().ok()?;
    Some(secs * 1000)
}

const BODY_KEYS: [&str; 2] = ["retryDelay", "retry-after-ms"];

fn scan_body_for_delay(value: &Value) -> Option<i64> {
    match value {
        Value::Object(map) => {
            for key in BODY_KEYS {
                if let Some(found) = map.get(key)
                    && let Some(ms) = parse_delay_value(found)
                {
                    return Some(ms);
                }
            }
            map.values().find_map(scan_body_for_delay)
        }
        Value::Array(items) => items.iter().find_map(scan_body_for_delay),
        _ => None,
    }
}

fn parse_delay_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            // Bare numeric ms (no explicit unit available on the wire).
            n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))
        }
        Value::String(s) => parse_delay_string(s),
        _ => None,
    }
}

fn parse_delay_string(raw: &str) -> Option<i64> {
    let s = raw.trim();

    if let Some(stripped) = s.strip_suffix("ms") {
        return stripped.trim().parse::<f64>().ok().map(|ms| ms as i64);
    }
    if let Some(stripped) = s.strip_suffix('s')
        && !s.contains(['h', 'm'])
    {
        return stripped.trim().parse::<f64>().ok().map(|secs| (secs * 1000.0) as i64);
    }
    if let Some(ms) = parse_hms_duration(s) {
        return Some(ms);
    }
    if let Ok(instant) = time::OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339) {
        let target_ms = instant.unix_timestamp_nanos() / 1_000_000;
        return Some(target_ms as i64 - now_unix_ms());
    }
    if let Ok(bare_ms) = s.parse::<i64>() {
        return Some(bare_ms);
    }
    None
}

/// Parses `HhMmSs`, `MmSs`, or `Ss` human duration strings into milliseconds.
fn parse_hms_duration(s: &str) -> Option<i64> {
    if !s.ends_with('s') || !(s.contains('h') || s.contains('m')) {
        return None;
    }

    let mut hours = 0f64;
    let mut minutes = 0f64;
    let mut rest = s;

    if let Some(pos) = rest.find('h') {
        hours = rest[..pos].parse().ok()?;
        rest = &rest[pos + 1..];
    }
    if let Some(pos) = rest.find('m') {
        minutes = rest[..pos].parse().ok()?;
        rest = &rest[pos + 1..];
    }
    let secs_part = rest.strip_suffix('s')?;
    let seconds: f64 = if secs_part.is_empty() { 0.0 } else { secs_part.parse().ok()? };

    let total_secs = hours * 3600.0 + minutes * 60.0 + seconds;
    Some((total_secs * 1000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(http::HeaderName::from_bytes(k.as_bytes()).unwrap(), HeaderValue::from_str(v).unwrap());
        }
        headers
    }

    #[test]
    fn retry_after_seconds_wins_over_body() {
        let headers = headers_with(&[("retry-after", "60")]);
        let body = serde_json::json!({"retryDelay": "7.5s"});
        assert_eq!(parse_reset_ms(&headers, Some(&body)), Some(60_000));
    }

    #[test]
    fn retry_after_zero_is_null() {
        let headers = headers_with(&[("retry-after", "0")]);
        assert_eq!(parse_reset_ms(&headers, None), None);
    }

    #[test]
    fn body_decimal_seconds() {
        let headers = HeaderMap::new();
        let body = serde_json::json!({"error": {"retryDelay": "7.5s"}});
        assert_eq!(parse_reset_ms(&headers, Some(&body)), Some(7_500));
    }

    #[test]
    fn body_hms_duration() {
        let headers = HeaderMap::new();
        let body = serde_json::json!({"retryDelay": "1h23m45s"});
        assert_eq!(parse_reset_ms(&headers, Some(&body)), Some(5_025_000));
    }

    #[test]
    fn body_with_no_known_pattern_is_null() {
        let headers = HeaderMap::new();
        let body = serde_json::json!({"message": "rate limited, try later"});
        assert_eq!(parse_reset_ms(&headers, Some(&body)), None);
    }

    #[test]
    fn ratelimit_reset_after_header() {
        let headers = headers_with(&[("x-ratelimit-reset-after", "42")]);
        assert_eq!(parse_reset_ms(&headers, None), Some(42_000));
    }
}
