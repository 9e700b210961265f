/// HTTP header parsing utilities
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, RETRY_AFTER};
use reqwest::StatusCode;
use std::time::Duration;

/// Extracts a filename from response headers or the URL.
///
/// Tries Content-Disposition first, then the URL path segments, then falls
/// back to "download.dat". The result is sanitized.
pub fn extract_filename(headers: &HeaderMap, url: &str) -> String {
    if let Some(disp) = headers.get(CONTENT_DISPOSITION) {
        if let Ok(disp_str) = disp.to_str() {
            if let Some(name_part) = disp_str.split("filename=").nth(1) {
                let name = name_part
                    .split(';')
                    .next()
                    .unwrap_or(name_part)
                    .trim()
                    .trim_matches('"')
                    .trim_matches('\'');
                if !name.is_empty() {
                    return sanitize_filename::sanitize(name);
                }
            }
        }
    }

    let mut filename = "download.dat".to_string();
    if let Ok(parsed_url) = url::Url::parse(url) {
        if let Some(segments) = parsed_url.path_segments() {
            if let Some(last) = segments.last() {
                if !last.is_empty() {
                    filename = last.to_string();
                }
            }
        }
    }
    sanitize_filename::sanitize(filename)
}

/// Origin (`scheme://host[:port]`) of a URL, used as the Referer.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let mut origin = format!("{}://{host}", parsed.scheme());
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    Some(origin)
}

/// Parses a Retry-After header value: delta-seconds or an HTTP-date.
/// Returns `default` when the value is absent or unparsable.
pub fn parse_retry_after(headers: &HeaderMap, default: Duration) -> Duration {
    let Some(value) = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()) else {
        return default;
    };
    let value = value.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        let delta = date.with_timezone(&Utc) - Utc::now();
        if let Ok(positive) = delta.to_std() {
            return positive;
        }
        // a date in the past means retry immediately
        return Duration::from_secs(0);
    }

    default
}

/// Whether a probe response advertises byte-range support: 206, or 200
/// with `Accept-Ranges: bytes`.
pub fn supports_ranges(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::PARTIAL_CONTENT {
        return true;
    }
    status == StatusCode::OK
        && headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_filename_from_content_disposition() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"game.zip\"; size=123"),
        );
        assert_eq!(
            extract_filename(&headers, "https://host.example/other"),
            "game.zip"
        );
    }

    #[test]
    fn test_filename_from_url_fallback() {
        let headers = HeaderMap::new();
        assert_eq!(
            extract_filename(&headers, "https://host.example/files/game.zip"),
            "game.zip"
        );
        assert_eq!(
            extract_filename(&headers, "https://host.example/"),
            "download.dat"
        );
    }

    #[test]
    fn test_filename_is_sanitized() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"..\\evil.exe\""),
        );
        let name = extract_filename(&headers, "https://host.example/x");
        assert!(!name.contains('\\'));
        assert!(!name.contains('/'));
    }

    #[test]
    fn test_origin() {
        assert_eq!(
            origin_of("https://host.example/path/file.zip").as_deref(),
            Some("https://host.example")
        );
        assert_eq!(
            origin_of("http://host.example:8080/x").as_deref(),
            Some("http://host.example:8080")
        );
        assert_eq!(origin_of("not a url"), None);
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(
            parse_retry_after(&headers, Duration::from_secs(60)),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_retry_after_http_date() {
        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&future).unwrap());
        let parsed = parse_retry_after(&headers, Duration::from_secs(60));
        assert!(parsed > Duration::from_secs(80) && parsed <= Duration::from_secs(91));

        let past = (Utc::now() - chrono::Duration::seconds(90)).to_rfc2822();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&past).unwrap());
        assert_eq!(
            parse_retry_after(&headers, Duration::from_secs(60)),
            Duration::from_secs(0)
        );
    }

    #[test]
    fn test_retry_after_defaults() {
        let headers = HeaderMap::new();
        assert_eq!(
            parse_retry_after(&headers, Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("garbage"));
        assert_eq!(
            parse_retry_after(&headers, Duration::from_secs(30)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_range_support_detection() {
        let headers = HeaderMap::new();
        assert!(supports_ranges(StatusCode::PARTIAL_CONTENT, &headers));
        assert!(!supports_ranges(StatusCode::OK, &headers));

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        assert!(supports_ranges(StatusCode::OK, &headers));

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("none"));
        assert!(!supports_ranges(StatusCode::OK, &headers));
    }
}
