use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File extensions served as static assets
const STATIC_EXTENSIONS: &[&str] = &[
    // scripts and styles
    "js", "mjs", "cjs", "css", "map",
    // images
    "png", "jpg", "jpeg", "gif", "svg", "webp", "avif", "ico", "bmp", "tif", "tiff",
    // fonts
    "woff", "woff2", "ttf", "otf", "eot",
    // media
    "mp4", "webm", "mp3", "ogg", "wav", "m4a", "mov", "avi", "flac",
    // archives
    "zip", "gz", "tgz", "tar", "rar", "7z", "bz2", "xz",
    // text
    "txt", "pdf", "csv", "xml", "md",
];

/// One observed request, as normalized from a provider's access log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub ip: Option<String>,

    #[serde(default, alias = "userAgent")]
    pub user_agent: Option<String>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default, alias = "statusCode", alias = "status")]
    pub status_code: Option<u16>,

    #[serde(default, alias = "bytesTransferred", alias = "bytes")]
    pub bytes_transferred: Option<u64>,

    #[serde(default)]
    pub referer: Option<String>,
}

/// Static vs dynamic split of request paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathGroup {
    Static,
    Dynamic,
}

impl LogEntry {
    /// Client IP, or "unknown" when the log line did not carry one
    pub fn client_ip(&self) -> &str {
        match self.ip.as_deref().map(str::trim) {
            Some(ip) if !ip.is_empty() => ip,
            _ => "unknown",
        }
    }

    /// Trimmed user agent; empty when missing
    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn bytes(&self) -> u64 {
        self.bytes_transferred.unwrap_or(0)
    }

    /// Unix timestamp truncated to the minute
    pub fn minute_bucket(&self) -> i64 {
        self.timestamp.timestamp().div_euclid(60) * 60
    }

    /// "2xx".."5xx", or "0xx" when the status is missing
    pub fn status_class(&self) -> String {
        status_class(self.status_code)
    }

    pub fn path_group(&self) -> PathGroup {
        path_group(self.path.as_deref().unwrap_or(""))
    }
}

pub fn status_class(status: Option<u16>) -> String {
    let digit = status
        .and_then(|s| s.to_string().chars().next())
        .unwrap_or('0');
    format!("{digit}xx")
}

/// Classify a request path as a static asset or a dynamic page
pub fn path_group(path: &str) -> PathGroup {
    let path = path
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .trim();

    if path == "/robots.txt" || path == "/favicon.ico" {
        return PathGroup::Static;
    }

    let last_segment = path.rsplit('/').next().unwrap_or("");
    match last_segment.rsplit_once('.') {
        Some((_, ext)) if STATIC_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) => {
            PathGroup::Static
        }
        _ => PathGroup::Dynamic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_group_extensions() {
        assert_eq!(path_group("/assets/app.JS"), PathGroup::Static);
        assert_eq!(path_group("/img/logo.png?v=3"), PathGroup::Static);
        assert_eq!(path_group("/fonts/inter.woff2#x"), PathGroup::Static);
        assert_eq!(path_group("/robots.txt"), PathGroup::Static);
        assert_eq!(path_group("/favicon.ico"), PathGroup::Static);
        assert_eq!(path_group("/api/users.json"), PathGroup::Dynamic);
        assert_eq!(path_group("/blog/post"), PathGroup::Dynamic);
        assert_eq!(path_group("/"), PathGroup::Dynamic);
        assert_eq!(path_group(""), PathGroup::Dynamic);
        assert_eq!(path_group("/v1.2/users"), PathGroup::Dynamic);
    }

    #[test]
    fn test_status_class() {
        assert_eq!(status_class(Some(200)), "2xx");
        assert_eq!(status_class(Some(404)), "4xx");
        assert_eq!(status_class(Some(503)), "5xx");
        assert_eq!(status_class(None), "0xx");
    }

    #[test]
    fn test_missing_fields_default() {
        let entry: LogEntry =
            serde_json::from_str(r#"{"timestamp":"2024-05-01T10:15:42Z"}"#).unwrap();
        assert_eq!(entry.client_ip(), "unknown");
        assert_eq!(entry.user_agent(), "");
        assert_eq!(entry.bytes(), 0);
        assert_eq!(entry.status_class(), "0xx");
        assert_eq!(entry.minute_bucket() % 60, 0);
        assert_eq!(entry.minute_bucket(), entry.timestamp.timestamp() - 42);
    }
}
