//! Utility functions for minisvc

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Percent-encoding set for query values (mounts contain `/`)
const QUERY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b'%')
    .add(b' ')
    .add(b'?')
    .add(b'#')
    .add(b'&')
    .add(b'=')
    .add(b'+')
    .add(b'"');

/// Longest accepted mount path
pub const MAX_MOUNT_LEN: usize = 1024;

/// Encode a value for use inside a query string
pub fn encode_query_value(value: &str) -> String {
    utf8_percent_encode(value, QUERY_ENCODE_SET).to_string()
}

/// Decode a percent-encoded query component (`+` means space)
pub fn decode_query_value(encoded: &str) -> crate::Result<String> {
    let spaced = encoded.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|s| s.to_string())
        .map_err(|e| crate::Error::OptionsMalformed(format!("Failed to decode query: {}", e)))
}

/// Split a raw query string into decoded `(key, value)` pairs, keeping
/// repeated keys in order.
pub fn parse_query_pairs(query: Option<&str>) -> crate::Result<Vec<(String, String)>> {
    let Some(query) = query else {
        return Ok(Vec::new());
    };
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (key, value) = part.split_once('=').unwrap_or((part, ""));
            Ok((decode_query_value(key)?, decode_query_value(value)?))
        })
        .collect()
}

/// Parse a boolean query flag the way the public API accepts them
pub fn parse_flag(value: &str) -> crate::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(crate::Error::OptionsMalformed(format!(
            "invalid flag value: {}",
            other
        ))),
    }
}

/// Validate a mount path.
///
/// Mounts are absolute, slash-separated, without empty or dot segments and
/// without a trailing slash.
pub fn validate_mount(mount: &str) -> crate::Result<()> {
    let invalid = |reason: &str| crate::Error::InvalidMount {
        mount: mount.to_string(),
        reason: reason.to_string(),
    };

    if !mount.starts_with('/') || mount.len() < 2 {
        return Err(invalid("must start with '/' and name a path"));
    }
    if mount.len() > MAX_MOUNT_LEN {
        return Err(invalid("too long (max 1024 bytes)"));
    }
    if mount.chars().any(char::is_control) {
        return Err(invalid("contains control characters"));
    }
    if mount[1..]
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(invalid("contains an empty or relative segment"));
    }
    Ok(())
}

/// Restricted internal mounts (`/_...`) may have their bundle built lazily
pub fn is_internal_mount(mount: &str) -> bool {
    mount.starts_with("/_")
}

/// Attachment file name for a mount: `/a/b/` -> `a_b.zip`
pub fn bundle_filename(mount: &str) -> String {
    format!("{}.zip", mount.trim_matches('/').replace('/', "_"))
}

/// Current time as RFC 3339
pub fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_query_value() {
        let mount = "/my app/v1";
        let encoded = encode_query_value(mount);
        assert!(encoded.contains("%2F"));
        assert!(!encoded.contains(' '));
        assert_eq!(decode_query_value(&encoded).unwrap(), mount);
    }

    #[test]
    fn test_parse_query_pairs_repeated() {
        let pairs = parse_query_pairs(Some("mount=%2Fa&mount=%2Fb&flag")).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("mount".to_string(), "/a".to_string()),
                ("mount".to_string(), "/b".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
        assert!(parse_query_pairs(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("true").unwrap());
        assert!(parse_flag("").unwrap());
        assert!(!parse_flag("0").unwrap());
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn test_validate_mount() {
        assert!(validate_mount("/app").is_ok());
        assert!(validate_mount("/_admin/tools").is_ok());
        assert!(validate_mount("").is_err());
        assert!(validate_mount("/").is_err());
        assert!(validate_mount("app").is_err());
        assert!(validate_mount("/a//b").is_err());
        assert!(validate_mount("/a/../b").is_err());
        assert!(validate_mount("/a/").is_err());
        assert!(validate_mount("/my app").is_ok());
        assert!(validate_mount("/a\tb").is_err());
        assert!(validate_mount("/a\nb").is_err());
        assert!(validate_mount("/a\u{7f}").is_err());
        assert!(validate_mount(&format!("/{}", "x".repeat(2000))).is_err());
    }

    #[test]
    fn test_bundle_filename() {
        assert_eq!(bundle_filename("/a/b/"), "a_b.zip");
        assert_eq!(bundle_filename("/app"), "app.zip");
        assert!(is_internal_mount("/_system"));
        assert!(!is_internal_mount("/system"));
    }
}
