// URL redaction rules
//
// Last line of defense before anything leaves the client: URLs that could
// carry personal data are dropped or truncated down to their origin.
// The rules are deliberately blunt; a false drop costs one data point,
// a false pass could leak a secret.

use crate::util::truncate_utf8_safe;
use url::{Host, Url};

/// Overall length threshold before a URL is considered risky.
pub const URL_MAX_LEN: usize = 800;
/// Longest title carried in an emitted page payload.
pub const TITLE_MAX_LEN: usize = 280;
/// Stricter threshold used when few public signals back the URL.
pub const URL_MAX_LEN_STRICT: usize = 500;
const PATH_MAX_LEN_STRICT: usize = 300;
const QUERY_MAX_LEN_STRICT: usize = 150;
const HOST_MAX_LEN: usize = 64;

/// Marker appended to origin-truncated URLs.
pub const PROTECTED_SUFFIX: &str = " (PROTECTED)";

const EXTENSION_SCHEMES: &[&str] = &[
    "moz-extension:",
    "chrome-extension:",
    "safari-web-extension:",
    "edge-extension:",
    "chrome:",
    "about:",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SanitizeResult {
    /// The URL may be shared as-is.
    Safe { safe_url: String },
    /// Too long to share, but the origin is harmless on its own.
    Truncated { safe_url: String },
    /// Nothing about this URL may be shared.
    Dropped { reason: &'static str },
}

impl SanitizeResult {
    pub fn is_safe(&self) -> bool {
        matches!(self, SanitizeResult::Safe { .. })
    }

    /// The shareable form, if any.
    pub fn safe_url(&self) -> Option<&str> {
        match self {
            SanitizeResult::Safe { safe_url } | SanitizeResult::Truncated { safe_url } => {
                Some(safe_url)
            }
            SanitizeResult::Dropped { .. } => None,
        }
    }
}

/// `<scheme>://<host>/ (PROTECTED)` - the redacted stand-in for a URL
/// that failed quorum consent or length checks.
pub fn protected_url(scheme: &str, host: &str) -> String {
    format!("{scheme}://{host}/{PROTECTED_SUFFIX}")
}

/// Apply the redaction rules to one URL.
///
/// `strict` tightens the length limits; the doublefetch handler selects
/// it when a URL has too few public signals (not canonical, not indexed,
/// no index request).
pub fn sanitize_url(raw: &str, strict: bool) -> SanitizeResult {
    let lowered = raw.trim_start().to_ascii_lowercase();
    for scheme in EXTENSION_SCHEMES {
        if lowered.starts_with(scheme) {
            return SanitizeResult::Dropped {
                reason: "extension scheme",
            };
        }
    }

    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(_) => {
            return SanitizeResult::Dropped {
                reason: "unparseable",
            }
        }
    };

    if url.scheme() != "http" && url.scheme() != "https" {
        return SanitizeResult::Dropped {
            reason: "scheme not http(s)",
        };
    }

    if !url.username().is_empty() || url.password().is_some() {
        return SanitizeResult::Dropped { reason: "userinfo" };
    }

    let host = match url.host() {
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return SanitizeResult::Dropped { reason: "localhost" };
            }
            domain.to_string()
        }
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
            return SanitizeResult::Dropped {
                reason: "ip literal",
            }
        }
        None => return SanitizeResult::Dropped { reason: "no host" },
    };

    // `Url::port` strips scheme defaults, so any remaining port was
    // explicit and unusual unless it is the other standard one.
    if let Some(port) = url.port() {
        if port != 80 && port != 443 {
            return SanitizeResult::Dropped {
                reason: "non-standard port",
            };
        }
    }

    let max_len = if strict { URL_MAX_LEN_STRICT } else { URL_MAX_LEN };
    let too_long = raw.len() > max_len
        || (strict
            && (url.path().len() > PATH_MAX_LEN_STRICT
                || url.query().map_or(0, str::len) > QUERY_MAX_LEN_STRICT));

    if too_long {
        if host_is_benign(&host) {
            return SanitizeResult::Truncated {
                safe_url: protected_url(url.scheme(), &host),
            };
        }
        return SanitizeResult::Dropped { reason: "too long" };
    }

    SanitizeResult::Safe {
        safe_url: raw.to_string(),
    }
}

/// A host that carries no information beyond being a registered domain.
fn host_is_benign(host: &str) -> bool {
    host.len() <= HOST_MAX_LEN
        && host.contains('.')
        && !host.starts_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Bound a title for emission. Pages stuff arbitrary text into
/// `<title>`; everything past the cap is cut at a UTF-8 boundary.
pub fn sanitize_title(title: &str) -> String {
    truncate_utf8_safe(title.trim(), TITLE_MAX_LEN).to_string()
}

/// Quantize an activity score for emission.
///
/// Anything outside `[0,1]` becomes the literal `"0"`. In-range scores
/// are rounded to one decimal so near-identical scores from different
/// clients collide; ordering is preserved within 0.1 absolute drift.
pub fn sanitize_activity(x: f64) -> String {
    if !x.is_finite() || !(0.0..=1.0).contains(&x) {
        return "0".to_string();
    }
    let q = (x * 10.0).round() / 10.0;
    if q <= 0.0 {
        "0".to_string()
    } else if q >= 1.0 {
        "1".to_string()
    } else {
        format!("{q:.1}")
    }
}

/// Heuristic for search queries that may identify a person: emails,
/// long digit runs (phone numbers, IDs) and very long unbroken tokens.
pub fn is_suspicious_query(query: &str) -> bool {
    if looks_like_email(query) {
        return true;
    }
    if longest_digit_run(query) >= 7 {
        return true;
    }
    query.split_whitespace().any(|token| token.len() >= 20)
}

fn looks_like_email(s: &str) -> bool {
    if let Some(at) = s.find('@') {
        let (local, rest) = s.split_at(at);
        return !local.trim().is_empty() && rest[1..].contains('.');
    }
    false
}

fn longest_digit_run(s: &str) -> usize {
    let mut best = 0;
    let mut current = 0;
    for c in s.chars() {
        if c.is_ascii_digit() {
            current += 1;
            best = best.max(current);
        } else {
            current = 0;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_userinfo() {
        let result = sanitize_url("https://user@example.com/", false);
        assert_eq!(
            result,
            SanitizeResult::Dropped { reason: "userinfo" }
        );
    }

    #[test]
    fn drops_localhost_with_port() {
        assert!(matches!(
            sanitize_url("http://localhost:8080/", false),
            SanitizeResult::Dropped { .. }
        ));
    }

    #[test]
    fn drops_ip_literals_and_odd_ports() {
        assert!(matches!(
            sanitize_url("http://192.168.0.1/admin", false),
            SanitizeResult::Dropped { reason: "ip literal" }
        ));
        assert!(matches!(
            sanitize_url("https://example.com:8443/", false),
            SanitizeResult::Dropped {
                reason: "non-standard port"
            }
        ));
    }

    #[test]
    fn drops_extension_and_foreign_schemes() {
        assert!(matches!(
            sanitize_url("moz-extension://abc/page.html", false),
            SanitizeResult::Dropped {
                reason: "extension scheme"
            }
        ));
        assert!(matches!(
            sanitize_url("ftp://example.com/file", false),
            SanitizeResult::Dropped { .. }
        ));
    }

    #[test]
    fn safe_url_is_returned_verbatim() {
        let result = sanitize_url("https://example.com/", false);
        assert_eq!(
            result,
            SanitizeResult::Safe {
                safe_url: "https://example.com/".to_string()
            }
        );
    }

    #[test]
    fn long_url_truncates_to_protected_origin() {
        let url = format!("https://example.com/article?junk={}", "x".repeat(900));
        let result = sanitize_url(&url, false);
        assert_eq!(
            result,
            SanitizeResult::Truncated {
                safe_url: "https://example.com/ (PROTECTED)".to_string()
            }
        );
    }

    #[test]
    fn strict_mode_is_tighter() {
        let url = format!("https://example.com/p?q={}", "x".repeat(600));
        assert!(sanitize_url(&url, false).is_safe());
        assert!(matches!(
            sanitize_url(&url, true),
            SanitizeResult::Truncated { .. }
        ));
    }

    #[test]
    fn strict_mode_checks_query_length() {
        let url = format!("https://example.com/p?q={}", "x".repeat(200));
        assert!(sanitize_url(&url, false).is_safe());
        assert!(!sanitize_url(&url, true).is_safe());
    }

    #[test]
    fn title_is_bounded_at_utf8_boundaries() {
        assert_eq!(sanitize_title("  An Article  "), "An Article");

        let long = "x".repeat(TITLE_MAX_LEN + 50);
        assert_eq!(sanitize_title(&long).len(), TITLE_MAX_LEN);

        // Multibyte content never splits a character.
        let multibyte = "日".repeat(TITLE_MAX_LEN);
        let bounded = sanitize_title(&multibyte);
        assert!(bounded.len() <= TITLE_MAX_LEN);
        assert!(bounded.is_char_boundary(bounded.len()));
        assert!(bounded.chars().all(|c| c == '日'));
    }

    #[test]
    fn activity_out_of_range_is_literal_zero() {
        assert_eq!(sanitize_activity(-0.1), "0");
        assert_eq!(sanitize_activity(1.5), "0");
        assert_eq!(sanitize_activity(f64::NAN), "0");
    }

    #[test]
    fn activity_quantizes_and_preserves_order() {
        assert_eq!(sanitize_activity(0.0), "0");
        assert_eq!(sanitize_activity(0.31), "0.3");
        assert_eq!(sanitize_activity(0.34), "0.3");
        assert_eq!(sanitize_activity(1.0), "1");

        let mut last = -1.0f64;
        for i in 0..=100 {
            let x = i as f64 / 100.0;
            let emitted: f64 = sanitize_activity(x).parse().unwrap();
            assert!((emitted - x).abs() <= 0.1);
            assert!(emitted >= last);
            last = emitted;
        }
    }

    #[test]
    fn suspicious_queries() {
        assert!(is_suspicious_query("mail me at jane.doe@example.com"));
        assert!(is_suspicious_query("order 12345678"));
        assert!(is_suspicious_query("3f2a9c81d4e6b7a0c5d2e9f1a8b3c6d4"));
        assert!(!is_suspicious_query("weather berlin tomorrow"));
        assert!(!is_suspicious_query("route 66 map"));
    }
}
