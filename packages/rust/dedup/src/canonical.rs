//! URL canonicalization for the canonical-URL match layer.

use url::Url;
use url::form_urlencoded;

/// Query parameters that only carry tracking data.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "yclid", "igshid", "mc_cid", "mc_eid", "ref",
    "ref_src", "_hsenc", "_hsmi",
];

fn is_tracking_param(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("utm_") || TRACKING_PARAMS.contains(&name.as_str())
}

/// Reduce a URL to a comparison key.
///
/// The key has no scheme, no `www.` prefix, no fragment, no default port,
/// a lower-cased host and path without trailing slash, and only the
/// non-tracking query parameters in sorted order:
///
/// `HTTP://WWW.Example.com/Tool/?utm_source=x&b=2&a=1#top` → `example.com/tool?a=1&b=2`
///
/// Strings that do not parse as absolute URLs fall back to a lower-cased,
/// scheme-stripped form so that `example.com/tool` still equals
/// `https://example.com/tool`.
pub fn canonical_url(raw: &str) -> String {
    let raw = raw.trim();
    let Some(url) = Url::parse(raw).ok().filter(|u| u.host_str().is_some()) else {
        return fallback(raw);
    };

    let mut key = host_of(&url);
    if let Some(port) = url.port() {
        key.push(':');
        key.push_str(&port.to_string());
    }

    let path = url.path().trim_end_matches('/').to_lowercase();
    key.push_str(&path);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    if !params.is_empty() {
        params.sort();
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();
        key.push('?');
        key.push_str(&query);
    }

    key
}

/// Lower-cased host without a leading `www.`, or `None` for unparsable URLs.
pub fn host(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    url.host_str()?;
    Some(host_of(&url))
}

fn host_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}

fn fallback(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let without_fragment = lower.split('#').next().unwrap_or_default();
    let without_scheme = without_fragment
        .split_once("://")
        .map_or(without_fragment, |(_, rest)| rest);
    let without_www = without_scheme.strip_prefix("www.").unwrap_or(without_scheme);
    without_www.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_and_trailing_slash_are_ignored() {
        assert_eq!(
            canonical_url("http://example.com/tool/"),
            canonical_url("https://example.com/tool")
        );
        assert_eq!(canonical_url("https://example.com/tool"), "example.com/tool");
    }

    #[test]
    fn host_case_and_www_are_ignored() {
        assert_eq!(
            canonical_url("https://WWW.Example.COM/Docs"),
            "example.com/docs"
        );
    }

    #[test]
    fn tracking_params_are_dropped_and_rest_sorted() {
        assert_eq!(
            canonical_url("https://example.com/p?utm_source=x&b=2&fbclid=abc&a=1"),
            "example.com/p?a=1&b=2"
        );
        assert_eq!(
            canonical_url("https://example.com/p?utm_campaign=launch&ref=hn"),
            "example.com/p"
        );
    }

    #[test]
    fn fragment_and_default_port_are_dropped() {
        assert_eq!(
            canonical_url("https://example.com:443/guide#install"),
            "example.com/guide"
        );
        assert_eq!(
            canonical_url("http://localhost:8080/api/"),
            "localhost:8080/api"
        );
    }

    #[test]
    fn root_url_has_no_path() {
        assert_eq!(canonical_url("https://github.com/"), "github.com");
    }

    #[test]
    fn unparsable_input_falls_back() {
        assert_eq!(canonical_url("Example.com/Tool/"), "example.com/tool");
        assert_eq!(
            canonical_url("example.com/tool"),
            canonical_url("https://example.com/tool")
        );
    }

    #[test]
    fn host_extraction() {
        assert_eq!(
            host("https://www.GitHub.com/rust-lang/rust").as_deref(),
            Some("github.com")
        );
        assert_eq!(host("not a url"), None);
    }
}
