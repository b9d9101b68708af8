use url::Url;

/// Normalize a URL so equivalent spellings map onto one work-queue row.
///
/// Scheme and host are lowercased by the parser, default ports are dropped,
/// query parameters are sorted by key (stable, so repeated keys keep their
/// order), the fragment is stripped and trailing slashes are removed except
/// for the root path.
pub fn normalize_url(raw: &str) -> Result<String, url::ParseError> {
    let mut normalized = Url::parse(raw.trim())?;

    // Remove default ports
    if let Some(port) = normalized.port() {
        if (normalized.scheme() == "http" && port == 80)
            || (normalized.scheme() == "https" && port == 443)
        {
            let _ = normalized.set_port(None);
        }
    }

    // Remove trailing slash, keeping the root path intact
    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        normalized.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    }

    // Sort query parameters by key
    let mut params: Vec<(String, String)> = normalized
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if params.is_empty() {
        normalized.set_query(None);
    } else {
        params.sort_by(|a, b| a.0.cmp(&b.0));
        normalized.query_pairs_mut().clear().extend_pairs(params);
    }

    normalized.set_fragment(None);

    Ok(normalized.to_string())
}

/// Resolve an href found on `base` into an absolute http(s) URL.
pub fn resolve_href(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return None;
    }

    let resolved = base.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(resolved),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        // Host case
        assert_eq!(
            normalize_url("https://EXAMPLE.com/path").unwrap(),
            "https://example.com/path"
        );

        // Default ports
        assert_eq!(
            normalize_url("https://example.com:443/path").unwrap(),
            "https://example.com/path"
        );
        assert_eq!(
            normalize_url("http://example.com:8080/path").unwrap(),
            "http://example.com:8080/path"
        );

        // Root keeps its slash, deeper paths lose it
        assert_eq!(normalize_url("https://example.com").unwrap(), "https://example.com/");
        assert_eq!(
            normalize_url("https://example.com/listing/42/").unwrap(),
            "https://example.com/listing/42"
        );

        // Query ordering
        assert_eq!(
            normalize_url("https://example.com/search?b=2&a=1").unwrap(),
            "https://example.com/search?a=1&b=2"
        );

        // Fragment
        assert_eq!(
            normalize_url("https://example.com/page#section").unwrap(),
            "https://example.com/page"
        );

        // Empty query marker is dropped
        assert_eq!(
            normalize_url("https://example.com/page?").unwrap(),
            "https://example.com/page"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = [
            "HTTPS://Example.com:443/a/b/?z=1&y=2#frag",
            "http://example.com/search?q=piso+madrid&page=2",
            "https://example.com/",
            "https://example.com/x?k=2&k=1",
        ];

        for input in inputs {
            let once = normalize_url(input).unwrap();
            let twice = normalize_url(&once).unwrap();
            assert_eq!(once, twice, "normalization of {input} is not stable");
        }
    }

    #[test]
    fn test_equivalent_forms_collapse() {
        let a = normalize_url("https://Example.com:443/flat/1/?b=2&a=1#photos").unwrap();
        let b = normalize_url("https://example.com/flat/1?a=1&b=2").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_resolve_href() {
        let base = Url::parse("https://example.com/list/page-2").unwrap();

        assert_eq!(
            resolve_href(&base, "/item/7").map(|u| u.to_string()),
            Some("https://example.com/item/7".to_string())
        );
        assert_eq!(
            resolve_href(&base, "item/8").map(|u| u.to_string()),
            Some("https://example.com/list/item/8".to_string())
        );
        assert_eq!(
            resolve_href(&base, "//cdn.example.com/x").map(|u| u.to_string()),
            Some("https://cdn.example.com/x".to_string())
        );
        assert!(resolve_href(&base, "javascript:void(0)").is_none());
        assert!(resolve_href(&base, "mailto:agent@example.com").is_none());
        assert!(resolve_href(&base, "").is_none());
    }
}
