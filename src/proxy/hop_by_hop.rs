//! Hop-by-hop header normalization for the plain forwarding path.

use http::header::{HeaderMap, HeaderName, CONNECTION};

/// Headers that are meaningful only for a single transport hop.
pub const HOP_BY_HOP: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "upgrade",
];

/// Remove the canonical hop-by-hop headers plus every header named by a
/// token in the message's own `Connection` header.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Collected before removal since `Connection` itself is in the set
    let dynamic: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| HeaderName::from_bytes(token.as_bytes()).ok())
        .collect();

    for name in dynamic {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_removes_canonical_set() {
        let mut headers = HeaderMap::new();
        for name in HOP_BY_HOP {
            headers.insert(name, HeaderValue::from_static("x"));
        }
        headers.insert("accept", HeaderValue::from_static("*/*"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("accept"));
    }

    #[test]
    fn test_removes_connection_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("X-Custom-Hop, close"));
        headers.append(CONNECTION, HeaderValue::from_static("x-other"));
        headers.insert("x-custom-hop", HeaderValue::from_static("1"));
        headers.insert("x-other", HeaderValue::from_static("2"));
        headers.insert("x-end-to-end", HeaderValue::from_static("3"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key(CONNECTION));
        assert!(!headers.contains_key("x-custom-hop"));
        assert!(!headers.contains_key("x-other"));
        assert_eq!(headers.get("x-end-to-end").unwrap(), "3");
    }

    #[test]
    fn test_ignores_invalid_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("bad token, , keep"));
        headers.insert("keep", HeaderValue::from_static("gone"));
        headers.insert("host", HeaderValue::from_static("example.com"));

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("keep"));
        assert!(headers.contains_key("host"));
    }
}
