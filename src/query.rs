//! Canonical resource paths and query strings.

use std::collections::BTreeMap;

/// Query parameters, kept sorted by name.
pub type Query = BTreeMap<String, String>;

/// Percent-escape an object key for use as a URL path.
///
/// Every byte outside the unreserved set (`A-Z a-z 0-9 - _ . ~`) is escaped,
/// except `/`, which separates segments and is preserved.
pub fn escape_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// True when a `/`-separated segment of `path` is `.` or `..`.
///
/// Such segments are collapsed by URL parsing in either literal or
/// percent-encoded form, so the request would address a different key.
pub fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| segment == "." || segment == "..")
}

/// Encode `query` as `name=value` pairs joined by `&`, sorted by name.
///
/// This is also the canonical query string used for signing.
pub fn encode_query(query: &Query) -> String {
    query
        .iter()
        .map(|(name, value)| format!("{}={}", urlencoding::encode(name), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build `"/" + escape(path) + ("?" + query)`.
///
/// `version_id`, when given, is added as the `versionId` parameter.
pub fn resource_path(path: &str, query: &Query, version_id: Option<&str>) -> String {
    let mut resource = format!("/{}", escape_path(path));

    let encoded = match version_id {
        Some(version) => {
            let mut query = query.clone();
            query.insert("versionId".to_string(), version.to_string());
            encode_query(&query)
        }
        None => encode_query(query),
    };

    if !encoded.is_empty() {
        resource.push('?');
        resource.push_str(&encoded);
    }
    resource
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(pairs: &[(&str, &str)]) -> Query {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_plain_key() {
        assert_eq!(resource_path("file.txt", &Query::new(), None), "/file.txt");
    }

    #[test]
    fn test_slashes_preserved_and_reserved_escaped() {
        assert_eq!(
            resource_path("dir/sub dir/a+b=c&d.txt", &Query::new(), None),
            "/dir/sub%20dir/a%2Bb%3Dc%26d.txt"
        );
        assert_eq!(escape_path("ünï/cödé"), "%C3%BCn%C3%AF/c%C3%B6d%C3%A9");
    }

    #[test]
    fn test_dot_segments_detected() {
        assert!(has_dot_segment("logs/../secret.txt"));
        assert!(has_dot_segment("./key"));
        assert!(has_dot_segment("dir/.."));
        assert!(!has_dot_segment("logs/..hidden/.env"));
        assert!(!has_dot_segment("a.b/c...d"));
        assert!(!has_dot_segment(""));
    }

    #[test]
    fn test_empty_path_is_root() {
        assert_eq!(resource_path("", &query(&[("location", "")]), None), "/?location=");
    }

    #[test]
    fn test_query_sorted_and_encoded() {
        let q = query(&[("prefix", "a b/"), ("marker", "k&1"), ("max-keys", "10")]);
        assert_eq!(
            resource_path("", &q, None),
            "/?marker=k%261&max-keys=10&prefix=a%20b%2F"
        );
    }

    #[test]
    fn test_version_id_added() {
        let q = query(&[("tagging", "")]);
        assert_eq!(
            resource_path("key", &q, Some("v1+/=")),
            "/key?tagging=&versionId=v1%2B%2F%3D"
        );
        // the caller's mapping is untouched
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_idempotent() {
        let q = query(&[("uploadId", "abc"), ("partNumber", "3")]);
        let first = resource_path("big/object.bin", &q, Some("v"));
        let second = resource_path("big/object.bin", &q, Some("v"));
        assert_eq!(first, second);
        assert_eq!(first, "/big/object.bin?partNumber=3&uploadId=abc&versionId=v");
    }
}
