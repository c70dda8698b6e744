//! Request fingerprints.
//!
//! Two requests that the upstream would answer identically must map to the
//! same fingerprint. The canonical form is
//!
//! ```text
//! METHOD \n PATH \n QUERY
//! ```
//!
//! where `METHOD` is upper-cased (`HEAD` folds into `GET`), `PATH` has
//! duplicate slashes collapsed, `.` and `..` segments resolved without
//! climbing above the root and no trailing slash, and `QUERY` holds the
//! non-ignored pairs sorted and form-encoded. The fingerprint is the
//! lowercase hex SHA-256 of that text.

use std::fmt;

use sha2::{Digest, Sha256};
use url::form_urlencoded;

/// Hex SHA-256 identifying a normalized request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A request reduced to the parts that select the upstream answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    method: String,
    path: String,
    query: String,
}

impl NormalizedRequest {
    /// Normalize `method`, raw `path` and raw `query`, dropping query keys
    /// listed in `ignored`.
    pub fn new<S: AsRef<str>>(method: &str, path: &str, query: Option<&str>, ignored: &[S]) -> Self {
        let method = match method.trim().to_ascii_uppercase().as_str() {
            "HEAD" => "GET".to_string(),
            other => other.to_string(),
        };

        Self {
            method,
            path: normalize_path(path),
            query: normalize_query(query.unwrap_or_default(), ignored),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Canonical `path?query` forwarded upstream.
    pub fn path_and_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.path.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.query.as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

/// Whether `path` carries a `..` segment, plain or percent-encoded.
pub fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\'])
        .any(|segment| dot_segment(segment) == Some(DotSegment::Parent))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DotSegment {
    Current,
    Parent,
}

/// URL parsers treat `%2e` as a dot, so the encoded forms count too.
fn dot_segment(segment: &str) -> Option<DotSegment> {
    match segment.to_ascii_lowercase().replace("%2e", ".").as_str() {
        "." => Some(DotSegment::Current),
        ".." => Some(DotSegment::Parent),
        _ => None,
    }
}

fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']).filter(|s| !s.is_empty()) {
        match dot_segment(segment) {
            Some(DotSegment::Current) => {}
            Some(DotSegment::Parent) => {
                segments.pop();
            }
            None => segments.push(segment),
        }
    }
    format!("/{}", segments.join("/"))
}

fn normalize_query<S: AsRef<str>>(query: &str, ignored: &[S]) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| !key.is_empty())
        .filter(|(key, _)| !ignored.iter().any(|i| i.as_ref() == key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    fn fp(method: &str, path: &str, query: Option<&str>) -> Fingerprint {
        NormalizedRequest::new(method, path, query, NONE).fingerprint()
    }

    #[test]
    fn test_query_order_does_not_matter() {
        assert_eq!(
            fp("GET", "/getquote", Some("scripcode=500325&seg=eq")),
            fp("GET", "/getquote", Some("seg=eq&scripcode=500325")),
        );
    }

    #[test]
    fn test_path_normalization() {
        let canonical = fp("GET", "/market/quote", None);
        assert_eq!(fp("GET", "market/quote", None), canonical);
        assert_eq!(fp("GET", "//market///quote/", None), canonical);
        assert_eq!(NormalizedRequest::new("GET", "", None, NONE).path(), "/");
        assert_eq!(NormalizedRequest::new("GET", "///", None, NONE).path(), "/");
    }

    #[test]
    fn test_dot_segments_resolve() {
        let canonical = fp("GET", "/getquote", None);
        assert_eq!(fp("GET", "/quote/../getquote", None), canonical);
        assert_eq!(fp("GET", "/./getquote/.", None), canonical);
        assert_eq!(fp("GET", "/quote/%2E%2e/getquote", None), canonical);
        assert_eq!(fp("GET", "/quote\\..\\getquote", None), canonical);

        let escaped = NormalizedRequest::new("GET", "/../../secret", Some("a=1"), NONE);
        assert_eq!(escaped.path_and_query(), "/secret?a=1");
        assert_eq!(NormalizedRequest::new("GET", "/..", None, NONE).path(), "/");
        assert_eq!(NormalizedRequest::new("GET", "/a..b/.c", None, NONE).path(), "/a..b/.c");
    }

    #[test]
    fn test_parent_segment_detection() {
        assert!(has_parent_segment("/../secret"));
        assert!(has_parent_segment("/quote/%2e%2E/x"));
        assert!(has_parent_segment("/quote\\..\\x"));
        assert!(!has_parent_segment("/quote/./x"));
        assert!(!has_parent_segment("/a..b/..c"));
    }

    #[test]
    fn test_method_case_and_head() {
        let get = fp("GET", "/x", None);
        assert_eq!(fp("get", "/x", None), get);
        assert_eq!(fp("HEAD", "/x", None), get);
        assert_ne!(fp("POST", "/x", None), get);
    }

    #[test]
    fn test_ignored_params_dropped() {
        let ignored = ["_", "utm_source"];
        let a = NormalizedRequest::new("GET", "/q", Some("a=1&_=1712&utm_source=x"), &ignored[..]);
        let b = NormalizedRequest::new("GET", "/q", Some("a=1"), &ignored[..]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.path_and_query(), "/q?a=1");
    }

    #[test]
    fn test_distinct_values_distinct_fingerprints() {
        assert_ne!(fp("GET", "/q", Some("a=1")), fp("GET", "/q", Some("a=2")));
        assert_ne!(fp("GET", "/q", Some("a=1")), fp("GET", "/q", None));
        assert_ne!(fp("GET", "/a", None), fp("GET", "/b", None));
    }

    #[test]
    fn test_encoding_is_canonical() {
        let a = NormalizedRequest::new("GET", "/s", Some("name=tata%20motors&empty=&=orphan"), NONE);
        let b = NormalizedRequest::new("GET", "/s", Some("empty&name=tata+motors"), NONE);
        assert_eq!(a.query(), "empty=&name=tata+motors");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let f = fp("GET", "/", None);
        assert_eq!(f.as_str().len(), 64);
        assert!(f.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
