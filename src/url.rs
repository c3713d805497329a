//! URL and path helpers.
//!
//! Replica file names come in three shapes: full URLs
//! (`scheme://host:port/path?query`), the compact `host:/path` form used for
//! disk replicas, and plain paths. [`Url`] parses all three and keeps the
//! query as an [`Extensible`] bag.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::extensible::Extensible;

/// A parsed URL.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Url {
    /// Scheme, empty when absent.
    pub scheme: String,
    /// Host name, empty when absent.
    pub domain: String,
    /// Port, 0 when absent.
    pub port: u16,
    /// Path component.
    pub path: String,
    /// Query parameters.
    pub query: Extensible,
}

impl Url {
    /// Parse from text. Never fails: unrecognized input ends up in `path`.
    pub fn parse(url: &str) -> Url {
        let mut out = Url::default();
        let mut rest = url;

        if let Some(idx) = rest.find("://") {
            out.scheme = rest[..idx].to_string();
            rest = &rest[idx + 3..];
            let authority_end = rest.find('/').unwrap_or(rest.len());
            out.set_authority(&rest[..authority_end]);
            rest = &rest[authority_end..];
        } else if let Some(idx) = rest.find(':') {
            // host:/path replica form; a colon after the first slash is part
            // of the path.
            let slash = rest.find('/').unwrap_or(rest.len());
            if idx < slash {
                out.domain = rest[..idx].to_string();
                rest = &rest[idx + 1..];
            }
        }

        if let Some(q) = rest.find('?') {
            out.path = rest[..q].to_string();
            out.query_from_string(&rest[q + 1..]);
        } else {
            out.path = rest.to_string();
        }
        out
    }

    fn set_authority(&mut self, authority: &str) {
        match authority.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(p) => {
                    self.domain = host.to_string();
                    self.port = p;
                }
                Err(_) => self.domain = authority.to_string(),
            },
            None => self.domain = authority.to_string(),
        }
    }

    /// Render the query parameters as `k=v&k=v`.
    pub fn query_to_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.query.iter() {
            if !out.is_empty() {
                out.push('&');
            }
            out.push_str(key);
            out.push('=');
            match value {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out
    }

    /// Parse `k=v&k=v` into the query bag.
    pub fn query_from_string(&mut self, query: &str) {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((k, v)) => self.query.set(k, v),
                None => self.query.set(pair, ""),
            }
        }
    }

    /// Split a path into its components, dropping empty ones.
    pub fn split_path(path: &str) -> Vec<String> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Build an absolute path from components.
    pub fn join_path(components: &[String]) -> String {
        let mut out = String::new();
        for c in components {
            out.push('/');
            out.push_str(c);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Collapse duplicate slashes and strip the trailing one (except for "/").
    pub fn normalize_path(path: &str) -> String {
        let absolute = path.starts_with('/');
        let components = Url::split_path(path);
        if components.is_empty() {
            return if absolute { "/".to_string() } else { String::new() };
        }
        let joined = components.join("/");
        if absolute {
            format!("/{joined}")
        } else {
            joined
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}://", self.scheme)?;
        }
        f.write_str(&self.domain)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        } else if !self.domain.is_empty() && self.scheme.is_empty() {
            // compact host:/path form
            f.write_str(":")?;
        }
        f.write_str(&self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query_to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_url() {
        let url = Url::parse("https://disk01.cern.ch:8446/pool01/f?token=abc&mode=r");
        assert_eq!(url.scheme, "https");
        assert_eq!(url.domain, "disk01.cern.ch");
        assert_eq!(url.port, 8446);
        assert_eq!(url.path, "/pool01/f");
        assert_eq!(url.query.get_string("token").unwrap(), "abc");
        assert_eq!(url.query.get_string("mode").unwrap(), "r");
    }

    #[test]
    fn test_parse_replica_form() {
        let url = Url::parse("disk01:/pool01/data/f");
        assert_eq!(url.scheme, "");
        assert_eq!(url.domain, "disk01");
        assert_eq!(url.path, "/pool01/data/f");
    }

    #[test]
    fn test_parse_plain_path() {
        let url = Url::parse("/dteam/2026/f");
        assert_eq!(url.domain, "");
        assert_eq!(url.path, "/dteam/2026/f");
    }

    #[test]
    fn test_display_round_trip() {
        for text in [
            "https://disk01.cern.ch:8446/pool01/f",
            "disk01:/pool01/data/f",
            "/dteam/2026/f",
        ] {
            assert_eq!(Url::parse(text).to_string(), text);
        }
    }

    #[test]
    fn test_split_and_join() {
        let components = Url::split_path("/a//b/c/");
        assert_eq!(components, vec!["a", "b", "c"]);
        assert_eq!(Url::join_path(&components), "/a/b/c");
        assert_eq!(Url::join_path(&[]), "/");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(Url::normalize_path("//a///b/"), "/a/b");
        assert_eq!(Url::normalize_path("a//b"), "a/b");
        assert_eq!(Url::normalize_path("///"), "/");
    }
}
