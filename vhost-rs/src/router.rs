//! Request router for vhost-rs
//!
//! An ordered table of regular expressions. Each entry is tried against
//! `host + path` and then against `host` alone; the first entry that matches
//! wins. Registration order is therefore significant.

use regex::Regex;
use tokio::sync::RwLock;

use crate::error::{ProxyError, Result};

struct RouteEntry<H> {
    pattern: Regex,
    /// Literal text every match of `pattern` begins with
    literal: String,
    handler: H,
}

/// Routing table mapping host/path patterns to handlers
///
/// `register` takes the write lock and `dispatch` the read lock, so lookups
/// run concurrently with each other and never observe a half-applied insert.
pub struct RouteTable<H> {
    entries: RwLock<Vec<RouteEntry<H>>>,
}

/// Result of a successful dispatch
#[derive(Debug, Clone)]
pub struct RouteMatch<H> {
    /// Handler of the first matching entry
    pub handler: H,
    /// Pattern that matched
    pub pattern: String,
    /// Path prefix consumed by a path-scoped route, if any
    pub mount: Option<String>,
    /// Path to forward (request path with the mount point removed)
    pub forward_path: String,
}

impl<H: Clone> RouteTable<H> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Append a route; later routes only see requests earlier ones missed
    pub async fn register(&self, pattern: &str, handler: H) -> Result<()> {
        // Compile outside the lock so a bad pattern never holds writers up.
        let pattern = Regex::new(pattern).map_err(|e| {
            ProxyError::Config(format!("Invalid route pattern '{}': {}", pattern, e))
        })?;

        let literal = literal_prefix(pattern.as_str());

        let mut entries = self.entries.write().await;
        entries.push(RouteEntry {
            pattern,
            literal,
            handler,
        });
        Ok(())
    }

    /// Find the handler for a request
    pub async fn dispatch(&self, host: &str, path: &str) -> Result<RouteMatch<H>> {
        let entries = self.entries.read().await;
        let target = format!("{}{}", host, path);

        for entry in entries.iter() {
            if entry.pattern.is_match(&target) {
                let mount = mount_point(host, path, &entry.literal);
                let forward_path = match &mount {
                    Some(prefix) => strip_mount(path, prefix),
                    None => path.to_string(),
                };
                return Ok(RouteMatch {
                    handler: entry.handler.clone(),
                    pattern: entry.pattern.as_str().to_string(),
                    mount,
                    forward_path,
                });
            }

            if entry.pattern.is_match(host) {
                return Ok(RouteMatch {
                    handler: entry.handler.clone(),
                    pattern: entry.pattern.as_str().to_string(),
                    mount: None,
                    forward_path: path.to_string(),
                });
            }
        }

        Err(ProxyError::RouteNotFound {
            host: host.to_string(),
            path: path.to_string(),
        })
    }

    /// Number of registered routes
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Registered patterns, in match order
    pub async fn patterns(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        entries.iter().map(|e| e.pattern.as_str().to_string()).collect()
    }
}

impl<H: Clone> Default for RouteTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// Leading literal text of a route pattern.
///
/// Scanning stops at the first construct that is not a plain character, and
/// a character made optional or repeatable by a quantifier is not counted.
/// Patterns with a top-level alternation have no reliable prefix.
fn literal_prefix(pattern: &str) -> String {
    if has_top_level_alternation(pattern) {
        return String::new();
    }

    let mut literal = String::new();
    let mut chars = pattern.strip_prefix('^').unwrap_or(pattern).chars().peekable();
    while let Some(c) = chars.next() {
        let ch = match c {
            '\\' => match chars.next() {
                Some(escaped) if escaped.is_ascii_punctuation() => escaped,
                _ => break,
            },
            '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' => break,
            c => c,
        };
        match chars.peek() {
            Some('?' | '*' | '{') => break,
            Some('+') => {
                literal.push(ch);
                break;
            }
            _ => literal.push(ch),
        }
    }
    literal
}

fn has_top_level_alternation(pattern: &str) -> bool {
    let mut depth = 0usize;
    let mut in_class = false;
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => depth += 1,
            ')' if !in_class => depth = depth.saturating_sub(1),
            '|' if !in_class && depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// Path prefix a route is mounted on, taken from its literal `host/path` text.
///
/// The literal must name a host suffix and a path, the request path must
/// start with that path, and the prefix must end on a segment boundary.
/// Anything matched by wildcards stays part of the forwarded path.
fn mount_point(host: &str, path: &str, literal: &str) -> Option<String> {
    let slash = literal.find('/')?;
    let (host_part, mount) = literal.split_at(slash);
    if host_part.is_empty() || !host.ends_with(host_part) || mount == "/" {
        return None;
    }

    let rest = path.strip_prefix(mount)?;
    if mount.ends_with('/') || rest.is_empty() || rest.starts_with('/') {
        Some(mount.to_string())
    } else {
        None
    }
}

fn strip_mount(path: &str, mount: &str) -> String {
    let rest = path.strip_prefix(mount).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn table(routes: &[(&str, &'static str)]) -> RouteTable<&'static str> {
        let table = RouteTable::new();
        for (pattern, name) in routes {
            table.register(pattern, *name).await.unwrap();
        }
        table
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let table = table(&[
            (r"^www\.example\.com/blog", "blog"),
            (r"^www\.example\.com", "home"),
            (r"example\.com", "catch-all"),
        ])
        .await;

        let m = table.dispatch("www.example.com", "/blog/post1").await.unwrap();
        assert_eq!(m.handler, "blog");

        let m = table.dispatch("www.example.com", "/about").await.unwrap();
        assert_eq!(m.handler, "home");

        let m = table.dispatch("static.example.com", "/a.css").await.unwrap();
        assert_eq!(m.handler, "catch-all");
    }

    #[tokio::test]
    async fn test_registration_order_beats_specificity() {
        let table = table(&[
            (r"^www\.example\.com", "home"),
            (r"^www\.example\.com/blog", "blog"),
        ])
        .await;

        let m = table.dispatch("www.example.com", "/blog/post1").await.unwrap();
        assert_eq!(m.handler, "home");
    }

    #[tokio::test]
    async fn test_host_only_match() {
        // Anchored at the end, so it can only ever match the bare host.
        let table = table(&[(r"^go\.example\.com$", "vanity")]).await;

        let m = table.dispatch("go.example.com", "/pkg/foo").await.unwrap();
        assert_eq!(m.handler, "vanity");
        assert_eq!(m.mount, None);
        assert_eq!(m.forward_path, "/pkg/foo");
    }

    #[tokio::test]
    async fn test_path_scoped_route_strips_mount() {
        let table = table(&[(r"^www\.example\.com/blog", "blog")]).await;

        let m = table.dispatch("www.example.com", "/blog/post1").await.unwrap();
        assert_eq!(m.mount.as_deref(), Some("/blog"));
        assert_eq!(m.forward_path, "/post1");

        let m = table.dispatch("www.example.com", "/blog").await.unwrap();
        assert_eq!(m.forward_path, "/");
    }

    #[tokio::test]
    async fn test_trailing_slash_mount() {
        let table = table(&[(r"^www\.example\.com/static/", "static")]).await;

        let m = table.dispatch("www.example.com", "/static/css/site.css").await.unwrap();
        assert_eq!(m.mount.as_deref(), Some("/static/"));
        assert_eq!(m.forward_path, "/css/site.css");
    }

    #[tokio::test]
    async fn test_partial_segment_does_not_mount() {
        let table = table(&[(r"^www\.example\.com/blog", "blog")]).await;

        let m = table.dispatch("www.example.com", "/blogroll").await.unwrap();
        assert_eq!(m.mount, None);
        assert_eq!(m.forward_path, "/blogroll");
    }

    #[tokio::test]
    async fn test_host_prefix_match_does_not_mount() {
        let table = table(&[(r"^www\.example\.com", "home")]).await;

        let m = table.dispatch("www.example.com", "/a/b").await.unwrap();
        assert_eq!(m.mount, None);
        assert_eq!(m.forward_path, "/a/b");
    }

    #[tokio::test]
    async fn test_catch_all_keeps_full_path() {
        let table = table(&[(r".*", "catch-all")]).await;

        let m = table.dispatch("www.example.com", "/blog/post1").await.unwrap();
        assert_eq!(m.handler, "catch-all");
        assert_eq!(m.mount, None);
        assert_eq!(m.forward_path, "/blog/post1");
    }

    #[tokio::test]
    async fn test_wildcard_tail_strips_only_literal_prefix() {
        let table = table(&[(r"^www\.example\.com/static/.*", "static")]).await;

        let m = table.dispatch("www.example.com", "/static/css/site.css").await.unwrap();
        assert_eq!(m.mount.as_deref(), Some("/static/"));
        assert_eq!(m.forward_path, "/css/site.css");
    }

    #[tokio::test]
    async fn test_suffix_pattern_keeps_full_path() {
        let table = table(&[(r"example\.com/.*\.css$", "css")]).await;

        let m = table.dispatch("www.example.com", "/a/b/site.css").await.unwrap();
        assert_eq!(m.mount, None);
        assert_eq!(m.forward_path, "/a/b/site.css");
    }

    #[tokio::test]
    async fn test_optional_character_is_not_mounted() {
        let table = table(&[(r"^www\.example\.com/blogs?", "blog")]).await;

        let m = table.dispatch("www.example.com", "/blogs/post1").await.unwrap();
        assert_eq!(m.mount, None);
        assert_eq!(m.forward_path, "/blogs/post1");
    }

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix(r"^www\.example\.com/blog"), "www.example.com/blog");
        assert_eq!(literal_prefix(r"^www\.example\.com/static/.*"), "www.example.com/static/");
        assert_eq!(literal_prefix(r"example\.com/.*\.css$"), "example.com/");
        assert_eq!(literal_prefix(r"^www\.example\.com/blogs?"), "www.example.com/blog");
        assert_eq!(literal_prefix(r"^www\.example\.com/(a|b)"), "www.example.com/");
        assert_eq!(literal_prefix(r"^a\.com/x|^b\.com/y"), "");
        assert_eq!(literal_prefix(r".*"), "");
        assert_eq!(literal_prefix(r"^www\.example\.com/\d+"), "www.example.com/");
    }

    #[tokio::test]
    async fn test_no_match() {
        let table = table(&[(r"^www\.example\.com/blog", "blog")]).await;

        let err = table.dispatch("www.example.com", "/unknown").await.unwrap_err();
        match err {
            ProxyError::RouteNotFound { host, path } => {
                assert_eq!(host, "www.example.com");
                assert_eq!(path, "/unknown");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let table: RouteTable<&str> = RouteTable::new();
        assert!(matches!(
            table.register("^(www", "x").await,
            Err(ProxyError::Config(_))
        ));
        assert!(table.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_and_dispatch() {
        let table: Arc<RouteTable<usize>> = Arc::new(RouteTable::new());
        table.register(r"^www\.example\.com/0$", 0).await.unwrap();

        let writer = {
            let table = table.clone();
            tokio::spawn(async move {
                for i in 1..200 {
                    table
                        .register(&format!(r"^www\.example\.com/{}$", i), i)
                        .await
                        .unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let table = table.clone();
            readers.push(tokio::spawn(async move {
                for i in 0..200usize {
                    let path = format!("/{}", i);
                    // Either not registered yet or routed to exactly its own entry.
                    match table.dispatch("www.example.com", &path).await {
                        Ok(m) => assert_eq!(m.handler, i),
                        Err(ProxyError::RouteNotFound { .. }) => {}
                        Err(e) => panic!("unexpected: {}", e),
                    }
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }

        assert_eq!(table.len().await, 200);
        let patterns = table.patterns().await;
        for (i, pattern) in patterns.iter().enumerate() {
            assert_eq!(pattern, &format!(r"^www\.example\.com/{}$", i));
        }
        let m = table.dispatch("www.example.com", "/199").await.unwrap();
        assert_eq!(m.handler, 199);
    }
}
