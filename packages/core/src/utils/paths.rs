//! Path helpers
//!
//! The source tree addresses nodes with slash-separated paths. Everything
//! below a `jcr:content` segment belongs to the page above it: the page path
//! and the sub path together identify a mirrored row.

/// Segment that separates a page from the content stored inside it
pub const CONTENT_BOUNDARY: &str = "jcr:content";

/// Page path of a source path: everything before `/jcr:content`
pub fn page_path(path: &str) -> &str {
    match boundary_index(path) {
        Some(idx) => &path[..idx],
        None => path,
    }
}

/// Sub path of a source path: `jcr:content` and everything below it, or `""`
pub fn sub_path(path: &str) -> &str {
    match boundary_index(path) {
        Some(idx) => &path[idx + 1..],
        None => "",
    }
}

/// Site a path belongs to: its first two segments (`/content/site`)
pub fn site_path(path: &str) -> &str {
    leading_segments(path, 2)
}

/// Two-level prefix used for progress markers during long traversals
pub fn progress_prefix(path: &str) -> &str {
    leading_segments(path, 2)
}

/// Last segment of a path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Parent of a plain path, `None` for `/`, `""` and top-level paths
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(idx) => Some(&trimmed[..idx]),
    }
}

/// Identity `(path, sub)` of the logical parent of the row `(path, sub)`
///
/// Inside a page the parent is the enclosing sub node; the `jcr:content`
/// node belongs to its page; a page belongs to the page above it.
pub fn parent_identity(path: &str, sub: &str) -> Option<(String, String)> {
    if !sub.is_empty() {
        return match sub.rfind('/') {
            Some(idx) => Some((path.to_string(), sub[..idx].to_string())),
            None => Some((path.to_string(), String::new())),
        };
    }

    parent_path(path).map(|parent| (parent.to_string(), String::new()))
}

/// Whether `path` is `prefix` itself or lies below it
pub fn is_same_or_descendant(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

fn boundary_index(path: &str) -> Option<usize> {
    let needle = format!("/{}", CONTENT_BOUNDARY);
    path.match_indices(&needle)
        .map(|(idx, _)| idx)
        .find(|idx| {
            let end = idx + needle.len();
            end == path.len() || path[end..].starts_with('/')
        })
}

fn leading_segments(path: &str, count: usize) -> &str {
    let mut seen = 0;
    for (idx, ch) in path.char_indices().skip(1) {
        if ch == '/' {
            seen += 1;
            if seen == count {
                return &path[..idx];
            }
        }
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_and_sub_path() {
        let path = "/content/uoa/home/jcr:content/par/text";
        assert_eq!(page_path(path), "/content/uoa/home");
        assert_eq!(sub_path(path), "jcr:content/par/text");

        assert_eq!(page_path("/content/uoa/home"), "/content/uoa/home");
        assert_eq!(sub_path("/content/uoa/home"), "");

        assert_eq!(page_path("/content/uoa/home/jcr:content"), "/content/uoa/home");
        assert_eq!(sub_path("/content/uoa/home/jcr:content"), "jcr:content");
    }

    #[test]
    fn test_boundary_must_be_a_whole_segment() {
        let path = "/content/uoa/jcr:contentious";
        assert_eq!(page_path(path), path);
        assert_eq!(sub_path(path), "");
    }

    #[test]
    fn test_site_path() {
        assert_eq!(site_path("/content/uoa/home/about"), "/content/uoa");
        assert_eq!(site_path("/content/uoa"), "/content/uoa");
        assert_eq!(site_path("/content"), "/content");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/content/a/b"), Some("/content/a"));
        assert_eq!(parent_path("/content"), None);
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_parent_identity() {
        assert_eq!(
            parent_identity("/content/a", "jcr:content/par"),
            Some(("/content/a".to_string(), "jcr:content".to_string()))
        );
        assert_eq!(
            parent_identity("/content/a", "jcr:content"),
            Some(("/content/a".to_string(), String::new()))
        );
        assert_eq!(
            parent_identity("/content/a", ""),
            Some(("/content".to_string(), String::new()))
        );
        assert_eq!(parent_identity("/content", ""), None);
    }

    #[test]
    fn test_descendant_check_respects_segments() {
        assert!(is_same_or_descendant("/content/a", "/content/a"));
        assert!(is_same_or_descendant("/content/a/b", "/content/a"));
        assert!(!is_same_or_descendant("/content/ab", "/content/a"));
        assert!(is_same_or_descendant("/content/a/b", "/content/"));
    }

    #[test]
    fn test_node_name_and_progress_prefix() {
        assert_eq!(node_name("/content/a/b"), "b");
        assert_eq!(progress_prefix("/content/site/deep/page"), "/content/site");
    }
}
