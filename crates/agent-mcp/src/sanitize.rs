//! Redaction of filesystem paths and stack frames from outbound error text.
//!
//! Any string that may reach a peer inside a JSON-RPC error goes through
//! [`sanitize_message`] first.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static STACK_FRAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)[ \t]*\n?[ \t]*\bat\s+[^\n]*?:\d+:\d+\)?").unwrap());
static SOURCE_LOCATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[^\s()'"\[\]]+:\d+:\d+"#).unwrap());
// A URI authority is kept as is; any run of two or more path segments is a path.
static NESTED_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?P<authority>\b[a-z][a-z0-9+.-]*://[a-z0-9._~-]*)|(?:~|\.{1,2})?(?:/+[^/\s'"()\[\]{}<>|,;]+){2,}"#,
    )
    .unwrap()
});
// A single segment counts as a path unless it continues a word or a URI.
static UNIX_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(^|[^A-Za-z0-9_.~/-])((?:~|\.{1,2})?/[^/\s'"()\[\]{}<>|,;]+)"#).unwrap()
});
static WINDOWS_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(?:\b[a-z]:[\\/]|\\\\)[^\s'"]*"#).unwrap());
static FILE_URI: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)\bfile:/[^\s'"]*"#).unwrap());

const PATH_PLACEHOLDER: &str = "<path>";
const LOCATION_PLACEHOLDER: &str = "<location>";

/// Strip stack frames, source locations and filesystem paths from `message`.
///
/// Control characters other than spaces are collapsed so that a hostile
/// method name cannot smuggle extra lines into logs or SSE frames.
///
/// ```
/// use agent_mcp::sanitize::sanitize_message;
///
/// let cleaned = sanitize_message("cannot read /etc/agent/secret.key");
/// assert_eq!(cleaned, "cannot read <path>");
/// ```
pub fn sanitize_message(message: &str) -> String {
    let without_frames = STACK_FRAME.replace_all(message, "");
    let without_locations = SOURCE_LOCATION.replace_all(&without_frames, LOCATION_PLACEHOLDER);
    let without_uris = FILE_URI.replace_all(&without_locations, PATH_PLACEHOLDER);
    let without_windows = WINDOWS_PATH.replace_all(&without_uris, PATH_PLACEHOLDER);
    let without_nested = NESTED_PATH.replace_all(&without_windows, |caps: &Captures<'_>| {
        match caps.name("authority") {
            Some(authority) => authority.as_str().to_string(),
            None => PATH_PLACEHOLDER.to_string(),
        }
    });
    let without_paths = UNIX_PATH.replace_all(&without_nested, format!("${{1}}{PATH_PLACEHOLDER}"));

    without_paths
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Keep at most the last `max_bytes` bytes of `text`, on a char boundary.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_unix_paths_are_redacted() {
        assert_eq!(
            sanitize_message("open failed: /home/dev/.config/agent.toml"),
            "open failed: <path>"
        );
        assert_eq!(sanitize_message("see ~/projects/x"), "see <path>");
        assert_eq!(sanitize_message("path='../../etc/passwd'"), "path='<path>'");
    }

    #[test]
    fn test_windows_paths_are_redacted() {
        assert_eq!(
            sanitize_message(r"denied C:\Users\dev\agent\key.pem"),
            "denied <path>"
        );
    }

    #[test]
    fn test_file_uris_are_redacted() {
        assert_eq!(
            sanitize_message("Resource not found: file:///etc/passwd"),
            "Resource not found: <path>"
        );
    }

    #[test]
    fn test_stack_frames_are_removed() {
        let raw = "Error: boom\n    at run (/srv/app/runner.js:42:13)\n    at main (index.js:1:1)";
        assert_eq!(sanitize_message(raw), "Error: boom");
    }

    #[test]
    fn test_rust_panic_location_is_redacted() {
        let cleaned = sanitize_message("panicked at crates/runner/src/lib.rs:10:5");
        assert!(!cleaned.contains("lib.rs"));
    }

    #[test]
    fn test_method_names_and_uris_survive() {
        assert_eq!(sanitize_message("Method not found: tools/run"), "Method not found: tools/run");
        assert_eq!(
            sanitize_message("Resource not found: mcp://executions/exec_1"),
            "Resource not found: mcp://executions/exec_1"
        );
    }

    #[test]
    fn test_paths_after_any_delimiter_are_redacted() {
        assert_eq!(sanitize_message("xy:/etc/passwd"), "xy:<path>");
        assert_eq!(sanitize_message("a|/home/alice/.ssh/id_rsa"), "a|<path>");
        assert_eq!(sanitize_message("{/var/lib/secret/key}"), "{<path>}");
        assert_eq!(sanitize_message("name</etc/shadow>"), "name<<path>>");
        assert_eq!(sanitize_message("user@/srv/keys"), "user@<path>");
        assert_eq!(sanitize_message("word/etc/passwd"), "word<path>");
        assert_eq!(sanitize_message("a/b//c"), "a<path>");
    }

    #[test]
    fn test_uri_authority_kept_but_path_redacted() {
        assert_eq!(
            sanitize_message("Resource not found: mcp://x|/etc/passwd"),
            "Resource not found: mcp://x|<path>"
        );
        assert_eq!(
            sanitize_message("Resource not found: mcp://nope/etc/passwd"),
            "Resource not found: mcp://nope<path>"
        );
    }

    #[test]
    fn test_control_characters_collapse() {
        assert_eq!(sanitize_message("bad\u{0}name\r\nnext"), "bad name  next");
    }

    #[test]
    fn test_tail_respects_char_boundary() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("héllo", 4), "llo");
    }

    proptest! {
        #[test]
        fn prop_no_absolute_path_survives(
            prefix in "[a-z ]{0,12}",
            segments in prop::collection::vec("[a-z0-9_]{1,8}", 1..5),
        ) {
            let path = format!("/{}", segments.join("/"));
            let cleaned = sanitize_message(&format!("{prefix} {path}"));
            prop_assert!(!cleaned.contains(&path));
        }

        #[test]
        fn prop_no_nested_path_survives_any_prefix(
            prefix in "[a-z]{0,6}[:|{<>@!]?",
            segments in prop::collection::vec("[a-z0-9_.]{1,8}", 2..5),
        ) {
            let path = format!("/{}", segments.join("/"));
            let cleaned = sanitize_message(&format!("{prefix}{path}"));
            prop_assert!(!cleaned.contains(&path), "{cleaned}");
        }

        #[test]
        fn prop_no_stack_frame_survives(
            func in "[a-zA-Z_]{1,10}",
            line in 1u32..10_000,
            col in 1u32..200,
        ) {
            let raw = format!("failure\n    at {func} (worker.js:{line}:{col})");
            let cleaned = sanitize_message(&raw);
            let needle = format!(":{line}:{col}");
            prop_assert!(!cleaned.contains(&needle));
        }
    }
}
