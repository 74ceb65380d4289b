//! Shared utility functions.

use std::path::Path;

use sha2::{Digest, Sha256};

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object; braces inside
/// string literals are skipped.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// Strip a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().skip(1).collect();
    if lines.last().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.pop();
    }
    lines.join("\n")
}

/// Hex-encoded SHA-256 of a file's contents, with its size in bytes.
pub fn file_digest(path: &Path) -> std::io::Result<(String, u64)> {
    let bytes = std::fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    Ok((hex::encode(digest), bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"{"code": "d = {'a': 1}", "n": "}"} rest"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"code": "d = {'a': 1}", "n": "}"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_strip_code_fence() {
        let fenced = "```python\nresult = 1\n```";
        assert_eq!(strip_code_fence(fenced), "result = 1");
        assert_eq!(strip_code_fence("  result = 2 "), "result = 2");
    }

    #[test]
    fn test_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "abc").unwrap();
        let (digest, bytes) = file_digest(&path).unwrap();
        assert_eq!(bytes, 3);
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
