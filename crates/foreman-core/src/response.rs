//! Interpretation of raw LLM stdout: error-signature detection and JSON
//! metadata extraction.

use serde_json::Value;

/// A parsed provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Whitespace-trimmed response text.
    pub text: String,
    /// Retained when the whole output parses as a JSON object.
    pub metadata: Option<Value>,
    /// True when the trimmed text begins with an error signature.
    pub has_error: bool,
}

/// Prefixes that mark a provider-reported failure. Matched
/// case-insensitively at the start of the trimmed output only;
/// occurrences in the middle of the text do not trigger.
const ERROR_PREFIXES: [&str; 2] = ["error:", "fatal:"];

/// Parse raw provider stdout.
pub fn parse_response(stdout: &str) -> ParsedResponse {
    let text = stdout.trim().to_owned();

    let metadata = serde_json::from_str::<Value>(&text)
        .ok()
        .filter(Value::is_object);

    let lowered = text
        .chars()
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    let has_error = ERROR_PREFIXES.iter().any(|p| lowered.starts_with(p));

    ParsedResponse {
        text,
        metadata,
        has_error,
    }
}

/// Extract a JSON object from response text that may wrap it in prose or a
/// fenced code block.
///
/// Used by the distributor, reviewer, and goal decomposer, whose decision
/// contracts demand a JSON object but whose providers sometimes add
/// surrounding commentary. Returns `None` when no parseable object is
/// found.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();

    // Whole output is the object.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Some(v);
        }
    }

    // Fenced code block.
    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let rest = &trimmed[start + fence.len()..];
            if let Some(end) = rest.find("```") {
                if let Ok(v) = serde_json::from_str::<Value>(rest[..end].trim()) {
                    if v.is_object() {
                        return Some(v);
                    }
                }
            }
        }
    }

    // First balanced top-level object.
    let bytes = trimmed.as_bytes();
    let open = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return serde_json::from_str::<Value>(&trimmed[open..=i])
                        .ok()
                        .filter(Value::is_object);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_whitespace() {
        let parsed = parse_response("  done\n\n");
        assert_eq!(parsed.text, "done");
        assert!(!parsed.has_error);
        assert!(parsed.metadata.is_none());
    }

    #[test]
    fn detects_error_prefix_case_insensitive() {
        assert!(parse_response("Error: model overloaded").has_error);
        assert!(parse_response("FATAL: out of context").has_error);
        assert!(parse_response("  error: lowercase too").has_error);
    }

    #[test]
    fn mid_text_error_does_not_trigger() {
        let parsed = parse_response("The previous Error: was handled.");
        assert!(!parsed.has_error);
    }

    #[test]
    fn json_object_retained_as_metadata() {
        let parsed = parse_response(r#"{"summary": "ok", "files": 3}"#);
        assert!(parsed.metadata.is_some());
        assert_eq!(parsed.metadata.unwrap()["files"], 3);
    }

    #[test]
    fn json_array_is_not_metadata() {
        let parsed = parse_response(r#"[1, 2, 3]"#);
        assert!(parsed.metadata.is_none());
    }

    #[test]
    fn extract_bare_object() {
        let v = extract_json_object(r#"{"action": "complete"}"#).unwrap();
        assert_eq!(v["action"], "complete");
    }

    #[test]
    fn extract_from_fenced_block() {
        let text = "Here is my decision:\n```json\n{\"action\": \"rework\"}\n```\nThanks.";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["action"], "rework");
    }

    #[test]
    fn extract_from_surrounding_prose() {
        let text = "I think {\"action\": \"add_tasks\", \"newTasks\": []} covers it.";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["action"], "add_tasks");
    }

    #[test]
    fn extract_handles_braces_in_strings() {
        let text = r#"{"reasoning": "use fn main() { }", "action": "complete"}"#;
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["action"], "complete");
    }

    #[test]
    fn extract_none_when_no_object() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("[1, 2]").is_none());
    }
}
