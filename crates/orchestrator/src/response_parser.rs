//! Pulling structured content out of free-form model responses.
//!
//! Models wrap JSON and code in markdown fences, prepend chatter, or append
//! explanations. These helpers find the part that matters.

use std::sync::OnceLock;

use docflow_core::Language;
use regex::Regex;

fn fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_+-]*)[ \t]*\r?\n(.*?)```")
            .expect("Invalid fence regex pattern")
    })
}

/// A fenced block: the info string (lowercased, possibly empty) and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    pub info: String,
    pub body: String,
}

pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    fence_pattern()
        .captures_iter(text)
        .map(|caps| FencedBlock {
            info: caps
                .get(1)
                .map(|m| m.as_str().to_ascii_lowercase())
                .unwrap_or_default(),
            body: caps
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
        .collect()
}

/// Find the JSON value in a response.
///
/// Tries, in order: the whole response, `json` fences, any other fence, and
/// finally the first balanced `{...}` or `[...]` span.
pub fn extract_json(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let blocks = fenced_blocks(text);
    let ordered = blocks
        .iter()
        .filter(|b| b.info == "json")
        .chain(blocks.iter().filter(|b| b.info != "json"));
    for block in ordered {
        if let Ok(value) = serde_json::from_str(block.body.trim()) {
            return Some(value);
        }
    }

    balanced_span(trimmed).and_then(|span| serde_json::from_str(span).ok())
}

/// First balanced object or array in `text`, honoring string literals.
fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

fn language_for(info: &str) -> Option<Language> {
    match info {
        "python" | "py" | "python3" => Some(Language::Python),
        "bash" => Some(Language::Bash),
        "sh" | "shell" => Some(Language::Shell),
        _ => None,
    }
}

/// Find the program in a code generation response.
///
/// The longest fenced block with a recognized language wins; an unlabeled
/// block counts as `default`. A response without fences is taken as code
/// as-is.
pub fn extract_code(text: &str, default: Language) -> Option<(Language, String)> {
    let blocks = fenced_blocks(text);
    if blocks.is_empty() {
        let trimmed = text.trim();
        return (!trimmed.is_empty()).then(|| (default, trimmed.to_string()));
    }

    blocks
        .into_iter()
        .filter_map(|block| {
            let language = if block.info.is_empty() {
                Some(default)
            } else {
                language_for(&block.info)
            }?;
            let body = block.body.trim_end().to_string();
            (!body.trim().is_empty()).then_some((language, body))
        })
        .max_by_key(|(_, body)| body.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        assert_eq!(extract_json(r#" {"a": 1} "#), Some(json!({"a": 1})));
    }

    #[test]
    fn test_fenced_json_with_chatter() {
        let text = "Here is the data:\n```json\n{\"revenue\": \"100\"}\n```\nLet me know!";
        assert_eq!(extract_json(text), Some(json!({"revenue": "100"})));
    }

    #[test]
    fn test_embedded_json_with_braces_in_strings() {
        let text = r#"Result: {"note": "a } inside", "items": [1, 2]} trailing"#;
        assert_eq!(
            extract_json(text),
            Some(json!({"note": "a } inside", "items": [1, 2]}))
        );
    }

    #[test]
    fn test_no_json() {
        assert_eq!(extract_json("I could not find any figures."), None);
    }

    #[test]
    fn test_extract_longest_code_block() {
        let text = "Install:\n```bash\npip install openpyxl\n```\nScript:\n```python\nimport json\nprint('hi')\n```\n";
        let (language, code) = extract_code(text, Language::Python).unwrap();
        assert_eq!(language, Language::Python);
        assert_eq!(code, "import json\nprint('hi')");
    }

    #[test]
    fn test_unfenced_code_uses_default() {
        let (language, code) = extract_code("echo hi\n", Language::Shell).unwrap();
        assert_eq!(language, Language::Shell);
        assert_eq!(code, "echo hi");
        assert!(extract_code("   ", Language::Shell).is_none());
    }

    #[test]
    fn test_unknown_language_fences_ignored() {
        let text = "```text\nnot code\n```";
        assert!(extract_code(text, Language::Python).is_none());
    }
}
