//! JSON extraction ladder for LLM replies.
//!
//! Models wrap JSON in prose, code fences, or reasoning preambles.
//! Extraction tries, in order: strict parse, fenced-code-block, and a
//! balanced-brace scan over the raw text. All strategies failing means
//! the reply is unusable — a protocol error for the caller.

use regex::Regex;
use serde_json::Value;

use lf_domain::{Error, Result};

/// Pull a JSON object out of free-form model output.
pub fn extract_json(text: &str) -> Result<Value> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Protocol("empty reply".into()));
    }

    // 1. Strict parse.
    if text.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    // 2. Fenced code block (```json ... ```).
    if let Some(value) = fenced_block(text) {
        return Ok(value);
    }

    // 3. Balanced-brace scan from the first `{`.
    if let Some(value) = balanced_object(text) {
        return Ok(value);
    }

    let preview: String = text.chars().take(80).collect();
    Err(Error::Protocol(format!(
        "no JSON object found in reply: {preview}…"
    )))
}

fn fenced_block(text: &str) -> Option<Value> {
    // Compiled per call; extraction only runs a handful of times per turn.
    let re = Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").ok()?;
    let caps = re.captures(text)?;
    serde_json::from_str::<Value>(caps.get(1)?.as_str())
        .ok()
        .filter(|v| v.is_object())
}

/// Scan from the first `{` tracking brace depth and string state, and
/// parse the first balanced object slice.
fn balanced_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
                    return serde_json::from_str::<Value>(&text[start..=i])
                        .ok()
                        .filter(|v| v.is_object());
                }
            }
            _ => {}
        }
    }
    None
}

/// Salvage a usable object from a provider *error* body.
///
/// Groq-style providers reject malformed JSON-mode output with an error
/// envelope that embeds the model's raw text as `failed_generation`;
/// running that text back through the ladder often recovers the payload.
pub fn extract_from_error_body(body: &str) -> Option<Value> {
    let envelope: Value = serde_json::from_str(body).ok()?;
    let failed = envelope
        .get("error")
        .and_then(|e| e.get("failed_generation"))
        .or_else(|| envelope.get("failed_generation"))?
        .as_str()?;
    extract_json(failed).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_passes_through() {
        let value = extract_json(r#"{"action": "send_now", "confidence": 0.9}"#).unwrap();
        assert_eq!(value["action"], "send_now");
    }

    #[test]
    fn fenced_block_is_unwrapped() {
        let text = "Here is my decision:\n```json\n{\"action\": \"wait_schedule\"}\n```\nDone.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["action"], "wait_schedule");
    }

    #[test]
    fn reasoning_preamble_is_skipped() {
        let text = "Let me think about this. The user greeted us, so \
                    {\"action\": \"send_now\", \"nested\": {\"a\": 1}} is right.";
        let value = extract_json(text).unwrap();
        assert_eq!(value["nested"]["a"], 1);
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let text = r#"noise {"text": "look: { not a brace }", "ok": true} trailing"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(
            extract_json("no json here at all"),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(extract_json("   "), Err(Error::Protocol(_))));
    }

    #[test]
    fn failed_generation_is_salvaged() {
        let body = r#"{"error": {"code": "json_validate_failed",
            "failed_generation": "Sure! ```json\n{\"action\": \"send_now\"}\n```"}}"#;
        let value = extract_from_error_body(body).unwrap();
        assert_eq!(value["action"], "send_now");
    }

    #[test]
    fn error_body_without_payload_yields_none() {
        assert!(extract_from_error_body(r#"{"error": {"message": "rate limited"}}"#).is_none());
        assert!(extract_from_error_body("plain text").is_none());
    }
}
