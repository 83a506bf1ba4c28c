//! Recovery of the structured `{improvedIdea, diagram}` payload from raw model output.
//!
//! Models routinely ignore "return only JSON" instructions: they wrap the object in
//! markdown fences, add a sentence before or after it, or emit raw newlines inside
//! the diagram string. Parse failure is an expected outcome here, so extraction
//! never fails; it degrades to [`ExtractionOutcome::Fallback`] carrying the raw text.

use std::borrow::Cow;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::refine::RefinementResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Parsed(RefinementResult),
    Fallback {
        result: RefinementResult,
        /// Candidate text that failed to parse, kept for diagnostics.
        unparsed: String,
        reason: String,
    },
}

impl ExtractionOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }

    pub fn result(&self) -> &RefinementResult {
        match self {
            Self::Parsed(result) | Self::Fallback { result, .. } => result,
        }
    }

    pub fn into_result(self) -> RefinementResult {
        match self {
            Self::Parsed(result) | Self::Fallback { result, .. } => result,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelPayload {
    #[serde(rename = "improvedIdea")]
    improved_idea: String,
    diagram: String,
}

impl From<ModelPayload> for RefinementResult {
    fn from(payload: ModelPayload) -> Self {
        Self {
            description: payload.improved_idea,
            diagram_source: payload.diagram,
        }
    }
}

pub fn extract(raw: &str) -> ExtractionOutcome {
    extract_with_limit(raw, usize::MAX)
}

/// Like [`extract`], but output longer than `max_chars` is not parsed at all.
pub fn extract_with_limit(raw: &str, max_chars: usize) -> ExtractionOutcome {
    let char_count = raw.chars().count();
    if char_count > max_chars {
        return fallback(
            raw,
            String::new(),
            format!("model output has {char_count} chars (max {max_chars})"),
        );
    }

    let stripped = strip_code_fences(raw);
    let Some(candidate) = slice_outer_braces(&stripped) else {
        return fallback(
            raw,
            stripped.trim().to_owned(),
            "no JSON object found in model output".to_owned(),
        );
    };

    match parse_payload(candidate) {
        Ok(payload) => ExtractionOutcome::Parsed(payload.into()),
        Err(error) => fallback(raw, candidate.to_owned(), error.to_string()),
    }
}

fn fallback(raw: &str, unparsed: String, reason: String) -> ExtractionOutcome {
    ExtractionOutcome::Fallback {
        result: RefinementResult {
            description: raw.to_owned(),
            diagram_source: String::new(),
        },
        unparsed,
        reason,
    }
}

fn parse_payload(candidate: &str) -> Result<ModelPayload, serde_json::Error> {
    match serde_json::from_str::<ModelPayload>(candidate) {
        Ok(payload) => Ok(payload),
        Err(error) => match escape_raw_control_chars(candidate) {
            Some(repaired) => serde_json::from_str::<ModelPayload>(&repaired).map_err(|_| error),
            None => Err(error),
        },
    }
}

/// Removes every triple-backtick marker together with the language tag glued to it.
fn strip_code_fences(text: &str) -> Cow<'_, str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"```[A-Za-z0-9_+-]*").expect("fence pattern is valid"));
    re.replace_all(text, "")
}

fn slice_outer_braces(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Escapes control characters that appear unescaped inside JSON string literals.
/// Returns `None` when nothing needed escaping.
fn escape_raw_control_chars(candidate: &str) -> Option<String> {
    let mut output = String::with_capacity(candidate.len() + 16);
    let mut in_string = false;
    let mut escaped = false;
    let mut changed = false;

    for ch in candidate.chars() {
        if !in_string {
            if ch == '"' {
                in_string = true;
            }
            output.push(ch);
            continue;
        }

        if escaped {
            escaped = false;
            output.push(ch);
            continue;
        }

        match ch {
            '\\' => {
                escaped = true;
                output.push(ch);
            }
            '"' => {
                in_string = false;
                output.push(ch);
            }
            '\n' => {
                changed = true;
                output.push_str("\\n");
            }
            '\r' => {
                changed = true;
                output.push_str("\\r");
            }
            '\t' => {
                changed = true;
                output.push_str("\\t");
            }
            control if u32::from(control) < 0x20 => {
                changed = true;
                output.push_str(&format!("\\u{:04x}", u32::from(control)));
            }
            other => output.push(other),
        }
    }

    changed.then_some(output)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn parsed(description: &str, diagram_source: &str) -> ExtractionOutcome {
        ExtractionOutcome::Parsed(RefinementResult {
            description: description.to_owned(),
            diagram_source: diagram_source.to_owned(),
        })
    }

    #[test]
    fn fenced_json_is_parsed() {
        let raw = "```json\n{\"improvedIdea\":\"X\",\"diagram\":\"graph TD;A-->B;\"}\n```";
        assert_eq!(extract(raw), parsed("X", "graph TD;A-->B;"));
    }

    #[test]
    fn surrounding_prose_is_sliced_away() {
        let raw = "Sure! Here is your spec:\n{\"improvedIdea\": \"A todo app\", \"diagram\": \"graph LR\\nA-->B\"}\nLet me know if you need more.";
        assert_eq!(extract(raw), parsed("A todo app", "graph LR\nA-->B"));
    }

    #[test]
    fn any_language_tag_after_fence_is_dropped() {
        let raw = "```JSON5\n{\"improvedIdea\":\"a\",\"diagram\":\"\"}```";
        assert_eq!(extract(raw), parsed("a", ""));
    }

    #[test]
    fn inline_fences_with_tags_are_removed() {
        let raw = "Here you go:```c++{\"improvedIdea\":\"x\",\"diagram\":\"graph TD\"}``` done";
        assert_eq!(extract(raw), parsed("x", "graph TD"));
        assert_eq!(strip_code_fences("no fences"), "no fences");
    }

    #[test]
    fn text_without_braces_falls_back_to_raw() {
        let raw = "Sorry, I cannot comply.";
        let outcome = extract(raw);

        assert!(!outcome.is_parsed());
        assert_eq!(outcome.result().description, raw);
        assert_eq!(outcome.result().diagram_source, "");
    }

    #[test]
    fn truncated_json_falls_back_with_diagnostics() {
        let raw = "```json\n{\"improvedIdea\":\"half of it\", \"diagram\": \"graph TD;A-->";
        let ExtractionOutcome::Fallback {
            result,
            unparsed,
            reason,
        } = extract(raw)
        else {
            panic!("expected fallback for truncated payload");
        };

        assert_eq!(result.description, raw);
        assert!(result.diagram_source.is_empty());
        assert!(unparsed.starts_with("{\"improvedIdea\""));
        assert_eq!(reason, "no JSON object found in model output");
    }

    #[test]
    fn missing_or_mistyped_fields_fall_back() {
        let missing = extract("{\"improvedIdea\":\"only text\"}");
        assert!(!missing.is_parsed());

        let mistyped = extract("{\"improvedIdea\":\"x\",\"diagram\":null}");
        assert!(!mistyped.is_parsed());
        assert_eq!(
            mistyped.result().description,
            "{\"improvedIdea\":\"x\",\"diagram\":null}"
        );
    }

    #[test]
    fn unbalanced_object_reports_parser_error() {
        let ExtractionOutcome::Fallback { reason, .. } =
            extract("{\"improvedIdea\":\"x\",\"diagram\": } trailing }")
        else {
            panic!("expected fallback for malformed payload");
        };
        assert!(reason.contains("line 1"));
    }

    #[test]
    fn extra_fields_are_tolerated() {
        let raw = "{\"improvedIdea\":\"x\",\"diagram\":\"graph TD\",\"confidence\":0.9}";
        assert_eq!(extract(raw), parsed("x", "graph TD"));
    }

    #[test]
    fn raw_newlines_inside_strings_are_repaired() {
        let raw = "{\"improvedIdea\":\"line one\nline two\",\"diagram\":\"graph TD\n\tA-->B\"}";
        assert_eq!(
            extract(raw),
            parsed("line one\nline two", "graph TD\n\tA-->B")
        );
    }

    #[test]
    fn repair_leaves_escaped_quotes_alone() {
        let candidate = "{\"a\":\"say \\\"hi\\\"\nnow\"}";
        let repaired = escape_raw_control_chars(candidate).expect("newline should be escaped");
        assert_eq!(repaired, "{\"a\":\"say \\\"hi\\\"\\nnow\"}");
        assert_eq!(escape_raw_control_chars("{\"a\":\"b\"}\n"), None);
    }

    #[test]
    fn oversized_output_is_not_parsed() {
        let raw = "{\"improvedIdea\":\"x\",\"diagram\":\"y\"}";
        let outcome = extract_with_limit(raw, 10);

        let ExtractionOutcome::Fallback { result, reason, .. } = outcome else {
            panic!("expected fallback for oversized output");
        };
        assert_eq!(result.description, raw);
        assert!(reason.contains("max 10"));
    }

    #[test]
    fn reversed_braces_do_not_slice() {
        assert_eq!(slice_outer_braces("} nothing {"), None);
        assert_eq!(slice_outer_braces("a {b} c"), Some("{b}"));
    }

    proptest! {
        #[test]
        fn brace_free_text_always_falls_back_verbatim(raw in "[^{}]*") {
            let outcome = extract(&raw);
            prop_assert!(!outcome.is_parsed());
            prop_assert_eq!(&outcome.result().description, &raw);
            prop_assert_eq!(outcome.result().diagram_source.as_str(), "");
        }

        #[test]
        fn wrapped_payload_round_trips_exact_fields(
            prefix in "[a-zA-Z .,!:\n]{0,40}",
            suffix in "[a-zA-Z .,!:\n]{0,40}",
            description in "[^`]{0,60}",
            diagram in "[^`]{0,60}",
            fenced in any::<bool>(),
        ) {
            let body = serde_json::json!({"improvedIdea": description, "diagram": diagram}).to_string();
            let raw = if fenced {
                format!("{prefix}```json\n{body}\n```{suffix}")
            } else {
                format!("{prefix}{body}{suffix}")
            };

            prop_assert_eq!(extract(&raw), parsed(&description, &diagram));
        }
    }
}
