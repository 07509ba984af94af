//! Three-tier parsing of research output.
//!
//! 1. **Strict**: the whole text is a `{"records": [...]}` payload.
//! 2. **Extracted**: a payload is cut out of surrounding prose (fenced
//!    blocks, balanced objects, or the array after a `"records":` marker).
//! 3. **AI-assisted**: an auxiliary model rewrites the text into the schema.
//!
//! Tiers are all-or-nothing. A payload with one invalid record fails the
//! tier as a whole.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use leadscout_remote::Reformatter;
use leadscout_shared::{CandidateRecord, LeadScoutError, ParseTier, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

/// Longest raw-text preview quoted in parse errors.
const PREVIEW_CHARS: usize = 200;

/// Upper bound on balanced spans tried per response.
const MAX_SPANS: usize = 64;

/// Container keys accepted around the record array.
const CONTAINER_KEYS: [&str; 2] = ["\"records\"", "\"leads\""];

/// Records recovered from a response and the tier that recovered them.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub records: Vec<CandidateRecord>,
    pub tier: ParseTier,
}

/// Turns raw research output into candidate records.
#[async_trait]
pub trait ResponseParser: Send + Sync {
    async fn parse(&self, raw_text: &str) -> Result<ParsedResponse>;
}

/// Strict → extracted → AI-assisted fallback chain.
#[derive(Default)]
pub struct TieredParser {
    reformatter: Option<Arc<dyn Reformatter>>,
}

impl TieredParser {
    /// A parser without the AI-assisted tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// A parser that falls back to `reformatter` when tiers 1 and 2 fail.
    pub fn with_reformatter(reformatter: Arc<dyn Reformatter>) -> Self {
        Self {
            reformatter: Some(reformatter),
        }
    }
}

#[async_trait]
impl ResponseParser for TieredParser {
    #[instrument(skip_all, fields(chars = raw_text.len()))]
    async fn parse(&self, raw_text: &str) -> Result<ParsedResponse> {
        if raw_text.trim().is_empty() {
            return Err(LeadScoutError::parse("research output is empty"));
        }

        match parse_strict(raw_text) {
            Ok(records) => return Ok(parsed(records, ParseTier::Strict)),
            Err(e) => debug!(error = %e, "strict parse failed"),
        }

        if let Some(records) = extract(raw_text) {
            info!(count = records.len(), "recovered payload from surrounding text");
            return Ok(parsed(records, ParseTier::Extracted));
        }

        let Some(reformatter) = &self.reformatter else {
            return Err(exhausted(raw_text, "no valid payload found"));
        };

        warn!("falling back to AI-assisted reformatting");
        let answer = reformatter
            .reformat(raw_text, &response_schema())
            .await
            .map_err(|e| exhausted(raw_text, &format!("reformatter failed: {e}")))?;

        let body = first_fenced_block(&answer).unwrap_or(answer.as_str());
        let records = parse_strict(body)
            .map_err(|e| exhausted(raw_text, &format!("reformatted output invalid: {e}")))?;
        Ok(parsed(records, ParseTier::AiAssisted))
    }
}

fn parsed(records: Vec<CandidateRecord>, tier: ParseTier) -> ParsedResponse {
    ParsedResponse { records, tier }
}

fn exhausted(raw_text: &str, reason: &str) -> LeadScoutError {
    LeadScoutError::parse(format!(
        "all parser tiers failed ({reason}); output starts with: {}",
        preview(raw_text, PREVIEW_CHARS)
    ))
}

// ---------------------------------------------------------------------------
// Tier 1
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct Envelope {
    #[serde(alias = "leads")]
    records: Vec<CandidateRecord>,
}

/// Deserialize `text` as a complete payload and validate every record.
pub fn parse_strict(text: &str) -> Result<Vec<CandidateRecord>> {
    let envelope: Envelope = serde_json::from_str(text.trim())
        .map_err(|e| LeadScoutError::parse(format!("invalid payload: {e}")))?;

    envelope
        .records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let record = record.normalized();
            if record.name.is_empty() {
                return Err(LeadScoutError::parse(format!("record {i} has no name")));
            }
            Ok(record)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tier 2
// ---------------------------------------------------------------------------

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid regex")
});

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""(?:records|leads)"\s*:\s*\["#).expect("valid regex")
});

/// Try every candidate span in order and return the first valid payload.
fn extract(text: &str) -> Option<Vec<CandidateRecord>> {
    candidate_spans(text)
        .into_iter()
        .find_map(|span| parse_strict(&span).ok())
}

fn candidate_spans(text: &str) -> Vec<String> {
    let mut spans: Vec<String> = FENCE_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect();

    let bytes = text.as_bytes();
    spans.extend(
        text.match_indices('{')
            .filter_map(|(start, _)| {
                matching_close(bytes, start, b'{', b'}').map(|end| &text[start..=end])
            })
            .filter(|span| CONTAINER_KEYS.iter().any(|k| span.contains(k)))
            .take(MAX_SPANS)
            .map(str::to_string),
    );

    for marker in MARKER_RE.find_iter(text) {
        let open = marker.end() - 1;
        if let Some(close) = matching_close(bytes, open, b'[', b']') {
            spans.push(format!("{{\"records\": {}}}", &text[open..=close]));
        }
    }
    spans
}

/// Index of the bracket closing the one at `start`, skipping string
/// literals and escapes.
fn matching_close(bytes: &[u8], start: usize, open: u8, close: u8) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
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
        if b == b'"' {
            in_string = true;
        } else if b == open {
            depth += 1;
        } else if b == close {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(start + offset);
            }
        }
    }
    None
}

fn first_fenced_block(text: &str) -> Option<&str> {
    FENCE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// JSON schema of the payload the research service is asked to produce.
pub fn response_schema() -> serde_json::Value {
    let text = json!({"type": "string"});
    json!({
        "type": "object",
        "properties": {
            "records": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": text,
                        "company": text,
                        "record_type": text,
                        "email": text,
                        "phone": text,
                        "instagram": text,
                        "telegram": text,
                        "website": text,
                        "notes": text,
                        "temperature": {"type": "string", "enum": ["cold", "warm", "hot"]},
                        "tags": {"type": "array", "items": text},
                        "locality": text,
                    },
                    "required": ["name"],
                },
            },
        },
        "required": ["records"],
    })
}

/// First `max` characters of `s`.
pub(crate) fn preview(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeReformatter;

    #[tokio::test]
    async fn strict_tier_short_circuits() {
        let reformatter = Arc::new(FakeReformatter::answering("{\"records\": []}"));
        let parser = TieredParser::with_reformatter(reformatter.clone());

        let parsed = parser
            .parse(r#"{"records": [{"name": "Foo", "email": "a@x.com"}]}"#)
            .await
            .unwrap();
        assert_eq!(parsed.tier, ParseTier::Strict);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].email.as_deref(), Some("a@x.com"));
        assert_eq!(reformatter.calls(), 0);
    }

    #[tokio::test]
    async fn legacy_leads_key_is_accepted() {
        let parsed = TieredParser::new()
            .parse(r#"{"leads": [{"name": "Foo", "lead_type": "Venue"}]}"#)
            .await
            .unwrap();
        assert_eq!(parsed.tier, ParseTier::Strict);
        assert_eq!(parsed.records[0].record_type.as_deref(), Some("Venue"));
    }

    #[tokio::test]
    async fn empty_records_inside_garbage_is_tier_two() {
        let parsed = TieredParser::new()
            .parse("<garbage>{\"records\": []}<garbage>")
            .await
            .unwrap();
        assert_eq!(parsed.tier, ParseTier::Extracted);
        assert!(parsed.records.is_empty());
    }

    #[tokio::test]
    async fn fenced_block_is_extracted() {
        let raw = "Here are the results:\n```json\n{\"records\": [{\"name\": \"Club}\"}]}\n```\nCheers";
        let parsed = TieredParser::new().parse(raw).await.unwrap();
        assert_eq!(parsed.tier, ParseTier::Extracted);
        assert_eq!(parsed.records[0].name, "Club}");
    }

    #[tokio::test]
    async fn bare_array_after_marker_is_wrapped() {
        let raw = "Summary... \"records\": [{\"name\": \"Foo\"}, {\"name\": \"Bar\"}] and more text";
        let parsed = TieredParser::new().parse(raw).await.unwrap();
        assert_eq!(parsed.tier, ParseTier::Extracted);
        assert_eq!(parsed.records.len(), 2);
    }

    #[tokio::test]
    async fn outermost_object_wins() {
        let raw = r#"noise {"records": [{"name": "Outer", "tags": ["{x}"]}]} tail"#;
        let parsed = TieredParser::new().parse(raw).await.unwrap();
        assert_eq!(parsed.records[0].name, "Outer");
        assert_eq!(parsed.records[0].tags, vec!["{x}".to_string()]);
    }

    #[tokio::test]
    async fn nameless_record_fails_the_whole_tier() {
        let reformatter = Arc::new(FakeReformatter::failing());
        let parser = TieredParser::with_reformatter(reformatter.clone());
        let err = parser
            .parse(r#"{"records": [{"name": "Foo"}, {"name": "  "}]}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, LeadScoutError::Parse { .. }));
        assert_eq!(reformatter.calls(), 1);
    }

    #[test]
    fn unknown_temperature_is_invalid() {
        assert!(parse_strict(r#"{"records": [{"name": "Foo", "temperature": "lukewarm"}]}"#).is_err());
    }

    #[tokio::test]
    async fn ai_tier_used_after_extraction_fails() {
        let reformatter = Arc::new(FakeReformatter::answering(
            "```json\n{\"records\": [{\"name\": \"Foo\", \"temperature\": \"warm\"}]}\n```",
        ));
        let parser = TieredParser::with_reformatter(reformatter.clone());

        let parsed = parser
            .parse("Foo is a warm lead running a venue in Berlin.")
            .await
            .unwrap();
        assert_eq!(parsed.tier, ParseTier::AiAssisted);
        assert_eq!(parsed.records[0].name, "Foo");
        assert_eq!(reformatter.calls(), 1);
    }

    #[tokio::test]
    async fn ai_tier_invalid_answer_is_parse_error() {
        let reformatter = Arc::new(FakeReformatter::answering("sorry, no leads"));
        let err = TieredParser::with_reformatter(reformatter)
            .parse("prose only")
            .await
            .unwrap_err();
        assert!(matches!(err, LeadScoutError::Parse { .. }));
        assert!(err.to_string().contains("prose only"));
    }

    #[tokio::test]
    async fn empty_text_skips_ai_tier() {
        let reformatter = Arc::new(FakeReformatter::answering("{\"records\": []}"));
        let parser = TieredParser::with_reformatter(reformatter.clone());
        assert!(parser.parse("  \n ").await.is_err());
        assert_eq!(reformatter.calls(), 0);
    }

    #[tokio::test]
    async fn without_reformatter_prose_fails() {
        let err = TieredParser::new().parse("nothing useful").await.unwrap_err();
        assert!(matches!(err, LeadScoutError::Parse { .. }));
    }

    #[test]
    fn matching_close_skips_strings() {
        let text = br#"{"a": "}", "b": {"c": "\"}"}} trailing"#;
        let end = matching_close(text, 0, b'{', b'}').unwrap();
        assert_eq!(text[end + 1], b' ');
        assert_eq!(matching_close(b"{ unclosed", 0, b'{', b'}'), None);
    }

    #[test]
    fn schema_requires_records() {
        let schema = response_schema();
        assert_eq!(schema["required"], json!(["records"]));
        assert_eq!(
            schema["properties"]["records"]["items"]["required"],
            json!(["name"])
        );
    }
}
