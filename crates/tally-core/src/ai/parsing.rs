//! JSON decoding for LLM batch responses
//!
//! Models often wrap the payload in markdown fences or surround it with
//! prose. The decoder reports which path succeeded so callers (and logs)
//! can tell a clean response from a salvaged one.

use serde::{Deserialize, Deserializer};

/// One categorization returned by the model
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LlmCategorization {
    #[serde(deserialize_with = "flexible_id")]
    pub transaction_id: i64,
    #[serde(default, deserialize_with = "flexible_optional_id")]
    pub category_id: Option<i64>,
    #[serde(default, alias = "category")]
    pub category_name: Option<String>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Result of decoding a model response
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// The whole response was valid JSON
    Strict(T),
    /// JSON was recovered from fences or surrounding text
    Fenced(T),
    /// Nothing usable; `raw` is truncated for logging
    Unparseable { reason: String, raw: String },
}

impl<T> Decoded<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Strict(v) | Self::Fenced(v) => Some(v),
            Self::Unparseable { .. } => None,
        }
    }

    pub fn state(&self) -> &'static str {
        match self {
            Self::Strict(_) => "strict",
            Self::Fenced(_) => "fenced",
            Self::Unparseable { .. } => "unparseable",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    List(Vec<LlmCategorization>),
    Wrapped {
        #[serde(alias = "categorizations", alias = "transactions")]
        results: Vec<LlmCategorization>,
    },
}

impl Payload {
    fn into_list(self) -> Vec<LlmCategorization> {
        match self {
            Self::List(list) => list,
            Self::Wrapped { results } => results,
        }
    }
}

/// Decode a batch categorization response
pub fn decode_categorizations(response: &str) -> Decoded<Vec<LlmCategorization>> {
    let trimmed = response.trim();

    if let Ok(payload) = serde_json::from_str::<Payload>(trimmed) {
        return Decoded::Strict(payload.into_list());
    }

    let unfenced = strip_fences(trimmed);
    let mut last_error = None;
    for candidate in [Some(unfenced), extract_between(unfenced, '[', ']'), extract_between(unfenced, '{', '}')]
        .into_iter()
        .flatten()
    {
        match serde_json::from_str::<Payload>(candidate) {
            Ok(payload) => return Decoded::Fenced(payload.into_list()),
            Err(e) => last_error = Some(e.to_string()),
        }
    }

    Decoded::Unparseable {
        reason: last_error.unwrap_or_else(|| "No JSON found in response".to_string()),
        raw: truncate(trimmed, 200),
    }
}

/// Remove a leading ```json / ``` fence and the closing fence
fn strip_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag on the opening line
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}

fn extract_between(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start < end).then(|| &text[start..=end])
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max).collect::<String>())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Int(i64),
    Float(f64),
    Text(String),
}

impl IdRepr {
    fn to_id(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().trim_start_matches('#').parse().ok(),
        }
    }
}

fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    let repr = IdRepr::deserialize(deserializer)?;
    repr.to_id()
        .ok_or_else(|| serde::de::Error::custom("transaction_id is not an integer"))
}

fn flexible_optional_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<i64>, D::Error> {
    let repr = Option::<IdRepr>::deserialize(deserializer)?;
    Ok(repr.and_then(|r| r.to_id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_array() {
        let decoded = decode_categorizations(
            r#"[{"transaction_id": 1, "category_id": 3, "confidence": 0.9, "reasoning": "coffee"}]"#,
        );
        assert_eq!(decoded.state(), "strict");
        let items = decoded.into_value().unwrap();
        assert_eq!(items[0].transaction_id, 1);
        assert_eq!(items[0].category_id, Some(3));
    }

    #[test]
    fn test_fenced_array() {
        let response = "```json\n[{\"transaction_id\": \"12\", \"category_name\": \"Travel\", \"confidence\": 0.8}]\n```";
        let decoded = decode_categorizations(response);
        assert_eq!(decoded.state(), "fenced");
        let items = decoded.into_value().unwrap();
        assert_eq!(items[0].transaction_id, 12);
        assert_eq!(items[0].category_id, None);
        assert_eq!(items[0].category_name.as_deref(), Some("Travel"));
    }

    #[test]
    fn test_prose_around_json() {
        let response = "Here are the results:\n[{\"transaction_id\": 4, \"category\": \"Dining\", \"confidence\": 0.7}]\nLet me know!";
        let items = decode_categorizations(response).into_value().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category_name.as_deref(), Some("Dining"));
    }

    #[test]
    fn test_wrapped_object() {
        let response = r#"{"results": [{"transaction_id": 5, "category_id": "2", "confidence": 1.0}]}"#;
        let decoded = decode_categorizations(response);
        assert_eq!(decoded.state(), "strict");
        assert_eq!(decoded.into_value().unwrap()[0].category_id, Some(2));
    }

    #[test]
    fn test_unparseable() {
        let decoded = decode_categorizations("I cannot help with that.");
        assert_eq!(decoded.state(), "unparseable");
        assert!(decoded.into_value().is_none());

        let long = "x".repeat(500);
        match decode_categorizations(&long) {
            Decoded::Unparseable { raw, .. } => assert!(raw.len() <= 203),
            other => panic!("expected unparseable, got {:?}", other.state()),
        }
    }
}
