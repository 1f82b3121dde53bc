//! Raw request decoding.
//!
//! Each item of a batch is decoded independently: a malformed item is
//! recorded against its index and the rest of the batch proceeds.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{GenerationParams, InputParser};
use crate::error::DecodeError;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

/// One undecoded batch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    /// `Content-Type` of the body; JSON when absent.
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl RawRequest {
    pub fn new(content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            body: body.into(),
        }
    }

    /// JSON item.
    pub fn json(value: &Value) -> Self {
        Self::new(Some(JSON_CONTENT_TYPE), value.to_string())
    }

    /// Plain-text prompt with default parameters.
    pub fn text(prompt: &str) -> Self {
        Self::new(Some(TEXT_CONTENT_TYPE), prompt)
    }
}

/// Prompts and parameters decoded from one item.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedItem {
    pub prompts: Vec<String>,
    pub params: GenerationParams,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PromptField {
    Single(String),
    Batch(Vec<String>),
}

impl From<PromptField> for Vec<String> {
    fn from(field: PromptField) -> Self {
        match field {
            PromptField::Single(prompt) => vec![prompt],
            PromptField::Batch(prompts) => prompts,
        }
    }
}

/// Decoded batch.
///
/// `prompts`, `parameters` and `item_index` are parallel: one entry per
/// prompt. An item with a list prompt contributes several entries sharing
/// its parameters.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub prompts: Vec<String>,
    pub parameters: Vec<GenerationParams>,
    /// Item each prompt came from.
    pub item_index: Vec<usize>,
    /// Prompts contributed by each successfully decoded item.
    pub input_sizes: Vec<usize>,
    /// Failures keyed by item index.
    pub errors: BTreeMap<usize, DecodeError>,
}

impl DecodedBatch {
    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Decode every item of a batch.
pub fn decode_batch(parser: InputParser, items: &[RawRequest]) -> DecodedBatch {
    let mut batch = DecodedBatch::default();

    for (index, item) in items.iter().enumerate() {
        match decode_item(parser, item) {
            Ok(decoded) => {
                batch.input_sizes.push(decoded.prompts.len());
                for prompt in decoded.prompts {
                    batch.prompts.push(prompt);
                    batch.parameters.push(decoded.params.clone());
                    batch.item_index.push(index);
                }
            }
            Err(err) => {
                debug!(item = index, error = %err, "failed to decode batch item");
                batch.errors.insert(index, err);
            }
        }
    }

    batch
}

/// Decode a single item.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing why the item is unusable.
pub fn decode_item(parser: InputParser, item: &RawRequest) -> Result<DecodedItem, DecodeError> {
    let media_type = item
        .content_type
        .as_deref()
        .map(|value| value.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty());

    match media_type.as_deref() {
        None | Some(JSON_CONTENT_TYPE) => {
            let body: Value =
                serde_json::from_slice(&item.body).map_err(DecodeError::InvalidJson)?;
            match parser {
                InputParser::Standard => decode_standard(body),
                InputParser::OpenAiCompletion => decode_openai(body),
            }
        }
        Some(TEXT_CONTENT_TYPE) => Ok(DecodedItem {
            prompts: vec![String::from_utf8(item.body.clone())?],
            params: GenerationParams::default(),
        }),
        Some(other) => Err(DecodeError::UnsupportedContentType(other.to_string())),
    }
}

/// `{"inputs": ..., "parameters": {...}}`, or a bare JSON string prompt.
fn decode_standard(body: Value) -> Result<DecodedItem, DecodeError> {
    let mut map = match body {
        Value::String(prompt) => {
            return Ok(DecodedItem {
                prompts: vec![prompt],
                params: GenerationParams::default(),
            })
        }
        Value::Object(map) => map,
        _ => return Err(DecodeError::MissingPrompt("inputs")),
    };

    let prompts = take_prompts(&mut map, "inputs")?;
    let params = match map.remove("parameters") {
        Some(value) => serde_json::from_value(value).map_err(DecodeError::InvalidParameters)?,
        None => GenerationParams::default(),
    };

    Ok(DecodedItem { prompts, params })
}

/// `{"prompt": ..., <parameters>...}`.
fn decode_openai(body: Value) -> Result<DecodedItem, DecodeError> {
    let Value::Object(mut map) = body else {
        return Err(DecodeError::MissingPrompt("prompt"));
    };

    let prompts = take_prompts(&mut map, "prompt")?;
    let params = GenerationParams::from_map(map).map_err(DecodeError::InvalidParameters)?;

    Ok(DecodedItem { prompts, params })
}

fn take_prompts(
    map: &mut Map<String, Value>,
    field: &'static str,
) -> Result<Vec<String>, DecodeError> {
    let value = map.remove(field).ok_or(DecodeError::MissingPrompt(field))?;
    let prompts: PromptField = serde_json::from_value(value).map_err(DecodeError::InvalidJson)?;
    Ok(prompts.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_item() {
        let item = RawRequest::json(&json!({
            "inputs": "Memories follow me left and right. I can",
            "parameters": {"max_new_tokens": 50, "do_sample": false, "temperature": 0.000007}
        }));

        let decoded = decode_item(InputParser::Standard, &item).unwrap();

        assert_eq!(decoded.prompts, vec!["Memories follow me left and right. I can"]);
        assert_eq!(decoded.params.max_new_tokens, 50);
        assert!(decoded.params.is_greedy());
    }

    #[test]
    fn test_openai_item_keeps_extras() {
        let item = RawRequest::json(&json!({
            "prompt": ["a", "b"],
            "max_tokens": 12,
            "presence_penalty": 0.5
        }));

        let decoded = decode_item(InputParser::OpenAiCompletion, &item).unwrap();

        assert_eq!(decoded.prompts, vec!["a", "b"]);
        assert_eq!(decoded.params.max_new_tokens, 12);
        assert_eq!(decoded.params.extras.get("presence_penalty"), Some(&json!(0.5)));
    }

    #[test]
    fn test_content_types() {
        let text = RawRequest::text("hello");
        assert_eq!(
            decode_item(InputParser::Standard, &text).unwrap().prompts,
            vec!["hello"]
        );

        let with_charset = RawRequest::new(
            Some("application/json; charset=utf-8"),
            r#"{"inputs": "x"}"#,
        );
        assert!(decode_item(InputParser::Standard, &with_charset).is_ok());

        let untyped = RawRequest::new(None, r#"{"inputs": "x"}"#);
        assert!(decode_item(InputParser::Standard, &untyped).is_ok());

        let binary = RawRequest::new(Some("application/octet-stream"), vec![0u8, 1]);
        assert!(matches!(
            decode_item(InputParser::Standard, &binary),
            Err(DecodeError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_decode_errors_carry_cause() {
        let bad_json = RawRequest::new(None, "{not json");
        assert!(matches!(
            decode_item(InputParser::Standard, &bad_json),
            Err(DecodeError::InvalidJson(_))
        ));

        let no_prompt = RawRequest::json(&json!({"parameters": {}}));
        assert!(matches!(
            decode_item(InputParser::Standard, &no_prompt),
            Err(DecodeError::MissingPrompt("inputs"))
        ));

        let bad_params = RawRequest::json(&json!({"inputs": "x", "parameters": {"max_new_tokens": "many"}}));
        assert!(matches!(
            decode_item(InputParser::Standard, &bad_params),
            Err(DecodeError::InvalidParameters(_))
        ));

        let bad_utf8 = RawRequest::new(Some(TEXT_CONTENT_TYPE), vec![0xff, 0xfe]);
        assert!(matches!(
            decode_item(InputParser::Standard, &bad_utf8),
            Err(DecodeError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn test_batch_isolates_bad_item() {
        let items = vec![
            RawRequest::json(&json!({"inputs": ["p0", "p1"]})),
            RawRequest::new(None, "garbage"),
            RawRequest::json(&json!({"inputs": "p2", "parameters": {"max_new_tokens": 3}})),
        ];

        let batch = decode_batch(InputParser::Standard, &items);

        assert_eq!(batch.prompts, vec!["p0", "p1", "p2"]);
        assert_eq!(batch.item_index, vec![0, 0, 2]);
        assert_eq!(batch.input_sizes, vec![2, 1]);
        assert_eq!(batch.parameters[2].max_new_tokens, 3);
        assert_eq!(batch.errors.keys().copied().collect::<Vec<_>>(), vec![1]);
    }
}
