//! Typed events decoded from the answer-producer stream.
//!
//! Payloads arrive as loosely shaped JSON; they decode into a closed
//! tagged-variant type with one variant per recognized kind. Unknown kinds
//! map to [`StreamEvent::Ignored`] rather than a runtime error.

use serde_json::Value;

/// A reference descriptor as staged by a `references` or `done` event,
/// before resolution into a display [`sibyl_core::types::Reference`].
///
/// Tolerates both the compact shape (`title`/`url`/`pages`) and the
/// producer's verbose shape (`file_name`/`file_url`/`page_range`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawReference {
    pub title: Option<String>,
    pub url: String,
    pub pages: Option<String>,
}

impl RawReference {
    /// Decode a single descriptor; `None` when no usable fields exist.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;

        let title = obj
            .get("title")
            .or_else(|| obj.get("file_name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let url = obj
            .get("url")
            .or_else(|| obj.get("file_url"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let pages = obj
            .get("pages")
            .or_else(|| obj.get("page_range"))
            .and_then(normalize_pages);

        if title.is_none() && url.is_empty() && pages.is_none() {
            return None;
        }
        Some(Self { title, url, pages })
    }

    /// Identity key used for staged-list deduplication.
    pub fn identity_key(&self) -> (String, String, String) {
        (
            self.url.clone(),
            self.pages.clone().unwrap_or_default(),
            self.title.clone().unwrap_or_default(),
        )
    }
}

/// `page_range` may be a string or a `[start, end]` pair.
fn normalize_pages(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(parts) if parts.len() == 2 => {
            let start = parts[0].as_i64()?;
            let end = parts[1].as_i64()?;
            Some(format!("{}-{}", start, end))
        }
        _ => None,
    }
}

/// Payload of the terminal `done` event. Both fields are optional: the
/// producer may close the stream with an empty object and leave content
/// resolution to the accumulated token text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DonePayload {
    pub content: Option<String>,
    pub references: Option<Vec<RawReference>>,
}

/// One decoded event from the producer stream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Transport handshake, informational only.
    Connected,
    /// Incremental answer fragment, appended to the assistant draft.
    Token(String),
    /// Ephemeral progress string; superseded by the next status.
    Status(String),
    /// Staged reference descriptors, applied at finalization.
    References(Vec<RawReference>),
    /// Terminal success.
    Done(DonePayload),
    /// Terminal failure from the producer.
    Error(String),
    /// Unrecognized kind; carries the tag for logging, has no effect.
    Ignored(String),
}

impl StreamEvent {
    /// Decode one frame payload. `None` means the frame is malformed
    /// (missing or non-string discriminant) and should be skipped.
    pub fn from_value(value: &Value) -> Option<StreamEvent> {
        let kind = value
            .get("event")
            .or_else(|| value.get("type"))
            .and_then(Value::as_str)?;
        let data = value.get("data").or_else(|| value.get("content"));

        let event = match kind {
            "connected" => StreamEvent::Connected,
            "token" => StreamEvent::Token(string_payload(data)),
            "status" => StreamEvent::Status(string_payload(data)),
            "references" => {
                let refs = data
                    .and_then(Value::as_array)
                    .map(|items| items.iter().filter_map(RawReference::from_value).collect())
                    .unwrap_or_default();
                StreamEvent::References(refs)
            }
            "done" => StreamEvent::Done(done_payload(data)),
            "error" => StreamEvent::Error(string_payload(data)),
            other => StreamEvent::Ignored(other.to_string()),
        };
        Some(event)
    }
}

fn string_payload(data: Option<&Value>) -> String {
    match data {
        Some(Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}

fn done_payload(data: Option<&Value>) -> DonePayload {
    let Some(obj) = data.and_then(Value::as_object) else {
        return DonePayload::default();
    };

    let content = obj
        .get("content")
        .or_else(|| obj.get("answer"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let references = obj
        .get("references")
        .or_else(|| obj.get("sources"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(RawReference::from_value).collect());

    DonePayload { content, references }
}
