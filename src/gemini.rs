use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::app::{ChatEvent, Message, Role, Source};

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// All attachments are sent as JPEG regardless of the file's real type.
pub const IMAGE_MIME: &str = "image/jpeg";

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

const SYSTEM_INSTRUCTION: &str = "You are a helpful assistant. Answer clearly and \
     concisely. When you use web search results, ground your answer in them.";

// Request payload

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    system_instruction: Content,
    contents: Vec<Content>,
    tools: Vec<Tool>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            inline_data: None,
        }
    }

    pub fn inline_image(data: String) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: IMAGE_MIME.to_string(),
                data,
            }),
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

// The field name is the tool selector on the wire, so serde's camelCase
// rename must not touch it.
#[derive(Serialize)]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Serialize)]
struct GoogleSearch {}

// Response payload (one SSE data event)

#[derive(Deserialize, Debug)]
pub struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize, Debug)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Debug)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Deserialize, Debug)]
struct WebSource {
    uri: String,
    title: Option<String>,
}

/// Wrap raw image bytes as the data-URL string the transcript stores.
pub fn to_data_url(bytes: &[u8]) -> String {
    format!("data:{};base64,{}", IMAGE_MIME, BASE64.encode(bytes))
}

/// Bare base64 payload for the wire; non-data-URL strings pass through.
fn strip_data_url(image: &str) -> String {
    match image.split_once(',') {
        Some((_, data)) => data.to_string(),
        None => image.to_string(),
    }
}

/// One history turn per transcript message: the assistant role becomes the
/// API's "model" label, an attached image leads the text part.
pub fn build_history(messages: &[Message]) -> Vec<Content> {
    messages
        .iter()
        .map(|msg| Content {
            role: match msg.role {
                Role::User => "user".to_string(),
                Role::Assistant => "model".to_string(),
            },
            parts: build_parts(msg.image.as_deref(), &msg.content),
        })
        .collect()
}

pub fn build_parts(image: Option<&str>, text: &str) -> Vec<Part> {
    let mut parts = Vec::new();
    if let Some(image) = image {
        parts.push(Part::inline_image(strip_data_url(image)));
    }
    parts.push(Part::text(text));
    parts
}

/// Pop complete SSE event blocks (terminated by a blank line) off the front
/// of the buffer, leaving any partial event for the next network chunk.
fn drain_events(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let block: Vec<u8> = buffer.drain(..pos + 2).collect();
        events.push(String::from_utf8_lossy(&block[..pos]).into_owned());
    }
    events
}

/// Join the `data:` field lines of one event block; None for events that
/// carry no data (comments, bare `event:` lines).
fn data_payload(event_block: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in event_block.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Incremental text plus any web grounding sources carried by one chunk.
fn chunk_update(chunk: &StreamChunk) -> (String, Vec<Source>) {
    let mut text = String::new();
    let mut sources = Vec::new();

    if let Some(candidate) = chunk.candidates.first() {
        if let Some(content) = &candidate.content {
            for part in &content.parts {
                if let Some(t) = &part.text {
                    text.push_str(t);
                }
            }
        }
        if let Some(metadata) = &candidate.grounding_metadata {
            for grounding in &metadata.grounding_chunks {
                if let Some(web) = &grounding.web {
                    sources.push(Source {
                        uri: web.uri.clone(),
                        title: web.title.clone().unwrap_or_else(|| web.uri.clone()),
                    });
                }
            }
        }
    }

    (text, sources)
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
        }
    }

    /// Stream one chat turn. `history` is the serialized prior transcript;
    /// `turn` is the current message's parts. Emits a `Chunk` event per SSE
    /// data event; the caller translates the final Result into Done/Failed.
    pub async fn stream_chat(
        &self,
        model: &str,
        history: Vec<Content>,
        turn: Vec<Part>,
        emit: impl Fn(ChatEvent),
    ) -> Result<()> {
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", API_BASE, model);

        let mut contents = history;
        contents.push(Content {
            role: "user".to_string(),
            parts: turn,
        });

        let request = GenerateContentRequest {
            system_instruction: Content {
                role: "user".to_string(),
                parts: vec![Part::text(SYSTEM_INSTRUCTION)],
            },
            contents,
            tools: vec![Tool {
                google_search: GoogleSearch {},
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Gemini API error {}: {}", status, body));
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            buffer.extend_from_slice(&bytes);

            for event in drain_events(&mut buffer) {
                if let Some(payload) = data_payload(&event) {
                    emit_payload(&payload, &emit)?;
                }
            }
        }

        // Trailing event without a final blank line
        if !buffer.is_empty() {
            let tail = String::from_utf8_lossy(&buffer).into_owned();
            if let Some(payload) = data_payload(&tail) {
                emit_payload(&payload, &emit)?;
            }
        }

        Ok(())
    }
}

fn emit_payload(payload: &str, emit: &impl Fn(ChatEvent)) -> Result<()> {
    let parsed: StreamChunk = serde_json::from_str(payload)?;
    let (text, sources) = chunk_update(&parsed);
    if !text.is_empty() || !sources.is_empty() {
        emit(ChatEvent::Chunk { text, sources });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Local;

    fn message(role: Role, content: &str, image: Option<&str>) -> Message {
        Message {
            id: 1,
            role,
            content: content.to_string(),
            timestamp: Local::now(),
            image: image.map(|s| s.to_string()),
            sources: Vec::new(),
        }
    }

    #[test]
    fn test_history_role_translation() {
        let history = build_history(&[
            message(Role::Assistant, "Hello!", None),
            message(Role::User, "hi", None),
        ]);

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "model");
        assert_eq!(history[1].role, "user");
        assert_eq!(history[1].parts, vec![Part::text("hi")]);
    }

    #[test]
    fn test_image_part_leads_text_part() {
        let history = build_history(&[message(
            Role::User,
            "what is this",
            Some("data:image/jpeg;base64,QUJDRA=="),
        )]);

        let parts = &history[0].parts;
        assert_eq!(parts.len(), 2);
        let inline = parts[0].inline_data.as_ref().expect("image part first");
        assert_eq!(inline.mime_type, "image/jpeg");
        assert_eq!(inline.data, "QUJDRA==");
        assert_eq!(parts[1].text.as_deref(), Some("what is this"));
    }

    #[test]
    fn test_data_url_round_trip() {
        let url = to_data_url(&[0x01, 0x02, 0x03]);
        assert!(url.starts_with("data:image/jpeg;base64,"));
        assert_eq!(strip_data_url(&url), "AQID");
        // A bare payload passes through untouched
        assert_eq!(strip_data_url("AQID"), "AQID");
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let request = GenerateContentRequest {
            system_instruction: Content {
                role: "user".to_string(),
                parts: vec![Part::text("sys")],
            },
            contents: vec![Content {
                role: "user".to_string(),
                parts: build_parts(Some("data:image/jpeg;base64,QQ=="), "hi"),
            }],
            tools: vec![Tool {
                google_search: GoogleSearch {},
            }],
        };

        let value = serde_json::to_value(&request).expect("serializes");
        assert!(value.get("systemInstruction").is_some());
        let part = &value["contents"][0]["parts"][0];
        assert_eq!(part["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(value["tools"][0]["google_search"], serde_json::json!({}));
    }

    #[test]
    fn test_drain_events_handles_split_boundaries() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"data: {\"a\":1}\n\ndata: {\"b\"");
        let events = drain_events(&mut buffer);
        assert_eq!(events, vec!["data: {\"a\":1}".to_string()]);

        // The partial event completes on the next network chunk
        buffer.extend_from_slice(b":2}\n\n");
        let events = drain_events(&mut buffer);
        assert_eq!(events, vec!["data: {\"b\":2}".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_data_payload_joins_multiline_events() {
        assert_eq!(
            data_payload("data: {\"x\":\ndata: 1}"),
            Some("{\"x\":\n1}".to_string())
        );
        assert_eq!(data_payload("data:no-space"), Some("no-space".to_string()));
        assert_eq!(data_payload(": comment\nevent: ping"), None);
    }

    #[test]
    fn test_chunk_update_extracts_text_and_sources() {
        let payload = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "The "}, {"text": "answer"}], "role": "model"},
                "groundingMetadata": {
                    "groundingChunks": [
                        {"web": {"uri": "https://a.example", "title": "A"}},
                        {"web": {"uri": "https://b.example"}},
                        {}
                    ]
                }
            }]
        }"#;

        let chunk: StreamChunk = serde_json::from_str(payload).expect("parses");
        let (text, sources) = chunk_update(&chunk);
        assert_eq!(text, "The answer");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].title, "A");
        // Missing title falls back to the uri
        assert_eq!(sources[1].title, "https://b.example");
    }

    #[test]
    fn test_chunk_update_tolerates_empty_chunk() {
        let chunk: StreamChunk = serde_json::from_str("{}").expect("parses");
        let (text, sources) = chunk_update(&chunk);
        assert!(text.is_empty());
        assert!(sources.is_empty());
    }
}
