use crate::error::AppError;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Text,
    ImageUrl,
}

/// One moderatable piece of a chat-completion request: either a run of text
/// or an image URL (possibly a data URL).
#[derive(Debug, Clone)]
pub struct Chunk {
    pub kind: ChunkKind,
    pub data: String,
}

/// Walks `messages` in order and yields their content parts. Single-pass
/// and non-restartable; errors surface at the offending part.
pub struct ContentChunker {
    contents: Vec<Value>,
    msg_idx: usize,
    part_idx: usize,
}

impl ContentChunker {
    pub fn new(body: &Value) -> Self {
        let contents = body
            .get("messages")
            .and_then(Value::as_array)
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| m.get("content").cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            contents,
            msg_idx: 0,
            part_idx: 0,
        }
    }
}

impl Iterator for ContentChunker {
    type Item = Result<Chunk, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.msg_idx >= self.contents.len() {
                return None;
            }

            let content = self.contents[self.msg_idx].clone();

            if let Some(text) = content.as_str() {
                self.msg_idx += 1;
                return Some(Ok(Chunk {
                    kind: ChunkKind::Text,
                    data: text.to_string(),
                }));
            }

            let parts = match content.as_array() {
                Some(parts) => parts.clone(),
                None => {
                    return Some(Err(AppError::BadRequest(
                        "message content must be a string or an array of parts".to_string(),
                    )))
                }
            };

            if parts.is_empty() {
                self.msg_idx += 1;
                self.part_idx = 0;
                continue;
            }

            let part = parts[self.part_idx].clone();
            self.part_idx += 1;
            if self.part_idx >= parts.len() {
                self.part_idx = 0;
                self.msg_idx += 1;
            }

            let kind = part.get("type").and_then(Value::as_str).unwrap_or("");
            return Some(match kind {
                "text" => Ok(Chunk {
                    kind: ChunkKind::Text,
                    data: part
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                "image_url" => Ok(Chunk {
                    kind: ChunkKind::ImageUrl,
                    data: part
                        .get("image_url")
                        .and_then(|i| i.get("url"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                }),
                other => Err(AppError::UnsupportedPart(if other.is_empty() {
                    "<missing type>".to_string()
                } else {
                    other.to_string()
                })),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collect(body: Value) -> Vec<Result<Chunk, AppError>> {
        ContentChunker::new(&body).collect()
    }

    #[test]
    fn test_plain_string_content() {
        let chunks = collect(json!({
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi there"},
            ]
        }));

        assert_eq!(chunks.len(), 2);
        let first = chunks[0].as_ref().unwrap();
        assert_eq!(first.kind, ChunkKind::Text);
        assert_eq!(first.data, "hello");
        assert_eq!(chunks[1].as_ref().unwrap().data, "hi there");
    }

    #[test]
    fn test_structured_parts_in_order() {
        let chunks = collect(json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "describe this"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                    {"type": "text", "text": "in detail"},
                ]
            }]
        }));

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].as_ref().unwrap().kind, ChunkKind::Text);
        assert_eq!(chunks[1].as_ref().unwrap().kind, ChunkKind::ImageUrl);
        assert_eq!(
            chunks[1].as_ref().unwrap().data,
            "data:image/png;base64,AAAA"
        );
        assert_eq!(chunks[2].as_ref().unwrap().data, "in detail");
    }

    #[test]
    fn test_unknown_part_kind_fails() {
        let chunks = collect(json!({
            "messages": [{
                "role": "user",
                "content": [{"type": "audio", "audio": {}}]
            }]
        }));

        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(AppError::UnsupportedPart(_))));
    }

    #[test]
    fn test_non_string_non_array_content_fails() {
        let chunks = collect(json!({
            "messages": [{"role": "user", "content": 42}]
        }));

        assert_eq!(chunks.len(), 1);
        assert!(matches!(chunks[0], Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_missing_or_empty_messages() {
        assert!(collect(json!({})).is_empty());
        assert!(collect(json!({"messages": []})).is_empty());
        assert!(collect(json!({
            "messages": [{"role": "user", "content": []}]
        }))
        .is_empty());
    }
}
