//! Role-tagged, multi-modal prompt content exchanged with completion backends.
//!
//! The serialized shape matches the OpenAI chat `content` array so messages can
//! be sent as-is.

use serde::{Deserialize, Serialize};

/// Image payload referenced by URL (in practice a `data:` URI).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Unit of prompt content: text or an image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        ContentBlock::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::ImageUrl { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }
}

/// Flatten blocks into plain text; images become `[image]` placeholders.
pub fn blocks_to_text(blocks: &[ContentBlock]) -> String {
    let mut buf = String::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => buf.push_str(text),
            ContentBlock::ImageUrl { .. } => buf.push_str("[image]"),
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_block_uses_openai_shape() {
        let block = ContentBlock::image("data:image/png;base64,AAAA");
        let value = serde_json::to_value(&block).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({
                "type": "image_url",
                "image_url": { "url": "data:image/png;base64,AAAA" }
            })
        );
    }

    #[test]
    fn blocks_to_text_marks_images() {
        let blocks = vec![
            ContentBlock::text("a"),
            ContentBlock::image("data:x"),
            ContentBlock::text("b"),
        ];
        assert_eq!(blocks_to_text(&blocks), "a[image]b");
    }
}
