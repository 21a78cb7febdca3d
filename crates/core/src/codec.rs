//! Content codec: text <-> content tree.
//!
//! Content trees are plain `serde_json::Value`s regardless of the text format,
//! so every other crate can walk them without knowing about YAML.

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

pub type Content = serde_json::Value;

/// Black-box codec used whenever a record's text and content must agree.
pub trait ContentCodec: Send + Sync {
    /// Parse every document in `text`. Empty documents are skipped.
    fn parse_all(&self, text: &str) -> CoreResult<Vec<Content>>;

    /// Serialize one content tree back to text.
    fn serialize(&self, content: &Content) -> CoreResult<String>;

    /// Parse exactly one document.
    fn parse(&self, text: &str) -> CoreResult<Content> {
        let mut docs = self.parse_all(text)?;
        match docs.len() {
            1 => Ok(docs.remove(0)),
            0 => Err(CoreError::Codec("no document found".into())),
            n => Err(CoreError::Codec(format!("expected one document, found {}", n))),
        }
    }
}

/// YAML codec backed by `serde_yaml`.
#[derive(Debug, Clone, Copy)]
pub struct YamlCodec {
    max_bytes: usize,
}

impl Default for YamlCodec {
    fn default() -> Self { Self { max_bytes: crate::settings::max_yaml_bytes() } }
}

impl YamlCodec {
    pub fn new() -> Self { Self::default() }
    pub fn with_max_bytes(max_bytes: usize) -> Self { Self { max_bytes } }
}

impl ContentCodec for YamlCodec {
    fn parse_all(&self, text: &str) -> CoreResult<Vec<Content>> {
        if text.len() > self.max_bytes {
            return Err(CoreError::TooLarge { max: self.max_bytes });
        }
        let mut out = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let val = serde_yaml::Value::deserialize(doc).map_err(|e| CoreError::Codec(e.to_string()))?;
            if val.is_null() { continue; }
            let json = serde_json::to_value(val).map_err(|e| CoreError::Codec(e.to_string()))?;
            out.push(json);
        }
        Ok(out)
    }

    fn serialize(&self, content: &Content) -> CoreResult<String> {
        serde_yaml::to_string(content).map_err(|e| CoreError::Codec(e.to_string()))
    }
}
