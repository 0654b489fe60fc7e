//! Static lookup translation used by normalization.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;

/// Pure `text -> text` capability. Unknown input comes back unchanged.
pub trait Translator: Send + Sync {
    fn translate(&self, text: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl Translator for IdentityTranslator {
    fn translate(&self, text: &str) -> String {
        text.to_string()
    }
}

/// In-memory dictionary loaded once at start.
#[derive(Debug, Default, Clone)]
pub struct DictionaryTranslator {
    entries: HashMap<String, String>,
}

impl DictionaryTranslator {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Load a JSON object of `{"source": "target"}` pairs.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let entries: HashMap<String, String> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for DictionaryTranslator {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl Translator for DictionaryTranslator {
    fn translate(&self, text: &str) -> String {
        if let Some(hit) = self.entries.get(text) {
            return hit.clone();
        }
        let trimmed = text.trim();
        match self.entries.get(trimmed) {
            Some(hit) => hit.clone(),
            None => text.to_string(),
        }
    }
}

/// Translate every string leaf of a JSON tree. Object keys are kept as-is.
pub fn translate_json(translator: &dyn Translator, value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(translator.translate(s)),
        JsonValue::Array(items) => JsonValue::Array(
            items
                .iter()
                .map(|item| translate_json(translator, item))
                .collect(),
        ),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), translate_json(translator, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
