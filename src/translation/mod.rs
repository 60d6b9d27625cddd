pub mod anthropic;
pub mod jobs;
pub mod service;
pub mod sidecar;

use anyhow::Result;
use async_trait::async_trait;

pub use anthropic::AnthropicTranslator;
pub use jobs::{JobRunner, UploadStore};
pub use service::{TranslateError, TranslationService};
pub use sidecar::Sidecar;

/// Backend that turns a batch of texts into the target language.
///
/// Implementations return exactly one translation per input, in order.
#[async_trait]
pub trait Translator: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    async fn translate_batch(&self, texts: &[String], target_language: &str)
        -> Result<Vec<String>>;
}

/// Human-readable name for the language codes the UI offers.
pub fn language_name(code: &str) -> &str {
    match code {
        "ja" => "Japanese",
        "en" => "English",
        "zh" => "Chinese",
        "ko" => "Korean",
        "fr" => "French",
        "de" => "German",
        "es" => "Spanish",
        other => other,
    }
}
