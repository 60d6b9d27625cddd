use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use super::{language_name, Translator};
use crate::config::TranslationConfig;

const API_VERSION: &str = "2023-06-01";

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

/// Translator backed by the Anthropic messages API.
#[derive(Debug, Clone)]
pub struct AnthropicTranslator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicTranslator {
    pub fn new(config: &TranslationConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| anyhow!("ANTHROPIC_API_KEY is not set"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(&self.api_key)?);
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

fn build_prompt(texts: &[String], target_language: &str) -> Result<String> {
    let payload = serde_json::to_string_pretty(texts)?;
    Ok(format!(
        "Translate each string in the following JSON array to {}. \
         Keep the translations natural and appropriate for presentation slides. \
         Maintain any formatting like bullet points or numbering. \
         Reply with only a JSON array of the translated strings, in the same order \
         and with the same number of elements.\n\n{}",
        language_name(target_language),
        payload
    ))
}

/// Pulls the JSON array out of the model reply, tolerating surrounding prose
/// or a code fence.
fn parse_translations(reply: &str, expected: usize) -> Result<Vec<String>> {
    let start = reply.find('[').ok_or_else(|| anyhow!("no JSON array in reply"))?;
    let end = reply.rfind(']').ok_or_else(|| anyhow!("no JSON array in reply"))?;
    if end < start {
        bail!("malformed JSON array in reply");
    }
    let out: Vec<String> =
        serde_json::from_str(&reply[start..=end]).context("parsing translated array")?;
    if out.len() != expected {
        bail!("expected {} translations, got {}", expected, out.len());
    }
    Ok(out)
}

#[async_trait]
impl Translator for AnthropicTranslator {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn translate_batch(&self, texts: &[String], target_language: &str) -> Result<Vec<String>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: build_prompt(texts, target_language)?,
            }],
        };

        trace!(url = %url, count = texts.len(), lang = target_language, "sending translation request");
        let resp = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .context("translation request send")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("translation API returned {}: {}", status, text);
        }

        let parsed: MessagesResponse = resp.json().await.context("translation response body")?;
        let reply: String = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .map(|b| b.text)
            .collect();
        let out = parse_translations(&reply, texts.len())?;
        debug!(count = out.len(), lang = target_language, "batch translated");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn config(url: &str) -> TranslationConfig {
        TranslationConfig {
            api_url: url.to_string(),
            api_key: Some("test-key".to_string()),
            ..TranslationConfig::default()
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn translate_batch_parses_array_reply() {
        let mut server = Server::new_async().await;
        let reply = json!({
            "content": [{"type": "text", "text": "```json\n[\"こんにちは\", \"さようなら\"]\n```"}]
        });
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-key")
            .match_header("anthropic-version", API_VERSION)
            .match_body(Matcher::PartialJson(json!({"max_tokens": 4096})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(reply.to_string())
            .create_async()
            .await;

        let translator = AnthropicTranslator::new(&config(&server.url())).unwrap();
        let out = translator
            .translate_batch(&texts(&["Hello", "Goodbye"]), "ja")
            .await
            .expect("translation should succeed");
        assert_eq!(out, vec!["こんにちは", "さようなら"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn translate_batch_surfaces_api_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(529)
            .with_body("overloaded")
            .create_async()
            .await;

        let translator = AnthropicTranslator::new(&config(&server.url())).unwrap();
        let err = translator
            .translate_batch(&texts(&["Hello"]), "ja")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("529"));
    }

    #[test]
    fn missing_api_key_is_an_error() {
        let cfg = TranslationConfig::default();
        assert!(AnthropicTranslator::new(&cfg).is_err());
    }

    #[test]
    fn parse_rejects_count_mismatch() {
        assert!(parse_translations("[\"a\"]", 2).is_err());
        assert!(parse_translations("no array here", 1).is_err());
        assert_eq!(
            parse_translations("Sure! [\"x\", \"y\"]", 2).unwrap(),
            vec!["x", "y"]
        );
    }

    #[test]
    fn prompt_names_target_language() {
        let prompt = build_prompt(&texts(&["Title"]), "fr").unwrap();
        assert!(prompt.contains("French"));
        assert!(prompt.contains("\"Title\""));
    }
}
