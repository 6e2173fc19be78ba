use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;

use super::critique::{BEGIN_REVISED, END_REVISED};
use super::{AdapterError, GenerationContext, GenerationMode, Generator, non_empty};
use crate::config::OpenAiConfig;

/// Generator backed by the OpenAI Responses API.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiGenerator {
    pub fn new(config: &OpenAiConfig, api_key: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            endpoint: responses_endpoint(&config.base_url),
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Reads the API key from the variable named by `api_key_env`.
    pub fn from_env(config: &OpenAiConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} is not set", config.api_key_env))?;
        Self::new(config, api_key)
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(
        &self,
        mode: GenerationMode,
        input: &str,
        context: &GenerationContext,
    ) -> Result<String, AdapterError> {
        let instructions = instructions_for(mode);
        let prompt = build_prompt(mode, input, context);
        tracing::debug!(%mode, model = %self.model, chars = input.len(), "openai generate");

        let temperature = match mode {
            GenerationMode::Review | GenerationMode::Summarize => 0.3,
            GenerationMode::Draft | GenerationMode::Spin => self.temperature,
        };
        let text = responses_text(
            &self.client,
            &self.endpoint,
            &self.api_key,
            &self.model,
            instructions,
            &prompt,
            temperature,
        )
        .await?;
        non_empty(text.trim().to_owned())
    }
}

pub fn responses_endpoint(base_url: &str) -> String {
    let base_url = base_url.trim_end_matches('/');
    format!("{base_url}/responses")
}

async fn responses_text(
    client: &reqwest::Client,
    endpoint: &str,
    api_key: &str,
    model: &str,
    instructions: &str,
    input: &str,
    temperature: f32,
) -> Result<String, AdapterError> {
    let mut body = serde_json::json!({
        "model": model,
        "instructions": instructions,
        "input": input,
        "text": { "format": { "type": "text" } },
        "store": false,
    });

    // GPT-5 family models reject sampling params.
    if !model.starts_with("gpt-5")
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert("temperature".to_owned(), serde_json::json!(temperature));
    }

    let response = client
        .post(endpoint)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await
        .map_err(classify_transport_error)?;

    let status = response.status();
    let raw = response.text().await.map_err(classify_transport_error)?;
    if !status.is_success() {
        let message = parse_error_message(&raw).unwrap_or_else(|| raw.clone());
        let message = format!("OpenAI API error ({status}): {message}");
        return Err(
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                AdapterError::Transient(message)
            } else {
                AdapterError::Fatal(message)
            },
        );
    }

    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|err| AdapterError::BadOutput(format!("parse OpenAI response: {err}")))?;
    extract_output_text(&value)
}

fn classify_transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Transient(format!("OpenAI request failed: {err}"))
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}

fn extract_output_text(value: &serde_json::Value) -> Result<String, AdapterError> {
    let output = value
        .get("output")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AdapterError::BadOutput("missing `output` array in response".to_owned()))?;

    let text: String = output
        .iter()
        .filter(|item| item.get("type").and_then(|v| v.as_str()) == Some("message"))
        .filter_map(|item| item.get("content").and_then(|v| v.as_array()))
        .flatten()
        .filter(|part| part.get("type").and_then(|v| v.as_str()) == Some("output_text"))
        .filter_map(|part| part.get("text").and_then(|v| v.as_str()))
        .collect();

    if text.trim().is_empty() {
        return Err(AdapterError::BadOutput(
            "OpenAI output text is empty".to_owned(),
        ));
    }
    Ok(text)
}

fn instructions_for(mode: GenerationMode) -> &'static str {
    match mode {
        GenerationMode::Draft => {
            "You are a careful editor. Turn scraped web text into a clean, readable book \
chapter draft. Keep every fact, drop navigation and boilerplate, and output only the chapter \
in Markdown."
        }
        GenerationMode::Spin => {
            "You are an expert writer producing a creative adaptation of literary content. \
Rewrite the text substantially with fresh, engaging language while preserving its narrative, \
themes, and structure. Output only the adapted chapter."
        }
        GenerationMode::Review => {
            "You are an expert reviewer and editor. Assess the adapted chapter against the \
original for faithfulness, style, flow, and mechanics, then provide an improved version."
        }
        GenerationMode::Summarize => {
            "Summarize the core themes of the chapter as a short comma-separated list. \
Output only the list."
        }
    }
}

fn build_prompt(mode: GenerationMode, input: &str, context: &GenerationContext) -> String {
    let mut prompt = String::new();
    for (key, value) in context.iter() {
        if key == GenerationContext::ORIGINAL || key == GenerationContext::INSTRUCTIONS {
            continue;
        }
        prompt.push_str(&format!("{key}: {value}\n"));
    }
    if let Some(instructions) = context.get(GenerationContext::INSTRUCTIONS) {
        prompt.push_str(&format!("\nRevision notes to apply:\n{instructions}\n"));
    }
    if let Some(original) = context.get(GenerationContext::ORIGINAL) {
        prompt.push_str(&format!("\nBEGIN_ORIGINAL\n{original}\nEND_ORIGINAL\n"));
    }

    prompt.push_str(&format!("\nBEGIN_INPUT\n{input}\nEND_INPUT\n"));

    if mode == GenerationMode::Review {
        prompt.push_str(&format!(
            "\nRespond in exactly this format:\n\
Verdict: accept | revise\n\
Score: <0-10>\n\
Suggestions:\n\
- <one suggestion per line>\n\
{BEGIN_REVISED}\n\
<the full revised chapter>\n\
{END_REVISED}\n"
        ));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_concatenated_message_text() {
        let value = serde_json::json!({
            "output": [
                { "type": "reasoning", "summary": [] },
                { "type": "message", "content": [
                    { "type": "output_text", "text": "Hello, " },
                    { "type": "refusal", "refusal": "no" },
                    { "type": "output_text", "text": "world" }
                ]}
            ]
        });
        assert_eq!(extract_output_text(&value).unwrap(), "Hello, world");
    }

    #[test]
    fn empty_or_missing_output_is_bad_output() {
        let missing = serde_json::json!({ "id": "resp" });
        assert!(matches!(
            extract_output_text(&missing),
            Err(AdapterError::BadOutput(_))
        ));
        let blank = serde_json::json!({ "output": [
            { "type": "message", "content": [{ "type": "output_text", "text": "  " }] }
        ]});
        assert!(matches!(
            extract_output_text(&blank),
            Err(AdapterError::BadOutput(_))
        ));
    }

    #[test]
    fn review_prompt_carries_format_and_notes() {
        let ctx = GenerationContext::new()
            .with(GenerationContext::TITLE, "Gates")
            .with(GenerationContext::INSTRUCTIONS, "- shorter")
            .with(GenerationContext::ORIGINAL, "raw text");
        let prompt = build_prompt(GenerationMode::Review, "spun text", &ctx);
        assert!(prompt.starts_with("title: Gates\n"));
        assert!(prompt.contains("Revision notes to apply:\n- shorter"));
        assert!(prompt.contains("BEGIN_ORIGINAL\nraw text\nEND_ORIGINAL"));
        assert!(prompt.contains("BEGIN_INPUT\nspun text\nEND_INPUT"));
        assert!(prompt.contains(BEGIN_REVISED));

        let spin = build_prompt(GenerationMode::Spin, "x", &GenerationContext::new());
        assert!(!spin.contains("Verdict"));
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        assert_eq!(
            responses_endpoint("http://127.0.0.1:1/v1/"),
            "http://127.0.0.1:1/v1/responses"
        );
    }
}
