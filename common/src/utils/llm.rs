use std::{sync::Arc, time::Duration};

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessage,
        ChatCompletionRequestUserMessage, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateEmbeddingRequestArgs, ImageDetail, ImageUrlArgs,
        ResponseFormat,
    },
    Client,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    error::AppError,
    utils::{
        config::AppConfig,
        embedding::zero_embedding,
        rate_limit::{execute_rate_limited, RateLimiter},
    },
};

/// Request-level timeout for routine completions.
const ROUTINE_TIMEOUT: Duration = Duration::from_secs(60);
/// Request-level timeout for the advanced (reasoning) model.
const REASONING_TIMEOUT: Duration = Duration::from_secs(300);

/// Provider client with the shared rate limiter baked in. Every outbound
/// chat and embedding call in the repository goes through this type.
pub struct LlmClient {
    client: Client<OpenAIConfig>,
    limiter: Arc<RateLimiter>,
    pub llm_model: String,
    pub llm_model_advanced: String,
    pub embedding_model: String,
    pub vision_model: String,
    pub embedding_dimensions: u32,
}

impl LlmClient {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        );

        Self {
            client,
            limiter: Arc::new(RateLimiter::new(config.openai_rpm_limit)),
            llm_model: config.llm_model.clone(),
            llm_model_advanced: config.llm_model_advanced.clone(),
            embedding_model: config.embedding_model.clone(),
            vision_model: config.vision_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
        }
    }

    fn timeout_for(&self, model: &str) -> Duration {
        if model == self.llm_model_advanced {
            REASONING_TIMEOUT
        } else {
            ROUTINE_TIMEOUT
        }
    }

    /// One plain chat completion; returns the first choice's content.
    pub async fn chat_text(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .build()?;

        let timeout = self.timeout_for(model);
        execute_rate_limited(&self.limiter, || {
            let request = request.clone();
            async move {
                let response = tokio::time::timeout(timeout, self.client.chat().create(request))
                    .await
                    .map_err(|_| AppError::Timeout(format!("chat completion after {timeout:?}")))??;

                response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .ok_or_else(|| AppError::LLMParsing("No content found in LLM response".into()))
            }
        })
        .await
    }

    /// Chat completion with `response_format = json_object`, parsed into `T`
    /// through the strict-parse / extract-object repair ladder.
    pub async fn chat_json<T: DeserializeOwned>(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<T, AppError> {
        let content = self.chat_json_raw(model, system, user).await?;
        parse_llm_json(&content)
    }

    /// Chat completion with `response_format = json_object`, returning the
    /// raw content so callers can run their own parse-and-repair ladder.
    pub async fn chat_json_raw(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system).into(),
                ChatCompletionRequestUserMessage::from(user).into(),
            ])
            .response_format(ResponseFormat::JsonObject)
            .temperature(0.0)
            .build()?;

        let timeout = self.timeout_for(model);
        execute_rate_limited(&self.limiter, || {
            let request = request.clone();
            async move {
                let response = tokio::time::timeout(timeout, self.client.chat().create(request))
                    .await
                    .map_err(|_| AppError::Timeout(format!("chat completion after {timeout:?}")))??;

                response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .ok_or_else(|| AppError::LLMParsing("No content found in LLM response".into()))
            }
        })
        .await
    }

    /// Chat completion over a text prompt plus base64-encoded PNG images,
    /// against the configured vision model.
    pub async fn chat_vision(
        &self,
        prompt: &str,
        encoded_images: &[String],
    ) -> Result<String, AppError> {
        let mut content_parts = Vec::with_capacity(encoded_images.len() + 1);
        content_parts.push(
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(prompt)
                .build()?
                .into(),
        );
        for encoded in encoded_images {
            content_parts.push(
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(
                        ImageUrlArgs::default()
                            .url(format!("data:image/png;base64,{encoded}"))
                            .detail(ImageDetail::High)
                            .build()?,
                    )
                    .build()?
                    .into(),
            );
        }

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.vision_model)
            .messages([ChatCompletionRequestUserMessageArgs::default()
                .content(content_parts)
                .build()?
                .into()])
            .build()?;

        execute_rate_limited(&self.limiter, || {
            let request = request.clone();
            async move {
                let response =
                    tokio::time::timeout(REASONING_TIMEOUT, self.client.chat().create(request))
                        .await
                        .map_err(|_| AppError::Timeout("vision transcription request".into()))??;

                response
                    .choices
                    .first()
                    .and_then(|choice| choice.message.content.clone())
                    .ok_or_else(|| {
                        AppError::LLMParsing("No content found in vision response".into())
                    })
            }
        })
        .await
    }

    /// Embeds one input, propagating provider errors.
    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let vectors = self.embed_batch(vec![input.to_owned()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| AppError::LLMParsing("No embedding data received".into()))
    }

    /// Embeds one input, substituting the all-zero sentinel on failure.
    pub async fn embed_or_zero(&self, input: &str) -> Vec<f32> {
        match self.embed(input).await {
            Ok(vector) => vector,
            Err(err) => {
                warn!(error = %err, "Embedding failed; substituting zero vector");
                zero_embedding(self.embedding_dimensions as usize)
            }
        }
    }

    /// Embeds a batch of inputs in one provider call.
    pub async fn embed_batch(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.embedding_model)
            .dimensions(self.embedding_dimensions)
            .input(inputs)
            .build()?;

        execute_rate_limited(&self.limiter, || {
            let request = request.clone();
            async move {
                let response =
                    tokio::time::timeout(ROUTINE_TIMEOUT, self.client.embeddings().create(request))
                        .await
                        .map_err(|_| AppError::Timeout("embedding request".into()))??;

                Ok(response
                    .data
                    .into_iter()
                    .map(|item| item.embedding)
                    .collect())
            }
        })
        .await
    }
}

/// Extracts the first balanced `{…}` block from LLM output that wrapped its
/// JSON in prose or a code fence.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Strict parse, then one repair attempt on the first embedded object.
pub fn parse_llm_json<T: DeserializeOwned>(content: &str) -> Result<T, AppError> {
    match serde_json::from_str::<T>(content) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            debug!(error = %first_err, "Strict JSON parse failed; attempting object extraction");
            let block = extract_json_object(content).ok_or_else(|| {
                AppError::LLMParsing(format!("No JSON object found in LLM response: {first_err}"))
            })?;
            serde_json::from_str::<T>(block).map_err(|err| {
                AppError::LLMParsing(format!("Failed to parse extracted JSON object: {err}"))
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct Sample {
        title: String,
        score: f32,
    }

    #[test]
    fn strict_json_parses_directly() {
        let parsed: Sample = parse_llm_json(r#"{"title": "Ley", "score": 7.5}"#).expect("parse");
        assert_eq!(parsed.title, "Ley");
    }

    #[test]
    fn repairs_json_wrapped_in_prose() {
        let content = "Claro, aquí está el resultado:\n```json\n{\"title\": \"Reglamento\", \"score\": 3.0}\n```\nEspero que ayude.";
        let parsed: Sample = parse_llm_json(content).expect("repair parse");
        assert_eq!(parsed.title, "Reglamento");
    }

    #[test]
    fn extraction_handles_nested_objects() {
        let content = r#"prefix {"outer": {"inner": 1}, "x": "a}b"} suffix"#;
        let block = extract_json_object(content).expect("object");
        assert_eq!(block, r#"{"outer": {"inner": 1}, "x": "a}b"}"#);
    }

    #[test]
    fn unparseable_content_errors() {
        let result: Result<Sample, _> = parse_llm_json("no json at all");
        assert!(result.is_err());
    }
}
