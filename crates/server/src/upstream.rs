use crate::error::AppError;
use async_trait::async_trait;

// Google
pub const MODEL_GEMINI_25_FLASH_LITE: &str = "gemini-2.5-flash-lite";
pub const MODEL_GEMINI_25_FLASH: &str = "gemini-2.5-flash";
pub const MODEL_GEMINI_25_PRO: &str = "gemini-2.5-pro";
pub const MODEL_GEMINI_3_FLASH: &str = "gemini-3-flash-preview";
pub const MODEL_GEMINI_3_PRO: &str = "gemini-3-pro-preview";

// OpenAI
pub const MODEL_GPT_41: &str = "gpt-4.1";
pub const MODEL_GPT_41_MINI: &str = "gpt-4.1-mini";
pub const MODEL_GPT_4O: &str = "gpt-4o";
pub const MODEL_O1: &str = "o1";

pub fn all_models() -> Vec<String> {
    [
        MODEL_GEMINI_25_FLASH_LITE,
        MODEL_GEMINI_25_FLASH,
        MODEL_GEMINI_25_PRO,
        MODEL_GEMINI_3_FLASH,
        MODEL_GEMINI_3_PRO,
        MODEL_GPT_41,
        MODEL_GPT_41_MINI,
        MODEL_GPT_4O,
        MODEL_O1,
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Google,
    AzureOpenAi,
}

pub fn family_for(model: &str) -> Option<ModelFamily> {
    match model {
        MODEL_GEMINI_25_FLASH_LITE | MODEL_GEMINI_25_FLASH | MODEL_GEMINI_25_PRO
        | MODEL_GEMINI_3_FLASH | MODEL_GEMINI_3_PRO => Some(ModelFamily::Google),
        MODEL_GPT_41 | MODEL_GPT_41_MINI | MODEL_GPT_4O | MODEL_O1 => {
            Some(ModelFamily::AzureOpenAi)
        }
        _ => None,
    }
}

/// All vendors speak the OpenAI chat-completions dialect, so clients only
/// ever send one request format.
pub const GOOGLE_CHAT_COMPLETIONS_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";

#[derive(Clone)]
pub struct UpstreamConfig {
    pub google_api_key: String,
    pub azure_openai_api_key: String,
    pub azure_chat_completions_url: String,
}

impl UpstreamConfig {
    fn dest_url(&self, family: ModelFamily) -> &str {
        match family {
            ModelFamily::Google => GOOGLE_CHAT_COMPLETIONS_URL,
            ModelFamily::AzureOpenAi => &self.azure_chat_completions_url,
        }
    }

    fn api_key(&self, family: ModelFamily) -> &str {
        match family {
            ModelFamily::Google => &self.google_api_key,
            ModelFamily::AzureOpenAi => &self.azure_openai_api_key,
        }
    }
}

/// The forwarded-LLM call, buffered whole so responses can be cached.
#[async_trait]
pub trait LlmUpstream: Send + Sync {
    async fn forward(&self, model: &str, body: &[u8]) -> Result<Vec<u8>, AppError>;
}

pub struct HttpLlmUpstream {
    client: reqwest::Client,
    config: UpstreamConfig,
}

impl HttpLlmUpstream {
    pub fn new(client: reqwest::Client, config: UpstreamConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl LlmUpstream for HttpLlmUpstream {
    async fn forward(&self, model: &str, body: &[u8]) -> Result<Vec<u8>, AppError> {
        let family = family_for(model).ok_or_else(|| AppError::UnknownModel(model.to_string()))?;
        let api_key = self.config.api_key(family);

        let mut request = self
            .client
            .post(self.config.dest_url(family))
            .header("content-type", "application/json")
            .body(body.to_vec());

        request = match family {
            ModelFamily::Google => request
                .header("x-goog-api-key", api_key)
                .header("Authorization", format!("Bearer {api_key}"))
                // TODO: turn gzip back on once cached responses store the
                // decoded body.
                .header("Accept-Encoding", "identity"),
            ModelFamily::AzureOpenAi => request.header("api-key", api_key),
        };

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            tracing::error!(
                model = %model,
                status = %status,
                body = %String::from_utf8_lossy(&bytes),
                "Upstream LLM call failed"
            );
            return Err(AppError::Upstream {
                status: status.as_u16(),
            });
        }

        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_mapping() {
        assert_eq!(family_for(MODEL_GEMINI_25_FLASH), Some(ModelFamily::Google));
        assert_eq!(family_for(MODEL_GEMINI_3_PRO), Some(ModelFamily::Google));
        assert_eq!(family_for(MODEL_GPT_4O), Some(ModelFamily::AzureOpenAi));
        assert_eq!(family_for(MODEL_O1), Some(ModelFamily::AzureOpenAi));
        assert_eq!(family_for("llama-3"), None);
    }

    #[test]
    fn test_every_catalog_model_has_a_family() {
        for model in all_models() {
            assert!(family_for(&model).is_some(), "no family for {model}");
        }
    }

    #[test]
    fn test_dest_urls() {
        let config = UpstreamConfig {
            google_api_key: "g".to_string(),
            azure_openai_api_key: "a".to_string(),
            azure_chat_completions_url: "https://example.openai.azure.com/openai/v1/chat/completions"
                .to_string(),
        };
        assert_eq!(
            config.dest_url(ModelFamily::Google),
            GOOGLE_CHAT_COMPLETIONS_URL
        );
        assert!(config
            .dest_url(ModelFamily::AzureOpenAi)
            .contains("azure.com"));
    }
}
