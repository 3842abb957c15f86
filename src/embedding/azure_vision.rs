//! Azure AI Vision multimodal embeddings.
//!
//! Text goes to `retrieval:vectorizeText`, images to
//! `retrieval:vectorizeImage`. Both land in the same vector space, so a
//! page image and its text can be combined into one vector.

use anyhow::Result;
use async_trait::async_trait;

use super::{api_key, f32_array, http_client, send_json, EmbeddingProvider, ProviderError};
use crate::config::EmbeddingConfig;
use crate::models::ImageRef;

const API_VERSION: &str = "2024-02-01";
const DEFAULT_MODEL_VERSION: &str = "2023-04-15";

pub struct AzureVisionProvider {
    model: String,
    dims: usize,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl AzureVisionProvider {
    /// `embedding.url` is the resource endpoint; the key comes from
    /// `api_key_env` (default `AZURE_VISION_KEY`).
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let endpoint = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.url required for azure-vision provider"))?
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL_VERSION.to_string()),
            dims: config.dims.unwrap_or(1024),
            endpoint,
            api_key: api_key(config, "AZURE_VISION_KEY")?,
            client: http_client(config)?,
        })
    }

    fn url(&self, operation: &str) -> String {
        format!(
            "{}/computervision/retrieval:{}?api-version={}&model-version={}",
            self.endpoint, operation, API_VERSION, self.model
        )
    }

    fn parse_vector(json: &serde_json::Value) -> Result<Vec<f32>, ProviderError> {
        let vector = json.get("vector").ok_or_else(|| {
            ProviderError::Fatal("Invalid Azure Vision response: missing vector".into())
        })?;
        f32_array(vector, "vector")
    }
}

#[async_trait]
impl EmbeddingProvider for AzureVisionProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    fn supports_images(&self) -> bool {
        true
    }

    /// The API takes one text per call.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let request = self
                .client
                .post(self.url("vectorizeText"))
                .header("Ocp-Apim-Subscription-Key", &self.api_key)
                .json(&serde_json::json!({ "text": text }));
            let json = send_json(request, "Azure Vision").await?;
            out.push(Self::parse_vector(&json)?);
        }
        Ok(out)
    }

    async fn embed_image(&self, image: &ImageRef) -> Result<Vec<f32>, ProviderError> {
        let request = self
            .client
            .post(self.url("vectorizeImage"))
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .header("Content-Type", "application/octet-stream")
            .body(image.data.to_vec());
        let json = send_json(request, "Azure Vision").await?;
        Self::parse_vector(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn vectorizes_text_and_images() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/computervision/retrieval:vectorizeText"))
            .and(header("Ocp-Apim-Subscription-Key", "az-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "modelVersion": "2023-04-15", "vector": [1.0, 0.0]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/computervision/retrieval:vectorizeImage"))
            .and(header("Content-Type", "application/octet-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "modelVersion": "2023-04-15", "vector": [0.0, 1.0]
            })))
            .mount(&server)
            .await;

        std::env::set_var("INGEST_TEST_AZURE_KEY", "az-key");
        let provider = AzureVisionProvider::new(&EmbeddingConfig {
            provider: "azure-vision".to_string(),
            dims: Some(2),
            url: Some(server.uri()),
            api_key_env: Some("INGEST_TEST_AZURE_KEY".to_string()),
            ..Default::default()
        })
        .unwrap();

        assert!(provider.supports_images());
        let texts = provider
            .embed_texts(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(texts, vec![vec![1.0, 0.0], vec![1.0, 0.0]]);

        let image = ImageRef::new("fig.jpg", "image/jpeg", vec![0xff, 0xd8, 0xff]);
        assert_eq!(provider.embed_image(&image).await.unwrap(), vec![0.0, 1.0]);
    }
}
