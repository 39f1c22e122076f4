use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tern_common::{Error, Result};
use tracing::warn;

use super::{GeneratedImage, Tool, ToolContext, ToolOutput};

const SIZES: [&str; 3] = ["1024x1024", "1792x1024", "1024x1792"];
const QUALITIES: [&str; 2] = ["standard", "hd"];

/// Client for the image-generation API.
#[derive(Clone)]
pub struct ImageClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImagePayload>,
}

#[derive(Deserialize)]
struct ImagePayload {
    b64_json: Option<String>,
    revised_prompt: Option<String>,
}

impl ImageClient {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }

    pub async fn generate(
        &self,
        api_key: &str,
        prompt: &str,
        size: &str,
        quality: &str,
    ) -> Result<GeneratedImage> {
        let url = format!("{}/images/generations", self.base_url);
        let body = json!({
            "model": "dall-e-3",
            "prompt": prompt,
            "n": 1,
            "size": size,
            "quality": quality,
            "response_format": "b64_json",
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Tool(format!("image request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Tool(format!("image API returned {status}")));
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|e| Error::Tool(format!("failed to parse image response: {e}")))?;

        let payload = parsed
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::Tool("image response carried no image".to_string()))?;
        let b64 = payload
            .b64_json
            .ok_or_else(|| Error::Tool("image response carried no payload".to_string()))?;

        Ok(GeneratedImage {
            data_url: format!("data:image/png;base64,{b64}"),
            revised_prompt: payload.revised_prompt.unwrap_or_else(|| prompt.to_string()),
        })
    }
}

/// Generate an image from a prompt. The image payload rides on the typed
/// tool output and is relayed to the client as an `image_generated` event;
/// the model only sees the confirmation string.
pub struct GenerateImage {
    images: ImageClient,
    api_key: Option<String>,
}

impl GenerateImage {
    pub fn new(images: ImageClient, api_key: Option<String>) -> Self {
        Self { images, api_key }
    }
}

#[async_trait]
impl Tool for GenerateImage {
    fn name(&self) -> &'static str {
        "generate_image"
    }

    fn description(&self) -> &'static str {
        "Generate an image from a text prompt. The image is shown to the \
         user directly."
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "What the image should depict."
                },
                "size": {
                    "type": "string",
                    "enum": SIZES,
                    "description": "Image dimensions. Defaults to 1024x1024."
                },
                "quality": {
                    "type": "string",
                    "enum": QUALITIES,
                    "description": "Rendering quality. Defaults to standard."
                }
            },
            "required": ["prompt"]
        })
    }

    async fn execute(&self, _context: &ToolContext, args: serde_json::Value) -> Result<ToolOutput> {
        let prompt = args["prompt"].as_str().unwrap_or("").trim();
        if prompt.is_empty() {
            return Ok(ToolOutput::text("No image prompt was provided."));
        }

        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(ToolOutput::text(
                "Image generation is not configured. Add a provider API key in settings.",
            ));
        };

        let size = args["size"].as_str().unwrap_or("1024x1024");
        if !SIZES.contains(&size) {
            return Ok(ToolOutput::text(format!(
                "Unsupported image size '{size}'. Use one of: {}.",
                SIZES.join(", ")
            )));
        }

        let quality = args["quality"].as_str().unwrap_or("standard");
        if !QUALITIES.contains(&quality) {
            return Ok(ToolOutput::text(format!(
                "Unsupported image quality '{quality}'. Use one of: {}.",
                QUALITIES.join(", ")
            )));
        }

        match self.images.generate(api_key, prompt, size, quality).await {
            Ok(image) => Ok(ToolOutput::with_image(
                "The image was generated successfully and is displayed to the user.",
                image,
            )),
            Err(e) => {
                warn!("image generation failed: {e}");
                Ok(ToolOutput::text(format!("Image generation failed: {e}")))
            }
        }
    }
}
