use std::fmt;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::GeminiConfig;

const EXPECTED_VARIANTS: usize = 4;

/// Why a stylization attempt produced no captions.
///
/// The `Display` text of each variant is the message callers see when the
/// result is flattened into a one-element caption list.
#[derive(Debug, thiserror::Error)]
pub enum StylizeError {
    #[error("Error: Network or API request failed. {0}")]
    Network(String),

    #[error("Error: API returned no candidates. Check safety ratings: {}", FeedbackDisplay(.feedback))]
    NoCandidates { feedback: Option<Value> },

    #[error("Error: Failed to decode JSON from API response.")]
    Decode,

    #[error("Error: 'captions' key not found in response.")]
    MissingCaptions,

    #[error("Error: Unexpected API response format. Missing key: '{0}'")]
    MissingField(&'static str),

    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

struct FeedbackDisplay<'a>(&'a Option<Value>);

impl fmt::Display for FeedbackDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value}"),
            None => f.write_str("None"),
        }
    }
}

impl From<reqwest::Error> for StylizeError {
    fn from(err: reqwest::Error) -> Self {
        StylizeError::Network(err.to_string())
    }
}

/// Client for rewriting a base caption through Gemini `generateContent`.
#[derive(Clone)]
pub struct Stylizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl Stylizer {
    pub fn new(config: &GeminiConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/models/{}:generateContent", config.base_url, config.model),
            api_key: config.api_key.clone(),
        })
    }

    /// Requests styled variants of `caption`; every failure comes back as a [`StylizeError`].
    pub async fn stylize(&self, caption: &str, style: &str) -> Result<Vec<String>, StylizeError> {
        let payload = json!({
            "contents": [{
                "parts": [{ "text": build_prompt(caption, style) }]
            }],
            "generationConfig": {
                "responseMimeType": "application/json"
            }
        });

        debug!(endpoint = %self.endpoint, style, "sending stylize request");

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let captions = extract_captions(&body)?;

        if captions.len() != EXPECTED_VARIANTS {
            warn!(
                expected = EXPECTED_VARIANTS,
                received = captions.len(),
                "stylizer returned an unexpected number of captions"
            );
        }
        Ok(captions)
    }

    /// Same as [`Stylizer::stylize`], flattened so that a failure becomes a
    /// single caption holding the error message.
    pub async fn stylize_caption(&self, caption: &str, style: &str) -> Vec<String> {
        flatten(self.stylize(caption, style).await)
    }
}

pub fn flatten(result: Result<Vec<String>, StylizeError>) -> Vec<String> {
    result.unwrap_or_else(|err| vec![err.to_string()])
}

fn build_prompt(caption: &str, style: &str) -> String {
    format!(
        r#"You write captions for Instagram posts.
Rewrite the base caption below in a "{style}" style.
Use at least one emoji in each caption where it fits.
Write {EXPECTED_VARIANTS} different options.

Respond with only a JSON object that has a single key "captions" holding an
array of {EXPECTED_VARIANTS} strings. Do not add any other text.

Example:
{{"captions": ["caption 1", "caption 2", "caption 3", "caption 4"]}}

Base caption: "{caption}""#
    )
}

fn extract_captions(body: &Value) -> Result<Vec<String>, StylizeError> {
    let candidate = body
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .ok_or_else(|| StylizeError::NoCandidates {
            feedback: body.get("promptFeedback").cloned(),
        })?;

    let text = candidate
        .get("content")
        .ok_or(StylizeError::MissingField("content"))?
        .get("parts")
        .ok_or(StylizeError::MissingField("parts"))?
        .get(0)
        .ok_or(StylizeError::MissingField("0"))?
        .get("text")
        .ok_or(StylizeError::MissingField("text"))?
        .as_str()
        .ok_or_else(|| StylizeError::Unexpected("candidate text is not a string".to_string()))?;

    let parsed: Value = serde_json::from_str(text).map_err(|_| StylizeError::Decode)?;
    let parsed = parsed.as_object().ok_or_else(|| {
        StylizeError::Unexpected("candidate text is not a JSON object".to_string())
    })?;
    let captions = parsed
        .get("captions")
        .ok_or(StylizeError::MissingCaptions)?
        .as_array()
        .ok_or_else(|| StylizeError::Unexpected("'captions' is not an array".to_string()))?;

    let captions = captions
        .iter()
        .map(|caption| caption.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| StylizeError::Unexpected("'captions' holds a non-string value".to_string()))?;

    if captions.is_empty() {
        return Err(StylizeError::Unexpected("'captions' is empty".to_string()));
    }
    Ok(captions)
}
