use async_trait::async_trait;
use base64::Engine;
use garde::Validate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::analysis::FoodAnalysis;
use crate::models::job::MealType;

const DEFAULT_MODEL: &str = "@cf/llava-hf/llava-1.5-7b-hf";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// The external vision collaborator: image bytes in, structured dish and
/// nutrition data out.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, image: &[u8], meal_type: MealType) -> Result<FoodAnalysis, AnalysisError>;
}

/// Failure raised by a vision analyzer, tagged at the boundary so that the
/// classifier never has to sniff free text.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum AnalysisError {
    #[error("vision API returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("network error ({code}): {message}")]
    Network { code: String, message: String },

    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("could not parse model output: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Client for Cloudflare Workers AI vision models.
pub struct WorkersAiClient {
    http: Client,
    account_id: String,
    api_token: String,
    model: String,
}

#[derive(Deserialize)]
struct WorkersAiResponse {
    result: WorkersAiResult,
}

#[derive(Deserialize)]
struct WorkersAiResult {
    #[serde(alias = "response")]
    description: String,
}

#[derive(Deserialize)]
struct WorkersAiErrorBody {
    #[serde(default)]
    errors: Vec<WorkersAiErrorEntry>,
}

#[derive(Deserialize)]
struct WorkersAiErrorEntry {
    message: String,
}

/// Shape the model is asked to produce; `is_food` lets it refuse non-food photos.
#[derive(Deserialize)]
struct ModelAnswer {
    #[serde(default = "default_is_food")]
    is_food: bool,
    #[serde(flatten)]
    analysis: serde_json::Map<String, serde_json::Value>,
}

fn default_is_food() -> bool {
    true
}

impl WorkersAiClient {
    pub fn new(account_id: &str, api_token: &str) -> Result<Self, reqwest::Error> {
        Self::with_model(account_id, api_token, DEFAULT_MODEL)
    }

    pub fn with_model(account_id: &str, api_token: &str, model: &str) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            model: model.to_string(),
        })
    }

    fn prompt(meal_type: MealType) -> String {
        format!(
            concat!(
                "Analyze this photo of a {} meal and respond with ONLY valid JSON using these fields: ",
                "is_food (boolean, false if the photo does not show food), ",
                "dish_name (string), ",
                "items (array of objects with name, portion, calories), ",
                "nutrition (object with calories, protein_g, carbs_g, fat_g, fiber_g as numbers), ",
                "confidence (number between 0 and 1), notes (string, optional)."
            ),
            meal_type
        )
    }
}

#[async_trait]
impl VisionAnalyzer for WorkersAiClient {
    async fn analyze(&self, image: &[u8], meal_type: MealType) -> Result<FoodAnalysis, AnalysisError> {
        image::guess_format(image)
            .map_err(|e| AnalysisError::InvalidImage(format!("unsupported format: {e}")))?;

        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, self.model
        );

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(image),
            "prompt": Self::prompt(meal_type),
            "max_tokens": 512
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, &body));
        }

        let body: WorkersAiResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Parse(e.to_string()))?;

        parse_analysis(&body.result.description)
    }
}

/// Tag a transport-level reqwest failure.
fn transport_error(err: reqwest::Error) -> AnalysisError {
    let code = if err.is_timeout() {
        "ETIMEDOUT"
    } else if err.is_connect() {
        "ECONNREFUSED"
    } else if err.is_request() || err.is_body() {
        "ECONNRESET"
    } else {
        return AnalysisError::Other(err.to_string());
    };
    AnalysisError::Network {
        code: code.to_string(),
        message: err.to_string(),
    }
}

/// Tag a non-success HTTP response from the vision API.
pub(crate) fn http_error(status: StatusCode, body: &str) -> AnalysisError {
    let message = serde_json::from_str::<WorkersAiErrorBody>(body)
        .ok()
        .and_then(|b| b.errors.into_iter().next())
        .map(|e| e.message)
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNSUPPORTED_MEDIA_TYPE
        | StatusCode::UNPROCESSABLE_ENTITY => AnalysisError::InvalidImage(message),
        StatusCode::BAD_REQUEST if message.to_lowercase().contains("image") => {
            AnalysisError::InvalidImage(message)
        }
        _ => AnalysisError::Http {
            status: status.as_u16(),
            message,
        },
    }
}

/// Decode the model's free-text answer into a validated `FoodAnalysis`.
pub fn parse_analysis(text: &str) -> Result<FoodAnalysis, AnalysisError> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &text[s..=e],
        _ => return Err(AnalysisError::Parse("no JSON object in model output".to_string())),
    };

    let answer: ModelAnswer =
        serde_json::from_str(json).map_err(|e| AnalysisError::Parse(e.to_string()))?;
    if !answer.is_food {
        return Err(AnalysisError::InvalidImage("photo does not show food".to_string()));
    }

    let analysis: FoodAnalysis = serde_json::from_value(serde_json::Value::Object(answer.analysis))
        .map_err(|e| AnalysisError::Parse(e.to_string()))?;
    analysis
        .validate()
        .map_err(|report| AnalysisError::Parse(report.to_string()))?;

    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "is_food": true,
        "dish_name": "Chicken Caesar Salad",
        "items": [{"name": "romaine", "portion": "2 cups", "calories": 16}],
        "nutrition": {"calories": 470, "protein_g": 38, "carbs_g": 12, "fat_g": 30},
        "confidence": 0.82
    }"#;

    #[test]
    fn test_parse_plain_json() {
        let analysis = parse_analysis(VALID).unwrap();
        assert_eq!(analysis.dish_name, "Chicken Caesar Salad");
        assert_eq!(analysis.items.len(), 1);
        assert_eq!(analysis.nutrition.calories, 470.0);
    }

    #[test]
    fn test_parse_fenced_json() {
        let text = format!("Here is the analysis:\n```json\n{VALID}\n```");
        assert!(parse_analysis(&text).is_ok());
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = parse_analysis("I think this is a salad.").unwrap_err();
        assert!(matches!(err, AnalysisError::Parse(_)));
    }

    #[test]
    fn test_parse_rejects_out_of_range_values() {
        let text = r#"{"dish_name": "Soup", "nutrition": {"calories": -5, "protein_g": 1, "carbs_g": 1, "fat_g": 1}}"#;
        assert!(matches!(parse_analysis(text), Err(AnalysisError::Parse(_))));
    }

    #[test]
    fn test_non_food_is_invalid_image() {
        let text = r#"{"is_food": false}"#;
        assert!(matches!(parse_analysis(text), Err(AnalysisError::InvalidImage(_))));
    }

    #[test]
    fn test_http_error_mapping() {
        let body = r#"{"success": false, "errors": [{"code": 3040, "message": "Capacity temporarily exceeded"}]}"#;
        assert_eq!(
            http_error(StatusCode::SERVICE_UNAVAILABLE, body),
            AnalysisError::Http {
                status: 503,
                message: "Capacity temporarily exceeded".to_string()
            }
        );
        assert!(matches!(
            http_error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "nope"),
            AnalysisError::InvalidImage(_)
        ));
        assert!(matches!(
            http_error(StatusCode::BAD_REQUEST, r#"{"errors": [{"message": "Invalid image data"}]}"#),
            AnalysisError::InvalidImage(_)
        ));
        assert!(matches!(
            http_error(StatusCode::BAD_REQUEST, "missing prompt"),
            AnalysisError::Http { status: 400, .. }
        ));
    }

    #[tokio::test]
    async fn test_non_image_bytes_rejected_before_request() {
        let client = WorkersAiClient::new("account", "token").unwrap();
        let err = client.analyze(b"plain text", MealType::Lunch).await.unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidImage(_)));
    }
}
