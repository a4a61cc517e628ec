//! Generative-AI mentor: fit analysis, "why it fits" bullets and free-form
//! advice, each with a static fallback when the model can't be reached or
//! answers in an unusable shape.

use std::time::Duration;

use async_trait::async_trait;
use ladder_core::{Opportunity, UserProfile};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ladder-mentor";

pub const DEFAULT_MODEL: &str = "gemini-pro";
pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,
    #[error("could not build http client: {0}")]
    Client(String),
}

#[derive(Debug, Error)]
pub enum MentorError {
    #[error("request to model failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model endpoint returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("model returned no text")]
    EmptyResponse,
}

/// Coarse failure buckets surfaced to the person asking for advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    ModelNotFound,
    InvalidKey,
    Offline,
}

impl MentorError {
    pub fn class(&self) -> FailureClass {
        match self {
            MentorError::Api { status: 404, .. } => FailureClass::ModelNotFound,
            MentorError::Api { message, .. } if message.contains("API key not valid") => {
                FailureClass::InvalidKey
            }
            MentorError::Api { status: 401 | 403, .. } => FailureClass::InvalidKey,
            _ => FailureClass::Offline,
        }
    }
}

/// A single-prompt text model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, MentorError>;
}

/// Client for the Gemini `generateContent` REST call.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ConfigurationError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(ConfigurationError::MissingApiKey);
        }
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigurationError::Client(e.to_string()))?;
        Ok(Self {
            http,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        })
    }

    /// Reads `GEMINI_API_KEY` and, optionally, `GEMINI_MODEL`.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
        let client = Self::new(key)?;
        Ok(match std::env::var("GEMINI_MODEL") {
            Ok(model) if !model.trim().is_empty() => client.with_model(model.trim()),
            _ => client,
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, MentorError> {
        let resp = self
            .http
            .post(self.url())
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({ "contents": [{ "parts": [{ "text": prompt }] }] }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            return Err(MentorError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = resp.json().await?;
        parsed
            .candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
            .ok_or(MentorError::EmptyResponse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FitAnalysis {
    #[serde(deserialize_with = "percent_score")]
    pub fit_score: u8,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub project_pivot: String,
    #[serde(default)]
    pub skill_gaps: Vec<String>,
    #[serde(default)]
    pub roadmap: Vec<String>,
}

/// Any JSON number, rounded and clamped into `0..=100`.
fn percent_score<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(raw.round().clamp(0.0, 100.0) as u8)
}

impl FitAnalysis {
    pub fn fallback() -> Self {
        Self {
            fit_score: 70,
            strengths: strings(&["Technical background", "Academic alignment"]),
            project_pivot: "Leverage your technical projects to meet the core requirements of this role."
                .to_string(),
            skill_gaps: strings(&["Industry Frameworks", "System Scaling"]),
            roadmap: strings(&["Review requirements", "Update portfolio", "Submit application"]),
        }
    }
}

/// Bullets used when the model answered but not with `{"bullets": [...]}`.
pub const WHY_FITS_UNPARSED: [&str; 3] = ["Matches your profile", "Strategic fit", "Relevant skills"];
/// Bullets used when the model could not be reached at all.
pub const WHY_FITS_UNAVAILABLE: [&str; 3] = [
    "Technical alignment",
    "Career growth potential",
    "Skill-matched opportunity",
];

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Deserialize)]
struct Bullets {
    bullets: Vec<String>,
}

/// Return the first balanced `{...}` in `text`, skipping braces inside JSON
/// string literals. Handles prose and markdown fences around the object.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_embedded<T: for<'de> Deserialize<'de>>(text: &str) -> Option<T> {
    let object = extract_first_json_object(text)?;
    match serde_json::from_str(object) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = %err, "model reply is not the expected json");
            None
        }
    }
}

/// The mentor facade. Holds an injected generator; never returns an error.
pub struct Mentor<G> {
    generator: G,
}

impl<G: TextGenerator> Mentor<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub async fn analyze_fit(&self, user: &UserProfile, opp: &Opportunity) -> FitAnalysis {
        let profile = json!({ "major": user.major, "skills": user.skills });
        let listing = json!({ "title": opp.title, "desc": opp.description });
        let prompt = format!(
            "Analyze this career opportunity for {name}.\n\
             Profile: {profile}\n\
             Opportunity: {listing}\n\n\
             Return ONLY a JSON object with this exact structure:\n\
             {{\"fitScore\": number, \"strengths\": string[], \"projectPivot\": \"1-sentence suggestion\", \
             \"skillGaps\": string[], \"roadmap\": string[]}}",
            name = user.name,
        );

        match self.generator.generate(&prompt).await {
            Ok(text) => parse_embedded::<FitAnalysis>(&text).unwrap_or_else(|| {
                warn!(opportunity = %opp.id, "fit analysis unparseable; using fallback");
                FitAnalysis::fallback()
            }),
            Err(err) => {
                warn!(opportunity = %opp.id, error = %err, "fit analysis failed; using fallback");
                FitAnalysis::fallback()
            }
        }
    }

    pub async fn why_fits(&self, user: &UserProfile, opp: &Opportunity) -> Vec<String> {
        let major = user.major.as_deref().unwrap_or("general studies");
        let prompt = format!(
            "Provide 3 bullet points explaining why \"{}\" fits a {major} student. \
             Return as JSON: {{ \"bullets\": [\"point1\", \"point2\", \"point3\"] }}",
            opp.title
        );

        match self.generator.generate(&prompt).await {
            Ok(text) => parse_embedded::<Bullets>(&text)
                .map(|b| b.bullets)
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| strings(&WHY_FITS_UNPARSED)),
            Err(err) => {
                warn!(opportunity = %opp.id, error = %err, "why-fits failed; using fallback");
                strings(&WHY_FITS_UNAVAILABLE)
            }
        }
    }

    pub async fn academic_advice(&self, user: &UserProfile, message: &str) -> String {
        let background = user.major.as_deref().unwrap_or("undeclared major");
        let interests = if user.interests.is_empty() {
            "general technology".to_string()
        } else {
            user.interests.join(", ")
        };
        let prompt = format!(
            "Context: You are a technical career mentor for {name}.\n\
             Background: {background}, interested in {interests}.\n\
             Question: {message}\n\
             Response (technical, brief, and supportive):",
            name = user.name,
        );

        match self.generator.generate(&prompt).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "mentor advice failed");
                advice_diagnostic(&err)
            }
        }
    }
}

/// User-facing text for a failed advice request.
pub fn advice_diagnostic(err: &MentorError) -> String {
    match err.class() {
        FailureClass::ModelNotFound => {
            "Model not found: the configured Gemini model is not available to this API key.".to_string()
        }
        FailureClass::InvalidKey => "Authentication error: check GEMINI_API_KEY.".to_string(),
        FailureClass::Offline => format!("Advisor is offline. ({err})"),
    }
}
