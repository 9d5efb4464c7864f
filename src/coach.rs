use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use crate::models::{LoggedSymptom, MetricsSnapshot};
use crate::source::is_loopback;

pub const SYSTEM_INSTRUCTION: &str = "You are the EcoBreath AI Health Coach, a knowledgeable, empathetic and concise assistant that helps users manage their respiratory health based on real-time environmental data and their logged symptoms.

Your tone is supportive, medically informed but accessible, and safety-first. You NEVER diagnose conditions or replace a doctor, but you offer practical advice like \"Stay indoors\", \"Use your inhaler\" or \"Hydrate\".

Keep responses very concise (1-3 short paragraphs), relevant to the provided data, and use markdown to emphasize key points.";

pub const KEY_MISSING_REPLY: &str =
    "Error: Gemini API key is missing. Set GEMINI_API_KEY in your environment to enable the coach chat.";
pub const ERROR_REPLY: &str = "I encountered an error connecting to my servers. Please try again later or check your API key configuration.";
pub const EMPTY_REPLY: &str = "I'm sorry, I couldn't generate a response at this time.";

pub const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
const MAX_PROMPT_SYMPTOMS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum CoachError {
    #[error("text generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("text generation service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    fn tag(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Model => "MODEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
    pub name: String,
    pub focus: String,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: "User".to_string(),
            focus: "respiratory health".to_string(),
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system_instruction: &str, prompt: &str) -> Result<String, CoachError>;
}

/// REST client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f64,
}

impl GeminiClient {
    /// `base_url` is the models collection, e.g. [`GEMINI_ENDPOINT`].
    pub fn new(api_key: &str, base_url: &str) -> Result<Self, CoachError> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if is_loopback(base_url) {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
        })
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, system_instruction: &str, prompt: &str) -> Result<String, CoachError> {
        #[derive(Deserialize)]
        struct GenerateResponse {
            #[serde(default)]
            candidates: Vec<Candidate>,
        }
        #[derive(Deserialize)]
        struct Candidate {
            content: Option<Content>,
        }
        #[derive(Deserialize)]
        struct Content {
            #[serde(default)]
            parts: Vec<Part>,
        }
        #[derive(Deserialize)]
        struct Part {
            #[serde(default)]
            text: Option<String>,
        }

        let url = format!("{}/{}:generateContent", self.base_url, self.model);
        let body = json!({
            "systemInstruction": {"parts": [{"text": system_instruction}]},
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": self.temperature},
        });

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(CoachError::Status { status, body });
        }

        let parsed: GenerateResponse = resp.json().await?;
        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        Ok(text)
    }
}

pub fn build_prompt(
    profile: &UserProfile,
    message: &str,
    history: &[ChatMessage],
    metrics: Option<&MetricsSnapshot>,
    symptoms: &[LoggedSymptom],
) -> String {
    let mut prompt = String::new();

    if !history.is_empty() {
        let turns: Vec<String> = history
            .iter()
            .map(|turn| format!("{}: {}", turn.role.tag(), turn.text))
            .collect();
        let _ = writeln!(prompt, "PREVIOUS CHAT HISTORY:");
        let _ = write!(prompt, "{}\n\n", turns.join("\n\n"));
    }

    let _ = writeln!(prompt, "CURRENT CONTEXT:");
    let _ = writeln!(
        prompt,
        "- User Profile: Name is {}, Primary Health Focus is {}",
        profile.name, profile.focus
    );

    match metrics {
        Some(m) => {
            let _ = writeln!(
                prompt,
                "- Environment: Temp: {:.1}°C, Humidity: {:.0}%, AQI: {:.0} (Risk: {})",
                m.temperature, m.humidity, m.air_quality, m.overall_risk
            );
        }
        None => {
            let _ = writeln!(prompt, "- Environment: Data loading or unavailable.");
        }
    }

    if symptoms.is_empty() {
        let _ = writeln!(prompt, "- User's recent logged symptoms: None.");
    } else {
        let _ = writeln!(prompt, "- User's recent logged symptoms:");
        for symptom in symptoms.iter().take(MAX_PROMPT_SYMPTOMS) {
            let _ = writeln!(
                prompt,
                "   * {} ({}) on {}",
                symptom.symptom,
                symptom.severity,
                symptom.timestamp.format("%Y-%m-%d %H:%M UTC")
            );
        }
    }

    let _ = write!(prompt, "\nUSER MESSAGE: {}", message);
    prompt
}

pub struct CoachBridge {
    generator: Option<Arc<dyn TextGenerator>>,
    profile: UserProfile,
}

impl CoachBridge {
    pub fn new(generator: Option<Arc<dyn TextGenerator>>, profile: UserProfile) -> Self {
        Self { generator, profile }
    }

    /// Builds a Gemini-backed bridge; a missing or blank key yields a bridge
    /// that answers with [`KEY_MISSING_REPLY`].
    pub fn from_api_key(
        api_key: Option<&str>,
        base_url: &str,
        profile: UserProfile,
    ) -> Result<Self, CoachError> {
        let generator: Option<Arc<dyn TextGenerator>> = match api_key.map(str::trim) {
            Some(key) if !key.is_empty() => Some(Arc::new(GeminiClient::new(key, base_url)?)),
            _ => None,
        };
        Ok(Self::new(generator, profile))
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    /// Never fails: configuration and transport problems become canned replies.
    pub async fn respond(
        &self,
        message: &str,
        history: &[ChatMessage],
        metrics: Option<&MetricsSnapshot>,
        symptoms: &[LoggedSymptom],
    ) -> String {
        let Some(generator) = self.generator.as_ref() else {
            return KEY_MISSING_REPLY.to_string();
        };

        let prompt = build_prompt(&self.profile, message, history, metrics, symptoms);
        debug!(turns = history.len(), prompt_len = prompt.len(), "sending coach prompt");

        match generator.generate(SYSTEM_INSTRUCTION, &prompt).await {
            Ok(reply) if reply.trim().is_empty() => EMPTY_REPLY.to_string(),
            Ok(reply) => reply,
            Err(err) => {
                error!(error = %err, "coach generation failed");
                ERROR_REPLY.to_string()
            }
        }
    }
}
