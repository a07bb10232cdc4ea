//! Message classification — verdicts from a pluggable decision oracle.

pub mod llm;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use llm::LlmClassifier;

use crate::config::{ClassifierConfig, LlmBackend};
use crate::connector::MailMessage;
use crate::error::{ClassifyError, ConfigError, Error};

/// Classification category for a message. Doubles as the ledger outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Important,
    Normal,
    Junk,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Important => "important",
            Self::Normal => "normal",
            Self::Junk => "junk",
        }
    }
}

/// Result of classifying one message. Produced fresh per classification
/// call; only the outcome survives, in the ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct Verdict {
    pub priority: Priority,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reasoning: String,
    /// Terse summary; populated for Important messages.
    #[serde(default)]
    pub summary: Option<String>,
}

impl Verdict {
    pub fn is_important(&self) -> bool {
        self.priority == Priority::Important
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify a message against the operator's rule text.
    ///
    /// The production oracle is non-deterministic; callers must not assume
    /// the same message classifies the same way twice.
    async fn classify(
        &self,
        message: &MailMessage,
        rule_text: &str,
    ) -> Result<Verdict, ClassifyError>;
}

/// Build the configured oracle-backed classifier, reading the API key for
/// the selected backend from the environment.
pub fn create_classifier(config: &ClassifierConfig) -> Result<Arc<dyn Classifier>, Error> {
    let var = match config.backend {
        LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
        LlmBackend::OpenAi => "OPENAI_API_KEY",
    };
    let api_key = std::env::var(var)
        .map(secrecy::SecretString::from)
        .map_err(|_| ConfigError::MissingEnvVar(var.to_string()))?;
    Ok(Arc::new(LlmClassifier::new(config, api_key)?))
}

/// Parse a verdict from raw oracle output.
///
/// Tolerates prose and markdown fences around the JSON object — everything
/// outside the outermost braces is discarded. Confidence is clamped to
/// [0.0, 1.0].
pub fn parse_verdict(raw: &str) -> Result<Verdict, ClassifyError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => {
            return Err(ClassifyError::MalformedResponse(format!(
                "no JSON object in oracle output: {}",
                raw.chars().take(120).collect::<String>()
            )));
        }
    };

    let mut verdict: Verdict = serde_json::from_str(json)
        .map_err(|e| ClassifyError::MalformedResponse(e.to_string()))?;
    verdict.confidence = verdict.confidence.clamp(0.0, 1.0);
    if verdict.summary.as_deref().is_some_and(|s| s.trim().is_empty()) {
        verdict.summary = None;
    }
    Ok(verdict)
}
