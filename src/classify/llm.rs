//! Hosted-model classifier via rig-core.
//!
//! Supports:
//! - **Anthropic**: Direct API access via rig-core
//! - **OpenAI**: Direct API access via rig-core
//!
//! The rig agent is built once at startup; each classification is one
//! prompt call with an independent timeout, parsed by
//! [`super::parse_verdict`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use secrecy::{ExposeSecret, SecretString};

use crate::classify::{Classifier, Verdict, parse_verdict};
use crate::config::{ClassifierConfig, LlmBackend};
use crate::connector::MailMessage;
use crate::error::ClassifyError;

/// Temperature for classification (deterministic-ish).
const CLASSIFY_TEMPERATURE: f64 = 0.1;

/// Body text beyond this is not shown to the oracle.
const MAX_ORACLE_BODY_CHARS: usize = 4000;

const PREAMBLE: &str = "You are an email triage assistant. You classify emails \
    into exactly one of three categories and answer only with a JSON object.";

/// Minimal oracle transport — one prompt in, raw text out. Lets the two
/// rig backend types hide behind one object.
#[async_trait]
trait OracleTransport: Send + Sync {
    async fn prompt(&self, input: &str) -> Result<String, ClassifyError>;
}

struct AgentTransport<M: rig::completion::CompletionModel> {
    agent: rig::agent::Agent<M>,
}

#[async_trait]
impl<M> OracleTransport for AgentTransport<M>
where
    M: rig::completion::CompletionModel + Send + Sync + 'static,
{
    async fn prompt(&self, input: &str) -> Result<String, ClassifyError> {
        self.agent
            .prompt(input)
            .await
            .map_err(|e| ClassifyError::RequestFailed(e.to_string()))
    }
}

/// Classifier backed by a hosted language model.
pub struct LlmClassifier {
    transport: Arc<dyn OracleTransport>,
    model: String,
    timeout: Duration,
}

impl LlmClassifier {
    pub fn new(config: &ClassifierConfig, api_key: SecretString) -> Result<Self, ClassifyError> {
        let transport: Arc<dyn OracleTransport> = match config.backend {
            LlmBackend::Anthropic => {
                use rig::providers::anthropic;

                let client: rig::client::Client<anthropic::client::AnthropicExt> =
                    anthropic::Client::new(api_key.expose_secret()).map_err(|e| {
                        ClassifyError::RequestFailed(format!(
                            "Failed to create Anthropic client: {e}"
                        ))
                    })?;
                let agent = client
                    .agent(&config.model)
                    .preamble(PREAMBLE)
                    .temperature(CLASSIFY_TEMPERATURE)
                    .build();
                tracing::info!("Using Anthropic oracle (model: {})", config.model);
                Arc::new(AgentTransport { agent })
            }
            LlmBackend::OpenAi => {
                use rig::providers::openai;

                let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                    openai::Client::new(api_key.expose_secret()).map_err(|e| {
                        ClassifyError::RequestFailed(format!("Failed to create OpenAI client: {e}"))
                    })?;
                let agent = client
                    .agent(&config.model)
                    .preamble(PREAMBLE)
                    .temperature(CLASSIFY_TEMPERATURE)
                    .build();
                tracing::info!("Using OpenAI oracle (model: {})", config.model);
                Arc::new(AgentTransport { agent })
            }
        };

        Ok(Self {
            transport,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        message: &MailMessage,
        rule_text: &str,
    ) -> Result<Verdict, ClassifyError> {
        let prompt = build_classification_prompt(message, rule_text);

        let raw = tokio::time::timeout(self.timeout, self.transport.prompt(&prompt))
            .await
            .map_err(|_| ClassifyError::Timeout {
                timeout: self.timeout,
            })??;

        parse_verdict(&raw)
    }
}

/// Render a message plus the operator's criteria into the oracle prompt.
fn build_classification_prompt(message: &MailMessage, rule_text: &str) -> String {
    format!(
        "Classify the email below into one of three categories.\n\
        \n\
        IMPORTANT / JUNK — per the operator's criteria:\n\
        {rule_text}\n\
        \n\
        NORMAL — everything else.\n\
        \n\
        EMAIL TO CLASSIFY:\n\
        {email}\n\
        \n\
        Respond with a JSON object containing:\n\
        - priority: \"important\", \"normal\", or \"junk\"\n\
        - confidence: 0.0-1.0\n\
        - reasoning: brief explanation\n\
        - summary: concise 140-character summary (required for important)\n",
        email = oracle_text(message)
    )
}

/// Plaintext rendering of a message for the oracle, body truncated.
fn oracle_text(message: &MailMessage) -> String {
    let body = message.body.as_deref().unwrap_or("(body unavailable)");
    let body: String = body.chars().take(MAX_ORACLE_BODY_CHARS).collect();
    format!(
        "From: {}\nSubject: {}\nDate: {}\n\n{}",
        message.sender,
        message.subject,
        message.received_at.to_rfc3339(),
        body
    )
}
