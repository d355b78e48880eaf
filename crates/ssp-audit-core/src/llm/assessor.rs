use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{drain_chunks, AzureReasoningClient, LlmSettings, ReasoningClient};
use crate::assess::{
    AssessError, AssessmentResult, Assessor, ControlStatus, ResponseError, SecurityControl,
};
use crate::corpus::PolicyCorpus;

const EMPTY_CORPUS_EXPLANATION: &str = "No policies available for assessment";

/// Reasoning-backed assessor: builds a grounded instruction from (control,
/// corpus, taxonomy), invokes the remote session once per control, and
/// validates the structured reply against the frozen taxonomy.
///
/// Requires an explicit [`LlmAssessor::initialize`] before the first
/// classification; the session it establishes is owned by this instance and
/// released by [`LlmAssessor::teardown`]. The session is one logical
/// conversation, so classify holds a lock on it for the full invocation and
/// concurrent callers are serialized.
pub struct LlmAssessor {
    settings: LlmSettings,
    corpus: Arc<PolicyCorpus>,
    client: Mutex<Option<Box<dyn ReasoningClient>>>,
}

/// Structured reply expected from the remote service.
#[derive(Debug, Deserialize)]
struct AgentResponse {
    status: Option<String>,
    #[serde(alias = "relevant_policies")]
    evidence: Option<Vec<String>>,
    #[serde(default)]
    explanation: Option<String>,
}

impl LlmAssessor {
    pub fn new(settings: LlmSettings, corpus: Arc<PolicyCorpus>) -> Self {
        Self {
            settings,
            corpus,
            client: Mutex::new(None),
        }
    }

    /// Establish the remote session. Attempts teardown of any partial state
    /// before surfacing an initialization failure.
    pub async fn initialize(&self) -> Result<()> {
        match AzureReasoningClient::new(&self.settings) {
            Ok(client) => {
                *self.client.lock().await = Some(Box::new(client));
                Ok(())
            }
            Err(err) => {
                self.teardown().await;
                Err(err).context("failed to establish reasoning session")
            }
        }
    }

    /// Adopt an already-established session.
    #[cfg(test)]
    fn with_client(corpus: Arc<PolicyCorpus>, client: Box<dyn ReasoningClient>) -> Self {
        Self {
            settings: LlmSettings {
                api_key: String::new(),
                endpoint: None,
                deployment: None,
                api_version: None,
                timeout_secs: None,
                max_retries: 0,
            },
            corpus,
            client: Mutex::new(Some(client)),
        }
    }

    /// Release the remote session. Best-effort: failures are swallowed.
    pub async fn teardown(&self) {
        if let Some(client) = self.client.lock().await.take() {
            if let Err(err) = client.close().await {
                debug!(error = %err, "reasoning session teardown failed; ignoring");
            }
        }
    }

    /// One remote invocation plus the full validation ladder. Every failure
    /// mode surfaces as a typed error so the fallback in `classify` stays an
    /// explicit, testable branch.
    async fn invoke(
        &self,
        client: &dyn ReasoningClient,
        control: &SecurityControl,
        cancel: &CancellationToken,
    ) -> Result<AssessmentResult, AssessError> {
        let prompt = build_prompt(control, &self.corpus);
        let stream = client
            .complete(&prompt, cancel)
            .await
            .map_err(|err| AssessError::Remote(err.to_string()))?;
        // the chunk sequence must be fully drained; partial output is never a result
        let text = drain_chunks(stream)
            .await
            .map_err(|err| AssessError::Remote(err.to_string()))?;

        let payload = extract_json_payload(&text)
            .ok_or_else(|| ResponseError::Malformed("no JSON object found".into()))?;
        let response: AgentResponse = parse_lenient(&payload)?;

        let status_label = response
            .status
            .ok_or(ResponseError::SchemaViolation("status"))?;
        let evidence = response
            .evidence
            .ok_or(ResponseError::SchemaViolation("evidence"))?;
        let status =
            ControlStatus::parse(&status_label).map_err(ResponseError::InvalidStatus)?;

        Ok(AssessmentResult {
            control_id: control.identifier.clone(),
            status,
            evidence,
            explanation: response.explanation.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl Assessor for LlmAssessor {
    #[instrument(name = "llm_classify", skip_all, fields(control = %control.identifier))]
    async fn classify(
        &self,
        control: &SecurityControl,
        cancel: &CancellationToken,
    ) -> Result<AssessmentResult, AssessError> {
        // held for the whole invocation: the session must not interleave
        // prompts from concurrent callers
        let guard = self.client.lock().await;
        let client = guard.as_deref().ok_or(AssessError::NotInitialized)?;

        if self.corpus.is_empty() {
            return Ok(AssessmentResult::not_assessed(
                &control.identifier,
                EMPTY_CORPUS_EXPLANATION,
            ));
        }

        match self.invoke(client, control, cancel).await {
            Ok(result) => {
                debug!(status = %result.status, "remote assessment accepted");
                Ok(result)
            }
            // assessment must not crash the batch: remote and validation
            // failures degrade to the safe fallback
            Err(err) => {
                warn!(error = %err, "remote assessment failed; returning fallback");
                Ok(AssessmentResult::not_assessed(&control.identifier, ""))
            }
        }
    }
}

/// Grounded instruction: control, allowed labels verbatim, corpus rendering,
/// and the required response shape.
fn build_prompt(control: &SecurityControl, corpus: &PolicyCorpus) -> String {
    let mut prompt = String::new();
    let _ = writeln!(
        prompt,
        "Assess whether the following security control is implemented by the provided policies."
    );
    let _ = writeln!(prompt, "\nSecurity Control:");
    let _ = writeln!(prompt, "Title: {}", control.title);
    let _ = writeln!(prompt, "Description: {}", control.description);
    let _ = writeln!(prompt, "\nAllowed Implementation Statuses:");
    for status in ControlStatus::ALL {
        let _ = writeln!(prompt, "- {}", status.label());
    }
    let _ = writeln!(prompt, "\nAvailable Policies:\n{}", corpus.render());
    let _ = writeln!(
        prompt,
        "Respond ONLY in this JSON format:\n{{\n  \"status\": \"one of the allowed statuses, verbatim\",\n  \"evidence\": [\"names of the policies that address this control\"],\n  \"explanation\": \"concise, evidence-based reasoning\"\n}}"
    );
    prompt
}

/// Best-effort extraction of a JSON object from free-form output: strip a
/// code fence if present, then slice the outermost brace pair. Kept in one
/// place so schema-constrained output can replace it without touching the
/// rest of the assessor.
fn extract_json_payload(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let body = strip_code_fence(trimmed).unwrap_or_else(|| trimmed.to_string());
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if start >= end {
        return None;
    }
    Some(body[start..=end].to_string())
}

fn strip_code_fence(input: &str) -> Option<String> {
    let mut trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    trimmed = trimmed.trim_start_matches("```");
    trimmed = trimmed.trim_start_matches(|c: char| c.is_ascii_whitespace());
    if let Some(rest) = trimmed.strip_prefix("json") {
        trimmed = rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
    }
    let end = trimmed.rfind("```").unwrap_or(trimmed.len());
    Some(trimmed[..end].trim().to_string())
}

/// Strict JSON first, then json5 for almost-JSON replies (trailing commas,
/// single quotes).
fn parse_lenient(payload: &str) -> Result<AgentResponse, ResponseError> {
    if let Ok(response) = serde_json::from_str::<AgentResponse>(payload) {
        return Ok(response);
    }
    json5::from_str::<AgentResponse>(payload)
        .map_err(|err| ResponseError::Malformed(err.to_string()))
}
