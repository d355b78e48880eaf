use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod batch;
pub mod heuristic;

/// Closed set of compliance classifications a control assessment may produce.
///
/// The labels are frozen: parsing is exact (case and wording), and anything
/// outside this set is rejected rather than coerced. Variants are declared in
/// severity order — a lower [`ControlStatus::rank`] means stronger compliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlStatus {
    Effective,
    Implemented,
    #[serde(rename = "Alternate Control")]
    AlternateControl,
    #[serde(rename = "Partially Implemented")]
    PartiallyImplemented,
    Ineffective,
    #[serde(rename = "Not Implemented")]
    NotImplemented,
    #[serde(rename = "Technically Unfeasible")]
    TechnicallyUnfeasible,
    #[serde(rename = "Not Applicable")]
    NotApplicable,
    #[serde(rename = "Not Assessed")]
    NotAssessed,
}

impl ControlStatus {
    /// Every allowed status, in severity order.
    pub const ALL: [ControlStatus; 9] = [
        ControlStatus::Effective,
        ControlStatus::Implemented,
        ControlStatus::AlternateControl,
        ControlStatus::PartiallyImplemented,
        ControlStatus::Ineffective,
        ControlStatus::NotImplemented,
        ControlStatus::TechnicallyUnfeasible,
        ControlStatus::NotApplicable,
        ControlStatus::NotAssessed,
    ];

    /// Canonical label as it appears in reports and remote responses.
    pub fn label(&self) -> &'static str {
        match self {
            ControlStatus::Effective => "Effective",
            ControlStatus::Implemented => "Implemented",
            ControlStatus::AlternateControl => "Alternate Control",
            ControlStatus::PartiallyImplemented => "Partially Implemented",
            ControlStatus::Ineffective => "Ineffective",
            ControlStatus::NotImplemented => "Not Implemented",
            ControlStatus::TechnicallyUnfeasible => "Technically Unfeasible",
            ControlStatus::NotApplicable => "Not Applicable",
            ControlStatus::NotAssessed => "Not Assessed",
        }
    }

    /// Position in the severity ordering (0 = strongest compliance).
    pub fn rank(&self) -> usize {
        Self::ALL
            .iter()
            .position(|status| status == self)
            .unwrap_or(Self::ALL.len())
    }

    /// Parse a label exactly. Historical variants ("ineffective",
    /// "no usability", ...) are deliberately rejected.
    pub fn parse(label: &str) -> Result<Self, StatusParseError> {
        Self::ALL
            .iter()
            .find(|status| status.label() == label)
            .copied()
            .ok_or_else(|| StatusParseError {
                label: label.to_string(),
            })
    }
}

impl std::fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Rejection of a label that is not part of the frozen taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unrecognized status label `{label}`")]
pub struct StatusParseError {
    pub label: String,
}

/// A formally defined security requirement to be checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityControl {
    pub identifier: String,
    pub title: String,
    pub description: String,
}

impl SecurityControl {
    pub fn new(
        identifier: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            description: description.into(),
        }
    }
}

/// Outcome of assessing one control. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub control_id: String,
    pub status: ControlStatus,
    /// Names of the policy artifacts cited as evidence, in corpus order.
    pub evidence: Vec<String>,
    pub explanation: String,
}

impl AssessmentResult {
    /// The safe fallback: nothing claimed, nothing cited.
    pub fn not_assessed(control_id: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            control_id: control_id.into(),
            status: ControlStatus::NotAssessed,
            evidence: Vec::new(),
            explanation: explanation.into(),
        }
    }
}

/// Per-control failure recorded by the batch orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub control_id: String,
    pub error: String,
}

/// Finalized output of one batch run: exactly one result per input control,
/// in input order, plus the failures that were degraded to fallbacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: Vec<AssessmentResult>,
    pub failures: Vec<BatchFailure>,
}

/// Remote-response validation failures, checked in declaration order.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response is not well-formed structured data: {0}")]
    Malformed(String),
    #[error("response is missing required field `{0}`")]
    SchemaViolation(&'static str),
    #[error(transparent)]
    InvalidStatus(#[from] StatusParseError),
}

/// Errors an assessor may surface from `classify`.
#[derive(Debug, Error)]
pub enum AssessError {
    #[error("assessor not initialized; call initialize() first")]
    NotInitialized,
    #[error("control `{0}` has no catalog entry")]
    UnknownControl(String),
    #[error("classification cancelled")]
    Cancelled,
    #[error("remote reasoning call failed: {0}")]
    Remote(String),
    #[error(transparent)]
    Response(#[from] ResponseError),
}

/// Strategy interface for classifying one control against the shared corpus.
#[async_trait]
pub trait Assessor: Send + Sync {
    /// Classify a single control. Must resolve to a terminal state even when
    /// the cancellation token fires mid-call.
    async fn classify(
        &self,
        control: &SecurityControl,
        cancel: &CancellationToken,
    ) -> Result<AssessmentResult, AssessError>;
}
