use std::collections::HashSet;
use std::sync::Arc;

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::{AssessError, AssessmentResult, Assessor, ControlStatus, SecurityControl};
use crate::corpus::{PolicyArtifact, PolicyCorpus};

/// Coverage ratio at or above which a control is rated `Effective`.
const EFFECTIVE_THRESHOLD: f64 = 0.8;
/// Coverage ratio at or above which a control is rated `Implemented`.
const IMPLEMENTED_THRESHOLD: f64 = 0.5;
/// Tokens at or below this length never count as keywords.
const MIN_KEYWORD_LEN: usize = 3;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "are", "that", "with", "this", "have", "has", "had", "was", "were",
        "from", "been", "being", "will", "would", "should", "shall", "can", "could", "may",
        "might", "not", "its", "all", "any", "each", "into", "over", "such", "than", "then",
        "when", "where", "which", "while", "within", "without", "upon", "per", "via", "also",
        "only", "other", "there", "their", "they", "them", "these", "those", "must", "does",
        "used", "using", "use",
    ]
    .into_iter()
    .collect()
});

/// Deterministic keyword-coverage classifier. No remote dependency, no I/O
/// beyond the in-memory corpus, and identical output for identical input.
pub struct HeuristicAssessor {
    corpus: Arc<PolicyCorpus>,
}

impl HeuristicAssessor {
    pub fn new(corpus: Arc<PolicyCorpus>) -> Self {
        Self { corpus }
    }

    /// Classify a control against the shared corpus.
    ///
    /// Always returns a taxonomy member; never fails for a well-formed corpus.
    #[instrument(name = "heuristic_classify", skip(self, control), fields(control = %control.identifier))]
    pub fn classify_control(&self, control: &SecurityControl) -> AssessmentResult {
        let keywords = extract_keywords(control);
        let (evidence, covered) = match_artifacts(&keywords, self.corpus.artifacts());

        let coverage_ratio = if keywords.is_empty() {
            0.0
        } else {
            covered.len() as f64 / keywords.len() as f64
        };

        let status = if evidence.is_empty() {
            ControlStatus::NotAssessed
        } else if coverage_ratio >= EFFECTIVE_THRESHOLD {
            ControlStatus::Effective
        } else if coverage_ratio >= IMPLEMENTED_THRESHOLD {
            ControlStatus::Implemented
        } else if coverage_ratio > 0.0 {
            ControlStatus::Ineffective
        } else {
            ControlStatus::NotImplemented
        };

        debug!(
            keywords = keywords.len(),
            covered = covered.len(),
            artifacts = evidence.len(),
            %status,
            "keyword coverage computed"
        );

        let explanation = format!(
            "Keyword coverage {covered}/{total} across {artifacts} relevant artifact(s).",
            covered = covered.len(),
            total = keywords.len(),
            artifacts = evidence.len(),
        );

        AssessmentResult {
            control_id: control.identifier.clone(),
            status,
            evidence,
            explanation,
        }
    }
}

#[async_trait]
impl Assessor for HeuristicAssessor {
    async fn classify(
        &self,
        control: &SecurityControl,
        _cancel: &CancellationToken,
    ) -> Result<AssessmentResult, AssessError> {
        Ok(self.classify_control(control))
    }
}

/// Lowercased control keywords with stop words and short tokens removed,
/// deduplicated in first-occurrence order.
fn extract_keywords(control: &SecurityControl) -> Vec<String> {
    let text = format!("{} {}", control.title, control.description).to_lowercase();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if token.len() < MIN_KEYWORD_LEN || STOP_WORDS.contains(token) {
            continue;
        }
        if seen.insert(token.to_string()) {
            keywords.push(token.to_string());
        }
    }
    keywords
}

/// Relevant artifact names (corpus order) and the set of covered keyword
/// indices, using one case-insensitive automaton over all keywords.
///
/// Coverage is substring occurrence, so the scan must be overlapping: a
/// keyword nested inside a longer matched keyword still counts.
fn match_artifacts(
    keywords: &[String],
    artifacts: &[PolicyArtifact],
) -> (Vec<String>, HashSet<usize>) {
    let mut evidence = Vec::new();
    let mut covered = HashSet::new();
    if keywords.is_empty() {
        return (evidence, covered);
    }
    let Ok(automaton) = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(keywords)
    else {
        return (evidence, covered);
    };

    for artifact in artifacts {
        let text = searchable_text(artifact);
        let mut relevant = false;
        for mat in automaton.find_overlapping_iter(&text) {
            relevant = true;
            covered.insert(mat.pattern().as_usize());
        }
        if relevant {
            evidence.push(artifact.name.clone());
        }
    }
    (evidence, covered)
}

/// Concatenation of name, description, and all setting values.
fn searchable_text(artifact: &PolicyArtifact) -> String {
    let mut text = String::new();
    text.push_str(&artifact.name);
    text.push(' ');
    text.push_str(&artifact.description);
    for value in artifact.settings.values() {
        text.push(' ');
        text.push_str(value);
    }
    text
}
