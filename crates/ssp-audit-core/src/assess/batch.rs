use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::{AssessError, AssessmentResult, Assessor, BatchFailure, BatchOutcome, SecurityControl};
use crate::catalog::ControlCatalog;

/// Sequential batch orchestrator.
///
/// Invokes one classify per control, in input order, and isolates failures:
/// a control whose classification errors is recorded as a `Not Assessed`
/// fallback and the run continues. The outcome always carries exactly one
/// result per input control.
pub struct BatchRunner<'a> {
    assessor: &'a dyn Assessor,
}

impl<'a> BatchRunner<'a> {
    pub fn new(assessor: &'a dyn Assessor) -> Self {
        Self { assessor }
    }

    /// Run the batch over fully resolved controls.
    #[instrument(name = "batch_run", skip_all, fields(controls = controls.len()))]
    pub async fn run(
        &self,
        controls: &[SecurityControl],
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for control in controls {
            self.classify_one(control, cancel, &mut outcome).await;
        }
        outcome
    }

    /// Run the batch over control identifiers, resolving descriptions through
    /// the catalog. An identifier with no catalog entry degrades to the
    /// per-item fallback instead of aborting the run.
    #[instrument(name = "batch_run_ids", skip_all, fields(controls = identifiers.len()))]
    pub async fn run_identifiers(
        &self,
        identifiers: &[String],
        catalog: &ControlCatalog,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in identifiers {
            match catalog.control(id) {
                Some(control) => self.classify_one(&control, cancel, &mut outcome).await,
                None => {
                    let err = AssessError::UnknownControl(id.clone());
                    record_failure(&mut outcome, id, &err);
                }
            }
        }
        outcome
    }

    async fn classify_one(
        &self,
        control: &SecurityControl,
        cancel: &CancellationToken,
        outcome: &mut BatchOutcome,
    ) {
        match self.assessor.classify(control, cancel).await {
            Ok(result) => {
                debug!(control = %control.identifier, status = %result.status, "control classified");
                outcome.results.push(result);
            }
            Err(err) => record_failure(outcome, &control.identifier, &err),
        }
    }
}

fn record_failure(outcome: &mut BatchOutcome, control_id: &str, err: &AssessError) {
    warn!(control = %control_id, error = %err, "classification failed; recording fallback");
    outcome.failures.push(BatchFailure {
        control_id: control_id.to_string(),
        error: err.to_string(),
    });
    outcome
        .results
        .push(AssessmentResult::not_assessed(
            control_id,
            format!("Error: {err}"),
        ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assess::ControlStatus;
    use async_trait::async_trait;

    /// Succeeds with `Effective` except for one poisoned identifier.
    struct FlakyAssessor {
        poison: &'static str,
    }

    #[async_trait]
    impl Assessor for FlakyAssessor {
        async fn classify(
            &self,
            control: &SecurityControl,
            cancel: &CancellationToken,
        ) -> Result<AssessmentResult, AssessError> {
            if cancel.is_cancelled() {
                return Err(AssessError::Cancelled);
            }
            if control.identifier == self.poison {
                return Err(AssessError::Remote("boom".into()));
            }
            Ok(AssessmentResult {
                control_id: control.identifier.clone(),
                status: ControlStatus::Effective,
                evidence: vec!["SomePolicy".into()],
                explanation: String::new(),
            })
        }
    }

    fn controls(ids: &[&str]) -> Vec<SecurityControl> {
        ids.iter()
            .map(|id| SecurityControl::new(*id, *id, "desc"))
            .collect()
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_batch() {
        let assessor = FlakyAssessor { poison: "ISM-0002" };
        let runner = BatchRunner::new(&assessor);
        let outcome = runner
            .run(
                &controls(&["ISM-0001", "ISM-0002", "ISM-0003"]),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.results[0].status, ControlStatus::Effective);
        assert_eq!(outcome.results[1].status, ControlStatus::NotAssessed);
        assert!(outcome.results[1].explanation.starts_with("Error: "));
        assert_eq!(outcome.results[2].status, ControlStatus::Effective);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].control_id, "ISM-0002");
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        let assessor = FlakyAssessor { poison: "none" };
        let runner = BatchRunner::new(&assessor);
        let ids = ["ISM-0003", "ISM-0001", "ISM-0002"];
        let outcome = runner
            .run(&controls(&ids), &CancellationToken::new())
            .await;
        let got: Vec<_> = outcome
            .results
            .iter()
            .map(|r| r.control_id.as_str())
            .collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn cancellation_still_yields_one_result_per_control() {
        let assessor = FlakyAssessor { poison: "none" };
        let runner = BatchRunner::new(&assessor);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = runner.run(&controls(&["ISM-0001", "ISM-0002"]), &cancel).await;
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome
            .results
            .iter()
            .all(|r| r.status == ControlStatus::NotAssessed));
    }

    #[tokio::test]
    async fn unknown_identifier_degrades_to_fallback() {
        let assessor = FlakyAssessor { poison: "none" };
        let runner = BatchRunner::new(&assessor);
        let catalog = ControlCatalog::from_json(
            r#"[{"ISM-0001": {"Description": "Patch applications"}}]"#,
        )
        .unwrap();
        let outcome = runner
            .run_identifiers(
                &["ISM-0001".to_string(), "ISM-MISSING".to_string()],
                &catalog,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].status, ControlStatus::Effective);
        assert_eq!(outcome.results[1].status, ControlStatus::NotAssessed);
        assert!(outcome.results[1].explanation.contains("ISM-MISSING"));
    }
}
