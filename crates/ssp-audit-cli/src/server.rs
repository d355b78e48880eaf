//! HTTP surface over the batch assessor: one endpoint conducts a batch and
//! writes a merged report, a second serves the written reports back.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use ssp_audit_core::report::{outcome_rows, AssessmentRow};
use ssp_audit_core::{merge_results, Assessor, BatchRunner, ControlCatalog};

const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

pub struct AppState {
    pub assessor: Arc<dyn Assessor>,
    pub catalog: ControlCatalog,
    pub template: PathBuf,
    pub reports_dir: PathBuf,
    /// Batch runs share one assessor, and a reasoning session is a single
    /// logical conversation; batches are serialized, never interleaved.
    pub run_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(
        assessor: Arc<dyn Assessor>,
        catalog: ControlCatalog,
        template: PathBuf,
        reports_dir: PathBuf,
    ) -> Self {
        Self {
            assessor,
            catalog,
            template,
            reports_dir,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AssessmentRequest {
    items: Vec<String>,
}

#[derive(Debug, Serialize)]
struct AssessmentResponse {
    output_file: String,
    assessments: Vec<AssessmentRow>,
}

#[derive(Debug, Error)]
enum AppError {
    #[error("report not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(name) => (StatusCode::NOT_FOUND, format!("report not found: {name}")),
            AppError::Internal(err) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub async fn serve(addr: &str, state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    std::fs::create_dir_all(&state.reports_dir).with_context(|| {
        format!(
            "failed to create reports directory {}",
            state.reports_dir.display()
        )
    })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "assessment API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("server error")?;
    Ok(())
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/conduct-assessment", post(conduct_assessment))
        .route("/reports/:filename", get(fetch_report))
        .with_state(state)
}

async fn conduct_assessment(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AssessmentRequest>,
) -> Result<Json<AssessmentResponse>, AppError> {
    let outcome = {
        let _run = state.run_lock.lock().await;
        BatchRunner::new(state.assessor.as_ref())
            .run_identifiers(&request.items, &state.catalog, &CancellationToken::new())
            .await
    };

    let filename = report_filename();
    let output = state.reports_dir.join(&filename);
    merge_results(&outcome.results, &state.template, &output)
        .map_err(|err| AppError::Internal(anyhow::Error::new(err)))?;
    info!(file = %output.display(), controls = outcome.results.len(), "assessment report written");

    Ok(Json(AssessmentResponse {
        output_file: filename,
        assessments: outcome_rows(&outcome),
    }))
}

async fn fetch_report(
    State(state): State<Arc<AppState>>,
    UrlPath(filename): UrlPath<String>,
) -> Result<Response, AppError> {
    if !is_safe_filename(&filename) {
        return Err(AppError::NotFound(filename));
    }
    let path = state.reports_dir.join(&filename);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| AppError::NotFound(filename))?;
    Ok(([(header::CONTENT_TYPE, XLSX_CONTENT_TYPE)], bytes).into_response())
}

fn report_filename() -> String {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("ssp-assessment-{epoch}.xlsx")
}

// Report names are served straight from the reports directory, so anything
// that could escape it is rejected outright.
fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use ssp_audit_core::{AssessError, AssessmentResult, SecurityControl};

    /// Tracks in-flight classifications so batch overlap would be observable.
    struct SlowAssessor {
        current: Arc<AtomicUsize>,
        max: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Assessor for SlowAssessor {
        async fn classify(
            &self,
            control: &SecurityControl,
            _cancel: &CancellationToken,
        ) -> Result<AssessmentResult, AssessError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(AssessmentResult::not_assessed(&control.identifier, ""))
        }
    }

    fn write_template(path: &std::path::Path) {
        let mut book = umya_spreadsheet::new_file();
        let sheet = book.get_sheet_by_name_mut("Sheet1").unwrap();
        sheet.set_name("Essential Eight");
        sheet.get_cell_mut((2, 1)).set_value("Identifier");
        sheet.get_cell_mut((2, 2)).set_value("ISM-0001");
        umya_spreadsheet::writer::xlsx::write(&book, path).unwrap();
    }

    #[tokio::test]
    async fn concurrent_requests_never_overlap_batch_runs() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.xlsx");
        write_template(&template);

        let current = Arc::new(AtomicUsize::new(0));
        let max = Arc::new(AtomicUsize::new(0));
        let catalog = ControlCatalog::from_json(
            r#"[{"ISM-0001": {"Description": "Patch applications"}}]"#,
        )
        .unwrap();
        let state = Arc::new(AppState::new(
            Arc::new(SlowAssessor {
                current: Arc::clone(&current),
                max: Arc::clone(&max),
            }),
            catalog,
            template,
            dir.path().to_path_buf(),
        ));

        let request = || {
            conduct_assessment(
                State(Arc::clone(&state)),
                Json(AssessmentRequest {
                    items: vec!["ISM-0001".to_string()],
                }),
            )
        };
        let (first, second) = tokio::join!(request(), request());
        let first = first.expect("first request should succeed");
        let second = second.expect("second request should succeed");
        assert_eq!(first.0.assessments.len(), 1);
        assert_eq!(second.0.assessments.len(), 1);
        assert_eq!(max.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn traversal_attempts_are_rejected() {
        assert!(!is_safe_filename("../secrets.xlsx"));
        assert!(!is_safe_filename("a/b.xlsx"));
        assert!(!is_safe_filename("a\\b.xlsx"));
        assert!(!is_safe_filename(""));
        assert!(is_safe_filename("ssp-assessment-1700000000.xlsx"));
    }

    #[test]
    fn generated_report_names_are_servable() {
        assert!(is_safe_filename(&report_filename()));
    }

    #[test]
    fn not_found_maps_to_404() {
        let response = AppError::NotFound("missing.xlsx".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn internal_errors_map_to_500() {
        let response = AppError::Internal(anyhow::anyhow!("boom")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
