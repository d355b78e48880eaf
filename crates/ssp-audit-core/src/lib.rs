pub mod assess;
pub mod catalog;
pub mod corpus;
pub mod llm;
pub mod report;

pub use assess::{
    batch::BatchRunner, heuristic::HeuristicAssessor, AssessError, AssessmentResult, Assessor,
    BatchFailure, BatchOutcome, ControlStatus, ResponseError, SecurityControl, StatusParseError,
};
pub use catalog::{CatalogError, ControlCatalog};
pub use corpus::{CorpusLoadError, CorpusMode, PolicyArtifact, PolicyCorpus};
pub use report::{merge_results, render_outcome, AssessmentRow, OutputFormat, ReportError};
