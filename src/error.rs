use std::path::PathBuf;

use thiserror::Error;

use crate::stage::Stage;

/// Fatal pipeline failures. Each one halts the controller at `stage`.
///
/// Conflicting homolog evidence is not represented here: it is resolved by
/// dropping the read and only shows up in the assignment counts.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage {stage}: required artifact {} is missing or empty", path.display())]
    Precondition { stage: Stage, path: PathBuf },

    #[error("stage {stage}: {} of {total} chromosome tasks failed ({})", failed.len(), failed.join(", "))]
    WorkerFault {
        stage: Stage,
        total: usize,
        failed: Vec<String>,
    },

    #[error("stage {stage}: {engine} failed: {detail}")]
    ExternalEngine {
        stage: Stage,
        engine: &'static str,
        detail: String,
    },

    #[error("stage {stage} requires a phased variant, phase structure or read-to-homolog input")]
    MissingDiploidInput { stage: Stage },

    #[error("input {} does not share the reference list of {}", other.display(), first.display())]
    IncompatibleInputs { first: PathBuf, other: PathBuf },

    #[error("from-stage {from} is later than to-stage {to}")]
    InvalidStageRange { from: Stage, to: Stage },

    #[error("unknown stage '{0}' (expected prep|hic|hicnarrow|dhs|diploid_hic|diploid_dhs|cleanup)")]
    UnknownStage(String),
}

impl PipelineError {
    /// Stage the failure belongs to, when there is one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Precondition { stage, .. }
            | PipelineError::WorkerFault { stage, .. }
            | PipelineError::ExternalEngine { stage, .. }
            | PipelineError::MissingDiploidInput { stage } => Some(*stage),
            PipelineError::IncompatibleInputs { .. }
            | PipelineError::InvalidStageRange { .. }
            | PipelineError::UnknownStage(_) => None,
        }
    }
}
