//! Pipeline stages and their total order
//!
//! Stages run strictly one after another. The order below is the order used
//! to validate `--from-stage`/`--to-stage` ranges.
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Prep,
    Hic,
    HicNarrow,
    Dhs,
    DiploidHic,
    DiploidDhs,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Prep,
        Stage::Hic,
        Stage::HicNarrow,
        Stage::Dhs,
        Stage::DiploidHic,
        Stage::DiploidDhs,
        Stage::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Prep => "prep",
            Stage::Hic => "hic",
            Stage::HicNarrow => "hicnarrow",
            Stage::Dhs => "dhs",
            Stage::DiploidHic => "diploid_hic",
            Stage::DiploidDhs => "diploid_dhs",
            Stage::Cleanup => "cleanup",
        }
    }

    /// Next stage in the fixed order, ignoring the diploid branch
    pub fn successor(&self) -> Option<Stage> {
        let idx = Stage::ALL.iter().position(|s| s == self)?;
        Stage::ALL.get(idx + 1).copied()
    }

    pub fn is_diploid(&self) -> bool {
        matches!(self, Stage::DiploidHic | Stage::DiploidDhs)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Stage::ALL
            .iter()
            .find(|stage| stage.name() == lower)
            .copied()
            .ok_or_else(|| PipelineError::UnknownStage(s.to_string()))
    }
}

/// Reject a range whose start is strictly later than its end
pub fn validate_range(from: Stage, to: Stage) -> Result<(), PipelineError> {
    if from > to {
        return Err(PipelineError::InvalidStageRange { from, to });
    }
    Ok(())
}
