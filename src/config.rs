use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::merge_sort::DEFAULT_SPILL_RECORDS;
use crate::stage::{self, Stage};
use crate::worker_pool;

/// Matrix resolutions in base pairs, coarsest first
pub const DEFAULT_RESOLUTIONS: [u32; 11] = [
    2_500_000, 1_000_000, 500_000, 250_000, 100_000, 50_000, 25_000, 10_000, 5_000, 2_000, 1_000,
];

pub const DEFAULT_HIC_MAPQ: u8 = 1;
pub const DEFAULT_NARROW_MAPQ: u8 = 30;
pub const DEFAULT_DHS_MAPQ: u8 = 30;

/// Input that enables the diploid stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiploidInput {
    /// Phased variant calls (VCF, optionally compressed)
    PhasedVcf(PathBuf),
    /// Phase-structure table: `chrom pos allele_r allele_a`
    PhaseStructure(PathBuf),
    /// Precomputed read-to-homolog assignment
    ReadAssignment(PathBuf),
}

impl DiploidInput {
    /// Pick the most processed input supplied: a ready assignment beats a
    /// phase-structure table, which beats raw phased calls
    pub fn select(
        vcf: Option<PathBuf>,
        phase_structure: Option<PathBuf>,
        assignment: Option<PathBuf>,
    ) -> Option<DiploidInput> {
        assignment
            .map(DiploidInput::ReadAssignment)
            .or(phase_structure.map(DiploidInput::PhaseStructure))
            .or(vcf.map(DiploidInput::PhasedVcf))
    }

    pub fn path(&self) -> &Path {
        match self {
            DiploidInput::PhasedVcf(p)
            | DiploidInput::PhaseStructure(p)
            | DiploidInput::ReadAssignment(p) => p,
        }
    }
}

/// Everything a pipeline run needs besides its alignment source and engines
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_dir: PathBuf,
    pub from_stage: Stage,
    pub to_stage: Stage,
    /// Concurrent chromosome tasks
    pub threads: usize,
    pub hic_mapq: u8,
    pub narrow_mapq: u8,
    pub dhs_mapq: u8,
    pub resolutions: Vec<u32>,
    /// Chromosome allow-list; `None` processes every reference
    pub chromosomes: Option<Vec<String>>,
    pub diploid: Option<DiploidInput>,
    /// Write one matrix per homolog instead of one interleaved matrix
    pub separate_homologs: bool,
    pub spill_records: usize,
}

impl PipelineConfig {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Self {
        PipelineConfig {
            output_dir: output_dir.as_ref().to_path_buf(),
            from_stage: Stage::Prep,
            to_stage: Stage::Cleanup,
            threads: worker_pool::default_concurrency(),
            hic_mapq: DEFAULT_HIC_MAPQ,
            narrow_mapq: DEFAULT_NARROW_MAPQ,
            dhs_mapq: DEFAULT_DHS_MAPQ,
            resolutions: DEFAULT_RESOLUTIONS.to_vec(),
            chromosomes: None,
            diploid: None,
            separate_homologs: false,
            spill_records: DEFAULT_SPILL_RECORDS,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        stage::validate_range(self.from_stage, self.to_stage)
    }

    /// Location of a named artifact inside the output directory
    pub fn artifact(&self, name: &str) -> PathBuf {
        self.output_dir.join(name)
    }

    pub fn allow_list(&self) -> Option<HashSet<String>> {
        self.chromosomes
            .as_ref()
            .map(|names| names.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::new("/tmp/out");
        assert_eq!(config.from_stage, Stage::Prep);
        assert_eq!(config.to_stage, Stage::Cleanup);
        assert_eq!(config.hic_mapq, 1);
        assert_eq!(config.narrow_mapq, 30);
        assert_eq!(config.resolutions.first(), Some(&2_500_000));
        assert_eq!(config.resolutions.last(), Some(&1_000));
        assert!(config.threads >= 1);
        assert_eq!(config.artifact("chrom.sizes"), PathBuf::from("/tmp/out/chrom.sizes"));
    }

    #[test]
    fn test_reversed_range_is_rejected() {
        let mut config = PipelineConfig::new("out");
        config.from_stage = Stage::Hic;
        config.to_stage = Stage::Prep;
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidStageRange { .. })
        ));
    }

    #[test]
    fn test_diploid_input_precedence() {
        let pick = DiploidInput::select(
            Some("calls.vcf".into()),
            Some("phase.psf".into()),
            None,
        );
        assert_eq!(pick, Some(DiploidInput::PhaseStructure("phase.psf".into())));
        assert_eq!(DiploidInput::select(None, None, None), None);
        let pick = DiploidInput::select(Some("calls.vcf".into()), None, Some("r2h.txt".into()));
        assert_eq!(pick.unwrap().path(), Path::new("r2h.txt"));
    }
}
