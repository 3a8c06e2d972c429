//! Stage sequencing
//!
//! The controller keeps no state of its own between runs: whatever artifacts
//! exist in the output directory are the checkpoint. A run walks the stage
//! order from `from_stage` to `to_stage`, checking each stage's required
//! artifacts before entering it and halting on the first failure.

use anyhow::{bail, Result};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::alignment_source::AlignmentSource;
use crate::artifacts::{self, ChromSizes};
use crate::config::{DiploidInput, PipelineConfig};
use crate::engines::{self, MatrixEngine, TrackEngine};
use crate::error::PipelineError;
use crate::homolog::{self, ReadEvidence, ReadHomologAssignment};
use crate::merge_sort::{self, MergeSorter};
use crate::record_mapper::{self, ContactOutput, CountTracks, MapperParams, MapperStats};
use crate::records::{HomologSide, JunctionSet, LocusCountRecord};
use crate::stage::Stage;
use crate::worker_pool::ChromosomeWorkerPool;

/// Stages executed by one run, in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: Vec<Stage>,
}

pub struct StageController<'a> {
    config: PipelineConfig,
    source: &'a dyn AlignmentSource,
    matrix: &'a dyn MatrixEngine,
    track: &'a dyn TrackEngine,
    pool: ChromosomeWorkerPool,
}

impl<'a> StageController<'a> {
    /// Validates the stage range before anything else happens
    pub fn new(
        config: PipelineConfig,
        source: &'a dyn AlignmentSource,
        matrix: &'a dyn MatrixEngine,
        track: &'a dyn TrackEngine,
    ) -> Result<Self> {
        config.validate()?;
        let pool = ChromosomeWorkerPool::new(config.threads)?;
        Ok(StageController {
            config,
            source,
            matrix,
            track,
            pool,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stage that follows `stage`, taking the diploid branch into account
    pub fn next_stage(&self, stage: Stage) -> Option<Stage> {
        match stage {
            Stage::Dhs if self.config.diploid.is_none() => Some(Stage::Cleanup),
            other => other.successor(),
        }
    }

    /// Stages a run would execute, without touching disk
    pub fn plan(&self) -> Vec<Stage> {
        let mut stages = Vec::new();
        let mut current = Some(self.config.from_stage);
        while let Some(stage) = current {
            if stage > self.config.to_stage {
                break;
            }
            stages.push(stage);
            if stage == self.config.to_stage {
                break;
            }
            current = self.next_stage(stage);
        }
        stages
    }

    pub fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();
        info!(
            "Pipeline started at {} ({} -> {}, {} workers)",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.config.from_stage,
            self.config.to_stage,
            self.pool.concurrency()
        );
        fs::create_dir_all(&self.config.output_dir)?;

        let mut summary = RunSummary::default();
        for stage in self.plan() {
            self.check_preconditions(stage)?;
            let stage_started = Instant::now();
            info!("[{stage}] Starting");
            self.run_stage(stage)?;
            info!("[{stage}] Finished in {:.1}s", stage_started.elapsed().as_secs_f64());
            summary.completed.push(stage);
        }

        info!(
            "Pipeline finished at {} after {:.1}s",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            started.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    fn diploid_input(&self, stage: Stage) -> Result<&DiploidInput, PipelineError> {
        self.config
            .diploid
            .as_ref()
            .ok_or(PipelineError::MissingDiploidInput { stage })
    }

    /// Assignment read by diploid_dhs: a supplied one is used where it lies,
    /// otherwise the one diploid_hic persisted
    fn assignment_path(&self, stage: Stage) -> Result<PathBuf, PipelineError> {
        Ok(match self.diploid_input(stage)? {
            DiploidInput::ReadAssignment(path) => path.clone(),
            _ => self.config.artifact(artifacts::READS_TO_HOMOLOGS),
        })
    }

    /// Transition guard: required artifacts must exist and be non-empty
    pub fn check_preconditions(&self, stage: Stage) -> Result<(), PipelineError> {
        let sizes = self.config.artifact(artifacts::CHROM_SIZES);
        match stage {
            Stage::Prep => match self.source.missing_inputs().into_iter().next() {
                Some(path) => Err(PipelineError::Precondition { stage, path }),
                None => Ok(()),
            },
            Stage::Hic | Stage::HicNarrow | Stage::Dhs => artifacts::require(stage, &sizes),
            Stage::DiploidHic => {
                artifacts::require(stage, &sizes)?;
                let input = self.diploid_input(stage)?;
                artifacts::require(stage, input.path())
            }
            Stage::DiploidDhs => {
                artifacts::require(stage, &sizes)?;
                artifacts::require(stage, self.assignment_path(stage)?)
            }
            Stage::Cleanup => Ok(()),
        }
    }

    fn run_stage(&self, stage: Stage) -> Result<()> {
        match stage {
            Stage::Prep => self.prep(),
            Stage::Hic => self.contact_stage(
                stage,
                self.config.hic_mapq,
                artifacts::MERGED_HIC,
                artifacts::MATRIX_HIC,
            ),
            Stage::HicNarrow => self.contact_stage(
                stage,
                self.config.narrow_mapq,
                artifacts::MERGED_NARROW,
                artifacts::MATRIX_NARROW,
            ),
            Stage::Dhs => self.accessibility_stage(stage),
            Stage::DiploidHic => self.diploid_contact_stage(stage),
            Stage::DiploidDhs => self.diploid_accessibility_stage(stage),
            Stage::Cleanup => self.cleanup(),
        }
    }

    fn chromosomes(&self) -> Result<Vec<String>> {
        let sizes = ChromSizes::load(self.config.artifact(artifacts::CHROM_SIZES))?;
        Ok(sizes.names())
    }

    fn sorter(&self) -> MergeSorter {
        MergeSorter::new(self.config.spill_records, &self.config.output_dir)
    }

    fn prep(&self) -> Result<()> {
        let header = self.source.header()?;
        let references = match self.config.allow_list() {
            Some(allow) => {
                for name in &allow {
                    if !header.references.iter().any(|(n, _)| n == name) {
                        warn!("[prep] Chromosome {name} is not in the input header, ignoring");
                    }
                }
                header
                    .references
                    .into_iter()
                    .filter(|(name, _)| allow.contains(name))
                    .collect()
            }
            None => header.references,
        };
        if references.is_empty() {
            bail!("No chromosomes left to process after applying the allow-list");
        }

        let sizes = ChromSizes::new(references);
        sizes.write(self.config.artifact(artifacts::CHROM_SIZES))?;
        info!(
            "[prep] {} chromosomes, platform {:?}",
            sizes.entries().len(),
            header.platform
        );
        Ok(())
    }

    fn contact_stage(&self, stage: Stage, min_mapq: u8, merged: &str, matrix: &str) -> Result<()> {
        let chroms = self.chromosomes()?;
        let params = MapperParams {
            min_mapq,
            junctions: JunctionSet::ALL,
        };

        let outputs = self
            .pool
            .run(&chroms, |chrom| {
                record_mapper::map_contacts(chrom, &params, self.source.fetch(chrom)?)
            })
            .into_result(stage)?;
        log_mapper_stats(stage, outputs.iter().map(|o| &o.stats));

        let merged = self.config.artifact(merged);
        self.write_contacts(stage, &merged, outputs)?;
        engines::build_matrix(
            self.matrix,
            stage,
            &merged,
            &self.config.artifact(artifacts::CHROM_SIZES),
            &self.config.resolutions,
            &self.config.artifact(matrix),
        )
    }

    fn write_contacts(&self, stage: Stage, path: &Path, outputs: Vec<ContactOutput>) -> Result<()> {
        let sorter = self.sorter();
        let stats = artifacts::write_atomic(path, |w| sorter.merge(outputs, w))?;
        info!(
            "[{stage}] Wrote {} contacts to {} ({} side-channel kept, {} dropped)",
            stats.records_written(),
            path.display(),
            stats.side_kept,
            stats.side_dropped
        );
        Ok(())
    }

    fn write_counts(&self, stage: Stage, path: &Path, tracks: PartitionCounts) -> Result<()> {
        let written = artifacts::write_atomic(path, |w| merge_sort::merge_counts(tracks, w))?;
        info!("[{stage}] Wrote {written} loci to {}", path.display());
        Ok(())
    }

    /// bedGraph, then binary track, for each (name, counts) pair
    fn emit_tracks(
        &self,
        stage: Stage,
        sizes: &Path,
        tracks: Vec<(String, PartitionCounts)>,
    ) -> Result<()> {
        for (name, counts) in tracks {
            let bedgraph = self.config.artifact(&format!("{name}.bedgraph"));
            self.write_counts(stage, &bedgraph, counts)?;
            engines::encode_track(
                self.track,
                stage,
                &bedgraph,
                sizes,
                &self.config.artifact(&format!("{name}.bw")),
            )?;
        }
        Ok(())
    }

    fn accessibility_params(&self) -> Result<MapperParams> {
        let platform = self.source.header()?.platform;
        Ok(MapperParams {
            min_mapq: self.config.dhs_mapq,
            junctions: JunctionSet::accessibility(platform),
        })
    }

    fn accessibility_stage(&self, stage: Stage) -> Result<()> {
        let chroms = self.chromosomes()?;
        let params = self.accessibility_params()?;

        let outputs = self
            .pool
            .run(&chroms, |chrom| {
                record_mapper::count_loci(chrom, &params, self.source.fetch(chrom)?)
            })
            .into_result(stage)?;
        log_mapper_stats(stage, outputs.iter().map(|o| &o.stats));

        let (raw, corrected) = split_tracks(outputs);
        self.emit_tracks(
            stage,
            &self.config.artifact(artifacts::CHROM_SIZES),
            vec![
                (artifacts::TRACK_PREFIX.to_string(), raw),
                (format!("{}_corrected", artifacts::TRACK_PREFIX), corrected),
            ],
        )
    }

    /// Load, or compute and persist, the read-to-homolog assignment
    fn homolog_assignment(&self, stage: Stage) -> Result<ReadHomologAssignment> {
        let target = self.config.artifact(artifacts::READS_TO_HOMOLOGS);
        let allow = self.config.allow_list();

        let variants = match self.diploid_input(stage)? {
            DiploidInput::ReadAssignment(path) => {
                let assignment = ReadHomologAssignment::load(path)?;
                info!("[{stage}] Loaded {} read assignments from {}", assignment.len(), path.display());
                if *path != target {
                    artifacts::write_atomic(&target, |w| assignment.write(w))?;
                }
                return Ok(assignment);
            }
            DiploidInput::PhaseStructure(path) => homolog::load_phase_structure(path, allow.as_ref())?,
            DiploidInput::PhasedVcf(path) => homolog::load_phased_vcf(path, allow.as_ref())?,
        };
        info!("[{stage}] {} phased variants", variants.len());

        let chroms = self.chromosomes()?;
        let min_mapq = self.config.hic_mapq;
        let per_chrom = self
            .pool
            .run(&chroms, |chrom| {
                homolog::scan_chromosome(chrom, &variants, min_mapq, self.source.fetch(chrom)?)
            })
            .into_result(stage)?;

        let mut evidence = ReadEvidence::default();
        for chrom_evidence in per_chrom {
            evidence.absorb(chrom_evidence);
        }
        let (assignment, stats) = evidence.into_assignment();
        info!(
            "[{stage}] Assigned {} reads to r, {} to a",
            stats.assigned_r, stats.assigned_a
        );
        if stats.conflicting > 0 {
            warn!(
                "[{stage}] Dropped {} reads with evidence for both homologs",
                stats.conflicting
            );
        }

        artifacts::write_atomic(&target, |w| assignment.write(w))?;
        Ok(assignment)
    }

    fn write_diploid_sizes(&self) -> Result<PathBuf> {
        let sizes = ChromSizes::load(self.config.artifact(artifacts::CHROM_SIZES))?;
        let path = self.config.artifact(artifacts::DIPLOID_CHROM_SIZES);
        sizes.homologs().write(&path)?;
        Ok(path)
    }

    fn diploid_contact_stage(&self, stage: Stage) -> Result<()> {
        let assignment = self.homolog_assignment(stage)?;
        let chroms = self.chromosomes()?;
        let params = MapperParams {
            min_mapq: self.config.hic_mapq,
            junctions: JunctionSet::ALL,
        };

        let outputs = self
            .pool
            .run(&chroms, |chrom| {
                let [r, a] = homolog::split_by_homolog(self.source.fetch(chrom)?, &assignment)?;
                Ok([
                    record_mapper::map_contacts(
                        &HomologSide::R.label(chrom),
                        &params,
                        r.into_iter().map(Ok),
                    )?,
                    record_mapper::map_contacts(
                        &HomologSide::A.label(chrom),
                        &params,
                        a.into_iter().map(Ok),
                    )?,
                ])
            })
            .into_result(stage)?;
        log_mapper_stats(stage, outputs.iter().flatten().map(|o| &o.stats));

        let sizes = self.write_diploid_sizes()?;
        let mut matrices = Vec::new();
        if self.config.separate_homologs {
            let (r, a): (Vec<_>, Vec<_>) = outputs.into_iter().map(|[r, a]| (r, a)).unzip();
            for (side, side_outputs) in HomologSide::BOTH.iter().zip([r, a]) {
                let name = format!("{}_{}", artifacts::DIPLOID_PREFIX, side.suffix());
                let merged = self.config.artifact(&format!("{name}.txt"));
                self.write_contacts(stage, &merged, side_outputs)?;
                matrices.push((merged, self.config.artifact(&format!("{name}.hic"))));
            }
        } else {
            let merged = self.config.artifact(&format!("{}.txt", artifacts::DIPLOID_PREFIX));
            self.write_contacts(stage, &merged, outputs.into_iter().flatten().collect())?;
            matrices.push((merged, self.config.artifact(&format!("{}.hic", artifacts::DIPLOID_PREFIX))));
        }

        for (merged, matrix) in matrices {
            engines::build_matrix(self.matrix, stage, &merged, &sizes, &self.config.resolutions, &matrix)?;
        }
        Ok(())
    }

    fn diploid_accessibility_stage(&self, stage: Stage) -> Result<()> {
        let path = self.assignment_path(stage)?;
        let assignment = ReadHomologAssignment::load(&path)?;
        info!("[{stage}] Using {} read assignments from {}", assignment.len(), path.display());
        let chroms = self.chromosomes()?;
        let params = self.accessibility_params()?;

        let outputs = self
            .pool
            .run(&chroms, |chrom| {
                let [r, a] = homolog::split_by_homolog(self.source.fetch(chrom)?, &assignment)?;
                Ok([
                    record_mapper::count_loci(
                        &HomologSide::R.label(chrom),
                        &params,
                        r.into_iter().map(Ok),
                    )?,
                    record_mapper::count_loci(
                        &HomologSide::A.label(chrom),
                        &params,
                        a.into_iter().map(Ok),
                    )?,
                ])
            })
            .into_result(stage)?;
        log_mapper_stats(stage, outputs.iter().flatten().map(|o| &o.stats));

        let sizes = self.write_diploid_sizes()?;
        let prefix = artifacts::DIPLOID_PREFIX;
        let tracks = if self.config.separate_homologs {
            let (r, a): (Vec<_>, Vec<_>) = outputs.into_iter().map(|[r, a]| (r, a)).unzip();
            let mut tracks = Vec::new();
            for (side, side_outputs) in HomologSide::BOTH.iter().zip([r, a]) {
                let (raw, corrected) = split_tracks(side_outputs);
                tracks.push((format!("{prefix}_{}", side.suffix()), raw));
                tracks.push((format!("{prefix}_{}_corrected", side.suffix()), corrected));
            }
            tracks
        } else {
            let (raw, corrected) = split_tracks(outputs.into_iter().flatten().collect());
            vec![
                (prefix.to_string(), raw),
                (format!("{prefix}_corrected"), corrected),
            ]
        };
        self.emit_tracks(stage, &sizes, tracks)
    }

    fn cleanup(&self) -> Result<()> {
        let prefix = artifacts::DIPLOID_PREFIX;
        let candidates = [
            artifacts::MERGED_HIC.to_string(),
            artifacts::MERGED_NARROW.to_string(),
            format!("{prefix}.txt"),
            format!("{prefix}_r.txt"),
            format!("{prefix}_a.txt"),
        ];
        for name in candidates {
            let path = self.config.artifact(&name);
            if path.exists() {
                let gz = artifacts::gzip_in_place(&path)?;
                info!("[cleanup] Compressed {}", gz.display());
            }
        }
        Ok(())
    }
}

type PartitionCounts = Vec<Vec<LocusCountRecord>>;

fn split_tracks(outputs: Vec<CountTracks>) -> (PartitionCounts, PartitionCounts) {
    outputs.into_iter().map(|t| (t.raw, t.corrected)).unzip()
}

/// Log the summed per-chromosome counters and return the total
fn log_mapper_stats<'s>(stage: Stage, stats: impl Iterator<Item = &'s MapperStats>) -> MapperStats {
    let mut total = MapperStats::default();
    for s in stats {
        total.merge(s);
    }
    info!(
        "[{stage}] {} records read, {} below quality, {} rejected junction, {} malformed",
        total.records_seen, total.low_quality, total.rejected_junction, total.malformed
    );
    if total.off_partition > 0 {
        warn!(
            "[{stage}] {} records were delivered for the wrong chromosome and ignored",
            total.off_partition
        );
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment_source::InMemorySource;
    use crate::records::Platform;
    use tempfile::TempDir;

    struct NoEngine;

    impl MatrixEngine for NoEngine {
        fn build(&self, _: &Path, _: &Path, _: &[u32], _: &Path) -> Result<()> {
            bail!("not expected")
        }
    }

    impl TrackEngine for NoEngine {
        fn encode(&self, _: &Path, _: &Path, _: &Path) -> Result<()> {
            bail!("not expected")
        }
    }

    fn controller<'a>(
        config: PipelineConfig,
        source: &'a InMemorySource,
    ) -> Result<StageController<'a>> {
        StageController::new(config, source, &NoEngine, &NoEngine)
    }

    fn source() -> InMemorySource {
        InMemorySource::new(vec![("chr1".into(), 1000)], Platform::Illumina, Vec::new())
    }

    #[test]
    fn test_plan_skips_diploid_branch_without_input() {
        let dir = TempDir::new().unwrap();
        let src = source();
        let ctl = controller(PipelineConfig::new(dir.path()), &src).unwrap();
        assert_eq!(
            ctl.plan(),
            vec![Stage::Prep, Stage::Hic, Stage::HicNarrow, Stage::Dhs, Stage::Cleanup]
        );
    }

    #[test]
    fn test_plan_includes_diploid_branch_with_input() {
        let dir = TempDir::new().unwrap();
        let src = source();
        let mut config = PipelineConfig::new(dir.path());
        config.from_stage = Stage::Dhs;
        config.diploid = Some(DiploidInput::PhasedVcf(dir.path().join("calls.vcf")));
        let ctl = controller(config, &src).unwrap();
        assert_eq!(
            ctl.plan(),
            vec![Stage::Dhs, Stage::DiploidHic, Stage::DiploidDhs, Stage::Cleanup]
        );
    }

    #[test]
    fn test_plan_stops_at_to_stage() {
        let dir = TempDir::new().unwrap();
        let src = source();
        let mut config = PipelineConfig::new(dir.path());
        config.to_stage = Stage::Hic;
        assert_eq!(controller(config.clone(), &src).unwrap().plan(), vec![Stage::Prep, Stage::Hic]);

        // the requested end lies inside the skipped diploid branch
        config.from_stage = Stage::HicNarrow;
        config.to_stage = Stage::DiploidDhs;
        assert_eq!(
            controller(config, &src).unwrap().plan(),
            vec![Stage::HicNarrow, Stage::Dhs]
        );
    }

    #[test]
    fn test_reversed_range_rejected_at_construction() {
        let dir = TempDir::new().unwrap();
        let src = source();
        let mut config = PipelineConfig::new(dir.path());
        config.from_stage = Stage::Hic;
        config.to_stage = Stage::Prep;
        let err = controller(config, &src).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::InvalidStageRange { .. })
        ));
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_diploid_stage_without_input() {
        let dir = TempDir::new().unwrap();
        let src = source();
        ChromSizes::new(vec![("chr1".into(), 1000)])
            .write(dir.path().join(artifacts::CHROM_SIZES))
            .unwrap();
        let mut config = PipelineConfig::new(dir.path());
        config.from_stage = Stage::DiploidHic;
        let ctl = controller(config, &src).unwrap();
        assert!(matches!(
            ctl.check_preconditions(Stage::DiploidHic),
            Err(PipelineError::MissingDiploidInput { stage: Stage::DiploidHic })
        ));
    }

    #[test]
    fn test_stage_stats_include_off_partition_records() {
        let parts = [
            MapperStats {
                records_seen: 4,
                off_partition: 1,
                ..Default::default()
            },
            MapperStats {
                records_seen: 2,
                malformed: 1,
                off_partition: 2,
                ..Default::default()
            },
        ];
        let total = log_mapper_stats(Stage::Hic, parts.iter());
        assert_eq!(total.records_seen, 6);
        assert_eq!(total.malformed, 1);
        assert_eq!(total.off_partition, 3);
    }

    #[test]
    fn test_supplied_assignment_satisfies_diploid_dhs() {
        let dir = TempDir::new().unwrap();
        let elsewhere = TempDir::new().unwrap();
        let src = source();
        ChromSizes::new(vec![("chr1".into(), 1000)])
            .write(dir.path().join(artifacts::CHROM_SIZES))
            .unwrap();
        let assignment = elsewhere.path().join("assigned.txt");
        std::fs::write(&assignment, "p\tchr1-r\n").unwrap();

        let mut config = PipelineConfig::new(dir.path());
        config.from_stage = Stage::DiploidDhs;
        config.diploid = Some(DiploidInput::ReadAssignment(assignment.clone()));
        let ctl = controller(config.clone(), &src).unwrap();
        assert!(ctl.check_preconditions(Stage::DiploidDhs).is_ok());

        // a computed assignment still has to exist in the output directory
        config.diploid = Some(DiploidInput::PhaseStructure(assignment));
        let ctl = controller(config, &src).unwrap();
        match ctl.check_preconditions(Stage::DiploidDhs) {
            Err(PipelineError::Precondition { path, .. }) => {
                assert_eq!(path, dir.path().join(artifacts::READS_TO_HOMOLOGS))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_cleanup_compresses_merged_files() {
        let dir = TempDir::new().unwrap();
        let src = source();
        std::fs::write(dir.path().join(artifacts::MERGED_HIC), "0 chr1 1 0 0 chr1 2 1\n").unwrap();
        let mut config = PipelineConfig::new(dir.path());
        config.from_stage = Stage::Cleanup;
        let summary = controller(config, &src).unwrap().run().unwrap();
        assert_eq!(summary.completed, vec![Stage::Cleanup]);
        assert!(!dir.path().join(artifacts::MERGED_HIC).exists());
        assert!(dir.path().join("merged1.txt.gz").exists());
    }
}
