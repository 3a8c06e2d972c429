use anyhow::Result;
use clap::Parser;
use log::error;
use std::path::PathBuf;

use megahic::alignment_source::HtslibSource;
use megahic::config::{DiploidInput, PipelineConfig, DEFAULT_RESOLUTIONS};
use megahic::controller::StageController;
use megahic::engines::{
    CommandMatrixEngine, CommandTrackEngine, DEFAULT_MATRIX_TOOL, DEFAULT_TRACK_TOOL,
};
use megahic::error::PipelineError;
use megahic::merge_sort::DEFAULT_SPILL_RECORDS;
use megahic::stage::Stage;
use megahic::worker_pool;

/// Parse a number that may have metric suffix (k/K=1000, m/M=1e6, g/G=1e9)
fn parse_metric_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty string".to_string());
    }

    let (num_part, suffix) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&s[..s.len() - c.len_utf8()], Some(c)),
        _ => (s, None),
    };

    let base: f64 = num_part
        .parse()
        .map_err(|e| format!("Invalid number: {e}"))?;

    let multiplier = match suffix {
        Some('k') | Some('K') => 1000.0,
        Some('m') | Some('M') => 1_000_000.0,
        Some('g') | Some('G') => 1_000_000_000.0,
        Some(c) => {
            return Err(format!(
                "Unknown suffix '{c}'. Use k/K (1000), m/M (1e6), or g/G (1e9)"
            ))
        }
        None => 1.0,
    };

    let result = base * multiplier;

    if result < 0.0 {
        return Err(format!("Value {result} must not be negative"));
    }
    if result > u32::MAX as f64 {
        return Err(format!("Value {result} too large for u32"));
    }

    Ok(result as u32)
}

/// One matrix resolution in bp; zero is rejected
fn parse_resolution(s: &str) -> Result<u32, String> {
    match parse_metric_number(s)? {
        0 => Err("Resolution must be positive".to_string()),
        bp => Ok(bp),
    }
}

fn parse_mapq(s: &str) -> Result<u8, String> {
    s.trim()
        .parse::<u8>()
        .map_err(|e| format!("Invalid mapping quality '{s}': {e}"))
}

/// megahic - aggregate Hi-C experiments into mega contact maps and accessibility tracks
///
/// Stages run in order prep, hic, hicnarrow, dhs, diploid_hic, diploid_dhs,
/// cleanup. The diploid stages run only when phasing input is supplied.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Indexed BAM files, one per experiment
    #[clap(value_name = "BAM", required = true)]
    inputs: Vec<PathBuf>,

    /// Directory receiving every artifact
    #[clap(short = 'o', long = "output-dir", default_value = "mega")]
    output_dir: PathBuf,

    /// First stage to run
    #[clap(short = 'S', long = "from-stage", default_value = "prep")]
    from_stage: Stage,

    /// Last stage to run
    #[clap(short = 'T', long = "to-stage", default_value = "cleanup")]
    to_stage: Stage,

    /// Concurrent chromosome tasks (default: half the CPUs, capped by memory)
    #[clap(short = 't', long = "threads")]
    threads: Option<usize>,

    /// Minimum mapping quality for the full contact map
    #[clap(long = "hic-mapq", default_value = "1", value_parser = parse_mapq)]
    hic_mapq: u8,

    /// Minimum mapping quality for the high-quality contact map
    #[clap(long = "narrow-mapq", default_value = "30", value_parser = parse_mapq)]
    narrow_mapq: u8,

    /// Minimum mapping quality for accessibility tracks
    #[clap(long = "dhs-mapq", default_value = "30", value_parser = parse_mapq)]
    dhs_mapq: u8,

    /// Matrix resolutions in bp, comma-separated (metric suffixes allowed)
    #[clap(short = 'r', long = "resolutions", value_delimiter = ',', default_values_t = DEFAULT_RESOLUTIONS.to_vec(), value_parser = parse_resolution)]
    resolutions: Vec<u32>,

    /// Only process these chromosomes (comma-separated)
    #[clap(long = "chromosomes", value_delimiter = ',')]
    chromosomes: Option<Vec<String>>,

    /// Phased variant calls enabling the diploid stages
    #[clap(long = "vcf")]
    vcf: Option<PathBuf>,

    /// Phase-structure table (chrom pos allele_r allele_a)
    #[clap(long = "psf")]
    psf: Option<PathBuf>,

    /// Precomputed read-to-homolog assignment
    #[clap(long = "reads-to-homologs")]
    reads_to_homologs: Option<PathBuf>,

    /// Build one matrix and track set per homolog instead of interleaving them
    #[clap(long = "separate-homologs")]
    separate_homologs: bool,

    /// Cross-chromosome contacts held in memory before spilling to disk
    #[clap(long = "spill-records", default_value_t = DEFAULT_SPILL_RECORDS as u32, value_parser = parse_metric_number)]
    spill_records: u32,

    /// Matrix builder command
    #[clap(long = "matrix-tool", default_value = DEFAULT_MATRIX_TOOL)]
    matrix_tool: String,

    /// bedGraph to binary track command
    #[clap(long = "track-tool", default_value = DEFAULT_TRACK_TOOL)]
    track_tool: String,

    /// Quiet mode (warnings and errors only)
    #[clap(long = "quiet")]
    quiet: bool,
}

impl Args {
    fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::new(&self.output_dir);
        config.from_stage = self.from_stage;
        config.to_stage = self.to_stage;
        config.threads = self
            .threads
            .unwrap_or_else(worker_pool::default_concurrency)
            .max(1);
        config.hic_mapq = self.hic_mapq;
        config.narrow_mapq = self.narrow_mapq;
        config.dhs_mapq = self.dhs_mapq;
        config.resolutions = self.resolutions;
        config.chromosomes = self.chromosomes;
        config.diploid = DiploidInput::select(self.vcf, self.psf, self.reads_to_homologs);
        config.separate_homologs = self.separate_homologs;
        config.spill_records = self.spill_records as usize;
        config
    }
}

fn run(args: Args) -> Result<()> {
    let source = HtslibSource::new(args.inputs.clone())?;
    let matrix = CommandMatrixEngine::new(&args.matrix_tool)?;
    let track = CommandTrackEngine::new(&args.track_tool)?;
    let config = args.into_config();

    let controller = StageController::new(config, &source, &matrix, &track)?;
    controller.run()?;
    Ok(())
}

fn main() {
    let args = Args::parse();

    let default_level = if args.quiet { "warn" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    if let Err(e) = run(args) {
        match e.downcast_ref::<PipelineError>().and_then(PipelineError::stage) {
            Some(stage) => error!("Pipeline halted in stage {stage}: {e:#}"),
            None => error!("{e:#}"),
        }
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metric_number() {
        assert_eq!(parse_metric_number("1000"), Ok(1000));
        assert_eq!(parse_metric_number("2.5M"), Ok(2_500_000));
        assert_eq!(parse_metric_number("5k"), Ok(5000));
        assert!(parse_metric_number("").is_err());
        assert!(parse_metric_number("10x").is_err());
        assert!(parse_metric_number("5G").is_err());
    }

    #[test]
    fn test_resolution_list() {
        let args = Args::parse_from(["megahic", "a.bam", "-r", "2.5M,500k,1000"]);
        assert_eq!(args.resolutions, vec![2_500_000, 500_000, 1000]);
        assert!(parse_resolution("0").is_err());
        assert!(Args::try_parse_from(["megahic", "a.bam", "-r", "1k,0"]).is_err());
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "megahic",
            "a.bam",
            "b.bam",
            "-o",
            "out",
            "-S",
            "hic",
            "-T",
            "dhs",
            "-t",
            "3",
            "--psf",
            "phase.psf",
            "--chromosomes",
            "chr1,chr2",
        ]);
        assert_eq!(args.inputs.len(), 2);
        let config = args.into_config();
        assert_eq!(config.from_stage, Stage::Hic);
        assert_eq!(config.to_stage, Stage::Dhs);
        assert_eq!(config.threads, 3);
        assert_eq!(config.resolutions, DEFAULT_RESOLUTIONS.to_vec());
        assert_eq!(config.chromosomes, Some(vec!["chr1".to_string(), "chr2".to_string()]));
        assert_eq!(config.diploid, Some(DiploidInput::PhaseStructure("phase.psf".into())));
    }

    #[test]
    fn test_unknown_stage_rejected_by_parser() {
        assert!(Args::try_parse_from(["megahic", "a.bam", "-S", "haploid"]).is_err());
    }
}
