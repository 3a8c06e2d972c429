//! Per-chromosome access to aligned Hi-C reads
//!
//! A source answers two questions: what the reference looks like (names,
//! lengths, sequencing platform) and which records fall on one chromosome.
//! Records come back as a lazy stream so a chromosome task never has to hold
//! a whole partition of raw BAM records in memory.

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use rust_htslib::bam::ext::BamRecordExtensions;
use rust_htslib::bam::record::Aux;
use rust_htslib::bam::{self, Read as BamRead};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::records::{AlignedBlock, AlignmentRecord, Platform, ReadType};

/// Stream of one chromosome's records
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<AlignmentRecord>> + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceHeader {
    /// Reference names and lengths in header order
    pub references: Vec<(String, u64)>,
    pub platform: Platform,
}

/// Random per-chromosome access plus header metadata
pub trait AlignmentSource: Sync {
    fn header(&self) -> Result<SourceHeader>;

    fn fetch(&self, chrom: &str) -> Result<RecordStream<'_>>;

    /// Inputs that should exist on disk but do not
    fn missing_inputs(&self) -> Vec<PathBuf> {
        Vec::new()
    }
}

/// Indexed BAM files, one per experiment, read as one combined source
///
/// Readers are opened inside `fetch`, so each chromosome task owns its own
/// handles and the source itself only holds paths.
pub struct HtslibSource {
    paths: Vec<PathBuf>,
}

impl HtslibSource {
    pub fn new(paths: Vec<PathBuf>) -> Result<Self> {
        if paths.is_empty() {
            bail!("At least one input BAM is required");
        }
        Ok(HtslibSource { paths })
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

fn target_names(header: &bam::HeaderView) -> Vec<String> {
    (0..header.target_count())
        .map(|tid| String::from_utf8_lossy(header.tid2name(tid)).into_owned())
        .collect()
}

fn read_platform(header: &bam::HeaderView) -> Option<Platform> {
    let text = String::from_utf8_lossy(header.as_bytes());
    text.lines()
        .filter(|line| line.starts_with("@RG"))
        .flat_map(|line| line.split('\t'))
        .find_map(|field| field.strip_prefix("PL:"))
        .map(Platform::from_tag)
}

fn open_indexed(path: &Path) -> Result<bam::IndexedReader> {
    bam::IndexedReader::from_path(path)
        .with_context(|| format!("Failed to open indexed BAM {}", path.display()))
}

impl AlignmentSource for HtslibSource {
    fn missing_inputs(&self) -> Vec<PathBuf> {
        self.paths
            .iter()
            .filter(|p| !crate::artifacts::is_present(p))
            .cloned()
            .collect()
    }

    fn header(&self) -> Result<SourceHeader> {
        let mut first: Option<(PathBuf, SourceHeader)> = None;

        for path in &self.paths {
            let reader = open_indexed(path)?;
            let view = reader.header();
            let references: Vec<(String, u64)> = target_names(view)
                .into_iter()
                .enumerate()
                .map(|(tid, name)| (name, view.target_len(tid as u32).unwrap_or(0)))
                .collect();

            match &first {
                None => {
                    let platform = read_platform(view).unwrap_or(Platform::Unknown);
                    debug!("{}: {} references, platform {:?}", path.display(), references.len(), platform);
                    first = Some((path.clone(), SourceHeader { references, platform }));
                }
                Some((first_path, header)) => {
                    let same_names = header.references.len() == references.len()
                        && header
                            .references
                            .iter()
                            .zip(&references)
                            .all(|(a, b)| a.0 == b.0);
                    if !same_names {
                        return Err(PipelineError::IncompatibleInputs {
                            first: first_path.clone(),
                            other: path.clone(),
                        }
                        .into());
                    }
                }
            }
        }

        first
            .map(|(_, header)| header)
            .ok_or_else(|| anyhow!("No input BAM files"))
    }

    fn fetch(&self, chrom: &str) -> Result<RecordStream<'_>> {
        Ok(Box::new(BamRecords {
            chrom: chrom.to_string(),
            pending: self.paths.clone().into_iter(),
            current: None,
            record: bam::Record::new(),
        }))
    }
}

/// Records of one chromosome across every input, in input order
struct BamRecords {
    chrom: String,
    pending: std::vec::IntoIter<PathBuf>,
    current: Option<(PathBuf, bam::IndexedReader, Vec<String>)>,
    record: bam::Record,
}

impl BamRecords {
    fn open_next(&mut self, path: PathBuf) -> Result<()> {
        let mut reader = open_indexed(&path)?;
        let names = target_names(reader.header());
        let tid = names
            .iter()
            .position(|n| n == &self.chrom)
            .ok_or_else(|| anyhow!("Chromosome {} not found in {}", self.chrom, path.display()))?;
        reader
            .fetch(tid as i32)
            .with_context(|| format!("Failed to fetch {} from {}", self.chrom, path.display()))?;
        self.current = Some((path, reader, names));
        Ok(())
    }

    /// Stop the stream after an error
    fn abandon(&mut self) {
        self.current = None;
        self.pending = Vec::new().into_iter();
    }
}

impl Iterator for BamRecords {
    type Item = Result<AlignmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                let path = self.pending.next()?;
                if let Err(e) = self.open_next(path) {
                    self.abandon();
                    return Some(Err(e));
                }
            }
            let (path, reader, names) = self.current.as_mut()?;

            match reader.read(&mut self.record) {
                None => self.current = None,
                Some(Err(e)) => {
                    let err = anyhow!("Failed to read BAM record from {}: {e}", path.display());
                    self.abandon();
                    return Some(Err(err));
                }
                Some(Ok(())) => {
                    let rec = &self.record;
                    if rec.is_unmapped() || rec.is_secondary() || rec.is_duplicate() {
                        continue;
                    }
                    return Some(Ok(convert_record(rec, names)));
                }
            }
        }
    }
}

fn aux_integer(rec: &bam::Record, tag: &[u8]) -> Option<i64> {
    match rec.aux(tag) {
        Ok(Aux::I8(v)) => Some(v as i64),
        Ok(Aux::U8(v)) => Some(v as i64),
        Ok(Aux::I16(v)) => Some(v as i64),
        Ok(Aux::U16(v)) => Some(v as i64),
        Ok(Aux::I32(v)) => Some(v as i64),
        Ok(Aux::U32(v)) => Some(v as i64),
        _ => None,
    }
}

fn convert_record(rec: &bam::Record, names: &[String]) -> AlignmentRecord {
    let name_of = |tid: i32| usize::try_from(tid).ok().and_then(|t| names.get(t)).cloned();

    let blocks = rec
        .aligned_block_pairs()
        .filter_map(|([q_start, q_end], [r_start, _])| {
            Some(AlignedBlock {
                ref_start: u64::try_from(r_start).ok()? + 1,
                query_offset: usize::try_from(q_start).ok()?,
                len: u32::try_from(q_end - q_start).ok()?,
            })
        })
        .collect();

    AlignmentRecord {
        read_name: String::from_utf8_lossy(rec.qname()).into_owned(),
        chrom: name_of(rec.tid()).unwrap_or_default(),
        pos: rec.pos().max(0) as u64 + 1,
        mapq: rec.mapq(),
        reverse: rec.is_reverse(),
        mate_chrom: name_of(rec.mtid()),
        insert_pos: aux_integer(rec, b"ip").and_then(|v| u64::try_from(v).ok()),
        mate_insert_pos: aux_integer(rec, b"mp").and_then(|v| u64::try_from(v).ok()),
        mate_mapq: aux_integer(rec, b"MQ").and_then(|v| u8::try_from(v).ok()),
        read_type: aux_integer(rec, b"rt")
            .and_then(|v| u8::try_from(v).ok())
            .and_then(ReadType::new),
        sequence: rec.seq().as_bytes(),
        blocks,
    }
}

/// Records held in memory, for tests and small synthetic runs
#[derive(Debug, Clone)]
pub struct InMemorySource {
    header: SourceHeader,
    records: Vec<AlignmentRecord>,
    failing: HashSet<String>,
}

impl InMemorySource {
    pub fn new(references: Vec<(String, u64)>, platform: Platform, records: Vec<AlignmentRecord>) -> Self {
        InMemorySource {
            header: SourceHeader { references, platform },
            records,
            failing: HashSet::new(),
        }
    }

    /// Make every fetch of `chrom` fail partway through its stream
    pub fn with_failing_chromosome(mut self, chrom: &str) -> Self {
        self.failing.insert(chrom.to_string());
        self
    }
}

impl AlignmentSource for InMemorySource {
    fn header(&self) -> Result<SourceHeader> {
        Ok(self.header.clone())
    }

    fn fetch(&self, chrom: &str) -> Result<RecordStream<'_>> {
        if !self.header.references.iter().any(|(name, _)| name == chrom) {
            bail!("Chromosome {chrom} not found in source");
        }
        let chrom = chrom.to_string();
        let failure = self
            .failing
            .contains(&chrom)
            .then(|| Err(anyhow!("simulated read failure on {chrom}")));
        let matching = self
            .records
            .iter()
            .filter(move |r| r.chrom == chrom)
            .cloned()
            .map(Ok);
        Ok(Box::new(matching.chain(failure)))
    }
}
