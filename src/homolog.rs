//! Homolog assignment from phased variants
//!
//! Reads are labelled with the homolog whose alleles they carry at phased
//! heterozygous SNPs. Evidence is gathered per read name, so both mates of a
//! pair vote together; a read that matches both homologs is dropped.

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use crate::records::{AlignmentRecord, HomologSide};

/// Heterozygous phased SNP; `allele_r`/`allele_a` are the bases carried by
/// the r and a homologs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasedVariant {
    pub pos: u64,
    pub allele_r: u8,
    pub allele_a: u8,
}

/// Phased variants grouped per chromosome, sorted by position
#[derive(Debug, Clone, Default)]
pub struct PhasedVariantSet {
    by_chrom: HashMap<String, Vec<PhasedVariant>>,
}

impl PhasedVariantSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chrom: &str, variant: PhasedVariant) {
        self.by_chrom
            .entry(chrom.to_string())
            .or_default()
            .push(variant);
    }

    /// Sort every chromosome's variants; call once after loading
    pub fn finalize(&mut self) {
        for variants in self.by_chrom.values_mut() {
            variants.sort_by_key(|v| v.pos);
            variants.dedup_by_key(|v| v.pos);
        }
    }

    pub fn len(&self) -> usize {
        self.by_chrom.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Variants with `start <= pos < end`
    pub fn overlapping(&self, chrom: &str, start: u64, end: u64) -> &[PhasedVariant] {
        let Some(variants) = self.by_chrom.get(chrom) else {
            return &[];
        };
        let lo = variants.partition_point(|v| v.pos < start);
        let hi = variants.partition_point(|v| v.pos < end);
        &variants[lo..hi.max(lo)]
    }
}

fn single_base(allele: &str) -> Option<u8> {
    match allele.as_bytes() {
        [b] if b"ACGTacgt".contains(b) => Some(b.to_ascii_uppercase()),
        _ => None,
    }
}

/// Load phased heterozygous SNPs from a VCF (plain or bgzip)
///
/// Keeps biallelic SNPs whose first sample genotype is `0|1` or `1|0`. The
/// first haplotype's allele becomes homolog r, the second homolog a.
pub fn load_phased_vcf<P: AsRef<Path>>(
    path: P,
    allow: Option<&HashSet<String>>,
) -> Result<PhasedVariantSet> {
    let path = path.as_ref();
    let reader = crate::artifacts::open_text_input(path)?;
    let mut set = PhasedVariantSet::new();
    let mut skipped = 0usize;

    for line in reader.lines() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 10 {
            skipped += 1;
            continue;
        }
        let chrom = fields[0];
        if allow.is_some_and(|a| !a.contains(chrom)) {
            continue;
        }
        let (Ok(pos), Some(ref_base), Some(alt_base)) =
            (fields[1].parse::<u64>(), single_base(fields[3]), single_base(fields[4]))
        else {
            skipped += 1;
            continue;
        };
        let Some(gt_idx) = fields[8].split(':').position(|k| k == "GT") else {
            skipped += 1;
            continue;
        };
        let gt = fields[9].split(':').nth(gt_idx).unwrap_or(".");
        let (allele_r, allele_a) = match gt {
            "0|1" => (ref_base, alt_base),
            "1|0" => (alt_base, ref_base),
            _ => {
                skipped += 1;
                continue;
            }
        };
        set.insert(chrom, PhasedVariant { pos, allele_r, allele_a });
    }

    set.finalize();
    debug!(
        "Loaded {} phased SNPs from {} ({} records skipped)",
        set.len(),
        path.display(),
        skipped
    );
    Ok(set)
}

/// Load a phase-structure table: `chrom pos allele_r allele_a` per line
pub fn load_phase_structure<P: AsRef<Path>>(
    path: P,
    allow: Option<&HashSet<String>>,
) -> Result<PhasedVariantSet> {
    let path = path.as_ref();
    let reader = crate::artifacts::open_text_input(path)?;
    let mut set = PhasedVariantSet::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            bail!(
                "{}:{}: expected 'chrom pos allele_r allele_a'",
                path.display(),
                lineno + 1
            );
        }
        if allow.is_some_and(|a| !a.contains(fields[0])) {
            continue;
        }
        let pos = fields[1]
            .parse::<u64>()
            .with_context(|| format!("{}:{}: bad position", path.display(), lineno + 1))?;
        if let (Some(allele_r), Some(allele_a)) = (single_base(fields[2]), single_base(fields[3])) {
            set.insert(fields[0], PhasedVariant { pos, allele_r, allele_a });
        }
    }

    set.finalize();
    Ok(set)
}

#[derive(Debug, Clone, Default)]
struct Evidence {
    chrom: String,
    r: bool,
    a: bool,
}

/// Per-read homolog evidence gathered from one or more chromosomes
#[derive(Debug, Clone, Default)]
pub struct ReadEvidence {
    reads: IndexMap<String, Evidence>,
}

impl ReadEvidence {
    fn record(&mut self, read: &str, chrom: &str, side: HomologSide) {
        let entry = self.reads.entry(read.to_string()).or_insert_with(|| Evidence {
            chrom: chrom.to_string(),
            ..Default::default()
        });
        match side {
            HomologSide::R => entry.r = true,
            HomologSide::A => entry.a = true,
        }
    }

    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    /// Fold in evidence from a later chromosome; earlier labels are kept
    pub fn absorb(&mut self, other: ReadEvidence) {
        for (read, ev) in other.reads {
            let entry = self.reads.entry(read).or_insert_with(|| Evidence {
                chrom: ev.chrom.clone(),
                ..Default::default()
            });
            entry.r |= ev.r;
            entry.a |= ev.a;
        }
    }

    /// Resolve evidence into assignments, dropping reads that hit both homologs
    pub fn into_assignment(self) -> (ReadHomologAssignment, AssignmentStats) {
        let mut stats = AssignmentStats::default();
        let mut reads = IndexMap::with_capacity(self.reads.len());
        for (read, ev) in self.reads {
            let side = match (ev.r, ev.a) {
                (true, false) => HomologSide::R,
                (false, true) => HomologSide::A,
                (true, true) => {
                    stats.conflicting += 1;
                    continue;
                }
                (false, false) => continue,
            };
            match side {
                HomologSide::R => stats.assigned_r += 1,
                HomologSide::A => stats.assigned_a += 1,
            }
            reads.insert(read, (ev.chrom, side));
        }
        (ReadHomologAssignment { reads }, stats)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentStats {
    pub assigned_r: u64,
    pub assigned_a: u64,
    pub conflicting: u64,
}

/// Collect homolog evidence from one chromosome's records
pub fn scan_chromosome<I>(
    chrom: &str,
    variants: &PhasedVariantSet,
    min_mapq: u8,
    records: I,
) -> Result<ReadEvidence>
where
    I: IntoIterator<Item = Result<AlignmentRecord>>,
{
    let mut evidence = ReadEvidence::default();
    for rec in records {
        let rec = rec?;
        if rec.chrom != chrom || rec.mapq < min_mapq {
            continue;
        }
        let Some((start, end)) = rec.ref_span() else {
            continue;
        };
        for variant in variants.overlapping(chrom, start, end) {
            match rec.base_at(variant.pos) {
                Some(base) if base == variant.allele_r => {
                    evidence.record(&rec.read_name, chrom, HomologSide::R)
                }
                Some(base) if base == variant.allele_a => {
                    evidence.record(&rec.read_name, chrom, HomologSide::A)
                }
                _ => {}
            }
        }
    }
    Ok(evidence)
}

/// Read name to homolog mapping; conflicting reads are absent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadHomologAssignment {
    reads: IndexMap<String, (String, HomologSide)>,
}

impl ReadHomologAssignment {
    pub fn len(&self) -> usize {
        self.reads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reads.is_empty()
    }

    pub fn side(&self, read: &str) -> Option<HomologSide> {
        self.reads.get(read).map(|(_, side)| *side)
    }

    /// Label such as `chr1-r` for an assigned read
    pub fn label(&self, read: &str) -> Option<String> {
        self.reads.get(read).map(|(chrom, side)| side.label(chrom))
    }

    pub fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        for (read, (chrom, side)) in &self.reads {
            writeln!(out, "{read}\t{}", side.label(chrom))?;
        }
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open read assignment {}", path.display()))?;
        let mut reads = IndexMap::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Some((read, label)) = line.split_once('\t') else {
                bail!("{}:{}: expected 'read<TAB>label'", path.display(), lineno + 1);
            };
            let Some((chrom, side)) = HomologSide::parse_label(label.trim()) else {
                bail!("{}:{}: bad homolog label '{label}'", path.display(), lineno + 1);
            };
            reads.insert(read.to_string(), (chrom.to_string(), side));
        }
        Ok(ReadHomologAssignment { reads })
    }
}

/// Re-tag assigned records onto homolog chromosomes, split by side
///
/// Both the record's chromosome and its mate chromosome get the read's
/// homolog suffix; unassigned reads are dropped.
pub fn split_by_homolog<I>(
    records: I,
    assignment: &ReadHomologAssignment,
) -> Result<[Vec<AlignmentRecord>; 2]>
where
    I: IntoIterator<Item = Result<AlignmentRecord>>,
{
    let mut sides: [Vec<AlignmentRecord>; 2] = [Vec::new(), Vec::new()];
    for rec in records {
        let mut rec = rec?;
        let Some(side) = assignment.side(&rec.read_name) else {
            continue;
        };
        rec.chrom = side.label(&rec.chrom);
        rec.mate_chrom = rec.mate_chrom.as_deref().map(|m| side.label(m));
        let idx = match side {
            HomologSide::R => 0,
            HomologSide::A => 1,
        };
        sides[idx].push(rec);
    }
    Ok(sides)
}
