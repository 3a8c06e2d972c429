//! Per-chromosome record mapping
//!
//! Turns the alignment records of one chromosome partition into either
//! pairwise contact records (contact-map mode) or per-base read-end counts
//! (accessibility mode). Both modes are folds over the record stream: state
//! is accumulated in local maps and drained into sorted output at the end.

use anyhow::Result;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashSet};

use crate::records::{AlignmentRecord, ContactRecord, JunctionSet, LocusCountRecord, ReadType};

/// Filters applied to every record before it contributes to output
#[derive(Debug, Clone, Copy)]
pub struct MapperParams {
    pub min_mapq: u8,
    pub junctions: JunctionSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapperStats {
    pub records_seen: u64,
    pub low_quality: u64,
    pub rejected_junction: u64,
    pub malformed: u64,
    pub off_partition: u64,
}

impl MapperStats {
    pub fn merge(&mut self, other: &MapperStats) {
        self.records_seen += other.records_seen;
        self.low_quality += other.low_quality;
        self.rejected_junction += other.rejected_junction;
        self.malformed += other.malformed;
        self.off_partition += other.off_partition;
    }
}

/// Contact-map output of one partition
///
/// `primary` holds contacts owned by this partition: cross-chromosome
/// contacts toward lexicographically later chromosomes, in input order,
/// followed by one self-ligation record per retained read name. `side` holds
/// cross-chromosome contacts whose mate chromosome sorts earlier; those are
/// normally emitted by the mate's own partition.
#[derive(Debug, Clone, Default)]
pub struct ContactOutput {
    pub chrom: String,
    pub primary: Vec<ContactRecord>,
    pub side: Vec<ContactRecord>,
    pub stats: MapperStats,
}

/// Accessibility output of one partition
#[derive(Debug, Clone, Default)]
pub struct CountTracks {
    pub raw: Vec<LocusCountRecord>,
    /// Only reads whose mate in this partition carries the paired read type
    pub corrected: Vec<LocusCountRecord>,
    pub stats: MapperStats,
}

/// Fields a record must carry to become a contact
struct ContactFields<'a> {
    insert_pos: u64,
    mate_chrom: &'a str,
    mate_insert_pos: u64,
}

/// Apply quality and junction filters, counting what was dropped
fn passes_filters(
    rec: &AlignmentRecord,
    chrom: &str,
    params: &MapperParams,
    need_mate_mapq: bool,
    stats: &mut MapperStats,
) -> Option<ReadType> {
    if rec.chrom != chrom {
        stats.off_partition += 1;
        return None;
    }
    let Some(read_type) = rec.read_type else {
        stats.malformed += 1;
        return None;
    };
    if rec.mapq < params.min_mapq {
        stats.low_quality += 1;
        return None;
    }
    if need_mate_mapq {
        match rec.mate_mapq {
            None => {
                stats.malformed += 1;
                return None;
            }
            Some(mq) if mq < params.min_mapq => {
                stats.low_quality += 1;
                return None;
            }
            Some(_) => {}
        }
    }
    if !params.junctions.contains(read_type) {
        stats.rejected_junction += 1;
        return None;
    }
    Some(read_type)
}

/// Insert positions are 1-based; zero marks a broken tag
fn position(value: Option<u64>) -> Option<u64> {
    value.filter(|&pos| pos > 0)
}

fn contact_fields(rec: &AlignmentRecord) -> Option<ContactFields<'_>> {
    Some(ContactFields {
        insert_pos: position(rec.insert_pos)?,
        mate_chrom: rec.mate_chrom.as_deref()?,
        mate_insert_pos: position(rec.mate_insert_pos)?,
    })
}

/// Map one chromosome's records to contact records
///
/// Self-chromosome pairs are collapsed to one record per read name; when a
/// name occurs several times the last accepted record decides the positions.
/// Errors from the record stream itself abort the partition; malformed
/// records are only counted.
pub fn map_contacts<I>(chrom: &str, params: &MapperParams, records: I) -> Result<ContactOutput>
where
    I: IntoIterator<Item = Result<AlignmentRecord>>,
{
    let mut stats = MapperStats::default();
    let mut primary = Vec::new();
    let mut side = Vec::new();
    // read name -> (insert pos, mate insert pos), first-seen order
    let mut self_ligations: IndexMap<String, (u64, u64)> = IndexMap::new();

    for rec in records {
        let rec = rec?;
        stats.records_seen += 1;

        if passes_filters(&rec, chrom, params, true, &mut stats).is_none() {
            continue;
        }
        let Some(fields) = contact_fields(&rec) else {
            stats.malformed += 1;
            continue;
        };

        if fields.mate_chrom == chrom {
            let ends = (fields.insert_pos, fields.mate_insert_pos);
            self_ligations.insert(rec.read_name, ends);
            continue;
        }

        let contact = ContactRecord::inter(
            chrom,
            fields.insert_pos,
            fields.mate_chrom,
            fields.mate_insert_pos,
        );
        if fields.mate_chrom < chrom {
            side.push(contact);
        } else {
            primary.push(contact);
        }
    }

    primary.extend(
        self_ligations
            .into_values()
            .map(|(pos, mate_pos)| ContactRecord::intra(chrom, pos, mate_pos)),
    );

    Ok(ContactOutput {
        chrom: chrom.to_string(),
        primary,
        side,
        stats,
    })
}

/// Count distinct read 5'-end positions per base of one chromosome
///
/// A read name contributes at most once to any position. The corrected track
/// only counts a record when another record of the same read in this
/// partition carries the paired read type.
pub fn count_loci<I>(chrom: &str, params: &MapperParams, records: I) -> Result<CountTracks>
where
    I: IntoIterator<Item = Result<AlignmentRecord>>,
{
    let mut stats = MapperStats::default();
    let mut by_read: IndexMap<String, Vec<(ReadType, u64)>> = IndexMap::new();

    for rec in records {
        let rec = rec?;
        stats.records_seen += 1;

        let Some(read_type) = passes_filters(&rec, chrom, params, false, &mut stats) else {
            continue;
        };
        let Some(pos) = position(rec.insert_pos) else {
            stats.malformed += 1;
            continue;
        };
        by_read.entry(rec.read_name).or_default().push((read_type, pos));
    }

    let mut raw: BTreeMap<u64, u32> = BTreeMap::new();
    let mut corrected: BTreeMap<u64, u32> = BTreeMap::new();

    for ends in by_read.values() {
        let mut raw_seen = HashSet::new();
        let mut corrected_seen = HashSet::new();
        for (i, &(read_type, pos)) in ends.iter().enumerate() {
            if raw_seen.insert(pos) {
                *raw.entry(pos).or_insert(0) += 1;
            }
            let consistent = ends
                .iter()
                .enumerate()
                .any(|(j, &(mate_type, _))| j != i && read_type.pairs_with(mate_type));
            if consistent && corrected_seen.insert(pos) {
                *corrected.entry(pos).or_insert(0) += 1;
            }
        }
    }

    let drain = |counts: BTreeMap<u64, u32>| -> Vec<LocusCountRecord> {
        counts
            .into_iter()
            .map(|(pos, count)| LocusCountRecord {
                chrom: chrom.to_string(),
                pos,
                count,
            })
            .collect()
    };

    Ok(CountTracks {
        raw: drain(raw),
        corrected: drain(corrected),
        stats,
    })
}
