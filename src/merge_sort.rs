//! Merge per-chromosome outputs into the order the matrix builder expects
//!
//! Contacts are ordered by (chrom1, chrom2) lexicographically; positions
//! inside one key are left as produced. Self-chromosome blocks are already
//! grouped per partition, so they are only reordered as whole blocks.
//! Cross-chromosome contacts go through a buffer that spills sorted chunks
//! to temporary files and is k-way merged back.
//!
//! The worker outputs handed to `merge` are already fully in memory, so
//! spilling does not lower the stage's peak. It moves cross contacts to disk
//! as their partitions are drained, and the sort never needs a second copy
//! of them.

use anyhow::{Context, Result};
use log::debug;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::record_mapper::ContactOutput;
use crate::records::{ContactRecord, LocusCountRecord};

/// Default number of cross-chromosome records held in memory before spilling
pub const DEFAULT_SPILL_RECORDS: usize = 1_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub self_records: u64,
    pub cross_records: u64,
    /// Side-channel contacts whose owning chromosome was not processed
    pub side_kept: u64,
    /// Side-channel contacts already emitted by their owning partition
    pub side_dropped: u64,
    pub spilled_chunks: usize,
}

impl MergeStats {
    pub fn records_written(&self) -> u64 {
        self.self_records + self.cross_records
    }
}

fn cmp_key(a: &ContactRecord, b: &ContactRecord) -> Ordering {
    a.key().cmp(&b.key())
}

pub struct MergeSorter {
    spill_records: usize,
    temp_dir: PathBuf,
}

impl MergeSorter {
    pub fn new<P: AsRef<Path>>(spill_records: usize, temp_dir: P) -> Self {
        MergeSorter {
            spill_records: spill_records.max(1),
            temp_dir: temp_dir.as_ref().to_path_buf(),
        }
    }

    /// Write all partitions as one stream sorted by (chrom1, chrom2)
    ///
    /// Side-channel contacts are turned around so the earlier chromosome
    /// comes first. They are kept only when that chromosome was not among
    /// the processed partitions; otherwise its partition already emitted the
    /// same contact.
    pub fn merge<W: Write>(&self, partitions: Vec<ContactOutput>, out: &mut W) -> Result<MergeStats> {
        let processed: HashSet<String> = partitions.iter().map(|p| p.chrom.clone()).collect();
        let mut stats = MergeStats::default();
        let mut cross = SpillBuffer::new(self.spill_records, &self.temp_dir);
        let mut self_blocks: Vec<(String, Vec<ContactRecord>)> = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let mut block = Vec::new();
            for rec in partition.primary {
                if rec.is_intra() {
                    block.push(rec);
                } else {
                    cross.push(rec)?;
                }
            }
            for rec in partition.side {
                let owned = rec.swapped();
                if processed.contains(&owned.chrom1) {
                    stats.side_dropped += 1;
                } else {
                    stats.side_kept += 1;
                    cross.push(owned)?;
                }
            }
            self_blocks.push((partition.chrom, block));
        }

        self_blocks.sort_by(|a, b| a.0.cmp(&b.0));
        stats.spilled_chunks = cross.chunk_count();
        let mut cross_iter = cross.finish()?.peekable();

        for (chrom, block) in self_blocks {
            // cross contacts with chrom1 < chrom precede the (chrom, chrom) block
            while let Some(next) = cross_iter.peek() {
                let before = match next {
                    Ok(rec) => rec.chrom1.as_str() < chrom.as_str(),
                    Err(_) => true,
                };
                if !before {
                    break;
                }
                if let Some(rec) = cross_iter.next() {
                    writeln!(out, "{}", rec?)?;
                    stats.cross_records += 1;
                }
            }
            for rec in &block {
                writeln!(out, "{rec}")?;
            }
            stats.self_records += block.len() as u64;
        }

        for rec in cross_iter {
            writeln!(out, "{}", rec?)?;
            stats.cross_records += 1;
        }

        debug!(
            "Merged {} self and {} cross contacts ({} spilled chunks, {} side kept, {} side dropped)",
            stats.self_records,
            stats.cross_records,
            stats.spilled_chunks,
            stats.side_kept,
            stats.side_dropped
        );
        Ok(stats)
    }
}

/// Write per-chromosome count tracks as one bedGraph sorted by chromosome
/// name, then position
pub fn merge_counts<W: Write>(mut tracks: Vec<Vec<LocusCountRecord>>, out: &mut W) -> Result<u64> {
    tracks.retain(|t| !t.is_empty());
    tracks.sort_by(|a, b| a[0].chrom.cmp(&b[0].chrom));
    let mut written = 0u64;
    for track in tracks {
        for rec in track {
            writeln!(out, "{rec}")?;
            written += 1;
        }
    }
    Ok(written)
}

/// In-memory buffer of contacts that spills sorted runs to disk
struct SpillBuffer {
    limit: usize,
    dir: PathBuf,
    buffer: Vec<ContactRecord>,
    chunks: Vec<NamedTempFile>,
}

impl SpillBuffer {
    fn new(limit: usize, dir: &Path) -> Self {
        SpillBuffer {
            limit,
            dir: dir.to_path_buf(),
            buffer: Vec::new(),
            chunks: Vec::new(),
        }
    }

    fn push(&mut self, rec: ContactRecord) -> Result<()> {
        self.buffer.push(rec);
        if self.buffer.len() >= self.limit {
            self.spill()?;
        }
        Ok(())
    }

    fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn spill(&mut self) -> Result<()> {
        // stable sort keeps production order inside equal keys
        self.buffer.sort_by(cmp_key);
        let chunk = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create spill file in {}", self.dir.display()))?;
        {
            let mut writer = BufWriter::new(chunk.as_file());
            for rec in self.buffer.drain(..) {
                writeln!(writer, "{rec}")?;
            }
            writer.flush()?;
        }
        self.chunks.push(chunk);
        Ok(())
    }

    fn finish(mut self) -> Result<Box<dyn Iterator<Item = Result<ContactRecord>>>> {
        if self.chunks.is_empty() {
            self.buffer.sort_by(cmp_key);
            return Ok(Box::new(self.buffer.into_iter().map(Ok)));
        }
        if !self.buffer.is_empty() {
            self.spill()?;
        }
        Ok(Box::new(ChunkMerge::open(self.chunks)?))
    }
}

/// K-way merge over sorted spill files; ties resolve to the earlier chunk
struct ChunkMerge {
    // held so the files are removed once the merge is dropped
    _chunks: Vec<NamedTempFile>,
    readers: Vec<Lines<BufReader<File>>>,
    heads: Vec<Option<ContactRecord>>,
    heap: BinaryHeap<Reverse<(String, String, usize)>>,
}

impl ChunkMerge {
    fn open(chunks: Vec<NamedTempFile>) -> Result<Self> {
        let mut readers = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let file = chunk.reopen().context("Failed to reopen spill file")?;
            readers.push(BufReader::new(file).lines());
        }
        let mut merge = ChunkMerge {
            _chunks: chunks,
            heads: vec![None; readers.len()],
            readers,
            heap: BinaryHeap::new(),
        };
        for idx in 0..merge.readers.len() {
            merge.advance(idx)?;
        }
        Ok(merge)
    }

    fn advance(&mut self, idx: usize) -> Result<()> {
        if let Some(line) = self.readers[idx].next() {
            let rec: ContactRecord = line?.parse()?;
            self.heap
                .push(Reverse((rec.chrom1.clone(), rec.chrom2.clone(), idx)));
            self.heads[idx] = Some(rec);
        }
        Ok(())
    }
}

impl Iterator for ChunkMerge {
    type Item = Result<ContactRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((_, _, idx)) = self.heap.pop()?;
        let rec = self.heads[idx].take()?;
        if let Err(e) = self.advance(idx) {
            return Some(Err(e));
        }
        Some(Ok(rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn partition(chrom: &str, primary: Vec<ContactRecord>, side: Vec<ContactRecord>) -> ContactOutput {
        ContactOutput {
            chrom: chrom.to_string(),
            primary,
            side,
            ..Default::default()
        }
    }

    fn merged_lines(sorter: &MergeSorter, parts: Vec<ContactOutput>) -> (Vec<String>, MergeStats) {
        let mut out = Vec::new();
        let stats = sorter.merge(parts, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        (text.lines().map(str::to_string).collect(), stats)
    }

    #[test]
    fn test_blocks_and_cross_contacts_interleave_by_key() {
        let dir = TempDir::new().unwrap();
        let sorter = MergeSorter::new(DEFAULT_SPILL_RECORDS, dir.path());
        // chromosome list order is not lexicographic
        let parts = vec![
            partition(
                "chr2",
                vec![
                    ContactRecord::inter("chr2", 5, "chr3", 6),
                    ContactRecord::intra("chr2", 1, 2),
                ],
                vec![ContactRecord::inter("chr2", 7, "chr10", 8)],
            ),
            partition(
                "chr10",
                vec![
                    ContactRecord::inter("chr10", 8, "chr2", 7),
                    ContactRecord::intra("chr10", 3, 4),
                ],
                vec![],
            ),
        ];
        let (lines, stats) = merged_lines(&sorter, parts);
        assert_eq!(
            lines,
            vec![
                "0 chr10 3 0 0 chr10 4 1",
                "0 chr10 8 0 0 chr2 7 1",
                "0 chr2 1 0 0 chr2 2 1",
                "0 chr2 5 0 0 chr3 6 1",
            ]
        );
        assert_eq!(stats.side_dropped, 1);
        assert_eq!(stats.side_kept, 0);
        assert_eq!(stats.records_written(), 4);
    }

    #[test]
    fn test_side_contact_kept_when_owner_not_processed() {
        let dir = TempDir::new().unwrap();
        let sorter = MergeSorter::new(DEFAULT_SPILL_RECORDS, dir.path());
        let parts = vec![partition(
            "chr5",
            vec![],
            vec![ContactRecord::inter("chr5", 10, "chr1", 20)],
        )];
        let (lines, stats) = merged_lines(&sorter, parts);
        assert_eq!(lines, vec!["0 chr1 20 0 0 chr5 10 1"]);
        assert_eq!(stats.side_kept, 1);
    }

    #[test]
    fn test_spilled_merge_matches_in_memory_merge() {
        let dir = TempDir::new().unwrap();
        let chroms = ["chr1", "chr2", "chr3", "chr4"];
        let build = || {
            chroms
                .iter()
                .enumerate()
                .map(|(i, c)| {
                    let primary = (0..25u64)
                        .flat_map(|j| {
                            let later = chroms[(i + 1 + j as usize % 3) % chroms.len()];
                            let mut v = vec![ContactRecord::intra(c, j, j * 2)];
                            if later > *c {
                                v.push(ContactRecord::inter(c, j, later, j + 100));
                            }
                            v
                        })
                        .collect();
                    partition(c, primary, vec![])
                })
                .collect::<Vec<_>>()
        };

        let (in_memory, _) = merged_lines(&MergeSorter::new(usize::MAX, dir.path()), build());
        let (spilled, stats) = merged_lines(&MergeSorter::new(7, dir.path()), build());
        assert!(stats.spilled_chunks > 1);
        assert_eq!(in_memory, spilled);

        let keys: Vec<(String, String)> = spilled
            .iter()
            .map(|l| {
                let rec: ContactRecord = l.parse().unwrap();
                (rec.chrom1, rec.chrom2)
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_merge_counts_sorts_by_chromosome() {
        let rec = |chrom: &str, pos| LocusCountRecord {
            chrom: chrom.to_string(),
            pos,
            count: 1,
        };
        let tracks = vec![vec![rec("chr2", 5), rec("chr2", 9)], vec![], vec![rec("chr10", 1)]];
        let mut out = Vec::new();
        let written = merge_counts(tracks, &mut out).unwrap();
        assert_eq!(written, 3);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "chr10\t0\t1\t1\nchr2\t4\t5\t1\nchr2\t8\t9\t1\n"
        );
    }
}
