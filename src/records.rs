use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

/// Ligation junction category carried in the `rt` tag (0..=5)
///
/// Categories come in mate pairs (0,1), (2,3), (4,5): the two halves of a
/// well-formed pair carry the two values of one pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReadType(u8);

impl ReadType {
    pub const COUNT: u8 = 6;

    pub fn new(value: u8) -> Option<Self> {
        (value < Self::COUNT).then_some(ReadType(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    /// True when `mate` is the other half of this read type's pair
    pub fn pairs_with(&self, mate: ReadType) -> bool {
        self.0 ^ 1 == mate.0
    }
}

/// Sequencing platform as reported by the `@RG PL:` header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Illumina,
    Ls454,
    Unknown,
}

impl Platform {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_uppercase().as_str() {
            "ILLUMINA" => Platform::Illumina,
            "LS454" | "454" => Platform::Ls454,
            _ => Platform::Unknown,
        }
    }
}

/// Set of accepted read types, stored as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JunctionSet(u8);

impl JunctionSet {
    pub const ALL: JunctionSet = JunctionSet(0b11_1111);

    pub fn from_types(types: &[u8]) -> Self {
        let mask = types
            .iter()
            .filter(|&&t| t < ReadType::COUNT)
            .fold(0u8, |m, &t| m | (1 << t));
        JunctionSet(mask)
    }

    /// Junction subset used for accessibility tracks on a given platform
    pub fn accessibility(platform: Platform) -> Self {
        match platform {
            Platform::Ls454 => JunctionSet::from_types(&[0, 1, 4, 5]),
            Platform::Illumina | Platform::Unknown => JunctionSet::from_types(&[0, 1, 2, 3]),
        }
    }

    pub fn contains(&self, rt: ReadType) -> bool {
        self.0 & (1 << rt.0) != 0
    }
}

/// Contiguous aligned stretch of a read: `len` bases starting at
/// 1-based reference position `ref_start` and read offset `query_offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedBlock {
    pub ref_start: u64,
    pub query_offset: usize,
    pub len: u32,
}

/// One sequenced read half as delivered by the alignment source
///
/// The tag fields are optional because real inputs can lack them; the mapper
/// drops records missing whatever its current mode needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlignmentRecord {
    pub read_name: String,
    pub chrom: String,
    /// 1-based leftmost aligned position
    pub pos: u64,
    pub mapq: u8,
    pub reverse: bool,
    pub mate_chrom: Option<String>,
    pub insert_pos: Option<u64>,
    pub mate_insert_pos: Option<u64>,
    pub mate_mapq: Option<u8>,
    pub read_type: Option<ReadType>,
    pub sequence: Vec<u8>,
    pub blocks: Vec<AlignedBlock>,
}

impl AlignmentRecord {
    /// Read base aligned to 1-based reference position `ref_pos`, if any
    pub fn base_at(&self, ref_pos: u64) -> Option<u8> {
        self.blocks.iter().find_map(|b| {
            let end = b.ref_start + b.len as u64;
            if ref_pos >= b.ref_start && ref_pos < end {
                let idx = b.query_offset + (ref_pos - b.ref_start) as usize;
                self.sequence.get(idx).map(|c| c.to_ascii_uppercase())
            } else {
                None
            }
        })
    }

    /// Reference span covered by aligned blocks, half-open
    pub fn ref_span(&self) -> Option<(u64, u64)> {
        let start = self.blocks.iter().map(|b| b.ref_start).min()?;
        let end = self
            .blocks
            .iter()
            .map(|b| b.ref_start + b.len as u64)
            .max()?;
        Some((start, end))
    }
}

/// Normalized pairwise contact (one "mnd" line)
///
/// Strand and fragment fields are placeholders: fragments are not tracked,
/// so every record carries strands 0/0 and fragments 0/1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub strand1: u8,
    pub chrom1: String,
    pub pos1: u64,
    pub frag1: u32,
    pub strand2: u8,
    pub chrom2: String,
    pub pos2: u64,
    pub frag2: u32,
}

impl ContactRecord {
    /// Contact within one chromosome, positions ordered so pos1 <= pos2
    pub fn intra(chrom: &str, a: u64, b: u64) -> Self {
        let (pos1, pos2) = if a <= b { (a, b) } else { (b, a) };
        Self::placeholder(chrom.to_string(), pos1, chrom.to_string(), pos2)
    }

    /// Contact between two chromosomes, oriented as given
    pub fn inter(chrom1: &str, pos1: u64, chrom2: &str, pos2: u64) -> Self {
        Self::placeholder(chrom1.to_string(), pos1, chrom2.to_string(), pos2)
    }

    fn placeholder(chrom1: String, pos1: u64, chrom2: String, pos2: u64) -> Self {
        ContactRecord {
            strand1: 0,
            chrom1,
            pos1,
            frag1: 0,
            strand2: 0,
            chrom2,
            pos2,
            frag2: 1,
        }
    }

    pub fn is_intra(&self) -> bool {
        self.chrom1 == self.chrom2
    }

    /// Same contact seen from the other end
    pub fn swapped(&self) -> Self {
        ContactRecord {
            strand1: self.strand2,
            chrom1: self.chrom2.clone(),
            pos1: self.pos2,
            frag1: self.frag1,
            strand2: self.strand1,
            chrom2: self.chrom1.clone(),
            pos2: self.pos1,
            frag2: self.frag2,
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.chrom1, &self.chrom2)
    }
}

impl fmt::Display for ContactRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {}",
            self.strand1,
            self.chrom1,
            self.pos1,
            self.frag1,
            self.strand2,
            self.chrom2,
            self.pos2,
            self.frag2
        )
    }
}

impl FromStr for ContactRecord {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 8 {
            bail!("contact line has {} fields, expected 8: {line}", fields.len());
        }
        Ok(ContactRecord {
            strand1: fields[0].parse()?,
            chrom1: fields[1].to_string(),
            pos1: fields[2].parse()?,
            frag1: fields[3].parse()?,
            strand2: fields[4].parse()?,
            chrom2: fields[5].to_string(),
            pos2: fields[6].parse()?,
            frag2: fields[7].parse()?,
        })
    }
}

/// Read 5'-end count over a single base, written as a bedGraph line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocusCountRecord {
    pub chrom: String,
    /// 1-based position of the counted base
    pub pos: u64,
    pub count: u32,
}

impl fmt::Display for LocusCountRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.chrom,
            self.pos - 1,
            self.pos,
            self.count
        )
    }
}

/// One of the two parental homologs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HomologSide {
    R,
    A,
}

impl HomologSide {
    pub const BOTH: [HomologSide; 2] = [HomologSide::R, HomologSide::A];

    pub fn suffix(&self) -> &'static str {
        match self {
            HomologSide::R => "r",
            HomologSide::A => "a",
        }
    }

    /// Homolog-specific chromosome name, e.g. `chr1-r`
    pub fn label(&self, chrom: &str) -> String {
        format!("{chrom}-{}", self.suffix())
    }

    /// Split `chr1-a` into (`chr1`, A)
    pub fn parse_label(label: &str) -> Option<(&str, HomologSide)> {
        let (chrom, suffix) = label.rsplit_once('-')?;
        let side = match suffix {
            "r" => HomologSide::R,
            "a" => HomologSide::A,
            _ => return None,
        };
        Some((chrom, side))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_type_pairing() {
        let rt0 = ReadType::new(0).unwrap();
        let rt1 = ReadType::new(1).unwrap();
        let rt2 = ReadType::new(2).unwrap();
        assert!(rt0.pairs_with(rt1));
        assert!(rt1.pairs_with(rt0));
        assert!(!rt1.pairs_with(rt2));
        assert!(!rt0.pairs_with(rt0));
        assert!(ReadType::new(6).is_none());
    }

    #[test]
    fn test_junction_sets() {
        let illumina = JunctionSet::accessibility(Platform::Illumina);
        let ls454 = JunctionSet::accessibility(Platform::Ls454);
        let rt4 = ReadType::new(4).unwrap();
        assert!(!illumina.contains(rt4));
        assert!(ls454.contains(rt4));
        assert!(JunctionSet::ALL.contains(ReadType::new(5).unwrap()));
        assert_eq!(Platform::from_tag("illumina"), Platform::Illumina);
        assert_eq!(Platform::from_tag("PACBIO"), Platform::Unknown);
    }

    #[test]
    fn test_contact_line_format() {
        let rec = ContactRecord::intra("chr1", 100, 100);
        assert_eq!(rec.to_string(), "0 chr1 100 0 0 chr1 100 1");
        let parsed: ContactRecord = "0 chr1 100 0 0 chr2 5 1".parse().unwrap();
        assert_eq!(parsed, ContactRecord::inter("chr1", 100, "chr2", 5));
        assert!("0 chr1 100".parse::<ContactRecord>().is_err());
    }

    #[test]
    fn test_intra_orders_positions() {
        let rec = ContactRecord::intra("chr3", 900, 15);
        assert_eq!((rec.pos1, rec.pos2), (15, 900));
    }

    #[test]
    fn test_base_at_uses_blocks() {
        let rec = AlignmentRecord {
            read_name: "r".into(),
            chrom: "chr1".into(),
            pos: 100,
            mapq: 60,
            reverse: false,
            mate_chrom: None,
            insert_pos: None,
            mate_insert_pos: None,
            mate_mapq: None,
            read_type: None,
            sequence: b"ACGTacgt".to_vec(),
            // 4M, 10bp deletion, 4M
            blocks: vec![
                AlignedBlock { ref_start: 100, query_offset: 0, len: 4 },
                AlignedBlock { ref_start: 114, query_offset: 4, len: 4 },
            ],
        };
        assert_eq!(rec.base_at(100), Some(b'A'));
        assert_eq!(rec.base_at(103), Some(b'T'));
        assert_eq!(rec.base_at(105), None);
        assert_eq!(rec.base_at(115), Some(b'C'));
        assert_eq!(rec.ref_span(), Some((100, 118)));
    }

    #[test]
    fn test_homolog_labels() {
        assert_eq!(HomologSide::R.label("chr1"), "chr1-r");
        assert_eq!(
            HomologSide::parse_label("chr1-a"),
            Some(("chr1", HomologSide::A))
        );
        assert_eq!(HomologSide::parse_label("chr1"), None);
    }

    #[test]
    fn test_bedgraph_line_is_zero_based_half_open() {
        let rec = LocusCountRecord {
            chrom: "chr2".into(),
            pos: 51,
            count: 3,
        };
        assert_eq!(rec.to_string(), "chr2\t50\t51\t3");
    }
}
