//! Durable pipeline artifacts
//!
//! An artifact counts as present when it exists and is non-empty; that is the
//! only checkpoint state the controller consults. Artifacts are written to a
//! temporary file next to their final path and renamed into place when
//! complete, so a crashed stage never leaves a half-written artifact behind
//! under its final name.

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use noodles::bgzf;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::PipelineError;
use crate::records::HomologSide;
use crate::stage::Stage;

pub const CHROM_SIZES: &str = "chrom.sizes";
pub const MERGED_HIC: &str = "merged1.txt";
pub const MATRIX_HIC: &str = "inter.hic";
pub const MERGED_NARROW: &str = "merged30.txt";
pub const MATRIX_NARROW: &str = "inter_30.hic";
pub const TRACK_PREFIX: &str = "inter_30";
pub const READS_TO_HOMOLOGS: &str = "reads_to_homologs.txt";
pub const DIPLOID_PREFIX: &str = "diploid";
pub const DIPLOID_CHROM_SIZES: &str = "diploid.chrom.sizes";

/// Existence and non-emptiness on disk
pub fn is_present<P: AsRef<Path>>(path: P) -> bool {
    std::fs::metadata(path.as_ref())
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Precondition check before entering `stage`
pub fn require<P: AsRef<Path>>(stage: Stage, path: P) -> Result<(), PipelineError> {
    let path = path.as_ref();
    if is_present(path) {
        Ok(())
    } else {
        Err(PipelineError::Precondition {
            stage,
            path: path.to_path_buf(),
        })
    }
}

/// Write an artifact through a temp file renamed into place on success
pub fn write_atomic<P, F, R>(path: P, write: F) -> Result<R>
where
    P: AsRef<Path>,
    F: FnOnce(&mut BufWriter<&File>) -> Result<R>,
{
    let path = path.as_ref();
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let temp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;

    let result = {
        let mut writer = BufWriter::new(temp.as_file());
        let result = write(&mut writer)?;
        writer.flush()?;
        result
    };
    temp.as_file().sync_all()?;
    temp.persist(path)
        .with_context(|| format!("Failed to move artifact into place at {}", path.display()))?;
    Ok(result)
}

/// Open a text input, decompressing `.gz` and `.bgz` files
pub fn open_text_input<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("bgz") => Ok(Box::new(BufReader::new(bgzf::io::reader::Reader::new(file)))),
        Some("gz") => Ok(Box::new(BufReader::new(MultiGzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

/// Gzip `path` to `path.gz` and remove the original
pub fn gzip_in_place<P: AsRef<Path>>(path: P) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut target = path.as_os_str().to_owned();
    target.push(".gz");
    let target = PathBuf::from(target);

    let mut input = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    write_atomic(&target, |w| {
        let mut encoder = GzEncoder::new(w, Compression::default());
        io::copy(&mut input, &mut encoder)?;
        encoder.finish()?;
        Ok(())
    })?;
    std::fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
    Ok(target)
}

/// Ordered chromosome name/length table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChromSizes {
    entries: Vec<(String, u64)>,
}

impl ChromSizes {
    pub fn new(entries: Vec<(String, u64)>) -> Self {
        ChromSizes { entries }
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn entries(&self) -> &[(String, u64)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Table over homolog chromosomes: `chr1-r`, `chr1-a`, `chr2-r`, ...
    pub fn homologs(&self) -> ChromSizes {
        let entries = self
            .entries
            .iter()
            .flat_map(|(name, len)| HomologSide::BOTH.iter().map(move |s| (s.label(name), *len)))
            .collect();
        ChromSizes { entries }
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomic(path, |w| {
            for (name, len) in &self.entries {
                writeln!(w, "{name}\t{len}")?;
            }
            Ok(())
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = open_text_input(path)?;
        let mut entries = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(name), Some(len)) = (fields.next(), fields.next()) else {
                bail!("{}:{}: expected 'name length'", path.display(), lineno + 1);
            };
            let len = len
                .parse::<u64>()
                .with_context(|| format!("{}:{}: bad length '{len}'", path.display(), lineno + 1))?;
            entries.push((name.to_string(), len));
        }
        Ok(ChromSizes { entries })
    }
}
