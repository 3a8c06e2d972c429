//! External matrix and track builders
//!
//! Both engines are opaque commands. The pipeline only trusts them as far as
//! their exit status and the artifact they leave behind: a zero exit with a
//! missing or empty output still counts as a failure.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::artifacts;
use crate::error::PipelineError;
use crate::stage::Stage;

pub const DEFAULT_MATRIX_TOOL: &str = "juicer_tools";
pub const DEFAULT_TRACK_TOOL: &str = "bedGraphToBigWig";

/// Builds a binary contact matrix from a sorted contact file
pub trait MatrixEngine: Sync {
    fn name(&self) -> &'static str {
        "matrix engine"
    }

    fn build(&self, contacts: &Path, chrom_sizes: &Path, resolutions: &[u32], output: &Path) -> Result<()>;
}

/// Encodes a sorted bedGraph into a binary track
pub trait TrackEngine: Sync {
    fn name(&self) -> &'static str {
        "track engine"
    }

    fn encode(&self, bedgraph: &Path, chrom_sizes: &Path, output: &Path) -> Result<()>;
}

/// Resolve a tool to an executable path
///
/// Anything containing a path separator must exist as given; bare names are
/// looked up on `PATH`.
pub fn resolve_binary(name: &str) -> Result<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        if path.exists() {
            return Ok(path);
        }
        bail!("Tool '{}' does not exist", path.display());
    }

    if let Ok(output) = Command::new("which").arg(name).output() {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }

    Err(anyhow!("Tool '{name}' not found on PATH"))
}

/// A command line such as `java -jar juicer_tools.jar`, split into the
/// program and its leading arguments
#[derive(Debug, Clone)]
struct ToolCommand {
    program: String,
    leading: Vec<String>,
}

impl ToolCommand {
    fn parse(command: &str) -> Result<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words
            .next()
            .ok_or_else(|| anyhow!("Empty tool command"))?;
        Ok(ToolCommand {
            program,
            leading: words.collect(),
        })
    }

    fn run(&self, args: &[String]) -> Result<()> {
        let program = resolve_binary(&self.program)?;
        debug!("Running {} {} {}", program.display(), self.leading.join(" "), args.join(" "));

        let output = Command::new(&program)
            .args(&self.leading)
            .args(args)
            .output()
            .with_context(|| format!("Failed to launch {}", program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// `<tool> pre -r <res,...> <contacts> <out.hic> <chrom.sizes>`
#[derive(Debug, Clone)]
pub struct CommandMatrixEngine {
    tool: ToolCommand,
}

impl CommandMatrixEngine {
    pub fn new(tool: &str) -> Result<Self> {
        Ok(CommandMatrixEngine {
            tool: ToolCommand::parse(tool)?,
        })
    }
}

impl MatrixEngine for CommandMatrixEngine {
    fn build(&self, contacts: &Path, chrom_sizes: &Path, resolutions: &[u32], output: &Path) -> Result<()> {
        let resolutions: Vec<String> = resolutions.iter().map(u32::to_string).collect();
        self.tool.run(&[
            "pre".to_string(),
            "-r".to_string(),
            resolutions.join(","),
            contacts.display().to_string(),
            output.display().to_string(),
            chrom_sizes.display().to_string(),
        ])
    }
}

/// `<tool> <bedgraph> <chrom.sizes> <out.bw>`
#[derive(Debug, Clone)]
pub struct CommandTrackEngine {
    tool: ToolCommand,
}

impl CommandTrackEngine {
    pub fn new(tool: &str) -> Result<Self> {
        Ok(CommandTrackEngine {
            tool: ToolCommand::parse(tool)?,
        })
    }
}

impl TrackEngine for CommandTrackEngine {
    fn encode(&self, bedgraph: &Path, chrom_sizes: &Path, output: &Path) -> Result<()> {
        self.tool.run(&[
            bedgraph.display().to_string(),
            chrom_sizes.display().to_string(),
            output.display().to_string(),
        ])
    }
}

fn verify_output(stage: Stage, engine: &'static str, result: Result<()>, output: &Path) -> Result<()> {
    if let Err(e) = result {
        return Err(PipelineError::ExternalEngine {
            stage,
            engine,
            detail: format!("{e:#}"),
        }
        .into());
    }
    if !artifacts::is_present(output) {
        return Err(PipelineError::ExternalEngine {
            stage,
            engine,
            detail: format!("reported success but {} is missing or empty", output.display()),
        }
        .into());
    }
    Ok(())
}

/// Run the matrix engine and confirm it produced `output`
pub fn build_matrix(
    engine: &dyn MatrixEngine,
    stage: Stage,
    contacts: &Path,
    chrom_sizes: &Path,
    resolutions: &[u32],
    output: &Path,
) -> Result<()> {
    info!("[{stage}] Building matrix {}", output.display());
    let result = engine.build(contacts, chrom_sizes, resolutions, output);
    verify_output(stage, engine.name(), result, output)
}

/// Run the track engine and confirm it produced `output`
pub fn encode_track(
    engine: &dyn TrackEngine,
    stage: Stage,
    bedgraph: &Path,
    chrom_sizes: &Path,
    output: &Path,
) -> Result<()> {
    info!("[{stage}] Encoding track {}", output.display());
    let result = engine.encode(bedgraph, chrom_sizes, output);
    verify_output(stage, engine.name(), result, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct SilentMatrix;

    impl MatrixEngine for SilentMatrix {
        fn build(&self, _: &Path, _: &Path, _: &[u32], _: &Path) -> Result<()> {
            Ok(())
        }
    }

    struct FailingTrack;

    impl TrackEngine for FailingTrack {
        fn encode(&self, _: &Path, _: &Path, _: &Path) -> Result<()> {
            bail!("chromosome chrUn missing from sizes")
        }
    }

    #[test]
    fn test_success_without_output_is_engine_error() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("inter.hic");
        let err = build_matrix(&SilentMatrix, Stage::Hic, &out, &out, &[1000], &out).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::ExternalEngine { stage, detail, .. }) => {
                assert_eq!(*stage, Stage::Hic);
                assert!(detail.contains("missing or empty"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_engine_failure_is_reported_with_detail() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("inter_30.bw");
        let err = encode_track(&FailingTrack, Stage::Dhs, &out, &out, &out).unwrap_err();
        assert!(err.to_string().contains("chrUn missing"));
    }

    #[test]
    fn test_tool_command_parsing() {
        let tool = ToolCommand::parse("java -Xmx8g -jar juicer_tools.jar").unwrap();
        assert_eq!(tool.program, "java");
        assert_eq!(tool.leading, vec!["-Xmx8g", "-jar", "juicer_tools.jar"]);
        assert!(ToolCommand::parse("   ").is_err());
    }

    #[test]
    fn test_resolve_missing_binary() {
        assert!(resolve_binary("/nonexistent/dir/juicer_tools").is_err());
        assert!(resolve_binary("definitely-not-a-real-tool-megahic").is_err());
    }
}
