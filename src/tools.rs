//! dcm2niix and dcm2bids integration.
//!
//! Both tools are spawned with explicit argument lists; paths are never interpolated
//! into a shell string.

use crate::error::{BidsError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

pub const DEFAULT_DCM2NIIX: &str = "dcm2niix";
pub const DEFAULT_DCM2BIDS: &str = "dcm2bids";

/// dcm2niix output name pattern: protocol time, protocol name, series number.
pub const NIFTI_FILENAME_PATTERN: &str = "%t%p%s";

/// What to do when an external tool fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPolicy {
    /// Log the tool's error text and keep going.
    Tolerate,
    /// Propagate the error to the caller.
    Fail,
}

impl ToolPolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            Self::Fail
        } else {
            Self::Tolerate
        }
    }

    /// Applies the policy to a tool result. `Ok(None)` means the failure was tolerated.
    pub fn apply<T>(self, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e @ BidsError::ExternalTool { .. }) if self == Self::Tolerate => {
                warn!("{}; continuing", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// A program plus its argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<OsString>,
}

impl ToolInvocation {
    /// Runs the program, mapping a spawn failure or non-zero exit to `ExternalTool`.
    pub async fn run(&self) -> Result<ToolOutput> {
        debug!(program = %self.program, args = ?self.args, "spawning external tool");
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BidsError::ExternalTool {
                tool: self.program.clone(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            Ok(ToolOutput { stdout, stderr })
        } else {
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            let message = if message.is_empty() {
                format!("exited with {}", output.status)
            } else {
                message
            };
            Err(BidsError::ExternalTool {
                tool: self.program.clone(),
                message,
            })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Result of a dcm2niix conversion.
#[derive(Debug, Clone, Default)]
pub struct ConversionResult {
    /// Generated `.nii` / `.nii.gz` files.
    pub nifti_files: Vec<PathBuf>,
    /// Generated JSON sidecars.
    pub json_files: Vec<PathBuf>,
    pub elapsed_ms: u64,
}

/// Inputs for one dcm2bids run.
#[derive(Debug, Clone)]
pub struct Dcm2BidsRequest<'a> {
    pub participant: &'a str,
    pub config: &'a Path,
    pub dicom_dir: &'a Path,
    pub bids_root: &'a Path,
    pub session: Option<&'a str>,
}

/// Check if a tool is available at the specified path.
pub fn tool_available(program: &str) -> bool {
    std::process::Command::new(program)
        .arg("-h")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// `dcm2niix -z i|n -f %t%p%s -o <dest> <source>`
pub fn dcm2niix_invocation(
    program: &str,
    source: &Path,
    dest: &Path,
    compress: bool,
) -> ToolInvocation {
    let compress_flag = if compress { "i" } else { "n" };
    ToolInvocation {
        program: program.to_string(),
        args: vec![
            "-z".into(),
            compress_flag.into(),
            "-f".into(),
            NIFTI_FILENAME_PATTERN.into(),
            "-o".into(),
            dest.into(),
            source.into(),
        ],
    }
}

/// `dcm2bids -d <dicom> -p <participant> -c <config> -o <root> [-s <session>]`
pub fn dcm2bids_invocation(program: &str, req: &Dcm2BidsRequest<'_>) -> ToolInvocation {
    let mut args: Vec<OsString> = vec![
        "-d".into(),
        req.dicom_dir.into(),
        "-p".into(),
        req.participant.into(),
        "-c".into(),
        req.config.into(),
        "-o".into(),
        req.bids_root.into(),
    ];
    if let Some(session) = req.session {
        args.push("-s".into());
        args.push(session.into());
    }
    ToolInvocation {
        program: program.to_string(),
        args,
    }
}

/// Convert a DICOM directory to NIfTI with dcm2niix.
///
/// dcm2niix exits 0 even when nothing converts (e.g. SR objects), so the produced files
/// are listed rather than trusted from the exit code alone.
pub async fn convert_to_nifti(
    program: &str,
    source: &Path,
    dest: &Path,
    compress: bool,
) -> Result<ConversionResult> {
    let start = std::time::Instant::now();

    tokio::fs::create_dir_all(dest)
        .await
        .map_err(|e| BidsError::io(dest, e))?;

    dcm2niix_invocation(program, source, dest, compress)
        .run()
        .await?;

    let (nifti_files, json_files) = find_output_files(dest).await?;
    Ok(ConversionResult {
        nifti_files,
        json_files,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Lay out one subject under the BIDS root with dcm2bids.
pub async fn run_dcm2bids(program: &str, req: &Dcm2BidsRequest<'_>) -> Result<ToolOutput> {
    if !req.config.exists() {
        return Err(BidsError::io(
            req.config,
            std::io::Error::new(std::io::ErrorKind::NotFound, "dcm2bids config not found"),
        ));
    }
    tokio::fs::create_dir_all(req.bids_root)
        .await
        .map_err(|e| BidsError::io(req.bids_root, e))?;

    dcm2bids_invocation(program, req).run().await
}

/// Find NIfTI and JSON files in a dcm2niix output directory.
async fn find_output_files(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut nifti_files = Vec::new();
    let mut json_files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| BidsError::io(dir, e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BidsError::io(dir, e))?
    {
        let path = entry.path();
        if is_nifti(&path) {
            nifti_files.push(path);
        } else if path.extension().map(|e| e == "json").unwrap_or(false) {
            json_files.push(path);
        }
    }

    nifti_files.sort();
    json_files.sort();
    Ok((nifti_files, json_files))
}

pub fn is_nifti(path: &Path) -> bool {
    let filename = path.file_name().unwrap_or_default().to_string_lossy();
    filename.ends_with(".nii.gz") || filename.ends_with(".nii")
}
