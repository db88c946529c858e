//! External metadata gateway.
//!
//! All on-disk metadata IO is delegated to the `exiftool` binary. The engine
//! consumes it only through the [`Gateway`] trait: one read primitive, one
//! write primitive, both blocking. Reads use `-j` JSON output; writes may
//! partially fail per tag without a nonzero exit, which is why the cache
//! always re-reads and diffs after writing instead of trusting the result.

use std::path::Path;
use std::process::Command;

use serde_json::Value;

use crate::types::TagMap;

/// Pseudo-tag exiftool uses for free-text diagnostics in read output.
pub const WARNING_TAG: &str = "ExifTool:Warning";
/// Pseudo-tag carrying the resolved source path in read output.
pub const SOURCE_FILE_TAG: &str = "SourceFile";

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The process could not be launched at all.
    #[error("failed to run {program}: {message}")]
    Spawn { program: String, message: String },
    /// The process ran and reported failure; carries its stderr text.
    #[error("{0}")]
    Execution(String),
    /// The process produced output the engine cannot decode.
    #[error("unreadable exiftool output: {0}")]
    Malformed(String),
}

pub trait Gateway: Send + Sync {
    /// Read tags for one file. `tag_names = None` means all available tags.
    /// The returned record is keyed by exiftool's own qualified tag names
    /// and includes the `SourceFile` pseudo-tag, plus possibly
    /// `ExifTool:Warning`.
    fn read_tags(
        &self,
        path: &Path,
        tag_names: Option<&[String]>,
        extra_args: &[String],
    ) -> Result<TagMap, GatewayError>;

    /// Write tags to one file. An empty value requests deletion of the tag.
    /// Returns exiftool's diagnostic text on success.
    fn write_tags(
        &self,
        path: &Path,
        tags: &[(String, String)],
        extra_args: &[String],
    ) -> Result<String, GatewayError>;
}

/// The real exiftool subprocess.
pub struct ExifTool {
    program: String,
}

impl ExifTool {
    pub fn new(program: String) -> Self {
        Self { program }
    }

    fn run(&self, args: &[String]) -> Result<std::process::Output, GatewayError> {
        tracing::debug!(program = %self.program, ?args, "invoking exiftool");
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| GatewayError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })
    }
}

impl Gateway for ExifTool {
    fn read_tags(
        &self,
        path: &Path,
        tag_names: Option<&[String]>,
        extra_args: &[String],
    ) -> Result<TagMap, GatewayError> {
        let args = read_args(path, tag_names, extra_args);
        let output = self.run(&args)?;

        // exiftool exits nonzero on unreadable files but may still emit a
        // record for partially-readable ones; only an empty stdout is fatal.
        if output.stdout.is_empty() {
            return Err(GatewayError::Execution(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        decode_read_output(&output.stdout)
    }

    fn write_tags(
        &self,
        path: &Path,
        tags: &[(String, String)],
        extra_args: &[String],
    ) -> Result<String, GatewayError> {
        let args = write_args(path, tags, extra_args);
        let output = self.run(&args)?;

        if !output.status.success() {
            return Err(GatewayError::Execution(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `exiftool -j [extra] [-TAG...] path`
fn read_args(path: &Path, tag_names: Option<&[String]>, extra_args: &[String]) -> Vec<String> {
    let mut args = vec!["-j".to_string()];
    args.extend(extra_args.iter().cloned());
    if let Some(names) = tag_names {
        args.extend(names.iter().map(|t| format!("-{t}")));
    }
    args.push(path.display().to_string());
    args
}

/// `exiftool [extra] -TAG=value... path`; `-TAG=` deletes.
fn write_args(path: &Path, tags: &[(String, String)], extra_args: &[String]) -> Vec<String> {
    let mut args: Vec<String> = extra_args.to_vec();
    args.extend(tags.iter().map(|(tag, value)| format!("-{tag}={value}")));
    args.push(path.display().to_string());
    args
}

/// Decode `-j` output: an array with one record per file; we read one file
/// per call, so the first record wins.
fn decode_read_output(stdout: &[u8]) -> Result<TagMap, GatewayError> {
    let parsed: Value =
        serde_json::from_slice(stdout).map_err(|e| GatewayError::Malformed(e.to_string()))?;
    let record = parsed
        .as_array()
        .and_then(|a| a.first())
        .and_then(Value::as_object)
        .ok_or_else(|| GatewayError::Malformed("expected a JSON array of records".to_string()))?;
    Ok(record.clone())
}
