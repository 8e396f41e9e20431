//! Decode-and-write pipeline for one task's article bodies
//!
//! Bodies carrying yEnc data are decoded with `nntp-rs` and written at the
//! offset given by their part header, so parts may arrive in any order. Bodies
//! without yEnc data are treated as plain text and appended to `<name>.txt`,
//! unless text content is discarded.
//!
//! A writer is only ever used by jobs that share one worker thread, so its
//! methods take `&mut self` and the engine wraps it in an uncontended mutex.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::JobError;
use crate::utils::{sanitize_filename, unique_path, write_all_at};

/// Marker that starts a yEnc encoded block
const YENC_BEGIN: &[u8] = b"=ybegin ";

/// Output policy applied when files are created
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Replace existing files instead of choosing a numbered name
    pub overwrite: bool,
    /// Drop text bodies instead of writing them
    pub discard_text: bool,
    /// Reopen files left by an earlier run instead of starting new ones
    pub resume: bool,
}

/// What a body turned out to contain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyKind {
    /// Binary data written to the output file
    Binary,
    /// Text appended to the text file
    Text,
    /// Text dropped because of [`WriteOptions::discard_text`]
    Discarded,
    /// yEnc data that failed to decode; nothing was written
    Damaged,
}

/// Result of processing one body
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BodyOutcome {
    /// Content classification
    pub kind: BodyKind,
    /// Bytes written to disk
    pub written: u64,
}

#[derive(Debug)]
struct OutputFile {
    path: PathBuf,
    file: File,
    // text files are appended sequentially
    cursor: u64,
    preallocated: bool,
}

/// Output pipeline of one task
#[derive(Debug)]
pub struct ContentWriter {
    dir: PathBuf,
    name: String,
    options: WriteOptions,
    binary: Option<OutputFile>,
    text: Option<OutputFile>,
    written: u64,
}

impl ContentWriter {
    /// Create a writer producing `name` inside `dir`; nothing touches the disk
    /// until the first body arrives
    pub fn new(dir: impl Into<PathBuf>, name: &str, options: WriteOptions) -> Self {
        Self {
            dir: dir.into(),
            name: sanitize_filename(name),
            options,
            binary: None,
            text: None,
            written: 0,
        }
    }

    /// Replace the output policy; applies to files not yet created
    ///
    /// `options.resume` is ignored: a writer restored from a session keeps
    /// reopening its partial files.
    pub fn set_options(&mut self, options: WriteOptions) {
        self.options = WriteOptions {
            resume: self.options.resume,
            ..options
        };
    }

    /// Total bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Paths of the files created so far
    pub fn paths(&self) -> Vec<PathBuf> {
        self.binary
            .iter()
            .chain(self.text.iter())
            .map(|f| f.path.clone())
            .collect()
    }

    /// Decode `body` and write it out
    pub fn write_body(&mut self, body: &[u8]) -> Result<BodyOutcome, JobError> {
        if !contains(body, YENC_BEGIN) {
            return self.write_text(body);
        }

        let decoded = match nntp_rs::yenc_decode(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(file = %self.name, error = %e, "yEnc decode failed");
                return Ok(BodyOutcome {
                    kind: BodyKind::Damaged,
                    written: 0,
                });
            }
        };

        // yEnc part offsets are 1-based
        let offset = decoded
            .part
            .as_ref()
            .map(|p| p.begin.saturating_sub(1))
            .unwrap_or(0);
        let total_size = decoded.header.size;

        let output = self.open_binary()?;
        if total_size > 0 && !output.preallocated {
            output.file.set_len(total_size).map_err(|e| JobError::Write {
                path: output.path.clone(),
                message: format!("failed to pre-allocate {total_size} bytes: {e}"),
            })?;
            output.preallocated = true;
        }
        write_all_at(&output.file, &decoded.data, offset).map_err(|e| JobError::Write {
            path: output.path.clone(),
            message: format!("failed to write at offset {offset}: {e}"),
        })?;

        let written = decoded.data.len() as u64;
        self.written += written;
        Ok(BodyOutcome {
            kind: BodyKind::Binary,
            written,
        })
    }

    fn write_text(&mut self, body: &[u8]) -> Result<BodyOutcome, JobError> {
        if self.options.discard_text {
            return Ok(BodyOutcome {
                kind: BodyKind::Discarded,
                written: 0,
            });
        }
        let output = self.open_text()?;
        write_all_at(&output.file, body, output.cursor).map_err(|e| JobError::Write {
            path: output.path.clone(),
            message: e.to_string(),
        })?;
        output.cursor += body.len() as u64;

        let written = body.len() as u64;
        self.written += written;
        Ok(BodyOutcome {
            kind: BodyKind::Text,
            written,
        })
    }

    fn open_binary(&mut self) -> Result<&mut OutputFile, JobError> {
        if self.binary.is_none() {
            let target = self.dir.join(&self.name);
            self.binary = Some(create_output(&self.dir, &target, self.options)?);
        }
        self.binary.as_mut().ok_or_else(|| JobError::Create {
            path: self.dir.join(&self.name),
            message: "output file missing".to_string(),
        })
    }

    fn open_text(&mut self) -> Result<&mut OutputFile, JobError> {
        if self.text.is_none() {
            let target = self.dir.join(format!("{}.txt", self.name));
            self.text = Some(create_output(&self.dir, &target, self.options)?);
        }
        self.text.as_mut().ok_or_else(|| JobError::Create {
            path: self.dir.join(format!("{}.txt", self.name)),
            message: "output file missing".to_string(),
        })
    }

    /// Push written data to the disk
    pub fn flush(&mut self) -> Result<(), JobError> {
        for output in self.binary.iter_mut().chain(self.text.iter_mut()) {
            output
                .file
                .flush()
                .and_then(|_| output.file.sync_data())
                .map_err(|e| JobError::Write {
                    path: output.path.clone(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Flush and close every output file, returning their paths
    pub fn finalize(&mut self) -> Result<Vec<PathBuf>, JobError> {
        self.flush()?;
        let paths = self.paths();
        self.binary = None;
        self.text = None;
        tracing::debug!(file = %self.name, bytes = self.written, "output finalized");
        Ok(paths)
    }

    /// Close and delete everything written so far
    pub fn cancel(&mut self) {
        for output in self.binary.take().into_iter().chain(self.text.take()) {
            let OutputFile { path, file, .. } = output;
            drop(file);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove partial output");
            }
        }
        self.written = 0;
    }
}

fn create_output(dir: &Path, target: &Path, options: WriteOptions) -> Result<OutputFile, JobError> {
    std::fs::create_dir_all(dir).map_err(|e| JobError::Create {
        path: dir.to_path_buf(),
        message: e.to_string(),
    })?;
    if options.resume && target.is_file() {
        return reopen_output(target);
    }
    let path = unique_path(target, options.overwrite).ok_or_else(|| JobError::Create {
        path: target.to_path_buf(),
        message: "no free file name".to_string(),
    })?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| JobError::Create {
            path: path.clone(),
            message: e.to_string(),
        })?;
    tracing::debug!(path = %path.display(), "created output file");
    Ok(OutputFile {
        path,
        file,
        cursor: 0,
        preallocated: false,
    })
}

fn reopen_output(path: &Path) -> Result<OutputFile, JobError> {
    let create_error = |e: std::io::Error| JobError::Create {
        path: path.to_path_buf(),
        message: e.to_string(),
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(create_error)?;
    let len = file.metadata().map_err(create_error)?.len();
    tracing::debug!(path = %path.display(), len, "resumed output file");
    Ok(OutputFile {
        path: path.to_path_buf(),
        file,
        cursor: len,
        preallocated: len > 0,
    })
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
