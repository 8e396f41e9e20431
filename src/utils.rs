//! File and path helpers used by the content writer

use std::path::{Path, PathBuf};

/// Maximum number of numbered alternatives tried for an existing file
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Resolve the output path for a new file
///
/// With `overwrite` the path is returned as-is. Otherwise an existing file
/// gets a numbered sibling: `movie.mkv` becomes `movie (1).mkv`, then
/// `movie (2).mkv` and so on.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use usenet_engine::utils::unique_path;
///
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("movie.mkv");
/// assert_eq!(unique_path(&path, false), Some(path.clone()));
///
/// std::fs::write(&path, b"x").unwrap();
/// assert_eq!(unique_path(&path, false), Some(dir.path().join("movie (1).mkv")));
/// assert_eq!(unique_path(&path, true), Some(path));
/// ```
#[must_use]
pub fn unique_path(path: &Path, overwrite: bool) -> Option<PathBuf> {
    if overwrite || !path.exists() {
        return Some(path.to_path_buf());
    }
    let stem = path.file_stem()?.to_string_lossy().into_owned();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    (1..=MAX_RENAME_ATTEMPTS)
        .map(|i| match &extension {
            Some(ext) => parent.join(format!("{stem} ({i}).{ext}")),
            None => parent.join(format!("{stem} ({i})")),
        })
        .find(|candidate| !candidate.exists())
}

/// Make a file name from an untrusted description safe to join onto a
/// directory
///
/// Path separators and control characters are replaced, and leading dots are
/// stripped so the result can never escape the target directory.
///
/// # Examples
///
/// ```
/// use usenet_engine::utils::sanitize_filename;
///
/// assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
/// assert_eq!(sanitize_filename("movie: part 1?.mkv"), "movie_ part 1_.mkv");
/// assert_eq!(sanitize_filename(""), "unnamed");
/// ```
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Write `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(unix)]
pub(crate) fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Write `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(windows)]
pub(crate) fn write_all_at(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

/// Write `buf` to `file` at the given byte `offset`, equivalent to Unix `pwrite`.
#[cfg(not(any(unix, windows)))]
pub(crate) fn write_all_at(_file: &std::fs::File, _buf: &[u8], _offset: u64) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "positional writes not supported on this platform",
    ))
}
