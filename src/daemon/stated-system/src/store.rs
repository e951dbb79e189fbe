//! State store
//!
//! Writes records with one positioned write at offset 0 and reads them back
//! without locks. A reader may race a writer that is rewriting the file, so a
//! read that sees a length prefix reaching past the bytes it got starts over,
//! up to a configurable number of attempts.

use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Range;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;

use metrics::counter;
use stated_core::record::{self, RecordView, LEN_FIELD_SIZE};
use stated_core::{Error, Result};
use tracing::{debug, warn};

/// Open (creating or truncating) the backing file of a binding
pub fn open_for_publish(path: &Path, mode: u32) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| {
            warn!("open(2) of {} failed: {}", path.display(), e);
            Error::io(path, e)
        })
}

/// Open the backing file of a subscription, creating it empty if absent
pub fn open_for_subscribe(path: &Path, mode: u32) -> Result<File> {
    // std refuses create() without write access, so ask for O_CREAT directly
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CREAT | libc::O_CLOEXEC)
        .mode(mode)
        .open(path)
        .map_err(|e| {
            warn!("open(2) of {} failed: {}", path.display(), e);
            Error::io(path, e)
        })
}

/// Replace the record in `file` with one holding `payload`
pub fn write_record(file: &File, path: &Path, payload: &[u8]) -> Result<()> {
    let buf = record::encode(payload);

    let written = loop {
        match file.write_at(&buf, 0) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("pwrite(2) to {} failed: {}", path.display(), e);
                return Err(Error::io(path, e));
            }
        }
    };

    if written < buf.len() {
        warn!("short write to {}", path.display());
        return Err(Error::ShortWrite {
            expected: buf.len(),
            written,
        });
    }
    Ok(())
}

/// Read the current record of `file` into `buf`
///
/// Returns the range of `buf` holding the payload. `buf` is grown as needed
/// and keeps its allocation between calls.
pub fn read_record(
    file: &File,
    path: &Path,
    buf: &mut Vec<u8>,
    retry_limit: u32,
) -> Result<Range<usize>> {
    for attempt in 1..=retry_limit {
        let size = file.metadata().map_err(|e| Error::io(path, e))?.len();
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size < usize::MAX)
            .ok_or_else(|| {
                Error::io(
                    path,
                    io::Error::new(io::ErrorKind::InvalidData, "state file too large"),
                )
            })?;

        if buf.len() <= size {
            buf.resize(size + 1, 0);
        }

        let nread = read_at(file, path, &mut buf[..size])?;
        match record::decode(&buf[..nread]) {
            RecordView::Complete(payload) => {
                return Ok(LEN_FIELD_SIZE..LEN_FIELD_SIZE + payload.len());
            }
            RecordView::Incomplete { declared } => {
                debug!(
                    "state file {} changed while reading ({} of {} bytes, attempt {}); will re-read it",
                    path.display(),
                    nread,
                    declared,
                    attempt
                );
                counter!("stated_read_retries_total").increment(1);
            }
            RecordView::TooShort => {
                warn!("state file {} is invalid; too short", path.display());
                return Err(Error::CorruptRecord {
                    path: path.to_path_buf(),
                    len: nread,
                });
            }
        }
    }

    warn!(
        "giving up on {} after {} read attempts",
        path.display(),
        retry_limit
    );
    Err(Error::Busy {
        path: path.to_path_buf(),
        attempts: retry_limit,
    })
}

fn read_at(file: &File, path: &Path, buf: &mut [u8]) -> Result<usize> {
    loop {
        match file.read_at(buf, 0) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("pread(2) of {} failed: {}", path.display(), e);
                return Err(Error::io(path, e));
            }
        }
    }
}

/// Open `path` and publish `payload` to it without keeping a binding
pub fn write_record_to_path(path: &Path, payload: &[u8], mode: u32) -> Result<()> {
    let file = open_for_publish(path, mode)?;
    write_record(&file, path, payload)
}

/// Open `path` and read its current payload
pub fn read_record_from_path(path: &Path, retry_limit: u32) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut buf = Vec::new();
    let range = read_record(&file, path, &mut buf, retry_limit)?;
    Ok(buf[range].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");

        write_record_to_path(&path, b"I feel fine", 0o644).unwrap();
        assert_eq!(read_record_from_path(&path, 4).unwrap(), b"I feel fine");

        // exact file contents
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), LEN_FIELD_SIZE + 11 + 1);
        assert_eq!(*raw.last().unwrap(), 0);
    }

    #[test]
    fn test_overwrite_with_shorter_value() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");
        let file = open_for_publish(&path, 0o644).unwrap();

        write_record(&file, &path, b"a rather long first value").unwrap();
        write_record(&file, &path, b"tiny").unwrap();

        assert_eq!(read_record_from_path(&path, 4).unwrap(), b"tiny");
    }

    #[test]
    fn test_binary_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let payload: Vec<u8> = (0..=255u8).chain([0, 0, 0]).collect();

        write_record_to_path(&path, &payload, 0o644).unwrap();
        assert_eq!(read_record_from_path(&path, 4).unwrap(), payload);
    }

    #[test]
    fn test_buffer_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status");
        let file = open_for_publish(&path, 0o644).unwrap();
        let reader = File::open(&path).unwrap();
        let mut buf = Vec::new();

        write_record(&file, &path, &[7u8; 100]).unwrap();
        let range = read_record(&reader, &path, &mut buf, 4).unwrap();
        assert_eq!(range.len(), 100);
        let capacity = buf.len();

        write_record(&file, &path, b"xy").unwrap();
        let range = read_record(&reader, &path, &mut buf, 4).unwrap();
        assert_eq!(&buf[range], b"xy");
        assert_eq!(buf.len(), capacity);
    }

    #[test]
    fn test_empty_file_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        let file = open_for_subscribe(&path, 0o644).unwrap();
        let mut buf = Vec::new();

        let err = read_record(&file, &path, &mut buf, 4).unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { len: 0, .. }));
    }

    #[test]
    fn test_inconsistent_length_is_busy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hostile");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&1000u64.to_ne_bytes()).unwrap();
        file.write_all(b"not nearly enough\0").unwrap();

        let err = read_record_from_path(&path, 3).unwrap_err();
        assert!(matches!(err, Error::Busy { attempts: 3, .. }));
    }

    #[test]
    fn test_subscribe_open_creates_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later");

        let _file = open_for_subscribe(&path, 0o600).unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("status");

        let err = open_for_publish(&path, 0o644).unwrap_err();
        assert!(matches!(err, Error::Io { path: Some(_), .. }));
    }
}
