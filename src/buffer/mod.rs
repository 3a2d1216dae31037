//! Durable local backlog of fixes the sink has not acknowledged.
//!
//! # Atomicity
//!
//! The buffer is a single CSV file. Every mutation writes the complete new
//! contents to a temporary file in the same directory, flushes and fsyncs it,
//! and renames it over the canonical path. A reader therefore sees either the
//! old file or the new one, never a torn write. A crash before the rename
//! leaves at most an orphaned temporary file, which is never read and is
//! swept by [`DurableBuffer::remove_stale_stages`] at startup.
//!
//! The buffer is a single-writer resource: the reconciler owns it and all
//! operations go through `&mut self`.

mod entry;

pub use entry::BufferEntry;

use snafu::prelude::*;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{BufferEncodeSnafu, BufferError, BufferReadSnafu, BufferWriteSnafu};
use crate::fix::Fix;

const STAGE_PREFIX: &str = ".gnss-buffer-";
const STAGE_SUFFIX: &str = ".tmp";

/// Crash-safe CSV backlog.
#[derive(Debug)]
pub struct DurableBuffer {
    path: PathBuf,
}

impl DurableBuffer {
    /// Create a handle for the buffer at `path`. The file need not exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one fix, keeping every entry already stored.
    pub fn append(&mut self, fix: &Fix) -> Result<(), BufferError> {
        let mut entries = self.read_all()?;
        entries.push(BufferEntry::from(fix));
        self.replace_with(&entries)
    }

    /// Every stored entry, in insertion order. Empty if the file is absent.
    pub fn read_all(&self) -> Result<Vec<BufferEntry>, BufferError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e)
                    .map_err(csv::Error::from)
                    .context(BufferReadSnafu {
                        path: self.display_path(),
                    });
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(file);

        // Invalid UTF-8 is replaced, not rejected, so such rows surface as
        // poison entries instead of making the whole backlog unreadable.
        reader
            .byte_records()
            .map(|record| {
                record.map(BufferEntry::from).context(BufferReadSnafu {
                    path: self.display_path(),
                })
            })
            .collect()
    }

    /// Atomically overwrite the store with exactly `entries`.
    pub fn replace_with(&mut self, entries: &[BufferEntry]) -> Result<(), BufferError> {
        let staged = self.stage(entries)?;
        self.publish(staged)?;
        debug!("Buffer {} now holds {} entries", self.path.display(), entries.len());
        Ok(())
    }

    /// True if no entries are stored.
    pub fn is_empty(&self) -> Result<bool, BufferError> {
        Ok(self.len()? == 0)
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize, BufferError> {
        Ok(self.read_all()?.len())
    }

    /// Delete staging files left next to the buffer by a crash before the
    /// rename. Only call this while no write is in flight.
    pub fn remove_stale_stages(&self) -> Result<usize, BufferError> {
        let dir = self.directory();
        let context = || BufferWriteSnafu {
            path: self.display_path(),
        };

        let mut removed = 0;
        for dirent in std::fs::read_dir(&dir).with_context(|_| context())? {
            let dirent = dirent.with_context(|_| context())?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !(name.starts_with(STAGE_PREFIX) && name.ends_with(STAGE_SUFFIX)) {
                continue;
            }
            match std::fs::remove_file(dirent.path()) {
                Ok(()) => {
                    debug!("Removed stale staging file {}", dirent.path().display());
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|_| context()),
            }
        }
        Ok(removed)
    }

    /// Write `entries` to a synced temporary file next to the buffer.
    fn stage(&self, entries: &[BufferEntry]) -> Result<NamedTempFile, BufferError> {
        let dir = self.directory();
        let tmp = tempfile::Builder::new()
            .prefix(STAGE_PREFIX)
            .suffix(STAGE_SUFFIX)
            .tempfile_in(&dir)
            .context(BufferWriteSnafu {
                path: self.display_path(),
            })?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(tmp);
        for entry in entries {
            writer
                .write_record(entry.fields())
                .context(BufferEncodeSnafu {
                    path: self.display_path(),
                })?;
        }

        let tmp = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .context(BufferWriteSnafu {
                path: self.display_path(),
            })?;
        tmp.as_file().sync_all().context(BufferWriteSnafu {
            path: self.display_path(),
        })?;
        Ok(tmp)
    }

    /// Rename a staged file over the canonical path.
    fn publish(&self, staged: NamedTempFile) -> Result<(), BufferError> {
        staged
            .persist(&self.path)
            .map_err(|e| e.error)
            .context(BufferWriteSnafu {
                path: self.display_path(),
            })?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> Result<(), BufferError> {
        File::open(self.directory())
            .and_then(|dir| dir.sync_all())
            .context(BufferWriteSnafu {
                path: self.display_path(),
            })
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> Result<(), BufferError> {
        Ok(())
    }

    fn directory(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn fix(second: u32) -> Fix {
        Fix {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, second).unwrap(),
            latitude: Some(52.5),
            longitude: Some(13.4),
            altitude: None,
            speed: Some(0.0),
        }
    }

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "tmp"))
            .collect()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let buffer = DurableBuffer::new(dir.path().join("buffer.csv"));

        assert!(buffer.read_all().unwrap().is_empty());
        assert!(buffer.is_empty().unwrap());
    }

    #[test]
    fn test_append_preserves_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut buffer = DurableBuffer::new(dir.path().join("buffer.csv"));

        buffer.append(&fix(1)).unwrap();
        buffer.append(&fix(2)).unwrap();
        buffer.append(&fix(3)).unwrap();

        let fixes: Vec<Fix> = buffer
            .read_all()
            .unwrap()
            .iter()
            .map(|e| e.to_fix().unwrap())
            .collect();
        assert_eq!(fixes, vec![fix(1), fix(2), fix(3)]);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_file_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.csv");
        let mut buffer = DurableBuffer::new(&path);

        buffer.append(&fix(5)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "2024-01-01T00:00:05Z,52.5,13.4,,0\n");
    }

    #[test]
    fn test_replace_with_keeps_exactly_given_entries() {
        let dir = TempDir::new().unwrap();
        let mut buffer = DurableBuffer::new(dir.path().join("buffer.csv"));
        for s in 1..=4 {
            buffer.append(&fix(s)).unwrap();
        }

        let entries = buffer.read_all().unwrap();
        buffer.replace_with(&[entries[1].clone()]).unwrap();

        let remaining = buffer.read_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].to_fix().unwrap(), fix(2));

        buffer.replace_with(&[]).unwrap();
        assert!(buffer.is_empty().unwrap());
    }

    #[test]
    fn test_poison_rows_survive_read_and_replace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.csv");
        std::fs::write(
            &path,
            "2024-01-01T00:00:01Z,1,2,3,4\nnot-a-time,x\n2024-01-01T00:00:02Z,1,2,3,4\n",
        )
        .unwrap();
        let mut buffer = DurableBuffer::new(&path);

        let entries = buffer.read_all().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[1].to_fix().is_err());

        buffer.replace_with(&entries[1..2]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "not-a-time,x\n");
    }

    #[test]
    fn test_invalid_utf8_row_is_a_poison_entry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.csv");
        std::fs::write(&path, b"2024-01-01T00:00:01Z,1,2,3,4\n\xff\xfe,1,2,3,4\n").unwrap();
        let buffer = DurableBuffer::new(&path);

        let entries = buffer.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].to_fix().is_ok());
        assert!(entries[1].to_fix().is_err());
    }

    #[test]
    fn test_abandoned_stage_leaves_canonical_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.csv");
        let mut buffer = DurableBuffer::new(&path);
        buffer.append(&fix(1)).unwrap();
        let before = std::fs::read(&path).unwrap();

        // Stage a larger write, then truncate it halfway as a crash would.
        let mut entries = buffer.read_all().unwrap();
        entries.push(BufferEntry::from(&fix(2)));
        let staged = buffer.stage(&entries).unwrap();
        let staged_len = staged.as_file().metadata().unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(staged.path())
            .unwrap()
            .set_len(staged_len / 2)
            .unwrap();
        let (_, leftover) = staged.keep().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
        let entries = buffer.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].to_fix().unwrap(), fix(1));

        // The orphan does not interfere with later writes.
        buffer.append(&fix(3)).unwrap();
        assert_eq!(buffer.len().unwrap(), 2);
        assert!(leftover.exists());
    }

    #[test]
    fn test_stale_stages_are_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("buffer.csv");
        let mut buffer = DurableBuffer::new(&path);
        buffer.append(&fix(1)).unwrap();

        for name in [".gnss-buffer-a1.tmp", ".gnss-buffer-b2.tmp"] {
            std::fs::write(dir.path().join(name), "2024-01-01T00:00:02Z,1").unwrap();
        }
        let unrelated = dir.path().join("notes.tmp");
        std::fs::write(&unrelated, "keep").unwrap();

        assert_eq!(buffer.remove_stale_stages().unwrap(), 2);
        assert_eq!(temp_files(dir.path()), vec![unrelated.clone()]);
        assert_eq!(buffer.read_all().unwrap().len(), 1);
        assert_eq!(buffer.remove_stale_stages().unwrap(), 0);
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut buffer = DurableBuffer::new(dir.path().join("missing-dir").join("buffer.csv"));

        let err = buffer.append(&fix(1)).unwrap_err();
        assert!(matches!(err, BufferError::BufferWrite { .. }));
    }

    #[test]
    fn test_relative_path_uses_current_directory() {
        let buffer = DurableBuffer::new("buffer.csv");
        assert_eq!(buffer.directory(), PathBuf::from("."));
    }
}
