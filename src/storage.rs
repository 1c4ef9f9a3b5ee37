use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use rkyv::Deserialize;
use tracing::{error, warn};

use crate::model::LogEntry;

// A single frame never legitimately exceeds this; anything larger is damage.
const MAX_FRAME_LEN: usize = 64 * 1024;

/// Append-only log file. Frames are `[Length (4b LE)][rkyv bytes]`.
#[derive(Debug)]
pub struct Segment {
    pub file_path: PathBuf,
    file: File,
    current_offset: u64,
    strict: bool,
    // Set when a failed append could not be rolled back. The file may hold a
    // partial frame, so nothing more is written until it is reopened.
    broken: bool,
}

impl Segment {
    /// Opens (or creates) the segment. With `strict` set every append is
    /// fsynced before it returns.
    pub fn new(path: &Path, strict: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let current_offset = file.metadata()?.len();

        Ok(Self {
            file_path: path.to_path_buf(),
            file,
            current_offset,
            strict,
            broken: false,
        })
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Bytes of committed frames.
    pub fn len(&self) -> u64 {
        self.current_offset
    }

    pub fn is_empty(&self) -> bool {
        self.current_offset == 0
    }

    pub fn append(&mut self, entry: &LogEntry) -> io::Result<u64> {
        let strict = self.strict;
        self.append_with(entry, |file, frame| {
            file.write_all(frame)?;
            if strict {
                file.sync_data()?;
            }
            Ok(())
        })
    }

    /// Appends one frame through `write`. If `write` fails the file is cut
    /// back to the last whole frame, so a half-written or unsynced frame can
    /// never sit in front of later appends.
    fn append_with<W>(&mut self, entry: &LogEntry, write: W) -> io::Result<u64>
    where
        W: FnOnce(&mut File, &[u8]) -> io::Result<()>,
    {
        if self.broken {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} needs a reopen after a failed rollback", self.file_path.display()),
            ));
        }

        let bytes = rkyv::to_bytes::<_, 256>(entry)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        // One write per frame keeps a crash from interleaving length and body.
        let mut frame = Vec::with_capacity(4 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        frame.extend_from_slice(&bytes);

        let start = self.current_offset;
        if let Err(e) = write(&mut self.file, &frame) {
            if let Err(rollback) = self.file.set_len(start) {
                self.broken = true;
                error!(
                    path = %self.file_path.display(),
                    offset = start,
                    error = %rollback,
                    "could not roll back failed append"
                );
                return Err(io::Error::new(
                    rollback.kind(),
                    format!("append failed ({}) and rollback failed ({})", e, rollback),
                ));
            }
            warn!(path = %self.file_path.display(), offset = start, error = %e, "append rolled back");
            return Err(e);
        }

        self.current_offset += frame.len() as u64;
        Ok(start)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Reads every frame from the start of the file.
    ///
    /// A frame cut short by a crash can only be the last one; it is dropped
    /// and the file truncated back to the last whole frame. A frame that is
    /// whole but does not decode is reported as `InvalidData`.
    pub fn replay(&mut self) -> io::Result<Vec<LogEntry>> {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(File::open(&self.file_path)?);
        let mut entries = Vec::new();
        let mut offset = 0u64;

        while offset < file_len {
            let remaining = file_len - offset;
            if remaining < 4 {
                break;
            }

            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;

            if len > MAX_FRAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame at offset {} claims {} bytes", offset, len),
                ));
            }
            if remaining - 4 < len as u64 {
                break;
            }

            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            entries.push(decode(&bytes).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("frame at offset {}: {}", offset, e),
                )
            })?);

            offset += 4 + len as u64;
        }

        if offset < file_len {
            warn!(
                path = %self.file_path.display(),
                torn_bytes = file_len - offset,
                "truncating torn tail of log"
            );
            self.file.set_len(offset)?;
            self.file.sync_all()?;
        }
        self.current_offset = offset;

        Ok(entries)
    }
}

fn decode(bytes: &[u8]) -> Result<LogEntry, String> {
    // Frames carry no alignment guarantee inside the file.
    let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);

    let archived = rkyv::check_archived_root::<LogEntry>(&aligned).map_err(|e| format!("{:?}", e))?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|e| format!("{:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<LogEntry> {
        vec![
            LogEntry::Counter { value: 1 },
            LogEntry::Dedup { weight: 70, height: 170, id: 1 },
            LogEntry::Record { id: 1, value: 70.0 / 28900.0 },
        ]
    }

    #[test]
    fn replays_appended_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let mut segment = Segment::new(&path, true).unwrap();
        for entry in sample_entries() {
            segment.append(&entry).unwrap();
        }
        let written = segment.len();
        drop(segment);

        let mut reopened = Segment::new(&path, true).unwrap();
        assert_eq!(reopened.len(), written);
        assert_eq!(reopened.replay().unwrap(), sample_entries());
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let mut segment = Segment::new(&path, false).unwrap();
        for entry in sample_entries() {
            segment.append(&entry).unwrap();
        }
        let good_len = segment.len();
        drop(segment);

        // A length prefix promising more bytes than ever made it to disk.
        let mut raw = OpenOptions::new().append(true).open(&path).unwrap();
        raw.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(raw);

        let mut segment = Segment::new(&path, false).unwrap();
        assert_eq!(segment.replay().unwrap(), sample_entries());
        assert_eq!(segment.len(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        segment.append(&LogEntry::Counter { value: 2 }).unwrap();
        let mut again = Segment::new(&path, false).unwrap();
        assert_eq!(again.replay().unwrap().len(), 4);
    }

    #[test]
    fn garbage_frame_mid_log_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let mut raw = File::create(&path).unwrap();
        raw.write_all(&[3, 0, 0, 0, 0xFF, 0xFF, 0xFF]).unwrap();
        drop(raw);

        let mut segment = Segment::new(&path, false).unwrap();
        segment.append(&LogEntry::Counter { value: 1 }).unwrap();

        let err = segment.replay().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn empty_file_replays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(&dir.path().join("log.dat"), false).unwrap();
        assert!(segment.is_empty());
        assert!(segment.replay().unwrap().is_empty());
    }

    #[test]
    fn failed_append_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let mut segment = Segment::new(&path, false).unwrap();
        segment.append(&LogEntry::Counter { value: 1 }).unwrap();
        let good_len = segment.len();

        // Half the frame lands, then the disk gives up.
        let err = segment
            .append_with(&LogEntry::Record { id: 1, value: 0.5 }, |file, frame| {
                file.write_all(&frame[..frame.len() / 2])?;
                Err(io::Error::new(io::ErrorKind::Other, "no space left"))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "no space left");
        assert_eq!(segment.len(), good_len);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        segment.append(&LogEntry::Counter { value: 2 }).unwrap();
        drop(segment);

        let mut reopened = Segment::new(&path, false).unwrap();
        assert_eq!(
            reopened.replay().unwrap(),
            vec![LogEntry::Counter { value: 1 }, LogEntry::Counter { value: 2 }]
        );
    }

    #[test]
    fn unsynced_frame_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.dat");

        let mut segment = Segment::new(&path, true).unwrap();
        segment
            .append_with(&LogEntry::Counter { value: 1 }, |file, frame| {
                file.write_all(frame)?;
                Err(io::Error::new(io::ErrorKind::Other, "fsync failed"))
            })
            .unwrap_err();

        assert!(segment.is_empty());
        let mut reopened = Segment::new(&path, true).unwrap();
        assert!(reopened.replay().unwrap().is_empty());
    }
}
