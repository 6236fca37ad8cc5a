//! Write-ahead log for the durable engine
//!
//! Write ordering for every mutation:
//! 1. Encode the record (CRC32C over the payload)
//! 2. Append it to the current segment
//! 3. `durable_sync` when the options ask for per-write durability
//! 4. Only then does the engine update its RAM table
//!
//! Segments are named `wal-{seq:016x}.log` and replayed in sequence order.
//! A checkpoint rewrites the live key set into a fresh segment and removes
//! the older ones, which keeps replay time proportional to the data, not to
//! the write history.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::WalOptions;
use crate::error::{StoreError, StoreResult};
use crate::format::{decode_record, encode_record, Operation, Record, RecordHeader, HEADER_SIZE, MAGIC};
use crate::platform_durability::{durable_sync, sync_directory};

const SEGMENT_PREFIX: &str = "wal-";
const SEGMENT_SUFFIX: &str = ".log";

fn segment_name(sequence: u64) -> String {
    format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX)
}

fn parse_segment_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

fn io_error(path: &Path, context: &str, err: std::io::Error) -> StoreError {
    StoreError::Io {
        path: Some(path.to_path_buf()),
        kind: err.kind(),
        message: format!("{}: {}", context, err),
    }
}

/// Sorted list of `(sequence, path)` for every segment in `dir`.
fn list_segments(dir: &Path) -> StoreResult<Vec<(u64, PathBuf)>> {
    let entries = fs::read_dir(dir).map_err(|e| io_error(dir, "failed to read WAL directory", e))?;
    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_error(dir, "failed to read directory entry", e))?;
        if let Some(seq) = entry.file_name().to_str().and_then(parse_segment_name) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort();
    Ok(segments)
}

/// Appends records to the newest segment.
pub struct WalWriter {
    file: File,
    path: PathBuf,
    size: u64,
    dir: PathBuf,
    sequence: u64,
    options: WalOptions,
}

impl WalWriter {
    /// Open the WAL in `dir`, resuming the highest existing segment.
    pub fn open<P: AsRef<Path>>(dir: P, options: WalOptions) -> StoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, "failed to create WAL directory", e))?;

        let sequence = list_segments(&dir)?.last().map(|(seq, _)| *seq).unwrap_or(0);
        let path = dir.join(segment_name(sequence));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, "failed to open WAL segment", e))?;
        let size = file
            .metadata()
            .map_err(|e| io_error(&path, "failed to stat WAL segment", e))?
            .len();

        Ok(Self { file, path, size, dir, sequence, options })
    }

    /// Append one mutation. Returns only after the record is durable when
    /// `sync_on_write` is set.
    pub fn append(&mut self, key: &[u8], value: &[u8], op: Operation) -> StoreResult<()> {
        let record = encode_record(key, value, op, self.options.max_key_size, self.options.max_value_size)?;

        if self.size + record.len() as u64 > self.options.rotation_size_bytes {
            self.rotate()?;
        }

        self.file
            .write_all(&record)
            .map_err(|e| io_error(&self.path, "WAL write failed", e))?;
        if self.options.sync_on_write {
            durable_sync(&self.file).map_err(|e| io_error(&self.path, "WAL durable_sync failed", e))?;
        }
        self.size += record.len() as u64;
        Ok(())
    }

    /// Make every appended record durable.
    pub fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file).map_err(|e| io_error(&self.path, "WAL sync failed", e))
    }

    fn rotate(&mut self) -> StoreResult<()> {
        self.sync()?;
        self.sequence += 1;
        let path = self.dir.join(segment_name(self.sequence));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, "failed to create rotated WAL segment", e))?;
        self.path = path;
        self.size = 0;
        debug!(segment = %self.path.display(), "rotated WAL segment");
        Ok(())
    }

    /// Replace every segment with a single one holding exactly `live`.
    ///
    /// The new segment is written under a temporary name, synced, then
    /// renamed into place before older segments are removed, so a crash at
    /// any point leaves either the old history or the full checkpoint.
    pub fn checkpoint<'a, I>(&mut self, live: I) -> StoreResult<usize>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        let sequence = self.sequence + 1;
        let final_path = self.dir.join(segment_name(sequence));
        let temp_path = final_path.with_extension("checkpoint");

        let mut temp = File::create(&temp_path)
            .map_err(|e| io_error(&temp_path, "failed to create checkpoint", e))?;
        let mut written = 0usize;
        let mut size = 0u64;
        for (key, value) in live {
            let record = encode_record(key, value, Operation::Set, self.options.max_key_size, self.options.max_value_size)?;
            temp.write_all(&record)
                .map_err(|e| io_error(&temp_path, "checkpoint write failed", e))?;
            size += record.len() as u64;
            written += 1;
        }
        durable_sync(&temp).map_err(|e| io_error(&temp_path, "checkpoint sync failed", e))?;
        drop(temp);

        fs::rename(&temp_path, &final_path)
            .map_err(|e| io_error(&final_path, "failed to install checkpoint", e))?;
        sync_directory(&self.dir).map_err(|e| io_error(&self.dir, "failed to sync WAL directory", e))?;

        for (seq, path) in list_segments(&self.dir)? {
            if seq < sequence {
                fs::remove_file(&path).map_err(|e| io_error(&path, "failed to remove old WAL segment", e))?;
            }
        }
        debug!(segment = %final_path.display(), records = written, "installed WAL checkpoint");

        self.file = OpenOptions::new()
            .append(true)
            .open(&final_path)
            .map_err(|e| io_error(&final_path, "failed to reopen checkpoint", e))?;
        self.path = final_path;
        self.sequence = sequence;
        self.size = size;
        Ok(written)
    }

    /// Current segment path (for diagnostics)
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Current segment size in bytes
    pub fn current_size(&self) -> u64 {
        self.size
    }
}

/// Replays WAL segments during recovery.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    /// Every intact record of every segment, in write order.
    ///
    /// Per segment: a bad magic or checksum resynchronises on the next magic;
    /// an incomplete record at the end is the crash point and ends the segment.
    pub fn recover(&self) -> StoreResult<Vec<Record>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for (_, path) in list_segments(&self.dir)? {
            records.extend(Self::recover_segment(&path)?);
        }
        Ok(records)
    }

    fn recover_segment(path: &Path) -> StoreResult<Vec<Record>> {
        let mut buffer = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut buffer))
            .map_err(|e| io_error(path, "failed to read WAL segment", e))?;

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset + HEADER_SIZE <= buffer.len() {
            let header = match RecordHeader::parse(&buffer[offset..], path, offset as u64) {
                Ok(header) => header,
                Err(err) => {
                    warn!(%err, "bad record header, scanning for next record");
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => {
                            offset = next;
                            continue;
                        }
                        None => break,
                    }
                }
            };

            let end = offset + HEADER_SIZE + header.length as usize;
            if end > buffer.len() {
                warn!(
                    segment = %path.display(),
                    offset,
                    needed = end - offset,
                    available = buffer.len() - offset,
                    "torn write at end of WAL segment"
                );
                break;
            }

            match decode_record(&buffer[offset..end], path, offset as u64) {
                Ok(record) => {
                    records.push(record);
                    offset = end;
                }
                Err(err) => {
                    warn!(%err, "corrupt WAL record skipped");
                    match find_next_magic(&buffer, offset + 1) {
                        Some(next) => offset = next,
                        None => break,
                    }
                }
            }
        }
        Ok(records)
    }
}

/// Next position at or after `start` holding the record magic.
fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    if start >= buffer.len() {
        return None;
    }
    buffer[start..]
        .windows(MAGIC.len())
        .position(|window| window == MAGIC)
        .map(|pos| start + pos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options() -> WalOptions {
        WalOptions::durable()
    }

    #[test]
    fn test_wal_write_read_roundtrip() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::open(temp.path(), options()).unwrap();
        writer.append(b"key1", b"value1", Operation::Set).unwrap();
        writer.append(b"key2", b"value2", Operation::Set).unwrap();
        writer.append(b"key1", b"", Operation::Delete).unwrap();
        drop(writer);

        let records = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, b"key1");
        assert_eq!(records[0].value, b"value1");
        assert_eq!(records[1].key, b"key2");
        assert_eq!(records[2].operation, Operation::Delete);
    }

    #[test]
    fn test_corrupt_record_is_skipped() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::open(temp.path(), options()).unwrap();
        writer.append(b"good1", b"val1", Operation::Set).unwrap();
        let first_len = writer.current_size() as usize;
        writer.append(b"good2", b"val2", Operation::Set).unwrap();
        writer.append(b"good3", b"val3", Operation::Set).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        // flip a payload byte of the second record
        let mut data = fs::read(&path).unwrap();
        data[first_len + HEADER_SIZE + 3] ^= 0xFF;
        fs::write(&path, data).unwrap();

        let records = WalReader::new(temp.path()).recover().unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![b"good1".as_slice(), b"good3".as_slice()]);
    }

    #[test]
    fn test_torn_write_stops_cleanly() {
        let temp = TempDir::new().unwrap();

        let mut writer = WalWriter::open(temp.path(), options()).unwrap();
        writer.append(b"complete", b"entry", Operation::Set).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&MAGIC);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0u8; 8]);
        fs::write(&path, data).unwrap();

        let records = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"complete");
    }

    #[test]
    fn test_missing_directory_recovers_nothing() {
        let temp = TempDir::new().unwrap();
        let records = WalReader::new(temp.path().join("absent")).recover().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_segment_naming() {
        let temp = TempDir::new().unwrap();
        let writer = WalWriter::open(temp.path(), options()).unwrap();
        let name = writer.current_path().file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(parse_segment_name(&name), Some(0));
        assert_eq!(parse_segment_name("wal-zz.log"), None);
        assert_eq!(parse_segment_name("data-0000000000000000.log"), None);
    }

    #[test]
    fn test_checkpoint_replaces_history() {
        let temp = TempDir::new().unwrap();
        let mut writer = WalWriter::open(temp.path(), options()).unwrap();
        for i in 0..10u8 {
            writer.append(&[i], b"old", Operation::Set).unwrap();
        }

        let live: Vec<(Vec<u8>, Vec<u8>)> = vec![(vec![1], b"new".to_vec()), (vec![2], b"new".to_vec())];
        let written = writer
            .checkpoint(live.iter().map(|(k, v)| (k.as_slice(), v.as_slice())))
            .unwrap();
        assert_eq!(written, 2);
        writer.append(&[3], b"after", Operation::Set).unwrap();
        drop(writer);

        assert_eq!(list_segments(temp.path()).unwrap().len(), 1);
        let records = WalReader::new(temp.path()).recover().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].value, b"new");
        assert_eq!(records[2].key, vec![3]);
    }
}
