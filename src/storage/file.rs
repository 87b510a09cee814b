use super::{Engine, Status};
use crate::error::Result;

use fs4::FileExt as _;
use log::{error, warn};
use std::collections::{btree_map, BTreeMap};
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};
use std::path::PathBuf;

/// A durable key/value storage engine backed by a single append-only log
/// file, with an in-memory key directory pointing at the latest value for
/// each key. This gives atomic, crash-safe writes: a record is either fully
/// on disk or discarded on the next open, and grouped updates (e.g. a term
/// bump with the log append that caused it) become durable together on
/// flush(), which fsyncs the file.
///
/// The file format is a sequence of records:
///
/// +----------------+------------------+-------------+-----------------+
/// | key length u32 | value length i32 | key (bytes) | value (bytes)   |
/// +----------------+------------------+-------------+-----------------+
///
/// Both lengths are big-endian. A value length of -1 is a tombstone marking
/// a deleted key, with no value bytes following. Replaced and deleted records
/// remain in the file as garbage; the log is never compacted, since the
/// committed message log is append-dominant and entries are retained forever.
pub struct FileLog {
    /// The path to the log file.
    path: PathBuf,
    /// The open log file. Holds an exclusive lock while open.
    file: std::fs::File,
    /// Maps live keys to the file offset and length of their current value.
    keydir: BTreeMap<Vec<u8>, (u64, u32)>,
    /// The current file length, i.e. the offset of the next record.
    len: u64,
    /// Bytes of replaced or deleted records in the file.
    garbage: u64,
}

/// A tombstone value length, marking a deleted key.
const TOMBSTONE: i32 = -1;

impl FileLog {
    /// Opens or creates a log file at the given path, taking an exclusive
    /// lock and rebuilding the key directory by scanning all records. A
    /// trailing incomplete record (e.g. from a crash mid-write) is truncated.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file =
            std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.try_lock_exclusive()?;

        let mut log = Self { path, file, keydir: BTreeMap::new(), len: 0, garbage: 0 };
        log.build_keydir()?;
        Ok(log)
    }

    /// Scans the file from the start, rebuilding the key directory and
    /// truncating any trailing partial record.
    fn build_keydir(&mut self) -> Result<()> {
        let file_len = self.file.seek(SeekFrom::End(0))?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut pos = 0_u64;
        let mut lens = [0_u8; 8];

        while pos < file_len {
            // Read the record header, then the key and value. Any incomplete
            // read means a torn write at the tail; drop it and stop.
            let read = |file: &mut std::fs::File, pos: u64, len: u64| -> std::io::Result<Vec<u8>> {
                let mut buf = vec![0; len as usize];
                file.seek(SeekFrom::Start(pos))?;
                file.read_exact(&mut buf)?;
                Ok(buf)
            };
            let record = || -> std::io::Result<(Vec<u8>, Option<(u64, u32)>, u64)> {
                self.file.seek(SeekFrom::Start(pos))?;
                self.file.read_exact(&mut lens)?;
                let key_len = u32::from_be_bytes(lens[0..4].try_into().expect("4 bytes"));
                let value_len = i32::from_be_bytes(lens[4..8].try_into().expect("4 bytes"));
                if pos + 8 + key_len as u64 > file_len {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                let key = read(&mut self.file, pos + 8, key_len as u64)?;
                let value_pos = pos + 8 + key_len as u64;
                match value_len {
                    TOMBSTONE => Ok((key, None, value_pos)),
                    len if len < 0 => Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid value length {len} at offset {pos}"),
                    )),
                    len => {
                        // Probe that the value is fully present.
                        let end = value_pos + len as u64;
                        if end > file_len {
                            return Err(std::io::ErrorKind::UnexpectedEof.into());
                        }
                        Ok((key, Some((value_pos, len as u32)), end))
                    }
                }
            }();

            match record {
                Ok((key, value, next)) => {
                    if let Some((_, old_len)) = match value {
                        Some(value) => self.keydir.insert(key.clone(), value),
                        None => self.keydir.remove(&key),
                    } {
                        self.garbage += 8 + key.len() as u64 + old_len as u64;
                    }
                    if value.is_none() {
                        self.garbage += next - pos;
                    }
                    pos = next;
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    warn!("Found incomplete record at offset {pos}, truncating {:?}", self.path);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.len = self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }

    /// Appends a record for the given key and value (None for a tombstone),
    /// returning the offset and length of the value.
    fn append(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(u64, u32)> {
        let value_len = value.map(|v| v.len() as u32).unwrap_or(0);
        let value_len_or_tombstone = value.map(|v| v.len() as i32).unwrap_or(TOMBSTONE);

        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(&(key.len() as u32).to_be_bytes())?;
        self.file.write_all(&value_len_or_tombstone.to_be_bytes())?;
        self.file.write_all(key)?;
        if let Some(value) = value {
            self.file.write_all(value)?;
        }

        let value_pos = self.len + 8 + key.len() as u64;
        self.len = value_pos + value_len as u64;
        Ok((value_pos, value_len))
    }

    /// Reads a value from the file at the given offset.
    fn read_value(file: &mut std::fs::File, (pos, len): (u64, u32)) -> Result<Vec<u8>> {
        let mut value = vec![0; len as usize];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut value)?;
        Ok(value)
    }
}

impl Drop for FileLog {
    /// Attempt to flush the file when the log is dropped.
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            error!("Failed to flush log file {:?}: {err}", self.path);
        }
    }
}

impl Engine for FileLog {
    type ScanIterator<'a> = ScanIterator<'a>;

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        let Some((_, old_len)) = self.keydir.remove(key) else {
            return Ok(()); // unknown key, nothing to delete
        };
        let before = self.len;
        self.append(key, None)?;
        self.garbage += 8 + key.len() as u64 + old_len as u64; // old record
        self.garbage += self.len - before; // the tombstone itself
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.keydir.get(key).copied() {
            Some(value) => Ok(Some(Self::read_value(&mut self.file, value)?)),
            None => Ok(None),
        }
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_> {
        ScanIterator { file: &mut self.file, inner: self.keydir.range(range) }
    }

    fn scan_dyn(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.scan(range))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let location = self.append(key, Some(&value))?;
        if let Some((_, old_len)) = self.keydir.insert(key.to_vec(), location) {
            self.garbage += 8 + key.len() as u64 + old_len as u64;
        }
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "filelog".to_string(),
            keys: self.keydir.len() as u64,
            size: self.keydir.iter().map(|(k, (_, len))| (k.len() + *len as usize) as u64).sum(),
            total_disk_size: self.len,
            garbage_disk_size: self.garbage,
        })
    }
}

pub struct ScanIterator<'a> {
    file: &'a mut std::fs::File,
    inner: btree_map::Range<'a, Vec<u8>, (u64, u32)>,
}

impl ScanIterator<'_> {
    fn map(&mut self, item: (&Vec<u8>, &(u64, u32))) -> <Self as Iterator>::Item {
        let (key, value) = item;
        Ok((key.clone(), FileLog::read_value(self.file, *value)?))
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map(item))
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map(item))
    }
}

#[cfg(test)]
mod tests {
    use super::super::engine::tests::test_engine;
    use super::*;

    test_engine!(FileLog::new(
        tempfile::TempDir::with_prefix("chronolog")?.path().join("log")
    )?);

    /// Writes and deletes should survive reopening the file.
    #[test]
    fn reopen() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("chronolog")?;
        let path = dir.path().join("log");

        let mut log = FileLog::new(path.clone())?;
        log.set(b"b", vec![0x01])?;
        log.set(b"b", vec![0x02])?;
        log.set(b"e", vec![0x05])?;
        log.set(b"c", vec![0x00])?;
        log.delete(b"c")?;
        log.flush()?;
        drop(log);

        let mut log = FileLog::new(path)?;
        assert_eq!(
            log.scan(..).collect::<Result<Vec<_>>>()?,
            vec![(b"b".to_vec(), vec![0x02]), (b"e".to_vec(), vec![0x05])],
        );
        Ok(())
    }

    /// A torn write at the tail of the file should be truncated on open, and
    /// all preceding records retained.
    #[test]
    fn recover_torn_write() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("chronolog")?;
        let path = dir.path().join("log");

        let mut log = FileLog::new(path.clone())?;
        log.set(b"a", vec![0x01])?;
        log.flush()?;
        let valid_len = log.len;
        drop(log);

        // Append a partial record header by hand.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0x00, 0x00, 0x00])?;
        file.sync_all()?;
        drop(file);

        let mut log = FileLog::new(path)?;
        assert_eq!(log.len, valid_len);
        assert_eq!(log.get(b"a")?, Some(vec![0x01]));

        // The log should still accept writes after recovery.
        log.set(b"b", vec![0x02])?;
        assert_eq!(log.get(b"b")?, Some(vec![0x02]));
        Ok(())
    }
}
