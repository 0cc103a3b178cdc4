//! Append-only segment file.
//!
//! Record format (big-endian):
//! `[length: 4 bytes][crc: 4 bytes][payload: length bytes]`
//!
//! Records are addressed by their ordinal offset within the segment. The
//! segment keeps a running CRC over all payloads; that digest is reported to
//! the segment coordinator when the segment rotates.

use crate::{MeshmqError, Result};
use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const RECORD_HEADER_SIZE: u64 = 8;

#[derive(Debug)]
pub struct SegmentLog {
    path: PathBuf,
    file: File,
    next_offset: u64,
    size: u64,
    content_hash: crc32fast::Hasher,
}

impl SegmentLog {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file,
            next_offset: 0,
            size: 0,
            content_hash: crc32fast::Hasher::new(),
        })
    }

    /// Open an existing segment, scanning it to rebuild the record count,
    /// size, and running content hash. Truncates a torn tail record.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut next_offset = 0;
        let mut size = 0u64;
        let mut content_hash = crc32fast::Hasher::new();

        loop {
            let mut header = [0u8; 8];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

            let mut payload = vec![0u8; length];
            match file.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if crc32fast::hash(&payload) != crc {
                break;
            }

            content_hash.update(&payload);
            next_offset += 1;
            size += RECORD_HEADER_SIZE + length as u64;
        }

        // drop whatever followed the last intact record
        file.set_len(size)?;
        file.seek(SeekFrom::Start(size))?;

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file,
            next_offset,
            size,
            content_hash,
        })
    }

    /// Append one record; returns its ordinal offset.
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let length = u32::try_from(payload.len()).map_err(|_| {
            MeshmqError::Validation("record exceeds u32::MAX bytes".to_string())
        })?;
        let crc = crc32fast::hash(payload);

        let mut buf = Vec::with_capacity(payload.len() + RECORD_HEADER_SIZE as usize);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.extend_from_slice(&crc.to_be_bytes());
        buf.extend_from_slice(payload);
        self.file.write_all(&buf)?;
        self.file.flush()?;

        let offset = self.next_offset;
        self.next_offset += 1;
        self.size += buf.len() as u64;
        self.content_hash.update(payload);
        Ok(offset)
    }

    /// Read all records from `offset` onward.
    pub fn read_from(&self, offset: u64) -> Result<Vec<(u64, Bytes)>> {
        let mut file = File::open(&self.path)?;
        let mut entries = Vec::new();
        let mut current = 0u64;

        loop {
            let mut header = [0u8; 8];
            match file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
            let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

            let mut payload = vec![0u8; length];
            file.read_exact(&mut payload)?;
            if crc32fast::hash(&payload) != crc {
                return Err(MeshmqError::Internal(format!(
                    "crc mismatch in segment {} at record {}",
                    self.path.display(),
                    current
                )));
            }

            if current >= offset {
                entries.push((current, Bytes::from(payload)));
            }
            current += 1;
        }

        Ok(entries)
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Digest over all payloads appended so far.
    pub fn content_hash(&self) -> u32 {
        self.content_hash.clone().finalize()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut log = SegmentLog::create(dir.path().join("00000001.seg")).unwrap();

        assert_eq!(log.append(b"first").unwrap(), 0);
        assert_eq!(log.append(b"second").unwrap(), 1);

        let entries = log.read_from(0).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.as_ref(), b"first");
        assert_eq!(entries[1].1.as_ref(), b"second");

        let tail = log.read_from(1).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].0, 1);
    }

    #[test]
    fn reopen_restores_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000001.seg");
        let (size, hash) = {
            let mut log = SegmentLog::create(&path).unwrap();
            log.append(b"one").unwrap();
            log.append(b"two").unwrap();
            (log.size(), log.content_hash())
        };

        let log = SegmentLog::open(&path).unwrap();
        assert_eq!(log.next_offset(), 2);
        assert_eq!(log.size(), size);
        assert_eq!(log.content_hash(), hash);
    }

    #[test]
    fn reopen_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("00000001.seg");
        {
            let mut log = SegmentLog::create(&path).unwrap();
            log.append(b"intact").unwrap();
        }
        // simulate a torn write
        {
            use std::fs::OpenOptions;
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xff, 0xff, 0x00]).unwrap();
        }

        let mut log = SegmentLog::open(&path).unwrap();
        assert_eq!(log.next_offset(), 1);
        // the segment stays appendable after truncation
        log.append(b"after").unwrap();
        let entries = log.read_from(0).unwrap();
        assert_eq!(entries.len(), 2);
    }
}
