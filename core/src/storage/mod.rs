//! Local segment storage.
//!
//! Owns the bytes of the segments this node is primary for. The segment
//! coordinator decides *which* segments exist; this store only opens,
//! appends, iterates, and closes the local files, reporting size and content
//! hash back for rotation.

pub mod log;

use crate::cluster::SegmentId;
use crate::Result;
use bytes::Bytes;
use log::SegmentLog;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone)]
pub struct SegmentStoreConfig {
    pub data_dir: PathBuf,
    /// Unix permission bits applied to the data directory.
    pub dir_perm: u32,
    /// Size threshold at which a segment should rotate.
    pub max_segment_size: u64,
}

impl Default for SegmentStoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            dir_perm: 0o755,
            max_segment_size: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct SegmentStore {
    config: SegmentStoreConfig,
    open: Mutex<HashMap<SegmentId, SegmentLog>>,
}

impl SegmentStore {
    pub fn new(config: SegmentStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &config.data_dir,
                std::fs::Permissions::from_mode(config.dir_perm),
            )?;
        }
        info!("segment store at {}", config.data_dir.display());
        Ok(Self {
            config,
            open: Mutex::new(HashMap::new()),
        })
    }

    fn segment_path(&self, segment_id: SegmentId) -> PathBuf {
        self.config.data_dir.join(format!("{:020}.seg", segment_id))
    }

    /// Append a record, opening (or recovering) the segment file on first
    /// touch. Returns the record offset.
    pub fn append(&self, segment_id: SegmentId, payload: &[u8]) -> Result<u64> {
        let mut open = self.open.lock();
        if !open.contains_key(&segment_id) {
            let path = self.segment_path(segment_id);
            let log = if path.exists() {
                SegmentLog::open(&path)?
            } else {
                SegmentLog::create(&path)?
            };
            open.insert(segment_id, log);
        }
        open.get_mut(&segment_id)
            .expect("inserted above")
            .append(payload)
    }

    /// Read records from `offset` onward. Works for open and closed segments
    /// alike, as long as the file is local.
    pub fn read_from(&self, segment_id: SegmentId, offset: u64) -> Result<Vec<(u64, Bytes)>> {
        {
            let open = self.open.lock();
            if let Some(log) = open.get(&segment_id) {
                return log.read_from(offset);
            }
        }
        let path = self.segment_path(segment_id);
        SegmentLog::open(&path)?.read_from(offset)
    }

    /// Whether the segment has grown past the rotation threshold.
    pub fn is_full(&self, segment_id: SegmentId) -> bool {
        self.open
            .lock()
            .get(&segment_id)
            .map(|log| log.size() >= self.config.max_segment_size)
            .unwrap_or(false)
    }

    /// Close a segment ahead of rotation; returns (size, content hash) for
    /// the SegmentClose command.
    pub fn close(&self, segment_id: SegmentId) -> Result<(u64, u32)> {
        let mut open = self.open.lock();
        match open.remove(&segment_id) {
            Some(log) => Ok((log.size(), log.content_hash())),
            None => {
                let log = SegmentLog::open(self.segment_path(segment_id))?;
                Ok((log.size(), log.content_hash()))
            }
        }
    }

    /// Delete the local file of a segment that left the catalog.
    pub fn remove(&self, segment_id: SegmentId) -> Result<()> {
        self.open.lock().remove(&segment_id);
        let path = self.segment_path(segment_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(max_segment_size: u64) -> (tempfile::TempDir, SegmentStore) {
        let dir = tempdir().unwrap();
        let store = SegmentStore::new(SegmentStoreConfig {
            data_dir: dir.path().to_path_buf(),
            dir_perm: 0o755,
            max_segment_size,
        })
        .unwrap();
        (dir, store)
    }

    #[test]
    fn append_read_across_segments() {
        let (_dir, store) = store(1024);

        assert_eq!(store.append(1, b"a").unwrap(), 0);
        assert_eq!(store.append(1, b"b").unwrap(), 1);
        assert_eq!(store.append(2, b"c").unwrap(), 0);

        let first = store.read_from(1, 0).unwrap();
        assert_eq!(first.len(), 2);
        let second = store.read_from(2, 0).unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn full_segment_reports_rotation() {
        let (_dir, store) = store(16);
        assert!(!store.is_full(1));
        store.append(1, &[0u8; 32]).unwrap();
        assert!(store.is_full(1));
    }

    #[test]
    fn close_reports_size_and_hash() {
        let (_dir, store) = store(1024);
        store.append(1, b"payload").unwrap();
        let (size, hash) = store.close(1).unwrap();
        assert_eq!(size, 8 + 7);
        assert_eq!(hash, crc32fast::hash(b"payload"));

        // closed segments remain readable
        let entries = store.read_from(1, 0).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
