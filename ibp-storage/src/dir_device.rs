//! Directory-backed object device
//!
//! Objects live in 256 bucket directories chosen by the low byte of the id.
//! Trashed objects are renamed into `deleted_trash/` or `expired_trash/`
//! under the name `<move_time>_<id>`.

use crate::device::{DeviceStats, ObjectDevice, TrashEntry, TrashKind};
use bytes::Bytes;
use ibp_core::{AllocationId, IbpError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Number of bucket directories
pub const DIR_MAX: u64 = 256;

/// Directory-backed object device
pub struct DirDevice {
    root: PathBuf,
}

impl DirDevice {
    /// Open or create a device rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        info!(path = ?root, "Opening directory device");

        for bucket in 0..DIR_MAX {
            fs::create_dir_all(root.join(bucket.to_string()))?;
        }
        for kind in TrashKind::ALL {
            fs::create_dir_all(root.join(kind.dir_name()))?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: AllocationId) -> PathBuf {
        self.root
            .join((id.as_u64() % DIR_MAX).to_string())
            .join(id.to_string())
    }

    fn trash_path(&self, kind: TrashKind, trash_id: &str) -> PathBuf {
        self.root.join(kind.dir_name()).join(trash_id)
    }

    fn open_existing(&self, id: AllocationId, write: bool) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(self.object_path(id))
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => IbpError::Device(format!("no object {}", id)),
                _ => IbpError::Io(e),
            })
    }
}

impl ObjectDevice for DirDevice {
    fn create_id(&self) -> Result<AllocationId> {
        loop {
            let id = AllocationId::new(rand::random::<u64>());
            if id.is_reserved() {
                continue;
            }
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.object_path(id))
            {
                Ok(_) => return Ok(id),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(IbpError::Io(e)),
            }
        }
    }

    fn create_with_id(&self, id: AllocationId) -> Result<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.object_path(id))?;
        Ok(())
    }

    fn reserve(&self, id: AllocationId, len: u64) -> Result<()> {
        let file = self.open_existing(id, true)?;
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }

    fn read(&self, id: AllocationId, offset: u64, len: u64) -> Result<Bytes> {
        let file = self.open_existing(id, false)?;
        let size = file.metadata()?.len();
        let n = len.min(size.saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; n];
        let mut done = 0;
        while done < n {
            let got = file.read_at(&mut buf[done..], offset + done as u64)?;
            if got == 0 {
                break;
            }
            done += got;
        }
        buf.truncate(done);
        Ok(Bytes::from(buf))
    }

    fn write(&self, id: AllocationId, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.open_existing(id, true)?;
        file.write_all_at(data, offset)?;
        Ok(())
    }

    fn size(&self, id: AllocationId) -> Result<u64> {
        Ok(self.open_existing(id, false)?.metadata()?.len())
    }

    fn truncate(&self, id: AllocationId, len: u64) -> Result<()> {
        self.open_existing(id, true)?.set_len(len)?;
        Ok(())
    }

    fn exists(&self, id: AllocationId) -> bool {
        self.object_path(id).is_file()
    }

    fn remove(&self, id: AllocationId) -> Result<()> {
        fs::remove_file(self.object_path(id))?;
        Ok(())
    }

    fn trash(&self, id: AllocationId, kind: TrashKind, move_time: u64) -> Result<()> {
        let dest = self.trash_path(kind, &TrashEntry::trash_name(move_time, id));
        fs::rename(self.object_path(id), &dest)?;
        debug!(id = %id, bin = %kind, "Moved object to trash");
        Ok(())
    }

    fn trash_entries(&self, kind: TrashKind) -> Result<Vec<TrashEntry>> {
        let mut entries = Vec::new();
        for item in fs::read_dir(self.root.join(kind.dir_name()))? {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            match TrashEntry::parse_name(&name) {
                Some((move_time, id)) => entries.push(TrashEntry {
                    size: item.metadata()?.len(),
                    trash_id: name,
                    id,
                    move_time,
                }),
                None => warn!(bin = %kind, name = %name, "Ignoring foreign file in trash"),
            }
        }
        entries.sort_by_key(|e| (e.move_time, e.id));
        Ok(entries)
    }

    fn trash_remove(&self, kind: TrashKind, trash_id: &str) -> Result<u64> {
        let path = self.trash_path(kind, trash_id);
        let len = fs::metadata(&path)?.len();
        fs::remove_file(&path)?;
        Ok(len)
    }

    fn trash_undelete(&self, kind: TrashKind, trash_id: &str) -> Result<AllocationId> {
        let (_, id) = TrashEntry::parse_name(trash_id)
            .ok_or_else(|| IbpError::Device(format!("bad trash id {}", trash_id)))?;
        if self.exists(id) {
            return Err(IbpError::Device(format!("object {} already live", id)));
        }
        fs::rename(self.trash_path(kind, trash_id), self.object_path(id))?;
        Ok(id)
    }

    fn ids(&self) -> Result<Vec<AllocationId>> {
        let mut ids = Vec::new();
        for bucket in 0..DIR_MAX {
            for item in fs::read_dir(self.root.join(bucket.to_string()))? {
                let item = item?;
                if let Some(raw) = item.file_name().to_str().and_then(|s| s.parse::<u64>().ok()) {
                    let id = AllocationId::new(raw);
                    if !id.is_reserved() {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn statfs(&self) -> Result<DeviceStats> {
        let stats = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| IbpError::Device(format!("statvfs failed: {}", e)))?;
        let frsize = stats.fragment_size() as u64;
        Ok(DeviceStats {
            free_bytes: stats.blocks_available() as u64 * frsize,
            total_bytes: stats.blocks() as u64 * frsize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_and_io() {
        let dir = TempDir::new().unwrap();
        let dev = DirDevice::open(dir.path()).unwrap();
        let id = dev.create_id().unwrap();

        dev.write(id, 4, b"abcd").unwrap();
        assert_eq!(dev.size(id).unwrap(), 8);
        assert_eq!(&dev.read(id, 4, 10).unwrap()[..], b"abcd");
        assert!(dir
            .path()
            .join((id.as_u64() % DIR_MAX).to_string())
            .join(id.to_string())
            .is_file());

        dev.reserve(id, 100).unwrap();
        assert_eq!(dev.size(id).unwrap(), 100);
        dev.truncate(id, 6).unwrap();
        assert_eq!(dev.size(id).unwrap(), 6);
    }

    #[test]
    fn test_trash_cycle() {
        let dir = TempDir::new().unwrap();
        let dev = DirDevice::open(dir.path()).unwrap();
        let id = dev.create_id().unwrap();
        dev.write(id, 0, &[7u8; 32]).unwrap();

        dev.trash(id, TrashKind::Expire, 55).unwrap();
        assert!(!dev.exists(id));
        let entries = dev.trash_entries(TrashKind::Expire).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 32);

        dev.trash_undelete(TrashKind::Expire, &entries[0].trash_id)
            .unwrap();
        assert!(dev.exists(id));

        dev.trash(id, TrashKind::Delete, 56).unwrap();
        let name = TrashEntry::trash_name(56, id);
        assert_eq!(dev.trash_remove(TrashKind::Delete, &name).unwrap(), 32);
        assert!(dev.trash_entries(TrashKind::Delete).unwrap().is_empty());
    }

    #[test]
    fn test_ids_and_statfs() {
        let dir = TempDir::new().unwrap();
        let dev = DirDevice::open(dir.path()).unwrap();
        dev.create_with_id(ibp_core::USAGE_ID).unwrap();
        let a = dev.create_id().unwrap();
        let b = dev.create_id().unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(dev.ids().unwrap(), expected);

        let stats = dev.statfs().unwrap();
        assert!(stats.total_bytes >= stats.free_bytes);
    }
}
