use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use strata_types::blob_id::{BlobId, BlobMetadata};
use strata_types::error::{Result, StrataError};

use crate::blob::{BlobStorage, PutOptions, FULL_BLOB};

/// Directory-backed blob store. Blob ids map directly to file names under a
/// two-character shard directory (format blobs, which carry dots, live at
/// the root).
pub struct FilesystemStorage {
    root: PathBuf,
    read_only: bool,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            read_only: false,
        })
    }

    pub fn open_read_only(root: impl Into<PathBuf>) -> Result<Self> {
        let root: PathBuf = root.into();
        if !root.is_dir() {
            return Err(StrataError::Config(format!(
                "repository directory does not exist: {}",
                root.display()
            )));
        }
        Ok(Self {
            root,
            read_only: true,
        })
    }

    /// Short blob ids (`p`, `q`, `n`, …) shard into a directory named after
    /// the two characters following the kind prefix; long dotted names (the
    /// format blob and its backups) stay at the root.
    fn shard_dir(&self, id: &str) -> PathBuf {
        if id.len() >= 3 && !id.contains('.') {
            self.root.join(&id[..3])
        } else {
            self.root.clone()
        }
    }

    fn blob_path(&self, id: &BlobId) -> Result<PathBuf> {
        id.validate()?;
        Ok(self.shard_dir(id.as_str()).join(id.as_str()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StrataError::ReadOnly);
        }
        Ok(())
    }

    fn visit_dir(
        &self,
        dir: &Path,
        prefix: &str,
        cb: &mut dyn FnMut(BlobMetadata) -> Result<()>,
    ) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let meta = entry.metadata()?;
            if meta.is_dir() {
                // Descend when the shard could contain ids with this prefix.
                if name.starts_with(prefix) || prefix.starts_with(name) {
                    self.visit_dir(&entry.path(), prefix, cb)?;
                }
                continue;
            }
            if !name.starts_with(prefix) || name.contains(".tmp.") {
                continue;
            }
            let timestamp: DateTime<Utc> = meta.modified()?.into();
            cb(BlobMetadata {
                id: BlobId::from(name),
                length: meta.len(),
                timestamp,
            })?;
        }
        Ok(())
    }
}

impl BlobStorage for FilesystemStorage {
    fn list(&self, prefix: &str, cb: &mut dyn FnMut(BlobMetadata) -> Result<()>) -> Result<()> {
        self.visit_dir(&self.root, prefix, cb)
    }

    fn get(&self, id: &BlobId, offset: u64, length: i64) -> Result<Vec<u8>> {
        let path = self.blob_path(id)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StrataError::BlobNotFound(id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(StrataError::PermissionDenied(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let total = file.metadata()?.len();
        if length < FULL_BLOB || offset > total {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length,
            });
        }
        file.seek(SeekFrom::Start(offset))?;
        if length == FULL_BLOB {
            let mut out = Vec::with_capacity((total - offset) as usize);
            file.read_to_end(&mut out)?;
            return Ok(out);
        }
        if offset + length as u64 > total {
            return Err(StrataError::InvalidRange {
                offset: offset as i64,
                length,
            });
        }
        let mut out = vec![0u8; length as usize];
        file.read_exact(&mut out)?;
        Ok(out)
    }

    fn put(&self, id: &BlobId, data: &[u8], opts: &PutOptions) -> Result<()> {
        self.check_writable()?;
        let path = self.blob_path(id)?;
        if opts.if_not_exists && path.exists() {
            return Err(StrataError::BlobAlreadyExists(id.to_string()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write-then-rename so concurrent readers never observe a torn blob.
        let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        if let Some(ts) = opts.set_mod_time {
            let _ = set_file_mtime(&path, ts);
        }
        Ok(())
    }

    fn delete(&self, id: &BlobId) -> Result<()> {
        self.check_writable()?;
        let path = self.blob_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StrataError::BlobNotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_time(&self, id: &BlobId, ts: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        let path = self.blob_path(id)?;
        if !path.exists() {
            return Err(StrataError::BlobNotFound(id.to_string()));
        }
        set_file_mtime(&path, ts)
    }

    fn display_name(&self) -> String {
        format!("filesystem:{}", self.root.display())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Best-effort mtime update using a read-append-truncate-free approach: open
/// the file for write and set times through the handle where the platform
/// allows it.
fn set_file_mtime(path: &Path, ts: DateTime<Utc>) -> Result<()> {
    let file = fs::OpenOptions::new().append(true).open(path)?;
    let system_time: std::time::SystemTime = ts.into();
    file.set_modified(system_time)
        .map_err(|_| StrataError::SetTimeUnsupported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{get_full, list_all};

    fn storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().unwrap();
        let s = FilesystemStorage::new(dir.path()).unwrap();
        (dir, s)
    }

    #[test]
    fn put_get_roundtrip() {
        let (_dir, s) = storage();
        s.put(&BlobId::from("pdeadbeef01"), b"hello", &PutOptions::default())
            .unwrap();
        assert_eq!(get_full(&s, &BlobId::from("pdeadbeef01")).unwrap(), b"hello");
    }

    #[test]
    fn format_blob_lives_at_root() {
        let (dir, s) = storage();
        s.put(
            &BlobId::from("strata.repository"),
            b"{}",
            &PutOptions::default(),
        )
        .unwrap();
        assert!(dir.path().join("strata.repository").is_file());
    }

    #[test]
    fn pack_blob_is_sharded() {
        let (dir, s) = storage();
        s.put(&BlobId::from("pabcdef"), b"x", &PutOptions::default())
            .unwrap();
        assert!(dir.path().join("pab").join("pabcdef").is_file());
    }

    #[test]
    fn list_sees_sharded_and_root_blobs() {
        let (_dir, s) = storage();
        s.put(&BlobId::from("pab01"), b"x", &PutOptions::default())
            .unwrap();
        s.put(&BlobId::from("pcd02"), b"y", &PutOptions::default())
            .unwrap();
        s.put(&BlobId::from("nab01"), b"z", &PutOptions::default())
            .unwrap();

        let packs = list_all(&s, "p").unwrap();
        assert_eq!(packs.len(), 2);
        let indexes = list_all(&s, "n").unwrap();
        assert_eq!(indexes.len(), 1);
    }

    #[test]
    fn range_read_and_invalid_range() {
        let (_dir, s) = storage();
        s.put(&BlobId::from("pab01"), b"0123456789", &PutOptions::default())
            .unwrap();
        assert_eq!(s.get(&BlobId::from("pab01"), 2, 3).unwrap(), b"234");
        assert!(matches!(
            s.get(&BlobId::from("pab01"), 8, 5),
            Err(StrataError::InvalidRange { .. })
        ));
    }

    #[test]
    fn capacity_is_unknown() {
        let (_dir, s) = storage();
        assert!(matches!(
            s.get_capacity(),
            Err(StrataError::CapacityUnknown)
        ));
    }

    #[test]
    fn delete_missing_distinguished() {
        let (_dir, s) = storage();
        assert!(matches!(
            s.delete(&BlobId::from("pmissing")),
            Err(StrataError::BlobNotFound(_))
        ));
    }

    #[test]
    fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let rw = FilesystemStorage::new(dir.path()).unwrap();
        rw.put(&BlobId::from("pab01"), b"x", &PutOptions::default())
            .unwrap();
        let ro = FilesystemStorage::open_read_only(dir.path()).unwrap();
        assert!(ro.is_read_only());
        assert!(matches!(
            ro.put(&BlobId::from("pab02"), b"y", &PutOptions::default()),
            Err(StrataError::ReadOnly)
        ));
        assert_eq!(get_full(&ro, &BlobId::from("pab01")).unwrap(), b"x");
    }
}
