//! Index artifacts on disk: paths, crash-safe save, backup restore and bundles.
//!
//! A save writes both files to `.tmp`, fsyncs them, copies the current pair
//! to `.backup`, then renames the temps into place. The backup therefore
//! trails the primary by one generation and a reader never sees a half
//! written primary.

use super::vector::{write_synced, IndexError, IndexResult, Sidecar, VectorIndex};
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PRIMARY_FILE: &str = "vectors.idx";
pub const SIDECAR_FILE: &str = "vectors.idx.meta";
pub const PRIMARY_BACKUP_FILE: &str = "vectors.idx.backup";
pub const SIDECAR_BACKUP_FILE: &str = "vectors.idx.meta.backup";

/// The only names a bundle may contain
pub const ARTIFACT_NAMES: [&str; 4] = [
    PRIMARY_FILE,
    SIDECAR_FILE,
    PRIMARY_BACKUP_FILE,
    SIDECAR_BACKUP_FILE,
];

const ALLOWED_EXTENSIONS: [&str; 3] = ["idx", "meta", "backup"];

/// Location of one index's artifacts
#[derive(Debug, Clone)]
pub struct IndexFiles {
    dir: PathBuf,
}

impl IndexFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn primary(&self) -> PathBuf {
        self.dir.join(PRIMARY_FILE)
    }

    pub fn sidecar(&self) -> PathBuf {
        self.dir.join(SIDECAR_FILE)
    }

    pub fn primary_backup(&self) -> PathBuf {
        self.dir.join(PRIMARY_BACKUP_FILE)
    }

    pub fn sidecar_backup(&self) -> PathBuf {
        self.dir.join(SIDECAR_BACKUP_FILE)
    }

    fn temp_for(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// True if any artifact is present
    pub fn any_exist(&self) -> bool {
        ARTIFACT_NAMES.iter().any(|name| self.dir.join(name).exists())
    }

    /// Crash-safe save of `index`
    pub fn save(&self, index: &VectorIndex, model_key: &str, generation: u64) -> IndexResult<()> {
        let (primary_bytes, sidecar_bytes) = index.encode(model_key, generation)?;
        self.save_encoded(&primary_bytes, &sidecar_bytes, generation)
    }

    /// Crash-safe install of an already encoded pair
    pub fn save_encoded(&self, primary_bytes: &[u8], sidecar_bytes: &[u8], generation: u64) -> IndexResult<()> {
        fs::create_dir_all(&self.dir)?;
        self.install(primary_bytes, sidecar_bytes)?;
        debug!(
            dir = %self.dir.display(),
            generation,
            bytes = primary_bytes.len(),
            "Saved vector index"
        );
        Ok(())
    }

    fn install(&self, primary_bytes: &[u8], sidecar_bytes: &[u8]) -> IndexResult<()> {
        let primary = self.primary();
        let sidecar = self.sidecar();
        let primary_tmp = Self::temp_for(&primary);
        let sidecar_tmp = Self::temp_for(&sidecar);

        write_synced(&primary_tmp, primary_bytes)?;
        write_synced(&sidecar_tmp, sidecar_bytes)?;

        if primary.exists() && sidecar.exists() {
            fs::copy(&primary, self.primary_backup())?;
            fs::copy(&sidecar, self.sidecar_backup())?;
        }

        fs::rename(&primary_tmp, &primary)?;
        fs::rename(&sidecar_tmp, &sidecar)?;
        sync_dir(&self.dir);
        Ok(())
    }

    /// Parse only the sidecar, e.g. to learn which model built the index
    pub fn read_sidecar(&self) -> IndexResult<Sidecar> {
        let bytes = fs::read(self.sidecar())?;
        serde_json::from_slice(&bytes).map_err(|e| IndexError::Malformed(format!("sidecar: {}", e)))
    }

    pub fn load_primary(&self) -> IndexResult<(VectorIndex, Sidecar)> {
        VectorIndex::load(&self.primary(), &self.sidecar())
    }

    /// Load the backup pair and, if it is sound, copy it over the primary
    pub fn restore_backup(&self) -> IndexResult<(VectorIndex, Sidecar)> {
        let primary_bytes = fs::read(self.primary_backup())?;
        let sidecar_bytes = fs::read(self.sidecar_backup())?;
        let loaded = VectorIndex::decode(&primary_bytes, &sidecar_bytes)?;

        let primary = self.primary();
        let sidecar = self.sidecar();
        let primary_tmp = Self::temp_for(&primary);
        let sidecar_tmp = Self::temp_for(&sidecar);
        write_synced(&primary_tmp, &primary_bytes)?;
        write_synced(&sidecar_tmp, &sidecar_bytes)?;
        fs::rename(&primary_tmp, &primary)?;
        fs::rename(&sidecar_tmp, &sidecar)?;
        sync_dir(&self.dir);

        Ok(loaded)
    }

    /// Delete every artifact; missing files are ignored
    pub fn remove_all(&self) -> IndexResult<()> {
        for name in ARTIFACT_NAMES {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(IndexError::Io(e)),
            }
        }
        Ok(())
    }

    /// Copy the present artifacts into `dest`
    pub fn export_to(&self, dest: &Path) -> Result<Vec<PathBuf>> {
        if !self.primary().exists() || !self.sidecar().exists() {
            return Err(Error::IndexUnavailable(
                "no saved index to export".to_string(),
            ));
        }

        fs::create_dir_all(dest)?;
        let mut written = Vec::new();
        for name in ARTIFACT_NAMES {
            let src = self.dir.join(name);
            if src.exists() {
                let target = dest.join(name);
                fs::copy(&src, &target)?;
                written.push(target);
            }
        }
        Ok(written)
    }
}

/// A bundle directory that passed validation
#[derive(Debug)]
pub struct Bundle {
    pub primary: Vec<u8>,
    pub sidecar: Vec<u8>,
    pub files: Vec<String>,
}

impl Bundle {
    /// Validate and read a bundle directory.
    ///
    /// Every entry must be a regular file named like an index artifact and
    /// no larger than `max_bytes`. The primary and sidecar must be present.
    pub fn read(dir: &Path, max_bytes: u64) -> Result<Self> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_str().ok_or_else(|| {
                Error::BundleRejected(format!("non UTF-8 file name {:?}", entry.file_name()))
            })?;

            let extension = Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            if !ALLOWED_EXTENSIONS.contains(&extension) || !ARTIFACT_NAMES.contains(&name) {
                return Err(Error::BundleRejected(format!("unexpected file '{}'", name)));
            }

            let meta = fs::symlink_metadata(entry.path())?;
            if !meta.file_type().is_file() {
                return Err(Error::BundleRejected(format!("'{}' is not a regular file", name)));
            }
            if meta.len() > max_bytes {
                return Err(Error::BundleRejected(format!(
                    "'{}' is {} bytes, over the {} byte limit",
                    name,
                    meta.len(),
                    max_bytes
                )));
            }
            files.push(name.to_string());
        }

        for required in [PRIMARY_FILE, SIDECAR_FILE] {
            if !files.iter().any(|f| f == required) {
                return Err(Error::BundleRejected(format!("missing '{}'", required)));
            }
        }
        files.sort();

        Ok(Self {
            primary: fs::read(dir.join(PRIMARY_FILE))?,
            sidecar: fs::read(dir.join(SIDECAR_FILE))?,
            files,
        })
    }

    pub fn decode(&self) -> Result<(VectorIndex, Sidecar)> {
        VectorIndex::decode(&self.primary, &self.sidecar).map_err(IndexError::into_load_error)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn index_with(ids: &[&str]) -> VectorIndex {
        let mut index = VectorIndex::new(2);
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        let vectors: Vec<Vec<f32>> = (0..ids.len()).map(|i| vec![1.0, i as f32]).collect();
        index.add(&ids, &vectors).unwrap();
        index
    }

    #[test]
    fn test_save_keeps_one_generation_of_backup() {
        let tmp = TempDir::new().unwrap();
        let files = IndexFiles::new(tmp.path().join("index"));

        files.save(&index_with(&["a"]), "m:f32", 1).unwrap();
        assert!(!files.primary_backup().exists());

        files.save(&index_with(&["a", "b"]), "m:f32", 2).unwrap();
        let (current, meta) = files.load_primary().unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(meta.generation, 2);

        let backup = VectorIndex::load(&files.primary_backup(), &files.sidecar_backup()).unwrap();
        assert_eq!(backup.1.generation, 1);
        assert_eq!(backup.0.len(), 1);

        assert!(!IndexFiles::temp_for(&files.primary()).exists());
    }

    #[test]
    fn test_restore_backup_over_corrupt_primary() {
        let tmp = TempDir::new().unwrap();
        let files = IndexFiles::new(tmp.path());
        files.save(&index_with(&["a", "b"]), "m:f32", 1).unwrap();
        files.save(&index_with(&["a", "b"]), "m:f32", 2).unwrap();

        fs::write(files.primary(), b"garbage").unwrap();
        assert!(files.load_primary().is_err());

        let (restored, meta) = files.restore_backup().unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(meta.generation, 1);
        assert!(files.load_primary().is_ok());
    }

    #[test]
    fn test_bundle_validation() {
        let tmp = TempDir::new().unwrap();
        let files = IndexFiles::new(tmp.path().join("index"));
        files.save(&index_with(&["a"]), "m:f32", 1).unwrap();

        let bundle_dir = tmp.path().join("bundle");
        let written = files.export_to(&bundle_dir).unwrap();
        assert_eq!(written.len(), 2);

        let bundle = Bundle::read(&bundle_dir, 1024 * 1024).unwrap();
        assert_eq!(bundle.files, vec![PRIMARY_FILE.to_string(), SIDECAR_FILE.to_string()]);
        assert_eq!(bundle.decode().unwrap().0.len(), 1);

        // Size cap
        assert!(matches!(
            Bundle::read(&bundle_dir, 4),
            Err(Error::BundleRejected(_))
        ));

        // Foreign file
        fs::write(bundle_dir.join("notes.txt"), b"hi").unwrap();
        assert!(matches!(
            Bundle::read(&bundle_dir, 1024 * 1024),
            Err(Error::BundleRejected(_))
        ));
        fs::remove_file(bundle_dir.join("notes.txt")).unwrap();

        // Allowed extension, unknown name
        fs::write(bundle_dir.join("other.idx"), b"hi").unwrap();
        assert!(matches!(
            Bundle::read(&bundle_dir, 1024 * 1024),
            Err(Error::BundleRejected(_))
        ));
        fs::remove_file(bundle_dir.join("other.idx")).unwrap();

        // Missing sidecar
        fs::remove_file(bundle_dir.join(SIDECAR_FILE)).unwrap();
        assert!(matches!(
            Bundle::read(&bundle_dir, 1024 * 1024),
            Err(Error::BundleRejected(_))
        ));
    }

    #[test]
    fn test_remove_all_tolerates_missing() {
        let tmp = TempDir::new().unwrap();
        let files = IndexFiles::new(tmp.path());
        files.remove_all().unwrap();
        files.save(&index_with(&["a"]), "m:f32", 1).unwrap();
        assert!(files.any_exist());
        files.remove_all().unwrap();
        assert!(!files.any_exist());
    }
}
