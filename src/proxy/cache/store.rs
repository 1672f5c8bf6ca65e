use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tracing::{debug, info, warn};

use super::{CacheError, CacheKey};

const PARTIAL_PREFIX: &str = ".partial-";

/// Flat directory holding one file per blob, named by its key.
#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }

    /// Makes sure the directory exists, drops leftovers from interrupted
    /// fetches and returns the keys of every complete blob.
    pub(super) fn scan(&self) -> Result<Vec<CacheKey>, CacheError> {
        self.ensure_dir()?;

        let entries = fs::read_dir(&self.dir).map_err(|source| self.unavailable(source))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| self.unavailable(source))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                warn!(path = %path.display(), "ignoring non UTF-8 entry in blob store");
                continue;
            };
            if name.starts_with(PARTIAL_PREFIX) {
                debug!(path = %path.display(), "removing partial blob left by previous run");
                fs::remove_file(&path).ok();
                continue;
            }
            if !path.is_file() {
                continue;
            }
            match CacheKey::parse(name) {
                Some(key) => keys.push(key),
                None => warn!(path = %path.display(), "ignoring unexpected file in blob store"),
            }
        }
        Ok(keys)
    }

    fn ensure_dir(&self) -> Result<(), CacheError> {
        match fs::metadata(&self.dir) {
            Ok(meta) if meta.is_dir() => {
                info!(directory = %self.dir.display(), "using existing blob store");
                Ok(())
            }
            Ok(_) => Err(self.unavailable(std::io::Error::new(
                ErrorKind::AlreadyExists,
                "path exists and is not a directory",
            ))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(directory = %self.dir.display(), "creating blob store directory");
                let mut builder = fs::DirBuilder::new();
                builder.recursive(true);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::DirBuilderExt;
                    builder.mode(0o700);
                }
                builder
                    .create(&self.dir)
                    .map_err(|source| self.unavailable(source))
            }
            Err(err) => Err(self.unavailable(err)),
        }
    }

    fn unavailable(&self, source: std::io::Error) -> CacheError {
        CacheError::StoreUnavailable {
            path: self.dir.clone(),
            source,
        }
    }

    /// Creates a uniquely named partial file for a new fetch of `key`.
    pub(super) async fn create_partial(
        &self,
        key: &CacheKey,
    ) -> Result<(AsyncFile, PathBuf), CacheError> {
        let path = self
            .dir
            .join(format!("{PARTIAL_PREFIX}{}-{}", key, uuid::Uuid::new_v4()));
        let mut options = async_fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = options
            .open(&path)
            .await
            .map_err(|source| CacheError::FileCreate {
                path: path.clone(),
                source,
            })?;
        Ok((file, path))
    }

    /// Moves a finished partial file to its final, key-named location.
    pub(super) async fn commit(&self, partial: &Path, key: &CacheKey) -> std::io::Result<()> {
        async_fs::rename(partial, self.blob_path(key)).await
    }

    pub(super) async fn open_blob(&self, key: &CacheKey) -> Result<(AsyncFile, u64), CacheError> {
        let path = self.blob_path(key);
        let file = AsyncFile::open(&path)
            .await
            .map_err(|source| CacheError::FileOpen {
                path: path.clone(),
                source,
            })?;
        let meta = file
            .metadata()
            .await
            .map_err(|source| CacheError::FileStat { path, source })?;
        Ok((file, meta.len()))
    }
}
