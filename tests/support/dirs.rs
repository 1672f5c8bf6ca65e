use std::path::PathBuf;

use anyhow::Result;
use tempfile::TempDir;

/// Scratch directories for one test. The cache directory is not created up
/// front so startup has to create it.
pub struct TestDirs {
    _temp: TempDir,
    pub ca_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl TestDirs {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let workspace = temp.path();
        let ca_dir = workspace.join("ca");
        let cache_dir = workspace.join("blobs");
        std::fs::create_dir_all(&ca_dir)?;

        Ok(Self {
            _temp: temp,
            ca_dir,
            cache_dir,
        })
    }

    /// Names of the complete blobs currently in the cache directory.
    pub fn stored_blobs(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.cache_dir.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
