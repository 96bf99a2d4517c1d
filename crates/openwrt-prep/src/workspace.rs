use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanMode {
    #[default]
    None,
    /// Remove only the per-flavor OpenWrt trees from a previous run.
    Trees,
    All,
}

/// Layout of one run's working area. The clone dedup set assumes `repos`
/// starts empty, so re-running over a dirty workdir needs `CleanMode::All`.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub workdir: PathBuf,
    pub repos_dir: PathBuf,
    pub trees_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub files_dir: PathBuf,
}

impl RunPaths {
    pub fn new(workdir: &Path, output_dir: &Path, files_dir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            repos_dir: workdir.join("repos"),
            trees_dir: workdir.join("openwrts"),
            uploads_dir: output_dir.to_path_buf(),
            files_dir: files_dir.to_path_buf(),
        }
    }

    pub fn init(&self, clean: CleanMode) -> Result<()> {
        match clean {
            CleanMode::None => {}
            CleanMode::Trees => safe_remove_dir_all(&self.workdir, &self.trees_dir)?,
            CleanMode::All => {
                safe_remove_dir_all(&self.workdir, &self.trees_dir)?;
                safe_remove_dir_all(&self.workdir, &self.repos_dir)?;
            }
        }
        for dir in [
            &self.workdir,
            &self.repos_dir,
            &self.trees_dir,
            &self.uploads_dir,
        ] {
            fs::create_dir_all(dir)
                .map_err(|e| Error::filesystem(format!("failed to create {}: {e}", dir.display())))?;
        }
        Ok(())
    }

    pub fn tree_dir(&self, flavor: &str) -> PathBuf {
        self.trees_dir.join(flavor)
    }

    pub fn upload_dir(&self, flavor: &str) -> PathBuf {
        self.uploads_dir.join(flavor)
    }
}

fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let dir_can = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if !dir_can.starts_with(&root_can) {
        return Err(Error::filesystem(format!(
            "refusing to remove '{}' (outside workdir '{}')",
            dir_can.display(),
            root_can.display()
        )));
    }
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::filesystem(format!("failed to remove {}: {e}", dir_can.display())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_remove_outside_workdir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let outside = tempfile::tempdir().expect("tempdir");
        let err = safe_remove_dir_all(tmp.path(), outside.path()).unwrap_err();
        assert!(err.to_string().contains("refusing to remove"));
        assert!(outside.path().is_dir());
    }

    #[test]
    fn clean_trees_keeps_repos() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let paths = RunPaths::new(
            &tmp.path().join("work"),
            &tmp.path().join("uploads"),
            &tmp.path().join("files"),
        );
        paths.init(CleanMode::None).expect("init");
        fs::write(paths.repos_dir.join("marker"), "x").expect("marker");
        fs::write(paths.trees_dir.join("marker"), "x").expect("marker");
        paths.init(CleanMode::Trees).expect("re-init");
        assert!(paths.repos_dir.join("marker").is_file());
        assert!(!paths.trees_dir.join("marker").exists());
    }
}
