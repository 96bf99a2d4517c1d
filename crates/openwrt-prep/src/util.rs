use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::filesystem(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::filesystem(format!("failed to write {}: {e}", p.display())))
}

pub fn read_text(p: &Path) -> Result<String> {
    fs::read_to_string(p)
        .map_err(|e| Error::filesystem(format!("failed to read {}: {e}", p.display())))
}

pub fn append_text(p: &Path, s: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(p)
        .map_err(|e| Error::filesystem(format!("failed to open {}: {e}", p.display())))?;
    f.write_all(s.as_bytes())
        .map_err(|e| Error::filesystem(format!("failed to append to {}: {e}", p.display())))
}

pub fn remove_dir_if_exists(p: &Path) -> Result<()> {
    if !p.exists() {
        return Ok(());
    }
    fs::remove_dir_all(p)
        .map_err(|e| Error::filesystem(format!("failed to remove {}: {e}", p.display())))
}

/// Recursive copy preserving symlinks (feed packages rely on relative
/// links, so dereferencing would break them).
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::filesystem(format!(
            "source dir not found: {}",
            src.display()
        )));
    }
    ensure_dir(dst)?;
    for entry in walkdir::WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| Error::filesystem(format!("walkdir error: {e}")))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::filesystem(format!("strip_prefix failed: {e}")))?;
        let target = dst.join(rel);
        if entry.path_is_symlink() {
            let link = fs::read_link(entry.path()).map_err(|e| {
                Error::filesystem(format!("read_link {}: {e}", entry.path().display()))
            })?;
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target).map_err(|e| {
                Error::filesystem(format!("symlink {} -> {}: {e}", target.display(), link.display()))
            })?;
            #[cfg(not(unix))]
            return Err(Error::filesystem(format!(
                "cannot mirror symlink {} on this platform",
                target.display()
            )));
        } else if entry.file_type().is_dir() {
            ensure_dir(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target).map_err(|e| {
                Error::filesystem(format!(
                    "failed to copy {} -> {}: {e}",
                    entry.path().display(),
                    target.display()
                ))
            })?;
        }
    }
    Ok(())
}

pub fn set_executable(p: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(p, fs::Permissions::from_mode(0o755))
            .map_err(|e| Error::filesystem(format!("chmod {}: {e}", p.display())))?;
    }
    Ok(())
}
