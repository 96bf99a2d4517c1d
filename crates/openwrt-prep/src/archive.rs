use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{Error, Result};
use crate::util;

/// Packs `src_dir` into a gzipped tarball at `dest`, every entry rooted
/// under `member_root`. Entries are appended in sorted walk order so the
/// same tree always produces the same member sequence; symlinks are
/// stored as links, not followed.
pub fn pack(src_dir: &Path, dest: &Path, member_root: &str) -> Result<()> {
    if let Some(parent) = dest.parent() {
        util::ensure_dir(parent)?;
    }
    let file = File::create(dest)
        .map_err(|e| Error::filesystem(format!("failed to create {}: {e}", dest.display())))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let walker = walkdir::WalkDir::new(src_dir)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry
            .map_err(|e| Error::filesystem(format!("walking {}: {e}", src_dir.display())))?;
        let rel = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|e| Error::msg(format!("path outside archive root: {e}")))?;
        let member = PathBuf::from(member_root).join(rel);
        if entry.file_type().is_dir() {
            builder
                .append_dir(&member, entry.path())
                .map_err(|e| Error::filesystem(format!("archiving {}: {e}", rel.display())))?;
        } else {
            builder
                .append_path_with_name(entry.path(), &member)
                .map_err(|e| Error::filesystem(format!("archiving {}: {e}", rel.display())))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::filesystem(format!("finalizing {}: {e}", dest.display())))?;
    encoder
        .finish()
        .map_err(|e| Error::filesystem(format!("finalizing {}: {e}", dest.display())))?;
    Ok(())
}

/// Pulls a single member out of a gzipped tarball to `dest`. Member
/// paths are compared with any leading `./` stripped, matching how
/// upstream bundles name their entries.
pub fn extract_member(archive: &Path, member: &str, dest: &Path, executable: bool) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::filesystem(format!("failed to open {}: {e}", archive.display())))?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    let wanted = member.trim_start_matches("./");

    let entries = tarball
        .entries()
        .map_err(|e| Error::filesystem(format!("reading {}: {e}", archive.display())))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| Error::filesystem(format!("reading {}: {e}", archive.display())))?;
        let path = entry
            .path()
            .map_err(|e| Error::filesystem(format!("reading {}: {e}", archive.display())))?;
        if path.to_string_lossy().trim_start_matches("./") != wanted {
            continue;
        }
        if let Some(parent) = dest.parent() {
            util::ensure_dir(parent)?;
        }
        let mut out = File::create(dest)
            .map_err(|e| Error::filesystem(format!("failed to create {}: {e}", dest.display())))?;
        io::copy(&mut entry, &mut out)
            .map_err(|e| Error::filesystem(format!("extracting {member}: {e}")))?;
        if executable {
            util::set_executable(dest)?;
        }
        return Ok(());
    }
    Err(Error::msg(format!(
        "member {member} not found in {}",
        archive.display()
    )))
}

/// Decompresses a standalone `.gz` file.
pub fn gunzip_file(src: &Path, dest: &Path, executable: bool) -> Result<()> {
    let file = File::open(src)
        .map_err(|e| Error::filesystem(format!("failed to open {}: {e}", src.display())))?;
    let mut decoder = GzDecoder::new(file);
    if let Some(parent) = dest.parent() {
        util::ensure_dir(parent)?;
    }
    let mut out = File::create(dest)
        .map_err(|e| Error::filesystem(format!("failed to create {}: {e}", dest.display())))?;
    io::copy(&mut decoder, &mut out)
        .map_err(|e| Error::filesystem(format!("decompressing {}: {e}", src.display())))?;
    if executable {
        util::set_executable(dest)?;
    }
    Ok(())
}
