use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::run::RunCtx;
use crate::util;

/// Sentinel path segment for "clone the default branch".
const DEFAULT_BRANCH_SEGMENT: &str = "@default@";

/// Identity of one clone: (repository URL, branch), where an empty branch
/// means the repository default.
pub type RepoKey = (String, String);

pub trait Cloner: Send + Sync {
    fn clone_repo(&self, ctx: &RunCtx, url: &str, branch: Option<&str>, dest: &Path)
    -> Result<()>;
}

/// Shallow clone through the git CLI, output streamed into the run log.
pub struct GitCloner;

impl Cloner for GitCloner {
    fn clone_repo(
        &self,
        ctx: &RunCtx,
        url: &str,
        branch: Option<&str>,
        dest: &Path,
    ) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("--depth").arg("1");
        if let Some(branch) = branch {
            cmd.arg("--branch").arg(branch);
        }
        cmd.arg(url).arg(dest);
        ctx.run_cmd(cmd)
            .map_err(|e| Error::network(format!("git clone of {url} failed: {e}")))
    }
}

/// Run-scoped clone deduplication: a given (url, branch) pair is cloned at
/// most once no matter how many flavors reference it. Purely in-memory;
/// the repos dir is assumed clean at the start of the run.
pub struct CloneSet<'a> {
    repos_dir: PathBuf,
    cloner: &'a dyn Cloner,
    cloned: BTreeMap<RepoKey, PathBuf>,
}

impl<'a> CloneSet<'a> {
    pub fn new(repos_dir: &Path, cloner: &'a dyn Cloner) -> Self {
        Self {
            repos_dir: repos_dir.to_path_buf(),
            cloner,
            cloned: BTreeMap::new(),
        }
    }

    /// Destination is derived from the URL's last two path segments plus
    /// the branch, so distinct branches of one repo live side by side.
    pub fn ensure_cloned(&mut self, ctx: &RunCtx, url: &str, branch: &str) -> Result<PathBuf> {
        let key: RepoKey = (url.to_string(), branch.to_string());
        if let Some(path) = self.cloned.get(&key) {
            return Ok(path.clone());
        }

        let mut segments = url.trim_end_matches('/').rsplit('/');
        let name = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config(format!("cannot derive clone path from URL: {url}")))?;
        let owner = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config(format!("cannot derive clone path from URL: {url}")))?;
        let branch_segment = if branch.is_empty() {
            DEFAULT_BRANCH_SEGMENT
        } else {
            branch
        };
        let dest = self.repos_dir.join(owner).join(name).join(branch_segment);

        if branch.is_empty() {
            ctx.log(&format!("cloning {url}"));
        } else {
            ctx.log(&format!("cloning {url} (branch: {branch})"));
        }
        self.cloner
            .clone_repo(ctx, url, (!branch.is_empty()).then_some(branch), &dest)?;
        self.cloned.insert(key, dest.clone());
        Ok(dest)
    }

    /// Read-only view handed to the per-flavor jobs after fan-out.
    pub fn into_map(self) -> BTreeMap<RepoKey, PathBuf> {
        self.cloned
    }
}

/// Repairs recurring defects in out-of-tree package sources: Makefiles
/// that include `../../luci.mk` relative to a feed checkout, and `po`
/// translation directories that ship only `zh_Hans` where the build looks
/// for `zh-cn`.
pub fn repair_sources(dir: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry =
            entry.map_err(|e| Error::filesystem(format!("walking {}: {e}", dir.display())))?;
        if entry.file_type().is_file() && entry.file_name() == "Makefile" {
            let text = util::read_text(entry.path())?;
            if text.contains("../../luci.mk") {
                util::write_text(
                    entry.path(),
                    &text.replace("../../luci.mk", "$(TOPDIR)/feeds/luci/luci.mk"),
                )?;
            }
        } else if entry.file_type().is_dir() && entry.file_name() == "po" {
            let zh_cn = entry.path().join("zh-cn");
            let zh_hans = entry.path().join("zh_Hans");
            if !zh_cn.is_dir() && zh_hans.is_dir() {
                #[cfg(unix)]
                std::os::unix::fs::symlink("zh_Hans", &zh_cn).map_err(|e| {
                    Error::filesystem(format!("linking {}: {e}", zh_cn.display()))
                })?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::mpsc;

    struct RecordingCloner {
        calls: Mutex<Vec<(String, Option<String>)>>,
    }

    impl Cloner for RecordingCloner {
        fn clone_repo(
            &self,
            _ctx: &RunCtx,
            url: &str,
            branch: Option<&str>,
            dest: &Path,
        ) -> Result<()> {
            std::fs::create_dir_all(dest).expect("create dest");
            self.calls
                .lock()
                .expect("lock")
                .push((url.to_string(), branch.map(str::to_string)));
            Ok(())
        }
    }

    fn test_ctx() -> RunCtx {
        let (tx, _rx) = mpsc::channel();
        // Receiver is dropped; ChannelSink discards send failures.
        RunCtx::new(std::sync::Arc::new(crate::run::ChannelSink::new(tx)))
    }

    #[test]
    fn dedups_identical_url_branch_pairs() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cloner = RecordingCloner {
            calls: Mutex::new(Vec::new()),
        };
        let mut set = CloneSet::new(tmp.path(), &cloner);
        let ctx = test_ctx();

        let a = set
            .ensure_cloned(&ctx, "https://github.com/e/pkg", "main")
            .expect("clone");
        let b = set
            .ensure_cloned(&ctx, "https://github.com/e/pkg", "main")
            .expect("clone");
        assert_eq!(a, b);
        assert_eq!(cloner.calls.lock().expect("lock").len(), 1);

        set.ensure_cloned(&ctx, "https://github.com/e/pkg", "dev")
            .expect("clone");
        assert_eq!(cloner.calls.lock().expect("lock").len(), 2);
    }

    #[test]
    fn default_branch_uses_sentinel_segment() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cloner = RecordingCloner {
            calls: Mutex::new(Vec::new()),
        };
        let mut set = CloneSet::new(tmp.path(), &cloner);
        let ctx = test_ctx();

        let path = set
            .ensure_cloned(&ctx, "https://github.com/immortalwrt/packages", "")
            .expect("clone");
        assert!(path.ends_with("immortalwrt/packages/@default@"));
        let calls = cloner.calls.lock().expect("lock");
        assert_eq!(calls[0].1, None);
    }

    #[test]
    fn repair_rewrites_luci_include_and_links_zh_cn() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pkg = tmp.path().join("luci-app-example");
        std::fs::create_dir_all(pkg.join("po/zh_Hans")).expect("mkdir");
        std::fs::write(
            pkg.join("Makefile"),
            "include ../../luci.mk\n\n# call BuildPackage\n",
        )
        .expect("write");

        repair_sources(tmp.path()).expect("repair");

        let makefile = std::fs::read_to_string(pkg.join("Makefile")).expect("read");
        assert!(makefile.starts_with("include $(TOPDIR)/feeds/luci/luci.mk\n"));
        let link = std::fs::read_link(pkg.join("po/zh-cn")).expect("link");
        assert_eq!(link, Path::new("zh_Hans"));

        // Running again must not fail on the existing symlink.
        repair_sources(tmp.path()).expect("repair twice");
    }

    #[test]
    fn repair_leaves_native_zh_cn_packages_alone() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pkg = tmp.path().join("luci-app-native");
        std::fs::create_dir_all(pkg.join("po/zh-cn")).expect("mkdir");

        repair_sources(tmp.path()).expect("repair");

        assert!(!pkg.join("po/zh_Hans").exists());
        let meta = std::fs::symlink_metadata(pkg.join("po/zh-cn")).expect("meta");
        assert!(meta.is_dir());
    }
}
