use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::run::RunCtx;
use crate::source;
use crate::util;

/// Operations a per-flavor job needs from its OpenWrt checkout. A trait
/// so job logic can be driven against a recording fake without a real
/// buildroot on disk.
pub trait Toolchain: Send {
    fn root(&self) -> &Path;
    fn update_feeds(&self, ctx: &RunCtx) -> Result<()>;
    fn install_feeds(&self, ctx: &RunCtx) -> Result<()>;
    /// Post-install cleanup of known-broken feed and package sources.
    fn fix_known_issues(&self, ctx: &RunCtx) -> Result<()>;
    /// Overwrites `.config` with the given seed text.
    fn apply_config(&self, text: &str) -> Result<()>;
    /// Expands the seed into a full `.config` via `make defconfig`.
    fn materialize_defconfig(&self, ctx: &RunCtx) -> Result<()>;
    /// The minimal diff of the expanded config against the defaults.
    fn applied_config_diff(&self, ctx: &RunCtx) -> Result<String>;
    fn kernel_version(&self) -> Result<String>;
    /// `y`/`m`/value of `CONFIG_PACKAGE_<name>`, `None` when unset.
    fn package_setting(&self, name: &str) -> Option<String>;
    /// `(arch, abi_version)` from `CONFIG_ARCH` and the arm sub-arch
    /// symbol when present.
    fn target_architecture(&self) -> Result<(String, Option<String>)>;
}

/// A checked-out OpenWrt buildroot on disk.
pub struct OpenWrtTree {
    root: PathBuf,
}

impl OpenWrtTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn feeds_cmd(&self, arg: &str) -> Command {
        let mut cmd = Command::new("./scripts/feeds");
        cmd.arg(arg).arg("-a").current_dir(&self.root);
        cmd
    }

    fn dot_config(&self) -> Result<String> {
        util::read_text(&self.root.join(".config"))
    }

    fn config_value(&self, symbol: &str) -> Option<String> {
        let prefix = format!("CONFIG_{symbol}=");
        let config = self.dot_config().ok()?;
        config.lines().find_map(|line| {
            line.strip_prefix(&prefix)
                .map(|v| v.trim_matches('"').to_string())
        })
    }
}

impl Toolchain for OpenWrtTree {
    fn root(&self) -> &Path {
        &self.root
    }

    fn update_feeds(&self, ctx: &RunCtx) -> Result<()> {
        ctx.run_cmd(self.feeds_cmd("update"))
    }

    fn install_feeds(&self, ctx: &RunCtx) -> Result<()> {
        ctx.run_cmd(self.feeds_cmd("install"))
    }

    fn fix_known_issues(&self, ctx: &RunCtx) -> Result<()> {
        ctx.log("repairing package sources");
        source::repair_sources(&self.root.join("package"))
    }

    fn apply_config(&self, text: &str) -> Result<()> {
        util::write_text(&self.root.join(".config"), text)
    }

    fn materialize_defconfig(&self, ctx: &RunCtx) -> Result<()> {
        let mut cmd = Command::new("make");
        cmd.arg("defconfig").current_dir(&self.root);
        ctx.run_cmd(cmd)
    }

    fn applied_config_diff(&self, _ctx: &RunCtx) -> Result<String> {
        let output = Command::new("./scripts/diffconfig.sh")
            .current_dir(&self.root)
            .output()
            .map_err(|e| Error::msg(format!("failed to spawn diffconfig.sh: {e}")))?;
        if !output.status.success() {
            return Err(Error::msg(format!(
                "diffconfig.sh exited with {}",
                output.status
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|e| Error::msg(format!("diffconfig.sh produced non-utf8 output: {e}")))
    }

    fn kernel_version(&self) -> Result<String> {
        let config = self.dot_config()?;
        let found = config.lines().find_map(|line| {
            line.strip_prefix("CONFIG_LINUX_")
                .and_then(|rest| rest.strip_suffix("=y"))
                .map(|version| version.replace('_', "."))
        });
        found.ok_or_else(|| {
            Error::config(format!(
                "no CONFIG_LINUX_<version>=y symbol in {}",
                self.root.join(".config").display()
            ))
        })
    }

    fn package_setting(&self, name: &str) -> Option<String> {
        self.config_value(&format!("PACKAGE_{name}"))
    }

    fn target_architecture(&self) -> Result<(String, Option<String>)> {
        let arch = self.config_value("ARCH").ok_or_else(|| {
            Error::config(format!(
                "no CONFIG_ARCH symbol in {}",
                self.root.join(".config").display()
            ))
        })?;
        let abi = (1..=9)
            .find(|v| self.config_value(&format!("arm_v{v}")).is_some())
            .map(|v| v.to_string());
        Ok((arch, abi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with_config(config: &str) -> (tempfile::TempDir, OpenWrtTree) {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join(".config"), config).expect("write");
        let tree = OpenWrtTree::new(tmp.path());
        (tmp, tree)
    }

    #[test]
    fn reads_kernel_version_from_config() {
        let (_tmp, tree) = tree_with_config(
            "CONFIG_TARGET_x86=y\nCONFIG_LINUX_6_1=y\n# CONFIG_LINUX_5_15 is not set\n",
        );
        assert_eq!(tree.kernel_version().expect("version"), "6.1");
    }

    #[test]
    fn missing_kernel_symbol_is_an_error() {
        let (_tmp, tree) = tree_with_config("CONFIG_TARGET_x86=y\n");
        assert!(tree.kernel_version().is_err());
    }

    #[test]
    fn package_setting_strips_quotes_and_prefix() {
        let (_tmp, tree) = tree_with_config(
            "CONFIG_PACKAGE_luci-app-openclash=y\nCONFIG_PACKAGE_kmod-nft-fullcone=m\n",
        );
        assert_eq!(
            tree.package_setting("luci-app-openclash").as_deref(),
            Some("y")
        );
        assert_eq!(
            tree.package_setting("kmod-nft-fullcone").as_deref(),
            Some("m")
        );
        assert_eq!(tree.package_setting("luci-app-adguardhome"), None);
    }

    #[test]
    fn arm_abi_version_comes_from_subarch_symbol() {
        let (_tmp, tree) =
            tree_with_config("CONFIG_ARCH=\"arm\"\nCONFIG_arm_v7=y\n");
        let (arch, abi) = tree.target_architecture().expect("arch");
        assert_eq!(arch, "arm");
        assert_eq!(abi.as_deref(), Some("7"));
    }

    #[test]
    fn non_arm_arch_has_no_abi() {
        let (_tmp, tree) = tree_with_config("CONFIG_ARCH=\"x86_64\"\n");
        let (arch, abi) = tree.target_architecture().expect("arch");
        assert_eq!(arch, "x86_64");
        assert_eq!(abi, None);
    }
}
