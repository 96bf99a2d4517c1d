use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::flavor;
use crate::toolchain::Toolchain;

/// Kernel-module packages whose selection enables shortcut forwarding.
const SFE_PACKAGES: &[&str] = &[
    "kmod-shortcut-fe",
    "kmod-shortcut-fe-drv",
    "kmod-shortcut-fe-cm",
    "kmod-fast-classifier",
];

const FULLCONE_PACKAGE: &str = "kmod-nft-fullcone";

/// Keys of the acceleration repository's version-declaration file.
pub const VERSION_KEYS: &[&str] = &["FIREWALL4_VERSION", "NFTABLES_VERSION", "LIBNFTNL_VERSION"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    pub shortcut_forwarding: bool,
    pub full_cone_nat: bool,
}

impl FeatureFlags {
    /// Derives the flags from the merged configuration: a feature counts
    /// as enabled when any of its kernel-module packages is built-in or
    /// modular.
    pub fn detect(toolchain: &dyn Toolchain) -> FeatureFlags {
        let enabled = |pkg: &str| {
            matches!(
                toolchain.package_setting(pkg).as_deref(),
                Some("y") | Some("m")
            )
        };
        FeatureFlags {
            shortcut_forwarding: SFE_PACKAGES.iter().any(|p| enabled(p)),
            full_cone_nat: enabled(FULLCONE_PACKAGE),
        }
    }
}

/// Which patch staging area a file comes from / goes to, relative to the
/// acceleration repo and to `target/linux/generic` respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchStage {
    Hack,
    Pending,
}

impl PatchStage {
    pub fn dir(self, kernel_version: &str) -> String {
        match self {
            PatchStage::Hack => format!("hack-{kernel_version}"),
            PatchStage::Pending => format!("pending-{kernel_version}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchFile {
    pub stage: PatchStage,
    pub name: String,
}

/// Wholesale swap of a vendored package for a version-pinned copy from
/// the acceleration repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageReplacement {
    /// Directory in the acceleration repo, e.g. `libnftnl-1.2.6`.
    pub source_dir: String,
    /// Destination relative to the OpenWrt tree root.
    pub dest_rel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    pub patches: Vec<PatchFile>,
    pub kernel_directives: Vec<String>,
    pub replacements: Vec<PackageReplacement>,
}

impl PatchPlan {
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.kernel_directives.is_empty() && self.replacements.is_empty()
    }
}

struct Rule {
    applies: fn(FeatureFlags) -> bool,
    extend: fn(&mut PatchPlan, &str, &BTreeMap<String, String>) -> Result<()>,
}

/// The patch policy as an explicit ordered rule table. Rows are
/// independent: every row whose predicate holds contributes its actions.
const RULES: &[Rule] = &[
    Rule {
        applies: |f| f.shortcut_forwarding || f.full_cone_nat,
        extend: |plan, kernel_version, _| {
            // 5.10 kernels ship the variant without the "-add" infix.
            let infix = if kernel_version == "5.10" { "" } else { "-add" };
            plan.patches.push(PatchFile {
                stage: PatchStage::Hack,
                name: format!(
                    "952{infix}-net-conntrack-events-support-multiple-registrant.patch"
                ),
            });
            plan.kernel_directives
                .push("# CONFIG_NF_CONNTRACK_CHAIN_EVENTS is not set".to_string());
            Ok(())
        },
    },
    Rule {
        applies: |f| f.shortcut_forwarding,
        extend: |plan, _, _| {
            plan.patches.push(PatchFile {
                stage: PatchStage::Hack,
                name: "953-net-patch-linux-kernel-to-support-shortcut-fe.patch".to_string(),
            });
            plan.patches.push(PatchFile {
                stage: PatchStage::Pending,
                name: "613-netfilter_optional_tcp_window_check.patch".to_string(),
            });
            plan.kernel_directives
                .push("CONFIG_SHORTCUT_FE=y".to_string());
            Ok(())
        },
    },
    Rule {
        applies: |f| f.full_cone_nat,
        extend: |plan, _, versions| {
            for (key, dest_rel) in [
                ("LIBNFTNL_VERSION", "package/libs/libnftnl"),
                ("FIREWALL4_VERSION", "package/network/config/firewall4"),
                ("NFTABLES_VERSION", "package/network/utils/nftables"),
            ] {
                let version = versions.get(key).ok_or_else(|| {
                    Error::config(format!(
                        "acceleration repo version file is missing {key}"
                    ))
                })?;
                let base = dest_rel.rsplit('/').next().expect("non-empty path");
                plan.replacements.push(PackageReplacement {
                    source_dir: format!("{base}-{version}"),
                    dest_rel: dest_rel.to_string(),
                });
            }
            Ok(())
        },
    },
];

/// Evaluates the rule table against the detected flags. Pure: applying
/// the resulting plan to a tree is the coordinator's job.
pub fn select(
    kernel_version: &str,
    flags: FeatureFlags,
    versions: &BTreeMap<String, String>,
) -> Result<PatchPlan> {
    let mut plan = PatchPlan::default();
    for rule in RULES {
        if (rule.applies)(flags) {
            (rule.extend)(&mut plan, kernel_version, versions)?;
        }
    }
    Ok(plan)
}

/// Reads FIREWALL4/NFTABLES/LIBNFTNL pins from the acceleration repo's
/// own version-declaration file.
pub fn read_versions(repo_dir: &Path) -> Result<BTreeMap<String, String>> {
    flavor::parse_kv(&repo_dir.join("version"), VERSION_KEYS)
}
