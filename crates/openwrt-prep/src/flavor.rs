use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory inside each flavor dir holding the settings files.
pub const SETTINGS_DIR: &str = "OpenWrt-K";

const CACHE_DIRECTIVES: &str = "CONFIG_DEVEL=y\nCONFIG_CCACHE=y";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileConfig {
    /// OpenWrt tag or branch to check out; empty means "leave HEAD alone".
    #[serde(rename = "openwrt_tag/branch", default)]
    pub openwrt_ref: String,
    #[serde(default)]
    pub kmod_compile_exclude_list: String,
    #[serde(default)]
    pub use_cache: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenwrtExt {
    pub ipaddr: String,
    pub timezone: String,
    pub zonename: String,
    pub golang_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtPackage {
    pub repository: String,
    pub branch: String,
    pub path: String,
}

/// One firmware flavor: parsed once at discovery time, threaded through
/// the whole pipeline. `openwrt` starts as the concatenated fragment blob
/// and is replaced with the toolchain's defconfig diff after apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorConfig {
    pub name: String,
    pub path: PathBuf,
    pub compile: CompileConfig,
    pub openwrtext: OpenwrtExt,
    pub extpackages: BTreeMap<String, ExtPackage>,
    pub openwrt: String,
}

/// Extracts a requested subset of `KEY=value` lines. Values may be
/// double-quoted; unrecognized keys and `#` comments are ignored.
pub fn parse_kv(path: &Path, keys: &[&str]) -> Result<BTreeMap<String, String>> {
    let data = fs::read_to_string(path)
        .map_err(|e| Error::filesystem(format!("failed to read {}: {e}", path.display())))?;
    let mut out = BTreeMap::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if !keys.contains(&key) {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

fn required<'a>(
    kv: &'a BTreeMap<String, String>,
    key: &str,
    flavor: &str,
    file: &str,
) -> Result<&'a str> {
    kv.get(key).map(String::as_str).ok_or_else(|| {
        Error::config(format!(
            "flavor '{flavor}': missing '{key}' in {file}"
        ))
    })
}

fn parse_compile(flavor: &str, settings_dir: &Path) -> Result<CompileConfig> {
    let path = settings_dir.join("compile.config");
    let kv = parse_kv(
        &path,
        &["openwrt_tag/branch", "kmod_compile_exclude_list", "use_cache"],
    )
    .map_err(|e| Error::config(format!("flavor '{flavor}': {e}")))?;
    Ok(CompileConfig {
        openwrt_ref: kv.get("openwrt_tag/branch").cloned().unwrap_or_default(),
        kmod_compile_exclude_list: kv
            .get("kmod_compile_exclude_list")
            .cloned()
            .unwrap_or_default(),
        use_cache: kv
            .get("use_cache")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    })
}

fn parse_openwrtext(flavor: &str, settings_dir: &Path) -> Result<OpenwrtExt> {
    let path = settings_dir.join("openwrtext.config");
    let kv = parse_kv(&path, &["ipaddr", "timezone", "zonename", "golang_version"])?;
    Ok(OpenwrtExt {
        ipaddr: required(&kv, "ipaddr", flavor, "openwrtext.config")?.to_string(),
        timezone: required(&kv, "timezone", flavor, "openwrtext.config")?.to_string(),
        zonename: required(&kv, "zonename", flavor, "openwrtext.config")?.to_string(),
        golang_version: required(&kv, "golang_version", flavor, "openwrtext.config")?.to_string(),
    })
}

/// Parses the indexed-array declarations
/// `EXT_PACKAGES_<FIELD>[<idx>]="value"`. Every index must declare the
/// full {NAME, PATH, REPOSITORY, BRANCH} set; duplicate package names
/// within one flavor are a configuration error.
pub fn parse_extpackages(flavor: &str, path: &Path) -> Result<BTreeMap<String, ExtPackage>> {
    let mut out = BTreeMap::new();
    if !path.is_file() {
        return Ok(out);
    }
    let data = fs::read_to_string(path)
        .map_err(|e| Error::filesystem(format!("failed to read {}: {e}", path.display())))?;

    let re = Regex::new(
        r#"^EXT_PACKAGES_(?P<key>NAME|PATH|REPOSITORY|BRANCH)\[(?P<id>\d+)\]="(?P<value>.*)"$"#,
    )
    .expect("static regex");

    let mut records: BTreeMap<u64, BTreeMap<String, String>> = BTreeMap::new();
    for line in data.lines() {
        let Some(caps) = re.captures(line.trim()) else {
            continue;
        };
        let id: u64 = caps["id"].parse().map_err(|_| {
            Error::config(format!(
                "flavor '{flavor}': extpackages index out of range: {}",
                &caps["id"]
            ))
        })?;
        records
            .entry(id)
            .or_default()
            .insert(caps["key"].to_string(), caps["value"].to_string());
    }

    for (id, rec) in records {
        for key in ["NAME", "PATH", "REPOSITORY", "BRANCH"] {
            if !rec.contains_key(key) {
                return Err(Error::config(format!(
                    "flavor '{flavor}': extpackages entry {id} is missing {key}"
                )));
            }
        }
        let name = rec["NAME"].clone();
        let pkg = ExtPackage {
            repository: rec["REPOSITORY"].clone(),
            branch: rec["BRANCH"].clone(),
            path: rec["PATH"].clone(),
        };
        if out.insert(name.clone(), pkg).is_some() {
            return Err(Error::config(format!(
                "flavor '{flavor}': duplicate package name in extpackages: {name}"
            )));
        }
    }
    Ok(out)
}

/// Concatenates every `*.config` fragment directly inside the flavor dir,
/// in sorted directory order, one newline between fragments.
fn merge_fragments(dir: &Path) -> Result<String> {
    let mut names: Vec<PathBuf> = Vec::new();
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::filesystem(format!("failed to read dir {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::filesystem(format!("read_dir error: {e}")))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|e| e == "config") {
            names.push(path);
        }
    }
    names.sort();

    let mut blob = String::new();
    for path in names {
        let data = fs::read_to_string(&path)
            .map_err(|e| Error::filesystem(format!("failed to read {}: {e}", path.display())))?;
        blob.push_str(&data);
        blob.push('\n');
    }
    Ok(blob)
}

pub fn parse_flavor(name: &str, dir: &Path) -> Result<FlavorConfig> {
    let settings_dir = dir.join(SETTINGS_DIR);
    if !settings_dir.is_dir() {
        return Err(Error::filesystem(format!(
            "flavor '{name}': settings dir not found: {}",
            settings_dir.display()
        )));
    }

    let compile = parse_compile(name, &settings_dir)?;
    let openwrtext = parse_openwrtext(name, &settings_dir)?;
    let extpackages = parse_extpackages(name, &settings_dir.join("extpackages.config"))?;

    let mut openwrt = merge_fragments(dir)?;
    if compile.use_cache {
        openwrt.push_str(CACHE_DIRECTIVES);
    }

    Ok(FlavorConfig {
        name: name.to_string(),
        path: dir.to_path_buf(),
        compile,
        openwrtext,
        extpackages,
        openwrt,
    })
}

/// Every subdirectory of `configs_dir` that carries a settings dir is one
/// flavor. An empty result is a configuration error: the pipeline has
/// nothing to prepare.
pub fn discover(configs_dir: &Path) -> Result<BTreeMap<String, FlavorConfig>> {
    let mut out = BTreeMap::new();
    let entries = fs::read_dir(configs_dir).map_err(|e| {
        Error::filesystem(format!(
            "failed to read configs dir {}: {e}",
            configs_dir.display()
        ))
    })?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::filesystem(format!("read_dir error: {e}")))?;
        let path = entry.path();
        if !path.is_dir() || !path.join(SETTINGS_DIR).is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        out.insert(name.to_string(), parse_flavor(name, &path)?);
    }
    if out.is_empty() {
        return Err(Error::config(format!(
            "no flavor configurations found under {}",
            configs_dir.display()
        )));
    }
    Ok(out)
}
