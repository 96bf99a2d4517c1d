use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, mpsc};
use std::time::Instant;

use crate::arch;
use crate::archive;
use crate::error::{Error, Result};
use crate::flavor::{self, FlavorConfig};
use crate::net::{self, Http};
use crate::patch::{self, FeatureFlags};
use crate::rewrite::{LineMatch, Rule, rewrite_lines};
use crate::run::{RunCtx, RunEvent};
use crate::source::{self, CloneSet, GitCloner, RepoKey};
use crate::toolchain::{OpenWrtTree, Toolchain};
use crate::util;
use crate::workspace::{CleanMode, RunPaths};

/// Feeds every run pulls regardless of flavor configuration.
const FIXED_FEEDS: &[(&str, &str)] = &[
    ("https://github.com/immortalwrt/packages", ""),
    ("https://github.com/chenmozhijin/turboacc", "package"),
    ("https://github.com/pymumu/openwrt-smartdns", "master"),
    ("https://github.com/pymumu/luci-app-smartdns", "master"),
];

const IMMORTALWRT_PACKAGES: (&str, &str) = ("https://github.com/immortalwrt/packages", "");
const TURBOACC: (&str, &str) = ("https://github.com/chenmozhijin/turboacc", "package");
const SMARTDNS: (&str, &str) = ("https://github.com/pymumu/openwrt-smartdns", "master");
const LUCI_SMARTDNS: (&str, &str) = ("https://github.com/pymumu/luci-app-smartdns", "master");
const GOLANG_FEED: &str = "https://github.com/sbwml/packages_lang_golang";
const OPENWRT_GIT: &str = "https://github.com/openwrt/openwrt";

/// Where staged extension packages land inside a tree.
const EXTRA_PACKAGE_DIR: &str = "package/extra";

/// First-boot script in the files overlay that carries the tracker list,
/// LAN address and attribution placeholders.
const UCI_DEFAULTS_SCRIPT: &str = "etc/uci-defaults/99-openwrt-prep";

const DEFAULT_COMPILER: &str = "OpenWrt-Prep";
const ATTRIBUTION_PLACEHOLDER: &str = "Compiled by OpenWrt-Prep";

/// AdGuardHome filter subscriptions, keyed by the numeric filename its
/// default configuration expects under `data/filters`.
const ADGUARD_FILTERS: &[(&str, &str)] = &[
    (
        "1628750870.txt",
        "https://adguardteam.github.io/AdGuardSDNSFilter/Filters/filter.txt",
    ),
    ("1628750871.txt", "https://anti-ad.net/easylist.txt"),
    (
        "1677875715.txt",
        "https://easylist-downloads.adblockplus.org/easylist.txt",
    ),
    (
        "1677875716.txt",
        "https://easylist-downloads.adblockplus.org/easylistchina.txt",
    ),
    (
        "1677875717.txt",
        "https://raw.githubusercontent.com/cjx82630/cjxlist/master/cjx-annoyance.txt",
    ),
    (
        "1677875718.txt",
        "https://raw.githubusercontent.com/zsakvo/AdGuard-Custom-Rule/master/rule/zhihu-strict.txt",
    ),
    (
        "1677875720.txt",
        "https://gist.githubusercontent.com/Ewpratten/a25ae63a7200c02c850fede2f32453cf/raw/b9318009399b99e822515d388b8458557d828c37/hosts-yt-ads",
    ),
    (
        "1677875724.txt",
        "https://raw.githubusercontent.com/banbendalao/ADgk/master/ADgk.txt",
    ),
    (
        "1677875725.txt",
        "https://www.i-dont-care-about-cookies.eu/abp/",
    ),
    (
        "1677875726.txt",
        "https://raw.githubusercontent.com/jdlingyu/ad-wars/master/hosts",
    ),
    (
        "1677875727.txt",
        "https://raw.githubusercontent.com/Goooler/1024_hosts/master/hosts",
    ),
    ("1677875728.txt", "https://winhelp2002.mvps.org/hosts.txt"),
    (
        "1677875733.txt",
        "https://raw.githubusercontent.com/hl2guide/Filterlist-for-AdGuard/master/filter_whitelist.txt",
    ),
    (
        "1677875734.txt",
        "https://raw.githubusercontent.com/hg1978/AdGuard-Home-Whitelist/master/whitelist.txt",
    ),
    (
        "1677875735.txt",
        "https://raw.githubusercontent.com/mmotti/adguard-home-filters/master/whitelist.txt",
    ),
    (
        "1677875737.txt",
        "https://raw.githubusercontent.com/liwenjie119/adg-rules/master/white.txt",
    ),
    (
        "1677875739.txt",
        "https://raw.githubusercontent.com/JamesDamp/AdGuard-Home---Personal-Whitelist/master/AdGuardHome-Whitelist.txt",
    ),
];

/// External services the pipeline talks to. A single override point so
/// tests can park everything on a local mock server.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub github_api: String,
    pub clash_core_base: String,
    pub tracker_list: String,
    pub dns_list: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            github_api: "https://api.github.com".to_string(),
            clash_core_base: "https://raw.githubusercontent.com/vernesong/OpenClash/core/master"
                .to_string(),
            tracker_list: "https://github.com/XIU2/TrackersListCollection/raw/master/all_aria2.txt"
                .to_string(),
            dns_list:
                "https://raw.githubusercontent.com/chenmozhijin/AdGuardHome-Rules/main/AdGuardHome-dnslist(by%20cmzj).yaml"
                    .to_string(),
        }
    }
}

/// The machine-readable job matrix handed to a downstream matrix build.
pub fn matrix_json(flavors: &BTreeMap<String, FlavorConfig>) -> Result<String> {
    let mut include = Vec::with_capacity(flavors.len());
    for (name, config) in flavors {
        let blob = serde_json::to_string(config)
            .map_err(|e| Error::msg(format!("serializing flavor '{name}': {e}")))?;
        include.push(serde_json::json!({ "name": name, "config": blob }));
    }
    serde_json::to_string(&serde_json::json!({ "include": include }))
        .map_err(|e| Error::msg(format!("serializing matrix: {e}")))
}

/// Everything a per-flavor job needs beyond its own tree: shared clones,
/// the staged files overlay and the external endpoints. Read-only once
/// fan-out starts.
pub struct JobContext {
    pub http: Http,
    pub endpoints: Arc<Endpoints>,
    pub clones: Arc<BTreeMap<RepoKey, PathBuf>>,
    pub overlay_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub compiler: String,
    pub github_token: Option<String>,
}

impl JobContext {
    fn clone_path(&self, url: &str, branch: &str) -> Result<&Path> {
        self.clones
            .get(&(url.to_string(), branch.to_string()))
            .map(PathBuf::as_path)
            .ok_or_else(|| Error::msg(format!("repository {url} (branch '{branch}') was not cloned")))
    }
}

pub struct Coordinator {
    pub paths: RunPaths,
    pub endpoints: Endpoints,
    pub clean: CleanMode,
    /// 0 means one worker per flavor.
    pub max_parallel: usize,
    pub compiler: Option<String>,
    pub github_repo_owner: Option<String>,
    pub github_token: Option<String>,
}

impl Coordinator {
    /// The full pipeline: parse, clone, repair, fan out, fan in.
    pub fn run(&self, ctx: &RunCtx, configs_dir: &Path) -> Result<()> {
        let result = self.run_inner(ctx, configs_dir);
        ctx.sink.emit(RunEvent::RunDone {
            ok: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }

    fn run_inner(&self, ctx: &RunCtx, configs_dir: &Path) -> Result<()> {
        let mut flavors = flavor::discover(configs_dir)?;
        self.paths.init(self.clean)?;
        let http = Http::new()?;

        let clones = self.clone_sources(ctx, &flavors)?;
        self.repair_ext_sources(ctx, &flavors, &clones)?;
        self.bootstrap_trees(ctx, &flavors, &clones)?;

        let overlay_dir = self.stage_overlay(ctx, &http)?;
        let compiler = self.resolve_compiler(ctx, &http);
        ctx.log(&format!("attributing builds to {compiler}"));

        let first_err = self.fan_out(ctx, &http, &mut flavors, &clones, &overlay_dir, &compiler);
        if let Some(e) = first_err {
            return Err(e);
        }

        let matrix = matrix_json(&flavors)?;
        util::write_text(&self.paths.uploads_dir.join("matrix.json"), &matrix)?;
        self.write_manifest(&flavors)
    }

    /// Clones every unique (url, branch) pair exactly once: the fixed
    /// feeds, each flavor's extension packages, and the golang feed at
    /// each requested version.
    fn clone_sources(
        &self,
        ctx: &RunCtx,
        flavors: &BTreeMap<String, FlavorConfig>,
    ) -> Result<BTreeMap<RepoKey, PathBuf>> {
        let cloner = GitCloner;
        let mut set = CloneSet::new(&self.paths.repos_dir, &cloner);
        for (url, branch) in FIXED_FEEDS {
            set.ensure_cloned(ctx, url, branch)?;
        }
        for config in flavors.values() {
            for pkg in config.extpackages.values() {
                set.ensure_cloned(ctx, &pkg.repository, &pkg.branch)?;
            }
            set.ensure_cloned(ctx, GOLANG_FEED, &config.openwrtext.golang_version)?;
        }
        Ok(set.into_map())
    }

    /// Repairs every staged extension package source in place before any
    /// tree sees it.
    fn repair_ext_sources(
        &self,
        ctx: &RunCtx,
        flavors: &BTreeMap<String, FlavorConfig>,
        clones: &BTreeMap<RepoKey, PathBuf>,
    ) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for config in flavors.values() {
            for pkg in config.extpackages.values() {
                let key = (pkg.repository.clone(), pkg.branch.clone());
                let Some(base) = clones.get(&key) else {
                    continue;
                };
                let dir = if pkg.path.is_empty() {
                    base.clone()
                } else {
                    base.join(&pkg.path)
                };
                if seen.insert(dir.clone()) {
                    ctx.log(&format!("repairing package source {}", dir.display()));
                    source::repair_sources(&dir)?;
                }
            }
        }
        Ok(())
    }

    /// Clones the OpenWrt tree once, updates its feeds, swaps in the
    /// replacement netdata and smartdns packages, then copies the tree per
    /// remaining flavor and checks out each flavor's configured ref.
    fn bootstrap_trees(
        &self,
        ctx: &RunCtx,
        flavors: &BTreeMap<String, FlavorConfig>,
        clones: &BTreeMap<RepoKey, PathBuf>,
    ) -> Result<()> {
        let mut names = flavors.keys();
        let first = names
            .next()
            .ok_or_else(|| Error::config("no flavors to prepare"))?;
        let first_tree = self.paths.tree_dir(first);

        ctx.log("cloning OpenWrt source");
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg(OPENWRT_GIT).arg(&first_tree);
        ctx.run_cmd(cmd)?;

        let tree = OpenWrtTree::new(&first_tree);
        tree.update_feeds(ctx)?;

        ctx.log("replacing vendored netdata and smartdns packages");
        replace_dir(
            &clone_lookup(clones, IMMORTALWRT_PACKAGES)?.join("admin/netdata"),
            &first_tree.join("feeds/admin/netdata"),
        )?;
        replace_dir(
            clone_lookup(clones, LUCI_SMARTDNS)?,
            &first_tree.join("feeds/luci/applications/luci-app-smartdns"),
        )?;
        replace_dir(
            clone_lookup(clones, SMARTDNS)?,
            &first_tree.join("feeds/packages/net/smartdns"),
        )?;

        for name in names {
            ctx.log(&format!("copying tree for flavor '{name}'"));
            util::copy_tree(&first_tree, &self.paths.tree_dir(name))?;
        }

        for (name, config) in flavors {
            let reference = config.compile.openwrt_ref.trim();
            if reference.is_empty() {
                continue;
            }
            ctx.log(&format!("checking out '{reference}' for flavor '{name}'"));
            let mut cmd = Command::new("git");
            cmd.arg("checkout")
                .arg(reference)
                .current_dir(self.paths.tree_dir(name));
            ctx.run_cmd(cmd)?;
        }
        Ok(())
    }

    /// Builds the shared files overlay: the user-provided overlay plus the
    /// downloaded AdGuardHome filter lists and DNS list.
    fn stage_overlay(&self, ctx: &RunCtx, http: &Http) -> Result<PathBuf> {
        let overlay = self.paths.workdir.join("files");
        util::remove_dir_if_exists(&overlay)?;
        if self.paths.files_dir.is_dir() {
            util::copy_tree(&self.paths.files_dir, &overlay)?;
        } else {
            util::ensure_dir(&overlay)?;
        }

        ctx.log("downloading AdGuardHome filter lists");
        let filters_dir = overlay.join("usr/bin/AdGuardHome/data/filters");
        util::ensure_dir(&filters_dir)?;
        let mut tasks = Vec::new();
        for (name, url) in ADGUARD_FILTERS {
            tasks.push(http.fetch(ctx, url, &filters_dir.join(name), net::DEFAULT_RETRIES, None));
        }
        let dns_dest = overlay.join("etc/AdGuardHome-dnslist(by cmzj).yaml");
        util::ensure_dir(&overlay.join("etc"))?;
        tasks.push(http.fetch(
            ctx,
            &self.endpoints.dns_list,
            &dns_dest,
            net::DEFAULT_RETRIES,
            None,
        ));
        http.await_all(ctx, tasks)?;
        Ok(overlay)
    }

    /// The attribution name: explicit override, else the GitHub profile
    /// name of the configured owner, else the owner login itself.
    fn resolve_compiler(&self, ctx: &RunCtx, http: &Http) -> String {
        if let Some(name) = &self.compiler {
            return name.clone();
        }
        let Some(owner) = &self.github_repo_owner else {
            return DEFAULT_COMPILER.to_string();
        };
        let url = format!(
            "{}/users/{owner}",
            self.endpoints.github_api.trim_end_matches('/')
        );
        http.get_text(ctx, &url, net::DEFAULT_RETRIES)
            .and_then(|body| serde_json::from_str::<serde_json::Value>(&body).ok())
            .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_string))
            .unwrap_or_else(|| owner.clone())
    }

    /// Runs one job per flavor over a bounded worker pool. Every job runs
    /// to completion; the first failure is reported after fan-in.
    fn fan_out(
        &self,
        ctx: &RunCtx,
        http: &Http,
        flavors: &mut BTreeMap<String, FlavorConfig>,
        clones: &BTreeMap<RepoKey, PathBuf>,
        overlay_dir: &Path,
        compiler: &str,
    ) -> Option<Error> {
        let total = flavors.len();
        let width = match self.max_parallel {
            0 => total,
            n => n.min(total),
        }
        .max(1);
        ctx.log(&format!("preparing {total} flavor(s), {width} at a time"));

        let clones = Arc::new(clones.clone());
        let endpoints = Arc::new(self.endpoints.clone());
        let mut queue: Vec<FlavorConfig> =
            std::mem::take(flavors).into_values().collect();
        queue.reverse();

        type JobResult = (String, Result<(FlavorConfig, PathBuf)>, u128);
        let (tx, rx) = mpsc::channel::<JobResult>();
        let mut running: BTreeMap<String, std::thread::JoinHandle<()>> = BTreeMap::new();
        let mut first_err: Option<Error> = None;
        let mut done = 0usize;

        while done < total {
            while running.len() < width {
                let Some(mut config) = queue.pop() else {
                    break;
                };
                let name = config.name.clone();
                ctx.sink.emit(RunEvent::JobSpawned { job: name.clone() });
                let job = JobContext {
                    http: http.clone(),
                    endpoints: Arc::clone(&endpoints),
                    clones: Arc::clone(&clones),
                    overlay_dir: overlay_dir.to_path_buf(),
                    upload_dir: self.paths.upload_dir(&name),
                    compiler: compiler.to_string(),
                    github_token: self.github_token.clone(),
                };
                let job_ctx = ctx.for_job(&name);
                let tree_dir = self.paths.tree_dir(&name);
                let tx = tx.clone();
                let thread_name = name.clone();
                let handle = std::thread::spawn(move || {
                    let start = Instant::now();
                    let toolchain = OpenWrtTree::new(tree_dir);
                    let result = prepare_flavor(&job_ctx, &job, &mut config, &toolchain)
                        .map(|archive| (config, archive));
                    let _ = tx.send((thread_name, result, start.elapsed().as_millis()));
                });
                running.insert(name, handle);
            }

            let Ok((name, result, elapsed_ms)) = rx.recv() else {
                break;
            };
            if let Some(handle) = running.remove(&name)
                && handle.join().is_err()
                && first_err.is_none()
            {
                first_err = Some(Error::msg(format!("job '{name}' panicked")));
            }
            done += 1;
            match result {
                Ok((config, archive)) => {
                    ctx.sink.emit(RunEvent::JobFinished {
                        job: name.clone(),
                        ok: true,
                        error: None,
                        elapsed_ms,
                    });
                    ctx.log(&format!("{name}: archive at {}", archive.display()));
                    flavors.insert(name, config);
                }
                Err(e) => {
                    ctx.sink.emit(RunEvent::JobFinished {
                        job: name.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                        elapsed_ms,
                    });
                    if first_err.is_none() {
                        first_err = Some(Error::msg(format!("flavor '{name}' failed: {e}")));
                    }
                }
            }
        }
        first_err
    }

    fn write_manifest(&self, flavors: &BTreeMap<String, FlavorConfig>) -> Result<()> {
        let manifest = serde_json::json!({
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "flavors": flavors.keys().collect::<Vec<_>>(),
            "archives": flavors
                .keys()
                .map(|name| self.paths.upload_dir(name).join("openwrt-source.tar.gz"))
                .collect::<Vec<_>>(),
        });
        let text = serde_json::to_string_pretty(&manifest)
            .map_err(|e| Error::msg(format!("serializing manifest: {e}")))?;
        util::write_text(&self.paths.uploads_dir.join("manifest.json"), &text)
    }
}

fn replace_dir(src: &Path, dest: &Path) -> Result<()> {
    util::remove_dir_if_exists(dest)?;
    util::copy_tree(src, dest)
}

fn clone_lookup<'a>(
    clones: &'a BTreeMap<RepoKey, PathBuf>,
    key: (&str, &str),
) -> Result<&'a Path> {
    clones
        .get(&(key.0.to_string(), key.1.to_string()))
        .map(PathBuf::as_path)
        .ok_or_else(|| Error::msg(format!("repository {} was not cloned", key.0)))
}

/// Prepares a single flavor's tree end to end and packs it. The returned
/// path is the flavor's source archive; `config.openwrt` is replaced with
/// the expanded config diff along the way.
pub fn prepare_flavor(
    ctx: &RunCtx,
    job: &JobContext,
    config: &mut FlavorConfig,
    toolchain: &dyn Toolchain,
) -> Result<PathBuf> {
    ctx.phase("Init");

    toolchain.install_feeds(ctx)?;
    toolchain.fix_known_issues(ctx)?;
    ctx.phase("FeedsRepaired");

    stage_packages(ctx, job, config, toolchain)?;
    ctx.phase("PackagesStaged");

    toolchain.apply_config(&config.openwrt)?;
    toolchain.materialize_defconfig(ctx)?;
    config.openwrt = toolchain.applied_config_diff(ctx)?;
    ctx.phase("ConfigApplied");

    apply_patches(ctx, job, toolchain)?;
    ctx.phase("PatchesApplied");

    let files_dir = toolchain.root().join("files");
    util::copy_tree(&job.overlay_dir, &files_dir)?;
    resolve_assets(ctx, job, toolchain, &files_dir)?;
    ctx.phase("AssetsResolved");

    rewrite_generated_files(ctx, job, config, toolchain, &files_dir)?;
    ctx.phase("FilesRewritten");

    let archive_path = job.upload_dir.join("openwrt-source.tar.gz");
    ctx.log("packing source archive");
    archive::pack(toolchain.root(), &archive_path, "openwrt")?;
    ctx.phase("Archived");
    Ok(archive_path)
}

/// Copies the flavor's extension packages into the tree and swaps the
/// golang feed for the pinned version.
fn stage_packages(
    ctx: &RunCtx,
    job: &JobContext,
    config: &FlavorConfig,
    toolchain: &dyn Toolchain,
) -> Result<()> {
    for (name, pkg) in &config.extpackages {
        let src = job.clone_path(&pkg.repository, &pkg.branch)?.join(&pkg.path);
        let dest = toolchain.root().join(EXTRA_PACKAGE_DIR).join(name);
        ctx.log(&format!("staging package {name}"));
        util::copy_tree(&src, &dest)?;
        util::remove_dir_if_exists(&dest.join(".git"))?;
    }

    let golang_src = job.clone_path(GOLANG_FEED, &config.openwrtext.golang_version)?;
    replace_dir(
        golang_src,
        &toolchain.root().join("feeds/packages/lang/golang"),
    )
}

/// Selects kernel patches from the merged configuration and applies them
/// to the tree: patch files, kernel config directives, and version-pinned
/// package replacements from the acceleration repo.
fn apply_patches(ctx: &RunCtx, job: &JobContext, toolchain: &dyn Toolchain) -> Result<()> {
    let flags = FeatureFlags::detect(toolchain);
    if flags == FeatureFlags::default() {
        ctx.log("no acceleration features selected");
        return Ok(());
    }

    let turboacc_dir = job.clone_path(TURBOACC.0, TURBOACC.1)?;
    let versions = patch::read_versions(turboacc_dir)?;
    let kernel_version = toolchain.kernel_version()?;
    let plan = patch::select(&kernel_version, flags, &versions)?;

    let generic_dir = toolchain.root().join("target/linux/generic");
    for file in &plan.patches {
        let stage_dir = file.stage.dir(&kernel_version);
        let src = turboacc_dir.join(&stage_dir).join(&file.name);
        let dest_dir = generic_dir.join(&stage_dir);
        ctx.log(&format!("applying patch {}", file.name));
        util::ensure_dir(&dest_dir)?;
        std::fs::copy(&src, dest_dir.join(&file.name))
            .map_err(|e| Error::filesystem(format!("copying {}: {e}", src.display())))?;
    }
    for directive in &plan.kernel_directives {
        util::append_text(
            &generic_dir.join(format!("config-{kernel_version}")),
            &format!("\n{directive}"),
        )?;
    }
    for replacement in &plan.replacements {
        ctx.log(&format!("replacing {}", replacement.dest_rel));
        replace_dir(
            &turboacc_dir.join(&replacement.source_dir),
            &toolchain.root().join(&replacement.dest_rel),
        )?;
    }
    Ok(())
}

/// Downloads and unpacks the architecture-specific cores into the files
/// overlay, each gated on its companion package being selected.
fn resolve_assets(
    ctx: &RunCtx,
    job: &JobContext,
    toolchain: &dyn Toolchain,
    files_dir: &Path,
) -> Result<()> {
    let (arch, abi) = toolchain.target_architecture()?;
    let tokens = arch::resolve(&arch, abi.as_deref());

    let scratch = tempfile::tempdir()
        .map_err(|e| Error::filesystem(format!("failed to create scratch dir: {e}")))?;
    let mut tasks = Vec::new();

    let adguard_bundle = scratch.path().join("AdGuardHome.tar.gz");
    if let Some(token) = &tokens.adguard
        && toolchain.package_setting("luci-app-adguardhome").as_deref() == Some("y")
    {
        ctx.log(&format!("fetching AdGuardHome core for {token}"));
        let wanted = format!("AdGuardHome_linux_{token}.tar.gz");
        let release = job.http.latest_release(
            ctx,
            &job.endpoints.github_api,
            "AdguardTeam/AdGuardHome",
            job.github_token.as_deref(),
        );
        let url = release.as_ref().and_then(|r| {
            r.get("assets")?.as_array()?.iter().find_map(|asset| {
                (asset.get("name")?.as_str()? == wanted)
                    .then(|| asset.get("browser_download_url")?.as_str().map(str::to_string))
                    .flatten()
            })
        });
        match url {
            // The big binary bundle is worth splitting into ranges.
            Some(url) => {
                let threads = num_cpus::get().clamp(1, 4);
                job.http
                    .fetch_chunked(ctx, &url, &adguard_bundle, None, threads)?;
            }
            None => ctx.log("no matching AdGuardHome release asset"),
        }
    }

    let clash_tun_gz = scratch.path().join("clash_tun.gz");
    let clash_meta_bundle = scratch.path().join("clash_meta.tar.gz");
    let clash_bundle = scratch.path().join("clash.tar.gz");
    if let Some(token) = &tokens.clash
        && toolchain.package_setting("luci-app-openclash").as_deref() == Some("y")
    {
        ctx.log(&format!("fetching OpenClash cores for {token}"));
        let base = job.endpoints.clash_core_base.trim_end_matches('/');
        let tun_version = job
            .http
            .get_text(ctx, &format!("{base}/core_version"), net::DEFAULT_RETRIES)
            .and_then(|text| text.lines().nth(1).map(str::to_string));
        if let Some(tun) = tun_version {
            tasks.push(job.http.fetch(
                ctx,
                &format!("{base}/premium/clash-{token}-{tun}.gz"),
                &clash_tun_gz,
                net::DEFAULT_RETRIES,
                None,
            ));
        }
        tasks.push(job.http.fetch(
            ctx,
            &format!("{base}/meta/clash-{token}.tar.gz"),
            &clash_meta_bundle,
            net::DEFAULT_RETRIES,
            None,
        ));
        tasks.push(job.http.fetch(
            ctx,
            &format!("{base}/dev/clash-{token}.tar.gz"),
            &clash_bundle,
            net::DEFAULT_RETRIES,
            None,
        ));
    }

    job.http.await_all(ctx, tasks)?;

    if adguard_bundle.is_file() {
        archive::extract_member(
            &adguard_bundle,
            "./AdGuardHome/AdGuardHome",
            &files_dir.join("usr/bin/AdGuardHome/AdGuardHome"),
            true,
        )?;
    }
    let core_dir = files_dir.join("etc/openclash/core");
    if clash_tun_gz.is_file() {
        archive::gunzip_file(&clash_tun_gz, &core_dir.join("clash_tun"), true)?;
    }
    if clash_meta_bundle.is_file() {
        archive::extract_member(&clash_meta_bundle, "clash", &core_dir.join("clash_meta"), true)?;
    }
    if clash_bundle.is_file() {
        archive::extract_member(&clash_bundle, "clash", &core_dir.join("clash"), true)?;
    }
    Ok(())
}

/// Rewrites the generated placeholder text: tracker list, LAN address and
/// attribution in the first-boot script; hostname and timezone defaults in
/// `config_generate`.
fn rewrite_generated_files(
    ctx: &RunCtx,
    job: &JobContext,
    config: &FlavorConfig,
    toolchain: &dyn Toolchain,
    files_dir: &Path,
) -> Result<()> {
    let script = files_dir.join(UCI_DEFAULTS_SCRIPT);
    if script.is_file() {
        let mut rules = vec![
            Rule::replace_line(
                LineMatch::Prefix("uci set network.lan.ipaddr=".to_string()),
                format!("uci set network.lan.ipaddr='{}'", config.openwrtext.ipaddr),
            ),
            Rule::replace_within(
                ATTRIBUTION_PLACEHOLDER,
                format!("Compiled by {}", job.compiler),
            ),
        ];
        if let Some(trackers) = job
            .http
            .get_text(ctx, &job.endpoints.tracker_list, net::DEFAULT_RETRIES)
        {
            rules.push(Rule::replace_line(
                LineMatch::Prefix("  uci set aria2.main.bt_tracker=".to_string()),
                format!("  uci set aria2.main.bt_tracker='{}'", trackers.trim()),
            ));
        }
        let text = util::read_text(&script)?;
        util::write_text(&script, &rewrite_lines(&text, &rules))?;
    } else {
        ctx.log("files overlay carries no first-boot script, skipping rewrite");
    }

    let config_generate = toolchain
        .root()
        .join("package/base-files/files/bin/config_generate");
    let rules = [
        Rule::replace_within(
            "set system.@system[-1].hostname='OpenWrt'",
            "set system.@system[-1].hostname='OpenWrt-k'",
        ),
        Rule {
            matcher: LineMatch::Contains("set system.@system[-1].timezone='UTC'".to_string()),
            edit: crate::rewrite::Edit::ReplaceWithinAppend {
                needle: "set system.@system[-1].timezone='UTC'".to_string(),
                replacement: format!(
                    "set system.@system[-1].timezone='{}'",
                    config.openwrtext.timezone
                ),
                extra: format!(
                    "\t\tset system.@system[-1].zonename='{}'",
                    config.openwrtext.zonename
                ),
            },
        },
    ];
    crate::rewrite::rewrite_file(&config_generate, &rules)
}
