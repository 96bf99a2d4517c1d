use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};

use openwrt_prep::Result;
use openwrt_prep::archive;
use openwrt_prep::coordinator::{Endpoints, JobContext, prepare_flavor};
use openwrt_prep::flavor::{ExtPackage, FlavorConfig, OpenwrtExt};
use openwrt_prep::net::Http;
use openwrt_prep::run::{ChannelSink, RunCtx, RunEvent};
use openwrt_prep::toolchain::Toolchain;

const EXT_REPO: &str = "https://github.com/e/luci-app-example";
const GOLANG_REPO: &str = "https://github.com/sbwml/packages_lang_golang";
const TURBOACC_REPO: &str = "https://github.com/chenmozhijin/turboacc";

/// Stands in for a real buildroot: records the lifecycle calls, answers
/// config questions from a fixed table, and never shells out.
struct FakeToolchain {
    root: PathBuf,
    packages: BTreeMap<&'static str, &'static str>,
    calls: Mutex<Vec<&'static str>>,
    applied: Mutex<Option<String>>,
}

impl FakeToolchain {
    fn new(root: &Path, packages: &[(&'static str, &'static str)]) -> Self {
        Self {
            root: root.to_path_buf(),
            packages: packages.iter().copied().collect(),
            calls: Mutex::new(Vec::new()),
            applied: Mutex::new(None),
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("lock").push(call);
    }
}

impl Toolchain for FakeToolchain {
    fn root(&self) -> &Path {
        &self.root
    }

    fn update_feeds(&self, _ctx: &RunCtx) -> Result<()> {
        self.record("update_feeds");
        Ok(())
    }

    fn install_feeds(&self, _ctx: &RunCtx) -> Result<()> {
        self.record("install_feeds");
        Ok(())
    }

    fn fix_known_issues(&self, _ctx: &RunCtx) -> Result<()> {
        self.record("fix_known_issues");
        Ok(())
    }

    fn apply_config(&self, text: &str) -> Result<()> {
        self.record("apply_config");
        *self.applied.lock().expect("lock") = Some(text.to_string());
        Ok(())
    }

    fn materialize_defconfig(&self, _ctx: &RunCtx) -> Result<()> {
        self.record("materialize_defconfig");
        Ok(())
    }

    fn applied_config_diff(&self, _ctx: &RunCtx) -> Result<String> {
        Ok("CONFIG_TARGET_x86=y\nCONFIG_PACKAGE_luci=y\n".to_string())
    }

    fn kernel_version(&self) -> Result<String> {
        Ok("6.1".to_string())
    }

    fn package_setting(&self, name: &str) -> Option<String> {
        self.packages.get(name).map(|v| v.to_string())
    }

    fn target_architecture(&self) -> Result<(String, Option<String>)> {
        Ok(("x86_64".to_string(), None))
    }
}

fn write(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, body).expect("write");
}

/// Builds a minimal OpenWrt tree plus the clone fixtures a job expects.
fn build_fixture(root: &Path) -> (PathBuf, BTreeMap<(String, String), PathBuf>) {
    let tree = root.join("tree");
    write(
        &tree.join("package/base-files/files/bin/config_generate"),
        concat!(
            "\t\tset system.@system[-1].hostname='OpenWrt'\n",
            "\t\tset system.@system[-1].timezone='UTC'\n",
            "\t\tset system.@system[-1].log_size='64'\n",
        ),
    );
    write(
        &tree.join("target/linux/generic/config-6.1"),
        "CONFIG_EXISTING=y",
    );
    write(
        &tree.join("feeds/packages/lang/golang/Makefile"),
        "# stock golang\n",
    );
    write(&tree.join("package/libs/libnftnl/Makefile"), "# stock\n");
    write(
        &tree.join("package/network/config/firewall4/Makefile"),
        "# stock\n",
    );
    write(
        &tree.join("package/network/utils/nftables/Makefile"),
        "# stock\n",
    );

    let mut clones = BTreeMap::new();

    let ext = root.join("clones/ext");
    write(&ext.join("pkg/Makefile"), "include ../../luci.mk\n");
    write(&ext.join("pkg/.git/HEAD"), "ref: refs/heads/main\n");
    clones.insert((EXT_REPO.to_string(), "main".to_string()), ext);

    let golang = root.join("clones/golang");
    write(&golang.join("golang/Makefile"), "# pinned golang\n");
    clones.insert((GOLANG_REPO.to_string(), "23.x".to_string()), golang);

    let turboacc = root.join("clones/turboacc");
    write(
        &turboacc.join("version"),
        concat!(
            "FIREWALL4_VERSION=\"2023-09-01\"\n",
            "NFTABLES_VERSION=\"1.0.8\"\n",
            "LIBNFTNL_VERSION=\"1.2.6\"\n",
        ),
    );
    write(
        &turboacc.join("hack-6.1/952-add-net-conntrack-events-support-multiple-registrant.patch"),
        "--- conntrack\n",
    );
    write(
        &turboacc.join("hack-6.1/953-net-patch-linux-kernel-to-support-shortcut-fe.patch"),
        "--- sfe\n",
    );
    write(
        &turboacc.join("pending-6.1/613-netfilter_optional_tcp_window_check.patch"),
        "--- window\n",
    );
    write(&turboacc.join("libnftnl-1.2.6/Makefile"), "# pinned\n");
    write(&turboacc.join("firewall4-2023-09-01/Makefile"), "# pinned\n");
    write(&turboacc.join("nftables-1.0.8/Makefile"), "# pinned\n");
    clones.insert((TURBOACC_REPO.to_string(), "package".to_string()), turboacc);

    (tree, clones)
}

fn build_overlay(root: &Path) -> PathBuf {
    let overlay = root.join("overlay");
    write(
        &overlay.join("etc/uci-defaults/99-openwrt-prep"),
        concat!(
            "#!/bin/sh\n",
            "# Compiled by OpenWrt-Prep\n",
            "uci set network.lan.ipaddr='192.168.1.1'\n",
            "if command -v aria2c >/dev/null; then\n",
            "  uci set aria2.main.bt_tracker=''\n",
            "fi\n",
        ),
    );
    overlay
}

/// Serves the OpenClash core bundles and the tracker list from a mock
/// server, with the bundles generated on the fly.
fn mock_asset_server(scratch: &Path) -> (mockito::ServerGuard, Endpoints) {
    let mut server = mockito::Server::new();

    let meta_src = scratch.join("meta-src");
    write(&meta_src.join("clash"), "meta-core");
    let meta_bundle = scratch.join("meta.tar.gz");
    archive::pack(&meta_src, &meta_bundle, "").expect("pack meta");

    let dev_src = scratch.join("dev-src");
    write(&dev_src.join("clash"), "dev-core");
    let dev_bundle = scratch.join("dev.tar.gz");
    archive::pack(&dev_src, &dev_bundle, "").expect("pack dev");

    let tun_gz = scratch.join("tun.gz");
    {
        use std::io::Write as _;
        let file = fs::File::create(&tun_gz).expect("create");
        let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(b"tun-core").expect("write");
        enc.finish().expect("finish");
    }

    server
        .mock("GET", "/clash/core_version")
        .with_body("meta\n2023.08.17\n")
        .create();
    server
        .mock("GET", "/clash/premium/clash-linux-amd64-2023.08.17.gz")
        .with_body(fs::read(&tun_gz).expect("read"))
        .create();
    server
        .mock("GET", "/clash/meta/clash-linux-amd64.tar.gz")
        .with_body(fs::read(&meta_bundle).expect("read"))
        .create();
    server
        .mock("GET", "/clash/dev/clash-linux-amd64.tar.gz")
        .with_body(fs::read(&dev_bundle).expect("read"))
        .create();
    server
        .mock("GET", "/trackers")
        .with_body("udp://tracker.example:1337/announce\n")
        .create();

    let adg_src = scratch.join("adg-src");
    write(&adg_src.join("AdGuardHome/AdGuardHome"), "adguard-core");
    let adg_bundle = scratch.join("adguard.tar.gz");
    archive::pack(&adg_src, &adg_bundle, "").expect("pack adguard");
    let adg_bytes = fs::read(&adg_bundle).expect("read");

    let release = serde_json::json!({
        "tag_name": "v0.107.43",
        "assets": [
            {
                "name": "AdGuardHome_linux_arm64.tar.gz",
                "browser_download_url": format!("{}/adguard/arm64.tar.gz", server.url()),
            },
            {
                "name": "AdGuardHome_linux_amd64.tar.gz",
                "browser_download_url":
                    format!("{}/adguard/AdGuardHome_linux_amd64.tar.gz", server.url()),
            },
        ],
    });
    server
        .mock("GET", "/api/repos/AdguardTeam/AdGuardHome/releases/latest")
        .with_body(release.to_string())
        .create();
    server
        .mock("HEAD", "/adguard/AdGuardHome_linux_amd64.tar.gz")
        .with_body(adg_bytes.clone())
        .create();
    // The chunk count depends on the host CPU, so serve every range layout
    // the downloader could ask for.
    let size = adg_bytes.len();
    for threads in 1..=4usize {
        let chunk = size / threads;
        for i in 0..threads {
            let start = i * chunk;
            let end = if i == threads - 1 { size - 1 } else { start + chunk - 1 };
            server
                .mock("GET", "/adguard/AdGuardHome_linux_amd64.tar.gz")
                .match_header("range", format!("bytes={start}-{end}").as_str())
                .with_status(206)
                .with_body(adg_bytes[start..=end].to_vec())
                .create();
        }
    }

    let endpoints = Endpoints {
        github_api: format!("{}/api", server.url()),
        clash_core_base: format!("{}/clash", server.url()),
        tracker_list: format!("{}/trackers", server.url()),
        dns_list: format!("{}/dnslist", server.url()),
    };
    (server, endpoints)
}

#[test]
fn prepare_flavor_runs_the_whole_job() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (tree, clones) = build_fixture(tmp.path());
    let overlay = build_overlay(tmp.path());
    let (_server, endpoints) = mock_asset_server(&tmp.path().join("assets"));

    let toolchain = FakeToolchain::new(
        &tree,
        &[
            ("kmod-shortcut-fe", "y"),
            ("kmod-nft-fullcone", "m"),
            ("luci-app-openclash", "y"),
        ],
    );

    let (tx, rx) = mpsc::channel();
    let ctx = RunCtx::new(Arc::new(ChannelSink::new(tx))).for_job("test");
    let job = JobContext {
        http: Http::new().expect("client"),
        endpoints: Arc::new(endpoints),
        clones: Arc::new(clones),
        overlay_dir: overlay,
        upload_dir: tmp.path().join("uploads/test"),
        compiler: "Tester".to_string(),
        github_token: None,
    };

    let mut config = FlavorConfig {
        name: "test".to_string(),
        path: tmp.path().to_path_buf(),
        compile: Default::default(),
        openwrtext: OpenwrtExt {
            ipaddr: "10.0.0.1".to_string(),
            timezone: "CST-8".to_string(),
            zonename: "Asia/Shanghai".to_string(),
            golang_version: "23.x".to_string(),
        },
        extpackages: [(
            "luci-app-example".to_string(),
            ExtPackage {
                repository: EXT_REPO.to_string(),
                branch: "main".to_string(),
                path: "pkg".to_string(),
            },
        )]
        .into_iter()
        .collect(),
        openwrt: "CONFIG_SEED=y\n".to_string(),
    };

    let archive_path =
        prepare_flavor(&ctx, &job, &mut config, &toolchain).expect("prepare flavor");
    drop(ctx);

    // Lifecycle calls in order, phases in order.
    assert_eq!(
        *toolchain.calls.lock().expect("lock"),
        vec![
            "install_feeds",
            "fix_known_issues",
            "apply_config",
            "materialize_defconfig",
        ]
    );
    let phases: Vec<String> = rx
        .try_iter()
        .filter_map(|ev| match ev {
            RunEvent::JobPhase { phase, .. } => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            "Init",
            "FeedsRepaired",
            "PackagesStaged",
            "ConfigApplied",
            "PatchesApplied",
            "AssetsResolved",
            "FilesRewritten",
            "Archived",
        ]
    );

    // The seed blob went in, the expanded diff came back out.
    assert_eq!(
        toolchain.applied.lock().expect("lock").as_deref(),
        Some("CONFIG_SEED=y\n")
    );
    assert_eq!(config.openwrt, "CONFIG_TARGET_x86=y\nCONFIG_PACKAGE_luci=y\n");

    // Extension package staged without its .git, golang feed replaced.
    let staged = tree.join("package/extra/luci-app-example");
    assert!(staged.join("Makefile").is_file());
    assert!(!staged.join(".git").exists());
    assert_eq!(
        fs::read_to_string(tree.join("feeds/packages/lang/golang/golang/Makefile"))
            .expect("read"),
        "# pinned golang\n"
    );

    // Kernel patches and directives for shortcut-fe + fullcone.
    let generic = tree.join("target/linux/generic");
    assert!(
        generic
            .join("hack-6.1/952-add-net-conntrack-events-support-multiple-registrant.patch")
            .is_file()
    );
    assert!(
        generic
            .join("hack-6.1/953-net-patch-linux-kernel-to-support-shortcut-fe.patch")
            .is_file()
    );
    assert!(
        generic
            .join("pending-6.1/613-netfilter_optional_tcp_window_check.patch")
            .is_file()
    );
    let kernel_config = fs::read_to_string(generic.join("config-6.1")).expect("read");
    assert!(kernel_config.contains("# CONFIG_NF_CONNTRACK_CHAIN_EVENTS is not set"));
    assert!(kernel_config.contains("CONFIG_SHORTCUT_FE=y"));
    assert_eq!(
        fs::read_to_string(tree.join("package/libs/libnftnl/Makefile")).expect("read"),
        "# pinned\n"
    );
    assert_eq!(
        fs::read_to_string(tree.join("package/network/config/firewall4/Makefile"))
            .expect("read"),
        "# pinned\n"
    );

    // OpenClash cores unpacked into the overlay, executable.
    let core_dir = tree.join("files/etc/openclash/core");
    assert_eq!(fs::read(core_dir.join("clash")).expect("read"), b"dev-core");
    assert_eq!(
        fs::read(core_dir.join("clash_meta")).expect("read"),
        b"meta-core"
    );
    assert_eq!(
        fs::read(core_dir.join("clash_tun")).expect("read"),
        b"tun-core"
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for name in ["clash", "clash_meta", "clash_tun"] {
            let mode = fs::metadata(core_dir.join(name))
                .expect("meta")
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111, "{name} not executable");
        }
    }

    // Placeholder rewrites in the first-boot script and config_generate.
    let script =
        fs::read_to_string(tree.join("files/etc/uci-defaults/99-openwrt-prep")).expect("read");
    assert!(script.contains("uci set network.lan.ipaddr='10.0.0.1'"));
    assert!(
        script.contains("uci set aria2.main.bt_tracker='udp://tracker.example:1337/announce'")
    );
    assert!(script.contains("# Compiled by Tester"));

    let generated =
        fs::read_to_string(tree.join("package/base-files/files/bin/config_generate"))
            .expect("read");
    assert!(generated.contains("set system.@system[-1].hostname='OpenWrt-k'"));
    assert!(generated.contains("set system.@system[-1].timezone='CST-8'"));
    assert!(generated.contains("set system.@system[-1].zonename='Asia/Shanghai'"));
    assert!(generated.contains("set system.@system[-1].log_size='64'"));

    // The packed archive roots everything under "openwrt".
    assert_eq!(archive_path, tmp.path().join("uploads/test/openwrt-source.tar.gz"));
    let file = fs::File::open(&archive_path).expect("open");
    let mut tarball = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let members: Vec<String> = tarball
        .entries()
        .expect("entries")
        .map(|e| {
            e.expect("entry")
                .path()
                .expect("path")
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert!(members.iter().all(|m| m.starts_with("openwrt")));
    assert!(
        members
            .iter()
            .any(|m| m == "openwrt/package/extra/luci-app-example/Makefile")
    );
}

#[test]
fn adguard_core_is_fetched_from_the_latest_release() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (tree, clones) = build_fixture(tmp.path());
    let overlay = build_overlay(tmp.path());
    let (_server, endpoints) = mock_asset_server(&tmp.path().join("assets"));

    let toolchain = FakeToolchain::new(&tree, &[("luci-app-adguardhome", "y")]);

    let (tx, _rx) = mpsc::channel();
    let ctx = RunCtx::new(Arc::new(ChannelSink::new(tx))).for_job("adg");
    let job = JobContext {
        http: Http::new().expect("client"),
        endpoints: Arc::new(endpoints),
        clones: Arc::new(clones),
        overlay_dir: overlay,
        upload_dir: tmp.path().join("uploads/adg"),
        compiler: "Tester".to_string(),
        github_token: None,
    };

    let mut config = FlavorConfig {
        name: "adg".to_string(),
        path: tmp.path().to_path_buf(),
        compile: Default::default(),
        openwrtext: OpenwrtExt {
            ipaddr: "10.0.0.1".to_string(),
            timezone: "CST-8".to_string(),
            zonename: "Asia/Shanghai".to_string(),
            golang_version: "23.x".to_string(),
        },
        extpackages: BTreeMap::new(),
        openwrt: String::new(),
    };

    prepare_flavor(&ctx, &job, &mut config, &toolchain).expect("prepare flavor");

    // The amd64 asset was picked out of the release, downloaded in ranges
    // and reassembled, and only its binary member landed in the overlay.
    let binary = tree.join("files/usr/bin/AdGuardHome/AdGuardHome");
    assert_eq!(fs::read(&binary).expect("read"), b"adguard-core");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&binary).expect("meta").permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "AdGuardHome not executable");
    }
    assert!(!tree.join("files/etc/openclash").exists());
}

#[test]
fn assets_are_skipped_when_packages_are_not_selected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (tree, clones) = build_fixture(tmp.path());
    let overlay = build_overlay(tmp.path());
    let (_server, endpoints) = mock_asset_server(&tmp.path().join("assets"));

    // No acceleration modules, no download companions.
    let toolchain = FakeToolchain::new(&tree, &[]);

    let (tx, _rx) = mpsc::channel();
    let ctx = RunCtx::new(Arc::new(ChannelSink::new(tx))).for_job("plain");
    let job = JobContext {
        http: Http::new().expect("client"),
        endpoints: Arc::new(endpoints),
        clones: Arc::new(clones),
        overlay_dir: overlay,
        upload_dir: tmp.path().join("uploads/plain"),
        compiler: "Tester".to_string(),
        github_token: None,
    };

    let mut config = FlavorConfig {
        name: "plain".to_string(),
        path: tmp.path().to_path_buf(),
        compile: Default::default(),
        openwrtext: OpenwrtExt {
            ipaddr: "10.0.0.1".to_string(),
            timezone: "CST-8".to_string(),
            zonename: "Asia/Shanghai".to_string(),
            golang_version: "23.x".to_string(),
        },
        extpackages: BTreeMap::new(),
        openwrt: String::new(),
    };

    prepare_flavor(&ctx, &job, &mut config, &toolchain).expect("prepare flavor");

    assert!(!tree.join("files/etc/openclash").exists());
    assert!(!tree.join("files/usr/bin/AdGuardHome/AdGuardHome").exists());
    // No acceleration features selected, so the stock packages survive.
    assert_eq!(
        fs::read_to_string(tree.join("package/libs/libnftnl/Makefile")).expect("read"),
        "# stock\n"
    );
    assert!(!tree.join("target/linux/generic/hack-6.1").exists());
}
