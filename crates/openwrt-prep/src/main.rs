use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use openwrt_prep::coordinator::{Coordinator, Endpoints, matrix_json};
use openwrt_prep::error::ErrorKind;
use openwrt_prep::{Error, Result};
use openwrt_prep::flavor;
use openwrt_prep::run::{RunCtx, StdoutSink};
use openwrt_prep::settings::Settings;
use openwrt_prep::workspace::RunPaths;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Discover and parse every flavor configuration, print as JSON
    Parse {
        /// Directory holding one subdirectory per flavor
        configs_dir: PathBuf,
    },
    /// Print the job matrix JSON for a downstream matrix build
    Matrix {
        /// Directory holding one subdirectory per flavor
        configs_dir: PathBuf,
    },
    /// Run the full preparation pipeline
    Prepare {
        /// Directory holding one subdirectory per flavor
        configs_dir: PathBuf,
        /// Optional TOML settings file
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Working area for clones and trees (overrides settings)
        #[arg(long)]
        workdir: Option<PathBuf>,
        /// Where per-flavor archives and the matrix land (overrides settings)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Files overlay copied into every tree (overrides settings)
        #[arg(long)]
        files: Option<PathBuf>,
        /// Max flavors prepared concurrently (0 = one worker per flavor)
        #[arg(long)]
        max_parallel: Option<usize>,
        /// GitHub API token for release lookups (falls back to GITHUB_TOKEN)
        #[arg(long)]
        github_token: Option<String>,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        // Configuration mistakes get their own exit code so CI can tell
        // a bad flavor directory from a transient network failure.
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(e: &Error) -> i32 {
    match e.kind() {
        ErrorKind::Config => 2,
        ErrorKind::Network => 3,
        ErrorKind::Filesystem | ErrorKind::Other => 1,
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    match args.cmd {
        Command::Parse { configs_dir } => cmd_parse(&configs_dir),
        Command::Matrix { configs_dir } => cmd_matrix(&configs_dir),
        Command::Prepare {
            configs_dir,
            settings,
            workdir,
            output,
            files,
            max_parallel,
            github_token,
        } => cmd_prepare(
            &configs_dir,
            settings.as_deref(),
            workdir,
            output,
            files,
            max_parallel,
            github_token,
        ),
    }
}

fn cmd_parse(configs_dir: &PathBuf) -> Result<()> {
    let flavors = flavor::discover(configs_dir)?;
    let text = serde_json::to_string_pretty(&flavors)
        .map_err(|e| openwrt_prep::Error::msg(format!("serializing flavors: {e}")))?;
    println!("{text}");
    Ok(())
}

fn cmd_matrix(configs_dir: &PathBuf) -> Result<()> {
    let flavors = flavor::discover(configs_dir)?;
    println!("{}", matrix_json(&flavors)?);
    Ok(())
}

fn cmd_prepare(
    configs_dir: &std::path::Path,
    settings_path: Option<&std::path::Path>,
    workdir: Option<PathBuf>,
    output: Option<PathBuf>,
    files: Option<PathBuf>,
    max_parallel: Option<usize>,
    github_token: Option<String>,
) -> Result<()> {
    let mut settings = Settings::load_or_default(settings_path)?;
    if let Some(dir) = workdir {
        settings.workdir = dir;
    }
    if let Some(dir) = output {
        settings.output_dir = dir;
    }
    if let Some(dir) = files {
        settings.files_dir = Some(dir);
    }
    if let Some(n) = max_parallel {
        settings.max_parallel = n;
    }
    let github_token = github_token.or_else(|| std::env::var("GITHUB_TOKEN").ok());

    let files_dir = settings
        .files_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("files"));
    let coordinator = Coordinator {
        paths: RunPaths::new(&settings.workdir, &settings.output_dir, &files_dir),
        endpoints: Endpoints::default(),
        clean: settings.clean,
        max_parallel: settings.max_parallel,
        compiler: settings.compiler.clone(),
        github_repo_owner: settings.github_repo_owner.clone(),
        github_token,
    };

    let ctx = RunCtx::new(Arc::new(StdoutSink::default()));
    coordinator.run(&ctx, configs_dir)
}
