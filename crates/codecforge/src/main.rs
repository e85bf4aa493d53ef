use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use codecforge::Result;
use codecforge::config::{self, BuildMode, ConfigDoc};
use codecforge::executor::{ExecCtx, StdoutSink};
use codecforge::license::Tier;
use codecforge::orchestrator::{Pipeline, RunOptions, TargetSelection};
use tracing_subscriber::EnvFilter;

const DEFAULT_RUN_FILE: &str = "codecforge.toml";

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Run file (TOML); defaults to ./codecforge.toml when present
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the active dependency set and the consumer for one platform
    Build {
        /// Platform id (see `codecforge platforms`)
        platform: String,
        /// License tier: free, lgpl or gpl
        #[arg(long, default_value = "free")]
        tier: String,
        /// all, codecs, or a single dependency name
        #[arg(long, default_value = "all")]
        target: String,
        /// Build dependencies and consumer with debug info
        #[arg(long)]
        debug: bool,
        /// Keep building independent targets after a failure and report all of them
        #[arg(long)]
        triage: bool,
        /// Print what would run without executing adapter commands
        #[arg(long)]
        dry_run: bool,
        /// Max number of targets to build concurrently (0 = use config or CPU count)
        #[arg(long, default_value_t = 0)]
        max_parallel: usize,
        /// Do not echo subprocess output (it is still written to the target logs)
        #[arg(long)]
        quiet: bool,
    },
    /// Print the active set, build order and consumer flags without building
    Plan {
        platform: String,
        #[arg(long, default_value = "free")]
        tier: String,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// List the known platform ids
    Platforms,
    /// Print the fully-resolved run file (after imports/extends)
    Resolve,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let debug = matches!(args.cmd, Command::Build { debug: true, .. });
    init_tracing(args.verbose, debug);

    let res = match args.cmd {
        Command::Build {
            platform,
            tier,
            target,
            debug,
            triage,
            dry_run,
            max_parallel,
            quiet,
        } => tier.parse::<Tier>().and_then(|tier| {
            let opts = RunOptions {
                platform_id: platform,
                tier,
                selection: target.parse::<TargetSelection>()?,
                debug,
                max_parallel: (max_parallel > 0).then_some(max_parallel),
                mode: triage.then_some(BuildMode::Triage),
            };
            cmd_build(args.config.as_deref(), &opts, dry_run, !quiet)
        }),
        Command::Plan {
            platform,
            tier,
            dot,
        } => tier
            .parse::<Tier>()
            .and_then(|tier| cmd_plan(args.config.as_deref(), &platform, tier, dot)),
        Command::Platforms => cmd_platforms(args.config.as_deref()),
        Command::Resolve => cmd_resolve(args.config.as_deref()),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", e.kind());
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8, debug: bool) {
    let default = match (verbose, debug) {
        (0, false) => "codecforge=warn",
        (1, false) => "codecforge=info",
        _ => "codecforge=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

/// The explicit run file, else ./codecforge.toml, else builtin defaults.
fn load_doc(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => config::load(p),
        None => {
            let p = Path::new(DEFAULT_RUN_FILE);
            if p.is_file() {
                config::load(p)
            } else {
                Ok(ConfigDoc::empty(p))
            }
        }
    }
}

fn cmd_build(config: Option<&Path>, opts: &RunOptions, dry_run: bool, show_logs: bool) -> Result<()> {
    let doc = load_doc(config)?;
    let pipeline = Pipeline::from_config(&doc)?;
    pipeline.prepare_workspace()?;

    let sink = Arc::new(StdoutSink::new(show_logs));
    let ctx = ExecCtx::new(dry_run, sink);
    let report = pipeline.run(opts, &ctx);
    println!("{report}");
    for w in &report.warnings {
        eprintln!("{}: {}", w.kind, w.diagnostic);
    }
    report.into_result().map(|_| ())
}

fn cmd_plan(config: Option<&Path>, platform: &str, tier: Tier, dot: bool) -> Result<()> {
    let doc = load_doc(config)?;
    let pipeline = Pipeline::from_config(&doc)?;
    let plan = pipeline.plan(platform, tier)?;

    if dot {
        print!("{}", plan.dot);
        return Ok(());
    }

    for (i, name) in plan.order.iter().enumerate() {
        let Some(t) = plan.active.get(name) else {
            continue;
        };
        println!(
            "{:>2}. {:<18}  {:<16} {:<5}  {}",
            i + 1,
            name,
            t.dependency.kind.as_str(),
            t.dependency.license.as_str(),
            t.pin.git_ref
        );
    }
    for d in &plan.active.dropped {
        println!(" -  {:<18}  dropped: {}", d.name, d.reason);
    }
    println!();
    println!("consumer flags:");
    for f in &plan.consumer_flags {
        println!("  {f}");
    }
    Ok(())
}

fn cmd_platforms(config: Option<&Path>) -> Result<()> {
    let doc = load_doc(config)?;
    let catalog = codecforge::platform::PlatformCatalog::from_doc(&doc)?;
    for p in catalog.records() {
        let mode = if p.is_cross() {
            "cross"
        } else if p.is_emulated() {
            "emulated"
        } else {
            "native"
        };
        println!("{:<20} {:<8} {:<6} {:<8} {}", p.id, p.arch, p.libc, p.link_mode.to_string(), mode);
    }
    Ok(())
}

fn cmd_resolve(config: Option<&Path>) -> Result<()> {
    let doc = load_doc(config)?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}
