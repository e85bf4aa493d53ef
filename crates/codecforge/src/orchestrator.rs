//! Pipeline sequencing for one (platform, tier) run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::adapter::{BuildRequest, Fetcher, SourceAdapters, TargetBuilder, expected_artifact};
use crate::config::{BuildMode, ConfigDoc, Settings};
use crate::consumer::{
    ConfigureMakeConsumer, ConsumerBuilder, ConsumerRequest, FlagInputs, consumer_flags,
    resolve_source,
};
use crate::diagnostic::{Check, Diagnostic, Gate};
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ExecEvent, TargetOutcome, run_pool};
use crate::ledger::Ledger;
use crate::license::{ActiveSet, DroppedDependency, Tier, active_set};
use crate::logs::TargetLog;
use crate::planner::BuildGraph;
use crate::platform::{PlatformCatalog, PlatformDescriptor};
use crate::registry::Registry;
use crate::stamp::{StampInputs, StampKey, StampStore};
use crate::toolchain::{SystemToolchain, Toolchain};
use crate::verify::{Warning, aggregate, artifact, binary, parse, preflight};
use crate::workspace::{self, IsolatedPrefix, WorkspacePaths};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    ResolvingActiveSet,
    BuildingDependencies,
    AggregateVerifying,
    BuildingConsumer,
    FinalVerifying,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Pending,
    Building,
    Built,
    Verified,
    Stamped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRecord {
    pub state: TargetState,
    pub cache_hit: bool,
    /// Set when the target never started because a prerequisite failed.
    pub blocked_by: Option<String>,
    pub log: Option<PathBuf>,
}

impl TargetRecord {
    fn pending() -> Self {
        Self {
            state: TargetState::Pending,
            cache_hit: false,
            blocked_by: None,
            log: None,
        }
    }
}

/// What `--target` selects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TargetSelection {
    /// Every active dependency, then the consumer.
    #[default]
    All,
    /// Every active dependency, stopping after the pre-link check.
    Codecs,
    /// One dependency and its prerequisites.
    Only(String),
}

impl FromStr for TargetSelection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "all" => Ok(Self::All),
            "codecs" => Ok(Self::Codecs),
            name => Ok(Self::Only(name.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub platform_id: String,
    pub tier: Tier,
    pub selection: TargetSelection,
    pub debug: bool,
    pub max_parallel: Option<usize>,
    pub mode: Option<BuildMode>,
}

#[derive(Debug)]
pub struct RunReport {
    pub platform_id: String,
    pub tier: Tier,
    pub stages: Vec<Stage>,
    pub targets: BTreeMap<String, TargetRecord>,
    pub dropped: Vec<DroppedDependency>,
    pub warnings: Vec<Warning>,
    pub binary: Option<PathBuf>,
    pub error: Option<Error>,
}

impl RunReport {
    fn new(opts: &RunOptions) -> Self {
        Self {
            platform_id: opts.platform_id.clone(),
            tier: opts.tier,
            stages: vec![Stage::Idle],
            targets: BTreeMap::new(),
            dropped: Vec::new(),
            warnings: Vec::new(),
            binary: None,
            error: None,
        }
    }

    fn enter(&mut self, stage: Stage) {
        info!(stage = ?stage, "pipeline stage");
        self.stages.push(stage);
    }

    pub fn stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Idle)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.stage() == Stage::Done
    }

    pub fn cache_hits(&self) -> usize {
        self.targets.values().filter(|t| t.cache_hit).count()
    }

    /// Targets whose adapter actually ran this time.
    pub fn built(&self) -> usize {
        self.targets
            .values()
            .filter(|t| !t.cache_hit && t.state == TargetState::Stamped)
            .count()
    }

    pub fn into_result(mut self) -> Result<Self> {
        match self.error.take() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {} / {}: {:?}", self.platform_id, self.tier, self.stage())?;
        for (name, t) in &self.targets {
            let mut line = format!("  {name}: {:?}", t.state);
            if t.cache_hit {
                line.push_str(" (cached)");
            }
            if let Some(by) = &t.blocked_by {
                line.push_str(&format!(" (blocked by {by})"));
            }
            writeln!(f, "{line}")?;
        }
        for d in &self.dropped {
            writeln!(f, "  {}: dropped, {}", d.name, d.reason)?;
        }
        for w in &self.warnings {
            writeln!(f, "  {}: {}", w.kind, w.diagnostic.what)?;
        }
        if let Some(bin) = &self.binary {
            writeln!(f, "  binary: {}", bin.display())?;
        }
        write!(
            f,
            "  built={} cached={} warnings={}",
            self.built(),
            self.cache_hits(),
            self.warnings.len()
        )
    }
}

/// `plan` output: what a run would build, without building it.
#[derive(Debug)]
pub struct Plan {
    pub active: ActiveSet,
    pub order: Vec<String>,
    pub consumer_flags: Vec<String>,
    pub dot: String,
}

pub struct Pipeline {
    settings: Settings,
    paths: WorkspacePaths,
    registry: Registry,
    ledger: Ledger,
    platforms: PlatformCatalog,
    base_dir: PathBuf,
    toolchain: Arc<dyn Toolchain>,
    builder: Arc<dyn TargetBuilder>,
    consumer: Arc<dyn ConsumerBuilder>,
}

impl Pipeline {
    pub fn new(
        settings: Settings,
        paths: WorkspacePaths,
        registry: Registry,
        ledger: Ledger,
        platforms: PlatformCatalog,
        base_dir: PathBuf,
    ) -> Self {
        let builder = SourceAdapters::new(
            paths.downloads_dir(),
            settings.build.fetch_retries,
            Duration::from_millis(settings.build.fetch_backoff_ms),
        );
        let consumer = ConfigureMakeConsumer::new(&settings.consumer);
        Self {
            settings,
            paths,
            registry,
            ledger,
            platforms,
            base_dir,
            toolchain: Arc::new(SystemToolchain),
            builder: Arc::new(builder),
            consumer: Arc::new(consumer),
        }
    }

    /// Real adapters and host tools, configured from a loaded run file.
    pub fn from_config(doc: &ConfigDoc) -> Result<Self> {
        let settings = Settings::from_doc(doc)?;
        let base = doc.base_dir();
        let platforms = PlatformCatalog::from_doc(doc)?;
        let paths = workspace::load_paths(&settings.workspace, &base)?;
        let ledger_path = {
            let p = PathBuf::from(settings.ledger.path.trim());
            if p.is_absolute() { p } else { base.join(p) }
        };
        let ledger = Ledger::load(&ledger_path)?;
        info!(
            ledger = %ledger_path.display(),
            pins = ledger.len(),
            last_updated = ledger.last_updated.as_deref().unwrap_or("unknown"),
            "loaded version ledger"
        );
        Ok(Self::new(settings, paths, Registry::builtin(), ledger, platforms, base))
    }

    /// Apply the configured clean mode and create the workspace dirs.
    pub fn prepare_workspace(&self) -> Result<()> {
        workspace::init_dirs(&self.settings.workspace, &self.base_dir).map(|_| ())
    }

    pub fn platforms(&self) -> &PlatformCatalog {
        &self.platforms
    }

    pub fn with_toolchain(mut self, toolchain: Arc<dyn Toolchain>) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_builder(mut self, builder: Arc<dyn TargetBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn ConsumerBuilder>) -> Self {
        self.consumer = consumer;
        self
    }

    fn fetcher(&self) -> Fetcher {
        Fetcher {
            downloads_dir: self.paths.downloads_dir(),
            retries: self.settings.build.fetch_retries,
            backoff: Duration::from_millis(self.settings.build.fetch_backoff_ms),
        }
    }

    fn prefix_for(&self, platform: &PlatformDescriptor, tier: Tier) -> IsolatedPrefix {
        let prefix = self.paths.prefix(&platform.id, tier);
        let dir = platform
            .pkg_config_search_dir
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(|d| {
                let p = PathBuf::from(d.trim());
                if p.is_absolute() { p } else { prefix.root.join(p) }
            });
        prefix.with_pkg_config_dir(dir)
    }

    fn timeout_for(&self, platform: &PlatformDescriptor) -> Duration {
        let mut secs = self.settings.build.timeout_secs;
        if platform.is_emulated() {
            secs = secs.saturating_mul(u64::from(self.settings.build.emulated_timeout_factor.max(1)));
        }
        Duration::from_secs(secs)
    }

    pub fn plan(&self, platform_id: &str, tier: Tier) -> Result<Plan> {
        let platform = self.platforms.get(platform_id)?;
        parse::check_platform(platform)?;
        let active = active_set(&self.registry, &self.ledger, tier, platform)?;
        let graph = BuildGraph::from_targets(&active.targets)?;
        let order = graph.ordered()?.iter().map(|n| n.id.clone()).collect();
        let dot = graph.to_dot(Some(&self.settings.consumer.name))?;
        let prefix = self.prefix_for(platform, tier);
        let consumer_flags = consumer_flags(&FlagInputs {
            active: &active,
            platform,
            tier,
            settings: &self.settings.consumer,
            prefix: &prefix,
            debug: false,
        });
        Ok(Plan {
            active,
            order,
            consumer_flags,
            dot,
        })
    }

    /// Run the pipeline. The report is returned on failure too; `error` carries
    /// the originating gate's diagnostic.
    pub fn run(&self, opts: &RunOptions, ctx: &ExecCtx) -> RunReport {
        let mut report = RunReport::new(opts);
        let res = self.run_stages(opts, ctx, &mut report);
        if let Err(e) = res {
            report.enter(Stage::Failed);
            report.error = Some(e);
        } else {
            report.enter(Stage::Done);
        }
        ctx.sink.emit(ExecEvent::ExecutorDone {
            ok: report.error.is_none(),
            error: report.error.as_ref().map(|e| e.kind().to_string()),
        });
        report
    }

    fn run_stages(&self, opts: &RunOptions, ctx: &ExecCtx, report: &mut RunReport) -> Result<()> {
        report.enter(Stage::ResolvingActiveSet);
        let platform = self.platforms.get(&opts.platform_id)?;
        parse::check_platform(platform)?;
        let active = active_set(&self.registry, &self.ledger, opts.tier, platform)?;
        parse::check_pins(&active)?;
        report.dropped = active.dropped.clone();
        for d in &active.dropped {
            info!(dependency = d.name, reason = %d.reason, "dropped for platform");
        }
        let selected = self.select(&active, opts)?;
        for t in &selected.targets {
            report.targets.insert(t.name().to_string(), TargetRecord::pending());
        }

        let prefix = self.prefix_for(platform, opts.tier);
        prefix.create_layout()?;
        if ctx.dry_run {
            ctx.log("DRY-RUN: skipping preflight probe");
        } else {
            preflight::check_probe_arch(self.toolchain.as_ref(), platform, &prefix)?;
            if let Some(w) = preflight::check_isolation(
                self.toolchain.as_ref(),
                platform,
                &prefix,
                &self.settings.build.leak_probe_packages,
                self.settings.build.strict_isolation,
            )? {
                report.warnings.push(w);
            }
        }

        report.enter(Stage::BuildingDependencies);
        self.build_dependencies(&selected, platform, &prefix, opts, ctx, report)?;

        if matches!(opts.selection, TargetSelection::Only(_)) {
            return Ok(());
        }

        report.enter(Stage::AggregateVerifying);
        if !ctx.dry_run {
            let required =
                aggregate::required_names(&active, &self.settings.consumer.extra_pkgconfig);
            aggregate::verify_aggregate(self.toolchain.as_ref(), platform, &prefix, &required)?;
        }
        if opts.selection == TargetSelection::Codecs {
            return Ok(());
        }

        report.enter(Stage::BuildingConsumer);
        let consumer = &self.settings.consumer;
        let source = resolve_source(
            consumer,
            &self.ledger,
            &self.fetcher(),
            &prefix,
            &self.base_dir,
            ctx,
        )?;
        let flags = consumer_flags(&FlagInputs {
            active: &active,
            platform,
            tier: opts.tier,
            settings: consumer,
            prefix: &prefix,
            debug: opts.debug,
        });
        let mut cctx = ctx.clone();
        cctx.set_task(consumer.name.clone());
        cctx.set_timeout(self.timeout_for(platform));
        let log = TargetLog::open(&prefix.log_path(&consumer.name))?;
        log.banner(&format!("{} configure flags: {}", consumer.name, flags.join(" ")));
        cctx.set_log(log);
        let req = ConsumerRequest {
            platform,
            prefix: &prefix,
            source: &source,
            flags: &flags,
            jobs: num_cpus::get().max(1),
        };
        let bin = self.consumer.build(&req, &mut cctx)?;
        report.binary = Some(bin.clone());

        report.enter(Stage::FinalVerifying);
        if !ctx.dry_run {
            binary::verify_binary(self.toolchain.as_ref(), platform, &bin)?;
        }
        Ok(())
    }

    fn select(&self, active: &ActiveSet, opts: &RunOptions) -> Result<ActiveSet> {
        let TargetSelection::Only(name) = &opts.selection else {
            return Ok(active.clone());
        };
        let dep = self.registry.get(name)?;
        if let Some(d) = active.dropped.iter().find(|d| d.name == dep.name) {
            return Err(Error::UnknownDependency(
                Diagnostic::new(Gate::Parse, format!("'{name}' is not buildable for '{}'", opts.platform_id))
                    .check(Check::pass("registry lookup"))
                    .check(Check::fail("active on platform").with_detail(d.reason.clone()))
                    .root_cause("the dependency was dropped for this platform")
                    .fix("pick another platform or another target"),
            ));
        }
        if !active.contains(dep.name) {
            return Err(Error::UnknownDependency(
                Diagnostic::new(Gate::Parse, format!("'{name}' is not in the {} tier", opts.tier))
                    .check(Check::pass("registry lookup"))
                    .check(Check::fail("included by tier").with_detail(format!(
                        "'{name}' is licensed {}",
                        dep.license
                    )))
                    .root_cause("the requested tier excludes this dependency")
                    .fix(format!("rerun with --tier={}", dep.license)),
            ));
        }
        let wanted = self.registry.with_prerequisites(dep.name)?;
        Ok(ActiveSet {
            targets: active
                .targets
                .iter()
                .filter(|t| wanted.contains(&t.dependency.name))
                .cloned()
                .collect(),
            dropped: Vec::new(),
        })
    }

    fn build_dependencies(
        &self,
        selected: &ActiveSet,
        platform: &PlatformDescriptor,
        prefix: &IsolatedPrefix,
        opts: &RunOptions,
        ctx: &ExecCtx,
        report: &mut RunReport,
    ) -> Result<()> {
        let graph = BuildGraph::from_targets(&selected.targets)?;
        let stamps = StampStore::new(self.paths.stamps_dir())?;
        let workers = opts
            .max_parallel
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.settings.build.workers());
        let jobs = num_cpus::get().max(1).div_ceil(workers).max(1);
        let timeout = self.timeout_for(platform);
        let states = Mutex::new(report.targets.clone());
        let keys = Mutex::new(HashMap::<String, StampKey>::new());
        let by_name: HashMap<&str, _> = selected.targets.iter().map(|t| (t.name(), t)).collect();

        let mark = |name: &str, state: TargetState| {
            if let Ok(mut s) = states.lock()
                && let Some(rec) = s.get_mut(name)
            {
                rec.state = state;
            }
        };

        let job = |name: &str, tctx: &mut ExecCtx| -> Result<bool> {
            let target = by_name
                .get(name)
                .copied()
                .ok_or_else(|| Error::msg(format!("target '{name}' missing from active set")))?;

            for pre in target.dependency.requires {
                if !by_name.contains_key(pre) {
                    continue;
                }
                let key = keys
                    .lock()
                    .map_err(|_| Error::msg("stamp key table poisoned"))?
                    .get(*pre)
                    .cloned();
                let ready = key.is_some_and(|k| tctx.dry_run || stamps.is_stamped(&k));
                if !ready {
                    return Err(Error::msg(format!(
                        "'{name}' scheduled before its prerequisite '{pre}' was stamped"
                    )));
                }
            }

            let req = BuildRequest {
                target,
                platform,
                prefix,
                debug: opts.debug,
                jobs,
            };
            let inputs = StampInputs {
                dependency: name.to_string(),
                git_ref: target.pin.git_ref.clone(),
                platform_id: platform.id.clone(),
                flags: self.builder.resolved_flags(&req),
            };
            let key = StampKey::compute(&inputs)?;
            let _lock = stamps.lock(&key)?;

            if stamps.is_stamped(&key) && !tctx.dry_run {
                let installed = expected_artifact(&req, false);
                if let Err(e) = artifact::verify_artifact(
                    self.toolchain.as_ref(),
                    platform,
                    prefix,
                    &installed,
                    target.dependency.pkgconfig_name,
                ) {
                    warn!(target = name, key = %key.hash, error = %e, "stamped artifacts no longer verify; rebuilding");
                    stamps.invalidate(&key)?;
                }
            }

            if stamps.is_stamped(&key) {
                info!(target = name, key = %key.hash, "stamp hit");
                if let Ok(mut s) = states.lock()
                    && let Some(rec) = s.get_mut(name)
                {
                    rec.state = TargetState::Stamped;
                    rec.cache_hit = true;
                }
                keys.lock()
                    .map_err(|_| Error::msg("stamp key table poisoned"))?
                    .insert(name.to_string(), key);
                return Ok(true);
            }

            let log_path = prefix.log_path(name);
            tctx.set_log(TargetLog::open(&log_path)?);
            tctx.set_timeout(timeout);
            if let Ok(mut s) = states.lock()
                && let Some(rec) = s.get_mut(name)
            {
                rec.log = Some(log_path);
            }

            mark(name, TargetState::Building);
            let built = self.builder.build(&req, tctx);
            let artifact = match built {
                Ok(a) => a,
                Err(e) => {
                    mark(name, TargetState::Failed);
                    return Err(e);
                }
            };
            mark(name, TargetState::Built);

            if !tctx.dry_run {
                if let Err(e) = artifact::verify_artifact(
                    self.toolchain.as_ref(),
                    platform,
                    prefix,
                    &artifact,
                    target.dependency.pkgconfig_name,
                ) {
                    mark(name, TargetState::Failed);
                    return Err(e);
                }
                mark(name, TargetState::Verified);
                stamps.stamp(&key, &inputs)?;
                mark(name, TargetState::Stamped);
            }
            keys.lock()
                .map_err(|_| Error::msg("stamp key table poisoned"))?
                .insert(name.to_string(), key);
            Ok(false)
        };

        let mut pool = run_pool(&graph, ctx, workers, job)?;
        let mut records = states
            .into_inner()
            .map_err(|_| Error::msg("target state table poisoned"))?;

        let mut cancelled = Vec::new();
        for (name, outcome) in &pool.outcomes {
            let Some(rec) = records.get_mut(name) else {
                continue;
            };
            match outcome {
                TargetOutcome::Done(_) => {}
                TargetOutcome::Failed(_) => rec.state = TargetState::Failed,
                TargetOutcome::Blocked { by } => {
                    warn!(target = %name, blocked_by = %by, "not started: prerequisite failed");
                    rec.blocked_by = Some(by.clone());
                }
                TargetOutcome::Cancelled => cancelled.push(name.clone()),
            }
        }
        report.targets = records;

        let failures = pool.take_failures();
        if failures.is_empty() {
            if !cancelled.is_empty() {
                return Err(Error::msg(format!(
                    "run cancelled; not started: {}",
                    cancelled.join(", ")
                )));
            }
            return Ok(());
        }
        let mode = opts.mode.unwrap_or(self.settings.build.mode);
        let mut errors: Vec<Error> = failures.into_iter().map(|(_, e)| e).collect();
        match mode {
            BuildMode::Triage if errors.len() > 1 => Err(Error::Batch(errors)),
            _ => Err(errors.remove(0)),
        }
    }
}

