//! Tuning session state machine.
//!
//! A session profiles the model, reads the VRAM budget and the run history,
//! proposes a starting level, then loops LAUNCH → MONITOR → RECORD. OOM walks
//! the level down with a shrinking step, success lets the caller tighten one
//! level at a time, crash and user stop end the session. Every monitored
//! launch appends exactly one history row.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::command::{resolve_executable, GpuLayers, LaunchCommand, ManualOverrides};
use crate::config::Settings;
use crate::error::{Result, TuneError};
use crate::history::{HistoricalRun, HistoryStore, NewRun, RunOutcome};
use crate::monitor::{self, LaunchHandle, LaunchOutcome, SignatureTable, StopFlag, WatchOptions};
use crate::offload::{OffloadLevelMapper, OffloadPlan};
use crate::profiler::{ModelMetadata, ModelProfile, ModelProfiler};
use crate::vram::{detect_backends, Backends, BudgetSource, VramBudget, VramResolver};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    AutoTune,
    /// No search; a level only when given.
    Direct { level: Option<i32> },
    BestRemembered,
}

#[derive(Debug, Clone)]
pub struct SessionIntent {
    pub model_path: String,
    pub metadata: Option<ModelMetadata>,
    pub overrides: ManualOverrides,
    pub mode: LaunchMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartReason {
    PreferredHistory { run_id: i64 },
    HistorySuccess { run_id: i64 },
    Heuristic,
    RetryAfterOom { previous: i32 },
    Tighten { previous: i32 },
    ReturnToBest,
    Direct,
    Remembered { run_id: i64 },
}

impl fmt::Display for StartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartReason::PreferredHistory { run_id } => write!(f, "preferred run #{} at a similar VRAM budget", run_id),
            StartReason::HistorySuccess { run_id } => write!(f, "highest earlier success that fits (run #{})", run_id),
            StartReason::Heuristic => write!(f, "estimate from model size vs free VRAM"),
            StartReason::RetryAfterOom { previous } => write!(f, "retry after out-of-memory at level {}", previous),
            StartReason::Tighten { previous } => write!(f, "tightening from level {}", previous),
            StartReason::ReturnToBest => write!(f, "back to the best working level of this session"),
            StartReason::Direct => write!(f, "direct launch"),
            StartReason::Remembered { run_id } => write!(f, "replaying remembered run #{}", run_id),
        }
    }
}

/// What the engine is about to launch, and why.
#[derive(Debug, Clone)]
pub struct Proposal {
    pub level: i32,
    pub reason: StartReason,
    pub plan: Option<OffloadPlan>,
    pub description: String,
    pub command: LaunchCommand,
    pub budget: VramBudget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessChoice {
    Accept,
    AcceptPreferred,
    Tighten,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Accepted { level: i32, run_id: i64 },
    /// Minimum level also ran out of memory, or the iteration cap was hit.
    Exhausted { last_level: i32 },
    /// Single-shot launch that ran out of memory.
    OutOfMemory { level: i32, reason: String },
    Crashed { level: i32, exit_code: Option<i32>, tail: Vec<String> },
    Stopped { level: i32 },
}

/// Front-end hooks. Everything but `after_success` is informational.
#[async_trait]
pub trait SessionObserver: Send {
    fn on_proposal(&mut self, _proposal: &Proposal) {}
    fn on_line(&mut self, _line: &str) {}
    fn on_outcome(&mut self, _level: i32, _outcome: &LaunchOutcome) {}
    async fn after_success(&mut self, proposal: &Proposal, run_id: i64, can_tighten: bool) -> SuccessChoice;
}

/// Runs one command to classification. Keeps the process alive on success
/// until `release`.
#[async_trait]
pub trait Launcher: Send {
    async fn launch(
        &mut self,
        command: &LaunchCommand,
        stop: &StopFlag,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<LaunchOutcome>;

    async fn release(&mut self);
}

pub struct ProcessLauncher {
    table: SignatureTable,
    opts: WatchOptions,
    grace: Duration,
    active: Option<LaunchHandle>,
}

impl ProcessLauncher {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            table: SignatureTable::from_settings(&settings.monitor)?,
            opts: WatchOptions::from_settings(&settings.monitor, &settings.tuning),
            grace: Duration::from_secs(settings.monitor.stop_grace_secs),
            active: None,
        })
    }

    /// The process left running by the last successful launch.
    pub fn take_active(&mut self) -> Option<LaunchHandle> {
        self.active.take()
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &mut self,
        command: &LaunchCommand,
        stop: &StopFlag,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<LaunchOutcome> {
        self.release().await;
        let mut handle = monitor::start(command, self.grace)?;
        let outcome = handle.watch(&self.table, stop, &self.opts, |l| on_line(l)).await;
        if outcome == LaunchOutcome::Success {
            self.active = Some(handle);
        } else {
            handle.stop().await;
        }
        Ok(outcome)
    }

    async fn release(&mut self) {
        if let Some(mut handle) = self.active.take() {
            handle.stop().await;
        }
    }
}

/// History consulted when choosing where to start.
#[derive(Debug, Clone, Default)]
pub struct HistoryContext {
    pub preferred: Option<HistoricalRun>,
    pub successes: Vec<HistoricalRun>,
    pub failures: Vec<HistoricalRun>,
    pub nearest: Vec<HistoricalRun>,
}

pub struct DecisionEngine<L: Launcher> {
    settings: Arc<Settings>,
    profiler: Arc<ModelProfiler>,
    vram: Arc<VramResolver>,
    history: Arc<HistoryStore>,
    launcher: L,
    mapper: OffloadLevelMapper,
    backends: Backends,
    session_id: String,
}

impl<L: Launcher> DecisionEngine<L> {
    pub fn new(
        settings: Arc<Settings>,
        profiler: Arc<ModelProfiler>,
        vram: Arc<VramResolver>,
        history: Arc<HistoryStore>,
        launcher: L,
    ) -> Self {
        let mapper = OffloadLevelMapper::from_settings(&settings.tuning);
        Self {
            settings,
            profiler,
            vram,
            history,
            launcher,
            mapper,
            backends: detect_backends(),
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_backends(mut self, backends: Backends) -> Self {
        self.backends = backends;
        self
    }

    pub fn launcher_mut(&mut self) -> &mut L {
        &mut self.launcher
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn run(&mut self, intent: &SessionIntent, stop: &StopFlag, observer: &mut dyn SessionObserver) -> Result<SessionEnd> {
        match intent.mode {
            LaunchMode::AutoTune => self.run_session(intent, stop, observer).await,
            LaunchMode::Direct { level } => self.launch_direct(intent, level, stop, observer).await,
            LaunchMode::BestRemembered => self.launch_best_remembered(intent, stop, observer).await,
        }
    }

    // ── INIT / PROPOSE ──

    pub fn load_context(&self, identity: &str, budget: &VramBudget) -> Result<HistoryContext> {
        let tuning = &self.settings.tuning;
        Ok(HistoryContext {
            preferred: self
                .history
                .preferred_near_budget(identity, budget.free_bytes, tuning.preferred_vram_tolerance)?,
            successes: self.history.success_runs(identity)?,
            failures: self.history.failed_levels(identity)?,
            nearest: self.history.nearest_vram_runs(identity, budget.free_bytes, 5)?,
        })
    }

    /// Lowest level that ran out of memory with at least the current budget.
    fn oom_ceiling(&self, budget: &VramBudget, ctx: &HistoryContext) -> Option<i32> {
        let floor = budget.free_bytes as f64 * (1.0 - self.settings.tuning.oom_avoid_tolerance);
        ctx.failures
            .iter()
            .filter(|r| r.vram_budget_bytes as f64 >= floor)
            .map(|r| r.tuning_level)
            .min()
    }

    pub fn plan_start(&self, profile: &ModelProfile, budget: &VramBudget, ctx: &HistoryContext) -> (i32, StartReason) {
        if let Some(run) = &ctx.preferred {
            return (self.mapper.clamp(run.tuning_level), StartReason::PreferredHistory { run_id: run.id });
        }

        let tuning = &self.settings.tuning;
        let vram = &self.settings.vram;
        let free = budget.free_bytes;
        let ceiling = self.oom_ceiling(budget, ctx);
        let below_ceiling = |level: i32| ceiling.map_or(true, |c| level < c);

        let fits = |run: &HistoricalRun| {
            let by_budget = run.vram_budget_bytes as f64 <= free as f64 * (1.0 + tuning.history_vram_tolerance);
            let by_usage = run
                .observed_vram_used_bytes
                .is_some_and(|used| used.saturating_add(vram.safety_buffer_bytes) <= free);
            by_budget || by_usage
        };
        if let Some(run) = ctx
            .successes
            .iter()
            .filter(|r| fits(r) && below_ceiling(r.tuning_level))
            .max_by_key(|r| r.tuning_level)
        {
            return (self.mapper.clamp(run.tuning_level), StartReason::HistorySuccess { run_id: run.id });
        }

        let top = match ceiling {
            Some(c) => (c - 1).max(self.mapper.min_level()),
            None => self.mapper.max_level(),
        };
        let Some(full) = profile.estimated_full_gpu_bytes() else {
            return (0.min(top), StartReason::Heuristic);
        };
        let available = free
            .saturating_sub(vram.safety_buffer_bytes)
            .saturating_sub(vram.min_free_after_load_bytes) as f64;
        let layers = f64::from(profile.layer_count.max(1));
        for level in (self.mapper.min_level()..=top).rev() {
            let share = self.mapper.gpu_resident_volume(profile, level) / layers;
            if share * full as f64 <= available {
                return (level, StartReason::Heuristic);
            }
        }
        (self.mapper.min_level(), StartReason::Heuristic)
    }

    fn launch_settings(&self) -> Result<Settings> {
        let mut settings = (*self.settings).clone();
        settings.executable = resolve_executable(&settings.executable)?;
        Ok(settings)
    }

    fn explain(&self, proposal: &Proposal) {
        log::info!(
            "[engine] level {}: {} ({} MiB free, {:?})",
            proposal.level,
            proposal.reason,
            proposal.budget.free_bytes / MIB,
            proposal.budget.source
        );
        log::info!("[engine] {}", proposal.description);
        log::info!("[engine] command: {}", proposal.command.display());
    }

    /// Free VRAM consumed by the process, read after it had time to settle.
    async fn observe_usage(&self, before: &VramBudget) -> Option<u64> {
        if before.source != BudgetSource::Hardware {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(self.settings.tuning.vram_stabilization_wait_ms)).await;
        let after = self.vram.resolve();
        if after.source != BudgetSource::Hardware {
            return None;
        }
        if after.free_bytes < self.settings.vram.min_free_after_load_bytes {
            log::warn!(
                "[engine] only {} MiB VRAM left after load; a lower level may be more stable",
                after.free_bytes / MIB
            );
        }
        Some(before.free_bytes.saturating_sub(after.free_bytes))
    }

    fn record(
        &self,
        identity: &str,
        proposal: &Proposal,
        outcome: RunOutcome,
        observed: Option<u64>,
    ) -> Result<i64> {
        self.history.append(&NewRun {
            session_id: &self.session_id,
            model_identity: identity,
            tuning_level: proposal.level,
            vram_budget_bytes: proposal.budget.free_bytes,
            outcome,
            observed_vram_used_bytes: observed,
            args: &proposal.command.args,
        })
    }

    async fn launch_proposal(
        &mut self,
        proposal: &Proposal,
        stop: &StopFlag,
        observer: &mut dyn SessionObserver,
    ) -> Result<LaunchOutcome> {
        self.explain(proposal);
        observer.on_proposal(proposal);
        let mut forward = |line: &str| observer.on_line(line);
        let outcome = self.launcher.launch(&proposal.command, stop, &mut forward).await?;
        observer.on_outcome(proposal.level, &outcome);
        Ok(outcome)
    }

    // ── Auto-tune ──

    pub async fn run_session(
        &mut self,
        intent: &SessionIntent,
        stop: &StopFlag,
        observer: &mut dyn SessionObserver,
    ) -> Result<SessionEnd> {
        let launch_settings = self.launch_settings()?;
        let profile = self.profiler.profile(&intent.model_path, intent.metadata.as_ref());
        let budget = self.vram.resolve();
        let ctx = self.load_context(&profile.identity, &budget)?;
        if let Some(near) = ctx.nearest.first() {
            log::info!(
                "[engine] closest earlier run: level {} at {} MiB -> {}",
                near.tuning_level,
                near.vram_budget_bytes / MIB,
                near.outcome.as_str()
            );
        }

        let (mut level, mut reason) = self.plan_start(&profile, &budget, &ctx);
        let min = self.mapper.min_level();
        let max = self.mapper.max_level();
        let tuning = self.settings.tuning.clone();
        let mut ooms: u32 = 0;
        let mut best_success: Option<i32> = None;
        let mut lowest_oom: Option<i32> = None;

        for _ in 0..tuning.max_iterations {
            let budget = self.vram.resolve();
            let plan = self.mapper.resolve(&profile, level);
            let command = LaunchCommand::build(&launch_settings, &intent.model_path, Some(&plan), &intent.overrides, self.backends);
            let proposal = Proposal {
                level,
                reason: reason.clone(),
                description: self.mapper.describe(&profile, level),
                plan: Some(plan),
                command,
                budget,
            };

            match self.launch_proposal(&proposal, stop, observer).await? {
                LaunchOutcome::Success => {
                    let observed = self.observe_usage(&proposal.budget).await;
                    let run_id = self.record(&profile.identity, &proposal, RunOutcome::Success, observed)?;
                    best_success = Some(best_success.map_or(level, |b| b.max(level)));

                    let can_tighten = level < max && lowest_oom.map_or(true, |c| level + 1 < c);
                    match observer.after_success(&proposal, run_id, can_tighten).await {
                        SuccessChoice::Tighten if can_tighten => {
                            self.launcher.release().await;
                            reason = StartReason::Tighten { previous: level };
                            level += 1;
                        }
                        SuccessChoice::AcceptPreferred => {
                            self.history.mark_preferred(run_id)?;
                            return Ok(SessionEnd::Accepted { level, run_id });
                        }
                        _ => return Ok(SessionEnd::Accepted { level, run_id }),
                    }
                }
                LaunchOutcome::Oom { reason: why } => {
                    log::warn!("[engine] level {} ran out of memory: {}", level, why);
                    self.record(&profile.identity, &proposal, RunOutcome::Oom, None)?;
                    lowest_oom = Some(lowest_oom.map_or(level, |c| c.min(level)));

                    match best_success {
                        Some(best) if level == best + 1 => {
                            reason = StartReason::ReturnToBest;
                            level = best;
                            continue;
                        }
                        // The earlier success no longer holds at this budget.
                        Some(best) if level <= best => best_success = None,
                        _ => {}
                    }
                    if level <= min {
                        return Ok(SessionEnd::Exhausted { last_level: level });
                    }
                    let step = (tuning.initial_oom_step >> ooms.min(30)).max(1);
                    ooms += 1;
                    let mut next = (level - step).max(min);
                    if let Some(best) = best_success {
                        next = next.max(best + 1);
                    }
                    reason = StartReason::RetryAfterOom { previous: level };
                    level = next;
                }
                LaunchOutcome::Crash { exit_code, tail } => {
                    self.record(&profile.identity, &proposal, RunOutcome::Crash, None)?;
                    log::error!("[engine] level {} crashed (exit {:?})", level, exit_code);
                    return Ok(SessionEnd::Crashed { level, exit_code, tail });
                }
                LaunchOutcome::UserStopped => {
                    self.record(&profile.identity, &proposal, RunOutcome::UserStopped, None)?;
                    return Ok(SessionEnd::Stopped { level });
                }
            }
        }

        log::warn!("[engine] gave up after {} launches", tuning.max_iterations);
        Ok(SessionEnd::Exhausted { last_level: level })
    }

    // ── Single-shot modes ──

    async fn launch_single(
        &mut self,
        identity: &str,
        proposal: Proposal,
        stop: &StopFlag,
        observer: &mut dyn SessionObserver,
    ) -> Result<SessionEnd> {
        let level = proposal.level;
        match self.launch_proposal(&proposal, stop, observer).await? {
            LaunchOutcome::Success => {
                let observed = self.observe_usage(&proposal.budget).await;
                let run_id = self.record(identity, &proposal, RunOutcome::Success, observed)?;
                if observer.after_success(&proposal, run_id, false).await == SuccessChoice::AcceptPreferred {
                    self.history.mark_preferred(run_id)?;
                }
                Ok(SessionEnd::Accepted { level, run_id })
            }
            LaunchOutcome::Oom { reason } => {
                self.record(identity, &proposal, RunOutcome::Oom, None)?;
                Ok(SessionEnd::OutOfMemory { level, reason })
            }
            LaunchOutcome::Crash { exit_code, tail } => {
                self.record(identity, &proposal, RunOutcome::Crash, None)?;
                Ok(SessionEnd::Crashed { level, exit_code, tail })
            }
            LaunchOutcome::UserStopped => {
                self.record(identity, &proposal, RunOutcome::UserStopped, None)?;
                Ok(SessionEnd::Stopped { level })
            }
        }
    }

    /// Launch without searching. The recorded level is the given one, or the
    /// level whose plan matches the GPU layer value actually used.
    pub async fn launch_direct(
        &mut self,
        intent: &SessionIntent,
        level: Option<i32>,
        stop: &StopFlag,
        observer: &mut dyn SessionObserver,
    ) -> Result<SessionEnd> {
        let launch_settings = self.launch_settings()?;
        let profile = self.profiler.profile(&intent.model_path, intent.metadata.as_ref());
        let budget = self.vram.resolve();
        let plan = level.map(|l| self.mapper.resolve(&profile, l));
        let command = LaunchCommand::build(&launch_settings, &intent.model_path, plan.as_ref(), &intent.overrides, self.backends);

        let recorded_level = match &plan {
            Some(p) => p.tuning_level,
            None => {
                let parsed = command.parsed()?;
                match parsed.gpu_layers.unwrap_or(GpuLayers::Auto) {
                    GpuLayers::Auto => 0,
                    GpuLayers::Off => self.mapper.min_level(),
                    GpuLayers::Count(n) => self.mapper.infer_level(&profile, n, parsed.override_pattern.as_deref()),
                }
            }
        };
        let proposal = Proposal {
            level: recorded_level,
            reason: StartReason::Direct,
            description: self.mapper.describe(&profile, recorded_level),
            plan,
            command,
            budget,
        };
        self.launch_single(&profile.identity, proposal, stop, observer).await
    }

    /// Replay the argument list of the best remembered run.
    pub async fn launch_best_remembered(
        &mut self,
        intent: &SessionIntent,
        stop: &StopFlag,
        observer: &mut dyn SessionObserver,
    ) -> Result<SessionEnd> {
        let launch_settings = self.launch_settings()?;
        let profile = self.profiler.profile(&intent.model_path, intent.metadata.as_ref());
        let best = self
            .history
            .best_run(&profile.identity)?
            .ok_or_else(|| TuneError::NoRememberedRun(profile.identity.clone()))?;
        let budget = self.vram.resolve();

        let command = if best.args.is_empty() {
            let plan = self.mapper.resolve(&profile, best.tuning_level);
            LaunchCommand::build(&launch_settings, &intent.model_path, Some(&plan), &intent.overrides, self.backends)
        } else {
            let program = match best.args.first() {
                Some(first) if first.to_ascii_lowercase().ends_with(".py") => launch_settings.python.clone(),
                _ => launch_settings.executable.clone(),
            };
            let mut args = best.args.clone();
            args.extend(intent.overrides.extra_args.iter().cloned());
            LaunchCommand { program, args }
        };
        if budget.free_bytes < best.vram_budget_bytes {
            log::warn!(
                "[engine] {} MiB free now, run #{} was recorded with {} MiB",
                budget.free_bytes / MIB,
                best.id,
                best.vram_budget_bytes / MIB
            );
        }

        let proposal = Proposal {
            level: best.tuning_level,
            reason: StartReason::Remembered { run_id: best.id },
            description: self.mapper.describe(&profile, best.tuning_level),
            plan: None,
            command,
            budget,
        };
        self.launch_single(&profile.identity, proposal, stop, observer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::parse_args;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GB: u64 = 1_000_000_000;
    const QWEN: &str = "/models/Qwen3-30B-A3B-Q4_K_M.gguf";

    /// OOMs whenever more than `max_gpu_layers` are requested, unless a
    /// scripted outcome is queued.
    struct FakeLauncher {
        max_gpu_layers: u32,
        script: VecDeque<LaunchOutcome>,
        launched: Arc<Mutex<Vec<LaunchCommand>>>,
        releases: usize,
    }

    impl FakeLauncher {
        fn new(max_gpu_layers: u32) -> Self {
            Self {
                max_gpu_layers,
                script: VecDeque::new(),
                launched: Arc::new(Mutex::new(Vec::new())),
                releases: 0,
            }
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(
            &mut self,
            command: &LaunchCommand,
            _stop: &StopFlag,
            on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> Result<LaunchOutcome> {
            self.launched.lock().unwrap().push(command.clone());
            on_line("loading model");
            if let Some(outcome) = self.script.pop_front() {
                return Ok(outcome);
            }
            let parsed = parse_args(&command.args)?;
            let layers = match parsed.gpu_layers {
                Some(GpuLayers::Count(n)) => n,
                _ => 0,
            };
            if layers > self.max_gpu_layers {
                Ok(LaunchOutcome::Oom {
                    reason: "CUDA out of memory".to_string(),
                })
            } else {
                Ok(LaunchOutcome::Success)
            }
        }

        async fn release(&mut self) {
            self.releases += 1;
        }
    }

    #[derive(Default)]
    struct ScriptedObserver {
        choices: VecDeque<SuccessChoice>,
        always: Option<SuccessChoice>,
        proposals: Vec<(i32, StartReason)>,
        lines: usize,
    }

    #[async_trait]
    impl SessionObserver for ScriptedObserver {
        fn on_proposal(&mut self, proposal: &Proposal) {
            self.proposals.push((proposal.level, proposal.reason.clone()));
        }

        fn on_line(&mut self, _line: &str) {
            self.lines += 1;
        }

        async fn after_success(&mut self, _proposal: &Proposal, _run_id: i64, _can_tighten: bool) -> SuccessChoice {
            self.choices
                .pop_front()
                .or(self.always)
                .unwrap_or(SuccessChoice::Accept)
        }
    }

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.executable = "koboldcpp-test-binary".to_string();
        s.tuning.vram_stabilization_wait_ms = 0;
        s.launch.threads = "4".to_string();
        s
    }

    fn engine_with(launcher: FakeLauncher, budget: u64, history: Arc<HistoryStore>) -> DecisionEngine<FakeLauncher> {
        let settings = Arc::new(settings());
        let profiler = Arc::new(ModelProfiler::new(settings.profiler.moe_layer_rules.clone()));
        let vram = Arc::new(VramResolver::new(Vec::new(), 0, Some(budget), 4 * GB));
        DecisionEngine::new(settings, profiler, vram, history, launcher).with_backends(Backends::default())
    }

    fn intent(mode: LaunchMode) -> SessionIntent {
        SessionIntent {
            model_path: QWEN.to_string(),
            metadata: None,
            overrides: ManualOverrides::default(),
            mode,
        }
    }

    fn success(history: &HistoryStore, level: i32, budget: u64) -> i64 {
        history
            .append(&NewRun {
                session_id: "old",
                model_identity: "qwen3-30b-a3b-q4_k_m",
                tuning_level: level,
                vram_budget_bytes: budget,
                outcome: RunOutcome::Success,
                observed_vram_used_bytes: None,
                args: &[],
            })
            .unwrap()
    }

    fn oom(history: &HistoryStore, level: i32, budget: u64) {
        history
            .append(&NewRun {
                session_id: "old",
                model_identity: "qwen3-30b-a3b-q4_k_m",
                tuning_level: level,
                vram_budget_bytes: budget,
                outcome: RunOutcome::Oom,
                observed_vram_used_bytes: None,
                args: &[],
            })
            .unwrap();
    }

    fn start_for(engine: &DecisionEngine<FakeLauncher>) -> (i32, StartReason) {
        let profile = engine.profiler.profile(QWEN, None);
        let budget = engine.vram.resolve();
        let ctx = engine.load_context(&profile.identity, &budget).unwrap();
        engine.plan_start(&profile, &budget, &ctx)
    }

    // ── PROPOSE ──

    #[test]
    fn test_preferred_run_near_budget_wins() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let preferred = success(&history, 3, 12 * GB);
        success(&history, 8, 12 * GB);
        history.mark_preferred(preferred).unwrap();

        let engine = engine_with(FakeLauncher::new(48), 12_300_000_000, history);
        assert_eq!(start_for(&engine), (3, StartReason::PreferredHistory { run_id: preferred }));
    }

    #[test]
    fn test_highest_fitting_success() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        success(&history, 4, 10 * GB);
        let six = success(&history, 6, 10 * GB);
        success(&history, 9, 40 * GB);
        let engine = engine_with(FakeLauncher::new(48), 12 * GB, history);
        assert_eq!(start_for(&engine), (6, StartReason::HistorySuccess { run_id: six }));
    }

    #[test]
    fn test_success_levels_that_oomed_at_this_budget_are_skipped() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let four = success(&history, 4, 10 * GB);
        success(&history, 6, 10 * GB);
        oom(&history, 6, 14 * GB);
        let engine = engine_with(FakeLauncher::new(48), 12 * GB, history);
        assert_eq!(start_for(&engine), (4, StartReason::HistorySuccess { run_id: four }));
    }

    #[test]
    fn test_heuristic_from_model_size() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let engine = engine_with(FakeLauncher::new(48), 12 * GB, history.clone());
        assert_eq!(start_for(&engine), (7, StartReason::Heuristic));

        let engine = engine_with(FakeLauncher::new(48), 100 * GB, history);
        assert_eq!(start_for(&engine), (10, StartReason::Heuristic));
    }

    #[test]
    fn test_unknown_size_starts_at_zero() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let engine = engine_with(FakeLauncher::new(48), 12 * GB, history);
        let profile = engine.profiler.profile("mystery.gguf", None);
        let budget = engine.vram.resolve();
        let (level, reason) = engine.plan_start(&profile, &budget, &HistoryContext::default());
        assert_eq!((level, reason), (0, StartReason::Heuristic));
    }

    // ── Session loop ──

    #[tokio::test]
    async fn test_oom_walks_down_to_exhaustion() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let mut engine = engine_with(FakeLauncher::new(0), 100 * GB, history.clone());
        // Even level -6 (no GPU layers) fails.
        engine.launcher_mut().script = std::iter::repeat(LaunchOutcome::Oom { reason: "oom".into() })
            .take(64)
            .collect();
        let mut observer = ScriptedObserver::default();

        let end = engine.run_session(&intent(LaunchMode::AutoTune), &StopFlag::new(), &mut observer).await.unwrap();
        assert_eq!(end, SessionEnd::Exhausted { last_level: -6 });

        let levels: Vec<i32> = observer.proposals.iter().map(|(l, _)| *l).collect();
        assert_eq!(levels.first(), Some(&10));
        assert_eq!(levels.last(), Some(&-6));
        assert!(levels.windows(2).all(|w| w[1] < w[0]), "{levels:?}");
        assert_eq!(levels[1], 6);
        assert_eq!(levels[2], 4);

        let rows = history.recent(Some("qwen3-30b-a3b-q4_k_m"), 100).unwrap();
        assert_eq!(rows.len(), levels.len());
        assert!(rows.iter().all(|r| r.outcome == RunOutcome::Oom));
    }

    #[tokio::test]
    async fn test_success_records_one_row_without_dedup() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        for _ in 0..2 {
            let mut engine = engine_with(FakeLauncher::new(48), 12 * GB, history.clone());
            let mut observer = ScriptedObserver::default();
            let end = engine.run_session(&intent(LaunchMode::AutoTune), &StopFlag::new(), &mut observer).await.unwrap();
            assert!(matches!(end, SessionEnd::Accepted { level: 7, .. }));
            assert_eq!(engine.launcher_mut().launched.lock().unwrap().len(), 1);
        }
        let rows = history.success_runs("qwen3-30b-a3b-q4_k_m").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tuning_level, rows[1].tuning_level);
        assert_ne!(rows[0].session_id, rows[1].session_id);
    }

    #[tokio::test]
    async fn test_tighten_until_oom_then_return_to_best() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let earlier = success(&history, 1, 100 * GB);
        let mut engine = engine_with(FakeLauncher::new(0), 100 * GB, history.clone());

        // Level 1 fits, level 2 does not.
        let profile = engine.profiler.profile(QWEN, None);
        let limit = engine.mapper.resolve(&profile, 1).gpu_layers;
        assert!(engine.mapper.resolve(&profile, 2).gpu_layers > limit);
        engine.launcher_mut().max_gpu_layers = limit;

        let mut observer = ScriptedObserver {
            always: Some(SuccessChoice::Tighten),
            ..Default::default()
        };
        let end = engine.run_session(&intent(LaunchMode::AutoTune), &StopFlag::new(), &mut observer).await.unwrap();

        assert!(matches!(end, SessionEnd::Accepted { level: 1, .. }), "{end:?}");
        assert_eq!(
            observer.proposals,
            vec![
                (1, StartReason::HistorySuccess { run_id: earlier }),
                (2, StartReason::Tighten { previous: 1 }),
                (1, StartReason::ReturnToBest),
            ]
        );
        assert_eq!(engine.launcher_mut().releases, 1);
        assert!(observer.lines > 0);

        let outcomes: Vec<RunOutcome> = history
            .recent(None, 10)
            .unwrap()
            .into_iter()
            .filter(|r| r.session_id == engine.session_id())
            .map(|r| r.outcome)
            .collect();
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes.iter().filter(|o| **o == RunOutcome::Oom).count(), 1);
    }

    #[tokio::test]
    async fn test_accept_preferred_marks_run() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let mut engine = engine_with(FakeLauncher::new(48), 12 * GB, history.clone());
        let mut observer = ScriptedObserver {
            always: Some(SuccessChoice::AcceptPreferred),
            ..Default::default()
        };
        let end = engine.run_session(&intent(LaunchMode::AutoTune), &StopFlag::new(), &mut observer).await.unwrap();
        let SessionEnd::Accepted { run_id, .. } = end else {
            panic!("unexpected end {end:?}");
        };
        let best = history.best_run("qwen3-30b-a3b-q4_k_m").unwrap().unwrap();
        assert_eq!(best.id, run_id);
        assert!(best.preferred);
    }

    #[tokio::test]
    async fn test_crash_ends_session() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let mut launcher = FakeLauncher::new(48);
        launcher.script.push_back(LaunchOutcome::Crash {
            exit_code: Some(1),
            tail: vec!["segfault".to_string()],
        });
        let mut engine = engine_with(launcher, 12 * GB, history.clone());
        let end = engine
            .run_session(&intent(LaunchMode::AutoTune), &StopFlag::new(), &mut ScriptedObserver::default())
            .await
            .unwrap();
        assert_eq!(
            end,
            SessionEnd::Crashed {
                level: 7,
                exit_code: Some(1),
                tail: vec!["segfault".to_string()],
            }
        );
        assert_eq!(history.recent(None, 10).unwrap()[0].outcome, RunOutcome::Crash);
    }

    #[tokio::test]
    async fn test_user_stop_recorded_distinctly() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let mut launcher = FakeLauncher::new(48);
        launcher.script.push_back(LaunchOutcome::UserStopped);
        let mut engine = engine_with(launcher, 12 * GB, history.clone());
        let end = engine
            .run_session(&intent(LaunchMode::AutoTune), &StopFlag::new(), &mut ScriptedObserver::default())
            .await
            .unwrap();
        assert_eq!(end, SessionEnd::Stopped { level: 7 });
        let rows = history.recent(None, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, RunOutcome::UserStopped);
        assert!(history.best_run("qwen3-30b-a3b-q4_k_m").unwrap().is_none());
    }

    // ── Single-shot modes ──

    #[tokio::test]
    async fn test_direct_launch_infers_level() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let mut engine = engine_with(FakeLauncher::new(48), 12 * GB, history.clone());
        let mut direct = intent(LaunchMode::Direct { level: None });
        direct.overrides.gpu_layers = Some(GpuLayers::Count(48));

        let end = engine.run(&direct, &StopFlag::new(), &mut ScriptedObserver::default()).await.unwrap();
        let SessionEnd::Accepted { level, .. } = end else {
            panic!("unexpected end {end:?}");
        };
        let profile = engine.profiler.profile(QWEN, None);
        assert_eq!(engine.mapper.resolve(&profile, level).gpu_layers, 48);

        let launched = engine.launcher_mut().launched.lock().unwrap().clone();
        let parsed = launched[0].parsed().unwrap();
        assert_eq!(parsed.gpu_layers, Some(GpuLayers::Count(48)));
        assert_eq!(parsed.override_pattern, None);
    }

    #[tokio::test]
    async fn test_direct_launch_oom_is_reported() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let mut engine = engine_with(FakeLauncher::new(10), 12 * GB, history.clone());
        let end = engine
            .launch_direct(&intent(LaunchMode::Direct { level: Some(10) }), Some(10), &StopFlag::new(), &mut ScriptedObserver::default())
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::OutOfMemory { level: 10, .. }));
        assert_eq!(history.failed_levels("qwen3-30b-a3b-q4_k_m").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_best_remembered_replays_args() {
        let history = Arc::new(HistoryStore::open_in_memory().unwrap());
        let mut engine = engine_with(FakeLauncher::new(48), 12 * GB, history.clone());
        let missing = engine
            .run(&intent(LaunchMode::BestRemembered), &StopFlag::new(), &mut ScriptedObserver::default())
            .await;
        assert!(matches!(missing, Err(TuneError::NoRememberedRun(_))));

        engine
            .run(&intent(LaunchMode::AutoTune), &StopFlag::new(), &mut ScriptedObserver::default())
            .await
            .unwrap();
        let end = engine
            .run(&intent(LaunchMode::BestRemembered), &StopFlag::new(), &mut ScriptedObserver::default())
            .await
            .unwrap();
        assert!(matches!(end, SessionEnd::Accepted { level: 7, .. }));

        let launched = engine.launcher_mut().launched.lock().unwrap().clone();
        assert_eq!(launched.len(), 2);
        assert_eq!(launched[0], launched[1]);
        assert_eq!(history.success_runs("qwen3-30b-a3b-q4_k_m").unwrap().len(), 2);
    }
}
