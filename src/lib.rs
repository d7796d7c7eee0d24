pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod monitor;
pub mod offload;
pub mod profiler;
pub mod vram;

use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use command::{GpuLayers, ManualOverrides};
use config::Settings;
use engine::{
    DecisionEngine, LaunchMode, ProcessLauncher, Proposal, SessionEnd, SessionIntent, SessionObserver, SuccessChoice,
};
use history::HistoryStore;
use monitor::{LaunchOutcome, StopFlag};
use offload::OffloadLevelMapper;
use profiler::{ModelMetadata, ModelProfiler};
use vram::{detect_backends, VramResolver};

#[derive(Parser, Debug)]
#[command(name = "tensortune", version, about = "Auto-tunes GPU/CPU tensor offload for a KoboldCpp launch")]
struct Cli {
    /// Settings file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Search for the highest offload level that loads, starting from history
    Tune {
        #[command(flatten)]
        model: ModelArgs,
        /// Accept the first level that loads instead of asking
        #[arg(long)]
        accept_first: bool,
    },
    /// Launch once without searching
    Launch {
        #[command(flatten)]
        model: ModelArgs,
        /// Tuning level to build the offload plan from
        #[arg(long, allow_hyphen_values = true)]
        level: Option<i32>,
    },
    /// Replay the best remembered launch of a model
    Best {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Show recorded launches
    History {
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark a successful run as preferred
    Prefer { run_id: i64 },
    /// Show what the profiler infers and the plan at every level
    Profile {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Show the VRAM budget and detected GPU backends
    Vram,
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Path to the .gguf model
    model: String,
    /// GPU layers override: a number, "auto" or "off"
    #[arg(long)]
    gpu_layers: Option<GpuLayers>,
    #[arg(long)]
    context_size: Option<u32>,
    /// Declared layer count (block_count)
    #[arg(long)]
    layers: Option<u32>,
    /// Declared expert count
    #[arg(long)]
    experts: Option<u32>,
    /// Print process output while waiting for it to load
    #[arg(long)]
    show_output: bool,
    /// Extra arguments passed through to the server
    #[arg(last = true)]
    extra: Vec<String>,
}

impl ModelArgs {
    fn intent(&self, mode: LaunchMode) -> SessionIntent {
        let metadata = (self.layers.is_some() || self.experts.is_some()).then(|| ModelMetadata {
            block_count: self.layers,
            expert_count: self.experts,
            ..Default::default()
        });
        SessionIntent {
            model_path: self.model.clone(),
            metadata,
            overrides: ManualOverrides {
                gpu_layers: self.gpu_layers,
                context_size: self.context_size,
                extra_args: self.extra.clone(),
            },
            mode,
        }
    }
}

/// Prints proposals and asks on stdin what to do after a successful load.
struct ConsoleObserver {
    accept_first: bool,
    show_output: bool,
    stop: StopFlag,
    prompt: fn(bool) -> SuccessChoice,
}

fn ask(can_tighten: bool) -> SuccessChoice {
    let options = if can_tighten {
        "[a]ccept, [p]refer (accept and remember), [t]ighten"
    } else {
        "[a]ccept, [p]refer (accept and remember)"
    };
    let stdin = std::io::stdin();
    loop {
        print!("{}: ", options);
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        match stdin.lock().read_line(&mut answer) {
            Ok(0) | Err(_) => return SuccessChoice::Accept,
            Ok(_) => {}
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "" | "a" | "accept" => return SuccessChoice::Accept,
            "p" | "prefer" => return SuccessChoice::AcceptPreferred,
            "t" | "tighten" if can_tighten => return SuccessChoice::Tighten,
            _ => println!("?"),
        }
    }
}

#[async_trait]
impl SessionObserver for ConsoleObserver {
    fn on_proposal(&mut self, proposal: &Proposal) {
        println!("\n>> {} ({})", proposal.description, proposal.reason);
        println!("   {}", proposal.command.display());
    }

    fn on_line(&mut self, line: &str) {
        if self.show_output {
            println!("   | {}", line);
        }
    }

    fn on_outcome(&mut self, level: i32, outcome: &LaunchOutcome) {
        match outcome {
            LaunchOutcome::Success => println!("<< level {} loaded", level),
            LaunchOutcome::Oom { reason } => println!("<< level {} out of memory: {}", level, reason),
            LaunchOutcome::Crash { exit_code, .. } => println!("<< level {} crashed (exit {:?})", level, exit_code),
            LaunchOutcome::UserStopped => println!("<< stopped"),
        }
    }

    async fn after_success(&mut self, _proposal: &Proposal, run_id: i64, can_tighten: bool) -> SuccessChoice {
        println!("   recorded as run #{}", run_id);
        if self.accept_first {
            return SuccessChoice::Accept;
        }
        // Ctrl-C while waiting at the prompt leaves the answer unread.
        let ask = self.prompt;
        let mut prompt = tokio::task::spawn_blocking(move || ask(can_tighten));
        let mut tick = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                answer = &mut prompt => return answer.unwrap_or(SuccessChoice::Accept),
                _ = tick.tick() => {
                    if self.stop.is_requested() {
                        println!();
                        return SuccessChoice::Accept;
                    }
                }
            }
        }
    }
}

pub fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let code = match runtime.block_on(dispatch(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    };
    // A prompt abandoned by Ctrl-C still blocks on stdin.
    runtime.shutdown_timeout(Duration::from_millis(250));
    code
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let settings = Arc::new(config::load_settings(&config_path));
    log::info!("[tensortune] v{} settings {}", env!("CARGO_PKG_VERSION"), config_path.display());

    match cli.command {
        Cmd::Tune { model, accept_first } => {
            run_engine(settings, model.intent(LaunchMode::AutoTune), accept_first, model.show_output).await
        }
        Cmd::Launch { model, level } => {
            run_engine(settings, model.intent(LaunchMode::Direct { level }), true, model.show_output).await
        }
        Cmd::Best { model } => {
            run_engine(settings, model.intent(LaunchMode::BestRemembered), true, model.show_output).await
        }
        Cmd::History { model, limit } => {
            let history = open_history(&settings)?;
            for run in history.recent(model.as_deref(), limit)? {
                println!(
                    "#{:<5} {}  {:<32} level {:>3}  {:>7} MiB  {}{}",
                    run.id,
                    run.timestamp.format("%Y-%m-%d %H:%M"),
                    run.model_identity,
                    run.tuning_level,
                    run.vram_budget_bytes / (1024 * 1024),
                    run.outcome.as_str(),
                    if run.is_preferred() { "  *" } else { "" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Prefer { run_id } => {
            let history = open_history(&settings)?;
            if !history.mark_preferred(run_id)? {
                bail!("run #{} does not exist or did not load successfully", run_id);
            }
            println!("run #{} marked preferred", run_id);
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Profile { model } => {
            let intent = model.intent(LaunchMode::AutoTune);
            let profiler = ModelProfiler::new(settings.profiler.moe_layer_rules.clone());
            let profile = profiler.profile(&intent.model_path, intent.metadata.as_ref());
            println!("{}", serde_json::to_string_pretty(&*profile)?);
            let mapper = OffloadLevelMapper::from_settings(&settings.tuning);
            for level in (mapper.min_level()..=mapper.max_level()).rev() {
                println!("{}", mapper.describe(&profile, level));
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Vram => {
            let budget = VramResolver::from_settings(&settings).resolve();
            println!("{}", serde_json::to_string_pretty(&budget)?);
            println!("backends: {}", serde_json::to_string(&detect_backends())?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_history(settings: &Settings) -> anyhow::Result<HistoryStore> {
    let path = settings.history_path();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    HistoryStore::open(&path).with_context(|| format!("opening history {}", path.display()))
}

async fn run_engine(
    settings: Arc<Settings>,
    intent: SessionIntent,
    accept_first: bool,
    show_output: bool,
) -> anyhow::Result<ExitCode> {
    let history = Arc::new(open_history(&settings)?);
    let profiler = Arc::new(ModelProfiler::new(settings.profiler.moe_layer_rules.clone()));
    let vram = Arc::new(VramResolver::from_settings(&settings));
    let launcher = ProcessLauncher::from_settings(&settings)?;
    let mut engine = DecisionEngine::new(settings.clone(), profiler, vram, history, launcher);

    let stop = StopFlag::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("[tensortune] Ctrl-C, stopping");
                stop.request();
            }
        });
    }

    let mut observer = ConsoleObserver {
        accept_first,
        show_output,
        stop: stop.clone(),
        prompt: ask,
    };
    log::info!("[tensortune] session {}", engine.session_id());
    let end = engine.run(&intent, &stop, &mut observer).await?;
    match end {
        SessionEnd::Accepted { level, run_id } => {
            println!("running at level {} (run #{}); Ctrl-C to stop", level, run_id);
            if let Some(mut handle) = engine.launcher_mut().take_active() {
                log::info!("[tensortune] following pid {:?}", handle.pid());
                let poll = Duration::from_millis(settings.monitor.poll_interval_ms);
                let code = handle.follow(&stop, poll, |line| println!("   | {}", line)).await;
                handle.stop().await;
                if let Some(code) = code {
                    println!("server exited with code {}", code);
                    return Ok(if code == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE });
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        SessionEnd::Exhausted { last_level } => {
            eprintln!("no level loaded; level {} was the last attempt", last_level);
            Ok(ExitCode::FAILURE)
        }
        SessionEnd::OutOfMemory { level, reason } => {
            eprintln!("level {} ran out of memory: {}", level, reason);
            Ok(ExitCode::FAILURE)
        }
        SessionEnd::Crashed { level, exit_code, tail } => {
            eprintln!("level {} crashed (exit {:?}); last output:", level, exit_code);
            for line in tail {
                eprintln!("   | {}", line);
            }
            Ok(ExitCode::FAILURE)
        }
        SessionEnd::Stopped { level } => {
            println!("stopped at level {}", level);
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::LaunchCommand;
    use crate::vram::{BudgetSource, VramBudget};

    fn proposal() -> Proposal {
        Proposal {
            level: 3,
            reason: engine::StartReason::Heuristic,
            plan: None,
            description: "level 3".to_string(),
            command: LaunchCommand {
                program: "koboldcpp".to_string(),
                args: Vec::new(),
            },
            budget: VramBudget {
                total_bytes: 0,
                free_bytes: 0,
                source: BudgetSource::ConservativeDefault,
                gpu_id: 0,
                vendor: None,
                gpu_name: None,
            },
        }
    }

    fn observer(stop: &StopFlag, prompt: fn(bool) -> SuccessChoice) -> ConsoleObserver {
        ConsoleObserver {
            accept_first: false,
            show_output: false,
            stop: stop.clone(),
            prompt,
        }
    }

    // ── Success prompt ──

    #[tokio::test]
    async fn test_prompt_answer_is_returned() {
        let mut obs = observer(&StopFlag::new(), |can_tighten| {
            if can_tighten {
                SuccessChoice::Tighten
            } else {
                SuccessChoice::AcceptPreferred
            }
        });
        assert_eq!(obs.after_success(&proposal(), 1, true).await, SuccessChoice::Tighten);
        assert_eq!(obs.after_success(&proposal(), 1, false).await, SuccessChoice::AcceptPreferred);
    }

    #[tokio::test]
    async fn test_stop_request_ends_pending_prompt() {
        let stop = StopFlag::new();
        let mut obs = observer(&stop, |_| {
            std::thread::sleep(Duration::from_secs(2));
            SuccessChoice::Tighten
        });
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.request();
        });
        let started = std::time::Instant::now();
        assert_eq!(obs.after_success(&proposal(), 1, true).await, SuccessChoice::Accept);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_accept_first_skips_prompt() {
        let mut obs = observer(&StopFlag::new(), |_| panic!("prompted"));
        obs.accept_first = true;
        assert_eq!(obs.after_success(&proposal(), 1, true).await, SuccessChoice::Accept);
    }
}
