//! Versioned launcher settings, stored as JSON in the user config directory.
//!
//! Every section is `#[serde(default)]`, so keys missing from an older or
//! hand-edited file are backfilled with defaults instead of failing the load.
//! Files written before version 2 used flat keys (`manual_vram_total_mb`,
//! `koboldcpp_executable`, ...); those are mapped into the nested sections.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TuneError};

pub const SETTINGS_VERSION: u32 = 2;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    /// Inference server executable (binary or `.py` launcher script).
    pub executable: String,
    /// Interpreter used when `executable` is a Python script.
    pub python: String,
    /// History database; defaults to the user data dir when unset.
    pub history_db: Option<PathBuf>,
    pub gpu: GpuSettings,
    pub vram: VramSettings,
    pub tuning: TuningSettings,
    pub monitor: MonitorSettings,
    pub launch: LaunchSettings,
    pub profiler: ProfilerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            executable: default_executable(),
            python: "python3".to_string(),
            history_db: None,
            gpu: GpuSettings::default(),
            vram: VramSettings::default(),
            tuning: TuningSettings::default(),
            monitor: MonitorSettings::default(),
            launch: LaunchSettings::default(),
            profiler: ProfilerSettings::default(),
        }
    }
}

fn default_executable() -> String {
    if cfg!(target_os = "windows") {
        "koboldcpp.exe".to_string()
    } else {
        "./koboldcpp".to_string()
    }
}

// ── GPU selection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuSelection {
    #[default]
    Auto,
    Nvidia,
    Amd,
    Intel,
    Apple,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSettings {
    pub selection: GpuSelection,
    pub gpu_id: u32,
    pub detect_nvidia: bool,
    pub detect_amd: bool,
    pub detect_intel: bool,
    pub detect_apple: bool,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            selection: GpuSelection::Auto,
            gpu_id: 0,
            detect_nvidia: true,
            detect_amd: true,
            detect_intel: true,
            detect_apple: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VramSettings {
    /// When set, replaces whatever the hardware reports.
    pub manual_budget_bytes: Option<u64>,
    pub safety_buffer_bytes: u64,
    pub min_free_after_load_bytes: u64,
    /// Used when no provider answers and no manual budget is configured.
    pub conservative_default_bytes: u64,
}

impl Default for VramSettings {
    fn default() -> Self {
        Self {
            manual_budget_bytes: None,
            safety_buffer_bytes: 768 * MIB,
            min_free_after_load_bytes: 512 * MIB,
            conservative_default_bytes: 4 * GIB,
        }
    }
}

// ── Tuning search ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningSettings {
    pub min_level: i32,
    pub max_level: i32,
    pub initial_oom_step: i32,
    /// Relative distance between budgets for a preferred run to count as "the same machine state".
    pub preferred_vram_tolerance: f64,
    pub history_vram_tolerance: f64,
    pub oom_avoid_tolerance: f64,
    pub loading_timeout_secs: u64,
    pub vram_stabilization_wait_ms: u64,
    pub treat_timeout_as_oom: bool,
    pub max_iterations: u32,
}

impl Default for TuningSettings {
    fn default() -> Self {
        Self {
            min_level: -6,
            max_level: 10,
            initial_oom_step: 4,
            preferred_vram_tolerance: 0.10,
            history_vram_tolerance: 0.25,
            oom_avoid_tolerance: 0.10,
            loading_timeout_secs: 60,
            vram_stabilization_wait_ms: 3000,
            treat_timeout_as_oom: true,
            max_iterations: 32,
        }
    }
}

// ── Output monitoring ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_success_patterns")]
    pub success_patterns: Vec<String>,
    #[serde(default = "default_oom_patterns")]
    pub oom_patterns: Vec<String>,
    #[serde(default = "default_oom_exit_codes")]
    pub oom_exit_codes: Vec<i32>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            success_patterns: default_success_patterns(),
            oom_patterns: default_oom_patterns(),
            oom_exit_codes: default_oom_exit_codes(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_grace_secs: default_stop_grace_secs(),
            tail_lines: default_tail_lines(),
        }
    }
}

fn default_success_patterns() -> Vec<String> {
    vec![
        r"Starting Kobold API on port \d+".to_string(),
        r"server is listening on".to_string(),
        r"HTTP server listening".to_string(),
    ]
}

fn default_oom_patterns() -> Vec<String> {
    [
        "cuda out of memory",
        "outofmemory",
        "out of vram",
        "cublasstatusallocfailed",
        "ggml_cuda_host_malloc: failed to allocate",
        "ggml-cuda backend: failed to allocate",
        "failed to allocate memory on gpu",
        "vram allocation failed",
        r"unable to allocate .* buffer",
        "llama_new_context_with_model: failed to load model",
        "unable to initialize backend",
        "failed to load model",
        "cl_out_of_resources",
        "error: out of device memory",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_oom_exit_codes() -> Vec<i32> {
    vec![2]
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_tail_lines() -> usize {
    40
}

// ── Launch arguments ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// `auto`, `off` or a number; used by direct launches without a level.
    pub gpu_layers: String,
    pub context_size: Option<u32>,
    pub port: u16,
    /// `auto` or a thread count.
    pub threads: String,
    /// `auto`, `cuda`, `vulkan`, `hip`, `cpu` or `none`.
    pub backend: String,
    pub extra_args: Vec<String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            gpu_layers: "auto".to_string(),
            context_size: Some(16384),
            port: 5000,
            threads: "auto".to_string(),
            backend: "auto".to_string(),
            extra_args: Vec::new(),
        }
    }
}

// ── Model profiling ────────────────────────────────────────────────────────

/// Minimum layer count for MoE models of a family within a parameter band.
/// Size-based curves under-count layers for sparse architectures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoeLayerRule {
    /// Family name as reported by the profiler, or `*` for any MoE model.
    pub family: String,
    pub min_params_b: f64,
    pub max_params_b: f64,
    pub min_layers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerSettings {
    pub moe_layer_rules: Vec<MoeLayerRule>,
}

impl Default for ProfilerSettings {
    fn default() -> Self {
        let rule = |family: &str, min: f64, max: f64, layers: u32| MoeLayerRule {
            family: family.to_string(),
            min_params_b: min,
            max_params_b: max,
            min_layers: layers,
        };
        Self {
            moe_layer_rules: vec![
                rule("qwen", 25.0, 40.0, 48),
                rule("mixtral", 40.0, 60.0, 32),
                rule("deepseek", 200.0, f64::MAX, 60),
                rule("*", 100.0, f64::MAX, 48),
            ],
        }
    }
}

// ── Paths ──────────────────────────────────────────────────────────────────

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("tensortune").join("config.json"))
        .unwrap_or_else(|| PathBuf::from("tensortune_config.json"))
}

pub fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("tensortune").join("history.db"))
        .unwrap_or_else(|| PathBuf::from("tensortune_history.db"))
}

/// Largest distance of a tuning level from zero.
pub const LEVEL_LIMIT: i32 = 64;

impl Settings {
    pub fn history_path(&self) -> PathBuf {
        self.history_db.clone().unwrap_or_else(default_history_path)
    }

    /// Clamp values that would break the search into a usable range.
    fn sanitize(&mut self) {
        let defaults = TuningSettings::default();
        if !(-LEVEL_LIMIT..=-1).contains(&self.tuning.min_level) {
            log::warn!(
                "[config] tuning.min_level {} must be within -{}..=-1, using {}",
                self.tuning.min_level,
                LEVEL_LIMIT,
                defaults.min_level
            );
            self.tuning.min_level = defaults.min_level;
        }
        if !(3..=LEVEL_LIMIT).contains(&self.tuning.max_level) {
            log::warn!(
                "[config] tuning.max_level {} must be within 3..={}, using {}",
                self.tuning.max_level,
                LEVEL_LIMIT,
                defaults.max_level
            );
            self.tuning.max_level = defaults.max_level;
        }
        self.tuning.initial_oom_step = self.tuning.initial_oom_step.max(1);
        for tol in [
            &mut self.tuning.preferred_vram_tolerance,
            &mut self.tuning.history_vram_tolerance,
            &mut self.tuning.oom_avoid_tolerance,
        ] {
            if !tol.is_finite() || *tol < 0.0 {
                *tol = 0.0;
            }
        }
        self.monitor.poll_interval_ms = self.monitor.poll_interval_ms.max(10);
        self.monitor.tail_lines = self.monitor.tail_lines.max(1);
    }
}

/// Load settings from `path`.
///
/// Missing file → defaults (written back so the user has something to edit).
/// Unparseable file → defaults, file left untouched. Older version → migrated
/// and saved.
pub fn load_settings(path: &Path) -> Settings {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            log::info!("[config] no config at {}, using defaults", path.display());
            let settings = Settings::default();
            if let Err(e) = save_settings(path, &settings) {
                log::warn!("[config] failed to write default config: {}", e);
            }
            return settings;
        }
    };

    let raw: serde_json::Value = match serde_json::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            log::warn!(
                "[config] {} is not valid JSON ({}), falling back to defaults",
                path.display(),
                e
            );
            return Settings::default();
        }
    };

    let (mut settings, migrated) = match settings_from_value(raw) {
        Ok(v) => v,
        Err(e) => {
            log::warn!("[config] failed to read {}: {}, falling back to defaults", path.display(), e);
            return Settings::default();
        }
    };
    settings.sanitize();

    if migrated {
        log::info!("[config] migrated settings to version {}", SETTINGS_VERSION);
        if let Err(e) = save_settings(path, &settings) {
            log::warn!("[config] migrated config could not be saved: {}", e);
        }
    }
    settings
}

/// Deserialize a settings document, mapping pre-v2 flat keys. Returns whether
/// the document needed migration.
pub fn settings_from_value(raw: serde_json::Value) -> Result<(Settings, bool)> {
    let version = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
    let mut settings: Settings = serde_json::from_value(raw.clone())?;
    if version >= SETTINGS_VERSION {
        return Ok((settings, false));
    }

    apply_legacy_keys(&raw, &mut settings);
    settings.version = SETTINGS_VERSION;
    Ok((settings, true))
}

fn apply_legacy_keys(raw: &serde_json::Value, settings: &mut Settings) {
    let mb = |key: &str| raw.get(key).and_then(|v| v.as_f64()).map(|v| (v.max(0.0) as u64) * MIB);

    if let Some(exe) = raw.get("koboldcpp_executable").and_then(|v| v.as_str()) {
        settings.executable = exe.to_string();
    }
    if let Some(db) = raw.get("db_file").and_then(|v| v.as_str()) {
        settings.history_db = Some(PathBuf::from(db));
    }
    if raw.get("override_vram_budget").and_then(|v| v.as_bool()) == Some(true) {
        settings.vram.manual_budget_bytes = mb("manual_vram_total_mb");
    }
    if let Some(v) = mb("vram_safety_buffer_mb") {
        settings.vram.safety_buffer_bytes = v;
    }
    if let Some(v) = mb("min_vram_free_after_load_success_mb") {
        settings.vram.min_free_after_load_bytes = v;
    }
    if let Some(v) = raw.get("loading_timeout_seconds").and_then(|v| v.as_u64()) {
        settings.tuning.loading_timeout_secs = v;
    }
    if let Some(v) = raw.get("selected_gpu_index").and_then(|v| v.as_u64()) {
        settings.gpu.gpu_id = v as u32;
    }
    if let Some(mode) = raw.get("gpu_selection_mode").and_then(|v| v.as_str()) {
        let parsed: std::result::Result<GpuSelection, _> =
            serde_json::from_value(serde_json::Value::String(mode.to_ascii_lowercase()));
        if let Ok(sel) = parsed {
            settings.gpu.selection = sel;
        }
    }
    if let Some(keywords) = raw.get("oom_error_keywords").and_then(|v| v.as_array()) {
        let words: Vec<String> = keywords
            .iter()
            .filter_map(|k| k.as_str())
            .map(regex::escape)
            .collect();
        if !words.is_empty() {
            settings.monitor.oom_patterns = words;
        }
    }
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, content).map_err(|e| TuneError::Config(format!("{}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_keys_backfilled() {
        let (s, migrated) = settings_from_value(json!({
            "version": 2,
            "tuning": { "max_level": 12 }
        }))
        .unwrap();
        assert!(!migrated);
        assert_eq!(s.tuning.max_level, 12);
        assert_eq!(s.tuning.min_level, -6);
        assert_eq!(s.monitor.oom_exit_codes, vec![2]);
        assert!(!s.monitor.success_patterns.is_empty());
        assert_eq!(s.launch.port, 5000);
    }

    #[test]
    fn test_legacy_flat_keys_migrated() {
        let (s, migrated) = settings_from_value(json!({
            "koboldcpp_executable": "/opt/kcpp/koboldcpp",
            "override_vram_budget": true,
            "manual_vram_total_mb": 12288,
            "vram_safety_buffer_mb": 1024,
            "selected_gpu_index": 1,
            "gpu_selection_mode": "nvidia"
        }))
        .unwrap();
        assert!(migrated);
        assert_eq!(s.version, SETTINGS_VERSION);
        assert_eq!(s.executable, "/opt/kcpp/koboldcpp");
        assert_eq!(s.vram.manual_budget_bytes, Some(12288 * MIB));
        assert_eq!(s.vram.safety_buffer_bytes, 1024 * MIB);
        assert_eq!(s.gpu.gpu_id, 1);
        assert_eq!(s.gpu.selection, GpuSelection::Nvidia);
    }

    #[test]
    fn test_legacy_budget_ignored_when_override_off() {
        let (s, _) = settings_from_value(json!({
            "override_vram_budget": false,
            "manual_vram_total_mb": 8192
        }))
        .unwrap();
        assert_eq!(s.vram.manual_budget_bytes, None);
    }

    #[test]
    fn test_sanitize_rejects_unusable_bounds() {
        let mut s = Settings::default();
        s.tuning.min_level = 2;
        s.tuning.max_level = 1;
        s.tuning.initial_oom_step = 0;
        s.sanitize();
        assert_eq!(s.tuning.min_level, -6);
        assert_eq!(s.tuning.max_level, 10);
        assert_eq!(s.tuning.initial_oom_step, 1);

        s.tuning.min_level = i32::MIN;
        s.tuning.max_level = i32::MAX;
        s.sanitize();
        assert_eq!(s.tuning.min_level, -6);
        assert_eq!(s.tuning.max_level, 10);
    }

    #[test]
    fn test_load_writes_defaults_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let s = load_settings(&path);
        assert_eq!(s.version, SETTINGS_VERSION);
        assert!(path.exists());

        std::fs::write(&path, r#"{"manual_vram_total_mb": 4096, "override_vram_budget": true}"#).unwrap();
        let s = load_settings(&path);
        assert_eq!(s.vram.manual_budget_bytes, Some(4096 * MIB));
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["version"], json!(SETTINGS_VERSION));
    }

    #[test]
    fn test_corrupt_file_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let s = load_settings(&path);
        assert_eq!(s.tuning.max_level, 10);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }
}
