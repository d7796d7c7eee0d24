use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use sysinfo::System;

use crate::config::Settings;
use crate::error::{Result, TuneError};
use crate::offload::OffloadPlan;
use crate::vram::Backends;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuLayers {
    Auto,
    Off,
    Count(u32),
}

impl FromStr for GpuLayers {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(GpuLayers::Auto),
            "off" | "none" => Ok(GpuLayers::Off),
            n => n
                .parse::<u32>()
                .map(GpuLayers::Count)
                .map_err(|_| format!("expected 'auto', 'off' or a layer count, got '{}'", s)),
        }
    }
}

impl fmt::Display for GpuLayers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuLayers::Auto => write!(f, "auto"),
            GpuLayers::Off => write!(f, "off"),
            GpuLayers::Count(n) => write!(f, "{}", n),
        }
    }
}

/// Values the user pinned for this session; they beat whatever a level implies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualOverrides {
    pub gpu_layers: Option<GpuLayers>,
    pub context_size: Option<u32>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Launch values recovered from an argument list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub model_path: Option<String>,
    pub gpu_layers: Option<GpuLayers>,
    pub override_pattern: Option<String>,
    pub context_size: Option<u32>,
    pub port: Option<u16>,
    pub threads: Option<String>,
    pub passthrough: Vec<String>,
}

fn is_python_script(path: &str) -> bool {
    path.to_ascii_lowercase().ends_with(".py")
}

/// Physical cores minus one, at least one.
pub fn default_threads() -> u32 {
    let sys = System::new();
    let cores = sys.physical_core_count().unwrap_or(2);
    cores.saturating_sub(1).max(1) as u32
}

fn backend_flag(backend: &str, detected: Backends) -> Option<&'static str> {
    match backend.to_ascii_lowercase().as_str() {
        "cuda" | "cublas" => Some("--usecublas"),
        "vulkan" => Some("--usevulkan"),
        "hip" | "rocm" | "hipblas" => Some("--usehipblas"),
        "cpu" => Some("--usecpu"),
        "none" => None,
        _ if detected.cuda => Some("--usecublas"),
        _ if detected.hip => Some("--usehipblas"),
        _ if detected.vulkan => Some("--usevulkan"),
        _ => None,
    }
}

impl LaunchCommand {
    /// Full command for `model_path`. Manual overrides win over the plan, the
    /// plan wins over configured defaults.
    pub fn build(
        settings: &Settings,
        model_path: &str,
        plan: Option<&OffloadPlan>,
        overrides: &ManualOverrides,
        backends: Backends,
    ) -> Self {
        let launch = &settings.launch;
        let (program, mut args) = if is_python_script(&settings.executable) {
            (settings.python.clone(), vec![settings.executable.clone()])
        } else {
            (settings.executable.clone(), Vec::new())
        };

        args.push("--model".to_string());
        args.push(model_path.to_string());

        let gpu_layers = overrides
            .gpu_layers
            .or_else(|| plan.map(|p| GpuLayers::Count(p.gpu_layers)))
            .unwrap_or_else(|| launch.gpu_layers.parse().unwrap_or(GpuLayers::Auto));
        match gpu_layers {
            GpuLayers::Off => args.push("--nogpulayers".to_string()),
            other => {
                args.push("--gpulayers".to_string());
                args.push(other.to_string());
            }
        }
        if gpu_layers != GpuLayers::Off {
            if let Some(pattern) = plan.and_then(|p| p.tensor_override_pattern.as_ref()) {
                args.push("--overridetensors".to_string());
                args.push(pattern.clone());
            }
        }

        if let Some(ctx) = overrides.context_size.or(launch.context_size) {
            args.push("--contextsize".to_string());
            args.push(ctx.to_string());
        }
        args.push("--port".to_string());
        args.push(launch.port.to_string());

        let threads = if launch.threads.eq_ignore_ascii_case("auto") {
            default_threads().to_string()
        } else {
            launch.threads.clone()
        };
        args.push("--threads".to_string());
        args.push(threads);

        if gpu_layers != GpuLayers::Off {
            if let Some(flag) = backend_flag(&launch.backend, backends) {
                args.push(flag.to_string());
            }
        }

        args.extend(launch.extra_args.iter().cloned());
        args.extend(overrides.extra_args.iter().cloned());
        Self { program, args }
    }

    pub fn parsed(&self) -> Result<ParsedArgs> {
        parse_args(&self.args)
    }

    /// Copy-pasteable shell rendering.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> Cow<'_, str> {
    let plain = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | ','));
    if plain {
        Cow::Borrowed(s)
    } else {
        Cow::Owned(format!("'{}'", s.replace('\'', r"'\''")))
    }
}

/// Recover the launch values from a flat argument list. Accepts both
/// `--flag value` and `--flag=value`; anything unrecognised is passed through.
pub fn parse_args(args: &[String]) -> Result<ParsedArgs> {
    let mut parsed = ParsedArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((f, v)) if f.starts_with("--") => (f, Some(v.to_string())),
            _ => (arg.as_str(), None),
        };
        let mut value = |name: &str| -> Result<String> {
            match inline.clone() {
                Some(v) => Ok(v),
                None => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| TuneError::InvalidCommand(format!("{} expects a value", name))),
            }
        };
        match flag {
            "--model" => parsed.model_path = Some(value(flag)?),
            "--gpulayers" => {
                let raw = value(flag)?;
                let layers = raw.parse::<GpuLayers>().map_err(TuneError::InvalidCommand)?;
                parsed.gpu_layers = Some(layers);
            }
            "--nogpulayers" => parsed.gpu_layers = Some(GpuLayers::Off),
            "--overridetensors" => parsed.override_pattern = Some(value(flag)?),
            "--contextsize" => {
                let raw = value(flag)?;
                let ctx = raw
                    .parse::<u32>()
                    .map_err(|_| TuneError::InvalidCommand(format!("bad --contextsize '{}'", raw)))?;
                parsed.context_size = Some(ctx);
            }
            "--port" => {
                let raw = value(flag)?;
                let port = raw
                    .parse::<u16>()
                    .map_err(|_| TuneError::InvalidCommand(format!("bad --port '{}'", raw)))?;
                parsed.port = Some(port);
            }
            "--threads" => parsed.threads = Some(value(flag)?),
            _ => parsed.passthrough.push(arg.clone()),
        }
    }
    Ok(parsed)
}

/// Locate a koboldcpp executable under `dir`.
pub fn find_executable(dir: &Path) -> Option<PathBuf> {
    let candidates = [
        dir.join("koboldcpp.exe"),
        dir.join("koboldcpp"),
        dir.join("koboldcpp.py"),
    ];
    for c in candidates {
        if c.is_file() {
            return Some(c);
        }
    }

    for entry in walkdir::WalkDir::new(dir).max_depth(3).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if !name.starts_with("koboldcpp") {
            continue;
        }
        let runnable = match Path::new(&name).extension().and_then(|e| e.to_str()) {
            None => true,
            Some(ext) => matches!(ext, "exe" | "py"),
        };
        if runnable {
            return Some(entry.path().to_path_buf());
        }
    }
    None
}

/// Configured executable, searching inside it when it names a directory.
pub fn resolve_executable(configured: &str) -> Result<String> {
    let path = Path::new(configured);
    if !path.is_dir() {
        return Ok(configured.to_string());
    }
    find_executable(path)
        .map(|p| p.to_string_lossy().to_string())
        .ok_or_else(|| TuneError::InvalidCommand(format!("no koboldcpp executable under {}", path.display())))
}
