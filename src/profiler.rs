use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::MoeLayerRule;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const FALLBACK_LAYERS: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerConfidence {
    Declared,
    Inferred,
    Fallback,
}

/// Fields a caller may already know from the model header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub block_count: Option<u32>,
    pub expert_count: Option<u32>,
    pub architecture: Option<String>,
    pub parameter_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelProfile {
    pub identity: String,
    pub file_name: String,
    pub family: Option<String>,
    pub is_moe: bool,
    pub quant: Option<String>,
    pub param_count_estimate: Option<u64>,
    pub active_param_estimate: Option<u64>,
    pub layer_count: u32,
    pub layer_count_confidence: LayerConfidence,
    pub file_size_bytes: Option<u64>,
}

impl ModelProfile {
    pub fn params_b(&self) -> Option<f64> {
        self.param_count_estimate.map(|p| p as f64 / 1e9)
    }

    /// Rough VRAM needed to hold the whole model on GPU, without context.
    pub fn estimated_full_gpu_bytes(&self) -> Option<u64> {
        let params_b = self.params_b().filter(|p| *p > 0.0)?;
        let quant = self.quant.as_deref().unwrap_or("");
        let mut gb = params_b * vram_gb_per_b_param(quant);
        if self.is_moe {
            gb *= 1.2;
        }
        Some((gb * GIB) as u64)
    }
}

// ── Filename rules ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Draft {
    family: Option<String>,
    quant: Option<String>,
    params_b: Option<f64>,
    active_b: Option<f64>,
    is_moe: bool,
    layers: Option<u32>,
}

struct MatchRule {
    name: &'static str,
    apply: fn(&str, &mut Draft) -> bool,
}

static RULES: &[MatchRule] = &[
    MatchRule { name: "family", apply: rule_family },
    MatchRule { name: "quant", apply: rule_quant },
    MatchRule { name: "mixture", apply: rule_mixture },
    MatchRule { name: "active_params", apply: rule_active_params },
    MatchRule { name: "size", apply: rule_size },
    MatchRule { name: "moe_keyword", apply: rule_moe_keyword },
    MatchRule { name: "layers", apply: rule_layers },
];

static FAMILIES: &[(&str, &str)] = &[
    ("deepseek", "deepseek"),
    ("mixtral", "mixtral"),
    ("mistral", "mistral"),
    ("qwen", "qwen"),
    ("qwq", "qwen"),
    ("codellama", "llama"),
    ("llama", "llama"),
    ("gemma", "gemma"),
    ("phi", "phi"),
    ("falcon", "falcon"),
    ("gpt-neox", "gpt-neox"),
    ("gpt-j", "gpt-j"),
    ("pythia", "pythia"),
    ("mamba", "mamba"),
    ("grok", "grok"),
    ("command-r", "command-r"),
    ("glm", "glm"),
];

static SHARD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-\d{5}-of-\d{5}$").unwrap());
static QUANT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:^|[-_. ])(iq[1-4]_(?:xxs|xs|s|m|nl)|iq[1-4]|q[2-8]_k_(?:xl|s|m|l)|q[2-8]_k|q[2-8]_[01]|q[2-8]|bf16|fp16|f16|f32)(?:$|[-_. ])",
    )
    .unwrap()
});
static MIXTURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[-_. ])(\d{1,2})x(\d{1,3}(?:\.\d{1,2})?)b(?:$|[-_. ])").unwrap());
static ACTIVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[-_. ])a(\d{1,3}(?:\.\d{1,2})?)b(?:$|[-_. ])").unwrap());
static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[-_. ])(\d{1,4}(?:\.\d{1,2})?)b(?:$|[-_. ])").unwrap());
static MOE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"moe|mixtral|grok|deepseek-(?:v2|v3|r1)").unwrap());
static LAYERS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[-_. ])(\d{1,3})(?:l|layers)(?:$|[-_. ])").unwrap());

fn at_boundary(name: &str, fragment: &str) -> bool {
    name.match_indices(fragment).any(|(i, _)| {
        i == 0 || matches!(name.as_bytes()[i - 1], b'-' | b'_' | b'.' | b' ')
    })
}

fn rule_family(name: &str, d: &mut Draft) -> bool {
    match FAMILIES.iter().find(|(frag, _)| at_boundary(name, frag)) {
        Some((_, family)) => {
            d.family = Some(family.to_string());
            true
        }
        None => false,
    }
}

fn rule_quant(name: &str, d: &mut Draft) -> bool {
    match QUANT_RE.captures(name) {
        Some(c) => {
            d.quant = Some(c[1].to_ascii_uppercase().replace("FP16", "F16"));
            true
        }
        None => false,
    }
}

fn rule_mixture(name: &str, d: &mut Draft) -> bool {
    let Some(c) = MIXTURE_RE.captures(name) else {
        return false;
    };
    let (Ok(n), Ok(m)) = (c[1].parse::<f64>(), c[2].parse::<f64>()) else {
        return false;
    };
    d.params_b = Some(n * m);
    d.is_moe = true;
    true
}

fn rule_active_params(name: &str, d: &mut Draft) -> bool {
    match ACTIVE_RE.captures(name).and_then(|c| c[1].parse::<f64>().ok()) {
        Some(active) => {
            d.active_b = Some(active);
            d.is_moe = true;
            true
        }
        None => false,
    }
}

fn rule_size(name: &str, d: &mut Draft) -> bool {
    if d.params_b.is_some() {
        return false;
    }
    match SIZE_RE.captures(name).and_then(|c| c[1].parse::<f64>().ok()) {
        Some(size) if size > 0.0 => {
            d.params_b = Some(size);
            true
        }
        _ => false,
    }
}

fn rule_moe_keyword(name: &str, d: &mut Draft) -> bool {
    if MOE_RE.is_match(name) {
        d.is_moe = true;
        return true;
    }
    false
}

fn rule_layers(name: &str, d: &mut Draft) -> bool {
    match LAYERS_RE.captures(name).and_then(|c| c[1].parse::<u32>().ok()) {
        Some(n) if n > 0 => {
            d.layers = Some(n);
            true
        }
        _ => false,
    }
}

// ── Lookup tables ──────────────────────────────────────────────────────────

/// (family, params in billions, layer count)
static LAYER_TABLE: &[(&str, f64, u32)] = &[
    ("llama", 1.0, 16),
    ("llama", 3.0, 28),
    ("llama", 7.0, 32),
    ("llama", 8.0, 32),
    ("llama", 13.0, 40),
    ("llama", 30.0, 60),
    ("llama", 33.0, 60),
    ("llama", 34.0, 48),
    ("llama", 65.0, 80),
    ("llama", 70.0, 80),
    ("llama", 405.0, 126),
    ("qwen", 0.5, 24),
    ("qwen", 1.5, 28),
    ("qwen", 4.0, 36),
    ("qwen", 7.0, 28),
    ("qwen", 8.0, 36),
    ("qwen", 14.0, 48),
    ("qwen", 30.0, 48),
    ("qwen", 32.0, 64),
    ("qwen", 72.0, 80),
    ("qwen", 235.0, 94),
    ("gemma", 2.0, 18),
    ("gemma", 7.0, 28),
    ("gemma", 9.0, 42),
    ("gemma", 27.0, 46),
    ("mistral", 7.0, 32),
    ("mistral", 12.0, 40),
    ("mistral", 22.0, 56),
    ("mistral", 24.0, 40),
    ("mixtral", 56.0, 32),
    ("mixtral", 176.0, 56),
    ("phi", 3.8, 32),
    ("phi", 14.0, 40),
    ("falcon", 7.0, 32),
    ("falcon", 40.0, 60),
    ("gpt-j", 6.0, 28),
    ("gpt-neox", 20.0, 44),
    ("deepseek", 671.0, 61),
];

fn layers_by_size_curve(params_b: f64) -> u32 {
    match params_b {
        s if s <= 1.5 => 22,
        s if s <= 3.0 => 26,
        s if s <= 7.0 => 32,
        s if s <= 13.0 => 40,
        s if s <= 20.0 => 48,
        s if s <= 35.0 => 60,
        s if s <= 70.0 => 80,
        _ => 96,
    }
}

/// File bytes per parameter, as GB per billion parameters.
fn file_gb_per_b_param(quant: &str) -> f64 {
    const TABLE: &[(&str, f64)] = &[
        ("IQ1", 0.28),
        ("Q2_K_S", 0.28),
        ("IQ2", 0.32),
        ("Q2", 0.30),
        ("Q3_K_L", 0.42),
        ("IQ3", 0.42),
        ("Q3", 0.40),
        ("Q4_K_S", 0.53),
        ("Q4_K_M", 0.56),
        ("IQ4", 0.55),
        ("Q4", 0.50),
        ("Q5_K_M", 0.66),
        ("Q5", 0.62),
        ("Q6", 0.75),
        ("Q8", 1.05),
        ("BF16", 2.05),
        ("F16", 2.05),
        ("F32", 4.05),
    ];
    TABLE
        .iter()
        .find(|(k, _)| quant.starts_with(k))
        .map(|(_, v)| *v)
        .unwrap_or(0.6)
}

/// Full-offload VRAM per parameter, as GB per billion parameters.
fn vram_gb_per_b_param(quant: &str) -> f64 {
    const TABLE: &[(&str, f64)] = &[
        ("F32", 4.5),
        ("BF16", 2.5),
        ("F16", 2.5),
        ("Q8", 1.5),
        ("Q6", 1.1),
        ("Q5_K_M", 0.95),
        ("Q5_1", 0.95),
        ("Q5", 0.90),
        ("Q4_K_M", 0.8),
        ("Q4_K_S", 0.75),
        ("IQ4", 0.75),
        ("Q4", 0.70),
        ("Q3_K_L", 0.65),
        ("Q3_K_M", 0.60),
        ("IQ3", 0.60),
        ("Q3", 0.55),
        ("IQ2", 0.50),
        ("Q2", 0.50),
        ("IQ1", 0.40),
    ];
    TABLE
        .iter()
        .find(|(k, _)| quant.starts_with(k))
        .map(|(_, v)| *v)
        .unwrap_or(0.9)
}

const COMMON_SIZES_B: &[f64] = &[
    1.0, 1.5, 3.0, 7.0, 8.0, 13.0, 14.0, 22.0, 27.0, 30.0, 32.0, 34.0, 47.0, 70.0, 72.0, 120.0, 235.0,
];

fn params_from_file_size(bytes: u64, quant: &str) -> Option<f64> {
    let est = bytes as f64 / GIB / file_gb_per_b_param(quant);
    if est <= 0.5 {
        return None;
    }
    let closest = COMMON_SIZES_B
        .iter()
        .copied()
        .min_by(|a, b| (a - est).abs().total_cmp(&(b - est).abs()))?;
    if (closest - est).abs() < closest * 0.25 {
        Some(closest)
    } else {
        Some((est * 10.0).round() / 10.0)
    }
}

// ── Profiler ───────────────────────────────────────────────────────────────

/// Lower-cased file name without directory, `.gguf` extension or shard suffix.
pub fn model_identity(path: &str) -> String {
    let file = Path::new(path)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string());
    let lower = file.to_lowercase();
    let stem = lower.strip_suffix(".gguf").unwrap_or(&lower);
    SHARD_RE.replace(stem, "").to_string()
}

pub struct ModelProfiler {
    moe_rules: Vec<MoeLayerRule>,
    cache: Mutex<HashMap<String, Arc<ModelProfile>>>,
}

impl ModelProfiler {
    pub fn new(moe_rules: Vec<MoeLayerRule>) -> Self {
        Self {
            moe_rules,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Best-effort profile of a model file. Never fails; weak evidence shows up
    /// in `layer_count_confidence` instead.
    pub fn profile(&self, path: &str, metadata: Option<&ModelMetadata>) -> Arc<ModelProfile> {
        let identity = model_identity(path);
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&identity) {
                let has_declared = metadata.and_then(|m| m.block_count).is_some();
                if !has_declared || hit.layer_count_confidence == LayerConfidence::Declared {
                    return hit.clone();
                }
            }
        }

        let profile = Arc::new(self.build(path, identity.clone(), metadata));
        log::info!(
            "[profiler] {}: family={} moe={} params={:?}B layers={} ({:?})",
            profile.identity,
            profile.family.as_deref().unwrap_or("unknown"),
            profile.is_moe,
            profile.params_b(),
            profile.layer_count,
            profile.layer_count_confidence
        );
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(identity, profile.clone());
        }
        profile
    }

    fn build(&self, path: &str, identity: String, metadata: Option<&ModelMetadata>) -> ModelProfile {
        let mut draft = Draft::default();
        for rule in RULES {
            if (rule.apply)(&identity, &mut draft) {
                log::debug!("[profiler] rule '{}' matched {}", rule.name, identity);
            }
        }

        let file_size_bytes = std::fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len());
        let had_size_token = draft.params_b.is_some();

        if let Some(meta) = metadata {
            if draft.family.is_none() {
                if let Some(arch) = meta.architecture.as_deref() {
                    let mut from_arch = Draft::default();
                    rule_family(&arch.to_lowercase(), &mut from_arch);
                    draft.family = from_arch.family;
                }
            }
            if meta.expert_count.unwrap_or(0) > 1
                || meta.architecture.as_deref().is_some_and(|a| a.to_lowercase().contains("moe"))
            {
                draft.is_moe = true;
            }
            if let Some(p) = meta.parameter_count.filter(|p| *p > 0) {
                draft.params_b = Some(p as f64 / 1e9);
            }
        }
        let params_declared = metadata.and_then(|m| m.parameter_count).is_some();

        if draft.params_b.is_none() {
            if let (Some(bytes), Some(quant)) = (file_size_bytes, draft.quant.as_deref()) {
                draft.params_b = params_from_file_size(bytes, quant);
            }
        }

        let declared = metadata.and_then(|m| m.block_count).filter(|n| *n > 0);
        let table_hit = match (&draft.family, draft.params_b) {
            (Some(family), Some(size)) => LAYER_TABLE
                .iter()
                .find(|(f, s, _)| f == family && (s - size).abs() < 0.1)
                .map(|(_, _, n)| *n),
            _ => None,
        };

        let (mut layer_count, mut confidence) = if let Some(n) = declared {
            (n, LayerConfidence::Declared)
        } else if let Some(n) = draft.layers {
            (n, LayerConfidence::Inferred)
        } else if let Some(n) = table_hit {
            (n, LayerConfidence::Inferred)
        } else if let Some(size) = draft.params_b {
            (layers_by_size_curve(size), LayerConfidence::Inferred)
        } else {
            (FALLBACK_LAYERS, LayerConfidence::Fallback)
        };
        if !had_size_token && !params_declared && confidence == LayerConfidence::Inferred && draft.layers.is_none() {
            confidence = LayerConfidence::Fallback;
        }

        if draft.is_moe && confidence != LayerConfidence::Declared {
            if let Some(rule) = self.matching_moe_rule(draft.family.as_deref(), draft.params_b) {
                if layer_count < rule.min_layers {
                    log::info!(
                        "[profiler] MoE layer floor for {}: {} -> {}",
                        identity,
                        layer_count,
                        rule.min_layers
                    );
                    layer_count = rule.min_layers;
                }
            }
        }

        ModelProfile {
            file_name: Path::new(path)
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string()),
            identity,
            family: draft.family,
            is_moe: draft.is_moe,
            quant: draft.quant,
            param_count_estimate: draft.params_b.map(|b| (b * 1e9).round() as u64),
            active_param_estimate: draft.active_b.map(|b| (b * 1e9).round() as u64),
            layer_count,
            layer_count_confidence: confidence,
            file_size_bytes,
        }
    }

    fn matching_moe_rule(&self, family: Option<&str>, params_b: Option<f64>) -> Option<&MoeLayerRule> {
        let size = params_b?;
        self.moe_rules.iter().find(|r| {
            (r.family == "*" || Some(r.family.as_str()) == family)
                && size >= r.min_params_b
                && size < r.max_params_b
        })
    }
}
