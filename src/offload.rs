//! Tuning level → concrete offload plan.
//!
//! Level 0 is the zero point. Negative levels offload whole layers only and
//! grow linearly from nothing at `min_level`. Non-negative levels first ramp
//! the GPU layer count up to the full model with the FFN group pinned to CPU,
//! then spend the last three levels releasing FFN tensors back to the GPU.
//! Every step up keeps or grows the GPU-resident volume.

use serde::Serialize;

use crate::config::{TuningSettings, LEVEL_LIMIT};
use crate::profiler::ModelProfile;

/// Levels at the top of the range that release pinned FFN tensors.
const RELEASE_LEVELS: i32 = 3;
/// Share of layers already on GPU at level 0.
const RAMP_START: f64 = 0.25;

const MOE_EXPERT_WEIGHT: f64 = 0.3;
const DENSE_FFN_WEIGHT: f64 = 2.0 / 9.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OffloadPlan {
    pub gpu_layers: u32,
    pub tensor_override_pattern: Option<String>,
    pub tuning_level: i32,
}

/// Which FFN tensors stay on CPU, and on which layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PinSet {
    tensors: &'static [&'static str],
    stride: u32,
}

const MOE_ALL: &[&str] = &["up", "gate", "down"];
const MOE_UP_DOWN: &[&str] = &["up", "down"];
const DENSE_UP: &[&str] = &["up"];

const MOE_RELEASE: [PinSet; 4] = [
    PinSet { tensors: MOE_ALL, stride: 1 },
    PinSet { tensors: MOE_UP_DOWN, stride: 1 },
    PinSet { tensors: MOE_ALL, stride: 2 },
    PinSet { tensors: MOE_UP_DOWN, stride: 2 },
];

const DENSE_RELEASE: [PinSet; 4] = [
    PinSet { tensors: DENSE_UP, stride: 1 },
    PinSet { tensors: DENSE_UP, stride: 2 },
    PinSet { tensors: DENSE_UP, stride: 3 },
    PinSet { tensors: DENSE_UP, stride: 4 },
];

#[derive(Debug, Clone, Copy)]
struct Shape {
    gpu_layers: u32,
    pin: Option<PinSet>,
}

#[derive(Debug, Clone, Copy)]
pub struct OffloadLevelMapper {
    min_level: i32,
    max_level: i32,
}

impl OffloadLevelMapper {
    pub fn new(min_level: i32, max_level: i32) -> Self {
        Self {
            min_level: min_level.clamp(-LEVEL_LIMIT, -1),
            max_level: max_level.clamp(RELEASE_LEVELS, LEVEL_LIMIT),
        }
    }

    pub fn from_settings(tuning: &TuningSettings) -> Self {
        Self::new(tuning.min_level, tuning.max_level)
    }

    pub fn min_level(&self) -> i32 {
        self.min_level
    }

    pub fn max_level(&self) -> i32 {
        self.max_level
    }

    pub fn clamp(&self, level: i32) -> i32 {
        level.clamp(self.min_level, self.max_level)
    }

    pub fn resolve(&self, profile: &ModelProfile, level: i32) -> OffloadPlan {
        let level = self.clamp(level);
        let layers = profile.layer_count.max(1);
        let shape = self.shape(profile, level);
        OffloadPlan {
            gpu_layers: shape.gpu_layers,
            tensor_override_pattern: shape.pin.map(|pin| render_pattern(pin, profile.is_moe, layers)),
            tuning_level: level,
        }
    }

    /// GPU-resident share of the model, in whole-layer units.
    pub fn gpu_resident_volume(&self, profile: &ModelProfile, level: i32) -> f64 {
        let shape = self.shape(profile, self.clamp(level));
        volume(shape, profile.is_moe, profile.layer_count.max(1))
    }

    pub fn describe(&self, profile: &ModelProfile, level: i32) -> String {
        let level = self.clamp(level);
        let layers = profile.layer_count.max(1);
        let shape = self.shape(profile, level);
        let kind = if profile.is_moe { "MoE" } else { "dense" };
        let head = format!(
            "level {} ({}..={}, {}): {}/{} layers on GPU",
            level, self.min_level, self.max_level, kind, shape.gpu_layers, layers
        );
        match shape.pin {
            None if shape.gpu_layers == 0 => format!("{}, everything on CPU", head),
            None => format!("{}, remaining layers on CPU", head),
            Some(pin) => {
                let which = if pin.stride == 1 {
                    "every layer".to_string()
                } else {
                    format!("every {} layer", ordinal(pin.stride))
                };
                let tensors = if profile.is_moe { "expert" } else { "FFN" };
                format!("{}, {} {} tensors of {} kept on CPU", head, pin.tensors.join("/"), tensors, which)
            }
        }
    }

    /// Level whose plan produced the given launch values. An exact match wins,
    /// otherwise the closest layer count, preferring the lower level on ties.
    pub fn infer_level(&self, profile: &ModelProfile, gpu_layers: u32, pattern: Option<&str>) -> i32 {
        let mut best = (u32::MAX, self.min_level);
        for level in (self.min_level..=self.max_level).rev() {
            let plan = self.resolve(profile, level);
            if plan.gpu_layers == gpu_layers && plan.tensor_override_pattern.as_deref() == pattern {
                return level;
            }
            let distance = plan.gpu_layers.abs_diff(gpu_layers);
            if distance <= best.0 {
                best = (distance, level);
            }
        }
        best.1
    }

    fn ramp_top(&self) -> i32 {
        self.max_level - RELEASE_LEVELS
    }

    fn shape(&self, profile: &ModelProfile, level: i32) -> Shape {
        let layers = profile.layer_count.max(1);
        let release = if profile.is_moe { &MOE_RELEASE } else { &DENSE_RELEASE };

        if level < 0 {
            let zero = volume(self.gpu_shape(profile, 0, release), profile.is_moe, layers);
            let cap = zero.floor().max(0.0);
            let span = f64::from(-self.min_level);
            let pos = f64::from(level - self.min_level);
            return Shape {
                gpu_layers: (cap * pos / span).ceil() as u32,
                pin: None,
            };
        }
        self.gpu_shape(profile, level, release)
    }

    fn gpu_shape(&self, profile: &ModelProfile, level: i32, release: &[PinSet; 4]) -> Shape {
        let layers = profile.layer_count.max(1);
        let top = self.ramp_top();
        if level <= top {
            let t = if top == 0 { 1.0 } else { f64::from(level) / f64::from(top) };
            let p = if profile.is_moe { 0.5 } else { 1.5 };
            let share = RAMP_START + (1.0 - RAMP_START) * t.powf(p);
            let gpu_layers = ((f64::from(layers) * share).ceil() as u32).clamp(1, layers);
            return Shape {
                gpu_layers,
                pin: Some(release[0]),
            };
        }

        // Small models can pin more with a coarser stride; never step backwards.
        let step = (level - top).min(RELEASE_LEVELS) as usize;
        let mut chosen = release[0];
        for &candidate in &release[1..=step] {
            if pinned_volume(candidate, profile.is_moe, layers) <= pinned_volume(chosen, profile.is_moe, layers) {
                chosen = candidate;
            }
        }
        Shape {
            gpu_layers: layers,
            pin: Some(chosen),
        }
    }
}

fn tensor_weight(is_moe: bool) -> f64 {
    if is_moe {
        MOE_EXPERT_WEIGHT
    } else {
        DENSE_FFN_WEIGHT
    }
}

fn pinned_fraction(pin: PinSet, is_moe: bool, layer: u32) -> f64 {
    if layer % pin.stride == 0 {
        pin.tensors.len() as f64 * tensor_weight(is_moe)
    } else {
        0.0
    }
}

fn pinned_volume(pin: PinSet, is_moe: bool, layers: u32) -> f64 {
    (0..layers).map(|i| pinned_fraction(pin, is_moe, i)).sum()
}

/// GPU layers are the last `gpu_layers` blocks of the model.
fn volume(shape: Shape, is_moe: bool, layers: u32) -> f64 {
    let first = layers.saturating_sub(shape.gpu_layers);
    (first..layers)
        .map(|i| 1.0 - shape.pin.map_or(0.0, |pin| pinned_fraction(pin, is_moe, i)))
        .sum()
}

fn render_pattern(pin: PinSet, is_moe: bool, layers: u32) -> String {
    let blocks = if pin.stride == 1 {
        r"\d+".to_string()
    } else {
        let idx: Vec<String> = (0..layers).step_by(pin.stride as usize).map(|i| i.to_string()).collect();
        format!("({})", idx.join("|"))
    };
    let tensors = if pin.tensors.len() == 1 {
        pin.tensors[0].to_string()
    } else {
        format!("({})", pin.tensors.join("|"))
    };
    if is_moe {
        format!(r"blk\.{}\.ffn_{}_exps\.weight=CPU", blocks, tensors)
    } else {
        format!(r"blk\.{}\.ffn_{}\.weight=CPU", blocks, tensors)
    }
}

fn ordinal(n: u32) -> String {
    match n {
        2 => "2nd".to_string(),
        3 => "3rd".to_string(),
        n => format!("{}th", n),
    }
}
