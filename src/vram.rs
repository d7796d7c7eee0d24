use libloading::Library;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use sysinfo::System;

use crate::config::{GpuSelection, Settings};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetSource {
    Hardware,
    ManualOverride,
    ConservativeDefault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuReading {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub gpu_name: String,
    pub vendor: GpuVendor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VramBudget {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub source: BudgetSource,
    pub gpu_id: u32,
    pub vendor: Option<GpuVendor>,
    pub gpu_name: Option<String>,
}

impl VramBudget {
    pub fn free_mb(&self) -> u64 {
        self.free_bytes / MIB
    }
}

/// One way of asking the system how much GPU memory there is.
pub trait VramProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn vendor(&self) -> GpuVendor;
    fn query(&self, gpu_id: u32) -> Option<GpuReading>;
}

fn quiet_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
    }
    cmd
}

fn command_stdout(cmd: &mut Command) -> Option<String> {
    let out = cmd.output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).to_string())
}

// ── NVIDIA ─────────────────────────────────────────────────────────────────

pub struct NvidiaSmi;

/// `memory.total, memory.free, name` in MiB, one GPU per line.
pub fn parse_nvidia_smi(output: &str) -> Option<GpuReading> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.splitn(3, ',').map(str::trim);
    let total = parts.next()?.parse::<u64>().ok()?;
    let free = parts.next()?.parse::<u64>().ok()?;
    let name = parts.next().unwrap_or("NVIDIA GPU").to_string();
    if total == 0 {
        return None;
    }
    Some(GpuReading {
        total_bytes: total.saturating_mul(MIB),
        free_bytes: free.min(total).saturating_mul(MIB),
        gpu_name: name,
        vendor: GpuVendor::Nvidia,
    })
}

impl VramProvider for NvidiaSmi {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Nvidia
    }

    fn query(&self, gpu_id: u32) -> Option<GpuReading> {
        let mut cmd = quiet_command("nvidia-smi");
        cmd.args([
            &format!("--id={}", gpu_id),
            "--query-gpu=memory.total,memory.free,name",
            "--format=csv,noheader,nounits",
        ]);
        parse_nvidia_smi(&command_stdout(&mut cmd)?)
    }
}

// ── Linux sysfs (amdgpu, xe) ───────────────────────────────────────────────

pub struct SysfsDrm {
    root: PathBuf,
    vendor_id: &'static str,
    vendor: GpuVendor,
}

impl SysfsDrm {
    pub fn amd() -> Self {
        Self::with_root("/sys/class/drm", "0x1002", GpuVendor::Amd)
    }

    pub fn intel() -> Self {
        Self::with_root("/sys/class/drm", "0x8086", GpuVendor::Intel)
    }

    pub fn with_root(root: impl Into<PathBuf>, vendor_id: &'static str, vendor: GpuVendor) -> Self {
        Self {
            root: root.into(),
            vendor_id,
            vendor,
        }
    }

    /// `cardN/device` directories of this vendor that expose VRAM counters.
    fn devices(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut cards: Vec<PathBuf> = entries
            .flatten()
            .filter(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.starts_with("card") && !name.contains('-')
            })
            .map(|e| e.path().join("device"))
            .filter(|dev| {
                read_trimmed(&dev.join("vendor")).as_deref() == Some(self.vendor_id)
                    && dev.join("mem_info_vram_total").exists()
            })
            .collect();
        cards.sort();
        cards
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}

impl VramProvider for SysfsDrm {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    fn query(&self, gpu_id: u32) -> Option<GpuReading> {
        let dev = self.devices().into_iter().nth(gpu_id as usize)?;
        let total = read_u64(&dev.join("mem_info_vram_total")).filter(|t| *t > 0)?;
        let used = read_u64(&dev.join("mem_info_vram_used")).unwrap_or(0);
        let name = read_trimmed(&dev.join("product_name"))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{:?} GPU {}", self.vendor, gpu_id));
        Some(GpuReading {
            total_bytes: total,
            free_bytes: total.saturating_sub(used),
            gpu_name: name,
            vendor: self.vendor,
        })
    }
}

// ── Windows ────────────────────────────────────────────────────────────────

/// Win32_VideoController via PowerShell. Reports adapter RAM only, so free is
/// assumed equal to total.
pub struct WindowsCim {
    vendor: GpuVendor,
}

impl WindowsCim {
    pub fn new(vendor: GpuVendor) -> Self {
        Self { vendor }
    }
}

fn vendor_matches(name: &str, vendor: GpuVendor) -> bool {
    let lower = name.to_ascii_lowercase();
    match vendor {
        GpuVendor::Nvidia => lower.contains("nvidia") || lower.contains("geforce") || lower.contains("quadro"),
        GpuVendor::Amd => lower.contains("amd") || lower.contains("radeon"),
        GpuVendor::Intel => lower.contains("intel") || lower.contains("arc"),
        GpuVendor::Apple => lower.contains("apple"),
    }
}

impl VramProvider for WindowsCim {
    fn name(&self) -> &'static str {
        "powershell"
    }

    fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    fn query(&self, gpu_id: u32) -> Option<GpuReading> {
        if !cfg!(target_os = "windows") {
            return None;
        }
        let mut cmd = quiet_command("powershell");
        cmd.args([
            "-NoProfile",
            "-Command",
            "Get-CimInstance Win32_VideoController | ForEach-Object { \"$($_.AdapterRAM)|$($_.Name)\" }",
        ]);
        let text = command_stdout(&mut cmd)?;
        let (total, name) = text
            .lines()
            .filter_map(|line| {
                let (ram, name) = line.trim().split_once('|')?;
                let ram = ram.trim().parse::<u64>().ok()?;
                Some((ram, name.trim().to_string()))
            })
            .filter(|(ram, name)| *ram > 0 && vendor_matches(name, self.vendor))
            .nth(gpu_id as usize)?;
        Some(GpuReading {
            total_bytes: total,
            free_bytes: total,
            gpu_name: name,
            vendor: self.vendor,
        })
    }
}

// ── macOS ──────────────────────────────────────────────────────────────────

/// Discrete VRAM from `system_profiler`, or three quarters of unified memory
/// on Apple Silicon.
pub struct MacDisplays;

fn parse_system_profiler_vram(text: &str) -> Option<u64> {
    for line in text.lines() {
        let trimmed = line.trim();
        if !(trimmed.contains("VRAM") && trimmed.contains(':')) {
            continue;
        }
        let after = trimmed.split(':').nth(1)?.trim().to_ascii_lowercase();
        let num: String = after.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
        let Ok(val) = num.parse::<f64>() else { continue };
        let bytes = if after.contains("gb") {
            (val * 1024.0 * 1024.0 * 1024.0) as u64
        } else if after.contains("mb") {
            (val * MIB as f64) as u64
        } else {
            val as u64
        };
        if bytes > 0 {
            return Some(bytes);
        }
    }
    None
}

impl VramProvider for MacDisplays {
    fn name(&self) -> &'static str {
        "system_profiler"
    }

    fn vendor(&self) -> GpuVendor {
        GpuVendor::Apple
    }

    fn query(&self, _gpu_id: u32) -> Option<GpuReading> {
        if !cfg!(target_os = "macos") {
            return None;
        }
        let text = command_stdout(quiet_command("system_profiler").arg("SPDisplaysDataType")).unwrap_or_default();
        let name = text
            .lines()
            .map(str::trim)
            .find_map(|l| l.strip_prefix("Chipset Model:"))
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|| "Apple GPU".to_string());

        if let Some(total) = parse_system_profiler_vram(&text) {
            return Some(GpuReading {
                total_bytes: total,
                free_bytes: total,
                gpu_name: name,
                vendor: GpuVendor::Apple,
            });
        }

        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory() * 3 / 4;
        if total == 0 {
            return None;
        }
        let free = (sys.available_memory() * 3 / 4).min(total);
        Some(GpuReading {
            total_bytes: total,
            free_bytes: free,
            gpu_name: name,
            vendor: GpuVendor::Apple,
        })
    }
}

// ── Resolution ─────────────────────────────────────────────────────────────

/// Ranked provider list plus the manual/default fallbacks.
pub struct VramResolver {
    providers: Vec<Box<dyn VramProvider>>,
    gpu_id: u32,
    manual_bytes: Option<u64>,
    default_bytes: u64,
    warned: AtomicBool,
}

impl VramResolver {
    pub fn new(
        providers: Vec<Box<dyn VramProvider>>,
        gpu_id: u32,
        manual_bytes: Option<u64>,
        default_bytes: u64,
    ) -> Self {
        Self {
            providers,
            gpu_id,
            manual_bytes,
            default_bytes,
            warned: AtomicBool::new(false),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let gpu = &settings.gpu;
        let wanted = |vendor: GpuVendor, enabled: bool| {
            enabled
                && match gpu.selection {
                    GpuSelection::Auto => true,
                    GpuSelection::Nvidia => vendor == GpuVendor::Nvidia,
                    GpuSelection::Amd => vendor == GpuVendor::Amd,
                    GpuSelection::Intel => vendor == GpuVendor::Intel,
                    GpuSelection::Apple => vendor == GpuVendor::Apple,
                }
        };

        let mut providers: Vec<Box<dyn VramProvider>> = Vec::new();
        if wanted(GpuVendor::Nvidia, gpu.detect_nvidia) {
            providers.push(Box::new(NvidiaSmi));
        }
        if wanted(GpuVendor::Amd, gpu.detect_amd) {
            providers.push(Box::new(SysfsDrm::amd()));
            providers.push(Box::new(WindowsCim::new(GpuVendor::Amd)));
        }
        if wanted(GpuVendor::Intel, gpu.detect_intel) {
            providers.push(Box::new(SysfsDrm::intel()));
            providers.push(Box::new(WindowsCim::new(GpuVendor::Intel)));
        }
        if wanted(GpuVendor::Apple, gpu.detect_apple) {
            providers.push(Box::new(MacDisplays));
        }
        if wanted(GpuVendor::Nvidia, gpu.detect_nvidia) {
            providers.push(Box::new(WindowsCim::new(GpuVendor::Nvidia)));
        }

        Self::new(
            providers,
            gpu.gpu_id,
            settings.vram.manual_budget_bytes,
            settings.vram.conservative_default_bytes,
        )
    }

    /// Current budget. Re-reads hardware on every call.
    pub fn resolve(&self) -> VramBudget {
        if let Some(bytes) = self.manual_bytes {
            return VramBudget {
                total_bytes: bytes,
                free_bytes: bytes,
                source: BudgetSource::ManualOverride,
                gpu_id: self.gpu_id,
                vendor: None,
                gpu_name: None,
            };
        }

        for provider in &self.providers {
            if let Some(reading) = provider.query(self.gpu_id) {
                log::debug!(
                    "[vram] {} reports {} MiB free of {} MiB on {}",
                    provider.name(),
                    reading.free_bytes / MIB,
                    reading.total_bytes / MIB,
                    reading.gpu_name
                );
                return VramBudget {
                    total_bytes: reading.total_bytes,
                    free_bytes: reading.free_bytes,
                    source: BudgetSource::Hardware,
                    gpu_id: self.gpu_id,
                    vendor: Some(reading.vendor),
                    gpu_name: Some(reading.gpu_name),
                };
            }
        }

        if !self.warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "[vram] no GPU memory reading for gpu {}; assuming {} MiB. Set vram.manual_budget_bytes to override",
                self.gpu_id,
                self.default_bytes / MIB
            );
        }
        VramBudget {
            total_bytes: self.default_bytes,
            free_bytes: self.default_bytes,
            source: BudgetSource::ConservativeDefault,
            gpu_id: self.gpu_id,
            vendor: None,
            gpu_name: None,
        }
    }
}

// ── Compute backends ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Backends {
    pub cuda: bool,
    pub vulkan: bool,
    pub hip: bool,
    pub metal: bool,
}

fn can_load(names: &[&str]) -> bool {
    names.iter().any(|name| unsafe { Library::new(name) }.is_ok())
}

/// Runtime libraries present on this machine.
pub fn detect_backends() -> Backends {
    #[cfg(target_os = "windows")]
    let backends = Backends {
        cuda: can_load(&["nvcuda.dll"]),
        vulkan: can_load(&["vulkan-1.dll"]),
        hip: can_load(&["amdhip64.dll", "amdhip64_6.dll"]),
        metal: false,
    };
    #[cfg(target_os = "macos")]
    let backends = Backends {
        cuda: false,
        vulkan: can_load(&["libvulkan.1.dylib"]),
        hip: false,
        metal: true,
    };
    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    let backends = Backends {
        cuda: can_load(&["libcuda.so.1", "libcuda.so"]),
        vulkan: can_load(&["libvulkan.so.1"]),
        hip: can_load(&["libamdhip64.so", "libamdhip64.so.6"]),
        metal: false,
    };
    log::debug!("[vram] backends: {:?}", backends);
    backends
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<GpuReading>);

    impl VramProvider for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }
        fn vendor(&self) -> GpuVendor {
            GpuVendor::Nvidia
        }
        fn query(&self, _gpu_id: u32) -> Option<GpuReading> {
            self.0.clone()
        }
    }

    fn reading(total_mb: u64, free_mb: u64) -> GpuReading {
        GpuReading {
            total_bytes: total_mb * MIB,
            free_bytes: free_mb * MIB,
            gpu_name: "Test GPU".to_string(),
            vendor: GpuVendor::Nvidia,
        }
    }

    #[test]
    fn test_manual_override_wins() {
        let resolver = VramResolver::new(
            vec![Box::new(Fixed(Some(reading(24576, 20000))))],
            0,
            Some(12_000_000_000),
            4 * 1024 * MIB,
        );
        let budget = resolver.resolve();
        assert_eq!(budget.source, BudgetSource::ManualOverride);
        assert_eq!(budget.free_bytes, 12_000_000_000);
        assert_eq!(budget.total_bytes, 12_000_000_000);
    }

    #[test]
    fn test_first_answering_provider_wins() {
        let resolver = VramResolver::new(
            vec![Box::new(Fixed(None)), Box::new(Fixed(Some(reading(8192, 6000))))],
            0,
            None,
            4 * 1024 * MIB,
        );
        let budget = resolver.resolve();
        assert_eq!(budget.source, BudgetSource::Hardware);
        assert_eq!(budget.free_mb(), 6000);
        assert_eq!(budget.gpu_name.as_deref(), Some("Test GPU"));
    }

    #[test]
    fn test_conservative_default_when_nothing_answers() {
        let resolver = VramResolver::new(vec![Box::new(Fixed(None))], 1, None, 4096 * MIB);
        for _ in 0..2 {
            let budget = resolver.resolve();
            assert_eq!(budget.source, BudgetSource::ConservativeDefault);
            assert_eq!(budget.free_bytes, 4096 * MIB);
            assert_eq!(budget.gpu_id, 1);
        }
        assert!(resolver.warned.load(Ordering::Relaxed));
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let r = parse_nvidia_smi("24564, 23012, NVIDIA GeForce RTX 4090\n").unwrap();
        assert_eq!(r.total_bytes, 24564 * MIB);
        assert_eq!(r.free_bytes, 23012 * MIB);
        assert_eq!(r.gpu_name, "NVIDIA GeForce RTX 4090");
        assert!(parse_nvidia_smi("").is_none());
        assert!(parse_nvidia_smi("[N/A], [N/A], x").is_none());
    }

    #[test]
    fn test_sysfs_reads_matching_vendor() {
        let dir = tempfile::tempdir().unwrap();
        let card = |name: &str, vendor: &str, total: u64, used: u64| {
            let dev = dir.path().join(name).join("device");
            std::fs::create_dir_all(&dev).unwrap();
            std::fs::write(dev.join("vendor"), format!("{vendor}\n")).unwrap();
            std::fs::write(dev.join("mem_info_vram_total"), total.to_string()).unwrap();
            std::fs::write(dev.join("mem_info_vram_used"), used.to_string()).unwrap();
        };
        card("card0", "0x8086", 512 * MIB, 0);
        card("card1", "0x1002", 16384 * MIB, 1024 * MIB);
        std::fs::create_dir_all(dir.path().join("card1-DP-1")).unwrap();

        let amd = SysfsDrm::with_root(dir.path(), "0x1002", GpuVendor::Amd);
        let r = amd.query(0).unwrap();
        assert_eq!(r.total_bytes, 16384 * MIB);
        assert_eq!(r.free_bytes, 15360 * MIB);
        assert_eq!(r.vendor, GpuVendor::Amd);
        assert!(amd.query(1).is_none());
    }

    #[test]
    fn test_parse_system_profiler() {
        let text = "Graphics:\n  Chipset Model: AMD Radeon Pro 5500M\n  VRAM (Total): 8 GB\n";
        assert_eq!(parse_system_profiler_vram(text), Some(8 * 1024 * MIB));
        assert_eq!(parse_system_profiler_vram("Chipset Model: Apple M2"), None);
    }

    #[test]
    fn test_selection_limits_providers() {
        let mut settings = Settings::default();
        settings.gpu.selection = GpuSelection::Nvidia;
        let resolver = VramResolver::from_settings(&settings);
        assert!(resolver.providers.iter().all(|p| p.vendor() == GpuVendor::Nvidia));
        assert!(!resolver.providers.is_empty());
    }
}
