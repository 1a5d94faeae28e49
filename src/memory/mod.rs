//! Device memory helpers used around model relocation.

use candle_core::Device;
use log::{debug, info};
use std::process::Command;

use crate::error::Result;

/// Release cached allocations on `device` after models were moved off it.
///
/// Candle frees buffers when the last tensor referencing them drops, so this
/// waits for queued work to finish; nothing else is held.
pub fn empty_cache(device: &Device) -> Result<()> {
    if device.is_cpu() {
        return Ok(());
    }
    device.synchronize()?;
    debug!("Synchronized {:?} after offloading", device);
    Ok(())
}

/// One-line summary of GPU memory use from `nvidia-smi`, if available.
pub fn gpu_memory_info() -> Option<String> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.used,memory.free,memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_memory_line(&String::from_utf8_lossy(&output.stdout))
}

fn parse_memory_line(line: &str) -> Option<String> {
    let parts: Vec<f32> = line
        .lines()
        .next()?
        .split(',')
        .map(|p| p.trim().parse::<f32>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;
    let [used, free, total] = parts[..] else {
        return None;
    };
    if total <= 0.0 {
        return None;
    }
    Some(format!(
        "GPU Memory: {:.1}GB/{:.1}GB used ({:.1}% free)",
        used / 1024.0,
        total / 1024.0,
        (free / total) * 100.0
    ))
}

/// Log memory usage at a named stage. Silent when no GPU is visible.
pub fn log_memory_usage(stage: &str) {
    if let Some(info) = gpu_memory_info() {
        info!("[{}] {}", stage, info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_line() {
        let info = parse_memory_line("2048, 22528, 24576\n").expect("parsed");
        assert_eq!(info, "GPU Memory: 2.0GB/24.0GB used (91.7% free)");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_memory_line("N/A").is_none());
        assert!(parse_memory_line("1, 2").is_none());
    }

    #[test]
    fn cpu_cache_is_noop() -> Result<()> {
        empty_cache(&Device::Cpu)
    }
}
