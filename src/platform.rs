//! Compute backend checks at startup.

use candle_core::utils;
use candle_core::Device;
use log::info;

use crate::error::{Result, TrainerError};

/// Log which backends this build can use.
pub fn log_backends() {
    info!(
        "candle backends: cuda={} metal={} avx={} mkl={} threads={}",
        utils::cuda_is_available(),
        utils::metal_is_available(),
        utils::with_avx(),
        utils::has_mkl(),
        utils::get_num_threads()
    );
}

/// Fail early when `device` needs a backend this build lacks.
pub fn ensure_available(device: &Device) -> Result<()> {
    if device.is_cuda() && !utils::cuda_is_available() {
        return Err(TrainerError::config("CUDA device requested but CUDA is not available"));
    }
    if device.is_metal() && !utils::metal_is_available() {
        return Err(TrainerError::config("Metal device requested but Metal is not available"));
    }
    Ok(())
}
