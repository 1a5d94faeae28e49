//! Device residency bookkeeping.
//!
//! Models that can be moved between devices implement [`Resident`]. Moves made
//! to free memory are recorded in a [`ResidencyLedger`] so the prior placement
//! can be restored afterwards.

use candle_core::{DType, Device};
use log::info;

use crate::error::Result;

/// Where a model currently lives and in which precision.
#[derive(Debug, Clone)]
pub struct Placement {
    pub device: Device,
    pub dtype: DType,
}

impl Placement {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    pub fn same_as(&self, other: &Placement) -> bool {
        self.dtype == other.dtype && self.device.same_device(&other.device)
    }
}

/// A model whose weights can be relocated.
pub trait Resident {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn placement(&self) -> Placement;

    /// Move to `device`. When `dtype` is `None` the current precision is kept.
    fn relocate(&mut self, device: &Device, dtype: Option<DType>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Vae,
    Unet,
    TextEncoder1,
    TextEncoder2,
}

/// Prior placements of models moved out of the way.
#[derive(Debug, Default)]
pub struct ResidencyLedger {
    entries: Vec<(ModelRole, Placement)>,
}

impl ResidencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record where `model` is now.
    pub fn record(&mut self, role: ModelRole, model: &dyn Resident) {
        self.record_placement(role, model.placement());
    }

    pub fn record_placement(&mut self, role: ModelRole, placement: Placement) {
        self.entries.push((role, placement));
    }

    /// Record the current placement of `model`, then move it to `holding`.
    pub fn offload(&mut self, role: ModelRole, model: &mut dyn Resident, holding: &Device) -> Result<()> {
        self.record(role, model);
        info!("Moving {} to {:?} to save memory", model.name(), holding);
        model.relocate(holding, None)
    }

    pub fn prior(&self, role: ModelRole) -> Option<&Placement> {
        self.entries.iter().rev().find(|(r, _)| *r == role).map(|(_, p)| p)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move `model` back to where it was recorded for `role`, in its recorded precision.
    pub fn restore(&self, role: ModelRole, model: &mut dyn Resident) -> Result<()> {
        match self.prior(role) {
            Some(placement) => {
                info!("Moving {} back to {:?}", model.name(), placement.device);
                model.relocate(&placement.device, Some(placement.dtype))
            }
            None => Ok(()),
        }
    }
}
