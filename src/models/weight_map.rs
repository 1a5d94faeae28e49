//! Raw weight holder for frozen models loaded directly from safetensors.

use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;

use crate::error::Result;
use crate::models::residency::{Placement, Resident};

/// Named tensors of one model with a uniform placement.
pub struct WeightMap {
    name: String,
    tensors: HashMap<String, Tensor>,
    placement: Placement,
}

impl WeightMap {
    pub fn new(name: impl Into<String>, tensors: HashMap<String, Tensor>, device: Device, dtype: DType) -> Result<Self> {
        let mut converted = HashMap::with_capacity(tensors.len());
        for (key, tensor) in tensors {
            converted.insert(key, tensor.to_device(&device)?.to_dtype(dtype)?);
        }
        Ok(Self {
            name: name.into(),
            tensors: converted,
            placement: Placement::new(device, dtype),
        })
    }

    /// Keep the tensors whose key starts with `prefix`, with the prefix removed.
    pub fn from_prefixed(
        name: impl Into<String>,
        all: &HashMap<String, Tensor>,
        prefix: &str,
        device: Device,
        dtype: DType,
    ) -> Result<Self> {
        let tensors = all
            .iter()
            .filter_map(|(k, t)| k.strip_prefix(prefix).map(|rest| (rest.to_string(), t.clone())))
            .collect();
        Self::new(name, tensors, device, dtype)
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) -> Result<()> {
        let tensor = tensor
            .to_device(&self.placement.device)?
            .to_dtype(self.placement.dtype)?;
        self.tensors.insert(key.into(), tensor);
        Ok(())
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl Resident for WeightMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn placement(&self) -> Placement {
        self.placement.clone()
    }

    fn relocate(&mut self, device: &Device, dtype: Option<DType>) -> Result<()> {
        let dtype = dtype.unwrap_or(self.placement.dtype);
        for tensor in self.tensors.values_mut() {
            *tensor = tensor.to_device(device)?.to_dtype(dtype)?;
        }
        self.placement = Placement::new(device.clone(), dtype);
        Ok(())
    }
}
