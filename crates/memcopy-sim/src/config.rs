//! Simulator configuration.
//!
//! Defaults describe a single GPU behind a PCIe 4.0 x16-class link. Every
//! field can be overridden from a JSON document; missing fields keep their
//! defaults.

use std::fs;
use std::path::Path;

use memcopy_core::{MemcopyError, Result};
use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Number of simulated devices.
    pub num_gpus: u32,
    /// Device memory per GPU, in bytes.
    pub memory_per_gpu: u64,
    /// Allocation granularity, in bytes. Must be a power of two.
    pub page_size: u64,
    /// Host link bandwidth, bytes per second.
    pub link_bandwidth: f64,
    /// One-way host link latency, seconds.
    pub link_latency: f64,
    /// Device memory bandwidth, bytes per second.
    pub dram_bandwidth: f64,
    /// Transfer chunk size, in bytes.
    pub chunk_size: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_gpus: 1,
            memory_per_gpu: 4 * GIB,
            page_size: 4096,
            link_bandwidth: 16.0e9,
            link_latency: 1.0e-6,
            dram_bandwidth: 512.0e9,
            chunk_size: 64 * 1024,
        }
    }
}

impl SimConfig {
    pub fn with_num_gpus(mut self, n: u32) -> Self {
        self.num_gpus = n;
        self
    }

    pub fn with_memory_per_gpu(mut self, bytes: u64) -> Self {
        self.memory_per_gpu = bytes;
        self
    }

    pub fn with_link(mut self, bandwidth: f64, latency: f64) -> Self {
        self.link_bandwidth = bandwidth;
        self.link_latency = latency;
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Parse a (possibly partial) JSON document and validate it.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: SimConfig = serde_json::from_str(s)
            .map_err(|e| MemcopyError::Config(format!("sim config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| MemcopyError::Config(format!("sim config encode error: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_gpus == 0 {
            return Err(MemcopyError::Config("num_gpus must be at least 1".into()));
        }
        if !self.page_size.is_power_of_two() {
            return Err(MemcopyError::Config(format!(
                "page_size must be a power of two, got {}",
                self.page_size
            )));
        }
        if self.chunk_size == 0 {
            return Err(MemcopyError::Config("chunk_size must be positive".into()));
        }
        for (name, v) in [
            ("link_bandwidth", self.link_bandwidth),
            ("dram_bandwidth", self.dram_bandwidth),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(MemcopyError::Config(format!("{name} must be positive, got {v}")));
            }
        }
        if !(self.link_latency.is_finite() && self.link_latency >= 0.0) {
            return Err(MemcopyError::Config(format!(
                "link_latency must be non-negative, got {}",
                self.link_latency
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        SimConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let c = SimConfig::from_json_str(r#"{ "num_gpus": 2, "link_bandwidth": 8e9 }"#).unwrap();
        assert_eq!(c.num_gpus, 2);
        assert_eq!(c.link_bandwidth, 8e9);
        assert_eq!(c.page_size, SimConfig::default().page_size);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = SimConfig::from_json_str(r#"{ "warp_size": 32 }"#).unwrap_err();
        assert!(err.to_string().contains("warp_size"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SimConfig::default().with_num_gpus(0).validate().is_err());
        assert!(SimConfig::default().with_chunk_size(0).validate().is_err());
        assert!(SimConfig::default().with_link(0.0, 0.0).validate().is_err());
        assert!(SimConfig::default().with_link(1e9, -1.0).validate().is_err());
        let odd_page = SimConfig {
            page_size: 3000,
            ..SimConfig::default()
        };
        assert!(odd_page.validate().is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let c = SimConfig::default().with_num_gpus(3);
        let back = SimConfig::from_json_str(&c.to_json().unwrap()).unwrap();
        assert_eq!(back, c);
    }
}
