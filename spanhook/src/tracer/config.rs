//! Tracer configuration, shared by the locator, the units and the
//! orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use crate::domain::{Port, TracerError};

/// Default directory holding one compiled eBPF object per unit
pub const DEFAULT_BPF_DIR: &str = "/usr/lib/spanhook/bpf";

/// Units enabled when none are configured explicitly
pub const DEFAULT_TRACERS: &[&str] = &["nethttp", "grpc", "goruntime", "httpfltr", "tls"];

#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Instrument the process whose executable matches this name
    pub exec_name: Option<String>,
    /// Instrument the process owning this listening port
    pub port: Option<Port>,
    /// Trace every process; service names come from each record
    pub system_wide: bool,
    /// Do not inspect Go symbols, only generic units can attach
    pub skip_go_specific_tracers: bool,
    pub service_name: Option<String>,
    pub bpf_dir: PathBuf,
    /// bpffs directory pinned maps are shared through
    pub bpf_pin_path: Option<PathBuf>,
    pub tracers: Vec<String>,
    /// Spans per forwarded batch
    pub batch_length: usize,
    /// Maximum time a partial batch waits before being forwarded
    pub batch_timeout: Duration,
    /// Capacity of the shared span channel
    pub channel_capacity: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            exec_name: None,
            port: None,
            system_wide: false,
            skip_go_specific_tracers: false,
            service_name: None,
            bpf_dir: PathBuf::from(DEFAULT_BPF_DIR),
            bpf_pin_path: None,
            tracers: DEFAULT_TRACERS.iter().map(ToString::to_string).collect(),
            batch_length: 100,
            batch_timeout: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }
}

impl TracerConfig {
    /// Check the combination of settings.
    ///
    /// # Errors
    /// Returns [`TracerError::InvalidConfig`] when both or neither discovery
    /// criteria are set, or when a batching value is zero.
    pub fn validate(&self) -> Result<(), TracerError> {
        match (&self.exec_name, self.port) {
            (Some(_), Some(_)) => {
                return Err(TracerError::InvalidConfig(
                    "--exec-name and --port are mutually exclusive".to_string(),
                ))
            }
            (None, None) => {
                return Err(TracerError::InvalidConfig(
                    "missing required argument: --exec-name or --port".to_string(),
                ))
            }
            (Some(name), None) if name.is_empty() => {
                return Err(TracerError::InvalidConfig("--exec-name cannot be empty".to_string()))
            }
            _ => {}
        }
        if self.port == Some(Port(0)) {
            return Err(TracerError::InvalidConfig("--port must be non-zero".to_string()));
        }
        if self.batch_length == 0 || self.channel_capacity == 0 {
            return Err(TracerError::InvalidConfig(
                "batch length and channel capacity must be non-zero".to_string(),
            ));
        }
        if self.batch_timeout.is_zero() {
            return Err(TracerError::InvalidConfig("batch timeout must be non-zero".to_string()));
        }
        if self.tracers.is_empty() {
            return Err(TracerError::InvalidConfig("no tracers enabled".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_criteria() {
        let by_name = TracerConfig { exec_name: Some("app".into()), ..TracerConfig::default() };
        assert!(by_name.validate().is_ok());

        let both = TracerConfig { port: Some(Port(80)), ..by_name.clone() };
        assert!(both.validate().unwrap_err().to_string().contains("mutually exclusive"));

        let neither = TracerConfig::default();
        assert!(neither.validate().unwrap_err().to_string().contains("missing required argument"));
    }

    #[test]
    fn test_validate_batching() {
        let config = TracerConfig {
            port: Some(Port(8080)),
            batch_length: 0,
            ..TracerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
