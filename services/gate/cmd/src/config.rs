//! Configuration handling for the gate daemon.
//!
//! Reads the optional YAML config file and environment variables, layered
//! under the command-line arguments: defaults < file < environment < CLI.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

/// Gate daemon configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    /// Listen address for client connections
    pub listen: SocketAddr,
    /// Maximum accepted frame body size
    pub max_frame_size: usize,
    /// Worker pool floor
    pub min_workers: usize,
    /// Worker pool cap
    pub max_workers: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7001".parse().expect("static address"),
            max_frame_size: 64 * 1024,
            min_workers: 10,
            max_workers: 256 * 1024,
        }
    }
}

/// Root configuration structure (matches the YAML layout)
#[derive(Debug, Deserialize)]
struct RootConfig {
    gate: Option<GateSection>,
}

#[derive(Debug, Deserialize)]
struct GateSection {
    listen: Option<String>,
    max_frame_size: Option<usize>,
    workers: Option<WorkersSection>,
}

#[derive(Debug, Deserialize)]
struct WorkersSection {
    min: Option<usize>,
    max: Option<usize>,
}

impl GateConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => {
                    warn!(
                        "failed to parse config file {:?} ({e}), using defaults",
                        config_path.as_ref()
                    );
                }
            }
        } else {
            warn!(
                "config file {:?} not found, using defaults",
                config_path.as_ref()
            );
        }

        config.apply_environment_overrides();

        info!(
            listen = %config.listen,
            max_frame_size = config.max_frame_size,
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            "final gate configuration"
        );

        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let Some(gate) = root.gate else { return };

        if let Some(listen) = gate.listen {
            match listen.parse() {
                Ok(addr) => self.listen = addr,
                Err(e) => warn!("invalid gate.listen {listen:?} in config file: {e}"),
            }
        }
        if let Some(size) = gate.max_frame_size {
            self.max_frame_size = size;
        }
        if let Some(workers) = gate.workers {
            if let Some(min) = workers.min {
                self.min_workers = min;
            }
            if let Some(max) = workers.max {
                self.max_workers = max;
            }
        }
    }

    fn apply_environment_overrides(&mut self) {
        if let Ok(listen) = std::env::var("GATE_LISTEN") {
            match listen.parse() {
                Ok(addr) => self.listen = addr,
                Err(e) => warn!("invalid GATE_LISTEN {listen:?}: {e}"),
            }
        }
        if let Some(size) = env_usize("GATE_MAX_FRAME_SIZE") {
            self.max_frame_size = size;
        }
        if let Some(min) = env_usize("GATE_MIN_WORKERS") {
            self.min_workers = min;
        }
        if let Some(max) = env_usize("GATE_MAX_WORKERS") {
            self.max_workers = max;
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            warn!("invalid {name} {value:?}: {e}");
            None
        }
    }
}
