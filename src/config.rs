use crate::error::PipelineError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Bounds every configured vehicle range must stay within.
pub const VEHICLE_COUNT_MIN: u32 = 100;
pub const VEHICLE_COUNT_MAX: u32 = 500;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub generation: GenerationConfig,
    pub map: MapConfig,
    pub output: OutputConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    pub data_csv: PathBuf,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self { data_csv: PathBuf::from("gps_data.csv") }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub seed: u64,
    pub min_vehicles: u32,
    pub max_vehicles: u32,
    /// Half the side of a congestion box, in degrees (~400m box at 0.004).
    pub zone_half_size: f64,
    /// Standard deviation of vehicle jitter, in degrees.
    pub vehicle_spread: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            min_vehicles: VEHICLE_COUNT_MIN,
            max_vehicles: VEHICLE_COUNT_MAX,
            zone_half_size: 0.004,
            vehicle_spread: 0.0006,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MapConfig {
    pub zoom_start: u8,
    pub tile_url: String,
    pub disable_clustering_at_zoom: u8,
    pub title: String,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            zoom_start: 11,
            tile_url: "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            disable_clustering_at_zoom: 15,
            title: "Large-Scale Traffic Monitoring Application".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { dir: PathBuf::from("output") }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 3000 }
    }
}

impl AppConfig {
    /// Reads the TOML config, falling back to defaults when the file does not exist.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {:?} not found, using defaults", path);
            let config = AppConfig::default();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        let generation = &self.generation;
        if generation.min_vehicles > generation.max_vehicles {
            return Err(PipelineError::InvalidConfig {
                reason: format!(
                    "min_vehicles ({}) exceeds max_vehicles ({})",
                    generation.min_vehicles, generation.max_vehicles
                ),
            });
        }
        if generation.min_vehicles < VEHICLE_COUNT_MIN
            || generation.max_vehicles > VEHICLE_COUNT_MAX
        {
            return Err(PipelineError::InvalidConfig {
                reason: format!(
                    "vehicle range {}..={} must lie within {}..={}",
                    generation.min_vehicles,
                    generation.max_vehicles,
                    VEHICLE_COUNT_MIN,
                    VEHICLE_COUNT_MAX
                ),
            });
        }
        for (name, value) in [
            ("zone_half_size", generation.zone_half_size),
            ("vehicle_spread", generation.vehicle_spread),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PipelineError::InvalidConfig {
                    reason: format!("{} must be a positive finite number, got {}", name, value),
                });
            }
        }
        Ok(())
    }
}
