use std::{path::Path, sync::LazyLock};

use demux_bus::PipelineOptions;
use serde::Deserialize;

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "LITE_DEMUX_CONFIG";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DemuxConfig {
    chunk_size: usize,
    byte_channel_capacity: usize,
    readable_high_water_mark: usize,
    writable_high_water_mark: usize,
    decode: bool,
    log_level: String,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        let options = PipelineOptions::default();
        Self {
            chunk_size: 64 * 1024,
            byte_channel_capacity: options.byte_channel_capacity,
            readable_high_water_mark: options.readable_high_water_mark,
            writable_high_water_mark: options.writable_high_water_mark,
            decode: false,
            log_level: "info".to_string(),
        }
    }
}

impl DemuxConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read {}: {}", path.display(), e))?;
        Self::from_json(&json)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    pub fn decode(&self) -> bool {
        self.decode
    }

    /// Unknown levels fall back to `info`.
    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions::default()
            .with_byte_channel_capacity(self.byte_channel_capacity)
            .with_readable_high_water_mark(self.readable_high_water_mark)
            .with_writable_high_water_mark(self.writable_high_water_mark)
    }
}

pub fn config() -> &'static DemuxConfig {
    static CONFIG: LazyLock<DemuxConfig> = LazyLock::new(|| match std::env::var(CONFIG_ENV) {
        Ok(path) => DemuxConfig::load(&path).unwrap_or_else(|e| {
            eprintln!("Error loading config {}: {:#}, using defaults", path, e);
            DemuxConfig::default()
        }),
        Err(_) => DemuxConfig::default(),
    });
    &CONFIG
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
