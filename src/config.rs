use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_OPACITY: f32 = 0.3;
pub const DEFAULT_SCALE: f32 = 0.9;

/// Canonical page the overlay is drawn on, in PDF points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    pub const LETTER: PageSize = PageSize {
        width: 612.0,
        height: 792.0,
    };
}

impl Default for PageSize {
    fn default() -> Self {
        PageSize::LETTER
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderOptions {
    /// Constant fill alpha applied to the whole logo.
    pub opacity: f32,
    /// Fraction of the logo's native pixel size (1 px = 1 pt).
    pub scale: f32,
    pub page: PageSize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            opacity: DEFAULT_OPACITY,
            scale: DEFAULT_SCALE,
            page: PageSize::default(),
        }
    }
}

impl RenderOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.opacity > 0.0 && self.opacity <= 1.0) {
            return Err(Error::Config(format!(
                "opacity must be in (0, 1], got {}",
                self.opacity
            )));
        }
        if !(self.scale > 0.0 && self.scale.is_finite()) {
            return Err(Error::Config(format!(
                "scale must be a positive number, got {}",
                self.scale
            )));
        }
        if self.page.width <= 0.0 || self.page.height <= 0.0 {
            return Err(Error::Config("page size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts per remote call, including the first one.
    pub attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff before attempt `attempt + 1` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(10);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MirrorOptions {
    /// Prepended to every uploaded document name.
    pub output_prefix: String,
    /// Appended to the source folder name to name the destination root.
    pub dest_root_suffix: String,
    pub retry: RetryPolicy,
}

impl Default for MirrorOptions {
    fn default() -> Self {
        Self {
            output_prefix: "watermarked_".to_string(),
            dest_root_suffix: " (Watermarked)".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl MirrorOptions {
    pub fn output_name(&self, original: &str) -> String {
        format!("{}{}", self.output_prefix, original)
    }

    pub fn dest_root_name(&self, source_name: &str) -> String {
        format!("{}{}", source_name, self.dest_root_suffix)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub render: RenderOptions,
    pub mirror: MirrorOptions,
}

impl Config {
    /// Loads a JSON config file; missing keys fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.render.validate()?;
        if self.mirror.retry.attempts == 0 {
            return Err(Error::Config("retry.attempts must be at least 1".into()));
        }
        if self.mirror.output_prefix.is_empty() {
            return Err(Error::Config(
                "outputPrefix must not be empty, outputs would shadow their sources".into(),
            ));
        }
        Ok(())
    }
}
