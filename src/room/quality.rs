#![forbid(unsafe_code)]

// Quality tiers and the fixed presets behind them

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Selectable quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityTier {
    pub fn all() -> [QualityTier; 4] {
        [Self::Low, Self::Medium, Self::High, Self::Ultra]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Ultra => "ultra",
        }
    }
}

impl std::str::FromStr for QualityTier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "ultra" => Ok(Self::Ultra),
            other => Err(CoreError::InvalidMessage(format!(
                "unknown quality tier: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolution, frame rate and target bitrate for outgoing video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityProfile {
    pub width: u32,
    pub height: u32,
    pub frame_rate_fps: u32,
    pub bitrate_bps: u64,
    pub tier: QualityTier,
}

impl QualityProfile {
    /// The fixed preset for a tier.
    pub fn preset(tier: QualityTier) -> Self {
        match tier {
            QualityTier::Low => Self {
                width: 1280,
                height: 720,
                frame_rate_fps: 24,
                bitrate_bps: 800_000,
                tier,
            },
            QualityTier::Medium => Self {
                width: 1920,
                height: 1080,
                frame_rate_fps: 30,
                bitrate_bps: 2_000_000,
                tier,
            },
            QualityTier::High => Self {
                width: 1920,
                height: 1080,
                frame_rate_fps: 60,
                bitrate_bps: 4_000_000,
                tier,
            },
            QualityTier::Ultra => Self {
                width: 2560,
                height: 1440,
                frame_rate_fps: 60,
                bitrate_bps: 6_000_000,
                tier,
            },
        }
    }

    /// Short human label, e.g. `1920x1080@30fps`.
    pub fn label(&self) -> String {
        format!("{}x{}@{}fps", self.width, self.height, self.frame_rate_fps)
    }
}

impl Default for QualityProfile {
    fn default() -> Self {
        Self::preset(QualityTier::Medium)
    }
}
