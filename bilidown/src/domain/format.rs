//! Requested output quality.

use serde::{Deserialize, Serialize};

/// Bilibili quality code (`qn`).
///
/// The set of codes the platform serves changes over time, so any positive
/// value is accepted; the constants below are the ones it currently knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoFormat(pub i64);

impl VideoFormat {
    pub const P240: Self = Self(6);
    pub const P360: Self = Self(16);
    pub const P480: Self = Self(32);
    pub const P720: Self = Self(64);
    pub const P720_60: Self = Self(74);
    pub const P1080: Self = Self(80);
    pub const P1080_PLUS: Self = Self(112);
    pub const P1080_60: Self = Self(116);
    pub const P4K: Self = Self(120);
    pub const HDR: Self = Self(125);
    pub const DOLBY_VISION: Self = Self(126);
    pub const P8K: Self = Self(127);

    pub const KNOWN: [Self; 12] = [
        Self::P240,
        Self::P360,
        Self::P480,
        Self::P720,
        Self::P720_60,
        Self::P1080,
        Self::P1080_PLUS,
        Self::P1080_60,
        Self::P4K,
        Self::HDR,
        Self::DOLBY_VISION,
        Self::P8K,
    ];

    pub fn code(&self) -> i64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Human readable label, `None` for codes outside [`Self::KNOWN`].
    pub fn label(&self) -> Option<&'static str> {
        Some(match self.0 {
            6 => "240P",
            16 => "360P",
            32 => "480P",
            64 => "720P",
            74 => "720P60",
            80 => "1080P",
            112 => "1080P+",
            116 => "1080P60",
            120 => "4K",
            125 => "HDR",
            126 => "Dolby Vision",
            127 => "8K",
            _ => return None,
        })
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.label() {
            Some(label) => f.write_str(label),
            None => write!(f, "qn={}", self.0),
        }
    }
}

impl From<i64> for VideoFormat {
    fn from(code: i64) -> Self {
        Self(code)
    }
}
