//! Packet-loss parsing and outcome classification.
//!
//! Devices print ping summaries in a handful of shapes
//! (`0% packet loss`, `0.00% packet loss`, `100% loss rate`); only the
//! percentage matters for the outcome.

use crate::errors::ParseError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static PACKET_LOSS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+\.?\d*)%\s*(packet\s+loss|loss rate)")
        .expect("packet loss regex is valid")
});

/// Number of characters of statistics text quoted in a parse error.
const ERROR_EXCERPT_CHARS: usize = 200;

/// Classification of one ping run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Outcome {
    /// No packets lost.
    #[serde(rename = "SF")]
    NoFailure,
    /// Some packets lost.
    #[serde(rename = "FP")]
    PartialFailure,
    /// Every packet lost, or the run could not be evaluated.
    #[serde(rename = "FT")]
    #[default]
    TotalFailure,
}

impl Outcome {
    /// Two-letter code stored alongside each result.
    pub fn code(self) -> &'static str {
        match self {
            Self::NoFailure => "SF",
            Self::PartialFailure => "FP",
            Self::TotalFailure => "FT",
        }
    }

    /// Human-readable label for dashboards and logs.
    pub fn label(self) -> &'static str {
        match self {
            Self::NoFailure => "no failure",
            Self::PartialFailure => "partial failure",
            Self::TotalFailure => "total failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Outcome {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SF" => Ok(Self::NoFailure),
            "FP" => Ok(Self::PartialFailure),
            "FT" => Ok(Self::TotalFailure),
            other => Err(ParseError::UnknownOutcome(other.to_string())),
        }
    }
}

/// Map a packet-loss percentage to an outcome.
pub fn classify_packet_loss(loss_percent: f64) -> Outcome {
    if loss_percent == 0.0 {
        Outcome::NoFailure
    } else if loss_percent == 100.0 {
        Outcome::TotalFailure
    } else {
        Outcome::PartialFailure
    }
}

/// Extract the packet-loss percentage from a statistics block.
pub fn parse_packet_loss(stats_text: &str) -> Result<f64, ParseError> {
    let caps = PACKET_LOSS_RE
        .captures(stats_text)
        .ok_or_else(|| ParseError::PacketLossMissing {
            excerpt: crate::util::truncate_chars(stats_text, ERROR_EXCERPT_CHARS),
        })?;
    let raw = &caps[1];
    raw.parse::<f64>()
        .map_err(|_| ParseError::InvalidPacketLoss(raw.to_string()))
}

/// Parse and classify in one step.
pub fn classify_statistics(stats_text: &str) -> Result<Outcome, ParseError> {
    parse_packet_loss(stats_text).map(classify_packet_loss)
}
