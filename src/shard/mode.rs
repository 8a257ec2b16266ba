//! Shard operating modes

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Operating mode of a shard.
///
/// ```text
///   ReadWrite ──errors──▶ ReadOnly
///   DegradedNoMetabase ──errors──▶ DegradedReadOnly
///   any ──SetMode──▶ any        Disabled ──reopen──▶ any
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Mode {
    #[default]
    #[serde(rename = "read-write")]
    ReadWrite,
    #[serde(rename = "read-only")]
    ReadOnly,
    #[serde(rename = "degraded")]
    DegradedNoMetabase,
    #[serde(rename = "degraded-read-only")]
    DegradedReadOnly,
    #[serde(rename = "disabled")]
    Disabled,
}

impl Mode {
    /// Writes are rejected
    pub fn read_only(&self) -> bool {
        matches!(
            self,
            Mode::ReadOnly | Mode::DegradedReadOnly | Mode::Disabled
        )
    }

    /// Metabase is not used
    pub fn no_metabase(&self) -> bool {
        matches!(
            self,
            Mode::DegradedNoMetabase | Mode::DegradedReadOnly | Mode::Disabled
        )
    }

    pub fn disabled(&self) -> bool {
        matches!(self, Mode::Disabled)
    }

    /// Mode the engine demotes to once the error threshold is crossed
    pub fn demoted(&self) -> Mode {
        if self.no_metabase() {
            Mode::DegradedReadOnly
        } else {
            Mode::ReadOnly
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::ReadWrite => "read-write",
            Mode::ReadOnly => "read-only",
            Mode::DegradedNoMetabase => "degraded",
            Mode::DegradedReadOnly => "degraded-read-only",
            Mode::Disabled => "disabled",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "read-write" => Ok(Mode::ReadWrite),
            "read-only" => Ok(Mode::ReadOnly),
            "degraded" => Ok(Mode::DegradedNoMetabase),
            "degraded-read-only" => Ok(Mode::DegradedReadOnly),
            "disabled" => Ok(Mode::Disabled),
            other => Err(Error::InvalidConfig(format!("unknown shard mode {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_flags() {
        assert!(!Mode::ReadWrite.read_only());
        assert!(Mode::ReadOnly.read_only() && !Mode::ReadOnly.no_metabase());
        assert!(Mode::DegradedNoMetabase.no_metabase() && !Mode::DegradedNoMetabase.read_only());
        assert!(Mode::DegradedReadOnly.read_only() && Mode::DegradedReadOnly.no_metabase());
        assert!(Mode::Disabled.disabled());
    }

    #[test]
    fn test_demotion_keeps_metabase_state() {
        assert_eq!(Mode::ReadWrite.demoted(), Mode::ReadOnly);
        assert_eq!(Mode::DegradedNoMetabase.demoted(), Mode::DegradedReadOnly);
    }

    #[test]
    fn test_mode_names_parse_back() {
        for m in [
            Mode::ReadWrite,
            Mode::ReadOnly,
            Mode::DegradedNoMetabase,
            Mode::DegradedReadOnly,
            Mode::Disabled,
        ] {
            assert_eq!(m.name().parse::<Mode>().unwrap(), m);
        }
    }
}
