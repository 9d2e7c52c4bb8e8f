//! Cache sizing and recycling configuration.
//!
//! [`DrcConfig`] is deserialized from JSON by the harness, or built from the
//! server's `NFS_Core_Param` block with [`DrcConfig::from_core_params`].

use drc_error::{DrcError, Result};
use drc_types::DrcKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sizing of one cache flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheParams {
    /// Index partitions (independently locked).
    pub npart: usize,
    /// Hard cap: above this many entries retirement ignores the window.
    pub size: usize,
    /// Direct-mapped slots per partition; 0 disables the slot cache.
    pub cachesz: usize,
    /// High watermark: retirement starts above it once the window is closed.
    pub hiwat: usize,
    /// Whether the request checksum is part of the entry key.
    pub checksum: bool,
}

impl CacheParams {
    /// Defaults for the shared datagram cache.
    #[must_use]
    pub const fn shared_defaults() -> Self {
        Self {
            npart: 7,
            size: 32_768,
            cachesz: 599,
            hiwat: 16_384,
            checksum: true,
        }
    }

    /// Defaults for one per-connection stream cache.
    #[must_use]
    pub const fn per_connection_defaults() -> Self {
        Self {
            npart: 1,
            size: 1024,
            cachesz: 127,
            hiwat: 64,
            checksum: true,
        }
    }

    fn validate(&self, names: &ParamNames) -> Result<()> {
        if self.npart == 0 {
            return Err(invalid(names.npart, "must be non-zero"));
        }
        if self.size == 0 {
            return Err(invalid(names.size, "must be non-zero"));
        }
        if self.hiwat > self.size {
            return Err(invalid(
                names.hiwat,
                format!("{} exceeds size {}", self.hiwat, self.size),
            ));
        }
        Ok(())
    }
}

struct ParamNames {
    npart: &'static str,
    size: &'static str,
    hiwat: &'static str,
}

const SHARED_NAMES: ParamNames = ParamNames {
    npart: "shared.npart",
    size: "shared.size",
    hiwat: "shared.hiwat",
};

const PER_CONNECTION_NAMES: ParamNames = ParamNames {
    npart: "per_connection.npart",
    size: "per_connection.size",
    hiwat: "per_connection.hiwat",
};

fn invalid(field: &'static str, reason: impl Into<String>) -> DrcError {
    DrcError::InvalidConfig {
        field,
        reason: reason.into(),
    }
}

/// Configuration of the whole duplicate request cache subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrcConfig {
    /// Bypass caching for every request.
    pub disabled: bool,
    /// The single datagram cache.
    pub shared: CacheParams,
    /// Each per-connection stream cache.
    pub per_connection: CacheParams,
    /// Partitions of the recycling registry's peer index.
    pub recycle_npart: usize,
    /// How long a parked per-connection cache survives before it is reaped.
    pub recycle_expire_secs: u64,
    /// Minimum spacing between opportunistic expiry sweeps.
    pub expire_check_interval_secs: u64,
    /// Attempts to revive a cache another thread is still parking.
    pub max_revive_spins: u32,
}

impl Default for DrcConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            shared: CacheParams::shared_defaults(),
            per_connection: CacheParams::per_connection_defaults(),
            recycle_npart: 7,
            recycle_expire_secs: 600,
            expire_check_interval_secs: 600,
            max_revive_spins: 64,
        }
    }
}

impl DrcConfig {
    pub fn validate(&self) -> Result<()> {
        self.shared.validate(&SHARED_NAMES)?;
        self.per_connection.validate(&PER_CONNECTION_NAMES)?;
        if self.recycle_npart == 0 {
            return Err(invalid("recycle_npart", "must be non-zero"));
        }
        Ok(())
    }

    #[must_use]
    pub fn params_for(&self, kind: DrcKind) -> &CacheParams {
        if kind.is_shared() {
            &self.shared
        } else {
            &self.per_connection
        }
    }

    #[must_use]
    pub fn recycle_expire(&self) -> Duration {
        Duration::from_secs(self.recycle_expire_secs)
    }

    #[must_use]
    pub fn expire_check_interval(&self) -> Duration {
        Duration::from_secs(self.expire_check_interval_secs)
    }

    /// Build a configuration from `NFS_Core_Param` key/value pairs.
    ///
    /// Keys match case-insensitively. Keys without the `DRC_` prefix belong
    /// to other subsystems and are skipped. The result is validated.
    pub fn from_core_params<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.apply_core_param(key, value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a `key = value;` parameter block.
    ///
    /// `#` starts a comment; lines holding `{` or `}` (block delimiters)
    /// are ignored.
    pub fn parse_core_params(text: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for raw in text.lines() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() || line.contains('{') || line.contains('}') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(DrcError::InvalidValue {
                    key: line.to_owned(),
                    value: String::new(),
                });
            };
            pairs.push((key.trim(), value.trim().trim_end_matches(';').trim()));
        }
        Self::from_core_params(pairs)
    }

    /// Apply one core parameter. Does not validate the result.
    pub fn apply_core_param(&mut self, key: &str, value: &str) -> Result<()> {
        let lower = key.to_ascii_lowercase();
        let Some(name) = lower.strip_prefix("drc_") else {
            return Ok(());
        };
        match name {
            "disabled" => self.disabled = parse_bool(key, value)?,
            "tcp_npart" => self.per_connection.npart = parse_num(key, value)?,
            "tcp_size" => self.per_connection.size = parse_num(key, value)?,
            "tcp_cachesz" => self.per_connection.cachesz = parse_num(key, value)?,
            "tcp_hiwat" => self.per_connection.hiwat = parse_num(key, value)?,
            "tcp_checksum" => self.per_connection.checksum = parse_bool(key, value)?,
            "tcp_recycle_npart" => self.recycle_npart = parse_num(key, value)?,
            "tcp_recycle_expire_s" => self.recycle_expire_secs = parse_num(key, value)?,
            "udp_npart" => self.shared.npart = parse_num(key, value)?,
            "udp_size" => self.shared.size = parse_num(key, value)?,
            "udp_cachesz" => self.shared.cachesz = parse_num(key, value)?,
            "udp_hiwat" => self.shared.hiwat = parse_num(key, value)?,
            "udp_checksum" => self.shared.checksum = parse_bool(key, value)?,
            _ => return Err(DrcError::UnknownKey(key.to_owned())),
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| DrcError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(DrcError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DrcConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.shared.size, 32_768);
        assert_eq!(config.per_connection.hiwat, 64);
        assert_eq!(config.recycle_expire(), Duration::from_secs(600));
        assert_eq!(config.params_for(DrcKind::Shared).npart, 7);
        assert_eq!(config.params_for(DrcKind::PerConnectionV4).npart, 1);
    }

    #[test]
    fn validate_rejects_bad_sizing() {
        let mut config = DrcConfig::default();
        config.per_connection.hiwat = 2048;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            DrcError::InvalidConfig {
                field: "per_connection.hiwat",
                ..
            }
        ));

        let mut config = DrcConfig::default();
        config.shared.npart = 0;
        assert!(config.validate().is_err());

        let mut config = DrcConfig::default();
        config.recycle_npart = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn core_params_are_case_insensitive() {
        let config = DrcConfig::from_core_params([
            ("drc_tcp_size", "256"),
            ("DRC_TCP_HIWAT", "32"),
            ("Drc_Udp_Checksum", "no"),
            ("DRC_TCP_Recycle_Expire_S", "30"),
            ("NFS_Port", "2049"),
        ])
        .expect("parse");
        assert_eq!(config.per_connection.size, 256);
        assert_eq!(config.per_connection.hiwat, 32);
        assert!(!config.shared.checksum);
        assert_eq!(config.recycle_expire_secs, 30);
    }

    #[test]
    fn core_params_reject_unknown_and_malformed() {
        let err = DrcConfig::from_core_params([("DRC_TCP_Bogus", "1")]).unwrap_err();
        assert_eq!(err, DrcError::UnknownKey("DRC_TCP_Bogus".into()));

        let err = DrcConfig::from_core_params([("DRC_UDP_Size", "huge")]).unwrap_err();
        assert!(matches!(err, DrcError::InvalidValue { .. }));

        let err = DrcConfig::from_core_params([("DRC_Disabled", "maybe")]).unwrap_err();
        assert!(matches!(err, DrcError::InvalidValue { .. }));
    }

    #[test]
    fn core_params_are_validated() {
        let err = DrcConfig::from_core_params([("DRC_UDP_Hiwat", "99999")]).unwrap_err();
        assert!(matches!(err, DrcError::InvalidConfig { .. }));
    }

    #[test]
    fn parses_parameter_block() {
        let text = "\
NFS_Core_Param {
    # duplicate request cache
    DRC_Disabled = false;
    DRC_TCP_Npart = 3;
    DRC_UDP_Cachesz = 0;   # no slots
    Nb_Worker = 16;
}
";
        let config = DrcConfig::parse_core_params(text).expect("parse");
        assert!(!config.disabled);
        assert_eq!(config.per_connection.npart, 3);
        assert_eq!(config.shared.cachesz, 0);
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config: DrcConfig =
            serde_json::from_str(r#"{"disabled": true, "recycle_expire_secs": 5}"#)
                .expect("deserialize");
        assert!(config.disabled);
        assert_eq!(config.recycle_expire_secs, 5);
        assert_eq!(config.shared, CacheParams::shared_defaults());
    }
}
