use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Transport used between a host and a spawned plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "unix")]
    UnixSocket,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Tcp => "tcp",
            ConnectionType::UnixSocket => "unix",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(ConnectionType::Tcp),
            "unix" => Ok(ConnectionType::UnixSocket),
            other => Err(WireError::UnsupportedConnectionType(other.to_string())),
        }
    }
}

/// Configuration handed to a plugin process through `--config <json>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub id: String,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_string::option"
    )]
    pub idle_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_types: Vec<ConfigEntry>,
}

/// One opaque configuration blob, tagged by the type name that understands it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ConfigEntry {
    pub fn new(type_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            data: data.into(),
        }
    }
}

impl Config {
    pub fn new(id: impl Into<String>, connection_type: ConnectionType) -> Self {
        Self {
            id: id.into(),
            connection_type,
            idle_timeout: None,
            config_types: Vec::new(),
        }
    }

    /// Rejects configurations a plugin could not safely start with.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            bail!("plugin config has no id");
        }
        if self.id.contains(['/', '\\']) || self.id == "." || self.id == ".." {
            bail!("plugin id `{}` must not contain path separators", self.id);
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            bail!("idle timeout for plugin `{}` must be greater than zero", self.id);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Returns the entry for a config type, if the host sent one.
    pub fn entry(&self, type_name: &str) -> Option<&ConfigEntry> {
        self.config_types
            .iter()
            .find(|entry| entry.type_name == type_name)
    }
}

/// Provider variant declared for a capability type, with its advisory schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "jsonSchema", default, with = "base64_bytes")]
    pub json_schema: Vec<u8>,
}

/// Document a plugin prints when invoked with the `capabilities` argument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub types: BTreeMap<String, Vec<TypeInfo>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_types: Vec<String>,
}

impl Capabilities {
    pub fn with_type(mut self, capability: impl Into<String>, info: TypeInfo) -> Self {
        self.types.entry(capability.into()).or_default().push(info);
        self
    }

    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

/// A discovered plugin executable and everything the host knows about it.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub id: String,
    pub path: PathBuf,
    pub config: Config,
    pub types: BTreeMap<String, Vec<TypeInfo>>,
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(encoded) => STANDARD.decode(encoded).map_err(D::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Compact duration strings such as `1h`, `1m30s` or `250ms`.
pub mod duration_string {
    use std::time::Duration;

    const UNITS: [(&str, u128); 6] = [
        ("h", 3_600_000_000_000),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("us", 1_000),
        ("ns", 1),
    ];

    pub fn format(duration: Duration) -> String {
        let mut remaining = duration.as_nanos();
        if remaining == 0 {
            return "0s".to_string();
        }
        let mut out = String::new();
        for (unit, nanos) in UNITS {
            let count = remaining / nanos;
            if count > 0 {
                out.push_str(&count.to_string());
                out.push_str(unit);
                remaining %= nanos;
            }
        }
        out
    }

    pub fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty duration".to_string());
        }
        let mut total: u128 = 0;
        let mut rest = raw;
        while !rest.is_empty() {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                return Err(format!("invalid duration `{raw}`: expected a number"));
            }
            let value: u128 = rest[..digits]
                .parse()
                .map_err(|err| format!("invalid duration `{raw}`: {err}"))?;
            rest = &rest[digits..];
            let unit_len = rest.bytes().take_while(|b| b.is_ascii_alphabetic()).count();
            let unit = &rest[..unit_len];
            let nanos = UNITS
                .iter()
                .find(|(name, _)| *name == unit)
                .map(|(_, nanos)| *nanos)
                .ok_or_else(|| format!("invalid duration `{raw}`: unknown unit `{unit}`"))?;
            total = value
                .checked_mul(nanos)
                .and_then(|n| total.checked_add(n))
                .ok_or_else(|| format!("duration `{raw}` overflows"))?;
            rest = &rest[unit_len..];
        }
        let secs = u64::try_from(total / 1_000_000_000)
            .map_err(|_| format!("duration `{raw}` overflows"))?;
        Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
    }

    pub mod option {
        use std::time::Duration;

        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_str(&super::format(*duration)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::parse(&raw).map_err(D::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_with_all_fields() {
        let config = Config {
            id: "simple-processor".into(),
            connection_type: ConnectionType::UnixSocket,
            idle_timeout: Some(Duration::from_millis(90_250)),
            config_types: vec![ConfigEntry::new("credentials", b"secret".to_vec())],
        };
        let json = config.to_json().unwrap();
        assert!(json.contains(r#""idleTimeout":"1m30s250ms""#));
        assert!(json.contains(r#""data":"c2VjcmV0""#));
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }

    #[test]
    fn config_round_trips_without_optional_fields() {
        let config = Config::new("bare", ConnectionType::Tcp);
        let json = config.to_json().unwrap();
        assert_eq!(json, r#"{"id":"bare","type":"tcp"}"#);
        assert_eq!(Config::from_json(&json).unwrap(), config);
    }

    #[test]
    fn unknown_connection_type_is_rejected() {
        assert!(Config::from_json(r#"{"id":"x","type":"pipe"}"#).is_err());
        assert!(matches!(
            "pipe".parse::<ConnectionType>(),
            Err(WireError::UnsupportedConnectionType(name)) if name == "pipe"
        ));
    }

    #[test]
    fn duration_strings_parse_compound_units() {
        assert_eq!(duration_string::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(duration_string::parse("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(duration_string::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(duration_string::format(Duration::ZERO), "0s");
        assert!(duration_string::parse("10 minutes").is_err());
        assert!(duration_string::parse("5").is_err());
    }

    #[test]
    fn validate_rejects_path_like_ids() {
        assert!(Config::new("../evil", ConnectionType::Tcp).validate().is_err());
        assert!(Config::new("", ConnectionType::Tcp).validate().is_err());
        assert!(Config::new("ok-plugin", ConnectionType::Tcp).validate().is_ok());
    }

    #[test]
    fn capabilities_document_uses_wire_names() {
        let doc = r#"{"types":{"dataProcessor":[{"type":"simple-text-processor","jsonSchema":"e30="}]},"configTypes":["credentials"]}"#;
        let caps: Capabilities = serde_json::from_str(doc).unwrap();
        assert_eq!(caps.capability_names().collect::<Vec<_>>(), vec!["dataProcessor"]);
        assert_eq!(caps.types["dataProcessor"][0].json_schema, b"{}".to_vec());
        assert_eq!(caps.config_types, vec!["credentials".to_string()]);
    }
}
