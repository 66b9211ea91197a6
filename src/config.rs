//! Process configuration.
//!
//! Defaults work out of the box. Deployment-specific values come from the
//! environment:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `GANTRY_ADDR` | listen address | `0.0.0.0:3000` |
//! | `GANTRY_REQUEST_TIMEOUT_MS` | per-request deadline, `0` = none | none |
//! | `GANTRY_CORS_ORIGINS` | comma-separated origins, or `*` | CORS off |
//! | `GANTRY_LOG` | `tracing` filter directive (`RUST_LOG` wins) | `info` |
//! | `GANTRY_LOG_FORMAT` | `json` or `pretty` | `pretty` |

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

const ENV_PREFIX: &str = "GANTRY_";

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line, for log shippers.
    Json,
    /// Human-readable, for local development.
    #[default]
    Pretty,
}

impl LogFormat {
    /// Case-insensitive.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" => Some(Self::Pretty),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Pretty => "pretty",
        }
    }
}

impl Serialize for LogFormat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .ok_or_else(|| de::Error::custom(format!("unknown log format `{raw}`, expected json or pretty")))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub addr: SocketAddr,
    /// Read from `request_timeout_ms`; `0` disables the deadline.
    #[serde(rename = "request_timeout_ms", with = "timeout_ms")]
    pub request_timeout: Option<Duration>,
    #[serde(deserialize_with = "origins")]
    pub cors_origins: Vec<String>,
    #[serde(rename = "log")]
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            request_timeout: None,
            cors_origins: Vec::new(),
            log_level: "info".to_owned(),
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by `GANTRY_*` environment variables.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the key that failed to parse.
    pub fn from_env() -> Result<Self, Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(|e| Error::Config(format!("environment: {e}")))
    }
}

mod timeout_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(timeout: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = timeout.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let ms = u64::deserialize(deserializer)?;
        Ok((ms > 0).then(|| Duration::from_millis(ms)))
    }
}

/// A list of origins, or one comma-separated string as environment variables
/// deliver them. Blank entries are dropped.
fn origins<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    struct Origins;

    impl<'de> Visitor<'de> for Origins {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a list of origins or a comma-separated string")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            Ok(v.split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_owned)
                .collect())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::new();
            while let Some(origin) = seq.next_element::<String>()? {
                let origin = origin.trim();
                if !origin.is_empty() {
                    out.push(origin.to_owned());
                }
            }
            Ok(out)
        }
    }

    deserializer.deserialize_any(Origins)
}

#[cfg(test)]
mod tests {
    use super::*;

    use figment::Jail;

    #[test]
    fn defaults_without_environment() {
        Jail::expect_with(|_jail| {
            let config = Config::from_env().map_err(|e| e.to_string())?;
            assert_eq!(config.addr.port(), 3000);
            assert_eq!(config.request_timeout, None);
            assert!(config.cors_origins.is_empty());
            assert_eq!(config.log_level, "info");
            assert_eq!(config.log_format, LogFormat::Pretty);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides() {
        Jail::expect_with(|jail| {
            jail.set_env("GANTRY_ADDR", "127.0.0.1:8080");
            jail.set_env("GANTRY_REQUEST_TIMEOUT_MS", "2500");
            jail.set_env("GANTRY_CORS_ORIGINS", "https://a.test, https://b.test,");
            jail.set_env("GANTRY_LOG", "gantry=debug");
            jail.set_env("GANTRY_LOG_FORMAT", "JSON");

            let config = Config::from_env().map_err(|e| e.to_string())?;
            assert_eq!(config.addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
            assert_eq!(config.request_timeout, Some(Duration::from_millis(2500)));
            assert_eq!(config.cors_origins, ["https://a.test", "https://b.test"]);
            assert_eq!(config.log_level, "gantry=debug");
            assert_eq!(config.log_format, LogFormat::Json);
            Ok(())
        });
    }

    #[test]
    fn zero_timeout_means_none() {
        Jail::expect_with(|jail| {
            jail.set_env("GANTRY_REQUEST_TIMEOUT_MS", "0");
            let config = Config::from_env().map_err(|e| e.to_string())?;
            assert_eq!(config.request_timeout, None);
            Ok(())
        });
    }

    #[test]
    fn bad_values_name_the_key() {
        Jail::expect_with(|jail| {
            jail.set_env("GANTRY_ADDR", "nowhere");
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().to_ascii_lowercase().contains("addr"), "{err}");
            Ok(())
        });

        Jail::expect_with(|jail| {
            jail.set_env("GANTRY_LOG_FORMAT", "xml");
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().contains("xml"), "{err}");
            Ok(())
        });
    }
}
