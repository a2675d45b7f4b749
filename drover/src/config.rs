//! Workload configuration.
//!
//! A workload is described by a TOML document. Keys use PascalCase:
//!
//! ```toml
//! Timeout = "10 minutes"
//!
//! [[Actors]]
//! Type = "HelloWorld"
//! Threads = 3
//!
//! [[Actors.Phases]]
//! Repeat = 10
//! Message = "first phase"
//!
//! [[Actors.Phases]]
//! Duration = "5 seconds"
//! GlobalRate = "100 per 1 second"
//! ```
//!
//! Keys the framework does not understand are kept as free-form parameters and
//! handed to the actor, either at actor level ([`ActorConfig::params`]) or per
//! phase ([`PhaseEntry::params`]).

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Deserializer};

use crate::{error::ConfigError, phase::PhaseNumber};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkloadConfig {
    /// Stop the run after this long, letting actors finish their current iteration.
    #[serde(default, deserialize_with = "opt_duration")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub actors: Vec<ActorConfig>,
}

impl WorkloadConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.actors.is_empty() {
            return Err(ConfigError::NoActors);
        }
        for actor in &self.actors {
            if actor.threads == 0 {
                return Err(ConfigError::NoThreads {
                    actor: actor.display_name().to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActorConfig {
    /// Key into the [`crate::Cast`].
    #[serde(rename = "Type")]
    pub actor_type: String,
    /// Defaults to the actor kind's `DEFAULT_NAME`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "one")]
    pub threads: usize,
    #[serde(default)]
    pub phases: Vec<PhaseEntry>,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl ActorConfig {
    fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.actor_type)
    }
}

fn one() -> usize {
    1
}

/// One entry of an actor's `Phases` list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhaseEntry {
    /// Which phase(s) this entry describes. Defaults to the entry's position.
    #[serde(default)]
    pub phase: Option<PhaseSelector>,
    #[serde(default)]
    pub repeat: Option<u64>,
    #[serde(default, deserialize_with = "opt_duration")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub until_signaled: bool,
    /// `"None"` makes the phase non-blocking.
    #[serde(default)]
    pub blocking: Option<String>,
    #[serde(default)]
    pub nop: bool,
    #[serde(default, deserialize_with = "opt_duration")]
    pub sleep_before: Option<Duration>,
    #[serde(default, deserialize_with = "opt_duration")]
    pub sleep_after: Option<Duration>,
    #[serde(default, deserialize_with = "opt_rate")]
    pub global_rate: Option<RateSpec>,
    #[serde(flatten)]
    pub params: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PhaseSelector {
    Number(PhaseNumber),
    /// Inclusive range such as `"0..3"`.
    Range(String),
}

impl PhaseSelector {
    pub fn phases(&self) -> Result<Vec<PhaseNumber>, String> {
        match self {
            Self::Number(n) => Ok(vec![*n]),
            Self::Range(range) => {
                let (lo, hi) = range
                    .split_once("..")
                    .ok_or_else(|| format!("invalid phase range `{range}`"))?;
                let lo: PhaseNumber = lo
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid phase range `{range}`"))?;
                let hi: PhaseNumber = hi
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid phase range `{range}`"))?;
                if hi < lo {
                    return Err(format!("empty phase range `{range}`"));
                }
                Ok((lo..=hi).collect())
            }
        }
    }
}

/// `count` operations per `interval`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSpec {
    pub count: u64,
    pub interval: Duration,
}

impl RateSpec {
    /// Parses `"<count> per <duration>"`, e.g. `"500 per 1 second"`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidRate(input.to_string());
        let (count, interval) = input.split_once(" per ").ok_or_else(invalid)?;
        let count: u64 = count.trim().parse().map_err(|_| invalid())?;
        let interval = parse_duration(interval).map_err(|_| invalid())?;
        if count == 0 || interval.is_zero() {
            return Err(invalid());
        }
        Ok(Self { count, interval })
    }

    pub fn per_second(&self) -> f64 {
        self.count as f64 / self.interval.as_secs_f64()
    }
}

/// Parses `"<n> <unit>"` or `"<n><unit>"`, e.g. `"5 seconds"`, `"250ms"`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (amount, unit) = trimmed.split_at(split);
    let amount: u64 = amount.parse().map_err(|_| invalid())?;

    let duration = match unit.trim() {
        "ns" | "nanosecond" | "nanoseconds" => Duration::from_nanos(amount),
        "us" | "microsecond" | "microseconds" => Duration::from_micros(amount),
        "ms" | "millisecond" | "milliseconds" => Duration::from_millis(amount),
        "s" | "second" | "seconds" => Duration::from_secs(amount),
        "m" | "minute" | "minutes" => Duration::from_secs(amount.saturating_mul(60)),
        "h" | "hour" | "hours" => Duration::from_secs(amount.saturating_mul(3600)),
        _ => return Err(invalid()),
    };
    Ok(duration)
}

fn opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

fn opt_rate<'de, D>(deserializer: D) -> Result<Option<RateSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| RateSpec::parse(&s).map_err(serde::de::Error::custom))
        .transpose()
}
