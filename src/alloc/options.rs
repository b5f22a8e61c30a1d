//! Runtime configuration.
//!
//! Options come from code (`Options { .. }`), from serde, or from a string of
//! `Key=Value` pairs separated by `:` or whitespace, usually found in the
//! `GUARDPOOL_OPTIONS` environment variable:
//!
//! ```plaintext
//! GUARDPOOL_OPTIONS="SampleRate=1000:MaxSimultaneousAllocations=64:ForcedModules=libfoo.so,libbar.so"
//! ```

use std::{env, fmt};

use serde::{Deserialize, Serialize};

use crate::alloc::{meta::BacktraceFn, sampling::MAX_SAMPLE_RATE};

/// Environment variable read by [`Options::from_env()`]
pub const OPTIONS_ENV: &str = "GUARDPOOL_OPTIONS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Options {
    /// Master switch. A disabled allocator samples nothing.
    pub enabled: bool,
    /// One in how many allocations (on average, per thread) is sampled
    pub sample_rate: i32,
    /// Number of slots, and so the most sampled allocations alive at once
    pub max_simultaneous_allocations: i32,
    /// Allocations smaller than this are never sampled
    pub min_sample_size: u32,
    /// Take the allocator's locks around `fork()`
    pub install_fork_handlers: bool,
    /// Allocations made from these modules are always sampled
    #[serde(rename = "ForcedModules")]
    pub forced_module_paths: Vec<String>,
    /// Used to record allocation and deallocation stacks, and to find out
    /// which module an allocation comes from
    #[serde(skip)]
    pub backtrace: Option<BacktraceFn>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate: 5000,
            max_simultaneous_allocations: 16,
            min_sample_size: 0,
            install_fork_handlers: true,
            forced_module_paths: Vec::new(),
            backtrace: None,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    /// A pair without `=`
    MissingValue(String),
    UnknownKey(String),
    InvalidValue { key: String, value: String },
    SampleRateNegative(i32),
    SampleRateTooLarge(i32),
    MaxSimultaneousAllocationsNegative(i32),
}

impl fmt::Display for OptionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionsError::MissingValue(pair) => write!(f, "expected `Key=Value`, got `{pair}`"),
            OptionsError::UnknownKey(key) => write!(f, "unknown option `{key}`"),
            OptionsError::InvalidValue { key, value } => {
                write!(f, "invalid value `{value}` for option `{key}`")
            }
            OptionsError::SampleRateNegative(n) => write!(f, "SampleRate is < 0 ({n})"),
            OptionsError::SampleRateTooLarge(n) => write!(f, "SampleRate is >= 2^30 ({n})"),
            OptionsError::MaxSimultaneousAllocationsNegative(n) => {
                write!(f, "MaxSimultaneousAllocations is < 0 ({n})")
            }
        }
    }
}

impl std::error::Error for OptionsError {}

fn parse_bool(key: &str, value: &str) -> Result<bool, OptionsError> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(OptionsError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, OptionsError> {
    value.parse().map_err(|_| OptionsError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

impl Options {
    /// Options with sampling switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Apply every `Key=Value` pair in `s` on top of `self`
    pub fn apply(&mut self, s: &str) -> Result<(), OptionsError> {
        for pair in s.split(|c: char| c == ':' || c.is_whitespace()) {
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(OptionsError::MissingValue(pair.to_owned()));
            };
            match key {
                "Enabled" => self.enabled = parse_bool(key, value)?,
                "SampleRate" => self.sample_rate = parse_num(key, value)?,
                "MaxSimultaneousAllocations" => {
                    self.max_simultaneous_allocations = parse_num(key, value)?
                }
                "MinSampleSize" => self.min_sample_size = parse_num(key, value)?,
                "InstallForkHandlers" => self.install_fork_handlers = parse_bool(key, value)?,
                "ForcedModules" => {
                    self.forced_module_paths = value
                        .split(',')
                        .filter(|p| !p.is_empty())
                        .map(str::to_owned)
                        .collect()
                }
                _ => return Err(OptionsError::UnknownKey(key.to_owned())),
            }
        }
        Ok(())
    }

    /// Defaults, overridden by `s`
    pub fn parse(s: &str) -> Result<Self, OptionsError> {
        let mut options = Self::default();
        options.apply(s)?;
        Ok(options)
    }

    /// Defaults, overridden by [`OPTIONS_ENV`] if it is set
    pub fn from_env() -> Result<Self, OptionsError> {
        match env::var(OPTIONS_ENV) {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.sample_rate < 0 {
            return Err(OptionsError::SampleRateNegative(self.sample_rate));
        }
        if self.sample_rate as u32 >= MAX_SAMPLE_RATE {
            return Err(OptionsError::SampleRateTooLarge(self.sample_rate));
        }
        if self.max_simultaneous_allocations < 0 {
            return Err(OptionsError::MaxSimultaneousAllocationsNegative(
                self.max_simultaneous_allocations,
            ));
        }
        Ok(())
    }

    /// Would an allocator built from these options ever sample anything?
    pub fn is_active(&self) -> bool {
        self.enabled && self.sample_rate != 0 && self.max_simultaneous_allocations != 0
    }
}
