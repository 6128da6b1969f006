use std::{fmt, str::FromStr, time::Duration};

/// Describes a quota enforced by the limiter.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LimitDescriptor {
    pub name: String,
    pub unit: Unit,
    pub requests_per_unit: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Unit {
    /// A plain counter of in-use items.
    Count,
    PerSecond,
    PerMinute,
    PerHour,
    PerDay,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidLimit {
    #[error("limit must have the form name=unit:value: {0:?}")]
    Syntax(String),

    #[error("unknown limit unit: {0:?}")]
    Unit(String),

    #[error("invalid limit value: {0:?}")]
    Value(String),
}

// === impl Unit ===

impl Unit {
    /// The sliding window of a rate unit, or `None` for counters.
    pub fn window(&self) -> Option<Duration> {
        match self {
            Self::Count => None,
            Self::PerSecond => Some(Duration::from_secs(1)),
            Self::PerMinute => Some(Duration::from_secs(60)),
            Self::PerHour => Some(Duration::from_secs(60 * 60)),
            Self::PerDay => Some(Duration::from_secs(24 * 60 * 60)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::PerSecond => "per-second",
            Self::PerMinute => "per-minute",
            Self::PerHour => "per-hour",
            Self::PerDay => "per-day",
        }
    }
}

impl FromStr for Unit {
    type Err = InvalidLimit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "count" => Ok(Self::Count),
            "per-second" | "persecond" | "second" => Ok(Self::PerSecond),
            "per-minute" | "perminute" | "minute" => Ok(Self::PerMinute),
            "per-hour" | "perhour" | "hour" => Ok(Self::PerHour),
            "per-day" | "perday" | "day" => Ok(Self::PerDay),
            _ => Err(InvalidLimit::Unit(s.to_string())),
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl LimitDescriptor ===

impl LimitDescriptor {
    pub fn count(name: impl Into<String>, limit: u64) -> Self {
        Self {
            name: name.into(),
            unit: Unit::Count,
            requests_per_unit: limit,
        }
    }

    pub fn rate(name: impl Into<String>, unit: Unit, limit: u64) -> Self {
        Self {
            name: name.into(),
            unit,
            requests_per_unit: limit,
        }
    }
}

/// Parses `name=unit:value`, e.g. `rollouts=count:5` or `secrets=per-minute:30`.
impl FromStr for LimitDescriptor {
    type Err = InvalidLimit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .trim()
            .split_once('=')
            .ok_or_else(|| InvalidLimit::Syntax(s.to_string()))?;
        let (unit, value) = rest
            .split_once(':')
            .ok_or_else(|| InvalidLimit::Syntax(s.to_string()))?;
        if name.is_empty() {
            return Err(InvalidLimit::Syntax(s.to_string()));
        }
        let requests_per_unit = value
            .parse()
            .map_err(|_| InvalidLimit::Value(value.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            unit: unit.parse()?,
            requests_per_unit,
        })
    }
}

impl fmt::Display for LimitDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.name, self.unit, self.requests_per_unit)
    }
}
