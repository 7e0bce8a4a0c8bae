use serde::{Deserialize, Serialize};

pub const DEFAULT_RANGE_MIN: f64 = 50.0;
pub const DEFAULT_RANGE_MAX: f64 = 80.0;

/// What a channel measures. Each function carries a fixed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelFunction {
    #[default]
    Voltage,
    Conduction,
    Temperature,
    Resistance,
}

impl ChannelFunction {
    pub fn unit(&self) -> &'static str {
        match self {
            Self::Voltage => "V",
            Self::Conduction => "S",
            Self::Temperature => "\u{00b0}C",
            Self::Resistance => "\u{03a9}",
        }
    }
}

/// Where a value sits relative to its channel's `[min, max]` thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeState {
    Low,
    Normal,
    High,
}

impl RangeState {
    /// Interpretation code used in observation records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Low => "L",
            Self::Normal => "N",
            Self::High => "H",
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            Self::Low => "Below normal",
            Self::Normal => "Normal",
            Self::High => "Above normal",
        }
    }
}

/// Operator thresholds of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Default for Range {
    fn default() -> Self {
        Self {
            min: DEFAULT_RANGE_MIN,
            max: DEFAULT_RANGE_MAX,
        }
    }
}

impl Range {
    /// Both bounds are Normal.
    pub fn classify(&self, value: f64) -> RangeState {
        if value < self.min {
            RangeState::Low
        } else if value > self.max {
            RangeState::High
        } else {
            RangeState::Normal
        }
    }
}

/// Channel description as reported by a vendor driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    pub min: f64,
    pub max: f64,
    pub sample_rate: f64,
    pub label: String,
    pub sensor: String,
}

/// A fixed-index slot on a device to which at most one signal is bound.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub(crate) index: usize,
    pub(crate) enabled: bool,
    pub(crate) signal: Option<String>,
    pub(crate) function: ChannelFunction,
    pub(crate) range: Range,
    pub(crate) info: Option<ChannelInfo>,
}

impl Channel {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            enabled: true,
            signal: None,
            function: ChannelFunction::default(),
            range: Range::default(),
            info: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn signal(&self) -> Option<&str> {
        self.signal.as_deref()
    }

    pub fn function(&self) -> ChannelFunction {
        self.function
    }

    pub fn unit(&self) -> &'static str {
        self.function.unit()
    }

    pub fn range(&self) -> Range {
        self.range
    }

    pub fn info(&self) -> Option<&ChannelInfo> {
        self.info.as_ref()
    }
}
