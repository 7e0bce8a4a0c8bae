//! Request/response boundary to a vendor acquisition driver.
//!
//! The device code only speaks in [`ParamId`]s and [`ParamValue`]s. Whatever
//! binds the vendor library implements [`DriverApi`] and owns every
//! vendor-specific memory layout.

use std::fmt;

/// Parameter identifiers understood by the driver, with their vendor numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ParamId {
    ChannelCount = 1,
    ChannelName = 128,
    ChannelEnable = 129,
    ChannelLabel = 132,
    ChannelTransducer = 133,
    ChannelProfile = 134,
    RangeMax = 135,
    RangeMin = 136,
    SampleRate = 137,
}

impl ParamId {
    pub fn id(self) -> i16 {
        self as i16
    }
}

/// Tagged parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i32),
    Bool(bool),
    Float(f32),
    Text(String),
}

impl ParamValue {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DriverError {
    /// Negative status returned by the driver.
    #[error("Driver call failed with status {0}")]
    Status(i32),

    #[error("Parameter {param:?} returned an unexpected value type")]
    UnexpectedType { param: ParamId },

    /// Measurement could not start although the device answered.
    #[error("Measurement refused with status {0}")]
    Refused(i32),

    #[error("Device not reachable")]
    NotConnected,
}

/// Operations a vendor driver exposes.
pub trait DriverApi: Send {
    /// Open a device context for `model`.
    fn open(&mut self, model: &str) -> Result<(), DriverError>;

    fn channel_count(&mut self) -> Result<usize, DriverError>;

    fn get_param(&mut self, param: ParamId, channel: usize) -> Result<ParamValue, DriverError>;

    fn set_param(
        &mut self,
        param: ParamId,
        channel: usize,
        value: ParamValue,
    ) -> Result<(), DriverError>;

    /// Set a parameter from its textual form, e.g. a channel profile name.
    fn set_param_text(&mut self, param: ParamId, channel: usize, text: &str)
        -> Result<(), DriverError>;

    /// Latest measured sample of a channel.
    fn read_sample(&mut self, channel: usize) -> Result<f64, DriverError>;

    fn start_measurement(&mut self) -> Result<(), DriverError>;

    fn stop_measurement(&mut self) -> Result<(), DriverError>;

    fn close(&mut self);
}

/// Produces a driver instance when a device initializes.
pub trait DriverLoader: Send + Sync {
    /// Name of the library being loaded, for error reporting.
    fn library(&self) -> &str;

    fn load(&self) -> Option<Box<dyn DriverApi>>;
}

/// Loader for hosts where no vendor library is installed.
#[derive(Debug, Clone)]
pub struct NoDriver {
    library: String,
}

impl NoDriver {
    pub fn new(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
        }
    }
}

impl DriverLoader for NoDriver {
    fn library(&self) -> &str {
        &self.library
    }

    fn load(&self) -> Option<Box<dyn DriverApi>> {
        None
    }
}
