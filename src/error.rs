use crate::device::DeviceState;

/// Every failure a device, its configuration or its links can report.
///
/// Initialization errors are returned to the caller and keep the device out of
/// the active set. Read failures never surface directly: they are absorbed by the
/// device fault counter and only appear as [`DeviceError::DeviceIsDisconnected`]
/// once the disconnect threshold is crossed.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Driver library {driver} could not be loaded")]
    LibraryNotLoaded { driver: String },

    #[error("Device context for {model} could not be opened")]
    DeviceNotOpen { model: String },

    #[error("Number of device channels could not be read")]
    DeviceChannelsNotGet,

    #[error("Channel {channel} could not be enabled")]
    DeviceChannelNotRun { channel: usize },

    #[error("Profile {profile} could not be set on channel {channel}")]
    DeviceProfileNotSet { channel: usize, profile: String },

    #[error("Cannot connect to the device")]
    DeviceNotConnected,

    #[error("Measurement cannot be started")]
    DeviceMeasurementCannotStart,

    #[error("Signal could not be read: {field} on channel {channel}")]
    DeviceMeasurementReadError { channel: usize, field: &'static str },

    #[error("Device is disconnected after {failures} failed reads")]
    DeviceIsDisconnected { failures: u32 },

    #[error("Pipe {name} is not connected")]
    PipeNotConnected { name: String },

    #[error("Socket on port {port} is not connected: {source}")]
    SocketNotConnected {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("No retrieve data mode selected")]
    RetrieveDataModeNotSelected,

    #[error("No send data mode selected")]
    SendDataModeNotSelected,

    #[error("Signal {signal} is already chosen on channel {chosen_at}")]
    SignalIsChosen {
        signal: String,
        chosen_at: usize,
        /// Signal that stays bound to the requested channel.
        occupant: Option<String>,
    },

    #[error("Application {application} is disconnected")]
    ApplicationIsDisconnected { application: String },

    #[error("Signal {signal} is not available on this device")]
    UnknownSignal { signal: String },

    #[error("Channel {index} out of range (device has {channels} channels)")]
    ChannelOutOfRange { index: usize, channels: usize },

    #[error("Invalid range: min {min} is greater than max {max}")]
    InvalidRange { min: f64, max: f64 },

    #[error("Invalid frequency {frequency} Hz")]
    InvalidFrequency { frequency: f64 },

    #[error("Cannot go from {from:?} to {to:?}")]
    InvalidTransition { from: DeviceState, to: DeviceState },

    #[error("No device with code {code}")]
    UnknownDevice { code: String },
}

impl DeviceError {
    /// Stable name of the error kind, independent of the message parameters.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LibraryNotLoaded { .. } => "LibraryNotLoaded",
            Self::DeviceNotOpen { .. } => "DeviceNotOpen",
            Self::DeviceChannelsNotGet => "DeviceChannelsNotGet",
            Self::DeviceChannelNotRun { .. } => "DeviceChannelNotRun",
            Self::DeviceProfileNotSet { .. } => "DeviceProfileNotSet",
            Self::DeviceNotConnected => "DeviceNotConnected",
            Self::DeviceMeasurementCannotStart => "DeviceMeasurementCannotStart",
            Self::DeviceMeasurementReadError { .. } => "DeviceMeasurementReadError",
            Self::DeviceIsDisconnected { .. } => "DeviceIsDisconnected",
            Self::PipeNotConnected { .. } => "PipeNotConnected",
            Self::SocketNotConnected { .. } => "SocketNotConnected",
            Self::RetrieveDataModeNotSelected => "RetrieveDataModeNotSelected",
            Self::SendDataModeNotSelected => "SendDataModeNotSelected",
            Self::SignalIsChosen { .. } => "SignalIsChosen",
            Self::ApplicationIsDisconnected { .. } => "ApplicationIsDisconnected",
            Self::UnknownSignal { .. } => "UnknownSignal",
            Self::ChannelOutOfRange { .. } => "ChannelOutOfRange",
            Self::InvalidRange { .. } => "InvalidRange",
            Self::InvalidFrequency { .. } => "InvalidFrequency",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::UnknownDevice { .. } => "UnknownDevice",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_ignores_parameters() {
        let err = DeviceError::SignalIsChosen {
            signal: "EKG".to_string(),
            chosen_at: 2,
            occupant: None,
        };
        assert_eq!(err.code(), "SignalIsChosen");
        assert_eq!(err.to_string(), "Signal EKG is already chosen on channel 2");
    }
}
