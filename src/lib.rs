//! # Biosignal Relay
//!
//! Acquire biosensor samples, classify them against per-channel thresholds
//! and relay the latest readings to a consumer application as standardized
//! observation batches.
//!
//! ## Features
//!
//! - **Device discovery**: attached USB devices are matched by description using `serialport`
//! - **Two retrieval strategies**: a vendor driver behind [`DriverApi`], or UDP datagrams
//! - **Device simulator**: synthetic EKG, BVP, HRV and GSR waveforms for bench work
//! - **Range classification**: every reading is tagged Low, Normal or High
//! - **Two send strategies**: a local named pipe or a UDP datagram per batch
//! - **History export**: signal histories as `polars` DataFrames or CSV
//! - **Layered configuration**: defaults, TOML file and `BIOSIGNAL_` environment variables
//!
//! ## Examples
//!
//! ### Decoding a Retrieve Record
//!
//! ```rust
//! use biosignal_relay::codec;
//!
//! let frame = codec::decode("1700000000000@EKG=72.5#0;GSR=3.2#1;")?;
//! assert_eq!(frame.entries.len(), 2);
//! assert_eq!(frame.entries[1].signal, "GSR");
//! assert_eq!(codec::encode(&frame), "1700000000000@EKG=72.5#0;GSR=3.2#1;");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Range Classification
//!
//! ```rust
//! use biosignal_relay::{Range, RangeState};
//!
//! let range = Range { min: 50.0, max: 80.0 };
//! assert_eq!(range.classify(49.9), RangeState::Low);
//! assert_eq!(range.classify(80.0), RangeState::Normal);
//! assert_eq!(range.classify(80.1), RangeState::High);
//! ```
//!
//! ### Driving a Device by Hand
//!
//! ```rust,no_run
//! use biosignal_relay::{Device, FhirFormatter, RetrieveMode, SendMode};
//!
//! let mut device = Device::simulator();
//! device.initialize()?;
//! device.add_signal_chosen("EKG", 0)?;
//! device.set_retrieve_mode(RetrieveMode::Driver)?;
//! device.set_send_mode(SendMode::Network)?;
//! device.start()?;
//!
//! loop {
//!     device.retrieve()?;
//!     if device.convert() > 0 {
//!         if let Some(batch) = device.standardize(&FhirFormatter::new()) {
//!             device.send(&batch)?;
//!         }
//!     }
//!     device.check_device_state()?;
//!     std::thread::sleep(std::time::Duration::from_millis(25));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Running the Monitor
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use biosignal_relay::{
//!     DeviceRegistry, Monitor, MonitorConfig, NoDriver, Reply, Request, SerialPortDiscovery,
//!     SystemProbe,
//! };
//!
//! let config = MonitorConfig::load(Some("relay.toml".as_ref()))?;
//! let registry = DeviceRegistry::with_defaults(Arc::new(NoDriver::new("NeurobitDrv64")));
//! let (monitor, events) = Monitor::new(
//!     config,
//!     registry,
//!     Box::new(SerialPortDiscovery),
//!     Box::new(SystemProbe::new()),
//! );
//!
//! let handle = monitor.spawn()?;
//! if let Reply::Devices(devices) = handle.request(Request::ListDevices)? {
//!     println!("{} devices", devices.len());
//! }
//! for event in events.iter().take(100) {
//!     println!("{event:?}");
//! }
//! handle.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod catalog;
pub mod channel;
pub mod codec;
pub mod config;
pub mod device;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod generator;
pub mod liveness;
pub mod monitor;
pub mod neurobit;
pub mod observation;
pub mod signal;
pub mod simulator;
pub mod transport;

// Re-export the main types for convenience
pub use catalog::SignalCatalog;
pub use channel::{Channel, ChannelFunction, ChannelInfo, Range, RangeState};
pub use codec::{DecodeError, FrameEntry, RetrieveFrame};
pub use config::{ChannelConfig, ConfigError, DeviceConfig, MonitorConfig};
pub use device::{Backend, Device, DeviceState, FaultCounter, RetrieveMode, SendMode};
pub use discovery::{
    AttachedDevice, DeviceDiscovery, DeviceRegistry, DiscoveryError, NoDiscovery,
    SerialPortDiscovery,
};
pub use driver::{DriverApi, DriverError, DriverLoader, NoDriver, ParamId, ParamValue};
pub use error::DeviceError;
pub use liveness::{ProcessProbe, SystemProbe};
pub use monitor::{
    DeviceSummary, Monitor, MonitorError, MonitorEvent, MonitorHandle, Reply, Request,
};
pub use neurobit::NeurobitOptima;
pub use observation::{FhirFormatter, Observation, ObservationFormatter};
pub use signal::{Signal, SignalSummary};
pub use simulator::DeviceSimulator;
pub use transport::{LinkSettings, RetryPolicy, Transport};
