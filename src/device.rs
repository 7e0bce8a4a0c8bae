//! Device lifecycle, link ownership and the per-tick acquisition steps.
//!
//! A [`Device`] owns its catalog, its sockets and its pipe. The orchestrator
//! drives it through `retrieve` → `convert` → `standardize` → `send` once per
//! tick and evicts it when [`Device::check_device_state`] reports a disconnect.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::SignalCatalog;
use crate::channel::ChannelFunction;
use crate::codec::{self, RetrieveFrame};
use crate::driver::DriverLoader;
use crate::error::DeviceError;
use crate::neurobit::NeurobitOptima;
use crate::observation::{self, Observation, ObservationFormatter};
use crate::simulator::DeviceSimulator;
use crate::transport::{LinkSettings, Transport};

pub const DEFAULT_RETRIEVE_PORT: u16 = 8053;
pub const DEFAULT_SEND_PORT: u16 = 8054;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceState {
    /// Constructed, not initialized.
    #[default]
    None,
    /// Initialization in progress.
    Loaded,
    Initialized,
    Working,
    /// Paused by the operator.
    Stopped,
    /// Terminal. The device is closed and evicted.
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetrieveMode {
    Driver,
    Network,
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SendMode {
    Pipe,
    Network,
    #[default]
    None,
}

/// Consecutive read failures of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounter {
    failures: u32,
}

impl FaultCounter {
    /// Failures after which a device counts as disconnected.
    pub const DISCONNECT_THRESHOLD: u32 = 10;

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn increment(&mut self) -> u32 {
        self.failures = self.failures.saturating_add(1);
        if self.failures == Self::DISCONNECT_THRESHOLD {
            log::warn!("Disconnect threshold reached after {} failed reads", self.failures);
        }
        self.failures
    }

    pub fn is_tripped(&self) -> bool {
        self.failures >= Self::DISCONNECT_THRESHOLD
    }

    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Concrete device variants.
#[derive(Debug)]
pub enum Backend {
    NeurobitOptima(NeurobitOptima),
    DeviceSimulator(DeviceSimulator),
}

impl Backend {
    pub fn neurobit(loader: Arc<dyn DriverLoader>) -> Self {
        Self::NeurobitOptima(NeurobitOptima::new(loader))
    }

    pub fn simulator() -> Self {
        Self::DeviceSimulator(DeviceSimulator::new())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NeurobitOptima(_) => NeurobitOptima::CODE,
            Self::DeviceSimulator(_) => DeviceSimulator::CODE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NeurobitOptima(_) => NeurobitOptima::NAME,
            Self::DeviceSimulator(_) => DeviceSimulator::NAME,
        }
    }

    fn catalog(&self) -> SignalCatalog {
        match self {
            Self::NeurobitOptima(_) => SignalCatalog::new(
                NeurobitOptima::SIGNALS,
                NeurobitOptima::FREQUENCIES,
                NeurobitOptima::CHANNELS,
            ),
            Self::DeviceSimulator(_) => SignalCatalog::new(
                DeviceSimulator::SIGNALS,
                DeviceSimulator::FREQUENCIES,
                DeviceSimulator::CHANNELS,
            ),
        }
    }

    fn initialize(&mut self, catalog: &SignalCatalog) -> Result<(), DeviceError> {
        match self {
            Self::NeurobitOptima(d) => d.initialize(catalog),
            Self::DeviceSimulator(d) => {
                d.configure(catalog);
                Ok(())
            }
        }
    }

    /// Push the current channel bindings to the acquisition source.
    fn configure(&mut self, catalog: &SignalCatalog) -> Result<(), DeviceError> {
        match self {
            Self::NeurobitOptima(d) => d.configure(catalog),
            Self::DeviceSimulator(d) => {
                d.configure(catalog);
                Ok(())
            }
        }
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        match self {
            Self::NeurobitOptima(d) => d.start(),
            Self::DeviceSimulator(_) => Ok(()),
        }
    }

    fn stop(&mut self) {
        if let Self::NeurobitOptima(d) = self {
            d.stop();
        }
    }

    fn read_frame(
        &mut self,
        catalog: &mut SignalCatalog,
        faults: &mut FaultCounter,
    ) -> Result<Option<RetrieveFrame>, DeviceError> {
        match self {
            Self::NeurobitOptima(d) => d.read_frame(catalog, faults),
            Self::DeviceSimulator(d) => Ok(d.read_frame(catalog)),
        }
    }

    fn frequency_changed(&mut self, catalog: &SignalCatalog, signal: &str) {
        if let Self::DeviceSimulator(d) = self {
            d.frequency_changed(catalog, signal);
        }
    }

    fn close(&mut self) {
        if let Self::NeurobitOptima(d) = self {
            d.close();
        }
    }
}

/// One attached biosensor.
#[derive(Debug)]
pub struct Device {
    code: String,
    name: String,
    state: DeviceState,
    retrieve_mode: RetrieveMode,
    send_mode: SendMode,
    retrieve_port: u16,
    send_port: u16,
    catalog: SignalCatalog,
    faults: FaultCounter,
    link: LinkSettings,
    transport: Transport,
    /// Raw record stored by `retrieve`, consumed by `convert`.
    pending: Option<String>,
    backend: Backend,
}

impl Device {
    pub fn new(backend: Backend) -> Self {
        let link = LinkSettings::default();
        Self {
            code: backend.code().to_string(),
            name: backend.name().to_string(),
            state: DeviceState::None,
            retrieve_mode: RetrieveMode::None,
            send_mode: SendMode::None,
            retrieve_port: DEFAULT_RETRIEVE_PORT,
            send_port: DEFAULT_SEND_PORT,
            catalog: backend.catalog(),
            faults: FaultCounter::default(),
            transport: Transport::new(link.receive_timeout),
            link,
            pending: None,
            backend,
        }
    }

    pub fn simulator() -> Self {
        Self::new(Backend::simulator())
    }

    #[must_use]
    pub fn with_link(mut self, link: LinkSettings) -> Self {
        self.transport.set_receive_timeout(link.receive_timeout);
        self.link = link;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn retrieve_mode(&self) -> RetrieveMode {
        self.retrieve_mode
    }

    pub fn send_mode(&self) -> SendMode {
        self.send_mode
    }

    pub fn retrieve_port(&self) -> u16 {
        self.retrieve_port
    }

    pub fn send_port(&self) -> u16 {
        self.send_port
    }

    pub fn catalog(&self) -> &SignalCatalog {
        &self.catalog
    }

    pub fn faults(&self) -> FaultCounter {
        self.faults
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Initialized, working or paused.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            DeviceState::Initialized | DeviceState::Working | DeviceState::Stopped
        )
    }

    fn transition(&mut self, to: DeviceState) {
        if self.state != to {
            log::info!("{}: {} -> {}", self.code, self.state, to);
            self.state = to;
        }
    }

    fn invalid(&self, to: DeviceState) -> DeviceError {
        DeviceError::InvalidTransition { from: self.state, to }
    }

    /// Bring the device up. A failure is terminal: the device moves to
    /// [`DeviceState::Error`] and the error is returned.
    pub fn initialize(&mut self) -> Result<(), DeviceError> {
        if !matches!(
            self.state,
            DeviceState::None | DeviceState::Initialized | DeviceState::Stopped
        ) {
            return Err(self.invalid(DeviceState::Loaded));
        }

        self.transition(DeviceState::Loaded);
        if let Err(e) = self.backend.initialize(&self.catalog) {
            log::error!("{}: initialization failed: {}", self.code, e);
            self.transition(DeviceState::Error);
            return Err(e);
        }

        self.faults.reset();
        self.transition(DeviceState::Initialized);
        Ok(())
    }

    /// Begin polling. Requires a retrieve mode.
    pub fn start(&mut self) -> Result<(), DeviceError> {
        if !matches!(self.state, DeviceState::Initialized | DeviceState::Stopped) {
            return Err(self.invalid(DeviceState::Working));
        }

        match self.retrieve_mode {
            RetrieveMode::None => return Err(DeviceError::RetrieveDataModeNotSelected),
            RetrieveMode::Network => self
                .transport
                .create_receive_socket(self.retrieve_port, &self.link.retry)?,
            RetrieveMode::Driver => {
                self.backend.configure(&self.catalog)?;
                self.backend.start()?;
            }
        }

        self.transition(DeviceState::Working);
        Ok(())
    }

    /// Manual stop: back to [`DeviceState::Initialized`].
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        if !matches!(self.state, DeviceState::Working | DeviceState::Stopped) {
            return Err(self.invalid(DeviceState::Initialized));
        }
        if self.retrieve_mode == RetrieveMode::Driver {
            self.backend.stop();
        }
        self.pending = None;
        self.transition(DeviceState::Initialized);
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), DeviceError> {
        if self.state != DeviceState::Working {
            return Err(self.invalid(DeviceState::Stopped));
        }
        self.pending = None;
        self.transition(DeviceState::Stopped);
        Ok(())
    }

    pub fn set_retrieve_mode(&mut self, mode: RetrieveMode) -> Result<(), DeviceError> {
        match mode {
            RetrieveMode::None if self.state == DeviceState::Working => {
                return Err(DeviceError::RetrieveDataModeNotSelected);
            }
            RetrieveMode::Network => self
                .transport
                .create_receive_socket(self.retrieve_port, &self.link.retry)?,
            RetrieveMode::Driver if self.is_ready() => self.backend.configure(&self.catalog)?,
            _ => {}
        }
        log::info!("{}: retrieve mode {:?}", self.code, mode);
        self.retrieve_mode = mode;
        Ok(())
    }

    pub fn set_send_mode(&mut self, mode: SendMode) -> Result<(), DeviceError> {
        match mode {
            SendMode::Pipe => self.transport.create_pipe(
                &self.link.pipe_dir,
                &self.link.pipe_endpoint(&self.code),
                self.link.pipe_timeout,
                &self.link.retry,
            )?,
            SendMode::Network => self.transport.create_send_socket(
                self.link.send_host,
                self.send_port,
                &self.link.retry,
            )?,
            SendMode::None => {}
        }
        log::info!("{}: send mode {:?}", self.code, mode);
        self.send_mode = mode;
        Ok(())
    }

    pub fn set_retrieve_port(&mut self, port: u16) -> Result<(), DeviceError> {
        if self.retrieve_mode == RetrieveMode::Network {
            self.transport.create_receive_socket(port, &self.link.retry)?;
        }
        self.retrieve_port = port;
        Ok(())
    }

    pub fn set_send_port(&mut self, port: u16) -> Result<(), DeviceError> {
        if self.send_mode == SendMode::Network {
            self.transport
                .create_send_socket(self.link.send_host, port, &self.link.retry)?;
        }
        self.send_port = port;
        Ok(())
    }

    /// Bind `signal` to channel `index`, returning the signal it displaced.
    ///
    /// In driver mode the new binding is pushed to the device right away. If
    /// that fails the previous binding is restored and pushed again.
    pub fn add_signal_chosen(
        &mut self,
        signal: &str,
        index: usize,
    ) -> Result<Option<String>, DeviceError> {
        let previous = self.catalog.add_signal_chosen(signal, index)?;
        self.push_or_restore(|catalog| {
            catalog.remove_signal_chosen(index)?;
            match &previous {
                Some(prev) => catalog.add_signal_chosen(prev, index).map(|_| ()),
                None => Ok(()),
            }
        })?;
        Ok(previous)
    }

    /// Unbind channel `index`, returning the signal it carried. Restored like
    /// [`Device::add_signal_chosen`] when the driver rejects the new setup.
    pub fn remove_signal_chosen(&mut self, index: usize) -> Result<Option<String>, DeviceError> {
        let removed = self.catalog.remove_signal_chosen(index)?;
        self.push_or_restore(|catalog| match &removed {
            Some(signal) => catalog.add_signal_chosen(signal, index).map(|_| ()),
            None => Ok(()),
        })?;
        Ok(removed)
    }

    fn push_bindings(&mut self) -> Result<(), DeviceError> {
        if self.retrieve_mode == RetrieveMode::Driver && self.is_ready() {
            self.backend.configure(&self.catalog)?;
        }
        Ok(())
    }

    /// Push the bindings. On failure undo the catalog change with `restore`
    /// and push the restored bindings before returning the error.
    fn push_or_restore(
        &mut self,
        restore: impl FnOnce(&mut SignalCatalog) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        let Err(e) = self.push_bindings() else {
            return Ok(());
        };
        if let Err(undo) = restore(&mut self.catalog) {
            log::error!("{}: cannot restore bindings: {}", self.code, undo);
        } else if let Err(again) = self.push_bindings() {
            log::warn!("{}: cannot push restored bindings: {}", self.code, again);
        }
        Err(e)
    }

    pub fn set_channel_state(&mut self, index: usize, enabled: bool) -> Result<(), DeviceError> {
        self.catalog.set_channel_state(index, enabled)
    }

    pub fn set_channel_function(
        &mut self,
        index: usize,
        function: ChannelFunction,
    ) -> Result<(), DeviceError> {
        self.catalog.set_channel_function(index, function)
    }

    pub fn set_range(&mut self, index: usize, min: f64, max: f64) -> Result<(), DeviceError> {
        self.catalog.set_range(index, min, max)
    }

    pub fn set_frequency(&mut self, signal: &str, frequency: f64) -> Result<(), DeviceError> {
        self.catalog.set_frequency(signal, frequency)?;
        self.backend.frequency_changed(&self.catalog, signal);
        Ok(())
    }

    /// Acquire one raw record. Returns whether a record is waiting for
    /// [`Device::convert`].
    ///
    /// Read failures increment the fault counter instead of failing. Only a
    /// driver read abandoned at the disconnect threshold is returned as an error.
    pub fn retrieve(&mut self) -> Result<bool, DeviceError> {
        if self.state != DeviceState::Working {
            return Ok(false);
        }

        match self.retrieve_mode {
            RetrieveMode::None => return Err(DeviceError::RetrieveDataModeNotSelected),
            RetrieveMode::Network => match self.transport.receive(self.retrieve_port) {
                Ok(Some(datagram)) => self.pending = Some(datagram),
                Ok(None) => {
                    log::debug!("{}: nothing received on port {}", self.code, self.retrieve_port);
                    self.faults.increment();
                }
                Err(e) => {
                    log::debug!("{}: receive failed: {}", self.code, e);
                    self.faults.increment();
                }
            },
            RetrieveMode::Driver => {
                if let Some(frame) = self.backend.read_frame(&mut self.catalog, &mut self.faults)? {
                    self.pending = Some(codec::encode(&frame));
                }
            }
        }
        Ok(self.pending.is_some())
    }

    /// Decode the pending record into the signal histories.
    ///
    /// Returns the number of samples appended. A record that cannot be
    /// decoded, carries malformed segments or holds no entries counts as one
    /// failed read.
    pub fn convert(&mut self) -> usize {
        let Some(raw) = self.pending.take() else {
            return 0;
        };

        let frame = match codec::decode(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("{}: dropping record: {}", self.code, e);
                self.faults.increment();
                return 0;
            }
        };
        let timestamp = match frame.sample_time() {
            Ok(timestamp) => timestamp,
            Err(e) => {
                log::debug!("{}: dropping record: {}", self.code, e);
                self.faults.increment();
                return 0;
            }
        };
        if frame.is_empty() || frame.malformed > 0 {
            self.faults.increment();
        }

        frame
            .entries
            .iter()
            .filter(|entry| {
                self.catalog
                    .append(entry.channel, &entry.signal, timestamp, entry.value)
            })
            .count()
    }

    pub fn observations(&self) -> Vec<Observation> {
        observation::build_observations(&self.catalog)
    }

    /// Outbound batch for the latest samples, if any.
    pub fn standardize(&self, formatter: &dyn ObservationFormatter) -> Option<String> {
        observation::standardize(&self.catalog, formatter)
    }

    /// Publish `message` over the selected transport.
    ///
    /// A failed pipe write drops the pipe and clears the send mode.
    pub fn send(&mut self, message: &str) -> Result<(), DeviceError> {
        match self.send_mode {
            SendMode::None => Ok(()),
            SendMode::Network => self.transport.send_datagram(self.send_port, message),
            SendMode::Pipe => self.transport.write_pipe(message).inspect_err(|_| {
                log::warn!("{}: pipe lost, send mode cleared", self.code);
                self.send_mode = SendMode::None;
            }),
        }
    }

    pub fn check_device_state(&self) -> Result<(), DeviceError> {
        if self.faults.is_tripped() {
            return Err(DeviceError::DeviceIsDisconnected {
                failures: self.faults.failures(),
            });
        }
        Ok(())
    }

    /// Release the driver, sockets and pipe.
    pub fn close(&mut self) {
        if self.state == DeviceState::Working && self.retrieve_mode == RetrieveMode::Driver {
            self.backend.stop();
        }
        self.backend.close();
        self.transport.close();
        self.pending = None;
        if self.state != DeviceState::Error {
            self.transition(DeviceState::None);
        }
        log::info!("{}: closed", self.code);
    }

    /// Enter the terminal error state and close.
    pub fn fail(&mut self) {
        if self.state == DeviceState::Working && self.retrieve_mode == RetrieveMode::Driver {
            self.backend.stop();
        }
        self.transition(DeviceState::Error);
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RangeState;
    use crate::driver::NoDriver;
    use crate::observation::FhirFormatter;
    use chrono::DateTime;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn link() -> LinkSettings {
        LinkSettings {
            receive_timeout: Duration::from_millis(200),
            ..LinkSettings::default()
        }
    }

    fn network_device() -> Device {
        let mut device = Device::simulator().with_link(link());
        device.initialize().unwrap();
        device.add_signal_chosen("EKG", 0).unwrap();
        device.add_signal_chosen("GSR", 1).unwrap();
        device
    }

    #[test]
    fn test_initial_state() {
        let device = Device::simulator();
        assert_eq!(device.state(), DeviceState::None);
        assert_eq!(device.code(), "DeviceSimulator");
        assert_eq!(device.retrieve_port(), 8053);
        assert_eq!(device.send_port(), 8054);
        assert_eq!(device.catalog().channels_enable().len(), 4);
    }

    #[test]
    fn test_start_requires_retrieve_mode() {
        let mut device = network_device();
        assert!(matches!(
            device.start(),
            Err(DeviceError::RetrieveDataModeNotSelected)
        ));
        assert_eq!(device.state(), DeviceState::Initialized);
    }

    #[test]
    fn test_start_requires_initialization() {
        let mut device = Device::simulator();
        assert!(matches!(
            device.start(),
            Err(DeviceError::InvalidTransition { from: DeviceState::None, to: DeviceState::Working })
        ));
    }

    #[test]
    fn test_stop_and_pause() {
        let mut device = network_device();
        device.set_retrieve_mode(RetrieveMode::Driver).unwrap();
        device.start().unwrap();
        assert_eq!(device.state(), DeviceState::Working);

        device.pause().unwrap();
        assert_eq!(device.state(), DeviceState::Stopped);
        device.start().unwrap();
        device.stop().unwrap();
        assert_eq!(device.state(), DeviceState::Initialized);
        assert!(device.pause().is_err());
    }

    #[test]
    fn test_nine_failures_keep_device_connected() {
        let mut device = network_device();
        for _ in 0..9 {
            device.pending = Some("garbage".to_string());
            device.convert();
        }
        assert!(device.check_device_state().is_ok());

        device.pending = Some("garbage".to_string());
        device.convert();
        assert!(matches!(
            device.check_device_state(),
            Err(DeviceError::DeviceIsDisconnected { failures: 10 })
        ));
    }

    #[test]
    fn test_garbage_counts_one_failure() {
        let mut device = network_device();
        device.pending = Some("garbage".to_string());
        assert_eq!(device.convert(), 0);
        assert_eq!(device.faults().failures(), 1);
        assert!(device.catalog().signal("EKG").unwrap().is_empty());
    }

    #[test]
    fn test_empty_record_counts_one_failure() {
        let mut device = network_device();
        device.pending = Some("1700000000000@".to_string());
        assert_eq!(device.convert(), 0);
        assert_eq!(device.faults().failures(), 1);
    }

    #[test]
    fn test_reinitialize_resets_faults() {
        let mut device = network_device();
        device.pending = Some("garbage".to_string());
        device.convert();
        device.initialize().unwrap();
        assert_eq!(device.faults().failures(), 0);
    }

    #[test]
    fn test_disabled_channel_is_skipped() {
        let mut device = network_device();
        device.set_channel_state(1, false).unwrap();
        device.pending = Some("1700000000000@EKG=72.5#0;GSR=3.2#1;".to_string());

        assert_eq!(device.convert(), 1);
        assert!(device.catalog().signal("GSR").unwrap().is_empty());
        assert_eq!(device.observations().len(), 1);
    }

    #[test]
    fn test_network_datagram_end_to_end() {
        let port = free_port();
        let mut device = network_device();
        device.set_retrieve_port(port).unwrap();
        device.set_retrieve_mode(RetrieveMode::Network).unwrap();
        device.start().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(b"1700000000000@EKG=72.5#0;GSR=3.2#1;", ("127.0.0.1", port))
            .unwrap();

        assert!(device.retrieve().unwrap());
        assert_eq!(device.convert(), 2);
        assert_eq!(device.faults().failures(), 0);

        let expected = DateTime::from_timestamp_millis(1_700_000_000_000 + 7_200_000)
            .unwrap()
            .naive_utc();
        let ekg = device.catalog().signal("EKG").unwrap();
        assert_eq!(ekg.latest(), Some((expected, 72.5)));
        let gsr = device.catalog().signal("GSR").unwrap();
        assert_eq!(gsr.latest(), Some((expected, 3.2)));
    }

    #[test]
    fn test_receive_timeout_counts_failure() {
        let port = free_port();
        let mut device = network_device();
        device.set_retrieve_port(port).unwrap();
        device.set_retrieve_mode(RetrieveMode::Network).unwrap();
        device.start().unwrap();

        assert!(!device.retrieve().unwrap());
        assert_eq!(device.faults().failures(), 1);
    }

    #[test]
    fn test_send_observations_over_network() {
        let consumer = UdpSocket::bind("127.0.0.1:0").unwrap();
        consumer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();

        let mut device = network_device();
        device.set_send_port(consumer.local_addr().unwrap().port()).unwrap();
        device.set_send_mode(SendMode::Network).unwrap();
        device.pending = Some("1700000000000@EKG=72.5#0;GSR=90#1;".to_string());
        device.convert();

        let message = device.standardize(&FhirFormatter::new()).unwrap();
        device.send(&message).unwrap();

        let mut buf = vec![0u8; 8192];
        let (len, _) = consumer.recv_from(&mut buf).unwrap();
        let received = String::from_utf8_lossy(&buf[..len]);
        assert!(received.starts_with('['));
        assert!(received.ends_with("]@#"));
        assert_eq!(received.matches(",\n").count(), 2);
        assert_eq!(device.observations()[1].range_state, RangeState::High);
    }

    #[test]
    fn test_send_without_mode_is_noop() {
        let mut device = network_device();
        assert!(device.send("[]@#").is_ok());
    }

    #[test]
    fn test_failed_pipe_setup_keeps_send_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = Device::simulator().with_link(LinkSettings {
            pipe_dir: dir.path().to_path_buf(),
            pipe_timeout: Duration::from_millis(20),
            ..link()
        });
        device.initialize().unwrap();

        assert!(matches!(
            device.set_send_mode(SendMode::Pipe),
            Err(DeviceError::PipeNotConnected { .. })
        ));
        assert_eq!(device.send_mode(), SendMode::None);
    }

    #[test]
    fn test_pipe_endpoints_are_per_device() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LinkSettings {
            pipe_dir: dir.path().to_path_buf(),
            pipe_timeout: Duration::from_millis(10),
            ..link()
        };
        let mut simulator = Device::simulator().with_link(settings.clone());
        let mut neurobit = Device::new(Backend::neurobit(Arc::new(NoDriver::new("NeurobitDrv64"))))
            .with_link(settings);

        assert!(simulator.set_send_mode(SendMode::Pipe).is_err());
        assert!(neurobit.set_send_mode(SendMode::Pipe).is_err());

        let simulator_path = dir.path().join("VRTPipe.DeviceSimulator");
        let neurobit_path = dir.path().join("VRTPipe.NeurobitOptima");
        assert_eq!(simulator.transport().pipe_path(), Some(simulator_path.as_path()));
        assert_eq!(neurobit.transport().pipe_path(), Some(neurobit_path.as_path()));

        simulator.close();
        assert!(!simulator_path.exists());
        assert!(neurobit_path.exists());
    }

        #[test]
    fn test_duplicate_signal_leaves_bindings() {
        let mut device = network_device();
        assert!(matches!(
            device.add_signal_chosen("EKG", 1),
            Err(DeviceError::SignalIsChosen { .. })
        ));
        assert_eq!(device.catalog().channel_of("EKG"), Some(0));
        assert_eq!(device.catalog().channel_of("GSR"), Some(1));
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut device = network_device();
        device.fail();
        assert_eq!(device.state(), DeviceState::Error);
        assert!(device.initialize().is_err());
    }
}
