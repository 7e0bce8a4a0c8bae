//! Polling orchestrator.
//!
//! Each tick runs, in order: discovery of newly attached devices,
//! initialization of devices still in [`DeviceState::None`], retrieve →
//! convert → standardize → send for every working device, the disconnect
//! check, the consumer liveness check, and finally clears the "just added"
//! bucket. Operators talk to a running monitor through [`MonitorHandle`].

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::channel::{Channel, ChannelFunction};
use crate::config::MonitorConfig;
use crate::device::{Device, DeviceState, RetrieveMode, SendMode};
use crate::discovery::{DeviceDiscovery, DeviceRegistry};
use crate::error::DeviceError;
use crate::liveness::ProcessProbe;
use crate::observation::{FhirFormatter, Observation, ObservationFormatter};
use crate::signal::Signal;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    DeviceAdded { code: String, name: String },
    DeviceInitialized { code: String },
    DeviceRemoved { code: String },
    /// Latest classified values after new samples arrived.
    Readings { code: String, observations: Vec<Observation> },
    BatchSent { code: String, records: usize },
    Warning { code: Option<String>, kind: &'static str, message: String },
    Error { code: Option<String>, kind: &'static str, message: String },
}

impl MonitorEvent {
    fn warning(code: Option<&str>, error: &DeviceError) -> Self {
        Self::Warning {
            code: code.map(str::to_string),
            kind: error.code(),
            message: error.to_string(),
        }
    }

    fn error(code: Option<&str>, error: &DeviceError) -> Self {
        Self::Error {
            code: code.map(str::to_string),
            kind: error.code(),
            message: error.to_string(),
        }
    }
}

/// Operator requests, addressed by device code.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ListDevices,
    AttachSimulator,
    Start { code: String },
    Stop { code: String },
    Pause { code: String },
    SetRetrieveMode { code: String, mode: RetrieveMode },
    SetSendMode { code: String, mode: SendMode },
    SetRetrievePort { code: String, port: u16 },
    SetSendPort { code: String, port: u16 },
    AddSignalChosen { code: String, signal: String, index: usize },
    RemoveSignalChosen { code: String, index: usize },
    SetChannelState { code: String, index: usize, enabled: bool },
    SetChannelFunction { code: String, index: usize, function: ChannelFunction },
    SetRange { code: String, index: usize, min: f64, max: f64 },
    SetFrequency { code: String, signal: String, frequency: f64 },
    /// Copy of a signal's history.
    History { code: String, signal: String },
}

#[derive(Debug, Clone)]
pub enum Reply {
    Done,
    /// Signal unbound by `AddSignalChosen` or `RemoveSignalChosen`.
    Displaced(Option<String>),
    Devices(Vec<DeviceSummary>),
    History(Signal),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSummary {
    pub code: String,
    pub name: String,
    pub state: DeviceState,
    pub retrieve_mode: RetrieveMode,
    pub send_mode: SendMode,
    pub retrieve_port: u16,
    pub send_port: u16,
    pub failures: u32,
    pub channels: Vec<Channel>,
}

impl From<&Device> for DeviceSummary {
    fn from(device: &Device) -> Self {
        Self {
            code: device.code().to_string(),
            name: device.name().to_string(),
            state: device.state(),
            retrieve_mode: device.retrieve_mode(),
            send_mode: device.send_mode(),
            retrieve_port: device.retrieve_port(),
            send_port: device.send_port(),
            failures: device.faults().failures(),
            channels: device.catalog().channels().to_vec(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Monitor is not running")]
    Stopped,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug)]
struct Command {
    request: Request,
    reply: Sender<Result<Reply, DeviceError>>,
}

pub struct Monitor {
    config: MonitorConfig,
    devices: Vec<Device>,
    /// Devices added during the current tick.
    just_added: Vec<String>,
    /// Codes whose initialization failed, ignored while they stay attached.
    rejected: HashSet<String>,
    /// Consumer applications expected to be running.
    applications: BTreeSet<String>,
    last_liveness_check: Option<Instant>,
    registry: DeviceRegistry,
    discovery: Box<dyn DeviceDiscovery>,
    probe: Box<dyn ProcessProbe>,
    formatter: Box<dyn ObservationFormatter>,
    events: SyncSender<MonitorEvent>,
    /// Events discarded because the receiver fell behind.
    dropped_events: u64,
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("devices", &self.devices)
            .field("applications", &self.applications)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        registry: DeviceRegistry,
        discovery: Box<dyn DeviceDiscovery>,
        probe: Box<dyn ProcessProbe>,
    ) -> (Self, Receiver<MonitorEvent>) {
        let (events, receiver) = mpsc::sync_channel(config.event_capacity.max(1));
        let attach_simulator = config.attach_simulator;
        let mut monitor = Self {
            config,
            devices: Vec::new(),
            just_added: Vec::new(),
            rejected: HashSet::new(),
            applications: BTreeSet::new(),
            last_liveness_check: None,
            registry,
            discovery,
            probe,
            formatter: Box::new(FhirFormatter::new()),
            events,
            dropped_events: 0,
        };
        if attach_simulator {
            monitor.attach(Device::simulator());
        }
        (monitor, receiver)
    }

    #[must_use]
    pub fn with_formatter(mut self, formatter: Box<dyn ObservationFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, code: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.code() == code)
    }

    /// Devices added since the start of the current tick.
    pub fn just_added(&self) -> &[String] {
        &self.just_added
    }

    pub fn applications(&self) -> &BTreeSet<String> {
        &self.applications
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    /// Queue `event`. When the queue is full the event is dropped.
    fn emit(&mut self, event: MonitorEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped_events == 0 {
                    log::warn!("Event queue full, dropping events");
                }
                self.dropped_events += 1;
            }
        }
    }

    /// Track a device. Devices whose code is already tracked are dropped.
    pub fn attach(&mut self, device: Device) -> bool {
        if self.devices.iter().any(|d| d.code() == device.code()) {
            return false;
        }
        let device = device.with_link(self.config.link());
        log::info!("Device {} attached", device.code());
        self.emit(MonitorEvent::DeviceAdded {
            code: device.code().to_string(),
            name: device.name().to_string(),
        });
        self.just_added.push(device.code().to_string());
        self.devices.push(device);
        true
    }

    /// Run one polling cycle.
    pub fn tick(&mut self) {
        let _span = tracing::debug_span!("tick", devices = self.devices.len()).entered();
        #[cfg(feature = "cpu-profiling")]
        let _zone = tracy_client::Client::running()
            .map(|client| client.span(tracy_client::span_location!("monitor tick"), 0));

        self.discover();
        self.initialize_new();

        let working: Vec<usize> = self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.state() == DeviceState::Working)
            .map(|(i, _)| i)
            .collect();
        for index in working {
            self.poll(index);
        }

        self.check_devices();
        self.check_applications();
        self.just_added.clear();
    }

    fn discover(&mut self) {
        let attached = match self.discovery.discover() {
            Ok(attached) => attached,
            Err(e) => {
                log::debug!("Discovery failed: {}", e);
                return;
            }
        };

        let mut present = HashSet::new();
        for item in attached {
            let Some(device) = self.registry.create(&item.description) else {
                continue;
            };
            present.insert(device.code().to_string());
            if !self.rejected.contains(device.code()) {
                self.attach(device);
            }
        }
        self.rejected.retain(|code| present.contains(code));
    }

    fn initialize_new(&mut self) {
        let mut events = Vec::new();
        let mut consumers = false;

        for device in self
            .devices
            .iter_mut()
            .filter(|d| d.state() == DeviceState::None)
        {
            let code = device.code().to_string();
            if let Err(e) = device.initialize() {
                events.push(MonitorEvent::error(Some(&code), &e));
                device.fail();
                self.rejected.insert(code);
                continue;
            }
            events.push(MonitorEvent::DeviceInitialized { code: code.clone() });

            let Some(config) = self.config.device(&code) else {
                continue;
            };
            for e in config.apply(device) {
                events.push(MonitorEvent::warning(Some(&code), &e));
            }
            consumers |= device.send_mode() != SendMode::None;
            if config.autostart {
                match device.start() {
                    Ok(()) if device.send_mode() == SendMode::None => events.push(
                        MonitorEvent::warning(Some(&code), &DeviceError::SendDataModeNotSelected),
                    ),
                    Ok(()) => {}
                    Err(e) => events.push(MonitorEvent::error(Some(&code), &e)),
                }
            }
        }

        if consumers {
            self.track_consumer();
        }
        for event in events {
            self.emit(event);
        }
        self.evict(DeviceState::Error);
    }

    fn poll(&mut self, index: usize) {
        let Some(device) = self.devices.get_mut(index) else {
            return;
        };
        let _span = tracing::debug_span!("poll", device = device.code()).entered();
        let code = device.code().to_string();
        let mut events = Vec::new();

        if let Err(e) = device.retrieve() {
            events.push(MonitorEvent::error(Some(&code), &e));
        }
        let appended = device.convert();

        if appended > 0 {
            let observations = device.observations();
            if let Some(message) = device.standardize(self.formatter.as_ref()) {
                if device.send_mode() != SendMode::None {
                    match device.send(&message) {
                        Ok(()) => events.push(MonitorEvent::BatchSent {
                            code: code.clone(),
                            records: observations.len(),
                        }),
                        Err(e) => events.push(MonitorEvent::warning(Some(&code), &e)),
                    }
                }
            }
            events.push(MonitorEvent::Readings {
                code,
                observations,
            });
        }

        for event in events {
            self.emit(event);
        }
    }

    fn check_devices(&mut self) {
        let mut events = Vec::new();
        for device in &mut self.devices {
            if let Err(e) = device.check_device_state() {
                log::warn!("{}: {}", device.code(), e);
                events.push(MonitorEvent::error(Some(device.code()), &e));
                device.fail();
            }
        }
        for event in events {
            self.emit(event);
        }
        self.evict(DeviceState::Error);
    }

    fn evict(&mut self, state: DeviceState) {
        let mut removed = Vec::new();
        self.devices.retain(|d| {
            if d.state() == state {
                removed.push(d.code().to_string());
                false
            } else {
                true
            }
        });
        for code in removed {
            log::info!("Device {} removed", code);
            self.emit(MonitorEvent::DeviceRemoved { code });
        }
    }

    fn track_consumer(&mut self) {
        if self.applications.insert(self.config.consumer_application.clone()) {
            log::info!("Tracking consumer {}", self.config.consumer_application);
        }
    }

    fn check_applications(&mut self) {
        if self.applications.is_empty() {
            return;
        }
        let now = Instant::now();
        if self
            .last_liveness_check
            .is_some_and(|last| now.duration_since(last) < self.config.liveness_interval())
        {
            return;
        }
        self.last_liveness_check = Some(now);

        let gone: Vec<String> = self
            .applications
            .iter()
            .filter(|app| !self.probe.is_running(app))
            .cloned()
            .collect();
        for application in gone {
            self.applications.remove(&application);
            let error = DeviceError::ApplicationIsDisconnected { application };
            log::warn!("{}", error);
            self.emit(MonitorEvent::error(None, &error));
        }
    }

    fn device_mut(&mut self, code: &str) -> Result<&mut Device, DeviceError> {
        self.devices
            .iter_mut()
            .find(|d| d.code() == code)
            .ok_or_else(|| DeviceError::UnknownDevice {
                code: code.to_string(),
            })
    }

    /// Apply an operator request.
    pub fn handle(&mut self, request: Request) -> Result<Reply, DeviceError> {
        log::debug!("Request {:?}", request);
        match request {
            Request::ListDevices => Ok(Reply::Devices(
                self.devices.iter().map(DeviceSummary::from).collect(),
            )),
            Request::AttachSimulator => {
                self.attach(Device::simulator());
                Ok(Reply::Done)
            }
            Request::Start { code } => {
                let device = self.device_mut(&code)?;
                device.start()?;
                if device.send_mode() == SendMode::None {
                    self.emit(MonitorEvent::warning(
                        Some(&code),
                        &DeviceError::SendDataModeNotSelected,
                    ));
                }
                Ok(Reply::Done)
            }
            Request::Stop { code } => self.device_mut(&code)?.stop().map(|()| Reply::Done),
            Request::Pause { code } => self.device_mut(&code)?.pause().map(|()| Reply::Done),
            Request::SetRetrieveMode { code, mode } => self
                .device_mut(&code)?
                .set_retrieve_mode(mode)
                .map(|()| Reply::Done),
            Request::SetSendMode { code, mode } => {
                self.device_mut(&code)?.set_send_mode(mode)?;
                if mode != SendMode::None {
                    self.track_consumer();
                }
                Ok(Reply::Done)
            }
            Request::SetRetrievePort { code, port } => self
                .device_mut(&code)?
                .set_retrieve_port(port)
                .map(|()| Reply::Done),
            Request::SetSendPort { code, port } => self
                .device_mut(&code)?
                .set_send_port(port)
                .map(|()| Reply::Done),
            Request::AddSignalChosen {
                code,
                signal,
                index,
            } => self
                .device_mut(&code)?
                .add_signal_chosen(&signal, index)
                .map(Reply::Displaced),
            Request::RemoveSignalChosen { code, index } => self
                .device_mut(&code)?
                .remove_signal_chosen(index)
                .map(Reply::Displaced),
            Request::SetChannelState {
                code,
                index,
                enabled,
            } => self
                .device_mut(&code)?
                .set_channel_state(index, enabled)
                .map(|()| Reply::Done),
            Request::SetChannelFunction {
                code,
                index,
                function,
            } => self
                .device_mut(&code)?
                .set_channel_function(index, function)
                .map(|()| Reply::Done),
            Request::SetRange {
                code,
                index,
                min,
                max,
            } => self
                .device_mut(&code)?
                .set_range(index, min, max)
                .map(|()| Reply::Done),
            Request::SetFrequency {
                code,
                signal,
                frequency,
            } => self
                .device_mut(&code)?
                .set_frequency(&signal, frequency)
                .map(|()| Reply::Done),
            Request::History { code, signal } => {
                let device = self.device_mut(&code)?;
                device
                    .catalog()
                    .signal(&signal)
                    .cloned()
                    .map(Reply::History)
                    .ok_or(DeviceError::UnknownSignal { signal })
            }
        }
    }

    /// Close every device.
    pub fn shutdown(&mut self) {
        for device in &mut self.devices {
            device.close();
        }
        log::info!("Monitor stopped, {} devices closed", self.devices.len());
    }

    /// Run the polling loop until `stop` is set, answering commands between
    /// ticks.
    fn run(mut self, commands: &Receiver<Command>, stop: &AtomicBool) {
        let tick = self.config.tick();
        while !stop.load(Ordering::Relaxed) {
            let deadline = Instant::now() + tick;
            self.tick();

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match commands.recv_timeout(remaining) {
                    Ok(command) => {
                        let result = self.handle(command.request);
                        let _ = command.reply.send(result);
                    }
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        std::thread::sleep(remaining);
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    /// Move the monitor onto its own thread.
    pub fn spawn(self) -> std::io::Result<MonitorHandle> {
        let (commands, receiver) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("monitor".to_string())
            .spawn(move || self.run(&receiver, &flag))?;

        Ok(MonitorHandle {
            commands,
            stop,
            thread: Some(thread),
        })
    }
}

/// Operator side of a running [`Monitor`].
#[derive(Debug)]
pub struct MonitorHandle {
    commands: Sender<Command>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Send a request and wait for the monitor to apply it.
    pub fn request(&self, request: Request) -> Result<Reply, MonitorError> {
        let (reply, response) = mpsc::channel();
        self.commands
            .send(Command { request, reply })
            .map_err(|_| MonitorError::Stopped)?;
        let result = response.recv().map_err(|_| MonitorError::Stopped)?;
        Ok(result?)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop, close every device and wait for the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
