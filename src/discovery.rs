//! Attached-device enumeration and the description → device registry.

use std::sync::Arc;

use serialport::SerialPortType;

use crate::device::{Backend, Device};
use crate::driver::DriverLoader;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Port enumeration failed: {0}")]
    Enumeration(#[from] serialport::Error),
}

/// An attached device as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub description: String,
    pub port: String,
}

pub trait DeviceDiscovery: Send {
    fn discover(&mut self) -> Result<Vec<AttachedDevice>, DiscoveryError>;
}

/// Enumerates USB serial ports, described by their product string.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortDiscovery;

impl DeviceDiscovery for SerialPortDiscovery {
    fn discover(&mut self) -> Result<Vec<AttachedDevice>, DiscoveryError> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => {
                    let description = usb.product.or(usb.manufacturer)?;
                    Some(AttachedDevice {
                        description,
                        port: port.port_name,
                    })
                }
                _ => None,
            })
            .collect())
    }
}

/// Reports nothing. Used when only the simulator should run.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiscovery;

impl DeviceDiscovery for NoDiscovery {
    fn discover(&mut self) -> Result<Vec<AttachedDevice>, DiscoveryError> {
        Ok(Vec::new())
    }
}

pub type DeviceFactory = Box<dyn Fn() -> Device + Send + Sync>;

/// Maps known descriptions to device constructors.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: Vec<(String, DeviceFactory)>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(description, _)| description))
            .finish()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry knowing every supported hardware device.
    pub fn with_defaults(loader: Arc<dyn DriverLoader>) -> Self {
        let mut registry = Self::new();
        registry.register("Neurobit Optima", move || {
            Device::new(Backend::neurobit(Arc::clone(&loader)))
        });
        registry
    }

    pub fn register(
        &mut self,
        description: impl Into<String>,
        factory: impl Fn() -> Device + Send + Sync + 'static,
    ) {
        self.entries.push((description.into(), Box::new(factory)));
    }

    /// Construct the device for `description`, or `None` when it is unknown.
    pub fn create(&self, description: &str) -> Option<Device> {
        self.entries
            .iter()
            .find(|(known, _)| known == description)
            .map(|(_, factory)| factory())
    }
}
