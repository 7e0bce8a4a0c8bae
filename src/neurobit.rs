use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::SignalCatalog;
use crate::channel::ChannelInfo;
use crate::codec::RetrieveFrame;
use crate::device::FaultCounter;
use crate::driver::{DriverApi, DriverError, DriverLoader, ParamId, ParamValue};
use crate::error::DeviceError;

/// Neurobit Optima+ 4 USB, read through its vendor driver.
pub struct NeurobitOptima {
    loader: Arc<dyn DriverLoader>,
    driver: Option<Box<dyn DriverApi>>,
}

impl fmt::Debug for NeurobitOptima {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NeurobitOptima")
            .field("library", &self.loader.library())
            .field("loaded", &self.driver.is_some())
            .finish()
    }
}

impl NeurobitOptima {
    pub const CODE: &'static str = "NeurobitOptima";
    pub const NAME: &'static str = "Neurobit Optima+ 4 USB";
    pub const LIBRARY: &'static str = "NeurobitDrv64";
    pub const CHANNELS: usize = 4;
    pub const SIGNALS: &'static [&'static str] = &[
        "EEG",
        "EKG",
        "HRV",
        "SCP",
        "BMP",
        "GSR",
        "RESP_TEMP",
        "BVP",
        "EMG",
    ];
    pub const FREQUENCIES: &'static [f64] = &[1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0];

    pub fn new(loader: Arc<dyn DriverLoader>) -> Self {
        Self {
            loader,
            driver: None,
        }
    }

    /// Load the driver, open the device context and push the channel setup.
    pub fn initialize(&mut self, catalog: &SignalCatalog) -> Result<(), DeviceError> {
        self.close();

        let mut driver = self.loader.load().ok_or_else(|| DeviceError::LibraryNotLoaded {
            driver: self.loader.library().to_string(),
        })?;

        if let Err(e) = driver.open(Self::NAME) {
            log::debug!("Opening {} failed: {}", Self::NAME, e);
            return Err(DeviceError::DeviceNotOpen {
                model: Self::NAME.to_string(),
            });
        }

        let channels = match driver.channel_count() {
            Ok(channels) => channels,
            Err(e) => {
                log::debug!("Channel count query failed: {}", e);
                driver.close();
                return Err(DeviceError::DeviceChannelsNotGet);
            }
        };
        if channels != catalog.channels_number() {
            log::warn!(
                "{} reports {} channels, using {}",
                Self::NAME,
                channels,
                catalog.channels_number()
            );
        }

        self.driver = Some(driver);
        self.configure(catalog)
    }

    /// Enable every bound channel and select the profile of its signal.
    pub fn configure(&mut self, catalog: &SignalCatalog) -> Result<(), DeviceError> {
        let Some(driver) = self.driver.as_mut() else {
            return Ok(());
        };

        for channel in catalog.channels() {
            let Some(signal) = channel.signal() else {
                continue;
            };
            let index = channel.index();

            driver
                .set_param(ParamId::ChannelEnable, index, ParamValue::Bool(channel.is_enabled()))
                .map_err(|_| DeviceError::DeviceChannelNotRun { channel: index })?;
            driver
                .set_param_text(ParamId::ChannelProfile, index, signal)
                .map_err(|_| DeviceError::DeviceProfileNotSet {
                    channel: index,
                    profile: signal.to_string(),
                })?;
            log::debug!("Channel {} configured for {}", index, signal);
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), DeviceError> {
        let driver = self.driver.as_mut().ok_or(DeviceError::DeviceNotConnected)?;
        driver.start_measurement().map_err(|e| match e {
            DriverError::Refused(_) | DriverError::UnexpectedType { .. } => {
                DeviceError::DeviceMeasurementCannotStart
            }
            DriverError::Status(_) | DriverError::NotConnected => DeviceError::DeviceNotConnected,
        })
    }

    pub fn stop(&mut self) {
        if let Some(driver) = self.driver.as_mut() {
            if let Err(e) = driver.stop_measurement() {
                log::warn!("Stopping measurement failed: {}", e);
            }
        }
    }

    /// Read metadata of every enabled channel and the latest sample of every
    /// bound one.
    ///
    /// A failed query counts against `faults` and skips that channel for this
    /// read. Once `faults` trips, the read is abandoned with the field that
    /// failed.
    pub fn read_frame(
        &mut self,
        catalog: &mut SignalCatalog,
        faults: &mut FaultCounter,
    ) -> Result<Option<RetrieveFrame>, DeviceError> {
        let Some(driver) = self.driver.as_mut() else {
            faults.increment();
            return Ok(None);
        };

        let enabled: Vec<(usize, Option<String>)> = catalog
            .channels()
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| (c.index(), c.signal().map(str::to_string)))
            .collect();

        let mut frame = RetrieveFrame::new(Utc::now().timestamp_millis());
        for (index, signal) in enabled {
            let read = read_info(driver.as_mut(), index).and_then(|info| {
                let value = match &signal {
                    Some(_) => Some(
                        driver
                            .read_sample(index)
                            .map_err(|_| "Value")?,
                    ),
                    None => None,
                };
                Ok((info, value))
            });

            match read {
                Ok((info, value)) => {
                    catalog.set_channel_info(index, info);
                    if let (Some(signal), Some(value)) = (signal, value) {
                        frame.push(signal, value, index);
                    }
                }
                Err(field) => {
                    faults.increment();
                    if faults.is_tripped() {
                        return Err(DeviceError::DeviceMeasurementReadError {
                            channel: index,
                            field,
                        });
                    }
                    log::debug!("Reading {} on channel {} failed", field, index);
                }
            }
        }

        Ok((!frame.is_empty()).then_some(frame))
    }

    pub fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.stop_measurement() {
                log::debug!("Stopping measurement on close failed: {}", e);
            }
            driver.close();
        }
    }
}

fn field_name(param: ParamId) -> &'static str {
    match param {
        ParamId::ChannelName => "Channel",
        ParamId::RangeMin => "Min",
        ParamId::RangeMax => "Max",
        ParamId::SampleRate => "SR",
        ParamId::ChannelLabel => "Label",
        ParamId::ChannelTransducer => "Sensor",
        _ => "Parameter",
    }
}

fn text(driver: &mut dyn DriverApi, param: ParamId, channel: usize) -> Result<String, &'static str> {
    driver
        .get_param(param, channel)
        .ok()
        .and_then(|v| v.as_text().map(str::to_string))
        .ok_or_else(|| field_name(param))
}

fn float(driver: &mut dyn DriverApi, param: ParamId, channel: usize) -> Result<f64, &'static str> {
    driver
        .get_param(param, channel)
        .ok()
        .and_then(|v| v.as_float())
        .map(f64::from)
        .ok_or_else(|| field_name(param))
}

fn read_info(driver: &mut dyn DriverApi, channel: usize) -> Result<ChannelInfo, &'static str> {
    Ok(ChannelInfo {
        name: text(driver, ParamId::ChannelName, channel)?,
        min: float(driver, ParamId::RangeMin, channel)?,
        max: float(driver, ParamId::RangeMax, channel)?,
        sample_rate: float(driver, ParamId::SampleRate, channel)?,
        label: text(driver, ParamId::ChannelLabel, channel)?,
        sensor: text(driver, ParamId::ChannelTransducer, channel)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Backend, Device, DeviceState, RetrieveMode};
    use crate::driver::NoDriver;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Script {
        fail_open: bool,
        fail_count: bool,
        fail_param: Option<ParamId>,
        fail_profile: Option<String>,
        start: Option<DriverError>,
        sample: f64,
        calls: Vec<String>,
    }

    struct ScriptedDriver(Arc<Mutex<Script>>);

    impl DriverApi for ScriptedDriver {
        fn open(&mut self, model: &str) -> Result<(), DriverError> {
            let mut script = self.0.lock().unwrap();
            script.calls.push(format!("open {model}"));
            if script.fail_open {
                return Err(DriverError::Status(-1));
            }
            Ok(())
        }

        fn channel_count(&mut self) -> Result<usize, DriverError> {
            if self.0.lock().unwrap().fail_count {
                return Err(DriverError::Status(-2));
            }
            Ok(4)
        }

        fn get_param(&mut self, param: ParamId, channel: usize) -> Result<ParamValue, DriverError> {
            if self.0.lock().unwrap().fail_param == Some(param) {
                return Err(DriverError::Status(-3));
            }
            Ok(match param {
                ParamId::ChannelName => ParamValue::Text(format!("Ch{channel}")),
                ParamId::RangeMin => ParamValue::Float(-100.0),
                ParamId::RangeMax => ParamValue::Float(100.0),
                ParamId::SampleRate => ParamValue::Float(250.0),
                ParamId::ChannelLabel => ParamValue::Text("A".to_string()),
                ParamId::ChannelTransducer => ParamValue::Text("Electrode".to_string()),
                _ => ParamValue::Int(0),
            })
        }

        fn set_param(
            &mut self,
            param: ParamId,
            channel: usize,
            value: ParamValue,
        ) -> Result<(), DriverError> {
            self.0
                .lock()
                .unwrap()
                .calls
                .push(format!("set {param:?} {channel} {value}"));
            Ok(())
        }

        fn set_param_text(
            &mut self,
            param: ParamId,
            channel: usize,
            text: &str,
        ) -> Result<(), DriverError> {
            let mut script = self.0.lock().unwrap();
            if script.fail_profile.as_deref() == Some(text) {
                return Err(DriverError::Status(-4));
            }
            script.calls.push(format!("set {param:?} {channel} {text}"));
            Ok(())
        }

        fn read_sample(&mut self, _channel: usize) -> Result<f64, DriverError> {
            Ok(self.0.lock().unwrap().sample)
        }

        fn start_measurement(&mut self) -> Result<(), DriverError> {
            match self.0.lock().unwrap().start.clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn stop_measurement(&mut self) -> Result<(), DriverError> {
            self.0.lock().unwrap().calls.push("stop".to_string());
            Ok(())
        }

        fn close(&mut self) {
            self.0.lock().unwrap().calls.push("close".to_string());
        }
    }

    struct ScriptedLoader(Arc<Mutex<Script>>);

    impl DriverLoader for ScriptedLoader {
        fn library(&self) -> &str {
            "scripted"
        }

        fn load(&self) -> Option<Box<dyn DriverApi>> {
            Some(Box::new(ScriptedDriver(Arc::clone(&self.0))))
        }
    }

    fn scripted(script: Script) -> (Device, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(script));
        let loader = ScriptedLoader(Arc::clone(&script));
        (Device::new(Backend::neurobit(Arc::new(loader))), script)
    }

    #[test]
    fn test_missing_library() {
        let mut device = Device::new(Backend::neurobit(Arc::new(NoDriver::new("NeurobitDrv64"))));
        assert!(matches!(
            device.initialize(),
            Err(DeviceError::LibraryNotLoaded { ref driver }) if driver == "NeurobitDrv64"
        ));
        assert_eq!(device.state(), DeviceState::Error);
    }

    #[test]
    fn test_open_and_channel_count_failures() {
        let (mut device, _) = scripted(Script {
            fail_open: true,
            ..Script::default()
        });
        assert!(matches!(device.initialize(), Err(DeviceError::DeviceNotOpen { .. })));

        let (mut device, _) = scripted(Script {
            fail_count: true,
            ..Script::default()
        });
        assert!(matches!(device.initialize(), Err(DeviceError::DeviceChannelsNotGet)));
    }

    #[test]
    fn test_bindings_are_pushed_in_driver_mode() {
        let (mut device, script) = scripted(Script::default());
        device.initialize().unwrap();
        device.set_retrieve_mode(RetrieveMode::Driver).unwrap();
        device.add_signal_chosen("EEG", 2).unwrap();

        let script = script.lock().unwrap();
        let calls = &script.calls;
        assert_eq!(calls[0], "open Neurobit Optima+ 4 USB");
        assert!(calls.contains(&"set ChannelEnable 2 true".to_string()));
        assert!(calls.contains(&"set ChannelProfile 2 EEG".to_string()));
    }

    #[test]
    fn test_failed_profile_restores_binding() {
        let (mut device, script) = scripted(Script {
            fail_profile: Some("EMG".to_string()),
            ..Script::default()
        });
        device.initialize().unwrap();
        device.set_retrieve_mode(RetrieveMode::Driver).unwrap();
        device.add_signal_chosen("EKG", 0).unwrap();

        assert!(matches!(
            device.add_signal_chosen("EMG", 0),
            Err(DeviceError::DeviceProfileNotSet { channel: 0, .. })
        ));
        assert_eq!(device.catalog().channel_of("EKG"), Some(0));
        assert_eq!(device.catalog().channel_of("EMG"), None);

        let script = script.lock().unwrap();
        let pushes = script
            .calls
            .iter()
            .filter(|call| *call == "set ChannelProfile 0 EKG")
            .count();
        assert_eq!(pushes, 2);
    }

    #[test]
    fn test_failed_unbind_restores_binding() {
        let (mut device, script) = scripted(Script::default());
        device.initialize().unwrap();
        device.set_retrieve_mode(RetrieveMode::Driver).unwrap();
        device.add_signal_chosen("EKG", 0).unwrap();
        device.add_signal_chosen("GSR", 1).unwrap();

        script.lock().unwrap().fail_profile = Some("GSR".to_string());
        assert!(matches!(
            device.remove_signal_chosen(0),
            Err(DeviceError::DeviceProfileNotSet { channel: 1, .. })
        ));
        assert_eq!(device.catalog().channel_of("EKG"), Some(0));
        assert_eq!(device.catalog().channel_of("GSR"), Some(1));

        script.lock().unwrap().fail_profile = None;
        assert_eq!(device.remove_signal_chosen(0).unwrap(), Some("EKG".to_string()));
        assert_eq!(device.catalog().channel_of("EKG"), None);
    }

    #[test]
    fn test_start_failures() {
        let (mut device, script) = scripted(Script {
            start: Some(DriverError::Refused(1)),
            ..Script::default()
        });
        device.initialize().unwrap();
        device.set_retrieve_mode(RetrieveMode::Driver).unwrap();
        assert!(matches!(
            device.start(),
            Err(DeviceError::DeviceMeasurementCannotStart)
        ));

        script.lock().unwrap().start = Some(DriverError::Status(-1));
        assert!(matches!(device.start(), Err(DeviceError::DeviceNotConnected)));
        assert_eq!(device.state(), DeviceState::Initialized);
    }

    #[test]
    fn test_driver_read_end_to_end() {
        let (mut device, _) = scripted(Script {
            sample: 64.0,
            ..Script::default()
        });
        device.initialize().unwrap();
        device.add_signal_chosen("EKG", 0).unwrap();
        device.set_retrieve_mode(RetrieveMode::Driver).unwrap();
        device.start().unwrap();

        assert!(device.retrieve().unwrap());
        assert_eq!(device.convert(), 1);
        assert_eq!(device.catalog().signal("EKG").unwrap().latest().unwrap().1, 64.0);

        let info = device.catalog().channel(1).unwrap().info().unwrap();
        assert_eq!(info.name, "Ch1");
        assert!((info.sample_rate - 250.0).abs() < f64::EPSILON);
        assert_eq!(info.sensor, "Electrode");
    }

    #[test]
    fn test_read_abandoned_at_threshold() {
        let (mut device, script) = scripted(Script::default());
        device.initialize().unwrap();
        device.set_channel_state(1, false).unwrap();
        device.set_channel_state(2, false).unwrap();
        device.set_channel_state(3, false).unwrap();
        device.set_retrieve_mode(RetrieveMode::Driver).unwrap();
        device.start().unwrap();
        script.lock().unwrap().fail_param = Some(ParamId::RangeMax);

        for _ in 0..9 {
            assert!(!device.retrieve().unwrap());
        }
        assert!(device.check_device_state().is_ok());

        assert!(matches!(
            device.retrieve(),
            Err(DeviceError::DeviceMeasurementReadError { channel: 0, field: "Max" })
        ));
        assert!(device.check_device_state().is_err());
    }

    #[test]
    fn test_close_releases_driver() {
        let (mut device, script) = scripted(Script::default());
        device.initialize().unwrap();
        device.close();

        let script = script.lock().unwrap();
        let calls = &script.calls;
        assert_eq!(calls[calls.len() - 2..], ["stop".to_string(), "close".to_string()]);
    }
}
