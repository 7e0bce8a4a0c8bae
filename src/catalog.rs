use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::channel::{Channel, ChannelFunction, ChannelInfo, Range};
use crate::error::DeviceError;
use crate::signal::Signal;

/// Signals a device can measure, the channels they are bound to and the
/// samples collected for each of them.
///
/// Every available signal owns one [`Signal`] history for the whole session.
/// The number of channels is fixed at construction and each signal is bound to
/// at most one channel.
#[derive(Debug, Clone)]
pub struct SignalCatalog {
    available: Vec<String>,
    frequencies: Vec<f64>,
    channels: Vec<Channel>,
    signals: HashMap<String, Signal>,
}

impl SignalCatalog {
    pub fn new(available: &[&str], frequencies: &[f64], channels_number: usize) -> Self {
        let default_frequency = frequencies.first().copied().unwrap_or(1.0);
        let signals = available
            .iter()
            .map(|name| ((*name).to_string(), Signal::new(*name, default_frequency)))
            .collect();

        Self {
            available: available.iter().map(|s| (*s).to_string()).collect(),
            frequencies: frequencies.to_vec(),
            channels: (0..channels_number).map(Channel::new).collect(),
            signals,
        }
    }

    pub fn channels_number(&self) -> usize {
        self.channels.len()
    }

    pub fn available(&self) -> &[String] {
        &self.available
    }

    /// Sample rates the device offers for its signals.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Enable flags in channel order.
    pub fn channels_enable(&self) -> Vec<bool> {
        self.channels.iter().map(|c| c.enabled).collect()
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        self.channels.get(index).is_some_and(|c| c.enabled)
    }

    pub fn signal(&self, name: &str) -> Option<&Signal> {
        self.signals.get(name)
    }

    /// Channel a signal is currently bound to.
    pub fn channel_of(&self, name: &str) -> Option<usize> {
        self.channels
            .iter()
            .find(|c| c.signal.as_deref() == Some(name))
            .map(|c| c.index)
    }

    /// Bound signals in channel order, with the channel they sit on.
    pub fn chosen(&self) -> impl Iterator<Item = (&Channel, &Signal)> {
        self.channels.iter().filter_map(|channel| {
            channel
                .signal
                .as_deref()
                .and_then(|name| self.signals.get(name))
                .map(|signal| (channel, signal))
        })
    }

    /// Bind `signal` to channel `index`.
    ///
    /// Returns the signal previously bound at `index`, which becomes unassigned.
    /// If `signal` is already bound to another channel nothing changes and the
    /// error carries the signal that stays at `index`.
    pub fn add_signal_chosen(
        &mut self,
        signal: &str,
        index: usize,
    ) -> Result<Option<String>, DeviceError> {
        self.check_index(index)?;
        if !self.signals.contains_key(signal) {
            return Err(DeviceError::UnknownSignal {
                signal: signal.to_string(),
            });
        }

        match self.channel_of(signal) {
            Some(chosen_at) if chosen_at == index => Ok(None),
            Some(chosen_at) => Err(DeviceError::SignalIsChosen {
                signal: signal.to_string(),
                chosen_at,
                occupant: self.channels[index].signal.clone(),
            }),
            None => {
                let previous = self.channels[index].signal.replace(signal.to_string());
                log::debug!(
                    "Channel {} now carries {} (was {:?})",
                    index,
                    signal,
                    previous
                );
                Ok(previous)
            }
        }
    }

    /// Unbind whatever signal sits on channel `index`.
    pub fn remove_signal_chosen(&mut self, index: usize) -> Result<Option<String>, DeviceError> {
        self.check_index(index)?;
        Ok(self.channels[index].signal.take())
    }

    /// Disabled channels keep their history but stop receiving samples.
    pub fn set_channel_state(&mut self, index: usize, enabled: bool) -> Result<(), DeviceError> {
        self.check_index(index)?;
        self.channels[index].enabled = enabled;
        Ok(())
    }

    pub fn set_channel_function(
        &mut self,
        index: usize,
        function: ChannelFunction,
    ) -> Result<(), DeviceError> {
        self.check_index(index)?;
        self.channels[index].function = function;
        Ok(())
    }

    pub fn set_range(&mut self, index: usize, min: f64, max: f64) -> Result<(), DeviceError> {
        self.check_index(index)?;
        if min.is_nan() || max.is_nan() || min > max {
            return Err(DeviceError::InvalidRange { min, max });
        }
        self.channels[index].range = Range { min, max };
        Ok(())
    }

    pub(crate) fn set_channel_info(&mut self, index: usize, info: ChannelInfo) {
        if let Some(channel) = self.channels.get_mut(index) {
            channel.info = Some(info);
        }
    }

    /// Set the sample rate of `signal`. Only the device's frequency choices
    /// are accepted.
    pub fn set_frequency(&mut self, signal: &str, frequency: f64) -> Result<(), DeviceError> {
        if !self
            .frequencies
            .iter()
            .any(|choice| (choice - frequency).abs() < f64::EPSILON)
        {
            return Err(DeviceError::InvalidFrequency { frequency });
        }
        let entry = self
            .signals
            .get_mut(signal)
            .ok_or_else(|| DeviceError::UnknownSignal {
                signal: signal.to_string(),
            })?;
        entry.set_frequency(frequency);
        Ok(())
    }

    /// Record a decoded sample. Samples for disabled channels or signals the
    /// device does not know are ignored.
    pub fn append(
        &mut self,
        channel: usize,
        signal: &str,
        timestamp: NaiveDateTime,
        value: f64,
    ) -> bool {
        if !self.is_enabled(channel) {
            log::debug!("Skipping {} on disabled channel {}", signal, channel);
            return false;
        }
        match self.signals.get_mut(signal) {
            Some(entry) => entry.push(timestamp, value),
            None => {
                log::debug!("Skipping unknown signal {} on channel {}", signal, channel);
                false
            }
        }
    }

    fn check_index(&self, index: usize) -> Result<(), DeviceError> {
        if index >= self.channels.len() {
            return Err(DeviceError::ChannelOutOfRange {
                index,
                channels: self.channels.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn catalog() -> SignalCatalog {
        SignalCatalog::new(&["EKG", "BVP", "HRV", "GSR"], &[62.5, 125.0], 4)
    }

    fn at(ms: i64) -> NaiveDateTime {
        DateTime::from_timestamp_millis(ms).unwrap().naive_utc()
    }

    #[test]
    fn test_add_signal_chosen_replaces_occupant() {
        let mut catalog = catalog();
        assert_eq!(catalog.add_signal_chosen("EKG", 0).unwrap(), None);
        assert_eq!(
            catalog.add_signal_chosen("GSR", 0).unwrap(),
            Some("EKG".to_string())
        );
        assert_eq!(catalog.channel_of("EKG"), None);
        assert_eq!(catalog.channel_of("GSR"), Some(0));
    }

    #[test]
    fn test_add_signal_chosen_rejects_duplicate() {
        let mut catalog = catalog();
        catalog.add_signal_chosen("EKG", 0).unwrap();
        catalog.add_signal_chosen("BVP", 1).unwrap();
        let before = catalog.channels().to_vec();

        let err = catalog.add_signal_chosen("EKG", 1).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::SignalIsChosen { ref signal, chosen_at: 0, ref occupant }
                if signal == "EKG" && occupant.as_deref() == Some("BVP")
        ));
        assert_eq!(catalog.channels(), before.as_slice());
    }

    #[test]
    fn test_add_signal_chosen_same_index_is_noop() {
        let mut catalog = catalog();
        catalog.add_signal_chosen("HRV", 2).unwrap();
        assert_eq!(catalog.add_signal_chosen("HRV", 2).unwrap(), None);
        assert_eq!(catalog.channel_of("HRV"), Some(2));
    }

    #[test]
    fn test_add_signal_chosen_validates_input() {
        let mut catalog = catalog();
        assert!(matches!(
            catalog.add_signal_chosen("EEG", 0),
            Err(DeviceError::UnknownSignal { .. })
        ));
        assert!(matches!(
            catalog.add_signal_chosen("EKG", 4),
            Err(DeviceError::ChannelOutOfRange { index: 4, channels: 4 })
        ));
    }

    #[test]
    fn test_disabled_channel_keeps_history() {
        let mut catalog = catalog();
        catalog.add_signal_chosen("EKG", 0).unwrap();
        assert!(catalog.append(0, "EKG", at(1), 70.0));

        catalog.set_channel_state(0, false).unwrap();
        assert!(!catalog.append(0, "EKG", at(2), 71.0));
        assert_eq!(catalog.signal("EKG").unwrap().len(), 1);
        assert_eq!(catalog.channels_enable(), vec![false, true, true, true]);
    }

    #[test]
    fn test_chosen_in_channel_order() {
        let mut catalog = catalog();
        catalog.add_signal_chosen("GSR", 3).unwrap();
        catalog.add_signal_chosen("EKG", 1).unwrap();

        let names: Vec<&str> = catalog.chosen().map(|(_, s)| s.name()).collect();
        assert_eq!(names, vec!["EKG", "GSR"]);
    }

    #[test]
    fn test_set_range_and_frequency() {
        let mut catalog = catalog();
        catalog.set_range(0, 10.0, 20.0).unwrap();
        assert_eq!(catalog.channel(0).unwrap().range(), Range { min: 10.0, max: 20.0 });
        assert!(catalog.set_range(0, 30.0, 20.0).is_err());

        catalog.set_frequency("EKG", 125.0).unwrap();
        assert!((catalog.signal("EKG").unwrap().frequency() - 125.0).abs() < f64::EPSILON);
        assert!(catalog.set_frequency("EKG", 0.0).is_err());
        assert!(matches!(
            catalog.set_frequency("UNKNOWN", 125.0),
            Err(DeviceError::UnknownSignal { .. })
        ));
    }

    #[test]
    fn test_frequency_outside_choices_is_rejected() {
        let mut catalog = catalog();
        for frequency in [3.0, 250.0, 1e-30, f64::NAN, f64::INFINITY, -62.5] {
            assert!(matches!(
                catalog.set_frequency("EKG", frequency),
                Err(DeviceError::InvalidFrequency { .. })
            ));
        }
        assert!((catalog.signal("EKG").unwrap().frequency() - 62.5).abs() < f64::EPSILON);
    }
}
