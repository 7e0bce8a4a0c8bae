use std::time::{Duration, Instant};

use chrono::Utc;

use crate::catalog::SignalCatalog;
use crate::codec::RetrieveFrame;
use crate::generator::{SignalGenerator, Waveform};

const GAIN: f64 = 40.0;
const OFFSET: f64 = 50.0;

/// Generator bound to one channel and the schedule of its next sample.
#[derive(Debug, Clone)]
struct ChannelSource {
    signal: String,
    generator: SignalGenerator,
    period: Duration,
    last: Instant,
}

impl ChannelSource {
    fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.period
    }
}

/// Synthetic device producing waveforms on every bound channel.
#[derive(Debug, Clone, Default)]
pub struct DeviceSimulator {
    sources: Vec<Option<ChannelSource>>,
}

impl DeviceSimulator {
    pub const CODE: &'static str = "DeviceSimulator";
    pub const NAME: &'static str = "DeviceSimulator";
    pub const CHANNELS: usize = 4;
    pub const SIGNALS: &'static [&'static str] = &["EKG", "BVP", "HRV", "GSR"];
    pub const FREQUENCIES: &'static [f64] = &[62.5, 125.0, 250.0, 500.0, 1000.0, 2000.0];

    pub fn new() -> Self {
        Self::default()
    }

    /// Waveform and its rate in Hz used for `signal`.
    fn waveform_for(signal: &str) -> (Waveform, f64) {
        match signal {
            "EKG" => (Waveform::Ekg, 1.2),
            "BVP" => (Waveform::Sine, 1.2),
            "HRV" => (Waveform::Triangle, 0.1),
            _ => (Waveform::Sine, 0.05),
        }
    }

    /// Time between two samples. Rates too small to schedule never come due.
    fn period(frequency: f64) -> Duration {
        Duration::try_from_secs_f64(1.0 / frequency).unwrap_or(Duration::MAX)
    }

    /// Rebuild the generators for the current bindings, all in phase with the
    /// first bound channel.
    pub fn configure(&mut self, catalog: &SignalCatalog) {
        self.configure_at(catalog, Instant::now());
    }

    pub fn configure_at(&mut self, catalog: &SignalCatalog, now: Instant) {
        let mut reference: Option<SignalGenerator> = None;
        self.sources = catalog
            .channels()
            .iter()
            .map(|channel| {
                let name = channel.signal()?;
                let signal = catalog.signal(name)?;
                let (waveform, wave_hz) = Self::waveform_for(name);

                let mut generator = SignalGenerator::new(waveform, wave_hz, now);
                match &reference {
                    Some(first) => generator.synchronize(first),
                    None => reference = Some(generator.clone()),
                }

                Some(ChannelSource {
                    signal: name.to_string(),
                    generator,
                    period: Self::period(signal.frequency()),
                    last: now,
                })
            })
            .collect();
        log::debug!(
            "Simulator configured with {} sources",
            self.sources.iter().flatten().count()
        );
    }

    /// Restart the generator and schedule of the channel carrying `signal`.
    pub fn frequency_changed(&mut self, catalog: &SignalCatalog, signal: &str) {
        self.frequency_changed_at(catalog, signal, Instant::now());
    }

    pub fn frequency_changed_at(&mut self, catalog: &SignalCatalog, signal: &str, now: Instant) {
        let Some(frequency) = catalog.signal(signal).map(|s| s.frequency()) else {
            return;
        };
        for source in self.sources.iter_mut().flatten() {
            if source.signal == signal {
                source.generator.reset(now);
                source.period = Self::period(frequency);
                source.last = now;
            }
        }
    }

    pub fn read_frame(&mut self, _catalog: &SignalCatalog) -> Option<RetrieveFrame> {
        self.generate_frame(Instant::now(), Utc::now().timestamp_millis())
    }

    /// One record holding a sample for every source whose period elapsed
    /// since its last sample, or `None` if no source is due.
    pub fn generate_frame(&mut self, now: Instant, timestamp_ms: i64) -> Option<RetrieveFrame> {
        let mut frame = RetrieveFrame::new(timestamp_ms);
        for (index, source) in self.sources.iter_mut().enumerate() {
            let Some(source) = source else {
                continue;
            };
            if !source.is_due(now) {
                continue;
            }
            source.last = now;
            let value = GAIN * source.generator.value_at(now) + OFFSET;
            frame.push(source.signal.clone(), value, index);
        }
        (!frame.is_empty()).then_some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SignalCatalog {
        let mut catalog = SignalCatalog::new(
            DeviceSimulator::SIGNALS,
            DeviceSimulator::FREQUENCIES,
            DeviceSimulator::CHANNELS,
        );
        catalog.add_signal_chosen("EKG", 0).unwrap();
        catalog.add_signal_chosen("GSR", 2).unwrap();
        catalog
    }

    #[test]
    fn test_nothing_due_before_first_period() {
        let catalog = catalog();
        let start = Instant::now();
        let mut simulator = DeviceSimulator::new();
        simulator.configure_at(&catalog, start);

        assert!(simulator.generate_frame(start, 0).is_none());
        assert!(simulator
            .generate_frame(start + Duration::from_millis(10), 0)
            .is_none());
    }

    #[test]
    fn test_emits_bound_channels_when_due() {
        let catalog = catalog();
        let start = Instant::now();
        let mut simulator = DeviceSimulator::new();
        simulator.configure_at(&catalog, start);

        let frame = simulator
            .generate_frame(start + Duration::from_millis(20), 42)
            .unwrap();
        assert_eq!(frame.timestamp_ms, 42);
        let channels: Vec<(usize, &str)> = frame
            .entries
            .iter()
            .map(|e| (e.channel, e.signal.as_str()))
            .collect();
        assert_eq!(channels, vec![(0, "EKG"), (2, "GSR")]);
        for entry in &frame.entries {
            assert!((OFFSET - GAIN..=OFFSET + GAIN).contains(&entry.value));
        }

        assert!(simulator
            .generate_frame(start + Duration::from_millis(25), 43)
            .is_none());
    }

    #[test]
    fn test_unschedulable_rate_never_comes_due() {
        assert_eq!(DeviceSimulator::period(1e-30), Duration::MAX);
        assert_eq!(DeviceSimulator::period(0.0), Duration::MAX);
        assert_eq!(DeviceSimulator::period(f64::NAN), Duration::MAX);
        assert_eq!(DeviceSimulator::period(2.0), Duration::from_millis(500));
    }

    #[test]
    fn test_frequency_change_resets_schedule() {
        let mut catalog = catalog();
        let start = Instant::now();
        let mut simulator = DeviceSimulator::new();
        simulator.configure_at(&catalog, start);

        catalog.set_frequency("GSR", 2000.0).unwrap();
        let changed = start + Duration::from_millis(10);
        simulator.frequency_changed_at(&catalog, "GSR", changed);

        let frame = simulator
            .generate_frame(changed + Duration::from_millis(1), 0)
            .unwrap();
        assert_eq!(frame.entries.len(), 1);
        assert_eq!(frame.entries[0].signal, "GSR");
    }
}
