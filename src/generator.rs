use std::f64::consts::TAU;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum Waveform {
    Sine,
    Triangle,
    Ekg,
}

impl Waveform {
    /// Value in `[-1, 1]` at `phase` (fraction of a period, `[0, 1)`).
    pub fn sample(&self, phase: f64) -> f64 {
        match self {
            Self::Sine => (TAU * phase).sin(),
            Self::Triangle => 1.0 - 4.0 * (phase - 0.5).abs(),
            Self::Ekg => ekg(phase),
        }
    }
}

/// P, Q, R, S and T waves as gaussian bumps: (center, amplitude, width).
const EKG_WAVES: [(f64, f64, f64); 5] = [
    (0.10, 0.15, 0.025),
    (0.20, -0.10, 0.010),
    (0.23, 1.00, 0.010),
    (0.26, -0.20, 0.010),
    (0.45, 0.30, 0.040),
];

fn ekg(phase: f64) -> f64 {
    EKG_WAVES
        .iter()
        .map(|(center, amplitude, width)| {
            let d = (phase - center) / width;
            amplitude * (-0.5 * d * d).exp()
        })
        .sum()
}

/// Periodic test signal anchored to a start instant.
#[derive(Debug, Clone)]
pub struct SignalGenerator {
    waveform: Waveform,
    wave_hz: f64,
    origin: Instant,
}

impl SignalGenerator {
    pub fn new(waveform: Waveform, wave_hz: f64, origin: Instant) -> Self {
        Self {
            waveform,
            wave_hz,
            origin,
        }
    }

    pub fn waveform(&self) -> Waveform {
        self.waveform
    }

    /// Restart the waveform at phase zero.
    pub fn reset(&mut self, origin: Instant) {
        self.origin = origin;
    }

    /// Share the phase origin of `other`.
    pub fn synchronize(&mut self, other: &Self) {
        self.origin = other.origin;
    }

    pub fn value_at(&self, at: Instant) -> f64 {
        let elapsed = at.saturating_duration_since(self.origin).as_secs_f64();
        self.waveform.sample((elapsed * self.wave_hz).fract())
    }
}
