use chrono::NaiveDateTime;
use serde_json::json;

use crate::catalog::SignalCatalog;
use crate::channel::RangeState;

const BATCH_OPEN: &str = "[";
const RECORD_SEPARATOR: &str = ",\n";
const BATCH_CLOSE: &str = "]@#";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// A classified reading built from the latest sample of one signal.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub signal: String,
    pub channel: usize,
    pub value: f64,
    pub timestamp: NaiveDateTime,
    pub unit: &'static str,
    pub range_state: RangeState,
}

/// Renders one observation as a record of the outbound batch.
pub trait ObservationFormatter: Send {
    fn format(&self, observation: &Observation) -> String;
}

/// Renders observations as single-line JSON `Observation` resources.
#[derive(Debug, Clone, Default)]
pub struct FhirFormatter {
    subject: Option<String>,
}

impl FhirFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference written into `subject`, e.g. `Patient/123`.
    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

impl ObservationFormatter for FhirFormatter {
    fn format(&self, observation: &Observation) -> String {
        let mut resource = json!({
            "resourceType": "Observation",
            "id": observation.signal,
            "status": "final",
            "category": [{
                "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/observation-category",
                    "code": "vital-signs",
                }]
            }],
            "code": { "text": observation.signal },
            "effectiveDateTime": observation.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            "interpretation": [{
                "coding": [{
                    "system": "http://terminology.hl7.org/CodeSystem/v3-ObservationInterpretation",
                    "code": observation.range_state.code(),
                    "display": observation.range_state.display(),
                }],
                "text": observation.range_state.display(),
            }],
            "valueQuantity": {
                "value": observation.value,
                "unit": observation.unit,
                "system": "http://unitsofmeasure.org",
                "code": observation.unit,
            }
        });
        if let Some(subject) = &self.subject {
            resource["subject"] = json!({ "reference": subject });
        }
        resource.to_string()
    }
}

/// Latest sample of every bound signal, in channel order.
///
/// Disabled channels and signals without samples are skipped.
pub fn build_observations(catalog: &SignalCatalog) -> Vec<Observation> {
    catalog
        .chosen()
        .filter(|(channel, _)| channel.is_enabled())
        .filter_map(|(channel, signal)| {
            signal.latest().map(|(timestamp, value)| Observation {
                signal: signal.name().to_string(),
                channel: channel.index(),
                value,
                timestamp,
                unit: channel.unit(),
                range_state: channel.range().classify(value),
            })
        })
        .collect()
}

/// Frame formatted records into one outbound message: `[r1,\nr2,\n]@#`.
pub fn frame_batch<I, S>(records: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut message = String::from(BATCH_OPEN);
    for record in records {
        message.push_str(record.as_ref());
        message.push_str(RECORD_SEPARATOR);
    }
    message.push_str(BATCH_CLOSE);
    message
}

/// Build, format and frame the observations of a device, or `None` when no
/// bound signal has a sample yet.
pub fn standardize(catalog: &SignalCatalog, formatter: &dyn ObservationFormatter) -> Option<String> {
    let observations = build_observations(catalog);
    if observations.is_empty() {
        return None;
    }
    Some(frame_batch(observations.iter().map(|o| formatter.format(o))))
}
