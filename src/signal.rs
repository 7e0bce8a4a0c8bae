use chrono::NaiveDateTime;
use polars::prelude::*;
use std::io::Write;

const TIME_COLUMN_NAME: &str = "time_ms";
const VALUE_COLUMN_NAME: &str = "value";

/// A named physiological quantity and the samples collected for it this session.
///
/// Values are append-only and kept in time order; a sample whose timestamp is not
/// strictly after the latest one is rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    name: String,
    frequency: f64,
    values: Vec<(NaiveDateTime, f64)>,
}

/// Basic statistics over a signal's history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSummary {
    pub samples: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Signal {
    pub fn new(name: impl Into<String>, frequency: f64) -> Self {
        Self {
            name: name.into(),
            frequency,
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nominal sample rate in Hz. Informational only.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub(crate) fn set_frequency(&mut self, frequency: f64) {
        self.frequency = frequency;
    }

    /// Append a sample. Returns `false` when it would break time ordering.
    pub fn push(&mut self, timestamp: NaiveDateTime, value: f64) -> bool {
        if let Some((last, _)) = self.values.last() {
            if timestamp <= *last {
                log::debug!(
                    "Dropping {} sample at {} (latest is {})",
                    self.name,
                    timestamp,
                    last
                );
                return false;
            }
        }
        self.values.push((timestamp, value));
        true
    }

    pub fn latest(&self) -> Option<(NaiveDateTime, f64)> {
        self.values.last().copied()
    }

    pub fn values(&self) -> &[(NaiveDateTime, f64)] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// History as a two column frame: sample time in Unix milliseconds and value.
    pub fn to_frame(&self) -> PolarsResult<DataFrame> {
        let times: Vec<i64> = self
            .values
            .iter()
            .map(|(ts, _)| ts.and_utc().timestamp_millis())
            .collect();
        let values: Vec<f64> = self.values.iter().map(|(_, v)| *v).collect();

        DataFrame::new(vec![
            Series::new(TIME_COLUMN_NAME.into(), times).into(),
            Series::new(VALUE_COLUMN_NAME.into(), values).into(),
        ])
    }

    /// Min, max and mean of the history, or `None` when nothing was recorded.
    pub fn summary(&self) -> PolarsResult<Option<SignalSummary>> {
        if self.values.is_empty() {
            return Ok(None);
        }

        let stats = self
            .to_frame()?
            .lazy()
            .select([
                col(VALUE_COLUMN_NAME).min().alias("min"),
                col(VALUE_COLUMN_NAME).max().alias("max"),
                col(VALUE_COLUMN_NAME).mean().alias("mean"),
            ])
            .collect()?;

        let get = |name: &str| -> PolarsResult<f64> {
            Ok(stats.column(name)?.f64()?.get(0).unwrap_or(f64::NAN))
        };

        Ok(Some(SignalSummary {
            samples: self.values.len(),
            min: get("min")?,
            max: get("max")?,
            mean: get("mean")?,
        }))
    }

    /// Write the history as CSV with a header row.
    pub fn write_csv<W: Write>(&self, writer: W) -> PolarsResult<()> {
        let mut df = self.to_frame()?;
        CsvWriter::new(writer).include_header(true).finish(&mut df)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn at(ms: i64) -> NaiveDateTime {
        DateTime::from_timestamp_millis(ms).unwrap().naive_utc()
    }

    #[test]
    fn test_push_keeps_time_order() {
        let mut signal = Signal::new("EKG", 62.5);
        assert!(signal.push(at(1_000), 1.0));
        assert!(signal.push(at(2_000), 2.0));
        assert!(!signal.push(at(2_000), 3.0));
        assert!(!signal.push(at(1_500), 4.0));
        assert_eq!(signal.len(), 2);
        assert_eq!(signal.latest(), Some((at(2_000), 2.0)));
    }

    #[test]
    fn test_to_frame_columns() {
        let mut signal = Signal::new("GSR", 10.0);
        signal.push(at(10), 3.2);
        signal.push(at(20), 3.4);

        let df = signal.to_frame().unwrap();
        assert_eq!(df.height(), 2);
        let times: Vec<i64> = df
            .column(TIME_COLUMN_NAME)
            .unwrap()
            .i64()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(times, vec![10, 20]);
    }

    #[test]
    fn test_summary() {
        let mut signal = Signal::new("BVP", 10.0);
        assert!(signal.summary().unwrap().is_none());

        signal.push(at(1), 10.0);
        signal.push(at(2), 20.0);
        signal.push(at(3), 30.0);

        let summary = signal.summary().unwrap().unwrap();
        assert_eq!(summary.samples, 3);
        assert!((summary.min - 10.0).abs() < f64::EPSILON);
        assert!((summary.max - 30.0).abs() < f64::EPSILON);
        assert!((summary.mean - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_write_csv() {
        let mut signal = Signal::new("HRV", 1.0);
        signal.push(at(5), 1.5);

        let mut out = Vec::new();
        signal.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("time_ms,value"));
        assert!(text.contains("5,1.5"));
    }
}
