// Half-hourly GB generation mix published by NESO.
// https://www.neso.energy/data-portal/historic-generation-mix

use jiff::civil::DateTime;
use jiff::tz::TimeZone;
use jiff::Timestamp;
use log::info;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// One record as it comes back from the remote service, before any cleaning.
pub type RawRecord = Map<String, Value>;

/// Name of the key column, both remotely and in the local table.
pub const DATETIME: &str = "DATETIME";

/// Canonical text form of a timestamp, used as the primary key of the table.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    Gas,
    Coal,
    Nuclear,
    Wind,
    WindEmb,
    Hydro,
    Imports,
    Biomass,
    Other,
    Solar,
    Storage,
    Generation,
    CarbonIntensity,
}

impl Measurement {
    /// All measurements, in column order.
    pub const ALL: [Measurement; 13] = [
        Measurement::Gas,
        Measurement::Coal,
        Measurement::Nuclear,
        Measurement::Wind,
        Measurement::WindEmb,
        Measurement::Hydro,
        Measurement::Imports,
        Measurement::Biomass,
        Measurement::Other,
        Measurement::Solar,
        Measurement::Storage,
        Measurement::Generation,
        Measurement::CarbonIntensity,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            Measurement::Gas => "GAS",
            Measurement::Coal => "COAL",
            Measurement::Nuclear => "NUCLEAR",
            Measurement::Wind => "WIND",
            Measurement::WindEmb => "WIND_EMB",
            Measurement::Hydro => "HYDRO",
            Measurement::Imports => "IMPORTS",
            Measurement::Biomass => "BIOMASS",
            Measurement::Other => "OTHER",
            Measurement::Solar => "SOLAR",
            Measurement::Storage => "STORAGE",
            Measurement::Generation => "GENERATION",
            Measurement::CarbonIntensity => "CARBON_INTENSITY",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.column_name())
    }
}

/// The fixed, order-significant column list: the key followed by the
/// thirteen measurements.
pub fn columns() -> Vec<&'static str> {
    std::iter::once(DATETIME)
        .chain(Measurement::ALL.iter().map(|m| m.column_name()))
        .collect()
}

/// One timestamped row of generation/carbon-intensity measurements.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub timestamp: Timestamp,
    values: [Option<f64>; 13],
}

impl Observation {
    /// Non-finite values are stored as `None`.
    pub fn new(timestamp: Timestamp, values: [Option<f64>; 13]) -> Self {
        Observation {
            timestamp,
            values: values.map(|v| v.filter(|x| x.is_finite())),
        }
    }

    pub fn get(&self, measurement: Measurement) -> Option<f64> {
        self.values[measurement.index()]
    }

    /// Values in column order.
    pub fn values(&self) -> &[Option<f64>; 13] {
        &self.values
    }

    pub fn canonical_timestamp(&self) -> String {
        format_timestamp(&self.timestamp)
    }

    fn has_negative(&self) -> bool {
        self.values.iter().flatten().any(|x| *x < 0.0)
    }
}

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.strftime(TIMESTAMP_FORMAT).to_string()
}

/// Parse a timestamp as a UTC instant, truncated to whole seconds.
/// Values without an offset are taken to be UTC.
pub fn parse_timestamp(s: &str) -> Option<Timestamp> {
    let s = s.trim();
    let ts = match s.parse::<Timestamp>() {
        Ok(ts) => ts,
        Err(_) => s
            .parse::<DateTime>()
            .ok()?
            .to_zoned(TimeZone::UTC)
            .ok()?
            .timestamp(),
    };
    Timestamp::from_second(ts.as_second()).ok()
}

/// Coerce a raw field to a finite number.  Anything else is a null.
pub fn parse_value(value: Option<&Value>) -> Option<f64> {
    let x = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    x.is_finite().then_some(x)
}

fn parse_key(value: Option<&Value>) -> Option<Timestamp> {
    match value? {
        Value::String(s) => parse_timestamp(s),
        _ => None,
    }
}

/// What happened to the records of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub fetched: usize,
    pub bad_timestamp: usize,
    pub negative: usize,
    pub duplicates: usize,
    pub kept: usize,
}

impl fmt::Display for CleanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} kept of {} fetched ({} bad timestamp, {} negative, {} duplicate)",
            self.kept, self.fetched, self.bad_timestamp, self.negative, self.duplicates
        )
    }
}

/// Turn raw records into observations with unique, ascending timestamps.
///
/// Rows with an unparseable timestamp are dropped.  A bad measurement only
/// nulls that field.  When `reject_negative` is set, a row with any negative
/// measurement is dropped as a whole.  If a timestamp appears more than once
/// the last one in arrival order wins.
pub fn clean_records(records: &[RawRecord], reject_negative: bool) -> (Vec<Observation>, CleanReport) {
    let mut report = CleanReport {
        fetched: records.len(),
        ..Default::default()
    };

    let mut latest: HashMap<Timestamp, Observation> = HashMap::with_capacity(records.len());
    for record in records {
        let Some(timestamp) = parse_key(record.get(DATETIME)) else {
            report.bad_timestamp += 1;
            continue;
        };
        let values = Measurement::ALL.map(|m| parse_value(record.get(m.column_name())));
        let obs = Observation::new(timestamp, values);
        if reject_negative && obs.has_negative() {
            report.negative += 1;
            continue;
        }
        if latest.insert(timestamp, obs).is_some() {
            report.duplicates += 1;
        }
    }

    let mut out: Vec<Observation> = latest.into_values().collect();
    out.sort_by_key(|obs| obs.timestamp);
    report.kept = out.len();
    info!("After clean: {}", report);
    (out, report)
}
