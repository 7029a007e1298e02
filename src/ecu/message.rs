use crate::ecu::models::{InverterModel, ModelCatalog, UNKNOWN_MODEL};
use crate::error::RejectReason;

use chrono::NaiveDateTime;
use serde::Serialize;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub const MAGIC: &[u8] = b"APS18AA";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const TERMINATOR: &[u8] = b"END";

// ECU header, absolute offsets
const CHECKSUM: Range<usize> = 7..10;
const ECU_ID: Range<usize> = 18..30;
const ECU_MODEL_CODE: Range<usize> = 18..22;
const CURRENT_POWER: Range<usize> = 30..42;
const LIFETIME_ENERGY: Range<usize> = 42..60;
const TIMESTAMP: Range<usize> = 60..74;
const ONLINE_INVERTERS: Range<usize> = 74..77;

// inverter blocks, relative to the start of each terminator
const INVERTER_UID: Range<usize> = 3..15;
const INVERTER_MODEL_CODE: Range<usize> = 3..6;
const INVERTER_FREQUENCY: Range<usize> = 20..25;
const INVERTER_TEMPERATURE: Range<usize> = 25..28;
const POWER_CHANNELS: [usize; 4] = [63, 83, 103, 123];
const VOLTAGE_CHANNELS: [usize; 4] = [51, 71, 91, 111];
const CURRENT_CHANNELS: [usize; 4] = [60, 80, 100, 120];
const CHANNEL_WIDTH: usize = 3;

/// One decoded APS18AA message.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EcuReading {
    pub timestamp: NaiveDateTime,
    pub ecu_id: String,
    pub ecu_model: String,
    /// kWh
    pub lifetime_energy: f64,
    /// W
    pub current_power: f64,
    pub qty_online_inverters: u16,
    /// Keyed by uid, in the order the inverters first appear in the frame.
    pub inverters: Vec<InverterReading>,
}

impl EcuReading {
    pub fn inverter(&self, uid: &str) -> Option<&InverterReading> {
        self.inverters.iter().find(|i| i.uid == uid)
    }

    pub fn inverter_uids(&self) -> Vec<&str> {
        self.inverters.iter().map(|i| i.uid.as_str()).collect()
    }

    // a uid seen twice in one frame keeps its first slot but takes the later values
    fn upsert_inverter(&mut self, inverter: InverterReading) {
        match self.inverters.iter_mut().find(|i| i.uid == inverter.uid) {
            Some(existing) => *existing = inverter,
            None => self.inverters.push(inverter),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InverterReading {
    pub uid: String,
    pub index: usize,
    pub model: String,
    pub channel_qty: usize,
    /// °C
    pub temperature: i32,
    /// Hz
    pub frequency: f64,
    /// W, one per channel
    pub power: Vec<i32>,
    /// V, one per channel
    pub voltage: Vec<f64>,
    /// A, one per channel
    pub current: Vec<f64>,
}

/// Decodes raw ECU frames into [`EcuReading`]s.
///
/// Holds no state between calls apart from the shared, immutable model
/// catalog, so one decoder can be cloned into every connection.
#[derive(Clone, Debug)]
pub struct MessageDecoder {
    catalog: Arc<ModelCatalog>,
    max_age: Duration,
}

impl MessageDecoder {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        Self {
            catalog,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn decode(&self, frame: &[u8], now: NaiveDateTime) -> Result<EcuReading, RejectReason> {
        if !frame.starts_with(MAGIC) {
            return Err(RejectReason::NotRecognized);
        }

        let declared: usize = number(frame, CHECKSUM, "checksum")?;
        let actual = frame.len() - 1;
        if declared != actual {
            return Err(RejectReason::ChecksumMismatch { declared, actual });
        }

        let raw_timestamp = field(frame, TIMESTAMP, "timestamp")?;
        let timestamp = NaiveDateTime::parse_from_str(raw_timestamp, TIMESTAMP_FORMAT)
            .map_err(|_| RejectReason::field("timestamp", raw_timestamp.as_bytes()))?;

        // ECUs replay buffered history to the collector; only current data is useful locally
        if let Ok(age) = now.signed_duration_since(timestamp).to_std() {
            if age > self.max_age {
                return Err(RejectReason::Stale {
                    age_secs: age.as_secs(),
                });
            }
        }

        let ecu_id = field(frame, ECU_ID, "ecu id")?.to_owned();
        let ecu_model = self
            .catalog
            .ecu_model(field(frame, ECU_MODEL_CODE, "ecu model")?)
            .unwrap_or(UNKNOWN_MODEL)
            .to_owned();
        let lifetime_energy = number::<i64>(frame, LIFETIME_ENERGY, "lifetime energy")? as f64 / 10.0;
        let current_power = number::<i64>(frame, CURRENT_POWER, "current power")? as f64 / 100.0;
        let qty_online_inverters = number(frame, ONLINE_INVERTERS, "online inverters")?;

        let mut reading = EcuReading {
            timestamp,
            ecu_id,
            ecu_model,
            lifetime_energy,
            current_power,
            qty_online_inverters,
            inverters: Vec::new(),
        };

        for (index, start) in terminator_positions(frame).into_iter().enumerate() {
            if let Some(inverter) = self.inverter(frame, start, index)? {
                reading.upsert_inverter(inverter);
            }
        }

        Ok(reading)
    }

    fn inverter(
        &self,
        frame: &[u8],
        start: usize,
        index: usize,
    ) -> Result<Option<InverterReading>, RejectReason> {
        let at = |range: Range<usize>| start + range.start..start + range.end;

        let uid = field(frame, at(INVERTER_UID), "inverter uid")?.to_owned();
        let temperature = number::<i32>(frame, at(INVERTER_TEMPERATURE), "inverter temperature")? - 100;
        let frequency = number::<i64>(frame, at(INVERTER_FREQUENCY), "inverter frequency")? as f64 / 10.0;

        let model_code = field(frame, at(INVERTER_MODEL_CODE), "inverter model")?;
        let Some(model) = self.catalog.inverter_model(model_code) else {
            return Ok(None);
        };

        Ok(Some(InverterReading {
            uid,
            index,
            model: model.name.to_owned(),
            channel_qty: model.channels,
            temperature,
            frequency,
            power: channels(frame, start, model, &POWER_CHANNELS, "inverter power")?,
            voltage: channels::<i64>(frame, start, model, &VOLTAGE_CHANNELS, "inverter voltage")?
                .into_iter()
                .map(|v| v as f64 / 10.0)
                .collect(),
            current: channels::<i64>(frame, start, model, &CURRENT_CHANNELS, "inverter current")?
                .into_iter()
                .map(|c| c as f64 / 100.0)
                .collect(),
        }))
    }
}

/// Start offsets of every `END<digits>` terminator, leftmost first and
/// non-overlapping: a match consumes its whole digit run before scanning on.
pub fn terminator_positions(frame: &[u8]) -> Vec<usize> {
    let mut positions = Vec::new();
    let mut i = 0;

    while i + TERMINATOR.len() < frame.len() {
        if frame[i..].starts_with(TERMINATOR) && frame[i + TERMINATOR.len()].is_ascii_digit() {
            positions.push(i);
            i += TERMINATOR.len();
            while i < frame.len() && frame[i].is_ascii_digit() {
                i += 1;
            }
        } else {
            i += 1;
        }
    }

    positions
}

fn field<'a>(frame: &'a [u8], range: Range<usize>, name: &'static str) -> Result<&'a str, RejectReason> {
    let bytes = frame
        .get(range.clone())
        .ok_or_else(|| RejectReason::field(name, frame.get(range.start..).unwrap_or_default()))?;

    std::str::from_utf8(bytes).map_err(|_| RejectReason::field(name, bytes))
}

fn number<T: FromStr>(frame: &[u8], range: Range<usize>, name: &'static str) -> Result<T, RejectReason> {
    let text = field(frame, range, name)?;
    text.trim()
        .parse()
        .map_err(|_| RejectReason::field(name, text.as_bytes()))
}

fn channels<T: FromStr>(
    frame: &[u8],
    start: usize,
    model: &InverterModel,
    offsets: &[usize],
    name: &'static str,
) -> Result<Vec<T>, RejectReason> {
    offsets
        .iter()
        .take(model.channels)
        .map(|offset| {
            let from = start + offset;
            number(frame, from..from + CHANNEL_WIDTH, name)
        })
        .collect()
}
