#![allow(dead_code)]

pub use ecu_proxy::prelude::*;

use chrono::{NaiveDate, NaiveDateTime};
use ecu_proxy::ecu::connection::ConnectionHandler;
use ecu_proxy::ecu::forwarder::Forward;
use std::sync::{Arc, Mutex};

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn decoder() -> MessageDecoder {
    MessageDecoder::new(Arc::new(ModelCatalog::new()))
}

pub fn stats() -> Arc<Mutex<ProxyStats>> {
    Arc::new(Mutex::new(ProxyStats::default()))
}

pub fn handler(
    forwarder: Option<Arc<dyn Forward>>,
    channels: &Channels,
    stats: &Arc<Mutex<ProxyStats>>,
) -> ConnectionHandler {
    ConnectionHandler::new(decoder(), forwarder, channels.clone(), stats.clone())
}

/// Waits for the next reading on the ECU channel.
pub async fn next_reading(receiver: &mut ecu::Receiver) -> Result<EcuReading> {
    let data = tokio::time::timeout(std::time::Duration::from_secs(5), receiver.recv()).await??;
    match data {
        ecu::ChannelData::Reading(reading) => Ok(*reading),
        ecu::ChannelData::Shutdown => bail!("expected a reading, got shutdown"),
    }
}

pub fn fixed_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(12, 0, 0))
        .unwrap_or_default()
}

// ECU header is 77 characters, each inverter block 130, then a bare END\n
const BLOCK_LEN: usize = 130;

#[derive(Clone, Debug)]
pub struct InverterBlock {
    pub uid: String,
    /// tenths of a Hz
    pub frequency: u32,
    /// °C
    pub temperature: i32,
    /// W
    pub power: [u32; 4],
    /// tenths of a V
    pub voltage: [u32; 4],
    /// hundredths of an A
    pub current: [u32; 4],
}

impl InverterBlock {
    pub fn power(mut self, power: [u32; 4]) -> Self {
        self.power = power;
        self
    }

    pub fn voltage(mut self, voltage: [u32; 4]) -> Self {
        self.voltage = voltage;
        self
    }

    pub fn current(mut self, current: [u32; 4]) -> Self {
        self.current = current;
        self
    }

    pub fn temperature(mut self, temperature: i32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn frequency(mut self, frequency: u32) -> Self {
        self.frequency = frequency;
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut block = vec![b'0'; BLOCK_LEN];
        let mut put = |at: usize, text: String| block[at..at + text.len()].copy_from_slice(text.as_bytes());

        put(0, "END".to_string());
        put(3, format!("{:0>12}", self.uid));
        put(20, format!("{:05}", self.frequency));
        put(25, format!("{:03}", self.temperature + 100));

        for (ch, at) in [51, 71, 91, 111].into_iter().enumerate() {
            put(at, format!("{:03}", self.voltage[ch]));
        }
        for (ch, at) in [60, 80, 100, 120].into_iter().enumerate() {
            put(at, format!("{:03}", self.current[ch]));
        }
        for (ch, at) in [63, 83, 103, 123].into_iter().enumerate() {
            put(at, format!("{:03}", self.power[ch]));
        }

        block
    }
}

#[derive(Clone, Debug)]
pub struct FrameBuilder {
    pub ecu_id: String,
    pub current_power: String,
    pub lifetime_energy: String,
    pub timestamp: NaiveDateTime,
    pub online: u16,
    pub inverters: Vec<InverterBlock>,
    pub checksum: Option<usize>,
}

impl FrameBuilder {
    pub fn ecu_id(mut self, ecu_id: &str) -> Self {
        self.ecu_id = ecu_id.to_string();
        self
    }

    /// raw 12 digit field, hundredths of a W
    pub fn current_power(mut self, raw: &str) -> Self {
        self.current_power = raw.to_string();
        self
    }

    /// raw 18 digit field, tenths of a kWh
    pub fn lifetime_energy(mut self, raw: &str) -> Self {
        self.lifetime_energy = raw.to_string();
        self
    }

    pub fn timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn online(mut self, online: u16) -> Self {
        self.online = online;
        self
    }

    pub fn inverter(mut self, inverter: InverterBlock) -> Self {
        self.inverters.push(inverter);
        self
    }

    pub fn checksum(mut self, checksum: usize) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(b"APS18AA");
        frame.extend_from_slice(b"000");
        frame.extend_from_slice(b"00010001");
        frame.extend_from_slice(format!("{:>12}", self.ecu_id).as_bytes());
        frame.extend_from_slice(format!("{:0>12}", self.current_power).as_bytes());
        frame.extend_from_slice(format!("{:0>18}", self.lifetime_energy).as_bytes());
        frame.extend_from_slice(self.timestamp.format("%Y%m%d%H%M%S").to_string().as_bytes());
        frame.extend_from_slice(format!("{:03}", self.online).as_bytes());

        for inverter in &self.inverters {
            frame.extend(inverter.encode());
        }
        frame.extend_from_slice(b"END\n");

        let checksum = self.checksum.unwrap_or(frame.len() - 1);
        frame[7..10].copy_from_slice(format!("{:03}", checksum).as_bytes());

        frame
    }
}

pub struct Factory;

impl Factory {
    /// An ECU-R frame stamped now, with no inverters.
    pub fn frame() -> FrameBuilder {
        FrameBuilder {
            ecu_id: "216000012345".to_string(),
            current_power: "12345".to_string(),
            lifetime_energy: "12345".to_string(),
            timestamp: chrono::Local::now().naive_local(),
            online: 0,
            inverters: Vec::new(),
            checksum: None,
        }
    }

    pub fn inverter(uid: &str) -> InverterBlock {
        InverterBlock {
            uid: uid.to_string(),
            frequency: 500,
            temperature: 25,
            power: [0; 4],
            voltage: [0; 4],
            current: [0; 4],
        }
    }
}
