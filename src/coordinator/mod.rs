use crate::prelude::*;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;

#[derive(Default, Debug, Clone)]
pub struct ProxyStats {
    // Connection stats
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub bind_failures: u64,
    // Frame counters
    pub frames_received: u64,
    pub frames_forwarded: u64,
    pub forward_errors: u64,
    pub readings_decoded: u64,
    // Rejected frames
    pub not_recognized: u64,
    pub checksum_errors: u64,
    pub parse_errors: u64,
    pub stale_frames: u64,
    // Other stats
    pub readings_dispatched: u64,
    pub mqtt_messages_sent: u64,
    pub mqtt_errors: u64,
}

impl ProxyStats {
    pub fn frames_rejected(&self) -> u64 {
        self.not_recognized + self.checksum_errors + self.parse_errors + self.stale_frames
    }

    pub fn print_summary(&self) {
        info!("Proxy Statistics:");
        info!("  Connections:");
        info!("    Accepted: {}", self.connections_accepted);
        info!("    Active: {}", self.connections_active);
        info!("    Bind failures: {}", self.bind_failures);
        info!("  Frames:");
        info!("    Received: {}", self.frames_received);
        info!("    Forwarded: {}", self.frames_forwarded);
        info!("    Forward errors: {}", self.forward_errors);
        info!("    Decoded: {}", self.readings_decoded);
        info!("  Rejected: {}", self.frames_rejected());
        info!("    Not recognized: {}", self.not_recognized);
        info!("    Checksum errors: {}", self.checksum_errors);
        info!("    Parse errors: {}", self.parse_errors);
        info!("    Stale: {}", self.stale_frames);
        info!("  Readings dispatched: {}", self.readings_dispatched);
        info!("  MQTT:");
        info!("    Messages sent: {}", self.mqtt_messages_sent);
        info!("    Errors: {}", self.mqtt_errors);
    }
}

#[derive(Default, Debug)]
struct Registry {
    ecus: HashSet<String>,
    inverters: HashSet<String>,
}

/// Consumes decoded readings, remembers which ECUs and inverters have been
/// seen, and turns readings into MQTT state and discovery messages.
#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    pub stats: Arc<Mutex<ProxyStats>>,
    registry: Arc<Mutex<Registry>>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels, stats: Arc<Mutex<ProxyStats>>) -> Self {
        Self {
            config,
            channels,
            stats,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub async fn start(&self) -> Result<()> {
        use ecu::ChannelData::*;

        let mut receiver = self.channels.from_ecu.subscribe();

        loop {
            match receiver.recv().await {
                Ok(Reading(reading)) => {
                    if let Err(e) = self.process_reading(&reading) {
                        warn!("Failed to process reading from ECU {}: {}", reading.ecu_id, e);
                    }
                }
                Ok(Shutdown) => {
                    info!("Coordinator received shutdown signal");
                    break;
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Coordinator fell behind, {} readings skipped", n);
                }
                Err(RecvError::Closed) => break,
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.from_ecu.send(ecu::ChannelData::Shutdown);
    }

    pub fn process_reading(&self, reading: &EcuReading) -> Result<()> {
        debug!("RX: {:?}", reading);

        if let Ok(mut stats) = self.stats.lock() {
            stats.readings_dispatched += 1;
        }

        let (new_ecu, new_inverters) = self.unseen(reading);

        let mqtt_config = self.config.mqtt();
        if mqtt_config.enabled() && self.config.homeassistant_enabled() {
            let discovery = home_assistant::Discovery::new(&mqtt_config);

            if new_ecu {
                for message in discovery.ecu(reading)? {
                    self.publish_message(message)?;
                }
            }

            for inverter in &new_inverters {
                for message in discovery.inverter(&reading.ecu_id, inverter)? {
                    self.publish_message(message)?;
                }
            }
        }

        // only remembered once discovery went out, so a failed send is retried
        self.register(reading, new_ecu, &new_inverters);

        if !mqtt_config.enabled() {
            return Ok(());
        }

        for message in mqtt::Message::for_reading(mqtt_config.namespace(), reading)? {
            self.publish_message(message)?;
        }

        Ok(())
    }

    pub fn known_ecus(&self) -> Vec<String> {
        self.registry
            .lock()
            .map(|r| r.ecus.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn known_inverters(&self) -> Vec<String> {
        self.registry
            .lock()
            .map(|r| r.inverters.iter().cloned().collect())
            .unwrap_or_default()
    }

    // returns whether the ECU is new, and the inverters not seen before
    fn unseen<'a>(&self, reading: &'a EcuReading) -> (bool, Vec<&'a InverterReading>) {
        let Ok(registry) = self.registry.lock() else {
            warn!("Failed to lock device registry");
            return (false, Vec::new());
        };

        let new_ecu = !registry.ecus.contains(&reading.ecu_id);

        let new_inverters = reading
            .inverters
            .iter()
            .filter(|i| !registry.inverters.contains(&i.uid))
            .collect();

        (new_ecu, new_inverters)
    }

    fn register(&self, reading: &EcuReading, new_ecu: bool, new_inverters: &[&InverterReading]) {
        let Ok(mut registry) = self.registry.lock() else {
            warn!("Failed to lock device registry");
            return;
        };

        if new_ecu && registry.ecus.insert(reading.ecu_id.clone()) {
            info!("New ECU {} ({})", reading.ecu_id, reading.ecu_model);
        }

        for inverter in new_inverters {
            if registry.inverters.insert(inverter.uid.clone()) {
                info!(
                    "New inverter {} ({}, {} channels) on ECU {}",
                    inverter.uid, inverter.model, inverter.channel_qty, reading.ecu_id
                );
            }
        }
    }

    fn publish_message(&self, message: mqtt::Message) -> Result<()> {
        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Message(message))
            .is_err()
        {
            if let Ok(mut stats) = self.stats.lock() {
                stats.mqtt_errors += 1;
            }
            bail!("send(to_mqtt) failed - channel closed?");
        }

        Ok(())
    }
}
