use crate::prelude::*;

use chrono::NaiveDateTime;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_PUBLISH_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub fn lwt_topic(namespace: &str) -> String {
    format!("{}/LWT", namespace)
}

pub fn ecu_state_topic(namespace: &str, ecu_id: &str) -> String {
    format!("{}/ecu/{}/state", namespace, ecu_id)
}

pub fn inverter_state_topic(namespace: &str, uid: &str) -> String {
    format!("{}/inverter/{}/state", namespace, uid)
}

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

#[derive(Serialize)]
struct EcuState<'a> {
    timestamp: NaiveDateTime,
    ecu_id: &'a str,
    ecu_model: &'a str,
    lifetime_energy: f64,
    current_power: f64,
    qty_online_inverters: u16,
    inverters: Vec<&'a str>,
}

#[derive(Serialize)]
struct InverterState<'a> {
    ecu_id: &'a str,
    timestamp: NaiveDateTime,
    #[serde(flatten)]
    inverter: &'a InverterReading,
}

impl Message {
    /// State messages for one reading: the ECU first, then each inverter.
    pub fn for_reading(namespace: &str, reading: &EcuReading) -> Result<Vec<Message>> {
        let mut r = Vec::with_capacity(reading.inverters.len() + 1);

        let ecu = EcuState {
            timestamp: reading.timestamp,
            ecu_id: &reading.ecu_id,
            ecu_model: &reading.ecu_model,
            lifetime_energy: reading.lifetime_energy,
            current_power: reading.current_power,
            qty_online_inverters: reading.qty_online_inverters,
            inverters: reading.inverter_uids(),
        };
        r.push(Message {
            topic: ecu_state_topic(namespace, &reading.ecu_id),
            retain: true,
            payload: serde_json::to_string(&ecu)?,
        });

        for inverter in &reading.inverters {
            let state = InverterState {
                ecu_id: &reading.ecu_id,
                timestamp: reading.timestamp,
                inverter,
            };
            r.push(Message {
                topic: inverter_state_topic(namespace, &inverter.uid),
                retain: true,
                payload: serde_json::to_string(&state)?,
            });
        }

        Ok(r)
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    shared_stats: Arc<Mutex<ProxyStats>>,
    token: CancellationToken,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels, shared_stats: Arc<Mutex<ProxyStats>>) -> Self {
        Self {
            config,
            channels,
            shared_stats,
            token: CancellationToken::new(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("apsystems-ecu-proxy", c.host(), c.port());

        let will = LastWill {
            topic: lwt_topic(c.namespace()),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.receiver(client.clone(), eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub fn stop(&self) {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
    }

    // drives the connection; nothing is subscribed so incoming traffic is only acks
    async fn receiver(&self, client: AsyncClient, mut eventloop: EventLoop) -> Result<()> {
        loop {
            let event = tokio::select! {
                () = self.token.cancelled() => break,
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // on every connect, a restarted broker may have lost the retained value
                    let topic = lwt_topic(self.config.mqtt().namespace());
                    if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, true, "online") {
                        warn!("failed to publish availability: {}", e);
                    }
                }
                Ok(_) => {} // keepalives etc
                Err(e) => {
                    error!("{}", e);
                    info!("reconnecting in {}s", RECONNECT_DELAY.as_secs());
                    tokio::select! {
                        () = self.token.cancelled() => break,
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;
        use tokio::sync::broadcast::error::RecvError;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            match receiver.recv().await {
                Ok(Shutdown) | Err(RecvError::Closed) => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.disconnect().await;
                    break;
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("MQTT sender lagged, {} messages dropped", n);
                    self.count(|stats| stats.mqtt_errors += n);
                }
                Ok(Message(message)) => self.publish(&client, message).await,
            }
        }

        self.token.cancel();
        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        debug!("publishing: {} = {}", message.topic, message.payload);

        for attempt in 1..=MAX_PUBLISH_ATTEMPTS {
            match client
                .publish(
                    &message.topic,
                    QoS::AtLeastOnce,
                    message.retain,
                    message.payload.as_bytes(),
                )
                .await
            {
                Ok(()) => {
                    self.count(|stats| stats.mqtt_messages_sent += 1);
                    return;
                }
                Err(err) => {
                    error!(
                        "MQTT publish to {} failed: {:?} (attempt {}/{})",
                        message.topic, err, attempt, MAX_PUBLISH_ATTEMPTS
                    );
                    self.count(|stats| stats.mqtt_errors += 1);
                    if attempt < MAX_PUBLISH_ATTEMPTS {
                        tokio::time::sleep(PUBLISH_RETRY_DELAY).await;
                    }
                }
            }
        }

        warn!("giving up on {}", message.topic);
    }

    fn count(&self, update: impl FnOnce(&mut ProxyStats)) {
        if let Ok(mut stats) = self.shared_stats.lock() {
            update(&mut stats);
        }
    }
}
