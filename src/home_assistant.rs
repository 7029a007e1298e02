use crate::prelude::*;

use serde::Serialize;

pub const MANUFACTURER: &str = "APSystems";
const SOLAR_ICON: &str = "mdi:solar-power";

struct Sensor {
    key: &'static str,
    name: &'static str,
    field: &'static str,
    device_class: Option<&'static str>,
    state_class: Option<&'static str>,
    unit: Option<&'static str>,
    icon: Option<&'static str>,
    diagnostic: bool,
}

const ECU_SENSORS: &[Sensor] = &[
    Sensor {
        key: "current_power",
        name: "Current Power",
        field: "current_power",
        device_class: Some("power"),
        state_class: Some("measurement"),
        unit: Some("W"),
        icon: Some(SOLAR_ICON),
        diagnostic: false,
    },
    Sensor {
        key: "lifetime_energy",
        name: "Lifetime Energy Production",
        field: "lifetime_energy",
        device_class: Some("energy"),
        state_class: Some("total_increasing"),
        unit: Some("kWh"),
        icon: Some(SOLAR_ICON),
        diagnostic: false,
    },
    Sensor {
        key: "qty_of_online_inverters",
        name: "Inverters Online",
        field: "qty_online_inverters",
        device_class: None,
        state_class: Some("measurement"),
        unit: None,
        icon: None,
        diagnostic: false,
    },
];

const INVERTER_SENSORS: &[Sensor] = &[
    Sensor {
        key: "temperature",
        name: "Temperature",
        field: "temperature",
        device_class: Some("temperature"),
        state_class: Some("measurement"),
        unit: Some("°C"),
        icon: None,
        diagnostic: true,
    },
    Sensor {
        key: "frequency",
        name: "Frequency",
        field: "frequency",
        device_class: Some("frequency"),
        state_class: Some("measurement"),
        unit: Some("Hz"),
        icon: None,
        diagnostic: true,
    },
];

// name is a prefix here, the channel number is appended
const CHANNEL_SENSORS: &[Sensor] = &[
    Sensor {
        key: "power",
        name: "Power Ch",
        field: "power",
        device_class: Some("power"),
        state_class: Some("measurement"),
        unit: Some("W"),
        icon: None,
        diagnostic: true,
    },
    Sensor {
        key: "voltage",
        name: "Voltage Ch",
        field: "voltage",
        device_class: Some("voltage"),
        state_class: Some("measurement"),
        unit: Some("V"),
        icon: None,
        diagnostic: true,
    },
    Sensor {
        key: "current",
        name: "Current Ch",
        field: "current",
        device_class: Some("current"),
        state_class: Some("measurement"),
        unit: Some("A"),
        icon: None,
        diagnostic: true,
    },
];

#[derive(Debug, Serialize)]
struct Device {
    identifiers: Vec<String>,
    manufacturer: &'static str,
    model: String,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    via_device: Option<String>,
}

#[derive(Debug, Serialize)]
struct Entity<'a> {
    name: String,
    unique_id: String,
    state_topic: String,
    value_template: String,
    availability_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_category: Option<&'a str>,
    device: &'a Device,
}

/// Builds retained Home Assistant discovery messages for ECUs and inverters.
pub struct Discovery {
    mqtt: config::Mqtt,
}

impl Discovery {
    pub fn new(mqtt: &config::Mqtt) -> Self {
        Self { mqtt: mqtt.clone() }
    }

    pub fn ecu(&self, reading: &EcuReading) -> Result<Vec<mqtt::Message>> {
        let device = Device {
            identifiers: vec![Self::ecu_identifier(&reading.ecu_id)],
            manufacturer: MANUFACTURER,
            model: reading.ecu_model.clone(),
            name: format!("ECU {}", reading.ecu_id),
            via_device: None,
        };
        let state_topic = mqtt::ecu_state_topic(self.mqtt.namespace(), &reading.ecu_id);

        ECU_SENSORS
            .iter()
            .map(|sensor| {
                let unique_id = format!("ecu-{}-{}", reading.ecu_id, sensor.key);
                self.entity(
                    sensor,
                    sensor.name.to_string(),
                    unique_id,
                    &state_topic,
                    format!("{{{{ value_json.{} }}}}", sensor.field),
                    &device,
                )
            })
            .collect()
    }

    pub fn inverter(&self, ecu_id: &str, inverter: &InverterReading) -> Result<Vec<mqtt::Message>> {
        let device = Device {
            identifiers: vec![format!("inverter-{}-{}", ecu_id, inverter.uid)],
            manufacturer: MANUFACTURER,
            model: inverter.model.clone(),
            name: format!("Inverter {}", inverter.uid),
            via_device: Some(Self::ecu_identifier(ecu_id)),
        };
        let state_topic = mqtt::inverter_state_topic(self.mqtt.namespace(), &inverter.uid);

        let mut r = Vec::new();

        for sensor in INVERTER_SENSORS {
            r.push(self.entity(
                sensor,
                sensor.name.to_string(),
                format!("inverter-{}-{}-{}", ecu_id, inverter.uid, sensor.key),
                &state_topic,
                format!("{{{{ value_json.{} }}}}", sensor.field),
                &device,
            )?);
        }

        for channel in 1..=inverter.channel_qty {
            for sensor in CHANNEL_SENSORS {
                r.push(self.entity(
                    sensor,
                    format!("{} {}", sensor.name, channel),
                    format!(
                        "inverter-{}-{}-{}-CH{}",
                        ecu_id, inverter.uid, sensor.key, channel
                    ),
                    &state_topic,
                    format!("{{{{ value_json.{}[{}] }}}}", sensor.field, channel - 1),
                    &device,
                )?);
            }
        }

        Ok(r)
    }

    fn entity(
        &self,
        sensor: &Sensor,
        name: String,
        unique_id: String,
        state_topic: &str,
        value_template: String,
        device: &Device,
    ) -> Result<mqtt::Message> {
        let topic = format!(
            "{}/sensor/{}/config",
            self.mqtt.homeassistant().prefix(),
            unique_id
        );

        let entity = Entity {
            name,
            unique_id,
            state_topic: state_topic.to_string(),
            value_template,
            availability_topic: mqtt::lwt_topic(self.mqtt.namespace()),
            device_class: sensor.device_class,
            state_class: sensor.state_class,
            unit_of_measurement: sensor.unit,
            icon: sensor.icon,
            entity_category: sensor.diagnostic.then_some("diagnostic"),
            device,
        };

        Ok(mqtt::Message {
            topic,
            retain: true,
            payload: serde_json::to_string(&entity)?,
        })
    }

    fn ecu_identifier(ecu_id: &str) -> String {
        format!("ecu-{}", ecu_id)
    }
}
