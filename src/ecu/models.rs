use std::collections::HashMap;

pub const UNKNOWN_MODEL: &str = "Unknown";

/// Matched on the full 4-digit code taken from the start of the ECU id.
const ECU_MODELS: &[(&str, &str)] = &[("2160", "ECU-R"), ("2162", "ECU-R Pro"), ("2163", "ECU-B")];

/// Fallback on the first 3 digits when there is no exact match.
const ECU_MODEL_PREFIXES: &[(&str, &str)] = &[("215", "ECU-C")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InverterModel {
    pub name: &'static str,
    pub channels: usize,
    pub codes: &'static [&'static str],
}

impl InverterModel {
    pub fn matches(&self, code: &str) -> bool {
        self.codes.contains(&code)
    }
}

const INVERTER_MODELS: &[InverterModel] = &[
    InverterModel {
        name: "YC600/DS3 series",
        channels: 2,
        codes: &["406", "407", "408", "409", "703", "706"],
    },
    InverterModel {
        name: "QS1",
        channels: 4,
        codes: &["801", "802", "806"],
    },
    InverterModel {
        name: "YC1000/QT2",
        channels: 4,
        codes: &["501", "502", "503", "504"],
    },
];

/// Lookup tables for ECU and inverter model codes. Built once at startup and
/// shared read-only between every connection.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    ecu_exact: HashMap<&'static str, &'static str>,
    ecu_prefix: HashMap<&'static str, &'static str>,
    inverters: Vec<InverterModel>,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCatalog {
    pub fn new() -> Self {
        Self {
            ecu_exact: ECU_MODELS.iter().copied().collect(),
            ecu_prefix: ECU_MODEL_PREFIXES.iter().copied().collect(),
            inverters: INVERTER_MODELS.to_vec(),
        }
    }

    pub fn ecu_model(&self, code: &str) -> Option<&'static str> {
        if let Some(name) = self.ecu_exact.get(code) {
            return Some(*name);
        }

        code.get(..3)
            .and_then(|prefix| self.ecu_prefix.get(prefix))
            .copied()
    }

    pub fn inverter_model(&self, code: &str) -> Option<&InverterModel> {
        self.inverters.iter().find(|model| model.matches(code))
    }
}
