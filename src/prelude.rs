pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::io::Write;
pub use std::str::FromStr;
pub use tokio::sync::broadcast;

pub use crate::channels::Channels;
pub use crate::config::{self, Config, ConfigWrapper};
pub use crate::coordinator::{self, Coordinator, ProxyStats};
pub use crate::ecu;
pub use crate::ecu::message::{EcuReading, InverterReading, MessageDecoder};
pub use crate::ecu::models::ModelCatalog;
pub use crate::error::{ForwardingError, RejectReason};
pub use crate::home_assistant;
pub use crate::mqtt;
pub use crate::options::Options;
