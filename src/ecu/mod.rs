pub mod connection;
pub mod forwarder;
pub mod listener;
pub mod message;
pub mod models;

use crate::prelude::*;

#[derive(PartialEq, Debug, Clone)]
pub enum ChannelData {
    Reading(Box<EcuReading>),
    Shutdown,
}

pub type Receiver = broadcast::Receiver<ChannelData>;
