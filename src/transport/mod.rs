//! Transport layer for the MQTT session
//!
//! This module provides the MQTT client, the engine and host loop contracts,
//! and the TCP protocol engine.

pub mod mqtt;

/// Client type driven by the bundled TCP engine
pub type TcpMqttClient<L> = mqtt::MqttClient<mqtt::TcpEngine, L>;
