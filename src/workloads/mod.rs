//! Protocol workloads served by the listeners.
//!
//! Currently supported workloads:
//! - MQTT: MQTT 3.1.1 broker with QoS 0/1 delivery, last-will handling and
//!   per-identity topic namespaces.

pub mod mqtt;
