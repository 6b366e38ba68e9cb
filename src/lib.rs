//! Sensor–Twin Synchronization Engine.
//!
//! This library turns a host process into an IoT endpoint: it samples
//! hardware-style and simulated sensors, streams their telemetry to a cloud
//! device-twin service, mirrors twin properties locally, and executes remote
//! commands against the sensor fleet and local actuators.

pub mod actuator;
pub mod cloud;
pub mod config;
pub mod context;
pub mod error;
pub mod eventlog;
pub mod sensors;
pub mod twin;
