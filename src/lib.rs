//! Real-time machine-vision inspection core: frame capture, triggering,
//! ONNX inference, PASS/FAIL verdicts and result distribution to a
//! database, a PLC over Modbus TCP, an MQTT broker and live dashboards.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
