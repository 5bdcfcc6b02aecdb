use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::ConfigurationError;
use super::inspection::{InspectionResult, Verdict};
use super::model::OK_CLASS_ID;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Database,
    Modbus,
    Mqtt,
}

impl SinkKind {
    pub const ALL: [SinkKind; 3] = [SinkKind::Database, SinkKind::Modbus, SinkKind::Mqtt];

    pub fn label(self) -> &'static str {
        match self {
            SinkKind::Database => "database",
            SinkKind::Modbus => "modbus",
            SinkKind::Mqtt => "mqtt",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseAction {
    pub enabled: bool,
    pub table_name: String,
    pub save_image: bool,
    pub save_detections: bool,
}

impl Default for DatabaseAction {
    fn default() -> Self {
        Self {
            enabled: true,
            table_name: "inspection_results".into(),
            save_image: true,
            save_detections: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Coil,
    Holding,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMapping {
    pub class_id: u32,
    pub value: u16,
}

/// How a multi-class result is reduced to one register value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ModbusReduction {
    /// First mapping entry, in configured order, whose class is present among
    /// the defect detections.
    #[default]
    MappingOrder,
    /// 0 for PASS, 1 for FAIL.
    ResultCode,
}

/// Value written when a defect class has no mapping entry.
pub const UNMAPPED_DEFECT_VALUE: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModbusAction {
    pub enabled: bool,
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    pub unit_id: u8,
    pub register_address: u16,
    pub register_type: RegisterType,
    #[serde(default)]
    pub mapping: Vec<RegisterMapping>,
    #[serde(default)]
    pub reduction: ModbusReduction,
    /// Optional holding register receiving the detection count.
    #[serde(default)]
    pub count_register: Option<u16>,
}

fn default_modbus_port() -> u16 {
    502
}

impl Default for ModbusAction {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "192.168.1.200".into(),
            port: 502,
            unit_id: 1,
            register_address: 100,
            register_type: RegisterType::Holding,
            mapping: vec![
                RegisterMapping { class_id: 0, value: 0 },
                RegisterMapping { class_id: 1, value: 1 },
            ],
            reduction: ModbusReduction::MappingOrder,
            count_register: None,
        }
    }
}

impl ModbusAction {
    pub fn register_value(&self, result: &InspectionResult) -> u16 {
        match self.reduction {
            ModbusReduction::ResultCode => match result.verdict {
                Verdict::Pass => 0,
                Verdict::Fail => 1,
            },
            ModbusReduction::MappingOrder => {
                let present: HashSet<u32> = result
                    .detections
                    .iter()
                    .filter(|d| d.is_defect())
                    .map(|d| d.class_id)
                    .collect();
                if present.is_empty() {
                    return self
                        .mapping
                        .iter()
                        .find(|m| m.class_id == OK_CLASS_ID)
                        .map(|m| m.value)
                        .unwrap_or(0);
                }
                self.mapping
                    .iter()
                    .find(|m| present.contains(&m.class_id))
                    .map(|m| m.value)
                    .unwrap_or(UNMAPPED_DEFECT_VALUE)
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if !(1..=247).contains(&self.unit_id) {
            return Err(ConfigurationError::new("modbus.unitId", "must be between 1 and 247"));
        }
        if self.port == 0 {
            return Err(ConfigurationError::new("modbus.port", "must be non-zero"));
        }
        if self.enabled && self.host.trim().is_empty() {
            return Err(ConfigurationError::new("modbus.host", "must not be empty"));
        }
        let mut seen = HashSet::new();
        for entry in &self.mapping {
            if !seen.insert(entry.class_id) {
                return Err(ConfigurationError::new(
                    "modbus.mapping",
                    format!("class {} mapped twice", entry.class_id),
                ));
            }
            if self.register_type == RegisterType::Coil && entry.value > 1 {
                return Err(ConfigurationError::new(
                    "modbus.mapping",
                    format!("coil value for class {} must be 0 or 1", entry.class_id),
                ));
            }
        }
        if self.count_register == Some(self.register_address)
            && self.register_type == RegisterType::Holding
        {
            return Err(ConfigurationError::new(
                "modbus.countRegister",
                "must differ from the result register",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MqttAction {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub topic: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub qos: u8,
    pub retain: bool,
}

impl Default for MqttAction {
    fn default() -> Self {
        Self {
            enabled: false,
            broker: "mqtt://192.168.1.201".into(),
            port: 1883,
            topic: "facvision/{project}/result".into(),
            client_id: None,
            username: None,
            password: None,
            qos: 1,
            retain: false,
        }
    }
}

impl MqttAction {
    /// Broker host with any `mqtt://` / `tcp://` scheme removed.
    pub fn broker_host(&self) -> &str {
        let broker = self.broker.trim();
        broker
            .strip_prefix("mqtt://")
            .or_else(|| broker.strip_prefix("tcp://"))
            .unwrap_or(broker)
            .trim_end_matches('/')
    }

    /// Topic with the `{project}` placeholder filled in.
    pub fn topic_for(&self, project_id: &str) -> String {
        self.topic.replace("{project}", project_id)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.qos > 2 {
            return Err(ConfigurationError::new("mqtt.qos", "must be 0, 1 or 2"));
        }
        if self.port == 0 {
            return Err(ConfigurationError::new("mqtt.port", "must be non-zero"));
        }
        if self.topic.contains(['#', '+']) {
            return Err(ConfigurationError::new("mqtt.topic", "wildcards are not publishable"));
        }
        if self.enabled {
            if self.broker_host().is_empty() {
                return Err(ConfigurationError::new("mqtt.broker", "must not be empty"));
            }
            if self.topic.trim().is_empty() {
                return Err(ConfigurationError::new("mqtt.topic", "must not be empty"));
            }
        }
        Ok(())
    }
}

/// Per-project sink configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ActionConfig {
    #[serde(default)]
    pub database: DatabaseAction,
    #[serde(default)]
    pub modbus: ModbusAction,
    #[serde(default)]
    pub mqtt: MqttAction,
}

impl ActionConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_table_name(&self.database.table_name)?;
        self.modbus.validate()?;
        self.mqtt.validate()
    }

    pub fn is_enabled(&self, kind: SinkKind) -> bool {
        match kind {
            SinkKind::Database => self.database.enabled,
            SinkKind::Modbus => self.modbus.enabled,
            SinkKind::Mqtt => self.mqtt.enabled,
        }
    }
}

fn validate_table_name(name: &str) -> Result<(), ConfigurationError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(ConfigurationError::new(
            "database.tableName",
            "must be an identifier of letters, digits and underscores",
        ));
    }
    Ok(())
}
