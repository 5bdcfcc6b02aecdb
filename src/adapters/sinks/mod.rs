//! Result sinks: SQLite log, Modbus TCP register writer, MQTT publisher.

pub mod database;
pub mod modbus;
pub mod mqtt;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{ResultSink, SinkFactoryPort};
use crate::domain::{
    action::{ActionConfig, SinkKind},
    errors::SinkError,
    inspection::ProjectContext,
};

use self::database::DatabaseSink;
use self::modbus::ModbusSink;
use self::mqtt::MqttSink;

pub struct SinkFactory {
    project: ProjectContext,
    database_path: PathBuf,
    image_dir: PathBuf,
    connect_timeout: Duration,
}

impl SinkFactory {
    pub fn new(
        project: ProjectContext,
        database_path: impl Into<PathBuf>,
        image_dir: impl Into<PathBuf>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            project,
            database_path: database_path.into(),
            image_dir: image_dir.into(),
            connect_timeout,
        }
    }
}

impl SinkFactoryPort for SinkFactory {
    fn build(&self, kind: SinkKind, config: &ActionConfig) -> Result<Arc<dyn ResultSink>, SinkError> {
        let sink: Arc<dyn ResultSink> = match kind {
            SinkKind::Database => Arc::new(DatabaseSink::open(
                &self.database_path,
                config.database.clone(),
                self.image_dir.clone(),
            )?),
            SinkKind::Modbus => Arc::new(ModbusSink::new(config.modbus.clone(), self.connect_timeout)),
            SinkKind::Mqtt => Arc::new(MqttSink::new(config.mqtt.clone(), &self.project)),
        };
        Ok(sink)
    }
}
