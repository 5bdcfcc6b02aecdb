use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::ports::ResultSink;
use crate::domain::{
    action::{MqttAction, SinkKind},
    errors::{MqttFailure, SinkError},
    inspection::{InspectionResult, ProjectContext},
};

#[derive(Debug, Serialize)]
pub struct MqttDetection<'a> {
    pub class: &'a str,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// One message per result.
#[derive(Debug, Serialize)]
pub struct MqttPayload<'a> {
    pub timestamp: String,
    pub project: &'a str,
    pub camera: &'a str,
    pub result: &'static str,
    pub detections: Vec<MqttDetection<'a>>,
    pub inference_time_ms: f64,
}

impl<'a> MqttPayload<'a> {
    pub fn new(project: &'a ProjectContext, result: &'a InspectionResult) -> Self {
        Self {
            timestamp: result.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            project: &project.id,
            camera: result.camera_id.as_str(),
            result: result.verdict.as_str(),
            detections: result
                .detections
                .iter()
                .map(|d| MqttDetection {
                    class: &d.class_name,
                    confidence: d.confidence,
                    bbox: d.bounding_box.as_array(),
                })
                .collect(),
            inference_time_ms: result.processing_time_ms,
        }
    }
}

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn map_connection(err: ConnectionError) -> SinkError {
    match err {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => SinkError::mqtt(MqttFailure::AuthRejected, format!("broker refused connection: {code:?}")),
        other => SinkError::mqtt(MqttFailure::BrokerUnreachable, other.to_string()),
    }
}

/// What the event loop reported, as seen by a waiting publish or probe.
#[derive(Debug, Clone)]
enum Signal {
    Connected,
    Sent,
    Acked(QoS),
    Lost(SinkError),
}

async fn poll_events(mut events: EventLoop, signals: broadcast::Sender<Signal>) {
    loop {
        let signal = match events.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("mqtt connected");
                Signal::Connected
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => Signal::Acked(QoS::AtLeastOnce),
            Ok(Event::Incoming(Packet::PubComp(_))) => Signal::Acked(QoS::ExactlyOnce),
            Ok(Event::Outgoing(Outgoing::Publish(_))) => Signal::Sent,
            Ok(_) => continue,
            Err(err) => {
                let err = map_connection(err);
                warn!("mqtt connection lost: {err}");
                let _ = signals.send(Signal::Lost(err));
                return;
            }
        };
        // Nobody waiting is fine.
        let _ = signals.send(signal);
    }
}

/// A broker connection whose event loop is polled by its own task while
/// the connection is kept, so keep-alives and late acks are handled
/// between publishes.
struct Connection {
    client: AsyncClient,
    signals: broadcast::Sender<Signal>,
    poller: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.poller.is_finished()
    }

    /// Subscribe before acting, then wait for the first signal `done`
    /// accepts. A lost connection ends the wait with its error.
    async fn wait_for(signals: &mut broadcast::Receiver<Signal>, done: impl Fn(&Signal) -> bool) -> Result<(), SinkError> {
        loop {
            match signals.recv().await {
                Ok(Signal::Lost(err)) => return Err(err),
                Ok(signal) if done(&signal) => return Ok(()),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => {
                    return Err(SinkError::mqtt(MqttFailure::BrokerUnreachable, "event loop stopped"))
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// Publishes results to a broker over one kept connection, reopened when
/// its event loop reports it lost.
pub struct MqttSink {
    config: MqttAction,
    client_id: String,
    connection: Mutex<Option<Connection>>,
}

impl MqttSink {
    pub fn new(config: MqttAction, project: &ProjectContext) -> Self {
        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("facvision-{}-{}", project.id, &uuid::Uuid::new_v4().simple().to_string()[..8]));
        Self { config, client_id, connection: Mutex::new(None) }
    }

    fn open(&self) -> Connection {
        let mut options = MqttOptions::new(&self.client_id, self.config.broker_host(), self.config.port);
        options.set_keep_alive(Duration::from_secs(10));
        if let Some(user) = &self.config.username {
            options.set_credentials(user, self.config.password.clone().unwrap_or_default());
        }
        let (client, events) = AsyncClient::new(options, 16);
        let (signals, _) = broadcast::channel(64);
        let poller = tokio::spawn(poll_events(events, signals.clone()));
        Connection { client, signals, poller }
    }
}

#[async_trait]
impl ResultSink for MqttSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Mqtt
    }

    async fn deliver(&self, project: &ProjectContext, result: &InspectionResult) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(&MqttPayload::new(project, result))
            .map_err(|e| SinkError::mqtt(MqttFailure::BrokerUnreachable, e.to_string()))?;
        let topic = self.config.topic_for(&project.id);
        let level = qos(self.config.qos);

        let mut guard = self.connection.lock().await;
        // Taken out while in use: an abandoned attempt leaves no half-used connection behind.
        let connection = match guard.take() {
            Some(connection) if connection.is_alive() => connection,
            _ => self.open(),
        };
        let mut signals = connection.signals.subscribe();
        connection
            .client
            .publish(topic.as_str(), level, self.config.retain, payload)
            .await
            .map_err(|e| SinkError::mqtt(MqttFailure::BrokerUnreachable, e.to_string()))?;

        Connection::wait_for(&mut signals, |signal| match (level, signal) {
            (QoS::AtMostOnce, Signal::Sent) => true,
            (QoS::AtLeastOnce, Signal::Acked(QoS::AtLeastOnce)) => true,
            (QoS::ExactlyOnce, Signal::Acked(QoS::ExactlyOnce)) => true,
            _ => false,
        })
        .await?;

        *guard = Some(connection);
        debug!(result = %result.id, topic = %topic, "result published");
        Ok(())
    }

    async fn probe(&self) -> Result<(), SinkError> {
        let connection = self.open();
        let mut signals = connection.signals.subscribe();
        Connection::wait_for(&mut signals, |signal| matches!(signal, Signal::Connected)).await?;
        info!(broker = %self.config.broker_host(), "mqtt broker reachable");
        *self.connection.lock().await = Some(connection);
        Ok(())
    }
}
