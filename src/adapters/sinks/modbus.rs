use std::fmt::Display;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_modbus::client::{tcp, Context, Writer};
use tokio_modbus::{ExceptionCode, Slave};
use tracing::{debug, info};

use crate::application::ports::ResultSink;
use crate::domain::{
    action::{ModbusAction, RegisterType, SinkKind},
    errors::{ModbusFailure, SinkError},
    inspection::{InspectionResult, ProjectContext},
};

fn map_exception(code: ExceptionCode) -> SinkError {
    let reason = match code {
        ExceptionCode::IllegalFunction
        | ExceptionCode::IllegalDataAddress
        | ExceptionCode::IllegalDataValue => ModbusFailure::IllegalAddress,
        _ => ModbusFailure::DeviceBusy,
    };
    SinkError::modbus(reason, format!("device exception: {code:?}"))
}

/// Flattens a tokio-modbus reply into our error space. Transport faults
/// come back as `Err(_)` in the outer result.
fn map_outcome<E: Display>(outcome: Result<Result<(), ExceptionCode>, E>) -> Result<(), SinkError> {
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(code)) => Err(map_exception(code)),
        Err(err) => Err(SinkError::modbus(ModbusFailure::ConnectTimeout, err.to_string())),
    }
}

/// Writes the reduced result value (and optionally the detection count) to a
/// PLC over Modbus TCP. The connection is kept between results and rebuilt
/// after a transport failure.
pub struct ModbusSink {
    config: ModbusAction,
    connect_timeout: Duration,
    context: Mutex<Option<Context>>,
}

impl ModbusSink {
    pub fn new(config: ModbusAction, connect_timeout: Duration) -> Self {
        Self { config, connect_timeout, context: Mutex::new(None) }
    }

    async fn resolve(&self) -> Result<SocketAddr, SinkError> {
        let target = (self.config.host.as_str(), self.config.port);
        tokio::net::lookup_host(target)
            .await
            .map_err(|e| SinkError::modbus(ModbusFailure::ConnectTimeout, e.to_string()))?
            .next()
            .ok_or_else(|| {
                SinkError::modbus(ModbusFailure::ConnectTimeout, format!("cannot resolve {}", self.config.host))
            })
    }

    async fn connect(&self) -> Result<Context, SinkError> {
        let addr = self.resolve().await?;
        let slave = Slave(self.config.unit_id);
        match tokio::time::timeout(self.connect_timeout, tcp::connect_slave(addr, slave)).await {
            Ok(Ok(ctx)) => {
                info!(plc = %addr, unit = self.config.unit_id, "modbus connected");
                Ok(ctx)
            }
            Ok(Err(err)) => Err(SinkError::modbus(ModbusFailure::ConnectTimeout, err.to_string())),
            Err(_) => Err(SinkError::modbus(
                ModbusFailure::ConnectTimeout,
                format!("no answer from {addr} within {:?}", self.connect_timeout),
            )),
        }
    }

    async fn write_all(&self, ctx: &mut Context, value: u16, count: u16) -> Result<(), SinkError> {
        let address = self.config.register_address;
        match self.config.register_type {
            RegisterType::Holding => map_outcome(ctx.write_single_register(address, value).await)?,
            RegisterType::Coil => map_outcome(ctx.write_single_coil(address, value != 0).await)?,
        }
        if let Some(count_register) = self.config.count_register {
            map_outcome(ctx.write_single_register(count_register, count).await)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResultSink for ModbusSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Modbus
    }

    async fn deliver(&self, _project: &ProjectContext, result: &InspectionResult) -> Result<(), SinkError> {
        let value = self.config.register_value(result);
        let count = u16::try_from(result.detections.len()).unwrap_or(u16::MAX);

        let mut guard = self.context.lock().await;
        let mut ctx = match guard.take() {
            Some(ctx) => ctx,
            None => self.connect().await?,
        };
        let written = self.write_all(&mut ctx, value, count).await;
        match &written {
            // A device exception leaves the link usable.
            Ok(()) | Err(SinkError::Modbus { reason: ModbusFailure::IllegalAddress | ModbusFailure::DeviceBusy, .. }) => {
                *guard = Some(ctx);
            }
            Err(_) => {}
        }
        if written.is_ok() {
            debug!(result = %result.id, register = self.config.register_address, value, "register written");
        }
        written
    }

    async fn probe(&self) -> Result<(), SinkError> {
        let ctx = self.connect().await?;
        *self.context.lock().await = Some(ctx);
        Ok(())
    }
}
