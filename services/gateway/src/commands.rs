//! Command source: the seam the HTTP business plane calls into.
//!
//! A `CoreCommand` is encoded for the device's bound protocol family at
//! enqueue time, then delivered by the outbound worker. A device with no
//! known binding (neither local nor on another instance) cannot be encoded
//! and the command is rejected back to the producer.

use crate::adapters::{AdapterError, ProtocolAdapter};
use crate::outbound::{EnqueueError, OutboundQueue};
use crate::session::SessionRegistry;
use async_trait::async_trait;
use gw_protocol::{CoreCommand, ProtocolFamily};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("device {0} has no known connection")]
    DeviceNotConnected(String),
    #[error("protocol family {0} is not enabled")]
    FamilyDisabled(ProtocolFamily),
    #[error(transparent)]
    Encode(#[from] AdapterError),
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// The capability handed to the administrative/third-party API layer.
#[async_trait]
pub trait CommandSource: Send + Sync {
    /// Route a command to the outbound queue; returns the queue row id.
    async fn send_core_command(&self, command: CoreCommand) -> Result<i64, CommandError>;
}

pub struct CommandSender {
    registry: Arc<dyn SessionRegistry>,
    adapters: HashMap<ProtocolFamily, Arc<dyn ProtocolAdapter>>,
    queue: Arc<OutboundQueue>,
    ack_timeout_sec: u32,
}

impl CommandSender {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        adapters: HashMap<ProtocolFamily, Arc<dyn ProtocolAdapter>>,
        queue: Arc<OutboundQueue>,
        ack_timeout_sec: u32,
    ) -> Arc<CommandSender> {
        Arc::new(CommandSender {
            registry,
            adapters,
            queue,
            ack_timeout_sec,
        })
    }
}

#[async_trait]
impl CommandSource for CommandSender {
    async fn send_core_command(&self, command: CoreCommand) -> Result<i64, CommandError> {
        let device_id = command.device_id().to_owned();
        let family = self
            .registry
            .family_of(&device_id)
            .await
            .ok_or_else(|| CommandError::DeviceNotConnected(device_id.clone()))?;
        let adapter = self
            .adapters
            .get(&family)
            .ok_or(CommandError::FamilyDisabled(family))?;
        let (cmd, payload) = adapter.encode_command(&command)?;
        let id = self
            .queue
            .enqueue(
                &device_id,
                family,
                cmd,
                payload,
                command.priority(),
                self.ack_timeout_sec,
            )
            .await?;
        info!(
            device_id = %device_id,
            kind = command.kind(),
            family = %family,
            id,
            "command accepted"
        );
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
