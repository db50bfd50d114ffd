//! The assembled session core: registry, monitor, dispatcher and pipeline
//! behind one handle that transports talk to.

use std::sync::Arc;

use async_trait::async_trait;
use ecu_core::{EcuId, Protocol};
use ecu_events::{
    ActionLogPipeline, AdminLogStore, ConnectionRecord, ConnectionStore, DisconnectReason,
    FlushReport, PipelineConfig,
};
use ecu_settings::GatewaySettings;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::{CommandDispatcher, DispatcherConfig};
use crate::errors::RegistryError;
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor, MonitorExit};
use crate::inbound::InboundHandler;
use crate::registry::{RegistryConfig, SessionRegistry};
use crate::transport::{PeerInfo, Transport, TransportListener};

/// Tuning for every runtime component.
#[derive(Clone, Debug, Default)]
pub struct RuntimeConfig {
    /// Registry tuning.
    pub registry: RegistryConfig,
    /// Heartbeat monitor tuning.
    pub heartbeat: HeartbeatConfig,
    /// Dispatcher tuning.
    pub dispatcher: DispatcherConfig,
    /// Log pipeline tuning.
    pub pipeline: PipelineConfig,
}

impl RuntimeConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            registry: RegistryConfig::from_settings(&settings.heartbeat),
            heartbeat: HeartbeatConfig::from_settings(&settings.heartbeat),
            dispatcher: DispatcherConfig::from_settings(&settings.dispatcher),
            pipeline: PipelineConfig::from_settings(&settings.pipeline),
        }
    }
}

/// Running session core.
pub struct Gateway {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    monitor: Arc<HeartbeatMonitor>,
    pipeline: Arc<ActionLogPipeline>,
    cancel: CancellationToken,
    monitor_task: Mutex<Option<JoinHandle<MonitorExit>>>,
}

impl Gateway {
    /// Start the pipeline worker and heartbeat monitor, and wire the
    /// dispatcher to `transport`.
    pub fn start(
        config: RuntimeConfig,
        logs: Arc<dyn AdminLogStore>,
        connections: Arc<dyn ConnectionStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Self::start_with(config, logs, connections, transport, None)
    }

    /// [`start`](Self::start) with a custom handler for device-initiated
    /// calls.
    pub fn start_with(
        config: RuntimeConfig,
        logs: Arc<dyn AdminLogStore>,
        connections: Arc<dyn ConnectionStore>,
        transport: Arc<dyn Transport>,
        inbound: Option<Arc<dyn InboundHandler>>,
    ) -> Arc<Self> {
        let pipeline = Arc::new(ActionLogPipeline::spawn(config.pipeline, logs, connections));
        let registry = Arc::new(SessionRegistry::new(config.registry, Arc::clone(&pipeline)));
        let monitor = Arc::new(
            HeartbeatMonitor::new(config.heartbeat, Arc::clone(&registry))
                .with_transport(Arc::clone(&transport)),
        );
        let mut dispatcher =
            CommandDispatcher::new(config.dispatcher, Arc::clone(&registry), transport);
        if let Some(handler) = inbound {
            dispatcher = dispatcher.with_inbound_handler(handler);
        }
        let cancel = CancellationToken::new();
        let monitor_task = Arc::clone(&monitor).spawn(cancel.child_token());
        info!("session core started");
        Arc::new(Self {
            registry,
            dispatcher: Arc::new(dispatcher),
            monitor,
            pipeline,
            cancel,
            monitor_task: Mutex::new(Some(monitor_task)),
        })
    }

    /// Session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Command dispatcher.
    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    /// Heartbeat monitor.
    pub fn monitor(&self) -> &Arc<HeartbeatMonitor> {
        &self.monitor
    }

    /// Action log pipeline.
    pub fn pipeline(&self) -> &Arc<ActionLogPipeline> {
        &self.pipeline
    }

    /// Stop the monitor, cancel outstanding commands, disconnect every
    /// session and flush the log. Second and later calls only flush.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> FlushReport {
        self.cancel.cancel();
        let task = self.monitor_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "heartbeat monitor task failed");
            }
        }
        let cancelled = self.dispatcher.cancel_all();
        let drained = self.registry.drain(DisconnectReason::Shutdown);
        let report = self.pipeline.shutdown().await;
        info!(
            cancelled,
            drained,
            persisted = report.persisted,
            dropped = report.dropped,
            "session core stopped"
        );
        report
    }
}

#[async_trait]
impl TransportListener for Gateway {
    fn on_connect(
        &self,
        ecu_id: EcuId,
        protocol: Protocol,
        peer: PeerInfo,
    ) -> Result<ConnectionRecord, RegistryError> {
        self.registry.register(ecu_id, protocol, peer)
    }

    async fn on_message(&self, ecu_id: &EcuId, text: &str) {
        self.dispatcher.on_message(ecu_id, text).await;
    }

    async fn on_close(&self, ecu_id: &EcuId, epoch: u64) {
        if self
            .registry
            .close_session(ecu_id, epoch, DisconnectReason::ClientClose)
        {
            let cancelled = self.dispatcher.cancel_device(ecu_id);
            if cancelled > 0 {
                debug!(ecu_id = %ecu_id, cancelled, "cancelled commands of closed session");
            }
        }
    }
}
