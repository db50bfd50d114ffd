//! Heartbeat monitor: periodic sweep that demotes silent sessions.

use std::sync::Arc;
use std::time::Duration;

use ecu_core::EcuId;
use ecu_settings::HeartbeatSettings;
use metrics::histogram;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::SessionRegistry;
use crate::transport::Transport;

/// Monitor tuning.
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    /// Silence after which a Connected session times out.
    pub timeout: Duration,
    /// Time between sweeps.
    pub sweep_interval: Duration,
}

impl HeartbeatConfig {
    /// Build from the `heartbeat` settings section.
    pub fn from_settings(settings: &HeartbeatSettings) -> Self {
        Self {
            timeout: settings.timeout(),
            sweep_interval: settings.sweep_interval(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::from_settings(&HeartbeatSettings::default())
    }
}

/// Outcome of one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Devices examined.
    pub checked: usize,
    /// Devices demoted to Timeout by this sweep.
    pub timed_out: Vec<EcuId>,
}

/// Why the monitor loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorExit {
    /// The cancellation token fired.
    Cancelled,
}

/// Periodic liveness check over the session registry.
pub struct HeartbeatMonitor {
    registry: Arc<SessionRegistry>,
    config: HeartbeatConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl HeartbeatMonitor {
    /// Create a monitor over `registry`.
    pub fn new(config: HeartbeatConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            config,
            transport: None,
        }
    }

    /// Close the connection of every session that times out, so the device
    /// reconnects instead of heartbeating into a Timeout session.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Monitor tuning.
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Check every device once. Each check and its transition run under the
    /// device's slot, so a concurrent heartbeat lands either before (and
    /// the device stays Connected) or after (and is refused).
    pub fn sweep(&self) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport::default();
        for ecu_id in self.registry.device_ids() {
            report.checked += 1;
            let Some((_, epoch)) = self.registry.expire_if_stale(&ecu_id, self.config.timeout)
            else {
                continue;
            };
            if let Some(transport) = &self.transport {
                let closed = transport.close_session(&ecu_id, epoch);
                debug!(ecu_id = %ecu_id, epoch, closed, "closing timed-out connection");
            }
            report.timed_out.push(ecu_id);
        }
        histogram!("ecu_heartbeat_sweep_duration_seconds").record(started.elapsed().as_secs_f64());
        if !report.timed_out.is_empty() {
            debug!(
                checked = report.checked,
                timed_out = report.timed_out.len(),
                "heartbeat sweep"
            );
        }
        report
    }

    /// Sweep every `sweep_interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> MonitorExit {
        let period = self.config.sweep_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            timeout_secs = self.config.timeout.as_secs(),
            sweep_secs = period.as_secs(),
            "heartbeat monitor started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("heartbeat monitor stopped");
                    return MonitorExit::Cancelled;
                }
                _ = ticker.tick() => {
                    let _ = self.sweep();
                }
            }
        }
    }

    /// Run the loop on its own task.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<MonitorExit> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::registry::RegistryConfig;
    use crate::transport::PeerInfo;
    use ecu_core::Protocol;
    use ecu_events::{ActionLogPipeline, ConnectionStatus, MemoryStore, PipelineConfig};

    fn make_monitor() -> (Arc<SessionRegistry>, HeartbeatMonitor) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(ActionLogPipeline::spawn(
            PipelineConfig::default(),
            store.clone(),
            store,
        ));
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default(), pipeline));
        let monitor = HeartbeatMonitor::new(
            HeartbeatConfig {
                timeout: Duration::from_secs(90),
                sweep_interval: Duration::from_secs(30),
            },
            registry.clone(),
        );
        (registry, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_without_heartbeat_uses_connect_time() {
        let (registry, monitor) = make_monitor();
        let gate = EcuId::parse("test_gate_001").unwrap();
        let _ = registry
            .register(gate.clone(), Protocol::Simulator, PeerInfo::default())
            .unwrap();

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(monitor.sweep().timed_out.is_empty());
        tokio::time::advance(Duration::from_secs(1)).await;
        let report = monitor.sweep();
        assert_eq!(report.checked, 1);
        assert_eq!(report.timed_out, vec![gate.clone()]);
        assert_eq!(registry.status(&gate), Some(ConnectionStatus::Timeout));
        // no second transition
        assert!(monitor.sweep().timed_out.is_empty());
    }

    #[derive(Default)]
    struct ClosingTransport {
        closed: parking_lot::Mutex<Vec<(EcuId, u64)>>,
    }

    #[async_trait::async_trait]
    impl Transport for ClosingTransport {
        async fn send(&self, ecu_id: &EcuId, _text: String) -> Result<(), TransportError> {
            Err(TransportError::NoConnection(ecu_id.clone()))
        }

        fn close_session(&self, ecu_id: &EcuId, epoch: u64) -> bool {
            self.closed.lock().push((ecu_id.clone(), epoch));
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_session_connection_is_closed() {
        let (registry, monitor) = make_monitor();
        let transport = Arc::new(ClosingTransport::default());
        let monitor = monitor.with_transport(transport.clone());
        let gate = EcuId::parse("test_gate_001").unwrap();
        let bike = EcuId::parse("test_bike_001").unwrap();
        let _ = registry
            .register(gate.clone(), Protocol::Websocket, PeerInfo::default())
            .unwrap();
        let _ = registry
            .register(gate.clone(), Protocol::Websocket, PeerInfo::default())
            .unwrap();
        let _ = registry
            .register(bike.clone(), Protocol::Websocket, PeerInfo::default())
            .unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        registry.heartbeat(&bike).unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(monitor.sweep().timed_out, vec![gate.clone()]);
        assert_eq!(*transport.closed.lock(), vec![(gate.clone(), 2)]);

        // already Timeout: nothing more to close
        let _ = monitor.sweep();
        assert_eq!(transport.closed.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_cancel() {
        let (_registry, monitor) = make_monitor();
        let cancel = CancellationToken::new();
        let handle = Arc::new(monitor).spawn(cancel.clone());
        tokio::time::advance(Duration::from_secs(65)).await;
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), MonitorExit::Cancelled);
    }
}
