//! A fleet of simulated devices acting as a transport adapter.
//!
//! Each device runs on its own task: it emits heartbeat notifications on a
//! jittered schedule and answers commands pushed through [`Transport::send`].
//! Everything a device says reaches the gateway through the attached
//! [`TransportListener`], exactly as frames from a socket would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ecu_core::EcuId;
use ecu_rpc::{Incoming, Notification, Response, decode, encode, methods};
use ecu_runtime::{PeerInfo, Transport, TransportError, TransportListener};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SimulatorConfig;
use crate::device::{Faults, Reply, SimulatedDevice};
use crate::errors::{Result, SimulatorError};

struct DeviceHandle {
    epoch: u64,
    inbox: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Counters {
    heartbeats_sent: AtomicU64,
    commands_answered: AtomicU64,
    commands_failed: AtomicU64,
    commands_dropped: AtomicU64,
}

/// Fleet activity totals.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimulatorStats {
    /// Devices currently running.
    pub devices: usize,
    /// Heartbeat notifications emitted.
    pub heartbeats_sent: u64,
    /// Commands answered with a result.
    pub commands_answered: u64,
    /// Commands answered with an error object.
    pub commands_failed: u64,
    /// Commands ignored.
    pub commands_dropped: u64,
}

/// Simulated devices behind the [`Transport`] seam.
pub struct SimulatedFleet {
    config: SimulatorConfig,
    listener: RwLock<Option<Weak<dyn TransportListener>>>,
    devices: DashMap<EcuId, DeviceHandle>,
    rng: Mutex<StdRng>,
    counters: Counters,
    cancel: CancellationToken,
}

impl SimulatedFleet {
    /// Empty fleet. Attach a listener before connecting devices.
    pub fn new(config: SimulatorConfig) -> Arc<Self> {
        let rng = config
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);
        Arc::new(Self {
            config,
            listener: RwLock::new(None),
            devices: DashMap::new(),
            rng: Mutex::new(rng),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        })
    }

    /// Route device traffic to `listener`. The fleet holds it weakly.
    pub fn attach(&self, listener: &Arc<dyn TransportListener>) {
        *self.listener.write() = Some(Arc::downgrade(listener));
    }

    /// Fleet tuning.
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Connect a device. Connecting an id that is already running replaces
    /// it, which the gateway sees as a takeover.
    pub fn connect(self: &Arc<Self>, ecu_id: EcuId) -> Result<u64> {
        if self.cancel.is_cancelled() {
            return Err(SimulatorError::ShutDown);
        }
        let listener = self.listener().ok_or(SimulatorError::Detached)?;
        let record = listener.on_connect(ecu_id.clone(), self.config.protocol, PeerInfo::default())?;
        let epoch = record.session_epoch;

        let (inbox, rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let task = tokio::spawn(Arc::clone(self).run_device(
            ecu_id.clone(),
            epoch,
            rx,
            cancel.clone(),
        ));
        let handle = DeviceHandle {
            epoch,
            inbox,
            cancel,
            task,
        };
        if let Some(previous) = self.devices.insert(ecu_id.clone(), handle) {
            previous.cancel.cancel();
        }
        counter!("ecu_simulator_connects_total").increment(1);
        debug!(ecu_id = %ecu_id, epoch, "simulated device connected");
        Ok(epoch)
    }

    /// Connect `count` devices named `{prefix}_{n:03}`.
    pub fn connect_many(self: &Arc<Self>, prefix: &str, count: usize) -> Result<Vec<EcuId>> {
        let mut ids = Vec::with_capacity(count);
        for n in 1..=count {
            let ecu_id = EcuId::parse(format!("{prefix}_{n:03}"))?;
            let _ = self.connect(ecu_id.clone())?;
            ids.push(ecu_id);
        }
        info!(count, prefix, "simulated fleet connected");
        Ok(ids)
    }

    /// Close a device's connection and wait until the gateway has seen the
    /// close. Returns `false` when the device is not running.
    pub async fn disconnect(&self, ecu_id: &EcuId) -> bool {
        let Some((_, handle)) = self.devices.remove(ecu_id) else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!(ecu_id = %ecu_id, error = %e, "simulated device task failed");
        }
        true
    }

    /// Stop every device.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<EcuId> = self.devices.iter().map(|e| e.key().clone()).collect();
        for ecu_id in &ids {
            let _ = self.disconnect(ecu_id).await;
        }
        info!(devices = ids.len(), "simulated fleet stopped");
    }

    // ── queries ─────────────────────────────────────────────────────

    /// Running device ids, sorted.
    pub fn devices(&self) -> Vec<EcuId> {
        let mut ids: Vec<EcuId> = self.devices.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Session epoch of a running device.
    pub fn epoch(&self, ecu_id: &EcuId) -> Option<u64> {
        self.devices.get(ecu_id).map(|h| h.epoch)
    }

    /// Activity totals.
    pub fn stats(&self) -> SimulatorStats {
        SimulatorStats {
            devices: self.devices.len(),
            heartbeats_sent: self.counters.heartbeats_sent.load(Ordering::Relaxed),
            commands_answered: self.counters.commands_answered.load(Ordering::Relaxed),
            commands_failed: self.counters.commands_failed.load(Ordering::Relaxed),
            commands_dropped: self.counters.commands_dropped.load(Ordering::Relaxed),
        }
    }

    // ── device task ─────────────────────────────────────────────────

    fn next_period(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            self.rng.lock().random_range(0..=jitter_ms)
        };
        self.config.message_interval + Duration::from_millis(extra)
    }

    fn draw_faults(&self) -> Faults {
        let mut rng = self.rng.lock();
        Faults {
            drop: rng.random_bool(self.config.drop_rate.clamp(0.0, 1.0)),
            fail: rng.random_bool(self.config.failure_rate.clamp(0.0, 1.0)),
        }
    }

    async fn run_device(
        self: Arc<Self>,
        ecu_id: EcuId,
        epoch: u64,
        mut inbox: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) {
        let mut device = SimulatedDevice::new(ecu_id.clone());
        let mut next_beat = Instant::now() + self.next_period();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(next_beat) => {
                    let params = device.heartbeat();
                    self.deliver(&ecu_id, &Notification::new(methods::HEARTBEAT, Some(params)))
                        .await;
                    let _ = self.counters.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
                    next_beat = Instant::now() + self.next_period();
                }
                frame = inbox.recv() => match frame {
                    Some(text) => self.handle_frame(&mut device, &text, &cancel).await,
                    None => break,
                },
            }
        }
        if let Some(listener) = self.listener() {
            listener.on_close(&ecu_id, epoch).await;
        }
        debug!(ecu_id = %ecu_id, epoch, "simulated device closed");
    }

    async fn handle_frame(
        &self,
        device: &mut SimulatedDevice,
        text: &str,
        cancel: &CancellationToken,
    ) {
        counter!("ecu_simulator_frames_total").increment(1);
        let request = match decode(text) {
            Ok(Incoming::Request(request)) => request,
            Ok(Incoming::Notification(note)) => {
                debug!(ecu_id = %device.ecu_id(), method = %note.method, "notification received");
                return;
            }
            Ok(Incoming::Response(_)) => return,
            Err(e) => {
                warn!(ecu_id = %device.ecu_id(), error = %e, "undecodable frame");
                return;
            }
        };

        let faults = self.draw_faults();
        let outcome = match device.handle(&self.config, &request.method, request.params, faults) {
            Reply::Drop => {
                let _ = self.counters.commands_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(ecu_id = %device.ecu_id(), method = %request.method, "command dropped");
                return;
            }
            Reply::Answer(outcome) => outcome,
        };
        if !self.config.response_delay.is_zero() {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.response_delay) => {}
            }
        }
        let response = match outcome {
            Ok(result) => {
                let _ = self.counters.commands_answered.fetch_add(1, Ordering::Relaxed);
                Response::success(request.id, result)
            }
            Err(error) => {
                let _ = self.counters.commands_failed.fetch_add(1, Ordering::Relaxed);
                Response::error(Some(request.id), error)
            }
        };
        self.deliver(device.ecu_id(), &response).await;
    }

    async fn deliver<T: Serialize>(&self, ecu_id: &EcuId, message: &T) {
        let Some(listener) = self.listener() else {
            return;
        };
        match encode(message) {
            Ok(text) => listener.on_message(ecu_id, &text).await,
            Err(e) => warn!(ecu_id = %ecu_id, error = %e, "failed to encode simulated frame"),
        }
    }
}

#[async_trait]
impl Transport for SimulatedFleet {
    async fn send(&self, ecu_id: &EcuId, text: String) -> std::result::Result<(), TransportError> {
        let handle = self
            .devices
            .get(ecu_id)
            .ok_or_else(|| TransportError::NoConnection(ecu_id.clone()))?;
        handle
            .inbox
            .send(text)
            .map_err(|_| TransportError::Closed(ecu_id.clone()))
    }
}
