//! Reconciliation controller.
//!
//! Holds the desired state and the configuration bundle, and on every tick
//! converges the live adapters onto them. Ticks are serialized, so a slow
//! tick delays the next one instead of overlapping with it. Adapter starts
//! and stops run outside the live-instance table lock and are bounded by
//! [`START_TIMEOUT`] and [`STOP_TIMEOUT`].

use crate::bundle::{ConfigBundle, ProtocolConfig};
use crate::error::{ControlError, Result};
use crate::protocol::{DesiredState, ProtocolId};
use crate::registry::{Adapter, Registry};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Longest a single adapter `start` may take before the tick gives up on it
pub const START_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest a single adapter `stop` may take
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// One running adapter and the configuration it was built with
struct LiveInstance {
    adapter: Arc<Adapter>,
    applied: ProtocolConfig,
}

/// Outcome of one reconcile tick
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Protocols started this tick
    pub started: Vec<ProtocolId>,
    /// Protocols stopped this tick, including restarts
    pub stopped: Vec<ProtocolId>,
    /// Protocols that failed, with the reason
    pub failed: Vec<(ProtocolId, ControlError)>,
}

impl ReconcileReport {
    /// Nothing was started, stopped or failed
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

struct Monitor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    registry: Registry,
    desired: RwLock<DesiredState>,
    bundle: RwLock<ConfigBundle>,
    /// Held for a whole tick, and by `stop_monitoring`
    tick: tokio::sync::Mutex<()>,
    /// Never held across an await
    live: Mutex<BTreeMap<ProtocolId, LiveInstance>>,
}

/// Keeps the live adapters converged on the desired state
pub struct Controller {
    inner: Arc<Inner>,
    monitor: Mutex<Option<Monitor>>,
}

impl Controller {
    /// Create a controller with no desired protocols and no timer
    pub fn new(registry: Registry, bundle: ConfigBundle) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                desired: RwLock::new(DesiredState::default()),
                bundle: RwLock::new(bundle),
                tick: tokio::sync::Mutex::new(()),
                live: Mutex::new(BTreeMap::new()),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Replace the desired-state declaration; applied on the next tick
    pub fn set_state(&self, declaration: &str) {
        let desired = DesiredState::parse(declaration);
        info!("Desired state set to [{}]", desired);
        *self.inner.desired.write() = desired;
    }

    /// Current desired state
    pub fn desired_state(&self) -> DesiredState {
        self.inner.desired.read().clone()
    }

    /// Replace the configuration bundle; applied on the next tick
    pub fn set_config(&self, bundle: ConfigBundle) {
        *self.inner.bundle.write() = bundle;
    }

    /// Current configuration bundle
    pub fn config(&self) -> ConfigBundle {
        self.inner.bundle.read().clone()
    }

    /// Run one reconcile tick now
    pub async fn reconcile(&self) -> ReconcileReport {
        self.inner.reconcile().await
    }

    /// Reconcile now, then on every `reconcile_interval_ms`.
    ///
    /// Calling it again restarts the timer with the current interval.
    pub async fn start_monitoring(&self) {
        self.halt_timer().await;
        self.inner.reconcile().await;

        let interval_ms = self.inner.bundle.read().reconcile_interval_ms;
        let every = Duration::from_millis(interval_ms.max(1));
        let (shutdown, mut stopped) = watch::channel(false);
        let inner = self.inner.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                inner.reconcile().await;
            }
            debug!("Reconcile timer stopped");
        });

        info!("Monitoring started, reconciling every {:?}", every);
        *self.monitor.lock() = Some(Monitor { shutdown, task });
    }

    /// Stop the timer, then stop every live adapter.
    ///
    /// Afterwards no adapter is live. A tick in progress finishes first.
    pub async fn stop_monitoring(&self) {
        self.halt_timer().await;

        let _tick = self.inner.tick.lock().await;
        let all = std::mem::take(&mut *self.inner.live.lock());
        join_all(
            all.iter()
                .map(|(id, instance)| stop_adapter(*id, &instance.adapter)),
        )
        .await;
        info!("Monitoring stopped");
    }

    /// Whether the reconcile timer is running
    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Live adapter for `id`
    pub fn instance(&self, id: ProtocolId) -> Option<Arc<Adapter>> {
        self.inner
            .live
            .lock()
            .get(&id)
            .map(|instance| instance.adapter.clone())
    }

    /// Protocols with a live adapter
    pub fn live_protocols(&self) -> Vec<ProtocolId> {
        self.inner.live.lock().keys().copied().collect()
    }

    async fn halt_timer(&self) {
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.shutdown.send(true);
            if let Err(e) = monitor.task.await {
                error!("Reconcile timer task failed: {}", e);
            }
        }
    }
}

impl Inner {
    async fn reconcile(&self) -> ReconcileReport {
        let _tick = self.tick.lock().await;
        let desired = self.desired.read().clone();
        let bundle = self.bundle.read().clone();
        let mut report = ReconcileReport::default();
        let mut stopping = Vec::new();
        let mut starting = Vec::new();

        debug!("Reconciling [{}]", desired);

        {
            let mut live = self.live.lock();
            for id in ProtocolId::ALL {
                if !desired.contains(id) {
                    if let Some(instance) = live.remove(&id) {
                        stopping.push((id, instance.adapter));
                    }
                    continue;
                }

                let Some(config) = bundle.get(id) else {
                    if let Some(instance) = live.remove(&id) {
                        stopping.push((id, instance.adapter));
                    }
                    error!("{} is desired but has no configuration", id);
                    report.failed.push((id, ControlError::MissingConfig(id)));
                    continue;
                };

                if live.get(&id).is_some_and(|i| i.applied == config) {
                    continue;
                }

                if let Some(instance) = live.remove(&id) {
                    info!("Configuration of {} changed, restarting", id);
                    stopping.push((id, instance.adapter));
                }
                starting.push((id, config));
            }
        }

        join_all(stopping.iter().map(|(id, adapter)| stop_adapter(*id, adapter))).await;
        report.stopped = stopping.into_iter().map(|(id, _)| id).collect();

        let launches = starting.into_iter().map(|(id, config)| async move {
            let outcome = self.launch(id, &config).await;
            if let Ok(adapter) = &outcome {
                self.live.lock().insert(
                    id,
                    LiveInstance {
                        adapter: adapter.clone(),
                        applied: config,
                    },
                );
            }
            (id, outcome)
        });

        for (id, outcome) in join_all(launches).await {
            match outcome {
                Ok(_) => report.started.push(id),
                Err(e) => {
                    error!("Failed to start {}: {}", id, e);
                    report.failed.push((id, e));
                }
            }
        }

        report
    }

    async fn launch(&self, id: ProtocolId, config: &ProtocolConfig) -> Result<Arc<Adapter>> {
        let adapter = self.registry.build(config)?;
        let lifecycle = adapter.as_protocol();
        let failure = match tokio::time::timeout(START_TIMEOUT, lifecycle.start()).await {
            Ok(Ok(())) => None,
            Ok(Err(source)) => Some(ControlError::Start {
                protocol: id,
                source,
            }),
            Err(_) => Some(ControlError::StartTimeout {
                protocol: id,
                after: START_TIMEOUT,
            }),
        };
        if let Some(e) = failure {
            stop_adapter(id, &adapter).await;
            return Err(e);
        }
        info!("Started {} ({:?})", id, lifecycle.state());
        Ok(Arc::new(adapter))
    }
}

async fn stop_adapter(id: ProtocolId, adapter: &Adapter) {
    match tokio::time::timeout(STOP_TIMEOUT, adapter.as_protocol().stop()).await {
        Ok(()) => info!("Stopped {}", id),
        Err(_) => warn!("{} did not stop within {:?}", id, STOP_TIMEOUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proxima_adapters::{TcpClientConfig, UdpClientConfig, WsServerConfig};
    use proxima_session::{
        AdapterError, ConnectionState, Pipeline, ProtocolAdapter, StatsSnapshot,
    };
    use proxima_wire::Record;

    /// Lifecycle calls seen by the fake adapters, as `"<event> <port>"`
    type Journal = Arc<Mutex<Vec<String>>>;

    struct FakeAdapter {
        protocol: &'static str,
        port: u16,
        fail_start: bool,
        hang_start: bool,
        state: Mutex<ConnectionState>,
        journal: Journal,
    }

    #[async_trait]
    impl ProtocolAdapter for FakeAdapter {
        fn protocol(&self) -> &'static str {
            self.protocol
        }

        async fn start(&self) -> proxima_session::Result<()> {
            self.journal.lock().push(format!("start {}", self.port));
            if self.fail_start {
                return Err(AdapterError::Config("missing certificate".into()));
            }
            if self.hang_start {
                futures::future::pending::<()>().await;
            }
            *self.state.lock() = ConnectionState::Connected;
            Ok(())
        }

        async fn stop(&self) {
            self.journal.lock().push(format!("stop {}", self.port));
            *self.state.lock() = ConnectionState::Disconnected;
        }

        fn state(&self) -> ConnectionState {
            *self.state.lock()
        }

        fn received_parsed_message(&self) -> Record {
            Record::new()
        }

        fn stats(&self) -> StatsSnapshot {
            StatsSnapshot::default()
        }
    }

    fn fake_registry(
        journal: &Journal,
        failing: Option<ProtocolId>,
        hanging: Option<ProtocolId>,
    ) -> Registry {
        let mut registry = Registry::new();
        for id in ProtocolId::ALL {
            let journal = journal.clone();
            registry = registry.with_factory(id, move |config, _pipeline| {
                let port = match config {
                    ProtocolConfig::WsServer(c) => c.port,
                    ProtocolConfig::TcpClient(c) => c.port,
                    ProtocolConfig::UdpClient(c) => c.port,
                    _ => 0,
                };
                Ok(Adapter::Custom(Arc::new(FakeAdapter {
                    protocol: id.as_str(),
                    port,
                    fail_start: failing == Some(id),
                    hang_start: hanging == Some(id),
                    state: Mutex::new(ConnectionState::Disconnected),
                    journal: journal.clone(),
                })))
            });
        }
        registry
    }

    fn ws_server(port: u16) -> ConfigBundle {
        ConfigBundle::default().with(ProtocolConfig::WsServer(WsServerConfig::on_port(port)))
    }

    fn tcp_client(port: u16) -> ProtocolConfig {
        ProtocolConfig::TcpClient(TcpClientConfig::new("127.0.0.1", port))
    }

    fn entries(journal: &Journal) -> Vec<String> {
        std::mem::take(&mut *journal.lock())
    }

    #[tokio::test]
    async fn test_change_detection() {
        let journal = Journal::default();
        let controller = Controller::new(fake_registry(&journal, None, None), ws_server(8081));
        controller.set_state("ws_server");

        let report = controller.reconcile().await;
        assert_eq!(report.started, vec![ProtocolId::WsServer]);
        assert_eq!(entries(&journal), vec!["start 8081"]);

        // Unchanged configuration: nothing happens
        assert!(controller.reconcile().await.is_noop());
        assert!(entries(&journal).is_empty());

        // Structurally equal but freshly built configuration: still nothing
        controller.set_config(ws_server(8081));
        assert!(controller.reconcile().await.is_noop());

        controller.set_config(ws_server(9090));
        let report = controller.reconcile().await;
        assert_eq!(report.stopped, vec![ProtocolId::WsServer]);
        assert_eq!(report.started, vec![ProtocolId::WsServer]);
        assert_eq!(entries(&journal), vec!["stop 8081", "start 9090"]);
    }

    #[tokio::test]
    async fn test_removal_stops_once() {
        let journal = Journal::default();
        let bundle = ws_server(8081).with(tcp_client(9000));
        let controller = Controller::new(fake_registry(&journal, None, None), bundle);
        controller.set_state("ws_server, tcp_client");
        controller.reconcile().await;
        assert_eq!(
            controller.live_protocols(),
            vec![ProtocolId::WsServer, ProtocolId::TcpClient]
        );
        entries(&journal);

        controller.set_state("ws_server");
        let report = controller.reconcile().await;
        assert_eq!(report.stopped, vec![ProtocolId::TcpClient]);
        assert_eq!(entries(&journal), vec!["stop 9000"]);
        assert!(controller.instance(ProtocolId::TcpClient).is_none());

        assert!(controller.reconcile().await.is_noop());
        assert!(entries(&journal).is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_is_isolated_and_retried() {
        let journal = Journal::default();
        let bundle = ws_server(8081).with(tcp_client(9000));
        let registry = fake_registry(&journal, Some(ProtocolId::WsServer), None);
        let controller = Controller::new(registry, bundle);
        controller.set_state("ws_server,tcp_client");

        let report = controller.reconcile().await;
        assert_eq!(report.started, vec![ProtocolId::TcpClient]);
        assert!(matches!(
            report.failed.as_slice(),
            [(ProtocolId::WsServer, ControlError::Start { .. })]
        ));
        assert!(controller.instance(ProtocolId::WsServer).is_none());
        assert_eq!(controller.live_protocols(), vec![ProtocolId::TcpClient]);

        // No instance was recorded, so the next tick tries again
        entries(&journal);
        let report = controller.reconcile().await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(entries(&journal), vec!["start 8081", "stop 8081"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_start_is_bounded() {
        let journal = Journal::default();
        let bundle = ws_server(8081).with(tcp_client(9000));
        let registry = fake_registry(&journal, None, Some(ProtocolId::WsServer));
        let controller = Arc::new(Controller::new(registry, bundle));
        controller.set_state("ws_server,tcp_client");

        let tick = tokio::spawn({
            let controller = controller.clone();
            async move { controller.reconcile().await }
        });

        // The other protocol is up and queryable while ws_server hangs
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!tick.is_finished());
        assert_eq!(controller.live_protocols(), vec![ProtocolId::TcpClient]);
        assert!(controller.instance(ProtocolId::TcpClient).is_some());

        let report = tick.await.unwrap();
        assert_eq!(report.started, vec![ProtocolId::TcpClient]);
        assert!(matches!(
            report.failed.as_slice(),
            [(ProtocolId::WsServer, ControlError::StartTimeout { .. })]
        ));
        assert!(controller.instance(ProtocolId::WsServer).is_none());
        entries(&journal);

        // stop_monitoring waits out a hung tick, then stops everything
        let retry = tokio::spawn({
            let controller = controller.clone();
            async move { controller.reconcile().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        tokio::time::timeout(
            START_TIMEOUT + STOP_TIMEOUT,
            controller.stop_monitoring(),
        )
        .await
        .expect("stop_monitoring blocked by a hung start");
        assert!(controller.live_protocols().is_empty());
        assert_eq!(retry.await.unwrap().failed.len(), 1);
        assert_eq!(entries(&journal), vec!["start 8081", "stop 8081", "stop 9000"]);
    }

    #[tokio::test]
    async fn test_missing_config_reported() {
        let journal = Journal::default();
        let controller = Controller::new(fake_registry(&journal, None, None), ConfigBundle::default());
        controller.set_state("udp_client");

        let report = controller.reconcile().await;
        assert!(matches!(
            report.failed.as_slice(),
            [(ProtocolId::UdpClient, ControlError::MissingConfig(_))]
        ));
        assert!(controller.live_protocols().is_empty());

        controller.set_config(ConfigBundle::default().with(ProtocolConfig::UdpClient(
            UdpClientConfig {
                host: "127.0.0.1".into(),
                port: 7000,
                remote_host: "127.0.0.1".into(),
                remote_port: 7001,
                reconnect_interval_ms: 5000,
            },
        )));
        let report = controller.reconcile().await;
        assert_eq!(report.started, vec![ProtocolId::UdpClient]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_applies_changes_on_tick() {
        let journal = Journal::default();
        let bundle = ConfigBundle {
            reconcile_interval_ms: 1000,
            ..ws_server(8081)
        };
        let controller = Controller::new(fake_registry(&journal, None, None), bundle);
        controller.set_state("ws_server");

        controller.start_monitoring().await;
        assert!(controller.is_monitoring());
        assert_eq!(entries(&journal), vec!["start 8081"]);

        controller.set_config(ConfigBundle {
            reconcile_interval_ms: 1000,
            ..ws_server(9090)
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(entries(&journal), vec!["stop 8081", "start 9090"]);

        controller.stop_monitoring().await;
        assert!(!controller.is_monitoring());
        assert_eq!(entries(&journal), vec!["stop 9090"]);
        assert!(controller.live_protocols().is_empty());

        // No ticks after stop_monitoring
        controller.set_config(ws_server(7070));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(entries(&journal).is_empty());
    }

    #[tokio::test]
    async fn test_end_to_end_ws_server() {
        let bundle = ConfigBundle::default().with(ProtocolConfig::WsServer(WsServerConfig {
            host: "127.0.0.1".into(),
            ..WsServerConfig::on_port(0)
        }));
        let registry = Registry::new().with_default_pipeline(Pipeline::new());
        let controller = Controller::new(registry, bundle);
        controller.set_state("ws_server");

        controller.reconcile().await;
        assert_eq!(controller.live_protocols(), vec![ProtocolId::WsServer]);
        let adapter = controller.instance(ProtocolId::WsServer).unwrap();
        let server = adapter.as_ws_server().unwrap();
        assert_eq!(server.config().port, 0);
        assert_eq!(server.state(), ConnectionState::Connected);
        assert!(server.local_addr().is_ok());

        controller.set_state("");
        controller.reconcile().await;
        assert!(controller.live_protocols().is_empty());
        assert_eq!(adapter.as_protocol().state(), ConnectionState::Disconnected);
    }
}
