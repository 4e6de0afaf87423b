use crate::actuator::ActuatorClient;
use crate::config::Config;
use crate::hub::{ListenerError, StreamListener, SENSOR_EVENT};
use crate::policy::{decide, Action, PolicyError, ThresholdConfig};
use crate::store::{build_pool, ActionResult, EventSink, EventStore, PersistedEvent, SaveOutcome, StoreError};
use crate::telemetry::{parse_sensor_payload, PayloadError};
use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct ControllerStats {
    pub received: AtomicU64,
    pub dropped: AtomicU64,
    pub actuated: AtomicU64,
    pub actuation_failures: AtomicU64,
    pub persisted: AtomicU64,
    pub duplicates: AtomicU64,
    pub persist_failures: AtomicU64,
    pub hub_connected: AtomicBool,
}

impl ControllerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hub_connected(&self, connected: bool) {
        self.hub_connected.store(connected, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn log_summary(&self) {
        tracing::info!(
            received = self.received.load(Ordering::Relaxed),
            dropped = self.dropped.load(Ordering::Relaxed),
            actuated = self.actuated.load(Ordering::Relaxed),
            actuation_failures = self.actuation_failures.load(Ordering::Relaxed),
            persisted = self.persisted.load(Ordering::Relaxed),
            duplicates = self.duplicates.load(Ordering::Relaxed),
            persist_failures = self.persist_failures.load(Ordering::Relaxed),
            hub_connected = self.hub_connected.load(Ordering::Relaxed),
            "controller stats"
        );
    }
}

pub struct Controller {
    thresholds: ThresholdConfig,
    ticks: u32,
    actuator: ActuatorClient,
    sink: Arc<dyn EventSink>,
    stats: Arc<ControllerStats>,
}

impl Controller {
    pub fn new(
        thresholds: ThresholdConfig,
        ticks: u32,
        actuator: ActuatorClient,
        sink: Arc<dyn EventSink>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        Self {
            thresholds,
            ticks,
            actuator,
            sink,
            stats,
        }
    }

    /// One full pass for a hub event: parse, decide, actuate, persist.
    pub async fn process(&self, arguments: &[Value]) -> Result<(PersistedEvent, SaveOutcome), EventError> {
        let reading = parse_sensor_payload(arguments)?;
        tracing::info!(
            timestamp = %reading.timestamp,
            temperature = reading.temperature,
            "sensor reading received"
        );

        let action = decide(reading.temperature, &self.thresholds)?;
        let result = self.actuate(action).await;
        let event = PersistedEvent::new(&reading, result);
        let outcome = self.sink.save(&event).await?;
        Ok((event, outcome))
    }

    async fn actuate(&self, action: Action) -> ActionResult {
        if !action.requires_actuation() {
            return ActionResult::NoAction;
        }
        match self.actuator.send(action, self.ticks).await {
            Ok(status) => {
                ControllerStats::bump(&self.stats.actuated);
                tracing::info!(%action, ticks = self.ticks, response = %status, "HVAC actuated");
                ActionResult::Actuated { action, status }
            }
            Err(err) => {
                ControllerStats::bump(&self.stats.actuation_failures);
                tracing::warn!(%action, error = %err, "HVAC actuation failed; recording failure");
                ActionResult::Failed {
                    action,
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Listener entry point. Never fails: every error is logged and counted.
    pub async fn handle(&self, arguments: Vec<Value>) {
        ControllerStats::bump(&self.stats.received);
        match self.process(&arguments).await {
            Ok((event, SaveOutcome::Inserted)) => {
                ControllerStats::bump(&self.stats.persisted);
                tracing::debug!(id = %event.id, action = %event.action.action(), "event persisted");
            }
            Ok((event, SaveOutcome::Duplicate)) => {
                ControllerStats::bump(&self.stats.duplicates);
                tracing::info!(id = %event.id, "duplicate reading ignored");
            }
            Err(EventError::Payload(err)) => {
                ControllerStats::bump(&self.stats.dropped);
                tracing::warn!(error = %err, "dropping malformed sensor event");
            }
            Err(EventError::Policy(err)) => {
                ControllerStats::bump(&self.stats.dropped);
                tracing::warn!(error = %err, "dropping sensor event");
            }
            Err(EventError::Store(err)) => {
                ControllerStats::bump(&self.stats.persist_failures);
                tracing::error!(error = %err, "failed to persist sensor reading; event lost");
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "unable to listen for SIGTERM"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

pub async fn run(config: Config) -> Result<()> {
    tracing::info!("connecting to database");
    let pool = build_pool(&config.database)
        .await
        .context("failed to open database pool")?;
    let store = EventStore::new(pool).with_write_timeout(config.database.write_timeout());
    if config.database.bootstrap_schema {
        store
            .ensure_schema()
            .await
            .context("failed to create sensor table")?;
    }

    let result = serve(&config, Arc::new(store.clone()), shutdown_signal()).await;
    store.close().await;
    result
}

/// Runs the hub subscription against `sink` until `shutdown` resolves or the
/// listener fails for good.
pub async fn serve<F>(config: &Config, sink: Arc<dyn EventSink>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let actuator = ActuatorClient::from_config(config).context("failed to build HVAC client")?;
    let stats = Arc::new(ControllerStats::new());
    let controller = Arc::new(Controller::new(
        config.thresholds,
        config.ticks,
        actuator,
        sink,
        stats.clone(),
    ));

    let mut listener = StreamListener::new(&config.host, &config.token, config.hub.clone())
        .context("invalid hub configuration")?;
    listener.on_event(SENSOR_EVENT, move |arguments| {
        let controller = controller.clone();
        async move { controller.handle(arguments).await }
    });
    let open_stats = stats.clone();
    listener.on_open(move || {
        open_stats.set_hub_connected(true);
        tracing::info!("sensor hub connection opened");
    });
    let close_stats = stats.clone();
    listener.on_close(move || {
        close_stats.set_hub_connected(false);
        tracing::info!("sensor hub connection closed");
    });
    listener.on_error(|err: &ListenerError| {
        tracing::warn!(error = %err, "sensor hub error");
    });

    let mut handle = listener.start();
    tracing::info!(
        t_min = config.thresholds.t_min,
        t_max = config.thresholds.t_max,
        ticks = config.ticks,
        "hvac controller running; press ctrl-c to stop"
    );

    let fatal = tokio::select! {
        res = handle.finished() => Some(res),
        _ = shutdown => None,
    };
    let listener_result = match fatal {
        Some(Ok(())) => Err(ListenerError::Task("listener exited without a stop request".into())),
        Some(Err(err)) => Err(err),
        None => {
            tracing::info!("shutdown signal received");
            handle.stop();
            handle.finished().await
        }
    };

    tracing::info!(state = ?handle.state(), "hub listener finished");
    stats.log_summary();

    if let Err(err) = listener_result {
        bail!("sensor hub listener failed: {err}");
    }
    tracing::info!("shutdown complete");
    Ok(())
}
