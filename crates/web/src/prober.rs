//! Liveness prober
//!
//! Background loop that re-validates every registered endpoint with a TCP
//! connect probe and flips its status between `active` and `inactive`.
//! The loop is never fatal: a failed cycle is logged and retried after a
//! longer backoff.

use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vncdesk_common::{now_epoch_secs, Endpoint, EndpointStatus, Result};

use crate::activity::{actions, ActivityLog};
use crate::registry::ConnectionRegistry;

/// Probes in flight at once within one cycle
const PROBE_CONCURRENCY: usize = 16;

/// Prober timing
#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Pause between successful cycles
    pub interval: Duration,
    /// Bound on a single reachability check
    pub probe_timeout: Duration,
    /// Pause after a failed cycle
    pub error_backoff: Duration,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(3),
            error_backoff: Duration::from_secs(60),
        }
    }
}

/// A status change applied by a probe cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub endpoint_id: String,
    pub from: EndpointStatus,
    pub to: EndpointStatus,
}

pub struct LivenessProber {
    registry: ConnectionRegistry,
    activity: ActivityLog,
    config: ProberConfig,
}

impl LivenessProber {
    pub fn new(registry: ConnectionRegistry, activity: ActivityLog, config: ProberConfig) -> Self {
        Self {
            registry,
            activity,
            config,
        }
    }

    /// Start the loop on the runtime. It stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Run the probe loop until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Liveness prober started (interval {:?}, timeout {:?})",
            self.config.interval, self.config.probe_timeout
        );

        loop {
            let pause = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.probe_cycle() => match result {
                    Ok(transitions) => {
                        debug!("Probe cycle applied {} transition(s)", transitions.len());
                        self.config.interval
                    }
                    Err(e) => {
                        error!("Probe cycle failed: {}", e);
                        self.config.error_backoff
                    }
                },
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Liveness prober stopped");
    }

    /// Probe every addressed endpoint once and write back changed statuses.
    pub async fn probe_cycle(&self) -> Result<Vec<StatusTransition>> {
        let endpoints = self
            .registry
            .blocking(|registry| registry.list_with_address())
            .await?;

        let results: Vec<(Endpoint, bool)> = futures::stream::iter(endpoints)
            .map(|endpoint| async move {
                let reachable = self.probe(&endpoint).await;
                (endpoint, reachable)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        let mut transitions = Vec::new();
        for (endpoint, reachable) in results {
            let observed = if reachable {
                EndpointStatus::Active
            } else {
                EndpointStatus::Inactive
            };
            if observed == endpoint.status {
                continue;
            }

            // A failed write only skips this endpoint; the cycle goes on.
            let id = endpoint.id.clone();
            let written = self
                .registry
                .blocking(move |registry| registry.set_status(&id, observed, now_epoch_secs()))
                .await;
            if let Err(e) = written {
                warn!("Failed to update status of {}: {}", endpoint.id, e);
                continue;
            }

            info!(
                "Endpoint {} ({}) {} -> {}",
                endpoint.id, endpoint.name, endpoint.status, observed
            );
            self.activity
                .record(
                    &endpoint.id,
                    actions::STATUS_AUTO_UPDATE,
                    &format!("Status changed from {} to {}", endpoint.status, observed),
                    None,
                )
                .await;
            transitions.push(StatusTransition {
                endpoint_id: endpoint.id,
                from: endpoint.status,
                to: observed,
            });
        }

        Ok(transitions)
    }

    /// Bounded TCP connect against the endpoint's VNC port
    async fn probe(&self, endpoint: &Endpoint) -> bool {
        let Some(address) = endpoint.dial_address() else {
            return false;
        };

        match tokio::time::timeout(
            self.config.probe_timeout,
            TcpStream::connect((address, endpoint.port)),
        )
        .await
        {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!("Probe {}:{} failed: {}", address, endpoint.port, e);
                false
            }
            Err(_) => {
                debug!("Probe {}:{} timed out", address, endpoint.port);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use vncdesk_common::{Database, NewEndpoint};

    fn fast_config() -> ProberConfig {
        ProberConfig {
            interval: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(500),
            error_backoff: Duration::from_millis(20),
        }
    }

    fn setup() -> (ConnectionRegistry, ActivityLog, LivenessProber) {
        let db = Database::open_memory().unwrap();
        let registry = ConnectionRegistry::new(db.clone());
        let activity = ActivityLog::new(db);
        let prober = LivenessProber::new(registry.clone(), activity.clone(), fast_config());
        (registry, activity, prober)
    }

    fn add_endpoint(registry: &ConnectionRegistry, key: &str, port: u16) -> Endpoint {
        registry
            .create(
                NewEndpoint {
                    name: format!("pc-{}", key),
                    location: "Lab".into(),
                    country: "Russia".into(),
                    city: "Moscow".into(),
                },
                key,
                port,
                "pw",
            )
            .unwrap()
    }

    /// A port with nothing listening on it
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_unaddressed_endpoints_are_skipped() {
        let (registry, _activity, prober) = setup();
        let ep = add_endpoint(&registry, "k1", closed_port().await);
        let transitions = prober.probe_cycle().await.unwrap();
        assert!(transitions.is_empty());
        assert_eq!(registry.lookup(&ep.id).unwrap().status, EndpointStatus::Inactive);
    }

    #[tokio::test]
    async fn test_unreachable_active_endpoint_goes_inactive() {
        let (registry, activity, prober) = setup();
        let ep = add_endpoint(&registry, "k1", closed_port().await);
        registry.set_address(&ep.id, "127.0.0.1").unwrap();
        registry.set_status(&ep.id, EndpointStatus::Active, 0).unwrap();

        let transitions = prober.probe_cycle().await.unwrap();
        assert_eq!(
            transitions,
            vec![StatusTransition {
                endpoint_id: ep.id.clone(),
                from: EndpointStatus::Active,
                to: EndpointStatus::Inactive,
            }]
        );
        let stored = registry.lookup(&ep.id).unwrap();
        assert_eq!(stored.status, EndpointStatus::Inactive);
        assert!(stored.last_seen.unwrap() > 0);

        let log = activity.for_endpoint(&ep.id, 10).unwrap();
        assert_eq!(log[0].action, actions::STATUS_AUTO_UPDATE);
        assert_eq!(log[0].details, "Status changed from active to inactive");
    }

    #[tokio::test]
    async fn test_unchanged_status_is_not_rewritten() {
        let (registry, activity, prober) = setup();
        let ep = add_endpoint(&registry, "k1", closed_port().await);
        registry.set_address(&ep.id, "127.0.0.1").unwrap();

        assert!(prober.probe_cycle().await.unwrap().is_empty());
        assert!(registry.lookup(&ep.id).unwrap().last_seen.is_none());
        assert!(activity.for_endpoint(&ep.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_failing_endpoint_does_not_stop_the_cycle() {
        let (registry, _activity, prober) = setup();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let bad = add_endpoint(&registry, "bad", 5900);
        registry.set_address(&bad.id, "host.invalid").unwrap();
        let good = add_endpoint(&registry, "good", port);
        registry.set_address(&good.id, "127.0.0.1").unwrap();

        let transitions = prober.probe_cycle().await.unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].endpoint_id, good.id);
        assert_eq!(registry.lookup(&good.id).unwrap().status, EndpointStatus::Active);
        assert_eq!(registry.lookup(&bad.id).unwrap().status, EndpointStatus::Inactive);
    }

    #[tokio::test]
    async fn test_store_failure_fails_the_cycle_not_the_loop() {
        let (registry, _activity, prober) = setup();
        {
            let conn = registry.db().connection();
            let conn = conn.lock();
            conn.execute_batch("DROP TABLE endpoints;").unwrap();
        }
        assert!(prober.probe_cycle().await.is_err());

        let cancel = CancellationToken::new();
        let handle = prober.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
