//! Reachability monitoring by periodic TCP probes

use super::{ReachabilityHandler, ReachabilityMonitor, SubscriptionToken};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Dials a fixed endpoint on an interval and reports path changes
///
/// Handlers are called with `true` when the path is usable and `false` when
/// it is not, only when the state changes. The first probe result is
/// reported only if the path is down.
pub struct ProbeReachability {
    probe: String,
    every: Duration,
    next_token: AtomicU64,
    tasks: Mutex<HashMap<SubscriptionToken, CancellationToken>>,
}

impl ProbeReachability {
    pub fn new(probe: impl Into<String>, every: Duration) -> Self {
        ProbeReachability {
            probe: probe.into(),
            every,
            next_token: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.tasks.lock().len()
    }

    async fn probe_once(addr: &str) -> bool {
        match timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Reachability probe {} failed: {}", addr, e);
                false
            }
            Err(_) => {
                debug!("Reachability probe {} timed out", addr);
                false
            }
        }
    }
}

impl ReachabilityMonitor for ProbeReachability {
    fn subscribe(&self, handler: ReachabilityHandler) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        self.tasks.lock().insert(token, cancel.clone());

        let addr = self.probe.clone();
        let every = self.every;

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last = true;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let reachable = tokio::select! {
                    _ = cancel.cancelled() => break,
                    r = Self::probe_once(&addr) => r,
                };
                if reachable != last {
                    info!("Reachability of {} changed: {}", addr, reachable);
                    last = reachable;
                    handler(reachable);
                }
            }
            debug!("Reachability probe for {} stopped", addr);
        });

        debug!("Reachability subscription {:?} on {}", token, self.probe);
        token
    }

    fn cancel(&self, token: SubscriptionToken) {
        if let Some(cancel) = self.tasks.lock().remove(&token) {
            cancel.cancel();
            debug!("Reachability subscription {:?} cancelled", token);
        }
    }
}

impl Drop for ProbeReachability {
    fn drop(&mut self) {
        for (_, cancel) in self.tasks.get_mut().drain() {
            cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_reports_unreachable_probe() {
        // Bind and drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let monitor = ProbeReachability::new(addr, Duration::from_millis(20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = monitor.subscribe(Arc::new(move |reachable: bool| {
            let _ = tx.send(reachable);
        }));

        let first = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first, Some(false));

        monitor.cancel(token);
        assert_eq!(monitor.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_reachable_probe_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let monitor = ProbeReachability::new(addr, Duration::from_millis(20));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let token = monitor.subscribe(Arc::new(move |reachable: bool| {
            let _ = tx.send(reachable);
        }));

        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
        monitor.cancel(token);
        drop(listener);
    }
}
