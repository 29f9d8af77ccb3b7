//! Carrier pool health ticker
//!
//! One background task sweeps every slot on a fixed period instead of
//! pinging on every dispatch, which was the dominant bottleneck at high
//! user counts. Per slot per tick: an empty slot gets a fill attempt; a
//! live one gets a PING with a bounded timeout. Consecutive failures at
//! the threshold close the old session and dial a replacement, which is
//! installed only on success, so a slot's session identity changes
//! exactly once per threshold crossing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;

use super::pool::Pool;

/// Consecutive ping failures before a session is replaced.
pub const MAX_HEALTH_CHECK_FAILURES: u32 = 3;

/// Full-sweep period.
const TICK_PERIOD: Duration = Duration::from_secs(15);

/// How sessions are created and probed. The client implements this over
/// real carrier sessions; tests script it.
#[async_trait]
pub trait CarrierFactory: Send + Sync {
    type Session: Send + Sync + 'static;

    async fn create(&self) -> Result<Arc<Self::Session>>;

    /// Bounded-timeout health probe.
    async fn ping(&self, session: &Self::Session) -> Result<()>;

    fn close(&self, session: &Self::Session);
}

pub async fn run<F: CarrierFactory>(
    pool: Arc<Pool<F::Session>>,
    factory: F,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(TICK_PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Startup already filled the pool; the first sweep waits a period.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => return,
        }
        sweep(&pool, &factory).await;
    }
}

/// Visit every slot once.
pub(crate) async fn sweep<F: CarrierFactory>(pool: &Pool<F::Session>, factory: &F) {
    for (i, slot) in pool.slots().enumerate() {
        let Some(conn) = slot.load() else {
            // Empty slot: the original dial failed; keep retrying here.
            match factory.create().await {
                Ok(conn) => {
                    slot.install(conn);
                    info!("connection {} established", i);
                }
                Err(e) => debug!("connection {} still unavailable: {}", i, e),
            }
            continue;
        };

        match factory.ping(&conn).await {
            Ok(()) => slot.reset_fails(),
            Err(e) => {
                let fails = slot.record_failure();
                debug!("connection {} health check failed ({}/{}): {}", i, fails, MAX_HEALTH_CHECK_FAILURES, e);
                if fails >= MAX_HEALTH_CHECK_FAILURES {
                    info!("connection {} unhealthy, reconnecting", i);
                    factory.close(&conn);
                    match factory.create().await {
                        Ok(new_conn) => {
                            slot.install(new_conn);
                            info!("connection {} reconnected successfully", i);
                        }
                        // Degraded until a later tick succeeds.
                        Err(e) => error!("connection {} reconnect failed: {}", i, e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted factory: sessions are ids, pings answer from a queue.
    struct StubFactory {
        next_id: AtomicU32,
        ping_ok: Mutex<Vec<bool>>,
        create_ok: Mutex<Vec<bool>>,
    }

    impl StubFactory {
        fn new(ping_ok: Vec<bool>, create_ok: Vec<bool>) -> Self {
            Self {
                next_id: AtomicU32::new(100),
                ping_ok: Mutex::new(ping_ok),
                create_ok: Mutex::new(create_ok),
            }
        }
    }

    #[async_trait]
    impl CarrierFactory for StubFactory {
        type Session = u32;

        async fn create(&self) -> Result<Arc<u32>> {
            let ok = {
                let mut q = self.create_ok.lock();
                if q.is_empty() { true } else { q.remove(0) }
            };
            if ok {
                Ok(Arc::new(self.next_id.fetch_add(1, Ordering::SeqCst)))
            } else {
                Err(Error::Transport("dial refused".into()))
            }
        }

        async fn ping(&self, _session: &u32) -> Result<()> {
            let ok = {
                let mut q = self.ping_ok.lock();
                if q.is_empty() { true } else { q.remove(0) }
            };
            if ok {
                Ok(())
            } else {
                Err(Error::Timeout)
            }
        }

        fn close(&self, _session: &u32) {}
    }

    #[tokio::test]
    async fn test_replacement_after_threshold() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::new(1));
        pool.slots().next().unwrap().install(Arc::new(1));

        // Two failures: counter rises, identity unchanged.
        let factory = StubFactory::new(vec![false, false], vec![]);
        sweep(&pool, &factory).await;
        sweep(&pool, &factory).await;
        let slot = pool.slots().next().unwrap();
        assert_eq!(slot.fails(), 2);
        assert_eq!(*slot.load().unwrap(), 1);

        // Third failure crosses the threshold: replaced exactly once.
        let factory = StubFactory::new(vec![false], vec![true]);
        sweep(&pool, &factory).await;
        assert_eq!(slot.fails(), 0);
        assert_eq!(*slot.load().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::new(1));
        let slot = pool.slots().next().unwrap();
        slot.install(Arc::new(1));
        slot.record_failure();
        slot.record_failure();

        let factory = StubFactory::new(vec![true], vec![]);
        sweep(&pool, &factory).await;
        assert_eq!(slot.fails(), 0);
        assert_eq!(*slot.load().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_degraded_slot_keeps_old_session() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::new(1));
        let slot = pool.slots().next().unwrap();
        slot.install(Arc::new(7));
        slot.record_failure();
        slot.record_failure();

        // Threshold crossed but the replacement dial fails: identity
        // stays, counter stays at/above the threshold for next tick.
        let factory = StubFactory::new(vec![false], vec![false]);
        sweep(&pool, &factory).await;
        assert_eq!(*slot.load().unwrap(), 7);
        assert!(slot.fails() >= MAX_HEALTH_CHECK_FAILURES);

        // Next tick succeeds and swaps once.
        let factory = StubFactory::new(vec![false], vec![true]);
        sweep(&pool, &factory).await;
        assert_eq!(*slot.load().unwrap(), 100);
        assert_eq!(slot.fails(), 0);
    }

    #[tokio::test]
    async fn test_empty_slot_refilled() {
        let pool: Arc<Pool<u32>> = Arc::new(Pool::new(2));

        let factory = StubFactory::new(vec![], vec![false, true]);
        sweep(&pool, &factory).await;
        let filled: Vec<bool> = pool.slots().map(|s| s.load().is_some()).collect();
        assert_eq!(filled, vec![false, true]);
        assert_eq!(pool.len(), 2);
    }
}
