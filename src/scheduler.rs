//! Periodic renewal of the certificate.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

use crate::validator::CertStatus;

/// One check-and-maybe-renew cycle, resolving to whether a new certificate was obtained.
pub trait Renewal: Send + Sync + 'static {
    fn status(&self) -> CertStatus;

    fn renew(&self) -> impl Future<Output = eyre::Result<bool>> + Send;
}

pub struct RenewalScheduler<R> {
    renewal: Arc<R>,
    interval: Duration,
    running: AtomicBool,
    last: ArcSwap<CertStatus>,
}

impl<R: Renewal> RenewalScheduler<R> {
    pub fn new(renewal: Arc<R>, interval: Duration) -> Self {
        Self {
            renewal,
            interval,
            running: AtomicBool::new(false),
            last: ArcSwap::from_pointee(CertStatus {
                valid: false,
                remaining_days: 0.0,
                problem: None,
            }),
        }
    }

    /// Outcome of the most recent check.
    pub fn last_status(&self) -> Arc<CertStatus> {
        self.last.load_full()
    }

    /// Spawn the renewal loop. `on_renew` is called after every successful renewal.
    pub fn start<F>(self: Arc<Self>, on_renew: F) -> JoinHandle<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(self.interval).await;

                match self.cycle().await {
                    Some(true) => on_renew(),
                    Some(false) | None => {}
                }
            }
        })
    }

    /// Run one cycle. Returns `None` if another cycle was still in progress.
    pub async fn cycle(&self) -> Option<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("previous renewal cycle still running, skipping");
            return None;
        }

        let renewed = self.check_and_renew().await;
        self.running.store(false, Ordering::Release);

        Some(renewed)
    }

    async fn check_and_renew(&self) -> bool {
        let status = self.renewal.status();
        let valid = status.valid;
        self.last.store(Arc::new(status));

        if valid {
            debug!("certificate still valid, nothing to renew");
            return false;
        }

        info!("renewing certificate");
        match self.renewal.renew().await {
            Ok(true) => {
                self.last.store(Arc::new(self.renewal.status()));
                true
            }
            Ok(false) => {
                warn!("certificate renewal failed, retrying in {:?}", self.interval);
                false
            }
            Err(e) => {
                error!("certificate renewal aborted: {e:?}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;

    struct Fake {
        valid: bool,
        renewals: AtomicUsize,
        gate: Notify,
    }

    impl Fake {
        fn new(valid: bool) -> Arc<Self> {
            Arc::new(Self {
                valid,
                renewals: AtomicUsize::new(0),
                gate: Notify::new(),
            })
        }
    }

    impl Renewal for Fake {
        fn status(&self) -> CertStatus {
            CertStatus {
                valid: self.valid,
                remaining_days: if self.valid { 60.0 } else { 2.0 },
                problem: None,
            }
        }

        async fn renew(&self) -> eyre::Result<bool> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn valid_certificate_is_not_renewed() {
        let fake = Fake::new(true);
        let scheduler = RenewalScheduler::new(Arc::clone(&fake), Duration::from_secs(60));

        assert_eq!(scheduler.cycle().await, Some(false));
        assert_eq!(fake.renewals.load(Ordering::SeqCst), 0);
        assert!(scheduler.last_status().valid);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let fake = Fake::new(false);
        let scheduler = Arc::new(RenewalScheduler::new(
            Arc::clone(&fake),
            Duration::from_secs(60),
        ));

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.cycle().await }
        });

        while fake.renewals.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(scheduler.cycle().await, None);

        fake.gate.notify_one();
        assert_eq!(first.await.unwrap(), Some(true));
        assert_eq!(fake.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_reports_renewals() {
        let fake = Fake::new(false);
        fake.gate.notify_one();
        let scheduler = Arc::new(RenewalScheduler::new(
            Arc::clone(&fake),
            Duration::from_secs(60),
        ));

        let renewed = Arc::new(Notify::new());
        let handle = scheduler.start({
            let renewed = Arc::clone(&renewed);
            move || renewed.notify_one()
        });

        renewed.notified().await;
        handle.abort();

        assert_eq!(fake.renewals.load(Ordering::SeqCst), 1);
    }
}
