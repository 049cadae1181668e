// Reconciliation poller - pulls status for invoices the webhooks left open
//
// Every cycle:
// - lists non-terminal invoices older than the grace period, least recently polled first
// - asks each invoice's rail for the current status, with bounded concurrency
// - feeds the answer through the same path as a webhook
//
// A failed fetch is logged and the invoice goes to the back of the queue. Once
// it is past its deadline a failed fetch closes it as expired.

use chrono::Duration as ChronoDuration;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::orchestrator::SettlementOrchestrator;
use super::transactor::SettlementOutcome;
use crate::config::Config;
use crate::error::{AppError, SettlementError};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Invoices younger than this are left to their webhooks
    pub grace: ChronoDuration,
    pub batch_limit: i64,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
}

impl PollerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            grace: ChronoDuration::seconds(config.poll_grace_secs),
            batch_limit: config.poll_batch_limit,
            concurrency: config.poll_concurrency.max(1),
            fetch_timeout: config.rail_timeout(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(90),
            grace: ChronoDuration::seconds(120),
            batch_limit: 100,
            concurrency: 8,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

/// Tally of one reconciliation cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub examined: usize,
    pub credited: usize,
    pub changed: usize,
    pub failed: usize,
}

pub struct ReconciliationPoller {
    config: PollerConfig,
    orchestrator: Arc<SettlementOrchestrator>,
}

impl ReconciliationPoller {
    pub fn new(config: PollerConfig, orchestrator: Arc<SettlementOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Start the poller (runs in background until `shutdown` flips to true)
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "⏰ Reconciliation poller started (every {:?}, grace {}s)",
                self.config.interval,
                self.config.grace.num_seconds()
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = self.run_cycle().await;
                        if summary.examined > 0 {
                            info!(
                                examined = summary.examined,
                                credited = summary.credited,
                                changed = summary.changed,
                                failed = summary.failed,
                                "✓ Reconciliation cycle completed"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Reconciliation poller stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn run_cycle(&self) -> CycleSummary {
        let invoices = match self
            .orchestrator
            .next_poll_batch(self.config.grace, self.config.batch_limit)
            .await
        {
            Ok(invoices) => invoices,
            Err(e) => {
                error!("❌ Failed to list open invoices: {}", e);
                return CycleSummary::default();
            }
        };

        let mut summary = CycleSummary {
            examined: invoices.len(),
            ..CycleSummary::default()
        };

        let timeout = self.config.fetch_timeout;
        let orchestrator = &self.orchestrator;
        let results: Vec<_> = stream::iter(invoices)
            .map(|invoice| async move {
                let result = orchestrator.poll_invoice(&invoice, timeout).await;
                (invoice, result)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for (invoice, result) in results {
            match result {
                Ok(report) => {
                    if matches!(report.outcome, Some(SettlementOutcome::Credited(_))) {
                        summary.credited += 1;
                    } else if report.status != invoice.status {
                        summary.changed += 1;
                    }
                    debug!(invoice = %invoice.id, status = %report.status, "Polled invoice");
                }
                Err(AppError::Settlement(SettlementError::TransientRail { rail, message })) => {
                    summary.failed += 1;
                    warn!(invoice = %invoice.id, rail = %rail, "Rail status fetch failed: {}", message);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(invoice = %invoice.id, rail = %invoice.rail, "Reconciliation failed: {}", e);
                }
            }
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{InvoiceStatus, Rail};
    use crate::ledger::{LedgerStore, MemoryLedgerStore};
    use crate::testing::{self, FakeRail};
    use rust_decimal_macros::dec;

    fn poller(store: Arc<MemoryLedgerStore>, rail: Arc<FakeRail>) -> ReconciliationPoller {
        ReconciliationPoller::new(
            PollerConfig {
                interval: Duration::from_millis(20),
                grace: ChronoDuration::seconds(60),
                ..PollerConfig::default()
            },
            Arc::new(testing::orchestrator(store, rail)),
        )
    }

    #[tokio::test]
    async fn test_cycle_credits_confirmed_invoice() {
        let store = Arc::new(MemoryLedgerStore::new());
        let rail = Arc::new(FakeRail::new());
        let invoice = testing::seed_invoice(&store, Rail::Nowpayments, dec!(900), 3).await;
        rail.set_status(&invoice.external_reference, invoice.owner_account_id, "finished", 3);

        let summary = poller(store.clone(), rail).run_cycle().await;
        assert_eq!(summary.examined, 1);
        assert_eq!(summary.credited, 1);

        let account = store.get_account(invoice.owner_account_id).await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(900));
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_invoice_for_next_cycle() {
        let store = Arc::new(MemoryLedgerStore::new());
        let rail = Arc::new(FakeRail::new());
        let invoice = testing::seed_invoice(&store, Rail::Nowpayments, dec!(900), 3).await;
        rail.set_status(&invoice.external_reference, invoice.owner_account_id, "finished", 3);
        rail.set_failing(true);

        let poller = poller(store.clone(), rail.clone());
        let summary = poller.run_cycle().await;
        assert_eq!(summary.failed, 1);
        let untouched = store.get_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(untouched.status, InvoiceStatus::Pending);

        rail.set_failing(false);
        let summary = poller.run_cycle().await;
        assert_eq!(summary.credited, 1);
    }

    #[tokio::test]
    async fn test_unreachable_invoices_do_not_starve_the_batch() {
        let store = Arc::new(MemoryLedgerStore::new());
        let rail = Arc::new(FakeRail::new());
        // nothing scripted for these two, so their fetches always fail
        let unreachable = testing::seed_invoice(&store, Rail::Nowpayments, dec!(300), 3).await;
        let overdue = testing::seed_expired_invoice(&store, uuid::Uuid::new_v4()).await;
        let fresh = testing::seed_invoice(&store, Rail::Nowpayments, dec!(700), 3).await;
        rail.set_status(&fresh.external_reference, fresh.owner_account_id, "finished", 3);

        let poller = ReconciliationPoller::new(
            PollerConfig {
                batch_limit: 1,
                grace: ChronoDuration::seconds(60),
                ..PollerConfig::default()
            },
            Arc::new(testing::orchestrator(store.clone(), rail)),
        );

        let mut total = CycleSummary::default();
        for _ in 0..3 {
            let summary = poller.run_cycle().await;
            assert_eq!(summary.examined, 1);
            total.credited += summary.credited;
            total.changed += summary.changed;
            total.failed += summary.failed;
        }
        assert_eq!(total.credited, 1);
        assert_eq!(total.changed, 1);
        assert_eq!(total.failed, 1);

        let status = |id: uuid::Uuid| {
            let store = store.clone();
            async move { store.get_invoice(id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(fresh.id).await, InvoiceStatus::Credited);
        assert_eq!(status(overdue.id).await, InvoiceStatus::Expired);
        assert_eq!(status(unreachable.id).await, InvoiceStatus::Pending);
    }

    #[tokio::test]
    async fn test_young_invoices_are_skipped() {
        let store = Arc::new(MemoryLedgerStore::new());
        let rail = Arc::new(FakeRail::new());
        let orchestrator = Arc::new(testing::orchestrator(store.clone(), rail.clone()));
        orchestrator
            .create_invoice(crate::settlement::NewInvoice {
                account_id: uuid::Uuid::new_v4(),
                amount_usd: dec!(150),
                asset: crate::ledger::models::Asset::Btc,
                rail: Rail::Nowpayments,
            })
            .await
            .unwrap();

        let poller = ReconciliationPoller::new(PollerConfig::default(), orchestrator);
        assert_eq!(poller.run_cycle().await.examined, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let store = Arc::new(MemoryLedgerStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = poller(store, Arc::new(FakeRail::new())).start(rx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller did not stop")
            .unwrap();
    }
}
