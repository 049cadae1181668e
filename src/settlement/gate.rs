use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::error::AppResult;
use crate::ledger::models::{Admission, IdempotencyRecord, SettlementEvent};
use crate::ledger::LedgerStore;

/// Exactly-once admission of settlement events.
///
/// Two deliveries that carry the same rail, reference, vendor status,
/// confirmation count and tx hash are the same event. Anything that moved
/// (more confirmations, a new status) is a new event.
pub struct IdempotencyGate {
    store: Arc<dyn LedgerStore>,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn dedup_key(event: &SettlementEvent) -> String {
        let mut hasher = Sha256::new();
        hasher.update(event.rail.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(event.external_reference.as_bytes());
        hasher.update([0u8]);
        hasher.update(event.raw_status.to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(event.confirmations.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(event.tx_hash.as_deref().unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Durably record the event before anything is applied
    pub async fn admit(&self, event: &SettlementEvent) -> AppResult<(String, Admission)> {
        let dedup_key = Self::dedup_key(event);
        let record = IdempotencyRecord {
            dedup_key: dedup_key.clone(),
            rail: event.rail,
            external_reference: event.external_reference.clone(),
            processed_at: Utc::now(),
            applied_at: None,
        };

        let admission = self.store.insert_idempotency_record(&record).await?;
        debug!(
            rail = %event.rail,
            reference = %event.external_reference,
            ?admission,
            "Gate admission"
        );
        Ok((dedup_key, admission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{ObservedStatus, Rail};
    use crate::ledger::MemoryLedgerStore;

    fn event(confirmations: u32) -> SettlementEvent {
        SettlementEvent {
            external_reference: "5077125051".into(),
            rail: Rail::Nowpayments,
            observed: ObservedStatus::Pending,
            raw_status: "confirming".into(),
            amount_reported: None,
            confirmations,
            tx_hash: Some("9f2c".into()),
            account_hint: None,
            asset: None,
        }
    }

    #[test]
    fn test_key_changes_when_event_moves() {
        assert_eq!(IdempotencyGate::dedup_key(&event(1)), IdempotencyGate::dedup_key(&event(1)));
        assert_ne!(IdempotencyGate::dedup_key(&event(1)), IdempotencyGate::dedup_key(&event(2)));

        let mut other_rail = event(1);
        other_rail.rail = Rail::Bitpay;
        assert_ne!(IdempotencyGate::dedup_key(&event(1)), IdempotencyGate::dedup_key(&other_rail));
    }

    #[tokio::test]
    async fn test_repeat_delivery_before_apply_is_unapplied() {
        let gate = IdempotencyGate::new(Arc::new(MemoryLedgerStore::new()));
        let (key, first) = gate.admit(&event(1)).await.unwrap();
        let (again, second) = gate.admit(&event(1)).await.unwrap();
        assert_eq!(key, again);
        assert_eq!(first, Admission::New);
        assert_eq!(second, Admission::Unapplied);
    }
}
