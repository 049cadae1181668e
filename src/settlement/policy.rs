use chrono::{DateTime, Utc};

use crate::ledger::models::{Invoice, InvoiceStatus, ObservedStatus, SettlementEvent};

/// Maps an observed event onto the invoice state machine. Total and pure:
/// every (event, invoice, now) yields a status, nothing is read or written.
pub struct ConfirmationPolicy;

impl ConfirmationPolicy {
    pub fn evaluate(event: &SettlementEvent, invoice: &Invoice, now: DateTime<Utc>) -> InvoiceStatus {
        let status = Self::from_observation(event, invoice.confirmations_required);

        if status == InvoiceStatus::Failed || status == InvoiceStatus::Expired {
            return status;
        }

        if invoice.is_expired_at(now)
            && status != InvoiceStatus::Confirmed
            && invoice.status != InvoiceStatus::Credited
        {
            return InvoiceStatus::Expired;
        }

        status
    }

    fn from_observation(event: &SettlementEvent, required: i32) -> InvoiceStatus {
        match event.observed {
            ObservedStatus::Failed => return InvoiceStatus::Failed,
            ObservedStatus::Expired => return InvoiceStatus::Expired,
            _ => {}
        }

        // binary rails settle on the processor's word alone
        if required <= 0 {
            return match event.observed {
                ObservedStatus::Confirmed => InvoiceStatus::Confirmed,
                ObservedStatus::Partial => InvoiceStatus::Partial,
                _ => InvoiceStatus::Pending,
            };
        }

        // a processor-final status means the rail already waited out its own
        // threshold, so it counts as meeting the invoice's
        let confirmations = if event.observed == ObservedStatus::Confirmed {
            i64::from(event.confirmations).max(i64::from(required))
        } else {
            i64::from(event.confirmations)
        };
        let by_count = if confirmations >= i64::from(required) {
            InvoiceStatus::Confirmed
        } else if confirmations > 0 {
            InvoiceStatus::Partial
        } else {
            InvoiceStatus::Pending
        };

        // an underpayment never settles, however deep it is buried
        if event.observed == ObservedStatus::Partial {
            return InvoiceStatus::Partial;
        }
        by_count
    }
}
