use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

use crate::error::SettlementError;

pub const ORDER_PREFIX: &str = "GMC";

/// Order reference embedding the owning account: `GMC-{accountId}-{timestampMillis}`.
///
/// Used as the NOWPayments `order_id` and as the wire memo. Inbound
/// references are untrusted; anything that does not parse is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderReference {
    pub account_id: Uuid,
    pub timestamp_ms: i64,
}

impl OrderReference {
    pub fn new(account_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            timestamp_ms: at.timestamp_millis(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, SettlementError> {
        let reject = |why: &str| {
            SettlementError::validation(format!("order reference '{}' rejected: {}", raw, why))
        };

        let rest = raw
            .trim()
            .strip_prefix(ORDER_PREFIX)
            .and_then(|r| r.strip_prefix('-'))
            .ok_or_else(|| reject("missing GMC prefix"))?;

        // the account id is itself hyphenated, so split on the last hyphen
        let (account, timestamp) = rest
            .rsplit_once('-')
            .ok_or_else(|| reject("missing timestamp"))?;

        if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(reject("timestamp is not numeric"));
        }
        let timestamp_ms = timestamp
            .parse::<i64>()
            .map_err(|_| reject("timestamp out of range"))?;
        if timestamp_ms <= 0 {
            return Err(reject("timestamp out of range"));
        }

        let account_id = Uuid::parse_str(account).map_err(|_| reject("account id is not a UUID"))?;

        Ok(Self {
            account_id,
            timestamp_ms,
        })
    }
}

impl fmt::Display for OrderReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            ORDER_PREFIX,
            self.account_id.hyphenated(),
            self.timestamp_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formatted_reference() {
        let account_id = Uuid::new_v4();
        let reference = OrderReference::new(account_id, Utc::now());
        let parsed = OrderReference::parse(&reference.to_string()).unwrap();
        assert_eq!(parsed, reference);
    }

    #[test]
    fn test_parse_known_value() {
        let parsed =
            OrderReference::parse("GMC-6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f-1700000000000").unwrap();
        assert_eq!(
            parsed.account_id,
            Uuid::parse_str("6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f").unwrap()
        );
        assert_eq!(parsed.timestamp_ms, 1_700_000_000_000);
    }

    #[test]
    fn test_rejects_malformed_references() {
        let bad = [
            "",
            "GMC",
            "GMC-",
            "ORD-6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f-1700000000000",
            "GMC-6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f",
            "GMC-6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f-",
            "GMC-6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f-17000abc",
            "GMC-not-an-account-1700000000000",
            "GMC-6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f-99999999999999999999999",
            "GMC-6f1c2a9e-3b4d-4c5e-8f70-1a2b3c4d5e6f-0",
        ];
        for raw in bad {
            assert!(
                matches!(OrderReference::parse(raw), Err(SettlementError::Validation(_))),
                "accepted {:?}",
                raw
            );
        }
    }
}
