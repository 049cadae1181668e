// Settlement pipeline: gate -> policy -> transactor, driven by webhooks and the poller
pub mod gate;
pub mod orchestrator;
pub mod policy;
pub mod poller;
pub mod transactor;

pub use orchestrator::{
    AccountSummary, InvoiceReceipt, InvoiceSettings, NewInvoice, SettlementOrchestrator,
    WebhookAck,
};
pub use poller::{PollerConfig, ReconciliationPoller};
