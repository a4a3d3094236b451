pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod orders;
pub mod provider;
pub mod store;
pub mod webhook;

pub use error::PaymentError;
pub use manager::PaymentLifecycleManager;
pub use metrics::{get_metrics, init_metrics};
pub use orders::{MemoryOrderSource, OrderSource, PgOrderSource};
pub use provider::{InvoiceProvider, MockInvoiceProvider, SquareInvoiceProvider};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
