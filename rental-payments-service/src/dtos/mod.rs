//! Request and response bodies for the HTTP API. Field names are camelCase
//! on the wire; amounts are integer cents with a display string alongside.

pub mod invoices;
pub mod payments;
pub mod webhooks;

pub use invoices::{
    CancelInvoiceRequest, CreateInvoiceRequest, InvoiceResponse, RemoteInvoiceResponse,
    SendInvoiceRequest,
};
pub use payments::{
    ListPaymentsQuery, OverdueSweepRequest, OverdueSweepResponse, PageResponse,
    PaymentDetailsResponse, PaymentResponse, RecordTransactionRequest, RecordTransactionResponse,
    ReminderResponse, ScheduleReminderRequest, TransactionResponse,
};
pub use webhooks::WebhookResponse;
