//! HTTP handlers for rental-payments-service.

pub mod health;
pub mod invoices;
pub mod payments;
pub mod webhooks;
