//! rental-payments-service: invoicing and payment lifecycle for dumpster
//! rental orders, with Square as the invoice provider.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;
