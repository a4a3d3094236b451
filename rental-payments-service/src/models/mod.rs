//! Domain models for rental-payments-service.

/// Text-backed enum with a stable wire/storage spelling.
///
/// Generates `as_str`, a strict `parse` (unknown text is `None`, never a
/// default variant), `Display`, and serde impls using the same spelling.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

mod line_item;
mod money;
mod order;
mod payment;
mod reminder;
mod transaction;
mod webhook_event;

pub use line_item::{NewLineItem, PaymentLineItem};
pub use money::{cents_to_display, dollars_to_cents, tax_for};
pub use order::Order;
pub use payment::{
    DeliveryMethod, LedgerChange, ListPaymentsFilter, NewPayment, Page, Payment, PaymentDetails,
    PaymentMethod, PaymentStatus, PaymentType, PaymentUpdate, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};
pub use reminder::{NewReminder, PaymentReminder, ReminderMethod, ReminderStatus, ReminderType};
pub use transaction::{NewTransaction, PaymentTransaction, TransactionStatus, TransactionType};
pub use webhook_event::{NewWebhookEvent, PaymentWebhookEvent, WebhookEventStatus};
