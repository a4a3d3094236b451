//! Reminder model: scheduled or sent dunning notices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    pub enum ReminderType {
        Initial => "INITIAL",
        FollowUp => "FOLLOW_UP",
        FinalNotice => "FINAL_NOTICE",
        Overdue => "OVERDUE",
    }
}

text_enum! {
    pub enum ReminderMethod {
        Email => "EMAIL",
        Sms => "SMS",
    }
}

text_enum! {
    pub enum ReminderStatus {
        Scheduled => "SCHEDULED",
        Sent => "SENT",
        Failed => "FAILED",
        Canceled => "CANCELED",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReminder {
    pub id: Uuid,
    pub payment_id: Uuid,
    #[serde(rename = "type")]
    pub reminder_type: ReminderType,
    pub method: ReminderMethod,
    pub status: ReminderStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewReminder {
    pub payment_id: Uuid,
    pub reminder_type: ReminderType,
    pub method: ReminderMethod,
    pub scheduled_at: DateTime<Utc>,
    pub message: Option<String>,
}
