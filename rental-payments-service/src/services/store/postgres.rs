//! PostgreSQL ledger store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    processed_at_for, refund_ref, validate_transaction, AppliedChange, LedgerStore, StoreError,
    StoreResult,
};
use crate::models::{
    DeliveryMethod, LedgerChange, ListPaymentsFilter, NewLineItem, NewPayment, NewReminder,
    NewTransaction, NewWebhookEvent, Page, Payment, PaymentLineItem, PaymentMethod,
    PaymentReminder, PaymentStatus, PaymentTransaction, PaymentType, PaymentUpdate,
    PaymentWebhookEvent, ReminderMethod, ReminderStatus, ReminderType, TransactionStatus,
    TransactionType, WebhookEventStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;

const PAYMENT_COLUMNS: &str = r#"
    id, payment_number, order_id, payment_type, method, status, currency,
    subtotal_amount, tax_amount, total_amount, paid_amount, refunded_amount,
    square_invoice_id, square_invoice_version, square_payment_id, square_customer_id,
    square_location_id, square_order_id, public_payment_url, delivery_method,
    order_number, customer_name, customer_email, customer_phone, service_address,
    dumpster_size, scheduled_delivery_date, scheduled_pickup_date, notes, metadata,
    due_date, sent_at, viewed_at, paid_at, failed_at, canceled_at, created_at, updated_at, version
"#;

const LINE_ITEM_COLUMNS: &str = r#"
    id, payment_id, name, description, quantity, unit_price, total_price,
    tax_rate_bps, tax_amount, category, sku, sort_order, created_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, payment_id, transaction_type, amount, status, external_ref, metadata, processed_at, created_at
"#;

const REMINDER_COLUMNS: &str = r#"
    id, payment_id, reminder_type, method, status, scheduled_at, sent_at, message, failure_reason, created_at
"#;

const WEBHOOK_EVENT_COLUMNS: &str = r#"
    id, event_id, event_type, source, raw_payload, status, payment_id,
    retry_count, failure_reason, received_at, processed_at
"#;

const PAYMENT_FILTER: &str = r#"
    ($1::uuid IS NULL OR order_id = $1)
    AND ($2::text[] IS NULL OR status = ANY($2))
    AND ($3::text[] IS NULL OR method = ANY($3))
    AND ($4::text[] IS NULL OR payment_type = ANY($4))
    AND ($5::timestamptz IS NULL OR created_at >= $5)
    AND ($6::timestamptz IS NULL OR created_at <= $6)
    AND ($7::date IS NULL OR due_date < $7)
    AND ($8::bigint IS NULL OR total_amount >= $8)
    AND ($9::bigint IS NULL OR total_amount <= $9)
    AND ($10::text IS NULL
        OR payment_number ILIKE $10
        OR customer_name ILIKE $10
        OR customer_email ILIKE $10
        OR order_number ILIKE $10)
"#;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

fn decode<T>(column: &str, value: &str, parse: fn(&str) -> Option<T>) -> StoreResult<T> {
    parse(value).ok_or_else(|| StoreError::Decode(format!("unknown {} '{}'", column, value)))
}

#[derive(Debug, FromRow)]
struct PaymentRow {
    id: Uuid,
    payment_number: String,
    order_id: Uuid,
    payment_type: String,
    method: String,
    status: String,
    currency: String,
    subtotal_amount: i64,
    tax_amount: i64,
    total_amount: i64,
    paid_amount: i64,
    refunded_amount: i64,
    square_invoice_id: Option<String>,
    square_invoice_version: Option<i32>,
    square_payment_id: Option<String>,
    square_customer_id: Option<String>,
    square_location_id: Option<String>,
    square_order_id: Option<String>,
    public_payment_url: Option<String>,
    delivery_method: Option<String>,
    order_number: Option<String>,
    customer_name: String,
    customer_email: Option<String>,
    customer_phone: Option<String>,
    service_address: Option<String>,
    dumpster_size: Option<String>,
    scheduled_delivery_date: Option<NaiveDate>,
    scheduled_pickup_date: Option<NaiveDate>,
    notes: Option<String>,
    metadata: Option<serde_json::Value>,
    due_date: Option<NaiveDate>,
    sent_at: Option<DateTime<Utc>>,
    viewed_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: i64,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = StoreError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            payment_number: row.payment_number,
            order_id: row.order_id,
            payment_type: decode("payment type", &row.payment_type, PaymentType::parse)?,
            method: decode("payment method", &row.method, PaymentMethod::parse)?,
            status: decode("payment status", &row.status, PaymentStatus::parse)?,
            currency: row.currency,
            subtotal_amount: row.subtotal_amount,
            tax_amount: row.tax_amount,
            total_amount: row.total_amount,
            paid_amount: row.paid_amount,
            refunded_amount: row.refunded_amount,
            square_invoice_id: row.square_invoice_id,
            square_invoice_version: row.square_invoice_version,
            square_payment_id: row.square_payment_id,
            square_customer_id: row.square_customer_id,
            square_location_id: row.square_location_id,
            square_order_id: row.square_order_id,
            public_payment_url: row.public_payment_url,
            delivery_method: row
                .delivery_method
                .as_deref()
                .map(|v| decode("delivery method", v, DeliveryMethod::parse))
                .transpose()?,
            order_number: row.order_number,
            customer_name: row.customer_name,
            customer_email: row.customer_email,
            customer_phone: row.customer_phone,
            service_address: row.service_address,
            dumpster_size: row.dumpster_size,
            scheduled_delivery_date: row.scheduled_delivery_date,
            scheduled_pickup_date: row.scheduled_pickup_date,
            notes: row.notes,
            metadata: row.metadata,
            due_date: row.due_date,
            sent_at: row.sent_at,
            viewed_at: row.viewed_at,
            paid_at: row.paid_at,
            failed_at: row.failed_at,
            canceled_at: row.canceled_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            version: row.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct LineItemRow {
    id: Uuid,
    payment_id: Uuid,
    name: String,
    description: Option<String>,
    quantity: i32,
    unit_price: i64,
    total_price: i64,
    tax_rate_bps: Option<i32>,
    tax_amount: Option<i64>,
    category: Option<String>,
    sku: Option<String>,
    sort_order: i32,
    created_at: DateTime<Utc>,
}

impl From<LineItemRow> for PaymentLineItem {
    fn from(row: LineItemRow) -> Self {
        PaymentLineItem {
            id: row.id,
            payment_id: row.payment_id,
            name: row.name,
            description: row.description,
            quantity: row.quantity,
            unit_price: row.unit_price,
            total_price: row.total_price,
            tax_rate_bps: row.tax_rate_bps,
            tax_amount: row.tax_amount,
            category: row.category,
            sku: row.sku,
            sort_order: row.sort_order,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    payment_id: Uuid,
    transaction_type: String,
    amount: i64,
    status: String,
    external_ref: Option<String>,
    metadata: Option<serde_json::Value>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for PaymentTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(PaymentTransaction {
            id: row.id,
            payment_id: row.payment_id,
            transaction_type: decode(
                "transaction type",
                &row.transaction_type,
                TransactionType::parse,
            )?,
            amount: row.amount,
            status: decode("transaction status", &row.status, TransactionStatus::parse)?,
            external_ref: row.external_ref,
            metadata: row.metadata,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ReminderRow {
    id: Uuid,
    payment_id: Uuid,
    reminder_type: String,
    method: String,
    status: String,
    scheduled_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    message: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReminderRow> for PaymentReminder {
    type Error = StoreError;

    fn try_from(row: ReminderRow) -> Result<Self, Self::Error> {
        Ok(PaymentReminder {
            id: row.id,
            payment_id: row.payment_id,
            reminder_type: decode("reminder type", &row.reminder_type, ReminderType::parse)?,
            method: decode("reminder method", &row.method, ReminderMethod::parse)?,
            status: decode("reminder status", &row.status, ReminderStatus::parse)?,
            scheduled_at: row.scheduled_at,
            sent_at: row.sent_at,
            message: row.message,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    id: Uuid,
    event_id: String,
    event_type: String,
    source: String,
    raw_payload: serde_json::Value,
    status: String,
    payment_id: Option<Uuid>,
    retry_count: i32,
    failure_reason: Option<String>,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookEventRow> for PaymentWebhookEvent {
    type Error = StoreError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(PaymentWebhookEvent {
            id: row.id,
            event_id: row.event_id,
            event_type: row.event_type,
            source: row.source,
            raw_payload: row.raw_payload,
            status: decode("webhook event status", &row.status, WebhookEventStatus::parse)?,
            payment_id: row.payment_id,
            retry_count: row.retry_count,
            failure_reason: row.failure_reason,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

fn check_line_items(items: &[NewLineItem]) -> StoreResult<Vec<(i64, Option<i64>)>> {
    items
        .iter()
        .map(|item| item.checked_amounts())
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Validation)
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn text_array<T>(values: &[T], as_str: fn(&T) -> &'static str) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().map(|v| as_str(v).to_string()).collect())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a new connection pool.
    #[instrument(skip(database_url), fields(service = "rental-payments-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> StoreResult<Self> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> StoreResult<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.into()))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Whitelist update. `expected_version` turns it into a compare-and-set.
    async fn write_update<'e, E>(
        executor: E,
        id: Uuid,
        expected_version: Option<i64>,
        update: &PaymentUpdate,
    ) -> StoreResult<Option<Payment>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!(
            r#"
            UPDATE payments
            SET status = COALESCE($3, status),
                paid_amount = COALESCE($4, paid_amount),
                refunded_amount = COALESCE($5, refunded_amount),
                square_invoice_id = COALESCE($6, square_invoice_id),
                square_invoice_version = COALESCE($7, square_invoice_version),
                square_payment_id = COALESCE($8, square_payment_id),
                square_customer_id = COALESCE($9, square_customer_id),
                square_location_id = COALESCE($10, square_location_id),
                square_order_id = COALESCE($11, square_order_id),
                public_payment_url = COALESCE($12, public_payment_url),
                delivery_method = COALESCE($13, delivery_method),
                notes = COALESCE($14, notes),
                metadata = COALESCE($15, metadata),
                due_date = COALESCE($16, due_date),
                sent_at = COALESCE(sent_at, $17),
                viewed_at = COALESCE(viewed_at, $18),
                paid_at = COALESCE(paid_at, $19),
                failed_at = COALESCE(failed_at, $20),
                canceled_at = COALESCE(canceled_at, $21),
                updated_at = NOW(),
                version = version + 1
            WHERE id = $1 AND ($2::bigint IS NULL OR version = $2)
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .bind(expected_version)
            .bind(update.status.map(|s| s.as_str()))
            .bind(update.paid_amount)
            .bind(update.refunded_amount)
            .bind(&update.square_invoice_id)
            .bind(update.square_invoice_version)
            .bind(&update.square_payment_id)
            .bind(&update.square_customer_id)
            .bind(&update.square_location_id)
            .bind(&update.square_order_id)
            .bind(&update.public_payment_url)
            .bind(update.delivery_method.map(|d| d.as_str()))
            .bind(&update.notes)
            .bind(&update.metadata)
            .bind(update.due_date)
            .bind(update.sent_at)
            .bind(update.viewed_at)
            .bind(update.paid_at)
            .bind(update.failed_at)
            .bind(update.canceled_at)
            .fetch_optional(executor)
            .await?;

        row.map(Payment::try_from).transpose()
    }

    async fn insert_transaction_with<'e, E>(
        executor: E,
        input: &NewTransaction,
    ) -> StoreResult<PaymentTransaction>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!(
            r#"
            INSERT INTO payment_transactions
                (id, payment_id, transaction_type, amount, status, external_ref, metadata, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        );

        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(input.payment_id)
            .bind(input.transaction_type.as_str())
            .bind(input.amount)
            .bind(input.status.as_str())
            .bind(&input.external_ref)
            .bind(&input.metadata)
            .bind(input.processed_at)
            .fetch_one(executor)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                    StoreError::NotFound(format!("payment {}", input.payment_id))
                }
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    StoreError::DuplicateRefund {
                        payment_id: input.payment_id,
                        external_ref: refund_ref(input).unwrap_or_default().to_string(),
                    }
                }
                other => StoreError::Database(other),
            })?;

        PaymentTransaction::try_from(row)
    }

    async fn insert_payment_with<'e, E>(
        executor: E,
        input: &NewPayment,
        total_amount: i64,
    ) -> StoreResult<Payment>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let sql = format!(
            r#"
            INSERT INTO payments (
                id, payment_number, order_id, payment_type, method, status, currency,
                subtotal_amount, tax_amount, total_amount, paid_amount, refunded_amount,
                square_location_id, order_number, customer_name, customer_email, customer_phone,
                service_address, dumpster_size, scheduled_delivery_date, scheduled_pickup_date,
                notes, metadata, due_date, version
            )
            VALUES (
                $1, 'PAY-' || LPAD(nextval('payment_number_seq')::text, 6, '0'), $2, $3, $4, 'DRAFT', $5,
                $6, $7, $8, 0, 0,
                $9, $10, $11, $12, $13,
                $14, $15, $16, $17,
                $18, $19, $20, 1
            )
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );

        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(input.order_id)
            .bind(input.payment_type.as_str())
            .bind(input.method.as_str())
            .bind(&input.currency)
            .bind(input.subtotal_amount)
            .bind(input.tax_amount)
            .bind(total_amount)
            .bind(&input.square_location_id)
            .bind(&input.order_number)
            .bind(&input.customer_name)
            .bind(&input.customer_email)
            .bind(&input.customer_phone)
            .bind(&input.service_address)
            .bind(&input.dumpster_size)
            .bind(input.scheduled_delivery_date)
            .bind(input.scheduled_pickup_date)
            .bind(&input.notes)
            .bind(&input.metadata)
            .bind(input.due_date)
            .fetch_one(executor)
            .await?;

        Payment::try_from(row)
    }

    async fn insert_line_items_with(
        conn: &mut PgConnection,
        payment_id: Uuid,
        items: &[NewLineItem],
        checked: Vec<(i64, Option<i64>)>,
    ) -> StoreResult<Vec<PaymentLineItem>> {
        let start = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM payment_line_items WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_one(&mut *conn)
        .await? as i32;

        let sql = format!(
            r#"
            INSERT INTO payment_line_items
                (id, payment_id, name, description, quantity, unit_price, total_price,
                 tax_rate_bps, tax_amount, category, sku, sort_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {}
            "#,
            LINE_ITEM_COLUMNS
        );

        let mut inserted = Vec::with_capacity(items.len());
        for (i, (item, (total_price, tax_amount))) in items.iter().zip(checked).enumerate() {
            let row = sqlx::query_as::<_, LineItemRow>(&sql)
                .bind(Uuid::new_v4())
                .bind(payment_id)
                .bind(&item.name)
                .bind(&item.description)
                .bind(item.quantity)
                .bind(item.unit_price)
                .bind(total_price)
                .bind(item.tax_rate_bps)
                .bind(tax_amount)
                .bind(&item.category)
                .bind(&item.sku)
                .bind(start + i as i32)
                .fetch_one(&mut *conn)
                .await?;
            inserted.push(PaymentLineItem::from(row));
        }
        Ok(inserted)
    }

    async fn payment_exists(&self, id: Uuid) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM payments WHERE id = $1)")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn webhook_event_exists(&self, event_id: &str) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM payment_webhook_events WHERE event_id = $1)",
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    async fn create_payment(&self, input: NewPayment) -> StoreResult<Payment> {
        let total_amount = input.validate().map_err(StoreError::Validation)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment"])
            .start_timer();

        let payment = Self::insert_payment_with(&self.pool, &input, total_amount).await?;

        timer.observe_duration();

        info!(payment_id = %payment.id, payment_number = %payment.payment_number, "Payment created");
        Ok(payment)
    }

    #[instrument(skip(self, input, items), fields(order_id = %input.order_id, count = items.len()))]
    async fn create_payment_with_items(
        &self,
        input: NewPayment,
        items: Vec<NewLineItem>,
    ) -> StoreResult<(Payment, Vec<PaymentLineItem>)> {
        let total_amount = input.validate().map_err(StoreError::Validation)?;
        let checked = check_line_items(&items)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_payment_with_items"])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        let payment = Self::insert_payment_with(&mut *tx, &input, total_amount).await?;
        let line_items = Self::insert_line_items_with(&mut *tx, payment.id, &items, checked).await?;
        tx.commit().await?;

        timer.observe_duration();

        info!(payment_id = %payment.id, payment_number = %payment.payment_number, "Payment created");
        Ok((payment, line_items))
    }

    #[instrument(skip(self), fields(payment_id = %id))]
    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment"])
            .start_timer();

        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        timer.observe_duration();

        row.map(Payment::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn get_payment_by_external_invoice_id(
        &self,
        external_invoice_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_payment_by_external_invoice_id"])
            .start_timer();

        let sql = format!(
            "SELECT {} FROM payments WHERE square_invoice_id = $1",
            PAYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(external_invoice_id)
            .fetch_optional(&self.pool)
            .await?;

        timer.observe_duration();

        row.map(Payment::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn get_payment_by_external_order_id(
        &self,
        external_order_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE square_order_id = $1 ORDER BY created_at DESC LIMIT 1",
            PAYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(external_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Payment::try_from).transpose()
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn latest_payment_for_order(&self, order_id: Uuid) -> StoreResult<Option<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["latest_payment_for_order"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE order_id = $1
            ORDER BY (status = 'CANCELED'), created_at DESC, payment_number DESC
            LIMIT 1
            "#,
            PAYMENT_COLUMNS
        );
        let row = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        timer.observe_duration();

        row.map(Payment::try_from).transpose()
    }

    #[instrument(skip(self, update), fields(payment_id = %id))]
    async fn update_payment(&self, id: Uuid, update: PaymentUpdate) -> StoreResult<Payment> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_payment"])
            .start_timer();

        let payment = Self::write_update(&self.pool, id, None, &update)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;

        timer.observe_duration();

        Ok(payment)
    }

    #[instrument(skip(self, change), fields(payment_id = %change.payment_id, expected_version = change.expected_version))]
    async fn apply_change(&self, change: LedgerChange) -> StoreResult<AppliedChange> {
        if let Some(ref transaction) = change.transaction {
            validate_transaction(transaction)?;
            if transaction.payment_id != change.payment_id {
                return Err(StoreError::Validation(
                    "transaction belongs to a different payment".to_string(),
                ));
            }
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["apply_change"])
            .start_timer();

        let mut tx = self.pool.begin().await?;

        // Claim first: the row lock serializes concurrent deliveries of one event.
        if let Some(ref event_id) = change.claim_event_id {
            let claimed = sqlx::query(
                r#"
                UPDATE payment_webhook_events
                SET status = 'PROCESSED', payment_id = $2, failure_reason = NULL, processed_at = NOW()
                WHERE event_id = $1 AND status <> 'PROCESSED'
                "#,
            )
            .bind(event_id)
            .bind(change.payment_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if claimed == 0 {
                tx.rollback().await.ok();
                if self.webhook_event_exists(event_id).await? {
                    return Err(StoreError::AlreadyProcessed(event_id.clone()));
                }
                return Err(StoreError::NotFound(format!("webhook event {}", event_id)));
            }
        }

        let updated = Self::write_update(
            &mut *tx,
            change.payment_id,
            Some(change.expected_version),
            &change.update,
        )
        .await?;

        let Some(payment) = updated else {
            tx.rollback().await.ok();
            if self.payment_exists(change.payment_id).await? {
                warn!(payment_id = %change.payment_id, "Version conflict on payment update");
                return Err(StoreError::VersionConflict {
                    payment_id: change.payment_id,
                    expected: change.expected_version,
                });
            }
            return Err(StoreError::NotFound(format!("payment {}", change.payment_id)));
        };

        let transaction = match change.transaction {
            Some(ref input) => Some(Self::insert_transaction_with(&mut *tx, input).await?),
            None => None,
        };

        tx.commit().await?;

        timer.observe_duration();

        Ok(AppliedChange {
            payment,
            transaction,
        })
    }

    #[instrument(skip(self, filter))]
    async fn list_payments(&self, filter: &ListPaymentsFilter) -> StoreResult<Page<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        let (limit, offset) = filter.window();
        let statuses = text_array(&filter.statuses, PaymentStatus::as_str);
        let methods = text_array(&filter.methods, PaymentMethod::as_str);
        let types = text_array(&filter.types, PaymentType::as_str);
        let search = filter.search_term().map(|term| format!("%{}%", term));

        let count_sql = format!("SELECT COUNT(*) FROM payments WHERE {}", PAYMENT_FILTER);
        let total = sqlx::query_scalar::<_, i64>(&count_sql)
            .bind(filter.order_id)
            .bind(&statuses)
            .bind(&methods)
            .bind(&types)
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(filter.due_before)
            .bind(filter.min_amount)
            .bind(filter.max_amount)
            .bind(&search)
            .fetch_one(&self.pool)
            .await?;

        let list_sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE {}
            ORDER BY created_at DESC, payment_number DESC
            LIMIT $11 OFFSET $12
            "#,
            PAYMENT_COLUMNS, PAYMENT_FILTER
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&list_sql)
            .bind(filter.order_id)
            .bind(&statuses)
            .bind(&methods)
            .bind(&types)
            .bind(filter.created_from)
            .bind(filter.created_to)
            .bind(filter.due_before)
            .bind(filter.min_amount)
            .bind(filter.max_amount)
            .bind(&search)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .await?;

        timer.observe_duration();

        Ok(Page::new(convert_all(rows)?, total, offset))
    }

    #[instrument(skip(self))]
    async fn list_past_due(&self, as_of: NaiveDate) -> StoreResult<Vec<Payment>> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_past_due"])
            .start_timer();

        let sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE status IN ('SENT', 'VIEWED') AND due_date < $1
            ORDER BY due_date
            "#,
            PAYMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(as_of)
            .fetch_all(&self.pool)
            .await?;

        timer.observe_duration();

        convert_all(rows)
    }

    #[instrument(skip(self, items), fields(payment_id = %payment_id, count = items.len()))]
    async fn insert_line_items(
        &self,
        payment_id: Uuid,
        items: Vec<NewLineItem>,
    ) -> StoreResult<Vec<PaymentLineItem>> {
        let checked = check_line_items(&items)?;

        if !self.payment_exists(payment_id).await? {
            return Err(StoreError::NotFound(format!("payment {}", payment_id)));
        }

        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_line_items"])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        let inserted = Self::insert_line_items_with(&mut *tx, payment_id, &items, checked).await?;
        tx.commit().await?;

        timer.observe_duration();

        Ok(inserted)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn list_line_items(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentLineItem>> {
        let sql = format!(
            "SELECT {} FROM payment_line_items WHERE payment_id = $1 ORDER BY sort_order",
            LINE_ITEM_COLUMNS
        );
        let rows = sqlx::query_as::<_, LineItemRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(PaymentLineItem::from).collect())
    }

    #[instrument(skip(self, input), fields(payment_id = %input.payment_id))]
    async fn insert_transaction(&self, input: NewTransaction) -> StoreResult<PaymentTransaction> {
        validate_transaction(&input)?;

        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        let transaction = Self::insert_transaction_with(&self.pool, &input).await?;

        timer.observe_duration();

        Ok(transaction)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn list_transactions(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentTransaction>> {
        let sql = format!(
            "SELECT {} FROM payment_transactions WHERE payment_id = $1 ORDER BY created_at, id",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    #[instrument(skip(self, input), fields(payment_id = %input.payment_id))]
    async fn insert_reminder(&self, input: NewReminder) -> StoreResult<PaymentReminder> {
        let sql = format!(
            r#"
            INSERT INTO payment_reminders (id, payment_id, reminder_type, method, status, scheduled_at, message)
            VALUES ($1, $2, $3, $4, 'SCHEDULED', $5, $6)
            RETURNING {}
            "#,
            REMINDER_COLUMNS
        );
        let row = sqlx::query_as::<_, ReminderRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(input.payment_id)
            .bind(input.reminder_type.as_str())
            .bind(input.method.as_str())
            .bind(input.scheduled_at)
            .bind(&input.message)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
                    StoreError::NotFound(format!("payment {}", input.payment_id))
                }
                other => StoreError::Database(other),
            })?;
        PaymentReminder::try_from(row)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn list_reminders(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentReminder>> {
        let sql = format!(
            "SELECT {} FROM payment_reminders WHERE payment_id = $1 ORDER BY scheduled_at",
            REMINDER_COLUMNS
        );
        let rows = sqlx::query_as::<_, ReminderRow>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    #[instrument(skip(self, failure_reason), fields(reminder_id = %reminder_id, status = %status))]
    async fn update_reminder_status(
        &self,
        reminder_id: Uuid,
        status: ReminderStatus,
        failure_reason: Option<String>,
    ) -> StoreResult<PaymentReminder> {
        let sql = format!(
            r#"
            UPDATE payment_reminders
            SET status = $2,
                sent_at = CASE WHEN $2 = 'SENT' THEN COALESCE(sent_at, NOW()) ELSE sent_at END,
                failure_reason = COALESCE($3, failure_reason)
            WHERE id = $1
            RETURNING {}
            "#,
            REMINDER_COLUMNS
        );
        let row = sqlx::query_as::<_, ReminderRow>(&sql)
            .bind(reminder_id)
            .bind(status.as_str())
            .bind(&failure_reason)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("reminder {}", reminder_id)))?;
        PaymentReminder::try_from(row)
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    async fn cancel_scheduled_reminders(&self, payment_id: Uuid) -> StoreResult<u64> {
        let canceled = sqlx::query(
            "UPDATE payment_reminders SET status = 'CANCELED' WHERE payment_id = $1 AND status = 'SCHEDULED'",
        )
        .bind(payment_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(canceled)
    }

    #[instrument(skip(self, input), fields(event_id = %input.event_id, event_type = %input.event_type))]
    async fn log_webhook_event(&self, input: NewWebhookEvent) -> StoreResult<PaymentWebhookEvent> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["log_webhook_event"])
            .start_timer();

        let sql = format!(
            r#"
            INSERT INTO payment_webhook_events (id, event_id, event_type, source, raw_payload, status, retry_count)
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0)
            ON CONFLICT (event_id) DO UPDATE
            SET retry_count = payment_webhook_events.retry_count
                + CASE WHEN payment_webhook_events.status <> 'PROCESSED' THEN 1 ELSE 0 END
            RETURNING {}
            "#,
            WEBHOOK_EVENT_COLUMNS
        );
        let row = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&input.event_id)
            .bind(&input.event_type)
            .bind(&input.source)
            .bind(&input.raw_payload)
            .fetch_one(&self.pool)
            .await?;

        timer.observe_duration();

        PaymentWebhookEvent::try_from(row)
    }

    #[instrument(skip(self))]
    async fn get_webhook_event(&self, event_id: &str) -> StoreResult<Option<PaymentWebhookEvent>> {
        let sql = format!(
            "SELECT {} FROM payment_webhook_events WHERE event_id = $1",
            WEBHOOK_EVENT_COLUMNS
        );
        let row = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(PaymentWebhookEvent::try_from).transpose()
    }

    #[instrument(skip(self, failure_reason), fields(status = %status))]
    async fn mark_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        payment_id: Option<Uuid>,
        failure_reason: Option<String>,
    ) -> StoreResult<PaymentWebhookEvent> {
        let sql = format!(
            r#"
            UPDATE payment_webhook_events
            SET status = $2,
                payment_id = COALESCE($3, payment_id),
                failure_reason = $4,
                processed_at = $5
            WHERE event_id = $1 AND status <> 'PROCESSED'
            RETURNING {}
            "#,
            WEBHOOK_EVENT_COLUMNS
        );
        let row = sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(event_id)
            .bind(status.as_str())
            .bind(payment_id)
            .bind(&failure_reason)
            .bind(processed_at_for(status, Utc::now()))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => PaymentWebhookEvent::try_from(row),
            None if self.webhook_event_exists(event_id).await? => {
                Err(StoreError::AlreadyProcessed(event_id.to_string()))
            }
            None => Err(StoreError::NotFound(format!("webhook event {}", event_id))),
        }
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
