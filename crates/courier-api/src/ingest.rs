//! Event ingestion: validation, idempotency, admission and persistence.
//!
//! A request passes through these steps in order:
//!
//! 1. Validate type, source, payload size and idempotency key
//! 2. Return the existing event when the key is already bound
//! 3. Take a rate limit token for the credential
//! 4. Reserve the key for a fresh event id (conditional insert)
//! 5. Store the event as `pending`, releasing the key if that fails
//! 6. Wake the dispatcher and publish to live streams

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use courier_core::{
    storage::{EventCursor, EventQuery, Reservation},
    AccountId, Clock, CoreError, Credential, Event, EventId, EventMetadata, EventStatus,
    IdempotencyRecord, RateLimitDecision, RateLimitTier, RateLimiter, Storage, StreamPublisher,
};
use courier_delivery::Wakeup;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest allowed type, source and idempotency key.
pub const MAX_FIELD_LENGTH: usize = 255;

/// Largest page `list_events` returns.
pub const MAX_LIST_LIMIT: usize = 100;

const DEFAULT_LIST_LIMIT: usize = 50;

/// Room for the envelope around `data` in a single-event request body.
const ENVELOPE_ALLOWANCE: usize = 64 * 1024;

/// Size and retention limits for ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestLimits {
    /// Largest serialized `data` object, in bytes.
    pub max_event_bytes: usize,
    /// Most entries in one batch.
    pub max_batch_events: usize,
    /// Largest batch request body, in bytes.
    pub max_batch_bytes: usize,
    /// How long an idempotency key stays bound to its event.
    pub idempotency_ttl: Duration,
}

impl IngestLimits {
    /// Largest single-event request body, in bytes.
    pub fn max_request_bytes(&self) -> usize {
        self.max_event_bytes + ENVELOPE_ALLOWANCE
    }
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self {
            max_event_bytes: 256 * 1024,
            max_batch_events: 100,
            max_batch_bytes: 1024 * 1024,
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// An event as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewEvent {
    /// Dot-separated event type.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Producer-defined origin.
    pub source: String,
    /// Payload; must be a JSON object.
    pub data: Value,
    /// Optional producer metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// Batch request body.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    /// Entries to ingest, in order.
    pub events: Vec<BatchEntry>,
    /// Skip every entry after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
}

/// One batch entry.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchEntry {
    /// Caller-chosen label echoed in the result.
    #[serde(default)]
    pub reference_id: Option<String>,
    /// The event itself.
    #[serde(flatten)]
    pub event: NewEvent,
}

/// Per-entry batch failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchItemError {
    /// `validation_error`, `idempotency_conflict`, `internal_error` or
    /// `skipped`.
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    /// Offending field, for validation errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
}

/// Result of one batch entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemResult {
    /// Position in the request.
    pub index: usize,
    /// Echo of the entry's `reference_id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    /// Whether the entry was stored or matched an existing event.
    pub success: bool,
    /// The stored event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
    /// Why the entry failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchItemError>,
}

/// Batch response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    /// Entries in the request.
    pub total: usize,
    /// Entries stored or deduplicated.
    pub successful: usize,
    /// Entries rejected or skipped.
    pub failed: usize,
    /// Per-entry results in request order.
    pub results: Vec<BatchItemResult>,
}

/// Result of a single ingestion.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// The stored event, or the one the idempotency key already maps to.
    pub event: Event,
    /// Whether this request created the event.
    pub created: bool,
    /// Admission decision, when a token was taken.
    pub rate_limit: Option<RateLimitDecision>,
}

/// Result of a batch ingestion.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Per-entry results and totals.
    pub summary: BatchSummary,
    /// Admission decision for the whole batch.
    pub rate_limit: RateLimitDecision,
}

/// Filters for listing events.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventListQuery {
    /// Exact event type.
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    /// Exact source.
    pub source: Option<String>,
    /// Delivery status.
    pub status: Option<EventStatus>,
    /// Inclusive lower bound on creation time.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on creation time.
    pub until: Option<DateTime<Utc>>,
    /// Page size, 1 to 100.
    pub limit: Option<usize>,
    /// Continuation token from a previous page.
    pub cursor: Option<String>,
}

/// One page of events, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct EventList {
    /// Events on this page.
    pub events: Vec<Event>,
    /// Token for the next page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    /// Whether older events exist.
    pub has_more: bool,
}

/// Ingestion failures.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A field failed validation.
    #[error("{message}")]
    Validation {
        /// Offending field
        field: &'static str,
        /// What is wrong
        message: String,
    },

    /// `data` is larger than `max_event_bytes`.
    #[error("event data exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Byte limit
        limit: usize,
    },

    /// The credential's bucket is empty.
    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),

    /// The key is reserved by an event that is not stored yet.
    #[error("idempotency key {key} is held by an event that is not stored yet")]
    IdempotencyConflict {
        /// The contested key
        key: String,
    },

    /// Storage failure.
    #[error(transparent)]
    Storage(#[from] CoreError),
}

impl IngestError {
    fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation { field, message: message.into() }
    }

    fn batch_error(&self) -> BatchItemError {
        let (code, field) = match self {
            Self::Validation { field, .. } => ("validation_error", Some(*field)),
            Self::PayloadTooLarge { .. } => ("validation_error", Some("data")),
            Self::IdempotencyConflict { .. } => ("idempotency_conflict", None),
            Self::RateLimited(_) | Self::Storage(_) => ("internal_error", None),
        };
        BatchItemError { code, message: self.to_string(), field }
    }
}

/// A request that passed validation.
#[derive(Debug)]
struct ValidEvent {
    event_type: String,
    source: String,
    data: Value,
    metadata: EventMetadata,
}

/// Accepts events into the store.
#[derive(Clone)]
pub struct IngestionService {
    storage: Storage,
    clock: Arc<dyn Clock>,
    limits: IngestLimits,
    rate_limiter: RateLimiter,
    stream: StreamPublisher,
    dispatch_wakeup: Wakeup,
}

impl IngestionService {
    /// Creates the service. `dispatch_wakeup` is signalled after every
    /// stored event.
    pub fn new(
        storage: Storage,
        clock: Arc<dyn Clock>,
        limits: IngestLimits,
        rate_limiter: RateLimiter,
        stream: StreamPublisher,
        dispatch_wakeup: Wakeup,
    ) -> Self {
        Self { storage, clock, limits, rate_limiter, stream, dispatch_wakeup }
    }

    /// Limits in force.
    pub fn limits(&self) -> IngestLimits {
        self.limits
    }

    /// Ingests one event for `credential`'s account.
    ///
    /// `header_key` is used when the metadata carries no idempotency key.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::RateLimited` when the credential's bucket is
    /// empty; nothing is stored in that case.
    pub async fn ingest(
        &self,
        credential: &Credential,
        request: NewEvent,
        header_key: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let valid = self.validate(request, header_key)?;
        let account_id = credential.account_id;

        if let Some(event) = self.bound_event(account_id, &valid).await? {
            debug!(event_id = %event.id, "idempotency key already bound, returning existing event");
            return Ok(IngestOutcome { event, created: false, rate_limit: None });
        }

        let decision = self.admit(credential).await;
        if !decision.allowed {
            debug!(credential_id = %credential.id, "ingestion rate limited");
            return Err(IngestError::RateLimited(decision));
        }

        let (event, created) = self.store(account_id, valid).await?;
        Ok(IngestOutcome { event, created, rate_limit: Some(decision) })
    }

    /// Ingests up to `max_batch_events` events with one rate limit token.
    ///
    /// Entries are processed in order and fail independently unless
    /// `fail_fast` is set.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Validation` for an empty or oversized batch and
    /// `IngestError::RateLimited` when the credential's bucket is empty.
    pub async fn ingest_batch(
        &self,
        credential: &Credential,
        batch: BatchRequest,
    ) -> Result<BatchOutcome, IngestError> {
        let total = batch.events.len();
        if total == 0 || total > self.limits.max_batch_events {
            return Err(IngestError::validation(
                "events",
                format!("batch must contain between 1 and {} events", self.limits.max_batch_events),
            ));
        }

        let decision = self.admit(credential).await;
        if !decision.allowed {
            return Err(IngestError::RateLimited(decision));
        }

        let account_id = credential.account_id;
        let mut results = Vec::with_capacity(total);
        let mut failed = false;

        for (index, entry) in batch.events.into_iter().enumerate() {
            let reference_id = entry.reference_id;

            if failed && batch.fail_fast {
                results.push(BatchItemResult {
                    index,
                    reference_id,
                    success: false,
                    event: None,
                    error: Some(BatchItemError {
                        code: "skipped",
                        message: "skipped after an earlier failure".to_string(),
                        field: None,
                    }),
                });
                continue;
            }

            match self.ingest_entry(account_id, entry.event).await {
                Ok(event) => results.push(BatchItemResult {
                    index,
                    reference_id,
                    success: true,
                    event: Some(event),
                    error: None,
                }),
                Err(err) => {
                    debug!(index, error = %err, "batch entry rejected");
                    failed = true;
                    results.push(BatchItemResult {
                        index,
                        reference_id,
                        success: false,
                        event: None,
                        error: Some(err.batch_error()),
                    });
                },
            }
        }

        let successful = results.iter().filter(|r| r.success).count();
        info!(account_id = %account_id, total, successful, "batch ingested");

        Ok(BatchOutcome {
            summary: BatchSummary { total, successful, failed: total - successful, results },
            rate_limit: decision,
        })
    }

    /// Lists `account_id`'s events, newest first.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a limit outside 1..=100 or a
    /// malformed cursor.
    pub async fn list_events(
        &self,
        account_id: AccountId,
        query: EventListQuery,
    ) -> Result<EventList, CoreError> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(CoreError::InvalidInput(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        let before = query.cursor.as_deref().map(EventCursor::decode).transpose()?;

        let mut events = self
            .storage
            .events
            .list(account_id, &EventQuery {
                event_type: query.event_type,
                source: query.source,
                status: query.status,
                since: query.since,
                until: query.until,
                before,
                limit: limit + 1,
            })
            .await?;

        let has_more = events.len() > limit;
        events.truncate(limit);
        let next_cursor =
            if has_more { events.last().map(|e| EventCursor::of(e).encode()) } else { None };

        Ok(EventList { events, next_cursor, has_more })
    }

    /// Loads an event owned by `account_id`.
    pub async fn find_event(
        &self,
        account_id: AccountId,
        event_id: EventId,
    ) -> Result<Option<Event>, CoreError> {
        let event = self.storage.events.find(event_id).await?;
        Ok(event.filter(|e| e.account_id == account_id))
    }

    async fn ingest_entry(&self, account_id: AccountId, request: NewEvent) -> Result<Event, IngestError> {
        let valid = self.validate(request, None)?;
        if let Some(event) = self.bound_event(account_id, &valid).await? {
            return Ok(event);
        }
        let (event, _) = self.store(account_id, valid).await?;
        Ok(event)
    }

    async fn admit(&self, credential: &Credential) -> RateLimitDecision {
        let tier = credential.requests_per_minute.map(RateLimitTier::per_minute);
        self.rate_limiter.check(&credential.id.to_string(), tier).await
    }

    /// The event an unexpired idempotency key already maps to.
    async fn bound_event(
        &self,
        account_id: AccountId,
        valid: &ValidEvent,
    ) -> Result<Option<Event>, IngestError> {
        let Some(key) = valid.metadata.idempotency_key.as_deref() else {
            return Ok(None);
        };
        let now = self.clock.now_utc();
        let Some(record) = self.storage.idempotency.find(account_id, key, now).await? else {
            return Ok(None);
        };
        Ok(self.find_event(account_id, record.event_id).await?)
    }

    /// Reserves the key, stores the event and notifies downstream.
    ///
    /// Returns the event and whether this call created it.
    async fn store(
        &self,
        account_id: AccountId,
        valid: ValidEvent,
    ) -> Result<(Event, bool), IngestError> {
        let now = self.clock.now_utc();
        let event =
            Event::new(account_id, valid.event_type, valid.source, valid.data, valid.metadata, now);
        let key = event.metadata.idempotency_key.clone();

        if let Some(key) = &key {
            let ttl = chrono::Duration::from_std(self.limits.idempotency_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(1));
            let record = IdempotencyRecord {
                account_id,
                key: key.clone(),
                event_id: event.id,
                expires_at: now + ttl,
                created_at: now,
            };
            if let Reservation::Existing(existing) =
                self.storage.idempotency.reserve(&record, now).await?
            {
                return match self.find_event(account_id, existing.event_id).await? {
                    Some(event) => Ok((event, false)),
                    None => Err(IngestError::IdempotencyConflict { key: key.clone() }),
                };
            }
        }

        if let Err(err) = self.storage.events.insert(&event).await {
            if let Some(key) = &key {
                if let Err(release_err) =
                    self.storage.idempotency.release(account_id, key, event.id).await
                {
                    warn!(event_id = %event.id, error = %release_err, "failed to release idempotency key");
                }
            }
            return Err(err.into());
        }

        self.dispatch_wakeup.wake();
        let listeners = self.stream.publish(&event);

        info!(
            event_id = %event.id,
            account_id = %account_id,
            event_type = %event.event_type,
            listeners,
            "event accepted"
        );
        Ok((event, true))
    }

    fn validate(&self, request: NewEvent, header_key: Option<&str>) -> Result<ValidEvent, IngestError> {
        let event_type = request.event_type.trim();
        if event_type.is_empty() || event_type.len() > MAX_FIELD_LENGTH {
            return Err(IngestError::validation(
                "type",
                format!("type must be between 1 and {MAX_FIELD_LENGTH} characters"),
            ));
        }
        if !event_type.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return Err(IngestError::validation(
                "type",
                "type may only contain letters, digits, '.', '_' and '-'",
            ));
        }

        let source = request.source.trim();
        if source.is_empty() || source.len() > MAX_FIELD_LENGTH {
            return Err(IngestError::validation(
                "source",
                format!("source must be between 1 and {MAX_FIELD_LENGTH} characters"),
            ));
        }

        if !request.data.is_object() {
            return Err(IngestError::validation("data", "data must be a JSON object"));
        }
        let size = serde_json::to_vec(&request.data).map_err(CoreError::from)?.len();
        if size > self.limits.max_event_bytes {
            return Err(IngestError::PayloadTooLarge { limit: self.limits.max_event_bytes });
        }

        let mut metadata = request.metadata;
        if metadata.idempotency_key.is_none() {
            metadata.idempotency_key = header_key.map(str::to_string);
        }
        if let Some(key) = &metadata.idempotency_key {
            if key.is_empty() || key.len() > MAX_FIELD_LENGTH {
                return Err(IngestError::validation(
                    "metadata.idempotency_key",
                    format!("idempotency key must be between 1 and {MAX_FIELD_LENGTH} characters"),
                ));
            }
        }

        Ok(ValidEvent {
            event_type: event_type.to_string(),
            source: source.to_string(),
            data: request.data,
            metadata,
        })
    }
}
