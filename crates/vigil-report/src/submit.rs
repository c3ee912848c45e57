//! Regulatory submission.
//!
//! Every event gets a deterministic id derived from its business identity;
//! the id doubles as the outbound idempotency key and the duplicate-check key
//! against the submissions audit table. Delivery retries transient failures
//! with exponential backoff and dead-letters whatever cannot be delivered.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use vigil_core::audit::{AuditWriter, DeadLetterAudit, SubmissionAudit};
use vigil_core::clock::SharedClock;
use vigil_core::config::RetryConfig;
use vigil_core::value::{canonical_json, Value};
use vigil_core::warehouse::{SharedWarehouse, WarehouseError};

use crate::cache::ReferenceCache;

/// Namespace for deterministic event ids. Shared verbatim with the
/// transformation layer's id macro; changing it breaks idempotency across the
/// platform.
pub const MARKETS_NAMESPACE: &str = "a1b2c3d4-e5f6-7890-abcd-ef1234567890";

const DUPLICATE_QUERY: &str =
    "SELECT 1 FROM control.regulatory_submissions WHERE event_id = ? LIMIT 1";

/// Deterministic event id: a pure function of the event's business identity.
pub fn generate_event_id(event: &serde_json::Value) -> String {
    let domain = event["domain"].as_str().unwrap_or("markets");
    let source_system = event["source_system"].as_str().unwrap_or("UNKNOWN");
    let source_event_id = event["source_event_id"]
        .as_str()
        .or_else(|| event["trade_id"].as_str())
        .unwrap_or("");

    let id_string =
        format!("{MARKETS_NAMESPACE}:event:{domain}:{source_system}:{source_event_id}");
    format!("{:x}", md5::compute(id_string.as_bytes()))
}

/// Response from one delivery attempt that reached the regulator.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Delivery attempt that never reached the regulator. Both kinds retry.
#[derive(Debug, thiserror::Error)]
pub enum TransportFailure {
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("request error: {0}")]
    Connection(String),
}

/// Outbound delivery seam.
#[async_trait]
pub trait SubmitTransport: Send + Sync {
    async fn post(
        &self,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<TransportResponse, TransportFailure>;
}

/// HTTP transport for the regulator endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(url: String, api_key: String) -> Result<HttpTransport, anyhow::Error> {
        Ok(HttpTransport {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl SubmitTransport for HttpTransport {
    async fn post(
        &self,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<TransportResponse, TransportFailure> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .header("X-Idempotency-Key", idempotency_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportFailure::Timeout(e.to_string())
                } else {
                    TransportFailure::Connection(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok(TransportResponse { status, body })
    }
}

/// Submission outcome exposed over the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitStatus {
    Success,
    Duplicate,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub status: SubmitStatus,
    pub event_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regulator_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

enum Delivery {
    Accepted {
        regulator_reference: Option<String>,
        retries: u32,
    },
    Rejected {
        reason: String,
        attempts: u32,
    },
}

/// Submits events to the regulator with enrichment and retry.
pub struct Submitter {
    cache: Arc<ReferenceCache>,
    warehouse: SharedWarehouse,
    audit: AuditWriter,
    transport: Arc<dyn SubmitTransport>,
    retry: RetryConfig,
    clock: SharedClock,
}

impl Submitter {
    pub fn new(
        cache: Arc<ReferenceCache>,
        warehouse: SharedWarehouse,
        audit: AuditWriter,
        transport: Arc<dyn SubmitTransport>,
        retry: RetryConfig,
        clock: SharedClock,
    ) -> Submitter {
        Submitter {
            cache,
            warehouse,
            audit,
            transport,
            retry,
            clock,
        }
    }

    /// Submit one event end-to-end: id, duplicate check, enrichment,
    /// delivery, audit.
    pub async fn submit_event(&self, event: serde_json::Value) -> SubmitResult {
        let event_id = generate_event_id(&event);
        let event_timestamp = event["event_timestamp"]
            .as_str()
            .and_then(Value::parse_timestamp)
            .unwrap_or_else(|| self.clock.now_utc());

        if self.is_duplicate(&event_id).await {
            info!(event_id, "duplicate submission skipped");
            counter!("reporter.submissions.duplicate", 1);
            return SubmitResult {
                status: SubmitStatus::Duplicate,
                event_id,
                regulator_reference: None,
                latency_seconds: None,
                message: Some("Event already submitted".to_string()),
            };
        }

        let enriched = self.enrich_event(&event).await;

        let submission_start = self.clock.monotonic();
        let delivery = self.deliver_with_retry(&event_id, &enriched).await;
        let submission_latency = submission_start.elapsed().as_secs_f64();
        let total_latency = (self.clock.now_utc() - event_timestamp).num_milliseconds() as f64
            / 1000.0;

        match delivery {
            Delivery::Accepted {
                regulator_reference,
                retries,
            } => {
                self.audit
                    .log_submission(SubmissionAudit {
                        submission_id: Uuid::new_v4().to_string(),
                        event_id: event_id.clone(),
                        event_timestamp,
                        submitted_at: self.clock.now_utc(),
                        regulator_reference: regulator_reference.clone(),
                        submission_latency_seconds: submission_latency,
                        status: "SUBMITTED".to_string(),
                        report_type: "TRADE".to_string(),
                        report_payload_hash: hash_payload(&enriched),
                        retry_count: retries as i64,
                    })
                    .await;

                info!(
                    event_id,
                    regulator_reference = regulator_reference.as_deref().unwrap_or(""),
                    latency_seconds = total_latency,
                    "submission successful"
                );
                counter!("reporter.submissions.success", 1);

                SubmitResult {
                    status: SubmitStatus::Success,
                    event_id,
                    regulator_reference,
                    latency_seconds: Some(total_latency),
                    message: None,
                }
            }
            Delivery::Rejected { reason, attempts } => {
                self.audit
                    .log_dead_letter(DeadLetterAudit {
                        dead_letter_id: Uuid::new_v4().to_string(),
                        event_id: event_id.clone(),
                        event_timestamp,
                        failed_at: self.clock.now_utc(),
                        failure_reason: reason.clone(),
                        retry_count: attempts as i64,
                        last_error: reason.clone(),
                        event_payload: event.to_string(),
                    })
                    .await;

                error!(event_id, error = %reason, "submission failed, dead-lettered");
                counter!("reporter.submissions.dead_letter", 1);

                SubmitResult {
                    status: SubmitStatus::Error,
                    event_id,
                    regulator_reference: None,
                    latency_seconds: None,
                    message: Some(reason),
                }
            }
        }
    }

    async fn is_duplicate(&self, event_id: &str) -> bool {
        let params = [Value::Str(event_id.to_string())];
        match self.warehouse.query(DUPLICATE_QUERY, &params).await {
            Ok(rows) => !rows.is_empty(),
            // A missing audit table means nothing was ever submitted.
            Err(WarehouseError::TableNotFound(_)) => false,
            Err(e) => {
                warn!(event_id, error = %e, "duplicate check failed, assuming new");
                false
            }
        }
    }

    /// Attach reference data. Missing references are logged and dropped;
    /// an unknown trader must not block a regulatory deadline.
    async fn enrich_event(&self, event: &serde_json::Value) -> serde_json::Value {
        let mut enriched = event.clone();
        let Some(object) = enriched.as_object_mut() else {
            return enriched;
        };

        if let Some(trader_id) = event["trader_id"].as_str() {
            match self.cache.get_trader(trader_id).await {
                Some(trader) => {
                    copy_field(object, &trader, "trader_name");
                    copy_field(object, &trader, "desk_id");
                    copy_field(object, &trader, "compliance_officer");
                }
                None => warn!(trader_id, "trader not found"),
            }
        }

        let counterparty = match (
            event["counterparty_id"].as_str(),
            event["counterparty_name"].as_str(),
        ) {
            (Some(id), _) => self.cache.get_counterparty(id).await,
            (None, Some(name)) => self.cache.get_counterparty_by_name(name).await,
            (None, None) => None,
        };
        if let Some(counterparty) = counterparty {
            copy_field(object, &counterparty, "counterparty_name");
            if let Some(lei) = counterparty.get("lei") {
                if !lei.is_null() {
                    object.insert("counterparty_lei".to_string(), lei.to_json());
                }
            }
        }

        if let Some(instrument_id) = event["instrument_id"].as_str() {
            if let Some(instrument) = self.cache.get_instrument(instrument_id).await {
                if let Some(symbol) = instrument.get("symbol") {
                    object.insert("instrument_symbol".to_string(), symbol.to_json());
                }
                copy_field(object, &instrument, "isin");
                copy_field(object, &instrument, "asset_class");
            }
        }

        enriched
    }

    async fn deliver_with_retry(
        &self,
        event_id: &str,
        enriched: &serde_json::Value,
    ) -> Delivery {
        let mut delay = self.retry.initial_delay_seconds;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            match self.transport.post(enriched, event_id).await {
                Ok(response) if (200..300).contains(&response.status) => {
                    let reference = response.body["reference"]
                        .as_str()
                        .or_else(|| response.body["id"].as_str())
                        .map(str::to_string);
                    return Delivery::Accepted {
                        regulator_reference: reference,
                        retries: attempt - 1,
                    };
                }
                Ok(response)
                    if (400..500).contains(&response.status) && response.status != 429 =>
                {
                    return Delivery::Rejected {
                        reason: format!(
                            "HTTP {}: {}",
                            response.status,
                            truncate(&response.body.to_string(), 200)
                        ),
                        attempts: attempt,
                    };
                }
                Ok(response) => {
                    last_error = format!(
                        "HTTP {}: {}",
                        response.status,
                        truncate(&response.body.to_string(), 200)
                    );
                    warn!(
                        event_id,
                        attempt,
                        status = response.status,
                        delay_seconds = delay,
                        "submission retry"
                    );
                }
                Err(failure) => {
                    last_error = failure.to_string();
                    warn!(event_id, attempt, delay_seconds = delay, error = %last_error, "submission retry");
                }
            }

            if attempt < self.retry.max_attempts {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                delay = (delay * self.retry.exponential_base).min(self.retry.max_delay_seconds);
            }
        }

        Delivery::Rejected {
            reason: format!("Max retries exceeded. Last error: {last_error}"),
            attempts: self.retry.max_attempts,
        }
    }
}

fn copy_field(
    target: &mut serde_json::Map<String, serde_json::Value>,
    source: &vigil_core::value::Row,
    field: &str,
) {
    if let Some(value) = source.get(field) {
        if !value.is_null() {
            target.insert(field.to_string(), value.to_json());
        }
    }
}

/// SHA-256 over the canonical JSON rendering; stable across processes.
pub fn hash_payload(payload: &serde_json::Value) -> String {
    let canonical = canonical_json(payload);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vigil_core::clock::SystemClock;
    use vigil_core::warehouse::memory::MemoryWarehouse;

    struct ScriptedTransport {
        responses: Mutex<Vec<Result<TransportResponse, TransportFailure>>>,
        calls: Mutex<Vec<serde_json::Value>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<TransportResponse, TransportFailure>>) -> Arc<Self> {
            Arc::new(ScriptedTransport {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SubmitTransport for ScriptedTransport {
        async fn post(
            &self,
            payload: &serde_json::Value,
            _idempotency_key: &str,
        ) -> Result<TransportResponse, TransportFailure> {
            self.calls.lock().unwrap().push(payload.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(TransportResponse {
                    status: 200,
                    body: serde_json::json!({"reference": "REG-REF"}),
                })
            } else {
                responses.remove(0)
            }
        }
    }

    fn ok(status: u16, body: serde_json::Value) -> Result<TransportResponse, TransportFailure> {
        Ok(TransportResponse { status, body })
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_seconds: 0.001,
            max_delay_seconds: 0.002,
            exponential_base: 2.0,
        }
    }

    fn submitter(
        wh: &Arc<MemoryWarehouse>,
        transport: Arc<ScriptedTransport>,
        retry: RetryConfig,
    ) -> Submitter {
        let clock: SharedClock = Arc::new(SystemClock);
        let cache = Arc::new(ReferenceCache::new(
            wh.clone(),
            clock.clone(),
            Duration::from_millis(200),
            600,
        ));
        Submitter::new(
            cache,
            wh.clone(),
            AuditWriter::new(wh.clone(), "control"),
            transport,
            retry,
            clock,
        )
    }

    fn event() -> serde_json::Value {
        serde_json::json!({
            "source_system": "MX",
            "source_event_id": "T1",
            "event_timestamp": "2024-01-15T10:30:00Z",
            "trader_id": "TR1",
            "quantity": 100
        })
    }

    #[test]
    fn event_id_is_a_pure_function_of_identity() {
        let a = generate_event_id(&event());
        let b = generate_event_id(&event());
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let mut other = event();
        other["source_event_id"] = "T2".into();
        assert_ne!(a, generate_event_id(&other));

        // trade_id is the fallback identity field.
        let via_trade_id = serde_json::json!({
            "source_system": "MX",
            "trade_id": "T1"
        });
        assert_eq!(a, generate_event_id(&via_trade_id));
    }

    #[tokio::test]
    async fn first_submit_succeeds_second_is_duplicate() {
        let wh = Arc::new(MemoryWarehouse::new());
        let transport = ScriptedTransport::new(vec![]);
        let s = submitter(&wh, transport.clone(), fast_retry(3));

        let first = s.submit_event(event()).await;
        assert_eq!(first.status, SubmitStatus::Success);
        assert_eq!(first.regulator_reference.as_deref(), Some("REG-REF"));

        let second = s.submit_event(event()).await;
        assert_eq!(second.status, SubmitStatus::Duplicate);
        assert_eq!(second.event_id, first.event_id);
        assert!(second.regulator_reference.is_none());

        // The audit table grew by exactly one row, and only one call went out.
        assert_eq!(wh.rows("control.regulatory_submissions").await.len(), 1);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_succeed() {
        let wh = Arc::new(MemoryWarehouse::new());
        let transport = ScriptedTransport::new(vec![
            ok(503, serde_json::json!({})),
            Err(TransportFailure::Timeout("deadline".into())),
            ok(429, serde_json::json!({})),
        ]);
        let s = submitter(&wh, transport.clone(), fast_retry(5));

        let result = s.submit_event(event()).await;
        assert_eq!(result.status, SubmitStatus::Success);
        assert_eq!(transport.call_count(), 4);

        let audits = wh.rows("control.regulatory_submissions").await;
        assert_eq!(audits[0]["retry_count"], Value::Int(3));
    }

    #[tokio::test]
    async fn client_error_dead_letters_without_retry() {
        let wh = Arc::new(MemoryWarehouse::new());
        let transport =
            ScriptedTransport::new(vec![ok(400, serde_json::json!({"error": "bad payload"}))]);
        let s = submitter(&wh, transport.clone(), fast_retry(5));

        let result = s.submit_event(event()).await;
        assert_eq!(result.status, SubmitStatus::Error);
        assert_eq!(transport.call_count(), 1);

        let dead = wh.rows("control.regulatory_dead_letter").await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0]["failure_reason"]
            .as_str()
            .unwrap()
            .contains("HTTP 400"));
        // The original event payload is preserved for replay.
        let payload: serde_json::Value =
            serde_json::from_str(dead[0]["event_payload"].as_str().unwrap()).unwrap();
        assert_eq!(payload["source_event_id"], "T1");
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_attempt_count() {
        let wh = Arc::new(MemoryWarehouse::new());
        let transport = ScriptedTransport::new(vec![
            ok(500, serde_json::json!({})),
            ok(500, serde_json::json!({})),
        ]);
        let s = submitter(&wh, transport.clone(), fast_retry(2));

        let result = s.submit_event(event()).await;
        assert_eq!(result.status, SubmitStatus::Error);
        assert!(result.message.unwrap().contains("Max retries exceeded"));

        let dead = wh.rows("control.regulatory_dead_letter").await;
        assert_eq!(dead[0]["retry_count"], Value::Int(2));
        assert!(wh.rows("control.regulatory_submissions").await.is_empty());
    }

    #[tokio::test]
    async fn enrichment_attaches_reference_data_and_tolerates_misses() {
        let wh = Arc::new(MemoryWarehouse::new());
        wh.seed(
            "snapshots.traders_snapshot",
            vec![[
                ("trader_id".to_string(), Value::Str("TR1".into())),
                ("trader_name".to_string(), Value::Str("Ada".into())),
                ("desk_id".to_string(), Value::Str("D1".into())),
            ]
            .into_iter()
            .collect()],
        )
        .await;

        let transport = ScriptedTransport::new(vec![]);
        let s = submitter(&wh, transport.clone(), fast_retry(3));

        let mut e = event();
        e["instrument_id"] = "I-MISSING".into();
        let result = s.submit_event(e).await;
        assert_eq!(result.status, SubmitStatus::Success);

        let sent = transport.calls.lock().unwrap()[0].clone();
        assert_eq!(sent["trader_name"], "Ada");
        assert_eq!(sent["desk_id"], "D1");
        // Unknown instrument is dropped, not fatal.
        assert!(sent.get("instrument_symbol").is_none());
    }

    #[test]
    fn payload_hash_is_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(hash_payload(&a), hash_payload(&b));
        assert_eq!(hash_payload(&a).len(), 64);
    }
}
