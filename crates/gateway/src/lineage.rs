use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use ulid::Ulid;

use crate::config::{LineageConfig, LineageMode};

const PRODUCER: &str = "vba-gateway";
const JOB_NAME: &str = "governed_query";

#[derive(Debug)]
pub enum LineageError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    Io(std::io::Error),
    Serialize(serde_json::Error),
}

impl std::fmt::Display for LineageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineageError::Timeout => write!(f, "lineage endpoint timed out"),
            LineageError::Http(err) => write!(f, "lineage request failed: {}", err),
            LineageError::BadStatus(status) => write!(f, "lineage endpoint returned {}", status),
            LineageError::Io(err) => write!(f, "failed to write lineage event: {}", err),
            LineageError::Serialize(err) => write!(f, "failed to encode lineage event: {}", err),
        }
    }
}

impl std::error::Error for LineageError {}

impl From<reqwest::Error> for LineageError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            LineageError::Timeout
        } else {
            LineageError::Http(value)
        }
    }
}

/// What a completed query read and who ran it.
#[derive(Debug, Clone)]
pub struct LineageRecord<'a> {
    pub request_id: &'a str,
    pub data_products: Vec<&'a str>,
    pub metrics: Vec<&'a str>,
    pub sql_hash: &'a str,
    pub role: &'a str,
    pub timestamp: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunEvent<'a> {
    event_type: &'static str,
    event_time: &'a str,
    run: Run,
    job: Dataset<'a>,
    inputs: Vec<Dataset<'a>>,
    outputs: Vec<Dataset<'a>>,
    producer: &'static str,
    metadata: EventMetadata<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Run {
    run_id: String,
}

#[derive(Debug, Serialize)]
struct Dataset<'a> {
    namespace: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct EventMetadata<'a> {
    request_id: &'a str,
    metrics: &'a [&'a str],
    sql_hash: &'a str,
    role: &'a str,
}

#[derive(Clone)]
pub enum LineageSink {
    Disabled,
    File {
        dir: PathBuf,
        namespace: String,
    },
    Http {
        client: reqwest::Client,
        url: String,
        namespace: String,
    },
}

impl LineageSink {
    pub fn from_config(config: &LineageConfig) -> Result<Self, LineageError> {
        match config.mode {
            LineageMode::Disabled => Ok(LineageSink::Disabled),
            LineageMode::File => Ok(LineageSink::File {
                dir: config.dir.clone(),
                namespace: config.namespace.clone(),
            }),
            LineageMode::Http => Self::http(
                config.url.clone().unwrap_or_default(),
                config.namespace.clone(),
                config.timeout,
            ),
        }
    }

    pub fn http(
        url: impl Into<String>,
        namespace: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LineageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(LineageError::Http)?;
        Ok(LineageSink::Http {
            client,
            url: url.into(),
            namespace: namespace.into(),
        })
    }

    /// Emits the event and returns its id. Delivery failures never fail the
    /// request: they are logged, counted, and yield `None`.
    pub async fn emit(&self, record: &LineageRecord<'_>) -> Option<String> {
        if matches!(self, LineageSink::Disabled) {
            return None;
        }

        match self.try_emit(record).await {
            Ok(event_id) => Some(event_id),
            Err(err) => {
                tracing::warn!(
                    request_id = %record.request_id,
                    error = %err,
                    "lineage event not recorded"
                );
                crate::metrics::inc_lineage_failure();
                None
            }
        }
    }

    async fn try_emit(&self, record: &LineageRecord<'_>) -> Result<String, LineageError> {
        let run_id = ulid_as_uuid(Ulid::new());

        match self {
            LineageSink::Disabled => Ok(run_id),
            LineageSink::File { dir, namespace } => {
                let bytes = serde_json::to_vec_pretty(&build_event(record, namespace, &run_id))
                    .map_err(LineageError::Serialize)?;
                let path = dir.join(format!("{}.json", run_id));
                let dir = dir.clone();
                tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    std::fs::create_dir_all(&dir)?;
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&path)?;
                    file.write_all(&bytes)
                })
                .await
                .map_err(|err| LineageError::Io(std::io::Error::other(err)))?
                .map_err(LineageError::Io)?;
                Ok(run_id)
            }
            LineageSink::Http {
                client,
                url,
                namespace,
            } => {
                let resp = client
                    .post(format!("{}/api/v1/lineage", url.trim_end_matches('/')))
                    .json(&build_event(record, namespace, &run_id))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    return Err(LineageError::BadStatus(resp.status()));
                }
                Ok(run_id)
            }
        }
    }
}

fn build_event<'a>(
    record: &'a LineageRecord<'a>,
    namespace: &'a str,
    run_id: &str,
) -> RunEvent<'a> {
    RunEvent {
        event_type: "COMPLETE",
        event_time: record.timestamp,
        run: Run {
            run_id: run_id.to_string(),
        },
        job: Dataset {
            namespace,
            name: JOB_NAME,
        },
        inputs: record
            .data_products
            .iter()
            .copied()
            .map(|name| Dataset { namespace, name })
            .collect(),
        outputs: Vec::new(),
        producer: PRODUCER,
        metadata: EventMetadata {
            request_id: record.request_id,
            metrics: &record.metrics,
            sql_hash: record.sql_hash,
            role: record.role,
        },
    }
}

/// OpenLineage run ids are UUID-shaped; a ULID carries the same 128 bits.
fn ulid_as_uuid(id: Ulid) -> String {
    let hex = format!("{:032x}", u128::from(id));
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    fn record() -> LineageRecord<'static> {
        LineageRecord {
            request_id: "req-1",
            data_products: vec!["dp_complaints"],
            metrics: vec!["complaint_count"],
            sql_hash: "abc",
            role: "branch_manager",
            timestamp: "2024-05-01T00:00:00Z",
        }
    }

    async fn spawn_collector(
        status: StatusCode,
    ) -> (String, Arc<Mutex<Vec<serde_json::Value>>>, tokio::sync::oneshot::Sender<()>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route(
                "/api/v1/lineage",
                post(
                    move |State(seen): State<Arc<Mutex<Vec<serde_json::Value>>>>,
                          Json(body): Json<serde_json::Value>| async move {
                        seen.lock().expect("lock").push(body);
                        status
                    },
                ),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind collector");
        let addr = listener.local_addr().expect("collector addr");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        (format!("http://{}", addr), seen, shutdown_tx)
    }

    #[test]
    fn run_ids_are_uuid_shaped() {
        let id = ulid_as_uuid(Ulid::from(0x0123_4567_89ab_cdef_0123_4567_89ab_cdefu128));
        assert_eq!(id, "01234567-89ab-cdef-0123-456789abcdef");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_sink_posts_complete_event() {
        let (url, seen, shutdown) = spawn_collector(StatusCode::CREATED).await;
        let sink = LineageSink::http(url, "banking_analytics", Duration::from_secs(2)).expect("sink");

        let event_id = sink.emit(&record()).await.expect("event id");

        let events = seen.lock().expect("lock").clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["eventType"], "COMPLETE");
        assert_eq!(events[0]["run"]["runId"], event_id.as_str());
        assert_eq!(events[0]["inputs"][0]["name"], "dp_complaints");
        assert_eq!(events[0]["metadata"]["request_id"], "req-1");

        let _ = shutdown.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unavailable_endpoint_degrades_to_none() {
        let (url, _seen, shutdown) = spawn_collector(StatusCode::SERVICE_UNAVAILABLE).await;
        let sink = LineageSink::http(url, "banking_analytics", Duration::from_secs(2)).expect("sink");
        assert_eq!(sink.emit(&record()).await, None);
        let _ = shutdown.send(());

        let unreachable =
            LineageSink::http("http://127.0.0.1:9", "banking_analytics", Duration::from_millis(200))
                .expect("sink");
        assert_eq!(unreachable.emit(&record()).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_sink_writes_one_event_per_run() {
        let dir = std::env::temp_dir().join(format!("vba-lineage-test-{}", Ulid::new()));
        let sink = LineageSink::File {
            dir: dir.clone(),
            namespace: "banking_analytics".to_string(),
        };

        let event_id = sink.emit(&record()).await.expect("event id");
        let raw = std::fs::read_to_string(dir.join(format!("{}.json", event_id))).expect("event file");
        let event: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(event["job"]["namespace"], "banking_analytics");
        assert_eq!(event["producer"], PRODUCER);

        assert_eq!(LineageSink::Disabled.emit(&record()).await, None);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
