//! Billing ledger submission
//!
//! Records are handed to a single dispatcher task through a bounded in-order
//! queue, so the ledger sees records in the order sessions closed. The
//! checkout loop only waits on the network when the queue is full. Delivery
//! is at-most-once: a failed submission is logged and dropped.

use crate::config::BillingConfig;
use crate::error::BillingError;
use crate::types::BillingRecord;
use serde::Serialize;
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

const USER_AGENT: &str = concat!("autobill/", env!("CARGO_PKG_VERSION"));

/// Destination for billing records
pub trait BillingSink: Send + 'static {
    /// Submit one record. Errors are reported, never retried.
    fn submit(
        &mut self,
        record: &BillingRecord,
    ) -> impl Future<Output = Result<(), BillingError>> + Send;
}

/// Posts records as JSON to the ledger
pub struct HttpBillingSink {
    client: reqwest::Client,
    url: String,
}

impl HttpBillingSink {
    pub fn new(config: &BillingConfig) -> Result<Self, BillingError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout())
            .build()
            .map_err(|e| BillingError::Client(e.to_string()))?;

        Ok(Self {
            client,
            url: config.url(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl BillingSink for HttpBillingSink {
    async fn submit(&mut self, record: &BillingRecord) -> Result<(), BillingError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(record)
            .send()
            .await?;

        let status = response.status();
        tracing::info!(id = record.id, "Response status code: {}", status.as_u16());
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(BillingError::Status {
            id: record.id,
            status: status.as_u16(),
            body,
        })
    }
}

/// Writes each record as one JSON line. Used for dry runs.
pub struct JsonLinesSink<W> {
    writer: W,
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send + 'static> BillingSink for JsonLinesSink<W> {
    async fn submit(&mut self, record: &BillingRecord) -> Result<(), BillingError> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Outcome counts of a dispatcher's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub attempted: u64,
    pub delivered: u64,
    pub failed: u64,
    pub last_id: Option<u64>,
}

/// In-order queue in front of a [`BillingSink`]
pub struct BillingQueue {
    tx: mpsc::Sender<BillingRecord>,
    handle: JoinHandle<DispatchReport>,
}

impl BillingQueue {
    /// Start the dispatcher task holding at most `capacity` waiting records.
    /// `post_delay` is waited after every attempt, successful or not.
    pub fn spawn<S: BillingSink>(sink: S, post_delay: Duration, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(dispatch_loop(sink, rx, post_delay));
        Self { tx, handle }
    }

    /// Queue a record, waiting for room when the queue is full.
    /// Returns false if the dispatcher is gone.
    pub async fn enqueue(&self, record: BillingRecord) -> bool {
        let id = record.id;
        let sent = match self.tx.try_send(record) {
            Ok(()) => return true,
            Err(TrySendError::Full(record)) => {
                tracing::warn!(
                    id,
                    capacity = self.tx.max_capacity(),
                    "billing queue full, waiting for the ledger"
                );
                self.tx.send(record).await.is_ok()
            }
            Err(TrySendError::Closed(_)) => false,
        };
        if !sent {
            tracing::error!(id, "billing dispatcher stopped, record dropped");
        }
        sent
    }

    /// Close the queue and wait for already queued records to be attempted
    pub async fn finish(self) -> DispatchReport {
        drop(self.tx);
        match self.handle.await {
            Ok(report) => report,
            Err(e) => {
                tracing::error!("billing dispatcher failed: {e}");
                DispatchReport::default()
            }
        }
    }
}

async fn dispatch_loop<S: BillingSink>(
    mut sink: S,
    mut rx: mpsc::Receiver<BillingRecord>,
    post_delay: Duration,
) -> DispatchReport {
    let mut report = DispatchReport::default();

    while let Some(record) = rx.recv().await {
        report.attempted += 1;
        report.last_id = Some(record.id);

        match sink.submit(&record).await {
            Ok(()) => {
                report.delivered += 1;
                tracing::debug!(id = record.id, name = %record.name, "billing record delivered");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(id = record.id, name = %record.name, "billing submission failed: {e}");
            }
        }

        if !post_delay.is_zero() {
            tokio::time::sleep(post_delay).await;
        }
    }

    tracing::debug!(?report, "billing dispatcher drained");
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BILLING_UNITS;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn billing(id: u64, name: &str) -> BillingRecord {
        BillingRecord {
            id,
            name: name.to_string(),
            price: 10.0,
            units: BILLING_UNITS.to_string(),
            taken: 1,
            payable: 0.08,
        }
    }

    /// Records every submission; fails the ids it is told to
    #[derive(Clone, Default)]
    struct RecordingSink {
        seen: Arc<Mutex<Vec<u64>>>,
        fail_ids: Vec<u64>,
    }

    impl BillingSink for RecordingSink {
        async fn submit(&mut self, record: &BillingRecord) -> Result<(), BillingError> {
            self.seen.lock().unwrap().push(record.id);
            if self.fail_ids.contains(&record.id) {
                return Err(BillingError::Status {
                    id: record.id,
                    status: 503,
                    body: "busy".to_string(),
                });
            }
            Ok(())
        }
    }

    struct CapturedRequest {
        request_line: String,
        headers: String,
        body: String,
    }

    /// Minimal HTTP endpoint answering each connection with the next status
    async fn spawn_ledger(
        statuses: Vec<u16>,
    ) -> (String, mpsc::UnboundedReceiver<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for status in statuses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];

                let header_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while buf.len() < header_end + content_length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    buf.extend_from_slice(&chunk[..n]);
                }

                let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
                let (request_line, headers) = head.split_once("\r\n").unwrap();
                tx.send(CapturedRequest {
                    request_line: request_line.to_string(),
                    headers: headers.to_lowercase(),
                    body,
                })
                .unwrap();

                let reply_body = if status >= 400 { "ledger down" } else { "" };
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply_body}",
                    reply_body.len()
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (format!("http://{addr}"), rx)
    }

    fn config_for(endpoint: String) -> BillingConfig {
        BillingConfig {
            endpoint,
            post_delay_ms: 0,
            timeout_secs: 5,
            ..BillingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_http_sink_posts_json_to_product() {
        let (endpoint, mut requests) = spawn_ledger(vec![201]).await;
        let mut sink = HttpBillingSink::new(&config_for(endpoint)).unwrap();

        sink.submit(&billing(1, "Apple")).await.unwrap();

        let request = requests.recv().await.unwrap();
        assert_eq!(request.request_line, "POST /product HTTP/1.1");
        assert!(request.headers.contains("content-type: application/json"));

        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "id": 1, "name": "Apple", "price": 10.0, "units": "units", "taken": 1, "payable": 0.08
            })
        );
    }

    #[tokio::test]
    async fn test_http_sink_reports_status_with_body() {
        let (endpoint, _requests) = spawn_ledger(vec![500]).await;
        let mut sink = HttpBillingSink::new(&config_for(endpoint)).unwrap();

        let err = sink.submit(&billing(9, "Coke")).await.unwrap_err();
        match err {
            BillingError::Status { id, status, body } => {
                assert_eq!((id, status), (9, 500));
                assert_eq!(body, "ledger down");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_http_sink_unreachable_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut sink = HttpBillingSink::new(&config_for(format!("http://{addr}"))).unwrap();
        assert!(matches!(
            sink.submit(&billing(1, "Lays")).await,
            Err(BillingError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_queue_preserves_order_and_survives_failures() {
        let sink = RecordingSink {
            fail_ids: vec![2],
            ..RecordingSink::default()
        };
        let seen = Arc::clone(&sink.seen);
        let queue = BillingQueue::spawn(sink, Duration::ZERO, 8);

        for id in 1..=4 {
            assert!(queue.enqueue(billing(id, "Banana")).await);
        }
        let report = queue.finish().await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            report,
            DispatchReport {
                attempted: 4,
                delivered: 3,
                failed: 1,
                last_id: Some(4),
            }
        );
    }

    /// Takes a while per record, like a slow ledger
    struct SlowSink {
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl BillingSink for SlowSink {
        async fn submit(&mut self, record: &BillingRecord) -> Result<(), BillingError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.seen.lock().unwrap().push(record.id);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_queue_waits_instead_of_growing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = SlowSink {
            seen: Arc::clone(&seen),
        };
        let queue = BillingQueue::spawn(sink, Duration::ZERO, 1);

        let started = tokio::time::Instant::now();
        for id in 1..=4 {
            assert!(queue.enqueue(billing(id, "Apple")).await);
        }
        // The fourth record only fits once two submissions have finished
        assert!(started.elapsed() >= Duration::from_millis(35));

        let report = queue.finish().await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(report.delivered, 4);
    }

    #[tokio::test]
    async fn test_enqueue_after_dispatcher_exit_reports_drop() {
        let queue = BillingQueue::spawn(RecordingSink::default(), Duration::ZERO, 1);
        queue.handle.abort();
        while !queue.handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(!queue.enqueue(billing(1, "Apple")).await);
    }

    #[tokio::test]
    async fn test_queue_over_http_keeps_going_after_rejection() {
        let (endpoint, mut requests) = spawn_ledger(vec![400, 200]).await;
        let sink = HttpBillingSink::new(&config_for(endpoint)).unwrap();
        let queue = BillingQueue::spawn(sink, Duration::ZERO, 8);

        assert!(queue.enqueue(billing(1, "Milk")).await);
        assert!(queue.enqueue(billing(2, "Apple")).await);
        let report = queue.finish().await;

        assert_eq!((report.delivered, report.failed), (1, 1));
        let first: BillingRecord = serde_json::from_str(&requests.recv().await.unwrap().body).unwrap();
        let second: BillingRecord = serde_json::from_str(&requests.recv().await.unwrap().body).unwrap();
        assert_eq!((first.id, second.id), (1, 2));
    }

    #[tokio::test]
    async fn test_json_lines_sink_writes_one_line_per_record() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.submit(&billing(3, "Lays")).await.unwrap();
        sink.submit(&billing(4, "Coke")).await.unwrap();

        let text = String::from_utf8(sink.writer).unwrap();
        let ids: Vec<u64> = text
            .lines()
            .map(|line| serde_json::from_str::<BillingRecord>(line).unwrap().id)
            .collect();
        assert_eq!(ids, vec![3, 4]);
    }
}
