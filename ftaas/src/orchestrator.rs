//! Concurrent transfers with completion-ordered results.
//!
//! Every upload of a batch runs in its own tokio task and reports a [`TransferOutcome`]
//! through the batch's channel when it finishes. A [`TransferBatch`] yields those outcomes
//! in completion order; dropping it does not stop the uploads.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::{FutureExt, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::auth::TokenSource;
use crate::client::UploadClient;
use crate::config::TransferConfig;
use crate::error::{Error, Result};
use crate::types::{BatchId, FileContent, FileUploadInfo, UploadRequest};

/// How the results of a batch are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// Wait for every upload; results in submission order
    #[default]
    All,
    /// Results in the order the uploads finish
    Race,
}

/// The result of one upload, paired with the request it belongs to.
#[derive(Debug)]
pub struct TransferOutcome {
    /// Position of the request in the submitted batch
    pub index: usize,
    pub request: UploadRequest,
    pub result: Result<FileUploadInfo>,
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs many uploads at once through a shared [`UploadClient`].
pub struct TransferOrchestrator<S: TokenSource> {
    client: Arc<UploadClient<S>>,
    config: TransferConfig,
    limiter: Option<Arc<Semaphore>>,
    shutdown: Mutex<CancellationToken>,
    uploads_in_flight: Arc<AtomicUsize>,
}

impl<S: TokenSource> TransferOrchestrator<S> {
    pub fn new(client: Arc<UploadClient<S>>, config: TransferConfig) -> Self {
        let limiter = config.max_concurrency.map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            client,
            config,
            limiter,
            shutdown: Mutex::new(CancellationToken::new()),
            uploads_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn client(&self) -> &Arc<UploadClient<S>> {
        &self.client
    }

    /// Uploads started by this orchestrator that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.uploads_in_flight.load(Ordering::Relaxed)
    }

    /// Upload every item and wait for all of them.
    ///
    /// Returns one outcome per item, in submission order. A failed upload never affects
    /// the others unless `abort_on_failure` is configured.
    pub async fn upload_all(&self, items: Vec<(UploadRequest, FileContent)>, tenant_id: Option<&str>) -> Vec<TransferOutcome> {
        let mut outcomes = self.first_completed(items, tenant_id).await.drain().await;
        outcomes.sort_by_key(|outcome| outcome.index);
        outcomes
    }

    /// Start uploading every item and return the outcomes as they complete.
    pub async fn first_completed(&self, items: Vec<(UploadRequest, FileContent)>, tenant_id: Option<&str>) -> TransferBatch {
        let id = BatchId::new();
        let cancel = self.shutdown.lock().child_token();
        let (sender, receiver) = mpsc::unbounded_channel();
        let total = items.len();

        if total > 0 {
            // One issuance for the whole batch; units that find no credential try again themselves
            if let Err(e) = self.client.tokens().get_token().await {
                tracing::warn!(batch_id = %id, error = %e, "Could not obtain an access token before dispatch");
            }
        }

        tracing::info!(batch_id = %id, total, max_concurrency = ?self.config.max_concurrency, "Dispatching transfer batch");

        for (index, (request, content)) in items.into_iter().enumerate() {
            let span = tracing::info_span!("transfer", batch_id = %id, index, name = %request.name);
            let unit = TransferUnit {
                client: Arc::clone(&self.client),
                limiter: self.limiter.clone(),
                cancel: cancel.clone(),
                abort_on_failure: self.config.abort_on_failure,
                tenant_id: tenant_id.map(str::to_string),
            };
            let sender = sender.clone();
            let uploads_in_flight = Arc::clone(&self.uploads_in_flight);

            uploads_in_flight.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(
                async move {
                    let result = {
                        let _guard = scopeguard::guard((), |_| {
                            uploads_in_flight.fetch_sub(1, Ordering::Relaxed);
                        });
                        unit.run(&request, content).await
                    };
                    // The batch may have been dropped; the upload still counts as done
                    let _ = sender.send(TransferOutcome { index, request, result });
                }
                .instrument(span),
            );
        }

        TransferBatch {
            id,
            outcomes: receiver,
            cancel,
            total,
            received: 0,
        }
    }

    /// Upload every item under the given completion policy.
    ///
    /// [`CompletionPolicy::All`] returns outcomes in submission order,
    /// [`CompletionPolicy::Race`] in completion order.
    pub async fn upload_many(
        &self,
        items: Vec<(UploadRequest, FileContent)>,
        tenant_id: Option<&str>,
        policy: CompletionPolicy,
    ) -> Vec<TransferOutcome> {
        match policy {
            CompletionPolicy::All => self.upload_all(items, tenant_id).await,
            CompletionPolicy::Race => self.first_completed(items, tenant_id).await.drain().await,
        }
    }

    /// Cancel every batch started so far.
    ///
    /// Waiting uploads never start and running ones drop their connection; all of them
    /// report [`Error::Canceled`]. Batches started afterwards are not affected.
    pub fn cancel_all(&self) {
        let previous = std::mem::replace(&mut *self.shutdown.lock(), CancellationToken::new());
        tracing::info!(in_flight = self.in_flight(), "Canceling all transfers");
        previous.cancel();
    }
}

/// Everything a spawned upload needs besides its request and content.
struct TransferUnit<S: TokenSource> {
    client: Arc<UploadClient<S>>,
    limiter: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
    abort_on_failure: bool,
    tenant_id: Option<String>,
}

impl<S: TokenSource> TransferUnit<S> {
    async fn run(self, request: &UploadRequest, content: FileContent) -> Result<FileUploadInfo> {
        let upload = AssertUnwindSafe(self.upload(request, content)).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Canceled),
            result = upload => result.unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "upload task panicked".to_string());
                Err(Error::Internal { message })
            }),
        };

        match &result {
            Ok(info) => tracing::debug!(size = info.size, "Transfer completed"),
            Err(Error::Canceled) => tracing::debug!("Transfer canceled"),
            Err(e) => {
                tracing::warn!(error = %e, "Transfer failed");
                if self.abort_on_failure {
                    tracing::warn!("Aborting the rest of the batch");
                    self.cancel.cancel();
                }
            }
        }

        result
    }

    async fn upload(&self, request: &UploadRequest, content: FileContent) -> Result<FileUploadInfo> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(Arc::clone(limiter).acquire_owned().await.map_err(|_| Error::Canceled)?),
            None => None,
        };
        self.client.upload(request, content, self.tenant_id.as_deref()).await
    }
}

/// The in-flight uploads of one orchestration call.
///
/// A [`Stream`] of [`TransferOutcome`]s in completion order that ends once every submitted
/// upload has reported. Uploads keep running when the batch is dropped; use
/// [`cancel`](Self::cancel) to stop them.
#[derive(Debug)]
pub struct TransferBatch {
    id: BatchId,
    outcomes: mpsc::UnboundedReceiver<TransferOutcome>,
    cancel: CancellationToken,
    total: usize,
    received: usize,
}

impl TransferBatch {
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Number of uploads submitted.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Outcomes not yet yielded.
    pub fn remaining(&self) -> usize {
        self.total - self.received
    }

    /// Cancel the uploads of this batch that have not finished.
    pub fn cancel(&self) {
        tracing::info!(batch_id = %self.id, remaining = self.remaining(), "Canceling transfer batch");
        self.cancel.cancel();
    }

    /// Wait for every remaining outcome, in completion order.
    pub async fn drain(mut self) -> Vec<TransferOutcome> {
        let mut outcomes = Vec::with_capacity(self.remaining());
        while let Some(outcome) = self.outcomes.recv().await {
            self.received += 1;
            outcomes.push(outcome);
        }
        tracing::debug!(batch_id = %self.id, total = self.total, "Transfer batch drained");
        outcomes
    }
}

impl Stream for TransferBatch {
    type Item = TransferOutcome;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.outcomes.poll_recv(cx);
        if let Poll::Ready(Some(_)) = &polled {
            this.received += 1;
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use futures::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer};

    use crate::auth::ClientCredentialsSource;
    use crate::config::Config;
    use crate::test_utils::{EchoUpload, TOKEN_PATH, UPLOAD_PATH, mount_token_endpoint, test_config, text_of_len, upload_client};

    async fn mount_echo(server: &MockServer, echo: EchoUpload) {
        Mock::given(method("POST"))
            .and(path(UPLOAD_PATH))
            .respond_with(echo)
            .mount(server)
            .await;
    }

    fn orchestrator(config: &Config) -> TransferOrchestrator<ClientCredentialsSource> {
        TransferOrchestrator::new(upload_client(config), config.transfer.clone())
    }

    fn item(name: &str, len: usize) -> (UploadRequest, FileContent) {
        (UploadRequest::new(name, 0), FileContent::from(text_of_len(len)))
    }

    async fn requests_to(server: &MockServer, request_path: &str) -> usize {
        server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == request_path)
            .count()
    }

    #[tokio::test]
    async fn test_upload_all_pairs_each_request_with_its_result() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        // Earlier submissions finish later
        let mut echo = EchoUpload::new();
        for i in 0..6 {
            echo = echo.with_delay(&format!("file-{i}.txt"), Duration::from_millis(300 - i * 50));
        }
        mount_echo(&server, echo).await;

        let orchestrator = orchestrator(&test_config(&server));
        let items: Vec<_> = (0..6).map(|i| item(&format!("file-{i}.txt"), 10 + i * 7)).collect();

        let outcomes = orchestrator.upload_all(items, Some("MyTenantId")).await;

        assert_eq!(outcomes.len(), 6);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
            assert_eq!(outcome.request.name, format!("file-{i}.txt"));
            let info = outcome.result.as_ref().unwrap();
            assert_eq!(info.name, outcome.request.name);
            assert_eq!(info.size, 10 + i as u64 * 7);
        }
        assert_eq!(requests_to(&server, TOKEN_PATH).await, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_race_yields_in_completion_order() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        mount_echo(
            &server,
            EchoUpload::new().with_delay("testFile1.yml", Duration::from_millis(300)),
        )
        .await;

        let orchestrator = orchestrator(&test_config(&server));
        let items = vec![item("testFile1.yml", 100), item("testFile2.txt", 142)];

        let mut batch = orchestrator.first_completed(items, None).await;
        assert_eq!(batch.len(), 2);

        let first = batch.next().await.unwrap();
        assert_eq!(first.request.name, "testFile2.txt");
        assert_eq!(first.result.as_ref().unwrap().size, 142);
        assert_eq!(batch.remaining(), 1);

        let rest = batch.drain().await;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].request.name, "testFile1.yml");
        assert_eq!(rest[0].result.as_ref().unwrap().size, 100);
    }

    #[tokio::test]
    async fn test_failure_does_not_affect_siblings() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        mount_echo(&server, EchoUpload::new().with_failure("bad.txt", 400)).await;

        let orchestrator = orchestrator(&test_config(&server));
        let items = vec![item("a.txt", 1), item("bad.txt", 2), item("c.txt", 3)];

        let outcomes = orchestrator.upload_many(items, None, CompletionPolicy::Race).await;

        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            if outcome.request.name == "bad.txt" {
                assert!(matches!(outcome.result, Err(Error::Validation { status: 400, .. })));
            } else {
                assert!(outcome.is_success());
            }
        }
    }

    #[tokio::test]
    async fn test_abort_on_failure_cancels_the_rest() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        mount_echo(
            &server,
            EchoUpload::new()
                .with_failure("bad.txt", 422)
                .with_delay("slow-1.txt", Duration::from_secs(5))
                .with_delay("slow-2.txt", Duration::from_secs(5)),
        )
        .await;

        let mut config = test_config(&server);
        config.transfer.abort_on_failure = true;
        let orchestrator = orchestrator(&config);
        let items = vec![item("slow-1.txt", 1), item("bad.txt", 1), item("slow-2.txt", 1)];

        let started = Instant::now();
        let outcomes = orchestrator.upload_all(items, None).await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(outcomes[1].result, Err(Error::Validation { status: 422, .. })));
        assert!(matches!(outcomes[0].result, Err(Error::Canceled)));
        assert!(matches!(outcomes[2].result, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_cancel_all_cancels_every_unit() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        mount_echo(
            &server,
            EchoUpload::new()
                .with_delay("a.txt", Duration::from_secs(5))
                .with_delay("b.txt", Duration::from_secs(5)),
        )
        .await;

        let mut config = test_config(&server);
        config.transfer.max_concurrency = Some(1);
        let orchestrator = orchestrator(&config);

        let batch = orchestrator
            .first_completed(vec![item("a.txt", 1), item("b.txt", 1)], None)
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.in_flight(), 2);

        orchestrator.cancel_all();
        let outcomes = batch.drain().await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| matches!(o.result, Err(Error::Canceled))));
        assert_eq!(orchestrator.in_flight(), 0);

        // Later batches run normally
        let outcomes = orchestrator.upload_all(vec![item("c.txt", 4)], None).await;
        assert_eq!(outcomes[0].result.as_ref().unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_max_concurrency_limits_parallel_uploads() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        let delay = Duration::from_millis(150);
        mount_echo(
            &server,
            EchoUpload::new()
                .with_delay("a.txt", delay)
                .with_delay("b.txt", delay)
                .with_delay("c.txt", delay),
        )
        .await;

        let mut config = test_config(&server);
        config.transfer.max_concurrency = Some(1);
        let orchestrator = orchestrator(&config);

        let started = Instant::now();
        let outcomes = orchestrator
            .upload_all(vec![item("a.txt", 1), item("b.txt", 1), item("c.txt", 1)], None)
            .await;

        assert!(outcomes.iter().all(TransferOutcome::is_success));
        assert!(started.elapsed() >= delay * 3);
    }

    #[tokio::test]
    async fn test_dropped_batch_keeps_running() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;
        mount_echo(
            &server,
            EchoUpload::new()
                .with_delay("a.txt", Duration::from_millis(200))
                .with_delay("b.txt", Duration::from_millis(200)),
        )
        .await;

        let orchestrator = orchestrator(&test_config(&server));
        let batch = orchestrator
            .first_completed(vec![item("a.txt", 1), item("b.txt", 1)], None)
            .await;
        drop(batch);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.in_flight(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(orchestrator.in_flight(), 0);
        assert_eq!(requests_to(&server, UPLOAD_PATH).await, 2);
    }

    #[tokio::test]
    async fn test_empty_batch_makes_no_requests() {
        let server = MockServer::start().await;
        mount_token_endpoint(&server).await;

        let orchestrator = orchestrator(&test_config(&server));
        let mut batch = orchestrator.first_completed(Vec::new(), None).await;

        assert!(batch.is_empty());
        assert!(batch.next().await.is_none());
        assert!(orchestrator.upload_all(Vec::new(), None).await.is_empty());
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
