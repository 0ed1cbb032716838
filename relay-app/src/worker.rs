//! AI workers: dequeue a request, call the backend, publish exactly one response.
//!
//! Per-request states: queued -> processing -> succeeded | retrying -> processing | failed.

use crate::backend::{BackendError, CompletionBackend};
use crate::config::WorkerConfig;
use crate::queue::RequestQueue;
use crate::request::{FailureKind, Request, Response};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
    pub request_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &WorkerConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff_base: Duration::from_millis(cfg.backoff_base_ms),
            backoff_max: Duration::from_millis(cfg.backoff_max_ms),
            attempt_timeout: Duration::from_secs(cfg.attempt_timeout_secs),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
        }
    }

    /// Upper bound of the pause after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exp)
            .min(self.backoff_max)
    }

    /// Jittered pause, uniform in `[ceiling / 2, ceiling]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
        Duration::from_millis(millis)
    }
}

pub struct AiWorker {
    id: usize,
    queue: Arc<RequestQueue>,
    backend: Arc<dyn CompletionBackend>,
    replies: mpsc::Sender<Response>,
    policy: RetryPolicy,
}

impl AiWorker {
    pub fn new(
        id: usize,
        queue: Arc<RequestQueue>,
        backend: Arc<dyn CompletionBackend>,
        replies: mpsc::Sender<Response>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            id,
            queue,
            backend,
            replies,
            policy,
        }
    }

    /// Runs until the queue is shut down and drained, or `abort` fires.
    #[tracing::instrument(level = "info", skip_all, fields(worker = self.id))]
    pub async fn run(self, abort: CancellationToken) {
        tracing::info!("worker started");
        loop {
            let request = tokio::select! {
                biased;
                _ = abort.cancelled() => break,
                next = self.queue.dequeue() => match next {
                    Some(request) => request,
                    None => break,
                },
            };

            tracing::debug!(
                request_id = %request.id,
                origin = %request.origin,
                state = "processing",
                waited_ms = (chrono::Utc::now() - request.enqueued_at).num_milliseconds(),
                "request dequeued"
            );

            let attempts = AtomicU32::new(0);
            let outcome = tokio::select! {
                biased;
                _ = abort.cancelled() => None,
                result = self.process(&request, &attempts) => Some(result),
            };

            let Some(result) = outcome else {
                tracing::warn!(
                    request_id = %request.id,
                    attempts = attempts.load(Ordering::SeqCst),
                    state = "failed",
                    "request abandoned by shutdown"
                );
                self.publish_cancelled(&request, attempts.load(Ordering::SeqCst)).await;
                break;
            };

            let response = Response::for_request(&request, result, attempts.load(Ordering::SeqCst));
            tokio::select! {
                biased;
                sent = self.replies.send(response.clone()) => {
                    if sent.is_err() {
                        tracing::warn!(request_id = %request.id, "reply channel closed; response dropped");
                    }
                }
                _ = abort.cancelled() => {
                    if self.replies.try_send(response).is_err() {
                        tracing::warn!(request_id = %request.id, "reply channel unavailable during abort; response dropped");
                    }
                    break;
                }
            }
        }

        if abort.is_cancelled() {
            self.cancel_backlog().await;
        }
        tracing::info!("worker stopped");
    }

    async fn process(&self, request: &Request, attempts: &AtomicU32) -> Result<String, FailureKind> {
        match tokio::time::timeout(self.policy.request_timeout, self.attempt_loop(request, attempts))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    request_id = %request.id,
                    attempts = attempts.load(Ordering::SeqCst),
                    timeout_secs = self.policy.request_timeout.as_secs_f64(),
                    state = "failed",
                    "request timed out"
                );
                Err(FailureKind::TimedOut)
            }
        }
    }

    async fn attempt_loop(&self, request: &Request, attempts: &AtomicU32) -> Result<String, FailureKind> {
        let attempt_timeout = self.policy.attempt_timeout;
        loop {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let result = match tokio::time::timeout(
                attempt_timeout,
                self.backend.complete(&request.payload, attempt_timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::Retryable(format!(
                    "attempt timed out after {}s",
                    attempt_timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(text) => {
                    tracing::info!(request_id = %request.id, attempt, state = "succeeded", "completion ready");
                    return Ok(text);
                }
                Err(BackendError::Terminal(detail)) => {
                    tracing::warn!(request_id = %request.id, attempt, error = %detail, state = "failed", "backend rejected request");
                    return Err(FailureKind::BackendTerminal);
                }
                Err(BackendError::Retryable(detail)) => {
                    if attempt >= self.policy.max_attempts {
                        tracing::warn!(request_id = %request.id, attempt, error = %detail, state = "failed", "retries exhausted");
                        return Err(FailureKind::RetriesExhausted);
                    }
                    let delay = self.policy.backoff_delay(attempt);
                    tracing::info!(
                        request_id = %request.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %detail,
                        state = "retrying",
                        "backend attempt failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Waits for room in the reply channel. The supervisor bounds this wait
    /// with the abort grace; once the reply loop is gone the send fails.
    async fn publish_cancelled(&self, request: &Request, attempts: u32) -> bool {
        let response = Response::for_request(request, Err(FailureKind::Cancelled), attempts);
        if self.replies.send(response).await.is_err() {
            tracing::warn!(request_id = %request.id, "reply channel closed; cancellation dropped");
            return false;
        }
        true
    }

    /// Answers every request still buffered in the queue with `Cancelled`.
    async fn cancel_backlog(&self) {
        let mut cancelled = 0usize;
        while let Some(request) = self.queue.try_dequeue() {
            if !self.publish_cancelled(&request, 0).await {
                break;
            }
            cancelled += 1;
        }
        if cancelled > 0 {
            tracing::warn!(cancelled, "queued requests cancelled by shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Step, request};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            attempt_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Runs one worker over `requests` and returns every published response.
    async fn run_one(backend: Arc<FakeBackend>, policy: RetryPolicy, requests: Vec<Request>) -> Vec<Response> {
        let queue = Arc::new(RequestQueue::unbounded());
        for request in requests {
            queue.enqueue(request).expect("enqueue");
        }
        queue.shutdown();
        let (tx, mut rx) = mpsc::channel(16);
        AiWorker::new(1, Arc::clone(&queue), backend, tx, policy)
            .run(CancellationToken::new())
            .await;
        let mut out = Vec::new();
        while let Some(response) = rx.recv().await {
            out.push(response);
        }
        out
    }

    #[test]
    fn backoff_grows_exponentially_up_to_the_cap() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(3_000),
            ..fast_policy(5)
        };
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff_ceiling(4), Duration::from_millis(3_000));
        assert_eq!(policy.backoff_ceiling(40), Duration::from_millis(3_000));
        for attempt in 1..6 {
            let delay = policy.backoff_delay(attempt);
            let ceiling = policy.backoff_ceiling(attempt);
            assert!(delay >= ceiling / 2 && delay <= ceiling, "{delay:?} outside jitter window");
        }
    }

    #[tokio::test]
    async fn successful_completion_is_published() {
        let backend = Arc::new(FakeBackend::new(Step::Reply("hi there".to_string())));
        let responses = run_one(Arc::clone(&backend), fast_policy(3), vec![request(1, "u1", "hello")]).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result.as_deref(), Ok("hi there"));
        assert_eq!(responses[0].attempts, 1);
        assert_eq!(responses[0].origin.chat_id.as_str(), "u1");
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn always_retryable_stops_after_max_attempts() {
        let backend = Arc::new(FakeBackend::new(Step::Retryable));
        let responses = run_one(Arc::clone(&backend), fast_policy(3), vec![request(1, "u1", "hello")]).await;

        assert_eq!(backend.calls(), 3);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result, Err(FailureKind::RetriesExhausted));
        assert_eq!(responses[0].attempts, 3);
    }

    #[tokio::test]
    async fn three_retryable_failures_then_success() {
        let backend = Arc::new(FakeBackend::scripted(
            [Step::Retryable, Step::Retryable, Step::Retryable],
            Step::Reply("finally".to_string()),
        ));
        let responses = run_one(Arc::clone(&backend), fast_policy(5), vec![request(1, "u1", "hello")]).await;

        assert_eq!(backend.calls(), 4);
        assert_eq!(responses[0].result.as_deref(), Ok("finally"));
        assert_eq!(responses[0].attempts, 4);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let backend = Arc::new(FakeBackend::new(Step::Terminal));
        let responses = run_one(Arc::clone(&backend), fast_policy(5), vec![request(1, "u1", "hello")]).await;

        assert_eq!(backend.calls(), 1);
        assert_eq!(responses[0].result, Err(FailureKind::BackendTerminal));
    }

    #[tokio::test]
    async fn slow_attempts_count_as_retryable() {
        let backend = Arc::new(FakeBackend::new(Step::Hang));
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy(2)
        };
        let responses = run_one(Arc::clone(&backend), policy, vec![request(1, "u1", "hello")]).await;

        assert_eq!(backend.calls(), 2);
        assert_eq!(responses[0].result, Err(FailureKind::RetriesExhausted));
    }

    #[tokio::test]
    async fn whole_request_deadline_yields_timed_out() {
        let backend = Arc::new(FakeBackend::new(Step::Hang));
        let policy = RetryPolicy {
            attempt_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_millis(30),
            ..fast_policy(3)
        };
        let responses = run_one(Arc::clone(&backend), policy, vec![request(1, "u1", "hello")]).await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].result, Err(FailureKind::TimedOut));
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_and_queued_requests() {
        let queue = Arc::new(RequestQueue::unbounded());
        for id in 1..=3 {
            queue.enqueue(request(id, "u1", "hello")).expect("enqueue");
        }
        let backend = Arc::new(FakeBackend::new(Step::Hang));
        let (tx, mut rx) = mpsc::channel(16);
        let abort = CancellationToken::new();
        let worker = tokio::spawn(
            AiWorker::new(1, Arc::clone(&queue), backend.clone(), tx, fast_policy(3)).run(abort.clone()),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.calls(), 1);
        queue.shutdown();
        abort.cancel();
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker stopped after abort")
            .expect("join");

        let mut ids = Vec::new();
        while let Some(response) = rx.recv().await {
            assert_eq!(response.result, Err(FailureKind::Cancelled));
            ids.push(response.request_id.as_u64());
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn abort_backlog_waits_for_reply_channel_room() {
        let queue = Arc::new(RequestQueue::unbounded());
        for id in 1..=40 {
            queue.enqueue(request(id, "u1", "hello")).expect("enqueue");
        }
        queue.shutdown();
        let backend = Arc::new(FakeBackend::new(Step::Hang));
        let (tx, mut rx) = mpsc::channel(4);
        let abort = CancellationToken::new();
        abort.cancel();
        let worker = tokio::spawn(
            AiWorker::new(1, Arc::clone(&queue), backend, tx, fast_policy(3)).run(abort),
        );

        let mut ids = Vec::new();
        while let Some(response) = rx.recv().await {
            assert_eq!(response.result, Err(FailureKind::Cancelled));
            ids.push(response.request_id.as_u64());
        }
        worker.await.expect("join");
        assert_eq!(ids, (1..=40).collect::<Vec<u64>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_request_gets_exactly_one_response() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 50;
        const WORKERS: usize = 3;

        let queue = Arc::new(RequestQueue::new(16));
        let backend = Arc::new(
            FakeBackend::scripted(
                (0..20).map(|i| if i % 3 == 0 { Step::Retryable } else { Step::Echo }),
                Step::Echo,
            )
            .with_delay(Duration::from_millis(1)),
        );
        let (tx, mut rx) = mpsc::channel(8);
        let abort = CancellationToken::new();

        let mut workers = Vec::new();
        for id in 0..WORKERS {
            let worker = AiWorker::new(id, Arc::clone(&queue), backend.clone(), tx.clone(), fast_policy(3));
            workers.push(tokio::spawn(worker.run(abort.clone())));
        }
        drop(tx);

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            producers.push(tokio::spawn(async move {
                for i in 0..PER_PRODUCER {
                    let mut req = request(p * 1_000 + i, &format!("chat-{p}"), "ping");
                    // Backpressure: retry until the bounded queue has room.
                    loop {
                        match queue.enqueue(req) {
                            Ok(()) => break,
                            Err(err) => {
                                req = err.into_request();
                                tokio::time::sleep(Duration::from_millis(1)).await;
                            }
                        }
                    }
                }
            }));
        }

        let collector = tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(response) = rx.recv().await {
                ids.push(response.request_id.as_u64());
            }
            ids
        });

        for producer in producers {
            producer.await.expect("producer");
        }
        queue.shutdown();
        for worker in workers {
            worker.await.expect("worker");
        }

        let mut ids = collector.await.expect("collector");
        ids.sort_unstable();
        let mut expected: Vec<u64> = (0..PRODUCERS)
            .flat_map(|p| (0..PER_PRODUCER).map(move |i| p * 1_000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(ids, expected);
    }
}
