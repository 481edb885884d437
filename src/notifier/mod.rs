//! The dispatch coordinator: fingerprints messages, coalesces duplicates
//! into in-place edits, applies admission control, and retries rate-limited
//! calls.

mod cache;
mod lock;
mod throttle;

use crate::config::NotifierConfig;
use crate::error::DeliveryError;
use crate::message::MessageBuilder;
use crate::transport::{HttpTransport, Transport};
use cache::{CacheEntry, MessageCache};
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use lock::DispatchLock;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use throttle::{DeferredTask, Throttle};
use tokio::sync::oneshot;

type DeliveryResult = Result<(), DeliveryError>;

/// Handle shared by every caller waiting on one logical delivery.
type PendingHandle = Shared<BoxFuture<'static, DeliveryResult>>;

/// Deterministic identity of a message's content: lowercase hex SHA-256.
fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Key into the pending-delivery map. At most one in-flight delivery exists
/// per key; later requests for the same key join its handle instead of
/// starting a second operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingKey {
    Send(String),
    Update(String),
}

impl PendingKey {
    fn fingerprint(&self) -> &str {
        match self {
            Self::Send(fp) | Self::Update(fp) => fp,
        }
    }
}

impl fmt::Display for PendingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(fp) => write!(f, "pending-send:{fp}"),
            Self::Update(fp) => write!(f, "pending-update:{fp}"),
        }
    }
}

/// One admitted outbound call, fully rendered.
#[derive(Debug, Clone)]
enum DispatchOp {
    Create { text: String },
    Edit { message_id: i64, text: String },
}

/// What the decision pass produced for the caller.
enum Dispatched {
    /// The operation ran to a terminal state inside the critical section.
    Completed(DeliveryResult),
    /// The caller must wait on a shared handle: it joined an existing
    /// pending delivery, or its own was parked for a later drain tick.
    Waiting(PendingHandle),
}

/// Rate-limited, deduplicating delivery client for one chat.
///
/// Cheap to clone; clones share the cache, throttle, and dispatch lock.
/// Dropping the last clone stops the drain loop and abandons parked work.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<Inner>,
}

impl Notifier {
    /// Build a notifier over an explicit transport.
    ///
    /// Spawns the drain loop, so this must run inside a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport>,
        chat_id: impl Into<String>,
        config: &NotifierConfig,
    ) -> Self {
        let throttle = Arc::new(Throttle::new(
            config.throttle.limit,
            config.throttle.max_size,
            config.throttle.interval(),
        ));

        let inner = Arc::new(Inner {
            transport,
            chat_id: chat_id.into(),
            cache_ttl: config.cache.ttl(),
            max_attempts: config.retry.max_attempts.max(1),
            retry_base_delay: config.retry.base_delay(),
            debug: config.debug,
            cache: Mutex::new(MessageCache::new(config.cache.max_size)),
            pending: Mutex::new(HashMap::new()),
            throttle,
            lock: DispatchLock::new(),
            drain_handle: Mutex::new(None),
        });

        let handle = Arc::clone(&inner.throttle).spawn_drain();
        *inner.drain_handle.lock() = Some(handle);

        Self { inner }
    }

    /// Build a notifier talking to the Telegram Bot API over HTTPS.
    pub fn telegram(
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
        config: &NotifierConfig,
    ) -> Self {
        let transport = Arc::new(HttpTransport::new(bot_token, config.request_timeout()));
        Self::new(transport, chat_id, config)
    }

    /// Deliver `text` to the chat.
    ///
    /// Content identical to a still-cached earlier delivery is coalesced
    /// into an edit of that message, annotated with the duplicate count.
    /// Resolves once the message is ultimately delivered, surviving
    /// throttling deferrals and rate-limit retries along the way.
    pub async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        let fp = fingerprint(text);
        let key = PendingKey::Send(fp.clone());
        let inner = Arc::clone(&self.inner);
        inner.trace(&format!("{key}: dispatch requested"));

        let outcome = self
            .inner
            .lock
            .run(inner.decide_send(fp, key, text.to_string()))
            .await;

        Self::settle(outcome).await
    }

    /// Edit an existing message in place, annotating with the current
    /// duplicate count when the content is cached. Follows the same
    /// pending/throttle/retry discipline as [`send`](Notifier::send).
    pub async fn update(&self, message_id: i64, text: &str) -> Result<(), DeliveryError> {
        let fp = fingerprint(text);
        let key = PendingKey::Update(fp.clone());
        let inner = Arc::clone(&self.inner);
        inner.trace(&format!("{key}: dispatch requested"));

        let outcome = self
            .inner
            .lock
            .run(inner.decide_update(fp, key, message_id, text.to_string()))
            .await;

        Self::settle(outcome).await
    }

    /// Await the outcome outside the critical section, so a deferred task
    /// that needs the lock can never deadlock against its own waiter.
    async fn settle(outcome: Dispatched) -> DeliveryResult {
        match outcome {
            Dispatched::Completed(result) => result,
            Dispatched::Waiting(handle) => handle.await,
        }
    }
}

struct Inner {
    transport: Arc<dyn Transport>,
    chat_id: String,
    cache_ttl: Duration,
    max_attempts: u32,
    retry_base_delay: Duration,
    debug: bool,
    cache: Mutex<MessageCache>,
    pending: Mutex<HashMap<PendingKey, PendingHandle>>,
    throttle: Arc<Throttle>,
    lock: DispatchLock,
    drain_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Inner {
    /// Decision pass for a send. Runs under the dispatch lock.
    async fn decide_send(self: Arc<Self>, fp: String, key: PendingKey, text: String) -> Dispatched {
        if let Some(handle) = self.pending.lock().get(&key).cloned() {
            self.trace(&format!("{key}: joining in-flight delivery"));
            return Dispatched::Waiting(handle);
        }

        // A live cache entry converts this send into an edit of the message
        // created for the first occurrence. The duplicate count ticks at
        // arrival time, even if the edit itself ends up deferred.
        let duplicate = {
            let mut cache = self.cache.lock();
            if cache.is_expired(&fp, Instant::now()) {
                None
            } else {
                cache.increment(&fp)
            }
        };

        let op = match duplicate {
            Some(entry) => {
                self.trace(&format!(
                    "{key}: duplicate #{} of message {}, editing in place",
                    entry.duplicates, entry.message_id
                ));
                DispatchOp::Edit {
                    message_id: entry.message_id,
                    text: render_with_count(&text, entry.duplicates),
                }
            }
            None => DispatchOp::Create { text },
        };

        self.admit_or_defer(key, op).await
    }

    /// Decision pass for an explicit update. Runs under the dispatch lock.
    async fn decide_update(
        self: Arc<Self>,
        fp: String,
        key: PendingKey,
        message_id: i64,
        text: String,
    ) -> Dispatched {
        if let Some(handle) = self.pending.lock().get(&key).cloned() {
            self.trace(&format!("{key}: joining in-flight delivery"));
            return Dispatched::Waiting(handle);
        }

        let rendered = {
            let cache = self.cache.lock();
            match cache.get(&fp) {
                Some(entry) if !cache.is_expired(&fp, Instant::now()) => {
                    render_with_count(&text, entry.duplicates)
                }
                _ => text,
            }
        };

        self.admit_or_defer(
            key,
            DispatchOp::Edit {
                message_id,
                text: rendered,
            },
        )
        .await
    }

    /// One throttle slot per outbound call: consume it here for the inline
    /// path, or let the drain tick consume it when the task is parked.
    async fn admit_or_defer(self: Arc<Self>, key: PendingKey, op: DispatchOp) -> Dispatched {
        if !self.throttle.can() {
            let (tx, handle) = self.register_pending(&key);
            self.trace(&format!("{key}: throttle denied admission, deferring"));
            self.enqueue_deferred(key, op, 0, tx);
            return Dispatched::Waiting(handle);
        }

        self.throttle.admit();
        let (tx, handle) = self.register_pending(&key);
        match Arc::clone(&self).drive(&key, op, 0, tx).await {
            Some(result) => Dispatched::Completed(result),
            None => Dispatched::Waiting(handle),
        }
    }

    /// Drive one admitted attempt to a terminal state, or park a retry when
    /// the endpoint rate-limits us. Returns `None` when a retry was
    /// scheduled and the pending handle stays live.
    async fn drive(
        self: Arc<Self>,
        key: &PendingKey,
        op: DispatchOp,
        attempt: u32,
        tx: oneshot::Sender<DeliveryResult>,
    ) -> Option<DeliveryResult> {
        match self.attempt(key, &op).await {
            Ok(()) => Some(self.finish(key, tx, Ok(()))),
            Err(err) if err.is_rate_limited() => {
                let next = attempt + 1;
                if next >= self.max_attempts {
                    self.trace(&format!("{key}: rate limited, retry budget exhausted"));
                    Some(self.finish(
                        key,
                        tx,
                        Err(DeliveryError::RetriesExhausted { attempts: next }),
                    ))
                } else {
                    self.trace(&format!("{key}: rate limited, scheduling retry {next}"));
                    self.schedule_retry(key.clone(), op, next, tx);
                    None
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "notigram",
                    chat_id = %self.chat_id,
                    error = %err,
                    "delivery failed"
                );
                Some(self.finish(key, tx, Err(err.into())))
            }
        }
    }

    /// One outbound transport call. The caller has already consumed a
    /// throttle slot and holds the dispatch lock.
    async fn attempt(
        &self,
        key: &PendingKey,
        op: &DispatchOp,
    ) -> Result<(), crate::error::TransportError> {
        match op {
            DispatchOp::Create { text } => {
                let fp = key.fingerprint();
                {
                    let mut cache = self.cache.lock();
                    if cache.contains(fp) && cache.is_expired(fp, Instant::now()) {
                        self.trace(&format!("{key}: purging expired cache entry"));
                        cache.remove(fp);
                    }
                }

                let message_id = self.transport.create_message(&self.chat_id, text).await?;
                self.cache.lock().insert(
                    fp,
                    CacheEntry {
                        message_id,
                        duplicates: 1,
                        expire_at: Instant::now() + self.cache_ttl,
                    },
                );
                self.trace(&format!("{key}: created message {message_id}"));
                Ok(())
            }
            DispatchOp::Edit { message_id, text } => {
                self.transport
                    .edit_message(&self.chat_id, *message_id, text)
                    .await?;
                self.trace(&format!("{key}: edited message {message_id}"));
                Ok(())
            }
        }
    }

    /// Register a fresh pending delivery and hand back the completion side
    /// plus the shareable waiter handle.
    fn register_pending(
        &self,
        key: &PendingKey,
    ) -> (oneshot::Sender<DeliveryResult>, PendingHandle) {
        let (tx, rx) = oneshot::channel();
        let handle: PendingHandle = async move { rx.await.unwrap_or(Err(DeliveryError::Dropped)) }
            .boxed()
            .shared();
        self.pending.lock().insert(key.clone(), handle.clone());
        (tx, handle)
    }

    /// Terminal outcome: clear the pending marker, wake every waiter.
    fn finish(
        &self,
        key: &PendingKey,
        tx: oneshot::Sender<DeliveryResult>,
        result: DeliveryResult,
    ) -> DeliveryResult {
        self.pending.lock().remove(key);
        let _ = tx.send(result.clone());
        result
    }

    /// Park the operation on the throttle queue; the drain tick will admit
    /// and run it.
    fn enqueue_deferred(
        self: Arc<Self>,
        key: PendingKey,
        op: DispatchOp,
        attempt: u32,
        tx: oneshot::Sender<DeliveryResult>,
    ) {
        let throttle = Arc::clone(&self.throttle);
        let task: DeferredTask = Box::new(move || {
            async move {
                self.run_deferred(key, op, attempt, tx).await;
            }
            .boxed()
        });
        throttle.enqueue(task);
    }

    /// Entry point for drained tasks. The drain tick already consumed a
    /// throttle slot; re-acquire only the dispatch lock.
    async fn run_deferred(
        self: Arc<Self>,
        key: PendingKey,
        op: DispatchOp,
        attempt: u32,
        tx: oneshot::Sender<DeliveryResult>,
    ) {
        self.trace(&format!("{key}: draining deferred delivery (attempt {attempt})"));
        let this = Arc::clone(&self);
        self.lock
            .run(async move {
                this.drive(&key, op, attempt, tx).await;
            })
            .await;
    }

    /// Bounded exponential backoff, then back onto the throttle queue for a
    /// later drain tick. Invisible to the caller except as latency.
    fn schedule_retry(
        self: Arc<Self>,
        key: PendingKey,
        op: DispatchOp,
        attempt: u32,
        tx: oneshot::Sender<DeliveryResult>,
    ) {
        let delay = self.retry_base_delay * 2u32.saturating_pow((attempt - 1).min(16));
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.enqueue_deferred(key, op, attempt, tx);
        });
    }

    /// The optional diagnostic sink: a tracing pass-through, active only
    /// when `debug` is configured.
    fn trace(&self, message: &str) {
        if self.debug {
            tracing::debug!(target: "notigram", chat_id = %self.chat_id, "{message}");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.drain_handle.lock().take() {
            handle.abort();
        }
    }
}

/// Render the duplicate-count annotation: original text, blank line, count.
fn render_with_count(text: &str, count: u32) -> String {
    MessageBuilder::from_text(text)
        .newline(2)
        .raw(&format!("❗️Count: {count}"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, ThrottleConfig};
    use crate::error::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    struct MockTransport {
        creates: Mutex<Vec<String>>,
        edits: Mutex<Vec<(i64, String)>>,
        create_attempts: AtomicU32,
        /// Leading create attempts to reject with 429.
        rate_limit_creates: AtomicU32,
        /// Non-zero: reject every create with this api code.
        fail_code: AtomicI64,
        next_id: AtomicI64,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                creates: Mutex::new(Vec::new()),
                edits: Mutex::new(Vec::new()),
                create_attempts: AtomicU32::new(0),
                rate_limit_creates: AtomicU32::new(0),
                fail_code: AtomicI64::new(0),
                next_id: AtomicI64::new(100),
            })
        }

        fn create_count(&self) -> usize {
            self.creates.lock().len()
        }

        fn edit_count(&self) -> usize {
            self.edits.lock().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn create_message(
            &self,
            _chat_id: &str,
            text: &str,
        ) -> Result<i64, TransportError> {
            self.create_attempts.fetch_add(1, Ordering::SeqCst);

            let fail_code = self.fail_code.load(Ordering::SeqCst);
            if fail_code != 0 {
                return Err(TransportError::Api {
                    code: fail_code,
                    description: "mock failure".into(),
                });
            }

            if self.rate_limit_creates.load(Ordering::SeqCst) > 0 {
                self.rate_limit_creates.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Api {
                    code: 429,
                    description: "Too Many Requests".into(),
                });
            }

            self.creates.lock().push(text.to_string());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn edit_message(
            &self,
            _chat_id: &str,
            message_id: i64,
            text: &str,
        ) -> Result<(), TransportError> {
            self.edits.lock().push((message_id, text.to_string()));
            Ok(())
        }
    }

    fn config(limit: u32, interval_ms: u64) -> NotifierConfig {
        NotifierConfig {
            throttle: ThrottleConfig {
                limit,
                max_size: 16,
                interval_ms,
            },
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 10,
            },
            ..NotifierConfig::default()
        }
    }

    #[test]
    fn fingerprint_is_deterministic_sha256_hex() {
        let a = fingerprint("hello");
        assert_eq!(a.len(), 64);
        assert_eq!(a, fingerprint("hello"));
        assert_ne!(a, fingerprint("hello "));
    }

    #[test]
    fn pending_keys_render_with_their_prefix() {
        let fp = fingerprint("x");
        assert_eq!(
            PendingKey::Send(fp.clone()).to_string(),
            format!("pending-send:{fp}")
        );
        assert_eq!(
            PendingKey::Update(fp.clone()).to_string(),
            format!("pending-update:{fp}")
        );
    }

    #[test]
    fn render_with_count_appends_annotation_block() {
        let rendered = render_with_count("<b>alert</b>", 4);
        assert_eq!(rendered, "<b>alert</b>\n\n❗️Count: 4");
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_send_edits_instead_of_resending() {
        let transport = MockTransport::new();
        let notifier = Notifier::new(transport.clone(), "chat", &config(10, 1_000));

        notifier.send("hello").await.unwrap();
        notifier.send("hello").await.unwrap();

        assert_eq!(transport.create_count(), 1);
        assert_eq!(transport.edit_count(), 1);

        let (message_id, text) = transport.edits.lock()[0].clone();
        assert_eq!(message_id, 100);
        assert!(text.contains("Count: 2"), "edit body was: {text}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_identical_sends_create_at_most_once() {
        let transport = MockTransport::new();
        let notifier = Notifier::new(transport.clone(), "chat", &config(10, 1_000));

        let second = notifier.clone();
        let (r1, r2) = tokio::join!(notifier.send("dup"), second.send("dup"));
        r1.unwrap();
        r2.unwrap();

        assert_eq!(transport.create_count(), 1);
        assert_eq!(transport.edit_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_content_is_never_coalesced() {
        let transport = MockTransport::new();
        let notifier = Notifier::new(transport.clone(), "chat", &config(10, 1_000));

        notifier.send("one").await.unwrap();
        notifier.send("two").await.unwrap();

        assert_eq!(transport.create_count(), 2);
        assert_eq!(transport.edit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_send_runs_on_the_next_drain_tick() {
        let transport = MockTransport::new();
        let notifier = Notifier::new(transport.clone(), "chat", &config(1, 1_000));
        let start = tokio::time::Instant::now();

        notifier.send("m1").await.unwrap();
        assert_eq!(transport.create_count(), 1);

        let second = notifier.clone();
        let deferred = tokio::spawn(async move { second.send("m2").await });

        // Mid-interval the second send must still be parked.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.create_count(), 1);

        deferred.await.unwrap().unwrap();
        assert_eq!(transport.create_count(), 2);
        assert!(start.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_send_is_requeued_and_eventually_delivered() {
        let transport = MockTransport::new();
        transport.rate_limit_creates.store(1, Ordering::SeqCst);
        let notifier = Notifier::new(transport.clone(), "chat", &config(5, 200));

        notifier.send("flaky").await.unwrap();

        assert_eq!(transport.create_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(transport.create_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_capped() {
        let transport = MockTransport::new();
        transport.rate_limit_creates.store(u32::MAX, Ordering::SeqCst);
        let notifier = Notifier::new(transport.clone(), "chat", &config(5, 100));

        let err = notifier.send("always-limited").await.unwrap_err();
        match err {
            DeliveryError::RetriesExhausted { attempts } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(transport.create_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_surfaces_and_clears_pending_state() {
        let transport = MockTransport::new();
        transport.fail_code.store(400, Ordering::SeqCst);
        let notifier = Notifier::new(transport.clone(), "chat", &config(10, 1_000));

        let err = notifier.send("broken").await.unwrap_err();
        match err {
            DeliveryError::Transport { code, .. } => assert_eq!(code, Some(400)),
            other => panic!("unexpected error: {other:?}"),
        }

        // The failure must not leave a pending marker or a cache entry
        // behind; the next identical send is a fresh create.
        transport.fail_code.store(0, Ordering::SeqCst);
        notifier.send("broken").await.unwrap();
        assert_eq!(transport.create_count(), 1);
        assert_eq!(transport.edit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn update_annotates_with_count_only_when_cached() {
        let transport = MockTransport::new();
        let notifier = Notifier::new(transport.clone(), "chat", &config(10, 1_000));

        notifier.send("known").await.unwrap();
        notifier.update(100, "known").await.unwrap();
        notifier.update(55, "never seen").await.unwrap();

        let edits = transport.edits.lock().clone();
        assert_eq!(edits.len(), 2);
        assert!(edits[0].1.contains("Count: 1"), "edit body was: {}", edits[0].1);
        assert_eq!(edits[1].1, "never seen");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_purged_and_recreated() {
        let transport = MockTransport::new();
        let mut cfg = config(10, 1_000);
        cfg.cache.ttl_ms = 100;
        let notifier = Notifier::new(transport.clone(), "chat", &cfg);

        notifier.send("short-lived").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        notifier.send("short-lived").await.unwrap();

        // Past the TTL the second send creates a new message instead of
        // editing the stale one.
        assert_eq!(transport.create_count(), 2);
        assert_eq!(transport.edit_count(), 0);
    }
}
