//! A size-, count-, and delay-based batcher for background upload work.
//!
//! Submitted items accumulate in the *current* bundle. The bundle is sealed
//! and handed to the handler as soon as an item count or byte threshold is
//! reached, or once the oldest pending item has waited out the delay
//! threshold. Sealed bundles are delivered FIFO; up to
//! [`handler_limit`](BundlerOptions::handler_limit) of them may be in flight
//! concurrently. Submissions are O(1) and never block; when buffered bytes
//! would exceed the ceiling they fail fast with
//! [`TraceError::BufferFull`], or callers can use [`Bundler::add_wait`] to
//! wait for capacity instead.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::{TraceError, TraceResult};

/// Thresholds governing when bundles are sealed and how much data may be
/// buffered.
#[derive(Clone, Debug)]
pub struct BundlerOptions {
    /// Seal the current bundle once its oldest item is this old.
    pub delay_threshold: Duration,
    /// Seal the current bundle once it holds this many items; 0 disables the
    /// count trigger.
    pub bundle_count_threshold: usize,
    /// Seal the current bundle once it holds this many bytes; 0 disables the
    /// byte trigger. A limit of 1 seals on every submission.
    pub bundle_byte_limit: usize,
    /// Refuse submissions once this many bytes are buffered or in flight;
    /// 0 disables the ceiling.
    pub buffered_byte_limit: usize,
    /// How many sealed bundles may be handled concurrently.
    pub handler_limit: usize,
}

impl Default for BundlerOptions {
    fn default() -> Self {
        BundlerOptions {
            delay_threshold: Duration::from_secs(2),
            bundle_count_threshold: 100,
            bundle_byte_limit: 512 * 1024,
            buffered_byte_limit: 10 * 1024 * 1024,
            handler_limit: 1,
        }
    }
}

/// Consumes sealed bundles, typically by uploading them.
#[async_trait]
pub trait BundleHandler<T>: Send + Sync + 'static {
    /// Handle one sealed bundle. The returned result is delivered to every
    /// waiter registered on the bundle.
    async fn handle(&self, items: Vec<T>) -> TraceResult<()>;
}

struct Bundle<T> {
    seq: u64,
    items: Vec<T>,
    bytes: usize,
    waiters: Vec<oneshot::Sender<TraceResult<()>>>,
}

impl<T> Bundle<T> {
    fn new(seq: u64) -> Self {
        Bundle {
            seq,
            items: Vec::new(),
            bytes: 0,
            waiters: Vec::new(),
        }
    }
}

enum WorkerMessage<T> {
    Bundle(Bundle<T>),
    Flush(oneshot::Sender<()>),
}

struct State<T> {
    current: Bundle<T>,
    buffered_bytes: usize,
    next_seq: u64,
}

struct Shared<T> {
    options: BundlerOptions,
    state: Mutex<State<T>>,
    dispatch: mpsc::UnboundedSender<WorkerMessage<T>>,
    capacity: Notify,
    runtime: tokio::runtime::Handle,
}

impl<T> Shared<T> {
    // Hand the current bundle to the worker. Call with the state lock held.
    fn seal_locked(&self, state: &mut State<T>) {
        if state.current.items.is_empty() {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        let sealed = mem::replace(&mut state.current, Bundle::new(seq));
        let _ = self.dispatch.send(WorkerMessage::Bundle(sealed));
    }
}

/// An asynchronous batcher delivering FIFO bundles to a [`BundleHandler`].
///
/// Safe for concurrent submitters: a single mutex guards the structural
/// state and a channel signals the dispatch worker. Dropping the bundler
/// stops the worker after it has drained already-sealed bundles; call
/// [`flush`](Bundler::flush) first to also seal and deliver pending items.
pub struct Bundler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for Bundler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundler")
            .field("options", &self.shared.options)
            .finish()
    }
}

impl<T: Send + 'static> Bundler<T> {
    /// Create a bundler and spawn its dispatch worker on `runtime`.
    pub fn new(
        options: BundlerOptions,
        handler: Arc<dyn BundleHandler<T>>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let (dispatch, receiver) = mpsc::unbounded_channel();
        let handler_limit = options.handler_limit.max(1);
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(State {
                current: Bundle::new(0),
                buffered_bytes: 0,
                next_seq: 1,
            }),
            dispatch,
            capacity: Notify::new(),
            runtime: runtime.clone(),
        });
        runtime.spawn(run_worker(
            receiver,
            handler,
            Arc::downgrade(&shared),
            handler_limit,
        ));
        Bundler { shared }
    }

    /// Submit an item of the given pre-computed byte size.
    ///
    /// Fails fast with [`TraceError::BufferFull`] when the buffered byte
    /// ceiling would be exceeded.
    pub fn add(&self, item: T, size: usize) -> TraceResult<()> {
        self.try_add(item, size, None)
            .map_err(|_| TraceError::BufferFull)
    }

    /// Submit an item and receive a channel that resolves with the terminal
    /// result of the bundle the item ends up in.
    pub fn add_with_notify(
        &self,
        item: T,
        size: usize,
    ) -> TraceResult<oneshot::Receiver<TraceResult<()>>> {
        let (sender, receiver) = oneshot::channel();
        self.try_add(item, size, Some(sender))
            .map_err(|_| TraceError::BufferFull)?;
        Ok(receiver)
    }

    /// Submit an item, waiting for buffered bytes to drain below the ceiling
    /// if necessary.
    pub async fn add_wait(&self, mut item: T, size: usize) -> TraceResult<()> {
        loop {
            let notified = self.shared.capacity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.try_add(item, size, None) {
                Ok(()) => return Ok(()),
                Err((returned, _)) => {
                    item = returned;
                    notified.await;
                }
            }
        }
    }

    /// Seal the current bundle and wait until every sealed bundle has been
    /// handled.
    pub async fn flush(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            self.shared.seal_locked(&mut state);
        }
        let (sender, receiver) = oneshot::channel();
        if self
            .shared
            .dispatch
            .send(WorkerMessage::Flush(sender))
            .is_ok()
        {
            let _ = receiver.await;
        }
    }

    // Returns the item (and waiter) on overflow so `add_wait` can retry.
    #[allow(clippy::type_complexity)]
    fn try_add(
        &self,
        item: T,
        size: usize,
        waiter: Option<oneshot::Sender<TraceResult<()>>>,
    ) -> Result<(), (T, Option<oneshot::Sender<TraceResult<()>>>)> {
        let options = &self.shared.options;
        let mut state = self.shared.state.lock().unwrap();
        if options.buffered_byte_limit > 0
            && state.buffered_bytes + size > options.buffered_byte_limit
        {
            return Err((item, waiter));
        }
        // Seal first if this item would push the current bundle past the
        // byte limit.
        if options.bundle_byte_limit > 0
            && !state.current.items.is_empty()
            && state.current.bytes + size > options.bundle_byte_limit
        {
            self.shared.seal_locked(&mut state);
        }
        state.buffered_bytes += size;
        state.current.bytes += size;
        state.current.items.push(item);
        if let Some(waiter) = waiter {
            state.current.waiters.push(waiter);
        }
        let count_reached = options.bundle_count_threshold > 0
            && state.current.items.len() >= options.bundle_count_threshold;
        let bytes_reached =
            options.bundle_byte_limit > 0 && state.current.bytes >= options.bundle_byte_limit;
        if count_reached || bytes_reached {
            self.shared.seal_locked(&mut state);
        } else if state.current.items.len() == 1 {
            self.schedule_delay(state.current.seq);
        }
        Ok(())
    }

    // Seal the bundle with sequence number `seq` once the delay threshold
    // elapses, unless a size trigger already sealed it.
    fn schedule_delay(&self, seq: u64) {
        let shared = Arc::downgrade(&self.shared);
        let delay = self.shared.options.delay_threshold;
        self.shared.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                let mut state = shared.state.lock().unwrap();
                if state.current.seq == seq {
                    shared.seal_locked(&mut state);
                }
            }
        });
    }
}

async fn run_worker<T: Send + 'static>(
    mut receiver: mpsc::UnboundedReceiver<WorkerMessage<T>>,
    handler: Arc<dyn BundleHandler<T>>,
    shared: Weak<Shared<T>>,
    handler_limit: usize,
) {
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            message = receiver.recv() => match message {
                Some(WorkerMessage::Bundle(bundle)) => {
                    if in_flight.len() >= handler_limit {
                        in_flight.next().await;
                    }
                    in_flight.push(run_handler(handler.clone(), shared.clone(), bundle));
                }
                Some(WorkerMessage::Flush(done)) => {
                    while in_flight.next().await.is_some() {}
                    let _ = done.send(());
                }
                None => break,
            }
        }
    }
    while in_flight.next().await.is_some() {}
}

async fn run_handler<T: 'static>(handler: Arc<dyn BundleHandler<T>>, shared: Weak<Shared<T>>, bundle: Bundle<T>) {
    let Bundle {
        items,
        bytes,
        waiters,
        ..
    } = bundle;
    let result = handler.handle(items).await;
    if let Err(err) = &result {
        tracing::warn!(error = %err, "failed to handle bundle");
    }
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
    if let Some(shared) = shared.upgrade() {
        let mut state = shared.state.lock().unwrap();
        state.buffered_bytes = state.buffered_bytes.saturating_sub(bytes);
        drop(state);
        shared.capacity.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;

    #[derive(Debug)]
    struct RecordingHandler {
        bundles: Mutex<Vec<Vec<u32>>>,
        fail: bool,
        delay: Duration,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(RecordingHandler {
                bundles: Mutex::new(Vec::new()),
                fail: false,
                delay: Duration::ZERO,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            })
        }

        fn bundles(&self) -> Vec<Vec<u32>> {
            self.bundles.lock().unwrap().clone()
        }

        async fn wait_for_bundles(&self, count: usize) {
            for _ in 0..500 {
                if self.bundles().len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("never saw {count} bundles, got {:?}", self.bundles());
        }
    }

    #[async_trait]
    impl BundleHandler<u32> for RecordingHandler {
        async fn handle(&self, items: Vec<u32>) -> TraceResult<()> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.bundles.lock().unwrap().push(items);
            if self.fail {
                Err(TraceError::UploadFailed("boom".to_owned()))
            } else {
                Ok(())
            }
        }
    }

    fn bundler(options: BundlerOptions, handler: Arc<RecordingHandler>) -> Bundler<u32> {
        Bundler::new(options, handler, tokio::runtime::Handle::current())
    }

    #[tokio::test]
    async fn byte_limit_of_one_seals_every_submission() {
        let handler = RecordingHandler::new();
        let bundler = bundler(
            BundlerOptions {
                bundle_byte_limit: 1,
                ..Default::default()
            },
            handler.clone(),
        );
        for i in 0..5 {
            bundler.add(i, 10).unwrap();
        }
        bundler.flush().await;
        assert_eq!(
            handler.bundles(),
            vec![vec![0], vec![1], vec![2], vec![3], vec![4]]
        );
    }

    #[tokio::test]
    async fn count_threshold_seals_and_preserves_order() {
        let handler = RecordingHandler::new();
        let bundler = bundler(
            BundlerOptions {
                bundle_count_threshold: 3,
                delay_threshold: Duration::from_secs(60),
                ..Default::default()
            },
            handler.clone(),
        );
        for i in 0..6 {
            bundler.add(i, 1).unwrap();
        }
        bundler.flush().await;
        assert_eq!(handler.bundles(), vec![vec![0, 1, 2], vec![3, 4, 5]]);
    }

    #[tokio::test]
    async fn delay_threshold_seals_without_further_submissions() {
        let handler = RecordingHandler::new();
        let bundler = bundler(
            BundlerOptions {
                delay_threshold: Duration::from_millis(50),
                bundle_count_threshold: 1_000,
                bundle_byte_limit: 0,
                ..Default::default()
            },
            handler.clone(),
        );
        bundler.add(7, 1).unwrap();
        handler.wait_for_bundles(1).await;
        assert_eq!(handler.bundles(), vec![vec![7]]);
        drop(bundler);
    }

    #[tokio::test]
    async fn overflow_fails_fast_and_add_wait_blocks() {
        let handler = RecordingHandler::new();
        let bundler = Arc::new(bundler(
            BundlerOptions {
                buffered_byte_limit: 10,
                bundle_count_threshold: 0,
                bundle_byte_limit: 0,
                delay_threshold: Duration::from_secs(60),
                ..Default::default()
            },
            handler.clone(),
        ));
        bundler.add(1, 10).unwrap();
        assert_eq!(bundler.add(2, 10), Err(TraceError::BufferFull));

        let waiting = {
            let bundler = bundler.clone();
            tokio::spawn(async move { bundler.add_wait(2, 10).await })
        };
        // Draining the first bundle frees capacity for the waiter.
        bundler.flush().await;
        timeout(Duration::from_secs(5), waiting)
            .await
            .expect("add_wait never completed")
            .unwrap()
            .unwrap();
        bundler.flush().await;
        assert_eq!(handler.bundles(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn waiters_learn_the_terminal_result() {
        let mut failing = RecordingHandler::new();
        Arc::get_mut(&mut failing).unwrap().fail = true;
        let bundler = bundler(
            BundlerOptions {
                bundle_byte_limit: 1,
                ..Default::default()
            },
            failing,
        );
        let receiver = bundler.add_with_notify(1, 1).unwrap();
        assert_eq!(
            receiver.await.unwrap(),
            Err(TraceError::UploadFailed("boom".to_owned()))
        );
    }

    #[tokio::test]
    async fn handler_limit_bounds_concurrency() {
        let mut handler = RecordingHandler::new();
        Arc::get_mut(&mut handler).unwrap().delay = Duration::from_millis(50);
        let bundler = bundler(
            BundlerOptions {
                bundle_byte_limit: 1,
                handler_limit: 2,
                ..Default::default()
            },
            handler.clone(),
        );
        for i in 0..6 {
            bundler.add(i, 1).unwrap();
        }
        bundler.flush().await;
        assert_eq!(handler.bundles().len(), 6);
        assert!(handler.max_running.load(Ordering::SeqCst) <= 2);
    }
}
