//! Merging of independently paced streams into a single cancellable stream.
//!
//! A [`Merge`] yields items from all of its inputs in the order in which they become ready.
//! Unlike [`n0_future::MergeBounded`] it can be cancelled from another task even while it is
//! waiting for the next item, it can grow new inputs after it was started, and it can be
//! kept alive after all inputs finished.
//!
//! All remote control goes through a single [`watch`] slot holding the latest [`Control`]
//! request. Every change wakes the merge, which then re-reads the slot before racing its
//! inputs again. Adding an input stores the stream in a pending list and bumps the reload
//! counter in that slot, so a blocked merge picks it up on its very next poll.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use n0_future::{Stream, boxed::BoxStream};
use snafu::{Snafu, ensure};
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

/// Lifecycle state of a [`Merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MergeState {
    /// No inputs are left, waiting for new inputs or cancellation.
    Idle,
    /// Racing the pending items of all inputs.
    Racing,
    /// An input just completed and was removed.
    Draining,
    /// The output stream has terminated.
    Done,
}

/// How a single input of a [`Merge`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum InputOutcome {
    /// The input stream ran to completion.
    Finished,
    /// The input stream yielded an error, which terminated the merge.
    Failed,
    /// The merge terminated before the input ended.
    Abandoned,
}

/// The merge has terminated and cannot accept new inputs.
#[derive(Debug, Snafu)]
#[snafu(display("merge has terminated"))]
pub struct MergeClosed {
    backtrace: Option<snafu::Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
}

#[derive(Debug, Clone, Copy, Default)]
struct Control {
    cancelled: bool,
    endless: bool,
    done: bool,
    reloads: u64,
}

struct Input<T, E> {
    stream: BoxStream<Result<T, E>>,
    done_tx: oneshot::Sender<InputOutcome>,
}

impl<T, E> fmt::Debug for Input<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Input").finish_non_exhaustive()
    }
}

impl<T, E> Input<T, E> {
    fn new(stream: BoxStream<Result<T, E>>) -> (Self, InputCompletion) {
        let (done_tx, done_rx) = oneshot::channel();
        let completion = InputCompletion {
            rx: done_rx,
            outcome: None,
        };
        (Self { stream, done_tx }, completion)
    }

    fn complete(self, outcome: InputOutcome) {
        // The completion may have been dropped, nobody is interested then.
        self.done_tx.send(outcome).ok();
    }
}

#[derive(Debug)]
struct Shared<T, E> {
    control: watch::Sender<Control>,
    pending: Mutex<Vec<Input<T, E>>>,
}

/// Combines any number of streams into one, yielding items in the order they resolve.
///
/// Items of type `Result<T, E>` are passed through unchanged. The first error yielded by
/// any input terminates the merge: the error is returned, remaining inputs are not polled
/// again and their completions resolve to [`InputOutcome::Abandoned`].
///
/// Without [`MergeHandle::set_endless`] the merge ends once all inputs have ended. Use a
/// [`MergeHandle`] to control the merge from other tasks.
pub struct Merge<T, E> {
    shared: Arc<Shared<T, E>>,
    control: WatchStream<Control>,
    inputs: Vec<Input<T, E>>,
    next: usize,
    state: MergeState,
}

impl<T, E> fmt::Debug for Merge<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Merge")
            .field("inputs", &self.inputs.len())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<T, E> Default for Merge<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Merge<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a merge without inputs.
    pub fn new() -> Self {
        let (control, control_rx) = watch::channel(Control::default());
        Self {
            shared: Arc::new(Shared {
                control,
                pending: Mutex::new(Vec::new()),
            }),
            control: WatchStream::from_changes(control_rx),
            inputs: Vec::new(),
            next: 0,
            state: MergeState::Idle,
        }
    }

    /// Creates a merge from a set of streams.
    ///
    /// Returns the completions of the inputs in the order the streams were passed.
    pub fn from_streams(
        streams: impl IntoIterator<Item = BoxStream<Result<T, E>>>,
    ) -> (Self, Vec<InputCompletion>) {
        let mut merge = Self::new();
        let completions = streams
            .into_iter()
            .map(|stream| merge.add_input(stream))
            .collect();
        (merge, completions)
    }

    /// Adds an input before the merge is handed off.
    pub fn add_input(&mut self, stream: BoxStream<Result<T, E>>) -> InputCompletion {
        let (input, completion) = Input::new(stream);
        self.inputs.push(input);
        if self.state == MergeState::Idle {
            self.state = MergeState::Racing;
        }
        completion
    }

    /// Returns a handle to control this merge.
    pub fn handle(&self) -> MergeHandle<T, E> {
        MergeHandle {
            shared: self.shared.clone(),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> MergeState {
        self.state
    }

    fn absorb_pending(&mut self) {
        let mut pending = self.shared.pending.lock().expect("poisoned");
        if !pending.is_empty() {
            trace!(added = pending.len(), "merge: reload");
            self.inputs.append(&mut pending);
            self.state = MergeState::Racing;
        }
    }

    fn finish(&mut self) {
        if self.state == MergeState::Done {
            return;
        }
        self.state = MergeState::Done;
        self.shared.control.send_modify(|c| c.done = true);
        for input in self.inputs.drain(..) {
            input.complete(InputOutcome::Abandoned);
        }
        let pending = std::mem::take(&mut *self.shared.pending.lock().expect("poisoned"));
        for input in pending {
            input.complete(InputOutcome::Abandoned);
        }
    }
}

impl<T, E> Stream for Merge<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.state == MergeState::Done {
            return Poll::Ready(None);
        }

        // Drain control notifications until pending, so that any later change wakes us.
        // The latest request is then read from the slot itself.
        while let Poll::Ready(Some(_)) = Pin::new(&mut this.control).poll_next(cx) {}
        let control = *this.shared.control.borrow();
        if control.cancelled {
            trace!("merge: cancelled");
            this.finish();
            return Poll::Ready(None);
        }
        this.absorb_pending();

        let mut remaining = this.inputs.len();
        let mut idx = if remaining == 0 {
            0
        } else {
            this.next % remaining
        };
        while remaining > 0 {
            match this.inputs[idx].stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => {
                    this.next = idx + 1;
                    this.state = MergeState::Racing;
                    return Poll::Ready(Some(Ok(item)));
                }
                Poll::Ready(Some(Err(err))) => {
                    trace!("merge: input failed");
                    this.inputs.remove(idx).complete(InputOutcome::Failed);
                    this.finish();
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    trace!("merge: input finished");
                    this.inputs.remove(idx).complete(InputOutcome::Finished);
                    this.state = MergeState::Draining;
                    remaining -= 1;
                    if idx >= this.inputs.len() {
                        idx = 0;
                    }
                }
                Poll::Pending => {
                    remaining -= 1;
                    idx = (idx + 1) % this.inputs.len();
                }
            }
        }

        if !this.inputs.is_empty() {
            this.state = MergeState::Racing;
            return Poll::Pending;
        }
        if control.endless {
            this.state = MergeState::Idle;
            return Poll::Pending;
        }
        this.finish();
        Poll::Ready(None)
    }
}

impl<T, E> Drop for Merge<T, E> {
    fn drop(&mut self) {
        self.shared.control.send_modify(|c| c.done = true);
        // Drops the completion senders, which resolves them as abandoned.
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.clear();
        }
    }
}

/// Controls a [`Merge`] from another task.
///
/// Handles stay valid after the merge terminated, but can no longer add inputs.
pub struct MergeHandle<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for MergeHandle<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T, E> fmt::Debug for MergeHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = *self.shared.control.borrow();
        f.debug_struct("MergeHandle")
            .field("cancelled", &control.cancelled)
            .field("endless", &control.endless)
            .field("done", &control.done)
            .finish()
    }
}

impl<T, E> MergeHandle<T, E> {
    /// Terminates the merge.
    ///
    /// Takes effect on the next poll of the merge, even if it is currently waiting for an
    /// item. No further items are yielded, including items which are already ready.
    pub fn cancel(&self) {
        self.shared.control.send_modify(|c| c.cancelled = true);
    }

    /// Whether [`Self::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.shared.control.borrow().cancelled
    }

    /// Whether the merge has terminated or was dropped.
    pub fn is_done(&self) -> bool {
        self.shared.control.borrow().done || self.shared.control.is_closed()
    }

    /// Keeps the merge alive after all inputs ended, if set.
    pub fn set_endless(&self, endless: bool) {
        self.shared.control.send_modify(|c| c.endless = endless);
    }

    /// Adds an input to a running merge.
    ///
    /// The input joins the race on the next poll of the merge.
    pub fn add_input(&self, stream: BoxStream<Result<T, E>>) -> Result<InputCompletion, MergeClosed> {
        let (input, completion) = Input::new(stream);
        {
            let mut pending = self.shared.pending.lock().expect("poisoned");
            ensure!(!self.is_done(), MergeClosedSnafu);
            pending.push(input);
        }
        self.shared.control.send_modify(|c| c.reloads += 1);
        Ok(completion)
    }
}

/// Resolves once a specific input of a [`Merge`] has ended.
#[derive(Debug)]
pub struct InputCompletion {
    rx: oneshot::Receiver<InputOutcome>,
    outcome: Option<InputOutcome>,
}

impl InputCompletion {
    /// Returns the outcome if the input has already ended, without waiting.
    pub fn outcome(&mut self) -> Option<InputOutcome> {
        if self.outcome.is_none() {
            self.outcome = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(InputOutcome::Abandoned),
            };
        }
        self.outcome
    }
}

impl Future for InputCompletion {
    type Output = InputOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome {
            return Poll::Ready(outcome);
        }
        let outcome = match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(_)) => InputOutcome::Abandoned,
        };
        self.outcome = Some(outcome);
        Poll::Ready(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use n0_future::{StreamExt, stream};
    use proptest::prelude::*;
    use tokio::{
        sync::mpsc,
        time::{self, Instant},
    };
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;

    type TestMerge = Merge<u64, &'static str>;

    fn iter_input(items: Vec<u64>) -> BoxStream<Result<u64, &'static str>> {
        Box::pin(stream::iter(items.into_iter().map(Ok)))
    }

    fn channel_input() -> (
        mpsc::Sender<Result<u64, &'static str>>,
        BoxStream<Result<u64, &'static str>>,
    ) {
        let (tx, rx) = mpsc::channel(16);
        (tx, Box::pin(ReceiverStream::new(rx)))
    }

    /// Yields each item once the paused clock reaches `start + item` milliseconds.
    fn timed_input(start: Instant, times: Vec<u64>) -> BoxStream<Result<u64, &'static str>> {
        Box::pin(stream::unfold(times.into_iter(), move |mut times| async move {
            let t = times.next()?;
            time::sleep_until(start + Duration::from_millis(t)).await;
            Some((Ok(t), times))
        }))
    }

    #[tokio::test]
    async fn yields_all_items_then_ends() {
        let (merge, completions) =
            TestMerge::from_streams([iter_input(vec![1, 2]), iter_input(vec![3])]);
        let mut items: Vec<u64> = merge.map(|r| r.unwrap()).collect().await;
        items.sort();
        assert_eq!(items, vec![1, 2, 3]);
        for completion in completions {
            assert_eq!(completion.await, InputOutcome::Finished);
        }
    }

    #[tokio::test]
    async fn empty_merge_ends_immediately() {
        let mut merge = TestMerge::new();
        assert!(merge.next().await.is_none());
        assert_eq!(merge.state(), MergeState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn yields_in_resolution_order() {
        let start = Instant::now();
        let (merge, _) = TestMerge::from_streams([
            timed_input(start, vec![30, 40]),
            timed_input(start, vec![10, 50]),
            timed_input(start, vec![20]),
        ]);
        let items: Vec<u64> = merge.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![10, 20, 30, 40, 50]);
    }

    #[tokio::test]
    async fn cancel_skips_ready_items() {
        let mut merge = TestMerge::new();
        let completion = merge.add_input(iter_input(vec![1, 2, 3]));
        let handle = merge.handle();
        assert_eq!(merge.next().await.unwrap().unwrap(), 1);
        handle.cancel();
        assert!(merge.next().await.is_none());
        assert_eq!(merge.state(), MergeState::Done);
        assert_eq!(completion.await, InputOutcome::Abandoned);
        assert!(handle.is_done());
    }

    #[tokio::test]
    async fn cancel_wakes_suspended_merge() {
        let (_tx, input) = channel_input();
        let (mut merge, mut completions) = TestMerge::from_streams([input]);
        let handle = merge.handle();
        let task = tokio::spawn(async move { merge.next().await.is_none() });
        tokio::task::yield_now().await;
        handle.cancel();
        let ended = time::timeout(Duration::from_secs(1), task)
            .await
            .expect("merge did not wake up")
            .unwrap();
        assert!(ended);
        assert_eq!(completions.remove(0).await, InputOutcome::Abandoned);
    }

    #[tokio::test]
    async fn inputs_can_be_added_while_running() {
        let (tx, input) = channel_input();
        let (mut merge, _) = TestMerge::from_streams([input]);
        let handle = merge.handle();
        let task = tokio::spawn(async move {
            let mut items = vec![];
            while let Some(item) = merge.next().await {
                items.push(item.unwrap());
            }
            items
        });
        tx.send(Ok(1)).await.unwrap();
        tokio::task::yield_now().await;
        let completion = handle.add_input(iter_input(vec![10, 11])).unwrap();
        assert_eq!(completion.await, InputOutcome::Finished);
        drop(tx);
        let mut items = task.await.unwrap();
        items.sort();
        assert_eq!(items, vec![1, 10, 11]);
        assert!(handle.add_input(iter_input(vec![12])).is_err());
    }

    #[tokio::test]
    async fn endless_merge_survives_finished_inputs() {
        let (mut merge, _) = TestMerge::from_streams([iter_input(vec![1])]);
        let handle = merge.handle();
        handle.set_endless(true);
        assert_eq!(merge.next().await.unwrap().unwrap(), 1);
        let next = time::timeout(Duration::from_millis(50), merge.next()).await;
        assert!(next.is_err(), "endless merge must not end");
        assert_eq!(merge.state(), MergeState::Idle);

        handle.add_input(iter_input(vec![2])).unwrap();
        assert_eq!(merge.next().await.unwrap().unwrap(), 2);

        handle.set_endless(false);
        assert!(merge.next().await.is_none());
    }

    #[tokio::test]
    async fn first_error_terminates() {
        let failing: BoxStream<Result<u64, &'static str>> =
            Box::pin(stream::iter(vec![Err("boom")]));
        let (_tx, pending) = channel_input();
        let (mut merge, completions) = TestMerge::from_streams([failing, pending]);
        assert_eq!(merge.next().await.unwrap().unwrap_err(), "boom");
        assert!(merge.next().await.is_none());
        let outcomes: Vec<_> = n0_future::join_all(completions).await;
        assert_eq!(outcomes, vec![InputOutcome::Failed, InputOutcome::Abandoned]);
    }

    #[tokio::test]
    async fn completions_resolve_individually() {
        let (tx, live) = channel_input();
        let (mut merge, mut completions) = TestMerge::from_streams([iter_input(vec![1]), live]);
        let mut live_done = completions.pop().unwrap();
        let history_done = completions.pop().unwrap();
        assert_eq!(merge.next().await.unwrap().unwrap(), 1);
        // The next race notices the exhausted history input and keeps waiting on the other.
        let waiting = time::timeout(Duration::from_millis(10), merge.next()).await;
        assert!(waiting.is_err());
        assert_eq!(history_done.await, InputOutcome::Finished);
        assert_eq!(live_done.outcome(), None);
        tx.send(Ok(2)).await.unwrap();
        assert_eq!(merge.next().await.unwrap().unwrap(), 2);
        drop(tx);
        assert!(merge.next().await.is_none());
        assert_eq!(live_done.await, InputOutcome::Finished);
    }

    #[tokio::test]
    async fn dropping_merge_abandons_inputs() {
        let (_tx, input) = channel_input();
        let (merge, mut completions) = TestMerge::from_streams([input]);
        let handle = merge.handle();
        drop(merge);
        assert!(handle.is_done());
        assert_eq!(completions.remove(0).await, InputOutcome::Abandoned);
        assert!(handle.add_input(iter_input(vec![1])).is_err());
    }

    fn timed_inputs() -> impl Strategy<Value = Vec<Vec<u64>>> {
        (
            proptest::collection::btree_set(1u64..5_000, 1..40),
            1usize..6,
            any::<u64>(),
        )
            .prop_map(|(times, n, seed)| {
                let mut inputs = vec![Vec::new(); n];
                for (i, t) in times.into_iter().enumerate() {
                    let slot = (seed.rotate_left(i as u32) as usize ^ i) % n;
                    inputs[slot].push(t);
                }
                inputs
            })
    }

    proptest! {
        #[test]
        fn merged_output_is_ordered_by_resolution_time(inputs in timed_inputs()) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let mut expected: Vec<u64> = inputs.iter().flatten().copied().collect();
            expected.sort();
            let items: Vec<u64> = rt.block_on(async move {
                let start = Instant::now();
                let (merge, _) = TestMerge::from_streams(
                    inputs.into_iter().map(|times| timed_input(start, times)),
                );
                merge.map(|r| r.unwrap()).collect().await
            });
            prop_assert_eq!(items, expected);
        }
    }
}
