//! Per-channel message orchestration.
//!
//! Every channel moves through `Idle → Buffering → Queued → Responding`.
//! Incoming messages are optionally debounced into a buffer, flushed into a
//! FIFO queue, and drained by at most one response task per channel. A newer
//! message can supersede the running task, and a panic silences the channel
//! for a while.
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! `.await`; anything that suspends re-validates state afterwards.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use oobabot_core::config::DiscordSettings;
use oobabot_core::{ChannelId, ChatMessage, MessageId};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::decide::{Decision, ResponseDecisionEngine};

/// Whether replies in a channel should quote the message they answer.
///
/// Set while more messages are waiting in the channel, so readers can tell
/// which reply goes with which message. Shared with the running response and
/// read at send time, not when the message is dequeued.
#[derive(Debug, Clone, Default)]
pub struct ReplyFlag(Arc<AtomicBool>);

impl ReplyFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed);
    }
}

/// Everything a handler needs to answer one message.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub message: ChatMessage,
    pub decision: Decision,
    /// Fires when the response is superseded, stopped or the channel panics.
    pub cancel: CancellationToken,
    pub reply: ReplyFlag,
}

impl ResponseContext {
    pub fn new(message: ChatMessage, decision: Decision, cancel: CancellationToken) -> Self {
        Self {
            message,
            decision,
            cancel,
            reply: ReplyFlag::default(),
        }
    }
}

/// Produces the actual reply. Must return promptly once `ctx.cancel` fires.
#[async_trait::async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, ctx: ResponseContext);
}

/// Observable state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Buffering,
    Queued,
    Responding,
    Panicking,
}

struct ActiveTask {
    id: u64,
    cancel: CancellationToken,
    /// Taken by whoever cancels the task so that only one caller awaits it.
    handle: Option<JoinHandle<()>>,
}

struct BufferWindow {
    id: u64,
    arrivals: watch::Sender<usize>,
}

#[derive(Default)]
struct ChannelState {
    pending: VecDeque<ChatMessage>,
    buffer: Vec<ChatMessage>,
    window: Option<BufferWindow>,
    task: Option<ActiveTask>,
    panic_until: Option<Instant>,
    replying: ReplyFlag,
}

impl ChannelState {
    fn push_pending(&mut self, message: ChatMessage) {
        self.pending.push_back(message);
        if self.pending.len() > 1 || self.task.is_some() {
            self.replying.set(true);
        }
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.replying.set(false);
    }

    fn is_panicking(&mut self, channel_id: ChannelId) -> bool {
        match self.panic_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                info!(channel_id, "Calming down again.");
                self.panic_until = None;
                false
            }
            None => false,
        }
    }

    fn phase(&mut self, channel_id: ChannelId) -> ChannelPhase {
        if self.is_panicking(channel_id) {
            ChannelPhase::Panicking
        } else if self.task.is_some() {
            ChannelPhase::Responding
        } else if self.window.is_some() {
            ChannelPhase::Buffering
        } else if !self.pending.is_empty() {
            ChannelPhase::Queued
        } else {
            ChannelPhase::Idle
        }
    }

    fn is_disposable(&mut self, channel_id: ChannelId) -> bool {
        self.pending.is_empty()
            && self.buffer.is_empty()
            && self.window.is_none()
            && self.task.is_none()
            && !self.is_panicking(channel_id)
    }
}

/// Queue settings, taken from `[discord]`.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub accumulation_period: Duration,
    pub continue_on_additional_messages: usize,
    pub respond_to_latest_only: bool,
    pub skip_in_progress_responses: bool,
    pub panic_duration: Duration,
    pub cleanup_timeout: Duration,
}

impl From<&DiscordSettings> for QueueSettings {
    fn from(settings: &DiscordSettings) -> Self {
        Self {
            accumulation_period: Duration::from_secs_f64(settings.message_accumulation_period),
            continue_on_additional_messages: settings.continue_on_additional_messages,
            respond_to_latest_only: settings.respond_to_latest_only,
            skip_in_progress_responses: settings.skip_in_progress_responses,
            panic_duration: Duration::from_secs_f64(settings.panic_duration),
            cleanup_timeout: Duration::from_secs_f64(settings.task_cleanup_timeout),
        }
    }
}

pub struct MessageQueue {
    settings: QueueSettings,
    engine: Arc<ResponseDecisionEngine>,
    handler: Arc<dyn ResponseHandler>,
    channels: Mutex<HashMap<ChannelId, ChannelState>>,
    next_id: AtomicU64,
    /// Number of channels with a running response task.
    busy: watch::Sender<usize>,
}

impl MessageQueue {
    pub fn new(
        settings: QueueSettings,
        engine: Arc<ResponseDecisionEngine>,
        handler: Arc<dyn ResponseHandler>,
    ) -> Self {
        Self {
            settings,
            engine,
            handler,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            busy: watch::Sender::new(0),
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelState>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Called with the lock held whenever a task slot changes.
    fn publish_busy(&self, channels: &HashMap<ChannelId, ChannelState>) {
        let busy = channels.values().filter(|s| s.task.is_some()).count();
        self.busy.send_if_modified(|current| {
            let changed = *current != busy;
            *current = busy;
            changed
        });
    }

    /// Follows how many channels are currently being answered.
    pub fn subscribe_busy(&self) -> watch::Receiver<usize> {
        self.busy.subscribe()
    }

    /// Entry point for every new message in a channel.
    pub async fn process(self: &Arc<Self>, message: ChatMessage) {
        let channel_id = message.channel_id;
        let message_id = message.id;
        let is_guaranteed = self.engine.is_guaranteed(channel_id, message_id);

        if !is_guaranteed && self.is_panicking(channel_id) {
            debug!(channel_id, message_id, "Channel is panicking, ignoring message");
            return;
        }

        // Waiting on a message we are going to ignore anyway gains nothing.
        let ignorable = !is_guaranteed && self.engine.should_ignore(&message);
        let debounce = !self.settings.accumulation_period.is_zero()
            && !is_guaranteed
            && !message.is_direct_message
            && !ignorable;

        if debounce {
            if !self.buffer(message).await {
                return;
            }
        } else {
            self.enqueue(message);
        }

        self.start_or_supersede(channel_id, message_id, debounce, ignorable).await;
    }

    /// Ends any panic and queues `message` with a guaranteed reply. The
    /// guarantee is set under the channel lock, together with the enqueue,
    /// so a task winding down cannot purge it in between.
    pub async fn poke(self: &Arc<Self>, message: ChatMessage) {
        let channel_id = message.channel_id;
        let message_id = message.id;
        {
            let mut channels = self.channels();
            let state = channels.entry(channel_id).or_default();
            if state.panic_until.take().is_some() {
                info!(channel_id, "Cancelling panic.");
            }
            self.engine.guarantee_response(channel_id, message_id);
            state.push_pending(message);
        }
        self.start_or_supersede(channel_id, message_id, false, false).await;
    }

    /// Runs once `message_id` is queued (or flushed from a buffer): cancels
    /// an in-flight response when configured to, then starts a task.
    async fn start_or_supersede(
        self: &Arc<Self>,
        channel_id: ChannelId,
        message_id: MessageId,
        flushed: bool,
        ignorable: bool,
    ) {
        if self.settings.skip_in_progress_responses && self.is_responding(channel_id) {
            if ignorable {
                return;
            }
            // Deleted while we were waiting.
            if !self.still_pending(channel_id, message_id, flushed) {
                return;
            }
            if let Some((task_id, handle)) = self.cancel_response(channel_id) {
                debug!(channel_id, "Cancelling queued/in-progress responses");
                self.await_cleanup(channel_id, task_id, handle).await;

                // The world may have moved on while we waited.
                if !self.still_pending(channel_id, message_id, flushed) {
                    return;
                }
                if self.settings.respond_to_latest_only {
                    self.collapse_to_latest(channel_id);
                }
            }
        }

        self.try_start(channel_id);
    }

    /// Adds `message` to the debounce buffer. The caller that opens the
    /// window waits it out, flushes the buffer and gets `true`; everyone
    /// else returns `false` immediately.
    async fn buffer(self: &Arc<Self>, message: ChatMessage) -> bool {
        let channel_id = message.channel_id;
        let (window_id, arrivals) = {
            let mut channels = self.channels();
            let state = channels.entry(channel_id).or_default();
            state.buffer.push(message);
            if let Some(window) = &state.window {
                let _ = window.arrivals.send(state.buffer.len());
                return false;
            }
            let window_id = self.next_id();
            let (tx, rx) = watch::channel(state.buffer.len());
            state.window = Some(BufferWindow {
                id: window_id,
                arrivals: tx,
            });
            (window_id, rx)
        };

        debug!(channel_id, "Accumulating messages");
        self.accumulate(arrivals).await;

        let mut channels = self.channels();
        let Some(state) = channels.get_mut(&channel_id) else {
            return true;
        };
        // A panic closed this window (and maybe a new one opened since).
        if state.window.as_ref().is_none_or(|w| w.id != window_id) {
            return true;
        }
        state.window = None;
        let buffered = std::mem::take(&mut state.buffer);
        if self.settings.respond_to_latest_only {
            if let Some(latest) = buffered.into_iter().last() {
                state.push_pending(latest);
            }
        } else {
            for message in buffered {
                state.push_pending(message);
            }
        }
        true
    }

    /// Waits out the accumulation period, or until enough additional
    /// messages arrive when that is configured.
    async fn accumulate(&self, mut arrivals: watch::Receiver<usize>) {
        let period = self.settings.accumulation_period;
        let extra = self.settings.continue_on_additional_messages;
        if extra == 0 {
            tokio::time::sleep(period).await;
            return;
        }
        let target = *arrivals.borrow() + extra;
        let _ = tokio::time::timeout(period, async {
            loop {
                if *arrivals.borrow_and_update() >= target {
                    return;
                }
                if arrivals.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
    }

    /// A flushed window may have collapsed away the message that opened it,
    /// so for those anything queued counts.
    fn still_pending(&self, channel_id: ChannelId, message_id: MessageId, flushed: bool) -> bool {
        if flushed {
            self.queue_len(channel_id) > 0
        } else {
            self.contains(channel_id, message_id)
        }
    }

    fn enqueue(&self, message: ChatMessage) {
        self.channels()
            .entry(message.channel_id)
            .or_default()
            .push_pending(message);
    }

    /// Keeps only the newest queued message, and only its guarantee.
    fn collapse_to_latest(&self, channel_id: ChannelId) {
        let kept = {
            let mut channels = self.channels();
            let Some(state) = channels.get_mut(&channel_id) else {
                return;
            };
            if state.pending.len() <= 1 {
                return;
            }
            let Some(latest) = state.pending.pop_back() else {
                return;
            };
            let kept = latest.id;
            state.clear_pending();
            state.push_pending(latest);
            kept
        };
        // The cancelled task never got to purge these.
        self.engine.retain_guarantee(channel_id, kept);
    }

    /// Starts a response task unless one is running or there is nothing to
    /// do. Check and start happen under one lock.
    fn try_start(self: &Arc<Self>, channel_id: ChannelId) -> bool {
        let mut channels = self.channels();
        let Some(state) = channels.get_mut(&channel_id) else {
            return false;
        };
        if state.task.is_some() || state.pending.is_empty() {
            return false;
        }

        let task_id = self.next_id();
        let cancel = CancellationToken::new();
        let queue = Arc::clone(self);
        let token = cancel.clone();
        // Nothing in here may touch the lock when dropped: a runtime that is
        // shutting down drops the future inside `spawn`.
        let handle = tokio::spawn(async move {
            let drained = AssertUnwindSafe(queue.drain(channel_id, token))
                .catch_unwind()
                .await;
            if drained.is_err() {
                error!(channel_id, task_id, "Response task panicked");
            }
            // Messages that arrived while the task was winding down.
            if queue.finish_task(channel_id, task_id) {
                queue.try_start(channel_id);
            }
        });
        state.task = Some(ActiveTask {
            id: task_id,
            cancel,
            handle: Some(handle),
        });
        self.publish_busy(&channels);
        debug!(channel_id, task_id, "Started response task");
        true
    }

    /// Evaluates queued messages in arrival order until the queue is empty
    /// or the task is cancelled.
    async fn drain(&self, channel_id: ChannelId, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let Some((message, reply)) = self.pop(channel_id) else {
                break;
            };
            let decision = self.engine.should_respond(&message);
            if !decision.respond {
                continue;
            }
            let ctx = ResponseContext {
                message,
                decision,
                cancel: cancel.child_token(),
                reply,
            };
            self.handler.handle(ctx).await;
        }

        // Guarantees for messages that were never evaluated would leak.
        if !cancel.is_cancelled() {
            self.purge_stray_guarantees(channel_id);
        }
    }

    /// Drops the channel's guarantees unless something is still waiting to
    /// be evaluated. Checked and purged under the channel lock.
    fn purge_stray_guarantees(&self, channel_id: ChannelId) {
        let channels = self.channels();
        let waiting = channels
            .get(&channel_id)
            .is_some_and(|state| !state.pending.is_empty() || !state.buffer.is_empty());
        if !waiting {
            self.engine.purge_guarantees(channel_id);
        }
    }

    fn pop(&self, channel_id: ChannelId) -> Option<(ChatMessage, ReplyFlag)> {
        let mut channels = self.channels();
        let state = channels.get_mut(&channel_id)?;
        let message = state.pending.pop_front()?;
        if state.pending.is_empty() {
            state.replying.set(false);
        }
        Some((message, state.replying.clone()))
    }

    /// Clears the task slot. Returns true when nobody is waiting on the
    /// task, in which case queued messages are up to the caller.
    fn finish_task(&self, channel_id: ChannelId, task_id: u64) -> bool {
        let mut channels = self.channels();
        let Some(state) = channels.get_mut(&channel_id) else {
            return false;
        };
        let mut unattended = false;
        if state.task.as_ref().is_some_and(|t| t.id == task_id) {
            unattended = state.task.take().is_some_and(|t| t.handle.is_some());
            debug!(channel_id, task_id, "Response task finished");
        }
        if state.is_disposable(channel_id) {
            channels.remove(&channel_id);
        }
        self.publish_busy(&channels);
        unattended
    }

    /// Signals the active task and takes its handle. `None` when there is no
    /// task or someone else is already waiting for it.
    fn cancel_response(&self, channel_id: ChannelId) -> Option<(u64, JoinHandle<()>)> {
        let mut channels = self.channels();
        let task = channels.get_mut(&channel_id)?.task.as_mut()?;
        task.cancel.cancel();
        let handle = task.handle.take()?;
        Some((task.id, handle))
    }

    /// Waits for a cancelled task, bounded by the cleanup timeout. A task
    /// that does not stop in time is aborted and forgotten.
    async fn await_cleanup(&self, channel_id: ChannelId, task_id: u64, mut handle: JoinHandle<()>) {
        match tokio::time::timeout(self.settings.cleanup_timeout, &mut handle).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    channel_id,
                    timeout_secs = self.settings.cleanup_timeout.as_secs_f64(),
                    "Cancelled response task did not finish in time, abandoning it"
                );
                handle.abort();
                self.finish_task(channel_id, task_id);
            }
        }
    }

    /// Cancels the in-flight response without touching the queue.
    /// Returns whether there was one.
    pub fn stop_responding(&self, channel_id: ChannelId) -> bool {
        let channels = self.channels();
        match channels.get(&channel_id).and_then(|s| s.task.as_ref()) {
            Some(task) => {
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops everything pending in the channel, cancels the active response
    /// and ignores new messages for the panic duration.
    pub fn panic(&self, channel_id: ChannelId) {
        let mut channels = self.channels();
        let state = channels.entry(channel_id).or_default();
        if state.is_panicking(channel_id) {
            return;
        }
        info!(
            channel_id,
            "Panicking for {:.1} seconds...",
            self.settings.panic_duration.as_secs_f64()
        );
        state.buffer.clear();
        state.window = None;
        state.clear_pending();
        self.engine.purge_guarantees(channel_id);
        if let Some(task) = &state.task {
            task.cancel.cancel();
        }
        state.panic_until = Some(Instant::now() + self.settings.panic_duration);
    }

    /// Ends a panic early.
    pub fn calm_down(&self, channel_id: ChannelId) {
        let mut channels = self.channels();
        let Some(state) = channels.get_mut(&channel_id) else {
            return;
        };
        if state.panic_until.take().is_some() {
            info!(channel_id, "Cancelling panic.");
        }
        if state.is_disposable(channel_id) {
            channels.remove(&channel_id);
        }
    }

    pub fn is_panicking(&self, channel_id: ChannelId) -> bool {
        let mut channels = self.channels();
        let Some(state) = channels.get_mut(&channel_id) else {
            return false;
        };
        let panicking = state.is_panicking(channel_id);
        if state.is_disposable(channel_id) {
            channels.remove(&channel_id);
        }
        panicking
    }

    /// Forgets a deleted message.
    pub fn remove(&self, channel_id: ChannelId, message_id: MessageId) {
        let mut channels = self.channels();
        let Some(state) = channels.get_mut(&channel_id) else {
            return;
        };
        state.buffer.retain(|m| m.id != message_id);
        state.pending.retain(|m| m.id != message_id);
        if state.pending.is_empty() {
            state.replying.set(false);
        }
        if state.is_disposable(channel_id) {
            channels.remove(&channel_id);
        }
    }

    pub fn is_responding(&self, channel_id: ChannelId) -> bool {
        self.channels()
            .get(&channel_id)
            .is_some_and(|state| state.task.is_some())
    }

    pub fn is_buffered(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        self.channels()
            .get(&channel_id)
            .is_some_and(|state| state.buffer.iter().any(|m| m.id == message_id))
    }

    pub fn contains(&self, channel_id: ChannelId, message_id: MessageId) -> bool {
        self.channels()
            .get(&channel_id)
            .is_some_and(|state| state.pending.iter().any(|m| m.id == message_id))
    }

    pub fn queue_len(&self, channel_id: ChannelId) -> usize {
        self.channels()
            .get(&channel_id)
            .map_or(0, |state| state.pending.len())
    }

    pub fn phase(&self, channel_id: ChannelId) -> ChannelPhase {
        self.channels()
            .get_mut(&channel_id)
            .map_or(ChannelPhase::Idle, |state| state.phase(channel_id))
    }

    /// Number of channels with any live state.
    pub fn active_channels(&self) -> usize {
        self.channels().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use oobabot_core::Settings;

    use super::*;
    use crate::decide::chance::FixedRandom;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(MessageId, Decision)>>,
        replied: Mutex<Vec<bool>>,
        cancelled: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ResponseHandler for Recorder {
        async fn handle(&self, ctx: ResponseContext) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.seen.lock().unwrap().push((ctx.message.id, ctx.decision));
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
            self.replied.lock().unwrap().push(ctx.reply.is_set());
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl Recorder {
        fn ids(&self) -> Vec<MessageId> {
            self.seen.lock().unwrap().iter().map(|(id, _)| *id).collect()
        }
    }

    fn message(id: MessageId, body: &str) -> ChatMessage {
        ChatMessage {
            id,
            channel_id: 10,
            guild_id: Some(1),
            author_id: 100,
            author_name: "alice".to_string(),
            author_is_bot: false,
            body_text: body.to_string(),
            send_timestamp: 1_000.0 + id as f64,
            mentions: Vec::new(),
            is_direct_message: false,
            reference_message_id: None,
            attachments: Vec::new(),
        }
    }

    fn queue(settings: QueueSettings, delay: Duration) -> (Arc<MessageQueue>, Arc<Recorder>, Arc<ResponseDecisionEngine>) {
        let engine = Arc::new(
            ResponseDecisionEngine::new(&Settings::default(), Arc::new(FixedRandom(0.99))).unwrap(),
        );
        engine.set_bot_user_id(999);
        let recorder = Arc::new(Recorder {
            delay,
            ..Default::default()
        });
        let queue = Arc::new(MessageQueue::new(
            settings,
            Arc::clone(&engine),
            Arc::clone(&recorder) as Arc<dyn ResponseHandler>,
        ));
        (queue, recorder, engine)
    }

    fn settings() -> QueueSettings {
        QueueSettings::from(&DiscordSettings::default())
    }

    async fn wait_idle(queue: &MessageQueue, channel_id: ChannelId) {
        while queue.phase(channel_id) != ChannelPhase::Idle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_messages_collapse_to_latest() {
        let settings = QueueSettings {
            accumulation_period: Duration::from_secs(2),
            respond_to_latest_only: true,
            ..settings()
        };
        let (queue, recorder, _) = queue(settings, Duration::ZERO);

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process(message(1, "oobabot one")).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(queue.phase(10), ChannelPhase::Buffering);
        queue.process(message(2, "oobabot two")).await;
        queue.process(message(3, "oobabot three")).await;
        assert!(queue.is_buffered(10, 3));

        first.await.unwrap();
        wait_idle(&queue, 10).await;
        assert_eq!(recorder.ids(), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_keeps_arrival_order_without_latest_only() {
        let settings = QueueSettings {
            accumulation_period: Duration::from_secs(2),
            ..settings()
        };
        let (queue, recorder, _) = queue(settings, Duration::ZERO);

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process(message(1, "oobabot one")).await }
        });
        tokio::task::yield_now().await;
        queue.process(message(2, "oobabot two")).await;
        first.await.unwrap();
        wait_idle(&queue, 10).await;
        assert_eq!(recorder.ids(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn additional_messages_end_the_window_early() {
        let settings = QueueSettings {
            accumulation_period: Duration::from_secs(60),
            continue_on_additional_messages: 1,
            respond_to_latest_only: true,
            ..settings()
        };
        let (queue, recorder, _) = queue(settings, Duration::ZERO);
        let started = Instant::now();

        let first = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process(message(1, "oobabot one")).await }
        });
        tokio::task::yield_now().await;
        queue.process(message(2, "oobabot two")).await;
        first.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(60));
        wait_idle(&queue, 10).await;
        assert_eq!(recorder.ids(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_message_supersedes_running_response() {
        let settings = QueueSettings {
            skip_in_progress_responses: true,
            respond_to_latest_only: true,
            ..settings()
        };
        let (queue, recorder, _) = queue(settings, Duration::from_secs(30));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.phase(10), ChannelPhase::Responding);

        let second = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process(message(2, "oobabot two")).await }
        });
        let third = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process(message(3, "oobabot three")).await }
        });
        second.await.unwrap();
        third.await.unwrap();
        wait_idle(&queue, 10).await;

        let ids = recorder.ids();
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&3));
        assert!(!ids.contains(&2));
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_during_response_is_answered_once() {
        let settings = QueueSettings {
            accumulation_period: Duration::from_secs(2),
            skip_in_progress_responses: true,
            respond_to_latest_only: true,
            ..settings()
        };
        let (queue, recorder, _) = queue(settings, Duration::from_secs(30));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.phase(10), ChannelPhase::Responding);

        let opener = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.process(message(2, "oobabot two")).await }
        });
        tokio::task::yield_now().await;
        for id in 3..=6 {
            queue.process(message(id, "oobabot again")).await;
        }
        opener.await.unwrap();
        wait_idle(&queue, 10).await;

        assert_eq!(recorder.ids(), vec![1, 6]);
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ignorable_message_does_not_interrupt() {
        let settings = QueueSettings {
            skip_in_progress_responses: true,
            ..settings()
        };
        let (queue, recorder, _) = queue(settings, Duration::from_secs(5));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut from_bot = message(2, "beep");
        from_bot.author_is_bot = true;
        queue.process(from_bot).await;

        wait_idle(&queue, 10).await;
        assert_eq!(recorder.ids(), vec![1]);
        assert_eq!(recorder.cancelled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_clears_channel_until_calmed() {
        let (queue, recorder, _) = queue(settings(), Duration::from_secs(30));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.panic(10);
        assert!(queue.is_panicking(10));
        assert_eq!(queue.phase(10), ChannelPhase::Panicking);

        queue.process(message(2, "oobabot two")).await;
        assert_eq!(queue.queue_len(10), 0);

        queue.calm_down(10);
        queue.process(message(3, "oobabot three")).await;
        wait_idle(&queue, 10).await;
        assert_eq!(recorder.ids(), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_expires_on_its_own() {
        let settings = QueueSettings {
            panic_duration: Duration::from_secs(5),
            ..settings()
        };
        let (queue, _, _) = queue(settings, Duration::ZERO);
        queue.panic(10);
        assert!(queue.is_panicking(10));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!queue.is_panicking(10));
        assert_eq!(queue.active_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn guaranteed_message_bypasses_panic() {
        let (queue, recorder, engine) = queue(settings(), Duration::ZERO);
        queue.panic(10);
        engine.guarantee_response(10, 7);

        queue.process(message(7, "no wakeword here")).await;
        wait_idle(&queue, 10).await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(7, Decision::UNSOLICITED)]);
        assert!(!engine.is_guaranteed(10, 7));
    }

    #[tokio::test(start_paused = true)]
    async fn poke_calms_down_and_is_answered() {
        let (queue, recorder, engine) = queue(settings(), Duration::ZERO);
        queue.panic(10);

        queue.poke(message(7, "no wakeword here")).await;
        wait_idle(&queue, 10).await;

        assert!(!queue.is_panicking(10));
        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(7, Decision::UNSOLICITED)]);
        assert_eq!(engine.guarantee_count(10), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poke_during_response_waits_its_turn() {
        let (queue, recorder, engine) = queue(settings(), Duration::from_secs(1));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.poke(message(2, "no wakeword here")).await;
        assert!(engine.is_guaranteed(10, 2));

        wait_idle(&queue, 10).await;
        assert_eq!(recorder.ids(), vec![1, 2]);
        assert_eq!(engine.guarantee_count(10), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stray_purge_spares_queued_guarantees() {
        let (queue, _, engine) = queue(settings(), Duration::ZERO);

        // Queued after the last pop but before the purge.
        queue.enqueue(message(5, "no wakeword here"));
        engine.guarantee_response(10, 5);
        queue.purge_stray_guarantees(10);
        assert!(engine.is_guaranteed(10, 5));

        queue.remove(10, 5);
        queue.purge_stray_guarantees(10);
        assert_eq!(engine.guarantee_count(10), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn panic_drops_guarantees_of_cleared_messages() {
        let (queue, recorder, engine) = queue(settings(), Duration::from_secs(30));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.guarantee_response(10, 2);
        queue.process(message(2, "no wakeword here")).await;
        assert!(queue.contains(10, 2));

        queue.panic(10);
        assert_eq!(queue.queue_len(10), 0);
        assert_eq!(engine.guarantee_count(10), 0);

        while queue.is_responding(10) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.ids(), vec![1]);
        assert_eq!(recorder.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_purges_stray_guarantees() {
        let (queue, _, engine) = queue(settings(), Duration::ZERO);
        engine.guarantee_response(10, 42);

        queue.process(message(1, "oobabot one")).await;
        wait_idle(&queue, 10).await;

        assert_eq!(engine.guarantee_count(10), 0);
        assert_eq!(queue.active_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_count_follows_tasks() {
        let (queue, _, _) = queue(settings(), Duration::from_secs(1));
        let mut busy = queue.subscribe_busy();
        assert_eq!(*busy.borrow_and_update(), 0);

        queue.process(message(1, "oobabot one")).await;
        assert_eq!(*busy.borrow_and_update(), 1);

        wait_idle(&queue, 10).await;
        assert_eq!(*busy.borrow_and_update(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_flag_tracks_waiting_messages() {
        let (queue, recorder, _) = queue(settings(), Duration::from_secs(1));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.process(message(2, "oobabot two")).await;
        wait_idle(&queue, 10).await;

        assert_eq!(recorder.ids(), vec![1, 2]);
        assert_eq!(*recorder.replied.lock().unwrap(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_message_is_forgotten() {
        let (queue, recorder, _) = queue(settings(), Duration::from_secs(1));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.process(message(2, "oobabot two")).await;
        assert!(queue.contains(10, 2));
        queue.remove(10, 2);

        wait_idle(&queue, 10).await;
        assert_eq!(recorder.ids(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn wedged_task_is_abandoned_after_timeout() {
        struct Stubborn;

        #[async_trait::async_trait]
        impl ResponseHandler for Stubborn {
            async fn handle(&self, _ctx: ResponseContext) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        }

        let engine = Arc::new(
            ResponseDecisionEngine::new(&Settings::default(), Arc::new(FixedRandom(0.99))).unwrap(),
        );
        let settings = QueueSettings {
            skip_in_progress_responses: true,
            cleanup_timeout: Duration::from_secs(1),
            ..settings()
        };
        let queue = Arc::new(MessageQueue::new(settings, engine, Arc::new(Stubborn)));

        queue.process(message(1, "oobabot one")).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = Instant::now();
        queue.process(message(2, "oobabot two")).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(queue.is_responding(10));
        assert!(queue.stop_responding(10));
    }
}
