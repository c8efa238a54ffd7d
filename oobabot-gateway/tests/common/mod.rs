//! Shared helpers for integration tests: a recording channel sink, a
//! scripted text generator and message builders.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use oobabot_core::{ChannelId, ChatMessage, HistoryMessage, MessageId, Settings, UserId};
use std::time::Duration;

use oobabot_gateway::decide::RandomSource;
use oobabot_gateway::providers::{ImageGenerator, ProviderError, TextGenerator, TokenStream};
use oobabot_gateway::response::{ChannelSink, SentMessage, SinkError, TypingGuard};
use oobabot_gateway::{AppState, Backends};
use tokio::sync::{Notify, mpsc};

pub const BOT_ID: UserId = 999;
pub const USER_ID: UserId = 100;
pub const GUILD_ID: u64 = 1;
pub const CHANNEL_ID: ChannelId = 10;
pub const NOW: f64 = 1_700_000_000.0;

/// Always rolls the same number.
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

pub fn settings() -> Settings {
    Settings::default()
}

/// A running bot wired to in-memory fakes.
pub struct Harness {
    pub state: Arc<AppState>,
    pub sink: Arc<MockSink>,
    pub generator: Arc<ScriptedGenerator>,
}

impl Harness {
    pub fn new(settings: Settings, generator: ScriptedGenerator) -> Self {
        Self::build(settings, generator, None, Arc::new(MockSink::default()))
    }

    /// Image generation enabled, backed by [`WaitingImageGenerator`].
    pub fn with_images(
        settings: Settings,
        generator: ScriptedGenerator,
    ) -> (Self, Arc<WaitingImageGenerator>) {
        let sink = Arc::new(MockSink::default());
        let images = Arc::new(WaitingImageGenerator {
            sink: Arc::clone(&sink),
            prompts: Mutex::new(Vec::new()),
        });
        let harness = Self::build(
            settings,
            generator,
            Some(Arc::clone(&images) as Arc<dyn ImageGenerator>),
            sink,
        );
        (harness, images)
    }

    fn build(
        settings: Settings,
        generator: ScriptedGenerator,
        images: Option<Arc<dyn ImageGenerator>>,
        sink: Arc<MockSink>,
    ) -> Self {
        let generator = Arc::new(generator);
        let backends = Backends {
            text: Arc::clone(&generator) as Arc<dyn TextGenerator>,
            images,
            vision: None,
        };
        let state = AppState::with_random(
            settings,
            backends,
            Arc::clone(&sink) as Arc<dyn ChannelSink>,
            Arc::new(FixedRandom(0.0)),
        )
        .expect("valid settings");
        state.engine.set_bot_user_id(BOT_ID);
        Self {
            state: Arc::new(state),
            sink,
            generator,
        }
    }

    /// Adds `message` to the channel and hands it to the queue.
    pub async fn receive(&self, message: ChatMessage) {
        self.sink.add_history(&message);
        self.state.queue.process(message).await;
    }

    /// Waits until the channel has nothing queued or running.
    pub async fn settle(&self, channel_id: ChannelId) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.queue.is_responding(channel_id)
                || self.state.queue.queue_len(channel_id) > 0
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel did not settle");
    }

    /// Waits until the generator has been asked for `calls` responses.
    pub async fn wait_for_calls(&self, calls: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.generator.calls() < calls {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("generator was not called");
    }
}

pub fn message(id: MessageId, body: &str) -> ChatMessage {
    ChatMessage {
        id,
        channel_id: CHANNEL_ID,
        guild_id: Some(GUILD_ID),
        author_id: USER_ID,
        author_name: "alice".to_string(),
        author_is_bot: false,
        body_text: body.to_string(),
        send_timestamp: NOW + id as f64,
        mentions: Vec::new(),
        is_direct_message: false,
        reference_message_id: None,
        attachments: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Sent {
        channel_id: ChannelId,
        id: MessageId,
        text: String,
        reply_to: Option<MessageId>,
    },
    Edited {
        channel_id: ChannelId,
        id: MessageId,
        text: String,
    },
    Deleted {
        channel_id: ChannelId,
        id: MessageId,
    },
    Image {
        channel_id: ChannelId,
        id: MessageId,
        description: String,
        reply_to: Option<MessageId>,
    },
}

/// In-memory channel. Posted messages join the history as bot messages.
pub struct MockSink {
    events: Mutex<Vec<SinkEvent>>,
    history: Mutex<Vec<(ChannelId, HistoryMessage)>>,
    next_id: AtomicU64,
    /// Signalled whenever a text message is posted.
    pub text_posted: Notify,
    /// Reply targets that have "vanished".
    missing: Mutex<Vec<MessageId>>,
}

impl Default for MockSink {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1000),
            text_posted: Notify::new(),
            missing: Mutex::new(Vec::new()),
        }
    }
}

impl MockSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Texts of every posted message, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Sent { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn images(&self) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, SinkEvent::Image { .. }))
            .collect()
    }

    /// Adds a message from a user to the channel history.
    pub fn add_history(&self, message: &ChatMessage) {
        self.history
            .lock()
            .unwrap()
            .push((message.channel_id, HistoryMessage::from(message)));
    }

    pub fn add_bot_history(&self, channel_id: ChannelId, id: MessageId, text: &str) {
        self.history.lock().unwrap().push((
            channel_id,
            HistoryMessage {
                id,
                author_id: BOT_ID,
                author_name: "oobabot".to_string(),
                author_is_bot: true,
                body_text: text.to_string(),
                send_timestamp: NOW + id as f64,
                is_attachment_only: false,
                hidden_by_reaction: false,
            },
        ));
    }

    pub fn forget(&self, message_id: MessageId) {
        self.missing.lock().unwrap().push(message_id);
    }

    fn record(&self, event: SinkEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait::async_trait]
impl ChannelSink for MockSink {
    async fn send(
        &self,
        channel_id: ChannelId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<SentMessage, SinkError> {
        if reply_to.is_some_and(|id| self.missing.lock().unwrap().contains(&id)) {
            return Err(SinkError::MissingReference);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(SinkEvent::Sent {
            channel_id,
            id,
            text: text.to_string(),
            reply_to,
        });
        self.add_bot_history(channel_id, id, text);
        self.text_posted.notify_one();
        Ok(SentMessage { id, channel_id })
    }

    async fn edit(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
        text: &str,
    ) -> Result<(), SinkError> {
        self.record(SinkEvent::Edited {
            channel_id,
            id: message_id,
            text: text.to_string(),
        });
        let mut history = self.history.lock().unwrap();
        if let Some((_, message)) = history.iter_mut().find(|(_, m)| m.id == message_id) {
            message.body_text = text.to_string();
        }
        Ok(())
    }

    async fn delete(&self, channel_id: ChannelId, message_id: MessageId) -> Result<(), SinkError> {
        self.record(SinkEvent::Deleted {
            channel_id,
            id: message_id,
        });
        self.history.lock().unwrap().retain(|(_, m)| m.id != message_id);
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel_id: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<HistoryMessage>, SinkError> {
        let history = self.history.lock().unwrap();
        let mut messages: Vec<HistoryMessage> = history
            .iter()
            .filter(|(ch, m)| *ch == channel_id && before.is_none_or(|b| m.id < b))
            .map(|(_, m)| m.clone())
            .collect();
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn fetch_message(
        &self,
        channel_id: ChannelId,
        message_id: MessageId,
    ) -> Result<HistoryMessage, SinkError> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .find(|(ch, m)| *ch == channel_id && m.id == message_id)
            .map(|(_, m)| m.clone())
            .ok_or(SinkError::NotFound)
    }

    fn typing(&self, _channel_id: ChannelId) -> TypingGuard {
        Box::new(())
    }

    async fn send_image(
        &self,
        channel_id: ChannelId,
        _png: Vec<u8>,
        description: &str,
        reply_to: Option<MessageId>,
    ) -> Result<SentMessage, SinkError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.record(SinkEvent::Image {
            channel_id,
            id,
            description: description.to_string(),
            reply_to,
        });
        Ok(SentMessage { id, channel_id })
    }
}

/// Replays scripted responses, one per `stream` call. Each response is a
/// list of chunks. Runs out into empty responses.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Vec<String>>>,
    prompts: Mutex<Vec<String>>,
    stops: Mutex<Vec<Vec<String>>>,
    stop_calls: AtomicUsize,
    /// This many initial streams stay open after their script ends, until
    /// `stop` is called.
    hang_calls: usize,
    open: Mutex<Vec<mpsc::Sender<Result<String, ProviderError>>>>,
}

impl ScriptedGenerator {
    pub fn new(scripts: &[&[&str]]) -> Self {
        Self {
            scripts: Mutex::new(
                scripts
                    .iter()
                    .map(|chunks| chunks.iter().map(|c| c.to_string()).collect())
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// The first `calls` streams never finish on their own.
    pub fn hang_first(mut self, calls: usize) -> Self {
        self.hang_calls = calls;
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn stop_sequences(&self) -> Vec<Vec<String>> {
        self.stops.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        prompt: &str,
        stop_sequences: &[String],
    ) -> Result<TokenStream, ProviderError> {
        let call = {
            let mut prompts = self.prompts.lock().unwrap();
            prompts.push(prompt.to_string());
            prompts.len() - 1
        };
        self.stops.lock().unwrap().push(stop_sequences.to_vec());
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        let (tx, rx) = mpsc::channel(script.len().max(1));
        for chunk in script {
            tx.send(Ok(chunk)).await.unwrap();
        }
        if call < self.hang_calls {
            self.open.lock().unwrap().push(tx);
        }
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), ProviderError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.open.lock().unwrap().clear();
        Ok(())
    }

    fn can_abort(&self) -> bool {
        true
    }
}

/// Produces an image only after the text response has been posted, so a
/// test finishing at all proves text and image ran side by side.
pub struct WaitingImageGenerator {
    pub sink: Arc<MockSink>,
    pub prompts: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ImageGenerator for WaitingImageGenerator {
    async fn generate(&self, prompt: &str) -> Result<Vec<u8>, ProviderError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.sink.text_posted.notified().await;
        Ok(vec![0x89, b'P', b'N', b'G'])
    }
}
