//! From "answer this message" to messages in the channel.
//!
//! One call to [`ResponsePipeline::handle`] reads history, builds the prompt,
//! streams the completion through the immersion filter and posts it, retrying
//! empty or repeated output. An image request found in the message runs
//! alongside the text.

use std::sync::Arc;
use std::time::Duration;

use oobabot_core::{
    ChannelId, ChatMessage, HistoryMessage, ImpersonationGuard, MessageId, Settings, StreamMode,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::decide::ResponseDecisionEngine;
use crate::filter::ImmersionBreakingFilter;
use crate::prompt::{PromptBuilder, PromptNote};
use crate::providers::ooba::{
    MessageSplitter, RegexSplitter, SentenceSplitter, TokenGrouper, strip_assistant_echo,
};
use crate::providers::{
    ImageDescriber, ImageGenerator, TextGenerator, TokenStream, collect_stream,
};
use crate::queue::{ReplyFlag, ResponseContext, ResponseHandler};
use crate::repetition::{Repetition, RepetitionTracker};

use super::history::HistoryReader;
use super::image::ImagePromptDetector;
use super::sink::{ChannelSink, SinkError, send_with_fallback};
use super::stats::{ResponseStats, ResponseTimer};

/// How generated text reaches the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// One message, edited as token groups arrive.
    Tokens,
    /// One message, extended sentence by sentence.
    Sentences,
    /// A new message per sentence (or per `message_regex` match).
    Split,
    /// Everything at once when generation ends.
    Whole,
}

impl RenderMode {
    pub fn from_settings(stream: StreamMode, dont_split: bool) -> Self {
        match stream {
            StreamMode::Token => Self::Tokens,
            StreamMode::Sentence => Self::Sentences,
            StreamMode::Off if dont_split => Self::Whole,
            StreamMode::Off => Self::Split,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub retries: u32,
    pub render_mode: RenderMode,
    pub speed_limit: Duration,
    pub char_limit: usize,
    pub history_lines: usize,
    pub impersonation: ImpersonationGuard,
    pub reply_in_thread: bool,
    pub message_regex: Option<String>,
    pub log_all_the_things: bool,
}

impl From<&Settings> for PipelineSettings {
    fn from(settings: &Settings) -> Self {
        let discord = &settings.discord;
        let regex = settings.oobabooga.message_regex.trim();
        Self {
            retries: u32::try_from(settings.oobabooga.retries).unwrap_or(0),
            render_mode: RenderMode::from_settings(
                discord.stream_responses,
                discord.dont_split_responses,
            ),
            speed_limit: Duration::from_secs_f64(discord.stream_responses_speed_limit),
            char_limit: discord.message_character_limit.max(1),
            history_lines: discord.history_lines.max(1),
            impersonation: discord.prevent_impersonation,
            reply_in_thread: discord.reply_in_thread,
            message_regex: (!regex.is_empty()).then(|| regex.to_string()),
            log_all_the_things: settings.oobabooga.log_all_the_things,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Where and how one response is delivered.
struct Delivery {
    channel_id: ChannelId,
    trigger_id: MessageId,
    /// The trigger lives in `channel_id` (false for a fresh thread).
    same_channel: bool,
    /// Always quote the trigger (a summons in a public channel).
    summoned: bool,
    reply: ReplyFlag,
    /// Message to overwrite instead of posting anew.
    existing: Option<MessageId>,
}

impl Delivery {
    /// Decided at send time: the queue may have grown since we started.
    fn reference(&self) -> Option<MessageId> {
        if !self.same_channel {
            return None;
        }
        (self.summoned || self.reply.is_set()).then_some(self.trigger_id)
    }
}

/// The message being answered, as far as prompting is concerned.
struct Trigger {
    message: HistoryMessage,
    reference_id: Option<MessageId>,
    rewrite: Option<Rewrite>,
}

/// A previous response and how to redo it.
struct Rewrite {
    response: String,
    instruction: String,
}

#[derive(Debug, Default, Clone, Copy)]
struct Rendered {
    sent: usize,
    aborted: bool,
}

impl Rendered {
    fn absorb(&mut self, other: Rendered) {
        self.sent += other.sent;
        self.aborted |= other.aborted;
    }
}

struct ImageSupport {
    detector: ImagePromptDetector,
    generator: Arc<dyn ImageGenerator>,
}

pub struct ResponsePipeline {
    settings: PipelineSettings,
    engine: Arc<ResponseDecisionEngine>,
    generator: Arc<dyn TextGenerator>,
    sink: Arc<dyn ChannelSink>,
    prompts: PromptBuilder,
    filter: ImmersionBreakingFilter,
    repetition: Arc<RepetitionTracker>,
    stats: Arc<ResponseStats>,
    images: Option<ImageSupport>,
    vision: Option<Arc<dyn ImageDescriber>>,
}

impl ResponsePipeline {
    pub fn new(
        settings: &Settings,
        engine: Arc<ResponseDecisionEngine>,
        generator: Arc<dyn TextGenerator>,
        sink: Arc<dyn ChannelSink>,
        repetition: Arc<RepetitionTracker>,
        stats: Arc<ResponseStats>,
    ) -> Result<Self, PipelineError> {
        let prompts = PromptBuilder::from_settings(settings);
        let filter = ImmersionBreakingFilter::new(
            settings.discord.use_immersion_breaking_filter,
            prompts.turn_matchers()?,
            settings.discord.stop_markers.clone(),
        );
        let pipeline_settings = PipelineSettings::from(settings);
        if let Some(pattern) = &pipeline_settings.message_regex {
            RegexSplitter::new(pattern)?;
        }
        Ok(Self {
            settings: pipeline_settings,
            engine,
            generator,
            sink,
            prompts,
            filter,
            repetition,
            stats,
            images: None,
            vision: None,
        })
    }

    /// Enables image generation for messages that ask for a picture.
    pub fn with_images(
        mut self,
        settings: &Settings,
        generator: Arc<dyn ImageGenerator>,
    ) -> Result<Self, PipelineError> {
        self.images = Some(ImageSupport {
            detector: ImagePromptDetector::new(&settings.stable_diffusion)?,
            generator,
        });
        Ok(self)
    }

    /// Enables descriptions of attached images.
    pub fn with_vision(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.vision = Some(describer);
        self
    }

    pub fn stats(&self) -> &Arc<ResponseStats> {
        &self.stats
    }

    fn splitter(&self) -> Box<dyn MessageSplitter> {
        if let Some(pattern) = &self.settings.message_regex {
            match RegexSplitter::new(pattern) {
                Ok(splitter) => return Box::new(splitter),
                Err(e) => warn!("message_regex rejected, splitting by sentence: {}", e),
            }
        }
        Box::new(SentenceSplitter::new())
    }

    /// Asks the backend to stop, if it can.
    async fn abort_generation(&self) {
        if !self.generator.can_abort() {
            return;
        }
        if let Err(e) = self.generator.stop().await {
            warn!("Could not stop generation on {}: {}", self.generator.name(), e);
        }
    }

    /// Appends descriptions of the message's images to its text.
    async fn describe_attachments(&self, message: &mut ChatMessage) {
        let Some(vision) = &self.vision else {
            return;
        };
        if message.attachments.is_empty() {
            return;
        }
        let _typing = self.sink.typing(message.channel_id);
        for url in &message.attachments {
            debug!("Getting image description...");
            match vision.describe(url).await {
                Ok(Some(description)) => {
                    if !message.body_text.is_empty() {
                        message.body_text.push('\n');
                    }
                    message.body_text.push_str(&format!("[Image: {description}]"));
                }
                Ok(None) => {}
                Err(e) => error!("Error getting image description: {}", e),
            }
        }
    }

    /// Picks the channel the reply goes to, opening a thread if configured.
    /// `None` means we cannot respond at all.
    async fn response_channel(&self, message: &ChatMessage) -> Option<ChannelId> {
        if !self.settings.reply_in_thread || message.is_direct_message {
            return Some(message.channel_id);
        }
        let name = format!("{} replying to {}", self.prompts.ai_name(), message.author_name);
        match self
            .sink
            .create_thread(message.channel_id, message.id, &name)
            .await
        {
            Ok(thread_id) => {
                debug!(
                    channel_id = message.channel_id,
                    thread_id, "Created response thread {}", name
                );
                Some(thread_id)
            }
            // Threads inside threads and the like: answer in place.
            Err(SinkError::Unsupported(_)) => Some(message.channel_id),
            Err(e) => {
                warn!(
                    "{} can't create threads in channel {}, not responding: {}",
                    message.author_name, message.channel_id, e
                );
                None
            }
        }
    }

    async fn respond(&self, ctx: &ResponseContext, image_prompt: Option<String>) {
        let mut message = ctx.message.clone();
        self.describe_attachments(&mut message).await;
        if message.is_empty() {
            debug!(message_id = message.id, "Nothing to respond to");
            return;
        }

        let summoned = ctx.decision.is_direct_mention && !message.is_direct_message;
        if summoned {
            self.engine
                .log_mention(message.guild_key(), message.channel_id, message.send_timestamp);
        }

        let Some(channel_id) = self.response_channel(&message).await else {
            return;
        };
        if summoned && channel_id != message.channel_id {
            self.engine
                .log_mention(message.guild_key(), channel_id, message.send_timestamp);
        }

        let delivery = Delivery {
            channel_id,
            trigger_id: message.id,
            same_channel: channel_id == message.channel_id,
            summoned,
            reply: ctx.reply.clone(),
            existing: None,
        };

        let image_task = image_prompt.and_then(|prompt| {
            let images = self.images.as_ref()?;
            let generator = Arc::clone(&images.generator);
            let sink = Arc::clone(&self.sink);
            let reply_to = delivery.same_channel.then_some(message.id);
            Some(tokio::spawn(post_image(
                generator, sink, channel_id, reply_to, prompt,
            )))
        });

        let trigger = Trigger {
            message: HistoryMessage::from(&message),
            reference_id: message.reference_message_id,
            rewrite: None,
        };
        let label = format!("Response to {}", message.author_name);
        self.respond_in_channel(&trigger, &delivery, image_task.is_some(), &label)
            .await;

        if let Some(task) = image_task {
            if let Err(e) = task.await {
                error!("Image task failed: {}", e);
            }
        }
    }

    /// Generates and posts one response, retrying empty or repeated output.
    async fn respond_in_channel(
        &self,
        trigger: &Trigger,
        delivery: &Delivery,
        image_coming: bool,
        label: &str,
    ) {
        let channel_id = delivery.channel_id;
        let tries = self.settings.retries + 1;
        let mut retry_throttle_id: Option<MessageId> = None;
        let mut outcome = Rendered::default();
        let mut timer: Option<ResponseTimer> = None;

        for attempt in 1..=tries {
            let more_tries = attempt < tries;
            let stop_before = retry_throttle_id.or_else(|| self.repetition.stop_before(channel_id));

            let _typing = self.sink.typing(channel_id);
            let reader = HistoryReader {
                sink: self.sink.as_ref(),
                engine: &self.engine,
                ai_name: self.prompts.ai_name(),
                limit: self.settings.history_lines,
            };
            let history = match reader
                .collect(
                    channel_id,
                    trigger.message.clone(),
                    trigger.reference_id,
                    stop_before,
                )
                .await
            {
                Ok(history) => history,
                Err(e) => {
                    error!(channel_id, "Error while reading channel history: {}", e);
                    self.stats.log_failure();
                    return;
                }
            };

            debug!("Generating prompt...");
            let note = match &trigger.rewrite {
                Some(rewrite) => PromptNote::Rewrite {
                    response: &rewrite.response,
                    instruction: &rewrite.instruction,
                },
                None if image_coming => PromptNote::ImageComing,
                None => PromptNote::None,
            };
            let prompt = self
                .prompts
                .build(&history, self.engine.bot_user_id(), note);
            let stops = self
                .prompts
                .impersonation_stops(self.settings.impersonation, &prompt.author_names);
            if self.settings.log_all_the_things {
                match self.generator.token_count(&prompt.text).await {
                    Ok(tokens) => debug!(tokens, "Prompt size"),
                    Err(e) => debug!("Prompt size unknown: {}", e),
                }
            }

            debug!("Generating text response...");
            let mut attempt_timer = self.stats.log_request_arrived(&prompt.text);
            let stream = match self.generator.stream(&prompt.text, &stops).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Error from {}: {}", self.generator.name(), e);
                    outcome = Rendered::default();
                    self.warn_empty(outcome, more_tries);
                    continue;
                }
            };

            let rendered = match self.settings.render_mode {
                RenderMode::Whole => {
                    let text = match collect_stream(stream).await {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Error from {}: {}", self.generator.name(), e);
                            String::new()
                        }
                    };
                    if self.repetition.threshold() > 0 {
                        let (filtered, _) = self.filter.check(&text);
                        if !filtered.trim().is_empty() {
                            let repetition = self.repetition.compare_to_last(channel_id, &filtered);
                            if repetition.is_repeat() {
                                warn_repetition(repetition, more_tries);
                                outcome = Rendered {
                                    sent: 0,
                                    aborted: true,
                                };
                                if retry_throttle_id.is_none() {
                                    retry_throttle_id = self
                                        .message_before(channel_id, trigger.message.id)
                                        .await;
                                }
                                continue;
                            }
                        }
                    }
                    self.send_messages(&text, delivery, &mut attempt_timer).await
                }
                RenderMode::Split => self.render_split(stream, delivery, &mut attempt_timer).await,
                RenderMode::Tokens | RenderMode::Sentences => {
                    self.render_live(stream, delivery, &mut attempt_timer).await
                }
            };

            outcome = match rendered {
                Ok(rendered) => rendered,
                Err(e) => {
                    error!(channel_id, "Error while sending response: {}", e);
                    self.stats.log_failure();
                    return;
                }
            };
            timer = Some(attempt_timer);
            if outcome.sent > 0 {
                break;
            }
            self.warn_empty(outcome, more_tries);
        }

        match timer {
            Some(timer) if outcome.sent > 0 => self.stats.log_success(timer, label),
            _ => {
                if outcome.aborted {
                    warn!(
                        "No response sent after {} tries. The AI has generated a response \
                         that we have chosen not to send, probably because it was repeated \
                         or broke immersion.",
                        tries
                    );
                } else {
                    warn!("No response sent after {} tries. Giving up.", tries);
                }
                self.stats.log_failure();
            }
        }
    }

    fn warn_empty(&self, outcome: Rendered, more_tries: bool) {
        let text = if outcome.aborted {
            "Response was empty after filtering immersion-breaking lines."
        } else {
            "An empty text response was received from the API."
        };
        if more_tries {
            warn!("{} Regenerating response...", text);
        } else {
            warn!("{}", text);
        }
    }

    /// Id of the message just before `message_id`, used to hide everything
    /// but the trigger from a retried prompt.
    async fn message_before(&self, channel_id: ChannelId, message_id: MessageId) -> Option<MessageId> {
        match self.sink.fetch_history(channel_id, Some(message_id), 1).await {
            Ok(history) => history.first().map(|m| m.id),
            Err(e) => {
                warn!(channel_id, "Could not read history for repetition retry: {}", e);
                None
            }
        }
    }

    async fn post(
        &self,
        channel_id: ChannelId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, SinkError> {
        let sent = send_with_fallback(self.sink.as_ref(), channel_id, text, reply_to).await?;
        info!(
            event_kind = "chat_io",
            channel_id,
            message_id = sent.id,
            "{}: {}",
            self.prompts.ai_name(),
            text
        );
        Ok(sent.id)
    }

    /// Posts one complete response message. Oversized text is split over
    /// several messages, each replying to the previous one; an existing
    /// message is overwritten and truncated instead.
    async fn send_messages(
        &self,
        text: &str,
        delivery: &Delivery,
        timer: &mut ResponseTimer,
    ) -> Result<Rendered, SinkError> {
        let (filtered, aborted) = self.filter.filter(text);
        let text = filtered.trim();
        let mut rendered = Rendered { sent: 0, aborted };
        if text.is_empty() {
            return Ok(rendered);
        }
        let channel_id = delivery.channel_id;
        let limit = self.settings.char_limit;

        if let Some(existing) = delivery.existing {
            let text = truncate_chars(text, limit);
            self.sink.edit(channel_id, existing, &text).await?;
            timer.log_part();
            self.repetition.log_message(channel_id, existing, &text);
            rendered.sent = 1;
            return Ok(rendered);
        }

        let pieces = split_for_limit(text, limit);
        if pieces.len() > 1 {
            warn!(
                "Response exceeded {} character limit by {} characters! \
                 Posting it over {} messages.",
                limit,
                text.chars().count().saturating_sub(limit),
                pieces.len()
            );
        }
        let mut reply_to = delivery.reference();
        for piece in pieces {
            let id = self.post(channel_id, &piece, reply_to).await?;
            if rendered.sent == 0 {
                self.repetition.log_message(channel_id, id, &piece);
            }
            rendered.sent += 1;
            timer.log_part();
            reply_to = Some(id);
        }
        Ok(rendered)
    }

    /// One message per sentence (or `message_regex` match).
    async fn render_split(
        &self,
        mut stream: TokenStream,
        delivery: &Delivery,
        timer: &mut ResponseTimer,
    ) -> Result<Rendered, SinkError> {
        let mut splitter = self.splitter();
        let mut rendered = Rendered::default();

        while let Some(chunk) = stream.recv().await {
            let token = match chunk {
                Ok(token) => token,
                Err(e) => {
                    error!("Error from {}: {}", self.generator.name(), e);
                    break;
                }
            };
            for message in splitter.push(&token) {
                rendered.absorb(
                    self.send_messages(strip_assistant_echo(&message), delivery, timer)
                        .await?,
                );
                if rendered.aborted {
                    return Ok(rendered);
                }
            }
        }
        if let Some(message) = splitter.finish() {
            rendered.absorb(
                self.send_messages(strip_assistant_echo(&message), delivery, timer)
                    .await?,
            );
        }
        Ok(rendered)
    }

    /// Streams into a single message that is edited as text arrives.
    async fn render_live(
        &self,
        mut stream: TokenStream,
        delivery: &Delivery,
        timer: &mut ResponseTimer,
    ) -> Result<Rendered, SinkError> {
        let mut live = LiveMessage::new(delivery);
        let by_sentence = self.settings.render_mode == RenderMode::Sentences;
        let mut splitter = self.splitter();
        let mut grouper = TokenGrouper::new(self.settings.speed_limit);
        let mut last_update: Option<Instant> = None;

        loop {
            let chunk = stream.recv().await;
            let finished = chunk.is_none();
            let token = match chunk {
                Some(Ok(token)) => token,
                Some(Err(e)) => {
                    error!("Error from {}: {}", self.generator.name(), e);
                    break;
                }
                None => String::new(),
            };

            let mut updates = Vec::new();
            if by_sentence {
                updates.extend(splitter.push(&token));
                if finished {
                    updates.extend(splitter.finish());
                }
            } else {
                updates.extend(grouper.push(&token));
                if finished {
                    updates.extend(grouper.flush());
                }
            }

            for update in updates {
                let proceed = if by_sentence {
                    self.settle_rate_limit(&mut last_update).await;
                    live.add_sentence(self, strip_assistant_echo(&update))
                } else {
                    live.add_tokens(self, &update)
                };
                if !proceed {
                    return self.finish_live(live).await;
                }
                if live.show(self).await? {
                    timer.log_part();
                }
                if live.aborted {
                    return self.finish_live(live).await;
                }
            }
            if finished {
                break;
            }
        }
        self.finish_live(live).await
    }

    async fn settle_rate_limit(&self, last_update: &mut Option<Instant>) {
        if let Some(last) = *last_update {
            let next = last + self.settings.speed_limit;
            if Instant::now() < next {
                tokio::time::sleep_until(next).await;
            }
        }
        *last_update = Some(Instant::now());
    }

    async fn finish_live(&self, live: LiveMessage) -> Result<Rendered, SinkError> {
        if let Some((id, text)) = &live.first {
            self.repetition.log_message(live.channel_id, *id, text);
        }
        Ok(Rendered {
            sent: live.sent,
            aborted: live.aborted,
        })
    }

    /// Re-answers the message a bot response was written for, overwriting
    /// that response in place. With an `instruction`, the model is shown
    /// the old response and asked to rewrite it accordingly.
    pub async fn regenerate(
        &self,
        channel_id: ChannelId,
        response_id: MessageId,
        replied_to: Option<MessageId>,
        instruction: Option<&str>,
    ) -> Result<(), SinkError> {
        let target = match self.regeneration_target(channel_id, response_id, replied_to).await? {
            Some(target) => target,
            None => {
                warn!(
                    channel_id,
                    response_id, "Could not find the message this message was in response to."
                );
                self.stats.log_failure();
                return Ok(());
            }
        };

        let delivery = Delivery {
            channel_id,
            trigger_id: target.id,
            same_channel: true,
            summoned: false,
            reply: ReplyFlag::default(),
            existing: Some(response_id),
        };
        let rewrite = match instruction {
            Some(instruction) => {
                let response = self.sink.fetch_message(channel_id, response_id).await?;
                Some(Rewrite {
                    response: response.body_text,
                    instruction: instruction.trim().to_string(),
                })
            }
            None => None,
        };
        let label = if rewrite.is_some() {
            format!("Rewrite of message #{response_id}")
        } else {
            format!("Regeneration of message #{response_id}")
        };
        let trigger = Trigger {
            message: target,
            reference_id: None,
            rewrite,
        };
        self.respond_in_channel(&trigger, &delivery, false, &label)
            .await;
        Ok(())
    }

    async fn regeneration_target(
        &self,
        channel_id: ChannelId,
        response_id: MessageId,
        replied_to: Option<MessageId>,
    ) -> Result<Option<HistoryMessage>, SinkError> {
        let visible =
            |m: &HistoryMessage| !m.hidden_by_reaction && !self.engine.is_hidden(&m.body_text);

        if let Some(replied_to) = replied_to {
            match self.sink.fetch_message(channel_id, replied_to).await {
                Ok(message) if visible(&message) => return Ok(Some(message)),
                Ok(_) | Err(SinkError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        let history = self
            .sink
            .fetch_history(channel_id, Some(response_id), self.settings.history_lines)
            .await?;
        Ok(history.into_iter().find(|m| visible(m)))
    }
}

#[async_trait::async_trait]
impl ResponseHandler for ResponsePipeline {
    async fn handle(&self, ctx: ResponseContext) {
        let message = &ctx.message;
        info!(
            event_kind = "chat_io",
            channel_id = message.channel_id,
            message_id = message.id,
            direct = ctx.decision.is_direct_mention,
            "Responding to message from {}",
            message.author_name
        );
        let image_prompt = self
            .images
            .as_ref()
            .and_then(|images| images.detector.detect(&message.body_text));

        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(
                    channel_id = message.channel_id,
                    message_id = message.id,
                    "Response to {} cancelled",
                    message.author_name
                );
                self.abort_generation().await;
                self.stats.log_cancelled();
            }
            _ = self.respond(&ctx, image_prompt) => {}
        }
    }
}

/// The single message a streamed response is rendered into. Starts a fresh
/// message (replying to the previous one) when the text outgrows the limit.
struct LiveMessage {
    channel_id: ChannelId,
    limit_reached_on_existing: bool,
    editing_existing: bool,
    reference: Option<MessageId>,
    fallback_reference: Option<MessageId>,
    current: Option<MessageId>,
    text: String,
    shown: String,
    first: Option<(MessageId, String)>,
    sent: usize,
    aborted: bool,
}

impl LiveMessage {
    fn new(delivery: &Delivery) -> Self {
        Self {
            channel_id: delivery.channel_id,
            limit_reached_on_existing: false,
            editing_existing: delivery.existing.is_some(),
            reference: None,
            fallback_reference: delivery.reference(),
            current: delivery.existing,
            text: String::new(),
            shown: String::new(),
            first: None,
            sent: 0,
            aborted: false,
        }
    }

    /// Moves on to a new message. Returns false when the existing message
    /// being regenerated is full, in which case the excess is dropped.
    fn roll_over(&mut self, limit: usize) -> bool {
        if self.editing_existing {
            debug!("Response exceeded {} character limit! Truncating excess.", limit);
            self.limit_reached_on_existing = true;
            return false;
        }
        debug!(
            "Response exceeded {} character limit! Posting current message and \
             continuing in a new message.",
            limit
        );
        self.reference = self.current.take().or(self.reference);
        self.text.clear();
        self.shown.clear();
        true
    }

    fn add_tokens(&mut self, pipeline: &ResponsePipeline, tokens: &str) -> bool {
        if tokens.is_empty() {
            return true;
        }
        let limit = pipeline.settings.char_limit;
        let (mut candidate, mut aborted) = pipeline.filter.filter(&format!("{}{}", self.text, tokens));
        if candidate.trim().chars().count() > limit {
            if !self.roll_over(limit) {
                return false;
            }
            (candidate, aborted) = pipeline.filter.filter(tokens);
        }
        self.text = candidate;
        self.aborted = aborted;
        true
    }

    fn add_sentence(&mut self, pipeline: &ResponsePipeline, sentence: &str) -> bool {
        let (sentence, aborted) = pipeline.filter.filter(sentence);
        self.aborted = aborted;
        if sentence.is_empty() {
            return true;
        }
        let sentence = format!("{} ", sentence.trim_end_matches(' '));
        let limit = pipeline.settings.char_limit;
        if format!("{}{}", self.text, sentence).trim().chars().count() > limit
            && !self.roll_over(limit)
        {
            return false;
        }
        self.text.push_str(&sentence);
        true
    }

    /// Pushes the current text to the channel. Returns whether anything
    /// changed there.
    async fn show(&mut self, pipeline: &ResponsePipeline) -> Result<bool, SinkError> {
        let text = truncate_chars(self.text.trim(), pipeline.settings.char_limit);
        if text.is_empty() || text == self.shown {
            return Ok(false);
        }
        match self.current {
            None => {
                let reply_to = self.reference.or(self.fallback_reference);
                let id = pipeline.post(self.channel_id, &text, reply_to).await?;
                self.current = Some(id);
                self.sent += 1;
            }
            Some(id) => {
                pipeline.sink.edit(self.channel_id, id, &text).await?;
                if self.sent == 0 {
                    self.sent = 1;
                }
            }
        }
        if self.sent == 1 {
            if let Some(id) = self.current {
                self.first = Some((id, text.clone()));
            }
        }
        self.shown = text;
        Ok(true)
    }
}

async fn post_image(
    generator: Arc<dyn ImageGenerator>,
    sink: Arc<dyn ChannelSink>,
    channel_id: ChannelId,
    reply_to: Option<MessageId>,
    prompt: String,
) {
    info!(channel_id, prompt = %prompt, "Generating image");
    let png = match generator.generate(&prompt).await {
        Ok(png) => png,
        Err(e) => {
            error!(channel_id, "Could not generate image: {}", e);
            return;
        }
    };
    let mut result = sink.send_image(channel_id, png.clone(), &prompt, reply_to).await;
    if matches!(result, Err(SinkError::MissingReference)) {
        result = sink.send_image(channel_id, png, &prompt, None).await;
    }
    match result {
        Ok(sent) => info!(channel_id, message_id = sent.id, "Posted image"),
        Err(e) => error!(channel_id, "Could not post image: {}", e),
    }
}

fn warn_repetition(repetition: Repetition, more_tries: bool) {
    let detail = match repetition {
        Repetition::Similar(score) => format!("similarity score: {score:.2}"),
        _ => "exact match".to_string(),
    };
    if more_tries {
        warn!(
            "Response was too similar to the previous response ({}). Regenerating response...",
            detail
        );
    } else {
        warn!("Response was too similar to the previous response ({}).", detail);
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// Packs `text` into messages of at most `limit` characters, breaking at
/// line and sentence boundaries where it can and mid-sentence where it must.
pub fn split_for_limit(text: &str, limit: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    for line in ImmersionBreakingFilter::split_lines(text) {
        if ImmersionBreakingFilter::is_separator_only(line) {
            current.push_str(line);
            continue;
        }
        for sentence in ImmersionBreakingFilter::segment(line) {
            for chunk in hard_split(&sentence, limit) {
                let combined = format!("{current}{chunk}");
                if combined.trim().chars().count() > limit && !current.trim().is_empty() {
                    pieces.push(current.trim().to_string());
                    current.clear();
                }
                current.push_str(&chunk);
            }
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }
    pieces
}

fn hard_split(sentence: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    chars
        .chunks(limit.max(1))
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_mode_follows_settings() {
        assert_eq!(RenderMode::from_settings(StreamMode::Off, false), RenderMode::Split);
        assert_eq!(RenderMode::from_settings(StreamMode::Off, true), RenderMode::Whole);
        assert_eq!(RenderMode::from_settings(StreamMode::Token, true), RenderMode::Tokens);
        assert_eq!(
            RenderMode::from_settings(StreamMode::Sentence, false),
            RenderMode::Sentences
        );
    }

    #[test]
    fn short_text_is_one_piece() {
        assert_eq!(split_for_limit("  hello  ", 10), vec!["hello".to_string()]);
        assert!(split_for_limit("   ", 10).is_empty());
    }

    #[test]
    fn long_text_breaks_between_sentences() {
        assert_eq!(
            split_for_limit("First sentence. Second sentence.", 20),
            vec!["First sentence.".to_string(), "Second sentence.".to_string()]
        );
    }

    #[test]
    fn long_text_keeps_line_breaks_inside_pieces() {
        assert_eq!(
            split_for_limit("one\ntwo\nthree four five six", 10),
            vec!["one\ntwo".to_string(), "three four".to_string(), "five six".to_string()]
        );
    }

    #[test]
    fn oversized_sentence_is_cut() {
        assert_eq!(
            split_for_limit("abcdefghij", 4),
            vec!["abcd".to_string(), "efgh".to_string(), "ij".to_string()]
        );
    }

    #[test]
    fn reference_depends_on_channel_and_flag() {
        let reply = ReplyFlag::default();
        let mut delivery = Delivery {
            channel_id: 1,
            trigger_id: 5,
            same_channel: true,
            summoned: false,
            reply,
            existing: None,
        };
        assert_eq!(delivery.reference(), None);
        delivery.summoned = true;
        assert_eq!(delivery.reference(), Some(5));
        delivery.same_channel = false;
        assert_eq!(delivery.reference(), None);
    }

    #[test]
    fn default_settings_split_by_sentence() {
        let settings = PipelineSettings::from(&Settings::default());
        assert_eq!(settings.render_mode, RenderMode::Split);
        assert_eq!(settings.retries, 0);
        assert_eq!(settings.char_limit, 2000);
        assert_eq!(settings.message_regex, None);
    }
}
