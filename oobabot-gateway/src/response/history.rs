//! Channel history as the model should see it.

use oobabot_core::{ChannelId, HistoryMessage, MessageId};
use tracing::debug;

use crate::decide::ResponseDecisionEngine;

use super::sink::{ChannelSink, SinkError};

/// Reads filtered, newest-first history for one prompt.
pub struct HistoryReader<'a> {
    pub sink: &'a dyn ChannelSink,
    pub engine: &'a ResponseDecisionEngine,
    pub ai_name: &'a str,
    /// Number of messages wanted, the triggering message included.
    pub limit: usize,
}

impl HistoryReader<'_> {
    /// Returns `None` for messages the model should not see. Messages the
    /// bot wrote are relabelled with the persona name.
    fn accept(&self, mut message: HistoryMessage) -> Option<HistoryMessage> {
        if message.hidden_by_reaction || self.engine.is_hidden(&message.body_text) {
            return None;
        }
        if message.author_id == self.engine.bot_user_id() {
            // Image posts carry no text worth replaying.
            if message.is_attachment_only {
                return None;
            }
            message.author_name = self.ai_name.to_string();
        }
        Some(message)
    }

    /// Collects history for a reply to `trigger`, which always comes first.
    ///
    /// When `trigger` replies to another message, that message comes next and
    /// older history is read from before it, so the model answers the thread
    /// of conversation it was asked about. Everything at or before
    /// `stop_before` is left out. Pages keep coming until enough messages
    /// survive filtering or the channel runs out.
    pub async fn collect(
        &self,
        channel_id: ChannelId,
        trigger: HistoryMessage,
        reference_id: Option<MessageId>,
        stop_before: Option<MessageId>,
    ) -> Result<Vec<HistoryMessage>, SinkError> {
        let is_stopped = |id: MessageId| stop_before.is_some_and(|marker| id <= marker);

        let mut before = trigger.id;
        let mut collected = vec![trigger];

        if let Some(reference_id) = reference_id {
            if is_stopped(reference_id) {
                return Ok(collected);
            }
            match self.sink.fetch_message(channel_id, reference_id).await {
                Ok(referenced) => {
                    before = referenced.id;
                    if let Some(message) = self.accept(referenced) {
                        collected.push(message);
                    }
                }
                Err(SinkError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let mut filtered = 0usize;
        while collected.len() < self.limit {
            let page = self
                .sink
                .fetch_history(channel_id, Some(before), self.limit)
                .await?;
            let page_len = page.len();

            for message in page {
                if collected.len() >= self.limit {
                    break;
                }
                if is_stopped(message.id) {
                    debug!(channel_id, message_id = message.id, "Reached history marker");
                    return Ok(collected);
                }
                before = message.id;
                match self.accept(message) {
                    Some(message) => collected.push(message),
                    None => filtered += 1,
                }
            }

            if page_len < self.limit {
                break;
            }
        }

        if filtered > 0 {
            debug!(
                channel_id,
                filtered,
                collected = collected.len(),
                "Filtered messages out of history"
            );
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use oobabot_core::Settings;

    use super::*;
    use crate::decide::ThreadRandom;
    use crate::response::sink::{SentMessage, TypingGuard};

    const BOT: u64 = 99;

    /// Serves a fixed channel history.
    struct Channel(Vec<HistoryMessage>);

    #[async_trait::async_trait]
    impl ChannelSink for Channel {
        async fn send(
            &self,
            _channel_id: ChannelId,
            _text: &str,
            _reply_to: Option<MessageId>,
        ) -> Result<SentMessage, SinkError> {
            Err(SinkError::Unsupported("send"))
        }

        async fn edit(&self, _: ChannelId, _: MessageId, _: &str) -> Result<(), SinkError> {
            Err(SinkError::Unsupported("edit"))
        }

        async fn delete(&self, _: ChannelId, _: MessageId) -> Result<(), SinkError> {
            Err(SinkError::Unsupported("delete"))
        }

        async fn fetch_history(
            &self,
            _channel_id: ChannelId,
            before: Option<MessageId>,
            limit: usize,
        ) -> Result<Vec<HistoryMessage>, SinkError> {
            let mut page: Vec<_> = self
                .0
                .iter()
                .filter(|m| before.is_none_or(|b| m.id < b))
                .cloned()
                .collect();
            page.sort_by(|a, b| b.id.cmp(&a.id));
            page.truncate(limit);
            Ok(page)
        }

        async fn fetch_message(
            &self,
            _channel_id: ChannelId,
            message_id: MessageId,
        ) -> Result<HistoryMessage, SinkError> {
            self.0
                .iter()
                .find(|m| m.id == message_id)
                .cloned()
                .ok_or(SinkError::NotFound)
        }

        fn typing(&self, _channel_id: ChannelId) -> TypingGuard {
            Box::new(())
        }
    }

    fn line(id: MessageId, author_id: u64, text: &str) -> HistoryMessage {
        HistoryMessage {
            id,
            author_id,
            author_name: format!("user{author_id}"),
            author_is_bot: author_id == BOT,
            body_text: text.to_string(),
            send_timestamp: id as f64,
            is_attachment_only: false,
            hidden_by_reaction: false,
        }
    }

    fn engine() -> ResponseDecisionEngine {
        let mut settings = Settings::default();
        settings.discord.ignore_prefixes = vec!["!".to_string()];
        let engine = ResponseDecisionEngine::new(&settings, Arc::new(ThreadRandom)).unwrap();
        engine.set_bot_user_id(BOT);
        engine
    }

    fn ids(history: &[HistoryMessage]) -> Vec<MessageId> {
        history.iter().map(|m| m.id).collect()
    }

    #[tokio::test]
    async fn hidden_messages_are_replaced_from_older_pages() {
        let sink = Channel(vec![
            line(1, 1, "oldest"),
            line(2, 1, "older"),
            line(3, 1, "!hidden"),
            line(4, 1, "!also hidden"),
        ]);
        let engine = engine();
        let reader = HistoryReader {
            sink: &sink,
            engine: &engine,
            ai_name: "Rosie",
            limit: 3,
        };

        let history = reader
            .collect(1, line(5, 1, "now"), None, None)
            .await
            .unwrap();
        assert_eq!(ids(&history), [5, 2, 1]);
    }

    #[tokio::test]
    async fn stops_at_marker_and_renames_the_bot() {
        let sink = Channel(vec![
            line(1, 1, "forgotten"),
            line(2, BOT, "hello"),
            line(3, 1, "hi bot"),
        ]);
        let engine = engine();
        let reader = HistoryReader {
            sink: &sink,
            engine: &engine,
            ai_name: "Rosie",
            limit: 10,
        };

        let history = reader
            .collect(1, line(4, 1, "how are you"), None, Some(1))
            .await
            .unwrap();
        assert_eq!(ids(&history), [4, 3, 2]);
        assert_eq!(history[2].author_name, "Rosie");
    }

    #[tokio::test]
    async fn replied_message_comes_right_after_the_trigger() {
        let sink = Channel(vec![
            line(1, 1, "context"),
            line(2, 1, "the question"),
            line(3, 1, "unrelated chatter"),
        ]);
        let engine = engine();
        let reader = HistoryReader {
            sink: &sink,
            engine: &engine,
            ai_name: "Rosie",
            limit: 10,
        };

        let history = reader
            .collect(1, line(4, 1, "answer this"), Some(2), None)
            .await
            .unwrap();
        assert_eq!(ids(&history), [4, 2, 1]);
    }
}
