//! Streaming client for an Oobabooga (OpenAI-compatible) text-generation server.

mod client;
pub mod splitter;

pub use client::{OobaClient, ParsedLine, parse_stream_line};
pub use splitter::{
    MessageSplitter, RegexSplitter, SentenceSplitter, TokenGrouper, strip_assistant_echo,
};
