//! Chat-session persistence: stable session keys and append-only JSONL
//! transcripts that give each conversation its own durable history.

pub mod session_key;
pub mod transcript;

pub use session_key::{api_session_key, chat_session_key, job_session_key};
pub use transcript::{TranscriptLine, TranscriptStore};
