//! Stable session key computation.
//!
//! Every conversation thread maps to one key, which names its transcript
//! file and serializes its runs. Keys:
//! - `chan:<channel>:<chat>` — a chat-platform conversation
//! - `job:<jobId>`           — runs fired by the scheduler
//! - `api:<userId>`          — direct API callers

/// Key for a chat-platform conversation. The same `(channel, chat)` pair
/// always yields the same key, so each chat keeps one persistent transcript.
pub fn chat_session_key(channel_id: &str, chat_id: &str) -> String {
    format!("chan:{}:{}", sanitize(channel_id), sanitize(chat_id))
}

/// Key for scheduler-originated runs of a job.
pub fn job_session_key(job_id: &str) -> String {
    format!("job:{}", sanitize(job_id))
}

/// Key for a direct API caller.
pub fn api_session_key(user_id: &str) -> String {
    format!("api:{}", sanitize(user_id))
}

/// Session keys become file names; replace path-hostile characters.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_key_is_stable() {
        let a = chat_session_key("telegram", "12345");
        let b = chat_session_key("telegram", "12345");
        assert_eq!(a, b);
        assert_eq!(a, "chan:telegram:12345");
    }

    #[test]
    fn different_chats_get_different_keys() {
        assert_ne!(
            chat_session_key("telegram", "1"),
            chat_session_key("telegram", "2")
        );
        assert_ne!(
            chat_session_key("telegram", "1"),
            chat_session_key("discord", "1")
        );
    }

    #[test]
    fn hostile_characters_sanitized() {
        let key = chat_session_key("slack", "../../etc/passwd");
        assert!(!key.contains('/'));
        assert!(!key.contains(".."));
    }

    #[test]
    fn scope_prefixes_do_not_collide() {
        assert_ne!(job_session_key("x"), api_session_key("x"));
        assert_ne!(job_session_key("x"), chat_session_key("x", ""));
    }
}
