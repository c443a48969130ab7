//! Buyer-turn routing helpers: canned replies, nonces, truncation.
//!
//! The dispatcher owns the routing loop itself; these are the pure pieces.

/// Replies longer than this are truncated before hitting the chat
/// transport.
pub const MAX_REPLY_CHARS: usize = 3_900;
pub const TRUNCATION_MARKER: &str = "\n… [reply truncated]";

pub const REPLY_STARTING: &str = "Your session is starting up, please wait a moment…";
pub const REPLY_QUEUED: &str =
    "All slots are busy right now — you're queued and I'll start as soon as one opens.";
pub const REPLY_ERROR: &str =
    "Sorry, I hit an internal error handling that message. Please try again.";
pub const REPLY_TIMEOUT: &str =
    "Session time limit reached — thanks for working with me! This sandbox is shutting down.";

pub fn queue_position_reply(position: usize) -> String {
    format!("Thanks for your job! You're #{position} in the queue — I'll get started as soon as a slot opens.")
}

/// True when the message came from one of our own identities (echoes of
/// our replies in the room).
pub fn is_self_message(identity_names: &[String], sender: &str) -> bool {
    identity_names.iter().any(|name| name == sender)
}

/// 8 random bytes, hex encoded; ties a user turn to its assistant turn in
/// the job log.
pub fn message_nonce() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

pub fn truncate_reply(reply: &str) -> String {
    if reply.chars().count() <= MAX_REPLY_CHARS {
        return reply.to_string();
    }
    let cut: String = reply.chars().take(MAX_REPLY_CHARS).collect();
    format!("{cut}{TRUNCATION_MARKER}")
}
