//! Message fingerprinting for deduplication.

use sha2::{Digest, Sha256};

use crate::ChatMessage;

/// SHA-256 over the fields that make two messages "the same message".
///
/// Covers role, content, name, tool call id and tool calls. The message id is
/// not part of the fingerprint.
#[must_use]
pub fn message_fingerprint(message: &ChatMessage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.role.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(message.content.as_bytes());
    hasher.update(b":");
    hasher.update(message.name.as_deref().unwrap_or_default().as_bytes());
    hasher.update(b":");
    hasher.update(message.tool_call_id.as_deref().unwrap_or_default().as_bytes());
    for call in &message.tool_calls {
        hasher.update(b":");
        hasher.update(call.id.as_bytes());
        hasher.update(b"/");
        hasher.update(call.name.as_bytes());
        hasher.update(b"/");
        hasher.update(call.arguments.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
