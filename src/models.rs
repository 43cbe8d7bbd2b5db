//! Data models for chat messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ChatError;

/// Maximum length of a chat message, in characters, before escaping.
pub const MAX_CONTENT_CHARS: usize = 500;

/// Maximum length of a display name, in characters.
pub const MAX_USERNAME_CHARS: usize = 20;

/// Display name used when a client does not provide one.
pub const GUEST_NAME: &str = "Guest";

/// Author recorded on hub-generated notices.
pub const SYSTEM_AUTHOR: &str = "system";

/// Kind of chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    System,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Text => write!(f, "text"),
            MessageKind::System => write!(f, "system"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageKind::Text),
            "system" => Ok(MessageKind::System),
            other => Err(anyhow::anyhow!("unknown message type: {}", other)),
        }
    }
}

/// A chat message. Content is always stored HTML-escaped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub user_id: Option<String>,
    pub username: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a chat message from raw user input.
    ///
    /// Content is validated against [`MAX_CONTENT_CHARS`] and escaped; the
    /// author falls back to [`GUEST_NAME`].
    pub fn text(username: &str, content: &str) -> Result<Self, ChatError> {
        validate_content(content)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            username: display_name(username),
            content: escape_html(content),
            kind: MessageKind::Text,
            created_at: Utc::now(),
        })
    }

    /// Build a hub notice. `content` is escaped here as well, since it
    /// usually embeds a user-chosen name.
    pub fn system(content: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            username: SYSTEM_AUTHOR.to_string(),
            content: escape_html(content),
            kind: MessageKind::System,
            created_at: Utc::now(),
        }
    }

    /// Notice broadcast when a user joins.
    pub fn joined(username: &str) -> Self {
        Self::system(&format!("{} joined the chat", username))
    }

    /// Notice broadcast when a user leaves.
    pub fn left(username: &str) -> Self {
        Self::system(&format!("{} left the chat", username))
    }

    pub fn is_system(&self) -> bool {
        self.kind == MessageKind::System
    }
}

/// Reject empty (or whitespace-only) and oversized content.
pub fn validate_content(content: &str) -> Result<(), ChatError> {
    if content.trim().is_empty() {
        return Err(ChatError::EmptyContent);
    }
    let len = content.chars().count();
    if len > MAX_CONTENT_CHARS {
        return Err(ChatError::ContentTooLong(len));
    }
    Ok(())
}

/// Strict validation used by the join path.
pub fn validate_username(username: &str) -> Result<String, ChatError> {
    let name = username.trim();
    if name.is_empty() {
        return Err(ChatError::UsernameRequired);
    }
    if name.chars().any(char::is_control) {
        return Err(ChatError::UsernameInvalid);
    }
    let len = name.chars().count();
    if len > MAX_USERNAME_CHARS {
        return Err(ChatError::UsernameTooLong(len));
    }
    Ok(name.to_string())
}

/// Lenient normalisation used by the stream and send paths: control
/// characters become spaces, then the name is trimmed, falls back to the
/// guest name and is truncated to [`MAX_USERNAME_CHARS`].
pub fn display_name(username: &str) -> String {
    let cleaned: String = username
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let name = cleaned.trim();
    if name.is_empty() {
        GUEST_NAME.to_string()
    } else {
        name.chars().take(MAX_USERNAME_CHARS).collect()
    }
}

/// Escape the five HTML special characters.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_tags_are_escaped() {
        let msg = Message::text("mallory", "<script>alert('x')</script>").unwrap();
        assert_eq!(
            msg.content,
            "&lt;script&gt;alert(&#39;x&#39;)&lt;/script&gt;"
        );
        assert!(!msg.content.contains('<'));
        assert_eq!(msg.kind, MessageKind::Text);
    }

    #[test]
    fn test_content_length_boundary() {
        let ok = "a".repeat(MAX_CONTENT_CHARS);
        assert!(Message::text("bob", &ok).is_ok());

        let too_long = "a".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            Message::text("bob", &too_long),
            Err(ChatError::ContentTooLong(501))
        ));
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        // 500 three-byte characters is still within the limit
        let kana = "あ".repeat(MAX_CONTENT_CHARS);
        assert!(validate_content(&kana).is_ok());
    }

    #[test]
    fn test_empty_content_rejected() {
        assert!(matches!(validate_content(""), Err(ChatError::EmptyContent)));
        assert!(matches!(validate_content("   \n"), Err(ChatError::EmptyContent)));
    }

    #[test]
    fn test_display_name_defaults_and_truncates() {
        assert_eq!(display_name(""), GUEST_NAME);
        assert_eq!(display_name("  carol  "), "carol");
        assert_eq!(display_name(&"x".repeat(30)).chars().count(), MAX_USERNAME_CHARS);
    }

    #[test]
    fn test_display_name_strips_line_breaks() {
        assert_eq!(display_name("a\rb"), "a b");
        assert_eq!(display_name("a\nb\tc"), "a b c");
        assert_eq!(display_name("\r\n"), GUEST_NAME);
    }

    #[test]
    fn test_validate_username() {
        assert!(matches!(validate_username(" "), Err(ChatError::UsernameRequired)));
        assert!(matches!(
            validate_username(&"y".repeat(21)),
            Err(ChatError::UsernameTooLong(21))
        ));
        assert!(matches!(
            validate_username("a\rb"),
            Err(ChatError::UsernameInvalid)
        ));
        assert_eq!(validate_username(" Alice ").unwrap(), "Alice");
    }

    #[test]
    fn test_join_and_leave_notices() {
        let joined = Message::joined("Alice");
        assert!(joined.is_system());
        assert_eq!(joined.username, SYSTEM_AUTHOR);
        assert!(joined.content.contains("Alice"));
        assert!(joined.content.contains("joined"));

        let left = Message::left("<b>Alice</b>");
        assert!(left.content.contains("left"));
        assert!(left.content.contains("&lt;b&gt;Alice&lt;/b&gt;"));
    }

    #[test]
    fn test_kind_round_trips_through_str() {
        assert_eq!("system".parse::<MessageKind>().unwrap(), MessageKind::System);
        assert_eq!(MessageKind::Text.to_string(), "text");
        assert!("image".parse::<MessageKind>().is_err());
    }
}
