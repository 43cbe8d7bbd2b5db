//! Renders a message as the HTML fragment pushed to browsers.
//!
//! The fragment is inserted into the page as-is, so it must stay on a single
//! line (an SSE `data:` field ends at the first newline).

use crate::models::{escape_html, Message};

/// Render one message for `viewer`. The viewer's own messages get the `own`
/// class so the page can align them differently.
pub fn render_message(message: &Message, viewer: &str) -> String {
    let time = format!(
        r#"<time datetime="{}">{}</time>"#,
        message.created_at.to_rfc3339(),
        message.created_at.format("%H:%M")
    );
    let content = single_line(&message.content);

    if message.is_system() {
        return format!(
            r#"<div class="message system" id="msg-{}"><span class="content">{}</span>{}</div>"#,
            message.id, content, time
        );
    }

    let own = if message.username == viewer { " own" } else { "" };
    format!(
        r#"<div class="message text{}" id="msg-{}"><span class="author">{}</span><span class="content">{}</span>{}</div>"#,
        own,
        message.id,
        single_line(&escape_html(&message.username)),
        content,
        time
    )
}

fn single_line(content: &str) -> String {
    content.replace("\r\n", "<br>").replace(['\n', '\r'], "<br>")
}
