//! Segment tree → message text plus attachments.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::warn;
use ulid::Ulid;

use threadline_protocol::{Mention, Segment};

use crate::client::Attachment;

/// Flattened, sendable content of one outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedContent {
    pub text: String,
    pub attachments: Vec<Attachment>,
}

impl RenderedContent {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty()
    }
}

/// Render a segment tree in pre-order. Visible pieces are joined with `\n`;
/// reply and routing-hint segments contribute nothing.
pub fn render(root: &Segment) -> RenderedContent {
    let mut pieces: Vec<String> = Vec::new();
    let mut attachments = Vec::new();

    for segment in root.iter() {
        match segment {
            Segment::Text(text) => pieces.push(text.clone()),
            Segment::Mention(mention) => {
                let rendered = render_mention(mention);
                if !rendered.is_empty() {
                    pieces.push(rendered);
                }
            }
            Segment::Image(data) => match decode_payload(data) {
                Some(bytes) => attachments.push(binary_attachment("image", bytes)),
                None => pieces.push("[image: could not be decoded]".to_string()),
            },
            Segment::Emoji(data) => match decode_payload(data) {
                Some(bytes) => attachments.push(binary_attachment("emoji", bytes)),
                None => pieces.push("[emoji: could not be decoded]".to_string()),
            },
            Segment::Voice(data) => match decode_payload(data) {
                Some(bytes) => attachments.push(Attachment {
                    filename: format!("voice_{}.wav", short_id()),
                    data: bytes,
                }),
                None => pieces.push("[voice: could not be decoded]".to_string()),
            },
            Segment::Video(payload) => pieces.push(placeholder("video", payload)),
            Segment::File(payload) => pieces.push(placeholder("file", payload)),
            Segment::Command(_) => pieces.push("[command]".to_string()),
            Segment::Notify(_) => pieces.push("[notification]".to_string()),
            Segment::Reply(_) | Segment::RoutingHint(_) | Segment::List(_) => {}
        }
    }

    RenderedContent {
        text: pieces.join("\n"),
        attachments,
    }
}

/// `<@id>` for users, `<@&id>` for roles, `@everyone`; `@name` when the id is missing.
pub fn render_mention(mention: &Mention) -> String {
    let mut parts = Vec::new();
    if mention.everyone {
        parts.push("@everyone".to_string());
    }
    for user in &mention.users {
        match (&user.user_id, &user.display_name, &user.username) {
            (Some(id), _, _) => parts.push(format!("<@{id}>")),
            (None, Some(name), _) | (None, None, Some(name)) => parts.push(format!("@{name}")),
            (None, None, None) => {}
        }
    }
    for role in &mention.roles {
        match (&role.role_id, &role.role_name) {
            (Some(id), _) => parts.push(format!("<@&{id}>")),
            (None, Some(name)) => parts.push(format!("@{name}")),
            (None, None) => {}
        }
    }
    parts.join(" ")
}

/// File suffix guessed from leading magic bytes.
pub fn sniff_extension(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => "png",
        [0xFF, 0xD8, 0xFF, ..] => "jpg",
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => "gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        [b'B', b'M', ..] => "bmp",
        [0x00, 0x00, 0x01, 0x00, ..] => "ico",
        _ => "bin",
    }
}

/// Accepts bare base64, `base64://...` and `data:...;base64,...`.
fn decode_payload(data: &str) -> Option<Vec<u8>> {
    let data = data.trim();
    let data = data
        .strip_prefix("base64://")
        .or_else(|| data.split_once(";base64,").map(|(_, rest)| rest))
        .unwrap_or(data);
    match STANDARD.decode(data) {
        Ok(bytes) if !bytes.is_empty() => Some(bytes),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Failed to decode base64 payload");
            None
        }
    }
}

fn binary_attachment(prefix: &str, data: Vec<u8>) -> Attachment {
    let extension = sniff_extension(&data);
    Attachment {
        filename: format!("{prefix}_{}.{extension}", short_id()),
        data,
    }
}

fn placeholder(kind: &str, payload: &str) -> String {
    if payload.starts_with("http://") || payload.starts_with("https://") {
        format!("[{kind}] {payload}")
    } else {
        format!("[{kind}]")
    }
}

fn short_id() -> String {
    Ulid::new().to_string().to_lowercase()
}
