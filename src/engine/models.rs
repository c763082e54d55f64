//! Canonical chat message record delivered to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Placeholder used when the upstream omits the author name.
pub const DEFAULT_AUTHOR_NAME: &str = "User";

/// Badges shown next to an author's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorBadge {
    Owner,
    Moderator,
    Member,
}

/// One piece of a message body: literal text or an inline image (emoji).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RichTextSegment {
    Text { text: String },
    Image { url: String, alt: String },
}

impl RichTextSegment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>, alt: impl Into<String>) -> Self {
        Self::Image {
            url: url.into(),
            alt: alt.into(),
        }
    }
}

/// Logical kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    Text,
    Paid,
    PaidSticker,
    Membership,
    MembershipGift,
}

/// Colour tier of a paid message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PaidTier {
    Blue,
    LightBlue,
    Green,
    Yellow,
    Orange,
    Magenta,
    Red,
    #[default]
    Unknown,
}

impl PaidTier {
    /// Map the ARGB header colour of a paid message to its tier.
    pub fn from_header_color(argb: u64) -> Self {
        match argb {
            4279592384 => PaidTier::Blue,
            4278237396 => PaidTier::LightBlue,
            4278239141 => PaidTier::Green,
            4294947584 => PaidTier::Yellow,
            4293284096 => PaidTier::Orange,
            4290910299 => PaidTier::Magenta,
            4291821568 => PaidTier::Red,
            _ => PaidTier::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonetaryAnnotation {
    /// Amount exactly as the upstream formats it, e.g. `"¥1,000"`
    pub amount: String,
    pub tier: PaidTier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub kind: MessageKind,
    pub author_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_channel_id: Option<String>,
    #[serde(default)]
    pub author_badges: BTreeSet<AuthorBadge>,
    pub rich_text: Vec<RichTextSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monetary_annotation: Option<MonetaryAnnotation>,
    /// Assigned by the engine when the batch was fetched
    pub received_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Body flattened to plain text; images contribute their alt text.
    pub fn plain_text(&self) -> String {
        self.rich_text
            .iter()
            .map(|segment| match segment {
                RichTextSegment::Text { text } => text.as_str(),
                RichTextSegment::Image { alt, .. } => alt.as_str(),
            })
            .collect()
    }

    pub fn has_badge(&self, badge: AuthorBadge) -> bool {
        self.author_badges.contains(&badge)
    }
}
