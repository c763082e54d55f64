//! Raw upstream event → canonical [`ChatMessage`].
//!
//! The kind of an event is resolved once, in [`EventKind::classify`]. Renderer
//! payloads are read through lenient structures where every field has a
//! default, so a missing field degrades instead of dropping the message.
//! A payload that cannot be read at all is dropped on its own; sibling events
//! in the same batch are unaffected.

use crate::api::feed_client::RawEvent;
use crate::engine::dedup::synthesize_id;
use crate::engine::models::{
    AuthorBadge, ChatMessage, MessageKind, MonetaryAnnotation, PaidTier, RichTextSegment,
    DEFAULT_AUTHOR_NAME,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

#[derive(thiserror::Error, Debug)]
pub enum NormalizeError {
    /// The renderer payload has the wrong shape
    #[error("Malformed {kind} event: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Sequence of text fragments and emojis.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Runs {
    pub runs: Vec<Run>,
    #[serde(rename = "simpleText")]
    pub simple_text: Option<String>,
}

/// A fragment of a message, containing either text or an emoji.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Run {
    pub text: Option<String>,
    pub emoji: Option<Emoji>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Emoji {
    #[serde(rename = "emojiId")]
    pub emoji_id: String,
    pub image: Image,
    pub shortcuts: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Image {
    pub thumbnails: Vec<Thumbnail>,
    pub accessibility: Option<Accessibility>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Accessibility {
    #[serde(rename = "accessibilityData")]
    pub accessibility_data: AccessibilityData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccessibilityData {
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthorBadgeWrapper {
    #[serde(rename = "liveChatAuthorBadgeRenderer")]
    pub renderer: BadgeRenderer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BadgeRenderer {
    pub icon: Option<BadgeIcon>,
    pub tooltip: String,
    pub accessibility: Option<Accessibility>,
    #[serde(rename = "customThumbnail")]
    pub custom_thumbnail: Option<Image>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BadgeIcon {
    #[serde(rename = "iconType")]
    pub icon_type: String,
}

/// Fields shared by every chat item renderer the engine understands.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ItemRenderer {
    pub id: Option<String>,
    pub message: Option<Runs>,
    pub author_name: Option<Runs>,
    pub author_external_channel_id: Option<String>,
    pub author_badges: Vec<AuthorBadgeWrapper>,
    pub purchase_amount_text: Option<Runs>,
    pub header_background_color: Option<u64>,
    pub money_chip_background_color: Option<u64>,
    pub header_subtext: Option<Runs>,
    pub header_primary_text: Option<Runs>,
    pub sticker: Option<Image>,
    pub header: Option<Value>,
}

/// Loosely typed shape used by non-YouTube feeds: `{ id, author, text }`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlainEvent {
    pub id: Option<String>,
    pub author: Option<String>,
    #[serde(alias = "message")]
    pub text: String,
}

/// Logical kind of a raw event.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// Standard text message
    TextMessage(ItemRenderer),
    /// Paid message (Super Chat)
    PaidMessage(ItemRenderer),
    /// Paid sticker (Super Sticker)
    PaidSticker(ItemRenderer),
    /// New member or membership milestone
    Membership(ItemRenderer),
    /// Someone gifted memberships
    GiftPurchase(ItemRenderer),
    /// Someone received a gifted membership
    GiftRedemption(ItemRenderer),
    /// Plain `{ id, author, text }` payload
    Plain(PlainEvent),
    /// Anything else (viewer engagement banners, placeholders, ...)
    Unknown(String),
}

const RENDERER_KEYS: [(&str, &str); 6] = [
    ("liveChatTextMessageRenderer", "textMessage"),
    ("liveChatPaidMessageRenderer", "paidMessage"),
    ("liveChatPaidStickerRenderer", "paidSticker"),
    ("liveChatMembershipItemRenderer", "membershipItem"),
    (
        "liveChatSponsorshipsGiftPurchaseAnnouncementRenderer",
        "sponsorshipsGiftPurchaseAnnouncement",
    ),
    (
        "liveChatSponsorshipsGiftRedemptionAnnouncementRenderer",
        "sponsorshipsGiftRedemptionAnnouncement",
    ),
];

impl EventKind {
    /// Work out which kind of event `raw` is.
    ///
    /// A full `addChatItemAction` wrapper is unwrapped first.
    pub fn classify(raw: &RawEvent) -> Result<Self, NormalizeError> {
        let value = raw
            .0
            .get("addChatItemAction")
            .and_then(|action| action.get("item"))
            .unwrap_or(&raw.0);

        let Some(object) = value.as_object() else {
            return Ok(EventKind::Unknown("non-object".to_string()));
        };

        for (index, (key, kind)) in RENDERER_KEYS.iter().enumerate() {
            let Some(payload) = object.get(*key) else {
                continue;
            };
            let renderer = ItemRenderer::deserialize(payload)
                .map_err(|source| NormalizeError::Malformed {
                    kind: *kind,
                    source,
                })?;
            return Ok(match index {
                0 => EventKind::TextMessage(renderer),
                1 => EventKind::PaidMessage(renderer),
                2 => EventKind::PaidSticker(renderer),
                3 => EventKind::Membership(renderer),
                4 => EventKind::GiftPurchase(renderer),
                _ => EventKind::GiftRedemption(renderer),
            });
        }

        if object.get("text").or_else(|| object.get("message")).is_some_and(Value::is_string) {
            let plain = PlainEvent::deserialize(value).map_err(|source| {
                NormalizeError::Malformed {
                    kind: "plain",
                    source,
                }
            })?;
            return Ok(EventKind::Plain(plain));
        }

        let name = object
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "empty".to_string());
        Ok(EventKind::Unknown(name))
    }

    pub fn get_type(&self) -> &'static str {
        match self {
            EventKind::TextMessage(_) => "textMessage",
            EventKind::PaidMessage(_) => "paidMessage",
            EventKind::PaidSticker(_) => "paidSticker",
            EventKind::Membership(_) => "membershipItem",
            EventKind::GiftPurchase(_) => "sponsorshipsGiftPurchaseAnnouncement",
            EventKind::GiftRedemption(_) => "sponsorshipsGiftRedemptionAnnouncement",
            EventKind::Plain(_) => "plain",
            EventKind::Unknown(_) => "unknown",
        }
    }
}

/// Normalize one event, dropping unknown kinds.
///
/// Malformed payloads are logged and dropped.
pub fn normalize(raw: &RawEvent, received_at: DateTime<Utc>) -> Option<ChatMessage> {
    match try_normalize(raw, received_at) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("🗑️ [NORMALIZER] Dropping event: {}", e);
            None
        }
    }
}

/// Normalize a batch in order. One bad event never affects the others.
pub fn normalize_batch(events: &[RawEvent], received_at: DateTime<Utc>) -> Vec<ChatMessage> {
    events
        .iter()
        .filter_map(|raw| normalize(raw, received_at))
        .collect()
}

pub fn try_normalize(
    raw: &RawEvent,
    received_at: DateTime<Utc>,
) -> Result<Option<ChatMessage>, NormalizeError> {
    let kind = EventKind::classify(raw)?;

    let message = match kind {
        EventKind::TextMessage(renderer) => {
            let rich_text = renderer.message.as_ref().map(convert_runs).unwrap_or_default();
            from_renderer(raw, renderer, MessageKind::Text, rich_text, None, received_at)
        }
        EventKind::PaidMessage(renderer) => {
            let rich_text = renderer.message.as_ref().map(convert_runs).unwrap_or_default();
            let monetary = Some(MonetaryAnnotation {
                amount: runs_text(renderer.purchase_amount_text.as_ref()),
                tier: renderer
                    .header_background_color
                    .map(PaidTier::from_header_color)
                    .unwrap_or_default(),
            });
            from_renderer(raw, renderer, MessageKind::Paid, rich_text, monetary, received_at)
        }
        EventKind::PaidSticker(renderer) => {
            let rich_text = renderer
                .sticker
                .as_ref()
                .and_then(|sticker| {
                    let url = sticker.thumbnails.first()?.url.clone();
                    let alt = sticker
                        .accessibility
                        .as_ref()
                        .map(|a| a.accessibility_data.label.clone())
                        .filter(|label| !label.is_empty())
                        .unwrap_or_else(|| "Super Sticker".to_string());
                    Some(vec![RichTextSegment::image(url, alt)])
                })
                .unwrap_or_default();
            let monetary = Some(MonetaryAnnotation {
                amount: runs_text(renderer.purchase_amount_text.as_ref()),
                tier: renderer
                    .money_chip_background_color
                    .map(PaidTier::from_header_color)
                    .unwrap_or_default(),
            });
            from_renderer(
                raw,
                renderer,
                MessageKind::PaidSticker,
                rich_text,
                monetary,
                received_at,
            )
        }
        EventKind::Membership(renderer) => {
            // ヘッダー（"Welcome to ..." / "Member for N months"）→ 本文の順
            let mut rich_text = Vec::new();
            for runs in [
                renderer.header_primary_text.as_ref(),
                renderer.header_subtext.as_ref(),
                renderer.message.as_ref(),
            ]
            .into_iter()
            .flatten()
            {
                rich_text.extend(convert_runs(runs));
            }
            let mut message = from_renderer(
                raw,
                renderer,
                MessageKind::Membership,
                rich_text,
                None,
                received_at,
            );
            // メンバーシップアイテムは常にメンバー
            message.author_badges.insert(AuthorBadge::Member);
            message
        }
        EventKind::GiftPurchase(renderer) => gift_purchase(raw, renderer, received_at),
        EventKind::GiftRedemption(renderer) => {
            let rich_text = renderer.message.as_ref().map(convert_runs).unwrap_or_default();
            from_renderer(
                raw,
                renderer,
                MessageKind::MembershipGift,
                rich_text,
                None,
                received_at,
            )
        }
        EventKind::Plain(plain) => ChatMessage {
            id: plain
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| synthesize_id(raw)),
            kind: MessageKind::Text,
            author_name: plain
                .author
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_AUTHOR_NAME.to_string()),
            author_channel_id: None,
            author_badges: BTreeSet::new(),
            rich_text: vec![RichTextSegment::text(plain.text)],
            monetary_annotation: None,
            received_at,
        },
        EventKind::Unknown(name) => {
            tracing::trace!("⏭️ [NORMALIZER] Skipping non-message event: {}", name);
            return Ok(None);
        }
    };

    Ok(Some(message))
}

fn from_renderer(
    raw: &RawEvent,
    renderer: ItemRenderer,
    kind: MessageKind,
    rich_text: Vec<RichTextSegment>,
    monetary_annotation: Option<MonetaryAnnotation>,
    received_at: DateTime<Utc>,
) -> ChatMessage {
    let author_badges = convert_badges(&renderer.author_badges);
    let author_name = author_name(renderer.author_name.as_ref());

    ChatMessage {
        id: renderer
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| synthesize_id(raw)),
        kind,
        author_name,
        author_channel_id: renderer.author_external_channel_id,
        author_badges,
        rich_text,
        monetary_annotation,
        received_at,
    }
}

/// Gift purchases keep author and text inside a nested header renderer.
fn gift_purchase(raw: &RawEvent, renderer: ItemRenderer, received_at: DateTime<Utc>) -> ChatMessage {
    let header = renderer
        .header
        .as_ref()
        .and_then(|h| h.get("liveChatSponsorshipsHeaderRenderer"))
        .and_then(|h| ItemRenderer::deserialize(h).ok())
        .unwrap_or_default();

    let rich_text = header
        .header_primary_text
        .as_ref()
        .or(header.message.as_ref())
        .map(convert_runs)
        .or_else(|| {
            // スポンサーシップヘッダーは本文を primaryText に持つ
            renderer
                .header
                .as_ref()?
                .get("liveChatSponsorshipsHeaderRenderer")?
                .get("primaryText")
                .and_then(|v| Runs::deserialize(v).ok())
                .map(|runs| convert_runs(&runs))
        })
        .unwrap_or_default();

    let mut message = from_renderer(
        raw,
        ItemRenderer {
            author_name: renderer.author_name.clone().or(header.author_name),
            author_badges: if renderer.author_badges.is_empty() {
                header.author_badges
            } else {
                renderer.author_badges.clone()
            },
            ..renderer
        },
        MessageKind::MembershipGift,
        rich_text,
        None,
        received_at,
    );
    message.author_badges.insert(AuthorBadge::Member);
    message
}

fn author_name(runs: Option<&Runs>) -> String {
    let name = runs_text(runs);
    if name.trim().is_empty() {
        DEFAULT_AUTHOR_NAME.to_string()
    } else {
        name
    }
}

fn runs_text(runs: Option<&Runs>) -> String {
    let Some(runs) = runs else {
        return String::new();
    };
    if let Some(simple) = &runs.simple_text {
        return simple.clone();
    }
    runs.runs
        .iter()
        .filter_map(|run| run.text.as_deref())
        .collect()
}

/// Convert runs to segments, keeping their order. Text is not escaped here.
pub fn convert_runs(runs: &Runs) -> Vec<RichTextSegment> {
    if runs.runs.is_empty() {
        return runs
            .simple_text
            .as_ref()
            .map(|text| vec![RichTextSegment::text(text.clone())])
            .unwrap_or_default();
    }

    runs.runs
        .iter()
        .filter_map(|run| {
            if let Some(text) = &run.text {
                return Some(RichTextSegment::text(text.clone()));
            }
            let emoji = run.emoji.as_ref()?;
            let url = emoji
                .image
                .thumbnails
                .first()
                .map(|t| t.url.clone())
                .unwrap_or_default();
            let alt = emoji
                .image
                .accessibility
                .as_ref()
                .map(|a| a.accessibility_data.label.clone())
                .filter(|label| !label.is_empty())
                .or_else(|| emoji.shortcuts.first().cloned())
                .unwrap_or_else(|| emoji.emoji_id.clone());
            Some(RichTextSegment::image(url, alt))
        })
        .collect()
}

fn convert_badges(badges: &[AuthorBadgeWrapper]) -> BTreeSet<AuthorBadge> {
    let mut result = BTreeSet::new();

    for badge in badges {
        let renderer = &badge.renderer;
        let icon = renderer
            .icon
            .as_ref()
            .map(|i| i.icon_type.as_str())
            .unwrap_or_default();
        let label = renderer
            .accessibility
            .as_ref()
            .map(|a| a.accessibility_data.label.as_str())
            .unwrap_or_default();
        let tooltip = renderer.tooltip.as_str();
        let mentions = |needle: &str| tooltip.contains(needle) || label.contains(needle);

        if icon == "OWNER" || mentions("Owner") || mentions("所有者") {
            result.insert(AuthorBadge::Owner);
        } else if icon == "MODERATOR" || mentions("Moderator") || mentions("モデレーター") {
            result.insert(AuthorBadge::Moderator);
        } else if renderer.custom_thumbnail.is_some()
            || mentions("Member")
            || mentions("member")
            || mentions("メンバー")
        {
            // メンバーバッジはカスタムサムネイル付き
            result.insert(AuthorBadge::Member);
        }
    }

    result
}
