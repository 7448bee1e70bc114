use std::fmt::Write;

use arch_bot_commons::{teloxide_retry, useful_methods::BotArchSendMsg};
use chrono::{DateTime, Utc};
use html_escape::encode_text;
use teloxide::{types::UserId, Bot};
use tokio::sync::mpsc;

use crate::{Handle, ListKind, ProfileDetails};

/// A confirmed move of a handle between lists, to be told to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    pub owner: UserId,
    pub handle: Handle,
    pub from: ListKind,
    pub to: ListKind,
    pub details: Option<ProfileDetails>,
    pub at: DateTime<Utc>,
}

/// Takes alerts off the monitor's hands. By the time `notify` is called the move is
/// already committed, so whatever happens to the alert afterwards doesn't matter to it.
pub trait AlertSink: Send + Sync {
    fn notify(&self, event: AlertEvent);
}

/// [`AlertSink`] that queues alerts up for [`deliver_alerts_spinloop`].
#[derive(Debug, Clone)]
pub struct AlertQueue(mpsc::UnboundedSender<AlertEvent>);

impl AlertQueue {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlertEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self(sender), receiver)
    }
}

impl AlertSink for AlertQueue {
    fn notify(&self, event: AlertEvent) {
        if let Err(e) = self.0.send(event) {
            log::warn!("Alert delivery is gone, dropping alert for {}", e.0.handle);
        }
    }
}

/// Send every alert that comes in to its owner, until all senders are gone.
pub async fn deliver_alerts_spinloop(bot: Bot, mut receiver: mpsc::UnboundedReceiver<AlertEvent>) {
    while let Some(event) = receiver.recv().await {
        let text = format_alert(&event);
        if let Err(e) = teloxide_retry!(bot.archsendmsg(event.owner.into(), &text, None).await) {
            log::error!(
                "Failed to send alert about {} to {}: {e}",
                event.handle,
                event.owner
            );
        }
    }
    log::debug!("Alert delivery stopped.");
}

/// 1234567 -> "1,234,567"
fn group_thousands(number: u64) -> String {
    let digits = number.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    grouped
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

/// The HTML message an owner gets for this event.
#[must_use]
pub fn format_alert(event: &AlertEvent) -> String {
    let headline = match event.to {
        ListKind::Flagged => "🔴 <b>BANNED DETECTED</b>",
        ListKind::Watched => "🟢 <b>UNBANNED SUCCESSFULLY</b>",
    };

    let mut text = format!(
        "{headline}\n<b>Username:</b> <code>{}</code>\n<b>Moved:</b> {} → {}\n",
        encode_text(&event.handle.to_string()),
        event.from,
        event.to
    );

    if let Some(details) = &event.details {
        let name = details.name.as_deref().unwrap_or("N/A");
        // Writing to a String never fails.
        let _ = write!(
            text,
            concat!(
                "\n<b>ACCOUNT DETAILS</b>\n",
                "<b>Name:</b> {}\n",
                "<b>Followers:</b> {}\n",
                "<b>Following:</b> {}\n",
                "<b>Posts:</b> {}\n",
                "<b>Private:</b> {}\n",
                "<b>Verified:</b> {}\n",
                "<b>Business:</b> {}\n",
            ),
            encode_text(name),
            group_thousands(details.followers),
            group_thousands(details.following),
            group_thousands(details.posts),
            yes_no(details.private),
            yes_no(details.verified),
            yes_no(details.business),
        );
    }

    let _ = write!(
        text,
        "\n<b>Time:</b> {}",
        event.at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    text
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn event(to: ListKind, details: Option<ProfileDetails>) -> AlertEvent {
        AlertEvent {
            owner: UserId(1),
            handle: Handle::parse("alice").unwrap(),
            from: to.other(),
            to,
            details,
            at: DateTime::parse_from_rfc3339("2024-05-06T07:08:09Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }

    #[test]
    fn ban_alert() {
        let text = format_alert(&event(ListKind::Flagged, None));
        assert!(text.starts_with("🔴 <b>BANNED DETECTED</b>"));
        assert!(text.contains("<code>@alice</code>"));
        assert!(text.contains("watch list → ban list"));
        assert!(text.ends_with("2024-05-06 07:08:09 UTC"));
        assert!(!text.contains("ACCOUNT DETAILS"));
    }

    #[test]
    fn unban_alert_with_details() {
        let details = ProfileDetails {
            name: Some("<Alice & co>".to_string()),
            followers: 12345,
            verified: true,
            ..Default::default()
        };
        let text = format_alert(&event(ListKind::Watched, Some(details)));
        assert!(text.starts_with("🟢 <b>UNBANNED SUCCESSFULLY</b>"));
        assert!(text.contains("&lt;Alice &amp; co&gt;"));
        assert!(text.contains("<b>Followers:</b> 12,345"));
        assert!(text.contains("<b>Verified:</b> Yes"));
        assert!(text.contains("<b>Business:</b> No"));
    }

    #[tokio::test]
    async fn queue_hands_alerts_over() {
        let (queue, mut receiver) = AlertQueue::new();
        queue.notify(event(ListKind::Flagged, None));
        assert_eq!(receiver.recv().await.unwrap().to, ListKind::Flagged);

        // No receiver anymore. Must not panic.
        drop(receiver);
        queue.notify(event(ListKind::Watched, None));
    }
}
