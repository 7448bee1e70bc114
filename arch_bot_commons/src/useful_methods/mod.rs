use std::future::Future;

use teloxide::{
    payloads::SendMessageSetters,
    requests::Requester,
    sugar::request::RequestReplyExt,
    types::{ChatId, Message, MessageId, ParseMode},
    Bot, RequestError,
};

/// Telegram refuses messages longer than this.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

pub trait MessageStuff {
    /// Text of the message, or its caption if it's media.
    fn text_full(&self) -> Option<&str>;
}

impl MessageStuff for Message {
    fn text_full(&self) -> Option<&str> {
        self.text().or_else(|| self.caption())
    }
}

pub trait BotArchSendMsg {
    /// Send an HTML-formatted message, optionally as a reply. If it's too long for one
    /// message, it gets split on line boundaries and sent as several, and the last one
    /// sent is returned.
    fn archsendmsg(
        &self,
        to: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> impl Future<Output = Result<Message, RequestError>> + Send;
}

impl BotArchSendMsg for Bot {
    async fn archsendmsg(
        &self,
        to: ChatId,
        text: &str,
        reply_to: Option<MessageId>,
    ) -> Result<Message, RequestError> {
        let mut chunks = split_by_lines(text, MAX_MESSAGE_LENGTH).into_iter();

        // An empty text still yields one (empty) chunk, so there's always something here.
        let mut last = chunks.next().unwrap_or_default();
        for next in chunks {
            send_one(self, to, last, reply_to).await?;
            last = next;
        }

        send_one(self, to, last, reply_to).await
    }
}

async fn send_one(
    bot: &Bot,
    to: ChatId,
    text: String,
    reply_to: Option<MessageId>,
) -> Result<Message, RequestError> {
    let mut request = bot.send_message(to, text).parse_mode(ParseMode::Html);
    if let Some(reply_to) = reply_to {
        request = request.reply_to(reply_to);
    }
    request.await
}

/// Split `text` into pieces of at most `max_chars` characters each, preferring to cut
/// between lines. A single line that is too long by itself is cut wherever it must be.
///
/// Always returns at least one piece.
#[must_use]
pub fn split_by_lines(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split('\n') {
        let line_len = line.chars().count();
        // +1 for the newline joining it to what's already there.
        let joined_len = if current.is_empty() {
            line_len
        } else {
            current_len + 1 + line_len
        };

        if joined_len <= max_chars {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len = joined_len;
            continue;
        }

        if !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
        }

        let mut chars = line.chars().peekable();
        current_len = 0;
        while chars.peek().is_some() {
            let piece: String = chars.by_ref().take(max_chars).collect();
            current_len = piece.chars().count();
            if current_len == max_chars && chars.peek().is_some() {
                pieces.push(piece);
            } else {
                current = piece;
            }
        }
    }

    if !current.is_empty() || pieces.is_empty() {
        pieces.push(current);
    }

    pieces
}
