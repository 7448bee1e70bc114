use std::{fmt::Write, future::Future, pin::Pin, time::Duration};

use arch_bot_commons::{teloxide_retry, useful_methods::*};
use html_escape::encode_text;
use teloxide::{
    types::{BotCommand, ChatId, Me, Message, UserId},
    Bot, RequestError,
};

use crate::{
    database::{AssignOutcome, Database, SubscriptionStatus, UserOverview},
    list_store::AssignResult,
    Handle, ListKind,
};

pub const COMMANDS: &[Command] = &[
    START,
    HELP,
    WATCH,
    BAN,
    UNWATCH,
    UNBAN,
    STATUS,
    ____SEPARATOR,
    APPROVE,
    ADDADMIN,
    BROADCAST,
    STATS,
];

pub type Ret = Result<(), RequestError>;
pub type CommandFuture<'a> = Pin<Box<dyn Future<Output = Ret> + Send + 'a>>;

pub struct CommandParams<'a> {
    pub database: &'a Database,
    pub bot: &'a Bot,
    pub bot_me: &'a Me,
    pub message: &'a Message,
    pub sender: UserId,
    pub message_text: &'a str,
    pub command_len: usize,
}

impl<'a> CommandParams<'a> {
    pub fn new<'new>(
        database: &'new Database,
        bot: &'new Bot,
        bot_me: &'new Me,
        message: &'new Message,
        sender: UserId,
    ) -> Option<CommandParams<'new>> {
        let message_text = message.text_full()?;

        if !message_text.starts_with('/') {
            return None;
        }

        let command = message_text.split_whitespace().next()?;

        if !command.is_ascii() {
            // Telegram commands must be ASCII.
            // See https://core.telegram.org/bots/api#botcommand
            return None;
        }

        let command_len = command.len();

        Some(CommandParams {
            database,
            bot,
            bot_me,
            message,
            sender,
            message_text,
            command_len,
        })
    }

    /// Find the command this is and start running it. [`None`] if it's not one of ours.
    pub fn run(self) -> Option<CommandFuture<'a>> {
        let callname = self.callname()?;
        for command in COMMANDS {
            if command.is_matching_callname(callname) {
                return Some((command.function)(self));
            }
        }
        None
    }

    /// The command without any `@BotName` suffix, or [`None`] if the suffix names some
    /// other bot.
    pub fn callname(&self) -> Option<&'a str> {
        let command = &self.message_text[..self.command_len];
        let Some(username_start) = command.find('@') else {
            return Some(command);
        };

        // Bot names are guaranteed ASCII, so ignore ASCII case specifically.
        command[username_start + '@'.len_utf8()..]
            .eq_ignore_ascii_case(self.bot_me.username())
            .then(|| &command[..username_start])
    }

    /// Get text parameters for this command.
    ///
    /// If the input command is `/watch @alice`, this will be the substring `@alice`.
    #[inline]
    pub fn get_params(&self) -> &'a str {
        self.message_text[self.command_len..].trim_start()
    }

    async fn reply(&self, text: &str) -> Ret {
        self.bot
            .archsendmsg(self.message.chat.id, text, Some(self.message.id))
            .await?;
        Ok(())
    }
}

pub struct Command {
    pub callname: &'static str,
    pub description: &'static str,
    pub function: fn(CommandParams) -> CommandFuture,
    /// Admin-only commands are hidden from the command list and from regular users' help.
    hidden: bool,
}

impl Command {
    pub fn is_matching_callname(&self, command: &str) -> bool {
        self.callname
            .split_ascii_whitespace()
            .next()
            .is_some_and(|x| x.eq_ignore_ascii_case(command))
    }

    pub fn get_help(&self, mut output: impl std::fmt::Write) -> Result<(), std::fmt::Error> {
        // useful for the separator "command"
        if self.callname.is_empty() && self.description.is_empty() {
            return Ok(());
        }

        output.write_str(self.callname)?;
        if !self.description.is_empty() {
            output.write_str(" - ")?;
            output.write_str(self.description)?;
        }

        Ok(())
    }

    pub fn generate_help(include_hidden: bool) -> String {
        let mut response = String::from("<b>COMMANDS</b>\n\n");
        for command in COMMANDS {
            if command.hidden && !include_hidden {
                continue;
            }
            if command.get_help(&mut response).is_ok() && !command.callname.is_empty() {
                response.push('\n');
            }
        }
        response.trim_end().to_string()
    }

    pub fn generate_bot_commands() -> Vec<BotCommand> {
        let mut output = Vec::new();

        for command in COMMANDS {
            if command.hidden {
                continue;
            }
            let Some(callname) = command.callname.split_ascii_whitespace().next() else {
                continue;
            };

            // Cut off the /
            let callname = callname[1..].trim().to_string();
            let description = command
                .description
                .replace("&lt;", "<")
                .replace("&gt;", ">");

            output.push(BotCommand {
                command: callname,
                description,
            });
        }

        output
    }
}

///////////////////////////////////////
/////////////////COMMAND DEFINITIONS
///////////////////////////////////////

/// Wraps the function's return value in a pinning closure.
macro_rules! wrap {
    ($thing:expr) => {
        |cp| Box::pin($thing(cp))
    };
    ($thing:expr, $($arg:expr),+) => {
        |cp| Box::pin($thing(cp, $($arg),+))
    };
}

/// Bail out of an admin command if the sender isn't allowed to use it.
macro_rules! admins_only {
    ($cp:expr) => {
        if !$cp.database.is_admin($cp.sender).await {
            return $cp.reply("❌ Admin access required.").await;
        }
    };
}

// Usage lines, shared by the command table and the bodies that print them on bad input.
const WATCH_USAGE: &str = "/watch &lt;username&gt;";
const BAN_USAGE: &str = "/ban &lt;username&gt;";
const UNWATCH_USAGE: &str = "/unwatch &lt;username&gt;";
const UNBAN_USAGE: &str = "/unban &lt;username&gt;";
const APPROVE_USAGE: &str = "/approve &lt;user_id&gt; &lt;days&gt;";
const ADDADMIN_USAGE: &str = "/addadmin &lt;user_id&gt;";
const BROADCAST_USAGE: &str = "/broadcast &lt;text&gt;";

pub const ____SEPARATOR: Command = Command {
    callname: "",
    description: "",
    function: wrap!(start),
    hidden: true,
};

pub const START: Command = Command {
    callname: "/start",
    description: "Welcome message and your account summary.",
    function: wrap!(start),
    hidden: false,
};

pub const HELP: Command = Command {
    callname: "/help",
    description: "Show this help.",
    function: wrap!(help),
    hidden: false,
};

pub const WATCH: Command = Command {
    callname: WATCH_USAGE,
    description: "Watch a live account and get alerted when it gets banned.",
    function: wrap!(assign, ListKind::Watched),
    hidden: false,
};

pub const BAN: Command = Command {
    callname: BAN_USAGE,
    description: "Watch a banned account and get alerted when it comes back.",
    function: wrap!(assign, ListKind::Flagged),
    hidden: false,
};

pub const UNWATCH: Command = Command {
    callname: UNWATCH_USAGE,
    description: "Stop watching an account on your watch list.",
    function: wrap!(remove, ListKind::Watched),
    hidden: false,
};

pub const UNBAN: Command = Command {
    callname: UNBAN_USAGE,
    description: "Stop watching an account on your ban list.",
    function: wrap!(remove, ListKind::Flagged),
    hidden: false,
};

pub const STATUS: Command = Command {
    callname: "/status",
    description: "Your lists and subscription.",
    function: wrap!(status),
    hidden: false,
};

pub const APPROVE: Command = Command {
    callname: APPROVE_USAGE,
    description: "Give a user a subscription for that many days.",
    function: wrap!(approve),
    hidden: true,
};

pub const ADDADMIN: Command = Command {
    callname: ADDADMIN_USAGE,
    description: "Make a user an admin. Owner only.",
    function: wrap!(addadmin),
    hidden: true,
};

pub const BROADCAST: Command = Command {
    callname: BROADCAST_USAGE,
    description: "Send a message to every user of the bot.",
    function: wrap!(broadcast),
    hidden: true,
};

pub const STATS: Command = Command {
    callname: "/stats",
    description: "Bot-wide statistics.",
    function: wrap!(stats),
    hidden: true,
};

fn cap_text(cap: Option<usize>) -> String {
    cap.map_or_else(|| "∞".to_string(), |cap| cap.to_string())
}

fn handle_list_text(handles: &[Handle]) -> String {
    if handles.is_empty() {
        return "• None".to_string();
    }
    handles
        .iter()
        .map(|h| format!("• <code>{}</code>", encode_text(&h.to_string())))
        .collect::<Vec<_>>()
        .join("\n")
}

fn subscription_text(subscription: &SubscriptionStatus) -> String {
    match subscription {
        SubscriptionStatus::NoSubscription | SubscriptionStatus::Expired(_) => format!(
            "{subscription}. Ask an admin for <code>/approve</code> to start monitoring."
        ),
        _ => subscription.to_string(),
    }
}

/// The `/status` message.
pub(super) fn status_text(user: UserId, overview: &UserOverview) -> String {
    let mut text = String::from("<b>YOUR STATUS</b>\n\n");
    // Writing to a String never fails.
    let _ = writeln!(text, "<b>User ID:</b> <code>{user}</code>");
    let _ = writeln!(text, "<b>Role:</b> {}", overview.role);
    let _ = writeln!(
        text,
        "<b>Subscription:</b> {}",
        subscription_text(&overview.subscription)
    );
    let _ = write!(
        text,
        "\n<b>WATCH LIST</b> ({}/{})\n{}\n\n<b>BAN LIST</b> ({})\n{}\n\n",
        overview.watched.len(),
        cap_text(overview.cap),
        handle_list_text(&overview.watched),
        overview.flagged.len(),
        handle_list_text(&overview.flagged),
    );
    let _ = write!(
        text,
        "<b>Sweeps so far:</b> {}\n<b>Alerts sent:</b> {}",
        overview.stats.total_sweeps, overview.stats.alerts_sent
    );
    text
}

/// What to say back to `/watch` or `/ban`.
pub(super) fn assign_reply(
    handle: &Handle,
    list: ListKind,
    outcome: AssignOutcome,
    counts: (usize, Option<usize>),
) -> String {
    let name = encode_text(&handle.to_string()).to_string();
    let (watched, cap) = counts;
    match outcome {
        AssignOutcome::Assigned(AssignResult::Added) => match list {
            ListKind::Watched => format!(
                "✅ Now watching <code>{name}</code>. You'll be alerted once it's confirmed banned.\nWatch list: {watched}/{}",
                cap_text(cap)
            ),
            ListKind::Flagged => format!(
                "✅ Added <code>{name}</code> to your ban list. You'll be alerted once it's confirmed back."
            ),
        },
        AssignOutcome::Assigned(AssignResult::AlreadyPresent(list)) => {
            format!("<code>{name}</code> is already on your {list}.")
        }
        AssignOutcome::Assigned(AssignResult::MovedFromOtherList(from)) => {
            format!("🔄 Moved <code>{name}</code> from your {from} to your {list}.")
        }
        AssignOutcome::SubscriptionInactive(subscription) => {
            format!("❌ You can't add accounts: {}", subscription_text(&subscription))
        }
        AssignOutcome::CapacityExceeded { cap } => format!(
            "❌ You've reached your limit of {cap} watched accounts. Remove one with <code>/unwatch</code> first."
        ),
        AssignOutcome::TakenByAnotherUser => {
            format!("❌ <code>{name}</code> is already being tracked by another user.")
        }
    }
}

async fn start(cp: CommandParams<'_>) -> Ret {
    let overview = cp.database.overview(cp.sender).await;
    let name = cp
        .message
        .from
        .as_ref()
        .map_or_else(|| "there".to_string(), |u| encode_text(&u.first_name).to_string());

    let text = format!(
        concat!(
            "👋 Hi {}!\n\n",
            "This bot watches accounts for you. Put live accounts on your watch list to ",
            "hear when they get banned, and banned ones on your ban list to hear when ",
            "they come back. A change is only reported after it was seen {} checks in a ",
            "row, so flukes don't wake you up.\n\n",
            "<b>Role:</b> {}\n",
            "<b>Subscription:</b> {}\n",
            "<b>Watching:</b> {}/{}\n\n",
            "Send /help for the list of commands."
        ),
        name,
        crate::CONFIRMATION_THRESHOLD,
        overview.role,
        subscription_text(&overview.subscription),
        overview.watched.len(),
        cap_text(overview.cap),
    );
    cp.reply(&text).await
}

async fn help(cp: CommandParams<'_>) -> Ret {
    let is_admin = cp.database.is_admin(cp.sender).await;
    cp.reply(&Command::generate_help(is_admin)).await
}

async fn assign(cp: CommandParams<'_>, list: ListKind) -> Ret {
    let Some(handle) = Handle::parse(cp.get_params()) else {
        let usage = match list {
            ListKind::Watched => WATCH_USAGE,
            ListKind::Flagged => BAN_USAGE,
        };
        return cp.reply(&format!("Usage: <code>{usage}</code>")).await;
    };

    let outcome = cp.database.request_assign(cp.sender, &handle, list).await;
    log::debug!("{} asked to put {handle} on the {list}: {outcome:?}", cp.sender);

    let counts = {
        let state = cp.database.lock().await;
        (
            state.lists.count_for(cp.sender, ListKind::Watched),
            state.cap_for(cp.sender),
        )
    };
    cp.reply(&assign_reply(&handle, list, outcome, counts)).await
}

async fn remove(cp: CommandParams<'_>, list: ListKind) -> Ret {
    let Some(handle) = Handle::parse(cp.get_params()) else {
        let usage = match list {
            ListKind::Watched => UNWATCH_USAGE,
            ListKind::Flagged => UNBAN_USAGE,
        };
        return cp.reply(&format!("Usage: <code>{usage}</code>")).await;
    };

    let name = encode_text(&handle.to_string()).to_string();
    let text = if cp.database.remove(cp.sender, &handle, list).await {
        format!("🗑 Removed <code>{name}</code> from your {list}.")
    } else {
        format!("<code>{name}</code> isn't on your {list}.")
    };
    cp.reply(&text).await
}

async fn status(cp: CommandParams<'_>) -> Ret {
    let overview = cp.database.overview(cp.sender).await;
    cp.reply(&status_text(cp.sender, &overview)).await
}

/// Longest subscription `/approve` hands out, about a century.
const MAX_APPROVE_DAYS: u32 = 36_500;

/// Parse `<user_id> <days>`, with `days` in `1..=MAX_APPROVE_DAYS`.
pub(super) fn parse_approve_params(params: &str) -> Option<(UserId, u32)> {
    let mut iter = params.split_whitespace();
    let user = iter.next()?.parse().ok()?;
    let days = iter
        .next()?
        .parse()
        .ok()
        .filter(|days| (1..=MAX_APPROVE_DAYS).contains(days))?;
    if iter.next().is_some() {
        return None;
    }
    Some((UserId(user), days))
}

async fn approve(cp: CommandParams<'_>) -> Ret {
    admins_only!(cp);

    let Some((user, days)) = parse_approve_params(cp.get_params()) else {
        return cp
            .reply(&format!("Usage: <code>{APPROVE_USAGE}</code>"))
            .await;
    };

    let Some(expiry) = cp.database.approve(user, days).await else {
        return cp
            .reply(&format!("❌ Can't approve for {days} days, that's too far ahead."))
            .await;
    };
    log::info!("{} approved {user} for {days} days", cp.sender);

    let expiry = expiry.format("%Y-%m-%d %H:%M UTC");
    cp.reply(&format!(
        "✅ User <code>{user}</code> is approved for {days} days, until {expiry}."
    ))
    .await?;

    // They might have never started the bot, in which case this fails. That's fine.
    let _ = teloxide_retry!(
        cp.bot
            .archsendmsg(
                ChatId::from(user),
                &format!(
                    "🎉 Your subscription is active for {days} days, until {expiry}. Start with /watch!"
                ),
                None,
            )
            .await
    );
    Ok(())
}

async fn addadmin(cp: CommandParams<'_>) -> Ret {
    if !cp.database.is_owner(cp.sender).await {
        return cp.reply("❌ Only the owner can add admins.").await;
    }

    let Ok(user) = cp.get_params().trim().parse() else {
        return cp
            .reply(&format!("Usage: <code>{ADDADMIN_USAGE}</code>"))
            .await;
    };
    let user = UserId(user);

    let text = if cp.database.add_admin(user).await {
        log::info!("{user} is now an admin");
        format!("✅ <code>{user}</code> is now an admin.")
    } else {
        format!("<code>{user}</code> already is an admin.")
    };
    cp.reply(&text).await
}

async fn broadcast(cp: CommandParams<'_>) -> Ret {
    admins_only!(cp);

    let text = cp.get_params();
    if text.is_empty() {
        return cp
            .reply(&format!("Usage: <code>{BROADCAST_USAGE}</code>"))
            .await;
    }
    let text = format!("📢 <b>ANNOUNCEMENT</b>\n\n{}", encode_text(text));

    let users = cp.database.registered_users().await;
    log::info!("{} is broadcasting to {} users", cp.sender, users.len());

    let mut sent = 0;
    let mut failed = 0;
    for user in users {
        match teloxide_retry!(cp.bot.archsendmsg(ChatId::from(user), &text, None).await) {
            Ok(_) => sent += 1,
            Err(e) => {
                log::debug!("Broadcast to {user} failed: {e}");
                failed += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    cp.reply(&format!(
        "📢 Broadcast done. Sent: {sent}, failed: {failed}."
    ))
    .await
}

async fn stats(cp: CommandParams<'_>) -> Ret {
    admins_only!(cp);

    let stats = cp.database.global_stats().await;
    let text = format!(
        concat!(
            "<b>BOT STATISTICS</b>\n\n",
            "<b>Users:</b> {}\n",
            "<b>Admins:</b> {}\n",
            "<b>Active subscriptions:</b> {}\n\n",
            "<b>Watch list:</b> {}\n",
            "<b>Ban list:</b> {}\n",
            "<b>Total monitored:</b> {}\n\n",
            "<b>Sweeps:</b> {}\n",
            "<b>Alerts sent:</b> {}"
        ),
        stats.users,
        stats.admins,
        stats.active_subscriptions,
        stats.watched,
        stats.flagged,
        stats.watched + stats.flagged,
        stats.stats.total_sweeps,
        stats.stats.alerts_sent,
    );
    cp.reply(&text).await
}
