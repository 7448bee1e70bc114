pub mod commands;
use arch_bot_commons::useful_methods::*;

use std::sync::Arc;

use teloxide::{
    types::{Me, Message},
    Bot, RequestError,
};

use crate::database::Database;
use commands::CommandParams;

pub async fn handle_message(
    bot: Bot,
    me: Me,
    message: Message,
    database: Arc<Database>,
) -> Result<(), RequestError> {
    let Some(sender) = message.from.as_ref().map(|from| from.id) else {
        // Channel posts and such.
        return Ok(());
    };
    // Bot ignores messages made by itself.
    if sender == me.id {
        return Ok(());
    }

    database.register_user(sender).await;

    let task = CommandParams::new(&database, &bot, &me, &message, sender).and_then(|cp| cp.run());

    let Some(task) = task else {
        // Don't talk back to random chatter in groups.
        if message.chat.is_private() {
            bot.archsendmsg(
                message.chat.id,
                "I only understand commands. Send /help for the list.",
                Some(message.id),
            )
            .await?;
        }
        return Ok(());
    };

    task.await
}
