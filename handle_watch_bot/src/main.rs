use arch_bot_commons::*;

fn main() {
    start_everything("WARN,handle_watch_bot=debug", handle_watch_bot::entry());
}
