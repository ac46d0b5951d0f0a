pub mod telegram;

pub use telegram::{format_alert, Notifier, TelegramNotifier};
