//! Telegram notification client
//!
//! Delivers favorite-losing alerts via the Telegram Bot API

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::{debug, error};

use crate::config::TELEGRAM_API_URL;
use crate::error::{AppError, Result};
use crate::types::AlertContext;

/// One outbound message to a fixed channel. Ordinary delivery failures
/// (network, rate limit, auth) come back as `AppError::Delivery`, never a panic.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

/// Request body for sendMessage
#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

/// Telegram notifier
pub struct TelegramNotifier {
    base_url: String,
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: TELEGRAM_API_URL.to_string(),
            bot_token,
            chat_id,
            client,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);

        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
            disable_web_page_preview: true,
        };

        let resp = match self.client.post(&url).json(&request).send().await {
            Ok(r) => r,
            Err(e) => {
                // The request URL carries the bot token.
                let e = e.without_url();
                error!("Failed to send Telegram message: {e}");
                return Err(AppError::Delivery(format!("network: {e}")));
            }
        };

        let status = resp.status();
        if status.is_success() {
            debug!("Telegram message sent successfully");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        error!("Telegram API error: {status} - {body}");
        let kind = match status {
            StatusCode::TOO_MANY_REQUESTS => "rate limited",
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                "bot token or chat rejected"
            }
            _ => "rejected",
        };
        Err(AppError::Delivery(format!("{kind}: HTTP {status}")))
    }
}

/// Format a favorite-losing alert as a Telegram HTML message
pub fn format_alert(ctx: &AlertContext) -> String {
    let mut msg = String::new();

    msg.push_str("🚨 <b>FAVORITE LOSING</b> 🚨\n\n");
    msg.push_str(&format!(
        "⚽ <b>{}</b> vs <b>{}</b>\n",
        html_escape(&ctx.home_team),
        html_escape(&ctx.away_team)
    ));
    msg.push_str(&format!("🕐 Minute: <b>{}'</b>\n", ctx.minute));
    msg.push_str(&format!(
        "📊 Score: <b>{} - {}</b>\n",
        ctx.score.home, ctx.score.away
    ));
    msg.push_str(&format!(
        "😱 <b>{}</b> is losing!\n",
        html_escape(&ctx.favorite_team)
    ));
    msg.push_str(&format!("📉 Pre-match odds: <b>{:.2}</b>\n", ctx.favorite_odds));
    msg.push_str(&format!("🏆 League: {}", html_escape(&ctx.league)));

    msg
}

/// Escape HTML special characters
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Score;

    fn ctx() -> AlertContext {
        AlertContext {
            home_team: "Brighton & Hove Albion".to_string(),
            away_team: "Everton".to_string(),
            league: "Premier League".to_string(),
            favorite_team: "Brighton & Hove Albion".to_string(),
            favorite_odds: 1.3,
            minute: 58,
            score: Score::new(0, 1),
        }
    }

    #[test]
    fn alert_names_match_minute_and_score() {
        let msg = format_alert(&ctx());
        assert!(msg.contains("Brighton &amp; Hove Albion</b> vs <b>Everton"));
        assert!(msg.contains("Minute: <b>58'</b>"));
        assert!(msg.contains("Score: <b>0 - 1</b>"));
        assert!(msg.contains("Pre-match odds: <b>1.30</b>"));
        assert!(msg.contains("League: Premier League"));
    }

    #[tokio::test]
    async fn network_failure_does_not_expose_bot_token() {
        let mut notifier = TelegramNotifier::new(
            "123456:SECRET_BOT_TOKEN".to_string(),
            "-100123".to_string(),
            Duration::from_secs(2),
        )
        .unwrap();
        notifier.base_url = "http://127.0.0.1:1".to_string();

        let err = notifier.send("hello").await.unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
        assert!(!err.to_string().contains("SECRET_BOT_TOKEN"), "{err}");
    }

    #[test]
    fn escapes_markup_in_names() {
        assert_eq!(html_escape("<b>A&B</b>"), "&lt;b&gt;A&amp;B&lt;/b&gt;");
    }
}
