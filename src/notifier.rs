//! # notifier — ส่ง AlertEvent ออกช่องทางภายนอก
//!
//! ความล้มเหลวฝั่ง Notifier ไม่มีสิทธิ์หยุด pipeline — ทุก error ถูก log
//! แล้วกลืนตรงนี้ ไม่ propagate กลับไปหา engine

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::FilterConfig;
use crate::error::BotError;
use crate::models::alert::{format_amount, format_ratio};
use crate::models::AlertEvent;

const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Notifier Trait ───────────────────────────────────────────────────────────

#[async_trait]
pub trait Notifier: Send + Sync {
    /// ส่ง Alert 1 รายการ
    async fn send_alert(&self, alert: &AlertEvent);

    /// ประกาศเริ่ม monitoring พร้อมสรุป parameter
    async fn send_start(&self, condition: &str, universe: usize, config: &FilterConfig);

    /// ประกาศจบ monitoring
    async fn send_stop(&self);
}

// ─── Log-only Fallback ────────────────────────────────────────────────────────

/// ใช้เมื่อไม่ได้ตั้งค่า Telegram — Alert ยังเห็นครบใน log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_alert(&self, _alert: &AlertEvent) {}

    async fn send_start(&self, condition: &str, universe: usize, _config: &FilterConfig) {
        info!(condition, universe, "monitoring started (log-only notifier)");
    }

    async fn send_stop(&self) {
        info!("monitoring stopped (log-only notifier)");
    }
}

// ─── Telegram ─────────────────────────────────────────────────────────────────

/// Telegram Bot API response จาก `getMe`
#[derive(Debug, Deserialize)]
struct TelegramMe {
    ok: bool,
    result: Option<TelegramUser>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramSendResult {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramNotifier {
    client:    reqwest::Client,
    token:     String,
    chat_id:   String,
    /// ตั้งโดย [`TelegramNotifier::connect`] — ถ้ายังไม่ผ่าน ทุก send เป็น no-op
    connected: AtomicBool,
}

impl TelegramNotifier {
    /// คืน `None` ถ้า env ไม่ครบ — caller ควร fallback เป็น [`LogNotifier`]
    pub fn from_env(client: reqwest::Client) -> Option<Self> {
        let token = std::env::var("TELEBOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;

        Some(Self {
            client,
            token,
            chat_id,
            connected: AtomicBool::new(false),
        })
    }

    /// ตรวจ token กับ `getMe` — สำเร็จแล้วถึงจะเริ่มส่งข้อความจริง
    pub async fn connect(&self) -> Result<String, BotError> {
        let url = format!("https://api.telegram.org/bot{}/getMe", self.token);

        let response = self
            .client
            .get(&url)
            .timeout(TELEGRAM_TIMEOUT)
            .send()
            .await
            .map_err(|e| BotError::Notifier(format!("Telegram unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(BotError::Notifier(format!(
                "Telegram getMe HTTP {}",
                response.status()
            )));
        }

        let me: TelegramMe = response
            .json()
            .await
            .map_err(|e| BotError::Notifier(format!("Telegram getMe parse error: {e}")))?;

        if !me.ok {
            return Err(BotError::Notifier("Telegram getMe returned ok=false".into()));
        }

        let username = me
            .result
            .and_then(|u| u.username)
            .unwrap_or_else(|| "unknown".to_string());

        self.connected.store(true, Ordering::Release);
        info!(bot = %username, "✅ Telegram bot connected");

        Ok(username)
    }

    async fn send_message(&self, text: &str) -> Result<(), BotError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);

        let response = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id":    self.chat_id,
                "text":       text,
                "parse_mode": "Markdown",
            }))
            .timeout(TELEGRAM_TIMEOUT)
            .send()
            .await
            .map_err(|e| BotError::Notifier(format!("Telegram unreachable: {e}")))?;

        if !response.status().is_success() {
            let detail = response
                .json::<TelegramSendResult>()
                .await
                .ok()
                .and_then(|r| if r.ok { None } else { r.description })
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(BotError::Notifier(format!("Telegram send failed: {detail}")));
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_alert(&self, alert: &AlertEvent) {
        if !self.is_connected() {
            return;
        }
        if let Err(e) = self.send_message(&alert.to_markdown()).await {
            error!(error = %e, code = %alert.code, "alert delivery failed");
        }
    }

    async fn send_start(&self, condition: &str, universe: usize, config: &FilterConfig) {
        if !self.is_connected() {
            return;
        }

        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let message = format!(
            "✅ *Monitoring started*\n\n\
             ⏰ {now}\n\
             🔎 condition: `{condition}` ({universe} instruments)\n\
             min amount {} / lookback {} / multiplier {} / body-tail {}",
            format_amount(config.min_amount),
            config.lookback_candles,
            format_ratio(config.amount_multiplier),
            format_ratio(config.body_tail_ratio),
        );

        if let Err(e) = self.send_message(&message).await {
            warn!(error = %e, "start message delivery failed");
        }
    }

    async fn send_stop(&self) {
        if !self.is_connected() {
            return;
        }

        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let message = format!("✅ *Monitoring stopped*\n\n⏰ {now}");

        if let Err(e) = self.send_message(&message).await {
            warn!(error = %e, "stop message delivery failed");
        }
    }
}
