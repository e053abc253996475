//! # provider — Brokerage Bridge Adapter
//!
//! ทุกอย่างที่ต้องวิ่งออก network ไปหา brokerage session ผ่าน trait เดียว:
//! Screener, แท่งย้อนหลัง, ยอดโบรกเกอร์, Program flow, ชื่อ instrument
//!
//! ## Data Source
//! [`BridgeClient`] คุยกับ bridge process (ตัวที่ login กับโบรกเกอร์จริง)
//! ผ่าน JSON-over-HTTP — engine ไม่เคยถือ session เอง
//!
//! ทุก TR query มี rate limit ฝั่ง server — client บังคับช่องว่างขั้นต่ำ
//! ระหว่าง call ให้เองก่อนยิง

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::BotError;
use crate::flow::FlowEntry;
use crate::models::{Candle, Tick};

/// ช่องว่างขั้นต่ำระหว่าง TR query (bridge โดน rate limit ฝั่งโบรกเกอร์)
const TR_REQUEST_GAP: Duration = Duration::from_millis(200);

/// Timeout ต่อ 1 TR query
const TR_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Market Segment ───────────────────────────────────────────────────────────

/// ตลาดที่ Program-flow query รองรับ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketSegment {
    Kospi,
    Kosdaq,
}

impl MarketSegment {
    /// รหัสตลาดตามที่ bridge รับ
    pub fn as_query(&self) -> &'static str {
        match self {
            MarketSegment::Kospi  => "001",
            MarketSegment::Kosdaq => "101",
        }
    }
}

// ─── Broker Volume ────────────────────────────────────────────────────────────

/// ยอดซื้อ/ขายวันนี้ของโบรกเกอร์รายใหญ่ 1 ราย
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerVolume {
    pub broker:      String,
    pub buy_volume:  i64,
    pub sell_volume: i64,
}

// ─── MarketData Trait ─────────────────────────────────────────────────────────

/// Seam ของ external MarketDataProvider — Slow filter กับ flow cache
/// เรียกผ่าน trait นี้เท่านั้น ทำให้ test ด้วย mock ได้ตรงๆ
#[async_trait]
pub trait MarketData: Send + Sync {
    /// รัน saved condition บน Screener → universe ของ code ที่จะ monitor
    async fn screen_condition(&self, condition: &str) -> Result<Vec<String>, BotError>;

    /// แท่ง `tick_unit` นาทีล่าสุด `count` แท่ง เรียงใหม่ → เก่า
    async fn minute_candles(
        &self,
        code: &str,
        tick_unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, BotError>;

    /// ยอดซื้อ/ขายของโบรกเกอร์รายใหญ่วันนี้สำหรับ instrument นี้
    async fn broker_volumes(&self, code: &str) -> Result<Vec<BrokerVolume>, BotError>;

    /// อันดับ Program net-buy ของ 1 segment
    async fn program_flow(&self, segment: MarketSegment) -> Result<Vec<FlowEntry>, BotError>;

    /// ชื่อ instrument สำหรับแสดงผล
    async fn instrument_name(&self, code: &str) -> Result<String, BotError>;
}

// ─── Bridge Client ────────────────────────────────────────────────────────────

/// HTTP client ไปหา bridge process
pub struct BridgeClient {
    client:   reqwest::Client,
    base_url: String,
    /// เวลา TR query ล่าสุด — ใช้บังคับ [`TR_REQUEST_GAP`]
    last_request: Mutex<Option<Instant>>,
}

// Response envelope ของแต่ละ endpoint

#[derive(Debug, Deserialize)]
struct ScreenResponse {
    codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<Candle>,
}

#[derive(Debug, Deserialize)]
struct BrokerVolumesResponse {
    brokers: Vec<BrokerVolume>,
}

#[derive(Debug, Deserialize)]
struct ProgramFlowResponse {
    entries: Vec<FlowEntry>,
}

#[derive(Debug, Deserialize)]
struct NameResponse {
    name: String,
}

impl BridgeClient {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url,
            last_request: Mutex::new(None),
        }
    }

    /// รอจนพ้นช่องว่างขั้นต่ำจาก TR ก่อนหน้า แล้ว stamp เวลาใหม่
    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < TR_REQUEST_GAP {
                tokio::time::sleep(TR_REQUEST_GAP - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// GET 1 ครั้ง + map error แบบเดียวกันทุก endpoint
    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, BotError> {
        self.pace().await;

        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(query)
            .timeout(TR_TIMEOUT)
            .send()
            .await
            .map_err(|e| BotError::Bridge(format!("bridge unreachable: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Bridge(format!("bridge HTTP {status}: {body}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| BotError::Bridge(format!("bridge response parse error: {e}")))
    }

    /// Subscribe NDJSON tick stream แล้วส่งทุก frame ที่ parse ได้เข้า channel
    ///
    /// จบเมื่อ stream ปิด หรือ receiver ฝั่ง engine ถูก drop
    /// Frame ที่ parse ไม่ได้ → ข้าม + `warn!` (ไม่ฆ่า stream)
    pub async fn stream_ticks(&self, tx: mpsc::UnboundedSender<Tick>) -> Result<(), BotError> {
        let url = format!("{}/api/feed/ticks", self.base_url);
        info!(url = %url, "subscribing to live tick feed");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BotError::Bridge(format!("tick feed unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(BotError::Bridge(format!(
                "tick feed HTTP {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| BotError::Bridge(format!("tick feed read error: {e}")))?;
            buf.extend_from_slice(&chunk);

            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_slice::<Tick>(line) {
                    Ok(tick) => {
                        if tx.send(tick).is_err() {
                            debug!("engine dropped tick receiver — feed task ending");
                            return Ok(());
                        }
                    }
                    Err(e) => warn!(error = %e, "malformed tick frame skipped"),
                }
            }
        }

        info!("tick feed stream closed by bridge");
        Ok(())
    }
}

#[async_trait]
impl MarketData for BridgeClient {
    async fn screen_condition(&self, condition: &str) -> Result<Vec<String>, BotError> {
        let resp: ScreenResponse = self
            .get_json("/api/screen", &[("condition", condition)])
            .await?;
        Ok(resp.codes)
    }

    async fn minute_candles(
        &self,
        code: &str,
        tick_unit: u32,
        count: usize,
    ) -> Result<Vec<Candle>, BotError> {
        let unit = tick_unit.to_string();
        let count = count.to_string();
        let resp: CandlesResponse = self
            .get_json(
                "/api/candles/minute",
                &[("code", code), ("unit", unit.as_str()), ("count", count.as_str())],
            )
            .await?;
        Ok(resp.candles)
    }

    async fn broker_volumes(&self, code: &str) -> Result<Vec<BrokerVolume>, BotError> {
        let resp: BrokerVolumesResponse = self
            .get_json("/api/broker-volumes", &[("code", code)])
            .await?;
        Ok(resp.brokers)
    }

    async fn program_flow(&self, segment: MarketSegment) -> Result<Vec<FlowEntry>, BotError> {
        let resp: ProgramFlowResponse = self
            .get_json("/api/program-flow", &[("market", segment.as_query())])
            .await?;
        Ok(resp.entries)
    }

    async fn instrument_name(&self, code: &str) -> Result<String, BotError> {
        let resp: NameResponse = self.get_json("/api/name", &[("code", code)]).await?;
        Ok(resp.name)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_segment_query_codes() {
        assert_eq!(MarketSegment::Kospi.as_query(), "001");
        assert_eq!(MarketSegment::Kosdaq.as_query(), "101");
    }

    #[tokio::test]
    async fn test_pace_enforces_minimum_gap() {
        let client = BridgeClient::new(reqwest::Client::new(), String::new());

        let start = Instant::now();
        client.pace().await;
        client.pace().await;

        assert!(start.elapsed() >= TR_REQUEST_GAP);
    }
}
