//! # flow — Program-flow Ranking Cache
//!
//! เก็บอันดับ Top N ของ instrument ตามยอด Program net-buy
//! Refresh เป็นรอบผ่าน Job queue (timer แค่ enqueue ไม่เคยแตะ cache ตรงๆ)
//!
//! Snapshot ถูกสลับทั้งก้อนเสมอ — ผู้อ่านเห็น list เก่าทั้งชุดหรือใหม่ทั้งชุด
//! ไม่มีทางเห็นครึ่งๆ กลางๆ

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::BotError;
use crate::provider::{MarketData, MarketSegment};

/// 1 แถวของอันดับ — ตำแหน่งใน list คือ rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub code: String,
    /// ยอด Program net-buy (หน่วยสกุลเงิน)
    pub net_buy_amount: i64,
}

/// Cache ที่ผู้อ่านหลายฝั่ง snapshot ได้โดยไม่บล็อกกัน
#[derive(Clone, Default)]
pub struct ProgramFlowCache {
    inner: Arc<RwLock<Arc<Vec<FlowEntry>>>>,
}

impl ProgramFlowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot ปัจจุบัน — clone แค่ Arc, ไม่ copy ข้อมูล
    pub async fn snapshot(&self) -> Arc<Vec<FlowEntry>> {
        self.inner.read().await.clone()
    }

    /// สลับ list ทั้งก้อน
    pub async fn replace(&self, entries: Vec<FlowEntry>) {
        *self.inner.write().await = Arc::new(entries);
    }
}

/// รวมผลจาก 2 segment: ตัด code ซ้ำ (เก็บยอดที่สูงกว่า), เรียงมากไปน้อย,
/// ตัดเหลือ Top `count`
pub fn build_ranking(
    mut entries: Vec<FlowEntry>,
    more: Vec<FlowEntry>,
    count: usize,
) -> Vec<FlowEntry> {
    entries.extend(more);

    let mut merged: Vec<FlowEntry> = Vec::with_capacity(entries.len());
    for entry in entries {
        match merged.iter_mut().find(|e| e.code == entry.code) {
            Some(existing) => {
                if entry.net_buy_amount > existing.net_buy_amount {
                    existing.net_buy_amount = entry.net_buy_amount;
                }
            }
            None => merged.push(entry),
        }
    }

    merged.sort_by(|a, b| b.net_buy_amount.cmp(&a.net_buy_amount));
    merged.truncate(count);
    merged
}

/// ทำ 1 รอบ refresh: query ทั้ง 2 segment → จัดอันดับ → สลับ cache
///
/// ถ้า query พลาด คืน `Err` โดยไม่แตะ cache — snapshot เดิมยังใช้ได้ต่อ
pub async fn refresh_program_flow(
    provider: &dyn MarketData,
    cache: &ProgramFlowCache,
    count: usize,
) -> Result<usize, BotError> {
    let kospi = provider.program_flow(MarketSegment::Kospi).await?;
    let kosdaq = provider.program_flow(MarketSegment::Kosdaq).await?;

    debug!(
        kospi  = kospi.len(),
        kosdaq = kosdaq.len(),
        "program flow segments fetched"
    );

    let ranking = build_ranking(kospi, kosdaq, count);
    let total = ranking.len();
    cache.replace(ranking).await;

    Ok(total)
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::models::Candle;
    use crate::provider::BrokerVolume;

    fn entry(code: &str, amount: i64) -> FlowEntry {
        FlowEntry { code: code.to_string(), net_buy_amount: amount }
    }

    /// MarketData ที่ program-flow query พังตลอด
    struct BrokenProvider;

    #[async_trait]
    impl MarketData for BrokenProvider {
        async fn screen_condition(&self, _: &str) -> Result<Vec<String>, BotError> {
            Ok(Vec::new())
        }
        async fn minute_candles(
            &self,
            _: &str,
            _: u32,
            _: usize,
        ) -> Result<Vec<Candle>, BotError> {
            Ok(Vec::new())
        }
        async fn broker_volumes(&self, _: &str) -> Result<Vec<BrokerVolume>, BotError> {
            Ok(Vec::new())
        }
        async fn program_flow(&self, _: MarketSegment) -> Result<Vec<FlowEntry>, BotError> {
            Err(BotError::Bridge("segment query outage".into()))
        }
        async fn instrument_name(&self, code: &str) -> Result<String, BotError> {
            Ok(code.to_string())
        }
    }

    #[test]
    fn test_build_ranking_sorts_and_truncates() {
        let a = vec![entry("111", 50), entry("222", 900)];
        let b = vec![entry("333", 300), entry("444", 10)];

        let ranking = build_ranking(a, b, 3);
        let codes: Vec<&str> = ranking.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["222", "333", "111"]);
    }

    #[test]
    fn test_build_ranking_dedupes_keeping_larger_amount() {
        let a = vec![entry("111", 50), entry("222", 900)];
        let b = vec![entry("111", 700)];

        let ranking = build_ranking(a, b, 10);
        assert_eq!(ranking.len(), 2);
        assert_eq!(ranking[0], entry("222", 900));
        assert_eq!(ranking[1], entry("111", 700));
    }

    #[tokio::test]
    async fn test_refresh_failure_retains_previous_snapshot() {
        let cache = ProgramFlowCache::new();
        cache.replace(vec![entry("111", 1)]).await;

        let result = refresh_program_flow(&BrokenProvider, &cache, 50).await;
        assert!(result.is_err());

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].code, "111");
    }

    #[tokio::test]
    async fn test_snapshot_swap_is_wholesale() {
        let cache = ProgramFlowCache::new();
        cache.replace(vec![entry("111", 1), entry("222", 2)]).await;

        // ผู้อ่านที่ถือ snapshot เก่าไว้ ไม่เห็นการสลับที่เกิดทีหลัง
        let before = cache.snapshot().await;
        cache.replace(vec![entry("333", 3)]).await;
        let after = cache.snapshot().await;

        assert_eq!(before.len(), 2);
        assert_eq!(before[0].code, "111");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].code, "333");
    }
}
