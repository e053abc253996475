//! # engine
//!
//! **Surge Detection Engine** — หัวใจของระบบทั้งหมด
//!
//! ```text
//!  Tick feed ──▶ CandleAggregator ──▶ AlertThrottle ──▶ FastFilterChain
//!                                                            │ pass
//!  Refresh timer ──▶ ┌──────────────┐ ◀── RunSlowFilters ────┘
//!                    │  Job queue   │
//!                    └──────┬───────┘
//!                           ▼ (worker เดียว drain)
//!              SlowFilterChain ──▶ AlertEvent ──▶ Notifier
//! ```
//!
//! ## Single-writer model
//! Worker ตัวเดียวเป็นเจ้าของ state ที่ mutate ได้ทั้งหมด (instrument states,
//! flow cache, throttle marker, in-flight gate) — Tick กับ Job วิ่งมารวมที่
//! loop เดียวผ่าน channel จึงไม่ต้องมี lock นอกจาก gate ของ TR
//!
//! ทุก iteration: drain job ที่ค้างอยู่ให้หมดก่อน แล้วค่อย pump ข้อความถัดไป
//! — Slow filter เลยรัน "ระหว่าง Tick" เสมอ ไม่เคย inline ใน tick path

pub mod aggregator;
pub mod dispatcher;
pub mod fast_filters;
pub mod slow_filters;
pub mod throttle;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::flow::{self, ProgramFlowCache};
use crate::models::{AlertEvent, Tick};
use crate::notifier::Notifier;
use crate::provider::MarketData;

use aggregator::CandleAggregator;
use dispatcher::{Dispatcher, Job, JobQueue, SlowJob};
use fast_filters::{check_fast_filters, FastFilterResult};
use slow_filters::{check_slow_filters, NetworkGate, SlowFilterResult};
use throttle::{AlertThrottle, ThrottleDecision};

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct Engine {
    config:   Arc<FilterConfig>,
    provider: Arc<dyn MarketData>,
    notifier: Arc<dyn Notifier>,

    aggregator: CandleAggregator,
    flow:       ProgramFlowCache,
    throttle:   AlertThrottle,
    gate:       Arc<NetworkGate>,
    /// ขา produce ของ queue — ใช้ส่ง slow job จาก tick path
    dispatcher: Dispatcher,

    tick_count:  u64,
    alert_count: u64,
}

impl Engine {
    pub fn new(
        config: Arc<FilterConfig>,
        provider: Arc<dyn MarketData>,
        notifier: Arc<dyn Notifier>,
        universe: &[String],
        dispatcher: Dispatcher,
    ) -> Self {
        let aggregator = CandleAggregator::new(universe, config.lookback_candles);
        let throttle = AlertThrottle::new(config.throttle);

        Self {
            config,
            provider,
            notifier,
            aggregator,
            flow: ProgramFlowCache::new(),
            throttle,
            gate: Arc::new(NetworkGate::new()),
            dispatcher,
            tick_count: 0,
            alert_count: 0,
        }
    }

    // ─── Main Loop ────────────────────────────────────────────────────────────

    /// รันจนกว่า shutdown จะสั่งหยุด หรือ tick feed ปิด
    ///
    /// Stop เป็นแบบ lossy โดยตั้งใจ: job ค้างถูกทิ้ง แท่งก่อตัวค้างถูกทิ้ง
    /// งานที่อยู่กลาง round trip ไม่ผลิต Alert
    pub async fn run(
        mut self,
        mut ticks: mpsc::UnboundedReceiver<Tick>,
        mut jobs: JobQueue,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("🚀 engine loop starting");

        // Timer แค่ enqueue refresh — ไม่แตะ cache เอง
        // tick แรกของ interval มาทันที = refresh รอบแรกตอน start
        let timer = {
            let dispatcher = self.dispatcher.clone();
            let period = self.config.refresh_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if !dispatcher.enqueue(Job::RefreshProgramFlow) {
                        break;
                    }
                }
            })
        };

        loop {
            // ── 1. Drain job ที่ค้างอยู่ตอนนี้ ────────────────────────────────
            while let Some(job) = jobs.try_next() {
                self.execute_job(job).await;
            }

            // ── 2. Pump ข้อความถัดไป (job ชนะ tick เสมอ) ─────────────────────
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    info!("stop requested");
                    break;
                }

                job = jobs.next() => {
                    if let Some(job) = job {
                        self.execute_job(job).await;
                    }
                }

                tick = ticks.recv() => match tick {
                    Some(tick) => self.handle_tick(&tick).await,
                    None => {
                        info!("tick feed closed — stopping");
                        break;
                    }
                },
            }
        }

        // ── Stop: ทิ้งทุกอย่างทันที ──────────────────────────────────────────
        timer.abort();
        let discarded_jobs = jobs.discard_pending();
        let discarded_candles = self.aggregator.discard_in_progress();

        info!(
            ticks           = self.tick_count,
            alerts          = self.alert_count,
            discarded_jobs,
            discarded_candles,
            "engine stopped"
        );

        self.notifier.send_stop().await;
    }

    // ─── Tick Path (hot) ──────────────────────────────────────────────────────

    async fn handle_tick(&mut self, tick: &Tick) {
        self.tick_count += 1;

        // Tick เสีย / code นอก universe = เงียบ
        if !self.aggregator.update(tick) {
            return;
        }

        let bucket = tick.minute_bucket().to_string();
        let now = Instant::now();

        let Some(state) = self.aggregator.state(&tick.code) else {
            return;
        };

        if let ThrottleDecision::Blocked(reason) = self.throttle.check(state, &bucket, now) {
            debug!(code = %tick.code, reason, "evaluation throttled");
            return;
        }

        let Some(candle) = state.current_candle().copied() else {
            return;
        };

        let snapshot = self.flow.snapshot().await;
        let result =
            check_fast_filters(&tick.code, &candle, state.history(), &snapshot, &self.config);

        let FastFilterResult::Pass(metrics) = result else {
            return; // เหตุผลถูก log ใน chain แล้ว
        };

        // จองนาทีนี้ก่อนส่งเข้า queue — Tick ถัดไปของนาทีเดียวกันจะโดน dedup
        if let Some(state) = self.aggregator.state_mut(&tick.code) {
            state.mark_enqueued(&bucket, now);
        }

        info!(
            code   = %tick.code,
            amount = metrics.amount,
            ratio  = metrics.ratio,
            "⚡ fast filters passed — slow checks queued"
        );

        self.dispatcher.enqueue(Job::RunSlowFilters(SlowJob {
            code: tick.code.clone(),
            bucket,
            candle,
            metrics,
        }));
    }

    // ─── Job Execution (ระหว่าง Tick) ─────────────────────────────────────────

    async fn execute_job(&mut self, job: Job) {
        match job {
            Job::RefreshProgramFlow => self.refresh_flow().await,
            Job::RunSlowFilters(slow_job) => self.run_slow_job(slow_job).await,
        }
    }

    async fn refresh_flow(&self) {
        let result = flow::refresh_program_flow(
            self.provider.as_ref(),
            &self.flow,
            self.config.program_count,
        )
        .await;

        match result {
            Ok(total) => info!(entries = total, "🔄 program flow cache refreshed"),
            Err(e) => warn!(error = %e, "program flow refresh failed — keeping previous snapshot"),
        }
    }

    async fn run_slow_job(&mut self, job: SlowJob) {
        let SlowJob { code, bucket, candle, metrics } = job;

        // Gate แบบ non-blocking: ชนแล้วทิ้ง ไม่ต่อคิว ไม่ retry
        let Some(_in_flight) = self.gate.try_acquire() else {
            debug!(code = %code, "TR already in flight — slow checks skipped");
            if let Some(state) = self.aggregator.state_mut(&code) {
                state.clear_alert_marker(&bucket);
            }
            return;
        };

        match check_slow_filters(self.provider.as_ref(), &self.config, &code).await {
            SlowFilterResult::Rejected { reason } => {
                debug!(code = %code, reason, "slow filters rejected — minute unlocked");
                // ไม่ผ่าน = ไม่ใช่ Alert แต่ยังมีสิทธิ์รอบใหม่หลังพ้น gap
                if let Some(state) = self.aggregator.state_mut(&code) {
                    state.clear_alert_marker(&bucket);
                }
            }

            SlowFilterResult::Pass => {
                let name = match self.provider.instrument_name(&code).await {
                    Ok(name) => name,
                    Err(e) => {
                        warn!(code = %code, error = %e, "name lookup failed — using code");
                        code.clone()
                    }
                };

                let alert = AlertEvent {
                    time: chrono::Local::now().format("%H:%M:%S").to_string(),
                    code: code.clone(),
                    name,
                    candle,
                    current_amount:  metrics.amount,
                    avg_prev_amount: metrics.avg_prev_amount,
                    ratio:           metrics.ratio,
                    program_rank:    metrics.program_rank,
                };

                self.alert_count += 1;
                info!("🚨 {}", alert.log_line());
                self.notifier.send_alert(&alert).await;
                // marker ของนาทีนี้คงอยู่จนกว่า aggregator จะ roll over
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::error::BotError;
    use crate::flow::FlowEntry;
    use crate::models::Candle;
    use crate::provider::{BrokerVolume, MarketSegment};

    /// MarketData จำลอง: `ma_candles = None` = query พัง
    struct MockProvider {
        ma_candles: Option<Vec<Candle>>,
        flow:       Vec<FlowEntry>,
    }

    #[async_trait]
    impl MarketData for MockProvider {
        async fn screen_condition(&self, _: &str) -> Result<Vec<String>, BotError> {
            Ok(Vec::new())
        }

        async fn minute_candles(
            &self,
            _: &str,
            _: u32,
            _: usize,
        ) -> Result<Vec<Candle>, BotError> {
            self.ma_candles
                .clone()
                .ok_or_else(|| BotError::Bridge("mock outage".into()))
        }

        async fn broker_volumes(&self, _: &str) -> Result<Vec<BrokerVolume>, BotError> {
            Ok(Vec::new())
        }

        async fn program_flow(&self, _: MarketSegment) -> Result<Vec<FlowEntry>, BotError> {
            Ok(self.flow.clone())
        }

        async fn instrument_name(&self, _: &str) -> Result<String, BotError> {
            Ok("Alpha Electric".to_string())
        }
    }

    /// Notifier ที่จดทุก Alert ไว้ให้ assert
    #[derive(Default)]
    struct RecordingNotifier {
        alerts: Mutex<Vec<AlertEvent>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_alert(&self, alert: &AlertEvent) {
            self.alerts.lock().unwrap().push(alert.clone());
        }
        async fn send_start(&self, _: &str, _: usize, _: &FilterConfig) {}
        async fn send_stop(&self) {}
    }

    fn make_config() -> FilterConfig {
        FilterConfig {
            bridge_base_url:  String::new(),
            screen_condition: String::new(),

            min_amount:        1.0,
            lookback_candles:  3,
            amount_multiplier: 3.0,
            body_tail_ratio:   1.0,
            program_count:     50,

            ma_tick:     5,
            ma_periods:  vec![2, 4],
            trader_code: String::new(),

            enable_body_tail:      true,
            enable_min_amount:     true,
            enable_surge:          true,
            enable_program:        false,
            enable_ma_align:       false,
            enable_sell_dominance: false,

            refresh_interval: std::time::Duration::from_secs(300),
            throttle:         std::time::Duration::from_secs(60),
        }
    }

    fn make_tick(code: &str, price: i64, volume: i64, exec_time: &str) -> Tick {
        Tick {
            code: code.to_string(),
            price,
            volume,
            exec_time: exec_time.to_string(),
        }
    }

    fn make_engine(
        config: FilterConfig,
        provider: MockProvider,
        notifier: Arc<RecordingNotifier>,
    ) -> (Engine, JobQueue) {
        let (dispatcher, queue) = Dispatcher::channel();
        let engine = Engine::new(
            Arc::new(config),
            Arc::new(provider),
            notifier,
            &["005930".to_string()],
            dispatcher,
        );
        (engine, queue)
    }

    /// ส่ง 3 นาทีย้อนหลัง (เฉลี่ย 1.0bn) + tick เปิดนาที 0930
    async fn feed_history(engine: &mut Engine) {
        engine.handle_tick(&make_tick("005930", 1000, 100_000, "092701")).await;
        engine.handle_tick(&make_tick("005930", 1000, 100_000, "092801")).await;
        engine.handle_tick(&make_tick("005930", 1000, 100_000, "092901")).await;
        engine.handle_tick(&make_tick("005930", 999, 200_000, "093001")).await;
    }

    #[tokio::test]
    async fn test_two_fast_passes_same_minute_enqueue_single_job() {
        let notifier = Arc::new(RecordingNotifier::default());
        let provider = MockProvider { ma_candles: None, flow: Vec::new() };
        let (mut engine, mut queue) = make_engine(make_config(), provider, notifier);

        feed_history(&mut engine).await;

        // Tick นี้ทำให้แท่ง 0930 เขียว + amount 4.0bn → fast pass → job แรก
        engine.handle_tick(&make_tick("005930", 1001, 200_000, "093010")).await;
        // fast pass อีกครั้งในนาทีเดียวกัน → โดน dedup ไม่มี job ที่สอง
        engine.handle_tick(&make_tick("005930", 1001, 50_000, "093030")).await;

        assert!(matches!(queue.try_next(), Some(Job::RunSlowFilters(_))));
        assert!(queue.try_next().is_none());
    }

    #[tokio::test]
    async fn test_slow_pass_emits_alert_and_keeps_minute_locked() {
        let notifier = Arc::new(RecordingNotifier::default());
        let provider = MockProvider { ma_candles: None, flow: Vec::new() };
        let (mut engine, mut queue) =
            make_engine(make_config(), provider, notifier.clone());

        feed_history(&mut engine).await;
        engine.handle_tick(&make_tick("005930", 1001, 200_000, "093010")).await;

        let job = queue.try_next().expect("slow job should be queued");
        engine.execute_job(job).await;

        let alerts = notifier.alerts.lock().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, "005930");
        assert_eq!(alerts[0].name, "Alpha Electric");
        assert!((alerts[0].ratio - 4.0).abs() < 1e-9);
        drop(alerts);

        // Alert แล้ว → นาทีนี้ล็อกจนกว่าจะ roll over
        assert!(engine.aggregator.state("005930").unwrap().alerted_in("0930"));
    }

    #[tokio::test]
    async fn test_slow_reject_fails_closed_and_unlocks_minute() {
        let notifier = Arc::new(RecordingNotifier::default());
        // MA เปิดอยู่ แต่ query พัง → fail closed
        let mut config = make_config();
        config.enable_ma_align = true;
        let provider = MockProvider { ma_candles: None, flow: Vec::new() };
        let (mut engine, mut queue) = make_engine(config, provider, notifier.clone());

        feed_history(&mut engine).await;
        engine.handle_tick(&make_tick("005930", 1001, 200_000, "093010")).await;

        let job = queue.try_next().expect("slow job should be queued");
        engine.execute_job(job).await;

        assert!(notifier.alerts.lock().unwrap().is_empty());
        // ไม่ผ่าน → marker หาย (เหลือแค่ throttle gap)
        assert!(!engine.aggregator.state("005930").unwrap().alerted_in("0930"));
    }

    #[tokio::test]
    async fn test_gate_contention_skips_job_without_alert() {
        let notifier = Arc::new(RecordingNotifier::default());
        let provider = MockProvider { ma_candles: None, flow: Vec::new() };
        let (mut engine, mut queue) =
            make_engine(make_config(), provider, notifier.clone());

        feed_history(&mut engine).await;
        engine.handle_tick(&make_tick("005930", 1001, 200_000, "093010")).await;

        let job = queue.try_next().expect("slow job should be queued");

        // มี round trip ค้างอยู่ → job ใหม่ต้องโดนทิ้ง
        let gate = engine.gate.clone();
        let held = gate.try_acquire().expect("gate should be free");
        engine.execute_job(job).await;
        drop(held);

        assert!(notifier.alerts.lock().unwrap().is_empty());
        assert!(!engine.aggregator.state("005930").unwrap().alerted_in("0930"));
    }

    #[tokio::test]
    async fn test_refresh_job_fills_cache_used_by_program_filter() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut config = make_config();
        config.enable_program = true;

        let provider = MockProvider {
            ma_candles: None,
            flow: vec![FlowEntry { code: "005930".to_string(), net_buy_amount: 700 }],
        };
        let (mut engine, mut queue) = make_engine(config, provider, notifier);

        feed_history(&mut engine).await;

        // ยังไม่ refresh → cache ว่าง → fast chain ตกชั้น program
        engine.handle_tick(&make_tick("005930", 1001, 200_000, "093010")).await;
        assert!(queue.try_next().is_none());

        engine.execute_job(Job::RefreshProgramFlow).await;

        engine.handle_tick(&make_tick("005930", 1001, 10_000, "093020")).await;
        match queue.try_next() {
            Some(Job::RunSlowFilters(job)) => assert_eq!(job.metrics.program_rank, 1),
            other => panic!("expected slow job, got {other:?}"),
        }
    }
}
