// 测试序列主流程
//
// 通道准备 -> 每次迭代 { 预写 -> 下发配置 -> 等待生效 -> 1 秒轮询 -> 判定 }
// -> 停止所有通道。中止请求在迭代边界、配置等待和 toggle 等待处检查；
// 一旦中止，当前及之后的迭代记为 ABORTED，但仍然停止硬件。

use std::io;

use crate::config::{MemorySettings, ParameterBounds, PatternMode, TestcaseConfig};
use crate::controller::{AxiThreadMode, ChannelRegisterController};
use crate::error::{EngineError, EngineResult};
use crate::evaluator::{IterationEvaluation, ResultEvaluator};
use crate::hw::{ChannelStatus, RegisterAccess};
use crate::integrity::DataIntegrityMonitor;
use crate::planner::TestPlan;
use crate::prewrite::PreWriteStager;
use crate::report::{DetailRow, LiveFigures, McSummaryRow, MeasurementSink, PowerRow, ResultRow};
use crate::stats::{self, BurstStat, BurstStatisticsAggregator};
use crate::telemetry::SensorSource;
use crate::timebase::TimebaseSynchronizer;
use crate::types::{Direction, IterationResult, TestIteration, TestState};

/// Seconds the traffic runs before the first measurement.
pub const SETTLE_SECS: u64 = 2;
/// hw_sec_cnt may fall short of the duration by at most duration / HW_SEC_CNT_TOLERANCE.
pub const HW_SEC_CNT_TOLERANCE: u64 = 10;

const OVERRIDDEN_MODE: &str = "OVR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: TestState,
    pub results: Vec<IterationResult>,
}

fn figures(stat: &BurstStat) -> LiveFigures {
    LiveFigures {
        live_inst: stat.live_inst,
        live_bw_mbps: stat.live_bw_mbps,
        live_average_ns: stat.live_average_ns,
        average_bw_mbps: stat.average_bw_mbps,
        average_ns: stat.average_ns,
    }
}

fn channel_list(channels: &[usize]) -> String {
    channels.iter().map(|ch| ch.to_string()).collect::<Vec<_>>().join(", ")
}

pub struct SequenceOrchestrator<'a, D: RegisterAccess, S: MeasurementSink> {
    settings: &'a MemorySettings,
    tc: &'a TestcaseConfig,
    plan: &'a TestPlan,
    ctrl: ChannelRegisterController<D>,
    sensors: &'a dyn SensorSource,
    sink: S,
    aggregator: BurstStatisticsAggregator,
    timebase: TimebaseSynchronizer,
    integrity: DataIntegrityMonitor,
    prewrite: PreWriteStager,
    evaluator: ResultEvaluator,
    statuses: Vec<ChannelStatus>,
    sink_error_reported: bool,
}

impl<'a, D: RegisterAccess, S: MeasurementSink> SequenceOrchestrator<'a, D, S> {
    pub fn new(
        settings: &'a MemorySettings,
        bounds: &ParameterBounds,
        tc: &'a TestcaseConfig,
        plan: &'a TestPlan,
        ctrl: ChannelRegisterController<D>,
        sensors: &'a dyn SensorSource,
        sink: S,
    ) -> Self {
        let n = settings.num_channels;
        SequenceOrchestrator {
            settings,
            tc,
            plan,
            ctrl,
            sensors,
            sink,
            aggregator: BurstStatisticsAggregator::new(settings.clock_mhz as f64),
            timebase: TimebaseSynchronizer::new(n),
            integrity: DataIntegrityMonitor::new(n, tc.combined_check_integrity()),
            prewrite: PreWriteStager::new(settings.rate.only_wr.write),
            evaluator: ResultEvaluator::new(settings, bounds),
            statuses: vec![ChannelStatus::default(); n],
            sink_error_reported: false,
        }
    }

    pub fn controller(&self) -> &ChannelRegisterController<D> {
        &self.ctrl
    }

    #[cfg(test)]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn multi_channel(&self) -> bool {
        self.settings.num_channels > 1
    }

    /// Runs the whole sequence. A register access failure is fatal: the
    /// channels are stopped on a best-effort basis and the error returned.
    pub fn run(&mut self) -> EngineResult<RunOutcome> {
        let enabled = self.tc.enabled.clone();
        let mut results = vec![IterationResult::NotTested; self.plan.num_iterations()];

        log_info_fmt!(
            "{}: running {} test(s) on channel(s) {}",
            self.settings.name,
            results.len(),
            channel_list(&enabled)
        );

        let state = match self.execute(&enabled, &mut results) {
            Ok(state) => state,
            Err(e) => {
                log_error_fmt!("Test sequence failed: {}", e);
                if let Err(stop_err) = self.ctrl.stop(&enabled) {
                    log_error_fmt!("Failed to stop channels: {}", stop_err);
                }
                return Err(e);
            }
        };

        log_info_fmt!("Stopping channel(s) {}", channel_list(&enabled));
        self.ctrl.stop(&enabled)?;

        for (idx, r) in results.iter().enumerate() {
            log_info_fmt!("Test {}: {}", idx + 1, r.as_str());
        }
        match state {
            TestState::Pass => log_success_fmt!("{}: test PASSED", self.settings.name),
            TestState::Failure => log_error_fmt!("{}: test FAILED", self.settings.name),
            TestState::Abort => log_warn_fmt!("{}: test ABORTED", self.settings.name),
        }
        Ok(RunOutcome { state, results })
    }

    fn execute(&mut self, enabled: &[usize], results: &mut [IterationResult]) -> EngineResult<TestState> {
        if !self.setup(enabled)? {
            log_error_fmt!("Pre-test check failed, no test executed");
            return Ok(TestState::Failure);
        }

        let mut state = TestState::Pass;
        for idx in 0..results.len() {
            if self.ctrl.is_aborted() {
                break;
            }
            let result = self.run_iteration(idx)?;
            results[idx] = result;
            match result {
                IterationResult::Failed => state = TestState::Failure,
                IterationResult::Aborted => break,
                _ => {}
            }
        }

        if self.ctrl.is_aborted() {
            log_warn_fmt!("Abort requested, remaining tests are not executed");
            for r in results.iter_mut().filter(|r| **r == IterationResult::NotTested) {
                *r = IterationResult::Aborted;
            }
            state = TestState::Abort;
        }
        Ok(state)
    }

    // 返回 false 表示测试前检查失败
    fn setup(&mut self, enabled: &[usize]) -> EngineResult<bool> {
        log_debug_fmt!(
            "Combined data integrity check: {}",
            if self.integrity.combined_check() { "enabled" } else { "disabled" }
        );

        for &ch in enabled {
            let cfg = &self.tc.channels[ch];
            if self.settings.num_axi_thread > 1 {
                let mode = if cfg.single_axi_thread {
                    AxiThreadMode::Single
                } else {
                    AxiThreadMode::Multi
                };
                log_debug_fmt!("AXI thread mode {:?} (channel {})", mode, ch);
                self.ctrl.set_axi_thread_mode(ch, mode)?;
            }

            let first = cfg.pattern_words.first().copied().unwrap_or(0);
            let second = cfg.pattern_words.get(1).copied().unwrap_or(first);
            match cfg.pattern {
                PatternMode::Prbs => self.ctrl.set_pattern(ch, false, 0, 0)?,
                PatternMode::Fixed => self.ctrl.set_pattern(ch, true, first, first)?,
                PatternMode::Alternate => self.ctrl.set_pattern(ch, true, first, second)?,
            }
            log_debug_fmt!("Pattern control {} (channel {})", cfg.pattern.as_str(), ch);
        }

        match self.ctrl.check_axi_addr_ptr(enabled) {
            Ok(()) => {}
            Err(EngineError::StatusMismatch { channel, single, bulk }) => {
                log_error_fmt!(
                    "AXI address pointer read 0x{:X} does not match status block value 0x{:X} (channel {})",
                    single,
                    bulk,
                    channel
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        self.ctrl.reset(enabled, true)?;
        self.ctrl.reset(enabled, false)?;
        Ok(true)
    }

    fn run_iteration(&mut self, idx: usize) -> EngineResult<IterationResult> {
        let tc = self.tc;
        let plan = self.plan;
        let enabled = &tc.enabled;
        let global = &plan.global[idx];
        let iterations: Vec<TestIteration> = (0..plan.per_channel.len())
            .map(|ch| plan.iteration(ch, idx).clone())
            .collect();

        log_info_fmt!("Start test {}: {}", idx + 1, global.describe());
        log_debug_fmt!("Test {} parameters: {}", idx + 1, global.describe_resolved());
        for &ch in enabled.iter().filter(|&&ch| plan.overridden[ch]) {
            log_info_fmt!("Start test {}: {} (channel {})", idx + 1, iterations[ch].describe(), ch);
        }

        self.statuses.iter_mut().for_each(|s| *s = ChannelStatus::default());
        self.integrity.reset();

        let staged = self.prewrite.stage(&mut self.ctrl, tc, &iterations)?;
        if !staged.is_empty() {
            if self.ctrl.is_aborted() {
                log_warn_fmt!("Pre-write interrupted");
            } else {
                log_info_fmt!("Pre-write done on channel(s) {}", channel_list(&staged));
            }
        }

        if !self.ctrl.is_aborted() {
            for &ch in enabled {
                self.ctrl.apply_iteration(ch, &iterations[ch])?;
            }
            for &ch in enabled {
                self.ctrl.update_config(ch)?;
            }
            self.ctrl.wait_config_updated(enabled)?;
        }
        if self.ctrl.is_aborted() {
            log_warn_fmt!("Test {} aborted before measurement", idx + 1);
            return Ok(IterationResult::Aborted);
        }

        log_debug_fmt!("Let run {} seconds before measuring", SETTLE_SECS);
        self.ctrl.timer().wait_secs(SETTLE_SECS);

        // 最大通道号最后被读取，用它检测 toggle
        let toggle_channel = enabled.iter().copied().max().unwrap_or(0);
        self.timebase.start_window(&mut self.ctrl, toggle_channel)?;

        let duration = global.duration as u64;
        let divider = (duration / 10).max(1);
        let start = self.ctrl.timer().sec_count();
        let mut sw_sec = start;
        let mut remaining = duration;
        let mut display_time = true;

        loop {
            if display_time && !self.ctrl.is_aborted() {
                log_info_fmt!("{} s remaining", remaining);
                display_time = false;
            }
            let toggled = self.timebase.wait_toggle(&mut self.ctrl)?;
            if self.ctrl.is_aborted() {
                break;
            }
            self.poll(idx, global, &iterations, toggled)?;

            let now = self.ctrl.timer().sec_count();
            if now != sw_sec {
                sw_sec = now;
                remaining = duration.saturating_sub(sw_sec - start);
                if remaining > 0 && remaining % divider == 0 {
                    display_time = true;
                }
            }
            if sw_sec - start >= duration || self.ctrl.is_aborted() {
                break;
            }
        }
        log_info_fmt!("Test {} duration reached", idx + 1);

        let aborted = self.ctrl.is_aborted();
        if !aborted {
            let mut min_hw_sec_cnt = duration - duration / HW_SEC_CNT_TOLERANCE;
            if min_hw_sec_cnt == duration {
                min_hw_sec_cnt = duration.saturating_sub(1);
            }
            if self.timebase.hw_sec_cnt() < min_hw_sec_cnt {
                log_warn_fmt!(
                    "Only {} measurements collected during the {} s test",
                    self.timebase.hw_sec_cnt(),
                    duration
                );
            }
        }

        let eval = self
            .evaluator
            .evaluate(tc, &iterations, &self.statuses, &self.integrity, aborted);
        for line in ResultEvaluator::render_table(&eval) {
            log_info_fmt!("{}", line);
        }
        self.write_results(idx, global, &iterations, &eval);

        Ok(if aborted {
            IterationResult::Aborted
        } else if eval.pass {
            IterationResult::Passed
        } else {
            IterationResult::Failed
        })
    }

    fn combined_mode(&self, global: &TestIteration) -> String {
        if self.tc.enabled.iter().any(|&ch| self.plan.overridden[ch]) {
            OVERRIDDEN_MODE.to_string()
        } else {
            global.mode.as_str().to_string()
        }
    }

    fn combined_stat(&self, iterations: &[TestIteration], dir: Direction) -> Option<BurstStat> {
        let contributing: Vec<&BurstStat> = self
            .tc
            .enabled
            .iter()
            .filter(|&&ch| iterations[ch].mode.has(dir))
            .map(|&ch| self.statuses[ch].burst(dir))
            .collect();
        if contributing.is_empty() {
            None
        } else {
            Some(stats::combine(contributing))
        }
    }

    fn report(&mut self, what: &str, result: io::Result<()>) {
        if let Err(e) = result {
            if !self.sink_error_reported {
                log_error_fmt!("Failed to write {} record: {}", what, e);
                self.sink_error_reported = true;
            }
        }
    }

    // 一次轮询：读取状态、累计统计、检查完整性、输出明细
    fn poll(
        &mut self,
        idx: usize,
        global: &TestIteration,
        iterations: &[TestIteration],
        toggled: bool,
    ) -> EngineResult<()> {
        let tc = self.tc;
        let hw_sec_cnt = self.timebase.hw_sec_cnt();

        let mut wr_plus_rd = Vec::with_capacity(tc.enabled.len());
        for &ch in &tc.enabled {
            self.statuses[ch].load(self.ctrl.status_words(ch));
            self.timebase.check_timestamp(ch, &self.statuses[ch]);
            self.aggregator
                .update_channel(&mut self.statuses[ch], &iterations[ch], hw_sec_cnt);
            wr_plus_rd.push(stats::wr_plus_rd(&self.statuses[ch], &iterations[ch]));
        }

        let read_channels: Vec<usize> = tc
            .enabled
            .iter()
            .copied()
            .filter(|&ch| iterations[ch].is_read())
            .collect();
        for &ch in &read_channels {
            self.integrity
                .check_channel(&mut self.ctrl, ch, &tc.channels[ch], &self.statuses[ch])?;
        }
        let combined_integrity = self.integrity.combine(&read_channels);

        let mut rows = Vec::with_capacity(tc.enabled.len() + 1);
        for (i, &ch) in tc.enabled.iter().enumerate() {
            let it = &iterations[ch];
            let status = &self.statuses[ch];
            rows.push(DetailRow {
                iteration: idx + 1,
                channel: Some(ch),
                mode: it.mode.as_str().to_string(),
                hw_sec_cnt,
                toggle_detected: toggled,
                timestamp: status.timestamp_1_sec,
                write: it.is_write().then(|| figures(&status.wr_burst)),
                read: it.is_read().then(|| figures(&status.rd_burst)),
                wr_plus_rd_live_bw_mbps: wr_plus_rd[i].live_bw_mbps,
                wr_plus_rd_average_bw_mbps: wr_plus_rd[i].average_bw_mbps,
                integrity: self.integrity.state(ch).live,
            });
        }
        if self.multi_channel() {
            let total = stats::combined_wr_plus_rd(wr_plus_rd.iter());
            let toggle_channel = tc.enabled.iter().copied().max().unwrap_or(0);
            rows.push(DetailRow {
                iteration: idx + 1,
                channel: None,
                mode: self.combined_mode(global),
                hw_sec_cnt,
                toggle_detected: toggled,
                timestamp: self.statuses[toggle_channel].timestamp_1_sec,
                write: self.combined_stat(iterations, Direction::Write).map(|s| figures(&s)),
                read: self.combined_stat(iterations, Direction::Read).map(|s| figures(&s)),
                wr_plus_rd_live_bw_mbps: total.live_bw_mbps,
                wr_plus_rd_average_bw_mbps: total.average_bw_mbps,
                integrity: combined_integrity.live,
            });
        }
        for row in &rows {
            let r = self.sink.write_detail(row);
            self.report("detail", r);
        }

        let power = PowerRow {
            iteration: idx + 1,
            hw_sec_cnt,
            sensors: self.sensors.get_sensor_snapshot(),
        };
        let r = self.sink.write_power(&power);
        self.report("power", r);
        Ok(())
    }

    fn write_results(
        &mut self,
        idx: usize,
        global: &TestIteration,
        iterations: &[TestIteration],
        eval: &IterationEvaluation,
    ) {
        let hw_sec_cnt = self.timebase.hw_sec_cnt();
        let mut rows = Vec::new();
        let mut summary = Vec::new();
        let mut totals = Vec::new();

        for &ch in &self.tc.enabled {
            let it = &iterations[ch];
            let status = &self.statuses[ch];
            let average = |dir: Direction| {
                it.mode
                    .has(dir)
                    .then(|| (status.burst(dir).average_bw_mbps, status.burst(dir).average_ns))
            };
            let wr = average(Direction::Write);
            let rd = average(Direction::Read);
            let total = stats::wr_plus_rd(status, it);
            rows.push(ResultRow {
                iteration: idx + 1,
                channel: Some(ch),
                mode: it.mode.as_str().to_string(),
                duration: it.duration,
                hw_sec_cnt,
                wr_bw_mbps: wr.map(|v| v.0),
                wr_latency_ns: wr.map(|v| v.1),
                rd_bw_mbps: rd.map(|v| v.0),
                rd_latency_ns: rd.map(|v| v.1),
                wr_plus_rd_bw_mbps: total.average_bw_mbps,
                integrity: it.is_read().then(|| self.integrity.state(ch).result),
                parameters: it.describe_resolved(),
            });
            summary.push((ch, wr.map(|v| v.0), rd.map(|v| v.0)));
            totals.push(total);
        }

        let mut mc_summary = None;
        if let Some(c) = &eval.combined {
            let mode = self.combined_mode(global);
            rows.push(ResultRow {
                iteration: idx + 1,
                channel: None,
                mode: mode.clone(),
                duration: global.duration,
                hw_sec_cnt,
                wr_bw_mbps: c.bw.write,
                wr_latency_ns: c.latency.write,
                rd_bw_mbps: c.bw.read,
                rd_latency_ns: c.latency.read,
                wr_plus_rd_bw_mbps: stats::combined_wr_plus_rd(totals.iter()).average_bw_mbps,
                integrity: c.integrity,
                parameters: global.describe_resolved(),
            });
            mc_summary = Some(McSummaryRow {
                iteration: idx + 1,
                mode,
                channels: summary,
                combined_wr_bw_mbps: c.bw.write,
                combined_rd_bw_mbps: c.bw.read,
            });
        }

        for row in &rows {
            let r = self.sink.write_result(row);
            self.report("result", r);
        }
        if let Some(row) = mc_summary {
            let r = self.sink.write_mc_summary(&row);
            self.report("summary", r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::config::{
        parse_channel_entry, parse_sequence_entry, parse_threshold_override, MemorySettings, TestcaseOptions,
    };
    use crate::hw::{REG_CTRL_WR_NUM_XFER, STAT_TERM_ERR};
    use crate::planner::SequencePlanner;
    use crate::report::MemorySink;
    use crate::sim::{SimMemoryBlock, VirtualTimer};
    use crate::telemetry::{FixedSensors, SensorSnapshot};
    use crate::types::Integrity;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    struct Fixture {
        settings: MemorySettings,
        bounds: ParameterBounds,
        tc: TestcaseConfig,
        plan: TestPlan,
    }

    fn fixture(n: usize, tests: &[&str], chan_tests: &[&str], opts: TestcaseOptions) -> Fixture {
        let settings = sample_settings(n);
        let planner = SequencePlanner::new(&settings).unwrap();
        let entries: Vec<_> = tests.iter().map(|t| parse_sequence_entry(t).unwrap()).collect();
        let overrides: Vec<_> = chan_tests.iter().map(|t| parse_channel_entry(t).unwrap()).collect();
        let global = planner.plan(&entries).unwrap();
        let plan = planner.plan_channels(global, &overrides).unwrap();
        let bounds = planner.bounds().clone();
        let tc = TestcaseConfig::build(&settings, &opts).unwrap();
        Fixture {
            settings,
            bounds,
            tc,
            plan,
        }
    }

    fn controller(n: usize, abort: Arc<AtomicBool>) -> ChannelRegisterController<SimMemoryBlock> {
        let timer = Arc::new(VirtualTimer::new());
        let sim = SimMemoryBlock::new(n, 64, 300, timer.clock());
        ChannelRegisterController::new(sim, n, timer, abort)
    }

    /// Raises the abort flag on the n-th sensor read, i.e. during the n-th poll.
    struct AbortOnPoll {
        abort: Arc<AtomicBool>,
        polls: AtomicU32,
        at: u32,
    }

    impl SensorSource for AbortOnPoll {
        fn get_sensor_snapshot(&self) -> SensorSnapshot {
            if self.polls.fetch_add(1, Ordering::SeqCst) + 1 == self.at {
                self.abort.store(true, Ordering::SeqCst);
            }
            SensorSnapshot::default()
        }
    }

    #[test]
    fn nominal_sequence_passes_and_stops_channels() {
        let f = fixture(2, &["20,only_wr", "20,simultaneous_wr_rd"], &[], TestcaseOptions::default());
        let sensors = FixedSensors::default();
        let ctrl = controller(2, Arc::new(AtomicBool::new(false)));
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let outcome = orch.run().unwrap();
        assert_eq!(outcome.state, TestState::Pass);
        assert_eq!(outcome.results, vec![IterationResult::Passed, IterationResult::Passed]);
        assert!(!orch.controller().device().is_running(0));
        assert!(!orch.controller().device().is_running(1));

        let sink = orch.sink();
        // 每个通道 + 合并各一个结果行
        assert_eq!(sink.results.len(), 6);
        assert_eq!(sink.mc_summaries.len(), 2);
        let combined: Vec<_> = sink.results.iter().filter(|r| r.channel.is_none()).collect();
        let sum: f64 = sink
            .results
            .iter()
            .filter(|r| r.iteration == 1 && r.channel.is_some())
            .map(|r| r.wr_bw_mbps.unwrap())
            .sum();
        assert!((combined[0].wr_bw_mbps.unwrap() - sum).abs() < 1e-6);
        assert_eq!(combined[0].rd_bw_mbps, None);
        assert_eq!(combined[1].integrity, Some(Integrity::Ok));

        let first_polls = sink.details.iter().filter(|d| d.iteration == 1 && d.channel == Some(0)).count();
        assert!((18..=21).contains(&first_polls), "{} polls", first_polls);
        assert!(sink.details.iter().all(|d| d.toggle_detected));
        assert_eq!(sink.power.len(), sink.details.len() / 3);
    }

    #[test]
    fn threshold_violation_fails_only_that_iteration() {
        let opts = TestcaseOptions {
            bw_overrides: vec![parse_threshold_override("only_wr:wr:1:10").unwrap()],
            ..Default::default()
        };
        let f = fixture(1, &["20,only_wr", "20,only_rd"], &[], opts);
        let sensors = FixedSensors::default();
        let ctrl = controller(1, Arc::new(AtomicBool::new(false)));
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let outcome = orch.run().unwrap();
        assert_eq!(outcome.state, TestState::Failure);
        assert_eq!(outcome.results, vec![IterationResult::Failed, IterationResult::Passed]);
        // 单通道没有合并行
        assert!(orch.sink().results.iter().all(|r| r.channel.is_some()));
        assert!(orch.sink().mc_summaries.is_empty());
    }

    #[test]
    fn data_corruption_fails_the_read_iteration() {
        let f = fixture(1, &["20,only_rd"], &[], TestcaseOptions::default());
        let sensors = FixedSensors::default();
        let mut ctrl = controller(1, Arc::new(AtomicBool::new(false)));
        ctrl.device_mut().schedule_latch(0, STAT_TERM_ERR, 8_000);
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let outcome = orch.run().unwrap();
        assert_eq!(outcome.results, vec![IterationResult::Failed]);
        let sink = orch.sink();
        assert_eq!(sink.results[0].integrity, Some(Integrity::Corrupted));
        // KO 只出现在锁存那一秒，之后的明细恢复为 OK
        let live: Vec<Integrity> = sink.details.iter().map(|d| d.integrity).collect();
        assert_eq!(live.iter().filter(|i| **i == Integrity::Corrupted).count(), 1);
        assert_eq!(live.last(), Some(&Integrity::Ok));
    }

    #[test]
    fn abort_marks_current_and_remaining_iterations() {
        let f = fixture(2, &["20,only_wr", "20,only_rd", "20,only_wr"], &[], TestcaseOptions::default());
        let abort = Arc::new(AtomicBool::new(false));
        let sensors = AbortOnPoll {
            abort: abort.clone(),
            polls: AtomicU32::new(0),
            at: 25,
        };
        let ctrl = controller(2, abort);
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let outcome = orch.run().unwrap();
        assert_eq!(outcome.state, TestState::Abort);
        assert_eq!(
            outcome.results,
            vec![IterationResult::Passed, IterationResult::Aborted, IterationResult::Aborted]
        );
        assert!(!orch.controller().device().is_running(0));
        assert!(!orch.controller().device().is_running(1));
        assert!(orch.sink().details.iter().all(|d| d.iteration <= 2));
    }

    #[test]
    fn abort_before_start_runs_nothing() {
        let f = fixture(1, &["20,only_wr"], &[], TestcaseOptions::default());
        let sensors = FixedSensors::default();
        let ctrl = controller(1, Arc::new(AtomicBool::new(true)));
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let outcome = orch.run().unwrap();
        assert_eq!(outcome.state, TestState::Abort);
        assert_eq!(outcome.results, vec![IterationResult::Aborted]);
        assert!(orch.sink().details.is_empty());
    }

    #[test]
    fn axi_pointer_mismatch_is_a_pre_test_failure() {
        let f = fixture(2, &["20,only_wr", "20,only_rd"], &[], TestcaseOptions::default());
        let sensors = FixedSensors::default();
        let mut ctrl = controller(2, Arc::new(AtomicBool::new(false)));
        ctrl.device_mut().set_axi_ptr_mismatch(1, true);
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let outcome = orch.run().unwrap();
        assert_eq!(outcome.state, TestState::Failure);
        assert_eq!(outcome.results, vec![IterationResult::NotTested, IterationResult::NotTested]);
        assert!(orch.sink().details.is_empty());
    }

    #[test]
    fn register_failure_is_fatal() {
        let f = fixture(1, &["20,only_wr"], &[], TestcaseOptions::default());
        let sensors = FixedSensors::default();
        let mut ctrl = controller(1, Arc::new(AtomicBool::new(false)));
        ctrl.device_mut().fail_register(Some(REG_CTRL_WR_NUM_XFER));
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let err = orch.run().unwrap_err();
        assert!(matches!(err, EngineError::RegisterIo { address: REG_CTRL_WR_NUM_XFER, .. }));
    }

    #[test]
    fn overridden_channel_marks_combined_rows() {
        let f = fixture(
            2,
            &["20,only_wr"],
            &["1:20,only_wr,wr_burst_size=256"],
            TestcaseOptions::default(),
        );
        let sensors = FixedSensors::default();
        let ctrl = controller(2, Arc::new(AtomicBool::new(false)));
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());

        let outcome = orch.run().unwrap();
        assert_eq!(outcome.state, TestState::Pass);
        let sink = orch.sink();
        assert!(sink
            .details
            .iter()
            .filter(|d| d.channel.is_none())
            .all(|d| d.mode == OVERRIDDEN_MODE));
        assert!(sink.details.iter().filter(|d| d.channel == Some(1)).all(|d| d.mode == "only_wr"));
        assert_eq!(sink.mc_summaries[0].mode, OVERRIDDEN_MODE);
    }

    #[test]
    fn pattern_control_is_programmed_per_channel() {
        use crate::hw::{PATTERN_EN, REG_CTRL_CONFIGURATION, REG_CTRL_PATTERN_A, REG_CTRL_PATTERN_B};
        let opts = TestcaseOptions {
            pattern: Some("alternate".to_string()),
            channel_patterns: vec![(1, "fixed".to_string())],
            ..Default::default()
        };
        let f = fixture(2, &["1,only_wr"], &[], opts);
        let sensors = FixedSensors::default();
        let ctrl = controller(2, Arc::new(AtomicBool::new(false)));
        let mut orch = SequenceOrchestrator::new(&f.settings, &f.bounds, &f.tc, &f.plan, ctrl, &sensors, MemorySink::default());
        orch.run().unwrap();

        let dev = orch.controller().device();
        assert_ne!(dev.ctrl_register(0, REG_CTRL_CONFIGURATION) & PATTERN_EN, 0);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_PATTERN_A), 0xCAFE_CAFE);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_PATTERN_B), 0xF00D_F00D);
        assert_eq!(dev.ctrl_register(1, REG_CTRL_PATTERN_A), 0xCAFE_CAFE);
        assert_eq!(dev.ctrl_register(1, REG_CTRL_PATTERN_B), 0xCAFE_CAFE);
    }
}
