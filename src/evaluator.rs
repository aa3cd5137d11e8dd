// 结果判定
//
// 每次迭代结束后，按通道比较平均带宽/延迟与阈值。迭代参数偏离标称值、
// 时长不足或被中止时，该通道本次迭代的阈值检查关闭（用户显式开启的除外）。
// 多通道的合并结果只展示不判定；数据完整性按合并状态判定。

use crate::config::{ChannelConfig, MemorySettings, ParameterBounds, TestcaseConfig};
use crate::hw::ChannelStatus;
use crate::integrity::DataIntegrityMonitor;
use crate::stats::{self, BurstStat};
use crate::types::{Direction, Integrity, PerMode, TestIteration, TestMode, Threshold, WrRd};

pub const MIN_RESULTS_CHECK_DURATION: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricCheck {
    pub value: f64,
    pub threshold: Threshold,
    pub checked: bool,
    pub in_range: bool,
}

impl MetricCheck {
    pub fn failed(&self) -> bool {
        self.checked && !self.in_range
    }

    pub fn render(&self, precision: usize) -> String {
        if self.failed() {
            format!("***{:.*}", precision, self.value)
        } else {
            format!("{:.*}", precision, self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelResult {
    pub channel: usize,
    pub mode: TestMode,
    pub bw: WrRd<Option<MetricCheck>>,
    pub latency: WrRd<Option<MetricCheck>>,
    pub integrity: Option<Integrity>,
    pub pass: bool,
}

/// Combined figures of a multi-channel memory; reported, never judged.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinedResult {
    pub bw: WrRd<Option<f64>>,
    pub latency: WrRd<Option<f64>>,
    pub integrity: Option<Integrity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationEvaluation {
    pub channels: Vec<ChannelResult>,
    pub combined: Option<CombinedResult>,
    pub pass: bool,
}

pub struct ResultEvaluator {
    max_block_size: u32,
    rate: PerMode<f64>,
    burst_size: PerMode<u32>,
    outstanding: PerMode<u32>,
    multi_channel: bool,
    bw_disabled_reported: bool,
    latency_disabled_reported: bool,
}

impl ResultEvaluator {
    pub fn new(settings: &MemorySettings, bounds: &ParameterBounds) -> Self {
        ResultEvaluator {
            max_block_size: bounds.max_block_size,
            rate: settings.rate,
            burst_size: bounds.burst_size_nominal,
            outstanding: settings.outstanding,
            multi_channel: settings.num_channels > 1,
            bw_disabled_reported: false,
            latency_disabled_reported: false,
        }
    }

    fn nominal_block_size(&self, mode: TestMode) -> u32 {
        if mode == TestMode::SimultaneousWrRd {
            self.max_block_size / 2
        } else {
            self.max_block_size
        }
    }

    /// Describes every deviation of `it` from the nominal parameters.
    pub fn deviations(&self, it: &TestIteration) -> Vec<String> {
        let mut list = Vec::new();
        if it.duration < MIN_RESULTS_CHECK_DURATION {
            list.push(format!(
                "duration {} s below {} s",
                it.duration, MIN_RESULTS_CHECK_DURATION
            ));
        }
        for dir in Direction::BOTH {
            if !it.mode.has(dir) {
                continue;
            }
            let s = it.settings(dir);
            let p = dir.prefix();
            let block = self.nominal_block_size(it.mode);
            if s.block_size != block {
                list.push(format!("{}_block_size {} MB is not nominal {} MB", p, s.block_size, block));
            }
            let rate = self.rate.nominal(it.mode, dir);
            if s.rate != rate {
                list.push(format!("{}_rate {} is not nominal {}", p, s.rate, rate));
            }
            let burst = self.burst_size.nominal(it.mode, dir);
            if s.burst_size != burst {
                list.push(format!("{}_burst_size {} Bytes is not nominal {} Bytes", p, s.burst_size, burst));
            }
            let outstanding = self.outstanding.nominal(it.mode, dir);
            if s.outstanding != outstanding {
                list.push(format!("{}_outstanding {} is not nominal {}", p, s.outstanding, outstanding));
            }
        }
        list
    }

    // 只有默认开启且用户未显式设置的检查才会被关闭
    fn is_check_disabled(check: bool, explicit: bool) -> bool {
        !explicit && check
    }

    /// Per-channel (bw, latency) check latches for this iteration.
    pub fn check_latches(&self, cfg: &ChannelConfig, it: &TestIteration, aborted: bool) -> (bool, bool) {
        let mut check_bw = cfg.check_bw.enabled;
        let mut check_latency = cfg.check_latency.enabled;
        if aborted || !self.deviations(it).is_empty() {
            if Self::is_check_disabled(check_bw, cfg.check_bw.explicit) {
                check_bw = false;
            }
            if Self::is_check_disabled(check_latency, cfg.check_latency.explicit) {
                check_latency = false;
            }
        }
        (check_bw, check_latency)
    }

    fn metric(value: f64, threshold: Threshold, checked: bool) -> MetricCheck {
        MetricCheck {
            value,
            threshold,
            checked,
            in_range: threshold.contains(value),
        }
    }

    /// Judges one iteration. `iterations` and `statuses` are indexed by channel.
    pub fn evaluate(
        &mut self,
        tc: &TestcaseConfig,
        iterations: &[TestIteration],
        statuses: &[ChannelStatus],
        integrity: &DataIntegrityMonitor,
        aborted: bool,
    ) -> IterationEvaluation {
        let mut channels = Vec::with_capacity(tc.enabled.len());
        let mut pass = true;
        let mut bw_disabled = false;
        let mut latency_disabled = false;

        for &ch in &tc.enabled {
            let cfg = &tc.channels[ch];
            let it = &iterations[ch];
            let status = &statuses[ch];
            let (check_bw, check_latency) = self.check_latches(cfg, it, aborted);
            bw_disabled |= cfg.check_bw.enabled && !check_bw;
            latency_disabled |= cfg.check_latency.enabled && !check_latency;

            let mut result = ChannelResult {
                channel: ch,
                mode: it.mode,
                bw: WrRd::new(None, None),
                latency: WrRd::new(None, None),
                integrity: None,
                pass: true,
            };
            for dir in Direction::BOTH {
                if !it.mode.has(dir) {
                    continue;
                }
                let stat = status.burst(dir);
                let bw = Self::metric(stat.average_bw_mbps, *cfg.bw.for_mode(it.mode).get(dir), check_bw);
                let lat = Self::metric(stat.average_ns, *cfg.latency.for_mode(it.mode).get(dir), check_latency);
                if bw.failed() {
                    log_error_fmt!(
                        "Average {} bandwidth {:.2} MBps out of range [{} ; {}] (channel {})",
                        dir.as_str(),
                        bw.value,
                        bw.threshold.low,
                        bw.threshold.high,
                        ch
                    );
                    result.pass = false;
                }
                if lat.failed() {
                    log_error_fmt!(
                        "Average {} burst latency {:.2} ns out of range [{} ; {}] (channel {})",
                        dir.as_str(),
                        lat.value,
                        lat.threshold.low,
                        lat.threshold.high,
                        ch
                    );
                    result.pass = false;
                }
                *result.bw.get_mut(dir) = Some(bw);
                *result.latency.get_mut(dir) = Some(lat);
            }
            if it.is_read() {
                let state = integrity.state(ch).result;
                result.integrity = Some(state);
                if cfg.checks_integrity() && state != Integrity::Ok {
                    result.pass = false;
                }
            }
            pass &= result.pass;
            channels.push(result);
        }

        if bw_disabled && !self.bw_disabled_reported {
            log_warn_fmt!("Bandwidth threshold check disabled: test parameters are not nominal, duration is below {} s or the test was aborted", MIN_RESULTS_CHECK_DURATION);
            self.bw_disabled_reported = true;
        }
        if latency_disabled && !self.latency_disabled_reported {
            log_warn_fmt!("Latency threshold check disabled: test parameters are not nominal, duration is below {} s or the test was aborted", MIN_RESULTS_CHECK_DURATION);
            self.latency_disabled_reported = true;
        }

        let read_active = tc.enabled.iter().any(|&ch| iterations[ch].is_read());
        let combined_state = integrity.combined();
        if read_active && integrity.combined_check() {
            if combined_state.result != Integrity::Ok {
                log_error_fmt!("Data integrity test: {}", combined_state.result.as_str());
                pass = false;
            } else {
                log_info_fmt!("Data integrity test: {}", combined_state.result.as_str());
            }
        } else {
            log_info_fmt!("Data integrity test: not checked");
        }

        let combined = if self.multi_channel {
            Some(combined_result(tc, iterations, statuses, read_active.then_some(combined_state.result)))
        } else {
            None
        };

        IterationEvaluation {
            channels,
            combined,
            pass,
        }
    }

    /// Renders the results table, one line per channel plus `combined`.
    pub fn render_table(eval: &IterationEvaluation) -> Vec<String> {
        let fmt_metric = |m: &Option<MetricCheck>, precision: usize| match m {
            Some(m) => m.render(precision),
            None => "n/a".to_string(),
        };
        let fmt_value = |v: &Option<f64>| match v {
            Some(v) => format!("{:.2}", v),
            None => "n/a".to_string(),
        };
        let fmt_integrity = |i: &Option<Integrity>| match i {
            Some(i) => i.as_str().to_string(),
            None => "n/a".to_string(),
        };

        let mut lines = vec![format!(
            "{:>10} | {:>18} | {:>14} | {:>14} | {:>12} | {:>12} | {:>9}",
            "Channel", "Mode", "Wr BW (MBps)", "Rd BW (MBps)", "Wr lat (ns)", "Rd lat (ns)", "Integrity"
        )];
        for r in &eval.channels {
            lines.push(format!(
                "{:>10} | {:>18} | {:>14} | {:>14} | {:>12} | {:>12} | {:>9}",
                r.channel,
                r.mode.as_str(),
                fmt_metric(&r.bw.write, 2),
                fmt_metric(&r.bw.read, 2),
                fmt_metric(&r.latency.write, 2),
                fmt_metric(&r.latency.read, 2),
                fmt_integrity(&r.integrity)
            ));
        }
        if let Some(c) = &eval.combined {
            lines.push(format!(
                "{:>10} | {:>18} | {:>14} | {:>14} | {:>12} | {:>12} | {:>9}",
                "combined",
                "",
                fmt_value(&c.bw.write),
                fmt_value(&c.bw.read),
                fmt_value(&c.latency.write),
                fmt_value(&c.latency.read),
                fmt_integrity(&c.integrity)
            ));
        }
        lines
    }
}

fn combined_result(
    tc: &TestcaseConfig,
    iterations: &[TestIteration],
    statuses: &[ChannelStatus],
    integrity: Option<Integrity>,
) -> CombinedResult {
    let mut bw = WrRd::new(None, None);
    let mut latency = WrRd::new(None, None);
    for dir in Direction::BOTH {
        let contributing: Vec<&BurstStat> = tc
            .enabled
            .iter()
            .filter(|&&ch| iterations[ch].mode.has(dir))
            .map(|&ch| statuses[ch].burst(dir))
            .collect();
        if contributing.is_empty() {
            continue;
        }
        let c = stats::combine(contributing);
        *bw.get_mut(dir) = Some(c.average_bw_mbps);
        *latency.get_mut(dir) = Some(c.average_ns);
    }
    CombinedResult { bw, latency, integrity }
}
