// 突发延迟/带宽统计
//
// 硬件每秒锁存一次两个计数：本秒完成的突发数量 (reg_inst) 与这些突发
// 延迟周期的总和 (reg_total)。这里把它们换算成实时值，并在一次迭代内
// 累计成平均值。
//
// 注意：平均延迟是“每秒平均值”的算术平均，不按突发数量加权；多通道合并时
// 延迟取通道间的算术平均，带宽取通道间的和。

use crate::hw::ChannelStatus;
use crate::types::{Direction, TestIteration};

/// Bytes per nanosecond to MB/s.
pub const BPNS_TO_MBPS: f64 = 1000.0 * 1000.0 * 1000.0 / 1024.0 / 1024.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BurstStat {
    pub reg_total: u64,
    pub reg_inst: u32,

    pub live_inst: f64,
    pub live_total_ns: f64,
    pub live_average_ns: f64,
    pub live_average_mbps: f64,
    pub live_bw_mbps: f64,

    pub acc_inst: f64,
    pub acc_ns: f64,

    pub average_inst: f64,
    pub average_ns: f64,
    pub average_mbps: f64,
    pub average_bw_mbps: f64,
}

// 单个突发的等效速率，无法计算时为 0
pub fn average_mbps(burst_size: u32, average_ns: f64) -> f64 {
    if average_ns > 0.0 {
        burst_size as f64 * BPNS_TO_MBPS / average_ns
    } else {
        0.0
    }
}

pub fn bw_mbps(burst_size: u32, inst: f64) -> f64 {
    burst_size as f64 * inst / 1024.0 / 1024.0
}

pub struct BurstStatisticsAggregator {
    clock_mhz: f64,
}

impl BurstStatisticsAggregator {
    pub fn new(clock_mhz: f64) -> Self {
        BurstStatisticsAggregator { clock_mhz }
    }

    pub fn cycles_to_ns(&self, cycles: f64) -> f64 {
        cycles * 1000.0 / self.clock_mhz
    }

    /// Derives the live figures from the raw register pair of the last snapshot.
    pub fn live_stat(&self, stat: &mut BurstStat, burst_size: u32) {
        stat.live_inst = stat.reg_inst as f64;
        stat.live_total_ns = self.cycles_to_ns(stat.reg_total as f64);
        stat.live_average_ns = if stat.live_inst > 0.0 {
            stat.live_total_ns / stat.live_inst
        } else {
            0.0
        };
        stat.live_average_mbps = average_mbps(burst_size, stat.live_average_ns);
        stat.live_bw_mbps = bw_mbps(burst_size, stat.live_inst);
    }

    /// Folds the live sample into the running mean. `hw_sec_cnt` is the
    /// 1-based index of the current poll within the iteration.
    pub fn accumulate(&self, stat: &mut BurstStat, burst_size: u32, hw_sec_cnt: u64) {
        if hw_sec_cnt <= 1 {
            stat.acc_inst = stat.live_inst;
            stat.acc_ns = stat.live_average_ns;
        } else {
            stat.acc_inst += stat.live_inst;
            stat.acc_ns += stat.live_average_ns;
        }
        let n = hw_sec_cnt.max(1) as f64;
        stat.average_inst = stat.acc_inst / n;
        stat.average_ns = stat.acc_ns / n;
        stat.average_mbps = average_mbps(burst_size, stat.average_ns);
        stat.average_bw_mbps = bw_mbps(burst_size, stat.average_inst);
    }

    // 每次轮询后对一个通道的两个方向做 live + accumulate
    pub fn update_channel(&self, status: &mut ChannelStatus, it: &TestIteration, hw_sec_cnt: u64) {
        for dir in Direction::BOTH {
            let burst_size = it.settings(dir).burst_size;
            let stat = status.burst_mut(dir);
            self.live_stat(stat, burst_size);
            self.accumulate(stat, burst_size, hw_sec_cnt);
        }
    }
}

/// Combined figure across the contributing channels of one direction.
/// Latency-type fields are averaged, bandwidth fields are summed.
pub fn combine<'a, I>(stats: I) -> BurstStat
where
    I: IntoIterator<Item = &'a BurstStat>,
{
    let list: Vec<&BurstStat> = stats.into_iter().collect();
    let mut combined = BurstStat::default();
    if list.is_empty() {
        return combined;
    }
    let n = list.len() as f64;
    for s in list {
        combined.live_inst += s.live_inst / n;
        combined.live_total_ns += s.live_total_ns / n;
        combined.live_average_ns += s.live_average_ns / n;
        combined.live_average_mbps += s.live_average_mbps / n;
        combined.average_inst += s.average_inst / n;
        combined.average_ns += s.average_ns / n;
        combined.average_mbps += s.average_mbps / n;

        combined.live_bw_mbps += s.live_bw_mbps;
        combined.average_bw_mbps += s.average_bw_mbps;
    }
    combined
}

// 单通道写+读带宽，只填带宽字段
pub fn wr_plus_rd(status: &ChannelStatus, it: &TestIteration) -> BurstStat {
    let mut total = BurstStat::default();
    for dir in Direction::BOTH {
        if it.mode.has(dir) {
            let s = status.burst(dir);
            total.live_bw_mbps += s.live_bw_mbps;
            total.average_bw_mbps += s.average_bw_mbps;
        }
    }
    total
}

pub fn combined_wr_plus_rd<'a, I>(per_channel: I) -> BurstStat
where
    I: IntoIterator<Item = &'a BurstStat>,
{
    let mut total = BurstStat::default();
    for s in per_channel {
        total.live_bw_mbps += s.live_bw_mbps;
        total.average_bw_mbps += s.average_bw_mbps;
    }
    total
}
