// 测试序列规划：把用户给出的测试条目补全为完整的迭代参数并逐项校验
// 纯计算，不访问硬件

use crate::config::{
    DirectionRequest, MemorySettings, ParameterBounds, SequenceEntry, MAX_DURATION, MAX_OUTSTANDING, MIN_DURATION,
    MIN_OUTSTANDING,
};
use crate::error::{EngineError, EngineResult};
use crate::types::{Direction, DirectionSettings, TestIteration, TestMode};

const MIB: u64 = 1024 * 1024;

/// Erroneous iterations tolerated before the parse gives up.
pub const MAX_NUM_PARSER_ERROR: usize = 20;

/// Global sequence plus the sequence each channel will actually run.
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub global: Vec<TestIteration>,
    pub per_channel: Vec<Vec<TestIteration>>,
    pub overridden: Vec<bool>,
}

impl TestPlan {
    pub fn num_iterations(&self) -> usize {
        self.global.len()
    }

    pub fn iteration(&self, ch: usize, idx: usize) -> &TestIteration {
        &self.per_channel[ch][idx]
    }
}

pub struct SequencePlanner<'a> {
    settings: &'a MemorySettings,
    bounds: ParameterBounds,
    max_errors: usize,
}

impl<'a> SequencePlanner<'a> {
    pub fn new(settings: &'a MemorySettings) -> EngineResult<Self> {
        Ok(SequencePlanner {
            settings,
            bounds: ParameterBounds::derive(settings)?,
            max_errors: MAX_NUM_PARSER_ERROR,
        })
    }

    #[cfg(test)]
    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors.max(1);
        self
    }

    pub fn bounds(&self) -> &ParameterBounds {
        &self.bounds
    }

    /// Extrapolates and validates every entry. Diagnostics of all failing
    /// entries are collected, up to the error cap.
    pub fn plan(&self, entries: &[SequenceEntry]) -> EngineResult<Vec<TestIteration>> {
        if entries.is_empty() {
            return Err(EngineError::config("test sequence is empty"));
        }
        let mut iterations = Vec::with_capacity(entries.len());
        let mut errors = Vec::new();
        let mut failing = 0;

        for (idx, entry) in entries.iter().enumerate() {
            match self.extrapolate(entry) {
                Ok(it) => iterations.push(it),
                Err(list) => {
                    failing += 1;
                    for msg in list {
                        errors.push(format!("test {}: {}", idx + 1, msg));
                    }
                    if failing > self.max_errors {
                        errors.push(format!("too many errors ({}), test sequence parsing stopped", failing));
                        break;
                    }
                }
            }
        }
        if !errors.is_empty() {
            return Err(EngineError::ConfigParse(errors));
        }

        log_debug_fmt!("Extrapolated test sequence:");
        for (idx, (entry, it)) in entries.iter().zip(&iterations).enumerate() {
            log_debug_fmt!("\t- test {} ({} parameters given): {}", idx + 1, entry.num_params(), it.describe_resolved());
        }
        Ok(iterations)
    }

    /// Builds the per-channel sequences. A channel override must have the
    /// same number of iterations and the same durations as `global`.
    pub fn plan_channels(
        &self,
        global: Vec<TestIteration>,
        overrides: &[(usize, SequenceEntry)],
    ) -> EngineResult<TestPlan> {
        let num_channels = self.settings.num_channels;
        let mut errors = Vec::new();
        let mut per_channel = vec![global.clone(); num_channels];
        let mut overridden = vec![false; num_channels];

        for ch in 0..num_channels {
            let entries: Vec<SequenceEntry> = overrides
                .iter()
                .filter(|(c, _)| *c == ch)
                .map(|(_, e)| e.clone())
                .collect();
            if entries.is_empty() {
                continue;
            }
            let list = match self.plan(&entries) {
                Ok(list) => list,
                Err(EngineError::ConfigParse(msgs)) => {
                    errors.extend(msgs.into_iter().map(|m| format!("channel {}: {}", ch, m)));
                    continue;
                }
                Err(e) => return Err(e),
            };
            if list.len() != global.len() {
                errors.push(format!(
                    "channel {}: test sequence has {} tests, expected {} as in the global test sequence",
                    ch,
                    list.len(),
                    global.len()
                ));
                continue;
            }
            for (idx, (c_it, g_it)) in list.iter().zip(global.iter()).enumerate() {
                if c_it.duration != g_it.duration {
                    errors.push(format!(
                        "channel {}: test {} duration {} s does not match global duration {} s",
                        ch,
                        idx + 1,
                        c_it.duration,
                        g_it.duration
                    ));
                }
            }
            per_channel[ch] = list;
            overridden[ch] = true;
        }
        for (ch, _) in overrides {
            if *ch >= num_channels {
                errors.push(format!("channel {} does not exist ({} channels)", ch, num_channels));
            }
        }

        if !errors.is_empty() {
            return Err(EngineError::ConfigParse(errors));
        }
        Ok(TestPlan {
            global,
            per_channel,
            overridden,
        })
    }

    fn extrapolate(&self, entry: &SequenceEntry) -> Result<TestIteration, Vec<String>> {
        let mut errors = Vec::new();
        let mode = match TestMode::from_name(&entry.mode) {
            Some(m) => m,
            None => {
                return Err(vec![format!(
                    "invalid test mode \"{}\", supported: alternate_wr_rd, only_wr, only_rd, simultaneous_wr_rd",
                    entry.mode
                )])
            }
        };

        if !(MIN_DURATION..=MAX_DURATION).contains(&entry.duration) {
            errors.push(format!(
                "duration {} s out of range [{} ; {}]",
                entry.duration, MIN_DURATION, MAX_DURATION
            ));
        }

        let mut user_params = vec![format!("duration = {}", entry.duration), format!("mode = {}", mode)];
        let mut it = TestIteration {
            duration: entry.duration,
            mode,
            write: DirectionSettings::default(),
            read: DirectionSettings::default(),
            user_params: Vec::new(),
            resolved_params: Vec::new(),
        };

        for dir in Direction::BOTH {
            let req = entry.request(dir);
            let p = dir.prefix();
            if !mode.has(dir) {
                if *req != DirectionRequest::default() {
                    errors.push(format!("{} parameters are not used in mode {}", dir.as_str(), mode));
                }
                continue;
            }
            if let Some(v) = req.rate {
                user_params.push(format!("{}_rate = {}", p, v));
            }
            if let Some(v) = req.bandwidth {
                user_params.push(format!("{}_bw = {}", p, v));
            }
            if let Some(v) = req.start_addr {
                user_params.push(format!("{}_start_addr = {}", p, v));
            }
            if let Some(v) = req.block_size {
                user_params.push(format!("{}_block_size = {}", p, v));
            }
            if let Some(v) = req.burst_size {
                user_params.push(format!("{}_burst_size = {}", p, v));
            }
            if let Some(v) = req.outstanding {
                user_params.push(format!("{}_outstanding = {}", p, v));
            }
            match self.resolve_direction(mode, dir, entry) {
                Ok(s) => *it.settings_mut(dir) = s,
                Err(list) => errors.extend(list),
            }
        }

        if errors.is_empty() {
            if let Err(e) = check_memory_areas(&it) {
                errors.push(e);
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        it.user_params = user_params;
        it.resolved_params = resolved_params(&it);
        Ok(it)
    }

    fn resolve_direction(&self, mode: TestMode, dir: Direction, entry: &SequenceEntry) -> Result<DirectionSettings, Vec<String>> {
        let b = &self.bounds;
        let req = entry.request(dir);
        let p = dir.prefix();
        let mut errors = Vec::new();
        let mut s = DirectionSettings::default();

        if req.rate.is_some() && req.bandwidth.is_some() {
            errors.push(format!("{}_rate and {}_bw cannot be set together", p, p));
            return Err(errors);
        }

        let max_bw = b.max_bandwidth as f64;
        let mut min_rate = b.min_rate;
        if let Some(bw) = req.bandwidth {
            s.bandwidth = bw;
            let mut rate = bw as f64 / max_bw * 100.0;
            if mode == TestMode::AlternateWrRd {
                rate *= 2.0;
            }
            s.rate = rate.min(b.max_rate);
            min_rate = 0.0;
        } else {
            s.rate = req.rate.unwrap_or_else(|| self.settings.rate.nominal(mode, dir));
            let mut bw = s.rate * max_bw / 100.0;
            if mode == TestMode::AlternateWrRd {
                bw /= 2.0;
            }
            s.bandwidth = bw as u32;
        }

        s.burst_size = req.burst_size.unwrap_or_else(|| b.burst_size_nominal.nominal(mode, dir));
        s.outstanding = req.outstanding.unwrap_or_else(|| self.settings.outstanding.nominal(mode, dir));
        s.start_addr = req.start_addr.unwrap_or(if mode == TestMode::SimultaneousWrRd && dir == Direction::Read {
            b.max_block_size / 2
        } else {
            0
        });
        s.block_size = req.block_size.unwrap_or(if mode == TestMode::SimultaneousWrRd {
            b.max_block_size / 2
        } else {
            b.max_block_size
        });

        if s.rate < min_rate || s.rate > b.max_rate {
            errors.push(format!("{}_rate {} out of range [{} ; {}]", p, s.rate, min_rate, b.max_rate));
        }
        if s.bandwidth < b.min_bandwidth || s.bandwidth > b.max_bandwidth {
            errors.push(format!(
                "{}_bw {} MBps out of range [{} ; {}]",
                p, s.bandwidth, b.min_bandwidth, b.max_bandwidth
            ));
        }
        if s.burst_size < b.min_burst_size || s.burst_size > b.max_burst_size {
            errors.push(format!(
                "{}_burst_size {} Bytes out of range [{} ; {}]",
                p, s.burst_size, b.min_burst_size, b.max_burst_size
            ));
        }
        let min_block = b.min_block_size_for(s.burst_size);
        if s.block_size < min_block || s.block_size > b.max_block_size {
            errors.push(format!(
                "{}_block_size {} MB out of range [{} ; {}]",
                p, s.block_size, min_block, b.max_block_size
            ));
        } else {
            let max_start = b.max_block_size - s.block_size;
            if s.start_addr < b.min_start_addr || s.start_addr > max_start {
                errors.push(format!(
                    "{}_start_addr {} MB out of range [{} ; {}]",
                    p, s.start_addr, b.min_start_addr, max_start
                ));
            }
        }
        if s.outstanding > MAX_OUTSTANDING {
            errors.push(format!(
                "{}_outstanding {} out of range [{} ; {}]",
                p, s.outstanding, MIN_OUTSTANDING, MAX_OUTSTANDING
            ));
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        // 派生参数必须整除
        let axi = b.axi_bytes as u64;
        let block_bytes = s.block_size_bytes();
        s.end_addr = s.start_addr + s.block_size - 1;
        if s.burst_size as u64 % axi != 0 {
            errors.push(format!(
                "{}_burst_size {} Bytes is not a multiple of the transfer width {} Bytes",
                p, s.burst_size, axi
            ));
        } else {
            s.burst_xfer = (s.burst_size as u64 / axi) as u32;
        }
        if block_bytes % axi != 0 {
            errors.push(format!(
                "{}_block_size {} Bytes is not a multiple of the transfer width {} Bytes",
                p, block_bytes, axi
            ));
        } else {
            s.total_xfer = (block_bytes / axi) as u32;
        }
        if s.burst_size == 0 || block_bytes % s.burst_size as u64 != 0 {
            errors.push(format!(
                "{}_block_size {} Bytes is not a multiple of {}_burst_size {} Bytes",
                p, block_bytes, p, s.burst_size
            ));
        } else {
            s.num_burst = (block_bytes / s.burst_size as u64) as u32;
        }

        if errors.is_empty() {
            Ok(s)
        } else {
            Err(errors)
        }
    }
}

// 交替模式读写窗口必须一致，同时读写模式窗口不能重叠
fn check_memory_areas(it: &TestIteration) -> Result<(), String> {
    let (w, r) = (&it.write, &it.read);
    let ws = w.start_addr as u64 * MIB;
    let we = w.end_addr as u64 * MIB;
    let rs = r.start_addr as u64 * MIB;
    let re = r.end_addr as u64 * MIB;
    match it.mode {
        TestMode::AlternateWrRd => {
            if ws != rs || we != re {
                return Err(format!(
                    "write [{} ; {}] MB and read [{} ; {}] MB memory areas must be identical in mode {}",
                    w.start_addr, w.end_addr, r.start_addr, r.end_addr, it.mode
                ));
            }
        }
        TestMode::SimultaneousWrRd => {
            let overlap = (rs >= ws && rs <= we) || (re >= ws && re <= we) || (ws >= rs && ws <= re) || (we >= rs && we <= re);
            if overlap {
                return Err(format!(
                    "write [{} ; {}] MB and read [{} ; {}] MB memory areas overlap in mode {}",
                    w.start_addr, w.end_addr, r.start_addr, r.end_addr, it.mode
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolved_params(it: &TestIteration) -> Vec<String> {
    let mut params = vec![format!("duration = {}", it.duration), format!("mode = {}", it.mode)];
    for dir in Direction::BOTH {
        if !it.mode.has(dir) {
            continue;
        }
        let p = dir.prefix();
        let s = it.settings(dir);
        params.push(format!("{}_rate = {:.2}", p, s.rate));
        params.push(format!("{}_bw = {}", p, s.bandwidth));
        params.push(format!("{}_start_addr = {}", p, s.start_addr));
        params.push(format!("{}_end_addr = {}", p, s.end_addr));
        params.push(format!("{}_block_size = {}", p, s.block_size));
        params.push(format!("{}_burst_size = {}", p, s.burst_size));
        params.push(format!("{}_outstanding = {}", p, s.outstanding));
        params.push(format!("{}_burst_xfer = {}", p, s.burst_xfer));
        params.push(format!("{}_total_xfer = {}", p, s.total_xfer));
        params.push(format!("{}_num_burst = {}", p, s.num_burst));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_settings;
    use crate::config::{parse_channel_entry, parse_sequence_entry};

    fn entries(list: &[&str]) -> Vec<SequenceEntry> {
        list.iter().map(|s| parse_sequence_entry(s).unwrap()).collect()
    }

    #[test]
    fn only_write_scenario_derives_transfer_counts() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        let plan = planner
            .plan(&entries(&["20,only_wr,wr_burst_size=256,wr_block_size=16"]))
            .unwrap();
        let w = &plan[0].write;
        assert_eq!(w.burst_xfer, 4);
        assert_eq!(w.num_burst, 65536);
        assert_eq!(w.total_xfer, 262144);
        assert_eq!(w.end_addr, 15);
        assert_eq!(w.total_xfer as u64 * 64, w.block_size_bytes());
        assert_eq!(plan[0].user_params.len(), 4);
    }

    #[test]
    fn defaults_come_from_mode_nominals() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        let plan = planner
            .plan(&entries(&["10,simultaneous_wr_rd", "10,alternate_wr_rd", "10,only_rd"]))
            .unwrap();

        let simul = &plan[0];
        assert_eq!(simul.write.start_addr, 0);
        assert_eq!(simul.write.block_size, 512);
        assert_eq!(simul.read.start_addr, 512);
        assert_eq!(simul.read.end_addr, 1023);
        assert_eq!(simul.write.rate, 50.0);

        let alt = &plan[1];
        assert_eq!(alt.write.block_size, 1024);
        assert_eq!(alt.write.start_addr, alt.read.start_addr);
        // 交替模式带宽减半
        assert_eq!(alt.write.bandwidth, (50.0 * 18310.0 / 100.0 / 2.0) as u32);

        let rd = &plan[2];
        assert_eq!(rd.read.burst_size, 4096);
        assert_eq!(rd.read.rate, 100.0);
        assert_eq!(rd.write, DirectionSettings::default());
    }

    #[test]
    fn bandwidth_converts_to_rate() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        let plan = planner
            .plan(&entries(&["10,only_wr,wr_bw=9155", "10,alternate_wr_rd,wr_bw=18000,rd_bw=100"]))
            .unwrap();
        assert!((plan[0].write.rate - 9155.0 / 18310.0 * 100.0).abs() < 1e-9);
        // 交替模式速率翻倍后封顶 100
        assert_eq!(plan[1].write.rate, 100.0);
        assert!((plan[1].read.rate - 200.0 / 18310.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn rate_and_bandwidth_are_exclusive() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        assert!(planner.plan(&entries(&["10,only_wr,wr_rate=50,wr_bw=100"])).is_err());
    }

    #[test]
    fn out_of_range_fields_are_all_reported() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        let err = planner
            .plan(&entries(&["10,only_wr,wr_burst_size=8192,wr_outstanding=300", "0,only_rd"]))
            .unwrap_err();
        match err {
            EngineError::ConfigParse(list) => {
                assert!(list.iter().any(|m| m.starts_with("test 1:") && m.contains("wr_burst_size")));
                assert!(list.iter().any(|m| m.starts_with("test 1:") && m.contains("wr_outstanding")));
                assert!(list.iter().any(|m| m.starts_with("test 2:") && m.contains("duration")));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn start_address_is_bounded_by_block_size() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        assert!(planner.plan(&entries(&["10,only_wr,wr_block_size=512,wr_start_addr=512"])).is_ok());
        assert!(planner.plan(&entries(&["10,only_wr,wr_block_size=512,wr_start_addr=513"])).is_err());
    }

    #[test]
    fn burst_must_divide_block_and_match_transfer_width() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        // 192 = 3 * 64，但 1MB 不能被 192 整除
        assert!(planner.plan(&entries(&["10,only_wr,wr_burst_size=192,wr_block_size=1"])).is_err());
        assert!(planner.plan(&entries(&["10,only_wr,wr_burst_size=200"])).is_err());
    }

    #[test]
    fn alternate_windows_must_match_and_simultaneous_must_not_overlap() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        assert!(planner
            .plan(&entries(&["10,alternate_wr_rd,wr_block_size=16,rd_block_size=32"]))
            .is_err());
        assert!(planner
            .plan(&entries(&["10,simultaneous_wr_rd,wr_block_size=16,rd_block_size=16,rd_start_addr=8"]))
            .is_err());
        let ok = planner
            .plan(&entries(&["10,simultaneous_wr_rd,wr_block_size=16,rd_block_size=16,rd_start_addr=16"]))
            .unwrap();
        assert!(ok[0].write.end_addr < ok[0].read.start_addr);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        assert!(planner.plan(&entries(&["10,random_wr"])).is_err());
        assert!(planner.plan(&entries(&["10,only_wr,rd_rate=10"])).is_err());
    }

    #[test]
    fn error_cap_stops_parsing() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap().with_max_errors(2);
        let err = planner.plan(&entries(&["0,only_wr", "0,only_wr", "0,only_wr", "0,only_wr"])).unwrap_err();
        match err {
            EngineError::ConfigParse(list) => {
                assert!(list.iter().any(|m| m.starts_with("test 3:")));
                assert!(list.iter().all(|m| !m.starts_with("test 4:")));
                assert!(list.last().unwrap().contains("too many errors (3)"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn default_cap_accepts_twenty_bad_entries() {
        let settings = sample_settings(1);
        let planner = SequencePlanner::new(&settings).unwrap();
        let bad = vec!["0,only_wr"; 25];
        match planner.plan(&entries(&bad)).unwrap_err() {
            EngineError::ConfigParse(list) => {
                assert!(list.iter().any(|m| m.starts_with("test 20:")));
                assert!(list.iter().any(|m| m.starts_with("test 21:")));
                assert!(list.iter().all(|m| !m.starts_with("test 22:")));
                assert!(list.last().unwrap().contains("too many errors (21)"));
            }
            other => panic!("unexpected error {:?}", other),
        }

        let bad = vec!["0,only_wr"; MAX_NUM_PARSER_ERROR];
        match planner.plan(&entries(&bad)).unwrap_err() {
            EngineError::ConfigParse(list) => assert!(list.iter().all(|m| !m.contains("too many errors"))),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn channel_override_must_match_global_shape() {
        let settings = sample_settings(2);
        let planner = SequencePlanner::new(&settings).unwrap();
        let global = planner.plan(&entries(&["20,only_wr", "20,only_rd"])).unwrap();

        let ok = vec![
            parse_channel_entry("1:20,only_wr,wr_burst_size=256").unwrap(),
            parse_channel_entry("1:20,only_rd").unwrap(),
        ];
        let plan = planner.plan_channels(global.clone(), &ok).unwrap();
        assert_eq!(plan.overridden, vec![false, true]);
        assert_eq!(plan.iteration(1, 0).write.burst_size, 256);
        assert_eq!(plan.iteration(0, 0).write.burst_size, 4096);

        let short = vec![parse_channel_entry("1:20,only_wr").unwrap()];
        assert!(planner.plan_channels(global.clone(), &short).is_err());

        let wrong_duration = vec![
            parse_channel_entry("0:20,only_wr").unwrap(),
            parse_channel_entry("0:30,only_rd").unwrap(),
        ];
        assert!(planner.plan_channels(global.clone(), &wrong_duration).is_err());

        let missing = vec![parse_channel_entry("5:20,only_wr").unwrap()];
        assert!(planner.plan_channels(global, &missing).is_err());
    }
}
