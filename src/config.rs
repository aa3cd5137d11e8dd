// 配置层：内存描述、参数边界、通道配置以及测试序列条目的文本解析
//
// 所有检查都在接触硬件之前完成，错误会被收集后统一通过
// EngineError::ConfigParse 返回

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{EngineError, EngineResult};
use crate::types::{Direction, PerMode, TestMode, Threshold, WrRd};

const MIB: u64 = 1024 * 1024;

pub const MIN_MEM_RATE: f64 = 1.0;
pub const MAX_MEM_RATE: f64 = 100.0;
pub const MIN_MEM_BANDWIDTH: u32 = 1;
pub const MIN_START_ADDR: u32 = 0;
pub const MIN_BURST_XFER: u32 = 2;
pub const MAX_BURST_XFER_512B: u32 = 64;
pub const MAX_BURST_XFER_BELOW_512B: u32 = 128;
pub const MIN_BLOCK_SIZE: u32 = 1;
pub const MIN_OUTSTANDING: u32 = 0;
pub const MAX_OUTSTANDING: u32 = 255;
pub const MIN_DURATION: u32 = 1;
pub const MAX_DURATION: u32 = u32::MAX;
pub const MIN_LO_THRESH: f64 = 1.0;
pub const DEFAULT_PATTERN_WORDS: [&str; 2] = ["0xCAFECAFE", "0xF00DF00D"];

lazy_static! {
    static ref PATTERN_WORD_REGEX: Regex = Regex::new(r"^(?:0[xX])?([0-9a-fA-F]{1,8})$").unwrap();
    static ref SEQ_HEAD_REGEX: Regex = Regex::new(r"^\s*(\d+)\s*,\s*([A-Za-z_]+)\s*$").unwrap();
    static ref SEQ_PARAM_REGEX: Regex = Regex::new(r"^\s*([a-z_]+)\s*=\s*([0-9]+(?:\.[0-9]+)?)\s*$").unwrap();
    static ref CHANNEL_PREFIX_REGEX: Regex = Regex::new(r"^\s*(\d+)\s*:(.*)$").unwrap();
    static ref THRESHOLD_REGEX: Regex =
        Regex::new(r"^\s*(?:(\d+)\s*:)?\s*([A-Za-z_]+)\s*:\s*(wr|rd)\s*:\s*([0-9.]+)\s*:\s*([0-9.]+)\s*$").unwrap();
}

// ---------------------------------------------------------------------------
// 内存描述
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    SingleChannel,
    MultiChannel,
}

/// Description of the memory resource and of the test block attached to it.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    pub name: String,
    pub kind: MemoryKind,
    pub num_channels: usize,
    /// Total size of the memory in MB, shared by all channels.
    pub size_mb: u64,
    pub axi_data_bits: u32,
    pub num_axi_thread: u32,
    pub clock_mhz: u32,
    pub rate: PerMode<f64>,
    pub outstanding: PerMode<u32>,
    /// `None` means the maximum burst size.
    pub burst_size: PerMode<Option<u32>>,
    pub bw_thresholds: PerMode<Threshold>,
    pub latency_thresholds: PerMode<Threshold>,
}

impl MemorySettings {
    pub fn axi_bytes(&self) -> u32 {
        self.axi_data_bits / 8
    }

    pub fn channel_size_bytes(&self) -> u64 {
        self.size_mb * MIB / self.num_channels.max(1) as u64
    }

    pub fn validate(&self) -> EngineResult<()> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("memory name is not set".to_string());
        }
        if self.num_channels == 0 {
            errors.push(format!("number of channels ({}) is invalid", self.num_channels));
        }
        if self.axi_data_bits == 0 || self.axi_data_bits % 8 != 0 {
            errors.push(format!("AXI data width ({} bits) is invalid", self.axi_data_bits));
        }
        if self.clock_mhz == 0 {
            errors.push("clock frequency must be greater than 0 MHz".to_string());
        }
        if self.size_mb == 0 {
            errors.push("memory size must be greater than 0 MB".to_string());
        }
        for mode in TestMode::ALL {
            for dir in Direction::BOTH {
                if !mode.has(dir) {
                    continue;
                }
                let tag = format!("{} {}", mode, dir.as_str());
                if let Err(e) = check_threshold(&format!("bandwidth {}", tag), self.bw_thresholds.for_mode(mode).get(dir)) {
                    errors.push(e);
                }
                if let Err(e) = check_threshold(&format!("latency {}", tag), self.latency_thresholds.for_mode(mode).get(dir)) {
                    errors.push(e);
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::ConfigParse(errors))
        }
    }
}

fn check_threshold(name: &str, t: &Threshold) -> Result<(), String> {
    if t.low < MIN_LO_THRESH {
        return Err(format!("{} low threshold ({}) is below {}", name, t.low, MIN_LO_THRESH));
    }
    if t.low > t.high {
        return Err(format!("{} low threshold ({}) is greater than high threshold ({})", name, t.low, t.high));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 参数边界
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBounds {
    pub axi_bytes: u32,
    pub min_rate: f64,
    pub max_rate: f64,
    pub min_bandwidth: u32,
    pub max_bandwidth: u32,
    pub min_start_addr: u32,
    pub min_burst_xfer: u32,
    pub max_burst_xfer: u32,
    pub min_burst_size: u32,
    pub max_burst_size: u32,
    pub min_block_size: u32,
    pub max_block_size: u32,
    pub min_total_xfer: u32,
    pub max_total_xfer: u32,
    /// Nominal burst sizes with the defaults resolved.
    pub burst_size_nominal: PerMode<u32>,
}

impl ParameterBounds {
    pub fn derive(settings: &MemorySettings) -> EngineResult<Self> {
        settings.validate()?;

        let axi_bytes = settings.axi_bytes();
        let mem_size_bytes = settings.channel_size_bytes();

        let max_bandwidth =
            (axi_bytes as f64 * settings.clock_mhz as f64 * 1_000_000.0 / MIB as f64) as u32;

        let max_burst_xfer = if axi_bytes == 64 {
            MAX_BURST_XFER_512B
        } else {
            MAX_BURST_XFER_BELOW_512B
        };
        let min_burst_size = MIN_BURST_XFER * axi_bytes;
        let max_burst_size = max_burst_xfer * axi_bytes;

        let max_block_size = (mem_size_bytes / MIB) as u32;
        let min_total_xfer = (MIN_BLOCK_SIZE as u64 * MIB / axi_bytes as u64) as u32;
        let max_total_xfer = max_block_size as u64 * MIB / axi_bytes as u64;

        // 每通道容量必须能被传输宽度整除，且按 MB 取整后不能丢失字节
        let exact = mem_size_bytes % axi_bytes as u64 == 0
            && max_total_xfer == mem_size_bytes / axi_bytes as u64
            && max_total_xfer <= u32::MAX as u64;
        if !exact {
            return Err(EngineError::config(format!(
                "maximum number of transfers ({}) is not an integer: memory size per channel {} bytes, transfer width {} bytes",
                mem_size_bytes as f64 / axi_bytes as f64,
                mem_size_bytes,
                axi_bytes
            )));
        }
        if max_block_size < MIN_BLOCK_SIZE {
            return Err(EngineError::config(format!(
                "memory size per channel ({} bytes) is below the minimum block size of {} MB",
                mem_size_bytes, MIN_BLOCK_SIZE
            )));
        }

        let mut burst_size_nominal = PerMode::uniform(max_burst_size);
        for mode in TestMode::ALL {
            let src = settings.burst_size.for_mode(mode);
            let dst = burst_size_nominal.for_mode_mut(mode);
            *dst = WrRd::new(src.write.unwrap_or(max_burst_size), src.read.unwrap_or(max_burst_size));
        }

        Ok(ParameterBounds {
            axi_bytes,
            min_rate: MIN_MEM_RATE,
            max_rate: MAX_MEM_RATE,
            min_bandwidth: MIN_MEM_BANDWIDTH,
            max_bandwidth,
            min_start_addr: MIN_START_ADDR,
            min_burst_xfer: MIN_BURST_XFER,
            max_burst_xfer,
            min_burst_size,
            max_burst_size,
            min_block_size: MIN_BLOCK_SIZE,
            max_block_size,
            min_total_xfer,
            max_total_xfer: max_total_xfer as u32,
            burst_size_nominal,
        })
    }

    /// Smallest block size in MB accepted for `burst_size`: the first multiple
    /// of the burst size from two bursts upwards that reaches the minimum block.
    pub fn min_block_size_for(&self, burst_size: u32) -> u32 {
        let burst = burst_size.max(1) as u64;
        let mut min_block = 2 * burst;
        while min_block / MIB < self.min_block_size as u64 && min_block % MIB != 0 {
            min_block += burst;
        }
        (min_block / MIB) as u32
    }

    pub fn describe(&self) -> String {
        format!(
            "rate = [{} ; {}], bandwidth = [{} ; {}], start address = [{} ; {}], burst size = [{} ; {}], block size = [{} ; {}], transfers per burst = [{} ; {}], total transfers = [{} ; {}]",
            self.min_rate,
            self.max_rate,
            self.min_bandwidth,
            self.max_bandwidth,
            self.min_start_addr,
            self.max_block_size - self.min_block_size,
            self.min_burst_size,
            self.max_burst_size,
            self.min_block_size,
            self.max_block_size,
            self.min_burst_xfer,
            self.max_burst_xfer,
            self.min_total_xfer,
            self.max_total_xfer
        )
    }
}

// ---------------------------------------------------------------------------
// 通道配置
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMode {
    Prbs,
    Fixed,
    Alternate,
}

impl PatternMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "prbs" => Some(PatternMode::Prbs),
            "fixed" => Some(PatternMode::Fixed),
            "alternate" => Some(PatternMode::Alternate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatternMode::Prbs => "prbs",
            PatternMode::Fixed => "fixed",
            PatternMode::Alternate => "alternate",
        }
    }
}

/// A check-enable flag and whether the user set it explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckFlag {
    pub enabled: bool,
    pub explicit: bool,
}

impl CheckFlag {
    pub fn from_option(value: Option<bool>, default: bool) -> Self {
        CheckFlag {
            enabled: value.unwrap_or(default),
            explicit: value.is_some(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub disable: bool,
    pub disable_prewrite: bool,
    pub single_axi_thread: bool,
    pub pattern: PatternMode,
    pub pattern_words: Vec<u32>,
    pub check_bw: CheckFlag,
    pub check_latency: CheckFlag,
    pub check_data_integrity: bool,
    pub bw: PerMode<Threshold>,
    pub latency: PerMode<Threshold>,
}

impl ChannelConfig {
    pub fn checks_integrity(&self) -> bool {
        self.check_data_integrity && self.pattern == PatternMode::Prbs
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdOverride {
    pub channel: Option<usize>,
    pub mode: TestMode,
    pub direction: Direction,
    pub threshold: Threshold,
}

/// Testcase-level options; per-channel lists override the global value.
#[derive(Debug, Clone, Default)]
pub struct TestcaseOptions {
    pub disable_channels: Vec<usize>,
    pub disable_prewrite: bool,
    pub single_axi_thread: bool,
    pub pattern: Option<String>,
    pub pattern_words: Option<Vec<String>>,
    pub channel_patterns: Vec<(usize, String)>,
    pub check_bw: Option<bool>,
    pub check_latency: Option<bool>,
    pub check_data_integrity: Option<bool>,
    pub bw_overrides: Vec<ThresholdOverride>,
    pub latency_overrides: Vec<ThresholdOverride>,
}

#[derive(Debug, Clone)]
pub struct TestcaseConfig {
    pub channels: Vec<ChannelConfig>,
    pub enabled: Vec<usize>,
}

impl TestcaseConfig {
    pub fn build(settings: &MemorySettings, opts: &TestcaseOptions) -> EngineResult<Self> {
        let mut errors = Vec::new();

        let global_pattern = match opts.pattern.as_deref() {
            None => PatternMode::Prbs,
            Some(name) => PatternMode::from_name(name).unwrap_or_else(|| {
                errors.push(format!("pattern control \"{}\" is not supported (prbs, fixed, alternate)", name));
                PatternMode::Prbs
            }),
        };

        let word_strs: Vec<String> = match &opts.pattern_words {
            Some(list) => list.clone(),
            None => DEFAULT_PATTERN_WORDS.iter().map(|s| s.to_string()).collect(),
        };
        let mut words = Vec::with_capacity(word_strs.len());
        for s in &word_strs {
            match parse_pattern_word(s) {
                Some(w) => words.push(w),
                None => errors.push(format!("pattern word \"{}\" is not a 32-bit hexadecimal value", s)),
            }
        }

        for ch in &opts.disable_channels {
            if *ch >= settings.num_channels {
                errors.push(format!("disabled channel {} does not exist ({} channels)", ch, settings.num_channels));
            }
        }

        let mut channels = Vec::with_capacity(settings.num_channels);
        for ch in 0..settings.num_channels {
            let pattern = match opts.channel_patterns.iter().rev().find(|(c, _)| *c == ch) {
                Some((_, name)) => PatternMode::from_name(name).unwrap_or_else(|| {
                    errors.push(format!("pattern control \"{}\" is not supported (channel {})", name, ch));
                    global_pattern
                }),
                None => global_pattern,
            };
            match pattern {
                PatternMode::Alternate if words.len() < 2 => errors.push(format!(
                    "at least 2 pattern words are required for {} pattern control (channel {})",
                    pattern.as_str(),
                    ch
                )),
                PatternMode::Fixed if words.is_empty() => errors.push(format!(
                    "at least 1 pattern word is required for {} pattern control (channel {})",
                    pattern.as_str(),
                    ch
                )),
                _ => {}
            }

            let mut bw = settings.bw_thresholds;
            let mut latency = settings.latency_thresholds;
            apply_overrides(&mut bw, &opts.bw_overrides, ch);
            apply_overrides(&mut latency, &opts.latency_overrides, ch);
            for mode in TestMode::ALL {
                for dir in Direction::BOTH {
                    if !mode.has(dir) {
                        continue;
                    }
                    let tag = format!("{} {} (channel {})", mode, dir.as_str(), ch);
                    if let Err(e) = check_threshold(&format!("bandwidth {}", tag), bw.for_mode(mode).get(dir)) {
                        errors.push(e);
                    }
                    if let Err(e) = check_threshold(&format!("latency {}", tag), latency.for_mode(mode).get(dir)) {
                        errors.push(e);
                    }
                }
            }

            channels.push(ChannelConfig {
                disable: opts.disable_channels.contains(&ch),
                disable_prewrite: opts.disable_prewrite,
                single_axi_thread: opts.single_axi_thread,
                pattern,
                pattern_words: words.clone(),
                check_bw: CheckFlag::from_option(opts.check_bw, true),
                check_latency: CheckFlag::from_option(opts.check_latency, true),
                check_data_integrity: opts.check_data_integrity.unwrap_or(true),
                bw,
                latency,
            });
        }

        let enabled: Vec<usize> = channels
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.disable)
            .map(|(i, _)| i)
            .collect();
        if enabled.is_empty() {
            if settings.kind == MemoryKind::MultiChannel {
                errors.push("all channels are disabled".to_string());
            } else {
                errors.push("the only channel of the memory is disabled".to_string());
            }
        }

        if errors.is_empty() {
            Ok(TestcaseConfig { channels, enabled })
        } else {
            Err(EngineError::ConfigParse(errors))
        }
    }

    pub fn combined_check_integrity(&self) -> bool {
        self.enabled.iter().any(|&ch| self.channels[ch].checks_integrity())
    }
}

fn apply_overrides(table: &mut PerMode<Threshold>, overrides: &[ThresholdOverride], ch: usize) {
    // 先应用全局覆盖，再应用通道覆盖
    for o in overrides.iter().filter(|o| o.channel.is_none()) {
        *table.for_mode_mut(o.mode).get_mut(o.direction) = o.threshold;
    }
    for o in overrides.iter().filter(|o| o.channel == Some(ch)) {
        *table.for_mode_mut(o.mode).get_mut(o.direction) = o.threshold;
    }
}

pub fn parse_pattern_word(s: &str) -> Option<u32> {
    let caps = PATTERN_WORD_REGEX.captures(s.trim())?;
    u32::from_str_radix(&caps[1], 16).ok()
}

/// `[<ch>:]<mode>:<wr|rd>:<low>:<high>`
pub fn parse_threshold_override(s: &str) -> Result<ThresholdOverride, String> {
    let caps = THRESHOLD_REGEX
        .captures(s)
        .ok_or_else(|| format!("invalid threshold \"{}\", expected [<ch>:]<mode>:<wr|rd>:<low>:<high>", s))?;
    let channel = match caps.get(1) {
        Some(m) => Some(m.as_str().parse::<usize>().map_err(|_| format!("invalid channel in \"{}\"", s))?),
        None => None,
    };
    let mode = TestMode::from_name(&caps[2]).ok_or_else(|| format!("unknown test mode \"{}\"", &caps[2]))?;
    let direction = if &caps[3] == "wr" { Direction::Write } else { Direction::Read };
    if !mode.has(direction) {
        return Err(format!("mode {} has no {} direction", mode, direction.as_str()));
    }
    let low = caps[4].parse::<f64>().map_err(|_| format!("invalid low threshold in \"{}\"", s))?;
    let high = caps[5].parse::<f64>().map_err(|_| format!("invalid high threshold in \"{}\"", s))?;
    Ok(ThresholdOverride {
        channel,
        mode,
        direction,
        threshold: Threshold::new(low, high),
    })
}

// ---------------------------------------------------------------------------
// 测试序列条目
// ---------------------------------------------------------------------------

// 用户针对一个方向给出的可选参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionRequest {
    pub rate: Option<f64>,
    pub bandwidth: Option<u32>,
    pub start_addr: Option<u32>,
    pub block_size: Option<u32>,
    pub burst_size: Option<u32>,
    pub outstanding: Option<u32>,
}

impl DirectionRequest {
    fn count(&self) -> usize {
        [
            self.rate.is_some(),
            self.bandwidth.is_some(),
            self.start_addr.is_some(),
            self.block_size.is_some(),
            self.burst_size.is_some(),
            self.outstanding.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

/// One user-specified iteration before extrapolation.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceEntry {
    pub duration: u32,
    pub mode: String,
    pub write: DirectionRequest,
    pub read: DirectionRequest,
}

impl SequenceEntry {
    pub fn new(duration: u32, mode: &str) -> Self {
        SequenceEntry {
            duration,
            mode: mode.to_string(),
            write: DirectionRequest::default(),
            read: DirectionRequest::default(),
        }
    }

    pub fn request(&self, dir: Direction) -> &DirectionRequest {
        match dir {
            Direction::Write => &self.write,
            Direction::Read => &self.read,
        }
    }

    pub fn num_params(&self) -> usize {
        2 + self.write.count() + self.read.count()
    }
}

/// Parses `<duration>,<mode>[,<key>=<value>...]`.
pub fn parse_sequence_entry(text: &str) -> Result<SequenceEntry, String> {
    let mut parts = text.split(',');
    let duration_str = parts.next().unwrap_or("");
    let mode_str = parts.next().unwrap_or("");
    let head = format!("{},{}", duration_str, mode_str);
    let caps = SEQ_HEAD_REGEX
        .captures(&head)
        .ok_or_else(|| format!("invalid test \"{}\", expected <duration>,<mode>[,<key>=<value>...]", text))?;
    let duration = caps[1]
        .parse::<u32>()
        .map_err(|_| format!("invalid duration \"{}\"", &caps[1]))?;
    let mut entry = SequenceEntry::new(duration, &caps[2]);

    for part in parts {
        let kv = SEQ_PARAM_REGEX
            .captures(part)
            .ok_or_else(|| format!("invalid parameter \"{}\" in test \"{}\"", part.trim(), text))?;
        let key = &kv[1];
        let value = &kv[2];
        let (req, name) = if let Some(rest) = key.strip_prefix("wr_") {
            (&mut entry.write, rest)
        } else if let Some(rest) = key.strip_prefix("rd_") {
            (&mut entry.read, rest)
        } else {
            return Err(format!("unknown parameter \"{}\" in test \"{}\"", key, text));
        };
        let as_u32 = || value.parse::<u32>().map_err(|_| format!("parameter {} expects an integer, got \"{}\"", key, value));
        match name {
            "rate" => req.rate = Some(value.parse::<f64>().map_err(|_| format!("invalid {} \"{}\"", key, value))?),
            "bw" | "bandwidth" => req.bandwidth = Some(as_u32()?),
            "start_addr" => req.start_addr = Some(as_u32()?),
            "block_size" => req.block_size = Some(as_u32()?),
            "burst_size" => req.burst_size = Some(as_u32()?),
            "outstanding" => req.outstanding = Some(as_u32()?),
            _ => return Err(format!("unknown parameter \"{}\" in test \"{}\"", key, text)),
        }
    }
    Ok(entry)
}

/// Parses `<channel>:<entry>` for per-channel sequence overrides.
pub fn parse_channel_entry(text: &str) -> Result<(usize, SequenceEntry), String> {
    let caps = CHANNEL_PREFIX_REGEX
        .captures(text)
        .ok_or_else(|| format!("invalid channel test \"{}\", expected <channel>:<test>", text))?;
    let ch = caps[1]
        .parse::<usize>()
        .map_err(|_| format!("invalid channel \"{}\"", &caps[1]))?;
    Ok((ch, parse_sequence_entry(&caps[2])?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    // 64 字节传输宽度、300MHz、每通道 1GB 的典型 HBM/DDR 描述
    pub fn sample_settings(num_channels: usize) -> MemorySettings {
        let mut rate = PerMode::uniform(100.0);
        rate.alt_wr_rd = WrRd::new(50.0, 50.0);
        rate.simul_wr_rd = WrRd::new(50.0, 50.0);
        MemorySettings {
            name: "DDR".to_string(),
            kind: if num_channels > 1 { MemoryKind::MultiChannel } else { MemoryKind::SingleChannel },
            num_channels,
            size_mb: 1024 * num_channels as u64,
            axi_data_bits: 512,
            num_axi_thread: 1,
            clock_mhz: 300,
            rate,
            outstanding: PerMode::uniform(0),
            burst_size: PerMode::uniform(None),
            bw_thresholds: PerMode::uniform(Threshold::new(1.0, 100_000.0)),
            latency_thresholds: PerMode::uniform(Threshold::new(1.0, 100_000.0)),
        }
    }

    #[test]
    fn bounds_follow_transfer_width_and_clock() {
        let b = ParameterBounds::derive(&sample_settings(1)).unwrap();
        assert_eq!(b.axi_bytes, 64);
        assert_eq!(b.max_bandwidth, 18310);
        assert_eq!(b.max_burst_xfer, 64);
        assert_eq!(b.min_burst_size, 128);
        assert_eq!(b.max_burst_size, 4096);
        assert_eq!(b.max_block_size, 1024);
        assert_eq!(b.min_total_xfer, 16384);
        assert_eq!(b.max_total_xfer, 16 * 1024 * 1024);
        assert_eq!(b.burst_size_nominal.nominal(TestMode::OnlyWr, Direction::Write), 4096);
    }

    #[test]
    fn narrow_transfer_width_allows_longer_bursts() {
        let mut s = sample_settings(1);
        s.axi_data_bits = 256;
        let b = ParameterBounds::derive(&s).unwrap();
        assert_eq!(b.max_burst_xfer, 128);
        assert_eq!(b.max_burst_size, 4096);
        assert_eq!(b.min_burst_size, 64);
    }

    #[test]
    fn inexact_channel_size_is_rejected() {
        let mut s = sample_settings(3);
        s.size_mb = 1000;
        assert!(matches!(ParameterBounds::derive(&s), Err(EngineError::ConfigParse(_))));
    }

    #[test]
    fn min_block_size_rounds_to_whole_megabytes() {
        let b = ParameterBounds::derive(&sample_settings(1)).unwrap();
        assert_eq!(b.min_block_size_for(4096), 1);
        assert_eq!(b.min_block_size_for(128), 1);
        // 3 * 64 字节的突发在 1MB 处无法对齐，停在第一个超过 1MB 的倍数
        assert_eq!(b.min_block_size_for(192), 1);
    }

    #[test]
    fn pattern_words_accept_optional_prefix() {
        assert_eq!(parse_pattern_word("0xCAFECAFE"), Some(0xCAFE_CAFE));
        assert_eq!(parse_pattern_word("f00d"), Some(0xF00D));
        assert_eq!(parse_pattern_word("0x123456789"), None);
        assert_eq!(parse_pattern_word("0xZZ"), None);
    }

    #[test]
    fn alternate_pattern_needs_two_words() {
        let s = sample_settings(1);
        let opts = TestcaseOptions {
            pattern: Some("alternate".into()),
            pattern_words: Some(vec!["0x1".into()]),
            ..Default::default()
        };
        assert!(TestcaseConfig::build(&s, &opts).is_err());

        let opts = TestcaseOptions {
            pattern: Some("alternate".into()),
            pattern_words: Some(vec!["0x1".into(), "0x2".into()]),
            ..Default::default()
        };
        let cfg = TestcaseConfig::build(&s, &opts).unwrap();
        assert_eq!(cfg.channels[0].pattern_words, vec![1, 2]);
    }

    #[test]
    fn fixed_pattern_needs_one_word() {
        let s = sample_settings(1);
        let opts = TestcaseOptions {
            pattern: Some("fixed".into()),
            pattern_words: Some(vec![]),
            ..Default::default()
        };
        assert!(TestcaseConfig::build(&s, &opts).is_err());
    }

    #[test]
    fn default_pattern_is_prbs_with_default_words() {
        let cfg = TestcaseConfig::build(&sample_settings(2), &TestcaseOptions::default()).unwrap();
        assert_eq!(cfg.enabled, vec![0, 1]);
        assert_eq!(cfg.channels[1].pattern, PatternMode::Prbs);
        assert_eq!(cfg.channels[1].pattern_words, vec![0xCAFE_CAFE, 0xF00D_F00D]);
        assert!(cfg.channels[0].check_bw.enabled);
        assert!(!cfg.channels[0].check_bw.explicit);
        assert!(cfg.combined_check_integrity());
    }

    #[test]
    fn all_channels_disabled_fails_on_multi_channel_memory() {
        let opts = TestcaseOptions {
            disable_channels: vec![0, 1],
            ..Default::default()
        };
        assert!(TestcaseConfig::build(&sample_settings(2), &opts).is_err());
        let opts = TestcaseOptions {
            disable_channels: vec![1],
            ..Default::default()
        };
        assert_eq!(TestcaseConfig::build(&sample_settings(2), &opts).unwrap().enabled, vec![0]);
    }

    #[test]
    fn inverted_threshold_override_is_rejected() {
        let opts = TestcaseOptions {
            bw_overrides: vec![parse_threshold_override("1:only_wr:wr:900:800").unwrap()],
            ..Default::default()
        };
        assert!(TestcaseConfig::build(&sample_settings(2), &opts).is_err());
    }

    #[test]
    fn channel_threshold_override_wins_over_global() {
        let opts = TestcaseOptions {
            bw_overrides: vec![
                parse_threshold_override("1:only_wr:wr:300:400").unwrap(),
                parse_threshold_override("only_wr:wr:100:200").unwrap(),
            ],
            ..Default::default()
        };
        let cfg = TestcaseConfig::build(&sample_settings(2), &opts).unwrap();
        assert_eq!(cfg.channels[0].bw.only_wr.write, Threshold::new(100.0, 200.0));
        assert_eq!(cfg.channels[1].bw.only_wr.write, Threshold::new(300.0, 400.0));
    }

    #[test]
    fn sequence_entry_parses_direction_parameters() {
        let e = parse_sequence_entry("20, only_wr, wr_burst_size=256, wr_block_size=16, wr_rate=50.5").unwrap();
        assert_eq!(e.duration, 20);
        assert_eq!(e.mode, "only_wr");
        assert_eq!(e.write.burst_size, Some(256));
        assert_eq!(e.write.block_size, Some(16));
        assert_eq!(e.write.rate, Some(50.5));
        assert_eq!(e.read, DirectionRequest::default());
        assert_eq!(e.num_params(), 5);
    }

    #[test]
    fn sequence_entry_rejects_unknown_keys() {
        assert!(parse_sequence_entry("20,only_wr,foo=1").is_err());
        assert!(parse_sequence_entry("20").is_err());
        assert!(parse_sequence_entry("x,only_wr").is_err());
        assert!(parse_sequence_entry("20,only_wr,wr_block_size=1.5").is_err());
    }

    #[test]
    fn channel_entry_splits_channel_prefix() {
        let (ch, e) = parse_channel_entry("3:10,only_rd,rd_outstanding=8").unwrap();
        assert_eq!(ch, 3);
        assert_eq!(e.read.outstanding, Some(8));
    }
}
