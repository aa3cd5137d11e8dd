// 模拟的内存测试硬件块
//
// 用一个共享的虚拟毫秒时钟驱动 1Hz 时基：toggle 位每秒翻转，
// timestamp_1_sec 每秒加一，突发计数器按编程的速率和突发长度给出
// 上一秒的统计。VirtualTimer 推进同一个时钟，所以整次运行不需要真实等待。
//
// 支持的故障注入：错误锁存位、配置更新卡死、toggle 冻结、AXI 指针不一致、
// 寄存器访问失败

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{EngineError, EngineResult};
use crate::hw::*;

// 基础访问延迟（时钟周期），每个突发再加上它的传输拍数
const BASE_LATENCY_CYCLES: u64 = 96;
// 硬件秒边界相对虚拟时钟的相位
const TIMEBASE_PHASE_MS: u64 = 500;

/// Timer over a shared millisecond counter. When `paced`, every wait also
/// sleeps for real so a run can be watched at its natural speed.
pub struct VirtualTimer {
    clock: Arc<AtomicU64>,
    paced: bool,
}

impl VirtualTimer {
    pub fn new() -> Self {
        VirtualTimer {
            clock: Arc::new(AtomicU64::new(0)),
            paced: false,
        }
    }

    pub fn paced() -> Self {
        VirtualTimer {
            clock: Arc::new(AtomicU64::new(0)),
            paced: true,
        }
    }

    pub fn clock(&self) -> Arc<AtomicU64> {
        self.clock.clone()
    }

    pub fn advance_ms(&self, ms: u64) {
        if self.paced {
            thread::sleep(Duration::from_millis(ms));
        }
        self.clock.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }
}

impl Default for VirtualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for VirtualTimer {
    fn wait_333ms(&self) {
        self.advance_ms(333);
    }

    fn wait_secs(&self, secs: u64) {
        self.advance_ms(secs * 1000);
    }

    fn sec_count(&self) -> u64 {
        self.now_ms() / 1000
    }
}

/// Misbehaviour the simulated block can be told to show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Terminal data error latched on `channel` once `after_secs` of virtual time have passed.
    Latch { channel: usize, after_secs: u64 },
    StuckUpdate(usize),
    FrozenToggle(usize),
    AxiPtrMismatch(usize),
    RegisterFailure(u32),
}

impl SimFault {
    /// Parses `latch:<ch>:<secs>`, `stuck-update:<ch>`, `frozen-toggle:<ch>`,
    /// `axi-mismatch:<ch>` or `register:<hex address>`.
    pub fn parse(text: &str) -> Result<Self, String> {
        let fields: Vec<&str> = text.trim().split(':').map(str::trim).collect();
        let channel = |s: &str| s.parse::<usize>().map_err(|_| format!("invalid channel \"{}\" in fault \"{}\"", s, text));
        match fields.as_slice() {
            ["latch", ch, secs] => Ok(SimFault::Latch {
                channel: channel(*ch)?,
                after_secs: secs
                    .parse::<u64>()
                    .map_err(|_| format!("invalid delay \"{}\" in fault \"{}\"", secs, text))?,
            }),
            ["stuck-update", ch] => Ok(SimFault::StuckUpdate(channel(*ch)?)),
            ["frozen-toggle", ch] => Ok(SimFault::FrozenToggle(channel(*ch)?)),
            ["axi-mismatch", ch] => Ok(SimFault::AxiPtrMismatch(channel(*ch)?)),
            ["register", addr] => {
                let digits = addr.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(digits, 16)
                    .map(SimFault::RegisterFailure)
                    .map_err(|_| format!("invalid register address \"{}\" in fault \"{}\"", addr, text))
            }
            _ => Err(format!("unknown fault \"{}\"", text)),
        }
    }
}

#[derive(Debug, Default)]
struct SimChannel {
    ctrl: HashMap<u32, u32>,
    latches: u32,
    cfg_updated: bool,
    running: bool,
    stuck_update: bool,
    frozen_toggle: Option<u32>,
    axi_ptr_mismatch: bool,
    // (生效时间 ms, 锁存位)
    scheduled_latch: Option<(u64, u32)>,
}

impl SimChannel {
    fn ctrl(&self, address: u32) -> u32 {
        self.ctrl.get(&address).copied().unwrap_or(0)
    }
}

pub struct SimMemoryBlock {
    channels: Vec<SimChannel>,
    axi_bytes: u32,
    clock_mhz: u32,
    clock: Arc<AtomicU64>,
    rng: StdRng,
    failing_register: Option<u32>,
    register_writes: u64,
}

impl SimMemoryBlock {
    pub fn new(num_channels: usize, axi_bytes: u32, clock_mhz: u32, clock: Arc<AtomicU64>) -> Self {
        SimMemoryBlock {
            channels: (0..num_channels).map(|_| SimChannel::default()).collect(),
            axi_bytes: axi_bytes.max(1),
            clock_mhz: clock_mhz.max(1),
            clock,
            rng: StdRng::seed_from_u64(0x5EED),
            failing_register: None,
            register_writes: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn now_ms(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // 故障注入与观察
    // -----------------------------------------------------------------------

    #[cfg(test)]
    pub fn ctrl_register(&self, ch: usize, address: u32) -> u32 {
        self.channels.get(ch).map(|c| c.ctrl(address)).unwrap_or(0)
    }

    pub fn register_writes(&self) -> u64 {
        self.register_writes
    }

    #[cfg(test)]
    pub fn is_running(&self, ch: usize) -> bool {
        self.channels.get(ch).map(|c| c.running).unwrap_or(false)
    }

    #[cfg(test)]
    pub fn inject_latch(&mut self, ch: usize, bits: u32) {
        if let Some(c) = self.channels.get_mut(ch) {
            c.latches |= bits & (STAT_TERM_ERR | STAT_GEN_SEED_ERR | STAT_TERM_SEED_ERR);
        }
    }

    /// Raises `bits` once the virtual clock reaches `at_ms`.
    pub fn schedule_latch(&mut self, ch: usize, bits: u32, at_ms: u64) {
        if let Some(c) = self.channels.get_mut(ch) {
            c.scheduled_latch = Some((at_ms, bits));
        }
    }

    pub fn set_stuck_update(&mut self, ch: usize, stuck: bool) {
        if let Some(c) = self.channels.get_mut(ch) {
            c.stuck_update = stuck;
            if stuck {
                c.cfg_updated = false;
            }
        }
    }

    pub fn set_frozen_toggle(&mut self, ch: usize, frozen: bool) {
        let toggle = self.toggle_now();
        if let Some(c) = self.channels.get_mut(ch) {
            c.frozen_toggle = if frozen { Some(toggle) } else { None };
        }
    }

    pub fn set_axi_ptr_mismatch(&mut self, ch: usize, mismatch: bool) {
        if let Some(c) = self.channels.get_mut(ch) {
            c.axi_ptr_mismatch = mismatch;
        }
    }

    pub fn fail_register(&mut self, address: Option<u32>) {
        self.failing_register = address;
    }

    pub fn inject(&mut self, fault: SimFault) {
        log_debug_fmt!("Simulated fault injected: {:?}", fault);
        match fault {
            SimFault::Latch { channel, after_secs } => self.schedule_latch(channel, STAT_TERM_ERR, after_secs * 1000),
            SimFault::StuckUpdate(ch) => self.set_stuck_update(ch, true),
            SimFault::FrozenToggle(ch) => self.set_frozen_toggle(ch, true),
            SimFault::AxiPtrMismatch(ch) => self.set_axi_ptr_mismatch(ch, true),
            SimFault::RegisterFailure(address) => self.fail_register(Some(address)),
        }
    }

    // -----------------------------------------------------------------------
    // 行为模型
    // -----------------------------------------------------------------------

    fn hw_secs(&self) -> u64 {
        (self.now_ms() + TIMEBASE_PHASE_MS) / 1000
    }

    fn toggle_now(&self) -> u32 {
        (self.hw_secs() % 2) as u32
    }

    fn apply_scheduled(&mut self) {
        let now = self.now_ms();
        for c in self.channels.iter_mut() {
            if let Some((at, bits)) = c.scheduled_latch {
                if now >= at {
                    c.latches |= bits;
                    c.scheduled_latch = None;
                }
            }
        }
    }

    fn status_configuration(&self, ch: usize) -> u32 {
        let c = &self.channels[ch];
        let secs = self.hw_secs();
        let toggle = c.frozen_toggle.unwrap_or((secs % 2) as u32);
        let mut cfg = c.latches;
        if c.cfg_updated {
            cfg |= STAT_CFG_UPDATED;
        }
        cfg |= toggle << STAT_TOGGLE_1_SEC_SHIFT;
        cfg |= ((secs & 0xFFFF) as u32) << STAT_TIMESTAMP_1_SEC_SHIFT;
        cfg
    }

    fn axi_addr_ptr(&self, ch: usize) -> u64 {
        let c = &self.channels[ch];
        let start = ((c.ctrl(REG_CTRL_WR_START_ADDR_MSB) as u64) << 32) | c.ctrl(REG_CTRL_WR_START_ADDR_LSB) as u64;
        start + (self.now_ms() % 1000) * self.axi_bytes as u64
    }

    fn mode(&self, ch: usize) -> u32 {
        (self.channels[ch].ctrl(REG_CTRL_CONFIGURATION) & MEM_TEST_MODE_MASK) >> MEM_TEST_MODE_SHIFT
    }

    // 从寄存器反推速率百分比，与 rate_register_value 互逆
    fn programmed_rate(&self, ch: usize, write: bool, burst_xfer: u32) -> f64 {
        let c = &self.channels[ch];
        let (en, reg) = if write {
            (WR_MEM_RATE_EN, REG_CTRL_WR_MEM_RATE)
        } else {
            (RD_MEM_RATE_EN, REG_CTRL_RD_MEM_RATE)
        };
        if c.ctrl(REG_CTRL_CONFIGURATION) & en == 0 {
            return 100.0;
        }
        let value = c.ctrl(reg) as f64;
        (value * 99.0 / 127.0 * burst_xfer as f64 / 64.0).clamp(0.0, 100.0)
    }

    // 返回 (reg_total, reg_inst)
    fn burst_counters(&mut self, ch: usize, write: bool) -> (u64, u32) {
        if !self.channels[ch].running {
            return (0, 0);
        }
        let mode = self.mode(ch);
        let active = match mode {
            1 => write,
            2 => !write,
            _ => true,
        };
        if !active {
            return (0, 0);
        }
        let c = &self.channels[ch];
        let burst_reg = if write { REG_CTRL_WR_BURST_SIZE } else { REG_CTRL_RD_BURST_SIZE };
        let burst_xfer = c.ctrl(burst_reg) + 1;
        let burst_bytes = burst_xfer as f64 * self.axi_bytes as f64;
        let max_bytes_per_sec = self.axi_bytes as f64 * self.clock_mhz as f64 * 1_000_000.0;
        // 交替与同时读写两个方向共享带宽
        let share = if mode == 1 || mode == 2 { 1.0 } else { 0.5 };
        let rate = self.programmed_rate(ch, write, burst_xfer) / 100.0;
        let jitter: f64 = self.rng.gen_range(0.995..1.005);
        let inst = (max_bytes_per_sec * share * rate * jitter / burst_bytes) as u32;
        let latency = BASE_LATENCY_CYCLES + burst_xfer as u64 + self.rng.gen_range(0..8u64);
        (inst as u64 * latency, inst)
    }

    fn check_register(&self, ch: usize, address: u32) -> EngineResult<()> {
        if ch >= self.channels.len() {
            return Err(EngineError::register_io(ch, address, "channel does not exist"));
        }
        if self.failing_register == Some(address) {
            return Err(EngineError::register_io(ch, address, "simulated bus error"));
        }
        Ok(())
    }

    fn write_configuration(&mut self, ch: usize, value: u32) {
        let c = &mut self.channels[ch];
        let mut stored = value;
        if value & MEM_CTRL_CLEAR_ERR != 0 {
            c.latches = 0;
            stored &= !MEM_CTRL_CLEAR_ERR;
        }
        if value & MEM_CTRL_RESET != 0 {
            c.latches = 0;
            c.running = false;
        }
        if value & MEM_CTRL_STOP != 0 {
            c.running = false;
            if !c.stuck_update {
                c.cfg_updated = true;
            }
            stored &= !MEM_CTRL_STOP;
        }
        if value & MEM_CTRL_UPDATE_CFG != 0 {
            c.cfg_updated = !c.stuck_update;
            if c.cfg_updated && value & MEM_CTRL_RESET == 0 {
                c.running = true;
            }
            stored &= !MEM_CTRL_UPDATE_CFG;
        }
        c.ctrl.insert(REG_CTRL_CONFIGURATION, stored);
    }
}

impl RegisterAccess for SimMemoryBlock {
    fn read_channel_register(&mut self, channel: usize, address: u32) -> EngineResult<u32> {
        self.check_register(channel, address)?;
        self.apply_scheduled();
        let value = match address {
            REG_STAT_CONFIGURATION => self.status_configuration(channel),
            REG_STAT_AXI_ADDR_PTR_LSB => {
                let ptr = self.axi_addr_ptr(channel) as u32;
                if self.channels[channel].axi_ptr_mismatch {
                    ptr ^ 0x1
                } else {
                    ptr
                }
            }
            REG_STAT_AXI_ADDR_PTR_MSB => (self.axi_addr_ptr(channel) >> 32) as u32,
            _ => self.channels[channel].ctrl(address),
        };
        Ok(value)
    }

    fn write_channel_register(&mut self, channel: usize, address: u32, value: u32) -> EngineResult<()> {
        self.check_register(channel, address)?;
        self.register_writes += 1;
        if address == REG_CTRL_CONFIGURATION {
            self.write_configuration(channel, value);
        } else {
            self.channels[channel].ctrl.insert(address, value);
        }
        Ok(())
    }

    fn read_channel_status_block(&mut self, buffer: &mut [u32]) -> EngineResult<()> {
        if let Some(address) = self.failing_register {
            if address == REG_STAT_CONFIGURATION {
                return Err(EngineError::register_io(0, address, "simulated bus error"));
            }
        }
        self.apply_scheduled();
        for ch in 0..self.channels.len() {
            let base = ch * STATUS_WORDS_PER_CHANNEL;
            if base + STATUS_WORDS_PER_CHANNEL > buffer.len() {
                break;
            }
            let (wr_total, wr_inst) = self.burst_counters(ch, true);
            let (rd_total, rd_inst) = self.burst_counters(ch, false);
            let ptr = self.axi_addr_ptr(ch);
            let words = &mut buffer[base..base + STATUS_WORDS_PER_CHANNEL];
            words.iter_mut().for_each(|w| *w = 0);
            words[STAT_IDX_CONFIGURATION] = self.status_configuration(ch);
            words[STAT_IDX_ERROR_COUNT] = self.channels[ch].latches.count_ones();
            words[STAT_IDX_AXI_ADDR_PTR_LSB] = ptr as u32;
            words[STAT_IDX_AXI_ADDR_PTR_MSB] = (ptr >> 32) as u32;
            words[STAT_IDX_WR_TOTAL_LSB] = wr_total as u32;
            words[STAT_IDX_WR_TOTAL_MSB] = (wr_total >> 32) as u32;
            words[STAT_IDX_WR_INST] = wr_inst;
            words[STAT_IDX_RD_TOTAL_LSB] = rd_total as u32;
            words[STAT_IDX_RD_TOTAL_MSB] = (rd_total >> 32) as u32;
            words[STAT_IDX_RD_INST] = rd_inst;
            words[STAT_IDX_TIMESTAMP] = self.hw_secs() as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::rate_register_value;

    /// Rate percentage the sim reports for a programmed register value; used to
    /// check the encoding end to end.
    fn effective_rate(rate_pct: f64, burst_xfer: u32) -> f64 {
        match rate_register_value(rate_pct, burst_xfer) {
            None => 100.0,
            Some(v) => (v as f64 * 99.0 / 127.0 * burst_xfer as f64 / 64.0).clamp(0.0, 100.0),
        }
    }

    fn block(num_channels: usize) -> (SimMemoryBlock, VirtualTimer) {
        let timer = VirtualTimer::new();
        (SimMemoryBlock::new(num_channels, 64, 300, timer.clock()), timer)
    }

    #[test]
    fn toggle_and_timestamp_follow_virtual_seconds() {
        let (mut sim, timer) = block(1);
        let t0 = sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap();
        timer.wait_secs(1);
        let t1 = sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap();
        assert_ne!((t0 >> STAT_TOGGLE_1_SEC_SHIFT) & 1, (t1 >> STAT_TOGGLE_1_SEC_SHIFT) & 1);
        assert_eq!(t1 >> STAT_TIMESTAMP_1_SEC_SHIFT, (t0 >> STAT_TIMESTAMP_1_SEC_SHIFT) + 1);
    }

    #[test]
    fn frozen_toggle_never_flips() {
        let (mut sim, timer) = block(1);
        sim.set_frozen_toggle(0, true);
        let t0 = (sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap() >> STAT_TOGGLE_1_SEC_SHIFT) & 1;
        for _ in 0..5 {
            timer.wait_333ms();
            let t = (sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap() >> STAT_TOGGLE_1_SEC_SHIFT) & 1;
            assert_eq!(t, t0);
        }
    }

    #[test]
    fn update_request_self_clears_and_starts_traffic() {
        let (mut sim, _) = block(1);
        sim.write_channel_register(0, REG_CTRL_WR_BURST_SIZE, 3).unwrap();
        sim.write_channel_register(0, REG_CTRL_CONFIGURATION, (1 << MEM_TEST_MODE_SHIFT) | MEM_CTRL_UPDATE_CFG)
            .unwrap();
        assert_eq!(sim.ctrl_register(0, REG_CTRL_CONFIGURATION) & MEM_CTRL_UPDATE_CFG, 0);
        assert!(sim.is_running(0));

        let mut buf = vec![0u32; STATUS_WORDS_PER_CHANNEL];
        sim.read_channel_status_block(&mut buf).unwrap();
        assert_ne!(buf[STAT_IDX_CONFIGURATION] & STAT_CFG_UPDATED, 0);
        assert!(buf[STAT_IDX_WR_INST] > 0);
        assert_eq!(buf[STAT_IDX_RD_INST], 0);
    }

    #[test]
    fn rate_register_throttles_traffic() {
        let (mut sim, _) = block(1);
        sim.write_channel_register(0, REG_CTRL_WR_BURST_SIZE, 63).unwrap();
        sim.write_channel_register(0, REG_CTRL_CONFIGURATION, (1 << MEM_TEST_MODE_SHIFT) | MEM_CTRL_UPDATE_CFG)
            .unwrap();
        let mut buf = vec![0u32; STATUS_WORDS_PER_CHANNEL];
        sim.read_channel_status_block(&mut buf).unwrap();
        let full = buf[STAT_IDX_WR_INST] as f64;

        let cfg = sim.ctrl_register(0, REG_CTRL_CONFIGURATION);
        sim.write_channel_register(0, REG_CTRL_CONFIGURATION, cfg | WR_MEM_RATE_EN).unwrap();
        sim.write_channel_register(0, REG_CTRL_WR_MEM_RATE, 64).unwrap();
        sim.read_channel_status_block(&mut buf).unwrap();
        let half = buf[STAT_IDX_WR_INST] as f64;
        assert!((half / full - 0.5).abs() < 0.02, "ratio {}", half / full);
    }

    #[test]
    fn scheduled_latch_appears_on_time() {
        let (mut sim, timer) = block(1);
        sim.schedule_latch(0, STAT_TERM_ERR, 2000);
        timer.wait_secs(1);
        assert_eq!(sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap() & STAT_TERM_ERR, 0);
        timer.wait_secs(1);
        assert_ne!(sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap() & STAT_TERM_ERR, 0);
        sim.write_channel_register(0, REG_CTRL_CONFIGURATION, MEM_CTRL_CLEAR_ERR).unwrap();
        assert_eq!(sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap() & STAT_TERM_ERR, 0);
    }

    #[test]
    fn faults_parse_from_text() {
        assert_eq!(SimFault::parse("latch:1:30"), Ok(SimFault::Latch { channel: 1, after_secs: 30 }));
        assert_eq!(SimFault::parse("stuck-update:0"), Ok(SimFault::StuckUpdate(0)));
        assert_eq!(SimFault::parse(" frozen-toggle : 2 "), Ok(SimFault::FrozenToggle(2)));
        assert_eq!(SimFault::parse("axi-mismatch:3"), Ok(SimFault::AxiPtrMismatch(3)));
        assert_eq!(SimFault::parse("register:0x0c"), Ok(SimFault::RegisterFailure(0x0C)));
        assert!(SimFault::parse("latch:x:1").is_err());
        assert!(SimFault::parse("latch:1").is_err());
        assert!(SimFault::parse("melt:0").is_err());
    }

    #[test]
    fn injected_latch_uses_virtual_seconds() {
        let (mut sim, timer) = block(2);
        sim.inject(SimFault::Latch { channel: 1, after_secs: 3 });
        timer.wait_secs(2);
        assert_eq!(sim.read_channel_register(1, REG_STAT_CONFIGURATION).unwrap() & STAT_TERM_ERR, 0);
        timer.wait_secs(1);
        assert_ne!(sim.read_channel_register(1, REG_STAT_CONFIGURATION).unwrap() & STAT_TERM_ERR, 0);
        assert_eq!(sim.read_channel_register(0, REG_STAT_CONFIGURATION).unwrap() & STAT_TERM_ERR, 0);
    }

    #[test]
    fn failing_register_reports_io_error() {
        let (mut sim, _) = block(1);
        sim.fail_register(Some(REG_CTRL_PATTERN_A));
        assert!(matches!(
            sim.write_channel_register(0, REG_CTRL_PATTERN_A, 1),
            Err(EngineError::RegisterIo { .. })
        ));
        assert!(sim.read_channel_register(4, REG_CTRL_CONFIGURATION).is_err());
    }

    #[test]
    fn effective_rate_tracks_requested_rate() {
        assert_eq!(effective_rate(100.0, 4), 100.0);
        assert!((effective_rate(50.0, 64) - 50.0).abs() < 1.0);
        assert!((effective_rate(25.0, 4) - 25.0).abs() < 0.5);
    }
}
