// 通道寄存器控制器
//
// 所有控制位的修改都是对 REG_CTRL_CONFIGURATION 的读-改-写，
// 不会影响同一寄存器里的其它字段

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::hw::*;
use crate::types::{Direction, TestIteration, TestMode};

const MIB: u64 = 1024 * 1024;

pub const UPDATE_FIRST_WARNING_S: u64 = 60;
pub const UPDATE_CEILING_S: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxiThreadMode {
    Single,
    Multi,
}

/// Value programmed into the rate register for `rate_pct` percent of the
/// nominal throughput. Anything at or above 100% is unlimited.
pub fn rate_register_value(rate_pct: f64, burst_xfer: u32) -> Option<u32> {
    if rate_pct >= 100.0 {
        return None;
    }
    let reg_f = (rate_pct * 127.0 / 99.0) * (64.0 / burst_xfer.max(1) as f64);
    let mut reg = reg_f.trunc() as u32;
    if reg_f - reg_f.trunc() > 0.5 {
        reg += 1;
    }
    Some(reg.max(1))
}

/// Masked outstanding field and whether the limit is enabled; 0 means unlimited.
pub fn outstanding_field(dir: Direction, count: u32) -> (u32, bool) {
    if count == 0 {
        return (0, false);
    }
    let value = count.saturating_sub(2);
    match dir {
        Direction::Write => ((value << 16) & OUTSTANDING_WR_MASK, true),
        Direction::Read => (value & OUTSTANDING_RD_MASK, true),
    }
}

pub struct ChannelRegisterController<D: RegisterAccess> {
    device: D,
    timer: Arc<dyn Timer>,
    abort: Arc<AtomicBool>,
    num_channels: usize,
    status_words: Vec<u32>,
    update_first_warning_s: u64,
    update_ceiling_s: u64,
}

impl<D: RegisterAccess> ChannelRegisterController<D> {
    pub fn new(device: D, num_channels: usize, timer: Arc<dyn Timer>, abort: Arc<AtomicBool>) -> Self {
        ChannelRegisterController {
            device,
            timer,
            abort,
            num_channels,
            status_words: vec![0; num_channels * STATUS_WORDS_PER_CHANNEL],
            update_first_warning_s: UPDATE_FIRST_WARNING_S,
            update_ceiling_s: UPDATE_CEILING_S,
        }
    }

    #[cfg(test)]
    pub fn with_update_limits(mut self, first_warning_s: u64, ceiling_s: u64) -> Self {
        self.update_first_warning_s = first_warning_s.max(1);
        self.update_ceiling_s = ceiling_s.max(1);
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    #[cfg(test)]
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.timer
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn check_channel(&self, ch: usize, address: u32) -> EngineResult<()> {
        if ch >= self.num_channels {
            return Err(EngineError::register_io(
                ch,
                address,
                format!("channel out of range [0 ; {}]", self.num_channels.saturating_sub(1)),
            ));
        }
        Ok(())
    }

    fn read(&mut self, ch: usize, address: u32) -> EngineResult<u32> {
        self.check_channel(ch, address)?;
        self.device.read_channel_register(ch, address)
    }

    fn write(&mut self, ch: usize, address: u32, value: u32) -> EngineResult<()> {
        self.check_channel(ch, address)?;
        self.device.write_channel_register(ch, address, value)
    }

    fn modify_ctrl(&mut self, ch: usize, clear: u32, set: u32) -> EngineResult<()> {
        let cfg = self.read(ch, REG_CTRL_CONFIGURATION)?;
        self.write(ch, REG_CTRL_CONFIGURATION, (cfg & !clear) | set)
    }

    // -----------------------------------------------------------------------
    // 控制位
    // -----------------------------------------------------------------------

    /// Requests every listed channel to stop, then waits for the acknowledge.
    pub fn stop(&mut self, channels: &[usize]) -> EngineResult<bool> {
        for &ch in channels {
            self.modify_ctrl(ch, 0, MEM_CTRL_STOP)?;
        }
        self.wait_config_updated(channels)
    }

    pub fn reset(&mut self, channels: &[usize], assert: bool) -> EngineResult<()> {
        for &ch in channels {
            if assert {
                self.modify_ctrl(ch, 0, MEM_CTRL_RESET)?;
            } else {
                self.modify_ctrl(ch, MEM_CTRL_RESET, 0)?;
            }
        }
        Ok(())
    }

    pub fn clear_error_latches(&mut self, ch: usize) -> EngineResult<()> {
        self.modify_ctrl(ch, 0, MEM_CTRL_CLEAR_ERR)
    }

    pub fn set_mode(&mut self, ch: usize, mode: TestMode) -> EngineResult<()> {
        let field = (mode.register_value() << MEM_TEST_MODE_SHIFT) & MEM_TEST_MODE_MASK;
        self.modify_ctrl(ch, MEM_TEST_MODE_MASK, field)
    }

    pub fn set_rate(&mut self, ch: usize, dir: Direction, rate_pct: f64, burst_xfer: u32) -> EngineResult<()> {
        let (enable_bit, rate_reg) = match dir {
            Direction::Write => (WR_MEM_RATE_EN, REG_CTRL_WR_MEM_RATE),
            Direction::Read => (RD_MEM_RATE_EN, REG_CTRL_RD_MEM_RATE),
        };
        match rate_register_value(rate_pct, burst_xfer) {
            None => {
                self.modify_ctrl(ch, enable_bit, 0)?;
                self.write(ch, rate_reg, RATE_REG_UNLIMITED)
            }
            Some(value) => {
                self.modify_ctrl(ch, 0, enable_bit)?;
                self.write(ch, rate_reg, value)
            }
        }
    }

    pub fn set_outstanding(&mut self, ch: usize, dir: Direction, count: u32) -> EngineResult<()> {
        let (enable_bit, mask) = match dir {
            Direction::Write => (OUTSTANDING_WR_EN, OUTSTANDING_WR_MASK),
            Direction::Read => (OUTSTANDING_RD_EN, OUTSTANDING_RD_MASK),
        };
        let (field, enabled) = outstanding_field(dir, count);
        if enabled {
            self.modify_ctrl(ch, 0, enable_bit)?;
        } else {
            self.modify_ctrl(ch, enable_bit, 0)?;
        }
        let reg = self.read(ch, REG_CTRL_OUTSTANDING)?;
        self.write(ch, REG_CTRL_OUTSTANDING, (reg & !mask) | field)
    }

    // 关闭时只清使能位，A/B 寄存器保持原值
    pub fn set_pattern(&mut self, ch: usize, enable: bool, word_a: u32, word_b: u32) -> EngineResult<()> {
        if !enable {
            return self.modify_ctrl(ch, PATTERN_EN, 0);
        }
        self.modify_ctrl(ch, 0, PATTERN_EN)?;
        self.write(ch, REG_CTRL_PATTERN_A, word_a)?;
        self.write(ch, REG_CTRL_PATTERN_B, word_b)
    }

    pub fn set_axi_thread_mode(&mut self, ch: usize, mode: AxiThreadMode) -> EngineResult<()> {
        match mode {
            AxiThreadMode::Single => self.modify_ctrl(ch, MULTI_THREAD_EN, 0),
            AxiThreadMode::Multi => self.modify_ctrl(ch, 0, MULTI_THREAD_EN),
        }
    }

    // -----------------------------------------------------------------------
    // 传输参数
    // -----------------------------------------------------------------------

    pub fn set_start_addr(&mut self, ch: usize, dir: Direction, start_mb: u32) -> EngineResult<()> {
        let bytes = start_mb as u64 * MIB;
        let (lsb, msb) = match dir {
            Direction::Write => (REG_CTRL_WR_START_ADDR_LSB, REG_CTRL_WR_START_ADDR_MSB),
            Direction::Read => (REG_CTRL_RD_START_ADDR_LSB, REG_CTRL_RD_START_ADDR_MSB),
        };
        self.write(ch, lsb, (bytes & 0xFFFF_FFFF) as u32)?;
        self.write(ch, msb, (bytes >> 32) as u32)
    }

    pub fn set_burst_xfer(&mut self, ch: usize, dir: Direction, burst_xfer: u32) -> EngineResult<()> {
        let reg = match dir {
            Direction::Write => REG_CTRL_WR_BURST_SIZE,
            Direction::Read => REG_CTRL_RD_BURST_SIZE,
        };
        self.write(ch, reg, burst_xfer.saturating_sub(1))
    }

    pub fn set_num_xfer(&mut self, ch: usize, dir: Direction, total_xfer: u32) -> EngineResult<()> {
        let reg = match dir {
            Direction::Write => REG_CTRL_WR_NUM_XFER,
            Direction::Read => REG_CTRL_RD_NUM_XFER,
        };
        self.write(ch, reg, total_xfer.saturating_sub(1))
    }

    /// Programs mode and, for each active direction, address, burst length,
    /// transfer count, rate and outstanding limit.
    pub fn apply_iteration(&mut self, ch: usize, it: &TestIteration) -> EngineResult<()> {
        self.set_mode(ch, it.mode)?;
        for dir in Direction::BOTH {
            if !it.mode.has(dir) {
                continue;
            }
            let s = it.settings(dir);
            self.set_start_addr(ch, dir, s.start_addr)?;
            self.set_burst_xfer(ch, dir, s.burst_xfer)?;
            self.set_num_xfer(ch, dir, s.total_xfer)?;
            self.set_rate(ch, dir, s.rate, s.burst_xfer)?;
            self.set_outstanding(ch, dir, s.outstanding)?;
        }
        Ok(())
    }

    pub fn update_config(&mut self, ch: usize) -> EngineResult<()> {
        self.modify_ctrl(ch, 0, MEM_CTRL_UPDATE_CFG)
    }

    /// Polls the bulk status until every listed channel reports its
    /// configuration applied, then clears their error latches.
    ///
    /// Returns `Ok(false)` when interrupted by an abort request.
    pub fn wait_config_updated(&mut self, channels: &[usize]) -> EngineResult<bool> {
        let mut updated = vec![false; channels.len()];
        let mut tick: u64 = 0;
        let mut next_warning = self.update_first_warning_s;

        while !updated.iter().all(|u| *u) && !self.is_aborted() {
            self.refresh_status()?;
            for (i, &ch) in channels.iter().enumerate() {
                let cfg = self.status_words(ch)[STAT_IDX_CONFIGURATION];
                if cfg & STAT_CFG_UPDATED != 0 {
                    updated[i] = true;
                }
            }
            if updated.iter().all(|u| *u) || self.is_aborted() {
                break;
            }
            self.timer.wait_secs(1);
            tick += 1;
            if tick == next_warning {
                let pending: Vec<String> = channels
                    .iter()
                    .zip(updated.iter())
                    .filter(|(_, u)| !**u)
                    .map(|(ch, _)| ch.to_string())
                    .collect();
                log_warn_fmt!(
                    "Configuration still not applied by channel(s) {} after {} seconds",
                    pending.join(", "),
                    tick
                );
                next_warning *= 2;
            }
            if tick % self.update_ceiling_s == 0 {
                log_error_fmt!("Configuration not applied after {} seconds", tick);
                return Err(EngineError::ConfigUpdateTimeout { seconds: tick });
            }
        }
        if self.is_aborted() && !updated.iter().all(|u| *u) {
            return Ok(false);
        }
        for &ch in channels {
            self.clear_error_latches(ch)?;
        }
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // 状态读取
    // -----------------------------------------------------------------------

    pub fn refresh_status(&mut self) -> EngineResult<()> {
        let mut buffer = std::mem::take(&mut self.status_words);
        let result = self.device.read_channel_status_block(&mut buffer);
        self.status_words = buffer;
        result
    }

    /// Slice of the last bulk status read belonging to `ch`.
    pub fn status_words(&self, ch: usize) -> &[u32] {
        let start = ch * STATUS_WORDS_PER_CHANNEL;
        let end = (start + STATUS_WORDS_PER_CHANNEL).min(self.status_words.len());
        &self.status_words[start.min(end)..end]
    }

    pub fn read_toggle(&mut self, ch: usize) -> EngineResult<u32> {
        let cfg = self.read(ch, REG_STAT_CONFIGURATION)?;
        Ok((cfg >> STAT_TOGGLE_1_SEC_SHIFT) & 0x1)
    }

    // 先读高位再读低位
    pub fn read_axi_addr_ptr(&mut self, ch: usize) -> EngineResult<u64> {
        let msb = self.read(ch, REG_STAT_AXI_ADDR_PTR_MSB)?;
        let lsb = self.read(ch, REG_STAT_AXI_ADDR_PTR_LSB)?;
        Ok(((msb as u64) << 32) | lsb as u64)
    }

    /// Compares the pointer read register-by-register with the bulk status
    /// copy for each listed channel.
    pub fn check_axi_addr_ptr(&mut self, channels: &[usize]) -> EngineResult<()> {
        self.refresh_status()?;
        for &ch in channels {
            let single = self.read_axi_addr_ptr(ch)?;
            let mut status = ChannelStatus::default();
            status.load(self.status_words(ch));
            if single != status.axi_addr_ptr {
                return Err(EngineError::StatusMismatch {
                    channel: ch,
                    single,
                    bulk: status.axi_addr_ptr,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimMemoryBlock, VirtualTimer};

    fn controller(num_channels: usize) -> (ChannelRegisterController<SimMemoryBlock>, Arc<AtomicBool>) {
        let timer = Arc::new(VirtualTimer::new());
        let sim = SimMemoryBlock::new(num_channels, 64, 300, timer.clock());
        let abort = Arc::new(AtomicBool::new(false));
        (ChannelRegisterController::new(sim, num_channels, timer, abort.clone()), abort)
    }

    #[test]
    fn rate_encoding() {
        assert_eq!(rate_register_value(100.0, 4), None);
        // 50 * 127 / 99 = 64.14 -> 64; * 64/64
        assert_eq!(rate_register_value(50.0, 64), Some(64));
        // 50 * 127 / 99 * 16 = 1026.26
        assert_eq!(rate_register_value(50.0, 4), Some(1026));
        // 小数部分大于 0.5 时进位：2 * 127/99 * 64/60 = 2.737
        assert_eq!(rate_register_value(2.0, 60), Some(3));
        assert_eq!(rate_register_value(0.1, 128), Some(1));
    }

    #[test]
    fn outstanding_encoding() {
        assert_eq!(outstanding_field(Direction::Write, 0), (0, false));
        assert_eq!(outstanding_field(Direction::Write, 10), (8 << 16, true));
        assert_eq!(outstanding_field(Direction::Read, 255), (253, true));
    }

    #[test]
    fn control_bits_keep_unrelated_fields() {
        let (mut ctrl, _) = controller(1);
        ctrl.set_axi_thread_mode(0, AxiThreadMode::Multi).unwrap();
        ctrl.set_mode(0, TestMode::SimultaneousWrRd).unwrap();
        let cfg = ctrl.device().ctrl_register(0, REG_CTRL_CONFIGURATION);
        assert_eq!(cfg & MEM_TEST_MODE_MASK, 3 << MEM_TEST_MODE_SHIFT);
        assert_ne!(cfg & MULTI_THREAD_EN, 0);

        ctrl.set_mode(0, TestMode::OnlyWr).unwrap();
        let cfg = ctrl.device().ctrl_register(0, REG_CTRL_CONFIGURATION);
        assert_eq!(cfg & MEM_TEST_MODE_MASK, 1 << MEM_TEST_MODE_SHIFT);
        assert_ne!(cfg & MULTI_THREAD_EN, 0);
    }

    #[test]
    fn rate_and_outstanding_program_enable_bits() {
        let (mut ctrl, _) = controller(1);
        ctrl.set_rate(0, Direction::Read, 50.0, 64).unwrap();
        ctrl.set_outstanding(0, Direction::Write, 10).unwrap();
        ctrl.set_outstanding(0, Direction::Read, 4).unwrap();
        let dev = ctrl.device();
        let cfg = dev.ctrl_register(0, REG_CTRL_CONFIGURATION);
        assert_ne!(cfg & RD_MEM_RATE_EN, 0);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_RD_MEM_RATE), 64);
        assert_ne!(cfg & OUTSTANDING_WR_EN, 0);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_OUTSTANDING), (8 << 16) | 2);

        ctrl.set_rate(0, Direction::Read, 100.0, 64).unwrap();
        ctrl.set_outstanding(0, Direction::Write, 0).unwrap();
        let dev = ctrl.device();
        let cfg = dev.ctrl_register(0, REG_CTRL_CONFIGURATION);
        assert_eq!(cfg & RD_MEM_RATE_EN, 0);
        assert_eq!(cfg & OUTSTANDING_WR_EN, 0);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_RD_MEM_RATE), RATE_REG_UNLIMITED);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_OUTSTANDING), 2);
    }

    #[test]
    fn start_address_is_split_in_bytes() {
        let (mut ctrl, _) = controller(1);
        ctrl.set_start_addr(0, Direction::Write, 8192).unwrap();
        let dev = ctrl.device();
        assert_eq!(dev.ctrl_register(0, REG_CTRL_WR_START_ADDR_LSB), 0);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_WR_START_ADDR_MSB), 2);
    }

    #[test]
    fn pattern_disable_only_clears_enable_bit() {
        let (mut ctrl, _) = controller(1);
        ctrl.set_pattern(0, true, 0xCAFE_CAFE, 0xF00D_F00D).unwrap();
        ctrl.set_pattern(0, false, 0, 0).unwrap();
        let dev = ctrl.device();
        assert_eq!(dev.ctrl_register(0, REG_CTRL_CONFIGURATION) & PATTERN_EN, 0);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_PATTERN_A), 0xCAFE_CAFE);
        assert_eq!(dev.ctrl_register(0, REG_CTRL_PATTERN_B), 0xF00D_F00D);
    }

    #[test]
    fn update_handshake_completes_and_clears_latches() {
        let (mut ctrl, _) = controller(2);
        ctrl.device_mut().inject_latch(1, STAT_TERM_ERR);
        ctrl.update_config(0).unwrap();
        ctrl.update_config(1).unwrap();
        assert!(ctrl.wait_config_updated(&[0, 1]).unwrap());
        ctrl.refresh_status().unwrap();
        assert_eq!(ctrl.status_words(1)[STAT_IDX_CONFIGURATION] & STAT_TERM_ERR, 0);
    }

    #[test]
    fn stuck_update_times_out_at_ceiling() {
        let (ctrl, _) = controller(1);
        let mut ctrl = ctrl.with_update_limits(2, 5);
        ctrl.device_mut().set_stuck_update(0, true);
        ctrl.update_config(0).unwrap();
        let err = ctrl.wait_config_updated(&[0]).unwrap_err();
        assert_eq!(err, EngineError::ConfigUpdateTimeout { seconds: 5 });
    }

    #[test]
    fn abort_interrupts_update_wait() {
        let (mut ctrl, abort) = controller(1);
        ctrl.device_mut().set_stuck_update(0, true);
        abort.store(true, Ordering::SeqCst);
        assert!(!ctrl.wait_config_updated(&[0]).unwrap());
    }

    #[test]
    fn axi_pointer_mismatch_is_reported() {
        let (mut ctrl, _) = controller(2);
        assert!(ctrl.check_axi_addr_ptr(&[0, 1]).is_ok());
        ctrl.device_mut().set_axi_ptr_mismatch(1, true);
        assert!(matches!(
            ctrl.check_axi_addr_ptr(&[0, 1]),
            Err(EngineError::StatusMismatch { channel: 1, .. })
        ));
    }

    #[test]
    fn unknown_channel_is_an_io_error() {
        let (mut ctrl, _) = controller(2);
        assert!(matches!(
            ctrl.set_mode(2, TestMode::OnlyWr),
            Err(EngineError::RegisterIo { channel: 2, .. })
        ));
    }
}
