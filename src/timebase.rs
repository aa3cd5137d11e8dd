// 硬件 1 秒时基同步
//
// 硬件每秒翻转一次 toggle 位并锁存上一秒的突发统计。每次测量前先等到
// toggle 翻转，再等 333ms 让锁存稳定，然后一次性读取所有通道的状态块。

use crate::controller::ChannelRegisterController;
use crate::error::EngineResult;
use crate::hw::{ChannelStatus, RegisterAccess};

/// 333 ms polls before a toggle is declared missed.
pub const TOGGLE_WATCHDOG: u32 = 4;
/// Consecutive misses before a warning is raised.
pub const TOGGLE_MISS_WARNING: u32 = 5;

pub struct TimebaseSynchronizer {
    toggle_channel: usize,
    tog_last: u32,
    toggle_error_cnt: u32,
    hw_sec_cnt: u64,
    expected_timestamp: Vec<u32>,
    timestamp_reported: bool,
}

impl TimebaseSynchronizer {
    pub fn new(num_channels: usize) -> Self {
        TimebaseSynchronizer {
            toggle_channel: 0,
            tog_last: 0,
            toggle_error_cnt: 0,
            hw_sec_cnt: 0,
            expected_timestamp: vec![0; num_channels],
            timestamp_reported: false,
        }
    }

    pub fn hw_sec_cnt(&self) -> u64 {
        self.hw_sec_cnt
    }

    pub fn toggle_error_cnt(&self) -> u32 {
        self.toggle_error_cnt
    }

    pub fn timestamp_reported(&self) -> bool {
        self.timestamp_reported
    }

    /// Starts a measurement window on `toggle_channel`: latches the current
    /// toggle value and restarts the hardware second counter.
    pub fn start_window<D: RegisterAccess>(
        &mut self,
        ctrl: &mut ChannelRegisterController<D>,
        toggle_channel: usize,
    ) -> EngineResult<()> {
        self.toggle_channel = toggle_channel;
        self.tog_last = ctrl.read_toggle(toggle_channel)?;
        self.hw_sec_cnt = 0;
        Ok(())
    }

    /// Waits for the next toggle edge, then snapshots every channel status.
    /// Returns whether the edge was observed; a miss is counted, not fatal.
    pub fn wait_toggle<D: RegisterAccess>(&mut self, ctrl: &mut ChannelRegisterController<D>) -> EngineResult<bool> {
        let mut watchdog = TOGGLE_WATCHDOG;
        while watchdog > 0 && !ctrl.is_aborted() {
            let toggle = ctrl.read_toggle(self.toggle_channel)?;
            if toggle != self.tog_last {
                self.tog_last = toggle;
                break;
            }
            ctrl.timer().wait_333ms();
            watchdog -= 1;
        }

        // 等待统计锁存稳定
        ctrl.timer().wait_333ms();
        ctrl.refresh_status()?;
        self.hw_sec_cnt += 1;

        if watchdog == 0 {
            self.toggle_error_cnt += 1;
            if self.toggle_error_cnt >= TOGGLE_MISS_WARNING {
                log_warn_fmt!(
                    "1 second toggle not detected {} times in a row (channel {})",
                    self.toggle_error_cnt,
                    self.toggle_channel
                );
            }
            Ok(false)
        } else {
            self.toggle_error_cnt = 0;
            Ok(true)
        }
    }

    /// After the first snapshot every timestamp must be the previous one plus one.
    /// A mismatch is only reported once per run.
    pub fn check_timestamp(&mut self, ch: usize, status: &ChannelStatus) -> bool {
        let ts = status.timestamp_1_sec;
        let mut continuous = true;
        if self.hw_sec_cnt > 1 && ts != self.expected_timestamp[ch] {
            continuous = false;
            if !self.timestamp_reported {
                log_warn_fmt!(
                    "Hardware timestamp {} does not match expected {} (channel {}); further mismatches are not reported",
                    ts,
                    self.expected_timestamp[ch],
                    ch
                );
                self.timestamp_reported = true;
            }
        }
        self.expected_timestamp[ch] = (ts + 1) & 0xFFFF;
        continuous
    }
}
