// 数据完整性监控
// 只有 PRBS 模式且开启检查的读通道才会检查错误锁存位；
// 一旦记录为 KO，本次迭代内不会再回到 OK

use crate::config::ChannelConfig;
use crate::controller::ChannelRegisterController;
use crate::error::EngineResult;
use crate::hw::{ChannelStatus, RegisterAccess};
use crate::types::Integrity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataIntegrityState {
    pub live: Integrity,
    pub result: Integrity,
}

// 每次迭代开始时复位为 OK，未检查的通道在第一次轮询时改为 NotChecked
impl Default for DataIntegrityState {
    fn default() -> Self {
        DataIntegrityState {
            live: Integrity::Ok,
            result: Integrity::Ok,
        }
    }
}

impl DataIntegrityState {
    fn record(&mut self, corrupted: bool) {
        if corrupted {
            self.live = Integrity::Corrupted;
            self.result = Integrity::Corrupted;
        } else {
            self.live = Integrity::Ok;
            if self.result != Integrity::Corrupted {
                self.result = Integrity::Ok;
            }
        }
    }

    fn not_checked(&mut self) {
        self.live = Integrity::NotChecked;
        self.result = Integrity::NotChecked;
    }
}

pub struct DataIntegrityMonitor {
    states: Vec<DataIntegrityState>,
    combined: DataIntegrityState,
    combined_check: bool,
}

impl DataIntegrityMonitor {
    pub fn new(num_channels: usize, combined_check: bool) -> Self {
        DataIntegrityMonitor {
            states: vec![DataIntegrityState::default(); num_channels],
            combined: DataIntegrityState::default(),
            combined_check,
        }
    }

    pub fn reset(&mut self) {
        self.states.iter_mut().for_each(|s| *s = DataIntegrityState::default());
        self.combined = DataIntegrityState::default();
    }

    pub fn state(&self, ch: usize) -> DataIntegrityState {
        self.states[ch]
    }

    pub fn combined(&self) -> DataIntegrityState {
        self.combined
    }

    pub fn combined_check(&self) -> bool {
        self.combined_check
    }

    /// Inspects the error latches of one read-active channel. Latches are
    /// cleared in hardware once a corruption is recorded.
    pub fn check_channel<D: RegisterAccess>(
        &mut self,
        ctrl: &mut ChannelRegisterController<D>,
        ch: usize,
        cfg: &ChannelConfig,
        status: &ChannelStatus,
    ) -> EngineResult<Integrity> {
        let state = &mut self.states[ch];
        if !cfg.checks_integrity() {
            state.not_checked();
            return Ok(state.live);
        }
        let corrupted = status.term_seed_err || status.gen_seed_err || status.term_err;
        state.record(corrupted);
        if corrupted {
            log_error_fmt!(
                "Data integrity error: term_err={} gen_seed_err={} term_seed_err={} error count={} (channel {})",
                status.term_err,
                status.gen_seed_err,
                status.term_seed_err,
                status.term_err_cnt,
                ch
            );
            ctrl.clear_error_latches(ch)?;
        }
        Ok(self.states[ch].live)
    }

    /// Combined state over the read-active channels.
    pub fn combine(&mut self, read_channels: &[usize]) -> DataIntegrityState {
        let fail = read_channels
            .iter()
            .any(|&ch| self.states[ch].live == Integrity::Corrupted);
        if !self.combined_check {
            self.combined.not_checked();
        } else {
            self.combined.record(fail);
        }
        self.combined
    }
}
