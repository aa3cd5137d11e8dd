// 预写：读测试开始前先把读区域写一遍，保证 PRBS 校验有已知内容

use crate::config::TestcaseConfig;
use crate::controller::ChannelRegisterController;
use crate::error::EngineResult;
use crate::hw::RegisterAccess;
use crate::types::{TestIteration, TestMode};

pub struct PreWriteStager {
    write_rate: f64,
}

impl PreWriteStager {
    /// `write_rate` is the nominal write-only rate of the memory.
    pub fn new(write_rate: f64) -> Self {
        PreWriteStager { write_rate }
    }

    /// Channels that need a pre-write before `iterations` runs.
    pub fn select(tc: &TestcaseConfig, iterations: &[TestIteration]) -> Vec<usize> {
        tc.enabled
            .iter()
            .copied()
            .filter(|&ch| {
                !tc.channels[ch].disable_prewrite
                    && matches!(iterations[ch].mode, TestMode::OnlyRd | TestMode::SimultaneousWrRd)
            })
            .collect()
    }

    /// Write-only iteration covering the read window of `it`.
    pub fn pre_write_iteration(&self, it: &TestIteration) -> TestIteration {
        let mut write = it.read.clone();
        write.rate = self.write_rate;
        TestIteration {
            duration: it.duration,
            mode: TestMode::OnlyWr,
            write,
            read: Default::default(),
            user_params: Vec::new(),
            resolved_params: Vec::new(),
        }
    }

    /// Programs and starts the pre-write on every selected channel and waits
    /// for the configuration to be applied. Returns the staged channels.
    pub fn stage<D: RegisterAccess>(
        &self,
        ctrl: &mut ChannelRegisterController<D>,
        tc: &TestcaseConfig,
        iterations: &[TestIteration],
    ) -> EngineResult<Vec<usize>> {
        let channels = Self::select(tc, iterations);
        if channels.is_empty() {
            return Ok(channels);
        }
        for &ch in &channels {
            let it = self.pre_write_iteration(&iterations[ch]);
            log_debug_fmt!(
                "Pre-write [{} ; {}] MB, burst size {} Bytes (channel {})",
                it.write.start_addr,
                it.write.end_addr,
                it.write.burst_size,
                ch
            );
            ctrl.apply_iteration(ch, &it)?;
        }
        for &ch in &channels {
            ctrl.update_config(ch)?;
        }
        ctrl.wait_config_updated(&channels)?;
        Ok(channels)
    }
}
