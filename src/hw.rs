// 硬件抽象层：寄存器地址表、寄存器访问能力接口、计时接口以及状态块解码
//
// 引擎只通过 RegisterAccess 三个操作访问硬件，具体的传输方式（PCIe BAR、
// 驱动 ioctl、模拟器）都在接口之外

use crate::error::EngineResult;
use crate::stats::BurstStat;
use crate::types::Direction;

// ---------------------------------------------------------------------------
// 控制寄存器
// ---------------------------------------------------------------------------
pub const REG_CTRL_CONFIGURATION: u32 = 0x100000;
pub const REG_CTRL_WR_START_ADDR_LSB: u32 = 0x100001;
pub const REG_CTRL_WR_START_ADDR_MSB: u32 = 0x100002;
pub const REG_CTRL_RD_START_ADDR_LSB: u32 = 0x100003;
pub const REG_CTRL_RD_START_ADDR_MSB: u32 = 0x100004;
pub const REG_CTRL_WR_BURST_SIZE: u32 = 0x100005;
pub const REG_CTRL_RD_BURST_SIZE: u32 = 0x100006;
pub const REG_CTRL_WR_NUM_XFER: u32 = 0x100007;
pub const REG_CTRL_RD_NUM_XFER: u32 = 0x100008;
pub const REG_CTRL_WR_MEM_RATE: u32 = 0x100009;
pub const REG_CTRL_RD_MEM_RATE: u32 = 0x10000A;
pub const REG_CTRL_OUTSTANDING: u32 = 0x10000B;
pub const REG_CTRL_PATTERN_A: u32 = 0x10000C;
pub const REG_CTRL_PATTERN_B: u32 = 0x10000D;

// REG_CTRL_CONFIGURATION 位定义
pub const MEM_CTRL_STOP: u32 = 1 << 0;
pub const MEM_CTRL_UPDATE_CFG: u32 = 1 << 1;
pub const MEM_TEST_MODE_SHIFT: u32 = 4;
pub const MEM_TEST_MODE_MASK: u32 = 0x0000_0030;
pub const MEM_CTRL_RESET: u32 = 1 << 8;
pub const MEM_CTRL_CLEAR_ERR: u32 = 1 << 12;
pub const WR_MEM_RATE_EN: u32 = 1 << 16;
pub const RD_MEM_RATE_EN: u32 = 1 << 17;
pub const OUTSTANDING_WR_EN: u32 = 1 << 18;
pub const OUTSTANDING_RD_EN: u32 = 1 << 19;
pub const MULTI_THREAD_EN: u32 = 1 << 20;
pub const PATTERN_EN: u32 = 1 << 21;

// REG_CTRL_OUTSTANDING 字段
pub const OUTSTANDING_WR_MASK: u32 = 0x01FF_0000;
pub const OUTSTANDING_RD_MASK: u32 = 0x0000_01FF;

// 限速寄存器在 100% 时写入的值（13 位全 1）
pub const RATE_REG_UNLIMITED: u32 = 8191;

// ---------------------------------------------------------------------------
// 状态寄存器
// ---------------------------------------------------------------------------
pub const REG_STAT_CONFIGURATION: u32 = 0x180000;
pub const REG_STAT_AXI_ADDR_PTR_LSB: u32 = 0x180002;
pub const REG_STAT_AXI_ADDR_PTR_MSB: u32 = 0x180003;

// REG_STAT_CONFIGURATION 位定义
pub const STAT_CFG_UPDATED: u32 = 1 << 0;
pub const STAT_TERM_ERR: u32 = 1 << 1;
pub const STAT_GEN_SEED_ERR: u32 = 1 << 2;
pub const STAT_TERM_SEED_ERR: u32 = 1 << 3;
pub const STAT_TOGGLE_1_SEC_SHIFT: u32 = 15;
pub const STAT_TIMESTAMP_1_SEC_SHIFT: u32 = 16;

/// Bytes reserved for each channel in the bulk status block.
pub const MEMORY_CHAN_BUF_SIZE: usize = 64;
pub const STATUS_WORDS_PER_CHANNEL: usize = MEMORY_CHAN_BUF_SIZE / std::mem::size_of::<u32>();

// 状态块内各字的下标
pub const STAT_IDX_CONFIGURATION: usize = 0;
pub const STAT_IDX_ERROR_COUNT: usize = 1;
pub const STAT_IDX_AXI_ADDR_PTR_LSB: usize = 2;
pub const STAT_IDX_AXI_ADDR_PTR_MSB: usize = 3;
pub const STAT_IDX_WR_TOTAL_LSB: usize = 4;
pub const STAT_IDX_WR_TOTAL_MSB: usize = 5;
pub const STAT_IDX_WR_INST: usize = 6;
pub const STAT_IDX_RD_TOTAL_LSB: usize = 7;
pub const STAT_IDX_RD_TOTAL_MSB: usize = 8;
pub const STAT_IDX_RD_INST: usize = 9;
pub const STAT_IDX_TIMESTAMP: usize = 10;

/// Channel-addressed register capability of a memory-test hardware block.
pub trait RegisterAccess {
    fn read_channel_register(&mut self, channel: usize, address: u32) -> EngineResult<u32>;
    fn write_channel_register(&mut self, channel: usize, address: u32, value: u32) -> EngineResult<()>;
    /// Fills `buffer` with `STATUS_WORDS_PER_CHANNEL` words per channel, channel 0 first.
    fn read_channel_status_block(&mut self, buffer: &mut [u32]) -> EngineResult<()>;
}

/// Time source for the control thread. Every blocking wait in the engine goes
/// through here so the whole run can be driven by a virtual clock.
pub trait Timer: Send + Sync {
    fn wait_333ms(&self);
    fn wait_secs(&self, secs: u64);
    /// Whole seconds elapsed since the timer was created.
    fn sec_count(&self) -> u64;
}

// 单个通道的运行时状态：寄存器快照 + 突发统计
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelStatus {
    pub configuration: u32,
    pub term_err_cnt: u32,
    pub axi_addr_ptr: u64,
    pub timestamp: u32,
    pub cfg_updated: bool,
    pub term_err: bool,
    pub gen_seed_err: bool,
    pub term_seed_err: bool,
    pub toggle_1_sec: u32,
    pub timestamp_1_sec: u32,
    pub wr_burst: BurstStat,
    pub rd_burst: BurstStat,
}

impl ChannelStatus {
    /// Decodes one channel's slice of the bulk status block. Accumulated
    /// statistics are kept; only the raw register fields are replaced.
    pub fn load(&mut self, words: &[u32]) {
        let word = |idx: usize| words.get(idx).copied().unwrap_or(0);
        let pair = |lsb: usize, msb: usize| (word(lsb) as u64) | ((word(msb) as u64) << 32);

        self.configuration = word(STAT_IDX_CONFIGURATION);
        self.term_err_cnt = word(STAT_IDX_ERROR_COUNT) & 0xFF;
        self.axi_addr_ptr = pair(STAT_IDX_AXI_ADDR_PTR_LSB, STAT_IDX_AXI_ADDR_PTR_MSB);
        self.wr_burst.reg_total = pair(STAT_IDX_WR_TOTAL_LSB, STAT_IDX_WR_TOTAL_MSB);
        self.wr_burst.reg_inst = word(STAT_IDX_WR_INST);
        self.rd_burst.reg_total = pair(STAT_IDX_RD_TOTAL_LSB, STAT_IDX_RD_TOTAL_MSB);
        self.rd_burst.reg_inst = word(STAT_IDX_RD_INST);
        self.timestamp = word(STAT_IDX_TIMESTAMP);

        let cfg = self.configuration;
        self.cfg_updated = cfg & STAT_CFG_UPDATED != 0;
        self.term_err = cfg & STAT_TERM_ERR != 0;
        self.gen_seed_err = cfg & STAT_GEN_SEED_ERR != 0;
        self.term_seed_err = cfg & STAT_TERM_SEED_ERR != 0;
        self.toggle_1_sec = (cfg >> STAT_TOGGLE_1_SEC_SHIFT) & 0x1;
        self.timestamp_1_sec = (cfg >> STAT_TIMESTAMP_1_SEC_SHIFT) & 0xFFFF;
    }

    pub fn burst(&self, dir: Direction) -> &BurstStat {
        match dir {
            Direction::Write => &self.wr_burst,
            Direction::Read => &self.rd_burst,
        }
    }

    pub fn burst_mut(&mut self, dir: Direction) -> &mut BurstStat {
        match dir {
            Direction::Write => &mut self.wr_burst,
            Direction::Read => &mut self.rd_burst,
        }
    }
}
