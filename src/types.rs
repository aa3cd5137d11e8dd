// 数据模型：测试模式、方向、单次迭代配置以及判定结果
// 这些类型在 planner 构建之后不再修改

use std::fmt;

// 四种固定的工作负载模式，寄存器值与硬件约定一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestMode {
    AlternateWrRd,
    OnlyWr,
    OnlyRd,
    SimultaneousWrRd,
}

impl TestMode {
    pub const ALL: [TestMode; 4] = [
        TestMode::AlternateWrRd,
        TestMode::OnlyWr,
        TestMode::OnlyRd,
        TestMode::SimultaneousWrRd,
    ];

    pub fn register_value(self) -> u32 {
        match self {
            TestMode::AlternateWrRd => 0,
            TestMode::OnlyWr => 1,
            TestMode::OnlyRd => 2,
            TestMode::SimultaneousWrRd => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestMode::AlternateWrRd => "alternate_wr_rd",
            TestMode::OnlyWr => "only_wr",
            TestMode::OnlyRd => "only_rd",
            TestMode::SimultaneousWrRd => "simultaneous_wr_rd",
        }
    }

    // 大小写不敏感
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        TestMode::ALL.iter().copied().find(|m| m.as_str() == lower)
    }

    pub fn is_write(self) -> bool {
        !matches!(self, TestMode::OnlyRd)
    }

    pub fn is_read(self) -> bool {
        !matches!(self, TestMode::OnlyWr)
    }

    pub fn has(self, dir: Direction) -> bool {
        match dir {
            Direction::Write => self.is_write(),
            Direction::Read => self.is_read(),
        }
    }
}

impl fmt::Display for TestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Write,
    Read,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Write, Direction::Read];

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Write => "write",
            Direction::Read => "read",
        }
    }

    // 参数名前缀，例如 wr_burst_size / rd_burst_size
    pub fn prefix(self) -> &'static str {
        match self {
            Direction::Write => "wr",
            Direction::Read => "rd",
        }
    }
}

/// A value held once per transfer direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WrRd<T> {
    pub write: T,
    pub read: T,
}

impl<T> WrRd<T> {
    pub fn new(write: T, read: T) -> Self {
        WrRd { write, read }
    }

    pub fn get(&self, dir: Direction) -> &T {
        match dir {
            Direction::Write => &self.write,
            Direction::Read => &self.read,
        }
    }

    pub fn get_mut(&mut self, dir: Direction) -> &mut T {
        match dir {
            Direction::Write => &mut self.write,
            Direction::Read => &mut self.read,
        }
    }
}

/// A direction pair held once per test mode: nominal rates, burst sizes,
/// outstanding limits and threshold tables all use this shape.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerMode<T> {
    pub alt_wr_rd: WrRd<T>,
    pub only_wr: WrRd<T>,
    pub only_rd: WrRd<T>,
    pub simul_wr_rd: WrRd<T>,
}

impl<T: Copy> PerMode<T> {
    pub fn uniform(value: T) -> Self {
        let pair = WrRd::new(value, value);
        PerMode {
            alt_wr_rd: pair,
            only_wr: pair,
            only_rd: pair,
            simul_wr_rd: pair,
        }
    }

    pub fn for_mode(&self, mode: TestMode) -> &WrRd<T> {
        match mode {
            TestMode::AlternateWrRd => &self.alt_wr_rd,
            TestMode::OnlyWr => &self.only_wr,
            TestMode::OnlyRd => &self.only_rd,
            TestMode::SimultaneousWrRd => &self.simul_wr_rd,
        }
    }

    pub fn for_mode_mut(&mut self, mode: TestMode) -> &mut WrRd<T> {
        match mode {
            TestMode::AlternateWrRd => &mut self.alt_wr_rd,
            TestMode::OnlyWr => &mut self.only_wr,
            TestMode::OnlyRd => &mut self.only_rd,
            TestMode::SimultaneousWrRd => &mut self.simul_wr_rd,
        }
    }

    /// Nominal value of `dir` when running `mode`. The single-direction modes
    /// resolve to the only_wr write entry and the only_rd read entry.
    pub fn nominal(&self, mode: TestMode, dir: Direction) -> T {
        match mode {
            TestMode::AlternateWrRd | TestMode::SimultaneousWrRd => *self.for_mode(mode).get(dir),
            TestMode::OnlyWr | TestMode::OnlyRd => match dir {
                Direction::Write => self.only_wr.write,
                Direction::Read => self.only_rd.read,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Threshold {
    pub low: f64,
    pub high: f64,
}

impl Threshold {
    pub fn new(low: f64, high: f64) -> Self {
        Threshold { low, high }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.low && value <= self.high
    }
}

// 单个方向的参数，地址与块大小单位为 MB，突发大小单位为字节
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectionSettings {
    pub rate: f64,
    pub bandwidth: u32,
    pub start_addr: u32,
    pub end_addr: u32,
    pub block_size: u32,
    pub burst_size: u32,
    pub outstanding: u32,
    pub burst_xfer: u32,
    pub total_xfer: u32,
    pub num_burst: u32,
}

impl DirectionSettings {
    pub fn block_size_bytes(&self) -> u64 {
        self.block_size as u64 * 1024 * 1024
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestIteration {
    pub duration: u32,
    pub mode: TestMode,
    pub write: DirectionSettings,
    pub read: DirectionSettings,
    /// Parameters as the user entered them.
    pub user_params: Vec<String>,
    /// Parameters after defaults were filled in.
    pub resolved_params: Vec<String>,
}

impl TestIteration {
    pub fn is_write(&self) -> bool {
        self.mode.is_write()
    }

    pub fn is_read(&self) -> bool {
        self.mode.is_read()
    }

    pub fn settings(&self, dir: Direction) -> &DirectionSettings {
        match dir {
            Direction::Write => &self.write,
            Direction::Read => &self.read,
        }
    }

    pub fn settings_mut(&mut self, dir: Direction) -> &mut DirectionSettings {
        match dir {
            Direction::Write => &mut self.write,
            Direction::Read => &mut self.read,
        }
    }

    pub fn describe(&self) -> String {
        format!("{{ {} }}", self.user_params.join(", "))
    }

    pub fn describe_resolved(&self) -> String {
        format!("{{ {} }}", self.resolved_params.join(", "))
    }
}

// 数据完整性三态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Ok,
    Corrupted,
    NotChecked,
}

impl Integrity {
    pub fn as_str(self) -> &'static str {
        match self {
            Integrity::Ok => "OK",
            Integrity::Corrupted => "KO",
            Integrity::NotChecked => "NC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResult {
    NotTested,
    Passed,
    Failed,
    Aborted,
}

impl IterationResult {
    pub fn as_str(self) -> &'static str {
        match self {
            IterationResult::NotTested => "NOT TESTED",
            IterationResult::Passed => "PASSED",
            IterationResult::Failed => "FAILED",
            IterationResult::Aborted => "ABORTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Pass,
    Failure,
    Abort,
}

impl TestState {
    pub fn exit_code(self) -> i32 {
        match self {
            TestState::Pass => 0,
            TestState::Failure => 1,
            TestState::Abort => 2,
        }
    }
}
