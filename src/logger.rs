// 统一日志收集模块
// 同时输出到控制台和文件；控制台不显示 DEBUG 级别
//
// 使用方式：
// - main 里调用一次 init_logger_with_level，之后任何线程都能直接写日志
// - 带格式的日志用 log_info_fmt! 这类宏，写法和 println! 一样
// - 日志器还没初始化时，宏会退回到 println!/eprintln!，不会丢消息
// - 文件里只写纯文本，颜色码只出现在控制台

use std::fs::{self, OpenOptions};       // 创建日志目录、以追加方式打开文件
use std::io::{self, Write};             // writeln! 需要 Write trait 在作用域内
use std::path::Path;
use std::sync::{Arc, Mutex};            // 文件句柄被多个线程共享，写之前要加锁
use std::time::{SystemTime, UNIX_EPOCH};

// 本地时区偏移（UTC+8），时间戳不依赖系统时区设置
const TIMEZONE_OFFSET_S: u64 = 8 * 3600;

// 日志级别，从低到高排列
// 派生 PartialOrd 后可以直接用 < 比较，级别过滤就靠这个顺序
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub enum LogLevel {
    Debug,   // 寄存器读写、参数展开等细节，默认只进文件
    Info,    // 测试进度
    Warn,    // 可恢复的问题，例如 toggle 丢失、配置更新慢
    Error,   // 阈值越界、数据错误、寄存器访问失败
    Success, // 整体测试通过
}

impl LogLevel {
    // 日志行里显示的级别名
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Success => "SUCCESS",
        }
    }

    // 控制台用的 ANSI 颜色，每行结尾用 \x1b[0m 复位
    fn color_code(&self) -> &'static str {
        match self {
            LogLevel::Debug => "\x1b[37m",   // 灰白
            LogLevel::Info => "\x1b[36m",    // 青
            LogLevel::Warn => "\x1b[33m",    // 黄
            LogLevel::Error => "\x1b[31m",   // 红
            LogLevel::Success => "\x1b[32m", // 绿
        }
    }

    /// Maps the `-v` count of the command line to a level.
    pub fn from_verbosity(verbosity: u8) -> Self {
        // 目前只有两档，多给几个 -v 也是 Debug
        if verbosity > 0 {
            LogLevel::Debug
        } else {
            LogLevel::Info
        }
    }
}

// 公历闰年：能被 4 整除，整百年还要能被 400 整除
fn is_leap(year: u64) -> bool {
    year % 4 == 0 && (year % 100 != 0 || year % 400 == 0)
}

/// `YYYY-MM-DD HH:MM:SS.mmm` for milliseconds since the Unix epoch, local time.
pub fn format_timestamp(epoch_ms: u64) -> String {
    let millis = epoch_ms % 1000;
    let local = epoch_ms / 1000 + TIMEZONE_OFFSET_S; // 先加时区偏移再拆分，跨零点时日期才正确
    let mut remaining_days = local / 86400;
    let seconds_today = local % 86400;

    // 从 1970 年开始逐年扣除天数，剩下的就是当年的第几天（从 0 开始）
    let mut year = 1970;
    loop {
        let days_in_year = if is_leap(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let days_in_months = if is_leap(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };
    // 同样的办法逐月扣除，day_of_month 从 1 开始计
    let mut month = 1;
    let mut day_of_month = remaining_days + 1;
    for &days_in_month in &days_in_months {
        if day_of_month <= days_in_month {
            break;
        }
        day_of_month -= days_in_month;
        month += 1;
    }

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
        year,
        month,
        day_of_month,
        seconds_today / 3600,
        (seconds_today % 3600) / 60,
        seconds_today % 60,
        millis
    )
}

// 日志器本体
// 没有日志文件时 file_writer 为 None，只写控制台
pub struct Logger {
    file_writer: Option<Arc<Mutex<std::fs::File>>>, // 多线程共享同一个文件句柄
    console_enabled: bool,
    file_enabled: bool,
    min_level: LogLevel, // 低于此级别的消息直接丢弃
}

#[allow(dead_code)]
impl Logger {
    // path 为 None 时只输出到控制台
    // 目录不存在会自动创建；文件以追加方式打开，多次运行的日志会接在一起
    pub fn new(log_file_path: Option<&str>) -> io::Result<Self> {
        let file_writer = if let Some(path) = log_file_path {
            if let Some(parent_dir) = Path::new(path).parent() {
                fs::create_dir_all(parent_dir)?; // 类似 mkdir -p
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(Arc::new(Mutex::new(file)))
        } else {
            None
        };

        let file_enabled = file_writer.is_some();
        // 级别默认全开，由 init_logger_with_level 再按 -v 调整
        Ok(Logger {
            file_writer,
            console_enabled: true,
            file_enabled,
            min_level: LogLevel::Debug,
        })
    }

    // 系统时间早于 1970 时退回 0，不让日志把程序搞崩
    fn get_timestamp() -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        format_timestamp(now.as_millis() as u64)
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        if level < self.min_level {
            return;
        }

        let timestamp = Self::get_timestamp();
        let level_str = level.as_str();

        // DEBUG 在测试时刷屏太厉害，只写文件
        if self.console_enabled && LogLevel::Debug != level {
            let color = level.color_code();
            let reset = "\x1b[0m";
            println!("{color}[{timestamp}] {level_str}: {message}{reset}");
        }

        // 文件里不带颜色码；每行都 flush，程序被中断时日志也是完整的
        // 写失败（磁盘满等）只能忽略，日志本身没有地方再报错
        if self.file_enabled {
            if let Some(ref file_writer) = self.file_writer {
                if let Ok(mut file) = file_writer.lock() {
                    let _ = writeln!(file, "[{}] {}: {}", timestamp, level_str, message);
                    let _ = file.flush();
                }
            }
        }
    }

    // 只能在放进全局 OnceLock 之前调用，之后日志器是只读的
    pub fn set_min_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    // 各级别的快捷方法，供下面生成的全局函数调用
    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }

    pub fn success(&self, message: &str) {
        self.log(LogLevel::Success, message);
    }

    // 原样输出，不加时间戳和级别，也不受级别过滤
    // 结果表格用它输出，保证各列对齐
    pub fn raw(&self, message: &str) {
        if self.console_enabled {
            println!("{}", message);
        }
        if self.file_enabled {
            if let Some(ref file_writer) = self.file_writer {
                if let Ok(mut file) = file_writer.lock() {
                    let _ = writeln!(file, "{}", message);
                    let _ = file.flush();
                }
            }
        }
    }

    // 给 *_fmt! 宏用的入口
    // 先判断级别再格式化，被过滤掉的 debug 消息不会产生 format! 开销
    pub fn log_fmt(&self, level: LogLevel, args: std::fmt::Arguments) {
        if level < self.min_level {
            return;
        }
        let message = format!("{}", args);
        self.log(level, &message);
    }

    pub fn debug_fmt(&self, args: std::fmt::Arguments) {
        self.log_fmt(LogLevel::Debug, args);
    }

    pub fn info_fmt(&self, args: std::fmt::Arguments) {
        self.log_fmt(LogLevel::Info, args);
    }

    pub fn warn_fmt(&self, args: std::fmt::Arguments) {
        self.log_fmt(LogLevel::Warn, args);
    }

    pub fn error_fmt(&self, args: std::fmt::Arguments) {
        self.log_fmt(LogLevel::Error, args);
    }

    pub fn success_fmt(&self, args: std::fmt::Arguments) {
        self.log_fmt(LogLevel::Success, args);
    }
}

// ---------------------------------------------------------------------------
// 全局日志器
// ---------------------------------------------------------------------------

use std::sync::OnceLock;

// 进程内只初始化一次；OnceLock 保证并发读取时不需要额外加锁
static GLOBAL_LOGGER: OnceLock<Logger> = OnceLock::new();

// 重复初始化返回 AlreadyExists，调用方一般只打印警告继续运行
pub fn init_logger_with_level(log_file_path: Option<&str>, min_level: LogLevel) -> io::Result<()> {
    // 文件打不开时退回到仅控制台
    let mut logger = Logger::new(log_file_path).or_else(|_| Logger::new(None))?;
    logger.set_min_level(min_level);
    GLOBAL_LOGGER
        .set(logger)
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "Logger already initialized"))?;
    Ok(())
}

// 未初始化时返回 None，调用方自行退回到标准输出
pub fn get_logger() -> Option<&'static Logger> {
    GLOBAL_LOGGER.get()
}

// 生成 log_info(&str) 这类全局函数
// 第一种写法在退回标准输出时加级别前缀，第二种原样输出
macro_rules! generate_global_log_fn {
    ($fn_name:ident, $method:ident, $level:literal, $fallback:ident) => {
        #[allow(dead_code)]
        pub fn $fn_name(message: &str) {
            if let Some(logger) = get_logger() {
                logger.$method(message);
            } else {
                $fallback!("{}: {}", $level, message);
            }
        }
    };
    ($fn_name:ident, $method:ident, $fallback:ident) => {
        #[allow(dead_code)]
        pub fn $fn_name(message: &str) {
            if let Some(logger) = get_logger() {
                logger.$method(message);
            } else {
                $fallback!("{}", message);
            }
        }
    };
}

// 调试、警告、错误走 stderr，其余走 stdout
generate_global_log_fn!(log_debug, debug, "DEBUG", eprintln);
generate_global_log_fn!(log_info, info, println);
generate_global_log_fn!(log_warn, warn, "WARNING", eprintln);
generate_global_log_fn!(log_error, error, "ERROR", eprintln);
generate_global_log_fn!(log_success, success, println);
generate_global_log_fn!(log_raw, raw, println);

// 带格式参数的日志宏，用法同 println!，例如：
//   log_warn_fmt!("toggle missed {} times (channel {})", n, ch);
// #[macro_export] 让宏在整个 crate 可见，main.rs 里 logger 模块要放在最前面声明
#[macro_export]
macro_rules! log_debug_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.debug_fmt(format_args!($($arg)*));
        } else {
            eprintln!("DEBUG: {}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_info_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.info_fmt(format_args!($($arg)*));
        } else {
            println!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.warn_fmt(format_args!($($arg)*));
        } else {
            eprintln!("WARNING: {}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_error_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.error_fmt(format_args!($($arg)*));
        } else {
            eprintln!("ERROR: {}", format!($($arg)*));
        }
    };
}

#[macro_export]
macro_rules! log_success_fmt {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::logger::get_logger() {
            logger.success_fmt(format_args!($($arg)*));
        } else {
            println!($($arg)*);
        }
    };
}

// 按级别分发
#[macro_export]
macro_rules! log {
    (debug, $($arg:tt)*) => { $crate::log_debug_fmt!($($arg)*); };
    (info, $($arg:tt)*) => { $crate::log_info_fmt!($($arg)*); };
    (warn, $($arg:tt)*) => { $crate::log_warn_fmt!($($arg)*); };
    (error, $($arg:tt)*) => { $crate::log_error_fmt!($($arg)*); };
    (success, $($arg:tt)*) => { $crate::log_success_fmt!($($arg)*); };
}
