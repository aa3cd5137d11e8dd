// 引擎错误类型
// 只有会中断运行的情况才是错误；toggle 丢失、阈值越界、数据完整性失败
// 都只是计入本次迭代的判定，不走 Err 分支

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Sequence or channel configuration rejected before any hardware access.
    ConfigParse(Vec<String>),
    /// A register read/write failed; fatal for the run.
    RegisterIo {
        channel: usize,
        address: u32,
        reason: String,
    },
    /// Configuration-update handshake never completed.
    ConfigUpdateTimeout { seconds: u64 },
    /// Per-register and bulk status reads disagree.
    StatusMismatch {
        channel: usize,
        single: u64,
        bulk: u64,
    },
}

impl EngineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        EngineError::ConfigParse(vec![msg.into()])
    }

    pub fn register_io<S: Into<String>>(channel: usize, address: u32, reason: S) -> Self {
        EngineError::RegisterIo {
            channel,
            address,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::ConfigParse(list) => {
                write!(f, "EngineError: configuration rejected")?;
                for msg in list {
                    write!(f, "\n\t- {}", msg)?;
                }
                Ok(())
            }
            EngineError::RegisterIo { channel, address, reason } => write!(
                f,
                "EngineError: register access 0x{:06X} failed (channel {}): {}",
                address, channel, reason
            ),
            EngineError::ConfigUpdateTimeout { seconds } => write!(
                f,
                "EngineError: configuration not updated in hardware after {} seconds",
                seconds
            ),
            EngineError::StatusMismatch { channel, single, bulk } => write!(
                f,
                "EngineError: AXI address pointer 0x{:016X} read by register does not match 0x{:016X} read in status block (channel {})",
                single, bulk, channel
            ),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parse_lists_every_diagnostic() {
        let err = EngineError::ConfigParse(vec!["first".into(), "second".into()]);
        let text = err.to_string();
        assert!(text.contains("\t- first"));
        assert!(text.contains("\t- second"));
    }

    #[test]
    fn register_io_formats_address_as_hex() {
        let err = EngineError::register_io(3, 0x100000, "bus error");
        assert_eq!(
            err.to_string(),
            "EngineError: register access 0x100000 failed (channel 3): bus error"
        );
    }
}
