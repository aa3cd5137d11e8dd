// 命令行参数与进程级工具
use clap::Parser;

use std::io;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{
    parse_channel_entry, parse_sequence_entry, parse_threshold_override, MemoryKind, MemorySettings, SequenceEntry,
    TestcaseOptions, ThresholdOverride, MIN_LO_THRESH,
};
use crate::error::{EngineError, EngineResult};
use crate::sim::SimFault;
use crate::types::{PerMode, Threshold, WrRd};

/// Upper latency threshold applied when none is given, in ns.
pub const DEFAULT_MAX_LATENCY_NS: f64 = 100_000.0;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(short = 'L', long = "log-path", default_value = "./memstress_log/",
           help = "Directory of the log file memstress.log")]
    pub log_path: String,

    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count,
           help = "Also write debug messages to the log file")]
    pub verbose: u8,

    #[clap(long = "name", default_value = "DDR", help = "Memory name used in messages")]
    pub name: String,

    #[clap(short = 'n', long = "channels", default_value = "1", help = "Number of channels of the memory")]
    pub channels: usize,

    #[clap(short = 's', long = "size", value_parser = parse_memory_size, default_value = "1G",
           help = "Total memory size shared by all channels. Default unit is MB (supports K, M, G)")]
    pub size: u64,

    #[clap(long = "axi-width", default_value = "512", help = "AXI data width in bits")]
    pub axi_width: u32,

    #[clap(long = "clock", default_value = "300", help = "Memory test block clock in MHz")]
    pub clock_mhz: u32,

    #[clap(long = "axi-threads", default_value = "1", help = "Number of AXI threads of the test block")]
    pub axi_threads: u32,

    #[clap(short = 'd', long = "disable-channel", help = "Channel excluded from the test (repeatable)")]
    pub disable_channels: Vec<usize>,

    #[clap(short = 'p', long = "pattern", help = "Pattern control: prbs, fixed or alternate (default: prbs)")]
    pub pattern: Option<String>,

    #[clap(long = "pattern-word", help = "32-bit hex pattern word (repeatable, default: 0xCAFECAFE 0xF00DF00D)")]
    pub pattern_words: Vec<String>,

    #[clap(long = "chan-pattern", help = "Per-channel pattern control as <ch>:<pattern> (repeatable)")]
    pub chan_patterns: Vec<String>,

    #[clap(long = "disable-prewrite", help = "Do not write the memory before read tests")]
    pub disable_prewrite: bool,

    #[clap(long = "single-axi-thread", help = "Use a single AXI thread when the block has several")]
    pub single_axi_thread: bool,

    #[clap(long = "check-bw", help = "Enable or disable the bandwidth check (true/false)")]
    pub check_bw: Option<bool>,

    #[clap(long = "check-latency", help = "Enable or disable the latency check (true/false)")]
    pub check_latency: Option<bool>,

    #[clap(long = "check-data-integrity", help = "Enable or disable the data integrity check (true/false)")]
    pub check_data_integrity: Option<bool>,

    #[clap(long = "bw-threshold", help = "Bandwidth threshold in MBps as [<ch>:]<mode>:<wr|rd>:<low>:<high>")]
    pub bw_thresholds: Vec<String>,

    #[clap(long = "latency-threshold", help = "Latency threshold in ns as [<ch>:]<mode>:<wr|rd>:<low>:<high>")]
    pub latency_thresholds: Vec<String>,

    #[clap(short = 't', long = "test", required = true,
           help = "Test as <duration>,<mode>[,<key>=<value>...] (repeatable, run in order)")]
    pub tests: Vec<String>,

    #[clap(long = "chan-test", help = "Channel test sequence override as <ch>:<duration>,<mode>[,...]")]
    pub chan_tests: Vec<String>,

    #[clap(short = 'o', long = "output-dir", default_value = "./memstress_output/",
           help = "Directory of the CSV measurement files")]
    pub output_dir: String,

    #[clap(short = 'c', long = "control-core", help = "Logical core running the test sequence (default: last core)")]
    pub control_core: Option<usize>,

    #[clap(long = "realtime", help = "Pace the simulated test block in real time")]
    pub realtime: bool,

    #[clap(long = "seed", default_value = "24301", help = "Seed of the simulated measurement jitter")]
    pub seed: u64,

    #[clap(long = "no-telemetry", help = "Do not sample host sensors")]
    pub no_telemetry: bool,

    #[clap(long = "inject", value_parser = SimFault::parse,
           help = "Fault of the simulated block: latch:<ch>:<secs>, stuck-update:<ch>, frozen-toggle:<ch>, axi-mismatch:<ch>, register:<hex>")]
    pub faults: Vec<SimFault>,
}

impl Args {
    pub fn log_file(&self) -> String {
        std::path::Path::new(&self.log_path)
            .join("memstress.log")
            .to_string_lossy()
            .into_owned()
    }

    /// Memory description built from the command line, validated.
    pub fn memory_settings(&self) -> EngineResult<MemorySettings> {
        let axi_bytes = (self.axi_width / 8) as f64;
        let max_bw = (axi_bytes * self.clock_mhz as f64 * 1_000_000.0 / 1024.0 / 1024.0).floor();

        let mut rate = PerMode::uniform(100.0);
        rate.alt_wr_rd = WrRd::new(50.0, 50.0);
        rate.simul_wr_rd = WrRd::new(50.0, 50.0);

        let settings = MemorySettings {
            name: self.name.clone(),
            kind: if self.channels > 1 {
                MemoryKind::MultiChannel
            } else {
                MemoryKind::SingleChannel
            },
            num_channels: self.channels,
            size_mb: self.size / (1024 * 1024),
            axi_data_bits: self.axi_width,
            num_axi_thread: self.axi_threads,
            clock_mhz: self.clock_mhz,
            rate,
            outstanding: PerMode::uniform(0),
            burst_size: PerMode::uniform(None),
            bw_thresholds: PerMode::uniform(Threshold::new(MIN_LO_THRESH, max_bw.max(MIN_LO_THRESH))),
            latency_thresholds: PerMode::uniform(Threshold::new(MIN_LO_THRESH, DEFAULT_MAX_LATENCY_NS)),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn testcase_options(&self) -> EngineResult<TestcaseOptions> {
        let mut errors = Vec::new();

        let mut channel_patterns = Vec::new();
        for s in &self.chan_patterns {
            match s.split_once(':').map(|(ch, p)| (ch.trim().parse::<usize>(), p.trim())) {
                Some((Ok(ch), pattern)) => channel_patterns.push((ch, pattern.to_string())),
                _ => errors.push(format!("invalid channel pattern \"{}\", expected <ch>:<pattern>", s)),
            }
        }

        let mut parse_thresholds = |list: &[String]| -> Vec<ThresholdOverride> {
            list.iter()
                .filter_map(|s| parse_threshold_override(s).map_err(|e| errors.push(e)).ok())
                .collect()
        };
        let bw_overrides = parse_thresholds(&self.bw_thresholds);
        let latency_overrides = parse_thresholds(&self.latency_thresholds);

        if !errors.is_empty() {
            return Err(EngineError::ConfigParse(errors));
        }
        Ok(TestcaseOptions {
            disable_channels: self.disable_channels.clone(),
            disable_prewrite: self.disable_prewrite,
            single_axi_thread: self.single_axi_thread,
            pattern: self.pattern.clone(),
            pattern_words: if self.pattern_words.is_empty() {
                None
            } else {
                Some(self.pattern_words.clone())
            },
            channel_patterns,
            check_bw: self.check_bw,
            check_latency: self.check_latency,
            check_data_integrity: self.check_data_integrity,
            bw_overrides,
            latency_overrides,
        })
    }

    /// Global test entries and per-channel overrides.
    pub fn sequence(&self) -> EngineResult<(Vec<SequenceEntry>, Vec<(usize, SequenceEntry)>)> {
        let mut errors = Vec::new();
        let global: Vec<SequenceEntry> = self
            .tests
            .iter()
            .filter_map(|s| parse_sequence_entry(s).map_err(|e| errors.push(e)).ok())
            .collect();
        let overrides: Vec<(usize, SequenceEntry)> = self
            .chan_tests
            .iter()
            .filter_map(|s| parse_channel_entry(s).map_err(|e| errors.push(e)).ok())
            .collect();
        if errors.is_empty() {
            Ok((global, overrides))
        } else {
            Err(EngineError::ConfigParse(errors))
        }
    }
}

pub fn parse_memory_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (num_str, mult) = if s.ends_with('B') {
        (&s[..s.len() - 1], 1)
    } else if s.ends_with('K') {
        (&s[..s.len() - 1], 1024)
    } else if s.ends_with('M') {
        (&s[..s.len() - 1], 1024 * 1024)
    } else if s.ends_with('G') {
        (&s[..s.len() - 1], 1024 * 1024 * 1024)
    } else {
        (s.as_str(), 1024 * 1024)
    };

    num_str
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(mult))
        .ok_or_else(|| format!("Invalid memory size: {}", s))
}

pub fn parse_args() -> Args {
    Args::parse()
}

pub fn usage(e: &str) -> ! {
    eprintln!("Error: {}", e);
    eprintln!();
    eprintln!("Usage examples:");
    eprintln!("  # 20 s write then 20 s read on a single 1GB channel");
    eprintln!("  memstress --test 20,only_wr --test 20,only_rd");
    eprintln!();
    eprintln!("  # 4 channels of 1GB, channel 2 disabled, fixed pattern");
    eprintln!("  memstress -n 4 -s 4G -d 2 --pattern fixed --test 30,simultaneous_wr_rd");
    eprintln!();
    eprintln!("  # Channel 1 uses 256 Byte bursts");
    eprintln!("  memstress -n 2 -s 2G --test 20,only_wr --chan-test 1:20,only_wr,wr_burst_size=256");
    process::exit(1);
}

// ================================================================================================
// Abort handling
// ================================================================================================

/// Routes Ctrl-C and SIGTERM to `flag`. Can be installed once per process.
pub fn install_abort_handler(flag: Arc<AtomicBool>) -> io::Result<()> {
    ctrlc::set_handler(move || {
        // 只置位，控制线程在下一个同步点自行停止
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["memstress"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn memory_size_suffixes() {
        assert_eq!(parse_memory_size("512"), Ok(512 * 1024 * 1024));
        assert_eq!(parse_memory_size("4k"), Ok(4096));
        assert_eq!(parse_memory_size("2G"), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_size("100B"), Ok(100));
        assert!(parse_memory_size("lots").is_err());
    }

    #[test]
    fn test_entry_is_required() {
        assert!(Args::try_parse_from(["memstress"]).is_err());
    }

    #[test]
    fn memory_description_from_command_line() {
        let a = args(&["-n", "2", "-s", "2G", "--clock", "250", "-t", "20,only_wr"]);
        let s = a.memory_settings().unwrap();
        assert_eq!(s.kind, MemoryKind::MultiChannel);
        assert_eq!(s.size_mb, 2048);
        assert_eq!(s.channel_size_bytes(), 1024 * 1024 * 1024);
        // 64 B * 250 MHz
        assert_eq!(s.bw_thresholds.only_wr.write.high, 15258.0);
        assert_eq!(a.log_file(), "./memstress_log/memstress.log");
    }

    #[test]
    fn zero_channels_is_rejected() {
        let a = args(&["-n", "0", "-t", "20,only_wr"]);
        assert!(matches!(a.memory_settings(), Err(EngineError::ConfigParse(_))));
    }

    #[test]
    fn options_and_sequence_collect_every_error() {
        let a = args(&[
            "-t", "20,only_wr",
            "-t", "x,only_wr",
            "--chan-test", "oops",
            "--chan-pattern", "1:fixed",
            "--bw-threshold", "only_wr:wr:10:20",
            "--check-bw", "false",
        ]);
        let opts = a.testcase_options().unwrap();
        assert_eq!(opts.channel_patterns, vec![(1, "fixed".to_string())]);
        assert_eq!(opts.bw_overrides.len(), 1);
        assert_eq!(opts.check_bw, Some(false));
        assert_eq!(opts.pattern_words, None);

        match a.sequence() {
            Err(EngineError::ConfigParse(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn faults_are_parsed_by_clap() {
        let a = args(&["-t", "20,only_wr", "--inject", "latch:0:12", "--inject", "frozen-toggle:1"]);
        assert_eq!(
            a.faults,
            vec![SimFault::Latch { channel: 0, after_secs: 12 }, SimFault::FrozenToggle(1)]
        );
        assert!(Args::try_parse_from(["memstress", "-t", "20,only_wr", "--inject", "boom"]).is_err());
    }

    #[test]
    fn bad_channel_pattern_is_reported() {
        let a = args(&["-t", "20,only_wr", "--chan-pattern", "fixed"]);
        assert!(matches!(a.testcase_options(), Err(EngineError::ConfigParse(e)) if e.len() == 1));
    }

    #[test]
    fn abort_handler_installs_once() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(install_abort_handler(Arc::clone(&flag)).is_ok());
        let again = install_abort_handler(Arc::new(AtomicBool::new(false)));
        assert_eq!(again.map_err(|e| e.kind()), Err(io::ErrorKind::Other));
        assert!(!flag.load(Ordering::SeqCst));
    }
}
