use std::error::Error;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[macro_use]
mod logger;
mod config;
mod controller;
mod cpu_utils;
mod error;
mod evaluator;
mod hw;
mod integrity;
mod orchestrator;
mod planner;
mod prewrite;
mod report;
mod sim;
mod stats;
mod telemetry;
mod timebase;
mod types;
mod utils;

use config::{MemorySettings, ParameterBounds, TestcaseConfig};
use controller::ChannelRegisterController;
use error::{EngineError, EngineResult};
use logger::LogLevel;
use orchestrator::{RunOutcome, SequenceOrchestrator};
use planner::{SequencePlanner, TestPlan};
use report::CsvReportWriter;
use sim::{SimMemoryBlock, VirtualTimer};
use telemetry::{FixedSensors, SensorSource, TelemetryMonitor};
use types::TestState;
use utils::Args;

// 主机传感器采样周期
const TELEMETRY_PERIOD: Duration = Duration::from_secs(1);

/// Everything checked before the first register access.
struct PreparedRun {
    settings: MemorySettings,
    bounds: ParameterBounds,
    tc: TestcaseConfig,
    plan: TestPlan,
}

fn prepare(args: &Args) -> EngineResult<PreparedRun> {
    let settings = args.memory_settings()?;
    let opts = args.testcase_options()?;
    let (entries, overrides) = args.sequence()?;

    let tc = TestcaseConfig::build(&settings, &opts)?;
    let planner = SequencePlanner::new(&settings)?;
    let global = planner.plan(&entries)?;
    let plan = planner.plan_channels(global, &overrides)?;
    let bounds = planner.bounds().clone();

    log_debug_fmt!("{}", bounds.describe());
    Ok(PreparedRun {
        settings,
        bounds,
        tc,
        plan,
    })
}

// 控制线程：绑核后驱动整个测试序列
fn control_thread(
    args: &Args,
    run: &PreparedRun,
    sensors: &dyn SensorSource,
    abort: Arc<AtomicBool>,
) -> EngineResult<RunOutcome> {
    let core_id = cpu_utils::control_core(args.control_core);
    if cpu_utils::bind_thread_to_core(core_id) {
        log_debug_fmt!("Control thread has successfully been bound to CPU core {}.", core_id);
    } else {
        log_warn_fmt!("Warning: Failed to bind the control thread to CPU core {}.", core_id);
    }

    let settings = &run.settings;
    let timer = Arc::new(if args.realtime {
        VirtualTimer::paced()
    } else {
        VirtualTimer::new()
    });
    let mut device = SimMemoryBlock::new(settings.num_channels, settings.axi_bytes(), settings.clock_mhz, timer.clock())
        .with_seed(args.seed);
    for fault in &args.faults {
        log_warn_fmt!("Simulated fault enabled: {:?}", fault);
        device.inject(*fault);
    }
    let ctrl = ChannelRegisterController::new(device, settings.num_channels, timer, abort);

    let sink = CsvReportWriter::new(&args.output_dir)
        .map_err(|e| EngineError::config(format!("cannot create output directory {}: {}", args.output_dir, e)))?;
    log_info_fmt!("Measurements are written to {}", args.output_dir);

    let mut orchestrator = SequenceOrchestrator::new(settings, &run.bounds, &run.tc, &run.plan, ctrl, sensors, sink);
    let outcome = orchestrator.run();
    log_debug_fmt!(
        "Simulated block received {} register writes",
        orchestrator.controller().device().register_writes()
    );
    outcome
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = utils::parse_args();

    // -L参数是目录路径，日志文件名固定为memstress.log
    let log_file_path = args.log_file();
    if let Err(e) = logger::init_logger_with_level(Some(&log_file_path), LogLevel::from_verbosity(args.verbose)) {
        eprintln!("Failed to initialize logger: {}", e);
        // 继续运行，使用控制台输出
    }
    log_info_fmt!("Log path: {}", log_file_path);

    let abort = Arc::new(AtomicBool::new(false));
    if let Err(e) = utils::install_abort_handler(Arc::clone(&abort)) {
        log_warn_fmt!("Failed to install the abort handler, Ctrl-C will not stop the test cleanly: {}", e);
    }

    let run = match prepare(&args) {
        Ok(run) => run,
        Err(EngineError::ConfigParse(errors)) => {
            for msg in &errors {
                log_error_fmt!("{}", msg);
            }
            utils::usage(&format!("{} configuration error(s)", errors.len()));
        }
        Err(e) => utils::usage(&e.to_string()),
    };

    log_info_fmt!(
        "{}: {} channel(s), {} MB, AXI {} bits at {} MHz",
        run.settings.name,
        run.settings.num_channels,
        run.settings.size_mb,
        run.settings.axi_data_bits,
        run.settings.clock_mhz
    );

    let sensors: Box<dyn SensorSource + Send + Sync> = if args.no_telemetry {
        Box::new(FixedSensors::default())
    } else {
        Box::new(TelemetryMonitor::start(TELEMETRY_PERIOD))
    };

    let joined = thread::scope(|s| {
        let handle = s.spawn(|| control_thread(&args, &run, sensors.as_ref(), Arc::clone(&abort)));
        handle.join()
    });

    // 先停掉采样线程再退出
    drop(sensors);

    match joined {
        Ok(Ok(outcome)) => {
            if outcome.state != TestState::Pass {
                process::exit(outcome.state.exit_code());
            }
            Ok(())
        }
        Ok(Err(e)) => {
            log_error_fmt!("Test stopped on error: {}", e);
            Err(e.into())
        }
        Err(e) => {
            logger::log_error(&format!("Control thread failed to join: {:?}", e));
            process::exit(1);
        }
    }
}
