// 主机传感器采样
// 后台线程每秒采样一次温度和内存占用，引擎只读取最近一次的快照

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sysinfo::{ComponentExt, System, SystemExt};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorSnapshot {
    pub sample_count: u64,
    pub used_memory_mb: u64,
    /// (component label, degrees Celsius)
    pub temperatures: Vec<(String, f32)>,
}

impl SensorSnapshot {
    pub fn max_temperature(&self) -> Option<f32> {
        self.temperatures
            .iter()
            .map(|(_, t)| *t)
            .filter(|t| t.is_finite())
            .fold(None, |acc, t| Some(acc.map_or(t, |a: f32| a.max(t))))
    }
}

/// Read-only access to the latest sensor sample.
pub trait SensorSource {
    fn get_sensor_snapshot(&self) -> SensorSnapshot;
}

/// Always returns the same snapshot; used when telemetry is off.
#[derive(Debug, Clone, Default)]
pub struct FixedSensors(pub SensorSnapshot);

impl SensorSource for FixedSensors {
    fn get_sensor_snapshot(&self) -> SensorSnapshot {
        self.0.clone()
    }
}

fn sample(system: &mut System, sample_count: u64) -> SensorSnapshot {
    system.refresh_memory();
    system.refresh_components();
    SensorSnapshot {
        sample_count,
        used_memory_mb: system.used_memory() / (1024 * 1024),
        temperatures: system
            .components()
            .iter()
            .map(|c| (c.label().to_string(), c.temperature()))
            .collect(),
    }
}

pub struct TelemetryMonitor {
    snapshot: Arc<Mutex<SensorSnapshot>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl TelemetryMonitor {
    pub fn start(period: Duration) -> Self {
        let snapshot = Arc::new(Mutex::new(SensorSnapshot::default()));
        let stop = Arc::new((Mutex::new(false), Condvar::new()));

        let snapshot_clone = Arc::clone(&snapshot);
        let stop_clone = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut system = System::new();
            system.refresh_components_list();
            let mut count = 0u64;
            loop {
                count += 1;
                let s = sample(&mut system, count);
                *snapshot_clone.lock().unwrap_or_else(PoisonError::into_inner) = s;

                let (lock, cvar) = &*stop_clone;
                let stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
                let (stopped, _) = cvar
                    .wait_timeout_while(stopped, period, |s| !*s)
                    .unwrap_or_else(PoisonError::into_inner);
                if *stopped {
                    break;
                }
            }
            log_debug_fmt!("Telemetry stopped after {} samples", count);
        });

        TelemetryMonitor {
            snapshot,
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        {
            let (lock, cvar) = &*self.stop;
            *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log_warn_fmt!("Telemetry thread panicked");
            }
        }
    }
}

impl SensorSource for TelemetryMonitor {
    fn get_sensor_snapshot(&self) -> SensorSnapshot {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Drop for TelemetryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn max_temperature_ignores_nan() {
        let s = SensorSnapshot {
            sample_count: 1,
            used_memory_mb: 0,
            temperatures: vec![("a".into(), 41.0), ("b".into(), f32::NAN), ("c".into(), 55.5)],
        };
        assert_eq!(s.max_temperature(), Some(55.5));
        assert_eq!(SensorSnapshot::default().max_temperature(), None);
    }

    #[test]
    fn monitor_samples_and_stops_promptly() {
        let mut monitor = TelemetryMonitor::start(Duration::from_secs(60));
        let deadline = Instant::now() + Duration::from_secs(5);
        while monitor.get_sensor_snapshot().sample_count == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(monitor.get_sensor_snapshot().sample_count, 1);
        let started = Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn fixed_sensors_return_their_snapshot() {
        let snap = SensorSnapshot {
            sample_count: 3,
            used_memory_mb: 1024,
            temperatures: vec![],
        };
        assert_eq!(FixedSensors(snap.clone()).get_sensor_snapshot(), snap);
    }
}
