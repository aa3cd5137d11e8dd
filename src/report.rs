// 测量记录：每次轮询一行明细，每次迭代一行结果
// 行数据由 orchestrator 生成，写到哪里由 MeasurementSink 决定

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::telemetry::SensorSnapshot;
use crate::types::Integrity;

const NA: &str = "n/a";

fn opt(v: Option<f64>, precision: usize) -> String {
    match v {
        Some(v) => format!("{:.*}", precision, v),
        None => NA.to_string(),
    }
}

fn channel_name(channel: Option<usize>) -> String {
    match channel {
        Some(ch) => ch.to_string(),
        None => "combined".to_string(),
    }
}

/// Live and running figures of one direction at one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveFigures {
    pub live_inst: f64,
    pub live_bw_mbps: f64,
    pub live_average_ns: f64,
    pub average_bw_mbps: f64,
    pub average_ns: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetailRow {
    pub iteration: usize,
    /// `None` for the combined figure.
    pub channel: Option<usize>,
    pub mode: String,
    pub hw_sec_cnt: u64,
    pub toggle_detected: bool,
    pub timestamp: u32,
    pub write: Option<LiveFigures>,
    pub read: Option<LiveFigures>,
    pub wr_plus_rd_live_bw_mbps: f64,
    pub wr_plus_rd_average_bw_mbps: f64,
    pub integrity: Integrity,
}

impl DetailRow {
    pub const HEADER: &'static str = "iteration,channel,mode,hw_sec_cnt,toggle,timestamp,\
wr_live_inst,wr_live_bw_mbps,wr_live_lat_ns,wr_avg_bw_mbps,wr_avg_lat_ns,\
rd_live_inst,rd_live_bw_mbps,rd_live_lat_ns,rd_avg_bw_mbps,rd_avg_lat_ns,\
wr_rd_live_bw_mbps,wr_rd_avg_bw_mbps,integrity";

    pub fn to_csv(&self) -> String {
        let fig = |f: &Option<LiveFigures>| match f {
            Some(f) => format!(
                "{:.0},{:.2},{:.2},{:.2},{:.2}",
                f.live_inst, f.live_bw_mbps, f.live_average_ns, f.average_bw_mbps, f.average_ns
            ),
            None => [NA; 5].join(","),
        };
        format!(
            "{},{},{},{},{},{},{},{},{:.2},{:.2},{}",
            self.iteration,
            channel_name(self.channel),
            self.mode,
            self.hw_sec_cnt,
            if self.toggle_detected { "OK" } else { "MISS" },
            self.timestamp,
            fig(&self.write),
            fig(&self.read),
            self.wr_plus_rd_live_bw_mbps,
            self.wr_plus_rd_average_bw_mbps,
            self.integrity.as_str()
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub iteration: usize,
    pub channel: Option<usize>,
    pub mode: String,
    pub duration: u32,
    pub hw_sec_cnt: u64,
    pub wr_bw_mbps: Option<f64>,
    pub wr_latency_ns: Option<f64>,
    pub rd_bw_mbps: Option<f64>,
    pub rd_latency_ns: Option<f64>,
    pub wr_plus_rd_bw_mbps: f64,
    pub integrity: Option<Integrity>,
    pub parameters: String,
}

impl ResultRow {
    pub const HEADER: &'static str = "iteration,channel,mode,duration,hw_sec_cnt,\
wr_avg_bw_mbps,wr_avg_lat_ns,rd_avg_bw_mbps,rd_avg_lat_ns,wr_rd_avg_bw_mbps,integrity,parameters";

    pub fn to_csv(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{:.2},{},\"{}\"",
            self.iteration,
            channel_name(self.channel),
            self.mode,
            self.duration,
            self.hw_sec_cnt,
            opt(self.wr_bw_mbps, 2),
            opt(self.wr_latency_ns, 2),
            opt(self.rd_bw_mbps, 2),
            opt(self.rd_latency_ns, 2),
            self.wr_plus_rd_bw_mbps,
            self.integrity.map(|i| i.as_str()).unwrap_or(NA),
            self.parameters.replace('"', "'")
        )
    }
}

/// One row per iteration listing every enabled channel's averages.
#[derive(Debug, Clone, PartialEq)]
pub struct McSummaryRow {
    pub iteration: usize,
    pub mode: String,
    /// (channel, write average bandwidth, read average bandwidth)
    pub channels: Vec<(usize, Option<f64>, Option<f64>)>,
    pub combined_wr_bw_mbps: Option<f64>,
    pub combined_rd_bw_mbps: Option<f64>,
}

impl McSummaryRow {
    pub fn header(channels: &[usize]) -> String {
        let mut cols = vec!["iteration".to_string(), "mode".to_string()];
        for ch in channels {
            cols.push(format!("chan_{}_wr_bw_mbps", ch));
            cols.push(format!("chan_{}_rd_bw_mbps", ch));
        }
        cols.push("combined_wr_bw_mbps".to_string());
        cols.push("combined_rd_bw_mbps".to_string());
        cols.join(",")
    }

    pub fn to_csv(&self) -> String {
        let mut cols = vec![self.iteration.to_string(), self.mode.clone()];
        for (_, wr, rd) in &self.channels {
            cols.push(opt(*wr, 2));
            cols.push(opt(*rd, 2));
        }
        cols.push(opt(self.combined_wr_bw_mbps, 2));
        cols.push(opt(self.combined_rd_bw_mbps, 2));
        cols.join(",")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PowerRow {
    pub iteration: usize,
    pub hw_sec_cnt: u64,
    pub sensors: SensorSnapshot,
}

impl PowerRow {
    pub const HEADER: &'static str = "iteration,hw_sec_cnt,sample,used_memory_mb,max_temperature_c,temperatures";

    pub fn to_csv(&self) -> String {
        let temps: Vec<String> = self
            .sensors
            .temperatures
            .iter()
            .map(|(label, t)| format!("{}={:.1}", label.replace(',', " "), t))
            .collect();
        format!(
            "{},{},{},{},{},\"{}\"",
            self.iteration,
            self.hw_sec_cnt,
            self.sensors.sample_count,
            self.sensors.used_memory_mb,
            opt(self.sensors.max_temperature().map(|t| t as f64), 1),
            temps.join(";")
        )
    }
}

/// Consumer of measurement records.
pub trait MeasurementSink {
    fn write_detail(&mut self, row: &DetailRow) -> io::Result<()>;
    fn write_result(&mut self, row: &ResultRow) -> io::Result<()>;
    fn write_mc_summary(&mut self, row: &McSummaryRow) -> io::Result<()>;
    fn write_power(&mut self, row: &PowerRow) -> io::Result<()>;
}

/// CSV files under one output directory: a detail and a result file per
/// channel and for the combined figure, plus summary and power files.
pub struct CsvReportWriter {
    out_dir: PathBuf,
    files: HashMap<String, BufWriter<File>>,
}

impl CsvReportWriter {
    pub fn new<P: AsRef<Path>>(out_dir: P) -> io::Result<Self> {
        fs::create_dir_all(out_dir.as_ref())?;
        Ok(CsvReportWriter {
            out_dir: out_dir.as_ref().to_path_buf(),
            files: HashMap::new(),
        })
    }

    fn write_line(&mut self, name: &str, header: &str, line: &str) -> io::Result<()> {
        if !self.files.contains_key(name) {
            let path = self.out_dir.join(name);
            let file = OpenOptions::new().create(true).write(true).truncate(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            writeln!(writer, "{}", header)?;
            self.files.insert(name.to_string(), writer);
        }
        if let Some(writer) = self.files.get_mut(name) {
            writeln!(writer, "{}", line)?;
            writer.flush()?;
        }
        Ok(())
    }
}

impl MeasurementSink for CsvReportWriter {
    fn write_detail(&mut self, row: &DetailRow) -> io::Result<()> {
        let name = match row.channel {
            Some(ch) => format!("chan_{}_detail.csv", ch),
            None => "combined_detail.csv".to_string(),
        };
        self.write_line(&name, DetailRow::HEADER, &row.to_csv())
    }

    fn write_result(&mut self, row: &ResultRow) -> io::Result<()> {
        let name = match row.channel {
            Some(ch) => format!("chan_{}_result.csv", ch),
            None => "combined_result.csv".to_string(),
        };
        self.write_line(&name, ResultRow::HEADER, &row.to_csv())
    }

    fn write_mc_summary(&mut self, row: &McSummaryRow) -> io::Result<()> {
        let channels: Vec<usize> = row.channels.iter().map(|(ch, _, _)| *ch).collect();
        self.write_line("mc_summary.csv", &McSummaryRow::header(&channels), &row.to_csv())
    }

    fn write_power(&mut self, row: &PowerRow) -> io::Result<()> {
        self.write_line("power.csv", PowerRow::HEADER, &row.to_csv())
    }
}

/// Keeps every record in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySink {
    pub details: Vec<DetailRow>,
    pub results: Vec<ResultRow>,
    pub mc_summaries: Vec<McSummaryRow>,
    pub power: Vec<PowerRow>,
}

#[cfg(test)]
impl MeasurementSink for MemorySink {
    fn write_detail(&mut self, row: &DetailRow) -> io::Result<()> {
        self.details.push(row.clone());
        Ok(())
    }

    fn write_result(&mut self, row: &ResultRow) -> io::Result<()> {
        self.results.push(row.clone());
        Ok(())
    }

    fn write_mc_summary(&mut self, row: &McSummaryRow) -> io::Result<()> {
        self.mc_summaries.push(row.clone());
        Ok(())
    }

    fn write_power(&mut self, row: &PowerRow) -> io::Result<()> {
        self.power.push(row.clone());
        Ok(())
    }
}
