//! Best-effort run statistics: engine summary counters and output volume.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::model::RunStats;

/// Only the end of the log carries the job summary.
const LOG_TAIL_BYTES: u64 = 256 * 1024;

const READ_KEYS: &[&str] = &["读出记录总数", "Total records read"];
const FAILED_KEYS: &[&str] = &["读写失败总数", "Total records failed"];

/// Counters from the engine's end-of-job summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineSummary {
    pub records_read: Option<u64>,
    pub records_failed: Option<u64>,
}

/// Scan log text for summary lines of the form `<key>   :   <number>`.
/// When a key appears more than once, the last value wins.
pub fn parse_engine_summary(log: &str) -> EngineSummary {
    let mut summary = EngineSummary::default();
    for line in log.lines() {
        if let Some(n) = value_for(line, READ_KEYS) {
            summary.records_read = Some(n);
        } else if let Some(n) = value_for(line, FAILED_KEYS) {
            summary.records_failed = Some(n);
        }
    }
    summary
}

fn value_for(line: &str, keys: &[&str]) -> Option<u64> {
    let key = keys.iter().find(|k| line.contains(*k))?;
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let rest = rest.strip_prefix(':').or_else(|| rest.strip_prefix('：'))?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

impl EngineSummary {
    pub fn into_stats(self, data_size_bytes: u64) -> RunStats {
        let total = self.records_read.unwrap_or(0);
        let failed = self.records_failed.unwrap_or(0);
        RunStats {
            records_total: total,
            records_processed: total,
            records_success: total.saturating_sub(failed),
            records_failed: failed,
            data_size_bytes,
        }
    }
}

/// Total size of regular files under `dir`. Missing directory counts as 0.
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn read_tail(path: &Path, max: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len > max {
        file.seek(SeekFrom::Start(len - max))?;
    }
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Gather stats for a finished run. Never fails; unreadable inputs give zeros.
pub async fn collect(log_path: PathBuf, output_dir: PathBuf) -> RunStats {
    let result = tokio::task::spawn_blocking(move || {
        let summary = match read_tail(&log_path, LOG_TAIL_BYTES) {
            Ok(text) => parse_engine_summary(&text),
            Err(e) => {
                debug!(path = %log_path.display(), error = %e, "execution log unreadable");
                EngineSummary::default()
            }
        };
        summary.into_stats(directory_size(&output_dir))
    })
    .await;

    result.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUMMARY: &str = "\
2024-05-01 10:00:00.000 [job-0] INFO  JobContainer - PerfTrace not enable!
任务启动时刻                    : 2024-05-01 10:00:00
任务结束时刻                    : 2024-05-01 10:00:11
任务总计耗时                    :                 11s
读出记录总数                    :                 100
读写失败总数                    :                   4
";

    #[test]
    fn parses_engine_summary() {
        let summary = parse_engine_summary(SUMMARY);
        assert_eq!(summary.records_read, Some(100));
        assert_eq!(summary.records_failed, Some(4));

        let stats = summary.into_stats(2048);
        assert_eq!(stats.records_total, 100);
        assert_eq!(stats.records_success, 96);
        assert_eq!(stats.records_failed, 4);
        assert_eq!(stats.data_size_bytes, 2048);
    }

    #[test]
    fn english_keys_and_last_value_wins() {
        let log = "Total records read : 7\nTotal records read : 12\nTotal records failed: 0\n";
        let summary = parse_engine_summary(log);
        assert_eq!(summary.records_read, Some(12));
        assert_eq!(summary.records_failed, Some(0));
    }

    #[test]
    fn missing_summary_gives_zeros() {
        let stats = parse_engine_summary("nothing useful\n").into_stats(0);
        assert_eq!(stats, RunStats::default());
    }

    #[test]
    fn directory_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), vec![0u8; 10]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), vec![0u8; 32]).unwrap();

        assert_eq!(directory_size(dir.path()), 42);
        assert_eq!(directory_size(&dir.path().join("missing")), 0);
    }

    #[tokio::test]
    async fn collect_reads_log_and_output() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("exec.log");
        std::fs::write(&log, SUMMARY).unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("part-0"), b"hello").unwrap();

        let stats = collect(log, out).await;
        assert_eq!(stats.records_total, 100);
        assert_eq!(stats.data_size_bytes, 5);
    }
}
