//! State files, long-term statistics lines and topology output.
//!
//! Everything here is line-oriented text for operators and their tooling;
//! none of it is machine-parsed by the daemon itself. File writes are
//! best-effort: a full disk costs a report, never the servo.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, SecondsFormat};
use syntond_config::ShmInstanceConfig;
use syntond_filters::OffsetStats;
use syntond_types::{InstanceStatus, WallTime};

use crate::instance::Counters;

fn format_wall(time: WallTime) -> String {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos() as u32)
        .map_or_else(|| time.to_string(), |dt| {
            dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
        })
}

/// Renders the per-instance state summary persisted by `SAVE_STATE`.
pub fn state_file_content(
    status: &InstanceStatus,
    counters: Counters,
    freq_adjust_ppb: f64,
    synchronized: bool,
    now: WallTime,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("instance: {}\n", status.name));
    out.push_str(&format!("timestamp: {}\n", format_wall(now)));
    out.push_str(&format!("state: {}\n", status.state));
    out.push_str(&format!("alarms: {}\n", status.alarms));
    out.push_str(&format!("clock: {}\n", status.clock));
    out.push_str(&format!("in-sync: {synchronized}\n"));
    if status.offset_valid {
        out.push_str(&format!(
            "offset-from-master: {:.3}\n",
            status.offset_from_master_ns
        ));
    } else {
        out.push_str("offset-from-master: n/a\n");
    }
    out.push_str(&format!("freq-adjustment-ppb: {freq_adjust_ppb:.3}\n"));
    out.push_str(&format!("clock-steps: {}\n", counters.clock_steps));
    out.push_str(&format!("seq-num-errors: {}\n", counters.seq_num_errors));
    out.push_str(&format!(
        "bad-signal-errors: {}\n",
        counters.bad_signal_errors
    ));
    out.push_str(&format!("outliers: {}\n", counters.outliers));
    out
}

/// Writes (replaces) the state file for one instance.
pub fn write_state_file(dir: &Path, instance: &str, content: &str) {
    if let Err(error) = fs::create_dir_all(dir)
        .and_then(|()| fs::write(dir.join(format!("state-shm-{instance}")), content))
    {
        tracing::warn!(%instance, %error, "failed to write state file");
    }
}

/// Renders one closed statistics period as a single log line.
pub fn stats_line(
    instance: &str,
    period_end: WallTime,
    stats: &OffsetStats,
    counters: Counters,
) -> String {
    format!(
        "{} instance={} samples={} mean={:.3} min={:.3} max={:.3} std-dev={:.3} \
         steps={} seq-errors={} bad-signal={} outliers={}\n",
        format_wall(period_end),
        instance,
        stats.count(),
        stats.mean(),
        stats.min(),
        stats.max(),
        stats.std_dev(),
        counters.clock_steps,
        counters.seq_num_errors,
        counters.bad_signal_errors,
        counters.outliers,
    )
}

/// Appends one period line to the instance's statistics file.
pub fn append_stats_line(dir: &Path, instance: &str, line: &str) {
    let write = || -> std::io::Result<()> {
        fs::create_dir_all(dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("stats-shm-{instance}")))?;
        file.write_all(line.as_bytes())
    };
    if let Err(error) = write() {
        tracing::warn!(%instance, %error, "failed to append statistics line");
    }
}

/// Renders the topology fragment for one instance.
pub fn topology_fragment(status: &InstanceStatus, config: &ShmInstanceConfig) -> String {
    let mut out = String::new();
    out.push_str("==========================================\n");
    out.push_str(&format!("instance: {}\n", status.name));
    out.push_str(&format!("interface: {}\n", config.interface));
    out.push_str(&format!("clock: {}\n", status.clock));
    out.push_str(&format!("state: {}\n", status.state));
    out.push_str(&format!("alarms: {}\n", status.alarms));
    out.push_str(&format!("priority: {}\n", status.user_priority));
    out.push_str(&format!(
        "master: class={} source={} accuracy={}\n",
        status.master.clock_class, status.master.time_source, status.master.accuracy
    ));
    out.push_str(&format!(
        "traceability: time={} freq={}\n",
        status.master.traceable_time, status.master.traceable_freq
    ));
    out.push_str(&format!("steps-removed: {}\n", status.master.steps_removed));
    if status.offset_valid {
        out.push_str(&format!(
            "offset-from-master: {:.3}ns\n",
            status.offset_from_master_ns
        ));
    }
    out.push_str("==========================================\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use syntond_types::{Accuracy, AlarmSet, MasterInfo, SyncState};
    use tempfile::tempdir;

    fn status() -> InstanceStatus {
        InstanceStatus {
            name: "gps1".to_string(),
            state: SyncState::Slave,
            alarms: AlarmSet::empty(),
            clock: "phc:eth0".to_string(),
            local_accuracy: Accuracy::Nanoseconds(50.0),
            master: MasterInfo::default(),
            offset_from_master_ns: -42.5,
            offset_valid: true,
            clustering_score: 0.0,
            user_priority: 10,
        }
    }

    #[test]
    fn state_file_lists_core_fields() {
        let content = state_file_content(
            &status(),
            Counters {
                clock_steps: 2,
                ..Counters::default()
            },
            15.25,
            true,
            WallTime::new(1_700_000_000_000_000_000),
        );
        assert!(content.contains("instance: gps1\n"));
        assert!(content.contains("state: slave\n"));
        assert!(content.contains("offset-from-master: -42.500\n"));
        assert!(content.contains("freq-adjustment-ppb: 15.250\n"));
        assert!(content.contains("clock-steps: 2\n"));
        assert!(content.contains("in-sync: true\n"));
    }

    #[test]
    fn invalid_offset_renders_as_na() {
        let mut st = status();
        st.state = SyncState::Listening;
        st.offset_valid = false;
        let content =
            state_file_content(&st, Counters::default(), 0.0, false, WallTime::new(0));
        assert!(content.contains("offset-from-master: n/a\n"));
    }

    #[test]
    fn state_file_round_trips_to_disk() {
        let dir = tempdir().expect("tempdir");
        write_state_file(dir.path(), "gps1", "state: slave\n");
        let read = fs::read_to_string(dir.path().join("state-shm-gps1")).expect("read");
        assert_eq!(read, "state: slave\n");
    }

    #[test]
    fn stats_lines_accumulate() {
        let dir = tempdir().expect("tempdir");
        let mut stats = OffsetStats::new();
        stats.record(10.0);
        stats.record(20.0);

        let line = stats_line("gps1", WallTime::new(0), &stats, Counters::default());
        append_stats_line(dir.path(), "gps1", &line);
        append_stats_line(dir.path(), "gps1", &line);

        let read = fs::read_to_string(dir.path().join("stats-shm-gps1")).expect("read");
        assert_eq!(read.lines().count(), 2);
        assert!(read.contains("samples=2"));
        assert!(read.contains("mean=15.000"));
    }

    #[test]
    fn topology_fragment_shows_master_metadata() {
        let frag = topology_fragment(&status(), &ShmInstanceConfig::for_interface("eth0"));
        assert!(frag.contains("instance: gps1\n"));
        assert!(frag.contains("interface: eth0\n"));
        assert!(frag.contains("master: class=freerunning source=oscillator accuracy=unknown\n"));
        assert!(frag.contains("offset-from-master: -42.500ns\n"));
    }
}
