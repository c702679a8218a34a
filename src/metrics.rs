//! Per-run frame time recording
//!
//! Frame times are collected in memory and written once, at shutdown, to
//! `metrics_<timestamp>_<user>@<host>.csv`.

use crate::error::CrateResult;
use chrono::{DateTime, Local};
use std::{
    fmt::Write as _,
    fs,
    path::{Path, PathBuf},
};
use tracing::{info, warn};

/// Deltas at or below this (in seconds) are not real frames
const MIN_FRAME_TIME: f32 = 1e-6;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Who and where the program runs, for labelling metrics files
pub trait EnvironmentInfo {
    fn username(&self) -> String;
    fn hostname(&self) -> String;
}

/// Reads user and host from the process environment
#[derive(Copy, Clone, Debug, Default)]
pub struct SystemEnvironment;

impl EnvironmentInfo for SystemEnvironment {
    fn username(&self) -> String {
        first_var(&["USER", "USERNAME", "LOGNAME"], env_var)
            .unwrap_or_else(|| "unknown_user".to_string())
    }

    fn hostname(&self) -> String {
        resolve_hostname(env_var, || gethostname::gethostname().into_string().ok())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn first_var(keys: &[&str], var: impl Fn(&str) -> Option<String>) -> Option<String> {
    keys.iter()
        .filter_map(|key| var(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

/// An exported `HOSTNAME`/`COMPUTERNAME` wins, then the name the OS reports
fn resolve_hostname(
    var: impl Fn(&str) -> Option<String>,
    system: impl FnOnce() -> Option<String>,
) -> String {
    first_var(&["HOSTNAME", "COMPUTERNAME"], var)
        .or_else(|| {
            system()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
        })
        .unwrap_or_else(|| "unknown_pc".to_string())
}

/// Values written into the file header besides the frame data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsHeader {
    pub version: String,
    pub gpu_name: String,
    pub requested_particles: usize,
    pub actual_particles: usize,
}

pub struct FrameMetrics {
    run_started: DateTime<Local>,
    frame_times_ms: Vec<f32>,
    saved: bool,
}

impl Default for FrameMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameMetrics {
    pub fn new() -> Self {
        Self::started_at(Local::now())
    }

    /// Restart the run clock and drop anything recorded so far.
    /// Called when the render loop starts, after setup.
    pub fn start_run(&mut self) {
        *self = Self::new();
    }

    pub fn run_started(&self) -> DateTime<Local> {
        self.run_started
    }

    pub fn started_at(run_started: DateTime<Local>) -> Self {
        Self {
            run_started,
            frame_times_ms: Vec::with_capacity(3600),
            saved: false,
        }
    }

    /// Record one frame delta, in seconds
    pub fn record(&mut self, dt: f32) {
        if dt > MIN_FRAME_TIME {
            self.frame_times_ms.push(dt * 1000.0);
        }
    }

    pub fn frame_times_ms(&self) -> &[f32] {
        &self.frame_times_ms
    }

    pub fn is_saved(&self) -> bool {
        self.saved
    }

    pub fn file_name(&self, env: &dyn EnvironmentInfo) -> String {
        format!(
            "metrics_{}_{}@{}.csv",
            self.run_started.format(TIMESTAMP_FORMAT),
            env.username(),
            env.hostname()
        )
    }

    /// The full file contents
    pub fn render(&self, header: &MetricsHeader, env: &dyn EnvironmentInfo) -> String {
        let mut out = String::with_capacity(256 + self.frame_times_ms.len() * 10);
        // Writing into a String cannot fail.
        let _ = write!(
            out,
            "# METRICS DATA\n\
             # Run Start Timestamp: {}\n\
             # Program Version: {}\n\
             # User: {}\n\
             # Hostname: {}\n\
             # GPU: {}\n\
             # Requested Particle Count: {}\n\
             # Actual Particle Count: {}\n\
             # Frame Count Recorded: {}\n\
             \n\
             FrameTime_ms\n",
            self.run_started.format(TIMESTAMP_FORMAT),
            header.version,
            env.username(),
            env.hostname(),
            header.gpu_name,
            header.requested_particles,
            header.actual_particles,
            self.frame_times_ms.len(),
        );
        for ms in &self.frame_times_ms {
            let _ = writeln!(out, "{ms:.4}");
        }
        out
    }

    /// Write the metrics file into `dir`, falling back to `fallback` when
    /// `dir` cannot be created.
    ///
    /// Returns `Ok(None)` without writing if nothing was recorded or the file
    /// was already written.
    pub fn save_in(
        &mut self,
        dir: &Path,
        fallback: &Path,
        header: &MetricsHeader,
        env: &dyn EnvironmentInfo,
    ) -> CrateResult<Option<PathBuf>> {
        if self.saved || self.frame_times_ms.is_empty() {
            info!(
                saved = self.saved,
                frames = self.frame_times_ms.len(),
                "nothing to write to the metrics file"
            );
            return Ok(None);
        }

        let target_dir = match fs::create_dir_all(dir) {
            Ok(()) => dir,
            Err(err) => {
                warn!(
                    "could not create {}: {err}, writing metrics to {}",
                    dir.display(),
                    fallback.display()
                );
                fallback
            }
        };
        let path = target_dir.join(self.file_name(env));
        fs::write(&path, self.render(header, env))?;
        self.saved = true;
        info!(
            frames = self.frame_times_ms.len(),
            "saved metrics to {}",
            path.display()
        );
        Ok(Some(path))
    }

    /// [`save_in`](Self::save_in) with the working directory as fallback
    pub fn save(
        &mut self,
        dir: &Path,
        header: &MetricsHeader,
        env: &dyn EnvironmentInfo,
    ) -> CrateResult<Option<PathBuf>> {
        self.save_in(dir, Path::new("."), header, env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedEnv;

    impl EnvironmentInfo for FixedEnv {
        fn username(&self) -> String {
            "ada".to_string()
        }
        fn hostname(&self) -> String {
            "lab".to_string()
        }
    }

    fn header() -> MetricsHeader {
        MetricsHeader {
            version: "test".to_string(),
            gpu_name: "Headless".to_string(),
            requested_particles: 10,
            actual_particles: 9,
        }
    }

    fn metrics() -> FrameMetrics {
        let start = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        FrameMetrics::started_at(start)
    }

    #[test]
    fn tiny_deltas_are_not_recorded() {
        let mut m = metrics();
        m.record(0.0);
        m.record(1e-7);
        m.record(0.016);
        assert_eq!(m.frame_times_ms().len(), 1);
        assert!((m.frame_times_ms()[0] - 16.0).abs() < 1e-3);
    }

    #[test]
    fn file_name_and_contents() {
        let mut m = metrics();
        m.record(0.0165);
        m.record(0.1);
        assert_eq!(m.file_name(&FixedEnv), "metrics_20240305_070809_ada@lab.csv");

        let text = m.render(&header(), &FixedEnv);
        let expected = "# METRICS DATA\n\
                        # Run Start Timestamp: 20240305_070809\n\
                        # Program Version: test\n\
                        # User: ada\n\
                        # Hostname: lab\n\
                        # GPU: Headless\n\
                        # Requested Particle Count: 10\n\
                        # Actual Particle Count: 9\n\
                        # Frame Count Recorded: 2\n\
                        \n\
                        FrameTime_ms\n\
                        16.5000\n\
                        100.0000\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn saves_once_into_the_metrics_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("metrics_output");
        let mut m = metrics();
        m.record(0.02);

        let path = m.save(&dir, &header(), &FixedEnv).unwrap().unwrap();
        assert_eq!(path, dir.join("metrics_20240305_070809_ada@lab.csv"));
        assert!(fs::read_to_string(&path).unwrap().ends_with("20.0000\n"));
        assert!(m.is_saved());
        assert_eq!(m.save(&dir, &header(), &FixedEnv).unwrap(), None);
    }

    #[test]
    fn falls_back_when_dir_cannot_be_created() {
        let tmp = tempfile::tempdir().unwrap();
        // A regular file where the directory should go.
        let blocker = tmp.path().join("metrics_output");
        fs::write(&blocker, b"").unwrap();
        let mut m = metrics();
        m.record(0.02);

        let path = m
            .save_in(&blocker, tmp.path(), &header(), &FixedEnv)
            .unwrap()
            .unwrap();
        assert_eq!(path.parent(), Some(tmp.path()));
        assert!(path.exists());
    }

    #[test]
    fn starting_the_run_resets_the_clock() {
        let mut m = metrics();
        m.record(0.5);
        let before = Local::now();
        m.start_run();
        assert!(m.run_started() >= before);
        assert!(m.frame_times_ms().is_empty());
        assert!(!m.is_saved());
    }

    #[test]
    fn hostname_falls_back_to_the_system_name() {
        let none = |_: &str| None;
        assert_eq!(resolve_hostname(none, || Some("studio.local\n".to_string())), "studio.local");
        assert_eq!(resolve_hostname(none, || Some(String::new())), "unknown_pc");
        assert_eq!(resolve_hostname(none, || None), "unknown_pc");
    }

    #[test]
    fn exported_hostname_wins() {
        let vars = |key: &str| (key == "COMPUTERNAME").then(|| "DESKTOP-1".to_string());
        assert_eq!(resolve_hostname(vars, || Some("other".to_string())), "DESKTOP-1");
    }

    #[test]
    fn system_environment_always_names_the_host() {
        assert!(!SystemEnvironment.hostname().is_empty());
    }

    #[test]
    fn nothing_recorded_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut m = metrics();
        assert_eq!(m.save(tmp.path(), &header(), &FixedEnv).unwrap(), None);
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
