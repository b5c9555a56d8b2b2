//! Worker exit events and their classification.

use std::process::ExitStatus;
use std::time::Duration;

use crate::bridge::protocol::WorkerId;

/// Notification that one worker process has terminated.
///
/// Per Unix semantics only one of `exit_code` / `signal` is meaningful: a
/// signal-killed process has no exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitEvent {
    pub worker: WorkerId,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    /// Time between spawn and observed exit.
    pub uptime: Duration,
    /// Last reason the worker announced over its control channel, if any.
    pub reason: Option<String>,
}

/// Mutually exclusive exit classifications. They drive log messages only;
/// every class is healed the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    CleanExit,
    ErrorExit,
    Signaled,
}

impl ExitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitClass::CleanExit => "clean_exit",
            ExitClass::ErrorExit => "error_exit",
            ExitClass::Signaled => "signaled",
        }
    }
}

impl std::fmt::Display for ExitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ExitEvent {
    pub fn from_status(
        worker: WorkerId,
        pid: Option<u32>,
        status: &ExitStatus,
        uptime: Duration,
        reason: Option<String>,
    ) -> Self {
        Self {
            worker,
            pid,
            exit_code: status.code(),
            signal: signal_name(status),
            uptime,
            reason,
        }
    }

    /// Exit whose status could not be collected.
    pub fn unknown(
        worker: WorkerId,
        pid: Option<u32>,
        uptime: Duration,
        reason: Option<String>,
    ) -> Self {
        Self {
            worker,
            pid,
            exit_code: None,
            signal: None,
            uptime,
            reason,
        }
    }

    /// A signal wins over any code; otherwise only an explicit zero is clean.
    pub fn classify(&self) -> ExitClass {
        if self.signal.is_some() {
            ExitClass::Signaled
        } else if self.exit_code != Some(0) {
            ExitClass::ErrorExit
        } else {
            ExitClass::CleanExit
        }
    }

    /// Log line describing this exit, matching its classification.
    pub fn describe(&self) -> String {
        let pid = self
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| self.worker.to_string());
        match self.classify() {
            ExitClass::Signaled => format!(
                "worker {pid} killed by signal: {}",
                self.signal.as_deref().unwrap_or("unknown")
            ),
            ExitClass::ErrorExit => match self.exit_code {
                Some(code) => format!("worker {pid} exited with error code: {code}"),
                None => format!("worker {pid} exited with error code: unknown"),
            },
            ExitClass::CleanExit => format!("worker {pid} died"),
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;

    let raw = status.signal()?;
    Some(match nix::sys::signal::Signal::try_from(raw) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("SIG{raw}"),
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(exit_code: Option<i32>, signal: Option<&str>) -> ExitEvent {
        ExitEvent {
            worker: WorkerId::new(1),
            pid: Some(100),
            exit_code,
            signal: signal.map(str::to_string),
            uptime: Duration::from_secs(3),
            reason: None,
        }
    }

    #[test]
    fn zero_without_signal_is_clean() {
        let e = event(Some(0), None);
        assert_eq!(e.classify(), ExitClass::CleanExit);
        assert_eq!(e.describe(), "worker 100 died");
    }

    #[test]
    fn nonzero_without_signal_is_error() {
        let e = event(Some(1), None);
        assert_eq!(e.classify(), ExitClass::ErrorExit);
        assert_eq!(e.describe(), "worker 100 exited with error code: 1");
    }

    #[test]
    fn signal_wins_over_code() {
        for code in [None, Some(0), Some(137)] {
            let e = event(code, Some("SIGKILL"));
            assert_eq!(e.classify(), ExitClass::Signaled);
            assert_eq!(e.describe(), "worker 100 killed by signal: SIGKILL");
        }
    }

    #[test]
    fn uncollected_status_counts_as_error() {
        let e = ExitEvent::unknown(WorkerId::new(4), None, Duration::ZERO, None);
        assert_eq!(e.classify(), ExitClass::ErrorExit);
        assert_eq!(e.describe(), "worker w4 exited with error code: unknown");
    }

    #[cfg(unix)]
    #[test]
    fn from_raw_wait_status() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait(2) encoding: exit code in the second byte, signal in the low bits.
        let exited = ExitStatus::from_raw(3 << 8);
        let e = ExitEvent::from_status(WorkerId::new(1), Some(9), &exited, Duration::ZERO, None);
        assert_eq!(e.exit_code, Some(3));
        assert_eq!(e.signal, None);
        assert_eq!(e.classify(), ExitClass::ErrorExit);

        let killed = ExitStatus::from_raw(9);
        let e = ExitEvent::from_status(WorkerId::new(1), Some(9), &killed, Duration::ZERO, None);
        assert_eq!(e.exit_code, None);
        assert_eq!(e.signal.as_deref(), Some("SIGKILL"));
        assert_eq!(e.classify(), ExitClass::Signaled);

        let clean = ExitStatus::from_raw(0);
        let e = ExitEvent::from_status(WorkerId::new(1), Some(9), &clean, Duration::ZERO, None);
        assert_eq!(e.classify(), ExitClass::CleanExit);
    }
}
