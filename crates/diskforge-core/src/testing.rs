//! In-process fakes of the isolation and host-command interfaces.
//!
//! [`FakeIsolation`] runs the contained init inline instead of cloning, and
//! records every signal and sleep it is asked for. [`FakeHost`] emulates
//! the host tools the pipeline shells out to, tracking loop devices,
//! device-mapper entries, and mounts so tests can assert what a teardown
//! left behind. Any command can be made to fail.

#![allow(clippy::expect_used, clippy::missing_panics_doc)]

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use diskforge_common::constants::{DEFAULT_LOG_TAIL_LINES, NAMESPACE_INIT_PID};
use diskforge_common::error::{DiskforgeError, Result};

use crate::command::{CommandRunner, CommandSpec, OutputMode};
use crate::filesystem::loopdev::DeviceProbe;
use crate::log_sink::LogSink;
use crate::namespace::{GroupSignal, Isolation, WaitOutcome};

const FIRST_FAKE_PID: i32 = 4100;

/// Something the contained init asked the fake to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolationEvent {
    /// A signal sent to every process in the namespace.
    Signal(GroupSignal),
    /// A sleep of the given length.
    Sleep(Duration),
}

#[derive(Debug, Default)]
struct IsolationState {
    last_pid: i32,
    events: Vec<IsolationEvent>,
    exits: HashMap<i32, i32>,
    waited: Vec<i32>,
}

/// [`Isolation`] that runs the contained init in the calling process.
#[derive(Debug)]
pub struct FakeIsolation {
    namespace_pid: i32,
    fail_spawn: bool,
    term_finds_processes: bool,
    kill_finds_processes: bool,
    killed_by: Option<String>,
    state: Mutex<IsolationState>,
}

impl Default for FakeIsolation {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIsolation {
    /// A namespace where the init sees PID 1 and no other processes exist.
    #[must_use]
    pub fn new() -> Self {
        Self {
            namespace_pid: NAMESPACE_INIT_PID,
            fail_spawn: false,
            term_finds_processes: false,
            kill_finds_processes: false,
            killed_by: None,
            state: Mutex::new(IsolationState {
                last_pid: FIRST_FAKE_PID - 1,
                ..IsolationState::default()
            }),
        }
    }

    /// A namespace where the init sees itself as `pid`.
    #[must_use]
    pub fn with_namespace_pid(pid: i32) -> Self {
        Self {
            namespace_pid: pid,
            ..Self::new()
        }
    }

    /// A backend whose process creation always fails.
    #[must_use]
    pub fn failing_spawn() -> Self {
        Self {
            fail_spawn: true,
            ..Self::new()
        }
    }

    /// Sets whether SIGTERM and SIGKILL find processes to signal.
    #[must_use]
    pub const fn with_survivors(mut self, after_command: bool, after_grace: bool) -> Self {
        self.term_finds_processes = after_command;
        self.kill_finds_processes = after_grace;
        self
    }

    /// Makes every waited-for process appear killed by `signal`.
    #[must_use]
    pub fn killed_by(mut self, signal: &str) -> Self {
        self.killed_by = Some(signal.to_string());
        self
    }

    fn state(&self) -> MutexGuard<'_, IsolationState> {
        self.state.lock().expect("fake isolation state poisoned")
    }

    /// Signals and sleeps requested so far, in order.
    pub fn events(&self) -> Vec<IsolationEvent> {
        self.state().events.clone()
    }

    /// Signals requested so far, in order.
    pub fn signals(&self) -> Vec<GroupSignal> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                IsolationEvent::Signal(s) => Some(*s),
                IsolationEvent::Sleep(_) => None,
            })
            .collect()
    }

    /// PIDs waited for so far, in order.
    pub fn waited(&self) -> Vec<i32> {
        self.state().waited.clone()
    }

    /// Host PID handed out by the most recent spawn.
    pub fn last_pid(&self) -> i32 {
        self.state().last_pid
    }

    /// Exit status the init of `pid` returned.
    pub fn exit_code(&self, pid: i32) -> Option<i32> {
        self.state().exits.get(&pid).copied()
    }
}

impl Isolation for FakeIsolation {
    fn spawn_isolated(&self, init: &mut dyn FnMut() -> i32) -> Result<i32> {
        if self.fail_spawn {
            return Err(DiskforgeError::Launch {
                message: "clone failed: EPERM".into(),
            });
        }
        let pid = {
            let mut state = self.state();
            state.last_pid += 1;
            state.last_pid
        };
        let code = init();
        let _ = self.state().exits.insert(pid, code);
        Ok(pid)
    }

    fn namespace_pid(&self) -> i32 {
        self.namespace_pid
    }

    fn signal_all(&self, signal: GroupSignal) -> bool {
        self.state().events.push(IsolationEvent::Signal(signal));
        match signal {
            GroupSignal::Terminate => self.term_finds_processes,
            GroupSignal::Kill => self.kill_finds_processes,
        }
    }

    fn sleep(&self, duration: Duration) {
        self.state().events.push(IsolationEvent::Sleep(duration));
    }

    fn wait(&self, host_pid: i32) -> Result<WaitOutcome> {
        let mut state = self.state();
        state.waited.push(host_pid);
        if let Some(signal) = &self.killed_by {
            return Ok(WaitOutcome::Signaled(signal.clone()));
        }
        state
            .exits
            .get(&host_pid)
            .map(|&code| WaitOutcome::Exited(code))
            .ok_or_else(|| DiskforgeError::Launch {
                message: format!("waitpid({host_pid}) failed: ECHILD"),
            })
    }
}

#[derive(Debug, Default)]
struct HostState {
    commands: Vec<String>,
    failures: Vec<String>,
    next_loop: u32,
    loops: BTreeSet<PathBuf>,
    mappings: BTreeSet<PathBuf>,
    mounts: Vec<PathBuf>,
}

/// Emulated host: a [`CommandRunner`] and [`DeviceProbe`] over fake kernel
/// state.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    /// A host with no devices and no mounts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("fake host state poisoned")
    }

    /// Makes every command whose command line contains `pattern` fail.
    pub fn fail_on(&self, pattern: &str) {
        self.state().failures.push(pattern.to_string());
    }

    /// Command lines run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Mountpoints currently mounted, in mount order.
    pub fn mounts(&self) -> Vec<PathBuf> {
        self.state().mounts.clone()
    }

    /// Device-mapper nodes that currently exist.
    pub fn mappings(&self) -> Vec<PathBuf> {
        self.state().mappings.iter().cloned().collect()
    }

    /// Loop devices that are currently attached.
    pub fn loops(&self) -> Vec<PathBuf> {
        self.state().loops.iter().cloned().collect()
    }

    fn emulate(state: &mut HostState, command: &CommandSpec) -> std::result::Result<String, String> {
        let args = command.arguments();
        let flag = |f: &str| args.iter().any(|a| a == f);
        match command.program() {
            "kpartx" if flag("-a") => {
                let n = state.next_loop;
                state.next_loop += 1;
                let _ = state.loops.insert(PathBuf::from(format!("/dev/loop{n}")));
                let _ = state
                    .mappings
                    .insert(PathBuf::from(format!("/dev/mapper/loop{n}p1")));
                Ok(format!("add map loop{n}p1 (253:{n}): 0 202753 linear 7:{n} 2048\n"))
            }
            "kpartx" if flag("-d") => {
                state.mappings.clear();
                state.loops.clear();
                Ok(String::new())
            }
            "dmsetup" => {
                let target = PathBuf::from(args.last().map_or("", String::as_str));
                if state.mappings.remove(&target) {
                    Ok(String::new())
                } else {
                    Err(format!("{}: No such device or address", target.display()))
                }
            }
            "losetup" if flag("-d") => {
                let target = PathBuf::from(args.last().map_or("", String::as_str));
                if state.loops.remove(&target) {
                    Ok(String::new())
                } else {
                    Err(format!("{}: No such device or address", target.display()))
                }
            }
            "mount" => {
                let target = PathBuf::from(args.last().map_or("", String::as_str));
                state.mounts.push(target);
                Ok(String::new())
            }
            "umount" => {
                let target = PathBuf::from(args.last().map_or("", String::as_str));
                match state.mounts.iter().rposition(|m| *m == target) {
                    Some(index) => {
                        let _ = state.mounts.remove(index);
                        Ok(String::new())
                    }
                    None => Err(format!("umount: {}: not mounted", target.display())),
                }
            }
            _ => Ok(String::new()),
        }
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, command: &CommandSpec, log: &LogSink, _mode: OutputMode) -> Result<String> {
        let line = command.to_string();
        log.record(format!("RUNNING COMMAND: \"{line}\""));

        let outcome = {
            let mut state = self.state();
            state.commands.push(line.clone());
            if state.failures.iter().any(|p| line.contains(p.as_str())) {
                Err(format!("injected failure: {line}"))
            } else {
                Self::emulate(&mut state, command)
            }
        };

        outcome.map_err(|message| {
            log.record(message);
            DiskforgeError::CommandFailed {
                command: line,
                code: 1,
                log_tail: log.tail(DEFAULT_LOG_TAIL_LINES),
            }
        })
    }
}

impl DeviceProbe for FakeHost {
    fn mapping_exists(&self, mapping: &Path) -> bool {
        self.state().mappings.contains(mapping)
    }

    fn loop_attached(&self, loop_device: &Path) -> bool {
        self.state().loops.contains(loop_device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_host_tracks_kpartx_attach_and_detach() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = LogSink::open(dir.path().join("fake.log")).expect("log");
        let host = FakeHost::new();

        let out = host
            .run(&CommandSpec::new("kpartx").args(["-a", "-v", "disk.img"]), &log, OutputMode::Captured)
            .expect("attach");
        assert!(out.starts_with("add map loop0p1"));
        assert!(host.mapping_exists(Path::new("/dev/mapper/loop0p1")));
        assert!(host.loop_attached(Path::new("/dev/loop0")));

        let _ = host
            .run(&CommandSpec::new("kpartx").args(["-d", "disk.img"]), &log, OutputMode::Captured)
            .expect("detach");
        assert!(host.mappings().is_empty());
        assert!(host.loops().is_empty());
    }

    #[test]
    fn fake_host_umount_of_unmounted_path_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = LogSink::open(dir.path().join("fake.log")).expect("log");
        let host = FakeHost::new();
        let err = host
            .run(&CommandSpec::new("umount").arg("/mnt"), &log, OutputMode::Captured)
            .unwrap_err();
        assert!(matches!(err, DiskforgeError::CommandFailed { .. }));
    }
}
