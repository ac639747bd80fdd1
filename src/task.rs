//! Runs build commands, potentially in parallel.
//! Unaware of the build graph, pools, etc.; just command execution.
//!
//! Each command runs on its own thread, which blocks on the subprocess and
//! reports the result over a channel.  The builder's single control thread
//! blocks in wait_for_command to reap whichever finishes first.

use crate::graph::EdgeId;
use crate::process::{self, Pid, Termination};
use crate::signal;
use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Instant;

/// The result of executing one edge's command.
pub struct FinishedCommand {
    pub edge: EdgeId,
    pub span: (Instant, Instant),
    pub termination: Termination,
    /// Combined stdout/stderr, as opaque bytes.
    pub output: Vec<u8>,
}

impl FinishedCommand {
    pub fn success(&self) -> bool {
        self.termination == Termination::Success
    }
}

/// Dispatches edge commands to subprocesses and reaps them.
pub trait CommandRunner {
    fn can_run_more(&self) -> bool;
    fn start_command(&mut self, edge: EdgeId, cmdline: String, use_console: bool);
    /// Block until some started command finishes.  Must only be called when
    /// at least one command is running.
    fn wait_for_command(&mut self) -> FinishedCommand;
    fn get_active_edges(&self) -> Vec<EdgeId>;
    /// Interrupt all running children and drain them.
    fn abort(&mut self);
}

/// Runner for `-n`: pretends every command succeeds without side effects.
#[derive(Default)]
pub struct DryRunCommandRunner {
    finished: VecDeque<EdgeId>,
}

impl DryRunCommandRunner {
    pub fn new() -> Self {
        DryRunCommandRunner::default()
    }
}

impl CommandRunner for DryRunCommandRunner {
    fn can_run_more(&self) -> bool {
        true
    }

    fn start_command(&mut self, edge: EdgeId, _cmdline: String, _use_console: bool) {
        self.finished.push_back(edge);
    }

    fn wait_for_command(&mut self) -> FinishedCommand {
        let edge = self.finished.pop_front().expect("nothing started");
        let now = Instant::now();
        FinishedCommand {
            edge,
            span: (now, now),
            termination: Termination::Success,
            output: Vec::new(),
        }
    }

    fn get_active_edges(&self) -> Vec<EdgeId> {
        self.finished.iter().copied().collect()
    }

    fn abort(&mut self) {
        self.finished.clear();
    }
}

#[cfg(unix)]
fn load_average() -> f64 {
    let mut avg: [f64; 3] = [0.0; 3];
    let rc = unsafe { libc::getloadavg(avg.as_mut_ptr(), 3) };
    if rc < 1 {
        -0.0
    } else {
        avg[0]
    }
}

#[cfg(not(unix))]
fn load_average() -> f64 {
    // No load-average gating on this platform.
    -0.0
}

struct Reaped {
    token: usize,
    edge: EdgeId,
    span: (Instant, Instant),
    termination: Termination,
    output: Vec<u8>,
}

/// Real subprocess fan-out.
pub struct RealCommandRunner {
    finished_send: mpsc::Sender<Reaped>,
    finished_recv: mpsc::Receiver<Reaped>,
    /// Commands currently running, keyed by token.
    running: HashMap<usize, EdgeId>,
    /// Child pids, shared with the waiter threads so abort can signal them.
    pids: Arc<Mutex<HashMap<usize, Pid>>>,
    next_token: usize,
    parallelism: usize,
    max_load_average: f64,
}

impl RealCommandRunner {
    pub fn new(parallelism: usize, max_load_average: f64) -> Self {
        let (tx, rx) = mpsc::channel();
        RealCommandRunner {
            finished_send: tx,
            finished_recv: rx,
            running: HashMap::new(),
            pids: Default::default(),
            next_token: 0,
            parallelism,
            max_load_average,
        }
    }
}

impl CommandRunner for RealCommandRunner {
    fn can_run_more(&self) -> bool {
        if self.running.len() >= self.parallelism {
            return false;
        }
        // The load cap never blocks the first command, to guarantee forward
        // progress.
        if self.max_load_average > 0.0
            && !self.running.is_empty()
            && load_average() >= self.max_load_average
        {
            return false;
        }
        true
    }

    fn start_command(&mut self, edge: EdgeId, cmdline: String, use_console: bool) {
        let token = self.next_token;
        self.next_token += 1;
        self.running.insert(token, edge);

        let tx = self.finished_send.clone();
        let pids = self.pids.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = process::run_command(&cmdline, use_console, |pid| {
                pids.lock().unwrap().insert(token, pid);
            });
            pids.lock().unwrap().remove(&token);
            let (termination, output) = result.unwrap_or_else(|err| {
                (Termination::Failure, err.to_string().into_bytes())
            });
            let reaped = Reaped {
                token,
                edge,
                span: (start, Instant::now()),
                termination,
                output,
            };
            // The send only fails if the receiver is shutting down.
            let _ = tx.send(reaped);
        });
    }

    fn wait_for_command(&mut self) -> FinishedCommand {
        let reaped = self.finished_recv.recv().expect("runner channel closed");
        self.running.remove(&reaped.token);
        let termination = if signal::was_interrupted() {
            Termination::Interrupted
        } else {
            reaped.termination
        };
        FinishedCommand {
            edge: reaped.edge,
            span: reaped.span,
            termination,
            output: reaped.output,
        }
    }

    fn get_active_edges(&self) -> Vec<EdgeId> {
        self.running.values().copied().collect()
    }

    fn abort(&mut self) {
        {
            let pids = self.pids.lock().unwrap();
            for &pid in pids.values() {
                process::interrupt_child(pid);
            }
        }
        while !self.running.is_empty() {
            let reaped = self.finished_recv.recv().expect("runner channel closed");
            self.running.remove(&reaped.token);
        }
    }
}
