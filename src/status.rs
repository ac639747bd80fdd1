//! Build progress display: the status line, command output passthrough, and
//! the FAILED banner.
//!
//! The status line format comes from $NINJA_STATUS (default "[%f/%t] "),
//! with printf-style placeholders for edge counts and rates.

use crate::graph::{EdgeId, State};
use crate::task::FinishedCommand;
use crate::terminal;
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::time::Instant;

const DEFAULT_FORMAT: &str = "[%f/%t] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStatus {
    Started,
    Finished,
}

enum FormatPart {
    Literal(String),
    Placeholder(char),
}

/// Parse a $NINJA_STATUS-style format string; unknown placeholders are an
/// error so typos don't silently drop fields.
fn parse_format(format: &str) -> anyhow::Result<Vec<FormatPart>> {
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some(p @ ('s' | 't' | 'r' | 'u' | 'f' | 'o' | 'c' | 'p' | 'e')) => {
                if !literal.is_empty() {
                    parts.push(FormatPart::Literal(std::mem::take(&mut literal)));
                }
                parts.push(FormatPart::Placeholder(p));
            }
            other => anyhow::bail!(
                "unknown placeholder '%{}' in $NINJA_STATUS",
                other.map(String::from).unwrap_or_default()
            ),
        }
    }
    if !literal.is_empty() {
        parts.push(FormatPart::Literal(literal));
    }
    Ok(parts)
}

/// Overall finished-edges-per-second rate.
struct RateInfo {
    rate: f64,
    start: Instant,
    last_update: usize,
}

impl RateInfo {
    fn new() -> Self {
        RateInfo {
            rate: -1.0,
            start: Instant::now(),
            last_update: 0,
        }
    }

    fn restart(&mut self) {
        self.start = Instant::now();
    }

    fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn update(&mut self, edges: usize) {
        if edges == self.last_update {
            return;
        }
        self.last_update = edges;
        let elapsed = self.elapsed();
        if elapsed > 0.0 {
            self.rate = edges as f64 / elapsed;
        }
    }
}

/// Rate over a sliding window of the last `capacity` finished edges, where
/// capacity tracks -j so the number reflects current throughput.
struct SlidingRateInfo {
    rate: f64,
    capacity: usize,
    times: VecDeque<f64>,
    start: Instant,
    last_update: usize,
}

impl SlidingRateInfo {
    fn new(capacity: usize) -> Self {
        SlidingRateInfo {
            rate: -1.0,
            capacity: capacity.max(1),
            times: VecDeque::new(),
            start: Instant::now(),
            last_update: 0,
        }
    }

    fn restart(&mut self) {
        self.start = Instant::now();
    }

    fn update(&mut self, update_hint: usize) {
        if update_hint == self.last_update {
            return;
        }
        self.last_update = update_hint;
        if self.times.len() == self.capacity {
            self.times.pop_front();
        }
        self.times.push_back(self.start.elapsed().as_secs_f64());
        if let (Some(&front), Some(&back)) = (self.times.front(), self.times.back()) {
            if back != front {
                self.rate = self.times.len() as f64 / (back - front);
            }
        }
    }
}

fn format_rate(rate: f64) -> String {
    if rate < 0.0 {
        "?".to_owned()
    } else {
        format!("{:.1}", rate)
    }
}

/// Truncate a string to fit a width, eliding the middle.  Descriptions come
/// from the manifest and can be arbitrary UTF-8, so count and split by
/// character rather than byte.
fn elide_middle(text: &str, width: usize) -> String {
    const MARGIN: usize = 3; // Space for "...".
    let len = text.chars().count();
    if len <= width {
        return text.to_owned();
    }
    if width <= MARGIN {
        return text.chars().take(width).collect();
    }
    let elide_size = (width - MARGIN) / 2;
    let tail_size = elide_size + (width - MARGIN) % 2;
    let head: String = text.chars().take(elide_size).collect();
    let tail: String = text.chars().skip(len - tail_size).collect();
    format!("{}...{}", head, tail)
}

/// Low-level console output: overprints the status line on smart terminals,
/// and buffers lines while a console-pool edge owns the terminal.
struct LinePrinter {
    smart_terminal: bool,
    /// Whether the last print ended with a newline.
    have_blank_line: bool,
    console_locked: bool,
    buffered: Vec<String>,
}

impl LinePrinter {
    fn new(smart_terminal: bool) -> Self {
        LinePrinter {
            smart_terminal,
            have_blank_line: true,
            console_locked: false,
            buffered: Vec::new(),
        }
    }

    /// Overprintable status output.
    fn print(&mut self, text: &str) {
        if self.console_locked {
            self.buffered.push(format!("{}\n", text));
            return;
        }
        if self.smart_terminal {
            let width = terminal::get_cols().unwrap_or(80);
            print!("\r\x1b[K{}", elide_middle(text, width));
            std::io::stdout().flush().unwrap();
            self.have_blank_line = false;
        } else {
            println!("{}", text);
        }
    }

    /// Permanent output, pushed below any status line.
    fn print_on_new_line(&mut self, text: &str) {
        if self.console_locked {
            self.buffered.push(text.to_owned());
            return;
        }
        if !self.have_blank_line {
            print!("\r\x1b[K");
        }
        print!("{}", text);
        if !text.ends_with('\n') {
            println!();
        }
        std::io::stdout().flush().unwrap();
        self.have_blank_line = true;
    }

    fn set_console_locked(&mut self, locked: bool) {
        if locked == self.console_locked {
            return;
        }
        if locked && !self.have_blank_line {
            // Leave the status line behind before handing over the terminal.
            println!();
            self.have_blank_line = true;
        }
        self.console_locked = locked;
        if !locked {
            for line in std::mem::take(&mut self.buffered) {
                self.print_on_new_line(&line);
            }
        }
    }
}

pub struct StatusPrinter {
    verbose: bool,
    format: Vec<FormatPart>,
    printer: LinePrinter,
    started_edges: usize,
    finished_edges: usize,
    total_edges: usize,
    start_time: Instant,
    /// Edge -> start time in ms since the status was created, which is also
    /// what gets recorded in the build log.
    running_edges: HashMap<EdgeId, i32>,
    overall_rate: RateInfo,
    current_rate: SlidingRateInfo,
}

impl StatusPrinter {
    pub fn new(verbose: bool, parallelism: usize) -> Self {
        let format_str =
            std::env::var("NINJA_STATUS").unwrap_or_else(|_| DEFAULT_FORMAT.to_owned());
        let format = match parse_format(&format_str) {
            Ok(format) => format,
            Err(err) => {
                eprintln!("majak: warning: {}; using default", err);
                parse_format(DEFAULT_FORMAT).unwrap()
            }
        };
        // Overprinting interleaves badly with full command echo.
        let smart_terminal = terminal::use_fancy() && !verbose;
        StatusPrinter {
            verbose,
            format,
            printer: LinePrinter::new(smart_terminal),
            started_edges: 0,
            finished_edges: 0,
            total_edges: 0,
            start_time: Instant::now(),
            running_edges: HashMap::new(),
            overall_rate: RateInfo::new(),
            current_rate: SlidingRateInfo::new(parallelism),
        }
    }

    pub fn plan_has_total_edges(&mut self, total: usize) {
        self.total_edges = total;
    }

    pub fn build_started(&mut self) {
        self.overall_rate.restart();
        self.current_rate.restart();
    }

    pub fn build_finished(&mut self) {
        self.printer.set_console_locked(false);
        if self.printer.smart_terminal && !self.printer.have_blank_line {
            print!("\r\x1b[K");
            std::io::stdout().flush().unwrap();
        }
    }

    pub fn build_edge_started(&mut self, state: &State, edge: EdgeId) {
        let start_time = self.start_time.elapsed().as_millis() as i32;
        self.running_edges.insert(edge, start_time);
        self.started_edges += 1;

        let use_console = state.uses_console(edge);
        if use_console || self.printer.smart_terminal {
            self.print_status(state, edge, EdgeStatus::Started);
        }
        if use_console {
            self.printer.set_console_locked(true);
        }
    }

    /// Returns the edge's (start, end) times in status-clock milliseconds.
    pub fn build_edge_finished(
        &mut self,
        state: &State,
        edge: EdgeId,
        result: &FinishedCommand,
    ) -> (i32, i32) {
        self.finished_edges += 1;
        let start_time = self.running_edges.remove(&edge).unwrap_or(0);
        let end_time = self.start_time.elapsed().as_millis() as i32;

        if state.uses_console(edge) {
            self.printer.set_console_locked(false);
        } else {
            self.print_status(state, edge, EdgeStatus::Finished);
        }

        // Print the command that is spewing before printing its output.
        if !result.success() {
            let outputs = state
                .edge(edge)
                .outs
                .iter()
                .map(|&o| state.node(o).path.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            self.printer
                .print_on_new_line(&format!("FAILED: {}\n", outputs));
            self.printer
                .print_on_new_line(&format!("{}\n", state.evaluate_command(edge)));
        }

        if !result.output.is_empty() {
            // Subprocess output is opaque bytes; forward it untouched on a
            // fresh line.
            if !self.printer.have_blank_line {
                print!("\r\x1b[K");
            }
            self.printer.have_blank_line = true;
            std::io::stdout().write_all(&result.output).unwrap();
            if !result.output.ends_with(b"\n") {
                println!();
            }
            std::io::stdout().flush().unwrap();
        }

        (start_time, end_time)
    }

    /// Log a line of output without corrupting the status display.
    pub fn log(&mut self, msg: &str) {
        self.printer.print_on_new_line(msg);
    }

    fn print_status(&mut self, state: &State, edge: EdgeId, status: EdgeStatus) {
        let mut to_print = state.edge_binding(edge, "description");
        if to_print.is_empty() || self.verbose {
            to_print = state.evaluate_command(edge);
        }
        let line = format!("{}{}", self.format_progress_status(status), to_print);
        if self.verbose {
            self.printer.print_on_new_line(&line);
        } else {
            self.printer.print(&line);
        }
    }

    fn format_progress_status(&mut self, status: EdgeStatus) -> String {
        let mut out = String::new();
        for part in &self.format {
            match part {
                FormatPart::Literal(s) => out.push_str(s),
                FormatPart::Placeholder(p) => match p {
                    's' => out.push_str(&self.started_edges.to_string()),
                    't' => out.push_str(&self.total_edges.to_string()),
                    'r' => {
                        let mut running = self.started_edges - self.finished_edges;
                        // Count the edge that just finished as running.
                        if status == EdgeStatus::Finished {
                            running += 1;
                        }
                        out.push_str(&running.to_string());
                    }
                    'u' => out.push_str(
                        &self
                            .total_edges
                            .saturating_sub(self.started_edges)
                            .to_string(),
                    ),
                    'f' => out.push_str(&self.finished_edges.to_string()),
                    'o' => {
                        self.overall_rate.update(self.finished_edges);
                        out.push_str(&format_rate(self.overall_rate.rate));
                    }
                    'c' => {
                        self.current_rate.update(self.finished_edges);
                        out.push_str(&format_rate(self.current_rate.rate));
                    }
                    'p' => {
                        let percent = if self.total_edges == 0 {
                            0
                        } else {
                            100 * self.finished_edges / self.total_edges
                        };
                        out.push_str(&format!("{:3}%", percent));
                    }
                    'e' => out.push_str(&format!("{:.3}", self.overall_rate.elapsed())),
                    _ => unreachable!("validated at parse time"),
                },
            }
        }
        out
    }
}
