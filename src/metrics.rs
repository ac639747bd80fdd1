//! Named counters and timers for -d stats.  Collection is off by default so
//! the hot paths pay nothing but an atomic load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(false);
static METRICS: Mutex<Option<HashMap<&'static str, Metric>>> = Mutex::new(None);

#[derive(Default, Clone, Copy)]
struct Metric {
    count: u64,
    micros: u128,
}

pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
    *METRICS.lock().unwrap() = Some(HashMap::new());
}

pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Time one invocation of a named operation.
pub fn record<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let elapsed = start.elapsed().as_micros();
    if let Some(metrics) = METRICS.lock().unwrap().as_mut() {
        let m = metrics.entry(name).or_default();
        m.count += 1;
        m.micros += elapsed;
    }
    result
}

/// Print the accumulated table, widest counts first.
pub fn dump() {
    let metrics = match METRICS.lock().unwrap().as_ref() {
        None => return,
        Some(metrics) => metrics.clone(),
    };
    let mut rows: Vec<_> = metrics.into_iter().collect();
    rows.sort_by(|a, b| b.1.micros.cmp(&a.1.micros));
    println!("{:<24}{:>8}{:>12}{:>12}", "metric", "count", "avg (us)", "total (ms)");
    for (name, m) in rows {
        let avg = m.micros as f64 / m.count as f64;
        println!(
            "{:<24}{:>8}{:>12.1}{:>12.3}",
            name,
            m.count,
            avg,
            m.micros as f64 / 1000.0
        );
    }
}
