//! Chrome trace-event output, enabled with -d trace.  Load the resulting
//! file in about:tracing or a compatible viewer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_complete(&mut self, name: &str, start: Instant, end: Instant) -> std::io::Result<()> {
        writeln!(
            self.w,
            "{{ \"pid\": 0, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }},",
            name,
            start.duration_since(self.start).as_micros(),
            end.duration_since(start).as_micros(),
        )
    }

    fn close(&mut self) -> std::io::Result<()> {
        let start = self.start;
        self.write_complete("main", start, Instant::now())?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

pub fn open(path: &str) -> std::io::Result<()> {
    *TRACE.lock().unwrap() = Some(Trace::new(path)?);
    Ok(())
}

/// Time a region of work; a no-op unless tracing is open.
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if TRACE.lock().unwrap().is_none() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        trace.write_complete(name, start, end).unwrap();
    }
    result
}

/// Record an already-measured span, e.g. a subprocess execution.
pub fn write_complete(name: &str, start: Instant, end: Instant) {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        trace.write_complete(name, start, end).unwrap();
    }
}

pub fn close() -> std::io::Result<()> {
    if let Some(trace) = TRACE.lock().unwrap().as_mut() {
        trace.close()?;
    }
    Ok(())
}
