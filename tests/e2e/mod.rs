//! Support code for e2e tests, which run majak as a binary.

mod basic;
mod discovered;
mod manifest;
mod rebuild;

pub fn majak_binary() -> std::path::PathBuf {
    std::env::current_exe()
        .expect("test binary path")
        .parent()
        .expect("test binary directory")
        .parent()
        .expect("binary directory")
        .join("majak")
}

pub fn majak_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(majak_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so the Rust test
    // framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let stdout = String::from_utf8_lossy(&out.stdout);
    if !stdout.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, stdout
        );
    }
}

pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let stdout = String::from_utf8_lossy(&out.stdout);
    if stdout.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, stdout
        );
    }
}

pub fn assert_stderr_contains(out: &std::process::Output, text: &str) {
    let stderr = String::from_utf8_lossy(&out.stderr);
    if !stderr.contains(text) {
        panic!(
            "assertion failed; expected stderr to contain {:?} but got:\n{}",
            text, stderr
        );
    }
}

/// Manages a temporary directory for invoking majak.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    pub fn metadata(&self, path: &str) -> std::io::Result<std::fs::Metadata> {
        std::fs::metadata(self.dir.path().join(path))
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// How many lines a marker file accumulated, i.e. how many times its
    /// edge has run.
    pub fn mark_count(&self, path: &str) -> usize {
        match self.read(path) {
            Ok(bytes) => bytes.split(|&b| b == b'\n').filter(|l| !l.is_empty()).count(),
            Err(_) => 0,
        }
    }

    /// Sleep long enough for a rewritten file to get a fresh mtime.
    pub fn tick(&self) {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    /// Invoke majak, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }
}

// Ensure rule constants have the same description and number of lines of
// text on Windows/non-Windows to keep tests platform-agnostic.

#[cfg(unix)]
pub const TOUCH_RULE: &str = "
rule touch
  command = touch $out
  description = touch $out
";

#[cfg(windows)]
pub const TOUCH_RULE: &str = "
rule touch
  command = cmd /c type nul > $out
  description = touch $out
";

/// A rule whose run count is observable: every execution appends a line to
/// $out.stamp.
#[cfg(unix)]
pub const MARK_RULE: &str = "
rule mark
  command = echo mark >> $out.stamp && touch $out
  description = mark $out
";

#[cfg(windows)]
pub const MARK_RULE: &str = "
rule mark
  command = cmd /c echo mark >> $out.stamp && cmd /c type nul > $out
  description = mark $out
";
