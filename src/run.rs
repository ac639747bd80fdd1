//! Command-line entry point: flag parsing, manifest (re)loading, and
//! mapping build outcomes to exit codes.

use crate::build::{BuildConfig, Builder};
use crate::disk::{DiskInterface, RealDiskInterface};
use crate::graph::State;
use crate::load::{self, LoaderOptions, WarningAction};
use crate::log::{BuildLog, BuildLogUser, LoadStatus};
use crate::status::StatusPrinter;
use crate::{metrics, signal, trace};
use anyhow::{anyhow, bail};
use std::path::{Path, PathBuf};

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// majak, a ninja compatible build system
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input build file [default=build.ninja]
    #[argh(option, short = 'f', default = "(\"build.ninja\".into())")]
    build_file: String,

    /// parallelism [default derived from CPU count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going until N jobs fail (0 means infinity) [default=1]
    #[argh(option, short = 'k', default = "1")]
    keep_going: i64,

    /// do not start new jobs if the load average is greater than N
    #[argh(option, short = 'l')]
    max_load_average: Option<f64>,

    /// dry run (don't run commands but act like they succeeded)
    #[argh(switch, short = 'n')]
    dry_run: bool,

    /// show all command lines while building
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// debugging tools (use '-d list' to list)
    #[argh(option, short = 'd')]
    debug: Vec<String>,

    /// warning flags (use '-w list' to list)
    #[argh(option, short = 'w')]
    warnings: Vec<String>,

    /// subcommand tools
    #[argh(option, short = 't')]
    tool: Option<String>,

    /// targets to build
    #[argh(positional)]
    targets: Vec<String>,
}

fn default_parallelism() -> usize {
    let processors = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(0);
    match processors {
        0 | 1 => 2,
        2 => 3,
        n => n + 2,
    }
}

/// Answers the recompactor's liveness question: an output is dead when no
/// edge produces it anymore and it's gone from disk.
struct LogUser<'a> {
    disk: &'a RealDiskInterface,
}

impl BuildLogUser for LogUser<'_> {
    fn is_path_dead(&self, state: &State, path: &str) -> bool {
        if let Some(node) = state.lookup_node(path) {
            if state.node(node).in_edge.is_some() {
                return false;
            }
        }
        // The node existing isn't enough: an old output that is both in the
        // build log and the deps stream still gets a node.  Check the disk.
        match self.disk.stat(path) {
            Ok(mtime) => mtime == 0,
            Err(err) => {
                eprintln!("majak: error: {}", err);
                false
            }
        }
    }
}

/// How many times to let the build regenerate its own manifest before
/// deciding it will never settle.
const REGENERATION_LIMIT: usize = 100;

fn log_path(state: &State) -> PathBuf {
    let builddir = state
        .scopes
        .lookup(state.root_scope, "builddir")
        .unwrap_or("");
    if builddir.is_empty() {
        PathBuf::from(crate::log::FILENAME)
    } else {
        Path::new(builddir).join(crate::log::FILENAME)
    }
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    let mut config = BuildConfig {
        parallelism: opts.parallelism.unwrap_or_else(default_parallelism),
        failures_allowed: if opts.keep_going > 0 {
            opts.keep_going as usize
        } else {
            usize::MAX
        },
        max_load_average: opts.max_load_average.unwrap_or(-0.0),
        dry_run: opts.dry_run,
        verbose: opts.verbose,
        ..BuildConfig::default()
    };

    for debug in &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debugging modes:");
                println!("  stats        print operation counts/timing info");
                println!("  explain      explain what caused a command to execute");
                println!("  keepdepfile  don't delete depfiles after they're read");
                println!("  keeprsp      don't delete @response files on success");
                println!("  trace        generate a json performance trace");
                return Ok(1);
            }
            "stats" => metrics::enable(),
            "explain" => config.explain = true,
            "keepdepfile" => config.keep_depfile = true,
            "keeprsp" => config.keep_rsp = true,
            "trace" => trace::open("majak_trace.json")?,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    let mut loader_options = LoaderOptions::default();
    for warning in &opts.warnings {
        match warning.as_str() {
            "list" => {
                println!("warning flags:");
                println!("  dupbuild={{err,warn}}    multiple build lines for one target");
                println!("  phonycycle={{err,warn}}  phony build statement references itself");
                return Ok(1);
            }
            "dupbuild=err" => loader_options.dupe_edge = WarningAction::Error,
            "dupbuild=warn" => loader_options.dupe_edge = WarningAction::Warn,
            "phonycycle=err" => loader_options.phony_cycle = WarningAction::Error,
            "phonycycle=warn" => loader_options.phony_cycle = WarningAction::Warn,
            _ => bail!("unknown -w {:?}, use -w list to list", warning),
        }
    }

    if let Some(tool) = &opts.tool {
        match tool.as_str() {
            "list" => {
                println!("subcommands:");
                println!("  (none yet)");
                return Ok(1);
            }
            _ => bail!("unknown -t {:?}, use -t list to list", tool),
        }
    }

    if let Some(dir) = &opts.chdir {
        // The formatting of this string, complete with funny quotes, is so
        // Emacs can properly identify that the cwd has changed for
        // subsequent commands.
        println!("majak: Entering directory `{}'", dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    signal::register_sigint();

    let disk = RealDiskInterface {};
    let user = LogUser { disk: &disk };

    // Building may rewrite the manifest itself; when that happens, reload
    // and start over with the new graph.
    for _cycle in 0..REGENERATION_LIMIT {
        let mut state = trace::scope("load", || {
            metrics::record("manifest parse", || {
                load::read(&opts.build_file, loader_options)
            })
        })?;

        let log_path = log_path(&state);
        if let Some(dir) = log_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|err| anyhow!("creating build dir {}: {}", dir.display(), err))?;
            }
        }

        let mut log = BuildLog::new();
        match trace::scope("log load", || {
            metrics::record("log load", || log.load(&log_path, &mut state))
        })? {
            LoadStatus::Loaded => {}
            LoadStatus::Recovered(warning) => eprintln!("majak: warning: {}", warning),
        }
        log.open_for_write(&log_path, &user, &mut state)?;

        // Attempt to rebuild the manifest before building anything else.
        let regenerated = {
            let mut status = StatusPrinter::new(config.verbose, config.parallelism);
            let mut builder = Builder::new(&mut state, &config, &mut log, &disk, &mut status);
            match builder.lookup_target(&opts.build_file) {
                None => false,
                Some(target) => {
                    builder.add_target(target)?;
                    if builder.already_up_to_date() {
                        false
                    } else {
                        trace::scope("build manifest", || builder.build()).map_err(|err| {
                            anyhow!("rebuilding '{}': {}", opts.build_file, err)
                        })?;
                        true
                    }
                }
            }
        };
        if regenerated {
            // In dry-run mode regeneration "succeeds" without ever changing
            // the manifest; looping would never settle.
            if config.dry_run {
                return Ok(0);
            }
            // Start over with the regenerated manifest.
            continue;
        }

        let code = {
            let mut status = StatusPrinter::new(config.verbose, config.parallelism);
            let mut builder = Builder::new(&mut state, &config, &mut log, &disk, &mut status);
            if !opts.targets.is_empty() {
                for target in &opts.targets {
                    builder.add_target_by_name(target)?;
                }
            } else {
                // No named targets: fall back to defaults, or an empty set
                // for an empty manifest (which is simply up to date).
                for target in builder.default_targets()? {
                    builder.add_target(target)?;
                }
            }

            if builder.already_up_to_date() {
                println!("majak: no work to do.");
                0
            } else {
                match trace::scope("build", || builder.build()) {
                    Ok(()) => 0,
                    Err(err) => {
                        println!("majak: build stopped: {}.", err);
                        if err.to_string() == "interrupted by user" {
                            2
                        } else {
                            1
                        }
                    }
                }
            }
        };

        log.close();
        if code == 0 && metrics::enabled() {
            metrics::dump();
        }
        return Ok(code);
    }

    bail!(
        "manifest '{}' still dirty after {} tries",
        opts.build_file,
        REGENERATION_LIMIT
    );
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    let _ = trace::close();
    res
}
