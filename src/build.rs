//! The builder: ties the plan, command runner, build log, and disk together
//! and drives the build loop.
//!
//! A single control thread starts as many commands as the runner admits,
//! then blocks reaping whichever finishes first.  Subprocesses run
//! concurrently; all plan and graph mutation happens on this thread.

use crate::depfile;
use crate::disk::DiskInterface;
use crate::graph::{EdgeId, NodeId, State, TimeStamp};
use crate::log::BuildLog;
use crate::plan::{EdgeResult, Plan};
use crate::process::Termination;
use crate::scan::DependencyScan;
use crate::status::StatusPrinter;
use crate::task::{CommandRunner, DryRunCommandRunner, FinishedCommand, RealCommandRunner};
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub parallelism: usize,
    /// How many failing commands to tolerate before giving up (-k).
    pub failures_allowed: usize,
    /// Don't start new commands while the 1-minute load average exceeds
    /// this; <= 0 disables the cap (-l).
    pub max_load_average: f64,
    pub dry_run: bool,
    pub verbose: bool,
    pub explain: bool,
    pub keep_depfile: bool,
    pub keep_rsp: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            parallelism: 1,
            failures_allowed: 1,
            max_load_average: -0.0,
            dry_run: false,
            verbose: false,
            explain: false,
            keep_depfile: false,
            keep_rsp: false,
        }
    }
}

pub struct Builder<'a> {
    state: &'a mut State,
    config: &'a BuildConfig,
    log: &'a mut BuildLog,
    disk: &'a dyn DiskInterface,
    status: &'a mut StatusPrinter,
    plan: Plan,
    runner: Option<Box<dyn CommandRunner>>,
}

impl<'a> Builder<'a> {
    pub fn new(
        state: &'a mut State,
        config: &'a BuildConfig,
        log: &'a mut BuildLog,
        disk: &'a dyn DiskInterface,
        status: &'a mut StatusPrinter,
    ) -> Self {
        Builder {
            state,
            config,
            log,
            disk,
            status,
            plan: Plan::new(),
            runner: None,
        }
    }

    /// Use a specific command runner instead of the config-selected one.
    pub fn set_runner(&mut self, runner: Box<dyn CommandRunner>) {
        self.runner = Some(runner);
    }

    /// The node for a path, but only if some edge produces it.
    pub fn lookup_target(&self, name: &str) -> Option<NodeId> {
        let (path, _) = crate::canon::canonicalize(name).ok()?;
        let node = self.state.lookup_node(&path)?;
        self.state.node(node).in_edge.map(|_| node)
    }

    pub fn default_targets(&self) -> anyhow::Result<Vec<NodeId>> {
        self.state.default_nodes()
    }

    pub fn add_target_by_name(&mut self, name: &str) -> anyhow::Result<NodeId> {
        let (path, _) = crate::canon::canonicalize(name)?;
        let node = match self.state.lookup_node(&path) {
            Some(node) => node,
            None => bail!("unknown target: '{}'", path),
        };
        self.add_target(node)?;
        Ok(node)
    }

    pub fn add_target(&mut self, node: NodeId) -> anyhow::Result<()> {
        {
            let mut scan =
                DependencyScan::new(self.state, self.log, self.disk, self.config.explain);
            scan.recompute_dirty(node)?;
        }
        if let Some(in_edge) = self.state.node(node).in_edge {
            if self.state.edge(in_edge).outputs_ready {
                return Ok(()); // Nothing to do.
            }
        }
        self.plan.add_target(self.state, node)
    }

    pub fn already_up_to_date(&self) -> bool {
        !self.plan.more_to_do()
    }

    /// Run the plan to completion.  An Err means the build stopped; the
    /// message "interrupted by user" is the distinguished interrupt case.
    pub fn build(&mut self) -> anyhow::Result<()> {
        assert!(!self.already_up_to_date());

        self.status.plan_has_total_edges(self.plan.command_edge_count());
        let mut pending_commands = 0usize;
        let mut failures_allowed = self.config.failures_allowed;

        if self.runner.is_none() {
            self.runner = Some(if self.config.dry_run {
                Box::new(DryRunCommandRunner::new())
            } else {
                Box::new(RealCommandRunner::new(
                    self.config.parallelism,
                    self.config.max_load_average,
                ))
            });
        }

        self.status.build_started();

        // First start as many commands as the runner admits, then reap the
        // next finished command; repeat until the plan is exhausted.
        while self.plan.more_to_do() {
            if failures_allowed > 0 && self.runner.as_ref().unwrap().can_run_more() {
                if let Some(edge) = self.plan.find_work() {
                    if let Err(err) = self.start_edge(edge) {
                        self.cleanup();
                        self.status.build_finished();
                        return Err(err);
                    }
                    if self.state.is_phony(edge) {
                        self.plan
                            .edge_finished(self.state, edge, EdgeResult::Succeeded);
                    } else {
                        pending_commands += 1;
                    }
                    continue;
                }
            }

            if pending_commands > 0 {
                let result = self.runner.as_mut().unwrap().wait_for_command();
                if result.termination == Termination::Interrupted {
                    self.cleanup();
                    self.status.build_finished();
                    bail!("interrupted by user");
                }

                pending_commands -= 1;
                let success = result.success();
                if let Err(err) = self.finish_command(result) {
                    self.cleanup();
                    self.status.build_finished();
                    return Err(err);
                }
                if !success {
                    failures_allowed = failures_allowed.saturating_sub(1);
                }
                continue;
            }

            // Neither able to start nor to reap: terminal condition.
            self.status.build_finished();
            if failures_allowed == 0 {
                if self.config.failures_allowed > 1 {
                    bail!("subcommands failed");
                }
                bail!("subcommand failed");
            } else if failures_allowed < self.config.failures_allowed {
                bail!("cannot make progress due to previous errors");
            } else {
                bail!("stuck [this is a bug]");
            }
        }

        self.status.build_finished();
        Ok(())
    }

    fn start_edge(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        if self.state.is_phony(edge) {
            return Ok(());
        }
        self.status.build_edge_started(self.state, edge);

        if !self.config.dry_run {
            // Create directories necessary for outputs.
            for out in self.state.edge(edge).outs.clone() {
                self.disk.make_dirs(&self.state.node(out).path)?;
            }

            // Create the response file, if needed.
            let rspfile = self.state.edge_path_binding(edge, "rspfile");
            if !rspfile.is_empty() {
                let content = self.state.edge_binding(edge, "rspfile_content");
                self.disk.make_dirs(&rspfile)?;
                self.disk.write_file(&rspfile, &content)?;
            }
        }

        let cmdline = self.state.evaluate_command(edge);
        let use_console = self.state.uses_console(edge);
        self.runner
            .as_mut()
            .unwrap()
            .start_command(edge, cmdline, use_console);
        Ok(())
    }

    fn finish_command(&mut self, mut result: FinishedCommand) -> anyhow::Result<()> {
        let edge = result.edge;

        // First try to extract dependencies from the result: extraction
        // failure turns a successful command into a failed one, because the
        // next build would have no deps to go on.
        let deps_type = self.state.edge_binding(edge, "deps");
        let mut deps_nodes = Vec::new();
        if !deps_type.is_empty() {
            match self.extract_deps(edge, &deps_type) {
                Ok(nodes) => deps_nodes = nodes,
                Err(err) => {
                    if result.success() {
                        if !result.output.is_empty() {
                            result.output.push(b'\n');
                        }
                        result.output.extend_from_slice(err.to_string().as_bytes());
                        result.termination = Termination::Failure;
                    }
                }
            }
        }

        let (start_time, end_time) = self.status.build_edge_finished(self.state, edge, &result);

        if !result.success() {
            self.plan.edge_finished(self.state, edge, EdgeResult::Failed);
            return Ok(());
        }

        // Restat the edge outputs.
        let mut output_mtime: TimeStamp = 0;
        let restat = self.state.edge_binding_bool(edge, "restat");
        if !self.config.dry_run {
            let mut node_cleaned = false;

            for out in self.state.edge(edge).outs.clone() {
                let new_mtime = self.disk.stat(&self.state.node(out).path)?;
                if new_mtime > output_mtime {
                    output_mtime = new_mtime;
                }
                if self.state.node(out).mtime == new_mtime && restat {
                    // The command did not change this output.  Propagate the
                    // clean state through the build graph.  This also covers
                    // still-nonexistent outputs (mtime == 0).
                    let mut scan = DependencyScan::new(
                        self.state,
                        self.log,
                        self.disk,
                        self.config.explain,
                    );
                    self.plan.clean_node(&mut scan, out)?;
                    node_cleaned = true;
                }
            }

            if node_cleaned {
                // Hash the edge as if it ran when its newest input changed,
                // so the next scan sees it as up to date.
                let mut restat_mtime: TimeStamp = 0;
                for &input in self.state.edge(edge).depend_ins() {
                    let input_mtime = self.disk.stat(&self.state.node(input).path)?;
                    if input_mtime > restat_mtime {
                        restat_mtime = input_mtime;
                    }
                }

                let depfile = self.state.edge_path_binding(edge, "depfile");
                if restat_mtime != 0 && deps_type.is_empty() && !depfile.is_empty() {
                    let depfile_mtime = self.disk.stat(&depfile)?;
                    if depfile_mtime > restat_mtime {
                        restat_mtime = depfile_mtime;
                    }
                }

                // Cleaning may have dropped edges from the plan.
                self.status
                    .plan_has_total_edges(self.plan.command_edge_count());

                output_mtime = restat_mtime;
            }
        }

        self.plan
            .edge_finished(self.state, edge, EdgeResult::Succeeded);

        // Delete any leftover response file.
        if !self.config.dry_run {
            let rspfile = self.state.edge_path_binding(edge, "rspfile");
            if !rspfile.is_empty() && !self.config.keep_rsp {
                self.disk.remove_file(&rspfile)?;
            }
        }

        self.log
            .record_command(self.state, edge, start_time, end_time, output_mtime)
            .map_err(|err| anyhow::anyhow!("error writing to build log: {}", err))?;

        if !deps_type.is_empty() && !self.config.dry_run {
            // The parser rejected deps with multiple outputs.
            let out = self.state.edge(edge).outs[0];
            let deps_mtime = self.disk.stat(&self.state.node(out).path)?;
            self.log
                .record_deps(self.state, out, deps_mtime, &deps_nodes)
                .map_err(|err| anyhow::anyhow!("error writing to deps log: {}", err))?;
        }
        Ok(())
    }

    fn extract_deps(&mut self, edge: EdgeId, deps_type: &str) -> anyhow::Result<Vec<NodeId>> {
        if deps_type != "gcc" {
            bail!("unknown deps type '{}'", deps_type);
        }
        let depfile = self.state.edge_path_binding(edge, "depfile");
        if depfile.is_empty() {
            bail!("edge with deps=gcc but no depfile makes no sense");
        }

        // Treat a missing depfile as empty.
        let mut bytes = match self.disk.read_file(&depfile)? {
            None => return Ok(Vec::new()),
            Some(bytes) => bytes,
        };
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        bytes.push(0);
        let mut scanner = crate::scanner::Scanner::new(&bytes);
        let parsed = depfile::parse(&mut scanner).map_err(|err| {
            anyhow::anyhow!(scanner.format_parse_error(std::path::Path::new(&depfile), err))
        })?;

        let mut deps_nodes = Vec::new();
        for (_target, deps) in parsed.iter() {
            for dep in deps {
                let (path, slash_bits) = crate::canon::canonicalize(*dep)?;
                deps_nodes.push(self.state.node_id(&path, slash_bits));
            }
        }

        if !self.config.keep_depfile {
            self.disk.remove_file(&depfile)?;
        }
        Ok(deps_nodes)
    }

    /// After an interrupt or hard failure: stop children and remove outputs
    /// whose contents can no longer be trusted.
    pub fn cleanup(&mut self) {
        let runner = match &mut self.runner {
            None => return,
            Some(runner) => runner,
        };
        let active_edges = runner.get_active_edges();
        runner.abort();

        for edge in active_edges {
            // Delete outputs that were actually modified.  (The generator
            // rule's manifest should survive an interrupt.)  But if the rule
            // uses a depfile, always delete: the command may have written
            // its depfile before being interrupted, leaving dependency info
            // that doesn't match the output.
            let depfile = self.state.edge_path_binding(edge, "depfile");
            for out in self.state.edge(edge).outs.clone() {
                let path = self.state.node(out).path.clone();
                match self.disk.stat(&path) {
                    Ok(new_mtime) => {
                        if !depfile.is_empty() || self.state.node(out).mtime != new_mtime {
                            let _ = self.disk.remove_file(&path);
                        }
                    }
                    // Log and ignore stat errors during cleanup.
                    Err(err) => eprintln!("majak: error: {}", err),
                }
            }
            if !depfile.is_empty() {
                let _ = self.disk.remove_file(&depfile);
            }
        }
    }
}
