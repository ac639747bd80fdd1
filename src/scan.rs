//! The dirty scan: walks the graph from a target, stats files, loads
//! discovered dependencies, and decides which edges must rerun.
//!
//! An edge is dirty when an input is dirty, an output is missing or older
//! than the newest input, or the recorded command hash no longer matches the
//! command we would run now.  `restat` edges additionally consult the mtime
//! stored in the build log, which is what lets no-op rebuilds stop
//! propagating.

use crate::disk::DiskInterface;
use crate::graph::{EdgeId, NodeId, State, VisitMark};
use crate::log::{hash_command, BuildLog};
use crate::scanner::Scanner;
use crate::{depfile, explain};
use anyhow::bail;

pub struct DependencyScan<'a> {
    pub state: &'a mut State,
    pub log: &'a BuildLog,
    pub disk: &'a dyn DiskInterface,
    pub explain: bool,
}

impl<'a> DependencyScan<'a> {
    pub fn new(
        state: &'a mut State,
        log: &'a BuildLog,
        disk: &'a dyn DiskInterface,
        explain: bool,
    ) -> Self {
        DependencyScan {
            state,
            log,
            disk,
            explain,
        }
    }

    /// Update the dirty state of the given node, visiting its transitive
    /// inputs.  Detects graph cycles along the way.
    pub fn recompute_dirty(&mut self, node: NodeId) -> anyhow::Result<()> {
        let mut stack = Vec::new();
        self.recompute_node_dirty(node, &mut stack)
    }

    fn recompute_node_dirty(
        &mut self,
        node: NodeId,
        stack: &mut Vec<NodeId>,
    ) -> anyhow::Result<()> {
        let edge = match self.state.node(node).in_edge {
            None => {
                // A leaf node is dirty if it is missing.
                if self.state.node(node).status_known {
                    return Ok(());
                }
                let mtime = self.state.stat(node, self.disk)?;
                self.state.node_mut(node).dirty = mtime == 0;
                return Ok(());
            }
            Some(edge) => edge,
        };

        match self.state.edge(edge).mark {
            VisitMark::Done => return Ok(()),
            VisitMark::InStack => return Err(self.cycle_error(node, stack)),
            VisitMark::None => {}
        }
        self.state.edge_mut(edge).mark = VisitMark::InStack;
        stack.push(node);

        let mut dirty = false;
        {
            let e = self.state.edge_mut(edge);
            e.outputs_ready = true;
            e.deps_missing = false;
        }

        // stat all outputs up front; both the staleness comparison and the
        // deps-log freshness check need their mtimes.
        for out in self.state.edge(edge).outs.clone() {
            if !self.state.node(out).status_known {
                self.state.stat(out, self.disk)?;
            }
        }

        // Dynamically discovered inputs join the implicit range before the
        // input walk below.  Failing to load them forces a rebuild to
        // regenerate the information.
        if !self.load_deps(edge)? {
            dirty = true;
            self.state.edge_mut(edge).deps_missing = true;
        }

        let ins = self.state.edge(edge).ins.clone();
        let order_only_start = ins.len() - self.state.edge(edge).order_only_ins;
        let mut most_recent_input: Option<NodeId> = None;
        for (i, &input) in ins.iter().enumerate() {
            self.recompute_node_dirty(input, stack)?;

            // If an input is not ready, neither are our outputs.
            if let Some(in_edge) = self.state.node(input).in_edge {
                if !self.state.edge(in_edge).outputs_ready {
                    self.state.edge_mut(edge).outputs_ready = false;
                }
            }

            if i >= order_only_start {
                // Order-only inputs gate scheduling but not dirtiness.
                continue;
            }
            if self.state.node(input).dirty {
                explain!(
                    self,
                    "{} is dirty",
                    self.state.node(input).path
                );
                dirty = true;
            } else {
                let mtime = self.state.node(input).mtime;
                match most_recent_input {
                    Some(prev) if self.state.node(prev).mtime >= mtime => {}
                    _ => most_recent_input = Some(input),
                }
            }
        }

        // We may also be dirty due to output state: missing outputs, out of
        // date outputs, a changed command.
        if !dirty {
            dirty = self.recompute_outputs_dirty(edge, most_recent_input)?;
        }

        if dirty {
            for out in self.state.edge(edge).outs.clone() {
                self.state.node_mut(out).dirty = true;
            }
        }

        // Dirty edges have unfinished outputs, except that a phony edge with
        // no inputs has nothing to do and counts as ready.
        let is_empty_phony =
            self.state.is_phony(edge) && self.state.edge(edge).ins.is_empty();
        if dirty && !is_empty_phony {
            self.state.edge_mut(edge).outputs_ready = false;
        }

        self.state.edge_mut(edge).mark = VisitMark::Done;
        stack.pop();
        Ok(())
    }

    /// Whether the edge's outputs are out of date relative to
    /// `most_recent_input` or the build log.  Used both by the scan and when
    /// re-evaluating edges after a restat.
    pub fn recompute_outputs_dirty(
        &mut self,
        edge: EdgeId,
        most_recent_input: Option<NodeId>,
    ) -> anyhow::Result<bool> {
        let command = self.state.evaluate_command_with_rsp(edge);
        for out in self.state.edge(edge).outs.clone() {
            if self.output_dirty(edge, most_recent_input, &command, out)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn output_dirty(
        &mut self,
        edge: EdgeId,
        most_recent_input: Option<NodeId>,
        command: &str,
        output: NodeId,
    ) -> anyhow::Result<bool> {
        if !self.state.node(output).status_known {
            self.state.stat(output, self.disk)?;
        }
        let output_path = |state: &State| state.node(output).path.clone();

        if self.state.is_phony(edge) {
            // Phony edges don't write any output.  Outputs are only dirty if
            // there are no inputs and the output is missing.
            if self.state.edge(edge).ins.is_empty() && !self.state.node(output).exists() {
                explain!(
                    self,
                    "output {} of phony edge with no inputs doesn't exist",
                    output_path(self.state)
                );
                return Ok(true);
            }
            return Ok(false);
        }

        // Dirty if we're missing the output.
        if !self.state.node(output).exists() {
            explain!(self, "output {} doesn't exist", output_path(self.state));
            return Ok(true);
        }

        // Dirty if the output is older than the input.
        let mut entry: Option<crate::log::LogEntry> = None;
        if let Some(input) = most_recent_input {
            let input_mtime = self.state.node(input).mtime;
            let mut output_mtime = self.state.node(output).mtime;
            if output_mtime < input_mtime {
                // If this is a restat rule, we may have cleaned the output
                // in a previous run and stored the most recent input mtime
                // in the build log.  Use that mtime instead, so the output
                // is only considered dirty if an input was modified since
                // the previous run.
                let mut used_restat = false;
                if self.state.edge_binding_bool(edge, "restat") {
                    if let Some(e) = self.log.lookup_by_output(&self.state.node(output).path) {
                        output_mtime = e.mtime;
                        used_restat = true;
                        entry = Some(e.clone());
                    }
                }
                if output_mtime < input_mtime {
                    explain!(
                        self,
                        "{}output {} older than most recent input {}",
                        if used_restat { "restat of " } else { "" },
                        output_path(self.state),
                        self.state.node(input).path
                    );
                    return Ok(true);
                }
            }
        }

        let generator = self.state.edge_binding_bool(edge, "generator");
        if entry.is_none() {
            entry = self
                .log
                .lookup_by_output(&self.state.node(output).path)
                .cloned();
        }
        match &entry {
            Some(entry) => {
                if !generator && hash_command(command) != entry.command_hash {
                    // The command changed since the last build.  But
                    // generator rules tolerate command changes.
                    explain!(
                        self,
                        "command line changed for {}",
                        output_path(self.state)
                    );
                    return Ok(true);
                }
                if let Some(input) = most_recent_input {
                    if entry.mtime < self.state.node(input).mtime {
                        // The mtime in the log is older than the most
                        // recent input; a previous run may have rewritten
                        // the output without bumping its mtime.
                        explain!(
                            self,
                            "recorded mtime of {} older than most recent input {}",
                            output_path(self.state),
                            self.state.node(input).path
                        );
                        return Ok(true);
                    }
                }
            }
            None => {
                if !generator {
                    explain!(
                        self,
                        "command line not found in log for {}",
                        output_path(self.state)
                    );
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Load discovered dependencies into the edge's input list.  Ok(false)
    /// means the information is missing or stale and the edge must rerun.
    fn load_deps(&mut self, edge: EdgeId) -> anyhow::Result<bool> {
        let deps_type = self.state.edge_binding(edge, "deps");
        if !deps_type.is_empty() {
            return self.load_deps_from_log(edge);
        }
        let depfile = self.state.edge_path_binding(edge, "depfile");
        if !depfile.is_empty() {
            return self.load_depfile(edge, &depfile);
        }
        Ok(true)
    }

    fn load_deps_from_log(&mut self, edge: EdgeId) -> anyhow::Result<bool> {
        let output = self.state.edge(edge).outs[0];
        let deps = match self.log.deps_for(self.state, output) {
            None => {
                explain!(
                    self,
                    "deps for {} are missing",
                    self.state.node(output).path
                );
                return Ok(false);
            }
            Some(deps) => deps.clone(),
        };

        // Deps are invalid if the output is newer than the deps.
        if self.state.node(output).mtime > deps.mtime {
            explain!(
                self,
                "stale deps; output {} newer than deps record",
                self.state.node(output).path
            );
            return Ok(false);
        }

        for node in deps.nodes {
            self.state.edge_mut(edge).add_discovered_in(node);
            self.state.node_mut(node).out_edges.push(edge);
        }
        Ok(true)
    }

    fn load_depfile(&mut self, edge: EdgeId, depfile: &str) -> anyhow::Result<bool> {
        let mut bytes = match self.disk.read_file(depfile)? {
            None => {
                explain!(self, "depfile {} is missing", depfile);
                return Ok(false);
            }
            Some(bytes) => bytes,
        };
        bytes.push(0);
        let mut scanner = Scanner::new(&bytes);
        let parsed = match depfile::parse(&mut scanner) {
            Ok(parsed) => parsed,
            Err(_) => {
                // An unreadable depfile forces a rerun to regenerate it.
                explain!(self, "depfile {} could not be parsed", depfile);
                return Ok(false);
            }
        };

        let first_out = self.state.edge(edge).outs[0];
        let out_path = self.state.node(first_out).path.clone();
        let deps = match parsed.get(out_path.as_str()) {
            None => {
                explain!(
                    self,
                    "depfile {} does not mention output {}",
                    depfile,
                    out_path
                );
                return Ok(false);
            }
            Some(deps) => deps,
        };

        for dep in deps {
            let (path, slash_bits) = crate::canon::canonicalize(*dep)?;
            let node = self.state.node_id(&path, slash_bits);
            self.state.edge_mut(edge).add_discovered_in(node);
            self.state.node_mut(node).out_edges.push(edge);
        }
        Ok(true)
    }

    fn cycle_error(&self, node: NodeId, stack: &[NodeId]) -> anyhow::Error {
        let start = stack.iter().position(|&n| n == node).unwrap_or(0);
        let mut names: Vec<&str> = stack[start..]
            .iter()
            .map(|&n| self.state.node(n).path.as_str())
            .collect();
        names.push(self.state.node(node).path.as_str());
        anyhow::anyhow!("dependency cycle: {}", names.join(" -> "))
    }
}

/// Check the manifest's required-version declaration against what this
/// binary implements.
pub fn check_required_version(required: &str) -> anyhow::Result<()> {
    // We implement the 1.x manifest language.
    let supported = [1u32, 7];
    let mut parts = required.split('.');
    let mut version = [0u32; 2];
    for slot in version.iter_mut() {
        match parts.next() {
            Some(part) => {
                *slot = part
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid version {:?}", required))?;
            }
            None => break,
        }
    }
    if version > supported {
        bail!(
            "majak supports ninja version {}.{}, manifest requires {}",
            supported[0],
            supported[1],
            required
        );
    }
    Ok(())
}
