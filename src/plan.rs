//! The plan: tracks which edges we want to build and which are ready to
//! run, routing admission through each edge's pool.
//!
//! Edges move through want states: Nothing (reached but not needed),
//! ToStart (needed, inputs not yet ready), ToFinish (scheduled).  Pool
//! capacity is charged when an edge is scheduled and released when it
//! finishes.

use crate::graph::{EdgeId, NodeId, State};
use crate::scan::DependencyScan;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Want {
    /// We do not want to build the edge, but it may still gate edges we do
    /// want via order-only dependencies.
    Nothing,
    /// We want to build the edge, but it is not yet scheduled.
    ToStart,
    /// The edge has been scheduled (possibly delayed by its pool).
    ToFinish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeResult {
    Failed,
    Succeeded,
}

#[derive(Default)]
pub struct Plan {
    want: HashMap<EdgeId, Want>,
    ready: BTreeSet<EdgeId>,
    command_edges: usize,
    wanted_edges: usize,
}

impl Plan {
    pub fn new() -> Self {
        Plan::default()
    }

    /// Number of non-phony edges the plan wants to run, for status totals.
    pub fn command_edge_count(&self) -> usize {
        self.command_edges
    }

    pub fn more_to_do(&self) -> bool {
        self.wanted_edges > 0 && self.command_edges > 0
    }

    /// Pull a target into the plan, wanting every dirty edge reachable from
    /// it.
    pub fn add_target(&mut self, state: &mut State, node: NodeId) -> anyhow::Result<()> {
        self.add_sub_target(state, node, None)
    }

    fn add_sub_target(
        &mut self,
        state: &mut State,
        node: NodeId,
        dependent: Option<NodeId>,
    ) -> anyhow::Result<()> {
        let edge = match state.node(node).in_edge {
            None => {
                // Leaf node; an error only if it's missing and wanted.
                if state.node(node).dirty {
                    let referenced = match dependent {
                        Some(d) => format!(", needed by '{}',", state.node(d).path),
                        None => String::new(),
                    };
                    anyhow::bail!(
                        "'{}'{} missing and no known rule to make it",
                        state.node(node).path,
                        referenced
                    );
                }
                return Ok(());
            }
            Some(edge) => edge,
        };

        if state.edge(edge).outputs_ready {
            return Ok(()); // Don't need to do anything.
        }

        // An entry of Nothing means the edge was reached but is not (yet)
        // needed itself.
        let inserted = !self.want.contains_key(&edge);
        if inserted {
            self.want.insert(edge, Want::Nothing);
        }

        if state.node(node).dirty && self.want[&edge] == Want::Nothing {
            self.want.insert(edge, Want::ToStart);
            self.wanted_edges += 1;
            if !state.is_phony(edge) {
                self.command_edges += 1;
            }
            if state.all_inputs_ready(edge) {
                self.schedule_work(state, edge);
            }
        }

        if !inserted {
            return Ok(()); // We've already processed the inputs.
        }

        for input in state.edge(edge).ins.clone() {
            self.add_sub_target(state, input, Some(node))?;
        }
        Ok(())
    }

    /// The next edge to run, if any is ready.
    pub fn find_work(&mut self) -> Option<EdgeId> {
        let id = *self.ready.iter().next()?;
        self.ready.remove(&id);
        Some(id)
    }

    fn schedule_work(&mut self, state: &mut State, edge: EdgeId) {
        match self.want[&edge] {
            // Scheduling the same edge twice can happen when an edge and a
            // dependency share an order-only input; the first schedule wins.
            Want::ToFinish => return,
            Want::ToStart => {}
            Want::Nothing => panic!("scheduling edge not marked as wanted"),
        }
        self.want.insert(edge, Want::ToFinish);

        let pool_id = state.edge(edge).pool;
        let weight = state.edge(edge).weight();
        if state.pools.get(pool_id).should_delay_edge() {
            state.pools.get_mut(pool_id).delay_edge(edge);
            state
                .pools
                .get_mut(pool_id)
                .retrieve_ready_edges(&state.edges, &mut self.ready);
        } else {
            state.pools.get_mut(pool_id).edge_scheduled(weight);
            self.ready.insert(edge);
        }
    }

    /// An edge has finished running (or failed); release its pool weight and
    /// on success mark outputs ready and advance dependents.
    pub fn edge_finished(&mut self, state: &mut State, edge: EdgeId, result: EdgeResult) {
        let want = *self.want.get(&edge).expect("finished edge not in plan");
        let directly_wanted = want != Want::Nothing;

        // See if this job frees up any delayed jobs.
        let pool_id = state.edge(edge).pool;
        let weight = state.edge(edge).weight();
        if directly_wanted {
            state.pools.get_mut(pool_id).edge_finished(weight);
        }
        state
            .pools
            .get_mut(pool_id)
            .retrieve_ready_edges(&state.edges, &mut self.ready);

        // The rest only applies to successful commands.
        if result != EdgeResult::Succeeded {
            return;
        }

        if directly_wanted {
            self.wanted_edges -= 1;
        }
        self.want.remove(&edge);
        state.edge_mut(edge).outputs_ready = true;

        // Check off any edges that were waiting on this one's outputs.
        for output in state.edge(edge).outs.clone() {
            self.node_finished(state, output);
        }
    }

    fn node_finished(&mut self, state: &mut State, node: NodeId) {
        for oe in state.node(node).out_edges.clone() {
            let want = match self.want.get(&oe) {
                None => continue,
                Some(want) => *want,
            };
            if !state.all_inputs_ready(oe) {
                continue;
            }
            if want != Want::Nothing {
                self.schedule_work(state, oe);
            } else {
                // We don't need to build this edge, but finishing it may
                // unblock edges we do want further downstream.
                self.edge_finished(state, oe, EdgeResult::Succeeded);
            }
        }
    }

    /// A restat left `node` byte-identical: mark it clean and drop every
    /// downstream edge whose outputs turn out to be up to date after all.
    pub fn clean_node(&mut self, scan: &mut DependencyScan, node: NodeId) -> anyhow::Result<()> {
        scan.state.node_mut(node).dirty = false;

        for oe in scan.state.node(node).out_edges.clone() {
            // Don't process edges we don't actually want.
            match self.want.get(&oe) {
                None | Some(Want::Nothing) => continue,
                Some(_) => {}
            }

            // Don't attempt to clean an edge whose deps info failed to load.
            if scan.state.edge(oe).deps_missing {
                continue;
            }

            // If every non-order-only input is now clean, the outputs may no
            // longer be dirty either.
            let depend_ins = scan.state.edge(oe).depend_ins().to_vec();
            if depend_ins.iter().any(|&i| scan.state.node(i).dirty) {
                continue;
            }
            let most_recent_input = depend_ins
                .iter()
                .copied()
                .max_by_key(|&i| scan.state.node(i).mtime);

            if scan.recompute_outputs_dirty(oe, most_recent_input)? {
                continue;
            }
            for output in scan.state.edge(oe).outs.clone() {
                self.clean_node(scan, output)?;
            }
            self.want.insert(oe, Want::Nothing);
            self.wanted_edges -= 1;
            if !scan.state.is_phony(oe) {
                self.command_edges -= 1;
            }
        }
        Ok(())
    }

    /// Invariant check: wanted_edges matches the number of entries that are
    /// not Nothing.  Used by tests.
    #[cfg(test)]
    fn check_conservation(&self) {
        let counted = self
            .want
            .values()
            .filter(|&&w| w != Want::Nothing)
            .count();
        assert_eq!(counted, self.wanted_edges);
    }
}
