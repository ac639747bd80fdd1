//! The build graph: interned path nodes, edges (rule invocations), and
//! pools, collectively owned by `State`.
//!
//! Nodes and edges refer to each other by dense integer ids rather than
//! pointers; `State` holds the arenas the ids index into.

use crate::densemap::{dense_id, DenseMap};
use crate::disk::DiskInterface;
use crate::eval::{Env, EvalString, RuleId, ScopeId, Scopes};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};

/// File modification time: nanoseconds since an arbitrary epoch, strictly
/// monotonic per file.  0 means the file is absent.
pub type TimeStamp = i64;

dense_id!(NodeId);
dense_id!(EdgeId);
dense_id!(PoolId);

/// Edge traversal state used by the dirty scan's cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitMark {
    None,
    InStack,
    Done,
}

/// One canonical output or input path.
#[derive(Debug)]
pub struct Node {
    pub path: String,
    /// Bitmask recording which separators were originally backslashes; kept
    /// so paths can round-trip on platforms that use them.
    pub slash_bits: u64,
    pub mtime: TimeStamp,
    /// Whether mtime has been filled in by a stat this build.
    pub status_known: bool,
    pub dirty: bool,
    /// Dense id in the build log's deps stream, if the node appears there.
    pub log_id: Option<usize>,
    /// The edge producing this node, if any.  At most one.
    pub in_edge: Option<EdgeId>,
    /// Edges consuming this node.
    pub out_edges: Vec<EdgeId>,
}

impl Node {
    pub fn exists(&self) -> bool {
        self.mtime > 0
    }
}

/// One invocation of a rule.
#[derive(Debug)]
pub struct Edge {
    pub rule: RuleId,
    pub pool: PoolId,
    /// Binding environment; parent is the enclosing file scope.
    pub scope: ScopeId,
    /// Inputs, partitioned [explicit | implicit | order_only].
    pub ins: Vec<NodeId>,
    pub explicit_ins: usize,
    pub implicit_ins: usize,
    pub order_only_ins: usize,
    /// Outputs, partitioned [explicit | implicit].
    pub outs: Vec<NodeId>,
    pub implicit_outs: usize,
    pub outputs_ready: bool,
    /// Set when dynamic dependency info could not be loaded, which forces a
    /// rebuild to regenerate it.
    pub deps_missing: bool,
    pub mark: VisitMark,
}

impl Edge {
    /// Reserved for future weighting; all edges currently cost 1.
    pub fn weight(&self) -> usize {
        1
    }

    /// Inputs that contribute to dirtiness, i.e. everything but order-only.
    pub fn depend_ins(&self) -> &[NodeId] {
        &self.ins[..self.ins.len() - self.order_only_ins]
    }

    pub fn explicit_ins(&self) -> &[NodeId] {
        &self.ins[..self.explicit_ins]
    }

    pub fn explicit_outs(&self) -> &[NodeId] {
        &self.outs[..self.outs.len() - self.implicit_outs]
    }

    /// Record a dependency discovered at build time as an extra implicit
    /// input (inserted before the order-only range).
    pub fn add_discovered_in(&mut self, node: NodeId) {
        let pos = self.ins.len() - self.order_only_ins;
        self.ins.insert(pos, node);
        self.implicit_ins += 1;
    }
}

/// A named, bounded resource granting admission to concurrently runnable
/// edges.  depth 0 means unbounded.
#[derive(Debug)]
pub struct Pool {
    pub name: String,
    pub depth: usize,
    current_use: usize,
    /// Edges waiting for capacity, in id (= creation) order.  All edges
    /// weigh 1, so the weighted-admission tie-break reduces to this order.
    delayed: BTreeSet<EdgeId>,
}

impl Pool {
    fn new(name: String, depth: usize) -> Self {
        Pool {
            name,
            depth,
            current_use: 0,
            delayed: BTreeSet::new(),
        }
    }

    pub fn current_use(&self) -> usize {
        self.current_use
    }

    /// Bounded pools route every edge through the delayed queue.
    pub fn should_delay_edge(&self) -> bool {
        self.depth != 0
    }

    pub fn edge_scheduled(&mut self, weight: usize) {
        if self.depth != 0 {
            self.current_use += weight;
        }
    }

    pub fn edge_finished(&mut self, weight: usize) {
        if self.depth != 0 {
            self.current_use -= weight;
        }
    }

    pub fn delay_edge(&mut self, edge: EdgeId) {
        assert!(self.depth != 0);
        self.delayed.insert(edge);
    }

    /// Move delayed edges into `ready` while capacity permits.
    pub fn retrieve_ready_edges(&mut self, edges: &DenseMap<EdgeId, Edge>, ready: &mut BTreeSet<EdgeId>) {
        while let Some(&id) = self.delayed.iter().next() {
            let weight = edges.get(id).weight();
            if self.current_use + weight > self.depth {
                break;
            }
            self.delayed.remove(&id);
            ready.insert(id);
            self.edge_scheduled(weight);
        }
    }
}

/// Owner of the build graph arenas plus the scope/rule arena.
#[derive(Debug)]
pub struct State {
    pub nodes: DenseMap<NodeId, Node>,
    pub edges: DenseMap<EdgeId, Edge>,
    pub pools: DenseMap<PoolId, Pool>,
    pub scopes: Scopes,
    pub defaults: Vec<NodeId>,
    paths: HashMap<String, NodeId>,
    pub root_scope: ScopeId,
    pub phony_rule: RuleId,
    pub default_pool: PoolId,
    pub console_pool: PoolId,
}

impl State {
    pub fn new() -> State {
        let (mut scopes, root_scope) = Scopes::new();
        let phony_rule = scopes.add_rule(
            root_scope,
            crate::eval::Rule {
                name: "phony".to_owned(),
                bindings: crate::smallmap::SmallMap::default(),
            },
        );
        let mut pools = DenseMap::new();
        let default_pool = pools.push(Pool::new(String::new(), 0));
        let console_pool = pools.push(Pool::new("console".to_owned(), 1));
        State {
            nodes: DenseMap::new(),
            edges: DenseMap::new(),
            pools,
            scopes,
            defaults: Vec::new(),
            paths: HashMap::new(),
            root_scope,
            phony_rule,
            default_pool,
            console_pool,
        }
    }

    /// Intern a canonical path, creating its Node on first sight.
    pub fn node_id(&mut self, path: &str, slash_bits: u64) -> NodeId {
        if let Some(&id) = self.paths.get(path) {
            return id;
        }
        let id = self.nodes.push(Node {
            path: path.to_owned(),
            slash_bits,
            mtime: 0,
            status_known: false,
            dirty: false,
            log_id: None,
            in_edge: None,
            out_edges: Vec::new(),
        });
        self.paths.insert(path.to_owned(), id);
        id
    }

    /// Find an already-interned node; never mutates the path map.
    pub fn lookup_node(&self, path: &str) -> Option<NodeId> {
        self.paths.get(path).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        self.edges.get(id)
    }

    pub fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
        self.edges.get_mut(id)
    }

    pub fn add_pool(&mut self, name: String, depth: usize) -> Option<PoolId> {
        if self.lookup_pool(&name).is_some() {
            return None;
        }
        Some(self.pools.push(Pool::new(name, depth)))
    }

    pub fn lookup_pool(&self, name: &str) -> Option<PoolId> {
        self.pools
            .ids()
            .find(|&id| self.pools.get(id).name == name)
    }

    pub fn add_edge(&mut self, rule: RuleId, scope: ScopeId) -> EdgeId {
        self.edges.push(Edge {
            rule,
            pool: self.default_pool,
            scope,
            ins: Vec::new(),
            explicit_ins: 0,
            implicit_ins: 0,
            order_only_ins: 0,
            outs: Vec::new(),
            implicit_outs: 0,
            outputs_ready: false,
            deps_missing: false,
            mark: VisitMark::None,
        })
    }

    pub fn add_in(&mut self, edge: EdgeId, path: &str, slash_bits: u64) {
        let node = self.node_id(path, slash_bits);
        self.edges.get_mut(edge).ins.push(node);
        self.nodes.get_mut(node).out_edges.push(edge);
    }

    /// Attach an output node; fails if another edge already produces it.
    pub fn add_out(&mut self, edge: EdgeId, path: &str, slash_bits: u64) -> bool {
        let node = self.node_id(path, slash_bits);
        if self.nodes.get(node).in_edge.is_some() {
            return false;
        }
        self.edges.get_mut(edge).outs.push(node);
        self.nodes.get_mut(node).in_edge = Some(edge);
        true
    }

    pub fn is_phony(&self, edge: EdgeId) -> bool {
        self.edges.get(edge).rule == self.phony_rule
    }

    pub fn uses_console(&self, edge: EdgeId) -> bool {
        self.edges.get(edge).pool == self.console_pool
    }

    /// All edge inputs are ready when each producing edge has finished.
    pub fn all_inputs_ready(&self, edge: EdgeId) -> bool {
        self.edges.get(edge).ins.iter().all(|&input| {
            match self.nodes.get(input).in_edge {
                Some(in_edge) => self.edges.get(in_edge).outputs_ready,
                None => true,
            }
        })
    }

    /// stat() a node, recording the result.
    pub fn stat(&mut self, id: NodeId, disk: &dyn DiskInterface) -> anyhow::Result<TimeStamp> {
        let node = self.nodes.get_mut(id);
        let mtime = disk.stat(&node.path)?;
        node.mtime = mtime;
        node.status_known = true;
        Ok(mtime)
    }

    /// Targets to build when none are named: `default` statements, or the
    /// root nodes of the graph.
    pub fn default_nodes(&self) -> anyhow::Result<Vec<NodeId>> {
        if !self.defaults.is_empty() {
            return Ok(self.defaults.clone());
        }
        let mut roots = Vec::new();
        for edge in self.edges.iter() {
            for &out in &edge.outs {
                if self.nodes.get(out).out_edges.is_empty() {
                    roots.push(out);
                }
            }
        }
        if self.edges.len() > 0 && roots.is_empty() {
            anyhow::bail!("could not determine root nodes of build graph");
        }
        Ok(roots)
    }

    /// Evaluate one binding in the context of an edge, e.g. "command" or
    /// "description".  Paths interpolated via $in/$out are shell quoted.
    pub fn edge_binding(&self, edge: EdgeId, name: &str) -> String {
        let env = EdgeEnv {
            state: self,
            edge,
            escape: true,
        };
        env.get_var(name).unwrap_or_default().into_owned()
    }

    /// Like edge_binding but without shell quoting, for bindings that name
    /// files directly (depfile, rspfile).
    pub fn edge_path_binding(&self, edge: EdgeId, name: &str) -> String {
        let env = EdgeEnv {
            state: self,
            edge,
            escape: false,
        };
        env.get_var(name).unwrap_or_default().into_owned()
    }

    pub fn edge_binding_bool(&self, edge: EdgeId, name: &str) -> bool {
        !self.edge_binding(edge, name).is_empty()
    }

    pub fn evaluate_command(&self, edge: EdgeId) -> String {
        self.edge_binding(edge, "command")
    }

    /// The command plus any response-file content, which is what gets hashed
    /// into the build log: changing the rspfile must rebuild even though the
    /// command line itself is unchanged.
    pub fn evaluate_command_with_rsp(&self, edge: EdgeId) -> String {
        let mut command = self.evaluate_command(edge);
        let rspfile_content = self.edge_binding(edge, "rspfile_content");
        if !rspfile_content.is_empty() {
            command.push_str(";rspfile=");
            command.push_str(&rspfile_content);
        }
        command
    }
}

/// Quote a path for /bin/sh if it contains shell-significant characters.
fn append_quoted_path(out: &mut String, path: &str) {
    if !path.is_empty() && !path.contains(|c: char| " \t\n\"'$&();<>|*?[]#~".contains(c)) {
        out.push_str(path);
        return;
    }
    out.push('\'');
    for c in path.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
}

/// Variable environment for expanding bindings attached to an edge: handles
/// the magic $in/$out variables, then rule bindings, then the scope chain.
struct EdgeEnv<'a> {
    state: &'a State,
    edge: EdgeId,
    escape: bool,
}

impl<'a> EdgeEnv<'a> {
    fn make_path_list(&self, ids: &[NodeId], sep: char) -> String {
        let mut out = String::new();
        for &id in ids {
            if !out.is_empty() {
                out.push(sep);
            }
            let path = &self.state.nodes.get(id).path;
            if self.escape {
                append_quoted_path(&mut out, path);
            } else {
                out.push_str(path);
            }
        }
        out
    }
}

impl<'a> Env for EdgeEnv<'a> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        let edge = self.state.edges.get(self.edge);
        match var {
            "in" => return Some(Cow::Owned(self.make_path_list(edge.explicit_ins(), ' '))),
            "in_newline" => {
                return Some(Cow::Owned(self.make_path_list(edge.explicit_ins(), '\n')))
            }
            "out" => return Some(Cow::Owned(self.make_path_list(edge.explicit_outs(), ' '))),
            _ => {}
        }
        // Note: no cycle detection; a rule variable referring to itself
        // recurses forever, matching the reference behavior.
        let rule = self.state.scopes.rule(edge.rule);
        let fallback: Option<&EvalString<String>> = rule.bindings.get(var);
        self.state
            .scopes
            .lookup_with_fallback(edge.scope, var, fallback, self)
            .map(Cow::Owned)
    }
}
