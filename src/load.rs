//! Graph loading: runs the manifest parser across the file and its
//! includes, evaluating variables and canonicalizing paths into the State
//! arena.

use crate::canon::canonicalize;
use crate::eval::{Rule, ScopeEnv, ScopeId};
use crate::graph::{EdgeId, State};
use crate::parse::{Parser, Statement};
use crate::scan::check_required_version;
use anyhow::{anyhow, bail};
use std::path::Path;

/// What to do about a warning-grade manifest problem (-w flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningAction {
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderOptions {
    /// Multiple edges producing the same output.
    pub dupe_edge: WarningAction,
    /// A phony edge listing its own output as an input.
    pub phony_cycle: WarningAction,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions {
            dupe_edge: WarningAction::Warn,
            phony_cycle: WarningAction::Warn,
        }
    }
}

struct Loader {
    state: State,
    options: LoaderOptions,
}

/// Parse the manifest rooted at `build_filename` into a fresh State.
pub fn read(build_filename: &str, options: LoaderOptions) -> anyhow::Result<State> {
    let mut loader = Loader {
        state: State::new(),
        options,
    };
    let root = loader.state.root_scope;
    loader.read_file(build_filename, root)?;
    Ok(loader.state)
}

impl Loader {
    fn read_file(&mut self, filename: &str, scope: ScopeId) -> anyhow::Result<()> {
        let mut bytes = std::fs::read(filename)
            .map_err(|err| anyhow!("loading '{}': {}", filename, err))?;
        bytes.push(0);
        let mut parser = Parser::new(&bytes);
        loop {
            let stmt = match parser
                .read()
                .map_err(|err| anyhow!(parser.format_parse_error(Path::new(filename), err)))?
            {
                None => break,
                Some(stmt) => stmt,
            };
            match stmt {
                Statement::Binding((name, val)) => {
                    let value = self.evaluate(&val, scope);
                    // Check ninja_required_version immediately so we can
                    // exit before any syntactic surprises.
                    if name == "ninja_required_version" {
                        check_required_version(&value)?;
                    }
                    self.state
                        .scopes
                        .add_binding(scope, name.to_owned(), value);
                }
                Statement::Rule(rule) => {
                    if self
                        .state
                        .scopes
                        .lookup_rule_current_scope(scope, rule.name)
                        .is_some()
                    {
                        bail!("duplicate rule '{}'", rule.name);
                    }
                    if rule.vars.get("rspfile").is_some() != rule.vars.get("rspfile_content").is_some()
                    {
                        bail!("rspfile and rspfile_content need to be both specified");
                    }
                    match rule.vars.get("command") {
                        Some(command) if !command.is_empty() => {}
                        _ => bail!("expected 'command =' line"),
                    }
                    let mut bindings = crate::smallmap::SmallMap::default();
                    for (name, val) in rule.vars.into_iter() {
                        bindings.insert(name.to_owned(), val.into_owned());
                    }
                    self.state.scopes.add_rule(
                        scope,
                        Rule {
                            name: rule.name.to_owned(),
                            bindings,
                        },
                    );
                }
                Statement::Pool(pool) => {
                    if self.state.add_pool(pool.name.to_owned(), pool.depth).is_none() {
                        bail!("duplicate pool '{}'", pool.name);
                    }
                }
                Statement::Default(defaults) => {
                    for default in defaults {
                        let path = self.evaluate(&default, scope);
                        let (path, _) = canonicalize(path)?;
                        let node = match self.state.lookup_node(&path) {
                            Some(node) => node,
                            None => bail!("unknown target '{}'", path),
                        };
                        self.state.defaults.push(node);
                    }
                }
                Statement::Include(path) => {
                    let path = self.evaluate(&path, scope);
                    self.read_file(&path, scope)?;
                }
                Statement::Subninja(path) => {
                    let path = self.evaluate(&path, scope);
                    let child = self.state.scopes.push_scope(scope);
                    self.read_file(&path, child)?;
                }
                Statement::Build(build) => self.add_build(scope, build)?,
            }
        }
        Ok(())
    }

    fn evaluate(&self, val: &crate::eval::EvalString<&str>, scope: ScopeId) -> String {
        let env = ScopeEnv {
            scopes: &self.state.scopes,
            scope,
        };
        val.evaluate(&[&env])
    }

    fn add_build(&mut self, scope: ScopeId, b: crate::parse::Build) -> anyhow::Result<()> {
        let rule = match self.state.scopes.lookup_rule(scope, b.rule) {
            Some(rule) => rule,
            None => bail!("unknown build rule '{}'", b.rule),
        };

        // Bindings on edges are rare, so allocate per-edge scopes only when
        // needed.  Per-edge values are evaluated in the enclosing scope.
        let env = if b.vars.is_empty() {
            scope
        } else {
            let child = self.state.scopes.push_scope(scope);
            for (name, val) in b.vars.iter() {
                let value = self.evaluate(val, scope);
                self.state
                    .scopes
                    .add_binding(child, (*name).to_owned(), value);
            }
            child
        };

        let edge = self.state.add_edge(rule, env);

        let pool_name = self.state.edge_binding(edge, "pool");
        if !pool_name.is_empty() {
            match self.state.lookup_pool(&pool_name) {
                Some(pool) => self.state.edge_mut(edge).pool = pool,
                None => bail!("unknown pool name '{}'", pool_name),
            }
        }

        let total_outs = b.outs.len();
        let mut implicit_outs = total_outs - b.explicit_outs;
        for (i, out) in b.outs.iter().enumerate() {
            let path = self.evaluate(out, env);
            let (path, slash_bits) = canonicalize(path)?;
            if !self.state.add_out(edge, &path, slash_bits) {
                match self.options.dupe_edge {
                    WarningAction::Error => {
                        bail!("multiple rules generate {} [-w dupbuild=err]", path)
                    }
                    WarningAction::Warn => {
                        eprintln!(
                            "majak: warning: multiple rules generate {}. builds involving \
                             this target will not be correct; continuing anyway \
                             [-w dupbuild=warn]",
                            path
                        );
                        if total_outs - i <= implicit_outs {
                            implicit_outs -= 1;
                        }
                    }
                }
            }
        }
        if self.state.edge(edge).outs.is_empty() {
            // All outputs of the edge are already created by other edges.
            // Drop the edge before any input nodes are wired to it.
            self.state.edges.pop();
            return Ok(());
        }
        self.state.edge_mut(edge).implicit_outs = implicit_outs;

        for input in &b.ins {
            let path = self.evaluate(input, env);
            let (path, slash_bits) = canonicalize(path)?;
            self.state.add_in(edge, &path, slash_bits);
        }
        {
            let e = self.state.edge_mut(edge);
            e.explicit_ins = b.explicit_ins;
            e.implicit_ins = b.implicit_ins;
            e.order_only_ins = b.order_only_ins;
        }

        self.check_phony_cycle(edge)?;

        // Dynamic deps are keyed by a single output in the log.
        if !self.state.edge_binding(edge, "deps").is_empty()
            && self.state.edge(edge).outs.len() > 1
        {
            bail!("multiple outputs aren't supported with deps");
        }

        Ok(())
    }

    /// Old CMake versions write phony edges that name themselves as inputs.
    /// Filter (or reject) the self-reference so it doesn't read as a graph
    /// cycle.
    fn check_phony_cycle(&mut self, edge: EdgeId) -> anyhow::Result<()> {
        let e = self.state.edge(edge);
        let diagnosable = self.state.is_phony(edge)
            && e.outs.len() == 1
            && e.implicit_ins == 0
            && e.order_only_ins == 0;
        if !diagnosable {
            return Ok(());
        }
        let out = self.state.edge(edge).outs[0];
        if !self.state.edge(edge).ins.contains(&out) {
            return Ok(());
        }
        let path = self.state.node(out).path.clone();
        match self.options.phony_cycle {
            WarningAction::Error => {
                bail!(
                    "phony target '{}' names itself as an input [-w phonycycle=err]",
                    path
                )
            }
            WarningAction::Warn => {
                eprintln!(
                    "majak: warning: phony target '{}' names itself as an input; \
                     ignoring [-w phonycycle=warn]",
                    path
                );
                let e = self.state.edge_mut(edge);
                let before = e.ins.len();
                e.ins.retain(|&i| i != out);
                let removed = before - e.ins.len();
                e.explicit_ins -= removed;
                self.state
                    .node_mut(out)
                    .out_edges
                    .retain(|&oe| oe != edge);
            }
        }
        Ok(())
    }
}
