//! Represents parsed manifest strings with embedded variable references,
//! e.g. `c++ $in -o $out`, and the scope machinery for expanding them.
//!
//! Scopes form a chain: each `include`d file shares its parent's scope while
//! `subninja` introduces a child.  Rather than linking scopes with pointers,
//! they live in an arena and refer to their parent by id.

use crate::densemap::{dense_id, DenseMap};
use crate::smallmap::SmallMap;
use std::{borrow::Cow, collections::HashMap};

/// An environment providing a mapping of variable name to variable value.
/// A given EvalString may be expanded with multiple environments as possible
/// context.
pub trait Env {
    fn get_var(&self, var: &str) -> Option<Cow<str>>;
}

/// One token within an EvalString, either literal text or a variable
/// reference.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalPart<T: AsRef<str>> {
    Literal(T),
    VarRef(T),
}

/// A parsed but unexpanded variable-reference string, e.g. "cc $in -o $out".
/// This is generic to support EvalString<&str>, which is used for
/// immediately-expanded evals like top-level bindings, and EvalString<String>,
/// which is used for delayed evals like in `rule` blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalString<T: AsRef<str>>(Vec<EvalPart<T>>);

impl<T: AsRef<str>> EvalString<T> {
    pub fn new(parts: Vec<EvalPart<T>>) -> Self {
        EvalString(parts)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn evaluate(&self, envs: &[&dyn Env]) -> String {
        let mut val = String::new();
        for part in &self.0 {
            match part {
                EvalPart::Literal(s) => val.push_str(s.as_ref()),
                EvalPart::VarRef(v) => {
                    for env in envs {
                        if let Some(v) = env.get_var(v.as_ref()) {
                            val.push_str(&v);
                            break;
                        }
                    }
                }
            }
        }
        val
    }
}

impl EvalString<&str> {
    pub fn into_owned(self) -> EvalString<String> {
        EvalString(
            self.0
                .into_iter()
                .map(|part| match part {
                    EvalPart::Literal(s) => EvalPart::Literal(s.to_owned()),
                    EvalPart::VarRef(s) => EvalPart::VarRef(s.to_owned()),
                })
                .collect(),
        )
    }
}

dense_id!(RuleId);
dense_id!(ScopeId);

/// A named collection of delayed bindings, e.g.
///   rule cc
///     command = gcc -c $in -o $out
/// The bindings stay unevaluated until a concrete edge provides $in/$out.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    pub bindings: SmallMap<String, EvalString<String>>,
}

/// The well-known rule binding names; anything else on a rule is a parse
/// error.
pub fn is_reserved_rule_binding(var: &str) -> bool {
    matches!(
        var,
        "command"
            | "depfile"
            | "description"
            | "deps"
            | "generator"
            | "pool"
            | "restat"
            | "rspfile"
            | "rspfile_content"
            | "msvc_deps_prefix"
    )
}

/// One scope's worth of variable and rule definitions.  Variables are stored
/// already evaluated; rules keep their bindings lazy.
#[derive(Default, Debug)]
struct Scope {
    bindings: HashMap<String, String>,
    rules: HashMap<String, RuleId>,
    parent: Option<ScopeId>,
}

/// Arena of all scopes seen while loading the manifest, plus the rules they
/// declare.
#[derive(Debug)]
pub struct Scopes {
    scopes: DenseMap<ScopeId, Scope>,
    rules: DenseMap<RuleId, Rule>,
}

impl Scopes {
    /// Create the file-level root scope.
    pub fn new() -> (Scopes, ScopeId) {
        let mut scopes = Scopes {
            scopes: DenseMap::new(),
            rules: DenseMap::new(),
        };
        let root = scopes.scopes.push(Scope::default());
        (scopes, root)
    }

    /// Create a child scope, as for `subninja`.
    pub fn push_scope(&mut self, parent: ScopeId) -> ScopeId {
        self.scopes.push(Scope {
            parent: Some(parent),
            ..Scope::default()
        })
    }

    pub fn add_binding(&mut self, scope: ScopeId, name: String, val: String) {
        self.scopes.get_mut(scope).bindings.insert(name, val);
    }

    /// Walk the scope chain for a variable; innermost binding wins.
    pub fn lookup(&self, mut scope: ScopeId, var: &str) -> Option<&str> {
        loop {
            let s = self.scopes.get(scope);
            if let Some(val) = s.bindings.get(var) {
                return Some(val);
            }
            scope = s.parent?;
        }
    }

    /// Variable lookup with a rule binding as fallback: the scope's own
    /// bindings win, then the rule's lazy binding evaluated against `env`,
    /// then parent scopes.  Mirrors how per-edge variables shadow rule
    /// variables which shadow file-level ones.
    pub fn lookup_with_fallback(
        &self,
        scope: ScopeId,
        var: &str,
        fallback: Option<&EvalString<String>>,
        env: &dyn Env,
    ) -> Option<String> {
        let s = self.scopes.get(scope);
        if let Some(val) = s.bindings.get(var) {
            return Some(val.clone());
        }
        if let Some(eval) = fallback {
            return Some(eval.evaluate(&[env]));
        }
        self.lookup_with_fallback(s.parent?, var, fallback, env)
    }

    pub fn add_rule(&mut self, scope: ScopeId, rule: Rule) -> RuleId {
        let name = rule.name.clone();
        let id = self.rules.push(rule);
        self.scopes.get_mut(scope).rules.insert(name, id);
        id
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        self.rules.get(id)
    }

    /// Look a rule up through the scope chain.
    pub fn lookup_rule(&self, mut scope: ScopeId, name: &str) -> Option<RuleId> {
        loop {
            let s = self.scopes.get(scope);
            if let Some(&id) = s.rules.get(name) {
                return Some(id);
            }
            scope = s.parent?;
        }
    }

    /// Look a rule up in one scope only, for duplicate detection.
    pub fn lookup_rule_current_scope(&self, scope: ScopeId, name: &str) -> Option<RuleId> {
        self.scopes.get(scope).rules.get(name).copied()
    }
}

/// Adapter exposing one scope chain as an Env for EvalString::evaluate.
pub struct ScopeEnv<'a> {
    pub scopes: &'a Scopes,
    pub scope: ScopeId,
}

impl<'a> Env for ScopeEnv<'a> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.scopes.lookup(self.scope, var).map(Cow::Borrowed)
    }
}
