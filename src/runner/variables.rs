//! `$Kraken.{scope}.{key}` substitution in script bodies.
//!
//! Resolution is a single pass over token positions; replacement values are
//! never re-scanned, so a value containing a token spelling cannot trigger
//! further substitution. Lookup order for a token in scope `S` with key `K`:
//!
//! 1. the fully-scoped name `Kraken.S.K` (artifact entries are stored this way)
//! 2. the scoped names across Step, Project, Environment in that precedence
//! 3. the bare key `K`
//!
//! Unknown keys are left textually unchanged.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::types::VariableValue;

const SCOPES_BY_PRECEDENCE: [&str; 3] = ["Step", "Project", "Environment"];

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$Kraken\.(Step|Project|Environment)\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)")
            .unwrap()
    })
}

pub fn resolve_variables(script: &str, variables: &HashMap<String, VariableValue>) -> String {
    let mut out = String::with_capacity(script.len());
    let mut last = 0;

    for caps in token_pattern().captures_iter(script) {
        let whole = caps.get(0).unwrap();
        let scope = &caps[1];
        let key = &caps[2];

        out.push_str(&script[last..whole.start()]);
        match lookup(variables, scope, key) {
            Some(value) => out.push_str(value),
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&script[last..]);
    out
}

fn lookup<'a>(
    variables: &'a HashMap<String, VariableValue>,
    scope: &str,
    key: &str,
) -> Option<&'a str> {
    if let Some(v) = variables.get(&format!("Kraken.{scope}.{key}")) {
        return Some(&v.value);
    }
    for scope in SCOPES_BY_PRECEDENCE {
        if let Some(v) = variables.get(&format!("Kraken.{scope}.{key}")) {
            return Some(&v.value);
        }
    }
    variables.get(key).map(|v| v.value.as_str())
}
