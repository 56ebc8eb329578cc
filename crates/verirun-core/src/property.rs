//! Property resolution
//!
//! A property arrives either as a property file (SV-COMP `.prp` style),
//! as one of a few shortcut names, or as an inline `CHECK( ... )` line.
//! Whatever the input, it is resolved once into a [`Property`] before the
//! run starts.

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Entry function used when the property does not name one
pub const DEFAULT_ENTRY: &str = "main";

/// Function whose reachability is checked by default
pub const DEFAULT_ERROR_FUNCTION: &str = "reach_error";

/// Shortcut names accepted by `--prp`
pub const SHORTCUTS: &[&str] = &[
    "null-deref",
    "valid-deref",
    "valid-free",
    "valid-memtrack",
    "memsafety",
    "memcleanup",
    "undefined-behavior",
    "signed-overflow",
    "termination",
    "reach",
    "unreach-call",
];

/// One checked property
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyKind {
    /// The given function is never called
    UnreachCall { function: String },
    /// All pointer dereferences are valid
    ValidDeref,
    /// All `free` calls are valid
    ValidFree,
    /// All allocated memory is tracked
    ValidMemtrack,
    /// All allocated memory is freed before exit
    ValidMemcleanup,
    /// No signed integer overflow
    NoOverflow,
    /// No undefined behavior
    UndefinedBehavior,
    /// Every path terminates
    Termination,
    /// A formula this tool does not recognize
    Ltl(String),
}

impl PropertyKind {
    /// LTL formula of this property
    pub fn ltl(&self) -> String {
        match self {
            PropertyKind::UnreachCall { function } => format!("G ! call({function}())"),
            PropertyKind::ValidDeref => "G valid-deref".to_string(),
            PropertyKind::ValidFree => "G valid-free".to_string(),
            PropertyKind::ValidMemtrack => "G valid-memtrack".to_string(),
            PropertyKind::ValidMemcleanup => "G valid-memcleanup".to_string(),
            PropertyKind::NoOverflow => "G ! overflow".to_string(),
            PropertyKind::UndefinedBehavior => "G def-behavior".to_string(),
            PropertyKind::Termination => "F end".to_string(),
            PropertyKind::Ltl(formula) => formula.clone(),
        }
    }

    /// Tag printed inside `false(...)`
    pub fn result_tag(&self) -> &str {
        match self {
            PropertyKind::UnreachCall { .. } => "unreach-call",
            PropertyKind::ValidDeref => "valid-deref",
            PropertyKind::ValidFree => "valid-free",
            PropertyKind::ValidMemtrack => "valid-memtrack",
            PropertyKind::ValidMemcleanup => "valid-memcleanup",
            PropertyKind::NoOverflow => "no-overflow",
            PropertyKind::UndefinedBehavior => "undefined-behavior",
            PropertyKind::Termination => "termination",
            PropertyKind::Ltl(_) => "property",
        }
    }

    /// Recognize a formula, falling back to [`PropertyKind::Ltl`]
    pub fn from_ltl(formula: &str) -> Self {
        let normalized: String = formula.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "G valid-deref" => PropertyKind::ValidDeref,
            "G valid-free" => PropertyKind::ValidFree,
            "G valid-memtrack" => PropertyKind::ValidMemtrack,
            "G valid-memcleanup" => PropertyKind::ValidMemcleanup,
            "G ! overflow" => PropertyKind::NoOverflow,
            "G def-behavior" => PropertyKind::UndefinedBehavior,
            "F end" => PropertyKind::Termination,
            other => match unreach_call_regex().captures(other) {
                Some(caps) => PropertyKind::UnreachCall {
                    function: caps[1].to_string(),
                },
                None => PropertyKind::Ltl(other.to_string()),
            },
        }
    }

    /// Memory-safety properties checked through instrumentation
    pub fn is_memory_safety(&self) -> bool {
        matches!(
            self,
            PropertyKind::ValidDeref
                | PropertyKind::ValidFree
                | PropertyKind::ValidMemtrack
                | PropertyKind::ValidMemcleanup
        )
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.result_tag())
    }
}

/// A resolved property: entry function plus the checked formulas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub entry: String,
    pub kinds: Vec<PropertyKind>,
}

impl Default for Property {
    fn default() -> Self {
        Self::reachability(DEFAULT_ERROR_FUNCTION)
    }
}

impl Property {
    /// Unreachability of `function` from `main`
    pub fn reachability(function: &str) -> Self {
        Self {
            entry: DEFAULT_ENTRY.to_string(),
            kinds: vec![PropertyKind::UnreachCall {
                function: function.to_string(),
            }],
        }
    }

    fn with_kinds(kinds: Vec<PropertyKind>) -> Self {
        Self {
            entry: DEFAULT_ENTRY.to_string(),
            kinds,
        }
    }

    /// Resolve a `--prp` argument
    ///
    /// Tries, in order: an existing file, a shortcut name, an inline
    /// `CHECK( ... )` line.
    pub fn resolve(spec: &str) -> Result<Self, ConfigError> {
        let path = Path::new(spec);
        if path.is_file() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::property(spec, format!("cannot read file: {e}")))?;
            return Self::parse(&text).map_err(|reason| ConfigError::property(spec, reason));
        }

        if let Some(property) = Self::from_shortcut(spec) {
            return Ok(property);
        }

        if spec.contains("CHECK(") {
            return Self::parse(spec).map_err(|reason| ConfigError::property(spec, reason));
        }

        Err(ConfigError::property(
            spec,
            format!(
                "not a property file, a CHECK line, or a shortcut ({})",
                SHORTCUTS.join(", ")
            ),
        ))
    }

    /// Map a shortcut name to its property
    pub fn from_shortcut(name: &str) -> Option<Self> {
        let kinds = match name {
            "null-deref" | "valid-deref" => vec![PropertyKind::ValidDeref],
            "valid-free" => vec![PropertyKind::ValidFree],
            "valid-memtrack" => vec![PropertyKind::ValidMemtrack],
            "memsafety" => vec![
                PropertyKind::ValidDeref,
                PropertyKind::ValidFree,
                PropertyKind::ValidMemtrack,
            ],
            "memcleanup" => vec![PropertyKind::ValidMemcleanup],
            "undefined-behavior" => vec![PropertyKind::UndefinedBehavior],
            "signed-overflow" => vec![PropertyKind::NoOverflow],
            "termination" => vec![PropertyKind::Termination],
            "reach" | "unreach-call" => return Some(Self::default()),
            _ => return None,
        };
        Some(Self::with_kinds(kinds))
    }

    /// Parse property-file text made of `CHECK( init(f()), LTL(...) )` lines
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut entry: Option<String> = None;
        let mut kinds = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let caps = check_line_regex()
                .captures(line)
                .ok_or_else(|| format!("line {}: malformed property '{line}'", lineno + 1))?;

            let init = caps[1].to_string();
            match &entry {
                Some(existing) if *existing != init => {
                    return Err(format!(
                        "line {}: entry function '{init}' differs from '{existing}'",
                        lineno + 1
                    ));
                }
                Some(_) => {}
                None => entry = Some(init),
            }

            let kind = PropertyKind::from_ltl(&caps[2]);
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        match entry {
            Some(entry) if !kinds.is_empty() => Ok(Self { entry, kinds }),
            _ => Err("no properties found".to_string()),
        }
    }

    /// The property in property-file form, one `CHECK` line per formula
    pub fn to_prp(&self) -> String {
        self.kinds
            .iter()
            .map(|kind| format!("CHECK( init({}()), LTL({}) )\n", self.entry, kind.ltl()))
            .collect()
    }

    /// First checked property, used when a backend cannot tell which one failed
    pub fn primary(&self) -> &PropertyKind {
        &self.kinds[0]
    }

    pub fn contains(&self, kind: &PropertyKind) -> bool {
        self.kinds.contains(kind)
    }

    pub fn is_memory_safety(&self) -> bool {
        self.kinds.iter().any(PropertyKind::is_memory_safety)
    }

    /// Whether checking this property needs an instrumentation pass
    pub fn requires_instrumentation(&self) -> bool {
        self.kinds.iter().any(|kind| {
            kind.is_memory_safety()
                || matches!(
                    kind,
                    PropertyKind::NoOverflow | PropertyKind::UndefinedBehavior
                )
        })
    }

    /// Instrumentation configuration directory for this property
    pub fn instrumentation_set(&self) -> Option<&'static str> {
        if self.is_memory_safety() {
            Some("memsafety")
        } else if self.requires_instrumentation() {
            Some("int_overflows")
        } else {
            None
        }
    }

    /// Default slicing criterion derived from the property
    pub fn slicing_criterion(&self) -> String {
        let mut criteria: Vec<String> = Vec::new();
        for kind in &self.kinds {
            let criterion = match kind {
                PropertyKind::UnreachCall { function } => function.clone(),
                PropertyKind::Termination => "__VERIFIER_exit".to_string(),
                PropertyKind::Ltl(_) => DEFAULT_ERROR_FUNCTION.to_string(),
                _ => "__INSTR_check".to_string(),
            };
            if !criteria.contains(&criterion) {
                criteria.push(criterion);
            }
        }
        criteria.join(",")
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.kinds.iter().map(PropertyKind::result_tag).collect();
        write!(f, "{}", tags.join(","))
    }
}

fn check_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^CHECK\(\s*init\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(\s*\)\s*\)\s*,\s*LTL\((.*)\)\s*\)$")
            .expect("valid property regex")
    })
}

fn unreach_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^G ! call\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\(\s*\)\s*\)$")
            .expect("valid unreach-call regex")
    })
}
