//! Alias checker
//!
//! Audits what the program shares with other machines. Instances and
//! bindings that carry an alias ID are shared by reference, so they must
//! not change: an aliased instance must be frozen and an aliased binding
//! must be const. Generators and regular expressions hold engine state that
//! cannot be shared at all.

use std::fmt;

use rustc_hash::FxHashSet;

use crate::machine::{Machine, Root};
use crate::slot::{KeyId, SlotFlags, SlotKind, Value};
use crate::walker::{Node, Path, Segment, Visit, Walker};
use crate::freeze;

/// Severity of a finding
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Reported, not counted
    Warning,
    /// Counted by [`AliasReport::error_count`]
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Warning => "warning",
            Self::Error => "error",
        })
    }
}

/// One finding
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity
    pub severity: Severity,
    /// Rendered path from the root
    pub path: String,
    /// `not frozen`, `no const`, `generator` or `regexp`
    pub reason: &'static str,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "### {}{}: {}", self.severity, self.path, self.reason)
    }
}

/// Result of an alias check
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasReport {
    /// Findings, in traversal order
    pub diagnostics: Vec<Diagnostic>,
}

impl AliasReport {
    /// Number of errors
    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    /// Number of warnings
    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity == severity)
            .count()
    }
}

struct Checker {
    reported: FxHashSet<u32>,
    report: AliasReport,
}

impl Checker {
    fn visit(&mut self, machine: &Machine, node: Node, path: &Path) -> Visit {
        let slot = machine.slot(node.slot());
        match node {
            Node::Instance(instance) => {
                match machine.internal_value(instance).map(|value| value.kind()) {
                    Some(SlotKind::Generator) => self.push(machine, path, Severity::Error, "generator"),
                    Some(SlotKind::RegExp) => self.push(machine, path, Severity::Error, "regexp"),
                    _ => {}
                }
                if let Some(alias) = slot.id
                    && !freeze::is_frozen(machine, instance)
                    && self.reported.insert(alias)
                {
                    self.push(machine, path, Severity::Warning, "not frozen");
                }
            }
            Node::Binding(_) => {
                if let Some(alias) = slot.id
                    && !slot.flag.contains(SlotFlags::DONT_SET)
                    && self.reported.insert(alias)
                {
                    self.push(machine, path, Severity::Warning, "no const");
                }
            }
            Node::Environment(_) => {}
        }
        Visit::Descend
    }

    fn push(&mut self, machine: &Machine, path: &Path, severity: Severity, reason: &'static str) {
        let diagnostic = Diagnostic {
            severity,
            path: render_path(machine, path),
            reason,
        };
        match severity {
            Severity::Warning => tracing::warn!("{}", diagnostic),
            Severity::Error => tracing::error!("{}", diagnostic),
        }
        self.report.diagnostics.push(diagnostic);
    }
}

/// Check every module export, global and the pending exception
pub fn check_aliases(machine: &Machine) -> AliasReport {
    let mut checker = Checker {
        reported: FxHashSet::default(),
        report: AliasReport::default(),
    };
    let mut visit = |machine: &Machine, node: Node, path: &Path| checker.visit(machine, node, path);
    let mut walker = Walker::new();

    for (specifier, module) in machine.modules() {
        for (name, binding) in machine.exports(module) {
            let prefix = [Segment::Module(specifier), Segment::Export(name)];
            walker.walk(machine, &prefix, Node::Binding(binding), &mut visit);
        }
    }
    if let Ok(global) = machine.global() {
        for (_, slot) in machine.properties(global) {
            let (Some(name), Value::Reference(value)) = (slot.key(), slot.value) else {
                continue;
            };
            if name == KeyId::GLOBAL || name == KeyId::GLOBAL_THIS {
                continue;
            }
            walker.walk(machine, &[Segment::Global(name)], Node::Instance(value), &mut visit);
        }
    }
    if let Value::Reference(exception) = machine.root(Root::Exception) {
        walker.walk(machine, &[], Node::Environment(exception), &mut visit);
    }

    let report = checker.report;
    tracing::debug!(
        nodes = walker.visited_count(),
        errors = report.error_count(),
        warnings = report.warning_count(),
        "alias check"
    );
    report
}

fn render_path(machine: &Machine, path: &Path) -> String {
    let mut out = String::new();
    for segment in path {
        let text = match *segment {
            Segment::Module(key) => {
                let name = machine.key_text(key);
                let stem = match name.rfind('.') {
                    Some(dot) if dot > 0 => &name[..dot],
                    _ => name.as_str(),
                };
                format!(": \"{}\"", stem)
            }
            Segment::Export(key) => format!(": {}", machine.key_text(key)),
            Segment::Global(key) => format!(": globalThis.{}", machine.key_text(key)),
            Segment::Property(key) => format!(".{}", machine.key_text(key)),
            Segment::Item(index) => format!("[{}]", index),
            Segment::Getter(key) => format!(".get {}", machine.key_text(key)),
            Segment::Setter(key) => format!(".set {}", machine.key_text(key)),
            Segment::Variable(key) => format!("() {}", machine.key_text(key)),
            Segment::ProxyHandler => ".(handler)".to_string(),
            Segment::ProxyTarget => ".(target)".to_string(),
            Segment::Private(key) => format!(
                ".#{}",
                machine.key_name(key).unwrap_or_default().trim_start_matches('#')
            ),
            Segment::Entry(index) => format!("{{{}}}", index),
            Segment::Prototype => ".__proto__".to_string(),
            Segment::Buffer => ".(buffer)".to_string(),
            Segment::Closures | Segment::Outer | Segment::Value => continue,
        };
        out.push_str(&text);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::Creation;
    use crate::modules::Declaration;

    fn machine() -> Machine {
        Machine::new(Creation::small()).unwrap()
    }

    #[test]
    fn test_clean_machine_has_no_findings() {
        let machine = machine();
        assert_eq!(check_aliases(&machine), AliasReport::default());
    }

    #[test]
    fn test_aliased_export_is_reported_once() {
        let mut machine = machine();
        let module = machine.new_module("main.js").unwrap();
        let shared = machine.new_object(None).unwrap();
        machine.alias(shared);
        machine
            .export_value(module, "a", Value::Reference(shared), Declaration::Const)
            .unwrap();
        machine
            .export_value(module, "b", Value::Reference(shared), Declaration::Const)
            .unwrap();
        let report = check_aliases(&machine);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(
            report.diagnostics[0].to_string(),
            "### warning: \"main\": a: not frozen"
        );
        assert_eq!(report.error_count(), 0);
    }

    #[test]
    fn test_aliased_let_binding() {
        let mut machine = machine();
        let module = machine.new_module("lib.js").unwrap();
        let binding = machine
            .export_value(module, "count", Value::Integer(0), Declaration::Let)
            .unwrap();
        machine.alias(binding);
        let report = check_aliases(&machine);
        assert_eq!(
            report.diagnostics[0].to_string(),
            "### warning: \"lib\": count: no const"
        );
    }

    #[test]
    fn test_generator_and_regexp_are_errors() {
        let mut machine = machine();
        let global = machine.global().unwrap();
        let holder = machine.new_object(None).unwrap();
        let generator = machine.new_generator().unwrap();
        let regexp = machine.new_regexp("a", "g").unwrap();
        let g = machine.intern("g").unwrap();
        let r = machine.intern("r").unwrap();
        machine.set(holder, g, Value::Reference(generator)).unwrap();
        machine.set(holder, r, Value::Reference(regexp)).unwrap();
        let h = machine.intern("holder").unwrap();
        machine.set(global, h, Value::Reference(holder)).unwrap();
        let report = check_aliases(&machine);
        assert_eq!(report.error_count(), 2);
        let lines: Vec<String> = report.diagnostics.iter().map(|d| d.to_string()).collect();
        assert!(lines.contains(&"### error: globalThis.holder.g: generator".to_string()));
        assert!(lines.contains(&"### error: globalThis.holder.r: regexp".to_string()));
    }

    #[test]
    fn test_frozen_alias_is_clean() {
        let mut machine = machine();
        let module = machine.new_module("main.js").unwrap();
        let shared = machine.new_object(None).unwrap();
        machine.alias(shared);
        freeze::freeze(&mut machine, shared, false).unwrap();
        machine
            .export_value(module, "a", Value::Reference(shared), Declaration::Const)
            .unwrap();
        assert!(check_aliases(&machine).diagnostics.is_empty());
    }

    #[test]
    fn test_self_prototype_terminates() {
        let mut machine = machine();
        let global = machine.global().unwrap();
        let a = machine.new_object(None).unwrap();
        machine.set_header_prototype(a, Some(a));
        machine.alias(a);
        let key = machine.intern("a").unwrap();
        machine.set(global, key, Value::Reference(a)).unwrap();
        let report = check_aliases(&machine);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(
            report.diagnostics[0].to_string(),
            "### warning: globalThis.a: not frozen"
        );
    }
}
