//! Purity check
//!
//! Read-only audit of the graph harden would walk. Every violation becomes
//! one `<path>: <reason>` line; an empty report means the value is pure.

use crate::error::{MachineError, MachineResult};
use crate::harden::PETRIFIED_KINDS;
use crate::machine::Machine;
use crate::slot::{KeyId, Slot, SlotFlags, SlotKind, Value};
use crate::walker::{Node, Path, Segment, Visit, Walker};

/// Audit `value` and everything reachable from it. Needs lockdown.
pub fn purify(machine: &Machine, value: Value) -> MachineResult<String> {
    if !machine.is_locked_down() {
        return Err(MachineError::type_error("purify requires lockdown"));
    }
    let Value::Reference(root) = value else {
        return Ok(String::new());
    };
    let mut report = String::new();
    let mut violations = 0usize;
    let mut visit = |machine: &Machine, node: Node, path: &Path| {
        let base = render_path(machine, path);
        let mut emit = |suffix: &str, reason: &str| {
            violations += 1;
            let at = format!("{}{}", base, suffix);
            let at = if at.is_empty() { "(root)" } else { at.as_str() };
            report.push_str(&format!("{}: {}\n", at, reason));
        };
        let slot = machine.slot(node.slot());
        if !slot.flag.contains(SlotFlags::DONT_MARSHALL) {
            emit("", "not hardened");
        }
        match node {
            Node::Instance(instance) => {
                if machine.is_extensible(instance) {
                    emit("", "extensible");
                }
                for (_, slot) in machine.chain(instance) {
                    if slot.is_internal() {
                        audit_internal(machine, instance, slot, &mut emit);
                        continue;
                    }
                    let Some(key) = slot.key() else {
                        continue;
                    };
                    let at = property_path(machine, key);
                    if !slot.flag.contains(SlotFlags::DONT_DELETE) {
                        emit(&at, "configurable");
                    }
                    if slot.kind() != SlotKind::Accessor && !slot.flag.contains(SlotFlags::DONT_SET) {
                        emit(&at, "writable");
                    }
                }
            }
            Node::Environment(environment) => {
                if machine.is_extensible(environment) {
                    emit("", "extensible");
                }
            }
            Node::Binding(_) => {
                if !slot.flag.contains(SlotFlags::DONT_SET) {
                    emit("", "not const");
                }
            }
        }
        Visit::Descend
    };
    Walker::new().walk(machine, &[], Node::Instance(root), &mut visit);
    tracing::debug!(violations, "purify");
    Ok(report)
}

fn audit_internal(
    machine: &Machine,
    instance: crate::slot::SlotRef,
    slot: &Slot,
    emit: &mut impl FnMut(&str, &str),
) {
    if slot.flag.contains(SlotFlags::DONT_SET) {
        return;
    }
    match slot.kind() {
        SlotKind::Array => {
            for index in 0..machine.array_length(instance).unwrap_or(0) {
                emit(&format!("[{}]", index), "writable");
            }
        }
        kind if PETRIFIED_KINDS.contains(&kind) => {
            emit("", internal_reason(kind));
        }
        _ => {}
    }
}

fn internal_reason(kind: SlotKind) -> &'static str {
    match kind {
        SlotKind::ArrayBuffer => "mutable [[ArrayBufferData]]",
        SlotKind::Date => "mutable [[DateValue]]",
        SlotKind::Map => "mutable [[MapData]]",
        SlotKind::Set => "mutable [[SetData]]",
        SlotKind::WeakMap => "mutable [[WeakMapData]]",
        SlotKind::WeakSet => "mutable [[WeakSetData]]",
        _ => "mutable [[PrivateElements]]",
    }
}

fn property_path(machine: &Machine, key: KeyId) -> String {
    let text = machine.key_text(key);
    if machine.is_symbol(key) {
        text
    } else {
        format!(".{}", text)
    }
}

fn render_path(machine: &Machine, path: &Path) -> String {
    let mut out = String::new();
    for segment in path {
        match *segment {
            Segment::Module(key)
            | Segment::Export(key)
            | Segment::Global(key)
            | Segment::Property(key)
            | Segment::Variable(key) => out.push_str(&property_path(machine, key)),
            Segment::Item(index) => out.push_str(&format!("[{}]", index)),
            Segment::Getter(key) => out.push_str(&format!(".get {}", machine.key_text(key))),
            Segment::Setter(key) => out.push_str(&format!(".set {}", machine.key_text(key))),
            Segment::Prototype => out.push_str(".__proto__"),
            Segment::Closures => out.push_str("[[Environment]]"),
            Segment::Outer => out.push_str("[[Outer]]"),
            Segment::ProxyHandler => out.push_str("[[ProxyHandler]]"),
            Segment::ProxyTarget => out.push_str("[[ProxyTarget]]"),
            Segment::Private(key) => {
                let name = machine.key_name(key).unwrap_or_default();
                out.push_str(&format!(".#{}", name.trim_start_matches('#')));
            }
            Segment::Entry(index) => out.push_str(&format!("{{{}}}", index)),
            Segment::Buffer => out.push_str("[[ViewedArrayBuffer]]"),
            Segment::Value => {}
        }
    }
    out
}
