//! Harden and petrify
//!
//! Transitive freezing of everything reachable from a value, after lockdown.
//! Hardened nodes carry DONT_MARSHALL, which is also how a later call knows
//! to stop. A failure anywhere in the pass removes the marks this call set,
//! so a value is either hardened as a whole or not marked at all.

use std::collections::VecDeque;

use crate::callbacks::CallFrame;
use crate::error::{MachineError, MachineResult};
use crate::freeze;
use crate::machine::Machine;
use crate::slot::{SlotFlags, SlotKind, SlotRef, Value};
use crate::walker::{self, Node};

/// Internal slots locked by petrify
pub(crate) const PETRIFIED_KINDS: [SlotKind; 7] = [
    SlotKind::ArrayBuffer,
    SlotKind::Date,
    SlotKind::Map,
    SlotKind::Set,
    SlotKind::WeakMap,
    SlotKind::WeakSet,
    SlotKind::Private,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Depth {
    Harden,
    Petrify,
}

/// Harden `value` and everything reachable from it. Primitives are returned
/// unchanged. Needs lockdown.
pub fn harden(machine: &mut Machine, value: Value) -> MachineResult<Value> {
    fortify(machine, value, Depth::Harden)
}

/// Harden, then also lock the internal data of buffers, dates, keyed
/// collections and private fields.
pub fn petrify(machine: &mut Machine, value: Value) -> MachineResult<Value> {
    fortify(machine, value, Depth::Petrify)
}

fn fortify(machine: &mut Machine, value: Value, depth: Depth) -> MachineResult<Value> {
    if !machine.is_locked_down() {
        return Err(MachineError::type_error("harden requires lockdown"));
    }
    let Value::Reference(root) = value else {
        return Ok(value);
    };
    let mut marked = Vec::new();
    match fortify_graph(machine, root, depth, &mut marked) {
        Ok(()) => {
            tracing::debug!(count = marked.len(), ?depth, "hardened");
            Ok(value)
        }
        Err(error) => {
            for slot in &marked {
                machine.slot_mut(*slot).flag.remove(SlotFlags::DONT_MARSHALL);
            }
            tracing::debug!(rolled_back = marked.len(), %error, "harden failed");
            Err(error)
        }
    }
}

fn fortify_graph(
    machine: &mut Machine,
    root: SlotRef,
    depth: Depth,
    marked: &mut Vec<SlotRef>,
) -> MachineResult<()> {
    let mut queue = VecDeque::from([Node::Instance(root)]);
    while let Some(node) = queue.pop_front() {
        let slot = node.slot();
        let Some(current) = machine.get_slot(slot) else {
            continue;
        };
        if current.flag.contains(SlotFlags::DONT_MARSHALL) {
            continue;
        }
        match node {
            Node::Instance(instance) => {
                freeze::freeze(machine, instance, false)?;
                if depth == Depth::Petrify {
                    lock_internals(machine, instance);
                }
            }
            Node::Environment(environment) => {
                freeze::freeze(machine, environment, false)?;
                for (_, binding) in machine.bindings(environment) {
                    machine.slot_mut(binding).flag.insert(SlotFlags::DONT_SET);
                }
            }
            Node::Binding(binding) => {
                machine.slot_mut(binding).flag.insert(SlotFlags::DONT_SET);
            }
        }
        machine.slot_mut(slot).flag.insert(SlotFlags::DONT_MARSHALL);
        marked.push(slot);
        queue.extend(walker::edges(machine, node).into_iter().map(|edge| edge.node));
    }
    Ok(())
}

fn lock_internals(machine: &mut Machine, instance: SlotRef) {
    let internals: Vec<SlotRef> = machine
        .chain(instance)
        .take_while(|(_, slot)| slot.is_internal())
        .filter(|(_, slot)| PETRIFIED_KINDS.contains(&slot.kind()))
        .map(|(r, _)| r)
        .collect();
    for r in internals {
        machine.slot_mut(r).flag.insert(SlotFlags::DONT_SET);
    }
}

/// Is this node marked hardened
pub fn is_hardened(machine: &Machine, slot: SlotRef) -> bool {
    machine
        .get_slot(slot)
        .is_some_and(|slot| slot.flag.contains(SlotFlags::DONT_MARSHALL))
}

pub(crate) fn fx_harden(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
    harden(machine, frame.arg(0))
}

pub(crate) fn fx_petrify(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
    petrify(machine, frame.arg(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::Creation;
    use crate::lockdown::lockdown;
    use crate::modules::Declaration;
    use crate::object::Collection;
    use crate::purify::purify;
    use crate::slot::KeyId;

    fn locked() -> Machine {
        let mut machine = Machine::new(Creation::small()).unwrap();
        lockdown(&mut machine).unwrap();
        machine
    }

    #[test]
    fn test_harden_needs_lockdown() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let object = machine.new_plain_object().unwrap();
        assert!(harden(&mut machine, Value::Reference(object))
            .unwrap_err()
            .is_type_error());
        assert!(!is_hardened(&machine, object));
    }

    #[test]
    fn test_primitives_pass_through() {
        let mut machine = locked();
        assert_eq!(harden(&mut machine, Value::Integer(3)).unwrap(), Value::Integer(3));
    }

    #[test]
    fn test_harden_reaches_closures() {
        fn noop(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
            Ok(Value::Undefined)
        }
        let mut machine = locked();
        let environment = machine.new_environment(None).unwrap();
        let x = machine.intern("x").unwrap();
        let binding = machine
            .declare(environment, x, Value::Integer(1), Declaration::Let)
            .unwrap();
        let function = machine.new_closure(noop, "f", 0, Some(environment)).unwrap();
        harden(&mut machine, Value::Reference(function)).unwrap();
        assert!(is_hardened(&machine, function));
        assert!(is_hardened(&machine, environment));
        assert!(is_hardened(&machine, binding));
        assert!(machine
            .write_binding(binding, Value::Integer(2))
            .unwrap_err()
            .is_type_error());
    }

    #[test]
    fn test_petrify_locks_internal_data() {
        let mut machine = locked();
        let date = machine.new_date(0.0).unwrap();
        let map = machine.new_collection(Collection::Map).unwrap();
        let holder = machine.new_plain_object().unwrap();
        let d = machine.intern("d").unwrap();
        let m = machine.intern("m").unwrap();
        machine.set(holder, d, Value::Reference(date)).unwrap();
        machine.set(holder, m, Value::Reference(map)).unwrap();

        harden(&mut machine, Value::Reference(holder)).unwrap();
        machine.set_date_value(date, 1.0).unwrap();

        // already hardened nodes are skipped, so petrify a fresh graph
        let fresh = machine.new_date(0.0).unwrap();
        petrify(&mut machine, Value::Reference(fresh)).unwrap();
        assert!(machine.set_date_value(fresh, 1.0).unwrap_err().is_type_error());
        let map = machine.new_collection(Collection::Map).unwrap();
        petrify(&mut machine, Value::Reference(map)).unwrap();
        assert!(machine.map_set(map, Value::Integer(1), Value::Null).is_err());
    }

    #[test]
    fn test_failed_harden_rolls_back_marks() {
        fn refuse(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
            Err(MachineError::type_error("no"))
        }
        let mut machine = locked();
        let target = machine.new_plain_object().unwrap();
        let handler = machine.new_plain_object().unwrap();
        let getter = machine.new_function(refuse, "get preventExtensions", 0).unwrap();
        machine
            .define_accessor(handler, KeyId::PREVENT_EXTENSIONS, Some(getter), None, SlotFlags::empty())
            .unwrap();
        let proxy = machine.new_proxy(target, handler).unwrap();
        let holder = machine.new_plain_object().unwrap();
        let p = machine.intern("p").unwrap();
        machine.set(holder, p, Value::Reference(proxy)).unwrap();

        assert!(harden(&mut machine, Value::Reference(holder)).is_err());
        assert!(!is_hardened(&machine, holder));
        assert!(!is_hardened(&machine, proxy));
        // freezing is not undone
        assert!(freeze::is_frozen(&machine, holder));
        let report = purify(&machine, Value::Reference(holder)).unwrap();
        assert!(report.contains("(root): not hardened\n"));
        assert!(report.contains(".p: not hardened\n"));
    }

    #[test]
    fn test_self_prototype_terminates() {
        let mut machine = locked();
        let a = machine.new_plain_object().unwrap();
        machine.set_header_prototype(a, Some(a));
        harden(&mut machine, Value::Reference(a)).unwrap();
        assert!(is_hardened(&machine, a));
        petrify(&mut machine, Value::Reference(a)).unwrap();
    }
}
