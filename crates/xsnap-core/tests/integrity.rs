//! Integrity pass tests
//!
//! Lockdown, harden, petrify, purify and the alias checker over realistic
//! object graphs.

use xsnap_core::callbacks::CallFrame;
use xsnap_core::harden::is_hardened;
use xsnap_core::object::Collection;
use xsnap_core::{
    Creation, Declaration, KeyId, Machine, MachineError, MachineResult, SlotFlags, SlotRef, Value,
    check_aliases, freeze, harden, is_frozen, lockdown, petrify, purify,
};

fn machine() -> Machine {
    Machine::new(Creation::small()).unwrap()
}

fn locked() -> Machine {
    let mut machine = machine();
    lockdown(&mut machine).unwrap();
    machine
}

fn noop(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Ok(Value::Undefined)
}

fn throwing(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Err(MachineError::type_error("trap"))
}

/// Plain objects, an array, a closure and an accessor, with a cycle
fn plain_graph(machine: &mut Machine) -> SlotRef {
    let root = machine.new_plain_object().unwrap();
    let child = machine.new_plain_object().unwrap();
    let list = machine
        .new_array(&[Value::Reference(child), Value::Integer(2)])
        .unwrap();
    let environment = machine.new_environment(None).unwrap();
    let counter = machine.intern("counter").unwrap();
    machine
        .declare(environment, counter, Value::Reference(root), Declaration::Let)
        .unwrap();
    let function = machine.new_closure(noop, "tick", 0, Some(environment)).unwrap();
    let getter = machine.new_function(noop, "get size", 0).unwrap();

    for (name, value) in [
        ("child", Value::Reference(child)),
        ("list", Value::Reference(list)),
        ("tick", Value::Reference(function)),
    ] {
        let key = machine.intern(name).unwrap();
        machine.set(root, key, value).unwrap();
    }
    let size = machine.intern("size").unwrap();
    machine
        .define_accessor(root, size, Some(getter), None, SlotFlags::empty())
        .unwrap();
    let back = machine.intern("back").unwrap();
    machine.set(child, back, Value::Reference(root)).unwrap();
    root
}

#[test]
fn test_lockdown_harden_global_is_pure() {
    let mut machine = locked();
    let global = machine.global().unwrap();
    harden(&mut machine, Value::Reference(global)).unwrap();
    assert_eq!(purify(&machine, Value::Reference(global)).unwrap(), "");
}

#[test]
fn test_harden_then_purify_is_empty() {
    let mut machine = locked();
    let root = plain_graph(&mut machine);
    assert_ne!(purify(&machine, Value::Reference(root)).unwrap(), "");
    harden(&mut machine, Value::Reference(root)).unwrap();
    assert_eq!(purify(&machine, Value::Reference(root)).unwrap(), "");
}

#[test]
fn test_petrify_then_purify_is_empty_with_internal_data() {
    let mut machine = locked();
    let root = plain_graph(&mut machine);
    let date = machine.new_date(1.0).unwrap();
    let map = machine.new_collection(Collection::Map).unwrap();
    let entry = machine.new_plain_object().unwrap();
    machine.map_set(map, Value::Integer(1), Value::Reference(entry)).unwrap();
    let buffer = machine.new_array_buffer(&[1, 2, 3, 4]).unwrap();
    let view = machine
        .new_typed_array(xsnap_core::slot::ElementType::Uint8, buffer, 0, 4)
        .unwrap();
    let secret = machine.new_symbol(Some("#secret")).unwrap();
    machine.set_private(root, secret, Value::Integer(1)).unwrap();
    for (name, value) in [("date", date), ("map", map), ("view", view)] {
        let key = machine.intern(name).unwrap();
        machine.set(root, key, Value::Reference(value)).unwrap();
    }

    petrify(&mut machine, Value::Reference(root)).unwrap();
    assert_eq!(purify(&machine, Value::Reference(root)).unwrap(), "");
    assert!(is_hardened(&machine, entry));
    assert!(is_hardened(&machine, buffer));
}

#[test]
fn test_harden_is_monotonic() {
    let mut machine = locked();
    let root = plain_graph(&mut machine);
    harden(&mut machine, Value::Reference(root)).unwrap();
    let snapshot: Vec<_> = machine.heap().to_vec();
    harden(&mut machine, Value::Reference(root)).unwrap();
    assert_eq!(machine.heap(), snapshot.as_slice());
    assert!(is_hardened(&machine, root));
}

#[test]
fn test_harden_with_throwing_trap_is_all_or_nothing() {
    let mut machine = locked();
    let root = plain_graph(&mut machine);
    let target = machine.new_plain_object().unwrap();
    let handler = machine.new_plain_object().unwrap();
    let getter = machine.new_function(throwing, "get", 0).unwrap();
    machine
        .define_accessor(
            handler,
            KeyId::PREVENT_EXTENSIONS,
            Some(getter),
            None,
            SlotFlags::empty(),
        )
        .unwrap();
    let proxy = machine.new_proxy(target, handler).unwrap();
    let p = machine.intern("proxy").unwrap();
    machine.set(root, p, Value::Reference(proxy)).unwrap();

    let marked_before = marked(&machine);
    assert!(harden(&mut machine, Value::Reference(root)).is_err());
    assert_eq!(marked(&machine), marked_before);
    assert!(!is_hardened(&machine, root));
}

fn marked(machine: &Machine) -> usize {
    machine
        .heap()
        .iter()
        .filter(|slot| slot.flag.contains(SlotFlags::DONT_MARSHALL))
        .count()
}

#[test]
fn test_freeze_is_idempotent_and_never_fails_twice() {
    let mut machine = machine();
    let root = plain_graph(&mut machine);
    freeze(&mut machine, root, true).unwrap();
    let heap: Vec<_> = machine.heap().to_vec();
    freeze(&mut machine, root, true).unwrap();
    assert_eq!(machine.heap(), heap.as_slice());
    assert!(is_frozen(&machine, root));
}

#[test]
fn test_alias_report_is_symmetric() {
    let build = |first: &str, second: &str| {
        let mut machine = machine();
        let module = machine.new_module("main.js").unwrap();
        let shared = machine.new_plain_object().unwrap();
        machine.alias(shared);
        for name in [first, second] {
            machine
                .export_value(module, name, Value::Reference(shared), Declaration::Const)
                .unwrap();
        }
        check_aliases(&machine)
    };
    let forward = build("a", "b");
    let backward = build("b", "a");
    assert_eq!(forward.diagnostics.len(), 1);
    assert_eq!(backward.diagnostics.len(), 1);
    assert_eq!(forward.diagnostics[0].reason, backward.diagnostics[0].reason);
}

#[test]
fn test_alias_check_survives_cycles() {
    let mut machine = machine();
    let root = plain_graph(&mut machine);
    machine.alias(root);
    let module = machine.new_module("cycle.js").unwrap();
    machine
        .export_value(module, "root", Value::Reference(root), Declaration::Let)
        .unwrap();
    let report = check_aliases(&machine);
    assert_eq!(report.error_count(), 0);
    assert_eq!(
        report
            .diagnostics
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>(),
        vec!["### warning: \"cycle\": root: not frozen".to_string()]
    );
}
