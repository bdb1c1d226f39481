//! Freezing
//!
//! `Object.freeze` over the slot model, and the table of built-ins frozen
//! by lockdown.

use rustc_hash::FxHashSet;

use crate::error::{MachineError, MachineResult};
use crate::machine::{Machine, Root};
use crate::realm::{Intrinsic, IntrinsicGroup, InternalAccessor};
use crate::slot::{KeyId, SlotFlags, SlotKind, SlotRef, Value};
use crate::keys::well_known;

/// Freeze an instance. With `deep`, also freeze every instance reachable
/// through own property values, accessor functions and array items.
///
/// Freezing a frozen instance does nothing and cannot fail.
pub fn freeze(machine: &mut Machine, instance: SlotRef, deep: bool) -> MachineResult<()> {
    if !deep {
        return freeze_one(machine, instance);
    }
    let mut seen = FxHashSet::default();
    let mut pending = vec![instance];
    while let Some(current) = pending.pop() {
        if !seen.insert(current) {
            continue;
        }
        freeze_one(machine, current)?;
        pending.extend(own_references(machine, current).into_iter().rev());
    }
    Ok(())
}

fn own_references(machine: &Machine, instance: SlotRef) -> Vec<SlotRef> {
    let mut references = Vec::new();
    for (_, slot) in machine.properties(instance) {
        match slot.value {
            Value::Reference(r) => references.push(r),
            Value::Accessor { getter, setter } => {
                references.extend(getter);
                references.extend(setter);
            }
            _ => {}
        }
    }
    if machine.internal(instance, SlotKind::Array).is_some() {
        // a damaged store freezes as empty
        for item in machine.array_items(instance).unwrap_or_default() {
            references.extend(item.as_reference());
        }
    }
    references
        .into_iter()
        .filter(|r| machine.is_instance(*r))
        .collect()
}

fn freeze_one(machine: &mut Machine, instance: SlotRef) -> MachineResult<()> {
    if !machine.is_instance(instance) {
        return Err(MachineError::type_error(format!("{} is not an object", instance)));
    }
    if is_frozen(machine, instance) {
        return Ok(());
    }
    if let Some((handler, target)) = machine.proxy_parts(instance) {
        let (Some(handler), Some(target)) = (handler, target) else {
            return Err(MachineError::type_error("proxy has been revoked"));
        };
        let trap = machine.get(handler, KeyId::PREVENT_EXTENSIONS)?;
        if trap == Value::Undefined {
            freeze_one(machine, target)?;
        } else {
            let result = machine.call(trap, Value::Reference(handler), &[Value::Reference(target)])?;
            if !result.is_truthy() {
                return Err(MachineError::type_error("proxy refused to prevent extensions"));
            }
        }
        machine.slot_mut(instance).flag.insert(SlotFlags::DONT_PATCH);
        return Ok(());
    }

    machine.slot_mut(instance).flag.insert(SlotFlags::DONT_PATCH);
    let slots: Vec<SlotRef> = machine.chain(instance).map(|(r, _)| r).collect();
    for r in slots {
        let slot = machine.slot_mut(r);
        if slot.is_internal() {
            if slot.kind() == SlotKind::Array {
                slot.flag.insert(SlotFlags::DONT_SET);
            }
            continue;
        }
        slot.flag.insert(SlotFlags::DONT_DELETE);
        if slot.kind() != SlotKind::Accessor {
            slot.flag.insert(SlotFlags::DONT_SET);
        }
    }
    tracing::trace!(%instance, "frozen");
    Ok(())
}

/// `Object.isFrozen`
pub fn is_frozen(machine: &Machine, instance: SlotRef) -> bool {
    if machine.is_extensible(instance) {
        return false;
    }
    if machine.proxy_parts(instance).is_some() {
        return true;
    }
    machine.chain(instance).all(|(_, slot)| {
        if slot.is_internal() {
            return slot.kind() != SlotKind::Array || slot.flag.contains(SlotFlags::DONT_SET);
        }
        slot.flag.contains(SlotFlags::DONT_DELETE)
            && (slot.kind() == SlotKind::Accessor || slot.flag.contains(SlotFlags::DONT_SET))
    })
}

/// Entry of the built-in freeze table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    /// Every intrinsic of a group, in stack order
    Group(IntrinsicGroup),
    /// Getter and setter of an internal accessor
    Accessor(InternalAccessor),
    /// `Array.prototype[Symbol.unscopables]`
    Unscopables,
    /// Instance held by a machine root
    Root(Root),
}

/// Built-ins frozen by lockdown, in order
pub const FREEZE_TABLE: &[Builtin] = &[
    Builtin::Group(IntrinsicGroup::Global),
    Builtin::Group(IntrinsicGroup::Prototype),
    Builtin::Group(IntrinsicGroup::Helper),
    Builtin::Accessor(InternalAccessor::ArrayLength),
    Builtin::Accessor(InternalAccessor::String),
    Builtin::Accessor(InternalAccessor::Proxy),
    Builtin::Accessor(InternalAccessor::TypedArray),
    Builtin::Unscopables,
    Builtin::Root(Root::Program),
    Builtin::Root(Root::Hosts),
];

fn builtin_instances(machine: &Machine, builtin: Builtin) -> MachineResult<Vec<SlotRef>> {
    Ok(match builtin {
        Builtin::Group(group) => Intrinsic::ALL
            .iter()
            .filter(|intrinsic| intrinsic.group() == group)
            .map(|intrinsic| machine.intrinsic(*intrinsic))
            .collect::<MachineResult<_>>()?,
        Builtin::Accessor(accessor) => {
            let (getter, setter) = machine.internal_accessor(accessor);
            getter.into_iter().chain(setter).collect()
        }
        Builtin::Unscopables => {
            let prototype = machine.intrinsic(Intrinsic::ArrayPrototype)?;
            machine
                .get_own_value(prototype, well_known::UNSCOPABLES)
                .and_then(|value| value.as_reference())
                .into_iter()
                .collect()
        }
        Builtin::Root(root) => vec![machine.root_instance(root)?],
    })
}

/// Deep-freeze every entry of [`FREEZE_TABLE`]
pub fn freeze_builtins(machine: &mut Machine) -> MachineResult<()> {
    let mut count = 0;
    for builtin in FREEZE_TABLE {
        for instance in builtin_instances(machine, *builtin)? {
            freeze(machine, instance, true)?;
            count += 1;
        }
    }
    tracing::debug!(count, "built-ins frozen");
    Ok(())
}
