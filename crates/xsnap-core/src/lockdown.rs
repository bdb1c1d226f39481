//! Lockdown
//!
//! One-time taming of the realm before hardening: the function constructors
//! reachable through `constructor` properties stop evaluating code, the
//! ambient clock and random source go away, `harden` becomes a global, and
//! the built-ins are frozen. The machine remembers the lockdown in its
//! lockdown root, so a resumed snapshot stays locked down. A lockdown that
//! fails part way restores the machine as it was before the call.

use crate::callbacks::CallFrame;
use crate::error::{MachineError, MachineResult};
use crate::freeze;
use crate::machine::{Machine, Root};
use crate::realm::Intrinsic;
use crate::slot::{KeyId, SlotFlags, Value};

/// Prototypes whose `constructor` is replaced by a throwing stub
const TAMED_CONSTRUCTORS: [(Intrinsic, Intrinsic); 5] = [
    (Intrinsic::Function, Intrinsic::FunctionPrototype),
    (Intrinsic::GeneratorFunction, Intrinsic::GeneratorFunctionPrototype),
    (Intrinsic::AsyncFunction, Intrinsic::AsyncFunctionPrototype),
    (
        Intrinsic::AsyncGeneratorFunction,
        Intrinsic::AsyncGeneratorFunctionPrototype,
    ),
    (Intrinsic::Compartment, Intrinsic::CompartmentPrototype),
];

/// Lock the machine down. A second call is a TypeError.
pub fn lockdown(machine: &mut Machine) -> MachineResult<()> {
    if machine.is_locked_down() {
        return Err(MachineError::type_error("lockdown already called"));
    }
    let checkpoint = machine.checkpoint();
    match tame(machine) {
        Ok(()) => {
            machine.set_root(Root::Lockdown, Value::Boolean(true));
            tracing::debug!("lockdown complete");
            Ok(())
        }
        Err(error) => {
            machine.restore(checkpoint);
            tracing::debug!(%error, "lockdown failed, machine restored");
            Err(error)
        }
    }
}

fn tame(machine: &mut Machine) -> MachineResult<()> {
    for (constructor, prototype) in TAMED_CONSTRUCTORS {
        let prototype = machine.intrinsic(prototype)?;
        let tamed = machine.new_function(fx_tamed_constructor, constructor.name(), 0)?;
        machine.define(
            tamed,
            KeyId::PROTOTYPE,
            Value::Reference(prototype),
            SlotFlags::FROZEN | SlotFlags::DONT_ENUM,
        )?;
        machine.define(
            prototype,
            KeyId::CONSTRUCTOR,
            Value::Reference(tamed),
            SlotFlags::DONT_ENUM,
        )?;
    }

    let date = machine.intrinsic(Intrinsic::Date)?;
    let now = machine.new_function(fx_secure_date_now, "now", 0)?;
    machine.define(date, KeyId::NOW, Value::Reference(now), SlotFlags::DONT_ENUM)?;
    let math = machine.intrinsic(Intrinsic::Math)?;
    let random = machine.new_function(fx_secure_math_random, "random", 0)?;
    machine.define(math, KeyId::RANDOM, Value::Reference(random), SlotFlags::DONT_ENUM)?;

    let global = machine.global()?;
    let harden = machine.new_function(crate::harden::fx_harden, "harden", 1)?;
    machine.define(global, KeyId::HARDEN, Value::Reference(harden), SlotFlags::DONT_ENUM)?;

    freeze::freeze_builtins(machine)
}

pub(crate) fn fx_tamed_constructor(
    _machine: &mut Machine,
    _frame: &CallFrame<'_>,
) -> MachineResult<Value> {
    Err(MachineError::type_error("function constructors are not allowed after lockdown"))
}

pub(crate) fn fx_secure_date_now(
    _machine: &mut Machine,
    _frame: &CallFrame<'_>,
) -> MachineResult<Value> {
    Ok(Value::Number(f64::NAN))
}

pub(crate) fn fx_secure_math_random(
    _machine: &mut Machine,
    _frame: &CallFrame<'_>,
) -> MachineResult<Value> {
    Err(MachineError::type_error("Math.random is disabled after lockdown"))
}
