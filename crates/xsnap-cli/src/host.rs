//! Host functions of the xsnap shell
//!
//! The callback table order is the wire identity of every host function in
//! a snapshot. Append only: never reorder or remove an entry, replace it
//! with [`fx_unavailable`] instead.

use xsnap_core::callbacks::CallFrame;
use xsnap_core::platform::now_ms;
use xsnap_core::{Callback, CallbackTable, Machine, MachineError, MachineResult, SlotFlags, Value};

/// Host callbacks in wire order
pub const HOST_CALLBACKS: [Callback; 18] = [
    fx_issue_command,
    fx_print,
    fx_set_immediate,
    fx_gc,
    fx_performance_now,
    fx_current_meter_limit,
    fx_reset_meter,
    // text decoder
    fx_unavailable,
    fx_unavailable,
    fx_unavailable,
    fx_unavailable,
    fx_unavailable,
    // text encoder
    fx_unavailable,
    fx_unavailable,
    fx_unavailable,
    // base64
    fx_unavailable,
    fx_unavailable,
    fx_harden,
];

/// The host callback table
pub fn callbacks() -> CallbackTable {
    CallbackTable::new(&HOST_CALLBACKS)
}

/// Install the host globals on a fresh machine
pub fn install(machine: &mut Machine) -> MachineResult<()> {
    let global = machine.global()?;
    let functions: [(&str, Callback, i32); 6] = [
        ("issueCommand", fx_issue_command, 1),
        ("print", fx_print, 1),
        ("setImmediate", fx_set_immediate, 1),
        ("gc", fx_gc, 0),
        ("currentMeterLimit", fx_current_meter_limit, 0),
        ("resetMeter", fx_reset_meter, 1),
    ];
    for (name, callback, length) in functions {
        let function = machine.new_function(callback, name, length)?;
        let key = machine.intern(name)?;
        machine.define(global, key, Value::Reference(function), SlotFlags::DONT_ENUM)?;
    }

    let performance = machine.new_plain_object()?;
    let now = machine.new_function(fx_performance_now, "now", 0)?;
    let key = machine.intern("now")?;
    machine.define(performance, key, Value::Reference(now), SlotFlags::DONT_ENUM)?;
    let key = machine.intern("performance")?;
    machine.define(
        global,
        key,
        Value::Reference(performance),
        SlotFlags::DONT_ENUM,
    )?;
    tracing::debug!(callbacks = HOST_CALLBACKS.len(), "host globals installed");
    Ok(())
}

fn fx_issue_command(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Err(MachineError::type_error("issueCommand: no parent process"))
}

fn fx_print(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
    let line: Vec<String> = frame.args.iter().map(|arg| machine.display(*arg)).collect();
    println!("{}", line.join(" "));
    Ok(Value::Undefined)
}

fn fx_set_immediate(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
    let id = machine.set_timer(frame.arg(0), frame.arg(1), 0.0, false)?;
    Ok(Value::Integer(id as i32))
}

fn fx_gc(machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    tracing::debug!(heap = machine.heap().len(), "gc requested");
    Ok(Value::Undefined)
}

fn fx_performance_now(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Ok(Value::Number(now_ms()))
}

fn fx_current_meter_limit(machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Ok(match machine.meter().limit {
        Some(limit) => Value::Number(limit as f64),
        None => Value::Undefined,
    })
}

/// `resetMeter(limit?)`: returns the index reached so far
fn fx_reset_meter(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
    match frame.arg(0).as_number() {
        Some(limit) if limit >= 0.0 => machine.set_meter_limit(Some(limit as u64)),
        Some(_) => return Err(MachineError::range_error("meter limit must not be negative")),
        None => {}
    }
    Ok(Value::Number(machine.reset_meter() as f64))
}

fn fx_harden(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
    xsnap_core::harden(machine, frame.arg(0))
}

/// Placeholder keeping the position of a helper this shell does not provide
pub fn fx_unavailable(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Err(MachineError::type_error("host function not available"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use xsnap_core::Creation;

    fn machine() -> Machine {
        let mut machine = Machine::new(Creation::small()).unwrap();
        install(&mut machine).unwrap();
        machine
    }

    fn global_function(machine: &mut Machine, name: &str) -> Value {
        let global = machine.global().unwrap();
        let key = machine.intern(name).unwrap();
        machine.get(global, key).unwrap()
    }

    #[test]
    fn test_table_positions_are_stable() {
        let table = callbacks();
        assert_eq!(table.host_len(), 18);
        let print = xsnap_core::HostFunction(fx_print);
        assert_eq!(table.position(print), Some((xsnap_core::callbacks::HOST_TABLE, 1)));
        assert_eq!(
            table.resolve(xsnap_core::callbacks::HOST_TABLE, 17),
            Some(xsnap_core::HostFunction(fx_harden))
        );
    }

    #[test]
    fn test_set_immediate_schedules_a_timer() {
        let mut machine = machine();
        let print = global_function(&mut machine, "print");
        let set_immediate = global_function(&mut machine, "setImmediate");
        let id = machine
            .call(set_immediate, Value::Undefined, &[print, Value::Integer(1)])
            .unwrap();
        assert_eq!(id, Value::Integer(1));
        assert_eq!(machine.timers().unwrap().len(), 1);
    }

    #[test]
    fn test_reset_meter_sets_the_limit() {
        let mut machine = machine();
        let reset = global_function(&mut machine, "resetMeter");
        machine
            .call(reset, Value::Undefined, &[Value::Integer(1000)])
            .unwrap();
        assert_eq!(machine.meter().limit, Some(1000));
        let current = global_function(&mut machine, "currentMeterLimit");
        assert_eq!(
            machine.call(current, Value::Undefined, &[]).unwrap(),
            Value::Number(1000.0)
        );
    }

    #[test]
    fn test_stubs_raise_type_errors() {
        let mut machine = machine();
        let issue = global_function(&mut machine, "issueCommand");
        assert!(
            machine
                .call(issue, Value::Undefined, &[])
                .unwrap_err()
                .is_type_error()
        );
    }

    #[test]
    fn test_host_globals_are_hidden() {
        let mut machine = machine();
        let global = machine.global().unwrap();
        let key = machine.intern("performance").unwrap();
        let slot = machine.find_own(global, key).unwrap();
        assert!(machine.slot(slot).flag.contains(SlotFlags::DONT_ENUM));
    }
}
