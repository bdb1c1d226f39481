//! Modules and environments
//!
//! The program root is an instance whose properties reference the module
//! instances, keyed by specifier. A module instance holds an internal
//! `Module` slot pointing at its exports instance and its environment.
//!
//! An environment is an instance whose prototype is the outer environment
//! and whose properties are `Closure` slots pointing at bindings. A binding
//! is a lone slot holding the variable's value; const bindings carry
//! DONT_SET. Exports are `Export` properties of the exports instance that
//! point at the exporting module's bindings, so both sides see one value.

use crate::error::{MachineError, MachineResult};
use crate::machine::{Machine, Root};
use crate::realm::Intrinsic;
use crate::slot::{KeyId, Slot, SlotFlags, SlotKind, SlotRef, Value};

/// How a binding was declared
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Declaration {
    /// `let` or `var`
    Let,
    /// `const`
    Const,
}

impl Machine {
    /// Allocate an environment
    pub fn new_environment(&mut self, outer: Option<SlotRef>) -> MachineResult<SlotRef> {
        self.new_object(outer)
    }

    /// Outer environment
    pub fn outer_environment(&self, environment: SlotRef) -> Option<SlotRef> {
        self.prototype_of(environment)
    }

    /// Declare a variable in an environment, returning its binding
    pub fn declare(
        &mut self,
        environment: SlotRef,
        name: KeyId,
        value: Value,
        declaration: Declaration,
    ) -> MachineResult<SlotRef> {
        if !value.is_language_value() {
            return Err(MachineError::type_error("not a language value"));
        }
        if self.find_own(environment, name).is_some() {
            return Err(MachineError::type_error(format!(
                "{} has already been declared",
                self.key_text(name)
            )));
        }
        let mut binding = Slot::new(value);
        if declaration == Declaration::Const {
            binding.flag.insert(SlotFlags::DONT_SET);
        }
        let binding = self.allocate(binding)?;
        self.define(
            environment,
            name,
            Value::Closure(binding),
            SlotFlags::DONT_DELETE,
        )?;
        Ok(binding)
    }

    /// Binding of a variable, searching outer environments
    pub fn lookup(&self, environment: SlotRef, name: KeyId) -> Option<SlotRef> {
        let mut link = Some(environment);
        while let Some(current) = link {
            if let Some(property) = self.find_own(current, name)
                && let Value::Closure(binding) = self.slot(property).value
            {
                return Some(binding);
            }
            link = self.outer_environment(current);
        }
        None
    }

    /// Value of a variable
    pub fn read_variable(&self, environment: SlotRef, name: KeyId) -> MachineResult<Value> {
        self.lookup(environment, name)
            .map(|binding| self.slot(binding).value)
            .ok_or_else(|| MachineError::unknown(format!("{} is not defined", self.key_text(name))))
    }

    /// Assign a variable
    pub fn write_variable(
        &mut self,
        environment: SlotRef,
        name: KeyId,
        value: Value,
    ) -> MachineResult<()> {
        let binding = self.lookup(environment, name).ok_or_else(|| {
            MachineError::unknown(format!("{} is not defined", self.key_text(name)))
        })?;
        self.write_binding(binding, value)
    }

    /// Assign a binding
    pub fn write_binding(&mut self, binding: SlotRef, value: Value) -> MachineResult<()> {
        if !value.is_language_value() {
            return Err(MachineError::type_error("not a language value"));
        }
        if self.slot(binding).flag.contains(SlotFlags::DONT_SET) {
            return Err(MachineError::type_error("assignment to constant variable"));
        }
        self.slot_mut(binding).value = value;
        Ok(())
    }

    /// Variables of one environment, in declaration order
    pub fn bindings(&self, environment: SlotRef) -> Vec<(KeyId, SlotRef)> {
        self.properties(environment)
            .filter_map(|(_, slot)| match (slot.key(), slot.value) {
                (Some(name), Value::Closure(binding)) => Some((name, binding)),
                _ => None,
            })
            .collect()
    }

    /// Register a module under `specifier`
    pub fn new_module(&mut self, specifier: &str) -> MachineResult<SlotRef> {
        let program = self.root_instance(Root::Program)?;
        let key = self.intern(specifier)?;
        if self.find_own(program, key).is_some() {
            return Err(MachineError::type_error(format!(
                "module {} already exists",
                specifier
            )));
        }
        let environment = self.new_environment(None)?;
        let exports = self.new_object(None)?;
        let prototype = self.intrinsic(Intrinsic::ModulePrototype)?;
        let module = self.new_instance(
            Some(prototype),
            &[Value::Module {
                exports: Some(exports),
                environment: Some(environment),
            }],
        )?;
        self.define(program, key, Value::Reference(module), SlotFlags::DONT_ENUM)?;
        tracing::trace!(specifier, %module, "module registered");
        Ok(module)
    }

    fn module_record(&self, module: SlotRef) -> MachineResult<(SlotRef, SlotRef)> {
        match self.internal(module, SlotKind::Module).map(|r| self.slot(r).value) {
            Some(Value::Module {
                exports: Some(exports),
                environment: Some(environment),
            }) => Ok((exports, environment)),
            _ => Err(MachineError::type_error("not a module")),
        }
    }

    /// Module environment
    pub fn module_environment(&self, module: SlotRef) -> MachineResult<SlotRef> {
        self.module_record(module).map(|(_, environment)| environment)
    }

    /// Exports instance of a module
    pub fn module_exports(&self, module: SlotRef) -> MachineResult<SlotRef> {
        self.module_record(module).map(|(exports, _)| exports)
    }

    /// Export a binding of `module` as `name`
    pub fn export(&mut self, module: SlotRef, name: KeyId, binding: SlotRef) -> MachineResult<()> {
        let exports = self.module_exports(module)?;
        self.define(
            exports,
            name,
            Value::Export {
                closure: Some(binding),
                module: Some(module),
            },
            SlotFlags::DONT_DELETE,
        )?;
        Ok(())
    }

    /// Declare a module variable and export it under the same name
    pub fn export_value(
        &mut self,
        module: SlotRef,
        name: &str,
        value: Value,
        declaration: Declaration,
    ) -> MachineResult<SlotRef> {
        let key = self.intern(name)?;
        let environment = self.module_environment(module)?;
        let binding = self.declare(environment, key, value, declaration)?;
        self.export(module, key, binding)?;
        Ok(binding)
    }

    /// Registered modules, in registration order
    pub fn modules(&self) -> Vec<(KeyId, SlotRef)> {
        let Ok(program) = self.root_instance(Root::Program) else {
            return Vec::new();
        };
        self.properties(program)
            .filter_map(|(_, slot)| Some((slot.key()?, slot.value.as_reference()?)))
            .collect()
    }

    /// Module registered under `specifier`
    pub fn find_module(&self, specifier: &str) -> Option<SlotRef> {
        let key = self.find_key(specifier)?;
        let program = self.root_instance(Root::Program).ok()?;
        self.get_own_value(program, key)?.as_reference()
    }

    /// Exports of a module as (name, binding), in declaration order
    pub fn exports(&self, module: SlotRef) -> Vec<(KeyId, SlotRef)> {
        let Ok(exports) = self.module_exports(module) else {
            return Vec::new();
        };
        self.properties(exports)
            .filter_map(|(_, slot)| match (slot.key(), slot.value) {
                (
                    Some(name),
                    Value::Export {
                        closure: Some(binding),
                        ..
                    },
                ) => Some((name, binding)),
                _ => None,
            })
            .collect()
    }

    /// Current value of an export
    pub fn export_of(&self, module: SlotRef, name: KeyId) -> Option<Value> {
        self.exports(module)
            .into_iter()
            .find(|(export, _)| *export == name)
            .map(|(_, binding)| self.slot(binding).value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::Creation;

    #[test]
    fn test_lookup_walks_outer_environments() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let outer = machine.new_environment(None).unwrap();
        let inner = machine.new_environment(Some(outer)).unwrap();
        let x = machine.intern("x").unwrap();
        machine
            .declare(outer, x, Value::Integer(1), Declaration::Let)
            .unwrap();
        assert_eq!(machine.read_variable(inner, x).unwrap(), Value::Integer(1));
        machine.write_variable(inner, x, Value::Integer(2)).unwrap();
        assert_eq!(machine.read_variable(outer, x).unwrap(), Value::Integer(2));
        let y = machine.intern("y").unwrap();
        assert!(machine.read_variable(inner, y).is_err());
    }

    #[test]
    fn test_const_binding_rejects_assignment() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let environment = machine.new_environment(None).unwrap();
        let x = machine.intern("x").unwrap();
        machine
            .declare(environment, x, Value::Integer(1), Declaration::Const)
            .unwrap();
        assert!(machine
            .write_variable(environment, x, Value::Integer(2))
            .unwrap_err()
            .is_type_error());
        assert!(machine
            .declare(environment, x, Value::Null, Declaration::Let)
            .is_err());
    }

    #[test]
    fn test_exports_share_the_binding() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let module = machine.new_module("main.js").unwrap();
        let binding = machine
            .export_value(module, "count", Value::Integer(1), Declaration::Let)
            .unwrap();
        let count = machine.find_key("count").unwrap();
        machine.write_binding(binding, Value::Integer(5)).unwrap();
        assert_eq!(machine.export_of(module, count), Some(Value::Integer(5)));
        let exports = machine.module_exports(module).unwrap();
        assert_eq!(machine.get(exports, count).unwrap(), Value::Integer(5));
        assert!(machine.set(exports, count, Value::Integer(6)).is_err());
        assert_eq!(machine.find_module("main.js"), Some(module));
        assert_eq!(machine.modules().len(), 1);
        assert!(machine.new_module("main.js").is_err());
    }
}
