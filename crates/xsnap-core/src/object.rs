//! Object model
//!
//! An instance is a header slot (`Value::Instance`) whose `next` link starts
//! its slot chain: internal slots first, then own properties in definition
//! order. Property slots carry their key in `id`; the header carries the
//! instance's alias ID.

use std::any::Any;

use crate::callbacks::{CallFrame, Callback, HostFunction};
use crate::codec::{self, SLOT_SIZE};
use crate::error::{MachineError, MachineResult};
use crate::machine::Machine;
use crate::realm::Intrinsic;
use crate::slot::{
    ElementType, GeneratorState, KeyId, PromiseStatus, Slot, SlotFlags, SlotKind, SlotRef, Value,
};

/// Iterator over the slot chain of an instance, header excluded
pub struct Chain<'a> {
    heap: &'a [Slot],
    link: Option<SlotRef>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = (SlotRef, &'a Slot);

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.link?;
        let slot = self.heap.get(link.as_usize())?;
        self.link = slot.next;
        Some((link, slot))
    }
}

/// Kinds of keyed collections
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Collection {
    /// Map
    Map,
    /// Set
    Set,
    /// WeakMap
    WeakMap,
    /// WeakSet
    WeakSet,
}

impl Collection {
    fn empty(self) -> Value {
        match self {
            Self::Map => Value::Map { entries: None },
            Self::Set => Value::Set { entries: None },
            Self::WeakMap => Value::WeakMap { entries: None },
            Self::WeakSet => Value::WeakSet { entries: None },
        }
    }

    fn prototype(self) -> Intrinsic {
        match self {
            Self::Map => Intrinsic::MapPrototype,
            Self::Set => Intrinsic::SetPrototype,
            Self::WeakMap => Intrinsic::WeakMapPrototype,
            Self::WeakSet => Intrinsic::WeakSetPrototype,
        }
    }

    fn is_keyed(self) -> bool {
        matches!(self, Self::Map | Self::WeakMap)
    }

    fn is_weak(self) -> bool {
        matches!(self, Self::WeakMap | Self::WeakSet)
    }

    fn of(value: &Value) -> Option<(Self, Option<SlotRef>)> {
        match *value {
            Value::Map { entries } => Some((Self::Map, entries)),
            Value::Set { entries } => Some((Self::Set, entries)),
            Value::WeakMap { entries } => Some((Self::WeakMap, entries)),
            Value::WeakSet { entries } => Some((Self::WeakSet, entries)),
            _ => None,
        }
    }
}

/// RegExp flag bits, in `dgimsuvy` order
pub const REGEXP_FLAGS: [(char, u32); 8] = [
    ('d', 1 << 0),
    ('g', 1 << 1),
    ('i', 1 << 2),
    ('m', 1 << 3),
    ('s', 1 << 4),
    ('u', 1 << 5),
    ('v', 1 << 6),
    ('y', 1 << 7),
];

impl Machine {
    // ---- instances ------------------------------------------------------

    /// Allocate an instance with the given internal slots
    pub fn new_instance(
        &mut self,
        prototype: Option<SlotRef>,
        internals: &[Value],
    ) -> MachineResult<SlotRef> {
        let header = self.allocate(Slot::new(Value::Instance { prototype }))?;
        let mut last = header;
        for value in internals {
            let slot = self.allocate(Slot::internal(*value))?;
            self.slot_mut(last).next = Some(slot);
            last = slot;
        }
        Ok(header)
    }

    /// Allocate an ordinary instance
    pub fn new_object(&mut self, prototype: Option<SlotRef>) -> MachineResult<SlotRef> {
        self.new_instance(prototype, &[])
    }

    /// Allocate an ordinary instance inheriting from `Object.prototype`
    pub fn new_plain_object(&mut self) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::ObjectPrototype)?;
        self.new_object(Some(prototype))
    }

    /// Is this slot an instance header
    pub fn is_instance(&self, slot: SlotRef) -> bool {
        self.get_slot(slot)
            .is_some_and(|slot| slot.kind() == SlotKind::Instance)
    }

    fn expect_instance(&self, instance: SlotRef) -> MachineResult<()> {
        if self.is_instance(instance) {
            Ok(())
        } else {
            Err(MachineError::type_error(format!("{} is not an object", instance)))
        }
    }

    /// Prototype of an instance
    pub fn prototype_of(&self, instance: SlotRef) -> Option<SlotRef> {
        match self.get_slot(instance)?.value {
            Value::Instance { prototype } => prototype,
            _ => None,
        }
    }

    pub(crate) fn set_header_prototype(&mut self, instance: SlotRef, prototype: Option<SlotRef>) {
        self.slot_mut(instance).value = Value::Instance { prototype };
    }

    /// `Object.setPrototypeOf`
    pub fn set_prototype_of(
        &mut self,
        instance: SlotRef,
        prototype: Option<SlotRef>,
    ) -> MachineResult<()> {
        self.expect_instance(instance)?;
        if self.prototype_of(instance) == prototype {
            return Ok(());
        }
        if !self.is_extensible(instance) {
            return Err(MachineError::type_error("object is not extensible"));
        }
        let mut link = prototype;
        while let Some(ancestor) = link {
            if ancestor == instance {
                return Err(MachineError::type_error("cyclic prototype chain"));
            }
            link = self.prototype_of(ancestor);
        }
        self.set_header_prototype(instance, prototype);
        Ok(())
    }

    /// Slots of an instance after its header
    pub fn chain(&self, instance: SlotRef) -> Chain<'_> {
        Chain {
            heap: &self.heap,
            link: self.get_slot(instance).and_then(|slot| slot.next),
        }
    }

    /// Own property slots, internal slots skipped
    pub fn properties(&self, instance: SlotRef) -> impl Iterator<Item = (SlotRef, &Slot)> {
        self.chain(instance).filter(|(_, slot)| !slot.is_internal())
    }

    /// First internal slot of the given kind
    pub fn internal(&self, instance: SlotRef, kind: SlotKind) -> Option<SlotRef> {
        self.chain(instance)
            .take_while(|(_, slot)| slot.is_internal())
            .find(|(_, slot)| slot.kind() == kind)
            .map(|(r, _)| r)
    }

    /// Value of the first internal slot
    pub fn internal_value(&self, instance: SlotRef) -> Option<Value> {
        self.chain(instance)
            .next()
            .filter(|(_, slot)| slot.is_internal())
            .map(|(_, slot)| slot.value)
    }

    fn last_slot(&self, instance: SlotRef) -> SlotRef {
        self.chain(instance).last().map_or(instance, |(r, _)| r)
    }

    fn append(&mut self, instance: SlotRef, slot: Slot) -> MachineResult<SlotRef> {
        let last = self.last_slot(instance);
        let slot = self.allocate(slot)?;
        self.slot_mut(last).next = Some(slot);
        Ok(slot)
    }

    /// Own property slot of a key
    pub fn find_own(&self, instance: SlotRef, key: KeyId) -> Option<SlotRef> {
        self.properties(instance)
            .find(|(_, slot)| slot.id == Some(key.0))
            .map(|(r, _)| r)
    }

    /// Own keys in definition order
    pub fn own_keys(&self, instance: SlotRef) -> Vec<KeyId> {
        self.properties(instance)
            .filter_map(|(_, slot)| slot.key())
            .collect()
    }

    /// Can properties be added to this instance
    pub fn is_extensible(&self, instance: SlotRef) -> bool {
        self.get_slot(instance)
            .is_some_and(|slot| !slot.flag.contains(SlotFlags::DONT_PATCH))
    }

    /// `Object.preventExtensions` on an ordinary instance
    pub fn prevent_extensions(&mut self, instance: SlotRef) -> MachineResult<()> {
        self.expect_instance(instance)?;
        self.slot_mut(instance).flag.insert(SlotFlags::DONT_PATCH);
        Ok(())
    }

    /// Proxy handler and target, if the instance is a proxy
    pub fn proxy_parts(&self, instance: SlotRef) -> Option<(Option<SlotRef>, Option<SlotRef>)> {
        match self.internal_value(instance)? {
            Value::Proxy { handler, target } => Some((handler, target)),
            _ => None,
        }
    }

    fn proxy_target(&self, instance: SlotRef) -> MachineResult<Option<SlotRef>> {
        match self.proxy_parts(instance) {
            Some((_, Some(target))) => Ok(Some(target)),
            Some((_, None)) => Err(MachineError::type_error("proxy has been revoked")),
            None => Ok(None),
        }
    }

    // ---- properties -----------------------------------------------------

    /// Define or redefine an own data property
    pub fn define(
        &mut self,
        instance: SlotRef,
        key: KeyId,
        value: Value,
        flag: SlotFlags,
    ) -> MachineResult<SlotRef> {
        self.define_slot(instance, Slot::property(key, value, flag))
    }

    /// Define or redefine an own accessor property
    pub fn define_accessor(
        &mut self,
        instance: SlotRef,
        key: KeyId,
        getter: Option<SlotRef>,
        setter: Option<SlotRef>,
        flag: SlotFlags,
    ) -> MachineResult<SlotRef> {
        let flag = flag.difference(SlotFlags::DONT_SET);
        self.define_slot(
            instance,
            Slot::property(key, Value::Accessor { getter, setter }, flag),
        )
    }

    fn define_slot(&mut self, instance: SlotRef, property: Slot) -> MachineResult<SlotRef> {
        self.expect_instance(instance)?;
        if let Some(target) = self.proxy_target(instance)? {
            return self.define_slot(target, property);
        }
        let key = property.key().ok_or_else(|| MachineError::type_error("property without key"))?;
        if let Some(existing) = self.find_own(instance, key) {
            let slot = *self.slot(existing);
            if slot.flag.contains(SlotFlags::DONT_DELETE) {
                if slot.value == property.value && slot.flag == property.flag {
                    return Ok(existing);
                }
                return Err(MachineError::type_error(format!(
                    "cannot redefine {}",
                    self.key_text(key)
                )));
            }
            let slot = self.slot_mut(existing);
            slot.value = property.value;
            slot.flag = property.flag;
            return Ok(existing);
        }
        if !self.is_extensible(instance) {
            return Err(MachineError::type_error(format!(
                "cannot define {}, object is not extensible",
                self.key_text(key)
            )));
        }
        self.append(instance, property)
    }

    /// [[Get]], running getters with the instance as receiver
    pub fn get(&mut self, instance: SlotRef, key: KeyId) -> MachineResult<Value> {
        self.get_with_receiver(instance, key, Value::Reference(instance))
    }

    /// [[Get]] with an explicit receiver
    pub fn get_with_receiver(
        &mut self,
        instance: SlotRef,
        key: KeyId,
        receiver: Value,
    ) -> MachineResult<Value> {
        let mut current = Some(instance);
        let mut depth = 0usize;
        while let Some(object) = current {
            depth += 1;
            if depth > self.heap.len() {
                return Err(MachineError::range_error("prototype chain too deep"));
            }
            if let Some(target) = self.proxy_target(object)? {
                current = Some(target);
                continue;
            }
            if let Some(property) = self.find_own(object, key) {
                let value = self.slot(property).value;
                return match value {
                    Value::Accessor { getter, .. } => match getter {
                        Some(getter) => self.call(Value::Reference(getter), receiver, &[]),
                        None => Ok(Value::Undefined),
                    },
                    Value::Export { closure, .. } => match closure {
                        Some(binding) => Ok(self.slot(binding).value),
                        None => Ok(Value::Undefined),
                    },
                    value => Ok(value),
                };
            }
            current = self.prototype_of(object);
        }
        Ok(Value::Undefined)
    }

    /// Own data property value, without running getters
    pub fn get_own_value(&self, instance: SlotRef, key: KeyId) -> Option<Value> {
        let slot = self.slot(self.find_own(instance, key)?);
        match slot.value {
            Value::Accessor { .. } => None,
            value => Some(value),
        }
    }

    /// [[Set]] in strict mode: failures are TypeErrors
    pub fn set(&mut self, instance: SlotRef, key: KeyId, value: Value) -> MachineResult<()> {
        self.expect_instance(instance)?;
        if !value.is_language_value() {
            return Err(MachineError::type_error("not a language value"));
        }
        let receiver = instance;
        let mut current = Some(instance);
        let mut depth = 0usize;
        while let Some(object) = current {
            depth += 1;
            if depth > self.heap.len() {
                return Err(MachineError::range_error("prototype chain too deep"));
            }
            if let Some(target) = self.proxy_target(object)? {
                current = Some(target);
                continue;
            }
            if let Some(property) = self.find_own(object, key) {
                let slot = *self.slot(property);
                match slot.value {
                    Value::Accessor { setter, .. } => {
                        let setter = setter.ok_or_else(|| {
                            MachineError::type_error(format!(
                                "{} has no setter",
                                self.key_text(key)
                            ))
                        })?;
                        self.call(Value::Reference(setter), Value::Reference(receiver), &[value])?;
                        return Ok(());
                    }
                    Value::Export { .. } => {
                        return Err(MachineError::type_error("module namespaces are read-only"));
                    }
                    _ if slot.flag.contains(SlotFlags::DONT_SET) => {
                        return Err(MachineError::type_error(format!(
                            "{} is read-only",
                            self.key_text(key)
                        )));
                    }
                    _ if object == receiver => {
                        self.slot_mut(property).value = value;
                        return Ok(());
                    }
                    _ => break,
                }
            }
            current = self.prototype_of(object);
        }
        self.define_new(receiver, key, value)
    }

    fn define_new(&mut self, instance: SlotRef, key: KeyId, value: Value) -> MachineResult<()> {
        let instance = self.proxy_target(instance)?.unwrap_or(instance);
        if let Some(existing) = self.find_own(instance, key) {
            self.slot_mut(existing).value = value;
            return Ok(());
        }
        if !self.is_extensible(instance) {
            return Err(MachineError::type_error(format!(
                "cannot add {}, object is not extensible",
                self.key_text(key)
            )));
        }
        self.append(instance, Slot::property(key, value, SlotFlags::empty()))?;
        Ok(())
    }

    /// [[Delete]]: `false` when the property is not configurable
    pub fn delete(&mut self, instance: SlotRef, key: KeyId) -> MachineResult<bool> {
        self.expect_instance(instance)?;
        if let Some(target) = self.proxy_target(instance)? {
            return self.delete(target, key);
        }
        let mut previous = instance;
        let mut link = self.slot(instance).next;
        while let Some(current) = link {
            let slot = *self.slot(current);
            if !slot.is_internal() && slot.id == Some(key.0) {
                if slot.flag.contains(SlotFlags::DONT_DELETE) {
                    return Ok(false);
                }
                self.slot_mut(previous).next = slot.next;
                return Ok(true);
            }
            previous = current;
            link = slot.next;
        }
        Ok(true)
    }

    /// Printable name of a key
    pub fn key_text(&self, key: KeyId) -> String {
        match self.key_name(key) {
            Some(name) if self.is_symbol(key) => format!("[{}]", name),
            Some(name) => name.to_string(),
            None => key.to_string(),
        }
    }

    // ---- functions ------------------------------------------------------

    /// Allocate a host function
    pub fn new_function(
        &mut self,
        callback: Callback,
        name: &str,
        length: i32,
    ) -> MachineResult<SlotRef> {
        self.new_closure(callback, name, length, None)
    }

    /// Allocate a host function capturing an environment
    pub fn new_closure(
        &mut self,
        callback: Callback,
        name: &str,
        length: i32,
        closures: Option<SlotRef>,
    ) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::FunctionPrototype)?;
        let function = self.new_instance(
            Some(prototype),
            &[Value::Callback {
                function: HostFunction(callback),
                closures,
            }],
        )?;
        self.name_function(function, name, length)?;
        Ok(function)
    }

    /// Allocate a bytecode function. Calling it needs the engine's interpreter.
    pub fn new_code(
        &mut self,
        bytecode: &[u8],
        name: &str,
        closures: Option<SlotRef>,
    ) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::FunctionPrototype)?;
        let address = self.block.allocate(bytecode);
        let function =
            self.new_instance(Some(prototype), &[Value::Code { address, closures }])?;
        self.name_function(function, name, 0)?;
        Ok(function)
    }

    fn name_function(&mut self, function: SlotRef, name: &str, length: i32) -> MachineResult<()> {
        let flag = SlotFlags::DONT_ENUM | SlotFlags::DONT_SET;
        self.define(function, KeyId::LENGTH, Value::Integer(length), flag)?;
        let name = self.new_string(name);
        self.define(function, KeyId::NAME, name, flag)?;
        Ok(())
    }

    /// Environment captured by a function
    pub fn closures_of(&self, function: SlotRef) -> Option<SlotRef> {
        match self.internal_value(function)? {
            Value::Callback { closures, .. } | Value::Code { closures, .. } => closures,
            _ => None,
        }
    }

    /// Is this value callable
    pub fn is_callable(&self, value: Value) -> bool {
        let Value::Reference(function) = value else {
            return false;
        };
        match self.internal_value(function) {
            Some(Value::Callback { .. } | Value::Code { .. }) => true,
            Some(Value::Proxy {
                target: Some(target),
                ..
            }) => self.is_callable(Value::Reference(target)),
            _ => false,
        }
    }

    /// [[Call]]
    pub fn call(&mut self, function: Value, this: Value, args: &[Value]) -> MachineResult<Value> {
        let Value::Reference(instance) = function else {
            return Err(MachineError::type_error("not a function"));
        };
        match self.internal_value(instance) {
            Some(Value::Callback { function, .. }) => {
                self.tick()?;
                let frame = CallFrame {
                    function: instance,
                    this,
                    args,
                };
                function.call(self, &frame)
            }
            Some(Value::Code { .. }) => Err(MachineError::type_error(
                "bytecode functions need the engine interpreter",
            )),
            Some(Value::Proxy { target, .. }) => match target {
                Some(target) => self.call(Value::Reference(target), this, args),
                None => Err(MachineError::type_error("proxy has been revoked")),
            },
            _ => Err(MachineError::type_error("not a function")),
        }
    }

    // ---- arrays ---------------------------------------------------------

    /// Allocate an array
    pub fn new_array(&mut self, items: &[Value]) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::ArrayPrototype)?;
        let address = self.store_items(items)?;
        self.new_instance(
            Some(prototype),
            &[Value::Array {
                address,
                length: items.len() as u32,
            }],
        )
    }

    /// Internal array slot of an instance
    pub fn array_slot(&self, instance: SlotRef) -> MachineResult<SlotRef> {
        self.internal(instance, SlotKind::Array)
            .ok_or_else(|| MachineError::type_error("not an array"))
    }

    /// Number of items
    pub fn array_length(&self, instance: SlotRef) -> MachineResult<u32> {
        match self.slot(self.array_slot(instance)?).value {
            Value::Array { length, .. } => Ok(length),
            _ => Err(MachineError::type_error("not an array")),
        }
    }

    /// Item slots of an array
    pub fn item_slots(&self, instance: SlotRef) -> MachineResult<Vec<Slot>> {
        match self.slot(self.array_slot(instance)?).value {
            Value::Array {
                address: Some(address),
                ..
            } => self
                .block
                .data(address)
                .chunks_exact(SLOT_SIZE)
                .map(|record| {
                    codec::decode_trusted(record).map_err(|e| MachineError::unknown(e.to_string()))
                })
                .collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// Item values of an array
    pub fn array_items(&self, instance: SlotRef) -> MachineResult<Vec<Value>> {
        Ok(self
            .item_slots(instance)?
            .into_iter()
            .map(|slot| slot.value)
            .collect())
    }

    /// Item at `index`, undefined past the end
    pub fn get_item(&self, instance: SlotRef, index: u32) -> MachineResult<Value> {
        Ok(self
            .array_items(instance)?
            .get(index as usize)
            .copied()
            .unwrap_or(Value::Undefined))
    }

    /// Store an item, growing the array when `index` is past the end
    pub fn set_item(&mut self, instance: SlotRef, index: u32, value: Value) -> MachineResult<()> {
        if !value.is_language_value() {
            return Err(MachineError::type_error("not a language value"));
        }
        let array = self.writable_array(instance)?;
        let mut items = self.array_items(instance)?;
        if index as usize >= items.len() {
            if !self.is_extensible(instance) {
                return Err(MachineError::type_error("array is not extensible"));
            }
            items.resize(index as usize + 1, Value::Undefined);
        }
        items[index as usize] = value;
        self.replace_items(array, &items)
    }

    /// Append an item
    pub fn push_item(&mut self, instance: SlotRef, value: Value) -> MachineResult<u32> {
        let length = self.array_length(instance)?;
        self.set_item(instance, length, value)?;
        Ok(length + 1)
    }

    /// Remove the item at `index`, shifting the rest down
    pub fn remove_item(&mut self, instance: SlotRef, index: u32) -> MachineResult<Value> {
        let array = self.writable_array(instance)?;
        let mut items = self.array_items(instance)?;
        if index as usize >= items.len() {
            return Ok(Value::Undefined);
        }
        let removed = items.remove(index as usize);
        self.replace_items(array, &items)?;
        Ok(removed)
    }

    /// Remove and return every item
    pub fn take_items(&mut self, instance: SlotRef) -> MachineResult<Vec<Value>> {
        let array = self.writable_array(instance)?;
        let items = self.array_items(instance)?;
        self.replace_items(array, &[])?;
        Ok(items)
    }

    fn writable_array(&self, instance: SlotRef) -> MachineResult<SlotRef> {
        let array = self.array_slot(instance)?;
        if self.slot(array).flag.contains(SlotFlags::DONT_SET) {
            return Err(MachineError::type_error("array is read-only"));
        }
        Ok(array)
    }

    fn replace_items(&mut self, array: SlotRef, items: &[Value]) -> MachineResult<()> {
        let address = self.store_items(items)?;
        self.slot_mut(array).value = Value::Array {
            address,
            length: items.len() as u32,
        };
        Ok(())
    }

    fn store_items(&mut self, items: &[Value]) -> MachineResult<Option<crate::block::ChunkRef>> {
        if items.is_empty() {
            return Ok(None);
        }
        let mut data = Vec::with_capacity(items.len() * SLOT_SIZE);
        for item in items {
            if !item.is_language_value() {
                return Err(MachineError::type_error("not a language value"));
            }
            let record = codec::encode_slot(&Slot::new(*item), None)
                .map_err(|e| MachineError::unknown(e.to_string()))?;
            data.extend_from_slice(&record);
        }
        Ok(Some(self.block.allocate(&data)))
    }

    // ---- proxies --------------------------------------------------------

    /// Allocate a proxy
    pub fn new_proxy(&mut self, target: SlotRef, handler: SlotRef) -> MachineResult<SlotRef> {
        self.expect_instance(target)?;
        self.expect_instance(handler)?;
        let proxy = self.new_instance(
            None,
            &[Value::Proxy {
                handler: Some(handler),
                target: Some(target),
            }],
        )?;
        self.slot_mut(proxy).flag.insert(SlotFlags::EXOTIC);
        Ok(proxy)
    }

    /// Revoke a proxy
    pub fn revoke_proxy(&mut self, proxy: SlotRef) -> MachineResult<()> {
        let slot = self
            .internal(proxy, SlotKind::Proxy)
            .ok_or_else(|| MachineError::type_error("not a proxy"))?;
        self.slot_mut(slot).value = Value::Proxy {
            handler: None,
            target: None,
        };
        Ok(())
    }

    // ---- dates ----------------------------------------------------------

    /// Allocate a date
    pub fn new_date(&mut self, time: f64) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::DatePrototype)?;
        self.new_instance(Some(prototype), &[Value::Date(time)])
    }

    /// Time value of a date
    pub fn date_value(&self, instance: SlotRef) -> MachineResult<f64> {
        match self.internal(instance, SlotKind::Date).map(|r| self.slot(r).value) {
            Some(Value::Date(time)) => Ok(time),
            _ => Err(MachineError::type_error("not a date")),
        }
    }

    /// `Date.prototype.setTime`
    pub fn set_date_value(&mut self, instance: SlotRef, time: f64) -> MachineResult<()> {
        let slot = self.writable_internal(instance, SlotKind::Date, "[[DateValue]]")?;
        self.slot_mut(slot).value = Value::Date(time);
        Ok(())
    }

    fn writable_internal(
        &self,
        instance: SlotRef,
        kind: SlotKind,
        what: &str,
    ) -> MachineResult<SlotRef> {
        let slot = self
            .internal(instance, kind)
            .ok_or_else(|| MachineError::type_error(format!("not a {}", kind.name())))?;
        if self.slot(slot).flag.contains(SlotFlags::DONT_SET) {
            return Err(MachineError::type_error(format!("{} is read-only", what)));
        }
        Ok(slot)
    }

    // ---- keyed collections ----------------------------------------------

    /// Allocate a Map, Set, WeakMap or WeakSet
    pub fn new_collection(&mut self, collection: Collection) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(collection.prototype())?;
        self.new_instance(Some(prototype), &[collection.empty()])
    }

    fn collection(&self, instance: SlotRef) -> MachineResult<(SlotRef, Collection, Option<SlotRef>)> {
        self.chain(instance)
            .take_while(|(_, slot)| slot.is_internal())
            .find_map(|(r, slot)| Collection::of(&slot.value).map(|(c, e)| (r, c, e)))
            .ok_or_else(|| MachineError::type_error("not a keyed collection"))
    }

    /// Entry slots of a collection (for maps: key, value, key, value...)
    pub fn collection_entries(&self, instance: SlotRef) -> MachineResult<Vec<Value>> {
        let (_, _, first) = self.collection(instance)?;
        let mut entries = Vec::new();
        let mut link = first;
        while let Some(entry) = link {
            let slot = self.slot(entry);
            entries.push(slot.value);
            link = slot.next;
        }
        Ok(entries)
    }

    fn find_entry(&self, first: Option<SlotRef>, keyed: bool, key: Value) -> Option<SlotRef> {
        let mut link = first;
        while let Some(entry) = link {
            let slot = self.slot(entry);
            if self.same_value_zero(slot.value, key) {
                return Some(entry);
            }
            link = if keyed {
                slot.next.and_then(|value| self.slot(value).next)
            } else {
                slot.next
            };
        }
        None
    }

    fn add_entry(&mut self, instance: SlotRef, key: Value, value: Option<Value>) -> MachineResult<()> {
        let (data, collection, first) = self.collection(instance)?;
        if self.slot(data).flag.contains(SlotFlags::DONT_SET) {
            return Err(MachineError::type_error(format!(
                "[[{}Data]] is read-only",
                match collection {
                    Collection::Map => "Map",
                    Collection::Set => "Set",
                    Collection::WeakMap => "WeakMap",
                    Collection::WeakSet => "WeakSet",
                }
            )));
        }
        if !key.is_language_value() || value.is_some_and(|v| !v.is_language_value()) {
            return Err(MachineError::type_error("not a language value"));
        }
        if collection.is_weak() && !matches!(key, Value::Reference(_)) {
            return Err(MachineError::type_error("invalid weak collection key"));
        }
        if let Some(entry) = self.find_entry(first, collection.is_keyed(), key) {
            if let (Some(value), Some(value_slot)) = (value, self.slot(entry).next) {
                self.slot_mut(value_slot).value = value;
            }
            return Ok(());
        }
        let mut tail = data;
        let mut link = first;
        while let Some(entry) = link {
            tail = entry;
            link = self.slot(entry).next;
        }
        let key_slot = self.allocate(Slot::new(key))?;
        if tail == data {
            let mut head = self.slot(data).value;
            set_entries(&mut head, Some(key_slot));
            self.slot_mut(data).value = head;
        } else {
            self.slot_mut(tail).next = Some(key_slot);
        }
        if let Some(value) = value {
            let value_slot = self.allocate(Slot::new(value))?;
            self.slot_mut(key_slot).next = Some(value_slot);
        }
        Ok(())
    }

    /// `Map.prototype.set`
    pub fn map_set(&mut self, map: SlotRef, key: Value, value: Value) -> MachineResult<()> {
        let (_, collection, _) = self.collection(map)?;
        if !collection.is_keyed() {
            return Err(MachineError::type_error("not a map"));
        }
        self.add_entry(map, key, Some(value))
    }

    /// `Map.prototype.get`
    pub fn map_get(&self, map: SlotRef, key: Value) -> MachineResult<Value> {
        let (_, collection, first) = self.collection(map)?;
        if !collection.is_keyed() {
            return Err(MachineError::type_error("not a map"));
        }
        Ok(self
            .find_entry(first, true, key)
            .and_then(|entry| self.slot(entry).next)
            .map_or(Value::Undefined, |value| self.slot(value).value))
    }

    /// `Set.prototype.add`
    pub fn set_add(&mut self, set: SlotRef, value: Value) -> MachineResult<()> {
        let (_, collection, _) = self.collection(set)?;
        if collection.is_keyed() {
            return Err(MachineError::type_error("not a set"));
        }
        self.add_entry(set, value, None)
    }

    /// `Set.prototype.has` and `Map.prototype.has`
    pub fn collection_has(&self, instance: SlotRef, key: Value) -> MachineResult<bool> {
        let (_, collection, first) = self.collection(instance)?;
        Ok(self.find_entry(first, collection.is_keyed(), key).is_some())
    }

    /// SameValueZero
    pub fn same_value_zero(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::String(x), Value::String(y)) => self.block.data(x) == self.block.data(y),
            _ => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
                _ => a == b,
            },
        }
    }

    // ---- buffers --------------------------------------------------------

    /// Allocate an array buffer holding a copy of `bytes`
    pub fn new_array_buffer(&mut self, bytes: &[u8]) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::ArrayBufferPrototype)?;
        let address = (!bytes.is_empty()).then(|| self.block.allocate(bytes));
        self.new_instance(
            Some(prototype),
            &[Value::ArrayBuffer {
                address,
                length: bytes.len() as u32,
            }],
        )
    }

    /// Bytes of an array buffer
    pub fn buffer_bytes(&self, buffer: SlotRef) -> MachineResult<&[u8]> {
        match self.internal(buffer, SlotKind::ArrayBuffer).map(|r| self.slot(r).value) {
            Some(Value::ArrayBuffer {
                address: Some(address),
                ..
            }) => Ok(self.block.data(address)),
            Some(Value::ArrayBuffer { address: None, .. }) => Ok(&[]),
            _ => Err(MachineError::type_error("not an ArrayBuffer")),
        }
    }

    /// Copy `bytes` into an array buffer at `offset`
    pub fn write_buffer(&mut self, buffer: SlotRef, offset: u32, bytes: &[u8]) -> MachineResult<()> {
        let slot = self.writable_internal(buffer, SlotKind::ArrayBuffer, "[[ArrayBufferData]]")?;
        let Value::ArrayBuffer { address, length } = self.slot(slot).value else {
            return Err(MachineError::type_error("not an ArrayBuffer"));
        };
        let end = offset as usize + bytes.len();
        if end > length as usize {
            return Err(MachineError::range_error("offset out of bounds"));
        }
        if let Some(address) = address {
            self.block.data_mut(address)[offset as usize..end].copy_from_slice(bytes);
        }
        Ok(())
    }

    /// Allocate a typed array viewing `length` elements of `buffer`
    pub fn new_typed_array(
        &mut self,
        element: ElementType,
        buffer: SlotRef,
        offset: u32,
        length: u32,
    ) -> MachineResult<SlotRef> {
        let size = length
            .checked_mul(element.size())
            .ok_or_else(|| MachineError::range_error("invalid typed array length"))?;
        self.check_view(buffer, offset, size)?;
        if offset % element.size() != 0 {
            return Err(MachineError::range_error("start offset is not aligned"));
        }
        let prototype = self.intrinsic(Intrinsic::TypedArrayPrototype)?;
        self.new_instance(
            Some(prototype),
            &[
                Value::TypedArray(element),
                Value::DataView { offset, size },
                Value::Reference(buffer),
            ],
        )
    }

    /// Allocate a data view over `size` bytes of `buffer`
    pub fn new_data_view(&mut self, buffer: SlotRef, offset: u32, size: u32) -> MachineResult<SlotRef> {
        self.check_view(buffer, offset, size)?;
        let prototype = self.intrinsic(Intrinsic::DataViewPrototype)?;
        self.new_instance(
            Some(prototype),
            &[Value::DataView { offset, size }, Value::Reference(buffer)],
        )
    }

    /// Buffer behind a typed array or data view
    pub fn view_buffer(&self, view: SlotRef) -> Option<SlotRef> {
        self.internal(view, SlotKind::Reference)
            .and_then(|r| self.slot(r).value.as_reference())
    }

    fn check_view(&self, buffer: SlotRef, offset: u32, size: u32) -> MachineResult<()> {
        let length = self.buffer_bytes(buffer)?.len() as u64;
        if offset as u64 + size as u64 > length {
            return Err(MachineError::range_error("view out of bounds"));
        }
        Ok(())
    }

    // ---- other instances ------------------------------------------------

    /// Allocate a regular expression
    pub fn new_regexp(&mut self, source: &str, flags: &str) -> MachineResult<SlotRef> {
        let mut bits = 0;
        for c in flags.chars() {
            let bit = REGEXP_FLAGS
                .iter()
                .find(|(flag, _)| *flag == c)
                .map(|(_, bit)| *bit)
                .ok_or_else(|| MachineError::type_error(format!("invalid regexp flag {}", c)))?;
            if bits & bit != 0 {
                return Err(MachineError::type_error(format!("duplicate regexp flag {}", c)));
            }
            bits |= bit;
        }
        let prototype = self.intrinsic(Intrinsic::RegExpPrototype)?;
        let source = self.block.allocate(source.as_bytes());
        let regexp = self.new_instance(Some(prototype), &[Value::RegExp { source, flags: bits }])?;
        let last_index = self.intern("lastIndex")?;
        self.define(regexp, last_index, Value::Integer(0), SlotFlags::DONT_ENUM | SlotFlags::DONT_DELETE)?;
        Ok(regexp)
    }

    /// Allocate a suspended generator
    pub fn new_generator(&mut self) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::GeneratorPrototype)?;
        self.new_instance(Some(prototype), &[Value::Generator(GeneratorState::SuspendedStart)])
    }

    /// Allocate a pending promise
    pub fn new_promise(&mut self) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::PromisePrototype)?;
        self.new_instance(Some(prototype), &[Value::Promise(PromiseStatus::Pending)])
    }

    /// Settle a pending promise
    pub fn settle_promise(&mut self, promise: SlotRef, status: PromiseStatus) -> MachineResult<()> {
        let slot = self
            .internal(promise, SlotKind::Promise)
            .ok_or_else(|| MachineError::type_error("not a promise"))?;
        if self.slot(slot).value != Value::Promise(PromiseStatus::Pending) {
            return Err(MachineError::type_error("promise already settled"));
        }
        self.slot_mut(slot).value = Value::Promise(status);
        Ok(())
    }

    /// Allocate an error object
    pub fn new_error(&mut self, prototype: Intrinsic, message: &str) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(prototype)?;
        let error = self.new_object(Some(prototype))?;
        let message = self.new_string(message);
        self.define(error, KeyId::MESSAGE, message, SlotFlags::DONT_ENUM)?;
        Ok(error)
    }

    /// Add or update a private field. `key` must be a symbol.
    pub fn set_private(&mut self, instance: SlotRef, key: KeyId, value: Value) -> MachineResult<()> {
        self.expect_instance(instance)?;
        if !self.is_symbol(key) {
            return Err(MachineError::type_error("private names are symbols"));
        }
        let private = match self.internal(instance, SlotKind::Private) {
            Some(private) => {
                if self.slot(private).flag.contains(SlotFlags::DONT_SET) {
                    return Err(MachineError::type_error("[[PrivateElements]] is read-only"));
                }
                private
            }
            None => {
                let mut slot = Slot::internal(Value::Private { first: None });
                slot.next = self.slot(instance).next;
                let private = self.allocate(slot)?;
                self.slot_mut(instance).next = Some(private);
                private
            }
        };
        let Value::Private { first } = self.slot(private).value else {
            return Err(MachineError::type_error("not a private slot"));
        };
        let mut link = first;
        let mut last = None;
        while let Some(field) = link {
            if self.slot(field).id == Some(key.0) {
                self.slot_mut(field).value = value;
                return Ok(());
            }
            last = Some(field);
            link = self.slot(field).next;
        }
        let field = self.allocate(Slot::property(key, value, SlotFlags::FIELD))?;
        match last {
            Some(last) => self.slot_mut(last).next = Some(field),
            None => self.slot_mut(private).value = Value::Private { first: Some(field) },
        }
        Ok(())
    }

    /// Value of a private field
    pub fn get_private(&self, instance: SlotRef, key: KeyId) -> Option<Value> {
        let Value::Private { first } = self.slot(self.internal(instance, SlotKind::Private)?).value
        else {
            return None;
        };
        let mut link = first;
        while let Some(field) = link {
            let slot = self.slot(field);
            if slot.id == Some(key.0) {
                return Some(slot.value);
            }
            link = slot.next;
        }
        None
    }

    /// Allocate a host object owning native data
    pub fn new_host_object(&mut self, data: Box<dyn Any>) -> MachineResult<SlotRef> {
        let prototype = self.intrinsic(Intrinsic::HostPrototype)?;
        let handle = self.attach_host_data(data);
        let host = self.new_instance(Some(prototype), &[Value::Host { data: Some(handle) }])?;
        self.slot_mut(host).flag.insert(SlotFlags::EXOTIC);
        Ok(host)
    }

    /// Native data of a host object; gone after a snapshot round trip
    pub fn host_object_data<T: 'static>(&self, host: SlotRef) -> Option<&T> {
        match self.slot(self.internal(host, SlotKind::Host)?).value {
            Value::Host { data: Some(handle) } => self.host_data(handle),
            _ => None,
        }
    }

    /// Text rendering of a value, as `print` shows it
    pub fn display(&self, value: Value) -> String {
        match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => format_number(n),
            Value::String(_) => self.string(value).unwrap_or_default().to_string(),
            Value::Symbol(key) => format!("Symbol({})", self.key_name(key).unwrap_or_default()),
            Value::BigInt { digits, negative } => {
                let data = self.block.data(digits);
                let mut magnitude: u128 = 0;
                for (i, word) in data.chunks_exact(4).enumerate().take(4) {
                    let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    magnitude |= (word as u128) << (32 * i);
                }
                format!("{}{}n", if negative { "-" } else { "" }, magnitude)
            }
            Value::Reference(instance) => match self.internal_value(instance) {
                Some(Value::Callback { .. } | Value::Code { .. }) => "[object Function]".to_string(),
                Some(Value::Array { .. }) => {
                    let items = self.array_items(instance).unwrap_or_default();
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::Undefined | Value::Null => String::new(),
                            item => self.display(item),
                        })
                        .collect::<Vec<_>>()
                        .join(",")
                }
                _ => "[object Object]".to_string(),
            },
            other => format!("[{}]", other.kind().name()),
        }
    }
}

fn set_entries(head: &mut Value, first: Option<SlotRef>) {
    match head {
        Value::Map { entries }
        | Value::Set { entries }
        | Value::WeakMap { entries }
        | Value::WeakSet { entries } => *entries = first,
        _ => {}
    }
}

fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::Creation;

    fn machine() -> Machine {
        Machine::new(Creation::small()).unwrap()
    }

    #[test]
    fn test_define_get_set_delete() {
        let mut machine = machine();
        let object = machine.new_plain_object().unwrap();
        let key = machine.intern("x").unwrap();
        machine.set(object, key, Value::Integer(1)).unwrap();
        assert_eq!(machine.get(object, key).unwrap(), Value::Integer(1));
        machine.set(object, key, Value::Integer(2)).unwrap();
        assert_eq!(machine.get(object, key).unwrap(), Value::Integer(2));
        assert_eq!(machine.own_keys(object), vec![key]);
        assert!(machine.delete(object, key).unwrap());
        assert_eq!(machine.get(object, key).unwrap(), Value::Undefined);
    }

    #[test]
    fn test_read_only_and_non_configurable() {
        let mut machine = machine();
        let object = machine.new_plain_object().unwrap();
        let key = machine.intern("x").unwrap();
        machine
            .define(object, key, Value::Integer(1), SlotFlags::FROZEN)
            .unwrap();
        assert!(machine.set(object, key, Value::Integer(2)).unwrap_err().is_type_error());
        assert!(!machine.delete(object, key).unwrap());
        // redefining with the same value and flags is allowed
        assert!(machine.define(object, key, Value::Integer(1), SlotFlags::FROZEN).is_ok());
        assert!(machine.define(object, key, Value::Integer(3), SlotFlags::FROZEN).is_err());
    }

    #[test]
    fn test_non_extensible_rejects_new_properties() {
        let mut machine = machine();
        let object = machine.new_plain_object().unwrap();
        machine.prevent_extensions(object).unwrap();
        let key = machine.intern("x").unwrap();
        assert!(machine.set(object, key, Value::Integer(1)).unwrap_err().is_type_error());
    }

    #[test]
    fn test_inherited_read_only_blocks_assignment() {
        let mut machine = machine();
        let parent = machine.new_plain_object().unwrap();
        let key = machine.intern("x").unwrap();
        machine.define(parent, key, Value::Integer(1), SlotFlags::FROZEN).unwrap();
        let child = machine.new_object(Some(parent)).unwrap();
        assert_eq!(machine.get(child, key).unwrap(), Value::Integer(1));
        assert!(machine.set(child, key, Value::Integer(2)).is_err());
    }

    #[test]
    fn test_getter_runs_with_receiver() {
        fn getter(_machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
            Ok(frame.this)
        }
        let mut machine = machine();
        let object = machine.new_plain_object().unwrap();
        let function = machine.new_function(getter, "get", 0).unwrap();
        let key = machine.intern("self").unwrap();
        machine
            .define_accessor(object, key, Some(function), None, SlotFlags::empty())
            .unwrap();
        assert_eq!(machine.get(object, key).unwrap(), Value::Reference(object));
        assert!(machine.set(object, key, Value::Null).is_err());
    }

    #[test]
    fn test_cyclic_prototype_is_rejected() {
        let mut machine = machine();
        let a = machine.new_plain_object().unwrap();
        let b = machine.new_object(Some(a)).unwrap();
        assert!(machine.set_prototype_of(a, Some(b)).is_err());
    }

    #[test]
    fn test_array_items() {
        let mut machine = machine();
        let array = machine.new_array(&[Value::Integer(1), Value::Null]).unwrap();
        assert_eq!(machine.array_length(array).unwrap(), 2);
        machine.set_item(array, 3, Value::Boolean(true)).unwrap();
        assert_eq!(
            machine.array_items(array).unwrap(),
            vec![Value::Integer(1), Value::Null, Value::Undefined, Value::Boolean(true)]
        );
        assert_eq!(machine.remove_item(array, 0).unwrap(), Value::Integer(1));
        assert_eq!(machine.push_item(array, Value::Integer(9)).unwrap(), 4);
        assert_eq!(machine.take_items(array).unwrap().len(), 4);
        assert_eq!(machine.array_length(array).unwrap(), 0);
    }

    #[test]
    fn test_call_code_function_is_type_error() {
        let mut machine = machine();
        let code = machine.new_code(&[0x01, 0x02], "f", None).unwrap();
        assert!(machine.is_callable(Value::Reference(code)));
        assert!(machine
            .call(Value::Reference(code), Value::Undefined, &[])
            .unwrap_err()
            .is_type_error());
    }

    #[test]
    fn test_proxy_forwards_to_target() {
        let mut machine = machine();
        let target = machine.new_plain_object().unwrap();
        let handler = machine.new_plain_object().unwrap();
        let proxy = machine.new_proxy(target, handler).unwrap();
        let key = machine.intern("x").unwrap();
        machine.set(proxy, key, Value::Integer(5)).unwrap();
        assert_eq!(machine.get_own_value(target, key), Some(Value::Integer(5)));
        machine.revoke_proxy(proxy).unwrap();
        assert!(machine.get(proxy, key).is_err());
    }

    #[test]
    fn test_map_and_set() {
        let mut machine = machine();
        let map = machine.new_collection(Collection::Map).unwrap();
        let a = machine.new_string("a");
        let a2 = machine.new_string("a");
        machine.map_set(map, a, Value::Integer(1)).unwrap();
        machine.map_set(map, a2, Value::Integer(2)).unwrap();
        assert_eq!(machine.map_get(map, a).unwrap(), Value::Integer(2));
        assert_eq!(machine.collection_entries(map).unwrap().len(), 2);

        let set = machine.new_collection(Collection::Set).unwrap();
        machine.set_add(set, Value::Integer(1)).unwrap();
        machine.set_add(set, Value::Number(1.0)).unwrap();
        assert!(machine.collection_has(set, Value::Integer(1)).unwrap());
        assert_eq!(machine.collection_entries(set).unwrap().len(), 1);

        let weak = machine.new_collection(Collection::WeakSet).unwrap();
        assert!(machine.set_add(weak, Value::Integer(1)).is_err());
    }

    #[test]
    fn test_typed_array_over_buffer() {
        let mut machine = machine();
        let buffer = machine.new_array_buffer(&[0; 8]).unwrap();
        let view = machine
            .new_typed_array(ElementType::Uint16, buffer, 2, 3)
            .unwrap();
        assert_eq!(machine.view_buffer(view), Some(buffer));
        assert!(machine
            .new_typed_array(ElementType::Uint32, buffer, 4, 2)
            .is_err());
        machine.write_buffer(buffer, 6, &[7, 8]).unwrap();
        assert_eq!(&machine.buffer_bytes(buffer).unwrap()[6..], &[7, 8]);
    }

    #[test]
    fn test_private_fields() {
        let mut machine = machine();
        let object = machine.new_plain_object().unwrap();
        let name = machine.new_symbol(Some("#secret")).unwrap();
        machine.set_private(object, name, Value::Integer(1)).unwrap();
        machine.set_private(object, name, Value::Integer(2)).unwrap();
        assert_eq!(machine.get_private(object, name), Some(Value::Integer(2)));
        assert!(machine.own_keys(object).is_empty());
    }

    #[test]
    fn test_regexp_flags() {
        let mut machine = machine();
        assert!(machine.new_regexp("a+", "gi").is_ok());
        assert!(machine.new_regexp("a+", "gg").is_err());
        assert!(machine.new_regexp("a+", "x").is_err());
    }

    #[test]
    fn test_display() {
        let mut machine = machine();
        let s = machine.new_string("hi");
        assert_eq!(machine.display(s), "hi");
        assert_eq!(machine.display(Value::Number(1.5)), "1.5");
        assert_eq!(machine.display(Value::Number(3.0)), "3");
        let big = machine.new_bigint(-12);
        assert_eq!(machine.display(big), "-12n");
        let array = machine.new_array(&[Value::Integer(1), Value::Null, s]).unwrap();
        assert_eq!(machine.display(Value::Reference(array)), "1,,hi");
    }
}
