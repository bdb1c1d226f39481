//! Machine state
//!
//! A [`Machine`] owns the chunk block, the heap, the stack and the key
//! table of one engine instance. Everything a snapshot carries lives here;
//! counters that used to be process globals (meter, alias count, random
//! state) are fields, so several machines can coexist in one process.

use std::any::Any;
use std::fmt;

use crate::block::Block;
use crate::creation::Creation;
use crate::error::{MachineError, MachineResult};
use crate::keys::KeyTable;
use crate::realm;
use crate::slot::{HostHandle, Slot, SlotRef, Value};

/// Machine roots, kept at the bottom of the stack
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Root {
    /// Global object
    Global = 0,
    /// Program: module registry
    Program = 1,
    /// Pending exception
    Exception = 2,
    /// Host objects
    Hosts = 3,
    /// Timer queue
    Timers = 4,
    /// Promise job queue
    Jobs = 5,
    /// Lockdown state
    Lockdown = 6,
}

impl Root {
    /// Number of roots
    pub const COUNT: usize = 7;

    /// Every root, in stack order
    pub const ALL: [Root; Self::COUNT] = [
        Self::Global,
        Self::Program,
        Self::Exception,
        Self::Hosts,
        Self::Timers,
        Self::Jobs,
        Self::Lockdown,
    ];

    /// Stack index of the root
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Computation meter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Meter {
    /// Host calls made so far
    pub index: u64,
    /// Abort once the index passes this limit
    pub limit: Option<u64>,
}

/// Everything a snapshot reader reconstructs
#[derive(Debug)]
pub struct MachineParts {
    /// Creation parameters
    pub creation: Creation,
    /// Chunk block
    pub block: Block,
    /// Heap slots, sentinel included
    pub heap: Vec<Slot>,
    /// Used stack slots
    pub stack: Vec<Slot>,
    /// Key table
    pub keys: KeyTable,
    /// Alias IDs handed out
    pub alias_count: u32,
}

/// Copy of the snapshot-visible state, for passes that must not half-apply
pub(crate) struct Checkpoint {
    block: Block,
    heap: Vec<Slot>,
    stack: Vec<Slot>,
    keys: KeyTable,
    alias_count: u32,
}

/// One engine instance
pub struct Machine {
    pub(crate) creation: Creation,
    pub(crate) block: Block,
    pub(crate) heap: Vec<Slot>,
    pub(crate) stack: Vec<Slot>,
    pub(crate) keys: KeyTable,
    pub(crate) alias_count: u32,
    host_data: Vec<Option<Box<dyn Any>>>,
    pub(crate) meter: Meter,
    random_state: u64,
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("heap", &self.heap.len())
            .field("stack", &self.stack.len())
            .field("block", &self.block.len())
            .field("keys", &self.keys.len())
            .field("alias_count", &self.alias_count)
            .field("meter", &self.meter)
            .finish_non_exhaustive()
    }
}

impl Machine {
    /// Create a machine with a fresh realm
    pub fn new(creation: Creation) -> MachineResult<Self> {
        creation.validate().map_err(MachineError::range_error)?;
        let mut machine = Self::empty(creation);
        machine.heap.push(Slot::free());
        machine
            .stack
            .resize(realm::STACK_BASE, Slot::new(Value::Undefined));
        machine.intern_fixed_keys()?;
        realm::build(&mut machine)?;
        tracing::debug!(
            heap = machine.heap.len(),
            keys = machine.keys.len(),
            block = machine.block.len(),
            "machine created"
        );
        Ok(machine)
    }

    /// Rebuild a machine from the parts of a snapshot
    pub fn from_parts(parts: MachineParts) -> MachineResult<Self> {
        if parts.stack.len() < realm::STACK_BASE {
            return Err(MachineError::range_error(format!(
                "stack holds {} slots, the realm needs {}",
                parts.stack.len(),
                realm::STACK_BASE
            )));
        }
        if parts.heap.is_empty() {
            return Err(MachineError::range_error("heap has no sentinel"));
        }
        let mut machine = Self::empty(parts.creation);
        machine.block = parts.block;
        machine.heap = parts.heap;
        machine.stack = parts.stack;
        machine.keys = parts.keys;
        machine.alias_count = parts.alias_count;
        machine
            .check_fixed_keys()
            .map_err(MachineError::range_error)?;
        realm::check(&machine)?;
        Ok(machine)
    }

    fn empty(creation: Creation) -> Self {
        let incremental = creation.incremental_chunk_size as usize;
        Self {
            block: Block::with_capacity(creation.initial_chunk_size as usize, incremental),
            heap: Vec::with_capacity(creation.initial_heap_count as usize),
            stack: Vec::with_capacity(creation.stack_count as usize),
            keys: KeyTable::new(
                creation.name_modulo,
                creation.symbol_modulo,
                creation.initial_key_count as usize,
            ),
            alias_count: 0,
            host_data: Vec::new(),
            meter: Meter::default(),
            random_state: seed(),
            creation,
        }
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            block: self.block.clone(),
            heap: self.heap.clone(),
            stack: self.stack.clone(),
            keys: self.keys.clone(),
            alias_count: self.alias_count,
        }
    }

    pub(crate) fn restore(&mut self, checkpoint: Checkpoint) {
        self.block = checkpoint.block;
        self.heap = checkpoint.heap;
        self.stack = checkpoint.stack;
        self.keys = checkpoint.keys;
        self.alias_count = checkpoint.alias_count;
    }

    /// Creation parameters
    pub fn creation(&self) -> &Creation {
        &self.creation
    }

    /// Chunk block
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Heap slots, sentinel included
    pub fn heap(&self) -> &[Slot] {
        &self.heap
    }

    /// Used stack slots
    pub fn stack(&self) -> &[Slot] {
        &self.stack
    }

    /// Alias IDs handed out so far
    pub fn alias_count(&self) -> u32 {
        self.alias_count
    }

    /// Slot at a heap index
    pub fn slot(&self, slot: SlotRef) -> &Slot {
        &self.heap[slot.as_usize()]
    }

    /// Mutable slot at a heap index
    pub fn slot_mut(&mut self, slot: SlotRef) -> &mut Slot {
        &mut self.heap[slot.as_usize()]
    }

    /// Slot at a heap index, `None` past the end
    pub fn get_slot(&self, slot: SlotRef) -> Option<&Slot> {
        self.heap.get(slot.as_usize())
    }

    /// Allocate a heap slot
    pub fn allocate(&mut self, slot: Slot) -> MachineResult<SlotRef> {
        if self.heap.len() == self.heap.capacity() {
            self.heap
                .reserve(self.creation.incremental_heap_count.max(1) as usize);
        }
        let index = u32::try_from(self.heap.len()).map_err(|_| MachineError::OutOfMemory("heap"))?;
        let slot_ref = SlotRef::new(index).ok_or(MachineError::OutOfMemory("heap"))?;
        self.heap.push(slot);
        Ok(slot_ref)
    }

    /// Value held by a root
    pub fn root(&self, root: Root) -> Value {
        self.stack[root.index()].value
    }

    /// Instance held by a root
    pub fn root_instance(&self, root: Root) -> MachineResult<SlotRef> {
        self.root(root)
            .as_reference()
            .ok_or_else(|| MachineError::unknown(format!("{:?} root is not an object", root)))
    }

    pub(crate) fn set_root(&mut self, root: Root, value: Value) {
        self.stack[root.index()].value = value;
    }

    /// Global object
    pub fn global(&self) -> MachineResult<SlotRef> {
        self.root_instance(Root::Global)
    }

    /// Pending exception
    pub fn exception(&self) -> Value {
        self.root(Root::Exception)
    }

    /// Set the pending exception
    pub fn set_exception(&mut self, value: Value) {
        self.set_root(Root::Exception, value);
    }

    /// Take the pending exception, leaving undefined
    pub fn take_exception(&mut self) -> Value {
        let value = self.exception();
        self.set_exception(Value::Undefined);
        value
    }

    /// Push a host temporary
    pub fn push(&mut self, value: Value) -> MachineResult<()> {
        if self.stack.len() >= self.creation.stack_count as usize {
            return Err(MachineError::OutOfMemory("stack"));
        }
        self.stack.push(Slot::new(value));
        Ok(())
    }

    /// Pop a host temporary
    pub fn pop(&mut self) -> Option<Value> {
        if self.stack.len() <= realm::STACK_BASE {
            return None;
        }
        self.stack.pop().map(|slot| slot.value)
    }

    /// Host temporary `depth` slots below the top
    pub fn peek(&self, depth: usize) -> Option<Value> {
        let len = self.stack.len();
        if depth >= len - realm::STACK_BASE {
            return None;
        }
        Some(self.stack[len - 1 - depth].value)
    }

    /// Number of host temporaries
    pub fn temporaries(&self) -> usize {
        self.stack.len() - realm::STACK_BASE
    }

    /// Allocate a string
    pub fn new_string(&mut self, text: &str) -> Value {
        Value::String(self.block.allocate(text.as_bytes()))
    }

    /// Text of a string value
    pub fn string(&self, value: Value) -> Option<&str> {
        match value {
            Value::String(chunk) => std::str::from_utf8(self.block.data(chunk)).ok(),
            _ => None,
        }
    }

    /// Allocate a bigint from a 64-bit integer
    pub fn new_bigint(&mut self, value: i64) -> Value {
        let magnitude = value.unsigned_abs();
        let mut digits = Vec::with_capacity(8);
        digits.extend_from_slice(&(magnitude as u32).to_le_bytes());
        digits.extend_from_slice(&((magnitude >> 32) as u32).to_le_bytes());
        Value::BigInt {
            digits: self.block.allocate(&digits),
            negative: value < 0,
        }
    }

    /// Hand out the next alias ID
    pub fn next_alias(&mut self) -> u32 {
        let id = self.alias_count;
        self.alias_count += 1;
        id
    }

    /// Give a slot (instance header or closure binding) an alias ID
    pub fn alias(&mut self, slot: SlotRef) -> u32 {
        if let Some(id) = self.slot(slot).id {
            return id;
        }
        let id = self.next_alias();
        self.slot_mut(slot).id = Some(id);
        id
    }

    /// Store host data, returning its handle
    pub fn attach_host_data(&mut self, data: Box<dyn Any>) -> HostHandle {
        self.host_data.push(Some(data));
        HostHandle(self.host_data.len() as u32 - 1)
    }

    /// Host data behind a handle
    pub fn host_data<T: 'static>(&self, handle: HostHandle) -> Option<&T> {
        self.host_data
            .get(handle.0 as usize)?
            .as_ref()?
            .downcast_ref::<T>()
    }

    /// Release host data
    pub fn detach_host_data(&mut self, handle: HostHandle) -> Option<Box<dyn Any>> {
        self.host_data.get_mut(handle.0 as usize)?.take()
    }

    /// Meter state
    pub fn meter(&self) -> Meter {
        self.meter
    }

    /// Set or clear the meter limit
    pub fn set_meter_limit(&mut self, limit: Option<u64>) {
        self.meter.limit = limit;
    }

    /// Reset the meter, returning the previous index
    pub fn reset_meter(&mut self) -> u64 {
        std::mem::take(&mut self.meter.index)
    }

    /// Count one unit of computation
    pub(crate) fn tick(&mut self) -> MachineResult<()> {
        self.meter.index += 1;
        match self.meter.limit {
            Some(limit) if self.meter.index > limit => Err(MachineError::TooMuchComputation),
            _ => Ok(()),
        }
    }

    /// Next pseudo random number in `[0, 1)` (xorshift64)
    pub(crate) fn next_random(&mut self) -> f64 {
        let mut s = self.random_state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.random_state = s;
        (s >> 11) as f64 / ((1u64 << 53) as f64)
    }

    /// Has lockdown run on this machine
    pub fn is_locked_down(&self) -> bool {
        matches!(self.root(Root::Lockdown), Value::Boolean(true))
    }
}

fn seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let s = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x853c49e6748fea9b);
    // xorshift never leaves zero
    if s == 0 { 0x853c49e6748fea9b } else { s }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_machine_has_roots() {
        let machine = Machine::new(Creation::small()).unwrap();
        assert!(machine.global().is_ok());
        assert!(machine.root_instance(Root::Program).is_ok());
        assert_eq!(machine.exception(), Value::Undefined);
        assert!(!machine.is_locked_down());
        assert_eq!(machine.heap()[0], Slot::free());
    }

    #[test]
    fn test_push_pop_stay_above_realm() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        assert_eq!(machine.pop(), None);
        machine.push(Value::Integer(1)).unwrap();
        machine.push(Value::Integer(2)).unwrap();
        assert_eq!(machine.peek(1), Some(Value::Integer(1)));
        assert_eq!(machine.temporaries(), 2);
        assert_eq!(machine.pop(), Some(Value::Integer(2)));
        assert_eq!(machine.pop(), Some(Value::Integer(1)));
        assert_eq!(machine.pop(), None);
    }

    #[test]
    fn test_stack_overflow_is_out_of_memory() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let room = machine.creation().stack_count as usize - machine.stack().len();
        for i in 0..room {
            machine.push(Value::Integer(i as i32)).unwrap();
        }
        assert!(matches!(
            machine.push(Value::Null),
            Err(MachineError::OutOfMemory("stack"))
        ));
    }

    #[test]
    fn test_meter_limit() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        machine.set_meter_limit(Some(2));
        assert!(machine.tick().is_ok());
        assert!(machine.tick().is_ok());
        assert!(matches!(machine.tick(), Err(MachineError::TooMuchComputation)));
        assert_eq!(machine.reset_meter(), 3);
        assert!(machine.tick().is_ok());
    }

    #[test]
    fn test_random_in_unit_interval() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        for _ in 0..100 {
            let r = machine.next_random();
            assert!((0.0..1.0).contains(&r));
        }
    }

    #[test]
    fn test_host_data() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let handle = machine.attach_host_data(Box::new(41u32));
        assert_eq!(machine.host_data::<u32>(handle), Some(&41));
        assert_eq!(machine.host_data::<String>(handle), None);
        assert!(machine.detach_host_data(handle).is_some());
        assert_eq!(machine.host_data::<u32>(handle), None);
    }

    #[test]
    fn test_alias_is_stable() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let object = machine.new_object(None).unwrap();
        let first = machine.alias(object);
        assert_eq!(machine.alias(object), first);
        assert_eq!(machine.alias_count(), first + 1);
    }
}
