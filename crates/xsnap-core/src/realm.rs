//! Realm: intrinsics and machine roots
//!
//! The stack starts with the machine roots, then one slot per intrinsic
//! (a reference to its instance), then the internal accessors. Everything
//! above [`STACK_BASE`] is host temporaries.
//!
//! Only the parts of the built-ins the heap model needs have behavior
//! (`Object.freeze`, `Object.isFrozen`, `Date.now`, `Math.random`); the rest
//! are shaped like the engine's but answer with a TypeError when called.

use crate::callbacks::{CallFrame, HostFunction};
use crate::error::{MachineError, MachineResult};
use crate::freeze;
use crate::keys::well_known;
use crate::machine::{Machine, Root};
use crate::slot::{KeyId, Slot, SlotFlags, SlotKind, SlotRef, Value};

/// Intrinsic groups, in the order they are frozen
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntrinsicGroup {
    /// Global constructors and namespaces, with their prototypes
    Global,
    /// Prototypes reachable only through instances
    Prototype,
    /// Internal helper functions
    Helper,
}

macro_rules! intrinsics {
    ($($group:ident { $($name:ident),* $(,)? })*) => {
        /// Intrinsic objects, in stack order
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Intrinsic {
            $($(
                #[allow(missing_docs)]
                $name,
            )*)*
        }

        impl Intrinsic {
            /// Every intrinsic, in stack order
            pub const ALL: &'static [Intrinsic] = &[$($(Intrinsic::$name,)*)*];

            /// Name used for function `name` properties and dumps
            pub fn name(self) -> &'static str {
                match self {
                    $($(Intrinsic::$name => stringify!($name),)*)*
                }
            }

            /// Group of the intrinsic
            pub fn group(self) -> IntrinsicGroup {
                match self {
                    $($(Intrinsic::$name => IntrinsicGroup::$group,)*)*
                }
            }
        }
    };
}

intrinsics! {
    Global {
        Object, ObjectPrototype,
        Function, FunctionPrototype,
        Array, ArrayPrototype,
        String, StringPrototype,
        Boolean, BooleanPrototype,
        Number, NumberPrototype,
        Symbol, SymbolPrototype,
        BigInt, BigIntPrototype,
        Error, ErrorPrototype,
        TypeError, TypeErrorPrototype,
        RangeError, RangeErrorPrototype,
        URIError, URIErrorPrototype,
        Date, DatePrototype,
        RegExp, RegExpPrototype,
        Map, MapPrototype,
        Set, SetPrototype,
        WeakMap, WeakMapPrototype,
        WeakSet, WeakSetPrototype,
        Promise, PromisePrototype,
        Proxy,
        ArrayBuffer, ArrayBufferPrototype,
        DataView, DataViewPrototype,
        Math, JSON, Reflect,
        Compartment, CompartmentPrototype,
    }
    Prototype {
        ArgumentsSloppyPrototype,
        ArgumentsStrictPrototype,
        ArrayIteratorPrototype,
        AsyncFromSyncIteratorPrototype,
        AsyncFunction, AsyncFunctionPrototype,
        AsyncGeneratorFunction, AsyncGeneratorFunctionPrototype,
        AsyncGeneratorPrototype,
        AsyncIteratorPrototype,
        GeneratorFunction, GeneratorFunctionPrototype,
        GeneratorPrototype,
        HostPrototype,
        IteratorPrototype,
        MapIteratorPrototype,
        ModulePrototype,
        RegExpStringIteratorPrototype,
        SetIteratorPrototype,
        StringIteratorPrototype,
        TransferPrototype,
        TypedArray, TypedArrayPrototype,
    }
    Helper {
        AssignObject,
        CopyObject,
        Enumerator,
        InitializeRegExp,
        OnRejectedPromise,
        OnResolvedPromise,
        OnThenable,
    }
}

/// What an intrinsic looks like
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// Constructor function with a `prototype` property
    Constructor(Intrinsic),
    /// Plain function
    Function,
    /// Namespace object
    Namespace,
    /// Prototype object inheriting from another, or from nothing
    Prototype(Option<Intrinsic>),
}

impl Intrinsic {
    /// Number of intrinsics
    pub const COUNT: usize = Self::ALL.len();

    /// Stack index of the intrinsic
    pub fn stack_index(self) -> usize {
        Root::COUNT + self as usize
    }

    /// Shape of the intrinsic
    pub fn shape(self) -> Shape {
        use Intrinsic::*;
        match self {
            Object => Shape::Constructor(ObjectPrototype),
            Function => Shape::Constructor(FunctionPrototype),
            Array => Shape::Constructor(ArrayPrototype),
            String => Shape::Constructor(StringPrototype),
            Boolean => Shape::Constructor(BooleanPrototype),
            Number => Shape::Constructor(NumberPrototype),
            Symbol => Shape::Constructor(SymbolPrototype),
            BigInt => Shape::Constructor(BigIntPrototype),
            Error => Shape::Constructor(ErrorPrototype),
            TypeError => Shape::Constructor(TypeErrorPrototype),
            RangeError => Shape::Constructor(RangeErrorPrototype),
            URIError => Shape::Constructor(URIErrorPrototype),
            Date => Shape::Constructor(DatePrototype),
            RegExp => Shape::Constructor(RegExpPrototype),
            Map => Shape::Constructor(MapPrototype),
            Set => Shape::Constructor(SetPrototype),
            WeakMap => Shape::Constructor(WeakMapPrototype),
            WeakSet => Shape::Constructor(WeakSetPrototype),
            Promise => Shape::Constructor(PromisePrototype),
            ArrayBuffer => Shape::Constructor(ArrayBufferPrototype),
            DataView => Shape::Constructor(DataViewPrototype),
            Compartment => Shape::Constructor(CompartmentPrototype),
            AsyncFunction => Shape::Constructor(AsyncFunctionPrototype),
            AsyncGeneratorFunction => Shape::Constructor(AsyncGeneratorFunctionPrototype),
            GeneratorFunction => Shape::Constructor(GeneratorFunctionPrototype),
            TypedArray => Shape::Constructor(TypedArrayPrototype),
            Proxy => Shape::Function,
            Math | JSON | Reflect => Shape::Namespace,
            ObjectPrototype => Shape::Prototype(None),
            TypeErrorPrototype | RangeErrorPrototype | URIErrorPrototype => {
                Shape::Prototype(Some(ErrorPrototype))
            }
            AsyncFunctionPrototype
            | AsyncGeneratorFunctionPrototype
            | GeneratorFunctionPrototype => Shape::Prototype(Some(FunctionPrototype)),
            ArrayIteratorPrototype
            | MapIteratorPrototype
            | SetIteratorPrototype
            | StringIteratorPrototype
            | RegExpStringIteratorPrototype
            | GeneratorPrototype => Shape::Prototype(Some(IteratorPrototype)),
            AsyncGeneratorPrototype | AsyncFromSyncIteratorPrototype => {
                Shape::Prototype(Some(AsyncIteratorPrototype))
            }
            ModulePrototype => Shape::Prototype(None),
            AssignObject | CopyObject | Enumerator | InitializeRegExp | OnRejectedPromise
            | OnResolvedPromise | OnThenable => Shape::Function,
            _ => Shape::Prototype(Some(ObjectPrototype)),
        }
    }

    /// Is the intrinsic a property of the global object
    pub fn is_global(self) -> bool {
        self.group() == IntrinsicGroup::Global && !matches!(self.shape(), Shape::Prototype(_))
    }
}

/// Accessors the engine keeps for exotic behavior
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InternalAccessor {
    /// Array `length`
    ArrayLength,
    /// String indexes and `length`
    String,
    /// Proxy property access
    Proxy,
    /// Typed array indexes
    TypedArray,
}

impl InternalAccessor {
    /// Every internal accessor, in stack order
    pub const ALL: [InternalAccessor; 4] = [
        Self::ArrayLength,
        Self::String,
        Self::Proxy,
        Self::TypedArray,
    ];

    /// Stack index of the accessor
    pub fn stack_index(self) -> usize {
        Root::COUNT + Intrinsic::COUNT + self as usize
    }

    fn name(self) -> &'static str {
        match self {
            Self::ArrayLength => "length",
            Self::String => "string",
            Self::Proxy => "proxy",
            Self::TypedArray => "typedArray",
        }
    }
}

/// First stack index available to host temporaries
pub const STACK_BASE: usize = Root::COUNT + Intrinsic::COUNT + InternalAccessor::ALL.len();

const HIDDEN: SlotFlags = SlotFlags::DONT_ENUM;
const LOCKED: SlotFlags = SlotFlags::DONT_ENUM
    .union(SlotFlags::DONT_DELETE)
    .union(SlotFlags::DONT_SET);

impl Machine {
    /// Instance of an intrinsic
    pub fn intrinsic(&self, intrinsic: Intrinsic) -> MachineResult<SlotRef> {
        self.stack[intrinsic.stack_index()]
            .value
            .as_reference()
            .ok_or_else(|| MachineError::unknown(format!("{} is missing", intrinsic.name())))
    }

    /// Getter and setter of an internal accessor
    pub fn internal_accessor(
        &self,
        accessor: InternalAccessor,
    ) -> (Option<SlotRef>, Option<SlotRef>) {
        match self.stack[accessor.stack_index()].value {
            Value::Accessor { getter, setter } => (getter, setter),
            _ => (None, None),
        }
    }
}

/// Populate the stack of a fresh machine
pub(crate) fn build(machine: &mut Machine) -> MachineResult<()> {
    // allocate first, every intrinsic may refer to any other
    for intrinsic in Intrinsic::ALL {
        let instance = match intrinsic.shape() {
            Shape::Constructor(_) | Shape::Function => machine.new_instance(
                None,
                &[Value::Callback {
                    function: HostFunction(fx_unsupported),
                    closures: None,
                }],
            )?,
            Shape::Namespace | Shape::Prototype(_) => machine.new_object(None)?,
        };
        machine.stack[intrinsic.stack_index()] = Slot::new(Value::Reference(instance));
    }

    let object_prototype = machine.intrinsic(Intrinsic::ObjectPrototype)?;
    let function_prototype = machine.intrinsic(Intrinsic::FunctionPrototype)?;
    for intrinsic in Intrinsic::ALL {
        let instance = machine.intrinsic(*intrinsic)?;
        match intrinsic.shape() {
            Shape::Constructor(prototype) => {
                machine.set_header_prototype(instance, Some(function_prototype));
                let prototype = machine.intrinsic(prototype)?;
                machine.define(instance, KeyId::PROTOTYPE, Value::Reference(prototype), LOCKED)?;
                machine.define(prototype, KeyId::CONSTRUCTOR, Value::Reference(instance), HIDDEN)?;
                name_function(machine, instance, intrinsic.name(), 1)?;
            }
            Shape::Function => {
                machine.set_header_prototype(instance, Some(function_prototype));
                name_function(machine, instance, intrinsic.name(), 0)?;
            }
            Shape::Namespace => machine.set_header_prototype(instance, Some(object_prototype)),
            Shape::Prototype(parent) => {
                let parent = parent.map(|p| machine.intrinsic(p)).transpose()?;
                machine.set_header_prototype(instance, parent);
            }
        }
    }

    for (function, prototype) in [
        (Intrinsic::GeneratorFunctionPrototype, Intrinsic::GeneratorPrototype),
        (
            Intrinsic::AsyncGeneratorFunctionPrototype,
            Intrinsic::AsyncGeneratorPrototype,
        ),
    ] {
        let function = machine.intrinsic(function)?;
        let prototype = machine.intrinsic(prototype)?;
        machine.define(function, KeyId::PROTOTYPE, Value::Reference(prototype), LOCKED)?;
    }

    let object = machine.intrinsic(Intrinsic::Object)?;
    let freeze = machine.new_function(fx_object_freeze, "freeze", 1)?;
    machine.define(object, KeyId::FREEZE, Value::Reference(freeze), HIDDEN)?;
    let is_frozen = machine.new_function(fx_object_is_frozen, "isFrozen", 1)?;
    machine.define(object, KeyId::IS_FROZEN, Value::Reference(is_frozen), HIDDEN)?;
    let date = machine.intrinsic(Intrinsic::Date)?;
    let now = machine.new_function(fx_date_now, "now", 0)?;
    machine.define(date, KeyId::NOW, Value::Reference(now), HIDDEN)?;
    let math = machine.intrinsic(Intrinsic::Math)?;
    let random = machine.new_function(fx_math_random, "random", 0)?;
    machine.define(math, KeyId::RANDOM, Value::Reference(random), HIDDEN)?;

    let array_prototype = machine.intrinsic(Intrinsic::ArrayPrototype)?;
    let unscopables = machine.new_object(None)?;
    machine.define(
        array_prototype,
        well_known::UNSCOPABLES,
        Value::Reference(unscopables),
        HIDDEN.union(SlotFlags::DONT_SET),
    )?;

    for accessor in InternalAccessor::ALL {
        let getter = machine.new_function(fx_unsupported, accessor.name(), 0)?;
        let setter = machine.new_function(fx_unsupported, accessor.name(), 1)?;
        machine.stack[accessor.stack_index()] = Slot::new(Value::Accessor {
            getter: Some(getter),
            setter: Some(setter),
        });
    }

    let global = machine.new_object(Some(object_prototype))?;
    machine.set_root(Root::Global, Value::Reference(global));
    for intrinsic in Intrinsic::ALL.iter().filter(|i| i.is_global()) {
        let key = machine.intern(intrinsic.name())?;
        let value = Value::Reference(machine.intrinsic(*intrinsic)?);
        machine.define(global, key, value, HIDDEN)?;
    }
    machine.define(global, KeyId::GLOBAL_THIS, Value::Reference(global), HIDDEN)?;
    machine.define(global, KeyId::GLOBAL, Value::Reference(global), HIDDEN)?;

    let program = machine.new_object(None)?;
    machine.set_root(Root::Program, Value::Reference(program));
    let hosts = machine.new_object(None)?;
    machine.set_root(Root::Hosts, Value::Reference(hosts));
    let timers = machine.new_queue()?;
    machine.define(timers, KeyId::ID, Value::Integer(1), SlotFlags::empty())?;
    machine.set_root(Root::Timers, Value::Reference(timers));
    let jobs = machine.new_queue()?;
    machine.set_root(Root::Jobs, Value::Reference(jobs));
    machine.set_root(Root::Exception, Value::Undefined);
    machine.set_root(Root::Lockdown, Value::Boolean(false));
    Ok(())
}

/// Validate the roots and intrinsics of a reconstructed machine
pub(crate) fn check(machine: &Machine) -> MachineResult<()> {
    let instance = |index: usize| match machine.stack[index].value {
        Value::Reference(r) => machine
            .get_slot(r)
            .is_some_and(|slot| slot.kind() == SlotKind::Instance),
        _ => false,
    };
    for root in [Root::Global, Root::Program, Root::Hosts, Root::Timers, Root::Jobs] {
        if !instance(root.index()) {
            return Err(MachineError::range_error(format!("{:?} root is damaged", root)));
        }
    }
    if !matches!(machine.root(Root::Lockdown), Value::Boolean(_)) {
        return Err(MachineError::range_error("lockdown root is damaged"));
    }
    for intrinsic in Intrinsic::ALL {
        if !instance(intrinsic.stack_index()) {
            return Err(MachineError::range_error(format!(
                "intrinsic {} is damaged",
                intrinsic.name()
            )));
        }
    }
    for accessor in InternalAccessor::ALL {
        if machine.stack[accessor.stack_index()].kind() != SlotKind::Accessor {
            return Err(MachineError::range_error(format!(
                "internal accessor {:?} is damaged",
                accessor
            )));
        }
    }
    Ok(())
}

fn name_function(
    machine: &mut Machine,
    function: SlotRef,
    name: &str,
    length: i32,
) -> MachineResult<()> {
    let name = machine.new_string(name);
    let flag = LOCKED.difference(SlotFlags::DONT_DELETE);
    machine.define(function, KeyId::LENGTH, Value::Integer(length), flag)?;
    machine.define(function, KeyId::NAME, name, flag)?;
    Ok(())
}

pub(crate) fn fx_unsupported(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Err(MachineError::type_error("not supported by this host"))
}

pub(crate) fn fx_object_freeze(machine: &mut Machine, frame: &CallFrame<'_>) -> MachineResult<Value> {
    let value = frame.arg(0);
    if let Value::Reference(instance) = value {
        freeze::freeze(machine, instance, frame.arg(1).is_truthy())?;
    }
    Ok(value)
}

pub(crate) fn fx_object_is_frozen(
    machine: &mut Machine,
    frame: &CallFrame<'_>,
) -> MachineResult<Value> {
    Ok(Value::Boolean(match frame.arg(0) {
        Value::Reference(instance) => freeze::is_frozen(machine, instance),
        _ => true,
    }))
}

pub(crate) fn fx_date_now(_machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Ok(Value::Number(crate::platform::now_ms()))
}

pub(crate) fn fx_math_random(machine: &mut Machine, _frame: &CallFrame<'_>) -> MachineResult<Value> {
    Ok(Value::Number(machine.next_random()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::Creation;

    #[test]
    fn test_intrinsics_are_laid_out_after_roots() {
        assert_eq!(Intrinsic::Object.stack_index(), Root::COUNT);
        assert_eq!(
            InternalAccessor::TypedArray.stack_index(),
            STACK_BASE - 1
        );
        assert_eq!(Intrinsic::ALL.first(), Some(&Intrinsic::Object));
        assert_eq!(Intrinsic::ALL.last(), Some(&Intrinsic::OnThenable));
    }

    #[test]
    fn test_constructor_and_prototype_link() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let array = machine.intrinsic(Intrinsic::Array).unwrap();
        let prototype = machine.intrinsic(Intrinsic::ArrayPrototype).unwrap();
        assert_eq!(
            machine.get(array, KeyId::PROTOTYPE).unwrap(),
            Value::Reference(prototype)
        );
        assert_eq!(
            machine.get(prototype, KeyId::CONSTRUCTOR).unwrap(),
            Value::Reference(array)
        );
        let function_prototype = machine.intrinsic(Intrinsic::FunctionPrototype).unwrap();
        assert_eq!(machine.prototype_of(array), Some(function_prototype));
    }

    #[test]
    fn test_globals_are_installed() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let global = machine.global().unwrap();
        let key = machine.intern("Compartment").unwrap();
        let compartment = machine.intrinsic(Intrinsic::Compartment).unwrap();
        assert_eq!(machine.get(global, key).unwrap(), Value::Reference(compartment));
        assert_eq!(
            machine.get(global, KeyId::GLOBAL_THIS).unwrap(),
            Value::Reference(global)
        );
        // hidden prototypes are not globals
        assert!(machine.find_key("GeneratorPrototype").is_none());
    }

    #[test]
    fn test_unsupported_constructor_throws() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let map = machine.intrinsic(Intrinsic::Map).unwrap();
        let error = machine
            .call(Value::Reference(map), Value::Undefined, &[])
            .unwrap_err();
        assert!(error.is_type_error());
    }

    #[test]
    fn test_math_random_and_date_now() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let math = machine.intrinsic(Intrinsic::Math).unwrap();
        let random = machine.get(math, KeyId::RANDOM).unwrap();
        let value = machine.call(random, Value::Reference(math), &[]).unwrap();
        assert!(matches!(value, Value::Number(n) if (0.0..1.0).contains(&n)));
        let date = machine.intrinsic(Intrinsic::Date).unwrap();
        let now = machine.get(date, KeyId::NOW).unwrap();
        let value = machine.call(now, Value::Reference(date), &[]).unwrap();
        assert!(matches!(value, Value::Number(n) if n > 0.0));
    }
}
