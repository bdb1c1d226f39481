//! Heap walker
//!
//! Generic traversal of the object graph. A node is an instance, an
//! environment or a closure binding; [`edges`] lists the nodes directly
//! reachable from one node, labelled with the path segment used to reach
//! them. [`Walker`] does an iterative depth-first walk over those edges,
//! visiting every node at most once per walker, and keeps the current path
//! for diagnostics.
//!
//! Visited state is a hash set owned by the walker, so no flag bits are left
//! in the heap whatever happens to the pass using it.

use rustc_hash::FxHashSet;

use crate::machine::Machine;
use crate::slot::{KeyId, SlotRef, Value};

/// Node of the object graph
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Node {
    /// Instance header
    Instance(SlotRef),
    /// Environment instance
    Environment(SlotRef),
    /// Closure binding
    Binding(SlotRef),
}

impl Node {
    /// Slot of the node
    pub fn slot(self) -> SlotRef {
        match self {
            Self::Instance(r) | Self::Environment(r) | Self::Binding(r) => r,
        }
    }
}

/// Label of an edge
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Segment {
    /// Module of the program
    Module(KeyId),
    /// Export of a module
    Export(KeyId),
    /// Property of the global object
    Global(KeyId),
    /// Prototype
    Prototype,
    /// Own data property
    Property(KeyId),
    /// Array item
    Item(u32),
    /// Getter of an accessor property
    Getter(KeyId),
    /// Setter of an accessor property
    Setter(KeyId),
    /// Variable of an environment
    Variable(KeyId),
    /// Environment captured by a function
    Closures,
    /// Outer environment
    Outer,
    /// Value held by a binding
    Value,
    /// Proxy handler
    ProxyHandler,
    /// Proxy target
    ProxyTarget,
    /// Private field
    Private(KeyId),
    /// Map or set entry
    Entry(u32),
    /// Buffer behind a view
    Buffer,
}

/// Edge of the object graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    /// Label
    pub segment: Segment,
    /// Destination
    pub node: Node,
}

impl Edge {
    fn new(segment: Segment, node: Node) -> Self {
        Self { segment, node }
    }
}

/// Nodes directly reachable from `node`, in traversal order: prototype (or
/// outer environment) first, then the slot chain in order.
pub fn edges(machine: &Machine, node: Node) -> Vec<Edge> {
    let mut edges = Vec::new();
    match node {
        Node::Instance(instance) => instance_edges(machine, instance, &mut edges),
        Node::Environment(environment) => {
            if let Some(outer) = machine.outer_environment(environment) {
                edges.push(Edge::new(Segment::Outer, Node::Environment(outer)));
            }
            for (name, binding) in machine.bindings(environment) {
                edges.push(Edge::new(Segment::Variable(name), Node::Binding(binding)));
            }
        }
        Node::Binding(binding) => {
            if let Some(Value::Reference(r)) = machine.get_slot(binding).map(|slot| slot.value) {
                edges.push(Edge::new(Segment::Value, Node::Instance(r)));
            }
        }
    }
    edges
}

fn instance_edges(machine: &Machine, instance: SlotRef, edges: &mut Vec<Edge>) {
    if let Some(prototype) = machine.prototype_of(instance) {
        edges.push(Edge::new(Segment::Prototype, Node::Instance(prototype)));
    }
    for (_, slot) in machine.chain(instance) {
        if slot.is_internal() {
            internal_edges(machine, instance, slot.value, edges);
            continue;
        }
        let Some(key) = slot.key() else {
            continue;
        };
        match slot.value {
            Value::Reference(r) => edges.push(Edge::new(Segment::Property(key), Node::Instance(r))),
            Value::Accessor { getter, setter } => {
                if let Some(getter) = getter {
                    edges.push(Edge::new(Segment::Getter(key), Node::Instance(getter)));
                }
                if let Some(setter) = setter {
                    edges.push(Edge::new(Segment::Setter(key), Node::Instance(setter)));
                }
            }
            Value::Export {
                closure: Some(binding),
                ..
            } => edges.push(Edge::new(Segment::Export(key), Node::Binding(binding))),
            Value::Closure(binding) => {
                edges.push(Edge::new(Segment::Variable(key), Node::Binding(binding)))
            }
            _ => {}
        }
    }
}

fn internal_edges(machine: &Machine, instance: SlotRef, value: Value, edges: &mut Vec<Edge>) {
    match value {
        Value::Callback {
            closures: Some(environment),
            ..
        }
        | Value::Code {
            closures: Some(environment),
            ..
        } => edges.push(Edge::new(Segment::Closures, Node::Environment(environment))),
        Value::Array { .. } => {
            // a damaged store has no items to walk
            for (index, item) in machine.item_slots(instance).unwrap_or_default().iter().enumerate() {
                if let Value::Reference(r) = item.value {
                    edges.push(Edge::new(Segment::Item(index as u32), Node::Instance(r)));
                }
            }
        }
        Value::Proxy { handler, target } => {
            if let Some(handler) = handler {
                edges.push(Edge::new(Segment::ProxyHandler, Node::Instance(handler)));
            }
            if let Some(target) = target {
                edges.push(Edge::new(Segment::ProxyTarget, Node::Instance(target)));
            }
        }
        Value::Private { first } => {
            let mut link = first;
            while let Some(field) = link {
                let Some(slot) = machine.get_slot(field) else {
                    break;
                };
                let key = KeyId(slot.id.unwrap_or_default());
                match slot.value {
                    Value::Reference(r) => {
                        edges.push(Edge::new(Segment::Private(key), Node::Instance(r)))
                    }
                    Value::Accessor { getter, setter } => {
                        for function in [getter, setter].into_iter().flatten() {
                            edges.push(Edge::new(Segment::Private(key), Node::Instance(function)));
                        }
                    }
                    _ => {}
                }
                link = slot.next;
            }
        }
        Value::Map { entries }
        | Value::Set { entries }
        | Value::WeakMap { entries }
        | Value::WeakSet { entries } => {
            let mut link = entries;
            let mut index = 0;
            while let Some(entry) = link {
                let Some(slot) = machine.get_slot(entry) else {
                    break;
                };
                if let Value::Reference(r) = slot.value {
                    edges.push(Edge::new(Segment::Entry(index), Node::Instance(r)));
                }
                index += 1;
                link = slot.next;
            }
        }
        Value::Module {
            exports,
            environment,
        } => {
            if let Some(exports) = exports {
                for (_, slot) in machine.properties(exports) {
                    if let (
                        Some(name),
                        Value::Export {
                            closure: Some(binding),
                            ..
                        },
                    ) = (slot.key(), slot.value)
                    {
                        edges.push(Edge::new(Segment::Export(name), Node::Binding(binding)));
                    }
                }
            }
            if let Some(environment) = environment {
                edges.push(Edge::new(Segment::Closures, Node::Environment(environment)));
            }
        }
        Value::Reference(buffer) => edges.push(Edge::new(Segment::Buffer, Node::Instance(buffer))),
        _ => {}
    }
}

/// Path from the current root to the node being visited
pub type Path = [Segment];

/// What to do after visiting a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visit {
    /// Walk the node's edges
    Descend,
    /// Do not walk below this node
    Skip,
}

/// Callback of a walk
pub trait Visitor {
    /// Called once per node, with the path that first reached it
    fn visit(&mut self, machine: &Machine, node: Node, path: &Path) -> Visit;
}

impl<F> Visitor for F
where
    F: FnMut(&Machine, Node, &Path) -> Visit,
{
    fn visit(&mut self, machine: &Machine, node: Node, path: &Path) -> Visit {
        self(machine, node, path)
    }
}

struct Frame {
    edges: Vec<Edge>,
    next: usize,
}

/// Depth-first walker. Nodes stay visited across [`Walker::walk`] calls on
/// the same walker, so several roots can share one traversal.
#[derive(Default)]
pub struct Walker {
    visited: FxHashSet<SlotRef>,
    path: Vec<Segment>,
    frames: Vec<Frame>,
}

impl Walker {
    /// Create a walker
    pub fn new() -> Self {
        Self::default()
    }

    /// Has this node been visited
    pub fn is_visited(&self, node: Node) -> bool {
        self.visited.contains(&node.slot())
    }

    /// Number of nodes visited so far
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    /// Walk from `root`, reached through `prefix`
    pub fn walk(
        &mut self,
        machine: &Machine,
        prefix: &[Segment],
        root: Node,
        visitor: &mut impl Visitor,
    ) {
        self.path.clear();
        self.frames.clear();
        let Some((last, leading)) = prefix.split_last() else {
            self.path.clear();
            self.enter(machine, None, root, visitor);
            self.drain(machine, visitor);
            return;
        };
        self.path.extend_from_slice(leading);
        self.enter(machine, Some(*last), root, visitor);
        self.drain(machine, visitor);
        self.path.clear();
    }

    fn enter(
        &mut self,
        machine: &Machine,
        segment: Option<Segment>,
        node: Node,
        visitor: &mut impl Visitor,
    ) -> bool {
        if machine.get_slot(node.slot()).is_none() || !self.visited.insert(node.slot()) {
            return false;
        }
        if let Some(segment) = segment {
            self.path.push(segment);
        }
        match visitor.visit(machine, node, &self.path) {
            Visit::Descend => {
                self.frames.push(Frame {
                    edges: edges(machine, node),
                    next: 0,
                });
                true
            }
            Visit::Skip => {
                if segment.is_some() {
                    self.path.pop();
                }
                false
            }
        }
    }

    fn drain(&mut self, machine: &Machine, visitor: &mut impl Visitor) {
        let root_depth = self.path.len();
        while let Some(frame) = self.frames.last_mut() {
            if frame.next < frame.edges.len() {
                let edge = frame.edges[frame.next];
                frame.next += 1;
                self.enter(machine, Some(edge.segment), edge.node, visitor);
            } else {
                self.frames.pop();
                // the root frame's segment belongs to the caller's prefix
                if !self.frames.is_empty() || self.path.len() > root_depth {
                    self.path.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creation::Creation;
    use crate::slot::SlotFlags;

    #[test]
    fn test_cycles_visit_each_node_once() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let a = machine.new_object(None).unwrap();
        let b = machine.new_object(None).unwrap();
        let key = machine.intern("peer").unwrap();
        machine.define(a, key, Value::Reference(b), SlotFlags::empty()).unwrap();
        machine.define(b, key, Value::Reference(a), SlotFlags::empty()).unwrap();
        machine.define(a, KeyId::NAME, Value::Reference(a), SlotFlags::empty()).unwrap();

        let mut seen = Vec::new();
        let mut walker = Walker::new();
        walker.walk(&machine, &[], Node::Instance(a), &mut |_: &Machine, node: Node, path: &Path| {
            seen.push((node, path.to_vec()));
            Visit::Descend
        });
        assert_eq!(
            seen,
            vec![
                (Node::Instance(a), vec![]),
                (Node::Instance(b), vec![Segment::Property(key)]),
            ]
        );
        assert!(walker.is_visited(Node::Instance(b)));
    }

    #[test]
    fn test_prototype_comes_first() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let parent = machine.new_object(None).unwrap();
        let child = machine.new_object(Some(parent)).unwrap();
        let other = machine.new_object(None).unwrap();
        let key = machine.intern("other").unwrap();
        machine.define(child, key, Value::Reference(other), SlotFlags::empty()).unwrap();
        let edges = edges(&machine, Node::Instance(child));
        assert_eq!(
            edges,
            vec![
                Edge::new(Segment::Prototype, Node::Instance(parent)),
                Edge::new(Segment::Property(key), Node::Instance(other)),
            ]
        );
    }

    #[test]
    fn test_path_is_restored_between_siblings() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let root = machine.new_object(None).unwrap();
        let left = machine.new_object(None).unwrap();
        let leaf = machine.new_object(None).unwrap();
        let right = machine.new_object(None).unwrap();
        let l = machine.intern("l").unwrap();
        let r = machine.intern("r").unwrap();
        let x = machine.intern("x").unwrap();
        machine.define(root, l, Value::Reference(left), SlotFlags::empty()).unwrap();
        machine.define(root, r, Value::Reference(right), SlotFlags::empty()).unwrap();
        machine.define(left, x, Value::Reference(leaf), SlotFlags::empty()).unwrap();

        let mut paths = Vec::new();
        let prefix = [Segment::Global(x)];
        Walker::new().walk(&machine, &prefix, Node::Instance(root), &mut |_: &Machine, _: Node, path: &Path| {
            paths.push(path.to_vec());
            Visit::Descend
        });
        assert_eq!(
            paths,
            vec![
                vec![Segment::Global(x)],
                vec![Segment::Global(x), Segment::Property(l)],
                vec![Segment::Global(x), Segment::Property(l), Segment::Property(x)],
                vec![Segment::Global(x), Segment::Property(r)],
            ]
        );
    }

    #[test]
    fn test_environment_edges() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let outer = machine.new_environment(None).unwrap();
        let inner = machine.new_environment(Some(outer)).unwrap();
        let object = machine.new_object(None).unwrap();
        let v = machine.intern("v").unwrap();
        let binding = machine
            .declare(inner, v, Value::Reference(object), crate::modules::Declaration::Let)
            .unwrap();
        assert_eq!(
            edges(&machine, Node::Environment(inner)),
            vec![
                Edge::new(Segment::Outer, Node::Environment(outer)),
                Edge::new(Segment::Variable(v), Node::Binding(binding)),
            ]
        );
        assert_eq!(
            edges(&machine, Node::Binding(binding)),
            vec![Edge::new(Segment::Value, Node::Instance(object))]
        );
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let mut machine = Machine::new(Creation::small()).unwrap();
        let key = machine.intern("next").unwrap();
        let head = machine.new_object(None).unwrap();
        let mut tail = head;
        for _ in 0..2000 {
            let next = machine.new_object(None).unwrap();
            machine.define(tail, key, Value::Reference(next), SlotFlags::empty()).unwrap();
            tail = next;
        }
        let mut count = 0;
        let mut walker = Walker::new();
        walker.walk(&machine, &[], Node::Instance(head), &mut |_: &Machine, _: Node, _: &Path| {
            count += 1;
            Visit::Descend
        });
        assert_eq!(count, 2001);
    }
}
