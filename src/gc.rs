//! The heap, and the mark-sweep garbage collector that keeps it tidy.
//!
//! Every object lives in an arena slot. An [ObjRef] is the index of its slot; freed slots go on a
//! free list and get reused. The collector is precise: the VM (and the compiler, while it is
//! running) tells it exactly which values are roots, and everything else is found by tracing.
//!
//! The heap never decides *when* to collect on its own. Whoever allocates asks
//! [Heap::should_collect], marks their roots, and calls [Heap::collect].

use std::fmt;

use crate::object::*;
use crate::table::{Key, Table};
use crate::value::Value;

/// Tuning knobs for the collector.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Bytes allocated before the first collection. Later thresholds never drop below this.
    pub initial_threshold: usize,
    /// After a collection, the next one happens once the heap grows to `live * growth_factor`.
    pub growth_factor: f64,
    /// Collect on every allocation.
    pub stress: bool,
    /// Report every collection on stderr.
    pub log: bool,
}

/// Running totals, mostly for tests and `log_gc`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

/// Owns every heap object.
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<usize>,
    /// The intern pool. Keys are the strings; values are unused. Weak: it is pruned before the
    /// sweep instead of being traced.
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
    config: GcConfig,
    stats: GcStats,
}

struct HeapEntry {
    obj: Obj,
    marked: bool,
    size: usize,
}

/// Displays a value the way Joker's `print` does. Created by [Heap::display].
pub struct DisplayValue<'h> {
    heap: &'h Heap,
    value: Value,
}

///////////////////////////////////////// Implementation //////////////////////////////////////////

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_threshold: 1024 * 1024,
            growth_factor: 2.0,
            stress: cfg!(feature = "stress_gc"),
            log: cfg!(feature = "log_gc"),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new(GcConfig::default())
    }
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Heap {
            entries: Vec::new(),
            free_list: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            config,
            stats: GcStats::default(),
        }
    }

    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GcConfig {
        &mut self.config
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// How many objects are currently alive.
    pub fn live_objects(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    /// Returns true if the handle refers to an occupied slot.
    pub fn contains(&self, reference: ObjRef) -> bool {
        matches!(self.entries.get(reference.index()), Some(Some(_)))
    }

    /// Returns true if the next allocation should be preceded by a collection.
    pub fn should_collect(&self) -> bool {
        self.config.stress || self.bytes_allocated > self.next_gc
    }

    /// Moves an object into the arena. Never collects.
    pub fn insert(&mut self, obj: Obj) -> ObjRef {
        let size = obj.heap_size();
        self.bytes_allocated += size;
        let entry = Some(HeapEntry {
            obj,
            marked: false,
            size,
        });

        match self.free_list.pop() {
            Some(index) => {
                self.entries[index] = entry;
                ObjRef::from_index(index)
            }
            None => {
                self.entries.push(entry);
                ObjRef::from_index(self.entries.len() - 1)
            }
        }
    }

    ////////////////////////////////////////// Interning //////////////////////////////////////////

    /// Finds the interned string with these contents, if there is one.
    pub fn find_interned(&self, chars: &str, hash: u32) -> Option<ObjRef> {
        self.strings
            .find_string(hash, |candidate| self.as_str(candidate) == chars)
    }

    /// Adds an already-allocated string to the intern pool.
    pub fn add_interned(&mut self, string: ObjRef) {
        let key = self.key(string);
        self.strings.set(key, Value::None);
    }

    /// How many strings are interned.
    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    /// The table key for a string handle.
    ///
    /// # Panics
    ///
    /// Panics if the handle is not a string.
    #[inline]
    pub fn key(&self, string: ObjRef) -> Key {
        Key {
            string,
            hash: self.string(string).hash,
        }
    }

    ////////////////////////////////////////// Marking ////////////////////////////////////////////

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(reference) = value {
            self.mark_object(reference);
        }
    }

    pub fn mark_object(&mut self, reference: ObjRef) {
        let entry = self.entry_mut(reference);
        if entry.marked {
            return;
        }
        entry.marked = true;
        self.gray.push(reference);
    }

    /// Marks every key and value in the table.
    pub fn mark_table(&mut self, table: &Table) {
        table.for_each_reference(|value| self.mark_value(value));
    }

    /// Traces from everything marked so far, then frees whatever was not reached.
    ///
    /// Roots must be marked before calling this.
    pub fn collect(&mut self) {
        let before = self.bytes_allocated;
        if self.config.log {
            eprintln!("-- gc begin: {} bytes, {} objects", before, self.live_objects());
        }

        self.trace_references();

        let entries = &self.entries;
        self.strings.remove_unmarked(|string| {
            entries[string.index()]
                .as_ref()
                .map_or(false, |entry| entry.marked)
        });

        let (freed, freed_bytes) = self.sweep();

        self.next_gc = ((self.bytes_allocated as f64 * self.config.growth_factor) as usize)
            .max(self.config.initial_threshold);
        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.stats.bytes_freed += freed_bytes;

        if self.config.log {
            eprintln!(
                "-- gc end: collected {} bytes ({} objects), {} bytes remain, next at {}",
                freed_bytes,
                freed,
                self.bytes_allocated,
                self.next_gc
            );
        }
    }

    fn trace_references(&mut self) {
        let mut children = Vec::new();
        while let Some(reference) = self.gray.pop() {
            self.get(reference)
                .for_each_reference(|value| children.push(value));
            for child in children.drain(..) {
                self.mark_value(child);
            }
        }
    }

    /// Frees every unmarked object and unmarks the rest. Returns how many objects and bytes were
    /// freed.
    ///
    /// Survivors are measured again: Vecs, tables and chunks grow after they are inserted, so
    /// `bytes_allocated` becomes the current size of everything still alive.
    fn sweep(&mut self) -> (usize, usize) {
        let (mut freed, mut freed_bytes, mut live_bytes) = (0, 0, 0);
        for (index, slot) in self.entries.iter_mut().enumerate() {
            match slot {
                Some(entry) if entry.marked => {
                    entry.marked = false;
                    entry.size = entry.obj.heap_size();
                    live_bytes += entry.size;
                }
                Some(entry) => {
                    freed_bytes += entry.size;
                    *slot = None;
                    self.free_list.push(index);
                    freed += 1;
                }
                None => {}
            }
        }
        self.bytes_allocated = live_bytes;
        (freed, freed_bytes)
    }

    ////////////////////////////////////////// Access /////////////////////////////////////////////

    /// Returns the object behind a handle.
    ///
    /// # Panics
    ///
    /// Panics if the object has been freed.
    #[inline]
    pub fn get(&self, reference: ObjRef) -> &Obj {
        &self.entry(reference).obj
    }

    #[inline]
    pub fn get_mut(&mut self, reference: ObjRef) -> &mut Obj {
        &mut self.entry_mut(reference).obj
    }

    /// The kind of object a value refers to, or `None` for scalars.
    pub fn kind_of(&self, value: Value) -> Option<ObjKind> {
        value.as_obj().map(|reference| self.get(reference).kind())
    }

    /// The type name Joker programs see for this value.
    pub fn type_name(&self, value: Value) -> &'static str {
        match self.kind_of(value) {
            Some(kind) => kind.type_name(),
            None => value.scalar_type_name(),
        }
    }

    /// Returns the string's contents.
    #[inline]
    pub fn as_str(&self, string: ObjRef) -> &str {
        &self.string(string).chars
    }

    /// If the value is a string, returns its contents.
    pub fn value_as_str(&self, value: Value) -> Option<&str> {
        match value {
            Value::Obj(reference) => match self.get(reference) {
                Obj::String(string) => Some(&string.chars),
                _ => None,
            },
            _ => None,
        }
    }

    /// Returns a wrapper that displays the value, following object references.
    pub fn display(&self, value: Value) -> DisplayValue<'_> {
        DisplayValue { heap: self, value }
    }

    #[inline]
    fn entry(&self, reference: ObjRef) -> &HeapEntry {
        self.entries[reference.index()]
            .as_ref()
            .unwrap_or_else(|| panic!("use of freed object {}", reference.index()))
    }

    #[inline]
    fn entry_mut(&mut self, reference: ObjRef) -> &mut HeapEntry {
        self.entries[reference.index()]
            .as_mut()
            .unwrap_or_else(|| panic!("use of freed object {}", reference.index()))
    }
}

/// Typed accessors. The caller guarantees the kind; a mismatch is a bug and panics.
macro_rules! accessors {
    ($($variant:ident: $type:ty => $get:ident, $get_mut:ident;)*) => {
        impl Heap {
            $(
                #[inline]
                #[allow(dead_code)]
                pub fn $get(&self, reference: ObjRef) -> &$type {
                    match self.get(reference) {
                        Obj::$variant(inner) => inner,
                        other => panic!(
                            "expected {}, found {}",
                            stringify!($variant),
                            other.kind().type_name()
                        ),
                    }
                }

                #[inline]
                #[allow(dead_code)]
                pub fn $get_mut(&mut self, reference: ObjRef) -> &mut $type {
                    match self.get_mut(reference) {
                        Obj::$variant(inner) => inner,
                        other => panic!(
                            "expected {}, found {}",
                            stringify!($variant),
                            other.kind().type_name()
                        ),
                    }
                }
            )*
        }
    };
}

accessors! {
    String: ObjString => string, string_mut;
    Fn: ObjFn => function, function_mut;
    Closure: ObjClosure => closure, closure_mut;
    Upvalue: ObjUpvalue => upvalue, upvalue_mut;
    Class: ObjClass => class, class_mut;
    Instance: ObjInstance => instance, instance_mut;
    Struct: ObjStruct => structure, structure_mut;
    Enum: ObjEnum => enumeration, enumeration_mut;
    EnumInstance: ObjEnumInstance => enum_instance, enum_instance_mut;
    Vec: ObjVec => vector, vector_mut;
    Pair: ObjPair => pair, pair_mut;
    BoundMethod: ObjBoundMethod => bound_method, bound_method_mut;
    Native: ObjNative => native, native_mut;
    Type: ObjType => type_marker, type_marker_mut;
}

impl<'h> DisplayValue<'h> {
    fn write(&self, f: &mut fmt::Formatter, value: Value, visiting: &mut Vec<ObjRef>) -> fmt::Result {
        let reference = match value {
            Value::Obj(reference) => reference,
            scalar => return write!(f, "{scalar}"),
        };

        if visiting.contains(&reference) {
            return write!(f, "[...]");
        }

        let heap = self.heap;
        match heap.get(reference) {
            Obj::String(string) => write!(f, "{}", string.chars),
            Obj::Fn(function) => write_function(f, heap, function),
            Obj::Closure(closure) => write_function(f, heap, heap.function(closure.function)),
            Obj::Native(native) => write!(f, "<native fn {}>", native.name),
            Obj::BoundMethod(bound) => self.write(f, bound.method, visiting),
            Obj::Upvalue(_) => write!(f, "<upvalue>"),
            Obj::Class(class) => write!(f, "<class {}>", heap.as_str(class.name)),
            Obj::Instance(instance) => {
                let class = heap.class(instance.class);
                write!(f, "<{} instance>", heap.as_str(class.name))
            }
            Obj::Enum(enumeration) => write!(f, "<enum {}>", heap.as_str(enumeration.name)),
            Obj::Type(marker) => write!(f, "<type {}>", heap.as_str(marker.name)),
            Obj::Struct(structure) => {
                visiting.push(reference);
                write!(f, "{} {{", heap.as_str(structure.name))?;
                for (i, &name) in structure.field_names.iter().enumerate() {
                    let separator = if i == 0 { " " } else { ", " };
                    write!(f, "{separator}{}: ", heap.as_str(name))?;
                    let field = structure.fields.get(heap.key(name)).unwrap_or_default();
                    self.write(f, field, visiting)?;
                }
                if !structure.field_names.is_empty() {
                    write!(f, " ")?;
                }
                visiting.pop();
                write!(f, "}}")
            }
            Obj::EnumInstance(instance) => {
                let enumeration = heap.enumeration(instance.enumeration);
                write!(
                    f,
                    "{}::{}",
                    heap.as_str(enumeration.name),
                    heap.as_str(instance.member)
                )?;
                if instance.payload.is_empty() {
                    return Ok(());
                }
                visiting.push(reference);
                self.write_sequence(f, "(", &instance.payload, ")", visiting)?;
                visiting.pop();
                Ok(())
            }
            Obj::Vec(vector) => {
                visiting.push(reference);
                self.write_sequence(f, "[", &vector.elements, "]", visiting)?;
                visiting.pop();
                Ok(())
            }
            Obj::Pair(pair) => {
                visiting.push(reference);
                self.write_sequence(f, "(", &[pair.first, pair.second], ")", visiting)?;
                visiting.pop();
                Ok(())
            }
        }
    }

    fn write_sequence(
        &self,
        f: &mut fmt::Formatter,
        open: &str,
        values: &[Value],
        close: &str,
        visiting: &mut Vec<ObjRef>,
    ) -> fmt::Result {
        write!(f, "{open}")?;
        for (i, &value) in values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            self.write(f, value, visiting)?;
        }
        write!(f, "{close}")
    }
}

fn write_function(f: &mut fmt::Formatter, heap: &Heap, function: &ObjFn) -> fmt::Result {
    match function.name {
        Some(name) => write!(f, "<fn {}>", heap.as_str(name)),
        None => write!(f, "<script>"),
    }
}

impl fmt::Display for DisplayValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.write(f, self.value, &mut Vec::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::table::hash_string;

    fn heap() -> Heap {
        Heap::new(GcConfig {
            stress: false,
            log: false,
            ..GcConfig::default()
        })
    }

    fn string(heap: &mut Heap, s: &str) -> ObjRef {
        let hash = hash_string(s);
        if let Some(existing) = heap.find_interned(s, hash) {
            return existing;
        }
        let reference = heap.insert(Obj::String(ObjString {
            chars: s.into(),
            hash,
        }));
        heap.add_interned(reference);
        reference
    }

    #[test]
    fn interning() {
        let mut heap = heap();
        let a = string(&mut heap, "hello");
        let b = string(&mut heap, "hello");
        let c = string(&mut heap, "world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(2, heap.interned_count());
        assert_eq!("world", heap.as_str(c));
    }

    #[test]
    fn reachable_objects_survive() {
        let mut heap = heap();
        let element = string(&mut heap, "kept");
        let vector = heap.insert(Obj::Vec(ObjVec {
            elements: vec![element.into(), Value::I32(1)],
        }));
        let garbage = heap.insert(Obj::Vec(ObjVec::default()));

        heap.mark_object(vector);
        heap.collect();

        assert!(heap.contains(vector));
        assert!(heap.contains(element));
        assert!(!heap.contains(garbage));
        assert_eq!(2, heap.live_objects());
        assert_eq!(1, heap.stats().objects_freed);
    }

    #[test]
    fn unreachable_strings_leave_the_intern_pool() {
        let mut heap = heap();
        let kept = string(&mut heap, "kept");
        string(&mut heap, "dropped");

        heap.mark_object(kept);
        heap.collect();

        assert_eq!(1, heap.interned_count());
        assert_eq!(None, heap.find_interned("dropped", hash_string("dropped")));
        assert_eq!(Some(kept), heap.find_interned("kept", hash_string("kept")));
    }

    #[test]
    fn collecting_twice_changes_nothing() {
        let mut heap = heap();
        let name = string(&mut heap, "A");
        let class = heap.insert(Obj::Class(ObjClass::new(name)));
        heap.insert(Obj::Pair(ObjPair {
            first: Value::None,
            second: Value::None,
        }));

        heap.mark_object(class);
        heap.collect();
        let live = heap.live_objects();
        let bytes = heap.bytes_allocated();

        heap.mark_object(class);
        heap.collect();
        assert_eq!(live, heap.live_objects());
        assert_eq!(bytes, heap.bytes_allocated());
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = heap();
        let a = heap.insert(Obj::Vec(ObjVec::default()));
        let b = heap.insert(Obj::Vec(ObjVec {
            elements: vec![a.into()],
        }));
        heap.vector_mut(a).elements.push(b.into());

        heap.collect();
        assert_eq!(0, heap.live_objects());
        assert_eq!(0, heap.bytes_allocated());
    }

    #[test]
    fn growth_after_insertion_is_counted_at_the_next_collection() {
        let mut heap = heap();
        let vector = heap.insert(Obj::Vec(ObjVec::default()));
        let inserted = heap.bytes_allocated();

        heap.vector_mut(vector)
            .elements
            .extend(std::iter::repeat(Value::I32(0)).take(1000));
        heap.mark_object(vector);
        heap.collect();

        assert_eq!(heap.get(vector).heap_size(), heap.bytes_allocated());
        assert!(heap.bytes_allocated() >= inserted + 1000 * std::mem::size_of::<Value>());
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = heap();
        let first = heap.insert(Obj::Vec(ObjVec::default()));
        heap.collect();
        let second = heap.insert(Obj::Vec(ObjVec::default()));
        assert_eq!(first, second);
    }

    #[test]
    fn display_follows_references() {
        let mut heap = heap();
        let a = string(&mut heap, "a");
        let vector = heap.insert(Obj::Vec(ObjVec {
            elements: vec![Value::I32(1), Value::F64(2.0), a.into()],
        }));
        assert_eq!("[1, 2.0, a]", heap.display(vector.into()).to_string());

        heap.vector_mut(vector).elements.push(vector.into());
        assert_eq!("[1, 2.0, a, [...]]", heap.display(vector.into()).to_string());
    }
}
