//! Interned, reference-counted name bindings.
//!
//! The engine keeps one [`SymbolTable`] each for rule names, variable names,
//! host names and metric names. A [`Symbol`] is a small copyable handle; the
//! table owns the name and an optional value. Releasing the last reference
//! hands the value back to the caller instead of dropping it, since the
//! owner of the value decides how it is torn down.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Slot<V> {
    name: String,
    value: Option<V>,
    refs: u32,
}

#[derive(Debug)]
pub struct SymbolTable<V> {
    slots: Vec<Option<Slot<V>>>,
    /// Vacant slot indices, lowest reused first.
    free: BTreeSet<u32>,
    index: HashMap<String, Symbol>,
}

impl<V> Default for SymbolTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> SymbolTable<V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            index: HashMap::new(),
        }
    }

    /// Returns the existing symbol for `name` with one more reference, or
    /// allocates a new one with a single reference and no value.
    pub fn intern(&mut self, name: &str) -> Symbol {
        if let Some(&sym) = self.index.get(name) {
            return self.copy(sym);
        }
        let slot = Slot {
            name: name.to_string(),
            value: None,
            refs: 1,
        };
        let sym = match self.free.pop_first() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                Symbol(idx)
            }
            None => {
                self.slots.push(Some(slot));
                Symbol((self.slots.len() - 1) as u32)
            }
        };
        self.index.insert(name.to_string(), sym);
        sym
    }

    /// Finds a symbol without creating it or touching its reference count.
    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.index.get(name).copied()
    }

    /// Adds a reference to `sym`.
    pub fn copy(&mut self, sym: Symbol) -> Symbol {
        if let Some(slot) = self.slot_mut(sym) {
            slot.refs += 1;
        }
        sym
    }

    /// Drops one reference. When the count reaches zero the name is freed,
    /// the slot becomes reusable and the bound value (if any) is returned.
    pub fn release(&mut self, sym: Symbol) -> Option<V> {
        let slot = self.slot_mut(sym)?;
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs > 0 {
            return None;
        }
        let slot = self.slots[sym.index()].take()?;
        self.index.remove(&slot.name);
        self.free.insert(sym.0);
        slot.value
    }

    pub fn name(&self, sym: Symbol) -> &str {
        self.slot(sym).map_or("", |s| s.name.as_str())
    }

    pub fn refs(&self, sym: Symbol) -> u32 {
        self.slot(sym).map_or(0, |s| s.refs)
    }

    pub fn value(&self, sym: Symbol) -> Option<&V> {
        self.slot(sym).and_then(|s| s.value.as_ref())
    }

    /// Binds a value, returning the previous one.
    pub fn set_value(&mut self, sym: Symbol, value: V) -> Option<V> {
        self.slot_mut(sym).and_then(|s| s.value.replace(value))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live symbols in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Symbol, &str)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (Symbol(i as u32), s.name.as_str())))
    }

    fn slot(&self, sym: Symbol) -> Option<&Slot<V>> {
        self.slots.get(sym.index()).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, sym: Symbol) -> Option<&mut Slot<V>> {
        self.slots.get_mut(sym.index()).and_then(|s| s.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_returns_same_symbol_and_counts_references() {
        let mut table: SymbolTable<u32> = SymbolTable::new();
        let a = table.intern("kernel.all.load");
        let b = table.intern("kernel.all.load");
        assert_eq!(a, b);
        assert_eq!(table.refs(a), 2);
        assert_eq!(table.lookup("kernel.all.load"), Some(a));
        assert_eq!(table.lookup("missing"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn release_at_zero_returns_value_and_recycles_slot() {
        let mut table: SymbolTable<&'static str> = SymbolTable::new();
        let a = table.intern("a");
        let b = table.intern("b");
        table.set_value(a, "payload");
        table.copy(a);

        assert_eq!(table.release(a), None);
        assert_eq!(table.name(a), "a");
        assert_eq!(table.release(a), Some("payload"));
        assert_eq!(table.lookup("a"), None);

        let c = table.intern("c");
        assert_eq!(c, a, "lowest free slot is reused");
        assert_eq!(table.value(c), None);
        assert_eq!(table.name(b), "b");
        let names: Vec<&str> = table.iter().map(|(_, n)| n).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn release_of_stale_symbol_is_ignored() {
        let mut table: SymbolTable<()> = SymbolTable::new();
        let a = table.intern("a");
        table.release(a);
        assert_eq!(table.release(a), None);
        assert_eq!(table.refs(a), 0);
        assert!(table.is_empty());
    }
}
