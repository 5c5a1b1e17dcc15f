// This module provides the one piece of state shared across concurrently running compilations:
// a process-wide table of interned constant values. Identical literals referenced by different
// compilation units resolve to the same Arc<Constant>, so per-compilation data caches can key on
// a cheap shared handle. The table is a lazily created singleton (OnceLock) guarding a hashbrown
// set with an RwLock: lookups of already interned values only take the read lock, inserts take
// the write lock and re-check. Lock poisoning is ignored since the set is always consistent
// between operations.

//! Process-wide constant interning.

use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use hashbrown::HashSet;

use super::data::Constant;

/// Concurrency-safe set of interned constants.
pub struct ConstantTable {
    constants: RwLock<HashSet<Arc<Constant>>>,
}

impl ConstantTable {
    pub fn new() -> Self {
        Self {
            constants: RwLock::new(HashSet::new()),
        }
    }

    /// Table shared by every compilation in the process.
    pub fn global() -> &'static ConstantTable {
        static INSTANCE: OnceLock<ConstantTable> = OnceLock::new();
        INSTANCE.get_or_init(ConstantTable::new)
    }

    /// Return the canonical shared handle for `constant`.
    pub fn intern(&self, constant: Constant) -> Arc<Constant> {
        {
            let set = self
                .constants
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = set.get(&constant) {
                return Arc::clone(existing);
            }
        }
        let mut set = self
            .constants
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(set.get_or_insert(Arc::new(constant)))
    }

    pub fn len(&self) -> usize {
        self.constants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConstantTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Intern through the process-wide table.
pub fn intern(constant: Constant) -> Arc<Constant> {
    ConstantTable::global().intern(constant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_constants_share_one_handle() {
        let table = ConstantTable::new();
        let a = table.intern(Constant::Double(0x3FF0_0000_0000_0000));
        let b = table.intern(Constant::double(1.0));
        assert!(Arc::ptr_eq(&a, &b));
        let c = table.intern(Constant::Long(0x3FF0_0000_0000_0000));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn concurrent_interning_converges() {
        let table = ConstantTable::new();
        let handles: Vec<Arc<Constant>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        for i in 0..64 {
                            table.intern(Constant::Int(i));
                        }
                        table.intern(Constant::Float(0.5f32.to_bits()))
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        assert_eq!(table.len(), 65);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }
}
