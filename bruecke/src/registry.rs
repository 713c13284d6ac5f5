//! Process-wide registries for host-backed runtime objects.
//!
//! Three singletons: protocol implementations keyed by instance pointer,
//! subclass implementations keyed by class pointer, and the append-only
//! block registry. Each has its own lock; every lookup copies (an `Arc` of)
//! the entry out and drops the lock before anything host-facing runs —
//! no lock is ever held across a host call or a run-loop pump.
//!
//! Invariant: a key present in a registry implies the entry's host
//! callbacks are rooted. Removal precedes dropping the last root.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use host::ThreadSafeFunction;
use parking_lot::{Mutex, RwLock};

use crate::block::BlockInfo;

/// A rooted callback plus the method encoding it answers for.
#[derive(Clone)]
pub struct CallbackEntry {
    pub tsfn: ThreadSafeFunction,
    pub encoding: String,
}

/// State of one host-created protocol instance.
pub struct ProtocolImpl {
    pub class_name: String,
    /// selector name → callback
    pub callbacks: HashMap<String, CallbackEntry>,
    pub home_thread: u64,
    /// When set, same-thread calls still take the thread-safe path.
    pub cross_context: bool,
}

impl ProtocolImpl {
    pub fn callback(&self, selector: &str) -> Option<&CallbackEntry> {
        self.callbacks.get(selector)
    }
}

/// One method override of a host-defined subclass.
#[derive(Clone)]
pub struct MethodOverride {
    pub tsfn: ThreadSafeFunction,
    pub encoding: String,
    pub is_class_method: bool,
}

/// State of one host-defined subclass. Never torn down: class objects live
/// for the process.
pub struct SubclassImpl {
    pub class_name: String,
    pub class_ptr: usize,
    pub superclass_ptr: usize,
    /// selector name → override
    pub methods: HashMap<String, MethodOverride>,
    pub home_thread: u64,
    pub cross_context: bool,
}

impl SubclassImpl {
    pub fn method(&self, selector: &str) -> Option<&MethodOverride> {
        self.methods.get(selector)
    }
}

// ── Protocol registry ────────────────────────────────────────────────

pub struct ProtocolRegistry {
    map: Mutex<HashMap<usize, Arc<ProtocolImpl>>>,
}

impl ProtocolRegistry {
    pub fn register(&self, instance: usize, entry: Arc<ProtocolImpl>) {
        self.map.lock().insert(instance, entry);
    }

    pub fn lookup(&self, instance: usize) -> Option<Arc<ProtocolImpl>> {
        self.map.lock().get(&instance).cloned()
    }

    /// Remove on dealloc; the returned entry is the last root holder.
    pub fn remove(&self, instance: usize) -> Option<Arc<ProtocolImpl>> {
        self.map.lock().remove(&instance)
    }

    pub fn contains(&self, instance: usize) -> bool {
        self.map.lock().contains_key(&instance)
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn protocols() -> &'static ProtocolRegistry {
    static REGISTRY: OnceLock<ProtocolRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| ProtocolRegistry {
        map: Mutex::new(HashMap::new()),
    })
}

// ── Subclass registry ────────────────────────────────────────────────

pub struct SubclassRegistry {
    map: RwLock<HashMap<usize, Arc<SubclassImpl>>>,
}

impl SubclassRegistry {
    pub fn register(&self, class_ptr: usize, entry: Arc<SubclassImpl>) {
        self.map.write().insert(class_ptr, entry);
    }

    pub fn lookup(&self, class_ptr: usize) -> Option<Arc<SubclassImpl>> {
        self.map.read().get(&class_ptr).cloned()
    }

    /// Walk a class chain (produced by `superclass_of`) until a registered
    /// class is found.
    pub fn lookup_in_hierarchy(
        &self,
        mut class_ptr: usize,
        superclass_of: impl Fn(usize) -> usize,
    ) -> Option<Arc<SubclassImpl>> {
        let map = self.map.read();
        while class_ptr != 0 {
            if let Some(entry) = map.get(&class_ptr) {
                return Some(entry.clone());
            }
            class_ptr = superclass_of(class_ptr);
        }
        None
    }

    pub fn contains(&self, class_ptr: usize) -> bool {
        self.map.read().contains_key(&class_ptr)
    }
}

pub fn subclasses() -> &'static SubclassRegistry {
    static REGISTRY: OnceLock<SubclassRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| SubclassRegistry {
        map: RwLock::new(HashMap::new()),
    })
}

// ── Block registry ───────────────────────────────────────────────────

/// Append-only: blocks are deliberately never freed (a block captured by
/// foreign code can be invoked arbitrarily late, and nothing tells the
/// bridge when the last copy is gone).
pub struct BlockRegistry {
    blocks: Mutex<Vec<Arc<BlockInfo>>>,
}

impl BlockRegistry {
    pub fn register(&self, info: Arc<BlockInfo>) {
        self.blocks.lock().push(info);
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }
}

pub fn blocks() -> &'static BlockRegistry {
    static REGISTRY: OnceLock<BlockRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| BlockRegistry {
        blocks: Mutex::new(Vec::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::{CallbackQueue, HostFunction, Value};

    fn test_tsfn() -> ThreadSafeFunction {
        ThreadSafeFunction::new(
            HostFunction::new(0, |_| Ok(Value::Undefined)),
            CallbackQueue::new(),
        )
    }

    #[test]
    fn protocol_entries_round_trip() {
        let registry = protocols();
        let mut callbacks = HashMap::new();
        callbacks.insert(
            "compute:".to_string(),
            CallbackEntry {
                tsfn: test_tsfn(),
                encoding: "q@:q".to_string(),
            },
        );
        let entry = Arc::new(ProtocolImpl {
            class_name: "TestDelegateImpl_1".to_string(),
            callbacks,
            home_thread: 1,
            cross_context: true,
        });

        registry.register(0x1234, entry);
        assert!(registry.contains(0x1234));

        let found = registry.lookup(0x1234).expect("registered entry");
        assert_eq!(
            found.callback("compute:").expect("callback").encoding,
            "q@:q"
        );
        assert!(found.callback("missing:").is_none());

        let removed = registry.remove(0x1234).expect("removed entry");
        assert!(!registry.contains(0x1234));
        assert_eq!(removed.class_name, "TestDelegateImpl_1");
    }

    #[test]
    fn subclass_hierarchy_walk() {
        let registry = subclasses();
        let entry = Arc::new(SubclassImpl {
            class_name: "HostString".to_string(),
            class_ptr: 0x9000,
            superclass_ptr: 0x8000,
            methods: HashMap::new(),
            home_thread: 1,
            cross_context: true,
        });
        registry.register(0x9000, entry);

        // A subclass-of-subclass resolves through the chain 0xa000 → 0x9000.
        let found = registry
            .lookup_in_hierarchy(0xa000, |cls| if cls == 0xa000 { 0x9000 } else { 0 })
            .expect("found through hierarchy");
        assert_eq!(found.class_ptr, 0x9000);

        assert!(registry
            .lookup_in_hierarchy(0xb000, |_| 0)
            .is_none());
    }
}
