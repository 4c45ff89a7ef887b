use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::constant_pool::ConstantPool;
use crate::error::ExecError;
use crate::internal;

/// Executable form of one resolved method, as produced by the loading
/// subsystem: raw bytecode plus the frame-sizing metadata and the owning
/// class's constant pool.
#[derive(Debug)]
pub struct MethodEntry {
    pub class_name: String,
    pub name: String,
    pub descriptor: String,
    pub access_flags: u16,
    pub max_stack: usize,
    pub max_locals: usize,
    pub code: Arc<Vec<u8>>,
    pub constant_pool: Arc<ConstantPool>,
}

impl MethodEntry {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}{}", self.class_name, self.name, self.descriptor)
    }
}

/// Method resolution capability consumed by the interpreter.
///
/// Passed in at construction time so the core never reaches into the
/// loading subsystem directly.
pub trait MethodResolver: Send + Sync {
    fn lookup(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<Arc<MethodEntry>, ExecError>;
}

/// In-memory method table keyed by `class.name(descriptor)`.
#[derive(Default)]
pub struct MethodTable {
    methods: RwLock<HashMap<String, Arc<MethodEntry>>>,
}

impl MethodTable {
    fn key(class: &str, name: &str, descriptor: &str) -> String {
        format!("{class}.{name}{descriptor}")
    }

    pub fn register(&self, entry: MethodEntry) -> Result<(), ExecError> {
        let key = Self::key(&entry.class_name, &entry.name, &entry.descriptor);
        let mut methods = self
            .methods
            .write()
            .map_err(|e| internal!("lock poisoned: {e}"))?;
        methods.insert(key, Arc::new(entry));
        Ok(())
    }
}

impl MethodResolver for MethodTable {
    fn lookup(
        &self,
        class: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<Arc<MethodEntry>, ExecError> {
        let methods = self
            .methods
            .read()
            .map_err(|e| internal!("lock poisoned: {e}"))?;
        methods
            .get(&Self::key(class, name, descriptor))
            .cloned()
            .ok_or_else(|| ExecError::MethodNotFound {
                class: class.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            })
    }
}
