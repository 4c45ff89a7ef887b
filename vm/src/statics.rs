use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::ExecError;
use crate::internal;
use crate::object::FieldTag;
use crate::value::Value;

#[derive(Debug, Clone)]
struct StaticSlot {
    tag: FieldTag,
    value: Value,
}

/// Global static-field table keyed `class.field`.
///
/// Reads take the shared lock; writes take the exclusive lock for the
/// duration of the mutation only. A field that was never written reads as
/// the default of its declared kind.
#[derive(Default)]
pub struct StaticTable {
    fields: RwLock<HashMap<String, StaticSlot>>,
}

impl StaticTable {
    fn key(class: &str, name: &str) -> String {
        format!("{class}.{name}")
    }

    pub fn get(&self, class: &str, name: &str, tag: FieldTag) -> Result<Value, ExecError> {
        if !tag.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: Self::key(class, name),
                accessed: "instance",
                actual: "static",
            });
        }

        let fields = self
            .fields
            .read()
            .map_err(|e| internal!("lock poisoned: {e}"))?;
        match fields.get(&Self::key(class, name)) {
            Some(slot) => {
                if slot.tag.kind != tag.kind {
                    return Err(ExecError::FieldTypeMismatch {
                        field: Self::key(class, name),
                        declared: slot.tag.kind.name(),
                        provided: tag.kind.name(),
                    });
                }
                Ok(slot.value.clone())
            }
            None => Ok(tag.kind.default_value()),
        }
    }

    pub fn set(
        &self,
        class: &str,
        name: &str,
        tag: FieldTag,
        value: Value,
    ) -> Result<(), ExecError> {
        if !tag.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: Self::key(class, name),
                accessed: "instance",
                actual: "static",
            });
        }
        if !tag.kind.admits(&value) {
            return Err(ExecError::FieldTypeMismatch {
                field: Self::key(class, name),
                declared: tag.kind.name(),
                provided: value.tag(),
            });
        }

        let mut fields = self
            .fields
            .write()
            .map_err(|e| internal!("lock poisoned: {e}"))?;
        fields.insert(Self::key(class, name), StaticSlot { tag, value });
        Ok(())
    }
}
