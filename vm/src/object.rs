use std::collections::HashMap;

use common::ObjectId;
use tracing::debug;

use crate::error::ExecError;
use crate::internal;
use crate::value::Value;

/// Primitive/reference kind half of a field tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Long,
    Float,
    Double,
    Reference,
}

impl FieldKind {
    /// B, C, S and Z all live in int-kinded storage; arrays of any
    /// dimensionality are references.
    pub fn from_descriptor(raw: &str) -> Result<Self, ExecError> {
        Ok(match raw.get(0..1) {
            Some("B" | "C" | "I" | "S" | "Z") => Self::Int,
            Some("J") => Self::Long,
            Some("F") => Self::Float,
            Some("D") => Self::Double,
            Some("L" | "[") => Self::Reference,
            _ => return Err(internal!("unknown field descriptor: {raw}")),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Long => "long",
            Self::Float => "float",
            Self::Double => "double",
            Self::Reference => "reference",
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            Self::Int => Value::Int(0),
            Self::Long => Value::Long(0),
            Self::Float => Value::Float(0.0),
            Self::Double => Value::Double(0.0),
            Self::Reference => Value::Null,
        }
    }

    pub fn admits(&self, value: &Value) -> bool {
        match self {
            Self::Int => matches!(value, Value::Int(_)),
            Self::Long => matches!(value, Value::Long(_)),
            Self::Float => matches!(value, Value::Float(_)),
            Self::Double => matches!(value, Value::Double(_)),
            Self::Reference => value.is_reference(),
        }
    }
}

/// Field tag: value kind plus the static/instance bit. Every field access
/// goes through an accessor that validates this tag.
#[derive(Debug, Clone, Copy)]
pub struct FieldTag {
    pub kind: FieldKind,
    pub is_static: bool,
}

impl FieldTag {
    pub fn of(descriptor: &str, is_static: bool) -> Result<Self, ExecError> {
        Ok(Self {
            kind: FieldKind::from_descriptor(descriptor)?,
            is_static,
        })
    }
}

/// Element kind of a scalar array, as encoded by the NEWARRAY operand.
/// Sub-int kinds keep their own tag so stores truncate correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    Boolean,
    Char,
    Float,
    Double,
    Byte,
    Short,
    Int,
    Long,
}

impl ScalarKind {
    pub fn from_atype(atype: u8) -> Result<Self, ExecError> {
        Ok(match atype {
            4 => Self::Boolean,
            5 => Self::Char,
            6 => Self::Float,
            7 => Self::Double,
            8 => Self::Byte,
            9 => Self::Short,
            10 => Self::Int,
            11 => Self::Long,
            _ => return Err(internal!("invalid array type: {atype}")),
        })
    }

    pub fn default_value(&self) -> Value {
        match self {
            Self::Float => Value::Float(0.0),
            Self::Double => Value::Double(0.0),
            Self::Long => Value::Long(0),
            _ => Value::Int(0),
        }
    }

    /// Narrows a stored value to the element width, keeping the int-kinded
    /// kinds in int-shaped slots (sign-extended for byte/short, zero-extended
    /// for char).
    pub fn normalize(&self, value: Value) -> Result<Value, ExecError> {
        Ok(match self {
            Self::Boolean => Value::Int(value.int()? & 1),
            Self::Byte => Value::Int(value.int()? as i8 as i32),
            Self::Char => Value::Int(value.int()? as u16 as i32),
            Self::Short => Value::Int(value.int()? as i16 as i32),
            Self::Int => Value::Int(value.int()?),
            Self::Long => Value::Long(value.long()?),
            Self::Float => Value::Float(value.float()?),
            Self::Double => Value::Double(value.double()?),
        })
    }
}

#[derive(Debug, Clone)]
struct FieldSlot {
    tag: FieldTag,
    value: Value,
}

#[derive(Debug)]
pub struct Instance {
    class_name: String,
    fields: HashMap<String, FieldSlot>,
}

#[derive(Debug)]
pub enum HeapItem {
    Instance(Instance),
    StringObject(String),
    ScalarArray {
        kind: ScalarKind,
        values: Vec<Value>,
    },
    ReferenceArray {
        class_name: String,
        values: Vec<Value>,
    },
}

impl HeapItem {
    pub fn is_array(&self) -> bool {
        matches!(self, Self::ScalarArray { .. } | Self::ReferenceArray { .. })
    }
}

/// The object store: string-keyed field storage per instance, plus scalar
/// and reference arrays. Fields are late-bound; a field slot is created by
/// the first tagged write and every later access validates against its tag.
#[derive(Default)]
pub struct ObjectStore {
    current_id: u64,
    items: HashMap<ObjectId, HeapItem>,
}

impl ObjectStore {
    fn insert(&mut self, item: HeapItem) -> ObjectId {
        let id: ObjectId = self.current_id.into();
        debug!("allocated {item:?} with id {id:?}");
        self.items.insert(id.clone(), item);
        self.current_id += 1;
        id
    }

    fn item(&self, id: &ObjectId) -> Result<&HeapItem, ExecError> {
        self.items
            .get(id)
            .ok_or_else(|| internal!("unknown object with {id:?}"))
    }

    fn item_mut(&mut self, id: &ObjectId) -> Result<&mut HeapItem, ExecError> {
        self.items
            .get_mut(id)
            .ok_or_else(|| internal!("unknown object with {id:?}"))
    }

    pub fn allocate_instance(&mut self, class_name: &str) -> ObjectId {
        self.insert(HeapItem::Instance(Instance {
            class_name: class_name.to_string(),
            fields: HashMap::new(),
        }))
    }

    pub fn allocate_string(&mut self, value: String) -> ObjectId {
        self.insert(HeapItem::StringObject(value))
    }

    pub fn allocate_scalar_array(&mut self, kind: ScalarKind, count: usize) -> ObjectId {
        self.insert(HeapItem::ScalarArray {
            kind,
            values: vec![kind.default_value(); count],
        })
    }

    /// Builds a scalar array from a raw value sequence, normalizing each
    /// element to the array's kind.
    pub fn scalar_array_from(
        &mut self,
        kind: ScalarKind,
        values: Vec<Value>,
    ) -> Result<ObjectId, ExecError> {
        let values = values
            .into_iter()
            .map(|v| kind.normalize(v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.insert(HeapItem::ScalarArray { kind, values }))
    }

    pub fn allocate_reference_array(&mut self, class_name: &str, count: usize) -> ObjectId {
        self.insert(HeapItem::ReferenceArray {
            class_name: class_name.to_string(),
            values: vec![Value::Null; count],
        })
    }

    /// Builds a one-dimensional reference array from existing references.
    pub fn reference_array_from(
        &mut self,
        class_name: &str,
        values: Vec<Value>,
    ) -> Result<ObjectId, ExecError> {
        for value in &values {
            if !value.is_reference() {
                return Err(internal!(
                    "reference array element is not a reference, is {value:?}"
                ));
            }
        }
        Ok(self.insert(HeapItem::ReferenceArray {
            class_name: class_name.to_string(),
            values,
        }))
    }

    /// Materializes a `String[]` holding one string object per element.
    pub fn string_array(&mut self, strings: &[String]) -> Result<ObjectId, ExecError> {
        let mut values = Vec::with_capacity(strings.len());
        for s in strings {
            let id = self.allocate_string(s.clone());
            values.push(Value::Object(id));
        }
        self.reference_array_from("java/lang/String", values)
    }

    pub fn new_thread_object(&mut self, name: &str) -> Result<ObjectId, ExecError> {
        let name_id = self.allocate_string(name.to_string());
        let id = self.allocate_instance("java/lang/Thread");
        self.set_field(
            &id,
            "name",
            FieldTag {
                kind: FieldKind::Reference,
                is_static: false,
            },
            Value::Object(name_id),
        )?;
        Ok(id)
    }

    pub fn class_name(&self, id: &ObjectId) -> Result<String, ExecError> {
        Ok(match self.item(id)? {
            HeapItem::Instance(instance) => instance.class_name.clone(),
            HeapItem::StringObject(_) => "java/lang/String".to_string(),
            HeapItem::ReferenceArray { class_name, .. } => format!("[L{class_name};"),
            HeapItem::ScalarArray { .. } => "array".to_string(),
        })
    }

    pub fn string_value(&self, id: &ObjectId) -> Result<&str, ExecError> {
        match self.item(id)? {
            HeapItem::StringObject(value) => Ok(value),
            item => Err(internal!("object {id:?} is not a string, is {item:?}")),
        }
    }

    /// The detail message of a throwable instance, if one was set.
    pub fn throwable_message(&self, id: &ObjectId) -> Option<String> {
        let HeapItem::Instance(instance) = self.items.get(id)? else {
            return None;
        };
        let slot = instance.fields.get("detailMessage")?;
        match &slot.value {
            Value::Object(message_id) => Some(self.string_value(message_id).ok()?.to_string()),
            _ => None,
        }
    }

    pub fn array_length(&self, id: &ObjectId) -> Result<usize, ExecError> {
        match self.item(id)? {
            HeapItem::ScalarArray { values, .. } | HeapItem::ReferenceArray { values, .. } => {
                Ok(values.len())
            }
            item => Err(internal!("object at {id:?} is not an array, is {item:?}")),
        }
    }

    pub fn array_get(&self, id: &ObjectId, index: usize) -> Result<Value, ExecError> {
        match self.item(id)? {
            HeapItem::ScalarArray { values, .. } | HeapItem::ReferenceArray { values, .. } => {
                values
                    .get(index)
                    .cloned()
                    .ok_or_else(|| internal!("no array value at index {index}"))
            }
            item => Err(internal!("object at {id:?} is not an array, is {item:?}")),
        }
    }

    /// Stores one element, normalizing scalars to the array's element kind
    /// and rejecting non-reference values for reference arrays.
    pub fn array_set(&mut self, id: &ObjectId, index: usize, value: Value) -> Result<(), ExecError> {
        match self.item_mut(id)? {
            HeapItem::ScalarArray { kind, values } => {
                let normalized = kind.normalize(value)?;
                let slot = values
                    .get_mut(index)
                    .ok_or_else(|| internal!("no array value at index {index}"))?;
                *slot = normalized;
                Ok(())
            }
            HeapItem::ReferenceArray { values, .. } => {
                if !value.is_reference() {
                    return Err(internal!(
                        "reference array store of a non-reference: {value:?}"
                    ));
                }
                let slot = values
                    .get_mut(index)
                    .ok_or_else(|| internal!("no array value at index {index}"))?;
                *slot = value;
                Ok(())
            }
            item => Err(internal!("object at {id:?} is not an array, is {item:?}")),
        }
    }

    /// Typed instance-field read. An unset field yields the tag's default.
    pub fn get_field(
        &self,
        id: &ObjectId,
        name: &str,
        tag: FieldTag,
    ) -> Result<Value, ExecError> {
        if tag.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: name.to_string(),
                accessed: "static",
                actual: "instance",
            });
        }

        match self.item(id)? {
            HeapItem::Instance(instance) => match instance.fields.get(name) {
                Some(slot) => {
                    if slot.tag.kind != tag.kind {
                        return Err(ExecError::FieldTypeMismatch {
                            field: format!("{}.{name}", instance.class_name),
                            declared: slot.tag.kind.name(),
                            provided: tag.kind.name(),
                        });
                    }
                    Ok(slot.value.clone())
                }
                None => Ok(tag.kind.default_value()),
            },
            item => Err(internal!("item at {id:?} is no object, but {item:?}")),
        }
    }

    /// Typed instance-field write; creates the slot on first use.
    pub fn set_field(
        &mut self,
        id: &ObjectId,
        name: &str,
        tag: FieldTag,
        value: Value,
    ) -> Result<(), ExecError> {
        if tag.is_static {
            return Err(ExecError::FieldAccessMismatch {
                field: name.to_string(),
                accessed: "static",
                actual: "instance",
            });
        }
        if !tag.kind.admits(&value) {
            return Err(ExecError::FieldTypeMismatch {
                field: name.to_string(),
                declared: tag.kind.name(),
                provided: value.tag(),
            });
        }

        match self.item_mut(id)? {
            HeapItem::Instance(instance) => {
                if let Some(slot) = instance.fields.get(name)
                    && slot.tag.kind != tag.kind
                {
                    return Err(ExecError::FieldTypeMismatch {
                        field: format!("{}.{name}", instance.class_name),
                        declared: slot.tag.kind.name(),
                        provided: tag.kind.name(),
                    });
                }
                instance.fields.insert(name.to_string(), FieldSlot { tag, value });
                Ok(())
            }
            item => Err(internal!("item at {id:?} is no object, but {item:?}")),
        }
    }
}
