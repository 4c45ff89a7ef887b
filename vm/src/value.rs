use common::ObjectId;

use crate::error::ExecError;
use crate::internal;

/// One operand-stack or local-variable slot.
///
/// 64-bit primitives occupy two consecutive slots holding the same value;
/// each slot still carries exactly one of these tags.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Null,
    Object(ObjectId),
    Array(ObjectId),
}

impl Value {
    pub fn int(&self) -> Result<i32, ExecError> {
        match self {
            Self::Int(val) => Ok(*val),
            _ => Err(internal!("operand is not an int, is {self:?}")),
        }
    }

    pub fn long(&self) -> Result<i64, ExecError> {
        match self {
            Self::Long(val) => Ok(*val),
            _ => Err(internal!("operand is not a long, is {self:?}")),
        }
    }

    pub fn float(&self) -> Result<f32, ExecError> {
        match self {
            Self::Float(val) => Ok(*val),
            _ => Err(internal!("operand is not a float, is {self:?}")),
        }
    }

    pub fn double(&self) -> Result<f64, ExecError> {
        match self {
            Self::Double(val) => Ok(*val),
            _ => Err(internal!("operand is not a double, is {self:?}")),
        }
    }

    /// The object behind a non-null reference slot.
    pub fn reference(&self) -> Result<Option<ObjectId>, ExecError> {
        match self {
            Self::Null => Ok(None),
            Self::Object(id) | Self::Array(id) => Ok(Some(id.clone())),
            _ => Err(internal!("operand is not a reference, is {self:?}")),
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Null | Self::Object(_) | Self::Array(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// True for values that occupy two slots.
    pub fn is_wide(&self) -> bool {
        matches!(self, Self::Long(_) | Self::Double(_))
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Float(_) => "float",
            Self::Double(_) => "double",
            Self::Null => "null",
            Self::Object(_) => "object reference",
            Self::Array(_) => "array reference",
        }
    }
}
