use anyhow::{Context, Result, bail};

/// Parsed method descriptor: parameter list plus return type.
#[derive(Debug)]
pub struct MethodDescriptor {
    pub return_descriptor: ReturnDescriptor,
    pub parameters: Vec<FieldType>,
}

impl MethodDescriptor {
    pub fn new(raw: &str) -> Result<Self> {
        if !raw.starts_with('(') {
            bail!("invalid method descriptor: no '(' in {raw}");
        }
        let end_of_parameter_descriptor =
            raw.find(")").context("invalid method descriptor: no ')'")?;

        let mut raw_parameter_descriptor = &raw[1..end_of_parameter_descriptor];
        let mut parameters = Vec::new();
        while !raw_parameter_descriptor.is_empty() {
            let parameter = FieldType::new(raw_parameter_descriptor)?;
            raw_parameter_descriptor = &raw_parameter_descriptor[parameter.length()..];
            parameters.push(parameter);
        }

        let raw_return_descriptor = &raw[end_of_parameter_descriptor + 1..];
        let return_descriptor = if raw_return_descriptor == "V" {
            ReturnDescriptor::Void
        } else {
            ReturnDescriptor::FieldType(FieldType::new(raw_return_descriptor)?)
        };

        Ok(Self {
            return_descriptor,
            parameters,
        })
    }

    /// Operand-stack slots consumed by the parameters (no receiver).
    pub fn parameter_slots(&self) -> usize {
        self.parameters.iter().map(FieldType::slot_width).sum()
    }
}

#[derive(Debug, PartialEq)]
pub enum ReturnDescriptor {
    Void,
    FieldType(FieldType),
}

#[derive(Debug, PartialEq)]
pub enum FieldType {
    BaseType(BaseType),
    ObjectType { class_name: String },
    ComponentType(Box<FieldType>),
}

#[derive(Debug, PartialEq)]
pub enum BaseType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean,
}

impl FieldType {
    fn new(raw: &str) -> Result<Self> {
        Ok(match raw.get(0..1).context("empty field type")? {
            "B" => Self::BaseType(BaseType::Byte),
            "C" => Self::BaseType(BaseType::Char),
            "D" => Self::BaseType(BaseType::Double),
            "F" => Self::BaseType(BaseType::Float),
            "I" => Self::BaseType(BaseType::Int),
            "J" => Self::BaseType(BaseType::Long),
            "S" => Self::BaseType(BaseType::Short),
            "Z" => Self::BaseType(BaseType::Boolean),
            "L" => {
                let end = raw.find(';').context("unterminated object type")?;
                Self::ObjectType {
                    class_name: raw[1..end].to_string(),
                }
            }
            "[" => Self::ComponentType(Box::new(Self::new(&raw[1..])?)),
            _ => bail!("unknown field type: {raw}"),
        })
    }

    fn length(&self) -> usize {
        match self {
            FieldType::BaseType(_) => 1,
            FieldType::ObjectType { class_name } => class_name.len() + 2,
            FieldType::ComponentType(field_type) => field_type.length() + 1,
        }
    }

    /// Two slots for long/double, one for everything else. Arrays of any
    /// dimensionality are references and take one slot.
    pub fn slot_width(&self) -> usize {
        match self {
            FieldType::BaseType(BaseType::Double | BaseType::Long) => 2,
            _ => 1,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, FieldType::ObjectType { .. } | FieldType::ComponentType(_))
    }
}
