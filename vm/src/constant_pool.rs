use crate::error::ExecError;
use crate::internal;

/// Resolved constant pool of one class.
///
/// The interpreter consumes these entries read-only; symbolic references are
/// already resolved to names and descriptors by the loading subsystem.
#[derive(Debug, Default)]
pub struct ConstantPool {
    entries: Vec<CpEntry>,
}

#[derive(Debug, Clone)]
pub enum CpEntry {
    /// Slot 0 and the trailing half of 8-byte literals stay unused;
    /// constant pools are 1-indexed.
    Unused,
    ClassRef {
        name: String,
    },
    FieldRef {
        class: String,
        name: String,
        descriptor: String,
        is_static: bool,
    },
    MethodRef {
        class: String,
        name: String,
        descriptor: String,
    },
    NameAndType {
        name: String,
        descriptor: String,
    },
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    StringConst(String),
}

impl CpEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unused => "unused entry",
            Self::ClassRef { .. } => "class reference",
            Self::FieldRef { .. } => "field reference",
            Self::MethodRef { .. } => "method reference",
            Self::NameAndType { .. } => "name-and-type",
            Self::Utf8(_) => "utf8",
            Self::Integer(_) => "integer constant",
            Self::Float(_) => "float constant",
            Self::Long(_) => "long constant",
            Self::Double(_) => "double constant",
            Self::StringConst(_) => "string constant",
        }
    }
}

#[derive(Debug)]
pub struct FieldRefEntry<'a> {
    pub class: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
    pub is_static: bool,
}

impl FieldRefEntry<'_> {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.class, self.name)
    }
}

#[derive(Debug)]
pub struct MethodRefEntry<'a> {
    pub class: &'a str,
    pub name: &'a str,
    pub descriptor: &'a str,
}

impl ConstantPool {
    /// Builds a pool from entries starting at index 1; slot 0 is reserved.
    pub fn new(mut entries: Vec<CpEntry>) -> Self {
        entries.insert(0, CpEntry::Unused);
        Self { entries }
    }

    pub fn entry(&self, index: u16) -> Result<&CpEntry, ExecError> {
        self.entries
            .get(index as usize)
            .ok_or_else(|| internal!("no constant pool entry at index {index}"))
    }

    pub fn field_ref(&self, index: u16) -> Result<FieldRefEntry<'_>, ExecError> {
        match self.entry(index)? {
            CpEntry::FieldRef {
                class,
                name,
                descriptor,
                is_static,
            } => Ok(FieldRefEntry {
                class,
                name,
                descriptor,
                is_static: *is_static,
            }),
            entry => Err(ExecError::ConstantPoolTypeMismatch {
                index,
                expected: "field reference",
                actual: entry.kind(),
            }),
        }
    }

    pub fn method_ref(&self, index: u16) -> Result<MethodRefEntry<'_>, ExecError> {
        match self.entry(index)? {
            CpEntry::MethodRef {
                class,
                name,
                descriptor,
            } => Ok(MethodRefEntry {
                class,
                name,
                descriptor,
            }),
            entry => Err(ExecError::ConstantPoolTypeMismatch {
                index,
                expected: "method reference",
                actual: entry.kind(),
            }),
        }
    }

    pub fn class_ref(&self, index: u16) -> Result<&str, ExecError> {
        match self.entry(index)? {
            CpEntry::ClassRef { name } => Ok(name),
            entry => Err(ExecError::ConstantPoolTypeMismatch {
                index,
                expected: "class reference",
                actual: entry.kind(),
            }),
        }
    }

    pub fn utf8(&self, index: u16) -> Result<&str, ExecError> {
        match self.entry(index)? {
            CpEntry::Utf8(value) => Ok(value),
            entry => Err(ExecError::ConstantPoolTypeMismatch {
                index,
                expected: "utf8",
                actual: entry.kind(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ConstantPool {
        ConstantPool::new(vec![
            CpEntry::ClassRef {
                name: "java/lang/System".to_string(),
            },
            CpEntry::FieldRef {
                class: "java/lang/System".to_string(),
                name: "out".to_string(),
                descriptor: "Ljava/io/PrintStream;".to_string(),
                is_static: true,
            },
            CpEntry::MethodRef {
                class: "java/lang/System".to_string(),
                name: "nanoTime".to_string(),
                descriptor: "()J".to_string(),
            },
            CpEntry::Long(1 << 33),
        ])
    }

    #[test]
    fn test_lookups_are_one_indexed() {
        let pool = pool();
        assert_eq!(pool.class_ref(1).unwrap(), "java/lang/System");
        assert!(matches!(pool.entry(0).unwrap(), CpEntry::Unused));
        assert!(pool.entry(9).is_err());
    }

    #[test]
    fn test_field_ref() {
        let pool = pool();
        let field = pool.field_ref(2).unwrap();
        assert_eq!(field.qualified_name(), "java/lang/System.out");
        assert!(field.is_static);
    }

    #[test]
    fn test_mismatch_names_actual_kind() {
        let pool = pool();
        let err = pool.field_ref(3).unwrap_err();
        let rendered = format!("{err}");
        assert!(rendered.contains("field reference"));
        assert!(rendered.contains("method reference"));

        let err = pool.method_ref(4).unwrap_err();
        assert!(format!("{err}").contains("long constant"));
    }
}
