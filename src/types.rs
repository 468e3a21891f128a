//! The Type Registry: primitive type tags plus named, registered
//! aggregate ("struct") definitions with computed layout.
//!
//! Layout follows the platform's natural alignment rule: each member's
//! offset is the next multiple of its alignment at or above the
//! running offset, and the struct's own size is the running offset
//! rounded up to its alignment (the max of its members' alignments).

use crate::error::{ExecutorError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// The closed set of primitive type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Void,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Bool,
    Pointer,
    String,
    Buffer,
    Callback,
}

impl Primitive {
    pub fn from_tag(tag: &str) -> Option<Self> {
        use Primitive::*;
        Some(match tag {
            "void" => Void,
            "int8" => Int8,
            "uint8" => UInt8,
            "int16" => Int16,
            "uint16" => UInt16,
            "int32" => Int32,
            "uint32" => UInt32,
            "int64" => Int64,
            "uint64" => UInt64,
            "float" => Float,
            "double" => Double,
            "bool" => Bool,
            "pointer" => Pointer,
            "string" => String,
            "buffer" => Buffer,
            "callback" => Callback,
            _ => return None,
        })
    }

    pub fn tag(self) -> &'static str {
        use Primitive::*;
        match self {
            Void => "void",
            Int8 => "int8",
            UInt8 => "uint8",
            Int16 => "int16",
            UInt16 => "uint16",
            Int32 => "int32",
            UInt32 => "uint32",
            Int64 => "int64",
            UInt64 => "uint64",
            Float => "float",
            Double => "double",
            Bool => "bool",
            Pointer => "pointer",
            String => "string",
            Buffer => "buffer",
            Callback => "callback",
        }
    }

    /// Whether this primitive is an integer type, i.e. a valid size for
    /// a `buffer_ptr` callback argument's `size_arg_index` reference.
    pub fn is_integer(self) -> bool {
        use Primitive::*;
        matches!(self, Int8 | UInt8 | Int16 | UInt16 | Int32 | UInt32 | Int64 | UInt64)
    }

    /// Size in bytes of the value as it sits in an argument/struct slot.
    /// `string`/`buffer`/`callback` are passed by address, hence a
    /// machine word; `buffer`'s *pointed-to* region has its own,
    /// separately carried length.
    pub fn size(self) -> usize {
        use Primitive::*;
        match self {
            Void => 0,
            Int8 | UInt8 | Bool => 1,
            Int16 | UInt16 => 2,
            Int32 | UInt32 | Float => 4,
            Int64 | UInt64 | Double => 8,
            Pointer | String | Buffer | Callback => std::mem::size_of::<usize>(),
        }
    }

    pub fn align(self) -> usize {
        // Natural alignment equals size for every primitive we support.
        self.size().max(1)
    }
}

/// A type as it can appear as an argument, return type, pointer target
/// or struct member: either a primitive or a previously-registered
/// aggregate.
#[derive(Debug, Clone)]
pub enum TypeTag {
    Primitive(Primitive),
    Struct(Arc<StructDef>),
}

impl TypeTag {
    pub fn size(&self) -> usize {
        match self {
            TypeTag::Primitive(p) => p.size(),
            TypeTag::Struct(s) => s.size,
        }
    }

    pub fn align(&self) -> usize {
        match self {
            TypeTag::Primitive(p) => p.align(),
            TypeTag::Struct(s) => s.align,
        }
    }

    pub fn name(&self) -> String {
        match self {
            TypeTag::Primitive(p) => p.tag().to_string(),
            TypeTag::Struct(s) => s.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub ty: TypeTag,
    pub offset: usize,
}

#[derive(Debug)]
pub struct StructDef {
    pub name: String,
    pub members: Vec<Member>,
    pub size: usize,
    pub align: usize,
}

impl PartialEq for StructDef {
    fn eq(&self, other: &Self) -> bool {
        // Two definitions are "byte-for-byte identical" when name,
        // members (name + type name) and resulting layout agree.
        self.name == other.name
            && self.size == other.size
            && self.align == other.align
            && self.members.len() == other.members.len()
            && self
                .members
                .iter()
                .zip(other.members.iter())
                .all(|(a, b)| a.name == b.name && a.offset == b.offset && a.ty.name() == b.ty.name())
    }
}

fn round_up(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        (value + align - 1) / align * align
    }
}

/// Process-wide registry of named aggregate types, guarded by a
/// readers-writer lock: mutations are rare, lookups during
/// marshalling are frequent.
pub struct TypeRegistry {
    structs: RwLock<HashMap<String, Arc<StructDef>>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        TypeRegistry {
            structs: RwLock::new(HashMap::new()),
        }
    }

    /// Resolves a type name to a [`TypeTag`]: a primitive tag or a
    /// previously-registered struct.
    pub fn resolve(&self, name: &str) -> Result<TypeTag> {
        if let Some(p) = Primitive::from_tag(name) {
            return Ok(TypeTag::Primitive(p));
        }
        let structs = self.structs.read();
        structs
            .get(name)
            .cloned()
            .map(TypeTag::Struct)
            .ok_or_else(|| ExecutorError::UnknownMemberType(name.to_string()))
    }

    pub fn lookup_struct(&self, name: &str) -> Result<Arc<StructDef>> {
        self.structs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutorError::TypeNotFound(name.to_string()))
    }

    /// `register_struct`: computes member offsets, the struct
    /// size/alignment, and stores the result keyed by name. Idempotent
    /// only when identical to an already-registered definition with the
    /// same name.
    pub fn register_struct(
        &self,
        name: &str,
        definition: &[(String, String)],
    ) -> Result<Arc<StructDef>> {
        if definition.is_empty() {
            return Err(ExecutorError::EmptyDefinition);
        }

        let mut members = Vec::with_capacity(definition.len());
        let mut offset = 0usize;
        let mut struct_align = 1usize;

        for (mname, mtype) in definition {
            let ty = self.resolve(mtype)?;
            let align = ty.align();
            struct_align = struct_align.max(align);
            offset = round_up(offset, align);
            members.push(Member {
                name: mname.clone(),
                ty,
                offset,
            });
            offset += members.last().unwrap().ty.size();
        }
        let size = round_up(offset, struct_align);

        let candidate = Arc::new(StructDef {
            name: name.to_string(),
            members,
            size,
            align: struct_align,
        });

        let mut structs = self.structs.write();
        match structs.get(name) {
            Some(existing) if **existing == *candidate => Ok(existing.clone()),
            Some(_) => Err(ExecutorError::TypeExists(name.to_string())),
            None => {
                structs.insert(name.to_string(), candidate.clone());
                Ok(candidate)
            }
        }
    }

    /// `unregister_struct`: refuses removal while another live
    /// aggregate still references the type, per the recommended,
    /// stricter behaviour.
    pub fn unregister_struct(&self, name: &str) -> Result<()> {
        let mut structs = self.structs.write();
        if !structs.contains_key(name) {
            return Err(ExecutorError::TypeNotFound(name.to_string()));
        }
        let referenced = structs.values().any(|def| {
            def.name != name
                && def
                    .members
                    .iter()
                    .any(|m| matches!(&m.ty, TypeTag::Struct(s) if s.name == name))
        });
        if referenced {
            return Err(ExecutorError::TypeInUse(name.to_string()));
        }
        structs.remove(name);
        Ok(())
    }
}

/// Parses a `target_type` descriptor, recognising the `Foo[]` array
/// suffix used for pointer arguments.
pub fn parse_target_type(target: &str) -> (&str, bool) {
    match target.strip_suffix("[]") {
        Some(base) => (base, true),
        None => (target, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout_inserts_padding_for_alignment() {
        let registry = TypeRegistry::new();
        let def = registry
            .register_struct(
                "Padded",
                &[
                    ("flag".to_string(), "uint8".to_string()),
                    ("value".to_string(), "int32".to_string()),
                ],
            )
            .unwrap();
        assert_eq!(def.members[0].offset, 0);
        assert_eq!(def.members[1].offset, 4);
        assert_eq!(def.size, 8);
        assert_eq!(def.align, 4);
    }

    #[test]
    fn register_struct_is_idempotent_for_identical_definitions() {
        let registry = TypeRegistry::new();
        let members = [("x".to_string(), "double".to_string())];
        let first = registry.register_struct("Point1D", &members).unwrap();
        let second = registry.register_struct("Point1D", &members).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn register_struct_rejects_conflicting_redefinition() {
        let registry = TypeRegistry::new();
        registry
            .register_struct("Point1D", &[("x".to_string(), "double".to_string())])
            .unwrap();
        let err = registry
            .register_struct("Point1D", &[("x".to_string(), "float".to_string())])
            .unwrap_err();
        assert!(matches!(err, ExecutorError::TypeExists(_)));
    }

    #[test]
    fn register_struct_rejects_empty_definition() {
        let registry = TypeRegistry::new();
        let err = registry.register_struct("Empty", &[]).unwrap_err();
        assert!(matches!(err, ExecutorError::EmptyDefinition));
    }

    #[test]
    fn unregister_struct_refuses_while_referenced() {
        let registry = TypeRegistry::new();
        registry
            .register_struct("Inner", &[("x".to_string(), "int32".to_string())])
            .unwrap();
        registry
            .register_struct("Outer", &[("inner".to_string(), "Inner".to_string())])
            .unwrap();
        let err = registry.unregister_struct("Inner").unwrap_err();
        assert!(matches!(err, ExecutorError::TypeInUse(_)));
        registry.unregister_struct("Outer").unwrap();
        registry.unregister_struct("Inner").unwrap();
    }

    #[test]
    fn parse_target_type_splits_array_suffix() {
        assert_eq!(parse_target_type("int32[]"), ("int32", true));
        assert_eq!(parse_target_type("int32"), ("int32", false));
    }
}
