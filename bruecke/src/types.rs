//! Type descriptors: the static, queryable shape of every marshalable
//! type. Descriptors are derived once, never mutated, and shared via
//! `Arc`; the classifiers consume them as plain data at call time.
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cstr;
use crate::error::FfiError;
use crate::image::{KeepAlive, le_word};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Pointer,
    String,
    Struct,
}

impl TypeKind {
    pub fn is_float(self) -> bool {
        matches!(self, TypeKind::F32 | TypeKind::F64)
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Void => "void",
            TypeKind::Bool => "bool",
            TypeKind::I8 => "i8",
            TypeKind::U8 => "u8",
            TypeKind::I16 => "i16",
            TypeKind::U16 => "u16",
            TypeKind::I32 => "i32",
            TypeKind::U32 => "u32",
            TypeKind::I64 => "i64",
            TypeKind::U64 => "u64",
            TypeKind::F32 => "f32",
            TypeKind::F64 => "f64",
            TypeKind::Pointer => "pointer",
            TypeKind::String => "string",
            TypeKind::Struct => "struct",
        }
    }

    fn layout(self) -> (usize, usize) {
        match self {
            TypeKind::Void => (0, 1),
            TypeKind::Bool | TypeKind::I8 | TypeKind::U8 => (1, 1),
            TypeKind::I16 | TypeKind::U16 => (2, 2),
            TypeKind::I32 | TypeKind::U32 | TypeKind::F32 => (4, 4),
            TypeKind::I64
            | TypeKind::U64
            | TypeKind::F64
            | TypeKind::Pointer
            | TypeKind::String => (8, 8),
            TypeKind::Struct => unreachable!(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub desc: Arc<TypeDesc>,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub kind: TypeKind,
    pub size: usize,
    pub align: usize,
    pub fields: Vec<FieldDesc>,
}

impl TypeDesc {
    pub fn scalar(kind: TypeKind) -> Arc<TypeDesc> {
        if kind == TypeKind::Struct {
            panic!("bruecke: struct descriptors must be built with struct_of");
        }
        let (size, align) = kind.layout();
        Arc::new(TypeDesc {
            kind,
            size,
            align,
            fields: Vec::new(),
        })
    }

    /// Derive an aggregate descriptor with C layout: each field at its
    /// naturally aligned offset, total size padded to the widest field
    /// alignment.
    pub fn struct_of(field_descs: &[Arc<TypeDesc>]) -> Arc<TypeDesc> {
        let mut fields = Vec::with_capacity(field_descs.len());
        let mut size = 0usize;
        let mut align = 1usize;
        for desc in field_descs {
            if desc.kind == TypeKind::Void {
                panic!("bruecke: void cannot be a struct field");
            }
            let field_align = desc.align.max(1);
            size = round_up(size, field_align);
            fields.push(FieldDesc {
                desc: desc.clone(),
                offset: size,
            });
            size += desc.size;
            align = align.max(field_align);
        }
        size = round_up(size, align);
        Arc::new(TypeDesc {
            kind: TypeKind::Struct,
            size,
            align,
            fields,
        })
    }

    /// Fixed-size arrays are modeled as a struct of repeated fields;
    /// the classifiers flatten leaves either way.
    pub fn array_of(element: &Arc<TypeDesc>, len: usize) -> Arc<TypeDesc> {
        let elements: Vec<Arc<TypeDesc>> = (0..len).map(|_| element.clone()).collect();
        TypeDesc::struct_of(&elements)
    }

    pub fn is_aggregate(&self) -> bool {
        self.kind == TypeKind::Struct
    }

    /// Whether every top-level field is a float, the test the return
    /// path uses to pick the float return registers.
    pub fn is_all_floats(&self) -> bool {
        !self.fields.is_empty()
            && self.fields.iter().all(|f| f.desc.kind.is_float())
    }

    pub fn has_string_fields(&self) -> bool {
        self.fields.iter().any(|f| f.desc.kind == TypeKind::String)
    }
}

pub(crate) fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

// ── Identity cache ───────────────────────────────────────────────────

/// Identity-keyed descriptor cache: derive once per distinct type, look
/// up concurrently afterwards. Entries are immutable after the first
/// registration; a second registration under the same identity returns
/// the original.
#[derive(Default)]
pub struct TypeRegistry {
    entries: RwLock<HashMap<u64, Arc<TypeDesc>>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: u64, desc: Arc<TypeDesc>) -> Arc<TypeDesc> {
        let mut entries = self.entries.write();
        entries.entry(identity).or_insert(desc).clone()
    }

    pub fn lookup(&self, identity: u64) -> Option<Arc<TypeDesc>> {
        self.entries.read().get(&identity).cloned()
    }
}

// ── Managed values ───────────────────────────────────────────────────

/// A managed value paired with a descriptor at the marshaling edge.
#[derive(Debug, Clone, PartialEq)]
pub enum CValue {
    Void,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Pointer(u64),
    Str(String),
    Struct(Vec<CValue>),
}

impl CValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            CValue::Void => "void",
            CValue::Bool(_) => "bool",
            CValue::I8(_) => "i8",
            CValue::U8(_) => "u8",
            CValue::I16(_) => "i16",
            CValue::U16(_) => "u16",
            CValue::I32(_) => "i32",
            CValue::U32(_) => "u32",
            CValue::I64(_) => "i64",
            CValue::U64(_) => "u64",
            CValue::F32(_) => "f32",
            CValue::F64(_) => "f64",
            CValue::Pointer(_) => "pointer",
            CValue::Str(_) => "string",
            CValue::Struct(_) => "struct",
        }
    }

    /// The type's empty value.
    pub fn zero(desc: &TypeDesc) -> CValue {
        match desc.kind {
            TypeKind::Void => CValue::Void,
            TypeKind::Bool => CValue::Bool(false),
            TypeKind::I8 => CValue::I8(0),
            TypeKind::U8 => CValue::U8(0),
            TypeKind::I16 => CValue::I16(0),
            TypeKind::U16 => CValue::U16(0),
            TypeKind::I32 => CValue::I32(0),
            TypeKind::U32 => CValue::U32(0),
            TypeKind::I64 => CValue::I64(0),
            TypeKind::U64 => CValue::U64(0),
            TypeKind::F32 => CValue::F32(0.0),
            TypeKind::F64 => CValue::F64(0.0),
            TypeKind::Pointer => CValue::Pointer(0),
            TypeKind::String => CValue::Str(String::new()),
            TypeKind::Struct => {
                CValue::Struct(desc.fields.iter().map(|f| CValue::zero(&f.desc)).collect())
            }
        }
    }

    /// Integer-class register bits: sign-extended to the full word the
    /// way a native caller materializes small arguments.
    pub(crate) fn int_bits(&self, kind: TypeKind) -> Result<u64, FfiError> {
        let bits = match (kind, self) {
            (TypeKind::Bool, CValue::Bool(b)) => *b as u64,
            (TypeKind::I8, CValue::I8(v)) => *v as i64 as u64,
            (TypeKind::U8, CValue::U8(v)) => *v as u64,
            (TypeKind::I16, CValue::I16(v)) => *v as i64 as u64,
            (TypeKind::U16, CValue::U16(v)) => *v as u64,
            (TypeKind::I32, CValue::I32(v)) => *v as i64 as u64,
            (TypeKind::U32, CValue::U32(v)) => *v as u64,
            (TypeKind::I64, CValue::I64(v)) => *v as u64,
            (TypeKind::U64, CValue::U64(v)) => *v,
            (TypeKind::Pointer, CValue::Pointer(p)) => *p,
            _ => {
                return Err(FfiError::TypeMismatch {
                    expected: kind.name(),
                    got: self.kind_name(),
                });
            }
        };
        Ok(bits)
    }

    pub(crate) fn float_bits(&self, kind: TypeKind) -> Result<u64, FfiError> {
        match (kind, self) {
            (TypeKind::F32, CValue::F32(v)) => Ok(v.to_bits() as u64),
            (TypeKind::F64, CValue::F64(v)) => Ok(v.to_bits()),
            _ => Err(FfiError::TypeMismatch {
                expected: kind.name(),
                got: self.kind_name(),
            }),
        }
    }

    pub(crate) fn as_str(&self) -> Result<&str, FfiError> {
        match self {
            CValue::Str(s) => Ok(s),
            _ => Err(FfiError::TypeMismatch {
                expected: "string",
                got: self.kind_name(),
            }),
        }
    }

    pub(crate) fn fields(&self) -> Result<&[CValue], FfiError> {
        match self {
            CValue::Struct(fields) => Ok(fields),
            _ => Err(FfiError::TypeMismatch {
                expected: "struct",
                got: self.kind_name(),
            }),
        }
    }
}

// ── Byte representation ──────────────────────────────────────────────

/// Write a value into `buf` at the descriptor's layout, starting at
/// `base`. Strings become native pointers; the backing allocation goes
/// on the keep-alive list.
pub(crate) fn encode_value(
    desc: &TypeDesc,
    value: &CValue,
    buf: &mut [u8],
    base: usize,
    keep: &mut Vec<KeepAlive>,
) -> Result<(), FfiError> {
    match desc.kind {
        TypeKind::Void => {
            panic!("bruecke: unsupported leaf kind void in aggregate")
        }
        TypeKind::Bool => {
            buf[base] = (value.int_bits(desc.kind)? & 1) as u8;
        }
        TypeKind::String => {
            let copy = cstr::to_native(value.as_str()?)?;
            let address = copy.as_ptr() as u64;
            keep.push(KeepAlive::CStr(copy));
            buf[base..base + 8].copy_from_slice(&address.to_le_bytes());
        }
        TypeKind::F32 | TypeKind::F64 => {
            let bits = value.float_bits(desc.kind)?;
            buf[base..base + desc.size]
                .copy_from_slice(&bits.to_le_bytes()[..desc.size]);
        }
        TypeKind::Struct => {
            let values = value.fields()?;
            if values.len() != desc.fields.len() {
                return Err(FfiError::ArityMismatch {
                    expected: desc.fields.len(),
                    got: values.len(),
                });
            }
            for (field, v) in desc.fields.iter().zip(values) {
                encode_value(&field.desc, v, buf, base + field.offset, keep)?;
            }
        }
        _ => {
            let bits = value.int_bits(desc.kind)?;
            buf[base..base + desc.size]
                .copy_from_slice(&bits.to_le_bytes()[..desc.size]);
        }
    }
    Ok(())
}

/// Inverse of [`encode_value`]: rebuild a managed value from raw bytes.
///
/// # Safety
/// String fields contain native pointers that get dereferenced; the
/// caller must guarantee any such pointer is live and null-terminated
/// (a zero address decodes to the empty string).
pub(crate) unsafe fn decode_value(desc: &TypeDesc, bytes: &[u8], base: usize) -> CValue {
    match desc.kind {
        TypeKind::Void => CValue::Void,
        TypeKind::Bool => CValue::Bool(bytes[base] != 0),
        TypeKind::I8 => CValue::I8(bytes[base] as i8),
        TypeKind::U8 => CValue::U8(bytes[base]),
        TypeKind::I16 => CValue::I16(le_word(&bytes[base..base + 2]) as u16 as i16),
        TypeKind::U16 => CValue::U16(le_word(&bytes[base..base + 2]) as u16),
        TypeKind::I32 => CValue::I32(le_word(&bytes[base..base + 4]) as u32 as i32),
        TypeKind::U32 => CValue::U32(le_word(&bytes[base..base + 4]) as u32),
        TypeKind::I64 => CValue::I64(le_word(&bytes[base..base + 8]) as i64),
        TypeKind::U64 => CValue::U64(le_word(&bytes[base..base + 8])),
        TypeKind::F32 => {
            CValue::F32(f32::from_bits(le_word(&bytes[base..base + 4]) as u32))
        }
        TypeKind::F64 => CValue::F64(f64::from_bits(le_word(&bytes[base..base + 8]))),
        TypeKind::Pointer => CValue::Pointer(le_word(&bytes[base..base + 8])),
        TypeKind::String => {
            let address = le_word(&bytes[base..base + 8]);
            CValue::Str(unsafe { cstr::from_native(address) })
        }
        TypeKind::Struct => CValue::Struct(
            desc.fields
                .iter()
                .map(|f| unsafe { decode_value(&f.desc, bytes, base + f.offset) })
                .collect(),
        ),
    }
}
