//! Return-value reconstruction: turning the raw registers a call came
//! back with into a managed value, guided by the return descriptor.
use crate::cstr;
use crate::image::RawReturn;
use crate::types::{CValue, TypeDesc, TypeKind, decode_value, round_up};

/// Decode one scalar from a raw 64-bit word.
///
/// # Safety
/// `String` words are dereferenced as `char*`; the caller vouches for
/// the pointer.
pub(crate) unsafe fn scalar_from_word(kind: TypeKind, word: u64) -> CValue {
    match kind {
        TypeKind::Void => CValue::Void,
        TypeKind::Bool => CValue::Bool(word as u8 != 0),
        TypeKind::I8 => CValue::I8(word as u8 as i8),
        TypeKind::U8 => CValue::U8(word as u8),
        TypeKind::I16 => CValue::I16(word as u16 as i16),
        TypeKind::U16 => CValue::U16(word as u16),
        TypeKind::I32 => CValue::I32(word as u32 as i32),
        TypeKind::U32 => CValue::U32(word as u32),
        TypeKind::I64 => CValue::I64(word as i64),
        TypeKind::U64 => CValue::U64(word),
        TypeKind::F32 => CValue::F32(f32::from_bits(word as u32)),
        TypeKind::F64 => CValue::F64(f64::from_bits(word)),
        TypeKind::Pointer => CValue::Pointer(word),
        TypeKind::String => CValue::Str(unsafe { cstr::from_native(word) }),
        TypeKind::Struct => {
            panic!("bruecke: aggregate cannot decode from a single word")
        }
    }
}

/// Rebuild the managed return value from the raw return registers.
///
/// # Safety
/// For aggregate returns wider than 16 bytes the first integer return
/// register must hold the address of a live result buffer of the
/// descriptor's size; string-typed results must point at live
/// null-terminated data.
pub unsafe fn unmarshal_return(desc: &TypeDesc, ret: &RawReturn) -> CValue {
    match desc.kind {
        TypeKind::Struct => unsafe { struct_return(desc, ret) },
        TypeKind::F32 | TypeKind::F64 => unsafe {
            scalar_from_word(desc.kind, ret.float[0])
        },
        _ => unsafe { scalar_from_word(desc.kind, ret.int[0]) },
    }
}

unsafe fn struct_return(desc: &TypeDesc, ret: &RawReturn) -> CValue {
    if desc.has_string_fields() {
        return unsafe { strings_return(desc, ret) };
    }
    match desc.size {
        0 => CValue::zero(desc),
        1..=8 => {
            // two packed f32s or one f64 come back in the float
            // register, everything else in the first integer register
            let word = if desc.is_all_floats() {
                ret.float[0]
            } else {
                ret.int[0]
            };
            unsafe { decode_value(desc, &word.to_le_bytes(), 0) }
        }
        9..=16 => {
            let (r1, r2) = unsafe { pick_halves(desc, ret) };
            let mut buf = [0u8; 16];
            buf[..8].copy_from_slice(&r1.to_le_bytes());
            buf[8..].copy_from_slice(&r2.to_le_bytes());
            unsafe { decode_value(desc, &buf, 0) }
        }
        _ => {
            let bytes = unsafe {
                std::slice::from_raw_parts(ret.int[0] as *const u8, desc.size)
            };
            unsafe { decode_value(desc, bytes, 0) }
        }
    }
}

/// Which registers carry the two eightbytes of a 9..16-byte aggregate.
/// Each half independently comes back in a float register when it is
/// float-classed; when only the second half is integer-classed it sits
/// in the FIRST integer register, not the second.
unsafe fn pick_halves(desc: &TypeDesc, ret: &RawReturn) -> (u64, u64) {
    if desc.is_all_floats() {
        return (ret.float[0], ret.float[1]);
    }
    let mut r1 = ret.int[0];
    let mut r2 = ret.int[1];
    let mut has_first_float = false;

    let first = desc.fields[0].desc.kind;
    let second = desc.fields.get(1).map(|f| f.desc.kind);
    if first == TypeKind::F64 || (first == TypeKind::F32 && second == Some(TypeKind::F32)) {
        r1 = ret.float[0];
        has_first_float = true;
    }

    // the field that starts the second eightbyte
    let split = desc
        .fields
        .iter()
        .position(|f| f.offset == 8)
        .map(|i| (i, desc.fields[i].desc.kind));
    match split {
        Some((i, kind))
            if kind == TypeKind::F64
                || (kind == TypeKind::F32 && i + 1 == desc.fields.len()) =>
        {
            r2 = ret.float[0];
        }
        _ if has_first_float => {
            // the integer half is the only integer piece, so it came
            // back in the first integer register
            r2 = ret.int[0];
        }
        _ => {}
    }
    (r1, r2)
}

/// Aggregates with string fields: the native side returned the C
/// layout (pointers, not managed strings), so the register picture is
/// sized by the C struct and walked with a sub-register cursor.
unsafe fn strings_return(desc: &TypeDesc, ret: &RawReturn) -> CValue {
    let c_size = c_struct_size(desc);
    let raw: Vec<u64> = if c_size == 0 {
        return CValue::zero(desc);
    } else if c_size <= 8 {
        vec![ret.int[0]]
    } else if c_size <= 16 {
        vec![ret.int[0], ret.int[1]]
    } else {
        let ptr = ret.int[0] as *const u64;
        (0..c_size / 8)
            .map(|i| unsafe { std::ptr::read_unaligned(ptr.add(i)) })
            .collect()
    };

    let mut fields = Vec::with_capacity(desc.fields.len());
    let mut idx = 0usize;
    let mut bit = 0usize;
    for field in &desc.fields {
        match field.desc.kind {
            TypeKind::String => {
                let address = raw.get(idx).copied().unwrap_or(0);
                idx += 1;
                bit = 0;
                fields.push(CValue::Str(unsafe { cstr::from_native(address) }));
            }
            TypeKind::I32 => {
                let mut val = 0i32;
                if bit == 0 {
                    if let Some(word) = raw.get(idx) {
                        val = *word as u32 as i32;
                    }
                    bit = 32;
                } else {
                    if let Some(word) = raw.get(idx) {
                        val = (*word >> 32) as u32 as i32;
                    }
                    idx += 1;
                    bit = 0;
                }
                fields.push(CValue::I32(val));
            }
            TypeKind::I64 => {
                if bit != 0 {
                    idx += 1;
                    bit = 0;
                }
                let val = raw.get(idx).copied().unwrap_or(0) as i64;
                idx += 1;
                fields.push(CValue::I64(val));
            }
            kind => panic!(
                "bruecke: unsupported field kind {} in struct with strings",
                kind.name()
            ),
        }
    }
    CValue::Struct(fields)
}

/// Size of the returned C layout, where string fields are bare
/// pointers. Only the field kinds the string walk understands are
/// allowed.
fn c_struct_size(desc: &TypeDesc) -> usize {
    let mut size = 0usize;
    for field in &desc.fields {
        match field.desc.kind {
            TypeKind::String => size += 8,
            TypeKind::I32 => {
                size = round_up(size, 4);
                size += 4;
            }
            TypeKind::I64 => {
                size = round_up(size, 8);
                size += 8;
            }
            kind => panic!(
                "bruecke: unsupported field kind {} in C struct size calculation",
                kind.name()
            ),
        }
    }
    round_up(size, 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::sync::Arc;

    fn scalar(kind: TypeKind) -> Arc<TypeDesc> {
        TypeDesc::scalar(kind)
    }

    fn ret(int: [u64; 2], float: [u64; 2]) -> RawReturn {
        RawReturn { int, float }
    }

    #[test]
    fn primitives_come_from_their_register_class() {
        let r = ret([(-5i64) as u64, 0], [2.5f64.to_bits(), 0]);
        assert_eq!(
            unsafe { unmarshal_return(&scalar(TypeKind::I32), &r) },
            CValue::I32(-5)
        );
        assert_eq!(
            unsafe { unmarshal_return(&scalar(TypeKind::F64), &r) },
            CValue::F64(2.5)
        );
        assert_eq!(
            unsafe { unmarshal_return(&scalar(TypeKind::Bool), &r) },
            CValue::Bool(true)
        );
        assert_eq!(
            unsafe { unmarshal_return(&scalar(TypeKind::Void), &r) },
            CValue::Void
        );
    }

    #[test]
    fn string_return_reads_the_pointer() {
        let native = CString::new("returned").unwrap();
        let r = ret([native.as_ptr() as u64, 0], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&scalar(TypeKind::String), &r) },
            CValue::Str("returned".to_string())
        );
        let null = ret([0, 0], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&scalar(TypeKind::String), &null) },
            CValue::Str(String::new())
        );
    }

    #[test]
    fn small_all_float_aggregate_uses_the_float_register() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::F32), scalar(TypeKind::F32)]);
        let word = (1.5f32.to_bits() as u64) | ((2.5f32.to_bits() as u64) << 32);
        let r = ret([0, 0], [word, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![CValue::F32(1.5), CValue::F32(2.5)])
        );
    }

    #[test]
    fn small_mixed_aggregate_uses_the_int_register() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::I32), scalar(TypeKind::F32)]);
        let word = 7u64 | ((3.0f32.to_bits() as u64) << 32);
        let r = ret([word, 0], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![CValue::I32(7), CValue::F32(3.0)])
        );
    }

    #[test]
    fn float_then_int_halves_split_across_files() {
        // {f64, i64}: the float half is in f0, and the lone integer
        // half comes back in the FIRST integer register
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::F64), scalar(TypeKind::I64)]);
        let r = ret([77, 999], [2.5f64.to_bits(), 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![CValue::F64(2.5), CValue::I64(77)])
        );
    }

    #[test]
    fn int_then_float_halves_split_across_files() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::I64), scalar(TypeKind::F64)]);
        let r = ret([42, 999], [3.5f64.to_bits(), 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![CValue::I64(42), CValue::F64(3.5)])
        );
    }

    #[test]
    fn wide_all_float_aggregate_uses_both_float_registers() {
        let desc = TypeDesc::struct_of(&[
            scalar(TypeKind::F32),
            scalar(TypeKind::F32),
            scalar(TypeKind::F32),
        ]);
        let first = (1.0f32.to_bits() as u64) | ((2.0f32.to_bits() as u64) << 32);
        let r = ret([0, 0], [first, 3.0f32.to_bits() as u64]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![CValue::F32(1.0), CValue::F32(2.0), CValue::F32(3.0)])
        );
    }

    #[test]
    fn two_int_halves_use_both_int_registers() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::I64), scalar(TypeKind::I64)]);
        let r = ret([10, 20], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![CValue::I64(10), CValue::I64(20)])
        );
    }

    #[test]
    fn wide_aggregate_dereferences_the_result_pointer() {
        let desc = TypeDesc::struct_of(&[
            scalar(TypeKind::I64),
            scalar(TypeKind::I64),
            scalar(TypeKind::I64),
        ]);
        let buffer: Vec<u8> = [100u64, 200, 300]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let r = ret([buffer.as_ptr() as u64, 0], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![CValue::I64(100), CValue::I64(200), CValue::I64(300)])
        );
    }

    #[test]
    fn string_struct_in_registers_uses_the_sub_register_cursor() {
        let desc = TypeDesc::struct_of(&[
            scalar(TypeKind::String),
            scalar(TypeKind::I32),
            scalar(TypeKind::I32),
        ]);
        let native = CString::new("name").unwrap();
        let packed = 11u64 | (22u64 << 32);
        let r = ret([native.as_ptr() as u64, packed], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![
                CValue::Str("name".to_string()),
                CValue::I32(11),
                CValue::I32(22),
            ])
        );
    }

    #[test]
    fn wide_string_struct_reads_through_the_pointer() {
        let desc = TypeDesc::struct_of(&[
            scalar(TypeKind::String),
            scalar(TypeKind::I32),
            scalar(TypeKind::I64),
        ]);
        let native = CString::new("wide").unwrap();
        // C layout: pointer, i32 (padded), i64 -> 24 bytes
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(native.as_ptr() as u64).to_le_bytes());
        buffer.extend_from_slice(&55u64.to_le_bytes());
        buffer.extend_from_slice(&(-9i64 as u64).to_le_bytes());
        let r = ret([buffer.as_ptr() as u64, 0], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(vec![
                CValue::Str("wide".to_string()),
                CValue::I32(55),
                CValue::I64(-9),
            ])
        );
    }

    #[test]
    #[should_panic(expected = "unsupported field kind")]
    fn string_struct_with_float_field_is_fatal() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::String), scalar(TypeKind::F64)]);
        let r = ret([0, 0], [0, 0]);
        unsafe { unmarshal_return(&desc, &r) };
    }

    #[test]
    fn empty_aggregate_returns_its_zero_value() {
        let desc = TypeDesc::struct_of(&[]);
        let r = ret([123, 456], [0, 0]);
        assert_eq!(
            unsafe { unmarshal_return(&desc, &r) },
            CValue::Struct(Vec::new())
        );
    }
}
