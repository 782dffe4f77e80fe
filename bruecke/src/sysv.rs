//! System V x86-64 argument classification and placement.
//!
//! Aggregates are split into eightbytes; every leaf deposits its bits
//! into the eightbyte its byte offset falls in and widens that
//! eightbyte's class (bit-OR merge, so INTEGER absorbs SSE). Placement
//! is all-or-nothing: if the merged picture does not fit the remaining
//! registers, or the post-merger rule demands memory, the whole
//! aggregate rolls back and spills to the stack instead.
use crate::cstr;
use crate::error::FfiError;
use crate::image::{CallImage, KeepAlive};
use crate::types::{CValue, TypeDesc, TypeKind};

const NO_CLASS: u8 = 0b0000;
const SSE: u8 = 0b0001;
const INTEGER: u8 = 0b0111;

pub(crate) fn add_value(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
) -> Result<(), FfiError> {
    match desc.kind {
        TypeKind::Void => Err(FfiError::Unsupported {
            message: "void is not a valid parameter type",
        }),
        TypeKind::F32 | TypeKind::F64 => {
            image.add_float(value.float_bits(desc.kind)?);
            Ok(())
        }
        TypeKind::String => {
            let copy = cstr::to_native(value.as_str()?)?;
            let address = image.keep(KeepAlive::CStr(copy));
            image.add_int(address);
            Ok(())
        }
        TypeKind::Struct => add_struct(image, desc, value),
        _ => {
            image.add_int(value.int_bits(desc.kind)?);
            Ok(())
        }
    }
}

fn add_struct(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
) -> Result<(), FfiError> {
    if desc.size == 0 {
        return Ok(());
    }
    if desc.size > 64 {
        return place_stack(image, desc, value);
    }
    let mark = image.save();
    let placed = try_place_register(image, desc, value)?;
    if post_merger(desc.size) || !placed {
        log::trace!("aggregate of {} bytes goes to the stack", desc.size);
        image.rollback(mark);
        return place_stack(image, desc, value);
    }
    Ok(())
}

/// Any merged aggregate wider than two eightbytes is passed in memory.
fn post_merger(size: usize) -> bool {
    size > 16
}

/// Attempt register placement. Returns `Ok(false)` when the aggregate
/// cannot take the register path (budget exhausted, or a double inside
/// a memory-class aggregate); the caller rolls back and spills.
fn try_place_register(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
) -> Result<bool, FfiError> {
    let eightbytes = desc.size.div_ceil(8);
    let mut bits = vec![0u64; eightbytes];
    let mut class = vec![NO_CLASS; eightbytes];
    if !accumulate(image, desc, value, 0, desc.size, &mut bits, &mut class)? {
        return Ok(false);
    }

    let ints_needed = class.iter().filter(|&&c| c != NO_CLASS && c != SSE).count();
    let floats_needed = class.iter().filter(|&&c| c == SSE).count();
    if image.ints_used() + ints_needed > crate::image::INT_REGISTERS
        || image.floats_used() + floats_needed > crate::image::FLOAT_REGISTERS
    {
        return Ok(false);
    }

    for (word, c) in bits.iter().zip(&class) {
        match *c {
            NO_CLASS => {}
            SSE => image.add_float(*word),
            _ => image.add_int(*word),
        }
    }
    Ok(true)
}

/// Deposit one leaf's bits into the eightbyte its offset selects and
/// merge its class. Native copies made for string leaves land on the
/// keep-alive list; a later rollback discards them with everything
/// else.
fn accumulate(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
    base: usize,
    total_size: usize,
    bits: &mut [u64],
    class: &mut [u8],
) -> Result<bool, FfiError> {
    if desc.kind == TypeKind::Struct {
        for (field, v) in desc.fields.iter().zip(value.fields()?) {
            if !accumulate(image, &field.desc, v, base + field.offset, total_size, bits, class)? {
                return Ok(false);
            }
        }
        return Ok(true);
    }

    let eightbyte = base / 8;
    let shift = (base % 8) * 8;
    let width = desc.size * 8;
    if shift + width > 64 {
        panic!("bruecke: eightbyte accumulator overflow at byte offset {base}");
    }
    let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };

    let (word, leaf_class) = match desc.kind {
        TypeKind::F32 => (value.float_bits(TypeKind::F32)?, SSE),
        TypeKind::F64 => {
            if total_size > 16 {
                return Ok(false);
            }
            (value.float_bits(TypeKind::F64)?, SSE)
        }
        TypeKind::String => {
            let copy = cstr::to_native(value.as_str()?)?;
            (image.keep(KeepAlive::CStr(copy)), INTEGER)
        }
        TypeKind::Bool
        | TypeKind::I8
        | TypeKind::U8
        | TypeKind::I16
        | TypeKind::U16
        | TypeKind::I32
        | TypeKind::U32
        | TypeKind::I64
        | TypeKind::U64
        | TypeKind::Pointer => (value.int_bits(desc.kind)?, INTEGER),
        kind => panic!(
            "bruecke: unsupported leaf kind {} in aggregate",
            kind.name()
        ),
    };

    bits[eightbyte] |= (word & mask) << shift;
    class[eightbyte] |= leaf_class;
    Ok(true)
}

/// Memory-class spill: one 8-byte stack slot per leaf, in declaration
/// order.
fn place_stack(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
) -> Result<(), FfiError> {
    match desc.kind {
        TypeKind::Struct => {
            for (field, v) in desc.fields.iter().zip(value.fields()?) {
                place_stack(image, &field.desc, v)?;
            }
        }
        TypeKind::F32 | TypeKind::F64 => {
            let bits = value.float_bits(desc.kind)?;
            image.add_stack(bits);
        }
        TypeKind::String => {
            let copy = cstr::to_native(value.as_str()?)?;
            let address = image.keep(KeepAlive::CStr(copy));
            image.add_stack(address);
        }
        TypeKind::Void => {
            panic!("bruecke: unsupported leaf kind void in aggregate")
        }
        _ => {
            let bits = value.int_bits(desc.kind)?;
            image.add_stack(bits);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeDesc;
    use std::sync::Arc;

    fn scalar(kind: TypeKind) -> Arc<TypeDesc> {
        TypeDesc::scalar(kind)
    }

    #[test]
    fn two_ints_pack_into_one_register() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::I32), scalar(TypeKind::I32)]);
        let value = CValue::Struct(vec![CValue::I32(1), CValue::I32(2)]);
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        assert_eq!(image.int_registers(), &[1 | (2u64 << 32)]);
        assert_eq!(image.floats_used(), 0);
        assert_eq!(image.stack().slots(), 0);
    }

    #[test]
    fn two_floats_pack_into_one_sse_register() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::F32), scalar(TypeKind::F32)]);
        let value = CValue::Struct(vec![CValue::F32(1.5), CValue::F32(-2.0)]);
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        let expected = (1.5f32.to_bits() as u64) | (((-2.0f32).to_bits() as u64) << 32);
        assert_eq!(image.float_registers(), &[expected]);
        assert_eq!(image.ints_used(), 0);
    }

    #[test]
    fn float_merged_with_int_widens_to_integer() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::F32), scalar(TypeKind::I32)]);
        let value = CValue::Struct(vec![CValue::F32(3.0), CValue::I32(7)]);
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        let expected = (3.0f32.to_bits() as u64) | (7u64 << 32);
        assert_eq!(image.int_registers(), &[expected]);
        assert_eq!(image.floats_used(), 0);
    }

    #[test]
    fn padded_struct_places_by_offset() {
        // {i32, i64}: the i64 sits in the second eightbyte, the first
        // eightbyte's high half is padding.
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::I32), scalar(TypeKind::I64)]);
        let value = CValue::Struct(vec![CValue::I32(5), CValue::I64(9)]);
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        assert_eq!(image.int_registers(), &[5, 9]);
    }

    #[test]
    fn post_merger_forces_memory() {
        let desc = TypeDesc::struct_of(&[
            scalar(TypeKind::I64),
            scalar(TypeKind::I64),
            scalar(TypeKind::I64),
        ]);
        let value = CValue::Struct(vec![CValue::I64(10), CValue::I64(20), CValue::I64(30)]);
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        assert_eq!(image.ints_used(), 0);
        assert_eq!(image.floats_used(), 0);
        assert_eq!(image.stack().slots(), 3);
        assert_eq!(image.stack().slot(0), 10);
        assert_eq!(image.stack().slot(1), 20);
        assert_eq!(image.stack().slot(2), 30);
    }

    #[test]
    fn budget_exhaustion_spills_the_whole_aggregate() {
        let desc = TypeDesc::struct_of(&[scalar(TypeKind::I64), scalar(TypeKind::I64)]);
        let value = CValue::Struct(vec![CValue::I64(100), CValue::I64(200)]);
        let mut image = CallImage::new();
        for i in 0..7u64 {
            image.add_int(i);
        }
        // one register left, two needed: nothing of the aggregate may
        // land in registers
        add_value(&mut image, &desc, &value).unwrap();
        assert_eq!(image.ints_used(), 7);
        assert_eq!(image.stack().slots(), 2);
        assert_eq!(image.stack().slot(0), 100);
        assert_eq!(image.stack().slot(1), 200);
    }

    #[test]
    fn rollback_discards_partial_keep_alive_entries() {
        // string keep-alives created during the register attempt must
        // vanish when the aggregate rolls back to the stack; exactly
        // one copy survives, the one the stack spill made
        let desc = TypeDesc::struct_of(&[
            scalar(TypeKind::String),
            scalar(TypeKind::I64),
            scalar(TypeKind::F64),
        ]);
        let value = CValue::Struct(vec![
            CValue::Str("kept once".to_string()),
            CValue::I64(1),
            CValue::F64(2.0),
        ]);
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        assert_eq!(image.keep_alive().len(), 1);
        assert_eq!(image.stack().slots(), 3);
        assert_eq!(image.stack().slot(0), image.keep_alive()[0].address());
    }

    #[test]
    fn oversized_aggregates_skip_classification() {
        let desc = TypeDesc::array_of(&scalar(TypeKind::I64), 9);
        let value = CValue::Struct((1..=9).map(CValue::I64).collect());
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        assert_eq!(image.ints_used(), 0);
        assert_eq!(image.stack().slots(), 9);
        assert_eq!(image.stack().slot(8), 9);
    }

    #[test]
    fn empty_struct_consumes_nothing() {
        let desc = TypeDesc::struct_of(&[]);
        let value = CValue::Struct(Vec::new());
        let mut image = CallImage::new();
        add_value(&mut image, &desc, &value).unwrap();
        assert_eq!(image.ints_used(), 0);
        assert_eq!(image.floats_used(), 0);
        assert_eq!(image.stack().slots(), 0);
    }

    #[test]
    fn scalars_take_their_register_class() {
        let mut image = CallImage::new();
        add_value(&mut image, &scalar(TypeKind::I32), &CValue::I32(-1)).unwrap();
        add_value(&mut image, &scalar(TypeKind::F64), &CValue::F64(4.0)).unwrap();
        add_value(
            &mut image,
            &scalar(TypeKind::String),
            &CValue::Str("abc".to_string()),
        )
        .unwrap();
        assert_eq!(image.int_registers()[0], u64::MAX); // sign-extended
        assert_eq!(image.float_registers()[0], 4.0f64.to_bits());
        assert_eq!(image.int_registers()[1], image.keep_alive()[0].address());
    }

    #[test]
    fn void_parameter_is_rejected() {
        let mut image = CallImage::new();
        let err = add_value(&mut image, &scalar(TypeKind::Void), &CValue::Void).unwrap_err();
        assert!(matches!(err, FfiError::Unsupported { .. }));
    }
}
