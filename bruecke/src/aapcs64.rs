//! AAPCS64 (standard ARM64) argument classification and placement.
//!
//! Homogeneous float aggregates take one float register per element;
//! other aggregates up to 16 bytes are byte-packed into integer
//! registers; anything larger is copied and passed by reference. The
//! integer and float register files deplete independently.
use crate::cstr;
use crate::error::FfiError;
use crate::image::{CallImage, FLOAT_REGISTERS, INT_REGISTERS, KeepAlive, le_word};
use crate::types::{CValue, TypeDesc, TypeKind, encode_value, round_up};

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

/// An aggregate whose leaves are all the same machine kind, up to four
/// of them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct HomogeneousShape {
    pub kind: TypeKind,
    pub count: usize,
}

/// Homogeneous float aggregate: one to four leaves, all the same float
/// kind, at any nesting depth.
pub(crate) fn hfa_shape(desc: &TypeDesc) -> Option<HomogeneousShape> {
    let mut kinds = Vec::new();
    collect_leaf_kinds(desc, &mut kinds);
    let first = *kinds.first()?;
    if !first.is_float() || kinds.len() > 4 {
        return None;
    }
    if kinds.iter().all(|&k| k == first) {
        Some(HomogeneousShape {
            kind: first,
            count: kinds.len(),
        })
    } else {
        None
    }
}

/// Homogeneous vector aggregate. The type model carries no SIMD vector
/// kinds, so no aggregate can match; the budget rule below still runs
/// so the placement order stays faithful.
pub(crate) fn hva_shape(_desc: &TypeDesc) -> Option<HomogeneousShape> {
    None
}

fn collect_leaf_kinds(desc: &TypeDesc, out: &mut Vec<TypeKind>) {
    if desc.kind == TypeKind::Struct {
        for field in &desc.fields {
            collect_leaf_kinds(&field.desc, out);
        }
    } else {
        out.push(desc.kind);
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
    if let Some(shape) = hfa_shape(desc) {
        if image.floats_used() + shape.count <= FLOAT_REGISTERS {
            return place_elements_float(image, desc, value);
        }
        return spill_bytes(image, desc, value);
    }
    if let Some(shape) = hva_shape(desc) {
        if image.ints_used() + shape.count <= INT_REGISTERS {
            return place_elements_int(image, desc, value);
        }
        return spill_bytes(image, desc, value);
    }
    if desc.size <= 16 {
        let slots = desc.size.div_ceil(8);
        let mut buf = vec![0u8; slots * 8];
        encode_value(desc, value, &mut buf, 0, image.keep_alive_mut())?;
        if image.ints_used() + slots <= INT_REGISTERS {
            for chunk in buf.chunks(8) {
                image.add_int(le_word(chunk));
            }
        } else {
            for chunk in buf.chunks(8) {
                image.add_stack(le_word(chunk));
            }
        }
        return Ok(());
    }
    // larger aggregates go by reference to a caller-owned copy
    let mut buf = vec![0u8; desc.size];
    encode_value(desc, value, &mut buf, 0, image.keep_alive_mut())?;
    let address = image.keep(KeepAlive::Bytes(buf.into_boxed_slice()));
    image.add_int(address);
    Ok(())
}

fn place_elements_float(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
) -> Result<(), FfiError> {
    if desc.kind == TypeKind::Struct {
        for (field, v) in desc.fields.iter().zip(value.fields()?) {
            place_elements_float(image, &field.desc, v)?;
        }
        return Ok(());
    }
    image.add_float(value.float_bits(desc.kind)?);
    Ok(())
}

fn place_elements_int(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
) -> Result<(), FfiError> {
    if desc.kind == TypeKind::Struct {
        for (field, v) in desc.fields.iter().zip(value.fields()?) {
            place_elements_int(image, &field.desc, v)?;
        }
        return Ok(());
    }
    image.add_int(value.int_bits(desc.kind)?);
    Ok(())
}

/// Whole-aggregate stack spill: the C byte layout, padded to slot
/// width, emitted in 8-byte chunks.
fn spill_bytes(
    image: &mut CallImage,
    desc: &TypeDesc,
    value: &CValue,
) -> Result<(), FfiError> {
    let mut buf = vec![0u8; round_up(desc.size, 8)];
    encode_value(desc, value, &mut buf, 0, image.keep_alive_mut())?;
    for chunk in buf.chunks(8) {
        image.add_stack(le_word(chunk));
    }
    Ok(())
}
