//! Darwin ARM64 variant: register placement follows AAPCS64, but the
//! stack-bound tail of the argument list is C-packed into one padded
//! byte bundle instead of taking an 8-byte slot per argument.
//!
//! Marshaling runs in two passes. The first walks the remaining
//! arguments with temporary register counters to decide which still fit
//! registers; the second lays the rest out at their natural alignment
//! and emits the bundle in 8-byte chunks.
use std::sync::Arc;

use crate::aapcs64;
use crate::error::FfiError;
use crate::image::{CallImage, FLOAT_REGISTERS, INT_REGISTERS, le_word};
use crate::types::{CValue, TypeDesc, TypeKind, encode_value, round_up};

pub(crate) fn marshal_into(
    image: &mut CallImage,
    params: &[Arc<TypeDesc>],
    values: &[CValue],
) -> Result<(), FfiError> {
    for (index, (desc, value)) in params.iter().zip(values).enumerate() {
        if desc.kind == TypeKind::Void {
            return Err(FfiError::Unsupported {
                message: "void is not a valid parameter type",
            });
        }
        let mut ints = image.ints_used();
        let mut floats = image.floats_used();
        if !fits_registers(desc, &mut ints, &mut floats) {
            return marshal_tail(image, &params[index..], &values[index..]);
        }
        aapcs64::add_value(image, desc, value)?;
    }
    Ok(())
}

/// From the first stack-bound argument onward: arguments that still fit
/// the (tracked) register files go to registers, everything else is
/// collected and bundled.
fn marshal_tail(
    image: &mut CallImage,
    params: &[Arc<TypeDesc>],
    values: &[CValue],
) -> Result<(), FfiError> {
    let mut ints = image.ints_used();
    let mut floats = image.floats_used();
    let mut pending: Vec<(&Arc<TypeDesc>, &CValue)> = Vec::new();
    for (desc, value) in params.iter().zip(values) {
        if fits_registers(desc, &mut ints, &mut floats) {
            aapcs64::add_value(image, desc, value)?;
        } else {
            pending.push((desc, value));
        }
    }

    let layout = bundle_layout(pending.iter().map(|(d, _)| d.as_ref()));
    let mut buf = vec![0u8; round_up(layout.size, 8)];
    for ((desc, value), offset) in pending.iter().zip(&layout.offsets) {
        encode_value(desc, value, &mut buf, *offset, image.keep_alive_mut())?;
    }
    for chunk in buf.chunks(8) {
        image.add_stack(le_word(chunk));
    }
    Ok(())
}

/// Whether one argument fits the remaining registers, advancing the
/// counters if it does. Mirrors register placement without touching the
/// image.
pub(crate) fn fits_registers(desc: &TypeDesc, ints: &mut usize, floats: &mut usize) -> bool {
    match desc.kind {
        TypeKind::F32 | TypeKind::F64 => {
            if *floats < FLOAT_REGISTERS {
                *floats += 1;
                true
            } else {
                false
            }
        }
        TypeKind::Struct => match struct_fits(desc, *ints, *floats) {
            Some((new_ints, new_floats)) => {
                *ints = new_ints;
                *floats = new_floats;
                true
            }
            None => false,
        },
        _ => {
            if *ints < INT_REGISTERS {
                *ints += 1;
                true
            } else {
                false
            }
        }
    }
}

/// Register demand of one aggregate given the current counters; `None`
/// when it would spill.
fn struct_fits(desc: &TypeDesc, ints: usize, floats: usize) -> Option<(usize, usize)> {
    if desc.size == 0 {
        return Some((ints, floats));
    }
    if let Some(shape) = aapcs64::hfa_shape(desc) {
        return (floats + shape.count <= FLOAT_REGISTERS)
            .then_some((ints, floats + shape.count));
    }
    if let Some(shape) = aapcs64::hva_shape(desc) {
        return (ints + shape.count <= INT_REGISTERS)
            .then_some((ints + shape.count, floats));
    }
    if desc.size <= 16 {
        let slots = desc.size.div_ceil(8);
        return (ints + slots <= INT_REGISTERS).then_some((ints + slots, floats));
    }
    // passed by reference, the pointer wants one integer register
    (ints + 1 <= INT_REGISTERS).then_some((ints + 1, floats))
}

/// C layout of the bundled tail: each argument at its natural
/// alignment, aggregates of 8 bytes or more forced to 8.
#[derive(Debug)]
pub(crate) struct BundleLayout {
    pub offsets: Vec<usize>,
    pub size: usize,
}

pub(crate) fn bundle_layout<'a>(descs: impl IntoIterator<Item = &'a TypeDesc>) -> BundleLayout {
    let mut offsets = Vec::new();
    let mut cursor = 0usize;
    for desc in descs {
        let mut align = desc.align.max(1);
        if desc.kind == TypeKind::Struct && desc.size >= 8 {
            align = 8;
        }
        cursor = round_up(cursor, align);
        offsets.push(cursor);
        cursor += desc.size;
    }
    BundleLayout {
        offsets,
        size: cursor,
    }
}
