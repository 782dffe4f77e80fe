//! Marshaling front end: picks the host convention, validates the
//! managed values against the declared signature and drives the
//! per-convention placers into a [`CallImage`].
use std::sync::Arc;

use crate::aapcs64;
use crate::darwin;
use crate::error::FfiError;
use crate::image::{CallImage, KeepAlive};
use crate::sysv;
use crate::types::{CValue, TypeDesc, TypeKind};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Convention {
    SysV64,
    Aapcs64,
    Aapcs64Darwin,
}

impl Convention {
    /// The convention native code on this host expects.
    pub fn host() -> Convention {
        #[cfg(target_arch = "x86_64")]
        return Convention::SysV64;
        #[cfg(all(target_arch = "aarch64", any(target_os = "macos", target_os = "ios")))]
        return Convention::Aapcs64Darwin;
        #[cfg(all(
            target_arch = "aarch64",
            not(any(target_os = "macos", target_os = "ios"))
        ))]
        return Convention::Aapcs64;
        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        panic!("bruecke: no calling convention for this architecture");
    }
}

/// Build the argument image for a call with no aggregate return, or
/// one small enough to come back in registers.
pub fn marshal_args(
    convention: Convention,
    params: &[Arc<TypeDesc>],
    values: &[CValue],
) -> Result<CallImage, FfiError> {
    let mut image = CallImage::new();
    marshal_into(&mut image, convention, params, values)?;
    Ok(image)
}

/// Build the full image for a call, including the hidden result
/// pointer when the return type is an aggregate too wide for the
/// return registers. The result buffer lives on the image's keep-alive
/// list; the callee writes through the pointer and hands it back in
/// the first integer return register.
pub fn marshal_call(
    convention: Convention,
    params: &[Arc<TypeDesc>],
    ret: &TypeDesc,
    values: &[CValue],
) -> Result<CallImage, FfiError> {
    let mut image = CallImage::new();
    if ret.kind == TypeKind::Struct && ret.size > 16 {
        let buf = vec![0u8; ret.size].into_boxed_slice();
        let address = image.keep(KeepAlive::Bytes(buf));
        image.add_int(address);
        image.set_indirect_return();
    }
    marshal_into(&mut image, convention, params, values)?;
    Ok(image)
}

fn marshal_into(
    image: &mut CallImage,
    convention: Convention,
    params: &[Arc<TypeDesc>],
    values: &[CValue],
) -> Result<(), FfiError> {
    if params.len() != values.len() {
        return Err(FfiError::ArityMismatch {
            expected: params.len(),
            got: values.len(),
        });
    }
    log::trace!(
        "marshaling {} argument(s) for {:?}",
        params.len(),
        convention
    );
    match convention {
        Convention::SysV64 => {
            for (desc, value) in params.iter().zip(values) {
                sysv::add_value(image, desc, value)?;
            }
        }
        Convention::Aapcs64 => {
            for (desc, value) in params.iter().zip(values) {
                aapcs64::add_value(image, desc, value)?;
            }
        }
        Convention::Aapcs64Darwin => {
            darwin::marshal_into(image, params, values)?;
        }
    }
    Ok(())
}
