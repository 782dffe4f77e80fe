//! The raw call boundary. Everything above this line is safe,
//! deterministic data shuffling; the two traits here are where control
//! actually crosses into native code, and implementations of them are
//! the crate's trust boundary.
use std::sync::Arc;

use crate::callback::{CallbackId, CallbackRegistry};
use crate::error::FfiError;
use crate::image::{CallImage, RawReturn};
use crate::marshal::{Convention, marshal_call};
use crate::types::{CValue, TypeDesc};
use crate::unmarshal::unmarshal_return;

/// Issues one native call: loads the image's registers, places the
/// overflow bytes, jumps to `entry` and captures the return registers.
pub trait NativeInvoker {
    /// # Safety
    /// `entry` must be a function of the signature the image was
    /// marshaled for; the invoker must load the register files and
    /// stack exactly as the image says. When
    /// [`CallImage::is_indirect_return`] is set, the first integer
    /// entry is the hidden result pointer and belongs in the ABI's
    /// indirect-result register: that is the ordinary first argument
    /// register on x86-64 (rdi), but x8 on ARM64, where the remaining
    /// integer entries then start at x0.
    unsafe fn invoke(&self, entry: u64, image: &CallImage) -> RawReturn;
}

/// Produces a native entry address whose invocation lands in
/// `registry.dispatch` for the given id. Entries stay valid for the
/// registry's lifetime; native code may call them from any thread.
pub trait EntryFactory {
    fn make_entry(&self, registry: Arc<CallbackRegistry>, id: CallbackId) -> u64;
}

/// Marshal, invoke, unmarshal: the full life of one call.
///
/// # Safety
/// `entry` must be a live native function matching `params`/`ret` under
/// the chosen convention.
pub unsafe fn call<I: NativeInvoker>(
    invoker: &I,
    convention: Convention,
    entry: u64,
    params: &[Arc<TypeDesc>],
    ret: &TypeDesc,
    values: &[CValue],
) -> Result<CValue, FfiError> {
    let image = marshal_call(convention, params, ret, values)?;
    let raw = unsafe { invoker.invoke(entry, &image) };
    // the image owns string copies and any indirect-return buffer; it
    // must outlive return decoding
    let value = unsafe { unmarshal_return(ret, &raw) };
    drop(image);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeKind;

    fn scalar(kind: TypeKind) -> Arc<TypeDesc> {
        TypeDesc::scalar(kind)
    }

    /// Echoes the first argument of each register class back through
    /// the matching return register.
    struct EchoInvoker;

    impl NativeInvoker for EchoInvoker {
        unsafe fn invoke(&self, _entry: u64, image: &CallImage) -> RawReturn {
            let mut ret = RawReturn::default();
            if image.ints_used() > 0 {
                ret.int[0] = image.int_registers()[0];
            }
            if image.floats_used() > 0 {
                ret.float[0] = image.float_registers()[0];
            }
            ret
        }
    }

    /// Writes a fixed payload through the hidden result pointer, the
    /// way a native callee returns a wide aggregate.
    struct WideReturnInvoker {
        words: Vec<u64>,
    }

    impl NativeInvoker for WideReturnInvoker {
        unsafe fn invoke(&self, _entry: u64, image: &CallImage) -> RawReturn {
            assert!(image.is_indirect_return());
            let address = image.int_registers()[0];
            let buffer = address as *mut u8;
            for (i, word) in self.words.iter().enumerate() {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        word.to_le_bytes().as_ptr(),
                        buffer.add(i * 8),
                        8,
                    );
                }
            }
            RawReturn {
                int: [address, 0],
                float: [0, 0],
            }
        }
    }

    /// Measures the string behind the first integer register, like a
    /// native strlen would.
    struct StrlenInvoker;

    impl NativeInvoker for StrlenInvoker {
        unsafe fn invoke(&self, _entry: u64, image: &CallImage) -> RawReturn {
            let s = unsafe {
                std::ffi::CStr::from_ptr(
                    image.int_registers()[0] as *const std::ffi::c_char,
                )
            };
            RawReturn {
                int: [s.to_bytes().len() as u64, 0],
                float: [0, 0],
            }
        }
    }

    #[test]
    fn scalars_round_trip_through_the_boundary() {
        let out = unsafe {
            call(
                &EchoInvoker,
                Convention::SysV64,
                0,
                &[scalar(TypeKind::I64)],
                &scalar(TypeKind::I64),
                &[CValue::I64(-31337)],
            )
        }
        .unwrap();
        assert_eq!(out, CValue::I64(-31337));

        let out = unsafe {
            call(
                &EchoInvoker,
                Convention::Aapcs64,
                0,
                &[scalar(TypeKind::F64)],
                &scalar(TypeKind::F64),
                &[CValue::F64(0.25)],
            )
        }
        .unwrap();
        assert_eq!(out, CValue::F64(0.25));
    }

    #[test]
    fn string_arguments_stay_alive_across_the_call() {
        let out = unsafe {
            call(
                &StrlenInvoker,
                Convention::SysV64,
                0,
                &[scalar(TypeKind::String)],
                &scalar(TypeKind::U64),
                &[CValue::Str("eleven chars".to_string())],
            )
        }
        .unwrap();
        assert_eq!(out, CValue::U64(12));
    }

    #[test]
    fn wide_aggregate_results_come_back_through_the_buffer() {
        let ret_desc = TypeDesc::struct_of(&[
            scalar(TypeKind::I64),
            scalar(TypeKind::I64),
            scalar(TypeKind::I64),
        ]);
        let invoker = WideReturnInvoker {
            words: vec![400, 500, 600],
        };
        let out = unsafe {
            call(
                &invoker,
                Convention::SysV64,
                0,
                &[],
                &ret_desc,
                &[],
            )
        }
        .unwrap();
        assert_eq!(
            out,
            CValue::Struct(vec![CValue::I64(400), CValue::I64(500), CValue::I64(600)])
        );
    }

    #[test]
    fn marshaling_failures_never_reach_the_invoker() {
        struct PanicInvoker;
        impl NativeInvoker for PanicInvoker {
            unsafe fn invoke(&self, _entry: u64, _image: &CallImage) -> RawReturn {
                panic!("must not be called");
            }
        }
        let err = unsafe {
            call(
                &PanicInvoker,
                Convention::SysV64,
                0,
                &[scalar(TypeKind::I32)],
                &scalar(TypeKind::Void),
                &[CValue::F32(1.0)],
            )
        }
        .unwrap_err();
        assert!(matches!(err, FfiError::TypeMismatch { .. }));
    }
}
