//! Runtime argument marshaling for calling native code without
//! per-signature glue.
//!
//! A call is described by type descriptors, not by a compiled
//! prototype: the marshaler classifies each argument under the host
//! calling convention (System V x86-64, AAPCS64, or the Darwin ARM64
//! variant), builds a deterministic [`CallImage`] of register and
//! stack contents, and an implementation of [`NativeInvoker`] carries
//! that image across the boundary. Returns flow back through
//! [`unmarshal_return`], and registered managed callbacks can be
//! invoked from native code via [`CallbackRegistry`] dispatch.
mod aapcs64;
mod cstr;
mod darwin;
mod sysv;

pub mod callback;
pub mod error;
pub mod image;
pub mod invoke;
pub mod load;
pub mod marshal;
pub mod types;
pub mod unmarshal;

pub use callback::{CallbackFn, CallbackId, CallbackRegistry, MAX_CALLBACK_STACK_ARGS};
pub use error::FfiError;
pub use image::{
    CallImage, FLOAT_REGISTERS, INT_REGISTERS, KeepAlive, RawCallFrame, RawReturn,
};
pub use invoke::{EntryFactory, NativeInvoker, call};
pub use load::{Library, RTLD_GLOBAL, RTLD_NOW};
pub use marshal::{Convention, marshal_args, marshal_call};
pub use types::{CValue, FieldDesc, TypeDesc, TypeKind, TypeRegistry};
pub use unmarshal::unmarshal_return;
