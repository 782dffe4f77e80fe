//! Callback registry and trampoline dispatch: native code calls a
//! generated entry point, the trampoline captures the raw register
//! frame, and dispatch reverses argument classification to hand the
//! managed function real values.
//!
//! Entries are immutable once registered; dispatch may arrive
//! concurrently from native threads the runtime has never seen.
use std::sync::Arc;

use parking_lot::RwLock;

use crate::darwin;
use crate::error::FfiError;
use crate::image::{FLOAT_REGISTERS, INT_REGISTERS, RawCallFrame, RawReturn};
use crate::marshal::Convention;
use crate::types::{CValue, TypeDesc, TypeKind, decode_value};
use crate::unmarshal::scalar_from_word;

/// Stack argument slots the trampoline captures past the two register
/// files. Spill beyond this never reaches dispatch, so registration
/// bounds each signature's spill, not its total arity.
pub const MAX_CALLBACK_STACK_ARGS: usize = 15;

pub type CallbackFn = Box<dyn Fn(&[CValue]) -> CValue + Send + Sync>;

pub struct CallbackEntry {
    pub convention: Convention,
    pub params: Vec<Arc<TypeDesc>>,
    pub ret: Arc<TypeDesc>,
    func: CallbackFn,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallbackId(pub usize);

/// Append-only table of registered callbacks. Ids are stable for the
/// registry's lifetime; there is no unregistration, because native code
/// may hold the entry address indefinitely.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: RwLock<Vec<Arc<CallbackEntry>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        convention: Convention,
        params: Vec<Arc<TypeDesc>>,
        ret: Arc<TypeDesc>,
        func: CallbackFn,
    ) -> Result<CallbackId, FfiError> {
        let mut ints = 0usize;
        let mut floats = 0usize;
        for param in &params {
            match param.kind {
                TypeKind::Void => {
                    return Err(FfiError::InvalidCallback {
                        message: "void is not a valid callback parameter",
                    });
                }
                TypeKind::Struct => {
                    return Err(FfiError::InvalidCallback {
                        message: "aggregate callback parameters are not supported",
                    });
                }
                TypeKind::F32 | TypeKind::F64 => floats += 1,
                _ => ints += 1,
            }
        }
        // each register file takes its own eight; only the overflow
        // competes for the captured stack slots
        let spill = ints.saturating_sub(INT_REGISTERS)
            + floats.saturating_sub(FLOAT_REGISTERS);
        if spill > MAX_CALLBACK_STACK_ARGS {
            return Err(FfiError::InvalidCallback {
                message: "callback spills more stack arguments than the trampoline captures",
            });
        }
        match ret.kind {
            TypeKind::Struct => {
                return Err(FfiError::InvalidCallback {
                    message: "aggregate callback returns are not supported",
                });
            }
            TypeKind::String => {
                return Err(FfiError::InvalidCallback {
                    message: "string callback returns are not supported",
                });
            }
            _ => {}
        }

        let entry = Arc::new(CallbackEntry {
            convention,
            params,
            ret,
            func,
        });
        let mut entries = self.entries.write();
        entries.push(entry);
        let id = CallbackId(entries.len() - 1);
        log::debug!("registered callback {}", id.0);
        Ok(id)
    }

    pub fn lookup(&self, id: CallbackId) -> Option<Arc<CallbackEntry>> {
        self.entries.read().get(id.0).cloned()
    }

    /// Run a registered callback against a captured register frame and
    /// produce its raw return registers. Called from trampolines, so an
    /// unknown id is a wiring bug and fatal.
    ///
    /// # Safety
    /// The frame must be a faithful capture of a call matching the
    /// entry's signature; string parameters are dereferenced as
    /// `char*`.
    pub unsafe fn dispatch(&self, id: CallbackId, frame: &RawCallFrame) -> RawReturn {
        let Some(entry) = self.lookup(id) else {
            panic!("bruecke: dispatch for unregistered callback {}", id.0);
        };
        let args = match entry.convention {
            Convention::Aapcs64Darwin => unsafe { unpack_darwin(&entry.params, frame) },
            _ => unsafe { unpack_slots(&entry.params, frame) },
        };
        let result = (entry.func)(&args);
        pack_return(&entry.ret, &result)
    }
}

/// SysV and standard AAPCS64 share the same inverse placement for
/// primitive parameters: each class has its own register cursor, and
/// whichever class runs dry takes the next whole stack slot.
unsafe fn unpack_slots(params: &[Arc<TypeDesc>], frame: &RawCallFrame) -> Vec<CValue> {
    let mut ints = 0usize;
    let mut floats = 0usize;
    let mut slot = 0usize;
    let mut args = Vec::with_capacity(params.len());
    for desc in params {
        let word = if desc.kind.is_float() {
            if floats < FLOAT_REGISTERS {
                floats += 1;
                frame.float_regs[floats - 1]
            } else {
                slot += 1;
                frame.read_slot(slot - 1)
            }
        } else if ints < INT_REGISTERS {
            ints += 1;
            frame.int_regs[ints - 1]
        } else {
            slot += 1;
            frame.read_slot(slot - 1)
        };
        args.push(unsafe { scalar_from_word(desc.kind, word) });
    }
    args
}

/// Darwin inverse: replay the fit test to learn which parameters took
/// registers, then read the rest out of the bundled stack bytes at the
/// same offsets the caller packed them.
unsafe fn unpack_darwin(params: &[Arc<TypeDesc>], frame: &RawCallFrame) -> Vec<CValue> {
    enum Loc {
        Int(usize),
        Float(usize),
        Bundled(usize),
    }

    let mut ints = 0usize;
    let mut floats = 0usize;
    let mut locs = Vec::with_capacity(params.len());
    let mut bundled: Vec<&TypeDesc> = Vec::new();
    for desc in params {
        let before = (ints, floats);
        if darwin::fits_registers(desc, &mut ints, &mut floats) {
            if desc.kind.is_float() {
                locs.push(Loc::Float(before.1));
            } else {
                locs.push(Loc::Int(before.0));
            }
        } else {
            locs.push(Loc::Bundled(bundled.len()));
            bundled.push(desc);
        }
    }
    let layout = darwin::bundle_layout(bundled.iter().copied());

    params
        .iter()
        .zip(locs)
        .map(|(desc, loc)| match loc {
            Loc::Int(i) => unsafe { scalar_from_word(desc.kind, frame.int_regs[i]) },
            Loc::Float(i) => unsafe { scalar_from_word(desc.kind, frame.float_regs[i]) },
            Loc::Bundled(i) => {
                let offset = layout.offsets[i];
                let bytes = frame.read_bytes(offset, desc.size);
                unsafe { decode_value(desc, bytes, 0) }
            }
        })
        .collect()
}

/// Remarshal the managed function's result into return registers. A
/// result that disagrees with the registered signature is a bug in the
/// managed function and fatal: returning garbage registers to native
/// code is not an option.
fn pack_return(ret: &TypeDesc, value: &CValue) -> RawReturn {
    let mut out = RawReturn::default();
    match ret.kind {
        TypeKind::Void => {}
        TypeKind::F32 | TypeKind::F64 => match value.float_bits(ret.kind) {
            Ok(bits) => out.float[0] = bits,
            Err(_) => panic!(
                "bruecke: callback returned {} where its signature says {}",
                value.kind_name(),
                ret.kind.name()
            ),
        },
        _ => match value.int_bits(ret.kind) {
            Ok(bits) => out.int[0] = bits,
            Err(_) => panic!(
                "bruecke: callback returned {} where its signature says {}",
                value.kind_name(),
                ret.kind.name()
            ),
        },
    }
    out
}
