//! The call image: the deterministic register/stack picture a marshal
//! pass produces, plus the raw frames that cross the unsafe boundary.
use std::ffi::CString;

/// Integer argument registers both supported conventions expose.
pub const INT_REGISTERS: usize = 8;
/// Float argument registers both supported conventions expose.
pub const FLOAT_REGISTERS: usize = 8;

/// Allocations that must outlive the raw call: native copies of managed
/// strings and by-reference aggregate copies. Dropping the owning
/// [`CallImage`] before the call returns would hand the callee dangling
/// pointers.
#[derive(Debug)]
pub enum KeepAlive {
    CStr(CString),
    Bytes(Box<[u8]>),
}

impl KeepAlive {
    pub fn address(&self) -> u64 {
        match self {
            KeepAlive::CStr(s) => s.as_ptr() as u64,
            KeepAlive::Bytes(b) => b.as_ptr() as u64,
        }
    }
}

/// Byte-addressable overflow area, grown in 8-byte slots. All reads
/// are bounds-checked; walking past the end is a marshaler bug and
/// aborts rather than fabricating argument bytes.
#[derive(Debug, Default)]
pub struct StackImage {
    bytes: Vec<u8>,
}

impl StackImage {
    pub fn push_slot(&mut self, word: u64) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    pub fn slot(&self, index: usize) -> u64 {
        let start = index * 8;
        if start + 8 > self.bytes.len() {
            panic!("bruecke: stack image read past end (slot {index})");
        }
        le_word(&self.bytes[start..start + 8])
    }

    pub fn slots(&self) -> usize {
        self.bytes.len() / 8
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
    }
}

/// Saved image position for all-or-nothing placement: a failed register
/// attempt rolls back registers, stack bytes and any keep-alive entries
/// the partial walk created.
#[derive(Debug, Copy, Clone)]
pub struct ImageMark {
    ints: usize,
    floats: usize,
    stack: usize,
    keep_alive: usize,
}

/// The complete argument picture for one native call.
#[derive(Debug, Default)]
pub struct CallImage {
    ints: Vec<u64>,
    floats: Vec<u64>,
    stack: StackImage,
    keep_alive: Vec<KeepAlive>,
    indirect_return: bool,
}

impl CallImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place an integer-class word, spilling to the stack once the
    /// register file is exhausted.
    pub fn add_int(&mut self, word: u64) {
        if self.ints.len() < INT_REGISTERS {
            self.ints.push(word);
        } else {
            self.stack.push_slot(word);
        }
    }

    pub fn add_float(&mut self, word: u64) {
        if self.floats.len() < FLOAT_REGISTERS {
            self.floats.push(word);
        } else {
            self.stack.push_slot(word);
        }
    }

    pub fn add_stack(&mut self, word: u64) {
        self.stack.push_slot(word);
    }

    pub fn ints_used(&self) -> usize {
        self.ints.len()
    }

    pub fn floats_used(&self) -> usize {
        self.floats.len()
    }

    pub fn int_registers(&self) -> &[u64] {
        &self.ints
    }

    pub fn float_registers(&self) -> &[u64] {
        &self.floats
    }

    pub fn stack(&self) -> &StackImage {
        &self.stack
    }

    /// Park an allocation for the call's duration and hand back its
    /// address for placement.
    pub fn keep(&mut self, item: KeepAlive) -> u64 {
        let address = item.address();
        self.keep_alive.push(item);
        address
    }

    pub fn keep_alive(&self) -> &[KeepAlive] {
        &self.keep_alive
    }

    pub(crate) fn keep_alive_mut(&mut self) -> &mut Vec<KeepAlive> {
        &mut self.keep_alive
    }

    pub fn save(&self) -> ImageMark {
        ImageMark {
            ints: self.ints.len(),
            floats: self.floats.len(),
            stack: self.stack.len(),
            keep_alive: self.keep_alive.len(),
        }
    }

    pub fn rollback(&mut self, mark: ImageMark) {
        self.ints.truncate(mark.ints);
        self.floats.truncate(mark.floats);
        self.stack.truncate(mark.stack);
        self.keep_alive.truncate(mark.keep_alive);
    }

    pub fn set_indirect_return(&mut self) {
        self.indirect_return = true;
    }

    /// Whether the callee writes its aggregate result through a hidden
    /// pointer argument instead of the return registers.
    pub fn is_indirect_return(&self) -> bool {
        self.indirect_return
    }
}

/// Raw register state coming back from a native call.
#[derive(Debug, Copy, Clone, Default)]
pub struct RawReturn {
    pub int: [u64; 2],
    pub float: [u64; 2],
}

/// Incoming argument state a callback trampoline captured: the full
/// integer and float register files plus the caller's overflow bytes.
#[derive(Debug, Clone)]
pub struct RawCallFrame {
    pub int_regs: [u64; INT_REGISTERS],
    pub float_regs: [u64; FLOAT_REGISTERS],
    pub stack: Vec<u8>,
}

impl RawCallFrame {
    pub fn new(
        int_regs: [u64; INT_REGISTERS],
        float_regs: [u64; FLOAT_REGISTERS],
        stack: Vec<u8>,
    ) -> Self {
        Self {
            int_regs,
            float_regs,
            stack,
        }
    }

    pub fn read_slot(&self, index: usize) -> u64 {
        let start = index * 8;
        if start + 8 > self.stack.len() {
            panic!("bruecke: call frame stack read past end (slot {index})");
        }
        le_word(&self.stack[start..start + 8])
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        if offset + len > self.stack.len() {
            panic!("bruecke: call frame stack read past end (offset {offset}, len {len})");
        }
        &self.stack[offset..offset + len]
    }
}

/// Little-endian word from up to 8 bytes; short slices read as if
/// zero-padded.
pub(crate) fn le_word(chunk: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    let n = chunk.len().min(8);
    bytes[..n].copy_from_slice(&chunk[..n]);
    u64::from_le_bytes(bytes)
}
