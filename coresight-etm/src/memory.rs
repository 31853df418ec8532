//! Access to one ETM instance's memory-mapped register window.
//!
//! The crate does not map device memory itself. A collaborator (typically a
//! `/dev/mem` mapping helper) hands over a pointer to one trace unit's 4 KiB
//! register window and [`MmioWindow`] wraps it. Everything above this module
//! goes through the [`EtmMemory`] trait, which also makes the register
//! programming testable against a fake window.

use core::ptr;

/// Size of one ETMv4 register window in bytes.
pub const ETM_WINDOW_SIZE: usize = 0x1000;

/// Word-level access into a single ETM register window.
///
/// Accesses are infallible: once the window is mapped there is no transport
/// in between that could fail, and an unmapped window is a precondition
/// violation rather than a recoverable error.
pub trait EtmMemory {
    /// Read the 32-bit register at `offset` bytes from the window base.
    fn read_word(&mut self, offset: u32) -> u32;

    /// Write the 32-bit register at `offset` bytes from the window base.
    fn write_word(&mut self, offset: u32, value: u32);

    /// Read a 64-bit register as two word accesses, low word first.
    fn read_dword(&mut self, offset: u32) -> u64 {
        let low = u64::from(self.read_word(offset));
        let high = u64::from(self.read_word(offset + 4));
        low | (high << 32)
    }

    /// Write a 64-bit register as two word accesses, low word first.
    fn write_dword(&mut self, offset: u32, value: u64) {
        self.write_word(offset, value as u32);
        self.write_word(offset + 4, (value >> 32) as u32);
    }

    /// Identity of the window, used by the registry to find the instance
    /// that owns a given register block. For a real mapping this is the
    /// virtual base address.
    fn base_address(&self) -> usize;
}

/// The production [`EtmMemory`] implementation: volatile access through a
/// raw pointer into mapped device memory.
///
/// One `MmioWindow` exclusively owns its register window for the lifetime of
/// the mapping. It may be moved to another thread, but all accesses to one
/// window must stay on a single logical thread of control.
pub struct MmioWindow {
    base: *mut u32,
}

impl MmioWindow {
    /// Wrap a mapped register window.
    ///
    /// # Safety
    ///
    /// `base` must point to the start of a mapped, readable and writable
    /// ETM register window of at least [`ETM_WINDOW_SIZE`] bytes, aligned
    /// to a word boundary, and must stay mapped for the lifetime of the
    /// returned value. No other handle may access the same window.
    pub unsafe fn new(base: *mut u32) -> Self {
        MmioWindow { base }
    }

    fn word_ptr(&self, offset: u32) -> *mut u32 {
        debug_assert_eq!(offset % 4, 0, "unaligned register offset {offset:#x}");
        debug_assert!((offset as usize) < ETM_WINDOW_SIZE);
        // Byte-based offset arithmetic keeps the register offsets identical
        // to the values in the architecture manual.
        unsafe { self.base.cast::<u8>().add(offset as usize).cast::<u32>() }
    }
}

// The window is exclusively owned, so moving it across threads is fine.
// `Sync` is deliberately not implemented.
unsafe impl Send for MmioWindow {}

impl EtmMemory for MmioWindow {
    fn read_word(&mut self, offset: u32) -> u32 {
        unsafe { ptr::read_volatile(self.word_ptr(offset)) }
    }

    fn write_word(&mut self, offset: u32, value: u32) {
        unsafe { ptr::write_volatile(self.word_ptr(offset), value) }
    }

    fn base_address(&self) -> usize {
        self.base as usize
    }
}
