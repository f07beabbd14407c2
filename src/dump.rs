//! Human-readable allocator state dump, used for debugging only — the
//! output is not stable for parsing.
//!
//! Renders into any [`core::fmt::Write`] sink so the same renderer backs
//! both the explicit `dump()` operation and the one-shot diagnostic dump
//! emitted immediately before a fatal abort.

use core::fmt::{self, Write};

use crate::dispatcher::Dispatcher;

pub fn dump(w: &mut dyn Write, d: &Dispatcher) -> fmt::Result {
    writeln!(w, "=== allocator dump ===")?;

    writeln!(w, "-- GPA address ring --")?;
    let mut gpa_slots = 0usize;
    let mut gpa_free = 0usize;
    d.gpa.for_each_slot(|slot| {
        let hdr = unsafe { &*slot.as_ptr() };
        gpa_slots += 1;
        if hdr.is_free() {
            gpa_free += 1;
        }
        let _ = writeln!(
            w,
            "  slot@{:p} size={} free={} owned={}",
            hdr.data.as_ptr(),
            hdr.size,
            hdr.is_free(),
            hdr.memory_is_owned
        );
    });
    writeln!(w, "  total={gpa_slots} free={gpa_free}")?;

    writeln!(w, "-- SRA --")?;
    writeln!(w, "  chunks={}", d.sra.chunk_count())?;

    Ok(())
}
