//! Teardown: walk the GPA address ring and the SRA chunk list, releasing
//! every backing region the allocator itself obtained via the growth
//! callback.

use core::ptr::NonNull;

use crate::dispatcher::Dispatcher;
use crate::meta::GpaSlotHeader;

/// Release every owned backing chunk. Deferred: the ring/chunk list is
/// walked to completion first and chunks are released only afterwards, so
/// releasing one chunk never invalidates the header we are about to inspect
/// next.
pub fn destroy(dispatcher: &mut Dispatcher) {
    let mut gpa_chunks = Vec::new();
    dispatcher.gpa.for_each_slot(|slot| {
        let hdr = unsafe { &*slot.as_ptr() };
        if hdr.memory_is_owned {
            let header_addr = hdr.data.as_ptr() as usize - GpaSlotHeader::GAP_BEFORE_DATA;
            let raw_base = header_addr - hdr.right_adjustment as usize;
            gpa_chunks.push(unsafe { NonNull::new_unchecked(raw_base as *mut u8) });
        }
    });

    let mut sra_chunks = Vec::new();
    dispatcher.sra.for_each_owned_chunk(|base| sra_chunks.push(base));

    for chunk in gpa_chunks.into_iter().chain(sra_chunks) {
        dispatcher.growth.release(chunk);
    }
    crate::diag_info!("heap destroyed, owned backing chunks released");
}
