//! Copy-on-write address space duplication
//!
//! `fork` never copies user pages. Every present page of the parent is
//! installed read-only in the child, writable pages of the parent are
//! demoted to read-only first, and each frame gains one reference for the
//! child's mapping. The first write from either side faults and is
//! resolved by [`AddressSpace::break_cow`].

use super::address::ENTRIES_PER_TABLE;
use super::frame::FrameAllocator;
use super::paging::{MappingError, PteFlags};
use super::refcount::FrameRefTable;
use super::space::AddressSpace;

/// Build a child address space sharing every present page of `parent`.
///
/// Leaf tables are allocated one at a time, and a parent table is only
/// demoted once the matching child table exists. On failure the partial
/// child is released (dropping every reference it took) and the parent is
/// left with read-only entries whose counts are exact again, so its next
/// write fault simply upgrades them in place.
pub fn duplicate<A: FrameAllocator + ?Sized>(
    parent: &mut AddressSpace,
    refs: &FrameRefTable,
    allocator: &A,
) -> Result<AddressSpace, MappingError> {
    let mut child = AddressSpace::new(allocator)?;
    child.set_size(parent.size());

    let mut shared = 0usize;
    let mut failure = None;
    for (dir, parent_table) in parent.directory_mut().tables_mut() {
        let child_table = match child.directory_mut().table_or_create(dir, allocator) {
            Ok(table) => table,
            Err(err) => {
                failure = Some(err);
                break;
            }
        };

        let mut counts = refs.lock();
        for index in 0..ENTRIES_PER_TABLE {
            let entry = &mut parent_table[index];
            if !entry.is_present() {
                continue;
            }
            // Demote the parent before the child can see the frame.
            entry.remove_flags(PteFlags::WRITABLE);
            child_table[index] = *entry;
            counts.increment(entry.frame());
            shared += 1;
        }
    }

    parent.reload();

    if let Some(err) = failure {
        log::warn!("[fork] duplication failed after {} pages: {}", shared, err);
        child.release(refs, allocator);
        return Err(err);
    }

    child.reload();
    log::debug!(
        "[fork] {} pages shared copy-on-write, size {:#x}",
        shared,
        child.size()
    );
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GrowthPolicy;
    use crate::mm::address::{VirtAddr, KERNEL_BASE, PAGE_SIZE};
    use crate::mm::frame::PhysicalMemory;

    fn grown(memory: &PhysicalMemory, refs: &FrameRefTable, bytes: usize) -> AddressSpace {
        let mut space = AddressSpace::new(memory).unwrap();
        space
            .grow(bytes as isize, GrowthPolicy::Eager, KERNEL_BASE, refs, memory)
            .unwrap();
        space
    }

    #[test]
    fn test_fork_shares_read_only() {
        let memory = PhysicalMemory::new(64);
        let refs = FrameRefTable::new(64);
        let mut parent = grown(&memory, &refs, 3 * PAGE_SIZE);
        let parent_entry = parent.translate(VirtAddr::new(0)).unwrap();
        memory.write_frame(parent_entry.frame(), 0, b"hello");
        let free = memory.free_frames();

        let child = duplicate(&mut parent, &refs, &memory).unwrap();
        assert_eq!(child.size(), parent.size());
        // Only the child's directory and one leaf table were allocated.
        assert_eq!(memory.free_frames(), free - 2);

        for ((pva, pentry), (cva, centry)) in parent.mapped().zip(child.mapped()) {
            assert_eq!(pva, cva);
            assert_eq!(pentry, centry);
            assert_eq!(pentry.flags(), PteFlags::USER_SHARED);
            assert_eq!(refs.count(pentry.frame()), 2);
        }
        assert_eq!(child.mapped().count(), 3);

        let mut buf = [0u8; 5];
        let centry = child.translate(VirtAddr::new(0)).unwrap();
        memory.read_frame(centry.frame(), 0, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_fork_reloads_both_spaces() {
        let memory = PhysicalMemory::new(16);
        let refs = FrameRefTable::new(16);
        let mut parent = grown(&memory, &refs, PAGE_SIZE);
        let before = parent.reload_count();
        let child = duplicate(&mut parent, &refs, &memory).unwrap();
        assert_eq!(parent.reload_count(), before + 1);
        assert_eq!(child.reload_count(), 1);
    }

    #[test]
    fn test_fork_of_shared_page_counts_once_per_mapping() {
        let memory = PhysicalMemory::new(32);
        let refs = FrameRefTable::new(32);
        let mut parent = grown(&memory, &refs, PAGE_SIZE);
        let frame = parent.translate(VirtAddr::new(0)).unwrap().frame();

        let mut first = duplicate(&mut parent, &refs, &memory).unwrap();
        let second = duplicate(&mut first, &refs, &memory).unwrap();
        assert_eq!(refs.count(frame), 3);
        assert!(!second.translate(VirtAddr::new(0)).unwrap().is_writable());

        second.release(&refs, &memory);
        first.release(&refs, &memory);
        assert_eq!(refs.count(frame), 1);
    }

    #[test]
    fn test_failed_fork_unwinds_child() {
        // Two leaf tables in the parent; the child only has room for one.
        let memory = PhysicalMemory::new(8);
        let refs = FrameRefTable::new(8);
        let mut parent = AddressSpace::new(&memory).unwrap();
        parent.set_size(KERNEL_BASE);
        let low = parent.map_zeroed(VirtAddr::new(0), &refs, &memory).unwrap();
        let high = parent
            .map_zeroed(VirtAddr::new(0x0040_0000), &refs, &memory)
            .unwrap();
        // Leave room for the child's root and first table only.
        let spare = memory.allocate_frame().unwrap();

        assert_eq!(
            duplicate(&mut parent, &refs, &memory).err(),
            Some(MappingError::OutOfMemory)
        );
        assert_eq!(refs.count(low), 1);
        assert_eq!(refs.count(high), 1);
        assert_eq!(memory.free_frames(), 2);
        memory.free_frame(spare);

        // The demoted parent page upgrades in place on its next write.
        let low_entry = parent.translate(VirtAddr::new(0)).unwrap();
        assert!(!low_entry.is_writable());
        assert_eq!(
            parent.break_cow(VirtAddr::new(0), &refs, &memory),
            Ok(crate::mm::space::CowResolution::Upgraded(low))
        );
    }
}
