//! Shared checks for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use panther_vm::{FrameAllocator, PhysFrame, Process, Vm};

/// Count the live present mappings of every frame across `processes`.
pub fn mappings<'a>(processes: impl IntoIterator<Item = &'a Process>) -> BTreeMap<PhysFrame, u32> {
    let mut seen = BTreeMap::new();
    for process in processes {
        if let Some(space) = process.space() {
            for (_, entry) in space.mapped() {
                *seen.entry(entry.frame()).or_insert(0) += 1;
            }
        }
    }
    seen
}

/// Check the reference table and frame pool against the live page tables.
///
/// - every frame's count equals the number of present entries mapping it
/// - a frame with more than one mapping is writable in none of them
/// - every allocated frame is either mapped or a page table frame
pub fn assert_accounting<'a, A: FrameAllocator>(vm: &Vm<A>, processes: impl IntoIterator<Item = &'a Process> + Clone) {
    let seen = mappings(processes.clone());
    for (&frame, &count) in &seen {
        assert_eq!(vm.refs().count(frame), count, "count of frame {}", frame);
    }
    assert_eq!(vm.refs().mapped_frames(), seen.len(), "referenced frames with no mapping");

    let mut tables = 0;
    for process in processes {
        let Some(space) = process.space() else { continue };
        tables += space.directory().table_frames();
        for (va, entry) in space.mapped() {
            assert!(entry.is_present() && entry.is_user(), "bad entry at {}", va);
            if seen[&entry.frame()] > 1 {
                assert!(!entry.is_writable(), "shared frame {} writable at {}", entry.frame(), va);
            }
            assert!(va.as_usize() < space.size(), "mapping at {} above size {:#x}", va, space.size());
        }
    }

    let memory = vm.memory();
    assert_eq!(
        memory.total_frames() - memory.free_frames(),
        tables + seen.len(),
        "allocated frames leaked"
    );
}
