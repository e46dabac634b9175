//! Random grow/shrink/fork/write/exit sequences checked against a model.
//!
//! Each live process carries a byte-for-byte model of its address space.
//! After every step the reference table must match the live page tables
//! exactly and every process must read back its own model.

mod common;

use panther_vm::{FrameAllocator, GrowthPolicy, Process, VirtAddr, Vm, VmConfig, PAGE_SIZE};
use proptest::prelude::*;

const USER_LIMIT: usize = 8 * PAGE_SIZE;
const MAX_PROCESSES: usize = 5;

#[derive(Debug, Clone)]
enum Op {
    Grow { who: usize, delta: isize },
    Fork { who: usize },
    Write { who: usize, at: usize, len: usize, byte: u8 },
    Exit { who: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    let step = 3 * PAGE_SIZE as isize;
    prop_oneof![
        3 => (any::<usize>(), -step..step).prop_map(|(who, delta)| Op::Grow { who, delta }),
        1 => any::<usize>().prop_map(|who| Op::Fork { who }),
        4 => (any::<usize>(), any::<usize>(), 1usize..2 * PAGE_SIZE, any::<u8>())
            .prop_map(|(who, at, len, byte)| Op::Write { who, at, len, byte }),
        1 => any::<usize>().prop_map(|who| Op::Exit { who }),
    ]
}

struct Live {
    process: Process,
    model: Vec<u8>,
}

fn apply(vm: &Vm, live: &mut Vec<Live>, op: Op) {
    if live.is_empty() {
        return;
    }
    match op {
        Op::Grow { who, delta } => {
            let index = who % live.len();
            let target = &mut live[index];
            let old = target.model.len();
            match vm.grow_address_space(&mut target.process, delta) {
                Ok(reported) => {
                    assert_eq!(reported, old);
                    let new = old.checked_add_signed(delta).unwrap();
                    target.model.resize(new, 0);
                }
                Err(_) => assert_eq!(target.process.size(), old),
            }
        }
        Op::Fork { who } => {
            if live.len() == MAX_PROCESSES {
                return;
            }
            let index = who % live.len();
            let source = &mut live[index];
            if let Ok(process) = vm.fork_address_space(&mut source.process) {
                let model = source.model.clone();
                live.push(Live { process, model });
            }
        }
        Op::Write { who, at, len, byte } => {
            let index = who % live.len();
            let target = &mut live[index];
            let size = target.model.len();
            if size == 0 {
                return;
            }
            let at = at % size;
            let len = len.min(size - at);
            let data = vec![byte; len];
            match vm.write_user(&mut target.process, VirtAddr::new(at), &data) {
                Ok(()) => target.model[at..at + len].copy_from_slice(&data),
                Err(_) => {
                    // Only running out of frames can kill an in-range write.
                    assert!(target.process.is_killed());
                    vm.checkpoint(&mut target.process);
                    live.swap_remove(index);
                }
            }
        }
        Op::Exit { who } => {
            let index = who % live.len();
            let mut gone = live.swap_remove(index);
            vm.exit(&mut gone.process);
        }
    }
}

fn check(vm: &Vm, live: &mut Vec<Live>) {
    common::assert_accounting(vm, live.iter().map(|l| &l.process));
    let mut index = 0;
    while index < live.len() {
        let entry = &mut live[index];
        let mut buf = vec![0u8; entry.model.len()];
        if vm.read_user(&mut entry.process, VirtAddr::new(0), &mut buf).is_err() {
            // Faulting in a lazily grown page can run out of frames.
            vm.checkpoint(&mut entry.process);
            live.swap_remove(index);
            continue;
        }
        assert_eq!(buf, entry.model, "pid {} diverged from its model", entry.process.pid());
        index += 1;
    }
    common::assert_accounting(vm, live.iter().map(|l| &l.process));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn refcounts_track_mappings(
        lazy in any::<bool>(),
        frames in 24usize..96,
        ops in prop::collection::vec(arb_op(), 1..40),
    ) {
        let growth = if lazy { GrowthPolicy::Lazy } else { GrowthPolicy::Eager };
        let config = VmConfig::new()
            .with_frames(frames)
            .with_growth(growth)
            .with_user_limit(USER_LIMIT);
        let vm = Vm::new(config).unwrap();
        let mut live = vec![Live { process: vm.spawn("init").unwrap(), model: Vec::new() }];

        for op in ops {
            apply(&vm, &mut live, op);
            check(&vm, &mut live);
        }

        for mut entry in live.drain(..) {
            vm.exit(&mut entry.process);
        }
        prop_assert_eq!(vm.memory().free_frames(), frames);
        prop_assert_eq!(vm.refs().mapped_frames(), 0);
    }
}
