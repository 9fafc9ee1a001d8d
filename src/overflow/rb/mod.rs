use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as MemOrd};


/// An overflow as captured in interrupt context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Record {
    pub slot: usize,
    pub token: u64,
    pub address: usize,
    pub at: u64,
}

struct Cell {
    seq: AtomicUsize,
    slot: AtomicUsize,
    token: AtomicU64,
    address: AtomicUsize,
    at: AtomicU64,
}

// Bounded multi-producer queue over a pre-allocated array.
//
// Each cell carries a sequence number: `pos` when free for the producer
// claiming `pos`, `pos + 1` once published for the consumer. Producers never
// allocate, block or take locks, so `push` may run inside a signal handler.
pub(crate) struct Rb {
    cells: Box<[Cell]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    lost: AtomicU64,
}

impl Rb {
    pub fn new(capacity: usize) -> Self {
        let size = capacity.max(2).next_power_of_two();
        let cells = (0..size)
            .map(|i| Cell {
                seq: AtomicUsize::new(i),
                slot: AtomicUsize::new(0),
                token: AtomicU64::new(0),
                address: AtomicUsize::new(0),
                at: AtomicU64::new(0),
            })
            .collect();
        Self {
            cells,
            mask: size - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            lost: AtomicU64::new(0),
        }
    }

    pub fn push(&self, record: Record) -> bool {
        let mut pos = self.head.load(MemOrd::Relaxed);
        loop {
            let cell = &self.cells[pos & self.mask];
            let seq = cell.seq.load(MemOrd::Acquire);
            match seq.wrapping_sub(pos) as isize {
                0 => {
                    let next = pos.wrapping_add(1);
                    match self.head.compare_exchange_weak(
                        pos,
                        next,
                        MemOrd::Relaxed,
                        MemOrd::Relaxed,
                    ) {
                        Ok(_) => {
                            cell.slot.store(record.slot, MemOrd::Relaxed);
                            cell.token.store(record.token, MemOrd::Relaxed);
                            cell.address.store(record.address, MemOrd::Relaxed);
                            cell.at.store(record.at, MemOrd::Relaxed);
                            cell.seq.store(next, MemOrd::Release);
                            return true;
                        }
                        Err(actual) => pos = actual,
                    }
                }
                d if d < 0 => {
                    self.lost.fetch_add(1, MemOrd::Relaxed);
                    return false;
                }
                _ => pos = self.head.load(MemOrd::Relaxed),
            }
        }
    }

    // Only the dispatcher pops, serialized by its drain lock.
    pub fn pop(&self) -> Option<Record> {
        let pos = self.tail.load(MemOrd::Relaxed);
        let cell = &self.cells[pos & self.mask];
        let seq = cell.seq.load(MemOrd::Acquire);
        if seq != pos.wrapping_add(1) {
            return None;
        }
        let record = Record {
            slot: cell.slot.load(MemOrd::Relaxed),
            token: cell.token.load(MemOrd::Relaxed),
            address: cell.address.load(MemOrd::Relaxed),
            at: cell.at.load(MemOrd::Relaxed),
        };
        self.tail.store(pos.wrapping_add(1), MemOrd::Relaxed);
        cell.seq.store(pos.wrapping_add(self.mask + 1), MemOrd::Release);
        Some(record)
    }

    pub fn lost(&self) -> u64 {
        self.lost.load(MemOrd::Relaxed)
    }
}
