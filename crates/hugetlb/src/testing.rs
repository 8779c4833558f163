//! Test doubles for the block source and the log sink.

use std::{
    collections::HashMap,
    fmt::{self, Write as _},
    string::String,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    vec::Vec,
};

use spin::mutex::SpinMutex;

use crate::{
    log::{self, LevelFormat, LogLevel, LogSink},
    node::NodeId,
    source::{AbortSignal, BlockSource, Pfn},
};

#[derive(Debug)]
struct MemoryState {
    next_pfn: usize,
    capacity: Vec<usize>,
    live_per_node: Vec<usize>,
    /// Live blocks: owning node and contents.
    blocks: HashMap<Pfn, (usize, u64)>,
}

/// A block source backed by a map, with a fixed capacity per node.
///
/// Each block holds a single word of contents so that clearing and copying
/// can be observed.
#[derive(Debug)]
pub(crate) struct MemorySource {
    state: SpinMutex<MemoryState>,
}

impl MemorySource {
    pub(crate) fn new(capacity: &[usize]) -> Self {
        Self {
            state: SpinMutex::new(MemoryState {
                next_pfn: 0x1000,
                capacity: capacity.to_vec(),
                live_per_node: vec![0; capacity.len()],
                blocks: HashMap::new(),
            }),
        }
    }

    pub(crate) fn set_capacity(&self, node: usize, capacity: usize) {
        self.state.lock().capacity[node] = capacity;
    }

    /// Number of blocks handed out and not released.
    pub(crate) fn live(&self) -> usize {
        self.state.lock().blocks.len()
    }

    pub(crate) fn live_on(&self, node: usize) -> usize {
        self.state.lock().live_per_node[node]
    }

    pub(crate) fn write(&self, pfn: Pfn, value: u64) {
        let mut state = self.state.lock();
        let block = state.blocks.get_mut(&pfn).expect("write to released block");
        block.1 = value;
    }

    pub(crate) fn read(&self, pfn: Pfn) -> u64 {
        self.state.lock().blocks[&pfn].1
    }
}

impl BlockSource for MemorySource {
    fn allocate(&self, order: u32, node: NodeId) -> Option<Pfn> {
        let mut state = self.state.lock();
        let n = node.index();
        if n >= state.capacity.len() || state.live_per_node[n] >= state.capacity[n] {
            return None;
        }
        let pfn = Pfn(state.next_pfn);
        state.next_pfn += 1 << order;
        state.live_per_node[n] += 1;
        // Fresh memory is not zeroed.
        state.blocks.insert(pfn, (n, 0xdead_beef));
        Some(pfn)
    }

    fn release(&self, pfn: Pfn, _order: u32) {
        let mut state = self.state.lock();
        let (node, _) = state.blocks.remove(&pfn).expect("double release");
        state.live_per_node[node] -= 1;
    }

    fn clear(&self, pfn: Pfn, _order: u32) {
        self.write(pfn, 0);
    }

    fn copy(&self, dst: Pfn, src: Pfn, _order: u32) {
        let value = self.read(src);
        self.write(dst, value);
    }
}

/// Fires after `is_pending` has been asked a number of times.
#[derive(Debug)]
pub(crate) struct AbortAfter {
    remaining: AtomicUsize,
}

impl AbortAfter {
    pub(crate) fn new(checks: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(checks),
        }
    }
}

impl AbortSignal for AbortAfter {
    fn is_pending(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_err()
    }
}

/// Records every message; shared by all tests of the crate.
pub(crate) struct CaptureSink {
    messages: SpinMutex<Vec<(LogLevel, String)>>,
}

impl CaptureSink {
    pub(crate) fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.messages
            .lock()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl LogSink for CaptureSink {
    fn write(&self, level: LogLevel, message: fmt::Arguments<'_>) {
        let mut text = String::new();
        let _ = write!(text, "{} {message}", LevelFormat(level));
        self.messages.lock().push((level, text));
    }
}

static CAPTURE: CaptureSink = CaptureSink {
    messages: SpinMutex::new(Vec::new()),
};

static SINK_USERS: Mutex<()> = Mutex::new(());

/// Installs the capturing sink. The guard keeps other tests from changing
/// the level filter while the caller inspects messages.
pub(crate) fn log_sink() -> (&'static CaptureSink, MutexGuard<'static, ()>) {
    let guard = SINK_USERS.lock().unwrap_or_else(PoisonError::into_inner);
    log::set_sink(&CAPTURE);
    (&CAPTURE, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_capacity() {
        let source = MemorySource::new(&[1, 2]);
        let a = source.allocate(9, NodeId::new(0)).unwrap();
        assert!(source.allocate(9, NodeId::new(0)).is_none());
        let b = source.allocate(9, NodeId::new(1)).unwrap();
        assert_ne!(a, b);
        assert_eq!((source.live(), source.live_on(1)), (2, 1));
        source.release(a, 9);
        source.set_capacity(1, 1);
        assert!(source.allocate(9, NodeId::new(1)).is_none());
        assert!(source.allocate(9, NodeId::new(0)).is_some());
    }
}
