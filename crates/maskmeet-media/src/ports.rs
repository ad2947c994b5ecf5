//! UDP port-pair allocator for decoder ingest.
//!
//! Each decoder listens on an (RTP, RTCP) pair with RTCP = RTP + 1.
//! Allocation scans upward from a moving base so pairs never overlap even
//! under concurrent callers; `free` returns both ports to the pool.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::{MediaError, Result};

pub const DEFAULT_PORT_BASE: u16 = 20000;
pub const DEFAULT_PORT_MAX: u16 = 65000;

/// A consecutive (RTP, RTCP) UDP port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

#[derive(Debug)]
struct AllocatorState {
    used: HashSet<u16>,
    next_base: u16,
}

/// Hands out non-overlapping consecutive port pairs.
#[derive(Debug)]
pub struct PortAllocator {
    state: Mutex<AllocatorState>,
    max_port: u16,
}

impl PortAllocator {
    pub fn new(base: u16, max_port: u16) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                used: HashSet::new(),
                next_base: base,
            }),
            max_port,
        }
    }

    /// Allocate the next free (rtp, rtcp) pair.
    ///
    /// Scans upward in steps of two, skipping pairs where either port is
    /// still in use, and advances the base past the returned pair.
    pub fn allocate(&self) -> Result<PortPair> {
        let mut state = self.state.lock().expect("port allocator poisoned");

        let mut candidate = state.next_base;
        let rtcp = loop {
            let rtcp = match candidate.checked_add(1) {
                Some(rtcp) if rtcp <= self.max_port => rtcp,
                _ => return Err(MediaError::PortsExhausted(self.max_port)),
            };
            if !state.used.contains(&candidate) && !state.used.contains(&rtcp) {
                break rtcp;
            }
            candidate = candidate.saturating_add(2);
        };

        state.used.insert(candidate);
        state.used.insert(rtcp);
        state.next_base = rtcp.saturating_add(1);

        Ok(PortPair {
            rtp: candidate,
            rtcp,
        })
    }

    /// Return a previously allocated pair to the pool.
    ///
    /// The scan base is left alone: allocations stay strictly increasing
    /// until the configured cap.
    pub fn free(&self, pair: PortPair) {
        let mut state = self.state.lock().expect("port allocator poisoned");
        state.used.remove(&pair.rtp);
        state.used.remove(&pair.rtcp);
    }

    /// Number of ports currently handed out.
    pub fn in_use(&self) -> usize {
        self.state.lock().expect("port allocator poisoned").used.len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_BASE, DEFAULT_PORT_MAX)
    }
}
