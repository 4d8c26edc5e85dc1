//! A single seedable RNG shared across the tasks spawned by one fetch.
//!
//! Peer-id generation and UDP transaction-id/key generation both need
//! randomness; rather than each reaching for a thread-local generator, the
//! coordinator owns one `StdRng` and hands out a cheaply-clonable handle to
//! it, so a test can seed the whole fetch and get deterministic ids.
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

#[derive(Clone)]
pub struct SharedRng(Arc<Mutex<StdRng>>);

impl SharedRng {
    /// Seeds from the OS entropy source, for normal (non-test) use.
    pub fn from_os() -> Self {
        Self(Arc::new(Mutex::new(StdRng::from_os_rng())))
    }

    /// Seeds deterministically, for reproducible tests.
    pub fn from_seed(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(StdRng::seed_from_u64(seed))))
    }

    pub fn next_u32(&self) -> u32 {
        self.0.lock().unwrap().next_u32()
    }

    pub fn fill_bytes(&self, dest: &mut [u8]) {
        self.0.lock().unwrap().fill_bytes(dest)
    }
}
