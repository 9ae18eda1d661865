//! Ketama-style consistent-hash balancer.
//!
//! Each healthy backend contributes `vnodes_per_weight * weight` virtual
//! nodes on a 64-bit hash ring. Membership changes rebuild the ring wholesale
//! and publish it copy-on-write: readers see the old ring or the new one,
//! never a partial rebuild. Routing walks to the first virtual node at or
//! after the key's position, wrapping around the ring, so removing one of M
//! backends remaps only ~1/M of keys.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use crosswire_core::error::{Error, Result};

/// One physical backend address with a relative weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backend {
    pub addr: String,
    pub weight: u32,
}

impl Backend {
    pub fn new(addr: impl Into<String>, weight: u32) -> Self {
        Self {
            addr: addr.into(),
            weight,
        }
    }
}

struct Ring {
    /// hash position -> index into `backends`.
    points: BTreeMap<u64, usize>,
    backends: Vec<Backend>,
}

pub struct KetamaBalancer {
    ring: RwLock<Arc<Ring>>,
    vnodes_per_weight: u32,
}

impl KetamaBalancer {
    /// `vnodes_per_weight` virtual nodes are placed per unit of backend
    /// weight (values around 32-160 give a reasonably even spread).
    pub fn new(vnodes_per_weight: u32) -> Self {
        Self {
            ring: RwLock::new(Arc::new(Ring {
                points: BTreeMap::new(),
                backends: Vec::new(),
            })),
            vnodes_per_weight: vnodes_per_weight.max(1),
        }
    }

    pub fn with_backends(vnodes_per_weight: u32, backends: Vec<Backend>) -> Self {
        let lb = Self::new(vnodes_per_weight);
        lb.rebuild(backends);
        lb
    }

    /// Rebuild the ring from the full current backend set and publish it
    /// atomically. Called on every membership change.
    pub fn rebuild(&self, backends: Vec<Backend>) {
        let mut points = BTreeMap::new();
        for (idx, backend) in backends.iter().enumerate() {
            let vnodes = self.vnodes_per_weight * backend.weight.max(1);
            for i in 0..vnodes {
                let point = fnv1a64(format!("{}#{}", backend.addr, i).as_bytes());
                points.insert(point, idx);
            }
        }
        let next = Arc::new(Ring { points, backends });
        *write_ignore_poison(&self.ring) = next;
    }

    /// Current backend set (ring snapshot).
    pub fn backends(&self) -> Vec<Backend> {
        read_ignore_poison(&self.ring).backends.clone()
    }

    /// Select a backend for a routing key. A missing key falls back to a
    /// clock-derived pseudo-random position. An empty or stale ring fails
    /// with [`Error::NoBackend`]; retrying is the caller's policy.
    pub fn pick(&self, key: Option<&str>) -> Result<Backend> {
        let ring = read_ignore_poison(&self.ring).clone();
        if ring.points.is_empty() {
            return Err(Error::NoBackend);
        }

        let position = match key {
            Some(k) => fnv1a64(k.as_bytes()),
            None => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as u64;
                fnv1a64(&nanos.to_le_bytes())
            }
        };

        let idx = ring
            .points
            .range(position..)
            .next()
            .or_else(|| ring.points.iter().next())
            .map(|(_, idx)| *idx)
            .ok_or(Error::NoBackend)?;

        ring.backends.get(idx).cloned().ok_or(Error::NoBackend)
    }
}

/// FNV-1a, 64-bit. Stable across processes, which keeps vnode placement
/// deterministic for a given backend set.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn read_ignore_poison<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match l.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn write_ignore_poison<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match l.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}
