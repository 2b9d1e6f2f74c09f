//! Concurrency admission: global and per-address session caps.
//!
//! Counters are checked and claimed before the greeting is sent; a rejected
//! connection gets `421` and is closed. Claims are RAII permits so a
//! session that panics or is aborted still releases its slots.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use dashmap::DashMap;

/// Shared counters for one listener.
#[derive(Debug, Default, Clone)]
pub(crate) struct ConnectionGauge {
    active: Arc<AtomicUsize>,
    per_ip: Arc<DashMap<IpAddr, usize>>,
}

/// Why a connection was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdmissionDenied {
    TooManySessions,
    TooManyFromIp,
}

impl ConnectionGauge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Claim a slot for `ip`. A cap of 0 means unlimited.
    pub(crate) fn try_acquire(
        &self,
        ip: IpAddr,
        max_connections: usize,
        max_per_ip: usize,
    ) -> Result<ConnectionPermit, AdmissionDenied> {
        if max_connections > 0 && self.active.load(Ordering::Acquire) >= max_connections {
            return Err(AdmissionDenied::TooManySessions);
        }

        if max_per_ip > 0 {
            let mut entry = self.per_ip.entry(ip).or_insert(0);
            if *entry >= max_per_ip {
                return Err(AdmissionDenied::TooManyFromIp);
            }
            *entry += 1;
        } else {
            *self.per_ip.entry(ip).or_insert(0) += 1;
        }

        self.active.fetch_add(1, Ordering::AcqRel);

        Ok(ConnectionPermit {
            gauge: self.clone(),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        self.active.fetch_sub(1, Ordering::AcqRel);

        if let Some(mut entry) = self.per_ip.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            let drained = *entry == 0;
            drop(entry);
            if drained {
                self.per_ip.remove_if(&ip, |_, count| *count == 0);
            }
        }
    }
}

/// RAII claim on the admission counters; dropping it releases both the
/// global and the per-address slot.
#[derive(Debug)]
pub(crate) struct ConnectionPermit {
    gauge: ConnectionGauge,
    ip: IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.gauge.release(self.ip);
    }
}
