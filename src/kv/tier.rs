//! The three residency tiers a KV-context blob can live in, plus the
//! `Pending` state used while an ingest is in flight.

use std::fmt;

/// Where a context's key/value tensors currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Device-resident: immediately usable by `INFER`.
    Hot,
    /// Host-resident, not yet staged onto the device.
    Warm,
    /// Disk-only, via the blob store.
    Cold,
    /// Ingest in flight; not yet queryable.
    Pending,
}

impl Tier {
    /// Ordinal used to compare "how resident" two tiers are; lower is hotter.
    pub fn level(self) -> u8 {
        match self {
            Tier::Hot => 0,
            Tier::Warm => 1,
            Tier::Cold => 2,
            Tier::Pending => 3,
        }
    }

    pub fn demote(self) -> Option<Tier> {
        match self {
            Tier::Hot => Some(Tier::Warm),
            Tier::Warm => Some(Tier::Cold),
            Tier::Cold | Tier::Pending => None,
        }
    }

    pub fn promote(self) -> Option<Tier> {
        match self {
            Tier::Warm => Some(Tier::Hot),
            Tier::Cold => Some(Tier::Warm),
            Tier::Hot | Tier::Pending => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
            Tier::Pending => "pending",
        };
        write!(f, "{s}")
    }
}

/// Per-tier occupancy, tracked so eviction can check a budget without
/// summing the whole directory each time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierStats {
    pub bytes_used: usize,
    pub count: usize,
}
