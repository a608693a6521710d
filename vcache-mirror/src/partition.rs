//! The exact piecewise sample-to-rank partition function. `N mod P != 0`
//! makes a single `s / samples_per_rank` division wrong on the tail
//! ranks; both distribution and owner lookup must share this one
//! function.

/// `rank r` owns samples `[r*q + min(r, m), r*q + min(r, m) + q + (1 if r
/// < m else 0))` where `q = N/P`, `m = N mod P`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePartition {
    pub total_samples: u64,
    pub num_ranks: u32,
}

impl SamplePartition {
    pub fn new(total_samples: u64, num_ranks: u32) -> Self {
        assert!(num_ranks > 0, "a partition needs at least one rank");
        Self {
            total_samples,
            num_ranks,
        }
    }

    fn q(&self) -> u64 {
        self.total_samples / self.num_ranks as u64
    }

    fn m(&self) -> u64 {
        self.total_samples % self.num_ranks as u64
    }

    /// Number of samples rank `r` owns: `q + 1` for the first `m` ranks,
    /// `q` for the rest.
    pub fn samples_for_rank(&self, r: u32) -> u64 {
        let q = self.q();
        if (r as u64) < self.m() {
            q + 1
        } else {
            q
        }
    }

    /// Global sample index of the first sample rank `r` owns:
    /// `r*q + min(r, m)`.
    pub fn start_of_rank(&self, r: u32) -> u64 {
        let q = self.q();
        let m = self.m();
        r as u64 * q + (r as u64).min(m)
    }

    /// The half-open range of global sample indices rank `r` owns.
    pub fn range_of_rank(&self, r: u32) -> std::ops::Range<u64> {
        let start = self.start_of_rank(r);
        start..start + self.samples_for_rank(r)
    }

    /// Which rank owns global sample index `s`, using the exact piecewise
    /// function rather than the approximation `s / samples_per_rank` that
    /// under-counts on tail ranks when `m > 0`.
    pub fn owner_of(&self, s: u64) -> u32 {
        let q = self.q();
        let m = self.m();
        // The first `m` ranks each own `q + 1` samples; samples before
        // `m * (q + 1)` fall in that region, the rest are evenly `q`-sized.
        let boundary = m * (q + 1);
        if q == 0 {
            // Degenerate: fewer samples than ranks, only the first `m`
            // ranks (each owning exactly one sample) own anything.
            return s as u32;
        }
        if s < boundary {
            (s / (q + 1)) as u32
        } else {
            (m + (s - boundary) / q) as u32
        }
    }

    /// `(owner rank, local element offset)` for global sample `s`:
    /// `local offset = (s mod samples_per_rank) * elements_per_sample`
    /// generalized to the piecewise partition.
    pub fn owner_and_local_offset(&self, s: u64, elements_per_sample: u64) -> (u32, u64) {
        let owner = self.owner_of(s);
        let local_index = s - self.start_of_rank(owner);
        (owner, local_index * elements_per_sample)
    }
}
