// Copyright 2022. The GlobalWitness Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Sliding-window size of a [`RateCounter`].
const WINDOW_SECS: u64 = 60;

/// Sentinel for a bucket that has never been written.
const EMPTY: u64 = u64::MAX;

/// Events-per-minute counter over a ring of 60 one-second buckets.
///
/// Each bucket packs the absolute second it represents in the high 32 bits and the event count in
/// the low 32 bits, so claiming a stale bucket and counting into it is a single CAS loop.
pub struct RateCounter {
    started: Instant,
    buckets: [AtomicU64; WINDOW_SECS as usize],
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateCounter {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            buckets: std::array::from_fn(|_| AtomicU64::new(EMPTY)),
        }
    }

    fn now_sec(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Records one event.
    pub fn incr(&self) {
        self.incr_at(self.now_sec());
    }

    /// Events per minute over the sliding window.
    pub fn rate(&self) -> i64 {
        self.rate_at(self.now_sec())
    }

    fn incr_at(&self, sec: u64) {
        let bucket = &self.buckets[(sec % WINDOW_SECS) as usize];
        let mut current = bucket.load(Ordering::Acquire);
        loop {
            let next = if current != EMPTY && current >> 32 == sec & 0xffff_ffff {
                current + 1
            } else {
                // Stale or empty bucket: claim it for this second with a count of one.
                (sec & 0xffff_ffff) << 32 | 1
            };
            match bucket.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    fn rate_at(&self, now_sec: u64) -> i64 {
        let now_sec = now_sec & 0xffff_ffff;
        self.buckets
            .iter()
            .map(|bucket| bucket.load(Ordering::Acquire))
            .filter(|&word| word != EMPTY)
            .filter(|&word| now_sec.saturating_sub(word >> 32) < WINDOW_SECS)
            .map(|word| (word & 0xffff_ffff) as i64)
            .sum()
    }
}

/// The five live rates the coordinator reports.
#[derive(Default)]
pub struct CrawlCounters {
    pub attempts: RateCounter,
    pub successes: RateCounter,
    pub failures: RateCounter,
    pub voluntary_disconnects: RateCounter,
    pub skipped_in_network: RateCounter,
}

impl CrawlCounters {
    pub fn new() -> Self {
        Default::default()
    }
}
