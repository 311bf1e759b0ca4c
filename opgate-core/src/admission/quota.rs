// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub concurrent_ops: usize,
    pub max_concurrent_ops: usize,
    pub total_operations: u64,
    pub total_input_bytes: u64,
    pub total_output_bytes: u64,
    pub total_input_mb: f64,
    pub total_output_mb: f64,
}

/// Concurrency ceiling plus cumulative throughput counters.
#[derive(Debug)]
pub struct QuotaTracker {
    max_concurrent_ops: usize,
    concurrent_ops: AtomicUsize,
    total_operations: AtomicU64,
    total_input_bytes: AtomicU64,
    total_output_bytes: AtomicU64,
}

impl QuotaTracker {
    pub fn new(max_concurrent_ops: usize) -> Self {
        Self {
            max_concurrent_ops,
            concurrent_ops: AtomicUsize::new(0),
            total_operations: AtomicU64::new(0),
            total_input_bytes: AtomicU64::new(0),
            total_output_bytes: AtomicU64::new(0),
        }
    }

    /// Claim a concurrency slot. False when the ceiling is reached.
    pub fn acquire(&self) -> bool {
        self.concurrent_ops
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_concurrent_ops).then_some(current + 1)
            })
            .is_ok()
    }

    /// Return a slot; never drops below zero.
    pub fn release(&self) {
        let _ = self
            .concurrent_ops
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
    }

    /// Claim a slot that is released when the guard drops.
    pub fn try_guard(self: &Arc<Self>) -> Option<QuotaGuard> {
        self.acquire().then(|| QuotaGuard {
            tracker: Arc::clone(self),
        })
    }

    pub fn track_data(&self, input_bytes: u64, output_bytes: u64) {
        self.total_input_bytes.fetch_add(input_bytes, Ordering::Relaxed);
        self.total_output_bytes.fetch_add(output_bytes, Ordering::Relaxed);
        self.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn concurrent_ops(&self) -> usize {
        self.concurrent_ops.load(Ordering::Acquire)
    }

    pub fn info(&self) -> QuotaSnapshot {
        let input = self.total_input_bytes.load(Ordering::Relaxed);
        let output = self.total_output_bytes.load(Ordering::Relaxed);
        QuotaSnapshot {
            concurrent_ops: self.concurrent_ops(),
            max_concurrent_ops: self.max_concurrent_ops,
            total_operations: self.total_operations.load(Ordering::Relaxed),
            total_input_bytes: input,
            total_output_bytes: output,
            total_input_mb: round_mb(input),
            total_output_mb: round_mb(output),
        }
    }

    /// Zero the counters. In-flight operations keep their slots.
    pub fn reset(&self) {
        self.total_operations.store(0, Ordering::Relaxed);
        self.total_input_bytes.store(0, Ordering::Relaxed);
        self.total_output_bytes.store(0, Ordering::Relaxed);
    }
}

fn round_mb(bytes: u64) -> f64 {
    (bytes as f64 / MB * 100.0).round() / 100.0
}

/// A held concurrency slot.
#[derive(Debug)]
pub struct QuotaGuard {
    tracker: Arc<QuotaTracker>,
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}
