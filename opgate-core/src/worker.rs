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

//! Worker dispatcher for CPU-intensive operations.
//!
//! Jobs run on the runtime's blocking pool, gated by a semaphore of
//! `max_threads` permits. A permit is held until the job really finishes, so an
//! abandoned (timed out) job still counts against the bound. The same
//! semaphore gates the streaming executor, so `max_threads` bounds every
//! engine call in flight and the rest of the blocking pool stays free for
//! file and stdio I/O.

use crate::config::WorkerConfig;
use crate::engine::{self, OperationEngine, OperationOutput, OperationStep};
use crate::error::{GatewayError, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const CPU_INTENSIVE_OPERATIONS: &[&str] = &[
    // ciphers
    "AES Encrypt",
    "AES Decrypt",
    "DES Encrypt",
    "DES Decrypt",
    "Triple DES Encrypt",
    "Triple DES Decrypt",
    "Blowfish Encrypt",
    "Blowfish Decrypt",
    "RC4",
    "RSA Encrypt",
    "RSA Decrypt",
    "RSA Sign",
    "RSA Verify",
    // password hashing
    "Bcrypt",
    "Scrypt",
    "Derive PBKDF2 key",
    "Argon2",
    // digests and checksums
    "MD5",
    "SHA1",
    "SHA2",
    "SHA3",
    "BLAKE2b",
    "BLAKE3",
    "CRC32 Checksum",
    // archive codecs
    "Gzip",
    "Gunzip",
    "Zlib Deflate",
    "Zlib Inflate",
    "Bzip2 Compress",
    "Bzip2 Decompress",
    "Zip",
    "Unzip",
    // key generation
    "Generate RSA Key Pair",
    "Generate PGP Key Pair",
];

pub fn is_cpu_intensive(operation: &str) -> bool {
    CPU_INTENSIVE_OPERATIONS.contains(&operation)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub initialized: bool,
    pub max_threads: usize,
    pub busy: usize,
    pub completed: u64,
    pub timed_out: u64,
}

pub struct WorkerDispatcher {
    engine: Arc<dyn OperationEngine>,
    permits: Arc<Semaphore>,
    enabled: bool,
    min_threads: usize,
    max_threads: usize,
    min_input_size: usize,
    initialized: AtomicBool,
    completed: Arc<AtomicU64>,
    timed_out: AtomicU64,
}

impl WorkerDispatcher {
    pub fn new(engine: Arc<dyn OperationEngine>, config: &WorkerConfig) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(config.max_threads)),
            enabled: config.enabled,
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            min_input_size: config.min_input_size,
            initialized: AtomicBool::new(false),
            completed: Arc::new(AtomicU64::new(0)),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Start `min_threads` blocking threads so the first jobs do not pay for
    /// thread creation. No-op when disabled or already initialized.
    pub async fn initialize(&self) -> Result<()> {
        if !self.enabled || self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let warm = self.min_threads.min(self.max_threads);
        if warm > 0 {
            let barrier = Arc::new(Barrier::new(warm));
            let handles: Vec<_> = (0..warm)
                .map(|_| {
                    let barrier = barrier.clone();
                    tokio::task::spawn_blocking(move || {
                        barrier.wait();
                    })
                })
                .collect();
            for handle in handles {
                handle
                    .await
                    .map_err(|e| GatewayError::operation_failed(format!("worker warm-up failed: {}", e)))?;
            }
        }

        self.initialized.store(true, Ordering::Release);
        info!(
            min_threads = self.min_threads,
            max_threads = self.max_threads,
            "worker pool initialized"
        );
        Ok(())
    }

    /// Permits shared by every engine call.
    pub fn permits(&self) -> Arc<Semaphore> {
        self.permits.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn should_use_worker(&self, operation: &str, input_size: usize) -> bool {
        self.is_initialized() && input_size > self.min_input_size && is_cpu_intensive(operation)
    }

    /// Bake `steps` over `input` on a worker. On timeout the job is abandoned,
    /// not killed; it keeps its permit until it returns.
    pub async fn execute_in_worker(
        &self,
        steps: Vec<OperationStep>,
        input: Vec<u8>,
        timeout: Duration,
    ) -> Result<OperationOutput> {
        if !self.is_initialized() {
            return Err(GatewayError::operation_failed("worker pool is not initialized"));
        }

        let engine = self.engine.clone();
        let permits = self.permits.clone();
        let completed = self.completed.clone();
        let job = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|_| GatewayError::operation_failed("worker pool is shut down"))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let result = engine::bake(engine.as_ref(), &steps, &input);
                completed.fetch_add(1, Ordering::Relaxed);
                result
            })
            .await
            .map_err(|e| GatewayError::operation_failed(format!("worker job failed: {}", e)))?
        };

        match tokio::time::timeout(timeout, job).await {
            Ok(result) => {
                debug!(ok = result.is_ok(), "worker job finished");
                result
            }
            Err(_) => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(timeout_ms = timeout.as_millis() as u64, "worker job timed out");
                Err(GatewayError::timeout(format!(
                    "Worker timed out after {}ms",
                    timeout.as_millis()
                ))
                .with_context("timeoutMs", timeout.as_millis()))
            }
        }
    }

    /// Refuse new jobs. Running jobs finish on their own.
    pub fn shutdown(&self) {
        self.initialized.store(false, Ordering::Release);
        self.permits.close();
        info!("worker pool shut down");
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            initialized: self.is_initialized(),
            max_threads: self.max_threads,
            busy: self.max_threads.saturating_sub(self.permits.available_permits()),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{BuiltinEngine, EngineError};
    use crate::error::ErrorKind;
    use crate::value::ArgValue;

    struct SlowEngine;

    impl OperationEngine for SlowEngine {
        fn execute(
            &self,
            _operation: &str,
            input: &[u8],
            _args: &[ArgValue],
        ) -> std::result::Result<OperationOutput, EngineError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(OperationOutput::bytes(input.to_vec()))
        }

        fn operations(&self) -> Vec<crate::engine::OperationDescriptor> {
            BuiltinEngine::new().operations()
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            enabled: true,
            min_threads: 2,
            max_threads: 2,
            idle_timeout_ms: 1000,
            min_input_size: 16,
        }
    }

    #[tokio::test]
    async fn test_should_use_worker_requires_initialization() {
        let dispatcher = WorkerDispatcher::new(Arc::new(BuiltinEngine::new()), &config());
        assert!(!dispatcher.should_use_worker("SHA2", 1024));

        dispatcher.initialize().await.unwrap();
        assert!(dispatcher.should_use_worker("SHA2", 1024));
        assert!(!dispatcher.should_use_worker("SHA2", 8));
        assert!(!dispatcher.should_use_worker("To Hex", 1024));
    }

    #[tokio::test]
    async fn test_executes_steps_on_worker() {
        let dispatcher = WorkerDispatcher::new(Arc::new(BuiltinEngine::new()), &config());
        dispatcher.initialize().await.unwrap();

        let steps = vec![OperationStep::new("Gzip"), OperationStep::new("Gunzip")];
        let output = dispatcher
            .execute_in_worker(steps, b"round trip".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(output.value, b"round trip");
        assert_eq!(dispatcher.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_timeout_abandons_job() {
        let dispatcher = WorkerDispatcher::new(Arc::new(SlowEngine), &config());
        dispatcher.initialize().await.unwrap();

        let err = dispatcher
            .execute_in_worker(
                vec![OperationStep::new("SHA2")],
                vec![0; 32],
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(dispatcher.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_jobs() {
        let dispatcher = WorkerDispatcher::new(Arc::new(BuiltinEngine::new()), &config());
        dispatcher.initialize().await.unwrap();
        dispatcher.shutdown();
        assert!(dispatcher
            .execute_in_worker(vec![], vec![], Duration::from_secs(1))
            .await
            .is_err());
    }
}
