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

//! Streaming Strategy Selection and Execution
//!
//! Large inputs are executed in one of three modes:
//!
//! - `none`: the whole input in a single engine call
//! - `chunked`: independent byte ranges, outputs concatenated in order
//! - `progress`: a single engine call bracketed by 0% and 100% events
//!
//! Chunked mode is only offered for operations whose output over a split
//! input equals their output over the whole input, given the chunk boundary
//! rule registered for that operation.

use crate::config::StreamingConfig;
use crate::engine::{DataType, OperationEngine, OperationOutput};
use crate::error::{GatewayError, Result};
use crate::value::ArgValue;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::debug;

/// How a chunk boundary may be placed for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkBoundary {
    /// Chunk lengths must be a multiple of this many bytes.
    Aligned(usize),
    /// Never split a UTF-8 character.
    Utf8,
    /// Never split a `%XX` escape.
    PercentEscape,
}

/// Byte-wise transforms that may be split.
const CHUNKABLE_OPERATIONS: &[(&str, ChunkBoundary)] = &[
    ("To Base64", ChunkBoundary::Aligned(3)),
    ("From Base64", ChunkBoundary::Aligned(4)),
    ("To Hex", ChunkBoundary::Aligned(1)),
    ("From Hex", ChunkBoundary::Aligned(2)),
    ("URL Encode", ChunkBoundary::Aligned(1)),
    ("URL Decode", ChunkBoundary::PercentEscape),
    ("To Upper case", ChunkBoundary::Utf8),
    ("To Lower case", ChunkBoundary::Utf8),
];

/// Whole-input operations that report coarse progress.
const PROGRESS_OPERATIONS: &[&str] = &[
    "AES Encrypt",
    "AES Decrypt",
    "DES Encrypt",
    "DES Decrypt",
    "Triple DES Encrypt",
    "Triple DES Decrypt",
    "Blowfish Encrypt",
    "Blowfish Decrypt",
    "RC4",
    "Gzip",
    "Gunzip",
    "Zlib Deflate",
    "Zlib Inflate",
    "Bzip2 Compress",
    "Bzip2 Decompress",
    "Zip",
    "Unzip",
    "MD5",
    "SHA1",
    "SHA2",
    "SHA3",
    "BLAKE2b",
    "BLAKE3",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStrategy {
    None,
    Chunked,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDecision {
    #[serde(rename = "type")]
    pub strategy: StreamStrategy,
    pub reason: String,
}

pub fn chunk_boundary(operation: &str) -> Option<ChunkBoundary> {
    CHUNKABLE_OPERATIONS
        .iter()
        .find(|(name, _)| *name == operation)
        .map(|(_, boundary)| *boundary)
}

pub fn supports_progress(operation: &str) -> bool {
    PROGRESS_OPERATIONS.contains(&operation)
}

pub fn determine_strategy(operation: &str, input_size: usize, threshold: usize) -> StrategyDecision {
    let (strategy, reason) = if input_size < threshold {
        (
            StreamStrategy::None,
            format!("input of {} bytes is below the {} byte threshold", input_size, threshold),
        )
    } else if chunk_boundary(operation).is_some() {
        (
            StreamStrategy::Chunked,
            format!("{} processes independent chunks", operation),
        )
    } else if supports_progress(operation) {
        (
            StreamStrategy::Progress,
            format!("{} needs the whole input; reporting progress", operation),
        )
    } else {
        (
            StreamStrategy::None,
            format!("{} does not support streaming", operation),
        )
    };
    StrategyDecision { strategy, reason }
}

/// Split `input` into chunks of at most `chunk_size` bytes, moving each cut
/// back to the nearest position `boundary` allows.
pub fn split_chunks(input: &[u8], chunk_size: usize, boundary: ChunkBoundary) -> Vec<&[u8]> {
    if input.is_empty() {
        return vec![input];
    }
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut rest = input;
    while !rest.is_empty() {
        let end = if rest.len() <= chunk_size {
            rest.len()
        } else {
            adjust_cut(rest, chunk_size, boundary)
        };
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

fn adjust_cut(data: &[u8], size: usize, boundary: ChunkBoundary) -> usize {
    let cut = match boundary {
        ChunkBoundary::Aligned(n) => size - size % n.max(1),
        ChunkBoundary::Utf8 => {
            let mut end = size;
            while end > 0 && is_continuation(data[end]) {
                end -= 1;
            }
            if end == 0 {
                // chunk smaller than one character: extend to its end
                end = size;
                while end < data.len() && is_continuation(data[end]) {
                    end += 1;
                }
            }
            end
        }
        ChunkBoundary::PercentEscape => {
            let start = size.saturating_sub(2);
            match data[start..size].iter().position(|b| *b == b'%') {
                Some(pos) => start + pos,
                None => size,
            }
        }
    };
    // a chunk size smaller than the boundary unit still has to make progress
    if cut == 0 {
        match boundary {
            ChunkBoundary::Aligned(n) => n.min(data.len()),
            ChunkBoundary::PercentEscape => size.max(3).min(data.len()),
            ChunkBoundary::Utf8 => size,
        }
    } else {
        cut
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Events produced while an operation streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Initial {
        strategy: StreamStrategy,
        total_bytes: usize,
        chunks: usize,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        processed_bytes: usize,
        total_bytes: usize,
        percent: f64,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        output: OperationOutput,
        total_bytes: usize,
        duration_ms: u64,
    },
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

/// Runs operations under a streaming strategy.
///
/// Each engine call holds one of `permits` for as long as it really runs,
/// including after its caller gave up on it.
#[derive(Clone)]
pub struct StreamingExecutor {
    engine: Arc<dyn OperationEngine>,
    permits: Arc<Semaphore>,
    chunk_size: usize,
    progress_interval: usize,
}

impl StreamingExecutor {
    pub fn new(
        engine: Arc<dyn OperationEngine>,
        config: &StreamingConfig,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            engine,
            permits,
            chunk_size: config.chunk_size,
            progress_interval: config.progress_interval,
        }
    }

    pub fn run(
        &self,
        operation: String,
        input: Arc<[u8]>,
        args: Vec<ArgValue>,
        strategy: StreamStrategy,
    ) -> EventStream {
        match (strategy, chunk_boundary(&operation)) {
            (StreamStrategy::Chunked, Some(boundary)) => {
                self.chunked(operation, input, args, boundary)
            }
            (StreamStrategy::Progress, _) => self.whole(operation, input, args, true),
            _ => self.whole(operation, input, args, false),
        }
    }

    fn chunked(
        &self,
        operation: String,
        input: Arc<[u8]>,
        args: Vec<ArgValue>,
        boundary: ChunkBoundary,
    ) -> EventStream {
        let engine = self.engine.clone();
        let permits = self.permits.clone();
        let chunk_size = self.chunk_size;
        let progress_interval = self.progress_interval.max(1);

        let stream = async_stream::stream! {
            let started = Instant::now();
            let total = input.len();
            let ranges: Vec<(usize, usize)> = {
                let mut offset = 0;
                split_chunks(&input, chunk_size, boundary)
                    .into_iter()
                    .map(|chunk| {
                        let range = (offset, offset + chunk.len());
                        offset += chunk.len();
                        range
                    })
                    .collect()
            };
            let count = ranges.len();
            yield Ok(StreamEvent::Initial {
                strategy: StreamStrategy::Chunked,
                total_bytes: total,
                chunks: count,
            });

            let mut value = Vec::new();
            let mut data_type = None;
            let mut processed = 0;
            let mut last_reported = 0;

            for (index, (start, end)) in ranges.into_iter().enumerate() {
                let chunk = input[start..end].to_vec();
                let output = match run_blocking(engine.clone(), &permits, operation.clone(), chunk, args.clone()).await {
                    Ok(output) => output,
                    Err(err) => {
                        yield Err(err.with_context("chunk", index).with_context("offset", start));
                        return;
                    }
                };
                data_type.get_or_insert(output.data_type);
                value.extend_from_slice(&output.value);
                processed = end;

                let last = index + 1 == count;
                if last || processed - last_reported >= progress_interval {
                    last_reported = processed;
                    debug!(operation = %operation, processed, total, "chunk progress");
                    yield Ok(StreamEvent::Progress {
                        processed_bytes: processed,
                        total_bytes: total,
                        percent: percent(processed, total),
                    });
                }
            }

            yield Ok(StreamEvent::Complete {
                output: OperationOutput {
                    value,
                    data_type: data_type.unwrap_or(DataType::String),
                },
                total_bytes: total,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        };
        Box::pin(stream)
    }

    fn whole(
        &self,
        operation: String,
        input: Arc<[u8]>,
        args: Vec<ArgValue>,
        report_progress: bool,
    ) -> EventStream {
        let engine = self.engine.clone();
        let permits = self.permits.clone();

        let stream = async_stream::stream! {
            let started = Instant::now();
            let total = input.len();
            let strategy = if report_progress {
                StreamStrategy::Progress
            } else {
                StreamStrategy::None
            };
            yield Ok(StreamEvent::Initial { strategy, total_bytes: total, chunks: 1 });

            if report_progress {
                yield Ok(StreamEvent::Progress { processed_bytes: 0, total_bytes: total, percent: 0.0 });
            }

            let output = match run_blocking(engine, &permits, operation, input.to_vec(), args).await {
                Ok(output) => output,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            if report_progress {
                yield Ok(StreamEvent::Progress { processed_bytes: total, total_bytes: total, percent: 100.0 });
            }

            yield Ok(StreamEvent::Complete {
                output,
                total_bytes: total,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        };
        Box::pin(stream)
    }
}

/// Drain a stream, returning the completed output.
pub async fn collect_output(mut events: EventStream) -> Result<OperationOutput> {
    while let Some(event) = events.next().await {
        if let StreamEvent::Complete { output, .. } = event? {
            return Ok(output);
        }
    }
    Err(GatewayError::streaming("stream ended without a result"))
}

async fn run_blocking(
    engine: Arc<dyn OperationEngine>,
    permits: &Arc<Semaphore>,
    operation: String,
    input: Vec<u8>,
    args: Vec<ArgValue>,
) -> Result<OperationOutput> {
    let permit = permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| GatewayError::operation_failed("worker pool is shut down"))?;
    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        engine
            .execute(&operation, &input, &args)
            .map_err(|e| GatewayError::from(e).with_context("operation", &operation))
    })
    .await
    .map_err(|e| GatewayError::streaming(format!("streaming task failed: {}", e)))?
}

fn percent(processed: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        (processed as f64 / total as f64 * 10_000.0).round() / 100.0
    }
}
