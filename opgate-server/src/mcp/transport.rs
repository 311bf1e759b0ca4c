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

//! MCP transport abstraction (newline-delimited stdio and in-process buffers).

use crate::mcp::handlers::McpHandler;
use crate::mcp::protocol::{JsonRpcError, JsonRpcId, JsonRpcResponse};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Channel closed")]
    ChannelClosed,
}

/// Transport abstraction for MCP JSON-RPC messages.
///
/// `recv` yields raw frames so a malformed frame can still be answered
/// with a parse error. `Ok(None)` means the peer went away.
#[async_trait::async_trait]
pub trait McpTransport: Send {
    async fn recv(&mut self) -> Result<Option<String>, TransportError>;
    async fn send(&mut self, response: JsonRpcResponse) -> Result<(), TransportError>;
}

/// One JSON message per line. A line that is not UTF-8 is answered with a
/// parse error and skipped.
pub struct LineTransport<R, W> {
    reader: R,
    writer: W,
    line: Vec<u8>,
}

impl<R, W> LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            line: Vec::new(),
        }
    }
}

pub type StdioTransport = LineTransport<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        LineTransport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

#[async_trait::async_trait]
impl<R, W> McpTransport for LineTransport<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(None);
            }
            let decoded = std::str::from_utf8(&self.line).map(|text| text.trim().to_string());
            match decoded {
                Ok(frame) => {
                    if !frame.is_empty() {
                        return Ok(Some(frame));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "frame is not valid UTF-8");
                    self.send(JsonRpcResponse::error(
                        JsonRpcId::Null,
                        JsonRpcError::parse_error(format!("Invalid UTF-8: {}", e)),
                    ))
                    .await?;
                }
            }
        }
    }

    async fn send(&mut self, response: JsonRpcResponse) -> Result<(), TransportError> {
        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Channel-backed transport for tests and in-process use.
pub struct BufferTransport {
    input: mpsc::Receiver<String>,
    output: mpsc::Sender<JsonRpcResponse>,
}

impl BufferTransport {
    pub fn new(input: mpsc::Receiver<String>, output: mpsc::Sender<JsonRpcResponse>) -> Self {
        Self { input, output }
    }
}

#[async_trait::async_trait]
impl McpTransport for BufferTransport {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.input.recv().await)
    }

    async fn send(&mut self, response: JsonRpcResponse) -> Result<(), TransportError> {
        self.output
            .send(response)
            .await
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Answer frames until the transport closes. Requests are handled one at a
/// time so responses keep request order.
pub async fn serve<T: McpTransport>(
    handler: &McpHandler,
    transport: &mut T,
    connection: &str,
) -> Result<(), TransportError> {
    info!(connection, "MCP transport session started");
    while let Some(frame) = transport.recv().await? {
        if let Some(response) = handler.handle_message(&frame, connection).await {
            transport.send(response).await?;
        } else {
            debug!(connection, "notification handled");
        }
    }
    info!(connection, "MCP transport session closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_line_transport_skips_blank_lines() {
        let input: &[u8] = b"\n{\"a\":1}\r\n\n{\"b\":2}\n";
        let mut output = Vec::new();
        let mut transport = LineTransport::new(input, &mut output);
        assert_eq!(transport.recv().await.unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(transport.recv().await.unwrap().as_deref(), Some("{\"b\":2}"));
        assert_eq!(transport.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_line_transport_answers_undecodable_line() {
        let input: &[u8] = b"\xff\xfe\n{\"a\":1}\n";
        let mut output = Vec::new();
        {
            let mut transport = LineTransport::new(input, &mut output);
            assert_eq!(transport.recv().await.unwrap().as_deref(), Some("{\"a\":1}"));
            assert_eq!(transport.recv().await.unwrap(), None);
        }
        let reply: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(reply["error"]["code"], -32700);
        assert_eq!(reply["id"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_line_transport_writes_one_line_per_response() {
        let input: &[u8] = b"";
        let mut output = Vec::new();
        {
            let mut transport = LineTransport::new(input, &mut output);
            transport
                .send(JsonRpcResponse::success(JsonRpcId::Number(1), serde_json::json!({})))
                .await
                .unwrap();
            transport
                .send(JsonRpcResponse::error(
                    JsonRpcId::Null,
                    JsonRpcError::parse_error("bad"),
                ))
                .await
                .unwrap();
        }
        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("-32700"));
    }
}
