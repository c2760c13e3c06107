// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Process-style facade: the agent behind an in-process stdin/stdout pair.
//!
//! An embedding host that already knows how to talk to a child process over
//! line-delimited JSON can use this adapter unchanged: write lines in, read
//! lines out, `kill` to tear everything down.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::Mutex as AsyncMutex;

use otto_core::Query;

use crate::{line::LineTransport, router::Router};

const PIPE_CAPACITY: usize = 64 * 1024;

pub struct ProcessAdapter {
    stdin: AsyncMutex<Option<WriteHalf<DuplexStream>>>,
    stdout: AsyncMutex<Option<BufReader<ReadHalf<DuplexStream>>>>,
    query: Arc<Query>,
}

impl ProcessAdapter {
    /// Wire a query to a fresh pipe pair and start the router over a
    /// line-delimited transport.
    pub fn attach(query: Arc<Query>) -> Self {
        // host → agent
        let (host_in, agent_in) = tokio::io::duplex(PIPE_CAPACITY);
        // agent → host
        let (agent_out, host_out) = tokio::io::duplex(PIPE_CAPACITY);

        let (agent_read, _agent_in_unused) = tokio::io::split(agent_in);
        let (_agent_out_unused, agent_write) = tokio::io::split(agent_out);
        let transport = Arc::new(LineTransport::new(agent_read, agent_write));
        tokio::spawn(Router::run(transport, Arc::clone(&query)));

        let (host_read, _host_out_unused) = tokio::io::split(host_out);
        let (_host_in_unused, host_write) = tokio::io::split(host_in);

        Self {
            stdin: AsyncMutex::new(Some(host_write)),
            stdout: AsyncMutex::new(Some(BufReader::new(host_read))),
            query,
        }
    }

    /// Write one line to the agent's "stdin".
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "process killed",
            ));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    /// Read one line from the agent's "stdout"; `None` on EOF or kill.
    pub async fn read_line(&self) -> Option<String> {
        let mut guard = self.stdout.lock().await;
        let stdout = guard.as_mut()?;
        let mut line = String::new();
        match stdout.read_line(&mut line).await {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches('\n').to_string()),
        }
    }

    /// Cancel the loop and close both pipes, unblocking any waiter.
    pub async fn kill(&self) {
        self.query.interrupt();
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        self.stdout.lock().await.take();
    }
}
