//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Pooled per-connection workers.
//!
//! A worker is a long-lived thread with a persistent identity. It serves one
//! connection at a time (read a framed invocation, dispatch, write the
//! framed response, repeat until the connection closes), then returns itself
//! to the free list for reuse by the next accepted connection. Unclaimed
//! workers evict themselves after the configured idle timeout, shrinking the
//! pool back toward zero when traffic subsides.

use crate::invocation::WireMessage;
use crate::server::ServerCore;
use crate::transport::{peer_alive, ConnectionId};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::io;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace, warn};

/// Persistent identity of one pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

impl WorkerId {
    /// Creates the next process-unique worker identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The identity as a raw integer.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Work handed to a worker over its command channel.
pub(crate) enum WorkerCommand {
    /// Serve one accepted connection until it closes.
    Serve {
        /// The accepted stream.
        stream: TcpStream,
        /// Identity under which the connection sits in the busy pool.
        connection_id: ConnectionId,
    },
    /// Terminate the worker thread.
    Shutdown,
}

/// Shared handle to a worker: its identity plus the sending half of its
/// command channel. This is what the free list stores.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    pub(crate) commands: Sender<WorkerCommand>,
}

/// Spawns a fresh worker thread and returns its handle.
///
/// The channel is bounded at one: a worker ever only has one assignment in
/// flight, and a second send would mean the busy-pool bookkeeping is wrong.
pub(crate) fn spawn_worker(core: Arc<ServerCore>) -> WorkerHandle {
    let id = WorkerId::next();
    let (commands, inbox) = bounded(1);
    let handle = WorkerHandle {
        id,
        commands: commands.clone(),
    };
    let thread_handle = handle.clone();
    thread::Builder::new()
        .name(format!("{id}"))
        .spawn(move || run(core, thread_handle, inbox))
        .expect("failed to spawn worker thread");
    debug!(worker = %id, "worker spawned");
    handle
}

fn run(core: Arc<ServerCore>, handle: WorkerHandle, inbox: Receiver<WorkerCommand>) {
    let id = handle.id;
    loop {
        let command = match core.idle_timeout() {
            Some(idle) => match inbox.recv_timeout(idle) {
                Ok(command) => command,
                Err(RecvTimeoutError::Timeout) => {
                    // Only exit if we can still remove ourselves: a None here
                    // means the accept thread claimed us concurrently and a
                    // Serve command is already on its way.
                    if core.free_list().remove(&id).is_some() {
                        debug!(worker = %id, "idle worker evicted");
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match inbox.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };

        match command {
            WorkerCommand::Serve {
                stream,
                connection_id,
            } => {
                serve_connection(&core, id, stream, connection_id);
                // Persist: return to the free list for reuse by the next
                // connection rather than terminating. Ordering matters: the
                // accept thread parked on the busy pool must find this
                // worker pooled by the time the slot frees.
                let mut exit = !core.is_running();
                if !exit {
                    match core.free_list().insert(id, handle.clone()) {
                        Ok(Some((evicted_id, evicted))) => {
                            trace!(worker = %evicted_id, "free list full, shutting down coldest worker");
                            let _ = evicted.commands.send(WorkerCommand::Shutdown);
                        }
                        Ok(None) => {}
                        Err(_) => exit = true,
                    }
                }
                core.busy_pool().remove(&connection_id);
                if exit {
                    break;
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    trace!(worker = %id, "worker terminated");
}

/// Serves framed invocations on one connection until it closes, errors, or
/// times out.
fn serve_connection(
    core: &Arc<ServerCore>,
    worker: WorkerId,
    stream: TcpStream,
    connection_id: ConnectionId,
) {
    let mut stream = stream;
    if let Err(error) = prepare_stream(core, &stream) {
        warn!(worker = %worker, %connection_id, %error, "failed to configure accepted stream");
        return;
    }
    core.register_active(connection_id, &stream);
    trace!(worker = %worker, %connection_id, "serving connection");

    loop {
        let message = match core.unmarshaller().read_message(&mut stream) {
            Ok(message) => message,
            Err(error) => {
                log_connection_end(worker, connection_id, &error);
                break;
            }
        };
        let request = match message {
            WireMessage::Request(request) => request,
            WireMessage::Response(_) => {
                warn!(worker = %worker, %connection_id, "unexpected response frame, dropping connection");
                break;
            }
        };

        let expects_response = request.operation.expects_response();
        let response = core.dispatch(request);

        if expects_response {
            if let Err(error) = core
                .marshaller()
                .write_message(&WireMessage::Response(response), &mut stream)
            {
                debug!(worker = %worker, %connection_id, %error, "failed to write response");
                break;
            }
        }

        // Optional probe for a half-closed peer before committing to the
        // next blocking read.
        if core.check_connection() && !peer_alive(&stream) {
            debug!(worker = %worker, %connection_id, "peer gone, closing connection");
            break;
        }
    }

    core.unregister_active(&connection_id);
    // Socket closes on drop; a connection that failed mid-exchange is
    // discarded, never reused.
}

fn prepare_stream(core: &ServerCore, stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(core.timeout()))?;
    stream.set_write_timeout(Some(core.timeout()))?;
    Ok(())
}

fn log_connection_end(
    worker: WorkerId,
    connection_id: ConnectionId,
    error: &crate::marshal::MarshalError,
) {
    match error.io_kind() {
        Some(io::ErrorKind::UnexpectedEof) | Some(io::ErrorKind::ConnectionReset) => {
            trace!(worker = %worker, %connection_id, "connection closed by peer");
        }
        Some(io::ErrorKind::WouldBlock) | Some(io::ErrorKind::TimedOut) => {
            debug!(worker = %worker, %connection_id, "connection idle past read timeout, closing");
        }
        _ => {
            debug!(worker = %worker, %connection_id, %error, "connection ended");
        }
    }
}
