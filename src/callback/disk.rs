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

//! Disk-backed callback spooling.

use crate::callback::{CallbackError, CallbackStore};
use crate::invocation::Callback;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Head room below the initial sequence so failed deliveries can be
/// re-queued in front of entries that were spooled before them.
const SEQUENCE_BASE: u64 = 1_000_000;

struct DiskInner {
    /// Pending entries in FIFO order: sequence and on-disk size.
    entries: VecDeque<(u64, usize)>,
    next_sequence: u64,
    bytes: usize,
    closed: bool,
}

/// A [`CallbackStore`] persisting entries as sequenced files in a spool
/// directory.
///
/// Offers the same blocking-ceiling contract as
/// [`InMemoryCallbackStore`](crate::callback::InMemoryCallbackStore), with
/// entries surviving a restart of the waiting period: reopening the same
/// directory resumes the pending queue where it left off. This is spooling
/// for slow consumers, not a durable message log.
pub struct DiskCallbackStore {
    directory: PathBuf,
    ceiling: usize,
    inner: Mutex<DiskInner>,
    space_freed: Condvar,
}

impl DiskCallbackStore {
    /// Opens (or creates) a spool directory, resuming any pending entries.
    ///
    /// # Errors
    ///
    /// Returns a [`CallbackError::Spool`] if the directory cannot be
    /// created or scanned.
    pub fn open(directory: impl Into<PathBuf>, ceiling: usize) -> Result<Self, CallbackError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let mut entries = Vec::new();
        for entry in fs::read_dir(&directory)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(sequence) = parse_sequence(&name) else {
                continue;
            };
            let size = entry.metadata()?.len() as usize;
            entries.push((sequence, size));
        }
        entries.sort_unstable();

        let next_sequence = entries
            .last()
            .map(|(sequence, _)| sequence + 1)
            .unwrap_or(SEQUENCE_BASE);
        let bytes = entries.iter().map(|(_, size)| size).sum();
        if !entries.is_empty() {
            debug!(
                directory = %directory.display(),
                pending = entries.len(),
                "resumed callback spool"
            );
        }

        Ok(Self {
            directory,
            ceiling,
            inner: Mutex::new(DiskInner {
                entries: entries.into(),
                next_sequence,
                bytes,
                closed: false,
            }),
            space_freed: Condvar::new(),
        })
    }

    fn path_for(&self, sequence: u64) -> PathBuf {
        self.directory.join(format!("cb-{sequence:020}.json"))
    }

    fn write_entry(&self, sequence: u64, callback: &Callback) -> Result<usize, CallbackError> {
        let bytes = serde_json::to_vec(callback).map_err(|e| CallbackError::Spool {
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        fs::write(self.path_for(sequence), &bytes)?;
        Ok(bytes.len())
    }

    fn read_entry(&self, sequence: u64) -> Result<Callback, CallbackError> {
        let path = self.path_for(sequence);
        let bytes = fs::read(&path)?;
        let callback = serde_json::from_slice(&bytes).map_err(|e| CallbackError::Spool {
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;
        if let Err(e) = fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove spooled callback");
        }
        Ok(callback)
    }
}

fn parse_sequence(name: &std::ffi::OsStr) -> Option<u64> {
    let name = name.to_str()?;
    name.strip_prefix("cb-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

impl CallbackStore for DiskCallbackStore {
    fn add(&self, callback: Callback) -> Result<(), CallbackError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(CallbackError::StoreClosed);
            }
            if inner.bytes < self.ceiling || inner.entries.is_empty() {
                break;
            }
            self.space_freed.wait(&mut inner);
        }
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        let size = self.write_entry(sequence, &callback)?;
        inner.bytes += size;
        inner.entries.push_back((sequence, size));
        Ok(())
    }

    fn restore_front(&self, callback: Callback) -> Result<(), CallbackError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CallbackError::StoreClosed);
        }
        let sequence = match inner.entries.front() {
            Some((head, _)) => head.checked_sub(1).ok_or_else(|| CallbackError::Spool {
                source: io::Error::new(io::ErrorKind::Other, "spool head room exhausted"),
            })?,
            None => inner.next_sequence,
        };
        let size = self.write_entry(sequence, &callback)?;
        inner.bytes += size;
        inner.entries.push_front((sequence, size));
        Ok(())
    }

    fn take_one(&self) -> Result<Option<Callback>, CallbackError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CallbackError::StoreClosed);
        }
        match inner.entries.pop_front() {
            Some((sequence, size)) => {
                let callback = self.read_entry(sequence)?;
                inner.bytes -= size;
                self.space_freed.notify_all();
                Ok(Some(callback))
            }
            None => Ok(None),
        }
    }

    fn take_all(&self) -> Result<Vec<Callback>, CallbackError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(CallbackError::StoreClosed);
        }
        let mut drained = Vec::with_capacity(inner.entries.len());
        while let Some((sequence, _)) = inner.entries.pop_front() {
            drained.push(self.read_entry(sequence)?);
        }
        inner.bytes = 0;
        self.space_freed.notify_all();
        Ok(drained)
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn memory_used(&self) -> usize {
        self.inner.lock().bytes
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.space_freed.notify_all();
    }
}
