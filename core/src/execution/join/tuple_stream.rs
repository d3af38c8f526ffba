// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Buffered stream of record batches owned by one partition side.
//!
//! A *pinned* stream holds its batches in memory, accounted against the
//! operator's memory reservation; a failed reservation on append is the
//! needs-spill signal. An *unpinned* stream writes batches through to an
//! Arrow IPC scratch file and can be re-read with a restartable forward
//! cursor or pinned back into memory.
//!
//! The scratch file goes through three stages, all managed by the stream:
//! absent, open for appends (`scratch_writer` live), and sealed for reading
//! (`scratch_file` only). Appends after sealing are a programming error.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::execution::disk_manager::{DiskManager, RefCountedTempFile};
use datafusion::execution::memory_pool::MemoryReservation;

use super::SPILL_IO_BUFFER_SIZE;

/// Append-only, optionally-pinned sequence of record batches.
pub(crate) struct BufferedBatchStream {
    schema: SchemaRef,
    /// Label for scratch files, e.g. "hash join build".
    desc: &'static str,
    disk_manager: Arc<DiskManager>,
    pinned: bool,
    /// In-memory batches; non-empty only while pinned.
    batches: Vec<RecordBatch>,
    /// Bytes accounted against the reservation for `batches`.
    mem_bytes: usize,
    /// IPC writer over `scratch_file` while the stream accepts unpinned
    /// appends. Dropped (after `finish`) once the stream is sealed.
    scratch_writer: Option<StreamWriter<BufWriter<File>>>,
    /// Handle keeping the scratch file alive; present whenever any rows live
    /// on disk.
    scratch_file: Option<Arc<RefCountedTempFile>>,
    spilled_bytes: usize,
    num_rows: usize,
}

impl BufferedBatchStream {
    pub fn new_pinned(
        schema: SchemaRef,
        desc: &'static str,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        Self {
            schema,
            desc,
            disk_manager,
            pinned: true,
            batches: Vec::new(),
            mem_bytes: 0,
            scratch_writer: None,
            scratch_file: None,
            spilled_bytes: 0,
            num_rows: 0,
        }
    }

    /// A stream that spills from the first append. Used for the probe rows
    /// of a spilled partition, which never transit through memory.
    pub fn new_unpinned(
        schema: SchemaRef,
        desc: &'static str,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut stream = Self::new_pinned(schema, desc, disk_manager);
        stream.pinned = false;
        stream
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Total bytes held by this stream, in memory and on scratch disk.
    pub fn bytes(&self) -> usize {
        self.mem_bytes + self.spilled_bytes
    }

    /// Bytes that unpinning this stream would release.
    pub fn pinned_bytes(&self) -> usize {
        self.mem_bytes
    }

    /// The scratch file exists and its writer has been finished: the stream
    /// is readable but no longer writable.
    fn is_sealed(&self) -> bool {
        self.scratch_writer.is_none() && self.scratch_file.is_some()
    }

    /// Append a batch accounted at `bytes`. Returns `false` without
    /// appending when the reservation cannot grow (needs-spill); the caller
    /// spills a partition and retries. Unpinned streams write through to
    /// scratch and always succeed.
    pub fn try_append(
        &mut self,
        batch: &RecordBatch,
        bytes: usize,
        reservation: &mut MemoryReservation,
    ) -> DFResult<bool> {
        debug_assert!(!self.is_sealed(), "append to a sealed stream");
        if batch.num_rows() == 0 {
            return Ok(true);
        }
        if self.pinned {
            if reservation.try_grow(bytes).is_err() {
                return Ok(false);
            }
            self.mem_bytes += bytes;
            self.num_rows += batch.num_rows();
            self.batches.push(batch.clone());
        } else {
            self.open_scratch_writer()?.write(batch)?;
            self.spilled_bytes += bytes;
            self.num_rows += batch.num_rows();
        }
        Ok(true)
    }

    /// Flush all in-memory batches to scratch and release their memory.
    /// Returns the number of bytes released.
    pub fn unpin(&mut self, reservation: &mut MemoryReservation) -> DFResult<usize> {
        if !self.pinned {
            return Ok(0);
        }
        self.pinned = false;
        if !self.batches.is_empty() {
            let batches = std::mem::take(&mut self.batches);
            let writer = self.open_scratch_writer()?;
            for batch in &batches {
                writer.write(batch)?;
            }
        }
        let freed = self.mem_bytes;
        self.spilled_bytes += freed;
        self.mem_bytes = 0;
        reservation.shrink(freed);
        Ok(freed)
    }

    /// Load the stream back into memory under the reservation. Returns
    /// `false` when the reservation cannot grow by the spilled size; the
    /// stream then stays unpinned and readable.
    pub fn pin(&mut self, reservation: &mut MemoryReservation) -> DFResult<bool> {
        if self.pinned {
            return Ok(true);
        }
        self.seal_scratch()?;
        let bytes = self.spilled_bytes;
        if reservation.try_grow(bytes).is_err() {
            return Ok(false);
        }
        if let Some(file) = self.scratch_file.take() {
            match read_back(&file) {
                Ok(batches) => self.batches = batches,
                Err(e) => {
                    reservation.shrink(bytes);
                    return Err(e);
                }
            }
        }
        self.mem_bytes = bytes;
        self.spilled_bytes = 0;
        self.pinned = true;
        Ok(true)
    }

    /// Restartable forward cursor over the stream's batches.
    pub fn read(&mut self) -> DFResult<BatchCursor> {
        if self.pinned {
            return Ok(BatchCursor::Mem {
                batches: self.batches.clone().into_iter(),
            });
        }
        self.seal_scratch()?;
        match &self.scratch_file {
            Some(file) => BatchCursor::over_scratch(file),
            None => Ok(BatchCursor::Empty),
        }
    }

    /// Hand the in-memory batches (and their reservation accounting) to the
    /// caller, leaving an empty pinned stream. Used when the hash table takes
    /// ownership of the build rows.
    pub fn take_batches(&mut self) -> (Vec<RecordBatch>, usize) {
        debug_assert!(self.pinned, "taking batches from an unpinned stream");
        let bytes = self.mem_bytes;
        self.mem_bytes = 0;
        self.num_rows = 0;
        (std::mem::take(&mut self.batches), bytes)
    }

    /// Inverse of [`Self::take_batches`], for a failed hash-table build.
    pub fn restore_batches(&mut self, batches: Vec<RecordBatch>, bytes: usize) {
        debug_assert!(self.batches.is_empty());
        self.num_rows = batches.iter().map(|b| b.num_rows()).sum();
        self.mem_bytes = bytes;
        self.batches = batches;
    }

    /// Release everything this stream holds. Idempotent; the scratch file is
    /// deleted when the last reference drops.
    pub fn close(&mut self, reservation: &mut MemoryReservation) {
        reservation.shrink(self.mem_bytes);
        self.mem_bytes = 0;
        self.spilled_bytes = 0;
        self.num_rows = 0;
        self.batches.clear();
        self.scratch_writer = None;
        self.scratch_file = None;
    }

    /// The open IPC writer, creating the scratch file and writer on first
    /// use. LZ4 frames over a large write buffer; the default 8 KB buffer is
    /// far too small for multi-GB scratch files.
    fn open_scratch_writer(&mut self) -> DFResult<&mut StreamWriter<BufWriter<File>>> {
        if self.scratch_writer.is_none() {
            let file = self.disk_manager.create_tmp_file(self.desc)?;
            let handle = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(file.path())
                .map_err(|e| {
                    DataFusionError::Execution(format!(
                        "cannot create {} scratch file: {e}",
                        self.desc
                    ))
                })?;
            let options = IpcWriteOptions::default()
                .try_with_compression(Some(CompressionType::LZ4_FRAME))?;
            self.scratch_writer = Some(StreamWriter::try_new_with_options(
                BufWriter::with_capacity(SPILL_IO_BUFFER_SIZE, handle),
                &self.schema,
                options,
            )?);
            self.scratch_file = Some(Arc::new(file));
        }
        Ok(self
            .scratch_writer
            .as_mut()
            .expect("scratch writer just created"))
    }

    /// Finish the IPC footer so the scratch file can be read back. A no-op
    /// when nothing was spilled or the stream is already sealed.
    fn seal_scratch(&mut self) -> DFResult<()> {
        if let Some(mut writer) = self.scratch_writer.take() {
            writer.finish()?;
        }
        Ok(())
    }
}

/// Forward cursor over a stream's batches, from memory or from a sealed
/// scratch file.
pub(crate) enum BatchCursor {
    Empty,
    Mem {
        batches: std::vec::IntoIter<RecordBatch>,
    },
    Disk {
        reader: StreamReader<BufReader<File>>,
        /// Keeps the scratch file alive while the reader is open.
        _file: Arc<RefCountedTempFile>,
    },
}

impl BatchCursor {
    fn over_scratch(file: &Arc<RefCountedTempFile>) -> DFResult<Self> {
        let handle = File::open(file.path()).map_err(|e| {
            DataFusionError::Execution(format!("cannot reopen join scratch file: {e}"))
        })?;
        let reader =
            StreamReader::try_new(BufReader::with_capacity(SPILL_IO_BUFFER_SIZE, handle), None)?;
        Ok(BatchCursor::Disk {
            reader,
            _file: file.clone(),
        })
    }

    pub fn next_batch(&mut self) -> DFResult<Option<RecordBatch>> {
        match self {
            BatchCursor::Empty => Ok(None),
            BatchCursor::Mem { batches } => Ok(batches.next()),
            BatchCursor::Disk { reader, .. } => match reader.next() {
                Some(batch) => Ok(Some(
                    batch.map_err(|e| DataFusionError::ArrowError(Box::new(e), None))?,
                )),
                None => Ok(None),
            },
        }
    }
}

/// Drain a sealed scratch file into memory through the same cursor the
/// readers use. Serves [`BufferedBatchStream::pin`].
fn read_back(file: &Arc<RefCountedTempFile>) -> DFResult<Vec<RecordBatch>> {
    let mut cursor = BatchCursor::over_scratch(file)?;
    let mut batches = Vec::new();
    while let Some(batch) = cursor.next_batch()? {
        batches.push(batch);
    }
    Ok(batches)
}
