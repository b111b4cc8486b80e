//! The statement log: an append-only record of tuple mutations and
//! transaction outcomes. Records are buffered in memory and flushed to disk
//! with an fsync when a transaction commits or aborts.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::{Rid, TxnId};

/// A Log Sequence Number: byte offset of the record in the log file.
pub type Lsn = u64;

/// Framing header in front of every serialized record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct LogRecordHdr {
    /// Total length of the record including this header.
    total_len: u32,
    /// CRC checksum of the serialized body.
    crc: u32,
}

const LOG_HDR_SIZE: usize = std::mem::size_of::<LogRecordHdr>();

/// A single record in the statement log.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum LogRecord {
    Begin {
        txn_id: TxnId,
    },
    Commit {
        txn_id: TxnId,
    },
    Abort {
        txn_id: TxnId,
    },
    InsertTuple {
        txn_id: TxnId,
        tab_name: String,
        rid: Rid,
        record: Vec<u8>,
    },
    UpdateTuple {
        txn_id: TxnId,
        tab_name: String,
        rid: Rid,
        old_record: Vec<u8>,
        new_record: Vec<u8>,
    },
    DeleteTuple {
        txn_id: TxnId,
        tab_name: String,
        rid: Rid,
        record: Vec<u8>,
    },
}

/// The log manager.
pub struct LogManager {
    file: File,
    buffer: Vec<u8>,
    next_lsn: Lsn,
}

impl LogManager {
    /// Opens the log file, appending after any existing records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .append(true)
            .open(path)?;
        let next_lsn = file.metadata()?.len();
        Ok(LogManager {
            file,
            buffer: Vec::new(),
            next_lsn,
        })
    }

    /// Appends a record to the in-memory buffer and returns its LSN.
    pub fn append(&mut self, record: &LogRecord) -> Result<Lsn> {
        let body = bincode::serialize(record).map_err(std::io::Error::other)?;

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let hdr = LogRecordHdr {
            total_len: (LOG_HDR_SIZE + body.len()) as u32,
            crc: hasher.finalize(),
        };

        let lsn = self.next_lsn;
        self.buffer
            .extend_from_slice(&hdr.total_len.to_le_bytes());
        self.buffer.extend_from_slice(&hdr.crc.to_le_bytes());
        self.buffer.extend_from_slice(&body);
        self.next_lsn += hdr.total_len as Lsn;
        Ok(lsn)
    }

    /// Writes every buffered record to the log file and syncs it.
    pub fn flush_to_disk(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file.write_all(&self.buffer)?;
        self.file.sync_all()?;
        self.buffer.clear();
        Ok(())
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }
}
