//! WAL record wire format: a fixed header followed by a type-specific
//! payload, each length-prefixed so the log can be scanned forward
//! without a separate index (spec §4.6/§6).

use crate::config::{Lsn, TxId};
use crate::error::{Error, Result, WalError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Begin = 0,
    Commit = 1,
    Abort = 2,
    Insert = 3,
    Update = 4,
    Delete = 5,
    Checkpoint = 6,
}

impl RecordType {
    fn from_u8(b: u8) -> Result<RecordType> {
        Ok(match b {
            0 => RecordType::Begin,
            1 => RecordType::Commit,
            2 => RecordType::Abort,
            3 => RecordType::Insert,
            4 => RecordType::Update,
            5 => RecordType::Delete,
            6 => RecordType::Checkpoint,
            _ => return Err(Error::Wal(WalError::Corrupted)),
        })
    }
}

#[derive(Debug, Clone)]
pub enum RecordPayload {
    Begin,
    Commit,
    Abort,
    Insert { key: Vec<u8>, value: Vec<u8> },
    Update { key: Vec<u8>, before: Vec<u8>, after: Vec<u8> },
    Delete { key: Vec<u8>, before: Vec<u8> },
    Checkpoint { active_tx_ids: Vec<TxId> },
}

#[derive(Debug, Clone)]
pub struct Record {
    pub lsn: Lsn,
    pub tx_id: TxId,
    pub timestamp_millis: u64,
    pub payload: RecordPayload,
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn take_bytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    if *pos + 4 > buf.len() {
        return Err(Error::Wal(WalError::Corrupted));
    }
    let len = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if *pos + len > buf.len() {
        return Err(Error::Wal(WalError::Corrupted));
    }
    let out = buf[*pos..*pos + len].to_vec();
    *pos += len;
    Ok(out)
}

impl Record {
    fn record_type(&self) -> RecordType {
        match &self.payload {
            RecordPayload::Begin => RecordType::Begin,
            RecordPayload::Commit => RecordType::Commit,
            RecordPayload::Abort => RecordType::Abort,
            RecordPayload::Insert { .. } => RecordType::Insert,
            RecordPayload::Update { .. } => RecordType::Update,
            RecordPayload::Delete { .. } => RecordType::Delete,
            RecordPayload::Checkpoint { .. } => RecordType::Checkpoint,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match &self.payload {
            RecordPayload::Begin | RecordPayload::Commit | RecordPayload::Abort => {}
            RecordPayload::Insert { key, value } => {
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, value);
            }
            RecordPayload::Update { key, before, after } => {
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, before);
                put_bytes(&mut buf, after);
            }
            RecordPayload::Delete { key, before } => {
                put_bytes(&mut buf, key);
                put_bytes(&mut buf, before);
            }
            RecordPayload::Checkpoint { active_tx_ids } => {
                buf.extend_from_slice(&(active_tx_ids.len() as u32).to_le_bytes());
                for id in active_tx_ids {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
        }
        buf
    }

    /// Serializes as `[type(1) tx_id(8) timestamp(8) data_len(4) crc32(4)][payload]`.
    /// `lsn` is not stored; it is the record's byte offset in the log and
    /// is assigned by `Wal::append` from the file position at write time.
    pub fn encode(&self) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut header = Vec::with_capacity(21 + payload.len());
        header.push(self.record_type() as u8);
        header.extend_from_slice(&self.tx_id.to_le_bytes());
        header.extend_from_slice(&self.timestamp_millis.to_le_bytes());
        header.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let crc = crc32c::crc32c_append(crc32c::crc32c(&header), &payload);
        header.extend_from_slice(&crc.to_le_bytes());
        header.extend_from_slice(&payload);
        header
    }

    pub const HEADER_LEN: usize = 1 + 8 + 8 + 4 + 4;

    /// Decode one record starting at `buf[0..]`. Returns the record and
    /// the number of bytes consumed.
    pub fn decode(buf: &[u8], lsn: Lsn) -> Result<(Record, usize)> {
        if buf.len() < Self::HEADER_LEN {
            return Err(Error::Wal(WalError::Corrupted));
        }
        let record_type = RecordType::from_u8(buf[0])?;
        let tx_id = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        let timestamp_millis = u64::from_le_bytes(buf[9..17].try_into().unwrap());
        let data_len = u32::from_le_bytes(buf[17..21].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(buf[21..25].try_into().unwrap());
        if buf.len() < Self::HEADER_LEN + data_len {
            return Err(Error::Wal(WalError::Corrupted));
        }
        let payload_bytes = &buf[Self::HEADER_LEN..Self::HEADER_LEN + data_len];
        let expected_crc = crc32c::crc32c_append(crc32c::crc32c(&buf[0..21]), payload_bytes);
        if expected_crc != crc {
            return Err(Error::Wal(WalError::Corrupted));
        }
        let mut pos = 0;
        let payload = match record_type {
            RecordType::Begin => RecordPayload::Begin,
            RecordType::Commit => RecordPayload::Commit,
            RecordType::Abort => RecordPayload::Abort,
            RecordType::Insert => {
                let key = take_bytes(payload_bytes, &mut pos)?;
                let value = take_bytes(payload_bytes, &mut pos)?;
                RecordPayload::Insert { key, value }
            }
            RecordType::Update => {
                let key = take_bytes(payload_bytes, &mut pos)?;
                let before = take_bytes(payload_bytes, &mut pos)?;
                let after = take_bytes(payload_bytes, &mut pos)?;
                RecordPayload::Update { key, before, after }
            }
            RecordType::Delete => {
                let key = take_bytes(payload_bytes, &mut pos)?;
                let before = take_bytes(payload_bytes, &mut pos)?;
                RecordPayload::Delete { key, before }
            }
            RecordType::Checkpoint => {
                if payload_bytes.len() < 4 {
                    return Err(Error::Wal(WalError::Corrupted));
                }
                let n = u32::from_le_bytes(payload_bytes[0..4].try_into().unwrap()) as usize;
                let mut ids = Vec::with_capacity(n);
                let mut p = 4;
                for _ in 0..n {
                    if p + 8 > payload_bytes.len() {
                        return Err(Error::Wal(WalError::Corrupted));
                    }
                    ids.push(TxId::from_le_bytes(payload_bytes[p..p + 8].try_into().unwrap()));
                    p += 8;
                }
                RecordPayload::Checkpoint { active_tx_ids: ids }
            }
        };
        Ok((
            Record {
                lsn,
                tx_id,
                timestamp_millis,
                payload,
            },
            Self::HEADER_LEN + data_len,
        ))
    }
}
