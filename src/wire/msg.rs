//! Peer message for the write-path protocols.
//!
//! # Frame format
//!
//! A message is a flat sequence of fields:
//!
//! ```text
//! +--------+----------------+----------------------+
//! | id: u8 | len: u32 (BE)  | value: len bytes     |
//! +--------+----------------+----------------------+
//! ```
//!
//! Integers are fixed-width big-endian. LAST_UPDATE_TIME is 40 bits wide
//! (5 bytes). Unknown field ids are skipped so older nodes tolerate newer
//! senders.

use crate::core::error::{KeystoneError, KeystoneResult, ResultCode};
use crate::core::time::MAX_LUT;
use crate::record::{Digest, RequestKey, DIGEST_SIZE};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Field ids. Stable wire contract: retired ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RwField {
    Op = 0,
    Result = 1,
    Namespace = 2,
    NsIndex = 3,
    Generation = 4,
    Digest = 5,
    Record = 6,
    Tid = 10,
    Info = 12,
    LastUpdateTime = 16,
    Regime = 19,
}

impl TryFrom<u8> for RwField {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Op,
            1 => Self::Result,
            2 => Self::Namespace,
            3 => Self::NsIndex,
            4 => Self::Generation,
            5 => Self::Digest,
            6 => Self::Record,
            10 => Self::Tid,
            12 => Self::Info,
            16 => Self::LastUpdateTime,
            19 => Self::Regime,
            other => return Err(other),
        })
    }
}

/// Operation codes carried in the OP field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RwOp {
    WriteAck = 2,
    Dup = 3,
    DupAck = 4,
    ReplConfirm = 5,
    ReplPing = 6,
    ReplPingAck = 7,
    ReplWrite = 8,
}

impl TryFrom<u32> for RwOp {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            2 => Self::WriteAck,
            3 => Self::Dup,
            4 => Self::DupAck,
            5 => Self::ReplConfirm,
            6 => Self::ReplPing,
            7 => Self::ReplPingAck,
            8 => Self::ReplWrite,
            other => return Err(other),
        })
    }
}

bitflags! {
    /// Bits of the INFO field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InfoFlags: u32 {
        /// Replica must not reply.
        const NO_REPL_ACK = 0x0002;
        /// Replica marks the record unreplicated until confirmed.
        const UNREPLICATED = 0x0200;
    }
}

/// Decoded peer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwMessage {
    pub op: RwOp,
    pub result: Option<ResultCode>,
    pub namespace: Option<String>,
    pub ns_index: Option<u32>,
    pub generation: Option<u16>,
    pub digest: Option<Digest>,
    /// Pickled record.
    pub record: Option<Bytes>,
    pub tid: Option<u64>,
    pub info: InfoFlags,
    pub last_update_time: Option<u64>,
    pub regime: Option<u32>,
}

impl RwMessage {
    /// Empty message of the given op.
    pub fn new(op: RwOp) -> Self {
        Self {
            op,
            result: None,
            namespace: None,
            ns_index: None,
            generation: None,
            digest: None,
            record: None,
            tid: None,
            info: InfoFlags::empty(),
            last_update_time: None,
            regime: None,
        }
    }

    /// Message addressed to a request key.
    pub fn keyed(op: RwOp, key: &RequestKey, tid: u64) -> Self {
        let mut msg = Self::new(op);
        msg.ns_index = Some(key.ns_index);
        msg.digest = Some(key.digest);
        msg.tid = Some(tid);
        msg
    }

    /// Reply to `self` with `op` and `result`, echoing the key and tid.
    pub fn reply(&self, op: RwOp, result: ResultCode) -> Self {
        let mut msg = Self::new(op);
        msg.result = Some(result);
        msg.ns_index = self.ns_index;
        msg.digest = self.digest;
        msg.tid = self.tid;
        msg
    }

    /// Request key, when both namespace index and digest are present.
    pub fn key(&self) -> KeystoneResult<RequestKey> {
        match (self.ns_index, self.digest) {
            (Some(ns_index), Some(digest)) => Ok(RequestKey::new(ns_index, digest)),
            _ => Err(KeystoneError::wire(format!(
                "{:?} message without namespace index or digest",
                self.op
            ))),
        }
    }

    /// Transaction id, required on every protocol message.
    pub fn require_tid(&self) -> KeystoneResult<u64> {
        self.tid
            .ok_or_else(|| KeystoneError::wire(format!("{:?} message without tid", self.op)))
    }

    /// Encode into a frame.
    pub fn encode(&self) -> KeystoneResult<Bytes> {
        let mut buf = BytesMut::with_capacity(64);

        put_field(&mut buf, RwField::Op, &(self.op as u32).to_be_bytes());
        if let Some(result) = self.result {
            put_field(&mut buf, RwField::Result, &result.as_u32().to_be_bytes());
        }
        if let Some(ref namespace) = self.namespace {
            put_field(&mut buf, RwField::Namespace, namespace.as_bytes());
        }
        if let Some(ns_index) = self.ns_index {
            put_field(&mut buf, RwField::NsIndex, &ns_index.to_be_bytes());
        }
        if let Some(generation) = self.generation {
            put_field(&mut buf, RwField::Generation, &generation.to_be_bytes());
        }
        if let Some(ref digest) = self.digest {
            put_field(&mut buf, RwField::Digest, digest.as_bytes());
        }
        if let Some(ref record) = self.record {
            put_field(&mut buf, RwField::Record, record);
        }
        if let Some(tid) = self.tid {
            put_field(&mut buf, RwField::Tid, &tid.to_be_bytes());
        }
        if !self.info.is_empty() {
            put_field(&mut buf, RwField::Info, &self.info.bits().to_be_bytes());
        }
        if let Some(lut) = self.last_update_time {
            put_field(&mut buf, RwField::LastUpdateTime, &encode_lut(lut)?);
        }
        if let Some(regime) = self.regime {
            put_field(&mut buf, RwField::Regime, &regime.to_be_bytes());
        }

        Ok(buf.freeze())
    }

    /// Decode a frame.
    pub fn decode(frame: &[u8]) -> KeystoneResult<Self> {
        let mut buf = frame;
        let mut op = None;
        let mut msg = Self::new(RwOp::WriteAck);

        while buf.has_remaining() {
            if buf.remaining() < 5 {
                return Err(KeystoneError::wire("truncated field header"));
            }
            let id = buf.get_u8();
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(KeystoneError::wire(format!(
                    "field {} claims {} bytes, {} remain",
                    id,
                    len,
                    buf.remaining()
                )));
            }
            let (value, rest) = buf.split_at(len);
            buf = rest;

            let Ok(field) = RwField::try_from(id) else {
                continue;
            };
            match field {
                RwField::Op => {
                    let raw = u32::from_be_bytes(fixed(field, value)?);
                    op = Some(
                        RwOp::try_from(raw)
                            .map_err(|v| KeystoneError::wire(format!("unknown op {}", v)))?,
                    );
                }
                RwField::Result => {
                    let raw = u32::from_be_bytes(fixed(field, value)?);
                    msg.result = Some(ResultCode::try_from(raw).unwrap_or(ResultCode::Unknown));
                }
                RwField::Namespace => {
                    let name = std::str::from_utf8(value)
                        .map_err(|_| KeystoneError::wire("namespace is not utf-8"))?;
                    msg.namespace = Some(name.to_string());
                }
                RwField::NsIndex => msg.ns_index = Some(u32::from_be_bytes(fixed(field, value)?)),
                RwField::Generation => {
                    msg.generation = Some(u16::from_be_bytes(fixed(field, value)?))
                }
                RwField::Digest => {
                    msg.digest = Some(Digest(fixed::<DIGEST_SIZE>(field, value)?));
                }
                RwField::Record => msg.record = Some(Bytes::copy_from_slice(value)),
                RwField::Tid => msg.tid = Some(u64::from_be_bytes(fixed(field, value)?)),
                RwField::Info => {
                    let raw = u32::from_be_bytes(fixed(field, value)?);
                    msg.info = InfoFlags::from_bits_truncate(raw);
                }
                RwField::LastUpdateTime => {
                    msg.last_update_time = Some(decode_lut(fixed(field, value)?));
                }
                RwField::Regime => msg.regime = Some(u32::from_be_bytes(fixed(field, value)?)),
            }
        }

        msg.op = op.ok_or_else(|| KeystoneError::wire("message without op"))?;
        Ok(msg)
    }
}

fn put_field(buf: &mut BytesMut, field: RwField, value: &[u8]) {
    buf.put_u8(field as u8);
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

fn fixed<const N: usize>(field: RwField, value: &[u8]) -> KeystoneResult<[u8; N]> {
    value.try_into().map_err(|_| {
        KeystoneError::wire(format!(
            "{:?} field must be {} bytes, got {}",
            field,
            N,
            value.len()
        ))
    })
}

/// Pack a LUT into 40 bits, big-endian.
pub fn encode_lut(lut: u64) -> KeystoneResult<[u8; 5]> {
    if lut > MAX_LUT {
        return Err(KeystoneError::wire(format!(
            "last update time {} exceeds 40 bits",
            lut
        )));
    }
    let be = lut.to_be_bytes();
    Ok([be[3], be[4], be[5], be[6], be[7]])
}

/// Unpack a 40-bit big-endian LUT.
pub fn decode_lut(bytes: [u8; 5]) -> u64 {
    u64::from_be_bytes([0, 0, 0, bytes[0], bytes[1], bytes[2], bytes[3], bytes[4]])
}
