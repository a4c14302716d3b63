//! Tagged msgpack envelopes exchanged between the supervisor and the task
//! executor child.
//!
//! Every envelope is a msgpack 2-array `[type_tag, body]`. Argument and
//! result bodies are arrays of opaque msgpack fragments; the fragments are
//! user values this crate never interprets, so the decoder splits them by
//! walking the msgpack format rather than deserializing them.

use rmp::Marker;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FunctionInvokeError;

const REQUEST_ARGUMENTS: u8 = 1;
const REQUEST_RESUME: u8 = 2;

const RESPONSE_RESULT: u8 = 1;
const RESPONSE_ERROR: u8 = 2;
const RESPONSE_BLOCK: u8 = 3;
const RESPONSE_READY: u8 = 4;
const RESPONSE_CANCEL: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated message")]
    Truncated,
    #[error("invalid message: {0}")]
    Invalid(String),
}

impl From<rmp_serde::encode::Error> for CodecError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CodecError::Invalid(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CodecError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CodecError::Invalid(err.to_string())
    }
}

/// Serializes one user value into an opaque msgpack fragment.
pub fn pack_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Deserializes one user value from an opaque msgpack fragment.
pub fn unpack_value<T: DeserializeOwned>(buf: &[u8]) -> Result<T, CodecError> {
    Ok(rmp_serde::from_slice(buf)?)
}

/// Supervisor-to-child envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorRequest {
    /// Positional argument fragments for the function call.
    Arguments(Vec<Vec<u8>>),
    /// Reserved for cooperative suspension.
    Resume,
}

impl ExecutorRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_array_len(&mut buf, 2);
        match self {
            ExecutorRequest::Arguments(args) => {
                write_uint(&mut buf, u64::from(REQUEST_ARGUMENTS));
                write_fragments(&mut buf, args);
            }
            ExecutorRequest::Resume => {
                write_uint(&mut buf, u64::from(REQUEST_RESUME));
                buf.push(Marker::Null.to_u8());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(buf);
        cursor.read_envelope_header()?;
        let tag = cursor.read_uint()?;
        match u8::try_from(tag) {
            Ok(REQUEST_ARGUMENTS) => Ok(ExecutorRequest::Arguments(cursor.read_fragments()?)),
            Ok(REQUEST_RESUME) => Ok(ExecutorRequest::Resume),
            _ => Err(CodecError::Invalid(format!("unknown request tag {tag}"))),
        }
    }
}

/// Child-to-supervisor envelope. Only `Result`, `Error`, and `Cancel` are
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorResponse {
    /// One fragment per output position.
    Result(Vec<Vec<u8>>),
    Error(FunctionInvokeError, String),
    /// Reserved for cooperative suspension.
    Block,
    /// Reserved for cooperative suspension.
    Ready,
    /// The child acknowledged a cancel or aborted itself.
    Cancel(String),
}

impl ExecutorResponse {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorResponse::Result(_) | ExecutorResponse::Error(..) | ExecutorResponse::Cancel(_)
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_array_len(&mut buf, 2);
        match self {
            ExecutorResponse::Result(outputs) => {
                write_uint(&mut buf, u64::from(RESPONSE_RESULT));
                write_fragments(&mut buf, outputs);
            }
            ExecutorResponse::Error(code, message) => {
                write_uint(&mut buf, u64::from(RESPONSE_ERROR));
                write_array_len(&mut buf, 2);
                write_uint(&mut buf, u64::from(code.code()));
                write_str(&mut buf, message);
            }
            ExecutorResponse::Block => {
                write_uint(&mut buf, u64::from(RESPONSE_BLOCK));
                buf.push(Marker::Null.to_u8());
            }
            ExecutorResponse::Ready => {
                write_uint(&mut buf, u64::from(RESPONSE_READY));
                buf.push(Marker::Null.to_u8());
            }
            ExecutorResponse::Cancel(message) => {
                write_uint(&mut buf, u64::from(RESPONSE_CANCEL));
                write_str(&mut buf, message);
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(buf);
        cursor.read_envelope_header()?;
        let tag = cursor.read_uint()?;
        match u8::try_from(tag) {
            Ok(RESPONSE_RESULT) => Ok(ExecutorResponse::Result(cursor.read_fragments()?)),
            Ok(RESPONSE_ERROR) => {
                let len = cursor.read_array_len()?;
                if len < 2 {
                    return Err(CodecError::Invalid("error body too short".to_string()));
                }
                let code = cursor.read_uint()?;
                let code = u8::try_from(code)
                    .ok()
                    .and_then(FunctionInvokeError::from_code)
                    .ok_or_else(|| CodecError::Invalid(format!("unknown error code {code}")))?;
                let message = cursor.read_str()?;
                Ok(ExecutorResponse::Error(code, message))
            }
            Ok(RESPONSE_BLOCK) => Ok(ExecutorResponse::Block),
            Ok(RESPONSE_READY) => Ok(ExecutorResponse::Ready),
            Ok(RESPONSE_CANCEL) => Ok(ExecutorResponse::Cancel(cursor.read_str()?)),
            _ => Err(CodecError::Invalid(format!("unknown response tag {tag}"))),
        }
    }
}

fn write_array_len(buf: &mut Vec<u8>, len: u32) {
    match len {
        0..=15 => buf.push(Marker::FixArray(len as u8).to_u8()),
        16..=65535 => {
            buf.push(Marker::Array16.to_u8());
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        }
        _ => {
            buf.push(Marker::Array32.to_u8());
            buf.extend_from_slice(&len.to_be_bytes());
        }
    }
}

fn write_uint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=127 => buf.push(Marker::FixPos(value as u8).to_u8()),
        128..=255 => {
            buf.push(Marker::U8.to_u8());
            buf.push(value as u8);
        }
        256..=65535 => {
            buf.push(Marker::U16.to_u8());
            buf.extend_from_slice(&(value as u16).to_be_bytes());
        }
        65536..=4294967295 => {
            buf.push(Marker::U32.to_u8());
            buf.extend_from_slice(&(value as u32).to_be_bytes());
        }
        _ => {
            buf.push(Marker::U64.to_u8());
            buf.extend_from_slice(&value.to_be_bytes());
        }
    }
}

fn write_str(buf: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    match bytes.len() {
        0..=31 => buf.push(Marker::FixStr(bytes.len() as u8).to_u8()),
        32..=255 => {
            buf.push(Marker::Str8.to_u8());
            buf.push(bytes.len() as u8);
        }
        256..=65535 => {
            buf.push(Marker::Str16.to_u8());
            buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        }
        _ => {
            buf.push(Marker::Str32.to_u8());
            buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        }
    }
    buf.extend_from_slice(bytes);
}

fn write_fragments(buf: &mut Vec<u8>, fragments: &[Vec<u8>]) {
    write_array_len(buf, fragments.len() as u32);
    for fragment in fragments {
        buf.extend_from_slice(fragment);
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::Truncated)?;
        if end > self.buf.len() {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn marker(&mut self) -> Result<Marker, CodecError> {
        Ok(Marker::from_u8(self.take(1)?[0]))
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_envelope_header(&mut self) -> Result<(), CodecError> {
        let len = self.read_array_len()?;
        if len != 2 {
            return Err(CodecError::Invalid(format!(
                "expected a 2-array envelope, got array of {len}"
            )));
        }
        Ok(())
    }

    fn read_array_len(&mut self) -> Result<u32, CodecError> {
        match self.marker()? {
            Marker::FixArray(len) => Ok(u32::from(len)),
            Marker::Array16 => Ok(u32::from(self.read_u16()?)),
            Marker::Array32 => self.read_u32(),
            other => Err(CodecError::Invalid(format!("expected array, got {other:?}"))),
        }
    }

    fn read_uint(&mut self) -> Result<u64, CodecError> {
        match self.marker()? {
            Marker::FixPos(value) => Ok(u64::from(value)),
            Marker::U8 => Ok(u64::from(self.read_u8()?)),
            Marker::U16 => Ok(u64::from(self.read_u16()?)),
            Marker::U32 => Ok(u64::from(self.read_u32()?)),
            Marker::U64 => {
                let bytes = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                Ok(u64::from_be_bytes(raw))
            }
            other => Err(CodecError::Invalid(format!(
                "expected unsigned integer, got {other:?}"
            ))),
        }
    }

    fn read_str(&mut self) -> Result<String, CodecError> {
        let len = match self.marker()? {
            Marker::FixStr(len) => usize::from(len),
            Marker::Str8 => usize::from(self.read_u8()?),
            Marker::Str16 => usize::from(self.read_u16()?),
            Marker::Str32 => self.read_u32()? as usize,
            other => Err(CodecError::Invalid(format!("expected string, got {other:?}")))?,
        };
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| CodecError::Invalid("string is not valid utf-8".to_string()))
    }

    /// Splits an array body into its raw msgpack fragments.
    fn read_fragments(&mut self) -> Result<Vec<Vec<u8>>, CodecError> {
        let len = self.read_array_len()?;
        let mut fragments = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let start = self.pos;
            self.skip_value()?;
            fragments.push(self.buf[start..self.pos].to_vec());
        }
        Ok(fragments)
    }

    fn skip_value(&mut self) -> Result<(), CodecError> {
        match self.marker()? {
            Marker::FixPos(_)
            | Marker::FixNeg(_)
            | Marker::Null
            | Marker::True
            | Marker::False => Ok(()),
            Marker::U8 | Marker::I8 => self.take(1).map(|_| ()),
            Marker::U16 | Marker::I16 => self.take(2).map(|_| ()),
            Marker::U32 | Marker::I32 | Marker::F32 => self.take(4).map(|_| ()),
            Marker::U64 | Marker::I64 | Marker::F64 => self.take(8).map(|_| ()),
            Marker::FixStr(len) => self.take(usize::from(len)).map(|_| ()),
            Marker::Str8 | Marker::Bin8 => {
                let len = usize::from(self.read_u8()?);
                self.take(len).map(|_| ())
            }
            Marker::Str16 | Marker::Bin16 => {
                let len = usize::from(self.read_u16()?);
                self.take(len).map(|_| ())
            }
            Marker::Str32 | Marker::Bin32 => {
                let len = self.read_u32()? as usize;
                self.take(len).map(|_| ())
            }
            Marker::FixArray(len) => self.skip_values(usize::from(len)),
            Marker::Array16 => {
                let len = usize::from(self.read_u16()?);
                self.skip_values(len)
            }
            Marker::Array32 => {
                let len = self.read_u32()? as usize;
                self.skip_values(len)
            }
            Marker::FixMap(len) => self.skip_values(2 * usize::from(len)),
            Marker::Map16 => {
                let len = usize::from(self.read_u16()?);
                self.skip_values(2 * len)
            }
            Marker::Map32 => {
                let len = self.read_u32()? as usize;
                self.skip_values(2 * len)
            }
            Marker::FixExt1 => self.take(2).map(|_| ()),
            Marker::FixExt2 => self.take(3).map(|_| ()),
            Marker::FixExt4 => self.take(5).map(|_| ()),
            Marker::FixExt8 => self.take(9).map(|_| ()),
            Marker::FixExt16 => self.take(17).map(|_| ()),
            Marker::Ext8 => {
                let len = usize::from(self.read_u8()?);
                self.take(len + 1).map(|_| ())
            }
            Marker::Ext16 => {
                let len = usize::from(self.read_u16()?);
                self.take(len + 1).map(|_| ())
            }
            Marker::Ext32 => {
                let len = self.read_u32()? as usize;
                self.take(len + 1).map(|_| ())
            }
            Marker::Reserved => Err(CodecError::Invalid("reserved marker".to_string())),
        }
    }

    fn skip_values(&mut self, count: usize) -> Result<(), CodecError> {
        for _ in 0..count {
            self.skip_value()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_round_trip() {
        let args = vec![
            pack_value(&1i64).unwrap(),
            pack_value(&"hello".to_string()).unwrap(),
            pack_value(&vec![1i64, 2, 3]).unwrap(),
        ];
        let encoded = ExecutorRequest::Arguments(args.clone()).encode();
        let decoded = ExecutorRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, ExecutorRequest::Arguments(args.clone()));

        let ExecutorRequest::Arguments(fragments) = decoded else {
            unreachable!()
        };
        assert_eq!(unpack_value::<i64>(&fragments[0]).unwrap(), 1);
        assert_eq!(unpack_value::<String>(&fragments[1]).unwrap(), "hello");
        assert_eq!(unpack_value::<Vec<i64>>(&fragments[2]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn result_round_trip() {
        let outputs = vec![pack_value(&3.5f64).unwrap(), pack_value(&true).unwrap()];
        let encoded = ExecutorResponse::Result(outputs.clone()).encode();
        assert_eq!(
            ExecutorResponse::decode(&encoded).unwrap(),
            ExecutorResponse::Result(outputs)
        );
    }

    #[test]
    fn error_round_trip() {
        let response = ExecutorResponse::Error(
            FunctionInvokeError::WrongNumberOfArguments,
            "expect 2, get 3".to_string(),
        );
        let encoded = response.encode();
        assert_eq!(ExecutorResponse::decode(&encoded).unwrap(), response);
    }

    #[test]
    fn cancel_round_trip() {
        let response = ExecutorResponse::Cancel("Task cancelled".to_string());
        let encoded = response.encode();
        assert_eq!(ExecutorResponse::decode(&encoded).unwrap(), response);
    }

    #[test]
    fn fragment_splitting_handles_nested_values() {
        let nested = pack_value(&(1i64, vec!["a".to_string(), "b".to_string()], 2i64)).unwrap();
        let args = vec![nested.clone(), pack_value(&9i64).unwrap()];
        let encoded = ExecutorRequest::Arguments(args).encode();
        let ExecutorRequest::Arguments(fragments) = ExecutorRequest::decode(&encoded).unwrap()
        else {
            unreachable!()
        };
        assert_eq!(fragments[0], nested);
        assert_eq!(unpack_value::<i64>(&fragments[1]).unwrap(), 9);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let encoded = ExecutorResponse::Cancel("Task cancelled".to_string()).encode();
        assert_eq!(
            ExecutorResponse::decode(&encoded[..encoded.len() - 1]),
            Err(CodecError::Truncated)
        );
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = Vec::new();
        write_array_len(&mut buf, 2);
        write_uint(&mut buf, 99);
        buf.push(Marker::Null.to_u8());
        assert!(matches!(
            ExecutorResponse::decode(&buf),
            Err(CodecError::Invalid(_))
        ));
    }
}
