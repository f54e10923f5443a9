//! Control-point wire codec: request framing and response parsing.
//!
//! Frames are little-endian. Requests are `opcode, arguments...`. Responses are
//! `0x60, echoed_opcode, result, payload...` (plus an extended error byte when
//! `result == EXT_ERROR`).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{DfuError, ExtError};

const RESPONSE_MARKER: u8 = 0x60;

/// Control-point request opcodes.
///
/// As defined in `nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OpCode {
    ObjectCreate = 0x01,
    PrnSet = 0x02,
    CrcGet = 0x03,
    ObjectExecute = 0x04,
    ObjectSelect = 0x06,
    MtuGet = 0x07,
    Ping = 0x09,
    Abort = 0x0C,
}

/// Which kind of object a `SELECT`/`CREATE` request addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum ObjectType {
    Command = 0x01,
    Data = 0x02,
}

/// Control-point result codes. Note that `Success` is nonzero.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtError = 0x0B,
}

/// A fully framed control-point request.
#[derive(Debug, Clone)]
pub enum Request {
    ObjectCreate { object_type: ObjectType, size: u32 },
    PrnSet { prn: u16 },
    CrcGet,
    ObjectExecute,
    ObjectSelect { object_type: ObjectType },
    MtuGet,
    Ping { id: u8 },
    Abort,
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Request::ObjectCreate { .. } => OpCode::ObjectCreate,
            Request::PrnSet { .. } => OpCode::PrnSet,
            Request::CrcGet => OpCode::CrcGet,
            Request::ObjectExecute => OpCode::ObjectExecute,
            Request::ObjectSelect { .. } => OpCode::ObjectSelect,
            Request::MtuGet => OpCode::MtuGet,
            Request::Ping { .. } => OpCode::Ping,
            Request::Abort => OpCode::Abort,
        }
    }

    /// Pack this request into its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let opcode: u8 = self.opcode().into();
        let mut buf = vec![opcode];
        match self {
            Request::ObjectCreate { object_type, size } => {
                buf.push((*object_type).into());
                buf.extend_from_slice(&size.to_le_bytes());
            }
            Request::PrnSet { prn } => buf.extend_from_slice(&prn.to_le_bytes()),
            Request::ObjectSelect { object_type } => buf.push((*object_type).into()),
            Request::Ping { id } => buf.push(*id),
            Request::CrcGet | Request::ObjectExecute | Request::MtuGet | Request::Abort => {}
        }
        buf
    }
}

/// The decoded payload of a successful response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ResponseBody {
    Empty,
    Select { max_size: u32, offset: u32, crc: u32 },
    Crc { offset: u32, crc: u32 },
    Mtu { mtu: u16 },
    /// Opaque payload forwarded verbatim (e.g. `PING`'s echoed id).
    Raw(Vec<u8>),
}

fn read_u32_le(bytes: &[u8], at: usize) -> Result<u32, DfuError> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or_else(|| DfuError::Protocol("response payload too short".into()))?;
    Ok(u32::from_le_bytes(slice.try_into().unwrap()))
}

/// Parse a raw control-point notification that was sent in answer to `opcode`.
pub fn decode(raw: &[u8], opcode: OpCode) -> Result<ResponseBody, DfuError> {
    if raw.len() < 3 {
        return Err(DfuError::Protocol("response shorter than header".into()));
    }
    if raw[0] != RESPONSE_MARKER {
        return Err(DfuError::Protocol(format!(
            "unexpected response marker 0x{:02X}",
            raw[0]
        )));
    }
    let echoed: u8 = opcode.into();
    if raw[1] != echoed {
        return Err(DfuError::Protocol(format!(
            "response echoes opcode 0x{:02X}, expected 0x{echoed:02X}",
            raw[1]
        )));
    }

    let result = ResultCode::try_from(raw[2])
        .map_err(|_| DfuError::Protocol(format!("unknown result code 0x{:02X}", raw[2])))?;

    if result != ResultCode::Success {
        let ext = if result == ResultCode::ExtError {
            let byte = *raw
                .get(3)
                .ok_or_else(|| DfuError::Protocol("EXT_ERROR response missing ext byte".into()))?;
            Some(ExtError::try_from(byte).unwrap_or(ExtError::InvalidErrorCode))
        } else {
            None
        };
        return Err(DfuError::Device { code: result, ext });
    }

    let payload = &raw[3..];
    let body = match opcode {
        OpCode::ObjectSelect => ResponseBody::Select {
            max_size: read_u32_le(payload, 0)?,
            offset: read_u32_le(payload, 4)?,
            crc: read_u32_le(payload, 8)?,
        },
        OpCode::CrcGet => ResponseBody::Crc {
            offset: read_u32_le(payload, 0)?,
            crc: read_u32_le(payload, 4)?,
        },
        OpCode::MtuGet => {
            let slice = payload
                .get(0..2)
                .ok_or_else(|| DfuError::Protocol("MTU_GET payload too short".into()))?;
            ResponseBody::Mtu {
                mtu: u16::from_le_bytes(slice.try_into().unwrap()),
            }
        }
        OpCode::ObjectCreate | OpCode::ObjectExecute | OpCode::PrnSet | OpCode::Abort => {
            ResponseBody::Empty
        }
        OpCode::Ping => ResponseBody::Raw(payload.to_vec()),
    };
    Ok(body)
}
