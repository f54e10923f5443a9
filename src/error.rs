use thiserror::Error;

/// Extended error code carried by an `EXT_ERROR` control-point response.
///
/// As defined in `nRF5_SDK_17.1.0_ddde560/components/libraries/bootloader/dfu/nrf_dfu_req_handler.h`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u8)]
pub enum ExtError {
    NoError = 0x00,
    InvalidErrorCode = 0x01,
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

/// Top-level error type for every fallible operation in the DFU engine.
#[derive(Debug, Error)]
pub enum DfuError {
    /// The response router did not observe a control-point notification within the deadline.
    #[error("timed out waiting for a control-point response")]
    Timeout,

    /// A response frame was structurally invalid: too short, wrong marker, mismatched opcode,
    /// or an unrecognised result code.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peripheral returned a non-success result code.
    #[error("device returned error {code:?}{}", ext.map(|e| format!(" ({e:?})")).unwrap_or_default())]
    Device {
        code: crate::wire::ResultCode,
        ext: Option<ExtError>,
    },

    /// The host's view of `(offset, crc)` disagreed with the device's after a checkpoint.
    /// Always handled inside the object transfer engine; only surfaces once retries/recovery
    /// are exhausted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The init packet is larger than the COMMAND object's `max_size`.
    #[error("init packet ({size} bytes) exceeds device max_size ({max_size} bytes)")]
    PackageTooLarge { size: usize, max_size: usize },

    /// The GATT transport failed (disconnect, write failure, characteristic missing, ...).
    #[error("transport error: {0}")]
    Transport(String),

    /// The init-packet phase exhausted its retry budget.
    #[error("failed to send init packet after retries")]
    InitPacketFailed,

    /// The firmware phase exhausted its retry budget for one data object.
    #[error("failed to send firmware after retries")]
    FirmwareFailed,
}

pub type Result<T> = std::result::Result<T, DfuError>;
