//! CBOR framing for messages crossing the sandbox boundary.
//!
//! Every message exchanged between the host and a sandbox is a single CBOR
//! frame. [`frame_to_json`] renders a frame as JSON text for tracing; byte
//! strings are rendered as base64.

use std::convert::Infallible;
use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("JSON serialization error")]
    Json(#[from] serde_json::Error),
    #[error("CBOR decode error")]
    CborDecode(#[from] minicbor_serde::error::DecodeError),
    #[error("CBOR encode error")]
    CborEncode(#[from] minicbor_serde::error::EncodeError<std::convert::Infallible>),
    #[error("UTF-8 encoding error")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
    #[error("empty frame")]
    EmptyFrame,
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Upper bound on a single decoded frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

struct Base64Formatter;

impl serde_json::ser::Formatter for Base64Formatter {
    fn write_byte_array<W>(&mut self, mut writer: &mut W, value: &[u8]) -> io::Result<()>
    where
        W: io::Write + ?Sized,
    {
        writer.write_all(b"\"")?;
        base64::write::EncoderWriter::new(&mut writer, &base64::engine::general_purpose::STANDARD)
            .write_all(value)?;
        writer.write_all(b"\"")
    }
}

/// Encode a message into a CBOR frame.
///
/// # Errors
/// Returns error if serialization fails.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Bytes, Error> {
    let mut serializer = minicbor_serde::Serializer::new(CborBytesMut::default());
    message.serialize(serializer.serialize_unit_as_null(true))?;
    Ok(serializer.into_encoder().into_writer().freeze())
}

/// Decode a CBOR frame into a message.
///
/// # Errors
/// Returns error if the frame is empty, oversized or malformed.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T, Error> {
    if frame.is_empty() {
        return Err(Error::EmptyFrame);
    }
    if frame.len() > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge {
            size: frame.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut deserializer = minicbor_serde::Deserializer::new(frame);
    Ok(T::deserialize(&mut deserializer)?)
}

/// Render a CBOR frame as JSON text.
///
/// # Errors
/// Returns error if CBOR parsing or JSON serialization fails.
pub fn frame_to_json(frame: &[u8]) -> Result<String, Error> {
    let mut o = vec![];
    serde_transcode::Transcoder::new(&mut minicbor_serde::Deserializer::new(frame)).serialize(
        &mut serde_json::Serializer::with_formatter(&mut o, Base64Formatter),
    )?;
    Ok(String::from_utf8(o)?)
}

#[derive(Default)]
struct CborBytesMut(BytesMut);

impl CborBytesMut {
    fn freeze(self) -> Bytes {
        self.0.freeze()
    }
}

impl minicbor::encode::Write for CborBytesMut {
    type Error = Infallible;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(())
    }
}
