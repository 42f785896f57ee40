//! TLS record layer

use super::{ProtocolError, RECORD_HEADER_LEN, TLS12_VERSION};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// TLS record content types
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    ChangeCipherSpec = 20,
    Alert = 21,
    Handshake = 22,
    ApplicationData = 23,
}

impl TryFrom<u8> for ContentType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            20 => Ok(Self::ChangeCipherSpec),
            21 => Ok(Self::Alert),
            22 => Ok(Self::Handshake),
            23 => Ok(Self::ApplicationData),
            other => Err(ProtocolError::UnexpectedRecord(other)),
        }
    }
}

/// A record read off the wire
#[derive(Debug, Clone)]
pub struct Record {
    pub content_type: ContentType,
    pub version: u16,
    pub body: Vec<u8>,
}

/// Encode a 5-byte record header
pub fn record_header(content_type: ContentType, version: u16, len: usize) -> [u8; RECORD_HEADER_LEN] {
    let len = len as u16;
    [
        content_type as u8,
        (version >> 8) as u8,
        version as u8,
        (len >> 8) as u8,
        len as u8,
    ]
}

/// Encode a full record
pub fn encode_record(content_type: ContentType, version: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + body.len());
    buf.put_slice(&record_header(content_type, version, body.len()));
    buf.put_slice(body);
    buf.to_vec()
}

/// Wrap a body in a TLS 1.2 application-data record
pub fn application_data(body: &[u8]) -> Vec<u8> {
    encode_record(ContentType::ApplicationData, TLS12_VERSION, body)
}

/// Read exactly one record.
///
/// Short reads are retried until the whole record is in; a declared length
/// above `max_len` fails without reading the body.
pub async fn read_record<R>(reader: &mut R, max_len: usize) -> Result<Record, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let content_type = ContentType::try_from(header[0])?;
    let version = u16::from_be_bytes([header[1], header[2]]);
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    if len > max_len {
        return Err(ProtocolError::RecordTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Ok(Record {
        content_type,
        version,
        body,
    })
}
