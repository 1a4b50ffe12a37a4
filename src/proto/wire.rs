//! Length-prefixed framing for the control and data planes.
//!
//! Control frames: `u32` big-endian frame length, then `u16` tag, then the
//! CBOR payload. Data-plane exchanges are a single framed `GetRequest`
//! followed by a single `Option<bytes>` response (`0x01` + `u32` length +
//! payload, or a bare `0x00`).

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::model::FlowDescription;
use crate::proto::messages::ControlMessage;

/// Upper bound on any single frame. Control messages are small; the bound
/// exists so a corrupt length prefix cannot trigger a huge allocation.
pub const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

/// Upper bound on one data-plane payload. Well under the `u32` length
/// prefix so the reader can reject a corrupt prefix before allocating.
pub const MAX_DATA_BYTES: u64 = 1024 * 1024 * 1024;

const DATA_SOME: u8 = 0x01;
const DATA_NONE: u8 = 0x00;

pub async fn write_control<W>(w: &mut W, msg: &ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = msg.encode_payload()?;
    let frame_len = payload
        .len()
        .checked_add(2)
        .filter(|len| *len <= MAX_CONTROL_FRAME)
        .ok_or_else(|| Error::Protocol(format!("oversized control frame: {} bytes", payload.len())))?;

    let mut buf = BytesMut::with_capacity(4 + frame_len);
    buf.put_u32(frame_len as u32);
    buf.put_u16(msg.tag());
    buf.put_slice(&payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one control message. `Ok(None)` means the peer closed the
/// connection at a frame boundary.
pub async fn read_control<R>(r: &mut R) -> Result<Option<ControlMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if !(2..=MAX_CONTROL_FRAME).contains(&frame_len) {
        return Err(Error::Protocol(format!("bad control frame length {frame_len}")));
    }

    let mut frame = vec![0u8; frame_len];
    r.read_exact(&mut frame).await?;
    let tag = u16::from_be_bytes([frame[0], frame[1]]);
    ControlMessage::decode(tag, &frame[2..]).map(Some)
}

pub async fn write_get_request<W>(w: &mut W, desc: &FlowDescription) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_cbor::to_vec(desc)?;
    if payload.len() > MAX_CONTROL_FRAME {
        return Err(Error::Protocol("oversized get request".into()));
    }
    w.write_u32(payload.len() as u32).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

/// Server side of the data plane: read the single framed request.
/// `Ok(None)` means the peer closed without sending one.
pub async fn read_get_request<R>(r: &mut R) -> Result<Option<FlowDescription>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_CONTROL_FRAME {
        return Err(Error::Protocol(format!("bad get request length {len}")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(serde_cbor::from_slice(&payload)?))
}

pub async fn write_data_response<W>(w: &mut W, data: Option<&[u8]>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match data {
        None => w.write_u8(DATA_NONE).await?,
        Some(bytes) => {
            if bytes.len() as u64 > MAX_DATA_BYTES {
                return Err(Error::Protocol(format!("payload too large: {} bytes", bytes.len())));
            }
            w.write_u8(DATA_SOME).await?;
            w.write_u32(bytes.len() as u32).await?;
            w.write_all(bytes).await?;
        }
    }
    w.flush().await?;
    Ok(())
}

/// Client side of the data plane; the caller passes the (throttled) inbound
/// stream so the length-prefixed body read is rate limited.
pub async fn read_data_response<R>(r: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let tag = r.read_u8().await?;
    match tag {
        DATA_NONE => Ok(None),
        DATA_SOME => {
            let len = r.read_u32().await? as u64;
            if len > MAX_DATA_BYTES {
                return Err(Error::Protocol(format!("bad data response length {len}")));
            }
            let mut body = vec![0u8; len as usize];
            r.read_exact(&mut body).await?;
            Ok(Some(body))
        }
        other => Err(Error::Protocol(format!("bad data response tag 0x{other:02X}"))),
    }
}
