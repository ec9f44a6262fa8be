use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use uuid::Uuid;

use crate::host_id::HostId;

pub fn put_socket_addr(buf: &mut impl BufMut, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(data) => {
            buf.put_u8(4);
            buf.put_u32(data.ip().to_bits());
            buf.put_u16(data.port());
        }
        SocketAddr::V6(data) => {
            buf.put_u8(6);
            buf.put_u128(data.ip().to_bits());
            buf.put_u16(data.port());
        }
    }
}

pub fn try_get_socket_addr(buf: &mut impl Buf) -> anyhow::Result<SocketAddr> {
    let addr = match buf.try_get_u8()? {
        4 => {
            let ip = buf.try_get_u32()?;
            let port = buf.try_get_u16()?;
            SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
        }
        6 => {
            let ip = buf.try_get_u128()?;
            let port = buf.try_get_u16()?;
            SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
        }
        n => {
            return Err(anyhow!("invalid socket address discriminator: {}", n));
        }
    };
    Ok(addr)
}

pub fn put_uuid(buf: &mut impl BufMut, uuid: &Uuid) {
    buf.put_slice(uuid.as_bytes());
}

pub fn try_get_uuid(buf: &mut impl Buf) -> anyhow::Result<Uuid> {
    let mut raw = [0u8; 16];
    if buf.remaining() < raw.len() {
        bail!("buffer underflow reading a uuid");
    }
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub fn put_host_id(buf: &mut impl BufMut, id: HostId) {
    buf.put_u32_varint(id.0);
}

pub fn try_get_host_id(buf: &mut impl Buf) -> anyhow::Result<HostId> {
    Ok(HostId(buf.try_get_u32_varint()?))
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        b => Err(anyhow!("invalid value for a boolean: {}", b)),
    }
}

/// length-prefixed (varint) byte string
pub fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_usize_varint(data.len());
    buf.put_slice(data);
}

pub fn try_get_bytes(buf: &mut impl Buf, max_len: usize) -> anyhow::Result<Bytes> {
    let len = buf.try_get_usize_varint()?;
    if len > max_len {
        bail!("length prefix {} exceeds maximum of {}", len, max_len);
    }
    if buf.remaining() < len {
        bail!("buffer underflow: length prefix {} but only {} bytes remaining", len, buf.remaining());
    }
    Ok(buf.copy_to_bytes(len))
}
