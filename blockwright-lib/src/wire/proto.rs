//! Simplified request/response framing for the data path. This is not
//! wire-compatible with the real NBD protocol (see DESIGN.md): a
//! length-prefixed binary frame with big-endian fields via `byteorder`,
//! a magic-number preamble, a `num_enum` opcode, and `bitflags` request
//! flags, without a handshake or option-negotiation phase.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::backend::types::OpFlags;
use crate::error::Errno;
use crate::extent::{Extent, ExtentType};

pub const REQUEST_MAGIC: u32 = 0x424c_4b51; // "BLKQ"
pub const REPLY_MAGIC: u32 = 0x424c_4b52; // "BLKR"
pub const HELLO_MAGIC: u32 = 0x424c_4b48; // "BLKH"

#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Read = 0,
    Write = 1,
    Flush = 2,
    Trim = 3,
    Zero = 4,
    Extents = 5,
    Cache = 6,
    Disconnect = 7,
}

/// Sent once by the server right after a connection opens: export size
/// and negotiated capability bits, mirroring the NBD export-info reply
/// this rewrite does not otherwise implement.
pub struct Hello {
    pub size: u64,
    pub readonly: bool,
    pub can_trim: bool,
    pub can_zero: bool,
    pub can_fua: bool,
    pub can_extents: bool,
}

impl Hello {
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        let mut flags: u32 = 0;
        if self.readonly {
            flags |= 1 << 0;
        }
        if self.can_trim {
            flags |= 1 << 1;
        }
        if self.can_zero {
            flags |= 1 << 2;
        }
        if self.can_fua {
            flags |= 1 << 3;
        }
        if self.can_extents {
            flags |= 1 << 4;
        }
        w.write_u32::<BE>(HELLO_MAGIC)?;
        w.write_u64::<BE>(self.size)?;
        w.write_u32::<BE>(flags)?;
        w.flush()
    }
}

/// A fixed-size request header. `Write` requests are followed by
/// `length` bytes of payload; every other opcode carries no payload.
pub struct RequestHeader {
    pub opcode: Opcode,
    pub flags: OpFlags,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl RequestHeader {
    pub fn read_from<R: Read>(mut r: R) -> io::Result<Self> {
        let magic = r.read_u32::<BE>()?;
        if magic != REQUEST_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("bad request magic {magic:#x}")));
        }
        let opcode_raw = r.read_u16::<BE>()?;
        let opcode = Opcode::try_from(opcode_raw).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("bad opcode {opcode_raw}")))?;
        let flags_raw = r.read_u16::<BE>()? as u32;
        let handle = r.read_u64::<BE>()?;
        let offset = r.read_u64::<BE>()?;
        let length = r.read_u32::<BE>()?;
        Ok(Self { opcode, flags: OpFlags::from_bits_truncate(flags_raw), handle, offset, length })
    }
}

pub struct ReplyHeader {
    pub handle: u64,
    pub errno: Option<Errno>,
    pub payload_len: u32,
}

fn errno_code(e: Errno) -> u32 {
    match e {
        Errno::Perm => 1,
        Errno::Io => 2,
        Errno::NoMem => 3,
        Errno::Inval => 4,
        Errno::NoSpc => 5,
        Errno::Overflow => 6,
        Errno::Shutdown => 7,
        Errno::NotSup => 8,
        Errno::Rofs => 9,
        Errno::FBig => 10,
    }
}

impl ReplyHeader {
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<BE>(REPLY_MAGIC)?;
        w.write_u64::<BE>(self.handle)?;
        w.write_u32::<BE>(self.errno.map(errno_code).unwrap_or(0))?;
        w.write_u32::<BE>(self.payload_len)?;
        Ok(())
    }
}

/// Encodes an [`ExtentSet`](crate::extent::ExtentSet)'s records as
/// `(offset: u64, length: u64, type: u32)` triples.
pub fn encode_extents<W: Write>(mut w: W, extents: &[Extent]) -> io::Result<()> {
    for e in extents {
        w.write_u64::<BE>(e.offset)?;
        w.write_u64::<BE>(e.length)?;
        w.write_u32::<BE>(e.ty.bits())?;
    }
    Ok(())
}

pub fn decode_extents(buf: &[u8]) -> io::Result<Vec<Extent>> {
    let mut out = Vec::with_capacity(buf.len() / 20);
    let mut cursor = buf;
    while !cursor.is_empty() {
        let offset = cursor.read_u64::<BE>()?;
        let length = cursor.read_u64::<BE>()?;
        let ty_raw = cursor.read_u32::<BE>()?;
        out.push(Extent { offset, length, ty: ExtentType::from_bits_truncate(ty_raw) });
    }
    Ok(out)
}
