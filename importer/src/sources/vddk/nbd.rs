//! Minimal NBD client.
//!
//! Speaks the fixed-newstyle handshake with structured replies and the
//! `base:allocation` metadata context, which is all the block copier needs
//! from nbdkit: the export size, block status and reads.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use importer_shared::{ImportError, ImportResult};

const NBDMAGIC: u64 = 0x4e42_444d_4147_4943;
const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
const REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const REQUEST_MAGIC: u32 = 0x2560_9513;
const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

const FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
const FLAG_NO_ZEROES: u16 = 1 << 1;

const OPT_GO: u32 = 7;
const OPT_STRUCTURED_REPLY: u32 = 8;
const OPT_SET_META_CONTEXT: u32 = 10;

const REP_ACK: u32 = 1;
const REP_INFO: u32 = 3;
const REP_META_CONTEXT: u32 = 4;
const REP_FLAG_ERROR: u32 = 1 << 31;

const INFO_EXPORT: u16 = 0;

const CMD_READ: u16 = 0;
const CMD_DISC: u16 = 2;
const CMD_BLOCK_STATUS: u16 = 7;
const CMD_FLAG_REQ_ONE: u16 = 1 << 3;

const REPLY_FLAG_DONE: u16 = 1 << 0;
const REPLY_TYPE_NONE: u16 = 0;
const REPLY_TYPE_OFFSET_DATA: u16 = 1;
const REPLY_TYPE_OFFSET_HOLE: u16 = 2;
const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
const REPLY_TYPE_ERROR_BIT: u16 = 1 << 15;

/// Metadata context describing holes and zeroes.
pub const BASE_ALLOCATION: &str = "base:allocation";

/// The range is unallocated on the source.
pub const STATE_HOLE: u32 = 1 << 0;
/// The range reads as zeroes.
pub const STATE_ZERO: u32 = 1 << 1;

/// One block-status descriptor: `length` bytes sharing `flags`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub length: u32,
    pub flags: u32,
}

/// What the copier needs from an NBD connection.
pub trait NbdOperations: Send {
    /// Export size in bytes.
    fn size(&self) -> u64;

    /// Fill `buf` from `offset`.
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> ImportResult<()>;

    /// `base:allocation` status of `[offset, offset + length)`, one extent at
    /// a time. The descriptors start at `offset` and are contiguous.
    fn block_status(&mut self, length: u32, offset: u64) -> ImportResult<Vec<BlockDescriptor>>;

    /// Disconnect. Safe to call repeatedly.
    fn close(&mut self) -> ImportResult<()>;
}

/// Opens NBD connections.
pub trait NbdConnector: Send + Sync {
    fn connect(&self, socket: &Path) -> ImportResult<Box<dyn NbdOperations>>;
}

/// Connects to a Unix socket and negotiates `base:allocation`.
pub struct SocketNbdConnector;

impl NbdConnector for SocketNbdConnector {
    fn connect(&self, socket: &Path) -> ImportResult<Box<dyn NbdOperations>> {
        tracing::info!("Connecting to nbd+unix://?socket={}", socket.display());
        let stream = UnixStream::connect(socket).map_err(|e| {
            ImportError::Network(format!(
                "Unable to connect to socket {}: {}",
                socket.display(),
                e
            ))
        })?;
        Ok(Box::new(NbdClient::handshake(stream, "")?))
    }
}

fn protocol_error(message: impl Into<String>) -> ImportError {
    ImportError::Network(format!("NBD protocol error: {}", message.into()))
}

fn io_error(context: &str, err: io::Error) -> ImportError {
    ImportError::Network(format!("NBD {}: {}", context, err))
}

/// A negotiated NBD connection.
pub struct NbdClient<S: Read + Write> {
    stream: S,
    size: u64,
    structured: bool,
    /// Context ID the server assigned to `base:allocation`
    allocation_context: Option<u32>,
    cookie: u64,
    closed: bool,
}

impl<S: Read + Write + Send> NbdClient<S> {
    /// Run the handshake for `export` over `stream`.
    pub fn handshake(mut stream: S, export: &str) -> ImportResult<Self> {
        let magic = read_u64(&mut stream).map_err(|e| io_error("handshake", e))?;
        let opt_magic = read_u64(&mut stream).map_err(|e| io_error("handshake", e))?;
        if magic != NBDMAGIC || opt_magic != IHAVEOPT {
            return Err(protocol_error("server does not speak newstyle negotiation"));
        }
        let server_flags = read_u16(&mut stream).map_err(|e| io_error("handshake", e))?;
        if server_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(protocol_error("server does not support fixed newstyle"));
        }
        let client_flags = u32::from(server_flags & (FLAG_FIXED_NEWSTYLE | FLAG_NO_ZEROES));
        stream
            .write_all(&client_flags.to_be_bytes())
            .map_err(|e| io_error("handshake", e))?;

        let mut client = Self {
            stream,
            size: 0,
            structured: false,
            allocation_context: None,
            cookie: 0,
            closed: false,
        };
        client.negotiate_structured_replies()?;
        if client.structured {
            client.negotiate_meta_context(export)?;
        } else {
            tracing::error!("Error adding {} context to NBD handle: structured replies unsupported", BASE_ALLOCATION);
        }
        client.go(export)?;
        tracing::info!(size = client.size, "NBD export ready");
        Ok(client)
    }

    fn send_option(&mut self, option: u32, data: &[u8]) -> ImportResult<()> {
        let mut msg = Vec::with_capacity(16 + data.len());
        msg.extend_from_slice(&IHAVEOPT.to_be_bytes());
        msg.extend_from_slice(&option.to_be_bytes());
        msg.extend_from_slice(&(data.len() as u32).to_be_bytes());
        msg.extend_from_slice(data);
        self.stream
            .write_all(&msg)
            .and_then(|_| self.stream.flush())
            .map_err(|e| io_error("option", e))
    }

    /// Read one option reply: `(type, payload)`.
    fn read_option_reply(&mut self, option: u32) -> ImportResult<(u32, Vec<u8>)> {
        let magic = read_u64(&mut self.stream).map_err(|e| io_error("option reply", e))?;
        if magic != REPLY_MAGIC {
            return Err(protocol_error(format!("bad option reply magic {:#x}", magic)));
        }
        let replied = read_u32(&mut self.stream).map_err(|e| io_error("option reply", e))?;
        if replied != option {
            return Err(protocol_error(format!(
                "reply for option {} while waiting for {}",
                replied, option
            )));
        }
        let kind = read_u32(&mut self.stream).map_err(|e| io_error("option reply", e))?;
        let length = read_u32(&mut self.stream).map_err(|e| io_error("option reply", e))?;
        let payload = read_vec(&mut self.stream, length as usize).map_err(|e| io_error("option reply", e))?;
        Ok((kind, payload))
    }

    fn negotiate_structured_replies(&mut self) -> ImportResult<()> {
        self.send_option(OPT_STRUCTURED_REPLY, &[])?;
        let (kind, _) = self.read_option_reply(OPT_STRUCTURED_REPLY)?;
        self.structured = kind == REP_ACK;
        Ok(())
    }

    fn negotiate_meta_context(&mut self, export: &str) -> ImportResult<()> {
        let mut data = Vec::new();
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&(BASE_ALLOCATION.len() as u32).to_be_bytes());
        data.extend_from_slice(BASE_ALLOCATION.as_bytes());
        self.send_option(OPT_SET_META_CONTEXT, &data)?;

        loop {
            let (kind, payload) = self.read_option_reply(OPT_SET_META_CONTEXT)?;
            match kind {
                REP_META_CONTEXT if payload.len() >= 4 => {
                    let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    let name = String::from_utf8_lossy(&payload[4..]);
                    if name == BASE_ALLOCATION {
                        self.allocation_context = Some(id);
                    }
                }
                REP_ACK => break,
                k if k & REP_FLAG_ERROR != 0 => {
                    tracing::error!("Error adding {} context to NBD handle: reply {:#x}", BASE_ALLOCATION, k);
                    break;
                }
                other => {
                    return Err(protocol_error(format!("unexpected meta context reply {}", other)));
                }
            }
        }
        Ok(())
    }

    fn go(&mut self, export: &str) -> ImportResult<()> {
        let mut data = Vec::new();
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        self.send_option(OPT_GO, &data)?;

        loop {
            let (kind, payload) = self.read_option_reply(OPT_GO)?;
            match kind {
                REP_INFO if payload.len() >= 12 => {
                    let info = u16::from_be_bytes([payload[0], payload[1]]);
                    if info == INFO_EXPORT {
                        let mut size = [0u8; 8];
                        size.copy_from_slice(&payload[2..10]);
                        self.size = u64::from_be_bytes(size);
                    }
                }
                REP_INFO => {}
                REP_ACK => return Ok(()),
                k if k & REP_FLAG_ERROR != 0 => {
                    return Err(protocol_error(format!(
                        "export {:?} refused: {}",
                        export,
                        String::from_utf8_lossy(&payload)
                    )));
                }
                other => return Err(protocol_error(format!("unexpected reply {} to GO", other))),
            }
        }
    }

    fn send_request(&mut self, flags: u16, command: u16, offset: u64, length: u32) -> ImportResult<u64> {
        self.cookie += 1;
        let mut msg = Vec::with_capacity(28);
        msg.extend_from_slice(&REQUEST_MAGIC.to_be_bytes());
        msg.extend_from_slice(&flags.to_be_bytes());
        msg.extend_from_slice(&command.to_be_bytes());
        msg.extend_from_slice(&self.cookie.to_be_bytes());
        msg.extend_from_slice(&offset.to_be_bytes());
        msg.extend_from_slice(&length.to_be_bytes());
        self.stream
            .write_all(&msg)
            .and_then(|_| self.stream.flush())
            .map_err(|e| io_error("request", e))?;
        Ok(self.cookie)
    }

    /// Read replies for `cookie` until the final chunk, handing each chunk
    /// to `on_chunk(type, payload)`.
    fn read_replies(
        &mut self,
        cookie: u64,
        read_buf: Option<&mut [u8]>,
        mut on_chunk: impl FnMut(u16, &[u8]) -> ImportResult<()>,
    ) -> ImportResult<()> {
        let mut read_buf = read_buf;
        loop {
            let magic = read_u32(&mut self.stream).map_err(|e| io_error("reply", e))?;
            match magic {
                SIMPLE_REPLY_MAGIC => {
                    let error = read_u32(&mut self.stream).map_err(|e| io_error("reply", e))?;
                    let handle = read_u64(&mut self.stream).map_err(|e| io_error("reply", e))?;
                    check_cookie(handle, cookie)?;
                    if error != 0 {
                        return Err(ImportError::Network(format!("NBD request failed with error {}", error)));
                    }
                    if let Some(buf) = read_buf.take() {
                        self.stream.read_exact(buf).map_err(|e| io_error("read", e))?;
                    }
                    return Ok(());
                }
                STRUCTURED_REPLY_MAGIC => {
                    let flags = read_u16(&mut self.stream).map_err(|e| io_error("reply", e))?;
                    let kind = read_u16(&mut self.stream).map_err(|e| io_error("reply", e))?;
                    let handle = read_u64(&mut self.stream).map_err(|e| io_error("reply", e))?;
                    let length = read_u32(&mut self.stream).map_err(|e| io_error("reply", e))?;
                    check_cookie(handle, cookie)?;
                    let payload = read_vec(&mut self.stream, length as usize).map_err(|e| io_error("reply", e))?;
                    if kind & REPLY_TYPE_ERROR_BIT != 0 {
                        return Err(structured_error(&payload));
                    }
                    on_chunk(kind, &payload)?;
                    if flags & REPLY_FLAG_DONE != 0 {
                        return Ok(());
                    }
                }
                other => return Err(protocol_error(format!("bad reply magic {:#x}", other))),
            }
        }
    }
}

fn check_cookie(got: u64, want: u64) -> ImportResult<()> {
    if got != want {
        return Err(protocol_error(format!("reply cookie {} for request {}", got, want)));
    }
    Ok(())
}

fn structured_error(payload: &[u8]) -> ImportError {
    if payload.len() < 6 {
        return protocol_error("short error chunk");
    }
    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let len = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let message = payload
        .get(6..6 + len)
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    ImportError::Network(format!("NBD request failed with error {}: {}", code, message))
}

impl<S: Read + Write + Send> NbdOperations for NbdClient<S> {
    fn size(&self) -> u64 {
        self.size
    }

    fn pread(&mut self, buf: &mut [u8], offset: u64) -> ImportResult<()> {
        let cookie = self.send_request(0, CMD_READ, offset, buf.len() as u32)?;
        if !self.structured {
            return self.read_replies(cookie, Some(buf), |_, _| Ok(()));
        }
        let len = buf.len() as u64;
        let mut chunks = Vec::new();
        self.read_replies(cookie, None, |kind, payload| {
            match kind {
                REPLY_TYPE_OFFSET_DATA | REPLY_TYPE_OFFSET_HOLE if payload.len() >= 8 => {
                    chunks.push((kind, payload.to_vec()));
                }
                REPLY_TYPE_NONE => {}
                other => return Err(protocol_error(format!("unexpected chunk {} for read", other))),
            }
            Ok(())
        })?;

        for (kind, payload) in chunks {
            let mut at = [0u8; 8];
            at.copy_from_slice(&payload[..8]);
            let start = u64::from_be_bytes(at)
                .checked_sub(offset)
                .filter(|s| *s <= len)
                .ok_or_else(|| protocol_error("read chunk outside the request"))? as usize;
            if kind == REPLY_TYPE_OFFSET_DATA {
                let data = &payload[8..];
                let dst = buf
                    .get_mut(start..start + data.len())
                    .ok_or_else(|| protocol_error("read chunk overruns the request"))?;
                dst.copy_from_slice(data);
            } else {
                let hole = payload
                    .get(8..12)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .ok_or_else(|| protocol_error("short hole chunk"))?;
                buf.get_mut(start..start + hole)
                    .ok_or_else(|| protocol_error("hole chunk overruns the request"))?
                    .fill(0);
            }
        }
        Ok(())
    }

    fn block_status(&mut self, length: u32, offset: u64) -> ImportResult<Vec<BlockDescriptor>> {
        let Some(context) = self.allocation_context else {
            return Err(ImportError::Unsupported(format!(
                "server did not provide {}",
                BASE_ALLOCATION
            )));
        };
        let cookie = self.send_request(CMD_FLAG_REQ_ONE, CMD_BLOCK_STATUS, offset, length)?;
        let mut descriptors = Vec::new();
        self.read_replies(cookie, None, |kind, payload| {
            if kind != REPLY_TYPE_BLOCK_STATUS {
                return Ok(());
            }
            if payload.len() < 4 || (payload.len() - 4) % 8 != 0 {
                return Err(protocol_error(format!(
                    "block status entry at offset {} has unexpected length {}",
                    offset,
                    payload.len()
                )));
            }
            let id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if id != context {
                tracing::debug!("Offset {} not {}, ignoring", offset, BASE_ALLOCATION);
                return Ok(());
            }
            for pair in payload[4..].chunks_exact(8) {
                descriptors.push(BlockDescriptor {
                    length: u32::from_be_bytes([pair[0], pair[1], pair[2], pair[3]]),
                    flags: u32::from_be_bytes([pair[4], pair[5], pair[6], pair[7]]),
                });
            }
            Ok(())
        })?;
        Ok(descriptors)
    }

    fn close(&mut self) -> ImportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send_request(0, CMD_DISC, 0, 0).map(|_| ())
    }
}

fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_vec(r: &mut impl Read, len: usize) -> io::Result<Vec<u8>> {
    let mut v = vec![0u8; len];
    r.read_exact(&mut v)?;
    Ok(v)
}
