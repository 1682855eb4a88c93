//! In-process NBD server over a Unix socket.
//!
//! Serves one read-only export from memory with a fixed `base:allocation`
//! map. Only what the importer's client asks for is implemented: structured
//! replies, one metadata context, `GO`, reads, single-extent block status
//! and disconnect.

use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

const NBDMAGIC: u64 = 0x4e42_444d_4147_4943;
const IHAVEOPT: u64 = 0x4948_4156_454f_5054;
const REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
const REQUEST_MAGIC: u32 = 0x2560_9513;
const STRUCTURED_REPLY_MAGIC: u32 = 0x668e_33ef;

const OPT_GO: u32 = 7;
const OPT_STRUCTURED_REPLY: u32 = 8;
const OPT_SET_META_CONTEXT: u32 = 10;
const REP_ACK: u32 = 1;
const REP_INFO: u32 = 3;
const REP_META_CONTEXT: u32 = 4;
const REP_ERR_UNSUP: u32 = (1 << 31) | 1;

const CMD_READ: u16 = 0;
const CMD_DISC: u16 = 2;
const CMD_BLOCK_STATUS: u16 = 7;

const REPLY_FLAG_DONE: u16 = 1;
const REPLY_TYPE_OFFSET_DATA: u16 = 1;
const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
const REPLY_TYPE_ERROR: u16 = (1 << 15) | 1;

const ALLOCATION_CONTEXT: &str = "base:allocation";
const ALLOCATION_ID: u32 = 1;
const EINVAL: u32 = 22;

/// One run of the allocation map. Extents are laid end to end from offset 0.
#[derive(Clone, Copy, Debug)]
pub struct Extent {
    pub length: u64,
    pub flags: u32,
}

struct Export {
    data: Vec<u8>,
    extents: Vec<Extent>,
}

impl Export {
    /// The extent containing `offset`, clipped to `length`.
    fn status(&self, offset: u64, length: u32) -> Option<(u32, u32)> {
        let mut start = 0u64;
        for extent in &self.extents {
            let end = start + extent.length;
            if offset >= start && offset < end {
                let run = (end - offset).min(u64::from(length));
                return Some((run as u32, extent.flags));
            }
            start = end;
        }
        None
    }
}

/// A running server. The socket lives in a private temporary directory
/// removed on drop.
pub struct FakeNbdServer {
    dir: TempDir,
    socket: PathBuf,
}

impl FakeNbdServer {
    pub fn start(data: Vec<u8>, extents: Vec<Extent>) -> io::Result<Self> {
        let dir = TempDir::new()?;
        let socket = dir.path().join("nbd.sock");
        let listener = UnixListener::bind(&socket)?;
        let export = Arc::new(Export { data, extents });

        thread::Builder::new()
            .name("fake-nbd".into())
            .spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let export = export.clone();
                    thread::spawn(move || {
                        let _ = serve(stream, &export);
                    });
                }
            })?;

        Ok(Self { dir, socket })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

fn serve(mut stream: UnixStream, export: &Export) -> io::Result<()> {
    stream.write_all(&NBDMAGIC.to_be_bytes())?;
    stream.write_all(&IHAVEOPT.to_be_bytes())?;
    stream.write_all(&3u16.to_be_bytes())?;
    let _client_flags = read_u32(&mut stream)?;

    loop {
        if read_u64(&mut stream)? != IHAVEOPT {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad option magic"));
        }
        let option = read_u32(&mut stream)?;
        let length = read_u32(&mut stream)?;
        let data = read_vec(&mut stream, length as usize)?;
        match option {
            OPT_STRUCTURED_REPLY => option_reply(&mut stream, option, REP_ACK, &[])?,
            OPT_SET_META_CONTEXT => {
                if contains_query(&data, ALLOCATION_CONTEXT) {
                    let mut payload = ALLOCATION_ID.to_be_bytes().to_vec();
                    payload.extend_from_slice(ALLOCATION_CONTEXT.as_bytes());
                    option_reply(&mut stream, option, REP_META_CONTEXT, &payload)?;
                }
                option_reply(&mut stream, option, REP_ACK, &[])?;
            }
            OPT_GO => {
                let mut payload = 0u16.to_be_bytes().to_vec();
                payload.extend_from_slice(&(export.data.len() as u64).to_be_bytes());
                payload.extend_from_slice(&1u16.to_be_bytes());
                option_reply(&mut stream, option, REP_INFO, &payload)?;
                option_reply(&mut stream, option, REP_ACK, &[])?;
                break;
            }
            _ => option_reply(&mut stream, option, REP_ERR_UNSUP, &[])?,
        }
    }

    loop {
        if read_u32(&mut stream)? != REQUEST_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad request magic"));
        }
        let _flags = read_u16(&mut stream)?;
        let command = read_u16(&mut stream)?;
        let cookie = read_u64(&mut stream)?;
        let offset = read_u64(&mut stream)?;
        let length = read_u32(&mut stream)?;
        match command {
            CMD_READ => {
                let start = offset as usize;
                let end = start + length as usize;
                match export.data.get(start..end) {
                    Some(bytes) => {
                        let mut payload = offset.to_be_bytes().to_vec();
                        payload.extend_from_slice(bytes);
                        chunk(&mut stream, REPLY_TYPE_OFFSET_DATA, cookie, &payload)?;
                    }
                    None => error_chunk(&mut stream, cookie)?,
                }
            }
            CMD_BLOCK_STATUS => match export.status(offset, length) {
                Some((run, flags)) => {
                    let mut payload = ALLOCATION_ID.to_be_bytes().to_vec();
                    payload.extend_from_slice(&run.to_be_bytes());
                    payload.extend_from_slice(&flags.to_be_bytes());
                    chunk(&mut stream, REPLY_TYPE_BLOCK_STATUS, cookie, &payload)?;
                }
                None => error_chunk(&mut stream, cookie)?,
            },
            CMD_DISC => return Ok(()),
            _ => error_chunk(&mut stream, cookie)?,
        }
    }
}

fn contains_query(data: &[u8], wanted: &str) -> bool {
    data.windows(wanted.len()).any(|w| w == wanted.as_bytes())
}

fn option_reply(stream: &mut UnixStream, option: u32, kind: u32, payload: &[u8]) -> io::Result<()> {
    let mut msg = REPLY_MAGIC.to_be_bytes().to_vec();
    msg.extend_from_slice(&option.to_be_bytes());
    msg.extend_from_slice(&kind.to_be_bytes());
    msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    msg.extend_from_slice(payload);
    stream.write_all(&msg)
}

fn chunk(stream: &mut UnixStream, kind: u16, cookie: u64, payload: &[u8]) -> io::Result<()> {
    let mut msg = STRUCTURED_REPLY_MAGIC.to_be_bytes().to_vec();
    msg.extend_from_slice(&REPLY_FLAG_DONE.to_be_bytes());
    msg.extend_from_slice(&kind.to_be_bytes());
    msg.extend_from_slice(&cookie.to_be_bytes());
    msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    msg.extend_from_slice(payload);
    stream.write_all(&msg)
}

fn error_chunk(stream: &mut UnixStream, cookie: u64) -> io::Result<()> {
    let mut payload = EINVAL.to_be_bytes().to_vec();
    payload.extend_from_slice(&0u16.to_be_bytes());
    chunk(stream, REPLY_TYPE_ERROR, cookie, &payload)
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

/// nbdkit stand-in: prints the VDDK version and host lines, writes its PID
/// to `--pidfile` and sleeps. `--dump-plugin` succeeds.
pub const FAKE_NBDKIT: &str = r#"#!/bin/sh
pidfile=""
while [ $# -gt 0 ]; do
  case "$1" in
    --dump-plugin) echo "name=vddk"; exit 0 ;;
    --pidfile) shift; pidfile="$1" ;;
  esac
  shift
done
echo "nbdkit: debug: VMware VixDiskLib (7.0.3) Release build-19513565"
echo "nbdkit: vddk[1]: debug: DISKLIB-LINK  : Opened 'vpxa-nfcssl://[ds] vm/vm.vmdk@esx1.example.com:902' (0xa): custom, 2048 sectors / 1 MB." >&2
echo $$ > "$pidfile"
exec sleep 30
"#;

/// Write [`FAKE_NBDKIT`] as an executable `nbdkit` in `dir`.
pub fn write_fake_nbdkit(dir: &Path) -> io::Result<PathBuf> {
    let path = dir.join("nbdkit");
    std::fs::write(&path, FAKE_NBDKIT)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
