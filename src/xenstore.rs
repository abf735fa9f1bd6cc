//! Hypervisor-store (configuration key/value tree) client.
//!
//! Deliberately out of the core per §1; implemented for real against the
//! documented xenstored wire protocol (a length-prefixed packet header
//! followed by NUL-terminated payload segments over a Unix socket), kept
//! behind a `Store` trait so the Frontend Handler never depends on the
//! concrete transport.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

const XENSTORED_SOCKET: &str = "/var/run/xenstored/socket";

const XS_READ: u32 = 2;
const XS_WRITE: u32 = 3;

#[repr(C)]
struct PacketHeader {
    ty: u32,
    req_id: u32,
    tx_id: u32,
    len: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connecting to xenstored at {XENSTORED_SOCKET}: {0}")]
    Connect(#[source] std::io::Error),
    #[error("xenstore i/o: {0}")]
    Io(#[source] std::io::Error),
    #[error("key {key} not found")]
    NotFound { key: String },
}

/// What the Frontend Handler needs from the hypervisor's configuration tree.
pub trait Store {
    fn read(&mut self, path: &str) -> Result<String, Error>;
    fn write(&mut self, path: &str, value: &str) -> Result<(), Error>;
}

/// Real xenstore client: one connection, request id incremented per call.
/// No transaction support: every call is its own implicit transaction
/// (`tx_id = 0`), which is all a single bind/publish sequence needs.
pub struct XenStore {
    conn: UnixStream,
    next_req_id: u32,
}

impl XenStore {
    pub fn connect() -> Result<XenStore, Error> {
        let conn = UnixStream::connect(XENSTORED_SOCKET).map_err(Error::Connect)?;
        Ok(XenStore {
            conn,
            next_req_id: 1,
        })
    }

    fn request(&mut self, ty: u32, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let req_id = self.next_req_id;
        self.next_req_id += 1;

        let header = PacketHeader {
            ty,
            req_id,
            tx_id: 0,
            len: payload.len() as u32,
        };
        let header_bytes: [u8; 16] = unsafe { std::mem::transmute(header) };
        self.conn.write_all(&header_bytes).map_err(Error::Io)?;
        self.conn.write_all(payload).map_err(Error::Io)?;

        let mut resp_header = [0u8; 16];
        self.conn.read_exact(&mut resp_header).map_err(Error::Io)?;
        let resp_len = u32::from_ne_bytes(resp_header[12..16].try_into().unwrap()) as usize;
        let mut body = vec![0u8; resp_len];
        self.conn.read_exact(&mut body).map_err(Error::Io)?;
        Ok(body)
    }
}

impl Store for XenStore {
    fn read(&mut self, path: &str) -> Result<String, Error> {
        let mut payload = path.as_bytes().to_vec();
        payload.push(0);
        let body = self.request(XS_READ, &payload)?;
        if body.is_empty() {
            return Err(Error::NotFound {
                key: path.to_string(),
            });
        }
        let s = String::from_utf8_lossy(&body)
            .trim_end_matches('\0')
            .to_string();
        Ok(s)
    }

    fn write(&mut self, path: &str, value: &str) -> Result<(), Error> {
        let mut payload = path.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(value.as_bytes());
        self.request(XS_WRITE, &payload)?;
        Ok(())
    }
}

/// Strip exactly one surrounding pair of ASCII single quotes, if present.
/// Does not recurse (`''a''` keeps its inner quotes).
pub fn strip_one_quote_pair(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'' {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
