//! A messaging endpoint with typed operations: bind/connect/attach,
//! picture send/recv, binary bsend/brecv, signal/wait, the ephemeral-port
//! bind grammar.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use qmq_core::fatal::fatal;
use qmq_core::{Context, Error, Frame, Message, Result, SocketType};

/// Lower bound of the IANA dynamic/private port range used by the `*`/`!`
/// bind grammar when no explicit range is given.
const EPHEMERAL_LOW: u16 = 0xC000;
/// Upper bound of the IANA dynamic/private port range.
const EPHEMERAL_HIGH: u16 = 0xFFFF;
/// Hard cap on a single `brecv` long-string or byte-array item.
const MAX_ITEM_SIZE: usize = 1024 * 1024;

/// A handle to an underlying transport endpoint, tagged with its type.
///
/// Carries the last bound/connected endpoint string and a scratch buffer
/// `brecv` reuses (growing by doubling) to materialise short strings
/// without a fresh allocation per call.
pub struct Socket {
    inner: zmq::Socket,
    ty: SocketType,
    endpoint: Option<String>,
    scratch: Vec<u8>,
}

impl Socket {
    /// Create a socket of type `ty` owned by `ctx`.
    pub fn new(ctx: &Context, ty: SocketType) -> Result<Self> {
        Ok(Self { inner: ctx.socket(ty)?, ty, endpoint: None, scratch: Vec::new() })
    }

    /// The socket's type.
    #[must_use]
    pub fn socket_type(&self) -> SocketType {
        self.ty
    }

    /// The last endpoint this socket successfully bound or connected to.
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Borrow the underlying zmq socket, e.g. to hand to a [`crate::poller::Poller`]
    /// or [`crate::reactor::Reactor`].
    #[must_use]
    pub fn raw(&self) -> &zmq::Socket {
        &self.inner
    }

    /// Connect to `endpoint`.
    pub fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.inner.connect(endpoint)?;
        self.endpoint = Some(endpoint.to_string());
        Ok(())
    }

    /// Bind to `endpoint`. Supports the literal `tcp://<host>:<port>` form
    /// and the ephemeral-port grammar `tcp://<host>:(*|!)([first?-last?])?`
    ///. Returns the bound port for the ephemeral form, `0` for
    /// a literal tcp endpoint or a non-tcp transport, or `-1` if no port in
    /// the range was free.
    pub fn bind(&mut self, endpoint: &str) -> Result<i32> {
        match parse_ephemeral(endpoint) {
            Some(spec) => self.bind_ephemeral(&spec),
            None => {
                self.inner.bind(endpoint)?;
                self.endpoint = Some(endpoint.to_string());
                Ok(0)
            }
        }
    }

    fn bind_ephemeral(&mut self, spec: &EphemeralSpec) -> Result<i32> {
        let span = u32::from(spec.high - spec.low) + 1;
        let offset = if spec.random_start { rand::random::<u32>() % span } else { 0 };
        for step in 0..span {
            let port = spec.low + ((offset + step) % span) as u16;
            let candidate = format!("tcp://{}:{port}", spec.host);
            match self.inner.bind(&candidate) {
                Ok(()) => {
                    self.endpoint = Some(candidate);
                    return Ok(i32::from(port));
                }
                Err(zmq::Error::EADDRINUSE) => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(-1)
    }

    /// Bind or connect every comma-separated element of `endpoints`. An
    /// element prefixed `@` is force-bound, `>` is force-connected; an
    /// unprefixed element follows `serverish`.
    pub fn attach(&mut self, endpoints: &str, serverish: bool) -> Result<()> {
        for raw in endpoints.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (bind_it, ep) = match raw.as_bytes()[0] {
                b'@' => (true, &raw[1..]),
                b'>' => (false, &raw[1..]),
                _ => (serverish, raw),
            };
            if bind_it {
                self.bind(ep)?;
            } else {
                self.connect(ep)?;
            }
        }
        Ok(())
    }

    /// Send a single 8-byte signal frame (see [`qmq_core::signal::signal`]).
    pub fn signal(&self, status: u8) -> Result<()> {
        qmq_core::signal::signal(&self.inner, status)
    }

    /// Wait for a matching signal (see [`qmq_core::signal::wait`]).
    pub fn wait(&self) -> Result<u8> {
        qmq_core::signal::wait(&self.inner)
    }

    /// If a partial message (`more` pending) is outstanding, drain and
    /// discard it.
    pub fn flush(&self) -> Result<()> {
        if !self.inner.get_rcvmore()? {
            return Ok(());
        }
        loop {
            let mut msg = zmq::Message::new();
            self.inner.recv(&mut msg, 0)?;
            if !msg.get_more() {
                return Ok(());
            }
        }
    }

    /// Send `args` according to `picture`. Each character of `picture`
    /// must match the variant of the corresponding [`Picture`]; a mismatch
    /// is a programmer error and aborts the process.
    pub fn send_picture(&mut self, picture: &str, args: Vec<Picture>) -> Result<()> {
        let chars: Vec<char> = picture.chars().collect();
        if chars.len() != args.len() {
            fatal(format!(
                "send_picture: picture '{picture}' names {} elements, got {} arguments",
                chars.len(),
                args.len()
            ));
        }
        let mut msg = Message::new();
        for (ch, arg) in chars.into_iter().zip(args) {
            match (ch, arg) {
                ('i', Picture::I(v)) => msg.append(Frame::from_str(&v.to_string())),
                ('u', Picture::U(v)) => msg.append(Frame::from_str(&v.to_string())),
                ('s', Picture::S(v)) => msg.append(Frame::from_str(&v)),
                ('b' | 'c', Picture::B(v)) => msg.append(Frame::new(v)),
                ('f', Picture::F(f)) => msg.append(f),
                ('p', Picture::P(v)) => msg.append(Frame::new((v as u64).to_be_bytes().to_vec())),
                ('z', Picture::Z) => msg.append(Frame::empty()),
                ('m', Picture::M(m)) => {
                    for f in m.frames() {
                        msg.append(f.clone());
                    }
                }
                (other, _) => fatal(format!("send_picture: argument doesn't match picture element '{other}'")),
            }
        }
        msg.send(&self.inner)
    }

    /// Receive one message and decode it according to `picture`. Missing
    /// trailing elements (a short message) are filled with the zero/empty
    /// value for their type rather than failing.
    pub fn recv_picture(&mut self, picture: &str) -> Result<Vec<Picture>> {
        let mut msg = Message::new();
        msg.recv(&self.inner)?;
        let mut out = Vec::with_capacity(picture.chars().count());
        for ch in picture.chars() {
            match ch {
                'i' => out.push(Picture::I(msg.popstr().and_then(|s| s.parse().ok()).unwrap_or(0))),
                'u' => out.push(Picture::U(msg.popstr().and_then(|s| s.parse().ok()).unwrap_or(0))),
                's' => out.push(Picture::S(msg.popstr().unwrap_or_default())),
                'b' | 'c' => out.push(Picture::B(msg.pop().map(|f| f.as_bytes().to_vec()).unwrap_or_default())),
                'f' => out.push(Picture::F(msg.pop().unwrap_or_else(Frame::empty))),
                'p' => {
                    let bytes = msg.pop().map(|f| f.as_bytes().to_vec()).unwrap_or_default();
                    let mut buf = [0u8; 8];
                    let n = bytes.len().min(8);
                    buf[8 - n..].copy_from_slice(&bytes[..n]);
                    out.push(Picture::P(u64::from_be_bytes(buf) as usize));
                }
                'z' => match msg.pop() {
                    Some(f) if f.is_empty() => out.push(Picture::Z),
                    Some(_) => return Err(Error::protocol("recv_picture: expected empty delimiter for 'z'")),
                    None => out.push(Picture::Z),
                },
                'm' => out.push(Picture::M(std::mem::take(&mut msg))),
                other => fatal(format!("recv_picture: unknown picture element '{other}'")),
            }
        }
        Ok(out)
    }

    /// Encode `args` according to the binary picture `picture` into a
    /// single data frame, with `f`/`m` elements appended as trailing
    /// frames (`m` must be the last element).
    pub fn bsend(&mut self, picture: &str, args: Vec<BinValue>) -> Result<()> {
        let chars: Vec<char> = picture.chars().collect();
        if chars.len() != args.len() {
            fatal(format!(
                "bsend: bpicture '{picture}' names {} elements, got {} arguments",
                chars.len(),
                args.len()
            ));
        }
        let mut data = Vec::new();
        let mut trailing_frames: Vec<Frame> = Vec::new();
        let mut trailing_msg: Option<Message> = None;
        let last = chars.len().saturating_sub(1);
        for (i, (ch, arg)) in chars.into_iter().zip(args).enumerate() {
            if ch == 'm' && i != last {
                fatal("bsend: 'm' must be the last bpicture element");
            }
            match (ch, arg) {
                ('1', BinValue::U8(v)) => data.push(v),
                ('2', BinValue::U16(v)) => data.write_u16::<BigEndian>(v).expect("write to Vec never fails"),
                ('4', BinValue::U32(v)) => data.write_u32::<BigEndian>(v).expect("write to Vec never fails"),
                ('8', BinValue::U64(v)) => data.write_u64::<BigEndian>(v).expect("write to Vec never fails"),
                ('s', BinValue::ShortStr(s)) => {
                    if s.len() > 255 {
                        return Err(Error::MessageTooLarge { size: s.len(), max: 255 });
                    }
                    data.push(s.len() as u8);
                    data.extend_from_slice(s.as_bytes());
                }
                ('S', BinValue::LongStr(s)) => {
                    data.write_u32::<BigEndian>(s.len() as u32).expect("write to Vec never fails");
                    data.extend_from_slice(s.as_bytes());
                }
                ('c', BinValue::Bytes(b)) => {
                    data.write_u32::<BigEndian>(b.len() as u32).expect("write to Vec never fails");
                    data.extend_from_slice(&b);
                }
                ('p', BinValue::Ptr(p)) => data.write_u64::<BigEndian>(p as u64).expect("write to Vec never fails"),
                ('f', BinValue::Frame(f)) => trailing_frames.push(f),
                ('m', BinValue::Msg(m)) => trailing_msg = Some(m),
                (other, _) => fatal(format!("bsend: argument doesn't match bpicture element '{other}'")),
            }
        }
        let mut out = Message::new();
        out.append(Frame::new(data));
        for f in trailing_frames {
            out.append(f);
        }
        if let Some(m) = trailing_msg {
            for f in m.frames() {
                out.append(f.clone());
            }
        }
        out.send(&self.inner)
    }

    /// Decode one message according to the binary picture `picture`.
    /// Strings over 255 bytes and byte arrays/long strings over 1 MiB
    /// fail the receive.
    pub fn brecv(&mut self, picture: &str) -> Result<Vec<BinValue>> {
        let mut msg = Message::new();
        msg.recv(&self.inner)?;
        let data_frame = msg.pop().ok_or_else(|| Error::protocol("brecv: missing data frame"))?;
        let mut cursor = data_frame.as_bytes();
        let chars: Vec<char> = picture.chars().collect();
        let last = chars.len().saturating_sub(1);
        let mut out = Vec::with_capacity(chars.len());
        for (i, ch) in chars.into_iter().enumerate() {
            match ch {
                '1' => out.push(BinValue::U8(
                    cursor.read_u8().map_err(|_| Error::invalid_frame("truncated u8"))?,
                )),
                '2' => out.push(BinValue::U16(
                    cursor.read_u16::<BigEndian>().map_err(|_| Error::invalid_frame("truncated u16"))?,
                )),
                '4' => out.push(BinValue::U32(
                    cursor.read_u32::<BigEndian>().map_err(|_| Error::invalid_frame("truncated u32"))?,
                )),
                '8' => out.push(BinValue::U64(
                    cursor.read_u64::<BigEndian>().map_err(|_| Error::invalid_frame("truncated u64"))?,
                )),
                's' => {
                    let len = cursor.read_u8().map_err(|_| Error::invalid_frame("truncated short string length"))? as usize;
                    out.push(BinValue::ShortStr(self.read_cached_str(&mut cursor, len)?));
                }
                'S' => {
                    let len = cursor
                        .read_u32::<BigEndian>()
                        .map_err(|_| Error::invalid_frame("truncated long string length"))? as usize;
                    if len > MAX_ITEM_SIZE {
                        return Err(Error::MessageTooLarge { size: len, max: MAX_ITEM_SIZE });
                    }
                    out.push(BinValue::LongStr(read_owned_string(&mut cursor, len)?));
                }
                'c' => {
                    let len = cursor
                        .read_u32::<BigEndian>()
                        .map_err(|_| Error::invalid_frame("truncated byte array length"))? as usize;
                    if len > MAX_ITEM_SIZE {
                        return Err(Error::MessageTooLarge { size: len, max: MAX_ITEM_SIZE });
                    }
                    out.push(BinValue::Bytes(read_owned_bytes(&mut cursor, len)?));
                }
                'p' => out.push(BinValue::Ptr(
                    cursor.read_u64::<BigEndian>().map_err(|_| Error::invalid_frame("truncated pointer"))? as usize,
                )),
                'f' => out.push(BinValue::Frame(
                    msg.pop().ok_or_else(|| Error::protocol("brecv: missing trailing frame for 'f'"))?,
                )),
                'm' => {
                    if i != last {
                        fatal("brecv: 'm' must be the last bpicture element");
                    }
                    out.push(BinValue::Msg(std::mem::take(&mut msg)));
                }
                other => fatal(format!("brecv: unknown bpicture element '{other}'")),
            }
        }
        Ok(out)
    }

    /// Decode a short string via the scratch cache, growing it by
    /// doubling when too small.
    fn read_cached_str(&mut self, cursor: &mut &[u8], len: usize) -> Result<String> {
        if cursor.len() < len {
            return Err(Error::invalid_frame("truncated short string"));
        }
        if self.scratch.len() < len {
            let mut cap = self.scratch.len().max(1);
            while cap < len {
                cap *= 2;
            }
            self.scratch.resize(cap, 0);
        }
        self.scratch[..len].copy_from_slice(&cursor[..len]);
        *cursor = &cursor[len..];
        String::from_utf8(self.scratch[..len].to_vec()).map_err(|_| Error::invalid_frame("short string is not valid utf-8"))
    }
}

fn read_owned_bytes(cursor: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    if cursor.len() < len {
        return Err(Error::invalid_frame("truncated payload"));
    }
    let (data, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(data.to_vec())
}

fn read_owned_string(cursor: &mut &[u8], len: usize) -> Result<String> {
    String::from_utf8(read_owned_bytes(cursor, len)?).map_err(|_| Error::invalid_frame("string is not valid utf-8"))
}

struct EphemeralSpec {
    host: String,
    random_start: bool,
    low: u16,
    high: u16,
}

/// Parse the `tcp://<host>:(*|!)([first?-last?])?` bind grammar. Returns
/// `None` for anything else (including a literal `tcp://host:port` or a
/// non-tcp endpoint), which callers treat as "bind literally".
fn parse_ephemeral(endpoint: &str) -> Option<EphemeralSpec> {
    let rest = endpoint.strip_prefix("tcp://")?;
    let colon = rest.rfind(':')?;
    let host = &rest[..colon];
    let port_spec = &rest[colon + 1..];
    let marker = port_spec.as_bytes().first().copied()?;
    if marker != b'*' && marker != b'!' {
        return None;
    }
    let range = &port_spec[1..];
    let (low, high) = if range.is_empty() {
        (EPHEMERAL_LOW, EPHEMERAL_HIGH)
    } else {
        let inner = range.strip_prefix('[')?.strip_suffix(']')?;
        let mut parts = inner.splitn(2, '-');
        let first = parts.next().unwrap_or("");
        let second = parts.next().unwrap_or("");
        let low = if first.is_empty() { EPHEMERAL_LOW } else { first.parse().ok()? };
        let high = if second.is_empty() { EPHEMERAL_HIGH } else { second.parse().ok()? };
        (low, high)
    };
    Some(EphemeralSpec { host: host.to_string(), random_start: marker == b'!', low, high })
}

/// One element of a picture send/recv call.
#[derive(Debug, Clone, PartialEq)]
pub enum Picture {
    /// `i` — signed integer as a decimal text frame.
    I(i64),
    /// `u` — unsigned integer as a decimal text frame.
    U(u64),
    /// `s` — null-terminated string.
    S(String),
    /// `b`/`c` — a byte array.
    B(Vec<u8>),
    /// `f` — a Frame, ownership transferred.
    F(Frame),
    /// `p` — a pointer-sized opaque value (inproc only).
    P(usize),
    /// `m` — all remaining frames as a Message.
    M(Message),
    /// `z` — an empty frame.
    Z,
}

/// One element of a binary bsend/brecv call.
#[derive(Debug, Clone, PartialEq)]
pub enum BinValue {
    /// `1` — 1-byte unsigned.
    U8(u8),
    /// `2` — 2-byte unsigned, big-endian.
    U16(u16),
    /// `4` — 4-byte unsigned, big-endian.
    U32(u32),
    /// `8` — 8-byte unsigned, big-endian.
    U64(u64),
    /// `s` — short string, length-prefixed by one byte, ≤ 255 bytes.
    ShortStr(String),
    /// `S` — long string, length-prefixed by four bytes, ≤ 1 MiB.
    LongStr(String),
    /// `c` — byte array, length-prefixed by four bytes, ≤ 1 MiB.
    Bytes(Vec<u8>),
    /// `p` — a pointer-sized opaque value.
    Ptr(usize),
    /// `f` — a trailing Frame.
    Frame(Frame),
    /// `m` — the trailing Message; must be the last bpicture element.
    Msg(Message),
}

#[cfg(test)]
mod tests {
    use super::*;
    use qmq_core::SocketType;

    fn pair(ctx: &Context, endpoint: &str) -> (Socket, Socket) {
        let mut a = Socket::new(ctx, SocketType::Pair).unwrap();
        a.bind(endpoint).unwrap();
        let mut b = Socket::new(ctx, SocketType::Pair).unwrap();
        b.connect(endpoint).unwrap();
        (a, b)
    }

    #[test]
    fn picture_round_trip() {
        let ctx = Context::new();
        let (mut a, mut b) = pair(&ctx, "inproc://socket-picture-test");

        a.send_picture(
            "isbfz",
            vec![
                Picture::I(-7),
                Picture::S("hello".into()),
                Picture::B(vec![1, 2, 3]),
                Picture::F(Frame::from_str("frame")),
                Picture::Z,
            ],
        )
        .unwrap();

        let got = b.recv_picture("isbfz").unwrap();
        assert_eq!(
            got,
            vec![
                Picture::I(-7),
                Picture::S("hello".into()),
                Picture::B(vec![1, 2, 3]),
                Picture::F(Frame::from_str("frame")),
                Picture::Z,
            ]
        );
    }

    #[test]
    fn picture_recv_short_message_fills_defaults() {
        let ctx = Context::new();
        let (mut a, mut b) = pair(&ctx, "inproc://socket-picture-short-test");

        a.send_picture("i", vec![Picture::I(9)]).unwrap();
        let got = b.recv_picture("is").unwrap();
        assert_eq!(got, vec![Picture::I(9), Picture::S(String::new())]);
    }

    #[test]
    fn binary_round_trip() {
        let ctx = Context::new();
        let (mut a, mut b) = pair(&ctx, "inproc://socket-bsend-test");

        a.bsend(
            "148sSc",
            vec![
                BinValue::U8(1),
                BinValue::U32(0xDEAD_BEEF),
                BinValue::U64(0x1122_3344_5566_7788),
                BinValue::ShortStr("short".into()),
                BinValue::LongStr("a longer string".into()),
                BinValue::Bytes(vec![9, 8, 7]),
            ],
        )
        .unwrap();

        let got = b.brecv("148sSc").unwrap();
        assert_eq!(
            got,
            vec![
                BinValue::U8(1),
                BinValue::U32(0xDEAD_BEEF),
                BinValue::U64(0x1122_3344_5566_7788),
                BinValue::ShortStr("short".into()),
                BinValue::LongStr("a longer string".into()),
                BinValue::Bytes(vec![9, 8, 7]),
            ]
        );
    }

    #[test]
    fn binary_recv_rejects_oversized_long_string() {
        // Hand-craft a data frame claiming a length beyond the 1 MiB cap.
        let ctx = Context::new();
        let (a, mut b) = pair(&ctx, "inproc://socket-bsend-oversize-test");

        let mut data = Vec::new();
        data.write_u32::<BigEndian>(2 * 1024 * 1024).unwrap();
        a.send(data, 0).unwrap();

        let err = b.brecv("S").unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
    }

    #[test]
    fn attach_parses_bind_and_connect_prefixes() {
        let ctx = Context::new();
        let mut server = Socket::new(&ctx, SocketType::Pull).unwrap();
        server.attach("@inproc://socket-attach-test", false).unwrap();

        let mut client = Socket::new(&ctx, SocketType::Push).unwrap();
        client.attach(">inproc://socket-attach-test", false).unwrap();

        client.inner.send("hi", 0).unwrap();
        assert_eq!(server.inner.recv_string(0).unwrap().unwrap(), "hi");
    }

    #[test]
    fn bind_ephemeral_grammar_returns_port_in_range() {
        let ctx = Context::new();
        let mut s = Socket::new(&ctx, SocketType::Pull).unwrap();
        let port = s.bind("tcp://127.0.0.1:*[20000-20100]").unwrap();
        assert!((20000..=20100).contains(&port));
    }
}
