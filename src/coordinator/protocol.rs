use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::modex::ModexData;
use crate::pmix::{
    PmixStatus, Proc, Range, Scope,
    info::{App, Info, get_strings, put_strings},
};

/// Upper bound on a single frame, to reject garbage length prefixes.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Wire protocol message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Hello = 1,
    Finalize = 2,
    Abort = 3,
    Fence = 4,
    GetModex = 5,
    JobInfo = 6,
    Publish = 7,
    Lookup = 8,
    Unpublish = 9,
    Spawn = 10,
    Connect = 11,
    Disconnect = 12,
    Status = 20,
    FenceRelease = 21,
    ModexResponse = 22,
    JobInfoResponse = 23,
    LookupResponse = 24,
    SpawnResponse = 25,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            1 => Ok(MessageType::Hello),
            2 => Ok(MessageType::Finalize),
            3 => Ok(MessageType::Abort),
            4 => Ok(MessageType::Fence),
            5 => Ok(MessageType::GetModex),
            6 => Ok(MessageType::JobInfo),
            7 => Ok(MessageType::Publish),
            8 => Ok(MessageType::Lookup),
            9 => Ok(MessageType::Unpublish),
            10 => Ok(MessageType::Spawn),
            11 => Ok(MessageType::Connect),
            12 => Ok(MessageType::Disconnect),
            20 => Ok(MessageType::Status),
            21 => Ok(MessageType::FenceRelease),
            22 => Ok(MessageType::ModexResponse),
            23 => Ok(MessageType::JobInfoResponse),
            24 => Ok(MessageType::LookupResponse),
            25 => Ok(MessageType::SpawnResponse),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// Client/server protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake: the first message on every connection
    Hello {
        nspace: String,
        rank: u32,
        credential: String,
    },
    Finalize,
    Abort {
        status: PmixStatus,
        message: String,
    },
    /// Fence arrival, carrying the caller's packed entries per shared scope
    Fence {
        ranges: Vec<Range>,
        collect: bool,
        data: Vec<(Scope, Bytes)>,
    },
    /// Direct modex request for one process
    GetModex {
        proc: Proc,
    },
    JobInfo,
    Publish {
        scope: Scope,
        infos: Vec<Info>,
    },
    Lookup {
        scope: Scope,
        keys: Vec<String>,
    },
    Unpublish {
        scope: Scope,
        keys: Vec<String>,
    },
    Spawn {
        apps: Vec<App>,
    },
    Connect {
        ranges: Vec<Range>,
    },
    Disconnect {
        ranges: Vec<Range>,
    },
    /// Plain completion status
    Status {
        status: PmixStatus,
    },
    FenceRelease {
        status: PmixStatus,
        participants: Vec<Proc>,
        data: Vec<ModexData>,
    },
    ModexResponse {
        status: PmixStatus,
        data: Vec<ModexData>,
    },
    JobInfoResponse {
        status: PmixStatus,
        infos: Vec<Info>,
    },
    LookupResponse {
        status: PmixStatus,
        infos: Vec<Info>,
        nspace: Option<String>,
    },
    SpawnResponse {
        status: PmixStatus,
        nspace: String,
    },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello { .. } => MessageType::Hello,
            Message::Finalize => MessageType::Finalize,
            Message::Abort { .. } => MessageType::Abort,
            Message::Fence { .. } => MessageType::Fence,
            Message::GetModex { .. } => MessageType::GetModex,
            Message::JobInfo => MessageType::JobInfo,
            Message::Publish { .. } => MessageType::Publish,
            Message::Lookup { .. } => MessageType::Lookup,
            Message::Unpublish { .. } => MessageType::Unpublish,
            Message::Spawn { .. } => MessageType::Spawn,
            Message::Connect { .. } => MessageType::Connect,
            Message::Disconnect { .. } => MessageType::Disconnect,
            Message::Status { .. } => MessageType::Status,
            Message::FenceRelease { .. } => MessageType::FenceRelease,
            Message::ModexResponse { .. } => MessageType::ModexResponse,
            Message::JobInfoResponse { .. } => MessageType::JobInfoResponse,
            Message::LookupResponse { .. } => MessageType::LookupResponse,
            Message::SpawnResponse { .. } => MessageType::SpawnResponse,
        }
    }

    /// Status carried by a response, `None` for requests.
    pub fn status(&self) -> Option<PmixStatus> {
        match self {
            Message::Status { status }
            | Message::FenceRelease { status, .. }
            | Message::ModexResponse { status, .. }
            | Message::JobInfoResponse { status, .. }
            | Message::LookupResponse { status, .. }
            | Message::SpawnResponse { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::Hello {
                nspace,
                rank,
                credential,
            } => {
                put_string(buf, nspace);
                buf.put_u32(*rank);
                put_string(buf, credential);
            }
            Message::Finalize | Message::JobInfo => {}
            Message::Abort { status, message } => {
                buf.put_i32(status.0);
                put_string(buf, message);
            }
            Message::Fence {
                ranges,
                collect,
                data,
            } => {
                put_ranges(buf, ranges);
                buf.put_u8(*collect as u8);
                buf.put_u32(data.len() as u32);
                for (scope, blob) in data {
                    buf.put_u8(*scope as u8);
                    put_bytes(buf, blob);
                }
            }
            Message::GetModex { proc } => put_proc(buf, proc),
            Message::Publish { scope, infos } => {
                buf.put_u8(*scope as u8);
                put_infos(buf, infos);
            }
            Message::Lookup { scope, keys } | Message::Unpublish { scope, keys } => {
                buf.put_u8(*scope as u8);
                put_strings(buf, keys);
            }
            Message::Spawn { apps } => {
                buf.put_u32(apps.len() as u32);
                for app in apps {
                    app.encode(buf);
                }
            }
            Message::Connect { ranges } | Message::Disconnect { ranges } => {
                put_ranges(buf, ranges);
            }
            Message::Status { status } => buf.put_i32(status.0),
            Message::FenceRelease {
                status,
                participants,
                data,
            } => {
                buf.put_i32(status.0);
                buf.put_u32(participants.len() as u32);
                for proc in participants {
                    put_proc(buf, proc);
                }
                put_modex(buf, data);
            }
            Message::ModexResponse { status, data } => {
                buf.put_i32(status.0);
                put_modex(buf, data);
            }
            Message::JobInfoResponse { status, infos } => {
                buf.put_i32(status.0);
                put_infos(buf, infos);
            }
            Message::LookupResponse {
                status,
                infos,
                nspace,
            } => {
                buf.put_i32(status.0);
                put_infos(buf, infos);
                match nspace {
                    Some(ns) => {
                        buf.put_u8(1);
                        put_string(buf, ns);
                    }
                    None => buf.put_u8(0),
                }
            }
            Message::SpawnResponse { status, nspace } => {
                buf.put_i32(status.0);
                put_string(buf, nspace);
            }
        }
    }

    fn decode_body(msg_type: MessageType, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(match msg_type {
            MessageType::Hello => {
                let nspace = get_string(buf)?;
                ensure(buf, 4)?;
                let rank = buf.get_u32();
                let credential = get_string(buf)?;
                Message::Hello {
                    nspace,
                    rank,
                    credential,
                }
            }
            MessageType::Finalize => Message::Finalize,
            MessageType::JobInfo => Message::JobInfo,
            MessageType::Abort => {
                let status = get_status(buf)?;
                let message = get_string(buf)?;
                Message::Abort { status, message }
            }
            MessageType::Fence => {
                let ranges = get_ranges(buf)?;
                ensure(buf, 5)?;
                let collect = buf.get_u8() != 0;
                let count = buf.get_u32() as usize;
                let data = (0..count)
                    .map(|_| {
                        let scope = get_scope(buf)?;
                        Ok((scope, get_bytes(buf)?))
                    })
                    .collect::<Result<_, ProtocolError>>()?;
                Message::Fence {
                    ranges,
                    collect,
                    data,
                }
            }
            MessageType::GetModex => Message::GetModex {
                proc: get_proc(buf)?,
            },
            MessageType::Publish => {
                let scope = get_scope(buf)?;
                let infos = get_infos(buf)?;
                Message::Publish { scope, infos }
            }
            MessageType::Lookup => {
                let scope = get_scope(buf)?;
                let keys = get_strings(buf)?;
                Message::Lookup { scope, keys }
            }
            MessageType::Unpublish => {
                let scope = get_scope(buf)?;
                let keys = get_strings(buf)?;
                Message::Unpublish { scope, keys }
            }
            MessageType::Spawn => {
                ensure(buf, 4)?;
                let count = buf.get_u32() as usize;
                let apps = (0..count)
                    .map(|_| App::decode(buf))
                    .collect::<Result<_, _>>()?;
                Message::Spawn { apps }
            }
            MessageType::Connect => Message::Connect {
                ranges: get_ranges(buf)?,
            },
            MessageType::Disconnect => Message::Disconnect {
                ranges: get_ranges(buf)?,
            },
            MessageType::Status => Message::Status {
                status: get_status(buf)?,
            },
            MessageType::FenceRelease => {
                let status = get_status(buf)?;
                ensure(buf, 4)?;
                let count = buf.get_u32() as usize;
                let participants = (0..count)
                    .map(|_| get_proc(buf))
                    .collect::<Result<_, _>>()?;
                let data = get_modex(buf)?;
                Message::FenceRelease {
                    status,
                    participants,
                    data,
                }
            }
            MessageType::ModexResponse => {
                let status = get_status(buf)?;
                let data = get_modex(buf)?;
                Message::ModexResponse { status, data }
            }
            MessageType::JobInfoResponse => {
                let status = get_status(buf)?;
                let infos = get_infos(buf)?;
                Message::JobInfoResponse { status, infos }
            }
            MessageType::LookupResponse => {
                let status = get_status(buf)?;
                let infos = get_infos(buf)?;
                ensure(buf, 1)?;
                let nspace = if buf.get_u8() != 0 {
                    Some(get_string(buf)?)
                } else {
                    None
                };
                Message::LookupResponse {
                    status,
                    infos,
                    nspace,
                }
            }
            MessageType::SpawnResponse => {
                let status = get_status(buf)?;
                let nspace = get_string(buf)?;
                Message::SpawnResponse { status, nspace }
            }
        })
    }
}

/// A message tagged with the id of the request it belongs to. Responses reuse
/// the id of their request.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub request_id: u64,
    pub message: Message,
}

impl Frame {
    pub fn new(request_id: u64, message: Message) -> Self {
        Self {
            request_id,
            message,
        }
    }

    /// Serialize frame to bytes, without the length prefix
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.message.message_type() as u8);
        buf.put_u64(self.request_id);
        self.message.encode_body(&mut buf);
        buf.freeze()
    }

    /// Deserialize frame from bytes, without the length prefix
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        ensure(&buf, 9)?;
        let msg_type = MessageType::try_from(buf.get_u8())?;
        let request_id = buf.get_u64();
        let message = Message::decode_body(msg_type, &mut buf)?;
        if buf.has_remaining() {
            return Err(ProtocolError::TrailingBytes(buf.remaining()));
        }
        Ok(Self {
            request_id,
            message,
        })
    }
}

/// Read one length-prefixed frame. Returns `None` if the stream closed
/// cleanly at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<Frame>, ProtocolError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(msg_len));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    Frame::decode(Bytes::from(msg_buf)).map(Some)
}

/// Write one frame with its length prefix
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let encoded = frame.encode();
    let mut out = BytesMut::with_capacity(4 + encoded.len());
    out.put_u32(encoded.len() as u32);
    out.put_slice(&encoded);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) fn ensure(buf: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < n {
        return Err(ProtocolError::IncompleteMessage);
    }
    Ok(())
}

pub(crate) fn put_bytes(buf: &mut impl BufMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub(crate) fn get_bytes(buf: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(buf, 4)?;
    let len = buf.get_u32() as usize;
    ensure(buf, len)?;
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub(crate) fn get_string(buf: &mut impl Buf) -> Result<String, ProtocolError> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn get_status(buf: &mut impl Buf) -> Result<PmixStatus, ProtocolError> {
    ensure(buf, 4)?;
    Ok(PmixStatus(buf.get_i32()))
}

fn get_scope(buf: &mut impl Buf) -> Result<Scope, ProtocolError> {
    ensure(buf, 1)?;
    let tag = buf.get_u8();
    Scope::try_from(tag).map_err(|_| ProtocolError::InvalidScope(tag))
}

pub(crate) fn put_proc(buf: &mut impl BufMut, proc: &Proc) {
    put_string(buf, &proc.nspace);
    buf.put_u32(proc.rank);
}

pub(crate) fn get_proc(buf: &mut impl Buf) -> Result<Proc, ProtocolError> {
    let nspace = get_string(buf)?;
    ensure(buf, 4)?;
    let rank = buf.get_u32();
    Ok(Proc { nspace, rank })
}

fn put_ranges(buf: &mut impl BufMut, ranges: &[Range]) {
    buf.put_u32(ranges.len() as u32);
    for range in ranges {
        put_string(buf, &range.nspace);
        buf.put_u32(range.ranks.len() as u32);
        for rank in &range.ranks {
            buf.put_u32(*rank);
        }
    }
}

fn get_ranges(buf: &mut impl Buf) -> Result<Vec<Range>, ProtocolError> {
    ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    (0..count)
        .map(|_| {
            let nspace = get_string(buf)?;
            ensure(buf, 4)?;
            let nranks = buf.get_u32() as usize;
            ensure(buf, nranks.saturating_mul(4))?;
            let ranks = (0..nranks).map(|_| buf.get_u32()).collect();
            Ok(Range { nspace, ranks })
        })
        .collect()
}

fn put_infos(buf: &mut impl BufMut, infos: &[Info]) {
    buf.put_u32(infos.len() as u32);
    for info in infos {
        info.encode(buf);
    }
}

fn get_infos(buf: &mut impl Buf) -> Result<Vec<Info>, ProtocolError> {
    ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    (0..count).map(|_| Info::decode(buf)).collect()
}

fn put_modex(buf: &mut impl BufMut, data: &[ModexData]) {
    buf.put_u32(data.len() as u32);
    for d in data {
        d.encode(buf);
    }
}

fn get_modex(buf: &mut impl Buf) -> Result<Vec<ModexData>, ProtocolError> {
    ensure(buf, 4)?;
    let count = buf.get_u32() as usize;
    (0..count).map(|_| ModexData::decode(buf)).collect()
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),
    #[error("Invalid data type: {0}")]
    InvalidDataType(u8),
    #[error("Invalid scope: {0}")]
    InvalidScope(u8),
    #[error("Incomplete message")]
    IncompleteMessage,
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("Invalid UTF-8 in message")]
    InvalidUtf8,
    #[error("Unexpected message: {0:?}")]
    UnexpectedMessage(MessageType),
}
