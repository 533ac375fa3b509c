//! Serialize/deserialize 9P messages into/from binary.
//!
//! A message body starts with its type byte; the leading size field is handled
//! by the transport's length-delimited framing. Fields that only exist in
//! 9P2000.u are read and written when `dotu` is set.

use crate::{fcall::*, io_err, res};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;
use std::io::{Read, Result};
use std::mem;
use std::ops::Shl;

macro_rules! decode {
    ($decoder:expr) => {
        Decodable::decode(&mut $decoder)?
    };

    ($typ:ident, $buf:expr) => {
        $typ::from_bits_truncate(decode!($buf))
    };
}

fn read_exact<R: Read + ?Sized>(r: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; size];
    r.read_exact(&mut buf[..]).and(Ok(buf))
}

/// A serializing specific result to overload operators on `Result`
///
/// # Overloaded operators
/// <<, ?
pub struct SResult<T>(::std::io::Result<T>);

/// A wrapper class of WriteBytesExt to provide operator overloads
/// for serializing
///
/// Operator '<<' serializes the right hand side argument into
/// the left hand side encoder
#[derive(Clone, Debug)]
pub struct Encoder<W> {
    writer: W,
    bytes: usize,
}

impl<W: WriteBytesExt> Encoder<W> {
    pub fn new(writer: W) -> Encoder<W> {
        Encoder { writer, bytes: 0 }
    }

    /// Return total bytes written
    pub fn bytes_written(&self) -> usize {
        self.bytes
    }

    /// Encode data, equivalent to: encoder << data
    pub fn encode<T: Encodable + ?Sized>(&mut self, data: &T) -> Result<usize> {
        let bytes = data.encode(&mut self.writer)?;
        self.bytes += bytes;
        Ok(bytes)
    }

    /// Get inner writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for Encoder<W> {
    type Output = SResult<Encoder<W>>;
    fn shl(mut self, rhs: &'a T) -> Self::Output {
        match self.encode(rhs) {
            Ok(_) => SResult(Ok(self)),
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<'a, T: Encodable, W: WriteBytesExt> Shl<&'a T> for SResult<Encoder<W>> {
    type Output = Self;
    fn shl(self, rhs: &'a T) -> Self::Output {
        match self.0 {
            Ok(mut encoder) => match encoder.encode(rhs) {
                Ok(_) => SResult(Ok(encoder)),
                Err(e) => SResult(Err(e)),
            },
            Err(e) => SResult(Err(e)),
        }
    }
}

impl<W: WriteBytesExt> SResult<Encoder<W>> {
    fn bytes(self) -> Result<usize> {
        self.0.map(|enc| enc.bytes_written())
    }
}

/// Trait representing a type which can be serialized into binary
pub trait Encodable {
    /// Encode self to w and returns the number of bytes encoded
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize>;
}

impl Encodable for u8 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u8(*self).and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u16 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u16::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u32 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u32::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for u64 {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        w.write_u64::<LittleEndian>(*self)
            .and(Ok(mem::size_of::<Self>()))
    }
}

impl Encodable for String {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        bytes += w.write_all(self.as_bytes()).and(Ok(self.len()))?;
        Ok(bytes)
    }
}

impl Encodable for Qid {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        (Encoder::new(w) << &self.typ.bits() << &self.version << &self.path).bytes()
    }
}

impl Encodable for Data {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let size = self.0.len();
        let bytes = (size as u32).encode(w)? + size;
        w.write_all(&self.0)?;
        Ok(bytes)
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode<W: WriteBytesExt>(&self, w: &mut W) -> Result<usize> {
        let mut bytes = (self.len() as u16).encode(w)?;
        for data in self {
            bytes += data.encode(w)?;
        }
        Ok(bytes)
    }
}

/// Encode a stat, including its leading size field
pub fn encode_stat<W: WriteBytesExt>(w: &mut W, stat: &Stat, dotu: bool) -> Result<usize> {
    let mut bytes = (Encoder::new(&mut *w)
        << &stat.size(dotu)
        << &stat.typ
        << &stat.dev
        << &stat.qid
        << &stat.mode
        << &stat.atime
        << &stat.mtime
        << &stat.length
        << &stat.name
        << &stat.uid
        << &stat.gid
        << &stat.muid)
        .bytes()?;
    if dotu {
        bytes += (Encoder::new(&mut *w)
            << &stat.extension
            << &stat.n_uid
            << &stat.n_gid
            << &stat.n_muid)
            .bytes()?;
    }
    Ok(bytes)
}

/// Decode a stat, including its leading size field
pub fn decode_stat<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Stat> {
    let mut r = r;
    let _size: u16 = decode!(r);
    let mut stat = Stat {
        typ: decode!(r),
        dev: decode!(r),
        qid: decode!(r),
        mode: decode!(r),
        atime: decode!(r),
        mtime: decode!(r),
        length: decode!(r),
        name: decode!(r),
        uid: decode!(r),
        gid: decode!(r),
        muid: decode!(r),
        ..Default::default()
    };
    if dotu {
        stat.extension = decode!(r);
        stat.n_uid = decode!(r);
        stat.n_gid = decode!(r);
        stat.n_muid = decode!(r);
    }
    Ok(stat)
}

/// Encode a message body: type[1] tag[2] fields
pub fn encode_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, dotu: bool) -> Result<usize> {
    use crate::FCall::*;

    let typ = MsgType::from(&msg.body) as u8;
    let mut bytes = (Encoder::new(&mut *w) << &typ << &msg.tag).bytes()?;
    let mut buf = Encoder::new(&mut *w);

    match msg.body {
        TVersion { ref msize, ref version } | RVersion { ref msize, ref version } => {
            buf.encode(msize)?;
            buf.encode(version)?;
        }
        TAuth { ref afid, ref uname, ref aname, ref n_uname } => {
            buf.encode(afid)?;
            buf.encode(uname)?;
            buf.encode(aname)?;
            if dotu {
                buf.encode(n_uname)?;
            }
        }
        RAuth { ref aqid } => {
            buf.encode(aqid)?;
        }
        TAttach { ref fid, ref afid, ref uname, ref aname, ref n_uname } => {
            buf.encode(fid)?;
            buf.encode(afid)?;
            buf.encode(uname)?;
            buf.encode(aname)?;
            if dotu {
                buf.encode(n_uname)?;
            }
        }
        RAttach { ref qid } => {
            buf.encode(qid)?;
        }
        RError { ref ename, ref errno } => {
            buf.encode(ename)?;
            if dotu {
                buf.encode(errno)?;
            }
        }
        TFlush { ref oldtag } => {
            buf.encode(oldtag)?;
        }
        TWalk { ref fid, ref newfid, ref wnames } => {
            buf.encode(fid)?;
            buf.encode(newfid)?;
            buf.encode(wnames)?;
        }
        RWalk { ref wqids } => {
            buf.encode(wqids)?;
        }
        TOpen { ref fid, ref mode } => {
            buf.encode(fid)?;
            buf.encode(mode)?;
        }
        ROpen { ref qid, ref iounit } | RCreate { ref qid, ref iounit } => {
            buf.encode(qid)?;
            buf.encode(iounit)?;
        }
        TCreate { ref fid, ref name, ref perm, ref mode, ref extension } => {
            buf.encode(fid)?;
            buf.encode(name)?;
            buf.encode(perm)?;
            buf.encode(mode)?;
            if dotu {
                buf.encode(extension)?;
            }
        }
        TRead { ref fid, ref offset, ref count } => {
            buf.encode(fid)?;
            buf.encode(offset)?;
            buf.encode(count)?;
        }
        RRead { ref data } => {
            buf.encode(data)?;
        }
        TWrite { ref fid, ref offset, ref data } => {
            buf.encode(fid)?;
            buf.encode(offset)?;
            buf.encode(data)?;
        }
        RWrite { ref count } => {
            buf.encode(count)?;
        }
        TClunk { ref fid } | TRemove { ref fid } | TStat { ref fid } => {
            buf.encode(fid)?;
        }
        RStat { ref stat } => {
            buf.encode(&(stat.size(dotu) + 2))?;
            bytes += encode_stat(&mut buf.writer, stat, dotu)?;
        }
        TWStat { ref fid, ref stat } => {
            buf.encode(fid)?;
            buf.encode(&(stat.size(dotu) + 2))?;
            bytes += encode_stat(&mut buf.writer, stat, dotu)?;
        }
        RFlush | RClunk | RRemove | RWStat => {}
    };

    bytes += buf.bytes_written();
    Ok(bytes)
}

/// Trait representing a type which can be deserialized from binary
pub trait Decodable: Sized {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self>;
}

impl Decodable for u8 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u8()
    }
}

impl Decodable for u16 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u16::<LittleEndian>()
    }
}

impl Decodable for u32 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl Decodable for u64 {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl Decodable for String {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        String::from_utf8(read_exact(r, len as usize)?)
            .or(res!(io_err!(Other, "Invalid UTF-8 sequence")))
    }
}

impl Decodable for Qid {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        Ok(Qid {
            typ: decode!(QidType, *r),
            version: Decodable::decode(r)?,
            path: Decodable::decode(r)?,
        })
    }
}

impl Decodable for Data {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u32 = Decodable::decode(r)?;
        Ok(Data(read_exact(r, len as usize)?))
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode<R: ReadBytesExt>(r: &mut R) -> Result<Self> {
        let len: u16 = Decodable::decode(r)?;
        let mut buf = Vec::with_capacity(len as usize);
        for _ in 0..len {
            buf.push(Decodable::decode(r)?);
        }
        Ok(buf)
    }
}

/// Decode a message body: type[1] tag[2] fields
pub fn decode_msg<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Msg> {
    use crate::MsgType::*;

    let mut buf = r;

    let msg_type = MsgType::from_u8(decode!(buf));
    let tag = decode!(buf);
    let body = match msg_type {
        Some(TVersion) => FCall::TVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(RVersion) => FCall::RVersion {
            msize: decode!(buf),
            version: decode!(buf),
        },
        Some(TAuth) => FCall::TAuth {
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
            n_uname: if dotu { decode!(buf) } else { NOUID },
        },
        Some(RAuth) => FCall::RAuth { aqid: decode!(buf) },
        Some(TAttach) => FCall::TAttach {
            fid: decode!(buf),
            afid: decode!(buf),
            uname: decode!(buf),
            aname: decode!(buf),
            n_uname: if dotu { decode!(buf) } else { NOUID },
        },
        Some(RAttach) => FCall::RAttach { qid: decode!(buf) },
        Some(RError) => FCall::RError {
            ename: decode!(buf),
            errno: if dotu { decode!(buf) } else { 0 },
        },
        Some(TFlush) => FCall::TFlush {
            oldtag: decode!(buf),
        },
        Some(RFlush) => FCall::RFlush,
        Some(TWalk) => FCall::TWalk {
            fid: decode!(buf),
            newfid: decode!(buf),
            wnames: decode!(buf),
        },
        Some(RWalk) => FCall::RWalk {
            wqids: decode!(buf),
        },
        Some(TOpen) => FCall::TOpen {
            fid: decode!(buf),
            mode: decode!(buf),
        },
        Some(ROpen) => FCall::ROpen {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(TCreate) => FCall::TCreate {
            fid: decode!(buf),
            name: decode!(buf),
            perm: decode!(buf),
            mode: decode!(buf),
            extension: if dotu { decode!(buf) } else { String::new() },
        },
        Some(RCreate) => FCall::RCreate {
            qid: decode!(buf),
            iounit: decode!(buf),
        },
        Some(TRead) => FCall::TRead {
            fid: decode!(buf),
            offset: decode!(buf),
            count: decode!(buf),
        },
        Some(RRead) => FCall::RRead { data: decode!(buf) },
        Some(TWrite) => FCall::TWrite {
            fid: decode!(buf),
            offset: decode!(buf),
            data: decode!(buf),
        },
        Some(RWrite) => FCall::RWrite {
            count: decode!(buf),
        },
        Some(TClunk) => FCall::TClunk { fid: decode!(buf) },
        Some(RClunk) => FCall::RClunk,
        Some(TRemove) => FCall::TRemove { fid: decode!(buf) },
        Some(RRemove) => FCall::RRemove,
        Some(TStat) => FCall::TStat { fid: decode!(buf) },
        Some(RStat) => {
            let _n: u16 = decode!(buf);
            FCall::RStat {
                stat: decode_stat(buf, dotu)?,
            }
        }
        Some(TWStat) => {
            let fid = decode!(buf);
            let _n: u16 = decode!(buf);
            FCall::TWStat {
                fid,
                stat: decode_stat(buf, dotu)?,
            }
        }
        Some(RWStat) => FCall::RWStat,
        Some(TError) | None => return res!(io_err!(Other, "Invalid message type")),
    };

    Ok(Msg { tag, body })
}

/// Helper function to read a 9P message from a byte-oriented stream
pub fn read_msg<R: ReadBytesExt>(r: &mut R, dotu: bool) -> Result<Msg> {
    decode_msg(r, dotu)
}

/// Helper function to write a 9P message into a byte-oriented stream
pub fn write_msg<W: WriteBytesExt>(w: &mut W, msg: &Msg, dotu: bool) -> Result<usize> {
    encode_msg(w, msg, dotu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(body: FCall, dotu: bool) -> Msg {
        let msg = Msg { tag: 0xdead, body };
        let mut buf = Vec::new();
        let written = write_msg(&mut buf, &msg, dotu).unwrap();
        assert_eq!(written, buf.len());
        read_msg(&mut Cursor::new(buf), dotu).unwrap()
    }

    #[test]
    fn encoder_counts_bytes() {
        let expected: Vec<u8> = (0..10).collect();
        let mut encoder = Vec::new();
        for i in 0..10 {
            (i as u8).encode(&mut encoder).unwrap();
        }
        assert_eq!(expected, encoder);
    }

    #[test]
    fn version_message_layout() {
        let msg = Msg {
            tag: NOTAG,
            body: FCall::TVersion {
                msize: 8192,
                version: P92000U.to_owned(),
            },
        };
        let mut buf = Vec::new();
        write_msg(&mut buf, &msg, false).unwrap();
        assert_eq!(buf[0], MsgType::TVersion as u8);
        assert_eq!(&buf[1..3], &[0xff, 0xff]);
        assert_eq!(&buf[3..7], &8192u32.to_le_bytes());
        assert_eq!(&buf[7..9], &8u16.to_le_bytes());
        assert_eq!(&buf[9..], P92000U.as_bytes());
    }

    #[test]
    fn dotu_fields_follow_the_connection() {
        let attach = FCall::TAttach {
            fid: 1,
            afid: NOFID,
            uname: "bob".to_owned(),
            aname: String::new(),
            n_uname: 1000,
        };
        assert_eq!(roundtrip(attach.clone(), true).body, attach);

        match roundtrip(attach, false).body {
            FCall::TAttach { n_uname, .. } => assert_eq!(n_uname, NOUID),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stat_carries_its_size() {
        let stat = Stat {
            qid: Qid {
                typ: QidType::DIR,
                version: 1,
                path: 2,
            },
            mode: dm::DIR | 0o755,
            name: "dir".to_owned(),
            uid: "bob".to_owned(),
            n_uid: 1000,
            ..Default::default()
        };
        let mut buf = Vec::new();
        let n = encode_stat(&mut buf, &stat, true).unwrap();
        assert_eq!(n, stat.size(true) as usize + 2);
        assert_eq!(decode_stat(&mut Cursor::new(buf), true).unwrap(), stat);

        let msg = roundtrip(FCall::RStat { stat: stat.clone() }, true);
        assert_eq!(msg.body, FCall::RStat { stat });
    }

    #[test]
    fn unknown_type_is_rejected() {
        let buf = vec![MsgType::TError as u8, 0, 0];
        assert!(read_msg(&mut Cursor::new(buf), false).is_err());
    }
}
