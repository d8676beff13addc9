//! The bit-exact on-wire framing. Every packet starts with an unencrypted
//! nine octet prefix; the body is a sealed box (OPEN, CHALLENGE, RESPONSE,
//! REJECT), an authenticated box (everything else) or, on unsafe routers,
//! plain octets. All multi-octet integers are big-endian except the varint.

use crate::crypto::{self, Nonce};
use crate::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

pub const PREFIX_SIZE: usize = 9;
pub const ENCRYPTED_FLAG: u8 = 0x80;
pub const CONTROL_MASK: u8 = 0x7F;

/// Largest payload assumed to pass the path unfragmented.
pub const DEFAULT_EMTU: usize = 516;
pub const EMTU_MIN: usize = 508;
pub const EMTU_MAX: usize = 1432;

/// Longest varint accepted for routing blobs and stream fields.
pub const VARINT_MAX_OCTETS: usize = 4;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PacketKind {
    Stream = 0x00,
    Open = 0x01,
    Challenge = 0x02,
    Response = 0x03,
    Forward = 0x04,
    Ping = 0x05,
    Renew = 0x06,
    RenewConfirm = 0x07,
    Notify = 0x08,
    NotifyConfirm = 0x09,
    Kill = 0x0A,
    KillConfirm = 0x0B,
    Reject = 0x0C,
}

impl PacketKind {
    /// Decodes the low seven bits of a control byte.
    #[inline]
    pub fn from_control(control: u8) -> Option<PacketKind> {
        match control & CONTROL_MASK {
            0x00 => Some(PacketKind::Stream),
            0x01 => Some(PacketKind::Open),
            0x02 => Some(PacketKind::Challenge),
            0x03 => Some(PacketKind::Response),
            0x04 => Some(PacketKind::Forward),
            0x05 => Some(PacketKind::Ping),
            0x06 => Some(PacketKind::Renew),
            0x07 => Some(PacketKind::RenewConfirm),
            0x08 => Some(PacketKind::Notify),
            0x09 => Some(PacketKind::NotifyConfirm),
            0x0A => Some(PacketKind::Kill),
            0x0B => Some(PacketKind::KillConfirm),
            0x0C => Some(PacketKind::Reject),
            _ => None,
        }
    }

    /// The smallest datagram this kind can legally arrive in. Fixed-size kinds
    /// must match exactly; STREAM, OPEN, FORWARD and REJECT may exceed it.
    pub fn min_len(self, encrypted: bool) -> usize {
        let overhead = if encrypted { crypto::MAC_SIZE } else { 0 };

        match self {
            // sub code + stream id varint
            PacketKind::Stream => PREFIX_SIZE + 2 + overhead,
            PacketKind::Open => {
                let body = if encrypted {
                    OpenBody::SIZE + crypto::SEAL_SIZE
                } else {
                    OpenBody::SIZE
                };
                PREFIX_SIZE + 2 + 1 + body + crypto::SIGN_SIZE
            }
            PacketKind::Challenge | PacketKind::Response => {
                let body = if encrypted {
                    OpenBody::SIZE + crypto::SEAL_SIZE
                } else {
                    OpenBody::SIZE
                };
                PREFIX_SIZE + body + crypto::SIGN_SIZE
            }
            PacketKind::Forward => PREFIX_SIZE + 1 + overhead,
            PacketKind::Ping => PREFIX_SIZE + PingBody::SIZE + overhead,
            PacketKind::Renew | PacketKind::RenewConfirm => {
                PREFIX_SIZE + RenewBody::SIZE + overhead
            }
            PacketKind::Notify
            | PacketKind::NotifyConfirm
            | PacketKind::Kill
            | PacketKind::KillConfirm => PREFIX_SIZE + TimestampBody::SIZE + overhead,
            PacketKind::Reject => {
                let seal = if encrypted { crypto::SEAL_SIZE } else { 0 };
                PREFIX_SIZE + 8 + 1 + 1 + seal
            }
        }
    }

    /// True for the kinds whose length is fully determined by the prefix.
    pub fn fixed_len(self) -> bool {
        match self {
            PacketKind::Stream | PacketKind::Open | PacketKind::Forward | PacketKind::Reject => {
                false
            }
            _ => true,
        }
    }
}

/// The unencrypted head of every datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Prefix {
    pub control: u8,
    pub id: u32,
    pub sequence: u32,
}

impl Prefix {
    #[inline]
    pub fn new(kind: PacketKind, encrypted: bool, id: u32, sequence: u32) -> Prefix {
        let mut control = kind as u8;
        if encrypted {
            control |= ENCRYPTED_FLAG;
        }

        Prefix { control, id, sequence }
    }

    #[inline]
    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::from_control(self.control)
    }

    #[inline]
    pub fn encrypted(&self) -> bool {
        self.control & ENCRYPTED_FLAG != 0
    }

    #[inline]
    pub fn read(buf: &[u8]) -> Option<Prefix> {
        if buf.len() < PREFIX_SIZE {
            return None;
        }

        let mut stream = Cursor::new(buf);
        let control = stream.read_u8().ok()?;
        let id = stream.read_u32::<BigEndian>().ok()?;
        let sequence = stream.read_u32::<BigEndian>().ok()?;

        Some(Prefix { control, id, sequence })
    }

    #[inline]
    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        stream.write_u8(self.control)?;
        stream.write_u32::<BigEndian>(self.id)?;
        stream.write_u32::<BigEndian>(self.sequence).map_err(Into::into)
    }
}

/// Writes a little-endian base-128 varint. Returns the number of octets
/// written, or 0 when the value does not fit in `max_octets`.
pub fn write_varint<W: Write>(mut stream: W, value: u32, max_octets: usize) -> usize {
    if max_octets == 0 || (max_octets < 5 && u64::from(value) >= 1u64 << (7 * max_octets)) {
        return 0;
    }

    let mut rest = value;
    let mut written = 0;

    loop {
        let octet = (rest & 0x7F) as u8;
        rest >>= 7;
        written += 1;

        let more = rest != 0;
        let octet = if more { octet | 0x80 } else { octet };

        if stream.write_u8(octet).is_err() {
            return 0;
        }

        if !more {
            return written;
        }
    }
}

/// Reads a little-endian base-128 varint. Returns the value and the number of
/// octets consumed, or None when the varint does not terminate within
/// `max_octets`.
pub fn read_varint(buf: &[u8], max_octets: usize) -> Option<(u32, usize)> {
    let mut value: u64 = 0;

    for (index, &octet) in buf.iter().enumerate() {
        if index >= max_octets {
            return None;
        }

        value |= u64::from(octet & 0x7F) << (7 * index);

        if octet & 0x80 == 0 {
            if value > u64::from(u32::max_value()) {
                return None;
            }
            return Some((value as u32, index + 1));
        }
    }

    None
}

/// Derives the per-packet nonce from the session nonce. The control byte
/// perturbs the first octet and the sequence number the four last ones, so a
/// ciphertext cannot be replayed under a different type or sequence.
#[inline]
pub fn derive_nonce(session: &Nonce, control: u8, sequence: u32) -> Nonce {
    let mut nonce = *session;

    nonce[0] = nonce[0].wrapping_add(control);

    let seq = sequence.to_be_bytes();
    // seq[3] is the low octet; it lands in the last nonce position.
    for k in 0..4 {
        let index = crypto::NONCE_SIZE - 1 - k;
        nonce[index] = nonce[index].wrapping_add(seq[3 - k]);
    }

    nonce
}

/// Inner body of OPEN and CHALLENGE packets. The hash binds the clear part of
/// the datagram to the sealed part.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenBody {
    pub hash: [u8; crypto::HASH_SIZE],
    pub reply_id: u32,
    pub timestamp: u64,
    pub nonce: Nonce,
    pub public_key: [u8; crypto::KEY_SIZE],
    pub max_currency: u32,
    pub currency_regen: u32,
    pub max_streams: u32,
    pub max_message_size: u32,
}

impl OpenBody {
    pub const SIZE: usize = 116;

    /// Parse the supplied stream as an open body.
    pub fn read<R: Read>(mut stream: R) -> NetworkResult<OpenBody> {
        let mut hash = [0u8; crypto::HASH_SIZE];
        stream.read_exact(&mut hash)?;

        let reply_id = stream.read_u32::<BigEndian>()?;
        let timestamp = stream.read_u64::<BigEndian>()?;

        let mut nonce = [0u8; crypto::NONCE_SIZE];
        stream.read_exact(&mut nonce)?;

        let mut public_key = [0u8; crypto::KEY_SIZE];
        stream.read_exact(&mut public_key)?;

        Ok(OpenBody {
            hash,
            reply_id,
            timestamp,
            nonce,
            public_key,
            max_currency: stream.read_u32::<BigEndian>()?,
            currency_regen: stream.read_u32::<BigEndian>()?,
            max_streams: stream.read_u32::<BigEndian>()?,
            max_message_size: stream.read_u32::<BigEndian>()?,
        })
    }

    /// Write the open body to the supplied stream.
    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        stream.write_all(&self.hash)?;
        stream.write_u32::<BigEndian>(self.reply_id)?;
        stream.write_u64::<BigEndian>(self.timestamp)?;
        stream.write_all(&self.nonce)?;
        stream.write_all(&self.public_key)?;
        stream.write_u32::<BigEndian>(self.max_currency)?;
        stream.write_u32::<BigEndian>(self.currency_regen)?;
        stream.write_u32::<BigEndian>(self.max_streams)?;
        stream
            .write_u32::<BigEndian>(self.max_message_size)
            .map_err(Into::into)
    }
}

/// Ping body. The responder echoes random and timestamp verbatim; the
/// remaining fields are informational.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PingBody {
    pub random: Nonce,
    pub timestamp: u64,
    pub rtt_ms: u32,
    pub sent: u32,
    pub received: u32,
}

impl PingBody {
    pub const SIZE: usize = 44;

    pub fn read<R: Read>(mut stream: R) -> NetworkResult<PingBody> {
        let mut random = [0u8; crypto::NONCE_SIZE];
        stream.read_exact(&mut random)?;

        Ok(PingBody {
            random,
            timestamp: stream.read_u64::<BigEndian>()?,
            rtt_ms: stream.read_u32::<BigEndian>()?,
            sent: stream.read_u32::<BigEndian>()?,
            received: stream.read_u32::<BigEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        stream.write_all(&self.random)?;
        stream.write_u64::<BigEndian>(self.timestamp)?;
        stream.write_u32::<BigEndian>(self.rtt_ms)?;
        stream.write_u32::<BigEndian>(self.sent)?;
        stream.write_u32::<BigEndian>(self.received).map_err(Into::into)
    }
}

/// Body of RENEW and RENEW_CONFIRM: the replacement session nonce.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RenewBody {
    pub timestamp: u64,
    pub nonce: Nonce,
}

impl RenewBody {
    pub const SIZE: usize = 32;

    pub fn read<R: Read>(mut stream: R) -> NetworkResult<RenewBody> {
        let timestamp = stream.read_u64::<BigEndian>()?;
        let mut nonce = [0u8; crypto::NONCE_SIZE];
        stream.read_exact(&mut nonce)?;

        Ok(RenewBody { timestamp, nonce })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        stream.write_u64::<BigEndian>(self.timestamp)?;
        stream.write_all(&self.nonce).map_err(Into::into)
    }
}

/// Body of NOTIFY, KILL and their confirmations.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimestampBody {
    pub timestamp: u64,
}

impl TimestampBody {
    pub const SIZE: usize = 8;

    pub fn read<R: Read>(mut stream: R) -> NetworkResult<TimestampBody> {
        Ok(TimestampBody {
            timestamp: stream.read_u64::<BigEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        stream.write_u64::<BigEndian>(self.timestamp).map_err(Into::into)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RejectCode {
    Unknown = 0,
    Busy = 1,
    Version = 2,
    Unsafe = 3,
    Invalid = 4,
    Violation = 5,
    User = 6,
    ServerError = 7,
}

impl RejectCode {
    #[inline]
    pub fn from_u8(code: u8) -> RejectCode {
        match code {
            1 => RejectCode::Busy,
            2 => RejectCode::Version,
            3 => RejectCode::Unsafe,
            4 => RejectCode::Invalid,
            5 => RejectCode::Violation,
            6 => RejectCode::User,
            7 => RejectCode::ServerError,
            _ => RejectCode::Unknown,
        }
    }
}

/// Reject body: timestamp, one code octet and a NUL-terminated UTF-8 message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RejectBody {
    pub timestamp: u64,
    pub code: RejectCode,
    pub message: String,
}

impl RejectBody {
    pub fn read(buf: &[u8]) -> NetworkResult<RejectBody> {
        let mut stream = Cursor::new(buf);
        let timestamp = stream.read_u64::<BigEndian>()?;
        let code = RejectCode::from_u8(stream.read_u8()?);

        let rest = &buf[stream.position() as usize..];
        let terminator = rest
            .iter()
            .position(|&octet| octet == 0)
            .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        let message = ::std::str::from_utf8(&rest[..terminator])
            .map_err(|_| NetworkError::Fatal(ErrorType::MalformedPacket))?
            .to_owned();

        Ok(RejectBody { timestamp, code, message })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        stream.write_u64::<BigEndian>(self.timestamp)?;
        stream.write_u8(self.code as u8)?;
        stream.write_all(self.message.as_bytes())?;
        stream.write_u8(0).map_err(Into::into)
    }
}

/// Key material for an authenticated box in one direction.
pub struct BoxCtx<'a> {
    pub nonce: &'a Nonce,
    pub public_key: &'a [u8; crypto::KEY_SIZE],
    pub secret_key: &'a [u8; crypto::SECRET_KEY_SIZE],
}

/// Frames a plain body into `prefix || crypto_box(body)` under the per-packet
/// derived nonce. With no context the body travels in the clear and the
/// encrypted flag stays low (unsafe routers only).
pub fn mk_boxed(
    kind: PacketKind,
    id: u32,
    sequence: u32,
    plain: &[u8],
    ctx: Option<&BoxCtx>,
) -> NetworkResult<Vec<u8>> {
    let prefix = Prefix::new(kind, ctx.is_some(), id, sequence);

    let mut out = Vec::with_capacity(PREFIX_SIZE + plain.len() + crypto::MAC_SIZE);
    prefix.write(&mut out)?;

    match ctx {
        Some(ctx) => {
            let nonce = derive_nonce(ctx.nonce, prefix.control, sequence);
            let start = out.len();
            out.resize(start + plain.len() + crypto::MAC_SIZE, 0);

            if !crypto::box_encrypt(
                &mut out[start..],
                plain,
                &nonce,
                ctx.public_key,
                ctx.secret_key,
            ) {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
        }
        None => out.extend_from_slice(plain),
    }

    Ok(out)
}

/// Opens the boxed region of a datagram framed by `mk_boxed`. The nonce is
/// derived from the *sender's* session nonce as recorded by the receiver.
pub fn un_boxed(datagram: &[u8], prefix: &Prefix, ctx: Option<&BoxCtx>) -> NetworkResult<Vec<u8>> {
    let body = &datagram[PREFIX_SIZE..];

    match ctx {
        Some(ctx) => {
            if body.len() < crypto::MAC_SIZE {
                return Err(NetworkError::Fatal(ErrorType::MalformedPacket));
            }

            let nonce = derive_nonce(ctx.nonce, prefix.control, prefix.sequence);
            let mut plain = vec![0u8; body.len() - crypto::MAC_SIZE];

            if !crypto::box_open(&mut plain, body, &nonce, ctx.public_key, ctx.secret_key) {
                return Err(NetworkError::Fatal(ErrorType::AuthFailure));
            }

            Ok(plain)
        }
        None => Ok(body.to_vec()),
    }
}

fn seal_body(out: &mut Vec<u8>, body: &OpenBody, key: Option<&[u8; crypto::KEY_SIZE]>) -> NetworkResult<()> {
    let mut plain = [0u8; OpenBody::SIZE];
    body.write(&mut plain[..])?;

    match key {
        Some(key) => {
            let start = out.len();
            out.resize(start + OpenBody::SIZE + crypto::SEAL_SIZE, 0);
            if !crypto::seal(&mut out[start..], &plain, key) {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
        }
        None => out.extend_from_slice(&plain),
    }

    Ok(())
}

fn append_signature(
    out: &mut Vec<u8>,
    bound: Option<&[u8]>,
    sign_key: Option<&[u8; crypto::SIGN_SECRET_KEY_SIZE]>,
) -> NetworkResult<()> {
    match sign_key {
        Some(key) => {
            let mut signature = [0u8; crypto::SIGN_SIZE];

            let signed: Vec<u8> = match bound {
                Some(prior) => {
                    let mut region = Vec::with_capacity(prior.len() + out.len());
                    region.extend_from_slice(prior);
                    region.extend_from_slice(out);
                    region
                }
                None => out.clone(),
            };

            if !crypto::sign(&mut signature, &signed, key) {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }

            out.extend_from_slice(&signature);
        }
        // Signing disabled: the signature region is zero-filled.
        None => out.extend_from_slice(&[0u8; crypto::SIGN_SIZE]),
    }

    Ok(())
}

/// Builds an OPEN datagram. The prefix id is always zero; the responder learns
/// where to address replies from `body.reply_id`. The hash field is computed
/// here over the clear head of the datagram.
pub fn mk_open(
    sequence: u32,
    version: u16,
    routing: &[u8],
    body: &OpenBody,
    open_key: Option<&[u8; crypto::KEY_SIZE]>,
    sign_key: Option<&[u8; crypto::SIGN_SECRET_KEY_SIZE]>,
) -> NetworkResult<Vec<u8>> {
    let prefix = Prefix::new(PacketKind::Open, open_key.is_some(), 0, sequence);

    let mut out = Vec::with_capacity(PacketKind::Open.min_len(open_key.is_some()) + routing.len());
    prefix.write(&mut out)?;
    out.write_u16::<BigEndian>(version)?;

    if write_varint(&mut out, routing.len() as u32, VARINT_MAX_OCTETS) == 0 {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }
    out.extend_from_slice(routing);

    let mut bound = body.clone();
    crypto::generichash(&mut bound.hash, &out);

    seal_body(&mut out, &bound, open_key)?;
    append_signature(&mut out, None, sign_key)?;

    Ok(out)
}

/// Builds a CHALLENGE datagram. The signature is computed over the OPEN
/// datagram being answered followed by the challenge itself, binding the two
/// together.
pub fn mk_challenge(
    id: u32,
    sequence: u32,
    body: &OpenBody,
    peer_key: Option<&[u8; crypto::KEY_SIZE]>,
    sign_key: Option<&[u8; crypto::SIGN_SECRET_KEY_SIZE]>,
    open_datagram: &[u8],
) -> NetworkResult<Vec<u8>> {
    let prefix = Prefix::new(PacketKind::Challenge, peer_key.is_some(), id, sequence);

    let mut out = Vec::with_capacity(PacketKind::Challenge.min_len(peer_key.is_some()));
    prefix.write(&mut out)?;

    let mut bound = body.clone();
    crypto::generichash(&mut bound.hash, &out[..PREFIX_SIZE]);

    seal_body(&mut out, &bound, peer_key)?;
    append_signature(&mut out, Some(open_datagram), sign_key)?;

    Ok(out)
}

/// A parsed but still sealed OPEN or CHALLENGE datagram.
pub struct Handshake<'a> {
    pub prefix: Prefix,
    pub version: u16,
    pub routing: &'a [u8],
    datagram: &'a [u8],
    body_offset: usize,
    signature_offset: usize,
}

impl<'a> Handshake<'a> {
    /// Structural parse of an OPEN datagram: lengths, version field, routing
    /// varint. No cryptography happens here.
    pub fn parse_open(datagram: &'a [u8]) -> NetworkResult<Handshake<'a>> {
        let prefix = Prefix::read(datagram).ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        if prefix.kind() != Some(PacketKind::Open) {
            return Err(NetworkError::Fatal(ErrorType::MalformedPacket));
        }

        let mut stream = Cursor::new(&datagram[PREFIX_SIZE..]);
        let version = stream.read_u16::<BigEndian>()?;

        let at = PREFIX_SIZE + stream.position() as usize;
        let (routing_len, varint_len) = read_varint(&datagram[at..], VARINT_MAX_OCTETS)
            .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        let routing_start = at + varint_len;
        let body_offset = routing_start
            .checked_add(routing_len as usize)
            .ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        let body_len = if prefix.encrypted() {
            OpenBody::SIZE + crypto::SEAL_SIZE
        } else {
            OpenBody::SIZE
        };

        let signature_offset = body_offset + body_len;
        if datagram.len() != signature_offset + crypto::SIGN_SIZE {
            return Err(NetworkError::Fatal(ErrorType::MalformedPacket));
        }

        Ok(Handshake {
            prefix,
            version,
            routing: &datagram[routing_start..body_offset],
            datagram,
            body_offset,
            signature_offset,
        })
    }

    /// Structural parse of a CHALLENGE or RESPONSE datagram.
    pub fn parse_challenge(datagram: &'a [u8]) -> NetworkResult<Handshake<'a>> {
        let prefix = Prefix::read(datagram).ok_or(NetworkError::Fatal(ErrorType::MalformedPacket))?;

        match prefix.kind() {
            Some(PacketKind::Challenge) | Some(PacketKind::Response) => (),
            _ => return Err(NetworkError::Fatal(ErrorType::MalformedPacket)),
        }

        let body_len = if prefix.encrypted() {
            OpenBody::SIZE + crypto::SEAL_SIZE
        } else {
            OpenBody::SIZE
        };

        let signature_offset = PREFIX_SIZE + body_len;
        if datagram.len() != signature_offset + crypto::SIGN_SIZE {
            return Err(NetworkError::Fatal(ErrorType::MalformedPacket));
        }

        Ok(Handshake {
            prefix,
            version: 0,
            routing: &datagram[..0],
            datagram,
            body_offset: PREFIX_SIZE,
            signature_offset,
        })
    }

    /// The region covered by the detached signature.
    #[inline]
    pub fn signed_region(&self) -> &[u8] {
        &self.datagram[..self.signature_offset]
    }

    #[inline]
    pub fn signature(&self) -> &[u8] {
        &self.datagram[self.signature_offset..]
    }

    /// True when the signature region is all zero, i.e. the sender did not
    /// sign.
    #[inline]
    pub fn unsigned(&self) -> bool {
        self.signature().iter().all(|&octet| octet == 0)
    }

    /// Verifies the detached signature. `bound` carries the saved OPEN
    /// datagram when validating a CHALLENGE.
    pub fn verify(&self, key: &[u8; crypto::SIGN_KEY_SIZE], bound: Option<&[u8]>) -> bool {
        match bound {
            Some(prior) => {
                let mut region = Vec::with_capacity(prior.len() + self.signature_offset);
                region.extend_from_slice(prior);
                region.extend_from_slice(self.signed_region());
                crypto::verify(self.signature(), &region, key)
            }
            None => crypto::verify(self.signature(), self.signed_region(), key),
        }
    }

    /// Unseals (or, on unsafe routers, reads) the inner body and validates the
    /// hash binding against the clear head of the datagram.
    pub fn body(&self, pair: Option<&crypto::BoxKeyPair>) -> NetworkResult<OpenBody> {
        let region = &self.datagram[self.body_offset..self.signature_offset];

        let body = if self.prefix.encrypted() {
            let pair = pair.ok_or(NetworkError::Fatal(ErrorType::Crypto))?;
            let mut plain = [0u8; OpenBody::SIZE];

            if !crypto::seal_open(&mut plain, region, &pair.public, &pair.secret) {
                return Err(NetworkError::Fatal(ErrorType::AuthFailure));
            }

            OpenBody::read(&plain[..])?
        } else {
            OpenBody::read(region)?
        };

        let mut expected = [0u8; crypto::HASH_SIZE];
        crypto::generichash(&mut expected, &self.datagram[..self.body_offset]);

        if body.hash != expected {
            return Err(NetworkError::Fatal(ErrorType::AuthFailure));
        }

        Ok(body)
    }
}

/// Builds a REJECT datagram. Sealed to the peer key when one is known, clear
/// otherwise (rejects of unknown senders precede any key exchange).
pub fn mk_reject(
    id: u32,
    sequence: u32,
    body: &RejectBody,
    peer_key: Option<&[u8; crypto::KEY_SIZE]>,
) -> NetworkResult<Vec<u8>> {
    let prefix = Prefix::new(PacketKind::Reject, peer_key.is_some(), id, sequence);

    let mut plain = Vec::with_capacity(8 + 1 + body.message.len() + 1);
    body.write(&mut plain)?;

    let mut out = Vec::with_capacity(PREFIX_SIZE + plain.len() + crypto::SEAL_SIZE);
    prefix.write(&mut out)?;

    match peer_key {
        Some(key) => {
            let start = out.len();
            out.resize(start + plain.len() + crypto::SEAL_SIZE, 0);
            if !crypto::seal(&mut out[start..], &plain, key) {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
        }
        None => out.extend_from_slice(&plain),
    }

    Ok(out)
}

/// Opens a REJECT datagram.
pub fn un_reject(
    datagram: &[u8],
    prefix: &Prefix,
    pair: Option<&crypto::BoxKeyPair>,
) -> NetworkResult<RejectBody> {
    let region = &datagram[PREFIX_SIZE..];

    if prefix.encrypted() {
        let pair = pair.ok_or(NetworkError::Fatal(ErrorType::Crypto))?;

        if region.len() <= crypto::SEAL_SIZE {
            return Err(NetworkError::Fatal(ErrorType::MalformedPacket));
        }

        let mut plain = vec![0u8; region.len() - crypto::SEAL_SIZE];
        if !crypto::seal_open(&mut plain, region, &pair.public, &pair.secret) {
            return Err(NetworkError::Fatal(ErrorType::AuthFailure));
        }

        RejectBody::read(&plain)
    } else {
        RejectBody::read(region)
    }
}
