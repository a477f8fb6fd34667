use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::{PROTOCOL_MAGIC, PROTOCOL_VERSION};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use undertow::crypto;

/// Outer header: magic u32, version u8, flags u16, session u16, sequence u24, length u16.
pub const HEADER_SIZE: usize = 14;

/// Detached integrity tag trailing every datagram.
pub const TAG_SIZE: usize = crypto::MAC_SIZE;

/// Size of the optional truncated sent-time field leading the body.
pub const SENT_TIME_SIZE: usize = 2;

/// Fixed per-datagram framing overhead: header plus tag.
pub const OVERHEAD_SIZE: usize = HEADER_SIZE + TAG_SIZE;

/// Header flag word bits.
pub mod flags {
    /// Body commands are DEFLATE-compressed.
    pub const COMPRESSED: u16 = 1 << 0;
    /// Body is AEAD-sealed under the session keys (clear only during the handshake).
    pub const SEALED: u16 = 1 << 1;
    /// At least one command in the body is a fragment.
    pub const FRAGMENTED: u16 = 1 << 2;
    /// At least one command in the body is an ack.
    pub const CARRIES_ACK: u16 = 1 << 3;
    /// The body leads with a truncated sent-time echoable by acks.
    pub const SENT_TIME: u16 = 1 << 4;

    pub const ALL: u16 = COMPRESSED | SEALED | FRAGMENTED | CARRIES_ACK | SENT_TIME;
}

/// Session id carried before the listener has assigned one.
pub const SESSION_UNASSIGNED: u16 = u16::max_value();

const SEQUENCE_WINDOW: u64 = 1 << 24;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub flags: u16,
    /// Receiver-side peer slot, `SESSION_UNASSIGNED` during connect.
    pub session: u16,
    /// Low 24 bits of the per-direction datagram counter.
    pub sequence: u32,
    /// Body length between header and tag.
    pub length: u16,
}

impl Header {
    #[inline]
    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    fn write(&self, out: &mut [u8; HEADER_SIZE]) {
        let mut stream = Cursor::new(&mut out[..]);

        stream.write_u32::<BigEndian>(PROTOCOL_MAGIC).expect("header write");
        stream.write_u8(PROTOCOL_VERSION).expect("header write");
        stream.write_u16::<BigEndian>(self.flags).expect("header write");
        stream.write_u16::<BigEndian>(self.session).expect("header write");
        stream
            .write_u24::<BigEndian>(self.sequence & 0x00ff_ffff)
            .expect("header write");
        stream.write_u16::<BigEndian>(self.length).expect("header write");
    }
}

/// Parses and validates the outer header of a raw datagram. The magic is checked before
/// anything else so unrelated traffic on the port is cheap to discard.
pub fn parse_header(data: &[u8]) -> NetworkResult<Header> {
    if data.len() < OVERHEAD_SIZE {
        return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
    }

    let mut stream = Cursor::new(data);

    if stream.read_u32::<BigEndian>()? != PROTOCOL_MAGIC {
        return Err(NetworkError::Fatal(ErrorType::MagicMismatch));
    }

    if stream.read_u8()? != PROTOCOL_VERSION {
        return Err(NetworkError::Fatal(ErrorType::VersionMismatch));
    }

    let header = Header {
        flags: stream.read_u16::<BigEndian>()?,
        session: stream.read_u16::<BigEndian>()?,
        sequence: stream.read_u24::<BigEndian>()?,
        length: stream.read_u16::<BigEndian>()?,
    };

    if header.flags & !flags::ALL != 0 {
        return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
    }

    if data.len() != HEADER_SIZE + header.length as usize + TAG_SIZE {
        return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
    }

    if header.has(flags::SENT_TIME) && (header.length as usize) < SENT_TIME_SIZE {
        return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
    }

    Ok(header)
}

/// Assembles a complete datagram: header, optional sent-time, body, integrity tag. With
/// a key the body (sent-time included) is AEAD-sealed with the header as additional
/// data; without one a BLAKE2b checksum closes the datagram instead.
pub fn seal(
    out: &mut Vec<u8>,
    header: &mut Header,
    sent_time: Option<u16>,
    body: &[u8],
    key: Option<&[u8; crypto::KEY_SIZE]>,
    nonce: u64,
) -> NetworkResult<()> {
    let mut length = body.len();

    if sent_time.is_some() {
        header.flags |= flags::SENT_TIME;
        length += SENT_TIME_SIZE;
    }

    if length > u16::max_value() as usize {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    if key.is_some() {
        header.flags |= flags::SEALED;
    }

    header.length = length as u16;

    out.clear();
    out.reserve(HEADER_SIZE + length + TAG_SIZE);

    let mut header_bytes = [0u8; HEADER_SIZE];
    header.write(&mut header_bytes);
    out.extend_from_slice(&header_bytes);

    if let Some(time) = sent_time {
        out.extend_from_slice(&time.to_be_bytes());
    }
    out.extend_from_slice(body);

    match key {
        Some(key) => {
            let mut mac = [0u8; TAG_SIZE];
            let plain = out[HEADER_SIZE..].to_vec();

            if !crypto::seal(
                &mut out[HEADER_SIZE..],
                &mut mac,
                &plain,
                &header_bytes,
                nonce,
                key,
            ) {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }

            out.extend_from_slice(&mac);
        }
        None => {
            let mut checksum = [0u8; crypto::DIGEST_SIZE];
            if !crypto::digest(&mut checksum, &out[..], &[]) {
                return Err(NetworkError::Fatal(ErrorType::Crypto));
            }
            out.extend_from_slice(&checksum);
        }
    }

    Ok(())
}

/// Verifies and strips the integrity tag, decrypting sealed bodies. Returns the sent
/// time (when present) and the raw command bytes; decompression is the caller's concern
/// since the expansion bound lives with the host.
pub fn open(
    data: &[u8],
    header: &Header,
    key: Option<&[u8; crypto::KEY_SIZE]>,
    nonce: u64,
) -> NetworkResult<(Option<u16>, Vec<u8>)> {
    let body_end = HEADER_SIZE + header.length as usize;
    let cipher = &data[HEADER_SIZE..body_end];
    let tag = &data[body_end..];

    let mut body = vec![0u8; cipher.len()];

    if header.has(flags::SEALED) {
        let key = key.ok_or(NetworkError::Fatal(ErrorType::Crypto))?;

        let mut mac = [0u8; TAG_SIZE];
        mac.copy_from_slice(tag);

        let mut aad = [0u8; HEADER_SIZE];
        aad.copy_from_slice(&data[..HEADER_SIZE]);

        if !crypto::open(&mut body, cipher, &mac, &aad, nonce, key) {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }
    } else {
        let mut checksum = [0u8; crypto::DIGEST_SIZE];
        if !crypto::digest(&mut checksum, &data[..body_end], &[]) {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        if checksum[..] != tag[..] {
            return Err(NetworkError::Fatal(ErrorType::Crypto));
        }

        body.copy_from_slice(cipher);
    }

    if header.has(flags::SENT_TIME) {
        let time = u16::from_be_bytes([body[0], body[1]]);
        Ok((Some(time), body.split_off(SENT_TIME_SIZE)))
    } else {
        Ok((None, body))
    }
}

/// Reconstructs the full 64-bit datagram sequence nearest to `expected` whose low
/// 24 bits match the wire field. Keeps AEAD nonces unique past the 24-bit wrap.
#[inline]
pub fn extend_sequence(expected: u64, wire: u32) -> u64 {
    crate::support::extend_nearest(expected, u64::from(wire), SEQUENCE_WINDOW)
}
