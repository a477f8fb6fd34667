use crate::channel::ChannelKind;
use crate::support::{ErrorType, NetworkError, NetworkResult, SizedRead, SizedWrite};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use undertow::crypto;

/// Reserved channel id for protocol-internal traffic (handshake confirmation, pings,
/// parameter exchange). Payloads on this channel never surface as receive events.
pub const CONTROL_CHANNEL: u8 = 0xff;

/// Handshake cookie bytes.
pub const COOKIE_SIZE: usize = 16;

/// Inner header bytes shared by every command: kind, channel, reliable sequence.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// One protocol PDU inside a datagram body. The channel and reliable sequence are
/// meaningful for channel traffic and for retransmittable control commands; commands
/// outside any sequence space carry zero.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Command {
    pub channel: u8,
    pub sequence: u16,
    pub body: CommandBody,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CommandBody {
    /// Compact ack set for one channel: `base` plus a bitfield covering the 32
    /// sequences before it, with the sent-time echo for RTT sampling.
    Ack {
        base: u16,
        bits: u32,
        sent_time_echo: u16,
    },
    Connect(ConnectBody),
    VerifyConnect(VerifyConnectBody),
    Disconnect {
        reason: u32,
        mode: DisconnectMode,
    },
    Ping,
    SendReliable {
        payload: Box<[u8]>,
    },
    SendUnreliable {
        payload: Box<[u8]>,
    },
    SendFragment {
        index: u16,
        count: u16,
        total_length: u32,
        payload: Box<[u8]>,
    },
    SendUnsequenced {
        payload: Box<[u8]>,
    },
    BandwidthLimit {
        incoming: u32,
        outgoing: u32,
    },
    ThrottleConfigure {
        interval_ms: u32,
        acceleration: u32,
        deceleration: u32,
    },
    /// Padded to the probed datagram size; `size` names the full datagram length being
    /// tested so the responder can echo it.
    MtuProbe {
        size: u16,
        padding: Box<[u8]>,
    },
    MtuResponse {
        size: u16,
    },
}

/// Connect-request fields (client to server, in the clear, checksummed).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectBody {
    pub connection_id: u64,
    /// The connector's local slot; the listener addresses it as the outer session id.
    pub proposed_peer: u16,
    pub channel_kinds: Vec<ChannelKind>,
    pub capabilities: u32,
    pub data: u32,
    pub share: [u8; crypto::SHARE_SIZE],
    /// Zero on the first attempt, the listener's cookie on retry.
    pub cookie: [u8; COOKIE_SIZE],
    pub token: Box<[u8]>,
}

/// Verify-connect fields (server to client). With `assigned_peer` unassigned this is a
/// stateless cookie challenge: no peer was allocated and the connector must retry with
/// the cookie echoed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct VerifyConnectBody {
    pub connection_id: u64,
    pub assigned_peer: u16,
    pub channel_kinds: Vec<ChannelKind>,
    pub data: u32,
    pub share: [u8; crypto::SHARE_SIZE],
    pub cookie: [u8; COOKIE_SIZE],
    pub mtu: u16,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DisconnectMode {
    /// Clean teardown; the receiver acks and reports a disconnect event.
    Notify = 0,
    /// Unacknowledged teardown for peers already written off.
    Force = 1,
    /// Listener-side refusal; the reason encodes a denial code.
    Denial = 2,
}

impl DisconnectMode {
    #[inline]
    fn from_wire(value: u8) -> NetworkResult<DisconnectMode> {
        match value {
            0 => Ok(DisconnectMode::Notify),
            1 => Ok(DisconnectMode::Force),
            2 => Ok(DisconnectMode::Denial),
            _ => Err(NetworkError::Fatal(ErrorType::MalformedCommand)),
        }
    }
}

impl CommandBody {
    /// Wire kind octet.
    #[inline]
    pub fn kind(&self) -> u8 {
        match self {
            CommandBody::Ack { .. } => 1,
            CommandBody::Connect(_) => 2,
            CommandBody::VerifyConnect(_) => 3,
            CommandBody::Disconnect { .. } => 4,
            CommandBody::Ping => 5,
            CommandBody::SendReliable { .. } => 6,
            CommandBody::SendUnreliable { .. } => 7,
            CommandBody::SendFragment { .. } => 8,
            CommandBody::SendUnsequenced { .. } => 9,
            CommandBody::BandwidthLimit { .. } => 10,
            CommandBody::ThrottleConfigure { .. } => 11,
            CommandBody::MtuProbe { .. } => 12,
            CommandBody::MtuResponse { .. } => 13,
        }
    }

}

impl Command {
    /// Exact encoded size, used when aggregating commands into an MTU-bounded datagram.
    pub fn wire_size(&self) -> usize {
        COMMAND_HEADER_SIZE
            + match &self.body {
                CommandBody::Ack { .. } => 8,
                CommandBody::Connect(connect) => {
                    8 + 2 + 1 + connect.channel_kinds.len() + 4 + 4 + crypto::SHARE_SIZE + COOKIE_SIZE + 2
                        + connect.token.len()
                }
                CommandBody::VerifyConnect(verify) => {
                    8 + 2 + 1 + verify.channel_kinds.len() + 4 + crypto::SHARE_SIZE + COOKIE_SIZE + 2
                }
                CommandBody::Disconnect { .. } => 5,
                CommandBody::Ping => 0,
                CommandBody::SendReliable { payload }
                | CommandBody::SendUnreliable { payload }
                | CommandBody::SendUnsequenced { payload } => 2 + payload.len(),
                CommandBody::SendFragment { payload, .. } => 2 + 2 + 4 + 2 + payload.len(),
                CommandBody::BandwidthLimit { .. } => 8,
                CommandBody::ThrottleConfigure { .. } => 12,
                CommandBody::MtuProbe { padding, .. } => 2 + 2 + padding.len(),
                CommandBody::MtuResponse { .. } => 2,
            }
    }

    pub fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < self.wire_size() {
            return Err(NetworkError::Wait);
        }

        stream.write_u8(self.body.kind())?;
        stream.write_u8(self.channel)?;
        stream.write_u16::<BigEndian>(self.sequence)?;

        match &self.body {
            CommandBody::Ack {
                base,
                bits,
                sent_time_echo,
            } => {
                stream.write_u16::<BigEndian>(*base)?;
                stream.write_u32::<BigEndian>(*bits)?;
                stream.write_u16::<BigEndian>(*sent_time_echo)?;
            }
            CommandBody::Connect(connect) => {
                stream.write_u64::<BigEndian>(connect.connection_id)?;
                stream.write_u16::<BigEndian>(connect.proposed_peer)?;
                stream.write_u8(connect.channel_kinds.len() as u8)?;
                for kind in &connect.channel_kinds {
                    stream.write_u8(*kind as u8)?;
                }
                stream.write_u32::<BigEndian>(connect.capabilities)?;
                stream.write_u32::<BigEndian>(connect.data)?;
                stream.write_all(&connect.share)?;
                stream.write_all(&connect.cookie)?;
                stream.write_u16::<BigEndian>(connect.token.len() as u16)?;
                stream.write_all(&connect.token)?;
            }
            CommandBody::VerifyConnect(verify) => {
                stream.write_u64::<BigEndian>(verify.connection_id)?;
                stream.write_u16::<BigEndian>(verify.assigned_peer)?;
                stream.write_u8(verify.channel_kinds.len() as u8)?;
                for kind in &verify.channel_kinds {
                    stream.write_u8(*kind as u8)?;
                }
                stream.write_u32::<BigEndian>(verify.data)?;
                stream.write_all(&verify.share)?;
                stream.write_all(&verify.cookie)?;
                stream.write_u16::<BigEndian>(verify.mtu)?;
            }
            CommandBody::Disconnect { reason, mode } => {
                stream.write_u32::<BigEndian>(*reason)?;
                stream.write_u8(*mode as u8)?;
            }
            CommandBody::Ping => (),
            CommandBody::SendReliable { payload }
            | CommandBody::SendUnreliable { payload }
            | CommandBody::SendUnsequenced { payload } => {
                stream.write_u16::<BigEndian>(payload.len() as u16)?;
                stream.write_all(payload)?;
            }
            CommandBody::SendFragment {
                index,
                count,
                total_length,
                payload,
            } => {
                stream.write_u16::<BigEndian>(*index)?;
                stream.write_u16::<BigEndian>(*count)?;
                stream.write_u32::<BigEndian>(*total_length)?;
                stream.write_u16::<BigEndian>(payload.len() as u16)?;
                stream.write_all(payload)?;
            }
            CommandBody::BandwidthLimit { incoming, outgoing } => {
                stream.write_u32::<BigEndian>(*incoming)?;
                stream.write_u32::<BigEndian>(*outgoing)?;
            }
            CommandBody::ThrottleConfigure {
                interval_ms,
                acceleration,
                deceleration,
            } => {
                stream.write_u32::<BigEndian>(*interval_ms)?;
                stream.write_u32::<BigEndian>(*acceleration)?;
                stream.write_u32::<BigEndian>(*deceleration)?;
            }
            CommandBody::MtuProbe { size, padding } => {
                stream.write_u16::<BigEndian>(*size)?;
                stream.write_u16::<BigEndian>(padding.len() as u16)?;
                stream.write_all(padding)?;
            }
            CommandBody::MtuResponse { size } => {
                stream.write_u16::<BigEndian>(*size)?;
            }
        }

        Ok(())
    }

    pub fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Option<Command>> {
        if stream.remaining_data() < COMMAND_HEADER_SIZE {
            return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
        }

        let kind = stream.read_u8()?;
        let channel = stream.read_u8()?;
        let sequence = stream.read_u16::<BigEndian>()?;

        let body = match kind {
            // Kind zero is padding; the inner header is consumed and nothing dispatches.
            0 => return Ok(None),
            1 => CommandBody::Ack {
                base: stream.read_u16::<BigEndian>()?,
                bits: stream.read_u32::<BigEndian>()?,
                sent_time_echo: stream.read_u16::<BigEndian>()?,
            },
            2 => {
                let connection_id = stream.read_u64::<BigEndian>()?;
                let proposed_peer = stream.read_u16::<BigEndian>()?;
                let channel_kinds = read_channel_kinds(stream)?;
                let capabilities = stream.read_u32::<BigEndian>()?;
                let data = stream.read_u32::<BigEndian>()?;

                let mut share = [0u8; crypto::SHARE_SIZE];
                stream.read_exact(&mut share)?;
                let mut cookie = [0u8; COOKIE_SIZE];
                stream.read_exact(&mut cookie)?;

                CommandBody::Connect(ConnectBody {
                    connection_id,
                    proposed_peer,
                    channel_kinds,
                    capabilities,
                    data,
                    share,
                    cookie,
                    token: read_payload(stream)?,
                })
            }
            3 => {
                let connection_id = stream.read_u64::<BigEndian>()?;
                let assigned_peer = stream.read_u16::<BigEndian>()?;
                let channel_kinds = read_channel_kinds(stream)?;
                let data = stream.read_u32::<BigEndian>()?;

                let mut share = [0u8; crypto::SHARE_SIZE];
                stream.read_exact(&mut share)?;
                let mut cookie = [0u8; COOKIE_SIZE];
                stream.read_exact(&mut cookie)?;

                CommandBody::VerifyConnect(VerifyConnectBody {
                    connection_id,
                    assigned_peer,
                    channel_kinds,
                    data,
                    share,
                    cookie,
                    mtu: stream.read_u16::<BigEndian>()?,
                })
            }
            4 => CommandBody::Disconnect {
                reason: stream.read_u32::<BigEndian>()?,
                mode: DisconnectMode::from_wire(stream.read_u8()?)?,
            },
            5 => CommandBody::Ping,
            6 => CommandBody::SendReliable {
                payload: read_payload(stream)?,
            },
            7 => CommandBody::SendUnreliable {
                payload: read_payload(stream)?,
            },
            8 => CommandBody::SendFragment {
                index: stream.read_u16::<BigEndian>()?,
                count: stream.read_u16::<BigEndian>()?,
                total_length: stream.read_u32::<BigEndian>()?,
                payload: read_payload(stream)?,
            },
            9 => CommandBody::SendUnsequenced {
                payload: read_payload(stream)?,
            },
            10 => CommandBody::BandwidthLimit {
                incoming: stream.read_u32::<BigEndian>()?,
                outgoing: stream.read_u32::<BigEndian>()?,
            },
            11 => CommandBody::ThrottleConfigure {
                interval_ms: stream.read_u32::<BigEndian>()?,
                acceleration: stream.read_u32::<BigEndian>()?,
                deceleration: stream.read_u32::<BigEndian>()?,
            },
            12 => CommandBody::MtuProbe {
                size: stream.read_u16::<BigEndian>()?,
                padding: read_payload(stream)?,
            },
            13 => CommandBody::MtuResponse {
                size: stream.read_u16::<BigEndian>()?,
            },
            _ => return Err(NetworkError::Fatal(ErrorType::MalformedCommand)),
        };

        Ok(Some(Command {
            channel,
            sequence,
            body,
        }))
    }
}

/// Decodes a whole datagram body. Commands execute in datagram order, so the output
/// preserves it; a malformed command poisons the entire datagram.
pub fn decode_all(body: &[u8]) -> NetworkResult<Vec<Command>> {
    let mut stream = Cursor::new(body);
    let mut commands = Vec::new();

    while stream.remaining_data() > 0 {
        if let Some(command) = Command::deserialize(&mut stream)? {
            commands.push(command);
        }
    }

    Ok(commands)
}

fn read_channel_kinds<R: SizedRead>(stream: &mut R) -> NetworkResult<Vec<ChannelKind>> {
    let count = stream.read_u8()? as usize;

    if stream.remaining_data() < count {
        return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
    }

    let mut kinds = Vec::with_capacity(count);
    for _ in 0..count {
        kinds.push(ChannelKind::from_wire(stream.read_u8()?)?);
    }

    Ok(kinds)
}

fn read_payload<R: SizedRead>(stream: &mut R) -> NetworkResult<Box<[u8]>> {
    let length = stream.read_u16::<BigEndian>()? as usize;

    // The length octet pair cannot promise more than the datagram still holds.
    if stream.remaining_data() < length {
        return Err(NetworkError::Fatal(ErrorType::MalformedCommand));
    }

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload)?;

    Ok(payload.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: Command) {
        let mut buffer = vec![0u8; 2048];
        let mut writer = Cursor::new(&mut buffer[..]);
        command.serialize(&mut writer).unwrap();
        let written = writer.position() as usize;

        assert_eq!(written, command.wire_size());

        let decoded = decode_all(&buffer[..written]).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], command);
    }

    #[test]
    fn test_ack_roundtrip() {
        roundtrip(Command {
            channel: 3,
            sequence: 0,
            body: CommandBody::Ack {
                base: 900,
                bits: 0b1011,
                sent_time_echo: 5511,
            },
        });
    }

    #[test]
    fn test_connect_roundtrip() {
        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 0,
            body: CommandBody::Connect(ConnectBody {
                connection_id: 0xdead_beef_cafe_f00d,
                proposed_peer: 17,
                channel_kinds: vec![
                    ChannelKind::ReliableOrdered,
                    ChannelKind::UnreliableUnordered,
                ],
                capabilities: 0,
                data: 77,
                share: [5u8; crypto::SHARE_SIZE],
                cookie: [0u8; COOKIE_SIZE],
                token: b"let me in".to_vec().into_boxed_slice(),
            }),
        });
    }

    #[test]
    fn test_verify_connect_roundtrip() {
        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 1,
            body: CommandBody::VerifyConnect(VerifyConnectBody {
                connection_id: 42,
                assigned_peer: 3,
                channel_kinds: vec![ChannelKind::ReliableOrdered],
                data: 0,
                share: [9u8; crypto::SHARE_SIZE],
                cookie: [1u8; COOKIE_SIZE],
                mtu: 1400,
            }),
        });
    }

    #[test]
    fn test_channel_traffic_roundtrip() {
        roundtrip(Command {
            channel: 0,
            sequence: 100,
            body: CommandBody::SendReliable {
                payload: b"Hello world!".to_vec().into_boxed_slice(),
            },
        });

        roundtrip(Command {
            channel: 1,
            sequence: 5,
            body: CommandBody::SendFragment {
                index: 2,
                count: 9,
                total_length: 65536,
                payload: vec![3u8; 1000].into_boxed_slice(),
            },
        });

        roundtrip(Command {
            channel: 2,
            sequence: 0,
            body: CommandBody::SendUnsequenced {
                payload: Box::new([]),
            },
        });
    }

    #[test]
    fn test_control_roundtrips() {
        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 9,
            body: CommandBody::Ping,
        });

        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 10,
            body: CommandBody::Disconnect {
                reason: 1000,
                mode: DisconnectMode::Notify,
            },
        });

        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 11,
            body: CommandBody::BandwidthLimit {
                incoming: 128_000,
                outgoing: 256_000,
            },
        });

        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 12,
            body: CommandBody::ThrottleConfigure {
                interval_ms: 5000,
                acceleration: 2,
                deceleration: 2,
            },
        });

        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 13,
            body: CommandBody::MtuProbe {
                size: 1200,
                padding: vec![0u8; 600].into_boxed_slice(),
            },
        });

        roundtrip(Command {
            channel: CONTROL_CHANNEL,
            sequence: 13,
            body: CommandBody::MtuResponse { size: 1200 },
        });
    }

    #[test]
    fn test_multiple_commands_preserve_order() {
        let first = Command {
            channel: 0,
            sequence: 1,
            body: CommandBody::SendReliable {
                payload: b"first".to_vec().into_boxed_slice(),
            },
        };
        let second = Command {
            channel: 0,
            sequence: 0,
            body: CommandBody::Ack {
                base: 1,
                bits: 0,
                sent_time_echo: 0,
            },
        };

        let mut buffer = vec![0u8; 256];
        let mut writer = Cursor::new(&mut buffer[..]);
        first.serialize(&mut writer).unwrap();
        second.serialize(&mut writer).unwrap();
        let written = writer.position() as usize;

        let decoded = decode_all(&buffer[..written]).unwrap();
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_padding_kind_is_skipped() {
        // One padding command (kind 0) followed by a ping.
        let bytes = [0u8, 0, 0, 0, 5, CONTROL_CHANNEL, 0, 9];

        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].body, CommandBody::Ping);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let bytes = [200u8, 0, 0, 0];

        assert_eq!(
            decode_all(&bytes).unwrap_err(),
            NetworkError::Fatal(ErrorType::MalformedCommand)
        );
    }

    #[test]
    fn test_payload_length_cannot_exceed_datagram() {
        // send-reliable promising 500 bytes with only 2 present.
        let bytes = [6u8, 0, 0, 1, 0x01, 0xf4, 0xab, 0xcd];

        assert_eq!(
            decode_all(&bytes).unwrap_err(),
            NetworkError::Fatal(ErrorType::MalformedCommand)
        );
    }

    #[test]
    fn test_truncated_command_rejected() {
        let command = Command {
            channel: 0,
            sequence: 7,
            body: CommandBody::SendReliable {
                payload: b"clipped".to_vec().into_boxed_slice(),
            },
        };

        let mut buffer = vec![0u8; 64];
        let mut writer = Cursor::new(&mut buffer[..]);
        command.serialize(&mut writer).unwrap();
        let written = writer.position() as usize;

        assert!(decode_all(&buffer[..written - 3]).is_err());
    }

    #[test]
    fn test_serialize_without_capacity_waits() {
        let command = Command {
            channel: 0,
            sequence: 0,
            body: CommandBody::SendReliable {
                payload: vec![0u8; 100].into_boxed_slice(),
            },
        };

        let mut buffer = vec![0u8; 32];
        let mut writer = Cursor::new(&mut buffer[..]);

        assert_eq!(command.serialize(&mut writer).unwrap_err(), NetworkError::Wait);
        assert_eq!(writer.position(), 0);
    }
}
