//! Payload codecs between frames and [`FeederCommand`]s.
//!
//! The feeder side uses [`decode_command`], [`encode_reply`] and
//! [`error_reply`]. [`encode_command`] is the host-side inverse, used by
//! the simulator and by tests.

use crate::commands::{
    CommandReply, FeederCommand, FeederUuid, MoveAmount, MoveRequest, ReplyPayload, UUID_LEN,
};
use crate::config::{SettingKey, SettingValue};
use crate::error::{DispatchError, FaultCode};
use crate::perf::PerfSnapshot;
use crate::traits::Direction;

use super::frame::{Payload, ProtocolFrame};
use super::opcode::{Opcode, ResultCode};

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn uuid(bytes: &[u8]) -> Option<FeederUuid> {
    bytes.try_into().ok()
}

/// Parse a frame addressed to this feeder into a command.
pub fn decode_command(frame: &ProtocolFrame) -> Result<FeederCommand, DispatchError> {
    let op = frame.opcode;
    let opcode = Opcode::from_u8(op).ok_or(DispatchError::Unsupported(op))?;
    let p = frame.payload.as_slice();
    let malformed = DispatchError::Malformed(op);

    let bare = |cmd: FeederCommand| if p.is_empty() { Ok(cmd) } else { Err(malformed) };

    match opcode {
        Opcode::GetFeederId => bare(FeederCommand::GetFeederId),
        Opcode::InitializeFeeder => uuid(p)
            .map(|uuid| FeederCommand::InitializeFeeder { uuid })
            .ok_or(malformed),
        Opcode::GetVersion => bare(FeederCommand::GetVersion),
        Opcode::MoveForward | Opcode::MoveBackward => {
            let tenths = match p.len() {
                1 => p[0] as u16,
                2 => be_u16(p),
                _ => return Err(malformed),
            };
            let direction = if opcode == Opcode::MoveForward {
                Direction::Forward
            } else {
                Direction::Reverse
            };
            Ok(FeederCommand::Move(MoveRequest {
                direction,
                amount: MoveAmount::Tenths(tenths),
            }))
        }
        Opcode::MoveFeedStatus => bare(FeederCommand::MoveStatus),
        Opcode::MovePitch => match p {
            [dir @ (0 | 1), pitch] => Ok(FeederCommand::Move(MoveRequest {
                direction: if *dir == 0 {
                    Direction::Forward
                } else {
                    Direction::Reverse
                },
                amount: MoveAmount::Pitch(*pitch),
            })),
            _ => Err(malformed),
        },
        Opcode::QueryStatus => bare(FeederCommand::QueryStatus),
        Opcode::StartCalibration => bare(FeederCommand::StartCalibration),
        Opcode::ClearFault => bare(FeederCommand::ClearFault),
        Opcode::EmergencyStop => bare(FeederCommand::EmergencyStop),
        Opcode::ResetEstopArm => bare(FeederCommand::ResetEstopArm),
        Opcode::ResetEstopConfirm => match p.len() {
            2 => Ok(FeederCommand::ResetEstopConfirm {
                challenge: be_u16(p),
            }),
            _ => Err(malformed),
        },
        Opcode::GetPerformance => bare(FeederCommand::GetPerformance),
        Opcode::ResetPerformance => bare(FeederCommand::ResetPerformance),
        Opcode::GetSetting => match p {
            [id] => SettingKey::from_u8(*id)
                .map(FeederCommand::GetSetting)
                .ok_or(malformed),
            _ => Err(malformed),
        },
        Opcode::SetSetting => match p {
            [id, tag, a, b, c, d] => {
                let key = SettingKey::from_u8(*id).ok_or(malformed)?;
                let value = SettingValue::from_wire(*tag, [*a, *b, *c, *d]).ok_or(malformed)?;
                Ok(FeederCommand::SetSetting(key, value))
            }
            _ => Err(malformed),
        },
        Opcode::GetFeederAddress => uuid(p)
            .map(|uuid| FeederCommand::GetFeederAddress { uuid })
            .ok_or(malformed),
        Opcode::IdentifyFeeder => uuid(p)
            .map(|uuid| FeederCommand::IdentifyFeeder { uuid })
            .ok_or(malformed),
        Opcode::ProgramFeederFloor => match p.split_last() {
            Some((&address, id)) if id.len() == UUID_LEN => Ok(FeederCommand::ProgramFeederFloor {
                uuid: uuid(id).ok_or(malformed)?,
                address,
            }),
            _ => Err(malformed),
        },
        Opcode::UninitializedFeedersRespond => bare(FeederCommand::UninitializedFeedersRespond),
        // only ever sent by feeders
        Opcode::Error => Err(DispatchError::Unsupported(op)),
    }
}

/// Frame the reply to `request`: same packet id and opcode, addressed back
/// to the sender, result byte first.
pub fn encode_reply(request: &ProtocolFrame, reply: &CommandReply, own_address: u8) -> ProtocolFrame {
    let mut payload = Payload::new();
    // reply payload is one byte short of the frame limit
    let _ = payload.push(reply.result as u8);
    let _ = payload.extend_from_slice(&reply.payload);
    ProtocolFrame {
        to: request.from,
        from: own_address,
        packet_id: request.packet_id,
        opcode: request.opcode,
        payload,
    }
}

/// Result code an undecodable request is answered with.
pub fn error_result(err: &DispatchError) -> ResultCode {
    match err {
        DispatchError::Unsupported(_) => ResultCode::Unsupported,
        DispatchError::Malformed(_) => ResultCode::Malformed,
    }
}

/// Fault counter an undecodable request is charged to, if any.
pub fn error_fault(err: &DispatchError) -> Option<FaultCode> {
    match err {
        DispatchError::Unsupported(_) => Some(FaultCode::CommUnsupported),
        DispatchError::Malformed(_) => None,
    }
}

/// Error reply: opcode 0xFE, payload `[result, offending opcode]`.
pub fn error_reply(request: &ProtocolFrame, err: &DispatchError, own_address: u8) -> ProtocolFrame {
    let mut payload = Payload::new();
    let _ = payload.extend_from_slice(&[error_result(err) as u8, request.opcode]);
    ProtocolFrame {
        to: request.from,
        from: own_address,
        packet_id: request.packet_id,
        opcode: Opcode::Error as u8,
        payload,
    }
}

/// Build the request frame for `command`.
pub fn encode_command(to: u8, from: u8, packet_id: u8, command: &FeederCommand) -> ProtocolFrame {
    let mut payload = Payload::new();
    match command {
        FeederCommand::Move(MoveRequest {
            amount: MoveAmount::Tenths(t),
            ..
        }) => {
            let _ = payload.extend_from_slice(&t.to_be_bytes());
        }
        FeederCommand::Move(MoveRequest {
            direction,
            amount: MoveAmount::Pitch(mm),
        }) => {
            let dir = match direction {
                Direction::Forward => 0,
                Direction::Reverse => 1,
            };
            let _ = payload.extend_from_slice(&[dir, *mm]);
        }
        FeederCommand::ResetEstopConfirm { challenge } => {
            let _ = payload.extend_from_slice(&challenge.to_be_bytes());
        }
        FeederCommand::GetSetting(key) => {
            let _ = payload.push(*key as u8);
        }
        FeederCommand::SetSetting(key, value) => {
            let (tag, bytes) = value.to_wire();
            let _ = payload.extend_from_slice(&[*key as u8, tag]);
            let _ = payload.extend_from_slice(&bytes);
        }
        FeederCommand::InitializeFeeder { uuid }
        | FeederCommand::GetFeederAddress { uuid }
        | FeederCommand::IdentifyFeeder { uuid } => {
            let _ = payload.extend_from_slice(uuid);
        }
        FeederCommand::ProgramFeederFloor { uuid, address } => {
            let _ = payload.extend_from_slice(uuid);
            let _ = payload.push(*address);
        }
        _ => {}
    }
    ProtocolFrame {
        to,
        from,
        packet_id,
        opcode: command.opcode() as u8,
        payload,
    }
}

fn sat_u16(v: u32) -> [u8; 2] {
    (v.min(u16::MAX as u32) as u16).to_be_bytes()
}

/// Compact counter layout for get-performance.
///
/// | Bytes | Field |
/// |-------|-------|
/// | 4 | moves completed |
/// | 2 | moves failed |
/// | 4 | average move time, us |
/// | 2 | worst tick jitter, us |
/// | 2 | overruns |
/// | 2 | encoder glitches |
/// | 2 | checksum drops |
/// | 1 | calibrations |
/// | 10 | fault counts in [`FaultCode::ALL`] order, saturating |
pub fn performance_payload(snap: &PerfSnapshot) -> ReplyPayload {
    let mut out = ReplyPayload::new();
    let _ = out.extend_from_slice(&snap.moves_completed.to_be_bytes());
    let _ = out.extend_from_slice(&sat_u16(snap.moves_failed));
    let _ = out.extend_from_slice(&snap.average_move_us().to_be_bytes());
    let _ = out.extend_from_slice(&sat_u16(snap.max_jitter_us));
    let _ = out.extend_from_slice(&sat_u16(snap.overruns));
    let _ = out.extend_from_slice(&sat_u16(snap.encoder_glitches));
    let _ = out.extend_from_slice(&sat_u16(snap.checksum_drops));
    let _ = out.push(snap.calibrations.min(u8::MAX as u32) as u8);
    for count in snap.faults {
        let _ = out.push(count.min(u8::MAX as u32) as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: u8 = 0xF0;

    fn frame(opcode: u8, payload: &[u8]) -> ProtocolFrame {
        ProtocolFrame::new(5, HOST, 7, opcode, payload).unwrap()
    }

    #[test]
    fn move_accepts_one_or_two_byte_distance() {
        assert_eq!(
            decode_command(&frame(0x04, &[40])),
            Ok(FeederCommand::Move(MoveRequest::forward_tenths(40)))
        );
        assert_eq!(
            decode_command(&frame(0x05, &[0x01, 0x2C])),
            Ok(FeederCommand::Move(MoveRequest::backward_tenths(300)))
        );
        assert_eq!(
            decode_command(&frame(0x04, &[])),
            Err(DispatchError::Malformed(0x04))
        );
    }

    #[test]
    fn pitch_direction_byte_checked() {
        assert!(decode_command(&frame(0x07, &[1, 8])).is_ok());
        assert_eq!(
            decode_command(&frame(0x07, &[2, 8])),
            Err(DispatchError::Malformed(0x07))
        );
    }

    #[test]
    fn unknown_opcode_is_unsupported() {
        assert_eq!(
            decode_command(&frame(0x42, &[])),
            Err(DispatchError::Unsupported(0x42))
        );
        assert_eq!(
            decode_command(&frame(0xFE, &[])),
            Err(DispatchError::Unsupported(0xFE))
        );
    }

    #[test]
    fn bare_commands_reject_payload() {
        assert_eq!(
            decode_command(&frame(0x10, &[1])),
            Err(DispatchError::Malformed(0x10))
        );
    }

    #[test]
    fn settings_decode() {
        let (tag, bytes) = SettingValue::Float(0.5).to_wire();
        let p = [SettingKey::MaxDuty as u8, tag, bytes[0], bytes[1], bytes[2], bytes[3]];
        assert_eq!(
            decode_command(&frame(0x19, &p)),
            Ok(FeederCommand::SetSetting(SettingKey::MaxDuty, SettingValue::Float(0.5)))
        );
        assert_eq!(
            decode_command(&frame(0x18, &[0xEE])),
            Err(DispatchError::Malformed(0x18))
        );
    }

    #[test]
    fn encode_command_is_decodable() {
        let cmds = [
            FeederCommand::Move(MoveRequest::forward_tenths(40)),
            FeederCommand::ResetEstopConfirm { challenge: 0xBEEF },
            FeederCommand::GetSetting(SettingKey::Kp),
            FeederCommand::SetSetting(SettingKey::BusAddress, SettingValue::Int(9)),
            FeederCommand::QueryStatus,
            FeederCommand::InitializeFeeder { uuid: [7; UUID_LEN] },
            FeederCommand::ProgramFeederFloor {
                uuid: [7; UUID_LEN],
                address: 12,
            },
            FeederCommand::UninitializedFeedersRespond,
        ];
        for cmd in cmds {
            let f = encode_command(5, HOST, 1, &cmd);
            assert_eq!(decode_command(&f), Ok(cmd));
        }
    }

    #[test]
    fn enrollment_payloads_checked() {
        let uuid: [u8; UUID_LEN] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let id = uuid.as_slice();
        assert_eq!(
            decode_command(&frame(0x02, id)),
            Ok(FeederCommand::InitializeFeeder { uuid })
        );
        assert_eq!(
            decode_command(&frame(0xC1, id)),
            Ok(FeederCommand::IdentifyFeeder { uuid })
        );
        let mut program = [0x21u8; UUID_LEN + 1];
        program[..UUID_LEN].copy_from_slice(id);
        assert_eq!(
            decode_command(&frame(0xC2, &program)),
            Ok(FeederCommand::ProgramFeederFloor { uuid, address: 0x21 })
        );
        assert_eq!(
            decode_command(&frame(0xC0, &id[..11])),
            Err(DispatchError::Malformed(0xC0))
        );
        assert_eq!(
            decode_command(&frame(0xC2, id)),
            Err(DispatchError::Malformed(0xC2))
        );
        assert_eq!(
            decode_command(&frame(0xC3, &[])),
            Ok(FeederCommand::UninitializedFeedersRespond)
        );
    }

    #[test]
    fn reply_echoes_request() {
        let request = frame(0x10, &[]);
        let reply = encode_reply(&request, &CommandReply::ok_with(&[1, 2]), 5);
        assert_eq!(reply.to, HOST);
        assert_eq!(reply.from, 5);
        assert_eq!(reply.packet_id, 7);
        assert_eq!(reply.opcode, 0x10);
        assert_eq!(reply.payload.as_slice(), &[0x00, 1, 2]);
    }

    #[test]
    fn error_reply_carries_offending_opcode() {
        let request = frame(0x42, &[]);
        let reply = error_reply(&request, &DispatchError::Unsupported(0x42), 5);
        assert_eq!(reply.opcode, 0xFE);
        assert_eq!(reply.payload.as_slice(), &[ResultCode::Unsupported as u8, 0x42]);
    }

    #[test]
    fn performance_payload_fits_and_saturates() {
        let mut snap = PerfSnapshot {
            moves_completed: 2,
            move_time_us: 100_000,
            moves_failed: 70_000,
            ..Default::default()
        };
        snap.faults[FaultCode::MotionStall.index()] = 300;
        let p = performance_payload(&snap);
        assert_eq!(p.len(), 29);
        assert_eq!(&p[0..4], &2u32.to_be_bytes());
        assert_eq!(&p[4..6], &[0xFF, 0xFF]);
        assert_eq!(&p[6..10], &50_000u32.to_be_bytes());
        assert_eq!(p[19 + FaultCode::MotionStall.index()], 0xFF);
    }
}
