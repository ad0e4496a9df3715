//! Photon framing, timing and payload handling seen from the host side

use gluon_feeder::{
    commands::FeederCommand,
    config::{BusConfig, DeviceConfig, FeederConfig, SettingKey, SettingValue},
    hal::{Mechanism, MockStore, SimParts, SimRig, HOST_ADDRESS},
    protocol::{
        encode_command, Opcode, ProtocolFrame, ResultCode, BROADCAST, PROTOCOL_VERSION, UNASSIGNED,
    },
    LifecycleState,
};

const ADDRESS: u8 = 9;
const UUID: [u8; 12] = [0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8, 0xA9, 0xAA, 0xAB];

fn rig(parts: &SimParts) -> SimRig<'_> {
    let config = FeederConfig::default()
        .with_bus(BusConfig::default().with_address(ADDRESS))
        .with_device(DeviceConfig::default().with_uuid(UUID));
    parts.rig(config, Mechanism::new(), MockStore::new())
}

fn result(reply: &ProtocolFrame) -> ResultCode {
    ResultCode::from_u8(reply.payload[0]).unwrap()
}

fn ask(rig: &mut SimRig<'_>, command: FeederCommand) -> ProtocolFrame {
    rig.request(command).expect("feeder did not answer")
}

fn status_frame(packet_id: u8) -> ProtocolFrame {
    encode_command(ADDRESS, HOST_ADDRESS, packet_id, &FeederCommand::QueryStatus)
}

/// Send to `to` and collect the answer to that packet, if any, within 20 ms.
fn ask_at(rig: &mut SimRig<'_>, to: u8, command: FeederCommand) -> Option<ProtocolFrame> {
    let id = rig.send_to(to, &command);
    rig.run_ms(20);
    rig.take_replies().into_iter().find(|f| f.packet_id == id)
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn feeder_id_is_the_device_uuid() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let reply = ask(&mut rig, FeederCommand::GetFeederId);
    assert_eq!(reply.from, ADDRESS);
    assert_eq!(reply.to, HOST_ADDRESS);
    assert_eq!(reply.opcode, Opcode::GetFeederId as u8);
    assert_eq!(result(&reply), ResultCode::Ok);
    assert_eq!(&reply.payload[1..], &UUID);
}

#[test]
fn version_reports_protocol_and_firmware() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let reply = ask(&mut rig, FeederCommand::GetVersion);
    assert_eq!(result(&reply), ResultCode::Ok);
    assert_eq!(reply.payload.len(), 5);
    assert_eq!(reply.payload[1], PROTOCOL_VERSION);
}

#[test]
fn status_payload_layout() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let reply = ask(&mut rig, FeederCommand::QueryStatus);
    let p = &reply.payload[1..];
    assert_eq!(p.len(), 9);
    assert_eq!(p[0], LifecycleState::Idle as u8);
    // no fault, no state-changing command yet
    assert_eq!(p[1], 0);
    assert_eq!(p[2], 0);
    assert_eq!(i32::from_be_bytes([p[4], p[5], p[6], p[7]]), rig.position());
    assert_eq!(p[8], 0);
}

// ============================================================================
// Framing and timing
// ============================================================================

#[test]
fn frame_split_across_polls_is_assembled() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);
    let bytes = status_frame(0x31).encode();

    let now = rig.now_us();
    rig.link_mut().bus_mut().inject_bytes(&bytes[..4], now);
    rig.step();
    assert!(rig.take_replies().is_empty());

    let now = rig.now_us();
    rig.link_mut().bus_mut().inject_bytes(&bytes[4..], now);
    rig.run_ms(5);

    let replies = rig.take_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].packet_id, 0x31);
    assert_eq!(parts.perf.snapshot().inter_byte_timeouts, 0);
}

#[test]
fn stalled_partial_frame_is_discarded() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);
    let bytes = status_frame(0x32).encode();

    let now = rig.now_us();
    rig.link_mut().bus_mut().inject_bytes(&bytes[..4], now);
    rig.run_ms(5);
    assert!(rig.take_replies().is_empty());
    assert_eq!(parts.perf.snapshot().inter_byte_timeouts, 1);

    // the line is clean again for the next frame
    let reply = ask(&mut rig, FeederCommand::QueryStatus);
    assert_eq!(result(&reply), ResultCode::Ok);
}

#[test]
fn reply_waits_for_the_guard_delay() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    rig.send(&FeederCommand::QueryStatus);
    rig.step();
    assert!(rig.take_replies().is_empty());
    assert_eq!(rig.link().pending_replies(), 1);

    rig.step();
    assert_eq!(rig.take_replies().len(), 1);
    assert_eq!(rig.link().pending_replies(), 0);
}

#[test]
fn driver_enable_only_while_transmitting() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    ask(&mut rig, FeederCommand::GetVersion);
    ask(&mut rig, FeederCommand::QueryStatus);
    assert_eq!(rig.link().bus().driver_log, vec![true, false, true, false]);
}

// ============================================================================
// Payload errors
// ============================================================================

#[test]
fn malformed_payload_gets_error_frame() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let frame =
        ProtocolFrame::new(ADDRESS, HOST_ADDRESS, 0x40, Opcode::MoveForward as u8, &[1, 2, 3])
            .unwrap();
    rig.send_frame(&frame);
    rig.run_ms(5);

    let replies = rig.take_replies();
    assert_eq!(replies.len(), 1);
    let reply = &replies[0];
    assert_eq!(reply.opcode, Opcode::Error as u8);
    assert_eq!(reply.packet_id, 0x40);
    assert_eq!(
        reply.payload.as_slice(),
        &[ResultCode::Malformed as u8, Opcode::MoveForward as u8]
    );
    // nothing moved
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    assert_eq!(parts.perf.snapshot().error_replies, 1);
}

#[test]
fn bad_pitch_direction_is_malformed() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let frame =
        ProtocolFrame::new(ADDRESS, HOST_ADDRESS, 0x41, Opcode::MovePitch as u8, &[3, 4]).unwrap();
    rig.send_frame(&frame);
    rig.run_ms(5);

    let replies = rig.take_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload[0], ResultCode::Malformed as u8);
}

// ============================================================================
// Settings
// ============================================================================

fn setting(reply: &ProtocolFrame) -> SettingValue {
    let p = &reply.payload;
    SettingValue::from_wire(p[1], [p[2], p[3], p[4], p[5]]).unwrap()
}

#[test]
fn settings_read_and_write() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let reply = ask(&mut rig, FeederCommand::GetSetting(SettingKey::MaxDuty));
    assert_eq!(result(&reply), ResultCode::Ok);
    assert_eq!(setting(&reply), SettingValue::Float(0.8));

    let reply = ask(
        &mut rig,
        FeederCommand::SetSetting(SettingKey::MaxDuty, SettingValue::Float(0.6)),
    );
    assert_eq!(result(&reply), ResultCode::Ok);

    let reply = ask(&mut rig, FeederCommand::GetSetting(SettingKey::MaxDuty));
    assert_eq!(setting(&reply), SettingValue::Float(0.6));
    assert_eq!(rig.feeder().config().control.max_duty, 0.6);
}

#[test]
fn invalid_settings_are_rejected_unchanged() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let attempts = [
        // wrong type
        FeederCommand::SetSetting(SettingKey::MaxDuty, SettingValue::Int(1)),
        // out of range
        FeederCommand::SetSetting(SettingKey::BusAddress, SettingValue::Int(255)),
        // fixed at boot
        FeederCommand::SetSetting(SettingKey::ControlPeriodUs, SettingValue::Int(500)),
        // seek duty may not exceed max duty
        FeederCommand::SetSetting(SettingKey::SeekDuty, SettingValue::Float(0.9)),
    ];
    for command in attempts {
        let reply = ask(&mut rig, command);
        assert_eq!(result(&reply), ResultCode::Rejected, "{command:?}");
    }

    let config = rig.feeder().config();
    assert_eq!(config.control.max_duty, 0.8);
    assert_eq!(config.bus.address, ADDRESS);
    assert_eq!(config.control.period_us, 1000);
    assert_eq!(config.calibration.seek_duty, 0.3);
}

#[test]
fn performance_reset_over_the_bus() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    ask(&mut rig, FeederCommand::QueryStatus);
    assert!(parts.perf.snapshot().frames_received > 0);

    let reply = ask(&mut rig, FeederCommand::ResetPerformance);
    assert_eq!(result(&reply), ResultCode::Ok);
    let snap = parts.perf.snapshot();
    assert_eq!(snap.frames_received, 0);
    assert_eq!(snap.moves_completed, 0);
}

// ============================================================================
// Enrollment
// ============================================================================

#[test]
fn host_enrolls_a_feeder_over_broadcast() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);
    let other = [0x55; 12];

    let roll_call = ask_at(&mut rig, BROADCAST, FeederCommand::UninitializedFeedersRespond)
        .expect("uninitialized feeder must answer");
    assert_eq!(roll_call.from, ADDRESS);
    assert_eq!(result(&roll_call), ResultCode::Ok);
    assert_eq!(&roll_call.payload[1..], &UUID);

    assert!(ask_at(&mut rig, BROADCAST, FeederCommand::GetFeederAddress { uuid: other }).is_none());
    let found = ask_at(&mut rig, UNASSIGNED, FeederCommand::GetFeederAddress { uuid: UUID })
        .expect("feeder must answer its own uuid");
    assert_eq!(found.from, ADDRESS);

    let program = FeederCommand::ProgramFeederFloor {
        uuid: UUID,
        address: 21,
    };
    let programmed = ask_at(&mut rig, BROADCAST, program).expect("program reply");
    assert_eq!(result(&programmed), ResultCode::Ok);
    assert_eq!(programmed.from, ADDRESS);
    assert_eq!(rig.link().address(), 21);
    assert_eq!(
        rig.feeder_mut().take_setting_to_persist(),
        Some((SettingKey::BusAddress, SettingValue::Int(21)))
    );

    let init = ask(&mut rig, FeederCommand::InitializeFeeder { uuid: UUID });
    assert_eq!(init.from, 21);
    assert_eq!(result(&init), ResultCode::Ok);
    assert!(rig.feeder().is_initialized());
    assert!(ask_at(&mut rig, BROADCAST, FeederCommand::UninitializedFeedersRespond).is_none());
}

#[test]
fn initialize_with_wrong_uuid_reports_own() {
    let parts = SimParts::new();
    let mut rig = rig(&parts);

    let reply = ask(&mut rig, FeederCommand::InitializeFeeder { uuid: [0; 12] });
    assert_eq!(result(&reply), ResultCode::WrongFeederId);
    assert_eq!(&reply.payload[1..], &UUID);
    assert!(!rig.feeder().is_initialized());
}
