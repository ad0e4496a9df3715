//! End-to-end feeder scenarios over the simulated bus and mechanism

use gluon_feeder::{
    commands::{FeederCommand, MoveAmount, MoveRequest},
    config::{BusConfig, FeederConfig, SettingKey, SettingValue},
    hal::{Mechanism, MockStore, SimParts, SimRig},
    protocol::{encode_command, ProtocolFrame, ResultCode, BROADCAST},
    Direction, FaultCode, LifecycleState,
};

const ADDRESS: u8 = 5;

fn config() -> FeederConfig {
    FeederConfig::default().with_bus(BusConfig::default().with_address(ADDRESS))
}

fn rig(parts: &SimParts, mechanism: Mechanism) -> SimRig<'_> {
    parts.rig(config(), mechanism, MockStore::new())
}

fn result(reply: &ProtocolFrame) -> ResultCode {
    ResultCode::from_u8(reply.payload[0]).unwrap()
}

fn ask(rig: &mut SimRig<'_>, command: FeederCommand) -> ProtocolFrame {
    rig.request(command).expect("feeder did not answer")
}

fn forward(tenths: u16) -> FeederCommand {
    FeederCommand::Move(MoveRequest::forward_tenths(tenths))
}

fn backward(tenths: u16) -> FeederCommand {
    FeederCommand::Move(MoveRequest::backward_tenths(tenths))
}

// ============================================================================
// Moves
// ============================================================================

#[test]
fn forward_move_reaches_target() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    let reply = ask(&mut rig, forward(40));
    assert_eq!(reply.from, ADDRESS);
    assert_eq!(result(&reply), ResultCode::InProgress);
    assert_eq!(rig.lifecycle(), LifecycleState::Moving);

    assert!(rig.settle(2_000));
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    // 4 mm at the nominal 225.46 ticks/mm
    assert!((rig.position() - 902).abs() <= 20, "ended at {}", rig.position());

    let status = ask(&mut rig, FeederCommand::MoveStatus);
    assert_eq!(result(&status), ResultCode::Ok);
    assert_eq!(status.payload[1], 0);
    assert_eq!(parts.perf.snapshot().moves_completed, 1);
    assert_eq!(rig.mechanism().effective_drive(), 0.0);
}

#[test]
fn pitch_moves_accumulate_without_drift() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());
    let pitch = FeederCommand::Move(MoveRequest {
        direction: Direction::Forward,
        amount: MoveAmount::Pitch(4),
    });
    for _ in 0..5 {
        assert_eq!(result(&ask(&mut rig, pitch)), ResultCode::InProgress);
        assert!(rig.settle(2_000));
    }
    // targets are laid out from the commanded position, not the measured one
    assert!((rig.position() - 5 * 902).abs() <= 20, "ended at {}", rig.position());
    assert_eq!(parts.perf.snapshot().moves_completed, 5);
}

#[test]
fn reverse_move_finishes_with_forward_approach() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new().with_backlash(24.0));

    ask(&mut rig, forward(40));
    assert!(rig.settle(2_000));
    ask(&mut rig, backward(20));
    assert!(rig.settle(3_000));

    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    assert_eq!(rig.feeder().move_result(), ResultCode::Ok);
    assert!((rig.position() - 451).abs() <= 20, "ended at {}", rig.position());
    // the last segment drove forward, so the gear train is loaded that way
    let m = rig.mechanism();
    assert!(m.motor_pos - m.output_pos >= m.backlash - 1.0);
}

#[test]
fn zero_distance_move_never_drives() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    assert_eq!(result(&ask(&mut rig, forward(0))), ResultCode::Ok);
    rig.run_ms(20);
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    assert!(!rig.control().is_moving());
    assert_eq!(rig.position(), 0);
    assert_eq!(rig.mechanism().velocity(), 0.0);
}

#[test]
fn over_travel_rejected_before_motion() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    assert_eq!(result(&ask(&mut rig, forward(401))), ResultCode::Rejected);
    rig.run_ms(20);
    assert_eq!(rig.position(), 0);
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    assert_eq!(rig.feeder().state().last_result, ResultCode::Rejected);
}

#[test]
fn overlapping_move_is_busy() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    ask(&mut rig, forward(200));
    assert_eq!(result(&ask(&mut rig, forward(10))), ResultCode::Busy);
    assert!(rig.settle(3_000));
    assert!((rig.position() - 4509).abs() <= 20);
}

// ============================================================================
// Faults
// ============================================================================

#[test]
fn jammed_tape_stalls_and_clear_needs_a_passing_probe() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());
    rig.mechanism_mut().blocked = true;

    ask(&mut rig, forward(40));
    assert!(rig.settle(2_000));
    assert_eq!(rig.lifecycle(), LifecycleState::Fault);
    assert_eq!(rig.feeder().state().fault, Some(FaultCode::MotionStall));

    let status = ask(&mut rig, FeederCommand::MoveStatus);
    assert_eq!(result(&status), ResultCode::CouldntReach);
    assert_eq!(status.payload[1], FaultCode::MotionStall as u8);
    assert_eq!(result(&ask(&mut rig, forward(10))), ResultCode::Faulted);

    // still jammed: the probe stalls and the fault stays
    assert_eq!(result(&ask(&mut rig, FeederCommand::ClearFault)), ResultCode::InProgress);
    assert!(rig.settle(3_000));
    assert_eq!(rig.lifecycle(), LifecycleState::Fault);
    assert_eq!(rig.feeder().state().last_result, ResultCode::Rejected);

    rig.mechanism_mut().blocked = false;
    assert_eq!(result(&ask(&mut rig, FeederCommand::ClearFault)), ResultCode::InProgress);
    assert!(rig.settle(3_000));
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    assert_eq!(rig.feeder().state().fault, None);

    assert_eq!(result(&ask(&mut rig, forward(10))), ResultCode::InProgress);
    assert!(rig.settle(2_000));
    assert_eq!(rig.feeder().move_result(), ResultCode::Ok);
}

#[test]
fn overtemperature_fault_clears_once_cool() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    ask(&mut rig, forward(200));
    rig.mechanism_mut().temperature_c = 90;
    assert!(rig.settle(100));
    assert_eq!(rig.lifecycle(), LifecycleState::Fault);
    assert_eq!(rig.feeder().state().fault, Some(FaultCode::MotionOvertemp));
    assert_eq!(rig.feeder().move_result(), ResultCode::Fail);

    assert_eq!(result(&ask(&mut rig, FeederCommand::ClearFault)), ResultCode::Rejected);
    rig.mechanism_mut().temperature_c = 40;
    rig.run_ms(2);
    assert_eq!(result(&ask(&mut rig, FeederCommand::ClearFault)), ResultCode::Ok);
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
}

#[test]
fn critical_temperature_while_idle_is_estop() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());
    rig.mechanism_mut().temperature_c = 110;
    rig.run_ms(2);
    assert_eq!(rig.lifecycle(), LifecycleState::Estop);
    assert_eq!(rig.feeder().state().fault, Some(FaultCode::MotionOvertemp));
}

// ============================================================================
// Emergency stop
// ============================================================================

fn arm(rig: &mut SimRig<'_>) -> u16 {
    let reply = ask(rig, FeederCommand::ResetEstopArm);
    assert_eq!(result(&reply), ResultCode::Ok);
    u16::from_be_bytes([reply.payload[1], reply.payload[2]])
}

#[test]
fn estop_cuts_drive_and_needs_handshake() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    ask(&mut rig, forward(200));
    rig.run_ms(20);
    assert!(rig.control().is_moving());

    assert_eq!(result(&ask(&mut rig, FeederCommand::EmergencyStop)), ResultCode::Ok);
    rig.run_ms(2);
    assert_eq!(rig.lifecycle(), LifecycleState::Estop);
    assert!(!rig.control().is_moving());
    assert_eq!(rig.mechanism().effective_drive(), 0.0);

    let status = ask(&mut rig, FeederCommand::MoveStatus);
    assert_eq!(result(&status), ResultCode::EStopped);
    assert_eq!(result(&ask(&mut rig, forward(10))), ResultCode::EStopped);
    assert_eq!(
        result(&ask(&mut rig, FeederCommand::StartCalibration)),
        ResultCode::EStopped
    );

    let challenge = arm(&mut rig);
    let wrong = FeederCommand::ResetEstopConfirm {
        challenge: challenge ^ 0x5A5A,
    };
    assert_eq!(result(&ask(&mut rig, wrong)), ResultCode::Rejected);
    assert_eq!(rig.lifecycle(), LifecycleState::Estop);

    let challenge = arm(&mut rig);
    let confirm = FeederCommand::ResetEstopConfirm { challenge };
    assert_eq!(result(&ask(&mut rig, confirm)), ResultCode::Ok);
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);

    // moves work again from wherever the tape stopped
    let stopped_at = rig.position();
    assert_eq!(result(&ask(&mut rig, forward(20))), ResultCode::InProgress);
    assert!(rig.settle(2_000));
    assert!((rig.position() - (stopped_at + 451)).abs() <= 20);
}

#[test]
fn estop_reset_window_expires() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());
    ask(&mut rig, FeederCommand::EmergencyStop);
    let challenge = arm(&mut rig);
    rig.run_ms(5_100);
    let confirm = FeederCommand::ResetEstopConfirm { challenge };
    assert_eq!(result(&ask(&mut rig, confirm)), ResultCode::Rejected);
    assert_eq!(rig.lifecycle(), LifecycleState::Estop);
}

#[test]
fn stuck_enable_line_is_an_interlock() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());
    rig.mechanism_mut().stuck_enable = Some(true);
    rig.run_ms(3);
    assert_eq!(rig.lifecycle(), LifecycleState::Estop);
    assert_eq!(rig.feeder().state().fault, Some(FaultCode::SafetyInterlock));

    // refused while the line still disagrees
    let challenge = arm(&mut rig);
    let confirm = FeederCommand::ResetEstopConfirm { challenge };
    assert_eq!(result(&ask(&mut rig, confirm)), ResultCode::Rejected);

    rig.mechanism_mut().stuck_enable = None;
    rig.run_ms(2);
    let challenge = arm(&mut rig);
    let confirm = FeederCommand::ResetEstopConfirm { challenge };
    assert_eq!(result(&ask(&mut rig, confirm)), ResultCode::Ok);
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
}

// ============================================================================
// Bus behavior
// ============================================================================

#[test]
fn frames_for_other_feeders_are_ignored() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    rig.send_frame(&encode_command(ADDRESS + 1, 0xF0, 1, &forward(40)));
    rig.run_ms(10);
    assert!(rig.take_replies().is_empty());
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    assert_eq!(parts.perf.snapshot().address_ignored, 1);
}

#[test]
fn broadcast_reply_waits_for_its_slot() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    let sent_at = rig.now_us();
    rig.send_frame(&encode_command(BROADCAST, 0xF0, 7, &FeederCommand::QueryStatus));
    // guard 500 us plus 5 slots of 1 ms
    rig.run_ms(5);
    assert!(rig.take_replies().is_empty());
    rig.run_ms(2);
    let replies = rig.take_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].from, ADDRESS);
    assert_eq!(replies[0].packet_id, 7);
    assert!(rig.now_us() - sent_at >= 5_500);
}

#[test]
fn corrupted_frame_is_dropped_silently() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    let mut bytes = encode_command(ADDRESS, 0xF0, 1, &forward(40)).encode();
    bytes[6] ^= 0x10;
    let now = rig.now_us();
    rig.link_mut().bus_mut().inject_bytes(&bytes, now);
    rig.run_ms(10);
    assert!(rig.take_replies().is_empty());
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
    assert_eq!(parts.perf.snapshot().checksum_drops, 1);
}

#[test]
fn unknown_opcode_gets_error_frame() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    rig.send_frame(&ProtocolFrame::new(ADDRESS, 0xF0, 3, 0x42, &[]).unwrap());
    rig.run_ms(3);
    let replies = rig.take_replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].opcode, 0xFE);
    assert_eq!(
        replies[0].payload.as_slice(),
        &[ResultCode::Unsupported as u8, 0x42]
    );
    assert_eq!(rig.lifecycle(), LifecycleState::Idle);
}

#[test]
fn address_change_takes_effect_after_the_reply() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());

    let set = FeederCommand::SetSetting(SettingKey::BusAddress, SettingValue::Int(9));
    let reply = ask(&mut rig, set);
    assert_eq!(result(&reply), ResultCode::Ok);
    assert_eq!(reply.from, ADDRESS);
    assert_eq!(rig.link().address(), 9);

    rig.send_frame(&encode_command(ADDRESS, 0xF0, 40, &FeederCommand::QueryStatus));
    rig.run_ms(10);
    assert!(rig.take_replies().is_empty());

    let reply = ask(&mut rig, FeederCommand::QueryStatus);
    assert_eq!(reply.from, 9);
}

#[test]
fn performance_counters_over_the_bus() {
    let parts = SimParts::new();
    let mut rig = rig(&parts, Mechanism::new());
    ask(&mut rig, forward(20));
    assert!(rig.settle(2_000));

    let perf = ask(&mut rig, FeederCommand::GetPerformance);
    assert_eq!(result(&perf), ResultCode::Ok);
    assert_eq!(&perf.payload[1..5], &1u32.to_be_bytes());

    assert_eq!(result(&ask(&mut rig, FeederCommand::ResetPerformance)), ResultCode::Ok);
    let snap = parts.perf.snapshot();
    assert_eq!(snap.moves_completed, 0);
}
