//! Host-side feeder simulator.
//!
//! Runs one feeder against the simulated drive train and plays a short
//! host session over the simulated bus: identify, calibrate, feed a few
//! pitches, retract, then dump status and performance counters.
//!
//! # Usage
//!
//! ```sh
//! cargo run --bin feeder_sim --features sim
//! RUST_LOG=gluon_feeder=debug cargo run --bin feeder_sim --features sim
//! ```

use anyhow::{bail, Context, Result};
use tracing::info;

use gluon_feeder::commands::{FeederCommand, MoveAmount, MoveRequest};
use gluon_feeder::config::{BusConfig, FeederConfig};
use gluon_feeder::hal::{Mechanism, MockStore, SimParts, SimRig};
use gluon_feeder::protocol::{ProtocolFrame, ResultCode};
use gluon_feeder::{Direction, LifecycleState};

/// Bus address of the simulated feeder.
const FEEDER_ADDRESS: u8 = 5;

/// Simulated stops are 20 mm apart at 225.5 ticks per mm.
const STOP_LOW: f32 = -2000.0;
const STOP_HIGH: f32 = 2510.0;

fn result_of(reply: &ProtocolFrame) -> Result<ResultCode> {
    let byte = *reply.payload.first().context("reply without result byte")?;
    ResultCode::from_u8(byte).with_context(|| format!("unknown result code {byte:#04x}"))
}

fn request(rig: &mut SimRig<'_>, command: FeederCommand) -> Result<ProtocolFrame> {
    rig.request(command)
        .with_context(|| format!("no reply to {:?}", command.opcode()))
}

fn expect(rig: &mut SimRig<'_>, command: FeederCommand, want: ResultCode) -> Result<ProtocolFrame> {
    let reply = request(rig, command)?;
    let got = result_of(&reply)?;
    if got != want {
        bail!("{:?} answered {got:?}, expected {want:?}", command.opcode());
    }
    Ok(reply)
}

fn wait_idle(rig: &mut SimRig<'_>, what: &str) -> Result<()> {
    if !rig.settle(30_000) {
        bail!("{what} did not finish");
    }
    if rig.lifecycle() != LifecycleState::Idle {
        bail!(
            "{what} ended in {} ({:?})",
            rig.lifecycle().as_str(),
            rig.feeder().state().fault
        );
    }
    Ok(())
}

fn feed(rig: &mut SimRig<'_>, direction: Direction, pitch_mm: u8) -> Result<()> {
    let command = FeederCommand::Move(MoveRequest {
        direction,
        amount: MoveAmount::Pitch(pitch_mm),
    });
    expect(rig, command, ResultCode::InProgress)?;
    wait_idle(rig, "move")?;
    let status = expect(rig, FeederCommand::MoveStatus, ResultCode::Ok)?;
    info!(position = rig.position(), status = ?status.payload.as_slice(), "fed");
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gluon_feeder=info,feeder_sim=info".into()),
        )
        .with_target(false)
        .init();

    println!("=================================");
    println!("  gluon-feeder simulator");
    println!("=================================");
    println!();

    let config = FeederConfig::default().with_bus(BusConfig::default().with_address(FEEDER_ADDRESS));

    let mechanism = Mechanism::new()
        .with_backlash(24.0)
        .with_stops(STOP_LOW, STOP_HIGH);
    let parts = SimParts::new();
    let mut rig = parts.rig(config, mechanism, MockStore::new());

    let version = expect(&mut rig, FeederCommand::GetVersion, ResultCode::Ok)?;
    println!("protocol version: {}", version.payload[1]);

    expect(&mut rig, FeederCommand::StartCalibration, ResultCode::InProgress)?;
    wait_idle(&mut rig, "calibration")?;
    let profile = *rig.feeder().profile();
    println!(
        "calibrated: {:.2} ticks/mm, backlash {} ticks, stall current {} mA",
        profile.ticks_per_mm, profile.backlash_ticks, profile.stall_current_ma
    );

    // back away from the upper stop before feeding forward
    feed(&mut rig, Direction::Reverse, 12)?;
    for _ in 0..3 {
        feed(&mut rig, Direction::Forward, 4)?;
    }
    feed(&mut rig, Direction::Reverse, 2)?;

    let status = expect(&mut rig, FeederCommand::QueryStatus, ResultCode::Ok)?;
    println!("status payload: {:02x?}", &status.payload[1..]);

    let perf = expect(&mut rig, FeederCommand::GetPerformance, ResultCode::Ok)?;
    let counters = &perf.payload[1..];
    let completed = u32::from_be_bytes([counters[0], counters[1], counters[2], counters[3]]);
    let average_us = u32::from_be_bytes([counters[6], counters[7], counters[8], counters[9]]);
    println!("moves completed: {completed}, average {} ms", average_us / 1000);

    let snap = parts.perf.snapshot();
    println!(
        "frames received: {}, replies sent: {}, control ticks: {}",
        snap.frames_received, snap.replies_sent, snap.control_ticks
    );
    println!("simulated time: {} ms", rig.now_us() / 1000);
    Ok(())
}
