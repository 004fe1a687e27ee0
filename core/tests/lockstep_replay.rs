// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol-level scenario: two clients issue identical command streams
//! through independent generators, exchange them as wire messages, and
//! end up with identical logs; then one rejoins from an old tick and
//! replays the gap.

use phalanx_core::{
    CommandIdGenerator, CommandKind, CommandLog, EntityDigest, GameMessage, MessagePayload,
    StateChecksum,
};

fn wire_round_trip(message: &GameMessage) -> GameMessage {
    let json = serde_json::to_string(message).unwrap();
    serde_json::from_str(&json).unwrap()
}

#[test]
fn two_clients_build_identical_logs() {
    let mut gen_a = CommandIdGenerator::new();
    let mut gen_b = CommandIdGenerator::new();
    let mut log_a = CommandLog::new();
    let mut log_b = CommandLog::new();

    for tick in 1..=5u64 {
        // A issues locally and ships to B
        let cmd = gen_a.issue(
            CommandKind::AttackMove,
            "a",
            tick,
            vec![tick],
            serde_json::json!({"x": tick * 10}),
        );
        log_a.record(tick, vec![cmd.clone()]);

        let message = wire_round_trip(&GameMessage::new(
            "a".into(),
            tick,
            tick,
            MessagePayload::Input { commands: vec![cmd] },
        ));
        match message.payload {
            MessagePayload::Input { commands } => log_b.record(message.tick, commands),
            _ => unreachable!(),
        }

        // B independently derives the same ID for the same logical command
        let expected = gen_b.next_id("a", tick);
        assert_eq!(log_b.commands_at(tick)[0].id, expected);
    }

    assert_eq!(log_a.current_tick(), log_b.current_tick());
    for tick in 1..=5u64 {
        assert_eq!(log_a.commands_at(tick), log_b.commands_at(tick));
    }
}

#[test]
fn rejoin_replays_exactly_the_gap() {
    let mut gen = CommandIdGenerator::new();
    let mut holder = CommandLog::new();
    for tick in 1..=8u64 {
        let cmd = gen.issue(CommandKind::Build, "b", tick, vec![1], serde_json::Value::Null);
        holder.record(tick, vec![cmd]);
    }

    // The rejoiner saw everything up to tick 5
    let response = wire_round_trip(&GameMessage::new(
        "b".into(),
        8,
        99,
        MessagePayload::SyncResponse { current_tick: holder.current_tick(), ticks: holder.since(5) },
    ));

    let mut rejoiner = CommandLog::new();
    match response.payload {
        MessagePayload::SyncResponse { current_tick, ticks } => {
            assert_eq!(current_tick, 8);
            let replayed: Vec<u64> = ticks.iter().map(|t| t.tick).collect();
            assert_eq!(replayed, vec![5, 6, 7, 8]);
            rejoiner.merge(ticks);
        }
        _ => unreachable!(),
    }
    assert_eq!(rejoiner.current_tick(), 8);
    assert_eq!(rejoiner.commands_at(8), holder.commands_at(8));
}

#[test]
fn desync_report_crosses_the_wire_intact() {
    let healthy = vec![EntityDigest { id: 7, health: 420, x: 3, y: 9 }];
    let hurt = vec![EntityDigest { id: 7, health: 360, x: 3, y: 9 }];

    let local = StateChecksum::compute(60, &healthy, 2_000);
    let remote = StateChecksum::compute(60, &hurt, 2_000);
    let report = phalanx_core::DesyncReport::new(local, remote, true).unwrap();

    let message =
        wire_round_trip(&GameMessage::new("a".into(), 60, 3, MessagePayload::Desync(report)));
    match message.payload {
        MessagePayload::Desync(report) => {
            assert_eq!(report.tick, 60);
            assert_eq!(report.divergence, phalanx_core::DivergenceKind::Health);
            assert!(report.request_state_dump);
            assert_ne!(report.local.primary, report.remote.primary);
        }
        _ => unreachable!(),
    }
}
