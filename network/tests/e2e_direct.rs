// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end direct scenario: code exchange, then a lockstep session
//! over the established channel.
//!
//! Peer A encodes an offer (mode `1v1`, map `alpha`); Peer B decodes it
//! and answers; A completes with B's answer; both sessions report
//! connected; a move command issued by A at tick 10 arrives at B inside
//! an input message with the identical deterministic ID.

mod common;

use common::LoopbackSdp;
use phalanx_core::{CommandKind, ConnectionState};
use phalanx_network::connect_code::{CodeExchange, CodeOptions, CodeRole};
use phalanx_network::game_session::{CommandSpec, GameSession, SessionEvent};
use phalanx_network::transport::MemoryChannel;
use phalanx_network::NetworkConfig;
use std::time::Duration;

#[tokio::test]
async fn offer_answer_complete_then_lockstep() {
    let gather = Duration::from_millis(200);
    let exchange_a = CodeExchange::new(LoopbackSdp::new("peer-a"), gather);
    let exchange_b = CodeExchange::new(LoopbackSdp::new("peer-b"), gather);

    // A produces a copy-pasteable offer code
    let options = CodeOptions { mode: Some("1v1".into()), map_id: Some("alpha".into()) };
    let (offer_code, handle) = exchange_a.offer(options).await.unwrap();
    assert!(offer_code.starts_with("PHX-"));

    // B pastes it, answers
    let (answer_code, offer) = exchange_b.answer(&offer_code).await.unwrap();
    assert_eq!(offer.role, CodeRole::Offer);
    assert_eq!(offer.mode.as_deref(), Some("1v1"));
    assert_eq!(offer.map_id.as_deref(), Some("alpha"));
    assert!(!offer.ice_candidates.is_empty());

    // A pastes the answer back
    let answer = exchange_a.complete(handle, &answer_code).await.unwrap();
    assert_eq!(answer.role, CodeRole::Answer);
    assert!(exchange_a.endpoint().accepted_answer().is_some());

    // Signaling done; the data channel comes up
    let config = NetworkConfig::default();
    let (channel_a, channel_b) = MemoryChannel::pair();
    let session_a = GameSession::new("A".into(), channel_a, &config);
    let session_b = GameSession::new("B".into(), channel_b, &config);
    let mut events_b = session_b.subscribe();

    session_a.connect(config.connect_timeout()).await.unwrap();
    session_b.connect(config.connect_timeout()).await.unwrap();
    assert_eq!(session_a.state(), ConnectionState::Connected);
    assert_eq!(session_b.state(), ConnectionState::Connected);

    // A issues a move for tick 10
    let sent = session_a
        .send_commands(
            10,
            vec![CommandSpec {
                kind: CommandKind::Move,
                entity_ids: vec![12],
                data: serde_json::json!({"x": 40, "y": 25}),
            }],
        )
        .await
        .unwrap();
    assert_eq!(sent[0].id, "A:10:1");

    // B receives the exact same command id inside an input batch
    let received = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let SessionEvent::CommandsReceived { tick, commands } =
                events_b.recv().await.unwrap()
            {
                return (tick, commands);
            }
        }
    })
    .await
    .expect("input batch not received");

    assert_eq!(received.0, 10);
    assert_eq!(received.1.len(), 1);
    assert_eq!(received.1[0].id, "A:10:1");
    assert_eq!(received.1[0].kind, CommandKind::Move);
    assert_eq!(received.1[0].player, "A");
}

#[tokio::test]
async fn answer_code_cannot_open_an_exchange() {
    let gather = Duration::from_millis(200);
    let exchange_a = CodeExchange::new(LoopbackSdp::new("peer-a"), gather);
    let exchange_b = CodeExchange::new(LoopbackSdp::new("peer-b"), gather);

    let (offer_code, _handle) = exchange_a.offer(CodeOptions::default()).await.unwrap();
    let (answer_code, _) = exchange_b.answer(&offer_code).await.unwrap();

    // Pasting an answer where an offer belongs fails loudly
    let err = exchange_b.answer(&answer_code).await.unwrap_err();
    assert!(err.to_string().contains("wrong code role"));
}
