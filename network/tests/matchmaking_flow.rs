// SPDX-License-Identifier: MIT OR Apache-2.0

//! Full signaling pipeline: validate relay endpoints, seek on both
//! sides, run the offer/answer exchange through the relays, and confirm
//! the tie-break picks exactly one initiator.

use async_trait::async_trait;
use phalanx_network::matchmaking::{MatchEvent, Matchmaker};
use phalanx_network::identity::LocalIdentity;
use phalanx_network::relay_directory::{RelayDirectory, RelayProbe};
use phalanx_network::signaling::MemoryRelay;
use phalanx_network::NetworkConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct AlwaysUp;

#[async_trait]
impl RelayProbe for AlwaysUp {
    async fn probe(&self, _url: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn expect_event(
    rx: &mut mpsc::UnboundedReceiver<MatchEvent>,
    want: impl Fn(&MatchEvent) -> bool,
) -> MatchEvent {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if want(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

#[tokio::test]
async fn seek_offer_answer_through_validated_relays() {
    let config = NetworkConfig::default();

    // Validate the configured endpoints first
    let directory = RelayDirectory::new(&config, AlwaysUp);
    let endpoints = directory.get_relays(3).await.unwrap();
    assert!(endpoints.len() >= config.min_relays);

    let hub = MemoryRelay::new();
    let alice = Arc::new(LocalIdentity::generate());
    let bob = Arc::new(LocalIdentity::generate());

    let (mm_alice, mut rx_alice) = Matchmaker::new(
        Arc::clone(&alice),
        Arc::clone(&hub),
        endpoints.clone(),
        &config,
    );
    let (mm_bob, mut rx_bob) =
        Matchmaker::new(Arc::clone(&bob), Arc::clone(&hub), endpoints, &config);

    mm_alice.seek("1v1", Some(1400)).await.unwrap();
    mm_bob.seek("1v1", Some(1450)).await.unwrap();

    let found_alice = match expect_event(&mut rx_alice, |e| matches!(e, MatchEvent::MatchFound(_))).await
    {
        MatchEvent::MatchFound(op) => op,
        _ => unreachable!(),
    };
    let found_bob = match expect_event(&mut rx_bob, |e| matches!(e, MatchEvent::MatchFound(_))).await {
        MatchEvent::MatchFound(op) => op,
        _ => unreachable!(),
    };

    assert_eq!(&found_alice.identity, bob.peer_id());
    assert_eq!(&found_bob.identity, alice.peer_id());
    assert_ne!(found_alice.initiator, found_bob.initiator, "exactly one side initiates");

    // The initiator sends the offer; the responder answers
    let (initiator_mm, initiator_rx, responder_mm, responder_rx, responder_target) =
        if found_alice.initiator {
            (&mm_alice, &mut rx_alice, &mm_bob, &mut rx_bob, bob.peer_id().clone())
        } else {
            (&mm_bob, &mut rx_bob, &mm_alice, &mut rx_alice, alice.peer_id().clone())
        };

    initiator_mm
        .send_offer(
            &responder_target,
            "v=0 s=offer",
            vec!["candidate:1".into()],
            Some("1v1".into()),
            Some("alpha".into()),
        )
        .await
        .unwrap();

    let offer = expect_event(responder_rx, |e| matches!(e, MatchEvent::OfferReceived { .. })).await;
    let offer_from = match offer {
        MatchEvent::OfferReceived { from, sdp, mode, map_id, .. } => {
            assert_eq!(sdp, "v=0 s=offer");
            assert_eq!(mode.as_deref(), Some("1v1"));
            assert_eq!(map_id.as_deref(), Some("alpha"));
            from
        }
        _ => unreachable!(),
    };

    responder_mm
        .send_answer(&offer_from, "v=0 s=answer", vec!["candidate:9".into()])
        .await
        .unwrap();

    let answer =
        expect_event(initiator_rx, |e| matches!(e, MatchEvent::AnswerReceived { .. })).await;
    match answer {
        MatchEvent::AnswerReceived { from, sdp, ice_candidates } => {
            assert_eq!(&from, &responder_target);
            assert_eq!(sdp, "v=0 s=answer");
            assert_eq!(ice_candidates, vec!["candidate:9".to_string()]);
        }
        _ => unreachable!(),
    }

    mm_alice.cancel().await;
    mm_bob.cancel().await;
}
