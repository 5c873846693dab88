//! End-to-end tick scenarios against the demo profile
//!
//! Each test drives a [`Bridge`] tick by tick while the test body plays the
//! game (consuming deliveries, flipping location flags, reloading saves)
//! and the emulator (detaching, resuming).

mod common;

use anyhow::Result;
use membridge_core::bridge::storage_key;
use membridge_core::remote::DataStorageOperation;
use membridge_core::{
    Bridge, BridgeConfig, BridgeEvent, ClientMessage, DeliveryEvent, MemoryPort, ServerMessage,
    SessionEvent, SessionLink, TickPhase,
};
use serde_json::json;

use common::*;

fn deliveries(events: &[BridgeEvent]) -> Vec<DeliveryEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            BridgeEvent::Delivery(d) => Some(d.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Delivery
// ============================================================================

/// The game consumes an item while the emulator connection is down; after
/// re-attaching the bridge credits the ack instead of injecting again.
#[tokio::test]
async fn test_ack_during_outage_is_recovered_not_redelivered() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[1, 2, 3, 4])).await?;

    let report = bridge.tick(&mut port, &mut link).await?;
    assert_eq!(report.phase, TickPhase::Synchronized);
    assert_eq!(
        deliveries(&report.events),
        vec![DeliveryEvent::Injected { index: 0, item: 1 }]
    );
    assert_eq!(game.consume(), Some((1, 0)));

    let report = bridge.tick(&mut port, &mut link).await?;
    assert_eq!(
        deliveries(&report.events),
        vec![
            DeliveryEvent::Consumed { index: 0, item: 1 },
            DeliveryEvent::Injected { index: 1, item: 2 },
        ]
    );

    // consumed while nobody is watching
    assert_eq!(game.consume(), Some((2, 30)));
    game.process.detach();
    let err = bridge.tick(&mut port, &mut link).await.unwrap_err();
    assert!(err.is_transport());
    assert!(!bridge.is_verified());

    game.process.resume();
    port.attach().await?;
    let report = bridge.tick(&mut port, &mut link).await?;
    assert!(report
        .events
        .iter()
        .any(|e| matches!(e, BridgeEvent::SessionVerified { .. })));
    assert_eq!(
        deliveries(&report.events),
        vec![
            DeliveryEvent::Recovered { index: 1 },
            DeliveryEvent::CounterApplied {
                index: 2,
                item: 3,
                counter: "heart_pieces".into(),
            },
            DeliveryEvent::Injected { index: 3, item: 4 },
        ]
    );
    assert_eq!(game.byte(HEART_PIECES), 1);
    assert_eq!(game.cursor(), 3);
    assert_eq!(game.consume(), Some((16, 50)));
    Ok(())
}

/// A new bridge instance finds an item already waiting in the slot and
/// waits for it instead of writing the payload again.
#[tokio::test]
async fn test_restarted_bridge_adopts_in_flight_item() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, remote) = SessionLink::pair(64);

    let mut first = Bridge::new(demo_profile(), &BridgeConfig::default());
    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[2])).await?;
    first.tick(&mut port, &mut link).await?;
    assert_ne!(game.flags() & READY, 0);
    drop(first);

    let mut second = Bridge::new(demo_profile(), &BridgeConfig::default());
    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[2])).await?;
    game.process.clear_write_log();

    let report = second.tick(&mut port, &mut link).await?;
    assert!(deliveries(&report.events).is_empty());
    assert!(game.process.write_log().is_empty());
    assert!(second.slot_state().in_flight().is_some());

    game.consume();
    let report = second.tick(&mut port, &mut link).await?;
    assert_eq!(
        deliveries(&report.events),
        vec![DeliveryEvent::Consumed { index: 0, item: 2 }]
    );
    assert_eq!(game.cursor(), 1);
    Ok(())
}

/// Reconnecting to the session resends the whole item list; the cursor
/// persisted in the save keeps already delivered items from repeating.
#[tokio::test]
async fn test_session_reconnect_delivers_only_new_items() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[1, 99, 2])).await?;
    let mut injected = Vec::new();
    for _ in 0..4 {
        let report = bridge.tick(&mut port, &mut link).await?;
        injected.extend(deliveries(&report.events));
        game.consume();
    }
    assert_eq!(game.cursor(), 3);

    remote.events.send(SessionEvent::Disconnected).await?;
    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[1, 99, 2, 1])).await?;
    let report = bridge.tick(&mut port, &mut link).await?;
    injected.extend(deliveries(&report.events));

    let indices: Vec<usize> = injected
        .iter()
        .filter_map(|e| match e {
            DeliveryEvent::Injected { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, vec![0, 2, 3]);
    assert!(injected.contains(&DeliveryEvent::Skipped { index: 1, item: 99 }));
    Ok(())
}

// ============================================================================
// Locations
// ============================================================================

#[tokio::test]
async fn test_locations_reported_once_with_group_budget() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, mut remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote
        .events
        .send(connected(SEED, &[1001, 2001, 2002]))
        .await?;
    game.set_bits(CHESTS, 0b111);
    game.process.poke(SHOP, &[7])?;
    game.set_bits(FLAGS, PENDING);

    bridge.tick(&mut port, &mut link).await?;
    assert_eq!(
        outbound(&mut remote),
        vec![ClientMessage::LocationChecks {
            locations: vec![1002, 1003, 2003, 2004, 2005],
        }]
    );
    assert_eq!(game.flags() & PENDING, 0);

    // more shop purchases than checks: absorbed
    game.process.poke(SHOP, &[8])?;
    bridge.tick(&mut port, &mut link).await?;
    assert!(outbound(&mut remote).is_empty());

    game.set_bits(BOSS, 0b1);
    game.set_bits(HERMIT, 0b10);
    bridge.tick(&mut port, &mut link).await?;
    assert_eq!(
        outbound(&mut remote),
        vec![ClientMessage::LocationChecks {
            locations: vec![1010, 1100],
        }]
    );
    assert_eq!(bridge.scanner().checked().len(), 10);
    Ok(())
}

fn location_checks(messages: &[ClientMessage]) -> Vec<Vec<u64>> {
    messages
        .iter()
        .filter_map(|m| match m {
            ClientMessage::LocationChecks { locations } => Some(locations.clone()),
            _ => None,
        })
        .collect()
}

/// The emulator goes away and comes back with an older save. Checked
/// locations are rebuilt from the session and memory; nothing is reported
/// twice and later progress is reported from where the session stands.
#[tokio::test]
async fn test_locations_rebuilt_after_detach_with_older_save() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, mut remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote.events.send(connected(SEED, &[2001])).await?;
    game.set_bits(CHESTS, 0b001);
    game.process.poke(SHOP, &[3])?;
    bridge.tick(&mut port, &mut link).await?;
    assert_eq!(
        location_checks(&outbound(&mut remote)),
        vec![vec![1001, 2002, 2003]]
    );

    game.process.detach();
    assert!(bridge.tick(&mut port, &mut link).await.unwrap_err().is_transport());

    // the older save predates the chest and two purchases
    game.clear_bits(CHESTS, 0b001);
    game.process.poke(SHOP, &[1])?;
    game.process.resume();
    port.attach().await?;
    bridge.tick(&mut port, &mut link).await?;
    assert!(location_checks(&outbound(&mut remote)).is_empty());
    assert_eq!(bridge.scanner().checked().len(), 4);
    assert_eq!(bridge.scanner().groups()[0].last_sent(), 3);

    game.set_bits(CHESTS, 0b011);
    game.process.poke(SHOP, &[4])?;
    bridge.tick(&mut port, &mut link).await?;
    assert_eq!(
        location_checks(&outbound(&mut remote)),
        vec![vec![1002, 2004]]
    );
    Ok(())
}

// ============================================================================
// Progress counters
// ============================================================================

/// Loading an older save rolls the counter and the cursor back together;
/// the counter items are delivered again and land exactly once.
#[tokio::test]
async fn test_save_reload_redelivers_counter_items() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, mut remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[3, 3])).await?;
    bridge.tick(&mut port, &mut link).await?;
    assert_eq!(game.byte(HEART_PIECES), 2);
    assert_eq!(game.cursor(), 2);
    outbound(&mut remote);

    game.process.poke(HEART_PIECES, &[0])?;
    game.process.poke(CURSOR, &[0, 0])?;
    let mut events = Vec::new();
    for _ in 0..4 {
        events.extend(bridge.tick(&mut port, &mut link).await?.events);
    }
    assert!(!events
        .iter()
        .any(|e| matches!(e, BridgeEvent::CounterRepaired { .. })));
    assert_eq!(deliveries(&events).len(), 2);
    assert_eq!(game.byte(HEART_PIECES), 2);
    assert_eq!(game.cursor(), 2);
    assert_eq!(bridge.progress().counter("heart_pieces").unwrap().local(), 2);
    Ok(())
}

/// The counter drops while the delivery cursor stays put: the bridge
/// restores it. Later gameplay progress is adopted and published.
#[tokio::test]
async fn test_counter_regression_restored_then_adopted() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, mut remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[3, 3])).await?;
    bridge.tick(&mut port, &mut link).await?;
    assert_eq!(game.byte(HEART_PIECES), 2);
    let key = storage_key(1, "heart_pieces");
    assert!(outbound(&mut remote).contains(&ClientMessage::replace(key.clone(), json!(2))));

    game.process.poke(HEART_PIECES, &[0])?;
    let report = bridge.tick(&mut port, &mut link).await?;
    assert!(report.events.contains(&BridgeEvent::CounterRepaired {
        counter: "heart_pieces".into(),
        value: 2,
        memory: 0,
    }));
    assert_eq!(game.byte(HEART_PIECES), 2);
    assert!(outbound(&mut remote).is_empty());

    game.process.poke(HEART_PIECES, &[3])?;
    bridge.tick(&mut port, &mut link).await?;
    let sent = outbound(&mut remote);
    assert!(sent.iter().any(|m| matches!(
        m,
        ClientMessage::Set { key: k, operations, .. }
            if *k == key && operations == &vec![DataStorageOperation::Replace(json!(3))]
    )));
    assert_eq!(bridge.progress().counter("heart_pieces").unwrap().local(), 3);
    Ok(())
}

// ============================================================================
// Death link and goal
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_death_link_both_directions() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, mut remote) = SessionLink::pair(64);
    let config = BridgeConfig {
        death_link: true,
        ..BridgeConfig::default()
    };
    let mut bridge = Bridge::new(demo_profile(), &config);

    remote.events.send(connected(SEED, &[])).await?;
    remote
        .events
        .send(SessionEvent::Message(ServerMessage::Bounced {
            tags: vec!["DeathLink".into()],
            data: json!({ "time": 1.0, "cause": "", "source": "Bob" }),
        }))
        .await?;

    let report = bridge.tick(&mut port, &mut link).await?;
    assert!(report.events.contains(&BridgeEvent::DeathReceived {
        source: "Bob".into()
    }));
    assert_ne!(game.flags() & DEATH_IN, 0);
    assert_eq!(game.text(DEATH_TEXT, 32), "Bob died");
    assert_eq!(game.text(DEATH_FROM, 16), "Bob");

    // the player dies right after: still inside the cooldown
    game.clear_bits(FLAGS, DEATH_IN);
    game.set_bits(FLAGS, DEATH_OUT);
    bridge.tick(&mut port, &mut link).await?;
    assert!(outbound(&mut remote).is_empty());
    assert_eq!(game.flags() & DEATH_OUT, 0);

    tokio::time::advance(config.death_link_cooldown()).await;
    game.set_bits(FLAGS, DEATH_OUT);
    let report = bridge.tick(&mut port, &mut link).await?;
    assert!(report.events.contains(&BridgeEvent::DeathSent));
    match outbound(&mut remote).as_slice() {
        [ClientMessage::Bounce { tags, data }] => {
            assert_eq!(tags, &vec!["DeathLink".to_string()]);
            assert_eq!(data.source, PLAYER);
        }
        other => panic!("expected one bounce, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_goal_reported_once() -> Result<()> {
    let game = Game::boot(SEED);
    let mut port = game.port();
    port.attach().await?;
    let (mut link, mut remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote.events.send(connected(SEED, &[])).await?;
    bridge.tick(&mut port, &mut link).await?;
    game.set_bits(GOAL, 0b1);

    let mut goals = 0;
    for _ in 0..3 {
        let report = bridge.tick(&mut port, &mut link).await?;
        goals += report
            .events
            .iter()
            .filter(|e| **e == BridgeEvent::GoalReached)
            .count();
    }
    assert_eq!(goals, 1);
    assert_eq!(outbound(&mut remote).len(), 1);
    Ok(())
}

// ============================================================================
// Session gate
// ============================================================================

#[tokio::test]
async fn test_blank_save_waits_then_verifies() -> Result<()> {
    let game = Game::boot("");
    let mut port = game.port();
    port.attach().await?;
    let (mut link, remote) = SessionLink::pair(64);
    let mut bridge = Bridge::new(demo_profile(), &BridgeConfig::default());

    remote.events.send(connected(SEED, &[])).await?;
    remote.events.send(received(0, &[1])).await?;
    for _ in 0..5 {
        let report = bridge.tick(&mut port, &mut link).await?;
        assert_eq!(report.phase, TickPhase::Verifying);
    }
    assert_eq!(game.flags(), 0);

    // the game writes the seed when the save file is created
    game.process.poke(SESSION_ID, SEED.as_bytes())?;
    let report = bridge.tick(&mut port, &mut link).await?;
    assert_eq!(report.phase, TickPhase::Synchronized);
    assert_ne!(game.flags() & READY, 0);
    Ok(())
}
