//! The reconciliation loop
//!
//! Drives a [`Bridge`] at a fixed interval, keeps the port attached and
//! publishes status and events on a broadcast channel.
//!
//! ## Error policy
//!
//! | error                          | action                                   |
//! |--------------------------------|------------------------------------------|
//! | transport                      | tick aborted, re-attach with backoff     |
//! | session mismatch, closed link  | status `Error`, loop returns the error   |
//! | anything else                  | logged, `TickFailed` event, next tick    |
//!
//! Shutdown goes through a [`CancellationToken`]. It is only observed
//! between ticks, so a tick is never cut off halfway through a write
//! sequence.

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::events::{BridgeEvent, BridgeStatus};
use crate::port::MemoryPort;
use crate::profile::ResolvedProfile;
use crate::remote::SessionLink;

/// Long-running driver for one bridge
pub struct ReconciliationLoop<P> {
    bridge: Bridge,
    port: P,
    link: SessionLink,
    config: BridgeConfig,
    status: BridgeStatus,
    event_tx: broadcast::Sender<BridgeEvent>,
    shutdown: CancellationToken,
    needs_attach: bool,
    failures: u32,
}

impl<P: MemoryPort> ReconciliationLoop<P> {
    /// Create a loop for `profile` over `port` and `link`.
    pub fn new(profile: ResolvedProfile, config: BridgeConfig, port: P, link: SessionLink) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        Self {
            bridge: Bridge::new(profile, &config),
            port,
            link,
            config,
            status: BridgeStatus::Detached,
            event_tx,
            shutdown: CancellationToken::new(),
            needs_attach: true,
            failures: 0,
        }
    }

    /// Subscribe to status changes and bridge events.
    ///
    /// Slow subscribers lag rather than block the loop.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.event_tx.subscribe()
    }

    /// Token that stops the loop at the next tick boundary.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current status
    pub fn status(&self) -> &BridgeStatus {
        &self.status
    }

    /// The bridge state
    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// The port
    pub fn port(&self) -> &P {
        &self.port
    }

    fn set_status(&mut self, status: BridgeStatus) {
        if self.status != status {
            debug!(status = %status, "Bridge status changed");
            self.status = status.clone();
            let _ = self.event_tx.send(BridgeEvent::StatusChanged { status });
        }
    }

    fn publish(&self, event: BridgeEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run until shut down or a fatal error occurs.
    pub async fn run(&mut self) -> BridgeResult<()> {
        info!(
            interval_ms = self.config.tick_interval_ms,
            death_link = self.config.death_link,
            "Reconciliation loop started"
        );
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if self.needs_attach || !self.port.is_attached() {
                if let Err(e) = self.port.attach().await {
                    self.failures += 1;
                    let delay = self.config.reconnect_delay(self.failures);
                    warn!(
                        error = %e,
                        attempt = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        "Attach failed, backing off"
                    );
                    self.set_status(BridgeStatus::Reconnecting {
                        attempt: self.failures,
                    });
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                info!("Attached to target process");
                self.needs_attach = false;
                self.failures = 0;
            }

            match self.bridge.tick(&mut self.port, &mut self.link).await {
                Ok(report) => {
                    for event in report.events {
                        self.publish(event);
                    }
                    let status = self.bridge.status(report.phase);
                    self.set_status(status);
                }
                Err(e) if e.is_transport() => {
                    warn!(error = %e, "Lost target process");
                    self.needs_attach = true;
                    self.set_status(BridgeStatus::Detached);
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Bridge stopped");
                    self.set_status(BridgeStatus::Error {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "Tick failed");
                    self.publish(BridgeEvent::TickFailed {
                        message: e.to_string(),
                    });
                }
            }
        }

        info!("Reconciliation loop stopped");
        self.set_status(BridgeStatus::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::delivery::DeliveryEvent;
    use crate::error::BridgeError;
    use crate::port::{InMemoryPort, ProcessHandle};
    use crate::profile::fixtures;
    use crate::remote::{NetworkItem, ServerMessage, SessionEvent};

    const FLAGS: u32 = 0x100B;

    fn connected(seed: &str) -> SessionEvent {
        SessionEvent::Message(ServerMessage::Connected {
            slot: 1,
            slot_name: "Alice".into(),
            seed_name: seed.into(),
            checked_locations: vec![],
        })
    }

    fn items(ids: &[u64]) -> SessionEvent {
        SessionEvent::Message(ServerMessage::ReceivedItems {
            index: 0,
            items: ids
                .iter()
                .map(|&item| NetworkItem {
                    item,
                    location: 0,
                    player: 2,
                })
                .collect(),
        })
    }

    async fn wait_for(
        events: &mut broadcast::Receiver<BridgeEvent>,
        pred: impl Fn(&BridgeEvent) -> bool,
    ) -> BridgeEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn process() -> ProcessHandle {
        let process = ProcessHandle::new().map(0x1000, 64);
        process.poke(0x1000, b"SEED").unwrap();
        process
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_delivers_and_shuts_down() {
        let process = process();
        let (link, remote) = SessionLink::pair(64);
        let mut runner = ReconciliationLoop::new(
            fixtures::resolved(),
            BridgeConfig::default(),
            InMemoryPort::new(process.clone()),
            link,
        );
        let mut events = runner.subscribe();
        let token = runner.shutdown_token();
        let handle = tokio::spawn(async move {
            let result = runner.run().await;
            (result, runner)
        });

        remote.events.send(connected("SEED")).await.unwrap();
        remote.events.send(items(&[1])).await.unwrap();

        wait_for(&mut events, |e| {
            matches!(e, BridgeEvent::Delivery(DeliveryEvent::Injected { .. }))
        })
        .await;
        let flags = process.peek_byte(FLAGS).unwrap();
        process.poke(FLAGS, &[(flags & !0b01) | 0b10]).unwrap();
        wait_for(&mut events, |e| {
            matches!(e, BridgeEvent::Delivery(DeliveryEvent::Consumed { .. }))
        })
        .await;

        token.cancel();
        let (result, runner) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(runner.status(), &BridgeStatus::Stopped);
        assert_eq!(process.peek_byte(0x1004).unwrap(), 1);
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_reattaches_with_backoff() {
        let process = process();
        process.detach();
        let (link, remote) = SessionLink::pair(64);
        let mut runner = ReconciliationLoop::new(
            fixtures::resolved(),
            BridgeConfig::default(),
            InMemoryPort::new(process.clone()),
            link,
        );
        let mut events = runner.subscribe();
        let token = runner.shutdown_token();
        let handle = tokio::spawn(async move {
            let result = runner.run().await;
            (result, runner)
        });
        remote.events.send(connected("SEED")).await.unwrap();

        wait_for(&mut events, |e| {
            matches!(
                e,
                BridgeEvent::StatusChanged {
                    status: BridgeStatus::Reconnecting { attempt: 2 }
                }
            )
        })
        .await;

        process.resume();
        wait_for(&mut events, |e| matches!(e, BridgeEvent::SessionVerified { .. })).await;

        // emulator crashes mid-session, then comes back
        process.detach();
        wait_for(&mut events, |e| {
            matches!(
                e,
                BridgeEvent::StatusChanged {
                    status: BridgeStatus::Detached
                }
            )
        })
        .await;
        process.resume();
        wait_for(&mut events, |e| matches!(e, BridgeEvent::SessionVerified { .. })).await;

        token.cancel();
        let (result, _runner) = handle.await.unwrap();
        assert!(result.is_ok());
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_on_session_mismatch() {
        let process = process();
        process.poke(0x1000, b"OLD!").unwrap();
        let (link, remote) = SessionLink::pair(64);
        let mut runner = ReconciliationLoop::new(
            fixtures::resolved(),
            BridgeConfig::default(),
            InMemoryPort::new(process.clone()),
            link,
        );
        remote.events.send(connected("SEED")).await.unwrap();

        let result = runner.run().await;
        assert!(matches!(result, Err(BridgeError::SessionMismatch { .. })));
        assert!(matches!(runner.status(), BridgeStatus::Error { .. }));
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_tick() {
        let (link, _remote) = SessionLink::pair(8);
        let mut runner = ReconciliationLoop::new(
            fixtures::resolved(),
            BridgeConfig::default(),
            InMemoryPort::new(process()),
            link,
        );
        runner.shutdown_token().cancel();
        assert!(runner.run().await.is_ok());
        assert_eq!(runner.status(), &BridgeStatus::Stopped);
        assert!(!runner.port().is_attached());
    }
}
