//! Shared fixtures for the integration tests: the demo profile and a
//! simulated game that plays its side of the memory protocol.

#![allow(dead_code)]

use membridge_core::{
    ClientMessage, GameProfile, InMemoryPort, NetworkItem, ProcessHandle, RemoteEndpoint,
    ResolvedProfile, ServerMessage, SessionEvent,
};

pub const DEMO_PROFILE: &str = include_str!("../../../../profiles/demo.json");

pub const SEED: &str = "DEMO-SEED";
pub const PLAYER: &str = "Alice";

// sram @ 0x700000
pub const SESSION_ID: u32 = 0x7007C0;
pub const CURSOR: u32 = 0x7007D0;
pub const GOAL: u32 = 0x7007D2;
pub const HEART_PIECES: u32 = 0x7007D4;
pub const SHOP: u32 = 0x7007D6;
pub const CHESTS: u32 = 0x700000;
pub const HERMIT: u32 = 0x700001;
pub const BOSS: u32 = 0x700008;

// wram @ 0x7E0000
pub const RECV_ITEM: u32 = 0x7E1F00;
pub const RECV_EXTRA: u32 = 0x7E1F02;
pub const RECV_TAG: u32 = 0x7E1F04;
pub const FLAGS: u32 = 0x7E1F05;
pub const DEATH_TEXT: u32 = 0x7E1F10;
pub const DEATH_FROM: u32 = 0x7E1F30;

pub const READY: u8 = 1 << 0;
pub const ACK: u8 = 1 << 1;
pub const DEATH_IN: u8 = 1 << 2;
pub const DEATH_OUT: u8 = 1 << 3;
pub const PENDING: u8 = 1 << 4;

pub fn demo_profile() -> ResolvedProfile {
    GameProfile::from_json(DEMO_PROFILE)
        .expect("demo profile parses")
        .resolve()
        .expect("demo profile resolves")
}

/// The game side of a simulated emulator running the demo profile.
#[derive(Clone)]
pub struct Game {
    pub process: ProcessHandle,
}

impl Game {
    /// A freshly booted save that already carries `seed`.
    pub fn boot(seed: &str) -> Self {
        let process = ProcessHandle::new()
            .map(0x7E0000, 0x2000)
            .map(0x700000, 0x800);
        process.poke(SESSION_ID, seed.as_bytes()).unwrap();
        Self { process }
    }

    pub fn port(&self) -> InMemoryPort {
        InMemoryPort::new(self.process.clone())
    }

    pub fn byte(&self, address: u32) -> u8 {
        self.process.peek_byte(address).unwrap()
    }

    pub fn word(&self, address: u32) -> u16 {
        let bytes = self.process.peek(address, 2).unwrap();
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    pub fn set_bits(&self, address: u32, mask: u8) {
        let byte = self.byte(address);
        self.process.poke(address, &[byte | mask]).unwrap();
    }

    pub fn clear_bits(&self, address: u32, mask: u8) {
        let byte = self.byte(address);
        self.process.poke(address, &[byte & !mask]).unwrap();
    }

    pub fn flags(&self) -> u8 {
        self.byte(FLAGS)
    }

    pub fn cursor(&self) -> u16 {
        self.word(CURSOR)
    }

    /// Take the item out of the slot the way the game's receive routine
    /// does: read the payload, drop ready, raise ack.
    pub fn consume(&self) -> Option<(u16, u16)> {
        if self.flags() & READY == 0 {
            return None;
        }
        let item = (self.word(RECV_ITEM), self.word(RECV_EXTRA));
        let flags = self.flags();
        self.process
            .poke(FLAGS, &[(flags & !READY) | ACK])
            .unwrap();
        Some(item)
    }

    pub fn text(&self, address: u32, len: u32) -> String {
        let bytes = self.process.peek(address, len).unwrap();
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

pub fn connected(seed: &str, checked: &[u64]) -> SessionEvent {
    SessionEvent::Message(ServerMessage::Connected {
        slot: 1,
        slot_name: PLAYER.into(),
        seed_name: seed.into(),
        checked_locations: checked.to_vec(),
    })
}

pub fn received(index: usize, ids: &[u64]) -> SessionEvent {
    SessionEvent::Message(ServerMessage::ReceivedItems {
        index,
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

/// Everything the bridge queued for the server so far.
pub fn outbound(remote: &mut RemoteEndpoint) -> Vec<ClientMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = remote.outbound.try_recv() {
        messages.push(message);
    }
    messages
}
