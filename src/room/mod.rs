#![forbid(unsafe_code)]

// Room registry - active sharing sessions keyed by their join code

pub mod quality;

pub use quality::{QualityProfile, QualityTier};

use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::RwLock as StdRwLock;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

pub const CODE_LEN: usize = 6;
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
// 36^6 codes against one active room per process; hitting this means the RNG broke
const MAX_CODE_ATTEMPTS: usize = 64;

/// One active sharing session.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub code: String,
    pub host_id: String,
    pub created_at: SystemTime,
    pub viewers: HashSet<String>,
    pub quality_profile: QualityProfile,
    pub is_active: bool,
    pub host_address: IpAddr,
    pub port: u16,
}

impl Room {
    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }
}

/// True for a well-formed join code: exactly six uppercase letters or digits.
pub fn valid_code(code: &str) -> bool {
    code.len() == CODE_LEN
        && code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
}

/// Canonical form of user-supplied code input: trimmed and uppercased.
/// Anything that still fails the shape check is rejected.
pub fn normalize_code(raw: &str) -> CoreResult<String> {
    let code = raw.trim().to_ascii_uppercase();
    if valid_code(&code) {
        Ok(code)
    } else {
        Err(CoreError::InvalidRoomCode(raw.to_string()))
    }
}

/// Owns the table of active rooms.
///
/// The table sits behind a std::sync::RwLock held only for brief lookups and
/// mutations, never across await points. Every mutation emits a full Room
/// snapshot on the broadcast channel.
pub struct RoomRegistry {
    rooms: StdRwLock<HashMap<String, Room>>,
    events: broadcast::Sender<Room>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            events,
        }
    }

    /// Room snapshots, one per mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<Room> {
        self.events.subscribe()
    }

    /// Creates a room under a freshly generated collision-free code.
    pub fn create_room(
        &self,
        host_id: &str,
        profile: QualityProfile,
        host_address: IpAddr,
        port: u16,
    ) -> CoreResult<Room> {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());

        let mut code = None;
        for _ in 0..MAX_CODE_ATTEMPTS {
            let candidate = random_code();
            if !rooms.contains_key(&candidate) {
                code = Some(candidate);
                break;
            }
        }
        let code = code.ok_or(CoreError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))?;

        let room = Room {
            id: Uuid::new_v4().to_string(),
            code: code.clone(),
            host_id: host_id.to_string(),
            created_at: SystemTime::now(),
            viewers: HashSet::new(),
            quality_profile: profile,
            is_active: true,
            host_address,
            port,
        };
        rooms.insert(code.clone(), room.clone());
        drop(rooms);

        info!("Created room {} ({})", room.code, profile.label());
        self.emit(&room);
        Ok(room)
    }

    /// O(1) lookup. `None` for absent or inactive codes.
    pub fn lookup(&self, code: &str) -> Option<Room> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(code).filter(|r| r.is_active).cloned()
    }

    /// Atomically replaces the viewer set.
    pub fn update_membership(
        &self,
        code: &str,
        viewers: HashSet<String>,
    ) -> CoreResult<Room> {
        let snapshot = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let room = rooms
                .get_mut(code)
                .ok_or_else(|| CoreError::RoomNotFound(code.to_string()))?;
            room.viewers = viewers;
            room.clone()
        };
        debug!(
            "Room {} membership now {} viewer(s)",
            code,
            snapshot.viewer_count()
        );
        self.emit(&snapshot);
        Ok(snapshot)
    }

    /// Atomically replaces the quality profile.
    pub fn update_profile(&self, code: &str, profile: QualityProfile) -> CoreResult<Room> {
        let snapshot = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            let room = rooms
                .get_mut(code)
                .ok_or_else(|| CoreError::RoomNotFound(code.to_string()))?;
            room.quality_profile = profile;
            room.clone()
        };
        info!("Room {} quality set to {}", code, profile.label());
        self.emit(&snapshot);
        Ok(snapshot)
    }

    /// Marks the room inactive, clears its viewers, emits the final snapshot,
    /// and evicts the entry.
    pub fn close(&self, code: &str) -> CoreResult<()> {
        let mut room = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms
                .remove(code)
                .ok_or_else(|| CoreError::RoomNotFound(code.to_string()))?
        };
        room.is_active = false;
        room.viewers.clear();
        info!("Closed room {}", code);
        self.emit(&room);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Viewer memberships summed across all active rooms.
    pub fn total_viewers(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().map(|r| r.viewers.len()).sum()
    }

    fn emit(&self, room: &Room) {
        // Err just means nobody is subscribed right now
        let _ = self.events.send(room.clone());
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}
