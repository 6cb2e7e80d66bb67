//! Raum-Mitgliedschaften für Gruppenanrufe

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

/// Welche Benutzer sich in welchem Raum befinden
#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gibt `true` zurück, wenn der Benutzer neu im Raum ist
    pub fn join(&self, room_id: &str, user_id: &str) -> bool {
        self.rooms
            .lock()
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string())
    }

    pub fn leave(&self, room_id: &str, user_id: &str) -> bool {
        let mut rooms = self.rooms.lock();
        let Some(members) = rooms.get_mut(room_id) else {
            return false;
        };
        let removed = members.remove(user_id);
        if members.is_empty() {
            rooms.remove(room_id);
        }
        removed
    }

    /// Entfernt den Benutzer aus allen Räumen
    pub fn leave_all(&self, user_id: &str) {
        self.rooms.lock().retain(|_, members| {
            members.remove(user_id);
            !members.is_empty()
        });
    }

    /// Alle Mitglieder außer `except`, sortiert
    pub fn members_except(&self, room_id: &str, except: &str) -> Vec<String> {
        self.rooms
            .lock()
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.as_str() != except)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }
}
