//! Call rooms: ephemeral multi-party signaling sessions

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use super::ConnId;
use crate::protocol::RoomRole;

/// `call-ended` reason when the initiator sends `leave`
pub const REASON_INITIATOR_LEFT: &str = "initiator-left";
/// `call-ended` reason when the initiator's socket closes
pub const REASON_INITIATOR_DISCONNECTED: &str = "initiator-disconnected";

#[derive(Debug, Clone)]
pub struct CallRoom {
    pub call_id: String,
    pub initiator: ConnId,
    pub participants: BTreeSet<ConnId>,
}

impl CallRoom {
    fn new(call_id: String, initiator: ConnId) -> Self {
        Self {
            call_id,
            initiator,
            participants: BTreeSet::new(),
        }
    }

    pub fn role_of(&self, conn: ConnId) -> Option<RoomRole> {
        if conn == self.initiator {
            Some(RoomRole::Initiator)
        } else if self.participants.contains(&conn) {
            Some(RoomRole::Participant)
        } else {
            None
        }
    }

    /// Every member, initiator first
    pub fn members(&self) -> impl Iterator<Item = ConnId> + '_ {
        std::iter::once(self.initiator).chain(self.participants.iter().copied())
    }

    pub fn member_count(&self) -> usize {
        self.participants.len() + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Room did not exist; the joiner is its initiator
    Created,
    /// Joined an existing room as participant
    Joined { initiator: ConnId },
    /// Already a member of this room
    AlreadyMember(RoomRole),
}

impl JoinOutcome {
    pub fn role(&self) -> RoomRole {
        match self {
            JoinOutcome::Created => RoomRole::Initiator,
            JoinOutcome::Joined { .. } => RoomRole::Participant,
            JoinOutcome::AlreadyMember(role) => *role,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Initiator left; the room is gone
    Closed { participants: Vec<ConnId> },
    ParticipantLeft { remaining: Vec<ConnId> },
    NotMember,
}

/// Room listing served on the calls endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSummary {
    pub call_id: String,
    pub participants: usize,
}

/// All rooms plus the connection → room index. A connection is in at most
/// one room at a time.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: HashMap<String, CallRoom>,
    membership: HashMap<ConnId, String>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, call_id: &str) -> Option<&CallRoom> {
        self.rooms.get(call_id)
    }

    pub fn room_of(&self, conn: ConnId) -> Option<&str> {
        self.membership.get(&conn).map(String::as_str)
    }

    /// Add `conn` to `call_id`, creating the room if needed.
    ///
    /// The caller leaves any previous room first.
    pub fn join(&mut self, call_id: &str, conn: ConnId) -> JoinOutcome {
        if let Some(room) = self.rooms.get_mut(call_id) {
            if let Some(role) = room.role_of(conn) {
                return JoinOutcome::AlreadyMember(role);
            }
            room.participants.insert(conn);
            self.membership.insert(conn, call_id.to_string());
            debug!("{} joined call {} as participant", conn, call_id);
            return JoinOutcome::Joined {
                initiator: room.initiator,
            };
        }

        self.rooms
            .insert(call_id.to_string(), CallRoom::new(call_id.to_string(), conn));
        self.membership.insert(conn, call_id.to_string());
        info!("Call {} created by {}", call_id, conn);
        JoinOutcome::Created
    }

    pub fn leave(&mut self, call_id: &str, conn: ConnId) -> LeaveOutcome {
        let Some(room) = self.rooms.get_mut(call_id) else {
            return LeaveOutcome::NotMember;
        };

        if room.initiator == conn {
            let participants: Vec<ConnId> = room.participants.iter().copied().collect();
            self.rooms.remove(call_id);
            self.membership.remove(&conn);
            for p in &participants {
                self.membership.remove(p);
            }
            info!("Call {} ended by initiator {}", call_id, conn);
            return LeaveOutcome::Closed { participants };
        }

        if !room.participants.remove(&conn) {
            return LeaveOutcome::NotMember;
        }
        self.membership.remove(&conn);
        let remaining: Vec<ConnId> = room.members().collect();
        debug!("{} left call {}", conn, call_id);
        LeaveOutcome::ParticipantLeft { remaining }
    }

    /// Leave whatever room `conn` is in
    pub fn leave_all(&mut self, conn: ConnId) -> Option<(String, LeaveOutcome)> {
        let call_id = self.membership.get(&conn)?.clone();
        let outcome = self.leave(&call_id, conn);
        Some((call_id, outcome))
    }

    /// Room members other than `sender`
    pub fn members_except(&self, call_id: &str, sender: ConnId) -> Option<Vec<ConnId>> {
        self.rooms
            .get(call_id)
            .map(|room| room.members().filter(|c| *c != sender).collect())
    }

    pub fn calls(&self) -> Vec<CallSummary> {
        let mut calls: Vec<CallSummary> = self
            .rooms
            .values()
            .map(|room| CallSummary {
                call_id: room.call_id.clone(),
                participants: room.member_count(),
            })
            .collect();
        calls.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        calls
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_join_creates_room() {
        let mut rooms = RoomTable::new();
        assert_eq!(rooms.join("c1", ConnId(1)), JoinOutcome::Created);
        assert_eq!(
            rooms.join("c1", ConnId(2)),
            JoinOutcome::Joined {
                initiator: ConnId(1)
            }
        );
        assert_eq!(
            rooms.join("c1", ConnId(2)),
            JoinOutcome::AlreadyMember(RoomRole::Participant)
        );
        assert_eq!(rooms.get("c1").unwrap().member_count(), 2);
        assert_eq!(rooms.room_of(ConnId(2)), Some("c1"));
    }

    #[test]
    fn test_initiator_leave_closes_room() {
        let mut rooms = RoomTable::new();
        rooms.join("c1", ConnId(1));
        rooms.join("c1", ConnId(2));
        rooms.join("c1", ConnId(3));

        assert_eq!(
            rooms.leave("c1", ConnId(1)),
            LeaveOutcome::Closed {
                participants: vec![ConnId(2), ConnId(3)]
            }
        );
        assert!(rooms.is_empty());
        assert_eq!(rooms.room_of(ConnId(2)), None);
        assert_eq!(rooms.leave("c1", ConnId(2)), LeaveOutcome::NotMember);
    }

    #[test]
    fn test_participant_leave_keeps_room() {
        let mut rooms = RoomTable::new();
        rooms.join("c1", ConnId(1));
        rooms.join("c1", ConnId(2));
        rooms.join("c1", ConnId(3));

        assert_eq!(
            rooms.leave("c1", ConnId(3)),
            LeaveOutcome::ParticipantLeft {
                remaining: vec![ConnId(1), ConnId(2)]
            }
        );
        assert_eq!(rooms.leave("c1", ConnId(3)), LeaveOutcome::NotMember);
        assert_eq!(
            rooms.calls(),
            vec![CallSummary {
                call_id: "c1".to_string(),
                participants: 2
            }]
        );
    }

    #[test]
    fn test_members_except_sender() {
        let mut rooms = RoomTable::new();
        rooms.join("c1", ConnId(1));
        rooms.join("c1", ConnId(2));

        assert_eq!(rooms.members_except("c1", ConnId(2)), Some(vec![ConnId(1)]));
        assert_eq!(rooms.members_except("c9", ConnId(2)), None);
    }

    #[test]
    fn test_leave_all() {
        let mut rooms = RoomTable::new();
        rooms.join("c1", ConnId(1));
        assert!(rooms.leave_all(ConnId(7)).is_none());
        let (call_id, outcome) = rooms.leave_all(ConnId(1)).unwrap();
        assert_eq!(call_id, "c1");
        assert_eq!(outcome, LeaveOutcome::Closed { participants: vec![] });
    }
}
