//! In-process realtime server.
//!
//! [`LocalHub`] keeps rooms (one per sheet), each connection's focused cell and
//! the presence derived from them, and routes events the way the realtime
//! server does: presence to the whole room, focus and cell updates to everybody
//! but the sender, edit-request traffic to elevated members and requesters.
//! When attached to a [`MemoryServer`] it also broadcasts that server's save and
//! lock notices.

use crate::error::{Result, SheetError};
use crate::events::{CellPresence, InboundEvent, OutboundEvent, presence_to_wire};
use crate::memory::{MemoryServer, ServerNotice};
use crate::presence::PresenceRecord;
use crate::spreadsheet::SheetId;
use crate::transport::RealtimeTransport;
use crate::user::{User, UserId};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

struct Connection {
    user: User,
    sender: Option<UnboundedSender<InboundEvent>>,
    online: bool,
    rooms: BTreeSet<SheetId>,
    focus: Option<(SheetId, String)>,
}

impl Connection {
    fn presence(&self, sheet_id: SheetId) -> PresenceRecord {
        let cell = self
            .focus
            .as_ref()
            .filter(|(id, _)| *id == sheet_id)
            .map(|(_, cell)| cell.as_str());
        PresenceRecord::from_user(&self.user, cell)
    }

    fn cell_presence(&self, sheet_id: SheetId, cell_ref: &str) -> CellPresence {
        CellPresence {
            sheet_id: Some(sheet_id),
            user_id: self.user.id,
            cell_ref: cell_ref.to_string(),
            username: self.user.username.clone(),
            role: self.user.role.as_str().to_string(),
            department_name: self.user.department.clone(),
        }
    }

    fn send(&self, event: InboundEvent) {
        if !self.online {
            return;
        }
        if let Some(sender) = &self.sender {
            // A closed receiver just means the client went away
            let _ = sender.send(event);
        }
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<Uuid, Connection>,
    rooms: HashMap<SheetId, BTreeSet<Uuid>>,
}

impl HubState {
    fn members(&self, sheet_id: SheetId) -> impl Iterator<Item = (&Uuid, &Connection)> {
        self.rooms
            .get(&sheet_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id).map(|c| (id, c)))
    }

    fn broadcast(&self, sheet_id: SheetId, except: Option<Uuid>, event: &InboundEvent) {
        for (id, conn) in self.members(sheet_id) {
            if Some(*id) != except {
                conn.send(event.clone());
            }
        }
    }

    fn presence_update(&self, sheet_id: SheetId) -> InboundEvent {
        InboundEvent::PresenceUpdate {
            sheet_id,
            users: self
                .members(sheet_id)
                .filter(|(_, c)| c.online)
                .map(|(_, c)| presence_to_wire(&c.presence(sheet_id)))
                .collect(),
        }
    }

    fn broadcast_presence(&self, sheet_id: SheetId) {
        let event = self.presence_update(sheet_id);
        self.broadcast(sheet_id, None, &event);
    }

    fn send_to_user(&self, user_id: UserId, event: &InboundEvent) {
        for conn in self.connections.values().filter(|c| c.user.id == user_id) {
            conn.send(event.clone());
        }
    }

    fn send_to_elevated(&self, sheet_id: SheetId, event: &InboundEvent) {
        for (_, conn) in self.members(sheet_id).filter(|(_, c)| c.user.is_elevated()) {
            conn.send(event.clone());
        }
    }

    fn join(&mut self, conn_id: Uuid, sheet_id: SheetId) {
        self.rooms.entry(sheet_id).or_default().insert(conn_id);
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.rooms.insert(sheet_id);
        }
    }

    fn leave(&mut self, conn_id: Uuid, sheet_id: SheetId) {
        if let Some(members) = self.rooms.get_mut(&sheet_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(&sheet_id);
            }
        }
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.rooms.remove(&sheet_id);
            if conn.focus.as_ref().is_some_and(|(id, _)| *id == sheet_id) {
                conn.focus = None;
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
    server: Option<MemoryServer>,
}

impl LocalHub {
    /// A hub with no storage behind it: edit-request notifications carry no
    /// pending counts and approvals are not echoed as cell updates.
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub that relays `server`'s notices and consults it for edit requests.
    pub fn with_server(server: &MemoryServer) -> Self {
        let hub = LocalHub {
            state: Arc::new(Mutex::new(HubState::default())),
            server: Some(server.clone()),
        };
        let weak: Weak<Mutex<HubState>> = Arc::downgrade(&hub.state);
        server.add_listener(move |notice| {
            if let Some(state) = weak.upgrade() {
                if let Ok(state) = state.lock() {
                    relay_notice(&state, notice);
                }
            }
        });
        hub
    }

    fn state(&self) -> Result<MutexGuard<'_, HubState>> {
        self.state
            .lock()
            .map_err(|_| SheetError::Transport("hub state poisoned".to_string()))
    }

    /// Open a connection for `user`.
    pub fn connect(&self, user: User) -> HubTransport {
        let id = Uuid::new_v4();
        if let Ok(mut state) = self.state() {
            state.connections.insert(
                id,
                Connection {
                    user,
                    sender: None,
                    online: true,
                    rooms: BTreeSet::new(),
                    focus: None,
                },
            );
        }
        HubTransport {
            hub: self.clone(),
            id,
        }
    }

    /// Users currently in the room of `sheet_id`, without duplicates.
    pub fn room_members(&self, sheet_id: SheetId) -> Vec<UserId> {
        let Ok(state) = self.state() else {
            return Vec::new();
        };
        let ids: BTreeSet<UserId> = state.members(sheet_id).map(|(_, c)| c.user.id).collect();
        ids.into_iter().collect()
    }

    fn dispatch(&self, conn_id: Uuid, event: OutboundEvent) -> Result<()> {
        let mut state = self.state()?;
        let conn = state
            .connections
            .get(&conn_id)
            .ok_or_else(|| SheetError::Transport("unknown connection".to_string()))?;
        if !conn.online {
            return Err(SheetError::Transport("not connected".to_string()));
        }
        let sender = conn.user.clone();

        match event {
            OutboundEvent::JoinSheet { sheet_id } => {
                state.join(conn_id, sheet_id);
                state.broadcast_presence(sheet_id);
            }
            OutboundEvent::LeaveSheet { sheet_id } => {
                state.leave(conn_id, sheet_id);
                state.broadcast_presence(sheet_id);
            }
            OutboundEvent::GetPresence { sheet_id } => {
                let update = state.presence_update(sheet_id);
                if let Some(conn) = state.connections.get(&conn_id) {
                    conn.send(update);
                }
            }
            OutboundEvent::CellFocus { sheet_id, cell_ref } => {
                let cell_ref = cell_ref.to_uppercase();
                let Some(conn) = state.connections.get_mut(&conn_id) else {
                    return Ok(());
                };
                conn.focus = Some((sheet_id, cell_ref.clone()));
                let event = InboundEvent::CellFocused(conn.cell_presence(sheet_id, &cell_ref));
                state.broadcast(sheet_id, Some(conn_id), &event);
            }
            OutboundEvent::CellBlur { sheet_id, cell_ref } => {
                let cell_ref = cell_ref.to_uppercase();
                let Some(conn) = state.connections.get_mut(&conn_id) else {
                    return Ok(());
                };
                if conn.focus.as_ref() == Some(&(sheet_id, cell_ref.clone())) {
                    conn.focus = None;
                }
                let event = InboundEvent::CellBlurred(conn.cell_presence(sheet_id, &cell_ref));
                state.broadcast(sheet_id, Some(conn_id), &event);
            }
            OutboundEvent::CellUpdate {
                sheet_id,
                row_index,
                column_name,
                value,
            } => {
                let event = InboundEvent::CellUpdated {
                    sheet_id,
                    row_index,
                    column_name,
                    value,
                };
                state.broadcast(sheet_id, Some(conn_id), &event);
            }
            OutboundEvent::RequestEdit { sheet_id, cell_ref, .. } => {
                let pending = self.server.as_ref().map(|s| s.pending_count(sheet_id));
                state.send_to_elevated(
                    sheet_id,
                    &InboundEvent::EditRequestNotification {
                        sheet_id: Some(sheet_id),
                        pending_count: pending,
                    },
                );
                if let Some(conn) = state.connections.get(&conn_id) {
                    conn.send(InboundEvent::EditRequestSubmitted {
                        request_id: None,
                        cell_ref: Some(cell_ref),
                    });
                }
            }
            OutboundEvent::ResolveEditRequest {
                request_id,
                approved,
                ..
            } => {
                if !sender.is_elevated() {
                    return Err(SheetError::NotElevated);
                }
                let Some(server) = &self.server else {
                    log::debug!("resolve_edit_request {} with no server attached", request_id);
                    return Ok(());
                };
                let request = server.request(request_id)?;
                let sheet_id = request.sheet_id;
                let resolved = InboundEvent::EditRequestResolved {
                    sheet_id: Some(sheet_id),
                    request_id: Some(request_id),
                    approved: Some(approved),
                    pending_count: Some(server.pending_count(sheet_id)),
                };
                state.send_to_elevated(sheet_id, &resolved);
                state.send_to_user(request.requested_by, &resolved);
                if approved {
                    state.broadcast(
                        sheet_id,
                        None,
                        &InboundEvent::CellUpdated {
                            sheet_id,
                            row_index: request.row + 1,
                            column_name: request.column.clone(),
                            value: request.proposed_value.clone(),
                        },
                    );
                    state.send_to_user(
                        request.requested_by,
                        &InboundEvent::GrantTempAccess {
                            sheet_id: Some(sheet_id),
                            cell_ref: request.cell_ref.clone(),
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

fn relay_notice(state: &HubState, notice: &ServerNotice) {
    match notice {
        ServerNotice::SheetSaved { sheet_id, saved_by } => state.broadcast(
            *sheet_id,
            None,
            &InboundEvent::SheetSaved {
                sheet_id: *sheet_id,
                saved_by_id: Some(*saved_by),
            },
        ),
        ServerNotice::LockChanged {
            sheet_id,
            locked_by,
            editing,
        } => state.broadcast(
            *sheet_id,
            None,
            &InboundEvent::SheetLockChanged {
                sheet_id: *sheet_id,
                locked_by_id: locked_by.as_ref().map(|h| h.user_id),
                locked_by_name: locked_by.as_ref().map(|h| h.name.clone()),
                editing_user_id: editing.as_ref().map(|e| e.user_id),
                editing_user_name: editing.as_ref().map(|e| e.name.clone()),
            },
        ),
        ServerNotice::SheetDeleted { sheet_id } => {
            log::debug!("sheet {} deleted, room left as is", sheet_id);
        }
    }
}

/// One client's connection to a [`LocalHub`].
#[derive(Clone)]
pub struct HubTransport {
    hub: LocalHub,
    id: Uuid,
}

impl HubTransport {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_online(&self) -> bool {
        self.hub
            .state()
            .ok()
            .and_then(|s| s.connections.get(&self.id).map(|c| c.online))
            .unwrap_or(false)
    }

    /// Drop the connection as a network failure would: the server removes it
    /// from its rooms and tells the remaining members.
    pub fn disconnect(&self) {
        let Ok(mut state) = self.hub.state() else {
            return;
        };
        let rooms: Vec<SheetId> = match state.connections.get_mut(&self.id) {
            Some(conn) => {
                conn.online = false;
                conn.focus = None;
                conn.rooms.iter().copied().collect()
            }
            None => return,
        };
        for sheet_id in rooms {
            state.leave(self.id, sheet_id);
            state.broadcast_presence(sheet_id);
        }
    }

    /// Come back online. The subscriber receives [`InboundEvent::Connect`] and
    /// is expected to re-join its room.
    pub fn reconnect(&self) {
        let Ok(mut state) = self.hub.state() else {
            return;
        };
        if let Some(conn) = state.connections.get_mut(&self.id) {
            conn.online = true;
            conn.send(InboundEvent::Connect);
        }
    }
}

impl RealtimeTransport for HubTransport {
    async fn emit(&self, event: OutboundEvent) -> Result<()> {
        log::debug!("hub <- {} from {}", event.name(), self.id);
        self.hub.dispatch(self.id, event)
    }

    fn subscribe(&self) -> UnboundedReceiver<InboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.hub.state() {
            if let Some(conn) = state.connections.get_mut(&self.id) {
                conn.sender = Some(tx);
            }
        }
        rx
    }

    fn detach(&self) {
        if let Ok(mut state) = self.hub.state() {
            if let Some(conn) = state.connections.get_mut(&self.id) {
                conn.sender = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_presence_users;
    use crate::user::Role;

    fn drain(rx: &mut UnboundedReceiver<InboundEvent>) -> Vec<InboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_join_broadcasts_presence_to_room() {
        let hub = LocalHub::new();
        let a = hub.connect(User::new(1, "ana", Role::Editor));
        let b = hub.connect(User::new(2, "bo", Role::Viewer));
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        a.emit(OutboundEvent::JoinSheet { sheet_id: 7 }).await.unwrap();
        b.emit(OutboundEvent::JoinSheet { sheet_id: 7 }).await.unwrap();

        let last = drain(&mut rx_a).pop().unwrap();
        let InboundEvent::PresenceUpdate { users, .. } = last else {
            panic!("expected presence update");
        };
        assert_eq!(parse_presence_users(&users).len(), 2);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(hub.room_members(7), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_focus_and_updates_skip_sender() {
        let hub = LocalHub::new();
        let a = hub.connect(User::new(1, "ana", Role::Editor));
        let b = hub.connect(User::new(2, "bo", Role::Editor));
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        a.emit(OutboundEvent::JoinSheet { sheet_id: 1 }).await.unwrap();
        b.emit(OutboundEvent::JoinSheet { sheet_id: 1 }).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        a.emit(OutboundEvent::CellFocus {
            sheet_id: 1,
            cell_ref: "c3".to_string(),
        })
        .await
        .unwrap();
        a.emit(OutboundEvent::CellUpdate {
            sheet_id: 1,
            row_index: 3,
            column_name: "C".to_string(),
            value: "5".to_string(),
        })
        .await
        .unwrap();

        assert!(drain(&mut rx_a).is_empty());
        let got = drain(&mut rx_b);
        assert_eq!(got.len(), 2);
        assert!(matches!(&got[0], InboundEvent::CellFocused(p) if p.cell_ref == "C3"));
        assert!(matches!(&got[1], InboundEvent::CellUpdated { row_index: 3, .. }));
    }

    #[tokio::test]
    async fn test_disconnect_updates_presence_and_reconnect_signals() {
        let hub = LocalHub::new();
        let a = hub.connect(User::new(1, "ana", Role::Editor));
        let b = hub.connect(User::new(2, "bo", Role::Editor));
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();
        a.emit(OutboundEvent::JoinSheet { sheet_id: 1 }).await.unwrap();
        b.emit(OutboundEvent::JoinSheet { sheet_id: 1 }).await.unwrap();
        drain(&mut rx_b);

        a.disconnect();
        assert!(!a.is_online());
        assert!(a.emit(OutboundEvent::GetPresence { sheet_id: 1 }).await.is_err());
        let Some(InboundEvent::PresenceUpdate { users, .. }) = drain(&mut rx_b).pop() else {
            panic!("expected presence update");
        };
        assert_eq!(users.len(), 1);

        drain(&mut rx_a);
        a.reconnect();
        assert_eq!(drain(&mut rx_a), vec![InboundEvent::Connect]);
    }
}
