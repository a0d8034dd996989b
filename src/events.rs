//! Realtime message contract.
//!
//! Messages are flat JSON records tagged by an `event` field. Outbound payloads
//! use camelCase keys, inbound ones snake_case. Row numbers on the wire are
//! 1-based, as in cell references.
//!
//! Numeric identifiers from the server may arrive as integers, floats or
//! numeric strings; they are all coerced before use.

use crate::error::Result;
use crate::presence::PresenceRecord;
use crate::spreadsheet::SheetId;
use crate::user::{Role, UserId};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    JoinSheet { sheet_id: SheetId },

    #[serde(rename_all = "camelCase")]
    LeaveSheet { sheet_id: SheetId },

    #[serde(rename_all = "camelCase")]
    GetPresence { sheet_id: SheetId },

    #[serde(rename_all = "camelCase")]
    CellFocus { sheet_id: SheetId, cell_ref: String },

    #[serde(rename_all = "camelCase")]
    CellBlur { sheet_id: SheetId, cell_ref: String },

    #[serde(rename_all = "camelCase")]
    CellUpdate {
        sheet_id: SheetId,
        /// 1-based
        row_index: usize,
        column_name: String,
        value: String,
    },

    #[serde(rename_all = "camelCase")]
    RequestEdit {
        sheet_id: SheetId,
        /// 1-based
        row_number: usize,
        column_name: String,
        cell_ref: String,
        current_value: String,
        proposed_value: String,
    },

    #[serde(rename_all = "camelCase")]
    ResolveEditRequest {
        request_id: i64,
        approved: bool,
        reject_reason: Option<String>,
    },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinSheet { .. } => "join_sheet",
            OutboundEvent::LeaveSheet { .. } => "leave_sheet",
            OutboundEvent::GetPresence { .. } => "get_presence",
            OutboundEvent::CellFocus { .. } => "cell_focus",
            OutboundEvent::CellBlur { .. } => "cell_blur",
            OutboundEvent::CellUpdate { .. } => "cell_update",
            OutboundEvent::RequestEdit { .. } => "request_edit",
            OutboundEvent::ResolveEditRequest { .. } => "resolve_edit_request",
        }
    }

    pub fn sheet_id(&self) -> Option<SheetId> {
        match self {
            OutboundEvent::JoinSheet { sheet_id }
            | OutboundEvent::LeaveSheet { sheet_id }
            | OutboundEvent::GetPresence { sheet_id }
            | OutboundEvent::CellFocus { sheet_id, .. }
            | OutboundEvent::CellBlur { sheet_id, .. }
            | OutboundEvent::CellUpdate { sheet_id, .. }
            | OutboundEvent::RequestEdit { sheet_id, .. } => Some(*sheet_id),
            OutboundEvent::ResolveEditRequest { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Full presence set of a sheet. Entries are kept raw so one malformed
    /// entry cannot fail the whole message; see [`parse_presence_users`].
    PresenceUpdate {
        #[serde(deserialize_with = "lenient_id")]
        sheet_id: SheetId,
        #[serde(default)]
        users: Vec<serde_json::Value>,
    },

    CellFocused(CellPresence),

    CellBlurred(CellPresence),

    CellUpdated {
        #[serde(deserialize_with = "lenient_id")]
        sheet_id: SheetId,
        /// 1-based
        #[serde(deserialize_with = "lenient_index")]
        row_index: usize,
        column_name: String,
        #[serde(default)]
        value: String,
    },

    SheetSaved {
        #[serde(deserialize_with = "lenient_id")]
        sheet_id: SheetId,
        #[serde(default, deserialize_with = "lenient_opt_id")]
        saved_by_id: Option<UserId>,
    },

    /// Elevated users: a new request is pending.
    EditRequestNotification {
        #[serde(default, deserialize_with = "lenient_opt_id")]
        sheet_id: Option<SheetId>,
        #[serde(default, deserialize_with = "lenient_opt_index")]
        pending_count: Option<usize>,
    },

    /// Requester: the request was stored.
    EditRequestSubmitted {
        #[serde(default, deserialize_with = "lenient_opt_id")]
        request_id: Option<i64>,
        #[serde(default)]
        cell_ref: Option<String>,
    },

    EditRequestResolved {
        #[serde(default, deserialize_with = "lenient_opt_id")]
        sheet_id: Option<SheetId>,
        #[serde(default, deserialize_with = "lenient_opt_id")]
        request_id: Option<i64>,
        #[serde(default)]
        approved: Option<bool>,
        #[serde(default, deserialize_with = "lenient_opt_index")]
        pending_count: Option<usize>,
    },

    /// Requester: an approved value was written for this cell.
    GrantTempAccess {
        #[serde(default, deserialize_with = "lenient_opt_id")]
        sheet_id: Option<SheetId>,
        cell_ref: String,
    },

    SheetLockChanged {
        #[serde(deserialize_with = "lenient_id")]
        sheet_id: SheetId,
        #[serde(default, deserialize_with = "lenient_opt_id")]
        locked_by_id: Option<UserId>,
        #[serde(default)]
        locked_by_name: Option<String>,
        #[serde(default, deserialize_with = "lenient_opt_id")]
        editing_user_id: Option<UserId>,
        #[serde(default)]
        editing_user_name: Option<String>,
    },

    /// The transport (re)connected.
    Connect,
}

/// Payload of `cell_focused` and `cell_blurred`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellPresence {
    #[serde(default, deserialize_with = "lenient_opt_id")]
    pub sheet_id: Option<SheetId>,
    #[serde(deserialize_with = "lenient_id")]
    pub user_id: UserId,
    pub cell_ref: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub department_name: Option<String>,
}

impl CellPresence {
    /// Presence record for this focus change, `None` for unsupported roles.
    pub fn to_record(&self) -> Option<PresenceRecord> {
        Some(PresenceRecord {
            user_id: self.user_id,
            username: self.username.clone(),
            display_name: None,
            role: Role::from_name(&self.role)?,
            department: self.department_name.clone(),
            current_cell: Some(self.cell_ref.to_uppercase()),
        })
    }
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::PresenceUpdate { .. } => "presence_update",
            InboundEvent::CellFocused(_) => "cell_focused",
            InboundEvent::CellBlurred(_) => "cell_blurred",
            InboundEvent::CellUpdated { .. } => "cell_updated",
            InboundEvent::SheetSaved { .. } => "sheet_saved",
            InboundEvent::EditRequestNotification { .. } => "edit_request_notification",
            InboundEvent::EditRequestSubmitted { .. } => "edit_request_submitted",
            InboundEvent::EditRequestResolved { .. } => "edit_request_resolved",
            InboundEvent::GrantTempAccess { .. } => "grant_temp_access",
            InboundEvent::SheetLockChanged { .. } => "sheet_lock_changed",
            InboundEvent::Connect => "connect",
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One entry of a `presence_update` user list as sent by the server.
#[derive(Deserialize)]
struct WirePresenceUser {
    #[serde(deserialize_with = "lenient_id")]
    user_id: UserId,
    #[serde(default)]
    username: String,
    #[serde(default)]
    display_name: Option<String>,
    role: String,
    #[serde(default)]
    department_name: Option<String>,
    #[serde(default)]
    current_cell: Option<String>,
}

/// Parse the raw entries of a presence update.
///
/// Malformed entries and entries with unsupported roles are skipped with a
/// warning; the rest of the batch is kept.
pub fn parse_presence_users(users: &[serde_json::Value]) -> Vec<PresenceRecord> {
    users
        .iter()
        .filter_map(|raw| {
            let user: WirePresenceUser = match serde_json::from_value(raw.clone()) {
                Ok(user) => user,
                Err(e) => {
                    log::warn!("skipping malformed presence entry {}: {}", raw, e);
                    return None;
                }
            };
            let Some(role) = Role::from_name(&user.role) else {
                log::debug!("skipping presence entry with role '{}'", user.role);
                return None;
            };
            Some(PresenceRecord {
                user_id: user.user_id,
                username: user.username,
                display_name: user.display_name,
                role,
                department: user.department_name,
                current_cell: user
                    .current_cell
                    .filter(|c| !c.trim().is_empty())
                    .map(|c| c.to_uppercase()),
            })
        })
        .collect()
}

/// Wire form of a presence record, the inverse of [`parse_presence_users`].
pub fn presence_to_wire(record: &PresenceRecord) -> serde_json::Value {
    serde_json::json!({
        "user_id": record.user_id,
        "username": record.username,
        "display_name": record.display_name,
        "role": record.role.as_str(),
        "department_name": record.department,
        "current_cell": record.current_cell,
    })
}

struct LenientIdVisitor;

impl Visitor<'_> for LenientIdVisitor {
    type Value = i64;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an integer id, possibly as a float or string")
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<i64, E> {
        Ok(v)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<i64, E> {
        i64::try_from(v).map_err(|_| E::custom(format!("id {} out of range", v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<i64, E> {
        if v.is_finite() && v.fract() == 0.0 && v.abs() < i64::MAX as f64 {
            Ok(v as i64)
        } else {
            Err(E::custom(format!("{} is not an integral id", v)))
        }
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<i64, E> {
        let v = v.trim();
        if let Ok(n) = v.parse::<i64>() {
            return Ok(n);
        }
        match v.parse::<f64>() {
            Ok(n) => self.visit_f64(n),
            Err(_) => Err(E::custom(format!("'{}' is not an id", v))),
        }
    }
}

/// Coerce an id sent as `7`, `7.0` or `"7"`.
pub fn lenient_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    deserializer.deserialize_any(LenientIdVisitor)
}

pub fn lenient_index<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<usize, D::Error> {
    let n = lenient_id(deserializer)?;
    usize::try_from(n).map_err(|_| de::Error::custom(format!("negative index {}", n)))
}

struct LenientI64(i64);

impl<'de> Deserialize<'de> for LenientI64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        lenient_id(deserializer).map(LenientI64)
    }
}

pub fn lenient_opt_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<i64>, D::Error> {
    Ok(Option::<LenientI64>::deserialize(deserializer)?.map(|v| v.0))
}

pub fn lenient_opt_index<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<usize>, D::Error> {
    match lenient_opt_id(deserializer)? {
        Some(n) => usize::try_from(n)
            .map(Some)
            .map_err(|_| de::Error::custom(format!("negative index {}", n))),
        None => Ok(None),
    }
}

/// Coerce a JSON value to an id the same way inbound fields are.
pub fn coerce_id(value: &serde_json::Value) -> Option<i64> {
    lenient_id(value).ok()
}
