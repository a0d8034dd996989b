/*!
# cosheet

Core of a collaborative, multi-user spreadsheet: the grid, its formula engine,
and the coordination that keeps several users on one sheet consistent.

## Overview

A sheet is a named grid with ordered, uniquely named columns and rows of text
cells. Cells holding `=SUM(A1:A5)` style formulas are evaluated for display;
whole-column formulas (`C = A * B`) write computed values into a column. Sheets
with a baseline and a total column behave as inventory ledgers whose totals are
derived from dated IN/OUT columns.

Several users can have the same sheet open. Each open sheet is a
[`SheetSession`], which combines:

- **Persistence** through a [`PersistenceGateway`] (load, save, lock, edit
  requests). [`MemoryServer`] is an in-process implementation.
- **Realtime events** through a [`RealtimeTransport`]. [`LocalHub`] relays events
  between sessions in one process.
- **Coordination** in a [`Coordinator`]: sheet locks, role checks, protected
  historical cells, temporary grants, cell presence.

Local edits apply immediately, are broadcast as `cell_update` events, and are
saved after a short debounce. Remote events are merged by the [`Reconciler`]
without being echoed back.

## Modules

- **cell**: cell positions and `A1` style references
- **spreadsheet**: the grid, columns, rows, labels, geometry
- **format**: per-cell formatting and merged ranges
- **formula**: display-time evaluation of cell formulas
- **column_formula**: whole-column arithmetic
- **inventory**: IN/OUT ledger columns and derived totals
- **user**, **presence**, **edit_request**, **coordinator**: who may do what
- **events**, **transport**, **hub**: the realtime wire
- **gateway**, **memory**, **saving**: persistence
- **reconciler**, **session**: putting it together
- **config**, **error**: settings and the crate error type
*/

pub mod cell;
pub mod column_formula;
pub mod config;
pub mod coordinator;
pub mod edit_request;
pub mod error;
pub mod events;
pub mod format;
pub mod formula;
pub mod gateway;
pub mod hub;
pub mod inventory;
pub mod memory;
pub mod presence;
pub mod reconciler;
pub mod saving;
pub mod session;
pub mod spreadsheet;
pub mod transport;
pub mod user;

pub use cell::CellPos;
pub use column_formula::{ColumnFormula, ColumnOperator};
pub use config::CollabConfig;
pub use coordinator::{CellPolicy, Coordinator, LockOutcome};
pub use edit_request::{EditRequest, EditRequestStatus};
pub use error::{Result, SheetError};
pub use events::{InboundEvent, OutboundEvent};
pub use gateway::{PersistenceGateway, SheetSnapshot};
pub use hub::{HubTransport, LocalHub};
pub use memory::{MemoryGateway, MemoryServer};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use session::{CommitOutcome, SheetSession};
pub use spreadsheet::{Sheet, SheetId, SheetTemplate};
pub use transport::{CapturingTransport, RealtimeTransport};
pub use user::{Role, User, UserId};
