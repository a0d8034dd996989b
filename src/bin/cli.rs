#![cfg(not(tarpaulin_include))]

//! Interactive shell over an in-process server: two users, `alice` (admin) and
//! `bob` (editor), share one sheet. Switch between them with `as <name>`.

use chrono::{Local, NaiveDate};
use cosheet::cell::CellPos;
use cosheet::{
    CollabConfig, ColumnFormula, ColumnOperator, CommitOutcome, EditRequestStatus, HubTransport,
    LocalHub, MemoryGateway, MemoryServer, PersistenceGateway, Role, SheetError, SheetSession,
    SheetTemplate, User,
};
use std::env;
use std::io::{self, Write};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};

type Session = SheetSession<MemoryGateway, HubTransport>;

const VIEW_ROWS: usize = 10;

fn print_help() {
    println!("Commands:");
    println!("  q: Quit");
    println!("  w / s: Scroll up / down");
    println!("  as <alice|bob>: Act as another user");
    println!("  <cell>=<value>: Set a cell, e.g. B3=12 or A1==SUM(B1:B5)");
    println!("  addcol <name> | delcol <name> | rename <old> <new>");
    println!("  addrow | delrow <n>");
    println!("  ledger [YYYY-MM-DD]: Add IN/OUT columns for a day");
    println!("  colformula <C> = <A> <op> <B> ...: Declare and apply a column formula");
    println!("  lock | unlock | session | save | reload");
    println!("  requests | approve <id> | reject <id> [reason]");
    println!("  presence | critical");
    println!("  export <path> | import <path>: Snapshot files of the stored sheet");
}

fn display(session: &Session, view_row: usize) {
    let sheet = session.sheet();
    print!("{:>10}", sheet.row_label_header());
    for column in sheet.columns() {
        print!("{:>14}", column);
    }
    println!();
    let end = (view_row + VIEW_ROWS).min(sheet.row_count());
    for row in view_row..end {
        print!("{:>10}", sheet.row_label(row));
        for column in sheet.columns() {
            let value = session.display_value(row, column).unwrap_or_default();
            print!("{:>14}", value);
        }
        println!();
    }
    let lock = match session.coordinator().lock_holder() {
        Some(holder) => format!("locked by {}", holder.name),
        None => "unlocked".to_string(),
    };
    println!(
        "[{} as {}] {} rows, {}, {} pending request(s)",
        sheet.name,
        session.user().username,
        sheet.row_count(),
        lock,
        session.coordinator().pending_requests()
    );
}

/// Parse `C = A * B` style input.
fn parse_column_formula(input: &str) -> Option<ColumnFormula> {
    let (result, rhs) = input.split_once('=')?;
    let tokens: Vec<&str> = rhs.split_whitespace().collect();
    if tokens.len() == 1 {
        return Some(ColumnFormula::new(result.trim(), ColumnOperator::Assign, &tokens));
    }
    let operator = ColumnOperator::from_symbol(tokens.get(1)?)?;
    let mut operands = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if i % 2 == 0 {
            operands.push(*token);
        } else if ColumnOperator::from_symbol(token) != Some(operator) {
            return None;
        }
    }
    Some(ColumnFormula::new(result.trim(), operator, &operands))
}

async fn set_cell(session: &mut Session, reference: &str, value: &str) -> Result<String, SheetError> {
    let pos = CellPos::parse(reference).ok_or_else(|| SheetError::InvalidReference(reference.to_string()))?;
    let column = session
        .sheet()
        .column_name(pos.col)
        .ok_or_else(|| SheetError::InvalidReference(reference.to_string()))?
        .to_string();
    session.begin_cell_edit(pos.row, &column).await?;
    match session.commit_cell_edit(pos.row, &column, value).await? {
        CommitOutcome::Applied { .. } => Ok("ok".to_string()),
        CommitOutcome::RequestSubmitted(request) => Ok(format!("edit request {} submitted", request.id)),
    }
}

async fn run_command(session: &mut Session, command: &str) -> Result<String, SheetError> {
    let (verb, rest) = command.split_once(' ').unwrap_or((command, ""));
    let rest = rest.trim();
    match verb {
        "addcol" => session.add_column(rest).map(|i| format!("added column {}", i + 1)),
        "delcol" => session.remove_column(rest).map(|_| "ok".to_string()),
        "rename" => {
            let (old, new) = rest.split_once(' ').unwrap_or((rest, ""));
            session.rename_column(old, new.trim()).map(|_| "ok".to_string())
        }
        "addrow" => session.add_row().map(|i| format!("added row {}", i + 1)),
        "delrow" => match rest.parse::<usize>() {
            Ok(n) if n > 0 => session.remove_row(n - 1).map(|_| "ok".to_string()),
            _ => Ok("invalid row".to_string()),
        },
        "ledger" => {
            let date = if rest.is_empty() {
                Local::now().date_naive()
            } else {
                match NaiveDate::parse_from_str(rest, "%Y-%m-%d") {
                    Ok(date) => date,
                    Err(_) => return Ok("invalid date".to_string()),
                }
            };
            session.add_ledger_day(date).map(|_| "ok".to_string())
        }
        "colformula" => match parse_column_formula(rest) {
            Some(formula) => {
                let index = session.declare_column_formula(formula);
                let report = session.apply_column_formula(index);
                session.remove_column_formula(index);
                report.map(|r| format!("{} written, {} skipped", r.written, r.skipped))
            }
            None => Ok("invalid column formula".to_string()),
        },
        "lock" => session.lock().await.map(|outcome| format!("{:?}", outcome)),
        "unlock" => session.unlock().await.map(|_| "ok".to_string()),
        "session" => session.start_edit_session().await.map(|token| format!("edit session {}", token)),
        "save" => session.save_now().await.map(|_| "saved".to_string()),
        "reload" => session.reload().await.map(|_| "reloaded".to_string()),
        "requests" => {
            let requests = session.list_edit_requests(Some(EditRequestStatus::Pending)).await?;
            for request in &requests {
                println!(
                    "  #{} {} by {}: '{}' -> '{}'",
                    request.id, request.cell_ref, request.requester_name, request.current_value, request.proposed_value
                );
            }
            Ok(format!("{} pending", requests.len()))
        }
        "approve" | "reject" => {
            let (id, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            let Ok(id) = id.parse::<i64>() else {
                return Ok("invalid request id".to_string());
            };
            let reason = Some(reason.trim()).filter(|r| !r.is_empty());
            session
                .resolve_edit_request(id, verb == "approve", reason)
                .await
                .map(|r| format!("request {} {:?}", r.id, r.status))
        }
        "presence" => {
            for record in session.coordinator().presence().users() {
                let cell = record.current_cell.as_deref().unwrap_or("-");
                println!("  {} ({}) at {}", record.label(), record.role.as_str(), cell);
            }
            Ok("ok".to_string())
        }
        "critical" => {
            let rows: Vec<String> = session.critical_rows().iter().map(|r| (r + 1).to_string()).collect();
            Ok(format!("critical rows: [{}]", rows.join(", ")))
        }
        _ => match command.split_once('=') {
            Some((reference, value)) => set_cell(session, reference.trim(), value).await,
            None => Ok("invalid command".to_string()),
        },
    }
}

/// Let both sessions see what the other did.
async fn settle(sessions: &mut [Session]) {
    for _ in 0..2 {
        for session in sessions.iter_mut() {
            session.process_pending().await;
        }
        for session in sessions.iter_mut() {
            session.flush_autosave().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => CollabConfig::load_or_default(path)?,
        None => CollabConfig::default(),
    };
    config.validate()?;

    let server = MemoryServer::new(config.clone());
    let hub = LocalHub::with_server(&server);
    let alice = User::new(1, "alice", Role::Admin).with_display_name("Alice");
    let bob = User::new(2, "bob", Role::Editor).with_display_name("Bob");
    let sheet_id = server
        .connect(alice.clone())
        .create_sheet("Stock", SheetTemplate::Inventory)
        .await?;

    let mut sessions = Vec::new();
    for user in [alice, bob] {
        let session = SheetSession::open(
            server.connect(user.clone()),
            hub.connect(user.clone()),
            user,
            sheet_id,
            config.clone(),
        )
        .await?;
        sessions.push(session);
    }
    settle(&mut sessions).await;

    let mut active = 0;
    let mut view_row = 0;
    let mut status = String::from("ok");
    let mut show = true;
    let mut start_time = Instant::now();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        if show {
            display(&sessions[active], view_row);
        }
        print!("[{:.1}] ({}) > ", start_time.elapsed().as_secs_f64(), status);
        io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let command = line.trim();
        start_time = Instant::now();
        show = true;

        match command {
            "" => status = String::from("invalid command"),
            "q" => break,
            "help" => {
                print_help();
                show = false;
            }
            "w" => {
                view_row = view_row.saturating_sub(VIEW_ROWS);
                status = String::from("ok");
            }
            "s" => {
                let rows = sessions[active].sheet().row_count();
                view_row = (view_row + VIEW_ROWS).min(rows.saturating_sub(VIEW_ROWS));
                status = String::from("ok");
            }
            _ if command.starts_with("export ") => {
                let path = command[7..].trim();
                status = match server.export_sheet(sheet_id, path) {
                    Ok(()) => format!("exported to {}", path),
                    Err(e) => e.to_string(),
                };
            }
            _ if command.starts_with("import ") => {
                status = match server.import_sheet(command[7..].trim()) {
                    Ok(id) => format!("imported as sheet {}", id),
                    Err(e) => e.to_string(),
                };
            }
            _ if command.starts_with("as ") => {
                match sessions.iter().position(|s| s.user().username == command[3..].trim()) {
                    Some(index) => {
                        active = index;
                        status = String::from("ok");
                    }
                    None => status = String::from("unknown user"),
                }
            }
            _ => {
                status = match run_command(&mut sessions[active], command).await {
                    Ok(message) => message,
                    Err(e) => e.to_string(),
                };
                settle(&mut sessions).await;
            }
        }
    }

    for session in sessions.iter_mut() {
        session.flush_autosave().await;
        session.close().await;
    }
    Ok(())
}
