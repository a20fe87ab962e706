//! Interactive and one-shot front ends over the session supervisor.
//!
//! All terminal presentation (spinners, colour, prompts) lives here.

use std::fmt;

use console::style;
use inquire::{Confirm, Select, Text};
use vmctl_worker::protocol::{DETAILS_BLOCK, SNAPSHOTS_BLOCK, parse_snapshot_line};
use vmctl_worker::{Opcode, Response};

use crate::config::SystemConfig;
use crate::error::VmctlError;
use crate::inventory::{Inventory, Record};
use crate::progress::Progress;
use crate::session::{Session, Supervisor, Target};

// ── actions ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ListSnapshots,
    CreateSnapshot,
    DeleteSnapshot,
    PowerOn,
    PowerOff,
    Restart,
    GracefulShutdown,
    GracefulRestart,
    Details,
    Quit,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::ListSnapshots,
        Action::CreateSnapshot,
        Action::DeleteSnapshot,
        Action::PowerOn,
        Action::PowerOff,
        Action::Restart,
        Action::GracefulShutdown,
        Action::GracefulRestart,
        Action::Details,
        Action::Quit,
    ];

    /// Opcode for actions that need no further input.
    pub fn opcode(self) -> Option<Opcode> {
        match self {
            Action::ListSnapshots => Some(Opcode::ListSnapshots),
            Action::CreateSnapshot => Some(Opcode::CreateSnapshot),
            Action::PowerOn => Some(Opcode::PowerOn),
            Action::PowerOff => Some(Opcode::PowerOff),
            Action::Restart => Some(Opcode::Restart),
            Action::GracefulShutdown => Some(Opcode::GracefulShutdown),
            Action::GracefulRestart => Some(Opcode::GracefulRestart),
            Action::Details => Some(Opcode::GetDetails),
            Action::DeleteSnapshot | Action::Quit => None,
        }
    }

    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Action::DeleteSnapshot
                | Action::PowerOff
                | Action::Restart
                | Action::GracefulShutdown
                | Action::GracefulRestart
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::ListSnapshots => "List snapshots",
            Action::CreateSnapshot => "Create snapshot",
            Action::DeleteSnapshot => "Delete snapshot",
            Action::PowerOn => "Power on",
            Action::PowerOff => "Power off (hard)",
            Action::Restart => "Restart (hard reset)",
            Action::GracefulShutdown => "Shut down (guest agent)",
            Action::GracefulRestart => "Restart (guest agent)",
            Action::Details => "Show details",
            Action::Quit => "Quit",
        })
    }
}

struct Choice<'a>(&'a Record);

impl fmt::Display for Choice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = self.0;
        write!(f, "{:<24} {:<10} {} ({})", r.name, r.status, r.location, r.group)
    }
}

// ── rendering ────────────────────────────────────────────

/// Snapshot names from a `list-snapshots` response.
pub fn snapshot_names(response: &Response) -> Vec<String> {
    response
        .block_lines(SNAPSHOTS_BLOCK)
        .unwrap_or_default()
        .iter()
        .map(|line| parse_snapshot_line(line).0.to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Human-readable lines for a response.
pub fn render_response(response: &Response) -> Vec<String> {
    match response {
        Response::Success(msg) => vec![format!("{} {msg}", style("\u{2713}").green())],
        Response::Error(msg) => vec![format!("{} {msg}", style("\u{2717}").red())],
        Response::NoSnapshots => vec!["No snapshots.".to_string()],
        Response::Ready => vec!["Session ready.".to_string()],
        Response::Ended => vec!["Session ended.".to_string()],
        Response::Block { name, lines } if name == SNAPSHOTS_BLOCK => {
            let mut out = vec![format!("Snapshots ({}):", lines.len())];
            out.extend(lines.iter().map(|l| match parse_snapshot_line(l) {
                (name, Some(created)) => format!("  {name}  {}", style(created).dim()),
                (name, None) => format!("  {name}"),
            }));
            out
        }
        Response::Block { name, lines } if name == DETAILS_BLOCK => lines
            .iter()
            .map(|l| match l.split_once(": ") {
                Some((key, value)) => format!("  {:<14} {value}", style(key).bold()),
                None => format!("  {l}"),
            })
            .collect(),
        Response::Block { lines, .. } => lines.iter().map(|l| format!("  {l}")).collect(),
    }
}

fn print_response(response: &Response) {
    for line in render_response(response) {
        println!("{line}");
    }
}

fn print_error(err: &VmctlError) {
    eprintln!("{} {err}", style("error:").red().bold());
}

// ── shared ───────────────────────────────────────────────

fn target_for(system: &SystemConfig, record: &Record) -> Result<Target, VmctlError> {
    let endpoint = system
        .endpoint(&record.location)
        .ok_or_else(|| VmctlError::NotFound {
            message: format!(
                "endpoint '{}' for '{}' is not in the config",
                record.location, record.name
            ),
        })?;
    Ok(Target {
        domain: record.name.clone(),
        endpoint: endpoint.name.clone(),
        uri: endpoint.uri.clone(),
    })
}

async fn open_session(
    supervisor: &mut Supervisor,
    target: &Target,
    progress: Progress,
) -> Result<Session, VmctlError> {
    progress
        .run(
            &format!("Opening session to {target}"),
            supervisor.open(target.clone()),
        )
        .await
}

fn map_inquire_err(e: inquire::InquireError) -> VmctlError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            VmctlError::Cancelled
        }
        other => VmctlError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}

// ── exec ─────────────────────────────────────────────────

/// Parse every opcode before anything is opened.
pub fn parse_opcodes(tokens: &[String]) -> Result<Vec<Opcode>, VmctlError> {
    tokens
        .iter()
        .map(|t| {
            t.parse::<Opcode>().map_err(|e| VmctlError::Validation {
                message: format!("{t}: {e}"),
            })
        })
        .map(|op| match op {
            Ok(Opcode::EndSession) => Err(VmctlError::Validation {
                message: "end-session is implied; the session is always closed".into(),
            }),
            other => other,
        })
        .collect()
}

/// Run `opcodes` against one VM. Returns `false` if any of them failed.
pub async fn exec(
    system: &SystemConfig,
    name: &str,
    opcodes: &[String],
    location: Option<&str>,
    progress: Progress,
) -> Result<bool, VmctlError> {
    let opcodes = parse_opcodes(opcodes)?;
    let inventory = Inventory::load(&system.cache_path())?;
    let record = inventory.find_exact(name, location)?;
    let target = target_for(system, record)?;

    let mut supervisor = Supervisor::from_config(system);
    let mut session = open_session(&mut supervisor, &target, progress).await?;

    let mut all_ok = true;
    for opcode in &opcodes {
        tracing::info!(vm = %target, %opcode, "exec");
        match supervisor.send_default(&mut session, opcode).await {
            Ok(response) => print_response(&response),
            Err(e) => {
                all_ok = false;
                print_error(&e);
                if e.ends_session() {
                    break;
                }
            }
        }
    }

    supervisor.close(&mut session).await;
    Ok(all_ok)
}

// ── manage ───────────────────────────────────────────────

fn pick_record<'a>(inventory: &'a Inventory, pattern: &str) -> Result<&'a Record, VmctlError> {
    let hits = inventory.search(pattern);
    match hits.len() {
        0 => Err(VmctlError::NotFound {
            message: format!("no VM matches '{pattern}'"),
        }),
        1 => Ok(hits[0]),
        _ => {
            let choices: Vec<Choice<'a>> = hits.into_iter().map(Choice).collect();
            let picked = Select::new("Select a VM:", choices)
                .with_page_size(15)
                .prompt()
                .map_err(map_inquire_err)?;
            Ok(picked.0)
        }
    }
}

fn confirm(question: &str) -> Result<bool, VmctlError> {
    Confirm::new(question)
        .with_default(false)
        .prompt()
        .map_err(map_inquire_err)
}

/// Turn a menu choice into an opcode, prompting as needed. `None` means
/// the user backed out.
async fn prepare(
    action: Action,
    supervisor: &Supervisor,
    session: &mut Session,
    target: &Target,
) -> Result<Option<Opcode>, VmctlError> {
    let opcode = match action.opcode() {
        Some(opcode) => opcode,
        None => {
            let listing = supervisor
                .send_default(session, &Opcode::ListSnapshots)
                .await?;
            let names = snapshot_names(&listing);
            if names.is_empty() {
                println!("No snapshots to delete.");
                return Ok(None);
            }
            let name = Select::new("Snapshot to delete:", names)
                .prompt()
                .map_err(map_inquire_err)?;
            Opcode::delete_snapshot(name).map_err(|e| VmctlError::Validation {
                message: e.to_string(),
            })?
        }
    };

    if action.is_destructive() {
        let question = match &opcode {
            Opcode::DeleteSnapshot { name } => format!("Delete snapshot '{name}' of {target}?"),
            _ => format!("{action} {target}?"),
        };
        if !confirm(&question)? {
            return Ok(None);
        }
    }
    Ok(Some(opcode))
}

/// Action menu over one open session. Returns `true` if the user asked to
/// reopen after a fatal session error.
async fn menu(
    supervisor: &Supervisor,
    session: &mut Session,
    target: &Target,
    progress: Progress,
) -> Result<bool, VmctlError> {
    loop {
        let action = match Select::new(&format!("{target}:"), Action::ALL.to_vec())
            .with_page_size(Action::ALL.len())
            .prompt()
        {
            Ok(Action::Quit) => return Ok(false),
            Ok(action) => action,
            Err(e) => match map_inquire_err(e) {
                VmctlError::Cancelled => return Ok(false),
                other => return Err(other),
            },
        };

        let opcode = match prepare(action, supervisor, session, target).await {
            Ok(Some(opcode)) => opcode,
            Ok(None) | Err(VmctlError::Cancelled) => continue,
            Err(e) if e.ends_session() => {
                print_error(&e);
                return offer_reopen();
            }
            Err(e) => {
                print_error(&e);
                continue;
            }
        };

        let label = format!("{action}");
        match progress
            .run(&label, supervisor.send_default(session, &opcode))
            .await
        {
            Ok(response) => print_response(&response),
            Err(e) if e.ends_session() => {
                print_error(&e);
                return offer_reopen();
            }
            Err(e) => print_error(&e),
        }
    }
}

fn offer_reopen() -> Result<bool, VmctlError> {
    match confirm("The session was lost. Reopen it?") {
        Ok(reopen) => Ok(reopen),
        Err(VmctlError::Cancelled) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Search, pick a VM, and drive it from a menu until the user quits.
pub async fn manage(
    system: &SystemConfig,
    pattern: Option<String>,
    progress: Progress,
) -> Result<(), VmctlError> {
    let inventory = Inventory::load(&system.cache_path())?;
    let pattern = match pattern {
        Some(p) => p,
        None => Text::new("Search VMs:")
            .prompt()
            .map_err(map_inquire_err)?,
    };
    let record = pick_record(&inventory, &pattern)?;
    let target = target_for(system, record)?;

    let mut supervisor = Supervisor::from_config(system);
    loop {
        let mut session = open_session(&mut supervisor, &target, progress).await?;
        let outcome = menu(&supervisor, &mut session, &target, progress).await;
        supervisor.close(&mut session).await;

        match outcome {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
