//! Line-oriented wire protocol spoken over a session channel.
//!
//! The controller writes one command per line: a bare opcode token
//! (`power-on`) or `OPCODE:PAYLOAD` (`delete-snapshot:nightly`). The worker
//! answers each command with exactly one response, either a single status
//! line (`SUCCESS: ...`, `ERROR: ...`, `NO_SNAPSHOTS`, `SESSION_READY`,
//! `SESSION_ENDED`) or a block bracketed by `<NAME>_START` / `<NAME>_END`.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const READY: &str = "SESSION_READY";
pub const ENDED: &str = "SESSION_ENDED";
pub const NO_SNAPSHOTS: &str = "NO_SNAPSHOTS";
pub const SNAPSHOTS_BLOCK: &str = "SNAPSHOTS";
pub const DETAILS_BLOCK: &str = "DETAILS";

const SUCCESS_PREFIX: &str = "SUCCESS:";
const ERROR_PREFIX: &str = "ERROR:";
const START_SUFFIX: &str = "_START";
const END_SUFFIX: &str = "_END";

// ── Opcodes ─────────────────────────────────────────────────────────

/// A single operation the worker executes against its resolved domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opcode {
    ListSnapshots,
    CreateSnapshot,
    DeleteSnapshot { name: String },
    Restart,
    PowerOff,
    PowerOn,
    GracefulShutdown,
    GracefulRestart,
    GetDetails,
    EndSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseOpcodeError {
    #[error("empty command")]
    Empty,

    #[error("unrecognized command '{0}'")]
    Unrecognized(String),

    #[error("command '{0}' requires a payload")]
    MissingPayload(&'static str),

    #[error("command '{0}' does not take a payload")]
    UnexpectedPayload(&'static str),

    #[error("invalid payload for '{opcode}': {reason}")]
    InvalidPayload { opcode: &'static str, reason: String },
}

impl Opcode {
    /// Build a `delete-snapshot` command, rejecting names the wire format
    /// cannot carry.
    pub fn delete_snapshot(name: impl Into<String>) -> Result<Self, ParseOpcodeError> {
        let name = name.into();
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseOpcodeError::MissingPayload("delete-snapshot"));
        }
        if name.contains([':', '\n', '\r']) {
            return Err(ParseOpcodeError::InvalidPayload {
                opcode: "delete-snapshot",
                reason: format!("snapshot name '{name}' contains a reserved character"),
            });
        }
        Ok(Opcode::DeleteSnapshot {
            name: name.to_string(),
        })
    }

    /// The opcode token without its payload.
    pub fn token(&self) -> &'static str {
        match self {
            Opcode::ListSnapshots => "list-snapshots",
            Opcode::CreateSnapshot => "create-snapshot",
            Opcode::DeleteSnapshot { .. } => "delete-snapshot",
            Opcode::Restart => "restart",
            Opcode::PowerOff => "power-off",
            Opcode::PowerOn => "power-on",
            Opcode::GracefulShutdown => "graceful-shutdown",
            Opcode::GracefulRestart => "graceful-restart",
            Opcode::GetDetails => "get-details",
            Opcode::EndSession => "end-session",
        }
    }

    /// Opcodes that may block on a long-running hypervisor task.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Opcode::CreateSnapshot | Opcode::DeleteSnapshot { .. })
    }

    /// Whether `response` is a frame this opcode can legitimately produce.
    ///
    /// `ERROR:` is accepted for every opcode.
    pub fn accepts(&self, response: &Response) -> bool {
        match (self, response) {
            (_, Response::Error(_)) => true,
            (Opcode::ListSnapshots, Response::NoSnapshots) => true,
            (Opcode::ListSnapshots, Response::Block { name, .. }) => name == SNAPSHOTS_BLOCK,
            (Opcode::GetDetails, Response::Block { name, .. }) => name == DETAILS_BLOCK,
            (Opcode::EndSession, Response::Ended) => true,
            (
                Opcode::CreateSnapshot
                | Opcode::DeleteSnapshot { .. }
                | Opcode::Restart
                | Opcode::PowerOff
                | Opcode::PowerOn
                | Opcode::GracefulShutdown
                | Opcode::GracefulRestart,
                Response::Success(_),
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::DeleteSnapshot { name } => write!(f, "delete-snapshot:{name}"),
            other => f.write_str(other.token()),
        }
    }
}

impl FromStr for Opcode {
    type Err = ParseOpcodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseOpcodeError::Empty);
        }

        let (head, payload) = match s.split_once(':') {
            Some((head, payload)) => (head.trim(), Some(payload)),
            None => (s, None),
        };

        let bare = match head {
            "list-snapshots" => Opcode::ListSnapshots,
            "create-snapshot" => Opcode::CreateSnapshot,
            "restart" => Opcode::Restart,
            "power-off" => Opcode::PowerOff,
            "power-on" => Opcode::PowerOn,
            "graceful-shutdown" => Opcode::GracefulShutdown,
            "graceful-restart" => Opcode::GracefulRestart,
            "get-details" => Opcode::GetDetails,
            "end-session" => Opcode::EndSession,
            "delete-snapshot" => {
                return match payload {
                    Some(name) => Opcode::delete_snapshot(name),
                    None => Err(ParseOpcodeError::MissingPayload("delete-snapshot")),
                };
            }
            _ => return Err(ParseOpcodeError::Unrecognized(s.to_string())),
        };

        match payload {
            Some(_) => Err(ParseOpcodeError::UnexpectedPayload(bare.token())),
            None => Ok(bare),
        }
    }
}

// ── Responses ───────────────────────────────────────────────────────

/// One complete response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ready,
    Ended,
    NoSnapshots,
    Success(String),
    Error(String),
    Block { name: String, lines: Vec<String> },
}

impl Response {
    pub fn success(message: impl AsRef<str>) -> Self {
        Response::Success(single_line(message.as_ref()))
    }

    pub fn error(message: impl AsRef<str>) -> Self {
        Response::Error(single_line(message.as_ref()))
    }

    /// Build a multi-line block. Body lines that would read as a sentinel
    /// are indented so they cannot close the block early.
    pub fn block<I, S>(name: &str, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines = lines
            .into_iter()
            .map(|line| {
                let line = single_line(line.as_ref());
                if is_sentinel(&line) {
                    format!("  {line}")
                } else {
                    line
                }
            })
            .collect();
        Response::Block {
            name: name.to_string(),
            lines,
        }
    }

    /// Body lines if this is the block called `name`.
    pub fn block_lines(&self, block: &str) -> Option<&[String]> {
        match self {
            Response::Block { name, lines } if name == block => Some(lines.as_slice()),
            _ => None,
        }
    }

    /// Encode as wire text, newline-terminated.
    pub fn to_wire(&self) -> String {
        let mut out = self.to_string();
        out.push('\n');
        out
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ready => f.write_str(READY),
            Response::Ended => f.write_str(ENDED),
            Response::NoSnapshots => f.write_str(NO_SNAPSHOTS),
            Response::Success(msg) => write!(f, "{SUCCESS_PREFIX} {msg}"),
            Response::Error(msg) => write!(f, "{ERROR_PREFIX} {msg}"),
            Response::Block { name, lines } => {
                writeln!(f, "{name}{START_SUFFIX}")?;
                for line in lines {
                    writeln!(f, "{line}")?;
                }
                write!(f, "{name}{END_SUFFIX}")
            }
        }
    }
}

/// One `SNAPSHOTS` body line: `<created>\t<name>`, with `-` when the
/// creation time is unknown. The name goes last so it may contain anything
/// but a newline.
pub fn snapshot_line(name: &str, created: Option<&str>) -> String {
    format!("{}\t{name}", created.unwrap_or("-"))
}

/// Split a `SNAPSHOTS` body line into the snapshot name and its creation
/// time. A line without a tab is a bare name.
pub fn parse_snapshot_line(line: &str) -> (&str, Option<&str>) {
    let line = line.trim();
    match line.split_once('\t') {
        Some(("-", name)) => (name, None),
        Some((created, name)) => (name, Some(created)),
        None => (line, None),
    }
}

fn single_line(s: &str) -> String {
    s.lines().map(str::trim).filter(|l| !l.is_empty()).collect::<Vec<_>>().join(" ")
}

/// `FOO_START` / `FOO_END` style line: upper-case ASCII, digits and `_`.
fn is_sentinel(line: &str) -> bool {
    let shaped = !line.is_empty()
        && line
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_');
    shaped
        && (line.len() > START_SUFFIX.len() && line.ends_with(START_SUFFIX)
            || line.len() > END_SUFFIX.len() && line.ends_with(END_SUFFIX))
}

// ── Framing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unexpected response line {0:?}")]
    Unexpected(String),

    #[error("{0} has no matching _START line")]
    UnmatchedEnd(String),

    #[error("block {open} interrupted by sentinel {line}")]
    Interleaved { open: String, line: String },

    #[error("block {0} was not terminated")]
    Unterminated(String),

    #[error("trailing data after response: {0:?}")]
    Trailing(String),
}

/// Incremental decoder: feed it lines, get a `Response` once a frame is
/// complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    open: Option<(String, Vec<String>)>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the block currently being collected, if any.
    pub fn open_block(&self) -> Option<&str> {
        self.open.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn push_line(&mut self, line: &str) -> Result<Option<Response>, FrameError> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some((name, lines)) = self.open.as_mut() {
            if line.strip_suffix(END_SUFFIX) == Some(name.as_str()) {
                let (name, lines) = self.open.take().unwrap_or_default();
                return Ok(Some(Response::Block { name, lines }));
            }
            if is_sentinel(line) {
                let open = format!("{name}{START_SUFFIX}");
                self.open = None;
                return Err(FrameError::Interleaved {
                    open,
                    line: line.to_string(),
                });
            }
            lines.push(line.to_string());
            return Ok(None);
        }

        let line = line.trim();
        match line {
            "" => Ok(None),
            READY => Ok(Some(Response::Ready)),
            ENDED => Ok(Some(Response::Ended)),
            NO_SNAPSHOTS => Ok(Some(Response::NoSnapshots)),
            _ => {
                if let Some(msg) = line.strip_prefix(SUCCESS_PREFIX) {
                    return Ok(Some(Response::Success(msg.trim().to_string())));
                }
                if let Some(msg) = line.strip_prefix(ERROR_PREFIX) {
                    return Ok(Some(Response::Error(msg.trim().to_string())));
                }
                if is_sentinel(line) {
                    if let Some(name) = line.strip_suffix(START_SUFFIX) {
                        self.open = Some((name.to_string(), Vec::new()));
                        return Ok(None);
                    }
                    return Err(FrameError::UnmatchedEnd(line.to_string()));
                }
                Err(FrameError::Unexpected(line.to_string()))
            }
        }
    }
}

impl FromStr for Response {
    type Err = FrameError;

    /// Parse exactly one frame from complete wire text.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut decoder = FrameDecoder::new();
        let mut lines = s.lines();
        for line in lines.by_ref() {
            if let Some(response) = decoder.push_line(line)? {
                let rest: Vec<&str> = lines.filter(|l| !l.trim().is_empty()).collect();
                if !rest.is_empty() {
                    return Err(FrameError::Trailing(rest.join("\n")));
                }
                return Ok(response);
            }
        }
        match decoder.open_block() {
            Some(name) => Err(FrameError::Unterminated(name.to_string())),
            None => Err(FrameError::Unexpected(String::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_opcodes() {
        assert_eq!("power-on".parse::<Opcode>().unwrap(), Opcode::PowerOn);
        assert_eq!("  get-details \n".parse::<Opcode>().unwrap(), Opcode::GetDetails);
        assert_eq!("end-session".parse::<Opcode>().unwrap(), Opcode::EndSession);
    }

    #[test]
    fn parses_delete_snapshot_payload() {
        let op: Opcode = "delete-snapshot:nightly-01".parse().unwrap();
        assert_eq!(
            op,
            Opcode::DeleteSnapshot {
                name: "nightly-01".into()
            }
        );
        assert_eq!(op.to_string(), "delete-snapshot:nightly-01");
    }

    #[test]
    fn rejects_unknown_token_verbatim() {
        let err = "reformat-disk".parse::<Opcode>().unwrap_err();
        assert_eq!(err, ParseOpcodeError::Unrecognized("reformat-disk".into()));
        assert!(err.to_string().contains("reformat-disk"));
    }

    #[test]
    fn rejects_missing_and_unexpected_payloads() {
        assert_eq!(
            "delete-snapshot".parse::<Opcode>().unwrap_err(),
            ParseOpcodeError::MissingPayload("delete-snapshot")
        );
        assert_eq!(
            "delete-snapshot:   ".parse::<Opcode>().unwrap_err(),
            ParseOpcodeError::MissingPayload("delete-snapshot")
        );
        assert_eq!(
            "power-on:now".parse::<Opcode>().unwrap_err(),
            ParseOpcodeError::UnexpectedPayload("power-on")
        );
    }

    #[test]
    fn snapshot_lines_keep_names_intact() {
        let line = snapshot_line("pre upgrade (v2)", Some("2026-01-01T00:00:00Z"));
        assert_eq!(
            parse_snapshot_line(&line),
            ("pre upgrade (v2)", Some("2026-01-01T00:00:00Z"))
        );
        assert_eq!(
            parse_snapshot_line(&snapshot_line("a\tb", None)),
            ("a\tb", None)
        );
        assert_eq!(parse_snapshot_line("  manual"), ("manual", None));
    }

    #[test]
    fn snapshot_names_with_colons_are_rejected() {
        assert!(matches!(
            Opcode::delete_snapshot("a:b"),
            Err(ParseOpcodeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn long_running_opcodes() {
        assert!(Opcode::CreateSnapshot.is_long_running());
        assert!(Opcode::delete_snapshot("x").unwrap().is_long_running());
        assert!(!Opcode::PowerOn.is_long_running());
    }

    #[test]
    fn no_snapshots_is_a_bare_line() {
        assert_eq!(Response::NoSnapshots.to_wire(), "NO_SNAPSHOTS\n");
        assert_eq!("NO_SNAPSHOTS".parse::<Response>().unwrap(), Response::NoSnapshots);
    }

    #[test]
    fn details_block_is_bracketed_once() {
        let resp = Response::block(DETAILS_BLOCK, ["name: web01", "state: running"]);
        let wire = resp.to_string();
        let lines: Vec<&str> = wire.lines().collect();
        assert_eq!(lines.first(), Some(&"DETAILS_START"));
        assert_eq!(lines.last(), Some(&"DETAILS_END"));
        assert_eq!(lines.iter().filter(|l| **l == "DETAILS_START").count(), 1);
        assert_eq!(lines.iter().filter(|l| **l == "DETAILS_END").count(), 1);
        assert_eq!(wire.parse::<Response>().unwrap(), resp);
    }

    #[test]
    fn status_messages_are_flattened() {
        let resp = Response::error("line one\nline two");
        assert_eq!(resp.to_wire(), "ERROR: line one line two\n");
        assert_eq!(
            "SUCCESS:   started".parse::<Response>().unwrap(),
            Response::Success("started".into())
        );
    }

    #[test]
    fn sentinel_like_body_lines_are_escaped() {
        let resp = Response::block(SNAPSHOTS_BLOCK, ["SNAPSHOTS_END"]);
        let parsed: Response = resp.to_wire().parse().unwrap();
        assert_eq!(
            parsed.block_lines(SNAPSHOTS_BLOCK),
            Some(&["  SNAPSHOTS_END".to_string()][..])
        );
    }

    #[test]
    fn interleaved_sentinel_is_rejected() {
        let err = "DETAILS_START\nname: a\nSNAPSHOTS_END\n"
            .parse::<Response>()
            .unwrap_err();
        assert!(matches!(err, FrameError::Interleaved { .. }));
    }

    #[test]
    fn unterminated_and_orphaned_blocks_are_rejected() {
        assert_eq!(
            "DETAILS_START\nname: a\n".parse::<Response>().unwrap_err(),
            FrameError::Unterminated("DETAILS".into())
        );
        assert_eq!(
            "DETAILS_END".parse::<Response>().unwrap_err(),
            FrameError::UnmatchedEnd("DETAILS_END".into())
        );
        assert!(matches!(
            "hello".parse::<Response>().unwrap_err(),
            FrameError::Unexpected(_)
        ));
    }

    #[test]
    fn opcode_accepts_only_its_own_frames() {
        let details = Response::block(DETAILS_BLOCK, ["a: b"]);
        assert!(Opcode::GetDetails.accepts(&details));
        assert!(!Opcode::PowerOn.accepts(&details));
        assert!(Opcode::ListSnapshots.accepts(&Response::NoSnapshots));
        assert!(Opcode::PowerOn.accepts(&Response::error("nope")));
        assert!(!Opcode::PowerOn.accepts(&Response::Ready));
    }
}
