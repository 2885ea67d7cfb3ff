//! SBRP 1.0 codec.
//!
//! SBRP is an ASCII line protocol carried inline in the host's byte stream:
//!
//! ```text
//! "SBRP 1.0 " + <10-byte fixed-width command> [ " " <body> ] "\r\n"
//! ```
//!
//! A frame is a control message only if it is at least prefix+command bytes
//! long and begins with the exact prefix; everything else is opaque payload
//! and is relayed untouched. Parsing never fails — unrecognized commands map
//! to [`ControlCommand::Unknown`] and the caller treats them as payload too.
//!
//! Outbound messages (`RELAY_PORT`, `ERROR_MESG`) are relay→host only; their
//! command strings are deliberately absent from the inbound table.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::error::QuitCode;

/// Protocol prefix every control line starts with.
pub const PREFIX: &[u8] = b"SBRP 1.0 ";

/// Width of the fixed command field that follows the prefix.
pub const CMD_LEN: usize = 10;

/// Control commands a host can issue inline in its data stream.
///
/// This enum belongs to the codec alone; registry mutations travel as
/// `RegistryEvent` values on their own channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `RENAME_CON <name>`: relabel the session.
    Rename(String),
    /// `QUIT_RELAY`: request full relay shutdown.
    Quit,
    /// `LIST_CONNS`: request a connection listing.
    ListConns,
    /// `SWITCHSBRP <ON|OFF>`: toggle protocol framing for this session.
    SetProtocolMode(bool),
    /// Prefixed frame with a command outside the table above. Callers relay
    /// it as plain payload.
    Unknown,
}

/// Parse one frame. Returns `None` when the frame does not carry the SBRP
/// prefix (or is too short to), meaning it is opaque payload.
pub fn parse(frame: &[u8]) -> Option<ControlCommand> {
    if frame.len() < PREFIX.len() + CMD_LEN || !frame.starts_with(PREFIX) {
        return None;
    }
    let cmd = std::str::from_utf8(&frame[PREFIX.len()..PREFIX.len() + CMD_LEN]).unwrap_or("");
    let body = if frame.len() > PREFIX.len() + CMD_LEN + 1 {
        String::from_utf8_lossy(&frame[PREFIX.len() + CMD_LEN + 1..])
            .trim_end_matches(['\r', '\n'])
            .to_string()
    } else {
        String::new()
    };
    debug!(command = cmd, body = %body, "SBRP frame");
    let parsed = match cmd {
        "RENAME_CON" => ControlCommand::Rename(body),
        "QUIT_RELAY" => ControlCommand::Quit,
        "LIST_CONNS" => ControlCommand::ListConns,
        // Substring containment, not token matching, and case-sensitive.
        "SWITCHSBRP" => ControlCommand::SetProtocolMode(!(body.contains("OFF") || body.contains("FALSE"))),
        _ => ControlCommand::Unknown,
    };
    Some(parsed)
}

/// Build an `ERROR_MESG` line.
pub fn format_error(code: QuitCode, message: &str) -> Vec<u8> {
    format!("SBRP 1.0 ERROR_MESG {} {}\r\n", code.wire_name(), message).into_bytes()
}

/// Build a `RELAY_PORT` confirmation line.
pub fn format_port_assignment(port: u16) -> Vec<u8> {
    format!("SBRP 1.0 RELAY_PORT {port}\r\n").into_bytes()
}

/// Report an error condition toward a host.
///
/// The formatted line is always logged; it is written to `conn` only when
/// protocol framing is enabled and a connection is present. Any write error
/// is returned for the caller to judge — most call sites treat it as
/// non-fatal.
pub async fn send_error<W>(
    conn: Option<&mut W>,
    code: QuitCode,
    use_protocol: bool,
    message: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    error!(code = code.wire_name(), message, "SBRP error");
    if use_protocol {
        if let Some(conn) = conn {
            conn.write_all(&format_error(code, message)).await?;
        }
    }
    Ok(())
}

/// Confirm the allocated client-facing port to a host, under the same
/// protocol gating as [`send_error`]. The allocation stands either way.
pub async fn send_port_assignment<W>(conn: &mut W, port: u16, use_protocol: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!(port, "assigning relay port");
    if use_protocol {
        conn.write_all(&format_port_assignment(port)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognized_commands_parse() {
        assert_eq!(
            parse(b"SBRP 1.0 RENAME_CON my-session\r\n"),
            Some(ControlCommand::Rename("my-session".into()))
        );
        assert_eq!(parse(b"SBRP 1.0 QUIT_RELAY"), Some(ControlCommand::Quit));
        assert_eq!(parse(b"SBRP 1.0 LIST_CONNS\n"), Some(ControlCommand::ListConns));
    }

    #[test]
    fn switchsbrp_matches_substrings() {
        assert_eq!(
            parse(b"SBRP 1.0 SWITCHSBRP ON"),
            Some(ControlCommand::SetProtocolMode(true))
        );
        assert_eq!(
            parse(b"SBRP 1.0 SWITCHSBRP OFF"),
            Some(ControlCommand::SetProtocolMode(false))
        );
        assert_eq!(
            parse(b"SBRP 1.0 SWITCHSBRP FALSE"),
            Some(ControlCommand::SetProtocolMode(false))
        );
        // Containment anywhere in the body counts, by design.
        assert_eq!(
            parse(b"SBRP 1.0 SWITCHSBRP handOFF"),
            Some(ControlCommand::SetProtocolMode(false))
        );
        // Lowercase does not match.
        assert_eq!(
            parse(b"SBRP 1.0 SWITCHSBRP off"),
            Some(ControlCommand::SetProtocolMode(true))
        );
        // No body defaults to on.
        assert_eq!(
            parse(b"SBRP 1.0 SWITCHSBRP"),
            Some(ControlCommand::SetProtocolMode(true))
        );
    }

    #[test]
    fn non_prefixed_and_short_frames_are_payload() {
        assert_eq!(parse(b"hello world"), None);
        assert_eq!(parse(b""), None);
        assert_eq!(parse(b"SBRP 1.0 "), None);
        // Prefix present but shorter than prefix + command width.
        assert_eq!(parse(b"SBRP 1.0 QUIT"), None);
        // Prefix must match exactly.
        assert_eq!(parse(b"sbrp 1.0 QUIT_RELAY"), None);
    }

    #[test]
    fn unrecognized_commands_are_unknown() {
        assert_eq!(parse(b"SBRP 1.0 NO_SUCHCMD body"), Some(ControlCommand::Unknown));
        // Non-UTF-8 command bytes never panic.
        let mut frame = b"SBRP 1.0 ".to_vec();
        frame.extend_from_slice(&[0xff; 10]);
        assert_eq!(parse(&frame), Some(ControlCommand::Unknown));
    }

    #[test]
    fn outbound_lines_do_not_parse_as_control_commands() {
        // The codec is not symmetric: relay→host messages fall outside the
        // inbound command table.
        let line = format_port_assignment(8081);
        assert_eq!(parse(&line), Some(ControlCommand::Unknown));
        let line = format_error(QuitCode::ClientClosureError, "gone");
        assert_eq!(parse(&line), Some(ControlCommand::Unknown));
    }

    #[test]
    fn formatted_lines_are_crlf_terminated_ascii() {
        let line = format_port_assignment(9001);
        assert_eq!(line, b"SBRP 1.0 RELAY_PORT 9001\r\n");
        let line = format_error(QuitCode::CannotListenForClient, "range exhausted");
        assert_eq!(
            line,
            b"SBRP 1.0 ERROR_MESG CANNOT_LISTEN_FOR_CLIENT range exhausted\r\n"
        );
    }

    #[tokio::test]
    async fn send_error_writes_only_under_protocol() {
        let (mut a, mut b) = tokio::io::duplex(256);

        send_error(Some(&mut a), QuitCode::ClientClosureError, true, "c1 gone")
            .await
            .unwrap();
        let mut buf = vec![0u8; 256];
        let n = tokio::io::AsyncReadExt::read(&mut b, &mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).contains("CLIENT_CLOSURE_ERROR"));

        // Framing off: logged but nothing hits the wire.
        send_error(Some(&mut a), QuitCode::ClientClosureError, false, "quiet")
            .await
            .unwrap();
        drop(a);
        let n = tokio::io::AsyncReadExt::read(&mut b, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn send_port_assignment_respects_gating() {
        let (mut a, mut b) = tokio::io::duplex(64);
        send_port_assignment(&mut a, 8082, false).await.unwrap();
        drop(a);
        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut b, &mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
