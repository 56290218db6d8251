use std::path::{Path, PathBuf};

use fastchat_core::{Attachment, Envelope};

use crate::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Host(bool),
    Server(String),
    Name(String),
    Image(PathBuf),
    History,
    Unlock(String),
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  /host on|off      run or stop the embedded relay
  /server <url>     connect to another relay (ws:// or wss://)
  /name <name>      change your display name
  /image <path>     send a file as an image attachment
  /history          print the transcript
  /unlock <secret>  supply the shared secret for settings changes
  /quit             exit
anything else is sent as a message";

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.trim_start().strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_owned())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let command = match (name, arg) {
        ("host", "on") => Command::Host(true),
        ("host", "off") => Command::Host(false),
        ("host", _) => return Err("usage: /host on|off".to_owned()),
        ("server", "") => return Err("usage: /server <url>".to_owned()),
        ("server", url) => Command::Server(url.to_owned()),
        ("name", "") => return Err("usage: /name <name>".to_owned()),
        ("name", name) => Command::Name(name.to_owned()),
        ("image", "") => return Err("usage: /image <path>".to_owned()),
        ("image", path) => Command::Image(PathBuf::from(path)),
        ("history", _) => Command::History,
        ("unlock", "") => return Err("usage: /unlock <secret>".to_owned()),
        ("unlock", secret) => Command::Unlock(secret.to_owned()),
        ("help", _) => Command::Help,
        ("quit" | "exit", _) => Command::Quit,
        (other, _) => return Err(format!("unknown command /{other}, try /help")),
    };
    Ok(Some(command))
}

/// `[ts] from: text (+n attachment(s))`
pub fn format_envelope(envelope: &Envelope) -> String {
    let mut line = String::new();
    if let Some(ts) = &envelope.ts {
        line.push_str(&format!("[{ts}] "));
    }
    line.push_str(&envelope.sender);
    line.push(':');
    if !envelope.text.is_empty() {
        line.push(' ');
        line.push_str(&envelope.text);
    }
    match envelope.attachments.len() {
        0 => {}
        1 => line.push_str(" (+1 attachment)"),
        n => line.push_str(&format!(" (+{n} attachments)")),
    }
    line
}

pub fn attachment_from_file(path: &Path) -> Result<Attachment, ClientError> {
    let bytes = std::fs::read(path).map_err(|source| ClientError::Attachment {
        path: path.to_path_buf(),
        source,
    })?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_owned());
    Ok(Attachment::from_bytes(name, mime_for_path(path), &bytes))
}

fn mime_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use fastchat_core::EnvelopeKind;

    use super::*;

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse_command("hello there\n").unwrap(),
            Some(Command::Say("hello there".to_owned()))
        );
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn slash_commands() {
        assert_eq!(parse_command("/host on").unwrap(), Some(Command::Host(true)));
        assert_eq!(parse_command("/host off").unwrap(), Some(Command::Host(false)));
        assert_eq!(
            parse_command("/server ws://10.0.0.2:8765").unwrap(),
            Some(Command::Server("ws://10.0.0.2:8765".to_owned()))
        );
        assert_eq!(
            parse_command("/name  Ana Maria ").unwrap(),
            Some(Command::Name("Ana Maria".to_owned()))
        );
        assert_eq!(
            parse_command("/image ./cat.png").unwrap(),
            Some(Command::Image(PathBuf::from("./cat.png")))
        );
        assert_eq!(parse_command("/history").unwrap(), Some(Command::History));
        assert_eq!(parse_command("/quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn bad_commands_are_reported() {
        assert!(parse_command("/host maybe").is_err());
        assert!(parse_command("/server").is_err());
        assert!(parse_command("/dance").is_err());
    }

    #[test]
    fn envelope_formatting() {
        let mut envelope = Envelope::outgoing("Ana", "hi", Vec::new());
        envelope.ts = Some("2025-03-01T14:05:09".to_owned());
        assert_eq!(format_envelope(&envelope), "[2025-03-01T14:05:09] Ana: hi");

        let image = Envelope::outgoing(
            "Bo",
            "",
            vec![Attachment::from_bytes("a.png", "image/png", b"x")],
        );
        assert_eq!(format_envelope(&image), "Bo: (+1 attachment)");
    }

    #[test]
    fn file_becomes_base64_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Photo.PNG");
        std::fs::write(&path, b"\x89PNG").unwrap();

        let attachment = attachment_from_file(&path).unwrap();
        assert_eq!(attachment.name, "Photo.PNG");
        assert_eq!(attachment.mime, "image/png");
        assert_eq!(attachment.decode_data().unwrap(), b"\x89PNG");

        let envelope = Envelope::outgoing("Ana", "", vec![attachment]);
        assert_eq!(envelope.kind, EnvelopeKind::Image);
    }

    #[test]
    fn missing_file_is_an_attachment_error() {
        let err = attachment_from_file(Path::new("/definitely/not/here.png")).unwrap_err();
        assert!(matches!(err, ClientError::Attachment { .. }));
    }
}
