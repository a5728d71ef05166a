use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Section header that carries the request fields
pub const ASK_SECTION: &str = "[Ask]";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AskError {
    #[error("no {} section in request", ASK_SECTION)]
    MissingSection,
    #[error("request has no Socket= field")]
    MissingSocket,
    #[error("request has more than one Socket= field")]
    DuplicateSocket,
}

pub type Result<T, E = AskError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Message,
    Socket,
    NotAfter,
    Pid,
}

impl Field {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "Message" => Some(Field::Message),
            "Socket" => Some(Field::Socket),
            "NotAfter" => Some(Field::NotAfter),
            "PID" => Some(Field::Pid),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Field::Message => "Message",
            Field::Socket => "Socket",
            Field::NotAfter => "NotAfter",
            Field::Pid => "PID",
        }
    }
}

/// A parsed `ask.*` request file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskRequest {
    /// File name of the request inside the ask directory
    pub id: String,
    pub message: String,
    /// Datagram socket the answer goes to
    pub socket: PathBuf,
    /// CLOCK_MONOTONIC deadline in microseconds, if any
    pub not_after: Option<u64>,
    pub pid: Option<u32>,
    pub is_boot: bool,
}

/// Optional fields never reject a request; a bad value just goes missing.
fn parse_lenient<T: FromStr>(field: Field, value: &str) -> Option<T> {
    let parsed = value.parse().ok();
    if parsed.is_none() {
        log::debug!("ignoring unparseable {}={:?}", field.name(), value);
    }
    parsed
}

impl AskRequest {
    /// Parses the `[Ask]` section of a request file.
    ///
    /// Lines before the section and after the next section header are
    /// ignored, as are keys outside the known field set.
    pub fn parse(id: impl Into<String>, contents: &str, boot_marker: &str) -> Result<Self> {
        let mut lines = contents.lines().map(str::trim);
        if !lines.by_ref().any(|line| line == ASK_SECTION) {
            return Err(AskError::MissingSection);
        }

        let mut message = String::new();
        let mut socket: Option<PathBuf> = None;
        let mut not_after = None;
        let mut pid = None;
        for line in lines.take_while(|line| !line.starts_with('[')) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let Some(field) = Field::from_key(key.trim()) else {
                continue;
            };
            let value = value.trim();
            match field {
                Field::Message => message = value.to_owned(),
                Field::Socket => {
                    if socket.replace(PathBuf::from(value)).is_some() {
                        return Err(AskError::DuplicateSocket);
                    }
                }
                Field::NotAfter => {
                    not_after = parse_lenient::<u64>(field, value).filter(|&t| t != 0)
                }
                Field::Pid => pid = parse_lenient(field, value),
            }
        }

        let socket = socket.ok_or(AskError::MissingSocket)?;
        let is_boot = message.contains(boot_marker);
        Ok(Self {
            id: id.into(),
            message,
            socket,
            not_after,
            pid,
            is_boot,
        })
    }

    /// Whether the deadline lies at or before `now_usec`.
    pub fn is_expired(&self, now_usec: u64) -> bool {
        self.not_after.map_or(false, |deadline| deadline <= now_usec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    const BOOT_REQUEST: &str = "[Ask]\n\
        PID=412\n\
        Socket=/run/s1\n\
        AcceptCached=1\n\
        Echo=0\n\
        NotAfter=0\n\
        Message=Please enter passphrase for boot disk\n";

    #[test]
    fn boot_request_is_classified_boot() -> Result<()> {
        let request = AskRequest::parse("ask.x1", BOOT_REQUEST, "boot")?;
        assert_eq!(request.id, "ask.x1");
        assert_eq!(request.socket, PathBuf::from("/run/s1"));
        assert_eq!(request.message, "Please enter passphrase for boot disk");
        assert_eq!(request.pid, Some(412));
        assert_eq!(request.not_after, None);
        assert!(request.is_boot);
        Ok(())
    }

    #[test]
    fn other_messages_default_to_root() -> Result<()> {
        let contents = "[Ask]\nSocket=/run/s2\nMessage=Please enter passphrase for disk root_crypt\n";
        assert!(!AskRequest::parse("ask.x2", contents, "boot")?.is_boot);
        let no_message = "[Ask]\nSocket=/run/s2\n";
        assert!(!AskRequest::parse("ask.x3", no_message, "boot")?.is_boot);
        Ok(())
    }

    #[test]
    fn marker_match_is_case_sensitive() -> Result<()> {
        let contents = "[Ask]\nSocket=/run/s\nMessage=BOOT\n";
        assert!(!AskRequest::parse("ask.x", contents, "boot")?.is_boot);
        Ok(())
    }

    #[test]
    fn fields_before_section_are_ignored() {
        let contents = "Socket=/run/early\n[Ask]\nMessage=boot\n";
        assert_eq!(
            AskRequest::parse("ask.x", contents, "boot"),
            Err(AskError::MissingSocket)
        );
    }

    #[test]
    fn parsing_stops_at_next_section() {
        let contents = "[Ask]\nMessage=boot\n[Other]\nSocket=/run/late\n";
        assert_eq!(
            AskRequest::parse("ask.x", contents, "boot"),
            Err(AskError::MissingSocket)
        );
    }

    #[test]
    fn missing_section_is_rejected() {
        assert_eq!(
            AskRequest::parse("ask.x", "Socket=/run/s\n", "boot"),
            Err(AskError::MissingSection)
        );
        assert_eq!(
            AskRequest::parse("ask.x", "", "boot"),
            Err(AskError::MissingSection)
        );
    }

    #[test]
    fn second_socket_is_rejected() {
        let contents = "[Ask]\nSocket=/run/a\nSocket=/run/b\n";
        assert_eq!(
            AskRequest::parse("ask.x", contents, "boot"),
            Err(AskError::DuplicateSocket)
        );
    }

    #[test]
    fn crlf_and_padding_are_trimmed() -> Result<()> {
        let contents = "  [Ask]  \r\nSocket = /run/s \r\nMessage=boot\r\n";
        let request = AskRequest::parse("ask.x", contents, "boot")?;
        assert_eq!(request.socket, PathBuf::from("/run/s"));
        assert!(request.is_boot);
        Ok(())
    }

    #[test]
    fn deadline_expiry() -> Result<()> {
        let contents = "[Ask]\nSocket=/run/s\nNotAfter=5000\n";
        let request = AskRequest::parse("ask.x", contents, "boot")?;
        assert_eq!(request.not_after, Some(5000));
        assert!(!request.is_expired(4999));
        assert!(request.is_expired(5000));
        Ok(())
    }

    #[test]
    fn malformed_deadline_is_ignored() -> Result<()> {
        let contents = "[Ask]\nSocket=/run/s\nNotAfter=soon\n";
        let request = AskRequest::parse("ask.x", contents, "boot")?;
        assert_eq!(request.not_after, None);
        assert!(!request.is_expired(u64::MAX));
        Ok(())
    }

    #[test]
    fn empty_deadline_is_ignored() -> Result<()> {
        let contents = "[Ask]\nSocket=/run/s\nNotAfter=\nMessage=boot\n";
        let request = AskRequest::parse("ask.x", contents, "boot")?;
        assert_eq!(request.not_after, None);
        assert!(request.is_boot);
        Ok(())
    }

    #[test]
    fn malformed_pid_is_ignored() -> Result<()> {
        let contents = "[Ask]\nPID=abc\nSocket=/run/s1\nMessage=Please enter passphrase for boot disk\n";
        let request = AskRequest::parse("ask.x", contents, "boot")?;
        assert_eq!(request.pid, None);
        assert_eq!(request.socket, PathBuf::from("/run/s1"));
        assert!(request.is_boot);
        Ok(())
    }
}
