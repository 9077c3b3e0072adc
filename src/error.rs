pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    SerdeYaml,
    SerdeJson,
    DomainStr,
    DnsWire,
    Telemetry,
    Internal,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Telemetry, message)
    }

    pub fn wire(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DnsWire, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Transport and decoding problems are handled in place by the RPZ
    /// client; everything else stops the agent.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Io | ErrorKind::DnsWire)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}", message),
            None => self.kind.fmt(f),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;

        match self {
            Io => write!(f, "io error"),
            SerdeYaml => write!(f, "serde yaml error"),
            SerdeJson => write!(f, "serde json error"),
            DomainStr => write!(f, "invalid domain name"),
            DnsWire => write!(f, "dns wire error"),
            Telemetry => write!(f, "invalid telemetry"),
            Internal => write!(f, "internal error"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self {
            kind: ErrorKind::Io,
            message: Some(value.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeYaml,
            message: Some(value.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::SerdeJson,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::name::FromStrError> for Error {
    fn from(value: domain::base::name::FromStrError) -> Self {
        Self {
            kind: ErrorKind::DomainStr,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::message::ShortMessage> for Error {
    fn from(value: domain::base::message::ShortMessage) -> Self {
        Self {
            kind: ErrorKind::DnsWire,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::wire::ParseError> for Error {
    fn from(value: domain::base::wire::ParseError) -> Self {
        Self {
            kind: ErrorKind::DnsWire,
            message: Some(value.to_string()),
        }
    }
}

impl From<domain::base::message_builder::PushError> for Error {
    fn from(value: domain::base::message_builder::PushError) -> Self {
        Self {
            kind: ErrorKind::DnsWire,
            message: Some(value.to_string()),
        }
    }
}
