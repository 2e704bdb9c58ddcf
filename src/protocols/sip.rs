//! SIP message parsing and construction
//!
//! The proxy is a forwarding proxy, not a user agent stack: it needs to
//! classify datagrams, read a handful of routing headers, rewrite the
//! Request-URI and Via of forwarded requests, and synthesise simple
//! requests and responses. Messages are kept as an ordered header list
//! over owned strings so a forwarded message re-serialises with its
//! original header order and body intact.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{Error, Result};

/// SIP request methods handled by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Other(String),
}

impl SipMethod {
    pub fn from_token(token: &str) -> Self {
        match token {
            "REGISTER" => Self::Register,
            "INVITE" => Self::Invite,
            "ACK" => Self::Ack,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "OPTIONS" => Self::Options,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Register => "REGISTER",
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Options => "OPTIONS",
            Self::Other(s) => s,
        }
    }
}

/// Methods advertised in the OPTIONS `Allow` response.
pub const ALLOWED_METHODS: &str = "REGISTER, INVITE, ACK, BYE, CANCEL, OPTIONS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: SipMethod,
        uri: String,
    },
    Status {
        code: u16,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start: StartLine,
    /// Headers in arrival order, original spelling preserved.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// RFC 3261 compact header forms the mesh phones actually emit.
fn expand_compact(name: &str) -> &str {
    match name {
        "f" => "from",
        "t" => "to",
        "v" => "via",
        "i" => "call-id",
        "m" => "contact",
        "l" => "content-length",
        "c" => "content-type",
        other => other,
    }
}

fn names_match(header: &str, wanted_lower: &str) -> bool {
    let lower = header.to_ascii_lowercase();
    expand_compact(&lower) == wanted_lower
}

impl SipMessage {
    /// Parse a datagram. SIP over UDP is one message per datagram; the
    /// body is whatever follows the blank line, carried opaquely.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (head, body) = split_head_body(data);
        let text = std::str::from_utf8(head)
            .map_err(|_| Error::parse("SIP header section is not UTF-8"))?;

        let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));
        let start_line = lines
            .next()
            .ok_or_else(|| Error::parse("empty SIP message"))?
            .trim_end();
        let start = parse_start_line(start_line)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header.
                if let Some(last) = headers.last_mut() {
                    last.1.push(' ');
                    last.1.push_str(line.trim());
                }
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(Error::parse(format!("malformed header line: {}", line)));
            };
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            start,
            headers,
            body: body.to_vec(),
        })
    }

    pub fn new_request(method: SipMethod, uri: &str) -> Self {
        Self {
            start: StartLine::Request {
                method,
                uri: uri.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Build a response to `request`, copying the headers a stateless UA
    /// expects to see reflected (all Vias, From, To, Call-ID, CSeq).
    pub fn new_response(code: u16, reason: &str, request: &SipMessage) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();
        for (name, value) in &request.headers {
            if names_match(name, "via") {
                headers.push((name.clone(), value.clone()));
            }
        }
        for wanted in ["from", "to", "call-id", "cseq"] {
            if let Some((name, value)) = request
                .headers
                .iter()
                .find(|(name, _)| names_match(name, wanted))
            {
                headers.push((name.clone(), value.clone()));
            }
        }
        Self {
            start: StartLine::Status {
                code,
                reason: reason.to_string(),
            },
            headers,
            body: Vec::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn method(&self) -> Option<&SipMethod> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Status { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Status { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start {
            StartLine::Status { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    /// First header value matching `name` (case-insensitive, compact
    /// forms accepted).
    pub fn header(&self, name: &str) -> Option<&str> {
        let wanted = expand_compact(&name.to_ascii_lowercase()).to_string();
        self.headers
            .iter()
            .find(|(n, _)| names_match(n, &wanted))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        let wanted = expand_compact(&name.to_ascii_lowercase()).to_string();
        self.headers
            .iter()
            .filter(|(n, _)| names_match(n, &wanted))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace the first matching header, or append when absent.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let wanted = expand_compact(&name.to_ascii_lowercase()).to_string();
        for (n, v) in self.headers.iter_mut() {
            if names_match(n, &wanted) {
                *v = value.to_string();
                return;
            }
        }
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// CSeq as `(sequence, method)`.
    pub fn cseq(&self) -> Option<(u32, SipMethod)> {
        let value = self.header("CSeq")?;
        let mut parts = value.split_whitespace();
        let seq: u32 = parts.next()?.parse().ok()?;
        let method = SipMethod::from_token(parts.next()?);
        Some((seq, method))
    }

    /// Expires resolution: `Expires` header first, then the `expires`
    /// parameter on `Contact`.
    pub fn expires(&self) -> Option<u32> {
        if let Some(value) = self.header("Expires") {
            if let Ok(v) = value.trim().parse() {
                return Some(v);
            }
        }
        self.header("Contact")
            .and_then(|contact| header_param(contact, "expires"))
            .and_then(|v| v.parse().ok())
    }

    /// Rewrite the Request-URI of a request (forwarding).
    pub fn set_request_uri(&mut self, new_uri: &str) -> Result<()> {
        match &mut self.start {
            StartLine::Request { uri, .. } => {
                *uri = new_uri.to_string();
                Ok(())
            }
            StartLine::Status { .. } => {
                Err(Error::invalid_state("cannot rewrite URI of a response"))
            }
        }
    }

    /// Prepend a Via header as the new topmost entry.
    pub fn prepend_via(&mut self, via_value: &str) {
        let pos = self
            .headers
            .iter()
            .position(|(n, _)| names_match(n, "via"))
            .unwrap_or(0);
        self.headers
            .insert(pos, ("Via".to_string(), via_value.to_string()));
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        match &self.start {
            StartLine::Request { method, uri } => {
                out.push_str(method.as_str());
                out.push(' ');
                out.push_str(uri);
                out.push_str(" SIP/2.0\r\n");
            }
            StartLine::Status { code, reason } => {
                out.push_str(&format!("SIP/2.0 {} {}\r\n", code, reason));
            }
        }
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if !self
            .headers
            .iter()
            .any(|(n, _)| names_match(n, "content-length"))
        {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = find_subslice(data, b"\r\n\r\n") {
        (&data[..pos], &data[pos + 4..])
    } else if let Some(pos) = find_subslice(data, b"\n\n") {
        (&data[..pos], &data[pos + 2..])
    } else {
        (data, &[])
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_start_line(line: &str) -> Result<StartLine> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code: u16 = parts
            .next()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| Error::parse(format!("bad status line: {}", line)))?;
        let reason = parts.next().unwrap_or("").to_string();
        return Ok(StartLine::Status { code, reason });
    }
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::parse("empty start line"))?;
    let uri = parts
        .next()
        .ok_or_else(|| Error::parse(format!("request line without URI: {}", line)))?;
    let version = parts.next().unwrap_or("");
    if !version.starts_with("SIP/2.0") {
        return Err(Error::parse(format!("unsupported SIP version: {}", line)));
    }
    Ok(StartLine::Request {
        method: SipMethod::from_token(method),
        uri: uri.to_string(),
    })
}

static URI_USER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"sips?:([^@;>\s]+)@").expect("static regex"));

/// Extract the user part of a SIP URI or of a From/To/Contact header
/// containing one, e.g. `"Alice" <sip:1234@10.1.1.2>;tag=x` -> `1234`.
pub fn uri_user(value: &str) -> Option<String> {
    URI_USER
        .captures(value)
        .map(|caps| caps[1].to_string())
}

/// Extract the display-name part of a From/To header, unquoted.
pub fn display_name(value: &str) -> Option<String> {
    let before = value.split('<').next()?.trim();
    if before.is_empty() {
        return None;
    }
    let unquoted = before.trim_matches('"').trim();
    if unquoted.is_empty() {
        None
    } else {
        Some(unquoted.to_string())
    }
}

/// Extract a `;param=value` parameter from a header value.
pub fn header_param(value: &str, param: &str) -> Option<String> {
    let prefix = format!("{}=", param.to_ascii_lowercase());
    for part in value.split(';').skip(1) {
        let part = part.trim();
        if part.to_ascii_lowercase().starts_with(&prefix) {
            let raw = &part[prefix.len()..];
            return Some(raw.trim_matches('"').to_string());
        }
    }
    None
}

/// The `tag` parameter of a From/To header.
pub fn tag_of(value: &str) -> Option<String> {
    header_param(value, "tag")
}

pub fn generate_tag() -> String {
    format!("{:x}", rand::random::<u64>())
}

/// Via branch with the RFC 3261 magic cookie.
pub fn generate_branch() -> String {
    format!("z9hG4bK{:x}", rand::random::<u64>())
}

pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), host)
}
