//! Rule lists, application protocols and transport classes
//!
//! Small closed enums used to index signature buffers and the inspection
//! dispatch table. Every enum exposes a dense `index()` so callers can build
//! flat arrays instead of maps.

use std::fmt;

/// Rule list selector: which buffer a signature match belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SigList {
    /// Packet header matches
    Packet,
    /// Packet/stream payload
    Payload,
    /// Normalized HTTP uri
    Uri,
    /// Raw HTTP uri
    RawUri,
    /// HTTP request body
    ClientBody,
    /// HTTP response body / SMTP file data
    FileData,
    /// Normalized HTTP headers
    Headers,
    /// Raw HTTP headers
    RawHeaders,
    /// HTTP status message
    StatMsg,
    /// HTTP status code
    StatCode,
    /// Normalized HTTP host
    Host,
    /// Raw HTTP host header
    RawHost,
    /// HTTP method
    Method,
    /// HTTP cookie
    Cookie,
    /// HTTP user agent
    UserAgent,
    /// HTTP request line
    RequestLine,
    /// App layer events
    AppEvent,
    /// Generic app layer
    AppLayer,
    Dcerpc,
    Tag,
    /// File properties
    File,
    /// DNS query name
    DnsQuery,
    Modbus,
    PostMatch,
    Suppress,
    Threshold,
    /// Internal marker for "no list"; never a valid selector
    NotSet,
}

impl SigList {
    /// Every list including the `NotSet` marker, in index order
    pub const ALL: [SigList; 27] = [
        SigList::Packet,
        SigList::Payload,
        SigList::Uri,
        SigList::RawUri,
        SigList::ClientBody,
        SigList::FileData,
        SigList::Headers,
        SigList::RawHeaders,
        SigList::StatMsg,
        SigList::StatCode,
        SigList::Host,
        SigList::RawHost,
        SigList::Method,
        SigList::Cookie,
        SigList::UserAgent,
        SigList::RequestLine,
        SigList::AppEvent,
        SigList::AppLayer,
        SigList::Dcerpc,
        SigList::Tag,
        SigList::File,
        SigList::DnsQuery,
        SigList::Modbus,
        SigList::PostMatch,
        SigList::Suppress,
        SigList::Threshold,
        SigList::NotSet,
    ];

    /// Number of lists, `NotSet` included
    pub const COUNT: usize = Self::ALL.len();

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether this value may be used as a rule list selector
    pub fn is_selector(self) -> bool {
        !matches!(self, SigList::NotSet)
    }

    /// Lists whose patterns live in the uri pattern id space
    pub fn is_uri(self) -> bool {
        matches!(self, SigList::Uri | SigList::RawUri)
    }

    /// Human readable name
    pub fn as_str(self) -> &'static str {
        match self {
            SigList::Packet => "packet",
            SigList::Payload => "packet/stream payload",
            SigList::Uri => "http uri",
            SigList::RawUri => "http raw uri",
            SigList::ClientBody => "http client body",
            SigList::FileData => "http server body",
            SigList::Headers => "http headers",
            SigList::RawHeaders => "http raw headers",
            SigList::StatMsg => "http stat msg",
            SigList::StatCode => "http stat code",
            SigList::Host => "http host",
            SigList::RawHost => "http raw host header",
            SigList::Method => "http method",
            SigList::Cookie => "http cookie",
            SigList::UserAgent => "http user-agent",
            SigList::RequestLine => "http request line",
            SigList::AppEvent => "app layer events",
            SigList::AppLayer => "generic app layer",
            SigList::Dcerpc => "dcerpc",
            SigList::Tag => "tag",
            SigList::File => "file",
            SigList::DnsQuery => "dns query",
            SigList::Modbus => "modbus",
            SigList::PostMatch => "post-match",
            SigList::Suppress => "suppress",
            SigList::Threshold => "threshold",
            SigList::NotSet => "not set (internal)",
        }
    }

    /// Map a sticky buffer / content modifier keyword to its list
    pub fn from_modifier(keyword: &str) -> Option<Self> {
        let list = match keyword {
            "http_uri" | "http.uri" => SigList::Uri,
            "http_raw_uri" | "http.uri.raw" => SigList::RawUri,
            "http_client_body" | "http_request_body" | "http.request_body" => SigList::ClientBody,
            "file_data" | "http_server_body" | "http_response_body" => SigList::FileData,
            "http_header" | "http.header" => SigList::Headers,
            "http_raw_header" | "http.header.raw" => SigList::RawHeaders,
            "http_stat_msg" | "http.stat_msg" => SigList::StatMsg,
            "http_stat_code" | "http.stat_code" => SigList::StatCode,
            "http_host" | "http.host" => SigList::Host,
            "http_raw_host" | "http.host.raw" => SigList::RawHost,
            "http_method" | "http.method" => SigList::Method,
            "http_cookie" | "http.cookie" => SigList::Cookie,
            "http_user_agent" | "http.user_agent" => SigList::UserAgent,
            "http_request_line" | "http.request_line" => SigList::RequestLine,
            "dns_query" | "dns.query" => SigList::DnsQuery,
            "pkt_data" => SigList::Payload,
            _ => return None,
        };
        Some(list)
    }
}

impl fmt::Display for SigList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application layer protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AppProto {
    /// Not (yet) detected; not a valid registration target
    Unknown,
    Http,
    Ftp,
    Smtp,
    Tls,
    Ssh,
    Imap,
    Msn,
    Jabber,
    Smb,
    Smb2,
    Dcerpc,
    Irc,
    Dns,
    Modbus,
    /// Detection failed; not a valid registration target
    Failed,
}

impl AppProto {
    pub const ALL: [AppProto; 16] = [
        AppProto::Unknown,
        AppProto::Http,
        AppProto::Ftp,
        AppProto::Smtp,
        AppProto::Tls,
        AppProto::Ssh,
        AppProto::Imap,
        AppProto::Msn,
        AppProto::Jabber,
        AppProto::Smb,
        AppProto::Smb2,
        AppProto::Dcerpc,
        AppProto::Irc,
        AppProto::Dns,
        AppProto::Modbus,
        AppProto::Failed,
    ];

    pub const COUNT: usize = Self::ALL.len();

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Real protocols, i.e. everything between the `Unknown` and `Failed` markers
    pub fn is_real(self) -> bool {
        !matches!(self, AppProto::Unknown | AppProto::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AppProto::Unknown => "unknown",
            AppProto::Http => "http",
            AppProto::Ftp => "ftp",
            AppProto::Smtp => "smtp",
            AppProto::Tls => "tls",
            AppProto::Ssh => "ssh",
            AppProto::Imap => "imap",
            AppProto::Msn => "msn",
            AppProto::Jabber => "jabber",
            AppProto::Smb => "smb",
            AppProto::Smb2 => "smb2",
            AppProto::Dcerpc => "dcerpc",
            AppProto::Irc => "irc",
            AppProto::Dns => "dns",
            AppProto::Modbus => "modbus",
            AppProto::Failed => "failed",
        }
    }
}

impl fmt::Display for AppProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol class used to bucket flows
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportClass {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl TransportClass {
    pub const ALL: [TransportClass; 4] = [
        TransportClass::Tcp,
        TransportClass::Udp,
        TransportClass::Icmp,
        TransportClass::Other,
    ];

    pub const COUNT: usize = Self::ALL.len();

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Classify an IP protocol number
    pub fn from_ip_proto(proto: u8) -> Self {
        match proto {
            6 => TransportClass::Tcp,
            17 => TransportClass::Udp,
            1 | 58 => TransportClass::Icmp,
            _ => TransportClass::Other,
        }
    }
}
