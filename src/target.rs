//! Connection targets.
//!
//! A target names the server to connect to, and carries the options used while
//! the connection is being prepared: a credential for `AUTH`, a database for
//! `SELECT`, and a timeout for the whole attempt.
//!
//! Supported forms:
//!
//! - `redis://[user[:password]@]host[:port][/db][?query]` connects over TCP.
//! - `rediss://...` is the same, with TLS on top of TCP.
//! - `redis+unix://[user:password@]/path[?query]` and `unix:///path[?query]`
//!   connect to a unix domain socket.
//!
//! A string without a scheme, like `localhost:6380`, is read as `redis://`.
//!
//! The query may carry `db`, `password` and `timeout` (seconds, negative
//! disables the timer). Other parameters are kept in [`Target::params`].
//! Credentials and query values are percent-decoded.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use percent_encoding::percent_decode_str;
use thiserror::Error;
use url::Url;

/// Port used when a TCP target does not name one.
pub const DEFAULT_PORT: u16 = 6379;

/// Error returned when a target string can't be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid target: {reason}")]
pub struct InvalidTarget {
    reason: &'static str,
}

impl InvalidTarget {
    fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    /// Why the target was rejected.
    pub fn reason(&self) -> &str {
        self.reason
    }
}

/// The scheme of a target, which selects the kind of transport used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain TCP, `redis://`
    Redis,

    /// TLS over TCP, `rediss://`
    Rediss,

    /// Unix domain socket, `redis+unix://` or `unix://`
    Unix,
}

impl Scheme {
    /// Canonical scheme string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Redis => "redis",
            Scheme::Rediss => "rediss",
            Scheme::Unix => "redis+unix",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The transport address derived from a target.
///
/// The display form is what a transport is asked to connect to: `host:port`
/// for TCP, `tls://host:port` for TLS and `unix:///path` for unix sockets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// A TCP host and port.
    Tcp {
        /// Host name or IP literal (IPv6 literals keep their brackets).
        host: String,
        /// Port number.
        port: u16,
    },

    /// A TCP host and port, wrapped in TLS.
    Tls {
        /// Host name or IP literal, also used for SNI.
        host: String,
        /// Port number.
        port: u16,
    },

    /// Path to a unix domain socket.
    Unix(Utf8PathBuf),
}

impl Address {
    /// Host name for TCP and TLS addresses.
    pub fn host(&self) -> Option<&str> {
        match self {
            Address::Tcp { host, .. } | Address::Tls { host, .. } => Some(host),
            Address::Unix(_) => None,
        }
    }

    /// Port for TCP and TLS addresses.
    pub fn port(&self) -> Option<u16> {
        match self {
            Address::Tcp { port, .. } | Address::Tls { port, .. } => Some(*port),
            Address::Unix(_) => None,
        }
    }

    /// Socket path for unix addresses.
    pub fn path(&self) -> Option<&Utf8Path> {
        match self {
            Address::Unix(path) => Some(path),
            _ => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "{host}:{port}"),
            Address::Tls { host, port } => write!(f, "tls://{host}:{port}"),
            Address::Unix(path) => write!(f, "unix://{path}"),
        }
    }
}

/// A parsed connection target.
///
/// Built once per connection attempt and never modified afterwards.
#[derive(Clone, PartialEq)]
pub struct Target {
    scheme: Scheme,
    address: Address,
    auth: Option<String>,
    database: Option<String>,
    timeout: Option<f64>,
    params: BTreeMap<String, String>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("scheme", &self.scheme)
            .field("address", &self.address)
            .field("auth", &self.auth.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("timeout", &self.timeout)
            .field("params", &self.params)
            .finish()
    }
}

impl Target {
    /// Parse a target string.
    pub fn parse(input: &str) -> Result<Self, InvalidTarget> {
        if input.is_empty() {
            return Err(InvalidTarget::new("empty target"));
        }

        if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(InvalidTarget::new("target contains whitespace"));
        }

        for prefix in ["redis+unix://", "unix://"] {
            if let Some(rest) = strip_prefix_ignore_case(input, prefix) {
                return parse_unix(rest);
            }
        }

        if input.contains("://") {
            parse_tcp(input)
        } else {
            parse_tcp(&format!("redis://{input}"))
        }
    }

    /// The target scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Address handed to the transport.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Credential sent with `AUTH`, if any.
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    /// Database (namespace index) sent with `SELECT`, if any.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Connection timeout in seconds from the `timeout` parameter, if any.
    pub fn timeout(&self) -> Option<f64> {
        self.timeout
    }

    /// Query parameters not otherwise interpreted.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

impl FromStr for Target {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Target::parse(s)
    }
}

/// Displays the target with credentials redacted, suitable for logs.
impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if self.auth.is_some() {
            f.write_str(":***@")?;
        }

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        match &self.address {
            Address::Tcp { host, port } | Address::Tls { host, port } => {
                write!(f, "{host}:{port}")?;
                if let Some(database) = &self.database {
                    write!(f, "/{database}")?;
                }
            }
            Address::Unix(path) => {
                write!(f, "{path}")?;
                if let Some(database) = &self.database {
                    query.append_pair("db", database);
                }
            }
        }

        if let Some(timeout) = self.timeout {
            query.append_pair("timeout", &timeout.to_string());
        }
        for (key, value) in &self.params {
            query.append_pair(key, value);
        }

        let query = query.finish();
        if !query.is_empty() {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Options {
    auth: Option<String>,
    database: Option<String>,
    timeout: Option<f64>,
    params: BTreeMap<String, String>,
}

impl Options {
    fn from_query(query: Option<&str>) -> Result<Self, InvalidTarget> {
        let mut options = Options::default();
        let Some(query) = query else {
            return Ok(options);
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "db" => options.database = non_empty(value),
                "password" => options.auth = non_empty(value),
                "timeout" => {
                    options.timeout = non_empty(value)
                        .map(|value| parse_timeout(&value))
                        .transpose()?
                }
                _ => {
                    options.params.insert(key.into_owned(), value.into_owned());
                }
            }
        }

        Ok(options)
    }
}

fn parse_tcp(input: &str) -> Result<Target, InvalidTarget> {
    let url = Url::parse(input).map_err(|_| InvalidTarget::new("malformed URI"))?;

    let scheme = match url.scheme() {
        "redis" => Scheme::Redis,
        "rediss" => Scheme::Rediss,
        _ => return Err(InvalidTarget::new("unsupported scheme")),
    };

    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_owned(),
        _ => return Err(InvalidTarget::new("missing host")),
    };
    let port = url.port().unwrap_or(DEFAULT_PORT);

    let address = match scheme {
        Scheme::Rediss => Address::Tls { host, port },
        _ => Address::Tcp { host, port },
    };

    let mut options = Options::from_query(url.query())?;

    let path = url.path();
    let segment = path.strip_prefix('/').unwrap_or(path);
    if segment.contains('/') {
        return Err(InvalidTarget::new("database must be a single path segment"));
    }
    if let Some(database) = non_empty(decode(segment)?) {
        options.database = Some(database);
    }

    if let Some(password) = url.password() {
        if let Some(password) = non_empty(decode(password)?) {
            options.auth = Some(password);
        }
    }

    Ok(Target {
        scheme,
        address,
        auth: options.auth,
        database: options.database,
        timeout: options.timeout,
        params: options.params,
    })
}

fn parse_unix(rest: &str) -> Result<Target, InvalidTarget> {
    let rest = rest.split('#').next().unwrap_or(rest);

    let (userinfo, rest) = match rest.split_once('@') {
        Some((userinfo, rest)) if !userinfo.contains('/') => (Some(userinfo), rest),
        _ => (None, rest),
    };

    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (rest, None),
    };

    let path = decode(path)?;
    if !path.starts_with('/') {
        return Err(InvalidTarget::new("unix socket path must be absolute"));
    }

    let mut options = Options::from_query(query)?;

    if let Some((_, password)) = userinfo.and_then(|userinfo| userinfo.split_once(':')) {
        if let Some(password) = non_empty(decode(password)?) {
            options.auth = Some(password);
        }
    }

    Ok(Target {
        scheme: Scheme::Unix,
        address: Address::Unix(Utf8PathBuf::from(path.as_ref())),
        auth: options.auth,
        database: options.database,
        timeout: options.timeout,
        params: options.params,
    })
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &input[prefix.len()..])
}

fn decode(value: &str) -> Result<Cow<'_, str>, InvalidTarget> {
    percent_decode_str(value)
        .decode_utf8()
        .map_err(|_| InvalidTarget::new("percent-encoded value is not utf-8"))
}

// An empty `db=` or `password=` is the same as leaving it out.
fn non_empty(value: Cow<'_, str>) -> Option<String> {
    (!value.is_empty()).then(|| value.into_owned())
}

fn parse_timeout(value: &str) -> Result<f64, InvalidTarget> {
    value
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite())
        .ok_or(InvalidTarget::new("timeout must be a number of seconds"))
}
