use thiserror::Error;
use url::Url;

/// Scheme of a stream endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Returns true when connections to this scheme require a TLS handshake.
    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Https)
    }

    /// Port implied by the scheme when the URL does not carry one.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Decomposed stream endpoint, derived once per session from the URL and
/// immutable afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Request target: the path plus optional `?query`.
    pub target: String,
}

impl Endpoint {
    /// Host form used for socket connect and TLS server-name lookup.
    ///
    /// `host` keeps IPv6 brackets because that is the `Host` header form;
    /// socket APIs want the bare address.
    pub fn connect_host(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(&self.host)
    }
}

/// Errors produced while decomposing a stream URL.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("invalid url: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("url has no host")]
    MissingHost,
}

/// Splits a URL into the pieces needed to open a stream connection.
pub fn resolve(url: &str) -> Result<Endpoint, EndpointError> {
    let parsed = Url::parse(url)?;

    let scheme = match parsed.scheme() {
        "http" => Scheme::Http,
        "https" => Scheme::Https,
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };

    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or(EndpointError::MissingHost)?
        .to_string();
    let port = parsed.port().unwrap_or_else(|| scheme.default_port());

    let mut target = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        target.push('?');
        target.push_str(query);
    }

    Ok(Endpoint {
        scheme,
        host,
        port,
        target,
    })
}
