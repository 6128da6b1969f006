use std::fmt;
use tonic::{
    metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap},
    transport::{Channel, ClientTlsConfig, Endpoint},
};

/// The metadata header carrying the customer API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Where the control plane lives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnInfo {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid control plane address {0:?}")]
    InvalidAddress(String),

    #[error("unsupported scheme {0:?} in control plane address")]
    UnsupportedScheme(String),

    #[error("invalid metadata header {0:?}")]
    InvalidHeader(String),

    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

// === impl ConnInfo ===

impl ConnInfo {
    /// Parses a control plane address.
    ///
    /// `http://` disables TLS and defaults to port 80. `https://`, or no scheme at all, enables TLS
    /// and defaults to port 443.
    pub fn parse(address: &str) -> Result<Self, Error> {
        let address = address.trim();
        let uri = if address.contains("://") {
            address.parse::<http::Uri>()
        } else {
            format!("https://{address}").parse::<http::Uri>()
        }
        .map_err(|_| Error::InvalidAddress(address.to_string()))?;

        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            Some(scheme) => return Err(Error::UnsupportedScheme(scheme.to_string())),
            None => return Err(Error::InvalidAddress(address.to_string())),
        };

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::InvalidAddress(address.to_string()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        Ok(Self { host, port, secure })
    }

    /// Builds a lazily-connecting channel. When secure, the peer name is pinned to the host.
    pub fn channel(&self) -> Result<Channel, Error> {
        let scheme = if self.secure { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{}:{}", self.host, self.port))?;
        if self.secure {
            endpoint = endpoint.tls_config(
                ClientTlsConfig::new()
                    .domain_name(self.host.clone())
                    .with_webpki_roots(),
            )?;
        }
        Ok(endpoint.connect_lazy())
    }
}

impl fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// Builds the metadata attached to every call: the API key plus any extra headers.
pub fn call_metadata(api_key: &str, extra: &[(String, String)]) -> Result<MetadataMap, Error> {
    let mut md = MetadataMap::new();
    let key = AsciiMetadataValue::try_from(api_key)
        .map_err(|_| Error::InvalidHeader(API_KEY_HEADER.to_string()))?;
    md.insert(API_KEY_HEADER, key);

    for (name, value) in extra {
        let k = name
            .to_ascii_lowercase()
            .parse::<AsciiMetadataKey>()
            .map_err(|_| Error::InvalidHeader(name.clone()))?;
        let v = AsciiMetadataValue::try_from(value.as_str())
            .map_err(|_| Error::InvalidHeader(name.clone()))?;
        md.append(k, v);
    }
    Ok(md)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            ConnInfo::parse("https://cloud.example.com").unwrap(),
            ConnInfo {
                host: "cloud.example.com".to_string(),
                port: 443,
                secure: true,
            }
        );
        assert_eq!(
            ConnInfo::parse("http://somecooladdress:1234").unwrap(),
            ConnInfo {
                host: "somecooladdress".to_string(),
                port: 1234,
                secure: false,
            }
        );
        assert_eq!(
            ConnInfo::parse("http://localhost").unwrap(),
            ConnInfo {
                host: "localhost".to_string(),
                port: 80,
                secure: false,
            }
        );
        assert_eq!(
            ConnInfo::parse("director.example.com:8443").unwrap(),
            ConnInfo {
                host: "director.example.com".to_string(),
                port: 8443,
                secure: true,
            }
        );
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(matches!(
            ConnInfo::parse("ftp://example.com"),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!(
            ConnInfo::parse(""),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(
            ConnInfo::parse("http://exa mple.com"),
            Err(Error::InvalidAddress(_))
        ));
    }

    #[test]
    fn display() {
        let info = ConnInfo::parse("director.example.com:8443").unwrap();
        assert_eq!(info.to_string(), "https://director.example.com:8443");
    }

    #[test]
    fn metadata_includes_key_and_extras() {
        let md = call_metadata(
            "secret-key",
            &[
                ("X-Tenant".to_string(), "acme".to_string()),
                ("x-trace".to_string(), "1".to_string()),
            ],
        )
        .unwrap();
        assert_eq!(md.get(API_KEY_HEADER).unwrap(), "secret-key");
        assert_eq!(md.get("x-tenant").unwrap(), "acme");
        assert_eq!(md.get("x-trace").unwrap(), "1");
    }

    #[test]
    fn metadata_rejects_invalid_headers() {
        assert!(call_metadata("k", &[("bad header".to_string(), "v".to_string())]).is_err());
        assert!(call_metadata("line\nbreak", &[]).is_err());
    }
}
