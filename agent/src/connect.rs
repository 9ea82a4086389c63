use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lru::LruCache;
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerName};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector as RustlsConnector;
use tracing::{debug, trace};

use crate::agent::SessionOptions;
use crate::session_id::SessionId;

/// Transport stream a session is multiplexed over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Seam between the pool and the network.
///
/// The production implementation is [`NetConnector`]; tests plug in an
/// in-process transport instead.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a transport stream to the identity's origin, reusing any recycled
    /// TLS state for that identity.
    async fn connect(&self, id: &SessionId, options: &SessionOptions) -> io::Result<Box<dyn Io>>;

    /// Drops recycled TLS state for the identity. Called after a connect error
    /// or a heartbeat failure, when the cached state may be stale.
    fn invalidate(&self, _id: &SessionId) {}
}

/// TCP for `http` origins, rustls over TCP (ALPN `h2`) for everything else.
///
/// TLS client configs are cached per identity in a bounded LRU; rustls keeps
/// its session resumption store inside the config, so reusing the config
/// resumes the previous TLS session on reconnect.
pub struct NetConnector {
    configs: Mutex<LruCache<SessionId, Arc<ClientConfig>>>,
}

impl NetConnector {
    pub fn new(max_cached_tls_sessions: usize) -> Self {
        NetConnector {
            configs: Mutex::new(LruCache::new(max_cached_tls_sessions)),
        }
    }

    fn config_for(
        &self,
        id: &SessionId,
        options: &SessionOptions,
    ) -> io::Result<Arc<ClientConfig>> {
        if let Some(config) = self.configs.lock().unwrap().get(id) {
            trace!(sid = %id, "reusing cached tls config");
            return Ok(config.clone());
        }
        let config = Arc::new(build_tls_config(options)?);
        self.configs.lock().unwrap().put(id.clone(), config.clone());
        debug!(sid = %id, "tls config cached");
        Ok(config)
    }
}

#[async_trait]
impl Connector for NetConnector {
    async fn connect(&self, id: &SessionId, options: &SessionOptions) -> io::Result<Box<dyn Io>> {
        let (scheme, host, port) = split_origin(id.origin())?;
        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        tcp.set_nodelay(true)?;
        if scheme == "http" {
            return Ok(Box::new(tcp));
        }
        let config = self.config_for(id, options)?;
        let server_name = match host.parse::<IpAddr>() {
            Ok(ip) => ServerName::IpAddress(ip),
            Err(_) => ServerName::try_from(host.as_str()).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidInput, "invalid server name")
            })?,
        };
        let tls = RustlsConnector::from(config)
            .connect(server_name, tcp)
            .await?;
        Ok(Box::new(tls))
    }

    fn invalidate(&self, id: &SessionId) {
        if self.configs.lock().unwrap().pop(id).is_some() {
            debug!(sid = %id, "tls config invalidated");
        }
    }
}

fn build_tls_config(options: &SessionOptions) -> io::Result<ClientConfig> {
    let to_io = |e: rustls::Error| io::Error::new(io::ErrorKind::InvalidInput, e);
    let client_auth = match (&options.cert, &options.key) {
        (Some(chain), Some(key)) => Some((
            chain.iter().cloned().map(Certificate).collect::<Vec<_>>(),
            PrivateKey(key.clone()),
        )),
        _ => None,
    };
    let builder = ClientConfig::builder().with_safe_defaults();
    let mut config = if options.reject_unauthorized == Some(false) {
        let builder =
            builder.with_custom_certificate_verifier(Arc::new(NoCertificateVerification {}));
        match client_auth {
            Some((chain, key)) => builder.with_single_cert(chain, key).map_err(to_io)?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let mut roots = RootCertStore::empty();
        for der in options.ca.iter().flatten() {
            roots
                .add(&Certificate(der.clone()))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        }
        let builder = builder.with_root_certificates(roots);
        match client_auth {
            Some((chain, key)) => builder.with_single_cert(chain, key).map_err(to_io)?,
            None => builder.with_no_client_auth(),
        }
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(config)
}

fn split_origin(origin: &str) -> io::Result<(String, String, u16)> {
    let uri: http::Uri = origin
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid origin"))?;
    let scheme = uri.scheme_str().unwrap_or("https").to_owned();
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "origin without host"))?
        .to_owned();
    let port = uri
        .port_u16()
        .unwrap_or(if scheme == "http" { 80 } else { 443 });
    Ok((scheme, host, port))
}

struct NoCertificateVerification {}

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_for(origin: &str, options: &SessionOptions) -> SessionId {
        SessionId::new(&origin.parse().unwrap(), options)
    }

    #[test]
    fn caches_tls_configs_per_identity() {
        let options = SessionOptions {
            reject_unauthorized: Some(false),
            ..Default::default()
        };
        let connector = NetConnector::new(10);
        let id = id_for("https://foo.org", &options);
        let a = connector.config_for(&id, &options).unwrap();
        let b = connector.config_for(&id, &options).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn invalidation_drops_the_cached_config() {
        let options = SessionOptions {
            reject_unauthorized: Some(false),
            ..Default::default()
        };
        let connector = NetConnector::new(10);
        let id = id_for("https://foo.org", &options);
        let a = connector.config_for(&id, &options).unwrap();
        connector.invalidate(&id);
        let b = connector.config_for(&id, &options).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn cache_is_bounded() {
        let options = SessionOptions {
            reject_unauthorized: Some(false),
            ..Default::default()
        };
        let connector = NetConnector::new(1);
        let a = id_for("https://a.org", &options);
        let b = id_for("https://b.org", &options);
        let first = connector.config_for(&a, &options).unwrap();
        connector.config_for(&b, &options).unwrap();
        // "a" was evicted by "b"
        let again = connector.config_for(&a, &options).unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn malformed_ca_roots_are_rejected() {
        let options = SessionOptions {
            ca: Some(vec![vec![0u8; 4]]),
            ..Default::default()
        };
        let err = build_tls_config(&options).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn splits_origins() {
        assert_eq!(
            split_origin("https://foo.org").unwrap(),
            ("https".to_owned(), "foo.org".to_owned(), 443)
        );
        assert_eq!(
            split_origin("http://foo.org:8080").unwrap(),
            ("http".to_owned(), "foo.org".to_owned(), 8080)
        );
        assert!(split_origin("///").is_err());
    }
}
