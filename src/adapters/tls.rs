//! HTTPS listener plumbing: PEM loading and an axum [`Listener`] over a
//! `tls-listener` stream.
use std::{fs::File, io::BufReader, net::SocketAddr, sync::Arc};

use axum::serve::Listener;
use eyre::{Context, Result, eyre};
use futures_util::StreamExt;
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys};
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;

/// Adapts a stream of accepted `(io, addr)` pairs to [`axum::serve`].
pub struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("TLS accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

pub type HttpsListener = AxumListener<TlsListener<TcpListener, TlsAcceptor>>;

/// Build a rustls server config from a PEM certificate chain and PKCS#8 key.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<ServerConfig> {
    let cert_file = &mut BufReader::new(
        File::open(cert_path).with_context(|| format!("failed to open cert file {cert_path}"))?,
    );
    let key_file = &mut BufReader::new(
        File::open(key_path).with_context(|| format!("failed to open key file {key_path}"))?,
    );

    let cert_chain = certs(cert_file).collect::<Result<Vec<_>, _>>()?;
    if cert_chain.is_empty() {
        return Err(eyre!("No certificates found in {cert_path}"));
    }
    let key = pkcs8_private_keys(key_file)
        .next()
        .transpose()?
        .ok_or_else(|| eyre!("No PKCS#8 private key found in key file"))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .context("invalid certificate / key pair")
}

/// Bind `addr` and wrap it in a TLS acceptor.
pub async fn bind_https(addr: &str, cert_path: &str, key_path: &str) -> Result<HttpsListener> {
    let config = load_server_config(cert_path, key_path)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTPS listener on {addr}"))?;
    let local_addr = listener.local_addr().context("Failed to get local addr")?;

    let acceptor = TlsAcceptor::from(Arc::new(config));
    Ok(AxumListener {
        stream: TlsListener::new(acceptor, listener),
        local_addr,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_missing_files() {
        assert!(load_server_config("/no/cert.pem", "/no/key.pem").is_err());
    }

    #[test]
    fn test_empty_pem() {
        let mut cert = NamedTempFile::new().unwrap();
        write!(cert, "not a pem").unwrap();
        let mut key = NamedTempFile::new().unwrap();
        write!(key, "not a pem").unwrap();

        let err = load_server_config(
            cert.path().to_str().unwrap(),
            key.path().to_str().unwrap(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("No certificates"));
    }
}
