//! TLS termination: certificate/key loading and the plain-or-TLS stream.
//!
//! Cryptography is delegated to `rustls`; this module only turns configured
//! PEM material into a [`TlsAcceptor`] and hides the plain/TLS split behind
//! one stream type so the connection engine stays transport-agnostic.

use crate::errors::Error;
use std::{
    io,
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
    TlsAcceptor,
};

/// TLS certificate or key material, as a file path or an in-memory PEM
/// buffer (selectable per field, matching deployments that mount secrets
/// directly into memory).
#[derive(Debug, Clone)]
pub enum TlsMaterial {
    /// Read PEM data from this file at server construction.
    File(PathBuf),
    /// PEM data already in memory.
    Buffer(Vec<u8>),
}

impl TlsMaterial {
    fn load(&self) -> Result<Vec<u8>, Error> {
        match self {
            TlsMaterial::File(path) => std::fs::read(path)
                .map_err(|err| Error::Tls(format!("{}: {err}", path.display()))),
            TlsMaterial::Buffer(data) => Ok(data.clone()),
        }
    }
}

/// Builds a TLS acceptor from PEM cert chain + private key.
///
/// All failures surface before the listening socket starts accepting.
pub(crate) fn build_acceptor(
    certs: &TlsMaterial,
    private_key: &TlsMaterial,
) -> Result<TlsAcceptor, Error> {
    let certs_pem = certs.load()?;
    let key_pem = private_key.load()?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut certs_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|err| Error::Tls(format!("bad certificate: {err}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificates in PEM material".into()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|err| Error::Tls(format!("bad private key: {err}")))?
        .ok_or_else(|| Error::Tls("no private key in PEM material".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::Tls(err.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// A client connection stream, TLS-wrapped or not.
pub(crate) enum MaybeTls {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(test)]
    Mem(tokio::io::DuplexStream),
}

impl AsyncRead for MaybeTls {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            #[cfg(test)]
            MaybeTls::Mem(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTls {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_write(cx, data),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, data),
            #[cfg(test)]
            MaybeTls::Mem(stream) => Pin::new(stream).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_flush(cx),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            #[cfg(test)]
            MaybeTls::Mem(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeTls::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            #[cfg(test)]
            MaybeTls::Mem(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reported_with_path() {
        let material = TlsMaterial::File(PathBuf::from("/definitely/not/here.pem"));
        let err = match build_acceptor(&material, &material) {
            Ok(_) => panic!("expected build_acceptor to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Tls(msg) if msg.contains("/definitely/not/here.pem")));
    }

    #[test]
    fn garbage_pem_rejected() {
        let material = TlsMaterial::Buffer(b"not a pem at all".to_vec());
        let err = match build_acceptor(&material, &material) {
            Ok(_) => panic!("expected build_acceptor to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Tls(_)));
    }
}
