use std::{fs::File, io::BufReader, path::Path, sync::Arc};

use tokio_rustls::rustls::ServerConfig;

use crate::{WebhookError, WebhookResult};

/// Load the certificate chain and key into a rustls server config.
pub fn server_config(cert: &Path, key: &Path) -> WebhookResult<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert)?))
        .collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key)?))?
        .ok_or_else(|| {
            WebhookError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no private key in key file",
            ))
        })?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}
