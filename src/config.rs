//! Server settings, all from `TUTORSLOT_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::engine::StudentConflictPolicy;

pub const WAL_FILE_NAME: &str = "tutorslot.wal";

pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// Compact at startup once the replayed log is longer than this.
    pub compact_threshold: usize,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub student_policy: StudentConflictPolicy,
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` maps a variable name to its value, if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let parsed = |key: &str, default| -> io::Result<usize> {
            match lookup(key) {
                None => Ok(default),
                Some(v) => v.trim().parse().map_err(|_| invalid(format!("{key}: not a number: {v}"))),
            }
        };

        let port = match lookup("TUTORSLOT_PORT") {
            None => 5433,
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| invalid(format!("TUTORSLOT_PORT: not a port: {v}")))?,
        };
        let metrics_port = match lookup("TUTORSLOT_METRICS_PORT") {
            None => None,
            Some(v) => Some(
                v.trim()
                    .parse()
                    .map_err(|_| invalid(format!("TUTORSLOT_METRICS_PORT: not a port: {v}")))?,
            ),
        };
        let student_policy = match lookup("TUTORSLOT_STUDENT_CONFLICT") {
            None => StudentConflictPolicy::default(),
            Some(v) => StudentConflictPolicy::parse(v.trim()).ok_or_else(|| {
                invalid(format!(
                    "TUTORSLOT_STUDENT_CONFLICT must be `window` or `overlap`, got {v}"
                ))
            })?,
        };

        let tls_cert = lookup("TUTORSLOT_TLS_CERT");
        let tls_key = lookup("TUTORSLOT_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(invalid(
                "both TUTORSLOT_TLS_CERT and TUTORSLOT_TLS_KEY must be set, or neither".into(),
            ));
        }

        Ok(Self {
            port,
            bind: lookup("TUTORSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("TUTORSLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("TUTORSLOT_PASSWORD").unwrap_or_else(|| "tutorslot".into()),
            max_connections: parsed("TUTORSLOT_MAX_CONNECTIONS", 256)?,
            compact_threshold: parsed("TUTORSLOT_COMPACT_THRESHOLD", 1000)?,
            tls_cert,
            tls_key,
            metrics_port,
            student_policy,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Reads the PEM files. `None` when TLS is not configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| invalid("no private key found in key file".into()))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> io::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 5433);
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data").join("tutorslot.wal"));
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.student_policy, StudentConflictPolicy::Window);
        assert!(config.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides() {
        let config = config_from(&[
            ("TUTORSLOT_PORT", "6000"),
            ("TUTORSLOT_BIND", "127.0.0.1"),
            ("TUTORSLOT_DATA_DIR", "/tmp/ts"),
            ("TUTORSLOT_MAX_CONNECTIONS", "8"),
            ("TUTORSLOT_METRICS_PORT", "9100"),
            ("TUTORSLOT_STUDENT_CONFLICT", "overlap"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.wal_path(), PathBuf::from("/tmp/ts/tutorslot.wal"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.student_policy, StudentConflictPolicy::Overlap);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(config_from(&[("TUTORSLOT_PORT", "http")]).is_err());
        assert!(config_from(&[("TUTORSLOT_STUDENT_CONFLICT", "strict")]).is_err());
        assert!(config_from(&[("TUTORSLOT_COMPACT_THRESHOLD", "-1")]).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        let err = config_from(&[("TUTORSLOT_TLS_CERT", "cert.pem")]).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
