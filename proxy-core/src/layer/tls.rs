//! TLS MITM layer (spec.md §4.3).
//!
//! Order of operations matters: the upstream handshake is completed first
//! so the leaf certificate minted for the client can mirror what the real
//! origin offered (in practice here: which ALPN protocol it picked), then
//! the downstream handshake completes using that same ALPN list. Reversing
//! the order would force a guess at what the client's intended destination
//! actually supports.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};

use crate::ca::CertificateAuthority;
use crate::context::LayerContext;
use crate::error::{ProxyError, Result};

use super::{Layer, LayerKind};

/// Bytes of a TLS record header plus handshake header sniffed up front;
/// a ClientHello carrying SNI and several ALPN entries comfortably fits
/// in typical MTU-sized first segments, but the read is bounded so a
/// pathological client can't force unbounded buffering.
const CLIENT_HELLO_PEEK_LIMIT: usize = 16 * 1024;

pub struct TlsLayer {
    ca: Arc<CertificateAuthority>,
}

impl TlsLayer {
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self { ca }
    }
}

#[async_trait]
impl Layer for TlsLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Tls
    }

    async fn process_and_return_context(self: Box<Self>, mut ctx: LayerContext) -> Result<LayerContext> {
        let peeked = ctx.src_stream.peek(CLIENT_HELLO_PEEK_LIMIT).await?;
        let hello = parse_client_hello(&peeked)
            .ok_or_else(|| ProxyError::Protocol("malformed ClientHello".into()))?;

        let sni = hello.sni.clone().unwrap_or_else(|| ctx.host.clone());
        let offered_alpn = hello.alpn.clone();

        let dest_stream = ctx
            .dest_stream
            .take()
            .ok_or_else(|| ProxyError::DestNotConnected("no upstream connection".into()))?;

        let client_config = upstream_client_config(&offered_alpn);
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|_| ProxyError::Tls("invalid SNI for upstream handshake".into()))?
            .to_owned();
        let upstream_tls = dest_stream.start_tls_client(client_config, server_name).await?;

        let negotiated_alpn = upstream_tls.alpn_protocol();
        let downstream_alpn: Vec<Vec<u8>> = match &negotiated_alpn {
            Some(p) => vec![p.clone()],
            None => offered_alpn.clone(),
        };

        let server_config = self.ca.server_config_for(&sni, &downstream_alpn)?;

        // Partial move: `ctx` is owned locally, so taking `src_stream` out
        // and writing it back below is legal even though other fields of
        // `ctx` stay live throughout.
        let client_stream = ctx.src_stream;
        let downstream_tls = client_stream.start_tls_server(server_config).await?;

        ctx.src_stream = downstream_tls;
        ctx.dest_stream = Some(upstream_tls);
        ctx.host = sni;
        ctx.scheme = Some(match negotiated_alpn.as_deref() {
            Some(b"h2") => "h2".to_string(),
            _ => "https".to_string(),
        });

        Ok(ctx)
    }
}

fn upstream_client_config(alpn: &[Vec<u8>]) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    config.alpn_protocols = alpn.to_vec();
    Arc::new(config)
}

/// A MITM proxy stands between the client and whatever certificate the
/// real origin presents; rejecting it here would just turn an interception
/// failure into a silent connection drop instead of a visible one further
/// up the pipeline, so upstream certificate validation is intentionally
/// not performed (spec.md §9 Non-goals: certificate pinning/validation
/// policy is out of scope).
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

struct ClientHelloInfo {
    sni: Option<String>,
    alpn: Vec<Vec<u8>>,
}

/// Extracts SNI and ALPN from a single TLS record carrying (at least the
/// start of) a ClientHello. Returns `None` if the bytes don't look like a
/// TLS handshake record at all; a ClientHello whose extensions are simply
/// absent still parses, just with empty `alpn` and `sni: None`.
fn parse_client_hello(buf: &[u8]) -> Option<ClientHelloInfo> {
    // TLS record header: type(1) version(2) length(2).
    if buf.len() < 5 || buf[0] != 0x16 {
        return None;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let record_end = (5 + record_len).min(buf.len());
    let record = &buf[5..record_end];

    // Handshake header: msg_type(1) length(3).
    if record.len() < 4 || record[0] != 0x01 {
        return None;
    }
    let hs_len = u32::from_be_bytes([0, record[1], record[2], record[3]]) as usize;
    let hs_end = (4 + hs_len).min(record.len());
    let body = &record[4..hs_end];

    let mut pos = 0usize;
    // client_version(2) + random(32)
    pos += 2 + 32;
    if pos >= body.len() {
        return None;
    }
    // session_id
    let session_id_len = *body.get(pos)? as usize;
    pos += 1 + session_id_len;
    // cipher_suites
    let cipher_len = u16::from_be_bytes([*body.get(pos)?, *body.get(pos + 1)?]) as usize;
    pos += 2 + cipher_len;
    // compression_methods
    let comp_len = *body.get(pos)? as usize;
    pos += 1 + comp_len;

    let mut info = ClientHelloInfo {
        sni: None,
        alpn: Vec::new(),
    };
    if pos + 2 > body.len() {
        return Some(info);
    }
    let ext_total = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    let ext_end = (pos + ext_total).min(body.len());

    while pos + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        let ext_data_start = pos + 4;
        let ext_data_end = (ext_data_start + ext_len).min(body.len());
        let ext_data = &body[ext_data_start..ext_data_end];

        match ext_type {
            0x0000 => info.sni = parse_sni_extension(ext_data),
            0x0010 => info.alpn = parse_alpn_extension(ext_data),
            _ => {}
        }
        pos = ext_data_end;
    }

    Some(info)
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    // server_name_list length(2), then entries of type(1) len(2) name(len).
    if data.len() < 2 {
        return None;
    }
    let mut pos = 2usize;
    while pos + 3 <= data.len() {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        let name_start = pos + 3;
        let name_end = (name_start + name_len).min(data.len());
        if name_type == 0x00 {
            return Some(String::from_utf8_lossy(&data[name_start..name_end]).to_string());
        }
        pos = name_end;
    }
    None
}

fn parse_alpn_extension(data: &[u8]) -> Vec<Vec<u8>> {
    // protocol_name_list length(2), then entries of len(1) name(len).
    let mut protocols = Vec::new();
    if data.len() < 2 {
        return protocols;
    }
    let mut pos = 2usize;
    while pos < data.len() {
        let len = data[pos] as usize;
        let start = pos + 1;
        let end = (start + len).min(data.len());
        if start > data.len() {
            break;
        }
        protocols.push(data[start..end].to_vec());
        pos = end;
    }
    protocols
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client_hello(sni: &str, alpn: &[&str]) -> Vec<u8> {
        let mut exts = Vec::new();

        // SNI extension.
        let mut sni_entry = vec![0x00];
        sni_entry.extend_from_slice(&(sni.len() as u16).to_be_bytes());
        sni_entry.extend_from_slice(sni.as_bytes());
        let mut sni_list = (sni_entry.len() as u16).to_be_bytes().to_vec();
        sni_list.extend_from_slice(&sni_entry);
        exts.extend_from_slice(&0x0000u16.to_be_bytes());
        exts.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni_list);

        // ALPN extension.
        let mut alpn_entries = Vec::new();
        for p in alpn {
            alpn_entries.push(p.len() as u8);
            alpn_entries.extend_from_slice(p.as_bytes());
        }
        let mut alpn_list = (alpn_entries.len() as u16).to_be_bytes().to_vec();
        alpn_list.extend_from_slice(&alpn_entries);
        exts.extend_from_slice(&0x0010u16.to_be_bytes());
        exts.extend_from_slice(&(alpn_list.len() as u16).to_be_bytes());
        exts.extend_from_slice(&alpn_list);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // session id len
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]); // one cipher suite
        body.push(1);
        body.push(0); // one compression method
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&[0, 0, 0]);
        let hs_len = body.len() as u32;
        handshake[1..4].copy_from_slice(&hs_len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_and_alpn() {
        let raw = build_client_hello("example.com", &["h2", "http/1.1"]);
        let hello = parse_client_hello(&raw).unwrap();
        assert_eq!(hello.sni.as_deref(), Some("example.com"));
        assert_eq!(hello.alpn, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn non_handshake_record_returns_none() {
        let raw = [0x17, 0x03, 0x03, 0x00, 0x01, 0x00];
        assert!(parse_client_hello(&raw).is_none());
    }
}
