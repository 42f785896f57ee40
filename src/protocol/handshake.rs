//! Camouflage handshake messages
//!
//! The client speaks just enough TLS 1.2 to look like a browser resuming a
//! session: a ClientHello whose session-ticket extension is the covert
//! ticket, then after the server's three records a ChangeCipherSpec and an
//! opaque "encrypted" Finished.

use super::record::{encode_record, ContentType};
use super::ticket::{seal_ticket, TicketContents};
use super::{ProtocolError, RECORD_HEADER_LEN, TLS10_VERSION, TLS12_VERSION};
use crate::crypto::{random_bytes, PublicKey, Uid};
use crate::obfuscation::{ext, BrowserProfile};
use bytes::{BufMut, BytesMut};

const CLIENT_HELLO: u8 = 1;
const SESSION_ID_LEN: usize = 32;

/// Length of the opaque Finished body in the client reply
pub const REPLY_FINISHED_LEN: usize = 40;

/// Inputs for one ClientHello
#[derive(Debug, Clone)]
pub struct HandshakeParams<'a> {
    pub uid: &'a Uid,
    pub server_public: &'a PublicKey,
    pub session_id: u32,
    pub ticket_time_hint: u64,
    pub server_name: &'a str,
    pub profile: BrowserProfile,
    pub unix_time: u64,
}

/// Compose the ClientHello record that opens every pooled connection
pub fn compose_init_handshake(params: &HandshakeParams<'_>) -> Result<Vec<u8>, ProtocolError> {
    let sealed = seal_ticket(
        &TicketContents {
            uid: params.uid.clone(),
            session_id: params.session_id,
            ticket_time_hint: params.ticket_time_hint,
            unix_time: params.unix_time,
        },
        params.server_public,
    )?;

    let mut session_id = [0u8; SESSION_ID_LEN];
    random_bytes(&mut session_id);

    let mut body = BytesMut::with_capacity(512);
    body.put_u8(CLIENT_HELLO);
    let length_pos = body.len();
    body.put_slice(&[0, 0, 0]);

    body.put_u16(TLS12_VERSION);
    body.put_slice(&sealed.tag);
    body.put_u8(SESSION_ID_LEN as u8);
    body.put_slice(&session_id);

    let suites = params.profile.cipher_suites();
    body.put_u16((suites.len() * 2) as u16);
    for suite in suites {
        body.put_u16(*suite);
    }

    // null compression only
    body.put_u8(1);
    body.put_u8(0);

    let extensions = build_extensions(params, &sealed.ticket);
    body.put_u16(extensions.len() as u16);
    body.put_slice(&extensions);

    let total_len = body.len() - 4;
    body[length_pos] = (total_len >> 16) as u8;
    body[length_pos + 1] = (total_len >> 8) as u8;
    body[length_pos + 2] = total_len as u8;

    Ok(encode_record(ContentType::Handshake, TLS10_VERSION, &body))
}

fn build_extensions(params: &HandshakeParams<'_>, ticket: &[u8]) -> Vec<u8> {
    let profile = params.profile;
    let mut buf = BytesMut::with_capacity(512);

    for &id in profile.extension_order() {
        let mut data = BytesMut::new();
        match id {
            ext::SERVER_NAME => {
                let name = params.server_name.as_bytes();
                data.put_u16((name.len() + 3) as u16);
                data.put_u8(0); // host_name
                data.put_u16(name.len() as u16);
                data.put_slice(name);
            }
            ext::STATUS_REQUEST => {
                data.put_u8(1); // ocsp
                data.put_u16(0);
                data.put_u16(0);
            }
            ext::SUPPORTED_GROUPS => {
                let groups = profile.supported_groups();
                data.put_u16((groups.len() * 2) as u16);
                for group in groups {
                    data.put_u16(*group);
                }
            }
            ext::EC_POINT_FORMATS => {
                data.put_u8(1);
                data.put_u8(0); // uncompressed
            }
            ext::SIGNATURE_ALGORITHMS => {
                let algs = profile.signature_algorithms();
                data.put_u16((algs.len() * 2) as u16);
                for alg in algs {
                    data.put_u16(*alg);
                }
            }
            ext::ALPN => {
                let protos = profile.alpn_protocols();
                let list_len: usize = protos.iter().map(|p| p.len() + 1).sum();
                data.put_u16(list_len as u16);
                for proto in protos {
                    data.put_u8(proto.len() as u8);
                    data.put_slice(proto);
                }
            }
            ext::SESSION_TICKET => data.put_slice(ticket),
            ext::RENEGOTIATION_INFO => data.put_u8(0),
            // extended master secret, SCT: empty body
            _ => {}
        }
        buf.put_u16(id);
        buf.put_u16(data.len() as u16);
        buf.put_slice(&data);
    }

    buf.to_vec()
}

/// Compose the client's second flight: ChangeCipherSpec plus an opaque
/// Finished record
pub fn compose_reply() -> Vec<u8> {
    let mut finished = [0u8; REPLY_FINISHED_LEN];
    random_bytes(&mut finished);

    let mut out = encode_record(ContentType::ChangeCipherSpec, TLS12_VERSION, &[1]);
    out.extend_from_slice(&encode_record(
        ContentType::Handshake,
        TLS12_VERSION,
        &finished,
    ));
    out
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], ProtocolError> {
    if buf.len() < n {
        return Err(ProtocolError::HandshakeFailed(
            "truncated ClientHello".into(),
        ));
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<usize, ProtocolError> {
    Ok(take(buf, 1)?[0] as usize)
}

fn take_u16(buf: &mut &[u8]) -> Result<usize, ProtocolError> {
    let b = take(buf, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]) as usize)
}

/// Extract the random field and session-ticket extension from a
/// ClientHello record
pub(super) fn client_hello_parts(record: &[u8]) -> Result<([u8; 32], &[u8]), ProtocolError> {
    let mut buf = record;
    let header = take(&mut buf, RECORD_HEADER_LEN)?;
    if header[0] != ContentType::Handshake as u8 {
        return Err(ProtocolError::UnexpectedRecord(header[0]));
    }
    if take_u8(&mut buf)? != CLIENT_HELLO as usize {
        return Err(ProtocolError::HandshakeFailed("not a ClientHello".into()));
    }
    take(&mut buf, 3)?;
    take(&mut buf, 2)?;

    let mut random = [0u8; 32];
    random.copy_from_slice(take(&mut buf, 32)?);

    let sid_len = take_u8(&mut buf)?;
    take(&mut buf, sid_len)?;
    let suites_len = take_u16(&mut buf)?;
    take(&mut buf, suites_len)?;
    let compression_len = take_u8(&mut buf)?;
    take(&mut buf, compression_len)?;

    let ext_len = take_u16(&mut buf)?;
    let mut exts = take(&mut buf, ext_len)?;
    while !exts.is_empty() {
        let id = take_u16(&mut exts)? as u16;
        let len = take_u16(&mut exts)?;
        let data = take(&mut exts, len)?;
        if id == ext::SESSION_TICKET {
            return Ok((random, data));
        }
    }

    Err(ProtocolError::HandshakeFailed(
        "ClientHello has no session ticket".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ServerKeyPair;
    use crate::protocol::{open_ticket, TICKET_LEN};

    fn hello(profile: BrowserProfile, server: &ServerKeyPair, uid: &Uid) -> Vec<u8> {
        compose_init_handshake(&HandshakeParams {
            uid,
            server_public: &server.public,
            session_id: 4242,
            ticket_time_hint: 3600,
            server_name: "www.bing.com",
            profile,
            unix_time: 1_700_000_000,
        })
        .unwrap()
    }

    #[test]
    fn test_client_hello_shape() {
        let server = ServerKeyPair::generate();
        let uid = Uid::from_bytes(&[3u8; 16]).unwrap();
        let record = hello(BrowserProfile::Chrome, &server, &uid);

        assert_eq!(&record[..3], &[0x16, 0x03, 0x01]);
        let len = u16::from_be_bytes([record[3], record[4]]) as usize;
        assert_eq!(record.len(), RECORD_HEADER_LEN + len);
        assert_eq!(record[5], CLIENT_HELLO);
        assert_eq!(&record[9..11], &[0x03, 0x03]);
        assert!(record.windows(12).any(|w| w == b"www.bing.com"));
    }

    #[test]
    fn test_server_recovers_ticket() {
        let server = ServerKeyPair::generate();
        let uid = Uid::from_bytes(&[3u8; 16]).unwrap();

        for profile in [BrowserProfile::Chrome, BrowserProfile::Firefox] {
            let record = hello(profile, &server, &uid);
            let (_, ticket) = client_hello_parts(&record).unwrap();
            assert_eq!(ticket.len(), TICKET_LEN);

            let contents = open_ticket(&server, &record).unwrap();
            assert_eq!(contents.uid, uid);
            assert_eq!(contents.session_id, 4242);
            assert_eq!(contents.ticket_time_hint, 3600);
        }
    }

    #[test]
    fn test_random_differs_between_hellos() {
        let server = ServerKeyPair::generate();
        let uid = Uid::from_bytes(&[3u8; 16]).unwrap();
        let a = hello(BrowserProfile::Chrome, &server, &uid);
        let b = hello(BrowserProfile::Chrome, &server, &uid);

        let (random_a, _) = client_hello_parts(&a).unwrap();
        let (random_b, _) = client_hello_parts(&b).unwrap();
        assert_eq!(&a[11..43], &random_a[..]);
        assert_ne!(random_a, random_b);
        assert!(open_ticket(&server, &a).is_ok());
        assert!(open_ticket(&server, &b).is_ok());
    }

    #[test]
    fn test_wrong_server_rejects_ticket() {
        let server = ServerKeyPair::generate();
        let other = ServerKeyPair::generate();
        let uid = Uid::from_bytes(&[3u8; 16]).unwrap();

        let record = hello(BrowserProfile::Chrome, &server, &uid);
        assert!(open_ticket(&other, &record).is_err());
    }

    #[test]
    fn test_reply_records() {
        let reply = compose_reply();
        assert_eq!(&reply[..6], &[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        assert_eq!(&reply[6..9], &[0x16, 0x03, 0x03]);
        assert_eq!(
            u16::from_be_bytes([reply[9], reply[10]]) as usize,
            REPLY_FINISHED_LEN
        );
        assert_eq!(reply.len(), 6 + RECORD_HEADER_LEN + REPLY_FINISHED_LEN);
    }

    #[test]
    fn test_truncated_hello_rejected() {
        let server = ServerKeyPair::generate();
        let uid = Uid::from_bytes(&[3u8; 16]).unwrap();
        let record = hello(BrowserProfile::Chrome, &server, &uid);
        assert!(client_hello_parts(&record[..60]).is_err());
    }
}
