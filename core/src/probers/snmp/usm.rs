// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! SNMPv3 user security model.
//!
//! Key localization, HMAC-MD5-96 / HMAC-SHA-96 authentication, and
//! DES-CBC / AES-128-CFB privacy, plus whole-message encode/decode for
//! the v3 wire format. Engine discovery state is kept by the session in
//! `super::SnmpSession`; this module is purely computational.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use des::cipher::block_padding::NoPadding;
use des::cipher::{BlockDecryptMut, BlockEncryptMut};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;
use std::fmt;

use super::ber::{self, BerError, Pdu, Reader};
use crate::probers::credentials::{SnmpAuthProtocol, SnmpPrivProtocol};

type HmacMd5 = Hmac<Md5>;
type HmacSha1 = Hmac<Sha1>;
type DesCbcEnc = cbc::Encryptor<des::Des>;
type DesCbcDec = cbc::Decryptor<des::Des>;
type Aes128CfbEnc = cfb_mode::Encryptor<aes::Aes128>;
type Aes128CfbDec = cfb_mode::Decryptor<aes::Aes128>;

/// Truncated MAC length (HMAC-96)
const AUTH_PARAM_LEN: usize = 12;

/// Bytes of repeated password digested during key derivation
const KEY_EXPANSION_BYTES: usize = 1_048_576;

/// Advertised maximum message size
const MAX_MESSAGE_SIZE: i64 = 65_507;

/// USM security model number
const SECURITY_MODEL_USM: i64 = 3;

/// v3 processing errors
#[derive(Debug)]
pub enum UsmError {
    Ber(BerError),
    /// MAC mismatch or unverifiable message
    AuthenticationFailed,
    /// Privacy parameters or ciphertext malformed
    DecryptionFailed,
    /// Empty password, missing key, or unusable configuration
    BadConfiguration(String),
    /// The peer answered with something other than SNMPv3
    WrongVersion(i64),
}

impl fmt::Display for UsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ber(e) => write!(f, "malformed v3 message: {e}"),
            Self::AuthenticationFailed => write!(f, "message authentication failed"),
            Self::DecryptionFailed => write!(f, "message decryption failed"),
            Self::BadConfiguration(msg) => write!(f, "bad USM configuration: {msg}"),
            Self::WrongVersion(v) => write!(f, "unexpected SNMP version {v}"),
        }
    }
}

impl std::error::Error for UsmError {}

impl From<BerError> for UsmError {
    fn from(e: BerError) -> Self {
        Self::Ber(e)
    }
}

/// Localize a password to an engine (RFC 3414 A.2).
pub fn localize_key(
    protocol: SnmpAuthProtocol,
    password: &str,
    engine_id: &[u8],
) -> Result<Vec<u8>, UsmError> {
    if password.is_empty() {
        return Err(UsmError::BadConfiguration("empty password".to_string()));
    }
    Ok(match protocol {
        SnmpAuthProtocol::Md5 => localize::<Md5>(password.as_bytes(), engine_id),
        SnmpAuthProtocol::Sha => localize::<Sha1>(password.as_bytes(), engine_id),
    })
}

fn localize<D: Digest>(password: &[u8], engine_id: &[u8]) -> Vec<u8> {
    // Step 1: digest 1 MiB of the cyclically repeated password.
    let mut hasher = D::new();
    let mut produced = 0;
    let mut index = 0;
    let mut block = [0u8; 64];
    while produced < KEY_EXPANSION_BYTES {
        for byte in block.iter_mut() {
            *byte = password[index % password.len()];
            index += 1;
        }
        hasher.update(block);
        produced += block.len();
    }
    let ku = hasher.finalize();

    // Step 2: bind to the engine.
    let mut hasher = D::new();
    hasher.update(&ku);
    hasher.update(engine_id);
    hasher.update(&ku);
    hasher.finalize().to_vec()
}

fn hmac_96(
    protocol: SnmpAuthProtocol,
    key: &[u8],
    message: &[u8],
) -> Result<[u8; AUTH_PARAM_LEN], UsmError> {
    let digest = match protocol {
        SnmpAuthProtocol::Md5 => {
            let mut mac = HmacMd5::new_from_slice(key)
                .map_err(|_| UsmError::BadConfiguration("bad auth key".to_string()))?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        SnmpAuthProtocol::Sha => {
            let mut mac = HmacSha1::new_from_slice(key)
                .map_err(|_| UsmError::BadConfiguration("bad auth key".to_string()))?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
    };
    let mut out = [0u8; AUTH_PARAM_LEN];
    out.copy_from_slice(&digest[..AUTH_PARAM_LEN]);
    Ok(out)
}

/// Everything needed to build one outgoing v3 message.
pub struct V3Message<'a> {
    pub msg_id: i32,
    pub engine_id: &'a [u8],
    pub engine_boots: i64,
    pub engine_time: i64,
    pub user: &'a str,
    /// Localized authentication key.
    pub auth: Option<(SnmpAuthProtocol, &'a [u8])>,
    /// Localized privacy key (requires `auth`).
    pub privacy: Option<(SnmpPrivProtocol, &'a [u8])>,
    /// Monotone per-session salt for privacy IVs.
    pub salt: u64,
    pub reportable: bool,
    pub pdu: &'a Pdu,
}

/// Fields extracted from an incoming v3 message.
#[derive(Debug)]
pub struct V3Decoded {
    pub msg_id: i32,
    pub engine_id: Vec<u8>,
    pub engine_boots: i64,
    pub engine_time: i64,
    pub pdu: Pdu,
}

/// Encode (and authenticate/encrypt) one v3 message.
pub fn encode_message(msg: &V3Message<'_>) -> Result<Vec<u8>, UsmError> {
    if msg.privacy.is_some() && msg.auth.is_none() {
        return Err(UsmError::BadConfiguration(
            "privacy requires authentication".to_string(),
        ));
    }

    // ScopedPDU ::= SEQUENCE { contextEngineID, contextName, data }
    let mut scoped = ber::encode_octet_string(msg.engine_id);
    scoped.extend_from_slice(&ber::encode_octet_string(b""));
    scoped.extend_from_slice(&ber::encode_pdu(msg.pdu)?);
    let scoped = ber::encode_sequence(&scoped);

    let (msg_data, priv_params) = match msg.privacy {
        Some((protocol, key)) => {
            let (ciphertext, salt_bytes) = encrypt_scoped(
                protocol,
                key,
                msg.engine_boots,
                msg.engine_time,
                msg.salt,
                &scoped,
            )?;
            (ber::encode_octet_string(&ciphertext), salt_bytes)
        }
        None => (scoped, Vec::new()),
    };

    // Security parameters with a zeroed MAC placeholder.
    let auth_placeholder = [0u8; AUTH_PARAM_LEN];
    let mut inner = ber::encode_octet_string(msg.engine_id);
    inner.extend_from_slice(&ber::encode_integer(msg.engine_boots));
    inner.extend_from_slice(&ber::encode_integer(msg.engine_time));
    inner.extend_from_slice(&ber::encode_octet_string(msg.user.as_bytes()));
    let auth_value_offset_in_inner = inner.len() + 2; // tag + short length
    if msg.auth.is_some() {
        inner.extend_from_slice(&ber::encode_octet_string(&auth_placeholder));
    } else {
        inner.extend_from_slice(&ber::encode_octet_string(b""));
    }
    inner.extend_from_slice(&ber::encode_octet_string(&priv_params));
    let sec_seq = ber::encode_sequence(&inner);
    let sec_params = ber::encode_octet_string(&sec_seq);

    let mut flags = 0u8;
    if msg.auth.is_some() {
        flags |= 0x01;
    }
    if msg.privacy.is_some() {
        flags |= 0x02;
    }
    if msg.reportable {
        flags |= 0x04;
    }
    let mut global = ber::encode_integer(i64::from(msg.msg_id));
    global.extend_from_slice(&ber::encode_integer(MAX_MESSAGE_SIZE));
    global.extend_from_slice(&ber::encode_octet_string(&[flags]));
    global.extend_from_slice(&ber::encode_integer(SECURITY_MODEL_USM));
    let global = ber::encode_sequence(&global);

    let mut body = ber::encode_integer(3);
    body.extend_from_slice(&global);
    body.extend_from_slice(&sec_params);
    body.extend_from_slice(&msg_data);
    let mut message = ber::encode_sequence(&body);

    if let Some((protocol, key)) = msg.auth {
        // Locate the MAC placeholder inside the assembled message:
        // outer header + version + global data + the security-parameter
        // octet-string and sequence headers.
        let outer_header = message.len() - body.len();
        let sec_os_header = sec_params.len() - sec_seq.len();
        let sec_seq_header = sec_seq.len() - inner.len();
        let auth_offset = outer_header
            + ber::encode_integer(3).len()
            + global.len()
            + sec_os_header
            + sec_seq_header
            + auth_value_offset_in_inner;
        debug_assert_eq!(
            &message[auth_offset..auth_offset + AUTH_PARAM_LEN],
            &auth_placeholder
        );

        let mac = hmac_96(protocol, key, &message)?;
        message[auth_offset..auth_offset + AUTH_PARAM_LEN].copy_from_slice(&mac);
    }

    Ok(message)
}

/// Decode, verify and decrypt one incoming v3 message.
///
/// `auth`/`privacy` are the localized keys of the expected user; pass
/// `None` for unauthenticated discovery exchanges (reports arrive
/// unauthenticated until the engine is known).
pub fn decode_message(
    data: &[u8],
    auth: Option<(SnmpAuthProtocol, &[u8])>,
    privacy: Option<(SnmpPrivProtocol, &[u8])>,
) -> Result<V3Decoded, UsmError> {
    let mut reader = Reader::new(data);
    let mut message = reader.read_sequence()?;
    let version = message.read_integer()?;
    if version != 3 {
        return Err(UsmError::WrongVersion(version));
    }

    let mut global = message.read_sequence()?;
    let msg_id = global.read_integer()? as i32;
    let _max_size = global.read_integer()?;
    let flags = global.read_octet_string()?;
    let flag_auth = flags.first().map_or(false, |f| f & 0x01 != 0);
    let flag_priv = flags.first().map_or(false, |f| f & 0x02 != 0);
    let _model = global.read_integer()?;

    let sec_bytes = message.read_octet_string()?;
    let mut sec = Reader::new(sec_bytes).read_sequence()?;
    let engine_id = sec.read_octet_string()?.to_vec();
    let engine_boots = sec.read_integer()?;
    let engine_time = sec.read_integer()?;
    let _user = sec.read_octet_string()?;
    let auth_params = sec.read_octet_string()?;
    let priv_params = sec.read_octet_string()?;

    if flag_auth {
        let (protocol, key) = auth.ok_or(UsmError::AuthenticationFailed)?;
        if auth_params.len() != AUTH_PARAM_LEN {
            return Err(UsmError::AuthenticationFailed);
        }
        // Re-compute the MAC over the message with the MAC field zeroed.
        let offset = auth_params.as_ptr() as usize - data.as_ptr() as usize;
        let mut zeroed = data.to_vec();
        zeroed[offset..offset + AUTH_PARAM_LEN].fill(0);
        let expected = hmac_96(protocol, key, &zeroed)?;
        if expected[..] != auth_params[..] {
            return Err(UsmError::AuthenticationFailed);
        }
    }

    let scoped_bytes = if flag_priv {
        let (protocol, key) = privacy.ok_or(UsmError::DecryptionFailed)?;
        let ciphertext = message.read_octet_string()?;
        decrypt_scoped(
            protocol,
            key,
            engine_boots,
            engine_time,
            priv_params,
            ciphertext,
        )?
    } else {
        let (tag, content) = message.read_tlv()?;
        if tag != 0x30 {
            return Err(UsmError::Ber(BerError::UnexpectedTag {
                expected: 0x30,
                found: tag,
            }));
        }
        // Reassemble the sequence TLV for uniform parsing below.
        ber::encode_sequence(content)
    };

    let mut scoped = Reader::new(&scoped_bytes).read_sequence()?;
    let _context_engine = scoped.read_octet_string()?;
    let _context_name = scoped.read_octet_string()?;
    let pdu = ber::decode_pdu(&mut scoped)?;

    Ok(V3Decoded {
        msg_id,
        engine_id,
        engine_boots,
        engine_time,
        pdu,
    })
}

fn encrypt_scoped(
    protocol: SnmpPrivProtocol,
    key: &[u8],
    boots: i64,
    time: i64,
    salt: u64,
    plaintext: &[u8],
) -> Result<(Vec<u8>, Vec<u8>), UsmError> {
    match protocol {
        SnmpPrivProtocol::Des => {
            if key.len() < 16 {
                return Err(UsmError::BadConfiguration("privacy key too short".to_string()));
            }
            let des_key = &key[..8];
            let pre_iv = &key[8..16];
            let mut salt_bytes = [0u8; 8];
            salt_bytes[..4].copy_from_slice(&(boots as u32).to_be_bytes());
            salt_bytes[4..].copy_from_slice(&(salt as u32).to_be_bytes());
            let mut iv = [0u8; 8];
            for (i, b) in iv.iter_mut().enumerate() {
                *b = pre_iv[i] ^ salt_bytes[i];
            }

            let mut buf = plaintext.to_vec();
            let pad = (8 - buf.len() % 8) % 8;
            buf.extend(std::iter::repeat(0u8).take(pad));
            let len = buf.len();
            let enc = DesCbcEnc::new_from_slices(des_key, &iv)
                .map_err(|_| UsmError::BadConfiguration("bad DES key".to_string()))?;
            enc.encrypt_padded_mut::<NoPadding>(&mut buf, len)
                .map_err(|_| UsmError::DecryptionFailed)?;
            Ok((buf, salt_bytes.to_vec()))
        }
        SnmpPrivProtocol::Aes => {
            if key.len() < 16 {
                return Err(UsmError::BadConfiguration("privacy key too short".to_string()));
            }
            let salt_bytes = salt.to_be_bytes();
            let mut iv = [0u8; 16];
            iv[..4].copy_from_slice(&(boots as u32).to_be_bytes());
            iv[4..8].copy_from_slice(&(time as u32).to_be_bytes());
            iv[8..].copy_from_slice(&salt_bytes);

            let mut buf = plaintext.to_vec();
            let enc = Aes128CfbEnc::new_from_slices(&key[..16], &iv)
                .map_err(|_| UsmError::BadConfiguration("bad AES key".to_string()))?;
            enc.encrypt(&mut buf);
            Ok((buf, salt_bytes.to_vec()))
        }
    }
}

fn decrypt_scoped(
    protocol: SnmpPrivProtocol,
    key: &[u8],
    boots: i64,
    time: i64,
    priv_params: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, UsmError> {
    match protocol {
        SnmpPrivProtocol::Des => {
            if key.len() < 16 || priv_params.len() != 8 || ciphertext.len() % 8 != 0 {
                return Err(UsmError::DecryptionFailed);
            }
            let pre_iv = &key[8..16];
            let mut iv = [0u8; 8];
            for (i, b) in iv.iter_mut().enumerate() {
                *b = pre_iv[i] ^ priv_params[i];
            }
            let mut buf = ciphertext.to_vec();
            let dec = DesCbcDec::new_from_slices(&key[..8], &iv)
                .map_err(|_| UsmError::DecryptionFailed)?;
            dec.decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|_| UsmError::DecryptionFailed)?;
            Ok(buf)
        }
        SnmpPrivProtocol::Aes => {
            if key.len() < 16 || priv_params.len() != 8 {
                return Err(UsmError::DecryptionFailed);
            }
            let mut iv = [0u8; 16];
            iv[..4].copy_from_slice(&(boots as u32).to_be_bytes());
            iv[4..8].copy_from_slice(&(time as u32).to_be_bytes());
            iv[8..].copy_from_slice(priv_params);
            let mut buf = ciphertext.to_vec();
            let dec = Aes128CfbDec::new_from_slices(&key[..16], &iv)
                .map_err(|_| UsmError::DecryptionFailed)?;
            dec.decrypt(&mut buf);
            Ok(buf)
        }
    }
}

/// Build the unauthenticated discovery message that elicits a
/// `usmStatsUnknownEngineIDs` report carrying the engine parameters.
pub fn encode_discovery(msg_id: i32, request_id: i32) -> Result<Vec<u8>, UsmError> {
    let pdu = Pdu {
        pdu_type: ber::PDU_GET,
        request_id,
        error_status: 0,
        error_index: 0,
        varbinds: Vec::new(),
    };
    encode_message(&V3Message {
        msg_id,
        engine_id: b"",
        engine_boots: 0,
        engine_time: 0,
        user: "",
        auth: None,
        privacy: None,
        salt: 0,
        reportable: true,
        pdu: &pdu,
    })
}

/// Does this report PDU signal an unknown-engine discovery response?
pub fn is_unknown_engine_report(pdu: &Pdu) -> bool {
    const USM_STATS_UNKNOWN_ENGINE_IDS: [u32; 11] = [1, 3, 6, 1, 6, 3, 15, 1, 1, 4, 0];
    pdu.pdu_type == ber::PDU_REPORT
        && pdu
            .varbinds
            .iter()
            .any(|(oid, _)| oid.0 == USM_STATS_UNKNOWN_ENGINE_IDS)
}

/// Not-in-time-window reports require a resynchronized retry.
pub fn is_time_window_report(pdu: &Pdu) -> bool {
    const USM_STATS_NOT_IN_TIME_WINDOWS: [u32; 11] = [1, 3, 6, 1, 6, 3, 15, 1, 1, 2, 0];
    pdu.pdu_type == ber::PDU_REPORT
        && pdu
            .varbinds
            .iter()
            .any(|(oid, _)| oid.0 == USM_STATS_NOT_IN_TIME_WINDOWS)
}
