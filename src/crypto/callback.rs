//! WeCom callback verification and message crypto.
//!
//! Implements the platform's published callback scheme:
//! - signature = SHA1 over the lexicographically sorted concatenation of
//!   {token, timestamp, nonce, ciphertext}
//! - payload = AES-256-CBC over `random(16) | msg_len(u32 BE) | msg | receive_id`,
//!   key = Base64_Decode(EncodingAESKey + "="), IV = first 16 key bytes,
//!   padded PKCS#7-style to 32-byte blocks
//!
//! The signature gate runs before any decryption so forged traffic is
//! rejected without touching the cipher.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD as BASE64};
use base64::{alphabet, Engine};
use rand::RngCore;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Decoder for the EncodingAESKey. The platform's reference decoders
/// zero-mask non-canonical trailing bits in the final symbol instead of
/// rejecting them, so a strict decode would refuse most real keys.
const KEY_DECODER: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Required length of the base64-ish EncodingAESKey (decodes to 32 bytes)
pub const ENCODING_AES_KEY_LEN: usize = 43;

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;
const RANDOM_PREFIX_LEN: usize = 16;
const PAD_BLOCK: usize = 32;

/// Callback crypto errors
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("EncodingAESKey must be {ENCODING_AES_KEY_LEN} characters decoding to {AES_KEY_LEN} bytes")]
    InvalidAesKey,

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("Receiver id does not match the configured corp id")]
    TenantMismatch,

    #[error("Payload decryption failed")]
    DecryptFailed,

    #[error("Payload encryption failed")]
    EncryptFailed,

    #[error("Malformed message payload: {0}")]
    Parse(String),
}

/// Result type for callback crypto operations
pub type CallbackResult<T> = Result<T, CallbackError>;

/// Structured fields extracted from a decrypted callback message
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CallbackMessage {
    pub from_user: String,
    pub to_user: String,
    pub msg_type: String,
    pub content: String,
    pub pic_url: String,
    pub msg_id: String,
    pub agent_id: String,
    pub create_time: String,
}

/// Per-configuration callback crypto context.
///
/// Constructed per request from the stored token, key material, and corp id;
/// holds no mutable state and is safe to drop after one exchange.
pub struct CallbackCrypto {
    token: String,
    corp_id: String,
    key: [u8; AES_KEY_LEN],
}

/// Check that an EncodingAESKey is well-formed without building a context.
pub fn validate_encoding_key(encoding_aes_key: &str) -> CallbackResult<()> {
    decode_aes_key(encoding_aes_key).map(|_| ())
}

fn decode_aes_key(encoding_aes_key: &str) -> CallbackResult<[u8; AES_KEY_LEN]> {
    if encoding_aes_key.len() != ENCODING_AES_KEY_LEN {
        return Err(CallbackError::InvalidAesKey);
    }
    let bytes = KEY_DECODER
        .decode(format!("{encoding_aes_key}="))
        .map_err(|_| CallbackError::InvalidAesKey)?;
    let mut key = [0u8; AES_KEY_LEN];
    if bytes.len() != AES_KEY_LEN {
        return Err(CallbackError::InvalidAesKey);
    }
    key.copy_from_slice(&bytes);
    Ok(key)
}

impl CallbackCrypto {
    pub fn new(token: &str, encoding_aes_key: &str, corp_id: &str) -> CallbackResult<Self> {
        Ok(Self {
            token: token.to_string(),
            corp_id: corp_id.to_string(),
            key: decode_aes_key(encoding_aes_key)?,
        })
    }

    /// Compute the callback signature over sorted parameters.
    pub fn signature(&self, timestamp: &str, nonce: &str, data: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, data];
        parts.sort_unstable();
        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn check_signature(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        data: &str,
    ) -> CallbackResult<()> {
        if self.signature(timestamp, nonce, data) != msg_signature {
            return Err(CallbackError::SignatureMismatch);
        }
        Ok(())
    }

    /// URL verification handshake: authenticate and decrypt the echo string.
    ///
    /// The returned plaintext must be echoed back to the platform verbatim.
    pub fn verify_url(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        echostr: &str,
    ) -> CallbackResult<String> {
        self.check_signature(msg_signature, timestamp, nonce, echostr)?;
        self.decrypt(echostr)
    }

    /// Authenticate and decrypt an inbound message body.
    pub fn decrypt_msg(
        &self,
        msg_signature: &str,
        timestamp: &str,
        nonce: &str,
        ciphertext: &str,
    ) -> CallbackResult<String> {
        self.check_signature(msg_signature, timestamp, nonce, ciphertext)?;
        self.decrypt(ciphertext)
    }

    /// Encrypt and sign an outbound payload (reply or verification echo).
    pub fn encrypt_msg(
        &self,
        plaintext: &str,
        timestamp: &str,
        nonce: &str,
    ) -> CallbackResult<(String, String)> {
        let ciphertext = self.encrypt(plaintext)?;
        let signature = self.signature(timestamp, nonce, &ciphertext);
        Ok((ciphertext, signature))
    }

    /// Encrypt a plaintext into the platform's base64 envelope.
    pub fn encrypt(&self, plaintext: &str) -> CallbackResult<String> {
        let msg = plaintext.as_bytes();
        let msg_len = u32::try_from(msg.len()).map_err(|_| CallbackError::EncryptFailed)?;

        let mut buf =
            Vec::with_capacity(RANDOM_PREFIX_LEN + 4 + msg.len() + self.corp_id.len() + PAD_BLOCK);
        let mut random = [0u8; RANDOM_PREFIX_LEN];
        rand::rngs::OsRng.fill_bytes(&mut random);
        buf.extend_from_slice(&random);
        buf.extend_from_slice(&msg_len.to_be_bytes());
        buf.extend_from_slice(msg);
        buf.extend_from_slice(self.corp_id.as_bytes());

        // PKCS#7 over 32-byte blocks, per the spec (always at least one pad byte)
        let pad = PAD_BLOCK - (buf.len() % PAD_BLOCK);
        buf.extend(std::iter::repeat(pad as u8).take(pad));

        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..AES_IV_LEN])
            .map_err(|_| CallbackError::EncryptFailed)?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&buf);

        Ok(BASE64.encode(ciphertext))
    }

    /// Decrypt a base64 envelope and unwrap the embedded payload.
    fn decrypt(&self, ciphertext_b64: &str) -> CallbackResult<String> {
        let ciphertext = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| CallbackError::DecryptFailed)?;
        if ciphertext.is_empty() || ciphertext.len() % AES_IV_LEN != 0 {
            return Err(CallbackError::DecryptFailed);
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.key[..AES_IV_LEN])
            .map_err(|_| CallbackError::DecryptFailed)?;
        let padded = cipher
            .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
            .map_err(|_| CallbackError::DecryptFailed)?;

        // Strip the 32-block PKCS#7 pad
        let pad = *padded.last().ok_or(CallbackError::DecryptFailed)? as usize;
        if pad == 0 || pad > PAD_BLOCK || pad >= padded.len() {
            return Err(CallbackError::DecryptFailed);
        }
        let content = &padded[..padded.len() - pad];

        if content.len() < RANDOM_PREFIX_LEN + 4 {
            return Err(CallbackError::DecryptFailed);
        }
        let msg_len = u32::from_be_bytes(
            content[RANDOM_PREFIX_LEN..RANDOM_PREFIX_LEN + 4]
                .try_into()
                .expect("slice is 4 bytes"),
        ) as usize;

        let msg_start = RANDOM_PREFIX_LEN + 4;
        let msg_end = msg_start
            .checked_add(msg_len)
            .ok_or(CallbackError::DecryptFailed)?;
        // Length prefix must match what the buffer actually holds
        if msg_end > content.len() {
            return Err(CallbackError::DecryptFailed);
        }

        let receiver = &content[msg_end..];
        if receiver != self.corp_id.as_bytes() {
            return Err(CallbackError::TenantMismatch);
        }

        String::from_utf8(content[msg_start..msg_end].to_vec())
            .map_err(|_| CallbackError::DecryptFailed)
    }

    /// Extract structured fields from a decrypted XML message.
    ///
    /// Missing fields come back as empty strings; only unreadable XML is an
    /// error.
    pub fn parse_message(xml: &str) -> CallbackResult<CallbackMessage> {
        use quick_xml::events::Event;
        use quick_xml::Reader;

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut message = CallbackMessage::default();
        let mut current: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let name = e.local_name();
                    current = Some(String::from_utf8_lossy(name.as_ref()).into_owned());
                }
                Ok(Event::End(_)) => current = None,
                Ok(Event::Text(e)) => {
                    let value = e.unescape().unwrap_or_default().into_owned();
                    Self::assign_field(&mut message, current.as_deref(), value);
                }
                Ok(Event::CData(e)) => {
                    let value = String::from_utf8_lossy(&e.into_inner()).into_owned();
                    Self::assign_field(&mut message, current.as_deref(), value);
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(CallbackError::Parse(format!("XML parse error: {e}"))),
                _ => {}
            }
        }

        Ok(message)
    }

    fn assign_field(message: &mut CallbackMessage, field: Option<&str>, value: String) {
        match field {
            Some("FromUserName") => message.from_user = value,
            Some("ToUserName") => message.to_user = value,
            Some("MsgType") => message.msg_type = value,
            Some("Content") => message.content = value,
            Some("PicUrl") => message.pic_url = value,
            Some("MsgId") => message.msg_id = value,
            Some("AgentID") => message.agent_id = value,
            Some("CreateTime") => message.create_time = value,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "QDG6eK";
    const CORP_ID: &str = "wx5823bf96d3bd56c7";
    const AES_KEY: &str = "jWmYm7qr5nMoAUwZRjGtBxmz3KA1tkAj3ykkR6q2B2C";

    fn crypto() -> CallbackCrypto {
        CallbackCrypto::new(TOKEN, AES_KEY, CORP_ID).unwrap()
    }

    #[test]
    fn test_key_decode_accepts_noncanonical_trailing_bits() {
        // The reference key ends in 'C', whose trailing bits are non-zero;
        // Node's Buffer.from(key + '=', 'base64') accepts it and so must we
        let key = decode_aes_key(AES_KEY).unwrap();
        assert_eq!(key.len(), AES_KEY_LEN);
        // Strict decoding would have rejected it outright
        assert!(BASE64.decode(format!("{AES_KEY}=")).is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_encoding_key(AES_KEY).is_ok());
        assert!(matches!(
            validate_encoding_key("too-short"),
            Err(CallbackError::InvalidAesKey)
        ));
        // Right length, invalid base64 alphabet
        assert!(matches!(
            validate_encoding_key(&"!".repeat(ENCODING_AES_KEY_LEN)),
            Err(CallbackError::InvalidAesKey)
        ));
    }

    #[test]
    fn test_verify_url_roundtrip() {
        let crypto = crypto();
        let echo = "1616140317555161061";
        let (echostr, signature) = crypto.encrypt_msg(echo, "1409659813", "1372623149").unwrap();

        let decrypted = crypto
            .verify_url(&signature, "1409659813", "1372623149", &echostr)
            .unwrap();
        assert_eq!(decrypted, echo);
    }

    #[test]
    fn test_decrypt_msg_roundtrip() {
        let crypto = crypto();
        let xml = "<xml><ToUserName><![CDATA[wx5823bf96d3bd56c7]]></ToUserName><Content><![CDATA[hello]]></Content></xml>";
        let (ciphertext, signature) = crypto.encrypt_msg(xml, "1409659813", "1372623149").unwrap();

        let decrypted = crypto
            .decrypt_msg(&signature, "1409659813", "1372623149", &ciphertext)
            .unwrap();
        assert_eq!(decrypted, xml);
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let crypto = crypto();
        let (echostr, signature) = crypto.encrypt_msg("echo", "1409659813", "1372623149").unwrap();

        // Flip one character of the signature
        let mut tampered = signature.clone().into_bytes();
        tampered[0] = if tampered[0] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(tampered).unwrap();

        assert!(matches!(
            crypto.verify_url(&tampered, "1409659813", "1372623149", &echostr),
            Err(CallbackError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_tampered_timestamp_and_nonce_rejected() {
        let crypto = crypto();
        let (echostr, signature) = crypto.encrypt_msg("echo", "1409659813", "1372623149").unwrap();

        assert!(matches!(
            crypto.verify_url(&signature, "1409659814", "1372623149", &echostr),
            Err(CallbackError::SignatureMismatch)
        ));
        assert!(matches!(
            crypto.verify_url(&signature, "1409659813", "1372623140", &echostr),
            Err(CallbackError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_tenant_mismatch() {
        // Valid signature and key, but payload carries a different receiver id
        let sender = CallbackCrypto::new(TOKEN, AES_KEY, "other-corp").unwrap();
        let receiver = crypto();

        let (ciphertext, signature) = sender
            .encrypt_msg("payload", "1409659813", "1372623149")
            .unwrap();
        assert!(matches!(
            receiver.decrypt_msg(&signature, "1409659813", "1372623149", &ciphertext),
            Err(CallbackError::TenantMismatch)
        ));
    }

    #[test]
    fn test_garbage_ciphertext_rejected() {
        let crypto = crypto();
        let garbage = BASE64.encode([0u8; 48]);
        let signature = crypto.signature("1409659813", "1372623149", &garbage);
        assert!(crypto
            .decrypt_msg(&signature, "1409659813", "1372623149", &garbage)
            .is_err());

        // Not even base64
        let signature = crypto.signature("1409659813", "1372623149", "%%%");
        assert!(matches!(
            crypto.decrypt_msg(&signature, "1409659813", "1372623149", "%%%"),
            Err(CallbackError::DecryptFailed)
        ));
    }

    #[test]
    fn test_signature_is_order_independent_sorted() {
        // The sorted-concatenation rule: identical parameter sets always hash
        // identically regardless of which slot the values arrive in
        let crypto = crypto();
        let a = crypto.signature("b", "a", "c");
        let b = crypto.signature("a", "b", "c");
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_message_full() {
        let xml = r#"<xml>
            <ToUserName><![CDATA[wx5823bf96d3bd56c7]]></ToUserName>
            <FromUserName><![CDATA[zhangsan]]></FromUserName>
            <CreateTime>1409659813</CreateTime>
            <MsgType><![CDATA[text]]></MsgType>
            <Content><![CDATA[CPU high]]></Content>
            <MsgId>4561255354251345929</MsgId>
            <AgentID>1000002</AgentID>
        </xml>"#;

        let message = CallbackCrypto::parse_message(xml).unwrap();
        assert_eq!(message.to_user, "wx5823bf96d3bd56c7");
        assert_eq!(message.from_user, "zhangsan");
        assert_eq!(message.msg_type, "text");
        assert_eq!(message.content, "CPU high");
        assert_eq!(message.msg_id, "4561255354251345929");
        assert_eq!(message.agent_id, "1000002");
        assert_eq!(message.create_time, "1409659813");
        assert_eq!(message.pic_url, "");
    }

    #[test]
    fn test_parse_message_missing_fields_default_empty() {
        let xml = "<xml><MsgType><![CDATA[image]]></MsgType><PicUrl><![CDATA[http://example.com/p.jpg]]></PicUrl></xml>";
        let message = CallbackCrypto::parse_message(xml).unwrap();
        assert_eq!(message.msg_type, "image");
        assert_eq!(message.pic_url, "http://example.com/p.jpg");
        assert_eq!(message.from_user, "");
        assert_eq!(message.content, "");
    }

    #[test]
    fn test_parse_message_malformed() {
        assert!(CallbackCrypto::parse_message("<xml><unclosed></xml>").is_err());
    }
}
