//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677).
//!
//! PostgreSQL ignores the SCRAM username (the startup-message user wins),
//! so the client-first-message carries an empty `n=`.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// gs2-header for "no channel binding, no authzid"; `biws` is its base64.
const GS2_HEADER: &str = "n,,";
const CHANNEL_BINDING: &str = "c=biws";

pub struct ScramClient {
    password: String,
    client_first_bare: String,

    // State captured from server-first
    combined_nonce: Option<String>,
    salted_password: Option<[u8; 32]>,
    auth_message: Option<String>,
}

impl ScramClient {
    pub fn new(password: &str) -> Self {
        // 18 random bytes encode to exactly 24 base64 characters.
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        Self::with_first_bare(password, format!("n=,r={}", BASE64.encode(raw)))
    }

    fn with_first_bare(password: &str, client_first_bare: String) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare,
            combined_nonce: None,
            salted_password: None,
            auth_message: None,
        }
    }

    fn client_nonce(&self) -> &str {
        // client_first_bare is always "n=<user>,r=<nonce>"
        self.client_first_bare
            .split_once(",r=")
            .map(|(_, nonce)| nonce)
            .unwrap_or_default()
    }

    /// Initial response payload for `SASLInitialResponse`.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{GS2_HEADER}{}", self.client_first_bare).into_bytes()
    }

    /// Consume the server-first-message and produce the client-final-message
    /// payload for `SASLResponse`.
    pub fn process_server_first(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let server_first = std::str::from_utf8(data)
            .map_err(|_| Error::Sasl("server-first-message is not UTF-8".into()))?;

        let mut combined_nonce = None;
        let mut salt = None;
        let mut iterations: Option<u32> = None;
        for attr in server_first.split(',') {
            if let Some(value) = attr.strip_prefix("r=") {
                combined_nonce = Some(value.to_string());
            } else if let Some(value) = attr.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|_| Error::Sasl("salt is not valid base64".into()))?,
                );
            } else if let Some(value) = attr.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse()
                        .map_err(|_| Error::Sasl("iteration count is not a number".into()))?,
                );
            }
        }

        let combined_nonce =
            combined_nonce.ok_or_else(|| Error::Sasl("server-first-message missing r=".into()))?;
        let salt = salt.ok_or_else(|| Error::Sasl("server-first-message missing s=".into()))?;
        let iterations =
            iterations.ok_or_else(|| Error::Sasl("server-first-message missing i=".into()))?;
        if iterations == 0 {
            return Err(Error::Sasl("iteration count must be positive".into()));
        }
        if !combined_nonce.starts_with(self.client_nonce()) {
            return Err(Error::Sasl(
                "server nonce does not extend the client nonce".into(),
            ));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|_| Error::Sasl("PBKDF2 key derivation failed".into()))?;

        let client_final_without_proof = format!("{CHANNEL_BINDING},r={combined_nonce}");
        let auth_message = format!(
            "{},{server_first},{client_final_without_proof}",
            self.client_first_bare
        );

        // ClientProof := ClientKey XOR HMAC(H(ClientKey), AuthMessage)
        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = sha256(&client_key);
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.combined_nonce = Some(combined_nonce);
        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        Ok(format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(&client_proof)
        )
        .into_bytes())
    }

    /// Verify the server-final-message signature in constant time.
    pub fn verify_server_final(&self, data: &[u8]) -> Result<()> {
        let server_final = std::str::from_utf8(data)
            .map_err(|_| Error::Sasl("server-final-message is not UTF-8".into()))?;
        if let Some(reason) = server_final.strip_prefix("e=") {
            return Err(Error::Sasl(format!("server rejected exchange: {reason}")));
        }
        let signature = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Sasl("server-final-message missing v=".into()))?;
        let signature = BASE64
            .decode(signature)
            .map_err(|_| Error::Sasl("server signature is not valid base64".into()))?;

        let salted_password = self
            .salted_password
            .ok_or_else(|| Error::Sasl("server-final before server-first".into()))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| Error::Sasl("server-final before server-first".into()))?;

        let server_key = hmac_sha256(&salted_password, b"Server Key");
        let expected = hmac_sha256(&server_key, auth_message.as_bytes());

        if expected.as_slice().ct_eq(signature.as_slice()).into() {
            Ok(())
        } else {
            Err(Error::Sasl("server signature mismatch".into()))
        }
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
