//! SCRAM-SHA-256 (RFC 5802/7677), the one SASL mechanism this crate
//! negotiates. `SCRAM-SHA-256-PLUS` (channel binding) is not supported, as
//! this crate does not expose the TLS layer's channel-binding data.
//!
//! Grounded on `sqlx-postgres::connection::establish.rs`'s call out to a
//! `sasl::authenticate()` helper; the SCRAM math itself has no analogue in
//! the retrieved source and is implemented directly from RFC 5802 using
//! crates already depended on for it (`hmac`, `sha2`, `base64`,
//! `stringprep`, `rand`).

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{err_protocol, PgError};

type HmacSha256 = Hmac<Sha256>;

const B64: base64::engine::general_purpose::GeneralPurpose = base64::engine::general_purpose::STANDARD;

pub struct ScramClient {
    client_nonce: String,
    client_first_bare: String,
    password: String,
}

pub struct ScramContinuation {
    pub client_final_message: Vec<u8>,
    server_signature: Vec<u8>,
}

impl ScramClient {
    pub fn new(password: &str) -> ScramClient {
        let client_nonce = generate_nonce();
        let client_first_bare = format!("n=,r={client_nonce}");
        let password = stringprep::saslprep(password)
            .map(|s| s.into_owned())
            .unwrap_or_else(|_| password.to_string());

        ScramClient {
            client_nonce,
            client_first_bare,
            password,
        }
    }

    /// The `SASLInitialResponse` payload: GS2 header (`n,,`, no channel
    /// binding, no authzid) plus the client-first-message-bare.
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Process the server's `AuthenticationSASLContinue` payload and
    /// produce the `SASLResponse` payload plus the expected server
    /// signature to verify against `AuthenticationSASLFinal`.
    pub fn process_server_first(&self, server_first: &[u8]) -> Result<ScramContinuation, PgError> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| err_protocol!("SCRAM server-first-message was not valid utf8"))?;

        let mut nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v);
            } else if let Some(v) = part.strip_prefix("s=") {
                salt_b64 = Some(v);
            } else if let Some(v) = part.strip_prefix("i=") {
                iterations = v.parse::<u32>().ok();
            }
        }

        let combined_nonce =
            nonce.ok_or_else(|| err_protocol!("SCRAM server-first-message missing nonce"))?;
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(err_protocol!(
                "SCRAM server-first-message nonce does not extend the client nonce"
            ));
        }
        let salt = B64
            .decode(salt_b64.ok_or_else(|| err_protocol!("SCRAM server-first-message missing salt"))?)
            .map_err(|_| err_protocol!("SCRAM salt was not valid base64"))?;
        let iterations =
            iterations.ok_or_else(|| err_protocol!("SCRAM server-first-message missing iteration count"))?;

        let salted_password = hi(self.password.as_bytes(), &salt, iterations);

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(&client_key);

        let channel_binding = B64.encode("n,,");
        let client_final_without_proof = format!("c={channel_binding},r={combined_nonce}");

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        let client_final_message = format!(
            "{client_final_without_proof},p={}",
            B64.encode(client_proof)
        )
        .into_bytes();

        Ok(ScramContinuation {
            client_final_message,
            server_signature,
        })
    }
}

impl ScramContinuation {
    /// Verify the server's final signature from `AuthenticationSASLFinal`'s
    /// `v=<base64>` payload. A mismatch means the server does not know the
    /// password-derived secret and the connection must be aborted -- this
    /// is what protects against a server impersonation attack.
    pub fn verify_server_final(&self, server_final: &[u8]) -> Result<(), PgError> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|_| err_protocol!("SCRAM server-final-message was not valid utf8"))?;
        let v = server_final
            .strip_prefix("v=")
            .ok_or_else(|| err_protocol!("SCRAM server-final-message missing signature"))?;
        let signature = B64
            .decode(v.trim_end())
            .map_err(|_| err_protocol!("SCRAM server signature was not valid base64"))?;

        if signature != self.server_signature {
            return Err(err_protocol!(
                "SCRAM server signature verification failed; possible MITM"
            ));
        }
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// `Hi(password, salt, iterations)` per RFC 5802 §2.2: PBKDF2 with HMAC-SHA-256,
/// one block (SHA-256's output is exactly the needed 32 bytes).
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut salt_block = salt.to_vec();
    salt_block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac(password, &salt_block);
    let mut result = u.clone();

    for _ in 1..iterations {
        u = hmac(password, &u);
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }

    result
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 18] = rng.gen();
    B64.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_first_message_has_gs2_header() {
        let client = ScramClient::new("password");
        let msg = client.client_first_message();
        assert!(msg.starts_with(b"n,,n="));
    }

    #[test]
    fn rejects_non_extending_nonce() {
        let client = ScramClient::new("password");
        let server_first = b"r=not-the-client-nonce,s=c2FsdA==,i=4096";
        assert!(client.process_server_first(server_first).is_err());
    }

    #[test]
    fn hi_is_deterministic() {
        let a = hi(b"pencil", b"salt", 4096);
        let b = hi(b"pencil", b"salt", 4096);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
