//! Secret handshake
//!
//! ```text
//! client                                          server
//!   │── hmac(N, a) ‖ a ─────────────────────────────▶│  hello
//!   │◀───────────────────────────── hmac(N, b) ‖ b ──│  hello
//!   │── box[N‖ab‖aB](sig_A ‖ A) ────────────────────▶│  client auth
//!   │◀──────────────────────── box[N‖ab‖aB‖Ab](sig_B)│  server accept
//! ```
//!
//! `a`/`b` are ephemeral x25519 keys, `A`/`B` long-term ed25519 keys
//! (converted to curve25519 for key agreement) and `N` the network key.

use crypto_secretbox::aead::{AeadInPlace, KeyInit};
use crypto_secretbox::{Key, Nonce, Tag, XSalsa20Poly1305};
use ed25519_dalek::Signature;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;
use x25519_dalek::{PublicKey as CurvePublic, StaticSecret};

use super::NetworkKey;
use crate::error::{NodeError, NodeResult};
use crate::identity::{verify_signature, Identity, IdentityRef};

type HmacSha512 = Hmac<Sha512>;

const HELLO_LEN: usize = 64;
const CLIENT_AUTH_LEN: usize = 16 + 64 + 32;
const SERVER_ACCEPT_LEN: usize = 16 + 64;
const ZERO_NONCE: [u8; 24] = [0; 24];

/// Key and starting nonce for one direction of a boxed stream.
#[derive(Clone)]
pub struct BoxKeys {
    pub key: [u8; 32],
    pub nonce: [u8; 24],
}

impl std::fmt::Debug for BoxKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxKeys").finish_non_exhaustive()
    }
}

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Verified long-term identity of the other side
    pub remote: IdentityRef,
    pub encrypt: BoxKeys,
    pub decrypt: BoxKeys,
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn auth_tag(network_key: &NetworkKey, data: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha512 as Mac>::new_from_slice(network_key.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data);
    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes()[..32]);
    tag
}

fn verify_auth_tag(network_key: &NetworkKey, data: &[u8], tag: &[u8]) -> bool {
    match <HmacSha512 as Mac>::new_from_slice(network_key.as_bytes()) {
        Ok(mut mac) => {
            mac.update(data);
            mac.verify_truncated_left(tag).is_ok()
        }
        Err(_) => false,
    }
}

fn seal(key: &[u8; 32], plaintext: &[u8]) -> NodeResult<Vec<u8>> {
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let mut body = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&ZERO_NONCE), b"", &mut body)
        .map_err(|_| NodeError::Crypto("handshake encryption failed".to_string()))?;
    let mut out = tag.to_vec();
    out.extend_from_slice(&body);
    Ok(out)
}

fn open(key: &[u8; 32], boxed: &[u8], what: &str) -> NodeResult<Vec<u8>> {
    if boxed.len() < 16 {
        return Err(NodeError::Protocol(format!("{} is too short", what)));
    }
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let (tag, body) = boxed.split_at(16);
    let mut body = body.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(&ZERO_NONCE), b"", &mut body, Tag::from_slice(tag))
        .map_err(|_| NodeError::Protocol(format!("{} failed to authenticate", what)))?;
    Ok(body)
}

fn agree(secret: &StaticSecret, public: &CurvePublic) -> NodeResult<[u8; 32]> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(NodeError::Protocol("non-contributory key exchange".to_string()));
    }
    Ok(shared.to_bytes())
}

fn curve_public(identity: &IdentityRef) -> NodeResult<CurvePublic> {
    Ok(CurvePublic::from(identity.verifying_key()?.to_montgomery().to_bytes()))
}

fn ephemeral() -> NodeResult<(StaticSecret, CurvePublic)> {
    let mut seed = [0u8; 32];
    getrandom::getrandom(&mut seed)
        .map_err(|e| NodeError::Crypto(format!("no randomness for ephemeral key: {}", e)))?;
    let secret = StaticSecret::from(seed);
    let public = CurvePublic::from(&secret);
    Ok((secret, public))
}

fn hello(network_key: &NetworkKey, eph_public: &CurvePublic) -> [u8; HELLO_LEN] {
    let mut msg = [0u8; HELLO_LEN];
    msg[..32].copy_from_slice(&auth_tag(network_key, eph_public.as_bytes()));
    msg[32..].copy_from_slice(eph_public.as_bytes());
    msg
}

fn check_hello(network_key: &NetworkKey, msg: &[u8; HELLO_LEN]) -> NodeResult<CurvePublic> {
    let (tag, key) = msg.split_at(32);
    if !verify_auth_tag(network_key, key, tag) {
        return Err(NodeError::Protocol(
            "hello failed to authenticate (wrong network key?)".to_string(),
        ));
    }
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(key);
    Ok(CurvePublic::from(bytes))
}

/// Derive the per-direction keys once both sides know every shared secret.
fn derive_keys(
    network_key: &NetworkKey,
    shared: &[u8; 32],
    local: &IdentityRef,
    remote: &IdentityRef,
    local_eph: &CurvePublic,
    remote_eph: &CurvePublic,
) -> (BoxKeys, BoxKeys) {
    let secret = sha256(&[shared]);
    let mut encrypt_nonce = [0u8; 24];
    encrypt_nonce.copy_from_slice(&auth_tag(network_key, remote_eph.as_bytes())[..24]);
    let mut decrypt_nonce = [0u8; 24];
    decrypt_nonce.copy_from_slice(&auth_tag(network_key, local_eph.as_bytes())[..24]);
    (
        BoxKeys {
            key: sha256(&[&secret, remote.as_bytes()]),
            nonce: encrypt_nonce,
        },
        BoxKeys {
            key: sha256(&[&secret, local.as_bytes()]),
            nonce: decrypt_nonce,
        },
    )
}

/// Run the client side against a server expected to be `server`.
pub async fn client_handshake<S>(
    stream: &mut S,
    network_key: &NetworkKey,
    identity: &Identity,
    server: &IdentityRef,
) -> NodeResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = identity.public();
    let (eph_secret, eph_public) = ephemeral()?;

    stream.write_all(&hello(network_key, &eph_public)).await?;
    stream.flush().await?;

    let mut server_hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut server_hello).await?;
    let server_eph = check_hello(network_key, &server_hello)?;
    trace!(%server, "Server hello verified");

    let ab = agree(&eph_secret, &server_eph)?;
    let a_b = agree(&eph_secret, &curve_public(server)?)?;
    let ab_hash = sha256(&[&ab]);

    let mut signed = Vec::with_capacity(96);
    signed.extend_from_slice(network_key.as_bytes());
    signed.extend_from_slice(server.as_bytes());
    signed.extend_from_slice(&ab_hash);
    let sig_a = identity.sign(&signed).to_bytes();

    let mut auth = Vec::with_capacity(96);
    auth.extend_from_slice(&sig_a);
    auth.extend_from_slice(local.as_bytes());
    let auth_key = sha256(&[network_key.as_bytes(), &ab, &a_b]);
    stream.write_all(&seal(&auth_key, &auth)?).await?;
    stream.flush().await?;

    let long_term = StaticSecret::from(identity.curve25519_secret());
    let a_b_upper = agree(&long_term, &server_eph)?;
    let accept_key = sha256(&[network_key.as_bytes(), &ab, &a_b, &a_b_upper]);

    let mut accept = [0u8; SERVER_ACCEPT_LEN];
    stream.read_exact(&mut accept).await?;
    let sig_b = open(&accept_key, &accept, "server accept")?;
    let sig_b = Signature::from_slice(&sig_b)
        .map_err(|e| NodeError::Protocol(format!("bad server signature: {}", e)))?;

    let mut expected = Vec::with_capacity(192);
    expected.extend_from_slice(network_key.as_bytes());
    expected.extend_from_slice(&sig_a);
    expected.extend_from_slice(local.as_bytes());
    expected.extend_from_slice(&ab_hash);
    if !verify_signature(server, &expected, &sig_b) {
        return Err(NodeError::Protocol(format!("server {} failed to prove its identity", server)));
    }

    let (encrypt, decrypt) =
        derive_keys(network_key, &accept_key, &local, server, &eph_public, &server_eph);
    Ok(HandshakeOutcome {
        remote: *server,
        encrypt,
        decrypt,
    })
}

/// Run the server side; the client's identity is learned on the way.
pub async fn server_handshake<S>(
    stream: &mut S,
    network_key: &NetworkKey,
    identity: &Identity,
) -> NodeResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let local = identity.public();

    let mut client_hello = [0u8; HELLO_LEN];
    stream.read_exact(&mut client_hello).await?;
    let client_eph = check_hello(network_key, &client_hello)?;

    let (eph_secret, eph_public) = ephemeral()?;
    stream.write_all(&hello(network_key, &eph_public)).await?;
    stream.flush().await?;

    let long_term = StaticSecret::from(identity.curve25519_secret());
    let ab = agree(&eph_secret, &client_eph)?;
    let a_b = agree(&long_term, &client_eph)?;
    let ab_hash = sha256(&[&ab]);

    let mut auth = [0u8; CLIENT_AUTH_LEN];
    stream.read_exact(&mut auth).await?;
    let auth_key = sha256(&[network_key.as_bytes(), &ab, &a_b]);
    let auth = open(&auth_key, &auth, "client auth")?;
    let sig_a = Signature::from_slice(&auth[..64])
        .map_err(|e| NodeError::Protocol(format!("bad client signature: {}", e)))?;
    let mut client_key = [0u8; 32];
    client_key.copy_from_slice(&auth[64..96]);
    let client = IdentityRef::from_bytes(client_key)
        .map_err(|e| NodeError::Protocol(format!("bad client identity: {}", e)))?;

    let mut signed = Vec::with_capacity(96);
    signed.extend_from_slice(network_key.as_bytes());
    signed.extend_from_slice(local.as_bytes());
    signed.extend_from_slice(&ab_hash);
    if !verify_signature(&client, &signed, &sig_a) {
        return Err(NodeError::Protocol(format!("client {} failed to prove its identity", client)));
    }
    trace!(%client, "Client authenticated");

    let a_b_upper = agree(&eph_secret, &curve_public(&client)?)?;
    let accept_key = sha256(&[network_key.as_bytes(), &ab, &a_b, &a_b_upper]);

    let mut accept = Vec::with_capacity(192);
    accept.extend_from_slice(network_key.as_bytes());
    accept.extend_from_slice(&sig_a.to_bytes());
    accept.extend_from_slice(client.as_bytes());
    accept.extend_from_slice(&ab_hash);
    let sig_b = identity.sign(&accept).to_bytes();
    stream.write_all(&seal(&accept_key, &sig_b)?).await?;
    stream.flush().await?;

    let (encrypt, decrypt) =
        derive_keys(network_key, &accept_key, &local, &client, &eph_public, &client_eph);
    Ok(HandshakeOutcome {
        remote: client,
        encrypt,
        decrypt,
    })
}
