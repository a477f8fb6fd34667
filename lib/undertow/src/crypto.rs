use byteorder::{LittleEndian, WriteBytesExt};
use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

pub const SHARE_SIZE: usize = libsodium_sys::crypto_kx_PUBLICKEYBYTES as usize;
pub const SHARE_SECRET_SIZE: usize = libsodium_sys::crypto_kx_SECRETKEYBYTES as usize;

pub const DIGEST_SIZE: usize = 16;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

#[inline]
fn nonce_to_bytes(nonce: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    (&mut nonce_bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(nonce)
        .expect("Error creating nonce");
    nonce_bytes
}

/// Encrypts the plain text into the cipher buffer and writes the authentication tag into `mac`.
/// The cipher slice must be exactly as long as the plain text.
///
/// The additional data, nonce and key must match those used during decryption, the decryption
/// will fail otherwise.
#[inline]
pub fn seal(
    cipher: &mut [u8],
    mac: &mut [u8; MAC_SIZE],
    plain: &[u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() {
        panic!(
            "Encryption: cipher data length ({}) must equal plain data length ({})",
            cipher.len(),
            plain.len()
        )
    }

    let nonce_bytes = nonce_to_bytes(nonce);

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt_detached(
            cipher.as_mut_ptr(),
            mac.as_mut_ptr(),
            ::std::ptr::null_mut(),
            plain.as_ptr(),
            plain.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the ciphertext into the plain buffer, verifying the detached authentication tag.
/// The plain slice must be exactly as long as the cipher text.
///
/// The additional data, nonce and key must match those used during encryption, the decryption
/// will fail otherwise.
#[inline]
pub fn open(
    plain: &mut [u8],
    cipher: &[u8],
    mac: &[u8; MAC_SIZE],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() {
        panic!(
            "Decryption: plain data length ({}) must equal cipher data length ({})",
            plain.len(),
            cipher.len()
        )
    }

    let nonce_bytes = nonce_to_bytes(nonce);

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt_detached(
            plain.as_mut_ptr(),
            ::std::ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as u64,
            mac.as_ptr(),
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Session keys for one direction pair, as produced by the key exchange.
pub struct SessionKeys {
    pub receive: [u8; KEY_SIZE],
    pub send: [u8; KEY_SIZE],
}

/// Generates a fresh key-share pair for the handshake.
#[inline]
pub fn share_keypair() -> ([u8; SHARE_SIZE], [u8; SHARE_SECRET_SIZE]) {
    let mut public = [0u8; SHARE_SIZE];
    let mut secret = [0u8; SHARE_SECRET_SIZE];

    unsafe {
        libsodium_sys::crypto_kx_keypair(public.as_mut_ptr(), secret.as_mut_ptr());
    }

    (public, secret)
}

/// Derives the session keys on the connecting side from the local share pair and the
/// listener's public share. Fails if the listener share is degenerate.
#[inline]
pub fn connector_session_keys(
    public: &[u8; SHARE_SIZE],
    secret: &[u8; SHARE_SECRET_SIZE],
    listener_share: &[u8; SHARE_SIZE],
) -> Option<SessionKeys> {
    let mut keys = SessionKeys {
        receive: [0u8; KEY_SIZE],
        send: [0u8; KEY_SIZE],
    };

    let result = unsafe {
        libsodium_sys::crypto_kx_client_session_keys(
            keys.receive.as_mut_ptr(),
            keys.send.as_mut_ptr(),
            public.as_ptr(),
            secret.as_ptr(),
            listener_share.as_ptr(),
        )
    };

    match result {
        0 => Some(keys),
        _ => None,
    }
}

/// Derives the session keys on the listening side from the local share pair and the
/// connector's public share.
#[inline]
pub fn listener_session_keys(
    public: &[u8; SHARE_SIZE],
    secret: &[u8; SHARE_SECRET_SIZE],
    connector_share: &[u8; SHARE_SIZE],
) -> Option<SessionKeys> {
    let mut keys = SessionKeys {
        receive: [0u8; KEY_SIZE],
        send: [0u8; KEY_SIZE],
    };

    let result = unsafe {
        libsodium_sys::crypto_kx_server_session_keys(
            keys.receive.as_mut_ptr(),
            keys.send.as_mut_ptr(),
            public.as_ptr(),
            secret.as_ptr(),
            connector_share.as_ptr(),
        )
    };

    match result {
        0 => Some(keys),
        _ => None,
    }
}

/// Computes a 16 byte BLAKE2b digest of the data. An unkeyed digest serves as a plain
/// integrity checksum, a keyed digest as a message authentication code.
#[inline]
pub fn digest(out: &mut [u8; DIGEST_SIZE], data: &[u8], key: &[u8]) -> bool {
    unsafe {
        let result = libsodium_sys::crypto_generichash(
            out.as_mut_ptr(),
            DIGEST_SIZE,
            data.as_ptr(),
            data.len() as u64,
            key.as_ptr(),
            key.len(),
        );

        result >= 0
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Returns a random u64. Used for connection ids and sequence starts.
#[inline]
pub fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    random_bytes(&mut bytes);
    u64::from_le_bytes(bytes)
}
