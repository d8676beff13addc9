use ctor::ctor;
use libsodium_sys;

pub const KEY_SIZE: usize = libsodium_sys::crypto_box_PUBLICKEYBYTES as usize;
pub const SECRET_KEY_SIZE: usize = libsodium_sys::crypto_box_SECRETKEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_box_NONCEBYTES as usize;
pub const MAC_SIZE: usize = libsodium_sys::crypto_box_MACBYTES as usize;
pub const SEAL_SIZE: usize = libsodium_sys::crypto_box_SEALBYTES as usize;
pub const SIGN_SIZE: usize = libsodium_sys::crypto_sign_BYTES as usize;
pub const SIGN_KEY_SIZE: usize = libsodium_sys::crypto_sign_PUBLICKEYBYTES as usize;
pub const SIGN_SECRET_KEY_SIZE: usize = libsodium_sys::crypto_sign_SECRETKEYBYTES as usize;
pub const HASH_SIZE: usize = libsodium_sys::crypto_generichash_BYTES as usize;

pub type Nonce = [u8; NONCE_SIZE];

/// Initialize the sodium infrastructure
#[ctor(unsafe)]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

/// Public key encryption keypair.
#[derive(Clone)]
pub struct BoxKeyPair {
    pub public: [u8; KEY_SIZE],
    pub secret: [u8; SECRET_KEY_SIZE],
}

impl BoxKeyPair {
    /// Generates a fresh encryption keypair.
    #[inline]
    pub fn generate() -> BoxKeyPair {
        let mut pair = BoxKeyPair {
            public: [0u8; KEY_SIZE],
            secret: [0u8; SECRET_KEY_SIZE],
        };

        unsafe {
            libsodium_sys::crypto_box_keypair(pair.public.as_mut_ptr(), pair.secret.as_mut_ptr());
        }

        pair
    }
}

/// Detached signature keypair. Note that signing secret keys are 64 octets.
#[derive(Clone)]
pub struct SignKeyPair {
    pub public: [u8; SIGN_KEY_SIZE],
    pub secret: [u8; SIGN_SECRET_KEY_SIZE],
}

impl SignKeyPair {
    /// Generates a fresh signing keypair.
    #[inline]
    pub fn generate() -> SignKeyPair {
        let mut pair = SignKeyPair {
            public: [0u8; SIGN_KEY_SIZE],
            secret: [0u8; SIGN_SECRET_KEY_SIZE],
        };

        unsafe {
            libsodium_sys::crypto_sign_keypair(pair.public.as_mut_ptr(), pair.secret.as_mut_ptr());
        }

        pair
    }
}

/// Generates a fresh random session nonce.
#[inline]
pub fn random_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    random_bytes(&mut nonce);
    nonce
}

/// Anonymously encrypts the plain text to the recipient public key. The cipher
/// slice must be exactly `SEAL_SIZE` octets longer than the plain text.
#[inline]
pub fn seal(cipher: &mut [u8], plain: &[u8], public_key: &[u8; KEY_SIZE]) -> bool {
    if cipher.len() != plain.len() + SEAL_SIZE {
        panic!(
            "Seal: cipher data length ({}) must be plain data length ({}) + seal size ({})",
            cipher.len(),
            plain.len(),
            SEAL_SIZE
        )
    }

    unsafe {
        libsodium_sys::crypto_box_seal(
            cipher.as_mut_ptr(),
            plain.as_ptr(),
            plain.len() as u64,
            public_key.as_ptr(),
        ) >= 0
    }
}

/// Opens a sealed box addressed to the supplied keypair. Returns false if the
/// cipher text does not authenticate.
#[inline]
pub fn seal_open(
    plain: &mut [u8],
    cipher: &[u8],
    public_key: &[u8; KEY_SIZE],
    secret_key: &[u8; SECRET_KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + SEAL_SIZE {
        panic!(
            "Seal open: cipher data length ({}) must be plain data length ({}) + seal size ({})",
            cipher.len(),
            plain.len(),
            SEAL_SIZE
        )
    }

    unsafe {
        libsodium_sys::crypto_box_seal_open(
            plain.as_mut_ptr(),
            cipher.as_ptr(),
            cipher.len() as u64,
            public_key.as_ptr(),
            secret_key.as_ptr(),
        ) >= 0
    }
}

/// Encrypts and authenticates the plain text with the sender secret key for
/// the recipient public key. The cipher slice must be exactly `MAC_SIZE`
/// octets longer than the plain text.
#[inline]
pub fn box_encrypt(
    cipher: &mut [u8],
    plain: &[u8],
    nonce: &Nonce,
    public_key: &[u8; KEY_SIZE],
    secret_key: &[u8; SECRET_KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Box: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        libsodium_sys::crypto_box_easy(
            cipher.as_mut_ptr(),
            plain.as_ptr(),
            plain.len() as u64,
            nonce.as_ptr(),
            public_key.as_ptr(),
            secret_key.as_ptr(),
        ) >= 0
    }
}

/// Authenticates and decrypts a boxed cipher text. The nonce, sender public
/// key and recipient secret key must match those used during encryption.
#[inline]
pub fn box_open(
    plain: &mut [u8],
    cipher: &[u8],
    nonce: &Nonce,
    public_key: &[u8; KEY_SIZE],
    secret_key: &[u8; SECRET_KEY_SIZE],
) -> bool {
    if cipher.len() != plain.len() + MAC_SIZE {
        panic!(
            "Box open: cipher data length ({}) must be plain data length ({}) + MAC size ({})",
            cipher.len(),
            plain.len(),
            MAC_SIZE
        )
    }

    unsafe {
        libsodium_sys::crypto_box_open_easy(
            plain.as_mut_ptr(),
            cipher.as_ptr(),
            cipher.len() as u64,
            nonce.as_ptr(),
            public_key.as_ptr(),
            secret_key.as_ptr(),
        ) >= 0
    }
}

/// Produces a detached signature over the message.
#[inline]
pub fn sign(
    signature: &mut [u8; SIGN_SIZE],
    message: &[u8],
    secret_key: &[u8; SIGN_SECRET_KEY_SIZE],
) -> bool {
    unsafe {
        libsodium_sys::crypto_sign_detached(
            signature.as_mut_ptr(),
            ::std::ptr::null_mut(),
            message.as_ptr(),
            message.len() as u64,
            secret_key.as_ptr(),
        ) >= 0
    }
}

/// Validates a detached signature over the message.
#[inline]
pub fn verify(signature: &[u8], message: &[u8], public_key: &[u8; SIGN_KEY_SIZE]) -> bool {
    if signature.len() != SIGN_SIZE {
        return false;
    }

    unsafe {
        libsodium_sys::crypto_sign_verify_detached(
            signature.as_ptr(),
            message.as_ptr(),
            message.len() as u64,
            public_key.as_ptr(),
        ) >= 0
    }
}

/// Hashes the message into a 32 octet digest.
#[inline]
pub fn generichash(out: &mut [u8; HASH_SIZE], message: &[u8]) {
    unsafe {
        libsodium_sys::crypto_generichash(
            out.as_mut_ptr(),
            out.len(),
            message.as_ptr(),
            message.len() as u64,
            ::std::ptr::null(),
            0,
        );
    }
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Returns a cryptographically secure random 32-bit integer.
#[inline]
pub fn random_u32() -> u32 {
    let mut raw = [0u8; 4];
    random_bytes(&mut raw);
    u32::from_be_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_roundtrip() {
        let pair = BoxKeyPair::generate();

        let plain = b"brackish";
        let mut cipher = [0u8; 8 + SEAL_SIZE];
        let mut opened = [0u8; 8];

        assert!(seal(&mut cipher, &plain[..], &pair.public));
        assert!(seal_open(&mut opened, &cipher, &pair.public, &pair.secret));
        assert_eq!(&opened, plain);
    }

    #[test]
    fn test_seal_open_wrong_key() {
        let pair = BoxKeyPair::generate();
        let other = BoxKeyPair::generate();

        let mut cipher = [0u8; 8 + SEAL_SIZE];
        let mut opened = [0u8; 8];

        assert!(seal(&mut cipher, b"brackish", &pair.public));
        assert!(!seal_open(&mut opened, &cipher, &other.public, &other.secret));
    }

    #[test]
    fn test_box_roundtrip() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let nonce = random_nonce();

        let mut cipher = [0u8; 5 + MAC_SIZE];
        let mut opened = [0u8; 5];

        assert!(box_encrypt(&mut cipher, b"hello", &nonce, &bob.public, &alice.secret));
        assert!(box_open(&mut opened, &cipher, &nonce, &alice.public, &bob.secret));
        assert_eq!(&opened, b"hello");
    }

    #[test]
    fn test_box_open_nonce_mismatch() {
        let alice = BoxKeyPair::generate();
        let bob = BoxKeyPair::generate();
        let nonce = random_nonce();
        let mut wrong = nonce;
        wrong[0] = wrong[0].wrapping_add(1);

        let mut cipher = [0u8; 5 + MAC_SIZE];
        let mut opened = [0u8; 5];

        assert!(box_encrypt(&mut cipher, b"hello", &nonce, &bob.public, &alice.secret));
        assert!(!box_open(&mut opened, &cipher, &wrong, &alice.public, &bob.secret));
    }

    #[test]
    fn test_sign_verify() {
        let pair = SignKeyPair::generate();

        let mut signature = [0u8; SIGN_SIZE];
        assert!(sign(&mut signature, b"payload", &pair.secret));
        assert!(verify(&signature, b"payload", &pair.public));
        assert!(!verify(&signature, b"tampered", &pair.public));
    }

    #[test]
    fn test_generichash_deterministic() {
        let mut first = [0u8; HASH_SIZE];
        let mut second = [0u8; HASH_SIZE];

        generichash(&mut first, b"prefix bytes");
        generichash(&mut second, b"prefix bytes");

        assert_eq!(first, second);

        generichash(&mut second, b"other bytes");
        assert_ne!(first, second);
    }

    #[test]
    fn test_random_u32_varies() {
        let draws: Vec<_> = (0..8).map(|_| random_u32()).collect();
        assert!(draws.iter().any(|&v| v != draws[0]));
    }
}
