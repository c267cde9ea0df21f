//! Password scrambles and the public-key exchange helpers.

pub mod caching_sha2;
pub mod cleartext;
pub mod forwarder;
pub mod native;
pub mod sha256;

use crate::protocol::mysql::constants::SCRAMBLE_SIZE;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Digest;
use sha2::Sha256;
use std::io::{Error, ErrorKind};

/// Nonce for a synthesised greeting: values in [1,127], no NUL, no '$'.
/// https://github.com/mysql/mysql-server/blob/8.0/mysys/crypt_genhash_impl.cc#L427
#[inline]
pub fn gen_nonce() -> [u8; SCRAMBLE_SIZE] {
    let mut nonce: [u8; SCRAMBLE_SIZE] = [0; SCRAMBLE_SIZE];
    let mut r = StdRng::from_entropy();
    for item in nonce.iter_mut() {
        *item = r.gen_range(1..127) as u8;
        if *item == b'$' {
            *item += 1;
        }
    }
    nonce
}

fn sha256_digest(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::default();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

fn sha1_digest(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = sha1::Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

pub fn xor<T, U>(mut left: T, right: U) -> T
where
    T: AsMut<[u8]>,
    U: AsRef<[u8]>,
{
    left.as_mut()
        .iter_mut()
        .zip(right.as_ref().iter())
        .for_each(|(l, r)| *l ^= r);
    left
}

/// `SHA1(pwd) XOR SHA1(nonce || SHA1(SHA1(pwd)))`; empty for an empty
/// password.
pub fn mysql_native_password_scramble(nonce: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hashed = sha1_digest(&[password]);
    let double_hashed = sha1_digest(&[&hashed]);
    let mask = sha1_digest(&[nonce, &double_hashed]);
    xor(hashed, mask).to_vec()
}

/// `SHA256(pwd) XOR SHA256(SHA256(SHA256(pwd)) || nonce)`; empty for an
/// empty password.
pub fn caching_sha2_password_scramble(nonce: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let hashed = sha256_digest(&[password]);
    let double_hashed = sha256_digest(&[&hashed]);
    let mask = sha256_digest(&[&double_hashed, nonce]);
    xor(hashed, mask).to_vec()
}

/// NUL-terminate, then xor with the nonce repeated cyclically. Applied
/// before RSA encryption, reversed after RSA decryption.
pub fn xor_password_with_nonce(password: &[u8], nonce: &[u8]) -> Vec<u8> {
    let mut buf = password.to_vec();
    buf.push(0);
    if !nonce.is_empty() {
        for (i, b) in buf.iter_mut().enumerate() {
            *b ^= nonce[i % nonce.len()];
        }
    }
    buf
}

fn crypto_error<E: std::fmt::Display>(e: E) -> Error {
    Error::new(ErrorKind::InvalidData, e.to_string())
}

/// Auth data toward the server, framed with the next server-leg seq-id.
pub(crate) async fn send_auth_data_to_server(
    cx: &mut crate::connection::ConnectionContext,
    data: &[u8],
) -> Result<(), Error> {
    let seq = cx.server_last_seq.wrapping_add(1);
    let server = cx.server_mut()?;
    server.channel.writer().set_seq(seq);
    crate::protocol::mysql::packet::writers::write_auth_data(server.channel.writer(), data).await
}

/// Parses a server public key as sent on the wire (SPKI PEM, PKCS#1 PEM as
/// a fallback).
pub fn public_key_from_pem(pem: &[u8]) -> Result<RsaPublicKey, Error> {
    let text = std::str::from_utf8(pem).map_err(crypto_error)?;
    RsaPublicKey::from_public_key_pem(text)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(text))
        .map_err(crypto_error)
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<Vec<u8>, Error> {
    key.to_public_key_pem(LineEnding::LF)
        .map(String::into_bytes)
        .map_err(crypto_error)
}

pub fn private_key_from_der(der: &[u8]) -> Result<RsaPrivateKey, Error> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    RsaPrivateKey::from_pkcs8_der(der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(der))
        .map_err(crypto_error)
}

/// RSA-OAEP(SHA1), the padding MySQL servers use for the encrypted-password
/// exchange.
pub fn rsa_encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut rng = rand::thread_rng();
    key.encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), data)
        .map_err(crypto_error)
}

pub fn rsa_decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    key.decrypt(Oaep::new::<sha1::Sha1>(), data)
        .map_err(crypto_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_password_empty() {
        assert!(mysql_native_password_scramble(b"", b"").is_empty());
    }

    #[test]
    fn native_password() {
        let scramble = mysql_native_password_scramble(b"01234567890123456789", b"pass");
        assert_eq!(
            scramble,
            vec![
                0xfc, 0xcf, 0xe5, 0x3a, 0x9f, 0x93, 0xe3, 0x84, 0x61, 0x18, 0x0b, 0xb3, 0x2c,
                0xc4, 0xac, 0x9b, 0x10, 0xd0, 0xc5, 0xc5
            ]
        );
    }

    #[test]
    fn caching_sha2_password() {
        let scramble = caching_sha2_password_scramble(b"01234567890123456789", b"pass");
        assert_eq!(
            scramble,
            vec![
                0x76, 0x2e, 0xe9, 0xe3, 0x14, 0x50, 0x73, 0x8a, 0x2f, 0x64, 0xe4, 0xcf, 0x83,
                0xa3, 0x20, 0xd0, 0xae, 0x9b, 0xc0, 0x6c, 0x58, 0x8d, 0x8d, 0xef, 0x1a, 0xb6,
                0xe7, 0x68, 0xaa, 0x90, 0x78, 0xac
            ]
        );
    }

    #[test]
    fn caching_sha2_empty() {
        assert!(caching_sha2_password_scramble(b"01234567890123456789", b"").is_empty());
    }

    #[test]
    fn nonce_has_no_nul() {
        for _ in 0..16 {
            let nonce = gen_nonce();
            assert!(nonce.iter().all(|&b| (1..=127).contains(&b)));
        }
    }

    #[test]
    fn xor_with_nonce_round_trips() {
        let nonce = b"01234567890123456789";
        let masked = xor_password_with_nonce(b"topsecret", nonce);
        assert_eq!(masked.len(), b"topsecret".len() + 1);

        // reversing recovers the NUL-terminated password.
        let mut recovered = masked;
        for (i, b) in recovered.iter_mut().enumerate() {
            *b ^= nonce[i % nonce.len()];
        }
        assert_eq!(recovered, b"topsecret\0");
    }

    #[test]
    fn rsa_oaep_round_trip() {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let pem = public_key_to_pem(&public_key).unwrap();
        assert!(pem.starts_with(b"-----BEGIN PUBLIC KEY-----"));
        let parsed = public_key_from_pem(&pem).unwrap();

        let cipher = rsa_encrypt(&parsed, b"pass\0").unwrap();
        let plain = rsa_decrypt(&private_key, &cipher).unwrap();
        assert_eq!(plain, b"pass\0");
    }
}
