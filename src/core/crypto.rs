//! Password-based payload encryption.
//!
//! Framing: `salt (16) || iv (16) || AES-256-CBC ciphertext (PKCS#7)`.
//! The key is PBKDF2-HMAC-SHA256 over the password with 100,000 rounds.
//! Both directions work in fixed-size chunks so memory use does not depend
//! on payload size.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use anyhow::{Context, Result, anyhow};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{BackupError, BackupResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const HEADER_LEN: usize = SALT_LEN + IV_LEN;
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;
const CHUNK_SIZE: usize = 64 * 1024;

fn derive_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}

/// Read whatever is available, retrying on interruption. 0 means EOF.
fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Encrypt `source` into `dest`, returning the number of bytes written
pub fn encrypt<R: Read, W: Write>(mut source: R, mut dest: W, password: &str) -> Result<u64> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    let key = derive_key(password, &salt);
    let mut cipher = Aes256CbcEnc::new_from_slices(&key[..], &iv)
        .map_err(|e| anyhow!("Invalid key material: {}", e))?;

    dest.write_all(&salt)?;
    dest.write_all(&iv)?;
    let mut written = HEADER_LEN as u64;

    // Room for one extra block so the final padded block always fits
    let mut buf = vec![0u8; CHUNK_SIZE + BLOCK_LEN];
    let mut pending = 0usize;

    loop {
        let n = read_some(&mut source, &mut buf[pending..CHUNK_SIZE])
            .context("Failed to read plaintext")?;
        if n == 0 {
            break;
        }
        pending += n;

        let ready = pending - pending % BLOCK_LEN;
        for block in buf[..ready].chunks_exact_mut(BLOCK_LEN) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        dest.write_all(&buf[..ready]).context("Failed to write ciphertext")?;
        written += ready as u64;

        buf.copy_within(ready..pending, 0);
        pending -= ready;
    }

    let tail = cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buf, pending)
        .map_err(|_| anyhow!("Padding buffer too small"))?;
    dest.write_all(tail).context("Failed to write ciphertext")?;
    written += tail.len() as u64;

    dest.flush()?;
    Ok(written)
}

/// Decrypt `source` into `dest`, returning the number of plaintext bytes.
///
/// Wrong passwords and damaged ciphertext are indistinguishable and both
/// yield [`BackupError::Corrupt`].
pub fn decrypt<R: Read, W: Write>(mut source: R, mut dest: W, password: &str) -> BackupResult<u64> {
    let mut header = [0u8; HEADER_LEN];
    source.read_exact(&mut header).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => BackupError::corrupt("encrypted payload shorter than its header"),
        _ => BackupError::from(e),
    })?;
    let (salt, iv) = header.split_at(SALT_LEN);

    let key = derive_key(password, salt);
    let mut cipher = Aes256CbcDec::new_from_slices(&key[..], iv)
        .map_err(|e| anyhow!("Invalid key material: {}", e))?;

    let mut buf = vec![0u8; CHUNK_SIZE + BLOCK_LEN];
    let mut pending = 0usize;
    let mut written = 0u64;

    loop {
        let n = read_some(&mut source, &mut buf[pending..])?;
        if n == 0 {
            break;
        }
        pending += n;

        if pending <= BLOCK_LEN {
            continue;
        }

        // The last complete block carries the padding; hold it until EOF
        let mut ready = pending - pending % BLOCK_LEN;
        if ready == pending {
            ready -= BLOCK_LEN;
        }

        for block in buf[..ready].chunks_exact_mut(BLOCK_LEN) {
            cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        dest.write_all(&buf[..ready])?;
        written += ready as u64;

        buf.copy_within(ready..pending, 0);
        pending -= ready;
    }

    if pending != BLOCK_LEN {
        return Err(BackupError::corrupt("ciphertext is truncated"));
    }

    let plain = cipher
        .decrypt_padded_mut::<Pkcs7>(&mut buf[..pending])
        .map_err(|_| BackupError::corrupt("invalid padding"))?;
    dest.write_all(plain)?;
    written += plain.len() as u64;

    dest.flush()?;
    Ok(written)
}

/// Encrypt one file into another
pub fn encrypt_file(source: &Path, dest: &Path, password: &str) -> Result<u64> {
    let reader = BufReader::new(
        File::open(source).with_context(|| format!("Failed to open {}", source.display()))?,
    );
    let file = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut writer = BufWriter::new(file);
    let written = encrypt(reader, &mut writer, password)?;
    writer.into_inner()
        .map_err(|e| anyhow!("Failed to flush {}: {}", dest.display(), e))?
        .sync_all()?;

    debug!("Encrypted {} -> {} ({} bytes)", source.display(), dest.display(), written);
    Ok(written)
}

/// Decrypt one file into another. A failed decrypt leaves no output file.
pub fn decrypt_file(source: &Path, dest: &Path, password: &str) -> BackupResult<u64> {
    let reader = BufReader::new(
        File::open(source).with_context(|| format!("Failed to open {}", source.display()))?,
    );
    let file = File::create(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let mut writer = BufWriter::new(file);
    match decrypt(reader, &mut writer, password) {
        Ok(written) => {
            writer.flush()?;
            debug!("Decrypted {} -> {} ({} bytes)", source.display(), dest.display(), written);
            Ok(written)
        }
        Err(e) => {
            drop(writer);
            let _ = std::fs::remove_file(dest);
            Err(e)
        }
    }
}
