//! Public-key encryption of staged files.
//!
//! The pipeline only sees the [`EncryptionGateway`] contract. The shipped
//! implementation, [`AgeGateway`], writes standard age v1 files addressed to
//! one X25519 recipient, so any age client (`age -d -i key.txt`, `rage`) can
//! open an uploaded artifact. With armor enabled the artifact is the PEM-style
//! `BEGIN AGE ENCRYPTED FILE` text form.
//!
//! age authenticates every 64 KiB payload chunk, so the integrity flag of the
//! contract is always satisfied.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use age::armor::{ArmoredWriter, Format};
use age::secrecy::ExposeSecret;
use zeroize::Zeroizing;

use crate::config::{RecipientKey, Secret};
use crate::error::EncryptionFault;
use crate::fs_ops::{read_full, remove_quietly};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Contract for encrypting one file to a recipient's public key.
///
/// Implementations must not leave a partial `output` behind on failure, and
/// must never overwrite an existing `output`.
pub trait EncryptionGateway: Send + Sync {
    /// Encrypt `input` into a new file at `output`.
    ///
    /// # Arguments
    /// * `input` - Plaintext file (the staged copy)
    /// * `output` - Destination of the encrypted artifact; must not exist
    /// * `recipient` - Public key the artifact is sealed to
    /// * `armor` - Emit a text envelope instead of raw binary
    /// * `integrity_check` - Require the payload to be authenticated
    fn encrypt(
        &self,
        input: &Path,
        output: &Path,
        recipient: &RecipientKey,
        armor: bool,
        integrity_check: bool,
    ) -> Result<(), EncryptionFault>;
}

/// age v1 encryption to a single X25519 recipient.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgeGateway;

impl EncryptionGateway for AgeGateway {
    fn encrypt(
        &self,
        input: &Path,
        output: &Path,
        recipient: &RecipientKey,
        armor: bool,
        _integrity_check: bool,
    ) -> Result<(), EncryptionFault> {
        let mut source = File::open(input).map_err(|source| EncryptionFault::Io {
            path: input.to_path_buf(),
            source,
        })?;

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(output)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::AlreadyExists {
                    EncryptionFault::OutputExists {
                        path: output.to_path_buf(),
                    }
                } else {
                    EncryptionFault::Io {
                        path: output.to_path_buf(),
                        source,
                    }
                }
            })?;

        let result = write_artifact(&mut source, file, recipient, armor, input, output);
        if result.is_err() {
            remove_quietly(output);
        }
        result
    }
}

fn write_artifact(
    source: &mut File,
    file: File,
    recipient: &RecipientKey,
    armor: bool,
    input: &Path,
    output: &Path,
) -> Result<(), EncryptionFault> {
    let read_err = |source: io::Error| EncryptionFault::Io {
        path: input.to_path_buf(),
        source,
    };
    let write_err = |source: io::Error| EncryptionFault::Io {
        path: output.to_path_buf(),
        source,
    };

    let recipients: Vec<Box<dyn age::Recipient + Send>> = vec![Box::new(recipient.recipient().clone())];
    let encryptor = age::Encryptor::with_recipients(recipients)
        .ok_or_else(|| EncryptionFault::Cipher("no recipient to encrypt to".to_string()))?;

    let format = if armor { Format::AsciiArmor } else { Format::Binary };
    let armored = ArmoredWriter::wrap_output(BufWriter::new(file), format).map_err(write_err)?;
    let mut writer = encryptor.wrap_output(armored).map_err(|e| match e {
        age::EncryptError::Io(source) => write_err(source),
        other => EncryptionFault::Cipher(other.to_string()),
    })?;

    let mut buffer = Zeroizing::new(vec![0u8; READ_BUFFER_SIZE]);
    loop {
        let filled = read_full(source, &mut buffer[..]).map_err(read_err)?;
        if filled == 0 {
            break;
        }
        writer.write_all(&buffer[..filled]).map_err(write_err)?;
    }

    let out = writer
        .finish()
        .and_then(|armored| armored.finish())
        .map_err(write_err)?;
    let file = out.into_inner().map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)
}

/// A freshly generated recipient key pair.
pub struct GeneratedKeys {
    /// age identity (`AGE-SECRET-KEY-1...`); keep offline
    pub secret: Secret,
    pub public: RecipientKey,
}

/// Generate a recipient key pair for the `recipient_key` setting.
pub fn generate_keypair() -> GeneratedKeys {
    let identity = age::x25519::Identity::generate();
    GeneratedKeys {
        secret: Secret::new(identity.to_string().expose_secret().clone()),
        public: RecipientKey::from(identity.to_public()),
    }
}

/// Decrypt an artifact written by [`AgeGateway`], armored or binary.
#[cfg(test)]
pub(crate) fn open_sealed(data: &[u8], secret: &Secret) -> Result<Vec<u8>, String> {
    use age::armor::ArmoredReader;
    use std::io::Read;

    let identity: age::x25519::Identity = secret.expose().parse().map_err(|e| format!("bad identity: {e}"))?;
    let decryptor = match age::Decryptor::new(ArmoredReader::new(data)).map_err(|e| e.to_string())? {
        age::Decryptor::Recipients(decryptor) => decryptor,
        _ => return Err("artifact is passphrase-encrypted".to_string()),
    };

    let mut reader = decryptor
        .decrypt(std::iter::once(&identity as &dyn age::Identity))
        .map_err(|e| e.to_string())?;
    let mut plaintext = Vec::new();
    reader.read_to_end(&mut plaintext).map_err(|e| e.to_string())?;
    Ok(plaintext)
}
