use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "md5" => Some(ChecksumType::Md5),
            "sha1" => Some(ChecksumType::Sha1),
            "sha256" => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumRequest {
    pub checksum_type: ChecksumType,
    pub expected_hex: String,
}

/// Lower-case hex digest of the file at `path`.
pub fn digest_file(path: &Path, kind: ChecksumType) -> CoreResult<String> {
    let file = File::open(path).map_err(|err| CoreError::Io(err.to_string()))?;
    let reader = BufReader::new(file);
    let digest = match kind {
        ChecksumType::Md5 => hash_reader::<Md5, _>(reader),
        ChecksumType::Sha1 => hash_reader::<Sha1, _>(reader),
        ChecksumType::Sha256 => hash_reader::<Sha256, _>(reader),
    };
    digest.map_err(|err| CoreError::Io(err.to_string()))
}

pub fn digest_bytes(bytes: &[u8], kind: ChecksumType) -> String {
    match kind {
        ChecksumType::Md5 => hex::encode(Md5::digest(bytes)),
        ChecksumType::Sha1 => hex::encode(Sha1::digest(bytes)),
        ChecksumType::Sha256 => hex::encode(Sha256::digest(bytes)),
    }
}

pub fn verify_checksum(path: &Path, req: &ChecksumRequest) -> bool {
    match digest_file(path, req.checksum_type) {
        Ok(actual) => actual.eq_ignore_ascii_case(req.expected_hex.trim()),
        Err(_) => false,
    }
}

fn hash_reader<D: Digest, R: Read>(mut reader: R) -> std::io::Result<String> {
    let mut hasher = D::new();
    let mut buf = [0u8; 1024 * 64];
    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
