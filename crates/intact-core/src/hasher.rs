use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::error::{Error, Result};

/// Read granularity for the digest loop.
const BLOCK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgo {
    Md5,
    Sha512,
    Blake3,
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgo::Md5 => write!(f, "md5"),
            HashAlgo::Sha512 => write!(f, "sha512"),
            HashAlgo::Blake3 => write!(f, "blake3"),
        }
    }
}

impl FromStr for HashAlgo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "md5" => Ok(HashAlgo::Md5),
            "sha512" => Ok(HashAlgo::Sha512),
            "blake3" => Ok(HashAlgo::Blake3),
            other => Err(Error::Config(format!("hash algorithm '{other}' is unknown"))),
        }
    }
}

enum Digest {
    Md5(md5::Context),
    Sha512(sha2::Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Digest {
    fn new(algo: HashAlgo) -> Self {
        match algo {
            HashAlgo::Md5 => Digest::Md5(md5::Context::new()),
            HashAlgo::Sha512 => Digest::Sha512(sha2::Sha512::new()),
            HashAlgo::Blake3 => Digest::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Digest::Md5(ctx) => ctx.consume(data),
            Digest::Sha512(h) => h.update(data),
            Digest::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Digest::Md5(ctx) => to_hex(&ctx.compute().0),
            Digest::Sha512(h) => to_hex(h.finalize().as_slice()),
            Digest::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Digest a file under the given algorithm, reporting each block read to
/// `progress`. Returns the lowercase hex digest and the total bytes read.
pub fn hash_file(
    path: &Path,
    algo: HashAlgo,
    mut progress: impl FnMut(i64),
) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut digest = Digest::new(algo);
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        total += n as u64;
        progress(n as i64);
    }
    Ok((digest.finalize_hex(), total))
}

/// md5 of an in-memory buffer, used for index self-hashes.
pub fn md5_hex(data: &[u8]) -> String {
    to_hex(&md5::compute(data).0)
}
