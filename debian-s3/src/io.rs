// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! I/O helpers. */

use {
    crate::error::{DebS3Error, Result},
    digest::Digest,
    std::{fmt::Formatter, io::Write, path::Path},
};

/// Checksum type / digest mechanism used in repository indices.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChecksumType {
    /// MD5.
    Md5,

    /// SHA-1.
    Sha1,

    /// SHA-256.
    Sha256,

    /// SHA-512.
    ///
    /// Only recorded on packages. `Release` files don't carry it.
    Sha512,
}

impl ChecksumType {
    /// Variants advertised in `Release` files, in the order they are written.
    pub fn release_order() -> impl Iterator<Item = ChecksumType> {
        [Self::Md5, Self::Sha1, Self::Sha256].into_iter()
    }

    /// Name of the field in `Release` files holding this variant type.
    ///
    /// This also corresponds to the directory name for `by-hash` paths.
    pub fn field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5Sum",
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    /// Name of the field in `Packages` stanzas holding this variant type.
    pub fn package_field_name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5sum",
            _ => self.field_name(),
        }
    }
}

/// Represents a content digest.
#[derive(Clone, Eq, PartialEq, PartialOrd)]
pub enum ContentDigest {
    Md5(Vec<u8>),
    Sha1(Vec<u8>),
    Sha256(Vec<u8>),
    Sha512(Vec<u8>),
}

impl std::fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({})",
            self.checksum_type().field_name(),
            self.digest_hex()
        )
    }
}

impl ContentDigest {
    /// Obtain the digest bytes for this content digest.
    pub fn digest_bytes(&self) -> &[u8] {
        match self {
            Self::Md5(x) => x,
            Self::Sha1(x) => x,
            Self::Sha256(x) => x,
            Self::Sha512(x) => x,
        }
    }

    /// Obtain the hex encoded content digest.
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest_bytes())
    }

    /// Obtain the [ChecksumType] for this digest.
    pub fn checksum_type(&self) -> ChecksumType {
        match self {
            Self::Md5(_) => ChecksumType::Md5,
            Self::Sha1(_) => ChecksumType::Sha1,
            Self::Sha256(_) => ChecksumType::Sha256,
            Self::Sha512(_) => ChecksumType::Sha512,
        }
    }
}

/// Holds every flavor of content digest plus the content size.
#[derive(Clone, Debug)]
pub struct MultiContentDigest {
    pub size: u64,
    pub md5: ContentDigest,
    pub sha1: ContentDigest,
    pub sha256: ContentDigest,
    pub sha512: ContentDigest,
}

impl MultiContentDigest {
    /// Compute digests of an in-memory buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut digester = MultiDigester::default();
        digester.update(data);
        digester.finish()
    }

    /// Compute digests of a file on the filesystem.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut fh = std::fs::File::open(path)
            .map_err(|e| DebS3Error::RepositoryIoPath(format!("{}", path.display()), e))?;
        let mut digester = MultiDigester::default();
        std::io::copy(&mut fh, &mut digester)
            .map_err(|e| DebS3Error::RepositoryIoPath(format!("{}", path.display()), e))?;

        Ok(digester.finish())
    }

    /// Obtain the [ContentDigest] for a given [ChecksumType].
    pub fn digest_from_checksum(&self, checksum: ChecksumType) -> &ContentDigest {
        match checksum {
            ChecksumType::Md5 => &self.md5,
            ChecksumType::Sha1 => &self.sha1,
            ChecksumType::Sha256 => &self.sha256,
            ChecksumType::Sha512 => &self.sha512,
        }
    }

    /// Reduce to the checksums recorded in `Release` files.
    pub fn file_checksums(&self) -> FileChecksums {
        FileChecksums {
            size: self.size,
            md5: self.md5.digest_hex(),
            sha1: self.sha1.digest_hex(),
            sha256: self.sha256.digest_hex(),
        }
    }
}

/// A content digester that simultaneously computes multiple digest types.
pub struct MultiDigester {
    size: u64,
    md5: md5::Md5,
    sha1: sha1::Sha1,
    sha256: sha2::Sha256,
    sha512: sha2::Sha512,
}

impl Default for MultiDigester {
    fn default() -> Self {
        Self {
            size: 0,
            md5: md5::Md5::new(),
            sha1: sha1::Sha1::new(),
            sha256: sha2::Sha256::new(),
            sha512: sha2::Sha512::new(),
        }
    }
}

impl MultiDigester {
    /// Write content into the digesters.
    pub fn update(&mut self, data: &[u8]) {
        self.size += data.len() as u64;
        self.md5.update(data);
        self.sha1.update(data);
        self.sha256.update(data);
        self.sha512.update(data);
    }

    /// Finish digesting content.
    pub fn finish(self) -> MultiContentDigest {
        MultiContentDigest {
            size: self.size,
            md5: ContentDigest::Md5(self.md5.finalize().to_vec()),
            sha1: ContentDigest::Sha1(self.sha1.finalize().to_vec()),
            sha256: ContentDigest::Sha256(self.sha256.finalize().to_vec()),
            sha512: ContentDigest::Sha512(self.sha512.finalize().to_vec()),
        }
    }
}

impl Write for MultiDigester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Size and hex digests of a published index file, as listed in `Release` files.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FileChecksums {
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

impl FileChecksums {
    /// Obtain the hex digest for a checksum flavor.
    ///
    /// [ChecksumType::Sha512] is not tracked and yields [None].
    pub fn digest_hex(&self, checksum: ChecksumType) -> Option<&str> {
        match checksum {
            ChecksumType::Md5 => Some(&self.md5),
            ChecksumType::Sha1 => Some(&self.sha1),
            ChecksumType::Sha256 => Some(&self.sha256),
            ChecksumType::Sha512 => None,
        }
    }

    /// Set the hex digest for a checksum flavor.
    pub fn set_digest_hex(&mut self, checksum: ChecksumType, digest: String) {
        match checksum {
            ChecksumType::Md5 => self.md5 = digest,
            ChecksumType::Sha1 => self.sha1 = digest,
            ChecksumType::Sha256 => self.sha256 = digest,
            ChecksumType::Sha512 => {}
        }
    }
}

/// Obtain the `by-hash` variant of a repository path.
///
/// `dists/stable/main/binary-amd64/Packages` becomes
/// `dists/stable/main/binary-amd64/by-hash/SHA256/<digest>`.
pub fn by_hash_path(path: &str, checksum: ChecksumType, digest_hex: &str) -> String {
    if let Some((prefix, _)) = path.rsplit_once('/') {
        format!("{}/by-hash/{}/{}", prefix, checksum.field_name(), digest_hex)
    } else {
        format!("by-hash/{}/{}", checksum.field_name(), digest_hex)
    }
}

/// Gzip compress a buffer.
pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = libflate::gzip::Encoder::new(Vec::new())?;
    encoder.write_all(data)?;

    Ok(encoder.finish().into_result()?)
}
