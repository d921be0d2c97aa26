// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reading and writing `.deb` archives.

A `.deb` is an `ar` archive holding a `debian-binary` version marker, a
`control.tar[.ext]` archive with package metadata, and a `data.tar[.ext]`
archive with installed files. Only the `control` file inside the control
archive is of interest when publishing.
*/

use {
    crate::{
        control::ControlParagraph,
        error::{DebS3Error, Result},
    },
    std::{
        io::{Read, Write},
        path::Path,
    },
};

/// Compression format of `.deb` tar members.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DebCompression {
    /// Uncompressed (`.tar`).
    Uncompressed,
    /// Gzip (`.tar.gz`).
    Gzip,
    /// XZ (`.tar.xz`).
    Xz,
    /// Zstandard with compression level (`.tar.zst`).
    Zstandard(i32),
}

impl DebCompression {
    /// Filename extension for tar members compressed in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Uncompressed => "",
            Self::Gzip => ".gz",
            Self::Xz => ".xz",
            Self::Zstandard(_) => ".zst",
        }
    }

    /// Resolve the compression of a `<prefix>.tar[.ext]` member name.
    pub fn from_member_name(prefix: &str, name: &str) -> Result<Self> {
        let tar_name = format!("{}.tar", prefix);

        match name.strip_prefix(&tar_name) {
            Some("") => Ok(Self::Uncompressed),
            Some(".gz") => Ok(Self::Gzip),
            Some(".xz") => Ok(Self::Xz),
            Some(".zst") => Ok(Self::Zstandard(3)),
            _ => Err(DebS3Error::DebUnknownCompression(name.to_string())),
        }
    }

    /// Compress a buffer.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Uncompressed => data.to_vec(),
            Self::Gzip => crate::io::gzip_compress(data)?,
            Self::Xz => {
                let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
                encoder.write_all(data)?;
                encoder.finish()?
            }
            Self::Zstandard(level) => zstd::encode_all(data, *level)?,
        })
    }

    /// Wrap a reader with transparent decompression.
    pub fn decompress_reader<'a>(&self, reader: impl Read + 'a) -> Result<Box<dyn Read + 'a>> {
        Ok(match self {
            Self::Uncompressed => Box::new(reader),
            Self::Gzip => Box::new(libflate::gzip::Decoder::new(reader)?),
            Self::Xz => Box::new(xz2::read::XzDecoder::new(reader)),
            Self::Zstandard(_) => Box::new(zstd::stream::read::Decoder::new(reader)?),
        })
    }
}

/// Read the `control` stanza from a `.deb` archive.
pub fn read_control_paragraph(reader: impl Read) -> Result<ControlParagraph<'static>> {
    let mut archive = ar::Archive::new(reader);

    while let Some(entry) = archive.next_entry() {
        let entry = entry?;
        let name = String::from_utf8_lossy(entry.header().identifier()).to_string();

        if !name.starts_with("control.tar") {
            continue;
        }

        let compression = DebCompression::from_member_name("control", &name)?;
        let mut tar = tar::Archive::new(compression.decompress_reader(entry)?);

        for tar_entry in tar.entries()? {
            let mut tar_entry = tar_entry?;
            let path = tar_entry.path()?.into_owned();

            if path.as_path() == Path::new("./control") || path.as_path() == Path::new("control") {
                let mut data = String::new();
                tar_entry.read_to_string(&mut data)?;

                return ControlParagraph::parse_str(&data);
            }
        }

        return Err(DebS3Error::DebControlFileMissing);
    }

    Err(DebS3Error::DebMissingControl)
}

/// Read the `control` stanza from a `.deb` file on the filesystem.
pub fn read_control_paragraph_from_path(path: &Path) -> Result<ControlParagraph<'static>> {
    let fh = std::fs::File::open(path)
        .map_err(|e| DebS3Error::RepositoryIoPath(format!("{}", path.display()), e))?;

    read_control_paragraph(std::io::BufReader::new(fh))
}

fn append_tar_file(builder: &mut tar::Builder<impl Write>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_uid(0);
    header.set_gid(0);
    header.set_username("root")?;
    header.set_groupname("root")?;
    header.set_path(path)?;
    header.set_mode(0o644);
    header.set_size(data.len() as _);
    header.set_cksum();
    builder.append(&header, data)?;

    Ok(())
}

/// Write a minimal `.deb` archive holding a control stanza and installed files.
///
/// `files` are `(relative path, content)` pairs placed in `data.tar`.
pub fn write_deb<W: Write>(
    writer: W,
    control: &ControlParagraph,
    files: &[(&str, &[u8])],
    compression: DebCompression,
) -> Result<()> {
    let mut ar_builder = ar::Builder::new(writer);

    let data: &[u8] = b"2.0\n";
    let mut header = ar::Header::new(b"debian-binary".to_vec(), data.len() as _);
    header.set_mode(0o644);
    ar_builder.append(&header, data)?;

    let mut control_tar = tar::Builder::new(Vec::new());
    append_tar_file(&mut control_tar, "./control", control.to_string().as_bytes())?;
    let control_tar = compression.compress(&control_tar.into_inner()?)?;

    let mut header = ar::Header::new(
        format!("control.tar{}", compression.extension()).into_bytes(),
        control_tar.len() as _,
    );
    header.set_mode(0o644);
    ar_builder.append(&header, &*control_tar)?;

    let mut data_tar = tar::Builder::new(Vec::new());
    for (path, content) in files {
        append_tar_file(&mut data_tar, &format!("./{}", path), content)?;
    }
    let data_tar = compression.compress(&data_tar.into_inner()?)?;

    let mut header = ar::Header::new(
        format!("data.tar{}", compression.extension()).into_bytes(),
        data_tar.len() as _,
    );
    header.set_mode(0o644);
    ar_builder.append(&header, &*data_tar)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> ControlParagraph<'static> {
        let mut p = ControlParagraph::default();
        p.set_field_from_string("Package".into(), "mypackage".into());
        p.set_field_from_string("Version".into(), "1:0.1-2".into());
        p.set_field_from_string("Architecture".into(), "amd64".into());
        p.set_field_from_string("Description".into(), "summary\nlong text".into());
        p
    }

    #[test]
    fn control_round_trip_all_compressions() -> Result<()> {
        for compression in [
            DebCompression::Uncompressed,
            DebCompression::Gzip,
            DebCompression::Xz,
            DebCompression::Zstandard(3),
        ] {
            let mut buffer = vec![];
            write_deb(
                &mut buffer,
                &control(),
                &[("usr/bin/myapp", &b"#!/bin/sh\n"[..])],
                compression,
            )?;

            let p = read_control_paragraph(std::io::Cursor::new(buffer))?;
            assert_eq!(p.field_str("Package"), Some("mypackage"));
            assert_eq!(p.field_str("Version"), Some("1:0.1-2"));
            assert_eq!(p.field_str("Description"), Some("summary\nlong text"));
        }

        Ok(())
    }

    #[test]
    fn member_compression() {
        assert_eq!(
            DebCompression::from_member_name("control", "control.tar.xz").unwrap(),
            DebCompression::Xz
        );
        assert!(DebCompression::from_member_name("control", "control.tar.bz2").is_err());
    }

    #[test]
    fn missing_control_member() {
        let mut buffer = vec![];
        {
            let mut builder = ar::Builder::new(&mut buffer);
            let data: &[u8] = b"2.0\n";
            let header = ar::Header::new(b"debian-binary".to_vec(), data.len() as _);
            builder.append(&header, data).unwrap();
        }

        assert!(matches!(
            read_control_paragraph(std::io::Cursor::new(buffer)),
            Err(DebS3Error::DebMissingControl)
        ));
    }
}
