// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Debian repositories hosted on object storage.

This crate publishes `.deb` packages into an apt repository whose files live in
an object store such as S3, without any server side component. It reads and
rewrites the repository's `Packages` indices and `Release` file in place.

# A Tour of Functionality

[package::Package] represents a binary package, as read from a `.deb` file with
[package::Package::parse_file()] or from a stanza of a `Packages` index. The
low-level control paragraph primitives it is built on live in the [control]
module and `.deb` archive handling lives in [deb].

[manifest::Manifest] is the `Packages` index of a single codename, component,
and architecture. [release::Release] is the `Release` file of a codename, which
records the checksums of every published index.

Storage is abstracted by the [store::ObjectStore] trait.
[store::s3::S3ObjectStore] talks to S3 (feature `s3`),
[store::filesystem::FilesystemObjectStore] writes to a local directory, and
[store::MemoryObjectStore] keeps everything in memory.

Concurrent publishers coordinate through a sentinel object, see [lock].

[publish::Publisher] ties everything together and implements the repository
operations: uploading, deleting, verifying, listing, and mirroring packages.
`Release` files can be signed through the [signing::ReleaseSigner] trait.

[mirror::PackageSource] supplies packages of an upstream distribution to
mirror. [mirror::HttpMirror] (feature `http`) reads one over HTTP.
*/

pub mod config;
pub mod control;
pub mod deb;
pub mod error;
pub mod io;
pub mod lock;
pub mod manifest;
pub mod mirror;
pub mod package;
pub mod publish;
pub mod release;
pub mod signing;
pub mod store;
