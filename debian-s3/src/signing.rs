// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of `Release` files. */

use {
    crate::error::{DebS3Error, Result},
    log::debug,
    std::{
        io::Write,
        process::{Command, Stdio},
    },
};

/// Produces PGP signatures over `Release` content.
///
/// Returning [None] means no signature was produced.
pub trait ReleaseSigner: Send + Sync {
    /// Produce an armored detached signature, as stored in `Release.gpg`.
    fn sign_detached(&self, data: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Produce a cleartext signed document, as stored in `InRelease`.
    fn clearsign(&self, data: &[u8]) -> Result<Option<Vec<u8>>>;
}

/// A [ReleaseSigner] invoking the `gpg` executable.
#[derive(Clone, Debug)]
pub struct GpgSigner {
    program: String,
    key: Option<String>,
    extra_args: Vec<String>,
}

impl GpgSigner {
    /// Construct an instance signing with the given key.
    ///
    /// An empty or missing key signs with GPG's default key.
    pub fn new(key: Option<&str>, extra_args: Vec<String>) -> Self {
        Self {
            program: "gpg".to_string(),
            key: key.filter(|x| !x.is_empty()).map(|x| x.to_string()),
            extra_args,
        }
    }

    /// Use a different executable than `gpg`.
    pub fn program(mut self, program: impl ToString) -> Self {
        self.program = program.to_string();
        self
    }

    /// Arguments passed to the executable for a signing mode flag.
    pub fn arguments(&self, mode: &str) -> Vec<String> {
        let mut args = vec!["--batch".to_string(), "--armor".to_string()];
        if let Some(key) = &self.key {
            args.push("--default-key".to_string());
            args.push(key.clone());
        }
        args.push("--digest-algo".to_string());
        args.push("SHA256".to_string());
        args.extend(self.extra_args.iter().cloned());
        args.push(mode.to_string());

        args
    }

    fn run(&self, mode: &str, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let args = self.arguments(mode);
        debug!("running {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DebS3Error::SigningFailed(format!("unable to run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data)?;
        }

        let output = child.wait_with_output()?;

        if !output.status.success() {
            return Err(DebS3Error::SigningFailed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(Some(output.stdout))
    }
}

impl ReleaseSigner for GpgSigner {
    fn sign_detached(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.run("--detach-sign", data)
    }

    fn clearsign(&self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        self.run("--clearsign", data)
    }
}
