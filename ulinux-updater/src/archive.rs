// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Unpacking and authenticating update containers.
//!
//! An update container is a tar archive with two members: the firmware image (`image.img`) and a
//! base64-encoded detached RSA signature over it (`signature.txt`), produced with SHA-512 and
//! PKCS #1 v1.5 padding. The signature is checked against the signing authority's public key,
//! independently of whichever TLS peer delivered the container.

use std::{collections::BTreeMap, io};

use bytes::Bytes;
use openssl::{
    hash::MessageDigest,
    pkey::{PKey, Private, Public},
    sign::Signer,
};
use tracing::instrument;

use crate::error::ArchiveError;

/// The container member holding the firmware image.
pub const IMAGE_MEMBER: &str = "image.img";
/// The container member holding the base64-encoded detached signature.
pub const SIGNATURE_MEMBER: &str = "signature.txt";

/// The regular-file members of a decoded container, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Container {
    members: BTreeMap<String, Bytes>,
}

impl Container {
    /// Decode a fully buffered tar archive.
    ///
    /// Members may appear in any order. Directories, links, and other special entries are
    /// skipped. A leading `./` is dropped from member names, and if a name repeats the last
    /// entry wins. Members share `data`'s buffer rather than copying out of it.
    pub fn decode(data: &Bytes) -> Result<Self, ArchiveError> {
        let mut archive = tar::Archive::new(data.as_ref());
        let mut members = BTreeMap::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry.path()?.to_string_lossy().into_owned();
            let name = name.strip_prefix("./").unwrap_or(&name).to_string();
            let start = usize::try_from(entry.raw_file_position()).ok();
            let size = usize::try_from(entry.size()).ok();
            let range = match (start, size) {
                (Some(start), Some(size))
                    if start.checked_add(size).is_some_and(|end| end <= data.len()) =>
                {
                    start..start + size
                }
                _ => {
                    return Err(ArchiveError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("member {name} runs past the end of the container"),
                    )));
                }
            };
            tracing::trace!(name = %name, size = range.len(), "Read container member");
            members.insert(name, data.slice(range));
        }

        Ok(Self { members })
    }

    pub fn member(&self, name: &str) -> Option<&Bytes> {
        self.members.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }
}

/// An image whose detached signature checked out.
///
/// The only way to get one is [`Verifier::verify`].
#[derive(Debug, Clone)]
pub struct VerifiedImage {
    image: Bytes,
    signature: Bytes,
}

impl VerifiedImage {
    pub fn image(&self) -> &Bytes {
        &self.image
    }

    /// The raw signature bytes the image was verified with.
    pub fn signature(&self) -> &Bytes {
        &self.signature
    }

    pub fn into_image(self) -> Bytes {
        self.image
    }
}

/// Checks update containers against the signing authority's public key.
#[derive(Clone)]
pub struct Verifier {
    key: PKey<Public>,
}

impl Verifier {
    pub fn new(key: PKey<Public>) -> Self {
        Self { key }
    }

    /// Decode `data` as a container and verify it.
    #[instrument(skip_all, err, fields(size = data.len()))]
    pub fn verify_container(&self, data: &Bytes) -> Result<VerifiedImage, ArchiveError> {
        let container = Container::decode(data)?;
        self.verify(&container)
    }

    /// Verify the image in `container` against its detached signature.
    ///
    /// Both members must be present before any cryptographic work happens.
    pub fn verify(&self, container: &Container) -> Result<VerifiedImage, ArchiveError> {
        let image = container.member(IMAGE_MEMBER);
        let signature_text = container.member(SIGNATURE_MEMBER);
        let (image, signature_text) = match (image, signature_text) {
            (Some(image), Some(signature_text)) => (image, signature_text),
            (None, _) => {
                return Err(ArchiveError::Malformed {
                    missing: IMAGE_MEMBER,
                });
            }
            (_, None) => {
                return Err(ArchiveError::Malformed {
                    missing: SIGNATURE_MEMBER,
                });
            }
        };

        // Signatures wrapped onto multiple lines are common; OpenSSL's decoder wants one line.
        let signature_text = std::str::from_utf8(signature_text)
            .map_err(|_| ArchiveError::SignatureEncoding)?
            .split_ascii_whitespace()
            .collect::<String>();
        let signature = openssl::base64::decode_block(&signature_text)
            .map_err(|_| ArchiveError::SignatureEncoding)?;

        let mut verifier = openssl::sign::Verifier::new(MessageDigest::sha512(), &self.key)?;
        verifier.update(image)?;
        match verifier.verify(&signature) {
            Ok(true) => {
                tracing::info!(size = image.len(), "Image signature verified");
                Ok(VerifiedImage {
                    image: image.clone(),
                    signature: Bytes::from(signature),
                })
            }
            Ok(false) => Err(ArchiveError::Verification),
            Err(error) => {
                // OpenSSL reports some malformed signatures (e.g. the wrong length) as errors
                // rather than a failed check; either way the image is not authentic.
                tracing::debug!(?error, "OpenSSL rejected the signature");
                Err(ArchiveError::Verification)
            }
        }
    }
}

/// Sign `image` the way [`Verifier`] expects: SHA-512, PKCS #1 v1.5, base64 on one line.
pub fn sign_image(key: &PKey<Private>, image: &[u8]) -> Result<String, ArchiveError> {
    let mut signer = Signer::new(MessageDigest::sha512(), key)?;
    signer.update(image)?;
    Ok(openssl::base64::encode_block(&signer.sign_to_vec()?))
}

/// Pack `members` into a tar archive, in order.
pub fn build_container(members: &[(&str, &[u8])]) -> Result<Vec<u8>, ArchiveError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents)?;
    }
    Ok(builder.into_inner()?)
}

/// Build a complete update container for `image`, signed with `key`.
pub fn signed_container(key: &PKey<Private>, image: &[u8]) -> Result<Vec<u8>, ArchiveError> {
    let signature = sign_image(key, image)?;
    build_container(&[
        (IMAGE_MEMBER, image),
        (SIGNATURE_MEMBER, signature.as_bytes()),
    ])
}

#[cfg(test)]
pub(crate) mod tests {
    use openssl::rsa::Rsa;

    use super::*;

    pub(crate) fn signing_key() -> PKey<Private> {
        PKey::from_rsa(Rsa::generate(2048).expect("RSA key generation")).expect("wrap RSA key")
    }

    pub(crate) fn public_key(key: &PKey<Private>) -> PKey<Public> {
        let pem = key.public_key_to_pem().expect("public key PEM");
        PKey::public_key_from_pem(&pem).expect("public key")
    }

    pub(crate) fn sign(key: &PKey<Private>, image: &[u8]) -> String {
        sign_image(key, image).expect("sign image")
    }

    pub(crate) fn container(members: &[(&str, &[u8])]) -> Bytes {
        build_container(members).expect("build container").into()
    }

    pub(crate) fn signed(key: &PKey<Private>, image: &[u8]) -> Bytes {
        signed_container(key, image).expect("sign container").into()
    }

    #[test]
    fn signed_image_verifies() -> anyhow::Result<()> {
        let key = signing_key();
        let image = b"firmware image contents".repeat(1000);
        let verifier = Verifier::new(public_key(&key));

        let verified = verifier.verify_container(&signed(&key, &image))?;
        assert_eq!(verified.image().as_ref(), image.as_slice());
        assert_eq!(verified.signature().len(), 256);
        Ok(())
    }

    #[test]
    fn altered_image_fails() -> anyhow::Result<()> {
        let key = signing_key();
        let image = b"firmware image contents".to_vec();
        let signature = sign(&key, &image);
        let mut tampered = image.clone();
        tampered[3] ^= 0x01;

        let data = container(&[
            (IMAGE_MEMBER, tampered.as_slice()),
            (SIGNATURE_MEMBER, signature.as_bytes()),
        ]);
        let result = Verifier::new(public_key(&key)).verify_container(&data);
        assert!(matches!(result, Err(ArchiveError::Verification)));
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> anyhow::Result<()> {
        let key = signing_key();
        let other_key = signing_key();
        let data = signed(&key, b"image");
        let result = Verifier::new(public_key(&other_key)).verify_container(&data);
        assert!(matches!(result, Err(ArchiveError::Verification)));
        Ok(())
    }

    // The signature member may come before or after the image.
    #[test]
    fn member_order_is_irrelevant() -> anyhow::Result<()> {
        let key = signing_key();
        let image = b"ordered image".as_slice();
        let signature = sign(&key, image);
        let verifier = Verifier::new(public_key(&key));

        let image_first = container(&[
            (IMAGE_MEMBER, image),
            (SIGNATURE_MEMBER, signature.as_bytes()),
        ]);
        let signature_first = container(&[
            (SIGNATURE_MEMBER, signature.as_bytes()),
            (IMAGE_MEMBER, image),
        ]);
        let first = verifier.verify_container(&image_first)?;
        let second = verifier.verify_container(&signature_first)?;
        assert_eq!(first.image(), second.image());
        assert_eq!(first.signature(), second.signature());
        Ok(())
    }

    #[test]
    fn missing_signature_is_malformed() {
        let data = container(&[(IMAGE_MEMBER, b"image".as_slice())]);
        let key = signing_key();
        match Verifier::new(public_key(&key)).verify_container(&data) {
            Err(ArchiveError::Malformed { missing }) => assert_eq!(missing, SIGNATURE_MEMBER),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    // A garbage signature would fail base64 decoding if it were ever looked at; it must not be
    // when the image is absent.
    #[test]
    fn missing_image_is_malformed() {
        let data = container(&[(SIGNATURE_MEMBER, b"!!not base64!!".as_slice())]);
        let key = signing_key();
        match Verifier::new(public_key(&key)).verify_container(&data) {
            Err(ArchiveError::Malformed { missing }) => assert_eq!(missing, IMAGE_MEMBER),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_input_is_malformed() {
        let key = signing_key();
        assert!(matches!(
            Verifier::new(public_key(&key)).verify_container(&Bytes::new()),
            Err(ArchiveError::Malformed { .. })
        ));
    }

    #[test]
    fn bad_base64_signature() {
        let data = container(&[
            (IMAGE_MEMBER, b"image".as_slice()),
            (SIGNATURE_MEMBER, b"%%%%".as_slice()),
        ]);
        let key = signing_key();
        assert!(matches!(
            Verifier::new(public_key(&key)).verify_container(&data),
            Err(ArchiveError::SignatureEncoding)
        ));
    }

    #[test]
    fn wrapped_signature_text() -> anyhow::Result<()> {
        let key = signing_key();
        let image = b"wrapped".as_slice();
        let signature = sign(&key, image);
        let wrapped = signature
            .as_bytes()
            .chunks(64)
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect::<Vec<_>>()
            .join("\n")
            + "\n";
        let data = container(&[(IMAGE_MEMBER, image), (SIGNATURE_MEMBER, wrapped.as_bytes())]);
        Verifier::new(public_key(&key)).verify_container(&data)?;
        Ok(())
    }

    #[test]
    fn extra_members_and_dot_prefix() -> anyhow::Result<()> {
        let key = signing_key();
        let image = b"dotted".as_slice();
        let signature = sign(&key, image);
        let data = container(&[
            ("README", b"notes".as_slice()),
            ("./image.img", image),
            ("./signature.txt", signature.as_bytes()),
        ]);
        let container = Container::decode(&data)?;
        assert_eq!(
            container.names().collect::<Vec<_>>(),
            vec!["README", IMAGE_MEMBER, SIGNATURE_MEMBER]
        );
        Verifier::new(public_key(&key)).verify(&container)?;
        Ok(())
    }

    #[test]
    fn members_share_the_input_buffer() -> anyhow::Result<()> {
        let key = signing_key();
        let image = b"shared image".repeat(100);
        let data = signed(&key, &image);

        let container = Container::decode(&data)?;
        let member = container.member(IMAGE_MEMBER).expect("image member");
        assert_eq!(member.as_ref(), image.as_slice());
        let input = data.as_ptr_range();
        assert!(input.contains(&member.as_ptr()));
        assert!(member.as_ptr_range().end <= input.end);
        Ok(())
    }

    #[test]
    fn truncated_member_is_rejected() {
        let key = signing_key();
        let data = signed(&key, &[0x5a; 4096]);
        let truncated = data.slice(..1024);
        assert!(matches!(
            Container::decode(&truncated),
            Err(ArchiveError::Read(_))
        ));
    }
}
