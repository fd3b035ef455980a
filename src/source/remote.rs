//! Registry-backed layer source.
//!
//! Speaks the OCI distribution protocol through `oci-client` with
//! anonymous auth. Manifest lists are resolved to the invoking platform
//! (linux plus the host architecture). Blobs are fetched whole, verified
//! against their manifest digest, and handed to the unpacker through a
//! lazy decompressor chosen by media type.
//!
//! The async transport is an implementation detail: this type owns a
//! current-thread tokio runtime and blocks on it, so the rest of the
//! pipeline stays synchronous.

use std::io::{Cursor, Read};

use flate2::read::GzDecoder;
use oci_client::Reference;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::{OciImageManifest, OciManifest};
use oci_client::secrets::RegistryAuth;
use sha2::{Digest, Sha256};
use zstd::stream::read::Decoder as ZstdDecoder;

use super::{Layer, LayerSource, ResolvedImage, validate_digest};
use crate::error::{Result, StoreError};

/// Layer source backed by an OCI/Docker registry.
pub struct RemoteSource {
    reference: Reference,
    client: oci_client::Client,
    runtime: tokio::runtime::Runtime,
    os: &'static str,
    arch: &'static str,
}

impl std::fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSource")
            .field("reference", &self.reference)
            .field("os", &self.os)
            .field("arch", &self.arch)
            .finish()
    }
}

impl RemoteSource {
    /// Create a source for a registry reference.
    pub fn new(reference: Reference) -> Result<Self> {
        let client = oci_client::Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (os, arch) = default_platform();
        Ok(Self {
            reference,
            client,
            runtime,
            os,
            arch,
        })
    }

    fn fetch_err(
        what: impl Into<String>,
        e: impl std::error::Error + Send + Sync + 'static,
    ) -> StoreError {
        StoreError::FetchTransport {
            what: what.into(),
            source: Box::new(e),
        }
    }

    /// Pull the image manifest, descending through a manifest list to the
    /// entry matching our platform.
    fn pull_image_manifest(&self) -> Result<(OciImageManifest, Reference)> {
        let (manifest, _digest) = self
            .runtime
            .block_on(
                self.client
                    .pull_manifest(&self.reference, &RegistryAuth::Anonymous),
            )
            .map_err(|e| Self::fetch_err(format!("manifest for {}", self.reference), e))?;

        match manifest {
            OciManifest::Image(image) => Ok((image, self.reference.clone())),
            OciManifest::ImageIndex(index) => {
                let descriptor = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform.as_ref().is_some_and(|p| {
                            p.os == self.os && p.architecture == self.arch
                        })
                    })
                    .ok_or_else(|| StoreError::ReferenceInvalid {
                        reference: self.reference.to_string(),
                        reason: format!("no manifest for {}/{}", self.os, self.arch),
                    })?;

                let platform_ref = self
                    .reference
                    .clone_with_digest(descriptor.digest.clone());
                let (inner, _inner_digest) = self
                    .runtime
                    .block_on(
                        self.client
                            .pull_manifest(&platform_ref, &RegistryAuth::Anonymous),
                    )
                    .map_err(|e| {
                        Self::fetch_err(format!("platform manifest {}", descriptor.digest), e)
                    })?;
                match inner {
                    OciManifest::Image(image) => Ok((image, platform_ref)),
                    OciManifest::ImageIndex(_) => Err(StoreError::ReferenceInvalid {
                        reference: self.reference.to_string(),
                        reason: "nested manifest index".into(),
                    }),
                }
            }
        }
    }
}

impl LayerSource for RemoteSource {
    fn manifest(&self) -> Result<ResolvedImage> {
        let span = tracing::debug_span!("manifest", reference = %self.reference);
        let _entered = span.enter();

        let (manifest, platform_ref) = self.pull_image_manifest()?;

        let mut config = Vec::new();
        self.runtime
            .block_on(
                self.client
                    .pull_blob(&platform_ref, &manifest.config, &mut config),
            )
            .map_err(|e| Self::fetch_err(format!("config {}", manifest.config.digest), e))?;

        let layers = manifest
            .layers
            .iter()
            .map(|descriptor| {
                validate_digest(&descriptor.digest)?;
                Ok(Layer {
                    digest: descriptor.digest.clone(),
                    size: descriptor.size.max(0) as u64,
                    media_type: descriptor.media_type.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(layers = layers.len(), "manifest resolved");
        Ok(ResolvedImage { config, layers })
    }

    fn blob(&self, layer: &Layer) -> Result<Box<dyn Read + Send>> {
        let span = tracing::debug_span!("blob", digest = %layer.digest);
        let _entered = span.enter();

        let descriptor = oci_client::manifest::OciDescriptor {
            digest: layer.digest.clone(),
            media_type: layer.media_type.clone(),
            size: layer.size as i64,
            ..Default::default()
        };

        let mut data = Vec::with_capacity(layer.size as usize);
        self.runtime
            .block_on(self.client.pull_blob(&self.reference, &descriptor, &mut data))
            .map_err(|e| Self::fetch_err(format!("layer {}", layer.digest), e))?;

        verify_blob_digest(&data, &layer.digest)?;
        decode_layer(data, &layer.media_type, &layer.digest)
    }
}

/// Hash the fetched bytes and compare against the manifest digest.
fn verify_blob_digest(data: &[u8], digest: &str) -> Result<()> {
    validate_digest(digest)?;
    let (algorithm, expected) = digest.split_once(':').expect("validated digest");
    if algorithm != "sha256" {
        return Err(StoreError::LayerCorrupt {
            digest: digest.to_string(),
            reason: format!("unsupported digest algorithm `{algorithm}`"),
        });
    }
    let actual = format!("{:x}", Sha256::digest(data));
    if actual != expected {
        return Err(StoreError::LayerCorrupt {
            digest: digest.to_string(),
            reason: format!("content hashed to sha256:{actual}"),
        });
    }
    Ok(())
}

/// Wrap verified blob bytes in the decompressor its media type calls for.
fn decode_layer(
    data: Vec<u8>,
    media_type: &str,
    digest: &str,
) -> Result<Box<dyn Read + Send>> {
    let cursor = Cursor::new(data);
    if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
        return Ok(Box::new(GzDecoder::new(cursor)));
    }
    if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
        let decoder = ZstdDecoder::new(cursor).map_err(StoreError::Io)?;
        return Ok(Box::new(decoder));
    }
    if media_type.ends_with(".tar") || media_type.ends_with("+tar") {
        return Ok(Box::new(cursor));
    }
    Err(StoreError::LayerCorrupt {
        digest: digest.to_string(),
        reason: format!("unsupported layer media type `{media_type}`"),
    })
}

/// The platform used to resolve manifest lists.
fn default_platform() -> (&'static str, &'static str) {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    ("linux", arch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn digest_of(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    #[test]
    fn digest_verification_accepts_matching_content() {
        let data = b"layer bytes";
        verify_blob_digest(data, &format!("sha256:{}", digest_of(data))).unwrap();
    }

    #[test]
    fn digest_verification_rejects_mismatch() {
        let err =
            verify_blob_digest(b"tampered", &format!("sha256:{}", "00".repeat(32))).unwrap_err();
        assert!(matches!(err, StoreError::LayerCorrupt { .. }));
    }

    #[test]
    fn digest_verification_rejects_unknown_algorithm() {
        let err = verify_blob_digest(b"x", "md5:d41d8cd98f00b204e9800998ecf8427e").unwrap_err();
        assert!(matches!(err, StoreError::LayerCorrupt { .. }));
    }

    #[test]
    fn gzip_layers_are_decoded() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"tar bytes").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut reader = decode_layer(
            compressed,
            "application/vnd.oci.image.layer.v1.tar+gzip",
            "sha256:00",
        )
        .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tar bytes");
    }

    #[test]
    fn zstd_layers_are_decoded() {
        let compressed = zstd::encode_all(&b"tar bytes"[..], 0).unwrap();
        let mut reader = decode_layer(
            compressed,
            "application/vnd.oci.image.layer.v1.tar+zstd",
            "sha256:00",
        )
        .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"tar bytes");
    }

    #[test]
    fn plain_tar_layers_pass_through() {
        let mut reader = decode_layer(
            b"raw".to_vec(),
            "application/vnd.oci.image.layer.v1.tar",
            "sha256:00",
        )
        .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"raw");
    }

    #[test]
    fn docker_gzip_media_type_is_recognized() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"docker layer").unwrap();
        let compressed = encoder.finish().unwrap();

        let mut reader = decode_layer(
            compressed,
            "application/vnd.docker.image.rootfs.diff.tar.gzip",
            "sha256:00",
        )
        .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"docker layer");
    }

    #[test]
    fn unknown_media_type_is_rejected() {
        let result = decode_layer(vec![], "application/octet-stream", "sha256:00");
        assert!(matches!(result, Err(StoreError::LayerCorrupt { .. })));
    }
}
