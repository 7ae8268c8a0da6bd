//! Bundle manifest encodings.
//!
//! A pushed bundle is three pieces of content in the target repository:
//!
//! ```text
//!   index (tagged) ──► config manifest ──► config blob (canonical bundle.json)
//!                  ├─► invocation image manifests
//!                  └─► component image manifests
//! ```
//!
//! Registries differ in which media types they accept, so the encoding is
//! selected by [`ManifestFormat`].

use std::collections::BTreeMap;

use cnab_push_core::error::{PushError, Result};
use serde::Serialize;

use crate::bundle::{Bundle, BundleImage, ImageSlot};
use crate::registry::{media_types, Descriptor};

/// Annotation keys written on the bundle index and its entries.
pub mod annotations {
    pub const MANIFEST_TYPE: &str = "io.cnab.manifest.type";
    pub const COMPONENT_NAME: &str = "io.cnab.component.name";
    pub const RUNTIME_VERSION: &str = "io.cnab.runtime_version";
    pub const KEYWORDS: &str = "io.cnab.keywords";
    pub const ARTIFACT_TYPE: &str = "org.opencontainers.artifactType";
    pub const TITLE: &str = "org.opencontainers.image.title";
    pub const VERSION: &str = "org.opencontainers.image.version";
    pub const DESCRIPTION: &str = "org.opencontainers.image.description";

    pub const TYPE_CONFIG: &str = "config";
    pub const TYPE_INVOCATION: &str = "invocation";
    pub const TYPE_COMPONENT: &str = "component";
}

/// How the bundle is laid out in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestFormat {
    /// CNAB config media type inside an OCI manifest, OCI index
    CnabNative,
    /// Standard OCI image config media type, OCI index
    OciIndex,
    /// Docker schema 2 manifest and manifest list, no annotations
    DockerManifestList,
}

impl ManifestFormat {
    /// Every format, most specific first.
    pub const ALL: [ManifestFormat; 3] = [
        ManifestFormat::CnabNative,
        ManifestFormat::OciIndex,
        ManifestFormat::DockerManifestList,
    ];

    /// Formats to attempt, in order.
    pub fn candidates(allow_fallbacks: bool) -> &'static [ManifestFormat] {
        if allow_fallbacks {
            &Self::ALL
        } else {
            &Self::ALL[..1]
        }
    }

    pub fn config_media_type(&self) -> &'static str {
        match self {
            ManifestFormat::CnabNative => media_types::CNAB_CONFIG,
            ManifestFormat::OciIndex => media_types::OCI_CONFIG,
            ManifestFormat::DockerManifestList => media_types::DOCKER_CONFIG,
        }
    }

    pub fn manifest_media_type(&self) -> &'static str {
        match self {
            ManifestFormat::CnabNative | ManifestFormat::OciIndex => media_types::OCI_MANIFEST,
            ManifestFormat::DockerManifestList => media_types::DOCKER_MANIFEST,
        }
    }

    pub fn index_media_type(&self) -> &'static str {
        match self {
            ManifestFormat::CnabNative | ManifestFormat::OciIndex => media_types::OCI_INDEX,
            ManifestFormat::DockerManifestList => media_types::DOCKER_MANIFEST_LIST,
        }
    }

    /// Docker manifest lists carry no annotations.
    pub fn supports_annotations(&self) -> bool {
        !matches!(self, ManifestFormat::DockerManifestList)
    }

    /// Encode `bundle` in this format.
    pub fn encode(&self, bundle: &Bundle) -> Result<EncodedBundle> {
        let config_blob = bundle.to_canonical_json()?;
        let config = Descriptor::of(self.config_media_type(), &config_blob);

        let config_manifest = serde_json::to_vec(&ImageManifest {
            schema_version: 2,
            media_type: self.manifest_media_type(),
            config,
            layers: Vec::new(),
        })?;

        let mut manifests = Vec::new();
        manifests.push(self.annotate(
            Descriptor::of(self.manifest_media_type(), &config_manifest),
            config_annotations(),
        ));
        for (slot, image) in bundle.registry_images() {
            let descriptor = self.image_descriptor(&slot, image)?;
            manifests.push(self.annotate(descriptor, image_annotations(&slot)));
        }

        let index_annotations = if self.supports_annotations() {
            Some(bundle_annotations(bundle)?)
        } else {
            None
        };
        let index = serde_json::to_vec(&ImageIndex {
            schema_version: 2,
            media_type: self.index_media_type(),
            manifests,
            annotations: index_annotations,
        })?;

        Ok(EncodedBundle {
            format: *self,
            config_blob,
            config_manifest,
            index,
        })
    }

    fn annotate(&self, descriptor: Descriptor, annotations: BTreeMap<String, String>) -> Descriptor {
        if self.supports_annotations() {
            descriptor.with_annotations(annotations)
        } else {
            descriptor
        }
    }

    fn image_descriptor(&self, slot: &ImageSlot, image: &BundleImage) -> Result<Descriptor> {
        let digest = image.content_digest.clone().ok_or_else(|| {
            PushError::Bundle(format!(
                "Image {} ({}) has no content digest; fix up the bundle first",
                image.image, slot
            ))
        })?;
        let size = image.size.ok_or_else(|| {
            PushError::Bundle(format!("Image {} ({}) has no size", image.image, slot))
        })?;
        let media_type = image
            .media_type
            .clone()
            .unwrap_or_else(|| self.manifest_media_type().to_string());
        Ok(Descriptor {
            media_type,
            digest,
            size,
            urls: Vec::new(),
            platform: None,
            annotations: None,
        })
    }
}

impl std::fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ManifestFormat::CnabNative => "cnab-native",
            ManifestFormat::OciIndex => "oci-index",
            ManifestFormat::DockerManifestList => "docker-manifest-list",
        };
        f.write_str(s)
    }
}

/// Bundle content ready for upload.
#[derive(Debug, Clone)]
pub struct EncodedBundle {
    pub format: ManifestFormat,
    /// Canonical bundle JSON
    pub config_blob: Vec<u8>,
    pub config_manifest: Vec<u8>,
    pub index: Vec<u8>,
}

impl EncodedBundle {
    pub fn config_digest(&self) -> String {
        crate::digest::sha256_digest(&self.config_blob)
    }

    pub fn config_manifest_digest(&self) -> String {
        crate::digest::sha256_digest(&self.config_manifest)
    }

    pub fn index_digest(&self) -> String {
        crate::digest::sha256_digest(&self.index)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    schema_version: u32,
    media_type: &'static str,
    config: Descriptor,
    layers: Vec<Descriptor>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    schema_version: u32,
    media_type: &'static str,
    manifests: Vec<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    annotations: Option<BTreeMap<String, String>>,
}

fn config_annotations() -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        annotations::MANIFEST_TYPE.to_string(),
        annotations::TYPE_CONFIG.to_string(),
    );
    annotations
}

fn image_annotations(slot: &ImageSlot) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::new();
    match slot {
        ImageSlot::Invocation(_) => {
            annotations.insert(
                annotations::MANIFEST_TYPE.to_string(),
                annotations::TYPE_INVOCATION.to_string(),
            );
        }
        ImageSlot::Component(name) => {
            annotations.insert(
                annotations::MANIFEST_TYPE.to_string(),
                annotations::TYPE_COMPONENT.to_string(),
            );
            annotations.insert(annotations::COMPONENT_NAME.to_string(), name.clone());
        }
    }
    annotations
}

fn bundle_annotations(bundle: &Bundle) -> Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    annotations.insert(
        annotations::RUNTIME_VERSION.to_string(),
        bundle.schema_version.clone(),
    );
    annotations.insert(
        annotations::ARTIFACT_TYPE.to_string(),
        media_types::CNAB_MANIFEST.to_string(),
    );
    annotations.insert(annotations::TITLE.to_string(), bundle.name.clone());
    annotations.insert(annotations::VERSION.to_string(), bundle.version.clone());
    if let Some(ref description) = bundle.description {
        annotations.insert(annotations::DESCRIPTION.to_string(), description.clone());
    }
    if !bundle.keywords.is_empty() {
        annotations.insert(
            annotations::KEYWORDS.to_string(),
            serde_json::to_string(&bundle.keywords)?,
        );
    }
    Ok(annotations)
}
