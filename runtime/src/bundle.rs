//! CNAB bundle model.
//!
//! Only the fields the push pipeline touches are typed; everything else in
//! `bundle.json` is carried through untouched. Serialization is canonical
//! (sorted keys, no insignificant whitespace) so equal bundles always have
//! equal bytes and digests.

use std::collections::BTreeMap;
use std::path::Path;

use cnab_push_core::error::{PushError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::digest::sha256_digest;

/// Image types that live in a container registry.
const REGISTRY_IMAGE_TYPES: &[&str] = &["oci", "docker"];

/// A CNAB bundle descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub schema_version: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub invocation_images: Vec<BundleImage>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, BundleImage>,
    /// Actions, parameters, credentials, custom extensions, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An invocation image or a referenced component image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleImage {
    /// `oci` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_type: Option<String>,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BundleImage {
    /// A registry image of type `oci` with only a reference set.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image_type: None,
            image: image.into(),
            content_digest: None,
            media_type: None,
            size: None,
            extra: Map::new(),
        }
    }

    /// Whether this image is stored in a container registry.
    pub fn is_registry_image(&self) -> bool {
        let image_type = self.image_type.as_deref().unwrap_or("oci");
        REGISTRY_IMAGE_TYPES.contains(&image_type)
    }
}

/// Position of an image inside a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageSlot {
    /// Index into `invocationImages`
    Invocation(usize),
    /// Key of `images`
    Component(String),
}

impl std::fmt::Display for ImageSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageSlot::Invocation(i) => write!(f, "invocationImages[{}]", i),
            ImageSlot::Component(name) => write!(f, "images.{}", name),
        }
    }
}

impl Bundle {
    /// Parse a bundle from JSON bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| PushError::Bundle(format!("Failed to parse bundle: {}", e)))
    }

    /// Load a bundle from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            PushError::Bundle(format!("Failed to read bundle {}: {}", path.display(), e))
        })?;
        Self::from_slice(&data)
    }

    /// Registry-hosted images, invocation images first.
    pub fn registry_images(&self) -> Vec<(ImageSlot, &BundleImage)> {
        let invocation = self
            .invocation_images
            .iter()
            .enumerate()
            .map(|(i, img)| (ImageSlot::Invocation(i), img));
        let components = self
            .images
            .iter()
            .map(|(name, img)| (ImageSlot::Component(name.clone()), img));
        invocation
            .chain(components)
            .filter(|(_, img)| img.is_registry_image())
            .collect()
    }

    /// Image at `slot`.
    pub fn image(&self, slot: &ImageSlot) -> Option<&BundleImage> {
        match slot {
            ImageSlot::Invocation(i) => self.invocation_images.get(*i),
            ImageSlot::Component(name) => self.images.get(name),
        }
    }

    /// Mutable image at `slot`.
    pub fn image_mut(&mut self, slot: &ImageSlot) -> Option<&mut BundleImage> {
        match slot {
            ImageSlot::Invocation(i) => self.invocation_images.get_mut(*i),
            ImageSlot::Component(name) => self.images.get_mut(name),
        }
    }

    /// Canonical JSON encoding (RFC 8785): sorted keys, no whitespace.
    pub fn to_canonical_json(&self) -> Result<Vec<u8>> {
        serde_jcs::to_vec(self).map_err(|e| {
            PushError::Serialization(format!("Failed to canonicalize bundle: {}", e))
        })
    }

    /// Digest of the canonical encoding.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256_digest(&self.to_canonical_json()?))
    }
}
