// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Image acquisition and config label reading.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::runtime::{ContainerRuntime, ImageHandle, RegistryAuth};
use crate::spec::LaunchSpec;

/// OCI image config media type.
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// Legacy Docker schema-2 config media type.
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";

/// Registry username carrying an OAuth2 access token as the password.
const TOKEN_USERNAME: &str = "oauth2accesstoken";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("cannot pull image {reference}")]
    Pull {
        reference: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unknown image config media type {0}")]
    UnknownMediaType(String),
    #[error("cannot read image config")]
    Config(#[source] anyhow::Error),
}

/// Pull the image named by the spec. A memoized registry credential is used
/// when present; otherwise the pull is unauthenticated and only works for
/// public images.
pub async fn pull(
    runtime: &dyn ContainerRuntime,
    spec: &LaunchSpec,
) -> Result<ImageHandle, ImageError> {
    let credential = spec.registry_token.as_ref().map(|token| RegistryAuth {
        username: TOKEN_USERNAME.to_string(),
        password: token.clone(),
    });
    if credential.is_some() {
        info!("pulling image {} with registry credential", spec.image_ref);
    } else {
        info!(
            "pulling image {} without credential (only works for a public image)",
            spec.image_ref
        );
    }

    runtime
        .pull_image(&spec.image_ref, credential)
        .await
        .map_err(|source| ImageError::Pull {
            reference: spec.image_ref.clone(),
            source,
        })
}

#[derive(Deserialize)]
struct ImageConfigBlob {
    #[serde(default)]
    config: Option<InnerConfig>,
}

#[derive(Deserialize)]
struct InnerConfig {
    #[serde(rename = "Labels")]
    labels: Option<HashMap<String, String>>,
}

/// Read the image's config labels.
pub async fn read_labels(
    runtime: &dyn ContainerRuntime,
    image: &ImageHandle,
) -> Result<HashMap<String, String>, ImageError> {
    let config = runtime
        .image_config(image)
        .await
        .map_err(ImageError::Config)?;

    match config.media_type.as_str() {
        MEDIA_TYPE_OCI_CONFIG | MEDIA_TYPE_DOCKER_CONFIG => {}
        other => return Err(ImageError::UnknownMediaType(other.to_string())),
    }

    let blob: ImageConfigBlob =
        serde_json::from_slice(&config.content).map_err(|e| ImageError::Config(e.into()))?;
    Ok(blob.config.and_then(|c| c.labels).unwrap_or_default())
}
