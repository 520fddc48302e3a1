//! Image reference resolution.
//!
//! Turns catalog records into scannable image references using tag data that
//! was already fetched when the record was scraped. Nothing here touches the
//! network.

mod tag;

pub use tag::{select_tag, PREFERRED_TAGS};

use crate::model::{ResolvedImage, ScanTarget, ToolRecord};
use tracing::{debug, warn};

/// Namespace of the registry's official images, which are addressed without a prefix.
pub const OFFICIAL_NAMESPACE: &str = "library";

#[derive(Debug, Clone)]
pub struct ImageResolver {
    default_tag: String,
}

impl ImageResolver {
    pub fn new(default_tag: impl Into<String>) -> Self {
        Self {
            default_tag: default_tag.into(),
        }
    }

    pub fn default_tag(&self) -> &str {
        &self.default_tag
    }

    pub fn target(&self, tool: &ToolRecord) -> ScanTarget {
        ScanTarget {
            tool_id: tool.id.clone(),
            candidate_tags: tool.docker_tags.clone(),
            fallback_tag: self.default_tag.clone(),
        }
    }

    /// Resolves a record of shape `source:namespace/name` into an image reference.
    ///
    /// Returns `None` when the record is not a container image or its id is
    /// malformed.
    ///
    /// # Example
    ///
    /// ```
    /// use imagescan::model::ToolRecord;
    /// use imagescan::resolver::ImageResolver;
    ///
    /// let resolver = ImageResolver::new("latest");
    /// let tool = ToolRecord::new("docker_hub:bitnami/redis");
    /// let image = resolver.resolve(&tool).unwrap();
    /// assert_eq!(image.image_ref, "bitnami/redis:latest");
    /// ```
    pub fn resolve(&self, tool: &ToolRecord) -> Option<ResolvedImage> {
        if !tool.source().is_scannable() {
            debug!(tool_id = %tool.id, "not a container image source");
            return None;
        }

        let Some((namespace, name)) = split_image_path(&tool.id) else {
            warn!(tool_id = %tool.id, "malformed image id");
            return None;
        };

        let target = self.target(tool);
        let selected_tag = select_tag(&target.candidate_tags, &target.fallback_tag);

        let image_ref = if namespace == OFFICIAL_NAMESPACE {
            format!("{}:{}", name, selected_tag)
        } else {
            format!("{}/{}:{}", namespace, name, selected_tag)
        };

        debug!(tool_id = %tool.id, %image_ref, tag = %selected_tag, "resolved image");
        Some(ResolvedImage {
            image_ref,
            selected_tag,
        })
    }
}

impl Default for ImageResolver {
    fn default() -> Self {
        Self::new("latest")
    }
}

fn split_image_path(id: &str) -> Option<(&str, &str)> {
    let (_, path) = id.split_once(':')?;
    let (namespace, name) = path.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some((namespace, name))
}
