//! Image label resolution.
//!
//! Labels are looked up in the configured project first and fall back to
//! the public catalogue. The newest available image for the configured
//! architecture wins. Image ids are zone-scoped: an id recorded as
//! `zone/id` is used as is in its own zone, and looked up by name in any
//! other zone.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use uuid::Uuid;

use tracing::info;

use super::types::ImageEnvelope;
use super::{API_BASE, HTTP_CLIENT, ScalewayProvider};
use crate::provider::ProviderError;

/// How an image reference relates to the zone being launched in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ImageTarget<'a> {
    /// An id valid in the target zone.
    Id(&'a str),
    /// An id from another zone; its name is looked up in the target zone.
    Foreign { zone: &'a str, id: &'a str },
    /// A label to look up.
    Label(&'a str),
}

pub(crate) fn classify_image<'a>(image: &'a str, zone: &str) -> ImageTarget<'a> {
    let (origin, id) = image
        .rsplit_once('/')
        .map_or((None, image), |(origin, id)| (Some(origin), id));
    if Uuid::parse_str(id).is_err() {
        return ImageTarget::Label(image);
    }
    match origin {
        Some(origin) if origin != zone => ImageTarget::Foreign { zone: origin, id },
        _ => ImageTarget::Id(id),
    }
}

fn image_url(zone: &str, id: &str) -> String {
    format!("{API_BASE}/instance/v1/zones/{zone}/images/{id}")
}

/// Image lookup parameters.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ImageQuery<'a> {
    pub(crate) label: &'a str,
    pub(crate) arch: &'a str,
    pub(crate) zone: &'a str,
}

impl ScalewayProvider {
    pub(crate) async fn resolve_image_id(
        &self,
        image: &str,
        zone: Option<&str>,
    ) -> Result<String, ProviderError> {
        let launch_zone = zone.unwrap_or(&self.config.default_zone);
        let (label, arch) = match classify_image(image, launch_zone) {
            ImageTarget::Id(id) => return Ok(id.to_owned()),
            ImageTarget::Label(label) => {
                (label.to_owned(), self.config.default_architecture.clone())
            }
            ImageTarget::Foreign { zone: origin, id } => {
                let envelope: ImageEnvelope =
                    self.send_json(HTTP_CLIENT.get(image_url(origin, id))).await?;
                info!(
                    image = id,
                    from = origin,
                    to = launch_zone,
                    name = %envelope.image.name,
                    "looking up image in the launch zone"
                );
                (envelope.image.name, envelope.image.arch)
            }
        };
        let query = ImageQuery {
            label: &label,
            arch: &arch,
            zone: launch_zone,
        };
        resolve_with(
            &query,
            || async {
                let mut scoped =
                    ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                        .public(true)
                        .project(&self.config.default_project_id)
                        .name(query.label)
                        .arch(query.arch);
                if let Some(org) = &self.config.default_organization_id {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(ProviderError::from)
            },
            || async {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                    .public(true)
                    .name(query.label)
                    .arch(query.arch)
                    .run_async()
                    .await
                    .map_err(ProviderError::from)
            },
        )
        .await
    }
}

/// Runs the project lookup, then the public lookup when the project has no
/// match, and selects the winner.
pub(crate) async fn resolve_with<FutA, FutB, FetchA, FetchB>(
    query: &ImageQuery<'_>,
    project_fetch: FetchA,
    public_fetch: FetchB,
) -> Result<String, ProviderError>
where
    FetchA: FnOnce() -> FutA,
    FetchB: FnOnce() -> FutB,
    FutA: Future<Output = Result<Vec<ScalewayImage>, ProviderError>>,
    FutB: Future<Output = Result<Vec<ScalewayImage>, ProviderError>>,
{
    let project_images = filter_images(project_fetch().await?, query);
    let candidates = if project_images.is_empty() {
        filter_images(public_fetch().await?, query)
    } else {
        project_images
    };
    select_newest(candidates, query)
}

pub(crate) fn filter_images(images: Vec<ScalewayImage>, query: &ImageQuery<'_>) -> Vec<ScalewayImage> {
    images
        .into_iter()
        .filter(|image| image.arch == query.arch)
        .filter(|image| image.state == "available")
        .collect()
}

pub(crate) fn select_newest(
    candidates: Vec<ScalewayImage>,
    query: &ImageQuery<'_>,
) -> Result<String, ProviderError> {
    candidates
        .into_iter()
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
        .ok_or_else(|| {
            ProviderError::not_found(
                "image",
                format!("{} ({}, {})", query.label, query.arch, query.zone),
            )
        })
}
