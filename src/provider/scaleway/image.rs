//! Image resolution for the Scaleway adapter.
//!
//! Images may be given as a UUID or as a marketplace label. Labels are looked
//! up first among the project's images and then among public ones, keeping the
//! newest available image for the requested architecture.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use uuid::Uuid;

use super::ScalewayProvisioner;
use crate::provider::ProvisionError;
use crate::transport::Transport;

/// Parameters of an image lookup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct ImageQuery<'a> {
    pub(super) label: &'a str,
    pub(super) arch: &'a str,
    pub(super) zone: &'a str,
    pub(super) project_id: Option<&'a str>,
    pub(super) organisation_id: Option<&'a str>,
}

impl<T: Transport, C> ScalewayProvisioner<T, C> {
    pub(super) async fn resolve_image_id(
        &self,
        query: &ImageQuery<'_>,
    ) -> Result<String, ProvisionError> {
        if Uuid::parse_str(query.label).is_ok() {
            return Ok(query.label.to_owned());
        }
        resolve_with(
            query,
            || async move {
                let Some(project) = query.project_id else {
                    return Ok(Vec::new());
                };
                let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                    .public(true)
                    .project(project)
                    .name(query.label)
                    .arch(query.arch);
                if let Some(org) = query.organisation_id {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(|err| sdk_error(&err, query))
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                    .public(true)
                    .name(query.label)
                    .arch(query.arch)
                    .run_async()
                    .await
                    .map_err(|err| sdk_error(&err, query))
            },
        )
        .await
    }
}

fn sdk_error(err: &scaleway_rs::ScalewayError, query: &ImageQuery<'_>) -> ProvisionError {
    ProvisionError::api("list images", query.label, err.to_string())
}

pub(super) async fn resolve_with<FutA, FutB, FetchA, FetchB>(
    query: &ImageQuery<'_>,
    project_fetch: FetchA,
    public_fetch: FetchB,
) -> Result<String, ProvisionError>
where
    FetchA: FnOnce() -> FutA,
    FetchB: FnOnce() -> FutB,
    FutA: Future<Output = Result<Vec<ScalewayImage>, ProvisionError>>,
    FutB: Future<Output = Result<Vec<ScalewayImage>, ProvisionError>>,
{
    let project_images = usable(project_fetch().await?, query.arch);
    let candidates = if project_images.is_empty() {
        usable(public_fetch().await?, query.arch)
    } else {
        project_images
    };
    newest(candidates).ok_or_else(|| {
        ProvisionError::configuration(format!(
            "image '{}' (arch {}) not found in zone {}",
            query.label, query.arch, query.zone
        ))
    })
}

fn usable(images: Vec<ScalewayImage>, arch: &str) -> Vec<ScalewayImage> {
    images
        .into_iter()
        .filter(|image| image.arch == arch && image.state == "available")
        .collect()
}

fn newest(candidates: Vec<ScalewayImage>) -> Option<String> {
    candidates
        .into_iter()
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use rstest::{fixture, rstest};

    fn image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
        ScalewayImage {
            id: id.to_owned(),
            name: String::new(),
            arch: arch.to_owned(),
            creation_date: creation_date.to_owned(),
            modification_date: String::new(),
            from_server: None,
            organization: String::new(),
            public: true,
            state: state.to_owned(),
            project: String::new(),
            tags: vec![],
            zone: String::new(),
            root_volume: scaleway_rs::ScalewayImageRootVolume {
                id: String::new(),
                name: String::new(),
                size: 0,
                volume_type: String::new(),
            },
            default_bootscript: None,
            extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
                volumes: HashMap::new(),
            },
        }
    }

    #[fixture]
    fn query() -> ImageQuery<'static> {
        ImageQuery {
            label: "Ubuntu 22.04 Jammy Jellyfish",
            arch: "x86_64",
            zone: "fr-par-1",
            project_id: Some("proj"),
            organisation_id: None,
        }
    }

    #[rstest]
    #[tokio::test]
    async fn project_images_win_over_public_ones(query: ImageQuery<'static>) {
        let id = resolve_with(
            &query,
            || async { Ok(vec![image("project", "x86_64", "available", "2024-01-01")]) },
            || async { Err(ProvisionError::configuration("public lookup must not run")) },
        )
        .await
        .expect("image");
        assert_eq!(id, "project");
    }

    #[rstest]
    #[tokio::test]
    async fn falls_back_to_newest_public_image_for_arch(query: ImageQuery<'static>) {
        let id = resolve_with(
            &query,
            || async { Ok(vec![image("arm-only", "arm64", "available", "2024-06-01")]) },
            || async {
                Ok(vec![
                    image("old", "x86_64", "available", "2023-01-01"),
                    image("new", "x86_64", "available", "2024-05-01"),
                    image("broken", "x86_64", "error", "2024-09-01"),
                ])
            },
        )
        .await
        .expect("image");
        assert_eq!(id, "new");
    }

    #[rstest]
    #[tokio::test]
    async fn missing_image_is_a_configuration_error(query: ImageQuery<'static>) {
        let err = resolve_with(&query, || async { Ok(Vec::new()) }, || async { Ok(Vec::new()) })
            .await
            .expect_err("nothing matches");
        assert_eq!(
            err,
            ProvisionError::configuration(
                "image 'Ubuntu 22.04 Jammy Jellyfish' (arch x86_64) not found in zone fr-par-1"
            )
        );
    }
}
