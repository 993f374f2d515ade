//! CRI ImageService implementation.
//!
//! Reads go straight to the engine. Pulls and removals run through the
//! bounded worker pool so they share one code path with batch work.

use std::sync::Arc;

use parking_lot::Mutex;
use tonic::{Request, Response, Status};

use machined_core::error::MachinedError;
use machined_core::parallelize;

use crate::backend;
use crate::backend::ImageService as _;
use crate::cri_api::image_service_server;
use crate::cri_api::*;
use crate::error::call_failed;

/// Workers used for image pull/remove.
const IMAGE_WORKERS: usize = 2;

/// gRPC front of the image service.
pub struct CriImageService {
    images: Arc<dyn backend::ImageService>,
}

impl CriImageService {
    pub fn new(images: Arc<dyn backend::ImageService>) -> Self {
        Self { images }
    }
}

/// Surface the first failure of a pooled call; the rest are only logged.
fn first_failure(method: &'static str, errors: Vec<MachinedError>) -> Result<(), Status> {
    let mut errors = errors.into_iter();
    let Some(first) = errors.next() else {
        return Ok(());
    };
    for extra in errors {
        tracing::warn!(method, error = %extra, "Additional image operation failure");
    }
    Err(call_failed(method, first))
}

#[tonic::async_trait]
impl image_service_server::ImageService for CriImageService {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI ListImages");

        let images = self
            .images
            .list_images(req.filter)
            .await
            .map_err(|e| call_failed("ListImages", e))?;

        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI ImageStatus");

        let image_spec = req.image.ok_or_else(|| {
            call_failed("ImageStatus", MachinedError::InvalidArgument("image spec required".to_string()))
        })?;

        let image = self
            .images
            .image_status(image_spec)
            .await
            .map_err(|e| call_failed("ImageStatus", e))?;

        Ok(Response::new(ImageStatusResponse {
            image,
            info: Default::default(),
        }))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI PullImage");

        let image_spec = req.image.ok_or_else(|| {
            call_failed("PullImage", MachinedError::InvalidArgument("image spec required".to_string()))
        })?;
        let auth = req.auth;
        let reference = image_spec.image.clone();

        let images = self.images.clone();
        let pulled = Arc::new(Mutex::new(Vec::with_capacity(1)));
        let refs = pulled.clone();

        let errors = parallelize(IMAGE_WORKERS, 1, move |_| {
            let images = images.clone();
            let image_spec = image_spec.clone();
            let auth = auth.clone();
            let refs = refs.clone();
            async move {
                let image_ref = images.pull_image(image_spec, auth).await?;
                refs.lock().push(image_ref);
                Ok::<(), MachinedError>(())
            }
        })
        .await;
        first_failure("PullImage", errors)?;

        let image_ref = pulled.lock().pop().ok_or_else(|| {
            call_failed(
                "PullImage",
                MachinedError::Internal(format!(
                    "pull of {} recorded no image reference",
                    reference
                )),
            )
        })?;

        tracing::info!(image = %reference, image_ref = %image_ref, "Image pulled");

        Ok(Response::new(PullImageResponse { image_ref }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let req = request.into_inner();
        tracing::trace!(request = ?req, "CRI RemoveImage");

        let image_spec = req.image.ok_or_else(|| {
            call_failed("RemoveImage", MachinedError::InvalidArgument("image spec required".to_string()))
        })?;
        let reference = image_spec.image.clone();

        let images = self.images.clone();
        let errors = parallelize(IMAGE_WORKERS, 1, move |_| {
            let images = images.clone();
            let image_spec = image_spec.clone();
            async move { images.remove_image(image_spec).await }
        })
        .await;
        first_failure("RemoveImage", errors)?;

        tracing::info!(image = %reference, "Image removed");

        Ok(Response::new(RemoveImageResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use machined_core::error::Result;

    use crate::cri_api::image_service_server::ImageService as _;
    use crate::engine::LocalEngine;

    /// Image backend whose every mutation fails.
    struct FailingImages;

    #[async_trait]
    impl backend::ImageService for FailingImages {
        async fn list_images(&self, _: Option<ImageFilter>) -> Result<Vec<Image>> {
            Ok(vec![])
        }
        async fn image_status(&self, _: ImageSpec) -> Result<Option<Image>> {
            Ok(None)
        }
        async fn pull_image(&self, _: ImageSpec, _: Option<AuthConfig>) -> Result<String> {
            Err(MachinedError::GrpcError(Status::unavailable("registry down")))
        }
        async fn remove_image(&self, _: ImageSpec) -> Result<()> {
            Err(MachinedError::EngineError("image in use".to_string()))
        }
    }

    /// Image backend whose pull worker dies before recording a reference.
    struct PanickingPuller;

    #[async_trait]
    impl backend::ImageService for PanickingPuller {
        async fn list_images(&self, _: Option<ImageFilter>) -> Result<Vec<Image>> {
            Ok(vec![])
        }
        async fn image_status(&self, _: ImageSpec) -> Result<Option<Image>> {
            Ok(None)
        }
        async fn pull_image(&self, _: ImageSpec, _: Option<AuthConfig>) -> Result<String> {
            panic!("puller crashed")
        }
        async fn remove_image(&self, _: ImageSpec) -> Result<()> {
            Ok(())
        }
    }

    /// Image backend whose removal worker dies mid-call.
    struct PanickingRemover;

    #[async_trait]
    impl backend::ImageService for PanickingRemover {
        async fn list_images(&self, _: Option<ImageFilter>) -> Result<Vec<Image>> {
            Ok(vec![])
        }
        async fn image_status(&self, _: ImageSpec) -> Result<Option<Image>> {
            Ok(None)
        }
        async fn pull_image(&self, _: ImageSpec, _: Option<AuthConfig>) -> Result<String> {
            Ok("sha256:unused".to_string())
        }
        async fn remove_image(&self, _: ImageSpec) -> Result<()> {
            panic!("remover crashed")
        }
    }

    fn spec(image: &str) -> Option<ImageSpec> {
        Some(ImageSpec {
            image: image.to_string(),
            annotations: Default::default(),
        })
    }

    fn local_service() -> CriImageService {
        CriImageService::new(Arc::new(LocalEngine::new("machined")))
    }

    #[test]
    fn test_first_failure_empty_is_ok() {
        assert!(first_failure("PullImage", vec![]).is_ok());
    }

    #[test]
    fn test_first_failure_surfaces_first() {
        let status = first_failure(
            "PullImage",
            vec![
                MachinedError::NotFound("first".to_string()),
                MachinedError::EngineError("second".to_string()),
            ],
        )
        .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert_eq!(status.message(), "first");
    }

    #[tokio::test]
    async fn test_pull_then_status_and_list() {
        let service = local_service();

        let image_ref = service
            .pull_image(Request::new(PullImageRequest {
                image: spec("nginx:1.25"),
                auth: None,
                sandbox_config: None,
            }))
            .await
            .unwrap()
            .into_inner()
            .image_ref;
        assert!(image_ref.starts_with("sha256:"));

        let image = service
            .image_status(Request::new(ImageStatusRequest {
                image: spec("nginx:1.25"),
                verbose: false,
            }))
            .await
            .unwrap()
            .into_inner()
            .image
            .unwrap();
        assert_eq!(image.id, image_ref);
        assert_eq!(image.repo_tags, vec!["nginx:1.25".to_string()]);

        let images = service
            .list_images(Request::new(ListImagesRequest { filter: None }))
            .await
            .unwrap()
            .into_inner()
            .images;
        assert_eq!(images.len(), 1);
    }

    #[tokio::test]
    async fn test_image_status_unknown_is_empty() {
        let service = local_service();
        let resp = service
            .image_status(Request::new(ImageStatusRequest {
                image: spec("busybox:latest"),
                verbose: false,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.image.is_none());
    }

    #[tokio::test]
    async fn test_image_spec_required() {
        let service = local_service();
        let status = service
            .pull_image(Request::new(PullImageRequest {
                image: None,
                auth: None,
                sandbox_config: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);

        let status = service
            .remove_image(Request::new(RemoveImageRequest { image: None }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_remove_unknown_image_not_found() {
        let service = local_service();
        let status = service
            .remove_image(Request::new(RemoveImageRequest {
                image: spec("never-pulled:1"),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_pull_and_remove_errors_surface() {
        let service = CriImageService::new(Arc::new(FailingImages));

        let status = service
            .pull_image(Request::new(PullImageRequest {
                image: spec("nginx"),
                auth: None,
                sandbox_config: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(status.message(), "registry down");

        let status = service
            .remove_image(Request::new(RemoveImageRequest {
                image: spec("nginx"),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unknown);
        assert_eq!(status.message(), "image in use");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_image_spec_is_logged_with_method() {
        let service = local_service();
        let status = service
            .image_status(Request::new(ImageStatusRequest {
                image: None,
                verbose: false,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(logs_contain("CRI call failed"));
        assert!(logs_contain("method=\"ImageStatus\""));
    }

    #[tokio::test]
    async fn test_panicking_remove_is_not_success() {
        let service = CriImageService::new(Arc::new(PanickingRemover));
        let status = service
            .remove_image(Request::new(RemoveImageRequest {
                image: spec("nginx"),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(status.message().contains("remover crashed"));
    }

    #[tokio::test]
    async fn test_panicking_pull_is_internal() {
        let service = CriImageService::new(Arc::new(PanickingPuller));
        let status = service
            .pull_image(Request::new(PullImageRequest {
                image: spec("nginx"),
                auth: None,
                sandbox_config: None,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }
}
