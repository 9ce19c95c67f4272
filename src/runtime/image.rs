//! Image name validation, registry qualification and pull-with-retry

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{error, info, warn};

use crate::config::ImageConfig;
use crate::error::{Result, SandboxError};

use super::RuntimeGateway;

/// Lowercase path components separated by `.`, `_` or `-`, joined by `/`,
/// with an optional `:tag`.
static IMAGE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+([._-][a-z0-9]+)*(/[a-z0-9]+([._-][a-z0-9]+)*)*(:\w[\w.-]{0,127})?$")
        .expect("image name pattern is valid")
});

/// Pull policy shared by pool preparation and disposable containers
#[derive(Debug, Clone)]
pub struct PullPolicy {
    pub registry: String,
    pub retries: u32,
    pub attempt_timeout: Duration,
    pub backoff: Duration,
}

impl From<&ImageConfig> for PullPolicy {
    fn from(config: &ImageConfig) -> Self {
        Self {
            registry: config.registry.clone(),
            retries: config.pull_retries.max(1),
            attempt_timeout: Duration::from_secs(config.pull_timeout_seconds),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Check an image name against the accepted pattern
pub fn validate_image_name(image: &str) -> Result<()> {
    if IMAGE_NAME.is_match(image) {
        Ok(())
    } else {
        Err(SandboxError::InvalidImageName(image.to_string()))
    }
}

/// Prepend the registry unless the name already starts with it
pub fn qualify_image(registry: &str, image: &str) -> String {
    let registry = registry.trim_end_matches('/');
    if registry.is_empty() || image.starts_with(registry) {
        image.to_string()
    } else {
        format!("{}/{}", registry, image)
    }
}

/// Validate, qualify and make an image available locally.
///
/// Returns the qualified name. Local presence skips the pull; otherwise the
/// pull is retried with exponential backoff (`backoff * 2^attempt`).
pub async fn resolve_image(
    runtime: &dyn RuntimeGateway,
    image: &str,
    policy: &PullPolicy,
) -> Result<String> {
    validate_image_name(image)?;
    let qualified = qualify_image(&policy.registry, image);
    ensure_image(runtime, &qualified, policy).await?;
    Ok(qualified)
}

/// Make a (qualified) image available locally, pulling with retry
pub async fn ensure_image(
    runtime: &dyn RuntimeGateway,
    image: &str,
    policy: &PullPolicy,
) -> Result<()> {
    let attempts = policy.retries.max(1);
    let mut last_error = String::from("no attempt made");

    for attempt in 0..attempts {
        match runtime.image_exists(image).await {
            Ok(true) => {
                info!(image = %image, "Image already present locally");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => warn!(image = %image, error = %e, "Failed to inspect image"),
        }

        info!(image = %image, attempt = attempt + 1, attempts, "Pulling image");
        match tokio::time::timeout(policy.attempt_timeout, runtime.pull_image(image)).await {
            Ok(Ok(())) => {
                info!(image = %image, "Image pulled");
                return Ok(());
            }
            Ok(Err(e)) => {
                warn!(image = %image, attempt = attempt + 1, error = %e, "Image pull failed");
                last_error = e.to_string();
            }
            Err(_) => {
                warn!(image = %image, attempt = attempt + 1, "Image pull timed out");
                last_error = format!("pull timed out after {:?}", policy.attempt_timeout);
            }
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(policy.backoff * 2u32.saturating_pow(attempt)).await;
        }
    }

    error!(image = %image, attempts, "Giving up on image pull");
    Err(SandboxError::ImagePullFailed {
        image: image.to_string(),
        attempts,
        reason: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockRuntimeGateway, RuntimeError};

    fn policy(retries: u32) -> PullPolicy {
        PullPolicy {
            registry: String::new(),
            retries,
            attempt_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_valid_image_names() {
        for name in [
            "alpine",
            "alpine:latest",
            "python:3.12-slim",
            "library/python:3.12",
            "bad-registry.invalid/nope:latest",
            "my_org/tool.name:v1.2_rc",
        ] {
            assert!(validate_image_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_image_names() {
        for name in [
            "",
            "Alpine",
            "alpine:",
            "-alpine",
            "alpine/",
            "alpine;rm -rf /",
            "../etc/passwd",
            "a b",
            "alpine:latest:extra",
        ] {
            assert!(
                matches!(validate_image_name(name), Err(SandboxError::InvalidImageName(_))),
                "{:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_qualify_image() {
        assert_eq!(qualify_image("", "alpine"), "alpine");
        assert_eq!(qualify_image("registry.local", "alpine"), "registry.local/alpine");
        assert_eq!(qualify_image("registry.local/", "alpine"), "registry.local/alpine");
        assert_eq!(
            qualify_image("registry.local", "registry.local/alpine"),
            "registry.local/alpine"
        );
    }

    #[tokio::test]
    async fn test_invalid_name_makes_no_runtime_call() {
        // No expectations: any call would panic
        let runtime = MockRuntimeGateway::new();
        let err = resolve_image(&runtime, "NOT VALID", &policy(3)).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidImageName(_)));
    }

    #[tokio::test]
    async fn test_present_image_skips_pull() {
        let mut runtime = MockRuntimeGateway::new();
        runtime.expect_image_exists().times(1).returning(|_| Ok(true));
        runtime.expect_pull_image().never();

        tokio_test::assert_ok!(ensure_image(&runtime, "alpine:latest", &policy(3)).await);
    }

    #[tokio::test]
    async fn test_pull_retries_then_fails() {
        let mut runtime = MockRuntimeGateway::new();
        runtime.expect_image_exists().times(3).returning(|_| Ok(false));
        runtime.expect_pull_image().times(3).returning(|image| {
            Err(RuntimeError::Api {
                operation: "pull",
                message: format!("manifest for {} not found", image),
            })
        });

        let err = ensure_image(&runtime, "bad-registry.invalid/nope:latest", &policy(3))
            .await
            .unwrap_err();
        match err {
            SandboxError::ImagePullFailed { attempts, reason, .. } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("not found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pull_succeeds_on_second_attempt() {
        let mut runtime = MockRuntimeGateway::new();
        runtime.expect_image_exists().returning(|_| Ok(false));
        let mut calls = 0;
        runtime.expect_pull_image().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(RuntimeError::Api {
                    operation: "pull",
                    message: "registry hiccup".into(),
                })
            } else {
                Ok(())
            }
        });

        tokio_test::assert_ok!(ensure_image(&runtime, "alpine:latest", &policy(3)).await);
    }
}
