//! Memory estimation for models about to be loaded.
//!
//! Eviction only ever sees the number returned here, so a more accurate estimator
//! (quantization-aware, measured) can be swapped in without touching the scheduler.

use crate::registry::Model;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

#[async_trait]
pub trait MemoryEstimator: Send + Sync + Debug {
    /// Estimated memory in MB. Must never return 0.
    async fn estimate_mb(&self, model: &Model) -> u64;
}

/// Uses the weight file size as a proxy, with a floor of 1 MB.
///
/// An unreadable file is estimated at 1 MB rather than skipped, so the budget check still
/// runs for it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSizeEstimator;

#[async_trait]
impl MemoryEstimator for FileSizeEstimator {
    async fn estimate_mb(&self, model: &Model) -> u64 {
        match tokio::fs::metadata(&model.path).await {
            Ok(meta) => (meta.len() / MIB).max(1),
            Err(e) => {
                debug!(model = %model.id, error = %e, "Could not stat model file, assuming 1 MB");
                1
            }
        }
    }
}

/// Fixed per-model sizes, falling back to a default for unknown ids.
#[derive(Debug, Clone)]
pub struct StaticEstimator {
    sizes: HashMap<String, u64>,
    fallback_mb: u64,
}

impl StaticEstimator {
    pub fn new<I, S>(sizes: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        Self {
            sizes: sizes.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            fallback_mb: 1,
        }
    }

    pub fn with_fallback(mut self, fallback_mb: u64) -> Self {
        self.fallback_mb = fallback_mb;
        self
    }
}

#[async_trait]
impl MemoryEstimator for StaticEstimator {
    async fn estimate_mb(&self, model: &Model) -> u64 {
        self.sizes
            .get(&model.id)
            .copied()
            .unwrap_or(self.fallback_mb)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn model_at(path: &std::path::Path) -> Model {
        Model::builder().id("m").path(path).build()
    }

    #[rstest]
    #[case(0, 1)]
    #[case(512 * 1024, 1)]
    #[case(10 * MIB, 10)]
    #[case(15 * MIB + 1, 15)]
    #[tokio::test]
    async fn test_file_size_estimate(#[case] len: u64, #[case] expected_mb: u64) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();

        assert_eq!(
            FileSizeEstimator.estimate_mb(&model_at(file.path())).await,
            expected_mb
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_one_mb() {
        let model = model_at(std::path::Path::new("/definitely/not/here.gguf"));
        assert_eq!(FileSizeEstimator.estimate_mb(&model).await, 1);
    }

    #[tokio::test]
    async fn test_static_estimator() {
        let estimator = StaticEstimator::new([("alpha", 10), ("zero", 0)]).with_fallback(3);
        let alpha = Model::builder().id("alpha").path("a").build();
        let zero = Model::builder().id("zero").path("z").build();
        let other = Model::builder().id("other").path("o").build();

        assert_eq!(estimator.estimate_mb(&alpha).await, 10);
        assert_eq!(estimator.estimate_mb(&zero).await, 1);
        assert_eq!(estimator.estimate_mb(&other).await, 3);
    }
}
