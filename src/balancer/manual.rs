//! 固定大小算法

use std::sync::Arc;

use super::{Bundler, BundlerContext, BundlerError, Feedback, Profile};
use crate::WorkerId;

pub const NAME: &str = "manual";

/// 总是返回配置的`size`，没有任何状态
#[derive(Debug, Clone)]
pub struct ManualBundler {
    profile: Profile,
    size: usize,
}

impl ManualBundler {
    pub fn new(profile: Profile) -> Result<Self, BundlerError> {
        let size = profile.positive_or("size", 1)?;
        Ok(Self { profile, size })
    }

    /// 大小为`size`的固定算法
    pub fn fixed(size: usize) -> Self {
        let size = size.max(1);
        Self {
            profile: Profile::new(NAME).with("size", size),
            size,
        }
    }

    pub fn construct(
        profile: &Profile,
        _ctx: Arc<dyn BundlerContext>,
    ) -> Result<Arc<dyn Bundler>, BundlerError> {
        Ok(Arc::new(Self::new(profile.clone())?))
    }
}

impl Bundler for ManualBundler {
    fn algorithm(&self) -> &str {
        NAME
    }

    fn profile(&self) -> &Profile {
        &self.profile
    }

    fn next_size(&self, _worker: WorkerId) -> usize {
        self.size
    }

    fn feedback(&self, _worker: WorkerId, _feedback: &Feedback) {}
}
