//! Builds the external runtime handle for an instance.

use std::sync::Arc;

use crate::error::CoreResult;
use crate::instance::Instance;
use crate::runtime_trait::Runtime;

pub trait RuntimeFactory: Send + Sync {
    fn build(&self, instance: &Instance) -> CoreResult<Arc<dyn Runtime>>;
}
