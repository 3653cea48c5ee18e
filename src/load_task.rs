//! The unit of work submitted to the decode scheduler: decode one image,
//! then memoize its pixel statistics.
use std::sync::Arc;

use crate::decoded::DecodedImage;
use crate::resource::ResourceState;
use crate::traits::{LoadError, MediaReader};

pub(crate) struct LoadTask<R: MediaReader> {
    state: Arc<ResourceState<R>>,
}

impl<R: MediaReader> LoadTask<R> {
    pub(crate) fn new(state: Arc<ResourceState<R>>) -> LoadTask<R> {
        LoadTask { state }
    }

    /// Runs on the decode worker.  Errors propagate to the caller blocked
    /// on the task handle.
    pub(crate) fn run(self) -> Result<Arc<DecodedImage>, LoadError> {
        let img = self.state.reader().fetch_fragment()?;
        self.state.find_min_max(&img);
        Ok(Arc::new(img))
    }
}
