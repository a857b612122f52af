// Data sources: local files, in-memory and progressively written buffers, retrying wrappers

mod file;
mod memory;
mod retry;
mod url;

pub use file::FileDataSource;
pub use memory::{MemoryDataSource, ProgressiveDataSource, ProgressiveWriter};
pub use retry::{AutoRecoveringDataSource, RetryPolicy};
pub use url::{data_source_from_url, data_source_from_url_with};

pub use streamplay_transport_http::{HttpDataSource, HttpOptions};
