// Picking a data source for a URL

use crate::file::FileDataSource;
use crate::retry::{AutoRecoveringDataSource, RetryPolicy};
use streamplay_core::{AudioError, DataSource, Result};
use streamplay_transport_http::{HttpDataSource, HttpOptions};

/// Data source for `url` with default HTTP and retry settings
pub fn data_source_from_url(url: &str) -> Result<Box<dyn DataSource>> {
    data_source_from_url_with(url, &HttpOptions::default(), RetryPolicy::default())
}

/// `file://` URLs and bare paths read from disk; `http(s)://` streams over the network
/// behind a retrying wrapper
pub fn data_source_from_url_with(
    url: &str,
    http: &HttpOptions,
    retry: RetryPolicy,
) -> Result<Box<dyn DataSource>> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(AudioError::DataNotFound("Empty URL".to_string()));
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        let source = HttpDataSource::with_options(trimmed, http);
        return Ok(Box::new(AutoRecoveringDataSource::new(source, retry)));
    }

    if lower.starts_with("file://") {
        return Ok(Box::new(FileDataSource::new(&trimmed["file://".len()..])));
    }

    match trimmed.split_once("://") {
        Some((scheme, _)) => Err(AudioError::UnsupportedFormat(format!(
            "Unsupported URL scheme: {}",
            scheme
        ))),
        None => Ok(Box::new(FileDataSource::new(trimmed))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_urls_and_paths_read_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"xyz").unwrap();
        let path = file.path().display().to_string();

        for url in [path.clone(), format!("file://{}", path)] {
            let mut source = data_source_from_url(&url).unwrap();
            source.open(0).unwrap();
            let mut buf = [0u8; 8];
            assert_eq!(source.read_into(&mut buf).unwrap(), 3);
            assert_eq!(source.describe(), path);
        }
    }

    #[test]
    fn http_urls_get_retrying_network_source() {
        let source = data_source_from_url("https://example.com/stream.wav").unwrap();
        assert_eq!(source.describe(), "https://example.com/stream.wav");
        assert_eq!(source.format_hint().as_deref(), Some("wav"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            data_source_from_url("rtsp://camera/live"),
            Err(AudioError::UnsupportedFormat(_))
        ));
        assert!(data_source_from_url("  ").is_err());
    }
}
