// Byte-range addressable network data source

use crate::client::{parse_total_from_content_range, HttpClient, HttpOptions};
use std::io::Read;
use streamplay_core::{AudioError, CancelFlag, DataSource, Result};

/// Streams a resource over HTTP, reopening with a `Range` request to seek
pub struct HttpDataSource {
    url: String,
    client: HttpClient,
    reader: Option<Box<dyn Read + Send + Sync>>,
    position: u64,
    length: Option<u64>,
    content_type: Option<String>,
    accepts_ranges: bool,
    cancel: Option<CancelFlag>,
}

impl HttpDataSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_options(url, &HttpOptions::default())
    }

    pub fn with_options(url: impl Into<String>, options: &HttpOptions) -> Self {
        Self {
            url: url.into(),
            client: HttpClient::new(options),
            reader: None,
            position: 0,
            length: None,
            content_type: None,
            accepts_ranges: true,
            cancel: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }

    fn connect(&mut self, offset: u64) -> Result<()> {
        if self.is_cancelled() {
            return Err(AudioError::DataSourceError(format!("{} cancelled", self.url)));
        }

        log::debug!("[http] GET {} from byte {}", self.url, offset);
        let response = self.client.get_from(&self.url, offset)?;
        let status = response.status();

        if offset > 0 && status != 206 {
            // The server ignored the range; it will only ever send from the start
            self.accepts_ranges = false;
            return Err(AudioError::DataSourceError(format!(
                "{} does not support range requests (HTTP {})",
                self.url, status
            )));
        }

        self.length = if status == 206 {
            response
                .header("Content-Range")
                .and_then(parse_total_from_content_range)
        } else {
            response
                .header("Content-Length")
                .and_then(|s| s.trim().parse::<u64>().ok())
        }
        .or(self.length);

        if let Some(content_type) = response.header("Content-Type") {
            let mime = content_type.split(';').next().unwrap_or_default().trim();
            if !mime.is_empty() {
                self.content_type = Some(mime.to_ascii_lowercase());
            }
        }

        self.reader = Some(response.into_reader());
        self.position = offset;
        Ok(())
    }
}

impl DataSource for HttpDataSource {
    fn open(&mut self, offset: u64) -> Result<()> {
        self.reader = None;
        if let Some(length) = self.length {
            if offset >= length {
                self.position = length;
                return Ok(());
            }
        }
        self.connect(offset)
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.is_cancelled() {
            return Err(AudioError::DataSourceError(format!("{} cancelled", self.url)));
        }
        if self.reader.is_none() {
            if self.length.map(|l| self.position >= l).unwrap_or(false) {
                return Ok(0);
            }
            self.connect(self.position)?;
        }
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };

        let read = reader
            .read(buf)
            .map_err(|e| AudioError::NetworkError(format!("Failed to read {}: {}", self.url, e)))?;
        self.position += read as u64;

        if read == 0 {
            if let Some(length) = self.length {
                if self.position < length {
                    self.reader = None;
                    return Err(AudioError::NetworkError(format!(
                        "Connection to {} closed at byte {} of {}",
                        self.url, self.position, length
                    )));
                }
            }
        }
        Ok(read)
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_seekable(&self) -> bool {
        self.accepts_ranges
    }

    fn format_hint(&self) -> Option<String> {
        self.content_type.clone().or_else(|| {
            let path = self.url.split(['?', '#']).next().unwrap_or_default();
            let (_, extension) = path.rsplit_once('.')?;
            (!extension.contains('/')).then(|| extension.to_ascii_lowercase())
        })
    }

    fn attach_cancel(&mut self, cancel: CancelFlag) {
        self.cancel = Some(cancel);
    }

    fn close(&mut self) {
        self.reader = None;
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one canned response per accepted connection, returning the request lines
    fn serve(responses: Vec<Vec<u8>>) -> (String, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for response in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut head = String::new();
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    head.push_str(&line);
                }
                requests.push(head);
                stream.write_all(&response).unwrap();
            }
            requests
        });
        (format!("http://{}/song.wav", address), handle)
    }

    fn response(status: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {}\r\nConnection: close\r\nContent-Length: {}\r\n",
            status,
            body.len()
        );
        for (name, value) in headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(body);
        bytes
    }

    fn read_all(source: &mut HttpDataSource) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = source.read_into(&mut buf).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn reads_whole_body_and_length() {
        let headers = [("Content-Type", "audio/wav".to_string())];
        let (url, server) = serve(vec![response("200 OK", &headers, b"0123456789")]);
        let mut source = HttpDataSource::new(url);
        source.open(0).unwrap();
        assert_eq!(source.length(), Some(10));
        assert_eq!(read_all(&mut source), b"0123456789");
        assert_eq!(source.position(), 10);
        assert_eq!(source.format_hint().as_deref(), Some("audio/wav"));
        server.join().unwrap();
    }

    #[test]
    fn reopen_sends_range_request() {
        let (url, server) = serve(vec![
            response("200 OK", &[], b"0123456789"),
            response("206 Partial Content", &[("Content-Range", "bytes 6-9/10".into())], b"6789"),
        ]);
        let mut source = HttpDataSource::new(url);
        source.open(0).unwrap();
        source.open(6).unwrap();
        assert_eq!(read_all(&mut source), b"6789");

        let requests = server.join().unwrap();
        assert!(requests[1].to_ascii_lowercase().contains("range: bytes=6-"));
    }

    #[test]
    fn missing_resource_is_data_not_found() {
        let (url, server) = serve(vec![response("404 Not Found", &[], b"")]);
        let mut source = HttpDataSource::new(url);
        let err = source.open(0).unwrap_err();
        assert!(matches!(err, AudioError::DataNotFound(_)));
        server.join().unwrap();
    }

    #[test]
    fn cancelled_source_refuses_to_connect() {
        let mut source = HttpDataSource::new("http://127.0.0.1:9/never");
        let cancel = CancelFlag::new();
        source.attach_cancel(cancel.clone());
        cancel.cancel();
        assert!(source.open(0).is_err());
    }

    #[test]
    fn hint_falls_back_to_extension() {
        let source = HttpDataSource::new("https://example.com/a/b/track.WAV?token=1");
        assert_eq!(source.format_hint().as_deref(), Some("wav"));
    }
}
