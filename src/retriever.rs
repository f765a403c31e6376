use std::fs;
use std::io::{Cursor, Read};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, IF_MODIFIED_SINCE, USER_AGENT};
use tracing::debug;
use zip::ZipArchive;

use crate::error::RetrievalError;
use crate::locator::{Locator, Scheme};
use crate::result::{Progress, Retrieval};

const READ_CHUNK: usize = 8 * 1024;

/// One blocking transfer for one locator. Given an optional last known
/// version timestamp, produces either payload bytes, a not-modified signal,
/// or an error. Implementations must not retry.
pub trait Retriever: Send + Sync {
    fn retrieve(
        &self,
        locator: &Locator,
        if_modified_since: Option<SystemTime>,
        decompress: bool,
        progress: &Progress,
    ) -> Result<Retrieval, RetrievalError>;
}

/// Reads `file:` locators. The conditional check is a single stat call; the
/// payload is only read when the file is newer than the supplied timestamp.
pub struct FileFetcher;

impl Retriever for FileFetcher {
    fn retrieve(
        &self,
        locator: &Locator,
        if_modified_since: Option<SystemTime>,
        decompress: bool,
        progress: &Progress,
    ) -> Result<Retrieval, RetrievalError> {
        let path = locator
            .to_file_path()
            .ok_or_else(|| RetrievalError::InvalidLocator(locator.to_string()))?;
        let metadata = fs::metadata(&path).map_err(|err| RetrievalError::Io(err.to_string()))?;
        if let (Some(since), Ok(mtime)) = (if_modified_since, metadata.modified()) {
            if mtime <= since {
                debug!(%locator, "file unchanged");
                return Ok(Retrieval::not_modified());
            }
        }
        progress.set_content_length(metadata.len());
        let data = fs::read(&path).map_err(|err| RetrievalError::Io(err.to_string()))?;
        progress.add_bytes_read(data.len() as u64);
        let data = if decompress { inflate(data)? } else { data };
        Ok(Retrieval::with_data(data, None))
    }
}

/// Fetches `http:`/`https:` locators over a blocking client with configured
/// connect and read timeouts. Sends `If-Modified-Since` when a timestamp is
/// supplied and classifies the response status: 2xx carries data, 304 maps
/// to not-modified, anything else is a protocol error with the server's
/// message attached.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, RetrievalError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("terra-retriever/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| RetrievalError::Io(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .map_err(|err| RetrievalError::Connection(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Retriever for HttpFetcher {
    fn retrieve(
        &self,
        locator: &Locator,
        if_modified_since: Option<SystemTime>,
        decompress: bool,
        progress: &Progress,
    ) -> Result<Retrieval, RetrievalError> {
        let mut request = self.client.get(locator.as_str());
        if let Some(since) = if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, http_date(since));
        }
        let mut response = request.send().map_err(classify_transport_error)?;

        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(%locator, "server reported not modified");
            return Ok(Retrieval::not_modified());
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "request failed".to_string());
            return Err(RetrievalError::Protocol { status, message });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        if let Some(len) = response.content_length() {
            progress.set_content_length(len);
        }

        let mut body = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let count = response
                .read(&mut chunk)
                .map_err(|err| RetrievalError::Io(err.to_string()))?;
            if count == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..count]);
            progress.add_bytes_read(count as u64);
        }

        let body = if decompress { inflate(body)? } else { body };
        Ok(Retrieval::with_data(body, content_type))
    }
}

/// Dispatches to the strategy matching the locator's scheme. In-process
/// `res:` locators never reach this layer.
pub struct StandardRetriever {
    file: FileFetcher,
    http: HttpFetcher,
}

impl StandardRetriever {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, RetrievalError> {
        Ok(Self {
            file: FileFetcher,
            http: HttpFetcher::new(connect_timeout, read_timeout)?,
        })
    }
}

impl Retriever for StandardRetriever {
    fn retrieve(
        &self,
        locator: &Locator,
        if_modified_since: Option<SystemTime>,
        decompress: bool,
        progress: &Progress,
    ) -> Result<Retrieval, RetrievalError> {
        match locator.scheme() {
            Scheme::File => self
                .file
                .retrieve(locator, if_modified_since, decompress, progress),
            Scheme::Http | Scheme::Https => self
                .http
                .retrieve(locator, if_modified_since, decompress, progress),
            Scheme::Resource => Err(RetrievalError::InvalidLocator(format!(
                "{locator}: in-process locators are resolved without a transfer"
            ))),
        }
    }
}

fn classify_transport_error(err: reqwest::Error) -> RetrievalError {
    if err.is_timeout() || err.is_connect() {
        RetrievalError::Connection(err.to_string())
    } else {
        RetrievalError::Io(err.to_string())
    }
}

fn http_date(time: SystemTime) -> String {
    let datetime: DateTime<Utc> = time.into();
    datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Expands a zip or gzip payload, detected by magic bytes. An uncompressed
/// payload passes through verbatim. For zip archives the first file entry is
/// the payload.
fn inflate(body: Vec<u8>) -> Result<Vec<u8>, RetrievalError> {
    if body.starts_with(&[0x50, 0x4b, 0x03, 0x04]) {
        let mut archive = ZipArchive::new(Cursor::new(body))
            .map_err(|err| RetrievalError::Io(err.to_string()))?;
        if archive.len() == 0 {
            return Err(RetrievalError::Io("empty zip payload".to_string()));
        }
        let mut entry = archive
            .by_index(0)
            .map_err(|err| RetrievalError::Io(err.to_string()))?;
        let mut inflated = Vec::new();
        entry
            .read_to_end(&mut inflated)
            .map_err(|err| RetrievalError::Io(err.to_string()))?;
        Ok(inflated)
    } else if body.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(body.as_slice());
        let mut inflated = Vec::new();
        decoder
            .read_to_end(&mut inflated)
            .map_err(|err| RetrievalError::Io(err.to_string()))?;
        Ok(inflated)
    } else {
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn file_fetcher_reads_payload() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("elevation.bil");
        fs::write(&path, b"grid-bytes").unwrap();

        let locator: Locator = format!("file://{}", path.display()).parse().unwrap();
        let progress = Progress::default();
        let retrieval = FileFetcher
            .retrieve(&locator, None, false, &progress)
            .unwrap();

        assert_eq!(retrieval.data.unwrap(), b"grid-bytes");
        assert!(!retrieval.not_modified);
        assert_eq!(progress.bytes_read(), 10);
    }

    #[test]
    fn file_fetcher_reports_unchanged() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("tile.png");
        fs::write(&path, b"pixels").unwrap();
        let mtime = fs::metadata(&path).unwrap().modified().unwrap();

        let locator: Locator = format!("file://{}", path.display()).parse().unwrap();
        let retrieval = FileFetcher
            .retrieve(&locator, Some(mtime), false, &Progress::default())
            .unwrap();

        assert!(retrieval.not_modified);
        assert!(retrieval.data.is_none());
    }

    #[test]
    fn file_fetcher_missing_file_is_io_error() {
        let locator: Locator = "file:///definitely/not/here".parse().unwrap();
        let err = FileFetcher
            .retrieve(&locator, None, false, &Progress::default())
            .unwrap_err();
        assert_matches!(err, RetrievalError::Io(_));
    }

    #[test]
    fn inflate_passes_plain_bytes_through() {
        let body = b"plain payload".to_vec();
        assert_eq!(inflate(body.clone()).unwrap(), body);
    }

    #[test]
    fn inflate_expands_gzip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"tile-bytes").unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(inflate(compressed).unwrap(), b"tile-bytes");
    }

    #[test]
    fn inflate_expands_first_zip_entry() {
        let mut archive = zip::ZipWriter::new(Cursor::new(Vec::new()));
        archive
            .start_file("tile.png", zip::write::SimpleFileOptions::default())
            .unwrap();
        archive.write_all(b"zipped-tile").unwrap();
        let compressed = archive.finish().unwrap().into_inner();

        assert_eq!(inflate(compressed).unwrap(), b"zipped-tile");
    }

    #[test]
    fn http_date_format() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777);
        assert_eq!(http_date(time), "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
