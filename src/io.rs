use std::collections::VecDeque;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use crc32fast::Hasher as Crc32;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader, ReadBuf};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::{Transcoder, Utf8Sanitizer};
use crate::IngestResult;

/// Read buffer for the raw upload stream.
const READ_BUFFER: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct CsvMeta {
    /// e.g. "application/gzip" or "text/csv"
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// just the key/filename (used for extension fallback)
    pub name_hint: String,
    /// Which character encoding to expect (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
    /// Total raw size in bytes, when the caller knows it
    pub size_hint: Option<u64>,
}

impl Default for CsvMeta {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: String::new(),
            name_hint: String::new(),
            charset: encoding_rs::UTF_8,
            size_hint: None,
        }
    }
}

impl CsvMeta {
    pub fn for_file(name: impl Into<String>, size_hint: Option<u64>) -> Self {
        Self {
            name_hint: name.into(),
            size_hint,
            ..Default::default()
        }
    }

    fn is_gzip(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        let ct = self.content_type.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "gzip")
            || matches!(ct.as_str(), "application/gzip" | "application/x-gzip")
            || self.name_hint.to_ascii_lowercase().ends_with(".gz")
    }

    fn is_zstd(&self) -> bool {
        let ce = self.content_encoding.to_ascii_lowercase();
        ce.split(',').any(|s| s.trim() == "zstd")
            || self.content_type.eq_ignore_ascii_case("application/zstd")
            || self.name_hint.to_ascii_lowercase().ends_with(".zst")
    }
}

// ---------------------------------------------------------------------------
// Byte counting
// ---------------------------------------------------------------------------

/// Running counters for one upload's raw byte stream.
#[derive(Debug, Default)]
pub struct ReadStats {
    bytes_read: AtomicU64,
    checksum: AtomicU32,
    total: Option<u64>,
}

impl ReadStats {
    pub fn new(total: Option<u64>) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// CRC32 of every raw byte read so far.
    pub fn checksum(&self) -> u32 {
        self.checksum.load(Ordering::Relaxed)
    }

    /// Percentage of the size hint consumed, capped at 100.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.bytes_read() as f64 / total as f64 * 100.0).min(100.0)),
        }
    }
}

/// Pass-through reader that counts and checksums the raw bytes.
pub struct ByteCounter<R> {
    inner: R,
    hasher: Crc32,
    stats: Arc<ReadStats>,
}

impl<R> ByteCounter<R> {
    pub fn new(inner: R, stats: Arc<ReadStats>) -> Self {
        Self {
            inner,
            hasher: Crc32::new(),
            stats,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ByteCounter<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[before..];
            if !fresh.is_empty() {
                this.hasher.update(fresh);
                this.stats
                    .bytes_read
                    .fetch_add(fresh.len() as u64, Ordering::Relaxed);
                this.stats
                    .checksum
                    .store(this.hasher.clone().finalize(), Ordering::Relaxed);
            }
        }
        poll
    }
}

// ---------------------------------------------------------------------------
// Line tracking
// ---------------------------------------------------------------------------

/// Pass-through reader over the decoded text that remembers where each
/// non-blank line starts, so a record's byte offset can be mapped back to the
/// physical line it was written on.
///
/// The CSV tokenizer reports a record's position as the end of the previous
/// record, before any blank lines or the `\n` of a `\r\n` pair, so offsets are
/// resolved to the first content line at or after them.
pub struct LineTracker<R> {
    inner: R,
    /// `(byte offset, 1-indexed line)` for content lines not yet claimed.
    starts: VecDeque<(u64, u64)>,
    offset: u64,
    line: u64,
    at_line_start: bool,
}

impl<R> LineTracker<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            starts: VecDeque::new(),
            offset: 0,
            line: 1,
            at_line_start: true,
        }
    }

    fn observe(&mut self, chunk: &[u8]) {
        let mut from = 0;
        for nl in memchr::memchr_iter(b'\n', chunk).chain(std::iter::once(chunk.len())) {
            if self.at_line_start {
                if let Some(first) = chunk[from..nl].iter().position(|&b| b != b'\r') {
                    self.starts.push_back((self.offset + (from + first) as u64, self.line));
                    self.at_line_start = false;
                }
            }
            if nl < chunk.len() {
                self.line += 1;
                self.at_line_start = true;
            }
            from = nl + 1;
        }
        self.offset += chunk.len() as u64;
    }

    /// Line of the first content at or after `byte`. Offsets must be asked
    /// for in increasing order; earlier lines are forgotten.
    pub fn line_at(&mut self, byte: u64) -> u64 {
        while self.starts.front().is_some_and(|&(at, _)| at < byte) {
            self.starts.pop_front();
        }
        self.starts.front().map_or(self.line, |&(_, line)| line)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LineTracker<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            this.observe(&buf.filled()[before..]);
        }
        poll
    }
}

// ---------------------------------------------------------------------------
// Reader assembly
// ---------------------------------------------------------------------------

/// From a generic AsyncRead, build the stack handed to the CSV tokenizer:
/// byte counter, optional decompression, then BOM removal plus UTF-8 repair
/// (or transcoding for other charsets).
///
/// Returns the reader and the shared counters for progress reporting.
pub fn build_csv_reader<R>(raw: R, meta: &CsvMeta) -> (impl AsyncRead + Unpin + Send, Arc<ReadStats>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stats = Arc::new(ReadStats::new(meta.size_hint));
    let counted = ByteCounter::new(raw, Arc::clone(&stats));

    let buf = BufReader::with_capacity(READ_BUFFER, counted);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = if meta.is_gzip() {
        Box::new(GzipDecoder::new(buf))
    } else if meta.is_zstd() {
        Box::new(ZstdDecoder::new(buf))
    } else {
        Box::new(buf)
    };

    let text: Box<dyn AsyncRead + Unpin + Send> = if meta.charset == encoding_rs::UTF_8 {
        let framed = FramedRead::with_capacity(decompressed, Utf8Sanitizer::new(), READ_BUFFER);
        Box::new(StreamReader::new(framed))
    } else {
        let framed = FramedRead::with_capacity(decompressed, Transcoder::new(meta.charset), READ_BUFFER);
        Box::new(StreamReader::new(framed))
    };

    (text, stats)
}

/// Open a local file with meta derived from its name and size.
pub async fn reader_from_path(
    path: &Path,
) -> IngestResult<(impl AsyncRead + Unpin + Send, Arc<ReadStats>, CsvMeta)> {
    let file = File::open(path).await?;
    let size = file.metadata().await.ok().map(|m| m.len());
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let mut meta = CsvMeta::for_file(name, size);
    match path.extension().and_then(|s| s.to_str()).unwrap_or_default() {
        "gz" => {
            meta.content_type = "application/gzip".into();
            meta.content_encoding = "gzip".into();
        }
        "zst" => {
            meta.content_type = "application/zstd".into();
            meta.content_encoding = "zstd".into();
        }
        _ => {
            meta.content_type = "text/csv".into();
        }
    }

    let (reader, stats) = build_csv_reader(file, &meta);
    Ok((reader, stats, meta))
}

/// Rough row count for an in-memory upload (newlines, plus a trailing line
/// without one), used only for progress percentages.
pub fn estimate_rows(bytes: &[u8]) -> u64 {
    let newlines = memchr::memchr_iter(b'\n', bytes).count() as u64;
    match bytes.last() {
        None => 0,
        Some(b'\n') => newlines,
        Some(_) => newlines + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn counts_raw_bytes_and_cleans_text() {
        let raw: &[u8] = b"\xEF\xBB\xBFid,name\n1,caf\xC3\xA9\n2,bad\xFF\n";
        let meta = CsvMeta::for_file("x.csv", Some(raw.len() as u64));
        let (mut reader, stats) = build_csv_reader(std::io::Cursor::new(raw.to_vec()), &meta);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();

        assert_eq!(out, "id,name\n1,caf\u{e9}\n2,bad?\n");
        assert_eq!(stats.bytes_read(), raw.len() as u64);
        assert_eq!(stats.percent(), Some(100.0));
        assert_eq!(stats.checksum(), crc32fast::hash(raw));
    }

    #[test]
    fn meta_detects_compression() {
        assert!(CsvMeta::for_file("a.csv.gz", None).is_gzip());
        assert!(CsvMeta::for_file("a.csv.zst", None).is_zstd());
        assert!(!CsvMeta::for_file("a.csv", None).is_gzip());
    }

    #[tokio::test]
    async fn line_tracker_skips_blank_lines_and_crlf() {
        let text = "title\r\n\r\nh1,h2\r\na,1\r\n\n\nb,2";
        let mut tracker = LineTracker::new(text.as_bytes());
        let mut out = Vec::new();
        tracker.read_to_end(&mut out).await.unwrap();

        assert_eq!(tracker.line_at(0), 1);
        // record positions land just past the previous record's `\r`
        assert_eq!(tracker.line_at(6), 3);
        assert_eq!(tracker.line_at(15), 4);
        assert_eq!(tracker.line_at(20), 7);
        assert_eq!(tracker.line_at(text.len() as u64), 7);
    }

    #[test]
    fn line_tracker_handles_lines_split_across_reads() {
        let mut tracker = LineTracker::new(());
        tracker.observe(b"a,1\n\r");
        tracker.observe(b"\n");
        tracker.observe(b"\r");
        tracker.observe(b"b,2\n\"x");
        tracker.observe(b"\ny\"\nc,3\n");

        assert_eq!(tracker.line_at(0), 1);
        assert_eq!(tracker.line_at(4), 3);
        assert_eq!(tracker.line_at(11), 4);
        assert_eq!(tracker.line_at(17), 6);
    }

    #[test]
    fn row_estimate_counts_unterminated_last_line() {
        assert_eq!(estimate_rows(b""), 0);
        assert_eq!(estimate_rows(b"a\nb\n"), 2);
        assert_eq!(estimate_rows(b"a\nb"), 2);
    }
}
