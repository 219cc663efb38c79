#![allow(dead_code)]

use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn article_html(title: &str) -> String {
    format!(
        r#"<html lang="en"><head><title>{title}</title>
<meta name="description" content="About {title}">
<meta property="article:published_time" content="2022-01-02T03:04:05Z"></head>
<body><article><p>{title} north korea news</p></article></body></html>"#
    )
}

/// One uncompressed WARC response record.
pub fn warc_response(url: &str, status: &str, html: &str) -> Vec<u8> {
    let block = format!("HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}");
    let mut out = String::new();
    out.push_str("WARC/1.0\r\n");
    out.push_str("WARC-Type: response\r\n");
    out.push_str("WARC-Record-ID: <urn:uuid:00000000-0000-0000-0000-000000000000>\r\n");
    out.push_str("WARC-Date: 2024-07-23T19:42:08Z\r\n");
    out.push_str(&format!("WARC-Target-URI: {url}\r\n"));
    out.push_str("Content-Type: application/http; msgtype=response\r\n");
    out.push_str(&format!("Content-Length: {}\r\n", block.len()));
    out.push_str("\r\n");
    out.push_str(&block);
    out.push_str("\r\n\r\n");
    out.into_bytes()
}

/// A gzipped segment as served by a CDX byte range.
pub fn segment(url: &str) -> Vec<u8> {
    gzip(&warc_response(url, "200 OK", &article_html(url)))
}

pub fn cdx_line(url: &str, mime: &str, status: &str, offset: u64) -> String {
    format!(
        r#"com,example)/ 20240723213521 {{"url": "{url}", "mime": "{mime}", "status": "{status}", "length": "100", "offset": "{offset}", "filename": "crawl-data/seg.warc.gz"}}"#
    )
}

pub fn write_cdx(path: &Path, lines: &[String]) {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).unwrap();
    }
    std::fs::write(path, gzip(lines.join("\n").as_bytes())).unwrap();
}
