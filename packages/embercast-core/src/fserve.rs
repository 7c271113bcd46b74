//! The file-serving path: static assets, intro files, and file fallbacks.
//!
//! Writers here are plain per-client tasks pushing bounded chunks; the
//! same helpers serve the static web root, a mount's intro file, and the
//! file at the end of a fallback chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::Client;
use crate::context::ServerContext;
use crate::error::ErrorId;
use crate::protocol::ResponseHead;
use crate::stats::GLOBAL_SCOPE;
use crate::tls::NetStream;

/// Write granularity for file bodies.
const FILE_CHUNK: usize = 8 * 1024;

/// Maps a file path against the configured web root.
///
/// Absolute paths are used as-is (dumpfiles, intro files configured with
/// full paths); relative ones resolve under the web root.
#[must_use]
pub fn resolve_path(ctx: &Arc<ServerContext>, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match &ctx.config().webroot {
        Some(webroot) => webroot.join(path),
        None => path.to_path_buf(),
    }
}

/// Streams a file's bytes to an open stream. Returns the byte count.
pub async fn stream_file(stream: &mut Box<dyn NetStream>, path: &Path) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; FILE_CHUNK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    stream.flush().await?;
    Ok(total)
}

/// Content-Type by file extension; the short list the web root needs.
#[must_use]
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("xml") => "text/xml",
        Some("xsl") | Some("xslt") => "text/xml",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        Some("m3u") => "audio/x-mpegurl",
        Some("mp3") => "audio/mpeg",
        Some("ogg") | Some("oga") => "application/ogg",
        _ => "application/octet-stream",
    }
}

/// Serves a static file request end to end.
///
/// The URI is already normalized (no traversal sequences survive), so the
/// web root join is safe.
pub async fn serve(ctx: &Arc<ServerContext>, mut client: Client) {
    let Some(webroot) = ctx.config().webroot.clone() else {
        client.send_error(ErrorId::FservFileNotFound).await;
        return;
    };

    let relative = client.uri.trim_start_matches('/');
    let mut path = webroot.join(relative);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => path = path.join("index.html"),
        Ok(_) => {}
        Err(_) => {
            client.send_error(ErrorId::FservFileNotFound).await;
            return;
        }
    }
    let meta = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta,
        _ => {
            client.send_error(ErrorId::FservFileNotFound).await;
            return;
        }
    };

    let head = ResponseHead::new(200)
        .header("Content-Type", content_type_for(&path))
        .header("Content-Length", meta.len().to_string())
        .header("Connection", "close");
    if client.send_head(&head).await.is_err() {
        return;
    }

    ctx.stats.inc(GLOBAL_SCOPE, "file_connections");
    match stream_file(&mut client.con.stream, &path).await {
        Ok(sent) => client.con.sent_bytes += sent,
        Err(e) => {
            log::debug!("file {} not fully delivered: {}", path.display(), e);
            client.con.error = true;
        }
    }
    ctx.stats.dec(GLOBAL_SCOPE, "file_connections");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn content_types_cover_the_web_root() {
        assert_eq!(content_type_for(Path::new("status.html")), "text/html");
        assert_eq!(content_type_for(Path::new("style.css")), "text/css");
        assert_eq!(content_type_for(Path::new("list.m3u")), "audio/x-mpegurl");
        assert_eq!(
            content_type_for(Path::new("unknown.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for(Path::new("no_extension")),
            "application/octet-stream"
        );
    }

    #[tokio::test]
    async fn stream_file_sends_whole_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intro.mp3");
        let payload = vec![42u8; FILE_CHUNK * 2 + 17];
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&payload)
            .unwrap();

        let (client, server) = tokio::io::duplex(1 << 20);
        let mut server: Box<dyn NetStream> = Box::new(server);
        let sent = stream_file(&mut server, &path).await.unwrap();
        drop(server);
        assert_eq!(sent, payload.len() as u64);

        use tokio::io::AsyncReadExt;
        let mut client = client;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn missing_files_error() {
        let (_, server) = tokio::io::duplex(1024);
        let mut server: Box<dyn NetStream> = Box::new(server);
        assert!(stream_file(&mut server, Path::new("/no/such/file"))
            .await
            .is_err());
    }
}
