//! Fetches a URL into a [`DiskCache`] over real HTTP, twice, to show the
//! second call coming back as a cache hit. Run with:
//!
//!     cargo run --example fetch_over_http
//!
//! Drives an in-process axum server over real HTTP so the two fetches
//! exercise the cache the same way a caller fetching from a remote host
//! would.

use std::{io, net::SocketAddr, sync::Arc};

use axum::{routing::get, Router};
use fetchcache::{url_hasher::sha256_utf8, BoxFetcher, Cache, ChunkStream, DiskCache};
use futures::TryStreamExt;
use tokio::io::AsyncReadExt;

const PAYLOAD: &str = "the quick brown fox jumps over the lazy dog\n";

async fn serve() -> SocketAddr {
    let app = Router::new().route("/payload.txt", get(|| async { PAYLOAD }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn http_fetcher(client: reqwest::Client) -> BoxFetcher<String> {
    Arc::new(move |url: &String| {
        let client = client.clone();
        let url = url.clone();
        async_stream_from_request(client, url)
    })
}

fn async_stream_from_request(client: reqwest::Client, url: String) -> ChunkStream {
    let stream = futures::stream::once(async move { client.get(&url).send().await })
        .map_err(io::Error::other)
        .and_then(|resp| async move { Ok(resp.bytes_stream().map_err(io::Error::other)) })
        .try_flatten();
    Box::pin(stream)
}

#[tokio::main]
async fn main() {
    tracing_subscriber_init();

    let addr = serve().await;
    let url = format!("http://{addr}/payload.txt");

    let cache_dir = tempfile::tempdir().expect("create temp cache dir");
    let cache = DiskCache::try_create(cache_dir.path(), sha256_utf8)
        .expect("open disk cache");

    let client = reqwest::Client::new();
    let fetcher = http_fetcher(client);

    let mut entry = cache
        .fetch(url.clone(), fetcher.clone(), 3)
        .await
        .expect("first fetch");
    let mut body = String::new();
    entry.reader().read_to_string(&mut body).await.unwrap();
    println!("fetched {} bytes, content digest {}", body.len(), entry.content_digest());
    println!("misses={} hits={}", cache.misses(), cache.hits());

    cache.fetch(url, fetcher, 3).await.expect("second fetch");
    println!("misses={} hits={}", cache.misses(), cache.hits());
}

fn tracing_subscriber_init() {
    let _ = tracing_subscriber::fmt::try_init();
}
