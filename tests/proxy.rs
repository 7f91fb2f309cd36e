mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, media, test_context, Origin, OriginOptions};
use media_cache_proxy::{FailureKind, MediaProxy};
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::StatusCode;

fn player() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn player_streams_through_proxy() {
    let (_dir, ctx) = test_context();
    let body = media(10_000);
    let origin = Origin::start(body.clone(), OriginOptions::default()).await;
    let url = origin.url("track01.mp3");
    let proxy = MediaProxy::new(ctx.clone());

    let local = proxy.set_data_source(&url, true);
    let addr = proxy.local_addr().unwrap();
    assert_eq!(local, format!("http://127.0.0.1:{}/{}", addr.port(), url));

    let response = player().get(&local).header(RANGE, "bytes=0-").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers()["content-range"].to_str().unwrap(),
        "bytes 0-9999/10000"
    );
    assert_eq!(response.bytes().await.unwrap(), body);

    let entry = ctx.store.open(&url).unwrap().unwrap();
    assert!(eventually(|| ctx.store.cache_parts(&entry).unwrap().cached_len() == 10_000).await);
    assert_eq!(proxy.buffering_progress(0.5), 1.0);
    proxy.set_duration(62_000);
    assert_eq!(ctx.store.info(&entry).unwrap().unwrap().duration, Some(62_000));

    let response = player().get(&local).header(RANGE, "bytes=9000-").send().await.unwrap();
    assert_eq!(response.bytes().await.unwrap(), &body[9000..]);
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn requests_for_other_sources_are_dropped() {
    let (_dir, ctx) = test_context();
    let origin = Origin::start(media(1_000), OriginOptions::default()).await;
    let proxy = MediaProxy::new(ctx);

    let current = proxy.set_data_source(&origin.url("current.mp3"), true);
    let addr = proxy.local_addr().unwrap();
    let stale = format!("http://{}/{}", addr, origin.url("previous.mp3"));
    assert!(player().get(&stale).send().await.is_err());

    proxy.clear_target();
    assert!(player().get(&current).send().await.is_err());
    assert_eq!(origin.hits(), 0);
}

#[tokio::test]
async fn uncacheable_source_bypasses_cache() {
    let (_dir, ctx) = test_context();
    let body = media(3_000);
    let origin = Origin::start(body.clone(), OriginOptions::default()).await;
    let url = origin.url("live.mp3");
    let proxy = MediaProxy::new(ctx.clone());

    let local = proxy.set_data_source(&url, false);
    let response = player().get(&local).send().await.unwrap();
    assert_eq!(response.bytes().await.unwrap(), body);
    assert_eq!(ctx.store.open(&url).unwrap(), None);
}

#[tokio::test]
async fn origin_failures_reach_error_sink() {
    let (_dir, ctx) = test_context();
    let options = OriginOptions {
        status: Some(404),
        ..OriginOptions::default()
    };
    let origin = Origin::start(Vec::new(), options).await;
    let url = origin.url("missing.mp3");
    let proxy = MediaProxy::new(ctx);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    proxy.set_error_sink(Some(Arc::new(move |kind: FailureKind| sink.lock().push(kind))));

    let local = proxy.set_data_source(&url, true);
    let _ = player().get(&local).send().await;

    assert!(eventually(|| !errors.lock().is_empty()).await);
    assert_eq!(*errors.lock(), vec![FailureKind::UrlInvalid]);
}

#[tokio::test]
async fn new_request_supersedes_the_current_one() {
    let (_dir, ctx) = test_context();
    let body = media(20_000);
    let options = OriginOptions {
        chunk_delay: Some(Duration::from_millis(30)),
        ..OriginOptions::default()
    };
    let origin = Origin::start(body.clone(), options).await;
    let url = origin.url("seeked.mp3");
    let proxy = MediaProxy::new(ctx.clone());
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    proxy.set_error_sink(Some(Arc::new(move |kind: FailureKind| sink.lock().push(kind))));
    let local = proxy.set_data_source(&url, true);

    let mut first = player().get(&local).header(RANGE, "bytes=0-").send().await.unwrap();
    let mut head = Vec::new();
    while head.len() < 2_000 {
        let chunk = first.chunk().await.unwrap().expect("first response ended early");
        head.extend_from_slice(&chunk);
    }

    let second = player().get(&local).header(RANGE, "bytes=5000-").send().await.unwrap();
    assert_eq!(second.bytes().await.unwrap(), &body[5000..]);

    while let Ok(Some(chunk)) = first.chunk().await {
        head.extend_from_slice(&chunk);
    }
    assert!(head.len() < 5_000);
    assert_eq!(head, &body[..head.len()]);

    let entry = ctx.store.open(&url).unwrap().unwrap();
    assert!(
        eventually(|| {
            let parts = ctx.store.cache_parts(&entry).unwrap();
            parts.as_slice().first().is_some_and(|p| p.start == 0 && p.end + 1 >= head.len() as u64)
        })
        .await
    );
    assert!(errors.lock().is_empty());
}

#[tokio::test]
async fn start_is_idempotent_and_stop_closes() {
    let (_dir, ctx) = test_context();
    let proxy = MediaProxy::new(ctx);

    let first = proxy.start().unwrap();
    assert_eq!(proxy.start().unwrap(), first);
    assert_eq!(proxy.set_data_source("http://cdn.example.com/", true), "http://cdn.example.com/");
    assert_eq!(proxy.target_url(), None);

    proxy.stop();
    assert_eq!(proxy.local_addr(), None);
    let restarted = proxy.start().unwrap();
    assert_eq!(proxy.local_addr(), Some(restarted));
}
