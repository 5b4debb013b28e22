//! End-to-end fetcher behavior against a local HTTP double.

use std::path::PathBuf;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use comfyctl_cache::Cache;
use comfyctl_fetch::{Checksum, FetchError, Fetcher, ModelSource, Publish, VolumeQuota, publish};

const PAYLOAD: &[u8] = b"payload";
const PAYLOAD_SHA256: &str = "sha256:239f59ed55e737c77147cf55ad0c1b030b6d7ee748a7426952f9b852d5a935e5";

fn cache_in(dir: &std::path::Path) -> Cache {
    Cache::from_path(dir.join("cache")).unwrap()
}

#[tokio::test]
async fn downloads_verifies_and_caches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unet.safetensors"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PAYLOAD))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let fetcher = Fetcher::new(cache_in(dir.path()));
    let source = ModelSource::parse(&format!("{}/unet.safetensors", server.uri())).unwrap();
    let checksum: Checksum = PAYLOAD_SHA256.parse().unwrap();

    let cached = fetcher
        .ensure_cached(&source, Some(&checksum), "unet", false, None)
        .await
        .unwrap();
    assert_eq!(fs_err::read(&cached).unwrap(), PAYLOAD);
    assert!(
        cached
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sha256-")
    );

    // A second call must come from the cache: offline works, and the server's
    // expect(1) above would fail the test on a refetch.
    let again = fetcher
        .ensure_cached(&source, Some(&checksum), "unet", true, None)
        .await
        .unwrap();
    assert_eq!(again, cached);
}

#[tokio::test]
async fn checksum_mismatch_never_publishes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unet.safetensors"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"different-bytes".as_slice()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let fetcher = Fetcher::new(cache.clone());
    let source = ModelSource::parse(&format!("{}/unet.safetensors", server.uri())).unwrap();
    let checksum: Checksum = PAYLOAD_SHA256.parse().unwrap();

    let err = fetcher
        .ensure_cached(&source, Some(&checksum), "unet", false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Checksum { .. }), "got {err:?}");

    // Only tempfile debris may remain; the canonical path must not exist.
    let models = cache.bucket(comfyctl_cache::CacheBucket::Models);
    let canonical: Vec<PathBuf> = fs_err::read_dir(&models)
        .unwrap()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .is_some_and(|name| name.to_string_lossy().starts_with("sha256-"))
        })
        .collect();
    assert!(canonical.is_empty(), "unexpected cache entries: {canonical:?}");
}

#[tokio::test]
async fn offline_without_cache_fails() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Fetcher::new(cache_in(dir.path()));
    let source = ModelSource::parse("https://example.invalid/unet.safetensors").unwrap();

    let err = fetcher
        .ensure_cached(&source, None, "unet", true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Offline(_)), "got {err:?}");
}

#[tokio::test]
async fn offline_checksum_mismatch_fails_without_refetch() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());
    let checksum: Checksum = PAYLOAD_SHA256.parse().unwrap();

    // Seed the canonical path with wrong bytes.
    let models = cache.bucket(comfyctl_cache::CacheBucket::Models);
    let canonical = models.join(format!("sha256-{}.safetensors", checksum.digest()));
    fs_err::write(&canonical, b"corrupted").unwrap();

    let fetcher = Fetcher::new(cache);
    let source = ModelSource::parse("https://example.invalid/unet.safetensors").unwrap();
    let err = fetcher
        .ensure_cached(&source, Some(&checksum), "unet", true, None)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Checksum { .. }), "got {err:?}");
    // Offline mode must not delete the evidence.
    assert!(canonical.exists());
}

#[tokio::test]
async fn quota_shortfall_fails_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let cache = cache_in(dir.path());

    let elsewhere = tempfile::tempdir().unwrap();
    let big = elsewhere.path().join("model.bin");
    fs_err::write(&big, vec![0u8; 64 * 1024]).unwrap();

    let fetcher = Fetcher::new(cache.clone()).with_quota(Some(VolumeQuota {
        root: dir.path().to_path_buf(),
        bytes: 1,
    }));
    let source = ModelSource::parse(big.to_str().unwrap()).unwrap();

    let err = fetcher
        .ensure_cached(&source, None, "model.bin", false, None)
        .await
        .unwrap_err();
    let FetchError::NoSpace {
        required,
        available,
        ..
    } = err
    else {
        panic!("expected NoSpace, got {err:?}");
    };
    assert_eq!(required, 64 * 1024);
    assert!(available < required);

    // Nothing may have been written to the models bucket.
    let models = cache.bucket(comfyctl_cache::CacheBucket::Models);
    assert_eq!(fs_err::read_dir(&models).unwrap().count(), 0);
}

#[tokio::test]
async fn publish_roundtrip_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vae.pt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PAYLOAD))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let fetcher = Fetcher::new(cache_in(dir.path()));
    let source = ModelSource::parse(&format!("{}/vae.pt", server.uri())).unwrap();

    let target = dir.path().join("models").join("vae").join("vae.pt");
    let cached = fetcher
        .ensure_cached(&source, None, "vae.pt", false, Some(&target))
        .await
        .unwrap();
    assert_eq!(publish(&cached, &target).unwrap(), Publish::Linked);
    assert_eq!(fs_err::read(&target).unwrap(), PAYLOAD);
}
