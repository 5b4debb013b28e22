//! Realization against real git and python, with HTTP doubles for models.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use comfyctl_cache::Cache;
use comfyctl_process::Command;
use comfyctl_realize::{RealizeError, RealizeSettings, realize};
use comfyctl_spec::{
    MARKER_FILE, ResolvedEngine, ResolvedLock, ResolvedModel, ResolvedOptions,
};

const PAYLOAD: &[u8] = b"payload";
const PAYLOAD_SHA256: &str = "sha256:239f59ed55e737c77147cf55ad0c1b030b6d7ee748a7426952f9b852d5a935e5";

fn toolchain_available() -> bool {
    which::which("git").is_ok()
        && (which::which("python3").is_ok() || which::which("python").is_ok())
}

async fn git(args: &[&str], cwd: &Path) {
    let output = Command::new("git")
        .args(args.iter().copied())
        .current_dir(cwd)
        .output()
        .await;
    assert!(output.success(), "git {args:?} failed: {}", output.stderr);
}

async fn upstream_engine(dir: &Path) -> (String, String) {
    fs_err::create_dir_all(dir).unwrap();
    git(&["init", "-q", "-b", "main"], dir).await;
    git(&["config", "user.email", "ci@example.com"], dir).await;
    git(&["config", "user.name", "ci"], dir).await;
    fs_err::write(dir.join("main.py"), "print('engine')\n").unwrap();
    git(&["add", "main.py"], dir).await;
    git(&["commit", "-q", "-m", "initial"], dir).await;
    let head = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .await;
    (format!("file://{}", dir.display()), head.stdout)
}

fn lock(repo: &str, commit: &str, models: Vec<ResolvedModel>) -> ResolvedLock {
    ResolvedLock {
        schema_version: 2,
        version_id: "t".to_string(),
        comfy: ResolvedEngine {
            repo: repo.to_string(),
            reference: None,
            commit: commit.to_string(),
        },
        custom_nodes: vec![],
        models,
        env: BTreeMap::new(),
        options: ResolvedOptions::default(),
    }
}

fn settings(root: &Path) -> RealizeSettings {
    RealizeSettings {
        target: Some(root.join("builds").join("comfy-t")),
        models_dir: Some(root.join("models")),
        ..RealizeSettings::default()
    }
}

#[tokio::test]
async fn realize_then_fast_path() {
    if !toolchain_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (repo, commit) = upstream_engine(&dir.path().join("upstream")).await;
    let cache = Cache::from_path(dir.path().join("cache")).unwrap();
    let lock = lock(&repo, &commit, vec![]);
    let settings = settings(dir.path());

    let env = realize(&lock, &cache, &settings).await.unwrap();
    assert!(env.engine_home.join("main.py").is_file());
    assert!(env.interpreter.is_file());
    assert!(env.engine_home.join(MARKER_FILE).is_file());
    assert!(env.engine_home.join("extra_model_paths.yaml").is_file());

    // The marker is the fast-path gate: a second realize must not rewrite it
    // (mtime included) nor touch the checkout.
    let marker_mtime = fs_err::metadata(env.engine_home.join(MARKER_FILE))
        .unwrap()
        .modified()
        .unwrap();
    let again = realize(&lock, &cache, &settings).await.unwrap();
    assert_eq!(again.engine_home, env.engine_home);
    assert_eq!(
        fs_err::metadata(env.engine_home.join(MARKER_FILE))
            .unwrap()
            .modified()
            .unwrap(),
        marker_mtime
    );
}

#[tokio::test]
async fn offline_unpinned_without_checkout_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::from_path(dir.path().join("cache")).unwrap();
    let mut unpinned = lock("https://example.invalid/engine.git", "", vec![]);
    unpinned.options.offline = true;

    let err = realize(&unpinned, &cache, &settings(dir.path()))
        .await
        .unwrap_err();
    assert!(matches!(err, RealizeError::Offline(_)), "got {err:?}");
}

#[tokio::test]
async fn models_are_placed_and_healed() {
    if !toolchain_available() {
        return;
    }
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unet.safetensors"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(PAYLOAD))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (repo, commit) = upstream_engine(&dir.path().join("upstream")).await;
    let cache = Cache::from_path(dir.path().join("cache")).unwrap();
    let model = ResolvedModel {
        source: format!("{}/unet.safetensors", server.uri()),
        name: "unet.safetensors".to_string(),
        target_subdir: Some("unet".to_string()),
        target_path: "unet/unet.safetensors".to_string(),
        checksum: Some(PAYLOAD_SHA256.to_string()),
    };
    let lock = lock(&repo, &commit, vec![model]);
    let settings = settings(dir.path());

    let env = realize(&lock, &cache, &settings).await.unwrap();
    let target = env.models_dir.join("unet").join("unet.safetensors");
    assert_eq!(fs_err::read(&target).unwrap(), PAYLOAD);

    // Corrupt the placed file: the next (fast-path) realize verifies the
    // checksum and heals the target from the cache.
    fs_err::remove_file(&target).unwrap();
    fs_err::write(&target, b"corrupted").unwrap();
    realize(&lock, &cache, &settings).await.unwrap();
    assert_eq!(fs_err::read(&target).unwrap(), PAYLOAD);
}

#[tokio::test]
async fn skip_models_leaves_models_dir_alone() {
    if !toolchain_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (repo, commit) = upstream_engine(&dir.path().join("upstream")).await;
    let cache = Cache::from_path(dir.path().join("cache")).unwrap();
    let model = ResolvedModel {
        // Unreachable on purpose: skip_models must prevent any fetch.
        source: "https://example.invalid/never.bin".to_string(),
        name: "never.bin".to_string(),
        target_subdir: None,
        target_path: "never.bin".to_string(),
        checksum: None,
    };
    let mut lock = lock(&repo, &commit, vec![model]);
    lock.options.skip_models = true;

    let env = realize(&lock, &cache, &settings(dir.path())).await.unwrap();
    assert!(!env.models_dir.join("never.bin").exists());
    // The path mapping still names the custom prefix for prepared homes.
    assert!(env.engine_home.join("extra_model_paths.yaml").is_file());
}

#[tokio::test]
async fn checksum_mismatch_without_overwrite_fails() {
    if !toolchain_available() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (repo, commit) = upstream_engine(&dir.path().join("upstream")).await;
    let cache = Cache::from_path(dir.path().join("cache")).unwrap();

    let settings = RealizeSettings {
        no_overwrite: true,
        ..settings(dir.path())
    };
    // Pre-place a wrong file at the target.
    let target_dir = dir.path().join("models").join("unet");
    fs_err::create_dir_all(&target_dir).unwrap();
    fs_err::write(target_dir.join("unet.safetensors"), b"wrong-bytes").unwrap();

    let model = ResolvedModel {
        source: "https://example.invalid/unet.safetensors".to_string(),
        name: "unet.safetensors".to_string(),
        target_subdir: Some("unet".to_string()),
        target_path: "unet/unet.safetensors".to_string(),
        checksum: Some(PAYLOAD_SHA256.to_string()),
    };
    let lock = lock(&repo, &commit, vec![model]);
    let err = realize(&lock, &cache, &settings).await.unwrap_err();
    assert!(
        matches!(
            &err,
            RealizeError::Fetch(comfyctl_fetch::FetchError::Checksum { .. })
        ),
        "got {err:?}"
    );
}
