//! Integration tests for the content-addressed block store and block service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use threeds_server::blocks::{
    compute_hash, Block, BlockService, BlockStore, ContentAddressedStore, ModelDecoder,
};
use threeds_server::cancel::{self, Canceller};
use threeds_server::{Error, Result};

fn block_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_store_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path()).await.unwrap();

    let first = store.store_block(b"vertex data").await.unwrap();
    let second = store.store_block(b"vertex data").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first, compute_hash(b"vertex data"));
    assert_eq!(block_files(dir.path()), vec![first.clone()]);
}

#[tokio::test]
async fn test_concurrent_identical_stores_keep_one_copy() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlockStore::open(dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.store_block(b"same bytes").await.unwrap() }));
    }
    let mut hashes = Vec::new();
    for handle in handles {
        hashes.push(handle.await.unwrap());
    }
    hashes.dedup();

    assert_eq!(hashes.len(), 1);
    assert_eq!(block_files(dir.path()), hashes);
}

#[tokio::test]
async fn test_get_returns_payload_and_size() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path()).await.unwrap();
    let hash = store.store_block(b"0123456789").await.unwrap();

    let block = store.get_block(&hash).await.unwrap();
    assert_eq!(block.data, b"0123456789");
    assert_eq!(block.size, 10);
    assert_eq!(block.hash, hash);

    let upper = store.get_block(&hash.to_uppercase()).await.unwrap();
    assert_eq!(upper.data, block.data);
}

#[tokio::test]
async fn test_missing_and_deleted_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path()).await.unwrap();
    let unknown = compute_hash(b"never stored");

    assert!(matches!(store.get_block(&unknown).await, Err(Error::NotFound(_))));
    assert!(!store.has_block(&unknown).await.unwrap());

    let hash = store.store_block(b"short lived").await.unwrap();
    assert!(store.has_block(&hash).await.unwrap());
    store.delete_block(&hash).await.unwrap();

    assert!(matches!(store.get_block(&hash).await, Err(Error::NotFound(_))));
    assert!(matches!(store.delete_block(&hash).await, Err(Error::NotFound(_))));
    assert!(block_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_malformed_hash_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = BlockStore::open(dir.path()).await.unwrap();
    assert!(matches!(store.get_block("../secret").await, Err(Error::Validation(_))));
    assert!(matches!(store.delete_block("abc").await, Err(Error::Validation(_))));
}

/// Splits input on newlines; accepts "obj" only.
struct LineDecoder;

impl ModelDecoder for LineDecoder {
    fn supports(&self, format: &str) -> bool {
        format == "obj"
    }

    fn decode(&self, _format: &str, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(data
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| line.to_vec())
            .collect())
    }
}

#[tokio::test]
async fn test_process_model_data_stores_records_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlockStore::open(dir.path()).await.unwrap());
    let service = BlockService::new(store.clone(), Arc::new(LineDecoder));

    let input = b"v 0 0 0\nv 1 0 0\nv 0 0 0\n".to_vec();
    let hashes = service
        .process_model_data("OBJ", &mut input.as_slice(), &cancel::never())
        .await
        .unwrap();

    assert_eq!(hashes.len(), 3);
    assert_eq!(hashes[0], hashes[2]);
    assert_eq!(block_files(dir.path()).len(), 2);

    let blocks = service.get_model_blocks(&hashes).await.unwrap();
    let lines: Vec<&[u8]> = blocks.iter().map(|b| b.data.as_slice()).collect();
    assert_eq!(lines, vec![&b"v 0 0 0"[..], b"v 1 0 0", b"v 0 0 0"]);

    service.delete_block(&hashes[1]).await.unwrap();
    assert!(matches!(service.get_model_blocks(&hashes).await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_unsupported_format_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlockStore::open(dir.path()).await.unwrap());
    let service = BlockService::new(store, Arc::new(LineDecoder));

    let err = service
        .process_model_data("fbx", &mut &b"anything\n"[..], &cancel::never())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(block_files(dir.path()).is_empty());
}

#[tokio::test]
async fn test_cancelled_import_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(BlockStore::open(dir.path()).await.unwrap());
    let service = BlockService::new(store, Arc::new(LineDecoder));
    let (canceller, signal) = Canceller::new();
    canceller.cancel();

    let err = service
        .process_model_data("obj", &mut &b"v 1 2 3\n"[..], &signal)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(block_files(dir.path()).is_empty());
}

/// Store that fails on the Nth write, delegating everything else.
struct FlakyStore {
    inner: BlockStore,
    fail_on: usize,
    writes: AtomicUsize,
}

#[async_trait]
impl ContentAddressedStore for FlakyStore {
    async fn store_block(&self, data: &[u8]) -> Result<String> {
        if self.writes.fetch_add(1, Ordering::SeqCst) == self.fail_on {
            return Err(Error::Io(std::io::Error::other("disk full")));
        }
        self.inner.store_block(data).await
    }

    async fn get_block(&self, hash: &str) -> Result<Block> {
        self.inner.get_block(hash).await
    }

    async fn has_block(&self, hash: &str) -> Result<bool> {
        self.inner.has_block(hash).await
    }

    async fn delete_block(&self, hash: &str) -> Result<()> {
        self.inner.delete_block(hash).await
    }
}

#[tokio::test]
async fn test_failed_import_rolls_back_new_blocks_only() {
    let dir = tempfile::tempdir().unwrap();
    let inner = BlockStore::open(dir.path()).await.unwrap();
    let existing = inner.store_block(b"v 0 0 0").await.unwrap();

    let store = Arc::new(FlakyStore {
        inner,
        fail_on: 2,
        writes: AtomicUsize::new(0),
    });
    let service = BlockService::new(store, Arc::new(LineDecoder));

    let err = service
        .process_model_data("obj", &mut &b"v 0 0 0\nv 9 9 9\nv 5 5 5\n"[..], &cancel::never())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Io(_)));
    assert_eq!(block_files(dir.path()), vec![existing]);
}
