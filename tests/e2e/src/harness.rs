//! Test harness: a full service wired over temp-directory stores with the
//! mock collaborators.

use std::sync::Arc;
use tempfile::TempDir;

use engram_core::{DirectStoreInput, EngramConfig, EngramService};

use crate::mocks::{HashEmbedder, MockOracle};

/// Embedding dimension used across the journey tests
pub const TEST_DIMENSION: usize = 32;

/// One fully-wired service instance over temporary stores
pub struct TestHarness {
    pub service: EngramService,
    pub oracle: Arc<MockOracle>,
    pub embedder: Arc<HashEmbedder>,
    // Held for its Drop: removes the store files
    _dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let config = EngramConfig {
            data_dir: Some(dir.path().to_path_buf()),
            embedding_dimension: TEST_DIMENSION,
            ..Default::default()
        };
        let oracle = Arc::new(MockOracle::new());
        let embedder = Arc::new(HashEmbedder::new(TEST_DIMENSION));
        let service = EngramService::open(config, oracle.clone(), embedder.clone())
            .expect("service opens over temp stores");
        Self {
            service,
            oracle,
            embedder,
            _dir: dir,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal direct-store input
pub fn direct_input(user_id: &str, content: &str) -> DirectStoreInput {
    DirectStoreInput {
        user_id: user_id.to_string(),
        content: content.to_string(),
        ..Default::default()
    }
}
