//! Local evidence persistence: date-partitioned layout, atomic writes,
//! detached signatures, and the per-site hash chain.
//!
//! Layout: `<root>/YYYY/MM/DD/<bundle_id>/bundle.json` + `bundle.sig`.
//! The chain head lives in `<root>/CHAIN` and strictly reflects the order
//! of local persistence.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::debug;

use custos_shared::canonical::{self, ZERO_HASH};
use custos_shared::evidence::EvidenceBundle;

use crate::signing::EvidenceSigner;
use crate::util::fs::atomic_write;

const CHAIN_FILE: &str = "CHAIN";

#[derive(Debug, Clone)]
pub struct PersistedBundle {
    pub bundle: EvidenceBundle,
    pub bundle_path: PathBuf,
    pub signature_path: PathBuf,
    pub content_hash: String,
}

#[derive(Debug)]
pub struct ChainReport {
    pub bundles_seen: usize,
    pub chain_length: usize,
    pub intact: bool,
    pub broken_at: Option<String>,
}

pub struct EvidenceStore {
    root: PathBuf,
    chain_head: Mutex<Option<String>>,
}

impl EvidenceStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create evidence root {}", root.display()))?;
        let chain_path = root.join(CHAIN_FILE);
        let chain_head = match fs::read_to_string(&chain_path) {
            Ok(contents) => {
                let head = contents.trim().to_string();
                if head.is_empty() {
                    None
                } else {
                    Some(head)
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read chain head {}", chain_path.display()))
            }
        };
        Ok(EvidenceStore {
            root: root.to_path_buf(),
            chain_head: Mutex::new(chain_head),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chain_head(&self) -> Option<String> {
        self.chain_head.lock().expect("chain head poisoned").clone()
    }

    fn bundle_dir(&self, bundle: &EvidenceBundle) -> PathBuf {
        let date = bundle.timestamp_start.date_naive();
        self.root
            .join(date.format("%Y").to_string())
            .join(date.format("%m").to_string())
            .join(date.format("%d").to_string())
            .join(&bundle.bundle_id)
    }

    /// Chain, sign, and persist one bundle. The write is atomic and the
    /// chain head is advanced only after both files are durable; a bundle
    /// is never observable half-written or unsigned.
    pub fn persist(
        &self,
        signer: &EvidenceSigner,
        mut bundle: EvidenceBundle,
    ) -> Result<PersistedBundle> {
        let mut head = self.chain_head.lock().expect("chain head poisoned");

        bundle.previous_bundle_hash = Some(head.clone().unwrap_or_else(|| ZERO_HASH.to_string()));
        bundle
            .validate()
            .map_err(|e| anyhow!("refusing to persist invalid bundle: {e}"))?;

        let bytes = bundle.canonical_bytes().context("canonicalize bundle")?;
        let signature = signer.sign(&bytes);
        let hash = canonical::content_hash(&bytes);

        let dir = self.bundle_dir(&bundle);
        let bundle_path = dir.join("bundle.json");
        let signature_path = dir.join("bundle.sig");
        atomic_write(&bundle_path, &bytes)?;
        atomic_write(&signature_path, &signature.to_bytes())?;
        atomic_write(&self.root.join(CHAIN_FILE), hash.as_bytes())?;

        *head = Some(hash.clone());
        debug!(bundle_id = %bundle.bundle_id, %hash, "persisted evidence bundle");

        Ok(PersistedBundle {
            bundle,
            bundle_path,
            signature_path,
            content_hash: hash,
        })
    }

    pub fn load(path: &Path) -> Result<EvidenceBundle> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read bundle {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse bundle {}", path.display()))
    }

    /// Verify the detached signature of one persisted bundle. The on-disk
    /// bytes are canonical, so verification runs over the file content
    /// directly.
    pub fn verify_files(
        bundle_path: &Path,
        signature_path: &Path,
        key: &VerifyingKey,
    ) -> Result<bool> {
        let bytes = fs::read(bundle_path)
            .with_context(|| format!("failed to read {}", bundle_path.display()))?;
        let sig_bytes = fs::read(signature_path)
            .with_context(|| format!("failed to read {}", signature_path.display()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| anyhow!("signature file is not a valid Ed25519 signature"))?;
        Ok(key.verify(&bytes, &signature).is_ok())
    }

    /// Walk every persisted bundle and follow the hash chain back from
    /// the head to the all-zero genesis pointer.
    pub fn verify_chain(&self) -> Result<ChainReport> {
        let mut by_hash = std::collections::HashMap::new();
        let mut bundles_seen = 0usize;

        for bundle_path in self.walk_bundles()? {
            let bytes = fs::read(&bundle_path)?;
            let bundle: EvidenceBundle = serde_json::from_str(&String::from_utf8_lossy(&bytes))
                .with_context(|| format!("failed to parse {}", bundle_path.display()))?;
            by_hash.insert(canonical::content_hash(&bytes), bundle);
            bundles_seen += 1;
        }

        let mut chain_length = 0usize;
        let mut cursor = self.chain_head();
        while let Some(hash) = cursor {
            if hash == ZERO_HASH {
                break;
            }
            match by_hash.get(&hash) {
                Some(bundle) => {
                    chain_length += 1;
                    cursor = bundle.previous_bundle_hash.clone();
                }
                None => {
                    return Ok(ChainReport {
                        bundles_seen,
                        chain_length,
                        intact: false,
                        broken_at: Some(hash),
                    });
                }
            }
        }

        Ok(ChainReport {
            bundles_seen,
            chain_length,
            intact: chain_length == bundles_seen,
            broken_at: None,
        })
    }

    fn walk_bundles(&self) -> Result<Vec<PathBuf>> {
        // fixed YYYY/MM/DD/<id>/ depth
        let mut out = Vec::new();
        for year in read_dirs(&self.root)? {
            for month in read_dirs(&year)? {
                for day in read_dirs(&month)? {
                    for id in read_dirs(&day)? {
                        let bundle = id.join("bundle.json");
                        if bundle.is_file() {
                            out.push(bundle);
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn read_dirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(path)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}
