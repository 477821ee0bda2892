// Copyright (C) 2026 Build Swarm Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Release management: snapshot staging into versioned trees, promote
//! via an atomic symlink swap, archive, delete, diff.
//!
//! The database row is the authority for a release's state. Filesystem
//! work (hardlink snapshot, symlink swap, tree removal) happens after
//! the matching database transition; when the filesystem disagrees the
//! divergence is reported as an event and in the response, never rolled
//! back in the database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use swarm_core::store::releases::{PromoteOutcome, Release};
use swarm_core::types::now_ts;
use swarm_core::{Config, CoreError, EventBus, Store};

use crate::error::{Error, Result};

/// One artifact file inside a release tree.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactInfo {
    /// Category (first path component).
    pub category: String,
    /// Package name.
    pub package: String,
    /// Version parsed from the file name.
    pub version: String,
    /// File size.
    pub size_bytes: u64,
    /// Path relative to the release root.
    pub path: String,
}

/// Diff between two releases.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseDiff {
    /// Source version.
    pub from: String,
    /// Target version.
    pub to: String,
    /// Artifacts only in the target.
    pub added: Vec<ArtifactInfo>,
    /// Artifacts only in the source.
    pub removed: Vec<ArtifactInfo>,
    /// Artifacts present in both with a version change.
    pub changed: Vec<ChangedArtifact>,
    /// Count of identical artifacts.
    pub unchanged_count: usize,
}

/// A version change between two releases.
#[derive(Debug, Clone, Serialize)]
pub struct ChangedArtifact {
    /// Category.
    pub category: String,
    /// Package name.
    pub package: String,
    /// Version in the source release.
    pub from_version: String,
    /// Version in the target release.
    pub to_version: String,
}

/// Outcome of a release operation with any filesystem warning attached.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseOutcome {
    /// The release row after the transition.
    pub release: Release,
    /// Filesystem divergence note, when the post-commit fs step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_warning: Option<String>,
}

/// Release manager.
pub struct ReleaseManager {
    store: Store,
    events: EventBus,
    config: Arc<Config>,
}

impl ReleaseManager {
    /// Create a new manager.
    pub fn new(store: Store, events: EventBus, config: Arc<Config>) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// List non-deleted releases.
    pub async fn list(&self) -> Result<Vec<Release>> {
        Ok(self.store.list_releases().await?)
    }

    /// Fetch one release.
    pub async fn get(&self, version: &str) -> Result<Option<Release>> {
        Ok(self.store.get_release(version).await?)
    }

    /// Artifacts inside a release tree.
    pub async fn packages(&self, version: &str) -> Result<Vec<ArtifactInfo>> {
        let release = self
            .store
            .get_release(version)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("release {version}")))?;
        Ok(scan_artifacts(Path::new(&release.path)))
    }

    /// Snapshot the staging directory into a new `staging` release.
    pub async fn create(
        &self,
        version: Option<&str>,
        name: Option<&str>,
        notes: Option<&str>,
        created_by: &str,
    ) -> Result<Release> {
        let staging = resolve_dir(&self.config.staging_path);
        if !staging.is_dir() {
            return Err(Error::InvalidRequest(format!(
                "staging directory not found: {}",
                staging.display()
            )));
        }
        let artifacts = scan_artifacts(&staging);
        if artifacts.is_empty() {
            return Err(Error::InvalidRequest("no packages in staging".to_string()));
        }

        let version = match version {
            Some(v) => v.to_string(),
            None => self.generate_version().await?,
        };

        std::fs::create_dir_all(&self.config.releases_path)?;
        let release_dir = self.config.releases_path.join(&version);
        if release_dir.exists() {
            return Err(Error::InvalidRequest(format!(
                "release directory already exists: {version}"
            )));
        }

        let (file_count, total_bytes) = match hardlink_tree(&staging, &release_dir) {
            Ok(stats) => stats,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&release_dir);
                return Err(Error::Other(format!("snapshot failed: {e}")));
            }
        };
        let size_mb = (total_bytes as f64 / 1048576.0 * 10.0).round() / 10.0;

        write_manifest(
            &release_dir,
            &json!({
                "version": version,
                "name": name,
                "package_count": file_count,
                "size_mb": size_mb,
                "created_at": now_ts(),
                "created_by": created_by,
                "notes": notes,
            }),
        );

        let release = self
            .store
            .create_release(
                &version,
                name,
                file_count as i64,
                size_mb,
                &release_dir.to_string_lossy(),
                Some(created_by),
                notes,
            )
            .await?;

        info!(version = %version, packages = file_count, size_mb, "Release created");
        self.events.publish(
            "release",
            format!("Release {version} created ({file_count} packages, {size_mb} MB)"),
            None,
            None,
            None,
        );
        Ok(release)
    }

    /// Promote a release to active. Promoting the already-active release
    /// is a no-op.
    pub async fn promote(&self, version: &str) -> Result<ReleaseOutcome> {
        let release = self
            .store
            .get_release(version)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("release {version}")))?;

        let outcome = self.store.promote_release(version).await?;
        if outcome == PromoteOutcome::AlreadyActive {
            return Ok(ReleaseOutcome {
                release,
                fs_warning: None,
            });
        }

        // Database committed; swap the symlink best-effort.
        let fs_warning = match atomic_symlink(Path::new(&release.path), &self.config.binhost_symlink)
        {
            Ok(()) => None,
            Err(e) => {
                let message = format!("symlink swap failed after promote: {e}");
                warn!(version = %version, error = %e, "Release promoted but symlink swap failed");
                self.events.publish(
                    "release",
                    format!("Release {version}: {message}"),
                    Some(json!({ "divergence": true })),
                    None,
                    None,
                );
                Some(message)
            }
        };

        info!(version = %version, "Release promoted");
        self.events.publish(
            "release",
            format!("Release {version} promoted to active"),
            None,
            None,
            None,
        );

        let release = self
            .store
            .get_release(version)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("release {version}")))?;
        Ok(ReleaseOutcome {
            release,
            fs_warning,
        })
    }

    /// Promote the most recently promoted archived release.
    pub async fn rollback(&self) -> Result<ReleaseOutcome> {
        let previous = self
            .store
            .last_promoted_archived()
            .await?
            .ok_or_else(|| CoreError::NotFound("no previous release to roll back to".to_string()))?;
        self.promote(&previous.version).await
    }

    /// Archive a release.
    pub async fn archive(&self, version: &str) -> Result<Release> {
        let before = self.store.get_release(version).await?;
        let release = self.store.archive_release(version).await?;
        if before.map(|r| r.status) == Some("active".to_string()) {
            warn!(version = %version, "Archived the active release; no release is active now");
        }
        self.events.publish(
            "release",
            format!("Release {version} archived"),
            None,
            None,
            None,
        );
        Ok(release)
    }

    /// Delete an archived or staging release: mark deleted in the
    /// database, then remove the tree.
    pub async fn delete(&self, version: &str) -> Result<ReleaseOutcome> {
        let release = self.store.mark_release_deleted(version).await?;

        let fs_warning = match std::fs::remove_dir_all(&release.path) {
            Ok(()) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                let message = format!("failed to remove release tree: {e}");
                self.events.publish(
                    "release",
                    format!("Release {version}: {message}"),
                    Some(json!({ "divergence": true })),
                    None,
                    None,
                );
                Some(message)
            }
        };

        info!(version = %version, "Release deleted");
        self.events.publish(
            "release",
            format!("Release {version} deleted"),
            None,
            None,
            None,
        );
        Ok(ReleaseOutcome {
            release,
            fs_warning,
        })
    }

    /// Compare artifacts between two releases.
    pub async fn diff(&self, from: &str, to: &str) -> Result<ReleaseDiff> {
        let from_artifacts = self.packages(from).await?;
        let to_artifacts = self.packages(to).await?;

        let key = |a: &ArtifactInfo| format!("{}/{}", a.category, a.package);
        let from_map: BTreeMap<String, &ArtifactInfo> =
            from_artifacts.iter().map(|a| (key(a), a)).collect();
        let to_map: BTreeMap<String, &ArtifactInfo> =
            to_artifacts.iter().map(|a| (key(a), a)).collect();

        let mut added = Vec::new();
        let mut changed = Vec::new();
        let mut unchanged = 0;
        for (k, artifact) in &to_map {
            match from_map.get(k) {
                None => added.push((*artifact).clone()),
                Some(old) if old.version != artifact.version => changed.push(ChangedArtifact {
                    category: artifact.category.clone(),
                    package: artifact.package.clone(),
                    from_version: old.version.clone(),
                    to_version: artifact.version.clone(),
                }),
                Some(_) => unchanged += 1,
            }
        }
        let removed = from_map
            .iter()
            .filter(|(k, _)| !to_map.contains_key(*k))
            .map(|(_, a)| (*a).clone())
            .collect();

        Ok(ReleaseDiff {
            from: from.to_string(),
            to: to.to_string(),
            added,
            removed,
            changed,
            unchanged_count: unchanged,
        })
    }

    /// Binhost overview: active release, staging stats, symlink target.
    pub async fn binhost_status(&self) -> Result<serde_json::Value> {
        let active = self.store.active_release().await?;
        let releases = self.store.list_releases().await?;

        let staging = resolve_dir(&self.config.staging_path);
        let staging_artifacts = scan_artifacts(&staging);
        let staging_bytes: u64 = staging_artifacts.iter().map(|a| a.size_bytes).sum();

        let symlink_target = std::fs::read_link(&self.config.binhost_symlink)
            .ok()
            .map(|p| p.to_string_lossy().into_owned());

        Ok(json!({
            "active_release": active,
            "staging_packages": staging_artifacts.len(),
            "staging_size_mb": (staging_bytes as f64 / 1048576.0 * 10.0).round() / 10.0,
            "staging_path": &self.config.staging_path,
            "total_releases": releases.len(),
            "releases": releases,
            "symlink": &self.config.binhost_symlink,
            "symlink_target": symlink_target,
        }))
    }

    /// YYYY.MM.DD[.N], first free suffix wins.
    async fn generate_version(&self) -> Result<String> {
        let base = Utc::now().format("%Y.%m.%d").to_string();
        let mut version = base.clone();
        let mut n = 2;
        while self.store.get_release(&version).await?.is_some() {
            version = format!("{base}.{n}");
            n += 1;
        }
        Ok(version)
    }
}

fn resolve_dir(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Recursively hardlink `src` into `dst`, copying across devices.
/// Returns (file_count, total_bytes).
fn hardlink_tree(src: &Path, dst: &Path) -> std::io::Result<(usize, u64)> {
    let mut file_count = 0;
    let mut total_bytes = 0;
    let mut stack = vec![src.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let rel = dir.strip_prefix(src).unwrap_or(Path::new(""));
        std::fs::create_dir_all(dst.join(rel))?;

        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
                continue;
            }
            let rel_file = path.strip_prefix(src).unwrap_or(&path);
            let target = dst.join(rel_file);
            if std::fs::hard_link(&path, &target).is_err() {
                std::fs::copy(&path, &target)?;
            }
            file_count += 1;
            total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok((file_count, total_bytes))
}

/// Replace `link_path` with a symlink to `target` using tmp + rename.
fn atomic_symlink(target: &Path, link_path: &Path) -> std::io::Result<()> {
    let tmp = link_path.with_extension(format!("tmp.{}", std::process::id()));
    if tmp.symlink_metadata().is_ok() {
        std::fs::remove_file(&tmp)?;
    }
    std::os::unix::fs::symlink(target, &tmp)?;
    match std::fs::rename(&tmp, link_path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_manifest(release_dir: &Path, data: &serde_json::Value) {
    let path = release_dir.join("release.json");
    if let Err(e) = std::fs::write(&path, serde_json::to_vec_pretty(data).unwrap_or_default()) {
        warn!(path = %path.display(), error = %e, "Failed to write release manifest");
    }
}

/// Walk a release tree and describe every artifact file. The manifest is
/// skipped; artifact naming follows `category/name-version.*`.
fn scan_artifacts(root: &Path) -> Vec<ArtifactInfo> {
    let mut artifacts = Vec::new();
    if !root.is_dir() {
        return artifacts;
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            if rel == "release.json" {
                continue;
            }

            let category = rel.split('/').next().unwrap_or("").to_string();
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let stem = file_name
                .strip_suffix(".gpkg.tar")
                .map(str::to_string)
                .unwrap_or_else(|| {
                    Path::new(&file_name)
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| file_name.clone())
                });
            let (package, version) = split_package_version(&stem);

            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            artifacts.push(ArtifactInfo {
                category: if category == file_name {
                    String::new()
                } else {
                    category
                },
                package,
                version,
                size_bytes,
                path: rel,
            });
        }
    }

    artifacts.sort_by(|a, b| (&a.category, &a.package).cmp(&(&b.category, &b.package)));
    artifacts
}

/// Split `name-1.2.3` at the last hyphen followed by a digit.
fn split_package_version(stem: &str) -> (String, String) {
    let bytes = stem.as_bytes();
    for i in (1..bytes.len()).rev() {
        if bytes[i - 1] == b'-' && bytes[i].is_ascii_digit() {
            return (stem[..i - 1].to_string(), stem[i..].to_string());
        }
    }
    (stem.to_string(), String::new())
}
