// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    error::{RuntimeError, RuntimeResult},
    function::{FunctionVersion, content_hash},
    store::FunctionStore,
};

/// Largest LCS table a diff may build, in cells, after the common prefix and
/// suffix are trimmed.
pub const MAX_DIFF_CELLS: usize = 4_000_000;

/// Held while a function record is read, changed and written back.
pub type FunctionGuard = OwnedMutexGuard<()>;

/// Append-only version history, serialised per function.
pub struct VersionStore {
    store: Arc<dyn FunctionStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffOp {
    Equal,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub op: DiffOp,
    pub line: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionDiff {
    pub from: u32,
    pub to: u32,
    pub changes: Vec<DiffLine>,
}

impl VersionStore {
    pub fn new(store: Arc<dyn FunctionStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    /// Serialises writers of one function: edits, publishes and rollbacks
    /// all hold this guard for their whole read-modify-write.
    pub async fn lock(&self, function_id: &str) -> FunctionGuard {
        let lock = self
            .locks
            .entry(function_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub async fn create_version(
        &self,
        function_id: &str,
        code: &str,
        compiled: &str,
        changelog: Option<String>,
        user_id: &str,
    ) -> RuntimeResult<FunctionVersion> {
        let guard = self.lock(function_id).await;
        self.append_version(&guard, function_id, code, compiled, changelog, user_id)
            .await
    }

    /// Writes `max + 1` and moves the function's published pointer, under a
    /// guard from [`VersionStore::lock`].
    pub async fn append_version(
        &self,
        _guard: &FunctionGuard,
        function_id: &str,
        code: &str,
        compiled: &str,
        changelog: Option<String>,
        user_id: &str,
    ) -> RuntimeResult<FunctionVersion> {
        let next = self.store.max_version(function_id).await + 1;
        let version = FunctionVersion {
            function_id: function_id.to_string(),
            version: next,
            code: code.to_string(),
            compiled: compiled.to_string(),
            changelog,
            created_by: user_id.to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_version(version.clone()).await?;

        match self.store.get_function(function_id).await {
            Some(mut function) => {
                function.published = true;
                function.published_version = Some(next);
                function.published_at = Some(version.created_at);
                self.store.update_function(function).await?;
            }
            None => {
                tracing::warn!(function_id = %function_id, "Version created for a missing function");
            }
        }

        tracing::debug!(function_id = %function_id, version = next, "Version created");
        Ok(version)
    }

    pub async fn versions(&self, function_id: &str) -> Vec<FunctionVersion> {
        self.store.list_versions(function_id).await
    }

    pub async fn version(&self, function_id: &str, version: u32) -> RuntimeResult<FunctionVersion> {
        self.store
            .get_version(function_id, version)
            .await
            .ok_or_else(|| RuntimeError::VersionNotFound {
                function_id: function_id.to_string(),
                version,
            })
    }

    pub async fn latest_version(&self, function_id: &str) -> Option<FunctionVersion> {
        self.store.list_versions(function_id).await.into_iter().next()
    }

    /// Re-publishes the code of `target` as a new version. The target record
    /// itself is never touched.
    pub async fn rollback_to_version(
        &self,
        function_id: &str,
        target: u32,
        user_id: &str,
    ) -> RuntimeResult<FunctionVersion> {
        let guard = self.lock(function_id).await;

        let snapshot = self.version(function_id, target).await?;
        let Some(mut function) = self.store.get_function(function_id).await else {
            return Err(RuntimeError::FunctionNotFound(function_id.to_string()));
        };
        function.code = snapshot.code.clone();
        function.compiled = Some(snapshot.compiled.clone());
        function.hash = content_hash(&snapshot.code);
        function.updated_at = Utc::now();
        self.store.update_function(function).await?;

        self.append_version(
            &guard,
            function_id,
            &snapshot.code,
            &snapshot.compiled,
            Some(format!("rolled back to v{}", target)),
            user_id,
        )
        .await
    }

    /// Diffs two versions on the blocking pool.
    pub async fn diff(&self, function_id: &str, from: u32, to: u32) -> RuntimeResult<VersionDiff> {
        let old = self.version(function_id, from).await?;
        let new = self.version(function_id, to).await?;
        let changes = tokio::task::spawn_blocking(move || line_diff(&old.code, &new.code))
            .await
            .map_err(|err| RuntimeError::Execution(format!("diff task failed: {err}")))??;
        Ok(VersionDiff { from, to, changes })
    }
}

/// Line diff over the longest common subsequence. Inputs whose differing
/// middle would need more than [`MAX_DIFF_CELLS`] table cells are rejected.
pub fn line_diff(old: &str, new: &str) -> RuntimeResult<Vec<DiffLine>> {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();

    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (head, a_mid, b_mid, tail) = (
        &a[..prefix],
        &a[prefix..a.len() - suffix],
        &b[prefix..b.len() - suffix],
        &a[a.len() - suffix..],
    );

    let cells = (a_mid.len() + 1).saturating_mul(b_mid.len() + 1);
    if cells > MAX_DIFF_CELLS {
        return Err(RuntimeError::InvalidInput(format!(
            "versions differ in {} and {} lines, too many to diff",
            a_mid.len(),
            b_mid.len()
        )));
    }

    let line = |op: DiffOp, text: &str| DiffLine {
        op,
        line: text.to_string(),
    };
    let mut changes = Vec::with_capacity(a.len().max(b.len()));
    changes.extend(head.iter().map(|text| line(DiffOp::Equal, text)));
    changes.extend(lcs_diff(a_mid, b_mid));
    changes.extend(tail.iter().map(|text| line(DiffOp::Equal, text)));
    Ok(changes)
}

fn lcs_diff(a: &[&str], b: &[&str]) -> Vec<DiffLine> {
    let (n, m) = (a.len(), b.len());

    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let line = |op: DiffOp, text: &str| DiffLine {
        op,
        line: text.to_string(),
    };
    let mut changes = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            changes.push(line(DiffOp::Equal, a[i]));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            changes.push(line(DiffOp::Remove, a[i]));
            i += 1;
        } else {
            changes.push(line(DiffOp::Add, b[j]));
            j += 1;
        }
    }
    changes.extend(a[i..].iter().map(|text| line(DiffOp::Remove, text)));
    changes.extend(b[j..].iter().map(|text| line(DiffOp::Add, text)));
    changes
}
