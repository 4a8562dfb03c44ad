// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;

use super::{AccountStore, ApiToken, AuditRecord, CustomDomain, FunctionStore};
use crate::{
    error::{RuntimeError, RuntimeResult},
    function::{Function, FunctionVersion},
};

const AUDIT_CAPACITY: usize = 10_000;

/// In-process store backing both store traits.
#[derive(Default)]
pub struct MemoryStore {
    functions: DashMap<String, Function>,
    /// `(owner_id, path)` to function id.
    paths: DashMap<(String, String), String>,
    versions: DashMap<String, BTreeMap<u32, FunctionVersion>>,
    tokens: DashMap<String, ApiToken>,
    domains: DashMap<String, CustomDomain>,
    env: DashMap<String, HashMap<String, String>>,
    audit: Mutex<VecDeque<AuditRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn find(&self, predicate: impl Fn(&Function) -> bool) -> Option<Function> {
        let mut matches: Vec<Function> = self
            .functions
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        // Oldest first keeps lookups stable when several owners share a path.
        matches.sort_by_key(|f| f.created_at);
        matches.into_iter().next()
    }

    fn collect(&self, predicate: impl Fn(&Function) -> bool) -> Vec<Function> {
        let mut functions: Vec<Function> = self
            .functions
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        functions.sort_by(|a, b| a.path.cmp(&b.path));
        functions
    }
}

#[async_trait]
impl FunctionStore for MemoryStore {
    async fn insert_function(&self, function: Function) -> RuntimeResult<()> {
        let key = (function.owner_id.clone(), function.path.clone());
        match self.paths.entry(key) {
            Entry::Occupied(_) => Err(RuntimeError::Conflict(format!(
                "a function already exists at path {}",
                function.path
            ))),
            Entry::Vacant(slot) => {
                slot.insert(function.id.clone());
                self.functions.insert(function.id.clone(), function);
                Ok(())
            }
        }
    }

    async fn update_function(&self, function: Function) -> RuntimeResult<()> {
        let Some(previous) = self.functions.get(&function.id).map(|f| f.clone()) else {
            return Err(RuntimeError::FunctionNotFound(function.id));
        };

        if previous.path != function.path {
            let key = (function.owner_id.clone(), function.path.clone());
            match self.paths.entry(key) {
                Entry::Occupied(_) => {
                    return Err(RuntimeError::Conflict(format!(
                        "a function already exists at path {}",
                        function.path
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(function.id.clone());
                }
            }
            self.paths
                .remove(&(previous.owner_id.clone(), previous.path.clone()));
        }

        self.functions.insert(function.id.clone(), function);
        Ok(())
    }

    async fn get_function(&self, id: &str) -> Option<Function> {
        self.functions.get(id).map(|f| f.clone())
    }

    async fn find_by_path(&self, owner_id: &str, path: &str) -> Option<Function> {
        let id = self
            .paths
            .get(&(owner_id.to_string(), path.to_string()))
            .map(|id| id.clone())?;
        self.functions.get(&id).map(|f| f.clone())
    }

    async fn find_by_name(&self, owner_id: &str, name: &str) -> Option<Function> {
        self.find(|f| f.owner_id == owner_id && f.name == name)
    }

    async fn find_published_by_path(&self, path: &str, owner_id: Option<&str>) -> Option<Function> {
        self.find(|f| {
            f.published && f.path == path && owner_id.is_none_or(|owner| f.owner_id == owner)
        })
    }

    async fn find_published_by_name(&self, name: &str, owner_id: Option<&str>) -> Option<Function> {
        self.find(|f| {
            f.published && f.name == name && owner_id.is_none_or(|owner| f.owner_id == owner)
        })
    }

    async fn list_functions(&self, owner_id: &str) -> Vec<Function> {
        self.collect(|f| f.owner_id == owner_id)
    }

    async fn published_functions(&self, owner_id: &str) -> Vec<Function> {
        self.collect(|f| f.owner_id == owner_id && f.published && f.compiled.is_some())
    }

    async fn delete_function(&self, id: &str) -> Option<Function> {
        let (_, function) = self.functions.remove(id)?;
        self.paths
            .remove(&(function.owner_id.clone(), function.path.clone()));
        self.versions.remove(id);
        Some(function)
    }

    async fn insert_version(&self, version: FunctionVersion) -> RuntimeResult<()> {
        let mut history = self.versions.entry(version.function_id.clone()).or_default();
        if history.contains_key(&version.version) {
            return Err(RuntimeError::Conflict(format!(
                "version {} already exists for function {}",
                version.version, version.function_id
            )));
        }
        history.insert(version.version, version);
        Ok(())
    }

    async fn max_version(&self, function_id: &str) -> u32 {
        self.versions
            .get(function_id)
            .and_then(|history| history.keys().next_back().copied())
            .unwrap_or(0)
    }

    async fn list_versions(&self, function_id: &str) -> Vec<FunctionVersion> {
        self.versions
            .get(function_id)
            .map(|history| history.values().rev().cloned().collect())
            .unwrap_or_default()
    }

    async fn get_version(&self, function_id: &str, version: u32) -> Option<FunctionVersion> {
        self.versions
            .get(function_id)
            .and_then(|history| history.get(&version).cloned())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn insert_token(&self, token: ApiToken) -> RuntimeResult<()> {
        match self.tokens.entry(token.token_hash.clone()) {
            Entry::Occupied(_) => Err(RuntimeError::Conflict("token already exists".into())),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(())
            }
        }
    }

    async fn find_token(&self, token_hash: &str) -> Option<ApiToken> {
        self.tokens.get(token_hash).map(|t| t.clone())
    }

    async fn list_tokens(&self, owner_id: &str) -> Vec<ApiToken> {
        let mut tokens: Vec<ApiToken> = self
            .tokens
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        tokens.sort_by_key(|t| t.created_at);
        tokens
    }

    async fn delete_token(&self, owner_id: &str, id: &str) -> bool {
        let hash = self
            .tokens
            .iter()
            .find(|entry| entry.owner_id == owner_id && entry.id == id)
            .map(|entry| entry.key().clone());
        match hash {
            Some(hash) => self.tokens.remove(&hash).is_some(),
            None => false,
        }
    }

    async fn touch_token(&self, token_hash: &str) {
        if let Some(mut token) = self.tokens.get_mut(token_hash) {
            token.last_used_at = Some(Utc::now());
        }
    }

    async fn insert_domain(&self, domain: CustomDomain) -> RuntimeResult<()> {
        match self.domains.entry(domain.domain.clone()) {
            Entry::Occupied(_) => Err(RuntimeError::Conflict(format!(
                "domain {} is already registered",
                domain.domain
            ))),
            Entry::Vacant(slot) => {
                slot.insert(domain);
                Ok(())
            }
        }
    }

    async fn get_domain(&self, domain: &str) -> Option<CustomDomain> {
        self.domains.get(domain).map(|d| d.clone())
    }

    async fn list_domains(&self, owner_id: &str) -> Vec<CustomDomain> {
        let mut domains: Vec<CustomDomain> = self
            .domains
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        domains.sort_by(|a, b| a.domain.cmp(&b.domain));
        domains
    }

    async fn update_domain(&self, domain: CustomDomain) -> RuntimeResult<()> {
        match self.domains.get_mut(&domain.domain) {
            Some(mut existing) => {
                *existing = domain;
                Ok(())
            }
            None => Err(RuntimeError::InvalidInput(format!(
                "unknown domain {}",
                domain.domain
            ))),
        }
    }

    async fn delete_domain(&self, owner_id: &str, domain: &str) -> bool {
        self.domains
            .remove_if(domain, |_, d| d.owner_id == owner_id)
            .is_some()
    }

    async fn env_vars(&self, owner_id: &str) -> HashMap<String, String> {
        self.env
            .get(owner_id)
            .map(|vars| vars.clone())
            .unwrap_or_default()
    }

    async fn set_env_vars(&self, owner_id: &str, vars: HashMap<String, String>) {
        self.env.insert(owner_id.to_string(), vars);
    }

    async fn append_audit(&self, record: AuditRecord) -> RuntimeResult<()> {
        let mut audit = self.audit.lock();
        if audit.len() >= AUDIT_CAPACITY {
            audit.pop_front();
        }
        audit.push_back(record);
        Ok(())
    }

    async fn audit_records(&self, owner_id: &str) -> Vec<AuditRecord> {
        self.audit
            .lock()
            .iter()
            .filter(|record| record.owner_id == owner_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn published(owner: &str, name: &str, path: &str) -> Function {
        let mut function = Function::new(owner, name, path, "export default () => 1");
        function.published = true;
        function.compiled = Some("exports.default = () => 1;".into());
        function
    }

    #[tokio::test]
    async fn paths_are_unique_per_owner() {
        let store = MemoryStore::new();
        store
            .insert_function(Function::new("u1", "hello", "hello", ""))
            .await
            .unwrap();

        let err = store
            .insert_function(Function::new("u1", "hello", "hello", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Conflict(_)));

        store
            .insert_function(Function::new("u2", "hello", "hello", ""))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn update_moves_the_path_index() {
        let store = MemoryStore::new();
        let mut function = Function::new("u1", "hello", "hello", "");
        store.insert_function(function.clone()).await.unwrap();

        function.path = "api/hello".into();
        store.update_function(function.clone()).await.unwrap();

        assert!(store.find_by_path("u1", "hello").await.is_none());
        assert_eq!(
            store.find_by_path("u1", "api/hello").await.unwrap().id,
            function.id
        );
    }

    #[tokio::test]
    async fn published_lookups_respect_owner_scope() {
        let store = MemoryStore::new();
        store.insert_function(published("u1", "hello", "hello")).await.unwrap();
        store
            .insert_function(Function::new("u2", "draft", "draft", ""))
            .await
            .unwrap();

        assert!(store.find_published_by_path("hello", None).await.is_some());
        assert!(store.find_published_by_path("hello", Some("u2")).await.is_none());
        assert!(store.find_published_by_name("draft", None).await.is_none());
        assert_eq!(store.published_functions("u1").await.len(), 1);
    }

    #[tokio::test]
    async fn versions_reject_duplicates_and_list_descending() {
        let store = MemoryStore::new();
        let version = |n: u32| FunctionVersion {
            function_id: "f1".into(),
            version: n,
            code: format!("v{n}"),
            compiled: String::new(),
            changelog: None,
            created_by: "u1".into(),
            created_at: Utc::now(),
        };

        store.insert_version(version(1)).await.unwrap();
        store.insert_version(version(2)).await.unwrap();
        assert!(store.insert_version(version(2)).await.is_err());

        assert_eq!(store.max_version("f1").await, 2);
        let listed: Vec<u32> = store
            .list_versions("f1")
            .await
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(listed, vec![2, 1]);
    }

    #[tokio::test]
    async fn deleting_a_function_cascades_to_versions() {
        let store = MemoryStore::new();
        let function = published("u1", "hello", "hello");
        store.insert_function(function.clone()).await.unwrap();
        store
            .insert_version(FunctionVersion {
                function_id: function.id.clone(),
                version: 1,
                code: String::new(),
                compiled: String::new(),
                changelog: None,
                created_by: "u1".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.delete_function(&function.id).await.is_some());
        assert!(store.list_versions(&function.id).await.is_empty());
        assert!(store.find_by_path("u1", "hello").await.is_none());
    }

    #[tokio::test]
    async fn domains_can_only_be_deleted_by_their_owner() {
        let store = MemoryStore::new();
        store
            .insert_domain(CustomDomain {
                domain: "app.example.com".into(),
                owner_id: "u1".into(),
                target_path: None,
                verified: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(!store.delete_domain("u2", "app.example.com").await);
        assert!(store.delete_domain("u1", "app.example.com").await);
    }
}
