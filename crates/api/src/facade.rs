//! Typed façade over [`oms_engine::Ontology`], one method per inbound
//! gateway operation.

use oms_core::{
    BranchName, ChangeType, CommitHash, ContentHash, ETag, EntityRef, Error, PropertyType,
    ResourceId, ResourceType, Result, Timestamp, Version,
};
use oms_engine::{Branch, MergeResult, Ontology, ShadowIndex, ShadowState, SwitchRequest, SwitchResult, WriteRequest};
use oms_locks::{AcquireRequest, BranchLock, LockScope};
use oms_outbox::event::{ChangeDetail, SchemaChangedData};
use oms_outbox::{CloudEvent, Event};
use oms_storage::{CommitStore, OutboxDraft, ResourceVersion};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What a caller wants back from `GetDelta`: either a compact delta
/// relative to a cached etag, or the full current content.
pub struct DeltaRequest {
    /// The etag the caller already has cached, if any.
    pub client_etag: Option<String>,
}

/// The result of a `GetDelta` call.
pub struct DeltaResponse {
    /// `true` if the client's cached etag already matches the current one.
    pub not_modified: bool,
    /// The delta to apply, `None` when `not_modified` is `true`.
    pub delta: Option<oms_storage::Delta>,
    /// The current etag, for the caller to cache going forward.
    pub etag: ETag,
}

/// Typed inbound surface over one [`Ontology`]. Thin wrappers: each
/// method validates nothing the engine doesn't already validate, and
/// adds no behavior beyond translating gateway-shaped inputs into the
/// engine's domain types.
pub struct OmsApi {
    ontology: Arc<Ontology>,
    source: String,
}

impl OmsApi {
    /// Build a façade over `ontology`, stamping `source` into outbound
    /// CloudEvents envelopes (e.g. `"oms/api"`).
    pub fn new(ontology: Arc<Ontology>, source: impl Into<String>) -> Self {
        OmsApi { ontology, source: source.into() }
    }

    /// `CreateResource`.
    pub fn create_resource(
        &self,
        rt: ResourceType,
        rid: ResourceId,
        branch: BranchName,
        content: serde_json::Value,
        author: String,
    ) -> Result<ResourceVersion> {
        let entity = EntityRef::new(rt, rid.clone(), branch.clone());
        let mut tree = self.ontology.read_tree(&branch)?;
        if tree.get(&entity).is_some() {
            return Err(Error::Validation {
                message: format!("{entity} already exists"),
            });
        }
        tree.set(entity.clone(), content.clone());

        let commit_hash = self.ontology.commit(WriteRequest {
            branch: branch.clone(),
            scope: LockScope::ResourceId(rt, rid.clone()),
            tree,
            versions: vec![],
            outbox: vec![self.schema_changed_draft(&branch, rt, &rid, &author, "created a resource", vec![whole_resource_change("create", None, Some(&content), true)])],
            author: author.clone(),
            message: format!("create {entity}"),
        })?;

        let version = build_version(rt, rid, branch, commit_hash, Version::FIRST, None, &content, ChangeType::Create, "created", vec![], author);
        self.ontology.commits().track_change(&version.branch, version.clone())?;
        Ok(version)
    }

    /// `UpdateResource`.
    pub fn update_resource(
        &self,
        rt: ResourceType,
        rid: ResourceId,
        branch: BranchName,
        content: serde_json::Value,
        author: String,
        expected_etag: Option<String>,
    ) -> Result<ResourceVersion> {
        let entity = EntityRef::new(rt, rid.clone(), branch.clone());
        let previous = self
            .ontology
            .commits()
            .get_resource_version(&branch, &entity)?
            .ok_or_else(|| Error::NotFound { what: "resource", id: rid.to_string() })?;

        if let Some(expected) = &expected_etag {
            if previous.etag.as_str() != expected {
                return Err(Error::StaleEtag {
                    resource_type: rt,
                    resource_id: rid.clone(),
                    supplied: expected.clone(),
                });
            }
        }

        let mut tree = self.ontology.read_tree(&branch)?;
        let old_content = tree.get(&entity).cloned();
        tree.set(entity.clone(), content.clone());

        let commit_hash = self.ontology.commit(WriteRequest {
            branch: branch.clone(),
            scope: LockScope::ResourceId(rt, rid.clone()),
            tree,
            versions: vec![],
            outbox: vec![self.schema_changed_draft(&branch, rt, &rid, &author, "updated a resource", vec![whole_resource_change("update", old_content.as_ref(), Some(&content), false)])],
            author: author.clone(),
            message: format!("update {entity}"),
        })?;

        let next_version = previous.version.next();
        let version = build_version(rt, rid, branch, commit_hash, next_version, Some(previous.version), &content, ChangeType::Update, "updated", vec![], author);
        self.ontology.commits().track_change(&version.branch, version.clone())?;
        Ok(version)
    }

    /// `DeleteResource`.
    pub fn delete_resource(&self, rt: ResourceType, rid: ResourceId, branch: BranchName, author: String) -> Result<CommitHash> {
        let entity = EntityRef::new(rt, rid.clone(), branch.clone());
        let previous = self
            .ontology
            .commits()
            .get_resource_version(&branch, &entity)?
            .ok_or_else(|| Error::NotFound { what: "resource", id: rid.to_string() })?;

        let mut tree = self.ontology.read_tree(&branch)?;
        let old_content = tree.remove(&entity);

        let commit_hash = self.ontology.commit(WriteRequest {
            branch: branch.clone(),
            scope: LockScope::ResourceId(rt, rid.clone()),
            tree,
            versions: vec![],
            outbox: vec![self.schema_changed_draft(&branch, rt, &rid, &author, "deleted a resource", vec![whole_resource_change("delete", old_content.as_ref(), None, true)])],
            author: author.clone(),
            message: format!("delete {entity}"),
        })?;

        let version = build_version(
            rt,
            rid,
            branch,
            commit_hash.clone(),
            previous.version.next(),
            Some(previous.version),
            &serde_json::Value::Null,
            ChangeType::Delete,
            "deleted",
            vec![],
            author,
        );
        self.ontology.commits().track_change(&version.branch, version.clone())?;
        Ok(commit_hash)
    }

    /// `GetResource`. Only the latest version is materialized by this
    /// in-memory engine; an explicit `version` that doesn't match the
    /// latest is reported `NotFound` rather than replayed from history.
    pub fn get_resource(
        &self,
        rt: ResourceType,
        rid: ResourceId,
        branch: BranchName,
        version: Option<Version>,
    ) -> Result<(ResourceVersion, serde_json::Value)> {
        let entity = EntityRef::new(rt, rid.clone(), branch.clone());
        let current = self
            .ontology
            .commits()
            .get_resource_version(&branch, &entity)?
            .ok_or_else(|| Error::NotFound { what: "resource", id: rid.to_string() })?;

        if let Some(requested) = version {
            if requested != current.version {
                return Err(Error::NotFound { what: "resource version", id: format!("{rid}@{requested}") });
            }
        }

        let tree = self.ontology.read_tree(&branch)?;
        let content = tree.get(&entity).cloned().unwrap_or(serde_json::Value::Null);
        Ok((current, content))
    }

    /// `GetDelta`. Returns `not_modified` when the caller's cached etag
    /// already matches; otherwise a `Full` delta (this engine doesn't
    /// retain enough history to diff against an arbitrary prior version).
    pub fn get_delta(&self, rt: ResourceType, rid: ResourceId, branch: BranchName, req: DeltaRequest) -> Result<DeltaResponse> {
        let (current, content) = self.get_resource(rt, rid, branch, None)?;
        if req.client_etag.as_deref() == Some(current.etag.as_str()) {
            return Ok(DeltaResponse { not_modified: true, delta: None, etag: current.etag });
        }
        let etag = current.etag.clone();
        let delta = self.ontology.delta().full_delta(&content, etag);
        Ok(DeltaResponse { not_modified: false, delta: Some(delta), etag: current.etag })
    }

    /// `CreateBranch`.
    pub fn create_branch(&self, name: BranchName, from_commit: Option<CommitHash>) -> Result<Branch> {
        match &from_commit {
            None => self.ontology.create_branch(name.clone(), None)?,
            Some(hash) => {
                self.ontology.branches().create(Branch::new(name.clone(), None))?;
                self.ontology.branches().advance(&name, None, hash.clone())?;
            }
        }
        self.ontology.branches().get(&name)
    }

    /// `MergeBranches`. `deadline` comes from `merge.deadline_ms` in config.
    pub fn merge_branches(&self, source: BranchName, target: BranchName, author: String, auto_resolve: bool, dry_run: bool) -> Result<MergeResult> {
        let deadline = Duration::from_millis(self.ontology.config().merge.deadline_ms);
        self.ontology.merge(&source, &target, &author, auto_resolve, dry_run, deadline)
    }

    /// `StartIndexBuild`.
    pub fn start_index_build(
        &self,
        branch: BranchName,
        index_type: String,
        resource_types: Vec<ResourceType>,
        shadow_path: std::path::PathBuf,
        current_path: std::path::PathBuf,
    ) -> Result<Uuid> {
        self.ontology.shadow().start_build(branch, index_type, resource_types, shadow_path, current_path)
    }

    /// `SwitchIndex`.
    pub fn switch_index(&self, shadow_id: Uuid, req: SwitchRequest) -> Result<SwitchResult> {
        self.ontology.shadow().switch(shadow_id, req)
    }

    /// Snapshot of one shadow index build, for polling progress.
    pub fn get_index_build(&self, shadow_id: Uuid) -> Result<ShadowIndex> {
        self.ontology.shadow().get(shadow_id)
    }

    /// Whether an index build has finished (`Built`) and is ready to switch.
    pub fn index_build_ready(&self, shadow_id: Uuid) -> Result<bool> {
        Ok(self.ontology.shadow().get(shadow_id)?.state == ShadowState::Built)
    }

    /// `AcquireLock`.
    pub fn acquire_lock(&self, req: AcquireRequest) -> Result<BranchLock> {
        self.ontology.locks().acquire(req, Timestamp::now())
    }

    /// `ReleaseLock`.
    pub fn release_lock(&self, branch: &BranchName, lock_id: Uuid, holder: &str) -> Result<()> {
        self.ontology.locks().release(branch, lock_id, holder)
    }

    /// `Heartbeat`.
    pub fn heartbeat(&self, branch: &BranchName, lock_id: Uuid, holder: &str, ttl: Duration) -> Result<()> {
        self.ontology.locks().heartbeat(branch, lock_id, holder, ttl, Timestamp::now())
    }

    fn schema_changed_draft(
        &self,
        branch: &BranchName,
        rt: ResourceType,
        rid: &ResourceId,
        author: &str,
        message: &str,
        changes: Vec<ChangeDetail>,
    ) -> OutboxDraft {
        let event = Event::SchemaChanged(SchemaChangedData {
            branch: branch.clone(),
            commit_hash: CommitHash::compute(b"pending"),
            resource_type: rt,
            resource_id: rid.clone(),
            resource_name: None,
            author: author.to_string(),
            message: message.to_string(),
            changes,
        });
        OutboxDraft {
            event_type: event.type_str().to_string(),
            payload: serde_json::to_value(&event).unwrap_or(serde_json::Value::Null),
        }
    }
}

fn whole_resource_change(operation: &str, old: Option<&serde_json::Value>, new: Option<&serde_json::Value>, breaking: bool) -> ChangeDetail {
    ChangeDetail {
        field: "$".to_string(),
        operation: operation.to_string(),
        old_value: old.cloned(),
        new_value: new.cloned(),
        path: "$".to_string(),
        breaking_change: breaking,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oms_engine::OntologyBuilder;

    fn rt(s: &str) -> ResourceType {
        ResourceType::new(s).unwrap()
    }
    fn rid(s: &str) -> ResourceId {
        ResourceId::new(s).unwrap()
    }
    fn branch(s: &str) -> BranchName {
        BranchName::new(s).unwrap()
    }

    fn api() -> OmsApi {
        let ontology = Arc::new(OntologyBuilder::default().build());
        ontology.create_branch(branch("main"), None).unwrap();
        OmsApi::new(ontology, "oms/api/tests")
    }

    #[test]
    fn create_then_get_round_trips_content() {
        let api = api();
        let content = serde_json::json!({"type": "string"});
        let version = api
            .create_resource(rt("object_type"), rid("widget"), branch("main"), content.clone(), "alice".into())
            .unwrap();
        assert_eq!(version.version, Version::FIRST);

        let (got_version, got_content) = api.get_resource(rt("object_type"), rid("widget"), branch("main"), None).unwrap();
        assert_eq!(got_content, content);
        assert_eq!(got_version.etag, version.etag);
    }

    #[test]
    fn create_twice_is_rejected() {
        let api = api();
        let content = serde_json::json!({"type": "string"});
        api.create_resource(rt("object_type"), rid("widget"), branch("main"), content.clone(), "alice".into()).unwrap();
        let result = api.create_resource(rt("object_type"), rid("widget"), branch("main"), content, "alice".into());
        assert!(result.is_err());
    }

    #[test]
    fn update_with_stale_etag_is_rejected() {
        let api = api();
        api.create_resource(rt("object_type"), rid("widget"), branch("main"), serde_json::json!({"a": 1}), "alice".into()).unwrap();
        let result = api.update_resource(
            rt("object_type"),
            rid("widget"),
            branch("main"),
            serde_json::json!({"a": 2}),
            "alice".into(),
            Some("not-the-real-etag".into()),
        );
        assert!(matches!(result, Err(Error::StaleEtag { .. })));
    }

    #[test]
    fn update_then_delete_then_get_is_not_found() {
        let api = api();
        let created = api.create_resource(rt("object_type"), rid("widget"), branch("main"), serde_json::json!({"a": 1}), "alice".into()).unwrap();
        let updated = api
            .update_resource(rt("object_type"), rid("widget"), branch("main"), serde_json::json!({"a": 2}), "alice".into(), Some(created.etag.as_str().to_string()))
            .unwrap();
        assert_eq!(updated.version, created.version.next());

        api.delete_resource(rt("object_type"), rid("widget"), branch("main"), "alice".into()).unwrap();
        let result = api.get_resource(rt("object_type"), rid("widget"), branch("main"), None);
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn get_delta_reports_not_modified_for_current_etag() {
        let api = api();
        let version = api.create_resource(rt("object_type"), rid("widget"), branch("main"), serde_json::json!({"a": 1}), "alice".into()).unwrap();
        let response = api
            .get_delta(rt("object_type"), rid("widget"), branch("main"), DeltaRequest { client_etag: Some(version.etag.as_str().to_string()) })
            .unwrap();
        assert!(response.not_modified);
        assert!(response.delta.is_none());

        let stale = api
            .get_delta(rt("object_type"), rid("widget"), branch("main"), DeltaRequest { client_etag: None })
            .unwrap();
        assert!(!stale.not_modified);
        assert!(stale.delta.is_some());
    }

    #[test]
    fn merge_fast_forwards_when_target_has_not_diverged() {
        let api = api();
        let first = api.create_resource(rt("object_type"), rid("widget"), branch("main"), serde_json::json!({"a": 1}), "alice".into()).unwrap();
        api.create_branch(branch("feature"), Some(first.commit_hash.clone())).unwrap();
        api.create_resource(rt("object_type"), rid("gizmo"), branch("main"), serde_json::json!({"a": 2}), "alice".into()).unwrap();

        let result = api.merge_branches(branch("main"), branch("feature"), "alice".into(), true, false).unwrap();
        assert!(matches!(result.status, oms_engine::MergeStatus::Success));
        assert!(result.merge_commit.is_some());
    }
}

#[allow(clippy::too_many_arguments)]
fn build_version(
    resource_type: ResourceType,
    resource_id: ResourceId,
    branch: BranchName,
    commit_hash: CommitHash,
    version: Version,
    parent_version: Option<Version>,
    content: &serde_json::Value,
    change_type: ChangeType,
    summary: &str,
    fields_changed: Vec<String>,
    author: String,
) -> ResourceVersion {
    let content_hash = ContentHash::compute(content);
    let size = serde_json::to_vec(content).map(|b| b.len()).unwrap_or(0);
    ResourceVersion {
        resource_type,
        resource_id,
        branch,
        version,
        commit_hash: commit_hash.clone(),
        parent_version,
        etag: ETag::new(&commit_hash, version),
        content_hash,
        size,
        change_type,
        summary: summary.to_string(),
        fields_changed,
        author,
        time: Timestamp::now(),
    }
}
