//! Workplan custom resource and its typed mutation helpers.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kmut_core::{Object, ObjectStore, Verb};
use kmut_kubehub::KubeStore;
use kmut_mutate::{Mutator, Result, RetryConfig};
use kube::{Client, CustomResource};
use serde::{Deserialize, Serialize};

/// A planned run of a workflow's tasks.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[kube(
    group = "engine.kube.ci",
    version = "v1alpha1",
    kind = "Workplan",
    namespaced,
    status = "WorkplanStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkplanSpec {
    /// Name of the Workflow this plan was generated from.
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_for: Option<TriggeredFor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

/// Object change that triggered the plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredFor {
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkplanPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkplanStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkplanPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Index of the task currently executing.
    #[serde(default)]
    pub task_index: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl WorkplanStatus {
    pub fn running(mut self, task_index: i32) -> Self {
        self.phase = Some(WorkplanPhase::Running);
        self.task_index = task_index;
        self.reason = None;
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.phase = Some(WorkplanPhase::Failed);
        self.reason = Some(reason.into());
        self
    }

    pub fn succeeded(mut self) -> Self {
        self.phase = Some(WorkplanPhase::Succeeded);
        self.reason = None;
        self
    }
}

impl Object for Workplan {
    type Status = WorkplanStatus;

    fn blank(_: &()) -> Self {
        Workplan::new("", WorkplanSpec::default())
    }

    fn status(&self) -> Option<&WorkplanStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: WorkplanStatus) {
        self.status = Some(status);
    }
}

/// Mutator over the cluster's Workplans.
pub fn workplan_mutator(client: Client, retry: RetryConfig) -> Mutator<Workplan, KubeStore<Workplan>> {
    Mutator::new(KubeStore::namespaced(client), retry)
}

pub async fn create_or_patch_workplan<S, F>(m: &Mutator<Workplan, S>, meta: ObjectMeta, transform: F) -> Result<(Workplan, Verb)>
where
    S: ObjectStore<Workplan>,
    F: FnOnce(Workplan) -> Workplan + Send,
{
    m.create_or_patch(meta, transform).await
}

pub async fn patch_workplan<S, F>(m: &Mutator<Workplan, S>, cur: &Workplan, transform: F) -> Result<(Workplan, Verb)>
where
    S: ObjectStore<Workplan>,
    F: FnOnce(Workplan) -> Workplan + Send,
{
    m.patch(cur, transform).await
}

pub async fn patch_workplan_object<S>(m: &Mutator<Workplan, S>, cur: &Workplan, modified: &Workplan) -> Result<(Workplan, Verb)>
where
    S: ObjectStore<Workplan>,
{
    m.patch_object(cur, modified).await
}

pub async fn try_update_workplan<S, F>(m: &Mutator<Workplan, S>, meta: &ObjectMeta, transform: F) -> Result<Workplan>
where
    S: ObjectStore<Workplan>,
    F: Fn(Workplan) -> Workplan + Send + Sync,
{
    m.try_update(meta, transform).await
}

/// `use_subresource` holds at most one flag; see [`kmut_mutate::StatusMode::from_flags`].
pub async fn update_workplan_status<S, F>(
    m: &Mutator<Workplan, S>,
    current: &Workplan,
    transform: F,
    use_subresource: &[bool],
) -> Result<Workplan>
where
    S: ObjectStore<Workplan>,
    F: Fn(WorkplanStatus) -> WorkplanStatus + Send + Sync,
{
    m.update_status_flags(current, transform, use_subresource).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn blank_workplan_has_type_identity() {
        let wp = Workplan::blank(&());
        let v = serde_json::to_value(&wp).unwrap();
        assert_eq!(v["apiVersion"], "engine.kube.ci/v1alpha1");
        assert_eq!(v["kind"], "Workplan");
        assert!(v.get("status").is_none());
        assert_eq!(Workplan::kind(&()), "Workplan");
    }

    #[test]
    fn status_helpers_set_phase() {
        let s = WorkplanStatus::default().running(2);
        assert_eq!(s.phase, Some(WorkplanPhase::Running));
        assert_eq!(s.task_index, 2);
        let s = s.failed("image pull backoff");
        assert_eq!(s.phase, Some(WorkplanPhase::Failed));
        assert_eq!(s.reason.as_deref(), Some("image pull backoff"));
        assert_eq!(s.succeeded().reason, None);
    }

    #[test]
    fn spec_serializes_camel_case() {
        let spec = WorkplanSpec {
            workflow: "build".into(),
            tasks: vec![],
            triggered_for: Some(TriggeredFor { kind: "ConfigMap".into(), name: "cfg".into(), resource_version: Some("9".into()) }),
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["triggeredFor"]["resourceVersion"], "9");
        assert!(v.get("tasks").is_none());
    }
}
