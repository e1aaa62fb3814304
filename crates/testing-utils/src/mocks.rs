//! In-memory implementations of the store, cache and clock ports
//!
//! [`InMemoryDatabase`] behaves like a single-writer database: a transaction
//! takes the state lock in `begin`, works on a private copy and publishes it on
//! `commit`. Dropping an uncommitted transaction discards the copy. Uniqueness
//! rules match the SQLite schema.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use checkin_domain::{
    AuditFilter, AuditRequestStore, AuditStatus, CacheStore, CheckApplication,
    CheckinRecordStore, Clock, Group, GroupMember, GroupMemberStore, GroupStore, MemberRole,
    NewCheckApplication, NewTask, NewTaskRecord, Task, TaskFilter, TaskRecord, TaskStore,
    Transaction, UnitOfWork,
};
use checkin_errors::{CheckinError, CheckinResult};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Operations that can be armed to fail once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateTask,
    CreateRecord,
    CreateApplication,
    TransitionApplication,
    Commit,
}

#[derive(Debug, Clone, Default)]
struct State {
    groups: BTreeMap<i64, Group>,
    members: BTreeMap<(i64, i64), GroupMember>,
    tasks: BTreeMap<i64, Task>,
    records: BTreeMap<i64, TaskRecord>,
    applications: BTreeMap<i64, CheckApplication>,
    next_group_id: i64,
    next_task_id: i64,
    next_record_id: i64,
    next_application_id: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

impl State {
    fn create_task(&mut self, task: &NewTask, now: DateTime<Utc>) -> Task {
        let id = next_id(&mut self.next_task_id);
        let created = Task {
            id,
            group_id: task.group_id,
            name: task.fields.name.clone(),
            description: task.fields.description.clone(),
            start_time: task.fields.window.start(),
            end_time: task.fields.window.end(),
            policy: task.fields.policy.clone(),
            created_at: now,
            updated_at: now,
        };
        self.tasks.insert(id, created.clone());
        created
    }

    fn tasks_in_groups(&self, group_ids: &[i64], filter: TaskFilter, now: DateTime<Utc>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| group_ids.contains(&t.group_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (Reverse(t.start_time), Reverse(t.id)));
        filter.apply(tasks, now)
    }

    fn group_ids_for_user(&self, user_id: i64) -> Vec<i64> {
        self.members
            .values()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.group_id)
            .collect()
    }

    fn update_task(&mut self, task: &Task) -> bool {
        match self.tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                true
            }
            None => false,
        }
    }

    fn create_record(&mut self, record: &NewTaskRecord) -> CheckinResult<TaskRecord> {
        if self.get_record(record.task_id, record.user_id).is_some() {
            return Err(CheckinError::AlreadyCheckedIn {
                task_id: record.task_id,
                user_id: record.user_id,
            });
        }
        let id = next_id(&mut self.next_record_id);
        let created = TaskRecord {
            id,
            task_id: record.task_id,
            user_id: record.user_id,
            username: record.username.clone(),
            group_id: record.group_id,
            signed_time: record.signed_time,
            status: record.status,
            payload: record.payload.clone(),
        };
        self.records.insert(id, created.clone());
        Ok(created)
    }

    fn get_record(&self, task_id: i64, user_id: i64) -> Option<TaskRecord> {
        self.records
            .values()
            .find(|r| r.task_id == task_id && r.user_id == user_id)
            .cloned()
    }

    fn records_by_task(&self, task_id: i64) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .records
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (r.signed_time, r.id));
        records
    }

    fn records_by_user(&self, user_id: i64) -> Vec<TaskRecord> {
        let mut records: Vec<TaskRecord> = self
            .records
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| (Reverse(r.signed_time), Reverse(r.id)));
        records
    }

    fn create_application(
        &mut self,
        application: &NewCheckApplication,
    ) -> CheckinResult<CheckApplication> {
        if self
            .find_pending(application.task_id, application.user_id)
            .is_some()
        {
            return Err(CheckinError::PendingAuditExists {
                task_id: application.task_id,
                user_id: application.user_id,
            });
        }
        let id = next_id(&mut self.next_application_id);
        let created = CheckApplication {
            id,
            task_id: application.task_id,
            group_id: application.group_id,
            user_id: application.user_id,
            username: application.username.clone(),
            reason: application.reason.clone(),
            image: application.image.clone(),
            admin_id: application.admin_id,
            admin_username: application.admin_username.clone(),
            status: AuditStatus::Pending,
            created_at: application.created_at,
            processed_at: None,
        };
        self.applications.insert(id, created.clone());
        Ok(created)
    }

    fn find_pending(&self, task_id: i64, user_id: i64) -> Option<CheckApplication> {
        self.applications
            .values()
            .find(|a| {
                a.task_id == task_id && a.user_id == user_id && a.status == AuditStatus::Pending
            })
            .cloned()
    }

    fn applications_where<F>(&self, predicate: F) -> Vec<CheckApplication>
    where
        F: Fn(&CheckApplication) -> bool,
    {
        let mut applications: Vec<CheckApplication> = self
            .applications
            .values()
            .filter(|a| predicate(a))
            .cloned()
            .collect();
        applications.sort_by_key(|a| (Reverse(a.created_at), Reverse(a.id)));
        applications
    }

    fn transition(&mut self, id: i64, from: AuditStatus, to: AuditStatus, at: DateTime<Utc>) -> bool {
        match self.applications.get_mut(&id) {
            Some(application) if application.status == from => {
                application.status = to;
                application.processed_at = Some(at);
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    armed: Mutex<HashSet<FaultPoint>>,
}

impl Faults {
    fn check(&self, point: FaultPoint) -> CheckinResult<()> {
        if self.armed.lock().unwrap().remove(&point) {
            return Err(CheckinError::persistence(
                format!("{point:?}"),
                "injected failure",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

/// In-memory transactional database for service tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<AsyncMutex<State>>,
    faults: Arc<Faults>,
    counters: Arc<Counters>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot failure for the next call to `point`
    pub fn fail_next(&self, point: FaultPoint) {
        self.faults.armed.lock().unwrap().insert(point);
    }

    pub fn commits(&self) -> usize {
        self.counters.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.counters.rollbacks.load(Ordering::SeqCst)
    }

    /// Seed a group with its creator as owner
    pub async fn insert_group(&self, name: &str, creator_id: i64, creator_username: &str) -> Group {
        let mut state = self.state.lock().await;
        let id = next_id(&mut state.next_group_id);
        let now = Utc::now();
        let group = Group {
            id,
            name: name.to_string(),
            description: String::new(),
            creator_id,
            creator_username: creator_username.to_string(),
            created_at: now,
        };
        state.groups.insert(id, group.clone());
        state.members.insert(
            (id, creator_id),
            GroupMember {
                group_id: id,
                user_id: creator_id,
                username: creator_username.to_string(),
                role: MemberRole::Owner,
                joined_at: now,
            },
        );
        group
    }

    pub async fn add_member(&self, group_id: i64, user_id: i64, username: &str, role: MemberRole) {
        let mut state = self.state.lock().await;
        state.members.insert(
            (group_id, user_id),
            GroupMember {
                group_id,
                user_id,
                username: username.to_string(),
                role,
                joined_at: Utc::now(),
            },
        );
    }

    pub async fn record_count(&self) -> usize {
        self.state.lock().await.records.len()
    }
}

#[async_trait]
impl UnitOfWork for InMemoryDatabase {
    async fn begin(&self) -> CheckinResult<Box<dyn Transaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTransaction {
            committed: Some(guard),
            working: Mutex::new(working),
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
            finished: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl TaskStore for InMemoryDatabase {
    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> CheckinResult<Task> {
        self.faults.check(FaultPoint::CreateTask)?;
        Ok(self.state.lock().await.create_task(task, now))
    }

    async fn get_task(&self, id: i64) -> CheckinResult<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(&id).cloned())
    }

    async fn list_tasks_by_group(
        &self,
        group_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        Ok(self.state.lock().await.tasks_in_groups(&[group_id], filter, now))
    }

    async fn list_tasks_by_user(
        &self,
        user_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        let state = self.state.lock().await;
        let group_ids = state.group_ids_for_user(user_id);
        Ok(state.tasks_in_groups(&group_ids, filter, now))
    }

    async fn update_task(&self, task: &Task) -> CheckinResult<bool> {
        Ok(self.state.lock().await.update_task(task))
    }

    async fn delete_task(&self, id: i64) -> CheckinResult<bool> {
        Ok(self.state.lock().await.tasks.remove(&id).is_some())
    }
}

#[async_trait]
impl CheckinRecordStore for InMemoryDatabase {
    async fn create_record(&self, record: &NewTaskRecord) -> CheckinResult<TaskRecord> {
        self.faults.check(FaultPoint::CreateRecord)?;
        self.state.lock().await.create_record(record)
    }

    async fn get_record(&self, task_id: i64, user_id: i64) -> CheckinResult<Option<TaskRecord>> {
        Ok(self.state.lock().await.get_record(task_id, user_id))
    }

    async fn list_records_by_task(&self, task_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        Ok(self.state.lock().await.records_by_task(task_id))
    }

    async fn list_records_by_user(&self, user_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        Ok(self.state.lock().await.records_by_user(user_id))
    }
}

#[async_trait]
impl AuditRequestStore for InMemoryDatabase {
    async fn create_application(
        &self,
        application: &NewCheckApplication,
    ) -> CheckinResult<CheckApplication> {
        self.faults.check(FaultPoint::CreateApplication)?;
        self.state.lock().await.create_application(application)
    }

    async fn get_application(&self, id: i64) -> CheckinResult<Option<CheckApplication>> {
        Ok(self.state.lock().await.applications.get(&id).cloned())
    }

    async fn find_pending_application(
        &self,
        task_id: i64,
        user_id: i64,
    ) -> CheckinResult<Option<CheckApplication>> {
        Ok(self.state.lock().await.find_pending(task_id, user_id))
    }

    async fn list_applications_by_group(
        &self,
        group_id: i64,
        filter: AuditFilter,
    ) -> CheckinResult<Vec<CheckApplication>> {
        Ok(self
            .state
            .lock()
            .await
            .applications_where(|a| a.group_id == group_id && filter.matches(a.status)))
    }

    async fn list_applications_by_user(&self, user_id: i64) -> CheckinResult<Vec<CheckApplication>> {
        Ok(self
            .state
            .lock()
            .await
            .applications_where(|a| a.user_id == user_id))
    }

    async fn transition_application(
        &self,
        id: i64,
        from: AuditStatus,
        to: AuditStatus,
        at: DateTime<Utc>,
    ) -> CheckinResult<bool> {
        self.faults.check(FaultPoint::TransitionApplication)?;
        Ok(self.state.lock().await.transition(id, from, to, at))
    }
}

#[async_trait]
impl GroupStore for InMemoryDatabase {
    async fn get_group(&self, id: i64) -> CheckinResult<Option<Group>> {
        Ok(self.state.lock().await.groups.get(&id).cloned())
    }
}

#[async_trait]
impl GroupMemberStore for InMemoryDatabase {
    async fn get_member(&self, group_id: i64, user_id: i64) -> CheckinResult<Option<GroupMember>> {
        Ok(self.state.lock().await.members.get(&(group_id, user_id)).cloned())
    }

    async fn list_group_ids_for_user(&self, user_id: i64) -> CheckinResult<Vec<i64>> {
        Ok(self.state.lock().await.group_ids_for_user(user_id))
    }
}

/// Transaction over a private copy of the state
pub struct InMemoryTransaction {
    committed: Option<OwnedMutexGuard<State>>,
    working: Mutex<State>,
    faults: Arc<Faults>,
    counters: Arc<Counters>,
    finished: AtomicBool,
}

impl InMemoryTransaction {
    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.working.lock().unwrap())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::SeqCst) {
            self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn commit(mut self: Box<Self>) -> CheckinResult<()> {
        self.faults.check(FaultPoint::Commit)?;
        let working = std::mem::take(&mut *self.working.lock().unwrap());
        if let Some(mut guard) = self.committed.take() {
            *guard = working;
        }
        self.finished.store(true, Ordering::SeqCst);
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> CheckinResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryTransaction {
    async fn create_task(&self, task: &NewTask, now: DateTime<Utc>) -> CheckinResult<Task> {
        self.faults.check(FaultPoint::CreateTask)?;
        Ok(self.with_state(|s| s.create_task(task, now)))
    }

    async fn get_task(&self, id: i64) -> CheckinResult<Option<Task>> {
        Ok(self.with_state(|s| s.tasks.get(&id).cloned()))
    }

    async fn list_tasks_by_group(
        &self,
        group_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        Ok(self.with_state(|s| s.tasks_in_groups(&[group_id], filter, now)))
    }

    async fn list_tasks_by_user(
        &self,
        user_id: i64,
        filter: TaskFilter,
        now: DateTime<Utc>,
    ) -> CheckinResult<Vec<Task>> {
        Ok(self.with_state(|s| {
            let group_ids = s.group_ids_for_user(user_id);
            s.tasks_in_groups(&group_ids, filter, now)
        }))
    }

    async fn update_task(&self, task: &Task) -> CheckinResult<bool> {
        Ok(self.with_state(|s| s.update_task(task)))
    }

    async fn delete_task(&self, id: i64) -> CheckinResult<bool> {
        Ok(self.with_state(|s| s.tasks.remove(&id).is_some()))
    }
}

#[async_trait]
impl CheckinRecordStore for InMemoryTransaction {
    async fn create_record(&self, record: &NewTaskRecord) -> CheckinResult<TaskRecord> {
        self.faults.check(FaultPoint::CreateRecord)?;
        self.with_state(|s| s.create_record(record))
    }

    async fn get_record(&self, task_id: i64, user_id: i64) -> CheckinResult<Option<TaskRecord>> {
        Ok(self.with_state(|s| s.get_record(task_id, user_id)))
    }

    async fn list_records_by_task(&self, task_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        Ok(self.with_state(|s| s.records_by_task(task_id)))
    }

    async fn list_records_by_user(&self, user_id: i64) -> CheckinResult<Vec<TaskRecord>> {
        Ok(self.with_state(|s| s.records_by_user(user_id)))
    }
}

#[async_trait]
impl AuditRequestStore for InMemoryTransaction {
    async fn create_application(
        &self,
        application: &NewCheckApplication,
    ) -> CheckinResult<CheckApplication> {
        self.faults.check(FaultPoint::CreateApplication)?;
        self.with_state(|s| s.create_application(application))
    }

    async fn get_application(&self, id: i64) -> CheckinResult<Option<CheckApplication>> {
        Ok(self.with_state(|s| s.applications.get(&id).cloned()))
    }

    async fn find_pending_application(
        &self,
        task_id: i64,
        user_id: i64,
    ) -> CheckinResult<Option<CheckApplication>> {
        Ok(self.with_state(|s| s.find_pending(task_id, user_id)))
    }

    async fn list_applications_by_group(
        &self,
        group_id: i64,
        filter: AuditFilter,
    ) -> CheckinResult<Vec<CheckApplication>> {
        Ok(self.with_state(|s| {
            s.applications_where(|a| a.group_id == group_id && filter.matches(a.status))
        }))
    }

    async fn list_applications_by_user(&self, user_id: i64) -> CheckinResult<Vec<CheckApplication>> {
        Ok(self.with_state(|s| s.applications_where(|a| a.user_id == user_id)))
    }

    async fn transition_application(
        &self,
        id: i64,
        from: AuditStatus,
        to: AuditStatus,
        at: DateTime<Utc>,
    ) -> CheckinResult<bool> {
        self.faults.check(FaultPoint::TransitionApplication)?;
        Ok(self.with_state(|s| s.transition(id, from, to, at)))
    }
}

#[async_trait]
impl GroupStore for InMemoryTransaction {
    async fn get_group(&self, id: i64) -> CheckinResult<Option<Group>> {
        Ok(self.with_state(|s| s.groups.get(&id).cloned()))
    }
}

#[async_trait]
impl GroupMemberStore for InMemoryTransaction {
    async fn get_member(&self, group_id: i64, user_id: i64) -> CheckinResult<Option<GroupMember>> {
        Ok(self.with_state(|s| s.members.get(&(group_id, user_id)).cloned()))
    }

    async fn list_group_ids_for_user(&self, user_id: i64) -> CheckinResult<Vec<i64>> {
        Ok(self.with_state(|s| s.group_ids_for_user(user_id)))
    }
}

/// Cache whose every operation fails
#[derive(Debug, Clone, Default)]
pub struct FailingCache {
    calls: Arc<AtomicUsize>,
}

impl FailingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> CheckinResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(CheckinError::CacheError("cache unavailable".to_string()))
    }
}

#[async_trait]
impl CacheStore for FailingCache {
    async fn get(&self, _key: &str) -> CheckinResult<Option<Vec<u8>>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: std::time::Duration) -> CheckinResult<()> {
        self.fail()
    }

    async fn delete(&self, _keys: &[String]) -> CheckinResult<usize> {
        self.fail()
    }
}

/// Clock pinned to a settable instant
#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
