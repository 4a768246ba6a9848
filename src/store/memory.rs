//! In-memory credential store backing the router tests.
//!
//! Enforces the same uniqueness rules as `sql/schema.sql`: one account per
//! email and at most one pending promotion request per user.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{
    CredentialStore, NewSession, NewUser, PendingPromotion, SessionLookup, StoreError,
    StoreResult, UserRecord, UserSummary, UserUpdate,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PromotionStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Clone, Debug)]
struct PromotionRow {
    id: i64,
    user_id: Uuid,
    status: PromotionStatus,
    requested_at: DateTime<Utc>,
    decided_by: Option<Uuid>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, UserRecord>,
    sessions: HashMap<Vec<u8>, NewSession>,
    promotions: Vec<PromotionRow>,
    next_promotion_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.state().users.len()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }

    /// Expiry of the session stored under `token_hash`, if any.
    #[must_use]
    pub fn session_expiry(&self, token_hash: &[u8]) -> Option<DateTime<Utc>> {
        self.state()
            .sessions
            .get(token_hash)
            .map(|session| session.expires_at)
    }

    /// Status and approver of a promotion request, for assertions.
    #[must_use]
    pub fn promotion_status(&self, request_id: i64) -> Option<(String, Option<Uuid>)> {
        self.state()
            .promotions
            .iter()
            .find(|row| row.id == request_id)
            .map(|row| {
                let status = match row.status {
                    PromotionStatus::Pending => "pending",
                    PromotionStatus::Approved => "approved",
                    PromotionStatus::Rejected => "rejected",
                };
                (status.to_string(), row.decided_by)
            })
    }

    /// Drop a user row without touching dependent rows, to simulate a
    /// dangling reference.
    pub fn remove_user(&self, id: Uuid) -> Option<UserRecord> {
        self.state().users.remove(&id)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        Ok(self
            .state()
            .users
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.state().users.get(&id).cloned())
    }

    async fn insert_user(&self, user: &NewUser) -> StoreResult<()> {
        let mut state = self.state();
        if state.users.contains_key(&user.id)
            || state.users.values().any(|existing| existing.email == user.email)
        {
            return Err(StoreError::UniqueViolation);
        }
        state.users.insert(
            user.id,
            UserRecord {
                id: user.id,
                email: user.email.clone(),
                username: user.username.clone(),
                password_hash: user.password_hash.clone(),
                role: user.role.clone(),
            },
        );
        Ok(())
    }

    async fn set_user_role(&self, id: Uuid, role: &str) -> StoreResult<()> {
        let mut state = self.state();
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.role = role.to_string();
        Ok(())
    }

    async fn update_user(&self, id: Uuid, update: &UserUpdate) -> StoreResult<()> {
        let mut state = self.state();
        if let Some(email) = &update.email {
            if state
                .users
                .values()
                .any(|other| other.id != id && &other.email == email)
            {
                return Err(StoreError::UniqueViolation);
            }
        }
        let user = state.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(email) = &update.email {
            user.email.clone_from(email);
        }
        if let Some(username) = &update.username {
            user.username.clone_from(username);
        }
        if let Some(password_hash) = &update.password_hash {
            user.password_hash = Some(password_hash.clone());
        }
        Ok(())
    }

    async fn list_users_with_role(&self, role: &str) -> StoreResult<Vec<UserSummary>> {
        let mut users: Vec<UserSummary> = self
            .state()
            .users
            .values()
            .filter(|user| user.role == role)
            .map(|user| UserSummary {
                id: user.id,
                username: user.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn insert_session(&self, session: &NewSession) -> StoreResult<()> {
        let mut state = self.state();
        if state.sessions.contains_key(&session.token_hash) {
            return Err(StoreError::UniqueViolation);
        }
        state
            .sessions
            .insert(session.token_hash.clone(), session.clone());
        Ok(())
    }

    async fn lookup_session(&self, token_hash: &[u8]) -> StoreResult<Option<SessionLookup>> {
        let state = self.state();
        Ok(state.sessions.get(token_hash).map(|session| SessionLookup {
            user_id: session.user_id,
            role: state
                .users
                .get(&session.user_id)
                .map(|user| user.role.clone()),
            expires_at: session.expires_at,
            source: session.source,
        }))
    }

    async fn delete_session(&self, token_hash: &[u8]) -> StoreResult<()> {
        self.state().sessions.remove(token_hash);
        Ok(())
    }

    async fn delete_user_sessions(&self, user_id: Uuid, keep: &[Vec<u8>]) -> StoreResult<u64> {
        let mut state = self.state();
        let before = state.sessions.len();
        state
            .sessions
            .retain(|hash, session| session.user_id != user_id || keep.contains(hash));
        Ok((before - state.sessions.len()) as u64)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut state = self.state();
        let before = state.sessions.len();
        state.sessions.retain(|_, session| session.expires_at > now);
        Ok(u64::try_from(before - state.sessions.len()).unwrap_or(u64::MAX))
    }

    async fn insert_promotion_request(&self, user_id: Uuid) -> StoreResult<i64> {
        let mut state = self.state();
        if !state.users.contains_key(&user_id) {
            return Err(StoreError::NotFound);
        }
        if state
            .promotions
            .iter()
            .any(|row| row.user_id == user_id && row.status == PromotionStatus::Pending)
        {
            return Err(StoreError::UniqueViolation);
        }
        state.next_promotion_id += 1;
        let id = state.next_promotion_id;
        state.promotions.push(PromotionRow {
            id,
            user_id,
            status: PromotionStatus::Pending,
            requested_at: Utc::now(),
            decided_by: None,
        });
        Ok(id)
    }

    async fn list_pending_promotions(&self) -> StoreResult<Vec<PendingPromotion>> {
        let state = self.state();
        Ok(state
            .promotions
            .iter()
            .filter(|row| row.status == PromotionStatus::Pending)
            .filter_map(|row| {
                state.users.get(&row.user_id).map(|user| PendingPromotion {
                    id: row.id,
                    user_id: row.user_id,
                    username: user.username.clone(),
                    requested_at: row.requested_at,
                })
            })
            .collect())
    }

    async fn approve_promotion(&self, request_id: i64, approver: Uuid) -> StoreResult<Uuid> {
        // One lock scope: both rows are validated before either is written.
        let mut state = self.state();
        let index = state
            .promotions
            .iter()
            .position(|row| row.id == request_id && row.status == PromotionStatus::Pending)
            .ok_or(StoreError::NotFound)?;
        let user_id = state.promotions[index].user_id;
        let user = state
            .users
            .get_mut(&user_id)
            .filter(|user| matches!(user.role.as_str(), "guest" | "user"))
            .ok_or(StoreError::NotFound)?;
        user.role = "moderator".to_string();
        let row = &mut state.promotions[index];
        row.status = PromotionStatus::Approved;
        row.decided_by = Some(approver);
        Ok(user_id)
    }

    async fn reject_promotion(&self, request_id: i64, approver: Uuid) -> StoreResult<()> {
        let mut state = self.state();
        let row = state
            .promotions
            .iter_mut()
            .find(|row| row.id == request_id && row.status == PromotionStatus::Pending)
            .ok_or(StoreError::NotFound)?;
        row.status = PromotionStatus::Rejected;
        row.decided_by = Some(approver);
        Ok(())
    }
}
