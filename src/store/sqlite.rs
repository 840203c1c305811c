//! SQLite-backed ledger.
//!
//! Schema is created on open; there is no migration tooling. Every update is
//! a single-row statement, which is all the atomicity the orchestrator
//! relies on.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::ledger::{Ledger, LedgerError};
use super::models::{Account, Group, GroupRole, NewAccount};

const CREATE_ACCOUNTS: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    api_id INTEGER NOT NULL,
    api_hash TEXT NOT NULL,
    phone TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL DEFAULT '',
    session_blob TEXT,
    invites_remaining INTEGER NOT NULL DEFAULT 0,
    quota_reset_at TEXT,
    authenticated INTEGER NOT NULL DEFAULT 1,
    deactivated INTEGER NOT NULL DEFAULT 0,
    details TEXT
)";

const CREATE_GROUPS: &str = r"
CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    link TEXT NOT NULL UNIQUE,
    name TEXT,
    role TEXT NOT NULL DEFAULT 'source',
    enabled INTEGER NOT NULL DEFAULT 1,
    member_count INTEGER NOT NULL DEFAULT 0,
    details TEXT
)";

type AccountRow = (
    i64,
    i32,
    String,
    String,
    String,
    Option<String>,
    i64,
    Option<DateTime<Utc>>,
    bool,
    bool,
    Option<String>,
);

type GroupRow = (i64, String, Option<String>, String, bool, i64, Option<String>);

fn row_to_account(row: AccountRow) -> Account {
    let (
        id,
        api_id,
        api_hash,
        phone,
        name,
        session_blob,
        invites_remaining,
        quota_reset_at,
        authenticated,
        deactivated,
        details,
    ) = row;
    Account {
        id,
        api_id,
        api_hash,
        phone,
        name,
        session_blob,
        invites_remaining,
        quota_reset_at,
        authenticated,
        deactivated,
        details,
    }
}

fn row_to_group(row: GroupRow) -> Result<Group, LedgerError> {
    let (id, link, name, role, enabled, member_count, details) = row;
    let role = match role.as_str() {
        "source" => GroupRole::Source,
        "target" => GroupRole::Target,
        other => {
            return Err(LedgerError::Corrupted(format!(
                "unknown group role '{other}' for group {id}"
            )));
        }
    };
    Ok(Group {
        id,
        link,
        name,
        role,
        enabled,
        member_count,
        details,
    })
}

/// [`Ledger`] on a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Opens (creating if missing) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// An in-memory database, for tests and dry runs.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, LedgerError> {
        sqlx::query(CREATE_ACCOUNTS).execute(&pool).await?;
        sqlx::query(CREATE_GROUPS).execute(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn list_eligible_accounts(&self, now: DateTime<Utc>) -> Result<Vec<Account>, LedgerError> {
        let rows = sqlx::query_as::<_, AccountRow>(
            r"
            SELECT id, api_id, api_hash, phone, name, session_blob,
                   invites_remaining, quota_reset_at, authenticated, deactivated, details
            FROM accounts
            WHERE authenticated = 1 AND deactivated = 0
              AND (invites_remaining > 0 OR quota_reset_at IS NULL OR quota_reset_at <= ?)
            ORDER BY id
            ",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_account).collect())
    }

    async fn get_account(&self, id: i64) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query_as::<_, AccountRow>(
            r"
            SELECT id, api_id, api_hash, phone, name, session_blob,
                   invites_remaining, quota_reset_at, authenticated, deactivated, details
            FROM accounts
            WHERE id = ?
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_account))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, LedgerError> {
        let rows = sqlx::query_as::<_, AccountRow>(
            r"
            SELECT id, api_id, api_hash, phone, name, session_blob,
                   invites_remaining, quota_reset_at, authenticated, deactivated, details
            FROM accounts
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_account).collect())
    }

    async fn add_account(&self, account: NewAccount) -> Result<Account, LedgerError> {
        let result = sqlx::query(
            r"
            INSERT INTO accounts (api_id, api_hash, phone, name, session_blob)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(account.api_id)
        .bind(&account.api_hash)
        .bind(&account.phone)
        .bind(&account.name)
        .bind(&account.session_blob)
        .execute(&self.pool)
        .await?;

        Ok(Account {
            id: result.last_insert_rowid(),
            api_id: account.api_id,
            api_hash: account.api_hash,
            phone: account.phone,
            name: account.name,
            session_blob: account.session_blob,
            invites_remaining: 0,
            quota_reset_at: None,
            authenticated: true,
            deactivated: false,
            details: None,
        })
    }

    async fn delete_account(&self, id: i64) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn decrement_invite_quota(&self, id: i64, n: i64) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE accounts SET invites_remaining = MAX(invites_remaining - ?, 0) WHERE id = ?",
        )
        .bind(n)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn exhaust_quota(&self, id: i64, reset_at: DateTime<Utc>) -> Result<(), LedgerError> {
        sqlx::query("UPDATE accounts SET invites_remaining = 0, quota_reset_at = ? WHERE id = ?")
            .bind(reset_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_quota(
        &self,
        id: i64,
        invites_remaining: i64,
        quota_reset_at: Option<DateTime<Utc>>,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE accounts SET invites_remaining = ?, quota_reset_at = ? WHERE id = ?")
            .bind(invites_remaining)
            .bind(quota_reset_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_deactivated(&self, id: i64, reason: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE accounts SET deactivated = 1, details = ? WHERE id = ?")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_unauthenticated(&self, id: i64, reason: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE accounts SET authenticated = 0, details = ? WHERE id = ?")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_session(&self, id: i64, blob: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE accounts SET session_blob = ? WHERE id = ?")
            .bind(blob)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_enabled_source_groups(&self) -> Result<Vec<Group>, LedgerError> {
        let rows = sqlx::query_as::<_, GroupRow>(
            r"
            SELECT id, link, name, role, enabled, member_count, details
            FROM groups
            WHERE role = 'source' AND enabled = 1
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_group).collect()
    }

    async fn get_target_group(&self) -> Result<Option<Group>, LedgerError> {
        let row = sqlx::query_as::<_, GroupRow>(
            r"
            SELECT id, link, name, role, enabled, member_count, details
            FROM groups
            WHERE role = 'target'
            LIMIT 1
            ",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_group).transpose()
    }

    async fn list_groups(&self) -> Result<Vec<Group>, LedgerError> {
        let rows = sqlx::query_as::<_, GroupRow>(
            r"
            SELECT id, link, name, role, enabled, member_count, details
            FROM groups
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_group).collect()
    }

    async fn add_group(
        &self,
        link: &str,
        name: Option<&str>,
        role: GroupRole,
    ) -> Result<Group, LedgerError> {
        let mut tx = self.pool.begin().await?;

        if role == GroupRole::Target {
            sqlx::query("UPDATE groups SET role = 'source' WHERE role = 'target'")
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query("INSERT INTO groups (link, name, role) VALUES (?, ?, ?)")
            .bind(link)
            .bind(name)
            .bind(role.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Group {
            id: result.last_insert_rowid(),
            link: link.to_owned(),
            name: name.map(str::to_owned),
            role,
            enabled: true,
            member_count: 0,
            details: None,
        })
    }

    async fn delete_group(&self, id: i64) -> Result<(), LedgerError> {
        sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_target_group(&self, id: i64) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE groups SET role = 'source' WHERE role = 'target' AND id != ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE groups SET role = 'target', enabled = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_group_enabled(&self, id: i64, enabled: bool) -> Result<(), LedgerError> {
        sqlx::query("UPDATE groups SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable_group(&self, id: i64, reason: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE groups SET enabled = 0, details = ? WHERE id = ?")
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_member_count(&self, id: i64, count: i64) -> Result<(), LedgerError> {
        sqlx::query("UPDATE groups SET member_count = ? WHERE id = ?")
            .bind(count)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_group_name(&self, id: i64, name: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE groups SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn new_account(phone: &str) -> NewAccount {
        NewAccount {
            api_id: 12345,
            api_hash: "hash".to_owned(),
            phone: phone.to_owned(),
            name: "test".to_owned(),
            session_blob: None,
        }
    }

    #[tokio::test]
    async fn test_fresh_account_is_eligible() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        ledger.add_account(new_account("+100")).await.unwrap();

        let eligible = ledger.list_eligible_accounts(Utc::now()).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].phone, "+100");
    }

    #[tokio::test]
    async fn test_exhausted_account_ineligible_until_reset() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let acc = ledger.add_account(new_account("+100")).await.unwrap();

        let now = Utc::now();
        let reset = now + TimeDelta::days(1);
        ledger.exhaust_quota(acc.id, reset).await.unwrap();

        assert!(ledger.list_eligible_accounts(now).await.unwrap().is_empty());

        let later = reset + TimeDelta::minutes(1);
        let eligible = ledger.list_eligible_accounts(later).await.unwrap();
        assert_eq!(eligible.len(), 1);
    }

    #[tokio::test]
    async fn test_deactivated_account_never_eligible() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let acc = ledger.add_account(new_account("+100")).await.unwrap();
        ledger.mark_deactivated(acc.id, "phone banned").await.unwrap();

        assert!(ledger.list_eligible_accounts(Utc::now()).await.unwrap().is_empty());
        let stored = ledger.get_account(acc.id).await.unwrap().unwrap();
        assert!(stored.deactivated);
        assert_eq!(stored.details.as_deref(), Some("phone banned"));
    }

    #[tokio::test]
    async fn test_quota_decrement_floors_at_zero() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let acc = ledger.add_account(new_account("+100")).await.unwrap();
        ledger.update_quota(acc.id, 2, None).await.unwrap();

        ledger.decrement_invite_quota(acc.id, 1).await.unwrap();
        ledger.decrement_invite_quota(acc.id, 5).await.unwrap();

        let stored = ledger.get_account(acc.id).await.unwrap().unwrap();
        assert_eq!(stored.invites_remaining, 0);
    }

    #[tokio::test]
    async fn test_single_target_invariant() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let a = ledger
            .add_group("https://t.me/a", Some("A"), GroupRole::Target)
            .await
            .unwrap();
        let b = ledger
            .add_group("https://t.me/b", Some("B"), GroupRole::Source)
            .await
            .unwrap();

        ledger.set_target_group(b.id).await.unwrap();

        let target = ledger.get_target_group().await.unwrap().unwrap();
        assert_eq!(target.id, b.id);

        let sources = ledger.list_enabled_source_groups().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].id, a.id);
    }

    #[tokio::test]
    async fn test_disabled_group_left_out_of_sources() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let group = ledger
            .add_group("https://t.me/a", None, GroupRole::Source)
            .await
            .unwrap();

        ledger.disable_group(group.id, "channel is private").await.unwrap();

        assert!(ledger.list_enabled_source_groups().await.unwrap().is_empty());
        let stored = ledger
            .list_groups()
            .await
            .unwrap()
            .into_iter()
            .find(|g| g.id == group.id)
            .unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.details.as_deref(), Some("channel is private"));
    }

    #[tokio::test]
    async fn test_session_blob_round_trip() {
        let ledger = SqliteLedger::in_memory().await.unwrap();
        let acc = ledger.add_account(new_account("+100")).await.unwrap();
        ledger.save_session(acc.id, "b64blob").await.unwrap();

        let stored = ledger.get_account(acc.id).await.unwrap().unwrap();
        assert_eq!(stored.session_blob.as_deref(), Some("b64blob"));
    }
}
