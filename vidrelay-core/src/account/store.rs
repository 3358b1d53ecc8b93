use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::info;

use crate::sqlite::configure_connection;

use super::{
    AccountBinding, AccountError, AccountResult, BindingCredentials, NewBinding, SecretBox,
};

const ACCOUNT_SCHEMA: &str = include_str!("../../../sql/accounts.sql");

#[derive(Debug, Clone, Default)]
pub struct BindingStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    secret: Option<SecretBox>,
}

impl BindingStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn secret(mut self, secret: SecretBox) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn build(self) -> AccountResult<BindingStore> {
        let path = self.path.ok_or(AccountError::MissingStore)?;
        let secret = self.secret.ok_or(AccountError::MissingSecret)?;
        let flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        Ok(BindingStore {
            path,
            flags,
            secret,
        })
    }
}

/// `account_bindings` table. At most one primary binding per user and
/// platform.
#[derive(Debug, Clone)]
pub struct BindingStore {
    path: PathBuf,
    flags: OpenFlags,
    secret: SecretBox,
}

impl BindingStore {
    pub fn builder() -> BindingStoreBuilder {
        BindingStoreBuilder::new()
    }

    fn open(&self) -> AccountResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            AccountError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| AccountError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> AccountResult<()> {
        let conn = self.open()?;
        conn.execute_batch(ACCOUNT_SCHEMA)?;
        Ok(())
    }

    fn seal(&self, value: Option<&str>) -> AccountResult<Option<String>> {
        value
            .filter(|value| !value.is_empty())
            .map(|value| self.secret.seal(value))
            .transpose()
    }

    fn unseal(&self, value: Option<&str>) -> AccountResult<Option<String>> {
        value.map(|value| self.secret.open(value)).transpose()
    }

    /// Inserts or refreshes a binding, sealing its credentials. The first
    /// binding of a user on a platform becomes primary.
    pub fn save(&self, binding: &NewBinding) -> AccountResult<AccountBinding> {
        let cookies = self.seal(binding.cookies.as_deref())?;
        let access_token = self.seal(binding.access_token.as_deref())?;
        let refresh_token = self.seal(binding.refresh_token.as_deref())?;

        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO account_bindings (
                 user_id, platform, platform_uid, username, cookies, access_token, refresh_token
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(user_id, platform, platform_uid) DO UPDATE SET
                 username = COALESCE(excluded.username, account_bindings.username),
                 cookies = COALESCE(excluded.cookies, account_bindings.cookies),
                 access_token = COALESCE(excluded.access_token, account_bindings.access_token),
                 refresh_token = COALESCE(excluded.refresh_token, account_bindings.refresh_token),
                 status = 'active',
                 updated_at = CURRENT_TIMESTAMP",
            params![
                binding.user_id,
                binding.platform,
                binding.platform_uid,
                binding.username,
                cookies,
                access_token,
                refresh_token,
            ],
        )?;
        tx.execute(
            "UPDATE account_bindings SET is_primary = 1
             WHERE user_id = ?1 AND platform = ?2 AND platform_uid = ?3
               AND NOT EXISTS (
                   SELECT 1 FROM account_bindings
                   WHERE user_id = ?1 AND platform = ?2 AND is_primary = 1
               )",
            params![binding.user_id, binding.platform, binding.platform_uid],
        )?;
        let saved = tx.query_row(
            "SELECT * FROM account_bindings
             WHERE user_id = ?1 AND platform = ?2 AND platform_uid = ?3",
            params![binding.user_id, binding.platform, binding.platform_uid],
            |row| AccountBinding::from_row(row),
        )?;
        tx.commit()?;
        info!(target: "accounts", user_id = %saved.user_id, platform = %saved.platform, binding_id = saved.id, primary = saved.is_primary, "binding saved");
        Ok(saved)
    }

    pub fn get(&self, id: i64) -> AccountResult<Option<AccountBinding>> {
        let conn = self.open()?;
        let binding = conn
            .query_row(
                "SELECT * FROM account_bindings WHERE id = ?1",
                [id],
                |row| AccountBinding::from_row(row),
            )
            .optional()?;
        Ok(binding)
    }

    /// Bindings of one user, primary first, then most recently updated.
    pub fn list_user_bindings(
        &self,
        user_id: &str,
        platform: Option<&str>,
    ) -> AccountResult<Vec<AccountBinding>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM account_bindings
             WHERE user_id = ?1 AND (?2 IS NULL OR platform = ?2)
             ORDER BY is_primary DESC, updated_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id, platform], |row| AccountBinding::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn primary_binding(
        &self,
        user_id: &str,
        platform: &str,
    ) -> AccountResult<Option<AccountBinding>> {
        let conn = self.open()?;
        let binding = conn
            .query_row(
                "SELECT * FROM account_bindings
                 WHERE user_id = ?1 AND platform = ?2 AND is_primary = 1
                 LIMIT 1",
                params![user_id, platform],
                |row| AccountBinding::from_row(row),
            )
            .optional()?;
        Ok(binding)
    }

    /// Clears every primary flag for the user on the platform, then sets
    /// it on `binding_id`, inside one immediate transaction.
    pub fn set_primary(&self, user_id: &str, platform: &str, binding_id: i64) -> AccountResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE account_bindings
             SET is_primary = 0, updated_at = CURRENT_TIMESTAMP
             WHERE user_id = ?1 AND platform = ?2 AND is_primary = 1",
            params![user_id, platform],
        )?;
        let affected = tx.execute(
            "UPDATE account_bindings
             SET is_primary = 1, updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND user_id = ?2 AND platform = ?3",
            params![binding_id, user_id, platform],
        )?;
        if affected == 0 {
            tx.rollback()?;
            return Err(AccountError::NotFound {
                id: binding_id,
                user_id: user_id.to_string(),
                platform: platform.to_string(),
            });
        }
        tx.commit()?;
        info!(target: "accounts", user_id, platform, binding_id, "primary binding switched");
        Ok(())
    }

    pub fn credentials(&self, binding: &AccountBinding) -> AccountResult<BindingCredentials> {
        Ok(BindingCredentials {
            cookies: self.unseal(binding.cookies.as_deref())?,
            access_token: self.unseal(binding.access_token.as_deref())?,
            refresh_token: self.unseal(binding.refresh_token.as_deref())?,
        })
    }

    pub fn touch_last_used(&self, id: i64) -> AccountResult<bool> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE account_bindings SET last_used_at = CURRENT_TIMESTAMP WHERE id = ?1",
            [id],
        )?;
        Ok(affected > 0)
    }

    /// Most recently used active binding on a platform, across users.
    pub fn latest_binding(&self, platform: &str) -> AccountResult<Option<AccountBinding>> {
        let conn = self.open()?;
        let binding = conn
            .query_row(
                "SELECT * FROM account_bindings
                 WHERE platform = ?1 AND status = 'active'
                 ORDER BY last_used_at IS NULL, last_used_at DESC, updated_at DESC, id DESC
                 LIMIT 1",
                [platform],
                |row| AccountBinding::from_row(row),
            )
            .optional()?;
        Ok(binding)
    }

    /// Deletes a binding. When it was primary, the most recently updated
    /// remaining binding for the same platform takes over.
    pub fn delete(&self, user_id: &str, id: i64) -> AccountResult<bool> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed: Option<(String, i64)> = tx
            .query_row(
                "SELECT platform, is_primary FROM account_bindings WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((platform, was_primary)) = removed else {
            return Ok(false);
        };
        tx.execute("DELETE FROM account_bindings WHERE id = ?1", [id])?;
        if was_primary != 0 {
            tx.execute(
                "UPDATE account_bindings SET is_primary = 1
                 WHERE id = (
                     SELECT id FROM account_bindings
                     WHERE user_id = ?1 AND platform = ?2
                     ORDER BY updated_at DESC, id DESC
                     LIMIT 1
                 )",
                params![user_id, platform],
            )?;
        }
        tx.commit()?;
        info!(target: "accounts", user_id, binding_id = id, platform = %platform, "binding deleted");
        Ok(true)
    }
}
