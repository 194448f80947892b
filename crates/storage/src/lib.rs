use chrono::{DateTime, Utc};
use oscard_proto::canonical_screen_name;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls, Row};

const INIT_SQL: &str = include_str!("../migrations/001_init.sql");

const USER_COLUMNS: &str = "screen_name, formatted_screen_name, email, password, password_hash, \
    profile, profile_mime, away_message, away_mime, status, verified, last_activity_at, created_at";

#[derive(Debug, PartialEq, Eq)]
pub enum StorageError {
    Postgres,
    Missing,
    Duplicate,
    Invalid,
    Serialization,
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres failure"),
            Self::Missing => write!(f, "missing record"),
            Self::Duplicate => write!(f, "duplicate record"),
            Self::Invalid => write!(f, "invalid state"),
            Self::Serialization => write!(f, "serialization failure"),
        }
    }
}

impl Error for StorageError {}

/// A user's published presence.
///
/// `Away` doubles as the offline state: disconnect and boot-time reset
/// both land here, and watchers see Away and Invisible users as departed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Away,
    Online,
    Idle,
    Dnd,
    Invisible,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Away => "away",
            UserStatus::Online => "online",
            UserStatus::Idle => "idle",
            UserStatus::Dnd => "dnd",
            UserStatus::Invisible => "invisible",
        }
    }

    /// Whether watchers should see this user as present.
    pub fn is_present(&self) -> bool {
        matches!(self, UserStatus::Online | UserStatus::Idle | UserStatus::Dnd)
    }
}

impl FromStr for UserStatus {
    type Err = StorageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "away" => Ok(UserStatus::Away),
            "online" => Ok(UserStatus::Online),
            "idle" => Ok(UserStatus::Idle),
            "dnd" => Ok(UserStatus::Dnd),
            "invisible" => Ok(UserStatus::Invisible),
            _ => Err(StorageError::Serialization),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub screen_name: String,
    pub formatted_screen_name: String,
    pub email: String,
    /// Login secret recomputed into the MD5 challenge digest.
    pub password: String,
    /// Argon2 verifier written at registration.
    pub password_hash: String,
    pub profile: String,
    pub profile_mime: String,
    pub away_message: String,
    pub away_mime: String,
    pub status: UserStatus,
    pub verified: bool,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub formatted_screen_name: String,
    pub email: String,
    pub password: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyRecord {
    pub owner: String,
    pub buddy: String,
    pub group_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: i64,
    pub sender: String,
    pub recipient: String,
    pub contents: String,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailVerificationRecord {
    pub screen_name: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub struct Storage {
    client: Client,
    _pg_task: JoinHandle<()>,
}

/// Establishes connectivity to the PostgreSQL backend.
pub async fn connect(postgres_dsn: &str) -> Result<Storage, StorageError> {
    let (client, connection) = tokio_postgres::connect(postgres_dsn, NoTls)
        .await
        .map_err(|_| StorageError::Postgres)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!("postgres connection stopped: {}", error);
        }
    });
    Ok(Storage {
        client,
        _pg_task: task,
    })
}

impl Storage {
    /// Applies bundled migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Lightweight connectivity probe.
    pub async fn readiness(&self) -> Result<(), StorageError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Provisions an account. The canonical screen name is the primary
    /// key, so a collision on any capitalization/spacing variant is a
    /// duplicate.
    pub async fn create_user(&self, new: &NewUser) -> Result<UserRecord, StorageError> {
        let canonical = canonical_screen_name(&new.formatted_screen_name);
        if canonical.is_empty() {
            return Err(StorageError::Invalid);
        }
        let query = format!(
            "INSERT INTO users (screen_name, formatted_screen_name, email, password, password_hash)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (screen_name) DO NOTHING
            RETURNING {USER_COLUMNS}"
        );
        let row = self
            .client
            .query_opt(
                &query,
                &[
                    &canonical,
                    &new.formatted_screen_name,
                    &new.email,
                    &new.password,
                    &new.password_hash,
                ],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => row_to_user(&row),
            None => Err(StorageError::Duplicate),
        }
    }

    pub async fn load_user(&self, screen_name: &str) -> Result<UserRecord, StorageError> {
        let canonical = canonical_screen_name(screen_name);
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE screen_name = $1");
        let row = self
            .client
            .query_opt(&query, &[&canonical])
            .await
            .map_err(|_| StorageError::Postgres)?;
        match row {
            Some(row) => row_to_user(&row),
            None => Err(StorageError::Missing),
        }
    }

    pub async fn update_status(
        &self,
        screen_name: &str,
        status: UserStatus,
    ) -> Result<(), StorageError> {
        let canonical = canonical_screen_name(screen_name);
        self.client
            .execute(
                "UPDATE users SET status = $2 WHERE screen_name = $1",
                &[&canonical, &status.as_str()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn touch_activity(&self, screen_name: &str) -> Result<(), StorageError> {
        let canonical = canonical_screen_name(screen_name);
        self.client
            .execute(
                "UPDATE users SET last_activity_at = $2 WHERE screen_name = $1",
                &[&canonical, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn set_profile(
        &self,
        screen_name: &str,
        mime: &str,
        profile: &str,
    ) -> Result<(), StorageError> {
        let canonical = canonical_screen_name(screen_name);
        self.client
            .execute(
                "UPDATE users SET profile = $2, profile_mime = $3 WHERE screen_name = $1",
                &[&canonical, &profile, &mime],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn set_away_message(
        &self,
        screen_name: &str,
        mime: &str,
        away_message: &str,
    ) -> Result<(), StorageError> {
        let canonical = canonical_screen_name(screen_name);
        self.client
            .execute(
                "UPDATE users SET away_message = $2, away_mime = $3 WHERE screen_name = $1",
                &[&canonical, &away_message, &mime],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Boot-time invariant: no live session outlives the process, so
    /// every user starts Away.
    pub async fn reset_all_away(&self) -> Result<u64, StorageError> {
        let affected = self
            .client
            .execute(
                "UPDATE users SET status = $1 WHERE status != $1",
                &[&UserStatus::Away.as_str()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(affected)
    }

    /// Inserts a buddy edge; re-adding is idempotent.
    pub async fn upsert_buddy(
        &self,
        owner: &str,
        buddy: &str,
        group_name: &str,
    ) -> Result<(), StorageError> {
        let owner = canonical_screen_name(owner);
        let buddy = canonical_screen_name(buddy);
        if owner == buddy || buddy.is_empty() {
            return Err(StorageError::Invalid);
        }
        self.client
            .execute(
                "INSERT INTO buddies (owner, buddy, group_name) VALUES ($1, $2, $3)
                ON CONFLICT (owner, buddy) DO NOTHING",
                &[&owner, &buddy, &group_name],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Deletes a buddy edge; a missing row is not an error.
    pub async fn remove_buddy(&self, owner: &str, buddy: &str) -> Result<(), StorageError> {
        let owner = canonical_screen_name(owner);
        let buddy = canonical_screen_name(buddy);
        self.client
            .execute(
                "DELETE FROM buddies WHERE owner = $1 AND buddy = $2",
                &[&owner, &buddy],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    pub async fn buddies_of(&self, owner: &str) -> Result<Vec<BuddyRecord>, StorageError> {
        let owner = canonical_screen_name(owner);
        let rows = self
            .client
            .query(
                "SELECT owner, buddy, group_name, created_at FROM buddies
                WHERE owner = $1 ORDER BY buddy",
                &[&owner],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows
            .into_iter()
            .map(|row| BuddyRecord {
                owner: row.get(0),
                buddy: row.get(1),
                group_name: row.get(2),
                created_at: row.get(3),
            })
            .collect())
    }

    /// Everyone who lists `target` as a buddy: the fan-out set for one
    /// presence transition.
    pub async fn watchers_of(&self, target: &str) -> Result<Vec<String>, StorageError> {
        let target = canonical_screen_name(target);
        let rows = self
            .client
            .query("SELECT owner FROM buddies WHERE buddy = $1", &[&target])
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// Mints the next message row; the BIGSERIAL key is the monotonic
    /// 64-bit message id.
    pub async fn insert_message(
        &self,
        sender: &str,
        recipient: &str,
        contents: &str,
    ) -> Result<MessageRecord, StorageError> {
        let sender = canonical_screen_name(sender);
        let recipient = canonical_screen_name(recipient);
        let row = self
            .client
            .query_one(
                "INSERT INTO messages (sender, recipient, contents) VALUES ($1, $2, $3)
                RETURNING message_id, sender, recipient, contents, created_at, delivered_at",
                &[&sender, &recipient, &contents],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(row_to_message(&row))
    }

    pub async fn mark_delivered(&self, message_id: i64) -> Result<(), StorageError> {
        self.client
            .execute(
                "UPDATE messages SET delivered_at = $2 WHERE message_id = $1",
                &[&message_id, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }

    /// Undelivered messages for a recipient, oldest first.
    pub async fn undelivered_for(
        &self,
        recipient: &str,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let recipient = canonical_screen_name(recipient);
        let rows = self
            .client
            .query(
                "SELECT message_id, sender, recipient, contents, created_at, delivered_at
                FROM messages
                WHERE recipient = $1 AND delivered_at IS NULL
                ORDER BY message_id",
                &[&recipient],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Provisions the single active verification token for a user,
    /// replacing any previous one.
    pub async fn upsert_email_verification(
        &self,
        screen_name: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<EmailVerificationRecord, StorageError> {
        let canonical = canonical_screen_name(screen_name);
        let row = self
            .client
            .query_one(
                "INSERT INTO email_verifications (screen_name, token, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (screen_name) DO UPDATE
                SET token = excluded.token, expires_at = excluded.expires_at,
                    created_at = now()
                RETURNING screen_name, token, expires_at, created_at",
                &[&canonical, &token, &expires_at],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(EmailVerificationRecord {
            screen_name: row.get(0),
            token: row.get(1),
            expires_at: row.get(2),
            created_at: row.get(3),
        })
    }

    /// Consumes a live token and flips the user to verified. A missing,
    /// mismatched or expired token is `Missing`.
    pub async fn claim_email_verification(
        &self,
        screen_name: &str,
        token: &str,
    ) -> Result<(), StorageError> {
        let canonical = canonical_screen_name(screen_name);
        let row = self
            .client
            .query_opt(
                "DELETE FROM email_verifications
                WHERE screen_name = $1 AND token = $2 AND expires_at > $3
                RETURNING screen_name",
                &[&canonical, &token, &Utc::now()],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        if row.is_none() {
            return Err(StorageError::Missing);
        }
        self.client
            .execute(
                "UPDATE users SET verified = TRUE WHERE screen_name = $1",
                &[&canonical],
            )
            .await
            .map_err(|_| StorageError::Postgres)?;
        Ok(())
    }
}

fn row_to_user(row: &Row) -> Result<UserRecord, StorageError> {
    let status: String = row.get(9);
    Ok(UserRecord {
        screen_name: row.get(0),
        formatted_screen_name: row.get(1),
        email: row.get(2),
        password: row.get(3),
        password_hash: row.get(4),
        profile: row.get(5),
        profile_mime: row.get(6),
        away_message: row.get(7),
        away_mime: row.get(8),
        status: status.parse()?,
        verified: row.get(10),
        last_activity_at: row.get(11),
        created_at: row.get(12),
    })
}

fn row_to_message(row: &Row) -> MessageRecord {
    MessageRecord {
        message_id: row.get(0),
        sender: row.get(1),
        recipient: row.get(2),
        contents: row.get(3),
        created_at: row.get(4),
        delivered_at: row.get(5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            UserStatus::Away,
            UserStatus::Online,
            UserStatus::Idle,
            UserStatus::Dnd,
            UserStatus::Invisible,
        ] {
            assert_eq!(status.as_str().parse::<UserStatus>().unwrap(), status);
        }
        assert!("offline".parse::<UserStatus>().is_err());
    }

    #[test]
    fn presence_polarity() {
        assert!(UserStatus::Online.is_present());
        assert!(UserStatus::Idle.is_present());
        assert!(UserStatus::Dnd.is_present());
        assert!(!UserStatus::Away.is_present());
        assert!(!UserStatus::Invisible.is_present());
    }
}
