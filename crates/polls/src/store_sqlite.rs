//! SQLite-backed poll store using sqlx.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    secrecy::ExposeSecret,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions, sqlite::SqliteRow},
};

use crate::{
    crypto::TokenCipher,
    error::{Context, Error, Result},
    store::PollStore,
    types::{
        AuthorizationWindow, CampaignMembership, ChannelLink, ChannelMode, LinkStatus, Poll,
        PollResult, Streamer, StreamerCredential,
    },
};

/// Persistent store. Provider tokens are sealed with [`TokenCipher`] before
/// they reach the database.
pub struct SqlitePollStore {
    pool: SqlitePool,
    cipher: Arc<TokenCipher>,
}

impl SqlitePollStore {
    /// Connect to `database_url` and run migrations.
    pub async fn new(database_url: &str, cipher: Arc<TokenCipher>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        crate::run_migrations(&pool).await?;
        Ok(Self { pool, cipher })
    }

    /// Use an existing pool. [`crate::run_migrations`] must already have run.
    pub fn with_pool(pool: SqlitePool, cipher: Arc<TokenCipher>) -> Self {
        Self { pool, cipher }
    }

    fn streamer_from_row(row: &SqliteRow) -> Result<Streamer> {
        Ok(Streamer {
            id: row.try_get("id")?,
            login: row.try_get("login")?,
            display_name: row.try_get("display_name")?,
            provider_user_id: row.try_get("provider_user_id")?,
            broadcaster_type: row.try_get("broadcaster_type")?,
            active: row.try_get("active")?,
        })
    }
}

fn poll_from_row(row: &SqliteRow) -> Result<Poll> {
    let options: String = row.try_get("options")?;
    let status: String = row.try_get("status")?;
    let duration: i64 = row.try_get("duration_secs")?;
    Ok(Poll {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        question: row.try_get("question")?,
        options: serde_json::from_str(&options)?,
        duration_secs: u32::try_from(duration)
            .with_context(|| format!("invalid stored duration {duration}"))?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn link_from_row(row: &SqliteRow) -> Result<ChannelLink> {
    let mode: String = row.try_get("mode")?;
    let mode = match mode.as_str() {
        "NATIVE" => ChannelMode::Native {
            remote_poll_id: row.try_get("remote_poll_id")?,
        },
        "CHAT" => ChannelMode::Chat {
            channel_login: row
                .try_get::<Option<String>, _>("channel_login")?
                .unwrap_or_default(),
        },
        other => return Err(Error::message(format!("unknown channel mode: {other}"))),
    };
    let status: String = row.try_get("status")?;
    let votes: String = row.try_get("votes")?;
    Ok(ChannelLink {
        id: row.try_get("id")?,
        poll_id: row.try_get("poll_id")?,
        streamer_id: row.try_get("streamer_id")?,
        mode,
        status: status.parse::<LinkStatus>()?,
        votes: serde_json::from_str(&votes)?,
        failure: row.try_get("failure")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn membership_from_row(row: &SqliteRow) -> Result<CampaignMembership> {
    let status: String = row.try_get("status")?;
    let granted: Option<DateTime<Utc>> = row.try_get("authorization_granted_at")?;
    let expires: Option<DateTime<Utc>> = row.try_get("authorization_expires_at")?;
    Ok(CampaignMembership {
        campaign_id: row.try_get("campaign_id")?,
        streamer_id: row.try_get("streamer_id")?,
        status: status.parse()?,
        authorization: granted.zip(expires).map(|(granted_at, expires_at)| {
            AuthorizationWindow {
                granted_at,
                expires_at,
            }
        }),
    })
}

fn mode_columns(mode: &ChannelMode) -> (&'static str, Option<&str>, Option<&str>) {
    match mode {
        ChannelMode::Native { remote_poll_id } => ("NATIVE", remote_poll_id.as_deref(), None),
        ChannelMode::Chat { channel_login } => ("CHAT", None, Some(channel_login.as_str())),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl PollStore for SqlitePollStore {
    async fn create_poll(&self, poll: &Poll) -> Result<()> {
        sqlx::query(
            "INSERT INTO polls (id, campaign_id, question, options, duration_secs, status,
                                created_at, started_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&poll.id)
        .bind(&poll.campaign_id)
        .bind(&poll.question)
        .bind(serde_json::to_string(&poll.options)?)
        .bind(i64::from(poll.duration_secs))
        .bind(poll.status.as_str())
        .bind(poll.created_at)
        .bind(poll.started_at)
        .bind(poll.ended_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Duplicate {
                    what: format!("poll {}", poll.id),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn get_poll(&self, poll_id: &str) -> Result<Option<Poll>> {
        sqlx::query("SELECT * FROM polls WHERE id = ?")
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(poll_from_row)
            .transpose()
    }

    async fn update_poll(&self, poll: &Poll) -> Result<()> {
        let result = sqlx::query(
            "UPDATE polls SET campaign_id = ?, question = ?, options = ?, duration_secs = ?,
                              status = ?, started_at = ?, ended_at = ?
             WHERE id = ?",
        )
        .bind(&poll.campaign_id)
        .bind(&poll.question)
        .bind(serde_json::to_string(&poll.options)?)
        .bind(i64::from(poll.duration_secs))
        .bind(poll.status.as_str())
        .bind(poll.started_at)
        .bind(poll.ended_at)
        .bind(&poll.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::poll_not_found(&poll.id));
        }
        Ok(())
    }

    async fn running_polls(&self, campaign_id: &str) -> Result<Vec<Poll>> {
        let rows = sqlx::query("SELECT * FROM polls WHERE campaign_id = ? AND status = 'RUNNING'")
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(poll_from_row).collect()
    }

    async fn insert_link(&self, link: &ChannelLink) -> Result<()> {
        let (mode, remote_poll_id, channel_login) = mode_columns(&link.mode);
        sqlx::query(
            "INSERT INTO poll_channel_links (id, poll_id, streamer_id, mode, remote_poll_id,
                                             channel_login, status, votes, failure,
                                             created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&link.id)
        .bind(&link.poll_id)
        .bind(&link.streamer_id)
        .bind(mode)
        .bind(remote_poll_id)
        .bind(channel_login)
        .bind(link.status.as_str())
        .bind(serde_json::to_string(&link.votes)?)
        .bind(&link.failure)
        .bind(link.created_at)
        .bind(link.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Duplicate {
                    what: format!(
                        "channel link for streamer {} on poll {}",
                        link.streamer_id, link.poll_id
                    ),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn update_link(&self, link: &ChannelLink) -> Result<()> {
        let (mode, remote_poll_id, channel_login) = mode_columns(&link.mode);
        let result = sqlx::query(
            "UPDATE poll_channel_links
             SET mode = ?, remote_poll_id = ?, channel_login = ?, status = ?, votes = ?,
                 failure = ?, updated_at = ?
             WHERE poll_id = ? AND streamer_id = ?",
        )
        .bind(mode)
        .bind(remote_poll_id)
        .bind(channel_login)
        .bind(link.status.as_str())
        .bind(serde_json::to_string(&link.votes)?)
        .bind(&link.failure)
        .bind(link.updated_at)
        .bind(&link.poll_id)
        .bind(&link.streamer_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::message(format!("channel link not found: {}", link.id)));
        }
        Ok(())
    }

    async fn list_links(&self, poll_id: &str) -> Result<Vec<ChannelLink>> {
        let rows =
            sqlx::query("SELECT * FROM poll_channel_links WHERE poll_id = ? ORDER BY streamer_id")
                .bind(poll_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(link_from_row).collect()
    }

    async fn upsert_streamer(&self, streamer: &Streamer) -> Result<()> {
        sqlx::query(
            "INSERT INTO streamers (id, login, display_name, provider_user_id, broadcaster_type, active)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                login = excluded.login,
                display_name = excluded.display_name,
                provider_user_id = excluded.provider_user_id,
                broadcaster_type = excluded.broadcaster_type,
                active = excluded.active",
        )
        .bind(&streamer.id)
        .bind(&streamer.login)
        .bind(&streamer.display_name)
        .bind(&streamer.provider_user_id)
        .bind(&streamer.broadcaster_type)
        .bind(streamer.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_streamer(&self, streamer_id: &str) -> Result<Option<Streamer>> {
        sqlx::query("SELECT * FROM streamers WHERE id = ?")
            .bind(streamer_id)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(Self::streamer_from_row)
            .transpose()
    }

    async fn active_streamers(&self) -> Result<Vec<Streamer>> {
        let rows = sqlx::query(
            "SELECT s.* FROM streamers s
             JOIN streamer_credentials c ON c.streamer_id = s.id
             WHERE s.active = 1 AND c.active = 1
             ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::streamer_from_row).collect()
    }

    async fn get_credential(&self, streamer_id: &str) -> Result<Option<StreamerCredential>> {
        let Some(row) = sqlx::query("SELECT * FROM streamer_credentials WHERE streamer_id = ?")
            .bind(streamer_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let access: String = row.try_get("access_token")?;
        let refresh: String = row.try_get("refresh_token")?;
        let scopes: String = row.try_get("scopes")?;
        Ok(Some(StreamerCredential {
            streamer_id: streamer_id.to_string(),
            access_token: self.cipher.open(&access, streamer_id)?,
            refresh_token: self.cipher.open(&refresh, streamer_id)?,
            scopes: serde_json::from_str(&scopes)?,
            active: row.try_get("active")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn save_credential(&self, credential: &StreamerCredential) -> Result<()> {
        let id = credential.streamer_id.as_str();
        sqlx::query(
            "INSERT INTO streamer_credentials (streamer_id, access_token, refresh_token, scopes,
                                               active, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(streamer_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                scopes = excluded.scopes,
                active = excluded.active,
                updated_at = excluded.updated_at",
        )
        .bind(id)
        .bind(self.cipher.seal(credential.access_token.expose_secret(), id)?)
        .bind(self.cipher.seal(credential.refresh_token.expose_secret(), id)?)
        .bind(serde_json::to_string(&credential.scopes)?)
        .bind(credential.active)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn deactivate_credential(&self, streamer_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE streamer_credentials SET active = 0, updated_at = ? WHERE streamer_id = ?",
        )
        .bind(Utc::now())
        .bind(streamer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_membership(&self, membership: &CampaignMembership) -> Result<()> {
        sqlx::query(
            "INSERT INTO campaign_memberships (campaign_id, streamer_id, status,
                                               authorization_granted_at, authorization_expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(campaign_id, streamer_id) DO UPDATE SET
                status = excluded.status,
                authorization_granted_at = excluded.authorization_granted_at,
                authorization_expires_at = excluded.authorization_expires_at",
        )
        .bind(&membership.campaign_id)
        .bind(&membership.streamer_id)
        .bind(membership.status.as_str())
        .bind(membership.authorization.map(|w| w.granted_at))
        .bind(membership.authorization.map(|w| w.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn campaign_members(&self, campaign_id: &str) -> Result<Vec<CampaignMembership>> {
        let rows = sqlx::query(
            "SELECT * FROM campaign_memberships WHERE campaign_id = ? ORDER BY streamer_id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(membership_from_row).collect()
    }

    async fn grant_authorization(
        &self,
        campaign_id: &str,
        streamer_id: &str,
        window: AuthorizationWindow,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaign_memberships
             SET authorization_granted_at = ?, authorization_expires_at = ?
             WHERE campaign_id = ? AND streamer_id = ?",
        )
        .bind(window.granted_at)
        .bind(window.expires_at)
        .bind(campaign_id)
        .bind(streamer_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::message(format!(
                "streamer {streamer_id} is not a member of campaign {campaign_id}"
            )));
        }
        Ok(())
    }

    async fn revoke_authorization(&self, campaign_id: &str, streamer_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE campaign_memberships
             SET authorization_granted_at = NULL, authorization_expires_at = NULL
             WHERE campaign_id = ? AND streamer_id = ?",
        )
        .bind(campaign_id)
        .bind(streamer_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn authorized_streamers(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Streamer>> {
        // Timestamps are compared after decoding so the check does not depend
        // on the stored text format.
        let rows = sqlx::query(
            "SELECT s.*, m.authorization_expires_at AS expires_at
             FROM campaign_memberships m
             JOIN streamers s ON s.id = m.streamer_id
             JOIN streamer_credentials c ON c.streamer_id = s.id
             WHERE m.campaign_id = ? AND m.status = 'ACTIVE'
               AND m.authorization_expires_at IS NOT NULL
               AND s.active = 1 AND c.active = 1
             ORDER BY s.id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let mut streamers = Vec::with_capacity(rows.len());
        for row in &rows {
            let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
            if expires_at > now {
                streamers.push(Self::streamer_from_row(row)?);
            }
        }
        Ok(streamers)
    }

    async fn save_result(&self, result: &PollResult) -> Result<()> {
        sqlx::query(
            "INSERT INTO poll_results (poll_id, status, total_votes, data, ended_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(poll_id) DO UPDATE SET
                status = excluded.status,
                total_votes = excluded.total_votes,
                data = excluded.data,
                ended_at = excluded.ended_at",
        )
        .bind(&result.poll_id)
        .bind(result.status.as_str())
        .bind(i64::try_from(result.total_votes).unwrap_or(i64::MAX))
        .bind(serde_json::to_string(result)?)
        .bind(result.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_result(&self, poll_id: &str) -> Result<Option<PollResult>> {
        let row = sqlx::query("SELECT data FROM poll_results WHERE poll_id = ?")
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: String = row.try_get("data")?;
                Ok(Some(serde_json::from_str(&data)?))
            },
            None => Ok(None),
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::types::{MembershipStatus, PollStatus},
        chrono::Duration,
    };

    async fn store() -> SqlitePollStore {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        SqlitePollStore::with_pool(pool, Arc::new(TokenCipher::new([3u8; 32])))
    }

    fn streamer(id: &str, tier: Option<&str>) -> Streamer {
        Streamer {
            id: id.into(),
            login: id.into(),
            display_name: id.into(),
            provider_user_id: format!("tw-{id}"),
            broadcaster_type: tier.map(Into::into),
            active: true,
        }
    }

    #[tokio::test]
    async fn poll_round_trips_status_changes() {
        let store = store().await;
        let mut poll =
            Poll::new("Next boss?", vec!["Dragon".into(), "Lich".into()], 45).with_campaign("c1");
        store.create_poll(&poll).await.unwrap();

        poll.status = PollStatus::Running;
        poll.started_at = Some(Utc::now());
        store.update_poll(&poll).await.unwrap();

        let loaded = store.get_poll(&poll.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PollStatus::Running);
        assert_eq!(loaded.options, poll.options);
        assert_eq!(store.running_polls("c1").await.unwrap().len(), 1);
        assert!(store.get_poll("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn links_are_unique_per_streamer() {
        let store = store().await;
        let poll = Poll::new("q", vec!["a".into(), "b".into()], 30);
        store.create_poll(&poll).await.unwrap();

        let mut link = ChannelLink::new(
            &poll,
            "s1",
            ChannelMode::Native {
                remote_poll_id: Some("remote-1".into()),
            },
            LinkStatus::Created,
        );
        store.insert_link(&link).await.unwrap();
        let dup = ChannelLink::new(
            &poll,
            "s1",
            ChannelMode::Chat {
                channel_login: "s1".into(),
            },
            LinkStatus::Running,
        );
        assert!(matches!(
            store.insert_link(&dup).await,
            Err(Error::Duplicate { .. })
        ));

        link.absorb_counts(&[5, 2]);
        link.set_status(LinkStatus::Running);
        store.update_link(&link).await.unwrap();
        let links = store.list_links(&poll.id).await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].votes, vec![5, 2]);
        assert_eq!(links[0].remote_poll_id(), Some("remote-1"));
    }

    #[tokio::test]
    async fn credentials_are_sealed_at_rest() {
        let store = store().await;
        store.upsert_streamer(&streamer("s1", Some("partner"))).await.unwrap();
        store
            .save_credential(&StreamerCredential::new("s1", "access-xyz", "refresh-xyz"))
            .await
            .unwrap();

        let raw: String = sqlx::query_scalar("SELECT access_token FROM streamer_credentials")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert!(!raw.contains("access-xyz"));

        let cred = store.get_credential("s1").await.unwrap().unwrap();
        assert_eq!(cred.access_token.expose_secret(), "access-xyz");
        assert!(cred.active);

        store.deactivate_credential("s1").await.unwrap();
        assert!(!store.get_credential("s1").await.unwrap().unwrap().active);
        assert!(store.active_streamers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn authorized_streamers_respect_expiry() {
        let store = store().await;
        let now = Utc::now();
        for id in ["fresh", "stale"] {
            store.upsert_streamer(&streamer(id, None)).await.unwrap();
            store
                .save_credential(&StreamerCredential::new(id, "a", "r"))
                .await
                .unwrap();
            store
                .upsert_membership(&CampaignMembership {
                    campaign_id: "c1".into(),
                    streamer_id: id.into(),
                    status: MembershipStatus::Active,
                    authorization: None,
                })
                .await
                .unwrap();
        }
        store
            .grant_authorization("c1", "fresh", AuthorizationWindow::grant(now, 12))
            .await
            .unwrap();
        store
            .grant_authorization(
                "c1",
                "stale",
                AuthorizationWindow::grant(now - Duration::hours(24), 12),
            )
            .await
            .unwrap();

        let authorized = store.authorized_streamers("c1", now).await.unwrap();
        assert_eq!(authorized.len(), 1);
        assert_eq!(authorized[0].id, "fresh");
        assert!(store.grant_authorization("c1", "nobody", AuthorizationWindow::grant(now, 1)).await.is_err());
        assert_eq!(store.campaign_members("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn results_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("polls.db").display());
        let cipher = Arc::new(TokenCipher::new([9u8; 32]));

        let mut poll = Poll::new("Tea or coffee?", vec!["Tea".into(), "Coffee".into()], 20);
        let mut link = ChannelLink::new(
            &poll,
            "s1",
            ChannelMode::Chat {
                channel_login: "s1".into(),
            },
            LinkStatus::Running,
        );
        link.absorb_counts(&[3, 1]);
        {
            let store = SqlitePollStore::new(&url, Arc::clone(&cipher)).await.unwrap();
            store.create_poll(&poll).await.unwrap();
            store.insert_link(&link).await.unwrap();
            poll.status = PollStatus::Ended;
            poll.ended_at = Some(Utc::now());
            store.update_poll(&poll).await.unwrap();
            let aggregate = crate::Aggregate::from_links(&poll, std::slice::from_ref(&link));
            store
                .save_result(&PollResult::build(&poll, aggregate, &[link], None))
                .await
                .unwrap();
        }

        let store = SqlitePollStore::new(&url, cipher).await.unwrap();
        let result = store.get_result(&poll.id).await.unwrap().unwrap();
        assert_eq!(result.status, PollStatus::Ended);
        assert_eq!(result.total_votes, 4);
        assert_eq!(result.votes_by_option["Tea"], 3);
        assert_eq!(result.winner_index, Some(0));
        assert!(!result.cancelled);
    }
}
