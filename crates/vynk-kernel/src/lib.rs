use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;
use vynk_protocol::{
    CommandResult, GeoData, GuildConfig, GuildStats, LogRecord, LogStatus, SessionStatus,
    Snowflake, VerificationLogEntry, VerificationMethod, VerificationSession,
};

const DB_FILE: &str = "vynk.sqlite";

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy: Duration,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_err(
    idx: usize,
    ty: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn snowflake_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Snowflake> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, Type::Text, e))
}

fn opt_snowflake_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Snowflake>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) if !raw.is_empty() => raw
            .parse()
            .map(Some)
            .map_err(|e| conversion_err(idx, Type::Text, e)),
        _ => Ok(None),
    }
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, Type::Text, e))
}

fn opt_ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => ts_at(row, idx).map(Some),
        None => Ok(None),
    }
}

fn parsed_at<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| conversion_err(idx, Type::Text, std::io::Error::other(e)))
}

fn json_at<T: serde::de::DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| conversion_err(idx, Type::Text, e)),
        None => Ok(None),
    }
}

const SESSION_COLUMNS: &str = "session_id,discord_user_id,discord_guild_id,status,ip_address,\
     geolocation_data,created_at,completed_at,grant_result,grant_recorded_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<VerificationSession> {
    Ok(VerificationSession {
        session_id: row.get(0)?,
        discord_user_id: snowflake_at(row, 1)?,
        discord_guild_id: snowflake_at(row, 2)?,
        status: parsed_at(row, 3)?,
        ip_address: row.get(4)?,
        geolocation_data: json_at(row, 5)?,
        created_at: ts_at(row, 6)?,
        completed_at: opt_ts_at(row, 7)?,
        grant_result: json_at(row, 8)?,
        grant_recorded_at: opt_ts_at(row, 9)?,
    })
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join(DB_FILE);
        // Busy timeout (default 5000ms; override with VYNK_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("VYNK_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let kernel = Self {
            db_path,
            busy: Duration::from_millis(busy_ms),
        };
        let conn = kernel.conn()?;
        // WAL persists in the file header; synchronous is per connection (see conn()).
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS guild_configs (
              guild_id TEXT PRIMARY KEY,
              verification_channel_id TEXT NOT NULL,
              verified_role_id TEXT NOT NULL,
              log_channel_id TEXT,
              method TEXT NOT NULL DEFAULT 'button',
              updated TEXT NOT NULL
            );

            -- Append-only audit trail of applied grants
            CREATE TABLE IF NOT EXISTS verification_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              guild_id TEXT NOT NULL,
              user_id TEXT NOT NULL,
              user_name TEXT NOT NULL,
              method TEXT NOT NULL,
              status TEXT NOT NULL,     -- success | failed
              timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_vlogs_guild_time ON verification_logs(guild_id, timestamp);

            CREATE TABLE IF NOT EXISTS verification_sessions (
              session_id TEXT PRIMARY KEY,
              discord_user_id TEXT NOT NULL,
              discord_guild_id TEXT NOT NULL,
              status TEXT NOT NULL,     -- pending | completed
              ip_address TEXT NOT NULL,
              geolocation_data TEXT,    -- JSON GeoData
              created_at TEXT NOT NULL,
              completed_at TEXT,
              grant_result TEXT,        -- JSON CommandResult
              grant_recorded_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_grant ON verification_sessions(status, grant_recorded_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(self.busy)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------- Guild configuration ----------------

    pub fn put_guild_config(&self, cfg: &GuildConfig) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO guild_configs(guild_id,verification_channel_id,verified_role_id,log_channel_id,method,updated) VALUES(?,?,?,?,?,?)",
            params![
                cfg.guild_id.to_string(),
                cfg.verification_channel_id.to_string(),
                cfg.verified_role_id.to_string(),
                cfg.log_channel_id.map(|c| c.to_string()),
                cfg.method.as_str(),
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_guild_config(&self, guild_id: Snowflake) -> Result<Option<GuildConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT guild_id,verification_channel_id,verified_role_id,log_channel_id,method FROM guild_configs WHERE guild_id=? LIMIT 1",
        )?;
        let cfg = stmt
            .query_row([guild_id.to_string()], |row| {
                Ok(GuildConfig {
                    guild_id: snowflake_at(row, 0)?,
                    verification_channel_id: snowflake_at(row, 1)?,
                    verified_role_id: snowflake_at(row, 2)?,
                    log_channel_id: opt_snowflake_at(row, 3)?,
                    method: parsed_at::<VerificationMethod>(row, 4)?,
                })
            })
            .optional()?;
        Ok(cfg)
    }

    // ---------------- Verification log ----------------

    pub fn append_verification_log(&self, rec: &LogRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO verification_logs(guild_id,user_id,user_name,method,status,timestamp) VALUES (?,?,?,?,?,?)",
            params![
                rec.guild_id.to_string(),
                rec.user_id.to_string(),
                rec.user_name,
                rec.method.as_str(),
                rec.status.as_str(),
                now_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest entries first.
    pub fn recent_verifications(
        &self,
        guild_id: Snowflake,
        limit: i64,
    ) -> Result<Vec<VerificationLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,guild_id,user_id,user_name,method,status,timestamp FROM verification_logs WHERE guild_id=? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![guild_id.to_string(), limit], |row| {
            Ok(VerificationLogEntry {
                id: row.get(0)?,
                guild_id: snowflake_at(row, 1)?,
                user_id: snowflake_at(row, 2)?,
                user_name: row.get(3)?,
                method: parsed_at(row, 4)?,
                status: parsed_at(row, 5)?,
                timestamp: ts_at(row, 6)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Count of log entries for a guild, optionally narrowed to one user.
    pub fn count_verification_logs(
        &self,
        guild_id: Snowflake,
        user_id: Option<Snowflake>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = match user_id {
            Some(u) => conn.query_row(
                "SELECT COUNT(1) FROM verification_logs WHERE guild_id=? AND user_id=?",
                params![guild_id.to_string(), u.to_string()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(1) FROM verification_logs WHERE guild_id=?",
                params![guild_id.to_string()],
                |row| row.get(0),
            )?,
        };
        Ok(n)
    }

    pub fn get_session_stats(&self, guild_id: Snowflake) -> Result<GuildStats> {
        let conn = self.conn()?;
        let since = fmt_ts(Utc::now() - ChronoDuration::hours(24));
        let (total, success, failed, recent): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(1),
                    COALESCE(SUM(CASE WHEN status=? THEN 1 ELSE 0 END),0),
                    COALESCE(SUM(CASE WHEN status=? THEN 1 ELSE 0 END),0),
                    COALESCE(SUM(CASE WHEN timestamp>=? THEN 1 ELSE 0 END),0)
             FROM verification_logs WHERE guild_id=?",
            params![
                LogStatus::Success.as_str(),
                LogStatus::Failed.as_str(),
                since,
                guild_id.to_string()
            ],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok(GuildStats {
            total: total.max(0) as u64,
            success: success.max(0) as u64,
            failed: failed.max(0) as u64,
            recent_24h: recent.max(0) as u64,
        })
    }

    // ---------------- Verification sessions ----------------

    pub fn create_session(
        &self,
        user_id: Snowflake,
        guild_id: Snowflake,
        ip_address: &str,
        geo: Option<&GeoData>,
    ) -> Result<VerificationSession> {
        let conn = self.conn()?;
        let session_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let geo_s = geo.map(serde_json::to_string).transpose()?;
        conn.execute(
            "INSERT INTO verification_sessions(session_id,discord_user_id,discord_guild_id,status,ip_address,geolocation_data,created_at) VALUES(?,?,?,?,?,?,?)",
            params![
                session_id,
                user_id.to_string(),
                guild_id.to_string(),
                SessionStatus::Pending.as_str(),
                ip_address,
                geo_s,
                fmt_ts(created_at),
            ],
        )?;
        Ok(VerificationSession {
            session_id,
            discord_user_id: user_id,
            discord_guild_id: guild_id,
            status: SessionStatus::Pending,
            ip_address: ip_address.to_string(),
            geolocation_data: geo.cloned(),
            created_at,
            completed_at: None,
            grant_result: None,
            grant_recorded_at: None,
        })
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<VerificationSession>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {SESSION_COLUMNS} FROM verification_sessions WHERE session_id=? LIMIT 1");
        let mut stmt = conn.prepare(&sql)?;
        Ok(stmt.query_row([session_id], session_from_row).optional()?)
    }

    /// Applies a status transition and optional enrichment to a pending session.
    ///
    /// Only rows still `pending` are touched, so the return value is `true` exactly once
    /// per session for the move to `completed`.
    pub fn update_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        geo: Option<&GeoData>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let geo_s = geo.map(serde_json::to_string).transpose()?;
        let n = match status {
            SessionStatus::Completed => conn.execute(
                "UPDATE verification_sessions SET status=?, completed_at=?, geolocation_data=COALESCE(?,geolocation_data) WHERE session_id=? AND status=?",
                params![
                    SessionStatus::Completed.as_str(),
                    now_rfc3339(),
                    geo_s,
                    session_id,
                    SessionStatus::Pending.as_str()
                ],
            )?,
            SessionStatus::Pending => conn.execute(
                "UPDATE verification_sessions SET geolocation_data=COALESCE(?,geolocation_data) WHERE session_id=? AND status=?",
                params![geo_s, session_id, SessionStatus::Pending.as_str()],
            )?,
        };
        Ok(n == 1)
    }

    /// Stores the grant outcome for a completed session; the first recorded result wins.
    pub fn record_session_grant(&self, session_id: &str, result: &CommandResult) -> Result<bool> {
        let conn = self.conn()?;
        let res_s = serde_json::to_string(result)?;
        let n = conn.execute(
            "UPDATE verification_sessions SET grant_result=?, grant_recorded_at=? WHERE session_id=? AND status=? AND grant_result IS NULL",
            params![
                res_s,
                now_rfc3339(),
                session_id,
                SessionStatus::Completed.as_str()
            ],
        )?;
        Ok(n == 1)
    }

    /// Completed sessions with no recorded grant, oldest completion first.
    pub fn sessions_awaiting_grant(&self, limit: i64) -> Result<Vec<VerificationSession>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM verification_sessions WHERE status=? AND grant_result IS NULL ORDER BY completed_at ASC LIMIT ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![SessionStatus::Completed.as_str(), limit],
            session_from_row,
        )?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    pub async fn put_guild_config_async(&self, cfg: &GuildConfig) -> Result<()> {
        let k = self.clone();
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || k.put_guild_config(&cfg))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_guild_config_async(&self, guild_id: Snowflake) -> Result<Option<GuildConfig>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.get_guild_config(guild_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn append_verification_log_async(&self, rec: &LogRecord) -> Result<i64> {
        let k = self.clone();
        let rec = rec.clone();
        tokio::task::spawn_blocking(move || k.append_verification_log(&rec))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn recent_verifications_async(
        &self,
        guild_id: Snowflake,
        limit: i64,
    ) -> Result<Vec<VerificationLogEntry>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.recent_verifications(guild_id, limit))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn count_verification_logs_async(
        &self,
        guild_id: Snowflake,
        user_id: Option<Snowflake>,
    ) -> Result<i64> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.count_verification_logs(guild_id, user_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_session_stats_async(&self, guild_id: Snowflake) -> Result<GuildStats> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.get_session_stats(guild_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn create_session_async(
        &self,
        user_id: Snowflake,
        guild_id: Snowflake,
        ip_address: &str,
        geo: Option<&GeoData>,
    ) -> Result<VerificationSession> {
        let k = self.clone();
        let ip = ip_address.to_string();
        let geo = geo.cloned();
        tokio::task::spawn_blocking(move || k.create_session(user_id, guild_id, &ip, geo.as_ref()))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_session_async(&self, session_id: &str) -> Result<Option<VerificationSession>> {
        let k = self.clone();
        let s = session_id.to_string();
        tokio::task::spawn_blocking(move || k.get_session(&s))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn update_session_async(
        &self,
        session_id: &str,
        status: SessionStatus,
        geo: Option<&GeoData>,
    ) -> Result<bool> {
        let k = self.clone();
        let s = session_id.to_string();
        let geo = geo.cloned();
        tokio::task::spawn_blocking(move || k.update_session(&s, status, geo.as_ref()))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn record_session_grant_async(
        &self,
        session_id: &str,
        result: &CommandResult,
    ) -> Result<bool> {
        let k = self.clone();
        let s = session_id.to_string();
        let result = result.clone();
        tokio::task::spawn_blocking(move || k.record_session_grant(&s, &result))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn sessions_awaiting_grant_async(
        &self,
        limit: i64,
    ) -> Result<Vec<VerificationSession>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.sessions_awaiting_grant(limit))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}
