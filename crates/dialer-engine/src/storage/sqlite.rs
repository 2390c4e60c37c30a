//! Direct SQLite datastore (sqlx)
//!
//! Claims are single `UPDATE … WHERE id IN (SELECT … LIMIT ?) AND <still
//! claimable> RETURNING …` statements, so a row is handed to exactly one
//! claimer even with several engines on the same database. State changes use
//! `UPDATE … WHERE id = ? AND state = ?` as the compare-and-set.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::DialerStore;
use crate::error::{DialerError, Result};
use crate::rate_limit::BucketSnapshot;
use crate::route_health::RouteHealth;
use crate::state_table::CallState;
use crate::types::{
    AttemptEvent, AttemptId, AttemptTransition, CallAttempt, CallerIdNumber, Campaign, CampaignId,
    CampaignLoad, CarrierId, DialerTimer, JobId, Lead, LeadId, OriginationJob, Phase, PhaseTimestamps,
    RouteAssignment, TimerScope, TimerType, Trunk,
};

const ATTEMPT_COLUMNS: &str = "id, correlation_id, campaign_id, lead_id, account_id, destination, state, \
     trunk_id, carrier_id, caller_id, response_codes, final_code, final_reason, amd_result, \
     originate_at, ring_at, answer_at, bridge_at, end_at, created_at, updated_at";

const LEAD_COLUMNS: &str = "id, campaign_id, phone_number, priority, status, reserved_by, reserved_at, created_at";

const JOB_COLUMNS: &str =
    "id, attempt_id, campaign_id, priority, status, claimed_by, claimed_at, error, created_at, updated_at";

const TIMER_COLUMNS: &str = "id, attempt_id, timer_type, fire_at, fired, cancelled, created_at";

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

fn opt_from_ms(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_ms)
}

fn terminal_states_sql() -> String {
    CallState::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn phase_column(phase: Phase) -> &'static str {
    match phase {
        Phase::Originate => "originate_at",
        Phase::Ring => "ring_at",
        Phase::Answer => "answer_at",
        Phase::Bridge => "bridge_at",
        Phase::End => "end_at",
    }
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database and run the embedded migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Opening dialer database: {}", database_url);
        let in_memory = database_url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // An in-memory database lives and dies with its single connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("Dialer database ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Administrative writes. Campaigns, leads, trunks, caller ids and agent
    // presence are owned by other systems; these exist for provisioning
    // and tests.

    pub async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        let work_days = serde_json::to_string(&campaign.work_days)?;
        sqlx::query(
            "INSERT OR REPLACE INTO campaigns
             (id, name, account_id, mode, dial_ratio, max_concurrent_calls, priority, active,
              work_days, work_start, work_end, utc_offset_minutes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(campaign.id.as_str())
        .bind(&campaign.name)
        .bind(&campaign.account_id)
        .bind(campaign.mode.as_str())
        .bind(campaign.dial_ratio)
        .bind(i64::from(campaign.max_concurrent_calls))
        .bind(campaign.priority)
        .bind(campaign.active)
        .bind(work_days)
        .bind(campaign.work_start.map(|t| t.format("%H:%M:%S").to_string()))
        .bind(campaign.work_end.map(|t| t.format("%H:%M:%S").to_string()))
        .bind(campaign.utc_offset_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_lead(&self, lead: &Lead) -> Result<()> {
        sqlx::query(
            "INSERT INTO leads (id, campaign_id, phone_number, priority, status, reserved_by, reserved_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(lead.id.as_str())
        .bind(lead.campaign_id.as_str())
        .bind(&lead.phone_number)
        .bind(lead.priority)
        .bind(lead.status.as_str())
        .bind(&lead.reserved_by)
        .bind(lead.reserved_at.map(to_ms))
        .bind(to_ms(lead.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_trunk(&self, trunk: &Trunk) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO trunks (id, carrier_id, name, cps_limit, priority, active)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(trunk.id.as_str())
        .bind(trunk.carrier_id.as_str())
        .bind(&trunk.name)
        .bind(trunk.cps_limit)
        .bind(trunk.priority)
        .bind(trunk.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_caller_id(&self, number: &CallerIdNumber) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO caller_ids (number, carrier_id, area_prefix, last_used_at, active)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&number.number)
        .bind(number.carrier_id.as_ref().map(|c| c.as_str()))
        .bind(&number.area_prefix)
        .bind(number.last_used_at.map(to_ms))
        .bind(number.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_available_agents(&self, campaign_id: &CampaignId, agents: u32) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_availability (campaign_id, available_agents, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(campaign_id) DO UPDATE SET available_agents = excluded.available_agents,
                                                     updated_at = excluded.updated_at",
        )
        .bind(campaign_id.as_str())
        .bind(i64::from(agents))
        .bind(to_ms(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_lead(&self, lead_id: &LeadId) -> Result<Option<Lead>> {
        let row = sqlx::query(&format!("SELECT {} FROM leads WHERE id = ?", LEAD_COLUMNS))
            .bind(lead_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_lead).transpose()
    }

    pub async fn events_for(&self, attempt_id: &AttemptId) -> Result<Vec<AttemptEvent>> {
        let rows = sqlx::query(
            "SELECT attempt_id, from_state, to_state, event, data, at FROM attempt_events
             WHERE attempt_id = ? ORDER BY id",
        )
        .bind(attempt_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AttemptEvent {
                    attempt_id: AttemptId::from(row.try_get::<String, _>("attempt_id")?),
                    from_state: row.try_get::<String, _>("from_state")?.parse()?,
                    to_state: row.try_get::<String, _>("to_state")?.parse()?,
                    event: row.try_get("event")?,
                    data: serde_json::from_str(&row.try_get::<String, _>("data")?)?,
                    at: from_ms(row.try_get("at")?),
                })
            })
            .collect()
    }
}

fn row_to_campaign(row: &SqliteRow) -> Result<Campaign> {
    let work_days: Vec<Weekday> = serde_json::from_str(&row.try_get::<String, _>("work_days")?)?;
    let parse_time = |col: &str| -> Result<Option<NaiveTime>> {
        row.try_get::<Option<String>, _>(col)?
            .map(|s| {
                NaiveTime::parse_from_str(&s, "%H:%M:%S")
                    .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M"))
                    .map_err(|e| DialerError::storage(format!("bad {} '{}': {}", col, s, e)))
            })
            .transpose()
    };

    Ok(Campaign {
        id: CampaignId::from(row.try_get::<String, _>("id")?),
        name: row.try_get("name")?,
        account_id: row.try_get("account_id")?,
        mode: row.try_get::<String, _>("mode")?.parse()?,
        dial_ratio: row.try_get("dial_ratio")?,
        max_concurrent_calls: u32::try_from(row.try_get::<i64, _>("max_concurrent_calls")?).unwrap_or(0),
        priority: row.try_get("priority")?,
        active: row.try_get("active")?,
        work_days,
        work_start: parse_time("work_start")?,
        work_end: parse_time("work_end")?,
        utc_offset_minutes: row.try_get("utc_offset_minutes")?,
    })
}

fn row_to_lead(row: &SqliteRow) -> Result<Lead> {
    Ok(Lead {
        id: LeadId::from(row.try_get::<String, _>("id")?),
        campaign_id: CampaignId::from(row.try_get::<String, _>("campaign_id")?),
        phone_number: row.try_get("phone_number")?,
        priority: row.try_get("priority")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        reserved_by: row.try_get("reserved_by")?,
        reserved_at: opt_from_ms(row.try_get("reserved_at")?),
        created_at: from_ms(row.try_get("created_at")?),
    })
}

fn row_to_attempt(row: &SqliteRow) -> Result<CallAttempt> {
    let final_code: Option<i64> = row.try_get("final_code")?;
    Ok(CallAttempt {
        id: AttemptId::from(row.try_get::<String, _>("id")?),
        correlation_id: row.try_get("correlation_id")?,
        campaign_id: CampaignId::from(row.try_get::<String, _>("campaign_id")?),
        lead_id: LeadId::from(row.try_get::<String, _>("lead_id")?),
        account_id: row.try_get("account_id")?,
        destination: row.try_get("destination")?,
        state: row.try_get::<String, _>("state")?.parse()?,
        trunk_id: row.try_get::<Option<String>, _>("trunk_id")?.map(Into::into),
        carrier_id: row.try_get::<Option<String>, _>("carrier_id")?.map(Into::into),
        caller_id: row.try_get("caller_id")?,
        response_codes: serde_json::from_str(&row.try_get::<String, _>("response_codes")?)?,
        final_code: final_code.and_then(|c| u16::try_from(c).ok()),
        final_reason: row.try_get("final_reason")?,
        timestamps: PhaseTimestamps {
            originate_at: opt_from_ms(row.try_get("originate_at")?),
            ring_at: opt_from_ms(row.try_get("ring_at")?),
            answer_at: opt_from_ms(row.try_get("answer_at")?),
            bridge_at: opt_from_ms(row.try_get("bridge_at")?),
            end_at: opt_from_ms(row.try_get("end_at")?),
        },
        amd_result: row
            .try_get::<Option<String>, _>("amd_result")?
            .map(|s| s.parse())
            .transpose()?,
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

fn row_to_job(row: &SqliteRow) -> Result<OriginationJob> {
    Ok(OriginationJob {
        id: JobId::from(row.try_get::<String, _>("id")?),
        attempt_id: AttemptId::from(row.try_get::<String, _>("attempt_id")?),
        campaign_id: CampaignId::from(row.try_get::<String, _>("campaign_id")?),
        priority: row.try_get("priority")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: opt_from_ms(row.try_get("claimed_at")?),
        error: row.try_get("error")?,
        created_at: from_ms(row.try_get("created_at")?),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

fn row_to_timer(row: &SqliteRow) -> Result<DialerTimer> {
    Ok(DialerTimer {
        id: row.try_get::<String, _>("id")?.into(),
        attempt_id: AttemptId::from(row.try_get::<String, _>("attempt_id")?),
        timer_type: row.try_get::<String, _>("timer_type")?.parse()?,
        fire_at: from_ms(row.try_get("fire_at")?),
        fired: row.try_get("fired")?,
        cancelled: row.try_get("cancelled")?,
        created_at: from_ms(row.try_get("created_at")?),
    })
}

#[async_trait]
impl DialerStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>> {
        let rows = sqlx::query("SELECT * FROM campaigns WHERE active = 1 ORDER BY priority DESC, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_campaign).collect()
    }

    async fn campaign_load(&self, campaign_id: &CampaignId, since: DateTime<Utc>) -> Result<CampaignLoad> {
        let terminal = terminal_states_sql();

        let available_agents: Option<i64> =
            sqlx::query_scalar("SELECT available_agents FROM agent_availability WHERE campaign_id = ?")
                .bind(campaign_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        let active_calls: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM call_attempts WHERE campaign_id = ? AND state NOT IN ({})",
            terminal
        ))
        .bind(campaign_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS completed,
                    COALESCE(SUM(CASE WHEN answer_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS answered,
                    COALESCE(SUM(CASE WHEN answer_at IS NOT NULL AND state = 'TIMEOUT' THEN 1 ELSE 0 END), 0) AS abandoned
             FROM call_attempts
             WHERE campaign_id = ? AND created_at >= ? AND state IN ({})",
            terminal
        ))
        .bind(campaign_id.as_str())
        .bind(to_ms(since))
        .fetch_one(&self.pool)
        .await?;

        let completed: i64 = row.try_get("completed")?;
        let answered: i64 = row.try_get("answered")?;
        let abandoned: i64 = row.try_get("abandoned")?;

        Ok(CampaignLoad {
            available_agents: u32::try_from(available_agents.unwrap_or(0)).unwrap_or(0),
            active_calls: u32::try_from(active_calls).unwrap_or(u32::MAX),
            abandon_rate: if answered > 0 { abandoned as f64 / answered as f64 } else { 0.0 },
            answer_seizure_ratio: if completed > 0 { answered as f64 / completed as f64 } else { 0.0 },
        })
    }

    async fn reserve_leads(&self, campaign_id: &CampaignId, limit: u32, owner: &str) -> Result<Vec<Lead>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "UPDATE leads SET status = 'reserved', reserved_by = ?, reserved_at = ?
             WHERE id IN (
                 SELECT id FROM leads
                 WHERE campaign_id = ? AND status = 'pending'
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ?
             ) AND status = 'pending'
             RETURNING {}",
            LEAD_COLUMNS
        ))
        .bind(owner)
        .bind(to_ms(Utc::now()))
        .bind(campaign_id.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut leads = rows.iter().map(row_to_lead).collect::<Result<Vec<_>>>()?;
        leads.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!(campaign_id = %campaign_id, reserved = leads.len(), "Reserved leads");
        Ok(leads)
    }

    async fn release_lead(&self, lead_id: &LeadId) -> Result<()> {
        sqlx::query(
            "UPDATE leads SET status = 'pending', reserved_by = NULL, reserved_at = NULL
             WHERE id = ? AND status IN ('reserved', 'dialed')",
        )
        .bind(lead_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_attempt(&self, attempt: &CallAttempt) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO call_attempts ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ATTEMPT_COLUMNS
        ))
        .bind(attempt.id.as_str())
        .bind(&attempt.correlation_id)
        .bind(attempt.campaign_id.as_str())
        .bind(attempt.lead_id.as_str())
        .bind(&attempt.account_id)
        .bind(&attempt.destination)
        .bind(attempt.state.as_str())
        .bind(attempt.trunk_id.as_ref().map(|t| t.as_str()))
        .bind(attempt.carrier_id.as_ref().map(|c| c.as_str()))
        .bind(&attempt.caller_id)
        .bind(serde_json::to_string(&attempt.response_codes)?)
        .bind(attempt.final_code.map(i64::from))
        .bind(&attempt.final_reason)
        .bind(attempt.amd_result.map(|a| a.as_str()))
        .bind(attempt.timestamps.originate_at.map(to_ms))
        .bind(attempt.timestamps.ring_at.map(to_ms))
        .bind(attempt.timestamps.answer_at.map(to_ms))
        .bind(attempt.timestamps.bridge_at.map(to_ms))
        .bind(attempt.timestamps.end_at.map(to_ms))
        .bind(to_ms(attempt.created_at))
        .bind(to_ms(attempt.updated_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE leads SET status = 'dialed' WHERE id = ?")
            .bind(attempt.lead_id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_attempt(&self, attempt_id: &AttemptId) -> Result<Option<CallAttempt>> {
        let row = sqlx::query(&format!("SELECT {} FROM call_attempts WHERE id = ?", ATTEMPT_COLUMNS))
            .bind(attempt_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn find_attempt_by_correlation(&self, correlation_id: &str) -> Result<Option<CallAttempt>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM call_attempts WHERE correlation_id = ?",
            ATTEMPT_COLUMNS
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_attempt).transpose()
    }

    async fn apply_transition(&self, transition: &AttemptTransition) -> Result<bool> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE call_attempts SET state = ");
        builder.push_bind(transition.to.as_str());
        builder.push(", updated_at = ").push_bind(to_ms(transition.at));

        if let Some(phase) = transition.phase {
            let column = phase_column(phase);
            builder
                .push(format!(", {column} = COALESCE({column}, "))
                .push_bind(to_ms(transition.at))
                .push(")");
        }
        if transition.to.is_terminal() {
            if let Some(code) = transition.final_code {
                builder.push(", final_code = ").push_bind(i64::from(code));
            }
            if let Some(reason) = &transition.final_reason {
                builder.push(", final_reason = ").push_bind(reason.clone());
            }
        }
        if let Some(amd) = transition.amd_result {
            builder.push(", amd_result = ").push_bind(amd.as_str());
        }

        builder
            .push(" WHERE id = ")
            .push_bind(transition.attempt_id.as_str())
            .push(" AND state = ")
            .push_bind(transition.from.as_str());

        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM call_attempts WHERE id = ?")
            .bind(transition.attempt_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(DialerError::not_found(format!("attempt {}", transition.attempt_id))),
        }
    }

    async fn assign_route(&self, attempt_id: &AttemptId, route: &RouteAssignment) -> Result<()> {
        let result = sqlx::query(
            "UPDATE call_attempts SET trunk_id = ?, carrier_id = ?, caller_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(route.trunk_id.as_str())
        .bind(route.carrier_id.as_str())
        .bind(&route.caller_id)
        .bind(to_ms(Utc::now()))
        .bind(attempt_id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DialerError::not_found(format!("attempt {}", attempt_id)));
        }
        Ok(())
    }

    async fn append_response_code(&self, attempt_id: &AttemptId, code: u16) -> Result<()> {
        let result = sqlx::query(
            "UPDATE call_attempts SET response_codes = json_insert(response_codes, '$[#]', ?), updated_at = ?
             WHERE id = ?",
        )
        .bind(i64::from(code))
        .bind(to_ms(Utc::now()))
        .bind(attempt_id.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DialerError::not_found(format!("attempt {}", attempt_id)));
        }
        Ok(())
    }

    async fn record_event(&self, event: &AttemptEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO attempt_events (attempt_id, from_state, to_state, event, data, at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.attempt_id.as_str())
        .bind(event.from_state.as_str())
        .bind(event.to_state.as_str())
        .bind(&event.event)
        .bind(serde_json::to_string(&event.data)?)
        .bind(to_ms(event.at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_job(&self, job: &OriginationJob) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO origination_jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            JOB_COLUMNS
        ))
        .bind(job.id.as_str())
        .bind(job.attempt_id.as_str())
        .bind(job.campaign_id.as_str())
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(&job.claimed_by)
        .bind(job.claimed_at.map(to_ms))
        .bind(&job.error)
        .bind(to_ms(job.created_at))
        .bind(to_ms(job.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim_jobs(&self, owner: &str, limit: u32) -> Result<Vec<OriginationJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = to_ms(Utc::now());
        let rows = sqlx::query(&format!(
            "UPDATE origination_jobs SET status = 'processing', claimed_by = ?, claimed_at = ?, updated_at = ?
             WHERE id IN (
                 SELECT id FROM origination_jobs
                 WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT ?
             ) AND status = 'pending'
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(owner)
        .bind(now)
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    async fn complete_job(&self, job_id: &JobId) -> Result<()> {
        update_job(&self.pool, job_id, "status = 'completed'", None).await
    }

    async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<()> {
        update_job(&self.pool, job_id, "status = 'failed', error = ?", Some(error)).await
    }

    async fn requeue_job(&self, job_id: &JobId) -> Result<()> {
        update_job(
            &self.pool,
            job_id,
            "status = 'pending', claimed_by = NULL, claimed_at = NULL",
            None,
        )
        .await
    }

    async fn requeue_stale_jobs(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE origination_jobs SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = ?
             WHERE status = 'processing' AND (claimed_at IS NULL OR claimed_at < ?)",
        )
        .bind(to_ms(Utc::now()))
        .bind(to_ms(claimed_before))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn create_timer(&self, timer: &DialerTimer) -> Result<()> {
        sqlx::query(&format!("INSERT INTO dialer_timers ({}) VALUES (?, ?, ?, ?, ?, ?, ?)", TIMER_COLUMNS))
            .bind(timer.id.as_str())
            .bind(timer.attempt_id.as_str())
            .bind(timer.timer_type.as_str())
            .bind(to_ms(timer.fire_at))
            .bind(timer.fired)
            .bind(timer.cancelled)
            .bind(to_ms(timer.created_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel_timers(&self, attempt_id: &AttemptId, scope: &TimerScope) -> Result<Vec<TimerType>> {
        if scope.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE dialer_timers SET cancelled = 1 WHERE attempt_id = ");
        builder.push_bind(attempt_id.as_str());
        builder.push(" AND fired = 0 AND cancelled = 0");
        if let TimerScope::Types(types) = scope {
            builder.push(" AND timer_type IN (");
            let mut separated = builder.separated(", ");
            for t in types {
                separated.push_bind(t.as_str());
            }
            separated.push_unseparated(")");
        }
        builder.push(" RETURNING timer_type");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut cancelled = rows
            .iter()
            .map(|row| row.try_get::<String, _>("timer_type")?.parse())
            .collect::<Result<Vec<TimerType>>>()?;
        cancelled.sort();
        Ok(cancelled)
    }

    async fn claim_due_timers(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DialerTimer>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "UPDATE dialer_timers SET fired = 1
             WHERE id IN (
                 SELECT id FROM dialer_timers
                 WHERE fired = 0 AND cancelled = 0 AND fire_at <= ?
                 ORDER BY fire_at ASC, id ASC
                 LIMIT ?
             ) AND fired = 0 AND cancelled = 0
             RETURNING {}",
            TIMER_COLUMNS
        ))
        .bind(to_ms(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut timers = rows.iter().map(row_to_timer).collect::<Result<Vec<_>>>()?;
        timers.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        Ok(timers)
    }

    async fn active_trunks(&self) -> Result<Vec<Trunk>> {
        let rows = sqlx::query(
            "SELECT id, carrier_id, name, cps_limit, priority, active FROM trunks
             WHERE active = 1 ORDER BY priority DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Trunk {
                    id: row.try_get::<String, _>("id")?.into(),
                    carrier_id: row.try_get::<String, _>("carrier_id")?.into(),
                    name: row.try_get("name")?,
                    cps_limit: row.try_get("cps_limit")?,
                    priority: row.try_get("priority")?,
                    active: row.try_get("active")?,
                })
            })
            .collect()
    }

    async fn next_caller_id(&self, carrier_id: &CarrierId, destination: &str) -> Result<Option<String>> {
        let number: Option<String> = sqlx::query_scalar(
            "UPDATE caller_ids SET last_used_at = ?
             WHERE number = (
                 SELECT number FROM caller_ids
                 WHERE active = 1 AND (carrier_id IS NULL OR carrier_id = ?)
                 ORDER BY
                     CASE WHEN area_prefix IS NOT NULL AND area_prefix <> ''
                               AND substr(?, 1, length(area_prefix)) = area_prefix
                          THEN 0 ELSE 1 END,
                     last_used_at ASC,
                     number ASC
                 LIMIT 1
             )
             RETURNING number",
        )
        .bind(to_ms(Utc::now()))
        .bind(carrier_id.as_str())
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;
        Ok(number)
    }

    async fn save_bucket_snapshots(&self, snapshots: &[BucketSnapshot]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for snap in snapshots {
            sqlx::query(
                "INSERT INTO bucket_snapshots (trunk_id, tokens, capacity, refill_rate, captured_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(trunk_id) DO UPDATE SET tokens = excluded.tokens, capacity = excluded.capacity,
                     refill_rate = excluded.refill_rate, captured_at = excluded.captured_at",
            )
            .bind(snap.trunk_id.as_str())
            .bind(snap.tokens)
            .bind(snap.capacity)
            .bind(snap.refill_rate)
            .bind(to_ms(snap.captured_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_bucket_snapshots(&self) -> Result<Vec<BucketSnapshot>> {
        let rows = sqlx::query(
            "SELECT trunk_id, tokens, capacity, refill_rate, captured_at FROM bucket_snapshots ORDER BY trunk_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(BucketSnapshot {
                    trunk_id: row.try_get::<String, _>("trunk_id")?.into(),
                    tokens: row.try_get("tokens")?,
                    capacity: row.try_get("capacity")?,
                    refill_rate: row.try_get("refill_rate")?,
                    captured_at: from_ms(row.try_get("captured_at")?),
                })
            })
            .collect()
    }

    async fn save_route_health(&self, snapshots: &[RouteHealth]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for health in snapshots {
            sqlx::query(
                "INSERT INTO route_health (trunk_id, score, degraded, updated_at) VALUES (?, ?, ?, ?)
                 ON CONFLICT(trunk_id) DO UPDATE SET score = excluded.score, degraded = excluded.degraded,
                     updated_at = excluded.updated_at",
            )
            .bind(health.trunk_id.as_str())
            .bind(health.score)
            .bind(health.degraded)
            .bind(to_ms(health.updated_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_route_health(&self) -> Result<Vec<RouteHealth>> {
        let rows = sqlx::query("SELECT trunk_id, score, degraded, updated_at FROM route_health ORDER BY trunk_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(RouteHealth {
                    trunk_id: row.try_get::<String, _>("trunk_id")?.into(),
                    score: row.try_get("score")?,
                    degraded: row.try_get("degraded")?,
                    updated_at: from_ms(row.try_get("updated_at")?),
                })
            })
            .collect()
    }
}

async fn update_job(pool: &SqlitePool, job_id: &JobId, set: &str, error: Option<&str>) -> Result<()> {
    let sql = format!("UPDATE origination_jobs SET {}, updated_at = ? WHERE id = ?", set);
    let mut query = sqlx::query(&sql);
    if let Some(error) = error {
        query = query.bind(error);
    }
    let result = query
        .bind(to_ms(Utc::now()))
        .bind(job_id.as_str())
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DialerError::not_found(format!("job {}", job_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DialerMode, JobStatus, LeadStatus};

    async fn store_with_campaign(leads: usize) -> (SqliteStore, Campaign) {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut campaign = Campaign::new("autumn", DialerMode::Progressive);
        campaign.work_days = vec![Weekday::Mon, Weekday::Tue];
        campaign.work_start = NaiveTime::from_hms_opt(9, 0, 0);
        campaign.work_end = NaiveTime::from_hms_opt(17, 30, 0);
        store.insert_campaign(&campaign).await.unwrap();
        for i in 0..leads {
            let mut lead = Lead::new(campaign.id.clone(), format!("+1555100{:04}", i));
            lead.priority = (i % 3) as i32;
            store.insert_lead(&lead).await.unwrap();
        }
        (store, campaign)
    }

    #[tokio::test]
    async fn test_campaign_round_trip() {
        let (store, campaign) = store_with_campaign(0).await;
        let active = store.active_campaigns().await.unwrap();
        assert_eq!(active, vec![campaign]);
    }

    #[tokio::test]
    async fn test_reserve_respects_priority_and_limit() {
        let (store, campaign) = store_with_campaign(9).await;
        let leads = store.reserve_leads(&campaign.id, 3, "engine-a").await.unwrap();
        assert_eq!(leads.len(), 3);
        assert!(leads.iter().all(|l| l.priority == 2 && l.status == LeadStatus::Reserved));

        let rest = store.reserve_leads(&campaign.id, 100, "engine-b").await.unwrap();
        assert_eq!(rest.len(), 6);
        assert!(store.reserve_leads(&campaign.id, 100, "engine-c").await.unwrap().is_empty());

        store.release_lead(&leads[0].id).await.unwrap();
        let again = store.reserve_leads(&campaign.id, 100, "engine-c").await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, leads[0].id);
    }

    #[tokio::test]
    async fn test_transition_cas_and_phase_stamps() {
        let (store, campaign) = store_with_campaign(1).await;
        let lead = store.reserve_leads(&campaign.id, 1, "me").await.unwrap().remove(0);
        let attempt = CallAttempt::queued(&campaign, &lead);
        store.create_attempt(&attempt).await.unwrap();
        assert_eq!(store.get_lead(&lead.id).await.unwrap().unwrap().status, LeadStatus::Dialed);

        let at = Utc::now();
        let t = AttemptTransition {
            attempt_id: attempt.id.clone(),
            from: CallState::Queued,
            to: CallState::Failed,
            phase: Some(Phase::End),
            at,
            final_code: Some(503),
            final_reason: Some("service unavailable".to_string()),
            amd_result: None,
        };
        assert!(store.apply_transition(&t).await.unwrap());
        assert!(!store.apply_transition(&t).await.unwrap());

        let stored = store.get_attempt(&attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.state, CallState::Failed);
        assert_eq!(stored.final_code, Some(503));
        assert_eq!(stored.timestamps.end_at.map(|t| t.timestamp_millis()), Some(at.timestamp_millis()));

        store.append_response_code(&attempt.id, 100).await.unwrap();
        store.append_response_code(&attempt.id, 503).await.unwrap();
        let stored = store.find_attempt_by_correlation(&attempt.correlation_id).await.unwrap().unwrap();
        assert_eq!(stored.response_codes, vec![100, 503]);

        let missing = AttemptTransition { attempt_id: AttemptId::new(), ..t };
        assert!(store.apply_transition(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = SqliteStore::in_memory().await.unwrap();
        let job = OriginationJob::new(AttemptId::new(), CampaignId::new(), 3);
        store.enqueue_job(&job).await.unwrap();

        let claimed = store.claim_jobs("engine-a", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, JobStatus::Processing);
        assert_eq!(claimed[0].claimed_by.as_deref(), Some("engine-a"));
        assert!(store.claim_jobs("engine-b", 10).await.unwrap().is_empty());

        store.requeue_job(&job.id).await.unwrap();
        let reclaimed = store.claim_jobs("engine-b", 10).await.unwrap();
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("engine-b"));

        store.fail_job(&job.id, "503 from carrier").await.unwrap();
        assert!(store.complete_job(&JobId::new()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_timers_cancel_and_claim() {
        let store = SqliteStore::in_memory().await.unwrap();
        let attempt = AttemptId::new();
        for t in [TimerType::RingTimeout, TimerType::RtpWatchdog, TimerType::QueueTimeout] {
            store
                .create_timer(&DialerTimer::new(attempt.clone(), t, Duration::ZERO))
                .await
                .unwrap();
        }

        let cancelled = store
            .cancel_timers(&attempt, &TimerScope::Types(vec![TimerType::QueueTimeout]))
            .await
            .unwrap();
        assert_eq!(cancelled, vec![TimerType::QueueTimeout]);

        let later = Utc::now() + chrono::Duration::seconds(1);
        let due = store.claim_due_timers(later, 1).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].fired);

        let cancelled = store.cancel_timers(&attempt, &TimerScope::All).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert!(store.claim_due_timers(later, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_caller_id_rotation() {
        let store = SqliteStore::in_memory().await.unwrap();
        let carrier = CarrierId::from("carrier-a");
        let mut local = CallerIdNumber::new("+12125550100");
        local.area_prefix = Some("+1212".to_string());
        store.insert_caller_id(&local).await.unwrap();
        store.insert_caller_id(&CallerIdNumber::new("+15550000001")).await.unwrap();
        store.insert_caller_id(&CallerIdNumber::new("+15550000002")).await.unwrap();

        let first = store.next_caller_id(&carrier, "+12125559999").await.unwrap();
        assert_eq!(first.as_deref(), Some("+12125550100"));

        // non-local destination rotates through the never-used numbers first
        let a = store.next_caller_id(&carrier, "+13105550000").await.unwrap().unwrap();
        let b = store.next_caller_id(&carrier, "+13105550000").await.unwrap().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, "+12125550100");
        assert_ne!(b, "+12125550100");
    }

    #[tokio::test]
    async fn test_snapshots_upsert() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut snap = BucketSnapshot {
            trunk_id: "trunk-a".into(),
            tokens: 2.5,
            capacity: 10.0,
            refill_rate: 10.0,
            captured_at: Utc::now(),
        };
        store.save_bucket_snapshots(&[snap.clone()]).await.unwrap();
        snap.tokens = 7.0;
        store.save_bucket_snapshots(&[snap.clone()]).await.unwrap();
        let loaded = store.load_bucket_snapshots().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].tokens, 7.0);

        let mut health = RouteHealth::healthy("trunk-a".into());
        health.score = 42.0;
        health.degraded = true;
        store.save_route_health(&[health]).await.unwrap();
        let loaded = store.load_route_health().await.unwrap();
        assert!(loaded[0].degraded);
        assert_eq!(loaded[0].score, 42.0);
    }
}
