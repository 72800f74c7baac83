use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use herald_core::{
    AuditEvent, AuditHash, AuditPersistence, BiometricAttempt, BiometricEnrollment,
    BiometricRepository, Channel, CodeAttemptOutcome, CodeId, CodeRepository, CodeSubject,
    ComprehensionChallenge, ContentHash, DeliveryLog, DocumentRef, EmployeeDirectory, EmployeeId,
    EmployeeProfile, EngagementEvent, Gate, GateLogEntry, GateOutcome, GateRepository,
    HeraldError, HeraldResult, IntegrityMutation, IntegrityRecord, IntegrityRepository,
    MutationOutcome, Notice, NoticeFilter, NoticeId, NoticeMutation, NoticeRepository,
    OneTimeCode, ProviderMessageId, ReconciliationRun, Timestamp, VerificationQuery,
    WebhookRecord,
};

/// Optimistic writes retry this many times before reporting a conflict.
const MAX_CAS_RETRIES: usize = 5;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS notices (
    id TEXT PRIMARY KEY NOT NULL,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    first_dispatched_at INTEGER,
    has_open INTEGER NOT NULL DEFAULT 0,
    identity_validated_at INTEGER,
    read_confirmed_at INTEGER,
    physical_track TEXT NOT NULL DEFAULT 'not_required',
    version INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS notices_dispatch ON notices (first_dispatched_at, has_open);
CREATE INDEX IF NOT EXISTS notices_read ON notices (state, read_confirmed_at);
CREATE TABLE IF NOT EXISTS message_index (
    channel TEXT NOT NULL,
    message_id TEXT NOT NULL,
    notice_id TEXT NOT NULL,
    PRIMARY KEY (channel, message_id)
);
CREATE TABLE IF NOT EXISTS codes (
    id TEXT PRIMARY KEY NOT NULL,
    subject TEXT NOT NULL,
    issued_at INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    closed INTEGER NOT NULL DEFAULT 0,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS codes_subject ON codes (subject, closed);
CREATE TABLE IF NOT EXISTS gate_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    notice_id TEXT NOT NULL,
    gate TEXT NOT NULL,
    at INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS gate_log_notice ON gate_log (notice_id, gate, at);
CREATE TABLE IF NOT EXISTS challenges (
    notice_id TEXT PRIMARY KEY NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollments (
    employee_id TEXT PRIMARY KEY NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS biometric_attempts (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    notice_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS webhook_records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS engagement_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    notice_id TEXT NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS reconciliation_runs (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS integrity_records (
    doc_key TEXT PRIMARY KEY NOT NULL,
    content_hash TEXT NOT NULL,
    hashed_at INTEGER NOT NULL,
    proof_state TEXT NOT NULL,
    submitted_at INTEGER,
    version INTEGER NOT NULL,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS integrity_hash ON integrity_records (content_hash);
CREATE INDEX IF NOT EXISTS integrity_pending ON integrity_records (proof_state, submitted_at);
CREATE TABLE IF NOT EXISTS verification_queries (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS employees (
    employee_id TEXT PRIMARY KEY NOT NULL,
    body TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    hash TEXT NOT NULL,
    body TEXT NOT NULL
);
";

/// Indexes over columns that older databases only gain through
/// `add_selection_columns`.
const SELECTION_INDEXES: &str = "
CREATE INDEX IF NOT EXISTS notices_subsidiarity
    ON notices (physical_track, has_open, first_dispatched_at);
";

/// Lifecycle states no scheduled job selects.
const TERMINAL_STATES: &str = "('firm', 'impugned')";

/// SQLite store implementing every repository trait.
///
/// One process-owned connection. Milestone writes are optimistic: the row is
/// read, the mutation is evaluated, and the write only lands if the row's
/// version is unchanged (`UPDATE ... WHERE version = ?`).
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> HeraldError {
    HeraldError::Storage(format!("{}: {}", context, e))
}

fn to_json<T: Serialize>(value: &T) -> HeraldResult<String> {
    serde_json::to_string(value).map_err(HeraldError::from)
}

fn from_json<T: DeserializeOwned>(body: &str) -> HeraldResult<T> {
    serde_json::from_str(body).map_err(HeraldError::from)
}

fn secs(ts: &Timestamp) -> i64 {
    ts.seconds_since_epoch as i64
}

fn opt_secs(ts: Option<Timestamp>) -> Option<i64> {
    ts.map(|t| secs(&t))
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &str) -> HeraldResult<Self> {
        let conn = Connection::open(path).map_err(|e| storage_err("failed to open database", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| storage_err("failed to create tables", e))?;
        Self::add_selection_columns(&conn)?;
        conn.execute_batch(SELECTION_INDEXES)
            .map_err(|e| storage_err("failed to create indexes", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> HeraldResult<Self> {
        Self::open(":memory:")
    }

    /// Bring a notices table created without the gatekeeper and physical
    /// track columns up to date, backfilling them from the stored bodies.
    fn add_selection_columns(conn: &Connection) -> HeraldResult<()> {
        let columns: Vec<String> = {
            let mut stmt = conn
                .prepare("PRAGMA table_info(notices)")
                .map_err(|e| storage_err("prepare failed", e))?;
            let rows = stmt
                .query_map(params![], |row| row.get::<_, String>(1))
                .map_err(|e| storage_err("query failed", e))?;
            rows.collect::<Result<_, _>>()
                .map_err(|e| storage_err("row read failed", e))?
        };
        if columns.iter().any(|c| c == "physical_track") {
            return Ok(());
        }

        conn.execute_batch(
            "ALTER TABLE notices ADD COLUMN identity_validated_at INTEGER;
             ALTER TABLE notices ADD COLUMN physical_track TEXT NOT NULL DEFAULT 'not_required';",
        )
        .map_err(|e| storage_err("failed to add notice columns", e))?;
        let notices: Vec<Notice> =
            Self::query_bodies(conn, "SELECT body FROM notices", params![])?;
        for notice in &notices {
            conn.execute(
                "UPDATE notices SET identity_validated_at = ?1, physical_track = ?2 WHERE id = ?3",
                params![
                    opt_secs(notice.identity_validated_at),
                    notice.physical_track.as_str(),
                    notice.id.as_str(),
                ],
            )
            .map_err(|e| storage_err("notice backfill failed", e))?;
        }
        tracing::info!(notices = notices.len(), "added notice selection columns");
        Ok(())
    }

    fn lock(&self) -> HeraldResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| storage_err("lock poisoned", e))
    }

    fn query_bodies<P: rusqlite::Params, T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> HeraldResult<Vec<T>> {
        let mut stmt = conn.prepare(sql).map_err(|e| storage_err("prepare failed", e))?;
        let rows = stmt
            .query_map(params, |row| row.get::<_, String>(0))
            .map_err(|e| storage_err("query failed", e))?;
        let mut out = Vec::new();
        for row in rows {
            let body = row.map_err(|e| storage_err("row read failed", e))?;
            out.push(from_json(&body)?);
        }
        Ok(out)
    }

    fn append_body(conn: &Connection, sql: &str, body: &str) -> HeraldResult<()> {
        conn.execute(sql, params![body])
            .map_err(|e| storage_err("insert failed", e))?;
        Ok(())
    }

    /// Last `limit` rows of an append-only table, oldest first.
    fn tail_bodies<T: DeserializeOwned>(
        conn: &Connection,
        table: &str,
        limit: usize,
    ) -> HeraldResult<Vec<T>> {
        let sql = format!(
            "SELECT body FROM (SELECT seq, body FROM {} ORDER BY seq DESC LIMIT ?1) ORDER BY seq ASC",
            table
        );
        Self::query_bodies(conn, &sql, params![limit as i64])
    }

    fn write_notice(conn: &Connection, notice: &Notice, expected_version: u64) -> HeraldResult<bool> {
        let rows = conn
            .execute(
                "UPDATE notices SET state = ?1, first_dispatched_at = ?2, has_open = ?3,
                     identity_validated_at = ?4, read_confirmed_at = ?5, physical_track = ?6,
                     version = ?7, body = ?8
                 WHERE id = ?9 AND version = ?10",
                params![
                    notice.state.as_str(),
                    opt_secs(notice.first_dispatched_at()),
                    notice.has_open() as i64,
                    opt_secs(notice.identity_validated_at),
                    opt_secs(notice.read_confirmed_at),
                    notice.physical_track.as_str(),
                    notice.version as i64,
                    to_json(notice)?,
                    notice.id.as_str(),
                    expected_version as i64,
                ],
            )
            .map_err(|e| storage_err("notice update failed", e))?;
        Ok(rows == 1)
    }
}

impl NoticeRepository for SqliteStore {
    fn insert_notice(&self, notice: &Notice) -> HeraldResult<()> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO notices
                    (id, state, created_at, first_dispatched_at, has_open, identity_validated_at,
                     read_confirmed_at, physical_track, version, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    notice.id.as_str(),
                    notice.state.as_str(),
                    secs(&notice.created_at),
                    opt_secs(notice.first_dispatched_at()),
                    notice.has_open() as i64,
                    opt_secs(notice.identity_validated_at),
                    opt_secs(notice.read_confirmed_at),
                    notice.physical_track.as_str(),
                    notice.version as i64,
                    to_json(notice)?,
                ],
            )
            .map_err(|e| storage_err("notice insert failed", e))?;
        if rows == 0 {
            return Err(HeraldError::Conflict(format!("notice {} exists", notice.id)));
        }
        for (channel, message_id) in notice.dispatched_channels() {
            conn.execute(
                "INSERT OR IGNORE INTO message_index (channel, message_id, notice_id) VALUES (?1, ?2, ?3)",
                params![channel.as_str(), message_id.as_str(), notice.id.as_str()],
            )
            .map_err(|e| storage_err("message index insert failed", e))?;
        }
        Ok(())
    }

    fn get_notice(&self, id: &NoticeId) -> HeraldResult<Option<Notice>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM notices WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("notice query failed", e))?;
        body.map(|b| from_json(&b)).transpose()
    }

    fn find_by_message(
        &self,
        channel: Channel,
        message_id: &ProviderMessageId,
    ) -> HeraldResult<Option<NoticeId>> {
        let conn = self.lock()?;
        let id: Option<String> = conn
            .query_row(
                "SELECT notice_id FROM message_index WHERE channel = ?1 AND message_id = ?2",
                params![channel.as_str(), message_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("message index query failed", e))?;
        Ok(id.map(NoticeId::new))
    }

    fn apply_mutation(
        &self,
        id: &NoticeId,
        mutation: &NoticeMutation,
    ) -> HeraldResult<MutationOutcome> {
        let conn = self.lock()?;
        for _ in 0..MAX_CAS_RETRIES {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM notices WHERE id = ?1",
                    params![id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("notice query failed", e))?;
            let mut notice: Notice = match body {
                Some(b) => from_json(&b)?,
                None => return Err(HeraldError::NotFound(format!("notice {}", id))),
            };
            let expected_version = notice.version;
            let outcome = notice.apply(mutation);
            if !outcome.is_applied() {
                return Ok(outcome);
            }
            if Self::write_notice(&conn, &notice, expected_version)? {
                if let NoticeMutation::Dispatch {
                    channel,
                    provider_message_id,
                    ..
                } = mutation
                {
                    conn.execute(
                        "INSERT OR IGNORE INTO message_index (channel, message_id, notice_id) VALUES (?1, ?2, ?3)",
                        params![channel.as_str(), provider_message_id.as_str(), id.as_str()],
                    )
                    .map_err(|e| storage_err("message index insert failed", e))?;
                }
                return Ok(outcome);
            }
            tracing::debug!(notice_id = %id, "notice version moved, retrying mutation");
        }
        Err(HeraldError::Conflict(format!("notice {} kept changing", id)))
    }

    fn select_notices(&self, filter: &NoticeFilter, limit: usize) -> HeraldResult<Vec<Notice>> {
        let conn = self.lock()?;
        let limit = limit as i64;
        let selected: Vec<Notice> = match filter {
            NoticeFilter::AwaitingOpen {
                dispatched_before,
                dispatched_after,
            } => Self::query_bodies(
                &conn,
                &format!(
                    "SELECT body FROM notices
                     WHERE has_open = 0 AND first_dispatched_at BETWEEN ?1 AND ?2
                       AND state NOT IN {terminal}
                     ORDER BY created_at, id LIMIT ?3",
                    terminal = TERMINAL_STATES
                ),
                params![secs(dispatched_after), secs(dispatched_before), limit],
            )?,
            NoticeFilter::PastSubsidiarityGrace { dispatched_before } => Self::query_bodies(
                &conn,
                &format!(
                    "SELECT body FROM notices
                     WHERE physical_track = 'not_required' AND has_open = 0
                       AND identity_validated_at IS NULL AND read_confirmed_at IS NULL
                       AND first_dispatched_at <= ?1
                       AND state NOT IN {terminal}
                     ORDER BY created_at, id LIMIT ?2",
                    terminal = TERMINAL_STATES
                ),
                params![secs(dispatched_before), limit],
            )?,
            NoticeFilter::DueForFirmness { read_before } => Self::query_bodies(
                &conn,
                "SELECT body FROM notices
                 WHERE state = 'read_confirmed' AND read_confirmed_at <= ?1
                 ORDER BY created_at, id LIMIT ?2",
                params![secs(read_before), limit],
            )?,
        };
        debug_assert!(selected.iter().all(|n| filter.matches(n)));
        Ok(selected)
    }
}

impl CodeRepository for SqliteStore {
    fn issue_code(&self, code: &OneTimeCode, now: Timestamp) -> HeraldResult<u32> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| storage_err("begin failed", e))?;
        let open: Vec<OneTimeCode> = Self::query_bodies(
            &tx,
            "SELECT body FROM codes WHERE subject = ?1 AND closed = 0",
            params![code.subject.key()],
        )?;
        let mut invalidated = 0;
        for mut existing in open {
            existing.invalidated_at = Some(now);
            tx.execute(
                "UPDATE codes SET closed = 1, body = ?1 WHERE id = ?2",
                params![to_json(&existing)?, existing.id.as_str()],
            )
            .map_err(|e| storage_err("code invalidate failed", e))?;
            invalidated += 1;
        }
        tx.execute(
            "INSERT INTO codes (id, subject, issued_at, attempts, closed, body) VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                code.id.as_str(),
                code.subject.key(),
                secs(&code.issued_at),
                code.attempts as i64,
                to_json(code)?,
            ],
        )
        .map_err(|e| storage_err("code insert failed", e))?;
        tx.commit().map_err(|e| storage_err("commit failed", e))?;
        Ok(invalidated)
    }

    fn live_code(
        &self,
        subject: &CodeSubject,
        now: Timestamp,
    ) -> HeraldResult<Option<OneTimeCode>> {
        let conn = self.lock()?;
        let open: Vec<OneTimeCode> = Self::query_bodies(
            &conn,
            "SELECT body FROM codes WHERE subject = ?1 AND closed = 0 ORDER BY issued_at DESC",
            params![subject.key()],
        )?;
        Ok(open.into_iter().find(|c| c.is_live(&now)))
    }

    fn get_code(&self, id: &CodeId) -> HeraldResult<Option<OneTimeCode>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM codes WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("code query failed", e))?;
        body.map(|b| from_json(&b)).transpose()
    }

    fn record_code_attempt(
        &self,
        id: &CodeId,
        matched: bool,
        now: Timestamp,
    ) -> HeraldResult<CodeAttemptOutcome> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM codes WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("code query failed", e))?;
        let mut code: OneTimeCode = match body {
            Some(b) => from_json(&b)?,
            None => return Err(HeraldError::NotFound(format!("code {}", id))),
        };
        if !code.is_live(&now) || code.is_exhausted() {
            return Ok(CodeAttemptOutcome::Stale);
        }
        let previous_attempts = code.attempts;
        code.attempts += 1;
        if matched {
            code.consumed_at = Some(now);
        }
        let rows = conn
            .execute(
                "UPDATE codes SET attempts = ?1, closed = ?2, body = ?3
                 WHERE id = ?4 AND attempts = ?5 AND closed = 0",
                params![
                    code.attempts as i64,
                    matched as i64,
                    to_json(&code)?,
                    id.as_str(),
                    previous_attempts as i64,
                ],
            )
            .map_err(|e| storage_err("code update failed", e))?;
        if rows == 0 {
            return Ok(CodeAttemptOutcome::Stale);
        }
        if matched {
            Ok(CodeAttemptOutcome::Consumed)
        } else {
            Ok(CodeAttemptOutcome::Counted {
                attempts: code.attempts,
            })
        }
    }
}

impl GateRepository for SqliteStore {
    fn append_gate_log(&self, entry: &GateLogEntry) -> HeraldResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO gate_log (notice_id, gate, at, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.notice_id.as_str(),
                entry.gate.to_string(),
                secs(&entry.at),
                to_json(entry)?,
            ],
        )
        .map_err(|e| storage_err("gate log insert failed", e))?;
        Ok(())
    }

    fn count_gate_outcomes(
        &self,
        notice_id: &NoticeId,
        gate: Gate,
        outcomes: &[GateOutcome],
        since: Timestamp,
    ) -> HeraldResult<u32> {
        let conn = self.lock()?;
        let entries: Vec<GateLogEntry> = Self::query_bodies(
            &conn,
            "SELECT body FROM gate_log WHERE notice_id = ?1 AND gate = ?2 AND at >= ?3",
            params![notice_id.as_str(), gate.to_string(), secs(&since)],
        )?;
        Ok(entries
            .iter()
            .filter(|e| e.at >= since && outcomes.contains(&e.outcome))
            .count() as u32)
    }

    fn gate_log(&self, notice_id: &NoticeId) -> HeraldResult<Vec<GateLogEntry>> {
        let conn = self.lock()?;
        Self::query_bodies(
            &conn,
            "SELECT body FROM gate_log WHERE notice_id = ?1 ORDER BY seq",
            params![notice_id.as_str()],
        )
    }

    fn get_challenge(&self, notice_id: &NoticeId) -> HeraldResult<Option<ComprehensionChallenge>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM challenges WHERE notice_id = ?1",
                params![notice_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("challenge query failed", e))?;
        body.map(|b| from_json(&b)).transpose()
    }

    fn swap_challenge(
        &self,
        expected: Option<&ComprehensionChallenge>,
        next: &ComprehensionChallenge,
    ) -> HeraldResult<bool> {
        let conn = self.lock()?;
        let rows = match expected {
            None => conn
                .execute(
                    "INSERT OR IGNORE INTO challenges (notice_id, body) VALUES (?1, ?2)",
                    params![next.notice_id.as_str(), to_json(next)?],
                )
                .map_err(|e| storage_err("challenge insert failed", e))?,
            Some(previous) => conn
                .execute(
                    "UPDATE challenges SET body = ?1 WHERE notice_id = ?2 AND body = ?3",
                    params![to_json(next)?, next.notice_id.as_str(), to_json(previous)?],
                )
                .map_err(|e| storage_err("challenge update failed", e))?,
        };
        Ok(rows == 1)
    }
}

impl BiometricRepository for SqliteStore {
    fn get_enrollment(
        &self,
        employee_id: &EmployeeId,
    ) -> HeraldResult<Option<BiometricEnrollment>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM enrollments WHERE employee_id = ?1",
                params![employee_id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("enrollment query failed", e))?;
        body.map(|b| from_json(&b)).transpose()
    }

    fn insert_enrollment(&self, enrollment: &BiometricEnrollment) -> HeraldResult<bool> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO enrollments (employee_id, body) VALUES (?1, ?2)",
                params![enrollment.employee_id.as_str(), to_json(enrollment)?],
            )
            .map_err(|e| storage_err("enrollment insert failed", e))?;
        Ok(rows == 1)
    }

    fn append_biometric_attempt(&self, attempt: &BiometricAttempt) -> HeraldResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO biometric_attempts (notice_id, body) VALUES (?1, ?2)",
            params![attempt.notice_id.as_str(), to_json(attempt)?],
        )
        .map_err(|e| storage_err("biometric attempt insert failed", e))?;
        Ok(())
    }

    fn biometric_attempts(&self, notice_id: &NoticeId) -> HeraldResult<Vec<BiometricAttempt>> {
        let conn = self.lock()?;
        Self::query_bodies(
            &conn,
            "SELECT body FROM biometric_attempts WHERE notice_id = ?1 ORDER BY seq",
            params![notice_id.as_str()],
        )
    }
}

impl DeliveryLog for SqliteStore {
    fn append_webhook(&self, record: &WebhookRecord) -> HeraldResult<()> {
        let conn = self.lock()?;
        Self::append_body(
            &conn,
            "INSERT INTO webhook_records (body) VALUES (?1)",
            &to_json(record)?,
        )
    }

    fn webhook_records(&self, limit: usize) -> HeraldResult<Vec<WebhookRecord>> {
        let conn = self.lock()?;
        Self::tail_bodies(&conn, "webhook_records", limit)
    }

    fn append_engagement(&self, event: &EngagementEvent) -> HeraldResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO engagement_events (notice_id, body) VALUES (?1, ?2)",
            params![event.notice_id.as_str(), to_json(event)?],
        )
        .map_err(|e| storage_err("engagement insert failed", e))?;
        Ok(())
    }

    fn engagement_events(&self, notice_id: &NoticeId) -> HeraldResult<Vec<EngagementEvent>> {
        let conn = self.lock()?;
        Self::query_bodies(
            &conn,
            "SELECT body FROM engagement_events WHERE notice_id = ?1 ORDER BY seq",
            params![notice_id.as_str()],
        )
    }

    fn append_reconciliation_run(&self, run: &ReconciliationRun) -> HeraldResult<()> {
        let conn = self.lock()?;
        Self::append_body(
            &conn,
            "INSERT INTO reconciliation_runs (body) VALUES (?1)",
            &to_json(run)?,
        )
    }

    fn reconciliation_runs(&self, limit: usize) -> HeraldResult<Vec<ReconciliationRun>> {
        let conn = self.lock()?;
        Self::tail_bodies(&conn, "reconciliation_runs", limit)
    }
}

impl IntegrityRepository for SqliteStore {
    fn insert_integrity(&self, record: &IntegrityRecord) -> HeraldResult<bool> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO integrity_records
                    (doc_key, content_hash, hashed_at, proof_state, submitted_at, version, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.document.key(),
                    record.content_hash.to_hex(),
                    secs(&record.hashed_at),
                    record.blockchain.state.as_str(),
                    opt_secs(record.blockchain.submitted_at),
                    record.version as i64,
                    to_json(record)?,
                ],
            )
            .map_err(|e| storage_err("integrity insert failed", e))?;
        Ok(rows == 1)
    }

    fn get_integrity(&self, document: &DocumentRef) -> HeraldResult<Option<IntegrityRecord>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM integrity_records WHERE doc_key = ?1",
                params![document.key()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("integrity query failed", e))?;
        body.map(|b| from_json(&b)).transpose()
    }

    fn find_integrity_by_hash(
        &self,
        hash: &ContentHash,
    ) -> HeraldResult<Option<IntegrityRecord>> {
        let conn = self.lock()?;
        let mut found: Vec<IntegrityRecord> = Self::query_bodies(
            &conn,
            "SELECT body FROM integrity_records WHERE content_hash = ?1 ORDER BY hashed_at LIMIT 1",
            params![hash.to_hex()],
        )?;
        Ok(found.pop())
    }

    fn apply_integrity(
        &self,
        document: &DocumentRef,
        mutation: &IntegrityMutation,
    ) -> HeraldResult<MutationOutcome> {
        let conn = self.lock()?;
        let key = document.key();
        for _ in 0..MAX_CAS_RETRIES {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM integrity_records WHERE doc_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| storage_err("integrity query failed", e))?;
            let mut record: IntegrityRecord = match body {
                Some(b) => from_json(&b)?,
                None => {
                    return Err(HeraldError::NotFound(format!(
                        "integrity record {}",
                        document
                    )))
                }
            };
            let expected_version = record.version;
            let outcome = record.apply(mutation);
            if !outcome.is_applied() {
                return Ok(outcome);
            }
            let rows = conn
                .execute(
                    "UPDATE integrity_records SET proof_state = ?1, submitted_at = ?2, version = ?3, body = ?4
                     WHERE doc_key = ?5 AND version = ?6",
                    params![
                        record.blockchain.state.as_str(),
                        opt_secs(record.blockchain.submitted_at),
                        record.version as i64,
                        to_json(&record)?,
                        key,
                        expected_version as i64,
                    ],
                )
                .map_err(|e| storage_err("integrity update failed", e))?;
            if rows == 1 {
                return Ok(outcome);
            }
        }
        Err(HeraldError::Conflict(format!(
            "integrity record {} kept changing",
            document
        )))
    }

    fn pending_proofs(
        &self,
        submitted_before: Timestamp,
        limit: usize,
    ) -> HeraldResult<Vec<IntegrityRecord>> {
        let conn = self.lock()?;
        let pending: Vec<IntegrityRecord> = Self::query_bodies(
            &conn,
            "SELECT body FROM integrity_records
             WHERE proof_state = 'pending' AND submitted_at <= ?1
             ORDER BY submitted_at",
            params![secs(&submitted_before)],
        )?;
        Ok(pending
            .into_iter()
            .filter(|r| {
                r.blockchain
                    .submitted_at
                    .map(|at| at <= submitted_before)
                    .unwrap_or(false)
            })
            .take(limit)
            .collect())
    }

    fn append_verification_query(&self, query: &VerificationQuery) -> HeraldResult<()> {
        let conn = self.lock()?;
        Self::append_body(
            &conn,
            "INSERT INTO verification_queries (body) VALUES (?1)",
            &to_json(query)?,
        )
    }

    fn verification_queries(&self, limit: usize) -> HeraldResult<Vec<VerificationQuery>> {
        let conn = self.lock()?;
        Self::tail_bodies(&conn, "verification_queries", limit)
    }
}

impl EmployeeDirectory for SqliteStore {
    fn employee(&self, id: &EmployeeId) -> HeraldResult<Option<EmployeeProfile>> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM employees WHERE employee_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_err("employee query failed", e))?;
        body.map(|b| from_json(&b)).transpose()
    }

    fn upsert_employee(&self, profile: &EmployeeProfile) -> HeraldResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO employees (employee_id, body) VALUES (?1, ?2)",
            params![profile.employee_id.as_str(), to_json(profile)?],
        )
        .map_err(|e| storage_err("employee upsert failed", e))?;
        Ok(())
    }
}

impl AuditPersistence for SqliteStore {
    fn persist_audit_entry(&self, hash: &AuditHash, event: &AuditEvent) -> HeraldResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_log (hash, body) VALUES (?1, ?2)",
            params![hash.to_string(), to_json(event)?],
        )
        .map_err(|e| storage_err("audit insert failed", e))?;
        Ok(())
    }

    fn load_audit_entries(&self) -> HeraldResult<Vec<(AuditHash, AuditEvent)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT hash, body FROM audit_log ORDER BY seq")
            .map_err(|e| storage_err("prepare failed", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| storage_err("query failed", e))?;
        let mut out = Vec::new();
        for row in rows {
            let (hash_hex, body) = row.map_err(|e| storage_err("row read failed", e))?;
            let bytes = hex::decode(&hash_hex).map_err(|e| storage_err("bad audit hash", e))?;
            let hash: [u8; 32] = bytes
                .try_into()
                .map_err(|_| HeraldError::Storage("audit hash length".into()))?;
            out.push((AuditHash(hash), from_json(&body)?));
        }
        Ok(out)
    }
}
