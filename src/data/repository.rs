use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row, ToSql};

use crate::error::AppError;
use crate::models::classification::{Category, ClassificationResult, Modality};
use crate::models::learning::{EventSource, LearningEvent, LearningStats};
use crate::models::operation::{
    FileFingerprint, HistoryFilter, HistoryPage, Operation, OperationKind, OperationStatus,
    OperationTransition, DEFAULT_HISTORY_LIMIT,
};
use crate::models::staging::{FileState, ScanCandidate, StagingEntry};
use crate::scope_path;

// --- Settings ---

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>, AppError> {
    let value = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
        params![key, value],
    )?;
    Ok(())
}

// --- Operations ---

const OPERATION_COLUMNS: &str = "operation_id, kind, source, destination, status, created_at, updated_at,
     source_fingerprint, destination_fingerprint, reverts, classification";

fn parse_text<T: std::str::FromStr<Err = String>>(idx: usize, value: String) -> rusqlite::Result<T> {
    value.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn parse_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    value: Option<String>,
) -> rusqlite::Result<Option<T>> {
    value
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Result<Option<String>, AppError> {
    Ok(value.map(serde_json::to_string).transpose()?)
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<Operation> {
    Ok(Operation {
        id: row.get(0)?,
        kind: parse_text(1, row.get(1)?)?,
        source: row.get(2)?,
        destination: row.get(3)?,
        status: parse_text(4, row.get(4)?)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        source_fingerprint: parse_json(7, row.get(7)?)?,
        destination_fingerprint: parse_json(8, row.get(8)?)?,
        reverts: row.get(9)?,
        classification: parse_json(10, row.get(10)?)?,
    })
}

fn insert_transition(
    conn: &Connection,
    operation_id: &str,
    from: Option<OperationStatus>,
    to: OperationStatus,
    at: DateTime<Utc>,
    note: Option<&str>,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO operation_transitions (operation_id, from_status, to_status, at, note)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            operation_id,
            from.map(|s| s.to_string()),
            to.to_string(),
            at,
            note
        ],
    )?;
    Ok(())
}

/// Appends a new operation together with its first transition, atomically.
pub fn insert_operation(
    conn: &Connection,
    op: &Operation,
    note: Option<&str>,
) -> Result<(), AppError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO operations (operation_id, kind, source, destination, status, created_at, updated_at,
             source_fingerprint, destination_fingerprint, reverts, classification)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            op.id,
            op.kind.to_string(),
            op.source,
            op.destination,
            op.status.to_string(),
            op.created_at,
            op.updated_at,
            to_json(op.source_fingerprint.as_ref())?,
            to_json(op.destination_fingerprint.as_ref())?,
            op.reverts,
            to_json(op.classification.as_ref())?,
        ],
    )?;
    insert_transition(&tx, &op.id, None, op.status, op.created_at, note)?;
    tx.commit()?;
    Ok(())
}

/// Compare-and-set status change. Returns `false` when the operation was not in
/// `from` (nothing is written in that case).
pub fn transition_operation(
    conn: &Connection,
    operation_id: &str,
    from: OperationStatus,
    to: OperationStatus,
    destination_fingerprint: Option<&FileFingerprint>,
    note: Option<&str>,
) -> Result<bool, AppError> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE operations
         SET status = ?1,
             updated_at = ?2,
             destination_fingerprint = COALESCE(?3, destination_fingerprint)
         WHERE operation_id = ?4 AND status = ?5",
        params![
            to.to_string(),
            now,
            to_json(destination_fingerprint)?,
            operation_id,
            from.to_string()
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    insert_transition(&tx, operation_id, Some(from), to, now, note)?;
    tx.commit()?;
    Ok(true)
}

/// Marks undo record `record_id` APPLIED and the operation it reverts UNDONE, in one
/// transaction. Returns `false` (writing nothing) unless both were in the expected state.
pub fn complete_undo(
    conn: &Connection,
    record_id: &str,
    destination_fingerprint: &FileFingerprint,
    original_id: &str,
    note: Option<&str>,
) -> Result<bool, AppError> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;
    let record_changed = tx.execute(
        "UPDATE operations SET status = ?1, updated_at = ?2, destination_fingerprint = ?3
         WHERE operation_id = ?4 AND status = ?5",
        params![
            OperationStatus::Applied.to_string(),
            now,
            to_json(Some(destination_fingerprint))?,
            record_id,
            OperationStatus::Pending.to_string()
        ],
    )?;
    let original_changed = tx.execute(
        "UPDATE operations SET status = ?1, updated_at = ?2
         WHERE operation_id = ?3 AND status = ?4",
        params![
            OperationStatus::Undone.to_string(),
            now,
            original_id,
            OperationStatus::Applied.to_string()
        ],
    )?;
    if record_changed == 0 || original_changed == 0 {
        return Ok(false);
    }
    insert_transition(
        &tx,
        record_id,
        Some(OperationStatus::Pending),
        OperationStatus::Applied,
        now,
        note,
    )?;
    insert_transition(
        &tx,
        original_id,
        Some(OperationStatus::Applied),
        OperationStatus::Undone,
        now,
        Some(&format!("reverted by {record_id}")),
    )?;
    tx.commit()?;
    Ok(true)
}

pub fn get_operation(conn: &Connection, operation_id: &str) -> Result<Option<Operation>, AppError> {
    let sql = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE operation_id = ?1");
    let op = conn
        .query_row(&sql, params![operation_id], row_to_operation)
        .optional()?;
    Ok(op)
}

pub fn find_pending_for_source(
    conn: &Connection,
    source: &str,
) -> Result<Option<Operation>, AppError> {
    let sql = format!(
        "SELECT {OPERATION_COLUMNS} FROM operations
         WHERE source = ?1 AND status = ?2 ORDER BY seq DESC LIMIT 1"
    );
    let op = conn
        .query_row(
            &sql,
            params![source, OperationStatus::Pending.to_string()],
            row_to_operation,
        )
        .optional()?;
    Ok(op)
}

pub fn list_pending_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Operation>, AppError> {
    let sql = format!(
        "SELECT {OPERATION_COLUMNS} FROM operations
         WHERE status = ?1 AND created_at < ?2 ORDER BY seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
        .query_map(
            params![OperationStatus::Pending.to_string(), cutoff],
            row_to_operation,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ops)
}

/// Applied DELETE operations whose quarantine retention has lapsed.
pub fn list_expired_deletes(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Operation>, AppError> {
    let sql = format!(
        "SELECT {OPERATION_COLUMNS} FROM operations
         WHERE kind = ?1 AND status = ?2 AND updated_at < ?3 ORDER BY seq ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let ops = stmt
        .query_map(
            params![
                OperationKind::Delete.to_string(),
                OperationStatus::Applied.to_string(),
                cutoff
            ],
            row_to_operation,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ops)
}

fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn query_history(conn: &Connection, filter: &HistoryFilter) -> Result<HistoryPage, AppError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(since) = filter.since {
        args.push(Box::new(since));
        clauses.push(format!("created_at >= ?{}", args.len()));
    }
    if let Some(until) = filter.until {
        args.push(Box::new(until));
        clauses.push(format!("created_at < ?{}", args.len()));
    }
    if let Some(status) = filter.status {
        args.push(Box::new(status.to_string()));
        clauses.push(format!("status = ?{}", args.len()));
    }
    if let Some(prefix) = filter.path_prefix.as_deref() {
        let root = scope_path::normalize(prefix);
        let pattern = if root == "/" {
            "/%".to_string()
        } else {
            format!("{}/%", escape_like(&root))
        };
        args.push(Box::new(root));
        let exact = args.len();
        args.push(Box::new(pattern));
        let like = args.len();
        clauses.push(format!(
            "(source = ?{exact} OR source LIKE ?{like} ESCAPE '\\'
              OR destination = ?{exact} OR destination LIKE ?{like} ESCAPE '\\')"
        ));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM operations {where_sql}"),
        params_from_iter(args.iter()),
        |row| row.get(0),
    )?;

    let limit = filter.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    args.push(Box::new(limit as i64));
    let limit_idx = args.len();
    args.push(Box::new(filter.offset as i64));
    let offset_idx = args.len();

    let sql = format!(
        "SELECT {OPERATION_COLUMNS} FROM operations {where_sql}
         ORDER BY seq DESC LIMIT ?{limit_idx} OFFSET ?{offset_idx}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let operations = stmt
        .query_map(params_from_iter(args.iter()), row_to_operation)?
        .collect::<Result<Vec<_>, _>>()?;

    let total = total as usize;
    Ok(HistoryPage {
        has_more: filter.offset + operations.len() < total,
        operations,
        total,
        offset: filter.offset,
    })
}

pub fn list_transitions(
    conn: &Connection,
    operation_id: &str,
) -> Result<Vec<OperationTransition>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT operation_id, from_status, to_status, at, note
         FROM operation_transitions WHERE operation_id = ?1 ORDER BY id ASC",
    )?;
    let transitions = stmt
        .query_map(params![operation_id], |row| {
            let from: Option<String> = row.get(1)?;
            Ok(OperationTransition {
                operation_id: row.get(0)?,
                from_status: from.map(|s| parse_text(1, s)).transpose()?,
                to_status: parse_text(2, row.get(2)?)?,
                at: row.get(3)?,
                note: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(transitions)
}

// --- Learning events ---

pub fn insert_learning_event(conn: &Connection, event: &LearningEvent) -> Result<i64, AppError> {
    conn.execute(
        "INSERT INTO learning_events (file_path, category, modality, confidence, action, overridden, source, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.file_path,
            event.category.as_str(),
            event.modality.to_string(),
            event.confidence,
            event.action.to_string(),
            event.overridden,
            event.source.to_string(),
            event.recorded_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Events with id greater than `after_id`, in log order.
pub fn list_learning_events_after(
    conn: &Connection,
    after_id: i64,
) -> Result<Vec<(i64, LearningEvent)>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT id, file_path, category, modality, confidence, action, overridden, source, recorded_at
         FROM learning_events WHERE id > ?1 ORDER BY id ASC",
    )?;
    let events = stmt
        .query_map(params![after_id], |row| {
            let category: String = row.get(2)?;
            let modality: Modality = parse_text(3, row.get(3)?)?;
            let source: EventSource = parse_text(7, row.get(7)?)?;
            Ok((
                row.get(0)?,
                LearningEvent {
                    file_path: row.get(1)?,
                    category: Category::lenient(&category),
                    modality,
                    confidence: row.get(4)?,
                    action: parse_text(5, row.get(5)?)?,
                    overridden: row.get(6)?,
                    source,
                    recorded_at: row.get(8)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(events)
}

pub fn load_stats_checkpoint(conn: &Connection) -> Result<Option<LearningStats>, AppError> {
    let stats: Option<String> = conn
        .query_row(
            "SELECT stats FROM learning_stats_checkpoint WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(stats.map(|s| serde_json::from_str(&s)).transpose()?)
}

pub fn save_stats_checkpoint(conn: &Connection, stats: &LearningStats) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO learning_stats_checkpoint (id, last_event_id, stats, checkpointed_at)
         VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
             last_event_id = excluded.last_event_id,
             stats = excluded.stats,
             checkpointed_at = excluded.checkpointed_at",
        params![stats.last_event_id, serde_json::to_string(stats)?, Utc::now()],
    )?;
    Ok(())
}

// --- Staging entries ---

const STAGING_COLUMNS: &str = "id, path, first_seen, scan_generation, size_bytes, modified_at, state, result, reasoning, operation_id";

fn row_to_staging(row: &Row<'_>) -> rusqlite::Result<StagingEntry> {
    let generation: i64 = row.get(3)?;
    let size: i64 = row.get(4)?;
    Ok(StagingEntry {
        id: row.get(0)?,
        path: row.get(1)?,
        first_seen: row.get(2)?,
        scan_generation: generation.max(0) as u64,
        size_bytes: size.max(0) as u64,
        modified_at: row.get(5)?,
        state: parse_text(6, row.get(6)?)?,
        result: parse_json::<ClassificationResult>(7, row.get(7)?)?,
        reasoning: row.get(8)?,
        operation_id: row.get(9)?,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum AdmitOutcome {
    /// First sighting of this path.
    Inserted(StagingEntry),
    /// A settled file that was rewritten since it was last handled.
    Readmitted(StagingEntry),
    /// Already in the active staging set.
    AlreadyStaged,
    /// Settled and untouched since.
    Unchanged,
}

/// Adds a scanned candidate to the staging set, deduplicating by path. Runs in one
/// transaction so concurrent scans cannot both insert the same path.
pub fn admit_candidate(
    conn: &Connection,
    candidate: &ScanCandidate,
    initial_state: FileState,
    reasoning: Option<&str>,
) -> Result<AdmitOutcome, AppError> {
    let tx = conn.unchecked_transaction()?;
    let sql = format!("SELECT {STAGING_COLUMNS} FROM staging_entries WHERE path = ?1");
    let existing = tx
        .query_row(&sql, params![candidate.path], row_to_staging)
        .optional()?;
    let now = Utc::now();

    let outcome = match existing {
        None => {
            let entry = StagingEntry {
                id: uuid::Uuid::new_v4().to_string(),
                path: candidate.path.clone(),
                first_seen: now,
                scan_generation: candidate.scan_generation,
                size_bytes: candidate.size_bytes,
                modified_at: candidate.modified_at,
                state: initial_state,
                result: None,
                reasoning: reasoning.map(str::to_string),
                operation_id: None,
            };
            tx.execute(
                "INSERT INTO staging_entries (id, path, first_seen, scan_generation, size_bytes, modified_at, state, reasoning, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.id,
                    entry.path,
                    entry.first_seen,
                    entry.scan_generation as i64,
                    entry.size_bytes as i64,
                    entry.modified_at,
                    entry.state.to_string(),
                    entry.reasoning,
                    now,
                ],
            )?;
            AdmitOutcome::Inserted(entry)
        }
        Some(entry) if !entry.state.is_settled() => AdmitOutcome::AlreadyStaged,
        Some(entry)
            if entry.size_bytes == candidate.size_bytes
                && entry.modified_at == candidate.modified_at =>
        {
            AdmitOutcome::Unchanged
        }
        Some(mut entry) => {
            entry.first_seen = now;
            entry.scan_generation = candidate.scan_generation;
            entry.size_bytes = candidate.size_bytes;
            entry.modified_at = candidate.modified_at;
            entry.state = initial_state;
            entry.result = None;
            entry.reasoning = reasoning.map(str::to_string);
            entry.operation_id = None;
            tx.execute(
                "UPDATE staging_entries
                 SET first_seen = ?1, scan_generation = ?2, size_bytes = ?3, modified_at = ?4,
                     state = ?5, result = NULL, reasoning = ?6, operation_id = NULL, updated_at = ?7
                 WHERE id = ?8",
                params![
                    entry.first_seen,
                    entry.scan_generation as i64,
                    entry.size_bytes as i64,
                    entry.modified_at,
                    entry.state.to_string(),
                    entry.reasoning,
                    now,
                    entry.id,
                ],
            )?;
            AdmitOutcome::Readmitted(entry)
        }
    };
    tx.commit()?;
    Ok(outcome)
}

pub fn get_staging_entry(conn: &Connection, id: &str) -> Result<Option<StagingEntry>, AppError> {
    let sql = format!("SELECT {STAGING_COLUMNS} FROM staging_entries WHERE id = ?1");
    let entry = conn.query_row(&sql, params![id], row_to_staging).optional()?;
    Ok(entry)
}

pub fn list_staging_by_state(
    conn: &Connection,
    state: FileState,
) -> Result<Vec<StagingEntry>, AppError> {
    let sql = format!(
        "SELECT {STAGING_COLUMNS} FROM staging_entries WHERE state = ?1 ORDER BY first_seen ASC, path ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params![state.to_string()], row_to_staging)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Compare-and-set on the pipeline state; `false` means another worker got there first.
pub fn claim_staging_entry(
    conn: &Connection,
    id: &str,
    from: FileState,
    to: FileState,
) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE staging_entries SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
        params![to.to_string(), Utc::now(), id, from.to_string()],
    )?;
    Ok(changed == 1)
}

pub fn update_staging_entry(
    conn: &Connection,
    id: &str,
    state: FileState,
    result: Option<&ClassificationResult>,
    reasoning: Option<&str>,
    operation_id: Option<&str>,
) -> Result<(), AppError> {
    conn.execute(
        "UPDATE staging_entries
         SET state = ?1,
             result = COALESCE(?2, result),
             reasoning = COALESCE(?3, reasoning),
             operation_id = COALESCE(?4, operation_id),
             updated_at = ?5
         WHERE id = ?6",
        params![
            state.to_string(),
            to_json(result)?,
            reasoning,
            operation_id,
            Utc::now(),
            id
        ],
    )?;
    Ok(())
}

pub fn find_staging_by_operation(
    conn: &Connection,
    operation_id: &str,
) -> Result<Option<StagingEntry>, AppError> {
    let sql = format!("SELECT {STAGING_COLUMNS} FROM staging_entries WHERE operation_id = ?1");
    let entry = conn
        .query_row(&sql, params![operation_id], row_to_staging)
        .optional()?;
    Ok(entry)
}

/// Puts entries stuck mid-pipeline since `before` back to DISCOVERED. Returns how
/// many moved.
pub fn reset_interrupted_staging(
    conn: &Connection,
    before: DateTime<Utc>,
) -> Result<usize, AppError> {
    let count = conn.execute(
        "UPDATE staging_entries SET state = ?1, updated_at = ?2
         WHERE state IN (?3, ?4) AND updated_at <= ?5",
        params![
            FileState::Discovered.to_string(),
            Utc::now(),
            FileState::Classifying.to_string(),
            FileState::Decided.to_string(),
            before,
        ],
    )?;
    Ok(count)
}

/// Entries stuck in EXECUTING since `before` go to review; the journal's recovery
/// pass decides what happened on disk.
pub fn park_interrupted_executions(
    conn: &Connection,
    reasoning: &str,
    before: DateTime<Utc>,
) -> Result<usize, AppError> {
    let count = conn.execute(
        "UPDATE staging_entries SET state = ?1, reasoning = ?2, updated_at = ?3
         WHERE state = ?4 AND updated_at <= ?5",
        params![
            FileState::AwaitingUser.to_string(),
            reasoning,
            Utc::now(),
            FileState::Executing.to_string(),
            before,
        ],
    )?;
    Ok(count)
}

// Needed for rusqlite optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
