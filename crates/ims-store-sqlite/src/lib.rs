#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite persistence for the IMS registry. One `SqliteImsStore` wraps one
//! connection; every multi-statement operation runs in a single transaction.
//! History tables are append-only and enforced by triggers.

use std::path::Path;

use anyhow::Context;
use ims_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AnalystStats, AnalystWorkload, AssignmentEntry,
    CcdId, CreateImsInput, CreateMergeInput, CreateTagInput, CreateUserInput, DashboardOverview,
    DashboardStats, DashboardTimeline, DashboardTrends, HistoryAction, HistoryEntry, Ims, ImsError,
    ImsFilter, ImsId, ImsStatus, ImsSummary, Merge, MergeId, MergeItemSummary, Page, Priority,
    PriorityCount, Role, StatusCount, Tag, TagId, TagUsage, TimelinePoint, TrendWindow,
    UpdateImsInput, UpdateTagInput, User, UserId, UserSummary, DEFAULT_TAG_COLOR,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use time::{Duration, OffsetDateTime};

const MIGRATION_VERSION: i64 = 1;

// Trend comparisons use a fixed 30-day window rather than calendar months.
const TREND_WINDOW_DAYS: i64 = 30;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  email TEXT NOT NULL UNIQUE,
  full_name TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('admin', 'analyst', 'viewer')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tags (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  color TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ims (
  id TEXT PRIMARY KEY,
  ccd_num INTEGER NOT NULL UNIQUE CHECK (ccd_num >= 1),
  report_name TEXT NOT NULL,
  description TEXT NOT NULL,
  date TEXT,
  link_opencti TEXT,
  link_docintel TEXT,
  comments TEXT,
  status TEXT NOT NULL CHECK (
    status IN ('draft', 'in_progress', 'completed', 'merged', 'archived')
  ),
  priority TEXT NOT NULL CHECK (priority IN ('urgent', 'high', 'medium', 'low')),
  analyst_id TEXT REFERENCES users(id),
  created_by TEXT NOT NULL REFERENCES users(id),
  deleted_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ims_status ON ims(status);
CREATE INDEX IF NOT EXISTS idx_ims_analyst ON ims(analyst_id);
CREATE INDEX IF NOT EXISTS idx_ims_deleted ON ims(deleted_at);

CREATE TABLE IF NOT EXISTS ims_tags (
  ims_id TEXT NOT NULL REFERENCES ims(id) ON DELETE CASCADE,
  tag_id TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
  PRIMARY KEY (ims_id, tag_id)
);

CREATE TABLE IF NOT EXISTS ims_history (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ims_id TEXT NOT NULL REFERENCES ims(id),
  action TEXT NOT NULL CHECK (
    action IN ('created', 'updated', 'deleted', 'restored', 'merged', 'unmerged')
  ),
  changes_json TEXT NOT NULL DEFAULT '{}',
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_ims_history_no_update
BEFORE UPDATE ON ims_history
BEGIN
  SELECT RAISE(FAIL, 'ims_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ims_history_no_delete
BEFORE DELETE ON ims_history
BEGIN
  SELECT RAISE(FAIL, 'ims_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ims_history_ims_seq ON ims_history(ims_id, entry_seq);

CREATE TABLE IF NOT EXISTS assignment_history (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ims_id TEXT NOT NULL REFERENCES ims(id),
  analyst_id TEXT NOT NULL REFERENCES users(id),
  assigned_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_assignment_history_no_update
BEFORE UPDATE ON assignment_history
BEGIN
  SELECT RAISE(FAIL, 'assignment_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_assignment_history_no_delete
BEFORE DELETE ON assignment_history
BEGIN
  SELECT RAISE(FAIL, 'assignment_history is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_assignment_history_ims_seq
  ON assignment_history(ims_id, entry_seq);

CREATE TABLE IF NOT EXISTS merges (
  id TEXT PRIMARY KEY,
  merge_name TEXT NOT NULL,
  description TEXT,
  reason TEXT,
  created_by TEXT NOT NULL REFERENCES users(id),
  merged_at TEXT NOT NULL,
  unmerged_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_merges_active ON merges(unmerged_at);

CREATE TABLE IF NOT EXISTS merge_items (
  merge_id TEXT NOT NULL REFERENCES merges(id) ON DELETE CASCADE,
  ims_id TEXT NOT NULL REFERENCES ims(id),
  PRIMARY KEY (merge_id, ims_id)
);

CREATE INDEX IF NOT EXISTS idx_merge_items_ims ON merge_items(ims_id);

CREATE TABLE IF NOT EXISTS ccd_sequence (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  next_value INTEGER NOT NULL CHECK (next_value >= 1)
);
";

pub struct SqliteImsStore {
    conn: Connection,
}

impl SqliteImsStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply registry schema")?;

        let now =
            format_rfc3339(now_utc()).map_err(|err| anyhow::anyhow!("{err}"))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MIGRATION_VERSION, now],
            )
            .context("failed to register schema migration")?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO ccd_sequence(id, next_value) VALUES (1, 1)",
                [],
            )
            .context("failed to seed ccd sequence")?;

        tracing::info!(version = MIGRATION_VERSION, "registry schema ready");
        Ok(())
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ---- IMS lifecycle ----

    pub fn create_ims(&mut self, input: &CreateImsInput, actor: UserId) -> Result<Ims, ImsError> {
        input.validate()?;

        let now_text = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage("failed to start create transaction", err))?;

        require_user(&tx, actor, "creator")?;
        if let Some(analyst) = input.analyst_id {
            require_user(&tx, analyst, "analyst")?;
        }
        if let Some(tag_ids) = &input.tag_ids {
            ensure_tags_exist(&tx, tag_ids)?;
        }

        let ccd = claim_ccd(&tx, input.ccd_id)?;
        let id = ImsId::generate();
        let status = input.status.unwrap_or(ImsStatus::Draft);
        let priority = input.priority.unwrap_or(Priority::Medium);
        let date_text = match input.date {
            Some(value) => Some(format_rfc3339(value)?),
            None => None,
        };

        tx.execute(
            "INSERT INTO ims(
               id, ccd_num, report_name, description, date,
               link_opencti, link_docintel, comments, status, priority,
               analyst_id, created_by, deleted_at, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?14)",
            params![
                id.to_string(),
                ccd_num_i64(ccd)?,
                input.report_name,
                input.description,
                date_text,
                input.link_opencti,
                input.link_docintel,
                input.comments,
                status.as_str(),
                priority.as_str(),
                input.analyst_id.map(|value| value.to_string()),
                actor.to_string(),
                now_text,
                now_text,
            ],
        )
        .map_err(|err| {
            conflict_or_storage(
                "failed to insert ims record",
                format!("ccd id {ccd} is already taken"),
                err,
            )
        })?;

        if let Some(tag_ids) = &input.tag_ids {
            replace_tag_links(&tx, id, tag_ids)?;
        }

        let mut changes =
            serde_json::to_value(input).map_err(|err| ImsError::Storage(err.to_string()))?;
        if let Value::Object(map) = &mut changes {
            map.remove("tag_ids");
            map.insert("ccd_id".to_string(), Value::String(ccd.to_string()));
        }
        append_history(&tx, id, HistoryAction::Created, &changes, &now_text)?;

        if let Some(analyst) = input.analyst_id {
            append_assignment(&tx, id, analyst, &now_text)?;
        }

        let record = require_ims(&tx, id, false)?;
        tx.commit()
            .map_err(|err| storage("failed to commit create transaction", err))?;

        tracing::debug!(ims = %id, ccd = %ccd, "created ims record");
        Ok(record)
    }

    pub fn update_ims(&mut self, id: ImsId, input: &UpdateImsInput) -> Result<Ims, ImsError> {
        input.validate()?;

        let now_text = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage("failed to start update transaction", err))?;

        let current = read_ims_row(&tx, id, false)?.ok_or_else(|| not_found_ims(id))?;

        // Assignment history is captured before the row changes, so the log
        // reflects the moment of reassignment.
        if let Some(analyst) = input.analyst_id {
            require_user(&tx, analyst, "analyst")?;
            if current.analyst_id != Some(analyst) {
                append_assignment(&tx, id, analyst, &now_text)?;
            }
        }

        if let Some(tag_ids) = &input.tag_ids {
            ensure_tags_exist(&tx, tag_ids)?;
            tx.execute(
                "DELETE FROM ims_tags WHERE ims_id = ?1",
                params![id.to_string()],
            )
            .map_err(|err| storage("failed to clear tag links", err))?;
            replace_tag_links(&tx, id, tag_ids)?;
        }

        let report_name = input
            .report_name
            .clone()
            .unwrap_or_else(|| current.report_name.clone());
        let description = input
            .description
            .clone()
            .unwrap_or_else(|| current.description.clone());
        let date = input.date.or(current.date);
        let date_text = match date {
            Some(value) => Some(format_rfc3339(value)?),
            None => None,
        };
        let link_opencti = input.link_opencti.clone().or_else(|| current.link_opencti.clone());
        let link_docintel = input
            .link_docintel
            .clone()
            .or_else(|| current.link_docintel.clone());
        let comments = input.comments.clone().or_else(|| current.comments.clone());
        let status = input.status.unwrap_or(current.status);
        let priority = input.priority.unwrap_or(current.priority);
        let analyst_id = input.analyst_id.or(current.analyst_id);

        tx.execute(
            "UPDATE ims SET
               report_name = ?1, description = ?2, date = ?3,
               link_opencti = ?4, link_docintel = ?5, comments = ?6,
               status = ?7, priority = ?8, analyst_id = ?9, updated_at = ?10
             WHERE id = ?11",
            params![
                report_name,
                description,
                date_text,
                link_opencti,
                link_docintel,
                comments,
                status.as_str(),
                priority.as_str(),
                analyst_id.map(|value| value.to_string()),
                now_text,
                id.to_string(),
            ],
        )
        .map_err(|err| storage("failed to update ims record", err))?;

        let changes =
            serde_json::to_value(input).map_err(|err| ImsError::Storage(err.to_string()))?;
        append_history(&tx, id, HistoryAction::Updated, &changes, &now_text)?;

        let record = require_ims(&tx, id, false)?;
        tx.commit()
            .map_err(|err| storage("failed to commit update transaction", err))?;

        Ok(record)
    }

    pub fn soft_delete_ims(&mut self, id: ImsId) -> Result<(), ImsError> {
        let now_text = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage("failed to start delete transaction", err))?;

        if read_ims_row(&tx, id, false)?.is_none() {
            return Err(not_found_ims(id));
        }

        tx.execute(
            "UPDATE ims SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now_text, id.to_string()],
        )
        .map_err(|err| storage("failed to soft-delete ims record", err))?;

        append_history(
            &tx,
            id,
            HistoryAction::Deleted,
            &Value::Object(serde_json::Map::new()),
            &now_text,
        )?;

        tx.commit()
            .map_err(|err| storage("failed to commit delete transaction", err))?;

        tracing::debug!(ims = %id, "soft-deleted ims record");
        Ok(())
    }

    pub fn restore_ims(&mut self, id: ImsId) -> Result<Ims, ImsError> {
        let now_text = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage("failed to start restore transaction", err))?;

        if read_ims_row(&tx, id, true)?.is_none() {
            return Err(not_found_ims(id));
        }

        tx.execute(
            "UPDATE ims SET deleted_at = NULL, updated_at = ?1 WHERE id = ?2",
            params![now_text, id.to_string()],
        )
        .map_err(|err| storage("failed to restore ims record", err))?;

        append_history(
            &tx,
            id,
            HistoryAction::Restored,
            &Value::Object(serde_json::Map::new()),
            &now_text,
        )?;

        let record = require_ims(&tx, id, false)?;
        tx.commit()
            .map_err(|err| storage("failed to commit restore transaction", err))?;

        Ok(record)
    }

    pub fn get_ims(&self, id: ImsId) -> Result<Ims, ImsError> {
        require_ims(&self.conn, id, false)
    }

    pub fn list_ims(&self, filter: &ImsFilter) -> Result<Page<Ims>, ImsError> {
        filter.validate()?;

        let mut clauses: Vec<String> = vec!["deleted_at IS NULL".to_string()];
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
            let pattern = format!("%{}%", escape_like(&search.to_lowercase()));
            clauses.push(
                "(lower(report_name) LIKE ? ESCAPE '\\'
                  OR lower(description) LIKE ? ESCAPE '\\'
                  OR lower('ccd-' || ccd_num) LIKE ? ESCAPE '\\')"
                    .to_string(),
            );
            args.push(rusqlite::types::Value::Text(pattern.clone()));
            args.push(rusqlite::types::Value::Text(pattern.clone()));
            args.push(rusqlite::types::Value::Text(pattern));
        }

        if let Some(status) = filter.status {
            clauses.push("status = ?".to_string());
            args.push(rusqlite::types::Value::Text(status.as_str().to_string()));
        }

        if let Some(priority) = filter.priority {
            clauses.push("priority = ?".to_string());
            args.push(rusqlite::types::Value::Text(priority.as_str().to_string()));
        }

        if let Some(analyst_id) = filter.analyst_id {
            clauses.push("analyst_id = ?".to_string());
            args.push(rusqlite::types::Value::Text(analyst_id.to_string()));
        }

        if let Some(tag_id) = filter.tag_id {
            clauses.push(
                "EXISTS (SELECT 1 FROM ims_tags
                  WHERE ims_tags.ims_id = ims.id AND ims_tags.tag_id = ?)"
                    .to_string(),
            );
            args.push(rusqlite::types::Value::Text(tag_id.to_string()));
        }

        let where_sql = clauses.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM ims WHERE {where_sql}");
        let total: i64 = self
            .conn
            .query_row(&count_sql, params_from_iter(args.iter()), |row| row.get(0))
            .map_err(|err| storage("failed to count ims records", err))?;
        let total = u64::try_from(total).unwrap_or(0);

        let page_sql = format!(
            "SELECT {IMS_COLUMNS} FROM ims WHERE {where_sql}
             ORDER BY {} {}, id {} LIMIT ? OFFSET ?",
            filter.sort_by.column(),
            filter.sort_order.keyword(),
            filter.sort_order.keyword(),
        );
        let mut page_args = args;
        page_args.push(rusqlite::types::Value::Integer(i64::from(filter.limit)));
        page_args.push(rusqlite::types::Value::Integer(
            i64::try_from(filter.offset()).unwrap_or(i64::MAX),
        ));

        let mut stmt = self
            .conn
            .prepare(&page_sql)
            .map_err(|err| storage("failed to prepare ims listing", err))?;
        let rows = stmt
            .query_map(params_from_iter(page_args.iter()), ims_row_from)
            .map_err(|err| storage("failed to query ims listing", err))?;
        let rows = collect_rows(rows, "failed to read ims listing row")?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(hydrate_ims(&self.conn, row)?);
        }

        Ok(Page::new(items, total, filter.page, filter.limit))
    }

    pub fn ims_history(&self, id: ImsId) -> Result<Vec<HistoryEntry>, ImsError> {
        if read_ims_row(&self.conn, id, false)?.is_none() {
            return Err(not_found_ims(id));
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT entry_seq, ims_id, action, changes_json, created_at
                 FROM ims_history WHERE ims_id = ?1 ORDER BY entry_seq DESC",
            )
            .map_err(|err| storage("failed to prepare history query", err))?;
        let rows = stmt
            .query_map(params![id.to_string()], history_entry_from)
            .map_err(|err| storage("failed to query history", err))?;
        collect_rows(rows, "failed to read history row")
    }

    pub fn assignment_history(&self, id: ImsId) -> Result<Vec<AssignmentEntry>, ImsError> {
        if read_ims_row(&self.conn, id, false)?.is_none() {
            return Err(not_found_ims(id));
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.entry_seq, a.ims_id, u.id, u.full_name, u.email, a.assigned_at
                 FROM assignment_history a JOIN users u ON u.id = a.analyst_id
                 WHERE a.ims_id = ?1 ORDER BY a.entry_seq DESC",
            )
            .map_err(|err| storage("failed to prepare assignment query", err))?;
        let rows = stmt
            .query_map(params![id.to_string()], assignment_entry_from)
            .map_err(|err| storage("failed to query assignments", err))?;
        collect_rows(rows, "failed to read assignment row")
    }

    // ---- Merge state machine ----

    pub fn create_merge(
        &mut self,
        input: &CreateMergeInput,
        actor: UserId,
    ) -> Result<Merge, ImsError> {
        input.validate()?;

        let now_text = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage("failed to start merge transaction", err))?;

        require_user(&tx, actor, "creator")?;

        // Both membership checks run before any row is written, so a rejected
        // merge leaves zero rows behind.
        for member in &input.ims_ids {
            if read_ims_row(&tx, *member, false)?.is_none() {
                return Err(ImsError::Validation(
                    "some IMS do not exist or have been deleted".to_string(),
                ));
            }
        }

        for member in &input.ims_ids {
            let claimed: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM merge_items
                     JOIN merges ON merges.id = merge_items.merge_id
                     WHERE merge_items.ims_id = ?1 AND merges.unmerged_at IS NULL",
                    params![member.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| storage("failed to check merge membership", err))?;
            if claimed.is_some() {
                return Err(ImsError::Validation(
                    "some IMS are already part of another active merge".to_string(),
                ));
            }
        }

        let id = MergeId::generate();
        tx.execute(
            "INSERT INTO merges(id, merge_name, description, reason, created_by, merged_at, unmerged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            params![
                id.to_string(),
                input.merge_name,
                input.description,
                input.reason,
                actor.to_string(),
                now_text,
            ],
        )
        .map_err(|err| storage("failed to insert merge", err))?;

        let member_changes = serde_json::json!({
            "merge_id": id.to_string(),
            "merge_name": input.merge_name,
        });

        for member in &input.ims_ids {
            tx.execute(
                "INSERT INTO merge_items(merge_id, ims_id) VALUES (?1, ?2)",
                params![id.to_string(), member.to_string()],
            )
            .map_err(|err| storage("failed to insert merge item", err))?;

            tx.execute(
                "UPDATE ims SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![ImsStatus::Merged.as_str(), now_text, member.to_string()],
            )
            .map_err(|err| storage("failed to mark member as merged", err))?;

            append_history(&tx, *member, HistoryAction::Merged, &member_changes, &now_text)?;
        }

        let merge = require_merge(&tx, id)?;
        tx.commit()
            .map_err(|err| storage("failed to commit merge transaction", err))?;

        tracing::debug!(merge = %id, members = input.ims_ids.len(), "created merge");
        Ok(merge)
    }

    pub fn unmerge(&mut self, id: MergeId) -> Result<Merge, ImsError> {
        let now_text = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage("failed to start unmerge transaction", err))?;

        let merge = require_merge(&tx, id)?;
        if !merge.is_active() {
            return Err(ImsError::State(format!(
                "merge {id} has already been unmerged"
            )));
        }

        tx.execute(
            "UPDATE merges SET unmerged_at = ?1 WHERE id = ?2",
            params![now_text, id.to_string()],
        )
        .map_err(|err| storage("failed to close merge", err))?;

        let member_changes = serde_json::json!({
            "merge_id": id.to_string(),
            "merge_name": merge.merge_name,
        });

        // Members revert to in_progress unconditionally; pre-merge status is
        // not remembered.
        for item in &merge.items {
            tx.execute(
                "UPDATE ims SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![
                    ImsStatus::InProgress.as_str(),
                    now_text,
                    item.ims_id.to_string()
                ],
            )
            .map_err(|err| storage("failed to revert member status", err))?;

            append_history(
                &tx,
                item.ims_id,
                HistoryAction::Unmerged,
                &member_changes,
                &now_text,
            )?;
        }

        let merge = require_merge(&tx, id)?;
        tx.commit()
            .map_err(|err| storage("failed to commit unmerge transaction", err))?;

        tracing::debug!(merge = %id, "unmerged");
        Ok(merge)
    }

    pub fn remove_merge(&mut self, id: MergeId) -> Result<(), ImsError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| storage("failed to start merge removal", err))?;

        let merge = require_merge(&tx, id)?;
        if merge.is_active() {
            return Err(ImsError::State(
                "cannot delete an active merge; unmerge it first".to_string(),
            ));
        }

        tx.execute("DELETE FROM merges WHERE id = ?1", params![id.to_string()])
            .map_err(|err| storage("failed to delete merge", err))?;

        tx.commit()
            .map_err(|err| storage("failed to commit merge removal", err))?;
        Ok(())
    }

    pub fn get_merge(&self, id: MergeId) -> Result<Merge, ImsError> {
        require_merge(&self.conn, id)
    }

    pub fn list_active_merges(&self) -> Result<Vec<Merge>, ImsError> {
        self.collect_merges("SELECT {cols} FROM merges WHERE unmerged_at IS NULL ORDER BY merged_at DESC, id DESC")
    }

    pub fn merge_history(&self) -> Result<Vec<Merge>, ImsError> {
        self.collect_merges("SELECT {cols} FROM merges ORDER BY merged_at DESC, id DESC")
    }

    fn collect_merges(&self, sql_template: &str) -> Result<Vec<Merge>, ImsError> {
        let sql = sql_template.replace("{cols}", MERGE_COLUMNS);
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| storage("failed to prepare merge listing", err))?;
        let rows = stmt
            .query_map([], merge_row_from)
            .map_err(|err| storage("failed to query merges", err))?;
        let rows = collect_rows(rows, "failed to read merge row")?;

        let mut merges = Vec::with_capacity(rows.len());
        for row in rows {
            merges.push(hydrate_merge(&self.conn, row)?);
        }
        Ok(merges)
    }

    // ---- Tags ----

    pub fn create_tag(&self, input: &CreateTagInput) -> Result<Tag, ImsError> {
        input.validate()?;

        let id = TagId::generate();
        let now = now_utc();
        let now_text = format_rfc3339(now)?;
        let color = input
            .color
            .clone()
            .unwrap_or_else(|| DEFAULT_TAG_COLOR.to_string());

        self.conn
            .execute(
                "INSERT INTO tags(id, name, color, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), input.name, color, now_text],
            )
            .map_err(|err| {
                conflict_or_storage(
                    "failed to insert tag",
                    format!("tag name {:?} is already in use", input.name),
                    err,
                )
            })?;

        Ok(Tag {
            id,
            name: input.name.clone(),
            color,
            created_at: now,
        })
    }

    pub fn list_tags(&self) -> Result<Vec<TagUsage>, ImsError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT tags.id, tags.name, tags.color,
                        (SELECT COUNT(*) FROM ims_tags
                          JOIN ims ON ims.id = ims_tags.ims_id
                          WHERE ims_tags.tag_id = tags.id AND ims.deleted_at IS NULL)
                 FROM tags ORDER BY tags.name ASC",
            )
            .map_err(|err| storage("failed to prepare tag listing", err))?;
        let rows = stmt
            .query_map([], tag_usage_from)
            .map_err(|err| storage("failed to query tags", err))?;
        collect_rows(rows, "failed to read tag row")
    }

    pub fn get_tag(&self, id: TagId) -> Result<Tag, ImsError> {
        self.conn
            .query_row(
                "SELECT id, name, color, created_at FROM tags WHERE id = ?1",
                params![id.to_string()],
                tag_from,
            )
            .optional()
            .map_err(|err| storage("failed to read tag", err))?
            .ok_or_else(|| ImsError::NotFound(format!("tag {id} does not exist")))
    }

    pub fn update_tag(&self, id: TagId, input: &UpdateTagInput) -> Result<Tag, ImsError> {
        input.validate()?;

        let current = self.get_tag(id)?;

        if let Some(name) = &input.name {
            let taken: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM tags WHERE name = ?1 AND id <> ?2",
                    params![name, id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| storage("failed to check tag name", err))?;
            if taken.is_some() {
                return Err(ImsError::Conflict(format!(
                    "tag name {name:?} is already in use"
                )));
            }
        }

        let name = input.name.clone().unwrap_or_else(|| current.name.clone());
        let color = input.color.clone().unwrap_or_else(|| current.color.clone());

        self.conn
            .execute(
                "UPDATE tags SET name = ?1, color = ?2 WHERE id = ?3",
                params![name, color, id.to_string()],
            )
            .map_err(|err| storage("failed to update tag", err))?;

        Ok(Tag {
            id,
            name,
            color,
            created_at: current.created_at,
        })
    }

    pub fn delete_tag(&self, id: TagId) -> Result<(), ImsError> {
        self.get_tag(id)?;
        self.conn
            .execute("DELETE FROM tags WHERE id = ?1", params![id.to_string()])
            .map_err(|err| storage("failed to delete tag", err))?;
        Ok(())
    }

    pub fn popular_tags(&self, limit: u32) -> Result<Vec<TagUsage>, ImsError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT tags.id, tags.name, tags.color,
                        (SELECT COUNT(*) FROM ims_tags
                          JOIN ims ON ims.id = ims_tags.ims_id
                          WHERE ims_tags.tag_id = tags.id AND ims.deleted_at IS NULL) AS usage
                 FROM tags ORDER BY usage DESC, tags.name ASC LIMIT ?1",
            )
            .map_err(|err| storage("failed to prepare popular tags", err))?;
        let rows = stmt
            .query_map(params![i64::from(limit)], tag_usage_from)
            .map_err(|err| storage("failed to query popular tags", err))?;
        collect_rows(rows, "failed to read tag row")
    }

    // ---- Users ----

    pub fn create_user(&self, input: &CreateUserInput) -> Result<User, ImsError> {
        input.validate()?;

        let id = UserId::generate();
        let now = now_utc();
        let now_text = format_rfc3339(now)?;

        self.conn
            .execute(
                "INSERT INTO users(id, email, full_name, role, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.to_string(),
                    input.email,
                    input.full_name,
                    input.role.as_str(),
                    now_text,
                    now_text,
                ],
            )
            .map_err(|err| {
                conflict_or_storage(
                    "failed to insert user",
                    format!("email {:?} is already registered", input.email),
                    err,
                )
            })?;

        Ok(User {
            id,
            email: input.email.clone(),
            full_name: input.full_name.clone(),
            role: input.role,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn list_users(&self) -> Result<Vec<User>, ImsError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, email, full_name, role, created_at, updated_at
                 FROM users ORDER BY created_at DESC, id DESC",
            )
            .map_err(|err| storage("failed to prepare user listing", err))?;
        let rows = stmt
            .query_map([], user_from)
            .map_err(|err| storage("failed to query users", err))?;
        collect_rows(rows, "failed to read user row")
    }

    pub fn get_user(&self, id: UserId) -> Result<User, ImsError> {
        self.conn
            .query_row(
                "SELECT id, email, full_name, role, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![id.to_string()],
                user_from,
            )
            .optional()
            .map_err(|err| storage("failed to read user", err))?
            .ok_or_else(|| ImsError::NotFound(format!("user {id} does not exist")))
    }

    pub fn count_users(&self) -> Result<u64, ImsError> {
        scalar_u64(&self.conn, "SELECT COUNT(*) FROM users", &[])
    }

    // ---- Dashboard ----

    pub fn dashboard_stats(&self) -> Result<DashboardStats, ImsError> {
        let conn = &self.conn;

        let overview = DashboardOverview {
            total_ims: scalar_u64(conn, "SELECT COUNT(*) FROM ims WHERE deleted_at IS NULL", &[])?,
            total_analysts: scalar_u64(
                conn,
                "SELECT COUNT(*) FROM users WHERE role = 'analyst'",
                &[],
            )?,
            total_tags: scalar_u64(conn, "SELECT COUNT(*) FROM tags", &[])?,
            active_merges: scalar_u64(
                conn,
                "SELECT COUNT(*) FROM merges WHERE unmerged_at IS NULL",
                &[],
            )?,
            unassigned_ims: scalar_u64(
                conn,
                "SELECT COUNT(*) FROM ims WHERE deleted_at IS NULL AND analyst_id IS NULL",
                &[],
            )?,
        };

        let status_distribution = status_counts(
            conn,
            "SELECT status, COUNT(*) FROM ims WHERE deleted_at IS NULL
             GROUP BY status ORDER BY COUNT(*) DESC, status ASC",
            &[],
        )?;

        let mut stmt = conn
            .prepare(
                "SELECT priority, COUNT(*) FROM ims WHERE deleted_at IS NULL
                 GROUP BY priority ORDER BY COUNT(*) DESC, priority ASC",
            )
            .map_err(|err| storage("failed to prepare priority distribution", err))?;
        let rows = stmt
            .query_map([], priority_count_from)
            .map_err(|err| storage("failed to query priority distribution", err))?;
        let priority_distribution = collect_rows(rows, "failed to read priority count")?;

        let recent_ims = self.summaries(
            "SELECT id, ccd_num, report_name, status, priority, analyst_id, created_at, updated_at
             FROM ims WHERE deleted_at IS NULL
             ORDER BY created_at DESC, id DESC LIMIT 10",
            &[],
        )?;

        let mut stmt = conn
            .prepare(
                "SELECT u.id, u.full_name, u.email, COUNT(i.id)
                 FROM users u
                 JOIN ims i ON i.analyst_id = u.id
                   AND i.deleted_at IS NULL
                   AND i.status IN ('draft', 'in_progress')
                 GROUP BY u.id, u.full_name, u.email
                 ORDER BY COUNT(i.id) DESC, u.full_name ASC",
            )
            .map_err(|err| storage("failed to prepare analyst workload", err))?;
        let rows = stmt
            .query_map([], analyst_workload_from)
            .map_err(|err| storage("failed to query analyst workload", err))?;
        let analyst_workload = collect_rows(rows, "failed to read workload row")?;

        let top_tags = self.popular_tags(10)?;

        Ok(DashboardStats {
            overview,
            status_distribution,
            priority_distribution,
            recent_ims,
            analyst_workload,
            top_tags,
        })
    }

    pub fn analyst_stats(&self, analyst_id: UserId) -> Result<AnalystStats, ImsError> {
        self.get_user(analyst_id)?;

        let analyst_text = analyst_id.to_string();
        let total_assigned = scalar_u64(
            &self.conn,
            "SELECT COUNT(*) FROM ims WHERE deleted_at IS NULL AND analyst_id = ?1",
            &[&analyst_text],
        )?;

        let status_distribution = status_counts(
            &self.conn,
            "SELECT status, COUNT(*) FROM ims
             WHERE deleted_at IS NULL AND analyst_id = ?1
             GROUP BY status ORDER BY COUNT(*) DESC, status ASC",
            &[&analyst_text],
        )?;

        let recent_activity = self.summaries(
            "SELECT id, ccd_num, report_name, status, priority, analyst_id, created_at, updated_at
             FROM ims WHERE deleted_at IS NULL AND analyst_id = ?1
             ORDER BY updated_at DESC, id DESC LIMIT 10",
            &[&analyst_text],
        )?;

        let completed = scalar_u64(
            &self.conn,
            "SELECT COUNT(*) FROM ims
             WHERE deleted_at IS NULL AND analyst_id = ?1 AND status = 'completed'",
            &[&analyst_text],
        )?;

        #[allow(clippy::cast_precision_loss)]
        let completion_rate = if total_assigned == 0 {
            0.0
        } else {
            completed as f64 * 100.0 / total_assigned as f64
        };

        Ok(AnalystStats {
            total_assigned,
            status_distribution,
            recent_activity,
            completion_rate,
        })
    }

    pub fn dashboard_timeline(&self, days: u32) -> Result<DashboardTimeline, ImsError> {
        let start = now_utc() - Duration::days(i64::from(days));
        let start_text = format_rfc3339(start)?;

        // created_at is RFC3339 UTC, so the first ten characters are the day.
        let mut stmt = self
            .conn
            .prepare(
                "SELECT substr(created_at, 1, 10) AS day, COUNT(*) FROM ims
                 WHERE deleted_at IS NULL AND created_at >= ?1
                 GROUP BY day ORDER BY day ASC",
            )
            .map_err(|err| storage("failed to prepare timeline", err))?;
        let rows = stmt
            .query_map(params![start_text], timeline_point_from)
            .map_err(|err| storage("failed to query timeline", err))?;
        let data = collect_rows(rows, "failed to read timeline point")?;

        Ok(DashboardTimeline {
            period: format!("Last {days} days"),
            data,
        })
    }

    pub fn dashboard_trends(&self) -> Result<DashboardTrends, ImsError> {
        let cutoff = now_utc() - Duration::days(TREND_WINDOW_DAYS);
        let cutoff_text = format_rfc3339(cutoff)?;
        let args: &[&dyn rusqlite::ToSql] = &[&cutoff_text];

        let created_current = scalar_u64(
            &self.conn,
            "SELECT COUNT(*) FROM ims WHERE deleted_at IS NULL AND created_at >= ?1",
            args,
        )?;
        let created_previous = scalar_u64(
            &self.conn,
            "SELECT COUNT(*) FROM ims WHERE deleted_at IS NULL AND created_at < ?1",
            args,
        )?;
        let completed_current = scalar_u64(
            &self.conn,
            "SELECT COUNT(*) FROM ims
             WHERE deleted_at IS NULL AND status = 'completed' AND updated_at >= ?1",
            args,
        )?;
        let completed_previous = scalar_u64(
            &self.conn,
            "SELECT COUNT(*) FROM ims
             WHERE deleted_at IS NULL AND status = 'completed' AND updated_at < ?1",
            args,
        )?;

        Ok(DashboardTrends {
            creation: trend_window(created_current, created_previous),
            completion: trend_window(completed_current, completed_previous),
        })
    }

    fn summaries(
        &self,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ImsSummary>, ImsError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|err| storage("failed to prepare summary query", err))?;
        let rows = stmt
            .query_map(args, summary_row_from)
            .map_err(|err| storage("failed to query summaries", err))?;
        let rows = collect_rows(rows, "failed to read summary row")?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let analyst = match row.analyst_id {
                Some(analyst_id) => user_summary(&self.conn, analyst_id)?,
                None => None,
            };
            summaries.push(ImsSummary {
                id: row.id,
                ccd_id: row.ccd_id,
                report_name: row.report_name,
                status: row.status,
                priority: row.priority,
                analyst,
                created_at: row.created_at,
                updated_at: row.updated_at,
            });
        }
        Ok(summaries)
    }
}

const IMS_COLUMNS: &str = "id, ccd_num, report_name, description, date, \
    link_opencti, link_docintel, comments, status, priority, \
    analyst_id, created_by, deleted_at, created_at, updated_at";

const MERGE_COLUMNS: &str =
    "id, merge_name, description, reason, created_by, merged_at, unmerged_at";

struct ImsRow {
    id: ImsId,
    ccd_id: CcdId,
    report_name: String,
    description: String,
    date: Option<OffsetDateTime>,
    link_opencti: Option<String>,
    link_docintel: Option<String>,
    comments: Option<String>,
    status: ImsStatus,
    priority: Priority,
    analyst_id: Option<UserId>,
    created_by: UserId,
    deleted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

struct SummaryRow {
    id: ImsId,
    ccd_id: CcdId,
    report_name: String,
    status: ImsStatus,
    priority: Priority,
    analyst_id: Option<UserId>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

struct MergeRow {
    id: MergeId,
    merge_name: String,
    description: Option<String>,
    reason: Option<String>,
    created_by: UserId,
    merged_at: OffsetDateTime,
    unmerged_at: Option<OffsetDateTime>,
}

fn storage(context: &str, err: rusqlite::Error) -> ImsError {
    ImsError::Storage(format!("{context}: {err}"))
}

fn conflict_or_storage(context: &str, conflict: String, err: rusqlite::Error) -> ImsError {
    match err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            ImsError::Conflict(conflict)
        }
        other => ImsError::Storage(format!("{context}: {other}")),
    }
}

fn not_found_ims(id: ImsId) -> ImsError {
    ImsError::NotFound(format!("IMS {id} does not exist"))
}

fn column_decode(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn decode_timestamp(index: usize, text: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339_utc(text).map_err(|err| column_decode(index, err.to_string()))
}

fn decode_timestamp_opt(
    index: usize,
    text: Option<String>,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    match text {
        Some(value) => Ok(Some(decode_timestamp(index, &value)?)),
        None => Ok(None),
    }
}

fn decode_ccd(index: usize, raw: i64) -> rusqlite::Result<CcdId> {
    u64::try_from(raw)
        .ok()
        .and_then(CcdId::from_number)
        .ok_or_else(|| column_decode(index, format!("invalid ccd_num {raw}")))
}

fn ccd_num_i64(ccd: CcdId) -> Result<i64, ImsError> {
    i64::try_from(ccd.number())
        .map_err(|_| ImsError::Validation(format!("ccd id {ccd} is out of range")))
}

fn ims_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImsRow> {
    let id_text: String = row.get(0)?;
    let id = ImsId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
    let ccd_id = decode_ccd(1, row.get(1)?)?;

    let status_text: String = row.get(8)?;
    let status = ImsStatus::parse(&status_text)
        .ok_or_else(|| column_decode(8, format!("unknown status {status_text:?}")))?;
    let priority_text: String = row.get(9)?;
    let priority = Priority::parse(&priority_text)
        .ok_or_else(|| column_decode(9, format!("unknown priority {priority_text:?}")))?;

    let analyst_text: Option<String> = row.get(10)?;
    let analyst_id = match analyst_text {
        Some(value) => {
            Some(UserId::parse(&value).map_err(|err| column_decode(10, err.to_string()))?)
        }
        None => None,
    };
    let created_by_text: String = row.get(11)?;
    let created_by =
        UserId::parse(&created_by_text).map_err(|err| column_decode(11, err.to_string()))?;

    let date_text: Option<String> = row.get(4)?;
    let created_at_text: String = row.get(13)?;
    let updated_at_text: String = row.get(14)?;

    Ok(ImsRow {
        id,
        ccd_id,
        report_name: row.get(2)?,
        description: row.get(3)?,
        date: decode_timestamp_opt(4, date_text)?,
        link_opencti: row.get(5)?,
        link_docintel: row.get(6)?,
        comments: row.get(7)?,
        status,
        priority,
        analyst_id,
        created_by,
        deleted_at: decode_timestamp_opt(12, row.get(12)?)?,
        created_at: decode_timestamp(13, &created_at_text)?,
        updated_at: decode_timestamp(14, &updated_at_text)?,
    })
}

fn summary_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<SummaryRow> {
    let id_text: String = row.get(0)?;
    let id = ImsId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
    let ccd_id = decode_ccd(1, row.get(1)?)?;

    let status_text: String = row.get(3)?;
    let status = ImsStatus::parse(&status_text)
        .ok_or_else(|| column_decode(3, format!("unknown status {status_text:?}")))?;
    let priority_text: String = row.get(4)?;
    let priority = Priority::parse(&priority_text)
        .ok_or_else(|| column_decode(4, format!("unknown priority {priority_text:?}")))?;

    let analyst_text: Option<String> = row.get(5)?;
    let analyst_id = match analyst_text {
        Some(value) => {
            Some(UserId::parse(&value).map_err(|err| column_decode(5, err.to_string()))?)
        }
        None => None,
    };

    let created_at_text: String = row.get(6)?;
    let updated_at_text: String = row.get(7)?;

    Ok(SummaryRow {
        id,
        ccd_id,
        report_name: row.get(2)?,
        status,
        priority,
        analyst_id,
        created_at: decode_timestamp(6, &created_at_text)?,
        updated_at: decode_timestamp(7, &updated_at_text)?,
    })
}

fn merge_row_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<MergeRow> {
    let id_text: String = row.get(0)?;
    let id = MergeId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
    let created_by_text: String = row.get(4)?;
    let created_by =
        UserId::parse(&created_by_text).map_err(|err| column_decode(4, err.to_string()))?;
    let merged_at_text: String = row.get(5)?;

    Ok(MergeRow {
        id,
        merge_name: row.get(1)?,
        description: row.get(2)?,
        reason: row.get(3)?,
        created_by,
        merged_at: decode_timestamp(5, &merged_at_text)?,
        unmerged_at: decode_timestamp_opt(6, row.get(6)?)?,
    })
}

fn history_entry_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let ims_text: String = row.get(1)?;
    let ims_id = ImsId::parse(&ims_text).map_err(|err| column_decode(1, err.to_string()))?;
    let action_text: String = row.get(2)?;
    let action = HistoryAction::parse(&action_text)
        .ok_or_else(|| column_decode(2, format!("unknown action {action_text:?}")))?;
    let changes_text: String = row.get(3)?;
    let changes: Value = serde_json::from_str(&changes_text)
        .map_err(|err| column_decode(3, format!("invalid changes payload: {err}")))?;
    let created_at_text: String = row.get(4)?;

    Ok(HistoryEntry {
        entry_seq: row.get(0)?,
        ims_id,
        action,
        changes,
        created_at: decode_timestamp(4, &created_at_text)?,
    })
}

fn assignment_entry_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentEntry> {
    let ims_text: String = row.get(1)?;
    let ims_id = ImsId::parse(&ims_text).map_err(|err| column_decode(1, err.to_string()))?;
    let analyst_text: String = row.get(2)?;
    let analyst_id =
        UserId::parse(&analyst_text).map_err(|err| column_decode(2, err.to_string()))?;
    let assigned_at_text: String = row.get(5)?;

    Ok(AssignmentEntry {
        entry_seq: row.get(0)?,
        ims_id,
        analyst: UserSummary {
            id: analyst_id,
            full_name: row.get(3)?,
            email: row.get(4)?,
        },
        assigned_at: decode_timestamp(5, &assigned_at_text)?,
    })
}

fn tag_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<Tag> {
    let id_text: String = row.get(0)?;
    let id = TagId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
    let created_at_text: String = row.get(3)?;

    Ok(Tag {
        id,
        name: row.get(1)?,
        color: row.get(2)?,
        created_at: decode_timestamp(3, &created_at_text)?,
    })
}

fn tag_usage_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagUsage> {
    let id_text: String = row.get(0)?;
    let id = TagId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
    let usage_raw: i64 = row.get(3)?;

    Ok(TagUsage {
        id,
        name: row.get(1)?,
        color: row.get(2)?,
        usage: u64::try_from(usage_raw).unwrap_or(0),
    })
}

fn user_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_text: String = row.get(0)?;
    let id = UserId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
    let role_text: String = row.get(3)?;
    let role = Role::parse(&role_text)
        .ok_or_else(|| column_decode(3, format!("unknown role {role_text:?}")))?;
    let created_at_text: String = row.get(4)?;
    let updated_at_text: String = row.get(5)?;

    Ok(User {
        id,
        email: row.get(1)?,
        full_name: row.get(2)?,
        role,
        created_at: decode_timestamp(4, &created_at_text)?,
        updated_at: decode_timestamp(5, &updated_at_text)?,
    })
}

fn status_count_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatusCount> {
    let status_text: String = row.get(0)?;
    let status = ImsStatus::parse(&status_text)
        .ok_or_else(|| column_decode(0, format!("unknown status {status_text:?}")))?;
    let count_raw: i64 = row.get(1)?;

    Ok(StatusCount {
        status,
        count: u64::try_from(count_raw).unwrap_or(0),
    })
}

fn priority_count_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<PriorityCount> {
    let priority_text: String = row.get(0)?;
    let priority = Priority::parse(&priority_text)
        .ok_or_else(|| column_decode(0, format!("unknown priority {priority_text:?}")))?;
    let count_raw: i64 = row.get(1)?;

    Ok(PriorityCount {
        priority,
        count: u64::try_from(count_raw).unwrap_or(0),
    })
}

fn timeline_point_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<TimelinePoint> {
    let count_raw: i64 = row.get(1)?;
    Ok(TimelinePoint {
        date: row.get(0)?,
        count: u64::try_from(count_raw).unwrap_or(0),
    })
}

fn trend_window(current: u64, previous: u64) -> TrendWindow {
    #[allow(clippy::cast_precision_loss)]
    let percentage_change = if previous == 0 {
        0.0
    } else {
        (current as f64 - previous as f64) * 100.0 / previous as f64
    };
    TrendWindow {
        current,
        previous,
        percentage_change,
    }
}

fn analyst_workload_from(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalystWorkload> {
    let id_text: String = row.get(0)?;
    let id = UserId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
    let count_raw: i64 = row.get(3)?;

    Ok(AnalystWorkload {
        id,
        full_name: row.get(1)?,
        email: row.get(2)?,
        active_ims: u64::try_from(count_raw).unwrap_or(0),
    })
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
    context: &str,
) -> Result<Vec<T>, ImsError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| storage(context, err))?);
    }
    Ok(values)
}

fn scalar_u64(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<u64, ImsError> {
    let raw: i64 = conn
        .query_row(sql, args, |row| row.get(0))
        .map_err(|err| storage("failed to run count query", err))?;
    Ok(u64::try_from(raw).unwrap_or(0))
}

fn status_counts(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<StatusCount>, ImsError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|err| storage("failed to prepare status distribution", err))?;
    let rows = stmt
        .query_map(args, status_count_from)
        .map_err(|err| storage("failed to query status distribution", err))?;
    collect_rows(rows, "failed to read status count")
}

fn user_summary(conn: &Connection, id: UserId) -> Result<Option<UserSummary>, ImsError> {
    conn.query_row(
        "SELECT id, full_name, email FROM users WHERE id = ?1",
        params![id.to_string()],
        |row| {
            let id_text: String = row.get(0)?;
            let id = UserId::parse(&id_text).map_err(|err| column_decode(0, err.to_string()))?;
            Ok(UserSummary {
                id,
                full_name: row.get(1)?,
                email: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(|err| storage("failed to read user summary", err))
}

fn require_user(conn: &Connection, id: UserId, role_hint: &str) -> Result<UserSummary, ImsError> {
    user_summary(conn, id)?
        .ok_or_else(|| ImsError::Validation(format!("{role_hint} {id} does not exist")))
}

fn ensure_tags_exist(conn: &Connection, tag_ids: &[TagId]) -> Result<(), ImsError> {
    for tag_id in tag_ids {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM tags WHERE id = ?1",
                params![tag_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage("failed to check tag existence", err))?;
        if found.is_none() {
            return Err(ImsError::Validation(format!(
                "tag {tag_id} does not exist"
            )));
        }
    }
    Ok(())
}

fn replace_tag_links(conn: &Connection, ims_id: ImsId, tag_ids: &[TagId]) -> Result<(), ImsError> {
    for tag_id in tag_ids {
        conn.execute(
            "INSERT OR IGNORE INTO ims_tags(ims_id, tag_id) VALUES (?1, ?2)",
            params![ims_id.to_string(), tag_id.to_string()],
        )
        .map_err(|err| storage("failed to link tag", err))?;
    }
    Ok(())
}

/// Reads and bumps the CCD counter inside the caller's transaction. An
/// explicit id at or past the counter advances the counter beyond it, so
/// later auto-assignments cannot collide.
fn claim_ccd(conn: &Connection, explicit: Option<CcdId>) -> Result<CcdId, ImsError> {
    let next_raw: i64 = conn
        .query_row("SELECT next_value FROM ccd_sequence WHERE id = 1", [], |row| {
            row.get(0)
        })
        .map_err(|err| storage("failed to read ccd sequence", err))?;
    let next = u64::try_from(next_raw)
        .ok()
        .filter(|value| *value >= 1)
        .ok_or_else(|| ImsError::Storage(format!("ccd sequence is corrupt: {next_raw}")))?;

    let claimed = match explicit {
        Some(id) => id,
        None => CcdId::from_number(next)
            .ok_or_else(|| ImsError::Storage("ccd sequence is corrupt".to_string()))?,
    };

    if claimed.number() >= next {
        let advanced = claimed
            .number()
            .checked_add(1)
            .and_then(|value| i64::try_from(value).ok())
            .ok_or_else(|| ImsError::Validation(format!("ccd id {claimed} is out of range")))?;
        conn.execute(
            "UPDATE ccd_sequence SET next_value = ?1 WHERE id = 1",
            params![advanced],
        )
        .map_err(|err| storage("failed to advance ccd sequence", err))?;
    }

    Ok(claimed)
}

fn read_ims_row(
    conn: &Connection,
    id: ImsId,
    include_deleted: bool,
) -> Result<Option<ImsRow>, ImsError> {
    let sql = if include_deleted {
        format!("SELECT {IMS_COLUMNS} FROM ims WHERE id = ?1")
    } else {
        format!("SELECT {IMS_COLUMNS} FROM ims WHERE id = ?1 AND deleted_at IS NULL")
    };

    conn.query_row(&sql, params![id.to_string()], ims_row_from)
        .optional()
        .map_err(|err| storage("failed to read ims record", err))
}

fn tags_for_ims(conn: &Connection, ims_id: ImsId) -> Result<Vec<Tag>, ImsError> {
    let mut stmt = conn
        .prepare(
            "SELECT t.id, t.name, t.color, t.created_at
             FROM tags t JOIN ims_tags it ON it.tag_id = t.id
             WHERE it.ims_id = ?1 ORDER BY t.name ASC",
        )
        .map_err(|err| storage("failed to prepare tag lookup", err))?;
    let rows = stmt
        .query_map(params![ims_id.to_string()], tag_from)
        .map_err(|err| storage("failed to query tag links", err))?;
    collect_rows(rows, "failed to read linked tag")
}

fn hydrate_ims(conn: &Connection, row: ImsRow) -> Result<Ims, ImsError> {
    let created_by = user_summary(conn, row.created_by)?.ok_or_else(|| {
        ImsError::Storage(format!("creator {} is missing for IMS {}", row.created_by, row.id))
    })?;
    let analyst = match row.analyst_id {
        Some(analyst_id) => user_summary(conn, analyst_id)?,
        None => None,
    };
    let tags = tags_for_ims(conn, row.id)?;

    Ok(Ims {
        id: row.id,
        ccd_id: row.ccd_id,
        report_name: row.report_name,
        description: row.description,
        date: row.date,
        link_opencti: row.link_opencti,
        link_docintel: row.link_docintel,
        comments: row.comments,
        status: row.status,
        priority: row.priority,
        analyst,
        created_by,
        tags,
        deleted_at: row.deleted_at,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn require_ims(conn: &Connection, id: ImsId, include_deleted: bool) -> Result<Ims, ImsError> {
    let row = read_ims_row(conn, id, include_deleted)?.ok_or_else(|| not_found_ims(id))?;
    hydrate_ims(conn, row)
}

fn merge_items_for(conn: &Connection, id: MergeId) -> Result<Vec<MergeItemSummary>, ImsError> {
    let mut stmt = conn
        .prepare(
            "SELECT mi.ims_id, i.ccd_num, i.report_name, i.status
             FROM merge_items mi JOIN ims i ON i.id = mi.ims_id
             WHERE mi.merge_id = ?1 ORDER BY i.ccd_num ASC",
        )
        .map_err(|err| storage("failed to prepare merge items", err))?;
    let rows = stmt
        .query_map(params![id.to_string()], |row| {
            let ims_text: String = row.get(0)?;
            let ims_id =
                ImsId::parse(&ims_text).map_err(|err| column_decode(0, err.to_string()))?;
            let ccd_id = decode_ccd(1, row.get(1)?)?;
            let status_text: String = row.get(3)?;
            let status = ImsStatus::parse(&status_text)
                .ok_or_else(|| column_decode(3, format!("unknown status {status_text:?}")))?;
            Ok(MergeItemSummary {
                ims_id,
                ccd_id,
                report_name: row.get(2)?,
                status,
            })
        })
        .map_err(|err| storage("failed to query merge items", err))?;
    collect_rows(rows, "failed to read merge item")
}

fn hydrate_merge(conn: &Connection, row: MergeRow) -> Result<Merge, ImsError> {
    let created_by = user_summary(conn, row.created_by)?.ok_or_else(|| {
        ImsError::Storage(format!(
            "creator {} is missing for merge {}",
            row.created_by, row.id
        ))
    })?;
    let items = merge_items_for(conn, row.id)?;

    Ok(Merge {
        id: row.id,
        merge_name: row.merge_name,
        description: row.description,
        reason: row.reason,
        created_by,
        merged_at: row.merged_at,
        unmerged_at: row.unmerged_at,
        items,
    })
}

fn require_merge(conn: &Connection, id: MergeId) -> Result<Merge, ImsError> {
    let sql = format!("SELECT {MERGE_COLUMNS} FROM merges WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.to_string()], merge_row_from)
        .optional()
        .map_err(|err| storage("failed to read merge", err))?
        .ok_or_else(|| ImsError::NotFound(format!("merge {id} does not exist")))?;
    hydrate_merge(conn, row)
}

fn append_history(
    conn: &Connection,
    ims_id: ImsId,
    action: HistoryAction,
    changes: &Value,
    at: &str,
) -> Result<(), ImsError> {
    let payload =
        serde_json::to_string(changes).map_err(|err| ImsError::Storage(err.to_string()))?;
    conn.execute(
        "INSERT INTO ims_history(ims_id, action, changes_json, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![ims_id.to_string(), action.as_str(), payload, at],
    )
    .map_err(|err| storage("failed to append history", err))?;
    Ok(())
}

fn append_assignment(
    conn: &Connection,
    ims_id: ImsId,
    analyst_id: UserId,
    at: &str,
) -> Result<(), ImsError> {
    conn.execute(
        "INSERT INTO assignment_history(ims_id, analyst_id, assigned_at)
         VALUES (?1, ?2, ?3)",
        params![ims_id.to_string(), analyst_id.to_string(), at],
    )
    .map_err(|err| storage("failed to append assignment", err))?;
    Ok(())
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    #![allow(clippy::manual_let_else, clippy::float_cmp, clippy::too_many_lines)]

    use super::*;
    use ims_core::{SortField, SortOrder};
    use proptest::prelude::*;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteImsStore {
        let store = must(SqliteImsStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_user(store: &SqliteImsStore, email: &str, role: Role) -> User {
        must(store.create_user(&CreateUserInput {
            email: email.to_string(),
            full_name: format!("User {email}"),
            role,
        }))
    }

    fn report_input(name: &str) -> CreateImsInput {
        CreateImsInput {
            report_name: name.to_string(),
            description: format!("Investigation notes for {name}"),
            ..CreateImsInput::default()
        }
    }

    fn explicit_input(name: &str, ccd: u64) -> CreateImsInput {
        CreateImsInput {
            ccd_id: CcdId::from_number(ccd),
            ..report_input(name)
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = must(SqliteImsStore::open(Path::new(":memory:")));
        must(store.migrate());
        must(store.migrate());
        assert_eq!(must(store.count_users()), 0);
    }

    #[test]
    fn ccd_ids_are_sequential_from_one() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);

        for expected in 1..=3_u64 {
            let record = must(store.create_ims(&report_input("campaign"), admin.id));
            assert_eq!(record.ccd_id.number(), expected);
        }
    }

    #[test]
    fn explicit_ccd_advances_sequence() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);

        let explicit = must(store.create_ims(&explicit_input("claimed", 7), admin.id));
        assert_eq!(explicit.ccd_id.to_string(), "CCD-7");

        let auto = must(store.create_ims(&report_input("next"), admin.id));
        assert_eq!(auto.ccd_id.to_string(), "CCD-8");
    }

    #[test]
    fn duplicate_explicit_ccd_is_a_conflict() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);

        must(store.create_ims(&explicit_input("first", 5), admin.id));
        let err = match store.create_ims(&explicit_input("second", 5), admin.id) {
            Err(err) => err,
            Ok(_) => panic!("expected conflict"),
        };
        assert!(matches!(err, ImsError::Conflict(_)));
    }

    #[test]
    fn create_rejects_dangling_references() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);

        let mut input = report_input("dangling analyst");
        input.analyst_id = Some(UserId::generate());
        assert!(matches!(
            store.create_ims(&input, admin.id),
            Err(ImsError::Validation(_))
        ));

        let mut input = report_input("dangling tag");
        input.tag_ids = Some(vec![TagId::generate()]);
        assert!(matches!(
            store.create_ims(&input, admin.id),
            Err(ImsError::Validation(_))
        ));
    }

    #[test]
    fn soft_delete_hides_record_until_restore() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let record = must(store.create_ims(&report_input("ephemeral"), admin.id));

        must(store.soft_delete_ims(record.id));

        assert!(matches!(store.get_ims(record.id), Err(ImsError::NotFound(_))));
        let page = must(store.list_ims(&ImsFilter::default()));
        assert_eq!(page.total, 0);

        let restored = must(store.restore_ims(record.id));
        assert!(restored.deleted_at.is_none());
        assert_eq!(must(store.list_ims(&ImsFilter::default())).total, 1);
    }

    #[test]
    fn delete_of_missing_or_deleted_record_is_not_found() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let record = must(store.create_ims(&report_input("once"), admin.id));

        must(store.soft_delete_ims(record.id));
        assert!(matches!(
            store.soft_delete_ims(record.id),
            Err(ImsError::NotFound(_))
        ));
        assert!(matches!(
            store.soft_delete_ims(ImsId::generate()),
            Err(ImsError::NotFound(_))
        ));
    }

    #[test]
    fn restore_of_unknown_id_is_not_found_but_active_record_is_harmless() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let record = must(store.create_ims(&report_input("still here"), admin.id));

        assert!(matches!(
            store.restore_ims(ImsId::generate()),
            Err(ImsError::NotFound(_))
        ));

        let restored = must(store.restore_ims(record.id));
        assert!(restored.deleted_at.is_none());
        let history = must(store.ims_history(record.id));
        assert_eq!(history[0].action, HistoryAction::Restored);
    }

    #[test]
    fn update_replaces_tag_set_entirely() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let red = must(store.create_tag(&CreateTagInput {
            name: "apt".to_string(),
            color: None,
        }));
        let blue = must(store.create_tag(&CreateTagInput {
            name: "botnet".to_string(),
            color: None,
        }));

        let mut input = report_input("tagged");
        input.tag_ids = Some(vec![red.id]);
        let record = must(store.create_ims(&input, admin.id));
        assert_eq!(record.tags.len(), 1);
        assert_eq!(record.tags[0].name, "apt");

        let updated = must(store.update_ims(
            record.id,
            &UpdateImsInput {
                tag_ids: Some(vec![blue.id]),
                ..UpdateImsInput::default()
            },
        ));
        assert_eq!(updated.tags.len(), 1);
        assert_eq!(updated.tags[0].name, "botnet");
    }

    #[test]
    fn assignment_history_is_appended_only_on_change() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let analyst = fixture_user(&store, "analyst@example.com", Role::Analyst);

        let mut input = report_input("assigned");
        input.analyst_id = Some(analyst.id);
        let record = must(store.create_ims(&input, admin.id));
        assert_eq!(must(store.assignment_history(record.id)).len(), 1);

        // Same analyst again: no new row.
        must(store.update_ims(
            record.id,
            &UpdateImsInput {
                analyst_id: Some(analyst.id),
                ..UpdateImsInput::default()
            },
        ));
        assert_eq!(must(store.assignment_history(record.id)).len(), 1);

        let other = fixture_user(&store, "other@example.com", Role::Analyst);
        must(store.update_ims(
            record.id,
            &UpdateImsInput {
                analyst_id: Some(other.id),
                ..UpdateImsInput::default()
            },
        ));
        let entries = must(store.assignment_history(record.id));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].analyst.id, other.id);
    }

    #[test]
    fn update_of_soft_deleted_record_is_not_found() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let record = must(store.create_ims(&report_input("gone"), admin.id));
        must(store.soft_delete_ims(record.id));

        let result = store.update_ims(
            record.id,
            &UpdateImsInput {
                status: Some(ImsStatus::Completed),
                ..UpdateImsInput::default()
            },
        );
        assert!(matches!(result, Err(ImsError::NotFound(_))));
    }

    #[test]
    fn listing_filters_and_paginates() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);

        let mut urgent = report_input("forged documents");
        urgent.priority = Some(Priority::Urgent);
        urgent.status = Some(ImsStatus::InProgress);
        must(store.create_ims(&urgent, admin.id));
        must(store.create_ims(&report_input("bot amplification"), admin.id));
        must(store.create_ims(&report_input("persona network"), admin.id));

        let by_priority = must(store.list_ims(&ImsFilter {
            priority: Some(Priority::Urgent),
            ..ImsFilter::default()
        }));
        assert_eq!(by_priority.total, 1);
        assert_eq!(by_priority.items[0].report_name, "forged documents");

        let by_status = must(store.list_ims(&ImsFilter {
            status: Some(ImsStatus::Draft),
            ..ImsFilter::default()
        }));
        assert_eq!(by_status.total, 2);

        let paged = must(store.list_ims(&ImsFilter {
            limit: 2,
            ..ImsFilter::default()
        }));
        assert_eq!(paged.items.len(), 2);
        assert_eq!(paged.total, 3);
        assert_eq!(paged.total_pages, 2);

        let second = must(store.list_ims(&ImsFilter {
            page: 2,
            limit: 2,
            ..ImsFilter::default()
        }));
        assert_eq!(second.items.len(), 1);
    }

    #[test]
    fn search_matches_ccd_name_and_description() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        must(store.create_ims(&report_input("Forged Ministry Letter"), admin.id));
        must(store.create_ims(&report_input("Bot amplification"), admin.id));

        let by_name = must(store.list_ims(&ImsFilter {
            search: Some("forged".to_string()),
            ..ImsFilter::default()
        }));
        assert_eq!(by_name.total, 1);

        let by_ccd = must(store.list_ims(&ImsFilter {
            search: Some("CCD-2".to_string()),
            ..ImsFilter::default()
        }));
        assert_eq!(by_ccd.total, 1);
        assert_eq!(by_ccd.items[0].report_name, "Bot amplification");

        let by_description = must(store.list_ims(&ImsFilter {
            search: Some("notes for bot".to_string()),
            ..ImsFilter::default()
        }));
        assert_eq!(by_description.total, 1);
    }

    #[test]
    fn ccd_sort_is_numeric() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        must(store.create_ims(&explicit_input("ten", 10), admin.id));
        must(store.create_ims(&explicit_input("nine", 9), admin.id));

        let page = must(store.list_ims(&ImsFilter {
            sort_by: SortField::CcdId,
            sort_order: SortOrder::Asc,
            ..ImsFilter::default()
        }));
        let ccds: Vec<String> = page
            .items
            .iter()
            .map(|item| item.ccd_id.to_string())
            .collect();
        assert_eq!(ccds, vec!["CCD-9".to_string(), "CCD-10".to_string()]);
    }

    #[test]
    fn history_orders_newest_first() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let record = must(store.create_ims(&report_input("lifecycle"), admin.id));

        must(store.update_ims(
            record.id,
            &UpdateImsInput {
                status: Some(ImsStatus::InProgress),
                ..UpdateImsInput::default()
            },
        ));
        must(store.soft_delete_ims(record.id));
        must(store.restore_ims(record.id));

        let actions: Vec<HistoryAction> = must(store.ims_history(record.id))
            .into_iter()
            .map(|entry| entry.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                HistoryAction::Restored,
                HistoryAction::Deleted,
                HistoryAction::Updated,
                HistoryAction::Created,
            ]
        );
    }

    #[test]
    fn append_only_triggers_block_mutation() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let record = must(store.create_ims(&report_input("protected"), admin.id));

        let update = store.connection().execute(
            "UPDATE ims_history SET action = 'updated' WHERE ims_id = ?1",
            params![record.id.to_string()],
        );
        assert!(update.is_err());

        let delete = store
            .connection()
            .execute("DELETE FROM ims_history", []);
        assert!(delete.is_err());
    }

    #[test]
    fn merge_requires_existing_active_members_and_leaves_no_rows_on_failure() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let real = must(store.create_ims(&report_input("real"), admin.id));

        let result = store.create_merge(
            &CreateMergeInput {
                merge_name: "half ghost".to_string(),
                description: None,
                reason: None,
                ims_ids: vec![real.id, ImsId::generate()],
            },
            admin.id,
        );
        assert!(matches!(result, Err(ImsError::Validation(_))));

        assert!(must(store.merge_history()).is_empty());
        assert_eq!(must(store.get_ims(real.id)).status, ImsStatus::Draft);
        assert!(must(store.ims_history(real.id))
            .iter()
            .all(|entry| entry.action != HistoryAction::Merged));
    }

    #[test]
    fn merge_rejects_members_of_an_active_merge() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let a = must(store.create_ims(&report_input("a"), admin.id));
        let b = must(store.create_ims(&report_input("b"), admin.id));
        let c = must(store.create_ims(&report_input("c"), admin.id));

        must(store.create_merge(
            &CreateMergeInput {
                merge_name: "first".to_string(),
                description: None,
                reason: None,
                ims_ids: vec![a.id, b.id],
            },
            admin.id,
        ));

        let result = store.create_merge(
            &CreateMergeInput {
                merge_name: "second".to_string(),
                description: None,
                reason: None,
                ims_ids: vec![b.id, c.id],
            },
            admin.id,
        );
        assert!(matches!(result, Err(ImsError::Validation(_))));
    }

    #[test]
    fn merge_marks_members_and_logs_history() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let a = must(store.create_ims(&report_input("a"), admin.id));
        let b = must(store.create_ims(&report_input("b"), admin.id));

        let merge = must(store.create_merge(
            &CreateMergeInput {
                merge_name: "combined".to_string(),
                description: Some("same operator".to_string()),
                reason: Some("shared infrastructure".to_string()),
                ims_ids: vec![a.id, b.id],
            },
            admin.id,
        ));

        assert!(merge.is_active());
        assert_eq!(merge.items.len(), 2);
        assert_eq!(must(store.get_ims(a.id)).status, ImsStatus::Merged);

        let newest = &must(store.ims_history(a.id))[0];
        assert_eq!(newest.action, HistoryAction::Merged);
        assert_eq!(
            newest.changes.get("merge_name"),
            Some(&Value::String("combined".to_string()))
        );

        assert_eq!(must(store.list_active_merges()).len(), 1);
    }

    #[test]
    fn unmerge_reverts_members_and_is_not_repeatable() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let a = must(store.create_ims(&report_input("a"), admin.id));
        let b = must(store.create_ims(&report_input("b"), admin.id));

        let merge = must(store.create_merge(
            &CreateMergeInput {
                merge_name: "combined".to_string(),
                description: None,
                reason: None,
                ims_ids: vec![a.id, b.id],
            },
            admin.id,
        ));

        let closed = must(store.unmerge(merge.id));
        assert!(!closed.is_active());
        assert_eq!(must(store.get_ims(a.id)).status, ImsStatus::InProgress);
        assert_eq!(must(store.get_ims(b.id)).status, ImsStatus::InProgress);
        assert!(must(store.list_active_merges()).is_empty());
        assert_eq!(must(store.merge_history()).len(), 1);

        // Every member gets its own unmerged history row.
        for member in [a.id, b.id] {
            let newest = &must(store.ims_history(member))[0];
            assert_eq!(newest.action, HistoryAction::Unmerged);
        }

        assert!(matches!(store.unmerge(merge.id), Err(ImsError::State(_))));
    }

    #[test]
    fn remove_merge_requires_closed_state() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let a = must(store.create_ims(&report_input("a"), admin.id));
        let b = must(store.create_ims(&report_input("b"), admin.id));

        let merge = must(store.create_merge(
            &CreateMergeInput {
                merge_name: "combined".to_string(),
                description: None,
                reason: None,
                ims_ids: vec![a.id, b.id],
            },
            admin.id,
        ));

        assert!(matches!(
            store.remove_merge(merge.id),
            Err(ImsError::State(_))
        ));

        must(store.unmerge(merge.id));
        must(store.remove_merge(merge.id));
        assert!(matches!(
            store.get_merge(merge.id),
            Err(ImsError::NotFound(_))
        ));
        assert!(must(store.merge_history()).is_empty());

        // Members keep their reverted status after the record is gone.
        assert_eq!(must(store.get_ims(a.id)).status, ImsStatus::InProgress);
    }

    #[test]
    fn tag_names_are_unique() {
        let store = fixture_store();
        must(store.create_tag(&CreateTagInput {
            name: "apt".to_string(),
            color: None,
        }));
        let result = store.create_tag(&CreateTagInput {
            name: "apt".to_string(),
            color: Some("#FF0000".to_string()),
        });
        assert!(matches!(result, Err(ImsError::Conflict(_))));
    }

    #[test]
    fn tag_rename_checks_for_collisions() {
        let store = fixture_store();
        must(store.create_tag(&CreateTagInput {
            name: "apt".to_string(),
            color: None,
        }));
        let other = must(store.create_tag(&CreateTagInput {
            name: "botnet".to_string(),
            color: None,
        }));

        let result = store.update_tag(
            other.id,
            &UpdateTagInput {
                name: Some("apt".to_string()),
                color: None,
            },
        );
        assert!(matches!(result, Err(ImsError::Conflict(_))));

        let renamed = must(store.update_tag(
            other.id,
            &UpdateTagInput {
                name: Some("troll-farm".to_string()),
                color: Some("#00FF00".to_string()),
            },
        ));
        assert_eq!(renamed.name, "troll-farm");
        assert_eq!(renamed.color, "#00FF00");
    }

    #[test]
    fn delete_tag_removes_associations() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let tag = must(store.create_tag(&CreateTagInput {
            name: "apt".to_string(),
            color: None,
        }));

        let mut input = report_input("tagged");
        input.tag_ids = Some(vec![tag.id]);
        let record = must(store.create_ims(&input, admin.id));

        must(store.delete_tag(tag.id));
        assert!(matches!(store.get_tag(tag.id), Err(ImsError::NotFound(_))));
        assert!(must(store.get_ims(record.id)).tags.is_empty());
    }

    #[test]
    fn popular_tags_orders_by_usage() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let hot = must(store.create_tag(&CreateTagInput {
            name: "hot".to_string(),
            color: None,
        }));
        let cold = must(store.create_tag(&CreateTagInput {
            name: "cold".to_string(),
            color: None,
        }));

        for name in ["one", "two"] {
            let mut input = report_input(name);
            input.tag_ids = Some(vec![hot.id]);
            must(store.create_ims(&input, admin.id));
        }
        let mut input = report_input("three");
        input.tag_ids = Some(vec![cold.id]);
        must(store.create_ims(&input, admin.id));

        let top = must(store.popular_tags(10));
        assert_eq!(top[0].name, "hot");
        assert_eq!(top[0].usage, 2);
        assert_eq!(top[1].name, "cold");
        assert_eq!(top[1].usage, 1);
    }

    #[test]
    fn user_emails_are_unique() {
        let store = fixture_store();
        fixture_user(&store, "dup@example.com", Role::Viewer);
        let result = store.create_user(&CreateUserInput {
            email: "dup@example.com".to_string(),
            full_name: "Second".to_string(),
            role: Role::Admin,
        });
        assert!(matches!(result, Err(ImsError::Conflict(_))));
    }

    #[test]
    fn dashboard_overview_counts() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let analyst = fixture_user(&store, "analyst@example.com", Role::Analyst);
        must(store.create_tag(&CreateTagInput {
            name: "apt".to_string(),
            color: None,
        }));

        let mut assigned = report_input("assigned");
        assigned.analyst_id = Some(analyst.id);
        must(store.create_ims(&assigned, admin.id));
        must(store.create_ims(&report_input("unassigned"), admin.id));
        let deleted = must(store.create_ims(&report_input("deleted"), admin.id));
        must(store.soft_delete_ims(deleted.id));

        let stats = must(store.dashboard_stats());
        assert_eq!(stats.overview.total_ims, 2);
        assert_eq!(stats.overview.total_analysts, 1);
        assert_eq!(stats.overview.total_tags, 1);
        assert_eq!(stats.overview.active_merges, 0);
        assert_eq!(stats.overview.unassigned_ims, 1);
        assert_eq!(stats.recent_ims.len(), 2);
        assert!(stats
            .recent_ims
            .iter()
            .all(|item| item.id != deleted.id));
        assert_eq!(stats.analyst_workload.len(), 1);
        assert_eq!(stats.analyst_workload[0].active_ims, 1);
    }

    #[test]
    fn analyst_stats_reports_completion_rate() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        let analyst = fixture_user(&store, "analyst@example.com", Role::Analyst);

        for (name, status) in [
            ("done-1", ImsStatus::Completed),
            ("done-2", ImsStatus::Completed),
            ("open-1", ImsStatus::InProgress),
            ("open-2", ImsStatus::Draft),
        ] {
            let mut input = report_input(name);
            input.analyst_id = Some(analyst.id);
            input.status = Some(status);
            must(store.create_ims(&input, admin.id));
        }

        let stats = must(store.analyst_stats(analyst.id));
        assert_eq!(stats.total_assigned, 4);
        assert_eq!(stats.completion_rate, 50.0);
        assert_eq!(stats.recent_activity.len(), 4);

        assert!(matches!(
            store.analyst_stats(UserId::generate()),
            Err(ImsError::NotFound(_))
        ));
    }

    #[test]
    fn timeline_counts_recent_creations_only() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);
        must(store.create_ims(&report_input("one"), admin.id));
        must(store.create_ims(&report_input("two"), admin.id));
        let deleted = must(store.create_ims(&report_input("gone"), admin.id));
        must(store.soft_delete_ims(deleted.id));

        let timeline = must(store.dashboard_timeline(7));
        assert_eq!(timeline.period, "Last 7 days");
        let total: u64 = timeline.data.iter().map(|point| point.count).sum();
        assert_eq!(total, 2);
        assert!(!timeline.data.is_empty());
    }

    #[test]
    fn trends_split_counts_at_the_window_cutoff() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);

        let mut done = report_input("done");
        done.status = Some(ImsStatus::Completed);
        must(store.create_ims(&done, admin.id));
        must(store.create_ims(&report_input("open"), admin.id));
        let deleted = must(store.create_ims(&report_input("gone"), admin.id));
        must(store.soft_delete_ims(deleted.id));

        let trends = must(store.dashboard_trends());
        assert_eq!(trends.creation.current, 2);
        assert_eq!(trends.creation.previous, 0);
        assert_eq!(trends.creation.percentage_change, 0.0);
        assert_eq!(trends.completion.current, 1);
        assert_eq!(trends.completion.previous, 0);
    }

    #[test]
    fn trend_percentage_is_relative_to_the_previous_window() {
        let grown = trend_window(3, 2);
        assert_eq!(grown.percentage_change, 50.0);

        let shrunk = trend_window(1, 2);
        assert_eq!(shrunk.percentage_change, -50.0);

        let no_baseline = trend_window(4, 0);
        assert_eq!(no_baseline.percentage_change, 0.0);
    }

    #[test]
    fn full_lifecycle_round_trip() {
        let mut store = fixture_store();
        let admin = fixture_user(&store, "admin@example.com", Role::Admin);

        let a = must(store.create_ims(&report_input("first"), admin.id));
        let b = must(store.create_ims(&report_input("second"), admin.id));
        assert_eq!(a.ccd_id.to_string(), "CCD-1");
        assert_eq!(b.ccd_id.to_string(), "CCD-2");

        let merge = must(store.create_merge(
            &CreateMergeInput {
                merge_name: "joint".to_string(),
                description: None,
                reason: None,
                ims_ids: vec![a.id, b.id],
            },
            admin.id,
        ));
        assert_eq!(must(store.get_ims(a.id)).status, ImsStatus::Merged);

        must(store.unmerge(merge.id));
        must(store.remove_merge(merge.id));

        assert_eq!(must(store.get_ims(a.id)).status, ImsStatus::InProgress);
        assert_eq!(must(store.get_ims(b.id)).status, ImsStatus::InProgress);
        assert_eq!(must(store.list_ims(&ImsFilter::default())).total, 2);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn auto_assigned_ccd_ids_are_gapless(count in 1_u64..6) {
            let mut store = fixture_store();
            let admin = fixture_user(&store, "admin@example.com", Role::Admin);

            for expected in 1..=count {
                let record = must(store.create_ims(&report_input("generated"), admin.id));
                prop_assert_eq!(record.ccd_id.number(), expected);
            }
        }
    }
}
