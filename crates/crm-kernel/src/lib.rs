//! Sqlite persistence for the CRM core.
//!
//! The kernel owns the schema and all row access. Mutating lifecycle
//! operations are exposed as composite transactional calls whose
//! guarded UPDATEs re-assert the domain preconditions in their WHERE
//! clause; a concurrent mutation that invalidated a precondition shows
//! up as zero affected rows and is reported as `None` so the caller
//! can surface a conflict. Soft deletion is a nullable `deleted`
//! timestamp, preserved on restore-capable rows.

use anyhow::Result;
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crm_protocol::{
    Activity, ActivityListQuery, ActivityType, Customer, Lead, LeadStatus, ListQuery, PageMeta,
    Paginated, Role, SortOrder, User,
};

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

/// Insert payload for a lead; status always starts at `new`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewLead {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub owner_id: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LeadPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewCustomer {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    pub owner_id: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CustomerPatch {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewActivity {
    pub kind: ActivityType,
    pub note: Option<String>,
    pub when_at: Option<String>,
    pub owner_id: i64,
    pub lead_id: Option<i64>,
    pub customer_id: Option<i64>,
}

/// Rebind target for an activity patch; setting one side clears the
/// other, preserving the exactly-one-target rule.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub enum ActivityTarget {
    Lead(i64),
    Customer(i64),
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ActivityPatch {
    pub kind: Option<ActivityType>,
    pub note: Option<String>,
    pub when_at: Option<String>,
    pub target: Option<ActivityTarget>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewUser {
    pub email: String,
    pub role: Role,
    pub token_sha256: Option<String>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("crm.sqlite");
        let conn = Connection::open(&db_path)?;
        // Pragmas tuned for async server usage
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Busy timeout (default 5000ms; override with CRM_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("CRM_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        tracing::debug!(path = %db_path.display(), busy_ms, "kernel opened");
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS leads (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              email TEXT,
              phone TEXT,
              notes TEXT,
              status TEXT NOT NULL DEFAULT 'new',
              owner_id INTEGER NOT NULL,
              converted_at TEXT,
              customer_id INTEGER,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              deleted TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);
            CREATE INDEX IF NOT EXISTS idx_leads_owner ON leads(owner_id);
            CREATE INDEX IF NOT EXISTS idx_leads_customer ON leads(customer_id);

            CREATE TABLE IF NOT EXISTS customers (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              name TEXT NOT NULL,
              email TEXT,
              phone TEXT,
              company TEXT,
              owner_id INTEGER NOT NULL,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              deleted TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_customers_owner ON customers(owner_id);

            -- Audit log: append-only aside from soft-delete/restore
            CREATE TABLE IF NOT EXISTS activities (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              kind TEXT NOT NULL,
              note TEXT,
              when_at TEXT,
              owner_id INTEGER NOT NULL,
              lead_id INTEGER,
              customer_id INTEGER,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              deleted TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_activities_kind ON activities(kind);
            CREATE INDEX IF NOT EXISTS idx_activities_lead ON activities(lead_id);
            CREATE INDEX IF NOT EXISTS idx_activities_customer ON activities(customer_id);

            CREATE TABLE IF NOT EXISTS users (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              email TEXT NOT NULL UNIQUE,
              role TEXT NOT NULL DEFAULT 'user',
              token_sha256 TEXT UNIQUE,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              deleted TEXT
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // -------- Leads --------

    pub fn insert_lead(&self, new: &NewLead) -> Result<Lead> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute(
            "INSERT INTO leads(name,email,phone,notes,status,owner_id,created,updated) VALUES(?,?,?,?,?,?,?,?)",
            params![
                new.name,
                new.email,
                new.phone,
                new.notes,
                LeadStatus::New.as_str(),
                new.owner_id,
                ts,
                ts
            ],
        )?;
        let id = conn.last_insert_rowid();
        get_lead_in(&conn, id, false)?
            .ok_or_else(|| anyhow::anyhow!("lead #{id} vanished after insert"))
    }

    pub fn get_lead(&self, id: i64, include_deleted: bool) -> Result<Option<Lead>> {
        let conn = self.conn()?;
        get_lead_in(&conn, id, include_deleted)
    }

    pub fn update_lead(&self, id: i64, patch: &LeadPatch) -> Result<Option<Lead>> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE leads SET name=COALESCE(?,name), email=COALESCE(?,email), \
             phone=COALESCE(?,phone), notes=COALESCE(?,notes), updated=? \
             WHERE id=? AND deleted IS NULL",
            params![patch.name, patch.email, patch.phone, patch.notes, now(), id],
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_lead_in(&conn, id, false)
    }

    pub fn soft_delete_lead(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let n = conn.execute(
            "UPDATE leads SET deleted=?, updated=? WHERE id=? AND deleted IS NULL",
            params![ts, ts, id],
        )?;
        Ok(n > 0)
    }

    pub fn restore_lead(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE leads SET deleted=NULL, updated=? WHERE id=? AND deleted IS NOT NULL",
            params![now(), id],
        )?;
        Ok(n > 0)
    }

    pub fn list_leads(&self, query: &ListQuery) -> Result<Paginated<Lead>> {
        let conn = self.conn()?;
        let (page, limit, offset) = page_params(query);
        let sort = match query.sort.as_deref() {
            Some("name") => "name",
            Some("status") => "status",
            Some("id") => "id",
            // permissive fallback, including created/createdAt
            _ => "created",
        };
        let order = parse_order(query.order.as_deref());

        let mut where_sql = String::from("deleted IS NULL");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(q) = query.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            where_sql.push_str(
                " AND (name LIKE ? OR email LIKE ? OR phone LIKE ? OR notes LIKE ?)",
            );
            let pat = format!("%{q}%");
            for _ in 0..4 {
                args.push(Box::new(pat.clone()));
            }
        }

        let total: u64 = conn
            .prepare(&format!("SELECT COUNT(1) FROM leads WHERE {where_sql}"))?
            .query_row(params_from_iter(args.iter().map(|a| a.as_ref())), |r| {
                r.get::<_, i64>(0)
            })? as u64;

        let sql = format!(
            "SELECT id,name,email,phone,notes,status,owner_id,converted_at,customer_id,created,updated,deleted \
             FROM leads WHERE {where_sql} ORDER BY {sort} {} LIMIT ? OFFSET ?",
            order.as_sql()
        );
        args.push(Box::new(limit as i64));
        args.push(Box::new(offset));
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter().map(|a| a.as_ref())))?;
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            data.push(lead_from_row(row)?);
        }
        Ok(paginate(data, page, limit, total, sort, order))
    }

    /// Transition a live, unconverted lead from `from` to `to` and
    /// append the STATUS_CHANGED activity, atomically. The WHERE clause
    /// re-asserts the preconditions; `None` means the lead was
    /// concurrently converted, deleted, or moved off `from`.
    pub fn persist_status_change(
        &self,
        lead_id: i64,
        from: LeadStatus,
        to: LeadStatus,
        activity: &NewActivity,
    ) -> Result<Option<(Lead, Activity)>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE leads SET status=?, updated=? WHERE id=? AND deleted IS NULL \
             AND customer_id IS NULL AND status=?",
            params![to.as_str(), now(), lead_id, from.as_str()],
        )?;
        if n == 0 {
            return Ok(None);
        }
        let act = insert_activity_in(&tx, activity)?;
        let lead = get_lead_in(&tx, lead_id, false)?
            .ok_or_else(|| anyhow::anyhow!("lead #{lead_id} vanished mid-transaction"))?;
        tx.commit()?;
        Ok(Some((lead, act)))
    }

    /// Create the customer, mark the lead won/converted and append the
    /// CONVERTED activity in one transaction. The activity is built by
    /// the caller once the new customer id is known. `None` means the
    /// guard failed (lead lost, already converted, or deleted) and
    /// nothing was persisted.
    pub fn persist_conversion(
        &self,
        lead_id: i64,
        customer: &NewCustomer,
        activity: impl FnOnce(i64) -> NewActivity,
    ) -> Result<Option<(Lead, Customer, Activity)>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let ts = now();
        tx.execute(
            "INSERT INTO customers(name,email,phone,company,owner_id,created,updated) VALUES(?,?,?,?,?,?,?)",
            params![
                customer.name,
                customer.email,
                customer.phone,
                customer.company,
                customer.owner_id,
                ts,
                ts
            ],
        )?;
        let customer_id = tx.last_insert_rowid();
        let n = tx.execute(
            "UPDATE leads SET customer_id=?, status=?, converted_at=?, updated=? \
             WHERE id=? AND deleted IS NULL AND customer_id IS NULL AND status<>?",
            params![
                customer_id,
                LeadStatus::Won.as_str(),
                ts,
                ts,
                lead_id,
                LeadStatus::Lost.as_str()
            ],
        )?;
        if n == 0 {
            // Transaction drop rolls the customer insert back too.
            return Ok(None);
        }
        let act = insert_activity_in(&tx, &activity(customer_id))?;
        let lead = get_lead_in(&tx, lead_id, false)?
            .ok_or_else(|| anyhow::anyhow!("lead #{lead_id} vanished mid-transaction"))?;
        let cust = get_customer_in(&tx, customer_id, false)?
            .ok_or_else(|| anyhow::anyhow!("customer #{customer_id} vanished mid-transaction"))?;
        tx.commit()?;
        Ok(Some((lead, cust, act)))
    }

    /// Mark a live, unconverted, not-yet-lost lead as lost and append
    /// the LOST activity atomically. `None` when the guard failed.
    pub fn persist_lost(
        &self,
        lead_id: i64,
        activity: &NewActivity,
    ) -> Result<Option<(Lead, Activity)>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let n = tx.execute(
            "UPDATE leads SET status=?, updated=? WHERE id=? AND deleted IS NULL \
             AND customer_id IS NULL AND status<>?",
            params![
                LeadStatus::Lost.as_str(),
                now(),
                lead_id,
                LeadStatus::Lost.as_str()
            ],
        )?;
        if n == 0 {
            return Ok(None);
        }
        let act = insert_activity_in(&tx, activity)?;
        let lead = get_lead_in(&tx, lead_id, false)?
            .ok_or_else(|| anyhow::anyhow!("lead #{lead_id} vanished mid-transaction"))?;
        tx.commit()?;
        Ok(Some((lead, act)))
    }

    /// Repair path for already-converted leads whose status drifted:
    /// force `won` and backfill `converted_at` if unset. Touches only
    /// rows with a customer attached.
    pub fn fixup_converted_won(&self, lead_id: i64) -> Result<Option<Lead>> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute(
            "UPDATE leads SET status=?, converted_at=COALESCE(converted_at,?), updated=? \
             WHERE id=? AND deleted IS NULL AND customer_id IS NOT NULL",
            params![LeadStatus::Won.as_str(), ts, ts, lead_id],
        )?;
        get_lead_in(&conn, lead_id, false)
    }

    // -------- Customers --------

    pub fn insert_customer(&self, new: &NewCustomer) -> Result<Customer> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute(
            "INSERT INTO customers(name,email,phone,company,owner_id,created,updated) VALUES(?,?,?,?,?,?,?)",
            params![new.name, new.email, new.phone, new.company, new.owner_id, ts, ts],
        )?;
        let id = conn.last_insert_rowid();
        get_customer_in(&conn, id, false)?
            .ok_or_else(|| anyhow::anyhow!("customer #{id} vanished after insert"))
    }

    pub fn get_customer(&self, id: i64, include_deleted: bool) -> Result<Option<Customer>> {
        let conn = self.conn()?;
        get_customer_in(&conn, id, include_deleted)
    }

    pub fn update_customer(&self, id: i64, patch: &CustomerPatch) -> Result<Option<Customer>> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE customers SET name=COALESCE(?,name), email=COALESCE(?,email), \
             phone=COALESCE(?,phone), company=COALESCE(?,company), updated=? \
             WHERE id=? AND deleted IS NULL",
            params![patch.name, patch.email, patch.phone, patch.company, now(), id],
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_customer_in(&conn, id, false)
    }

    pub fn soft_delete_customer(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let n = conn.execute(
            "UPDATE customers SET deleted=?, updated=? WHERE id=? AND deleted IS NULL",
            params![ts, ts, id],
        )?;
        Ok(n > 0)
    }

    pub fn restore_customer(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE customers SET deleted=NULL, updated=? WHERE id=? AND deleted IS NOT NULL",
            params![now(), id],
        )?;
        Ok(n > 0)
    }

    pub fn list_customers(&self, query: &ListQuery) -> Result<Paginated<Customer>> {
        let conn = self.conn()?;
        let (page, limit, offset) = page_params(query);
        let sort = match query.sort.as_deref() {
            Some("name") => "name",
            Some("id") => "id",
            _ => "created",
        };
        let order = parse_order(query.order.as_deref());

        let mut where_sql = String::from("deleted IS NULL");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(q) = query.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            where_sql.push_str(
                " AND (name LIKE ? OR email LIKE ? OR phone LIKE ? OR company LIKE ?)",
            );
            let pat = format!("%{q}%");
            for _ in 0..4 {
                args.push(Box::new(pat.clone()));
            }
        }

        let total: u64 = conn
            .prepare(&format!("SELECT COUNT(1) FROM customers WHERE {where_sql}"))?
            .query_row(params_from_iter(args.iter().map(|a| a.as_ref())), |r| {
                r.get::<_, i64>(0)
            })? as u64;

        let sql = format!(
            "SELECT id,name,email,phone,company,owner_id,created,updated,deleted \
             FROM customers WHERE {where_sql} ORDER BY {sort} {} LIMIT ? OFFSET ?",
            order.as_sql()
        );
        args.push(Box::new(limit as i64));
        args.push(Box::new(offset));
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter().map(|a| a.as_ref())))?;
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            data.push(customer_from_row(row)?);
        }
        Ok(paginate(data, page, limit, total, sort, order))
    }

    // -------- Activities --------

    pub fn append_activity(&self, new: &NewActivity) -> Result<Activity> {
        let conn = self.conn()?;
        insert_activity_in(&conn, new)
    }

    pub fn get_activity(&self, id: i64, include_deleted: bool) -> Result<Option<Activity>> {
        let conn = self.conn()?;
        get_activity_in(&conn, id, include_deleted)
    }

    pub fn update_activity(&self, id: i64, patch: &ActivityPatch) -> Result<Option<Activity>> {
        let conn = self.conn()?;
        let mut sets = String::from("updated=?");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(now())];
        if let Some(kind) = patch.kind {
            sets.push_str(", kind=?");
            args.push(Box::new(kind.as_str()));
        }
        if let Some(note) = patch.note.as_deref() {
            sets.push_str(", note=?");
            args.push(Box::new(note.to_string()));
        }
        if let Some(when_at) = patch.when_at.as_deref() {
            sets.push_str(", when_at=?");
            args.push(Box::new(when_at.to_string()));
        }
        match patch.target {
            Some(ActivityTarget::Lead(lead_id)) => {
                sets.push_str(", lead_id=?, customer_id=NULL");
                args.push(Box::new(lead_id));
            }
            Some(ActivityTarget::Customer(customer_id)) => {
                sets.push_str(", customer_id=?, lead_id=NULL");
                args.push(Box::new(customer_id));
            }
            None => {}
        }
        args.push(Box::new(id));
        let n = conn.execute(
            &format!("UPDATE activities SET {sets} WHERE id=? AND deleted IS NULL"),
            params_from_iter(args.iter().map(|a| a.as_ref())),
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_activity_in(&conn, id, false)
    }

    pub fn soft_delete_activity(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let ts = now();
        let n = conn.execute(
            "UPDATE activities SET deleted=?, updated=? WHERE id=? AND deleted IS NULL",
            params![ts, ts, id],
        )?;
        Ok(n > 0)
    }

    pub fn restore_activity(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE activities SET deleted=NULL, updated=? WHERE id=? AND deleted IS NOT NULL",
            params![now(), id],
        )?;
        Ok(n > 0)
    }

    pub fn list_activities(&self, query: &ActivityListQuery) -> Result<Paginated<Activity>> {
        let conn = self.conn()?;
        let (page, limit, offset) = page_params(&ListQuery {
            q: query.q.clone(),
            page: query.page,
            limit: query.limit,
            sort: None,
            order: None,
        });
        let sort = match query.sort.as_deref() {
            Some("when") | Some("when_at") => "when_at",
            Some("type") => "kind",
            _ => "created",
        };
        let order = parse_order(query.order.as_deref());

        let mut where_sql = String::from("deleted IS NULL");
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();
        if let Some(q) = query.q.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            where_sql.push_str(" AND note LIKE ?");
            args.push(Box::new(format!("%{q}%")));
        }
        if let Some(kind) = query.kind {
            where_sql.push_str(" AND kind=?");
            args.push(Box::new(kind.as_str()));
        }
        if let Some(lead_id) = query.lead_id {
            where_sql.push_str(" AND lead_id=?");
            args.push(Box::new(lead_id));
        }
        if let Some(customer_id) = query.customer_id {
            where_sql.push_str(" AND customer_id=?");
            args.push(Box::new(customer_id));
        }
        // Date range bounds the logical event time, not row creation.
        if let Some(from) = query.from.as_deref() {
            where_sql.push_str(" AND when_at>=?");
            args.push(Box::new(from.to_string()));
        }
        if let Some(to) = query.to.as_deref() {
            where_sql.push_str(" AND when_at<=?");
            args.push(Box::new(to.to_string()));
        }

        let total: u64 = conn
            .prepare(&format!("SELECT COUNT(1) FROM activities WHERE {where_sql}"))?
            .query_row(params_from_iter(args.iter().map(|a| a.as_ref())), |r| {
                r.get::<_, i64>(0)
            })? as u64;

        let sql = format!(
            "SELECT id,kind,note,when_at,owner_id,lead_id,customer_id,created,updated,deleted \
             FROM activities WHERE {where_sql} ORDER BY {sort} {} LIMIT ? OFFSET ?",
            order.as_sql()
        );
        args.push(Box::new(limit as i64));
        args.push(Box::new(offset));
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter().map(|a| a.as_ref())))?;
        let mut data = Vec::new();
        while let Some(row) = rows.next()? {
            data.push(activity_from_row(row)?);
        }
        // Report the caller-facing sort key, not the column name.
        let sort_key = match sort {
            "when_at" => "when",
            "kind" => "type",
            other => other,
        };
        Ok(paginate(data, page, limit, total, sort_key, order))
    }

    /// Count of STATUS-style activities attached to a lead; used by
    /// idempotency tests and admin dashboards.
    pub fn count_activities_for_lead(&self, lead_id: i64, kind: ActivityType) -> Result<i64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .prepare("SELECT COUNT(1) FROM activities WHERE lead_id=? AND kind=? AND deleted IS NULL")?
            .query_row(params![lead_id, kind.as_str()], |r| r.get(0))?;
        Ok(n)
    }

    // -------- Users --------

    pub fn insert_user(&self, new: &NewUser) -> Result<User> {
        let conn = self.conn()?;
        let ts = now();
        conn.execute(
            "INSERT INTO users(email,role,token_sha256,created,updated) VALUES(?,?,?,?,?)",
            params![new.email, new.role.as_str(), new.token_sha256, ts, ts],
        )?;
        let id = conn.last_insert_rowid();
        get_user_in(&conn, id)?.ok_or_else(|| anyhow::anyhow!("user #{id} vanished after insert"))
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let conn = self.conn()?;
        get_user_in(&conn, id)
    }

    pub fn find_user_by_token(&self, fingerprint: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,email,role,created,updated,deleted FROM users \
             WHERE token_sha256=? AND deleted IS NULL LIMIT 1",
        )?;
        let user = stmt
            .query_row([fingerprint], user_from_row)
            .optional()?;
        Ok(user)
    }

    pub fn list_users(&self, limit: i64) -> Result<Vec<User>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,email,role,created,updated,deleted FROM users \
             WHERE deleted IS NULL ORDER BY id ASC LIMIT ?",
        )?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(user_from_row(row)?);
        }
        Ok(out)
    }

    pub fn set_user_role(&self, id: i64, role: Role) -> Result<Option<User>> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE users SET role=?, updated=? WHERE id=? AND deleted IS NULL",
            params![role.as_str(), now(), id],
        )?;
        if n == 0 {
            return Ok(None);
        }
        get_user_in(&conn, id)
    }
}

// -------- Row mapping / shared helpers --------

fn page_params(query: &ListQuery) -> (u32, u32, i64) {
    let page = query.page.unwrap_or(1).max(1);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = (page as i64 - 1) * limit as i64;
    (page, limit, offset)
}

fn parse_order(raw: Option<&str>) -> SortOrder {
    // Everything that is not exactly ASC sorts descending.
    match raw {
        Some("ASC") => SortOrder::Asc,
        _ => SortOrder::Desc,
    }
}

fn paginate<T>(
    data: Vec<T>,
    page: u32,
    limit: u32,
    total: u64,
    sort: &str,
    order: SortOrder,
) -> Paginated<T> {
    let total_pages = (total.div_ceil(limit as u64)).max(1);
    Paginated {
        data,
        meta: PageMeta {
            page,
            limit,
            total,
            total_pages,
            sort: sort.to_string(),
            order,
        },
    }
}

fn bad_column<E: std::error::Error + Send + Sync + 'static>(
    idx: usize,
    err: E,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn parse_status(idx: usize, raw: &str) -> rusqlite::Result<LeadStatus> {
    LeadStatus::from_str(raw).map_err(|e| bad_column(idx, std::io::Error::other(e)))
}

fn parse_kind(idx: usize, raw: &str) -> rusqlite::Result<ActivityType> {
    ActivityType::from_str(raw).map_err(|e| bad_column(idx, std::io::Error::other(e)))
}

fn parse_role(idx: usize, raw: &str) -> rusqlite::Result<Role> {
    Role::from_str(raw).map_err(|e| bad_column(idx, std::io::Error::other(e)))
}

fn lead_from_row(row: &Row<'_>) -> rusqlite::Result<Lead> {
    let status_s: String = row.get(5)?;
    Ok(Lead {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        notes: row.get(4)?,
        status: parse_status(5, &status_s)?,
        owner_id: row.get(6)?,
        converted_at: row.get(7)?,
        customer_id: row.get(8)?,
        created: row.get(9)?,
        updated: row.get(10)?,
        deleted: row.get(11)?,
    })
}

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        company: row.get(4)?,
        owner_id: row.get(5)?,
        created: row.get(6)?,
        updated: row.get(7)?,
        deleted: row.get(8)?,
    })
}

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    let kind_s: String = row.get(1)?;
    Ok(Activity {
        id: row.get(0)?,
        kind: parse_kind(1, &kind_s)?,
        note: row.get(2)?,
        when_at: row.get(3)?,
        owner_id: row.get(4)?,
        lead_id: row.get(5)?,
        customer_id: row.get(6)?,
        created: row.get(7)?,
        updated: row.get(8)?,
        deleted: row.get(9)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let role_s: String = row.get(2)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        role: parse_role(2, &role_s)?,
        created: row.get(3)?,
        updated: row.get(4)?,
        deleted: row.get(5)?,
    })
}

fn get_lead_in(conn: &Connection, id: i64, include_deleted: bool) -> Result<Option<Lead>> {
    let sql = if include_deleted {
        "SELECT id,name,email,phone,notes,status,owner_id,converted_at,customer_id,created,updated,deleted \
         FROM leads WHERE id=? LIMIT 1"
    } else {
        "SELECT id,name,email,phone,notes,status,owner_id,converted_at,customer_id,created,updated,deleted \
         FROM leads WHERE id=? AND deleted IS NULL LIMIT 1"
    };
    let mut stmt = conn.prepare(sql)?;
    Ok(stmt.query_row([id], lead_from_row).optional()?)
}

fn get_customer_in(conn: &Connection, id: i64, include_deleted: bool) -> Result<Option<Customer>> {
    let sql = if include_deleted {
        "SELECT id,name,email,phone,company,owner_id,created,updated,deleted \
         FROM customers WHERE id=? LIMIT 1"
    } else {
        "SELECT id,name,email,phone,company,owner_id,created,updated,deleted \
         FROM customers WHERE id=? AND deleted IS NULL LIMIT 1"
    };
    let mut stmt = conn.prepare(sql)?;
    Ok(stmt.query_row([id], customer_from_row).optional()?)
}

fn get_activity_in(conn: &Connection, id: i64, include_deleted: bool) -> Result<Option<Activity>> {
    let sql = if include_deleted {
        "SELECT id,kind,note,when_at,owner_id,lead_id,customer_id,created,updated,deleted \
         FROM activities WHERE id=? LIMIT 1"
    } else {
        "SELECT id,kind,note,when_at,owner_id,lead_id,customer_id,created,updated,deleted \
         FROM activities WHERE id=? AND deleted IS NULL LIMIT 1"
    };
    let mut stmt = conn.prepare(sql)?;
    Ok(stmt.query_row([id], activity_from_row).optional()?)
}

fn get_user_in(conn: &Connection, id: i64) -> Result<Option<User>> {
    let mut stmt = conn.prepare(
        "SELECT id,email,role,created,updated,deleted FROM users WHERE id=? AND deleted IS NULL LIMIT 1",
    )?;
    Ok(stmt.query_row([id], user_from_row).optional()?)
}

fn insert_activity_in(conn: &Connection, new: &NewActivity) -> Result<Activity> {
    let ts = now();
    // Logical event time defaults to the moment of the call.
    let when_at = new.when_at.clone().unwrap_or_else(|| ts.clone());
    conn.execute(
        "INSERT INTO activities(kind,note,when_at,owner_id,lead_id,customer_id,created,updated) VALUES(?,?,?,?,?,?,?,?)",
        params![
            new.kind.as_str(),
            new.note,
            when_at,
            new.owner_id,
            new.lead_id,
            new.customer_id,
            ts,
            ts
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_activity_in(conn, id, false)?
        .ok_or_else(|| anyhow::anyhow!("activity #{id} vanished after insert"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempdir().expect("tempdir");
        let kernel = Kernel::open(dir.path()).expect("open kernel");
        (dir, kernel)
    }

    fn new_lead(owner: i64) -> NewLead {
        NewLead {
            name: "Acme".into(),
            email: Some("contact@acme.test".into()),
            phone: None,
            notes: None,
            owner_id: owner,
        }
    }

    fn lifecycle_activity(kind: ActivityType, lead_id: i64) -> NewActivity {
        NewActivity {
            kind,
            note: Some("note".into()),
            when_at: None,
            owner_id: 7,
            lead_id: Some(lead_id),
            customer_id: None,
        }
    }

    #[test]
    fn insert_and_get_lead() {
        let (_dir, k) = kernel();
        let lead = k.insert_lead(&new_lead(7)).unwrap();
        assert_eq!(lead.status, LeadStatus::New);
        assert_eq!(lead.owner_id, 7);
        let again = k.get_lead(lead.id, false).unwrap().unwrap();
        assert_eq!(again.name, "Acme");
    }

    #[test]
    fn soft_delete_hides_and_restore_revives() {
        let (_dir, k) = kernel();
        let lead = k.insert_lead(&new_lead(7)).unwrap();
        assert!(k.soft_delete_lead(lead.id).unwrap());
        assert!(k.get_lead(lead.id, false).unwrap().is_none());
        let hidden = k.get_lead(lead.id, true).unwrap().unwrap();
        assert!(hidden.deleted.is_some());
        assert!(k.restore_lead(lead.id).unwrap());
        assert!(k.get_lead(lead.id, false).unwrap().is_some());
        // restoring a live row is a no-op
        assert!(!k.restore_lead(lead.id).unwrap());
    }

    #[test]
    fn status_change_is_guarded_against_stale_reads() {
        let (_dir, k) = kernel();
        let lead = k.insert_lead(&new_lead(7)).unwrap();
        let ok = k
            .persist_status_change(
                lead.id,
                LeadStatus::New,
                LeadStatus::Contacted,
                &lifecycle_activity(ActivityType::StatusChanged, lead.id),
            )
            .unwrap();
        assert!(ok.is_some());
        // Same precondition again: the row is no longer `new`.
        let stale = k
            .persist_status_change(
                lead.id,
                LeadStatus::New,
                LeadStatus::Qualified,
                &lifecycle_activity(ActivityType::StatusChanged, lead.id),
            )
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(
            k.count_activities_for_lead(lead.id, ActivityType::StatusChanged)
                .unwrap(),
            1
        );
    }

    #[test]
    fn conversion_guard_rolls_back_customer_insert() {
        let (_dir, k) = kernel();
        let lead = k.insert_lead(&new_lead(7)).unwrap();
        k.persist_lost(lead.id, &lifecycle_activity(ActivityType::Lost, lead.id))
            .unwrap()
            .expect("mark lost");
        let res = k
            .persist_conversion(
                lead.id,
                &NewCustomer {
                    name: "Acme".into(),
                    email: None,
                    phone: None,
                    company: None,
                    owner_id: 7,
                },
                |cid| NewActivity {
                    kind: ActivityType::Converted,
                    note: None,
                    when_at: None,
                    owner_id: 7,
                    lead_id: Some(lead.id),
                    customer_id: Some(cid),
                },
            )
            .unwrap();
        assert!(res.is_none());
        // The speculative customer insert must not survive the rollback.
        assert_eq!(
            k.list_customers(&ListQuery::default()).unwrap().meta.total,
            0
        );
    }

    #[test]
    fn conversion_sets_won_and_links_customer() {
        let (_dir, k) = kernel();
        let lead = k.insert_lead(&new_lead(7)).unwrap();
        let (lead, customer, activity) = k
            .persist_conversion(
                lead.id,
                &NewCustomer {
                    name: lead.name.clone(),
                    email: lead.email.clone(),
                    phone: None,
                    company: None,
                    owner_id: lead.owner_id,
                },
                |cid| NewActivity {
                    kind: ActivityType::Converted,
                    note: Some(format!("Converted lead #{} to customer #{cid}", lead.id)),
                    when_at: None,
                    owner_id: 7,
                    lead_id: Some(lead.id),
                    customer_id: Some(cid),
                },
            )
            .unwrap()
            .expect("conversion persists");
        assert_eq!(lead.status, LeadStatus::Won);
        assert_eq!(lead.customer_id, Some(customer.id));
        assert!(lead.converted_at.is_some());
        assert_eq!(customer.owner_id, 7);
        assert_eq!(activity.kind, ActivityType::Converted);
        assert_eq!(activity.customer_id, Some(customer.id));
    }

    #[test]
    fn list_leads_sort_whitelist_falls_back_silently() {
        let (_dir, k) = kernel();
        k.insert_lead(&new_lead(7)).unwrap();
        let page = k
            .list_leads(&ListQuery {
                sort: Some("ownerId; DROP TABLE leads".into()),
                order: Some("sideways".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.meta.sort, "created");
        assert_eq!(page.meta.order, SortOrder::Desc);
        assert_eq!(page.meta.total, 1);
    }

    #[test]
    fn activity_listing_filters_by_target_and_kind() {
        let (_dir, k) = kernel();
        let lead = k.insert_lead(&new_lead(7)).unwrap();
        k.append_activity(&NewActivity {
            kind: ActivityType::Call,
            note: Some("intro call".into()),
            when_at: None,
            owner_id: 7,
            lead_id: Some(lead.id),
            customer_id: None,
        })
        .unwrap();
        let customer = k
            .insert_customer(&NewCustomer {
                name: "Other".into(),
                email: None,
                phone: None,
                company: None,
                owner_id: 7,
            })
            .unwrap();
        k.append_activity(&NewActivity {
            kind: ActivityType::Note,
            note: Some("customer note".into()),
            when_at: None,
            owner_id: 7,
            lead_id: None,
            customer_id: Some(customer.id),
        })
        .unwrap();

        let by_lead = k
            .list_activities(&ActivityListQuery {
                lead_id: Some(lead.id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_lead.meta.total, 1);
        assert_eq!(by_lead.data[0].kind, ActivityType::Call);

        let by_kind = k
            .list_activities(&ActivityListQuery {
                kind: Some(ActivityType::Note),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_kind.meta.total, 1);
        assert_eq!(by_kind.data[0].customer_id, Some(customer.id));

        let by_q = k
            .list_activities(&ActivityListQuery {
                q: Some("intro".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_q.meta.total, 1);

        let sorted = k
            .list_activities(&ActivityListQuery {
                sort: Some("weird".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(sorted.meta.sort, "created");
    }

    #[test]
    fn users_roundtrip_and_role_update() {
        let (_dir, k) = kernel();
        let user = k
            .insert_user(&NewUser {
                email: "ops@example.com".into(),
                role: Role::User,
                token_sha256: Some("ab".repeat(32)),
            })
            .unwrap();
        let found = k.find_user_by_token(&"ab".repeat(32)).unwrap().unwrap();
        assert_eq!(found.id, user.id);
        let promoted = k.set_user_role(user.id, Role::Admin).unwrap().unwrap();
        assert_eq!(promoted.role, Role::Admin);
        assert!(k.set_user_role(9999, Role::Admin).unwrap().is_none());
    }
}
