//! Table definitions of the job store.

use rusqlite::Connection;

/// Current schema version, stored in `PRAGMA user_version`.
pub const VERSION: i64 = 1;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS jobs (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    correlation_id          TEXT NOT NULL,
    user                    TEXT NOT NULL,
    inbox_path              TEXT NOT NULL,
    status                  TEXT NOT NULL,
    encrypted_checksum      TEXT,
    encrypted_checksum_type TEXT,
    decrypted_checksum      TEXT,
    decrypted_md5           TEXT,
    header                  TEXT,
    archive_path            TEXT,
    backup_path             TEXT,
    archive_size            INTEGER,
    archive_checksum        TEXT,
    accession_id            TEXT UNIQUE,
    dataset_id              TEXT,
    created_at              TEXT NOT NULL,
    updated_at              TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS jobs_submission ON jobs (user, inbox_path, encrypted_checksum);

CREATE TABLE IF NOT EXISTS session_key_checksums (
    fingerprint TEXT PRIMARY KEY,
    job_id      INTEGER NOT NULL REFERENCES jobs (id),
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS errors (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id      INTEGER NOT NULL REFERENCES jobs (id),
    hostname    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    message     TEXT NOT NULL,
    from_user   INTEGER NOT NULL,
    occurred_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS status_history (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id     INTEGER NOT NULL REFERENCES jobs (id),
    status     TEXT NOT NULL,
    changed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS datasets (
    id         TEXT PRIMARY KEY,
    state      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dataset_permissions (
    dataset_id TEXT NOT NULL REFERENCES datasets (id),
    user       TEXT NOT NULL,
    granted_at TEXT NOT NULL,
    PRIMARY KEY (dataset_id, user)
);
";

/// Creates the tables when they are missing.
///
/// # Errors
///
/// Returns the database error when a statement fails.
pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    conn.pragma_update(None, "user_version", VERSION)
}
