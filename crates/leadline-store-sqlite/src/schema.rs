//! SQL schema for the Leadline SQLite store.
//!
//! Executed at connection startup. The lead aggregate has two physical
//! shapes: the legacy one spreads notes and tags over [`LEGACY_SCHEMA`]
//! tables, the consolidated one keeps them as JSON columns on `leads`.
//! `shape_flags` records which shapes exist and which one readers trust; the
//! `consolidate-lead-shape` migration moves a database from one to the other.

/// Core DDL; idempotent thanks to `IF NOT EXISTS` / `OR IGNORE`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS business_owners (
    owner_id      TEXT PRIMARY KEY,
    company_id    TEXT NOT NULL,
    name          TEXT,
    email         TEXT,
    email_key     TEXT,            -- lower(trim(email))
    phone         TEXT,
    phone_key     TEXT,            -- digits only, US prefix dropped
    auth_provider TEXT NOT NULL,
    last_login    TEXT,
    created_at    TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS owners_email_key_idx
    ON business_owners(company_id, email_key) WHERE email_key IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS owners_phone_key_idx
    ON business_owners(company_id, phone_key) WHERE phone_key IS NOT NULL;

-- The lead aggregate. Derived from `events`; rebuilt by replay.
CREATE TABLE IF NOT EXISTS leads (
    lead_id           TEXT PRIMARY KEY,
    company_id        TEXT NOT NULL,
    stage             TEXT NOT NULL DEFAULT 'new',
    business_owner_id TEXT REFERENCES business_owners(owner_id),
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    journal_seq       INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS leads_company_idx ON leads(company_id, created_at);
CREATE INDEX IF NOT EXISTS leads_stage_idx   ON leads(stage);

-- The journal. Strictly append-only: no UPDATE or DELETE is ever issued.
CREATE TABLE IF NOT EXISTS events (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id     TEXT NOT NULL UNIQUE,
    lead_id      TEXT NOT NULL REFERENCES leads(lead_id),
    source_id    TEXT NOT NULL UNIQUE,   -- idempotency key
    source       TEXT NOT NULL,
    kind         TEXT NOT NULL,          -- EventKind discriminant
    payload_json TEXT NOT NULL,          -- inner payload only
    occurred_at  TEXT NOT NULL,
    recorded_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS events_lead_idx ON events(lead_id, seq);

CREATE TABLE IF NOT EXISTS dead_letters (
    dead_letter_id  TEXT PRIMARY KEY,
    lead_id         TEXT,
    source_id       TEXT,
    code            TEXT NOT NULL,
    detail          TEXT NOT NULL,
    raw_json        TEXT NOT NULL,
    payload_digest  TEXT NOT NULL,   -- sha256 of raw_json
    recorded_at     TEXT NOT NULL,
    acknowledged_at TEXT,
    acknowledged_by TEXT,
    UNIQUE (source_id, code, payload_digest)
);

-- Stage changes awaiting webhook delivery. Written in the same transaction
-- as the journal entry; `delivered_at` is set once the receiver accepts it.
CREATE TABLE IF NOT EXISTS stage_outbox (
    event_id     TEXT PRIMARY KEY REFERENCES events(event_id),
    lead_id      TEXT NOT NULL,
    from_stage   TEXT NOT NULL,
    to_stage     TEXT NOT NULL,
    occurred_at  TEXT NOT NULL,
    attempts     INTEGER NOT NULL DEFAULT 0,
    last_error   TEXT,
    delivered_at TEXT
);

CREATE INDEX IF NOT EXISTS stage_outbox_pending_idx
    ON stage_outbox(lead_id) WHERE delivered_at IS NULL;

CREATE TABLE IF NOT EXISTS shape_flags (
    name    TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL
);

INSERT OR IGNORE INTO shape_flags (name, enabled) VALUES
    ('legacy_present',    1),
    ('dual_write',        0),
    ('read_consolidated', 0);

CREATE TABLE IF NOT EXISTS migrations (
    migration_id   TEXT PRIMARY KEY,
    record_json    TEXT NOT NULL,
    cutover_errors INTEGER NOT NULL DEFAULT 0,  -- bumped by shadow reads
    updated_at     TEXT NOT NULL
);

PRAGMA user_version = 1;
";

/// The scattered aggregate shape. Created only while `legacy_present` is on.
pub const LEGACY_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS lead_notes (
    note_id    TEXT PRIMARY KEY,
    lead_id    TEXT NOT NULL REFERENCES leads(lead_id),
    position   INTEGER NOT NULL,
    content    TEXT NOT NULL,
    author     TEXT NOT NULL,
    is_private INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS lead_notes_lead_idx ON lead_notes(lead_id, position);

CREATE TABLE IF NOT EXISTS lead_tags (
    lead_id           TEXT NOT NULL REFERENCES leads(lead_id),
    tag_type          TEXT NOT NULL,
    value             TEXT NOT NULL,
    is_auto_generated INTEGER NOT NULL,
    granted_at        TEXT NOT NULL,
    granted_by        TEXT NOT NULL,
    rule_version      INTEGER,
    PRIMARY KEY (lead_id, tag_type)
);
";
